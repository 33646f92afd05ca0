use std::fmt;

use crate::{Result, io::CoordinateTransform};

/// Number of points sampled on each edge when reprojecting a bounding box.
pub const DEFAULT_EDGE_SAMPLES: usize = 11;

/// Axis aligned rectangle [minx, miny, maxx, maxy] in projected coordinates.
/// Boxes resulting from an intersection can be invalid (min > max), use `is_valid` to check.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// How a list of bounding boxes is reduced to a single box.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MergeMode {
    Union,
    Intersection,
}

impl BoundingBox {
    pub const fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox { min_x, min_y, max_x, max_y }
    }

    pub fn from_array(bb: [f64; 4]) -> Self {
        Self::new(bb[0], bb[1], bb[2], bb[3])
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// A box is valid when its minimum does not exceed its maximum on both axes.
    /// Degenerate boxes with zero width or height are valid.
    pub fn is_valid(&self) -> bool {
        self.min_x <= self.max_x && self.min_y <= self.max_y
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    /// The overlap of both boxes, the result is invalid when the boxes do not touch.
    pub fn intersection(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        )
    }

    pub fn merge(&self, other: &BoundingBox, mode: MergeMode) -> BoundingBox {
        match mode {
            MergeMode::Union => self.union(other),
            MergeMode::Intersection => self.intersection(other),
        }
    }

    /// Reduce all boxes to a single box, returns `None` for an empty input.
    pub fn merge_all<'a>(boxes: impl IntoIterator<Item = &'a BoundingBox>, mode: MergeMode) -> Option<BoundingBox> {
        boxes.into_iter().copied().reduce(|acc, bb| acc.merge(&bb, mode))
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.intersection(other).is_valid()
    }
}

impl From<geo_types::Rect<f64>> for BoundingBox {
    fn from(rect: geo_types::Rect<f64>) -> Self {
        BoundingBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

/// Transform a bounding box to another coordinate system.
///
/// A reprojected rectangle is generally not a rectangle anymore, so `edge_samples` points
/// are sampled along every edge of the box. The resulting box is the envelope of the
/// transformed edges: the left edge determines the minimum x, the bottom edge the minimum y, ...
pub fn transform_bounding_box(bbox: &BoundingBox, transform: &dyn CoordinateTransform, edge_samples: usize) -> Result<BoundingBox> {
    let samples = edge_samples.max(2);

    // corners numbered from the upper left, counter clockwise
    // 0--3
    // |  |
    // 1--2
    let p0 = (bbox.min_x, bbox.max_y);
    let p1 = (bbox.min_x, bbox.min_y);
    let p2 = (bbox.max_x, bbox.min_y);
    let p3 = (bbox.max_x, bbox.max_y);

    let edge = |start: (f64, f64), end: (f64, f64)| -> Result<Vec<(f64, f64)>> {
        (0..samples)
            .map(|i| {
                let t = i as f64 / (samples - 1) as f64;
                transform.transform_point(start.0 + t * (end.0 - start.0), start.1 + t * (end.1 - start.1))
            })
            .collect()
    };

    let left = edge(p0, p1)?;
    let bottom = edge(p1, p2)?;
    let right = edge(p2, p3)?;
    let top = edge(p3, p0)?;

    Ok(BoundingBox::new(
        left.iter().map(|p| p.0).fold(f64::INFINITY, f64::min),
        bottom.iter().map(|p| p.1).fold(f64::INFINITY, f64::min),
        right.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max),
        top.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max),
    ))
}
