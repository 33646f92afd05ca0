use geo::{BoundingRect, Intersects};
use geo_types::{Point, Rect, coord};
use ndarray::Array2;

use crate::{GeoTransform, Result, io::BurnShape};

/// Burns the shapes into the raster data, later shapes overwrite earlier ones.
///
/// A pixel is burned when its center intersects the geometry.
/// With `all_touched` every pixel that touches the geometry is burned.
pub fn burn_shapes(
    data: &mut Array2<f64>,
    geotransform: &GeoTransform,
    shapes: &[BurnShape],
    all_touched: bool,
    convert: impl Fn(f64) -> f64,
) -> Result<()> {
    let inverse = geotransform.invert()?;
    let (rows, cols) = data.dim();

    for shape in shapes {
        let Some(bounds) = shape.geometry.bounding_rect() else {
            continue;
        };

        let corners = [
            inverse.apply(bounds.min().x, bounds.min().y),
            inverse.apply(bounds.max().x, bounds.min().y),
            inverse.apply(bounds.min().x, bounds.max().y),
            inverse.apply(bounds.max().x, bounds.max().y),
        ];

        let col_start = corners.iter().map(|c| c.x).fold(f64::INFINITY, f64::min).floor().max(0.0) as usize;
        let col_end = (corners.iter().map(|c| c.x).fold(f64::NEG_INFINITY, f64::max).ceil().max(0.0) as usize).min(cols);
        let row_start = corners.iter().map(|c| c.y).fold(f64::INFINITY, f64::min).floor().max(0.0) as usize;
        let row_end = (corners.iter().map(|c| c.y).fold(f64::NEG_INFINITY, f64::max).ceil().max(0.0) as usize).min(rows);

        let value = convert(shape.value);
        for row in row_start..row_end {
            for col in col_start..col_end {
                let hit = if all_touched {
                    let top_left = geotransform.apply(col as f64, row as f64);
                    let bottom_right = geotransform.apply(col as f64 + 1.0, row as f64 + 1.0);
                    let cell = Rect::new(
                        coord! { x: top_left.x, y: top_left.y },
                        coord! { x: bottom_right.x, y: bottom_right.y },
                    );
                    shape.geometry.intersects(&cell.to_polygon())
                } else {
                    let center = geotransform.apply(col as f64 + 0.5, row as f64 + 0.5);
                    shape.geometry.intersects(&Point::from(center))
                };

                if hit {
                    data[(row, col)] = value;
                }
            }
        }
    }

    Ok(())
}
