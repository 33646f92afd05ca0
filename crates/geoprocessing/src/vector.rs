//! In memory representation of vector layers as exchanged with the I/O backends.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use geo::BoundingRect;
use geo_types::Geometry;

use crate::{BoundingBox, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldType {
    Integer,
    Real,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldDefinition {
            name: name.into(),
            field_type,
        }
    }
}

/// Attribute value of a feature.
///
/// Implements a total order (reals are compared with `f64::total_cmp`), so values can be used as map keys.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldValue {
    Integer(i64),
    Real(f64),
    String(String),
}

impl FieldValue {
    fn type_rank(&self) -> u8 {
        match self {
            FieldValue::Integer(_) => 0,
            FieldValue::Real(_) => 1,
            FieldValue::String(_) => 2,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Real(v) => Some(*v),
            FieldValue::String(s) => s.trim().parse().ok(),
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FieldValue {}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a.cmp(b),
            (FieldValue::Real(a), FieldValue::Real(b)) => a.total_cmp(b),
            (FieldValue::String(a), FieldValue::String(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            FieldValue::Integer(v) => v.hash(state),
            FieldValue::Real(v) => v.to_bits().hash(state),
            FieldValue::String(v) => v.hash(state),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Real(v) => write!(f, "{v}"),
            FieldValue::String(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Real(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub fid: u64,
    pub geometry: Option<Geometry<f64>>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Feature {
    pub fn new(fid: u64, geometry: impl Into<Geometry<f64>>) -> Self {
        Feature {
            fid,
            geometry: Some(geometry.into()),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VectorLayer {
    pub name: String,
    /// Projection as well known text, empty when unknown
    pub projection: String,
    pub fields: Vec<FieldDefinition>,
    pub features: Vec<Feature>,
}

impl VectorLayer {
    pub fn new(name: impl Into<String>, projection: impl Into<String>) -> Self {
        VectorLayer {
            name: name.into(),
            projection: projection.into(),
            ..Default::default()
        }
    }

    pub fn field_definition(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn feature(&self, fid: u64) -> Option<&Feature> {
        self.features.iter().find(|f| f.fid == fid)
    }

    /// The envelope of all feature geometries, `None` when the layer has no geometries.
    pub fn extent(&self) -> Option<BoundingBox> {
        let boxes: Vec<BoundingBox> = self
            .features
            .iter()
            .filter_map(|f| f.geometry.as_ref())
            .filter_map(|g| g.bounding_rect())
            .map(BoundingBox::from)
            .collect();

        BoundingBox::merge_all(&boxes, crate::boundingbox::MergeMode::Union)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VectorDataset {
    pub layers: Vec<VectorLayer>,
}

impl VectorDataset {
    pub fn with_layer(layer: VectorLayer) -> Self {
        VectorDataset { layers: vec![layer] }
    }

    pub fn layer(&self, index: usize) -> Result<&VectorLayer> {
        self.layers
            .get(index)
            .ok_or_else(|| Error::InvalidArgument(format!("Vector layer index {index} out of range ({} layers)", self.layers.len())))
    }

    pub fn layer_by_name(&self, name: &str) -> Result<&VectorLayer> {
        self.layers
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| Error::InvalidArgument(format!("Vector layer '{name}' does not exist")))
    }

    /// The named layer or the first layer when no name is provided.
    pub fn layer_or_first(&self, name: Option<&str>) -> Result<&VectorLayer> {
        match name {
            Some(name) => self.layer_by_name(name),
            None => self.layer(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use geo_types::{Rect, coord};

    use super::*;

    #[test]
    fn field_value_ordering() {
        assert!(FieldValue::Integer(1) < FieldValue::Integer(2));
        assert!(FieldValue::Integer(100) < FieldValue::Real(-1.0));
        assert!(FieldValue::Real(-0.5) < FieldValue::Real(0.5));
        assert_eq!(FieldValue::Real(f64::NAN), FieldValue::Real(f64::NAN));
        assert!(FieldValue::Real(1.0) < FieldValue::from("a"));
    }

    #[test]
    fn layer_extent() {
        let mut layer = VectorLayer::new("zones", "");
        assert_eq!(layer.extent(), None);

        layer.features.push(Feature::new(
            0,
            Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 2.0, y: 1.0 }).to_polygon(),
        ));
        layer.features.push(Feature::new(
            1,
            Rect::new(coord! { x: -1.0, y: 0.5 }, coord! { x: 1.0, y: 3.0 }).to_polygon(),
        ));

        assert_eq!(layer.extent(), Some(BoundingBox::new(-1.0, 0.0, 2.0, 3.0)));
    }

    #[test]
    fn layer_lookup() {
        let ds = VectorDataset::with_layer(VectorLayer::new("zones", ""));
        assert!(ds.layer_or_first(None).is_ok());
        assert!(ds.layer_or_first(Some("zones")).is_ok());
        assert!(ds.layer_or_first(Some("other")).is_err());
        assert!(ds.layer(1).is_err());
    }
}
