//! Partitioning of polygons into groups of polygons that do not intersect each other.
//!
//! Finding the minimal number of groups is NP-hard, the greedy approach builds maximal
//! independent sets in rounds, visiting the polygons with the fewest remaining intersections first.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::path::Path;

use geo::{BoundingRect, Intersects};

use crate::{BoundingBox, Result, io::GeoBackend, vector::Feature};

/// Feature ids of every feature that intersects the key feature, the feature itself excluded.
fn intersection_lookup(features: &[Feature]) -> BTreeMap<u64, BTreeSet<u64>> {
    let envelopes: Vec<Option<BoundingBox>> = features
        .iter()
        .map(|f| f.geometry.as_ref().and_then(|g| g.bounding_rect()).map(BoundingBox::from))
        .collect();

    let mut lookup: BTreeMap<u64, BTreeSet<u64>> = features.iter().map(|f| (f.fid, BTreeSet::new())).collect();

    for (i, feature) in features.iter().enumerate() {
        let (Some(geometry), Some(envelope)) = (&feature.geometry, &envelopes[i]) else {
            continue;
        };

        for (j, other) in features.iter().enumerate().skip(i + 1) {
            let (Some(other_geometry), Some(other_envelope)) = (&other.geometry, &envelopes[j]) else {
                continue;
            };

            if feature.fid != other.fid && envelope.intersects(other_envelope) && geometry.intersects(other_geometry) {
                lookup.entry(feature.fid).or_default().insert(other.fid);
                lookup.entry(other.fid).or_default().insert(feature.fid);
            }
        }
    }

    lookup
}

/// Groups the features in sets of pairwise non intersecting features.
///
/// Every feature id ends up in exactly one set, the result is deterministic for a given input.
pub fn disjoint_polygon_sets(features: &[Feature]) -> Vec<BTreeSet<u64>> {
    let mut lookup = intersection_lookup(features);
    let mut subsets = Vec::new();

    while !lookup.is_empty() {
        // fewest intersections first, the feature id breaks ties
        let mut heap: BinaryHeap<Reverse<(usize, u64)>> =
            lookup.iter().map(|(fid, intersects)| Reverse((intersects.len(), *fid))).collect();

        let mut maximal_set = BTreeSet::new();
        while let Some(Reverse((_, fid))) = heap.pop() {
            let intersects_accepted = lookup
                .get(&fid)
                .is_some_and(|intersects| maximal_set.iter().any(|accepted| intersects.contains(accepted)));

            if !intersects_accepted {
                maximal_set.insert(fid);
            }
        }

        for fid in &maximal_set {
            lookup.remove(fid);
        }

        for intersects in lookup.values_mut() {
            intersects.retain(|fid| !maximal_set.contains(fid));
        }

        log::debug!("Disjoint polygon set {} contains {} polygons", subsets.len(), maximal_set.len());
        subsets.push(maximal_set);
    }

    subsets
}

/// Disjoint polygon sets of the features of a vector layer (the first layer when no name is given).
pub fn calculate_disjoint_polygon_set(backend: &dyn GeoBackend, vector: &Path, layer: Option<&str>) -> Result<Vec<BTreeSet<u64>>> {
    let dataset = backend.open_vector(vector)?;
    Ok(disjoint_polygon_sets(&dataset.layer_or_first(layer)?.features))
}
