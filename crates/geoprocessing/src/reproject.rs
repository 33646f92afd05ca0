//! Reprojection of vector layers.

use std::path::Path;

use geo::MapCoords;
use geo_types::Coord;

use crate::{
    Result,
    io::GeoBackend,
    vector::{Feature, VectorDataset, VectorLayer},
};

/// Transforms the features of a layer of the base vector to the target projection and writes them to `target`.
///
/// The output contains a single layer with the name and fields of the base layer.
/// Features that cannot be transformed are left out of the output, an existing target is overwritten.
/// Returns the number of features that could not be transformed.
pub fn reproject_vector(
    backend: &dyn GeoBackend,
    base: &Path,
    target_projection: &str,
    target: &Path,
    layer: Option<&str>,
) -> Result<usize> {
    let dataset = backend.open_vector(base)?;
    let base_layer = dataset.layer_or_first(layer)?;

    if backend.exists(target) {
        log::warn!("{} already exists, removing and overwriting", target.to_string_lossy());
    }

    let transform = backend.coordinate_transformer(&base_layer.projection, target_projection)?;

    let mut target_layer = VectorLayer::new(base_layer.name.clone(), target_projection);
    target_layer.fields = base_layer.fields.clone();

    let mut error_count = 0;
    for feature in &base_layer.features {
        let geometry = match &feature.geometry {
            Some(geometry) => {
                let transformed = geometry.try_map_coords(|c| {
                    let (x, y) = transform.transform_point(c.x, c.y)?;
                    Ok::<_, crate::Error>(Coord { x, y })
                });

                match transformed {
                    Ok(geometry) => Some(geometry),
                    Err(e) => {
                        log::debug!("Failed to transform feature {}: {e}", feature.fid);
                        error_count += 1;
                        continue;
                    }
                }
            }
            None => None,
        };

        target_layer.features.push(Feature {
            fid: feature.fid,
            geometry,
            fields: feature.fields.clone(),
        });
    }

    if error_count > 0 {
        log::warn!(
            "{error_count} features out of {} were unable to be transformed and are not in the output vector at {}",
            base_layer.features.len(),
            target.to_string_lossy()
        );
    }

    backend.write_vector(target, &VectorDataset::with_layer(target_layer))?;
    Ok(error_count)
}
