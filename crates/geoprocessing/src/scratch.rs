use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::{Result, io::GeoBackend};

/// Temporary rasters that only live for the duration of a single operation.
///
/// The rasters are created in a temporary directory and deleted through the backend when the scratch space is dropped,
/// also when the operation fails.
pub struct ScratchSpace<'a> {
    backend: &'a dyn GeoBackend,
    dir: TempDir,
    rasters: Vec<PathBuf>,
}

impl<'a> ScratchSpace<'a> {
    pub fn new(backend: &'a dyn GeoBackend, prefix: &str) -> Result<Self> {
        Ok(ScratchSpace {
            backend,
            dir: tempfile::Builder::new().prefix(prefix).tempdir()?,
            rasters: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Path for a temporary raster that is deleted together with the scratch space.
    pub fn raster_path(&mut self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        self.rasters.push(path.clone());
        path
    }
}

impl Drop for ScratchSpace<'_> {
    fn drop(&mut self) {
        for path in &self.rasters {
            if !self.backend.exists(path) {
                continue;
            }

            if let Err(e) = self.backend.delete_raster(path) {
                log::warn!("Failed to remove temporary raster {}: {e}", path.to_string_lossy());
            }
        }
    }
}
