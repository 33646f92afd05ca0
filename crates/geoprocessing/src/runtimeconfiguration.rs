use std::time::Duration;

use bon::bon;

use crate::{
    Result,
    blocks::LARGEST_BLOCK,
    io::CreationOptions,
    pipeline::{DEFAULT_JOIN_TIMEOUT, DEFAULT_QUEUE_SIZE},
};

/// GeoTIFF creation options used for every raster created by the processing functions.
pub fn default_creation_options() -> CreationOptions {
    vec!["TILED=YES".to_string(), "BIGTIFF=IF_SAFER".to_string()]
}

/// Process wide settings of the raster processing.
#[derive(Debug, Clone)]
pub struct RuntimeConfiguration {
    pub creation_options: CreationOptions,
    /// Cell budget of a processing block
    pub largest_block: usize,
    /// Queue size between the pipeline stages
    pub queue_size: usize,
    /// Number of parallel workers, `None` lets every operation pick a default based on the available cores
    pub worker_count: Option<usize>,
    /// Maximum time to wait for a worker thread
    pub join_timeout: Duration,
    #[cfg(feature = "gdal")]
    gdal_config: inf::gdalinterop::Config,
}

#[bon]
impl RuntimeConfiguration {
    #[builder]
    pub fn new(
        creation_options: Option<CreationOptions>,
        largest_block: Option<usize>,
        queue_size: Option<usize>,
        worker_count: Option<usize>,
        join_timeout: Option<Duration>,
        proj_db: Option<&std::path::Path>,
        gdal_debug_log: Option<bool>,
        gdal_cache_size: Option<usize>,
    ) -> Self {
        #[cfg(not(feature = "gdal"))]
        let _ = (proj_db, gdal_debug_log, gdal_cache_size);

        Self {
            creation_options: creation_options.unwrap_or_else(default_creation_options),
            largest_block: largest_block.unwrap_or(LARGEST_BLOCK).max(1),
            queue_size: queue_size.unwrap_or(DEFAULT_QUEUE_SIZE).max(1),
            worker_count: worker_count.map(|n| n.max(1)),
            join_timeout: join_timeout.unwrap_or(DEFAULT_JOIN_TIMEOUT),
            #[cfg(feature = "gdal")]
            gdal_config: inf::gdalinterop::Config {
                debug_logging: gdal_debug_log.unwrap_or(false),
                proj_db_search_location: proj_db.map(|p| p.to_path_buf()),
                cache_size: gdal_cache_size,
            },
        }
    }

    /// Applies the process wide library settings, only relevant for the gdal backend.
    pub fn apply(&self) -> Result<()> {
        #[cfg(feature = "gdal")]
        self.gdal_config.apply()?;

        log::debug!(
            "Raster processing: blocks of at most {} cells, queue size {}, creation options [{}]",
            self.largest_block,
            self.queue_size,
            self.creation_options.join(", ")
        );
        Ok(())
    }
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        RuntimeConfiguration::builder().build()
    }
}
