use std::path::PathBuf;
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;

use crate::{BoundingBox, RasterSize};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid path: {0}")]
    InvalidPath(PathBuf),
    #[error("The following files were expected but do not exist: {}", join_paths(.0))]
    MissingFiles(Vec<PathBuf>),
    #[error("Band index out of range for: {}", join_bands(.0))]
    InvalidBands(Vec<(PathBuf, usize)>),
    #[error("Input rasters do not have the same dimensions, found sizes: {}", .0.iter().join(", "))]
    SizeMismatch(Vec<RasterSize>),
    #[error("Input rasters are not geospatially aligned: {0}")]
    NotAligned(String),
    #[error("Bounding box is empty: {0}")]
    EmptyIntersection(BoundingBox),
    #[error("Unknown resample method(s): {}", .0.join(", "))]
    UnknownResampleMethod(Vec<String>),
    #[error("Operation returned a block of shape {actual:?}, expected {expected:?}")]
    ShapeMismatch { expected: (usize, usize), actual: (usize, usize) },
    #[error("There was no value mapping for the values {} in {} (nodata: {nodata:?})", .values.iter().join(", "), .path.to_string_lossy())]
    UnmappedValues {
        path: PathBuf,
        values: Vec<f64>,
        nodata: Option<f64>,
    },
    #[error("Runtime error: {0}")]
    Runtime(String),
    #[error("Worker thread '{0}' did not finish within {1:?}")]
    WorkerTimeout(String, Duration),
    #[error("Worker thread '{0}' panicked")]
    WorkerPanic(String),
    #[error("{0}")]
    Inf(#[from] inf::Error),
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    GdalError(#[from] gdal::errors::GdalError),
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths.iter().map(|p| p.to_string_lossy()).join(", ")
}

fn join_bands(bands: &[(PathBuf, usize)]) -> String {
    bands
        .iter()
        .map(|(p, b)| format!("{} (band {b})", p.to_string_lossy()))
        .join(", ")
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Runtime(format!("Lock poisoned: {err}"))
    }
}
