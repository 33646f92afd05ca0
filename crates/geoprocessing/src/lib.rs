#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(clippy::unwrap_used)]

//! Out of core processing of geospatial rasters.
//!
//! Rasters are processed block by block so their size is not limited by the available memory.
//! All raster and vector access goes through a [`io::GeoBackend`], the [`io::MemoryBackend`] keeps
//! everything in memory while the GDAL backend (`gdal` feature) works on files.

pub type Result<T = ()> = std::result::Result<T, Error>;

pub mod align;
pub mod blocks;
mod boundingbox;
pub mod calculator;
pub mod convolve;
pub mod create;
mod datatype;
pub mod disjoint;
mod error;
pub mod fft;
mod geotransform;
pub mod io;
pub mod metadata;
pub mod nodata;
pub mod pipeline;
pub mod priority;
mod rastersize;
pub mod reclassify;
pub mod reproject;
pub mod runtimeconfiguration;
pub mod scratch;
pub mod statistics;
pub mod vector;
pub mod warp;
pub mod zonal;

#[cfg(test)]
mod testutils;

#[doc(inline)]
pub use align::{AlignOptions, BoundingBoxMode, align_and_resize_raster_stack};
#[doc(inline)]
pub use blocks::{BlockWindow, block_offsets, iterblocks};
#[doc(inline)]
pub use boundingbox::{BoundingBox, DEFAULT_EDGE_SAMPLES, MergeMode, transform_bounding_box};
#[doc(inline)]
pub use calculator::{CalcInput, CalculatorOptions, OpArg, raster_calculator};
#[doc(inline)]
pub use convolve::{ConvolveOptions, convolve_2d};
#[doc(inline)]
pub use datatype::RasterDataType;
#[doc(inline)]
pub use disjoint::calculate_disjoint_polygon_set;
#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use geotransform::GeoTransform;
#[doc(inline)]
pub use rastersize::RasterSize;
#[doc(inline)]
pub use reclassify::{ReclassifyOptions, ValueMap, reclassify_raster};
#[doc(inline)]
pub use reproject::reproject_vector;
#[doc(inline)]
pub use runtimeconfiguration::RuntimeConfiguration;
#[doc(inline)]
pub use statistics::{BandStatistics, RasterStatistics, calculate_raster_stats};
#[doc(inline)]
pub use vector::VectorDataset;
#[doc(inline)]
pub use zonal::{ZonalOptions, ZonalStats, zonal_statistics};
