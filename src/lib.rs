#![cfg_attr(docsrs, feature(doc_cfg))]

#[doc(inline)]
pub use geoprocessing::*;

pub use inf;
