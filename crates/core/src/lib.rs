//! Tiled super-resolution: model discovery, ONNX inference, tensor conversion
//! and seam-free stitching of overlapping tiles.

pub mod backend;
pub mod config;
pub mod convert;
pub mod error;
pub mod fallback;
pub mod geometry;
pub mod logging;
pub mod model_store;
pub mod onnx;
pub mod pipeline;
pub mod runtime;
pub mod tiler;
pub mod types;
