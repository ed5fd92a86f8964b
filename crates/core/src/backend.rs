//! Inference capability and ONNX Runtime session construction.
//!
//! [`InferenceBackend`] is the one-operation contract every real model
//! implements. [`Upscaler`] is what the tiler drives: either a loaded model or
//! the model-free [`LanczosScaler`], selected at call time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::UpscaleError;
use crate::fallback::LanczosScaler;
use crate::types::Image;

/// A loaded super-resolution model.
///
/// Implementations must not mutate shared state visible to callers; the same
/// instance is reused by every request in the process.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Constant for a given loaded model.
    fn scale_factor(&self) -> u32;

    /// Single forward pass. Fails with `BackendUnavailable` or `InferenceFailed`.
    fn upscale(&self, input: &Image) -> Result<Image, UpscaleError>;
}

#[derive(Clone)]
pub enum Upscaler {
    Model(Arc<dyn InferenceBackend>),
    Fallback(LanczosScaler),
}

impl Upscaler {
    pub fn name(&self) -> &str {
        match self {
            Self::Model(backend) => backend.name(),
            Self::Fallback(_) => "lanczos",
        }
    }

    /// Upscale one tile. The model applies its own scale; the fallback honors
    /// `scale_factor` exactly.
    pub fn upscale(&self, tile: &Image, scale_factor: u32) -> Result<Image, UpscaleError> {
        match self {
            Self::Model(backend) => backend.upscale(tile),
            Self::Fallback(scaler) => Ok(scaler.scale(tile, scale_factor.max(1) as f32)),
        }
    }
}

impl std::fmt::Debug for Upscaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model(backend) => f
                .debug_struct("Model")
                .field("name", &backend.name())
                .field("scale_factor", &backend.scale_factor())
                .finish(),
            Self::Fallback(_) => f.write_str("Fallback(Lanczos3)"),
        }
    }
}

/// Which compute engines the session may use.
///
/// `All` registers every accelerated execution provider ONNX Runtime offers
/// here (TensorRT, then CUDA) and lets it fall back to CPU, rather than pinning
/// a single engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeUnits {
    #[default]
    All,
    Cuda,
    Tensorrt,
    Cpu,
}

impl ComputeUnits {
    /// Parse from string (case-insensitive). Returns `All` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Self::Cuda,
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" | "cpuonly" | "cpu_only" => Self::Cpu,
            _ => Self::All,
        }
    }
}

impl std::fmt::Display for ComputeUnits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub compute_units: ComputeUnits,
    pub trt_cache_dir: Option<&'a Path>,
    /// When set, the optimized graph is written here during session creation.
    pub optimized_model_path: Option<&'a Path>,
}

/// Build an `ort::Session` for `config.model_path`.
///
/// Execution providers are registered non-fatally: if TensorRT or CUDA is
/// missing at runtime ONNX Runtime moves on to the next one, ending at CPU.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    if let Some(optimized) = config.optimized_model_path {
        debug!(path = %optimized.display(), "Saving optimized model on first load");
        builder = builder.with_optimized_model_path(optimized)?;
    }

    let wants_trt = matches!(
        config.compute_units,
        ComputeUnits::All | ComputeUnits::Tensorrt
    );
    let wants_cuda = matches!(
        config.compute_units,
        ComputeUnits::All | ComputeUnits::Cuda | ComputeUnits::Tensorrt
    );

    if wants_cuda && !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
        warn!("CUDA EP is not available, inference will fall back to CPU");
    }

    let mut providers = Vec::new();
    if wants_trt {
        let cache_dir = config
            .trt_cache_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("trt_cache"));
        if let Err(e) = std::fs::create_dir_all(&cache_dir) {
            warn!(
                dir = %cache_dir.display(),
                error = %e,
                "Failed to create TRT cache directory"
            );
        }
        let cache_path = cache_dir.to_string_lossy().to_string();
        providers.push(
            TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .with_engine_cache_path(&cache_path)
                .with_fp16(true)
                .with_device_id(0)
                .build(),
        );
    }
    if wants_cuda {
        providers.push(CUDAExecutionProvider::default().build());
    }

    debug!(
        compute_units = %config.compute_units,
        providers = providers.len(),
        model = %config.model_path.display(),
        "Building ONNX Runtime session"
    );

    let started = Instant::now();
    let session = builder
        .with_execution_providers(providers)?
        .commit_from_file(config.model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", config.model_path.display()))?;

    info!(
        elapsed_secs = started.elapsed().as_secs_f64(),
        compute_units = %config.compute_units,
        "ONNX Runtime session ready"
    );
    Ok(session)
}
