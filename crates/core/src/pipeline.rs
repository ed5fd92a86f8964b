//! Request routing: direct inference, tiled inference, or fallback resampling.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{InferenceBackend, Upscaler};
use crate::config::AppConfig;
use crate::error::{fallback_disclaimer, UpscaleError};
use crate::fallback::LanczosScaler;
use crate::geometry::TileConfig;
use crate::model_store::{load_backend, ModelCache};
use crate::tiler::Tiler;
use crate::types::Image;

/// Progress as seen by a display sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Work is running but cannot be measured (single-call paths).
    Indeterminate,
    Fraction(f32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Longest side strictly below this is sent to the backend in one call.
    pub direct_threshold: u32,
    pub default_tiles: TileConfig,
    /// When false and no backend is loaded, requests fail with `ModelNotFound`.
    pub allow_fallback: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            direct_threshold: 512,
            default_tiles: TileConfig::default(),
            allow_fallback: true,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            direct_threshold: config.tiling.direct_threshold,
            default_tiles: config.tile_config(config.inference.model_scale.max(1)),
            allow_fallback: config.inference.allow_fallback,
        }
    }
}

pub struct Pipeline {
    backend: Option<Arc<dyn InferenceBackend>>,
    settings: PipelineSettings,
    cancel: Option<CancellationToken>,
}

impl Pipeline {
    /// The default tile scale follows the backend's own scale when one is loaded.
    pub fn new(backend: Option<Arc<dyn InferenceBackend>>, mut settings: PipelineSettings) -> Self {
        if let Some(backend) = &backend {
            settings.default_tiles.scale_factor = backend.scale_factor().max(1);
        }
        Self {
            backend,
            settings,
            cancel: None,
        }
    }

    /// Resolve the process-wide model (loading it on first use) and build a
    /// pipeline around it. A missing or unloadable model is not an error here:
    /// the pipeline falls back to resampling.
    pub fn from_config(config: &AppConfig, data_dir: &Path) -> Self {
        let settings = config.inference_settings(data_dir);
        let backend = match load_backend(&settings, ModelCache::global()) {
            Ok(backend) => {
                info!(
                    model = backend.name(),
                    scale = backend.scale_factor(),
                    compute_units = %settings.compute_units,
                    "Super-resolution backend ready"
                );
                Some(backend)
            }
            Err(e) if e.is_recoverable() => {
                info!(
                    reason = %e,
                    models_dir = %settings.models_dir.display(),
                    "No usable super-resolution model, using Lanczos fallback"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, "Super-resolution backend failed to load, using Lanczos fallback");
                None
            }
        };
        Self::new(backend, PipelineSettings::from_config(config))
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn is_backend_available(&self) -> bool {
        self.backend.is_some()
    }

    /// Disclaimer to surface when results will come from the fallback scaler.
    pub fn fallback_notice(&self, locale: &str) -> Option<&'static str> {
        (!self.is_backend_available()).then(|| fallback_disclaimer(locale))
    }

    pub fn run_upscale(&self, image: &Image) -> Result<Image, UpscaleError> {
        self.run_upscale_with_progress(image, &mut |_| {})
    }

    /// Direct call when a backend is loaded and the image is small, tiled
    /// otherwise, whole-image fallback when no backend is loaded.
    pub fn run_upscale_with_progress(
        &self,
        image: &Image,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<Image, UpscaleError> {
        self.check_cancelled()?;
        let longest = image.width().max(image.height());

        let result = match &self.backend {
            Some(backend) if longest < self.settings.direct_threshold => {
                debug!(
                    width = image.width(),
                    height = image.height(),
                    "Direct inference"
                );
                on_progress(Progress::Indeterminate);
                backend
                    .upscale(image)
                    .and_then(|out| out.to_layout(image.channels(), image.bit_depth()))
            }
            Some(backend) => {
                debug!(
                    width = image.width(),
                    height = image.height(),
                    threshold = self.settings.direct_threshold,
                    "Tiled inference"
                );
                let upscaler = Upscaler::Model(Arc::clone(backend));
                let mut forward = |fraction: f32| on_progress(Progress::Fraction(fraction));
                self.tiler(&upscaler).upscale_tiled(
                    image,
                    &self.settings.default_tiles,
                    Some(&mut forward),
                )
            }
            None if self.settings.allow_fallback => {
                let scale = self.settings.default_tiles.scale_factor.max(1);
                debug!(scale, "Whole-image Lanczos fallback");
                on_progress(Progress::Indeterminate);
                Ok(LanczosScaler::new().scale(image, scale as f32))
            }
            None => Err(UpscaleError::ModelNotFound),
        };

        let out = result.map_err(UpscaleError::reported)?;
        on_progress(Progress::Fraction(1.0));
        Ok(with_input_metadata(out, image))
    }

    /// Always tiles, with the caller's tile size and overlap. A loaded model
    /// dictates the scale; the fallback scaler honors `config.scale_factor`.
    pub fn run_upscale_tiled(
        &self,
        image: &Image,
        config: &TileConfig,
        on_progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<Image, UpscaleError> {
        self.check_cancelled()?;
        let upscaler = self.upscaler()?;
        let mut config = *config;
        if let Upscaler::Model(backend) = &upscaler {
            let model_scale = backend.scale_factor().max(1);
            if model_scale != config.scale_factor.max(1) {
                warn!(
                    model_scale,
                    requested_scale = config.scale_factor,
                    "Requested tile scale differs from the model, using the model scale"
                );
                config.scale_factor = model_scale;
            }
        }

        self.tiler(&upscaler)
            .upscale_tiled(image, &config, on_progress)
            .map(|out| with_input_metadata(out, image))
            .map_err(UpscaleError::reported)
    }

    fn upscaler(&self) -> Result<Upscaler, UpscaleError> {
        match &self.backend {
            Some(backend) => Ok(Upscaler::Model(Arc::clone(backend))),
            None if self.settings.allow_fallback => Ok(Upscaler::Fallback(LanczosScaler::new())),
            None => Err(UpscaleError::ModelNotFound),
        }
    }

    fn tiler<'a>(&self, upscaler: &'a Upscaler) -> Tiler<'a> {
        match &self.cancel {
            Some(token) => Tiler::new(upscaler).with_cancellation(token.clone()),
            None => Tiler::new(upscaler),
        }
    }

    fn check_cancelled(&self) -> Result<(), UpscaleError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(UpscaleError::Cancelled),
            _ => Ok(()),
        }
    }
}

fn with_input_metadata(out: Image, input: &Image) -> Image {
    out.with_orientation(input.orientation())
        .with_color_space(input.color_space())
}
