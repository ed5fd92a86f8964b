use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::ComputeUnits;
use crate::convert::Normalization;
use crate::geometry::TileConfig;
use crate::onnx::InferenceSettings;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TESSERA_DATA_DIR";
pub const FALLBACK_LOCALE: &str = "en";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub locale: String,
    pub paths: PathsConfig,
    pub inference: InferenceConfig,
    pub tiling: TilingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMode {
    /// Each converted tensor is remapped by its own min/max.
    #[default]
    PerTensor,
    /// `output_range` is remapped to 0–255 regardless of content.
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    pub compute_units: ComputeUnits,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    pub model_scale: u32,
    pub input_range: [f32; 2],
    pub output_normalization: NormalizationMode,
    pub output_range: [f32; 2],
    pub allow_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TilingConfig {
    pub tile_size: u32,
    pub overlap: u32,
    /// Images whose longer side is below this go to the backend in one call.
    pub direct_threshold: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            locale: FALLBACK_LOCALE.to_string(),
            paths: PathsConfig::default(),
            inference: InferenceConfig::default(),
            tiling: TilingConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            compute_units: ComputeUnits::default(),
            model_path: None,
            model_scale: 4,
            input_range: [0.0, 1.0],
            output_normalization: NormalizationMode::default(),
            output_range: [0.0, 1.0],
            allow_fallback: true,
        }
    }
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size: 256,
            overlap: 16,
            direct_threshold: 512,
        }
    }
}

pub fn normalize_supported_locale(locale: &str) -> String {
    let normalized = locale.trim().to_ascii_lowercase();

    if normalized.starts_with("ja") {
        "ja".to_string()
    } else if normalized.starts_with("en") {
        "en".to_string()
    } else {
        FALLBACK_LOCALE.to_string()
    }
}

impl InferenceConfig {
    pub fn normalization(&self) -> Normalization {
        match self.output_normalization {
            NormalizationMode::PerTensor => Normalization::PerTensor,
            NormalizationMode::Fixed => Normalization::Fixed {
                min: self.output_range[0],
                max: self.output_range[1],
            },
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Inference settings with every relative path resolved against `data_dir`.
    pub fn inference_settings(&self, data_dir: &Path) -> InferenceSettings {
        InferenceSettings {
            models_dir: resolve_relative_to(data_dir, &self.paths.models_dir),
            model_path: self
                .inference
                .model_path
                .as_deref()
                .map(|p| resolve_relative_to(data_dir, p)),
            compute_units: self.inference.compute_units,
            trt_cache_dir: Some(resolve_relative_to(data_dir, &self.paths.trt_cache_dir)),
            model_scale: self.inference.model_scale.max(1),
            input_range: self.inference.input_range,
            output_normalization: self.inference.normalization(),
        }
    }

    pub fn tile_config(&self, scale_factor: u32) -> TileConfig {
        TileConfig::new(self.tiling.tile_size, self.tiling.overlap, scale_factor)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TESSERA_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` if missing and write a default config.toml unless one exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
