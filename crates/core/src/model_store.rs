//! Model asset resolution and the process-wide backend cache.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, info, warn};

use crate::backend::InferenceBackend;
use crate::error::UpscaleError;
use crate::onnx::{InferenceSettings, OnnxBackend};

const COMPILED_EXTENSION: &str = "ort";
const RAW_EXTENSION: &str = "onnx";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelAsset {
    /// Prebuilt ONNX Runtime format (`.ort`), loads without graph compilation.
    Compiled(PathBuf),
    /// Plain `.onnx` graph, compiled on first use.
    Raw(PathBuf),
}

impl ModelAsset {
    pub fn path(&self) -> &Path {
        match self {
            Self::Compiled(path) | Self::Raw(path) => path,
        }
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self, Self::Compiled(_))
    }

    fn from_path(path: PathBuf) -> Self {
        if has_extension(&path, COMPILED_EXTENSION) {
            Self::Compiled(path)
        } else {
            Self::Raw(path)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelLocator {
    pub models_dir: PathBuf,
    pub explicit_path: Option<PathBuf>,
}

impl ModelLocator {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            explicit_path: None,
        }
    }

    pub fn from_settings(settings: &InferenceSettings) -> Self {
        Self {
            models_dir: settings.models_dir.clone(),
            explicit_path: settings.model_path.clone(),
        }
    }

    pub fn with_explicit_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    /// Explicit path (or its compiled sibling) → first `*.ort` → first
    /// `*.onnx`, each directory listing sorted by file name.
    pub fn resolve(&self) -> Option<ModelAsset> {
        if let Some(explicit) = &self.explicit_path {
            if explicit.is_file() {
                let compiled = explicit.with_extension(COMPILED_EXTENSION);
                if !has_extension(explicit, COMPILED_EXTENSION) && compiled.is_file() {
                    debug!(path = %compiled.display(), "Using compiled sibling of configured model");
                    return Some(ModelAsset::Compiled(compiled));
                }
                return Some(ModelAsset::from_path(explicit.clone()));
            }
            warn!(
                path = %explicit.display(),
                "Configured model file does not exist, scanning models directory"
            );
        }

        let entries = match std::fs::read_dir(&self.models_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(
                    dir = %self.models_dir.display(),
                    error = %e,
                    "Models directory not readable"
                );
                return None;
            }
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        let first_with = |ext: &str| files.iter().find(|p| has_extension(p, ext)).cloned();
        first_with(COMPILED_EXTENSION)
            .map(ModelAsset::Compiled)
            .or_else(|| first_with(RAW_EXTENSION).map(ModelAsset::Raw))
    }

    /// Whether a model asset exists, without loading it.
    pub fn is_available(&self) -> bool {
        self.resolve().is_some()
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Lazily-initialized backend slot. The first successful load wins and is
/// reused for the rest of the process; failed loads are not cached.
pub struct ModelCache {
    slot: OnceLock<Arc<dyn InferenceBackend>>,
    load_lock: Mutex<()>,
}

impl ModelCache {
    pub const fn new() -> Self {
        Self {
            slot: OnceLock::new(),
            load_lock: Mutex::new(()),
        }
    }

    pub fn global() -> &'static ModelCache {
        static GLOBAL: ModelCache = ModelCache::new();
        &GLOBAL
    }

    pub fn get(&self) -> Option<Arc<dyn InferenceBackend>> {
        self.slot.get().cloned()
    }

    pub fn get_or_load<F>(&self, load: F) -> Result<Arc<dyn InferenceBackend>, UpscaleError>
    where
        F: FnOnce() -> Result<Arc<dyn InferenceBackend>, UpscaleError>,
    {
        if let Some(backend) = self.get() {
            return Ok(backend);
        }

        // A poisoned lock only means an earlier loader panicked; the slot is
        // still consistent.
        let _guard = self
            .load_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(backend) = self.get() {
            return Ok(backend);
        }

        let backend = load()?;
        Ok(self.slot.get_or_init(|| backend).clone())
    }
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cached instance → compiled asset → raw asset → `ModelNotFound`.
pub fn load_backend(
    settings: &InferenceSettings,
    cache: &ModelCache,
) -> Result<Arc<dyn InferenceBackend>, UpscaleError> {
    cache.get_or_load(|| {
        let locator = ModelLocator::from_settings(settings);
        let asset = locator.resolve().ok_or_else(|| {
            info!(
                dir = %locator.models_dir.display(),
                "No super-resolution model found"
            );
            UpscaleError::ModelNotFound
        })?;
        info!(
            path = %asset.path().display(),
            compiled = asset.is_compiled(),
            "Resolved super-resolution model"
        );
        let backend: Arc<dyn InferenceBackend> = Arc::new(OnnxBackend::load(&asset, settings)?);
        Ok(backend)
    })
}
