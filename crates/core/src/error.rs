//! Error taxonomy shared by every stage of the upscaling pipeline.
//!
//! Stages return the precise variant they hit; the orchestrator collapses them
//! with [`UpscaleError::reported`] before anything reaches a user-facing sink.

use thiserror::Error;

use crate::config::normalize_supported_locale;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum UpscaleError {
    /// No model asset could be resolved. Recoverable: the fallback scaler takes over.
    #[error("no super-resolution model asset found")]
    ModelNotFound,
    #[error("inference backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("tensor conversion failed: {0}")]
    ConversionFailed(String),
    #[error("unsupported tensor layout: shape {shape:?} (expected 3 dimensions with 3 channels)")]
    UnsupportedLayout { shape: Vec<usize> },
    #[error("unsupported tensor dtype: {0} (expected float32)")]
    UnsupportedDType(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("upscale cancelled")]
    Cancelled,
}

impl UpscaleError {
    /// Collapse into the small set the orchestrator reports to callers:
    /// `ModelNotFound`, `InferenceFailed`, `ConversionFailed` or `Cancelled`.
    pub fn reported(self) -> Self {
        match self {
            Self::ModelNotFound | Self::BackendUnavailable(_) => Self::ModelNotFound,
            Self::InferenceFailed(detail) => Self::InferenceFailed(detail),
            Self::ConversionFailed(detail) => Self::ConversionFailed(detail),
            Self::UnsupportedLayout { shape } => {
                Self::ConversionFailed(format!("unsupported tensor layout {shape:?}"))
            }
            Self::UnsupportedDType(dtype) => {
                Self::ConversionFailed(format!("unsupported tensor dtype {dtype}"))
            }
            Self::InvalidImage(detail) => Self::ConversionFailed(detail),
            Self::Cancelled => Self::Cancelled,
        }
    }

    /// Whether the request can still be served by the fallback scaler.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ModelNotFound | Self::BackendUnavailable(_))
    }

    /// Short localized message for end users. Never includes failure details.
    pub fn user_message(&self, locale: &str) -> &'static str {
        let japanese = is_japanese(locale);
        match self.clone().reported() {
            Self::ModelNotFound if japanese => "超解像モデルが見つかりませんでした",
            Self::ModelNotFound => "The super-resolution model could not be found.",
            Self::InferenceFailed(_) if japanese => "超解像に失敗しました",
            Self::InferenceFailed(_) => "Super-resolution failed.",
            Self::Cancelled if japanese => "超解像を中断しました",
            Self::Cancelled => "Super-resolution was cancelled.",
            _ if japanese => "推論結果の画像化に失敗しました",
            _ => "The inference result could not be converted to an image.",
        }
    }
}

/// Notice shown when no real model is available and only resampling will run.
pub fn fallback_disclaimer(locale: &str) -> &'static str {
    if is_japanese(locale) {
        "注意: 超解像モデルが同梱されていないため、簡易拡大(Lanczos)で代替します"
    } else {
        "Note: no super-resolution model is installed, so a simple Lanczos resize is used instead."
    }
}

fn is_japanese(locale: &str) -> bool {
    normalize_supported_locale(locale) == "ja"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_collapses_backend_unavailable_into_model_not_found() {
        let err = UpscaleError::BackendUnavailable("no session".into()).reported();
        assert_eq!(err, UpscaleError::ModelNotFound);
    }

    #[test]
    fn reported_maps_converter_preconditions_to_conversion_failed() {
        let layout = UpscaleError::UnsupportedLayout { shape: vec![2, 2] }.reported();
        let dtype = UpscaleError::UnsupportedDType("uint8".into()).reported();
        assert!(matches!(layout, UpscaleError::ConversionFailed(_)));
        assert!(matches!(dtype, UpscaleError::ConversionFailed(_)));
    }

    #[test]
    fn reported_keeps_inference_and_cancellation() {
        assert_eq!(
            UpscaleError::InferenceFailed("x".into()).reported(),
            UpscaleError::InferenceFailed("x".into())
        );
        assert_eq!(UpscaleError::Cancelled.reported(), UpscaleError::Cancelled);
    }

    #[test]
    fn user_message_hides_details() {
        let err = UpscaleError::InferenceFailed("CUDA error 700 at kernel foo".into());
        let msg = err.user_message("en");
        assert_eq!(msg, "Super-resolution failed.");
        assert!(!msg.contains("CUDA"));
    }

    #[test]
    fn user_message_localizes_to_japanese() {
        assert_eq!(
            UpscaleError::ModelNotFound.user_message("ja-JP"),
            "超解像モデルが見つかりませんでした"
        );
        assert_eq!(
            UpscaleError::UnsupportedDType("int64".into()).user_message("ja"),
            "推論結果の画像化に失敗しました"
        );
    }

    #[test]
    fn recoverable_only_for_missing_backend() {
        assert!(UpscaleError::ModelNotFound.is_recoverable());
        assert!(UpscaleError::BackendUnavailable("x".into()).is_recoverable());
        assert!(!UpscaleError::InferenceFailed("x".into()).is_recoverable());
        assert!(!UpscaleError::Cancelled.is_recoverable());
    }

    #[test]
    fn disclaimer_defaults_to_english() {
        assert!(fallback_disclaimer("fr").contains("Lanczos"));
        assert!(fallback_disclaimer("ja").starts_with("注意"));
    }
}
