//! ONNX Runtime super-resolution backend.
//!
//! Supports FP32 models (e.g. Real-ESRGAN, value range 0–255) and FP16 models
//! (e.g. AnimeJaNai, value range 0–1). The expected input range is configured,
//! the output is handed to [`crate::convert`] for normalization.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array4, ArrayD, Axis};
use ort::{
    session::Session,
    tensor::TensorElementType,
    value::{DynValue, Tensor, ValueType},
};
use tracing::{debug, info, warn};

use crate::backend::{build_session, ComputeUnits, InferenceBackend, SessionConfig};
use crate::convert::{tensor_to_image, Normalization, OutputTensor};
use crate::error::UpscaleError;
use crate::model_store::ModelAsset;
use crate::types::Image;

/// Model requires spatial dimensions to be multiples of this.
const PAD_ALIGN: usize = 4;

/// Everything needed to find, load and run a model.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceSettings {
    pub models_dir: PathBuf,
    /// Explicit model file; takes precedence over scanning `models_dir`.
    pub model_path: Option<PathBuf>,
    pub compute_units: ComputeUnits,
    pub trt_cache_dir: Option<PathBuf>,
    pub model_scale: u32,
    /// Range the model expects input pixels in, e.g. `[0, 1]` or `[0, 255]`.
    pub input_range: [f32; 2],
    pub output_normalization: Normalization,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            model_path: None,
            compute_units: ComputeUnits::default(),
            trt_cache_dir: None,
            model_scale: 4,
            input_range: [0.0, 1.0],
            output_normalization: Normalization::default(),
        }
    }
}

pub struct OnnxBackend {
    name: String,
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16_input: bool,
    scale: u32,
    input_range: [f32; 2],
    normalization: Normalization,
}

impl OnnxBackend {
    /// Create a session for `asset`. Raw `.onnx` assets are compiled on first
    /// use: the optimized graph is saved as `<stem>.ort` next to the model.
    pub fn load(asset: &ModelAsset, settings: &InferenceSettings) -> Result<Self, UpscaleError> {
        let path = asset.path();
        let trt_cache_dir = settings.trt_cache_dir.as_deref();

        let session = match asset {
            ModelAsset::Compiled(_) => open_session(path, settings.compute_units, trt_cache_dir, None),
            ModelAsset::Raw(_) => {
                let compiled = path.with_extension("ort");
                open_session(path, settings.compute_units, trt_cache_dir, Some(&compiled))
                    .or_else(|e| {
                        warn!(
                            model = %path.display(),
                            error = %e,
                            "Could not save compiled model, loading without it"
                        );
                        let _ = std::fs::remove_file(&compiled);
                        open_session(path, settings.compute_units, trt_cache_dir, None)
                    })
            }
        }
        .map_err(|e| UpscaleError::BackendUnavailable(format!("{e:#}")))?;

        let input = session
            .inputs()
            .first()
            .ok_or_else(|| UpscaleError::BackendUnavailable("model has no inputs".into()))?;
        let output = session
            .outputs()
            .first()
            .ok_or_else(|| UpscaleError::BackendUnavailable("model has no outputs".into()))?;
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16_input = element_type(input.dtype()) == Some(TensorElementType::Float16);

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());

        info!(
            model = %path.display(),
            %input_name,
            %output_name,
            is_fp16_input,
            scale = settings.model_scale,
            "Loaded super-resolution model"
        );

        Ok(Self {
            name,
            session: Mutex::new(session),
            input_name,
            output_name,
            is_fp16_input,
            scale: settings.model_scale.max(1),
            input_range: settings.input_range,
            normalization: settings.output_normalization,
        })
    }

    fn run(&self, input: Array4<f32>) -> Result<OutputTensor, UpscaleError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| UpscaleError::InferenceFailed("session lock poisoned".into()))?;
        let input_name = self.input_name.as_str();

        if self.is_fp16_input {
            let tensor = Tensor::from_array(input.mapv(f16::from_f32)).map_err(inference_failed)?;
            let outputs = session
                .run(ort::inputs![input_name => &tensor])
                .map_err(inference_failed)?;
            extract_output(&outputs[self.output_name.as_str()])
        } else {
            let tensor = Tensor::from_array(input).map_err(inference_failed)?;
            let outputs = session
                .run(ort::inputs![input_name => &tensor])
                .map_err(inference_failed)?;
            extract_output(&outputs[self.output_name.as_str()])
        }
    }
}

impl InferenceBackend for OnnxBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn scale_factor(&self) -> u32 {
        self.scale
    }

    fn upscale(&self, input: &Image) -> Result<Image, UpscaleError> {
        let (h, w) = (input.height() as usize, input.width() as usize);
        let nchw = image_to_nchw(input, self.input_range)?;
        let padded = pad_nchw(&nchw, h, w);
        debug!(
            width = w,
            height = h,
            padded_w = padded.shape()[3],
            padded_h = padded.shape()[2],
            "Running inference"
        );

        let output = self.run(padded)?;
        let output = crop_output(output, h * self.scale as usize, w * self.scale as usize)?;
        tensor_to_image(&output, self.normalization)
    }
}

fn open_session(
    model_path: &Path,
    compute_units: ComputeUnits,
    trt_cache_dir: Option<&Path>,
    optimized_model_path: Option<&Path>,
) -> anyhow::Result<Session> {
    build_session(&SessionConfig {
        model_path,
        compute_units,
        trt_cache_dir,
        optimized_model_path,
    })
}

fn inference_failed(e: impl std::fmt::Display) -> UpscaleError {
    UpscaleError::InferenceFailed(e.to_string())
}

fn extract_output(value: &DynValue) -> Result<OutputTensor, UpscaleError> {
    match element_type(value.dtype()) {
        Some(TensorElementType::Float32) => Ok(OutputTensor::Float32(
            value
                .try_extract_array::<f32>()
                .map_err(inference_failed)?
                .to_owned(),
        )),
        Some(TensorElementType::Float16) => Ok(OutputTensor::Float16(
            value
                .try_extract_array::<f16>()
                .map_err(inference_failed)?
                .to_owned(),
        )),
        other => Ok(OutputTensor::Other {
            dtype: other.map_or_else(|| "non-tensor".to_string(), |ty| format!("{ty:?}")),
            shape: Vec::new(),
        }),
    }
}

fn element_type(value_type: &ValueType) -> Option<TensorElementType> {
    match value_type {
        ValueType::Tensor { ty, .. } => Some(*ty),
        _ => None,
    }
}

/// Interleaved image → `[1, 3, H, W]` f32, remapped into `range`.
fn image_to_nchw(image: &Image, range: [f32; 2]) -> Result<Array4<f32>, UpscaleError> {
    let rgb = image.to_layout(3, image.bit_depth())?;
    let max = if rgb.bit_depth() == 8 { 255.0 } else { 65535.0 };
    let [lo, hi] = range;
    let (h, w) = (rgb.height() as usize, rgb.width() as usize);

    Ok(Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
        let v = rgb.sample(x as u32, y as u32, c as u8) as f32 / max;
        lo + v * (hi - lo)
    }))
}

/// Mirror index `i` into `0..n`, repeating the edge sample.
fn mirror(i: usize, n: usize) -> usize {
    if i < n {
        i
    } else {
        (2 * n).saturating_sub(i + 1).min(n - 1)
    }
}

fn pad_amount(dim: usize) -> usize {
    (PAD_ALIGN - (dim % PAD_ALIGN)) % PAD_ALIGN
}

/// Reflection-pad NCHW array so H and W are multiples of [`PAD_ALIGN`].
fn pad_nchw(arr: &Array4<f32>, h: usize, w: usize) -> Array4<f32> {
    let (pad_h, pad_w) = (pad_amount(h), pad_amount(w));
    if pad_h == 0 && pad_w == 0 {
        return arr.clone();
    }

    Array4::from_shape_fn((1, 3, h + pad_h, w + pad_w), |(_, c, y, x)| {
        arr[[0, c, mirror(y, h), mirror(x, w)]]
    })
}

/// Drop padding and the batch axis, widening f16 to f32.
fn crop_output(output: OutputTensor, out_h: usize, out_w: usize) -> Result<OutputTensor, UpscaleError> {
    let arr: ArrayD<f32> = match output {
        OutputTensor::Float32(arr) => arr,
        OutputTensor::Float16(arr) => widen_f16(&arr),
        other => return Ok(other),
    };

    let shape = arr.shape().to_vec();
    if shape.len() != 4 || shape[0] != 1 {
        return Err(UpscaleError::UnsupportedLayout { shape });
    }
    if shape[2] < out_h || shape[3] < out_w {
        return Err(UpscaleError::InferenceFailed(format!(
            "model output {}x{} is smaller than expected {out_w}x{out_h}",
            shape[3], shape[2]
        )));
    }

    let cropped = arr
        .slice(s![.., .., ..out_h, ..out_w])
        .index_axis(Axis(0), 0)
        .to_owned()
        .into_dyn();
    Ok(OutputTensor::Float32(cropped))
}

fn widen_f16(arr: &ArrayD<f16>) -> ArrayD<f32> {
    let contiguous = arr.as_standard_layout();
    match contiguous.as_slice() {
        Some(halves) => {
            let mut widened = vec![0.0f32; halves.len()];
            halves.convert_to_f32_slice(&mut widened);
            ArrayD::from_shape_vec(arr.raw_dim(), widened)
                .unwrap_or_else(|_| arr.mapv(f16::to_f32))
        }
        None => arr.mapv(f16::to_f32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_amount() {
        assert_eq!(pad_amount(0), 0);
        assert_eq!(pad_amount(1), 3);
        assert_eq!(pad_amount(4), 0);
        assert_eq!(pad_amount(5), 3);
        assert_eq!(pad_amount(7), 1);
    }

    #[test]
    fn test_pad_nchw_no_padding() {
        let arr = Array4::<f32>::ones((1, 3, 8, 8));
        let padded = pad_nchw(&arr, 8, 8);
        assert_eq!(padded.shape(), &[1, 3, 8, 8]);
    }

    #[test]
    fn test_pad_nchw_reflects_edges() {
        let arr = Array4::from_shape_fn((1, 3, 5, 6), |(_, c, y, x)| (c * 100 + y * 10 + x) as f32);
        let padded = pad_nchw(&arr, 5, 6);
        assert_eq!(padded.shape(), &[1, 3, 8, 8]);
        assert_eq!(padded[[0, 0, 4, 5]], 45.0);
        assert_eq!(padded[[0, 0, 5, 0]], padded[[0, 0, 4, 0]]);
        assert_eq!(padded[[0, 0, 6, 0]], padded[[0, 0, 3, 0]]);
        assert_eq!(padded[[0, 0, 7, 0]], padded[[0, 0, 2, 0]]);
        assert_eq!(padded[[0, 2, 0, 6]], padded[[0, 2, 0, 5]]);
        assert_eq!(padded[[0, 2, 0, 7]], padded[[0, 2, 0, 4]]);
    }

    #[test]
    fn test_pad_nchw_single_pixel() {
        let arr = Array4::from_elem((1, 3, 1, 1), 0.5f32);
        let padded = pad_nchw(&arr, 1, 1);
        assert_eq!(padded.shape(), &[1, 3, 4, 4]);
        assert!(padded.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_image_to_nchw_ranges() {
        let img = Image::rgb8(2, 1, vec![0, 128, 255, 255, 0, 0]).unwrap();

        let unit = image_to_nchw(&img, [0.0, 1.0]).unwrap();
        assert_eq!(unit.shape(), &[1, 3, 1, 2]);
        assert_eq!(unit[[0, 0, 0, 0]], 0.0);
        assert!((unit[[0, 1, 0, 0]] - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(unit[[0, 2, 0, 0]], 1.0);
        assert_eq!(unit[[0, 0, 0, 1]], 1.0);

        let bytes = image_to_nchw(&img, [0.0, 255.0]).unwrap();
        assert!((bytes[[0, 1, 0, 0]] - 128.0).abs() < 1e-3);
    }

    #[test]
    fn test_image_to_nchw_drops_alpha() {
        let img = Image::from_raw(1, 1, 4, 8, vec![10, 20, 30, 40]).unwrap();
        let nchw = image_to_nchw(&img, [0.0, 255.0]).unwrap();
        assert_eq!(nchw.shape(), &[1, 3, 1, 1]);
        assert!((nchw[[0, 2, 0, 0]] - 30.0).abs() < 1e-3);
    }

    #[test]
    fn test_crop_output_removes_padding_and_batch() {
        let arr = ArrayD::from_elem(ndarray::IxDyn(&[1, 3, 8, 12]), 0.25f32);
        let cropped = crop_output(OutputTensor::Float32(arr), 6, 10).unwrap();
        assert_eq!(cropped.shape(), &[3, 6, 10]);
    }

    #[test]
    fn test_crop_output_widens_f16() {
        let arr = ArrayD::from_elem(ndarray::IxDyn(&[1, 3, 4, 4]), f16::from_f32(0.5));
        let OutputTensor::Float32(out) = crop_output(OutputTensor::Float16(arr), 4, 4).unwrap()
        else {
            panic!("expected float32 output");
        };
        assert!(out.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_crop_output_rejects_short_output() {
        let arr = ArrayD::from_elem(ndarray::IxDyn(&[1, 3, 4, 4]), 0.0f32);
        assert!(matches!(
            crop_output(OutputTensor::Float32(arr), 8, 8),
            Err(UpscaleError::InferenceFailed(_))
        ));
    }

    #[test]
    fn test_crop_output_passes_unknown_dtype_through() {
        let other = OutputTensor::Other {
            dtype: "Int64".into(),
            shape: vec![1, 3, 4, 4],
        };
        let out = crop_output(other, 4, 4).unwrap();
        assert!(matches!(
            tensor_to_image(&out, Normalization::PerTensor),
            Err(UpscaleError::UnsupportedDType(_))
        ));
    }

    /// Requires GPU + model file. Run: `cargo test -p tessera-core -- --ignored`
    #[test]
    #[ignore]
    fn test_full_inference_small_tile() {
        let settings = InferenceSettings::default();
        let asset = ModelAsset::Raw(PathBuf::from("models/RealESRGAN_x4plus_anime_6B.onnx"));
        let backend = OnnxBackend::load(&asset, &settings).expect("model should load");

        let tile = Image::rgb8(8, 8, vec![128; 8 * 8 * 3]).unwrap();
        let out = backend.upscale(&tile).expect("inference should succeed");
        assert_eq!((out.width(), out.height()), (32, 32));
        assert_eq!(out.channels(), 3);
    }
}
