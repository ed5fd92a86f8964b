//! Tensor → 8-bit RGB image conversion for model outputs.
//!
//! Accepts 3-D float32 tensors in either CHW or HWC order. With
//! [`Normalization::PerTensor`] the value range is measured on each call, so
//! converting tiles one by one normalizes each tile independently; stitched
//! output can then show seams where neighbouring tiles have different extrema.
//! [`Normalization::Fixed`] avoids that when the model's range is known.

use half::f16;
use ndarray::{ArrayD, ArrayView3, Axis, Ix3};
use serde::{Deserialize, Serialize};

use crate::error::UpscaleError;
use crate::types::Image;

/// Floor for the remap denominator when every element has the same value.
const RANGE_EPSILON: f32 = 1e-6;

/// Raw model output handed to the converter.
#[derive(Debug, Clone)]
pub enum OutputTensor {
    Float32(ArrayD<f32>),
    Float16(ArrayD<f16>),
    Other { dtype: String, shape: Vec<usize> },
}

impl OutputTensor {
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Float32(arr) => arr.shape(),
            Self::Float16(arr) => arr.shape(),
            Self::Other { shape, .. } => shape,
        }
    }

    pub fn dtype_name(&self) -> &str {
        match self {
            Self::Float32(_) => "float32",
            Self::Float16(_) => "float16",
            Self::Other { dtype, .. } => dtype,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Normalization {
    /// Remap the tensor's own `[min, max]` to `[0, 255]`.
    #[default]
    PerTensor,
    /// Remap a fixed, model-defined `[min, max]` to `[0, 255]`.
    Fixed { min: f32, max: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    /// `(C, H, W)`
    ChannelsFirst,
    /// `(H, W, C)`
    ChannelsLast,
}

/// Leading dimension of 3 means channel-first; anything else is channel-last.
pub fn detect_channel_order(shape: &[usize]) -> Result<ChannelOrder, UpscaleError> {
    if shape.len() != 3 {
        return Err(UpscaleError::UnsupportedLayout {
            shape: shape.to_vec(),
        });
    }
    if shape[0] == 3 {
        Ok(ChannelOrder::ChannelsFirst)
    } else if shape[2] == 3 {
        Ok(ChannelOrder::ChannelsLast)
    } else {
        Err(UpscaleError::UnsupportedLayout {
            shape: shape.to_vec(),
        })
    }
}

pub fn tensor_to_image(
    tensor: &OutputTensor,
    normalization: Normalization,
) -> Result<Image, UpscaleError> {
    let OutputTensor::Float32(arr) = tensor else {
        return Err(UpscaleError::UnsupportedDType(
            tensor.dtype_name().to_string(),
        ));
    };

    let order = detect_channel_order(arr.shape())?;
    let view = arr
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| UpscaleError::ConversionFailed(e.to_string()))?;

    // Always walk as HWC; CHW is a permuted view, copied once below.
    let hwc: ArrayView3<f32> = match order {
        ChannelOrder::ChannelsFirst => view.permuted_axes([1, 2, 0]),
        ChannelOrder::ChannelsLast => view,
    };
    let (height, width) = (hwc.len_of(Axis(0)), hwc.len_of(Axis(1)));
    if height == 0 || width == 0 {
        return Err(UpscaleError::ConversionFailed(format!(
            "empty tensor of shape {:?}",
            arr.shape()
        )));
    }

    let (min, max) = match normalization {
        Normalization::PerTensor => value_range(hwc.iter().copied()),
        Normalization::Fixed { min, max } => (min, max),
    };
    let scale = 255.0 / (max - min).max(RANGE_EPSILON);

    let mut rgb = Vec::with_capacity(height * width * 3);
    rgb.extend(hwc.iter().map(|&v| quantize((v - min) * scale)));

    let width = u32::try_from(width)
        .map_err(|_| UpscaleError::ConversionFailed(format!("width {width} too large")))?;
    let height = u32::try_from(height)
        .map_err(|_| UpscaleError::ConversionFailed(format!("height {height} too large")))?;
    Image::rgb8(width, height, rgb).map_err(|e| UpscaleError::ConversionFailed(e.to_string()))
}

/// Minimum and maximum over finite values. `(0, 0)` when none are finite.
fn value_range(values: impl Iterator<Item = f32>) -> (f32, f32) {
    let (min, max) = values
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if min > max {
        (0.0, 0.0)
    } else {
        (min, max)
    }
}

fn quantize(v: f32) -> u8 {
    // NaN casts to 0
    v.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, IxDyn};

    fn f32_tensor(shape: &[usize], data: Vec<f32>) -> OutputTensor {
        OutputTensor::Float32(ArrayD::from_shape_vec(IxDyn(shape), data).unwrap())
    }

    #[test]
    fn chw_is_transposed_to_interleaved_rgb() {
        // 3 x 1 x 2: R = [0, 1], G = [0.5, 0], B = [1, 0.25]
        let t = f32_tensor(&[3, 1, 2], vec![0.0, 1.0, 0.5, 0.0, 1.0, 0.25]);
        let img = tensor_to_image(&t, Normalization::PerTensor).unwrap();
        assert_eq!((img.width(), img.height()), (2, 1));
        assert_eq!(img.channels(), 3);
        assert_eq!(img.pixel(0, 0), &[0, 128, 255]);
        assert_eq!(img.pixel(1, 0), &[255, 0, 64]);
    }

    #[test]
    fn hwc_is_used_as_is() {
        let t = f32_tensor(&[1, 2, 3], vec![-1.0, 0.0, 1.0, 1.0, 0.0, -1.0]);
        let img = tensor_to_image(&t, Normalization::PerTensor).unwrap();
        assert_eq!(img.pixel(0, 0), &[0, 128, 255]);
        assert_eq!(img.pixel(1, 0), &[255, 128, 0]);
    }

    #[test]
    fn flat_tensor_does_not_divide_by_zero() {
        let t = f32_tensor(&[3, 4, 4], vec![0.7; 48]);
        let img = tensor_to_image(&t, Normalization::PerTensor).unwrap();
        let first = img.data()[0];
        assert!(img.data().iter().all(|&b| b == first));
    }

    #[test]
    fn fixed_range_ignores_tensor_extrema() {
        let t = f32_tensor(&[3, 1, 1], vec![0.5, 0.5, 0.5]);
        let img = tensor_to_image(&t, Normalization::Fixed { min: 0.0, max: 1.0 }).unwrap();
        assert_eq!(img.pixel(0, 0), &[128, 128, 128]);

        let out_of_range = f32_tensor(&[3, 1, 1], vec![-0.5, 2.0, 1.0]);
        let img =
            tensor_to_image(&out_of_range, Normalization::Fixed { min: 0.0, max: 1.0 }).unwrap();
        assert_eq!(img.pixel(0, 0), &[0, 255, 255]);
    }

    #[test]
    fn per_tensor_normalization_differs_between_tiles() {
        // Same value, different neighbours: per-tile normalization maps 0.5
        // to different bytes, which is what produces seams after stitching.
        let dark = f32_tensor(&[3, 1, 2], vec![0.0, 0.5, 0.0, 0.5, 0.0, 0.5]);
        let bright = f32_tensor(&[3, 1, 2], vec![0.5, 1.0, 0.5, 1.0, 0.5, 1.0]);
        let a = tensor_to_image(&dark, Normalization::PerTensor).unwrap();
        let b = tensor_to_image(&bright, Normalization::PerTensor).unwrap();
        assert_eq!(a.pixel(1, 0), &[255, 255, 255]);
        assert_eq!(b.pixel(0, 0), &[0, 0, 0]);
    }

    #[test]
    fn rejects_non_three_dimensional_shapes() {
        let t = f32_tensor(&[1, 3, 2, 2], vec![0.0; 12]);
        let err = tensor_to_image(&t, Normalization::PerTensor).unwrap_err();
        assert_eq!(
            err,
            UpscaleError::UnsupportedLayout {
                shape: vec![1, 3, 2, 2]
            }
        );
    }

    #[test]
    fn rejects_channel_last_without_three_channels() {
        let t = f32_tensor(&[2, 2, 4], vec![0.0; 16]);
        assert!(matches!(
            tensor_to_image(&t, Normalization::PerTensor),
            Err(UpscaleError::UnsupportedLayout { .. })
        ));
    }

    #[test]
    fn rejects_non_float32_dtypes() {
        let half = OutputTensor::Float16(ArrayD::from_elem(IxDyn(&[3, 1, 1]), f16::ZERO));
        assert_eq!(
            tensor_to_image(&half, Normalization::PerTensor).unwrap_err(),
            UpscaleError::UnsupportedDType("float16".into())
        );

        let int = OutputTensor::Other {
            dtype: "int64".into(),
            shape: vec![3, 1, 1],
        };
        assert!(matches!(
            tensor_to_image(&int, Normalization::PerTensor),
            Err(UpscaleError::UnsupportedDType(_))
        ));
    }

    #[test]
    fn nan_and_infinity_do_not_poison_range() {
        let t = f32_tensor(&[1, 1, 3], vec![f32::NAN, 0.0, f32::INFINITY]);
        let img = tensor_to_image(&t, Normalization::PerTensor).unwrap();
        assert_eq!(img.pixel(0, 0)[0], 0);
        assert_eq!(img.pixel(0, 0)[1], 0);
    }

    #[test]
    fn non_contiguous_views_convert() {
        let arr = Array3::<f32>::from_shape_fn((2, 2, 3), |(y, x, c)| (y * 6 + x * 3 + c) as f32);
        let reversed = arr.slice(ndarray::s![..;-1, .., ..]).to_owned().into_dyn();
        let img = tensor_to_image(&OutputTensor::Float32(reversed), Normalization::PerTensor).unwrap();
        assert_eq!(img.pixel(0, 1)[0], 0);
        assert_eq!(img.pixel(1, 0)[2], 255);
    }
}
