use std::sync::Arc;

use crate::error::UpscaleError;
use crate::geometry::Rect;

/// Color space tag carried through the pipeline. Pixels are never re-encoded
/// between spaces; the tag is copied from input to output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    #[default]
    Srgb,
    LinearSrgb,
    DisplayP3,
}

/// EXIF orientation. Only carried as metadata; pixels are stored as decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Orientation {
    #[default]
    Up,
    UpMirrored,
    Down,
    DownMirrored,
    LeftMirrored,
    Right,
    RightMirrored,
    Left,
}

impl Orientation {
    pub fn from_exif(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Up),
            2 => Some(Self::UpMirrored),
            3 => Some(Self::Down),
            4 => Some(Self::DownMirrored),
            5 => Some(Self::LeftMirrored),
            6 => Some(Self::Right),
            7 => Some(Self::RightMirrored),
            8 => Some(Self::Left),
            _ => None,
        }
    }

    pub fn to_exif(self) -> u8 {
        match self {
            Self::Up => 1,
            Self::UpMirrored => 2,
            Self::Down => 3,
            Self::DownMirrored => 4,
            Self::LeftMirrored => 5,
            Self::Right => 6,
            Self::RightMirrored => 7,
            Self::Left => 8,
        }
    }
}

/// Immutable, tightly-packed, row-major pixel buffer.
///
/// Supports 1–4 interleaved channels at 8 or 16 bits per sample. 16-bit samples
/// are stored native-endian. Cloning shares the underlying bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    width: u32,
    height: u32,
    channels: u8,
    bit_depth: u8,
    color_space: ColorSpace,
    orientation: Orientation,
    data: Arc<[u8]>,
}

impl Image {
    pub fn from_raw(
        width: u32,
        height: u32,
        channels: u8,
        bit_depth: u8,
        data: Vec<u8>,
    ) -> Result<Self, UpscaleError> {
        if width == 0 || height == 0 {
            return Err(UpscaleError::InvalidImage(format!(
                "dimensions must be positive, got {width}x{height}"
            )));
        }
        if !(1..=4).contains(&channels) {
            return Err(UpscaleError::InvalidImage(format!(
                "unsupported channel count {channels} (expected 1..=4)"
            )));
        }
        if bit_depth != 8 && bit_depth != 16 {
            return Err(UpscaleError::InvalidImage(format!(
                "unsupported bit depth {bit_depth} (expected 8 or 16)"
            )));
        }

        let expected = buffer_len(width, height, channels, bit_depth).ok_or_else(|| {
            UpscaleError::InvalidImage(format!("{width}x{height} image is too large"))
        })?;
        if data.len() != expected {
            return Err(UpscaleError::InvalidImage(format!(
                "data length mismatch: expected {expected} ({width}x{height}x{channels} @ {bit_depth}-bit), got {}",
                data.len()
            )));
        }

        Ok(Self {
            width,
            height,
            channels,
            bit_depth,
            color_space: ColorSpace::default(),
            orientation: Orientation::default(),
            data: data.into(),
        })
    }

    /// 8-bit RGB, the layout every inference backend produces.
    pub fn rgb8(width: u32, height: u32, data: Vec<u8>) -> Result<Self, UpscaleError> {
        Self::from_raw(width, height, 3, 8, data)
    }

    pub fn with_color_space(mut self, color_space: ColorSpace) -> Self {
        self.color_space = color_space;
        self
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    /// Copy color space and orientation from `other`.
    pub fn with_metadata_of(self, other: &Image) -> Self {
        self.with_color_space(other.color_space)
            .with_orientation(other.orientation)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    pub fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.bytes_per_pixel()
    }

    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.bytes_per_pixel();
        let start = y as usize * self.row_bytes() + x as usize * bpp;
        &self.data[start..start + bpp]
    }

    /// Read one sample as a u16 regardless of bit depth.
    pub fn sample(&self, x: u32, y: u32, channel: u8) -> u16 {
        let px = self.pixel(x, y);
        match self.bit_depth {
            8 => px[channel as usize] as u16,
            _ => {
                let i = channel as usize * 2;
                u16::from_ne_bytes([px[i], px[i + 1]])
            }
        }
    }

    /// Strict crop. `None` when `rect` is empty or reaches outside the image.
    pub fn crop(&self, rect: Rect) -> Option<Image> {
        if rect.is_empty() || rect.right() > self.width as u64 || rect.bottom() > self.height as u64
        {
            return None;
        }

        let bpp = self.bytes_per_pixel();
        let src_stride = self.row_bytes();
        let dst_stride = rect.width as usize * bpp;
        let mut out = Vec::with_capacity(dst_stride * rect.height as usize);
        for y in rect.y..rect.y + rect.height {
            let start = y as usize * src_stride + rect.x as usize * bpp;
            out.extend_from_slice(&self.data[start..start + dst_stride]);
        }

        Some(Image {
            width: rect.width,
            height: rect.height,
            channels: self.channels,
            bit_depth: self.bit_depth,
            color_space: self.color_space,
            orientation: self.orientation,
            data: out.into(),
        })
    }

    /// Convert to another channel count / bit depth. Missing alpha becomes
    /// opaque, gray is replicated, RGB→gray uses Rec. 601 luma.
    pub fn to_layout(&self, channels: u8, bit_depth: u8) -> Result<Image, UpscaleError> {
        if channels == self.channels && bit_depth == self.bit_depth {
            return Ok(self.clone());
        }
        if !(1..=4).contains(&channels) || (bit_depth != 8 && bit_depth != 16) {
            return Err(UpscaleError::InvalidImage(format!(
                "cannot convert to {channels} channels @ {bit_depth}-bit"
            )));
        }

        let src_max: u32 = if self.bit_depth == 8 { 255 } else { 65535 };
        let dst_max: u32 = if bit_depth == 8 { 255 } else { 65535 };
        let pixels = self.width as usize * self.height as usize;
        let mut out = Vec::with_capacity(pixels * channels as usize * (bit_depth as usize / 8));

        for y in 0..self.height {
            for x in 0..self.width {
                let (rgb, alpha) = self.rgba_at(x, y, src_max);
                let values: [u32; 4] = match channels {
                    1 => [luma(rgb), 0, 0, 0],
                    2 => [luma(rgb), alpha, 0, 0],
                    3 => [rgb[0], rgb[1], rgb[2], 0],
                    _ => [rgb[0], rgb[1], rgb[2], alpha],
                };
                for &v in &values[..channels as usize] {
                    let rescaled = (v * dst_max + src_max / 2) / src_max;
                    if bit_depth == 8 {
                        out.push(rescaled as u8);
                    } else {
                        out.extend_from_slice(&(rescaled as u16).to_ne_bytes());
                    }
                }
            }
        }

        Ok(Image::from_raw(self.width, self.height, channels, bit_depth, out)?
            .with_metadata_of(self))
    }

    fn rgba_at(&self, x: u32, y: u32, max: u32) -> ([u32; 3], u32) {
        let s = |c: u8| self.sample(x, y, c) as u32;
        match self.channels {
            1 => ([s(0); 3], max),
            2 => ([s(0); 3], s(1)),
            3 => ([s(0), s(1), s(2)], max),
            _ => ([s(0), s(1), s(2)], s(3)),
        }
    }
}

fn luma(rgb: [u32; 3]) -> u32 {
    (rgb[0] * 299 + rgb[1] * 587 + rgb[2] * 114 + 500) / 1000
}

pub(crate) fn buffer_len(width: u32, height: u32, channels: u8, bit_depth: u8) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(channels as usize)?
        .checked_mul(bit_depth as usize / 8)
}
