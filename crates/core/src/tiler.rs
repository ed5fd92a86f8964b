//! Overlapping-tile upscaling and stitching.
//!
//! Tiles run strictly one after another. Each tile's overlap padding is
//! discarded after upscaling and only its core region is written, so the
//! destination rects of all tiles partition the output canvas exactly.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::Upscaler;
use crate::error::UpscaleError;
use crate::geometry::{plan_tiles, Rect, TileConfig, TileGeometry};
use crate::types::{buffer_len, ColorSpace, Image, Orientation};

/// Mutable output buffer owned by a single tiling operation.
pub struct OutputCanvas {
    width: u32,
    height: u32,
    channels: u8,
    bit_depth: u8,
    color_space: ColorSpace,
    orientation: Orientation,
    data: Vec<u8>,
}

impl OutputCanvas {
    /// Zero-filled canvas of `width x height` in the layout of `like`.
    /// `None` if the size overflows or the allocation cannot be satisfied.
    pub fn allocate(width: u32, height: u32, like: &Image) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let len = buffer_len(width, height, like.channels(), like.bit_depth())?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).ok()?;
        data.resize(len, 0);

        Some(Self {
            width,
            height,
            channels: like.channels(),
            bit_depth: like.bit_depth(),
            color_space: like.color_space(),
            orientation: like.orientation(),
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn bytes_per_pixel(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }

    /// Copy `tile` into the canvas at `dest`. The tile is converted to the
    /// canvas layout first; its size must equal `dest`'s.
    pub fn blit(&mut self, tile: &Image, dest: Rect) -> Result<(), UpscaleError> {
        if tile.width() != dest.width || tile.height() != dest.height {
            return Err(UpscaleError::InvalidImage(format!(
                "tile is {}x{}, destination is {}x{}",
                tile.width(),
                tile.height(),
                dest.width,
                dest.height
            )));
        }
        if dest.right() > self.width as u64 || dest.bottom() > self.height as u64 {
            return Err(UpscaleError::InvalidImage(format!(
                "destination {dest:?} outside {}x{} canvas",
                self.width, self.height
            )));
        }

        let tile = tile.to_layout(self.channels, self.bit_depth)?;
        let bpp = self.bytes_per_pixel();
        let canvas_stride = self.width as usize * bpp;
        let row_len = dest.width as usize * bpp;
        for (row, src) in tile.data().chunks_exact(row_len).enumerate() {
            let start = (dest.y as usize + row) * canvas_stride + dest.x as usize * bpp;
            self.data[start..start + row_len].copy_from_slice(src);
        }
        Ok(())
    }

    pub fn finalize(self) -> Result<Image, UpscaleError> {
        Ok(
            Image::from_raw(self.width, self.height, self.channels, self.bit_depth, self.data)?
                .with_color_space(self.color_space)
                .with_orientation(self.orientation),
        )
    }
}

pub struct Tiler<'a> {
    upscaler: &'a Upscaler,
    cancel: Option<CancellationToken>,
}

impl<'a> Tiler<'a> {
    pub fn new(upscaler: &'a Upscaler) -> Self {
        Self {
            upscaler,
            cancel: None,
        }
    }

    /// Checked between tiles only; an in-flight tile always completes.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Upscale `image` tile by tile and stitch the result.
    ///
    /// Backend failures abort the whole operation and discard the canvas.
    /// Tiles whose crops fail, or whose upscaled size is not exactly the
    /// source size times the tile scale, are skipped, leaving a gap. If the canvas cannot
    /// be allocated or finalized the original image is returned unchanged.
    pub fn upscale_tiled(
        &self,
        image: &Image,
        config: &TileConfig,
        mut on_progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<Image, UpscaleError> {
        let plan = plan_tiles(image.width(), image.height(), config);
        let scale = plan.config.scale_factor;
        let total = plan.total();

        let canvas = image
            .width()
            .checked_mul(scale)
            .zip(image.height().checked_mul(scale))
            .and_then(|(w, h)| OutputCanvas::allocate(w, h, image));
        let Some(mut canvas) = canvas else {
            warn!(
                width = image.width(),
                height = image.height(),
                scale,
                "Could not allocate output canvas, returning input unscaled"
            );
            return Ok(image.clone());
        };

        debug!(
            upscaler = self.upscaler.name(),
            tiles = total,
            steps_x = plan.steps_x,
            steps_y = plan.steps_y,
            tile_size = plan.config.tile_size,
            overlap = plan.config.overlap,
            scale,
            "Starting tiled upscale"
        );

        let mut completed = 0usize;
        for tile in &plan.tiles {
            if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                debug!(completed, total, "Tiled upscale cancelled");
                return Err(UpscaleError::Cancelled);
            }

            if !self.process_tile(image, tile, scale, &mut canvas)? {
                continue;
            }

            completed += 1;
            if let Some(cb) = on_progress.as_mut() {
                cb(completed as f32 / total as f32);
            }
        }

        match canvas.finalize() {
            Ok(out) => Ok(out),
            Err(e) => {
                warn!(error = %e, "Could not finalize output canvas, returning input unscaled");
                Ok(image.clone())
            }
        }
    }

    /// `Ok(false)` when the tile was skipped.
    fn process_tile(
        &self,
        image: &Image,
        tile: &TileGeometry,
        scale: u32,
        canvas: &mut OutputCanvas,
    ) -> Result<bool, UpscaleError> {
        let Some(source) = image.crop(tile.source) else {
            debug!(column = tile.column, row = tile.row, source = ?tile.source, "Skipping tile: source crop failed");
            return Ok(false);
        };

        let upscaled = self.upscaler.upscale(&source, scale)?;
        let expected = (source.width() * scale, source.height() * scale);
        if (upscaled.width(), upscaled.height()) != expected {
            debug!(
                column = tile.column,
                row = tile.row,
                expected_w = expected.0,
                expected_h = expected.1,
                upscaled_w = upscaled.width(),
                upscaled_h = upscaled.height(),
                "Skipping tile: upscaled size does not match the tile scale"
            );
            return Ok(false);
        }

        let Some(core) = upscaled.crop(tile.core_in_upscaled) else {
            debug!(
                column = tile.column,
                row = tile.row,
                core = ?tile.core_in_upscaled,
                upscaled_w = upscaled.width(),
                upscaled_h = upscaled.height(),
                "Skipping tile: core crop failed"
            );
            return Ok(false);
        };

        if let Err(e) = canvas.blit(&core, tile.destination) {
            debug!(column = tile.column, row = tile.row, error = %e, "Skipping tile: blit failed");
            return Ok(false);
        }
        debug!(column = tile.column, row = tile.row, dest = ?tile.destination, "Tile done");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::LanczosScaler;

    #[test]
    fn canvas_blit_writes_exact_region() {
        let like = Image::rgb8(1, 1, vec![0, 0, 0]).unwrap();
        let mut canvas = OutputCanvas::allocate(4, 3, &like).unwrap();
        let tile = Image::rgb8(2, 1, vec![1, 2, 3, 4, 5, 6]).unwrap();
        canvas.blit(&tile, Rect::new(1, 2, 2, 1)).unwrap();

        let out = canvas.finalize().unwrap();
        assert_eq!(out.pixel(1, 2), &[1, 2, 3]);
        assert_eq!(out.pixel(2, 2), &[4, 5, 6]);
        assert_eq!(out.pixel(0, 2), &[0, 0, 0]);
        assert_eq!(out.pixel(1, 1), &[0, 0, 0]);
    }

    #[test]
    fn canvas_blit_adapts_tile_layout() {
        let like = Image::from_raw(1, 1, 4, 8, vec![0; 4]).unwrap();
        let mut canvas = OutputCanvas::allocate(1, 1, &like).unwrap();
        canvas
            .blit(&Image::rgb8(1, 1, vec![9, 8, 7]).unwrap(), Rect::new(0, 0, 1, 1))
            .unwrap();
        assert_eq!(canvas.finalize().unwrap().pixel(0, 0), &[9, 8, 7, 255]);
    }

    #[test]
    fn canvas_blit_rejects_mismatched_sizes() {
        let like = Image::rgb8(1, 1, vec![0, 0, 0]).unwrap();
        let mut canvas = OutputCanvas::allocate(4, 4, &like).unwrap();
        let tile = Image::rgb8(2, 2, vec![0; 12]).unwrap();
        assert!(canvas.blit(&tile, Rect::new(0, 0, 3, 2)).is_err());
        assert!(canvas.blit(&tile, Rect::new(3, 3, 2, 2)).is_err());
    }

    #[test]
    fn canvas_allocation_rejects_overflow() {
        let like = Image::rgb8(1, 1, vec![0, 0, 0]).unwrap();
        assert!(OutputCanvas::allocate(0, 10, &like).is_none());
        if usize::BITS == 32 {
            assert!(OutputCanvas::allocate(u32::MAX, u32::MAX, &like).is_none());
        }
    }

    #[test]
    fn canvas_keeps_input_metadata() {
        let like = Image::rgb8(1, 1, vec![0, 0, 0])
            .unwrap()
            .with_color_space(ColorSpace::LinearSrgb)
            .with_orientation(Orientation::Left);
        let out = OutputCanvas::allocate(2, 2, &like)
            .unwrap()
            .finalize()
            .unwrap();
        assert_eq!(out.color_space(), ColorSpace::LinearSrgb);
        assert_eq!(out.orientation(), Orientation::Left);
    }

    #[test]
    fn fallback_tiling_produces_full_canvas() {
        let image = Image::rgb8(70, 40, vec![77; 70 * 40 * 3]).unwrap();
        let upscaler = Upscaler::Fallback(LanczosScaler::new());
        let out = Tiler::new(&upscaler)
            .upscale_tiled(&image, &TileConfig::new(32, 8, 3), None)
            .unwrap();
        assert_eq!((out.width(), out.height()), (210, 120));
        assert!(out.data().iter().all(|&b| b.abs_diff(77) <= 1));
    }

    /// Nearest-neighbor model with a fixed scale.
    struct NearestModel(u32);

    impl crate::backend::InferenceBackend for NearestModel {
        fn name(&self) -> &str {
            "nearest"
        }

        fn scale_factor(&self) -> u32 {
            self.0
        }

        fn upscale(&self, input: &Image) -> Result<Image, UpscaleError> {
            let s = self.0;
            let (w, h) = (input.width() * s, input.height() * s);
            let mut data = Vec::with_capacity((w * h * 3) as usize);
            for y in 0..h {
                for x in 0..w {
                    data.extend_from_slice(input.pixel(x / s, y / s));
                }
            }
            Image::rgb8(w, h, data)
        }
    }

    #[test]
    fn model_scale_mismatch_skips_every_tile() {
        let image = Image::rgb8(64, 32, vec![50; 64 * 32 * 3]).unwrap();
        let upscaler = Upscaler::Model(std::sync::Arc::new(NearestModel(4)));

        let mut calls = 0;
        let mut progress = |_: f32| calls += 1;
        let out = Tiler::new(&upscaler)
            .upscale_tiled(&image, &TileConfig::new(32, 0, 2), Some(&mut progress))
            .unwrap();

        assert_eq!((out.width(), out.height()), (128, 64));
        assert!(out.data().iter().all(|&b| b == 0));
        assert_eq!(calls, 0);
    }

    #[test]
    fn out_of_range_source_tile_is_skipped() {
        let image = Image::rgb8(40, 20, vec![9; 40 * 20 * 3]).unwrap();
        let upscaler = Upscaler::Fallback(LanczosScaler::new());
        let mut canvas = OutputCanvas::allocate(80, 40, &image).unwrap();
        let tile = TileGeometry {
            column: 1,
            row: 0,
            source: Rect::new(30, 0, 20, 20),
            core: Rect::new(30, 0, 20, 20),
            core_in_upscaled: Rect::new(0, 0, 40, 40),
            destination: Rect::new(60, 0, 40, 40),
        };

        let done = Tiler::new(&upscaler)
            .process_tile(&image, &tile, 2, &mut canvas)
            .unwrap();

        assert!(!done);
        assert!(canvas.finalize().unwrap().data().iter().all(|&b| b == 0));
    }

    #[test]
    fn cancelled_token_stops_before_first_tile() {
        let image = Image::rgb8(64, 64, vec![0; 64 * 64 * 3]).unwrap();
        let upscaler = Upscaler::Fallback(LanczosScaler::new());
        let token = CancellationToken::new();
        token.cancel();

        let mut calls = 0;
        let mut progress = |_: f32| calls += 1;
        let result = Tiler::new(&upscaler)
            .with_cancellation(token)
            .upscale_tiled(&image, &TileConfig::new(32, 0, 2), Some(&mut progress));
        assert_eq!(result, Err(UpscaleError::Cancelled));
        assert_eq!(calls, 0);
    }
}
