//! Integer tile geometry: grid planning, overlap padding and output placement.
//!
//! Every function here is pure. The tiler only walks the plan produced by
//! [`plan_tiles`] and never does rectangle arithmetic of its own.

use serde::{Deserialize, Serialize};

/// Tiles smaller than this degrade inference quality and explode the tile count.
pub const MIN_TILE_SIZE: u32 = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Position of `self` expressed relative to `origin`'s top-left corner.
    /// `None` if `self` starts before `origin`.
    pub fn relative_to(&self, origin: &Rect) -> Option<Rect> {
        Some(Rect::new(
            self.x.checked_sub(origin.x)?,
            self.y.checked_sub(origin.y)?,
            self.width,
            self.height,
        ))
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        (self.x as u64) < other.right()
            && (other.x as u64) < self.right()
            && (self.y as u64) < other.bottom()
            && (other.y as u64) < self.bottom()
    }
}

/// Intersect `rect` with `[0, width) × [0, height)`. `None` if nothing remains.
pub fn clamp_to_bounds(rect: Rect, width: u32, height: u32) -> Option<Rect> {
    let right = rect.right().min(width as u64);
    let bottom = rect.bottom().min(height as u64);
    if rect.x as u64 >= right || rect.y as u64 >= bottom {
        return None;
    }
    Some(Rect::new(
        rect.x,
        rect.y,
        (right - rect.x as u64) as u32,
        (bottom - rect.y as u64) as u32,
    ))
}

/// Multiply origin and size by `factor`. `None` on overflow.
pub fn scale_rect(rect: Rect, factor: u32) -> Option<Rect> {
    Some(Rect::new(
        rect.x.checked_mul(factor)?,
        rect.y.checked_mul(factor)?,
        rect.width.checked_mul(factor)?,
        rect.height.checked_mul(factor)?,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileConfig {
    pub tile_size: u32,
    pub overlap: u32,
    pub scale_factor: u32,
}

impl TileConfig {
    pub fn new(tile_size: u32, overlap: u32, scale_factor: u32) -> Self {
        Self {
            tile_size,
            overlap,
            scale_factor,
        }
    }

    /// Apply the floors: tile size at least [`MIN_TILE_SIZE`], scale at least 1.
    pub fn clamped(&self) -> Self {
        Self {
            tile_size: self.tile_size.max(MIN_TILE_SIZE),
            overlap: self.overlap,
            scale_factor: self.scale_factor.max(1),
        }
    }
}

impl Default for TileConfig {
    fn default() -> Self {
        Self::new(256, 16, 4)
    }
}

/// Geometry of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    pub column: u32,
    pub row: u32,
    /// Input region fed to the backend, including overlap padding.
    pub source: Rect,
    /// Input region this cell owns exclusively.
    pub core: Rect,
    /// `core` relative to `source`'s origin, scaled into the upscaled tile.
    pub core_in_upscaled: Rect,
    /// Where the kept region lands on the output canvas.
    pub destination: Rect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
    pub config: TileConfig,
    pub steps_x: u32,
    pub steps_y: u32,
    pub tiles: Vec<TileGeometry>,
}

impl TilePlan {
    /// Denominator for progress reporting. Never zero.
    pub fn total(&self) -> usize {
        (self.steps_x as usize * self.steps_y as usize).max(1)
    }
}

/// Ceiling-division grid size.
pub fn grid_steps(width: u32, height: u32, tile_size: u32) -> (u32, u32) {
    let tile = tile_size.max(1);
    (width.div_ceil(tile), height.div_ceil(tile))
}

/// Start and length of the overlap-padded source span along one axis.
///
/// Leading padding is clamped at zero. Near the trailing edge up to `overlap`
/// extra pixels are requested, then everything is clamped to `extent`.
fn source_span(origin: u32, tile: u32, overlap: u32, extent: u32) -> (u32, u32) {
    let (origin, tile, overlap, extent) = (origin as u64, tile as u64, overlap as u64, extent as u64);
    let start = origin.saturating_sub(overlap);
    let trailing = (origin + tile + overlap).saturating_sub(extent).min(overlap);
    let len = (extent - start).min(tile + overlap + trailing);
    (start as u32, len as u32)
}

/// Geometry for the cell whose top-left input pixel is `(tx, ty)`.
/// `config` must already be clamped.
pub fn tile_geometry(
    width: u32,
    height: u32,
    config: &TileConfig,
    tx: u32,
    ty: u32,
) -> Option<TileGeometry> {
    let tile = config.tile_size;
    let scale = config.scale_factor;

    let (src_x, src_w) = source_span(tx, tile, config.overlap, width);
    let (src_y, src_h) = source_span(ty, tile, config.overlap, height);
    let source = Rect::new(src_x, src_y, src_w, src_h);

    let core = clamp_to_bounds(Rect::new(tx, ty, tile, tile), width, height)?;
    let core_in_upscaled = scale_rect(core.relative_to(&source)?, scale)?;
    let destination = scale_rect(core, scale)?;

    Some(TileGeometry {
        column: tx / tile,
        row: ty / tile,
        source,
        core,
        core_in_upscaled,
        destination,
    })
}

/// Plan every grid cell in row-major order (top-to-bottom, left-to-right).
pub fn plan_tiles(width: u32, height: u32, config: &TileConfig) -> TilePlan {
    let config = config.clamped();
    let (steps_x, steps_y) = grid_steps(width, height, config.tile_size);

    let mut tiles = Vec::with_capacity(steps_x as usize * steps_y as usize);
    for row in 0..steps_y {
        for column in 0..steps_x {
            let tx = column * config.tile_size;
            let ty = row * config.tile_size;
            if let Some(geometry) = tile_geometry(width, height, &config, tx, ty) {
                tiles.push(geometry);
            }
        }
    }

    TilePlan {
        config,
        steps_x,
        steps_y,
        tiles,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_to_bounds_trims_far_edge() {
        let r = clamp_to_bounds(Rect::new(90, 180, 100, 100), 120, 200).unwrap();
        assert_eq!(r, Rect::new(90, 180, 30, 20));
    }

    #[test]
    fn clamp_to_bounds_rejects_outside_rects() {
        assert!(clamp_to_bounds(Rect::new(120, 0, 10, 10), 120, 200).is_none());
        assert!(clamp_to_bounds(Rect::new(0, 0, 0, 10), 120, 200).is_none());
    }

    #[test]
    fn scale_rect_multiplies_everything() {
        assert_eq!(
            scale_rect(Rect::new(3, 5, 7, 11), 4),
            Some(Rect::new(12, 20, 28, 44))
        );
        assert!(scale_rect(Rect::new(u32::MAX, 0, 1, 1), 2).is_none());
    }

    #[test]
    fn relative_to_offsets_origin() {
        let core = Rect::new(100, 100, 50, 50);
        let source = Rect::new(90, 90, 70, 70);
        assert_eq!(core.relative_to(&source), Some(Rect::new(10, 10, 50, 50)));
        assert!(source.relative_to(&core).is_none());
    }

    #[test]
    fn clamped_applies_floors() {
        let cfg = TileConfig::new(8, 4, 0).clamped();
        assert_eq!(cfg.tile_size, MIN_TILE_SIZE);
        assert_eq!(cfg.scale_factor, 1);
        assert_eq!(cfg.overlap, 4);
    }

    #[test]
    fn grid_steps_uses_ceiling_division() {
        assert_eq!(grid_steps(300, 200, 100), (3, 2));
        assert_eq!(grid_steps(301, 200, 100), (4, 2));
        assert_eq!(grid_steps(50, 50, 100), (1, 1));
    }

    #[test]
    fn source_span_matches_reference_cases() {
        // first cell: no leading padding, trailing padding only
        assert_eq!(source_span(0, 100, 10, 300), (0, 110));
        // interior cell: leading padding only
        assert_eq!(source_span(100, 100, 10, 300), (90, 110));
        // last cell: leading padding, clamped at the edge
        assert_eq!(source_span(200, 100, 10, 300), (190, 110));
        // single cell covering everything
        assert_eq!(source_span(0, 256, 16, 200), (0, 200));
    }

    #[test]
    fn single_tile_when_tile_exceeds_image() {
        let plan = plan_tiles(120, 80, &TileConfig::new(256, 16, 2));
        assert_eq!(plan.tiles.len(), 1);
        let t = plan.tiles[0];
        assert_eq!(t.source, Rect::new(0, 0, 120, 80));
        assert_eq!(t.core, t.source);
        assert_eq!(t.core_in_upscaled, Rect::new(0, 0, 240, 160));
        assert_eq!(t.destination, Rect::new(0, 0, 240, 160));
    }

    #[test]
    fn zero_overlap_source_equals_core() {
        let plan = plan_tiles(300, 200, &TileConfig::new(64, 0, 3));
        for t in &plan.tiles {
            assert_eq!(t.source, t.core, "cell ({}, {})", t.column, t.row);
            assert_eq!(t.core_in_upscaled.x, 0);
            assert_eq!(t.core_in_upscaled.y, 0);
        }
    }

    #[test]
    fn trailing_cells_are_smaller_not_padded() {
        let plan = plan_tiles(250, 130, &TileConfig::new(100, 8, 4));
        let last = plan.tiles.last().unwrap();
        assert_eq!(last.core, Rect::new(200, 100, 50, 30));
        assert_eq!(last.destination, Rect::new(800, 400, 200, 120));
        assert!(last.core.width < plan.config.tile_size);
        assert!(last.core.height < plan.config.tile_size);
    }

    #[test]
    fn destinations_tile_the_canvas_exactly() {
        for (w, h, cfg) in [
            (300, 200, TileConfig::new(100, 10, 4)),
            (257, 129, TileConfig::new(64, 7, 2)),
            (33, 500, TileConfig::new(32, 40, 3)),
        ] {
            let plan = plan_tiles(w, h, &cfg);
            let scale = plan.config.scale_factor as u64;
            let area: u64 = plan.tiles.iter().map(|t| t.destination.area()).sum();
            assert_eq!(area, w as u64 * h as u64 * scale * scale);

            for (i, a) in plan.tiles.iter().enumerate() {
                assert!(a.destination.right() <= w as u64 * scale);
                assert!(a.destination.bottom() <= h as u64 * scale);
                for b in &plan.tiles[i + 1..] {
                    assert!(!a.destination.intersects(&b.destination));
                }
            }
        }
    }

    #[test]
    fn core_in_upscaled_stays_inside_scaled_source() {
        let plan = plan_tiles(300, 200, &TileConfig::new(100, 10, 4));
        for t in &plan.tiles {
            assert!(t.core_in_upscaled.right() <= t.source.width as u64 * 4);
            assert!(t.core_in_upscaled.bottom() <= t.source.height as u64 * 4);
        }
    }

    #[test]
    fn plan_is_row_major() {
        let plan = plan_tiles(300, 200, &TileConfig::new(100, 10, 1));
        let order: Vec<(u32, u32)> = plan.tiles.iter().map(|t| (t.row, t.column)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
        assert_eq!(plan.total(), 6);
    }
}
