//! Patch grid and per-patch intensity statistics.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

use crate::frame::GrayFrame;

/// Number of distinct intensity levels in a normalized frame.
pub const INTENSITY_LEVELS: usize = 256;

/// Grid coordinate of a patch: row from the top, column from the left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchCoord {
    pub row: u32,
    pub col: u32,
}

impl PatchCoord {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

/// Pixel rectangle covered by a patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchRect {
    pub coord: PatchCoord,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PatchRect {
    pub fn area(&self) -> u32 {
        self.width * self.height
    }
}

/// Tiling of a `frame_width` x `frame_height` frame into squares of
/// `patch_size`. The last row and column are clipped to the frame edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchGrid {
    frame_width: u32,
    frame_height: u32,
    patch_size: u32,
    rows: u32,
    cols: u32,
}

impl PatchGrid {
    pub fn new(frame_width: u32, frame_height: u32, patch_size: u32) -> Result<Self> {
        if frame_width == 0 || frame_height == 0 {
            return Err(anyhow!("patch grid needs non-zero frame dimensions"));
        }
        if patch_size == 0 {
            return Err(anyhow!("patch size must be > 0"));
        }
        Ok(Self {
            frame_width,
            frame_height,
            patch_size,
            rows: frame_height.div_ceil(patch_size),
            cols: frame_width.div_ceil(patch_size),
        })
    }

    pub fn for_frame(frame: &GrayFrame, patch_size: u32) -> Result<Self> {
        Self::new(frame.width(), frame.height(), patch_size)
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn patch_size(&self) -> u32 {
        self.patch_size
    }

    pub fn frame_width(&self) -> u32 {
        self.frame_width
    }

    pub fn frame_height(&self) -> u32 {
        self.frame_height
    }

    pub fn matches(&self, frame: &GrayFrame) -> bool {
        frame.width() == self.frame_width && frame.height() == self.frame_height
    }

    pub fn rect(&self, coord: PatchCoord) -> Option<PatchRect> {
        if coord.row >= self.rows || coord.col >= self.cols {
            return None;
        }
        let x = coord.col * self.patch_size;
        let y = coord.row * self.patch_size;
        Some(PatchRect {
            coord,
            x,
            y,
            width: self.patch_size.min(self.frame_width - x),
            height: self.patch_size.min(self.frame_height - y),
        })
    }

    /// All patches in row-major order.
    pub fn rects(&self) -> impl Iterator<Item = PatchRect> + '_ {
        (0..self.rows).flat_map(move |row| {
            (0..self.cols).filter_map(move |col| self.rect(PatchCoord::new(row, col)))
        })
    }

    /// Patch containing pixel (x, y).
    pub fn coord_of(&self, x: u32, y: u32) -> Option<PatchCoord> {
        if x >= self.frame_width || y >= self.frame_height {
            return None;
        }
        Some(PatchCoord::new(y / self.patch_size, x / self.patch_size))
    }
}

/// Intensity histogram and mean of one patch.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchStatistics {
    pub histogram: Vec<u32>,
    pub mean: f32,
    pub pixel_count: u32,
}

impl PatchStatistics {
    /// Histogram over `bins` equal-width bins spanning 0..=255.
    pub fn from_rect(frame: &GrayFrame, rect: &PatchRect, bins: usize) -> Self {
        let mut histogram = vec![0u32; bins];
        let mut sum: u64 = 0;
        for y in rect.y..rect.y + rect.height {
            let row = frame.row(y);
            for &value in &row[rect.x as usize..(rect.x + rect.width) as usize] {
                histogram[value as usize * bins / INTENSITY_LEVELS] += 1;
                sum += value as u64;
            }
        }
        let pixel_count = rect.area();
        let mean = if pixel_count == 0 {
            0.0
        } else {
            (sum as f64 / pixel_count as f64) as f32
        };
        Self {
            histogram,
            mean,
            pixel_count,
        }
    }

    pub fn bins(&self) -> usize {
        self.histogram.len()
    }

    /// Intensity span of one bin.
    pub fn bin_width(&self) -> f32 {
        INTENSITY_LEVELS as f32 / self.bins().max(1) as f32
    }

    pub fn is_empty(&self) -> bool {
        self.pixel_count == 0
    }
}

pub fn validate_bins(bins: usize) -> Result<()> {
    if bins == 0 || bins > INTENSITY_LEVELS {
        return Err(anyhow!(
            "histogram bins must be within 1..={}, got {}",
            INTENSITY_LEVELS,
            bins
        ));
    }
    Ok(())
}

/// Statistics for every patch of `frame` under `grid`.
pub fn compute(
    frame: &GrayFrame,
    grid: &PatchGrid,
    bins: usize,
) -> Result<BTreeMap<PatchCoord, PatchStatistics>> {
    validate_bins(bins)?;
    if !grid.matches(frame) {
        return Err(anyhow!(
            "frame {}x{} does not match patch grid {}x{}",
            frame.width(),
            frame.height(),
            grid.frame_width(),
            grid.frame_height()
        ));
    }
    Ok(grid
        .rects()
        .map(|rect| (rect.coord, PatchStatistics::from_rect(frame, &rect, bins)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_patches_are_clipped_not_dropped() -> Result<()> {
        let grid = PatchGrid::new(10, 7, 4)?;
        assert_eq!((grid.rows(), grid.cols()), (2, 3));
        assert_eq!(grid.len(), 6);
        let corner = grid.rect(PatchCoord::new(1, 2)).unwrap();
        assert_eq!((corner.x, corner.y, corner.width, corner.height), (8, 4, 2, 3));
        let covered: u32 = grid.rects().map(|r| r.area()).sum();
        assert_eq!(covered, 70);
        assert!(grid.rect(PatchCoord::new(2, 0)).is_none());
        Ok(())
    }

    #[test]
    fn zero_patch_size_is_rejected() {
        assert!(PatchGrid::new(10, 10, 0).is_err());
        assert!(PatchGrid::new(0, 10, 4).is_err());
    }

    #[test]
    fn uniform_patch_has_single_bin_mass() -> Result<()> {
        let frame = GrayFrame::filled("cam-1", 4, 4, 200, 0)?;
        let grid = PatchGrid::new(4, 4, 4)?;
        let stats = compute(&frame, &grid, 32)?;
        let patch = &stats[&PatchCoord::new(0, 0)];
        assert_eq!(patch.pixel_count, 16);
        assert_eq!(patch.mean, 200.0);
        assert_eq!(patch.histogram.iter().filter(|&&c| c > 0).count(), 1);
        assert_eq!(patch.histogram[200 * 32 / 256], 16);
        Ok(())
    }

    #[test]
    fn single_pixel_edge_patch_is_valid() -> Result<()> {
        let frame = GrayFrame::new("cam-1", 3, 1, vec![0, 0, 255], 0)?;
        let grid = PatchGrid::new(3, 1, 2)?;
        let stats = compute(&frame, &grid, 16)?;
        let edge = &stats[&PatchCoord::new(0, 1)];
        assert_eq!(edge.pixel_count, 1);
        assert_eq!(edge.mean, 255.0);
        assert_eq!(edge.histogram[15], 1);
        Ok(())
    }

    #[test]
    fn grid_must_match_frame() -> Result<()> {
        let frame = GrayFrame::filled("cam-1", 8, 8, 0, 0)?;
        let grid = PatchGrid::new(16, 8, 4)?;
        assert!(compute(&frame, &grid, 32).is_err());
        let grid = PatchGrid::new(8, 8, 4)?;
        assert!(compute(&frame, &grid, 0).is_err());
        assert!(compute(&frame, &grid, 257).is_err());
        Ok(())
    }
}
