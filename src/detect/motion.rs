//! Global-disturbance check.
//!
//! Smoke changes a region of the scene gradually. A camera knocked off its
//! mount or a floodlight switching on changes most of the frame at once;
//! such frames are suppressed instead of scored.

use crate::frame::GrayFrame;

/// Pixels whose absolute difference from the baseline exceeds `threshold`.
/// Frames of different shape count every pixel as changed.
pub fn count_changed_pixels(current: &GrayFrame, baseline: &GrayFrame, threshold: f32) -> usize {
    if !current.same_shape(baseline) {
        return current.pixels().len();
    }
    current
        .pixels()
        .iter()
        .zip(baseline.pixels())
        .filter(|(&c, &b)| (c as f32 - b as f32).abs() > threshold)
        .count()
}

/// True when the changed-pixel count marks the frame as a global disturbance.
/// A limit of zero disables the check.
pub fn is_global_disturbance(changed_pixels: usize, limit: u64) -> bool {
    limit > 0 && changed_pixels as u64 > limit
}
