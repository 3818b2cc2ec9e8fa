//! Distances between two patch statistics.
//!
//! Both metrics are reported in intensity units (0..=255) so a single
//! `motion_threshold` applies to either of them.

use std::fmt;

use super::patch::PatchStatistics;

/// Per-patch numeric failure. The detector counts the patch as inactive.
#[derive(Clone, Debug, PartialEq)]
pub enum PatchError {
    BinMismatch { left: usize, right: usize },
    EmptyPatch,
    NonFinite(&'static str),
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::BinMismatch { left, right } => {
                write!(f, "histogram bin counts differ ({} vs {})", left, right)
            }
            PatchError::EmptyPatch => write!(f, "patch has no pixels"),
            PatchError::NonFinite(metric) => write!(f, "{} is not finite", metric),
        }
    }
}

impl std::error::Error for PatchError {}

/// Wasserstein-1 distance between the two intensity distributions.
///
/// Closed form for 1-D histograms: the sum over bins of the absolute
/// difference of the cumulative distributions, scaled by the bin width.
pub fn try_wasserstein(a: &PatchStatistics, b: &PatchStatistics) -> Result<f32, PatchError> {
    if a.bins() != b.bins() {
        return Err(PatchError::BinMismatch {
            left: a.bins(),
            right: b.bins(),
        });
    }
    if a.is_empty() || b.is_empty() {
        return Err(PatchError::EmptyPatch);
    }
    let na = a.pixel_count as f64;
    let nb = b.pixel_count as f64;
    let mut cdf_a = 0.0f64;
    let mut cdf_b = 0.0f64;
    let mut total = 0.0f64;
    for (&ha, &hb) in a.histogram.iter().zip(&b.histogram) {
        cdf_a += ha as f64 / na;
        cdf_b += hb as f64 / nb;
        total += (cdf_a - cdf_b).abs();
    }
    let distance = (total * a.bin_width() as f64) as f32;
    if !distance.is_finite() {
        return Err(PatchError::NonFinite("wasserstein"));
    }
    Ok(distance)
}

/// Absolute difference of the patch means.
pub fn try_mean_diff(a: &PatchStatistics, b: &PatchStatistics) -> Result<f32, PatchError> {
    if a.is_empty() || b.is_empty() {
        return Err(PatchError::EmptyPatch);
    }
    let diff = (a.mean - b.mean).abs();
    if !diff.is_finite() {
        return Err(PatchError::NonFinite("mean difference"));
    }
    Ok(diff)
}

/// `try_wasserstein`, with degenerate input counted as zero distance.
pub fn wasserstein(a: &PatchStatistics, b: &PatchStatistics) -> f32 {
    try_wasserstein(a, b).unwrap_or(0.0)
}

/// `try_mean_diff`, with degenerate input counted as zero distance.
pub fn mean_diff(a: &PatchStatistics, b: &PatchStatistics) -> f32 {
    try_mean_diff(a, b).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::patch::{compute, PatchCoord, PatchGrid};
    use crate::frame::GrayFrame;

    fn stats(pixels: Vec<u8>, bins: usize) -> PatchStatistics {
        let side = (pixels.len() as f64).sqrt() as u32;
        let frame = GrayFrame::new("cam-1", side, side, pixels, 0).unwrap();
        let grid = PatchGrid::new(side, side, side).unwrap();
        compute(&frame, &grid, bins).unwrap()[&PatchCoord::new(0, 0)].clone()
    }

    #[test]
    fn identical_inputs_have_zero_distance() {
        let a = stats((0..64).map(|v| (v * 4) as u8).collect(), 32);
        assert_eq!(wasserstein(&a, &a), 0.0);
        assert_eq!(mean_diff(&a, &a), 0.0);
        let uniform = stats(vec![17; 16], 32);
        assert_eq!(wasserstein(&uniform, &uniform), 0.0);
    }

    #[test]
    fn wasserstein_is_symmetric() {
        let a = stats((0..64).map(|v| (v * 3) as u8).collect(), 32);
        let b = stats((0..64).map(|v| 255 - (v * 2) as u8).collect(), 32);
        assert_eq!(wasserstein(&a, &b), wasserstein(&b, &a));
        assert_eq!(mean_diff(&a, &b), mean_diff(&b, &a));
        assert!(wasserstein(&a, &b) > 0.0);
    }

    #[test]
    fn uniform_shift_is_measured_in_intensity_units() {
        let dark = stats(vec![100; 16], 32);
        let light = stats(vec![200; 16], 32);
        // 100 -> bin 12, 200 -> bin 25, 8 intensity levels per bin.
        assert_eq!(wasserstein(&dark, &light), 13.0 * 8.0);
        assert_eq!(mean_diff(&dark, &light), 100.0);
    }

    #[test]
    fn full_resolution_histogram_matches_mean_shift() {
        let dark = stats(vec![40; 9], 256);
        let light = stats(vec![90; 9], 256);
        assert_eq!(wasserstein(&dark, &light), 50.0);
    }

    #[test]
    fn mismatched_or_empty_inputs_are_patch_errors() {
        let a = stats(vec![10; 16], 32);
        let b = stats(vec![10; 16], 16);
        assert_eq!(
            try_wasserstein(&a, &b),
            Err(PatchError::BinMismatch {
                left: 32,
                right: 16
            })
        );
        assert_eq!(wasserstein(&a, &b), 0.0);

        let empty = PatchStatistics {
            histogram: vec![0; 32],
            mean: 0.0,
            pixel_count: 0,
        };
        assert_eq!(try_wasserstein(&a, &empty), Err(PatchError::EmptyPatch));
        assert_eq!(try_mean_diff(&empty, &a), Err(PatchError::EmptyPatch));
    }
}
