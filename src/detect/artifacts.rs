//! Named per-camera images for dashboards and snapshots.
//!
//! Each worker renders a fresh `ArtifactSet` per frame and publishes it on its
//! `ArtifactBoard`. Readers load the current set without blocking the worker.

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::detector::{DetectionResult, PatchScore};
use crate::frame::GrayFrame;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Source frame in colour, resized to the camera dimensions.
    Original,
    /// Normalized intensity frame.
    Current,
    /// Baseline frame.
    Base,
    /// Per-pixel absolute difference between current and baseline.
    Difference,
    /// Per-patch Wasserstein distance.
    Wasserstein,
    /// Per-patch mean difference.
    Mean,
    /// Current frame with patch scores overlaid.
    Heatmap,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 7] = [
        ArtifactKind::Original,
        ArtifactKind::Current,
        ArtifactKind::Base,
        ArtifactKind::Difference,
        ArtifactKind::Wasserstein,
        ArtifactKind::Mean,
        ArtifactKind::Heatmap,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Original => "original",
            ArtifactKind::Current => "current",
            ArtifactKind::Base => "base",
            ArtifactKind::Difference => "difference",
            ArtifactKind::Wasserstein => "wasserstein",
            ArtifactKind::Mean => "mean",
            ArtifactKind::Heatmap => "heatmap",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ArtifactKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow!("unknown artifact kind '{}'", s))
    }
}

/// Images rendered from one processed frame.
#[derive(Clone, Debug, Default)]
pub struct ArtifactSet {
    /// Capture time of the frame the set was rendered from.
    pub timestamp_ms: u64,
    pub frame_index: u64,
    images: BTreeMap<ArtifactKind, Arc<DynamicImage>>,
}

impl ArtifactSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<Arc<DynamicImage>> {
        self.images.get(&kind).cloned()
    }

    pub fn available(&self) -> Vec<ArtifactKind> {
        self.images.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    fn insert(&mut self, kind: ArtifactKind, image: DynamicImage) {
        self.images.insert(kind, Arc::new(image));
    }
}

/// Frame inputs for one render pass.
pub struct RenderInput<'a> {
    pub frame_index: u64,
    pub original: Option<RgbImage>,
    pub current: &'a GrayFrame,
    pub baseline: Option<&'a GrayFrame>,
    pub result: Option<&'a DetectionResult>,
    pub motion_threshold: f32,
}

/// Render every artifact the inputs allow.
///
/// Patch score images need a detection result; `base` and `difference` need a
/// baseline of the same shape.
pub fn render_set(input: RenderInput<'_>) -> Result<ArtifactSet> {
    let mut set = ArtifactSet {
        timestamp_ms: input.current.timestamp_ms(),
        frame_index: input.frame_index,
        images: BTreeMap::new(),
    };
    if let Some(original) = input.original {
        set.insert(ArtifactKind::Original, DynamicImage::ImageRgb8(original));
    }
    let current = input.current.to_image()?;
    set.insert(ArtifactKind::Current, DynamicImage::ImageLuma8(current.clone()));

    if let Some(baseline) = input.baseline {
        set.insert(ArtifactKind::Base, DynamicImage::ImageLuma8(baseline.to_image()?));
        if baseline.same_shape(input.current) {
            set.insert(
                ArtifactKind::Difference,
                DynamicImage::ImageLuma8(render_difference(input.current, baseline)),
            );
        }
    }

    if let Some(result) = input.result {
        let full_scale = (2.0 * input.motion_threshold).max(1.0);
        set.insert(
            ArtifactKind::Wasserstein,
            DynamicImage::ImageLuma8(render_patch_values(result, full_scale, |s| s.wasserstein)),
        );
        set.insert(
            ArtifactKind::Mean,
            DynamicImage::ImageLuma8(render_patch_values(result, full_scale, |s| s.mean_diff)),
        );
        set.insert(
            ArtifactKind::Heatmap,
            DynamicImage::ImageRgb8(render_heatmap(&current, result, full_scale)),
        );
    }
    Ok(set)
}

fn render_difference(current: &GrayFrame, baseline: &GrayFrame) -> GrayImage {
    let mut image = GrayImage::new(current.width(), current.height());
    for (pixel, (&c, &b)) in image
        .pixels_mut()
        .zip(current.pixels().iter().zip(baseline.pixels()))
    {
        *pixel = Luma([c.abs_diff(b)]);
    }
    image
}

fn scale(value: f32, full_scale: f32) -> f32 {
    (value / full_scale).clamp(0.0, 1.0)
}

fn render_patch_values(
    result: &DetectionResult,
    full_scale: f32,
    metric: impl Fn(&PatchScore) -> f32,
) -> GrayImage {
    let grid = &result.grid;
    let mut image = GrayImage::new(grid.frame_width(), grid.frame_height());
    for score in &result.scores {
        let Some(rect) = grid.rect(score.coord) else {
            continue;
        };
        let level = (scale(metric(score), full_scale) * 255.0).round() as u8;
        for y in rect.y..rect.y + rect.height {
            for x in rect.x..rect.x + rect.width {
                image.put_pixel(x, y, Luma([level]));
            }
        }
    }
    image
}

fn heat_level(score: &PatchScore, full_scale: f32) -> f32 {
    let level = scale(score.wasserstein.max(score.mean_diff), full_scale);
    if score.active {
        0.35 + 0.4 * level
    } else {
        0.4 * level
    }
}

/// Tints each patch of `current` red in proportion to its score.
fn render_heatmap(current: &GrayImage, result: &DetectionResult, full_scale: f32) -> RgbImage {
    let mut image = RgbImage::from_fn(current.width(), current.height(), |x, y| {
        let Luma([v]) = *current.get_pixel(x, y);
        Rgb([v, v, v])
    });
    for score in &result.scores {
        let Some(rect) = result.grid.rect(score.coord) else {
            continue;
        };
        let heat = heat_level(score, full_scale);
        if heat <= 0.0 {
            continue;
        }
        for y in rect.y..(rect.y + rect.height).min(image.height()) {
            for x in rect.x..(rect.x + rect.width).min(image.width()) {
                let base = current.get_pixel(x, y).0[0] as f32;
                let red = base * (1.0 - heat) + 255.0 * heat;
                let rest = base * (1.0 - heat);
                image.put_pixel(x, y, Rgb([red as u8, rest as u8, rest as u8]));
            }
        }
    }
    image
}

/// Latest artifacts of one camera.
pub struct ArtifactBoard {
    current: ArcSwap<ArtifactSet>,
}

impl ArtifactBoard {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(ArtifactSet::empty()),
        }
    }

    pub fn publish(&self, set: ArtifactSet) {
        self.current.store(Arc::new(set));
    }

    pub fn snapshot(&self) -> Arc<ArtifactSet> {
        self.current.load_full()
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<Arc<DynamicImage>> {
        self.current.load().get(kind)
    }
}

impl Default for ArtifactBoard {
    fn default() -> Self {
        Self::new()
    }
}
