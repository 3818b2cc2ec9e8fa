//! Artifact encoding and snapshot-on-detection files.

use anyhow::{anyhow, Context, Result};
use chrono::{Local, TimeZone};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::DynamicImage;
use std::fs;
use std::path::{Path, PathBuf};

use crate::detect::{ArtifactKind, ArtifactSet};

const SNAPSHOT_JPEG_QUALITY: u8 = 90;
const SNAPSHOT_KINDS: [ArtifactKind; 2] = [ArtifactKind::Original, ArtifactKind::Heatmap];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageEncoding {
    Png,
    Jpeg { quality: u8 },
}

impl ImageEncoding {
    pub fn extension(self) -> &'static str {
        match self {
            ImageEncoding::Png => "png",
            ImageEncoding::Jpeg { .. } => "jpg",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ImageEncoding::Png => "image/png",
            ImageEncoding::Jpeg { .. } => "image/jpeg",
        }
    }
}

pub fn encode_artifact(image: &DynamicImage, encoding: ImageEncoding) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match encoding {
        ImageEncoding::Png => image
            .write_with_encoder(PngEncoder::new(&mut buf))
            .context("encode PNG artifact")?,
        ImageEncoding::Jpeg { quality } => {
            let quality = quality.clamp(1, 100);
            image
                .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))
                .context("encode JPEG artifact")?
        }
    }
    Ok(buf)
}

/// Writes detection snapshots under `<dir>/<camera>/`.
#[derive(Clone, Debug)]
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the `original` and `heatmap` artifacts of a detection frame.
    /// Missing artifacts are skipped; returns the files written.
    pub fn write_detection(
        &self,
        camera_id: &str,
        timestamp_ms: u64,
        artifacts: &ArtifactSet,
    ) -> Result<Vec<PathBuf>> {
        crate::validate_camera_id(camera_id)?;
        let camera_dir = self.dir.join(camera_id);
        fs::create_dir_all(&camera_dir)
            .with_context(|| format!("create snapshot dir {}", camera_dir.display()))?;

        let stamp = format_timestamp(timestamp_ms)?;
        let encoding = ImageEncoding::Jpeg {
            quality: SNAPSHOT_JPEG_QUALITY,
        };
        let mut written = Vec::new();
        for kind in SNAPSHOT_KINDS {
            let Some(image) = artifacts.get(kind) else {
                continue;
            };
            let path = camera_dir.join(format!(
                "smoke_{}_{}.{}",
                stamp,
                kind.as_str(),
                encoding.extension()
            ));
            let bytes = encode_artifact(&image, encoding)?;
            fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
            written.push(path);
        }
        Ok(written)
    }
}

fn format_timestamp(timestamp_ms: u64) -> Result<String> {
    let ms = i64::try_from(timestamp_ms).map_err(|_| anyhow!("timestamp out of range"))?;
    let local = Local
        .timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("timestamp {} is not a valid local time", timestamp_ms))?;
    Ok(local.format("%Y%m%d_%H%M%S_%3f").to_string())
}
