//! Synthetic frame source for `stub://` URLs.
//!
//! Produces a flat, lightly noisy scene so the daemon and tests run with no
//! cameras attached. `stub://yard?plume=40` adds a smoke-like plume that is
//! present for 40 frames, absent for 40 frames, and so on.
//!
//! Recognised query parameters: `plume` (period in frames), `noise`
//! (max noise amplitude), `background` (base intensity), `seed`.

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::time::Duration;

use super::{FrameSource, SourceError};
use crate::frame::{PixelFormat, RawFrame};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub background: u8,
    pub noise: u8,
    pub plume_period: Option<u64>,
    pub seed: u64,
}

impl SyntheticConfig {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        let name = name.into();
        let seed = seed_from_name(&name);
        Self {
            name,
            width,
            height,
            background: 96,
            noise: 3,
            plume_period: None,
            seed,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    rng: StdRng,
    frame_count: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            frame_count: 0,
            connected: false,
        }
    }

    /// Parse `stub://<name>[?key=value&...]`.
    pub fn from_url(url: &str, width: u32, height: u32) -> Result<Self> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic source URL must start with stub://"))?;
        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (rest, None),
        };
        if name.is_empty() {
            return Err(anyhow!("synthetic source URL needs a name: {}", url));
        }
        let mut config = SyntheticConfig::new(name, width, height);
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("synthetic source parameter '{}' needs a value", pair))?;
            match key {
                "plume" => {
                    let period: u64 = value
                        .parse()
                        .with_context(|| format!("invalid plume period '{}'", value))?;
                    if period == 0 {
                        return Err(anyhow!("plume period must be > 0"));
                    }
                    config.plume_period = Some(period);
                }
                "noise" => {
                    config.noise = value
                        .parse()
                        .with_context(|| format!("invalid noise amplitude '{}'", value))?
                }
                "background" => {
                    config.background = value
                        .parse()
                        .with_context(|| format!("invalid background '{}'", value))?
                }
                "seed" => {
                    config.seed = value
                        .parse()
                        .with_context(|| format!("invalid seed '{}'", value))?
                }
                other => return Err(anyhow!("unknown synthetic source parameter '{}'", other)),
            }
        }
        Ok(Self::new(config))
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    fn plume_active(&self) -> bool {
        match self.config.plume_period {
            Some(period) => (self.frame_count / period) % 2 == 1,
            None => false,
        }
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let plume = self.plume_active();
        let cx = width as f32 / 2.0;
        let cy = height as f32 * 0.6;
        let radius = (width.min(height) as f32 / 5.0).max(1.0);
        let noise = self.config.noise as i16;

        let mut pixels = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                let mut value = self.config.background as f32;
                if plume {
                    let dx = x as f32 - cx;
                    let dy = y as f32 - cy;
                    let d = (dx * dx + dy * dy).sqrt() / radius;
                    if d < 1.0 {
                        let alpha = 0.85 * (1.0 - d * d);
                        value = value * (1.0 - alpha) + 215.0 * alpha;
                    }
                }
                let jitter = if noise > 0 {
                    self.rng.gen_range(-noise..=noise) as f32
                } else {
                    0.0
                };
                let v = (value + jitter).round().clamp(0.0, 255.0) as u8;
                pixels.extend_from_slice(&[v, v, v.saturating_sub(4)]);
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<(), SourceError> {
        self.connected = true;
        log::info!("SyntheticSource: connected to stub://{}", self.config.name);
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<RawFrame, SourceError> {
        if !self.connected {
            return Err(SourceError::Disconnected("not connected".to_string()));
        }
        let pixels = self.generate_pixels();
        self.frame_count += 1;
        Ok(RawFrame::new(
            self.config.width,
            self.config.height,
            PixelFormat::Rgb24,
            pixels,
            crate::now_ms(),
        ))
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn describe(&self) -> String {
        format!("stub://{}", self.config.name)
    }
}

fn seed_from_name(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(seed)
}
