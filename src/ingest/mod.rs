//! Frame ingestion sources.
//!
//! This module provides the sources a camera worker pulls raw frames from:
//! - Synthetic scenes (`stub://` URLs) for running without cameras
//! - RTSP streams (IP cameras, feature: rtsp-gstreamer)
//!
//! Every source hands out `RawFrame` values with a bounded wait. Sources do not
//! pace themselves; the worker decides how often to ask for a frame.

use anyhow::{anyhow, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CameraConfig;
use crate::frame::RawFrame;

pub mod normalize;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod synthetic;

pub use normalize::{normalize_frame, to_rgb_image};
#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::RtspSource;
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Failure classes a worker must tell apart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceError {
    /// No frame arrived within the bounded wait.
    Timeout(Duration),
    /// The stream is gone (connection refused, EOS, decoder error).
    Disconnected(String),
    /// The URL scheme cannot be served by this build.
    Unsupported(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Timeout(wait) => {
                write!(f, "no frame within {} ms", wait.as_millis())
            }
            SourceError::Disconnected(reason) => write!(f, "source disconnected: {}", reason),
            SourceError::Unsupported(reason) => write!(f, "source unsupported: {}", reason),
        }
    }
}

impl std::error::Error for SourceError {}

/// A camera stream as seen by a worker.
pub trait FrameSource: Send {
    /// Open the stream. Called again after any failure.
    fn connect(&mut self) -> Result<(), SourceError>;

    /// Wait at most `timeout` for the next decoded frame.
    fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame, SourceError>;

    /// Release the connection. Safe to call when not connected.
    fn disconnect(&mut self) {}

    /// Human-readable identity for logs (never includes credentials).
    fn describe(&self) -> String;
}

/// Builds a fresh source for a camera; invoked on every (re)connect attempt.
pub type SourceFactory =
    Arc<dyn Fn(&CameraConfig) -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// Open a source for the camera's URL scheme.
pub fn open_source(camera: &CameraConfig) -> Result<Box<dyn FrameSource>> {
    let url = camera.source_url();
    if url.starts_with("stub://") {
        let source = SyntheticSource::from_url(&url, camera.frame_width, camera.frame_height)?;
        return Ok(Box::new(source));
    }
    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        #[cfg(feature = "rtsp-gstreamer")]
        {
            return Ok(Box::new(RtspSource::new(&url)?));
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            return Err(SourceError::Unsupported(
                "RTSP requires the rtsp-gstreamer feature".to_string(),
            )
            .into());
        }
    }
    Err(anyhow!(
        "camera {}: unsupported source URL scheme in '{}'",
        camera.id,
        redact_credentials(&url)
    ))
}

/// Factory backed by `open_source`.
pub fn default_factory() -> SourceFactory {
    Arc::new(open_source)
}

/// Strip `user:password@` from a URL before it reaches logs or events.
pub fn redact_credentials(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", &url[..scheme_end], &rest[at + 1..]),
        None => url.to_string(),
    }
}
