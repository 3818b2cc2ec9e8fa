//! RTSP frame source (feature: rtsp-gstreamer).
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! appsink` with RGB output.
//! The appsink keeps a single buffer and drops older ones, so a slow worker
//! always gets the most recent frame instead of a backlog.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::{redact_credentials, FrameSource, SourceError};
use crate::frame::{PixelFormat, RawFrame};

pub struct RtspSource {
    url: String,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
    frame_count: u64,
    last_error: Option<String>,
}

impl RtspSource {
    pub fn new(url: &str) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            url: url.to_string(),
            pipeline: None,
            appsink: None,
            frame_count: 0,
            last_error: None,
        })
    }

    fn build_pipeline(&self) -> Result<(gstreamer::Pipeline, gstreamer_app::AppSink)> {
        let description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            self.url
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok((pipeline, appsink))
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.as_ref().and_then(|p| p.bus()) else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

impl FrameSource for RtspSource {
    fn connect(&mut self) -> Result<(), SourceError> {
        self.disconnect();
        let (pipeline, appsink) = self
            .build_pipeline()
            .map_err(|e| SourceError::Disconnected(format!("{:#}", e)))?;
        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| SourceError::Disconnected(format!("set pipeline to Playing: {}", e)))?;
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        self.last_error = None;
        log::info!("RtspSource: connected to {}", self.describe());
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame, SourceError> {
        self.poll_bus();
        if let Some(err) = self.last_error.clone() {
            return Err(SourceError::Disconnected(err));
        }
        let appsink = self
            .appsink
            .as_ref()
            .ok_or_else(|| SourceError::Disconnected("not connected".to_string()))?;

        let wait = gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64);
        let Some(sample) = appsink.try_pull_sample(wait) else {
            if appsink.is_eos() {
                return Err(SourceError::Disconnected("end of stream".to_string()));
            }
            return Err(SourceError::Timeout(timeout));
        };

        let (pixels, width, height) = sample_to_pixels(&sample)
            .map_err(|e| SourceError::Disconnected(format!("{:#}", e)))?;
        self.frame_count += 1;

        Ok(RawFrame::new(
            width,
            height,
            PixelFormat::Rgb24,
            pixels,
            crate::now_ms(),
        ))
    }

    fn disconnect(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("RtspSource: failed to stop {}: {}", self.describe(), e);
            }
            log::info!(
                "RtspSource: disconnected from {} after {} frames",
                self.describe(),
                self.frame_count
            );
        }
        self.appsink = None;
    }

    fn describe(&self) -> String {
        redact_credentials(&self.url)
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let frame = data
            .get(..row_bytes * height as usize)
            .context("RTSP buffer shorter than frame")?;
        return Ok((frame.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
