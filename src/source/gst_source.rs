//! URI decoding through GStreamer: `uridecodebin ! videoconvert ! appsink`

use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::frame::{PixelFormat, RawImage};
use crate::source::{FrameSource, SourceItem};

/// How long one pull waits before the caller gets a chance to stop
const PULL_TIMEOUT: Duration = Duration::from_millis(500);

pub struct GstUriSource {
    uri: String,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    started: bool,
}

impl GstUriSource {
    pub fn new(uri: &str) -> Result<Self> {
        gst::init().map_err(|e| PipelineError::Source(format!("failed to initialize GStreamer: {e}")))?;

        let description = format!(
            "uridecodebin uri={uri} ! \
             queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! \
             videoconvert ! \
             video/x-raw,format=RGBA ! \
             appsink name=appsink"
        );
        info!("Pipeline: {}", description);

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| PipelineError::Source(format!("failed to build decode pipeline: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| PipelineError::Source("decode description is not a pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| PipelineError::Source("appsink element missing".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| PipelineError::Source("appsink has the wrong type".into()))?;

        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 3u32);
        // pacing is done by the pipeline queues, not here
        appsink.set_property("drop", false);
        appsink.set_property("sync", true);

        Ok(Self {
            uri: uri.to_string(),
            pipeline,
            appsink,
            started: false,
        })
    }

    fn start(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| PipelineError::Source(format!("failed to start decoding: {e:?}")))?;
        self.started = true;
        debug!(uri = %self.uri, "decode pipeline playing");
        Ok(())
    }

    /// Surfaces the first error posted on the decode pipeline bus.
    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Warning]) {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    return Err(PipelineError::Source(format!(
                        "{} ({:?})",
                        err.error(),
                        err.debug()
                    )));
                }
                gst::MessageView::Warning(w) => warn!(uri = %self.uri, "decoder warning: {}", w.error()),
                _ => {}
            }
        }
        Ok(())
    }

    fn to_raw(sample: &gst::Sample) -> Result<RawImage> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| PipelineError::Source("sample contains no buffer".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| PipelineError::Source("sample has no caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| PipelineError::unsupported("failed to parse video info from caps"))?;
        let map = buffer
            .map_readable()
            .map_err(|_| PipelineError::Source("failed to map buffer".into()))?;

        let (width, height) = (info.width(), info.height());
        let row = width as usize * 4;
        let stride = info.stride()[0] as usize;
        let data = if stride == row {
            map.as_slice()[..row * height as usize].to_vec()
        } else {
            map.as_slice()
                .chunks(stride)
                .take(height as usize)
                .flat_map(|line| &line[..row])
                .copied()
                .collect()
        };

        let mut raw = RawImage::new(data, width, height, PixelFormat::Rgba8);
        if let Some(pts) = buffer.pts() {
            raw = raw.with_pts(Duration::from_nanos(pts.nseconds()));
        }
        if let Some(duration) = buffer.duration() {
            raw = raw.with_duration(Duration::from_nanos(duration.nseconds()));
        }
        Ok(raw)
    }
}

impl FrameSource for GstUriSource {
    fn next_item(&mut self) -> Result<Option<SourceItem>> {
        if !self.started {
            self.start()?;
        }
        self.check_bus()?;

        let timeout = gst::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64);
        match self.appsink.try_pull_sample(timeout) {
            Some(sample) => Ok(Some(SourceItem::Video(Self::to_raw(&sample)?))),
            None if self.appsink.is_eos() => Ok(None),
            None => Err(PipelineError::timeout(PULL_TIMEOUT, "decoded sample")),
        }
    }

    fn describe(&self) -> String {
        format!("gstreamer {}", self.uri)
    }
}

impl Drop for GstUriSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
