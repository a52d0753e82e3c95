//! Synthetic test pattern source
//!
//! `testsrc://?width=640&height=360&fps=30&frames=300&stereo&depth&live`

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{PipelineError, Result};
use crate::frame::{PixelFormat, RawImage};
use crate::source::{parse_param, split_query, FrameSource, SourceItem};

/// Depth of the synthetic plane in millimetres
const PLANE_DEPTH_MM: u16 = 1500;

#[derive(Debug, Clone)]
pub struct TestPatternSource {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// `None` runs until the pipeline stops
    pub frames: Option<u64>,
    /// Emit left/right pairs instead of mono frames
    pub stereo: bool,
    /// Also emit registered colour + depth frames
    pub depth: bool,
    /// Pace output to `fps` in wall-clock time
    pub live: bool,
    emitted: u64,
    started: Option<Instant>,
    pending: VecDeque<SourceItem>,
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            fps: 30,
            frames: Some(300),
            stereo: false,
            depth: false,
            live: false,
            emitted: 0,
            started: None,
            pending: VecDeque::new(),
        }
    }
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, frames: u64) -> Self {
        Self {
            width,
            height,
            frames: Some(frames),
            ..Self::default()
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("testsrc://")
            .ok_or_else(|| PipelineError::Config(format!("not a test source URI: {uri}")))?;
        let (_, params) = split_query(rest);
        let mut source = Self::default();
        for (key, value) in params {
            match key {
                "width" => source.width = parse_param(key, value)?,
                "height" => source.height = parse_param(key, value)?,
                "fps" => source.fps = parse_param::<u32>(key, value)?.max(1),
                "frames" => {
                    let frames: u64 = parse_param(key, value)?;
                    source.frames = (frames > 0).then_some(frames);
                }
                "stereo" => source.stereo = true,
                "depth" => source.depth = true,
                "live" => source.live = true,
                other => {
                    return Err(PipelineError::Config(format!(
                        "unknown test source parameter {other}"
                    )))
                }
            }
        }
        if source.width == 0 || source.height == 0 {
            return Err(PipelineError::Config("test source needs a non-empty size".into()));
        }
        Ok(source)
    }

    fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    /// Moving diagonal gradient; `phase` shifts it horizontally.
    fn gradient(&self, phase: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity((self.width * self.height * 4) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let sx = x.wrapping_add(phase);
                data.extend_from_slice(&[
                    (sx * 255 / self.width.max(1)) as u8,
                    (y * 255 / self.height.max(1)) as u8,
                    ((sx + y) % 256) as u8,
                    255,
                ]);
            }
        }
        data
    }

    /// A tilted plane around `PLANE_DEPTH_MM`, invalid along the top row.
    fn depth_plane(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity((self.width * self.height * 2) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let d = if y == 0 { 0 } else { PLANE_DEPTH_MM + (x % 100) as u16 };
                data.extend_from_slice(&d.to_le_bytes());
            }
        }
        data
    }

    fn produce(&mut self) {
        let pts = self.frame_duration() * self.emitted as u32;
        let duration = self.frame_duration();
        let phase = self.emitted as u32 * 4;
        let image = |data: Vec<u8>, format| {
            RawImage::new(data, self.width, self.height, format)
                .with_pts(pts)
                .with_duration(duration)
        };

        let item = if self.stereo {
            SourceItem::StereoPair {
                left: image(self.gradient(phase), PixelFormat::Rgba8),
                right: image(self.gradient(phase + 8), PixelFormat::Rgba8),
            }
        } else {
            SourceItem::Video(image(self.gradient(phase), PixelFormat::Rgba8))
        };
        let mut items = vec![item];
        if self.depth {
            items.push(SourceItem::Color(image(self.gradient(phase), PixelFormat::Rgba8)));
            items.push(SourceItem::Depth(image(self.depth_plane(), PixelFormat::Depth16)));
        }
        self.pending.extend(items);
        self.emitted += 1;
    }
}

impl FrameSource for TestPatternSource {
    fn next_item(&mut self) -> Result<Option<SourceItem>> {
        if let Some(item) = self.pending.pop_front() {
            return Ok(Some(item));
        }
        if self.frames.is_some_and(|limit| self.emitted >= limit) {
            return Ok(None);
        }

        if self.live {
            let started = *self.started.get_or_insert_with(Instant::now);
            let due = started + self.frame_duration() * self.emitted as u32;
            if let Some(wait) = due.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }
        self.produce();
        Ok(self.pending.pop_front())
    }

    fn describe(&self) -> String {
        format!(
            "test pattern {}x{}@{} ({} emitted)",
            self.width, self.height, self.fps, self.emitted
        )
    }
}
