//! Still image played back as a short video: `file:///path/image.png?repeat=90&fps=30`

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::frame::{PixelFormat, RawImage};
use crate::source::{parse_param, split_query, FrameSource, SourceItem};

pub struct ImageSource {
    path: PathBuf,
    image: RawImage,
    repeat: u64,
    frame_duration: Duration,
    emitted: u64,
}

impl ImageSource {
    pub fn open(path: impl AsRef<Path>, repeat: u64, fps: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let decoded = image::open(&path)?.to_rgba8();
        let (width, height) = decoded.dimensions();
        debug!(path = %path.display(), width, height, "decoded still image");
        Ok(Self {
            image: RawImage::new(decoded.into_raw(), width, height, PixelFormat::Rgba8),
            path,
            repeat: repeat.max(1),
            frame_duration: Duration::from_secs(1) / fps.max(1),
            emitted: 0,
        })
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("file://")
            .ok_or_else(|| PipelineError::Config(format!("not a file URI: {uri}")))?;
        let (path, params) = split_query(rest);
        let (mut repeat, mut fps) = (1, 30);
        for (key, value) in params {
            match key {
                "repeat" => repeat = parse_param(key, value)?,
                "fps" => fps = parse_param(key, value)?,
                other => {
                    return Err(PipelineError::Config(format!(
                        "unknown image source parameter {other}"
                    )))
                }
            }
        }
        Self::open(path, repeat, fps)
    }
}

impl FrameSource for ImageSource {
    fn next_item(&mut self) -> Result<Option<SourceItem>> {
        if self.emitted >= self.repeat {
            return Ok(None);
        }
        let frame = self
            .image
            .clone()
            .with_pts(self.frame_duration * self.emitted as u32)
            .with_duration(self.frame_duration);
        self.emitted += 1;
        Ok(Some(SourceItem::Video(frame)))
    }

    fn describe(&self) -> String {
        format!("image {}", self.path.display())
    }
}
