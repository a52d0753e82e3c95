//! Frame sources feeding the pipeline

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_source;
pub mod pattern;
pub mod still;

use std::collections::VecDeque;

use tracing::info;

use crate::error::{PipelineError, Result};
use crate::frame::RawImage;

pub use pattern::TestPatternSource;
pub use still::ImageSource;

/// One unit of source output.
#[derive(Debug, Clone)]
pub enum SourceItem {
    /// Decoded mono video frame
    Video(RawImage),
    /// Independently rendered eye views
    StereoPair { left: RawImage, right: RawImage },
    /// Depth sensor frame, `Depth16`
    Depth(RawImage),
    /// Colour frame registered to the depth sensor
    Color(RawImage),
}

/// Anything that yields frames at its own rate.
pub trait FrameSource: Send {
    /// Next item, or `None` at end of stream. May block until one is ready.
    fn next_item(&mut self) -> Result<Option<SourceItem>>;

    fn describe(&self) -> String {
        "source".into()
    }
}

/// Where a pipeline gets its frames from.
pub enum SourceSpec {
    /// `testsrc://`, `file://` or, with GStreamer, any decodable URI
    Uri(String),
    Source(Box<dyn FrameSource>),
}

impl std::fmt::Debug for SourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceSpec::Uri(uri) => f.debug_tuple("Uri").field(uri).finish(),
            SourceSpec::Source(source) => f.debug_tuple("Source").field(&source.describe()).finish(),
        }
    }
}

impl From<&str> for SourceSpec {
    fn from(uri: &str) -> Self {
        SourceSpec::Uri(uri.to_string())
    }
}

impl SourceSpec {
    pub fn source(source: impl FrameSource + 'static) -> Self {
        SourceSpec::Source(Box::new(source))
    }
}

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Opens a source for `uri`, dispatching on its scheme.
pub fn open_uri(uri: &str) -> Result<Box<dyn FrameSource>> {
    info!(uri, "opening source");
    if uri.starts_with("testsrc://") {
        return Ok(Box::new(TestPatternSource::from_uri(uri)?));
    }
    if let Some(rest) = uri.strip_prefix("file://") {
        let (path, _) = split_query(rest);
        let is_image = std::path::Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if is_image {
            return Ok(Box::new(ImageSource::from_uri(uri)?));
        }
    }
    open_decoded(uri)
}

#[cfg(feature = "gstreamer-pipeline")]
fn open_decoded(uri: &str) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(gst_source::GstUriSource::new(uri)?))
}

#[cfg(not(feature = "gstreamer-pipeline"))]
fn open_decoded(uri: &str) -> Result<Box<dyn FrameSource>> {
    Err(PipelineError::DeviceNotFound(format!(
        "no source for {uri}: decoding requires the gstreamer-pipeline feature"
    )))
}

/// Splits `path?a=1&b=2` into the path and its key/value pairs.
pub(crate) fn split_query(uri: &str) -> (&str, Vec<(&str, &str)>) {
    match uri.split_once('?') {
        Some((path, query)) => (
            path,
            query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
                .collect(),
        ),
        None => (uri, Vec::new()),
    }
}

pub(crate) fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| PipelineError::Config(format!("invalid value {value:?} for {key}")))
}

/// In-memory source, mainly for embedding and tests.
pub struct VecSource {
    items: VecDeque<SourceItem>,
    error: Option<String>,
}

impl VecSource {
    pub fn new(items: impl IntoIterator<Item = SourceItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
            error: None,
        }
    }

    /// Fails with `cause` once the items are exhausted instead of ending.
    pub fn then_fail(mut self, cause: impl Into<String>) -> Self {
        self.error = Some(cause.into());
        self
    }
}

impl FrameSource for VecSource {
    fn next_item(&mut self) -> Result<Option<SourceItem>> {
        match self.items.pop_front() {
            Some(item) => Ok(Some(item)),
            None => match self.error.take() {
                Some(cause) => Err(PipelineError::Source(cause)),
                None => Ok(None),
            },
        }
    }

    fn describe(&self) -> String {
        format!("vec source ({} items left)", self.items.len())
    }
}
