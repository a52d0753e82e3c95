//! Error taxonomy shared by every pipeline stage

use crate::pipeline::graph::State;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// No registered conversion for the pixel format, or the buffer does not
    /// match its declared geometry. The frame is dropped, the pipeline goes on.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The resource is still owned by GPU work that has not completed.
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// Sensor data outside its valid domain.
    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("GPU context lost: {0}")]
    GpuContextLost(String),

    /// HMD or depth sensor absent.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("invalid state change from {from:?} to {to:?}")]
    InvalidStateChange { from: State, to: State },

    #[error("invalid pipeline graph: {0}")]
    InvalidGraph(String),

    #[error("timed out after {0} ms waiting for {1}")]
    Timeout(u64, String),

    #[error("stale resource handle {index}#{generation}")]
    StaleHandle { index: u32, generation: u32 },

    #[error("source failed: {0}")]
    Source(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl PipelineError {
    /// Session-level conditions that move the pipeline to `Error`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::GpuContextLost(_) | PipelineError::Source(_)
        )
    }

    /// Conditions a caller should retry after waiting on a completion fence.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::ResourceBusy(_))
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        PipelineError::UnsupportedFormat(reason.into())
    }

    pub fn timeout(waited: std::time::Duration, what: impl Into<String>) -> Self {
        PipelineError::Timeout(waited.as_millis() as u64, what.into())
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::Config(err.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        PipelineError::Io(err.to_string())
    }
}
