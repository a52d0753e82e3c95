use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use glam::Mat4;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::gpu::arena::{FrameArena, FrameHandle};
use crate::gpu::fence::{Fence, FenceState};
use crate::math::lens::LensProfile;

/// Immutable image handed between stages. Cloning shares the same storage;
/// the underlying device slot is released when the last clone drops.
#[derive(Clone)]
pub struct Frame {
    storage: Arc<FrameStorage>,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Creation time for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub format: PixelFormat,
    pub residency: Residency,
    /// Presentation timestamp relative to the source epoch
    pub pts: Duration,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Residency {
    Host,
    Device,
}

/// Pixel formats we recognise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
    Rgb24,
    Bgr24,
    Gray8,
    /// Little-endian u16 depth samples
    Depth16,
    Mjpeg,
    Yuyv4,
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` for compressed or planar ones.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => Some(4),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Depth16 | PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Mjpeg | PixelFormat::Nv12 => None,
        }
    }
}

enum FrameStorage {
    Host(Bytes),
    Device {
        arena: Arc<FrameArena>,
        handle: FrameHandle,
        fence: Fence,
    },
}

impl Drop for FrameStorage {
    fn drop(&mut self) {
        if let FrameStorage::Device { arena, handle, .. } = self {
            arena.release(*handle);
        }
    }
}

/// CPU-side image as delivered by a source, before upload.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pts: Duration,
    pub duration: Option<Duration>,
}

impl RawImage {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            format,
            pts: Duration::ZERO,
            duration: None,
        }
    }

    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

impl Frame {
    /// Host-resident frame, readable immediately.
    pub fn host(data: Bytes, meta: FrameMetadata) -> Self {
        let meta = FrameMetadata {
            residency: Residency::Host,
            ..meta
        };
        Self {
            storage: Arc::new(FrameStorage::Host(data)),
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    /// Device-resident frame backed by an arena slot and guarded by `fence`.
    pub(crate) fn device(
        arena: Arc<FrameArena>,
        handle: FrameHandle,
        fence: Fence,
        meta: FrameMetadata,
    ) -> Self {
        let meta = FrameMetadata {
            residency: Residency::Device,
            ..meta
        };
        Self {
            storage: Arc::new(FrameStorage::Device {
                arena,
                handle,
                fence,
            }),
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    pub fn residency(&self) -> Residency {
        self.meta.residency
    }

    pub fn handle(&self) -> Option<FrameHandle> {
        match &*self.storage {
            FrameStorage::Device { handle, .. } => Some(*handle),
            FrameStorage::Host(_) => None,
        }
    }

    /// Completion signal of the work producing this frame. Host frames are
    /// always complete.
    pub fn fence(&self) -> Fence {
        match &*self.storage {
            FrameStorage::Device { fence, .. } => fence.clone(),
            FrameStorage::Host(_) => Fence::signaled(),
        }
    }

    /// True when both handles refer to the same storage.
    pub fn shares_storage(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Temporary CPU view. Fails with `ResourceBusy` while GPU work on the
    /// frame is still in flight.
    pub fn map(&self) -> Result<MappedFrame> {
        let data = match &*self.storage {
            FrameStorage::Host(data) => data.clone(),
            FrameStorage::Device {
                arena,
                handle,
                fence,
            } => match fence.state() {
                FenceState::Pending => {
                    return Err(PipelineError::ResourceBusy(format!(
                        "frame {} is still being produced",
                        self.meta.sequence
                    )))
                }
                FenceState::Failed => {
                    return Err(PipelineError::GpuContextLost(format!(
                        "work producing frame {} failed",
                        self.meta.sequence
                    )))
                }
                FenceState::Signaled => arena.get(*handle)?,
            },
        };
        Ok(MappedFrame {
            data,
            meta: self.meta.clone(),
        })
    }

    /// Waits on the completion fence, then maps.
    pub fn map_wait(&self, timeout: Duration) -> Result<MappedFrame> {
        if self.fence().wait_timeout(timeout) == FenceState::Pending {
            return Err(PipelineError::timeout(
                timeout,
                format!("frame {}", self.meta.sequence),
            ));
        }
        self.map()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("handle", &self.handle())
            .finish()
    }
}

/// Read-only CPU view of a frame's pixels.
pub struct MappedFrame {
    data: Bytes,
    pub meta: Arc<FrameMetadata>,
}

impl MappedFrame {
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Row-major pixel slice of a packed format.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.meta.format.bytes_per_pixel().unwrap_or(1);
        let offset = y as usize * self.meta.stride as usize + x as usize * bpp;
        &self.data[offset..offset + bpp]
    }
}

impl Deref for MappedFrame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Eye {
    Left,
    Right,
    Mono,
}

impl Eye {
    /// Lateral direction of the eye relative to the head centre.
    pub fn sign(self) -> f32 {
        match self {
            Eye::Left => -1.0,
            Eye::Right => 1.0,
            Eye::Mono => 0.0,
        }
    }
}

/// Parameters a stereo frame was produced with.
#[derive(Debug, Clone)]
pub struct EyeParams {
    pub projection: Mat4,
    pub view: Mat4,
    pub lens: Option<Arc<LensProfile>>,
}

impl Default for EyeParams {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            lens: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StereoFrame {
    pub frame: Frame,
    pub eye: Eye,
    pub params: Arc<EyeParams>,
}

impl StereoFrame {
    pub fn new(frame: Frame, eye: Eye) -> Self {
        Self {
            frame,
            eye,
            params: Arc::new(EyeParams::default()),
        }
    }

    pub fn with_params(mut self, params: Arc<EyeParams>) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StereoLayout {
    Separate,
    #[default]
    SideBySide,
    OverUnder,
}

/// What the compositor and warp stages emit per tick.
#[derive(Debug, Clone)]
pub enum StereoOutput {
    Separate { left: StereoFrame, right: StereoFrame },
    Packed { frame: Frame, layout: StereoLayout },
}

impl StereoOutput {
    pub fn layout(&self) -> StereoLayout {
        match self {
            StereoOutput::Separate { .. } => StereoLayout::Separate,
            StereoOutput::Packed { layout, .. } => *layout,
        }
    }

    pub fn frames(&self) -> Vec<&Frame> {
        match self {
            StereoOutput::Separate { left, right } => vec![&left.frame, &right.frame],
            StereoOutput::Packed { frame, .. } => vec![frame],
        }
    }

    pub fn pts(&self) -> Duration {
        self.frames()
            .first()
            .map(|frame| frame.meta.pts)
            .unwrap_or_default()
    }

    pub fn sequence(&self) -> u64 {
        self.frames()
            .first()
            .map(|frame| frame.meta.sequence)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(width: u32, height: u32) -> FrameMetadata {
        FrameMetadata {
            sequence: 7,
            width,
            height,
            stride: width * 4,
            format: PixelFormat::Rgba8,
            residency: Residency::Device,
            pts: Duration::from_millis(40),
            duration: None,
        }
    }

    #[test]
    fn test_map_busy_until_fence_signals() {
        let arena = Arc::new(FrameArena::new());
        let handle = arena.allocate_pending();
        let fence = Fence::pending();
        let frame = Frame::device(arena.clone(), handle, fence.clone(), meta(1, 1));

        assert!(matches!(frame.map(), Err(PipelineError::ResourceBusy(_))));

        arena.fill(handle, Bytes::from_static(&[1, 2, 3, 4])).unwrap();
        fence.signal();
        let view = frame.map().unwrap();
        assert_eq!(view.pixel(0, 0), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_last_clone_releases_slot() {
        let arena = Arc::new(FrameArena::new());
        let handle = arena.allocate(Bytes::from_static(&[0; 4]));
        let frame = Frame::device(arena.clone(), handle, Fence::signaled(), meta(1, 1));
        let branch_copy = frame.clone();

        drop(frame);
        assert_eq!(arena.live_count(), 1);
        drop(branch_copy);
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn test_host_frame_is_always_mappable() {
        let frame = Frame::host(Bytes::from_static(&[9; 8]), meta(2, 1));
        assert_eq!(frame.residency(), Residency::Host);
        assert!(frame.fence().is_signaled());
        assert_eq!(frame.map().unwrap().len(), 8);
    }
}
