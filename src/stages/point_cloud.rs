//! Depth + colour fusion into coloured point clouds

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{PipelineError, Result};
use crate::frame::{Frame, MappedFrame, PixelFormat};
use crate::math::intrinsics::{unproject, CameraIntrinsics};
use crate::stages::raster::{self, RgbaView};
use crate::PointCloudConfig;

/// Colour frames remembered for timestamp matching
const COLOR_HISTORY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorSampling {
    #[default]
    Nearest,
    Bilinear,
}

/// GPU-compatible point layout (16 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Point {
    pub position: [f32; 3],
    pub color: [u8; 4],
}

/// Points of one depth frame in row-major pixel order. Invalid depth pixels
/// are omitted, so `len()` is the valid pixel count.
#[derive(Debug, Clone)]
pub struct PointCloudBuffer {
    pub points: Arc<[Point]>,
    pub pts: Duration,
    pub sequence: u64,
    /// Depth frame geometry
    pub width: u32,
    pub height: u32,
    /// False when no colour frame fell inside the tolerance window
    pub color_matched: bool,
    pub created: Instant,
}

impl PointCloudBuffer {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.points)
    }
}

/// Depth frame waiting for its colour frame
struct PendingDepth {
    frame: Frame,
    deadline: Instant,
}

pub struct PointCloudBuilder {
    intrinsics: CameraIntrinsics,
    config: PointCloudConfig,
    wait_timeout: Duration,
    colors: VecDeque<Frame>,
    pending: Option<PendingDepth>,
}

impl PointCloudBuilder {
    pub fn new(intrinsics: CameraIntrinsics, config: PointCloudConfig, wait_timeout: Duration) -> Self {
        Self {
            intrinsics,
            config,
            wait_timeout,
            colors: VecDeque::with_capacity(COLOR_HISTORY),
            pending: None,
        }
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    /// Remembers a colour frame for later depth frames.
    pub fn push_color(&mut self, color: Frame) -> Result<()> {
        if color.format() != PixelFormat::Rgba8 {
            return Err(PipelineError::unsupported(format!(
                "colour frame must be RGBA8, got {:?}",
                color.format()
            )));
        }
        if self.colors.len() == COLOR_HISTORY {
            self.colors.pop_front();
        }
        self.colors.push_back(color);
        Ok(())
    }

    /// Drops remembered colour frames and any waiting depth frame.
    pub fn clear(&mut self) {
        self.colors.clear();
        self.pending = None;
    }

    fn tolerance(&self) -> Duration {
        Duration::from_millis(self.config.depth_color_tolerance_ms)
    }

    /// Holds `depth` back until a colour frame at or after its timestamp is
    /// known, or until the tolerance window has passed in wall-clock time.
    /// A newer depth frame releases the one still waiting.
    pub fn push_depth(&mut self, depth: Frame, now: Instant) -> Result<Vec<PointCloudBuffer>> {
        if depth.format() != PixelFormat::Depth16 {
            return Err(PipelineError::unsupported(format!(
                "depth frame must be Depth16, got {:?}",
                depth.format()
            )));
        }
        let waiting = PendingDepth {
            frame: depth,
            deadline: now + self.tolerance(),
        };
        let mut clouds = Vec::new();
        if let Some(older) = self.pending.replace(waiting) {
            clouds.push(self.build(&older.frame)?);
        }
        clouds.extend(self.poll(now)?);
        Ok(clouds)
    }

    /// Builds the waiting depth frame once it can no longer get a better
    /// colour match.
    pub fn poll(&mut self, now: Instant) -> Result<Option<PointCloudBuffer>> {
        let ready = self.pending.as_ref().is_some_and(|waiting| {
            now >= waiting.deadline
                || self
                    .colors
                    .iter()
                    .any(|color| color.meta.pts >= waiting.frame.meta.pts)
        });
        if ready {
            self.flush()
        } else {
            Ok(None)
        }
    }

    /// Builds the waiting depth frame with whatever colour is known.
    pub fn flush(&mut self) -> Result<Option<PointCloudBuffer>> {
        match self.pending.take() {
            Some(waiting) => self.build(&waiting.frame).map(Some),
            None => Ok(None),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Colour frame closest in time to `pts`, if within tolerance.
    fn matching_color(&self, pts: Duration) -> Option<&Frame> {
        let tolerance = self.tolerance();
        self.colors
            .iter()
            .map(|frame| (frame.meta.pts.abs_diff(pts), frame))
            .filter(|(delta, _)| *delta <= tolerance)
            .min_by_key(|(delta, _)| *delta)
            .map(|(_, frame)| frame)
    }

    #[instrument(skip(self, depth), fields(seq = depth.meta.sequence))]
    pub fn build(&self, depth: &Frame) -> Result<PointCloudBuffer> {
        if depth.format() != PixelFormat::Depth16 {
            return Err(PipelineError::unsupported(format!(
                "depth frame must be Depth16, got {:?}",
                depth.format()
            )));
        }
        let (width, height) = (depth.width(), depth.height());
        let intrinsics = if (self.intrinsics.width, self.intrinsics.height) == (width, height) {
            self.intrinsics
        } else {
            self.intrinsics.scaled_to(width, height)
        };

        let depth_view = depth.map_wait(self.wait_timeout)?;
        let color = match self.matching_color(depth.meta.pts) {
            Some(frame) => Some(frame.map_wait(self.wait_timeout)?),
            None => None,
        };
        let color_view = color.as_ref().map(rgba_view);

        let mut points = Vec::with_capacity(width as usize * height as usize);
        let mut rejected = 0usize;
        let stride = depth.meta.stride as usize;

        for v in 0..height {
            let row = &depth_view[v as usize * stride..v as usize * stride + width as usize * 2];
            for (u, sample) in row.chunks_exact(2).enumerate() {
                let raw = u16::from_le_bytes([sample[0], sample[1]]);
                let Some(z) = scaled_depth(raw, intrinsics.depth_scale, &self.config) else {
                    rejected += 1;
                    continue;
                };
                let position = unproject(&intrinsics, (u as f32, v as f32), z);
                let uv = Vec2::new(
                    (u as f32 + 0.5) / width as f32,
                    (v as f32 + 0.5) / height as f32,
                );
                let color = match &color_view {
                    Some(view) => self.sample(view, uv),
                    None => self.config.default_color,
                };
                points.push(Point {
                    position: position.to_array(),
                    color,
                });
            }
        }

        if rejected > 0 {
            debug!(rejected, "filtered out-of-range depth samples");
        }
        metrics::counter!("vrcast_points_emitted").increment(points.len() as u64);

        Ok(PointCloudBuffer {
            points: points.into(),
            pts: depth.meta.pts,
            sequence: depth.meta.sequence,
            width,
            height,
            color_matched: color.is_some(),
            created: Instant::now(),
        })
    }

    fn sample(&self, view: &RgbaView<'_>, uv: Vec2) -> [u8; 4] {
        match self.config.sampling {
            ColorSampling::Nearest => view.sample_nearest(uv),
            ColorSampling::Bilinear => view.sample_bilinear(uv).map(raster::to_u8),
        }
    }
}

/// Scales a raw depth sample and checks it against the valid sensor range.
pub fn check_depth(raw: u16, scale: f32, config: &PointCloudConfig) -> Result<f32> {
    scaled_depth(raw, scale, config).ok_or_else(|| {
        PipelineError::OutOfRange(format!(
            "depth {} outside [{}, {}]",
            raw as f32 * scale,
            config.min_depth,
            config.max_depth
        ))
    })
}

fn scaled_depth(raw: u16, scale: f32, config: &PointCloudConfig) -> Option<f32> {
    let z = raw as f32 * scale;
    (raw != 0 && (config.min_depth..=config.max_depth).contains(&z)).then_some(z)
}

fn rgba_view(frame: &MappedFrame) -> RgbaView<'_> {
    RgbaView {
        data: &frame[..],
        width: frame.meta.width,
        height: frame.meta.height,
        stride: frame.meta.stride as usize,
    }
}
