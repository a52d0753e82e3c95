//! Pinhole intrinsics of the depth sensor

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Focal length, principal point and depth scale. Loaded once per device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// Focal length in pixels (x-axis).
    pub fx: f32,
    /// Focal length in pixels (y-axis).
    pub fy: f32,
    /// Principal point x (pixels).
    pub cx: f32,
    /// Principal point y (pixels).
    pub cy: f32,
    /// Multiplier from raw depth samples to output units (1.0 keeps millimetres).
    pub depth_scale: f32,
    /// Resolution the intrinsics were calibrated at.
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            depth_scale: 1.0,
            width,
            height,
        }
    }

    /// Kinect v1 depth camera at its 640x480 base resolution.
    pub fn kinect_v1() -> Self {
        Self::new(594.21, 591.04, 339.5, 242.7, 640, 480)
    }

    pub fn with_depth_scale(mut self, depth_scale: f32) -> Self {
        self.depth_scale = depth_scale;
        self
    }

    /// Rescale to a different sensor mode of the same optics.
    pub fn scaled_to(&self, width: u32, height: u32) -> Self {
        let sx = width as f32 / self.width as f32;
        let sy = height as f32 / self.height as f32;
        Self {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
            depth_scale: self.depth_scale,
            width,
            height,
        }
    }
}

/// Pinhole back-projection of pixel `(u, v)` at `depth` into camera space.
pub fn unproject(intrinsics: &CameraIntrinsics, pixel: (f32, f32), depth: f32) -> Vec3 {
    let (u, v) = pixel;
    Vec3::new(
        (u - intrinsics.cx) * depth / intrinsics.fx,
        (v - intrinsics.cy) * depth / intrinsics.fy,
        depth,
    )
}
