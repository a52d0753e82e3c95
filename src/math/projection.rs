use glam::{Mat4, Vec3};

use crate::frame::Eye;

/// Right-handed perspective projection with a [0, 1] depth range.
pub fn projection_matrix(fov_y_rad: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    Mat4::perspective_rh(fov_y_rad, aspect, near, far)
}

/// Eye position in head space, metres. Left eye sits at -IPD/2.
pub fn eye_position(eye: Eye, ipd_mm: f32) -> Vec3 {
    Vec3::new(eye.sign() * ipd_mm * 0.0005, 0.0, 0.0)
}

/// View matrix of a head-centred camera laterally offset for `eye`.
pub fn eye_view(eye: Eye, ipd_mm: f32) -> Mat4 {
    Mat4::from_translation(-eye_position(eye, ipd_mm))
}
