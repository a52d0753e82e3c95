//! Stateless camera and lens math

pub mod intrinsics;
pub mod lens;
pub mod projection;

pub use intrinsics::{unproject, CameraIntrinsics};
pub use lens::{
    distortion_map, forward_distort, ChromaticCoefficients, ColorChannel, LensProfile,
    RadialCoefficients, SolverSettings,
};
pub use projection::{eye_view, projection_matrix};
