//! Radial lens distortion model and its numeric inverse
//!
//! The forward model maps an ideal image radius to the panel radius it must
//! be drawn at: `D(r) = r * (k0 + k1 r^2 + k2 r^4 + k3 r^6)`. Radii are in
//! lens space, where the vertical half-extent of an eye viewport is 1.

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::frame::Eye;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorChannel {
    Red,
    Green,
    Blue,
}

impl ColorChannel {
    pub const ALL: [ColorChannel; 3] = [ColorChannel::Red, ColorChannel::Green, ColorChannel::Blue];
}

/// Polynomial coefficients `[k0, k1, k2, k3]` of the forward model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadialCoefficients(pub [f32; 4]);

impl RadialCoefficients {
    pub const IDENTITY: RadialCoefficients = RadialCoefficients([1.0, 0.0, 0.0, 0.0]);

    /// Radial scale factor for a squared radius.
    pub fn scale(&self, r2: f32) -> f32 {
        let [k0, k1, k2, k3] = self.0;
        k0 + r2 * (k1 + r2 * (k2 + r2 * k3))
    }

    pub fn forward_radius(&self, r: f32) -> f32 {
        r * self.scale(r * r)
    }

    /// dD/dr
    pub fn derivative(&self, r: f32) -> f32 {
        let [k0, k1, k2, k3] = self.0;
        let r2 = r * r;
        k0 + r2 * (3.0 * k1 + r2 * (5.0 * k2 + r2 * 7.0 * k3))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChromaticCoefficients {
    pub red: RadialCoefficients,
    pub green: RadialCoefficients,
    pub blue: RadialCoefficients,
}

impl ChromaticCoefficients {
    pub fn uniform(coefficients: RadialCoefficients) -> Self {
        Self {
            red: coefficients,
            green: coefficients,
            blue: coefficients,
        }
    }
}

/// Per-HMD optical constants. Immutable once loaded and shared by reference
/// across every warp invocation of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LensProfile {
    pub name: String,
    /// Full panel resolution covering both eyes
    pub panel_resolution: [u32; 2],
    /// Per-eye pre-warp render resolution
    pub render_resolution: [u32; 2],
    /// Physical panel size in metres
    pub screen_size_m: [f32; 2],
    pub lens_separation_m: f32,
    pub fov_y_deg: f32,
    pub distortion: ChromaticCoefficients,
}

impl LensProfile {
    /// A distortion-free profile with lenses centred in each eye viewport.
    pub fn identity(panel_width: u32, panel_height: u32) -> Self {
        Self {
            name: "identity".into(),
            panel_resolution: [panel_width, panel_height],
            render_resolution: [panel_width / 2, panel_height],
            screen_size_m: [0.12, 0.07],
            lens_separation_m: 0.06,
            fov_y_deg: 90.0,
            distortion: ChromaticCoefficients::uniform(RadialCoefficients::IDENTITY),
        }
    }

    /// Output size of one eye after warping.
    pub fn eye_panel_size(&self) -> (u32, u32) {
        (self.panel_resolution[0] / 2, self.panel_resolution[1])
    }

    /// Lens centre in normalised coordinates of the eye viewport.
    pub fn lens_center(&self, eye: Eye) -> Vec2 {
        let offset = self.lens_separation_m / self.screen_size_m[0];
        match eye {
            Eye::Left => Vec2::new(1.0 - offset, 0.5),
            Eye::Right => Vec2::new(offset, 0.5),
            Eye::Mono => Vec2::new(0.5, 0.5),
        }
    }

    /// Coefficients for `channel`; green for every channel when chromatic
    /// correction is off.
    pub fn coefficients(&self, channel: ColorChannel, chromatic: bool) -> RadialCoefficients {
        if !chromatic {
            return self.distortion.green;
        }
        match channel {
            ColorChannel::Red => self.distortion.red,
            ColorChannel::Green => self.distortion.green,
            ColorChannel::Blue => self.distortion.blue,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let [w, h] = self.panel_resolution;
        if w < 2 || h == 0 || self.render_resolution.contains(&0) {
            return Err(PipelineError::Config(format!(
                "lens profile {} has empty resolution",
                self.name
            )));
        }
        if self.screen_size_m[0] <= 0.0 || self.screen_size_m[1] <= 0.0 {
            return Err(PipelineError::Config(format!(
                "lens profile {} has non-positive screen size",
                self.name
            )));
        }
        for channel in ColorChannel::ALL {
            if self.coefficients(channel, true).0[0] <= 0.0 {
                return Err(PipelineError::Config(format!(
                    "lens profile {}: k0 for {:?} must be positive",
                    self.name, channel
                )));
            }
        }
        Ok(())
    }
}

/// Tunables of the inverse solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    pub max_iterations: u32,
    pub epsilon: f32,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            epsilon: 1e-5,
        }
    }
}

/// Applies the forward model to a lens-space coordinate.
pub fn forward_distort(coefficients: RadialCoefficients, coord: Vec2) -> Vec2 {
    coord * coefficients.scale(coord.length_squared())
}

/// Solves `D(r') = r` with Newton's method. Returns the best estimate after
/// `max_iterations` rather than failing.
pub fn inverse_radius(coefficients: RadialCoefficients, r: f32, settings: SolverSettings) -> f32 {
    let k0 = coefficients.0[0];
    let mut estimate = if k0 > f32::EPSILON { r / k0 } else { r };
    for _ in 0..settings.max_iterations {
        let residual = coefficients.forward_radius(estimate) - r;
        if residual.abs() < settings.epsilon {
            break;
        }
        let slope = coefficients.derivative(estimate);
        if slope <= f32::EPSILON {
            break;
        }
        estimate -= residual / slope;
    }
    estimate
}

/// Inverse distortion of a lens-space coordinate for one colour channel.
pub fn distortion_map(
    profile: &LensProfile,
    channel: ColorChannel,
    coord: Vec2,
    settings: SolverSettings,
) -> Vec2 {
    inverse_distort(profile.coefficients(channel, true), coord, settings)
}

pub fn inverse_distort(coefficients: RadialCoefficients, coord: Vec2, settings: SolverSettings) -> Vec2 {
    let r = coord.length();
    if r <= f32::EPSILON {
        return coord;
    }
    coord * (inverse_radius(coefficients, r, settings) / r)
}
