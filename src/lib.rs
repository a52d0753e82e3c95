pub mod device;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod math;
pub mod pipeline;
pub mod source;
pub mod stages;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use error::{PipelineError, Result};
pub use frame::{Frame, PixelFormat, RawImage, StereoLayout};
pub use math::{CameraIntrinsics, LensProfile, SolverSettings};
pub use pipeline::{Pipeline, PipelineSpec, State};
pub use stages::point_cloud::ColorSampling;

/// Global configuration that can be atomically swapped at runtime.
/// Pipelines copy it at construction and never read it afterwards.
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stereo: StereoConfig,
    pub warp: WarpConfig,
    pub point_cloud: PointCloudConfig,
    pub pipeline: PipelineConfig,
    pub hmd: HmdConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoConfig {
    pub layout: StereoLayout,
    pub interpupillary_distance_mm: f32,
    /// Distance of the virtual screen a mono source is placed on
    pub screen_distance_m: f32,
    /// Vertical field of view when no lens profile supplies one
    pub fov_y_deg: f32,
    pub near: f32,
    pub far: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpuBackend {
    Vulkan,
    Metal,
    Dx12,
    OpenGl,
    Auto,
    /// CPU reference kernels on the GPU executor thread
    Software,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarpConfig {
    pub chromatic_correction: bool,
    /// RGBA written where the corrected sample falls outside the source
    pub border_color: [u8; 4],
    pub max_iterations: u32,
    pub epsilon: f32,
    pub backend: GpuBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PointCloudConfig {
    pub depth_color_tolerance_ms: u64,
    /// Valid depth range after scaling, inclusive
    pub min_depth: f32,
    pub max_depth: f32,
    pub sampling: ColorSampling,
    /// Colour of points with no colour frame inside the tolerance window
    pub default_color: [u8; 4],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames buffered per fan-out branch before the oldest is dropped
    pub queue_depth: usize,
    /// Fixed presentation cadence; 0 presents once per new source frame
    pub refresh_hz: u32,
    /// Upper bound for every blocking wait
    pub wait_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HmdConfig {
    /// Built-in lens profile that overrides detection
    pub profile: Option<String>,
    /// Opt into matching detected devices by product name
    pub match_product_name: bool,
    /// Complete inline lens profile, takes precedence over everything else
    pub custom: Option<LensProfile>,
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self {
            layout: StereoLayout::SideBySide,
            interpupillary_distance_mm: 63.0,
            screen_distance_m: 2.0,
            fov_y_deg: 90.0,
            near: 0.05,
            far: 100.0,
        }
    }
}

impl Default for WarpConfig {
    fn default() -> Self {
        let solver = SolverSettings::default();
        Self {
            chromatic_correction: true,
            border_color: [0, 0, 0, 255],
            max_iterations: solver.max_iterations,
            epsilon: solver.epsilon,
            backend: GpuBackend::Auto,
        }
    }
}

impl WarpConfig {
    pub fn solver(&self) -> SolverSettings {
        SolverSettings {
            max_iterations: self.max_iterations,
            epsilon: self.epsilon,
        }
    }
}

impl Default for PointCloudConfig {
    fn default() -> Self {
        Self {
            depth_color_tolerance_ms: 33,
            min_depth: 100.0,
            max_depth: 10_000.0,
            sampling: ColorSampling::Nearest,
            default_color: [255, 255, 255, 255],
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 3,
            refresh_hz: 0,
            wait_timeout_ms: 1000,
        }
    }
}

impl PipelineConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms.max(1))
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.max(1)
    }
}

impl Config {
    /// Loads an optional TOML file, then `VRCAST_*` environment overrides
    /// (`VRCAST_PIPELINE__QUEUE_DEPTH=2`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("VRCAST")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Config>()?;
        Ok(config)
    }
}
