//! Per-frame transform stages

pub mod compositor;
pub mod point_cloud;
pub mod raster;
pub mod warp;

pub use compositor::{Compositor, CompositorInput, CompositorSettings, Presented};
pub use point_cloud::{ColorSampling, Point, PointCloudBuffer, PointCloudBuilder};
pub use warp::{WarpBackend, WarpMap, WarpStage};
