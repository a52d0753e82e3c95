//! Device-side resources: slot arena, completion fences, the submission
//! context and the wgpu warp backend.

pub mod arena;
pub mod context;
pub mod fence;
pub mod wgpu_warp;

pub use arena::{FrameArena, FrameHandle};
pub use context::GpuContext;
pub use fence::{Fence, FenceState};
pub use wgpu_warp::WgpuWarp;
