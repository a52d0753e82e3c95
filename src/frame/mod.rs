pub mod frame;
pub mod upload;

pub use frame::{
    Eye, EyeParams, Frame, FrameMetadata, MappedFrame, PixelFormat, RawImage, Residency,
    StereoFrame, StereoLayout, StereoOutput,
};
