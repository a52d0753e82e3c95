//! Pixel format registry: conversions from source formats to the formats
//! the GPU stages consume (RGBA8 for colour, little-endian u16 for depth).

use bytes::Bytes;

use crate::error::{PipelineError, Result};
use crate::frame::frame::{Frame, FrameMetadata, PixelFormat, RawImage, Residency};

/// Converted pixel data ready to be placed in device or host storage.
pub struct Converted {
    pub data: Bytes,
    pub format: PixelFormat,
    pub stride: u32,
}

/// Whether `format` has a registered conversion.
pub fn is_registered(format: PixelFormat) -> bool {
    !matches!(format, PixelFormat::Yuyv4 | PixelFormat::Nv12)
}

pub fn convert(raw: &RawImage) -> Result<Converted> {
    if raw.width == 0 || raw.height == 0 {
        return Err(PipelineError::unsupported(format!(
            "{:?} image with empty geometry {}x{}",
            raw.format, raw.width, raw.height
        )));
    }
    if !is_registered(raw.format) {
        return Err(PipelineError::unsupported(format!(
            "no registered conversion for {:?}",
            raw.format
        )));
    }

    let pixels = raw.width as usize * raw.height as usize;
    if let Some(bpp) = raw.format.bytes_per_pixel() {
        if raw.data.len() != pixels * bpp {
            return Err(PipelineError::unsupported(format!(
                "malformed {:?} buffer: {} bytes for {}x{}",
                raw.format,
                raw.data.len(),
                raw.width,
                raw.height
            )));
        }
    }

    let rgba_stride = raw.width * 4;
    let converted = match raw.format {
        PixelFormat::Rgba8 => Converted {
            data: raw.data.clone(),
            format: PixelFormat::Rgba8,
            stride: rgba_stride,
        },
        PixelFormat::Depth16 => Converted {
            data: raw.data.clone(),
            format: PixelFormat::Depth16,
            stride: raw.width * 2,
        },
        PixelFormat::Bgra8 => rgba(
            raw.data
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0], px[3]])
                .collect(),
            rgba_stride,
        ),
        PixelFormat::Rgb24 => rgba(expand_rgb(&raw.data, false), rgba_stride),
        PixelFormat::Bgr24 => rgba(expand_rgb(&raw.data, true), rgba_stride),
        PixelFormat::Gray8 => rgba(
            raw.data.iter().flat_map(|&g| [g, g, g, 255]).collect(),
            rgba_stride,
        ),
        PixelFormat::Mjpeg => rgba(decode_mjpeg(raw)?, rgba_stride),
        PixelFormat::Yuyv4 | PixelFormat::Nv12 => {
            return Err(PipelineError::unsupported(format!(
                "no registered conversion for {:?}",
                raw.format
            )))
        }
    };
    Ok(converted)
}

/// Converts `raw` into a host-resident frame for CPU-side stages.
pub fn to_host_frame(raw: &RawImage, sequence: u64) -> Result<Frame> {
    let converted = convert(raw)?;
    let meta = metadata(raw, &converted, sequence, Residency::Host);
    Ok(Frame::host(converted.data, meta))
}

pub(crate) fn metadata(
    raw: &RawImage,
    converted: &Converted,
    sequence: u64,
    residency: Residency,
) -> FrameMetadata {
    FrameMetadata {
        sequence,
        width: raw.width,
        height: raw.height,
        stride: converted.stride,
        format: converted.format,
        residency,
        pts: raw.pts,
        duration: raw.duration,
    }
}

fn rgba(data: Vec<u8>, stride: u32) -> Converted {
    Converted {
        data: Bytes::from(data),
        format: PixelFormat::Rgba8,
        stride,
    }
}

fn expand_rgb(data: &[u8], swap: bool) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(data.len() / 3 * 4);
    for chunk in data.chunks_exact(3) {
        if swap {
            rgba.extend_from_slice(&[chunk[2], chunk[1], chunk[0], 255]);
        } else {
            rgba.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
        }
    }
    rgba
}

fn decode_mjpeg(raw: &RawImage) -> Result<Vec<u8>> {
    let mut decoder = zune_jpeg::JpegDecoder::new(&raw.data[..]);
    let pixels = decoder
        .decode()
        .map_err(|e| PipelineError::unsupported(format!("malformed MJPEG frame: {:?}", e)))?;

    let expected = raw.width as usize * raw.height as usize;
    if pixels.len() == expected * 3 {
        Ok(expand_rgb(&pixels, false))
    } else if pixels.len() == expected {
        Ok(pixels.iter().flat_map(|&g| [g, g, g, 255]).collect())
    } else {
        Err(PipelineError::unsupported(format!(
            "MJPEG frame decoded to {} bytes, expected {}x{}",
            pixels.len(),
            raw.width,
            raw.height
        )))
    }
}
