//! RGBA8 raster helpers shared by the software kernels

use glam::Vec2;

use crate::frame::{Eye, StereoLayout};

/// Borrowed RGBA8 image.
#[derive(Clone, Copy)]
pub struct RgbaView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride: usize,
}

impl<'a> RgbaView<'a> {
    pub fn tight(data: &'a [u8], width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            stride: width as usize * 4,
        }
    }

    fn texel(&self, x: i64, y: i64) -> [f32; 4] {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        let offset = y * self.stride + x * 4;
        let px = &self.data[offset..offset + 4];
        [px[0] as f32, px[1] as f32, px[2] as f32, px[3] as f32]
    }

    /// Bilinear sample at normalised `uv`, clamped to the edge texels.
    pub fn sample_bilinear(&self, uv: Vec2) -> [f32; 4] {
        let p = uv * Vec2::new(self.width as f32, self.height as f32) - Vec2::splat(0.5);
        let base = p.floor();
        let f = p - base;
        let (x0, y0) = (base.x as i64, base.y as i64);

        let a = self.texel(x0, y0);
        let b = self.texel(x0 + 1, y0);
        let c = self.texel(x0, y0 + 1);
        let d = self.texel(x0 + 1, y0 + 1);

        let mut out = [0.0; 4];
        for i in 0..4 {
            let top = a[i] + (b[i] - a[i]) * f.x;
            let bottom = c[i] + (d[i] - c[i]) * f.x;
            out[i] = top + (bottom - top) * f.y;
        }
        out
    }

    /// Nearest texel at normalised `uv`.
    pub fn sample_nearest(&self, uv: Vec2) -> [u8; 4] {
        let x = (uv.x * self.width as f32).floor() as i64;
        let y = (uv.y * self.height as f32).floor() as i64;
        let t = self.texel(x, y);
        [t[0] as u8, t[1] as u8, t[2] as u8, t[3] as u8]
    }
}

pub fn in_unit_square(uv: Vec2) -> bool {
    (0.0..=1.0).contains(&uv.x) && (0.0..=1.0).contains(&uv.y)
}

pub fn to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Dimensions of a packed stereo frame holding two eyes of `eye_w` x `eye_h`.
pub fn packed_size(layout: StereoLayout, eye_w: u32, eye_h: u32) -> (u32, u32) {
    match layout {
        StereoLayout::SideBySide => (eye_w * 2, eye_h),
        StereoLayout::OverUnder => (eye_w, eye_h * 2),
        StereoLayout::Separate => (eye_w, eye_h),
    }
}

/// Rectangle `(x, y, w, h)` of `eye` inside a packed frame.
pub fn eye_rect(layout: StereoLayout, eye: Eye, packed_w: u32, packed_h: u32) -> (u32, u32, u32, u32) {
    let second = eye == Eye::Right;
    match layout {
        StereoLayout::SideBySide => {
            let w = packed_w / 2;
            (if second { w } else { 0 }, 0, w, packed_h)
        }
        StereoLayout::OverUnder => {
            let h = packed_h / 2;
            (0, if second { h } else { 0 }, packed_w, h)
        }
        StereoLayout::Separate => (0, 0, packed_w, packed_h),
    }
}

/// Copies a sub-rectangle into a tightly packed buffer.
pub fn extract(view: &RgbaView<'_>, x: u32, y: u32, w: u32, h: u32) -> Vec<u8> {
    let row_bytes = w as usize * 4;
    let mut out = Vec::with_capacity(row_bytes * h as usize);
    for row in y..y + h {
        let start = row as usize * view.stride + x as usize * 4;
        out.extend_from_slice(&view.data[start..start + row_bytes]);
    }
    out
}

/// Packs two tight eye images into one frame.
pub fn pack(layout: StereoLayout, left: &[u8], right: &[u8], eye_w: u32, eye_h: u32) -> Vec<u8> {
    let row_bytes = eye_w as usize * 4;
    match layout {
        StereoLayout::SideBySide => {
            let mut out = Vec::with_capacity(row_bytes * 2 * eye_h as usize);
            for (l, r) in left.chunks_exact(row_bytes).zip(right.chunks_exact(row_bytes)) {
                out.extend_from_slice(l);
                out.extend_from_slice(r);
            }
            out
        }
        StereoLayout::OverUnder | StereoLayout::Separate => {
            let mut out = Vec::with_capacity(left.len() + right.len());
            out.extend_from_slice(left);
            out.extend_from_slice(right);
            out
        }
    }
}
