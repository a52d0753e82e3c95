//! HMD distortion warp
//!
//! Resamples each eye image so it appears undistorted through the lens. Every
//! output pixel is mapped into lens space, inverse-distorted separately for
//! red, green and blue, and sampled three times from the source. Samples that
//! land outside the source take the border colour.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use glam::Vec2;
use tracing::{debug, instrument};

use crate::error::{PipelineError, Result};
use crate::frame::{Eye, EyeParams, Frame, FrameMetadata, PixelFormat, StereoFrame, StereoOutput};
use crate::gpu::context::GpuContext;
use crate::gpu::wgpu_warp::WgpuWarp;
use crate::math::lens::{inverse_distort, ColorChannel, LensProfile, RadialCoefficients, SolverSettings};
use crate::stages::raster::{self, RgbaView};
use crate::WarpConfig;

/// Everything needed to warp one eye.
#[derive(Debug, Clone, Copy)]
pub struct EyeWarp {
    pub lens_center: Vec2,
    /// Red, green, blue
    pub coefficients: [RadialCoefficients; 3],
    pub solver: SolverSettings,
    pub border: [u8; 4],
    pub out_width: u32,
    pub out_height: u32,
}

impl EyeWarp {
    pub fn new(profile: &LensProfile, eye: Eye, config: &WarpConfig) -> Self {
        let (out_width, out_height) = profile.eye_panel_size();
        let chromatic = config.chromatic_correction;
        Self {
            lens_center: profile.lens_center(eye),
            coefficients: ColorChannel::ALL.map(|ch| profile.coefficients(ch, chromatic)),
            solver: config.solver(),
            border: config.border_color,
            out_width,
            out_height,
        }
    }

    fn aspect(&self) -> f32 {
        self.out_width as f32 / self.out_height as f32
    }

    /// Lens-space coordinate of output pixel `(x, y)`.
    pub fn lens_coord(&self, x: u32, y: u32) -> Vec2 {
        let u = (x as f32 + 0.5) / self.out_width as f32;
        let v = (y as f32 + 0.5) / self.out_height as f32;
        Vec2::new(
            (u - self.lens_center.x) * 2.0 * self.aspect(),
            (v - self.lens_center.y) * 2.0,
        )
    }

    /// Normalised source coordinate sampled for `channel` at `lens`.
    pub fn source_uv(&self, lens: Vec2, channel: usize) -> Vec2 {
        let corrected = inverse_distort(self.coefficients[channel], lens, self.solver);
        Vec2::new(0.5 + corrected.x / (2.0 * self.aspect()), 0.5 + corrected.y / 2.0)
    }
}

/// Per-pixel source coordinates for the three channels, computed once per
/// eye and shared read-only by every frame.
pub struct WarpMap {
    pub params: EyeWarp,
    coords: Vec<[Vec2; 3]>,
}

impl WarpMap {
    pub fn build(params: EyeWarp) -> Self {
        let mut coords = Vec::with_capacity(params.out_width as usize * params.out_height as usize);
        for y in 0..params.out_height {
            for x in 0..params.out_width {
                let lens = params.lens_coord(x, y);
                coords.push([
                    params.source_uv(lens, 0),
                    params.source_uv(lens, 1),
                    params.source_uv(lens, 2),
                ]);
            }
        }
        Self { params, coords }
    }

    pub fn coords(&self, x: u32, y: u32) -> [Vec2; 3] {
        self.coords[(y * self.params.out_width + x) as usize]
    }

    /// Software kernel: warp `src` into a tight RGBA8 eye image.
    pub fn apply(&self, src: &RgbaView<'_>) -> Vec<u8> {
        let border = self.params.border;
        let mut out = Vec::with_capacity(self.coords.len() * 4);
        for uvs in &self.coords {
            let mut px = border;
            for (channel, uv) in uvs.iter().enumerate() {
                if raster::in_unit_square(*uv) {
                    let sample = src.sample_bilinear(*uv);
                    px[channel] = raster::to_u8(sample[channel]);
                    if channel == 1 {
                        px[3] = raster::to_u8(sample[3]);
                    }
                }
            }
            out.extend_from_slice(&px);
        }
        out
    }
}

pub enum WarpBackend {
    Software,
    Wgpu(Arc<WgpuWarp>),
}

impl WarpBackend {
    fn name(&self) -> &'static str {
        match self {
            WarpBackend::Software => "software",
            WarpBackend::Wgpu(_) => "wgpu",
        }
    }
}

struct EyeKernel {
    map: Arc<WarpMap>,
    backend: Arc<WarpBackend>,
}

impl EyeKernel {
    fn run(&self, src: &RgbaView<'_>) -> Result<Vec<u8>> {
        match &*self.backend {
            WarpBackend::Software => Ok(self.map.apply(src)),
            WarpBackend::Wgpu(gpu) => {
                let tight;
                let src = if src.stride == src.width as usize * 4 {
                    *src
                } else {
                    tight = raster::extract(src, 0, 0, src.width, src.height);
                    RgbaView::tight(&tight, src.width, src.height)
                };
                gpu.warp_eye(&self.map.params, &src)
            }
        }
    }
}

/// Warp stage for one session. Holds no mutable state; left and right eye
/// jobs may run concurrently.
pub struct WarpStage {
    ctx: Arc<GpuContext>,
    lens: Arc<LensProfile>,
    left: Arc<EyeKernel>,
    right: Arc<EyeKernel>,
}

impl WarpStage {
    pub fn new(
        ctx: Arc<GpuContext>,
        lens: Arc<LensProfile>,
        config: &WarpConfig,
        backend: WarpBackend,
    ) -> Result<Self> {
        lens.validate()?;
        let backend = Arc::new(backend);
        let build = |eye| {
            Arc::new(EyeKernel {
                map: Arc::new(WarpMap::build(EyeWarp::new(&lens, eye, config))),
                backend: backend.clone(),
            })
        };
        let left = build(Eye::Left);
        let right = build(Eye::Right);
        debug!(
            profile = %lens.name,
            backend = backend.name(),
            chromatic = config.chromatic_correction,
            "warp stage ready"
        );
        Ok(Self {
            ctx,
            lens,
            left,
            right,
        })
    }

    pub fn lens(&self) -> &Arc<LensProfile> {
        &self.lens
    }

    /// Queues the warp of `input`; the returned frames complete asynchronously.
    #[instrument(skip(self, input), fields(seq = input.sequence()))]
    pub fn process(&self, input: &StereoOutput) -> Result<StereoOutput> {
        match input {
            StereoOutput::Separate { left, right } => Ok(StereoOutput::Separate {
                left: self.warp_single(left)?,
                right: self.warp_single(right)?,
            }),
            StereoOutput::Packed { frame, layout } => {
                let layout = *layout;
                check_rgba(frame)?;
                let (eye_w, eye_h) = self.lens.eye_panel_size();
                let (out_w, out_h) = raster::packed_size(layout, eye_w, eye_h);
                let meta = output_meta(frame, out_w, out_h);
                let (left, right) = (self.left.clone(), self.right.clone());

                let out = self.ctx.submit("warp", vec![frame.clone()], meta, move |inputs| {
                    let start = Instant::now();
                    let src = &inputs[0];
                    let view = RgbaView {
                        data: &src[..],
                        width: src.meta.width,
                        height: src.meta.height,
                        stride: src.meta.stride as usize,
                    };
                    let (_, _, src_w, src_h) =
                        raster::eye_rect(layout, Eye::Left, view.width, view.height);
                    let region = |eye| {
                        let (x, y, w, h) = raster::eye_rect(layout, eye, view.width, view.height);
                        raster::extract(&view, x, y, w, h)
                    };
                    let left_src = region(Eye::Left);
                    let right_src = region(Eye::Right);

                    // both eyes in parallel, no shared mutable state
                    let (l, r) = thread::scope(|scope| {
                        let l = scope.spawn(|| left.run(&RgbaView::tight(&left_src, src_w, src_h)));
                        let r = right.run(&RgbaView::tight(&right_src, src_w, src_h));
                        (l.join(), r)
                    });
                    let l = l.map_err(|_| PipelineError::GpuContextLost("left eye warp panicked".into()))??;
                    let r = r?;
                    metrics::histogram!("vrcast_warp_time_us").record(start.elapsed().as_micros() as f64);
                    Ok(raster::pack(layout, &l, &r, eye_w, eye_h))
                })?;
                Ok(StereoOutput::Packed { frame: out, layout })
            }
        }
    }

    fn warp_single(&self, input: &StereoFrame) -> Result<StereoFrame> {
        check_rgba(&input.frame)?;
        let kernel = match input.eye {
            Eye::Right => self.right.clone(),
            Eye::Left | Eye::Mono => self.left.clone(),
        };
        let (out_w, out_h) = self.lens.eye_panel_size();
        let meta = output_meta(&input.frame, out_w, out_h);

        let frame = self.ctx.submit("warp", vec![input.frame.clone()], meta, move |inputs| {
            let start = Instant::now();
            let src = &inputs[0];
            let view = RgbaView {
                data: &src[..],
                width: src.meta.width,
                height: src.meta.height,
                stride: src.meta.stride as usize,
            };
            let out = kernel.run(&view)?;
            metrics::histogram!("vrcast_warp_time_us").record(start.elapsed().as_micros() as f64);
            Ok(out)
        })?;

        Ok(StereoFrame {
            frame,
            eye: input.eye,
            params: Arc::new(EyeParams {
                lens: Some(self.lens.clone()),
                ..(*input.params).clone()
            }),
        })
    }
}

fn check_rgba(frame: &Frame) -> Result<()> {
    if frame.format() != PixelFormat::Rgba8 {
        return Err(PipelineError::unsupported(format!(
            "warp expects RGBA8 input, got {:?}",
            frame.format()
        )));
    }
    Ok(())
}

fn output_meta(input: &Frame, width: u32, height: u32) -> FrameMetadata {
    FrameMetadata {
        width,
        height,
        stride: width * 4,
        format: PixelFormat::Rgba8,
        ..(*input.meta).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::lens::ChromaticCoefficients;

    fn config() -> WarpConfig {
        WarpConfig {
            backend: crate::GpuBackend::Software,
            ..WarpConfig::default()
        }
    }

    fn gradient(width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x * 7) as u8, (y * 11) as u8, ((x + y) * 3) as u8, 255]);
            }
        }
        data
    }

    #[test]
    fn test_identity_profile_reproduces_source() {
        let profile = LensProfile::identity(16, 8);
        let map = WarpMap::build(EyeWarp::new(&profile, Eye::Left, &config()));
        let src = gradient(8, 8);
        let out = map.apply(&RgbaView::tight(&src, 8, 8));
        assert_eq!(out, src);
    }

    #[test]
    fn test_chromatic_channels_sample_different_points() {
        let mut profile = LensProfile::identity(64, 32);
        profile.distortion = ChromaticCoefficients {
            red: RadialCoefficients([0.98, 0.2, 0.1, 0.0]),
            green: RadialCoefficients([1.0, 0.2, 0.1, 0.0]),
            blue: RadialCoefficients([1.03, 0.2, 0.1, 0.0]),
        };
        let map = WarpMap::build(EyeWarp::new(&profile, Eye::Left, &config()));
        let [r, g, b] = map.coords(0, 0);
        assert_ne!(r, g);
        assert_ne!(g, b);

        let mono = WarpMap::build(EyeWarp::new(
            &profile,
            Eye::Left,
            &WarpConfig {
                chromatic_correction: false,
                ..config()
            },
        ));
        let [r, g, b] = mono.coords(0, 0);
        assert_eq!(r, g);
        assert_eq!(g, b);
    }

    #[test]
    fn test_out_of_range_samples_take_border() {
        let mut profile = LensProfile::identity(16, 8);
        // shrinking k0 pushes corner samples outside the source
        profile.distortion = ChromaticCoefficients::uniform(RadialCoefficients([0.5, 0.0, 0.0, 0.0]));
        let cfg = WarpConfig {
            border_color: [1, 2, 3, 4],
            ..config()
        };
        let map = WarpMap::build(EyeWarp::new(&profile, Eye::Left, &cfg));
        let src = vec![200u8; 8 * 8 * 4];
        let out = map.apply(&RgbaView::tight(&src, 8, 8));
        assert_eq!(&out[0..4], &[1, 2, 3, 4]);
        // centre still samples the source
        let centre = ((4 * 8 + 4) * 4) as usize;
        assert_eq!(&out[centre..centre + 4], &[200, 200, 200, 200]);
    }
}
