//! Stereo compositor
//!
//! Turns either a left/right pair or a single mono frame into the eye views
//! the warp stage consumes. Mono input is placed on a virtual screen in front
//! of the viewer and rendered once per eye from laterally offset cameras.

use std::sync::Arc;
use std::time::Instant;

use glam::{Mat4, Vec2, Vec4};
use tracing::{debug, instrument, trace};

use crate::error::{PipelineError, Result};
use crate::frame::{
    Eye, EyeParams, Frame, FrameMetadata, MappedFrame, PixelFormat, StereoFrame, StereoLayout,
    StereoOutput,
};
use crate::gpu::context::GpuContext;
use crate::math::projection::{eye_view, projection_matrix};
use crate::stages::raster::{self, RgbaView};
use crate::StereoConfig;

/// One tick worth of compositor input.
#[derive(Debug, Clone)]
pub enum CompositorInput {
    /// Independently rendered eye frames
    Pair { left: Frame, right: Frame },
    /// A single frame to synthesise stereo from
    Mono(Frame),
}

impl CompositorInput {
    pub fn sequence(&self) -> u64 {
        match self {
            CompositorInput::Pair { left, .. } => left.meta.sequence,
            CompositorInput::Mono(frame) => frame.meta.sequence,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompositorSettings {
    /// Eye resolution of synthesised views; pairs keep their own size
    pub eye_width: u32,
    pub eye_height: u32,
    pub layout: StereoLayout,
    pub interpupillary_distance_mm: f32,
    pub screen_distance_m: f32,
    pub fov_y_deg: f32,
    pub near: f32,
    pub far: f32,
    pub border: [u8; 4],
}

impl CompositorSettings {
    pub fn from_config(stereo: &StereoConfig, eye_width: u32, eye_height: u32, border: [u8; 4]) -> Self {
        Self {
            eye_width,
            eye_height,
            layout: stereo.layout,
            interpupillary_distance_mm: stereo.interpupillary_distance_mm,
            screen_distance_m: stereo.screen_distance_m,
            fov_y_deg: stereo.fov_y_deg,
            near: stereo.near,
            far: stereo.far,
            border,
        }
    }

    fn projection(&self) -> Mat4 {
        projection_matrix(
            self.fov_y_deg.to_radians(),
            self.eye_width as f32 / self.eye_height as f32,
            self.near,
            self.far,
        )
    }

    fn eye_params(&self, eye: Eye) -> EyeParams {
        EyeParams {
            projection: self.projection(),
            view: eye_view(eye, self.interpupillary_distance_mm),
            lens: None,
        }
    }
}

/// A frame handed downstream by [`Compositor::present`].
#[derive(Debug, Clone)]
pub struct Presented {
    pub output: StereoOutput,
    /// False when the previous output is shown again
    pub fresh: bool,
}

pub struct Compositor {
    ctx: Arc<GpuContext>,
    settings: CompositorSettings,
    left: Arc<EyeParams>,
    right: Arc<EyeParams>,
    last: Option<StereoOutput>,
}

impl Compositor {
    pub fn new(ctx: Arc<GpuContext>, settings: CompositorSettings) -> Result<Self> {
        if settings.eye_width == 0 || settings.eye_height == 0 {
            return Err(PipelineError::InvalidGraph(format!(
                "eye resolution {}x{} is empty",
                settings.eye_width, settings.eye_height
            )));
        }
        if settings.screen_distance_m <= settings.near {
            return Err(PipelineError::InvalidGraph(format!(
                "virtual screen at {} m is inside the near plane",
                settings.screen_distance_m
            )));
        }
        debug!(
            layout = ?settings.layout,
            ipd_mm = settings.interpupillary_distance_mm,
            eye = %format!("{}x{}", settings.eye_width, settings.eye_height),
            "compositor ready"
        );
        Ok(Self {
            left: Arc::new(settings.eye_params(Eye::Left)),
            right: Arc::new(settings.eye_params(Eye::Right)),
            ctx,
            settings,
            last: None,
        })
    }

    pub fn settings(&self) -> &CompositorSettings {
        &self.settings
    }

    /// Most recent completed output.
    pub fn last(&self) -> Option<&StereoOutput> {
        self.last.as_ref()
    }

    /// Composites new input, or re-presents the last output when `input` is
    /// `None`. Returns `None` only before the first frame ever arrived.
    pub fn present(&mut self, input: Option<&CompositorInput>) -> Result<Option<Presented>> {
        match input {
            Some(input) => {
                let output = self.composite(input)?;
                self.last = Some(output.clone());
                Ok(Some(Presented {
                    output,
                    fresh: true,
                }))
            }
            None => Ok(self.last.clone().map(|output| {
                trace!(seq = output.sequence(), "re-presenting last frame");
                metrics::counter!("vrcast_frames_represented").increment(1);
                Presented {
                    output,
                    fresh: false,
                }
            })),
        }
    }

    /// Forgets the last output so its frames can be released.
    pub fn reset(&mut self) {
        self.last = None;
    }

    #[instrument(skip(self, input), fields(seq = input.sequence()))]
    pub fn composite(&self, input: &CompositorInput) -> Result<StereoOutput> {
        match input {
            CompositorInput::Pair { left, right } => self.composite_pair(left, right),
            CompositorInput::Mono(frame) => self.synthesise(frame),
        }
    }

    fn composite_pair(&self, left: &Frame, right: &Frame) -> Result<StereoOutput> {
        check_rgba(left)?;
        check_rgba(right)?;
        if (left.width(), left.height()) != (right.width(), right.height()) {
            return Err(PipelineError::unsupported(format!(
                "eye frames differ in size: {}x{} vs {}x{}",
                left.width(),
                left.height(),
                right.width(),
                right.height()
            )));
        }

        let layout = self.settings.layout;
        if layout == StereoLayout::Separate {
            // nothing to combine; the frames are immutable and can be shared
            return Ok(StereoOutput::Separate {
                left: StereoFrame::new(left.clone(), Eye::Left).with_params(self.left.clone()),
                right: StereoFrame::new(right.clone(), Eye::Right).with_params(self.right.clone()),
            });
        }

        let (eye_w, eye_h) = (left.width(), left.height());
        let (out_w, out_h) = raster::packed_size(layout, eye_w, eye_h);
        let meta = output_meta(left, out_w, out_h);

        let frame = self.ctx.submit(
            "composite",
            vec![left.clone(), right.clone()],
            meta,
            move |inputs| {
                let start = Instant::now();
                let l = tight(&inputs[0]);
                let r = tight(&inputs[1]);
                let out = raster::pack(layout, &l, &r, eye_w, eye_h);
                metrics::histogram!("vrcast_composite_time_us")
                    .record(start.elapsed().as_micros() as f64);
                Ok(out)
            },
        )?;
        Ok(StereoOutput::Packed { frame, layout })
    }

    fn synthesise(&self, mono: &Frame) -> Result<StereoOutput> {
        check_rgba(mono)?;
        let (eye_w, eye_h) = (self.settings.eye_width, self.settings.eye_height);
        let left = ScreenProjector::new(&self.settings, &self.left, mono);
        let right = ScreenProjector::new(&self.settings, &self.right, mono);
        let layout = self.settings.layout;

        if layout == StereoLayout::Separate {
            let meta = output_meta(mono, eye_w, eye_h);
            let render = |projector: ScreenProjector| {
                self.ctx.submit("composite", vec![mono.clone()], meta.clone(), move |inputs| {
                    let start = Instant::now();
                    let out = projector.render(&view(&inputs[0]));
                    metrics::histogram!("vrcast_composite_time_us")
                        .record(start.elapsed().as_micros() as f64);
                    Ok(out)
                })
            };
            return Ok(StereoOutput::Separate {
                left: StereoFrame::new(render(left)?, Eye::Left).with_params(self.left.clone()),
                right: StereoFrame::new(render(right)?, Eye::Right).with_params(self.right.clone()),
            });
        }

        let (out_w, out_h) = raster::packed_size(layout, eye_w, eye_h);
        let meta = output_meta(mono, out_w, out_h);
        let frame = self.ctx.submit("composite", vec![mono.clone()], meta, move |inputs| {
            let start = Instant::now();
            let src = view(&inputs[0]);
            let out = raster::pack(layout, &left.render(&src), &right.render(&src), eye_w, eye_h);
            metrics::histogram!("vrcast_composite_time_us").record(start.elapsed().as_micros() as f64);
            Ok(out)
        })?;
        Ok(StereoOutput::Packed { frame, layout })
    }
}

/// Ray casts one eye view onto the virtual screen quad carrying the mono frame.
#[derive(Clone, Copy)]
struct ScreenProjector {
    inverse: Mat4,
    width: u32,
    height: u32,
    distance: f32,
    half_extent: Vec2,
    border: [u8; 4],
}

impl ScreenProjector {
    fn new(settings: &CompositorSettings, params: &EyeParams, mono: &Frame) -> Self {
        let half_h = settings.screen_distance_m * (settings.fov_y_deg.to_radians() / 2.0).tan();
        let src_aspect = mono.width() as f32 / mono.height() as f32;
        Self {
            inverse: (params.projection * params.view).inverse(),
            width: settings.eye_width,
            height: settings.eye_height,
            distance: settings.screen_distance_m,
            half_extent: Vec2::new(half_h * src_aspect, half_h),
            border: settings.border,
        }
    }

    /// Normalised source coordinate seen through output pixel `(x, y)`.
    fn source_uv(&self, x: u32, y: u32) -> Option<Vec2> {
        let ndc_x = (x as f32 + 0.5) / self.width as f32 * 2.0 - 1.0;
        let ndc_y = 1.0 - (y as f32 + 0.5) / self.height as f32 * 2.0;

        let near = self.inverse * Vec4::new(ndc_x, ndc_y, 0.0, 1.0);
        let far = self.inverse * Vec4::new(ndc_x, ndc_y, 1.0, 1.0);
        let origin = near.truncate() / near.w;
        let dir = far.truncate() / far.w - origin;
        if dir.z >= 0.0 {
            return None;
        }

        // intersect the screen plane z = -distance
        let t = (-self.distance - origin.z) / dir.z;
        let hit = origin + dir * t;
        let uv = Vec2::new(
            (hit.x + self.half_extent.x) / (2.0 * self.half_extent.x),
            (self.half_extent.y - hit.y) / (2.0 * self.half_extent.y),
        );
        raster::in_unit_square(uv).then_some(uv)
    }

    fn render(&self, src: &RgbaView<'_>) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for y in 0..self.height {
            for x in 0..self.width {
                match self.source_uv(x, y) {
                    Some(uv) => out.extend(src.sample_bilinear(uv).map(raster::to_u8)),
                    None => out.extend_from_slice(&self.border),
                }
            }
        }
        out
    }
}

fn view(frame: &MappedFrame) -> RgbaView<'_> {
    RgbaView {
        data: &frame[..],
        width: frame.meta.width,
        height: frame.meta.height,
        stride: frame.meta.stride as usize,
    }
}

/// Rows without padding.
fn tight(frame: &MappedFrame) -> Vec<u8> {
    let v = view(frame);
    raster::extract(&v, 0, 0, v.width, v.height)
}

fn check_rgba(frame: &Frame) -> Result<()> {
    if frame.format() != PixelFormat::Rgba8 {
        return Err(PipelineError::unsupported(format!(
            "compositor expects RGBA8 input, got {:?}",
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
