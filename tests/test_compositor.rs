// tests/test_compositor.rs — stereo packing and mono view synthesis.

use std::sync::Arc;
use std::time::Duration;

use vrcast::frame::{Frame, PixelFormat, RawImage, StereoLayout, StereoOutput};
use vrcast::gpu::GpuContext;
use vrcast::stages::compositor::{Compositor, CompositorInput, CompositorSettings};
use vrcast::StereoConfig;

const WAIT: Duration = Duration::from_secs(5);

/// RGBA pattern: R = x, G = y, B = `tag`.
fn pattern(width: u32, height: u32, tag: u8) -> Vec<u8> {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[x as u8, y as u8, tag, 255]);
        }
    }
    data
}

fn upload(ctx: &GpuContext, data: Vec<u8>, width: u32, height: u32, seq: u64) -> Frame {
    ctx.upload(&RawImage::new(data, width, height, PixelFormat::Rgba8), seq)
        .unwrap()
}

fn settings(layout: StereoLayout, width: u32, height: u32) -> CompositorSettings {
    CompositorSettings {
        layout,
        ..CompositorSettings::from_config(&StereoConfig::default(), width, height, [0, 0, 0, 255])
    }
}

#[test]
fn side_by_side_places_eyes_next_to_each_other() {
    let ctx = Arc::new(GpuContext::new(WAIT).unwrap());
    let compositor = Compositor::new(ctx.clone(), settings(StereoLayout::SideBySide, 1280, 720)).unwrap();
    let input = CompositorInput::Pair {
        left: upload(&ctx, pattern(1280, 720, 1), 1280, 720, 7),
        right: upload(&ctx, pattern(1280, 720, 2), 1280, 720, 7),
    };

    let output = compositor.composite(&input).unwrap();
    assert_eq!(output.sequence(), 7);
    let StereoOutput::Packed { frame, layout } = output else {
        panic!("expected a packed frame");
    };
    assert_eq!(layout, StereoLayout::SideBySide);
    assert_eq!((frame.width(), frame.height()), (2560, 720));

    let view = frame.map_wait(WAIT).unwrap();
    let left = pattern(1280, 720, 1);
    let right = pattern(1280, 720, 2);
    let row = 1280 * 4;
    for y in 0..720usize {
        let out = &view[y * view.meta.stride as usize..][..2 * row];
        assert_eq!(&out[..row], &left[y * row..(y + 1) * row], "left half, row {y}");
        assert_eq!(&out[row..], &right[y * row..(y + 1) * row], "right half, row {y}");
    }
}

#[test]
fn over_under_stacks_eyes() {
    let ctx = Arc::new(GpuContext::new(WAIT).unwrap());
    let compositor = Compositor::new(ctx.clone(), settings(StereoLayout::OverUnder, 64, 32)).unwrap();
    let input = CompositorInput::Pair {
        left: upload(&ctx, pattern(64, 32, 1), 64, 32, 1),
        right: upload(&ctx, pattern(64, 32, 2), 64, 32, 1),
    };
    let StereoOutput::Packed { frame, .. } = compositor.composite(&input).unwrap() else {
        panic!("expected a packed frame");
    };
    assert_eq!((frame.width(), frame.height()), (64, 64));
    let view = frame.map_wait(WAIT).unwrap();
    assert_eq!(view.pixel(5, 3), &[5, 3, 1, 255]);
    assert_eq!(view.pixel(5, 35), &[5, 3, 2, 255]);
}

#[test]
fn separate_pair_passes_frames_through() {
    let ctx = Arc::new(GpuContext::new(WAIT).unwrap());
    let compositor = Compositor::new(ctx.clone(), settings(StereoLayout::Separate, 16, 16)).unwrap();
    let left = upload(&ctx, pattern(16, 16, 1), 16, 16, 3);
    let right = upload(&ctx, pattern(16, 16, 2), 16, 16, 3);
    let input = CompositorInput::Pair {
        left: left.clone(),
        right: right.clone(),
    };
    let StereoOutput::Separate { left: l, right: r } = compositor.composite(&input).unwrap() else {
        panic!("expected separate eyes");
    };
    assert!(l.frame.shares_storage(&left));
    assert!(r.frame.shares_storage(&right));
}

fn synthesise(ctx: &Arc<GpuContext>, ipd_mm: f32) -> (Vec<u8>, Vec<u8>) {
    let mut s = settings(StereoLayout::Separate, 64, 48);
    s.interpupillary_distance_mm = ipd_mm;
    let compositor = Compositor::new(ctx.clone(), s).unwrap();
    let mono = upload(ctx, pattern(256, 192, 0), 256, 192, 1);
    let StereoOutput::Separate { left, right } = compositor.composite(&CompositorInput::Mono(mono)).unwrap() else {
        panic!("expected separate eyes");
    };
    assert_eq!((left.frame.width(), left.frame.height()), (64, 48));
    let l = left.frame.map_wait(WAIT).unwrap().bytes().to_vec();
    let r = right.frame.map_wait(WAIT).unwrap().bytes().to_vec();
    (l, r)
}

#[test]
fn mono_input_gets_horizontal_parallax() {
    let ctx = Arc::new(GpuContext::new(WAIT).unwrap());
    let (left, right) = synthesise(&ctx, 63.0);
    assert_ne!(left, right);

    // the right eye sits further right, so the centre ray hits a larger x
    let centre = (24 * 64 + 32) * 4;
    let (l, r) = (left[centre] as i32, right[centre] as i32);
    assert!((2..=4).contains(&(r - l)), "left {l} right {r}");
    // no vertical disparity
    assert_eq!(left[centre + 1], right[centre + 1]);
}

#[test]
fn zero_ipd_renders_identical_eyes() {
    let ctx = Arc::new(GpuContext::new(WAIT).unwrap());
    let (left, right) = synthesise(&ctx, 0.0);
    assert_eq!(left, right);
}

#[test]
fn present_repeats_last_frame_under_rate_mismatch() {
    let ctx = Arc::new(GpuContext::new(WAIT).unwrap());
    let mut compositor = Compositor::new(ctx.clone(), settings(StereoLayout::SideBySide, 8, 8)).unwrap();
    let input = CompositorInput::Pair {
        left: upload(&ctx, pattern(8, 8, 1), 8, 8, 11),
        right: upload(&ctx, pattern(8, 8, 2), 8, 8, 11),
    };
    let first = compositor.present(Some(&input)).unwrap().unwrap();
    for _ in 0..3 {
        let again = compositor.present(None).unwrap().unwrap();
        assert!(!again.fresh);
        assert_eq!(again.output.sequence(), first.output.sequence());
    }
}
