// tests/test_point_cloud.rs — depth + colour fusion on uploaded frames.

use std::time::Duration;

use vrcast::frame::{Frame, PixelFormat, RawImage};
use vrcast::gpu::GpuContext;
use vrcast::stages::point_cloud::{check_depth, PointCloudBuilder};
use vrcast::{CameraIntrinsics, ColorSampling, PipelineError, PointCloudConfig};

const WAIT: Duration = Duration::from_secs(5);

fn depth(ctx: &GpuContext, samples: &[u16], width: u32, pts_ms: u64) -> Frame {
    let bytes: Vec<u8> = samples.iter().flat_map(|d| d.to_le_bytes()).collect();
    let raw = RawImage::new(bytes, width, samples.len() as u32 / width, PixelFormat::Depth16)
        .with_pts(Duration::from_millis(pts_ms));
    ctx.upload(&raw, 1).unwrap()
}

fn color(ctx: &GpuContext, pixels: &[[u8; 4]], width: u32, pts_ms: u64) -> Frame {
    let bytes: Vec<u8> = pixels.iter().flatten().copied().collect();
    let raw = RawImage::new(bytes, width, pixels.len() as u32 / width, PixelFormat::Rgba8)
        .with_pts(Duration::from_millis(pts_ms));
    ctx.upload(&raw, 1).unwrap()
}

#[test]
fn valid_pixels_become_points_in_row_order() {
    let ctx = GpuContext::new(WAIT).unwrap();
    let intrinsics = CameraIntrinsics::new(100.0, 100.0, 1.0, 1.0, 3, 2);
    let mut builder = PointCloudBuilder::new(intrinsics, PointCloudConfig::default(), WAIT);

    let pixels = [
        [1, 0, 0, 255],
        [2, 0, 0, 255],
        [3, 0, 0, 255],
        [4, 0, 0, 255],
        [5, 0, 0, 255],
        [6, 0, 0, 255],
    ];
    builder.push_color(color(&ctx, &pixels, 3, 40)).unwrap();

    // zero and beyond-range samples are dropped without error
    let cloud = builder
        .build(&depth(&ctx, &[0, 1000, 20_000, 2000, 1000, 50], 3, 50))
        .unwrap();
    assert_eq!(cloud.len(), 3);
    assert_eq!((cloud.width, cloud.height), (3, 2));
    assert!(cloud.color_matched);

    assert_eq!(cloud.points[0].position, [0.0, -10.0, 1000.0]);
    assert_eq!(cloud.points[0].color, [2, 0, 0, 255]);
    assert_eq!(cloud.points[1].position, [-20.0, 0.0, 2000.0]);
    assert_eq!(cloud.points[1].color, [4, 0, 0, 255]);
    assert_eq!(cloud.points[2].position, [0.0, 0.0, 1000.0]);
    assert_eq!(cloud.points[2].color, [5, 0, 0, 255]);

    assert_eq!(cloud.as_bytes().len(), 3 * 16);
}

#[test]
fn stale_colour_falls_back_to_default() {
    let ctx = GpuContext::new(WAIT).unwrap();
    let config = PointCloudConfig {
        default_color: [9, 9, 9, 0],
        ..PointCloudConfig::default()
    };
    let mut builder =
        PointCloudBuilder::new(CameraIntrinsics::new(1.0, 1.0, 0.0, 0.0, 2, 1), config, WAIT);
    builder
        .push_color(color(&ctx, &[[200, 0, 0, 255], [200, 0, 0, 255]], 2, 0))
        .unwrap();

    let cloud = builder.build(&depth(&ctx, &[500, 600], 2, 500)).unwrap();
    assert!(!cloud.color_matched);
    assert!(cloud.points.iter().all(|p| p.color == [9, 9, 9, 0]));
}

#[test]
fn intrinsics_follow_depth_resolution() {
    let ctx = GpuContext::new(WAIT).unwrap();
    // calibrated at 4x2, fed 2x1
    let intrinsics = CameraIntrinsics::new(4.0, 4.0, 2.0, 1.0, 4, 2);
    let builder = PointCloudBuilder::new(intrinsics, PointCloudConfig::default(), WAIT);
    let cloud = builder.build(&depth(&ctx, &[400, 400], 2, 0)).unwrap();
    // scaled: fx = 2, cx = 1
    assert_eq!(cloud.points[0].position[0], -200.0);
    assert_eq!(cloud.points[1].position[0], 0.0);
}

#[test]
fn bilinear_sampling_blends_neighbours() {
    let ctx = GpuContext::new(WAIT).unwrap();
    let config = PointCloudConfig {
        sampling: ColorSampling::Bilinear,
        ..PointCloudConfig::default()
    };
    let mut builder =
        PointCloudBuilder::new(CameraIntrinsics::new(1.0, 1.0, 0.0, 0.0, 1, 1), config, WAIT);
    // colour is twice as wide; the depth pixel centre lands between two texels
    builder
        .push_color(color(&ctx, &[[0, 0, 0, 255], [200, 0, 0, 255]], 2, 0))
        .unwrap();
    let cloud = builder.build(&depth(&ctx, &[1000], 1, 0)).unwrap();
    assert_eq!(cloud.points[0].color[0], 100);
}

#[test]
fn non_depth_input_is_rejected() {
    let ctx = GpuContext::new(WAIT).unwrap();
    let builder = PointCloudBuilder::new(CameraIntrinsics::kinect_v1(), PointCloudConfig::default(), WAIT);
    let not_depth = color(&ctx, &[[0, 0, 0, 0]], 1, 0);
    assert!(matches!(
        builder.build(&not_depth),
        Err(PipelineError::UnsupportedFormat(_))
    ));
}

#[test]
fn check_depth_reports_range() {
    let config = PointCloudConfig::default();
    assert_eq!(check_depth(1500, 1.0, &config).unwrap(), 1500.0);
    assert!(matches!(
        check_depth(0, 1.0, &config),
        Err(PipelineError::OutOfRange(_))
    ));
    assert!(check_depth(60_000, 1.0, &config).is_err());
}
