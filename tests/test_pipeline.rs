// tests/test_pipeline.rs — state machine, fan-out and failure handling end to end.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use vrcast::device::{HmdDescriptor, StaticProbe};
use vrcast::frame::{PixelFormat, RawImage, StereoLayout, StereoOutput};
use vrcast::pipeline::{CollectingSink, Message, NullSink, SinkRole};
use vrcast::source::{SourceItem, SourceSpec, VecSource};
use vrcast::stages::point_cloud::PointCloudBuffer;
use vrcast::{
    CameraIntrinsics, Config, GpuBackend, LensProfile, Pipeline, PipelineError, PipelineSpec, State,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> Config {
    let mut config = Config::default();
    config.warp.backend = GpuBackend::Software;
    config.pipeline.queue_depth = 8;
    config.pipeline.wait_timeout_ms = 2000;
    config
}

fn rgba(width: u32, height: u32, value: u8) -> RawImage {
    RawImage::new(vec![value; (width * height * 4) as usize], width, height, PixelFormat::Rgba8)
}

/// Waits for the first bus message matching `pred`, returning everything
/// received up to and including it.
fn wait_for(pipeline: &Pipeline, pred: impl Fn(&Message) -> bool) -> Vec<Message> {
    let bus = pipeline.bus();
    let deadline = Instant::now() + TIMEOUT;
    let mut seen = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match bus.recv_timeout(left) {
            Ok(msg) => {
                let done = pred(&msg);
                seen.push(msg);
                if done {
                    return seen;
                }
            }
            Err(_) => break,
        }
    }
    panic!("no matching bus message, got {seen:?}");
}

fn is_eos(msg: &Message) -> bool {
    matches!(msg, Message::Eos)
}

fn is_error(msg: &Message) -> bool {
    matches!(msg, Message::Error { .. })
}

#[test]
fn plays_test_pattern_to_end_of_stream() {
    let spec = PipelineSpec::new("testsrc://?width=32&height=24&frames=10").with_eye_resolution(16, 12);
    let mut pipeline = Pipeline::with_config(spec, config());
    let desktop = CollectingSink::new();
    pipeline.add_sink(SinkRole::Desktop, desktop.clone()).unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    {
        let log = log.clone();
        pipeline.on_message(move |msg| log.lock().unwrap().push(msg.clone()));
    }

    pipeline.set_state(State::Playing).unwrap();
    let messages = wait_for(&pipeline, is_eos);
    assert!(!messages.iter().any(is_error));
    assert_eq!(pipeline.state(), State::Playing);

    assert_eq!(desktop.eos_count(), 1);
    let frames = desktop.items();
    assert!(!frames.is_empty() && frames.len() <= 10);
    let last = frames.last().unwrap();
    assert_eq!(last.sequence(), 10);
    let StereoOutput::Packed { frame, layout } = last else {
        panic!("expected side-by-side output");
    };
    assert_eq!(*layout, StereoLayout::SideBySide);
    assert_eq!((frame.width(), frame.height()), (32, 12));

    pipeline.set_state(State::Null).unwrap();
    let changes: Vec<_> = log
        .lock()
        .unwrap()
        .iter()
        .filter_map(|m| match m {
            Message::StateChanged { old, new } => Some((*old, *new)),
            _ => None,
        })
        .collect();
    assert_eq!(
        changes,
        [
            (State::Null, State::Ready),
            (State::Ready, State::Paused),
            (State::Paused, State::Playing),
            (State::Playing, State::Paused),
            (State::Paused, State::Ready),
            (State::Ready, State::Null),
        ]
    );
}

#[test]
fn ready_requires_a_video_sink() {
    let mut pipeline = Pipeline::with_config(PipelineSpec::new("testsrc://"), config());
    assert!(matches!(
        pipeline.set_state(State::Ready),
        Err(PipelineError::InvalidGraph(_))
    ));
    assert_eq!(pipeline.state(), State::Null);
}

#[test]
fn unsupported_frame_is_dropped_without_state_change() {
    let malformed = RawImage::new(vec![0u8; 10], 4, 4, PixelFormat::Rgba8);
    let nv12 = RawImage::new(vec![0u8; 24], 4, 4, PixelFormat::Nv12);
    let source = VecSource::new([
        SourceItem::Video(rgba(4, 4, 10)),
        SourceItem::Video(malformed),
        SourceItem::Video(nv12),
        SourceItem::Video(rgba(4, 4, 20)),
    ]);
    let spec = PipelineSpec::new(SourceSpec::source(source)).with_eye_resolution(4, 4);
    let mut pipeline = Pipeline::with_config(spec, config());
    let sink = CollectingSink::new();
    pipeline.add_sink(SinkRole::Desktop, sink.clone()).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let messages = wait_for(&pipeline, is_eos);
    assert!(!messages.iter().any(is_error));
    assert_eq!(pipeline.state(), State::Playing);
    assert!(!pipeline.gpu().unwrap().is_lost());

    let sequences: Vec<_> = sink.items().iter().map(|o| o.sequence()).collect();
    assert_eq!(sequences, [1, 4]);
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn lost_gpu_context_reports_one_error() {
    let spec = PipelineSpec::new("testsrc://?width=16&height=16&frames=0&fps=200&live")
        .with_eye_resolution(8, 8);
    let mut pipeline = Pipeline::with_config(spec, config());
    let fast = CollectingSink::new();
    let slow = CollectingSink::new().with_delay(Duration::from_millis(20));
    pipeline.add_sink(SinkRole::Desktop, fast.clone()).unwrap();
    pipeline.add_sink(SinkRole::Desktop, slow).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let deadline = Instant::now() + TIMEOUT;
    while fast.is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!fast.is_empty());

    assert!(pipeline.gpu().unwrap().mark_lost("device removed"));
    let messages = wait_for(&pipeline, is_error);
    let Some(Message::Error { cause }) = messages.last() else {
        unreachable!()
    };
    assert!(cause.contains("device removed"), "{cause}");
    assert_eq!(pipeline.state(), State::Error);

    // nothing else is reported and every queue is empty
    thread::sleep(Duration::from_millis(200));
    let later: Vec<_> = pipeline.bus().try_iter().collect();
    assert!(!later.iter().any(is_error), "{later:?}");
    assert!(!later.iter().any(is_eos));

    assert!(matches!(
        pipeline.set_state(State::Playing),
        Err(PipelineError::InvalidStateChange { from: State::Error, .. })
    ));
    pipeline.set_state(State::Null).unwrap();
    assert_eq!(pipeline.state(), State::Null);
}

#[test]
fn source_failure_moves_to_error() {
    let source = VecSource::new([SourceItem::Video(rgba(8, 8, 1))]).then_fail("camera unplugged");
    let spec = PipelineSpec::new(SourceSpec::source(source)).with_eye_resolution(8, 8);
    let mut pipeline = Pipeline::with_config(spec, config());
    pipeline.add_sink(SinkRole::Desktop, CollectingSink::new()).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let messages = wait_for(&pipeline, is_error);
    assert!(matches!(
        messages.last(),
        Some(Message::Error { cause }) if cause.contains("camera unplugged")
    ));
    assert_eq!(pipeline.state(), State::Error);
    assert!(!messages.iter().any(is_eos));
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn missing_hmd_degrades_to_desktop_only() {
    let spec = PipelineSpec::new("testsrc://?width=16&height=16&frames=5")
        .with_eye_resolution(8, 8)
        .with_hmd(true);
    let mut pipeline = Pipeline::with_config(spec, config()).with_hmd_probe(StaticProbe::none());
    let hmd = CollectingSink::new();
    let desktop = CollectingSink::new();
    pipeline.add_sink(SinkRole::Hmd, hmd.clone()).unwrap();
    pipeline.add_sink(SinkRole::Desktop, desktop.clone()).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let messages = wait_for(&pipeline, is_eos);
    assert!(messages
        .iter()
        .any(|m| matches!(m, Message::Warning(w) if w.contains("desktop"))));
    assert!(pipeline.lens_profile().is_none());
    assert!(hmd.is_empty());
    assert_eq!(hmd.eos_count(), 0);
    assert_eq!(desktop.eos_count(), 1);
    assert!(!desktop.is_empty());

    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn hmd_branch_receives_lens_corrected_frames() {
    let mut cfg = config();
    cfg.hmd.custom = Some(LensProfile::identity(64, 32));
    let spec = PipelineSpec::new("testsrc://?width=32&height=32&frames=3")
        .with_eye_resolution(16, 16)
        .with_hmd(true);
    let probe = StaticProbe::new(vec![HmdDescriptor {
        product_name: "bench headset".into(),
        vendor_id: 0x1234,
        product_id: 0x0001,
        panel_resolution: [64, 32],
    }]);
    let mut pipeline = Pipeline::with_config(spec, cfg).with_hmd_probe(probe);
    let hmd = CollectingSink::new();
    let desktop = CollectingSink::new();
    pipeline.add_sink(SinkRole::Hmd, hmd.clone()).unwrap();
    pipeline.add_sink(SinkRole::Desktop, desktop.clone()).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    wait_for(&pipeline, is_eos);
    assert_eq!(pipeline.lens_profile().unwrap().name, "identity");

    let frames = hmd.items();
    assert!(!frames.is_empty());
    let StereoOutput::Packed { frame, .. } = frames.last().unwrap() else {
        panic!("expected packed output");
    };
    // one 32x32 panel half per eye
    assert_eq!((frame.width(), frame.height()), (64, 32));
    // both branches share the same warped frames
    let shared = desktop.items();
    let StereoOutput::Packed { frame: preview, .. } = shared.last().unwrap() else {
        panic!("expected packed output");
    };
    assert!(preview.shares_storage(frame));

    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn depth_input_produces_point_clouds() {
    let spec = PipelineSpec::new("testsrc://?width=32&height=24&frames=4&depth").with_eye_resolution(8, 8);
    let mut pipeline = Pipeline::with_config(spec, config())
        .with_intrinsics(CameraIntrinsics::new(30.0, 30.0, 16.0, 12.0, 32, 24));
    let video = CollectingSink::new();
    let points: CollectingSink<PointCloudBuffer> = CollectingSink::new();
    pipeline.add_sink(SinkRole::Desktop, video.clone()).unwrap();
    pipeline.add_point_sink(points.clone()).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let messages = wait_for(&pipeline, is_eos);
    assert_eq!(messages.iter().filter(|m| is_eos(m)).count(), 1);
    assert_eq!(points.eos_count(), 1);
    assert_eq!(video.eos_count(), 1);

    let clouds = points.items();
    assert!(!clouds.is_empty());
    for cloud in &clouds {
        // the top row of the synthetic depth plane is invalid
        assert_eq!(cloud.len(), 32 * 23);
        assert!(cloud.color_matched);
    }
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn depth_without_intrinsics_warns_once() {
    let spec = PipelineSpec::new("testsrc://?width=8&height=8&frames=4&depth").with_eye_resolution(8, 8);
    let mut pipeline = Pipeline::with_config(spec, config());
    let points: CollectingSink<PointCloudBuffer> = CollectingSink::new();
    pipeline.add_sink(SinkRole::Desktop, CollectingSink::new()).unwrap();
    pipeline.add_point_sink(points.clone()).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let messages = wait_for(&pipeline, is_eos);
    let warnings = messages
        .iter()
        .filter(|m| matches!(m, Message::Warning(w) if w.contains("intrinsics")))
        .count();
    assert_eq!(warnings, 1);
    assert!(points.is_empty());
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn paused_pipeline_holds_frames_back() {
    let spec = PipelineSpec::new("testsrc://?width=8&height=8&frames=5").with_eye_resolution(8, 8);
    let mut pipeline = Pipeline::with_config(spec, config());
    let sink = CollectingSink::new();
    pipeline.add_sink(SinkRole::Desktop, sink.clone()).unwrap();

    pipeline.set_state(State::Paused).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(sink.is_empty());

    pipeline.set_state(State::Playing).unwrap();
    wait_for(&pipeline, is_eos);
    assert!(!sink.is_empty());

    // sinks come back when the pipeline is released and can be reused
    pipeline.set_state(State::Null).unwrap();
    pipeline.add_sink(SinkRole::Desktop, CollectingSink::new()).unwrap();
    pipeline.set_state(State::Playing).unwrap();
    wait_for(&pipeline, is_eos);
    assert_eq!(sink.eos_count(), 2);
}

#[test]
fn failure_releases_frames_before_reporting() {
    let spec = PipelineSpec::new("testsrc://?width=16&height=16&frames=0&fps=200&live")
        .with_eye_resolution(8, 8);
    let mut pipeline = Pipeline::with_config(spec, config());
    pipeline.add_sink(SinkRole::Desktop, NullSink).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let ctx = pipeline.gpu().unwrap();
    let live_at_error = Arc::new(Mutex::new(None));
    {
        let ctx = ctx.clone();
        let live_at_error = live_at_error.clone();
        pipeline.on_message(move |msg| {
            if is_error(msg) {
                *live_at_error.lock().unwrap() = Some(ctx.arena().live_count());
            }
        });
    }

    let deadline = Instant::now() + TIMEOUT;
    while pipeline.branch_stats().iter().all(|(_, stats)| stats.read == 0) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(ctx.mark_lost("device removed"));
    wait_for(&pipeline, is_error);

    assert_eq!(*live_at_error.lock().unwrap(), Some(0));
    assert_eq!(pipeline.state(), State::Error);
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn colour_arriving_after_depth_is_still_matched() {
    let mut cfg = config();
    cfg.point_cloud.depth_color_tolerance_ms = 200;
    let depth = RawImage::new([0xe8u8, 0x03].repeat(16), 4, 4, PixelFormat::Depth16)
        .with_pts(Duration::from_millis(100));
    let colour = rgba(4, 4, 90).with_pts(Duration::from_millis(105));
    let source = VecSource::new([SourceItem::Depth(depth), SourceItem::Color(colour)]);

    let spec = PipelineSpec::new(SourceSpec::source(source)).with_eye_resolution(4, 4);
    let mut pipeline = Pipeline::with_config(spec, cfg)
        .with_intrinsics(CameraIntrinsics::new(4.0, 4.0, 2.0, 2.0, 4, 4));
    let points: CollectingSink<PointCloudBuffer> = CollectingSink::new();
    pipeline.add_sink(SinkRole::Desktop, CollectingSink::new()).unwrap();
    pipeline.add_point_sink(points.clone()).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    wait_for(&pipeline, is_eos);

    let clouds = points.items();
    assert_eq!(clouds.len(), 1);
    assert_eq!(clouds[0].len(), 16);
    assert!(clouds[0].color_matched);
    assert_eq!(clouds[0].points[0].color, [90, 90, 90, 90]);
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn slow_source_is_re_presented_at_refresh_rate() {
    let mut cfg = config();
    cfg.pipeline.refresh_hz = 100;
    cfg.hmd.custom = Some(LensProfile::identity(32, 16));
    let spec = PipelineSpec::new("testsrc://?width=16&height=16&frames=3&fps=10&live")
        .with_eye_resolution(16, 16)
        .with_hmd(true);
    let mut pipeline = Pipeline::with_config(spec, cfg);
    let hmd = CollectingSink::new();
    pipeline.add_sink(SinkRole::Hmd, hmd.clone()).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    wait_for(&pipeline, is_eos);

    let outputs = hmd.items();
    let sequences: Vec<_> = outputs.iter().map(|o| o.sequence()).collect();
    assert!(sequences.windows(2).all(|w| w[0] <= w[1]), "{sequences:?}");
    assert_eq!(sequences.last(), Some(&3));
    assert!(sequences.windows(2).any(|w| w[0] == w[1]), "{sequences:?}");

    // a repeat is the same warped frame, a new sequence is a new warp
    for pair in outputs.windows(2) {
        let (StereoOutput::Packed { frame: a, .. }, StereoOutput::Packed { frame: b, .. }) =
            (&pair[0], &pair[1])
        else {
            panic!("expected packed output");
        };
        assert_eq!(pair[0].sequence() == pair[1].sequence(), a.shares_storage(b));
    }
    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn hmd_sinks_without_an_hmd_are_reported() {
    let spec = PipelineSpec::new("testsrc://?width=8&height=8&frames=2").with_eye_resolution(8, 8);
    let mut pipeline = Pipeline::with_config(spec, config());
    let hmd = CollectingSink::new();
    pipeline.add_sink(SinkRole::Hmd, hmd.clone()).unwrap();
    pipeline.add_sink(SinkRole::Desktop, CollectingSink::new()).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let messages = wait_for(&pipeline, is_eos);
    assert!(messages
        .iter()
        .any(|m| matches!(m, Message::Warning(w) if w.contains("ignored"))));
    assert!(hmd.is_empty());
    pipeline.set_state(State::Null).unwrap();
}
