//! Pipeline graph, state machine and scheduling threads
//!
//! ```text
//! source ──► driver: upload → compositor → warp ──► tee ──► queue ──► sink (hmd)
//!    │                                                └──► queue ──► sink (desktop)
//!    └─────► points: upload → point cloud builder ──► tee ──► queue ──► sink
//! ```
//!
//! The source, driver and point threads exist between `Paused` and `Ready`;
//! branch consumers live from `Ready` until `Null`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::device::{resolve_lens_profile, HmdProbe, StaticProbe};
use crate::error::{PipelineError, Result};
use crate::frame::{RawImage, StereoLayout, StereoOutput};
use crate::gpu::context::GpuContext;
use crate::gpu::wgpu_warp::WgpuWarp;
use crate::math::intrinsics::CameraIntrinsics;
use crate::math::lens::LensProfile;
use crate::pipeline::ringbuf::{BranchQueue, QueueStats};
use crate::pipeline::sink::{BranchWorker, Sink, SinkRole};
use crate::pipeline::tee::Tee;
use crate::source::{open_uri, FrameSource, SourceItem, SourceSpec};
use crate::stages::compositor::{Compositor, CompositorInput, CompositorSettings};
use crate::stages::point_cloud::{PointCloudBuffer, PointCloudBuilder};
use crate::stages::warp::{WarpBackend, WarpStage};
use crate::{Config, GpuBackend, PointCloudConfig, WarpConfig, CONFIG};

/// Upper bound of every internal wait before flags are re-checked
const POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Null,
    Ready,
    Paused,
    Playing,
    Error,
}

impl State {
    fn rank(self) -> u8 {
        match self {
            State::Null => 0,
            State::Ready => 1,
            State::Paused => 2,
            State::Playing => 3,
            State::Error => u8::MAX,
        }
    }

    /// Adjacent state on the way to `target`.
    fn step_toward(self, target: State) -> State {
        let rank = if target.rank() > self.rank() {
            self.rank() + 1
        } else {
            self.rank() - 1
        };
        match rank {
            0 => State::Null,
            1 => State::Ready,
            2 => State::Paused,
            _ => State::Playing,
        }
    }
}

/// Bus messages
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    StateChanged { old: State, new: State },
    /// Every branch has consumed the end of stream
    Eos,
    Error { cause: String },
    Warning(String),
}

/// What to build: source, eye resolution, stereo layout, HMD presence.
#[derive(Debug)]
pub struct PipelineSpec {
    pub source: SourceSpec,
    pub eye_resolution: (u32, u32),
    pub layout: StereoLayout,
    pub hmd_present: bool,
}

impl PipelineSpec {
    pub fn new(source: impl Into<SourceSpec>) -> Self {
        Self {
            source: source.into(),
            eye_resolution: (1280, 720),
            layout: StereoLayout::default(),
            hmd_present: false,
        }
    }

    pub fn with_eye_resolution(mut self, width: u32, height: u32) -> Self {
        self.eye_resolution = (width, height);
        self
    }

    pub fn with_layout(mut self, layout: StereoLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_hmd(mut self, present: bool) -> Self {
        self.hmd_present = present;
        self
    }
}

type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// State and bus, shared with the pipeline threads
struct Shared {
    state: Mutex<State>,
    tx: flume::Sender<Message>,
    rx: flume::Receiver<Message>,
    callback: Mutex<Option<MessageCallback>>,
}

impl Shared {
    fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            state: Mutex::new(State::Null),
            tx,
            rx,
            callback: Mutex::new(None),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> State {
        *self.lock_state()
    }

    fn post(&self, msg: Message) {
        match &msg {
            Message::StateChanged { old, new } => debug!(?old, ?new, "state changed"),
            Message::Eos => info!("end of stream"),
            Message::Error { cause } => error!(cause = %cause, "pipeline error"),
            Message::Warning(text) => warn!("{}", text),
        }
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(&msg);
        }
        let _ = self.tx.send(msg);
    }

    /// Moves `from` → `to`, failing if the state changed underneath us.
    fn transition(&self, from: State, to: State) -> Result<()> {
        {
            let mut state = self.lock_state();
            if *state != from {
                return Err(PipelineError::InvalidStateChange { from: *state, to });
            }
            *state = to;
        }
        self.post(Message::StateChanged { old: from, new: to });
        Ok(())
    }
}

#[derive(Default)]
struct GateFlags {
    playing: bool,
    stopped: bool,
}

/// Pauses and stops the pipeline threads.
#[derive(Default)]
struct Gate {
    flags: Mutex<GateFlags>,
    changed: Condvar,
}

impl Gate {
    fn lock(&self) -> MutexGuard<'_, GateFlags> {
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_playing(&self, playing: bool) {
        self.lock().playing = playing;
        self.changed.notify_all();
    }

    fn stop(&self) {
        self.lock().stopped = true;
        self.changed.notify_all();
    }

    fn rearm(&self) {
        *self.lock() = GateFlags::default();
    }

    fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Blocks while paused. Returns false once stopped.
    fn wait_playing(&self) -> bool {
        let mut flags = self.lock();
        loop {
            if flags.stopped {
                return false;
            }
            if flags.playing {
                return true;
            }
            flags = self
                .changed
                .wait_timeout(flags, POLL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Sleeps up to `timeout` unless stopped first.
    fn wait_stopped(&self, timeout: Duration) {
        let flags = self.lock();
        if !flags.stopped {
            let _ = self.changed.wait_timeout(flags, timeout);
        }
    }
}

/// Everything the pipeline threads share for one session.
struct Core {
    ctx: Arc<GpuContext>,
    video: Tee<StereoOutput>,
    points: Tee<PointCloudBuffer>,
    shared: Arc<Shared>,
    gate: Gate,
    eos_pending: AtomicUsize,
    eos_posted: AtomicBool,
    failed: AtomicBool,
    release: Mutex<Release>,
}

/// Threads still holding stage frames, and a failure waiting for them.
#[derive(Default)]
struct Release {
    holders: usize,
    cause: Option<String>,
}

impl Core {
    fn branch_count(&self) -> usize {
        self.video.branches().len() + self.points.branches().len()
    }

    fn lock_release(&self) -> MutexGuard<'_, Release> {
        self.release.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Prepares for a fresh run of the source with `holders` threads
    /// retaining stage frames.
    fn rearm(&self, holders: usize) {
        *self.lock_release() = Release {
            holders,
            cause: None,
        };
        self.gate.rearm();
        self.video.flush();
        self.points.flush();
        self.eos_pending.store(self.branch_count(), Ordering::SeqCst);
        self.eos_posted.store(false, Ordering::SeqCst);
    }

    fn branch_eos(&self, branch: &str) {
        let remaining = self
            .eos_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .unwrap_or(0);
        debug!(branch, remaining, "branch reached end of stream");
        if remaining == 0 && !self.eos_posted.swap(true, Ordering::SeqCst) {
            self.shared.post(Message::Eos);
        }
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Fatal error: stop the threads and drop everything queued. The error
    /// is reported once the last thread holding stage frames let go of them.
    fn fail(&self, cause: impl Into<String>) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.gate.stop();
        let dropped = self.video.flush() + self.points.flush();
        debug!(dropped, "queues flushed after failure");

        let cause = {
            let mut release = self.lock_release();
            if release.holders == 0 {
                Some(cause.into())
            } else {
                release.cause = Some(cause.into());
                None
            }
        };
        if let Some(cause) = cause {
            self.report_failure(cause);
        }
    }

    /// Called by a frame-holding thread after dropping its retained frames.
    fn released(&self) {
        let cause = {
            let mut release = self.lock_release();
            release.holders = release.holders.saturating_sub(1);
            if release.holders == 0 {
                release.cause.take()
            } else {
                None
            }
        };
        if let Some(cause) = cause {
            self.report_failure(cause);
        }
    }

    fn report_failure(&self, cause: String) {
        // a push may have raced the first flush
        self.video.flush();
        self.points.flush();
        if let Err(e) = self.ctx.wait_idle(self.ctx.wait_timeout()) {
            warn!(error = %e, "GPU did not settle after failure");
        }

        let old = {
            let mut state = self.shared.lock_state();
            if matches!(*state, State::Null | State::Error) {
                None
            } else {
                Some(std::mem::replace(&mut *state, State::Error))
            }
        };
        if let Some(old) = old {
            self.shared.post(Message::StateChanged {
                old,
                new: State::Error,
            });
            self.shared.post(Message::Error { cause });
        }
    }

    /// Per-item errors are dropped with a log line; fatal ones fail the
    /// pipeline. Returns false when the caller should stop.
    fn absorb(&self, err: PipelineError, what: &str) -> bool {
        if err.is_fatal() {
            self.fail(err.to_string());
            return false;
        }
        match err {
            PipelineError::Timeout(..) => debug!(error = %err, "{} not ready", what),
            _ => warn!(error = %err, "{} dropped", what),
        }
        true
    }
}

enum Flow<T> {
    Item(T),
    End,
}

enum VideoInput {
    Mono(RawImage),
    Pair { left: RawImage, right: RawImage },
}

enum PointInput {
    Depth(RawImage),
    Color(RawImage),
}

/// Compositor and optional warp, owned by the driver while running.
struct Stages {
    compositor: Compositor,
    warp: Option<WarpStage>,
    last: Option<StereoOutput>,
}

impl Stages {
    fn present(&mut self, input: Option<&CompositorInput>) -> Result<Option<StereoOutput>> {
        let Some(presented) = self.compositor.present(input)? else {
            return Ok(None);
        };
        if !presented.fresh {
            if let Some(last) = &self.last {
                return Ok(Some(last.clone()));
            }
        }
        let output = match &self.warp {
            Some(warp) => warp.process(&presented.output)?,
            None => presented.output,
        };
        self.last = Some(output.clone());
        Ok(Some(output))
    }

    fn reset(&mut self) {
        self.compositor.reset();
        self.last = None;
    }
}

struct Running {
    source: JoinHandle<Box<dyn FrameSource>>,
    driver: JoinHandle<Stages>,
    points: Option<JoinHandle<()>>,
}

/// Resources living from `Ready` until `Null`.
struct Session {
    core: Arc<Core>,
    lens: Option<Arc<LensProfile>>,
    stages: Option<Stages>,
    video_workers: Vec<(SinkRole, BranchWorker<StereoOutput>)>,
    point_workers: Vec<BranchWorker<PointCloudBuffer>>,
    /// HMD sinks left out in desktop-only mode
    detached: Vec<(SinkRole, Box<dyn Sink<StereoOutput>>)>,
    running: Option<Running>,
}

pub struct Pipeline {
    config: Config,
    eye_resolution: (u32, u32),
    layout: StereoLayout,
    hmd_present: bool,
    uri: Option<String>,
    source: Option<Box<dyn FrameSource>>,
    video_sinks: Vec<(SinkRole, Box<dyn Sink<StereoOutput>>)>,
    point_sinks: Vec<Box<dyn Sink<PointCloudBuffer>>>,
    probe: Box<dyn HmdProbe>,
    intrinsics: Option<CameraIntrinsics>,
    shared: Arc<Shared>,
    session: Option<Session>,
}

impl Pipeline {
    /// New pipeline in the `Null` state using the global configuration.
    pub fn new(spec: PipelineSpec) -> Self {
        Self::with_config(spec, (**CONFIG.load()).clone())
    }

    pub fn with_config(spec: PipelineSpec, config: Config) -> Self {
        let (uri, source) = match spec.source {
            SourceSpec::Uri(uri) => (Some(uri), None),
            SourceSpec::Source(source) => (None, Some(source)),
        };
        Self {
            config,
            eye_resolution: spec.eye_resolution,
            layout: spec.layout,
            hmd_present: spec.hmd_present,
            uri,
            source,
            video_sinks: Vec::new(),
            point_sinks: Vec::new(),
            probe: Box::new(StaticProbe::none()),
            intrinsics: None,
            shared: Arc::new(Shared::new()),
            session: None,
        }
    }

    pub fn with_hmd_probe(mut self, probe: impl HmdProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Enables point clouds for depth + colour input.
    pub fn with_intrinsics(mut self, intrinsics: CameraIntrinsics) -> Self {
        self.intrinsics = Some(intrinsics);
        self
    }

    fn require_null(&self, what: &str) -> Result<()> {
        match self.state() {
            State::Null => Ok(()),
            state => Err(PipelineError::InvalidGraph(format!(
                "{what} requires the Null state, pipeline is {state:?}"
            ))),
        }
    }

    /// Attaches an eye-image branch.
    pub fn add_sink(&mut self, role: SinkRole, sink: impl Sink<StereoOutput> + 'static) -> Result<()> {
        self.require_null("adding a sink")?;
        self.video_sinks.push((role, Box::new(sink)));
        Ok(())
    }

    /// Attaches a point cloud branch.
    pub fn add_point_sink(&mut self, sink: impl Sink<PointCloudBuffer> + 'static) -> Result<()> {
        self.require_null("adding a sink")?;
        self.point_sinks.push(Box::new(sink));
        Ok(())
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Receiver for bus messages. Every receiver competes for the same
    /// messages; use [`Pipeline::on_message`] to observe all of them.
    pub fn bus(&self) -> flume::Receiver<Message> {
        self.shared.rx.clone()
    }

    pub fn on_message(&self, callback: impl Fn(&Message) + Send + Sync + 'static) {
        *self.shared.callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    pub fn gpu(&self) -> Option<Arc<GpuContext>> {
        self.session.as_ref().map(|s| s.core.ctx.clone())
    }

    /// Lens profile of the session, `None` in desktop-only mode.
    pub fn lens_profile(&self) -> Option<Arc<LensProfile>> {
        self.session.as_ref().and_then(|s| s.lens.clone())
    }

    /// Queue statistics per branch.
    pub fn branch_stats(&self) -> Vec<(String, QueueStats)> {
        let Some(session) = &self.session else {
            return Vec::new();
        };
        let video = session
            .core
            .video
            .branches()
            .iter()
            .map(|q| (q.name().to_string(), q.stats()));
        let points = session
            .core
            .points
            .branches()
            .iter()
            .map(|q| (q.name().to_string(), q.stats()));
        video.chain(points).collect()
    }

    /// Steps through intermediate states until `target` is reached. From
    /// `Error` only `Null` can be reached.
    pub fn set_state(&mut self, target: State) -> Result<()> {
        loop {
            let current = self.state();
            if current == target {
                return Ok(());
            }
            if target == State::Error || (current == State::Error && target != State::Null) {
                return Err(PipelineError::InvalidStateChange {
                    from: current,
                    to: target,
                });
            }
            if current == State::Error {
                self.teardown();
                self.shared.transition(State::Error, State::Null)?;
                continue;
            }

            let next = current.step_toward(target);
            match (current, next) {
                (State::Null, State::Ready) => self.prepare()?,
                (State::Ready, State::Paused) => self.start()?,
                (State::Paused, State::Playing) => self.set_playing(true),
                (State::Playing, State::Paused) => self.set_playing(false),
                (State::Paused, State::Ready) => self.stop()?,
                (State::Ready, State::Null) => self.release()?,
                (from, to) => return Err(PipelineError::InvalidStateChange { from, to }),
            }
            self.shared.transition(current, next)?;
        }
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| PipelineError::InvalidGraph("pipeline has no session".into()))
    }

    /// Null → Ready: resolve devices, create the GPU context, build stages
    /// and start the branch consumers.
    fn prepare(&mut self) -> Result<()> {
        if self.video_sinks.is_empty() {
            return Err(PipelineError::InvalidGraph(
                "pipeline needs at least one video sink".into(),
            ));
        }
        if self.source.is_none() {
            let uri = self
                .uri
                .as_deref()
                .ok_or_else(|| PipelineError::InvalidGraph("source was already consumed".into()))?;
            self.source = Some(open_uri(uri)?);
        }

        let ctx = Arc::new(GpuContext::new(self.config.pipeline.wait_timeout())?);
        let lens = self.resolve_lens()?;
        let stages = self.build_stages(&ctx, lens.clone())?;

        let keep_hmd = lens.is_some();
        let (attached, detached): (Vec<_>, Vec<_>) = std::mem::take(&mut self.video_sinks)
            .into_iter()
            .partition(|(role, _)| keep_hmd || *role == SinkRole::Desktop);
        if attached.is_empty() {
            self.video_sinks = detached;
            return Err(PipelineError::InvalidGraph(
                "no video sink left without an HMD".into(),
            ));
        }
        if !detached.is_empty() {
            debug!(count = detached.len(), "HMD sinks detached");
            if !self.hmd_present {
                self.shared.post(Message::Warning(format!(
                    "{} HMD sink(s) ignored: pipeline was built without an HMD",
                    detached.len()
                )));
            }
        }

        let depth = self.config.pipeline.queue_depth();
        let video_queues: Vec<_> = attached
            .iter()
            .enumerate()
            .map(|(i, (role, _))| Arc::new(BranchQueue::new(format!("{}-{i}", role.as_str()), depth)))
            .collect();
        let point_queues: Vec<_> = (0..self.point_sinks.len())
            .map(|i| Arc::new(BranchQueue::new(format!("points-{i}"), depth)))
            .collect();

        let core = Arc::new(Core {
            ctx,
            video: Tee::new(video_queues.clone()),
            points: Tee::new(point_queues.clone()),
            shared: self.shared.clone(),
            gate: Gate::default(),
            eos_pending: AtomicUsize::new(0),
            eos_posted: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            release: Mutex::new(Release::default()),
        });

        let mut session = Session {
            core: core.clone(),
            lens,
            stages: Some(stages),
            video_workers: Vec::new(),
            point_workers: Vec::new(),
            detached,
            running: None,
        };

        let on_eos: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(move |branch: &str| core.branch_eos(branch));
        let point_sinks = std::mem::take(&mut self.point_sinks);
        if let Err(e) = spawn_workers(&mut session, attached, video_queues, point_sinks, point_queues, &on_eos) {
            self.restore_sinks(session);
            return Err(e);
        }

        info!(
            branches = session.core.branch_count(),
            hmd = session.lens.as_ref().map(|l| l.name.as_str()).unwrap_or("none"),
            layout = ?self.layout,
            "pipeline ready"
        );
        self.session = Some(session);
        Ok(())
    }

    fn resolve_lens(&self) -> Result<Option<Arc<LensProfile>>> {
        if !self.hmd_present {
            return Ok(None);
        }
        match resolve_lens_profile(self.probe.as_ref(), &self.config.hmd) {
            Ok(profile) => Ok(Some(Arc::new(profile))),
            Err(PipelineError::DeviceNotFound(cause)) => {
                self.shared.post(Message::Warning(format!(
                    "{cause}; continuing with desktop output only"
                )));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn build_stages(&self, ctx: &Arc<GpuContext>, lens: Option<Arc<LensProfile>>) -> Result<Stages> {
        let (width, height) = self.eye_resolution;
        let mut settings = CompositorSettings::from_config(
            &self.config.stereo,
            width,
            height,
            self.config.warp.border_color,
        );
        settings.layout = self.layout;
        if let Some(lens) = &lens {
            settings.fov_y_deg = lens.fov_y_deg;
        }
        let compositor = Compositor::new(ctx.clone(), settings)?;

        let warp = match lens {
            Some(lens) => {
                let backend = select_backend(ctx, &self.config.warp);
                Some(WarpStage::new(ctx.clone(), lens, &self.config.warp, backend)?)
            }
            None => None,
        };
        Ok(Stages {
            compositor,
            warp,
            last: None,
        })
    }

    /// Ready → Paused: spawn the source, driver and point threads, held at
    /// the gate until playing.
    fn start(&mut self) -> Result<()> {
        let source = self
            .source
            .take()
            .ok_or_else(|| PipelineError::InvalidGraph("source was already consumed".into()))?;
        let depth = self.config.pipeline.queue_depth();
        let refresh = match self.config.pipeline.refresh_hz {
            0 => None,
            hz => Some(Duration::from_secs(1) / hz),
        };
        let intrinsics = self.intrinsics;
        let point_config = self.config.point_cloud.clone();
        let wait_timeout = self.config.pipeline.wait_timeout();

        let session = self.session_mut()?;
        let stages = session
            .stages
            .take()
            .ok_or_else(|| PipelineError::InvalidGraph("stages are already running".into()))?;
        let core = session.core.clone();
        let with_points = !session.point_workers.is_empty();
        core.rearm(1 + usize::from(with_points));

        let (video_tx, video_rx) = flume::bounded(depth);
        let driver = {
            let core = core.clone();
            thread::Builder::new()
                .name("vrcast-driver".into())
                .spawn(move || drive(core, stages, video_rx, refresh))?
        };

        let (points_tx, points) = if !with_points {
            (None, None)
        } else {
            let (tx, rx) = flume::bounded(depth * 2);
            let core = core.clone();
            let handle = thread::Builder::new()
                .name("vrcast-points".into())
                .spawn(move || build_points(core, rx, intrinsics, point_config, wait_timeout))?;
            (Some(tx), Some(handle))
        };

        let source = thread::Builder::new()
            .name("vrcast-source".into())
            .spawn(move || pump(core, source, video_tx, points_tx))?;

        session.running = Some(Running {
            source,
            driver,
            points,
        });
        Ok(())
    }

    fn set_playing(&mut self, playing: bool) {
        if let Some(session) = &self.session {
            session.core.gate.set_playing(playing);
        }
    }

    /// Paused → Ready: stop the threads and drop whatever is queued.
    fn stop(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(running) = session.running.take() else {
            return Ok(());
        };
        session.core.gate.stop();

        match running.source.join() {
            Ok(source) => self.source = Some(source),
            Err(_) => warn!("source thread panicked"),
        }
        match running.driver.join() {
            Ok(stages) => session.stages = Some(stages),
            Err(_) => warn!("driver thread panicked"),
        }
        if let Some(points) = running.points {
            if points.join().is_err() {
                warn!("point cloud thread panicked");
            }
        }

        let dropped = session.core.video.flush() + session.core.points.flush();
        debug!(dropped, "pipeline stopped");
        session.core.ctx.wait_idle(session.core.ctx.wait_timeout())
    }

    /// Ready → Null: stop consumers, hand sinks back and release the GPU
    /// context once all in-flight work completed.
    fn release(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        session.stages = None;
        let ctx = session.core.ctx.clone();
        self.restore_sinks(session);
        if self.uri.is_some() {
            // reopened from the start on the next run
            self.source = None;
        }
        let idle = ctx.shutdown();
        info!("pipeline released");
        idle
    }

    fn restore_sinks(&mut self, session: Session) {
        session.core.video.close();
        session.core.points.close();
        for (role, worker) in session.video_workers {
            if let Some(sink) = worker.join() {
                self.video_sinks.push((role, sink));
            }
        }
        for worker in session.point_workers {
            if let Some(sink) = worker.join() {
                self.point_sinks.push(sink);
            }
        }
        self.video_sinks.extend(session.detached);
    }

    /// Error → Null
    fn teardown(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "stop after failure");
        }
        if let Err(e) = self.release() {
            warn!(error = %e, "release after failure");
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.set_state(State::Null) {
            warn!(error = %e, "pipeline teardown failed");
        }
    }
}

fn spawn_workers(
    session: &mut Session,
    sinks: Vec<(SinkRole, Box<dyn Sink<StereoOutput>>)>,
    queues: Vec<Arc<BranchQueue<StereoOutput>>>,
    point_sinks: Vec<Box<dyn Sink<PointCloudBuffer>>>,
    point_queues: Vec<Arc<BranchQueue<PointCloudBuffer>>>,
    on_eos: &Arc<dyn Fn(&str) + Send + Sync>,
) -> Result<()> {
    for ((role, sink), queue) in sinks.into_iter().zip(queues) {
        let worker = BranchWorker::spawn(queue, sink, POLL, on_eos.clone())?;
        session.video_workers.push((role, worker));
    }
    for (sink, queue) in point_sinks.into_iter().zip(point_queues) {
        let worker = BranchWorker::spawn(queue, sink, POLL, on_eos.clone())?;
        session.point_workers.push(worker);
    }
    Ok(())
}

fn select_backend(ctx: &GpuContext, config: &WarpConfig) -> WarpBackend {
    if config.backend == GpuBackend::Software {
        return WarpBackend::Software;
    }
    match WgpuWarp::new_blocking(config.backend, ctx.loss_reporter()) {
        Ok(gpu) => {
            info!(adapter = %gpu.adapter_name, "warp runs on the GPU");
            WarpBackend::Wgpu(Arc::new(gpu))
        }
        Err(e) => {
            warn!(error = %e, "GPU warp unavailable, using the software kernel");
            WarpBackend::Software
        }
    }
}

/// Sends without blocking past a stop request.
fn send<T>(core: &Core, tx: &flume::Sender<T>, mut item: T) -> bool {
    loop {
        match tx.send_timeout(item, POLL) {
            Ok(()) => return true,
            Err(flume::SendTimeoutError::Timeout(back)) => {
                if core.gate.is_stopped() {
                    return false;
                }
                item = back;
            }
            Err(flume::SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Source thread: pulls items and routes them to the video and point paths.
fn pump(
    core: Arc<Core>,
    mut source: Box<dyn FrameSource>,
    video: flume::Sender<Flow<VideoInput>>,
    points: Option<flume::Sender<Flow<PointInput>>>,
) -> Box<dyn FrameSource> {
    debug!(source = %source.describe(), "source thread started");
    while core.gate.wait_playing() {
        let delivered = match source.next_item() {
            Ok(Some(SourceItem::Video(raw))) => send(&core, &video, Flow::Item(VideoInput::Mono(raw))),
            Ok(Some(SourceItem::StereoPair { left, right })) => {
                send(&core, &video, Flow::Item(VideoInput::Pair { left, right }))
            }
            Ok(Some(SourceItem::Depth(raw))) => match &points {
                Some(tx) => send(&core, tx, Flow::Item(PointInput::Depth(raw))),
                None => true,
            },
            Ok(Some(SourceItem::Color(raw))) => match &points {
                Some(tx) => send(&core, tx, Flow::Item(PointInput::Color(raw))),
                None => true,
            },
            Ok(None) => {
                debug!(source = %source.describe(), "source exhausted");
                send(&core, &video, Flow::End);
                if let Some(tx) = &points {
                    send(&core, tx, Flow::End);
                }
                break;
            }
            Err(e) => core.absorb(e, "source item"),
        };
        if !delivered {
            break;
        }
    }
    source
}

fn upload_video(ctx: &GpuContext, input: VideoInput, sequence: u64) -> Result<CompositorInput> {
    Ok(match input {
        VideoInput::Mono(raw) => CompositorInput::Mono(ctx.upload(&raw, sequence)?),
        VideoInput::Pair { left, right } => CompositorInput::Pair {
            left: ctx.upload(&left, sequence)?,
            right: ctx.upload(&right, sequence)?,
        },
    })
}

/// Driver thread: the single submitter of the eye-image chain.
fn drive(
    core: Arc<Core>,
    mut stages: Stages,
    rx: flume::Receiver<Flow<VideoInput>>,
    refresh: Option<Duration>,
) -> Stages {
    let poll = refresh.unwrap_or(POLL);
    let mut sequence = 0u64;
    let mut ended = false;

    while core.gate.wait_playing() {
        if let Some(cause) = core.ctx.lost_cause() {
            core.fail(PipelineError::GpuContextLost(cause).to_string());
            break;
        }
        if ended {
            core.gate.wait_stopped(poll);
            continue;
        }

        let result = match rx.recv_timeout(poll) {
            Ok(Flow::Item(input)) => {
                sequence += 1;
                upload_video(&core.ctx, input, sequence).and_then(|input| stages.present(Some(&input)))
            }
            Ok(Flow::End) => {
                ended = true;
                if !core.is_failed() {
                    core.video.end_of_stream();
                }
                continue;
            }
            Err(flume::RecvTimeoutError::Timeout) if refresh.is_some() => stages.present(None),
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => {
                ended = true;
                continue;
            }
        };

        match result {
            Ok(Some(output)) if !core.is_failed() => {
                core.video.push(output);
            }
            Ok(_) => {}
            Err(e) => {
                if !core.absorb(e, "video frame") {
                    break;
                }
            }
        }
    }

    stages.reset();
    core.released();
    stages
}

/// Point cloud thread, independent of the eye-image path.
fn build_points(
    core: Arc<Core>,
    rx: flume::Receiver<Flow<PointInput>>,
    intrinsics: Option<CameraIntrinsics>,
    config: PointCloudConfig,
    wait_timeout: Duration,
) {
    let mut builder = intrinsics.map(|i| PointCloudBuilder::new(i, config, wait_timeout));
    let mut warned = false;
    let mut sequence = 0u64;
    let mut ended = false;

    while core.gate.wait_playing() {
        if ended {
            core.gate.wait_stopped(POLL);
            continue;
        }
        let mut end_of_stream = false;
        let input = match rx.recv_timeout(POLL) {
            Ok(Flow::Item(input)) => Some(input),
            Ok(Flow::End) => {
                ended = true;
                end_of_stream = true;
                None
            }
            Err(flume::RecvTimeoutError::Timeout) => None,
            Err(flume::RecvTimeoutError::Disconnected) => {
                ended = true;
                None
            }
        };

        let result = match (builder.as_mut(), input) {
            (None, Some(_)) => {
                if !warned {
                    warned = true;
                    core.shared.post(Message::Warning(
                        "depth input without camera intrinsics; point clouds disabled".into(),
                    ));
                }
                Ok(Vec::new())
            }
            (None, None) => Ok(Vec::new()),
            (Some(builder), Some(PointInput::Color(raw))) => {
                sequence += 1;
                core.ctx
                    .upload(&raw, sequence)
                    .and_then(|frame| builder.push_color(frame))
                    .and_then(|()| builder.poll(Instant::now()))
                    .map(Vec::from_iter)
            }
            (Some(builder), Some(PointInput::Depth(raw))) => {
                sequence += 1;
                core.ctx
                    .upload(&raw, sequence)
                    .and_then(|frame| builder.push_depth(frame, Instant::now()))
            }
            (Some(builder), None) if end_of_stream => builder.flush().map(Vec::from_iter),
            (Some(builder), None) => builder.poll(Instant::now()).map(Vec::from_iter),
        };

        match result {
            Ok(clouds) => {
                if !core.is_failed() {
                    for cloud in clouds {
                        core.points.push(cloud);
                    }
                }
            }
            Err(e) => {
                if !core.absorb(e, "depth/colour frame") {
                    break;
                }
            }
        }
        if end_of_stream && !core.is_failed() {
            core.points.end_of_stream();
        }
    }

    if let Some(builder) = builder.as_mut() {
        builder.clear();
    }
    core.released();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_are_adjacent() {
        assert_eq!(State::Null.step_toward(State::Playing), State::Ready);
        assert_eq!(State::Paused.step_toward(State::Playing), State::Playing);
        assert_eq!(State::Playing.step_toward(State::Null), State::Paused);
        assert_eq!(State::Ready.step_toward(State::Null), State::Null);
    }

    #[test]
    fn test_gate_releases_on_stop() {
        let gate = Arc::new(Gate::default());
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait_playing())
        };
        thread::sleep(Duration::from_millis(30));
        gate.stop();
        assert!(!waiter.join().unwrap());
    }
}
