//! Consumer surfaces and the threads that service each branch

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::frame::StereoOutput;
use crate::pipeline::ringbuf::{BranchQueue, Pop};
use crate::stages::point_cloud::PointCloudBuffer;
use crate::stages::raster::{self, RgbaView};

/// Items that travel through fan-out branches.
pub trait BranchItem: Clone + Send + 'static {
    fn sequence(&self) -> u64;
    /// When the item was produced, for latency accounting
    fn created(&self) -> Instant;
}

impl BranchItem for StereoOutput {
    fn sequence(&self) -> u64 {
        StereoOutput::sequence(self)
    }

    fn created(&self) -> Instant {
        self.frames()
            .first()
            .map(|frame| frame.timestamp)
            .unwrap_or_else(Instant::now)
    }
}

impl BranchItem for PointCloudBuffer {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn created(&self) -> Instant {
        self.created
    }
}

/// A surface that accepts finished items.
pub trait Sink<T>: Send {
    fn render(&mut self, item: T) -> Result<()>;

    fn end_of_stream(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SinkRole {
    /// Desktop preview window
    Desktop,
    /// Head-mounted display surface
    Hmd,
}

impl SinkRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SinkRole::Desktop => "desktop",
            SinkRole::Hmd => "hmd",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SinkEvent<T> {
    Item(T),
    Eos,
}

/// Forwards everything to a channel read by an external surface.
pub struct ChannelSink<T> {
    tx: flume::Sender<SinkEvent<T>>,
}

impl<T: Send> ChannelSink<T> {
    pub fn new(tx: flume::Sender<SinkEvent<T>>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end, buffering at most `capacity` events.
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<SinkEvent<T>>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self::new(tx), rx)
    }
}

impl<T: Send> Sink<T> for ChannelSink<T> {
    fn render(&mut self, item: T) -> Result<()> {
        self.tx
            .send(SinkEvent::Item(item))
            .map_err(|_| PipelineError::Io("sink receiver disconnected".into()))
    }

    fn end_of_stream(&mut self) -> Result<()> {
        self.tx
            .send(SinkEvent::Eos)
            .map_err(|_| PipelineError::Io("sink receiver disconnected".into()))
    }
}

struct Collected<T> {
    items: Vec<T>,
    eos: usize,
}

/// Records what it receives. Clones share the same record.
pub struct CollectingSink<T> {
    inner: Arc<Mutex<Collected<T>>>,
    delay: Duration,
}

impl<T> Clone for CollectingSink<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            delay: self.delay,
        }
    }
}

impl<T> Default for CollectingSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CollectingSink<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Collected {
                items: Vec::new(),
                eos: 0,
            })),
            delay: Duration::ZERO,
        }
    }

    /// Simulates a slow consumer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn eos_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).eos
    }

    pub fn items(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).items.clone()
    }
}

impl<T: Send> Sink<T> for CollectingSink<T> {
    fn render(&mut self, item: T) -> Result<()> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).items.push(item);
        Ok(())
    }

    fn end_of_stream(&mut self) -> Result<()> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).eos += 1;
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl<T> Sink<T> for NullSink {
    fn render(&mut self, _item: T) -> Result<()> {
        Ok(())
    }
}

/// Writes every `every`-th frame as PNG into `dir`.
pub struct SnapshotSink {
    dir: PathBuf,
    every: u64,
    seen: u64,
    wait_timeout: Duration,
}

impl SnapshotSink {
    pub fn new(dir: impl Into<PathBuf>, every: u64, wait_timeout: Duration) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            every: every.max(1),
            seen: 0,
            wait_timeout,
        })
    }
}

impl Sink<StereoOutput> for SnapshotSink {
    fn render(&mut self, item: StereoOutput) -> Result<()> {
        self.seen += 1;
        if (self.seen - 1) % self.every != 0 {
            return Ok(());
        }
        for (i, frame) in item.frames().into_iter().enumerate() {
            let mapped = frame.map_wait(self.wait_timeout)?;
            let view = RgbaView {
                data: &mapped[..],
                width: mapped.meta.width,
                height: mapped.meta.height,
                stride: mapped.meta.stride as usize,
            };
            let pixels = raster::extract(&view, 0, 0, view.width, view.height);
            let path = self
                .dir
                .join(format!("frame-{:06}-{}.png", mapped.meta.sequence, i));
            image::save_buffer(&path, &pixels, view.width, view.height, image::ColorType::Rgba8)?;
            debug!(path = %path.display(), "snapshot written");
        }
        Ok(())
    }

    fn end_of_stream(&mut self) -> Result<()> {
        info!(frames = self.seen, dir = %self.dir.display(), "snapshot sink finished");
        Ok(())
    }
}

/// Consumer thread servicing one branch queue.
pub struct BranchWorker<T> {
    name: String,
    queue: Arc<BranchQueue<T>>,
    handle: Option<JoinHandle<Box<dyn Sink<T>>>>,
}

impl<T: BranchItem> BranchWorker<T> {
    /// Starts servicing `queue`. `on_eos` runs on the worker thread each
    /// time the branch observes end of stream.
    pub fn spawn(
        queue: Arc<BranchQueue<T>>,
        mut sink: Box<dyn Sink<T>>,
        poll: Duration,
        on_eos: Arc<dyn Fn(&str) + Send + Sync>,
    ) -> Result<Self> {
        let name = queue.name().to_string();
        let worker_queue = queue.clone();
        let handle = thread::Builder::new()
            .name(format!("vrcast-{name}"))
            .spawn(move || {
                let branch = worker_queue.name().to_string();
                loop {
                    match worker_queue.pop_timeout(poll) {
                        Pop::Item(item) => {
                            let seq = item.sequence();
                            let latency = item.created().elapsed();
                            match sink.render(item) {
                                Ok(()) => {
                                    metrics::counter!("vrcast_frames_presented", "branch" => branch.clone())
                                        .increment(1);
                                    metrics::histogram!("vrcast_frame_latency_ms", "branch" => branch.clone())
                                        .record(latency.as_secs_f64() * 1000.0);
                                }
                                Err(e) => warn!(branch = %branch, seq, error = %e, "sink failed to render"),
                            }
                        }
                        Pop::Eos => {
                            if let Err(e) = sink.end_of_stream() {
                                warn!(branch = %branch, error = %e, "sink failed at end of stream");
                            }
                            debug!(branch = %branch, "end of stream");
                            on_eos(&branch);
                        }
                        Pop::Closed => break,
                        Pop::Timeout => {}
                    }
                }
                sink
            })?;

        Ok(Self {
            name,
            queue,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<BranchQueue<T>> {
        &self.queue
    }

    /// Closes the queue, waits for the consumer to finish, and hands the
    /// sink back.
    pub fn join(mut self) -> Option<Box<dyn Sink<T>>> {
        self.queue.close();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(sink) => Some(sink),
            Err(_) => {
                warn!(branch = %self.name, "branch consumer panicked");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::point_cloud::Point;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cloud(sequence: u64) -> PointCloudBuffer {
        PointCloudBuffer {
            points: Arc::from(vec![Point {
                position: [0.0, 0.0, 1.0],
                color: [1, 2, 3, 4],
            }]),
            pts: Duration::ZERO,
            sequence,
            width: 1,
            height: 1,
            color_matched: false,
            created: Instant::now(),
        }
    }

    #[test]
    fn test_worker_delivers_items_then_eos() {
        let queue = Arc::new(BranchQueue::new("points", 4));
        let sink = CollectingSink::new();
        let eos_seen = Arc::new(AtomicUsize::new(0));
        let counter = eos_seen.clone();
        let worker = BranchWorker::spawn(
            queue.clone(),
            Box::new(sink.clone()),
            Duration::from_millis(5),
            Arc::new(move |_: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        queue.push(cloud(1));
        queue.push(cloud(2));
        queue.end_of_stream();

        let deadline = Instant::now() + Duration::from_secs(2);
        while eos_seen.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(worker.join().is_some());
        let seqs: Vec<u64> = sink.items().iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(sink.eos_count(), 1);
        assert_eq!(eos_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_sink_forwards_eos() {
        let (mut sink, rx) = ChannelSink::bounded(2);
        sink.render(cloud(3)).unwrap();
        sink.end_of_stream().unwrap();
        assert!(matches!(rx.recv().unwrap(), SinkEvent::Item(c) if c.sequence == 3));
        assert!(matches!(rx.recv().unwrap(), SinkEvent::Eos));
    }
}
