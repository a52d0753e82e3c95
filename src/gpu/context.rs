//! GPU submission context
//!
//! Work is submitted from the pipeline driver thread and executed in order on a
//! dedicated executor thread. `submit` hands back the output frame at once; its
//! fence signals when the kernel has written the slot. Any failed job marks the
//! context lost, after which every submission fails with `GpuContextLost`.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info};

use crate::error::{PipelineError, Result};
use crate::frame::frame::{Frame, FrameMetadata, MappedFrame, RawImage, Residency};
use crate::frame::upload;
use crate::gpu::arena::FrameArena;
use crate::gpu::fence::{Fence, FenceState};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct LostFlag {
    cause: Mutex<Option<String>>,
}

impl LostFlag {
    fn set(&self, cause: String) -> bool {
        let mut guard = self.cause.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(cause);
            true
        } else {
            false
        }
    }

    fn get(&self) -> Option<String> {
        self.cause.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct GpuContext {
    arena: Arc<FrameArena>,
    jobs: Mutex<Option<flume::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    lost: Arc<LostFlag>,
    last_fence: Mutex<Fence>,
    wait_timeout: Duration,
}

impl GpuContext {
    /// Spawns the executor thread. `wait_timeout` bounds every wait a job
    /// performs on its input fences.
    pub fn new(wait_timeout: Duration) -> Result<Self> {
        let (tx, rx) = flume::unbounded::<Job>();
        let worker = thread::Builder::new()
            .name("vrcast-gpu".into())
            .spawn(move || {
                for job in rx.iter() {
                    job();
                }
                debug!("GPU executor drained");
            })?;

        info!("GPU context created");
        Ok(Self {
            arena: Arc::new(FrameArena::new()),
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            lost: Arc::new(LostFlag::default()),
            last_fence: Mutex::new(Fence::signaled()),
            wait_timeout,
        })
    }

    pub fn arena(&self) -> &Arc<FrameArena> {
        &self.arena
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    pub fn is_lost(&self) -> bool {
        self.lost.get().is_some()
    }

    pub fn lost_cause(&self) -> Option<String> {
        self.lost.get()
    }

    /// Flags the context as unusable. Returns false if it was already lost.
    pub fn mark_lost(&self, cause: impl Into<String>) -> bool {
        let cause = cause.into();
        let first = self.lost.set(cause.clone());
        if first {
            error!(cause = %cause, "GPU context lost");
        }
        first
    }

    /// A closure that marks this context lost, for device error callbacks.
    pub fn loss_reporter(&self) -> impl Fn(String) + Send + Sync + 'static {
        let lost = self.lost.clone();
        move |cause| {
            if lost.set(cause.clone()) {
                error!(cause = %cause, "GPU device reported an error");
            }
        }
    }

    /// Moves CPU pixels into device storage, converting to the device format.
    pub fn upload(&self, raw: &RawImage, sequence: u64) -> Result<Frame> {
        self.check_alive()?;
        let converted = upload::convert(raw)?;
        let meta = upload::metadata(raw, &converted, sequence, Residency::Device);
        let handle = self.arena.allocate(converted.data);
        Ok(Frame::device(
            self.arena.clone(),
            handle,
            Fence::signaled(),
            meta,
        ))
    }

    /// Queues `kernel` over `inputs`. The returned frame is pending until the
    /// kernel's output has been written.
    pub fn submit<F>(
        &self,
        label: &'static str,
        inputs: Vec<Frame>,
        meta: FrameMetadata,
        kernel: F,
    ) -> Result<Frame>
    where
        F: FnOnce(&[MappedFrame]) -> Result<Vec<u8>> + Send + 'static,
    {
        self.check_alive()?;

        let handle = self.arena.allocate_pending();
        let fence = Fence::pending();
        let expected_len = meta.stride as usize * meta.height as usize;
        let output = Frame::device(self.arena.clone(), handle, fence.clone(), meta);

        let job_output = output.clone();
        let job_fence = fence.clone();
        let arena = self.arena.clone();
        let lost = self.lost.clone();
        let timeout = self.wait_timeout;

        let job: Job = Box::new(move || {
            if let Some(cause) = lost.get() {
                debug!(label, cause = %cause, "skipping job on lost context");
                job_fence.fail();
                return;
            }

            let start = Instant::now();
            let result = inputs
                .iter()
                .map(|frame| frame.map_wait(timeout))
                .collect::<Result<Vec<_>>>()
                .and_then(|mapped| kernel(&mapped))
                .and_then(|data| {
                    if data.len() != expected_len {
                        return Err(PipelineError::GpuContextLost(format!(
                            "{label} wrote {} bytes, expected {expected_len}",
                            data.len()
                        )));
                    }
                    arena.fill(handle, Bytes::from(data))
                });

            match result {
                Ok(()) => {
                    job_fence.signal();
                    metrics::histogram!("vrcast_gpu_job_time_us", "job" => label)
                        .record(start.elapsed().as_micros() as f64);
                }
                Err(err) => {
                    if lost.set(err.to_string()) {
                        error!(label, error = %err, "GPU job failed, context lost");
                    }
                    job_fence.fail();
                }
            }
            drop(job_output);
        });

        let sender = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| PipelineError::GpuContextLost("context shut down".into()))?;
        sender
            .send(job)
            .map_err(|_| PipelineError::GpuContextLost("executor stopped".into()))?;

        *self.last_fence.lock().unwrap_or_else(|e| e.into_inner()) = fence;
        Ok(output)
    }

    /// Blocks until every submitted job has completed.
    pub fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let fence = self
            .last_fence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match fence.wait_timeout(timeout) {
            FenceState::Pending => Err(PipelineError::timeout(timeout, "GPU idle")),
            _ => Ok(()),
        }
    }

    /// Waits for in-flight work, then stops the executor.
    pub fn shutdown(&self) -> Result<()> {
        let idle = self.wait_idle(self.wait_timeout);
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            if idle.is_ok() {
                let _ = worker.join();
            }
        }
        info!(live_frames = self.arena.live_count(), "GPU context shut down");
        idle
    }

    fn check_alive(&self) -> Result<()> {
        match self.lost.get() {
            Some(cause) => Err(PipelineError::GpuContextLost(cause)),
            None => Ok(()),
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::frame::PixelFormat;

    fn rgba_raw(width: u32, height: u32, value: u8) -> RawImage {
        RawImage::new(
            vec![value; (width * height * 4) as usize],
            width,
            height,
            PixelFormat::Rgba8,
        )
    }

    #[test]
    fn test_submit_produces_new_frame() {
        let ctx = GpuContext::new(Duration::from_secs(2)).unwrap();
        let input = ctx.upload(&rgba_raw(2, 2, 10), 1).unwrap();
        let meta = (*input.meta).clone();

        let output = ctx
            .submit("invert", vec![input.clone()], meta, |inputs| {
                Ok(inputs[0].iter().map(|v| 255 - v).collect())
            })
            .unwrap();

        let view = output.map_wait(Duration::from_secs(2)).unwrap();
        assert!(view.iter().all(|&v| v == 245));
        // input untouched
        assert!(input.map().unwrap().iter().all(|&v| v == 10));
        assert!(!output.shares_storage(&input));
    }

    #[test]
    fn test_failed_job_marks_context_lost() {
        let ctx = GpuContext::new(Duration::from_secs(2)).unwrap();
        let input = ctx.upload(&rgba_raw(1, 1, 0), 1).unwrap();
        let meta = (*input.meta).clone();

        let output = ctx
            .submit("truncated", vec![input.clone()], meta.clone(), |_| Ok(vec![0u8; 1]))
            .unwrap();
        assert_eq!(output.fence().wait_timeout(Duration::from_secs(2)), FenceState::Failed);
        assert!(ctx.is_lost());
        assert!(matches!(
            ctx.submit("after", vec![input], meta, |_| Ok(vec![0u8; 4])),
            Err(PipelineError::GpuContextLost(_))
        ));
    }

    #[test]
    fn test_upload_rejects_unsupported_without_losing_context() {
        let ctx = GpuContext::new(Duration::from_secs(1)).unwrap();
        let raw = RawImage::new(vec![0u8; 6], 2, 2, PixelFormat::Nv12);
        assert!(matches!(
            ctx.upload(&raw, 0),
            Err(PipelineError::UnsupportedFormat(_))
        ));
        assert!(!ctx.is_lost());
    }

    #[test]
    fn test_shutdown_waits_for_in_flight_work() {
        let ctx = GpuContext::new(Duration::from_secs(2)).unwrap();
        let input = ctx.upload(&rgba_raw(1, 1, 1), 1).unwrap();
        let meta = (*input.meta).clone();
        let output = ctx
            .submit("slow", vec![input], meta, |inputs| {
                thread::sleep(Duration::from_millis(30));
                Ok(inputs[0].to_vec())
            })
            .unwrap();
        ctx.shutdown().unwrap();
        assert!(output.fence().is_signaled());
    }
}
