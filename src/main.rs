//! vrcast: stereo eye images for a head-mounted display from a video source

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use vrcast::pipeline::{Message, NullSink, Sink, SinkRole, SnapshotSink};
use vrcast::stages::point_cloud::PointCloudBuffer;
use vrcast::{CameraIntrinsics, Config, Pipeline, PipelineSpec, State};

#[derive(Parser)]
#[command(name = "vrcast")]
#[command(about = "Stereo eye images for a head-mounted display from a video source")]
#[command(version)]
struct Args {
    /// Source URI: testsrc://, file:// or any URI GStreamer can decode
    #[arg(default_value = "testsrc://")]
    uri: String,

    /// Configuration file
    #[arg(short, long, default_value = "vrcast.toml")]
    config: PathBuf,

    /// Snapshot directory for the desktop branch
    #[arg(short, long, default_value = "vrcast-out")]
    out: PathBuf,

    /// Write every n-th desktop frame
    #[arg(short, long, default_value = "30")]
    every: u64,

    /// Attach a headset branch
    #[arg(long)]
    hmd: bool,
}

/// Logs a summary of every n-th point cloud.
struct PointSummary {
    every: u64,
    seen: u64,
}

impl Sink<PointCloudBuffer> for PointSummary {
    fn render(&mut self, cloud: PointCloudBuffer) -> vrcast::Result<()> {
        self.seen += 1;
        if (self.seen - 1) % self.every == 0 {
            info!(
                seq = cloud.sequence,
                points = cloud.len(),
                colored = cloud.color_matched,
                "point cloud"
            );
        }
        Ok(())
    }

    fn end_of_stream(&mut self) -> vrcast::Result<()> {
        info!(clouds = self.seen, "point cloud branch finished");
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vrcast=info"));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("vrcast launching...");

    let args = Args::parse();
    let config = Config::load(Some(args.config.as_path()))?;
    vrcast::CONFIG.store(Arc::new(config.clone()));

    let spec = PipelineSpec::new(args.uri.as_str())
        .with_layout(config.stereo.layout)
        .with_hmd(args.hmd);
    let mut pipeline = Pipeline::new(spec);
    if args.uri.contains("depth") {
        pipeline = pipeline.with_intrinsics(CameraIntrinsics::kinect_v1());
        pipeline.add_point_sink(PointSummary {
            every: args.every.max(1),
            seen: 0,
        })?;
    }

    pipeline.add_sink(
        SinkRole::Desktop,
        SnapshotSink::new(&args.out, args.every, config.pipeline.wait_timeout())?,
    )?;
    if args.hmd {
        // headset presentation is platform specific; keep the branch paced
        pipeline.add_sink(SinkRole::Hmd, NullSink)?;
    }

    let bus = pipeline.bus();
    pipeline.set_state(State::Playing)?;
    info!(uri = %args.uri, out = %args.out.display(), "playing");

    let mut failure = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            msg = bus.recv_async() => match msg {
                Ok(Message::Eos) => break,
                Ok(Message::Error { cause }) => {
                    error!(cause = %cause, "pipeline failed");
                    failure = Some(cause);
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }

    for (branch, stats) in pipeline.branch_stats() {
        info!(
            branch = %branch,
            written = stats.written,
            read = stats.read,
            dropped = stats.dropped,
            "branch summary"
        );
    }
    pipeline.set_state(State::Null)?;

    match failure {
        Some(cause) => Err(eyre!(cause)),
        None => Ok(()),
    }
}
