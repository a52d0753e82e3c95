//! Pipeline assembly: state machine, fan-out queues and sinks

pub mod graph;
pub mod ringbuf;
pub mod sink;
pub mod tee;

pub use graph::{Message, Pipeline, PipelineSpec, State};
pub use ringbuf::{BranchQueue, Pop, QueueStats};
pub use sink::{
    BranchItem, BranchWorker, ChannelSink, CollectingSink, NullSink, Sink, SinkEvent, SinkRole,
    SnapshotSink,
};
pub use tee::Tee;
