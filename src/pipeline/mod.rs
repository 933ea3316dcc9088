//! Local event pipeline: bounded buffer → dispatcher thread → sink.

mod buffer;
mod dispatcher;
mod sink;
mod stats;

pub use buffer::{BufferEntry, EnqueueOutcome, EventBuffer};
pub use dispatcher::Dispatcher;
pub use sink::{EventSink, TcpSink};
pub use stats::{PipelineStats, StatsSnapshot};
