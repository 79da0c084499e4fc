//! Per-request analytics.
//!
//! Core components:
//! - `record`: the immutable `AnalyticsRecord` emitted once per dispatch attempt
//! - `sink`: fire-and-forget destinations for records
//! - `gc`: best-effort reclamation-pause counters
//! - `request_id`: how attempts map to request ids
//! - `wrapper`: the `Instrumented` decorator around an application

pub mod gc;
pub mod record;
pub mod request_id;
pub mod sink;
pub mod wrapper;

pub use gc::{GcProbe, NoGcProbe, PauseCounter};
pub use record::AnalyticsRecord;
pub use request_id::RequestIdPolicy;
pub use sink::{AnalyticsSink, ChannelSink, JsonLinesSink, MemorySink, TracingSink};
pub use wrapper::{ABORTED_ERROR_KIND, DispatchContext, Instrumented, PANIC_ERROR_KIND};
