//! Asynchronous log and metrics pipeline for Joblet.
//!
//! ```text
//! child stdout/stderr -> reader thread -> per-job backlog
//!                                          |-> writer task -> disk
//!                                          |-> subscriber fan-out
//!                                          '-> IPC event sink
//! ```
//!
//! Producers are rate-decoupled from consumers: the backlog absorbs bursts,
//! an overflow policy handles sustained pressure, and job completion opens a
//! bounded drain window before subscribers see the terminal marker.

pub mod buffer;
pub mod hub;
pub mod metrics;
pub mod sink;

pub use buffer::Backlog;
pub use hub::{LogHub, LogProducer};
pub use metrics::{MetricsCollector, MetricsHub, SampleSource};
pub use sink::IpcSink;

/// Capacity of each subscriber's delivery channel, in events.
pub(crate) const SUBSCRIBER_CHANNEL_CAPACITY: usize = 1024;
