//! Job lifecycle supervision and workflow orchestration for Joblet.
//!
//! The [`Supervisor`] is the write path for everything job-shaped: it
//! validates requests, drives the two-stage spawn, owns the state
//! transitions, and wires each job into the log and metrics pipelines. The
//! [`workflow::WorkflowEngine`] sits on top, dispatching ready jobs from
//! declarative YAML graphs through the same supervisor.

pub mod metrics_source;
pub mod scheduler;
pub mod supervisor;
pub mod workflow;

pub use supervisor::{StartOutcome, Supervisor};
pub use workflow::{JobDispatcher, WorkflowEngine};
