//! Shared server state.

use std::sync::Arc;
use std::time::Instant;

use joblet_executor::runtime::RuntimeManager;
use joblet_executor::volume::VolumeManager;
use joblet_supervisor::{Supervisor, WorkflowEngine};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub engine: WorkflowEngine,
    pub runtimes: Arc<RuntimeManager>,
    pub volumes: Arc<VolumeManager>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        supervisor: Supervisor,
        engine: WorkflowEngine,
        runtimes: Arc<RuntimeManager>,
        volumes: Arc<VolumeManager>,
    ) -> Self {
        Self {
            supervisor,
            engine,
            runtimes,
            volumes,
            started_at: Instant::now(),
        }
    }
}
