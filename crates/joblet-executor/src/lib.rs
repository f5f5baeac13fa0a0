//! Job isolation and execution for Joblet.
//!
//! The executor owns everything between "the supervisor accepted a job" and
//! "a PID is running the user command inside its own namespaces":
//! - cgroup v2 creation, limits, stats, teardown
//! - the isolation plan derived from a job spec
//! - the two-stage spawn (supervisor side) and the isolated-init path
//!   (child side, entered via `EXEC_MODE=isolated-init`)
//! - bridge/host/none network attachment
//! - runtime tree resolution, named volumes, GPU device admission

pub mod cgroup;
pub mod gpu;
pub mod init;
pub mod network;
pub mod plan;
pub mod runtime;
pub mod spawn;
pub mod volume;

pub use cgroup::{CgroupHandle, CgroupManager, RawSample};
pub use plan::{BindMount, DeviceNode, IsolationPlan};
pub use runtime::{RuntimeDescriptor, RuntimeManager};
pub use spawn::{JobSpawner, SpawnedJob};
pub use volume::{VolumeInfo, VolumeManager};

/// Environment variable that routes the re-exec'd binary into the
/// isolated-init entry point.
pub const EXEC_MODE_ENV: &str = "EXEC_MODE";
pub const EXEC_MODE_INIT: &str = "isolated-init";

/// `JOB_TYPE=runtime-build` relaxes isolation for runtime installation jobs.
pub const JOB_TYPE_ENV: &str = "JOB_TYPE";
pub const JOB_TYPE_RUNTIME_BUILD: &str = "runtime-build";

/// Exit code reported when the init process fails before exec'ing the user
/// command.
pub const PRE_EXEC_FAILURE_CODE: i32 = 255;
