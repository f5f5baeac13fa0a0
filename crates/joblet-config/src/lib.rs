//! Daemon configuration and workflow file parsing for Joblet.

pub mod error;
pub mod system;
pub mod variables;
pub mod workflow;

pub use error::{ConfigError, ConfigResult};
pub use system::JobletConfig;
pub use variables::EnvScope;
pub use workflow::{JobEntry, RequireEntry, ResourceEntry, WorkflowFile};
