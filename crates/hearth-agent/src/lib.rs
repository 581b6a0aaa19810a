//! Node-local agent core: hosts server processes in environments and
//! provisions their files through a pipeline of registered operations.

pub mod config;
pub mod console;
pub mod environment;
pub mod error;
pub mod operations;
pub mod pipeline;
pub mod server;
pub mod supervise;
pub mod tokens;

pub use environment::{CompletionCallback, Environment, EnvironmentOptions};
pub use error::{EnvironmentError, OperationError, PipelineError};
pub use hearth_process::{EnvironmentId, EnvironmentKind, ExitReport, RunState};
