pub mod control;
pub mod error;
pub mod handle;
pub mod types;
pub mod worker;

pub use control::{ControlClient, RetryPolicy};
pub use error::SandboxError;
pub use handle::{SandboxHandle, TaskRunError};
pub use types::*;
pub use worker::WorkerCommand;
