use std::io;
use std::time::Duration;

/// Errors from sandbox operations.
///
/// The variant tells the scheduler how much to trust the sandbox afterwards:
/// `Provision` costs the slot its sandbox, `Revert`/`Timeout`/`Worker` leave
/// it in an unknown state, the rest are plumbing failures.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("provision failed: {0}")]
    Provision(String),

    #[error("revert failed: {0}")]
    Revert(String),

    #[error("{0}")]
    Timeout(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    /// The timeout error for a deadline that expired.
    pub fn timeout(after: Duration) -> Self {
        SandboxError::Timeout(timeout_message(after))
    }
}

/// `"timeout after T seconds"`, with fractional seconds when the deadline
/// is not a whole number of seconds.
pub fn timeout_message(after: Duration) -> String {
    if after.subsec_millis() == 0 {
        format!("timeout after {} seconds", after.as_secs())
    } else {
        format!("timeout after {:.3} seconds", after.as_secs_f64())
    }
}
