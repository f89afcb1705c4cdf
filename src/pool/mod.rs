pub mod executor;
pub mod provision;
pub mod rotation;
pub mod scheduler;
pub mod slot;

pub use executor::SandboxExecutor;
pub use provision::Provisioner;
pub use rotation::EndpointRotation;
pub use scheduler::{PoolScheduler, SchedulerConfig};
pub use slot::{SlotId, SlotTable};

use crate::tasks::TaskId;

/// Errors that abort a run: bookkeeping violations, and outcomes that
/// could not be made durable.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("task {0} dispatched while already in flight")]
    DoubleDispatch(TaskId),

    #[error("slot {0} released while not busy")]
    DoubleRelease(SlotId),

    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),

    #[error("slot accounting broken: {idle} idle + {busy} busy + {retired} retired != {size}")]
    SlotAccounting {
        idle: usize,
        busy: usize,
        retired: usize,
        size: usize,
    },

    #[error("no live sandboxes in the pool")]
    NoSlots,

    #[error("failed to persist outcome for task {task_id}: {error}")]
    Persist { task_id: TaskId, error: String },
}
