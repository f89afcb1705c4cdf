//! The coordinator: runs batches over the pool's slots.
//!
//! One loop owns the slot table, the task queue and every in-flight unit.
//! Units are spawned tasks that report back over a channel; the loop waits
//! on that channel for at most one poll interval at a time, so it never
//! blocks on a single unit. Units that outlive their deadline are aborted,
//! which kills their worker processes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::sandbox::error::timeout_message;
use crate::sandbox::{SandboxError, SandboxHandle};
use crate::tasks::outcome::{OutcomeStatus, OutcomeStore, TaskOutcome};
use crate::tasks::partition::{Batch, BatchMode};
use crate::tasks::{Task, TaskId};

use super::executor::{SlotExecutor, UnitError, UnitSuccess};
use super::rotation::EndpointRotation;
use super::slot::{Release, SlotId, SlotTable};
use super::PoolError;

type UnitId = u64;

const MAX_PROVISION_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub task_timeout: Duration,
    /// Extra time past `task_timeout` before a unit is forcibly cancelled.
    /// Covers the prepare step.
    pub recovery_grace: Duration,
    pub poll_interval: Duration,
    /// Dispatches allowed per task when preparing its sandbox fails.
    pub max_prepare_attempts: u32,
    /// Provisioning attempts for a slot without a sandbox before the slot
    /// is given up.
    pub max_provision_attempts: u32,
    /// Delay before the second provisioning attempt; doubles after that.
    pub provision_backoff: Duration,
}

impl SchedulerConfig {
    /// Longest a unit may live, measured from dispatch.
    pub fn unit_deadline(&self) -> Duration {
        self.task_timeout + self.recovery_grace
    }

    /// Delay before the next provisioning attempt, after `failures` failed
    /// ones.
    fn provision_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.provision_backoff
            .saturating_mul(2u32.saturating_pow(exp))
            .min(MAX_PROVISION_BACKOFF)
    }
}

struct QueuedTask {
    task: Task,
    attempts: u32,
}

struct TaskUnit {
    slot: SlotId,
    queued: QueuedTask,
    batch: usize,
    sandbox: String,
    aux_endpoint: Option<String>,
    started: Instant,
    dispatched_at: DateTime<Utc>,
    join: JoinHandle<()>,
}

struct ReplaceUnit {
    slot: SlotId,
    old: Option<String>,
    attempt: u32,
    /// Includes the backoff the unit sleeps before provisioning.
    deadline: Instant,
    join: JoinHandle<()>,
}

enum Completion {
    Task(Result<UnitSuccess, UnitError>),
    Replace(Result<SandboxHandle, SandboxError>),
}

struct Done {
    unit: UnitId,
    completion: Completion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelledKind {
    Task,
    Replace { attempt: u32 },
}

/// An aborted unit whose slot is held until the unit has fully stopped.
struct Cancelled {
    slot: SlotId,
    kind: CancelledKind,
    join: JoinHandle<()>,
}

pub struct PoolScheduler {
    executor: Arc<dyn SlotExecutor>,
    slots: SlotTable,
    rotation: EndpointRotation,
    store: OutcomeStore,
    config: SchedulerConfig,

    queue: VecDeque<QueuedTask>,
    /// Outcomes still owed for the current batch.
    owed: usize,
    tasks: HashMap<UnitId, TaskUnit>,
    replacements: HashMap<UnitId, ReplaceUnit>,
    cancelling: Vec<Cancelled>,
    active_ids: HashSet<TaskId>,
    outcomes: Vec<TaskOutcome>,
    /// Set once the last batch is done; failed provisioning is not retried.
    draining: bool,

    next_unit: UnitId,
    tx: mpsc::UnboundedSender<Done>,
    rx: mpsc::UnboundedReceiver<Done>,
}

impl PoolScheduler {
    pub fn new(
        executor: Arc<dyn SlotExecutor>,
        slots: SlotTable,
        rotation: EndpointRotation,
        store: OutcomeStore,
        config: SchedulerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            executor,
            slots,
            rotation,
            store,
            config,
            queue: VecDeque::new(),
            owed: 0,
            tasks: HashMap::new(),
            replacements: HashMap::new(),
            cancelling: Vec::new(),
            active_ids: HashSet::new(),
            outcomes: Vec::new(),
            draining: false,
            next_unit: 0,
            tx,
            rx,
        }
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    /// Take every live sandbox out of the pool, e.g. for teardown.
    pub fn drain_handles(&mut self) -> Vec<SandboxHandle> {
        self.slots.drain_handles()
    }

    /// Run `batches` in order. Each batch drains completely before the next
    /// one starts. Returns one outcome per task.
    pub async fn run(&mut self, batches: Vec<Batch>) -> Result<Vec<TaskOutcome>, PoolError> {
        let total: usize = batches.iter().map(Batch::len).sum();
        if total > 0 && self.slots.live_len() == 0 {
            return Err(PoolError::NoSlots);
        }
        tracing::info!(
            batches = batches.len(),
            tasks = total,
            slots = self.slots.live_len(),
            deadline_secs = self.config.unit_deadline().as_secs_f64(),
            "pool run started"
        );

        self.draining = false;
        if total > 0 {
            for slot in self.slots.vacant() {
                if self.replacements.values().any(|u| u.slot == slot) {
                    continue;
                }
                tracing::warn!(slot, "slot has no sandbox, provisioning");
                let delay = self.config.provision_delay(1);
                self.spawn_replace(slot, None, 1, delay);
            }
        }

        for batch in batches {
            self.run_batch(batch).await?;
        }
        self.settle().await?;
        self.slots.check()?;

        Ok(std::mem::take(&mut self.outcomes))
    }

    async fn run_batch(&mut self, batch: Batch) -> Result<(), PoolError> {
        if batch.is_empty() {
            return Ok(());
        }
        let Batch { index, mode, tasks } = batch;
        let cap = match mode {
            BatchMode::Parallel => self.slots.size(),
            BatchMode::Sequential => 1,
        };
        self.owed = tasks.len();
        self.queue = tasks
            .into_iter()
            .map(|task| QueuedTask { task, attempts: 0 })
            .collect();

        let started = Instant::now();
        tracing::info!(batch = index, mode = ?mode, tasks = self.owed, "batch started");

        loop {
            self.reap_cancelled()?;

            while self.tasks_in_flight() < cap {
                let Some(queued) = self.queue.pop_front() else {
                    break;
                };
                let Some((slot, handle)) = self.slots.acquire() else {
                    self.queue.push_front(queued);
                    break;
                };
                self.dispatch(slot, handle, queued, index)?;
            }

            if self.owed == 0 && self.tasks_in_flight() == 0 {
                break;
            }

            if !self.queue.is_empty() && self.slots.live_len() == 0 {
                tracing::error!(
                    batch = index,
                    queued = self.queue.len(),
                    "every slot is retired, failing the remaining tasks"
                );
                while let Some(queued) = self.queue.pop_front() {
                    let mut outcome = TaskOutcome::undispatched(
                        queued.task.id,
                        index,
                        OutcomeStatus::SandboxUnhealthy,
                        "no live sandboxes left in the pool",
                    );
                    outcome.attempts = queued.attempts;
                    self.record(outcome)?;
                }
                continue;
            }

            self.poll().await?;
        }

        tracing::info!(
            batch = index,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        Ok(())
    }

    /// Wait out replacements and cancellations left after the last batch.
    async fn settle(&mut self) -> Result<(), PoolError> {
        self.draining = true;
        loop {
            self.reap_cancelled()?;
            if self.replacements.is_empty() && self.cancelling.is_empty() {
                return Ok(());
            }
            self.poll().await?;
        }
    }

    /// Wait up to one poll interval for completions, then cancel overdue
    /// units.
    async fn poll(&mut self) -> Result<(), PoolError> {
        if let Ok(Some(done)) = tokio::time::timeout(self.config.poll_interval, self.rx.recv()).await {
            self.complete(done)?;
            while let Ok(done) = self.rx.try_recv() {
                self.complete(done)?;
            }
        }
        self.expire_overdue()?;
        self.slots.check()
    }

    fn tasks_in_flight(&self) -> usize {
        self.tasks.len()
            + self
                .cancelling
                .iter()
                .filter(|c| c.kind == CancelledKind::Task)
                .count()
    }

    fn next_unit_id(&mut self) -> UnitId {
        self.next_unit += 1;
        self.next_unit
    }

    fn dispatch(
        &mut self,
        slot: SlotId,
        handle: SandboxHandle,
        mut queued: QueuedTask,
        batch: usize,
    ) -> Result<(), PoolError> {
        if !self.active_ids.insert(queued.task.id.clone()) {
            self.slots.release(slot, false)?;
            return Err(PoolError::DoubleDispatch(queued.task.id));
        }
        queued.attempts += 1;

        let unit = self.next_unit_id();
        let aux_endpoint = self.rotation.next_endpoint();
        let sandbox = handle.name().to_string();

        tracing::info!(
            task_id = %queued.task.id,
            slot,
            sandbox = %sandbox,
            batch,
            attempt = queued.attempts,
            aux_endpoint = ?aux_endpoint,
            "dispatching task"
        );

        let executor = self.executor.clone();
        let tx = self.tx.clone();
        let task = queued.task.clone();
        let aux = aux_endpoint.clone();
        let join = tokio::spawn(async move {
            let result = executor.execute(handle, task, aux).await;
            let _ = tx.send(Done {
                unit,
                completion: Completion::Task(result),
            });
        });

        self.tasks.insert(
            unit,
            TaskUnit {
                slot,
                queued,
                batch,
                sandbox,
                aux_endpoint,
                started: Instant::now(),
                dispatched_at: Utc::now(),
                join,
            },
        );
        Ok(())
    }

    /// Provision a fresh sandbox for `slot` after `delay`, discarding `old`
    /// if there is one. The slot stays busy until the unit reports back.
    fn spawn_replace(
        &mut self,
        slot: SlotId,
        old: Option<SandboxHandle>,
        attempt: u32,
        delay: Duration,
    ) {
        let unit = self.next_unit_id();
        let old_name = old.as_ref().map(|h| h.name().to_string());
        tracing::info!(
            slot,
            old = ?old_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "provisioning sandbox for slot"
        );

        let executor = self.executor.clone();
        let tx = self.tx.clone();
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = executor.replace(slot, old).await;
            let _ = tx.send(Done {
                unit,
                completion: Completion::Replace(result),
            });
        });

        self.replacements.insert(
            unit,
            ReplaceUnit {
                slot,
                old: old_name,
                attempt,
                deadline: Instant::now() + delay + self.config.unit_deadline(),
                join,
            },
        );
    }

    /// Retry provisioning `slot` with backoff, or give the slot up once its
    /// attempts are spent or the run is winding down.
    fn provision_failed(&mut self, slot: SlotId, attempt: u32) -> Result<(), PoolError> {
        if self.draining || attempt >= self.config.max_provision_attempts {
            tracing::error!(slot, attempts = attempt, "giving up on slot");
            return self.slots.retire(slot);
        }
        self.slots.vacate(slot)?;
        let delay = self.config.provision_delay(attempt);
        self.spawn_replace(slot, None, attempt + 1, delay);
        Ok(())
    }

    fn complete(&mut self, done: Done) -> Result<(), PoolError> {
        match done.completion {
            Completion::Task(result) => {
                let Some(unit) = self.tasks.remove(&done.unit) else {
                    tracing::debug!(unit = done.unit, "late completion from a cancelled unit ignored");
                    return Ok(());
                };
                self.complete_task(unit, result)
            }
            Completion::Replace(result) => {
                let Some(unit) = self.replacements.remove(&done.unit) else {
                    tracing::debug!(unit = done.unit, "late replacement from a cancelled unit ignored");
                    return Ok(());
                };
                match result {
                    Ok(handle) => {
                        tracing::info!(slot = unit.slot, old = ?unit.old, new = %handle.name(), "slot back in service");
                        self.slots.install(unit.slot, handle)
                    }
                    Err(e) => {
                        tracing::error!(
                            slot = unit.slot,
                            old = ?unit.old,
                            attempt = unit.attempt,
                            error = %e,
                            "sandbox provisioning failed"
                        );
                        self.provision_failed(unit.slot, unit.attempt)
                    }
                }
            }
        }
    }

    fn complete_task(
        &mut self,
        unit: TaskUnit,
        result: Result<UnitSuccess, UnitError>,
    ) -> Result<(), PoolError> {
        self.active_ids.remove(&unit.queued.task.id);
        let slot = unit.slot;

        let penalize = match result {
            Ok(success) => {
                if let Some(snapshot) = &success.snapshot {
                    self.slots.record_snapshot(slot, snapshot);
                }
                let outcome = task_outcome(&unit, OutcomeStatus::Succeeded, Some(success.result), None);
                self.record(outcome)?;
                false
            }
            Err(UnitError::Prepare(e)) if unit.queued.attempts < self.config.max_prepare_attempts => {
                tracing::warn!(
                    task_id = %unit.queued.task.id,
                    slot,
                    sandbox = %unit.sandbox,
                    attempt = unit.queued.attempts,
                    error = %e,
                    "sandbox prepare failed, requeueing task"
                );
                self.queue.push_front(unit.queued);
                true
            }
            Err(e) => {
                let status = match &e {
                    UnitError::Prepare(_) => OutcomeStatus::SandboxUnhealthy,
                    UnitError::Timeout(_) => OutcomeStatus::TimedOut,
                    UnitError::Task(_) | UnitError::Crashed(_) => OutcomeStatus::TaskError,
                };
                tracing::warn!(
                    task_id = %unit.queued.task.id,
                    slot,
                    sandbox = %unit.sandbox,
                    error = %e,
                    "task failed"
                );
                let penalize = e.penalizes_sandbox();
                let outcome = task_outcome(&unit, status, None, Some(e.to_string()));
                self.record(outcome)?;
                penalize
            }
        };

        self.release(slot, penalize)
    }

    fn release(&mut self, slot: SlotId, penalize: bool) -> Result<(), PoolError> {
        match self.slots.release(slot, penalize)? {
            Release::Idle => Ok(()),
            Release::Replace(old) => {
                tracing::warn!(slot, sandbox = %old.name(), "replacing sandbox after repeated failures");
                self.spawn_replace(slot, Some(old), 1, Duration::ZERO);
                Ok(())
            }
        }
    }

    /// Abort units past their deadline. Task units get their timeout
    /// outcome now; their slots wait in `cancelling` until the unit has
    /// stopped.
    fn expire_overdue(&mut self) -> Result<(), PoolError> {
        let deadline = self.config.unit_deadline();

        let overdue: Vec<UnitId> = self
            .tasks
            .iter()
            .filter(|(_, u)| u.started.elapsed() > deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in overdue {
            let Some(unit) = self.tasks.remove(&id) else {
                continue;
            };
            unit.join.abort();
            self.active_ids.remove(&unit.queued.task.id);
            tracing::warn!(
                task_id = %unit.queued.task.id,
                slot = unit.slot,
                sandbox = %unit.sandbox,
                deadline_secs = deadline.as_secs_f64(),
                "task overran its deadline, cancelling"
            );
            let outcome = task_outcome(
                &unit,
                OutcomeStatus::TimedOut,
                None,
                Some(timeout_message(deadline)),
            );
            self.cancelling.push(Cancelled {
                slot: unit.slot,
                kind: CancelledKind::Task,
                join: unit.join,
            });
            self.record(outcome)?;
        }

        let now = Instant::now();
        let overdue: Vec<UnitId> = self
            .replacements
            .iter()
            .filter(|(_, u)| now > u.deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in overdue {
            let Some(unit) = self.replacements.remove(&id) else {
                continue;
            };
            unit.join.abort();
            tracing::error!(slot = unit.slot, old = ?unit.old, "sandbox provisioning overran its deadline, cancelling");
            self.cancelling.push(Cancelled {
                slot: unit.slot,
                kind: CancelledKind::Replace {
                    attempt: unit.attempt,
                },
                join: unit.join,
            });
        }
        Ok(())
    }

    /// Free the slots of cancelled units that have finished unwinding.
    fn reap_cancelled(&mut self) -> Result<(), PoolError> {
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.cancelling)
            .into_iter()
            .partition(|c| c.join.is_finished());
        self.cancelling = pending;

        for cancelled in done {
            match cancelled.kind {
                CancelledKind::Task => self.release(cancelled.slot, true)?,
                CancelledKind::Replace { attempt } => {
                    self.provision_failed(cancelled.slot, attempt)?
                }
            }
        }
        Ok(())
    }

    /// Persist `outcome` before anything else sees the slot again. A task
    /// whose outcome cannot be stored would run again on restart, so this
    /// aborts the run.
    fn record(&mut self, outcome: TaskOutcome) -> Result<(), PoolError> {
        if let Err(e) = self.store.record(&outcome) {
            tracing::error!(task_id = %outcome.task_id, error = %e, "failed to persist outcome");
            return Err(PoolError::Persist {
                task_id: outcome.task_id,
                error: format!("{e:#}"),
            });
        }
        tracing::info!(
            task_id = %outcome.task_id,
            status = %outcome.status,
            batch = outcome.batch,
            slot = ?outcome.slot,
            duration_ms = outcome.duration_ms,
            "task finished"
        );
        self.owed = self.owed.saturating_sub(1);
        self.outcomes.push(outcome);
        Ok(())
    }
}

impl Drop for PoolScheduler {
    fn drop(&mut self) {
        for unit in self.tasks.values() {
            unit.join.abort();
        }
        for unit in self.replacements.values() {
            unit.join.abort();
        }
    }
}

fn task_outcome(
    unit: &TaskUnit,
    status: OutcomeStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
) -> TaskOutcome {
    TaskOutcome {
        task_id: unit.queued.task.id.clone(),
        status,
        result,
        error,
        batch: unit.batch,
        slot: Some(unit.slot),
        sandbox: Some(unit.sandbox.clone()),
        aux_endpoint: unit.aux_endpoint.clone(),
        attempts: unit.queued.attempts,
        dispatched_at: unit.dispatched_at,
        finished_at: Utc::now(),
        duration_ms: unit.started.elapsed().as_millis() as u64,
    }
}
