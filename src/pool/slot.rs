use std::collections::VecDeque;

use crate::sandbox::{SandboxHandle, SandboxStatus};

use super::PoolError;

pub type SlotId = usize;

#[derive(Debug)]
struct Slot {
    handle: Option<SandboxHandle>,
    status: SandboxStatus,
    /// Consecutive sandbox-level failures since the last clean run.
    failures: u32,
}

/// What happened to a slot when its unit finished.
#[derive(Debug)]
pub enum Release {
    /// Back in the idle queue.
    Idle,
    /// Failed too often; still reserved, its sandbox should be replaced.
    Replace(SandboxHandle),
}

/// The pool's slots, owned by the coordinator.
///
/// A slot is idle (queued, possibly flagged unhealthy), busy (bound to one
/// in-flight unit, or held while its sandbox is provisioned) or retired.
/// Every slot is in exactly one of those sets, and a slot is only retired
/// once provisioning it has been given up.
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Slot>,
    idle: VecDeque<SlotId>,
    replace_after: u32,
}

impl SlotTable {
    /// `None` entries are vacant slots whose sandbox could not be
    /// provisioned yet; they start busy until the coordinator fills them.
    pub fn new(handles: Vec<Option<SandboxHandle>>, replace_after: u32) -> Self {
        let mut idle = VecDeque::new();
        let slots = handles
            .into_iter()
            .enumerate()
            .map(|(id, handle)| match handle {
                Some(mut handle) => {
                    handle.set_status(SandboxStatus::Idle);
                    idle.push_back(id);
                    Slot {
                        handle: Some(handle),
                        status: SandboxStatus::Idle,
                        failures: 0,
                    }
                }
                None => Slot {
                    handle: None,
                    status: SandboxStatus::Busy,
                    failures: 0,
                },
            })
            .collect();
        Self {
            slots,
            idle,
            replace_after: replace_after.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn busy_len(&self) -> usize {
        self.count(|s| s == SandboxStatus::Busy)
    }

    pub fn retired_len(&self) -> usize {
        self.count(|s| s == SandboxStatus::Retired)
    }

    /// Slots that are not retired.
    pub fn live_len(&self) -> usize {
        self.size() - self.retired_len()
    }

    fn count(&self, pred: impl Fn(SandboxStatus) -> bool) -> usize {
        self.slots.iter().filter(|s| pred(s.status)).count()
    }

    pub fn status(&self, slot: SlotId) -> Option<SandboxStatus> {
        self.slots.get(slot).map(|s| s.status)
    }

    pub fn failures(&self, slot: SlotId) -> Option<u32> {
        self.slots.get(slot).map(|s| s.failures)
    }

    pub fn handle(&self, slot: SlotId) -> Option<&SandboxHandle> {
        self.slots.get(slot).and_then(|s| s.handle.as_ref())
    }

    /// Take the longest-idle slot and mark it busy. Returns a copy of its
    /// handle for the unit to work with.
    pub fn acquire(&mut self) -> Option<(SlotId, SandboxHandle)> {
        while let Some(id) = self.idle.pop_front() {
            let slot = &mut self.slots[id];
            let Some(handle) = slot.handle.as_mut() else {
                continue;
            };
            slot.status = SandboxStatus::Busy;
            handle.set_status(SandboxStatus::Busy);
            return Some((id, handle.clone()));
        }
        None
    }

    /// Return a busy slot. `penalize` marks a sandbox-level failure;
    /// otherwise the failure streak resets.
    pub fn release(&mut self, slot: SlotId, penalize: bool) -> Result<Release, PoolError> {
        let replace_after = self.replace_after;
        let entry = self.busy_slot(slot)?;

        if !penalize {
            entry.failures = 0;
            entry.status = SandboxStatus::Idle;
            if let Some(handle) = entry.handle.as_mut() {
                handle.set_status(SandboxStatus::Idle);
            }
            self.idle.push_back(slot);
            return Ok(Release::Idle);
        }

        entry.failures += 1;
        if let Some(handle) = entry.handle.as_mut() {
            handle.set_status(SandboxStatus::Unhealthy);
        }
        if entry.failures >= replace_after {
            if let Some(handle) = entry.handle.clone() {
                return Ok(Release::Replace(handle));
            }
        }
        entry.status = SandboxStatus::Unhealthy;
        self.idle.push_back(slot);
        Ok(Release::Idle)
    }

    /// Put a fresh sandbox into a slot that was held for replacement.
    pub fn install(&mut self, slot: SlotId, mut handle: SandboxHandle) -> Result<(), PoolError> {
        let entry = self.busy_slot(slot)?;
        handle.set_status(SandboxStatus::Idle);
        entry.handle = Some(handle);
        entry.status = SandboxStatus::Idle;
        entry.failures = 0;
        self.idle.push_back(slot);
        Ok(())
    }

    /// Busy slots without a sandbox, waiting to be provisioned.
    pub fn vacant(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == SandboxStatus::Busy && s.handle.is_none())
            .map(|(id, _)| id)
            .collect()
    }

    /// Forget the sandbox of a slot held for replacement. The slot stays
    /// busy until it is provisioned again or retired.
    pub fn vacate(&mut self, slot: SlotId) -> Result<(), PoolError> {
        let entry = self.busy_slot(slot)?;
        entry.handle = None;
        Ok(())
    }

    /// Give up on a slot held for replacement.
    pub fn retire(&mut self, slot: SlotId) -> Result<(), PoolError> {
        let entry = self.busy_slot(slot)?;
        entry.status = SandboxStatus::Retired;
        entry.handle = None;
        Ok(())
    }

    pub fn record_snapshot(&mut self, slot: SlotId, snapshot: &str) {
        if let Some(handle) = self.slots.get_mut(slot).and_then(|s| s.handle.as_mut()) {
            handle.record_snapshot(snapshot);
        }
    }

    fn busy_slot(&mut self, slot: SlotId) -> Result<&mut Slot, PoolError> {
        let entry = self.slots.get_mut(slot).ok_or(PoolError::UnknownSlot(slot))?;
        if entry.status != SandboxStatus::Busy {
            return Err(PoolError::DoubleRelease(slot));
        }
        Ok(entry)
    }

    /// `idle + busy + retired == size`, so `idle + busy == size` until a
    /// slot is given up, and the idle queue holds exactly the idle slots,
    /// once each.
    pub fn check(&self) -> Result<(), PoolError> {
        let accounting = || PoolError::SlotAccounting {
            idle: self.idle.len(),
            busy: self.busy_len(),
            retired: self.retired_len(),
            size: self.size(),
        };

        if self.idle.len() + self.busy_len() + self.retired_len() != self.size() {
            return Err(accounting());
        }
        let mut queued = vec![false; self.size()];
        for &id in &self.idle {
            let Some(seen) = queued.get_mut(id) else {
                return Err(accounting());
            };
            if *seen {
                return Err(accounting());
            }
            *seen = true;
        }
        for (id, slot) in self.slots.iter().enumerate() {
            let is_idle = matches!(slot.status, SandboxStatus::Idle | SandboxStatus::Unhealthy);
            if is_idle != queued[id] {
                return Err(accounting());
            }
        }
        Ok(())
    }

    /// Remove every live handle, e.g. to destroy them at shutdown.
    pub fn drain_handles(&mut self) -> Vec<SandboxHandle> {
        self.idle.clear();
        self.slots
            .iter_mut()
            .filter_map(|slot| {
                slot.status = SandboxStatus::Retired;
                slot.handle.take()
            })
            .collect()
    }
}
