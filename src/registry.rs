//! Fixed arena of trigger slots shared by a WaitSet, its handles and a Reactor.
//!
//! Slots are addressed by index plus generation. Every time a slot is vacated
//! its generation moves forward, which is how stale handles are detected.
//! Registration order is tracked separately so scans stay deterministic when
//! slots are recycled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::condvar::ConditionVariable;
use crate::error::WaitSetError;
use crate::trigger::{Candidate, OriginId, Trigger, TriggerHandle, TriggerId, TriggeredEntry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SlotKey {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
}

struct SlotTable {
    slots: Vec<Option<Trigger>>,
    // Occupied slots in registration order.
    order: Vec<usize>,
    free: Vec<usize>,
}

impl SlotTable {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            order: Vec::with_capacity(capacity),
            free: (0..capacity).rev().collect(),
        }
    }

    fn triggers(&self) -> impl Iterator<Item = &Trigger> + '_ {
        self.order.iter().filter_map(|&slot| self.slots[slot].as_ref())
    }
}

pub(crate) struct Registry {
    table: Mutex<SlotTable>,
    generations: Box<[AtomicU64]>,
    condvar: ConditionVariable,
}

impl Registry {
    pub(crate) fn new(capacity: usize, condvar: ConditionVariable) -> Self {
        Self {
            table: Mutex::new(SlotTable::with_capacity(capacity)),
            generations: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            condvar,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn condition_variable(&self) -> &ConditionVariable {
        &self.condvar
    }

    pub(crate) fn capacity(&self) -> usize {
        self.generations.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub(crate) fn contains_origin(&self, origin: OriginId) -> bool {
        self.lock().triggers().any(|trigger| trigger.origin() == origin)
    }

    pub(crate) fn is_current(&self, key: SlotKey) -> bool {
        self.generations
            .get(key.slot)
            .is_some_and(|generation| generation.load(Ordering::Acquire) == key.generation)
    }

    pub(crate) fn insert(self: &Arc<Self>, trigger: Trigger) -> Result<TriggerHandle, WaitSetError> {
        let mut table = self.lock();
        if table.triggers().any(|existing| existing.is_logical_equal(&trigger)) {
            return Err(WaitSetError::TriggerAlreadyAcquired);
        }
        let Some(slot) = table.free.pop() else {
            return Err(WaitSetError::TriggerVectorOverflow);
        };
        let generation = self.generations[slot].load(Ordering::Acquire);
        let trigger_id = trigger.trigger_id();
        table.slots[slot] = Some(trigger);
        table.order.push(slot);
        drop(table);

        log::debug!("waitset: acquired trigger {trigger_id} in slot {slot}");
        Ok(TriggerHandle::new(
            Arc::downgrade(self),
            SlotKey { slot, generation },
            trigger_id,
        ))
    }

    /// Vacates the slot if `key` still names its current occupant.
    pub(crate) fn remove_slot(&self, key: SlotKey) -> Option<Trigger> {
        let mut table = self.lock();
        if !self.is_current(key) {
            return None;
        }
        self.vacate(&mut table, key.slot)
    }

    /// Vacates the first slot, in registration order, holding `trigger_id`.
    pub(crate) fn remove_by_id(&self, trigger_id: TriggerId) -> Option<Trigger> {
        self.remove_first(|trigger| trigger.trigger_id() == trigger_id)
    }

    /// Vacates the first slot, in registration order, whose trigger matches.
    pub(crate) fn remove_first<F>(&self, matches: F) -> Option<Trigger>
    where
        F: Fn(&Trigger) -> bool,
    {
        let mut table = self.lock();
        let slot = table
            .order
            .iter()
            .copied()
            .find(|&slot| table.slots[slot].as_ref().is_some_and(&matches))?;
        self.vacate(&mut table, slot)
    }

    /// Empties every slot, returning the triggers in registration order.
    pub(crate) fn drain(&self) -> Vec<Trigger> {
        let mut table = self.lock();
        let order = std::mem::take(&mut table.order);
        let mut drained = Vec::with_capacity(order.len());
        for slot in order {
            if let Some(trigger) = table.slots[slot].take() {
                self.generations[slot].fetch_add(1, Ordering::AcqRel);
                table.free.push(slot);
                drained.push(trigger);
            }
        }
        drained
    }

    fn vacate(&self, table: &mut SlotTable, slot: usize) -> Option<Trigger> {
        let trigger = table.slots[slot].take()?;
        self.generations[slot].fetch_add(1, Ordering::AcqRel);
        if let Some(pos) = table.order.iter().position(|&s| s == slot) {
            table.order.remove(pos);
        }
        table.free.push(slot);
        Some(trigger)
    }

    /// Appends every currently triggered entry, in registration order.
    ///
    /// Predicates run after the lock is released; `scratch` is left empty.
    pub(crate) fn collect_triggered(&self, scratch: &mut Vec<Candidate>, out: &mut Vec<TriggeredEntry>) {
        scratch.clear();
        scratch.extend(self.lock().triggers().map(Trigger::candidate));
        out.extend(scratch.drain(..).filter_map(Candidate::into_triggered));
    }
}
