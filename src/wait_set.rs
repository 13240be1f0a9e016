use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::condvar::{ConditionVariable, ConditionVariableWaiter, WaitStrategy};
use crate::error::WaitSetError;
use crate::registry::Registry;
use crate::trigger::{
    Callback, Candidate, EventOrigin, Invalidation, OriginId, OriginRef, Predicate, Trigger, TriggerHandle,
    TriggerId, TriggeredEntry,
};
use crate::{Error, Result};

/// Default number of triggers a WaitSet can hold.
pub const MAX_TRIGGERS_PER_WAITSET: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitSetConfig {
    pub capacity: usize,
    pub wait_strategy: WaitStrategy,
}

impl Default for WaitSetConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_TRIGGERS_PER_WAITSET,
            wait_strategy: WaitStrategy::default(),
        }
    }
}

/// Logical disjunction of a bounded number of triggers.
///
/// Origins register through [`acquire`](Self::acquire) and signal through the
/// returned [`TriggerHandle`]. A single consumer blocks in [`wait`](Self::wait)
/// until at least one registered predicate holds. Dropping the WaitSet
/// invalidates every remaining trigger before the wake region is released.
pub struct WaitSet {
    registry: Arc<Registry>,
    waiter: ConditionVariableWaiter,
    // Sized once so scans never allocate.
    scratch: Vec<Candidate>,
}

impl WaitSet {
    pub fn new() -> Result<Self> {
        Self::with_config(WaitSetConfig::default())
    }

    pub fn with_config(config: WaitSetConfig) -> Result<Self> {
        Self::with_condition_variable(ConditionVariable::anonymous()?, config)
    }

    /// Builds a WaitSet that blocks on an existing (possibly named, cross
    /// process) wake region.
    pub fn with_condition_variable(condvar: ConditionVariable, config: WaitSetConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(Error::InvalidConfig("waitset capacity must be non-zero"));
        }
        let waiter = condvar.waiter(config.wait_strategy);
        Ok(Self {
            registry: Arc::new(Registry::new(config.capacity, condvar)),
            waiter,
            scratch: Vec::with_capacity(config.capacity),
        })
    }

    /// Registers a trigger for `origin`.
    ///
    /// `has_triggered` is evaluated on every scan and must not block or call
    /// back into this WaitSet. `on_invalidate` runs when the WaitSet ends the
    /// registration (removal by id, or teardown) while the origin still holds
    /// its handle.
    ///
    /// # Errors
    ///
    /// [`WaitSetError::TriggerAlreadyAcquired`] when a trigger with the same
    /// origin, id and callback is live, [`WaitSetError::TriggerVectorOverflow`]
    /// when the WaitSet is full.
    pub fn acquire<P, I>(
        &mut self,
        origin: OriginId,
        has_triggered: P,
        on_invalidate: I,
        trigger_id: TriggerId,
        callback: Option<Callback>,
    ) -> std::result::Result<TriggerHandle, WaitSetError>
    where
        P: Fn() -> bool + Send + Sync + 'static,
        I: FnOnce() + Send + 'static,
    {
        acquire_in(
            &self.registry,
            origin,
            Arc::new(has_triggered),
            Some(Box::new(on_invalidate)),
            trigger_id,
            callback,
        )
    }

    /// Registers an [`EventOrigin`]. The WaitSet only keeps a weak reference;
    /// once the origin is dropped its predicate reads false. Callbacks reach
    /// the origin through [`TriggeredEntry::origin_as`].
    pub fn acquire_origin<T>(
        &mut self,
        origin: &Arc<T>,
        trigger_id: TriggerId,
        callback: Option<Callback>,
    ) -> std::result::Result<TriggerHandle, WaitSetError>
    where
        T: EventOrigin + 'static,
    {
        self.registry.insert(origin_trigger(origin, trigger_id, callback))
    }

    /// Blocks until at least one trigger fired and returns all fired triggers
    /// in registration order.
    pub fn wait(&mut self) -> Vec<TriggeredEntry> {
        let mut triggered = Vec::new();
        self.wait_until(None, &mut triggered);
        triggered
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning an
    /// empty vector if nothing fired.
    pub fn timed_wait(&mut self, timeout: Duration) -> Vec<TriggeredEntry> {
        let mut triggered = Vec::new();
        self.timed_wait_into(timeout, &mut triggered);
        triggered
    }

    /// [`wait`](Self::wait) into a caller-owned buffer, which is cleared
    /// first. Reusing the buffer keeps the wait loop allocation-free.
    pub fn wait_into(&mut self, triggered: &mut Vec<TriggeredEntry>) {
        self.wait_until(None, triggered);
    }

    pub fn timed_wait_into(&mut self, timeout: Duration, triggered: &mut Vec<TriggeredEntry>) {
        self.wait_until(Some(Instant::now() + timeout), triggered);
    }

    fn wait_until(&mut self, deadline: Option<Instant>, triggered: &mut Vec<TriggeredEntry>) {
        triggered.clear();
        loop {
            // Reset before the scan: a notify that lands during the scan
            // re-arms the flag and the block below returns at once.
            self.waiter.reset();
            self.registry.collect_triggered(&mut self.scratch, triggered);
            if !triggered.is_empty() {
                log::trace!("waitset: {} trigger(s) fired", triggered.len());
                return;
            }

            let woke = match deadline {
                None => {
                    self.waiter.wait();
                    true
                }
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    !left.is_zero() && self.waiter.timed_wait(left)
                }
            };
            if !woke {
                // One last look so an event racing the deadline is not dropped.
                self.registry.collect_triggered(&mut self.scratch, triggered);
                return;
            }
        }
    }

    /// Removes the first trigger, in registration order, carrying
    /// `trigger_id` and runs its invalidation callback. Unknown ids are
    /// ignored.
    pub fn remove(&mut self, trigger_id: TriggerId) {
        if let Some(trigger) = self.registry.remove_by_id(trigger_id) {
            log::debug!("waitset: removed trigger {trigger_id}");
            trigger.invalidate();
        }
    }

    pub fn size(&self) -> usize {
        self.registry.len()
    }

    pub fn capacity(&self) -> usize {
        self.registry.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether any live trigger watches `origin`.
    pub fn contains_origin(&self, origin: OriginId) -> bool {
        self.registry.contains_origin(origin)
    }

    /// The wake region this WaitSet blocks on. Collaborators in other
    /// processes open the same region and call `notify`.
    pub fn condition_variable(&self) -> &ConditionVariable {
        self.registry.condition_variable()
    }

    pub fn set_wait_strategy(&mut self, strategy: WaitStrategy) {
        self.waiter.set_strategy(strategy);
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl Drop for WaitSet {
    fn drop(&mut self) {
        let drained = self.registry.drain();
        if !drained.is_empty() {
            log::debug!("waitset: invalidating {} trigger(s) on teardown", drained.len());
        }
        for trigger in drained {
            trigger.invalidate();
        }
    }
}

impl fmt::Debug for WaitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitSet")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .field("wait_strategy", &self.waiter.strategy())
            .finish()
    }
}

pub(crate) fn acquire_in(
    registry: &Arc<Registry>,
    origin: OriginId,
    has_triggered: Predicate,
    on_invalidate: Option<Invalidation>,
    trigger_id: TriggerId,
    callback: Option<Callback>,
) -> std::result::Result<TriggerHandle, WaitSetError> {
    let trigger = Trigger::new(origin, has_triggered, on_invalidate, trigger_id, callback);
    registry.insert(trigger)
}

/// Trigger for an [`EventOrigin`], holding only weak references to it.
pub(crate) fn origin_trigger<T>(origin: &Arc<T>, trigger_id: TriggerId, callback: Option<Callback>) -> Trigger
where
    T: EventOrigin + 'static,
{
    let observed = Arc::downgrade(origin);
    let has_triggered: Predicate = Arc::new(move || {
        observed
            .upgrade()
            .is_some_and(|origin| origin.has_pending_event())
    });
    let origin_ref: OriginRef = Arc::downgrade(origin) as std::sync::Weak<T>;
    Trigger::new(OriginId::of(&**origin), has_triggered, None, trigger_id, callback).with_origin_ref(origin_ref)
}
