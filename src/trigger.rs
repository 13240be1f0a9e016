//! Registration records and the capabilities handed back to origins.

use std::any::Any;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::registry::{Registry, SlotKey};

/// Caller-chosen tag used to tell triggers apart after a wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerId(u64);

impl TriggerId {
    /// Sentinel for "no id assigned".
    pub const INVALID: Self = Self(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_assigned(self) -> bool {
        self.0 != u64::MAX
    }
}

impl Default for TriggerId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl From<u64> for TriggerId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TriggerId> for u64 {
    fn from(id: TriggerId) -> Self {
        id.0
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_assigned() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("unassigned")
        }
    }
}

/// Identity of the object a trigger watches.
///
/// Derived from a stable address (usually the pointee of an `Arc`) and only
/// ever compared, never dereferenced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OriginId(usize);

impl OriginId {
    pub fn of<T: ?Sized>(origin: &T) -> Self {
        Self((origin as *const T).cast::<()>() as usize)
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }
}

/// Anything a WaitSet can watch.
///
/// `has_pending_event` must be side-effect free; the WaitSet calls it on every
/// scan. Implementors call [`TriggerHandle::notify`] whenever it may have
/// turned true.
pub trait EventOrigin: Send + Sync {
    fn has_pending_event(&self) -> bool;
}

/// A callback bound to a trigger, invoked through [`TriggeredEntry::invoke`].
///
/// Clones share identity; two callbacks built separately from the same
/// function pointer compare equal.
#[derive(Clone)]
pub struct Callback {
    key: usize,
    call: Arc<dyn Fn(&TriggeredEntry) + Send + Sync>,
}

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&TriggeredEntry) + Send + Sync + 'static,
    {
        let call: Arc<dyn Fn(&TriggeredEntry) + Send + Sync> = Arc::new(f);
        let key = Arc::as_ptr(&call).cast::<()>() as usize;
        Self { key, call }
    }

    pub fn from_fn(f: fn(&TriggeredEntry)) -> Self {
        Self {
            key: f as usize,
            call: Arc::new(f),
        }
    }

    /// Callback that receives the origin itself. Only fires for triggers
    /// registered with an origin of type `T` that is still alive.
    pub fn for_origin<T>(f: fn(&T)) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            key: f as usize,
            call: Arc::new(move |entry: &TriggeredEntry| {
                if let Some(origin) = entry.origin_as::<T>() {
                    f(&origin);
                }
            }),
        }
    }

    pub fn identity(&self) -> usize {
        self.key
    }

    pub fn call(&self, entry: &TriggeredEntry) {
        (self.call)(entry);
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Callback {}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback")
            .field(&format_args!("{:#x}", self.key))
            .finish()
    }
}

pub(crate) type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;
pub(crate) type OriginRef = Weak<dyn Any + Send + Sync>;
pub(crate) type Invalidation = Box<dyn FnOnce() + Send>;

/// One live registration inside a WaitSet slot. Movable, never copied.
pub(crate) struct Trigger {
    origin: OriginId,
    trigger_id: TriggerId,
    has_triggered: Predicate,
    on_invalidate: Option<Invalidation>,
    callback: Option<Callback>,
    origin_ref: Option<OriginRef>,
    // Set while a reactor worker runs this trigger's callback.
    in_flight: Arc<AtomicBool>,
}

impl Trigger {
    pub(crate) fn new(
        origin: OriginId,
        has_triggered: Predicate,
        on_invalidate: Option<Invalidation>,
        trigger_id: TriggerId,
        callback: Option<Callback>,
    ) -> Self {
        Self {
            origin,
            trigger_id,
            has_triggered,
            on_invalidate,
            callback,
            origin_ref: None,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_origin_ref(mut self, origin: OriginRef) -> Self {
        self.origin_ref = Some(origin);
        self
    }

    pub(crate) fn origin(&self) -> OriginId {
        self.origin
    }

    pub(crate) fn trigger_id(&self) -> TriggerId {
        self.trigger_id
    }

    /// Same origin, same trigger id, same callback.
    pub(crate) fn is_logical_equal(&self, other: &Self) -> bool {
        self.origin == other.origin
            && self.trigger_id == other.trigger_id
            && self.callback == other.callback
    }

    /// Runs the origin's invalidation callback. Used when the WaitSet, not the
    /// origin, ends the registration.
    pub(crate) fn invalidate(mut self) {
        if let Some(on_invalidate) = self.on_invalidate.take() {
            on_invalidate();
        }
    }

    pub(crate) fn entry(&self) -> TriggeredEntry {
        TriggeredEntry {
            origin: self.origin,
            trigger_id: self.trigger_id,
            callback: self.callback.clone(),
            origin_ref: self.origin_ref.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Copy of everything a scan needs, taken under the registry lock.
    pub(crate) fn candidate(&self) -> Candidate {
        Candidate {
            has_triggered: Arc::clone(&self.has_triggered),
            entry: self.entry(),
        }
    }
}

/// A trigger as seen by one scan.
///
/// Evaluated after the registry lock is released: a predicate may briefly hold
/// the last strong reference to its origin, and dropping that origin drops
/// its `TriggerHandle`, which locks the registry.
pub(crate) struct Candidate {
    has_triggered: Predicate,
    entry: TriggeredEntry,
}

impl Candidate {
    pub(crate) fn into_triggered(self) -> Option<TriggeredEntry> {
        let fired = !self.entry.in_flight.load(Ordering::Acquire) && (self.has_triggered)();
        fired.then_some(self.entry)
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("origin", &self.origin)
            .field("trigger_id", &self.trigger_id)
            .field("callback", &self.callback)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a trigger that fired, as returned by a wait.
#[derive(Clone)]
pub struct TriggeredEntry {
    origin: OriginId,
    trigger_id: TriggerId,
    callback: Option<Callback>,
    origin_ref: Option<OriginRef>,
    in_flight: Arc<AtomicBool>,
}

impl TriggeredEntry {
    pub fn origin(&self) -> OriginId {
        self.origin
    }

    pub fn trigger_id(&self) -> TriggerId {
        self.trigger_id
    }

    pub fn originates_from(&self, origin: OriginId) -> bool {
        self.origin == origin
    }

    /// The origin, if it was registered as `T` and is still alive.
    pub fn origin_as<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.origin_ref.as_ref()?.upgrade()?.downcast::<T>().ok()
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Calls the bound callback. Returns false when none is bound.
    pub fn invoke(&self) -> bool {
        match &self.callback {
            Some(callback) => {
                callback.call(self);
                true
            }
            None => false,
        }
    }

    /// Excludes the trigger from scans until [`release`](Self::release).
    pub(crate) fn suspend(&self) {
        self.in_flight.store(true, Ordering::Release);
    }

    pub(crate) fn release(&self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

impl fmt::Debug for TriggeredEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggeredEntry")
            .field("origin", &self.origin)
            .field("trigger_id", &self.trigger_id)
            .field("callback", &self.callback)
            .finish()
    }
}

/// The origin's capability for one registration.
///
/// Holds a slot index plus generation, never a pointer into the WaitSet. Once
/// the WaitSet is gone or the slot was recycled every operation is a no-op.
/// Dropping the handle detaches the registration.
pub struct TriggerHandle {
    registry: Weak<Registry>,
    key: SlotKey,
    trigger_id: TriggerId,
}

impl TriggerHandle {
    pub(crate) fn new(registry: Weak<Registry>, key: SlotKey, trigger_id: TriggerId) -> Self {
        Self {
            registry,
            key,
            trigger_id,
        }
    }

    /// Wakes the WaitSet this trigger belongs to.
    pub fn notify(&self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.is_current(self.key) {
                registry.condition_variable().notify();
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.is_current(self.key))
    }

    pub fn trigger_id(&self) -> TriggerId {
        self.trigger_id
    }

    /// Removes the registration without running its invalidation callback.
    pub fn detach(&mut self) {
        let Some(registry) = mem::take(&mut self.registry).upgrade() else {
            return;
        };
        if let Some(trigger) = registry.remove_slot(self.key) {
            log::debug!(
                "waitset: origin detached trigger {} from slot {}",
                trigger.trigger_id(),
                self.key.slot
            );
        }
    }
}

impl Drop for TriggerHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for TriggerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerHandle")
            .field("trigger_id", &self.trigger_id)
            .field("slot", &self.key.slot)
            .field("generation", &self.key.generation)
            .field("valid", &self.is_valid())
            .finish()
    }
}
