use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::WaitSetError;
use crate::registry::Registry;
use crate::trigger::{Callback, OriginId, TriggerHandle, TriggerId};
use crate::wait_set::{acquire_in, WaitSet};

struct UserTriggerState {
    was_triggered: AtomicBool,
    attachment: Mutex<Option<TriggerHandle>>,
}

impl UserTriggerState {
    fn attachment(&self) -> MutexGuard<'_, Option<TriggerHandle>> {
        self.attachment.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Application-controlled manual signal, e.g. for shutdown.
///
/// Level-triggered: any number of [`trigger`](Self::trigger) calls before a
/// [`reset`](Self::reset) collapse into one pending event. Triggering while
/// detached does nothing.
pub struct UserTrigger {
    state: Arc<UserTriggerState>,
}

impl UserTrigger {
    pub fn new() -> Self {
        Self {
            state: Arc::new(UserTriggerState {
                was_triggered: AtomicBool::new(false),
                attachment: Mutex::new(None),
            }),
        }
    }

    /// Identity to compare against [`TriggeredEntry::originates_from`](crate::TriggeredEntry::originates_from).
    pub fn origin(&self) -> OriginId {
        OriginId::of(&*self.state)
    }

    /// Attaches to `waitset`, leaving any previous WaitSet first.
    ///
    /// # Errors
    ///
    /// Forwards the WaitSet's registration error; the trigger is detached in
    /// that case.
    pub fn attach(
        &self,
        waitset: &mut WaitSet,
        trigger_id: TriggerId,
        callback: Option<Callback>,
    ) -> Result<(), WaitSetError> {
        self.attach_to(waitset.registry(), trigger_id, callback)
    }

    pub(crate) fn attach_to(
        &self,
        registry: &Arc<Registry>,
        trigger_id: TriggerId,
        callback: Option<Callback>,
    ) -> Result<(), WaitSetError> {
        let mut attachment = self.state.attachment();
        drop(attachment.take());

        let observed = Arc::downgrade(&self.state);
        let invalidated = Arc::downgrade(&self.state);
        let handle = acquire_in(
            registry,
            self.origin(),
            Arc::new(move || {
                observed
                    .upgrade()
                    .is_some_and(|state| state.was_triggered.load(Ordering::Acquire))
            }),
            Some(Box::new(move || release_attachment(&invalidated))),
            trigger_id,
            callback,
        )?;
        *attachment = Some(handle);
        Ok(())
    }

    pub fn detach(&self) {
        let handle = self.state.attachment().take();
        drop(handle);
    }

    pub fn is_attached(&self) -> bool {
        self.state
            .attachment()
            .as_ref()
            .is_some_and(TriggerHandle::is_valid)
    }

    /// Raises the flag and wakes the attached WaitSet.
    pub fn trigger(&self) {
        let attachment = self.state.attachment();
        if let Some(handle) = attachment.as_ref().filter(|handle| handle.is_valid()) {
            self.state.was_triggered.store(true, Ordering::Release);
            handle.notify();
        }
    }

    pub fn has_triggered(&self) -> bool {
        self.state.was_triggered.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.state.was_triggered.store(false, Ordering::Release);
    }
}

// Invalidation path: the WaitSet went away while we were still attached.
fn release_attachment(state: &Weak<UserTriggerState>) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut attachment = state.attachment();
    // A concurrent re-attach may already hold a fresh handle; keep it.
    if attachment.as_ref().is_some_and(|handle| !handle.is_valid()) {
        let stale = attachment.take();
        drop(attachment);
        drop(stale);
    }
}

impl Default for UserTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UserTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserTrigger")
            .field("origin", &self.origin())
            .field("has_triggered", &self.has_triggered())
            .field("attached", &self.is_attached())
            .finish()
    }
}
