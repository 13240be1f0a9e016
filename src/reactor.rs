//! Background dispatch loop on top of a private [`WaitSet`].
//!
//! The loop thread owns the WaitSet and invokes the callback of every
//! triggered entry, either inline or on a fixed worker pool. Structural
//! removals never happen from the outside while the loop scans: they are
//! queued and an internal cleanup [`UserTrigger`] wakes the loop, which
//! applies them between dispatch cycles. Callbacks may therefore remove their
//! own trigger through a [`TriggerRemover`].

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::condvar::ConditionVariable;
use crate::error::WaitSetError;
use crate::registry::Registry;
use crate::trigger::{Callback, EventOrigin, OriginId, TriggerHandle, TriggerId, TriggeredEntry};
use crate::user_trigger::UserTrigger;
use crate::wait_set::{acquire_in, origin_trigger, WaitSet, WaitSetConfig, MAX_TRIGGERS_PER_WAITSET};
use crate::{Error, Result};

pub const DEFAULT_THREAD_NAME: &str = "waitset-reactor";
/// Linux limit for thread names, excluding the trailing NUL.
pub const MAX_THREAD_NAME_LEN: usize = 15;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactorConfig {
    /// Capacity and wait strategy of the private WaitSet. The internal cleanup
    /// trigger does not count against `capacity`.
    pub waitset: WaitSetConfig,
    /// Worker threads for callback dispatch. Zero runs callbacks on the loop
    /// thread itself.
    pub workers: usize,
    /// Bound of the queue feeding the workers.
    pub queue_capacity: usize,
    pub thread_name: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            waitset: WaitSetConfig::default(),
            workers: 0,
            queue_capacity: MAX_TRIGGERS_PER_WAITSET,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

/// Lifecycle of a reactor. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReactorState {
    Running = 0,
    /// Keep-running cleared; the current wait/dispatch cycle is finishing.
    Draining = 1,
    /// Loop and workers joined.
    Joined = 2,
}

impl ReactorState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Joined,
        }
    }
}

struct ReactorShared {
    registry: Arc<Registry>,
    keep_running: AtomicBool,
    state: AtomicU8,
    cleanup: UserTrigger,
    removals: Mutex<Vec<TriggerId>>,
}

impl ReactorShared {
    fn removals(&self) -> MutexGuard<'_, Vec<TriggerId>> {
        self.removals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ReactorState {
        ReactorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ReactorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn request_removal(&self, trigger_id: TriggerId) {
        self.removals().push(trigger_id);
        self.cleanup.trigger();
    }

    fn is_pending_removal(&self, trigger_id: TriggerId) -> bool {
        self.removals().contains(&trigger_id)
    }

    // Runs on the loop thread between dispatch cycles.
    fn apply_removals(&self) {
        let pending = std::mem::take(&mut *self.removals());
        let cleanup = self.cleanup.origin();
        for trigger_id in pending {
            let removed = self.registry.remove_first(|trigger| {
                trigger.trigger_id() == trigger_id && trigger.origin() != cleanup
            });
            if let Some(trigger) = removed {
                log::debug!("reactor: removed trigger {trigger_id}");
                trigger.invalidate();
            }
        }
    }
}

enum Dispatcher {
    Inline,
    Pool(Sender<TriggeredEntry>),
}

impl Dispatcher {
    fn dispatch(&self, entry: &TriggeredEntry) {
        match self {
            Dispatcher::Inline => {
                entry.invoke();
            }
            Dispatcher::Pool(tx) => {
                // Hidden from scans until a worker has run the callback.
                entry.suspend();
                if let Err(err) = tx.send(entry.clone()) {
                    err.into_inner().release();
                    log::warn!("reactor: worker queue closed, dropping dispatch");
                }
            }
        }
    }
}

struct WorkerPool {
    tx: Sender<TriggeredEntry>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn start(
        name: &str,
        workers: usize,
        queue_capacity: usize,
        condvar: &ConditionVariable,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<TriggeredEntry>(queue_capacity.max(1));
        let mut pool = Self {
            tx,
            workers: Vec::with_capacity(workers),
        };
        for idx in 0..workers {
            let rx: Receiver<TriggeredEntry> = rx.clone();
            let condvar = condvar.clone();
            let spawned = thread::Builder::new()
                .name(worker_thread_name(name, idx))
                .spawn(move || {
                    for entry in rx.iter() {
                        entry.invoke();
                        entry.release();
                        // The origin may still be pending; make the loop rescan.
                        condvar.notify();
                    }
                });
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(err) => return Err(abandon_start(Some(pool), err)),
            }
        }
        Ok(pool)
    }

    fn sender(&self) -> Sender<TriggeredEntry> {
        self.tx.clone()
    }

    fn shutdown(self) {
        // Workers drain whatever is queued, then see the channel close.
        drop(self.tx);
        for handle in self.workers {
            if handle.join().is_err() {
                log::error!("reactor: worker thread panicked");
            }
        }
    }
}

/// Joins whatever workers already started and reports the spawn failure.
fn abandon_start(pool: Option<WorkerPool>, err: io::Error) -> Error {
    log::error!("reactor: failed to spawn thread: {err}");
    if let Some(pool) = pool {
        pool.shutdown();
    }
    Error::ThreadSpawn(err)
}

fn worker_thread_name(base: &str, idx: usize) -> String {
    let suffix = format!("-w{idx}");
    let mut end = MAX_THREAD_NAME_LEN.saturating_sub(suffix.len()).min(base.len());
    while !base.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{suffix}", &base[..end])
}

fn validate(config: &ReactorConfig) -> Result<()> {
    if config.waitset.capacity == 0 {
        return Err(Error::InvalidConfig("waitset capacity must be non-zero"));
    }
    if config.thread_name.is_empty() {
        return Err(Error::InvalidConfig("reactor thread name must not be empty"));
    }
    if config.thread_name.len() > MAX_THREAD_NAME_LEN {
        return Err(Error::InvalidConfig("reactor thread name exceeds 15 bytes"));
    }
    if config.thread_name.contains('\0') {
        return Err(Error::InvalidConfig("reactor thread name contains a NUL byte"));
    }
    Ok(())
}

/// Removes triggers from a running reactor; safe to call from callbacks.
#[derive(Clone)]
pub struct TriggerRemover {
    shared: Arc<ReactorShared>,
}

impl TriggerRemover {
    pub fn remove(&self, trigger_id: TriggerId) {
        self.shared.request_removal(trigger_id);
    }

    pub fn reactor_state(&self) -> ReactorState {
        self.shared.state()
    }
}

impl fmt::Debug for TriggerRemover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerRemover")
            .field("reactor_state", &self.shared.state())
            .finish()
    }
}

pub struct Reactor {
    shared: Arc<ReactorShared>,
    loop_thread: Option<JoinHandle<()>>,
    workers: Option<WorkerPool>,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        Self::with_config(ReactorConfig::default())
    }

    pub fn with_config(config: ReactorConfig) -> Result<Self> {
        validate(&config)?;
        let capacity = config
            .waitset
            .capacity
            .checked_add(1)
            .ok_or(Error::InvalidConfig("waitset capacity overflow"))?;
        let mut waitset = WaitSet::with_config(WaitSetConfig {
            capacity,
            ..config.waitset
        })?;

        let shared = Arc::new(ReactorShared {
            registry: Arc::clone(waitset.registry()),
            keep_running: AtomicBool::new(true),
            state: AtomicU8::new(ReactorState::Running as u8),
            cleanup: UserTrigger::new(),
            removals: Mutex::new(Vec::new()),
        });
        shared
            .cleanup
            .attach(&mut waitset, TriggerId::INVALID, None)
            .map_err(|_| Error::InvalidConfig("reactor cleanup trigger could not be attached"))?;

        let workers = if config.workers > 0 {
            Some(WorkerPool::start(
                &config.thread_name,
                config.workers,
                config.queue_capacity,
                waitset.condition_variable(),
            )?)
        } else {
            None
        };
        let dispatcher = match &workers {
            Some(pool) => Dispatcher::Pool(pool.sender()),
            None => Dispatcher::Inline,
        };

        let loop_shared = Arc::clone(&shared);
        // On failure the closure is dropped, taking the dispatcher's sender
        // with it, so the pool can close.
        let loop_thread = match thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || react_and_listen(&loop_shared, waitset, &dispatcher))
        {
            Ok(handle) => handle,
            Err(err) => return Err(abandon_start(workers, err)),
        };

        log::info!(
            "reactor: started '{}' with {} worker(s)",
            config.thread_name,
            config.workers
        );
        Ok(Self {
            shared,
            loop_thread: Some(loop_thread),
            workers,
        })
    }

    /// Registers a trigger whose `callback` the loop invokes while
    /// `has_triggered` holds.
    ///
    /// # Errors
    ///
    /// Same as [`WaitSet::acquire`].
    pub fn attach<P, I>(
        &self,
        origin: OriginId,
        has_triggered: P,
        on_invalidate: I,
        trigger_id: TriggerId,
        callback: Callback,
    ) -> std::result::Result<TriggerHandle, WaitSetError>
    where
        P: Fn() -> bool + Send + Sync + 'static,
        I: FnOnce() + Send + 'static,
    {
        let handle = acquire_in(
            &self.shared.registry,
            origin,
            Arc::new(has_triggered),
            Some(Box::new(on_invalidate)),
            trigger_id,
            Some(callback),
        )?;
        self.rescan();
        Ok(handle)
    }

    /// # Errors
    ///
    /// Same as [`WaitSet::acquire`].
    pub fn attach_origin<T>(
        &self,
        origin: &Arc<T>,
        trigger_id: TriggerId,
        callback: Callback,
    ) -> std::result::Result<TriggerHandle, WaitSetError>
    where
        T: EventOrigin + 'static,
    {
        let handle = self
            .shared
            .registry
            .insert(origin_trigger(origin, trigger_id, Some(callback)))?;
        self.rescan();
        Ok(handle)
    }

    /// # Errors
    ///
    /// Same as [`UserTrigger::attach`].
    pub fn attach_user_trigger(
        &self,
        trigger: &UserTrigger,
        trigger_id: TriggerId,
        callback: Callback,
    ) -> std::result::Result<(), WaitSetError> {
        trigger.attach_to(&self.shared.registry, trigger_id, Some(callback))?;
        self.rescan();
        Ok(())
    }

    /// Queues removal of the first trigger carrying `trigger_id`. The loop
    /// applies it at its next safe point and no longer dispatches it.
    pub fn detach(&self, trigger_id: TriggerId) {
        self.shared.request_removal(trigger_id);
    }

    pub fn remover(&self) -> TriggerRemover {
        TriggerRemover {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn size(&self) -> usize {
        let cleanup = usize::from(self.shared.registry.contains_origin(self.shared.cleanup.origin()));
        self.shared.registry.len() - cleanup
    }

    pub fn capacity(&self) -> usize {
        self.shared.registry.capacity() - 1
    }

    pub fn state(&self) -> ReactorState {
        self.shared.state()
    }

    /// Stops the loop, lets in-flight callbacks finish and joins all threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn rescan(&self) {
        self.shared.registry.condition_variable().notify();
    }

    fn stop(&mut self) {
        let Some(loop_thread) = self.loop_thread.take() else {
            return;
        };
        self.shared.set_state(ReactorState::Draining);
        self.shared.keep_running.store(false, Ordering::Release);
        self.shared.cleanup.trigger();
        if loop_thread.join().is_err() {
            log::error!("reactor: loop thread panicked");
        }
        if let Some(pool) = self.workers.take() {
            pool.shutdown();
        }
        self.shared.set_state(ReactorState::Joined);
        log::info!("reactor: stopped");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("state", &self.state())
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .field("workers", &self.workers.as_ref().map_or(0, |pool| pool.workers.len()))
            .finish()
    }
}

fn react_and_listen(shared: &ReactorShared, mut waitset: WaitSet, dispatcher: &Dispatcher) {
    let cleanup = shared.cleanup.origin();
    let mut triggered = Vec::with_capacity(waitset.capacity());
    while shared.keep_running.load(Ordering::Acquire) {
        waitset.wait_into(&mut triggered);
        for entry in triggered.drain(..) {
            if entry.originates_from(cleanup) {
                shared.cleanup.reset();
                continue;
            }
            if shared.is_pending_removal(entry.trigger_id()) {
                continue;
            }
            dispatcher.dispatch(&entry);
        }
        shared.apply_removals();
    }
    // Dropping the WaitSet here invalidates whatever is still attached.
    drop(waitset);
}
