//! Event-notification core for zero-copy IPC.
//!
//! Origins register predicates with a [`WaitSet`] and receive a
//! [`TriggerHandle`] to signal through. A single consumer blocks in
//! [`WaitSet::wait`] on a shared wake primitive ([`ConditionVariable`]) and
//! gets back the triggered entries in registration order. [`UserTrigger`] is
//! the application-controlled signal, and [`Reactor`] runs the wait loop on a
//! background thread and dispatches bound callbacks.

pub mod condvar;
pub mod error;
mod mmap;
pub mod reactor;
mod registry;
pub mod trigger;
pub mod user_trigger;
pub mod wait;
pub mod wait_set;

pub use condvar::{ConditionVariable, ConditionVariableWaiter, WaitStrategy};
pub use error::{Error, Result, WaitSetError};
pub use reactor::{Reactor, ReactorConfig, ReactorState, TriggerRemover};
pub use trigger::{Callback, EventOrigin, OriginId, TriggerHandle, TriggerId, TriggeredEntry};
pub use user_trigger::UserTrigger;
pub use wait_set::{WaitSet, WaitSetConfig, MAX_TRIGGERS_PER_WAITSET};
