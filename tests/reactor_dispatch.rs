use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use waitset::{
    Callback, EventOrigin, OriginId, Reactor, ReactorConfig, ReactorState, TriggerHandle,
    TriggerId, TriggeredEntry, UserTrigger, WaitSetConfig,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Consumes the user trigger and reports which thread ran the callback.
fn reporting_callback(
    trigger: &Arc<UserTrigger>,
    tx: mpsc::Sender<(TriggerId, Option<String>)>,
) -> Callback {
    let trigger = Arc::clone(trigger);
    let tx = Mutex::new(tx);
    Callback::new(move |entry: &TriggeredEntry| {
        trigger.reset();
        let name = thread::current().name().map(str::to_string);
        let _ = tx.lock().unwrap().send((entry.trigger_id(), name));
    })
}

#[test]
fn inline_callback_runs_on_loop_thread() -> waitset::Result<()> {
    init_logging();
    let reactor = Reactor::new()?;
    let trigger = Arc::new(UserTrigger::new());
    let (tx, rx) = mpsc::channel();
    reactor
        .attach_user_trigger(&trigger, TriggerId::new(1), reporting_callback(&trigger, tx))
        .unwrap();
    assert_eq!(reactor.size(), 1);

    trigger.trigger();
    let (id, name) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(id, TriggerId::new(1));
    assert_eq!(name.as_deref(), Some("waitset-reactor"));

    // Level-triggered: consumed by the callback, so no repeat dispatch.
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    trigger.trigger();
    rx.recv_timeout(Duration::from_secs(1)).unwrap();
    reactor.shutdown();
    Ok(())
}

#[test]
fn worker_pool_dispatches_off_loop_thread() -> waitset::Result<()> {
    init_logging();
    let reactor = Reactor::with_config(ReactorConfig {
        workers: 2,
        thread_name: "dispatch".to_string(),
        ..ReactorConfig::default()
    })?;
    let (tx, rx) = mpsc::channel();
    let triggers: Vec<_> = (0..4).map(|_| Arc::new(UserTrigger::new())).collect();
    for (i, trigger) in triggers.iter().enumerate() {
        reactor
            .attach_user_trigger(
                trigger,
                TriggerId::new(i as u64),
                reporting_callback(trigger, tx.clone()),
            )
            .unwrap();
    }

    for trigger in &triggers {
        trigger.trigger();
    }
    let mut seen = Vec::new();
    for _ in 0..triggers.len() {
        let (id, name) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let name = name.unwrap_or_default();
        assert!(name.starts_with("dispatch-w"), "ran on {name}");
        seen.push(id.value());
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3]);
    reactor.shutdown();
    Ok(())
}

#[test]
fn pool_redispatches_still_pending_origin() -> waitset::Result<()> {
    init_logging();
    let reactor = Reactor::with_config(ReactorConfig {
        workers: 1,
        ..ReactorConfig::default()
    })?;
    let trigger = Arc::new(UserTrigger::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let consumed = Arc::clone(&trigger);
    let counter = Arc::clone(&calls);
    reactor
        .attach_user_trigger(
            &trigger,
            TriggerId::new(1),
            Callback::new(move |_: &TriggeredEntry| {
                // Leave the event pending on the first call only.
                let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if call > 1 {
                    consumed.reset();
                }
                let _ = tx.lock().unwrap().send(call);
            }),
        )
        .unwrap();

    trigger.trigger();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    reactor.shutdown();
    Ok(())
}

struct Inbox {
    pending: AtomicBool,
    delivered: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<TriggerHandle>>,
}

impl Inbox {
    fn post(&self) {
        self.pending.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().as_ref() {
            handle.notify();
        }
    }
}

impl EventOrigin for Inbox {
    fn has_pending_event(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}

fn drain_inbox(inbox: &Inbox) {
    inbox.pending.store(false, Ordering::SeqCst);
    if let Some(tx) = inbox.delivered.lock().unwrap().as_ref() {
        let _ = tx.send(());
    }
}

#[test]
fn origin_callback_receives_origin() -> waitset::Result<()> {
    let reactor = Reactor::new()?;
    let (tx, rx) = mpsc::channel();
    let inbox = Arc::new(Inbox {
        pending: AtomicBool::new(false),
        delivered: Mutex::new(Some(tx)),
        handle: Mutex::new(None),
    });
    let handle = reactor
        .attach_origin(&inbox, TriggerId::new(5), Callback::for_origin(drain_inbox))
        .unwrap();
    *inbox.handle.lock().unwrap() = Some(handle);

    inbox.post();
    rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(!inbox.has_pending_event());

    // The last owner to let go of the origin drops its handle, which
    // detaches it; the loop thread may still hold it for a moment.
    drop(inbox);
    for _ in 0..100 {
        if reactor.size() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(reactor.size(), 0);
    reactor.shutdown();
    Ok(())
}

#[test]
fn callback_can_remove_its_own_trigger() -> waitset::Result<()> {
    init_logging();
    let reactor = Reactor::new()?;
    let remover = reactor.remover();
    let invalidated = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let on_invalidate = Arc::clone(&invalidated);
    // Never consumed: only the removal stops it from firing.
    let _handle = reactor
        .attach(
            OriginId::from_raw(0x5151),
            || true,
            move || {
                on_invalidate.fetch_add(1, Ordering::SeqCst);
            },
            TriggerId::new(9),
            Callback::new(move |entry: &TriggeredEntry| {
                counter.fetch_add(1, Ordering::SeqCst);
                remover.remove(entry.trigger_id());
            }),
        )
        .unwrap();

    for _ in 0..100 {
        if invalidated.load(Ordering::SeqCst) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(invalidated.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(reactor.size(), 0);
    reactor.shutdown();
    Ok(())
}

#[test]
fn detach_from_outside_stops_dispatch() -> waitset::Result<()> {
    let reactor = Reactor::new()?;
    let trigger = Arc::new(UserTrigger::new());
    let (tx, rx) = mpsc::channel();
    reactor
        .attach_user_trigger(&trigger, TriggerId::new(3), reporting_callback(&trigger, tx))
        .unwrap();

    reactor.detach(TriggerId::new(3));
    for _ in 0..100 {
        if !trigger.is_attached() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!trigger.is_attached());
    assert_eq!(reactor.size(), 0);

    trigger.trigger();
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    Ok(())
}

#[test]
fn shutdown_reaches_joined_and_detaches_everything() -> waitset::Result<()> {
    let reactor = Reactor::with_config(ReactorConfig {
        workers: 1,
        ..ReactorConfig::default()
    })?;
    let remover = reactor.remover();
    let trigger = Arc::new(UserTrigger::new());
    let (tx, _rx) = mpsc::channel();
    reactor
        .attach_user_trigger(&trigger, TriggerId::new(1), reporting_callback(&trigger, tx))
        .unwrap();
    assert_eq!(remover.reactor_state(), ReactorState::Running);

    reactor.shutdown();
    assert_eq!(remover.reactor_state(), ReactorState::Joined);
    assert!(!trigger.is_attached());

    // Removal requests after shutdown are harmless.
    remover.remove(TriggerId::new(1));
    Ok(())
}

#[test]
fn shutdown_waits_for_in_flight_callback() -> waitset::Result<()> {
    let reactor = Reactor::with_config(ReactorConfig {
        workers: 1,
        ..ReactorConfig::default()
    })?;
    let trigger = Arc::new(UserTrigger::new());
    let finished = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = mpsc::channel();
    let started_tx = Mutex::new(started_tx);

    let consumed = Arc::clone(&trigger);
    let done = Arc::clone(&finished);
    reactor
        .attach_user_trigger(
            &trigger,
            TriggerId::new(1),
            Callback::new(move |_: &TriggeredEntry| {
                consumed.reset();
                let _ = started_tx.lock().unwrap().send(());
                thread::sleep(Duration::from_millis(100));
                done.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    trigger.trigger();
    started_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    reactor.shutdown();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn rejects_invalid_config() {
    let long_name = Reactor::with_config(ReactorConfig {
        thread_name: "this-name-is-too-long".to_string(),
        ..ReactorConfig::default()
    });
    assert!(matches!(long_name, Err(waitset::Error::InvalidConfig(_))));

    let zero = Reactor::with_config(ReactorConfig {
        waitset: WaitSetConfig {
            capacity: 0,
            ..WaitSetConfig::default()
        },
        ..ReactorConfig::default()
    });
    assert!(matches!(zero, Err(waitset::Error::InvalidConfig(_))));
}
