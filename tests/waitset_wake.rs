use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use waitset::{
    EventOrigin, OriginId, TriggerHandle, TriggerId, UserTrigger, WaitSet, WaitSetConfig,
    WaitStrategy,
};

#[test]
fn wait_wakes_on_user_trigger() -> waitset::Result<()> {
    let mut waitset = WaitSet::new()?;
    let trigger = Arc::new(UserTrigger::new());
    trigger
        .attach(&mut waitset, TriggerId::new(1), None)
        .expect("attach");

    let (started_tx, started_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let _ = started_tx.send(());
        let fired = waitset.wait();
        let _ = done_tx.send(fired.len());
        waitset
    });

    started_rx.recv().unwrap();
    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

    trigger.trigger();
    assert_eq!(done_rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
    let _waitset = handle.join().unwrap();
    Ok(())
}

#[test]
fn no_wakeup_is_lost_under_ping_pong() -> waitset::Result<()> {
    const ROUNDS: usize = 10_000;

    let mut waitset = WaitSet::new()?;
    let ping = Arc::new(UserTrigger::new());
    ping.attach(&mut waitset, TriggerId::new(1), None)
        .expect("attach");

    let (ack_tx, ack_rx) = mpsc::channel();
    let consumer_ping = Arc::clone(&ping);
    let consumer = thread::spawn(move || {
        for _ in 0..ROUNDS {
            let fired = waitset.wait();
            assert_eq!(fired.len(), 1);
            consumer_ping.reset();
            ack_tx.send(()).unwrap();
        }
    });

    for round in 0..ROUNDS {
        ping.trigger();
        if ack_rx.recv_timeout(Duration::from_secs(2)).is_err() {
            panic!("wakeup lost in round {round}");
        }
    }
    consumer.join().unwrap();
    Ok(())
}

#[test]
fn triggered_entries_follow_registration_order() -> waitset::Result<()> {
    let mut waitset = WaitSet::new()?;
    let a = UserTrigger::new();
    let b = UserTrigger::new();
    let c = UserTrigger::new();
    a.attach(&mut waitset, TriggerId::new(10), None).unwrap();
    b.attach(&mut waitset, TriggerId::new(20), None).unwrap();
    c.attach(&mut waitset, TriggerId::new(30), None).unwrap();

    c.trigger();
    a.trigger();
    b.trigger();

    let ids: Vec<u64> = waitset
        .wait()
        .iter()
        .map(|entry| entry.trigger_id().value())
        .collect();
    assert_eq!(ids, vec![10, 20, 30]);
    Ok(())
}

#[test]
fn timed_wait_gives_up() -> waitset::Result<()> {
    let mut waitset = WaitSet::with_config(WaitSetConfig {
        capacity: 4,
        wait_strategy: WaitStrategy::SpinThenPark { spin_us: 5 },
    })?;
    let idle = UserTrigger::new();
    idle.attach(&mut waitset, TriggerId::new(1), None).unwrap();

    let start = Instant::now();
    let fired = waitset.timed_wait(Duration::from_millis(100));
    let elapsed = start.elapsed();

    assert!(fired.is_empty());
    assert!(elapsed >= Duration::from_millis(90), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "overslept: {elapsed:?}");
    Ok(())
}

#[test]
fn shutdown_trigger_ends_consumer_loop() -> waitset::Result<()> {
    let mut waitset = WaitSet::new()?;
    let work = Arc::new(UserTrigger::new());
    let shutdown = Arc::new(UserTrigger::new());
    work.attach(&mut waitset, TriggerId::new(1), None).unwrap();
    shutdown
        .attach(&mut waitset, TriggerId::new(2), None)
        .unwrap();

    let consumer_work = Arc::clone(&work);
    let shutdown_origin = shutdown.origin();
    let consumer = thread::spawn(move || {
        let mut handled = 0;
        loop {
            let fired = waitset.wait();
            if fired.iter().any(|e| e.originates_from(shutdown_origin)) {
                return handled;
            }
            consumer_work.reset();
            handled += 1;
        }
    });

    work.trigger();
    thread::sleep(Duration::from_millis(20));
    shutdown.trigger();
    let handled = consumer.join().unwrap();
    assert!(handled <= 1);
    Ok(())
}

struct FakeQueue {
    items: Mutex<VecDeque<u64>>,
    notifier: Mutex<Option<TriggerHandle>>,
}

impl FakeQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::new()),
            notifier: Mutex::new(None),
        })
    }

    fn push(&self, item: u64) {
        self.items.lock().unwrap().push_back(item);
        if let Some(handle) = self.notifier.lock().unwrap().as_ref() {
            handle.notify();
        }
    }

    fn pop(&self) -> Option<u64> {
        self.items.lock().unwrap().pop_front()
    }
}

impl EventOrigin for FakeQueue {
    fn has_pending_event(&self) -> bool {
        !self.items.lock().unwrap().is_empty()
    }
}

#[test]
fn event_origin_wakes_consumer() -> waitset::Result<()> {
    let mut waitset = WaitSet::new()?;
    let queue = FakeQueue::new();
    let handle = waitset
        .acquire_origin(&queue, TriggerId::new(7), None)
        .unwrap();
    *queue.notifier.lock().unwrap() = Some(handle);

    let consumer_queue = Arc::clone(&queue);
    let origin = OriginId::of(&*queue);
    let consumer = thread::spawn(move || {
        let mut received = Vec::new();
        while received.len() < 3 {
            for entry in waitset.wait() {
                assert!(entry.originates_from(origin));
                while let Some(item) = consumer_queue.pop() {
                    received.push(item);
                }
            }
        }
        received
    });

    for item in 1..=3 {
        queue.push(item);
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(consumer.join().unwrap(), vec![1, 2, 3]);
    Ok(())
}

#[test]
fn busy_spin_and_sleep_strategies_wake() -> waitset::Result<()> {
    for strategy in [
        WaitStrategy::BusySpin,
        WaitStrategy::Sleep(Duration::from_millis(1)),
    ] {
        let mut waitset = WaitSet::with_config(WaitSetConfig {
            capacity: 2,
            wait_strategy: strategy,
        })?;
        let trigger = Arc::new(UserTrigger::new());
        trigger.attach(&mut waitset, TriggerId::new(1), None).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let consumer_fired = Arc::clone(&fired);
        let consumer = thread::spawn(move || {
            let entries = waitset.wait();
            consumer_fired.store(!entries.is_empty(), Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(10));
        trigger.trigger();
        consumer.join().unwrap();
        assert!(fired.load(Ordering::SeqCst), "{strategy:?} missed the wake");
    }
    Ok(())
}
