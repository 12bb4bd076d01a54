//! Event bus and worker runtime.
//!
//! # Architecture
//!
//! ```text
//! publisher --> MessageBus --fan out--> per-worker EventQueue (bounded)
//!                                           |
//!                                           v
//!                              worker thread: commands_for(event)
//!                                           |
//!                                 command queue (in-worker)
//!                                           |
//!                          handle_command / no_command_work / drain
//! ```
//!
//! Each worker runs as one thread with its own bounded event queue and an
//! internal command queue; it processes one command at a time, which
//! serializes every mutation of the agreements it owns without global
//! locks. Queue back-pressure follows event severity: routine events drop
//! oldest-first when a queue is full, agreement-critical events block the
//! publisher with a deadline.
//!
//! Shutdown is a two-phase drain: [`WorkerRuntime::shutdown`] broadcasts
//! `WorkerStop`; each worker finishes its in-flight commands, drains its
//! subworkers, and answers `WorkerStopComplete`; the runtime then joins
//! the threads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use accord_core::events::{Event, EventKind, Severity};

/// Default bound of a subscriber queue.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// How long a publisher blocks on a full queue for critical events.
const CRITICAL_PUSH_DEADLINE: Duration = Duration::from_secs(5);

/// Outcome of handling one command.
pub enum Disposition<C> {
    /// The command is finished.
    Done,
    /// Put the command back on the queue and try again later.
    Requeue(C),
}

/// A worker in the collective.
///
/// Workers are single-threaded: the runtime calls every method from one
/// thread, one call at a time.
pub trait Worker: Send + 'static {
    /// The worker's command type.
    type Command: Send;

    /// Stable worker name, used in logs and stop-complete events.
    fn name(&self) -> &'static str;

    /// Event kinds this worker wants (WorkerStop is implicit).
    fn subscriptions(&self) -> Vec<EventKind>;

    /// Translates a bus event into commands for this worker.
    fn commands_for(&mut self, event: &Event) -> Vec<Self::Command>;

    /// Handles one command.
    fn handle_command(&mut self, cmd: Self::Command) -> Disposition<Self::Command>;

    /// Periodic work performed when no event arrives within the tick;
    /// returns commands to enqueue (e.g. match decisions from a search).
    fn no_command_work(&mut self) -> Vec<Self::Command>;

    /// Seconds of quiet before [`Worker::no_command_work`] runs.
    fn tick_interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    /// Final cleanup before the stop-complete answer; subworkers are
    /// drained here.
    fn drain(&mut self) {}
}

struct QueueInner {
    deque: Mutex<VecDeque<Arc<Event>>>,
    cond: Condvar,
    capacity: usize,
}

/// A bounded per-subscriber event queue.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                deque: Mutex::new(VecDeque::with_capacity(capacity)),
                cond: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Enqueues an event under the severity policy. Returns `false` when
    /// something was dropped to make room.
    fn push(&self, event: Arc<Event>) -> bool {
        let mut deque = self
            .inner
            .deque
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if deque.len() >= self.inner.capacity {
            match event.severity() {
                Severity::Routine => {
                    deque.pop_front();
                    deque.push_back(event);
                    self.inner.cond.notify_one();
                    return false;
                }
                Severity::Critical => {
                    let deadline = Instant::now() + CRITICAL_PUSH_DEADLINE;
                    while deque.len() >= self.inner.capacity {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            // Deadline passed with the consumer stuck; shed
                            // the oldest entry rather than the new one.
                            deque.pop_front();
                            deque.push_back(event);
                            self.inner.cond.notify_one();
                            return false;
                        }
                        let (guard, _) = self
                            .inner
                            .cond
                            .wait_timeout(deque, remaining)
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        deque = guard;
                    }
                }
            }
        }
        deque.push_back(event);
        self.inner.cond.notify_one();
        true
    }

    /// Dequeues the next event, waiting up to `timeout`.
    #[must_use]
    pub fn pop(&self, timeout: Duration) -> Option<Arc<Event>> {
        let deadline = Instant::now() + timeout;
        let mut deque = self
            .inner
            .deque
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if let Some(ev) = deque.pop_front() {
                // Wake a publisher blocked on a full queue.
                self.inner.cond.notify_one();
                return Some(ev);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(deque, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            deque = guard;
        }
    }
}

struct Subscription {
    name: String,
    kinds: Vec<EventKind>,
    queue: EventQueue,
}

/// The typed broadcast bus.
///
/// Events are delivered to each subscriber in post order; ordering across
/// subscribers is not guaranteed.
#[derive(Default)]
pub struct MessageBus {
    subs: Mutex<Vec<Subscription>>,
}

impl MessageBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribes a named consumer to a set of event kinds.
    pub fn subscribe(&self, name: &str, kinds: &[EventKind]) -> EventQueue {
        let queue = EventQueue::new(DEFAULT_QUEUE_CAPACITY);
        let mut subs = self
            .subs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        subs.push(Subscription {
            name: name.to_string(),
            kinds: kinds.to_vec(),
            queue: queue.clone(),
        });
        queue
    }

    /// Publishes an event to every interested subscriber.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let event = Arc::new(event);
        let subs = self
            .subs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for sub in subs.iter() {
            if sub.kinds.contains(&kind) {
                if !sub.queue.push(event.clone()) {
                    warn!(subscriber = %sub.name, ?kind, "subscriber queue overflowed, dropped oldest event");
                }
            }
        }
    }
}

/// Named periodic subworkers owned by a worker.
///
/// Each subworker is a thread running a closure at an interval until the
/// owning worker drains the set.
#[derive(Default)]
pub struct SubworkerSet {
    stop: Arc<AtomicBool>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl SubworkerSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a named subworker running `work` every `interval`.
    pub fn spawn(
        &mut self,
        name: &str,
        interval: Duration,
        mut work: impl FnMut() + Send + 'static,
    ) {
        let stop = self.stop.clone();
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!(subworker = %thread_name, "subworker started");
                while !stop.load(Ordering::Relaxed) {
                    work();
                    // Sleep in short slices so drain is responsive.
                    let deadline = Instant::now() + interval;
                    while !stop.load(Ordering::Relaxed) && Instant::now() < deadline {
                        std::thread::sleep(Duration::from_millis(100).min(interval));
                    }
                }
                debug!(subworker = %thread_name, "subworker stopped");
            })
            .expect("spawning a thread only fails when the process is out of resources");
        self.handles.push((name.to_string(), handle));
    }

    /// Signals every subworker and joins them.
    pub fn drain(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(subworker = %name, "subworker panicked");
            }
        }
    }
}

impl Drop for SubworkerSet {
    fn drop(&mut self) {
        self.drain();
    }
}

/// Spawns workers and coordinates the two-phase shutdown.
pub struct WorkerRuntime {
    bus: Arc<MessageBus>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    stop_queue: EventQueue,
}

impl WorkerRuntime {
    /// Creates a runtime over a bus.
    #[must_use]
    pub fn new(bus: Arc<MessageBus>) -> Self {
        let stop_queue = bus.subscribe("runtime", &[EventKind::WorkerStopComplete]);
        Self {
            bus,
            handles: Vec::new(),
            stop_queue,
        }
    }

    /// The bus workers publish to.
    #[must_use]
    pub fn bus(&self) -> Arc<MessageBus> {
        self.bus.clone()
    }

    /// Spawns a worker thread.
    pub fn spawn<W: Worker>(&mut self, mut worker: W) {
        let name = worker.name();
        let mut kinds = worker.subscriptions();
        if !kinds.contains(&EventKind::WorkerStop) {
            kinds.push(EventKind::WorkerStop);
        }
        let queue = self.bus.subscribe(name, &kinds);
        let bus = self.bus.clone();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                info!(worker = name, "worker started");
                let mut pending: VecDeque<W::Command> = VecDeque::new();
                loop {
                    match queue.pop(worker.tick_interval()) {
                        Some(event) => {
                            if matches!(*event, Event::WorkerStop) {
                                // Finish in-flight commands, then drain.
                                for cmd in pending.drain(..) {
                                    let _ = worker.handle_command(cmd);
                                }
                                worker.drain();
                                bus.publish(Event::WorkerStopComplete {
                                    worker: name.to_string(),
                                });
                                info!(worker = name, "worker stopped");
                                return;
                            }
                            pending.extend(worker.commands_for(&event));
                        }
                        None => {
                            let commands = worker.no_command_work();
                            pending.extend(commands);
                        }
                    }

                    // One pass over the command queue; requeued commands
                    // wait for the next pass.
                    let mut remaining = pending.len();
                    while remaining > 0 {
                        remaining -= 1;
                        let Some(cmd) = pending.pop_front() else {
                            break;
                        };
                        if let Disposition::Requeue(cmd) = worker.handle_command(cmd) {
                            pending.push_back(cmd);
                        }
                    }
                }
            })
            .expect("spawning a thread only fails when the process is out of resources");
        self.handles.push((name, handle));
    }

    /// Broadcasts `WorkerStop` and waits for every worker to answer, up to
    /// `deadline`. Workers that answered are joined; stuck workers are
    /// reported and abandoned.
    pub fn shutdown(mut self, deadline: Duration) {
        info!("broadcasting worker stop");
        self.bus.publish(Event::WorkerStop);

        let mut outstanding: Vec<&'static str> = self.handles.iter().map(|(n, _)| *n).collect();
        let until = Instant::now() + deadline;
        while !outstanding.is_empty() {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.stop_queue.pop(remaining) {
                Some(event) => {
                    if let Event::WorkerStopComplete { worker } = &*event {
                        outstanding.retain(|n| *n != worker.as_str());
                    }
                }
                None => break,
            }
        }

        for (name, handle) in self.handles.drain(..) {
            if outstanding.contains(&name) {
                error!(worker = name, "worker did not stop before the deadline");
                continue;
            }
            if handle.join().is_err() {
                error!(worker = name, "worker panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingWorker {
        name: &'static str,
        events_seen: Arc<AtomicUsize>,
        commands_run: Arc<AtomicUsize>,
        ticks: Arc<AtomicUsize>,
    }

    impl Worker for CountingWorker {
        type Command = u32;

        fn name(&self) -> &'static str {
            self.name
        }

        fn subscriptions(&self) -> Vec<EventKind> {
            vec![EventKind::NodeConfigured]
        }

        fn commands_for(&mut self, _event: &Event) -> Vec<u32> {
            self.events_seen.fetch_add(1, Ordering::SeqCst);
            vec![1, 2]
        }

        fn handle_command(&mut self, _cmd: u32) -> Disposition<u32> {
            self.commands_run.fetch_add(1, Ordering::SeqCst);
            Disposition::Done
        }

        fn no_command_work(&mut self) -> Vec<u32> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }

        fn tick_interval(&self) -> Duration {
            Duration::from_millis(20)
        }
    }

    #[test]
    fn test_events_become_commands_and_shutdown_completes() {
        let bus = MessageBus::new();
        let mut runtime = WorkerRuntime::new(bus.clone());
        let events_seen = Arc::new(AtomicUsize::new(0));
        let commands_run = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::new(AtomicUsize::new(0));
        runtime.spawn(CountingWorker {
            name: "counting",
            events_seen: events_seen.clone(),
            commands_run: commands_run.clone(),
            ticks: ticks.clone(),
        });

        bus.publish(Event::NodeConfigured {
            org: "myorg".into(),
            id: "node1".into(),
        });
        // An event the worker did not subscribe to is never delivered.
        bus.publish(Event::NodeUnconfiguring);

        std::thread::sleep(Duration::from_millis(100));
        runtime.shutdown(Duration::from_secs(2));

        assert_eq!(events_seen.load(Ordering::SeqCst), 1);
        assert_eq!(commands_run.load(Ordering::SeqCst), 2);
        assert!(ticks.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_routine_events_drop_oldest_when_full() {
        let queue = EventQueue::new(2);
        for i in 0..5 {
            queue.push(Arc::new(Event::NodeConfigured {
                org: "o".into(),
                id: format!("n{i}"),
            }));
        }
        // Only the newest two survive.
        let first = queue.pop(Duration::from_millis(10)).unwrap();
        let second = queue.pop(Duration::from_millis(10)).unwrap();
        assert!(queue.pop(Duration::from_millis(10)).is_none());
        match (&*first, &*second) {
            (Event::NodeConfigured { id: a, .. }, Event::NodeConfigured { id: b, .. }) => {
                assert_eq!(a, "n3");
                assert_eq!(b, "n4");
            }
            _ => panic!("unexpected events"),
        }
    }

    #[test]
    fn test_post_order_is_preserved_per_subscriber() {
        let bus = MessageBus::new();
        let queue = bus.subscribe("observer", &[EventKind::AgreementReached]);
        for i in 0..10 {
            bus.publish(Event::AgreementReached {
                agreement_id: format!("ag-{i}"),
                protocol: "accord-basic".into(),
            });
        }
        for i in 0..10 {
            let ev = queue.pop(Duration::from_millis(50)).unwrap();
            match &*ev {
                Event::AgreementReached { agreement_id, .. } => {
                    assert_eq!(*agreement_id, format!("ag-{i}"));
                }
                _ => panic!("unexpected event"),
            }
        }
    }

    #[test]
    fn test_subworkers_drain_on_drop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut set = SubworkerSet::new();
        let counter = runs.clone();
        set.spawn("ticker", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(50));
        set.drain();
        let after_drain = runs.load(Ordering::SeqCst);
        assert!(after_drain >= 1);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), after_drain);
    }
}
