//! Per-isolate run loop
//!
//! One loop per isolate thread. Work comes from four places:
//! - the microtask queue, drained completely after every macrotask
//! - the ready macrotask queue
//! - the timer heap, ordered by `(deadline, sequence)` so equal deadlines
//!   fire in creation order
//! - a channel other threads post into through a [`LoopHandle`]
//!
//! The loop is idle when all four are empty and nothing holds a
//! [`KeepAlive`] on it.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use jsobjc_sdk::JsResult;
use rustc_hash::FxHashMap;

use crate::error::{RuntimeError, RuntimeResult};
use crate::isolate::Isolate;

/// Work run on the loop's own thread
pub(crate) type Task = Box<dyn FnOnce(&Isolate) -> JsResult<()>>;

/// Work posted from any thread
pub type RemoteTask = Box<dyn FnOnce(&Isolate) + Send>;

/// Repeating or one-shot timer callback
pub(crate) type TimerCallback = Rc<dyn Fn(&Isolate) -> JsResult<()>>;

/// Timer identifier, unique per isolate and never reused
pub type TimerId = u32;

enum Message {
    Task(RemoteTask),
    /// Re-check the idle condition
    Wake,
}

struct LoopShared {
    keep_alive: AtomicUsize,
    shutdown: AtomicBool,
    thread: ThreadId,
}

/// A `Send` handle that posts work to an isolate's thread
#[derive(Clone)]
pub struct LoopHandle {
    sender: Sender<Message>,
    shared: Arc<LoopShared>,
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl LoopHandle {
    /// Queue `task` as a macrotask on the loop's thread
    pub fn post(&self, task: impl FnOnce(&Isolate) + Send + 'static) -> RuntimeResult<()> {
        if self.is_shut_down() {
            return Err(RuntimeError::Terminated("Isolate".to_string()));
        }
        self.sender
            .send(Message::Task(Box::new(task)))
            .map_err(|_| RuntimeError::Terminated("Isolate".to_string()))
    }

    /// Keep the loop from going idle until the returned guard drops
    pub fn keep_alive(&self) -> KeepAlive {
        self.shared.keep_alive.fetch_add(1, AtomicOrdering::AcqRel);
        KeepAlive {
            handle: self.clone(),
        }
    }

    /// Stop the loop. Queued and future work is discarded.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, AtomicOrdering::Release);
        self.wake();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(AtomicOrdering::Acquire)
    }

    /// The thread the loop runs on
    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread
    }

    fn wake(&self) {
        // A closed channel means the loop is gone; nothing to wake
        let _ = self.sender.send(Message::Wake);
    }
}

/// Guard returned by [`LoopHandle::keep_alive`]
#[derive(Debug)]
pub struct KeepAlive {
    handle: LoopHandle,
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.handle.shared.keep_alive.fetch_sub(1, AtomicOrdering::AcqRel);
        self.handle.wake();
    }
}

/// Entry in the timer heap
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    id: TimerId,
}

// Reversed for a min-heap: earliest deadline, then lowest sequence
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

struct TimerSlot {
    callback: TimerCallback,
    repeat: Option<Duration>,
    /// Sequence of the heap entry that currently arms this timer
    armed: u64,
}

/// The loop itself. Lives on, and only on, its isolate's thread.
pub(crate) struct RunLoop {
    microtasks: RefCell<VecDeque<Task>>,
    macrotasks: RefCell<VecDeque<Task>>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    slots: RefCell<FxHashMap<TimerId, TimerSlot>>,
    next_timer: Cell<TimerId>,
    next_seq: Cell<u64>,
    receiver: Receiver<Message>,
    handle: LoopHandle,
    resolution: Duration,
}

impl RunLoop {
    pub(crate) fn new(timer_resolution: Duration) -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            microtasks: RefCell::new(VecDeque::new()),
            macrotasks: RefCell::new(VecDeque::new()),
            timers: RefCell::new(BinaryHeap::new()),
            slots: RefCell::new(FxHashMap::default()),
            next_timer: Cell::new(1),
            next_seq: Cell::new(0),
            receiver,
            handle: LoopHandle {
                sender,
                shared: Arc::new(LoopShared {
                    keep_alive: AtomicUsize::new(0),
                    shutdown: AtomicBool::new(false),
                    thread: thread::current().id(),
                }),
            },
            resolution: timer_resolution,
        }
    }

    pub(crate) fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub(crate) fn queue_microtask(&self, task: Task) {
        self.microtasks.borrow_mut().push_back(task);
    }

    pub(crate) fn queue_macrotask(&self, task: Task) {
        self.macrotasks.borrow_mut().push_back(task);
    }

    fn next_seq(&self) -> u64 {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        seq
    }

    /// Arm a timer. A repeating timer's period is clamped to the loop's
    /// resolution.
    pub(crate) fn add_timer(&self, delay: Duration, repeat: bool, callback: TimerCallback) -> TimerId {
        let id = self.next_timer.get();
        self.next_timer.set(id.wrapping_add(1).max(1));
        let seq = self.next_seq();
        let repeat = repeat.then(|| delay.max(self.resolution));
        self.slots.borrow_mut().insert(
            id,
            TimerSlot {
                callback,
                repeat,
                armed: seq,
            },
        );
        self.timers.borrow_mut().push(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            id,
        });
        tracing::trace!(timer = id, ?delay, repeating = repeat.is_some(), "armed timer");
        id
    }

    /// Cancel a timer. Unknown and already-cancelled ids are ignored.
    pub(crate) fn clear_timer(&self, id: TimerId) -> bool {
        self.slots.borrow_mut().remove(&id).is_some()
    }

    /// Number of live timers
    pub(crate) fn pending_timers(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Drop heap entries whose timer was cancelled or re-armed
    fn discard_stale(&self) {
        let slots = self.slots.borrow();
        let mut timers = self.timers.borrow_mut();
        while let Some(top) = timers.peek() {
            match slots.get(&top.id) {
                Some(slot) if slot.armed == top.seq => break,
                _ => {
                    timers.pop();
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.discard_stale();
        self.timers.borrow().peek().map(|t| t.deadline)
    }

    /// Pop the earliest timer if it is due, re-arming it when it repeats
    fn take_due_timer(&self, now: Instant) -> Option<TimerCallback> {
        self.discard_stale();
        let mut timers = self.timers.borrow_mut();
        if timers.peek().map_or(true, |t| t.deadline > now) {
            return None;
        }
        let entry = timers.pop()?;
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(&entry.id)?;
        let callback = slot.callback.clone();
        match slot.repeat {
            Some(period) => {
                let seq = self.next_seq();
                slot.armed = seq;
                timers.push(TimerEntry {
                    deadline: now + period,
                    seq,
                    id: entry.id,
                });
            }
            None => {
                slots.remove(&entry.id);
            }
        }
        Some(callback)
    }

    fn accept(&self, message: Message) {
        if let Message::Task(task) = message {
            self.queue_macrotask(Box::new(move |isolate| {
                task(isolate);
                Ok(())
            }));
        }
    }

    fn pump_channel(&self) {
        while let Ok(message) = self.receiver.try_recv() {
            self.accept(message);
        }
    }

    pub(crate) fn drain_microtasks(&self, isolate: &Isolate) {
        loop {
            let task = self.microtasks.borrow_mut().pop_front();
            let Some(task) = task else { break };
            if let Err(e) = task(isolate) {
                isolate.report_uncaught(e);
            }
        }
    }

    fn run_macrotask(&self, isolate: &Isolate, task: impl FnOnce(&Isolate) -> JsResult<()>) {
        if let Err(e) = task(isolate) {
            isolate.report_uncaught(e);
        }
        self.drain_microtasks(isolate);
        isolate.bridge().collect_deferred();
    }

    fn discard_all(&self) {
        self.microtasks.borrow_mut().clear();
        self.macrotasks.borrow_mut().clear();
        self.timers.borrow_mut().clear();
        self.slots.borrow_mut().clear();
        while self.receiver.try_recv().is_ok() {}
    }

    /// Run until no work is left and nothing keeps the loop alive, or until
    /// the loop is shut down
    pub(crate) fn run_until_idle(&self, isolate: &Isolate) {
        loop {
            if self.handle.is_shut_down() {
                self.discard_all();
                return;
            }
            self.drain_microtasks(isolate);
            self.pump_channel();

            let task = self.macrotasks.borrow_mut().pop_front();
            if let Some(task) = task {
                self.run_macrotask(isolate, task);
                continue;
            }
            if let Some(callback) = self.take_due_timer(Instant::now()) {
                self.run_macrotask(isolate, |isolate| callback(isolate));
                continue;
            }

            let held = self.handle.shared.keep_alive.load(AtomicOrdering::Acquire) > 0;
            let received = match (self.next_deadline(), held) {
                (None, false) => return,
                (Some(deadline), _) => match self.receiver.recv_deadline(deadline) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                },
                (None, true) => match self.receiver.recv() {
                    Ok(message) => Some(message),
                    Err(_) => return,
                },
            };
            if let Some(message) = received {
                self.accept(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use pretty_assertions::assert_eq;

    fn isolate() -> Isolate {
        Isolate::new(RuntimeConfig::default()).unwrap()
    }

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> TimerCallback) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |label: &str| -> TimerCallback {
                let log = log.clone();
                let label = label.to_string();
                Rc::new(move |_: &Isolate| {
                    log.borrow_mut().push(label.clone());
                    Ok(())
                })
            }
        };
        (log, make)
    }

    #[test]
    fn test_equal_deadlines_fire_in_creation_order() {
        let isolate = isolate();
        let (log, make) = recorder();
        let run_loop = isolate.run_loop();
        for label in ["a", "b", "c"] {
            run_loop.add_timer(Duration::ZERO, false, make(label));
        }
        isolate.run_until_idle();
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_shorter_delay_fires_first() {
        let isolate = isolate();
        let (log, make) = recorder();
        let run_loop = isolate.run_loop();
        run_loop.add_timer(Duration::from_millis(20), false, make("late"));
        run_loop.add_timer(Duration::from_millis(1), false, make("early"));
        isolate.run_until_idle();
        assert_eq!(*log.borrow(), vec!["early", "late"]);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let isolate = isolate();
        let (log, make) = recorder();
        let run_loop = isolate.run_loop();
        let id = run_loop.add_timer(Duration::from_millis(5), false, make("cancelled"));
        run_loop.add_timer(Duration::ZERO, false, make("kept"));
        assert!(run_loop.clear_timer(id));
        assert!(!run_loop.clear_timer(id));
        isolate.run_until_idle();
        assert_eq!(*log.borrow(), vec!["kept"]);
        assert_eq!(run_loop.pending_timers(), 0);
    }

    #[test]
    fn test_microtasks_drain_before_next_timer() {
        let isolate = isolate();
        let log = Rc::new(RefCell::new(Vec::<&str>::new()));
        let run_loop = isolate.run_loop();
        let first = log.clone();
        run_loop.add_timer(
            Duration::ZERO,
            false,
            Rc::new(move |isolate: &Isolate| {
                first.borrow_mut().push("timer 1");
                let micro = first.clone();
                isolate.queue_microtask(move |_| {
                    micro.borrow_mut().push("microtask");
                    Ok(())
                });
                Ok(())
            }),
        );
        let second = log.clone();
        run_loop.add_timer(
            Duration::ZERO,
            false,
            Rc::new(move |_: &Isolate| {
                second.borrow_mut().push("timer 2");
                Ok(())
            }),
        );
        isolate.run_until_idle();
        assert_eq!(*log.borrow(), vec!["timer 1", "microtask", "timer 2"]);
    }

    #[test]
    fn test_interval_repeats_until_cleared() {
        let isolate = isolate();
        let count = Rc::new(Cell::new(0));
        let run_loop = isolate.run_loop();
        let ticks = count.clone();
        let id = Rc::new(Cell::new(0));
        let own_id = id.clone();
        id.set(run_loop.add_timer(
            Duration::from_millis(1),
            true,
            Rc::new(move |isolate: &Isolate| {
                ticks.set(ticks.get() + 1);
                if ticks.get() == 3 {
                    isolate.clear_timer(own_id.get());
                }
                Ok(())
            }),
        ));
        isolate.run_until_idle();
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_posts_from_other_threads_run_on_loop_thread() {
        let isolate = isolate();
        let handle = isolate.spawn_handle();
        let guard = handle.keep_alive();
        let loop_thread = thread::current().id();
        let seen = Rc::new(Cell::new(false));
        let flag = seen.clone();
        isolate.queue_microtask(move |isolate| {
            flag.set(isolate.thread_id() == loop_thread);
            Ok(())
        });
        let worker = thread::spawn(move || {
            handle
                .post(move |isolate| {
                    isolate.console().record("posted");
                })
                .unwrap();
            drop(guard);
        });
        isolate.run_until_idle();
        worker.join().unwrap();
        assert!(seen.get());
        assert_eq!(isolate.console().lines(), vec!["posted".to_string()]);
    }

    #[test]
    fn test_shutdown_discards_pending_work() {
        let isolate = isolate();
        let (log, make) = recorder();
        isolate.run_loop().add_timer(Duration::from_millis(50), false, make("late"));
        let handle = isolate.spawn_handle();
        handle.shutdown();
        isolate.run_until_idle();
        assert!(log.borrow().is_empty());
        assert!(handle.post(|_| {}).is_err());
    }
}
