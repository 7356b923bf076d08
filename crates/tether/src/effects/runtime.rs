//! Single-threaded task queue that owns every reply.
//!
//! Work that must not run inside the caller's stack is posted here and run
//! on the next iteration. Other threads and tokio tasks never touch replies
//! directly; they hold a [`RemoteWaker`] and the loop runs the matching
//! callback on its own thread.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::poll_fn;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

type Task = Box<dyn FnOnce()>;

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId {
    deadline: Instant,
    seq: u64,
}

impl TimerId {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// `Send` handle that schedules a callback on the owning loop.
#[derive(Debug, Clone)]
pub struct RemoteWaker {
    id: u64,
    tx: mpsc::UnboundedSender<u64>,
}

impl RemoteWaker {
    /// Request the callback; repeated wakes before it runs collapse into one.
    pub fn wake(&self) {
        let _ = self.tx.send(self.id);
    }
}

/// Keeps a remote wake callback registered; dropping it unregisters.
pub struct WakeRegistration {
    id: u64,
    owner: Weak<LoopInner>,
    waker: RemoteWaker,
}

impl WakeRegistration {
    pub fn waker(&self) -> RemoteWaker {
        self.waker.clone()
    }
}

impl Drop for WakeRegistration {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.wakers.borrow_mut().remove(&self.id);
        }
    }
}

impl fmt::Debug for WakeRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeRegistration").field("id", &self.id).finish()
    }
}

struct LoopInner {
    queue: RefCell<VecDeque<Task>>,
    timers: RefCell<BTreeMap<TimerId, Task>>,
    next_seq: Cell<u64>,
    wakers: RefCell<HashMap<u64, Rc<dyn Fn()>>>,
    next_waker: Cell<u64>,
    remote_tx: mpsc::UnboundedSender<u64>,
    remote_rx: RefCell<mpsc::UnboundedReceiver<u64>>,
}

/// Cheap, clonable handle to the loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("queued", &self.inner.queue.borrow().len())
            .field("timers", &self.inner.timers.borrow().len())
            .finish()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Self {
            inner: Rc::new(LoopInner {
                queue: RefCell::new(VecDeque::new()),
                timers: RefCell::new(BTreeMap::new()),
                next_seq: Cell::new(0),
                wakers: RefCell::new(HashMap::new()),
                next_waker: Cell::new(0),
                remote_tx,
                remote_rx: RefCell::new(remote_rx),
            }),
        }
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Queue `task` for the next iteration. Never runs it synchronously.
    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.inner.queue.borrow_mut().push_back(Box::new(task));
    }

    pub fn post_at(&self, deadline: Instant, task: impl FnOnce() + 'static) -> TimerId {
        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq + 1);
        let id = TimerId { deadline, seq };
        self.inner.timers.borrow_mut().insert(id, Box::new(task));
        id
    }

    pub fn post_after(&self, delay: Duration, task: impl FnOnce() + 'static) -> TimerId {
        self.post_at(Instant::now() + delay, task)
    }

    /// Returns `false` when the timer already fired or was cancelled.
    pub fn cancel(&self, timer: TimerId) -> bool {
        self.inner.timers.borrow_mut().remove(&timer).is_some()
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.inner.timers.borrow().keys().next().map(|id| id.deadline)
    }

    pub fn pending_tasks(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// Register `callback` to run on this loop whenever the returned
    /// registration's waker is woken from any thread.
    pub fn remote_waker(&self, callback: impl Fn() + 'static) -> WakeRegistration {
        let id = self.inner.next_waker.get();
        self.inner.next_waker.set(id + 1);
        self.inner
            .wakers
            .borrow_mut()
            .insert(id, Rc::new(callback));
        WakeRegistration {
            id,
            owner: Rc::downgrade(&self.inner),
            waker: RemoteWaker {
                id,
                tx: self.inner.remote_tx.clone(),
            },
        }
    }

    /// One iteration: collect remote wakes and due timers, then run the
    /// tasks queued at this point. Tasks they post wait for the next call.
    pub fn process_events(&self) -> usize {
        let mut woken = Vec::new();
        {
            let mut rx = self.inner.remote_rx.borrow_mut();
            while let Ok(id) = rx.try_recv() {
                if !woken.contains(&id) {
                    woken.push(id);
                }
            }
        }
        for id in woken {
            self.dispatch_remote(id);
        }

        let now = Instant::now();
        loop {
            let mut timers = self.inner.timers.borrow_mut();
            let Some(entry) = timers.first_entry() else {
                break;
            };
            if entry.key().deadline > now {
                break;
            }
            let task = entry.remove();
            drop(timers);
            self.inner.queue.borrow_mut().push_back(task);
        }

        let batch = self.inner.queue.borrow().len();
        for _ in 0..batch {
            let task = self.inner.queue.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
        batch
    }

    /// Iterate until nothing is queued and no timer is due.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let ran = self.process_events();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }

    /// Drive the loop until `done` returns `true`, sleeping until the next
    /// timer or remote wake whenever it is idle.
    ///
    /// Returns `false` if the loop can make no further progress: no timer
    /// is pending and no remote waker is registered.
    pub async fn run_until(&self, mut done: impl FnMut() -> bool) -> bool {
        loop {
            self.run_until_idle();
            if done() {
                return true;
            }
            let deadline = self.next_timer_deadline();
            if deadline.is_none() && self.inner.wakers.borrow().is_empty() {
                trace!("event loop stalled");
                return false;
            }
            let recv = poll_fn(|cx| self.inner.remote_rx.borrow_mut().poll_recv(cx));
            let woken = match deadline {
                Some(deadline) => tokio::select! {
                    id = recv => id,
                    _ = tokio::time::sleep_until(deadline) => None,
                },
                None => recv.await,
            };
            if let Some(id) = woken {
                self.dispatch_remote(id);
            }
        }
    }

    fn dispatch_remote(&self, id: u64) {
        let callback = self.inner.wakers.borrow().get(&id).cloned();
        if let Some(callback) = callback {
            self.post(move || callback());
        }
    }
}
