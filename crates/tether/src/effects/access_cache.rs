//! Timer-driven object pool on top of [`ExpiryCache`].

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tether_cache::{Cacheable, ExpiryCache};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::runtime::{EventLoop, TimerId};

/// A pooled object of any concrete type.
pub trait Pooled: Cacheable + Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Cacheable + Any> Pooled for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn Pooled {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

/// What the connection cache of a manager holds.
pub type PooledObject = Rc<dyn Pooled>;

type Waiter<T> = Box<dyn FnOnce(Option<T>)>;

/// Result of [`AccessCache::request_entry`].
pub enum RequestOutcome<T> {
    /// The entry was free (or shareable) and is now held by the caller.
    Ready(T),
    /// The entry is busy; the callback runs once it is released or removed.
    Queued,
    /// No entry under that key.
    Missing,
}

impl<T> fmt::Debug for RequestOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestOutcome::Ready(_) => "Ready",
            RequestOutcome::Queued => "Queued",
            RequestOutcome::Missing => "Missing",
        })
    }
}

struct State<T> {
    cache: ExpiryCache<T>,
    timer: Option<TimerId>,
    slack: Duration,
    waiters: HashMap<Bytes, VecDeque<Waiter<T>>>,
}

/// Expiry cache with a single sweep timer and queued hand-over of busy
/// entries. Clones share the same pool.
pub struct AccessCache<T> {
    state: Rc<RefCell<State<T>>>,
    event_loop: EventLoop,
}

impl<T> Clone for AccessCache<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            event_loop: self.event_loop.clone(),
        }
    }
}

impl<T: Cacheable + Clone> fmt::Debug for AccessCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("AccessCache")
            .field("entries", &state.cache.len())
            .field("timer", &state.timer)
            .finish()
    }
}

impl<T: Cacheable + Clone + 'static> AccessCache<T> {
    pub fn new(event_loop: &EventLoop, default_ttl: Duration, slack: Duration) -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                cache: ExpiryCache::new(default_ttl),
                timer: None,
                slack,
                waiters: HashMap::new(),
            })),
            event_loop: event_loop.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.borrow().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_entry(&self, key: &[u8]) -> bool {
        self.state.borrow().cache.has_entry(key)
    }

    pub fn use_count(&self, key: &[u8]) -> Option<usize> {
        self.state.borrow().cache.use_count(key)
    }

    /// Insert an object already held by the caller.
    pub fn add_entry(&self, key: impl Into<Bytes>, object: T, ttl: Option<Duration>) {
        self.state.borrow_mut().cache.add_entry(key, object, ttl);
        self.rearm();
    }

    pub fn request_entry_now(&self, key: &[u8]) -> Option<T> {
        let object = self.state.borrow_mut().cache.request_entry_now(key);
        if object.is_some() {
            self.rearm();
        }
        object
    }

    /// Like [`request_entry_now`](Self::request_entry_now), but a busy
    /// entry queues `callback` instead of failing. The callback never runs
    /// inside this call; it receives `None` if the entry is removed first.
    pub fn request_entry(
        &self,
        key: &[u8],
        callback: impl FnOnce(Option<T>) + 'static,
    ) -> RequestOutcome<T> {
        if !self.has_entry(key) {
            return RequestOutcome::Missing;
        }
        if let Some(object) = self.request_entry_now(key) {
            return RequestOutcome::Ready(object);
        }
        trace!(key = ?Bytes::copy_from_slice(key), "queued for busy cache entry");
        self.state
            .borrow_mut()
            .waiters
            .entry(Bytes::copy_from_slice(key))
            .or_default()
            .push_back(Box::new(callback));
        RequestOutcome::Queued
    }

    /// Release one hold. A queued requester takes the entry over before it
    /// can start expiring.
    pub fn release_entry(&self, key: &[u8]) {
        let now = self.event_loop.now().into_std();
        let handover = {
            let mut state = self.state.borrow_mut();
            state.cache.release_entry(key, now);
            let waiter = state.waiters.get_mut(key).and_then(VecDeque::pop_front);
            match waiter {
                Some(waiter) => match state.cache.request_entry_now(key) {
                    Some(object) => Some((waiter, object)),
                    None => {
                        if let Some(queue) = state.waiters.get_mut(key) {
                            queue.push_front(waiter);
                        }
                        None
                    }
                },
                None => None,
            }
        };
        if let Some((waiter, object)) = handover {
            self.event_loop.post(move || waiter(Some(object)));
        }
        self.rearm();
    }

    pub fn remove_entry(&self, key: &[u8]) -> bool {
        let (removed, waiters) = {
            let mut state = self.state.borrow_mut();
            let removed = state.cache.remove_entry(key);
            (removed, state.waiters.remove(key).unwrap_or_default())
        };
        self.fail_waiters(waiters);
        self.rearm();
        removed
    }

    /// Dispose everything and stop the sweep timer.
    pub fn clear(&self) {
        let (timer, waiters) = {
            let mut state = self.state.borrow_mut();
            state.cache.clear();
            let waiters: VecDeque<_> = state.waiters.drain().flat_map(|(_, q)| q).collect();
            (state.timer.take(), waiters)
        };
        if let Some(timer) = timer {
            self.event_loop.cancel(timer);
        }
        self.fail_waiters(waiters);
    }

    fn fail_waiters(&self, waiters: VecDeque<Waiter<T>>) {
        for waiter in waiters {
            self.event_loop.post(move || waiter(None));
        }
    }

    fn rearm(&self) {
        rearm(&self.state, &self.event_loop);
    }
}

fn rearm<T: Cacheable + Clone + 'static>(state: &Rc<RefCell<State<T>>>, event_loop: &EventLoop) {
    let mut guard = state.borrow_mut();
    let wanted = guard
        .cache
        .next_deadline()
        .map(|d| Instant::from_std(d) + guard.slack);
    if guard.timer.map(|t| t.deadline()) == wanted {
        return;
    }
    if let Some(timer) = guard.timer.take() {
        event_loop.cancel(timer);
    }
    if let Some(deadline) = wanted {
        let weak = Rc::downgrade(state);
        let ev = event_loop.clone();
        guard.timer = Some(event_loop.post_at(deadline, move || sweep(weak, ev)));
    }
}

fn sweep<T: Cacheable + Clone + 'static>(state: Weak<RefCell<State<T>>>, event_loop: EventLoop) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let waiters: Vec<Waiter<T>> = {
        let mut guard = state.borrow_mut();
        guard.timer = None;
        let evicted = guard.cache.sweep(event_loop.now().into_std());
        debug!(count = evicted.len(), "connection cache swept");
        evicted
            .iter()
            .filter_map(|key| guard.waiters.remove(key))
            .flatten()
            .collect()
    };
    for waiter in waiters {
        event_loop.post(move || waiter(None));
    }
    rearm(&state, &event_loop);
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[derive(Clone)]
    struct Conn {
        shareable: bool,
        disposed: Rc<Cell<u32>>,
    }

    impl Cacheable for Conn {
        fn is_shareable(&self) -> bool {
            self.shareable
        }

        fn dispose(&self) {
            self.disposed.set(self.disposed.get() + 1);
        }
    }

    fn conn(shareable: bool) -> (Conn, Rc<Cell<u32>>) {
        let disposed = Rc::new(Cell::new(0));
        (
            Conn {
                shareable,
                disposed: disposed.clone(),
            },
            disposed,
        )
    }

    fn cache(ev: &EventLoop) -> AccessCache<Conn> {
        AccessCache::new(ev, Duration::from_secs(120), Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entry_expires_after_ttl() {
        let ev = EventLoop::new();
        let cache = cache(&ev);
        let (c, disposed) = conn(true);
        cache.add_entry("k", c, Some(Duration::from_secs(60)));
        cache.release_entry(b"k");

        tokio::time::advance(Duration::from_secs(59)).await;
        ev.run_until_idle();
        assert!(cache.has_entry(b"k"));

        tokio::time::advance(Duration::from_secs(2)).await;
        ev.run_until_idle();
        assert!(!cache.has_entry(b"k"));
        assert_eq!(disposed.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_cancels_expiry() {
        let ev = EventLoop::new();
        let cache = cache(&ev);
        let (c, _) = conn(false);
        cache.add_entry("k", c, None);
        cache.release_entry(b"k");
        assert!(cache.request_entry_now(b"k").is_some());
        tokio::time::advance(Duration::from_secs(300)).await;
        ev.run_until_idle();
        assert_eq!(cache.use_count(b"k"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_entry_is_handed_over() {
        let ev = EventLoop::new();
        let cache = cache(&ev);
        let (c, _) = conn(false);
        cache.add_entry("k", c, None);

        let got = Rc::new(Cell::new(false));
        let g = got.clone();
        let outcome = cache.request_entry(b"k", move |obj| g.set(obj.is_some()));
        assert!(matches!(outcome, RequestOutcome::Queued));

        cache.release_entry(b"k");
        assert!(!got.get());
        ev.run_until_idle();
        assert!(got.get());
        assert_eq!(cache.use_count(b"k"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_fails_waiters() {
        let ev = EventLoop::new();
        let cache = cache(&ev);
        let (c, disposed) = conn(false);
        cache.add_entry("k", c, None);

        let result = Rc::new(Cell::new(None));
        let r = result.clone();
        cache.request_entry(b"k", move |obj| r.set(Some(obj.is_some())));
        assert!(cache.remove_entry(b"k"));
        ev.run_until_idle();
        assert_eq!(result.get(), Some(false));
        assert_eq!(disposed.get(), 1);
        assert!(matches!(
            cache.request_entry(b"k", |_| {}),
            RequestOutcome::Missing
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_stops_timer() {
        let ev = EventLoop::new();
        let cache = cache(&ev);
        let (c, disposed) = conn(true);
        cache.add_entry("k", c, None);
        cache.release_entry(b"k");
        assert!(ev.next_timer_deadline().is_some());
        cache.clear();
        assert!(ev.next_timer_deadline().is_none());
        assert_eq!(disposed.get(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pooled_downcast() {
        let (c, _) = conn(true);
        let pooled: PooledObject = Rc::new(c);
        assert!(pooled.downcast_ref::<Conn>().is_some());
        assert!(pooled.is_shareable());
    }
}
