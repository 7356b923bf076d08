use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::arena::{SlotArena, SlotId};
use crate::Cacheable;

/// Default time an idle entry stays cached.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

#[derive(Debug)]
struct Node<T> {
    key: Bytes,
    object: T,
    ttl: Duration,
    deadline: Option<Instant>,
    use_count: usize,
    prev: Option<SlotId>,
    next: Option<SlotId>,
    linked: bool,
}

/// Keyed pool of long-lived objects with deadline-based eviction.
///
/// Entries handed out are reference counted. An entry sits in the expiry
/// list exactly when nobody holds it and its object expires; the list is
/// kept sorted by deadline so [`sweep`](ExpiryCache::sweep) only ever
/// looks at its head. Time is passed in by the caller, which owns the
/// timer that calls `sweep`.
#[derive(Debug)]
pub struct ExpiryCache<T> {
    nodes: SlotArena<Node<T>>,
    index: HashMap<Bytes, SlotId>,
    first: Option<SlotId>,
    last: Option<SlotId>,
    default_ttl: Duration,
}

impl<T: Cacheable + Clone> Default for ExpiryCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl<T: Cacheable + Clone> ExpiryCache<T> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            nodes: SlotArena::new(),
            index: HashMap::new(),
            first: None,
            last: None,
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 0
    }

    pub fn has_entry(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    pub fn use_count(&self, key: &[u8]) -> Option<usize> {
        self.node(key).map(|n| n.use_count)
    }

    /// Whether the entry is currently waiting in the expiry list.
    pub fn is_expiring(&self, key: &[u8]) -> bool {
        self.node(key).is_some_and(|n| n.linked)
    }

    /// Deadline of the entry that expires first.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.first
            .and_then(|id| self.nodes.get(id))
            .and_then(|n| n.deadline)
    }

    /// Keys in the expiry list, soonest first.
    pub fn expiring_keys(&self) -> Vec<Bytes> {
        let mut keys = Vec::new();
        let mut cursor = self.first;
        while let Some(node) = cursor.and_then(|id| self.nodes.get(id)) {
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }

    /// Insert an object the caller already holds (use count 1).
    ///
    /// A live entry under the same key is disposed first. `ttl` overrides
    /// the default lifetime once the entry becomes idle.
    pub fn add_entry(&mut self, key: impl Into<Bytes>, object: T, ttl: Option<Duration>) {
        let key = key.into();
        if self.index.contains_key(&key) {
            warn!(key = ?key, "replacing live cache entry");
            self.remove_entry(&key);
        }
        let id = self.nodes.insert(Node {
            key: key.clone(),
            object,
            ttl: ttl.unwrap_or(self.default_ttl),
            deadline: None,
            use_count: 1,
            prev: None,
            next: None,
            linked: false,
        });
        trace!(key = ?key, "cache entry added");
        self.index.insert(key, id);
    }

    /// Hand out the object if it is idle, or shared and shareable.
    ///
    /// Returns `None` for unknown keys and for busy exclusive entries.
    pub fn request_entry_now(&mut self, key: &[u8]) -> Option<T> {
        let id = *self.index.get(key)?;
        let node = self.nodes.get(id)?;
        if node.use_count > 0 && !node.object.is_shareable() {
            trace!(key = ?node.key, "cache entry busy");
            return None;
        }
        if node.linked {
            self.unlink(id);
        }
        let node = self.nodes.get_mut(id)?;
        node.use_count += 1;
        node.deadline = None;
        Some(node.object.clone())
    }

    /// Drop one reference; an idle expiring entry is scheduled at `now + ttl`.
    pub fn release_entry(&mut self, key: &[u8], now: Instant) {
        let Some(&id) = self.index.get(key) else {
            warn!(key = ?Bytes::copy_from_slice(key), "release of unknown cache entry");
            return;
        };
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if node.use_count == 0 {
            warn!(key = ?node.key, "release of idle cache entry");
            return;
        }
        node.use_count -= 1;
        if node.use_count == 0 && node.object.expires() {
            node.deadline = Some(now + node.ttl);
            self.link(id);
        }
    }

    /// Evict regardless of use count, disposing the object.
    pub fn remove_entry(&mut self, key: &[u8]) -> bool {
        let Some(id) = self.index.remove(key) else {
            warn!(key = ?Bytes::copy_from_slice(key), "removal of unknown cache entry");
            return false;
        };
        if self.nodes.get(id).is_some_and(|n| n.linked) {
            self.unlink(id);
        }
        if let Some(node) = self.nodes.remove(id) {
            if node.use_count > 1 {
                warn!(key = ?node.key, uses = node.use_count, "removing shared cache entry");
            }
            node.object.dispose();
        }
        true
    }

    /// Evict every idle entry whose deadline is at or before `now`.
    ///
    /// Returns the evicted keys in deadline order.
    pub fn sweep(&mut self, now: Instant) -> Vec<Bytes> {
        let mut evicted = Vec::new();
        while let Some(id) = self.first {
            let Some(node) = self.nodes.get(id) else {
                break;
            };
            if node.deadline.is_some_and(|d| d > now) {
                break;
            }
            self.unlink(id);
            if let Some(node) = self.nodes.remove(id) {
                self.index.remove(&node.key);
                node.object.dispose();
                evicted.push(node.key);
            }
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "expired cache entries evicted");
        }
        evicted
    }

    /// Dispose every entry unconditionally.
    pub fn clear(&mut self) {
        for node in self.nodes.drain() {
            node.object.dispose();
        }
        self.index.clear();
        self.first = None;
        self.last = None;
    }

    /// Panics when the list or the index disagree with the nodes.
    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        assert_eq!(self.index.len(), self.nodes.len(), "index and arena differ");

        let mut linked = 0;
        let mut prev: Option<SlotId> = None;
        let mut prev_deadline: Option<Instant> = None;
        let mut cursor = self.first;
        while let Some(id) = cursor {
            let node = self.nodes.get(id).expect("dangling list link");
            assert!(node.linked, "unflagged node in expiry list");
            assert_eq!(node.prev, prev, "broken back link");
            assert_eq!(node.use_count, 0, "held entry in expiry list");
            let deadline = node.deadline.expect("linked node without deadline");
            if let Some(p) = prev_deadline {
                assert!(p <= deadline, "expiry list out of order");
            }
            prev_deadline = Some(deadline);
            prev = Some(id);
            cursor = node.next;
            linked += 1;
        }
        assert_eq!(self.last, prev, "tail pointer mismatch");

        let mut expected = 0;
        for (key, &id) in &self.index {
            let node = self.nodes.get(id).expect("index points at empty slot");
            assert_eq!(&node.key, key);
            let should_link = node.use_count == 0 && node.object.expires();
            assert_eq!(node.linked, should_link, "list membership invariant");
            if should_link {
                expected += 1;
            }
        }
        assert_eq!(linked, expected);
    }

    fn node(&self, key: &[u8]) -> Option<&Node<T>> {
        self.index.get(key).and_then(|&id| self.nodes.get(id))
    }

    /// Thread a node into the list, scanning back from the tail so equal
    /// deadlines keep arrival order.
    fn link(&mut self, id: SlotId) {
        let Some(deadline) = self.nodes.get(id).and_then(|n| n.deadline) else {
            return;
        };
        let mut after = self.last;
        while let Some(candidate) = after {
            let Some(node) = self.nodes.get(candidate) else {
                break;
            };
            if node.deadline.is_some_and(|d| d <= deadline) {
                break;
            }
            after = node.prev;
        }

        let before = match after {
            Some(a) => self.nodes.get(a).and_then(|n| n.next),
            None => self.first,
        };
        if let Some(node) = self.nodes.get_mut(id) {
            node.prev = after;
            node.next = before;
            node.linked = true;
        }
        match after {
            Some(a) => {
                if let Some(n) = self.nodes.get_mut(a) {
                    n.next = Some(id);
                }
            }
            None => self.first = Some(id),
        }
        match before {
            Some(b) => {
                if let Some(n) = self.nodes.get_mut(b) {
                    n.prev = Some(id);
                }
            }
            None => self.last = Some(id),
        }
    }

    fn unlink(&mut self, id: SlotId) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let (prev, next) = (node.prev.take(), node.next.take());
        node.linked = false;
        match prev {
            Some(p) => {
                if let Some(n) = self.nodes.get_mut(p) {
                    n.next = next;
                }
            }
            None => self.first = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes.get_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.last = prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    #[derive(Debug, Clone)]
    struct Conn {
        shareable: bool,
        expires: bool,
        disposed: Rc<Cell<u32>>,
    }

    impl Conn {
        fn new(shareable: bool) -> Self {
            Self {
                shareable,
                expires: true,
                disposed: Rc::new(Cell::new(0)),
            }
        }
    }

    impl Cacheable for Conn {
        fn is_shareable(&self) -> bool {
            self.shareable
        }

        fn expires(&self) -> bool {
            self.expires
        }

        fn dispose(&self) {
            self.disposed.set(self.disposed.get() + 1);
        }
    }

    #[test]
    fn test_shareable_hit_and_release_schedules_expiry() {
        let now = Instant::now();
        let mut cache = ExpiryCache::default();
        cache.add_entry("k", Conn::new(true), Some(Duration::from_secs(60)));
        assert_eq!(cache.use_count(b"k"), Some(1));

        assert!(cache.request_entry_now(b"k").is_some());
        assert_eq!(cache.use_count(b"k"), Some(2));

        cache.release_entry(b"k", now);
        assert!(!cache.is_expiring(b"k"));
        cache.release_entry(b"k", now);
        assert_eq!(cache.use_count(b"k"), Some(0));
        assert!(cache.is_expiring(b"k"));
        assert_eq!(cache.next_deadline(), Some(now + Duration::from_secs(60)));
        cache.debug_validate_invariants();
    }

    #[test]
    fn test_exclusive_entry_busy() {
        let mut cache = ExpiryCache::default();
        cache.add_entry("k", Conn::new(false), None);
        assert!(cache.request_entry_now(b"k").is_none());
        assert_eq!(cache.use_count(b"k"), Some(1));
    }

    #[test]
    fn test_idle_entry_is_taken_off_the_list() {
        let now = Instant::now();
        let mut cache = ExpiryCache::default();
        cache.add_entry("k", Conn::new(false), None);
        cache.release_entry(b"k", now);
        assert_eq!(cache.next_deadline(), Some(now + DEFAULT_TTL));

        assert!(cache.request_entry_now(b"k").is_some());
        assert!(!cache.is_expiring(b"k"));
        assert_eq!(cache.next_deadline(), None);
        cache.debug_validate_invariants();
    }

    #[test]
    fn test_unknown_keys_are_not_fatal() {
        let mut cache: ExpiryCache<Conn> = ExpiryCache::default();
        assert!(cache.request_entry_now(b"missing").is_none());
        cache.release_entry(b"missing", Instant::now());
        assert!(!cache.remove_entry(b"missing"));
    }

    #[test]
    fn test_double_release_does_not_underflow() {
        let now = Instant::now();
        let mut cache = ExpiryCache::default();
        cache.add_entry("k", Conn::new(true), None);
        cache.release_entry(b"k", now);
        cache.release_entry(b"k", now);
        assert_eq!(cache.use_count(b"k"), Some(0));
        cache.debug_validate_invariants();
    }

    #[test]
    fn test_replacing_entry_disposes_old_object() {
        let mut cache = ExpiryCache::default();
        let old = Conn::new(true);
        let counter = old.disposed.clone();
        cache.add_entry("k", old, None);
        cache.add_entry("k", Conn::new(true), None);
        assert_eq!(counter.get(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_shorter_ttl_threads_before_longer() {
        let now = Instant::now();
        let mut cache = ExpiryCache::default();
        cache.add_entry("long", Conn::new(true), Some(Duration::from_secs(100)));
        cache.add_entry("short", Conn::new(true), Some(Duration::from_secs(5)));
        cache.add_entry("tie", Conn::new(true), Some(Duration::from_secs(100)));
        cache.release_entry(b"long", now);
        cache.release_entry(b"short", now);
        cache.release_entry(b"tie", now);
        assert_eq!(
            cache.expiring_keys(),
            vec![
                Bytes::from_static(b"short"),
                Bytes::from_static(b"long"),
                Bytes::from_static(b"tie")
            ]
        );
        cache.debug_validate_invariants();

        let evicted = cache.sweep(now + Duration::from_secs(10));
        assert_eq!(evicted, vec![Bytes::from_static(b"short")]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_non_expiring_entry_stays() {
        let now = Instant::now();
        let mut cache = ExpiryCache::default();
        let mut conn = Conn::new(true);
        conn.expires = false;
        cache.add_entry("pinned", conn, Some(Duration::ZERO));
        cache.release_entry(b"pinned", now);
        assert!(!cache.is_expiring(b"pinned"));
        assert!(cache.sweep(now + Duration::from_secs(1000)).is_empty());
        assert!(cache.has_entry(b"pinned"));
        cache.debug_validate_invariants();
    }

    #[test]
    fn test_remove_and_clear_dispose() {
        let now = Instant::now();
        let mut cache = ExpiryCache::default();
        let a = Conn::new(true);
        let b = Conn::new(false);
        let (ca, cb) = (a.disposed.clone(), b.disposed.clone());
        cache.add_entry("a", a, None);
        cache.add_entry("b", b, None);
        cache.release_entry(b"a", now);

        assert!(cache.remove_entry(b"a"));
        assert_eq!(ca.get(), 1);
        cache.clear();
        assert_eq!(cb.get(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.next_deadline(), None);
    }
}
