//! Process-wide list of backend factories.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use tracing::{debug, trace};

use super::backend::{Backend, BackendFactory};
use crate::data::{Operation, Request};

/// Ordered factory list. When several factories accept the same request,
/// the one registered first wins.
#[derive(Default)]
pub struct BackendRegistry {
    factories: Mutex<Vec<Arc<dyn BackendFactory>>>,
    shut_down: AtomicBool,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, factory: Arc<dyn BackendFactory>) {
        if self.shut_down.load(Ordering::Acquire) {
            debug!("registry shut down, factory ignored");
            return;
        }
        trace!(schemes = ?factory.supported_schemes(), "backend factory registered");
        self.lock().push(factory);
    }

    /// Returns `false` when the factory was not registered.
    pub fn unregister(&self, factory: &Arc<dyn BackendFactory>) -> bool {
        let mut factories = self.lock();
        let before = factories.len();
        factories.retain(|f| !Arc::ptr_eq(f, factory));
        before != factories.len()
    }

    /// Ask each factory in registration order until one returns a backend.
    pub fn find_backend(&self, operation: Operation, request: &Request) -> Option<Box<dyn Backend>> {
        if self.shut_down.load(Ordering::Acquire) {
            return None;
        }
        let factories = self.lock().clone();
        factories
            .iter()
            .find_map(|factory| factory.create(operation, request))
    }

    /// Every scheme some factory accepts, plus the ones the manager
    /// serves itself.
    pub fn supported_schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self
            .lock()
            .iter()
            .flat_map(|f| f.supported_schemes())
            .collect();
        schemes.push("data".to_owned());
        #[cfg(feature = "reqwest")]
        schemes.extend(["http".to_owned(), "https".to_owned()]);
        schemes.sort();
        schemes.dedup();
        schemes
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every factory; later lookups find nothing.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn BackendFactory>>> {
        self.factories.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

static GLOBAL: Lazy<Arc<BackendRegistry>> = Lazy::new(|| {
    let registry = BackendRegistry::new();
    register_builtin_backends(&registry);
    Arc::new(registry)
});

/// The registry managers use unless given their own.
pub fn global() -> Arc<BackendRegistry> {
    GLOBAL.clone()
}

/// Register the backends shipped with this crate.
pub fn register_builtin_backends(registry: &BackendRegistry) {
    registry.register(Arc::new(super::backends::FileBackendFactory));
    #[cfg(feature = "reqwest")]
    registry.register(Arc::new(super::backends::HttpBackendFactory));
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::effects::backend::Capabilities;
    use crate::effects::backend::IoFeatures;
    use crate::effects::reply::BackendContext;

    struct Tagged(&'static str);

    impl Backend for Tagged {
        fn capabilities(&self) -> Capabilities {
            Capabilities::local(IoFeatures::NONE)
        }

        fn open(&mut self, _ctx: BackendContext) {}

        fn close(&mut self) {}

        fn bytes_available(&self) -> u64 {
            self.0.len() as u64
        }
    }

    struct Factory {
        tag: &'static str,
        schemes: &'static [&'static str],
    }

    impl BackendFactory for Factory {
        fn supported_schemes(&self) -> Vec<String> {
            self.schemes.iter().map(|s| s.to_string()).collect()
        }

        fn create(&self, _operation: Operation, request: &Request) -> Option<Box<dyn Backend>> {
            self.schemes
                .contains(&request.url().scheme())
                .then(|| Box::new(Tagged(self.tag)) as Box<dyn Backend>)
        }
    }

    fn request(url: &str) -> Request {
        Request::new(Url::parse(url).unwrap())
    }

    fn tag_of(backend: Option<Box<dyn Backend>>) -> Option<u64> {
        backend.map(|b| b.bytes_available())
    }

    #[test]
    fn test_first_registration_wins() {
        let registry = BackendRegistry::new();
        registry.register(Arc::new(Factory {
            tag: "a",
            schemes: &["ftp"],
        }));
        registry.register(Arc::new(Factory {
            tag: "bb",
            schemes: &["ftp", "file"],
        }));

        let ftp = registry.find_backend(Operation::Get, &request("ftp://h/x"));
        assert_eq!(tag_of(ftp), Some(1));
        let file = registry.find_backend(Operation::Get, &request("file:///x"));
        assert_eq!(tag_of(file), Some(2));
        assert!(
            registry
                .find_backend(Operation::Get, &request("gopher://h/"))
                .is_none()
        );
    }

    #[test]
    fn test_unregister_and_shutdown() {
        let registry = BackendRegistry::new();
        let first: Arc<dyn BackendFactory> = Arc::new(Factory {
            tag: "a",
            schemes: &["ftp"],
        });
        let second: Arc<dyn BackendFactory> = Arc::new(Factory {
            tag: "bb",
            schemes: &["ftp"],
        });
        registry.register(first.clone());
        registry.register(second.clone());
        assert!(registry.unregister(&first));
        assert!(!registry.unregister(&first));
        let ftp = registry.find_backend(Operation::Get, &request("ftp://h/x"));
        assert_eq!(tag_of(ftp), Some(2));

        registry.shutdown();
        assert!(registry.is_empty());
        assert!(
            registry
                .find_backend(Operation::Get, &request("ftp://h/x"))
                .is_none()
        );
        registry.register(first);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_supported_schemes_are_deduplicated() {
        let registry = BackendRegistry::new();
        registry.register(Arc::new(Factory {
            tag: "a",
            schemes: &["ftp", "data"],
        }));
        let schemes = registry.supported_schemes();
        assert_eq!(schemes.iter().filter(|s| *s == "data").count(), 1);
        assert!(schemes.contains(&"ftp".to_owned()));
    }
}
