use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::data::{CredentialKey, Credentials};

/// Credentials remembered per protection space.
///
/// Clones share the same storage, so one cache can serve several
/// managers, including ones on other threads.
#[derive(Debug, Clone, Default)]
pub struct CredentialCache {
    entries: Arc<Mutex<HashMap<CredentialKey, Credentials>>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CredentialKey) -> Option<Credentials> {
        self.lock().get(key).cloned()
    }

    pub fn insert(&self, key: CredentialKey, credentials: Credentials) {
        self.lock().insert(key, credentials);
    }

    pub fn remove(&self, key: &CredentialKey) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CredentialKey, Credentials>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::data::AuthChallenge;

    fn key(realm: &str) -> CredentialKey {
        CredentialKey::for_challenge(&AuthChallenge {
            url: Url::parse("https://example.com/private").unwrap(),
            realm: realm.to_owned(),
            proxy: false,
        })
    }

    #[test]
    fn test_shared_between_clones_and_threads() {
        let cache = CredentialCache::new();
        let other = cache.clone();
        std::thread::spawn(move || other.insert(key("r"), Credentials::new("u", "p")))
            .join()
            .unwrap();
        assert_eq!(cache.get(&key("r")), Some(Credentials::new("u", "p")));
        assert_eq!(cache.get(&key("other")), None);
        assert!(cache.remove(&key("r")));
        assert!(cache.is_empty());
    }
}
