use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

/// Result of a keyed lookup-or-insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyed {
    Found(Ulid),
    Created(Ulid),
}

impl Keyed {
    pub fn id(&self) -> Ulid {
        match self {
            Keyed::Found(id) | Keyed::Created(id) => *id,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Keyed::Created(_))
    }
}

/// Index from a stable external key (mailbox address, email, calendar UID,
/// identity-provider tenant id) to a local record id, with per-key
/// serialization for find-or-create.
///
/// The index itself is maintained by event application, so replay rebuilds
/// it; this type only provides lookup and the per-key critical section.
#[derive(Default)]
pub(crate) struct KeyIndex {
    ids: DashMap<String, Ulid>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyIndex {
    pub fn get(&self, key: &str) -> Option<Ulid> {
        self.ids.get(key).map(|e| *e.value())
    }

    pub fn insert(&self, key: String, id: Ulid) {
        self.ids.insert(key, id);
    }

    /// Drop `key` only if it still points at `id`.
    pub fn remove_if(&self, key: &str, id: Ulid) {
        self.ids.remove_if(key, |_, v| *v == id);
    }

    /// Exclusive section for `key`. Held across the check and the write.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Return the indexed record for `key`, or run `resolve` while holding the
    /// key's lock. `resolve` may match an existing record by other means
    /// (returning `Found`) or create one (returning `Created`); either way two
    /// concurrent callers for the same key never both create.
    pub async fn find_or_create<E, F, Fut>(&self, key: &str, resolve: F) -> Result<Keyed, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Keyed, E>>,
    {
        if let Some(id) = self.get(key) {
            return Ok(Keyed::Found(id));
        }
        let _guard = self.lock(key).await;
        if let Some(id) = self.get(key) {
            return Ok(Keyed::Found(id));
        }
        resolve().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_callers_create_once() {
        let index = Arc::new(KeyIndex::default());
        let creations = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let index = index.clone();
                let creations = creations.clone();
                tokio::spawn(async move {
                    let idx = index.clone();
                    index
                        .find_or_create::<(), _, _>("room@contoso.com", || async move {
                            creations.fetch_add(1, Ordering::SeqCst);
                            tokio::task::yield_now().await;
                            let id = Ulid::new();
                            idx.insert("room@contoso.com".into(), id);
                            Ok(Keyed::Created(id))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let ids: std::collections::HashSet<Ulid> =
            results.into_iter().map(|r| r.unwrap().id()).collect();
        assert_eq!(creations.load(Ordering::SeqCst), 1);
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn remove_if_checks_owner() {
        let index = KeyIndex::default();
        let a = Ulid::new();
        index.insert("k".into(), a);
        index.remove_if("k", Ulid::new());
        assert_eq!(index.get("k"), Some(a));
        index.remove_if("k", a);
        assert_eq!(index.get("k"), None);
    }
}
