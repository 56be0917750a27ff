//! Optimistic list reconciler
//!
//! A user-visible list that shows a placeholder immediately, then swaps in
//! the canonical record when the backing save succeeds, or removes the
//! placeholder when it fails. Placeholders are prepended; a commit replaces
//! in place, so the list never reorders.

use parking_lot::Mutex;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use ulid::Ulid;

/// Identity of a placeholder awaiting its save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempId(Ulid);

impl TempId {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tmp-{}", self.0)
    }
}

#[derive(Debug, Clone)]
enum Entry<T> {
    Pending(TempId, T),
    Committed(T),
}

impl<T> Entry<T> {
    fn value(&self) -> &T {
        match self {
            Self::Pending(_, v) | Self::Committed(v) => v,
        }
    }

    fn is_temp(&self, id: TempId) -> bool {
        matches!(self, Self::Pending(t, _) if *t == id)
    }
}

/// List with optimistic inserts
#[derive(Debug)]
pub struct OptimisticList<T> {
    entries: Arc<Mutex<Vec<Entry<T>>>>,
}

impl<T> Clone for OptimisticList<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> Default for OptimisticList<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> OptimisticList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from already-canonical records
    #[must_use]
    pub fn from_committed(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(items.into_iter().map(Entry::Committed).collect())),
        }
    }

    /// Show `placeholder` at the head of the list
    pub fn apply_optimistic(&self, placeholder: T) -> TempId {
        let id = TempId::new();
        self.entries.lock().insert(0, Entry::Pending(id, placeholder));
        id
    }

    /// Replace the placeholder with the canonical record, in place
    ///
    /// Returns false if the placeholder is no longer present.
    pub fn commit(&self, id: TempId, canonical: T) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.is_temp(id)) {
            Some(entry) => {
                *entry = Entry::Committed(canonical);
                true
            }
            None => false,
        }
    }

    /// Remove the placeholder
    pub fn rollback(&self, id: TempId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| !e.is_temp(id));
        entries.len() != before
    }

    /// Whether the placeholder is still waiting on its save
    #[must_use]
    pub fn is_pending(&self, id: TempId) -> bool {
        self.entries.lock().iter().any(|e| e.is_temp(id))
    }

    /// Current view, head first
    #[must_use]
    pub fn visible(&self) -> Vec<T> {
        self.entries.lock().iter().map(|e| e.value().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T: Clone + Send + 'static> OptimisticList<T> {
    /// Show `placeholder` now and run `save` in the background
    ///
    /// On success the placeholder becomes the saved record; on failure it is
    /// removed and the error is logged.
    pub fn spawn_save<F, Fut, E>(&self, placeholder: T, save: F) -> (TempId, JoinHandle<bool>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let id = self.apply_optimistic(placeholder);
        let list = self.clone();
        let handle = tokio::spawn(async move {
            match save().await {
                Ok(canonical) => list.commit(id, canonical),
                Err(e) => {
                    tracing::warn!(temp_id = %id, error = %e, "save failed, rolling back");
                    list.rollback(id);
                    false
                }
            }
        });
        (id, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn commit_replaces_in_place() {
        let list = OptimisticList::from_committed(["b".to_string(), "c".to_string()]);
        let id = list.apply_optimistic("draft".to_string());
        let newer = list.apply_optimistic("draft-2".to_string());

        assert!(list.commit(id, "a".to_string()));
        assert_eq!(list.visible(), vec!["draft-2", "a", "b", "c"]);
        assert!(!list.is_pending(id));
        assert!(list.is_pending(newer));
    }

    #[test]
    fn rollback_removes_only_the_placeholder() {
        let list = OptimisticList::from_committed([1, 2]);
        let id = list.apply_optimistic(0);
        assert!(list.rollback(id));
        assert!(!list.rollback(id));
        assert!(!list.commit(id, 9));
        assert_eq!(list.visible(), vec![1, 2]);
    }

    #[tokio::test]
    async fn spawn_save_commits_or_rolls_back() {
        let list = OptimisticList::<String>::new();

        let (ok, handle) = list.spawn_save("saving".into(), || async {
            Ok::<_, String>("saved".to_string())
        });
        assert!(handle.await.unwrap());
        assert!(!list.is_pending(ok));

        let (_, handle) = list.spawn_save("doomed".into(), || async {
            Err::<String, _>("backend down".to_string())
        });
        assert!(!handle.await.unwrap());
        assert_eq!(list.visible(), vec!["saved"]);
    }
}
