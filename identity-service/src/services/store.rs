//! Generic key-object store used for configs, users and cache records.
//!
//! Every write bumps a per-key version; writers may pass the version they
//! last read to get compare-and-swap semantics.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::services::error::{IdentityError, IdentityResult};

#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

#[async_trait]
pub trait ObjectStore<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> IdentityResult<Option<Versioned<T>>>;

    async fn list(&self) -> IdentityResult<Vec<(String, Versioned<T>)>>;

    /// Store `value` under `key` and return the new version.
    ///
    /// With `expected_version = Some(v)` the write only succeeds if the
    /// current version is `v`; `Some(0)` means the key must not exist yet.
    async fn put(&self, key: &str, value: T, expected_version: Option<u64>) -> IdentityResult<u64>;

    /// Remove `key`, returning the removed value if any.
    async fn delete(&self, key: &str) -> IdentityResult<Option<T>>;
}

/// In-process store backed by a sharded map.
pub struct MemoryStore<T> {
    entries: DashMap<String, Versioned<T>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> ObjectStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> IdentityResult<Option<Versioned<T>>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn list(&self) -> IdentityResult<Vec<(String, Versioned<T>)>> {
        let mut items: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items)
    }

    async fn put(&self, key: &str, value: T, expected_version: Option<u64>) -> IdentityResult<u64> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().version;
                if let Some(expected) = expected_version {
                    if expected != current {
                        return Err(IdentityError::Conflict(format!(
                            "{} was modified: expected version {}, found {}",
                            key, expected, current
                        )));
                    }
                }
                let version = current + 1;
                occupied.insert(Versioned { value, version });
                Ok(version)
            }
            Entry::Vacant(vacant) => {
                if let Some(expected) = expected_version.filter(|v| *v != 0) {
                    return Err(IdentityError::Conflict(format!(
                        "{} does not exist: expected version {}",
                        key, expected
                    )));
                }
                vacant.insert(Versioned { value, version: 1 });
                Ok(1)
            }
        }
    }

    async fn delete(&self, key: &str) -> IdentityResult<Option<T>> {
        Ok(self.entries.remove(key).map(|(_, entry)| entry.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_bumps_version() {
        let store = MemoryStore::new();
        assert_eq!(store.put("a", 1u32, None).await.unwrap(), 1);
        assert_eq!(store.put("a", 2u32, None).await.unwrap(), 2);
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored, Versioned { value: 2, version: 2 });
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        assert_eq!(store.put("a", "x".to_string(), Some(0)).await.unwrap(), 1);
        assert!(matches!(
            store.put("a", "y".to_string(), Some(0)).await,
            Err(IdentityError::Conflict(_))
        ));
        assert!(matches!(
            store.put("a", "y".to_string(), Some(7)).await,
            Err(IdentityError::Conflict(_))
        ));
        assert_eq!(store.put("a", "y".to_string(), Some(1)).await.unwrap(), 2);
        assert!(matches!(
            store.put("missing", "z".to_string(), Some(3)).await,
            Err(IdentityError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let store = MemoryStore::new();
        store.put("b", 2u8, None).await.unwrap();
        store.put("a", 1u8, None).await.unwrap();
        let keys: Vec<_> = store.list().await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);

        assert_eq!(store.delete("a").await.unwrap(), Some(1));
        assert_eq!(store.delete("a").await.unwrap(), None);
    }
}
