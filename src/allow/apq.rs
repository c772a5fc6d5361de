//! Automatic persisted queries: a bounded hash → query cache.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::Mutex;

use crate::parser::ast::OpKind;

const APQ_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ApqEntry {
    pub op: OpKind,
    pub name: String,
    /// Empty for allow-list seeds; the engine then resolves the query by name.
    pub query: String,
}

/// Last-writer-wins, LRU-bounded. Lock contention is negligible next to the
/// database round trip each hit saves.
pub struct ApqCache {
    inner: Mutex<LruCache<String, ApqEntry>>,
}

impl ApqCache {
    pub fn new() -> ApqCache {
        ApqCache {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(APQ_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    pub async fn get(&self, key: &str) -> Option<ApqEntry> {
        self.inner.lock().await.get(key).cloned()
    }

    pub async fn set(&self, key: &str, entry: ApqEntry) {
        self.inner.lock().await.put(key.to_string(), entry);
    }
}

impl Default for ApqCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let cache = ApqCache::new();
        assert!(cache.get("h1").await.is_none());
        cache
            .set(
                "h1",
                ApqEntry {
                    op: OpKind::Query,
                    name: "getUsers".into(),
                    query: "{ users { id } }".into(),
                },
            )
            .await;
        let hit = cache.get("h1").await.unwrap();
        assert_eq!(hit.name, "getUsers");
    }
}
