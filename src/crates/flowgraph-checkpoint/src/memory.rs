//! In-memory checkpoint store for development and testing
//!
//! [`InMemoryCheckPointStore`] keeps every blob in an `Arc<RwLock<HashMap>>`.
//! Clones share the same map, so a store handed to a compiled graph can still
//! be inspected by the test that created it.
//!
//! ```rust
//! use flowgraph_checkpoint::{CheckPointStore, InMemoryCheckPointStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> flowgraph_checkpoint::Result<()> {
//! let store = InMemoryCheckPointStore::new();
//! store.set("run-1", b"payload".to_vec()).await?;
//!
//! assert_eq!(store.get("run-1").await?, Some(b"payload".to_vec()));
//! assert_eq!(store.get("run-2").await?, None);
//! # Ok(())
//! # }
//! ```
//!
//! Data is lost when the process exits.

use crate::error::Result;
use crate::store::CheckPointStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type BlobStorage = Arc<RwLock<HashMap<String, Vec<u8>>>>;

/// Thread-safe in-memory [`CheckPointStore`]
#[derive(Debug, Clone)]
pub struct InMemoryCheckPointStore {
    storage: BlobStorage,
}

impl InMemoryCheckPointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of stored checkpoints
    pub async fn len(&self) -> usize {
        self.storage.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.storage.read().await.is_empty()
    }

    /// Stored ids, sorted
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.storage.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove one checkpoint, returning whether it existed
    pub async fn remove(&self, id: &str) -> bool {
        self.storage.write().await.remove(id).is_some()
    }

    /// Remove everything (test isolation)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

impl Default for InMemoryCheckPointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckPointStore for InMemoryCheckPointStore {
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.storage.read().await.get(id).cloned())
    }

    async fn set(&self, id: &str, data: Vec<u8>) -> Result<()> {
        self.storage.write().await.insert(id.to_string(), data);
        Ok(())
    }
}
