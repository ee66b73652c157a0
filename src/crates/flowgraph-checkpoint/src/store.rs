//! The key/blob contract between the engine and a persistence backend
//!
//! The engine never interprets stored bytes beyond handing them to a
//! [`CheckpointSerializer`](crate::CheckpointSerializer). A backend only has to
//! answer two questions: "what bytes are stored under this id" and "store
//! these bytes under this id".
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use flowgraph_checkpoint::{CheckPointStore, Result};
//!
//! struct RedisStore { client: redis::Client }
//!
//! #[async_trait]
//! impl CheckPointStore for RedisStore {
//!     async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
//!         // None when the key does not exist
//!         # unimplemented!()
//!     }
//!
//!     async fn set(&self, id: &str, data: Vec<u8>) -> Result<()> {
//!         # unimplemented!()
//!     }
//! }
//! ```

use crate::error::Result;
use async_trait::async_trait;

/// Persistence contract for interrupted runs.
///
/// `get` returning `Ok(None)` is the "not found" case; an `Err` means the
/// backend could not answer at all.
#[async_trait]
pub trait CheckPointStore: Send + Sync {
    /// Fetch the bytes stored under `id`
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Store `data` under `id`, replacing any previous value
    async fn set(&self, id: &str, data: Vec<u8>) -> Result<()>;
}
