//! # flowgraph-checkpoint - persistence contract for interrupted runs
//!
//! When a flowgraph run is interrupted, the engine freezes every channel's
//! buffered values and the inputs of nodes that were about to run into a
//! [`CheckpointRecord`], encodes it with a [`CheckpointSerializer`], and hands
//! the bytes to a [`CheckPointStore`] under a caller-chosen id. Resuming
//! reverses the three steps.
//!
//! ```text
//!   engine ──record──> CheckpointSerializer ──bytes──> CheckPointStore
//!          <─record──                       <─bytes──
//! ```
//!
//! This crate owns only that contract:
//!
//! - [`CheckPointStore`] - async `get(id)` / `set(id, bytes)` trait
//! - [`InMemoryCheckPointStore`] - reference store for tests and single-process use
//! - [`JsonSerializer`] (default) and [`BincodeSerializer`]
//! - [`CheckpointRecord`] and its parts
//!
//! Durable backends (SQL, Redis, object storage) live outside this workspace
//! and only need to implement [`CheckPointStore`].
//!
//! ## Quick start
//!
//! ```rust
//! use flowgraph_checkpoint::{
//!     CheckPointStore, CheckpointRecord, CheckpointSerializer, InMemoryCheckPointStore,
//!     JsonSerializer, RunMode,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> flowgraph_checkpoint::Result<()> {
//! let store = InMemoryCheckPointStore::new();
//! let serializer = JsonSerializer::new();
//!
//! let record = CheckpointRecord::new(RunMode::Invoke, 1);
//! store.set("thread-1", serializer.encode(&record)?).await?;
//!
//! let bytes = store.get("thread-1").await?.expect("stored above");
//! assert_eq!(serializer.decode(&bytes)?, record);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod memory;
pub mod record;
pub mod serializer;
pub mod store;

pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckPointStore;
pub use record::{
    ChannelFlavor, ChannelSnapshot, CheckpointRecord, DependencyState, PersistedValue, RunMode,
    RECORD_VERSION,
};
pub use serializer::{BincodeSerializer, CheckpointSerializer, JsonSerializer, SerializerProtocol};
pub use store::CheckPointStore;
