//! Moving run state in and out of checkpoint records
//!
//! Records only hold plain values. Saving collapses every stream (buffered in
//! a channel or waiting as a node input) with the concat function of its
//! type; restoring turns values back into one-chunk streams when the resumed
//! run streams:
//!
//! ```text
//!   save:     stream ──concat_stream──► Option<Value> ──► record
//!   restore:  record ──► Option<Value> ──restore_stream──► stream   (stream run)
//!                                     └─────────────────► value    (invoke run)
//! ```

use flowgraph_checkpoint::{CheckPointStore, CheckpointRecord, CheckpointSerializer, PersistedValue};
use serde_json::Value;

use crate::error::Result;
use crate::merge::{restore_stream, MergeRegistry};
use crate::payload::Payload;
use crate::types::DataType;

/// Fetch and decode a record; `None` when the id is unknown
pub async fn load_record(
    store: &dyn CheckPointStore,
    serializer: &dyn CheckpointSerializer,
    id: &str,
) -> Result<Option<CheckpointRecord>> {
    match store.get(id).await? {
        Some(bytes) => {
            let record = serializer.decode(&bytes)?;
            tracing::debug!(
                checkpoint_id = %id,
                step = record.step,
                bytes = bytes.len(),
                "checkpoint loaded"
            );
            Ok(Some(record))
        }
        None => {
            tracing::debug!(checkpoint_id = %id, "checkpoint not found");
            Ok(None)
        }
    }
}

/// Encode and store a record under `id`
pub async fn save_record(
    store: &dyn CheckPointStore,
    serializer: &dyn CheckpointSerializer,
    id: &str,
    record: &CheckpointRecord,
) -> Result<()> {
    let bytes = serializer.encode(record)?;
    tracing::debug!(
        checkpoint_id = %id,
        step = record.step,
        bytes = bytes.len(),
        "checkpoint saved"
    );
    store.set(id, bytes).await?;
    Ok(())
}

/// Collapse a payload into its stored form; an empty stream is `None`
pub async fn collapse_payload(
    payload: Payload,
    ty: &DataType,
    registry: &MergeRegistry,
) -> Result<Option<PersistedValue>> {
    let value = match payload {
        Payload::Value(v) => Some(v),
        Payload::Stream(s) => registry.concat_stream(ty, s).await?,
    };
    Ok(value.map(PersistedValue))
}

/// Rebuild a payload from its stored form
pub fn restore_payload(value: Option<PersistedValue>, ty: &DataType, want_stream: bool) -> Payload {
    let value: Option<Value> = value.map(PersistedValue::into_inner);
    if want_stream {
        Payload::Stream(restore_stream(value))
    } else {
        Payload::Value(value.unwrap_or_else(|| ty.zero_value()))
    }
}
