//! Serialization protocol for checkpoint records

use crate::error::Result;
use crate::record::CheckpointRecord;
use serde::{Deserialize, Serialize};

/// Protocol for turning values into bytes and back
///
/// Implementations can provide custom strategies (JSON, bincode, ...).
pub trait SerializerProtocol: Send + Sync {
    /// Serialize a value to bytes
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes
    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;
}

/// Object-safe view of a serializer, specialised to checkpoint records.
///
/// The engine stores serializers as `Arc<dyn CheckpointSerializer>`; every
/// [`SerializerProtocol`] gets this for free.
pub trait CheckpointSerializer: Send + Sync {
    fn encode(&self, record: &CheckpointRecord) -> Result<Vec<u8>>;

    fn decode(&self, data: &[u8]) -> Result<CheckpointRecord>;
}

impl<S: SerializerProtocol> CheckpointSerializer for S {
    fn encode(&self, record: &CheckpointRecord) -> Result<Vec<u8>> {
        self.dumps(record)
    }

    fn decode(&self, data: &[u8]) -> Result<CheckpointRecord> {
        let record: CheckpointRecord = self.loads(data)?;
        record.check_version()?;
        Ok(record)
    }
}

/// JSON-based serializer (default)
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Binary serializer using bincode
#[derive(Debug, Clone, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for BincodeSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(data)?)
    }
}
