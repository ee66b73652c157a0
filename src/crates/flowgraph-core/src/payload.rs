//! Values and streams as they travel between nodes

use serde_json::Value;

use crate::error::Result;
use crate::merge::MergeRegistry;
use crate::stream::StreamReader;
use crate::types::DataType;

/// What a channel buffers and a node receives: a whole value or a lazy stream
#[derive(Debug)]
pub enum Payload {
    Value(Value),
    Stream(StreamReader),
}

impl Payload {
    pub fn is_stream(&self) -> bool {
        matches!(self, Payload::Stream(_))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Payload::Value(v) => Some(v),
            Payload::Stream(_) => None,
        }
    }

    pub fn into_stream_reader(self) -> Option<StreamReader> {
        match self {
            Payload::Stream(s) => Some(s),
            Payload::Value(_) => None,
        }
    }

    /// Collapse to a value, concatenating a stream with the registry.
    /// An empty stream becomes the zero value of `ty`.
    pub async fn into_value(self, ty: &DataType, registry: &MergeRegistry) -> Result<Value> {
        match self {
            Payload::Value(v) => Ok(v),
            Payload::Stream(s) => Ok(registry
                .concat_stream(ty, s)
                .await?
                .unwrap_or_else(|| ty.zero_value())),
        }
    }

    /// Widen to a stream; a value becomes a one-chunk stream
    pub fn into_stream(self) -> StreamReader {
        match self {
            Payload::Value(v) => StreamReader::single(v),
            Payload::Stream(s) => s,
        }
    }

    /// `n` independent copies; streams share one buffer
    pub fn copy(self, n: usize) -> Vec<Payload> {
        match self {
            Payload::Value(v) => (0..n).map(|_| Payload::Value(v.clone())).collect(),
            Payload::Stream(s) => s.copy(n).into_iter().map(Payload::Stream).collect(),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

impl From<StreamReader> for Payload {
    fn from(stream: StreamReader) -> Self {
        Payload::Stream(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_stream_collapses_through_concat() {
        let registry = MergeRegistry::with_defaults();
        let payload = Payload::Stream(StreamReader::from_vec(vec![json!("a"), json!("b")]));
        assert_eq!(payload.into_value(&DataType::String, &registry).await.unwrap(), json!("ab"));

        let empty = Payload::Stream(StreamReader::empty());
        assert_eq!(empty.into_value(&DataType::Int, &registry).await.unwrap(), json!(0));
    }

    #[tokio::test]
    async fn test_copy_values_and_streams() {
        let copies = Payload::from(json!(1)).copy(3);
        assert_eq!(copies.len(), 3);
        assert!(copies.iter().all(|p| p.as_value() == Some(&json!(1))));

        let streams = Payload::from(StreamReader::from_vec(vec![json!(1), json!(2)])).copy(2);
        for s in streams {
            let values = s.into_stream().collect_values().await.unwrap();
            assert_eq!(values, vec![json!(1), json!(2)]);
        }
    }
}
