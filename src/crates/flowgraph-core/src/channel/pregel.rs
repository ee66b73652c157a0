use flowgraph_checkpoint::{ChannelFlavor, ChannelSnapshot, PersistedValue};
use std::collections::BTreeMap;

use super::{Channel, ChannelRead, EdgeResolver};
use crate::error::{GraphError, Result};
use crate::payload::Payload;

/// Channel that fires whenever any value is buffered
#[derive(Debug, Default)]
pub struct PregelChannel {
    values: BTreeMap<String, Payload>,
}

impl PregelChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Channel for PregelChannel {
    fn report_values(&mut self, values: BTreeMap<String, Payload>) {
        self.values.extend(values);
    }

    fn report_dependencies(&mut self, _keys: &[String]) {}

    fn report_skip(&mut self, _keys: &[String]) -> bool {
        false
    }

    fn get(&mut self, want_stream: bool, resolver: &EdgeResolver) -> Result<ChannelRead> {
        if self.values.is_empty() {
            return Ok(ChannelRead::NotReady);
        }
        let values = std::mem::take(&mut self.values);
        resolver.finish(values, want_stream).map(ChannelRead::Ready)
    }

    fn reset(&mut self) {
        self.values.clear();
    }

    fn take_values(&mut self) -> BTreeMap<String, Payload> {
        std::mem::take(&mut self.values)
    }

    fn put_values(&mut self, values: BTreeMap<String, Payload>) {
        self.values = values;
    }

    fn snapshot(&self) -> Result<ChannelSnapshot> {
        let mut snapshot = ChannelSnapshot::new(ChannelFlavor::Pregel);
        for (key, payload) in &self.values {
            let value = payload.as_value().ok_or_else(|| {
                GraphError::Internal(format!("stream buffered from '{key}' was not collapsed before snapshot"))
            })?;
            snapshot
                .values
                .insert(key.clone(), Some(PersistedValue(value.clone())));
        }
        Ok(snapshot)
    }

    fn restore(&mut self, snapshot: ChannelSnapshot) -> Result<()> {
        if snapshot.flavor != ChannelFlavor::Pregel {
            return Err(GraphError::Checkpoint(flowgraph_checkpoint::CheckpointError::Invalid(
                "expected a Pregel channel snapshot".into(),
            )));
        }
        self.values = snapshot
            .values
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, Payload::Value(v.into_inner()))))
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeRegistry;
    use crate::types::{DataType, TypeRegistry};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_fires_on_any_value_and_drains() {
        let resolver = EdgeResolver::new(
            "loop",
            DataType::Any,
            Arc::new(MergeRegistry::with_defaults()),
            Arc::new(TypeRegistry::new()),
        );
        let mut ch = PregelChannel::new();
        assert!(matches!(ch.get(false, &resolver).unwrap(), ChannelRead::NotReady));

        assert!(!ch.report_skip(&["x".to_string()]));
        ch.report_dependencies(&["x".to_string()]);
        assert!(matches!(ch.get(false, &resolver).unwrap(), ChannelRead::NotReady));

        let mut values = BTreeMap::new();
        values.insert("anyone".to_string(), Payload::Value(json!(5)));
        ch.report_values(values);
        assert!(ch.get(false, &resolver).unwrap().is_ready());
        assert!(matches!(ch.get(false, &resolver).unwrap(), ChannelRead::NotReady));
    }
}
