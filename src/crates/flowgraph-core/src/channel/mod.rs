//! Per-node input channels
//!
//! Every node (and `END`) owns one channel. Predecessors report values,
//! dependency completions and skips into it; the runner polls it with
//! [`Channel::get`] and dispatches the node once it reports ready.
//!
//! Two flavors decide readiness:
//!
//! - [`DagChannel`] waits for *all* predecessors (each one either delivered or
//!   was skipped) and propagates skips;
//! - [`PregelChannel`] fires as soon as *any* value is buffered, which allows
//!   loops.
//!
//! When a channel fires, its buffered values are resolved edge by edge
//! through an [`EdgeResolver`] (field mappings, deferred type checks) and
//! merged into a single [`Payload`].

mod dag;
mod manager;
mod pregel;

pub use dag::DagChannel;
pub use manager::{ChannelHandle, ChannelManager};
pub use pregel::PregelChannel;

use flowgraph_checkpoint::ChannelSnapshot;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::mapping::{apply_mappings, apply_mappings_to_chunk, FieldMapping};
use crate::merge::{MergeConfig, MergeRegistry};
use crate::payload::Payload;
use crate::stream::StreamReader;
use crate::types::{DataType, TypeRegistry};

/// Result of polling a channel
#[derive(Debug)]
pub enum ChannelRead {
    /// Some predecessor has not reported yet
    NotReady,
    /// Every predecessor was skipped; the node must not run
    Skipped,
    /// The node's merged input
    Ready(Payload),
}

impl ChannelRead {
    pub fn is_ready(&self) -> bool {
        matches!(self, ChannelRead::Ready(_))
    }
}

/// Input buffer of one node
pub trait Channel: Send {
    /// Buffer values keyed by predecessor
    fn report_values(&mut self, values: BTreeMap<String, Payload>);

    /// Mark control dependencies as completed
    fn report_dependencies(&mut self, keys: &[String]);

    /// Mark dependencies as skipped; `true` exactly when this call skipped the channel
    fn report_skip(&mut self, keys: &[String]) -> bool;

    /// Poll the channel; any result other than `NotReady` resets it
    fn get(&mut self, want_stream: bool, resolver: &EdgeResolver) -> Result<ChannelRead>;

    /// Back to the initial waiting state
    fn reset(&mut self);

    /// Transform buffered values in place; `None` drops the value
    fn convert_values(
        &mut self,
        f: &mut dyn FnMut(&str, Payload) -> Result<Option<Payload>>,
    ) -> Result<()> {
        let values = self.take_values();
        let mut converted = BTreeMap::new();
        for (key, payload) in values {
            if let Some(p) = f(&key, payload)? {
                converted.insert(key, p);
            }
        }
        self.put_values(converted);
        Ok(())
    }

    /// Remove and return buffered values without touching dependency state
    fn take_values(&mut self) -> BTreeMap<String, Payload>;

    /// Put values back after [`take_values`](Channel::take_values)
    fn put_values(&mut self, values: BTreeMap<String, Payload>);

    /// Checkpoint representation; buffered streams must already be collapsed
    fn snapshot(&self) -> Result<ChannelSnapshot>;

    /// Replace state with a checkpoint representation; `Some` values come back as plain values
    fn restore(&mut self, snapshot: ChannelSnapshot) -> Result<()>;
}

/// What happens to values crossing one edge
#[derive(Debug, Clone, Default)]
pub struct EdgeHandler {
    pub mappings: Vec<FieldMapping>,
    /// Check values against the target input at run time
    pub runtime_check: bool,
}

impl EdgeHandler {
    fn is_noop(&self) -> bool {
        self.mappings.is_empty() && !self.runtime_check
    }
}

/// Resolves and merges a node's buffered inputs
#[derive(Debug)]
pub struct EdgeResolver {
    node: String,
    input_type: DataType,
    handlers: BTreeMap<String, Arc<EdgeHandler>>,
    merge_config: MergeConfig,
    merge: Arc<MergeRegistry>,
    types: Arc<TypeRegistry>,
}

impl EdgeResolver {
    pub fn new(
        node: impl Into<String>,
        input_type: DataType,
        merge: Arc<MergeRegistry>,
        types: Arc<TypeRegistry>,
    ) -> Self {
        Self {
            node: node.into(),
            input_type,
            handlers: BTreeMap::new(),
            merge_config: MergeConfig::default(),
            merge,
            types,
        }
    }

    pub fn with_handler(mut self, from: impl Into<String>, handler: EdgeHandler) -> Self {
        if !handler.is_noop() {
            self.handlers.insert(from.into(), Arc::new(handler));
        }
        self
    }

    pub fn with_merge_config(mut self, config: MergeConfig) -> Self {
        self.merge_config = config;
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn input_type(&self) -> &DataType {
        &self.input_type
    }

    /// Apply the handler of edge `from -> node` to one payload
    pub fn resolve_edge(&self, from: &str, payload: Payload) -> Result<Payload> {
        let Some(handler) = self.handlers.get(from) else {
            return Ok(payload);
        };
        match payload {
            Payload::Value(value) => {
                let mapped = if handler.mappings.is_empty() {
                    value
                } else {
                    apply_mappings(&value, &handler.mappings)?
                };
                if handler.runtime_check {
                    check_conformance(&self.types, from, &self.node, &self.input_type, &handler.mappings, &mapped)?;
                }
                Ok(Payload::Value(mapped))
            }
            Payload::Stream(stream) => {
                let handler = Arc::clone(handler);
                let types = Arc::clone(&self.types);
                let input_type = self.input_type.clone();
                let from = from.to_string();
                let node = self.node.clone();
                Ok(Payload::Stream(stream.convert(move |chunk| {
                    let mapped = if handler.mappings.is_empty() {
                        Some(chunk)
                    } else {
                        apply_mappings_to_chunk(&chunk, &handler.mappings)?
                    };
                    if let (Some(value), true) = (&mapped, handler.runtime_check) {
                        check_conformance(&types, &from, &node, &input_type, &handler.mappings, value)?;
                    }
                    Ok(mapped)
                })))
            }
        }
    }

    /// Resolve every buffered value and merge them into the node's input
    pub fn finish(&self, values: BTreeMap<String, Payload>, want_stream: bool) -> Result<Payload> {
        let mut resolved = Vec::with_capacity(values.len());
        for (from, payload) in values {
            let payload = self.resolve_edge(&from, payload)?;
            resolved.push((from, payload));
        }
        match resolved.len() {
            0 if want_stream => Ok(Payload::Stream(StreamReader::empty())),
            0 => Ok(Payload::Value(self.input_type.zero_value())),
            1 => resolved
                .pop()
                .map(|(_, p)| p)
                .ok_or_else(|| GraphError::Internal("resolved input vanished".into())),
            _ => self
                .merge
                .merge_payloads(&self.input_type, resolved, &self.merge_config),
        }
    }
}

fn check_conformance(
    types: &TypeRegistry,
    from: &str,
    node: &str,
    input_type: &DataType,
    mappings: &[FieldMapping],
    value: &Value,
) -> Result<()> {
    if mappings.is_empty() {
        if !types.conforms(value, input_type) {
            return Err(GraphError::RuntimeType(format!(
                "value from '{from}' does not conform to input type {input_type} of '{node}'"
            )));
        }
        return Ok(());
    }
    for mapping in mappings.iter().filter(|m| !m.has_transform()) {
        let target = mapping.to_path();
        let (Some(field_ty), Some(field)) = (input_type.field_type(target), target.get(value)) else {
            continue;
        };
        if !types.conforms(field, &field_ty) {
            return Err(GraphError::RuntimeType(format!(
                "mapped field '{target}' from '{from}' does not conform to {field_ty} in '{node}'"
            )));
        }
    }
    Ok(())
}
