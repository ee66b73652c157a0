use flowgraph_checkpoint::ChannelSnapshot;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use super::{Channel, ChannelRead, EdgeResolver};
use crate::error::{GraphError, Result};
use crate::checkpoint::{collapse_payload, restore_payload};
use crate::merge::MergeRegistry;
use crate::payload::Payload;
use crate::types::DataType;

/// Shared handle to one channel; each channel is locked on its own
pub type ChannelHandle = Arc<Mutex<Box<dyn Channel>>>;

/// Owns every channel of one run and routes reports between them
pub struct ChannelManager {
    channels: BTreeMap<String, ChannelHandle>,
    resolvers: BTreeMap<String, Arc<EdgeResolver>>,
    control_successors: BTreeMap<String, Vec<String>>,
    end: String,
}

impl ChannelManager {
    /// `end` names the channel whose readiness finishes the run
    pub fn new(end: impl Into<String>) -> Self {
        Self {
            channels: BTreeMap::new(),
            resolvers: BTreeMap::new(),
            control_successors: BTreeMap::new(),
            end: end.into(),
        }
    }

    pub fn add_channel(&mut self, node: impl Into<String>, channel: Box<dyn Channel>, resolver: Arc<EdgeResolver>) {
        let node = node.into();
        self.resolvers.insert(node.clone(), resolver);
        self.channels.insert(node, Arc::new(Mutex::new(channel)));
    }

    /// Nodes that must be skipped when `node` is skipped (every outgoing edge and branch end)
    pub fn set_control_successors(&mut self, node: impl Into<String>, successors: Vec<String>) {
        self.control_successors.insert(node.into(), successors);
    }

    pub fn channel(&self, node: &str) -> Result<&ChannelHandle> {
        self.channels
            .get(node)
            .ok_or_else(|| GraphError::Internal(format!("no channel for node '{node}'")))
    }

    fn resolver(&self, node: &str) -> Result<&Arc<EdgeResolver>> {
        self.resolvers
            .get(node)
            .ok_or_else(|| GraphError::Internal(format!("no edge resolver for node '{node}'")))
    }

    /// Deliver values: target node -> (predecessor -> payload).
    ///
    /// A data edge also completes the control dependency on its source.
    pub fn update_values(&self, values: BTreeMap<String, BTreeMap<String, Payload>>) -> Result<()> {
        for (node, from_values) in values {
            let keys: Vec<String> = from_values.keys().cloned().collect();
            let mut channel = self.channel(&node)?.lock();
            channel.report_values(from_values);
            channel.report_dependencies(&keys);
        }
        Ok(())
    }

    /// Complete control dependencies: target node -> predecessors
    pub fn update_dependencies(&self, dependencies: BTreeMap<String, Vec<String>>) -> Result<()> {
        for (node, keys) in dependencies {
            self.channel(&node)?.lock().report_dependencies(&keys);
        }
        Ok(())
    }

    /// Skip the branch ends `from` did not pick, then everything only they lead to
    pub fn report_branch(&self, from: &str, skipped: &[String]) -> Result<()> {
        let mut queue: VecDeque<(String, String)> = skipped
            .iter()
            .map(|target| (from.to_string(), target.clone()))
            .collect();
        let mut visited = BTreeSet::new();

        while let Some((source, node)) = queue.pop_front() {
            let became_skipped = self
                .channel(&node)?
                .lock()
                .report_skip(std::slice::from_ref(&source));
            if became_skipped && visited.insert(node.clone()) {
                tracing::debug!(node = %node, "node skipped");
                for next in self.control_successors.get(&node).into_iter().flatten() {
                    queue.push_back((node.clone(), next.clone()));
                }
            }
        }
        Ok(())
    }

    /// Poll every node channel and return the inputs of the ready ones
    pub fn get_from_ready_channels(&self, want_stream: bool) -> Result<Vec<(String, Payload)>> {
        self.get_from_ready_channels_except(want_stream, &BTreeSet::new())
    }

    /// Like [`get_from_ready_channels`](Self::get_from_ready_channels), leaving
    /// the channels of `held` untouched
    pub fn get_from_ready_channels_except(
        &self,
        want_stream: bool,
        held: &BTreeSet<String>,
    ) -> Result<Vec<(String, Payload)>> {
        let mut ready = Vec::new();
        for (node, handle) in &self.channels {
            if *node == self.end || held.contains(node) {
                continue;
            }
            let resolver = self.resolver(node)?;
            match handle.lock().get(want_stream, resolver)? {
                ChannelRead::Ready(payload) => ready.push((node.clone(), payload)),
                ChannelRead::Skipped => {
                    tracing::debug!(node = %node, "skipped channel reset");
                }
                ChannelRead::NotReady => {}
            }
        }
        Ok(ready)
    }

    /// Poll the end channel
    pub fn get_end(&self, want_stream: bool) -> Result<ChannelRead> {
        let resolver = self.resolver(&self.end)?;
        let mut channel = self.channel(&self.end)?.lock();
        channel.get(want_stream, resolver)
    }

    /// Transform every buffered value in place
    pub fn convert_values(
        &self,
        f: &mut dyn FnMut(&str, &str, Payload) -> Result<Option<Payload>>,
    ) -> Result<()> {
        for (node, handle) in &self.channels {
            handle
                .lock()
                .convert_values(&mut |from: &str, payload: Payload| f(node, from, payload))?;
        }
        Ok(())
    }

    /// Snapshot every channel, concatenating buffered streams first.
    ///
    /// The channels are left drained. A stream that turns out empty is kept
    /// as a `None` value so the delivery itself survives the checkpoint.
    pub async fn checkpoint(
        &self,
        registry: &MergeRegistry,
        output_types: &BTreeMap<String, DataType>,
    ) -> Result<BTreeMap<String, ChannelSnapshot>> {
        let mut snapshots = BTreeMap::new();
        for (node, handle) in &self.channels {
            let values = handle.lock().take_values();
            let mut collapsed = BTreeMap::new();
            for (from, payload) in values {
                let ty = output_types.get(&from).cloned().unwrap_or(DataType::Any);
                collapsed.insert(from, collapse_payload(payload, &ty, registry).await?);
            }
            let mut snapshot = handle.lock().snapshot()?;
            snapshot.values = collapsed;
            snapshots.insert(node.clone(), snapshot);
        }
        tracing::debug!(channels = snapshots.len(), "channels checkpointed");
        Ok(snapshots)
    }

    /// Snapshot of channels that hold plain values only
    pub fn snapshot(&self) -> Result<BTreeMap<String, ChannelSnapshot>> {
        self.channels
            .iter()
            .map(|(node, handle)| Ok((node.clone(), handle.lock().snapshot()?)))
            .collect()
    }

    /// Restore channel states.
    ///
    /// Stored values come back as one-chunk streams in stream mode; a `None`
    /// value becomes an empty stream, or the zero value of its source's output
    /// type in value mode.
    pub fn restore(
        &self,
        snapshots: BTreeMap<String, ChannelSnapshot>,
        want_stream: bool,
        output_types: &BTreeMap<String, DataType>,
    ) -> Result<()> {
        for (node, mut snapshot) in snapshots {
            let Some(handle) = self.channels.get(&node) else {
                return Err(GraphError::Checkpoint(flowgraph_checkpoint::CheckpointError::Invalid(
                    format!("checkpoint has a channel for unknown node '{node}'"),
                )));
            };
            let values: BTreeMap<String, Payload> = std::mem::take(&mut snapshot.values)
                .into_iter()
                .map(|(from, value)| {
                    let ty = output_types.get(&from).cloned().unwrap_or(DataType::Any);
                    (from, restore_payload(value, &ty, want_stream))
                })
                .collect();
            let mut channel = handle.lock();
            channel.restore(snapshot)?;
            channel.put_values(values);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("end", &self.end)
            .finish()
    }
}
