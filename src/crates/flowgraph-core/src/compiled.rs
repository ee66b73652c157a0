//! Compiled graph and its execution entry points
//!
//! A [`CompiledGraph`] is immutable and cheap to clone; every call to
//! [`invoke`](CompiledGraph::invoke), [`stream`](CompiledGraph::stream) or
//! [`resume`](CompiledGraph::resume) builds fresh channels and runs
//! independently of other calls.
//!
//! # Run outcomes
//!
//! A run either completes with the value that reached `END` or stops at an
//! interrupt. Interrupts are not failures, so they come back through
//! [`RunOutcome`] rather than as an error:
//!
//! ```rust,no_run
//! use flowgraph_core::{CompiledGraph, RunOptions, RunOutcome};
//! use serde_json::json;
//!
//! # async fn example(graph: CompiledGraph) -> flowgraph_core::Result<()> {
//! match graph.invoke(json!(21), RunOptions::new().with_checkpoint_id("run-1")).await? {
//!     RunOutcome::Completed(out) => println!("result: {out}"),
//!     RunOutcome::Interrupted(info) => {
//!         println!("paused at {:?}", info.interrupted_nodes());
//!         let resumed = graph.resume("run-1", None, RunOptions::new()).await?;
//!         println!("after resume: {:?}", resumed.completed());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use flowgraph_checkpoint::{CheckPointStore, CheckpointSerializer, RunMode};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::branch::Branch;
use crate::channel::{Channel, ChannelManager, DagChannel, EdgeResolver, PregelChannel};
use crate::config::{RunOptions, TriggerMode};
use crate::error::{GraphError, Result};
use crate::graph::{GraphInfo, END};
use crate::interrupt::InterruptInfo;
use crate::merge::MergeRegistry;
use crate::node::Node;
use crate::payload::Payload;
use crate::runner::{RunRequest, Runner};
use crate::state::StateGenerator;
use crate::stream::StreamReader;
use crate::types::DataType;

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome<T> {
    /// `END` received its input
    Completed(T),
    /// The run stopped early; resume with the reported checkpoint id
    Interrupted(InterruptInfo),
}

impl<T> RunOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(v) => Some(v),
            Self::Interrupted(_) => None,
        }
    }

    pub fn interrupted(self) -> Option<InterruptInfo> {
        match self {
            Self::Completed(_) => None,
            Self::Interrupted(info) => Some(info),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RunOutcome<U> {
        match self {
            Self::Completed(v) => RunOutcome::Completed(f(v)),
            Self::Interrupted(info) => RunOutcome::Interrupted(info),
        }
    }
}

/// A node with its resolved types
#[derive(Debug)]
pub(crate) struct NodeSpec {
    pub(crate) node: Node,
    pub(crate) input_type: DataType,
    pub(crate) output_type: DataType,
}

/// Everything a run needs, fixed at compile time
pub(crate) struct GraphCore {
    pub(crate) name: String,
    pub(crate) input_type: DataType,
    pub(crate) output_type: DataType,
    pub(crate) nodes: BTreeMap<String, Arc<NodeSpec>>,
    pub(crate) data_successors: BTreeMap<String, Vec<String>>,
    pub(crate) control_successors: BTreeMap<String, Vec<String>>,
    /// Edge targets plus branch ends; a skip spreads along these
    pub(crate) skip_successors: BTreeMap<String, Vec<String>>,
    pub(crate) branches: BTreeMap<String, Vec<Branch>>,
    pub(crate) control_preds: BTreeMap<String, Vec<String>>,
    pub(crate) data_preds: BTreeMap<String, Vec<String>>,
    pub(crate) resolvers: BTreeMap<String, Arc<EdgeResolver>>,
    /// Output type of every value source, `START` included
    pub(crate) output_types: BTreeMap<String, DataType>,
    pub(crate) trigger_mode: TriggerMode,
    pub(crate) max_steps: usize,
    pub(crate) eager: bool,
    pub(crate) max_parallelism: usize,
    pub(crate) interrupt_before: BTreeSet<String>,
    pub(crate) interrupt_after: BTreeSet<String>,
    pub(crate) store: Option<Arc<dyn CheckPointStore>>,
    pub(crate) serializer: Arc<dyn CheckpointSerializer>,
    pub(crate) merge: Arc<MergeRegistry>,
    pub(crate) state_generator: Option<StateGenerator>,
    pub(crate) info: GraphInfo,
}

impl GraphCore {
    /// Fresh channels for one run: one per node plus `END`
    pub(crate) fn new_channel_manager(&self) -> Result<ChannelManager> {
        let mut manager = ChannelManager::new(END);
        let keys = self.nodes.keys().map(String::as_str).chain(std::iter::once(END));
        for key in keys {
            let resolver = self
                .resolvers
                .get(key)
                .cloned()
                .ok_or_else(|| GraphError::Internal(format!("no edge resolver for '{key}'")))?;
            let channel: Box<dyn Channel> = match self.trigger_mode {
                TriggerMode::AllPredecessor => Box::new(DagChannel::new(
                    self.control_preds.get(key).cloned().unwrap_or_default(),
                    self.data_preds.get(key).cloned().unwrap_or_default(),
                )),
                TriggerMode::AnyPredecessor => Box::new(PregelChannel::new()),
            };
            manager.add_channel(key, channel, resolver);
        }
        for (node, successors) in &self.skip_successors {
            manager.set_control_successors(node.clone(), successors.clone());
        }
        Ok(manager)
    }

    pub(crate) fn output_type_of(&self, node: &str) -> DataType {
        self.output_types.get(node).cloned().unwrap_or(DataType::Any)
    }
}

impl std::fmt::Debug for GraphCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphCore")
            .field("name", &self.name)
            .field("trigger_mode", &self.trigger_mode)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("max_steps", &self.max_steps)
            .field("eager", &self.eager)
            .finish()
    }
}

/// A validated graph ready to run
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    core: Arc<GraphCore>,
}

impl CompiledGraph {
    pub(crate) fn new(core: GraphCore) -> Self {
        Self { core: Arc::new(core) }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Shape of the graph as reported to compile callbacks
    pub fn info(&self) -> &GraphInfo {
        &self.core.info
    }

    pub fn input_type(&self) -> &DataType {
        &self.core.input_type
    }

    pub fn output_type(&self) -> &DataType {
        &self.core.output_type
    }

    /// Run with whole values on every edge.
    ///
    /// With a checkpoint id whose record exists, the run continues from that
    /// record and `input` is ignored.
    pub async fn invoke(&self, input: Value, options: RunOptions) -> Result<RunOutcome<Value>> {
        let outcome = self
            .run(RunRequest::fresh(Payload::Value(input), RunMode::Invoke, options))
            .await?;
        self.collect_output(outcome).await
    }

    /// Run with streams on every edge; `input` enters as a one-chunk stream
    pub async fn stream(&self, input: Value, options: RunOptions) -> Result<RunOutcome<StreamReader>> {
        let outcome = self
            .run(RunRequest::fresh(
                Payload::Stream(StreamReader::single(input)),
                RunMode::Stream,
                options,
            ))
            .await?;
        Ok(outcome.map(Payload::into_stream))
    }

    /// Continue an interrupted run in value mode.
    ///
    /// `resume_input` is visible through [`NodeContext::resume_input`](crate::NodeContext::resume_input)
    /// to every node dispatched in the first resumed step.
    pub async fn resume(
        &self,
        checkpoint_id: impl Into<String>,
        resume_input: Option<Value>,
        options: RunOptions,
    ) -> Result<RunOutcome<Value>> {
        let outcome = self
            .run(RunRequest::resume(checkpoint_id.into(), resume_input, RunMode::Invoke, options))
            .await?;
        self.collect_output(outcome).await
    }

    /// Continue an interrupted run in stream mode
    pub async fn resume_stream(
        &self,
        checkpoint_id: impl Into<String>,
        resume_input: Option<Value>,
        options: RunOptions,
    ) -> Result<RunOutcome<StreamReader>> {
        let outcome = self
            .run(RunRequest::resume(checkpoint_id.into(), resume_input, RunMode::Stream, options))
            .await?;
        Ok(outcome.map(Payload::into_stream))
    }

    async fn run(&self, request: RunRequest) -> Result<RunOutcome<Payload>> {
        let (runner, entry) = Runner::new(Arc::clone(&self.core), request)?;
        runner.run(entry).await
    }

    async fn collect_output(&self, outcome: RunOutcome<Payload>) -> Result<RunOutcome<Value>> {
        match outcome {
            RunOutcome::Completed(payload) => Ok(RunOutcome::Completed(
                payload
                    .into_value(&self.core.output_type, &self.core.merge)
                    .await?,
            )),
            RunOutcome::Interrupted(info) => Ok(RunOutcome::Interrupted(info)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_accessors() {
        let done: RunOutcome<i32> = RunOutcome::Completed(1);
        assert!(!done.is_interrupted());
        assert_eq!(done.map(|v| v + 1).completed(), Some(2));

        let paused: RunOutcome<i32> = RunOutcome::Interrupted(InterruptInfo {
            after_nodes: vec!["a".into()],
            ..Default::default()
        });
        assert!(paused.is_interrupted());
        assert_eq!(paused.interrupted().map(|i| i.after_nodes), Some(vec!["a".to_string()]));
    }
}
