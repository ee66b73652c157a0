//! Compile and run options
//!
//! [`CompileOptions`] fixes how a graph executes; [`RunOptions`] controls one
//! run (checkpoint ids, state edits, cancellation). The serializable part of
//! the compile options can be kept in YAML as an [`EngineConfig`]:
//!
//! ```yaml
//! name: review-pipeline
//! trigger_mode: all_predecessor
//! eager: true
//! max_parallelism: 4
//! interrupt_after_nodes: [draft]
//! merge:
//!   collect:
//!     stream_merge_with_source_eof: true
//! ```

use flowgraph_checkpoint::{CheckPointStore, CheckpointSerializer, JsonSerializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{GraphError, Result};
use crate::graph::GraphInfo;
use crate::merge::{MergeConfig, MergeRegistry};
use crate::state::{StateGenerator, StateModifier};
use crate::types::TypeRegistry;

/// Default step budget of a loop-capable graph
pub const DEFAULT_PREGEL_MAX_STEPS: usize = 100;

/// Extra steps a DAG run gets on top of its node count
pub const DAG_STEP_HEADROOM: usize = 10;

/// When a node becomes ready
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Wait for every predecessor; no cycles; skips propagate (DAG)
    #[default]
    AllPredecessor,
    /// Run whenever any predecessor delivered; loops allowed (Pregel)
    AnyPredecessor,
}

/// Serializable engine settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub trigger_mode: TriggerMode,
    #[serde(default)]
    pub eager: Option<bool>,
    #[serde(default)]
    pub max_run_steps: Option<usize>,
    /// 0 means unbounded
    #[serde(default)]
    pub max_parallelism: usize,
    #[serde(default)]
    pub interrupt_before_nodes: Vec<String>,
    #[serde(default)]
    pub interrupt_after_nodes: Vec<String>,
    /// Per-node fan-in settings
    #[serde(default)]
    pub merge: BTreeMap<String, MergeConfig>,
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = ?path.as_ref(), "loading engine config");
        Self::from_yaml_str(&content)
    }

    /// Reject settings that can never run
    pub fn validate(&self) -> Result<()> {
        if self.max_run_steps == Some(0) {
            return Err(GraphError::Configuration(
                "max_run_steps must be greater than zero".into(),
            ));
        }
        if let Some(node) = self
            .interrupt_before_nodes
            .iter()
            .find(|n| self.interrupt_after_nodes.contains(n))
        {
            return Err(GraphError::Configuration(format!(
                "node '{node}' is listed for both interrupt before and after"
            )));
        }
        Ok(())
    }
}

/// Called with the compiled graph's shape; an error aborts the compile
pub type CompileCallback = Arc<dyn Fn(&GraphInfo) -> Result<()> + Send + Sync>;

/// Everything `Graph::compile` needs besides the graph itself
#[derive(Clone)]
pub struct CompileOptions {
    pub config: EngineConfig,
    pub checkpoint_store: Option<Arc<dyn CheckPointStore>>,
    pub serializer: Arc<dyn CheckpointSerializer>,
    /// Defaults to [`MergeRegistry::global`]
    pub merge_registry: Option<Arc<MergeRegistry>>,
    pub type_registry: Arc<TypeRegistry>,
    pub state_generator: Option<StateGenerator>,
    pub callbacks: Vec<CompileCallback>,
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::from_config(EngineConfig::default())
    }

    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            config,
            checkpoint_store: None,
            serializer: Arc::new(JsonSerializer::new()),
            merge_registry: None,
            type_registry: Arc::new(TypeRegistry::new()),
            state_generator: None,
            callbacks: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn with_trigger_mode(mut self, mode: TriggerMode) -> Self {
        self.config.trigger_mode = mode;
        self
    }

    pub fn with_eager(mut self, eager: bool) -> Self {
        self.config.eager = Some(eager);
        self
    }

    pub fn with_max_run_steps(mut self, steps: usize) -> Self {
        self.config.max_run_steps = Some(steps);
        self
    }

    pub fn with_max_parallelism(mut self, n: usize) -> Self {
        self.config.max_parallelism = n;
        self
    }

    pub fn with_interrupt_before<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.interrupt_before_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interrupt_after<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.interrupt_after_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_merge_config(mut self, node: impl Into<String>, config: MergeConfig) -> Self {
        self.config.merge.insert(node.into(), config);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckPointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn CheckpointSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_merge_registry(mut self, registry: Arc<MergeRegistry>) -> Self {
        self.merge_registry = Some(registry);
        self
    }

    pub fn with_type_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.type_registry = registry;
        self
    }

    pub fn with_state_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> serde_json::Value + Send + Sync + 'static,
    {
        self.state_generator = Some(Arc::new(generator));
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&GraphInfo) -> Result<()> + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
        self
    }

    /// Step budget for a graph of `node_count` nodes
    pub(crate) fn effective_max_steps(&self, node_count: usize) -> usize {
        match (self.config.max_run_steps, self.config.trigger_mode) {
            (Some(steps), _) => steps,
            (None, TriggerMode::AllPredecessor) => node_count + DAG_STEP_HEADROOM,
            (None, TriggerMode::AnyPredecessor) => DEFAULT_PREGEL_MAX_STEPS,
        }
    }

    /// DAG runs wait for the whole step unless told otherwise; Pregel supersteps always do
    pub(crate) fn effective_eager(&self) -> bool {
        match self.config.trigger_mode {
            TriggerMode::AllPredecessor => self.config.eager.unwrap_or(false),
            TriggerMode::AnyPredecessor => false,
        }
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompileOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileOptions")
            .field("config", &self.config)
            .field("checkpoint_store", &self.checkpoint_store.is_some())
            .field("merge_registry", &self.merge_registry)
            .field("state_generator", &self.state_generator.is_some())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Options for one `invoke`, `stream` or `resume` call
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Load this checkpoint (if it exists) and continue from it
    pub checkpoint_id: Option<String>,
    /// Store an interrupt under this id instead of `checkpoint_id`
    pub write_to_checkpoint_id: Option<String>,
    /// Ignore any stored checkpoint and start over
    pub force_new_run: bool,
    /// Edit the restored graph state before continuing
    pub state_modifier: Option<StateModifier>,
    /// Cancelling this token interrupts the run after in-flight nodes finish
    pub interrupt: Option<CancellationToken>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint_id(mut self, id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(id.into());
        self
    }

    pub fn with_write_to_checkpoint_id(mut self, id: impl Into<String>) -> Self {
        self.write_to_checkpoint_id = Some(id.into());
        self
    }

    pub fn with_force_new_run(mut self, force: bool) -> Self {
        self.force_new_run = force;
        self
    }

    pub fn with_state_modifier<F>(mut self, modifier: F) -> Self
    where
        F: Fn(&mut serde_json::Value) -> Result<()> + Send + Sync + 'static,
    {
        self.state_modifier = Some(Arc::new(modifier));
        self
    }

    pub fn with_interrupt(mut self, token: CancellationToken) -> Self {
        self.interrupt = Some(token);
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("checkpoint_id", &self.checkpoint_id)
            .field("write_to_checkpoint_id", &self.write_to_checkpoint_id)
            .field("force_new_run", &self.force_new_run)
            .field("state_modifier", &self.state_modifier.is_some())
            .field("interrupt", &self.interrupt.is_some())
            .finish()
    }
}
