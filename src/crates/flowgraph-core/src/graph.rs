//! Graph builder
//!
//! A [`Graph`] collects nodes, edges and branches, then [`Graph::compile`]
//! checks the structure, resolves types and produces a
//! [`CompiledGraph`](crate::CompiledGraph).
//!
//! ```text
//!            ┌──────────┐  data   ┌──────────┐  data   ┌──────────┐
//!  START ───►│  source  │────────►│  double  │────────►│   sink   │───► END
//!            └──────────┘         └──────────┘         └──────────┘
//!                 │                                          ▲
//!                 └──────────────── control ─────────────────┘
//! ```
//!
//! - **data edges** deliver the source's output and gate the target;
//! - **control edges** only gate the target;
//! - **branches** pick some of their end nodes at run time and skip the rest.
//!
//! Builder methods never fail on the spot. Problems are recorded and the
//! first one is returned by `compile`, so a graph can be assembled with plain
//! chained calls.
//!
//! ```rust
//! use flowgraph_core::{CompileOptions, DataType, Graph, Node, END, START};
//! use serde_json::{json, Value};
//!
//! # async fn run() -> flowgraph_core::Result<()> {
//! let mut graph = Graph::with_types(DataType::Int, DataType::Int);
//! graph
//!     .add_node("double", Node::invoke(|v: Value| async move {
//!         Ok(json!(v.as_i64().unwrap_or_default() * 2))
//!     }).with_types(DataType::Int, DataType::Int))
//!     .add_edge(START, "double")
//!     .add_edge("double", END);
//!
//! let compiled = graph.compile(CompileOptions::new())?;
//! let out = compiled.invoke(json!(21), Default::default()).await?;
//! assert_eq!(out.completed(), Some(json!(42)));
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::branch::Branch;
use crate::channel::{EdgeHandler, EdgeResolver};
use crate::compiled::{CompiledGraph, GraphCore, NodeSpec};
use crate::config::{CompileOptions, TriggerMode};
use crate::error::{GraphError, Result};
use crate::mapping::FieldMapping;
use crate::merge::MergeRegistry;
use crate::node::Node;
use crate::topology;
use crate::types::DataType;
use crate::validation::{GraphValidator, NodeTypes, TypeTable};

/// Key of the virtual node that emits the run input
pub const START: &str = "__start__";

/// Key of the virtual node whose input is the run output
pub const END: &str = "__end__";

/// What an edge carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Value plus readiness
    Data,
    /// Readiness only
    Control,
}

#[derive(Debug, Clone)]
struct Edge {
    from: String,
    to: String,
    kind: EdgeKind,
    mappings: Vec<FieldMapping>,
}

/// Shape of a compiled graph, handed to compile callbacks
#[derive(Debug, Clone, Serialize)]
pub struct GraphInfo {
    pub name: String,
    pub trigger_mode: TriggerMode,
    pub input_type: String,
    pub output_type: String,
    pub nodes: BTreeMap<String, NodeInfo>,
    pub edges: Vec<EdgeInfo>,
    /// Branch ends per source node
    pub branches: BTreeMap<String, Vec<Vec<String>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub kind: &'static str,
    pub input_type: String,
    pub output_type: String,
    pub passthrough: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeInfo {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
    pub mappings: Vec<String>,
}

/// Graph under construction
#[derive(Debug)]
pub struct Graph {
    input_type: DataType,
    output_type: DataType,
    nodes: BTreeMap<String, Node>,
    edges: Vec<Edge>,
    branches: BTreeMap<String, Vec<Branch>>,
    errors: Vec<GraphError>,
}

impl Graph {
    /// Graph whose input and output are untyped
    pub fn new() -> Self {
        Self::with_types(DataType::Any, DataType::Any)
    }

    pub fn with_types(input: DataType, output: DataType) -> Self {
        Self {
            input_type: input,
            output_type: output,
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            branches: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn add_node(&mut self, key: impl Into<String>, node: Node) -> &mut Self {
        let key = key.into();
        if key == START || key == END {
            self.errors
                .push(GraphError::Validation(format!("node key '{key}' is reserved")));
        } else if key.is_empty() {
            self.errors
                .push(GraphError::Validation("node key must not be empty".into()));
        } else if self.nodes.contains_key(&key) {
            self.errors
                .push(GraphError::Validation(format!("node '{key}' already exists")));
        } else {
            self.nodes.insert(key, node);
        }
        self
    }

    /// Node that forwards its input; its type is inferred
    pub fn add_passthrough_node(&mut self, key: impl Into<String>) -> &mut Self {
        self.add_node(key, Node::passthrough())
    }

    /// Data edge: `to` receives `from`'s output and waits for it
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.push_edge(from.into(), to.into(), EdgeKind::Data, Vec::new())
    }

    /// Control edge: `to` waits for `from` but receives nothing
    pub fn add_control_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.push_edge(from.into(), to.into(), EdgeKind::Control, Vec::new())
    }

    /// Data edge that delivers selected fields of `from`'s output
    pub fn add_edge_with_mappings(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        mappings: Vec<FieldMapping>,
    ) -> &mut Self {
        let (from, to) = (from.into(), to.into());
        if mappings.is_empty() {
            self.errors.push(GraphError::Validation(format!(
                "edge '{from}' -> '{to}' was given an empty mapping list"
            )));
            return self;
        }
        self.push_edge(from, to, EdgeKind::Data, mappings)
    }

    fn push_edge(&mut self, from: String, to: String, kind: EdgeKind, mappings: Vec<FieldMapping>) -> &mut Self {
        if from == END {
            self.errors
                .push(GraphError::Validation("END cannot have outgoing edges".into()));
        } else if to == START {
            self.errors
                .push(GraphError::Validation("START cannot have incoming edges".into()));
        } else if self.edges.iter().any(|e| e.from == from && e.to == to) {
            self.errors.push(GraphError::Validation(format!(
                "edge '{from}' -> '{to}' already exists"
            )));
        } else {
            self.edges.push(Edge {
                from,
                to,
                kind,
                mappings,
            });
        }
        self
    }

    /// Route `from`'s output through `branch`
    pub fn add_branch(&mut self, from: impl Into<String>, branch: Branch) -> &mut Self {
        let from = from.into();
        if from == END {
            self.errors
                .push(GraphError::Validation("END cannot have a branch".into()));
        } else if branch.ends().is_empty() {
            self.errors.push(GraphError::Validation(format!(
                "branch of '{from}' has no end nodes"
            )));
        } else if branch.ends().contains(START) {
            self.errors
                .push(GraphError::Validation("a branch cannot end at START".into()));
        } else {
            self.branches.entry(from).or_default().push(branch);
        }
        self
    }

    fn exists(&self, key: &str) -> bool {
        key == START || key == END || self.nodes.contains_key(key)
    }

    /// Check the graph and freeze it for execution
    pub fn compile(&self, options: CompileOptions) -> Result<CompiledGraph> {
        if let Some(err) = self.errors.first() {
            return Err(err.duplicate());
        }
        options.config.validate()?;
        let trigger_mode = options.config.trigger_mode;

        self.check_structure(trigger_mode)?;
        self.check_options(&options)?;

        // types
        let mut types: TypeTable = BTreeMap::new();
        types.insert(
            START.to_string(),
            NodeTypes::known(self.input_type.clone(), self.input_type.clone()),
        );
        types.insert(
            END.to_string(),
            NodeTypes::known(self.output_type.clone(), self.output_type.clone()),
        );
        let mut passthrough_count = 0;
        for (key, node) in &self.nodes {
            let entry = NodeTypes {
                input: node.input_type().cloned(),
                output: node.output_type().cloned(),
            };
            if !entry.is_resolved() {
                passthrough_count += 1;
            }
            types.insert(key.clone(), entry);
        }

        let mut validator = GraphValidator::new(Arc::clone(&options.type_registry));
        for edge in self.edges.iter().filter(|e| e.kind == EdgeKind::Data) {
            validator.check_or_defer(&edge.from, &edge.to, &edge.mappings, &types)?;
        }
        for (from, branches) in &self.branches {
            for end in branches.iter().flat_map(|b| b.ends()) {
                validator.check_or_defer(from, end, &[], &types)?;
            }
        }
        validator.resolve(&mut types, passthrough_count)?;
        let runtime_checked = validator.runtime_checked_edges().clone();

        let resolved = |key: &str| -> Result<(DataType, DataType)> {
            match types.get(key) {
                Some(NodeTypes {
                    input: Some(i),
                    output: Some(o),
                }) => Ok((i.clone(), o.clone())),
                _ => Err(GraphError::Inference(format!(
                    "type of pass-through node '{key}' could not be inferred"
                ))),
            }
        };

        let merge = options
            .merge_registry
            .clone()
            .unwrap_or_else(MergeRegistry::global);

        // node specs
        let mut nodes = BTreeMap::new();
        let mut output_types = BTreeMap::new();
        output_types.insert(START.to_string(), self.input_type.clone());
        for (key, node) in &self.nodes {
            let (input_type, output_type) = resolved(key)?;
            output_types.insert(key.clone(), output_type.clone());
            nodes.insert(
                key.clone(),
                Arc::new(NodeSpec {
                    node: node.clone(),
                    input_type,
                    output_type,
                }),
            );
        }

        // successor and predecessor maps
        let mut data_successors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut control_successors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut skip_successors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut control_preds: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut data_preds: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for edge in &self.edges {
            let target = match edge.kind {
                EdgeKind::Data => &mut data_successors,
                EdgeKind::Control => &mut control_successors,
            };
            target.entry(edge.from.clone()).or_default().push(edge.to.clone());
            skip_successors
                .entry(edge.from.clone())
                .or_default()
                .push(edge.to.clone());
            control_preds
                .entry(edge.to.clone())
                .or_default()
                .push(edge.from.clone());
            if edge.kind == EdgeKind::Data {
                data_preds
                    .entry(edge.to.clone())
                    .or_default()
                    .push(edge.from.clone());
            }
        }
        for (from, branches) in &self.branches {
            for end in branches.iter().flat_map(|b| b.ends()) {
                skip_successors.entry(from.clone()).or_default().push(end.clone());
                control_preds.entry(end.clone()).or_default().push(from.clone());
                data_preds.entry(end.clone()).or_default().push(from.clone());
            }
        }

        // edge resolvers, one per channel
        let mut resolvers = BTreeMap::new();
        let channel_keys = self.nodes.keys().cloned().chain(std::iter::once(END.to_string()));
        for key in channel_keys {
            let input_type = if key == END {
                self.output_type.clone()
            } else {
                resolved(&key)?.0
            };
            let mut resolver = EdgeResolver::new(
                key.clone(),
                input_type,
                Arc::clone(&merge),
                Arc::clone(&options.type_registry),
            );
            for pred in data_preds.get(&key).into_iter().flatten() {
                let mappings = self
                    .edges
                    .iter()
                    .find(|e| e.from == *pred && e.to == key)
                    .map(|e| e.mappings.clone())
                    .unwrap_or_default();
                let runtime_check = runtime_checked.contains(&(pred.clone(), key.clone()));
                resolver = resolver.with_handler(
                    pred.clone(),
                    EdgeHandler {
                        mappings,
                        runtime_check,
                    },
                );
            }
            if let Some(config) = options.config.merge.get(&key) {
                resolver = resolver.with_merge_config(config.clone());
            }
            resolvers.insert(key, Arc::new(resolver));
        }

        let name = options
            .config
            .name
            .clone()
            .unwrap_or_else(|| "graph".to_string());
        let info = self.info(&name, trigger_mode, &types);
        for callback in &options.callbacks {
            callback(&info)?;
        }

        let max_steps = options.effective_max_steps(self.nodes.len());
        tracing::debug!(
            graph = %name,
            nodes = self.nodes.len(),
            edges = self.edges.len(),
            max_steps,
            "graph compiled"
        );

        Ok(CompiledGraph::new(GraphCore {
            name,
            input_type: self.input_type.clone(),
            output_type: self.output_type.clone(),
            nodes,
            data_successors,
            control_successors,
            skip_successors,
            branches: self.branches.clone(),
            control_preds,
            data_preds,
            resolvers,
            output_types,
            trigger_mode,
            max_steps,
            eager: options.effective_eager(),
            max_parallelism: options.config.max_parallelism,
            interrupt_before: options.config.interrupt_before_nodes.iter().cloned().collect(),
            interrupt_after: options.config.interrupt_after_nodes.iter().cloned().collect(),
            store: options.checkpoint_store.clone(),
            serializer: Arc::clone(&options.serializer),
            merge,
            state_generator: options.state_generator.clone(),
            info,
        }))
    }

    fn check_structure(&self, trigger_mode: TriggerMode) -> Result<()> {
        for edge in &self.edges {
            for key in [&edge.from, &edge.to] {
                if !self.exists(key) {
                    return Err(GraphError::Validation(format!(
                        "edge '{}' -> '{}' references unknown node '{key}'",
                        edge.from, edge.to
                    )));
                }
            }
        }
        for (from, branches) in &self.branches {
            if !self.exists(from) {
                return Err(GraphError::Validation(format!(
                    "branch attached to unknown node '{from}'"
                )));
            }
            for end in branches.iter().flat_map(|b| b.ends()) {
                if !self.exists(end) {
                    return Err(GraphError::Validation(format!(
                        "branch of '{from}' ends at unknown node '{end}'"
                    )));
                }
                if self.edges.iter().any(|e| e.from == *from && e.to == *end) {
                    return Err(GraphError::Validation(format!(
                        "'{from}' -> '{end}' is both an edge and a branch end"
                    )));
                }
            }
        }

        let mut incoming: BTreeSet<&str> = BTreeSet::new();
        let mut outgoing: BTreeSet<&str> = BTreeSet::new();
        let mut all_edges: Vec<(String, String)> = Vec::new();
        for edge in &self.edges {
            incoming.insert(&edge.to);
            outgoing.insert(&edge.from);
            all_edges.push((edge.from.clone(), edge.to.clone()));
        }
        for (from, branches) in &self.branches {
            outgoing.insert(from);
            for end in branches.iter().flat_map(|b| b.ends()) {
                incoming.insert(end);
                all_edges.push((from.clone(), end.clone()));
            }
        }
        if !outgoing.contains(START) {
            return Err(GraphError::Validation("START has no successors".into()));
        }
        if !incoming.contains(END) {
            return Err(GraphError::Validation("END has no predecessors".into()));
        }
        for key in self.nodes.keys() {
            if !incoming.contains(key.as_str()) {
                return Err(GraphError::Validation(format!("node '{key}' has no incoming edge")));
            }
            if !outgoing.contains(key.as_str()) {
                return Err(GraphError::Validation(format!("node '{key}' has no outgoing edge")));
            }
        }

        match trigger_mode {
            TriggerMode::AllPredecessor => {
                if let Err(cycle) = topology::topological_sort(std::iter::empty(), &all_edges) {
                    return Err(GraphError::Validation(format!(
                        "graph has a cycle through [{}]; loops need the any_predecessor trigger mode",
                        cycle.join(", ")
                    )));
                }
            }
            TriggerMode::AnyPredecessor => {
                if let Some(edge) = self.edges.iter().find(|e| e.kind == EdgeKind::Control) {
                    return Err(GraphError::Validation(format!(
                        "control edge '{}' -> '{}' needs the all_predecessor trigger mode",
                        edge.from, edge.to
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_options(&self, options: &CompileOptions) -> Result<()> {
        let lists = [
            ("interrupt_before_nodes", &options.config.interrupt_before_nodes),
            ("interrupt_after_nodes", &options.config.interrupt_after_nodes),
        ];
        for (list, nodes) in lists {
            if let Some(unknown) = nodes.iter().find(|n| !self.nodes.contains_key(*n)) {
                return Err(GraphError::Validation(format!(
                    "{list} names unknown node '{unknown}'"
                )));
            }
        }
        if let Some(unknown) = options
            .config
            .merge
            .keys()
            .find(|n| !self.nodes.contains_key(*n) && n.as_str() != END)
        {
            return Err(GraphError::Validation(format!(
                "merge config names unknown node '{unknown}'"
            )));
        }
        if options.state_generator.is_none() {
            if let Some((key, _)) = self
                .nodes
                .iter()
                .find(|(_, n)| n.pre_handler().is_some() || n.post_handler().is_some())
            {
                return Err(GraphError::Configuration(format!(
                    "node '{key}' has state handlers but the graph has no state generator"
                )));
            }
        }
        Ok(())
    }

    fn info(&self, name: &str, trigger_mode: TriggerMode, types: &TypeTable) -> GraphInfo {
        let type_name = |ty: &Option<DataType>| ty.as_ref().map(ToString::to_string).unwrap_or_default();
        GraphInfo {
            name: name.to_string(),
            trigger_mode,
            input_type: self.input_type.to_string(),
            output_type: self.output_type.to_string(),
            nodes: self
                .nodes
                .iter()
                .map(|(key, node)| {
                    let resolved = types.get(key).cloned().unwrap_or_default();
                    (
                        key.clone(),
                        NodeInfo {
                            kind: node.executor().kind(),
                            input_type: type_name(&resolved.input),
                            output_type: type_name(&resolved.output),
                            passthrough: node.is_passthrough(),
                        },
                    )
                })
                .collect(),
            edges: self
                .edges
                .iter()
                .map(|e| EdgeInfo {
                    from: e.from.clone(),
                    to: e.to.clone(),
                    kind: e.kind,
                    mappings: e.mappings.iter().map(ToString::to_string).collect(),
                })
                .collect(),
            branches: self
                .branches
                .iter()
                .map(|(from, branches)| {
                    (
                        from.clone(),
                        branches
                            .iter()
                            .map(|b| b.ends().iter().cloned().collect())
                            .collect(),
                    )
                })
                .collect(),
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
