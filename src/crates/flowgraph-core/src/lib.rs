//! # flowgraph-core - Dataflow graph execution engine
//!
//! Build a directed graph of async nodes connected by data and control edges,
//! compile it, and run it with whole values or with streams on its edges.
//! A run can stop at an interrupt and continue later from a checkpoint.
//!
//! ## Overview
//!
//! - **Two execution semantics** - DAG (`AllPredecessor`: a node waits for
//!   every predecessor, branches skip whole sub-graphs) and Pregel
//!   (`AnyPredecessor`: a node runs whenever something arrived, loops allowed)
//! - **Fan-in merge** - several predecessors feeding one node are combined by
//!   the merge function registered for the node's input type
//! - **Streams** - every edge can carry a [`StreamReader`]; fan-out copies
//!   share one buffer, fan-in merges interleave
//! - **Type checking** - edge types are checked at compile time, pass-through
//!   node types are inferred, undecidable edges are checked at run time
//! - **Interrupt / resume** - interrupt before or after nodes, from inside a
//!   node body, or from outside through a cancellation token; every stream in
//!   flight is collapsed and stored in the checkpoint
//!
//! ## Core Concepts
//!
//! ### Channels
//!
//! Each node owns a channel that buffers what its predecessors delivered and
//! decides when the node is ready:
//!
//! ```text
//!                  ┌──────────────── channel of `sink` ───────────────┐
//!   left  ──data──►│ values: {left: 1}   control: {left: ready,      │
//!   right ──data──►│         {right: 2}           right: ready}      │──► merge ──► sink
//!   gate  ──ctrl──►│                              gate: ready}       │
//!                  └──────────────────────────────────────────────────┘
//! ```
//!
//! ### Runs
//!
//! [`CompiledGraph::invoke`] and [`CompiledGraph::stream`] return a
//! [`RunOutcome`]: either the value that reached [`END`], or an
//! [`InterruptInfo`] naming where the run stopped and under which checkpoint
//! id it was stored.
//!
//! ## Quick Start
//!
//! ```rust
//! use flowgraph_core::{CompileOptions, DataType, Graph, Node, RunOptions, END, START};
//! use serde_json::{json, Value};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> flowgraph_core::Result<()> {
//! let mut graph = Graph::with_types(DataType::Int, DataType::Int);
//! graph
//!     .add_passthrough_node("source")
//!     .add_node(
//!         "double",
//!         Node::invoke(|v: Value| async move { Ok(json!(v.as_i64().unwrap_or_default() * 2)) })
//!             .with_types(DataType::Int, DataType::Int),
//!     )
//!     .add_passthrough_node("sink")
//!     .add_edge(START, "source")
//!     .add_edge("source", "double")
//!     .add_edge("double", "sink")
//!     .add_edge("sink", END);
//!
//! let compiled = graph.compile(CompileOptions::new())?;
//! let out = compiled.invoke(json!(21), RunOptions::new()).await?;
//! assert_eq!(out.completed(), Some(json!(42)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Interrupt and resume
//!
//! ```rust
//! use flowgraph_checkpoint::InMemoryCheckPointStore;
//! use flowgraph_core::{CompileOptions, Graph, Node, RunOptions, END, START};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> flowgraph_core::Result<()> {
//! let mut graph = Graph::new();
//! graph
//!     .add_node("draft", Node::invoke(|v: Value| async move { Ok(v) }))
//!     .add_node("publish", Node::invoke(|v: Value| async move { Ok(json!({ "published": v })) }))
//!     .add_edge(START, "draft")
//!     .add_edge("draft", "publish")
//!     .add_edge("publish", END);
//!
//! let compiled = graph.compile(
//!     CompileOptions::new()
//!         .with_checkpoint_store(Arc::new(InMemoryCheckPointStore::new()))
//!         .with_interrupt_after(["draft"]),
//! )?;
//!
//! let first = compiled
//!     .invoke(json!("hello"), RunOptions::new().with_checkpoint_id("doc-1"))
//!     .await?;
//! assert!(first.is_interrupted());
//!
//! let done = compiled.resume("doc-1", None, RunOptions::new()).await?;
//! assert_eq!(done.completed(), Some(json!({ "published": "hello" })));
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`graph`] | builder, `START` / `END`, compile checks |
//! | [`compiled`] | [`CompiledGraph`], [`RunOutcome`] |
//! | [`channel`] | DAG and Pregel channels, channel manager, edge resolution |
//! | [`merge`] | merge / concat registry |
//! | [`stream`] | stream reader, writer, copy and merge |
//! | [`types`] | type tokens, record and interface registry, assignability |
//! | [`validation`] | edge checks and pass-through inference |
//! | [`mapping`] | field mappings |
//! | [`task`] | concurrent node execution |
//! | [`checkpoint`] / [`interrupt`] | persisting interrupted runs |

pub mod branch;
pub mod channel;
pub mod checkpoint;
pub mod compiled;
pub mod config;
pub mod error;
pub mod graph;
pub mod interrupt;
pub mod mapping;
pub mod merge;
pub mod node;
pub mod payload;
pub mod state;
pub mod stream;
pub mod task;
pub mod topology;
pub mod types;
pub mod validation;

mod runner;

pub use branch::Branch;
pub use channel::{
    Channel, ChannelManager, ChannelRead, DagChannel, EdgeHandler, EdgeResolver, PregelChannel,
};
pub use compiled::{CompiledGraph, RunOutcome};
pub use config::{
    CompileCallback, CompileOptions, EngineConfig, RunOptions, TriggerMode, DAG_STEP_HEADROOM,
    DEFAULT_PREGEL_MAX_STEPS,
};
pub use error::{GraphError, Result};
pub use graph::{EdgeInfo, EdgeKind, Graph, GraphInfo, NodeInfo, END, START};
pub use interrupt::InterruptInfo;
pub use mapping::{FieldMapping, FieldPath};
pub use merge::{
    register_concat_func, register_merge_func, restore_stream, ConcatFn, MergeConfig, MergeFn,
    MergeRegistry,
};
pub use node::{interrupt_and_rerun, BoxFuture, Node, NodeContext, NodeExecutor};
pub use payload::Payload;
pub use state::{GraphState, StateGenerator, StateHandler, StateModifier};
pub use stream::{pipe, Frame, StreamReader, StreamWriter, TypedStreamReader};
pub use task::{TaskManager, TaskOutcome};
pub use types::{check_assignable, Assignable, DataType, RecordType, TypeRegistry};
pub use validation::{GraphValidator, NodeTypes, TypeTable};
