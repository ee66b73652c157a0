//! Persistable snapshot of an interrupted run
//!
//! A [`CheckpointRecord`] is everything the engine needs to re-enter its
//! scheduler loop at the point where a run stopped:
//!
//! ```text
//! CheckpointRecord
//! ├── channels     per-node buffered values + dependency states
//! ├── inputs       drained inputs of nodes that were ready but did not run
//! ├── rerun_nodes  nodes whose bodies asked to be interrupted and rerun
//! ├── state        graph-local state, if the graph has one
//! └── step         steps already consumed from the run budget
//! ```
//!
//! Streaming values never reach this module: the engine concatenates them
//! before building the record and re-creates single-chunk streams on restore.
//! A stored `None` stands for a stream that ended without producing a chunk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::{CheckpointError, Result};

/// Current record layout version
pub const RECORD_VERSION: u32 = 1;

/// A JSON value that survives both text and binary serializers.
///
/// Self-describing formats get the value as-is. Binary formats such as bincode
/// cannot deserialize an untyped JSON tree, so there the value travels as its
/// JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedValue(pub Value);

impl PersistedValue {
    pub fn into_inner(self) -> Value {
        self.0
    }
}

impl From<Value> for PersistedValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl Serialize for PersistedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            self.0.serialize(serializer)
        } else {
            let text = serde_json::to_string(&self.0).map_err(serde::ser::Error::custom)?;
            serializer.serialize_str(&text)
        }
    }
}

impl<'de> Deserialize<'de> for PersistedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            Value::deserialize(deserializer).map(PersistedValue)
        } else {
            let text = String::deserialize(deserializer)?;
            serde_json::from_str(&text)
                .map(PersistedValue)
                .map_err(serde::de::Error::custom)
        }
    }
}

/// State of one control dependency of a DAG channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyState {
    Waiting,
    Ready,
    Skipped,
}

/// Which channel implementation produced a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelFlavor {
    Dag,
    Pregel,
}

/// Whether the interrupted run was producing values or streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Invoke,
    Stream,
}

impl RunMode {
    pub fn is_stream(self) -> bool {
        matches!(self, Self::Stream)
    }
}

/// Buffered values and dependency bookkeeping of one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub flavor: ChannelFlavor,
    /// Values by predecessor key; `None` is an empty stream
    #[serde(default)]
    pub values: BTreeMap<String, Option<PersistedValue>>,
    /// Control dependency states (DAG only)
    #[serde(default)]
    pub control: BTreeMap<String, DependencyState>,
    /// Data dependency received flags (DAG only)
    #[serde(default)]
    pub data: BTreeMap<String, bool>,
    #[serde(default)]
    pub skipped: bool,
}

impl ChannelSnapshot {
    pub fn new(flavor: ChannelFlavor) -> Self {
        Self {
            flavor,
            values: BTreeMap::new(),
            control: BTreeMap::new(),
            data: BTreeMap::new(),
            skipped: false,
        }
    }
}

/// Snapshot of an interrupted run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub mode: RunMode,
    /// Steps consumed before the interrupt
    pub step: usize,
    pub channels: BTreeMap<String, ChannelSnapshot>,
    /// Inputs of nodes that will be dispatched first on resume
    pub inputs: BTreeMap<String, Option<PersistedValue>>,
    pub state: Option<PersistedValue>,
    pub interrupted_before: Vec<String>,
    pub interrupted_after: Vec<String>,
    pub rerun_nodes: Vec<String>,
    /// Extra payload attached by nodes that requested a rerun
    #[serde(default)]
    pub rerun_extra: BTreeMap<String, PersistedValue>,
    /// Nodes whose stored input already went through their state pre-handler
    #[serde(default)]
    pub skip_pre_handler: BTreeSet<String>,
}

impl CheckpointRecord {
    pub fn new(mode: RunMode, step: usize) -> Self {
        Self {
            version: RECORD_VERSION,
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            mode,
            step,
            channels: BTreeMap::new(),
            inputs: BTreeMap::new(),
            state: None,
            interrupted_before: Vec::new(),
            interrupted_after: Vec::new(),
            rerun_nodes: Vec::new(),
            rerun_extra: BTreeMap::new(),
            skip_pre_handler: BTreeSet::new(),
        }
    }

    /// Reject records written by an incompatible layout
    pub fn check_version(&self) -> Result<()> {
        if self.version != RECORD_VERSION {
            return Err(CheckpointError::Invalid(format!(
                "record version {} is not supported (expected {})",
                self.version, RECORD_VERSION
            )));
        }
        Ok(())
    }

    /// Nodes that had not run when the record was taken
    pub fn pending_nodes(&self) -> impl Iterator<Item = &String> {
        self.inputs.keys()
    }
}
