//! What the caller learns when a run stops early
//!
//! A run can be interrupted four ways:
//!
//! | Cause | Configured by | Reported in |
//! |-------|---------------|-------------|
//! | before a node runs | `interrupt_before_nodes` | [`InterruptInfo::before_nodes`] |
//! | after a node ran | `interrupt_after_nodes` | [`InterruptInfo::after_nodes`] |
//! | the body asks for it | [`interrupt_and_rerun`](crate::interrupt_and_rerun) | [`InterruptInfo::rerun_nodes`] |
//! | the caller cancels | [`RunOptions::interrupt`](crate::RunOptions) | [`InterruptInfo::external`] |
//!
//! In every case in-flight nodes finish first, then the run's channels,
//! pending inputs and state are stored as one checkpoint. The nodes whose
//! inputs were stored are listed in [`InterruptInfo::pending_nodes`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Details of an interrupted run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterruptInfo {
    /// Where the checkpoint was stored; `None` without a store or id
    pub checkpoint_id: Option<String>,
    pub before_nodes: Vec<String>,
    pub after_nodes: Vec<String>,
    /// Nodes that had not run yet; their inputs are stored in the checkpoint
    pub pending_nodes: Vec<String>,
    /// Nodes that asked to be rerun on resume
    pub rerun_nodes: Vec<String>,
    /// Values the rerun nodes attached to their request
    pub rerun_extra: BTreeMap<String, Value>,
    /// Graph state at the time of the interrupt
    pub state: Option<Value>,
    /// The run was cancelled through its interrupt token
    pub external: bool,
}

impl InterruptInfo {
    /// Every node named by the interrupt, without duplicates
    pub fn interrupted_nodes(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = self
            .before_nodes
            .iter()
            .chain(&self.after_nodes)
            .chain(&self.pending_nodes)
            .chain(&self.rerun_nodes)
            .map(String::as_str)
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }
}
