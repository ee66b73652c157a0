//! Error types for graph construction and execution
//!
//! Every fallible operation in this crate returns [`Result<T>`], an alias over
//! [`GraphError`]. The variants fall into the groups a caller usually needs to
//! tell apart:
//!
//! ```text
//! GraphError
//! ├── construction (surfaced by Graph::compile, never at run time)
//! │   ├── Validation            unknown node, duplicate key, bad mapping
//! │   ├── TypeMismatch          edge types can never be assigned
//! │   └── Inference             pass-through types could not be resolved
//! ├── run-time type
//! │   ├── UnsupportedMergeType  fan-in over a type with no merge function
//! │   ├── UnsupportedConcatType stream crossing with no concat function
//! │   ├── RuntimeType           value failed a deferred conformance check
//! │   ├── FieldMapping          mapped path missing in a value
//! │   └── Stream                error carried by a stream chunk
//! ├── NodeExecution             a node body failed
//! ├── Interrupted               a node body asked to stop and be rerun
//! ├── StepLimitExceeded         run used more steps than allowed
//! └── ambient                   Checkpoint, Serialization, Yaml, Io,
//!                               Configuration, Execution, Internal, Custom
//! ```
//!
//! `Interrupted` is how a node body *requests* an interrupt. The runner turns
//! it into [`RunOutcome::Interrupted`](crate::RunOutcome) so callers of
//! `invoke` never see it as a failure.
//!
//! # Matching errors
//!
//! ```rust
//! use flowgraph_core::GraphError;
//!
//! fn describe(err: &GraphError) -> &'static str {
//!     match err {
//!         GraphError::StepLimitExceeded { .. } => "runaway graph",
//!         GraphError::NodeExecution { .. } => "node failed",
//!         e if e.is_construction() => "fix the graph definition",
//!         _ => "other",
//!     }
//! }
//!
//! assert_eq!(describe(&GraphError::StepLimitExceeded { max_steps: 3 }), "runaway graph");
//! assert_eq!(describe(&GraphError::Validation("x".into())), "fix the graph definition");
//! ```

use serde_json::Value;
use thiserror::Error;

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors that can occur while building or running a graph
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure is invalid
    ///
    /// Unknown node in an edge, duplicate node key, reserved key, invalid
    /// field mapping, interrupt list naming a missing node.
    #[error("Graph validation failed: {0}")]
    Validation(String),

    /// An edge connects types that can never be assigned
    #[error("Type mismatch on edge '{from}' -> '{to}': {detail}")]
    TypeMismatch {
        from: String,
        to: String,
        detail: String,
    },

    /// Pass-through node types could not be inferred
    #[error("Type inference failed: {0}")]
    Inference(String),

    /// Fan-in reached a type with no registered merge function
    #[error("unsupported type for merge: {0}")]
    UnsupportedMergeType(String),

    /// A stream had to be collapsed for a type with no registered concat function
    #[error("unsupported type for concat: {0}")]
    UnsupportedConcatType(String),

    /// A value failed a deferred (`May`) type check at run time
    #[error("Runtime type error: {0}")]
    RuntimeType(String),

    /// A mapped field could not be read or written
    #[error("Field mapping error: {0}")]
    FieldMapping(String),

    /// Error delivered through a stream
    #[error("Stream error: {0}")]
    Stream(String),

    /// A node body failed
    #[error("Node '{node}' execution failed: {error}")]
    NodeExecution {
        /// Key of the failing node
        node: String,
        /// Error message
        error: String,
    },

    /// A node body asked the run to stop and rerun it on resume
    ///
    /// Returned by node bodies through [`interrupt_and_rerun`](crate::interrupt_and_rerun);
    /// the `node` field is filled in by the runner when left empty.
    #[error("Execution interrupted at node '{node}': {reason}")]
    Interrupted {
        node: String,
        reason: String,
        extra: Option<Value>,
    },

    /// The run needed more steps than its budget
    #[error("exceeded max run steps ({max_steps})")]
    StepLimitExceeded { max_steps: usize },

    /// Checkpoint store or serializer failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] flowgraph_checkpoint::CheckpointError),

    /// JSON conversion failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid options or configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// General execution failure not tied to a node
    #[error("Execution error: {0}")]
    Execution(String),

    /// An engine invariant did not hold; indicates a bug, not a user error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Custom application-defined error
    #[error("{0}")]
    Custom(String),
}

impl GraphError {
    /// Create a node execution error with context
    ///
    /// ```rust
    /// use flowgraph_core::GraphError;
    ///
    /// let err = GraphError::node_execution("fetch", "upstream returned 503");
    /// assert_eq!(err.to_string(), "Node 'fetch' execution failed: upstream returned 503");
    /// ```
    pub fn node_execution(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            error: error.into(),
        }
    }

    /// Create a type mismatch error for an edge
    pub fn type_mismatch(
        from: impl Into<String>,
        to: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            from: from.into(),
            to: to.into(),
            detail: detail.into(),
        }
    }

    /// Whether this error belongs to graph construction
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::TypeMismatch { .. } | Self::Inference(_)
        )
    }

    /// Whether this is a node's request to interrupt the run
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    /// Whether the run stopped on its step budget
    pub fn is_step_limit(&self) -> bool {
        matches!(self, Self::StepLimitExceeded { .. })
    }

    /// Copy of this error suitable for fan-out to several stream readers.
    ///
    /// Variants that wrap foreign error types are flattened to their message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Validation(m) => Self::Validation(m.clone()),
            Self::Inference(m) => Self::Inference(m.clone()),
            Self::UnsupportedMergeType(m) => Self::UnsupportedMergeType(m.clone()),
            Self::UnsupportedConcatType(m) => Self::UnsupportedConcatType(m.clone()),
            Self::RuntimeType(m) => Self::RuntimeType(m.clone()),
            Self::FieldMapping(m) => Self::FieldMapping(m.clone()),
            Self::Stream(m) => Self::Stream(m.clone()),
            Self::NodeExecution { node, error } => Self::node_execution(node.clone(), error.clone()),
            Self::StepLimitExceeded { max_steps } => Self::StepLimitExceeded {
                max_steps: *max_steps,
            },
            Self::Custom(m) => Self::Custom(m.clone()),
            other => Self::Stream(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_classification() {
        assert!(GraphError::Validation("x".into()).is_construction());
        assert!(GraphError::type_mismatch("a", "b", "int vs string").is_construction());
        assert!(GraphError::Inference("cycle".into()).is_construction());
        assert!(!GraphError::UnsupportedMergeType("int".into()).is_construction());
        assert!(!GraphError::StepLimitExceeded { max_steps: 1 }.is_construction());
    }

    #[test]
    fn test_step_limit_is_distinct_from_node_failure() {
        let limit = GraphError::StepLimitExceeded { max_steps: 10 };
        let node = GraphError::node_execution("a", "boom");
        assert!(limit.is_step_limit());
        assert!(!node.is_step_limit());
        assert_eq!(limit.to_string(), "exceeded max run steps (10)");
    }

    #[test]
    fn test_unsupported_merge_message() {
        let err = GraphError::UnsupportedMergeType("int".into());
        assert_eq!(err.to_string(), "unsupported type for merge: int");
    }

    #[test]
    fn test_duplicate_keeps_variant() {
        let err = GraphError::node_execution("n", "bad");
        assert!(matches!(err.duplicate(), GraphError::NodeExecution { .. }));

        let io = GraphError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(matches!(io.duplicate(), GraphError::Stream(ref m) if m.contains("disk")));
    }
}
