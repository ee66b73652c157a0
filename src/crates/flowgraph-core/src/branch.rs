//! Conditional routing out of a node
//!
//! A branch inspects the output of the node it is attached to and picks one
//! or more of its declared end nodes. Picked ends receive the output like over
//! a data edge; the others are skipped, and the skip spreads to every node
//! that can only be reached through them.

use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{GraphError, Result};

type Condition = Arc<dyn Fn(&Value) -> Result<Vec<String>> + Send + Sync>;

/// Routing decision attached to a node
#[derive(Clone)]
pub struct Branch {
    condition: Condition,
    ends: BTreeSet<String>,
}

impl Branch {
    /// Route to exactly one of `ends`
    pub fn new<I, S, F>(ends: I, condition: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Value) -> Result<String> + Send + Sync + 'static,
    {
        Self::multi(ends, move |value| condition(value).map(|end| vec![end]))
    }

    /// Route to any subset of `ends`
    pub fn multi<I, S, F>(ends: I, condition: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Value) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        Self {
            condition: Arc::new(condition),
            ends: ends.into_iter().map(Into::into).collect(),
        }
    }

    pub fn ends(&self) -> &BTreeSet<String> {
        &self.ends
    }

    /// Evaluate the condition; returns `(picked, skipped)` ends
    pub fn select(&self, from: &str, output: &Value) -> Result<(Vec<String>, Vec<String>)> {
        let picked: BTreeSet<String> = (self.condition)(output)?.into_iter().collect();
        if let Some(unknown) = picked.iter().find(|p| !self.ends.contains(*p)) {
            return Err(GraphError::Execution(format!(
                "branch of '{from}' picked '{unknown}', which is not one of its ends"
            )));
        }
        let skipped = self.ends.difference(&picked).cloned().collect();
        Ok((picked.into_iter().collect(), skipped))
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch").field("ends", &self.ends).finish()
    }
}
