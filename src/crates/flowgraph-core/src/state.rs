//! Graph-local state shared by the nodes of one run
//!
//! A graph compiled with a state generator gets a fresh state value at the
//! start of every run. Node bodies reach it through
//! [`NodeContext::with_state`](crate::NodeContext::with_state); nodes may
//! also declare handlers that run around the body while holding the state:
//!
//! ```text
//!   input ──► pre-handler(input, &mut state) ──► body ──► post-handler(output, &mut state) ──► output
//! ```
//!
//! The state is stored in checkpoints and can be edited on resume with a
//! state modifier.

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;

/// Builds the initial state of a run
pub type StateGenerator = Arc<dyn Fn() -> Value + Send + Sync>;

/// Runs on a node's input before the body, or on its output after it
pub type StateHandler = Arc<dyn Fn(Value, &mut Value) -> Result<Value> + Send + Sync>;

/// Edits restored state before a resumed run continues
pub type StateModifier = Arc<dyn Fn(&mut Value) -> Result<()> + Send + Sync>;

/// Handle to the state of one run
#[derive(Debug, Clone)]
pub struct GraphState {
    inner: Arc<Mutex<Value>>,
}

impl GraphState {
    pub fn new(initial: Value) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    /// Copy of the current value
    pub fn get(&self) -> Value {
        self.inner.lock().clone()
    }

    pub fn set(&self, value: Value) {
        *self.inner.lock() = value;
    }

    /// Run `f` with exclusive access to the state
    pub fn with<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        f(&mut *self.inner.lock())
    }

    /// Run `f` on a typed view; the state is written back afterwards
    pub fn with_typed<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut guard = self.inner.lock();
        let mut typed: T = serde_json::from_value(guard.clone())?;
        let out = f(&mut typed);
        *guard = serde_json::to_value(typed)?;
        Ok(out)
    }

    /// Run a pre/post handler against the state
    pub fn apply(&self, handler: &StateHandler, value: Value) -> Result<Value> {
        let mut guard = self.inner.lock();
        handler(value, &mut *guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Counter {
        hits: u32,
    }

    #[test]
    fn test_typed_access_writes_back() {
        let state = GraphState::new(json!({"hits": 1}));
        let before = state.with_typed(|c: &mut Counter| {
            c.hits += 1;
            c.hits - 1
        });
        assert_eq!(before.unwrap(), 1);
        assert_eq!(state.get(), json!({"hits": 2}));
    }

    #[test]
    fn test_handler_sees_state() {
        let state = GraphState::new(json!({"seen": []}));
        let handler: StateHandler = Arc::new(|input: Value, state: &mut Value| {
            if let Some(seen) = state["seen"].as_array_mut() {
                seen.push(input.clone());
            }
            Ok(input)
        });
        state.apply(&handler, json!("a")).unwrap();
        state.apply(&handler, json!("b")).unwrap();
        assert_eq!(state.get(), json!({"seen": ["a", "b"]}));
    }
}
