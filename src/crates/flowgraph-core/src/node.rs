//! Node bodies and the context they run with
//!
//! A node body is an async function whose input and output may each be a
//! whole value or a stream. Four shapes exist:
//!
//! | Constructor | Input | Output |
//! |-------------|-------|--------|
//! | [`Node::invoke`] | value | value |
//! | [`Node::stream`] | value | stream |
//! | [`Node::collect`] | stream | value |
//! | [`Node::transform`] | stream | stream |
//!
//! The engine adapts between shapes: an invoked graph hands every node a
//! value and keeps values on its edges, a streamed graph keeps streams on its
//! edges. A stream is collapsed with the merge registry's concat function
//! when a value is needed; a value becomes a one-chunk stream when a stream
//! is needed.
//!
//! ```rust
//! use flowgraph_core::{DataType, Node};
//! use serde_json::{json, Value};
//!
//! let double = Node::invoke(|v: Value| async move {
//!     Ok(json!(v.as_i64().unwrap_or_default() * 2))
//! })
//! .with_types(DataType::Int, DataType::Int);
//! assert!(!double.is_passthrough());
//! ```

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::merge::MergeRegistry;
use crate::payload::Payload;
use crate::state::{GraphState, StateHandler};
use crate::stream::StreamReader;
use crate::types::DataType;

/// Boxed future returned by node bodies
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

type InvokeFn = Arc<dyn Fn(NodeContext, Value) -> BoxFuture<Value> + Send + Sync>;
type StreamFn = Arc<dyn Fn(NodeContext, Value) -> BoxFuture<StreamReader> + Send + Sync>;
type CollectFn = Arc<dyn Fn(NodeContext, StreamReader) -> BoxFuture<Value> + Send + Sync>;
type TransformFn = Arc<dyn Fn(NodeContext, StreamReader) -> BoxFuture<StreamReader> + Send + Sync>;

/// Build the error a node body returns to stop the run and be rerun on resume.
///
/// `extra` is handed back to the caller in
/// [`InterruptInfo::rerun_extra`](crate::InterruptInfo).
///
/// ```rust
/// use flowgraph_core::{interrupt_and_rerun, NodeContext};
/// use serde_json::{json, Value};
///
/// async fn approve(ctx: NodeContext, input: Value) -> flowgraph_core::Result<Value> {
///     match ctx.resume_input() {
///         Some(decision) => Ok(json!({"input": input, "decision": decision})),
///         None => Err(interrupt_and_rerun("needs approval", Some(json!({"amount": 10})))),
///     }
/// }
/// ```
pub fn interrupt_and_rerun(reason: impl Into<String>, extra: Option<Value>) -> GraphError {
    GraphError::Interrupted {
        node: String::new(),
        reason: reason.into(),
        extra,
    }
}

/// Per-invocation view a node body gets of its run
#[derive(Clone)]
pub struct NodeContext {
    node: Arc<str>,
    state: Option<GraphState>,
    resume_input: Option<Value>,
}

impl NodeContext {
    pub(crate) fn new(node: &str, state: Option<GraphState>, resume_input: Option<Value>) -> Self {
        Self {
            node: Arc::from(node),
            state,
            resume_input,
        }
    }

    /// Key of the running node
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Value passed to `resume` when this node is the one being resumed
    pub fn resume_input(&self) -> Option<&Value> {
        self.resume_input.as_ref()
    }

    pub fn is_resumed(&self) -> bool {
        self.resume_input.is_some()
    }

    pub fn state(&self) -> Option<&GraphState> {
        self.state.as_ref()
    }

    /// Run `f` with exclusive access to the graph state
    pub fn with_state<R>(&self, f: impl FnOnce(&mut Value) -> R) -> Result<R> {
        self.state
            .as_ref()
            .map(|s| s.with(f))
            .ok_or_else(|| GraphError::Configuration("graph was compiled without a state generator".into()))
    }

    /// Like [`with_state`](Self::with_state) over a typed view
    pub fn with_state_typed<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
    {
        match &self.state {
            Some(state) => state.with_typed(f),
            None => Err(GraphError::Configuration(
                "graph was compiled without a state generator".into(),
            )),
        }
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", &self.node)
            .field("has_state", &self.state.is_some())
            .field("resume_input", &self.resume_input)
            .finish()
    }
}

/// A node body in one of its four shapes
#[derive(Clone)]
pub enum NodeExecutor {
    Invoke(InvokeFn),
    Stream(StreamFn),
    Collect(CollectFn),
    Transform(TransformFn),
    /// Output is the input
    Passthrough,
}

impl NodeExecutor {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invoke(_) => "invoke",
            Self::Stream(_) => "stream",
            Self::Collect(_) => "collect",
            Self::Transform(_) => "transform",
            Self::Passthrough => "passthrough",
        }
    }

    /// Run the body, adapting `input` to its shape and the output to the run's shape
    pub async fn execute(
        &self,
        ctx: NodeContext,
        input: Payload,
        types: (&DataType, &DataType),
        registry: &MergeRegistry,
        want_stream: bool,
    ) -> Result<Payload> {
        let (input_type, output_type) = types;
        let output = match self {
            Self::Passthrough => input,
            Self::Invoke(f) => Payload::Value(f(ctx, input.into_value(input_type, registry).await?).await?),
            Self::Stream(f) => Payload::Stream(f(ctx, input.into_value(input_type, registry).await?).await?),
            Self::Collect(f) => Payload::Value(f(ctx, input.into_stream()).await?),
            Self::Transform(f) => Payload::Stream(f(ctx, input.into_stream()).await?),
        };
        if want_stream {
            Ok(Payload::Stream(output.into_stream()))
        } else {
            Ok(Payload::Value(output.into_value(output_type, registry).await?))
        }
    }
}

impl fmt::Debug for NodeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// A graph node: body, declared types and optional state handlers
#[derive(Clone, Debug)]
pub struct Node {
    executor: NodeExecutor,
    input_type: Option<DataType>,
    output_type: Option<DataType>,
    pre_handler: Option<HandlerSlot>,
    post_handler: Option<HandlerSlot>,
}

#[derive(Clone)]
struct HandlerSlot(StateHandler);

impl fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StateHandler")
    }
}

impl Node {
    fn from_executor(executor: NodeExecutor) -> Self {
        Self {
            executor,
            input_type: Some(DataType::Any),
            output_type: Some(DataType::Any),
            pre_handler: None,
            post_handler: None,
        }
    }

    /// Value in, value out
    pub fn invoke<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::invoke_with_context(move |_ctx, input| f(input))
    }

    pub fn invoke_with_context<F, Fut>(f: F) -> Self
    where
        F: Fn(NodeContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::from_executor(NodeExecutor::Invoke(Arc::new(
            move |ctx: NodeContext, input: Value| -> BoxFuture<Value> { Box::pin(f(ctx, input)) },
        )))
    }

    /// Value in, stream out
    pub fn stream<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StreamReader>> + Send + 'static,
    {
        Self::stream_with_context(move |_ctx, input| f(input))
    }

    pub fn stream_with_context<F, Fut>(f: F) -> Self
    where
        F: Fn(NodeContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StreamReader>> + Send + 'static,
    {
        Self::from_executor(NodeExecutor::Stream(Arc::new(
            move |ctx: NodeContext, input: Value| -> BoxFuture<StreamReader> { Box::pin(f(ctx, input)) },
        )))
    }

    /// Stream in, value out
    pub fn collect<F, Fut>(f: F) -> Self
    where
        F: Fn(StreamReader) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::collect_with_context(move |_ctx, input| f(input))
    }

    pub fn collect_with_context<F, Fut>(f: F) -> Self
    where
        F: Fn(NodeContext, StreamReader) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::from_executor(NodeExecutor::Collect(Arc::new(
            move |ctx: NodeContext, input: StreamReader| -> BoxFuture<Value> { Box::pin(f(ctx, input)) },
        )))
    }

    /// Stream in, stream out
    pub fn transform<F, Fut>(f: F) -> Self
    where
        F: Fn(StreamReader) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StreamReader>> + Send + 'static,
    {
        Self::transform_with_context(move |_ctx, input| f(input))
    }

    pub fn transform_with_context<F, Fut>(f: F) -> Self
    where
        F: Fn(NodeContext, StreamReader) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StreamReader>> + Send + 'static,
    {
        Self::from_executor(NodeExecutor::Transform(Arc::new(
            move |ctx: NodeContext, input: StreamReader| -> BoxFuture<StreamReader> { Box::pin(f(ctx, input)) },
        )))
    }

    /// Forwards its input; its type is inferred from its neighbours
    pub fn passthrough() -> Self {
        Self {
            input_type: None,
            output_type: None,
            ..Self::from_executor(NodeExecutor::Passthrough)
        }
    }

    pub fn with_input_type(mut self, ty: DataType) -> Self {
        self.input_type = Some(ty);
        self
    }

    pub fn with_output_type(mut self, ty: DataType) -> Self {
        self.output_type = Some(ty);
        self
    }

    pub fn with_types(self, input: DataType, output: DataType) -> Self {
        self.with_input_type(input).with_output_type(output)
    }

    /// Run `handler(input, &mut state)` before the body; its result is the body's input
    pub fn with_state_pre_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Value, &mut Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.pre_handler = Some(HandlerSlot(Arc::new(handler)));
        self
    }

    /// Run `handler(output, &mut state)` after the body; its result is the node's output
    pub fn with_state_post_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Value, &mut Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.post_handler = Some(HandlerSlot(Arc::new(handler)));
        self
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self.executor, NodeExecutor::Passthrough)
    }

    pub fn executor(&self) -> &NodeExecutor {
        &self.executor
    }

    pub fn input_type(&self) -> Option<&DataType> {
        self.input_type.as_ref()
    }

    pub fn output_type(&self) -> Option<&DataType> {
        self.output_type.as_ref()
    }

    pub fn pre_handler(&self) -> Option<&StateHandler> {
        self.pre_handler.as_ref().map(|h| &h.0)
    }

    pub fn post_handler(&self) -> Option<&StateHandler> {
        self.post_handler.as_ref().map(|h| &h.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn ctx() -> NodeContext {
        NodeContext::new("n", None, None)
    }

    #[tokio::test]
    async fn test_invoke_body_in_stream_run() {
        let node = Node::invoke(|v: Value| async move { Ok(json!(format!("{}!", v.as_str().unwrap_or("")))) })
            .with_types(DataType::String, DataType::String);
        let registry = MergeRegistry::with_defaults();
        let input = Payload::Stream(StreamReader::from_vec(vec![json!("he"), json!("y")]));
        let out = node
            .executor()
            .execute(ctx(), input, (&DataType::String, &DataType::String), &registry, true)
            .await
            .unwrap();
        let chunks = out.into_stream().collect_values().await.unwrap();
        assert_eq!(chunks, vec![json!("hey!")]);
    }

    #[tokio::test]
    async fn test_transform_body_in_invoke_run() {
        let node = Node::transform(|s: StreamReader| async move {
            Ok(s.convert(|v| Ok(Some(json!(v.as_i64().unwrap_or(0) + 1)))))
        });
        let registry = MergeRegistry::with_defaults();
        let out = node
            .executor()
            .execute(ctx(), Payload::Value(json!(41)), (&DataType::Int, &DataType::Int), &registry, false)
            .await
            .unwrap();
        assert_eq!(out.as_value(), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_stream_body_output_collected() {
        let node = Node::stream(|v: Value| async move {
            let n = v.as_i64().unwrap_or(0);
            Ok(StreamReader::from_stream(
                futures::stream::iter(0..n).map(|i| Ok(json!([i]))),
            ))
        });
        let registry = MergeRegistry::with_defaults();
        let out = node
            .executor()
            .execute(
                ctx(),
                Payload::Value(json!(3)),
                (&DataType::Int, &DataType::list(DataType::Int)),
                &registry,
                false,
            )
            .await
            .unwrap();
        assert_eq!(out.as_value(), Some(&json!([0, 1, 2])));
    }

    #[test]
    fn test_context_without_state() {
        let err = ctx().with_state(|_| ()).unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
        assert!(!ctx().is_resumed());
    }

    #[test]
    fn test_interrupt_error_shape() {
        let err = interrupt_and_rerun("wait", Some(json!(1)));
        assert!(err.is_interrupt());
        match err {
            GraphError::Interrupted { node, extra, .. } => {
                assert!(node.is_empty());
                assert_eq!(extra, Some(json!(1)));
            }
            _ => unreachable!(),
        }
    }
}
