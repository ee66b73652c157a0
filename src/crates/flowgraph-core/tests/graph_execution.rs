//! End-to-end runs of compiled graphs: value and stream mode, fan-in,
//! branches, loops, limits and failures.

use flowgraph_core::{
    Branch, CompileOptions, DataType, FieldMapping, Frame, Graph, GraphError, MergeConfig, Node,
    RunOptions, StreamReader, TriggerMode, END, START,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn double() -> Node {
    Node::invoke(|v: Value| async move { Ok(json!(v.as_i64().unwrap_or_default() * 2)) })
        .with_types(DataType::Int, DataType::Int)
}

/// START -> source -> double -> sink -> END
fn pipeline() -> Graph {
    let mut graph = Graph::with_types(DataType::Int, DataType::Int);
    graph
        .add_passthrough_node("source")
        .add_node("double", double())
        .add_passthrough_node("sink")
        .add_edge(START, "source")
        .add_edge("source", "double")
        .add_edge("double", "sink")
        .add_edge("sink", END);
    graph
}

#[tokio::test]
async fn test_pipeline_invoke() {
    let compiled = pipeline().compile(CompileOptions::new()).unwrap();
    let out = compiled.invoke(json!(21), RunOptions::new()).await.unwrap();
    assert_eq!(out.completed(), Some(json!(42)));
}

#[tokio::test]
async fn test_pipeline_stream() {
    let compiled = pipeline().compile(CompileOptions::new()).unwrap();
    let out = compiled.stream(json!(21), RunOptions::new()).await.unwrap();
    let chunks = out.completed().unwrap().collect_values().await.unwrap();
    assert_eq!(chunks, vec![json!(42)]);
}

#[tokio::test]
async fn test_stream_node_output_collapsed_for_invoke() {
    let mut graph = Graph::with_types(DataType::String, DataType::String);
    graph
        .add_node(
            "spell",
            Node::stream(|v: Value| async move {
                let word = v.as_str().unwrap_or_default().to_string();
                let chunks = word.chars().map(|c| json!(c.to_string())).collect();
                Ok(flowgraph_core::StreamReader::from_vec(chunks))
            })
            .with_types(DataType::String, DataType::String),
        )
        .add_edge(START, "spell")
        .add_edge("spell", END);
    let compiled = graph.compile(CompileOptions::new()).unwrap();

    let value = compiled.invoke(json!("abc"), RunOptions::new()).await.unwrap();
    assert_eq!(value.completed(), Some(json!("abc")));

    let streamed = compiled.stream(json!("abc"), RunOptions::new()).await.unwrap();
    let chunks = streamed.completed().unwrap().collect_values().await.unwrap();
    assert_eq!(chunks, vec![json!("a"), json!("b"), json!("c")]);
}

#[tokio::test]
async fn test_fan_in_merges_maps() {
    let mut graph = Graph::new();
    graph
        .add_node("left", Node::invoke(|_| async { Ok(json!({"left": 1})) }))
        .add_node("right", Node::invoke(|_| async { Ok(json!({"right": 2})) }))
        .add_edge(START, "left")
        .add_edge(START, "right")
        .add_edge("left", END)
        .add_edge("right", END);
    let compiled = graph.compile(CompileOptions::new()).unwrap();
    let out = compiled.invoke(json!(null), RunOptions::new()).await.unwrap();
    assert_eq!(out.completed(), Some(json!({"left": 1, "right": 2})));
}

#[tokio::test]
async fn test_fan_in_duplicate_key_fails() {
    let mut graph = Graph::new();
    graph
        .add_node("left", Node::invoke(|_| async { Ok(json!({"k": 1})) }))
        .add_node("right", Node::invoke(|_| async { Ok(json!({"k": 2})) }))
        .add_edge(START, "left")
        .add_edge(START, "right")
        .add_edge("left", END)
        .add_edge("right", END);
    let compiled = graph.compile(CompileOptions::new()).unwrap();
    let err = compiled.invoke(json!(null), RunOptions::new()).await.unwrap_err();
    assert!(matches!(err, GraphError::Execution(_)));
}

#[tokio::test]
async fn test_fan_in_without_merge_function() {
    let mut graph = Graph::with_types(DataType::Int, DataType::Int);
    graph
        .add_node("a", double())
        .add_node("b", double())
        .add_edge(START, "a")
        .add_edge(START, "b")
        .add_edge("a", END)
        .add_edge("b", END);
    let compiled = graph.compile(CompileOptions::new()).unwrap();
    let err = compiled.invoke(json!(1), RunOptions::new()).await.unwrap_err();
    assert!(matches!(err, GraphError::UnsupportedMergeType(_)));
}

#[tokio::test]
async fn test_control_edge_orders_without_data() {
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let log = |name: &'static str, order: Arc<parking_lot::Mutex<Vec<&'static str>>>| {
        Node::invoke(move |v: Value| {
            let order = Arc::clone(&order);
            async move {
                if name == "slow" {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                order.lock().push(name);
                Ok(v)
            }
        })
    };
    let mut graph = Graph::new();
    graph
        .add_node("slow", log("slow", Arc::clone(&order)))
        .add_node("after", log("after", Arc::clone(&order)))
        .add_edge(START, "slow")
        .add_edge(START, "after")
        .add_control_edge("slow", "after")
        .add_edge("after", END);
    let compiled = graph.compile(CompileOptions::new()).unwrap();
    let out = compiled.invoke(json!("x"), RunOptions::new()).await.unwrap();
    assert_eq!(out.completed(), Some(json!("x")));
    assert_eq!(*order.lock(), vec!["slow", "after"]);
}

#[tokio::test]
async fn test_branch_skips_unpicked_path() {
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let mut graph = Graph::with_types(DataType::Int, DataType::String);
    graph
        .add_passthrough_node("router")
        .add_node(
            "small",
            Node::invoke(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!("small")) }
            })
            .with_types(DataType::Int, DataType::String),
        )
        .add_node(
            "large",
            Node::invoke(|_| async { Ok(json!("large")) }).with_types(DataType::Int, DataType::String),
        )
        .add_edge(START, "router")
        .add_branch(
            "router",
            Branch::new(["small", "large"], |v| {
                Ok(if v.as_i64().unwrap_or(0) > 10 { "large" } else { "small" }.to_string())
            }),
        )
        .add_edge("small", END)
        .add_edge("large", END);
    let compiled = graph.compile(CompileOptions::new()).unwrap();

    let out = compiled.invoke(json!(42), RunOptions::new()).await.unwrap();
    assert_eq!(out.completed(), Some(json!("large")));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_branch_skipping_end_fails() {
    let mut graph = Graph::new();
    graph
        .add_node("a", Node::invoke(|v: Value| async move { Ok(v) }))
        .add_node("b", Node::invoke(|v: Value| async move { Ok(v) }))
        .add_edge(START, "a")
        .add_branch("a", Branch::new(["b"], |_| Ok("b".to_string())))
        .add_branch("b", Branch::multi([END], |_| Ok(vec![])));
    let compiled = graph.compile(CompileOptions::new()).unwrap();
    let err = compiled.invoke(json!(1), RunOptions::new()).await.unwrap_err();
    assert!(err.to_string().contains("END was skipped"));
}

#[tokio::test]
async fn test_field_mapping_on_edge() {
    let mut graph = Graph::new();
    graph
        .add_node(
            "profile",
            Node::invoke(|_| async { Ok(json!({"user": {"name": "ada", "age": 36}})) }),
        )
        .add_node("greet", Node::invoke(|v: Value| async move {
            Ok(json!(format!("hello {}", v["name"].as_str().unwrap_or("?"))))
        }))
        .add_edge(START, "profile")
        .add_edge_with_mappings("profile", "greet", vec![FieldMapping::map_field("user.name", "name")])
        .add_edge("greet", END);
    let compiled = graph.compile(CompileOptions::new()).unwrap();
    let out = compiled.invoke(json!(null), RunOptions::new()).await.unwrap();
    assert_eq!(out.completed(), Some(json!("hello ada")));
}

#[tokio::test]
async fn test_runtime_type_check_on_untyped_edge() {
    let mut graph = Graph::new();
    graph
        .add_node("loose", Node::invoke(|_| async { Ok(json!("not a number")) }))
        .add_node("strict", double())
        .add_edge(START, "loose")
        .add_edge("loose", "strict")
        .add_edge("strict", END);
    let compiled = graph.compile(CompileOptions::new()).unwrap();
    let err = compiled.invoke(json!(null), RunOptions::new()).await.unwrap_err();
    assert!(matches!(err, GraphError::RuntimeType(_)));
}

#[tokio::test]
async fn test_pregel_loop_until_condition() {
    let mut graph = Graph::with_types(DataType::Int, DataType::Int);
    graph
        .add_node(
            "inc",
            Node::invoke(|v: Value| async move { Ok(json!(v.as_i64().unwrap_or_default() + 1)) })
                .with_types(DataType::Int, DataType::Int),
        )
        .add_edge(START, "inc")
        .add_branch(
            "inc",
            Branch::new(["inc", END], |v| {
                Ok(if v.as_i64().unwrap_or_default() < 5 { "inc" } else { END }.to_string())
            }),
        );
    let compiled = graph
        .compile(CompileOptions::new().with_trigger_mode(TriggerMode::AnyPredecessor))
        .unwrap();
    let out = compiled.invoke(json!(0), RunOptions::new()).await.unwrap();
    assert_eq!(out.completed(), Some(json!(5)));
}

#[tokio::test]
async fn test_step_limit_exceeded() {
    let mut graph = Graph::new();
    graph
        .add_node("spin", Node::invoke(|v: Value| async move { Ok(v) }))
        .add_edge(START, "spin")
        .add_branch("spin", Branch::new(["spin", END], |_| Ok("spin".to_string())));
    let compiled = graph
        .compile(
            CompileOptions::new()
                .with_trigger_mode(TriggerMode::AnyPredecessor)
                .with_max_run_steps(3),
        )
        .unwrap();
    let err = compiled.invoke(json!(1), RunOptions::new()).await.unwrap_err();
    assert!(err.is_step_limit());
    assert!(matches!(err, GraphError::StepLimitExceeded { max_steps: 3 }));
}

#[tokio::test]
async fn test_node_error_drains_siblings() {
    let finished = Arc::new(AtomicUsize::new(0));
    let marker = Arc::clone(&finished);
    let mut graph = Graph::new();
    graph
        .add_node(
            "fail",
            Node::invoke(|_| async { Err(GraphError::node_execution("fail", "boom")) }),
        )
        .add_node(
            "slow",
            Node::invoke(move |v: Value| {
                let marker = Arc::clone(&marker);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    marker.fetch_add(1, Ordering::SeqCst);
                    Ok(v)
                }
            }),
        )
        .add_edge(START, "fail")
        .add_edge(START, "slow")
        .add_edge("fail", END)
        .add_edge("slow", END);
    let compiled = graph.compile(CompileOptions::new()).unwrap();
    let err = compiled.invoke(json!(1), RunOptions::new()).await.unwrap_err();
    assert!(matches!(err, GraphError::NodeExecution { ref node, .. } if node == "fail"));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_max_parallelism_bounds_concurrent_bodies() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new();
    for i in 0..4 {
        let key = format!("worker{i}");
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        let out_key = key.clone();
        graph
            .add_node(
                key.clone(),
                Node::invoke(move |_| {
                    let current = Arc::clone(&current);
                    let peak = Arc::clone(&peak);
                    let out_key = out_key.clone();
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!({ out_key: true }))
                    }
                }),
            )
            .add_edge(START, key.clone())
            .add_edge(key, END);
    }
    let compiled = graph
        .compile(CompileOptions::new().with_max_parallelism(2))
        .unwrap();
    let out = compiled.invoke(json!(null), RunOptions::new()).await.unwrap();
    assert_eq!(out.completed().unwrap().as_object().map(|m| m.len()), Some(4));
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_eager_mode_matches_wait_all() {
    for eager in [false, true] {
        let compiled = pipeline()
            .compile(CompileOptions::new().with_eager(eager))
            .unwrap();
        let out = compiled.invoke(json!(5), RunOptions::new()).await.unwrap();
        assert_eq!(out.completed(), Some(json!(10)), "eager = {eager}");
    }
}

#[tokio::test]
async fn test_state_handlers_and_context() {
    let mut graph = Graph::new();
    graph
        .add_node(
            "first",
            Node::invoke(|v: Value| async move { Ok(v) }).with_state_post_handler(
                |out: Value, state: &mut Value| {
                    if let Some(seen) = state["seen"].as_array_mut() {
                        seen.push(json!("first"));
                    }
                    Ok(out)
                },
            ),
        )
        .add_node(
            "second",
            Node::invoke_with_context(|ctx, v: Value| async move {
                let seen = ctx.with_state(|s| s["seen"].clone())?;
                Ok::<_, GraphError>(json!({"input": v, "seen": seen}))
            })
            .with_state_pre_handler(|input: Value, state: &mut Value| {
                if let Some(seen) = state["seen"].as_array_mut() {
                    seen.push(json!("second:pre"));
                }
                Ok(input)
            }),
        )
        .add_edge(START, "first")
        .add_edge("first", "second")
        .add_edge("second", END);
    let compiled = graph
        .compile(CompileOptions::new().with_state_generator(|| json!({"seen": []})))
        .unwrap();
    let out = compiled.invoke(json!(7), RunOptions::new()).await.unwrap();
    assert_eq!(
        out.completed(),
        Some(json!({"input": 7, "seen": ["first", "second:pre"]}))
    );
}

#[tokio::test]
async fn test_no_state_generator_is_reported_to_body() {
    let mut graph = Graph::new();
    graph
        .add_node(
            "peek",
            Node::invoke_with_context(|ctx, _v: Value| async move { ctx.with_state(|s| s.clone()) }),
        )
        .add_edge(START, "peek")
        .add_edge("peek", END);
    let compiled = graph.compile(CompileOptions::new()).unwrap();
    let err = compiled.invoke(json!(1), RunOptions::new()).await.unwrap_err();
    assert!(matches!(err, GraphError::Configuration(_)));
}

#[tokio::test]
async fn test_compiled_graph_is_reusable_concurrently() {
    let compiled = pipeline().compile(CompileOptions::new().with_name("doubler")).unwrap();
    assert_eq!(compiled.name(), "doubler");
    let runs = (0..8).map(|i| {
        let compiled = compiled.clone();
        tokio::spawn(async move { compiled.invoke(json!(i), RunOptions::new()).await })
    });
    for (i, run) in runs.enumerate() {
        let out = run.await.unwrap().unwrap();
        assert_eq!(out.completed(), Some(json!(i as i64 * 2)));
    }
}

/// Two streaming sources fanned into a transform that reports, per source,
/// how many chunks it had delivered when its end-of-stream marker arrived
fn tagged_fan_in() -> Graph {
    let source = |name: &'static str| {
        Node::stream(move |_: Value| async move {
            Ok(StreamReader::from_vec(
                (0..3).map(|n| json!({ "from": name, "n": n })).collect(),
            ))
        })
    };
    let mut graph = Graph::new();
    graph
        .add_node("left", source("left"))
        .add_node("right", source("right"))
        .add_node(
            "consumer",
            Node::transform(|mut input: StreamReader| async move {
                let mut seen: BTreeMap<String, usize> = BTreeMap::new();
                let mut ended = serde_json::Map::new();
                while let Some(frame) = input.recv_frame().await {
                    match frame? {
                        Frame::Chunk(chunk) => {
                            let from = chunk["from"].as_str().unwrap_or_default().to_string();
                            if ended.contains_key(&from) {
                                return Err(GraphError::Execution(format!("chunk from '{from}' after its end")));
                            }
                            *seen.entry(from).or_default() += 1;
                        }
                        Frame::SourceEof(name) => {
                            let count = seen.get(&name).copied().unwrap_or_default();
                            ended.insert(name, json!(count));
                        }
                    }
                }
                Ok(StreamReader::single(Value::Object(ended)))
            }),
        )
        .add_edge(START, "left")
        .add_edge(START, "right")
        .add_edge("left", "consumer")
        .add_edge("right", "consumer")
        .add_edge("consumer", END);
    graph
}

#[tokio::test]
async fn test_fan_in_stream_reports_source_eof_per_predecessor() {
    let compiled = tagged_fan_in()
        .compile(CompileOptions::new().with_merge_config(
            "consumer",
            MergeConfig {
                stream_merge_with_source_eof: true,
            },
        ))
        .unwrap();
    let out = compiled.stream(json!(null), RunOptions::new()).await.unwrap();
    let chunks = out.completed().unwrap().collect_values().await.unwrap();
    assert_eq!(chunks, vec![json!({"left": 3, "right": 3})]);

    let plain = tagged_fan_in().compile(CompileOptions::new()).unwrap();
    let out = plain.stream(json!(null), RunOptions::new()).await.unwrap();
    let chunks = out.completed().unwrap().collect_values().await.unwrap();
    assert_eq!(chunks, vec![json!({})]);
}
