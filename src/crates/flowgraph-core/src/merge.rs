//! Fan-in merge and stream concatenation registry
//!
//! Two kinds of functions are looked up by type:
//!
//! - **merge**: combines the values several predecessors delivered to one
//!   node (`N` values of one type into one value);
//! - **concat**: collapses the chunks of a stream into one value, whenever a
//!   stream has to cross into value form (invoke-style nodes in a streaming
//!   run, branch conditions, checkpoints).
//!
//! Lookup walks from the most to the least specific key: the declared type's
//! display name (`list<int>`, `Order`), its kind (`list`, `record`), then the
//! kind of the first runtime value (`map`, `int`, ...). Defaults cover map
//! merge (key-disjoint), list append and string concat. Map chunks with no
//! registered concat are combined per key, each field resolved again through
//! the same registry. Anything else fails with
//! [`GraphError::UnsupportedMergeType`] / [`GraphError::UnsupportedConcatType`]
//! at first use.
//!
//! ```rust
//! use flowgraph_core::{DataType, MergeRegistry};
//! use serde_json::json;
//!
//! let registry = MergeRegistry::with_defaults();
//! registry.register_merge_func_typed::<i64, _>(&DataType::Int, |xs| Ok(xs.into_iter().sum()));
//!
//! let sum = registry.merge_values(&DataType::Int, vec![json!(1), json!(2), json!(3)]).unwrap();
//! assert_eq!(sum, json!(6));
//! ```

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::{GraphError, Result};
use crate::payload::Payload;
use crate::stream::StreamReader;
use crate::types::DataType;

/// Combines values of one type into one value
pub type MergeFn = Arc<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;

/// Combines stream chunks of one type into one value
pub type ConcatFn = Arc<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;

/// How a node's fan-in streams are merged
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct MergeConfig {
    /// Emit a `SourceEof(predecessor)` frame as each source stream ends
    #[serde(default)]
    pub stream_merge_with_source_eof: bool,
}

static GLOBAL: OnceLock<Arc<MergeRegistry>> = OnceLock::new();

/// Type-keyed merge and concat functions
pub struct MergeRegistry {
    merge_funcs: RwLock<HashMap<String, MergeFn>>,
    concat_funcs: RwLock<HashMap<String, ConcatFn>>,
}

impl MergeRegistry {
    /// Registry with no functions at all
    pub fn empty() -> Self {
        Self {
            merge_funcs: RwLock::new(HashMap::new()),
            concat_funcs: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the built-in map, list and string functions
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.insert_merge("map", Arc::new(merge_maps));
        registry.insert_merge("list", Arc::new(append_lists));
        registry.insert_concat("string", Arc::new(concat_strings));
        registry.insert_concat("list", Arc::new(append_lists));
        registry
    }

    /// Process-wide registry used by graphs compiled without their own.
    ///
    /// Registration is append-only and thread-safe; it is initialised with the
    /// defaults on first access.
    pub fn global() -> Arc<MergeRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MergeRegistry::with_defaults())))
    }

    fn insert_merge(&self, key: &str, f: MergeFn) {
        self.merge_funcs.write().insert(key.to_string(), f);
    }

    fn insert_concat(&self, key: &str, f: ConcatFn) {
        self.concat_funcs.write().insert(key.to_string(), f);
    }

    /// Register a fan-in merge for `ty` (replaces an earlier one)
    pub fn register_merge_func<F>(&self, ty: &DataType, f: F)
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.insert_merge(&ty.to_string(), Arc::new(f));
    }

    /// Register a fan-in merge over a concrete Rust type
    pub fn register_merge_func_typed<T, F>(&self, ty: &DataType, f: F)
    where
        T: Serialize + DeserializeOwned,
        F: Fn(Vec<T>) -> Result<T> + Send + Sync + 'static,
    {
        self.register_merge_func(ty, typed(f));
    }

    /// Register a stream concat for `ty` (replaces an earlier one)
    pub fn register_concat_func<F>(&self, ty: &DataType, f: F)
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.insert_concat(&ty.to_string(), Arc::new(f));
    }

    /// Register a stream concat over a concrete Rust type
    pub fn register_concat_func_typed<T, F>(&self, ty: &DataType, f: F)
    where
        T: Serialize + DeserializeOwned,
        F: Fn(Vec<T>) -> Result<T> + Send + Sync + 'static,
    {
        self.register_concat_func(ty, typed(f));
    }

    fn lookup(
        funcs: &RwLock<HashMap<String, Arc<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>>>,
        ty: &DataType,
        sample: &Value,
    ) -> std::result::Result<Arc<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>, String> {
        let funcs = funcs.read();
        let mut tried = Vec::new();
        if !ty.is_any() {
            tried.push(ty.to_string());
            tried.push(ty.kind_name().to_string());
        }
        tried.push(DataType::runtime_kind(sample).to_string());
        tried.dedup();
        for key in &tried {
            if let Some(f) = funcs.get(key) {
                return Ok(Arc::clone(f));
            }
        }
        Err(tried.remove(0))
    }

    /// Merge fan-in values; one value passes through untouched
    pub fn merge_values(&self, ty: &DataType, mut values: Vec<Value>) -> Result<Value> {
        match values.len() {
            0 => return Err(GraphError::Internal("merge called with no values".into())),
            1 => return Ok(values.remove(0)),
            _ => {}
        }
        let first_kind = DataType::runtime_kind(&values[0]);
        if let Some(other) = values
            .iter()
            .map(DataType::runtime_kind)
            .find(|kind| *kind != first_kind)
        {
            return Err(GraphError::RuntimeType(format!(
                "cannot merge values of different kinds: {first_kind} and {other}"
            )));
        }
        let f = Self::lookup(&self.merge_funcs, ty, &values[0])
            .map_err(GraphError::UnsupportedMergeType)?;
        f(values)
    }

    /// Merge fan-in payloads keyed by predecessor.
    ///
    /// Values go through the merge function; streams are interleaved with
    /// [`StreamReader::merge_named`].
    pub fn merge_payloads(
        &self,
        ty: &DataType,
        payloads: Vec<(String, Payload)>,
        config: &MergeConfig,
    ) -> Result<Payload> {
        if payloads.len() == 1 {
            return payloads
                .into_iter()
                .next()
                .map(|(_, p)| p)
                .ok_or_else(|| GraphError::Internal("merge payload vanished".into()));
        }
        if payloads.iter().all(|(_, p)| p.is_stream()) {
            let named = payloads
                .into_iter()
                .filter_map(|(name, p)| p.into_stream_reader().map(|s| (name, s)))
                .collect();
            return Ok(Payload::Stream(StreamReader::merge_named(
                named,
                config.stream_merge_with_source_eof,
            )));
        }
        let mut values = Vec::with_capacity(payloads.len());
        for (name, payload) in payloads {
            match payload {
                Payload::Value(v) => values.push(v),
                Payload::Stream(_) => {
                    return Err(GraphError::Internal(format!(
                        "fan-in mixes streams and values (stream from '{name}')"
                    )))
                }
            }
        }
        Ok(Payload::Value(self.merge_values(ty, values)?))
    }

    /// Concatenate chunks; one chunk passes through untouched.
    ///
    /// Map chunks without a registered concat are combined field by field,
    /// each field going back through this registry.
    pub fn concat_values(&self, ty: &DataType, mut chunks: Vec<Value>) -> Result<Value> {
        match chunks.len() {
            0 => return Err(GraphError::Internal("concat called with no chunks".into())),
            1 => return Ok(chunks.remove(0)),
            _ => {}
        }
        match Self::lookup(&self.concat_funcs, ty, &chunks[0]) {
            Ok(f) => f(chunks),
            Err(_) if chunks[0].is_object() => self.concat_maps_by_key(chunks),
            Err(key) => Err(GraphError::UnsupportedConcatType(key)),
        }
    }

    fn concat_maps_by_key(&self, values: Vec<Value>) -> Result<Value> {
        let mut grouped: Vec<(String, Vec<Value>)> = Vec::new();
        for value in values {
            let Value::Object(obj) = value else {
                return Err(GraphError::RuntimeType("map concat received a non-object".into()));
            };
            for (key, v) in obj {
                match grouped.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, bucket)) => bucket.push(v),
                    None => grouped.push((key, vec![v])),
                }
            }
        }
        let mut out = Map::new();
        for (key, chunks) in grouped {
            let sample_kind = chunks.first().map(DataType::runtime_kind).unwrap_or("null");
            let merged = if chunks.len() == 1 {
                chunks.into_iter().next().unwrap_or(Value::Null)
            } else if matches!(sample_kind, "int" | "float" | "bool" | "null") {
                // scalars in a chunked map are snapshots: keep the latest
                chunks.into_iter().last().unwrap_or(Value::Null)
            } else {
                self.concat_values(&DataType::Any, chunks)?
            };
            out.insert(key, merged);
        }
        Ok(Value::Object(out))
    }

    /// Drain `stream` into one value; an empty stream yields `None`
    pub async fn concat_stream(&self, ty: &DataType, stream: StreamReader) -> Result<Option<Value>> {
        let chunks = stream.collect_values().await?;
        if chunks.is_empty() {
            return Ok(None);
        }
        self.concat_values(ty, chunks).map(Some)
    }
}

impl Default for MergeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for MergeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut merge: Vec<String> = self.merge_funcs.read().keys().cloned().collect();
        let mut concat: Vec<String> = self.concat_funcs.read().keys().cloned().collect();
        merge.sort();
        concat.sort();
        f.debug_struct("MergeRegistry")
            .field("merge", &merge)
            .field("concat", &concat)
            .finish()
    }
}

/// Turn a persisted concat result back into a stream: `None` is an empty
/// stream, anything else a single chunk
pub fn restore_stream(value: Option<Value>) -> StreamReader {
    match value {
        Some(v) => StreamReader::single(v),
        None => StreamReader::empty(),
    }
}

/// Register a merge function on the process-wide registry
pub fn register_merge_func<F>(ty: &DataType, f: F)
where
    F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
{
    MergeRegistry::global().register_merge_func(ty, f);
}

/// Register a concat function on the process-wide registry
pub fn register_concat_func<F>(ty: &DataType, f: F)
where
    F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
{
    MergeRegistry::global().register_concat_func(ty, f);
}

fn typed<T, F>(f: F) -> impl Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static
where
    T: Serialize + DeserializeOwned,
    F: Fn(Vec<T>) -> Result<T> + Send + Sync + 'static,
{
    move |values: Vec<Value>| {
        let items = values
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<T>, _>>()?;
        Ok(serde_json::to_value(f(items)?)?)
    }
}

fn merge_maps(values: Vec<Value>) -> Result<Value> {
    let mut merged = Map::new();
    for value in values {
        let Value::Object(obj) = value else {
            return Err(GraphError::RuntimeType("map merge received a non-object".into()));
        };
        for (key, v) in obj {
            if merged.contains_key(&key) {
                return Err(GraphError::Execution(format!(
                    "duplicate key '{key}' while merging map values"
                )));
            }
            merged.insert(key, v);
        }
    }
    Ok(Value::Object(merged))
}

fn append_lists(values: Vec<Value>) -> Result<Value> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::Array(items) => out.extend(items),
            other => {
                return Err(GraphError::RuntimeType(format!(
                    "list function received a {}",
                    DataType::runtime_kind(&other)
                )))
            }
        }
    }
    Ok(Value::Array(out))
}

fn concat_strings(values: Vec<Value>) -> Result<Value> {
    let mut out = String::new();
    for value in values {
        match value {
            Value::String(s) => out.push_str(&s),
            other => {
                return Err(GraphError::RuntimeType(format!(
                    "string concat received a {}",
                    DataType::runtime_kind(&other)
                )))
            }
        }
    }
    Ok(Value::String(out))
}
