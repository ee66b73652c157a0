//! Runtime type tokens, the type registry and assignability
//!
//! Node bodies exchange `serde_json::Value`s, so the static type of a node's
//! input or output only exists as a [`DataType`] token declared when the node
//! is added. Those tokens drive three things:
//!
//! - **compile-time edge checks**: [`check_assignable`] answers `Must`, `May`
//!   or `MustNot` for every edge;
//! - **run-time checks**: edges that only `May` be assignable are checked value
//!   by value with [`TypeRegistry::conforms`];
//! - **merge / concat lookup**: the [`MergeRegistry`](crate::MergeRegistry) is
//!   keyed by a type's display name.
//!
//! Records are named object shapes; interfaces are named capabilities that
//! records declare they implement. Both live in a [`TypeRegistry`]:
//!
//! ```rust
//! use flowgraph_core::{check_assignable, Assignable, DataType, RecordType, TypeRegistry};
//!
//! let registry = TypeRegistry::new();
//! let circle = registry.register_record(
//!     RecordType::new("Circle").field("radius", DataType::Float),
//! );
//! registry.register_implementation("Circle", "Shape");
//!
//! let shape = DataType::interface("Shape");
//! assert_eq!(check_assignable(&circle, &shape, &registry), Assignable::Must);
//! assert_eq!(check_assignable(&shape, &circle, &registry), Assignable::May);
//! assert_eq!(check_assignable(&DataType::String, &circle, &registry), Assignable::MustNot);
//! ```

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::mapping::FieldPath;

/// Named object shape with typed fields
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordType {
    pub name: String,
    pub fields: Vec<(String, DataType)>,
}

impl RecordType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field (builder style)
    pub fn field(mut self, name: impl Into<String>, ty: DataType) -> Self {
        self.fields.push((name.into(), ty));
        self
    }

    pub fn field_type(&self, name: &str) -> Option<&DataType> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, ty)| ty)
    }
}

/// Type token for node inputs and outputs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Anything; checked at run time when assigned to something narrower
    Any,
    Bool,
    Int,
    Float,
    String,
    List(Box<DataType>),
    /// String-keyed object with uniform value type
    Map(Box<DataType>),
    Record(Arc<RecordType>),
    Interface(Arc<str>),
}

impl DataType {
    pub fn list(item: DataType) -> Self {
        Self::List(Box::new(item))
    }

    pub fn map(value: DataType) -> Self {
        Self::Map(Box::new(value))
    }

    pub fn record(record: RecordType) -> Self {
        Self::Record(Arc::new(record))
    }

    pub fn interface(name: impl AsRef<str>) -> Self {
        Self::Interface(Arc::from(name.as_ref()))
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Coarse kind, used as the fallback key for merge/concat lookup
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Record(_) => "record",
            Self::Interface(_) => "interface",
        }
    }

    /// Kind of a concrete JSON value, in the same vocabulary as [`kind_name`](Self::kind_name)
    pub fn runtime_kind(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(n) if n.is_i64() || n.is_u64() => "int",
            Value::Number(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "list",
            Value::Object(_) => "map",
        }
    }

    /// Value a node receives when all of its data sources were skipped
    pub fn zero_value(&self) -> Value {
        match self {
            Self::Any | Self::Interface(_) => Value::Null,
            Self::Bool => Value::Bool(false),
            Self::Int => Value::from(0),
            Self::Float => Value::from(0.0),
            Self::String => Value::String(String::new()),
            Self::List(_) => Value::Array(Vec::new()),
            Self::Map(_) => Value::Object(Map::new()),
            Self::Record(record) => Value::Object(
                record
                    .fields
                    .iter()
                    .map(|(name, ty)| (name.clone(), ty.zero_value()))
                    .collect(),
            ),
        }
    }

    /// Type of the sub-value addressed by `path`, if the shape allows it.
    ///
    /// Records resolve named fields, maps resolve any key to their value type,
    /// lists resolve numeric segments, `Any` resolves everything to `Any`.
    pub fn field_type(&self, path: &FieldPath) -> Option<DataType> {
        let mut current = self.clone();
        for segment in path.segments() {
            current = match current {
                Self::Any => Self::Any,
                Self::Map(value) => *value,
                Self::Record(record) => record.field_type(segment)?.clone(),
                Self::List(item) if segment.parse::<usize>().is_ok() => *item,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List(item) => write!(f, "list<{item}>"),
            Self::Map(value) => write!(f, "map<{value}>"),
            Self::Record(record) => f.write_str(&record.name),
            Self::Interface(name) => write!(f, "dyn {name}"),
            other => f.write_str(other.kind_name()),
        }
    }
}

/// Outcome of a static assignability check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignable {
    /// Always assignable
    Must,
    /// Assignable for some values; checked at run time
    May,
    /// Never assignable; a construction error
    MustNot,
}

impl Assignable {
    fn weakest(self, other: Assignable) -> Assignable {
        match (self, other) {
            (Self::MustNot, _) | (_, Self::MustNot) => Self::MustNot,
            (Self::May, _) | (_, Self::May) => Self::May,
            _ => Self::Must,
        }
    }
}

/// Records, interface implementations and interface extension.
///
/// All queries are transitive: a record implementing `Circle` where `Circle`
/// extends `Shape` also implements `Shape`.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    records: RwLock<HashMap<String, Arc<RecordType>>>,
    implementations: RwLock<HashMap<String, HashSet<String>>>,
    extensions: RwLock<HashMap<String, HashSet<String>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record shape and return its type token
    pub fn register_record(&self, record: RecordType) -> DataType {
        let record = Arc::new(record);
        self.records
            .write()
            .insert(record.name.clone(), Arc::clone(&record));
        DataType::Record(record)
    }

    pub fn record(&self, name: &str) -> Option<DataType> {
        self.records.read().get(name).cloned().map(DataType::Record)
    }

    /// Declare that `record` implements `interface`
    pub fn register_implementation(&self, record: impl Into<String>, interface: impl Into<String>) {
        self.implementations
            .write()
            .entry(record.into())
            .or_default()
            .insert(interface.into());
    }

    /// Declare that interface `child` extends interface `parent`
    pub fn register_extension(&self, child: impl Into<String>, parent: impl Into<String>) {
        self.extensions
            .write()
            .entry(child.into())
            .or_default()
            .insert(parent.into());
    }

    /// Whether interface `child` is, or transitively extends, `parent`
    pub fn extends(&self, child: &str, parent: &str) -> bool {
        if child == parent {
            return true;
        }
        let extensions = self.extensions.read();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([child.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(parents) = extensions.get(&current) {
                for p in parents {
                    if p == parent {
                        return true;
                    }
                    queue.push_back(p.clone());
                }
            }
        }
        false
    }

    /// Whether `record` implements `interface` directly or through extension
    pub fn implements(&self, record: &str, interface: &str) -> bool {
        let direct: Vec<String> = match self.implementations.read().get(record) {
            Some(set) => set.iter().cloned().collect(),
            None => return false,
        };
        direct.iter().any(|i| self.extends(i, interface))
    }

    /// Registered records implementing `interface`
    pub fn implementors(&self, interface: &str) -> Vec<Arc<RecordType>> {
        let records: Vec<Arc<RecordType>> = self.records.read().values().cloned().collect();
        records
            .into_iter()
            .filter(|r| self.implements(&r.name, interface))
            .collect()
    }

    /// Whether a concrete value has the shape `ty` describes
    pub fn conforms(&self, value: &Value, ty: &DataType) -> bool {
        match ty {
            DataType::Any => true,
            DataType::Bool => value.is_boolean(),
            DataType::Int => value.is_i64() || value.is_u64(),
            DataType::Float => value.is_number(),
            DataType::String => value.is_string(),
            DataType::List(item) => value
                .as_array()
                .map(|items| items.iter().all(|v| self.conforms(v, item)))
                .unwrap_or(false),
            DataType::Map(inner) => value
                .as_object()
                .map(|obj| obj.values().all(|v| self.conforms(v, inner)))
                .unwrap_or(false),
            DataType::Record(record) => match value.as_object() {
                Some(obj) => record.fields.iter().all(|(name, field_ty)| match obj.get(name) {
                    Some(v) => self.conforms(v, field_ty),
                    None => field_ty.is_any(),
                }),
                None => false,
            },
            DataType::Interface(name) => self
                .implementors(name)
                .into_iter()
                .any(|r| self.conforms(value, &DataType::Record(r))),
        }
    }
}

/// Static assignability of a `from` output to a `to` input
pub fn check_assignable(from: &DataType, to: &DataType, registry: &TypeRegistry) -> Assignable {
    use DataType::*;

    if to.is_any() || from == to {
        return Assignable::Must;
    }
    match (from, to) {
        (Any, _) => Assignable::May,
        (Int, Float) => Assignable::Must,
        (List(a), List(b)) | (Map(a), Map(b)) => check_assignable(a, b, registry),
        (Record(r), Interface(i)) => {
            if registry.implements(&r.name, i) {
                Assignable::Must
            } else {
                Assignable::MustNot
            }
        }
        (Interface(i), Record(r)) => {
            if registry.implements(&r.name, i) {
                Assignable::May
            } else {
                Assignable::MustNot
            }
        }
        (Interface(i), Interface(j)) => {
            if registry.extends(i, j) {
                Assignable::Must
            } else if registry.extends(j, i) {
                Assignable::May
            } else {
                Assignable::MustNot
            }
        }
        (Record(r), Map(v)) => r
            .fields
            .iter()
            .map(|(_, field)| check_assignable(field, v, registry))
            .fold(Assignable::Must, Assignable::weakest),
        (Map(_), Record(_)) => Assignable::May,
        _ => Assignable::MustNot,
    }
}
