//! Field mappings between a node's output and a successor's input
//!
//! An edge without mappings hands the whole output value to the successor.
//! An edge with mappings instead builds the successor's input piece by piece:
//!
//! ```text
//!   from output                       to input
//!   {"user": {"id": 7}, "n": 2}  ──>  {"uid": 7, "count": 2}
//!        map_field("user.id", "uid")
//!        map_field("n", "count")
//! ```
//!
//! Paths use dot notation; an empty path addresses the whole value. Numeric
//! segments index into arrays. When several predecessors map into the same
//! node, each produces a partial object and the partials are merged like any
//! other fan-in.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::types::{check_assignable, Assignable, DataType, TypeRegistry};

/// Dot-separated path into a JSON value
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Read the addressed sub-value
    pub fn get<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let mut current = value;
        for segment in &self.segments {
            current = match current {
                Value::Object(obj) => obj.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Write `field` at this path, creating intermediate objects
    pub fn set(&self, target: &mut Value, field: Value) -> Result<()> {
        let Some((last, parents)) = self.segments.split_last() else {
            *target = field;
            return Ok(());
        };
        let mut current = target;
        for segment in parents {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            current = match current {
                Value::Object(obj) => obj
                    .entry(segment.clone())
                    .or_insert_with(|| Value::Object(Map::new())),
                other => {
                    return Err(GraphError::FieldMapping(format!(
                        "cannot set '{}': segment '{}' is a {}, not an object",
                        self,
                        segment,
                        DataType::runtime_kind(other)
                    )))
                }
            };
        }
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        match current {
            Value::Object(obj) => {
                obj.insert(last.clone(), field);
                Ok(())
            }
            other => Err(GraphError::FieldMapping(format!(
                "cannot set '{}': parent is a {}, not an object",
                self,
                DataType::runtime_kind(other)
            ))),
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

/// Trusted conversion applied to a mapped field
pub type FieldTransform = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// One field copied from a predecessor's output into a node's input
#[derive(Clone)]
pub struct FieldMapping {
    from: FieldPath,
    to: FieldPath,
    whole_input: bool,
    transform: Option<FieldTransform>,
}

impl FieldMapping {
    /// Copy `from` in the predecessor's output to `to` in the node's input
    pub fn map_field(from: &str, to: &str) -> Self {
        Self {
            from: FieldPath::parse(from),
            to: FieldPath::parse(to),
            whole_input: false,
            transform: None,
        }
    }

    /// Use `from` as the node's entire input
    pub fn from_field(from: &str) -> Self {
        Self::map_field(from, "")
    }

    /// Place the predecessor's entire output at `to`
    pub fn to_field(to: &str) -> Self {
        Self {
            whole_input: true,
            ..Self::map_field("", to)
        }
    }

    /// Attach a conversion; type checking is skipped for this mapping
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn from_path(&self) -> &FieldPath {
        &self.from
    }

    pub fn to_path(&self) -> &FieldPath {
        &self.to
    }

    pub fn has_transform(&self) -> bool {
        self.transform.is_some()
    }

    fn reads_whole_output(&self) -> bool {
        self.whole_input || self.from.is_empty()
    }

    fn extract(&self, value: &Value) -> Result<Value> {
        let field = if self.reads_whole_output() {
            value.clone()
        } else {
            self.from.get(value).cloned().ok_or_else(|| {
                GraphError::FieldMapping(format!("field '{}' not found in value", self.from))
            })?
        };
        match &self.transform {
            Some(transform) => transform(field),
            None => Ok(field),
        }
    }
}

impl fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMapping")
            .field("from", &self.from.to_string())
            .field("to", &self.to.to_string())
            .field("whole_input", &self.whole_input)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl fmt::Display for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let from = if self.reads_whole_output() {
            "<output>".to_string()
        } else {
            self.from.to_string()
        };
        let to = if self.to.is_empty() {
            "<input>".to_string()
        } else {
            self.to.to_string()
        };
        write!(f, "{from} -> {to}")
    }
}

/// Build a node input from one predecessor value
pub fn apply_mappings(value: &Value, mappings: &[FieldMapping]) -> Result<Value> {
    if let [single] = mappings {
        if single.to.is_empty() {
            return single.extract(value);
        }
    }
    let mut input = Value::Object(Map::new());
    for mapping in mappings {
        let field = mapping.extract(value)?;
        mapping.to.set(&mut input, field)?;
    }
    Ok(input)
}

/// Map one stream chunk.
///
/// A chunk usually carries only some fields, so mappings whose source field
/// is absent are skipped; a chunk matching no mapping yields `None`.
pub fn apply_mappings_to_chunk(chunk: &Value, mappings: &[FieldMapping]) -> Result<Option<Value>> {
    let present: Vec<&FieldMapping> = mappings
        .iter()
        .filter(|m| m.reads_whole_output() || m.from.get(chunk).is_some())
        .collect();
    if present.is_empty() {
        return Ok(None);
    }
    if let [single] = mappings {
        if single.to.is_empty() {
            return single.extract(chunk).map(Some);
        }
    }
    let mut input = Value::Object(Map::new());
    for mapping in present {
        let field = mapping.extract(chunk)?;
        mapping.to.set(&mut input, field)?;
    }
    Ok(Some(input))
}

/// Check the mappings of edge `from -> to` against the endpoint types.
///
/// Returns `true` when at least one mapped field is only `May`-assignable and
/// needs a conformance check at run time.
pub fn validate_field_mapping(
    edge: (&str, &str),
    from_ty: &DataType,
    to_ty: &DataType,
    mappings: &[FieldMapping],
    registry: &TypeRegistry,
) -> Result<bool> {
    let (from_node, to_node) = edge;
    for mapping in mappings {
        if mapping.from.is_empty() && mapping.to.is_empty() && !mapping.whole_input {
            return Err(GraphError::Validation(format!(
                "field mapping on '{from_node}' -> '{to_node}' has neither a source nor a destination"
            )));
        }
    }
    if mappings.len() > 1 && mappings.iter().any(|m| m.to.is_empty()) {
        return Err(GraphError::Validation(format!(
            "field mapping on '{from_node}' -> '{to_node}' writes the whole input, so it must be the only mapping"
        )));
    }

    let mut needs_runtime_check = false;
    for mapping in mappings.iter().filter(|m| !m.has_transform()) {
        let source = if mapping.reads_whole_output() {
            Some(from_ty.clone())
        } else {
            from_ty.field_type(&mapping.from)
        };
        let source = source.ok_or_else(|| {
            GraphError::Validation(format!(
                "field '{}' does not exist in output type {} of '{}'",
                mapping.from, from_ty, from_node
            ))
        })?;
        let target = to_ty.field_type(&mapping.to).ok_or_else(|| {
            GraphError::Validation(format!(
                "field '{}' does not exist in input type {} of '{}'",
                mapping.to, to_ty, to_node
            ))
        })?;

        match check_assignable(&source, &target, registry) {
            Assignable::Must => {}
            Assignable::May => needs_runtime_check = true,
            Assignable::MustNot => {
                return Err(GraphError::type_mismatch(
                    from_node,
                    to_node,
                    format!("mapping {mapping} cannot assign {source} to {target}"),
                ))
            }
        }
    }
    Ok(needs_runtime_check)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordType;
    use serde_json::json;

    #[test]
    fn test_chunk_mapping_skips_absent_fields() {
        let mappings = vec![
            FieldMapping::map_field("text", "body"),
            FieldMapping::map_field("score", "rank"),
        ];
        let mapped = apply_mappings_to_chunk(&json!({"text": "hi"}), &mappings).unwrap();
        assert_eq!(mapped, Some(json!({"body": "hi"})));
        assert_eq!(apply_mappings_to_chunk(&json!({"other": 1}), &mappings).unwrap(), None);
    }

    #[test]
    fn test_path_get_and_set() {
        let value = json!({"user": {"id": 7, "tags": ["a", "b"]}});
        assert_eq!(FieldPath::parse("user.id").get(&value), Some(&json!(7)));
        assert_eq!(FieldPath::parse("user.tags.1").get(&value), Some(&json!("b")));
        assert_eq!(FieldPath::parse("user.missing").get(&value), None);

        let mut target = Value::Null;
        FieldPath::parse("a.b.c").set(&mut target, json!(1)).unwrap();
        assert_eq!(target, json!({"a": {"b": {"c": 1}}}));

        let mut scalar = json!({"a": 3});
        assert!(FieldPath::parse("a.b").set(&mut scalar, json!(1)).is_err());
    }

    #[test]
    fn test_apply_builds_partial_object() {
        let output = json!({"user": {"id": 7}, "n": 2});
        let mappings = vec![
            FieldMapping::map_field("user.id", "uid"),
            FieldMapping::map_field("n", "stats.count"),
        ];
        assert_eq!(
            apply_mappings(&output, &mappings).unwrap(),
            json!({"uid": 7, "stats": {"count": 2}})
        );
    }

    #[test]
    fn test_apply_whole_value_forms() {
        let output = json!({"inner": [1, 2]});
        assert_eq!(
            apply_mappings(&output, &[FieldMapping::from_field("inner")]).unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            apply_mappings(&output, &[FieldMapping::to_field("wrapped")]).unwrap(),
            json!({"wrapped": {"inner": [1, 2]}})
        );
    }

    #[test]
    fn test_apply_transform_and_missing_field() {
        let mapping = FieldMapping::map_field("n", "double")
            .with_transform(|v| Ok(json!(v.as_i64().unwrap_or(0) * 2)));
        assert_eq!(
            apply_mappings(&json!({"n": 4}), &[mapping]).unwrap(),
            json!({"double": 8})
        );

        let err = apply_mappings(&json!({}), &[FieldMapping::map_field("n", "m")]).unwrap_err();
        assert!(matches!(err, GraphError::FieldMapping(_)));
    }

    #[test]
    fn test_validate_field_types() {
        let registry = TypeRegistry::new();
        let user = DataType::record(
            RecordType::new("User")
                .field("id", DataType::Int)
                .field("name", DataType::String),
        );
        let request = DataType::record(RecordType::new("Request").field("uid", DataType::Int));

        let ok = validate_field_mapping(
            ("a", "b"),
            &user,
            &request,
            &[FieldMapping::map_field("id", "uid")],
            &registry,
        );
        assert_eq!(ok.unwrap(), false);

        let mismatch = validate_field_mapping(
            ("a", "b"),
            &user,
            &request,
            &[FieldMapping::map_field("name", "uid")],
            &registry,
        );
        assert!(matches!(mismatch, Err(GraphError::TypeMismatch { .. })));

        let missing = validate_field_mapping(
            ("a", "b"),
            &user,
            &request,
            &[FieldMapping::map_field("email", "uid")],
            &registry,
        );
        assert!(matches!(missing, Err(GraphError::Validation(_))));

        let transformed = validate_field_mapping(
            ("a", "b"),
            &user,
            &request,
            &[FieldMapping::map_field("name", "uid").with_transform(|_| Ok(json!(0)))],
            &registry,
        );
        assert_eq!(transformed.unwrap(), false);
    }

    #[test]
    fn test_validate_flags_runtime_check_and_shape_errors() {
        let registry = TypeRegistry::new();
        let loose = DataType::map(DataType::Any);
        let strict = DataType::record(RecordType::new("N").field("n", DataType::Int));
        assert_eq!(
            validate_field_mapping(
                ("a", "b"),
                &loose,
                &strict,
                &[FieldMapping::map_field("x", "n")],
                &registry
            )
            .unwrap(),
            true
        );

        let empty = FieldMapping::map_field("", "");
        assert!(validate_field_mapping(("a", "b"), &loose, &loose, &[empty], &registry).is_err());

        let two_with_whole = vec![FieldMapping::from_field("x"), FieldMapping::map_field("y", "z")];
        assert!(validate_field_mapping(("a", "b"), &loose, &loose, &two_with_whole, &registry).is_err());
    }
}
