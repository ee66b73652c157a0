//! Edge type checking and pass-through type inference
//!
//! Every edge is checked once both of its endpoint types are known. Typed
//! nodes know their types when added; pass-through nodes learn theirs from
//! their neighbours, so edges touching them are deferred and resolved in
//! passes after the whole graph is built:
//!
//! ```text
//!   A(int) ──► B(?) ──► C(?) ──► D(int)
//!
//!   pass 1:  B := int  (forward from A)   A→B checked
//!            C := int  (forward from B)   B→C checked, C→D checked
//!   pass 2:  nothing pending
//! ```
//!
//! Inference runs forward (an unknown target takes its source's output type)
//! and backward (an unknown source takes its target's input type). Edges that
//! carry field mappings never drive inference because the mapped shape says
//! nothing about the whole value.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::mapping::{validate_field_mapping, FieldMapping};
use crate::topology;
use crate::types::{check_assignable, Assignable, DataType, TypeRegistry};

/// Declared or inferred types of one node; `None` until a pass-through is resolved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeTypes {
    pub input: Option<DataType>,
    pub output: Option<DataType>,
}

impl NodeTypes {
    pub fn known(input: DataType, output: DataType) -> Self {
        Self {
            input: Some(input),
            output: Some(output),
        }
    }

    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn is_resolved(&self) -> bool {
        self.input.is_some() && self.output.is_some()
    }
}

/// Node key to its types
pub type TypeTable = BTreeMap<String, NodeTypes>;

#[derive(Debug, Clone)]
struct PendingEdge {
    from: String,
    to: String,
    mappings: Vec<FieldMapping>,
}

/// Collects deferred edges and resolves pass-through types
#[derive(Debug)]
pub struct GraphValidator {
    registry: Arc<TypeRegistry>,
    pending: Vec<PendingEdge>,
    runtime_checked: BTreeSet<(String, String)>,
}

impl GraphValidator {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            pending: Vec::new(),
            runtime_checked: BTreeSet::new(),
        }
    }

    /// Number of edges still waiting for an endpoint type
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Edges whose values must be checked against the target type at run time
    pub fn runtime_checked_edges(&self) -> &BTreeSet<(String, String)> {
        &self.runtime_checked
    }

    /// Check an edge now when both types are known, otherwise defer it
    pub fn check_or_defer(
        &mut self,
        from: &str,
        to: &str,
        mappings: &[FieldMapping],
        types: &TypeTable,
    ) -> Result<()> {
        let from_ty = types.get(from).and_then(|t| t.output.clone());
        let to_ty = types.get(to).and_then(|t| t.input.clone());
        match (from_ty, to_ty) {
            (Some(from_ty), Some(to_ty)) => self.validate_edge(from, to, &from_ty, &to_ty, mappings),
            _ => {
                self.add_to_validate_map(from, to, mappings);
                Ok(())
            }
        }
    }

    /// Defer `from -> to` until an endpoint type is inferred
    pub fn add_to_validate_map(&mut self, from: &str, to: &str, mappings: &[FieldMapping]) {
        self.pending.push(PendingEdge {
            from: from.to_string(),
            to: to.to_string(),
            mappings: mappings.to_vec(),
        });
    }

    /// Check one edge between known types.
    ///
    /// `May` results are remembered for a conformance check at run time.
    pub fn validate_edge(
        &mut self,
        from: &str,
        to: &str,
        from_ty: &DataType,
        to_ty: &DataType,
        mappings: &[FieldMapping],
    ) -> Result<()> {
        let needs_check = if mappings.is_empty() {
            match check_assignable(from_ty, to_ty, &self.registry) {
                Assignable::Must => false,
                Assignable::May => true,
                Assignable::MustNot => {
                    return Err(GraphError::type_mismatch(
                        from,
                        to,
                        format!("{from_ty} is not assignable to {to_ty}"),
                    ))
                }
            }
        } else {
            validate_field_mapping((from, to), from_ty, to_ty, mappings, &self.registry)?
        };
        if needs_check {
            tracing::debug!(from = %from, to = %to, "edge needs runtime type check");
            self.runtime_checked.insert((from.to_string(), to.to_string()));
        }
        Ok(())
    }

    /// One inference pass over the deferred edges; returns whether anything changed
    pub fn update_to_validate_map(&mut self, types: &mut TypeTable) -> Result<bool> {
        let mut progress = false;
        let pending = std::mem::take(&mut self.pending);
        let mut remaining = Vec::with_capacity(pending.len());

        for edge in pending {
            let from_out = types.get(&edge.from).and_then(|t| t.output.clone());
            let to_in = types.get(&edge.to).and_then(|t| t.input.clone());

            if edge.mappings.is_empty() {
                match (&from_out, &to_in) {
                    (Some(ty), None) => {
                        tracing::debug!(node = %edge.to, ty = %ty, "inferred pass-through type forward");
                        types.insert(edge.to.clone(), NodeTypes::known(ty.clone(), ty.clone()));
                        progress = true;
                    }
                    (None, Some(ty)) => {
                        tracing::debug!(node = %edge.from, ty = %ty, "inferred pass-through type backward");
                        types.insert(edge.from.clone(), NodeTypes::known(ty.clone(), ty.clone()));
                        progress = true;
                    }
                    _ => {}
                }
            }

            let from_out = types.get(&edge.from).and_then(|t| t.output.clone());
            let to_in = types.get(&edge.to).and_then(|t| t.input.clone());
            match (from_out, to_in) {
                (Some(from_ty), Some(to_ty)) => {
                    self.validate_edge(&edge.from, &edge.to, &from_ty, &to_ty, &edge.mappings)?;
                    progress = true;
                }
                _ => remaining.push(edge),
            }
        }

        self.pending = remaining;
        Ok(progress)
    }

    /// Run inference passes until every deferred edge is checked.
    ///
    /// `passthrough_count` bounds the number of passes.
    pub fn resolve(&mut self, types: &mut TypeTable, passthrough_count: usize) -> Result<()> {
        let cap = passthrough_count + 1;
        for _ in 0..=cap {
            if self.pending.is_empty() {
                return Ok(());
            }
            if !self.update_to_validate_map(types)? {
                return Err(self.leftover_error());
            }
        }
        if self.pending.is_empty() {
            return Ok(());
        }
        Err(GraphError::Internal(format!(
            "type inference still progressing after {cap} passes"
        )))
    }

    fn leftover_error(&self) -> GraphError {
        let edges: Vec<(String, String)> = self
            .pending
            .iter()
            .map(|e| (e.from.clone(), e.to.clone()))
            .collect();
        let listed = edges
            .iter()
            .map(|(a, b)| format!("{a} -> {b}"))
            .collect::<Vec<_>>()
            .join(", ");
        match topology::topological_sort(std::iter::empty(), &edges) {
            Err(cycle) => GraphError::Inference(format!(
                "cyclic pass-through inference among [{}] (edges: {listed})",
                cycle.join(", ")
            )),
            Ok(_) => GraphError::Inference(format!("unresolved type inference for edges: {listed}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordType;

    fn table(entries: &[(&str, Option<DataType>)]) -> TypeTable {
        entries
            .iter()
            .map(|(k, ty)| {
                let types = match ty {
                    Some(t) => NodeTypes::known(t.clone(), t.clone()),
                    None => NodeTypes::passthrough(),
                };
                (k.to_string(), types)
            })
            .collect()
    }

    #[test]
    fn test_chain_inference_forward() {
        let mut types = table(&[
            ("A", Some(DataType::Int)),
            ("B", None),
            ("C", None),
            ("D", Some(DataType::Int)),
        ]);
        let mut validator = GraphValidator::new(Arc::new(TypeRegistry::new()));
        validator.check_or_defer("A", "B", &[], &types).unwrap();
        validator.check_or_defer("B", "C", &[], &types).unwrap();
        validator.check_or_defer("C", "D", &[], &types).unwrap();
        assert_eq!(validator.pending_len(), 3);

        validator.resolve(&mut types, 2).unwrap();
        assert_eq!(types["B"], NodeTypes::known(DataType::Int, DataType::Int));
        assert_eq!(types["C"], NodeTypes::known(DataType::Int, DataType::Int));
        assert_eq!(validator.pending_len(), 0);
    }

    #[test]
    fn test_backward_inference() {
        let mut types = table(&[("P", None), ("D", Some(DataType::String))]);
        let mut validator = GraphValidator::new(Arc::new(TypeRegistry::new()));
        validator.check_or_defer("P", "D", &[], &types).unwrap();
        validator.resolve(&mut types, 1).unwrap();
        assert_eq!(types["P"].input, Some(DataType::String));
    }

    #[test]
    fn test_mismatch_after_inference() {
        let mut types = table(&[("A", Some(DataType::Int)), ("B", None), ("C", Some(DataType::String))]);
        let mut validator = GraphValidator::new(Arc::new(TypeRegistry::new()));
        validator.check_or_defer("A", "B", &[], &types).unwrap();
        validator.check_or_defer("B", "C", &[], &types).unwrap();
        let err = validator.resolve(&mut types, 1).unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { ref from, ref to, .. } if from == "B" && to == "C"));
    }

    #[test]
    fn test_passthrough_cycle_is_reported() {
        let mut types = table(&[("X", None), ("Y", None)]);
        let mut validator = GraphValidator::new(Arc::new(TypeRegistry::new()));
        validator.check_or_defer("X", "Y", &[], &types).unwrap();
        validator.check_or_defer("Y", "X", &[], &types).unwrap();
        let err = validator.resolve(&mut types, 2).unwrap_err();
        assert!(err.to_string().contains("cyclic pass-through inference"));
    }

    #[test]
    fn test_mapped_edge_does_not_infer() {
        let mut types = table(&[("A", Some(DataType::map(DataType::Int))), ("B", None)]);
        let mut validator = GraphValidator::new(Arc::new(TypeRegistry::new()));
        validator
            .check_or_defer("A", "B", &[FieldMapping::map_field("x", "y")], &types)
            .unwrap();
        let err = validator.resolve(&mut types, 1).unwrap_err();
        assert!(err.to_string().contains("unresolved type inference"));
    }

    #[test]
    fn test_may_edges_are_marked() {
        let registry = TypeRegistry::new();
        let order = registry.register_record(RecordType::new("Order").field("id", DataType::Int));
        let mut validator = GraphValidator::new(Arc::new(registry));
        validator
            .validate_edge("a", "b", &DataType::Any, &order, &[])
            .unwrap();
        validator
            .validate_edge("b", "c", &DataType::Int, &DataType::Float, &[])
            .unwrap();
        assert!(validator
            .runtime_checked_edges()
            .contains(&("a".to_string(), "b".to_string())));
        assert_eq!(validator.runtime_checked_edges().len(), 1);
    }
}
