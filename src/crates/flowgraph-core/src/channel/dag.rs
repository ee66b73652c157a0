use flowgraph_checkpoint::{ChannelFlavor, ChannelSnapshot, DependencyState, PersistedValue};
use std::collections::BTreeMap;

use super::{Channel, ChannelRead, EdgeResolver};
use crate::error::{GraphError, Result};
use crate::payload::Payload;

/// Channel that fires once every predecessor has either delivered or been skipped
#[derive(Debug, Default)]
pub struct DagChannel {
    control: BTreeMap<String, DependencyState>,
    data: BTreeMap<String, bool>,
    values: BTreeMap<String, Payload>,
    skipped: bool,
}

impl DagChannel {
    /// `control` lists every predecessor that gates readiness; `data` the
    /// ones that also deliver a value
    pub fn new<C, D>(control: C, data: D) -> Self
    where
        C: IntoIterator<Item = String>,
        D: IntoIterator<Item = String>,
    {
        Self {
            control: control
                .into_iter()
                .map(|k| (k, DependencyState::Waiting))
                .collect(),
            data: data.into_iter().map(|k| (k, false)).collect(),
            values: BTreeMap::new(),
            skipped: false,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    fn is_ready(&self) -> bool {
        self.control.values().all(|s| *s != DependencyState::Waiting) && self.data.values().all(|r| *r)
    }
}

impl Channel for DagChannel {
    fn report_values(&mut self, values: BTreeMap<String, Payload>) {
        if self.skipped {
            return;
        }
        for (key, payload) in values {
            if let Some(received) = self.data.get_mut(&key) {
                *received = true;
                self.values.insert(key, payload);
            }
        }
    }

    fn report_dependencies(&mut self, keys: &[String]) {
        for key in keys {
            if let Some(state) = self.control.get_mut(key) {
                *state = DependencyState::Ready;
            }
        }
    }

    fn report_skip(&mut self, keys: &[String]) -> bool {
        if self.skipped {
            return false;
        }
        for key in keys {
            if let Some(state) = self.control.get_mut(key) {
                *state = DependencyState::Skipped;
            }
            if let Some(received) = self.data.get_mut(key) {
                *received = true;
            }
        }
        if !self.control.is_empty() && self.control.values().all(|s| *s == DependencyState::Skipped) {
            self.skipped = true;
            return true;
        }
        false
    }

    fn get(&mut self, want_stream: bool, resolver: &EdgeResolver) -> Result<ChannelRead> {
        if (self.control.is_empty() && self.data.is_empty()) || !self.is_ready() {
            return Ok(ChannelRead::NotReady);
        }
        if self.skipped {
            self.reset();
            return Ok(ChannelRead::Skipped);
        }
        let values = std::mem::take(&mut self.values);
        self.reset();
        resolver.finish(values, want_stream).map(ChannelRead::Ready)
    }

    fn reset(&mut self) {
        self.values.clear();
        self.control
            .values_mut()
            .for_each(|s| *s = DependencyState::Waiting);
        self.data.values_mut().for_each(|r| *r = false);
        self.skipped = false;
    }

    fn take_values(&mut self) -> BTreeMap<String, Payload> {
        std::mem::take(&mut self.values)
    }

    fn put_values(&mut self, values: BTreeMap<String, Payload>) {
        self.values = values;
    }

    fn snapshot(&self) -> Result<ChannelSnapshot> {
        let mut snapshot = ChannelSnapshot::new(ChannelFlavor::Dag);
        for (key, payload) in &self.values {
            let value = payload.as_value().ok_or_else(|| {
                GraphError::Internal(format!("stream buffered from '{key}' was not collapsed before snapshot"))
            })?;
            snapshot
                .values
                .insert(key.clone(), Some(PersistedValue(value.clone())));
        }
        snapshot.control = self.control.clone();
        snapshot.data = self.data.clone();
        snapshot.skipped = self.skipped;
        Ok(snapshot)
    }

    fn restore(&mut self, snapshot: ChannelSnapshot) -> Result<()> {
        if snapshot.flavor != ChannelFlavor::Dag {
            return Err(GraphError::Checkpoint(flowgraph_checkpoint::CheckpointError::Invalid(
                "expected a DAG channel snapshot".into(),
            )));
        }
        // keep the compiled dependency sets, take only their states
        for (key, state) in snapshot.control {
            if let Some(slot) = self.control.get_mut(&key) {
                *slot = state;
            }
        }
        for (key, received) in snapshot.data {
            if let Some(slot) = self.data.get_mut(&key) {
                *slot = received;
            }
        }
        self.values = snapshot
            .values
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, Payload::Value(v.into_inner()))))
            .collect();
        self.skipped = snapshot.skipped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeRegistry;
    use crate::types::{DataType, TypeRegistry};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn resolver() -> EdgeResolver {
        EdgeResolver::new(
            "n",
            DataType::Any,
            Arc::new(MergeRegistry::with_defaults()),
            Arc::new(TypeRegistry::new()),
        )
    }

    fn single(key: &str, value: serde_json::Value) -> BTreeMap<String, Payload> {
        let mut m = BTreeMap::new();
        m.insert(key.to_string(), Payload::Value(value));
        m
    }

    #[test]
    fn test_waits_for_all_predecessors() {
        let mut ch = DagChannel::new(keys(&["a", "b"]), keys(&["a"]));
        let r = resolver();

        ch.report_values(single("a", json!(1)));
        ch.report_dependencies(&keys(&["a"]));
        assert!(matches!(ch.get(false, &r).unwrap(), ChannelRead::NotReady));

        ch.report_dependencies(&keys(&["b"]));
        match ch.get(false, &r).unwrap() {
            ChannelRead::Ready(p) => assert_eq!(p.as_value(), Some(&json!(1))),
            other => panic!("unexpected {other:?}"),
        }
        // reset after firing
        assert!(matches!(ch.get(false, &r).unwrap(), ChannelRead::NotReady));
    }

    #[test]
    fn test_undeclared_values_ignored() {
        let mut ch = DagChannel::new(keys(&["a"]), keys(&["a"]));
        ch.report_values(single("zzz", json!(1)));
        assert!(ch.take_values().is_empty());
    }

    #[test]
    fn test_skip_reported_once() {
        let mut ch = DagChannel::new(keys(&["a", "b"]), keys(&["a", "b"]));
        assert!(!ch.report_skip(&keys(&["a"])));
        assert!(ch.report_skip(&keys(&["b"])));
        assert!(!ch.report_skip(&keys(&["a", "b"])));
        assert!(matches!(ch.get(false, &resolver()).unwrap(), ChannelRead::Skipped));
        assert!(!ch.is_skipped());
    }

    #[test]
    fn test_partial_skip_fires_with_remaining_values() {
        let mut ch = DagChannel::new(keys(&["a", "b"]), keys(&["a", "b"]));
        ch.report_skip(&keys(&["a"]));
        ch.report_values(single("b", json!("kept")));
        ch.report_dependencies(&keys(&["b"]));
        match ch.get(false, &resolver()).unwrap() {
            ChannelRead::Ready(p) => assert_eq!(p.as_value(), Some(&json!("kept"))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_no_control_dependencies_never_skips() {
        let mut ch = DagChannel::new(Vec::<String>::new(), keys(&["a"]));
        assert!(!ch.report_skip(&keys(&["a"])));
        assert!(!ch.is_skipped());
    }

    #[test]
    fn test_read_leaves_channel_as_new() {
        let build = || DagChannel::new(keys(&["a", "b"]), keys(&["a"]));
        let pristine = build().snapshot().unwrap();

        let mut ch = build();
        ch.report_values(single("a", json!(1)));
        ch.report_dependencies(&keys(&["a", "b"]));
        assert!(matches!(ch.get(false, &resolver()).unwrap(), ChannelRead::Ready(_)));
        assert_eq!(ch.snapshot().unwrap(), pristine);

        assert!(ch.report_skip(&keys(&["a", "b"])));
        assert!(matches!(ch.get(false, &resolver()).unwrap(), ChannelRead::Skipped));
        assert_eq!(ch.snapshot().unwrap(), pristine);

        ch.reset();
        ch.reset();
        assert_eq!(ch.snapshot().unwrap(), pristine);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut ch = DagChannel::new(keys(&["a", "b"]), keys(&["a", "b"]));
        ch.report_values(single("a", json!({"k": 1})));
        ch.report_dependencies(&keys(&["a"]));
        let snapshot = ch.snapshot().unwrap();

        let mut fresh = DagChannel::new(keys(&["a", "b"]), keys(&["a", "b"]));
        fresh.restore(snapshot).unwrap();
        fresh.report_values(single("b", json!({"j": 2})));
        fresh.report_dependencies(&keys(&["b"]));
        match fresh.get(false, &resolver()).unwrap() {
            ChannelRead::Ready(p) => assert_eq!(p.as_value(), Some(&json!({"k": 1, "j": 2}))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Event {
        Deliver,
        ControlOnly,
        Skip,
        Nothing,
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            Just(Event::Deliver),
            Just(Event::ControlOnly),
            Just(Event::Skip),
            Just(Event::Nothing),
        ]
    }

    proptest! {
        #[test]
        fn prop_ready_iff_no_waiting_and_all_data(events in proptest::collection::vec(event(), 1..6), data_mask in proptest::collection::vec(any::<bool>(), 6)) {
            let names: Vec<String> = (0..events.len()).map(|i| format!("p{i}")).collect();
            let data: Vec<String> = names
                .iter()
                .zip(&data_mask)
                .filter(|(_, is_data)| **is_data)
                .map(|(n, _)| n.clone())
                .collect();
            let mut ch = DagChannel::new(names.clone(), data.clone());

            let mut waiting = false;
            let mut missing_data = false;
            let mut all_skipped = true;
            for (name, ev) in names.iter().zip(&events) {
                let is_data = data.contains(name);
                match ev {
                    Event::Deliver => {
                        ch.report_values(single(name, json!(1)));
                        ch.report_dependencies(std::slice::from_ref(name));
                        all_skipped = false;
                    }
                    Event::ControlOnly => {
                        ch.report_dependencies(std::slice::from_ref(name));
                        all_skipped = false;
                        missing_data |= is_data;
                    }
                    Event::Skip => {
                        ch.report_skip(std::slice::from_ref(name));
                    }
                    Event::Nothing => {
                        waiting = true;
                        all_skipped = false;
                        missing_data |= is_data;
                    }
                }
            }

            let read = ch.get(false, &EdgeResolver::new(
                "n",
                DataType::Any,
                Arc::new(MergeRegistry::with_defaults()),
                Arc::new(TypeRegistry::new()),
            ));
            let expect_ready = !waiting && !missing_data;
            match read {
                Ok(ChannelRead::NotReady) => prop_assert!(!expect_ready),
                Ok(ChannelRead::Skipped) => prop_assert!(expect_ready && all_skipped),
                Ok(ChannelRead::Ready(_)) => prop_assert!(expect_ready && !all_skipped),
                // several delivered values over Any merge as maps; ints are unsupported
                Err(_) => prop_assert!(expect_ready && !all_skipped),
            }
        }
    }
}
