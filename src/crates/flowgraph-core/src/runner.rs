//! The scheduling loop
//!
//! One [`Runner`] drives one run of a compiled graph:
//!
//! ```text
//!            ┌──────────────────────────────────────────────────────┐
//!            ▼                                                      │
//!   END ready? ──yes──► drain in-flight ──► Completed(output)       │
//!      │ no                                                         │
//!   cancelled / interrupt-before hit? ──yes──► interrupt path       │
//!      │ no                                                         │
//!   step += 1 (budget) ──► dispatch ready nodes ──► wait            │
//!                                                  │                │
//!   route outputs: data successors, control successors, branches    │
//!      │                                                            │
//!   interrupt-after hit or rerun request? ──yes──► interrupt path   │
//!      │ no                                                         │
//!   poll ready channels ────────────────────────────────────────────┘
//! ```
//!
//! The interrupt path waits for in-flight nodes and applies their results,
//! polls the channels that became ready, collapses every stream and stores
//! the whole run as one checkpoint record.

use flowgraph_checkpoint::{CheckpointError, CheckpointRecord, PersistedValue, RunMode};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::channel::{ChannelManager, ChannelRead};
use crate::checkpoint::{collapse_payload, load_record, restore_payload, save_record};
use crate::compiled::{GraphCore, NodeSpec, RunOutcome};
use crate::config::RunOptions;
use crate::error::{GraphError, Result};
use crate::graph::START;
use crate::interrupt::InterruptInfo;
use crate::merge::MergeRegistry;
use crate::node::NodeContext;
use crate::payload::Payload;
use crate::state::GraphState;
use crate::stream::StreamReader;
use crate::task::{TaskManager, TaskOutcome};
use crate::types::DataType;

/// How a run enters the loop
pub(crate) enum Entry {
    Fresh(Payload),
    Resume {
        checkpoint_id: String,
        input: Option<Value>,
    },
}

pub(crate) struct RunRequest {
    pub(crate) entry: Entry,
    pub(crate) mode: RunMode,
    pub(crate) options: RunOptions,
}

impl RunRequest {
    pub(crate) fn fresh(input: Payload, mode: RunMode, options: RunOptions) -> Self {
        Self {
            entry: Entry::Fresh(input),
            mode,
            options,
        }
    }

    pub(crate) fn resume(
        checkpoint_id: String,
        input: Option<Value>,
        mode: RunMode,
        mut options: RunOptions,
    ) -> Self {
        options.checkpoint_id = Some(checkpoint_id.clone());
        Self {
            entry: Entry::Resume {
                checkpoint_id,
                input,
            },
            mode,
            options,
        }
    }
}

/// Where the loop starts
struct StartPoint {
    pending: Vec<(String, Payload)>,
    resumed: bool,
    resume_input: Option<Value>,
    skip_pre_handler: BTreeSet<String>,
}

struct Rerun {
    node: String,
    extra: Option<Value>,
    input: Option<Payload>,
}

/// Interrupt causes collected during one step
#[derive(Default)]
struct Hits {
    before: Vec<String>,
    after: Vec<String>,
    reruns: Vec<Rerun>,
    external: bool,
}

impl Hits {
    fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty() && self.reruns.is_empty() && !self.external
    }
}

pub(crate) struct Runner {
    core: Arc<GraphCore>,
    mode: RunMode,
    want_stream: bool,
    options: RunOptions,
    channels: ChannelManager,
    tasks: TaskManager,
    state: Option<GraphState>,
    step: usize,
}

impl Runner {
    /// Returns the runner and the way it enters the loop
    pub(crate) fn new(core: Arc<GraphCore>, request: RunRequest) -> Result<(Self, Entry)> {
        let RunRequest {
            entry,
            mode,
            options,
        } = request;
        if core.store.is_none()
            && (options.checkpoint_id.is_some() || options.write_to_checkpoint_id.is_some())
        {
            return Err(GraphError::Configuration(
                "a checkpoint id was given but the graph has no checkpoint store".into(),
            ));
        }
        if options.force_new_run && matches!(entry, Entry::Resume { .. }) {
            return Err(GraphError::Configuration(
                "force_new_run cannot be combined with resume".into(),
            ));
        }
        let channels = core.new_channel_manager()?;
        let tasks = TaskManager::new(core.max_parallelism, core.eager);
        let state = core.state_generator.as_ref().map(|g| GraphState::new(g()));
        let runner = Self {
            mode,
            want_stream: mode.is_stream(),
            options,
            channels,
            tasks,
            state,
            step: 0,
            core,
        };
        Ok((runner, entry))
    }

    pub(crate) async fn run(mut self, entry: Entry) -> Result<RunOutcome<Payload>> {
        let StartPoint {
            mut pending,
            resumed,
            mut resume_input,
            mut skip_pre_handler,
        } = self.start(entry).await?;
        let mut check_before = !resumed;

        loop {
            match self.channels.get_end(self.want_stream)? {
                ChannelRead::Ready(output) => {
                    self.drain().await;
                    tracing::info!(graph = %self.core.name, steps = self.step, "run completed");
                    return Ok(RunOutcome::Completed(output));
                }
                ChannelRead::Skipped => {
                    self.drain().await;
                    tracing::warn!(graph = %self.core.name, "every path to END was skipped");
                    return Err(GraphError::Execution(
                        "END was skipped by branch decisions".into(),
                    ));
                }
                ChannelRead::NotReady => {}
            }

            if self.cancelled() {
                let hits = Hits {
                    external: true,
                    ..Default::default()
                };
                return self.interrupt(pending, hits).await;
            }

            if check_before {
                let before: Vec<String> = pending
                    .iter()
                    .filter(|(node, _)| self.core.interrupt_before.contains(node))
                    .map(|(node, _)| node.clone())
                    .collect();
                if !before.is_empty() {
                    let hits = Hits {
                        before,
                        ..Default::default()
                    };
                    return self.interrupt(pending, hits).await;
                }
            }

            if pending.is_empty() && self.tasks.is_idle() {
                return Err(GraphError::Execution(
                    "no runnable nodes left and END was not reached".into(),
                ));
            }

            if !pending.is_empty() {
                self.step += 1;
                if self.step > self.core.max_steps {
                    self.drain().await;
                    tracing::warn!(
                        graph = %self.core.name,
                        max_steps = self.core.max_steps,
                        "step budget exhausted"
                    );
                    return Err(GraphError::StepLimitExceeded {
                        max_steps: self.core.max_steps,
                    });
                }
                tracing::debug!(
                    step = self.step,
                    nodes = ?pending.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
                    "dispatching step"
                );
                for (node, input) in pending.drain(..) {
                    let skip_pre = skip_pre_handler.contains(&node);
                    self.dispatch(node, input, resume_input.clone(), skip_pre)?;
                }
                resume_input = None;
                skip_pre_handler.clear();
                check_before = true;
            }

            let done = self.wait_step().await;
            let mut hits = Hits::default();
            if let Err(err) = self.apply(done, &mut hits).await {
                self.drain().await;
                return Err(err);
            }
            if !hits.is_empty() {
                return self.interrupt(Vec::new(), hits).await;
            }

            pending = self.channels.get_from_ready_channels(self.want_stream)?;
        }
    }

    /// Load a checkpoint when one applies, otherwise feed the input to START
    async fn start(&mut self, entry: Entry) -> Result<StartPoint> {
        let record = match (&self.core.store, &self.options.checkpoint_id) {
            (Some(store), Some(id)) if !self.options.force_new_run => {
                load_record(store.as_ref(), self.core.serializer.as_ref(), id).await?
            }
            _ => None,
        };

        match (entry, record) {
            (Entry::Resume { checkpoint_id, .. }, None) => {
                Err(CheckpointError::NotFound(checkpoint_id).into())
            }
            (Entry::Resume { input, .. }, Some(record)) => self.restore(record, input),
            (Entry::Fresh(_), Some(record)) => self.restore(record, None),
            (Entry::Fresh(input), None) => {
                tracing::debug!(graph = %self.core.name, mode = ?self.mode, "run started");
                self.route_output(START, input).await?;
                Ok(StartPoint {
                    pending: self.channels.get_from_ready_channels(self.want_stream)?,
                    resumed: false,
                    resume_input: None,
                    skip_pre_handler: BTreeSet::new(),
                })
            }
        }
    }

    fn restore(&mut self, record: CheckpointRecord, resume_input: Option<Value>) -> Result<StartPoint> {
        record.check_version()?;
        if record.mode != self.mode {
            tracing::debug!(stored = ?record.mode, current = ?self.mode, "resuming in a different run mode");
        }

        if let Some(stored) = record.state {
            match &self.state {
                Some(state) => state.set(stored.into_inner()),
                None => self.state = Some(GraphState::new(stored.into_inner())),
            }
        }
        if let Some(modifier) = &self.options.state_modifier {
            let state = self.state.as_ref().ok_or_else(|| {
                GraphError::Configuration("state modifier given but the run has no graph state".into())
            })?;
            state.with(|value| modifier(value))?;
        }

        self.step = record.step;
        self.channels
            .restore(record.channels, self.want_stream, &self.core.output_types)?;

        let mut pending = Vec::with_capacity(record.inputs.len());
        for (node, stored) in record.inputs {
            let spec = self.spec(&node).map_err(|_| {
                CheckpointError::Invalid(format!("checkpoint has an input for unknown node '{node}'"))
            })?;
            pending.push((
                node,
                restore_payload(stored, &spec.input_type, self.want_stream),
            ));
        }

        tracing::info!(
            graph = %self.core.name,
            step = self.step,
            pending = pending.len(),
            "run resumed from checkpoint"
        );
        Ok(StartPoint {
            pending,
            resumed: true,
            resume_input,
            skip_pre_handler: record.skip_pre_handler,
        })
    }

    fn spec(&self, node: &str) -> Result<Arc<NodeSpec>> {
        self.core
            .nodes
            .get(node)
            .cloned()
            .ok_or_else(|| GraphError::Internal(format!("unknown node '{node}'")))
    }

    fn cancelled(&self) -> bool {
        self.options
            .interrupt
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }

    fn dispatch(
        &mut self,
        node: String,
        input: Payload,
        resume_input: Option<Value>,
        skip_pre_handler: bool,
    ) -> Result<()> {
        let task = NodeTask {
            ctx: NodeContext::new(&node, self.state.clone(), resume_input),
            spec: self.spec(&node)?,
            node: node.clone(),
            input,
            state: self.state.clone(),
            merge: Arc::clone(&self.core.merge),
            want_stream: self.want_stream,
            skip_pre_handler,
        };
        self.tasks.submit(node, task.run());
        Ok(())
    }

    /// Wait for this step's completions, giving up early on cancellation
    async fn wait_step(&mut self) -> Vec<TaskOutcome> {
        let Some(token) = self.options.interrupt.clone() else {
            return self.tasks.wait().await;
        };
        let mut done = Vec::new();
        loop {
            tokio::select! {
                batch = self.tasks.wait_any() => done.extend(batch),
                _ = token.cancelled() => break,
            }
            if self.core.eager || self.tasks.is_idle() {
                break;
            }
        }
        done
    }

    /// Wait for in-flight tasks and throw their results away
    async fn drain(&mut self) {
        let abandoned = self.tasks.wait_all().await;
        if !abandoned.is_empty() {
            tracing::debug!(count = abandoned.len(), "discarded results of in-flight nodes");
        }
    }

    async fn apply(&mut self, done: Vec<TaskOutcome>, hits: &mut Hits) -> Result<()> {
        for TaskOutcome {
            node,
            result,
            input,
        } in done
        {
            match result {
                Ok(output) => {
                    tracing::debug!(node = %node, step = self.step, "node completed");
                    self.route_output(&node, output).await?;
                    if self.core.interrupt_after.contains(&node) {
                        hits.after.push(node);
                    }
                }
                Err(GraphError::Interrupted { reason, extra, .. }) => {
                    tracing::warn!(node = %node, reason = %reason, "node requested an interrupt");
                    hits.reruns.push(Rerun { node, extra, input });
                }
                Err(err) => {
                    tracing::error!(node = %node, error = %err, "node failed");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Fan a node's output out to its data successors and branches
    async fn route_output(&self, from: &str, output: Payload) -> Result<()> {
        let core = &self.core;
        let data = core.data_successors.get(from).map(Vec::as_slice).unwrap_or_default();
        let control = core.control_successors.get(from).map(Vec::as_slice).unwrap_or_default();
        let branches = core.branches.get(from).map(Vec::as_slice).unwrap_or_default();

        let needed = data.len() + branches.iter().map(|b| 1 + b.ends().len()).sum::<usize>();
        let mut copies = output.copy(needed).into_iter();
        let mut next_copy = || {
            copies
                .next()
                .ok_or_else(|| GraphError::Internal(format!("ran out of output copies for '{from}'")))
        };

        let mut values: BTreeMap<String, BTreeMap<String, Payload>> = BTreeMap::new();
        for to in data {
            values
                .entry(to.clone())
                .or_default()
                .insert(from.to_string(), next_copy()?);
        }

        let mut skipped = Vec::new();
        for branch in branches {
            let decision = next_copy()?
                .into_value(&core.output_type_of(from), &core.merge)
                .await?;
            let (picked, not_picked) = branch.select(from, &decision)?;
            tracing::debug!(from = %from, picked = ?picked, skipped = ?not_picked, "branch evaluated");
            for end in branch.ends() {
                let payload = next_copy()?;
                if picked.contains(end) {
                    values
                        .entry(end.clone())
                        .or_default()
                        .insert(from.to_string(), payload);
                }
            }
            skipped.extend(not_picked);
        }

        self.channels.update_values(values)?;
        if !control.is_empty() {
            let dependencies = control
                .iter()
                .map(|to| (to.clone(), vec![from.to_string()]))
                .collect();
            self.channels.update_dependencies(dependencies)?;
        }
        if !skipped.is_empty() {
            self.channels.report_branch(from, &skipped)?;
        }
        Ok(())
    }

    /// Stop the run and store everything needed to continue it
    async fn interrupt(
        mut self,
        pending: Vec<(String, Payload)>,
        mut hits: Hits,
    ) -> Result<RunOutcome<Payload>> {
        let rest = self.tasks.wait_all().await;
        self.apply(rest, &mut hits).await?;

        let mut inputs: BTreeMap<String, Payload> = pending.into_iter().collect();
        let mut skip_pre_handler = BTreeSet::new();
        for rerun in &mut hits.reruns {
            let input = rerun.input.take().ok_or_else(|| {
                GraphError::Execution(format!(
                    "node '{}' requested a rerun before its input was prepared",
                    rerun.node
                ))
            })?;
            if self.spec(&rerun.node)?.node.pre_handler().is_some() {
                skip_pre_handler.insert(rerun.node.clone());
            }
            if inputs.insert(rerun.node.clone(), input).is_some() {
                return Err(GraphError::Internal(format!(
                    "node '{}' is both pending and rerun",
                    rerun.node
                )));
            }
        }

        let held: BTreeSet<String> = inputs.keys().cloned().collect();
        for (node, payload) in self
            .channels
            .get_from_ready_channels_except(self.want_stream, &held)?
        {
            if self.core.interrupt_before.contains(&node) && !hits.before.contains(&node) {
                hits.before.push(node.clone());
            }
            inputs.insert(node, payload);
        }

        let pending_nodes: Vec<String> = inputs.keys().cloned().collect();
        let reruns: Vec<(String, Option<Value>)> = hits
            .reruns
            .drain(..)
            .map(|rerun| (rerun.node, rerun.extra))
            .collect();
        let record = self
            .build_record(
                inputs,
                hits.before.clone(),
                hits.after.clone(),
                reruns,
                skip_pre_handler,
            )
            .await?;

        let target = self
            .options
            .write_to_checkpoint_id
            .clone()
            .or_else(|| self.options.checkpoint_id.clone());
        let checkpoint_id = match (&self.core.store, target) {
            (Some(store), Some(id)) => {
                save_record(store.as_ref(), self.core.serializer.as_ref(), &id, &record).await?;
                Some(id)
            }
            _ => None,
        };

        tracing::warn!(
            graph = %self.core.name,
            checkpoint_id = ?checkpoint_id,
            before = ?hits.before,
            after = ?hits.after,
            pending = ?pending_nodes,
            rerun = ?record.rerun_nodes,
            external = hits.external,
            "run interrupted"
        );

        Ok(RunOutcome::Interrupted(InterruptInfo {
            checkpoint_id,
            before_nodes: hits.before,
            after_nodes: hits.after,
            pending_nodes,
            rerun_nodes: record.rerun_nodes,
            rerun_extra: record
                .rerun_extra
                .into_iter()
                .map(|(node, v)| (node, v.into_inner()))
                .collect(),
            state: record.state.map(PersistedValue::into_inner),
            external: hits.external,
        }))
    }

    /// Takes owned parts so no stream payload is borrowed across an await
    async fn build_record(
        &self,
        inputs: BTreeMap<String, Payload>,
        before: Vec<String>,
        after: Vec<String>,
        reruns: Vec<(String, Option<Value>)>,
        skip_pre_handler: BTreeSet<String>,
    ) -> Result<CheckpointRecord> {
        let merge: &MergeRegistry = &self.core.merge;
        let channels = self.channels.checkpoint(merge, &self.core.output_types).await?;

        let mut record = CheckpointRecord::new(self.mode, self.step);
        record.channels = channels;
        for (node, payload) in inputs {
            let input_type = self.spec(&node)?.input_type.clone();
            record
                .inputs
                .insert(node, collapse_payload(payload, &input_type, merge).await?);
        }
        record.state = self.state.as_ref().map(|s| PersistedValue(s.get()));
        record.interrupted_before = before;
        record.interrupted_after = after;
        record.rerun_nodes = reruns.iter().map(|(node, _)| node.clone()).collect();
        record.rerun_extra = reruns
            .into_iter()
            .filter_map(|(node, extra)| extra.map(|v| (node, PersistedValue(v))))
            .collect();
        record.skip_pre_handler = skip_pre_handler;
        Ok(record)
    }
}

/// One node execution, moved onto its own task
struct NodeTask {
    node: String,
    spec: Arc<NodeSpec>,
    ctx: NodeContext,
    input: Payload,
    state: Option<GraphState>,
    merge: Arc<MergeRegistry>,
    want_stream: bool,
    skip_pre_handler: bool,
}

impl NodeTask {
    async fn run(self) -> TaskOutcome {
        let node = self.node.clone();
        let (result, input) = self.execute().await;
        TaskOutcome {
            node,
            result,
            input,
        }
    }

    /// Returns the body's result and the input it was given
    async fn execute(self) -> (Result<Payload>, Option<Payload>) {
        let NodeTask {
            node,
            spec,
            ctx,
            input,
            state,
            merge,
            want_stream,
            skip_pre_handler,
        } = self;
        let types = (&spec.input_type, &spec.output_type);

        let input = match (spec.node.pre_handler(), &state) {
            (Some(handler), Some(state)) if !skip_pre_handler => {
                match apply_handler(handler, state, input, &spec.input_type, &merge, want_stream).await {
                    Ok(input) => input,
                    Err(err) => return (Err(err), None),
                }
            }
            _ => input,
        };

        let mut copies = input.copy(2);
        let (Some(body_input), kept) = (copies.pop(), copies.pop()) else {
            return (
                Err(GraphError::Internal(format!("could not copy the input of '{node}'"))),
                None,
            );
        };

        let output = match spec
            .node
            .executor()
            .execute(ctx, body_input, types, &merge, want_stream)
            .await
        {
            Ok(output) => output,
            Err(err) => return (Err(err), kept),
        };

        let output = match (spec.node.post_handler(), &state) {
            (Some(handler), Some(state)) => {
                apply_handler(handler, state, output, &spec.output_type, &merge, want_stream).await
            }
            _ => Ok(output),
        };
        (output, kept)
    }
}

/// Run a state handler on a payload, collapsing a stream first
async fn apply_handler(
    handler: &crate::state::StateHandler,
    state: &GraphState,
    payload: Payload,
    ty: &DataType,
    merge: &MergeRegistry,
    want_stream: bool,
) -> Result<Payload> {
    let value = payload.into_value(ty, merge).await?;
    let value = state.apply(handler, value)?;
    Ok(if want_stream {
        Payload::Stream(StreamReader::single(value))
    } else {
        Payload::Value(value)
    })
}
