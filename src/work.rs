//! Build driver, choosing and executing builders as determined by out of
//! date inputs.
//!
//! One engine thread drives every builder through the states in
//! `graph::BuildState`; the only work that leaves this thread is
//! `Action::execute`, dispatched through the job runner. Builders waiting
//! on other builders, on a job slot, or on a job result simply stay in
//! their state until the event that unblocks them arrives.

use anyhow::bail;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::builder::{DepsContext, ExecContext, ExecSource, ExecTarget};
use crate::db::{BuildDb, BuildRecord, DynSourceStamp, SourceStamp};
use crate::dyndep::DepsHandlers;
use crate::error::Error;
use crate::fs::{self, MTime};
use crate::graph::{BuildState, BuilderId, Graph, NodeId};
use crate::hash::{Digest, Hasher};
use crate::outdated::{self, FileState, Stale, Verdict};
use crate::session::Options;
use crate::task::{FinishedJob, Runner, Termination};

pub struct Work<'a> {
    graph: &'a mut Graph,
    db: &'a BuildDb,
    hasher: &'a Hasher,
    handlers: &'a DepsHandlers,
    options: &'a Options,
    /// The session's sticky first-failure slot.
    failure: &'a mut Option<Error>,

    file_state: FileState,
    runner: Runner,
    /// Builders whose inputs are all up to date, awaiting check/dispatch.
    ready: Vec<BuilderId>,
    /// Builders paused in AwaitDeps until a discovered dep's node is
    /// produced. Ordinary wake-ups flow through the graph's consumer
    /// edges instead.
    dyn_waiters: FxHashMap<NodeId, Vec<BuilderId>>,
    /// Nodes already walked by this build's planning.
    visited: FxHashSet<NodeId>,
    /// Builders that must execute regardless of the oracle, because a
    /// persisted dynamic dep could not be restored.
    forced: FxHashSet<BuilderId>,
    executed: usize,
}

impl<'a> Work<'a> {
    pub fn new(
        graph: &'a mut Graph,
        db: &'a BuildDb,
        hasher: &'a Hasher,
        handlers: &'a DepsHandlers,
        options: &'a Options,
        failure: &'a mut Option<Error>,
    ) -> Work<'a> {
        let runner = Runner::new(options.jobs);
        Work {
            graph,
            db,
            hasher,
            handlers,
            options,
            failure,
            file_state: FileState::new(),
            runner,
            ready: Vec::new(),
            dyn_waiters: FxHashMap::default(),
            visited: FxHashSet::default(),
            forced: FxHashSet::default(),
            executed: 0,
        }
    }

    fn done(&self, id: BuilderId) -> bool {
        matches!(self.graph.builder(id).state, BuildState::Done { .. })
    }

    /// Demand that a node be brought up to date.
    pub fn want_node(&mut self, id: NodeId) -> anyhow::Result<()> {
        let mut stack = Vec::new();
        self.want_node_rec(id, &mut stack)
    }

    fn want_node_rec(&mut self, id: NodeId, stack: &mut Vec<BuilderId>) -> anyhow::Result<()> {
        // Needing a node whose producer we are currently planning the
        // inputs of is a cycle. Checked before the visited dedup, which
        // would otherwise suppress the re-entry that reveals it.
        if let Some(producer) = self.graph.node(id).producer {
            if stack.contains(&producer) {
                bail!(self.cycle_error(stack, producer));
            }
        }
        if !self.visited.insert(id) {
            return Ok(());
        }
        if let Some(producer) = self.graph.node(id).producer {
            self.want_builder(producer, stack)?;
        }
        for dep in self.graph.node(id).deps.clone() {
            self.want_node_rec(dep, stack)?;
        }
        Ok(())
    }

    /// Visit a builder whose targets are demanded; recursively visits its
    /// inputs. Re-entering a builder on the visit stack is a cycle.
    fn want_builder(&mut self, id: BuilderId, stack: &mut Vec<BuilderId>) -> anyhow::Result<()> {
        match self.graph.builder(id).state {
            BuildState::Unvisited => {}
            BuildState::Done { .. } | BuildState::Failed => return Ok(()),
            _ => {
                if stack.contains(&id) {
                    bail!(self.cycle_error(stack, id));
                }
                return Ok(());
            }
        }
        self.graph.builder_mut(id).state = BuildState::Want;
        stack.push(id);

        self.restore_dyn(id)?;
        if self.graph.builder(id).state == BuildState::Failed {
            // The dependencies() hook raised; the session failure is set.
            stack.pop();
            return Ok(());
        }

        let inputs = self.inputs(id);
        for &input in &inputs {
            self.want_node_rec(input, stack)?;
        }
        stack.pop();

        // Builders with pending generated inputs stay in Want; their
        // inputs' consumer edges bring them back when a producer
        // finishes.
        if self.ready_now(id) {
            self.graph.builder_mut(id).state = BuildState::Ready;
            self.ready.push(id);
        }
        Ok(())
    }

    /// Roll back an aborted planning pass (e.g. a detected cycle) so the
    /// session stays usable for other targets.
    pub fn abandon(&mut self) {
        for id in self.graph.builders.ids() {
            let state = &mut self.graph.builder_mut(id).state;
            if matches!(state, BuildState::Want | BuildState::Ready) {
                *state = BuildState::Unvisited;
            }
        }
        self.ready.clear();
    }

    /// Static inputs plus the dynamic sources known so far, in order.
    fn inputs(&self, id: BuilderId) -> Vec<NodeId> {
        let mut inputs = outdated::static_inputs(self.graph, id);
        for node in self.graph.builder(id).dyn_nodes() {
            if !inputs.contains(&node) {
                inputs.push(node);
            }
        }
        inputs
    }

    fn cycle_error(&self, stack: &[BuilderId], id: BuilderId) -> Error {
        let pos = stack.iter().position(|&b| b == id).unwrap_or(0);
        let mut path: Vec<String> = stack[pos..]
            .iter()
            .map(|&b| self.graph.builder_label(b))
            .collect();
        path.push(self.graph.builder_label(id));
        Error::CycleDetected(path)
    }

    /// Restore the dynamic sources persisted by the last successful build
    /// through their kind handlers, then give the action's
    /// `dependencies()` hook its chance.
    fn restore_dyn(&mut self, id: BuilderId) -> anyhow::Result<()> {
        let record = self
            .graph
            .builder(id)
            .targets
            .first()
            .map(|&t| self.graph.node(t).name.clone())
            .and_then(|name| self.db.read(&name));
        if let Some(record) = record {
            for stamp in &record.dyn_sources {
                match self
                    .handlers
                    .restore(self.graph, id, &stamp.kind, &stamp.dep_ref())
                {
                    Some(Ok(node)) => {
                        self.graph
                            .add_dynsrc(id, &stamp.kind, node, stamp.data.clone());
                    }
                    Some(Err(err)) => {
                        debug!(path = %stamp.path, %err, "dynamic dep restoration failed");
                        self.forced.insert(id);
                    }
                    None => {
                        debug!(kind = %stamp.kind, "no handler for persisted dependency kind");
                        self.forced.insert(id);
                    }
                }
            }
        }

        let action = self.graph.builder(id).action.clone();
        let mut cx = DepsContext::new(self.graph, id);
        if let Err(err) = action.dependencies(&mut cx) {
            self.fail(id, Some(format!("{:#}", err)));
        }
        Ok(())
    }

    fn ready_now(&self, id: BuilderId) -> bool {
        self.inputs(id).iter().all(|&input| {
            match self.graph.node(input).producer {
                Some(producer) => self.done(producer),
                None => true,
            }
        })
    }

    /// Drive the demanded subgraph to completion. Returns the number of
    /// builders that executed (fresh builders don't count).
    pub fn run(&mut self) -> anyhow::Result<usize> {
        loop {
            while self.failure.is_none() && self.runner.can_start_more() {
                match self.ready.pop() {
                    Some(id) => self.advance(id)?,
                    None => break,
                }
            }
            if self.runner.is_running() {
                let fin = self.runner.wait();
                self.on_finished(fin)?;
                continue;
            }
            break;
        }
        if let Some(err) = self.failure.clone() {
            return Err(err.into());
        }
        #[cfg(debug_assertions)]
        self.assert_drained();
        Ok(self.executed)
    }

    /// A successful run must leave nothing demanded but unfinished;
    /// anything else is a planner bug surfaced loudly in tests.
    #[cfg(debug_assertions)]
    fn assert_drained(&self) {
        for id in self.graph.builders.ids() {
            let state = &self.graph.builder(id).state;
            assert!(
                matches!(
                    state,
                    BuildState::Unvisited | BuildState::Done { .. } | BuildState::Failed
                ),
                "builder {} stalled in {:?}",
                self.graph.builder_label(id),
                state
            );
        }
    }

    /// Check a ready builder against the oracle and either finish it or
    /// dispatch its execute.
    fn advance(&mut self, id: BuilderId) -> anyhow::Result<()> {
        debug_assert_eq!(self.graph.builder(id).state, BuildState::Ready);
        let verdict = if self.forced.contains(&id) {
            Ok(Verdict::Stale(Stale::NoRecord(self.graph.builder_label(id))))
        } else {
            outdated::check(
                self.graph,
                self.db,
                self.hasher,
                &mut self.file_state,
                self.options.use_mtime,
                id,
            )
        };
        match verdict {
            Err(err) => self.fail(id, Some(format!("{:#}", err))),
            Ok(Verdict::Fresh) => {
                debug!(builder = %self.graph.builder_label(id), "up to date");
                self.finish_builder(id, false)?;
            }
            Ok(Verdict::Stale(why)) => {
                if let Err(err) = self.check_sources_exist(id) {
                    self.fail(id, Some(format!("{:#}", err)));
                    return Ok(());
                }
                debug!(builder = %self.graph.builder_label(id), %why, "running");
                self.dispatch(id)?;
            }
        }
        Ok(())
    }

    /// A producerless source that does not exist is a failure of the
    /// consuming builder, caught before wasting a job slot on it.
    fn check_sources_exist(&mut self, id: BuilderId) -> anyhow::Result<()> {
        for input in self.inputs(id) {
            let node = self.graph.node(input);
            if node.producer.is_some() || node.content.is_some() {
                continue;
            }
            if node.is_virtual() {
                if node.value().is_none() {
                    bail!(Error::MissingSource(node.name.clone()));
                }
            } else if self.file_state.stat(self.graph, input)? == MTime::Missing {
                bail!(Error::MissingSource(node.name.clone()));
            }
        }
        Ok(())
    }

    /// Snapshot the builder's inputs and hand its execute to a worker.
    fn dispatch(&mut self, id: BuilderId) -> anyhow::Result<()> {
        let sources = self
            .inputs(id)
            .iter()
            .map(|&input| {
                let node = self.graph.node(input);
                let value = node
                    .value()
                    .map(|v| v.to_vec())
                    .or_else(|| node.content.as_ref().and_then(|c| c.bytes().map(|b| b.to_vec())));
                ExecSource {
                    name: node.name.clone(),
                    path: (!node.is_virtual()).then(|| self.graph.node_path(input)),
                    value,
                }
            })
            .collect();
        let mut targets = Vec::new();
        for &target in &self.graph.builder(id).targets {
            let node = self.graph.node(target);
            let path = (!node.is_virtual()).then(|| self.graph.node_path(target));
            if let Some(path) = &path {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            targets.push(ExecTarget {
                name: node.name.clone(),
                path,
            });
        }
        let cx = ExecContext::new(self.graph.root().clone(), sources, targets);
        let action = self.graph.builder(id).action.clone();
        self.graph.builder_mut(id).state = BuildState::Running;
        self.runner.start(id, action, cx);
        Ok(())
    }

    /// Given a job that just finished, fail the builder or fold its
    /// results back into the graph.
    fn on_finished(&mut self, fin: FinishedJob) -> anyhow::Result<()> {
        let id = fin.id;
        match fin.outcome.termination {
            Termination::Failure => {
                self.fail(id, fin.outcome.cause);
                return Ok(());
            }
            Termination::Interrupted => {
                self.fail_interrupted(id);
                return Ok(());
            }
            Termination::Success => {}
        }

        // Values produced for virtual targets.
        for (name, bytes) in fin.outcome.produced {
            match self.virtual_target(id, &name) {
                Some(node) => self.graph.set_value(node, bytes),
                None => {
                    self.fail(id, Some(format!("unknown virtual target {}", name)));
                    return Ok(());
                }
            }
        }

        // Dynamic deps declared during execute: register them, and bring
        // the newly discovered ones up to date before finishing. The kind
        // handler only matters on restoration; at discovery time the dep
        // is a plain path to intern.
        let mut outstanding = 0;
        for dep in fin.outcome.discovered {
            let node = match self.graph.file(&dep.path) {
                Ok(node) => node,
                Err(err) => {
                    self.fail(id, Some(format!("{:#}", err)));
                    return Ok(());
                }
            };
            self.graph.add_dynsrc(id, &dep.kind, node, dep.data);
            match self.graph.node(node).producer {
                Some(producer) => {
                    if !self.done(producer) {
                        let mut stack = Vec::new();
                        self.want_builder(producer, &mut stack)?;
                        if !self.done(producer) {
                            self.dyn_waiters.entry(node).or_default().push(id);
                            outstanding += 1;
                        }
                    }
                }
                None => {
                    let missing = if self.graph.node(node).is_virtual() {
                        self.graph.node(node).value().is_none()
                            && self.graph.node(node).content.is_none()
                    } else {
                        self.file_state.restat(self.graph, node)? == MTime::Missing
                    };
                    if missing {
                        self.fail(id, Some(format!("no builder to make {}", dep.path)));
                        return Ok(());
                    }
                }
            }
        }

        if outstanding > 0 {
            self.graph.builder_mut(id).state = BuildState::AwaitDeps { outstanding };
            Ok(())
        } else {
            self.finalize(id)
        }
    }

    fn virtual_target(&self, id: BuilderId, name: &str) -> Option<NodeId> {
        self.graph.builder(id).targets.iter().copied().find(|&t| {
            let node = self.graph.node(t);
            node.is_virtual() && node.name == name
        })
    }

    /// A builder whose execute and discovered deps all succeeded: verify
    /// its targets, stamp its inputs, persist the record.
    fn finalize(&mut self, id: BuilderId) -> anyhow::Result<()> {
        for &target in &self.graph.builder(id).targets.clone() {
            let node = self.graph.node(target);
            let exists = if node.is_virtual() {
                node.value().is_some() || node.content.is_some()
            } else {
                self.file_state.restat(self.graph, target)? != MTime::Missing
            };
            if !exists {
                let name = self.graph.node(target).name.clone();
                self.fail(id, Some(format!("{} was not created", name)));
                return Ok(());
            }
        }

        if self.options.adjust_mtime_future {
            self.adjust_target_mtimes(id)?;
        }

        let statics = outdated::static_inputs(self.graph, id);
        let mut sources = Vec::new();
        for &input in &statics {
            match self.stamp(input) {
                Ok((digest, mtime)) => sources.push(SourceStamp {
                    path: self.graph.node(input).name.clone(),
                    digest,
                    mtime,
                }),
                Err(err) => {
                    self.fail(id, Some(format!("{:#}", err)));
                    return Ok(());
                }
            }
        }
        let mut dyn_sources = Vec::new();
        for dynsrc in self.graph.builder(id).dyn_srcs.clone() {
            let node = self.graph.node(dynsrc.node);
            let node_type = if node.is_virtual() { "virtual" } else { "file" };
            let (path, node_type) = (node.name.clone(), node_type.to_owned());
            match self.stamp(dynsrc.node) {
                Ok((digest, mtime)) => dyn_sources.push(DynSourceStamp {
                    kind: dynsrc.kind,
                    path,
                    node_type,
                    data: dynsrc.data,
                    digest,
                    mtime,
                }),
                Err(err) => {
                    self.fail(id, Some(format!("{:#}", err)));
                    return Ok(());
                }
            }
        }
        let signature = self.graph.signature(id);
        for &target in &self.graph.builder(id).targets.clone() {
            let digest =
                match outdated::node_digest(self.graph, self.hasher, &mut self.file_state, target)
                {
                    Ok(d) => d,
                    Err(err) => {
                        self.fail(id, Some(format!("{:#}", err)));
                        return Ok(());
                    }
                };
            let record = BuildRecord {
                signature,
                sources: sources.clone(),
                dyn_sources: dyn_sources.clone(),
                target: digest,
            };
            let name = self.graph.node(target).name.clone();
            self.db.write(&name, &record)?;
        }

        debug!(builder = %self.graph.builder_label(id), "finished");
        self.finish_builder(id, true)
    }

    fn stamp(&mut self, input: NodeId) -> anyhow::Result<(Digest, Option<i64>)> {
        let digest =
            outdated::node_digest(self.graph, self.hasher, &mut self.file_state, input)?;
        let mtime = if self.graph.node(input).is_virtual() {
            None
        } else {
            self.file_state.stat(self.graph, input)?.seconds()
        };
        Ok((digest, mtime))
    }

    /// Keep target mtimes ahead of source mtimes so the fast-path stays
    /// monotone across clock skew.
    fn adjust_target_mtimes(&mut self, id: BuilderId) -> anyhow::Result<()> {
        let mut src_max = None;
        for input in self.inputs(id) {
            if self.graph.node(input).is_virtual() {
                continue;
            }
            if let Some(seconds) = self.file_state.stat(self.graph, input)?.seconds() {
                src_max = Some(src_max.map_or(seconds, |m: i64| m.max(seconds)));
            }
        }
        let Some(src_max) = src_max else {
            return Ok(());
        };
        for &target in &self.graph.builder(id).targets.clone() {
            if self.graph.node(target).is_virtual() {
                continue;
            }
            if let MTime::Stamp(current) = self.file_state.stat(self.graph, target)? {
                if current < src_max + 1 {
                    fs::set_mtime(&self.graph.node_path(target), src_max + 1)?;
                    self.file_state.restat(self.graph, target)?;
                }
            }
        }
        Ok(())
    }

    /// Mark a builder complete and check whether its dependents are now
    /// ready, via the consumer edges of each finished target.
    fn finish_builder(&mut self, id: BuilderId, executed: bool) -> anyhow::Result<()> {
        self.graph.builder_mut(id).state = BuildState::Done { executed };
        if executed {
            self.executed += 1;
        }
        let targets = self.graph.builder(id).targets.clone();

        let mut dependents = FxHashSet::default();
        for &target in &targets {
            for &consumer in &self.graph.node(target).consumers {
                dependents.insert(consumer);
            }
        }
        for dependent in dependents {
            if self.graph.builder(dependent).state != BuildState::Want {
                continue;
            }
            if !self.ready_now(dependent) {
                continue;
            }
            self.graph.builder_mut(dependent).state = BuildState::Ready;
            self.ready.push(dependent);
        }

        // Builders that already executed and were paused on this node.
        let mut finalize = Vec::new();
        for &target in &targets {
            let Some(waiters) = self.dyn_waiters.remove(&target) else {
                continue;
            };
            for waiter in waiters {
                if let BuildState::AwaitDeps { outstanding } = self.graph.builder(waiter).state {
                    if outstanding == 1 {
                        finalize.push(waiter);
                    } else {
                        self.graph.builder_mut(waiter).state = BuildState::AwaitDeps {
                            outstanding: outstanding - 1,
                        };
                    }
                }
            }
        }
        for waiter in finalize {
            self.finalize(waiter)?;
        }
        Ok(())
    }

    fn fail(&mut self, id: BuilderId, cause: Option<String>) {
        self.graph.builder_mut(id).state = BuildState::Failed;
        let builder = self.graph.builder_label(id);
        debug!(%builder, cause = cause.as_deref().unwrap_or("execute returned false"), "failed");
        if self.failure.is_none() {
            *self.failure = Some(Error::BuilderFailed { builder, cause });
        }
    }

    fn fail_interrupted(&mut self, id: BuilderId) {
        self.graph.builder_mut(id).state = BuildState::Failed;
        debug!(builder = %self.graph.builder_label(id), "interrupted");
        if self.failure.is_none() {
            *self.failure = Some(Error::Interrupted);
        }
    }
}

