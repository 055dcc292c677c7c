//! The contract a builder implementation satisfies, and the contexts the
//! engine hands it.
//!
//! `execute` runs as a job on a worker thread: it sees a snapshot of its
//! resolved inputs and hands back everything it produced or discovered.
//! `dependencies` runs on the engine thread before the staleness check and
//! may re-register dynamic sources from builder-private state.

use std::path::{Path, PathBuf};

use anyhow::bail;

use crate::graph::{BuilderId, Graph, NodeId};
use crate::hash::Signer;

/// A transformation producing a set of target nodes from sources.
///
/// Implementations are behavior plus configuration; the engine owns the
/// wiring (which nodes, what order, when to run).
pub trait Action: Send + Sync {
    /// Class identity, also the prefix of log and error labels.
    fn name(&self) -> &str;

    /// Fold the configuration into the builder's signature. A changed
    /// signature makes every target stale.
    fn sign(&self, sig: &mut Signer);

    /// Optional pre-execute hook to register dynamic sources from state
    /// the builder persisted itself. Most builders rely on the engine's
    /// own record restoration and skip this.
    fn dependencies(&self, cx: &mut DepsContext) -> anyhow::Result<()> {
        let _ = cx;
        Ok(())
    }

    /// Perform the transformation; `Ok(false)` and `Err(..)` are both
    /// failures, the latter with a cause. Must be idempotent.
    fn execute(&self, cx: &mut ExecContext) -> anyhow::Result<bool>;
}

/// Engine-thread context for `Action::dependencies`.
pub struct DepsContext<'a> {
    graph: &'a mut Graph,
    builder: BuilderId,
}

impl<'a> DepsContext<'a> {
    pub(crate) fn new(graph: &'a mut Graph, builder: BuilderId) -> Self {
        DepsContext { graph, builder }
    }

    pub fn root(&self) -> &Path {
        self.graph.root()
    }

    /// Register a file at `path` as a dynamic source under `kind`.
    pub fn add_dynsrc(&mut self, kind: &str, path: &str) -> anyhow::Result<NodeId> {
        self.add_dynsrc_with_data(kind, path, None)
    }

    pub fn add_dynsrc_with_data(
        &mut self,
        kind: &str,
        path: &str,
        data: Option<String>,
    ) -> anyhow::Result<NodeId> {
        let node = self.graph.file(path)?;
        self.graph.add_dynsrc(self.builder, kind, node, data);
        Ok(node)
    }
}

/// One resolved input as `execute` sees it.
pub struct ExecSource {
    /// Canonical node name.
    pub name: String,
    /// On-disk path; None for virtual sources.
    pub path: Option<PathBuf>,
    /// Value snapshot for virtual sources produced earlier in the session
    /// or backed by a `Content` value.
    pub value: Option<Vec<u8>>,
}

/// One target as `execute` sees it.
pub struct ExecTarget {
    pub name: String,
    /// On-disk path; None for virtual targets, which are produced through
    /// `ExecContext::write_virtual`.
    pub path: Option<PathBuf>,
}

/// A dynamic input declared during execute, resolved to a node by the
/// engine once the job completes.
pub struct DiscoveredDep {
    pub kind: String,
    pub path: String,
    pub data: Option<String>,
}

/// Worker-thread context for `Action::execute`: a snapshot of inputs, and
/// collectors for everything the job produces.
pub struct ExecContext {
    root: PathBuf,
    sources: Vec<ExecSource>,
    targets: Vec<ExecTarget>,
    discovered: Vec<DiscoveredDep>,
    produced: Vec<(String, Vec<u8>)>,
}

impl ExecContext {
    pub(crate) fn new(root: PathBuf, sources: Vec<ExecSource>, targets: Vec<ExecTarget>) -> Self {
        ExecContext {
            root,
            sources,
            targets,
            discovered: Vec::new(),
            produced: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sources(&self) -> &[ExecSource] {
        &self.sources
    }

    pub fn targets(&self) -> &[ExecTarget] {
        &self.targets
    }

    /// The on-disk path of source `i`; errors on virtual sources.
    pub fn source_path(&self, i: usize) -> anyhow::Result<&Path> {
        match self.sources[i].path.as_deref() {
            Some(p) => Ok(p),
            None => bail!("source {} is virtual", self.sources[i].name),
        }
    }

    /// The on-disk path of target `i`; errors on virtual targets.
    pub fn target_path(&self, i: usize) -> anyhow::Result<&Path> {
        match self.targets[i].path.as_deref() {
            Some(p) => Ok(p),
            None => bail!("target {} is virtual", self.targets[i].name),
        }
    }

    /// Declare an input discovered while executing, under a registered
    /// dependency-kind. The engine brings it up to date and records it so
    /// the next session consults it before executing.
    pub fn add_dynsrc(&mut self, kind: &str, path: impl Into<String>) {
        self.add_dynsrc_with_data(kind, path, None)
    }

    pub fn add_dynsrc_with_data(
        &mut self,
        kind: &str,
        path: impl Into<String>,
        data: Option<String>,
    ) {
        self.discovered.push(DiscoveredDep {
            kind: kind.to_owned(),
            path: path.into(),
            data,
        });
    }

    /// Produce the value of a virtual target.
    pub fn write_virtual(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.produced.push((name.into(), bytes));
    }

    pub(crate) fn into_results(self) -> (Vec<DiscoveredDep>, Vec<(String, Vec<u8>)>) {
        (self.discovered, self.produced)
    }
}
