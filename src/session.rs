//! One top-level build invocation: the option set, the node/builder graph,
//! the database handle, and the sticky failure slot, behind the public
//! API a drakefile program drives.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use crate::builder::Action;
use crate::db::BuildDb;
use crate::dyndep::{DepsHandler, DepsHandlers};
use crate::error::Error;
use crate::fs::{self, MTime};
use crate::graph::{BuilderId, Content, Graph, NodeId};
use crate::hash::Hasher;
use crate::work::Work;

/// Session options. `use_mtime` may be overridden by the `DRAKE_MTIME`
/// environment variable at session construction.
#[derive(Clone, Debug)]
pub struct Options {
    /// Number of job slots; externally observable work running at once.
    pub jobs: usize,
    /// Skip hashing a source whose recorded mtime is unchanged.
    pub use_mtime: bool,
    /// After a rebuild, push target mtimes past source mtimes so the
    /// fast-path stays monotone across clock skew.
    pub adjust_mtime_future: bool,
    /// Root of the build tree; node paths are canonical relative to it.
    pub root: PathBuf,
    /// Permit node paths that resolve outside the root.
    pub allow_escape: bool,
}

impl Options {
    pub fn new(root: impl Into<PathBuf>) -> Options {
        Options {
            jobs: 1,
            use_mtime: true,
            adjust_mtime_future: false,
            root: root.into(),
            allow_escape: false,
        }
    }

    /// Apply the `DRAKE_MTIME` override: "0" disables the mtime
    /// fast-path, anything else (or absence) leaves the default.
    pub fn apply_mtime_env(&mut self, value: Option<&str>) {
        if value == Some("0") {
            self.use_mtime = false;
        }
    }
}

pub struct Session {
    options: Options,
    graph: Graph,
    db: BuildDb,
    hasher: Hasher,
    handlers: DepsHandlers,
    failure: Option<Error>,
}

impl Session {
    pub fn new(mut options: Options) -> anyhow::Result<Session> {
        options.apply_mtime_env(std::env::var("DRAKE_MTIME").ok().as_deref());
        options.jobs = options.jobs.max(1);
        let db = BuildDb::open(&options.root)?;
        debug!(root = %options.root.display(), jobs = options.jobs, "session opened");
        Ok(Session {
            graph: Graph::new(options.root.clone(), options.allow_escape),
            db,
            hasher: Hasher::new(),
            handlers: DepsHandlers::new(),
            failure: None,
            options,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Look up or create the file node for a path.
    pub fn node(&mut self, path: &str) -> anyhow::Result<NodeId> {
        self.graph.file(path)
    }

    /// Plural convenience for `node`.
    pub fn nodes(&mut self, paths: &[&str]) -> anyhow::Result<Vec<NodeId>> {
        paths.iter().map(|p| self.graph.file(p)).collect()
    }

    /// Declare a leaf file with no producer.
    pub fn touch(&mut self, path: &str) -> anyhow::Result<NodeId> {
        self.graph.file(path)
    }

    /// Look up or create a virtual node.
    pub fn virtual_node(&mut self, name: &str) -> anyhow::Result<NodeId> {
        self.graph.virtual_node(name)
    }

    /// Attach a `Content` provider: the node hashes through it instead of
    /// reading file bytes.
    pub fn set_content(&mut self, node: NodeId, content: Rc<dyn Content>) {
        self.graph.node_mut(node).content = Some(content);
    }

    /// Add a user dependency edge: `node` is rechecked whenever `dep` is
    /// out of date, independent of any builder.
    pub fn dependency_add(&mut self, node: NodeId, dep: NodeId) {
        self.graph.dependency_add(node, dep);
    }

    /// Register a builder producing `targets` from `srcs`.
    pub fn add_builder(
        &mut self,
        action: impl Action + 'static,
        srcs: Vec<NodeId>,
        targets: Vec<NodeId>,
    ) -> anyhow::Result<BuilderId> {
        self.graph.add_builder(Arc::new(action), srcs, targets)
    }

    /// Register a dynamic-dependency kind handler. Idempotent per kind.
    pub fn register_deps_handler(&mut self, kind: &str, handler: DepsHandler) {
        self.handlers.register(kind, handler);
    }

    /// The canonical name of a node.
    pub fn node_name(&self, node: NodeId) -> &str {
        &self.graph.node(node).name
    }

    /// A virtual node's value, if produced or set this session.
    pub fn value(&self, node: NodeId) -> Option<&[u8]> {
        self.graph.node(node).value()
    }

    /// How many file contents were hashed so far this session.
    pub fn files_hashed(&self) -> usize {
        self.hasher.files_hashed()
    }

    /// Drive a target to completion, executing whatever part of its input
    /// closure is out of date. Returns the number of builders executed.
    ///
    /// On the first builder failure the session is poisoned: this and
    /// every subsequent `build` call surfaces the first failure.
    pub fn build(&mut self, target: NodeId) -> anyhow::Result<usize> {
        if let Some(err) = &self.failure {
            return Err(err.clone().into());
        }

        let node = self.graph.node(target);
        if node.producer.is_none() {
            let missing = if node.is_virtual() {
                node.value().is_none() && node.content.is_none()
            } else {
                fs::stat(&self.graph.node_path(target))? == MTime::Missing
            };
            if missing {
                return Err(Error::MissingSource(node.name.clone()).into());
            }
        }

        let mut work = Work::new(
            &mut self.graph,
            &self.db,
            &self.hasher,
            &self.handlers,
            &self.options,
            &mut self.failure,
        );
        if let Err(err) = work.want_node(target) {
            work.abandon();
            return Err(err);
        }
        work.run()
    }
}
