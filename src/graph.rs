//! The build graph: nodes interned by canonical path, builders linking
//! their sources to the targets they produce.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::bail;
use rustc_hash::FxHashMap;

use crate::builder::Action;
use crate::canon;
use crate::error::Error;
use crate::hash::{Digest, Signer};
use crate::idmap::{self, IdMap};

/// Id for a node in the build graph, stable within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);
impl idmap::Id for NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u as u32)
    }
}

/// Id for a builder in the build graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuilderId(u32);
impl idmap::Id for BuilderId {
    fn index(self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for BuilderId {
    fn from(u: usize) -> BuilderId {
        BuilderId(u as u32)
    }
}

/// Polymorphic node content. The default for file nodes is hashing the
/// file's bytes; nodes may instead carry a provider, e.g. a configuration
/// value whose digest invalidates consumers when it changes.
///
/// Digests must be stable across sessions: providers own deterministic
/// serialization of whatever value they represent.
pub trait Content {
    fn digest(&self) -> anyhow::Result<Digest>;

    /// The value bytes, when the content is an in-memory value that
    /// executes may read. Digest-only providers return `None`.
    fn bytes(&self) -> Option<&[u8]> {
        None
    }
}

/// In-memory byte content. Useful for dictionary-style virtual nodes.
pub struct Bytes(pub Vec<u8>);
impl Content for Bytes {
    fn digest(&self) -> anyhow::Result<Digest> {
        Ok(Digest::of_bytes(&self.0))
    }

    fn bytes(&self) -> Option<&[u8]> {
        Some(&self.0)
    }
}

#[derive(Clone)]
pub enum NodeKind {
    /// An artifact on disk, identified by canonical path.
    File,
    /// An artifact whose content is an in-memory value, either computed by
    /// its producer during this session or supplied by a `Content`.
    Virtual { value: Option<Vec<u8>> },
}

pub struct Node {
    /// Canonical path (files) or symbolic name (virtual).
    pub name: String,
    pub kind: NodeKind,
    /// The unique builder producing this node, if any. Permanent once set.
    pub producer: Option<BuilderId>,
    /// Builders whose source list contains this node.
    pub consumers: Vec<BuilderId>,
    /// User-added dependency edges: nodes whose freshness implies this
    /// node must be rechecked, independent of any builder.
    pub deps: Vec<NodeId>,
    pub content: Option<Rc<dyn Content>>,
}

impl Node {
    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, NodeKind::Virtual { .. })
    }

    pub fn value(&self) -> Option<&[u8]> {
        match &self.kind {
            NodeKind::Virtual { value } => value.as_deref(),
            NodeKind::File => None,
        }
    }
}

/// A dynamic source registered on a builder, grouped by dependency-kind.
#[derive(Clone)]
pub struct DynSource {
    pub kind: String,
    pub node: NodeId,
    /// Opaque payload round-tripped through the build record for the
    /// kind's handler.
    pub data: Option<String>,
}

/// Progress of one builder through the session; see the driver.
/// A builder executes at most once per session: demands made while it is
/// in flight rendezvous on this state rather than starting a second run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildState {
    /// Not demanded by any build yet.
    Unvisited,
    /// Demanded; waiting for generated inputs.
    Want,
    /// Inputs done; waiting to be checked or for a job slot.
    Ready,
    /// Execute dispatched to a worker.
    Running,
    /// Executed; waiting for producers of deps discovered during execute.
    AwaitDeps { outstanding: usize },
    /// Finished successfully. `executed` is false when the oracle judged
    /// the builder fresh.
    Done { executed: bool },
    Failed,
}

pub struct Builder {
    pub action: Arc<dyn Action>,
    /// Static sources, in declared order.
    pub srcs: Vec<NodeId>,
    /// Targets, in declared order; all produced atomically on success.
    pub targets: Vec<NodeId>,
    /// Dynamic sources observed this session (restored + discovered).
    pub dyn_srcs: Vec<DynSource>,
    pub state: BuildState,
}

impl Builder {
    pub fn dyn_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.dyn_srcs.iter().map(|d| d.node)
    }
}

/// The session's node registry and builder graph.
pub struct Graph {
    pub nodes: IdMap<NodeId, Node>,
    pub builders: IdMap<BuilderId, Builder>,
    by_name: FxHashMap<String, NodeId>,
    root: PathBuf,
    allow_escape: bool,
}

impl Graph {
    pub fn new(root: PathBuf, allow_escape: bool) -> Graph {
        Graph {
            nodes: IdMap::new(),
            builders: IdMap::new(),
            by_name: FxHashMap::default(),
            root,
            allow_escape,
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn builder(&self, id: BuilderId) -> &Builder {
        &self.builders[id]
    }

    pub fn builder_mut(&mut self, id: BuilderId) -> &mut Builder {
        &mut self.builders[id]
    }

    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        if let Some(&id) = self.by_name.get(path) {
            return Some(id);
        }
        self.by_name.get(&canon::canon_path(path)).copied()
    }

    /// Look up or create the file node for `path`. Two constructions with
    /// the same canonical path yield the same node.
    pub fn file(&mut self, path: &str) -> anyhow::Result<NodeId> {
        let name = canon::canon_path(path);
        if !self.allow_escape && canon::escapes_root(&name) {
            bail!(Error::EscapesRoot(name));
        }
        if let Some(&id) = self.by_name.get(&name) {
            if self.nodes[id].is_virtual() {
                bail!(Error::NodeTypeConflict(name));
            }
            return Ok(id);
        }
        Ok(self.insert(name, NodeKind::File))
    }

    /// Look up or create the virtual node named `name`. File and virtual
    /// nodes share the namespace; a clash is a type conflict.
    pub fn virtual_node(&mut self, name: &str) -> anyhow::Result<NodeId> {
        if let Some(&id) = self.by_name.get(name) {
            if !self.nodes[id].is_virtual() {
                bail!(Error::NodeTypeConflict(name.to_owned()));
            }
            return Ok(id);
        }
        Ok(self.insert(name.to_owned(), NodeKind::Virtual { value: None }))
    }

    fn insert(&mut self, name: String, kind: NodeKind) -> NodeId {
        let id = self.nodes.push(Node {
            name: name.clone(),
            kind,
            producer: None,
            consumers: Vec::new(),
            deps: Vec::new(),
            content: None,
        });
        self.by_name.insert(name, id);
        id
    }

    /// The on-disk path of a file node, resolved against the session root.
    pub fn node_path(&self, id: NodeId) -> PathBuf {
        self.root.join(&self.nodes[id].name)
    }

    /// Register a builder transforming `srcs` into `targets`. Claims each
    /// target's producer slot; a second claim is `DuplicateProducer`.
    pub fn add_builder(
        &mut self,
        action: Arc<dyn Action>,
        srcs: Vec<NodeId>,
        targets: Vec<NodeId>,
    ) -> anyhow::Result<BuilderId> {
        let id = self.builders.next_id();
        for &target in &targets {
            let node = &self.nodes[target];
            if node.producer.is_some() {
                bail!(Error::DuplicateProducer(node.name.clone()));
            }
        }
        for &target in &targets {
            self.nodes[target].producer = Some(id);
            // User dependency edges added before the producer existed
            // must still wake it.
            for dep in self.nodes[target].deps.clone() {
                self.add_consumer(dep, id);
            }
        }
        for &src in &srcs {
            self.add_consumer(src, id);
        }
        self.builders.push(Builder {
            action,
            srcs,
            targets,
            dyn_srcs: Vec::new(),
            state: BuildState::Unvisited,
        });
        Ok(id)
    }

    fn add_consumer(&mut self, node: NodeId, builder: BuilderId) {
        let consumers = &mut self.nodes[node].consumers;
        if !consumers.contains(&builder) {
            consumers.push(builder);
        }
    }

    /// Register a dynamic source under a dependency-kind. Idempotent per
    /// (builder, node); returns whether the node was new to the builder.
    pub fn add_dynsrc(
        &mut self,
        builder: BuilderId,
        kind: &str,
        node: NodeId,
        data: Option<String>,
    ) -> bool {
        let b = &mut self.builders[builder];
        if b.srcs.contains(&node) || b.dyn_srcs.iter().any(|d| d.node == node) {
            return false;
        }
        b.dyn_srcs.push(DynSource {
            kind: kind.to_owned(),
            node,
            data,
        });
        self.add_consumer(node, builder);
        true
    }

    /// Add a user dependency edge: `id` must be rechecked when `dep` is
    /// out of date, independent of any builder.
    pub fn dependency_add(&mut self, id: NodeId, dep: NodeId) {
        if self.nodes[id].deps.contains(&dep) {
            return;
        }
        self.nodes[id].deps.push(dep);
        // The edge makes `dep` an input of `id`'s producer.
        if let Some(producer) = self.nodes[id].producer {
            self.add_consumer(dep, producer);
        }
    }

    /// Record a virtual node's produced value.
    pub fn set_value(&mut self, id: NodeId, bytes: Vec<u8>) {
        match &mut self.nodes[id].kind {
            NodeKind::Virtual { value } => *value = Some(bytes),
            NodeKind::File => panic!("set_value on file node"),
        }
    }

    /// The builder's signature: a stable digest of its class identity and
    /// configuration, compared against the persisted one by the oracle.
    pub fn signature(&self, id: BuilderId) -> Digest {
        let b = &self.builders[id];
        let mut sig = Signer::new();
        sig.write_str(b.action.name());
        b.action.sign(&mut sig);
        sig.finish()
    }

    /// Display name for a builder in errors and logs.
    pub fn builder_label(&self, id: BuilderId) -> String {
        let b = &self.builders[id];
        match b.targets.first() {
            Some(&t) => format!("{} {}", b.action.name(), self.nodes[t].name),
            None => b.action.name().to_owned(),
        }
    }
}
