//! The staleness oracle: decides whether a builder must re-execute by
//! comparing the current state of its targets and sources against the
//! persisted build records.
//!
//! A builder is fresh iff every target artifact exists, every target's
//! recorded producer signature matches, and every recorded source (static
//! and dynamic) is unchanged — where "unchanged" is the mtime fast-path
//! when it applies, and a content digest comparison otherwise.

use std::fmt;

use anyhow::{anyhow, bail};
use tracing::debug;

use crate::db::{BuildDb, BuildRecord};
use crate::error::Error;
use crate::fs::{self, MTime};
use crate::graph::{BuilderId, Graph, NodeId};
use crate::hash::{Digest, Hasher};
use crate::idmap::IdMap;

/// Per-node mtime cache for one build, so each path is stat()ed once
/// unless the driver invalidates it after writing the file.
pub struct FileState(IdMap<NodeId, Option<MTime>>);

impl FileState {
    pub fn new() -> FileState {
        FileState(IdMap::new())
    }

    pub fn get(&self, id: NodeId) -> Option<MTime> {
        self.0.lookup(id).copied().flatten()
    }

    /// The node's mtime, stat()ing on first query.
    pub fn stat(&mut self, graph: &Graph, id: NodeId) -> std::io::Result<MTime> {
        if let Some(mtime) = self.get(id) {
            return Ok(mtime);
        }
        self.restat(graph, id)
    }

    /// stat() unconditionally, refreshing the cache.
    pub fn restat(&mut self, graph: &Graph, id: NodeId) -> std::io::Result<MTime> {
        let mtime = fs::stat(&graph.node_path(id))?;
        self.0.grow(id, None);
        self.0[id] = Some(mtime);
        Ok(mtime)
    }
}

/// Why a builder is stale; surfaced through debug logging.
pub enum Stale {
    MissingTarget(String),
    NoRecord(String),
    SignatureChanged(String),
    SourceChanged(String),
    NewSource(String),
    UnknownDepKind(String),
}

impl fmt::Display for Stale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stale::MissingTarget(p) => write!(f, "target {} missing", p),
            Stale::NoRecord(p) => write!(f, "no record of building {}", p),
            Stale::SignatureChanged(p) => write!(f, "builder configuration for {} changed", p),
            Stale::SourceChanged(p) => write!(f, "source {} changed", p),
            Stale::NewSource(p) => write!(f, "new source {} appeared", p),
            Stale::UnknownDepKind(k) => write!(f, "no handler for dependency kind {}", k),
        }
    }
}

pub enum Verdict {
    Fresh,
    Stale(Stale),
}

/// The static input set of a builder: declared sources plus user-added
/// dependency edges of its targets.
pub fn static_inputs(graph: &Graph, id: BuilderId) -> Vec<NodeId> {
    let b = graph.builder(id);
    let mut inputs = b.srcs.clone();
    for &target in &b.targets {
        for &dep in &graph.node(target).deps {
            if !inputs.contains(&dep) {
                inputs.push(dep);
            }
        }
    }
    inputs
}

/// Digest a node's current content: its `Content` provider if any, the
/// produced in-memory value for virtual nodes, file bytes otherwise.
pub fn node_digest(
    graph: &Graph,
    hasher: &Hasher,
    file_state: &mut FileState,
    id: NodeId,
) -> anyhow::Result<Digest> {
    let node = graph.node(id);
    if let Some(content) = &node.content {
        return content.digest();
    }
    if node.is_virtual() {
        return match node.value() {
            Some(bytes) => Ok(Digest::of_bytes(bytes)),
            None => Err(anyhow!("virtual node {} has no value", node.name)),
        };
    }
    match file_state.stat(graph, id)? {
        MTime::Missing => {
            if node.producer.is_none() {
                bail!(Error::MissingSource(node.name.clone()));
            }
            Err(anyhow!("generated file {} is missing", node.name))
        }
        MTime::Stamp(mtime) => Ok(hasher.hash_file(&graph.node_path(id), &node.name, mtime)?),
    }
}

/// Whether one source still matches its recorded digest/mtime pair.
fn source_unchanged(
    graph: &Graph,
    hasher: &Hasher,
    file_state: &mut FileState,
    use_mtime: bool,
    id: NodeId,
    recorded_digest: Digest,
    recorded_mtime: Option<i64>,
) -> anyhow::Result<bool> {
    let node = graph.node(id);
    // The fast path: an unchanged file mtime means unchanged content,
    // without ever reading the file. Only leaf sources qualify: a
    // regenerated file can land on the same timestamp as the recorded
    // one within mtime granularity.
    if use_mtime && !node.is_virtual() && node.producer.is_none() {
        if let Some(recorded) = recorded_mtime {
            if file_state.stat(graph, id)? == MTime::Stamp(recorded) {
                return Ok(true);
            }
        }
    }
    Ok(node_digest(graph, hasher, file_state, id)? == recorded_digest)
}

/// Decide fresh vs stale for a builder. Errors are builder failures (e.g.
/// a producerless source that does not exist).
pub fn check(
    graph: &Graph,
    db: &BuildDb,
    hasher: &Hasher,
    file_state: &mut FileState,
    use_mtime: bool,
    id: BuilderId,
) -> anyhow::Result<Verdict> {
    let b = graph.builder(id);
    let signature = graph.signature(id);

    // Every target must exist and carry a matching record.
    let mut record: Option<BuildRecord> = None;
    for &target in &b.targets {
        let node = graph.node(target);
        let exists = if node.is_virtual() {
            node.value().is_some() || node.content.is_some()
        } else {
            file_state.stat(graph, target)? != MTime::Missing
        };
        if !exists {
            return stale(graph, id, Stale::MissingTarget(node.name.clone()));
        }
        match db.read(&node.name) {
            None => return stale(graph, id, Stale::NoRecord(node.name.clone())),
            Some(r) => {
                if r.signature != signature {
                    return stale(graph, id, Stale::SignatureChanged(node.name.clone()));
                }
                record.get_or_insert(r);
            }
        }
    }
    let record = match record {
        Some(r) => r,
        // A builder with no targets has nothing to be fresh about.
        None => return stale(graph, id, Stale::NoRecord(graph.builder_label(id))),
    };

    // Static sources, against the recorded stamps.
    for src in static_inputs(graph, id) {
        let name = &graph.node(src).name;
        let stamp = match record.sources.iter().find(|s| &s.path == name) {
            Some(stamp) => stamp,
            None => return stale(graph, id, Stale::NewSource(name.clone())),
        };
        if !source_unchanged(graph, hasher, file_state, use_mtime, src, stamp.digest, stamp.mtime)?
        {
            return stale(graph, id, Stale::SourceChanged(name.clone()));
        }
    }

    // Dynamic sources are judged against the last persisted set, so a dep
    // dropped from the declaration but changed on disk still rebuilds.
    for stamp in &record.dyn_sources {
        let node = match graph.lookup(&stamp.path) {
            Some(node) => node,
            None => return stale(graph, id, Stale::UnknownDepKind(stamp.kind.clone())),
        };
        if !source_unchanged(graph, hasher, file_state, use_mtime, node, stamp.digest, stamp.mtime)?
        {
            return stale(graph, id, Stale::SourceChanged(stamp.path.clone()));
        }
    }

    Ok(Verdict::Fresh)
}

fn stale(graph: &Graph, id: BuilderId, why: Stale) -> anyhow::Result<Verdict> {
    debug!(builder = %graph.builder_label(id), %why, "stale");
    Ok(Verdict::Stale(why))
}
