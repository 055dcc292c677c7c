//! The dynamic-dependency protocol: named dependency-kinds whose handlers
//! reconstruct node objects from persisted record fields, so inputs
//! discovered during one session's execute are consulted up front by the
//! next session's staleness check.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::db::DynSourceStamp;
use crate::graph::{BuilderId, Graph, NodeId};

/// The persisted fields a handler reconstructs a node from.
pub struct DynDepRef<'a> {
    pub path: &'a str,
    /// Node type tag: "file" or "virtual".
    pub node_type: &'a str,
    pub data: Option<&'a str>,
}

impl DynSourceStamp {
    pub fn dep_ref(&self) -> DynDepRef<'_> {
        DynDepRef {
            path: &self.path,
            node_type: &self.node_type,
            data: self.data.as_deref(),
        }
    }
}

/// Reconstructs a node from a persisted `(kind, path, type, data)` tuple.
pub type DepsHandler = Box<dyn Fn(&mut Graph, BuilderId, &DynDepRef) -> anyhow::Result<NodeId>>;

/// The built-in kind for plain file dependencies.
pub const FILE_KIND: &str = "file";

/// Session-scoped registry of dependency-kind handlers.
pub struct DepsHandlers {
    map: FxHashMap<String, DepsHandler>,
}

impl DepsHandlers {
    pub fn new() -> DepsHandlers {
        let mut handlers = DepsHandlers {
            map: FxHashMap::default(),
        };
        handlers.register(
            FILE_KIND,
            Box::new(|graph, _builder, dep| match dep.node_type {
                "virtual" => graph.virtual_node(dep.path),
                _ => graph.file(dep.path),
            }),
        );
        handlers
    }

    /// Register a handler for a kind id. Idempotent: re-registration of a
    /// known kind is ignored.
    pub fn register(&mut self, kind: &str, handler: DepsHandler) {
        if self.map.contains_key(kind) {
            debug!(kind, "deps handler already registered");
            return;
        }
        self.map.insert(kind.to_owned(), handler);
    }

    /// Reconstruct the node for a dynamic source. `None` means no handler
    /// is registered for the kind; the caller must treat the owning
    /// builder as stale (or failed, for deps discovered live).
    pub fn restore(
        &self,
        graph: &mut Graph,
        builder: BuilderId,
        kind: &str,
        dep: &DynDepRef,
    ) -> Option<anyhow::Result<NodeId>> {
        self.map
            .get(kind)
            .map(|handler| handler(graph, builder, dep))
    }
}
