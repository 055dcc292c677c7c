//! Error kinds surfaced by the engine.

use thiserror::Error;

/// Failures a build can end with. Engine internals propagate
/// `anyhow::Result`; these are the typed values callers can downcast to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A builder's execute returned false or raised. Carries the offending
    /// builder's display name and the cause, when one was raised.
    #[error("builder {builder} failed")]
    BuilderFailed {
        builder: String,
        cause: Option<String>,
    },

    /// A referenced node has no producer and does not exist on disk.
    #[error("no builder to make {0}")]
    MissingSource(String),

    /// A node was re-declared with an incompatible type.
    #[error("node type conflict for {0}")]
    NodeTypeConflict(String),

    /// Two builders declared the same target.
    #[error("builder redefinition for {0}")]
    DuplicateProducer(String),

    /// The builder graph contains a dependency cycle.
    #[error("dependency cycle: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// A path escapes the session root and escapes are not permitted.
    #[error("path escapes the session root: {0}")]
    EscapesRoot(String),

    /// User-initiated termination; treated as session failure.
    #[error("interrupted")]
    Interrupted,
}

impl Error {
    /// The offending builder's name, for `BuilderFailed`.
    pub fn failed_builder(&self) -> Option<&str> {
        match self {
            Error::BuilderFailed { builder, .. } => Some(builder),
            _ => None,
        }
    }
}
