//! The drake database stores information about previous builds for
//! determining which targets are up to date.
//!
//! Layout, under the reserved `.drake/` directory at the build-tree root:
//!   version        schema marker, a single integer
//!   db/<key>.json  one record per canonical target path
//!
//! Records are written to a temp file and renamed into place, so readers
//! never observe a torn record. A schema mismatch discards the whole
//! database, which is equivalent to a clean build; it is never an error.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::hash::Digest;

/// Bump whenever the record format changes incompatibly.
const SCHEMA_VERSION: u32 = 1;

const DB_DIR: &str = ".drake";

/// Last-known state of one static source at the time of the last
/// successful build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStamp {
    pub path: String,
    pub digest: Digest,
    /// Mtime snapshot in seconds; consulted only when mtime mode is on.
    pub mtime: Option<i64>,
}

/// Last-known state of one dynamic source, with enough information for
/// its dependency-kind handler to reconstruct the node next session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynSourceStamp {
    pub kind: String,
    pub path: String,
    /// Node type tag: "file" or "virtual".
    pub node_type: String,
    #[serde(default)]
    pub data: Option<String>,
    pub digest: Digest,
    pub mtime: Option<i64>,
}

/// Persistent per-target record of the last successful build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Producer's signature (class identity + configuration).
    pub signature: Digest,
    pub sources: Vec<SourceStamp>,
    pub dyn_sources: Vec<DynSourceStamp>,
    /// Target digest at end of last successful build.
    pub target: Digest,
}

/// Handle on the opened on-disk database.
pub struct BuildDb {
    dir: PathBuf,
}

impl BuildDb {
    /// Open (or initialize) the database under `root`. Discards all
    /// records if the schema marker does not match.
    pub fn open(root: &Path) -> anyhow::Result<BuildDb> {
        let dir = root.join(DB_DIR);
        let records = dir.join("db");
        let version = dir.join("version");

        let found = std::fs::read_to_string(&version)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());
        match found {
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                warn!(found = v, expected = SCHEMA_VERSION, "database schema mismatch, discarding");
                let _ = std::fs::remove_dir_all(&records);
            }
            None if version.exists() => {
                warn!("unreadable database schema marker, discarding");
                let _ = std::fs::remove_dir_all(&records);
            }
            None => {}
        }

        std::fs::create_dir_all(&records)
            .with_context(|| format!("create {}", records.display()))?;
        if found != Some(SCHEMA_VERSION) {
            std::fs::write(&version, format!("{}\n", SCHEMA_VERSION))
                .with_context(|| format!("write {}", version.display()))?;
        }
        Ok(BuildDb { dir })
    }

    fn record_path(&self, target: &str) -> PathBuf {
        // Target paths can contain separators; key records by digest.
        let key = Digest::of_bytes(target.as_bytes()).to_hex();
        self.dir.join("db").join(format!("{}.json", &key[..32]))
    }

    /// Read the record for a target path. Fail-safe: any unreadable or
    /// unparsable record reads as absent, which means "stale".
    pub fn read(&self, target: &str) -> Option<BuildRecord> {
        let path = self.record_path(target);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!(path = %target, %err, "discarding unparsable record");
                None
            }
        }
    }

    /// Atomically replace the record for a target path.
    pub fn write(&self, target: &str, record: &BuildRecord) -> anyhow::Result<()> {
        let path = self.record_path(target);
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_vec(record)?;
        std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("rename {}", path.display()))?;
        Ok(())
    }
}
