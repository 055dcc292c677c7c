//! Content fingerprints over file bytes and in-memory values, recorded and
//! compared to determine when inputs change.
//!
//! File digests are cached per (path, mtime) within a session so that
//! repeated queries are cheap; the cache also means the mtime fast-path
//! can skip content reads entirely.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A BLAKE3 content digest, identifying one observed state of an input or
/// output. Serialized as lowercase hex in build records.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Digest {
        Digest(*blake3::hash(bytes).as_bytes())
    }

    pub fn to_hex(self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Digest> {
        blake3::Hash::from_hex(hex).ok().map(|h| Digest(*h.as_bytes()))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Digest::from_hex(&hex).ok_or_else(|| D::Error::custom("bad digest"))
    }
}

/// Session-wide file hasher. Interior mutability because hashing happens
/// while the graph is borrowed all over the driver.
pub struct Hasher {
    cache: RefCell<FxHashMap<(String, i64), Digest>>,
    files_hashed: Cell<usize>,
}

impl Hasher {
    pub fn new() -> Hasher {
        Hasher {
            cache: RefCell::new(FxHashMap::default()),
            files_hashed: Cell::new(0),
        }
    }

    /// Digest a file's bytes, memoized on (path, mtime).
    pub fn hash_file(&self, path: &Path, key: &str, mtime: i64) -> std::io::Result<Digest> {
        if let Some(&digest) = self.cache.borrow().get(&(key.to_owned(), mtime)) {
            return Ok(digest);
        }
        let bytes = std::fs::read(path)?;
        self.files_hashed.set(self.files_hashed.get() + 1);
        let digest = Digest::of_bytes(&bytes);
        self.cache.borrow_mut().insert((key.to_owned(), mtime), digest);
        Ok(digest)
    }

    /// How many times file contents were actually read and hashed.
    /// The mtime fast-path is observable through this count.
    pub fn files_hashed(&self) -> usize {
        self.files_hashed.get()
    }
}

const UNIT_SEPARATOR: u8 = 0x1F;

/// Incremental hasher for builder signatures: a stable digest of the
/// builder's class identity plus configuration.
pub struct Signer(blake3::Hasher);

impl Signer {
    pub fn new() -> Signer {
        Signer(blake3::Hasher::new())
    }

    pub fn write_str(&mut self, s: &str) {
        self.0.update(s.as_bytes());
        self.0.update(&[UNIT_SEPARATOR]);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
        self.0.update(&[UNIT_SEPARATOR]);
    }

    pub fn write_usize(&mut self, n: usize) {
        self.0.update(&(n as u64).to_le_bytes());
    }

    pub fn finish(self) -> Digest {
        Digest(*self.0.finalize().as_bytes())
    }
}
