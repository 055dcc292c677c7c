//! Filesystem stamps: file modification times and helpers for reading and
//! adjusting them.

use std::fs::FileTimes;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// MTime info gathered for a file.  This also models "file is absent".
/// It's not an Option<> just because it makes the code using it easier
/// to follow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MTime {
    Missing,
    Stamp(i64),
}

impl MTime {
    /// The stamp in seconds, if the file exists.
    pub fn seconds(self) -> Option<i64> {
        match self {
            MTime::Missing => None,
            MTime::Stamp(s) => Some(s),
        }
    }
}

/// stat() an on-disk path, producing its MTime.
pub fn stat(path: &Path) -> std::io::Result<MTime> {
    Ok(match std::fs::metadata(path) {
        Ok(meta) => MTime::Stamp(mtime_seconds(meta.modified()?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => MTime::Missing,
        Err(err) => return Err(err),
    })
}

/// Set a file's mtime to the given stamp in seconds.
pub fn set_mtime(path: &Path, seconds: i64) -> std::io::Result<()> {
    let t = UNIX_EPOCH + Duration::from_secs(seconds as u64);
    let f = std::fs::File::options().write(true).open(path)?;
    f.set_times(FileTimes::new().set_modified(t))
}

fn mtime_seconds(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        // Pre-epoch mtimes happen on weird filesystems; clamp.
        Err(_) => 0,
    }
}
