//! Utility builders: small transformations most build programs want
//! without writing an `Action` of their own.

use anyhow::Context;

use crate::builder::{Action, ExecContext};
use crate::hash::Signer;

/// Creates its targets as empty files.
pub struct Touch;

impl Action for Touch {
    fn name(&self) -> &str {
        "touch"
    }

    fn sign(&self, _sig: &mut Signer) {}

    fn execute(&self, cx: &mut ExecContext) -> anyhow::Result<bool> {
        for i in 0..cx.targets().len() {
            let path = cx.target_path(i)?;
            std::fs::File::create(path).with_context(|| format!("touch {}", path.display()))?;
        }
        Ok(true)
    }
}

/// Writes fixed content to its single target.
pub struct WriteFile {
    pub content: Vec<u8>,
}

impl Action for WriteFile {
    fn name(&self) -> &str {
        "write"
    }

    fn sign(&self, sig: &mut Signer) {
        sig.write_bytes(&self.content);
    }

    fn execute(&self, cx: &mut ExecContext) -> anyhow::Result<bool> {
        std::fs::write(cx.target_path(0)?, &self.content)?;
        Ok(true)
    }
}

/// Copies its single source to its single target.
pub struct Copy;

impl Action for Copy {
    fn name(&self) -> &str {
        "copy"
    }

    fn sign(&self, _sig: &mut Signer) {}

    fn execute(&self, cx: &mut ExecContext) -> anyhow::Result<bool> {
        let from = cx.source_path(0)?;
        let to = cx.target_path(0)?;
        std::fs::copy(from, to)
            .with_context(|| format!("copy {} to {}", from.display(), to.display()))?;
        Ok(true)
    }
}

/// Runs a shell command via `/bin/sh -c`. The command is part of the
/// builder's signature, so editing it rebuilds the targets.
pub struct Command {
    pub cmdline: String,
}

impl Action for Command {
    fn name(&self) -> &str {
        "sh"
    }

    fn sign(&self, sig: &mut Signer) {
        sig.write_str(&self.cmdline);
    }

    fn execute(&self, cx: &mut ExecContext) -> anyhow::Result<bool> {
        let output = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.cmdline)
            .current_dir(cx.root())
            .output()
            .with_context(|| format!("spawn {}", self.cmdline))?;
        if output.status.success() {
            return Ok(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if output.status.signal() == Some(SIGINT) {
                return Err(crate::error::Error::Interrupted.into());
            }
        }
        tracing::debug!(
            cmdline = %self.cmdline,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "command failed"
        );
        Ok(false)
    }
}

// SIGINT is 2 on every unix we target.
#[cfg(unix)]
const SIGINT: i32 = 2;
