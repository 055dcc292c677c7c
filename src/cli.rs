//! Command-line front-end pieces: engine flags, the typed configure-hook
//! bridge for user-declared flags, and exit-code mapping.
//!
//! The engine itself has no binary; a build program's `main` parses an
//! `Invocation`, feeds user flags to its configure hook, and exits with
//! `exit_code`.

use anyhow::anyhow;

/// drake, a build engine driven by your own program
#[derive(argh::FromArgs, Debug)]
pub struct Invocation {
    /// parallelism [default=1]
    #[argh(option, short = 'j', default = "1")]
    pub jobs: usize,

    /// chdir before building
    #[argh(option, short = 'C')]
    pub chdir: Option<String>,

    /// targets to build
    #[argh(positional)]
    pub targets: Vec<String>,
}

impl Invocation {
    pub fn parse(args: &[&str]) -> anyhow::Result<Invocation> {
        use argh::FromArgs;
        Invocation::from_args(&["drake"], args)
            .map_err(|early| anyhow!(early.output.trim().to_owned()))
    }
}

/// Parse user-declared flags for a configure hook. The hook's parameter
/// struct derives `argh::FromArgs`; both `--foo false` and `--foo=false`
/// spellings work.
pub fn configure<T: argh::FromArgs>(args: &[&str]) -> anyhow::Result<T> {
    T::from_args(&["configure"], args).map_err(|early| anyhow!(early.output.trim().to_owned()))
}

/// Process exit code for a finished build: 0 on success, 1 on any
/// failure.
pub fn exit_code<T>(result: &anyhow::Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}
