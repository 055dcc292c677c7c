use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use drake::builder::{Action, ExecContext};
use drake::error::Error;
use drake::hash::Signer;

use crate::support::*;

/// Chain stop: a failing intermediate prevents the downstream builder
/// from ever executing.
#[test]
fn chain_stop() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src", "x")?;

    let mut session = space.session()?;
    let src = session.node("src")?;
    let mid = session.node("intermediate")?;
    let out = session.node("target")?;
    let fail_runs = counter();
    let ok_runs = counter();
    session.add_builder(Fail { runs: fail_runs.clone() }, vec![src], vec![mid])?;
    session.add_builder(Concat { runs: ok_runs.clone() }, vec![mid], vec![out])?;

    let err = session.build(out).unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::BuilderFailed { builder, .. }) => assert!(builder.starts_with("fail")),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(count(&fail_runs), 1);
    assert_eq!(count(&ok_runs), 0);
    Ok(())
}

/// Failure containment: a concurrently running builder finishes, its
/// output lands on disk and in the database, and the session still
/// reports the first failure.
#[test]
fn termination_keeps_successful() -> anyhow::Result<()> {
    let space = TestSpace::new()?;

    let mut options = space.options();
    options.jobs = 2;
    let mut session = drake::Session::new(options)?;
    let beacon = Arc::new(AtomicBool::new(false));
    let failed = session.node("failed")?;
    let built = session.node("built")?;
    let root = session.node("root")?;
    session.add_builder(Fail { runs: counter() }, vec![], vec![failed])?;
    session.add_builder(
        TouchBeacon {
            beacon: beacon.clone(),
            delay_ms: 100,
        },
        vec![],
        vec![built],
    )?;
    session.add_builder(Concat { runs: counter() }, vec![failed, built], vec![root])?;

    let err = session.build(root).unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::BuilderFailed { builder, .. }) => assert!(builder.starts_with("fail")),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(beacon.load(Ordering::SeqCst));
    assert!(space.exists("built"));
    assert!(!space.exists("root"));

    // The successful builder's record survived the failed session: a new
    // session reruns only the failing side.
    let mut options = space.options();
    options.jobs = 2;
    let mut session = drake::Session::new(options)?;
    let beacon2 = Arc::new(AtomicBool::new(false));
    let failed = session.node("failed")?;
    let built = session.node("built")?;
    let root = session.node("root")?;
    session.add_builder(Fail { runs: counter() }, vec![], vec![failed])?;
    session.add_builder(
        TouchBeacon {
            beacon: beacon2.clone(),
            delay_ms: 0,
        },
        vec![],
        vec![built],
    )?;
    session.add_builder(Concat { runs: counter() }, vec![failed, built], vec![root])?;
    session.build(root).unwrap_err();
    assert!(!beacon2.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn failure_is_sticky() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("in", "x")?;

    let mut session = space.session()?;
    let failed = session.node("failed")?;
    let other = session.node("other")?;
    let input = session.node("in")?;
    session.add_builder(Fail { runs: counter() }, vec![], vec![failed])?;
    let other_runs = counter();
    session.add_builder(
        Concat {
            runs: other_runs.clone(),
        },
        vec![input],
        vec![other],
    )?;

    session.build(failed).unwrap_err();

    // Even an unrelated, buildable target surfaces the first failure.
    let err = session.build(other).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::BuilderFailed { builder, .. }) if builder.starts_with("fail")
    ));
    assert_eq!(count(&other_runs), 0);
    Ok(())
}

#[test]
fn interrupted_execute() -> anyhow::Result<()> {
    struct Interrupt;
    impl Action for Interrupt {
        fn name(&self) -> &str {
            "interrupt"
        }
        fn sign(&self, _sig: &mut Signer) {}
        fn execute(&self, _cx: &mut ExecContext) -> anyhow::Result<bool> {
            Err(Error::Interrupted.into())
        }
    }

    let space = TestSpace::new()?;
    let mut session = space.session()?;
    let out = session.node("out")?;
    session.add_builder(Interrupt, vec![], vec![out])?;
    let err = session.build(out).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::Interrupted)
    ));
    Ok(())
}

#[test]
fn target_not_created_is_failure() -> anyhow::Result<()> {
    struct Liar;
    impl Action for Liar {
        fn name(&self) -> &str {
            "liar"
        }
        fn sign(&self, _sig: &mut Signer) {}
        fn execute(&self, _cx: &mut ExecContext) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    let space = TestSpace::new()?;
    let mut session = space.session()?;
    let out = session.node("out")?;
    session.add_builder(Liar, vec![], vec![out])?;
    let err = session.build(out).unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::BuilderFailed { cause, .. }) => {
            assert!(cause.as_deref().unwrap().contains("was not created"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    Ok(())
}

/// Raised errors become failures with a cause.
#[test]
fn raising_execute_carries_cause() -> anyhow::Result<()> {
    struct Raise;
    impl Action for Raise {
        fn name(&self) -> &str {
            "raise"
        }
        fn sign(&self, _sig: &mut Signer) {}
        fn execute(&self, _cx: &mut ExecContext) -> anyhow::Result<bool> {
            anyhow::bail!("tool exploded")
        }
    }

    let space = TestSpace::new()?;
    let mut session = space.session()?;
    let out = session.node("out")?;
    session.add_builder(Raise, vec![], vec![out])?;
    let err = session.build(out).unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::BuilderFailed { cause, .. }) => {
            assert!(cause.as_deref().unwrap().contains("tool exploded"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    Ok(())
}

/// Corrupting the schema marker costs a clean rebuild, never a crash.
#[test]
fn schema_corruption_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("in", "x")?;

    let configure = |session: &mut drake::Session| -> anyhow::Result<_> {
        let input = session.node("in")?;
        let out = session.node("out")?;
        let runs = counter();
        session.add_builder(Concat { runs: runs.clone() }, vec![input], vec![out])?;
        Ok((out, runs))
    };

    let mut session = space.session()?;
    let (out, _) = configure(&mut session)?;
    session.build(out)?;

    space.write(".drake/version", "not a number")?;
    let mut session = space.session()?;
    let (out, runs) = configure(&mut session)?;
    assert_eq!(session.build(out)?, 1);
    assert_eq!(count(&runs), 1);
    assert_eq!(space.read("out")?, b"x");

    // And the database works again afterwards.
    let mut session = space.session()?;
    let (out, runs) = configure(&mut session)?;
    assert_eq!(session.build(out)?, 0);
    assert_eq!(count(&runs), 0);
    Ok(())
}
