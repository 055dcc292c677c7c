use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use drake::error::Error;

use crate::support::*;

fn configure_scan(
    session: &mut drake::Session,
) -> anyhow::Result<(drake::graph::NodeId, Arc<std::sync::atomic::AtomicUsize>)> {
    let list = session.node("deps.list")?;
    let out = session.node("out")?;
    let runs = counter();
    session.add_builder(ScanDeps { runs: runs.clone() }, vec![list], vec![out])?;
    Ok((out, runs))
}

#[test]
fn discovered_dep_triggers_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("deps.list", "dep.h\n")?;
    space.write("dep.h", "one")?;

    let mut session = space.session()?;
    let (out, runs) = configure_scan(&mut session)?;
    session.build(out)?;
    assert_eq!(space.read("out")?, b"one");
    assert_eq!(count(&runs), 1);

    // Nothing changed: the discovered dep is consulted and found fresh.
    let mut session = space.session()?;
    let (out, runs) = configure_scan(&mut session)?;
    assert_eq!(session.build(out)?, 0);
    assert_eq!(count(&runs), 0);

    // Changing the discovered dep rebuilds, even though it was never a
    // declared source.
    space.write("dep.h", "two")?;
    space.bump_mtime("dep.h", 2);
    let mut session = space.session()?;
    let (out, runs) = configure_scan(&mut session)?;
    assert_eq!(session.build(out)?, 1);
    assert_eq!(count(&runs), 1);
    assert_eq!(space.read("out")?, b"two");
    Ok(())
}

/// Dependency churn: a dep declared only in an earlier session still
/// triggers rebuilds after the declaration moves elsewhere, because the
/// persisted set is the union of everything observed.
#[test]
fn dyn_dep_churn() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("d1", "a")?;
    space.write("d2", "b")?;
    space.write("deps.list", "d1\n")?;

    let mut session = space.session()?;
    let (out, _) = configure_scan(&mut session)?;
    session.build(out)?;

    // Session 2 declares d2 instead of d1.
    space.write("deps.list", "d2\n")?;
    space.bump_mtime("deps.list", 2);
    let mut session = space.session()?;
    let (out, runs) = configure_scan(&mut session)?;
    assert_eq!(session.build(out)?, 1);
    assert_eq!(count(&runs), 1);
    assert_eq!(space.read("out")?, b"b");

    // Changing d2 between sessions rebuilds in session 3.
    space.write("d2", "B")?;
    space.bump_mtime("d2", 2);
    let mut session = space.session()?;
    let (out, runs) = configure_scan(&mut session)?;
    assert_eq!(session.build(out)?, 1);
    assert_eq!(count(&runs), 1);
    assert_eq!(space.read("out")?, b"B");
    Ok(())
}

/// The removed dep is still part of the last persisted set, so changing
/// it rebuilds too.
#[test]
fn removed_dep_still_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("d1", "a")?;
    space.write("d2", "b")?;
    space.write("deps.list", "d1\n")?;

    let mut session = space.session()?;
    let (out, _) = configure_scan(&mut session)?;
    session.build(out)?;

    space.write("deps.list", "d2\n")?;
    space.bump_mtime("deps.list", 2);
    let mut session = space.session()?;
    let (out, _) = configure_scan(&mut session)?;
    session.build(out)?;

    // d1 is no longer declared, but its change must still rebuild once.
    space.write("d1", "A")?;
    space.bump_mtime("d1", 2);
    let mut session = space.session()?;
    let (out, runs) = configure_scan(&mut session)?;
    assert_eq!(session.build(out)?, 1);
    assert_eq!(count(&runs), 1);
    Ok(())
}

/// Recovery under failure: with two job slots, a failing sibling's gate
/// release lets the blocked dep producer finish and persist its output.
#[test]
fn dynamic_recovery_under_failure() -> anyhow::Result<()> {
    let space = TestSpace::new()?;

    // Session 1: everything builds; the top builder records dyn1+dyn2.
    let mut session = space.session()?;
    let dyn1 = session.node("dyn1")?;
    let dyn2 = session.node("dyn2")?;
    let top = session.node("top.out")?;
    session.add_builder(drake::builders::Touch, vec![], vec![dyn1])?;
    session.add_builder(drake::builders::Touch, vec![], vec![dyn2])?;
    session.add_builder(
        DeclareTwo {
            deps: ["dyn1", "dyn2"],
        },
        vec![],
        vec![top],
    )?;
    session.build(top)?;
    assert!(space.exists("dyn1") && space.exists("dyn2"));

    // Session 2: outputs deleted; dyn1's producer blocks on the gate,
    // dyn2's producer opens it and fails.
    space.remove("top.out")?;
    space.remove("dyn1")?;
    space.remove("dyn2")?;

    let mut options = space.options();
    options.jobs = 2;
    let mut session = drake::Session::new(options)?;
    let gate = Gate::new();
    let dyn1 = session.node("dyn1")?;
    let dyn2 = session.node("dyn2")?;
    let top = session.node("top.out")?;
    let dyn1_runs = counter();
    session.add_builder(
        TouchAfter {
            gate: gate.clone(),
            runs: dyn1_runs.clone(),
        },
        vec![],
        vec![dyn1],
    )?;
    session.add_builder(FailRelease { gate: gate.clone() }, vec![], vec![dyn2])?;
    session.add_builder(
        DeclareTwo {
            deps: ["dyn1", "dyn2"],
        },
        vec![],
        vec![top],
    )?;

    let err = session.build(top).unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::BuilderFailed { builder, .. }) => {
            assert!(builder.starts_with("fail-release"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    // The blocked producer completed after the failing sibling released
    // the gate; its output exists even though the session failed.
    assert_eq!(count(&dyn1_runs), 1);
    assert!(space.exists("dyn1"));
    assert!(!space.exists("top.out"));
    Ok(())
}

#[test]
fn unregistered_kind_forces_execute() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("deps.list", "dep.h\n")?;
    space.write("dep.h", "x")?;

    // A custom kind whose handler mirrors the built-in file one.
    let configure = |session: &mut drake::Session, register: bool| -> anyhow::Result<_> {
        if register {
            session.register_deps_handler(
                "scan",
                Box::new(|graph, _builder, dep| graph.file(dep.path)),
            );
        }
        let list = session.node("deps.list")?;
        let out = session.node("out")?;
        let runs = counter();
        session.add_builder(
            ScanDepsKind {
                kind: "scan",
                data: None,
                runs: runs.clone(),
            },
            vec![list],
            vec![out],
        )?;
        Ok((out, runs))
    };

    let mut session = space.session()?;
    let (out, _) = configure(&mut session, true)?;
    session.build(out)?;

    // Handler registered: record restores, everything fresh.
    let mut session = space.session()?;
    let (out, runs) = configure(&mut session, true)?;
    assert_eq!(session.build(out)?, 0);
    assert_eq!(count(&runs), 0);

    // No handler for the kind: the record can't be trusted, rebuild.
    let mut session = space.session()?;
    let (out, runs) = configure(&mut session, false)?;
    assert_eq!(session.build(out)?, 1);
    assert_eq!(count(&runs), 1);
    Ok(())
}

#[test]
fn handler_sees_persisted_data() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("deps.list", "dep.h\n")?;
    space.write("dep.h", "x")?;

    let seen = Arc::new(AtomicBool::new(false));
    let configure = |session: &mut drake::Session,
                     seen: Arc<AtomicBool>|
     -> anyhow::Result<drake::graph::NodeId> {
        session.register_deps_handler(
            "tagged",
            Box::new(move |graph, _builder, dep| {
                if dep.data == Some("meta") {
                    seen.store(true, Ordering::SeqCst);
                }
                graph.file(dep.path)
            }),
        );
        let list = session.node("deps.list")?;
        let out = session.node("out")?;
        session.add_builder(
            ScanDepsKind {
                kind: "tagged",
                data: Some("meta"),
                runs: counter(),
            },
            vec![list],
            vec![out],
        )?;
        Ok(out)
    };

    let mut session = space.session()?;
    let out = configure(&mut session, seen.clone())?;
    session.build(out)?;

    // The next session's restoration hands the opaque data back.
    let mut session = space.session()?;
    let out = configure(&mut session, seen.clone())?;
    session.build(out)?;
    assert!(seen.load(Ordering::SeqCst));
    Ok(())
}
