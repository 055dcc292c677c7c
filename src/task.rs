//! Runs builder jobs, potentially in parallel.
//! Unaware of the build graph or staleness; just job execution.
//!
//! The runner is the engine's job-slot semaphore: at most `jobs` worker
//! threads are in flight, and only externally observable work (an
//! `Action::execute`) ever occupies a slot.

use std::sync::mpsc;
use std::sync::Arc;

use crate::builder::{Action, DiscoveredDep, ExecContext};
use crate::error::Error;
use crate::graph::BuilderId;

#[derive(PartialEq, Eq, Debug)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

/// Everything a finished job hands back to the engine thread.
pub struct JobOutcome {
    pub termination: Termination,
    /// Failure cause, when execute raised.
    pub cause: Option<String>,
    /// Dynamic inputs declared during execute.
    pub discovered: Vec<DiscoveredDep>,
    /// Values produced for virtual targets.
    pub produced: Vec<(String, Vec<u8>)>,
}

pub struct FinishedJob {
    pub id: BuilderId,
    pub outcome: JobOutcome,
}

fn run_job(action: &dyn Action, cx: &mut ExecContext) -> (Termination, Option<String>) {
    match action.execute(cx) {
        Ok(true) => (Termination::Success, None),
        Ok(false) => (Termination::Failure, None),
        Err(err) => match err.downcast_ref::<Error>() {
            Some(Error::Interrupted) => (Termination::Interrupted, None),
            _ => (Termination::Failure, Some(format!("{:#}", err))),
        },
    }
}

pub struct Runner {
    finished_send: mpsc::Sender<FinishedJob>,
    finished_recv: mpsc::Receiver<FinishedJob>,
    running: usize,
    jobs: usize,
}

impl Runner {
    pub fn new(jobs: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            jobs: jobs.max(1),
        }
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.jobs
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    /// Dispatch a builder's execute to a worker thread.
    pub fn start(&mut self, id: BuilderId, action: Arc<dyn Action>, mut cx: ExecContext) {
        let tx = self.finished_send.clone();
        std::thread::spawn(move || {
            let (termination, cause) = run_job(action.as_ref(), &mut cx);
            let (discovered, produced) = cx.into_results();
            // The send only fails if the receiver disappeared, e.g. due
            // to shutting down.
            let _ = tx.send(FinishedJob {
                id,
                outcome: JobOutcome {
                    termination,
                    cause,
                    discovered,
                    produced,
                },
            });
        });
        self.running += 1;
    }

    /// Wait for a job to complete.  May block for a long time.
    pub fn wait(&mut self) -> FinishedJob {
        let fin = self.finished_recv.recv().unwrap();
        self.running -= 1;
        fin
    }
}
