use crate::core::admission;
use crate::core::job::{Job, JobStatus, JobTable};
use crate::core::ledger::{Ledger, LedgerSnapshot, Reservation};
use crate::core::worker::WorkerPool;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// The only shared mutable state: the resource ledger and the job table,
/// behind one mutex. Critical sections are short and never do I/O.
#[derive(Debug)]
pub struct SchedulerState {
    pub ledger: Ledger,
    pub jobs: JobTable,
}

pub type SharedState = Arc<Mutex<SchedulerState>>;

pub(crate) fn lock_state(shared: &SharedState) -> MutexGuard<'_, SchedulerState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Loop pacing and pool sizing, fixed for the whole run.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub interval_for_waiting_gpu: Duration,
    pub interval_for_loop: Duration,
}

/// Terminal tally reported when the loop reaches quiescence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub done: usize,
    pub failed: usize,
}

/// The operator asked the scheduler to stop before quiescence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interrupted by operator")
    }
}

impl std::error::Error for Interrupted {}

/// Fires the cooperative shutdown flag. Held by the interrupt handler (or a
/// test); dropping it untriggered leaves the flag unset forever.
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Read side of the shutdown flag, cloned into the loop and every worker.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once shutdown is triggered. Pends forever if the trigger
    /// was dropped without firing, so racing this against other work never
    /// produces a spurious shutdown.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

enum Decision {
    Skip,
    Admitted { job: Job, reservation: Reservation },
    Denied { job: Job, snapshot: LedgerSnapshot },
}

/// Drive every job to a terminal status, or drain early on interrupt.
///
/// One pass visits pending jobs in id order; a denied job costs one
/// `interval_for_waiting_gpu` sleep inside the pass, and each pass ends with
/// an `interval_for_loop` sleep. Freed resources are observed by the next
/// pass; there is no wake-up signalling, and none is needed at this cadence.
pub async fn run(
    shared: SharedState,
    config: &SchedulerConfig,
    mut shutdown: Shutdown,
) -> Result<Summary, Interrupted> {
    let seeded = lock_state(&shared).ledger.snapshot();
    let mut pool = WorkerPool::new(shared.clone(), config.max_workers, shutdown.clone());

    let interrupted = 'driver: loop {
        if lock_state(&shared).jobs.all_terminal() {
            break false;
        }

        let pending = lock_state(&shared).jobs.pending_ids();
        for id in pending {
            if shutdown.is_triggered() {
                break 'driver true;
            }

            let decision = {
                let mut state = lock_state(&shared);
                if state.jobs.status(id) != JobStatus::Waiting {
                    Decision::Skip
                } else {
                    let job = state.jobs.get(id).clone();
                    match admission::admit(&job, &mut state.ledger) {
                        Some(reservation) => {
                            // Transition and reservation land in the same
                            // critical section; the handoff below may block
                            // on a free slot, which is the intended
                            // backpressure.
                            state.jobs.set_status(id, JobStatus::Running);
                            Decision::Admitted { job, reservation }
                        }
                        None => Decision::Denied {
                            snapshot: state.ledger.snapshot(),
                            job,
                        },
                    }
                }
            };

            match decision {
                Decision::Skip => {}
                Decision::Admitted { job, reservation } => {
                    pool.submit(&job, reservation).await;
                }
                Decision::Denied { job, snapshot } => {
                    tracing::warn!(
                        "[Job-{}] skipping `{}`: not enough GPU resources (needs {} GPU(s), {} MB each; {})",
                        job.name,
                        job.command,
                        job.num_gpus,
                        job.memory_mb,
                        snapshot
                    );
                    if sleep_unless_shutdown(config.interval_for_waiting_gpu, &mut shutdown).await
                    {
                        break 'driver true;
                    }
                }
            }
        }

        if sleep_unless_shutdown(config.interval_for_loop, &mut shutdown).await {
            break true;
        }
    };

    if interrupted {
        tracing::error!("caught interrupt, terminating running jobs");
        // Workers observe the shutdown flag, terminate their children and
        // hand their reservations back; join blocks until all of it is done.
        pool.join().await;
        debug_assert_eq!(
            lock_state(&shared).ledger.snapshot(),
            seeded,
            "reservations leaked across shutdown"
        );
        return Err(Interrupted);
    }

    pool.join().await;
    let (snapshot, counts) = {
        let state = lock_state(&shared);
        (state.ledger.snapshot(), state.jobs.counts())
    };
    debug_assert_eq!(snapshot, seeded, "reservations leaked at quiescence");
    tracing::info!(
        "all jobs have been processed: {} done, {} failed",
        counts.done,
        counts.failed
    );
    Ok(Summary {
        done: counts.done,
        failed: counts.failed,
    })
}

/// Returns true if shutdown fired before the interval elapsed.
async fn sleep_unless_shutdown(duration: Duration, shutdown: &mut Shutdown) -> bool {
    if shutdown.is_triggered() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.triggered() => true,
    }
}
