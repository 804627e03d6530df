use crate::core::job::{Job, JobStatus};
use crate::core::ledger::Reservation;
use crate::core::scheduler::{lock_state, SharedState, Shutdown};
use crate::core::CUDA_VISIBLE_DEVICES;
use compact_str::CompactString;
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use std::sync::Arc;

/// Bounded set of execution slots. Each slot runs one job as a child
/// process; `submit` blocks the scheduling loop while every slot is busy,
/// which is the loop's natural throttle.
///
/// Workers never listen for the operator interrupt themselves: the driver
/// owns the signal and fans it out through the shutdown flag, and children
/// run in their own process groups so a terminal interrupt does not reach
/// them behind the scheduler's back.
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    tasks: JoinSet<()>,
    shared: SharedState,
    shutdown: Shutdown,
}

impl WorkerPool {
    pub fn new(shared: SharedState, max_workers: usize, shutdown: Shutdown) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_workers)),
            tasks: JoinSet::new(),
            shared,
            shutdown,
        }
    }

    /// Hand a job and its reservation to a slot. The job must already be
    /// Running; the spawned worker owns the reservation from here on and
    /// returns it to the ledger on every exit path.
    pub async fn submit(&mut self, job: &Job, reservation: Reservation) {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore closed");

        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let (id, name, command) = (job.id, job.name.clone(), job.command.clone());
        self.tasks.spawn(async move {
            let _permit = permit;
            run_job(shared, shutdown, id, name, command, reservation).await;
        });
    }

    /// Wait for every slot to drain. A panic inside a worker (the job table
    /// aborts on illegal transitions) is resumed here so it takes the whole
    /// process down instead of vanishing into the task boundary.
    pub async fn join(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
                tracing::error!("worker task failed: {err}");
            }
        }
    }
}

/// Returns the reservation to the ledger when dropped, so release happens on
/// every worker exit path: success, child failure, spawn failure, shutdown,
/// even a panic above it.
struct ReservationGuard {
    shared: SharedState,
    reservation: Option<Reservation>,
    ident: String,
}

impl ReservationGuard {
    fn new(shared: SharedState, reservation: Reservation, ident: String) -> Self {
        Self {
            shared,
            reservation: Some(reservation),
            ident,
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            let mut state = lock_state(&self.shared);
            state.ledger.release(&reservation);
            tracing::info!(
                "{} released GPU {}",
                self.ident,
                reservation.gpu_ids.join(",")
            );
        }
    }
}

async fn run_job(
    shared: SharedState,
    mut shutdown: Shutdown,
    id: usize,
    name: CompactString,
    command: CompactString,
    reservation: Reservation,
) {
    let visible = reservation.gpu_ids.join(",");
    let ident = format!("[GPU-{visible}:Job-{name}]");
    let _guard = ReservationGuard::new(shared.clone(), reservation, ident.clone());

    // A submission can slip in while shutdown is being requested; don't
    // launch a child just to kill it.
    if shutdown.is_triggered() {
        lock_state(&shared).jobs.set_status(id, JobStatus::Failed);
        return;
    }

    tracing::info!("{ident} executing `{command}`");

    // Child environment is a snapshot: the parent's environment with the
    // device-visibility variable overwritten by the reservation. The command
    // goes through the shell in single-argument form, so pipelines and
    // redirections work; stdout/stderr stay on the parent's.
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command.as_str())
        .env(CUDA_VISIBLE_DEVICES, &visible)
        .process_group(0);

    let waited = match cmd.spawn() {
        Ok(mut child) => {
            tokio::select! {
                status = child.wait() => status,
                _ = shutdown.triggered() => {
                    tracing::warn!("{ident} terminating `{command}`");
                    terminate(&child);
                    child.wait().await
                }
            }
        }
        Err(err) => {
            tracing::error!("{ident} failed to spawn `{command}`: {err}");
            lock_state(&shared).jobs.set_status(id, JobStatus::Failed);
            return;
        }
    };

    let status = match waited {
        Ok(exit) if exit.success() => {
            tracing::info!("{ident} finished `{command}`");
            JobStatus::Done
        }
        Ok(exit) => {
            tracing::error!("{ident} command `{command}` failed: {exit}");
            JobStatus::Failed
        }
        Err(err) => {
            tracing::error!("{ident} failed waiting for `{command}`: {err}");
            JobStatus::Failed
        }
    };
    lock_state(&shared).jobs.set_status(id, status);
}

/// Signal the child's whole process group, so shell pipelines die with the
/// shell.
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inventory::Inventory;
    use crate::core::ledger::Ledger;
    use crate::core::job::JobTable;
    use crate::core::scheduler::{shutdown_channel, SchedulerState};
    use crate::core::Mode;
    use crate::config::GpuConfig;
    use std::sync::Mutex;

    fn exclusive_state(gpu_count: usize, jobs: Vec<Job>) -> SharedState {
        let gpus: Vec<GpuConfig> = (0..gpu_count)
            .map(|i| GpuConfig {
                id: compact_str::format_compact!("{i}"),
                memory: None,
            })
            .collect();
        let inventory = Inventory::from_config(&gpus).unwrap();
        Arc::new(Mutex::new(SchedulerState {
            ledger: Ledger::new(&inventory, Mode::Exclusive),
            jobs: JobTable::new(jobs),
        }))
    }

    fn job(id: usize, command: &str, num_gpus: usize) -> Job {
        Job {
            id,
            name: compact_str::format_compact!("job-{id}"),
            command: command.into(),
            num_gpus,
            memory_mb: 0,
            status: JobStatus::Waiting,
        }
    }

    fn submitted_job(shared: &SharedState) -> Job {
        lock_state(shared).jobs.get(0).clone()
    }

    async fn run_one(shared: &SharedState, job: &Job) {
        let reservation = {
            let mut state = lock_state(shared);
            let reservation = state.ledger.try_reserve(job.num_gpus, 0).unwrap();
            state.jobs.set_status(job.id, JobStatus::Running);
            reservation
        };
        let (_trigger, shutdown) = shutdown_channel();
        let mut pool = WorkerPool::new(shared.clone(), 1, shutdown);
        pool.submit(job, reservation).await;
        pool.join().await;
    }

    #[tokio::test]
    async fn test_child_sees_comma_joined_device_list() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("visible");
        let command = format!("printf %s \"$CUDA_VISIBLE_DEVICES\" > {}", out.display());

        let shared = exclusive_state(2, vec![job(0, &command, 2)]);
        let seeded = lock_state(&shared).ledger.snapshot();
        run_one(&shared, &submitted_job(&shared)).await;

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "0,1");
        let state = lock_state(&shared);
        assert_eq!(state.jobs.status(0), JobStatus::Done);
        assert_eq!(state.ledger.snapshot(), seeded);
    }

    #[tokio::test]
    async fn test_failing_child_marks_failed_and_releases() {
        let shared = exclusive_state(1, vec![job(0, "false", 1)]);
        let seeded = lock_state(&shared).ledger.snapshot();
        run_one(&shared, &submitted_job(&shared)).await;

        let state = lock_state(&shared);
        assert_eq!(state.jobs.status(0), JobStatus::Failed);
        assert_eq!(state.ledger.snapshot(), seeded);
    }

    #[tokio::test]
    async fn test_shell_form_allows_pipelines() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("piped");
        let command = format!("echo alpha | tr a-z A-Z > {}", out.display());

        let shared = exclusive_state(1, vec![job(0, &command, 1)]);
        run_one(&shared, &submitted_job(&shared)).await;

        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "ALPHA");
    }
}
