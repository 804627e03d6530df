use compact_str::CompactString;
use std::fmt;
use strum::Display;

/// Lifecycle of a batch job. Progress is monotonic:
///
/// Waiting ──> Running ──> Done
///                │
///                └──────> Failed
///
/// Done and Failed are terminal; a failed job is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum JobStatus {
    #[strum(to_string = "WAITING")]
    Waiting,
    #[strum(to_string = "RUNNING")]
    Running,
    #[strum(to_string = "DONE")]
    Done,
    #[strum(to_string = "FAILED")]
    Failed,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Waiting, Running) | (Running, Done) | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// One entry of the batch. `id` is the zero-based input order and doubles as
/// the index into the job table.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: usize,
    pub name: CompactString,
    pub command: CompactString,
    pub num_gpus: usize,
    pub memory_mb: u64,
    pub status: JobStatus,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {} ({}): `{}` [{} GPU(s), {} MB]",
            self.id, self.name, self.command, self.num_gpus, self.memory_mb
        )
    }
}

/// The set of jobs with their current lifecycle state. Mutated only by the
/// scheduling loop (Waiting -> Running) and by workers (Running -> terminal),
/// always under the shared state mutex.
#[derive(Debug)]
pub struct JobTable {
    jobs: Vec<Job>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusCounts {
    pub waiting: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl JobTable {
    pub fn new(jobs: Vec<Job>) -> Self {
        debug_assert!(jobs.iter().enumerate().all(|(idx, job)| job.id == idx));
        Self { jobs }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: usize) -> &Job {
        &self.jobs[id]
    }

    pub fn status(&self, id: usize) -> JobStatus {
        self.jobs[id].status
    }

    /// Guarded transition. An illegal transition is an implementation bug
    /// (statuses are only ever advanced along the lifecycle above), so it
    /// aborts instead of being silently accepted.
    pub fn set_status(&mut self, id: usize, next: JobStatus) {
        let job = &mut self.jobs[id];
        if !job.status.can_transition_to(next) {
            panic!(
                "invalid state transition for job {}: {} -> {}",
                id, job.status, next
            );
        }
        job.status = next;
    }

    /// Ids of jobs that have not reached a terminal status, in id order.
    /// Callers re-check the status under the lock before acting; a returned
    /// id may already be Running.
    pub fn pending_ids(&self) -> Vec<usize> {
        self.jobs
            .iter()
            .filter(|job| !job.status.is_terminal())
            .map(|job| job.id)
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.jobs.iter().all(|job| job.status.is_terminal())
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for job in &self.jobs {
            match job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Done => counts.done += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}
