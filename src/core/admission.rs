use crate::core::job::Job;
use crate::core::ledger::{Ledger, Reservation};

/// Decide whether a waiting job may start right now.
///
/// Deliberately thin: the ledger's take-first-N tie-break is the only
/// placement policy in this version. Smarter strategies (least-loaded,
/// affinity) slot in here without touching the loop or the ledger.
///
/// Must be called with the shared state mutex held so the decision and the
/// debit land in one critical section.
pub fn admit(job: &Job, ledger: &mut Ledger) -> Option<Reservation> {
    ledger.try_reserve(job.num_gpus, job.memory_mb)
}
