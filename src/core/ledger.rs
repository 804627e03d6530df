use crate::core::inventory::Inventory;
use crate::core::{GpuId, Mode};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;

/// Reserved device ids for one job. Most jobs hold 1-4 GPUs, so inline
/// storage avoids a heap allocation on the hot path.
pub type GpuIds = SmallVec<[GpuId; 4]>;

/// Devices withheld from the ledger on behalf of one running job, plus the
/// per-device debit in memory mode (0 in exclusive mode). Created by a
/// successful admission, destroyed when the worker releases it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub gpu_ids: GpuIds,
    pub memory_mb: u64,
}

/// Process-wide accounting of GPU availability. The two admission modes are
/// tagged variants behind one reserve/release surface; the exclusive path
/// stays allocation-free when it denies.
///
/// All mutating operations run with the shared state mutex held by the
/// caller; the ledger itself never blocks on I/O.
#[derive(Debug)]
pub enum Ledger {
    Exclusive(ExclusiveLedger),
    Memory(MemoryLedger),
}

impl Ledger {
    pub fn new(inventory: &Inventory, mode: Mode) -> Self {
        match mode {
            Mode::Exclusive => Ledger::Exclusive(ExclusiveLedger::new(
                inventory.list().iter().map(|gpu| gpu.id.clone()),
            )),
            Mode::Memory => Ledger::Memory(MemoryLedger::new(
                inventory
                    .list()
                    .iter()
                    .map(|gpu| (gpu.id.clone(), gpu.initial_free_mb.unwrap_or(0))),
            )),
        }
    }

    /// Atomically reserve `num_gpus` devices, or return None without side
    /// effects. `memory_mb` is the per-device debit in memory mode and is
    /// ignored in exclusive mode.
    pub fn try_reserve(&mut self, num_gpus: usize, memory_mb: u64) -> Option<Reservation> {
        let gpu_ids = match self {
            Ledger::Exclusive(ledger) => ledger.try_reserve(num_gpus)?,
            Ledger::Memory(ledger) => ledger.try_reserve(num_gpus, memory_mb)?,
        };
        Some(Reservation { gpu_ids, memory_mb })
    }

    /// Return a reservation's devices to the ledger.
    pub fn release(&mut self, reservation: &Reservation) {
        match self {
            Ledger::Exclusive(ledger) => ledger.release(&reservation.gpu_ids),
            Ledger::Memory(ledger) => {
                ledger.release(&reservation.gpu_ids, reservation.memory_mb)
            }
        }
    }

    /// Structured view for logging and for the quiescence check at shutdown.
    pub fn snapshot(&self) -> LedgerSnapshot {
        match self {
            Ledger::Exclusive(ledger) => ledger.snapshot(),
            Ledger::Memory(ledger) => ledger.snapshot(),
        }
    }
}

/// Exclusive mode: each device is an indivisible token. Tokens are selected
/// FIFO for deterministic assignment, but every grant is reported in
/// inventory order: the ids go verbatim into the child's device-visibility
/// variable, and they are opaque tokens, so position in the inventory is the
/// only order that holds (lexicographic would put "10" before "2").
#[derive(Debug)]
pub struct ExclusiveLedger {
    inventory: Vec<GpuId>,
    free: VecDeque<GpuId>,
}

impl ExclusiveLedger {
    pub fn new<I: IntoIterator<Item = GpuId>>(ids: I) -> Self {
        let inventory: Vec<GpuId> = ids.into_iter().collect();
        let free = inventory.iter().cloned().collect();
        Self { inventory, free }
    }

    fn position(&self, id: &GpuId) -> usize {
        self.inventory
            .iter()
            .position(|known| known == id)
            .unwrap_or(self.inventory.len())
    }

    fn try_reserve(&mut self, num_gpus: usize) -> Option<GpuIds> {
        if self.free.len() < num_gpus {
            return None;
        }
        let mut ids = GpuIds::new();
        while ids.len() < num_gpus {
            if let Some(id) = self.free.pop_front() {
                ids.push(id);
            }
        }
        ids.sort_unstable_by_key(|id| self.position(id));
        Some(ids)
    }

    fn release(&mut self, ids: &[GpuId]) {
        for id in ids {
            debug_assert!(!self.free.contains(id), "double release of GPU {id}");
            self.free.push_back(id.clone());
        }
        debug_assert!(
            self.free.len() <= self.inventory.len(),
            "more tokens than devices"
        );
    }

    fn snapshot(&self) -> LedgerSnapshot {
        let mut free: Vec<GpuId> = self.free.iter().cloned().collect();
        free.sort_unstable_by_key(|id| self.position(id));
        LedgerSnapshot::Exclusive {
            free,
            total: self.inventory.len(),
        }
    }
}

#[derive(Debug)]
struct MemorySlot {
    id: GpuId,
    free_mb: u64,
    seeded_mb: u64,
}

/// Memory mode: each device is a free-memory counter, seeded once from the
/// driver probe. Slots are kept in inventory order so ties always break
/// toward the first configured devices.
#[derive(Debug)]
pub struct MemoryLedger {
    slots: Vec<MemorySlot>,
}

impl MemoryLedger {
    pub fn new<I: IntoIterator<Item = (GpuId, u64)>>(seeds: I) -> Self {
        Self {
            slots: seeds
                .into_iter()
                .map(|(id, seeded_mb)| MemorySlot {
                    id,
                    free_mb: seeded_mb,
                    seeded_mb,
                })
                .collect(),
        }
    }

    fn try_reserve(&mut self, num_gpus: usize, memory_mb: u64) -> Option<GpuIds> {
        // Whole read-decide-write sequence runs under the caller's lock, so
        // the candidate set cannot go stale before the debit lands.
        let candidates: SmallVec<[usize; 8]> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.free_mb >= memory_mb)
            .map(|(idx, _)| idx)
            .collect();
        if candidates.len() < num_gpus {
            return None;
        }
        let mut ids = GpuIds::new();
        for idx in candidates.into_iter().take(num_gpus) {
            let slot = &mut self.slots[idx];
            // Guarded by the candidate filter above; counters stay >= 0.
            slot.free_mb -= memory_mb;
            ids.push(slot.id.clone());
        }
        Some(ids)
    }

    fn release(&mut self, ids: &[GpuId], memory_mb: u64) {
        for id in ids {
            if let Some(slot) = self.slots.iter_mut().find(|slot| slot.id == *id) {
                slot.free_mb += memory_mb;
                debug_assert!(
                    slot.free_mb <= slot.seeded_mb,
                    "credit beyond seed on GPU {id}: double release?"
                );
            } else {
                debug_assert!(false, "release for unknown GPU {id}");
            }
        }
    }

    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot::Memory {
            free_mb: self
                .slots
                .iter()
                .map(|slot| (slot.id.clone(), slot.free_mb))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerSnapshot {
    Exclusive { free: Vec<GpuId>, total: usize },
    Memory { free_mb: Vec<(GpuId, u64)> },
}

impl LedgerSnapshot {
    #[cfg(test)]
    pub fn free_mb_of(&self, id: &str) -> Option<u64> {
        match self {
            LedgerSnapshot::Memory { free_mb } => free_mb
                .iter()
                .find(|(gpu, _)| gpu == id)
                .map(|(_, free)| *free),
            LedgerSnapshot::Exclusive { .. } => None,
        }
    }
}

impl fmt::Display for LedgerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerSnapshot::Exclusive { free, total } => {
                write!(f, "{}/{} GPU(s) free [{}]", free.len(), total, free.join(","))
            }
            LedgerSnapshot::Memory { free_mb } => {
                let mut first = true;
                for (id, free) in free_mb {
                    if !first {
                        write!(f, ", ")?;
                    }
                    write!(f, "GPU {id}: {free} MB free")?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}
