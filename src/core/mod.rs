pub mod admission;
pub mod inventory;
pub mod job;
pub mod ledger;
pub mod scheduler;
pub mod worker;

use compact_str::CompactString;

/// Stable token identifying one device. The token appears verbatim in the
/// child's device-visibility variable, comma-joined with its peers.
pub type GpuId = CompactString;

/// Environment variable through which a child process sees its GPU slice.
pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

/// Admission mode, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Each running job holds whole devices.
    Exclusive,
    /// Each running job holds a memory quota on each of its devices.
    Memory,
}
