//! Error types for benchmark setup and execution

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for benchmark operations
pub type Result<T> = std::result::Result<T, BenchError>;

/// Errors that can occur while provisioning memory or running a benchmark
#[derive(Debug, Error)]
pub enum BenchError {
    /// Accelerator memory device could not be opened
    #[error("Cannot open memory device {path}: {source}")]
    DeviceOpen {
        /// Device node that was opened
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// `mmap` rejected the mapping request
    #[error("mmap of {len:#x} bytes ({backing}) failed: {source}")]
    Mapping {
        /// Backing that was requested
        backing: &'static str,
        /// Requested length in bytes
        len: usize,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Huge page mapping failed, usually because none are reserved
    #[error(
        "Huge page mapping of {len:#x} bytes failed: {source}. Maybe there are not enough free 1GB huge pages \
         (reserve them with 'echo 3 > /sys/devices/system/node/node0/hugepages/hugepages-1048576kB/nr_hugepages')"
    )]
    HugePages {
        /// Requested length in bytes
        len: usize,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// The OS refused to pin a thread to a core
    #[error("Couldn't pin thread to CPU core {core}")]
    Affinity {
        /// Logical core index
        core: usize,
    },

    /// A worker thread could not be created
    #[error("Failed to spawn worker thread for core {core}: {source}")]
    Spawn {
        /// Logical core index
        core: usize,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A worker thread panicked before reporting
    #[error("Worker thread for core {core} panicked")]
    WorkerPanicked {
        /// Logical core index
        core: usize,
    },

    /// Another party abandoned the rendezvous
    #[error("Rendezvous cancelled by another party")]
    Cancelled,

    /// Working set is not usable by the engine
    #[error("Invalid working set of 2^{log2_size} bytes: {reason}")]
    InvalidWorkingSet {
        /// Requested size as a power of two
        log2_size: u32,
        /// Reason for rejection
        reason: &'static str,
    },

    /// Requested range does not fit in the mapped region
    #[error("Range of {needed:#x} bytes exceeds mapped region of {available:#x} bytes")]
    RegionTooSmall {
        /// Bytes needed
        needed: usize,
        /// Bytes mapped
        available: usize,
    },

    /// The permutation recurrence does not visit every cell
    #[error("Permutation over {len} cells returns to 0 after {visited} steps")]
    DegenerateCycle {
        /// Number of cells
        len: usize,
        /// Steps until the recurrence revisited index 0
        visited: usize,
    },

    /// Writing a result line failed
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Core-to-core handshake hit its spin or round bound
    #[error("Handshake gave up after {rounds} rounds ({spins} spins)")]
    HandshakeBound {
        /// Rounds completed
        rounds: u64,
        /// Spins performed in the last wait
        spins: u64,
    },
}

impl BenchError {
    /// Create an invalid working set error
    pub fn invalid_working_set(log2_size: u32, reason: &'static str) -> Self {
        Self::InvalidWorkingSet { log2_size, reason }
    }

    /// Create a region too small error
    pub fn region_too_small(needed: usize, available: usize) -> Self {
        Self::RegionTooSmall { needed, available }
    }
}
