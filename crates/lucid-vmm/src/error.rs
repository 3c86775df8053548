//! Error types for the device fabric.

use thiserror::Error;

use crate::device::IoKind;

/// Result type alias for fabric operations.
pub type Result<T> = std::result::Result<T, VmmError>;

/// Errors that can occur while routing guest I/O.
///
/// Emulator defects and misconfiguration (duplicate device names,
/// overlapping I/O ranges, out-of-range offsets) are not represented here;
/// they abort the process with a diagnostic, since letting them drift would
/// hide correctness bugs behind guest flakiness.
#[derive(Debug, Error)]
pub enum VmmError {
    /// No device claims the accessed address. Reads have already been
    /// defaulted to zeros and writes discarded when this is returned.
    #[error("no device mapped at {kind:?} address {addr:#x}")]
    Unmapped {
        /// Region kind of the faulting access.
        kind: IoKind,
        /// Faulting guest address.
        addr: u64,
    },

    /// The owning device was destroyed while its registration was live.
    #[error("device backing {kind:?} address {addr:#x} is gone")]
    DeviceGone {
        /// Region kind of the faulting access.
        kind: IoKind,
        /// Faulting guest address.
        addr: u64,
    },
}
