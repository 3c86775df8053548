//! Error types for the storage crate.

use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur on the host side of the storage plane.
///
/// Guest-visible command errors never appear here; they are reported inside
/// the emulated register file (`status |= ERR` plus an error code).
#[derive(Debug, Error)]
pub enum StorageError {
    /// A command FIS did not parse as a Register Host-to-Device frame.
    #[error("malformed command FIS: {0}")]
    BadFis(String),

    /// `bind_port` was called on a device that already has a port.
    #[error("device {0:?} is already bound to a port")]
    PortAlreadyBound(String),

    /// The port has no device attached.
    #[error("no device attached to port")]
    NoDevice,
}
