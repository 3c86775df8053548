//! # lucid-vmm
//!
//! Device fabric and guest I/O dispatch for the Lucid VMM.
//!
//! This crate provides the core device-model plane:
//!
//! - [`device`]: The [`Device`] trait and the tree of emulated hardware
//! - [`manager`]: The [`DeviceManager`] routing guest I/O traps to devices
//! - [`serial`]: The serial-port interface used by virtio-console payloads
//!
//! ## Architecture
//!
//! ```text
//! vCPU trap (port/MMIO)          display source        virtio-console
//!        │                             │                     │
//!        ▼                             ▼                     ▼
//! ┌──────────────┐            ┌──────────────┐      ┌────────────────┐
//! │DeviceManager │──dispatch─▶│   Device     │      │SerialPortHandler│
//! │ (interval map)│           │ (trait object)│     │  (guest agent)  │
//! └──────────────┘            └──────────────┘      └────────────────┘
//! ```
//!
//! The manager never owns devices; parents own their children, and the
//! manager holds weak handles used only for dispatch.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_const_for_fn)]

pub mod device;
pub mod error;
pub mod manager;
pub mod serial;

pub use device::{Device, DeviceNode, DeviceRef, IoKind, IoResource};
pub use error::{Result, VmmError};
pub use manager::DeviceManager;
pub use serial::SerialPortHandler;
