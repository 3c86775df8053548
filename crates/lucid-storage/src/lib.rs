//! # lucid-storage
//!
//! IDE/AHCI storage device models for the Lucid VMM.
//!
//! - [`ata`]: ATA shadow register file, status/error bits, drive identity
//! - [`ide`]: The ATA/ATAPI command processor ([`IdeStorageDevice`])
//! - [`ahci`]: The AHCI port companion that feeds it commands
//!
//! The command processor is a dispatch table from 8-bit opcode to handler;
//! subclassing a drive type means installing more handlers. The AHCI port
//! is the only caller of [`IdeStorageDevice::start_command`] and the only
//! observer of completion, which it reads back out of the register file.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]

pub mod ahci;
pub mod ata;
pub mod error;
pub mod ide;

pub use ahci::AhciPort;
pub use ata::{AtaIoState, AtaRegisters, DriveInfo};
pub use error::{Result, StorageError};
pub use ide::{IdeStorageDevice, IdeStorageType};
