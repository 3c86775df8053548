//! ATA/ATAPI command processor.
//!
//! [`IdeStorageDevice`] models the command register file plus a 256-entry
//! table of per-opcode handlers. The bound AHCI port loads the register
//! file from the guest's command FIS and calls
//! [`start_command`](IdeStorageDevice::start_command); handlers complete by
//! mutating the register file, which the port then reads back.
//!
//! Drive models (hard disk, CD-ROM) extend the table through
//! [`install_handler`](IdeStorageDevice::install_handler); the base class
//! only branches on the drive type inside the reset signature and the
//! IDENTIFY fallback.

use std::sync::{Arc, Mutex, Weak};

use lucid_vmm::device::{Device, DeviceNode};

use crate::ahci::AhciPort;
use crate::ata::{
    AtaIoState, AtaRegisters, DriveInfo, ATA_ER_ABRT, ATA_ER_NDAM, ATA_SR_DRDY, ATA_SR_ERR,
};
use crate::error::{Result, StorageError};

/// Kind of drive presented to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdeStorageType {
    /// Fixed disk (ATA signature `0x0000_0101`).
    Harddisk,
    /// Optical drive (ATAPI signature `0xEB14_0101`).
    Cdrom,
}

/// Per-opcode command handler.
pub type AtaHandler = fn(&mut IdeStorageDevice);

/// An ATA/ATAPI device on an AHCI port.
pub struct IdeStorageDevice {
    node: DeviceNode,
    storage_type: IdeStorageType,
    regs: AtaRegisters,
    io: AtaIoState,
    drive_info: DriveInfo,
    handlers: [Option<AtaHandler>; 256],
    port: Weak<Mutex<AhciPort>>,
}

impl IdeStorageDevice {
    /// Creates a device with the base command matrix installed.
    #[must_use]
    pub fn new(name: impl Into<String>, storage_type: IdeStorageType) -> Self {
        let mut device = Self {
            node: DeviceNode::new(name),
            storage_type,
            regs: AtaRegisters::default(),
            io: AtaIoState::default(),
            drive_info: DriveInfo::default(),
            handlers: [None; 256],
            port: Weak::new(),
        };

        device.install_handler(0x00, |dev| {
            // The guest has no business issuing NOP through AHCI.
            panic!("{}: ata nop", dev.node.name());
        });
        device.install_handler(0x08, Self::ata_device_reset);
        device.install_handler(0x2F, |dev| {
            // READ LOG is unsupported.
            dev.abort_command();
        });
        device.install_handler(0xEC, Self::ata_identify_device);
        device.install_handler(0xEF, Self::ata_set_features);
        device
    }

    /// The drive kind.
    #[must_use]
    pub fn storage_type(&self) -> IdeStorageType {
        self.storage_type
    }

    /// The shadow register block.
    #[must_use]
    pub fn regs(&self) -> &AtaRegisters {
        &self.regs
    }

    /// The shadow register block, mutably. The AHCI port uses this to load
    /// the command FIS before `start_command`.
    pub fn regs_mut(&mut self) -> &mut AtaRegisters {
        &mut self.regs
    }

    /// Per-command transfer state.
    #[must_use]
    pub fn io(&self) -> &AtaIoState {
        &self.io
    }

    /// Per-command transfer state, mutably.
    pub fn io_mut(&mut self) -> &mut AtaIoState {
        &mut self.io
    }

    /// Drive identity block, vendor-zeroed until a drive model fills it.
    #[must_use]
    pub fn drive_info(&self) -> &DriveInfo {
        &self.drive_info
    }

    /// Drive identity block, mutably.
    pub fn drive_info_mut(&mut self) -> &mut DriveInfo {
        &mut self.drive_info
    }

    /// Installs (or replaces) the handler for `opcode`. This is the
    /// extension point for drive models.
    pub fn install_handler(&mut self, opcode: u8, handler: AtaHandler) {
        self.handlers[opcode as usize] = Some(handler);
    }

    /// Installs the one-shot binding to the AHCI port.
    ///
    /// The port is the only object that may call `start_command` and the
    /// only observer of completion.
    pub fn bind_port(&mut self, port: &Arc<Mutex<AhciPort>>) -> Result<()> {
        if self.port.upgrade().is_some() {
            return Err(StorageError::PortAlreadyBound(self.node.name().to_string()));
        }
        self.port = Arc::downgrade(port);
        Ok(())
    }

    /// Executes the command currently in `regs.command`.
    ///
    /// # Panics
    ///
    /// Panics when no handler is installed for the opcode; a command this
    /// emulator was supposed to implement is a defect, not a guest error.
    pub fn start_command(&mut self) {
        self.regs.status = ATA_SR_DRDY;
        self.regs.error = 0;
        self.io.clear();

        let opcode = self.regs.command;
        match self.handlers[opcode as usize] {
            Some(handler) => handler(self),
            None => panic!(
                "{}: unknown ata command {:#04x}",
                self.node.name(),
                opcode
            ),
        }
    }

    /// Ends the current command with a guest-visible abort.
    pub fn abort_command(&mut self) {
        self.regs.status = ATA_SR_DRDY | ATA_SR_ERR;
        self.regs.error = ATA_ER_ABRT;
    }

    /// Programs the published idle signature into the register file.
    ///
    /// Reading back `(count0, lba0, lba1, lba2)` yields `(1, 1, 0x14, 0xEB)`
    /// for a CD-ROM and `(1, 1, 0, 0)` for a hard disk.
    pub fn ata_reset_signature(&mut self) {
        self.regs.device = !0x0F;
        self.regs.count0 = 1;
        self.regs.lba0 = 1;
        match self.storage_type {
            IdeStorageType::Cdrom => {
                self.regs.lba1 = 0x14;
                self.regs.lba2 = 0xEB;
            }
            IdeStorageType::Harddisk => {
                self.regs.lba1 = 0;
                self.regs.lba2 = 0;
            }
        }
    }

    /// The 32-bit port signature derived from the signature registers.
    #[must_use]
    pub fn signature(&self) -> u32 {
        match self.storage_type {
            IdeStorageType::Harddisk => 0x0000_0101,
            IdeStorageType::Cdrom => 0xEB14_0101,
        }
    }

    // DEVICE RESET (0x08): soft-reset the channel state and republish the
    // signature so the guest can re-identify the device.
    fn ata_device_reset(&mut self) {
        self.regs.error = ATA_ER_NDAM;
        self.regs.status = 0;
        self.ata_reset_signature();
    }

    // IDENTIFY DEVICE (0xEC): an ATAPI device aborts and republishes its
    // signature, which steers the guest toward IDENTIFY PACKET DEVICE. Hard
    // disk models must install their own handler.
    fn ata_identify_device(&mut self) {
        match self.storage_type {
            IdeStorageType::Cdrom => {
                self.ata_reset_signature();
                self.abort_command();
            }
            IdeStorageType::Harddisk => {
                panic!(
                    "{}: identify device must be handled by the disk model",
                    self.node.name()
                );
            }
        }
    }

    // SET FEATURES (0xEF), sub-dispatched on feature0.
    fn ata_set_features(&mut self) {
        match self.regs.feature0 {
            0x03 => {
                // Set transfer mode from count0; only UDMA is supported.
                let value = self.regs.count0 & 0b111;
                match self.regs.count0 >> 3 {
                    0 | 1 => panic!("{}: not supported PIO mode", self.node.name()),
                    2 => panic!(
                        "{}: not supported single word DMA mode",
                        self.node.name()
                    ),
                    4 => panic!("{}: not supported MDMA mode", self.node.name()),
                    8 => {
                        tracing::debug!(device = self.node.name(), udma = value, "transfer mode");
                    }
                    _ => panic!(
                        "{}: unknown transfer mode {:#04x}",
                        self.node.name(),
                        self.regs.count0
                    ),
                }
            }
            // Reverting to power-on defaults enable/disable.
            0x66 | 0xCC => {}
            other => {
                tracing::warn!(
                    device = self.node.name(),
                    "unknown set features {other:#04x}"
                );
                self.abort_command();
            }
        }
    }
}

impl Device for IdeStorageDevice {
    fn node(&self) -> &DeviceNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut DeviceNode {
        &mut self.node
    }

    fn reset(&mut self) {
        self.regs.status = ATA_SR_DRDY;
        self.ata_reset_signature();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cdrom() -> IdeStorageDevice {
        IdeStorageDevice::new("cd0", IdeStorageType::Cdrom)
    }

    fn disk() -> IdeStorageDevice {
        IdeStorageDevice::new("sda", IdeStorageType::Harddisk)
    }

    fn run(dev: &mut IdeStorageDevice, opcode: u8) {
        dev.regs_mut().command = opcode;
        dev.start_command();
    }

    #[test]
    fn test_start_command_preamble() {
        let mut dev = cdrom();
        dev.io_mut().dma_status = 0xFF;
        dev.io_mut().nbytes = 123;
        // READ LOG aborts, but the preamble must have run first.
        run(&mut dev, 0x2F);
        assert_eq!(dev.io().dma_status, 0);
        assert_eq!(dev.io().nbytes, 0);
    }

    #[test]
    fn test_abort_sets_drdy_err_abrt() {
        let mut dev = cdrom();
        dev.abort_command();
        assert_eq!(dev.regs().status, ATA_SR_DRDY | ATA_SR_ERR);
        assert_eq!(dev.regs().error, ATA_ER_ABRT);
    }

    #[test]
    fn test_reset_signature_cdrom() {
        let mut dev = cdrom();
        dev.ata_reset_signature();
        let regs = dev.regs();
        assert_eq!(
            (regs.count0, regs.lba0, regs.lba1, regs.lba2),
            (1, 1, 0x14, 0xEB)
        );
        assert_eq!(regs.device, 0xF0);
    }

    #[test]
    fn test_reset_signature_harddisk() {
        let mut dev = disk();
        dev.ata_reset_signature();
        let regs = dev.regs();
        assert_eq!((regs.count0, regs.lba0, regs.lba1, regs.lba2), (1, 1, 0, 0));
    }

    #[test]
    fn test_device_reset_on_cdrom() {
        let mut dev = cdrom();
        run(&mut dev, 0x08);
        assert_eq!(dev.regs().error, ATA_ER_NDAM);
        // DEVICE RESET leaves status cleared rather than DRDY.
        assert_eq!(dev.regs().status, 0);
        let regs = dev.regs();
        assert_eq!(
            (regs.count0, regs.lba0, regs.lba1, regs.lba2),
            (1, 1, 0x14, 0xEB)
        );
    }

    #[test]
    fn test_identify_on_cdrom_aborts_with_signature() {
        let mut dev = cdrom();
        run(&mut dev, 0xEC);
        assert_eq!(dev.regs().status, ATA_SR_DRDY | ATA_SR_ERR);
        assert_eq!(dev.regs().error, ATA_ER_ABRT);
        assert_eq!((dev.regs().lba1, dev.regs().lba2), (0x14, 0xEB));
    }

    #[test]
    #[should_panic(expected = "identify device must be handled")]
    fn test_identify_on_bare_harddisk_is_a_defect() {
        let mut dev = disk();
        run(&mut dev, 0xEC);
    }

    #[test]
    fn test_set_features_udma() {
        let mut dev = disk();
        dev.regs_mut().feature0 = 0x03;
        dev.regs_mut().count0 = (8 << 3) | 5;
        run(&mut dev, 0xEF);
        // No state change beyond the preamble.
        assert_eq!(dev.regs().status, ATA_SR_DRDY);
        assert_eq!(dev.regs().error, 0);
    }

    #[test]
    #[should_panic(expected = "not supported MDMA mode")]
    fn test_set_features_mdma_is_a_defect() {
        let mut dev = disk();
        dev.regs_mut().feature0 = 0x03;
        dev.regs_mut().count0 = 4 << 3;
        run(&mut dev, 0xEF);
    }

    #[test]
    #[should_panic(expected = "not supported PIO mode")]
    fn test_set_features_pio_is_a_defect() {
        let mut dev = disk();
        dev.regs_mut().feature0 = 0x03;
        dev.regs_mut().count0 = 1 << 3;
        run(&mut dev, 0xEF);
    }

    #[test]
    fn test_set_features_defaults_are_noops() {
        for sub in [0x66u8, 0xCC] {
            let mut dev = disk();
            dev.regs_mut().feature0 = sub;
            run(&mut dev, 0xEF);
            assert_eq!(dev.regs().status, ATA_SR_DRDY);
            assert_eq!(dev.regs().error, 0);
        }
    }

    #[test]
    fn test_set_features_unknown_subcode_aborts() {
        let mut dev = disk();
        dev.regs_mut().feature0 = 0x42;
        run(&mut dev, 0xEF);
        assert_eq!(dev.regs().status, ATA_SR_DRDY | ATA_SR_ERR);
        assert_eq!(dev.regs().error, ATA_ER_ABRT);
    }

    #[test]
    #[should_panic(expected = "unknown ata command")]
    fn test_unknown_opcode_is_a_defect() {
        let mut dev = disk();
        run(&mut dev, 0x42);
    }

    #[test]
    #[should_panic(expected = "ata nop")]
    fn test_nop_is_a_defect() {
        let mut dev = disk();
        run(&mut dev, 0x00);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut dev = cdrom();
        Device::reset(&mut dev);
        let first = *dev.regs();
        Device::reset(&mut dev);
        let second = *dev.regs();
        assert_eq!(first.status, second.status);
        assert_eq!(first.count0, second.count0);
        assert_eq!((first.lba1, first.lba2), (second.lba1, second.lba2));
        assert_eq!(first.status, ATA_SR_DRDY);
    }

    #[test]
    fn test_drive_info_is_vendor_zeroed() {
        let dev = disk();
        assert!(dev.drive_info().serial.iter().all(|&b| b == 0));
        assert!(dev.drive_info().model.iter().all(|&b| b == 0));
        assert_eq!(dev.drive_info().world_wide_name, 0);
    }

    #[test]
    fn test_subclass_handler_override() {
        let mut dev = disk();
        // A disk model takes over IDENTIFY DEVICE.
        dev.install_handler(0xEC, |d| {
            d.io_mut().buffer = vec![0u8; 512];
            d.regs_mut().status = ATA_SR_DRDY;
        });
        run(&mut dev, 0xEC);
        assert_eq!(dev.io().buffer.len(), 512);
        assert_eq!(dev.regs().status, ATA_SR_DRDY);
    }
}
