//! AHCI port companion.
//!
//! The port sits between the AHCI host controller (not modeled here) and an
//! [`IdeStorageDevice`]. On command submission it parses the guest's
//! Register Host-to-Device FIS into the device's shadow registers and
//! invokes [`start_command`](IdeStorageDevice::start_command); completion is
//! observed by reading the register file back and materializing a Register
//! Device-to-Host FIS. The host controller is responsible for delivering
//! that FIS and raising interrupts.

use std::sync::{Arc, Mutex, PoisonError};

use crate::ata::{ATA_SR_ERR, ATA_SR_DRDY};
use crate::error::{Result, StorageError};
use crate::ide::IdeStorageDevice;

/// FIS type byte of a Register Host-to-Device frame.
pub const FIS_TYPE_REG_H2D: u8 = 0x27;
/// FIS type byte of a Register Device-to-Host frame.
pub const FIS_TYPE_REG_D2H: u8 = 0x34;

/// Command bit in byte 1 of an H2D FIS; set when the frame carries a
/// command rather than a device-control update.
const FIS_H2D_COMMAND: u8 = 0x80;
/// Interrupt bit in byte 1 of a D2H FIS.
const FIS_D2H_INTERRUPT: u8 = 0x40;

/// A Register Device-to-Host FIS as placed into the received-FIS area.
pub type FisRegD2H = [u8; 20];

/// One AHCI port with an attached storage device.
pub struct AhciPort {
    index: u32,
    device: Option<Arc<Mutex<IdeStorageDevice>>>,
}

impl AhciPort {
    /// Creates an empty port.
    #[must_use]
    pub fn new(index: u32) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            index,
            device: None,
        }))
    }

    /// Port number on the host controller.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Attaches `device` and installs the one-shot back-binding.
    pub fn attach(
        port: &Arc<Mutex<Self>>,
        device: Arc<Mutex<IdeStorageDevice>>,
    ) -> Result<()> {
        lock_device(&device).bind_port(port)?;
        lock_port(port).device = Some(device);
        Ok(())
    }

    /// Whether a device is attached.
    #[must_use]
    pub fn occupied(&self) -> bool {
        self.device.is_some()
    }

    /// The published SATA signature of the attached device, or zero when
    /// the port is empty.
    #[must_use]
    pub fn signature(&self) -> u32 {
        self.device
            .as_ref()
            .map_or(0, |device| lock_device(device).signature())
    }

    /// Submits a guest command FIS to the attached device.
    ///
    /// Loads the shadow registers from the frame, runs the command and
    /// returns the completion FIS for the host controller to deliver.
    pub fn submit(&mut self, cfis: &[u8]) -> Result<FisRegD2H> {
        let device = self.device.as_ref().ok_or(StorageError::NoDevice)?;

        if cfis.len() < 20 {
            return Err(StorageError::BadFis(format!(
                "frame too short: {} bytes",
                cfis.len()
            )));
        }
        if cfis[0] != FIS_TYPE_REG_H2D {
            return Err(StorageError::BadFis(format!(
                "unexpected FIS type {:#04x}",
                cfis[0]
            )));
        }
        if cfis[1] & FIS_H2D_COMMAND == 0 {
            return Err(StorageError::BadFis("control frame on command path".into()));
        }

        let mut dev = lock_device(device);
        {
            let regs = dev.regs_mut();
            regs.command = cfis[2];
            regs.feature0 = cfis[3];
            regs.lba0 = cfis[4];
            regs.lba1 = cfis[5];
            regs.lba2 = cfis[6];
            regs.device = cfis[7];
            regs.lba3 = cfis[8];
            regs.lba4 = cfis[9];
            regs.lba5 = cfis[10];
            regs.feature1 = cfis[11];
            regs.count0 = cfis[12];
            regs.count1 = cfis[13];
        }
        dev.start_command();

        if dev.regs().status & ATA_SR_ERR != 0 {
            tracing::trace!(
                port = self.index,
                "command {:#04x} completed with error {:#04x}",
                dev.regs().command,
                dev.regs().error
            );
        }
        Ok(completion_fis(&dev))
    }

    /// Resets the attached device and returns its signature registers as a
    /// completion FIS, as a COMRESET would.
    pub fn reset_device(&mut self) -> Result<FisRegD2H> {
        let device = self.device.as_ref().ok_or(StorageError::NoDevice)?;
        let mut dev = lock_device(device);
        dev.regs_mut().status = ATA_SR_DRDY;
        dev.ata_reset_signature();
        Ok(completion_fis(&dev))
    }
}

/// Builds the Register Device-to-Host FIS reflecting the device's current
/// shadow registers.
fn completion_fis(dev: &IdeStorageDevice) -> FisRegD2H {
    let regs = dev.regs();
    let mut fis: FisRegD2H = [0; 20];
    fis[0] = FIS_TYPE_REG_D2H;
    fis[1] = FIS_D2H_INTERRUPT;
    fis[2] = regs.status;
    fis[3] = regs.error;
    fis[4] = regs.lba0;
    fis[5] = regs.lba1;
    fis[6] = regs.lba2;
    fis[7] = regs.device;
    fis[8] = regs.lba3;
    fis[9] = regs.lba4;
    fis[10] = regs.lba5;
    fis[12] = regs.count0;
    fis[13] = regs.count1;
    fis
}

fn lock_device(device: &Arc<Mutex<IdeStorageDevice>>) -> std::sync::MutexGuard<'_, IdeStorageDevice> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_port(port: &Arc<Mutex<AhciPort>>) -> std::sync::MutexGuard<'_, AhciPort> {
    port.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ata::{ATA_ER_ABRT, ATA_SR_DRDY, ATA_SR_ERR};
    use crate::ide::IdeStorageType;

    fn port_with(storage_type: IdeStorageType) -> Arc<Mutex<AhciPort>> {
        let port = AhciPort::new(0);
        let device = Arc::new(Mutex::new(IdeStorageDevice::new("sata0", storage_type)));
        AhciPort::attach(&port, device).unwrap();
        port
    }

    fn command_fis(command: u8, feature0: u8, count0: u8) -> [u8; 20] {
        let mut fis = [0u8; 20];
        fis[0] = FIS_TYPE_REG_H2D;
        fis[1] = FIS_H2D_COMMAND;
        fis[2] = command;
        fis[3] = feature0;
        fis[12] = count0;
        fis
    }

    #[test]
    fn test_signatures() {
        assert_eq!(
            port_with(IdeStorageType::Harddisk).lock().unwrap().signature(),
            0x0000_0101
        );
        assert_eq!(
            port_with(IdeStorageType::Cdrom).lock().unwrap().signature(),
            0xEB14_0101
        );
        assert_eq!(AhciPort::new(1).lock().unwrap().signature(), 0);
    }

    #[test]
    fn test_submit_loads_registers_and_completes() {
        let port = port_with(IdeStorageType::Cdrom);
        // READ LOG aborts; the completion FIS carries the error back.
        let fis = port
            .lock()
            .unwrap()
            .submit(&command_fis(0x2F, 0, 0))
            .unwrap();
        assert_eq!(fis[0], FIS_TYPE_REG_D2H);
        assert_eq!(fis[2], ATA_SR_DRDY | ATA_SR_ERR);
        assert_eq!(fis[3], ATA_ER_ABRT);
    }

    #[test]
    fn test_submit_udma_set_features_succeeds() {
        let port = port_with(IdeStorageType::Harddisk);
        let fis = port
            .lock()
            .unwrap()
            .submit(&command_fis(0xEF, 0x03, (8 << 3) | 2))
            .unwrap();
        assert_eq!(fis[2], ATA_SR_DRDY);
        assert_eq!(fis[3], 0);
    }

    #[test]
    fn test_submit_rejects_malformed_frames() {
        let port = port_with(IdeStorageType::Harddisk);
        let mut guard = port.lock().unwrap();

        assert!(matches!(
            guard.submit(&[0u8; 4]),
            Err(StorageError::BadFis(_))
        ));

        let mut wrong_type = command_fis(0xEF, 0x66, 0);
        wrong_type[0] = FIS_TYPE_REG_D2H;
        assert!(matches!(
            guard.submit(&wrong_type),
            Err(StorageError::BadFis(_))
        ));

        let mut control = command_fis(0xEF, 0x66, 0);
        control[1] = 0;
        assert!(matches!(
            guard.submit(&control),
            Err(StorageError::BadFis(_))
        ));
    }

    #[test]
    fn test_submit_on_empty_port() {
        let port = AhciPort::new(0);
        assert!(matches!(
            port.lock().unwrap().submit(&command_fis(0xEC, 0, 0)),
            Err(StorageError::NoDevice)
        ));
    }

    #[test]
    fn test_reset_device_publishes_atapi_signature() {
        let port = port_with(IdeStorageType::Cdrom);
        let fis = port.lock().unwrap().reset_device().unwrap();
        assert_eq!((fis[12], fis[4], fis[5], fis[6]), (1, 1, 0x14, 0xEB));
    }

    #[test]
    fn test_binding_is_one_shot() {
        let port = port_with(IdeStorageType::Harddisk);
        let second = AhciPort::new(1);
        let device = {
            let guard = port.lock().unwrap();
            guard.device.clone().unwrap()
        };
        assert!(matches!(
            AhciPort::attach(&second, device),
            Err(StorageError::PortAlreadyBound(_))
        ));
    }
}
