//! Bring-up flow of a SATA drive: fabric connect, bus reset, first
//! commands a guest driver issues.

use std::sync::{Arc, Mutex};

use lucid_storage::ahci::{AhciPort, FIS_TYPE_REG_H2D};
use lucid_storage::ata::{ATA_ER_ABRT, ATA_SR_DRDY, ATA_SR_ERR};
use lucid_storage::{IdeStorageDevice, IdeStorageType};
use lucid_vmm::device::{self, DeviceRef};
use lucid_vmm::DeviceManager;

fn command_fis(command: u8, feature0: u8, count0: u8) -> [u8; 20] {
    let mut fis = [0u8; 20];
    fis[0] = FIS_TYPE_REG_H2D;
    fis[1] = 0x80;
    fis[2] = command;
    fis[3] = feature0;
    fis[12] = count0;
    fis
}

#[test]
fn cdrom_identify_flow_steers_guest_to_packet_identify() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let port = AhciPort::new(0);
    let device = Arc::new(Mutex::new(IdeStorageDevice::new(
        "cd0",
        IdeStorageType::Cdrom,
    )));
    AhciPort::attach(&port, device).unwrap();

    let mut guard = port.lock().unwrap();

    // COMRESET publishes the ATAPI signature.
    let fis = guard.reset_device().unwrap();
    assert_eq!((fis[12], fis[4], fis[5], fis[6]), (1, 1, 0x14, 0xEB));
    assert_eq!(guard.signature(), 0xEB14_0101);

    // The guest's IDENTIFY DEVICE probe aborts with the signature intact,
    // telling the driver to retry as IDENTIFY PACKET DEVICE.
    let fis = guard.submit(&command_fis(0xEC, 0, 0)).unwrap();
    assert_eq!(fis[2], ATA_SR_DRDY | ATA_SR_ERR);
    assert_eq!(fis[3], ATA_ER_ABRT);
    assert_eq!((fis[5], fis[6]), (0x14, 0xEB));
}

#[test]
fn disk_negotiates_udma_after_fabric_reset() {
    let manager = DeviceManager::new();
    let device = Arc::new(Mutex::new(IdeStorageDevice::new(
        "sda",
        IdeStorageType::Harddisk,
    )));
    let dev_ref: DeviceRef = device.clone();
    manager.connect(&dev_ref);
    device::reset(&dev_ref);

    {
        let guard = device.lock().unwrap();
        assert_eq!(guard.regs().status, ATA_SR_DRDY);
        assert_eq!(
            (
                guard.regs().count0,
                guard.regs().lba0,
                guard.regs().lba1,
                guard.regs().lba2
            ),
            (1, 1, 0, 0)
        );
    }

    let port = AhciPort::new(0);
    AhciPort::attach(&port, device).unwrap();

    // SET FEATURES: transfer mode UDMA5.
    let fis = port
        .lock()
        .unwrap()
        .submit(&command_fis(0xEF, 0x03, (8 << 3) | 5))
        .unwrap();
    assert_eq!(fis[2], ATA_SR_DRDY);
    assert_eq!(fis[3], 0);

    manager.disconnect(&dev_ref);
    manager.disconnect(&dev_ref);
}
