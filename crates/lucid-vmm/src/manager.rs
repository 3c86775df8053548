//! Guest I/O dispatch.
//!
//! One [`DeviceManager`] owns the dispatch structures for a machine: a
//! name registry and, per region kind, an interval map from guest address
//! ranges to the owning device. vCPU threads call
//! [`dispatch_read`](DeviceManager::dispatch_read) /
//! [`dispatch_write`](DeviceManager::dispatch_write) on every trapped
//! access; registration is cold and serialized against dispatch.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::device::{self, DeviceRef, IoKind, IoResource, WeakDeviceRef};
use crate::error::{Result, VmmError};

/// A registered `(device, resource)` dispatch target.
#[derive(Clone)]
struct IoHandler {
    owner: String,
    resource: IoResource,
    device: WeakDeviceRef,
}

/// Per-kind interval maps, keyed on range base.
#[derive(Default)]
struct IoMaps {
    port_io: BTreeMap<u64, IoHandler>,
    mmio: BTreeMap<u64, IoHandler>,
    pci_config: BTreeMap<u64, IoHandler>,
}

impl IoMaps {
    fn map(&self, kind: IoKind) -> &BTreeMap<u64, IoHandler> {
        match kind {
            IoKind::PortIo => &self.port_io,
            IoKind::Mmio => &self.mmio,
            IoKind::PciConfig => &self.pci_config,
        }
    }

    fn map_mut(&mut self, kind: IoKind) -> &mut BTreeMap<u64, IoHandler> {
        match kind {
            IoKind::PortIo => &mut self.port_io,
            IoKind::Mmio => &mut self.mmio,
            IoKind::PciConfig => &mut self.pci_config,
        }
    }
}

/// Root of the device fabric for one machine.
///
/// The manager does not own devices; it resolves weak handles at dispatch
/// time. Duplicate device names and overlapping I/O ranges are
/// configuration defects and abort the process.
#[derive(Default)]
pub struct DeviceManager {
    devices: RwLock<HashMap<String, WeakDeviceRef>>,
    io: RwLock<IoMaps>,
}

impl DeviceManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connects `root` and its subtree to this manager.
    pub fn connect(self: &Arc<Self>, root: &DeviceRef) {
        device::connect(root, self);
    }

    /// Disconnects `root` and its subtree. Idempotent.
    pub fn disconnect(&self, root: &DeviceRef) {
        device::disconnect(root);
    }

    /// Adds a device to the name registry.
    ///
    /// # Panics
    ///
    /// Panics on a duplicate name; two devices sharing a name is a
    /// configuration defect.
    pub fn register_device(&self, name: &str, device: WeakDeviceRef) {
        let mut devices = write(&self.devices);
        let previous = devices.insert(name.to_string(), device);
        assert!(previous.is_none(), "duplicate device name {name:?}");
        tracing::debug!(name, "device registered");
    }

    /// Removes a device from the name registry.
    pub fn unregister_device(&self, name: &str) {
        let mut devices = write(&self.devices);
        if devices.remove(name).is_none() {
            tracing::warn!(name, "unregistering unknown device");
        }
    }

    /// Looks a device up by name, if it is still alive and registered.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<DeviceRef> {
        read(&self.devices).get(name).and_then(WeakDeviceRef::upgrade)
    }

    /// Number of registered devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        read(&self.devices).len()
    }

    /// Maps `resource` to `device` for dispatch.
    ///
    /// The mapping is visible to dispatch before this returns.
    ///
    /// # Panics
    ///
    /// Panics if the range overlaps a live registration of the same kind.
    pub fn register_io_handler(&self, owner: &str, device: WeakDeviceRef, resource: IoResource) {
        let mut io = write(&self.io);
        let map = io.map_mut(resource.kind);

        if let Some((_, below)) = map.range(..=resource.base).next_back() {
            assert!(
                below.resource.end() <= resource.base,
                "{}: {:?} range {:#x}+{:#x} overlaps {} at {:#x}+{:#x}",
                owner,
                resource.kind,
                resource.base,
                resource.length,
                below.owner,
                below.resource.base,
                below.resource.length
            );
        }
        if let Some((_, above)) = map.range(resource.base..).next() {
            assert!(
                resource.end() <= above.resource.base,
                "{}: {:?} range {:#x}+{:#x} overlaps {} at {:#x}+{:#x}",
                owner,
                resource.kind,
                resource.base,
                resource.length,
                above.owner,
                above.resource.base,
                above.resource.length
            );
        }

        tracing::debug!(
            owner,
            kind = ?resource.kind,
            "io handler registered at {:#x}+{:#x}",
            resource.base,
            resource.length
        );
        map.insert(
            resource.base,
            IoHandler {
                owner: owner.to_string(),
                resource,
                device,
            },
        );
    }

    /// Drops the dispatch mapping for `resource`.
    pub fn unregister_io_handler(&self, resource: &IoResource) {
        let mut io = write(&self.io);
        if io.map_mut(resource.kind).remove(&resource.base).is_none() {
            tracing::warn!(
                kind = ?resource.kind,
                "unregistering unknown io handler at {:#x}",
                resource.base
            );
        }
    }

    /// Number of live registrations of `kind`. Intended for bring-up checks.
    #[must_use]
    pub fn io_handler_count(&self, kind: IoKind) -> usize {
        read(&self.io).map(kind).len()
    }

    /// Routes a guest read to the owning device.
    ///
    /// Unmapped reads fill `data` with zeros, log a diagnostic and return
    /// [`VmmError::Unmapped`]; the hypervisor adapter completes the trap
    /// either way.
    pub fn dispatch_read(&self, kind: IoKind, addr: u64, data: &mut [u8]) -> Result<()> {
        let Some((resource, device)) = self.find_handler(kind, addr, data.len()) else {
            data.fill(0);
            tracing::warn!(?kind, size = data.len(), "unmapped guest read at {addr:#x}");
            return Err(VmmError::Unmapped { kind, addr });
        };
        let Some(device) = device.upgrade() else {
            data.fill(0);
            return Err(VmmError::DeviceGone { kind, addr });
        };
        let offset = addr - resource.base;
        device::lock(&device).read(&resource, offset, data);
        Ok(())
    }

    /// Routes a guest write to the owning device.
    ///
    /// Unmapped writes are discarded, logged and reported as
    /// [`VmmError::Unmapped`].
    pub fn dispatch_write(&self, kind: IoKind, addr: u64, data: &[u8]) -> Result<()> {
        let Some((resource, device)) = self.find_handler(kind, addr, data.len()) else {
            tracing::warn!(
                ?kind,
                data = ?data,
                "unmapped guest write at {addr:#x}"
            );
            return Err(VmmError::Unmapped { kind, addr });
        };
        let Some(device) = device.upgrade() else {
            return Err(VmmError::DeviceGone { kind, addr });
        };
        let offset = addr - resource.base;
        device::lock(&device).write(&resource, offset, data);
        Ok(())
    }

    /// Interval lookup. Clones the hit out so the map lock is never held
    /// across the device callback (devices may re-enter registration).
    fn find_handler(&self, kind: IoKind, addr: u64, size: usize) -> Option<(IoResource, WeakDeviceRef)> {
        let io = read(&self.io);
        let (_, handler) = io.map(kind).range(..=addr).next_back()?;
        if !handler.resource.contains(addr) {
            return None;
        }
        // A hit that straddles the end of the resource is a dispatch defect,
        // not a guest error.
        assert!(
            addr + size as u64 <= handler.resource.end(),
            "{}: {:?} access at {:#x} size {} overruns resource {:#x}+{:#x}",
            handler.owner,
            kind,
            addr,
            size,
            handler.resource.base,
            handler.resource.length
        );
        Some((handler.resource.clone(), handler.device.clone()))
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
