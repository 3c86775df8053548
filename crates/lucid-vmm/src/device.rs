//! The device tree of emulated hardware.
//!
//! Every emulated device implements [`Device`] and embeds a [`DeviceNode`]
//! carrying the state shared by all devices: its name, its children, the
//! I/O resources it owns and its connection to the [`DeviceManager`].
//!
//! Parents exclusively own their children (dropping a parent drops the
//! subtree). The manager only ever holds [`Weak`] handles, so a device
//! disappears from dispatch the moment its owner lets go of it.

use std::sync::{Arc, Mutex, Weak};

use crate::manager::DeviceManager;

/// Kind of guest I/O region a device can claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoKind {
    /// x86 port I/O space.
    PortIo,
    /// Memory-mapped I/O.
    Mmio,
    /// PCI configuration space.
    PciConfig,
}

/// A named guest address range owned by a device.
#[derive(Debug, Clone)]
pub struct IoResource {
    /// Region kind.
    pub kind: IoKind,
    /// First guest address of the range.
    pub base: u64,
    /// Length in bytes; always nonzero and `base + length` never overflows.
    pub length: u64,
    /// Optional human-readable name, used for removal by name.
    pub name: Option<String>,
}

impl IoResource {
    /// Creates an anonymous resource.
    ///
    /// # Panics
    ///
    /// Panics if `length` is zero or `base + length` overflows; both are
    /// configuration defects.
    #[must_use]
    pub fn new(kind: IoKind, base: u64, length: u64) -> Self {
        assert!(length > 0, "zero-length {kind:?} resource at {base:#x}");
        assert!(
            base.checked_add(length).is_some(),
            "{kind:?} resource at {base:#x} length {length:#x} overflows"
        );
        Self {
            kind,
            base,
            length,
            name: None,
        }
    }

    /// Creates a named resource.
    #[must_use]
    pub fn named(kind: IoKind, base: u64, length: u64, name: impl Into<String>) -> Self {
        let mut resource = Self::new(kind, base, length);
        resource.name = Some(name.into());
        resource
    }

    /// One past the last address of the range.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base + self.length
    }

    /// Returns `true` if `addr` falls inside `[base, base + length)`.
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// Shared handle to a device in the tree.
pub type DeviceRef = Arc<Mutex<dyn Device>>;

/// Non-owning handle to a device, as held by the manager.
pub type WeakDeviceRef = Weak<Mutex<dyn Device>>;

/// Behavior of an emulated device.
///
/// Concrete devices embed a [`DeviceNode`] and expose it through
/// [`node`](Device::node) / [`node_mut`](Device::node_mut); the default
/// method bodies provide the base-class behavior.
pub trait Device: Send {
    /// Shared device state.
    fn node(&self) -> &DeviceNode;

    /// Shared device state, mutably.
    fn node_mut(&mut self) -> &mut DeviceNode;

    /// Puts the device back into its power-on state.
    ///
    /// May be invoked repeatedly and must be idempotent. Must not touch the
    /// set of owned I/O resources.
    fn reset(&mut self) {}

    /// Guest read from one of the device's registered resources.
    ///
    /// `offset` is relative to `resource.base`; `offset + data.len()` is
    /// guaranteed by the dispatcher to stay within the resource. Devices
    /// accept access sizes 1, 2, 4 and 8 unless documented otherwise.
    fn read(&mut self, resource: &IoResource, offset: u64, data: &mut [u8]) {
        panic!(
            "not implemented: {} read base={:#x} offset={:#x} size={}",
            self.node().name(),
            resource.base,
            offset,
            data.len()
        );
    }

    /// Guest write to one of the device's registered resources.
    fn write(&mut self, resource: &IoResource, offset: u64, data: &[u8]) {
        panic!(
            "not implemented: {} write base={:#x} offset={:#x} size={} data={:02x?}",
            self.node().name(),
            resource.base,
            offset,
            data.len(),
            data
        );
    }
}

/// Zero-sized stand-in used only to construct an empty, never-upgradable
/// [`WeakDeviceRef`] (`std::sync::Weak::new` requires a `Sized` type
/// argument, which `dyn Device` is not).
struct EmptyDevicePlaceholder;

impl Device for EmptyDevicePlaceholder {
    fn node(&self) -> &DeviceNode {
        unreachable!("EmptyDevicePlaceholder is never stored behind a DeviceRef")
    }

    fn node_mut(&mut self) -> &mut DeviceNode {
        unreachable!("EmptyDevicePlaceholder is never stored behind a DeviceRef")
    }
}

/// Returns an empty, never-upgradable [`WeakDeviceRef`].
fn empty_weak_device_ref() -> WeakDeviceRef {
    Weak::<Mutex<EmptyDevicePlaceholder>>::new()
}

/// State common to every device in the tree.
pub struct DeviceNode {
    name: String,
    children: Vec<DeviceRef>,
    parent: WeakDeviceRef,
    io_resources: Vec<IoResource>,
    connected: bool,
    manager: Weak<DeviceManager>,
    self_ref: WeakDeviceRef,
}

impl DeviceNode {
    /// Creates a detached node with the given device name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            parent: empty_weak_device_ref(),
            io_resources: Vec::new(),
            connected: false,
            manager: Weak::new(),
            self_ref: empty_weak_device_ref(),
        }
    }

    /// The device's short name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the device is currently connected to a manager.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// The device's children, in attach order.
    #[must_use]
    pub fn children(&self) -> &[DeviceRef] {
        &self.children
    }

    /// The I/O resources currently owned by the device.
    #[must_use]
    pub fn io_resources(&self) -> &[IoResource] {
        &self.io_resources
    }

    /// Claims an I/O resource.
    ///
    /// If the device is connected the registration is pushed to the manager
    /// before this returns, so dispatch sees it immediately.
    pub fn add_io_resource(&mut self, resource: IoResource) {
        if self.connected {
            if let Some(manager) = self.manager.upgrade() {
                manager.register_io_handler(&self.name, self.self_ref.clone(), resource.clone());
            }
        }
        self.io_resources.push(resource);
    }

    /// Releases the first resource matching `(kind, name)`.
    ///
    /// Name comparison is by content; a nameless resource never matches.
    /// Silent no-op when nothing matches.
    pub fn remove_io_resource(&mut self, kind: IoKind, name: &str) {
        let index = self
            .io_resources
            .iter()
            .position(|r| r.kind == kind && r.name.as_deref() == Some(name));
        if let Some(index) = index {
            self.release_resource(index);
        }
    }

    /// Releases the first resource matching `(kind, base)`.
    ///
    /// Silent no-op when nothing matches.
    pub fn remove_io_resource_at(&mut self, kind: IoKind, base: u64) {
        let index = self
            .io_resources
            .iter()
            .position(|r| r.kind == kind && r.base == base);
        if let Some(index) = index {
            self.release_resource(index);
        }
    }

    fn release_resource(&mut self, index: usize) {
        if self.connected {
            if let Some(manager) = self.manager.upgrade() {
                manager.unregister_io_handler(&self.io_resources[index]);
            }
        }
        self.io_resources.remove(index);
    }
}

/// Attaches `child` to `parent`'s subtree.
///
/// The parent owns the child from here on; the child keeps a non-owning
/// back-reference used for lifecycle diagnostics.
pub fn add_child(parent: &DeviceRef, child: DeviceRef) {
    {
        let mut c = lock(&child);
        c.node_mut().parent = Arc::downgrade(parent);
    }
    lock(parent).node_mut().children.push(child);
}

/// Connects `device` and its whole subtree to `manager`.
///
/// Children are connected before the device itself registers, so the
/// manager sees the full subtree by the time this device's resources light
/// up. After the call, every resource in the subtree is dispatchable.
pub fn connect(device: &DeviceRef, manager: &Arc<DeviceManager>) {
    let children: Vec<DeviceRef> = lock(device).node().children.clone();
    for child in &children {
        connect(child, manager);
    }

    let mut dev = lock(device);
    let node = dev.node_mut();
    node.connected = true;
    node.manager = Arc::downgrade(manager);
    node.self_ref = Arc::downgrade(device);

    let name = node.name.clone();
    let resources = node.io_resources.clone();
    let parent = node.parent.upgrade();
    drop(dev);

    if let Some(parent) = parent {
        tracing::debug!("{} <= {}", lock(&parent).node().name(), name);
    }

    manager.register_device(&name, Arc::downgrade(device));
    for resource in resources {
        manager.register_io_handler(&name, Arc::downgrade(device), resource);
    }
}

/// Disconnects `device` and its subtree from its manager.
///
/// No-op if the device is not connected. After the call no further I/O can
/// be dispatched to any device in the subtree.
pub fn disconnect(device: &DeviceRef) {
    let (children, resources, manager, name) = {
        let mut dev = lock(device);
        let node = dev.node_mut();
        if !node.connected {
            return;
        }
        node.connected = false;
        (
            node.children.clone(),
            node.io_resources.clone(),
            std::mem::take(&mut node.manager),
            node.name.clone(),
        )
    };

    for child in &children {
        disconnect(child);
    }

    if let Some(manager) = manager.upgrade() {
        for resource in &resources {
            manager.unregister_io_handler(resource);
        }
        manager.unregister_device(&name);
    }

    lock(device).node_mut().self_ref = empty_weak_device_ref();
}

/// Resets `device` and then its subtree.
pub fn reset(device: &DeviceRef) {
    let children: Vec<DeviceRef> = {
        let mut dev = lock(device);
        dev.reset();
        dev.node().children.clone()
    };
    for child in &children {
        reset(child);
    }
}

pub(crate) fn lock(device: &DeviceRef) -> std::sync::MutexGuard<'_, dyn Device + 'static> {
    device
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
