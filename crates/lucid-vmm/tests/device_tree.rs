//! End-to-end device fabric scenarios: tree lifecycle, live registration
//! and unmapped dispatch.

use std::sync::{Arc, Mutex};

use lucid_vmm::device::{self, Device, DeviceNode, DeviceRef};
use lucid_vmm::{DeviceManager, IoKind, IoResource, VmmError};

struct Port {
    node: DeviceNode,
    last_write: Option<(u64, Vec<u8>)>,
}

impl Port {
    fn new(name: &str) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            node: DeviceNode::new(name),
            last_write: None,
        }))
    }
}

impl Device for Port {
    fn node(&self) -> &DeviceNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut DeviceNode {
        &mut self.node
    }

    fn read(&mut self, _resource: &IoResource, _offset: u64, data: &mut [u8]) {
        data.fill(0x5A);
    }

    fn write(&mut self, _resource: &IoResource, offset: u64, data: &[u8]) {
        self.last_write = Some((offset, data.to_vec()));
    }
}

/// Builds root -> bridge -> leaf, each holding one port-I/O resource.
fn build_tree() -> (DeviceRef, Arc<Mutex<Port>>) {
    let root = Port::new("root");
    let bridge = Port::new("bridge");
    let leaf = Port::new("leaf");

    root.lock()
        .unwrap()
        .node_mut()
        .add_io_resource(IoResource::named(IoKind::PortIo, 0x3F8, 8, "root-io"));
    bridge
        .lock()
        .unwrap()
        .node_mut()
        .add_io_resource(IoResource::named(IoKind::PortIo, 0x2F8, 8, "bridge-io"));
    leaf.lock()
        .unwrap()
        .node_mut()
        .add_io_resource(IoResource::named(IoKind::PortIo, 0x3E8, 8, "leaf-io"));

    let leaf_ref: DeviceRef = leaf.clone();
    let bridge_ref: DeviceRef = bridge;
    let root_ref: DeviceRef = root;
    device::add_child(&bridge_ref, leaf_ref);
    device::add_child(&root_ref, bridge_ref);
    (root_ref, leaf)
}

#[test]
fn unknown_port_write_hits_the_unmapped_path() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let manager = DeviceManager::new();
    let (root, leaf) = build_tree();
    manager.connect(&root);

    let err = manager
        .dispatch_write(IoKind::PortIo, 0x9000, &[0x01])
        .unwrap_err();
    assert!(matches!(
        err,
        VmmError::Unmapped {
            kind: IoKind::PortIo,
            addr: 0x9000
        }
    ));

    // No device was invoked.
    assert!(leaf.lock().unwrap().last_write.is_none());
}

#[test]
fn connect_registers_the_whole_subtree() {
    let manager = DeviceManager::new();
    let (root, leaf) = build_tree();
    manager.connect(&root);

    assert_eq!(manager.device_count(), 3);
    assert_eq!(manager.io_handler_count(IoKind::PortIo), 3);

    manager
        .dispatch_write(IoKind::PortIo, 0x3EA, &[0x42])
        .unwrap();
    let guard = leaf.lock().unwrap();
    assert_eq!(guard.last_write, Some((2, vec![0x42])));
}

#[test]
fn disconnect_is_idempotent_and_empties_dispatch() {
    let manager = DeviceManager::new();
    let (root, _leaf) = build_tree();
    manager.connect(&root);
    assert_eq!(manager.io_handler_count(IoKind::PortIo), 3);

    manager.disconnect(&root);
    assert_eq!(manager.device_count(), 0);
    assert_eq!(manager.io_handler_count(IoKind::PortIo), 0);

    // Second disconnect is a no-op, and nothing underflows.
    manager.disconnect(&root);
    assert_eq!(manager.device_count(), 0);
    assert_eq!(manager.io_handler_count(IoKind::PortIo), 0);

    let mut buf = [0u8; 1];
    assert!(manager
        .dispatch_read(IoKind::PortIo, 0x3F8, &mut buf)
        .is_err());
}

#[test]
fn reconnect_after_disconnect_restores_dispatch() {
    let manager = DeviceManager::new();
    let (root, leaf) = build_tree();
    manager.connect(&root);
    manager.disconnect(&root);
    manager.connect(&root);

    manager
        .dispatch_write(IoKind::PortIo, 0x3E8, &[0x99])
        .unwrap();
    assert_eq!(leaf.lock().unwrap().last_write, Some((0, vec![0x99])));
}

#[test]
fn live_resource_add_is_visible_to_dispatch_immediately() {
    let manager = DeviceManager::new();
    let (root, leaf) = build_tree();
    manager.connect(&root);

    {
        let mut l = leaf.lock().unwrap();
        l.node_mut()
            .add_io_resource(IoResource::named(IoKind::Mmio, 0xFEB0_0000, 0x1000, "bar0"));
    }
    manager
        .dispatch_write(IoKind::Mmio, 0xFEB0_0004, &[1, 2, 3, 4])
        .unwrap();
    assert_eq!(
        leaf.lock().unwrap().last_write,
        Some((4, vec![1, 2, 3, 4]))
    );

    {
        let mut l = leaf.lock().unwrap();
        l.node_mut().remove_io_resource(IoKind::Mmio, "bar0");
    }
    assert!(manager
        .dispatch_write(IoKind::Mmio, 0xFEB0_0004, &[0])
        .is_err());
}
