//! Serial-port device interface.
//!
//! Payloads riding the virtio-console transport (the guest agent, SPICE
//! ports) implement [`SerialPortHandler`]. The transport matches a handler
//! by its advertised port name and feeds it the guest byte stream; the
//! transport itself is an external collaborator and is not modeled here.

/// A named serial port carried by the virtio-console transport.
pub trait SerialPortHandler: Send {
    /// The fixed port name advertised to the guest.
    fn port_name(&self) -> &str;

    /// Called when the guest side opens or closes the port.
    fn set_ready(&mut self, ready: bool);

    /// Whether the guest side currently has the port open.
    fn ready(&self) -> bool;

    /// Bytes arriving from the guest. May be called with arbitrary
    /// fragmentation; handlers do their own framing.
    fn receive(&mut self, data: &[u8]);
}
