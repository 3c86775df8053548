//! # lucid-agent
//!
//! QEMU guest agent transport binding.
//!
//! The guest agent rides the virtio-console transport as a serial port with
//! the fixed name `org.qemu.guest_agent.0`, speaking the line-delimited
//! JSON protocol of the QEMU Guest Agent reference. This crate registers
//! the port-name binding and frames the byte stream into complete JSON
//! messages; command dispatch is intentionally not implemented here, frames
//! are handed to a pluggable sink.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]

use lucid_vmm::serial::SerialPortHandler;
use thiserror::Error;

/// The port name the guest agent matches on.
pub const GUEST_AGENT_PORT_NAME: &str = "org.qemu.guest_agent.0";

/// Cap on a single protocol line; a run longer than this without a newline
/// means the guest is not speaking the protocol.
const MAX_LINE_BYTES: usize = 1 << 20;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors on the guest agent transport.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A protocol line was not valid JSON.
    #[error("malformed guest agent message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The guest exceeded the line length cap without a newline.
    #[error("guest agent line exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong,
}

/// Receives each complete, validated protocol message.
pub trait FrameSink: Send {
    /// One parsed protocol message from the guest.
    fn on_frame(&mut self, frame: serde_json::Value);
}

impl<F: FnMut(serde_json::Value) + Send> FrameSink for F {
    fn on_frame(&mut self, frame: serde_json::Value) {
        self(frame);
    }
}

/// The guest agent port.
pub struct QemuGuestAgent {
    ready: bool,
    line: Vec<u8>,
    sink: Option<Box<dyn FrameSink>>,
}

impl QemuGuestAgent {
    /// Creates the port with no sink; frames are logged and dropped.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: false,
            line: Vec::new(),
            sink: None,
        }
    }

    /// Installs the sink receiving parsed frames.
    pub fn set_sink(&mut self, sink: Box<dyn FrameSink>) {
        self.sink = Some(sink);
    }

    /// Consumes one newline-terminated line from the stream.
    fn take_line(&mut self, line: Vec<u8>) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        let frame: serde_json::Value = serde_json::from_slice(&line)?;
        tracing::debug!(?frame, "guest agent message");
        if let Some(sink) = self.sink.as_mut() {
            sink.on_frame(frame);
        }
        Ok(())
    }

    /// Feeds raw guest bytes through the line framer.
    fn feed(&mut self, data: &[u8]) -> Result<()> {
        for &byte in data {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                self.take_line(line)?;
            } else {
                if self.line.len() >= MAX_LINE_BYTES {
                    self.line.clear();
                    return Err(AgentError::LineTooLong);
                }
                self.line.push(byte);
            }
        }
        Ok(())
    }
}

impl Default for QemuGuestAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialPortHandler for QemuGuestAgent {
    fn port_name(&self) -> &str {
        GUEST_AGENT_PORT_NAME
    }

    fn set_ready(&mut self, ready: bool) {
        tracing::debug!(ready, "guest agent port state");
        self.ready = ready;
        if !ready {
            self.line.clear();
        }
    }

    fn ready(&self) -> bool {
        self.ready
    }

    fn receive(&mut self, data: &[u8]) {
        if let Err(err) = self.feed(data) {
            // A malformed line is a guest bug, not ours; drop it and keep
            // the transport alive.
            tracing::warn!(%err, "dropping guest agent line");
        }
    }
}
