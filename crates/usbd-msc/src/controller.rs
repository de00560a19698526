//! Seam toward the USB device controller driver.
//!
//! The engine drives the controller through [`UsbController`]; the
//! controller (or the integration glue around it) reports completions
//! back through the [`MscEvents`](crate::MscEvents) handle, possibly
//! from interrupt context.

use thiserror::Error;

/// Bulk endpoint direction, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDirection {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

/// Transfer type requested for an endpoint. Mass storage only ever asks
/// for bulk endpoints; the variant exists so integrations can route the
/// request into a generic endpoint table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Bulk,
}

/// Parameters for one endpoint the engine wants configured.
#[derive(Debug, Clone, Copy)]
pub struct EndpointConfig {
    pub epid: u8,
    pub direction: EndpointDirection,
    pub transfer: EndpointType,
    pub max_packet_size: u16,
}

/// Controller-level failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    #[error("endpoint {0} is not configured")]
    UnknownEndpoint(u8),
    #[error("endpoint {0} is halted")]
    Halted(u8),
    #[error("controller rejected the transfer")]
    TransferRejected,
}

/// The controller driver contract consumed by the engine.
///
/// `send` submits a device-to-host bulk transfer; completion is signaled
/// via `MscEvents::data_sent`. `recv` arms host-to-device reception of
/// up to `len` bytes; delivery happens via `MscEvents::data_received`.
/// Both are expected to return without blocking.
pub trait UsbController {
    fn configure_endpoint(&mut self, config: &EndpointConfig) -> Result<(), UsbError>;

    fn send(&mut self, ep: u8, data: &[u8]) -> Result<(), UsbError>;

    fn recv(&mut self, ep: u8, len: usize) -> Result<(), UsbError>;

    fn stall(&mut self, ep: u8);

    fn unstall(&mut self, ep: u8);

    /// Called while the engine busy-waits on a completion, so a
    /// cooperative scheduler can run other tasks.
    fn yield_now(&mut self) {
        core::hint::spin_loop();
    }
}
