//! Bulk-Only Transport (BBB) framing layer.
//!
//! Wire formats live in [`wire`]; the transport state itself is a small
//! per-frame record shared between the interrupt-side event handler and
//! the main loop. Class-specific control requests (GetMaxLun, Mass
//! Storage Reset) are declared here.

use crate::bbb::wire::DataDirection;

pub mod wire;

/// USB Mass Storage class code, for interface descriptors.
pub const CLASS_MASS_STORAGE: u8 = 0x08;
/// SCSI transparent command set subclass code.
pub const SUBCLASS_SCSI_TRANSPARENT: u8 = 0x06;
/// Bulk-Only Transport protocol code.
pub const PROTOCOL_BULK_ONLY: u8 = 0x50;

/// GetMaxLun class request (returns a single byte, the max LUN index).
pub const CLASS_REQUEST_GET_MAX_LUN: u8 = 0xFE;
/// Bulk-Only Mass Storage Reset class request (no data stage).
pub const CLASS_REQUEST_MASS_STORAGE_RESET: u8 = 0xFF;

/// A USB control SETUP packet, as handed over by the control-plane stack.
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// True for class requests addressed to an interface.
    pub fn is_class_interface(&self) -> bool {
        self.request_type & 0x60 == 0x20 && self.request_type & 0x1F == 0x01
    }

    /// True when bit 7 announces a device-to-host data stage.
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Outcome of a class-specific control request the transport handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassReply {
    /// GetMaxLun answer: a single byte holding the highest LUN index.
    MaxLun(u8),
    /// Mass Storage Reset accepted; the reset is applied on the next
    /// main-loop step.
    ResetAccepted,
}

/// Transport phase of the current bulk-only exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbbState {
    /// Awaiting a CBW on the bulk OUT endpoint.
    Ready,
    /// Host is sending the data phase payload.
    DataOut,
    /// Device is sending the data phase payload.
    DataIn,
    /// Data phase over (or absent); a CSW is owed to the host.
    Status,
    /// Both endpoints stalled; waiting for Mass Storage Reset plus
    /// Clear Feature on the bulk endpoints.
    StallRecovery,
}

/// Per-command transport bookkeeping.
///
/// Written by the interrupt-side CBW parser, read and advanced by the
/// main loop; always accessed under the shared frame lock.
#[derive(Debug, Clone, Copy)]
pub struct BbbFrame {
    pub state: BbbState,
    /// Tag of the most recently accepted CBW (echoed in the CSW).
    pub tag: u32,
    /// Data phase length the host announced.
    pub anticipated: u32,
    /// Bytes actually moved during the data phase.
    pub transferred: u32,
    pub direction: DataDirection,
    /// Set when the transport must stall both endpoints on the next
    /// main-loop step (invalid CBW, queue exhaustion).
    pub stall_pending: bool,
}

impl BbbFrame {
    pub fn new() -> Self {
        BbbFrame {
            state: BbbState::Ready,
            tag: 0,
            anticipated: 0,
            transferred: 0,
            direction: DataDirection::None,
            stall_pending: false,
        }
    }

    /// Residue to report in the CSW: anticipated minus transferred,
    /// clamped at zero on overshoot.
    pub fn residue(&self) -> u32 {
        self.anticipated.saturating_sub(self.transferred)
    }

    /// Back to Ready with all per-command fields cleared.
    pub fn rearm(&mut self) {
        *self = BbbFrame::new();
    }
}

impl Default for BbbFrame {
    fn default() -> Self {
        BbbFrame::new()
    }
}
