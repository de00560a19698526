//! Command Descriptor Block decoding.
//!
//! The raw CDB bytes carried by a CBW are decoded into a tagged [`Cdb`]
//! variant, one per supported opcode. Multi-byte SCSI fields are
//! big-endian on the wire. Unknown opcodes and CDBs too short for their
//! opcode decode to [`Cdb::Unsupported`]; the dispatcher answers those
//! with INVALID COMMAND OPERATION CODE rather than dropping the frame.

use crate::bbb::wire::DataDirection;

/* SPC */
pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SELECT_6: u8 = 0x15;
pub const MODE_SENSE_6: u8 = 0x1A;
pub const SEND_DIAGNOSTIC: u8 = 0x1D;
pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
pub const MODE_SELECT_10: u8 = 0x55;
pub const MODE_SENSE_10: u8 = 0x5A;
pub const REPORT_LUNS: u8 = 0xA0;

/* SBC */
pub const READ_6: u8 = 0x08;
pub const WRITE_6: u8 = 0x0A;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2A;
pub const READ_CAPACITY_16: u8 = 0x9E;

/* MMC */
pub const READ_FORMAT_CAPACITIES: u8 = 0x23;

/// READ CAPACITY(16) is the 0x9E service action code 0x10.
const SERVICE_ACTION_READ_CAPACITY_16: u8 = 0x10;

/// A decoded SCSI command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cdb {
    TestUnitReady,
    RequestSense {
        alloc_len: u8,
    },
    Inquiry {
        evpd: bool,
        page_code: u8,
        alloc_len: u16,
    },
    ModeSelect6 {
        param_len: u8,
    },
    ModeSelect10 {
        param_len: u16,
    },
    ModeSense6 {
        page_code: u8,
        alloc_len: u8,
    },
    ModeSense10 {
        page_code: u8,
        alloc_len: u16,
    },
    SendDiagnostic {
        self_test: bool,
        param_len: u16,
    },
    PreventAllowRemoval {
        /// Raw prevent field (byte 4); bits beyond bit 0 are rejected by
        /// the handler.
        prevent: u8,
    },
    ReadFormatCapacities {
        alloc_len: u16,
    },
    ReadCapacity10,
    ReadCapacity16 {
        alloc_len: u32,
    },
    ReportLuns {
        alloc_len: u32,
    },
    Read6 {
        lba: u32,
        blocks: u32,
    },
    Read10 {
        lba: u32,
        blocks: u32,
    },
    Write6 {
        lba: u32,
        blocks: u32,
    },
    Write10 {
        lba: u32,
        blocks: u32,
    },
    /// Opcode we do not implement, or a CDB too short to carry it.
    Unsupported {
        op: u8,
    },
}

impl Cdb {
    /// Decode the meaningful prefix of a CDB (as bounded by the CBW's
    /// CDB length field).
    pub fn parse(bytes: &[u8]) -> Cdb {
        if bytes.is_empty() {
            return Cdb::Unsupported { op: 0xFF };
        }
        let op = bytes[0];
        let b = |i: usize| bytes[i];

        // Each arm requires the bytes its fields live in; a shorter CDB
        // downgrades to Unsupported.
        match op {
            TEST_UNIT_READY => Cdb::TestUnitReady,
            REQUEST_SENSE if bytes.len() >= 5 => Cdb::RequestSense { alloc_len: b(4) },
            INQUIRY if bytes.len() >= 5 => Cdb::Inquiry {
                evpd: b(1) & 0x01 != 0,
                page_code: b(2),
                alloc_len: u16::from_be_bytes([b(3), b(4)]),
            },
            MODE_SELECT_6 if bytes.len() >= 5 => Cdb::ModeSelect6 { param_len: b(4) },
            MODE_SELECT_10 if bytes.len() >= 9 => Cdb::ModeSelect10 {
                param_len: u16::from_be_bytes([b(7), b(8)]),
            },
            MODE_SENSE_6 if bytes.len() >= 5 => Cdb::ModeSense6 {
                page_code: b(2) & 0x3F,
                alloc_len: b(4),
            },
            MODE_SENSE_10 if bytes.len() >= 9 => Cdb::ModeSense10 {
                page_code: b(2) & 0x3F,
                alloc_len: u16::from_be_bytes([b(7), b(8)]),
            },
            SEND_DIAGNOSTIC if bytes.len() >= 5 => Cdb::SendDiagnostic {
                self_test: b(1) & 0x04 != 0,
                param_len: u16::from_be_bytes([b(3), b(4)]),
            },
            PREVENT_ALLOW_MEDIUM_REMOVAL if bytes.len() >= 5 => {
                Cdb::PreventAllowRemoval { prevent: b(4) }
            }
            READ_FORMAT_CAPACITIES if bytes.len() >= 9 => Cdb::ReadFormatCapacities {
                alloc_len: u16::from_be_bytes([b(7), b(8)]),
            },
            READ_CAPACITY_10 => Cdb::ReadCapacity10,
            READ_CAPACITY_16
                if bytes.len() >= 14 && b(1) & 0x1F == SERVICE_ACTION_READ_CAPACITY_16 =>
            {
                Cdb::ReadCapacity16 {
                    alloc_len: u32::from_be_bytes([b(10), b(11), b(12), b(13)]),
                }
            }
            REPORT_LUNS if bytes.len() >= 10 => Cdb::ReportLuns {
                alloc_len: u32::from_be_bytes([b(6), b(7), b(8), b(9)]),
            },
            READ_6 if bytes.len() >= 5 => Cdb::Read6 {
                lba: lba6(bytes),
                blocks: blocks6(b(4)),
            },
            WRITE_6 if bytes.len() >= 5 => Cdb::Write6 {
                lba: lba6(bytes),
                blocks: blocks6(b(4)),
            },
            READ_10 if bytes.len() >= 9 => Cdb::Read10 {
                lba: u32::from_be_bytes([b(2), b(3), b(4), b(5)]),
                blocks: u16::from_be_bytes([b(7), b(8)]) as u32,
            },
            WRITE_10 if bytes.len() >= 9 => Cdb::Write10 {
                lba: u32::from_be_bytes([b(2), b(3), b(4), b(5)]),
                blocks: u16::from_be_bytes([b(7), b(8)]) as u32,
            },
            _ => Cdb::Unsupported { op },
        }
    }

    /// The raw operation code this command was decoded from.
    pub fn opcode(&self) -> u8 {
        match self {
            Cdb::TestUnitReady => TEST_UNIT_READY,
            Cdb::RequestSense { .. } => REQUEST_SENSE,
            Cdb::Inquiry { .. } => INQUIRY,
            Cdb::ModeSelect6 { .. } => MODE_SELECT_6,
            Cdb::ModeSelect10 { .. } => MODE_SELECT_10,
            Cdb::ModeSense6 { .. } => MODE_SENSE_6,
            Cdb::ModeSense10 { .. } => MODE_SENSE_10,
            Cdb::SendDiagnostic { .. } => SEND_DIAGNOSTIC,
            Cdb::PreventAllowRemoval { .. } => PREVENT_ALLOW_MEDIUM_REMOVAL,
            Cdb::ReadFormatCapacities { .. } => READ_FORMAT_CAPACITIES,
            Cdb::ReadCapacity10 => READ_CAPACITY_10,
            Cdb::ReadCapacity16 { .. } => READ_CAPACITY_16,
            Cdb::ReportLuns { .. } => REPORT_LUNS,
            Cdb::Read6 { .. } => READ_6,
            Cdb::Read10 { .. } => READ_10,
            Cdb::Write6 { .. } => WRITE_6,
            Cdb::Write10 { .. } => WRITE_10,
            Cdb::Unsupported { op } => *op,
        }
    }

    /// Data phase direction this command implies, regardless of what the
    /// CBW announced. The dispatcher reconciles the two.
    pub fn data_direction(&self) -> DataDirection {
        match self {
            Cdb::TestUnitReady | Cdb::PreventAllowRemoval { .. } => DataDirection::None,
            Cdb::SendDiagnostic { param_len, .. } => {
                if *param_len == 0 {
                    DataDirection::None
                } else {
                    DataDirection::Out
                }
            }
            Cdb::ModeSelect6 { .. } | Cdb::ModeSelect10 { .. } => DataDirection::Out,
            Cdb::Write6 { .. } | Cdb::Write10 { .. } => DataDirection::Out,
            Cdb::Unsupported { .. } => DataDirection::None,
            _ => DataDirection::In,
        }
    }
}

fn lba6(bytes: &[u8]) -> u32 {
    // 21-bit LBA: low 5 bits of byte 1, then bytes 2 and 3.
    ((bytes[1] & 0x1F) as u32) << 16 | (bytes[2] as u32) << 8 | bytes[3] as u32
}

fn blocks6(count: u8) -> u32 {
    // In the 6-byte CDBs a transfer length of 0 means 256 blocks.
    if count == 0 { 256 } else { count as u32 }
}
