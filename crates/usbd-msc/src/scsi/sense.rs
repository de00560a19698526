//! Sense data: the SCSI-standard error reporting triple.
//!
//! A single "last error" is kept per logical unit as a 24-bit composite
//! `(key << 16) | (asc << 8) | ascq`, handed to the host through
//! REQUEST SENSE and cleared by it.

use static_assertions::const_assert_eq;

/// Sense keys used by this stack (SPC-4, table 27 subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SenseKey {
    NoSense = 0x0,
    NotReady = 0x2,
    MediumError = 0x3,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
}

/* Additional sense codes. */
pub const ASC_NO_ADDITIONAL_SENSE: u8 = 0x00;
pub const ASC_LOGICAL_UNIT_NOT_READY: u8 = 0x04;
pub const ASC_WRITE_ERROR: u8 = 0x0C;
pub const ASC_UNRECOVERED_READ_ERROR: u8 = 0x11;
pub const ASC_INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
pub const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;
pub const ASC_INVALID_FIELD_IN_CDB: u8 = 0x24;

/* Additional sense code qualifiers. */
pub const ASCQ_NO_ADDITIONAL_SENSE: u8 = 0x00;
pub const ASCQ_BECOMING_READY: u8 = 0x01;

/// Fixed-format REQUEST SENSE response length.
pub const SENSE_RESPONSE_LEN: usize = 18;

/// Byte 0 of a fixed-format sense response: current errors.
const SENSE_ERROR_CODE_CURRENT: u8 = 0x70;

const_assert_eq!(SENSE_RESPONSE_LEN, 18);

/// The {sense key, ASC, ASCQ} triple packed into one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenseData(u32);

impl SenseData {
    pub const NONE: SenseData = SenseData(0);

    pub const fn new(key: SenseKey, asc: u8, ascq: u8) -> Self {
        SenseData(((key as u32) << 16) | ((asc as u32) << 8) | ascq as u32)
    }

    pub fn key(&self) -> u8 {
        ((self.0 >> 16) & 0x0F) as u8
    }

    pub fn asc(&self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    pub fn ascq(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn is_set(&self) -> bool {
        self.0 != 0
    }

    /// Raw composite, for storage in an atomic word.
    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        SenseData(raw & 0x000F_FFFF)
    }

    /// Fixed-format sense response (SPC-4 4.5.3) reporting this error.
    pub fn to_fixed_format(&self) -> [u8; SENSE_RESPONSE_LEN] {
        let mut buf = [0u8; SENSE_RESPONSE_LEN];
        buf[0] = SENSE_ERROR_CODE_CURRENT;
        buf[2] = self.key();
        // bytes following the additional-length field
        buf[7] = (SENSE_RESPONSE_LEN - 8) as u8;
        buf[12] = self.asc();
        buf[13] = self.ascq();
        buf
    }
}
