use static_assertions::const_assert_eq;
use thiserror::Error;

/// Magic signature opening a valid CBW (`'USBC'` little-endian).
pub const CBW_SIGNATURE: u32 = 0x43425355;
/// Magic signature opening a CSW (`'USBS'` little-endian).
pub const CSW_SIGNATURE: u32 = 0x53425355;

/// A CBW is always exactly 31 bytes on the wire.
pub const CBW_LEN: usize = 31;
/// A CSW is always exactly 13 bytes on the wire.
pub const CSW_LEN: usize = 13;

// Offsets inside the 31-byte CBW frame.
const CBW_OFF_SIGNATURE: usize = 0;
const CBW_OFF_TAG: usize = 4;
const CBW_OFF_DATA_LEN: usize = 8;
const CBW_OFF_FLAGS: usize = 12;
const CBW_OFF_LUN: usize = 13;
const CBW_OFF_CDB_LEN: usize = 14;
const CBW_OFF_CDB: usize = 15;

const_assert_eq!(CBW_OFF_CDB + 16, CBW_LEN);

/// Direction of the data phase announced by a CBW.
///
/// `None` means the host anticipates no data phase at all; the direction
/// bit is ignored in that case, per the Bulk-Only Transport rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// Host to device (e.g. WRITE).
    Out,
    /// Device to host (e.g. READ, INQUIRY).
    In,
    /// No data phase expected.
    None,
}

/// Why a received CBW frame was rejected.
///
/// Any of these invalidates the whole frame; the transport stalls both
/// bulk endpoints and waits for a Mass Storage Reset (spec. 6.6.1).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbwError {
    #[error("CBW frame is {0} bytes, expected exactly 31")]
    UnexpectedLength(usize),
    #[error("bad CBW signature {0:#010x}")]
    BadSignature(u32),
    #[error("reserved bits set in bmCBWFlags ({0:#04x})")]
    ReservedFlagBits(u8),
    #[error("reserved bits set in bCBWLUN ({0:#04x})")]
    ReservedLunBits(u8),
    #[error("reserved bits set in bCBWCBLength ({0:#04x})")]
    ReservedCdbLenBits(u8),
    #[error("LUN {0} is outside the configured range")]
    LunOutOfRange(u8),
    #[error("CDB length {0} is outside 1..=16")]
    BadCdbLength(u8),
}

/// USB Mass Storage Bulk-Only Transport **Command Block Wrapper**,
/// as received from the host on the bulk OUT endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cbw {
    /// Host-assigned tag, echoed back in the CSW.
    pub tag: u32,
    /// Number of data bytes the host anticipates for the data phase.
    pub data_transfer_len: u32,
    /// Data phase direction derived from bit 7 of bmCBWFlags.
    pub direction: DataDirection,
    /// Logical Unit Number the command is addressed to.
    pub lun: u8,
    /// Meaningful length of `cdb`, 1..=16.
    pub cdb_len: u8,
    /// Command Descriptor Block, zero-padded to 16 bytes.
    pub cdb: [u8; 16],
}

impl Cbw {
    /// Validate and decode a raw bulk OUT frame as a CBW.
    ///
    /// `max_luns` is the configured number of Logical Units; a LUN at or
    /// beyond it invalidates the frame. Every reserved bit is required to
    /// be zero.
    pub fn parse(frame: &[u8], max_luns: u8) -> Result<Cbw, CbwError> {
        if frame.len() != CBW_LEN {
            return Err(CbwError::UnexpectedLength(frame.len()));
        }

        let sig = u32::from_le_bytes(
            frame[CBW_OFF_SIGNATURE..CBW_OFF_SIGNATURE + 4]
                .try_into()
                .unwrap(),
        );
        if sig != CBW_SIGNATURE {
            return Err(CbwError::BadSignature(sig));
        }

        let flags = frame[CBW_OFF_FLAGS];
        if flags & 0x7F != 0 {
            return Err(CbwError::ReservedFlagBits(flags));
        }

        let lun_byte = frame[CBW_OFF_LUN];
        if lun_byte & 0xF0 != 0 {
            return Err(CbwError::ReservedLunBits(lun_byte));
        }
        if lun_byte >= max_luns {
            return Err(CbwError::LunOutOfRange(lun_byte));
        }

        let cdb_len_byte = frame[CBW_OFF_CDB_LEN];
        if cdb_len_byte & 0xE0 != 0 {
            return Err(CbwError::ReservedCdbLenBits(cdb_len_byte));
        }
        if !(1..=16).contains(&cdb_len_byte) {
            return Err(CbwError::BadCdbLength(cdb_len_byte));
        }

        let tag = u32::from_le_bytes(frame[CBW_OFF_TAG..CBW_OFF_TAG + 4].try_into().unwrap());
        let data_transfer_len = u32::from_le_bytes(
            frame[CBW_OFF_DATA_LEN..CBW_OFF_DATA_LEN + 4]
                .try_into()
                .unwrap(),
        );

        let direction = if data_transfer_len == 0 {
            DataDirection::None
        } else if flags & 0x80 != 0 {
            DataDirection::In
        } else {
            DataDirection::Out
        };

        let mut cdb = [0u8; 16];
        cdb.copy_from_slice(&frame[CBW_OFF_CDB..CBW_OFF_CDB + 16]);

        Ok(Cbw {
            tag,
            data_transfer_len,
            direction,
            lun: lun_byte,
            cdb_len: cdb_len_byte,
            cdb,
        })
    }
}

/// CSW status byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CswStatus {
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

/// USB Mass Storage Bulk-Only Transport **Command Status Wrapper**,
/// sent to the host on the bulk IN endpoint after every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csw {
    /// Tag copied from the CBW this status answers.
    pub tag: u32,
    /// Anticipated minus actually transferred bytes, clamped at zero.
    pub data_residue: u32,
    pub status: CswStatus,
}

impl Csw {
    /// Serialize into the 13-byte wire format.
    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut buf = [0u8; CSW_LEN];
        buf[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        buf[12] = self.status as u8;
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u32, dtl: u32, flags: u8, lun: u8, cdb_len: u8, cdb: &[u8]) -> [u8; CBW_LEN] {
        let mut f = [0u8; CBW_LEN];
        f[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        f[4..8].copy_from_slice(&tag.to_le_bytes());
        f[8..12].copy_from_slice(&dtl.to_le_bytes());
        f[12] = flags;
        f[13] = lun;
        f[14] = cdb_len;
        f[15..15 + cdb.len()].copy_from_slice(cdb);
        f
    }

    #[test]
    fn parses_inquiry_cbw() {
        let f = frame(0x11223344, 36, 0x80, 0, 6, &[0x12, 0, 0, 0, 0x24, 0]);
        let cbw = Cbw::parse(&f, 1).unwrap();
        assert_eq!(cbw.tag, 0x11223344);
        assert_eq!(cbw.data_transfer_len, 36);
        assert_eq!(cbw.direction, DataDirection::In);
        assert_eq!(cbw.lun, 0);
        assert_eq!(cbw.cdb_len, 6);
        assert_eq!(cbw.cdb[0], 0x12);
        assert_eq!(cbw.cdb[4], 0x24);
    }

    #[test]
    fn zero_length_transfer_has_no_direction() {
        let f = frame(1, 0, 0x80, 0, 6, &[0x00; 6]);
        let cbw = Cbw::parse(&f, 1).unwrap();
        assert_eq!(cbw.direction, DataDirection::None);
    }

    #[test]
    fn rejects_short_and_long_frames() {
        let f = frame(1, 0, 0, 0, 6, &[0; 6]);
        assert_eq!(
            Cbw::parse(&f[..30], 1),
            Err(CbwError::UnexpectedLength(30))
        );
        let mut long = [0u8; 32];
        long[..31].copy_from_slice(&f);
        assert_eq!(Cbw::parse(&long, 1), Err(CbwError::UnexpectedLength(32)));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut f = frame(1, 0, 0, 0, 6, &[0; 6]);
        f[0] = 0x54; // 'USBC' off by one
        assert_eq!(
            Cbw::parse(&f, 1),
            Err(CbwError::BadSignature(0x43425354))
        );
    }

    #[test]
    fn rejects_reserved_bits() {
        let f = frame(1, 0, 0x01, 0, 6, &[0; 6]);
        assert_eq!(Cbw::parse(&f, 1), Err(CbwError::ReservedFlagBits(0x01)));

        let f = frame(1, 0, 0, 0x10, 6, &[0; 6]);
        assert_eq!(Cbw::parse(&f, 1), Err(CbwError::ReservedLunBits(0x10)));

        let f = frame(1, 0, 0, 0, 0x26, &[0; 6]);
        assert_eq!(
            Cbw::parse(&f, 1),
            Err(CbwError::ReservedCdbLenBits(0x26))
        );
    }

    #[test]
    fn rejects_lun_and_cdb_len_out_of_range() {
        let f = frame(1, 0, 0, 1, 6, &[0; 6]);
        assert_eq!(Cbw::parse(&f, 1), Err(CbwError::LunOutOfRange(1)));

        let f = frame(1, 0, 0, 0, 0, &[]);
        assert_eq!(Cbw::parse(&f, 1), Err(CbwError::BadCdbLength(0)));
    }

    #[test]
    fn csw_wire_layout() {
        let csw = Csw {
            tag: 0xAABBCCDD,
            data_residue: 0x200,
            status: CswStatus::PhaseError,
        };
        let bytes = csw.to_bytes();
        assert_eq!(&bytes[0..4], &0x53425355u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0xAABBCCDDu32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x200u32.to_le_bytes());
        assert_eq!(bytes[12], 0x02);
    }
}
