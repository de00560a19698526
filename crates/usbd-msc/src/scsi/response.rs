//! Response payload builders for the non-streaming SCSI commands.
//!
//! Each builder returns a fixed-size byte array in wire order; the
//! engine truncates to the host's anticipated length when sending.
//! Multi-byte fields are big-endian, per SCSI.

use static_assertions::const_assert_eq;

/// Standard INQUIRY response length.
pub const INQUIRY_LEN: usize = 36;
/// READ CAPACITY(10) response length.
pub const READ_CAPACITY_10_LEN: usize = 8;
/// READ CAPACITY(16) response length.
pub const READ_CAPACITY_16_LEN: usize = 32;
/// READ FORMAT CAPACITIES: header plus a single capacity descriptor.
pub const READ_FORMAT_CAPACITIES_LEN: usize = 12;
/// MODE SENSE(6) bare parameter header.
pub const MODE_SENSE_6_LEN: usize = 4;
/// MODE SENSE(10) bare parameter header.
pub const MODE_SENSE_10_LEN: usize = 8;

/// Response data format announced in INQUIRY byte 3 (SPC-2 or later).
const INQUIRY_DATA_FORMAT: u8 = 0x02;
/// Formatted-media code in a READ FORMAT CAPACITIES descriptor.
const FORMAT_CAPACITIES_FORMATTED: u8 = 0x02;

const_assert_eq!(INQUIRY_LEN, 36);

/// Copy an ASCII identification string into a fixed-width field,
/// space padded, truncated, never NUL padded.
fn id_field(dst: &mut [u8], src: &str) {
    dst.fill(b' ');
    let bytes = src.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}

/// Standard 36-byte INQUIRY data for a removable direct-access device.
pub fn inquiry(vendor: &str, product: &str, revision: &str) -> [u8; INQUIRY_LEN] {
    let mut buf = [0u8; INQUIRY_LEN];
    // byte 0: peripheral qualifier 0, device type 0 (direct access)
    buf[1] = 0x80; // RMB: removable medium
    // byte 2: version 0, no conformance claimed
    buf[3] = INQUIRY_DATA_FORMAT;
    buf[4] = (INQUIRY_LEN - 5) as u8; // bytes remaining after byte 4
    id_field(&mut buf[8..16], vendor);
    id_field(&mut buf[16..32], product);
    id_field(&mut buf[32..36], revision);
    buf
}

/// READ CAPACITY(10): last LBA and block size, both 32-bit.
pub fn read_capacity_10(num_blocks: u32, block_size: u32) -> [u8; READ_CAPACITY_10_LEN] {
    let mut buf = [0u8; READ_CAPACITY_10_LEN];
    // the host expects the address of the last block, not the count
    buf[0..4].copy_from_slice(&(num_blocks - 1).to_be_bytes());
    buf[4..8].copy_from_slice(&block_size.to_be_bytes());
    buf
}

/// READ CAPACITY(16): 64-bit last LBA, block size, no protection info.
pub fn read_capacity_16(num_blocks: u32, block_size: u32) -> [u8; READ_CAPACITY_16_LEN] {
    let mut buf = [0u8; READ_CAPACITY_16_LEN];
    buf[0..8].copy_from_slice(&(num_blocks as u64 - 1).to_be_bytes());
    buf[8..12].copy_from_slice(&block_size.to_be_bytes());
    // bytes 12.. stay zero: no protection, no logical block provisioning
    buf
}

/// READ FORMAT CAPACITIES with a single formatted-media descriptor.
pub fn read_format_capacities(
    num_blocks: u32,
    block_size: u32,
) -> [u8; READ_FORMAT_CAPACITIES_LEN] {
    let mut buf = [0u8; READ_FORMAT_CAPACITIES_LEN];
    buf[3] = 8; // capacity list length: one descriptor
    buf[4..8].copy_from_slice(&num_blocks.to_be_bytes());
    buf[8] = FORMAT_CAPACITIES_FORMATTED;
    // 24-bit block length
    buf[9..12].copy_from_slice(&block_size.to_be_bytes()[1..4]);
    buf
}

/// REPORT LUNS: 8-byte header plus one 8-byte entry per LUN.
pub fn report_luns(luns: u8) -> Vec<u8> {
    let luns = luns.max(1); // LUN 0 is always present
    let mut buf = vec![0u8; 8 + 8 * luns as usize];
    buf[0..4].copy_from_slice(&(8u32 * luns as u32).to_be_bytes());
    for lun in 0..luns {
        // single-level peripheral addressing, bus 0
        buf[8 + 8 * lun as usize + 1] = lun;
    }
    buf
}

/// MODE SENSE(6) parameter header; no block descriptors, no pages.
pub fn mode_sense_6(write_protected: bool) -> [u8; MODE_SENSE_6_LEN] {
    let mut buf = [0u8; MODE_SENSE_6_LEN];
    buf[0] = (MODE_SENSE_6_LEN - 1) as u8; // mode data length
    // byte 1: medium type 0
    buf[2] = if write_protected { 0x80 } else { 0x00 };
    // byte 3: block descriptor length 0
    buf
}

/// MODE SENSE(10) parameter header; no block descriptors, no pages.
pub fn mode_sense_10(write_protected: bool) -> [u8; MODE_SENSE_10_LEN] {
    let mut buf = [0u8; MODE_SENSE_10_LEN];
    buf[0..2].copy_from_slice(&((MODE_SENSE_10_LEN - 2) as u16).to_be_bytes());
    buf[3] = if write_protected { 0x80 } else { 0x00 };
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inquiry_layout() {
        let buf = inquiry("VEND", "DISK ON A WIRE", "0.1");
        assert_eq!(buf[0], 0x00);
        assert_eq!(buf[1] & 0x80, 0x80);
        assert_eq!(buf[3], 0x02);
        assert_eq!(buf[4], 0x1F);
        assert_eq!(&buf[8..16], b"VEND    ");
        assert_eq!(&buf[16..32], b"DISK ON A WIRE  ");
        assert_eq!(&buf[32..36], b"0.1 ");
    }

    #[test]
    fn inquiry_truncates_long_strings() {
        let buf = inquiry("TOOLONGVENDOR", "P", "12345");
        assert_eq!(&buf[8..16], b"TOOLONGV");
        assert_eq!(&buf[32..36], b"1234");
    }

    #[test]
    fn read_capacity_10_reports_last_lba() {
        // 0x00100000 blocks of 0x1000 bytes
        let buf = read_capacity_10(0x0010_0000, 0x1000);
        assert_eq!(
            buf,
            [0x00, 0x0F, 0xFF, 0xFF, 0x00, 0x00, 0x10, 0x00]
        );
    }

    #[test]
    fn read_capacity_16_layout() {
        let buf = read_capacity_16(0x0010_0000, 512);
        assert_eq!(&buf[0..8], &0x000F_FFFFu64.to_be_bytes());
        assert_eq!(&buf[8..12], &512u32.to_be_bytes());
        assert!(buf[12..].iter().all(|b| *b == 0));
    }

    #[test]
    fn format_capacities_single_descriptor() {
        let buf = read_format_capacities(0x2000, 512);
        assert_eq!(buf[3], 8);
        assert_eq!(&buf[4..8], &0x2000u32.to_be_bytes());
        assert_eq!(buf[8], 0x02);
        assert_eq!(&buf[9..12], &[0x00, 0x02, 0x00]);
    }

    #[test]
    fn report_luns_single_lun() {
        let buf = report_luns(1);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[0..4], &8u32.to_be_bytes());
        assert!(buf[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn mode_sense_headers() {
        assert_eq!(mode_sense_6(false), [3, 0, 0, 0]);
        assert_eq!(mode_sense_6(true), [3, 0, 0x80, 0]);
        assert_eq!(mode_sense_10(true), [0, 6, 0, 0x80, 0, 0, 0, 0]);
    }
}
