//! The host side of the simulated session: builds CBWs, drives the
//! device main loop, and collects payloads and CSWs from the bus log.

use anyhow::{Context, Result, bail};
use log::debug;

use usbd_msc::bbb::wire::{CBW_LEN, CBW_SIGNATURE, CSW_SIGNATURE};
use usbd_msc::{ClassReply, MscDevice, SetupPacket};

use crate::bus::SimBus;
use crate::ramdisk::RamDisk;

/// CSW fields as decoded by the host.
#[derive(Debug, Clone, Copy)]
pub struct CswInfo {
    pub tag: u32,
    pub residue: u32,
    pub status: u8,
}

pub struct Host {
    pub bus: SimBus,
    pub dev: MscDevice<SimBus, RamDisk>,
    next_tag: u32,
}

impl Host {
    pub fn new(bus: SimBus, dev: MscDevice<SimBus, RamDisk>) -> Self {
        Host {
            bus,
            dev,
            next_tag: 1,
        }
    }

    /// GetMaxLun over the control plane.
    pub fn get_max_lun(&self) -> Result<u8> {
        match self.bus.events().control_request(&SetupPacket {
            request_type: 0xA1,
            request: 0xFE,
            value: 0,
            index: 0,
            length: 1,
        }) {
            Some(ClassReply::MaxLun(index)) => Ok(index),
            other => bail!("unexpected GetMaxLun reply: {other:?}"),
        }
    }

    /// Run a command with a device-to-host data phase; returns the
    /// concatenated payload and the CSW.
    pub fn execute_in(&mut self, cdb: &[u8], data_len: u32) -> Result<(Vec<u8>, CswInfo)> {
        let tag = self.submit(cdb, data_len, 0x80, &[])?;
        let (payload, csw) = self.collect(tag)?;
        Ok((payload, csw))
    }

    /// Run a command with a host-to-device data phase (or none).
    pub fn execute_out(&mut self, cdb: &[u8], data: &[u8]) -> Result<CswInfo> {
        let tag = self.submit(cdb, data.len() as u32, 0x00, data)?;
        let (payload, csw) = self.collect(tag)?;
        if !payload.is_empty() {
            bail!("unexpected {} payload bytes on an OUT command", payload.len());
        }
        Ok(csw)
    }

    fn submit(&mut self, cdb: &[u8], data_len: u32, flags: u8, data: &[u8]) -> Result<u32> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);

        debug!(
            "CBW tag {tag:#010x} opcode {:#04x} dtl {data_len}",
            cdb.first().copied().unwrap_or(0)
        );
        self.bus.host_write(&build_cbw(tag, data_len, flags, cdb));
        if !data.is_empty() {
            self.bus.host_write(data);
        }
        self.dev
            .exec_automaton()
            .context("device main-loop step failed")?;
        Ok(tag)
    }

    /// Drain the bus log: every entry but the last is payload, the last
    /// must be a well-formed CSW echoing `tag`.
    fn collect(&mut self, tag: u32) -> Result<(Vec<u8>, CswInfo)> {
        let mut entries = Vec::new();
        while let Some(entry) = self.bus.host_read() {
            entries.push(entry);
        }
        let csw_bytes = entries.pop().context("no CSW on the wire")?;
        let csw = parse_csw(&csw_bytes)?;
        debug!(
            "CSW tag {:#010x} status {} residue {}",
            csw.tag, csw.status, csw.residue
        );
        if csw.tag != tag {
            bail!("CSW tag {:#010x} does not echo CBW tag {tag:#010x}", csw.tag);
        }
        Ok((entries.concat(), csw))
    }
}

pub fn build_cbw(tag: u32, data_len: u32, flags: u8, cdb: &[u8]) -> [u8; CBW_LEN] {
    assert!((1..=16).contains(&cdb.len()), "CDB length out of range");
    let mut frame = [0u8; CBW_LEN];
    frame[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
    frame[4..8].copy_from_slice(&tag.to_le_bytes());
    frame[8..12].copy_from_slice(&data_len.to_le_bytes());
    frame[12] = flags;
    frame[14] = cdb.len() as u8;
    frame[15..15 + cdb.len()].copy_from_slice(cdb);
    frame
}

fn parse_csw(bytes: &[u8]) -> Result<CswInfo> {
    if bytes.len() != 13 {
        bail!("CSW is {} bytes, expected 13", bytes.len());
    }
    let sig = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if sig != CSW_SIGNATURE {
        bail!("bad CSW signature {sig:#010x}");
    }
    Ok(CswInfo {
        tag: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        residue: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        status: bytes[12],
    })
}
