//! Test rig: a scripted loopback USB bus and a RAM-backed disk.
//!
//! `SimBus` plays both the controller and the host. Host-to-device
//! transfers are queued with [`SimBus::host_out`] and delivered when the
//! engine arms reception; device-to-host transfers complete
//! synchronously and land in an ordered log the test drains with
//! [`SimBus::pop_in`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use usbd_msc::bbb::wire::{CBW_LEN, CBW_SIGNATURE, CSW_SIGNATURE};
use usbd_msc::{
    BackendError, EndpointConfig, MscConfig, MscDevice, MscEvents, SetupPacket, StorageBackend,
    UsbController, UsbError,
};

pub const EP_OUT: u8 = 1;
pub const EP_IN: u8 = 2;

#[derive(Default)]
struct BusInner {
    events: Option<MscEvents>,
    /// Endpoint and length of the reception the engine armed last.
    armed: Option<(u8, usize)>,
    host_out: VecDeque<Vec<u8>>,
    in_log: VecDeque<Vec<u8>>,
    stalled: Vec<u8>,
    /// One-shot: fire a Mass Storage Reset when the engine arms
    /// reception and the host has nothing left to send.
    reset_on_drain: bool,
}

#[derive(Clone, Default)]
pub struct SimBus {
    inner: Arc<Mutex<BusInner>>,
}

impl SimBus {
    pub fn new() -> Self {
        SimBus::default()
    }

    pub fn attach(&self, events: MscEvents) {
        self.inner.lock().unwrap().events = Some(events);
    }

    /// Queue a host-to-device transfer; delivered immediately if the
    /// engine already armed reception.
    pub fn host_out(&self, data: &[u8]) {
        let delivery = {
            let mut inner = self.inner.lock().unwrap();
            if let Some((ep, len)) = inner.armed.take() {
                let mut chunk = data.to_vec();
                chunk.truncate(len);
                inner.events.clone().map(|ev| (ev, ep, chunk))
            } else {
                inner.host_out.push_back(data.to_vec());
                None
            }
        };
        if let Some((events, ep, chunk)) = delivery {
            events.data_received(ep, &chunk);
        }
    }

    /// Queue a CBW built from its parts.
    pub fn send_cbw(&self, tag: u32, data_len: u32, flags: u8, cdb: &[u8]) {
        self.host_out(&build_cbw(tag, data_len, flags, cdb));
    }

    /// Host side of the GetMaxLun class request.
    pub fn get_max_lun(&self) -> Option<usbd_msc::ClassReply> {
        let events = self.inner.lock().unwrap().events.clone().unwrap();
        events.control_request(&SetupPacket {
            request_type: 0xA1,
            request: 0xFE,
            value: 0,
            index: 0,
            length: 1,
        })
    }

    /// Host side of the Mass Storage Reset class request.
    pub fn mass_storage_reset(&self) {
        let events = self.inner.lock().unwrap().events.clone().unwrap();
        events.control_request(&SetupPacket {
            request_type: 0x21,
            request: 0xFF,
            value: 0,
            index: 0,
            length: 0,
        });
    }

    /// Arm the one-shot reset that fires once the host script runs dry.
    pub fn reset_when_drained(&self) {
        self.inner.lock().unwrap().reset_on_drain = true;
    }

    /// Oldest not-yet-consumed device-to-host transfer.
    pub fn pop_in(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().in_log.pop_front()
    }

    pub fn in_log_len(&self) -> usize {
        self.inner.lock().unwrap().in_log.len()
    }

    pub fn is_stalled(&self, ep: u8) -> bool {
        self.inner.lock().unwrap().stalled.contains(&ep)
    }
}

impl UsbController for SimBus {
    fn configure_endpoint(&mut self, _config: &EndpointConfig) -> Result<(), UsbError> {
        Ok(())
    }

    fn send(&mut self, ep: u8, data: &[u8]) -> Result<(), UsbError> {
        let events = {
            let mut inner = self.inner.lock().unwrap();
            inner.in_log.push_back(data.to_vec());
            inner.events.clone()
        };
        if let Some(events) = events {
            events.data_sent(ep);
        }
        Ok(())
    }

    fn recv(&mut self, ep: u8, len: usize) -> Result<(), UsbError> {
        let (delivery, fire_reset) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(mut chunk) = inner.host_out.pop_front() {
                chunk.truncate(len);
                (inner.events.clone().map(|ev| (ev, chunk)), None)
            } else if inner.reset_on_drain {
                inner.reset_on_drain = false;
                (None, inner.events.clone())
            } else {
                inner.armed = Some((ep, len));
                (None, None)
            }
        };
        if let Some((events, chunk)) = delivery {
            events.data_received(ep, &chunk);
        }
        if let Some(events) = fire_reset {
            events.control_request(&SetupPacket {
                request_type: 0x21,
                request: 0xFF,
                value: 0,
                index: 0,
                length: 0,
            });
        }
        Ok(())
    }

    fn stall(&mut self, ep: u8) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.stalled.contains(&ep) {
            inner.stalled.push(ep);
        }
    }

    fn unstall(&mut self, ep: u8) {
        self.inner.lock().unwrap().stalled.retain(|e| *e != ep);
    }
}

pub fn build_cbw(tag: u32, data_len: u32, flags: u8, cdb: &[u8]) -> [u8; CBW_LEN] {
    assert!(cdb.len() <= 16);
    let mut frame = [0u8; CBW_LEN];
    frame[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
    frame[4..8].copy_from_slice(&tag.to_le_bytes());
    frame[8..12].copy_from_slice(&data_len.to_le_bytes());
    frame[12] = flags;
    frame[13] = 0;
    frame[14] = cdb.len() as u8;
    frame[15..15 + cdb.len()].copy_from_slice(cdb);
    frame
}

/// Decoded CSW as the host sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCsw {
    pub tag: u32,
    pub residue: u32,
    pub status: u8,
}

pub fn parse_csw(bytes: &[u8]) -> HostCsw {
    assert_eq!(bytes.len(), 13, "CSW must be 13 bytes");
    assert_eq!(
        u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        CSW_SIGNATURE
    );
    HostCsw {
        tag: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        residue: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        status: bytes[12],
    }
}

#[derive(Default)]
struct DiskInner {
    data: Vec<u8>,
    block_size: u32,
    blocks: u32,
    reads: Vec<(u32, u32)>,
    writes: Vec<(u32, u32)>,
    ready: bool,
    write_protected: bool,
    fail_reads: bool,
    fail_writes: bool,
}

/// RAM disk handle; clones share the same medium and call log.
#[derive(Clone, Default)]
pub struct MemDisk {
    inner: Arc<Mutex<DiskInner>>,
}

impl MemDisk {
    pub fn new(blocks: u32, block_size: u32) -> Self {
        MemDisk {
            inner: Arc::new(Mutex::new(DiskInner {
                data: vec![0u8; (blocks * block_size) as usize],
                block_size,
                blocks,
                ready: true,
                ..DiskInner::default()
            })),
        }
    }

    /// A disk that only reports geometry; the medium itself is not
    /// allocated. For capacity-style commands against huge devices.
    pub fn with_reported_geometry(blocks: u32, block_size: u32) -> Self {
        MemDisk {
            inner: Arc::new(Mutex::new(DiskInner {
                data: Vec::new(),
                block_size,
                blocks,
                ready: true,
                ..DiskInner::default()
            })),
        }
    }

    pub fn fill_pattern(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (i, byte) in inner.data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
    }

    pub fn range(&self, lba: u32, blocks: u32) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let bs = inner.block_size as usize;
        inner.data[lba as usize * bs..(lba + blocks) as usize * bs].to_vec()
    }

    pub fn reads(&self) -> Vec<(u32, u32)> {
        self.inner.lock().unwrap().reads.clone()
    }

    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner.lock().unwrap().ready = ready;
    }

    pub fn set_write_protected(&self, wp: bool) {
        self.inner.lock().unwrap().write_protected = wp;
    }

    pub fn fail_reads(&self) {
        self.inner.lock().unwrap().fail_reads = true;
    }

    pub fn fail_writes(&self) {
        self.inner.lock().unwrap().fail_writes = true;
    }
}

impl StorageBackend for MemDisk {
    fn read(&mut self, lba: u32, num_sectors: u32, buf: &mut [u8]) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        inner.reads.push((lba, num_sectors));
        if inner.fail_reads {
            return Err(BackendError::Read(lba));
        }
        let bs = inner.block_size as usize;
        let start = lba as usize * bs;
        buf.copy_from_slice(&inner.data[start..start + num_sectors as usize * bs]);
        Ok(())
    }

    fn write(&mut self, lba: u32, num_sectors: u32, buf: &[u8]) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        inner.writes.push((lba, num_sectors));
        if inner.fail_writes {
            return Err(BackendError::Write(lba));
        }
        let bs = inner.block_size as usize;
        let start = lba as usize * bs;
        inner.data[start..start + num_sectors as usize * bs].copy_from_slice(buf);
        Ok(())
    }

    fn capacity(&mut self) -> Result<u32, BackendError> {
        Ok(self.inner.lock().unwrap().blocks)
    }

    fn block_size(&mut self) -> Result<u32, BackendError> {
        Ok(self.inner.lock().unwrap().block_size)
    }

    fn is_ready(&self) -> bool {
        self.inner.lock().unwrap().ready
    }

    fn write_protected(&self) -> bool {
        self.inner.lock().unwrap().write_protected
    }
}

pub fn read10_cdb(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = 0x28;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

pub fn write10_cdb(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = read10_cdb(lba, blocks);
    cdb[0] = 0x2A;
    cdb
}

pub struct Rig {
    pub dev: MscDevice<SimBus, MemDisk>,
    pub bus: SimBus,
    pub disk: MemDisk,
}

/// A fully initialized device with CBW reception armed.
pub fn rig(blocks: u32, block_size: u32, buffer_len: usize) -> Rig {
    rig_with(MemDisk::new(blocks, block_size), buffer_len)
}

/// Same, around a caller-prepared disk.
pub fn rig_with(disk: MemDisk, buffer_len: usize) -> Rig {
    let bus = SimBus::new();
    let mut dev = MscDevice::new(
        bus.clone(),
        disk.clone(),
        MscConfig::default(),
        vec![0u8; buffer_len].into_boxed_slice(),
    )
    .expect("rig construction");
    dev.initialize().expect("rig initialize");
    bus.attach(dev.events());
    dev.initialize_automaton().expect("rig arm");
    Rig { dev, bus, disk }
}
