//! The mass-storage engine: lifecycle, dispatcher and command handlers.
//!
//! Two halves cooperate around an [`Arc`]-shared state block:
//!
//! * [`MscEvents`] is the interrupt-side handle. The integration calls it
//!   from the controller's completion callbacks; it validates CBWs,
//!   parses CDBs, enqueues command records and flips flags. It never
//!   touches the controller or the backend.
//! * [`MscDevice`] owns the controller, the backend and the main-loop
//!   state. [`MscDevice::exec_automaton`] runs one step: observe the
//!   reset flag, dequeue, check the SCSI automaton, run the handler,
//!   emit the CSW and re-arm CBW reception.
//!
//! Data phases busy-wait on a line-readiness flag set by the completion
//! callbacks, polling the reset flag and yielding through the controller
//! on every spin.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use log::{debug, error, info, trace, warn};
use spin::Mutex;
use thiserror::Error;

use crate::backend::{BackendError, StorageBackend};
use crate::bbb::wire::{CBW_LEN, Cbw, Csw, CswStatus, DataDirection};
use crate::bbb::{
    BbbFrame, BbbState, CLASS_REQUEST_GET_MAX_LUN, CLASS_REQUEST_MASS_STORAGE_RESET, ClassReply,
    SetupPacket,
};
use crate::config::{ConfigError, MscConfig};
use crate::controller::{EndpointConfig, EndpointDirection, EndpointType, UsbController, UsbError};
use crate::queue::{CommandQueue, QueuedCommand};
use crate::scsi::automaton::{ScsiState, next_state};
use crate::scsi::cdb::Cdb;
use crate::scsi::response;
use crate::scsi::sense::{
    ASC_INVALID_COMMAND_OPERATION_CODE, ASC_INVALID_FIELD_IN_CDB, ASC_LBA_OUT_OF_RANGE,
    ASC_LOGICAL_UNIT_NOT_READY, ASC_UNRECOVERED_READ_ERROR, ASC_WRITE_ERROR,
    ASCQ_BECOMING_READY, SenseData, SenseKey,
};

/* Transmission line readiness, one atomic word. */
const LINE_READY: u8 = 0;
const LINE_BUSY: u8 = 1;
const LINE_ERROR: u8 = 2;

/// Top-level errors surfaced by the public API. Everything else is
/// handled locally through sense data, failed CSWs or reset recovery.
#[derive(Error, Debug)]
pub enum MscError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Usb(#[from] UsbError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("transfer buffer ({buffer} bytes) is not a multiple of the block size ({block_size})")]
    BufferBlockMismatch { buffer: usize, block_size: u32 },
    #[error("device is not initialized")]
    NotInitialized,
}

/// Why an in-flight handler stopped early.
enum Abort {
    /// Mass Storage Reset observed mid-command; no CSW is owed.
    Reset,
    /// Controller failure, surfaced to the caller.
    Usb(UsbError),
}

/// Shared transfer buffer plus the fill level of the last OUT chunk.
struct TransferBuf {
    data: Box<[u8]>,
    fill: usize,
}

/// The half of the engine state that interrupt context may touch.
struct Shared {
    queue: Mutex<CommandQueue>,
    /// True when the consumer drained the queue; cleared on enqueue.
    /// Readers never take the queue lock for this.
    queue_empty: AtomicBool,
    line: AtomicU8,
    reset_requested: AtomicBool,
    /// Last error composite, see [`SenseData`].
    last_sense: AtomicU32,
    /// Block size cached at initialization; the CBW parser uses it to
    /// normalize transfer lengths to bytes.
    block_size: AtomicU32,
    frame: Mutex<BbbFrame>,
    buf: Mutex<TransferBuf>,
    max_luns: u8,
    ep_out: u8,
    ep_in: u8,
}

impl Shared {
    fn store_sense(&self, sense: SenseData) {
        self.last_sense.store(sense.raw(), Ordering::Release);
    }
}

/// Interrupt-side handle. Clone freely; all clones observe the same
/// engine instance.
#[derive(Clone)]
pub struct MscEvents {
    shared: Arc<Shared>,
}

impl MscEvents {
    /// Bulk OUT completion: either a CBW (transport Ready) or a chunk of
    /// a host-to-device data phase. Safe to call from interrupt context.
    pub fn data_received(&self, ep: u8, data: &[u8]) {
        if ep != self.shared.ep_out {
            warn!("OUT completion on unexpected endpoint {ep}");
            return;
        }
        if self.shared.reset_requested.load(Ordering::Acquire) {
            trace!("dropping OUT completion while reset is pending");
            return;
        }

        let mut frame = self.shared.frame.lock();
        match frame.state {
            BbbState::Ready => self.on_cbw(&mut frame, data),
            BbbState::DataOut => {
                let mut buf = self.shared.buf.lock();
                let n = data.len().min(buf.data.len());
                buf.data[..n].copy_from_slice(&data[..n]);
                buf.fill = n;
                drop(buf);
                self.shared.line.store(LINE_READY, Ordering::Release);
            }
            other => trace!("dropping OUT completion in state {other:?}"),
        }
    }

    /// Bulk IN completion: the previously submitted payload or CSW left
    /// the device. Safe to call from interrupt context.
    pub fn data_sent(&self, ep: u8) {
        if ep != self.shared.ep_in {
            warn!("IN completion on unexpected endpoint {ep}");
            return;
        }
        self.shared.line.store(LINE_READY, Ordering::Release);
    }

    /// Class-specific control request. Returns `None` for requests this
    /// interface does not handle (the control stack should stall ep0).
    pub fn control_request(&self, pkt: &SetupPacket) -> Option<ClassReply> {
        if !pkt.is_class_interface() {
            return None;
        }
        match pkt.request {
            CLASS_REQUEST_GET_MAX_LUN
                if pkt.is_device_to_host() && pkt.value == 0 && pkt.length == 1 =>
            {
                debug!("GetMaxLun -> {}", self.shared.max_luns - 1);
                Some(ClassReply::MaxLun(self.shared.max_luns - 1))
            }
            CLASS_REQUEST_MASS_STORAGE_RESET
                if !pkt.is_device_to_host() && pkt.value == 0 && pkt.length == 0 =>
            {
                info!("Mass Storage Reset requested");
                self.shared.reset_requested.store(true, Ordering::Release);
                Some(ClassReply::ResetAccepted)
            }
            other => {
                warn!("unhandled class request {other:#04x}");
                None
            }
        }
    }

    fn on_cbw(&self, frame: &mut BbbFrame, data: &[u8]) {
        let cbw = match Cbw::parse(data, self.shared.max_luns) {
            Ok(cbw) => cbw,
            Err(err) => {
                // Spec. 6.6.1: the frame is not meaningful, resynchronize
                // through a stall and Mass Storage Reset.
                warn!("invalid CBW: {err}");
                self.shared.store_sense(SenseData::new(
                    SenseKey::IllegalRequest,
                    ASC_INVALID_FIELD_IN_CDB,
                    0,
                ));
                frame.state = BbbState::StallRecovery;
                frame.stall_pending = true;
                return;
            }
        };

        let cdb = Cdb::parse(&cbw.cdb[..cbw.cdb_len as usize]);
        let mut cmd = QueuedCommand::new(cdb);
        let block_size = self.shared.block_size.load(Ordering::Acquire) as u64;
        if block_size != 0 {
            if let Cdb::Read6 { lba, blocks }
            | Cdb::Read10 { lba, blocks }
            | Cdb::Write6 { lba, blocks }
            | Cdb::Write10 { lba, blocks } = cdb
            {
                cmd.rw_offset = lba as u64 * block_size;
                cmd.rw_count = blocks as u64 * block_size;
            }
        }

        let mut queue = self.shared.queue.lock();
        if queue.enqueue(cmd).is_err() {
            // Out of slots: phase error, drop the frame, resynchronize.
            error!("command queue exhausted, dropping CBW {:#010x}", cbw.tag);
            frame.state = BbbState::StallRecovery;
            frame.stall_pending = true;
            return;
        }
        drop(queue);

        trace!(
            "CBW tag {:#010x}, opcode {:#04x}, {} byte data phase",
            cbw.tag,
            cdb.opcode(),
            cbw.data_transfer_len
        );

        frame.tag = cbw.tag;
        frame.anticipated = cbw.data_transfer_len;
        frame.transferred = 0;
        frame.direction = cbw.direction;
        frame.state = match cbw.direction {
            DataDirection::Out => BbbState::DataOut,
            DataDirection::In => BbbState::DataIn,
            DataDirection::None => BbbState::Status,
        };
        self.shared.queue_empty.store(false, Ordering::Release);
    }
}

/// A single mass-storage logical unit behind a bulk endpoint pair.
///
/// Construction registers the shared transfer buffer (which must be
/// sized as a power of two and, by integrator contract, aligned for the
/// controller's DMA); [`initialize`](MscDevice::initialize) configures
/// the endpoints and caches the medium geometry;
/// [`initialize_automaton`](MscDevice::initialize_automaton) arms CBW
/// reception; [`exec_automaton`](MscDevice::exec_automaton) is the main
/// loop step.
pub struct MscDevice<C: UsbController, B: StorageBackend> {
    controller: C,
    backend: B,
    config: MscConfig,
    shared: Arc<Shared>,
    state: ScsiState,
    capacity_blocks: u32,
    block_size: u32,
    initialized: bool,
}

impl<C: UsbController, B: StorageBackend> MscDevice<C, B> {
    /// Register the collaborators and the shared transfer buffer.
    pub fn new(
        controller: C,
        backend: B,
        config: MscConfig,
        buffer: Box<[u8]>,
    ) -> Result<Self, MscError> {
        config.validate()?;
        if !buffer.len().is_power_of_two() {
            return Err(ConfigError::BadBufferLength(buffer.len()).into());
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(CommandQueue::new()),
            queue_empty: AtomicBool::new(true),
            line: AtomicU8::new(LINE_READY),
            reset_requested: AtomicBool::new(false),
            last_sense: AtomicU32::new(0),
            block_size: AtomicU32::new(0),
            frame: Mutex::new(BbbFrame::new()),
            buf: Mutex::new(TransferBuf {
                data: buffer,
                fill: 0,
            }),
            max_luns: config.max_luns,
            ep_out: config.ep_out,
            ep_in: config.ep_in,
        });

        Ok(MscDevice {
            controller,
            backend,
            config,
            shared,
            state: ScsiState::Idle,
            capacity_blocks: 0,
            block_size: 0,
            initialized: false,
        })
    }

    /// Handle for wiring the controller's completion callbacks.
    pub fn events(&self) -> MscEvents {
        MscEvents {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Configure both bulk endpoints and cache the medium geometry.
    pub fn initialize(&mut self) -> Result<(), MscError> {
        self.controller.configure_endpoint(&EndpointConfig {
            epid: self.config.ep_out,
            direction: EndpointDirection::Out,
            transfer: EndpointType::Bulk,
            max_packet_size: self.config.max_packet_size,
        })?;
        self.controller.configure_endpoint(&EndpointConfig {
            epid: self.config.ep_in,
            direction: EndpointDirection::In,
            transfer: EndpointType::Bulk,
            max_packet_size: self.config.max_packet_size,
        })?;

        let capacity = self.backend.capacity()?;
        if capacity == 0 {
            return Err(BackendError::Capacity.into());
        }
        let block_size = self.backend.block_size()?;
        let buffer_len = self.shared.buf.lock().data.len();
        if block_size == 0
            || buffer_len < block_size as usize
            || buffer_len % block_size as usize != 0
        {
            return Err(MscError::BufferBlockMismatch {
                buffer: buffer_len,
                block_size,
            });
        }

        self.capacity_blocks = capacity;
        self.block_size = block_size;
        self.shared.block_size.store(block_size, Ordering::Release);
        self.initialized = true;

        info!(
            "mass storage ready: {capacity} blocks of {block_size} bytes, endpoints OUT {} / IN {}",
            self.config.ep_out, self.config.ep_in
        );
        Ok(())
    }

    /// Place the transport in Ready and arm CBW reception.
    pub fn initialize_automaton(&mut self) -> Result<(), MscError> {
        if !self.initialized {
            return Err(MscError::NotInitialized);
        }
        self.shared.frame.lock().rearm();
        self.shared.line.store(LINE_READY, Ordering::Release);
        self.controller.recv(self.config.ep_out, CBW_LEN)?;
        Ok(())
    }

    /// Reset recovery: abort everything pending and return to Ready.
    /// Idempotent.
    pub fn reinit(&mut self) -> Result<(), MscError> {
        info!("reinitializing mass storage state");
        {
            let mut queue = self.shared.queue.lock();
            queue.clear();
        }
        self.shared.queue_empty.store(true, Ordering::Release);
        self.shared.last_sense.store(0, Ordering::Release);
        self.shared.buf.lock().fill = 0;
        self.shared.reset_requested.store(false, Ordering::Release);
        self.state = ScsiState::Idle;

        self.controller.unstall(self.config.ep_out);
        self.controller.unstall(self.config.ep_in);
        self.initialize_automaton()
    }

    /// One main-loop step. Idempotent when nothing is pending; local
    /// errors (bad commands, backend failures) are answered on the wire
    /// and do not surface here.
    pub fn exec_automaton(&mut self) -> Result<(), MscError> {
        if !self.initialized {
            return Err(MscError::NotInitialized);
        }

        if self.shared.reset_requested.load(Ordering::Acquire) {
            return self.reinit();
        }

        {
            let mut frame = self.shared.frame.lock();
            if frame.state == BbbState::StallRecovery {
                let stall_now = frame.stall_pending;
                frame.stall_pending = false;
                drop(frame);
                if stall_now {
                    warn!("transport desynchronized, stalling both endpoints");
                    self.controller.stall(self.config.ep_out);
                    self.controller.stall(self.config.ep_in);
                }
                // parked until a Mass Storage Reset arrives
                return Ok(());
            }
        }

        if self.shared.queue_empty.load(Ordering::Acquire) {
            return Ok(());
        }

        let cmd = {
            let mut queue = self.shared.queue.lock();
            let cmd = queue.dequeue();
            if queue.is_empty() {
                self.shared.queue_empty.store(true, Ordering::Release);
            }
            cmd
        };
        let Some(cmd) = cmd else {
            return Ok(());
        };

        match self.dispatch(cmd) {
            Ok(()) => Ok(()),
            Err(Abort::Reset) => {
                info!("command aborted by Mass Storage Reset");
                self.reinit()
            }
            Err(Abort::Usb(err)) => Err(err.into()),
        }
    }

    /* ---------- dispatch ---------- */

    fn dispatch(&mut self, cmd: QueuedCommand) -> Result<(), Abort> {
        let op = cmd.cdb.opcode();
        trace!("executing opcode {op:#04x} in state {:?}", self.state);

        if matches!(cmd.cdb, Cdb::Unsupported { .. }) {
            debug!("unsupported command {op:#04x}");
            return self.reject_command();
        }

        let next = match next_state(self.state, op) {
            Ok(next) => next,
            Err(err) => {
                debug!("{err}");
                return self.reject_command();
            }
        };

        // Reconcile the direction the CBW announced with the one the
        // command implies; a hard mismatch is a phase error.
        let announced = self.shared.frame.lock().direction;
        let implied = cmd.cdb.data_direction();
        if matches!(
            (implied, announced),
            (DataDirection::In, DataDirection::Out) | (DataDirection::Out, DataDirection::In)
        ) {
            warn!(
                "direction mismatch for opcode {op:#04x}: CBW announced {announced:?}, command implies {implied:?}"
            );
            return self.fail_phase();
        }

        self.state = next;

        match cmd.cdb {
            Cdb::TestUnitReady => self.cmd_test_unit_ready(),
            Cdb::RequestSense { alloc_len } => self.cmd_request_sense(alloc_len),
            Cdb::Inquiry { evpd, .. } => self.cmd_inquiry(evpd),
            Cdb::ModeSelect6 { .. } | Cdb::ModeSelect10 { .. } => self.cmd_mode_select(),
            Cdb::ModeSense6 { .. } => {
                let data = response::mode_sense_6(self.backend.write_protected());
                self.reply_in(&data)
            }
            Cdb::ModeSense10 { .. } => {
                let data = response::mode_sense_10(self.backend.write_protected());
                self.reply_in(&data)
            }
            Cdb::SendDiagnostic {
                self_test,
                param_len,
            } => self.cmd_send_diagnostic(self_test, param_len),
            Cdb::PreventAllowRemoval { prevent } => self.cmd_prevent_allow(prevent),
            Cdb::ReadFormatCapacities { .. } => {
                let data =
                    response::read_format_capacities(self.capacity_blocks, self.block_size);
                self.reply_in(&data)
            }
            Cdb::ReadCapacity10 => {
                let data = response::read_capacity_10(self.capacity_blocks, self.block_size);
                self.reply_in(&data)
            }
            Cdb::ReadCapacity16 { .. } => {
                let data = response::read_capacity_16(self.capacity_blocks, self.block_size);
                self.reply_in(&data)
            }
            Cdb::ReportLuns { .. } => {
                let data = response::report_luns(self.config.max_luns);
                self.reply_in(&data)
            }
            Cdb::Read6 { lba, blocks } | Cdb::Read10 { lba, blocks } => {
                self.cmd_read(lba, blocks, &cmd)
            }
            Cdb::Write6 { lba, blocks } | Cdb::Write10 { lba, blocks } => {
                self.cmd_write(lba, blocks, &cmd)
            }
            Cdb::Unsupported { .. } => unreachable!("rejected before the transition check"),
        }
    }

    /* ---------- command handlers ---------- */

    fn cmd_test_unit_ready(&mut self) -> Result<(), Abort> {
        if self.backend.is_ready() {
            self.finish(CswStatus::Passed)
        } else {
            self.record_transient_error(SenseData::new(
                SenseKey::NotReady,
                ASC_LOGICAL_UNIT_NOT_READY,
                ASCQ_BECOMING_READY,
            ));
            self.finish(CswStatus::Failed)
        }
    }

    fn cmd_request_sense(&mut self, alloc_len: u8) -> Result<(), Abort> {
        let sense = SenseData::from_raw(self.shared.last_sense.load(Ordering::Acquire));
        let data = sense.to_fixed_format();
        let n = data.len().min(alloc_len as usize);
        self.reply_in(&data[..n])?;
        // reported successfully, the error is consumed
        self.shared.last_sense.store(0, Ordering::Release);
        Ok(())
    }

    fn cmd_inquiry(&mut self, evpd: bool) -> Result<(), Abort> {
        if evpd {
            // no vital product data pages
            self.record_error(SenseData::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
                0,
            ));
            return self.finish(CswStatus::Failed);
        }
        let data = response::inquiry(
            &self.config.vendor,
            &self.config.product,
            &self.config.revision,
        );
        self.reply_in(&data)
    }

    /// MODE SELECT: the parameter list is drained and ignored.
    fn cmd_mode_select(&mut self) -> Result<(), Abort> {
        let buffer_len = self.buffer_len();
        loop {
            let remaining = self.shared.frame.lock().residue() as usize;
            if remaining == 0 {
                break;
            }
            self.recv_payload(remaining.min(buffer_len))?;
        }
        self.finish(CswStatus::Passed)
    }

    fn cmd_send_diagnostic(&mut self, self_test: bool, param_len: u16) -> Result<(), Abort> {
        if !self_test && param_len == 0 {
            self.finish(CswStatus::Passed)
        } else {
            self.record_error(SenseData::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
                0,
            ));
            self.finish(CswStatus::Failed)
        }
    }

    fn cmd_prevent_allow(&mut self, prevent: u8) -> Result<(), Abort> {
        if prevent & !0x01 != 0 {
            self.record_error(SenseData::new(
                SenseKey::IllegalRequest,
                ASC_INVALID_FIELD_IN_CDB,
                0,
            ));
            return self.finish(CswStatus::Failed);
        }
        // nothing to lock on this medium
        self.finish(CswStatus::Passed)
    }

    fn cmd_read(&mut self, lba: u32, blocks: u32, cmd: &QueuedCommand) -> Result<(), Abort> {
        if self.range_exceeds_capacity(lba, blocks) {
            return self.finish(CswStatus::Failed);
        }

        let block_size = self.block_size as u64;
        let buffer_len = self.buffer_len() as u64;
        let mut offset = cmd.rw_offset;
        let mut remaining = cmd.rw_count;

        while remaining > 0 {
            if self.shared.reset_requested.load(Ordering::Acquire) {
                return Err(Abort::Reset);
            }
            let chunk = remaining.min(buffer_len);
            let sector = offset / block_size;
            if sector > u32::MAX as u64 {
                error!("sector index overflow at byte offset {offset:#x}");
                return self.fail_phase();
            }
            let num_sectors = (chunk / block_size) as u32;

            let read = {
                let mut buf = self.shared.buf.lock();
                self.backend
                    .read(sector as u32, num_sectors, &mut buf.data[..chunk as usize])
            };
            if let Err(err) = read {
                warn!("backend read failed: {err}");
                self.record_error(SenseData::new(
                    SenseKey::MediumError,
                    ASC_UNRECOVERED_READ_ERROR,
                    0,
                ));
                return self.finish(CswStatus::Failed);
            }

            self.send_payload_from_buffer(chunk as usize)?;
            offset += chunk;
            remaining -= chunk;
        }

        self.finish(CswStatus::Passed)?;
        self.state = ScsiState::Idle;
        Ok(())
    }

    fn cmd_write(&mut self, lba: u32, blocks: u32, cmd: &QueuedCommand) -> Result<(), Abort> {
        if self.range_exceeds_capacity(lba, blocks) {
            return self.finish(CswStatus::Failed);
        }

        let block_size = self.block_size as u64;
        let buffer_len = self.buffer_len() as u64;
        let mut offset = cmd.rw_offset;
        let mut remaining = cmd.rw_count;

        while remaining > 0 {
            if self.shared.reset_requested.load(Ordering::Acquire) {
                return Err(Abort::Reset);
            }
            let chunk = remaining.min(buffer_len);
            let sector = offset / block_size;
            if sector > u32::MAX as u64 {
                error!("sector index overflow at byte offset {offset:#x}");
                return self.fail_phase();
            }
            let num_sectors = (chunk / block_size) as u32;

            self.recv_payload(chunk as usize)?;

            let written = {
                let buf = self.shared.buf.lock();
                self.backend
                    .write(sector as u32, num_sectors, &buf.data[..chunk as usize])
            };
            if let Err(err) = written {
                warn!("backend write failed: {err}");
                self.record_error(SenseData::new(SenseKey::MediumError, ASC_WRITE_ERROR, 0));
                return self.finish(CswStatus::Failed);
            }

            offset += chunk;
            remaining -= chunk;
        }

        self.finish(CswStatus::Passed)?;
        self.state = ScsiState::Idle;
        Ok(())
    }

    /// Check the addressed range against the advertised capacity,
    /// recording LOGICAL BLOCK ADDRESS OUT OF RANGE on violation.
    fn range_exceeds_capacity(&mut self, lba: u32, blocks: u32) -> bool {
        if lba as u64 + blocks as u64 > self.capacity_blocks as u64 {
            debug!(
                "LBA range {lba}+{blocks} beyond capacity {}",
                self.capacity_blocks
            );
            self.record_error(SenseData::new(
                SenseKey::IllegalRequest,
                ASC_LBA_OUT_OF_RANGE,
                0,
            ));
            return true;
        }
        false
    }

    /* ---------- transport plumbing ---------- */

    fn buffer_len(&self) -> usize {
        self.shared.buf.lock().data.len()
    }

    /// Record an error and move the automaton to Error.
    fn record_error(&mut self, sense: SenseData) {
        self.shared.store_sense(sense);
        self.state = ScsiState::Error;
    }

    /// Record an error that completes in Idle (e.g. unit not ready).
    fn record_transient_error(&mut self, sense: SenseData) {
        self.shared.store_sense(sense);
    }

    /// Unsupported opcode or invalid transition: CHECK CONDITION with
    /// the whole anticipated length as residue, automaton to Error.
    fn reject_command(&mut self) -> Result<(), Abort> {
        self.record_error(SenseData::new(
            SenseKey::IllegalRequest,
            ASC_INVALID_COMMAND_OPERATION_CODE,
            0,
        ));
        self.finish(CswStatus::Failed)
    }

    /// Spin until the line is ready, watching for reset and yielding
    /// through the controller on every turn.
    fn wait_line_ready(&mut self) -> Result<(), Abort> {
        loop {
            if self.shared.reset_requested.load(Ordering::Acquire) {
                return Err(Abort::Reset);
            }
            match self.shared.line.load(Ordering::Acquire) {
                LINE_READY => return Ok(()),
                LINE_ERROR => return Err(Abort::Usb(UsbError::TransferRejected)),
                _ => self.controller.yield_now(),
            }
        }
    }

    /// Push one device-to-host chunk straight from a caller-built slice.
    fn send_payload(&mut self, data: &[u8]) -> Result<(), Abort> {
        self.wait_line_ready()?;
        self.shared.line.store(LINE_BUSY, Ordering::Release);
        self.controller
            .send(self.shared.ep_in, data)
            .map_err(Abort::Usb)?;
        self.shared.frame.lock().transferred += data.len() as u32;
        Ok(())
    }

    /// Push one device-to-host chunk out of the shared transfer buffer.
    fn send_payload_from_buffer(&mut self, len: usize) -> Result<(), Abort> {
        self.wait_line_ready()?;
        self.shared.line.store(LINE_BUSY, Ordering::Release);
        {
            let buf = self.shared.buf.lock();
            self.controller
                .send(self.shared.ep_in, &buf.data[..len])
                .map_err(Abort::Usb)?;
        }
        self.shared.frame.lock().transferred += len as u32;
        Ok(())
    }

    /// Receive one host-to-device chunk into the shared transfer buffer.
    fn recv_payload(&mut self, len: usize) -> Result<(), Abort> {
        self.wait_line_ready()?;
        self.shared.line.store(LINE_BUSY, Ordering::Release);
        self.controller
            .recv(self.shared.ep_out, len)
            .map_err(Abort::Usb)?;
        self.wait_line_ready()?;
        let received = self.shared.buf.lock().fill;
        self.shared.frame.lock().transferred += received as u32;
        Ok(())
    }

    /// Short device-to-host response, truncated to the anticipated
    /// length, followed by a passed CSW.
    fn reply_in(&mut self, data: &[u8]) -> Result<(), Abort> {
        let anticipated = self.shared.frame.lock().anticipated as usize;
        let n = data.len().min(anticipated);
        if n > 0 {
            self.send_payload(&data[..n])?;
        }
        self.finish(CswStatus::Passed)
    }

    /// Send the CSW for the current command and re-arm CBW reception.
    fn finish(&mut self, status: CswStatus) -> Result<(), Abort> {
        let (residue, direction) = {
            let frame = self.shared.frame.lock();
            (frame.residue(), frame.direction)
        };
        // Spec. 6.7.2: OUT data the device refused is stalled away
        // before the status is reported.
        if status != CswStatus::Passed && direction == DataDirection::Out && residue > 0 {
            self.controller.stall(self.shared.ep_out);
        }
        self.send_status(status, residue)?;

        self.shared.frame.lock().rearm();
        self.controller
            .recv(self.shared.ep_out, CBW_LEN)
            .map_err(Abort::Usb)?;
        Ok(())
    }

    /// Emit a CSW with an explicit status and residue.
    fn send_status(&mut self, status: CswStatus, residue: u32) -> Result<(), Abort> {
        let tag = self.shared.frame.lock().tag;
        let csw = Csw {
            tag,
            data_residue: residue,
            status,
        };
        trace!("CSW tag {tag:#010x} status {status:?} residue {residue}");
        self.wait_line_ready()?;
        self.shared.line.store(LINE_BUSY, Ordering::Release);
        self.controller
            .send(self.shared.ep_in, &csw.to_bytes())
            .map_err(Abort::Usb)?;
        self.wait_line_ready()
    }

    /// Phase error: report CSW status 2, then park in stall recovery
    /// until the host performs a Mass Storage Reset.
    fn fail_phase(&mut self) -> Result<(), Abort> {
        let residue = self.shared.frame.lock().residue();
        self.send_status(CswStatus::PhaseError, residue)?;
        {
            let mut frame = self.shared.frame.lock();
            frame.state = BbbState::StallRecovery;
            frame.stall_pending = false;
        }
        self.controller.stall(self.shared.ep_out);
        self.controller.stall(self.shared.ep_in);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbb::wire::CBW_SIGNATURE;
    use std::sync::Mutex as StdMutex;

    /// Controller double that completes every transfer synchronously.
    #[derive(Clone, Default)]
    struct LoopController {
        inner: Arc<StdMutex<LoopInner>>,
        events: Arc<StdMutex<Option<MscEvents>>>,
    }

    #[derive(Default)]
    struct LoopInner {
        sent: Vec<Vec<u8>>,
        stalled: Vec<u8>,
        out_script: Vec<Vec<u8>>,
    }

    impl UsbController for LoopController {
        fn configure_endpoint(&mut self, _config: &EndpointConfig) -> Result<(), UsbError> {
            Ok(())
        }

        fn send(&mut self, ep: u8, data: &[u8]) -> Result<(), UsbError> {
            self.inner.lock().unwrap().sent.push(data.to_vec());
            if let Some(events) = self.events.lock().unwrap().as_ref() {
                events.data_sent(ep);
            }
            Ok(())
        }

        fn recv(&mut self, ep: u8, len: usize) -> Result<(), UsbError> {
            let chunk = {
                let mut inner = self.inner.lock().unwrap();
                if inner.out_script.is_empty() {
                    None
                } else {
                    Some(inner.out_script.remove(0))
                }
            };
            if let (Some(mut chunk), Some(events)) =
                (chunk, self.events.lock().unwrap().clone())
            {
                chunk.truncate(len);
                events.data_received(ep, &chunk);
            }
            Ok(())
        }

        fn stall(&mut self, ep: u8) {
            self.inner.lock().unwrap().stalled.push(ep);
        }

        fn unstall(&mut self, ep: u8) {
            self.inner.lock().unwrap().stalled.retain(|e| *e != ep);
        }
    }

    struct TinyDisk;

    impl StorageBackend for TinyDisk {
        fn read(&mut self, _lba: u32, _n: u32, buf: &mut [u8]) -> Result<(), BackendError> {
            buf.fill(0xA5);
            Ok(())
        }

        fn write(&mut self, _lba: u32, _n: u32, _buf: &[u8]) -> Result<(), BackendError> {
            Ok(())
        }

        fn capacity(&mut self) -> Result<u32, BackendError> {
            Ok(64)
        }

        fn block_size(&mut self) -> Result<u32, BackendError> {
            Ok(512)
        }
    }

    fn cbw_frame(tag: u32, dtl: u32, flags: u8, cdb: &[u8]) -> [u8; CBW_LEN] {
        let mut f = [0u8; CBW_LEN];
        f[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        f[4..8].copy_from_slice(&tag.to_le_bytes());
        f[8..12].copy_from_slice(&dtl.to_le_bytes());
        f[12] = flags;
        f[14] = cdb.len() as u8;
        f[15..15 + cdb.len()].copy_from_slice(cdb);
        f
    }

    fn device() -> (MscDevice<LoopController, TinyDisk>, LoopController) {
        let controller = LoopController::default();
        let mut dev = MscDevice::new(
            controller.clone(),
            TinyDisk,
            MscConfig::default(),
            vec![0u8; 4096].into_boxed_slice(),
        )
        .unwrap();
        dev.initialize().unwrap();
        *controller.events.lock().unwrap() = Some(dev.events());
        dev.initialize_automaton().unwrap();
        (dev, controller)
    }

    #[test]
    fn eleventh_cbw_parks_the_transport_in_stall_recovery() {
        let (dev, controller) = device();
        let events = dev.events();
        let frame = cbw_frame(7, 0, 0x00, &[0x00; 6]); // TEST UNIT READY

        for _ in 0..10 {
            events.data_received(1, &frame);
            // rewind the one-outstanding-CBW gate to force pile-up
            dev.shared.frame.lock().state = BbbState::Ready;
        }
        assert_eq!(dev.shared.queue.lock().len(), 10);

        events.data_received(1, &frame);
        let frame_state = *dev.shared.frame.lock();
        assert_eq!(frame_state.state, BbbState::StallRecovery);
        assert!(frame_state.stall_pending);
        assert_eq!(dev.shared.queue.lock().len(), 10);

        // the next step stalls both endpoints and parks
        let mut dev = dev;
        dev.exec_automaton().unwrap();
        let stalled = controller.inner.lock().unwrap().stalled.clone();
        assert!(stalled.contains(&1) && stalled.contains(&2));
    }

    #[test]
    fn direction_mismatch_yields_phase_error_csw() {
        let (mut dev, controller) = device();
        // READ(10), one block, but the CBW claims an OUT data phase
        let cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        let frame = cbw_frame(0xBEEF, 512, 0x00, &cdb);
        dev.events().data_received(1, &frame);
        dev.exec_automaton().unwrap();

        let inner = controller.inner.lock().unwrap();
        let csw = inner.sent.last().unwrap();
        assert_eq!(csw.len(), 13);
        assert_eq!(csw[12], 0x02);
        assert_eq!(&csw[4..8], &0xBEEFu32.to_le_bytes());
        assert!(inner.stalled.contains(&1) && inner.stalled.contains(&2));
    }

    #[test]
    fn reset_flag_drops_incoming_frames() {
        let (dev, _controller) = device();
        let events = dev.events();
        events.control_request(&SetupPacket {
            request_type: 0x21,
            request: CLASS_REQUEST_MASS_STORAGE_RESET,
            value: 0,
            index: 0,
            length: 0,
        });
        events.data_received(1, &cbw_frame(1, 0, 0, &[0x00; 6]));
        assert!(dev.shared.queue_empty.load(Ordering::Acquire));
    }

    #[test]
    fn get_max_lun_answers_with_index() {
        let (dev, _controller) = device();
        let reply = dev.events().control_request(&SetupPacket {
            request_type: 0xA1,
            request: CLASS_REQUEST_GET_MAX_LUN,
            value: 0,
            index: 0,
            length: 1,
        });
        assert_eq!(reply, Some(ClassReply::MaxLun(0)));
    }
}
