//! Device-side USB Mass Storage Class stack, Bulk-Only Transport.
//!
//! This crate implements the target half of USB MSC: it accepts Command
//! Block Wrappers from a host over a bulk endpoint pair, executes the
//! SCSI command they carry against a block storage backend, streams the
//! data phase in either direction, and answers with a Command Status
//! Wrapper, honoring the SCSI state machine and the bulk-only
//! resynchronization rules (stall plus Mass Storage Reset).
//!
//! The stack is controller-agnostic: the USB device controller is
//! reached through the [`UsbController`] trait and reports completions
//! back through the [`MscEvents`] handle (safe to call from interrupt
//! context). Storage is reached through [`StorageBackend`].
//!
//! # Design
//!
//! - A single command is outstanding at a time: CBW, optional data
//!   phase, CSW, in that order; the next CBW is armed only after the
//!   CSW left the device.
//! - Commands are parsed on the completion path and pushed into a
//!   bounded queue; [`MscDevice::exec_automaton`] is the cooperative
//!   main-loop step that drains it.
//! - Errors are reported the SCSI way: sense data plus a failed CSW, or
//!   a stall and reset recovery for transport-level breakage. Nothing
//!   propagates out of the engine except controller failures.
//!
//! # Example
//!
//! ```no_run
//! use usbd_msc::{MscConfig, MscDevice};
//! # struct MyController;
//! # impl usbd_msc::UsbController for MyController {
//! #     fn configure_endpoint(&mut self, _: &usbd_msc::EndpointConfig) -> Result<(), usbd_msc::UsbError> { Ok(()) }
//! #     fn send(&mut self, _: u8, _: &[u8]) -> Result<(), usbd_msc::UsbError> { Ok(()) }
//! #     fn recv(&mut self, _: u8, _: usize) -> Result<(), usbd_msc::UsbError> { Ok(()) }
//! #     fn stall(&mut self, _: u8) {}
//! #     fn unstall(&mut self, _: u8) {}
//! # }
//! # struct MyDisk;
//! # impl usbd_msc::StorageBackend for MyDisk {
//! #     fn read(&mut self, _: u32, _: u32, _: &mut [u8]) -> Result<(), usbd_msc::BackendError> { Ok(()) }
//! #     fn write(&mut self, _: u32, _: u32, _: &[u8]) -> Result<(), usbd_msc::BackendError> { Ok(()) }
//! #     fn capacity(&mut self) -> Result<u32, usbd_msc::BackendError> { Ok(1024) }
//! #     fn block_size(&mut self) -> Result<u32, usbd_msc::BackendError> { Ok(512) }
//! # }
//!
//! fn main() -> Result<(), usbd_msc::MscError> {
//!     let buffer = vec![0u8; 16384].into_boxed_slice();
//!     let mut device = MscDevice::new(MyController, MyDisk, MscConfig::default(), buffer)?;
//!     device.initialize()?;
//!     let events = device.events(); // wire into the controller ISR
//!     # let _ = events;
//!     device.initialize_automaton()?;
//!     loop {
//!         device.exec_automaton()?;
//!     }
//! }
//! ```

pub mod backend;
pub mod bbb;
pub mod config;
pub mod controller;
pub mod engine;
pub mod queue;
pub mod scsi;

pub use backend::{BackendError, StorageBackend};
pub use bbb::wire::{Cbw, CbwError, Csw, CswStatus, DataDirection};
pub use bbb::{ClassReply, SetupPacket};
pub use config::{ConfigError, MscConfig};
pub use controller::{EndpointConfig, EndpointDirection, EndpointType, UsbController, UsbError};
pub use engine::{MscDevice, MscError, MscEvents};
pub use scsi::sense::{SenseData, SenseKey};
