//! Loopback USB bus: the controller side of the engine wired straight
//! to an in-process "host".
//!
//! Host-to-device bytes form a stream the engine consumes exactly as it
//! arms reception (a 31-byte CBW, then data-phase chunks); every
//! device-to-host submission completes synchronously and is appended to
//! an ordered log the host drains.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use usbd_msc::{EndpointConfig, MscEvents, UsbController, UsbError};

#[derive(Default)]
struct BusInner {
    events: Option<MscEvents>,
    /// Pending host-to-device bytes.
    out_stream: VecDeque<u8>,
    /// Reception the engine armed while the stream was dry.
    armed: Option<(u8, usize)>,
    /// Completed device-to-host transfers, oldest first.
    in_log: VecDeque<Vec<u8>>,
    stalled: Vec<u8>,
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

    /// Host writes bytes toward the device; satisfies an armed
    /// reception immediately if one is pending.
    pub fn host_write(&self, data: &[u8]) {
        let delivery = {
            let mut inner = self.inner.lock().unwrap();
            inner.out_stream.extend(data.iter().copied());
            inner.take_armed_delivery()
        };
        if let Some((events, ep, chunk)) = delivery {
            events.data_received(ep, &chunk);
        }
    }

    /// Host reads the oldest completed device-to-host transfer.
    pub fn host_read(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().in_log.pop_front()
    }

    pub fn events(&self) -> MscEvents {
        self.inner
            .lock()
            .unwrap()
            .events
            .clone()
            .expect("bus not attached")
    }
}

impl BusInner {
    /// If a reception is armed and bytes are available, cut the next
    /// chunk for delivery.
    fn take_armed_delivery(&mut self) -> Option<(MscEvents, u8, Vec<u8>)> {
        let (ep, len) = self.armed?;
        if self.out_stream.is_empty() {
            return None;
        }
        self.armed = None;
        let n = len.min(self.out_stream.len());
        let chunk: Vec<u8> = self.out_stream.drain(..n).collect();
        self.events.clone().map(|ev| (ev, ep, chunk))
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
        let delivery = {
            let mut inner = self.inner.lock().unwrap();
            inner.armed = Some((ep, len));
            inner.take_armed_delivery()
        };
        if let Some((events, ep, chunk)) = delivery {
            events.data_received(ep, &chunk);
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
