//! Scripted in-memory HID backend for exercising the transport stack
//! without hardware.
//!
//! `MockDevice` understands just enough of the framing protocol to know
//! when a complete command payload has been written; at that point it
//! queues the next scripted response for the session's read polls. Tests
//! can also push raw reports into `inbound` directly (for unsolicited or
//! deliberately delayed responses) and inspect every written report.

// Each integration test binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use hwkey_transport::backend::{HidBackend, RawHidDevice};
use hwkey_transport::command::SW_OK;
use hwkey_transport::protocol::{self, REPORT_ID};
use hwkey_transport::{DeviceDescriptor, DeviceId, HotplugEvent, TransportError};

/// Let spawned workers run and paused time advance past a few poll ticks.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[derive(Default)]
pub struct MockDeviceState {
    /// Every raw report written to the device, report-id byte included.
    pub written: Vec<Vec<u8>>,
    /// Raw reports to hand out on read polls, report-id byte included.
    pub inbound: VecDeque<Vec<u8>>,
    /// Framed responses released in order, one per completed command
    /// payload written to the device.
    pub scripted: VecDeque<Vec<Vec<u8>>>,
    /// Reports still expected for the command payload being written.
    outstanding: usize,
}

pub type SharedDeviceState = Arc<Mutex<MockDeviceState>>;

pub struct MockDevice {
    state: SharedDeviceState,
}

impl MockDevice {
    pub fn create() -> (SharedDeviceState, MockDevice) {
        let state = Arc::new(Mutex::new(MockDeviceState::default()));
        let device = MockDevice {
            state: state.clone(),
        };
        (state, device)
    }
}

impl RawHidDevice for MockDevice {
    fn write_report(&mut self, report: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.written.push(report.to_vec());

        // Track framing to spot the last report of a command payload.
        let frame = &report[1..];
        let sequence = u16::from_be_bytes([frame[3], frame[4]]);
        if sequence == 0 {
            let total = u16::from_be_bytes([frame[5], frame[6]]) as usize;
            state.outstanding = protocol::report_count(total);
        }
        if state.outstanding > 0 {
            state.outstanding -= 1;
            if state.outstanding == 0 {
                if let Some(response) = state.scripted.pop_front() {
                    state.inbound.extend(response);
                }
            }
        }
        Ok(())
    }

    fn poll_read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        let mut state = self.state.lock().unwrap();
        match state.inbound.pop_front() {
            Some(report) => {
                buf[..report.len()].copy_from_slice(&report);
                Ok(Some(report.len()))
            }
            None => Ok(None),
        }
    }
}

/// Frame a response payload into raw reports ready for `inbound`.
pub fn frame_response(payload: &[u8]) -> Vec<Vec<u8>> {
    protocol::encode_payload(payload)
        .unwrap()
        .into_iter()
        .map(|report| {
            let mut raw = vec![REPORT_ID];
            raw.extend_from_slice(&report);
            raw
        })
        .collect()
}

/// An identification response payload naming a firmware identity.
pub fn identity_response(name: &str) -> Vec<u8> {
    let mut payload = vec![0x01, name.len() as u8];
    payload.extend_from_slice(name.as_bytes());
    payload.extend_from_slice(&SW_OK.to_be_bytes());
    payload
}

pub fn descriptor(id: &str, vendor_id: u16, usage_page: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        id: DeviceId::new(id),
        vendor_id,
        product_id: 0x0001,
        usage_page,
        max_input_report_len: protocol::RAW_REPORT_SIZE,
        max_output_report_len: protocol::RAW_REPORT_SIZE,
    }
}

/// A descriptor matching the default signing-device filter.
pub fn signer_descriptor(id: &str) -> DeviceDescriptor {
    descriptor(id, 0x2C97, 0xFFA0)
}

struct MockEntry {
    descriptor: DeviceDescriptor,
    state: SharedDeviceState,
}

/// Backend over a set of scripted mock devices.
pub struct MockBackend {
    devices: Mutex<HashMap<DeviceId, MockEntry>>,
    event_tx: broadcast::Sender<HotplugEvent>,
    opened: Mutex<Vec<DeviceId>>,
}

impl MockBackend {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(16);
        Self {
            devices: Mutex::new(HashMap::new()),
            event_tx,
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Attach a device (without announcing it) and return its state.
    pub fn add_device(&self, desc: DeviceDescriptor) -> SharedDeviceState {
        let state = Arc::new(Mutex::new(MockDeviceState::default()));
        self.devices.lock().unwrap().insert(
            desc.id.clone(),
            MockEntry {
                descriptor: desc,
                state: state.clone(),
            },
        );
        state
    }

    pub fn arrive(&self, id: &str) {
        let _ = self
            .event_tx
            .send(HotplugEvent::DeviceArrived(DeviceId::new(id)));
    }

    pub fn remove(&self, id: &str) {
        let _ = self
            .event_tx
            .send(HotplugEvent::DeviceRemoved(DeviceId::new(id)));
    }

    /// How often a given device has been opened.
    pub fn open_count(&self, id: &str) -> usize {
        let id = DeviceId::new(id);
        self.opened.lock().unwrap().iter().filter(|o| **o == id).count()
    }
}

#[async_trait]
impl HidBackend for MockBackend {
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect())
    }

    async fn open(
        &self,
        id: &DeviceId,
    ) -> Result<(DeviceDescriptor, Box<dyn RawHidDevice>), TransportError> {
        let devices = self.devices.lock().unwrap();
        let entry = devices
            .get(id)
            .ok_or_else(|| TransportError::DeviceNotFound(id.to_string()))?;
        self.opened.lock().unwrap().push(id.clone());
        let device = MockDevice {
            state: entry.state.clone(),
        };
        Ok((entry.descriptor.clone(), Box::new(device)))
    }

    fn subscribe(&self) -> broadcast::Receiver<HotplugEvent> {
        self.event_tx.subscribe()
    }
}
