//! hidapi-backed implementation of the platform capability traits
//!
//! Enumeration and raw device I/O go through `hidapi`; devices are opened
//! non-blocking so the session's poll tick never stalls. On Linux, the
//! `hotplug` feature adds a udev monitor on the `hidraw` subsystem that
//! feeds [`HotplugEvent`]s to subscribers; without it, `subscribe` returns
//! a receiver that never fires and discovery is enumeration-only.

use async_trait::async_trait;
use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::backend::{HidBackend, RawHidDevice};
use crate::error::TransportError;
use crate::protocol::RAW_REPORT_SIZE;
use crate::types::{DeviceDescriptor, DeviceId, HotplugEvent};

/// Hot-plug broadcast channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// HID backend over hidapi.
pub struct HidapiBackend {
    api: Mutex<HidApi>,
    event_tx: broadcast::Sender<HotplugEvent>,
}

impl HidapiBackend {
    /// Initialize hidapi and, where supported, start the hot-plug monitor.
    ///
    /// Must be called from within a tokio runtime when the `hotplug`
    /// feature is enabled, since the monitor runs as a spawned task.
    pub fn new() -> Result<Self, TransportError> {
        let api = HidApi::new()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        #[cfg(all(target_os = "linux", feature = "hotplug"))]
        hotplug::spawn_monitor(event_tx.clone());

        Ok(Self {
            api: Mutex::new(api),
            event_tx,
        })
    }

    fn descriptor_for(info: &hidapi::DeviceInfo) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new(info.path().to_string_lossy()),
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            usage_page: info.usage_page(),
            // hidapi does not surface the report lengths from the
            // capability descriptor; the signing device class uses
            // fixed-size transfers.
            max_input_report_len: RAW_REPORT_SIZE,
            max_output_report_len: RAW_REPORT_SIZE,
        }
    }
}

#[async_trait]
impl HidBackend for HidapiBackend {
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let mut api = self.api.lock();
        api.refresh_devices()?;
        let devices: Vec<DeviceDescriptor> =
            api.device_list().map(Self::descriptor_for).collect();
        debug!("enumerated {} HID interfaces", devices.len());
        Ok(devices)
    }

    async fn open(
        &self,
        id: &DeviceId,
    ) -> Result<(DeviceDescriptor, Box<dyn RawHidDevice>), TransportError> {
        let mut api = self.api.lock();
        api.refresh_devices()?;

        let info = api
            .device_list()
            .find(|info| DeviceId::new(info.path().to_string_lossy()) == *id)
            .ok_or_else(|| TransportError::DeviceNotFound(id.to_string()))?;
        let descriptor = Self::descriptor_for(info);

        let device = info.open_device(&api)?;
        device.set_blocking_mode(false)?;

        Ok((descriptor, Box::new(HidapiDevice { device })))
    }

    fn subscribe(&self) -> broadcast::Receiver<HotplugEvent> {
        self.event_tx.subscribe()
    }
}

/// One open hidapi handle in non-blocking mode.
struct HidapiDevice {
    device: HidDevice,
}

impl RawHidDevice for HidapiDevice {
    fn write_report(&mut self, report: &[u8]) -> Result<(), TransportError> {
        let written = self.device.write(report)?;
        if written != report.len() {
            return Err(TransportError::HidError(format!(
                "short write: {written} of {} bytes",
                report.len()
            )));
        }
        Ok(())
    }

    fn poll_read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        // hidraw omits the report-id byte for unnumbered reports; restore
        // it so callers see the same raw-transfer shape on every path.
        let n = self.device.read(&mut buf[1..])?;
        if n == 0 {
            return Ok(None);
        }
        buf[0] = crate::protocol::REPORT_ID;
        Ok(Some(n + 1))
    }
}

#[cfg(all(target_os = "linux", feature = "hotplug"))]
mod hotplug {
    use futures::StreamExt;
    use tokio::sync::broadcast;
    use tokio_udev::{AsyncMonitorSocket, EventType, MonitorBuilder};
    use tracing::{debug, warn};

    use crate::types::{DeviceId, HotplugEvent};

    /// Watch the `hidraw` subsystem and translate udev add/remove events.
    pub(super) fn spawn_monitor(tx: broadcast::Sender<HotplugEvent>) {
        tokio::spawn(async move {
            let socket = match monitor_socket() {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(error = %e, "udev hot-plug monitor unavailable");
                    return;
                }
            };

            let mut events = socket;
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(error = %e, "udev event error");
                        continue;
                    }
                };
                let Some(devnode) = event.devnode() else {
                    continue;
                };
                let id = DeviceId::new(devnode.to_string_lossy());
                let hotplug = match event.event_type() {
                    EventType::Add => HotplugEvent::DeviceArrived(id),
                    EventType::Remove => HotplugEvent::DeviceRemoved(id),
                    _ => continue,
                };
                debug!(?hotplug, "udev event");
                // No subscribers yet is fine; discovery may start later.
                let _ = tx.send(hotplug);
            }
        });
    }

    fn monitor_socket() -> std::io::Result<AsyncMonitorSocket> {
        let monitor = MonitorBuilder::new()?
            .match_subsystem("hidraw")?
            .listen()?;
        AsyncMonitorSocket::new(monitor)
    }
}
