//! Platform capability traits
//!
//! The codec/queue/discovery logic is platform-independent; everything it
//! needs from the operating system is behind these two seams. [`HidBackend`]
//! covers enumeration, opening and hot-plug notification; [`RawHidDevice`]
//! is one open handle with non-blocking, poll-for-completion reads.
//!
//! The production implementation lives in [`crate::hid`]; tests substitute
//! scripted fakes.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::types::{DeviceDescriptor, DeviceId, HotplugEvent};

/// One open device handle.
///
/// Both methods are called only from the owning session's task, never
/// concurrently.
pub trait RawHidDevice: Send {
    /// Write one raw report, leading report-id byte included.
    fn write_report(&mut self, report: &[u8]) -> Result<(), TransportError>;

    /// Poll for a completed read without blocking.
    ///
    /// `Ok(Some(n))` fills `buf[..n]` with one raw transfer, leading
    /// report-id byte first. `Ok(None)` means no data has arrived yet; the
    /// session retries on its next tick. Errors are likewise retried, so a
    /// transient read failure never kills the session.
    fn poll_read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError>;
}

/// Device enumeration and hot-plug notification.
#[async_trait]
pub trait HidBackend: Send + Sync {
    /// List the HID interfaces currently attached.
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Open a device by identifier, returning its capability descriptor
    /// and a raw handle.
    async fn open(
        &self,
        id: &DeviceId,
    ) -> Result<(DeviceDescriptor, Box<dyn RawHidDevice>), TransportError>;

    /// Subscribe to hot-plug add/remove notifications.
    fn subscribe(&self) -> broadcast::Receiver<HotplugEvent>;
}
