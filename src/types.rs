//! Common types for the transport layer

use std::fmt;
use std::time::Duration;

/// Opaque identifier for a connected device.
///
/// Wraps the platform device path, case-normalized so that hot-plug
/// notifications and enumeration results compare equal regardless of how
/// the platform capitalizes the path. Stable for the lifetime of one
/// connection; a re-plugged device may come back under a different id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create an id from a raw platform path, normalizing case.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().to_ascii_lowercase())
    }

    /// The normalized path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device identification information, read from the HID capability
/// descriptor when the device is opened. Immutable once a session exists.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Normalized device identifier
    pub id: DeviceId,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// HID usage page of this logical interface
    pub usage_page: u16,
    /// Maximum input report length, including the report-id byte
    pub max_input_report_len: usize,
    /// Maximum output report length, including the report-id byte
    pub max_output_report_len: usize,
}

/// Hot-plug events consumed by the discovery agent
#[derive(Debug, Clone)]
pub enum HotplugEvent {
    /// A device interface appeared
    DeviceArrived(DeviceId),
    /// A device interface went away
    DeviceRemoved(DeviceId),
}

/// Identity filter applied before a device is probed.
///
/// The vendor id check is primary; the usage page check keeps us off the
/// unrelated logical interfaces a composite device exposes alongside the
/// vendor-specific one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Accept only this vendor id
    pub vendor_id: u16,
    /// Accept only this usage page
    pub usage_page: u16,
}

impl DeviceFilter {
    /// Check a descriptor against the filter.
    pub fn accepts(&self, desc: &DeviceDescriptor) -> bool {
        desc.vendor_id == self.vendor_id && desc.usage_page == self.usage_page
    }
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            vendor_id: crate::protocol::device::VENDOR_ID,
            usage_page: crate::protocol::device::USAGE_PAGE,
        }
    }
}

/// Per-session tuning knobs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between read-poll ticks
    pub poll_interval: Duration,
    /// Deadline for the in-flight command to reach a terminal outcome.
    /// `None` disables the timeout.
    pub exchange_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            exchange_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Discovery agent configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Identity filter for the hardware signing device class
    pub filter: DeviceFilter,
    /// Firmware identity prefixes that cause rejection after the probe
    /// (bootloader / alternate-firmware modes, product-specific)
    pub excluded_identities: Vec<String>,
    /// Settle delay between opening a device and the first probe send,
    /// so the OS can finish enumerating the interface
    pub probe_delay: Duration,
    /// Session tuning applied to every created session
    pub session: SessionConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            filter: DeviceFilter::default(),
            excluded_identities: vec!["OLOS".to_string()],
            probe_delay: Duration::from_millis(200),
            session: SessionConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Check whether a reported firmware identity is excluded.
    pub fn is_excluded_identity(&self, name: &str) -> bool {
        self.excluded_identities
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_normalizes_case() {
        let a = DeviceId::new("\\\\?\\HID#VID_2C97&PID_0001#7&abc");
        let b = DeviceId::new("\\\\?\\hid#vid_2c97&pid_0001#7&abc");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "\\\\?\\hid#vid_2c97&pid_0001#7&abc");
    }

    #[test]
    fn test_default_filter_matches_signing_device() {
        let filter = DeviceFilter::default();
        let desc = DeviceDescriptor {
            id: DeviceId::new("/dev/hidraw3"),
            vendor_id: 0x2C97,
            product_id: 0x0001,
            usage_page: 0xFFA0,
            max_input_report_len: 65,
            max_output_report_len: 65,
        };
        assert!(filter.accepts(&desc));

        let wrong_vendor = DeviceDescriptor {
            vendor_id: 0x1234,
            ..desc.clone()
        };
        assert!(!filter.accepts(&wrong_vendor));

        let wrong_usage = DeviceDescriptor {
            usage_page: 0x0001,
            ..desc
        };
        assert!(!filter.accepts(&wrong_usage));
    }

    #[test]
    fn test_excluded_identity_prefix_match() {
        let config = DiscoveryConfig::default();
        assert!(config.is_excluded_identity("OLOS"));
        assert!(config.is_excluded_identity("OLOS 1.2"));
        assert!(!config.is_excluded_identity("Bitcoin"));
        assert!(!config.is_excluded_identity("olos"));
    }
}
