//! USB HID transport for hardware signing devices
//!
//! This crate is the device-facing plumbing a wallet application sits on
//! top of: it finds hardware signing devices over USB HID, tracks them
//! across hot-plug events, and runs the fixed-size report framing protocol
//! that carries command payloads to and from the device.
//!
//! The moving parts, leaves first:
//!
//! - [`protocol`] — pure framing: payload ⇄ 64-byte reports
//! - [`command`] — a unit of work: one outgoing payload, fragments in,
//!   one terminal outcome
//! - [`session`] — one open device: FIFO exchange queue, non-blocking
//!   read polling, busy signal
//! - [`discovery`] — enumeration, hot-plug, identity filtering and the
//!   identification handshake
//! - [`registry`] — id → live session map, mutated only by discovery
//!
//! Typical wiring:
//!
//! ```no_run
//! use std::sync::Arc;
//! use hwkey_transport::{DeviceRegistry, DiscoveryAgent, DiscoveryConfig, HidapiBackend};
//!
//! # async fn wire() -> Result<(), hwkey_transport::TransportError> {
//! let registry = Arc::new(DeviceRegistry::new());
//! let backend = Arc::new(HidapiBackend::new()?);
//! let agent = DiscoveryAgent::new(backend, registry.clone(), DiscoveryConfig::default());
//! tokio::spawn(agent.run());
//!
//! // Later, from anywhere that can see the registry:
//! for session in registry.sessions() {
//!     let response = session.exchange(vec![0xB0, 0x01, 0x00, 0x00, 0x00]).await?;
//!     println!("{} answered {} bytes", session.descriptor().id, response.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod command;
pub mod discovery;
pub mod error;
pub mod hid;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod types;

pub use backend::{HidBackend, RawHidDevice};
pub use command::{ApduExchange, AppIdentity, Command, GetAppName, Outcome, Progress};
pub use discovery::DiscoveryAgent;
pub use error::TransportError;
pub use hid::HidapiBackend;
pub use registry::DeviceRegistry;
pub use session::DeviceSession;
pub use types::{
    DeviceDescriptor, DeviceFilter, DeviceId, DiscoveryConfig, HotplugEvent, SessionConfig,
};
