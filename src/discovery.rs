//! Device discovery and hot-plug tracking
//!
//! The agent owns the device lifecycle: it enumerates qualifying devices at
//! startup, consumes hot-plug notifications from the backend, applies the
//! identity filter, probes each accepted device with the identification
//! handshake and publishes the survivors into the [`DeviceRegistry`].
//!
//! Per-device state machine:
//!
//! ```text
//! Unseen ──open + filter──▶ Probing ──identity ok──▶ Accepted (published)
//!                              │                         │
//!                              └──excluded/error──▶ Rejected (torn down)
//!                                                        │
//!                                            remove ──▶ Removed
//! ```
//!
//! The registry is mutated only here; every other party is a reader.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::backend::HidBackend;
use crate::command::{AppIdentity, GetAppName};
use crate::error::TransportError;
use crate::registry::DeviceRegistry;
use crate::session::DeviceSession;
use crate::types::{DeviceId, DiscoveryConfig, HotplugEvent};

/// Outcome of one identification probe, reported back to the agent loop.
///
/// Carries the probed session handle, not just the id: a device can be
/// removed and re-attached under the same identifier while its probe is
/// still pending, and a stale report must never act on the successor.
struct ProbeReport {
    id: DeviceId,
    session: DeviceSession,
    identity: Result<AppIdentity, TransportError>,
}

/// Discovers signing devices and keeps the registry current.
pub struct DiscoveryAgent {
    backend: Arc<dyn HidBackend>,
    registry: Arc<DeviceRegistry>,
    config: DiscoveryConfig,
}

impl DiscoveryAgent {
    pub fn new(
        backend: Arc<dyn HidBackend>,
        registry: Arc<DeviceRegistry>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            config,
        }
    }

    /// Run the agent: startup enumeration, then the hot-plug event loop.
    ///
    /// Returns when the backend's event channel closes. Intended to be
    /// spawned once per process next to the registry it maintains.
    pub async fn run(self) -> Result<(), TransportError> {
        let mut events = self.backend.subscribe();
        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();

        // Sessions in `Probing` or `Accepted`; the registry only ever holds
        // the accepted subset.
        let mut live: HashMap<DeviceId, DeviceSession> = HashMap::new();

        for descriptor in self.backend.enumerate().await? {
            // Cheap descriptor-level pre-filter; the authoritative check
            // against the opened handle's descriptor happens in try_probe.
            if !self.config.filter.accepts(&descriptor) {
                continue;
            }
            self.try_probe(descriptor.id, &mut live, &probe_tx).await;
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(HotplugEvent::DeviceArrived(id)) => {
                        debug!(device = %id, "device arrived");
                        self.try_probe(id, &mut live, &probe_tx).await;
                    }
                    Ok(HotplugEvent::DeviceRemoved(id)) => {
                        self.on_removed(&id, &mut live);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "hot-plug receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(report) = probe_rx.recv() => {
                    self.on_probed(report, &mut live);
                }
            }
        }

        info!("discovery agent stopped");
        Ok(())
    }

    /// Unseen → Probing: open the handle, check the identity filter, start
    /// a session and schedule the identification handshake.
    async fn try_probe(
        &self,
        id: DeviceId,
        live: &mut HashMap<DeviceId, DeviceSession>,
        probe_tx: &mpsc::UnboundedSender<ProbeReport>,
    ) {
        if live.contains_key(&id) {
            return;
        }

        let (descriptor, device) = match self.backend.open(&id).await {
            Ok(opened) => opened,
            // Expected during enumeration races: the node is already gone,
            // or it belongs to someone else entirely.
            Err(TransportError::DeviceNotFound(_)) => return,
            Err(e) => {
                warn!(device = %id, error = %e, "failed to open device");
                return;
            }
        };

        if !self.config.filter.accepts(&descriptor) {
            debug!(
                device = %id,
                vendor = format_args!("{:04X}", descriptor.vendor_id),
                usage_page = format_args!("{:04X}", descriptor.usage_page),
                "filtered out"
            );
            return;
        }

        info!(
            device = %id,
            vendor = format_args!("{:04X}", descriptor.vendor_id),
            product = format_args!("{:04X}", descriptor.product_id),
            "probing device"
        );

        let session = DeviceSession::spawn(descriptor, device, self.config.session.clone());
        live.insert(id.clone(), session.clone());

        let probe_delay = self.config.probe_delay;
        let probe_tx = probe_tx.clone();
        tokio::spawn(async move {
            // Give the OS a moment to finish enumerating the interface.
            tokio::time::sleep(probe_delay).await;

            let (command, rx) = GetAppName::new();
            let identity = match session.submit(Box::new(command)) {
                Ok(()) => match rx.await {
                    Ok(Ok(response)) => GetAppName::parse_identity(&response),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(TransportError::Disconnected),
                },
                Err(e) => Err(e),
            };
            let _ = probe_tx.send(ProbeReport {
                id,
                session,
                identity,
            });
        });
    }

    /// Probing → Accepted | Rejected.
    fn on_probed(&self, report: ProbeReport, live: &mut HashMap<DeviceId, DeviceSession>) {
        let ProbeReport {
            id,
            session: probed,
            identity,
        } = report;

        // Removed while the probe was still running; already torn down.
        let Some(session) = live.get(&id) else {
            debug!(device = %id, "probe finished after removal");
            return;
        };

        // The id is live but belongs to a newer connection; this report is
        // from a session that has already been torn down.
        if !session.same_worker(&probed) {
            debug!(device = %id, "stale probe report ignored");
            return;
        }

        match identity {
            Ok(identity) if self.config.is_excluded_identity(&identity.name) => {
                info!(device = %id, firmware = %identity.name, "rejected firmware identity");
                session.shutdown();
                live.remove(&id);
            }
            Ok(identity) => {
                info!(device = %id, firmware = %identity.name, "device accepted");
                self.registry.insert(id, session.clone());
            }
            Err(e) => {
                warn!(device = %id, error = %e, "identification failed");
                session.shutdown();
                live.remove(&id);
            }
        }
    }

    /// Accepted | Probing → Removed. Unknown identifiers are ignored.
    fn on_removed(&self, id: &DeviceId, live: &mut HashMap<DeviceId, DeviceSession>) {
        let Some(session) = live.remove(id) else {
            debug!(device = %id, "removal for unknown device ignored");
            return;
        };
        info!(device = %id, "device removed");
        session.shutdown();
        self.registry.remove(id);
    }
}
