//! Per-device session: command queue, read scheduling, busy signal
//!
//! A [`DeviceSession`] is the handle the rest of the application holds; the
//! state itself lives in a dedicated worker task so that all queue
//! mutation, codec work and I/O polling for one device happen on a single
//! serialized execution context. Submission never blocks: the outcome of a
//! command is delivered asynchronously through [`Command::resolve`].
//!
//! Queue contract: strict FIFO, exactly one command in flight at a time.
//! A command's payload is written when it reaches the queue head; its
//! response fragments are fed to [`Command::consume`] until a terminal
//! outcome, after which the next command (if any) is sent immediately.

use std::collections::VecDeque;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::RawHidDevice;
use crate::command::{ApduExchange, Command, Outcome, Progress};
use crate::error::TransportError;
use crate::protocol::{self, RAW_REPORT_SIZE, REPORT_ID};
use crate::types::{DeviceDescriptor, SessionConfig};

enum SessionMsg {
    Submit(Box<dyn Command>),
    Shutdown,
}

/// Handle to a live device session.
///
/// Cheap to clone; all clones talk to the same worker task. Sessions are
/// normally created by the discovery agent and looked up through the
/// [`DeviceRegistry`](crate::registry::DeviceRegistry).
#[derive(Clone)]
pub struct DeviceSession {
    descriptor: DeviceDescriptor,
    tx: mpsc::UnboundedSender<SessionMsg>,
    busy_rx: watch::Receiver<bool>,
}

impl DeviceSession {
    /// Spawn a session worker for an open device handle.
    pub fn spawn(
        descriptor: DeviceDescriptor,
        device: Box<dyn RawHidDevice>,
        config: SessionConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (busy_tx, busy_rx) = watch::channel(false);

        let worker = SessionWorker {
            descriptor: descriptor.clone(),
            device,
            config,
            queue: VecDeque::new(),
            busy_tx,
            in_flight_since: None,
        };
        tokio::spawn(worker.run(rx));

        Self {
            descriptor,
            tx,
            busy_rx,
        }
    }

    /// The immutable descriptor this session was created with.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Append a command to the exchange queue.
    ///
    /// Returns immediately; the command's outcome arrives through its own
    /// `resolve`. If the session has already shut down the command is
    /// resolved with [`TransportError::Disconnected`] before this returns.
    pub fn submit(&self, command: Box<dyn Command>) -> Result<(), TransportError> {
        match self.tx.send(SessionMsg::Submit(command)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(SessionMsg::Submit(mut command))) => {
                command.resolve(Err(TransportError::Disconnected));
                Err(TransportError::Disconnected)
            }
            Err(_) => Err(TransportError::Disconnected),
        }
    }

    /// Run one request/response exchange and wait for the response payload.
    pub async fn exchange(&self, payload: Vec<u8>) -> Outcome {
        let (command, rx) = ApduExchange::new(payload);
        self.submit(Box::new(command))?;
        match rx.await {
            Ok(outcome) => outcome,
            // Worker dropped the command without resolving it; treated as
            // an unreachable state, reported as a failure (never a panic).
            Err(_) => Err(TransportError::Internal(
                "exchange dropped without an outcome".into(),
            )),
        }
    }

    /// Whether a command is currently queued or in flight.
    pub fn is_busy(&self) -> bool {
        *self.busy_rx.borrow()
    }

    /// Watch busy-state transitions. The value changes exactly once per
    /// queue empty/non-empty edge, never per individual command.
    pub fn subscribe_busy(&self) -> watch::Receiver<bool> {
        self.busy_rx.clone()
    }

    /// Tear the session down, failing every queued command with
    /// [`TransportError::Disconnected`]. Called by the discovery agent on
    /// device removal or identification rejection.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(SessionMsg::Shutdown);
    }

    /// Whether two handles talk to the same worker task. Distinguishes a
    /// session from its successor when a device re-attaches under the
    /// same identifier.
    pub(crate) fn same_worker(&self, other: &DeviceSession) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

struct SessionWorker {
    descriptor: DeviceDescriptor,
    device: Box<dyn RawHidDevice>,
    config: SessionConfig,
    queue: VecDeque<Box<dyn Command>>,
    busy_tx: watch::Sender<bool>,
    /// When the head command's payload went out; `None` while idle.
    in_flight_since: Option<Instant>,
}

impl SessionWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMsg>) {
        debug!(device = %self.descriptor.id, "session worker started");

        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(SessionMsg::Submit(command)) => self.submit(command),
                    Some(SessionMsg::Shutdown) | None => break,
                },
                _ = tick.tick() => {
                    self.poll_device();
                    self.check_timeout();
                }
            }
        }

        self.teardown(&mut rx);
        debug!(device = %self.descriptor.id, "session worker stopped");
    }

    /// Enqueue, and if the queue was idle, send right away.
    fn submit(&mut self, command: Box<dyn Command>) {
        let was_idle = self.queue.is_empty();
        self.queue.push_back(command);
        if was_idle {
            self.busy_tx.send_replace(true);
            self.send_head();
        }
    }

    /// Encode and write the head command's payload. A failure at this
    /// stage resolves the head and advances the queue, same as a parse
    /// failure — the queue never stalls on a bad command.
    fn send_head(&mut self) {
        loop {
            let Some(head) = self.queue.front() else {
                self.in_flight_since = None;
                self.busy_tx.send_replace(false);
                return;
            };
            match self.write_payload(head.payload()) {
                Ok(()) => {
                    self.in_flight_since = Some(Instant::now());
                    return;
                }
                Err(e) => {
                    warn!(device = %self.descriptor.id, error = %e, "payload write failed");
                    if let Some(mut failed) = self.queue.pop_front() {
                        failed.resolve(Err(e));
                    }
                }
            }
        }
    }

    fn write_payload(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        debug!(
            device = %self.descriptor.id,
            len = payload.len(),
            "sending payload"
        );
        for report in protocol::encode_payload(&payload)? {
            let mut raw = Vec::with_capacity(RAW_REPORT_SIZE);
            raw.push(REPORT_ID);
            raw.extend_from_slice(&report);
            self.device.write_report(&raw)?;
        }
        Ok(())
    }

    /// One non-blocking poll per tick. Nothing here blocks; "waiting for a
    /// response" is the head command sitting in the queue, not a parked
    /// call stack.
    fn poll_device(&mut self) {
        let mut buf = vec![0u8; self.descriptor.max_input_report_len.max(RAW_REPORT_SIZE)];
        match self.device.poll_read(&mut buf) {
            Ok(Some(n)) if n > 1 => {
                // Strip the transport's leading report-id byte.
                let fragment = buf[1..n].to_vec();
                self.on_report(&fragment);
            }
            Ok(_) => {}
            Err(e) => {
                // Read-issue failure: dropped here, retried next tick.
                debug!(device = %self.descriptor.id, error = %e, "read poll failed");
            }
        }
    }

    /// Feed an input report fragment to the in-flight command.
    fn on_report(&mut self, fragment: &[u8]) {
        let Some(head) = self.queue.front_mut() else {
            warn!(
                device = %self.descriptor.id,
                len = fragment.len(),
                "unsolicited report dropped"
            );
            return;
        };

        match head.consume(fragment) {
            Progress::NeedMore => {}
            Progress::Done(outcome) => {
                if let Err(e) = &outcome {
                    info!(device = %self.descriptor.id, error = %e, "command failed");
                }
                self.advance(outcome);
            }
        }
    }

    /// Resolve the head with `outcome`, dequeue it, and send the next
    /// command or signal the busy→idle edge.
    fn advance(&mut self, outcome: Outcome) {
        match self.queue.pop_front() {
            Some(mut head) => head.resolve(outcome),
            // Queue head missing during a completion callback is an
            // unreachable state per the queue contract; recover locally.
            None => {
                warn!(device = %self.descriptor.id, "completion with empty queue");
                return;
            }
        }
        self.in_flight_since = None;
        if self.queue.is_empty() {
            self.busy_tx.send_replace(false);
        } else {
            self.send_head();
        }
    }

    /// Fail only the in-flight command when its deadline passes, then
    /// advance exactly as on a parse failure.
    fn check_timeout(&mut self) {
        let Some(timeout) = self.config.exchange_timeout else {
            return;
        };
        let Some(since) = self.in_flight_since else {
            return;
        };
        if since.elapsed() >= timeout {
            warn!(device = %self.descriptor.id, "in-flight command timed out");
            self.advance(Err(TransportError::Timeout));
        }
    }

    /// Device removal (or rejection): every queued command, including the
    /// in-flight one, resolves with a disconnect failure.
    ///
    /// Submissions can still land in the channel between the shutdown
    /// message and this point; `resolve` must reach those too, so the
    /// channel is closed and drained before the queue is failed.
    fn teardown(&mut self, rx: &mut mpsc::UnboundedReceiver<SessionMsg>) {
        rx.close();
        while let Ok(msg) = rx.try_recv() {
            if let SessionMsg::Submit(command) = msg {
                self.queue.push_back(command);
            }
        }

        let had_commands = !self.queue.is_empty();
        for mut command in self.queue.drain(..) {
            command.resolve(Err(TransportError::Disconnected));
        }
        self.in_flight_since = None;
        if had_commands {
            self.busy_tx.send_replace(false);
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("descriptor", &self.descriptor)
            .field("busy", &self.is_busy())
            .finish()
    }
}
