//! Command abstraction for the per-device exchange queue
//!
//! A [`Command`] produces one outgoing payload and then consumes inbound
//! report fragments until it reaches a terminal outcome. The session owns
//! the command while it is queued and hands back the outcome through
//! [`Command::resolve`] exactly once — either the value `consume` produced,
//! or a transport failure (disconnect, timeout) injected by the session.

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::TransportError;
use crate::protocol::ReportAssembler;

/// Result of feeding one report fragment to a command.
#[derive(Debug)]
pub enum Progress {
    /// The exchange is incomplete; more fragments are expected.
    NeedMore,
    /// Terminal outcome: the reassembled response payload, or why the
    /// response could not be parsed. A parse failure does not stall the
    /// queue — the session resolves the command and moves on.
    Done(Result<Vec<u8>, TransportError>),
}

/// Unit of work executed by a device session.
///
/// Implementations must keep `payload` deterministic and side-effect-free;
/// it is produced once, immediately before the first transmission, and is
/// never re-sent on parse failure.
pub trait Command: Send {
    /// The outgoing payload for this exchange.
    fn payload(&self) -> Vec<u8>;

    /// Consume one inbound report fragment (report-id byte already
    /// stripped, so exactly one report's worth of bytes).
    fn consume(&mut self, fragment: &[u8]) -> Progress;

    /// Deliver the terminal outcome to the command's owner. Called exactly
    /// once per command, after `consume` returns [`Progress::Done`] or when
    /// the session fails the command itself.
    fn resolve(&mut self, outcome: Result<Vec<u8>, TransportError>);
}

/// The response payload delivered on success, or the failure reason.
pub type Outcome = Result<Vec<u8>, TransportError>;

/// Generic request/response exchange: sends a payload, reassembles the
/// fragmented response, and delivers it through a oneshot channel.
///
/// This is the command type behind
/// [`DeviceSession::exchange`](crate::session::DeviceSession::exchange).
pub struct ApduExchange {
    payload: Vec<u8>,
    assembler: ReportAssembler,
    reply: Option<oneshot::Sender<Outcome>>,
}

impl ApduExchange {
    /// Create an exchange command and the receiver its outcome arrives on.
    pub fn new(payload: Vec<u8>) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                payload,
                assembler: ReportAssembler::new(),
                reply: Some(tx),
            },
            rx,
        )
    }
}

impl Command for ApduExchange {
    fn payload(&self) -> Vec<u8> {
        self.payload.clone()
    }

    fn consume(&mut self, fragment: &[u8]) -> Progress {
        match self.assembler.push(fragment) {
            Ok(Some(response)) => Progress::Done(Ok(response)),
            Ok(None) => Progress::NeedMore,
            Err(e) => Progress::Done(Err(e)),
        }
    }

    fn resolve(&mut self, outcome: Outcome) {
        if let Some(tx) = self.reply.take() {
            // The owner may have dropped the receiver; that is their choice.
            let _ = tx.send(outcome);
        } else {
            debug!("exchange resolved twice, dropping outcome");
        }
    }
}

/// Trailing status word indicating success.
pub const SW_OK: u16 = 0x9000;

/// One-shot identification handshake: asks the device which firmware app
/// is running. Used by the discovery agent to confirm a freshly attached
/// device is a qualifying signing device before publication.
pub struct GetAppName {
    inner: ApduExchange,
}

/// Parsed identification response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    /// Firmware identity string reported by the device
    pub name: String,
}

impl GetAppName {
    /// Instruction: CLA 0xB0, INS 0x01 (get app name and version).
    pub const APDU: [u8; 5] = [0xB0, 0x01, 0x00, 0x00, 0x00];

    pub fn new() -> (Self, oneshot::Receiver<Outcome>) {
        let (inner, rx) = ApduExchange::new(Self::APDU.to_vec());
        (Self { inner }, rx)
    }

    /// Parse the reassembled response payload.
    ///
    /// Layout: `[format] [name_len] [name…] … [SW1 SW2]`, success status
    /// word `0x9000`.
    pub fn parse_identity(response: &[u8]) -> Result<AppIdentity, TransportError> {
        if response.len() < 2 {
            return Err(TransportError::CommandFailed(
                "identification response too short".into(),
            ));
        }
        let sw = u16::from_be_bytes([response[response.len() - 2], response[response.len() - 1]]);
        if sw != SW_OK {
            return Err(TransportError::CommandFailed(format!(
                "identification status 0x{sw:04X}"
            )));
        }

        let body = &response[..response.len() - 2];
        if body.len() < 2 {
            return Err(TransportError::CommandFailed(
                "identification response missing name".into(),
            ));
        }
        let name_len = body[1] as usize;
        let name_bytes = body
            .get(2..2 + name_len)
            .ok_or_else(|| TransportError::CommandFailed("identity name truncated".into()))?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| TransportError::CommandFailed("identity name is not UTF-8".into()))?
            .to_string();
        Ok(AppIdentity { name })
    }
}

impl Command for GetAppName {
    fn payload(&self) -> Vec<u8> {
        self.inner.payload()
    }

    fn consume(&mut self, fragment: &[u8]) -> Progress {
        self.inner.consume(fragment)
    }

    fn resolve(&mut self, outcome: Outcome) {
        self.inner.resolve(outcome);
    }
}
