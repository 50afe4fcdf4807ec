use crate::{broker::SessionKey, error::TransportError, orchestration::LegId};
use rsip::{Method, Request, Response};
use std::fmt;

/// Opaque dialog handle issued by the signaling stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId(pub String);

/// Opaque client or server transaction handle issued by the signaling stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(pub String);

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signaling interface a message leaves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    Internal,
    External,
}

/// Non-owning lookup key stored in the stack's per-dialog and
/// per-transaction application slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationToken {
    pub session: SessionKey,
    pub leg: Option<LegId>,
}

impl CorrelationToken {
    pub fn new(session: SessionKey, leg: Option<LegId>) -> Self {
        Self { session, leg }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingDialog {
    pub dialog: DialogId,
    pub transaction: TransactionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionRole {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub request: Request,
    /// `None` for ACK.
    pub server_tx: Option<TransactionId>,
    /// Dialog the request belongs to, or the early dialog a new INVITE created.
    pub dialog: Option<DialogId>,
    pub token: Option<CorrelationToken>,
    pub interface: Interface,
}

#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub response: Response,
    pub client_tx: TransactionId,
    pub dialog: Option<DialogId>,
    pub token: Option<CorrelationToken>,
}

#[derive(Debug, Clone)]
pub struct TimeoutEvent {
    pub transaction: TransactionId,
    pub role: TransactionRole,
    pub method: Method,
    pub dialog: Option<DialogId>,
    pub token: Option<CorrelationToken>,
}

#[derive(Debug, Clone)]
pub struct DialogEvent {
    pub dialog: DialogId,
    pub token: Option<CorrelationToken>,
}

/// Everything the signaling stack delivers to the broker.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Request(RequestEvent),
    Response(ResponseEvent),
    Timeout(TimeoutEvent),
    DialogTimeout(DialogEvent),
    DialogTerminated(DialogEvent),
}

impl TransportEvent {
    pub fn token(&self) -> Option<&CorrelationToken> {
        match self {
            TransportEvent::Request(e) => e.token.as_ref(),
            TransportEvent::Response(e) => e.token.as_ref(),
            TransportEvent::Timeout(e) => e.token.as_ref(),
            TransportEvent::DialogTimeout(e) | TransportEvent::DialogTerminated(e) => {
                e.token.as_ref()
            }
        }
    }

    pub fn dialog(&self) -> Option<&DialogId> {
        match self {
            TransportEvent::Request(e) => e.dialog.as_ref(),
            TransportEvent::Response(e) => e.dialog.as_ref(),
            TransportEvent::Timeout(e) => e.dialog.as_ref(),
            TransportEvent::DialogTimeout(e) | TransportEvent::DialogTerminated(e) => {
                Some(&e.dialog)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TransportEvent::Request(e) => format!("{} request", e.request.method),
            TransportEvent::Response(e) => {
                format!("{} response", e.response.status_code.code())
            }
            TransportEvent::Timeout(e) => format!("{} timeout", e.method),
            TransportEvent::DialogTimeout(_) => "dialog timeout".to_string(),
            TransportEvent::DialogTerminated(_) => "dialog terminated".to_string(),
        }
    }
}

/// Primitives the broker needs from the signaling stack. All calls are
/// synchronous and must not block on the network.
///
/// Requests passed to the in-dialog primitives are prototypes: the stack
/// fills in the dialog identity (request-uri, Call-ID, tags, CSeq, Via and
/// route set) and keeps application headers and body.
pub trait SignalingTransport: Send + Sync {
    /// Fresh Call-ID for a new dialog.
    fn new_call_id(&self) -> String;

    /// Opens a new dialog with a dialog-creating request (INVITE).
    fn send_dialog_request(
        &self,
        interface: Interface,
        request: Request,
        token: CorrelationToken,
    ) -> Result<OutgoingDialog, TransportError>;

    /// Sends an out-of-dialog request (OPTIONS probe).
    fn send_request(
        &self,
        interface: Interface,
        request: Request,
        token: CorrelationToken,
    ) -> Result<TransactionId, TransportError>;

    fn send_in_dialog(
        &self,
        dialog: &DialogId,
        request: Request,
        token: CorrelationToken,
    ) -> Result<TransactionId, TransportError>;

    /// PRACK acknowledging `reliable`, a 100rel provisional response.
    fn send_prack(
        &self,
        dialog: &DialogId,
        reliable: &Response,
        token: CorrelationToken,
    ) -> Result<TransactionId, TransportError>;

    /// ACK for the 2xx of the INVITE numbered `cseq`.
    fn send_ack(&self, dialog: &DialogId, cseq: u32, ack: Request) -> Result<(), TransportError>;

    fn send_cancel(
        &self,
        invite: &TransactionId,
        token: CorrelationToken,
    ) -> Result<TransactionId, TransportError>;

    fn send_response(&self, server_tx: &TransactionId, response: Response)
        -> Result<(), TransportError>;

    /// Sends a provisional response with 100rel semantics (RSeq, retransmission).
    fn send_reliable_provisional(
        &self,
        dialog: &DialogId,
        server_tx: &TransactionId,
        response: Response,
    ) -> Result<(), TransportError>;

    fn send_stateless_response(
        &self,
        interface: Interface,
        response: Response,
    ) -> Result<(), TransportError>;

    /// Stores `token` in the dialog's application slot.
    fn bind_dialog(&self, dialog: &DialogId, token: CorrelationToken);
}
