use crate::{
    broker::SessionKey,
    error::{Result, TransportError},
    routing::{Endpoint, Service},
    sip::{
        message::{self, status_of, MessageExt},
        CorrelationToken, DialogId, Interface, SignalingTransport, TransactionId,
    },
};
use rsip::{Request, Response, UriWithParams};
use std::{fmt, sync::Arc};
use tracing::{debug, warn};

pub type LegId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImScfSide {
    A,
    B,
}

#[derive(Debug, Clone)]
pub enum LegKind {
    ApplicationServer {
        service: Arc<Service>,
        endpoint: Endpoint,
        /// Index of the service in the ruleset's chain template.
        position: usize,
    },
    ImScf(ImScfSide),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    Initial,
    Invited,
    SetToCancel,
    Provisional,
    SessionProgressReported,
    SessionProgressConfirmed,
    Answered,
    Acked,
    Terminating,
    Terminated,
}

/// A secondary server transaction (INFO or PRACK) waiting for its answer.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub server_tx: TransactionId,
    pub request: Request,
}

/// Everything a leg needs to put a message on the wire.
pub struct Outbound<'a> {
    pub transport: &'a dyn SignalingTransport,
    pub contact: &'a str,
    pub imscf_route: &'a UriWithParams,
    pub session: &'a SessionKey,
}

impl Outbound<'_> {
    pub fn token(&self, leg: LegId) -> CorrelationToken {
        CorrelationToken::new(self.session.clone(), Some(leg))
    }
}

#[derive(Debug, Clone)]
pub struct Leg {
    pub id: LegId,
    pub kind: LegKind,
    pub state: LegState,
    pub incoming_dialog: Option<DialogId>,
    pub outgoing_dialog: Option<DialogId>,
    /// Server transaction of the last request received on this leg.
    pub server_tx: Option<TransactionId>,
    /// Client transaction of the last INVITE sent toward this leg.
    pub client_tx: Option<TransactionId>,
    pub last_incoming_request: Option<Request>,
    pub last_outgoing_invite: Option<Request>,
    pub pending_info: Option<PendingRequest>,
    pub pending_prack: Option<PendingRequest>,
    /// Leg whose `x-fci` INFO is relayed through this one.
    pub special_info_sender: Option<LegId>,
    pub last_session_progress: Option<Response>,
    /// A reliable provisional response sent on this leg still awaits its PRACK.
    pub pending_reliable: bool,
    pub next: Option<LegId>,
    pub prev: Option<LegId>,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LegKind::ApplicationServer { service, .. } => write!(f, "AS:{}", service.alias),
            LegKind::ImScf(ImScfSide::A) => write!(f, "IM-SCF:A"),
            LegKind::ImScf(ImScfSide::B) => write!(f, "IM-SCF:B"),
        }
    }
}

impl Leg {
    pub fn new(id: LegId, kind: LegKind) -> Self {
        Self {
            id,
            kind,
            state: LegState::Initial,
            incoming_dialog: None,
            outgoing_dialog: None,
            server_tx: None,
            client_tx: None,
            last_incoming_request: None,
            last_outgoing_invite: None,
            pending_info: None,
            pending_prack: None,
            special_info_sender: None,
            last_session_progress: None,
            pending_reliable: false,
            next: None,
            prev: None,
        }
    }

    /// Builds an application server leg for template slot `position`,
    /// picking the service's next endpoint.
    pub fn application_server(id: LegId, service: Arc<Service>, position: usize) -> Option<Self> {
        let endpoint = service.next_endpoint()?;
        Some(Self::new(
            id,
            LegKind::ApplicationServer {
                service,
                endpoint,
                position,
            },
        ))
    }

    pub fn is_imscf(&self) -> bool {
        matches!(self.kind, LegKind::ImScf(_))
    }

    pub fn position(&self) -> Option<usize> {
        match &self.kind {
            LegKind::ApplicationServer { position, .. } => Some(*position),
            LegKind::ImScf(_) => None,
        }
    }

    pub fn interface(&self) -> Interface {
        match &self.kind {
            LegKind::ApplicationServer { service, .. } => service.interface(),
            LegKind::ImScf(_) => Interface::External,
        }
    }

    /// Records an incoming request and the transaction it must be answered on.
    pub fn store_request(&mut self, server_tx: Option<TransactionId>, request: Request) {
        self.server_tx = server_tx;
        self.last_incoming_request = Some(request);
    }

    fn outgoing(&self, what: &str) -> Result<DialogId> {
        self.outgoing_dialog
            .clone()
            .ok_or_else(|| TransportError::send(what, format!("{} has no outgoing dialog", self)).into())
    }

    /// Sends the dialog-creating INVITE toward this leg and returns the new dialog.
    pub fn process_outgoing_invite(&mut self, out: &Outbound, incoming: &Request) -> Result<DialogId> {
        let routes = match &self.kind {
            LegKind::ApplicationServer { endpoint, .. } => {
                let mut routes = vec![endpoint.route.clone()];
                routes.extend(incoming.route_set());
                routes
            }
            LegKind::ImScf(_) => {
                let routes = message::routes_after_first(incoming);
                if routes.is_empty() {
                    vec![out.imscf_route.clone()]
                } else {
                    routes
                }
            }
        };
        let call_id = out.transport.new_call_id();
        let invite = message::outgoing_invite(incoming, &call_id, &routes, out.contact)?;
        let opened = out
            .transport
            .send_dialog_request(self.interface(), invite.clone(), out.token(self.id))?;
        debug!(session = %out.session, leg = %self, dialog = %opened.dialog, "INVITE sent");
        self.outgoing_dialog = Some(opened.dialog.clone());
        self.client_tx = Some(opened.transaction);
        self.last_outgoing_invite = Some(invite);
        self.state = LegState::Invited;
        Ok(opened.dialog)
    }

    /// Relays `upstream` on this leg's pending server transaction.
    pub fn forward_response(&mut self, out: &Outbound, upstream: &Response) -> Result<()> {
        let status = status_of(upstream);
        let (server_tx, request) = match (&self.server_tx, &self.last_incoming_request) {
            (Some(tx), Some(request)) => (tx.clone(), request.clone()),
            _ if self.is_imscf() => {
                return Err(TransportError::send(
                    format!("{} response", status),
                    format!("{} has no pending request", self),
                )
                .into())
            }
            _ => {
                debug!(session = %out.session, leg = %self, status, "no pending request, response not forwarded");
                return Ok(());
            }
        };
        if status >= 300 {
            self.answer_pending_requests(out, 481);
        }
        let response = message::forwarded_response(upstream, &request, out.contact);
        out.transport.send_response(&server_tx, response)?;
        if status >= 200 {
            self.server_tx = None;
            self.last_incoming_request = None;
        }
        Ok(())
    }

    /// Relays a 100rel provisional response, at most one outstanding at a time.
    pub fn forward_reliable_provisional(&mut self, out: &Outbound, upstream: &Response) -> Result<()> {
        if self.pending_reliable {
            debug!(session = %out.session, leg = %self, "reliable provisional already outstanding");
            return Ok(());
        }
        let (dialog, server_tx, request) = match (
            &self.incoming_dialog,
            &self.server_tx,
            &self.last_incoming_request,
        ) {
            (Some(dialog), Some(tx), Some(request)) => (dialog.clone(), tx.clone(), request.clone()),
            _ => {
                return Err(TransportError::send(
                    "reliable provisional response",
                    format!("{} has no pending INVITE", self),
                )
                .into())
            }
        };
        let response = message::forwarded_response(upstream, &request, out.contact);
        out.transport
            .send_reliable_provisional(&dialog, &server_tx, response)?;
        self.pending_reliable = true;
        Ok(())
    }

    pub fn forward_prack_response(&mut self, out: &Outbound, upstream: &Response) -> Result<()> {
        let Some(pending) = self.pending_prack.clone() else {
            debug!(session = %out.session, leg = %self, "no pending PRACK");
            return Ok(());
        };
        let response = message::forwarded_response(upstream, &pending.request, out.contact);
        out.transport.send_response(&pending.server_tx, response)?;
        if status_of(upstream) >= 200 {
            self.pending_prack = None;
        }
        Ok(())
    }

    pub fn forward_info_response(&mut self, out: &Outbound, upstream: &Response) -> Result<()> {
        let Some(pending) = self.pending_info.clone() else {
            debug!(session = %out.session, leg = %self, "no pending INFO");
            return Ok(());
        };
        let response = message::forwarded_response(upstream, &pending.request, out.contact);
        out.transport.send_response(&pending.server_tx, response)?;
        if status_of(upstream) >= 200 {
            self.pending_info = None;
        }
        Ok(())
    }

    /// Answers still pending INFO/PRACK transactions; errors are logged only.
    pub fn answer_pending_requests(&mut self, out: &Outbound, status: u16) {
        for pending in [self.pending_info.take(), self.pending_prack.take()]
            .into_iter()
            .flatten()
        {
            let response = message::response_to(&pending.request, status);
            if let Err(e) = out.transport.send_response(&pending.server_tx, response) {
                warn!(session = %out.session, leg = %self, "failed to answer pending {}: {}", pending.request.method, e);
            }
        }
    }

    /// Synthesizes a response to the last request received on this leg.
    pub fn respond(&mut self, out: &Outbound, status: u16) -> Result<()> {
        let (Some(server_tx), Some(request)) = (&self.server_tx, &self.last_incoming_request) else {
            debug!(session = %out.session, leg = %self, status, "nothing to respond to");
            return Ok(());
        };
        let response = message::response_to(request, status);
        out.transport.send_response(server_tx, response)?;
        if status >= 200 {
            self.server_tx = None;
            self.last_incoming_request = None;
        }
        Ok(())
    }

    /// PRACK for the 183 stored on this leg, on its outgoing dialog.
    pub fn process_outgoing_prack(&mut self, out: &Outbound) -> Result<()> {
        let dialog = self.outgoing("PRACK")?;
        let reliable = self.last_session_progress.clone().ok_or_else(|| {
            TransportError::send("PRACK", format!("{} has no reliable provisional response", self))
        })?;
        out.transport
            .send_prack(&dialog, &reliable, out.token(self.id))?;
        Ok(())
    }

    /// Relays an in-dialog request template on `dialog`, owned by this leg.
    pub fn send_on_dialog(&self, out: &Outbound, dialog: &DialogId, template: &Request) -> Result<TransactionId> {
        let request = message::relayed_request(template, out.contact);
        Ok(out
            .transport
            .send_in_dialog(dialog, request, out.token(self.id))?)
    }

    pub fn send_ack(&mut self, out: &Outbound, received: &Request) -> Result<()> {
        let dialog = self.outgoing("ACK")?;
        let cseq = self
            .last_outgoing_invite
            .as_ref()
            .and_then(|invite| invite.cseq())
            .map(|c| c.seq)
            .ok_or_else(|| TransportError::send("ACK", format!("{} has no outgoing INVITE", self)))?;
        out.transport
            .send_ack(&dialog, cseq, message::relayed_ack(received, out.contact))?;
        self.state = LegState::Acked;
        Ok(())
    }

    pub fn send_cancel(&self, out: &Outbound) -> Result<()> {
        let invite = self.client_tx.clone().ok_or_else(|| {
            TransportError::send("CANCEL", format!("{} has no INVITE transaction", self))
        })?;
        out.transport.send_cancel(&invite, out.token(self.id))?;
        Ok(())
    }

    pub fn send_bye(&self, out: &Outbound) -> Result<()> {
        let dialog = self.outgoing("BYE")?;
        let uri = self
            .last_outgoing_invite
            .as_ref()
            .map(|invite| invite.uri.clone())
            .ok_or_else(|| TransportError::send("BYE", format!("{} has no outgoing INVITE", self)))?;
        out.transport
            .send_in_dialog(&dialog, message::bye(uri), out.token(self.id))?;
        Ok(())
    }

    pub fn send_terminating_cancel(&mut self, out: &Outbound) {
        if let Err(e) = self.send_cancel(out) {
            warn!(session = %out.session, leg = %self, "teardown CANCEL failed: {}", e);
        }
        self.state = LegState::Terminated;
    }

    pub fn send_terminating_bye(&mut self, out: &Outbound) {
        if let Err(e) = self.send_bye(out) {
            warn!(session = %out.session, leg = %self, "teardown BYE failed: {}", e);
        }
        self.state = LegState::Terminated;
    }
}
