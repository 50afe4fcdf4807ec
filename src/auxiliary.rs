//! Pass-through handling for dialogs that bypass orchestration.
//!
//! An auxiliary session owns exactly one incoming dialog (from the
//! application server) and one outgoing dialog (toward the IM-SCF) and
//! relays everything between them.
use crate::{
    broker::{BrokerContext, SessionKey},
    error::{BrokerError, Result, TransportError},
    metrics::SessionKind,
    orchestration::leg::PendingRequest,
    sip::{
        message::{self, status_of, MessageExt},
        CorrelationToken, DialogEvent, DialogId, Interface, RequestEvent, ResponseEvent,
        TimeoutEvent, TransactionId, TransactionRole, TransportEvent,
    },
};
use rsip::{Method, Request, Response};
use tracing::{debug, info, warn};

pub struct AuxiliarySession {
    key: SessionKey,
    /// Interface the initial INVITE arrived on.
    interface: Interface,
    incoming_dialog: Option<DialogId>,
    outgoing_dialog: Option<DialogId>,
    /// Incoming INVITE still owed a final response.
    invite: Option<PendingRequest>,
    /// Relayed in-dialog requests waiting for their response.
    pending: Vec<PendingRequest>,
    last_incoming_request: Option<Request>,
    last_outgoing_invite: Option<Request>,
    client_tx: Option<TransactionId>,
    last_session_progress: Option<Response>,
    started: bool,
    finished: bool,
}

impl AuxiliarySession {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            interface: Interface::Internal,
            incoming_dialog: None,
            outgoing_dialog: None,
            invite: None,
            pending: Vec::new(),
            last_incoming_request: None,
            last_outgoing_invite: None,
            client_tx: None,
            last_session_progress: None,
            started: false,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn token(&self) -> CorrelationToken {
        CorrelationToken::new(self.key.clone(), None)
    }

    pub fn handle_event(&mut self, env: &BrokerContext, event: TransportEvent) {
        debug!(session = %self.key, "handling {}", event.describe());
        let result = match event {
            TransportEvent::Request(event) => self.on_request(env, event),
            TransportEvent::Response(event) => self.on_response(env, event),
            TransportEvent::Timeout(event) => self.on_timeout(env, event),
            TransportEvent::DialogTimeout(event) | TransportEvent::DialogTerminated(event) => {
                self.on_dialog_end(env, event);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(session = %self.key, "auxiliary session error: {}", e);
        }
    }

    fn is_retransmission(&self, request: &Request) -> bool {
        if !matches!(
            request.method,
            Method::Invite | Method::Bye | Method::Info | Method::PRack
        ) {
            return false;
        }
        match (&self.last_incoming_request, request.top_via_branch()) {
            (Some(last), Some(branch)) => {
                last.method == request.method && last.top_via_branch().as_deref() == Some(&branch)
            }
            _ => false,
        }
    }

    fn on_request(&mut self, env: &BrokerContext, event: RequestEvent) -> Result<()> {
        if self.is_retransmission(&event.request) {
            debug!(session = %self.key, "{} retransmission dropped", event.request.method);
            return Ok(());
        }
        match event.request.method {
            Method::Invite if self.incoming_dialog.is_none() => self.on_invite(env, event),
            Method::Invite => {
                warn!(session = %self.key, "re-INVITE on auxiliary dialog rejected");
                self.reply(env, &event, 488, Some("re-INVITE not supported"))
            }
            Method::Ack => self.on_ack(env, event),
            Method::Cancel => self.on_cancel(env, event),
            Method::PRack => self.on_prack(env, event),
            _ => self.relay(env, event),
        }
    }

    fn reply(
        &self,
        env: &BrokerContext,
        event: &RequestEvent,
        status: u16,
        reason: Option<&str>,
    ) -> Result<()> {
        let response = match reason {
            Some(reason) => message::response_with_reason(&event.request, status, reason),
            None => message::response_to(&event.request, status),
        };
        match &event.server_tx {
            Some(tx) => env.transport.send_response(tx, response)?,
            None => env
                .transport
                .send_stateless_response(event.interface, response)?,
        }
        Ok(())
    }

    fn on_invite(&mut self, env: &BrokerContext, event: RequestEvent) -> Result<()> {
        let server_tx = event
            .server_tx
            .clone()
            .ok_or_else(|| TransportError::send("INVITE", "no server transaction"))?;
        let dialog = event
            .dialog
            .clone()
            .ok_or_else(|| TransportError::send("INVITE", "no dialog"))?;

        self.started = true;
        env.counters.started(SessionKind::Auxiliary);
        self.interface = event.interface;
        env.transport.bind_dialog(&dialog, self.token());
        self.incoming_dialog = Some(dialog);
        self.last_incoming_request = Some(event.request.clone());
        if let Err(e) = self.reply(env, &event, 100, None) {
            warn!(session = %self.key, "unable to send 100 Trying: {}", e);
        }

        let routes = match message::routes_after_first(&event.request) {
            routes if routes.is_empty() => vec![env.imscf_route.clone()],
            routes => routes,
        };
        let call_id = env.transport.new_call_id();
        let sent = message::outgoing_invite(&event.request, &call_id, &routes, &env.contact)
            .and_then(|invite| {
                env.transport
                    .send_dialog_request(Interface::External, invite.clone(), self.token())
                    .map(|opened| (opened, invite))
            });
        match sent {
            Ok((opened, invite)) => {
                info!(session = %self.key, dialog = %opened.dialog, "auxiliary INVITE relayed to IM-SCF");
                self.outgoing_dialog = Some(opened.dialog);
                self.client_tx = Some(opened.transaction);
                self.last_outgoing_invite = Some(invite);
                self.invite = Some(PendingRequest {
                    server_tx,
                    request: event.request,
                });
                Ok(())
            }
            Err(e) => {
                warn!(session = %self.key, "unable to relay INVITE: {}", e);
                let response = message::response_with_reason(
                    &event.request,
                    503,
                    &format!("ServiceBroker error: {}", e),
                );
                if let Err(e) = env
                    .transport
                    .send_stateless_response(self.interface, response)
                {
                    warn!(session = %self.key, "unable to send 503: {}", e);
                }
                env.counters.aborted(SessionKind::Auxiliary);
                self.incoming_dialog = None;
                self.finish(env);
                Ok(())
            }
        }
    }

    fn on_ack(&mut self, env: &BrokerContext, event: RequestEvent) -> Result<()> {
        let dialog = self
            .outgoing_dialog
            .clone()
            .ok_or_else(|| TransportError::send("ACK", "no outgoing dialog"))?;
        let cseq = self
            .last_outgoing_invite
            .as_ref()
            .and_then(|invite| invite.cseq())
            .map(|c| c.seq)
            .ok_or_else(|| TransportError::send("ACK", "no outgoing INVITE"))?;
        env.transport.send_ack(
            &dialog,
            cseq,
            message::relayed_ack(&event.request, &env.contact),
        )?;
        Ok(())
    }

    fn on_cancel(&mut self, env: &BrokerContext, event: RequestEvent) -> Result<()> {
        self.reply(env, &event, 200, None)?;
        match (&self.client_tx, &self.invite) {
            (Some(invite_tx), Some(_)) => {
                env.transport.send_cancel(invite_tx, self.token())?;
            }
            _ => debug!(session = %self.key, "CANCEL after final response ignored"),
        }
        Ok(())
    }

    fn on_prack(&mut self, env: &BrokerContext, event: RequestEvent) -> Result<()> {
        let (Some(dialog), Some(reliable), Some(server_tx)) = (
            self.outgoing_dialog.clone(),
            self.last_session_progress.clone(),
            event.server_tx.clone(),
        ) else {
            return self.reply(env, &event, 481, None);
        };
        env.transport.send_prack(&dialog, &reliable, self.token())?;
        self.pending.push(PendingRequest {
            server_tx,
            request: event.request,
        });
        Ok(())
    }

    /// Relays an in-dialog request onto the opposite dialog.
    fn relay(&mut self, env: &BrokerContext, event: RequestEvent) -> Result<()> {
        let target = match event.dialog.as_ref() {
            Some(dialog) if self.incoming_dialog.as_ref() == Some(dialog) => {
                self.outgoing_dialog.clone()
            }
            Some(dialog) if self.outgoing_dialog.as_ref() == Some(dialog) => {
                self.incoming_dialog.clone()
            }
            _ => None,
        };
        let Some(target) = target else {
            debug!(session = %self.key, "{} for a finished dialog", event.request.method);
            return self.reply(env, &event, 481, None);
        };
        let server_tx = event.server_tx.clone().ok_or_else(|| {
            TransportError::send(event.request.method.to_string(), "no server transaction")
        })?;
        self.last_incoming_request = Some(event.request.clone());
        let request = message::relayed_request(&event.request, &env.contact);
        env.transport.send_in_dialog(&target, request, self.token())?;
        self.pending.push(PendingRequest {
            server_tx,
            request: event.request,
        });
        Ok(())
    }

    fn answer_pending(&mut self, env: &BrokerContext, status: u16) {
        let (answered, kept): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|p| matches!(p.request.method, Method::Info | Method::PRack));
        self.pending = kept;
        for pending in answered {
            let response = message::response_to(&pending.request, status);
            if let Err(e) = env.transport.send_response(&pending.server_tx, response) {
                warn!(session = %self.key, "failed to answer pending {}: {}", pending.request.method, e);
            }
        }
    }

    fn on_response(&mut self, env: &BrokerContext, event: ResponseEvent) -> Result<()> {
        let status = status_of(&event.response);
        let method = event
            .response
            .cseq_method()
            .ok_or_else(|| BrokerError::Malformed("response without CSeq".to_string()))?;
        match method {
            Method::Invite => self.on_invite_response(env, &event.response, status),
            Method::Cancel => Ok(()),
            method => {
                let Some(idx) = self.pending.iter().position(|p| p.request.method == method) else {
                    debug!(session = %self.key, status, "no pending {} for response", method);
                    return Ok(());
                };
                let pending = &self.pending[idx];
                let response =
                    message::forwarded_response(&event.response, &pending.request, &env.contact);
                env.transport.send_response(&pending.server_tx, response)?;
                if status >= 200 {
                    self.pending.remove(idx);
                    if method == Method::Bye {
                        env.counters.successful(SessionKind::Auxiliary);
                    }
                }
                Ok(())
            }
        }
    }

    fn on_invite_response(
        &mut self,
        env: &BrokerContext,
        upstream: &Response,
        status: u16,
    ) -> Result<()> {
        if status == 100 {
            return Ok(());
        }
        let Some(invite) = self.invite.clone() else {
            debug!(session = %self.key, status, "INVITE already answered");
            return Ok(());
        };
        let response = message::forwarded_response(upstream, &invite.request, &env.contact);
        if status == 183 && upstream.requires_100rel() {
            let dialog = self
                .incoming_dialog
                .clone()
                .ok_or_else(|| TransportError::send("183", "no incoming dialog"))?;
            env.transport
                .send_reliable_provisional(&dialog, &invite.server_tx, response)?;
            self.last_session_progress = Some(upstream.clone());
            return Ok(());
        }
        if status >= 300 {
            self.answer_pending(env, 481);
        }
        env.transport.send_response(&invite.server_tx, response)?;
        if status >= 200 {
            self.invite = None;
        }
        Ok(())
    }

    fn on_timeout(&mut self, env: &BrokerContext, event: TimeoutEvent) -> Result<()> {
        match (event.role, &event.method) {
            (TransactionRole::Server, method) => {
                warn!(session = %self.key, "server {} transaction timed out", method);
            }
            (TransactionRole::Client, Method::Invite) => {
                warn!(session = %self.key, "INVITE toward IM-SCF timed out");
                self.outgoing_dialog = None;
                self.answer_pending(env, 481);
                if let Some(invite) = self.invite.take() {
                    let response = message::response_to(&invite.request, 408);
                    env.transport.send_response(&invite.server_tx, response)?;
                }
                env.counters.aborted(SessionKind::Auxiliary);
                self.check_finished(env);
            }
            (TransactionRole::Client, method) => {
                if let Some(idx) = self.pending.iter().position(|p| p.request.method == *method) {
                    let pending = self.pending.remove(idx);
                    let response = message::response_to(&pending.request, 408);
                    env.transport.send_response(&pending.server_tx, response)?;
                }
            }
        }
        Ok(())
    }

    fn on_dialog_end(&mut self, env: &BrokerContext, event: DialogEvent) {
        if self.incoming_dialog.as_ref() == Some(&event.dialog) {
            self.incoming_dialog = None;
        } else if self.outgoing_dialog.as_ref() == Some(&event.dialog) {
            self.outgoing_dialog = None;
        } else {
            debug!(session = %self.key, dialog = %event.dialog, "unknown dialog ended");
            return;
        }
        self.check_finished(env);
    }

    fn check_finished(&mut self, env: &BrokerContext) {
        if self.started && self.incoming_dialog.is_none() && self.outgoing_dialog.is_none() {
            self.finish(env);
        }
    }

    fn finish(&mut self, env: &BrokerContext) {
        if self.finished {
            return;
        }
        self.finished = true;
        env.counters.running(SessionKind::Auxiliary, -1);
        debug!(session = %self.key, "auxiliary session finished");
    }
}
