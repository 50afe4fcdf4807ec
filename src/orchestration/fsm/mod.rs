//! State machine driving one orchestrated session.
//!
//! Every event of a session goes through [`Fsm::handle_event`] on the
//! session's mailbox worker. Handlers return `Err` for send failures and
//! unexpected messages; any such error moves the session to
//! `InternalError` after tearing down the legs still up.
mod chaining;
mod ending;
mod initial;
mod ongoing;
mod relay;
mod terminal;
mod waiting;

use super::{
    context::{SessionContext, SessionState},
    leg::{Leg, LegId, LegState, Outbound},
};
use crate::{
    error::{BrokerError, Result, TransportError},
    metrics::{SessionKind, UsageCounters},
    sip::{
        message::{self, MessageExt},
        CorrelationToken, DialogId, RequestEvent, ResponseEvent, TimeoutEvent, TransactionRole,
        TransportEvent,
    },
};
use rsip::{Method, Request, Response};
use tracing::{debug, error, warn};

/// Which of a leg's two dialogs a relayed request goes out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DialogSide {
    /// The dialog the leg opened toward the broker.
    Incoming,
    /// The dialog the broker opened toward the leg.
    Outgoing,
}

pub struct Fsm<'a> {
    ctx: &'a mut SessionContext,
    out: &'a Outbound<'a>,
    counters: &'a UsageCounters,
}

impl<'a> Fsm<'a> {
    pub fn new(
        ctx: &'a mut SessionContext,
        out: &'a Outbound<'a>,
        counters: &'a UsageCounters,
    ) -> Self {
        Self { ctx, out, counters }
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        let before = self.ctx.state;
        debug!(session = %self.ctx.key, state = %before, "handling {}", event.describe());

        if before == SessionState::InternalError {
            self.internal_error_event(event);
            return;
        }
        let result = match event {
            TransportEvent::Request(e) => self.on_request(e),
            TransportEvent::Response(e) => self.on_response(e),
            TransportEvent::Timeout(e) => self.on_timeout(e),
            TransportEvent::DialogTimeout(e) | TransportEvent::DialogTerminated(e) => {
                self.check_and_remove(&e.dialog);
                Ok(())
            }
        };
        if let Err(e) = result {
            self.fail(e);
        }
        if self.ctx.state != before {
            debug!(session = %self.ctx.key, "state {} -> {}", before, self.ctx.state);
        }
    }

    fn on_request(&mut self, event: RequestEvent) -> Result<()> {
        let state = self.ctx.state;
        let method = event.request.method.clone();
        match method {
            Method::Invite => {
                if !self.preprocess_invite(&event)? {
                    return Ok(());
                }
                match state {
                    SessionState::Initial => self.initial_invite(event),
                    SessionState::Chaining => self.chaining_invite(event),
                    SessionState::SessionEnding => self.ending_invite(event),
                    _ => Err(self.unexpected("INVITE")),
                }
            }
            Method::Ack => match state {
                SessionState::Chaining | SessionState::End => {
                    debug!(session = %self.ctx.key, "ACK ignored");
                    Ok(())
                }
                SessionState::WaitingForImScf { .. } => self.waiting_ack(event),
                SessionState::SessionOngoing => self.ongoing_ack(event),
                _ => Err(self.unexpected("ACK")),
            },
            Method::Bye => match state {
                SessionState::Chaining | SessionState::WaitingForImScf { .. } => {
                    self.relay_early_bye(event)
                }
                SessionState::SessionOngoing => self.ongoing_bye(event),
                SessionState::SessionEnding => self.ending_bye(event),
                _ => Err(self.unexpected("BYE")),
            },
            Method::PRack => match state {
                SessionState::Chaining | SessionState::WaitingForImScf { .. } => {
                    self.relay_prack(event)
                }
                _ => Err(self.unexpected("PRACK")),
            },
            Method::Cancel => match state {
                SessionState::Chaining | SessionState::WaitingForImScf { .. } => {
                    self.relay_cancel(event)
                }
                _ => {
                    self.answer_cancel(&event, 200);
                    Err(self.unexpected("CANCEL"))
                }
            },
            Method::Info => match state {
                SessionState::Chaining
                | SessionState::WaitingForImScf { .. }
                | SessionState::SessionOngoing => self.relay_info(event),
                _ => Err(self.unexpected("INFO")),
            },
            Method::Options => Err(self.unexpected("OPTIONS")),
            method => {
                warn!(session = %self.ctx.key, "unsupported method: {}", method);
                let response =
                    message::response_with_reason(&event.request, 405, "Method not supported");
                if let Err(e) = self
                    .out
                    .transport
                    .send_stateless_response(event.interface, response)
                {
                    warn!(session = %self.ctx.key, "unable to send 405: {}", e);
                }
                Ok(())
            }
        }
    }

    fn on_response(&mut self, event: ResponseEvent) -> Result<()> {
        let responder = self.leg_for(event.token.as_ref(), "response")?;
        match self.ctx.state {
            SessionState::Chaining => self.chaining_response(responder, event),
            SessionState::WaitingForImScf { .. } => self.waiting_response(responder, event),
            SessionState::SessionOngoing => self.ongoing_response(responder, event),
            SessionState::SessionEnding => self.ending_response(responder, event),
            SessionState::End => self.end_response(responder, event),
            SessionState::Initial | SessionState::InternalError => Err(self.unexpected(format!(
                "{} response",
                message::status_of(&event.response)
            ))),
        }
    }

    fn on_timeout(&mut self, event: TimeoutEvent) -> Result<()> {
        let state = self.ctx.state;
        if state == SessionState::End {
            debug!(session = %self.ctx.key, "timeout while waiting for dialogs to end");
            return Ok(());
        }
        if event.role == TransactionRole::Server {
            error!(session = %self.ctx.key, "server transaction timeout for {}", event.method);
            return Err(self.unexpected(format!("server transaction timeout for {}", event.method)));
        }
        match state {
            SessionState::Chaining => self.chaining_timeout(event),
            SessionState::WaitingForImScf { .. } => self.waiting_timeout(event),
            SessionState::SessionEnding => self.ending_timeout(event),
            _ => Err(self.unexpected(format!("{} timeout", event.method))),
        }
    }

    fn unexpected(&self, what: impl Into<String>) -> BrokerError {
        BrokerError::unexpected(self.ctx.state.name(), what)
    }

    /// Leg the transport correlated this event with.
    fn leg_for(&self, token: Option<&CorrelationToken>, what: &str) -> Result<LegId> {
        token
            .and_then(|t| t.leg)
            .filter(|id| self.ctx.chain.get(*id).is_some())
            .ok_or_else(|| self.unexpected(format!("{} without leg", what)))
    }

    fn leg(&self, id: LegId) -> &Leg {
        self.ctx.chain.leg(id)
    }

    fn leg_mut(&mut self, id: LegId) -> &mut Leg {
        self.ctx.chain.leg_mut(id)
    }

    fn prev_of(&self, id: LegId) -> Result<LegId> {
        self.ctx
            .chain
            .prev(id)
            .ok_or_else(|| self.unexpected(format!("{} has no previous leg", self.leg(id))))
    }

    fn next_of(&self, id: LegId) -> Result<LegId> {
        self.ctx
            .chain
            .next(id)
            .ok_or_else(|| self.unexpected(format!("{} has no next leg", self.leg(id))))
    }

    /// Binds a new INVITE to the leg it comes from and answers 100 Trying.
    /// Returns `false` for a retransmission.
    fn preprocess_invite(&mut self, event: &RequestEvent) -> Result<bool> {
        let request = &event.request;
        let seen = (
            request.call_id().unwrap_or_default(),
            request.top_via_branch().unwrap_or_default(),
        );
        if self.ctx.seen_invites.contains(&seen) {
            warn!(session = %self.ctx.key, "INVITE retransmission for already processing dialog");
            return Ok(false);
        }
        let server_tx = event
            .server_tx
            .clone()
            .ok_or_else(|| TransportError::send("INVITE", "no server transaction"))?;
        let dialog = event
            .dialog
            .clone()
            .ok_or_else(|| TransportError::send("INVITE", "no dialog"))?;

        let a = self.ctx.chain.a();
        let inviting = if self.leg(a).incoming_dialog.is_none() {
            self.counters.started(SessionKind::Orchestrated);
            a
        } else {
            self.ctx.current
        };
        let out = self.out;
        let leg = self.ctx.chain.leg_mut(inviting);
        leg.store_request(Some(server_tx.clone()), request.clone());
        leg.incoming_dialog = Some(dialog.clone());
        out.transport.bind_dialog(&dialog, out.token(inviting));
        debug!(session = %self.ctx.key, leg = %leg, dialog = %dialog, "INVITE accepted");

        self.ctx.pending_dialogs.insert(dialog);
        self.ctx.seen_invites.insert(seen);
        self.ctx.last_incoming_invite = Some(request.clone());

        let trying = message::response_to(request, 100);
        if let Err(e) = out.transport.send_response(&server_tx, trying) {
            warn!(session = %self.ctx.key, "unable to send 100 Trying: {}", e);
        }
        Ok(true)
    }

    /// Drops `dialog` from the pending set. Returns `true` when it was the
    /// last one and the session is finished.
    fn check_and_remove(&mut self, dialog: &DialogId) -> bool {
        if !self.ctx.pending_dialogs.remove(dialog) {
            debug!(session = %self.ctx.key, dialog = %dialog, "dialog already removed");
            return false;
        }
        if !self.ctx.pending_dialogs.is_empty() {
            debug!(
                session = %self.ctx.key,
                "{} dialogs still pending",
                self.ctx.pending_dialogs.len()
            );
            return false;
        }
        debug!(session = %self.ctx.key, "last dialog terminated, removing session");
        self.ctx.finished = true;
        self.counters.running(SessionKind::Orchestrated, -1);
        true
    }

    /// Tears the session down after an unrecoverable error.
    pub fn fail(&mut self, error: BrokerError) {
        if self.ctx.state == SessionState::InternalError {
            warn!(session = %self.ctx.key, "error while already cleaning up: {}", error);
            return;
        }
        error!(
            session = %self.ctx.key,
            state = %self.ctx.state,
            "cleanup session after error: {}",
            error
        );
        self.disconnect_all();
        self.counters.aborted(SessionKind::Orchestrated);
        self.ctx.state = SessionState::InternalError;
    }

    /// CANCEL for legs with a provisional answer, BYE for answered ones.
    /// Legs still waiting for a first response are marked for a deferred
    /// CANCEL; legs never invited are left alone.
    fn disconnect_all(&mut self) {
        let out = self.out;
        for id in self.ctx.chain.path().into_iter().skip(1) {
            let leg = self.ctx.chain.leg_mut(id);
            if leg.is_imscf() {
                break;
            }
            disconnect(out, leg);
        }
        let b = self.ctx.chain.b();
        disconnect(out, self.ctx.chain.leg_mut(b));
        debug!(session = %self.ctx.key, "all dialogs disconnected or marked to disconnect");
    }

    /// Makes `leg` current and rebuilds the chain after it.
    fn rewind_to(&mut self, leg: LegId) -> Result<()> {
        self.ctx.current = leg;
        self.ctx.rollback(leg)
    }

    /// Synthesizes `status` toward `leg` and resumes chaining.
    fn respond_back(&mut self, leg: LegId, status: u16) -> Result<()> {
        let out = self.out;
        self.leg_mut(leg).respond(out, status)?;
        self.ctx.state = SessionState::Chaining;
        Ok(())
    }

    /// Relays an error response toward `leg` and resumes chaining, letting
    /// the upstream service decide how to continue.
    fn forward_error_back(&mut self, leg: LegId, response: &Response) -> Result<()> {
        let out = self.out;
        debug!(session = %self.ctx.key, leg = %self.leg(leg), "forwarding error response back");
        self.leg_mut(leg).forward_response(out, response)?;
        self.ctx.state = SessionState::Chaining;
        Ok(())
    }

    /// Completes a CANCEL deferred until `responder` answered at all.
    fn postponed_cancel(&mut self, status: u16, responder: LegId) -> Result<()> {
        let out = self.out;
        let prev = self.prev_of(responder)?;
        if status < 200 {
            debug!(session = %self.ctx.key, leg = %self.leg(responder), "sending deferred CANCEL");
            return self.leg(responder).send_cancel(out);
        }
        if status < 420 {
            debug!(session = %self.ctx.key, leg = %self.leg(responder), "answered, sending BYE rather than CANCEL");
            self.leg(responder).send_bye(out)?;
            self.leg_mut(responder).state = LegState::Terminating;
        } else {
            self.leg_mut(responder).state = LegState::Terminated;
        }
        self.rewind_to(prev)?;
        self.respond_back(prev, 487)
    }

    /// Sends `template` on one of `target`'s dialogs.
    fn relay_request(
        &mut self,
        target: LegId,
        side: DialogSide,
        template: &Request,
        special_info_sender: Option<LegId>,
    ) -> Result<()> {
        let out = self.out;
        let leg = self.ctx.chain.leg_mut(target);
        let dialog = match side {
            DialogSide::Incoming => leg.incoming_dialog.clone(),
            DialogSide::Outgoing => leg.outgoing_dialog.clone(),
        }
        .ok_or_else(|| {
            TransportError::send(
                template.method.to_string(),
                format!("{} has no {:?} dialog", leg, side),
            )
        })?;
        debug!(session = %out.session, leg = %leg, "relaying {} on {:?} dialog", template.method, side);
        leg.send_on_dialog(out, &dialog, template)?;
        if special_info_sender.is_some() {
            leg.special_info_sender = special_info_sender;
        }
        Ok(())
    }

    fn answer_cancel(&self, event: &RequestEvent, status: u16) {
        let Some(server_tx) = &event.server_tx else {
            return;
        };
        let response = message::response_to(&event.request, status);
        if let Err(e) = self.out.transport.send_response(server_tx, response) {
            warn!(session = %self.ctx.key, status, "unable to answer CANCEL: {}", e);
        }
    }
}

fn disconnect(out: &Outbound, leg: &mut Leg) {
    match leg.state {
        LegState::Invited => leg.state = LegState::SetToCancel,
        LegState::Provisional => leg.send_terminating_cancel(out),
        LegState::SessionProgressReported
        | LegState::SessionProgressConfirmed
        | LegState::Answered
        | LegState::Acked => leg.send_terminating_bye(out),
        _ => {}
    }
}
