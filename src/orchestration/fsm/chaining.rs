use super::{DialogSide, Fsm};
use crate::{
    error::{Result, TransportError},
    orchestration::{
        context::SessionState,
        leg::{LegId, LegState, PendingRequest},
    },
    routing::ErrorPolicy,
    sip::{
        message::{self, status_of, MessageExt},
        RequestEvent, ResponseEvent, TimeoutEvent,
    },
};
use rsip::{Method, Request, Response};
use tracing::{debug, info, warn};

impl Fsm<'_> {
    /// INVITE coming back from the service invited last: continue with its successor.
    pub(super) fn chaining_invite(&mut self, event: RequestEvent) -> Result<()> {
        let next = self.next_of(self.ctx.current)?;
        self.continue_setup(event.request, next)
    }

    /// Invites `next` with `request`, applying the 503 policy when the
    /// INVITE cannot be sent.
    pub(super) fn continue_setup(&mut self, request: Request, next: LegId) -> Result<()> {
        self.ctx.current = next;
        let out = self.out;
        match self.leg_mut(next).process_outgoing_invite(out, &request) {
            Ok(dialog) => {
                self.ctx.pending_dialogs.insert(dialog);
            }
            Err(e) => {
                warn!(session = %self.ctx.key, leg = %self.leg(next), "error when sending INVITE: {}", e);
                let prev = self.prev_of(next)?;
                return match self.ctx.ruleset.policy_for(503) {
                    ErrorPolicy::Stop => {
                        self.rewind_to(prev)?;
                        self.respond_back(prev, 503)
                    }
                    ErrorPolicy::Skip if self.skip_not_possible(next) => {
                        self.respond_back(prev, 503)
                    }
                    ErrorPolicy::Skip => self.skip(next),
                };
            }
        }
        if self.leg(next).is_imscf() {
            self.ctx.state = SessionState::waiting();
        }
        Ok(())
    }

    /// A failing leg can be skipped unless it is the IM-SCF or the only
    /// service between both IM-SCF legs.
    fn skip_not_possible(&self, leg: LegId) -> bool {
        let imscf = |id: Option<LegId>| id.map(|id| self.leg(id).is_imscf()).unwrap_or(true);
        self.leg(leg).is_imscf() || (imscf(self.ctx.chain.prev(leg)) && imscf(self.ctx.chain.next(leg)))
    }

    /// Splices `failed` out of the chain and retries its successor with
    /// the last INVITE received.
    fn skip(&mut self, failed: LegId) -> Result<()> {
        debug!(session = %self.ctx.key, leg = %self.leg(failed), "excluding service from orchestration");
        let next = self
            .ctx
            .chain
            .splice(failed)
            .ok_or_else(|| self.unexpected(format!("skip of {}", self.leg(failed))))?;
        let invite = self
            .ctx
            .last_incoming_invite
            .clone()
            .ok_or_else(|| self.unexpected("skip without INVITE"))?;
        self.continue_setup(invite, next)
    }

    /// Applies the ruleset policy for an error `status` from `responder`.
    fn apply_error_policy(&mut self, responder: LegId, prev: LegId, response: &Response) -> Result<()> {
        let status = status_of(response);
        let policy = self.ctx.ruleset.policy_for(status);
        debug!(session = %self.ctx.key, leg = %self.leg(responder), status, "error response, applying {:?}", policy);
        match policy {
            ErrorPolicy::Stop => {
                self.rewind_to(prev)?;
                self.forward_error_back(prev, response)
            }
            ErrorPolicy::Skip if self.skip_not_possible(responder) => {
                self.forward_error_back(prev, response)
            }
            ErrorPolicy::Skip => self.skip(responder),
        }
    }

    pub(super) fn chaining_response(&mut self, responder: LegId, event: ResponseEvent) -> Result<()> {
        let response = &event.response;
        let status = status_of(response);
        debug!(session = %self.ctx.key, leg = %self.leg(responder), status, "response");
        if response.cseq_method() == Some(Method::Cancel) {
            debug!(session = %self.ctx.key, "CANCEL response, no action");
            return Ok(());
        }
        if response.cseq_method() == Some(Method::Info) {
            return self.relay_info_response(responder, &event);
        }
        match self.leg(responder).state {
            LegState::SetToCancel => return self.postponed_cancel(status, responder),
            LegState::Terminated => {
                debug!(session = %self.ctx.key, leg = %self.leg(responder), "response from terminated leg ignored");
                return Ok(());
            }
            _ => {}
        }
        let prev = self.prev_of(responder)?;
        let out = self.out;
        match status {
            200 => self.chaining_ok(responder, prev, &event),
            183 => {
                self.leg_mut(responder).state = LegState::Provisional;
                self.chaining_session_progress(responder, prev, response)
            }
            _ if response.has_extension("reason") => {
                self.leg_mut(responder).state = LegState::Terminated;
                self.rewind_to(prev)?;
                self.forward_error_back(prev, response)
            }
            300.. => {
                self.leg_mut(responder).state = LegState::Terminated;
                self.apply_error_policy(responder, prev, response)
            }
            101..=199 => {
                self.leg_mut(responder).state = LegState::Provisional;
                self.leg_mut(prev).forward_response(out, response)
            }
            _ => {
                self.leg_mut(responder).state = LegState::Provisional;
                Ok(())
            }
        }
    }

    fn chaining_ok(&mut self, responder: LegId, prev: LegId, event: &ResponseEvent) -> Result<()> {
        let out = self.out;
        let response = &event.response;
        match response.cseq_method() {
            Some(Method::Invite) => {
                self.leg_mut(responder).state = LegState::Answered;
                self.leg_mut(prev).forward_response(out, response)
            }
            Some(Method::Bye) => self.relay_bye_ok(responder, event),
            Some(Method::Cancel) => Ok(()),
            _ => {
                if self.ctx.reliable_response_processing {
                    self.leg_mut(prev).forward_prack_response(out, response)?;
                    if self.leg(prev).is_imscf() {
                        self.ctx.reliable_response_processing = false;
                    }
                } else if self.leg(prev).state != LegState::SessionProgressConfirmed {
                    self.leg_mut(prev).forward_prack_response(out, response)?;
                    // blocks further 183 relays toward prev from later services
                    self.leg_mut(prev).state = LegState::SessionProgressConfirmed;
                } else {
                    debug!(session = %self.ctx.key, leg = %self.leg(prev), "session progress already confirmed, PRACK response dropped");
                }
                Ok(())
            }
        }
    }

    fn chaining_session_progress(&mut self, responder: LegId, prev: LegId, response: &Response) -> Result<()> {
        let out = self.out;
        let reliable = response.requires_100rel();
        if !reports_early_media(response) {
            if reliable {
                self.leg_mut(prev).forward_reliable_provisional(out, response)?;
                self.ctx.reliable_response_processing = true;
                self.leg_mut(responder).last_session_progress = Some(response.clone());
            } else {
                self.leg_mut(prev).forward_response(out, response)?;
            }
            return Ok(());
        }
        if !reliable {
            return self.leg_mut(prev).forward_response(out, response);
        }
        let leg = self.leg_mut(responder);
        leg.state = LegState::SessionProgressReported;
        leg.last_session_progress = Some(response.clone());
        if self.leg(prev).state == LegState::SessionProgressConfirmed {
            self.leg_mut(responder).process_outgoing_prack(out)
        } else {
            self.leg_mut(prev).forward_reliable_provisional(out, response)
        }
    }

    pub(super) fn chaining_timeout(&mut self, event: TimeoutEvent) -> Result<()> {
        if event.method != Method::Invite {
            return Err(self.unexpected(format!("client transaction timeout for {}", event.method)));
        }
        let responder = self.leg_for(event.token.as_ref(), "INVITE timeout")?;
        info!(session = %self.ctx.key, leg = %self.leg(responder), "INVITE timeout");
        if let Some(dialog) = &event.dialog {
            if self.check_and_remove(dialog) {
                debug!(session = %self.ctx.key, "this was the last dialog, session removed");
                return Ok(());
            }
        }
        let prev = self.prev_of(responder)?;
        match self.ctx.ruleset.policy_for(408) {
            ErrorPolicy::Stop => {
                self.rewind_to(prev)?;
                self.respond_back(prev, 408)
            }
            ErrorPolicy::Skip if self.skip_not_possible(responder) => self.respond_back(prev, 408),
            ErrorPolicy::Skip => self.skip(responder),
        }
    }

    /// CANCEL from a leg whose INVITE is still being chained onward.
    pub(super) fn relay_cancel(&mut self, event: RequestEvent) -> Result<()> {
        let legs = self
            .leg_for(event.token.as_ref(), "CANCEL")
            .and_then(|sender| Ok((sender, self.next_of(sender)?)));
        let (sender, next) = match legs {
            Ok(legs) => legs,
            Err(e) => {
                self.answer_cancel(&event, 200);
                return Err(e);
            }
        };
        let out = self.out;
        if matches!(self.leg(next).state, LegState::Answered | LegState::Acked) {
            // the 200 already went upstream, nothing left to cancel
            debug!(session = %self.ctx.key, leg = %self.leg(next), "already answered, 481 to CANCEL");
            self.answer_cancel(&event, 481);
            self.ctx.state = SessionState::Chaining;
            return Ok(());
        }
        self.answer_cancel(&event, 200);
        match self.leg(next).state {
            LegState::Invited => {
                debug!(session = %self.ctx.key, leg = %self.leg(next), "waiting for any response before sending CANCEL");
                self.leg_mut(next).state = LegState::SetToCancel;
                Ok(())
            }
            LegState::Terminated => {
                debug!(session = %self.ctx.key, leg = %self.leg(next), "already terminated, 487 back and rollback");
                self.rewind_to(sender)?;
                self.respond_back(sender, 487)
            }
            _ => self.leg(next).send_cancel(out),
        }
    }

    /// PRACK for a reliable provisional response relayed upstream.
    pub(super) fn relay_prack(&mut self, event: RequestEvent) -> Result<()> {
        let sender = self.leg_for(event.token.as_ref(), "PRACK")?;
        let server_tx = event
            .server_tx
            .ok_or_else(|| TransportError::send("PRACK", "no server transaction"))?;
        let leg = self.leg_mut(sender);
        leg.pending_reliable = false;
        leg.pending_prack = Some(PendingRequest {
            server_tx,
            request: event.request,
        });
        let next = self.next_of(sender)?;
        let out = self.out;
        if self.leg(next).state == LegState::Terminated {
            warn!(session = %self.ctx.key, leg = %self.leg(next), "PRACK toward terminated leg");
            self.leg_mut(sender).answer_pending_requests(out, 481);
            Ok(())
        } else {
            self.leg_mut(next).process_outgoing_prack(out)
        }
    }

    /// BYE before the session is established, always traveling forward.
    pub(super) fn relay_early_bye(&mut self, event: RequestEvent) -> Result<()> {
        let sender = self.leg_for(event.token.as_ref(), "BYE")?;
        self.leg_mut(sender)
            .store_request(event.server_tx, event.request.clone());
        let next = self.next_of(sender)?;
        self.relay_request(next, DialogSide::Outgoing, &event.request, None)?;
        self.leg_mut(next).state = LegState::Terminating;
        Ok(())
    }

    /// 200 to a BYE relayed during setup.
    pub(super) fn relay_bye_ok(&mut self, responder: LegId, event: &ResponseEvent) -> Result<()> {
        let out = self.out;
        let on_outgoing =
            event.dialog.is_some() && event.dialog == self.leg(responder).outgoing_dialog;
        if !on_outgoing {
            let next = self.next_of(responder)?;
            return self.leg_mut(next).forward_response(out, &event.response);
        }
        self.leg_mut(responder).state = LegState::Terminated;
        let prev = self.prev_of(responder)?;
        let owed = {
            let leg = self.leg(prev);
            leg.state == LegState::Terminating
                || leg
                    .last_incoming_request
                    .as_ref()
                    .is_some_and(|r| r.method == Method::Bye)
        };
        if owed {
            self.leg_mut(prev).forward_response(out, &event.response)?;
        }
        Ok(())
    }
}

/// `x-as` present with any value other than `false`.
pub(super) fn reports_early_media(response: &Response) -> bool {
    response
        .extension(message::X_AS)
        .is_some_and(|v| v != "false")
}
