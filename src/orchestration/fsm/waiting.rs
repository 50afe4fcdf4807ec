use super::{chaining::reports_early_media, Fsm};
use crate::{
    error::Result,
    orchestration::{
        context::SessionState,
        leg::{LegId, LegState},
    },
    sip::{
        message::{status_of, MessageExt},
        RequestEvent, ResponseEvent, TimeoutEvent,
    },
};
use rsip::{Method, Response};
use tracing::{debug, info, warn};

impl Fsm<'_> {
    /// ACK hop: once both IM-SCF sides are acknowledged the session is up.
    pub(super) fn waiting_ack(&mut self, event: RequestEvent) -> Result<()> {
        let sender = self.leg_for(event.token.as_ref(), "ACK")?;
        let next = self.next_of(sender)?;
        let out = self.out;
        debug!(session = %self.ctx.key, leg = %self.leg(next), "forwarding ACK");
        self.leg_mut(next).send_ack(out, &event.request)?;

        let SessionState::WaitingForImScf {
            mut ack_from_imscf,
            mut ack_to_imscf,
        } = self.ctx.state
        else {
            return Ok(());
        };
        ack_from_imscf |= self.leg(sender).is_imscf();
        ack_to_imscf |= self.leg(next).is_imscf();
        self.ctx.state = if ack_from_imscf && ack_to_imscf {
            SessionState::SessionOngoing
        } else {
            SessionState::WaitingForImScf {
                ack_from_imscf,
                ack_to_imscf,
            }
        };
        Ok(())
    }

    pub(super) fn waiting_response(&mut self, responder: LegId, event: ResponseEvent) -> Result<()> {
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
        if status == 200 {
            return self.waiting_ok(responder, prev, &event);
        }
        if response.has_extension("reason") || status >= 300 {
            debug!(session = %self.ctx.key, "error response from IM-SCF, forwarding back");
            let b = self.ctx.chain.b();
            self.leg_mut(b).outgoing_dialog = None;
            self.leg_mut(responder).state = LegState::Terminated;
            self.rewind_to(prev)?;
            return self.forward_error_back(prev, response);
        }
        match status {
            183 => self.waiting_session_progress(responder, prev, response),
            100 => {
                self.leg_mut(responder).state = LegState::Provisional;
                Ok(())
            }
            101..=199 => {
                self.leg_mut(prev).forward_response(out, response)?;
                self.leg_mut(responder).state = LegState::Provisional;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn waiting_ok(&mut self, responder: LegId, prev: LegId, event: &ResponseEvent) -> Result<()> {
        let out = self.out;
        let response = &event.response;
        match response.cseq_method() {
            Some(Method::Invite) => {
                self.leg_mut(responder).state = LegState::Answered;
                self.leg_mut(prev).forward_response(out, response)
            }
            Some(Method::Cancel) => Ok(()),
            Some(Method::PRack) => {
                self.leg_mut(prev).forward_prack_response(out, response)?;
                if self.leg(prev).is_imscf() {
                    self.ctx.reliable_response_processing = false;
                }
                Ok(())
            }
            Some(Method::Bye) => self.relay_bye_ok(responder, event),
            other => {
                warn!(session = %self.ctx.key, "unexpected 200 for {:?}", other);
                Ok(())
            }
        }
    }

    fn waiting_session_progress(&mut self, responder: LegId, prev: LegId, response: &Response) -> Result<()> {
        let out = self.out;
        self.leg_mut(responder).state = LegState::Provisional;
        if reports_early_media(response) {
            return Err(self.unexpected("183 with x-as from IM-SCF"));
        }
        if response.requires_100rel() {
            self.leg_mut(prev).forward_reliable_provisional(out, response)?;
            self.ctx.reliable_response_processing = true;
            self.leg_mut(responder).last_session_progress = Some(response.clone());
            Ok(())
        } else {
            self.leg_mut(prev).forward_response(out, response)
        }
    }

    pub(super) fn waiting_timeout(&mut self, event: TimeoutEvent) -> Result<()> {
        if event.method != Method::Invite {
            debug!(session = %self.ctx.key, "{} timeout ignored", event.method);
            return Ok(());
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
        self.rewind_to(prev)?;
        self.respond_back(prev, 408)
    }
}
