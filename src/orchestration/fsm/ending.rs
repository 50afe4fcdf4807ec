use super::{DialogSide, Fsm};
use crate::{
    error::Result,
    orchestration::{context::SessionState, leg::LegId},
    sip::{message::status_of, RequestEvent, ResponseEvent, TimeoutEvent},
};
use rsip::Method;
use tracing::debug;

impl Fsm<'_> {
    /// BYE hop in the direction recorded when the teardown started.
    pub(super) fn ending_bye(&mut self, event: RequestEvent) -> Result<()> {
        let sender = self.leg_for(event.token.as_ref(), "BYE")?;
        self.leg_mut(sender)
            .store_request(event.server_tx, event.request.clone());
        if self.ctx.bye_initiated_by_calling_party {
            let next = self.next_of(sender)?;
            self.relay_request(next, DialogSide::Outgoing, &event.request, None)
        } else {
            let prev = self.prev_of(sender)?;
            self.relay_request(prev, DialogSide::Incoming, &event.request, None)?;
            self.ctx.current = prev;
            Ok(())
        }
    }

    pub(super) fn ending_response(&mut self, responder: LegId, event: ResponseEvent) -> Result<()> {
        let status = status_of(&event.response);
        if status != 200 {
            return Err(self.unexpected(format!("{} response after BYE", status)));
        }
        let out = self.out;
        if self.ctx.bye_initiated_by_calling_party {
            let prev = self.prev_of(responder)?;
            debug!(session = %self.ctx.key, leg = %self.leg(prev), "BYE response toward calling party");
            self.leg_mut(prev).forward_response(out, &event.response)?;
            self.ctx.current = prev;
            Ok(())
        } else {
            let next = self.next_of(responder)?;
            debug!(session = %self.ctx.key, leg = %self.leg(next), "BYE response toward called party");
            self.leg_mut(next).forward_response(out, &event.response)
        }
    }

    /// A service answering the BYE with a new INVITE: rebuild the chain
    /// after the current leg and set the call up again.
    pub(super) fn ending_invite(&mut self, event: RequestEvent) -> Result<()> {
        let current = self.ctx.current;
        self.ctx.rollback(current)?;
        self.ctx.state = SessionState::Chaining;
        self.chaining_invite(event)
    }

    /// A BYE nobody answered: synthesize the 200 owed upstream.
    pub(super) fn ending_timeout(&mut self, event: TimeoutEvent) -> Result<()> {
        if event.method != Method::Bye {
            return Ok(());
        }
        let responder = self.leg_for(event.token.as_ref(), "BYE timeout")?;
        let target = if self.ctx.bye_initiated_by_calling_party {
            self.prev_of(responder)?
        } else {
            self.next_of(responder)?
        };
        debug!(session = %self.ctx.key, leg = %self.leg(target), "BYE timeout, answering 200");
        let out = self.out;
        self.leg_mut(target).respond(out, 200)
    }
}
