use super::{DialogSide, Fsm};
use crate::{
    error::Result,
    metrics::SessionKind,
    orchestration::{
        context::SessionState,
        leg::{LegId, LegState},
    },
    sip::{
        message::{status_of, MessageExt},
        RequestEvent, ResponseEvent,
    },
};
use rsip::Method;
use tracing::debug;

impl Fsm<'_> {
    /// First BYE of an established call. The direction it travels is kept
    /// for the rest of the teardown.
    pub(super) fn ongoing_bye(&mut self, event: RequestEvent) -> Result<()> {
        let sender = self.leg_for(event.token.as_ref(), "BYE")?;
        let from_caller =
            event.dialog.is_some() && event.dialog == self.leg(sender).incoming_dialog;
        self.leg_mut(sender)
            .store_request(event.server_tx, event.request.clone());
        self.ctx.bye_initiated_by_calling_party = from_caller;
        if from_caller {
            debug!(session = %self.ctx.key, leg = %self.leg(sender), "BYE from calling party, passing forward");
            let next = self.next_of(sender)?;
            self.relay_request(next, DialogSide::Outgoing, &event.request, None)?;
        } else {
            debug!(session = %self.ctx.key, leg = %self.leg(sender), "BYE from called party, passing backward");
            let prev = self.prev_of(sender)?;
            self.relay_request(prev, DialogSide::Incoming, &event.request, None)?;
            self.ctx.current = prev;
        }
        self.counters.successful(SessionKind::Orchestrated);
        self.ctx.state = SessionState::SessionEnding;
        Ok(())
    }

    pub(super) fn ongoing_response(&mut self, responder: LegId, event: ResponseEvent) -> Result<()> {
        let status = status_of(&event.response);
        if status != 200 {
            return Err(self.unexpected(format!("{} response", status)));
        }
        match event.response.cseq_method() {
            Some(Method::Info) => self.relay_info_response(responder, &event),
            other => Err(self.unexpected(format!("200 response for {:?}", other))),
        }
    }

    /// ACK arriving after the session went up.
    pub(super) fn ongoing_ack(&mut self, event: RequestEvent) -> Result<()> {
        let sender = self.leg_for(event.token.as_ref(), "ACK")?;
        let next = self.next_of(sender)?;
        if self.leg(next).state == LegState::Acked {
            debug!(session = %self.ctx.key, leg = %self.leg(next), "ACK already sent, skip forwarding");
            return Ok(());
        }
        let out = self.out;
        debug!(session = %self.ctx.key, leg = %self.leg(next), "forwarding late ACK");
        self.leg_mut(next).send_ack(out, &event.request)
    }
}
