use super::Fsm;
use crate::{
    error::Result,
    orchestration::leg::{LegId, LegState},
    sip::{message::status_of, ResponseEvent, TransactionRole, TransportEvent},
};
use rsip::Method;
use tracing::debug;

impl Fsm<'_> {
    /// After an internal error only dialog bookkeeping and deferred
    /// CANCELs are still acted upon.
    pub(super) fn internal_error_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::DialogTimeout(e) | TransportEvent::DialogTerminated(e) => {
                self.check_and_remove(&e.dialog);
            }
            TransportEvent::Timeout(e)
                if e.role == TransactionRole::Client && e.method == Method::Invite =>
            {
                if let Some(dialog) = &e.dialog {
                    self.check_and_remove(dialog);
                }
            }
            TransportEvent::Response(e) => self.cancel_deferred(&e),
            other => {
                debug!(session = %self.ctx.key, "{} ignored while cleaning up", other.describe());
            }
        }
    }

    fn cancel_deferred(&mut self, event: &ResponseEvent) {
        let Some(id) = event.token.as_ref().and_then(|t| t.leg) else {
            return;
        };
        let Some(leg) = self.ctx.chain.get(id) else {
            return;
        };
        if leg.state != LegState::SetToCancel {
            debug!(session = %self.ctx.key, leg = %leg, "response needs no action");
            return;
        }
        let out = self.out;
        let status = status_of(&event.response);
        let sent = if status < 200 {
            leg.send_cancel(out)
        } else if status < 420 {
            leg.send_bye(out)
        } else {
            Ok(())
        };
        if let Err(e) = sent {
            debug!(session = %self.ctx.key, leg = %leg, "unable to clear leg: {}", e);
        }
    }

    /// Responses still arriving after setup ended are passed back so the
    /// chain can complete.
    pub(super) fn end_response(&mut self, responder: LegId, event: ResponseEvent) -> Result<()> {
        let prev = self.prev_of(responder)?;
        self.leg_mut(responder).state = LegState::Terminated;
        let out = self.out;
        self.leg_mut(prev).forward_response(out, &event.response)
    }
}
