use super::{DialogSide, Fsm};
use crate::{
    error::{Result, TransportError},
    orchestration::leg::{LegId, LegState, PendingRequest},
    sip::{
        message::{self, MessageExt},
        RequestEvent, ResponseEvent,
    },
};
use tracing::{debug, warn};

impl Fsm<'_> {
    /// INFO travels hop by hop, except `x-fci` INFO which goes straight to
    /// the IM-SCF on the far side.
    pub(super) fn relay_info(&mut self, event: RequestEvent) -> Result<()> {
        let sender = self.leg_for(event.token.as_ref(), "INFO")?;
        let server_tx = event
            .server_tx
            .clone()
            .ok_or_else(|| TransportError::send("INFO", "no server transaction"))?;
        let from_outgoing =
            event.dialog.is_some() && event.dialog == self.leg(sender).outgoing_dialog;
        self.leg_mut(sender).pending_info = Some(PendingRequest {
            server_tx,
            request: event.request.clone(),
        });
        let out = self.out;

        if event.request.flag(message::X_FCI) {
            if from_outgoing {
                let a = self.ctx.chain.a();
                debug!(session = %self.ctx.key, "FCI INFO toward IM-SCF A");
                return self.relay_request(a, DialogSide::Incoming, &event.request, Some(sender));
            }
            let b = self.ctx.chain.b();
            if self.leg(b).state == LegState::Terminated {
                warn!(session = %self.ctx.key, "IM-SCF B already terminated, answering 481");
                self.leg_mut(sender).answer_pending_requests(out, 481);
                return Ok(());
            }
            debug!(session = %self.ctx.key, "FCI INFO toward IM-SCF B");
            return self.relay_request(b, DialogSide::Outgoing, &event.request, Some(sender));
        }

        if from_outgoing {
            let prev = self.prev_of(sender)?;
            return self.relay_request(prev, DialogSide::Incoming, &event.request, None);
        }
        let next = self.next_of(sender)?;
        if self.leg(next).state == LegState::Terminated {
            warn!(session = %self.ctx.key, leg = %self.leg(next), "next INFO leg already terminated, answering 481");
            self.leg_mut(sender).answer_pending_requests(out, 481);
            return Ok(());
        }
        self.relay_request(next, DialogSide::Outgoing, &event.request, None)
    }

    /// Routes an INFO response back to whoever sent the INFO.
    pub(super) fn relay_info_response(&mut self, responder: LegId, event: &ResponseEvent) -> Result<()> {
        let special = self.leg_mut(responder).special_info_sender.take();
        let target = if let Some(special) = special {
            debug!(session = %self.ctx.key, leg = %self.leg(special), "FCI INFO response");
            special
        } else if event.dialog.is_some() && event.dialog == self.leg(responder).incoming_dialog {
            self.next_of(responder)?
        } else {
            self.prev_of(responder)?
        };
        let out = self.out;
        self.leg_mut(target).forward_info_response(out, &event.response)
    }
}
