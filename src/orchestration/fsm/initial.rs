use super::Fsm;
use crate::{
    error::{BrokerError, Result},
    orchestration::context::SessionState,
    sip::{message, RequestEvent},
};
use rsip::Request;
use tracing::{debug, error, warn};

impl Fsm<'_> {
    /// First INVITE from IM-SCF A: invite the first service of the chain.
    pub(super) fn initial_invite(&mut self, event: RequestEvent) -> Result<()> {
        match self.invite_first_leg(&event.request) {
            Ok(()) => {
                self.ctx.state = SessionState::Chaining;
            }
            Err(e) => {
                error!(session = %self.ctx.key, "unable to send first INVITE: {}", e);
                let response = message::response_with_reason(
                    &event.request,
                    500,
                    &format!("ServiceBroker error: {}", e),
                );
                if let Err(e) = self
                    .out
                    .transport
                    .send_stateless_response(event.interface, response)
                {
                    warn!(session = %self.ctx.key, "unable to send error response: {}", e);
                }
                self.ctx.state = SessionState::End;
            }
        }
        Ok(())
    }

    fn invite_first_leg(&mut self, request: &Request) -> Result<()> {
        let first = self
            .ctx
            .chain
            .first()
            .ok_or_else(|| BrokerError::unexpected("Initial", "chain without services"))?;
        self.ctx.current = first;
        debug!(session = %self.ctx.key, leg = %self.leg(first), "inviting first service");
        let out = self.out;
        let dialog = self.leg_mut(first).process_outgoing_invite(out, request)?;
        self.ctx.pending_dialogs.insert(dialog);
        Ok(())
    }
}
