use super::{
    context::{BrokerContext, BrokerContextRef},
    registry::SessionKey,
};
use crate::{
    auxiliary::AuxiliarySession,
    orchestration::{Fsm, SessionContext},
    ping::PingSession,
    scheduler::{Delivery, Mailbox, Rejected},
    sip::TransportEvent,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

pub enum SessionBody {
    Orchestrated(SessionContext),
    Auxiliary(AuxiliarySession),
    Ping(PingSession),
}

/// A registry entry: the session state plus the mailbox serializing its events.
///
/// The body lock is only ever taken by the mailbox's drain routine, so it
/// is never contended.
pub struct Session {
    key: SessionKey,
    mailbox: Arc<Mailbox<TransportEvent>>,
    body: Mutex<SessionBody>,
}

impl Session {
    fn new(key: SessionKey, body: SessionBody) -> Self {
        Self {
            key,
            mailbox: Arc::new(Mailbox::new()),
            body: Mutex::new(body),
        }
    }

    pub fn orchestrated(context: SessionContext) -> Self {
        Self::new(context.key.clone(), SessionBody::Orchestrated(context))
    }

    pub fn auxiliary(key: SessionKey) -> Self {
        Self::new(key.clone(), SessionBody::Auxiliary(AuxiliarySession::new(key)))
    }

    pub fn ping(key: SessionKey, aliases: Vec<String>) -> Self {
        Self::new(key.clone(), SessionBody::Ping(PingSession::new(key, aliases)))
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn mailbox(&self) -> &Mailbox<TransportEvent> {
        &self.mailbox
    }

    /// Queues `event` for processing on the broker's worker pool.
    pub fn enqueue(
        self: &Arc<Self>,
        env: &BrokerContextRef,
        event: TransportEvent,
    ) -> Result<Delivery, Rejected<TransportEvent>> {
        let session = self.clone();
        let handler_env = env.clone();
        self.mailbox.enqueue(&env.pool, event, move |event| {
            session.process(&handler_env, event)
        })
    }

    fn process(self: &Arc<Self>, env: &BrokerContext, event: TransportEvent) {
        let finished = {
            let mut body = self.body.lock();
            match &mut *body {
                SessionBody::Orchestrated(context) => {
                    let out = env.outbound(&self.key);
                    Fsm::new(context, &out, &env.counters).handle_event(event);
                    context.finished
                }
                SessionBody::Auxiliary(aux) => {
                    aux.handle_event(env, event);
                    aux.is_finished()
                }
                SessionBody::Ping(ping) => {
                    ping.handle_event(env, event);
                    ping.is_finished()
                }
            }
        };
        if finished && env.registry.remove(&self.key, self) {
            debug!(session = %self.key, "session removed");
        }
    }

    /// Read access to the session state, for inspection.
    pub fn inspect<R>(&self, f: impl FnOnce(&SessionBody) -> R) -> R {
        f(&self.body.lock())
    }
}
