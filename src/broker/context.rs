use super::registry::{SessionKey, SessionRegistry};
use crate::{
    metrics::UsageCounters,
    orchestration::Outbound,
    routing::RoutingStore,
    scheduler::WorkerPool,
    sip::SignalingTransport,
};
use std::sync::Arc;

/// State shared by every session of one broker.
pub struct BrokerContext {
    pub transport: Arc<dyn SignalingTransport>,
    /// Contact header value of the broker.
    pub contact: String,
    /// Default route toward the IM-SCF.
    pub imscf_route: rsip::UriWithParams,
    pub routing: RoutingStore,
    pub registry: SessionRegistry,
    pub counters: UsageCounters,
    pub pool: WorkerPool,
}

pub type BrokerContextRef = Arc<BrokerContext>;

impl BrokerContext {
    pub fn outbound<'a>(&'a self, session: &'a SessionKey) -> Outbound<'a> {
        Outbound {
            transport: self.transport.as_ref(),
            contact: &self.contact,
            imscf_route: &self.imscf_route,
            session,
        }
    }
}
