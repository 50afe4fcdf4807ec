//! Liveness probing of application servers.
//!
//! An out-of-dialog OPTIONS addressed to `alias1_alias2@...` asks the broker
//! whether every listed service has at least one reachable endpoint. The
//! session walks the aliases in order and probes one endpoint at a time.
use crate::{
    broker::{BrokerContext, SessionKey},
    routing::Endpoint,
    sip::{
        message::{self, status_of},
        CorrelationToken, Interface, RequestEvent, ResponseEvent, TimeoutEvent, TransactionId,
        TransactionRole, TransportEvent,
    },
};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Endpoints still to try for one alias.
struct Target {
    alias: String,
    interface: Interface,
    endpoints: VecDeque<Endpoint>,
}

pub struct PingSession {
    key: SessionKey,
    aliases: Vec<String>,
    targets: VecDeque<Target>,
    /// The OPTIONS being answered.
    request: Option<RequestEvent>,
    outstanding: Option<TransactionId>,
    finished: bool,
}

impl PingSession {
    pub fn new(key: SessionKey, aliases: Vec<String>) -> Self {
        Self {
            key,
            aliases,
            targets: VecDeque::new(),
            request: None,
            outstanding: None,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn handle_event(&mut self, env: &BrokerContext, event: TransportEvent) {
        if self.finished {
            debug!(session = %self.key, "{} after ping completed", event.describe());
            return;
        }
        match event {
            TransportEvent::Request(event) if self.request.is_none() => self.start(env, event),
            TransportEvent::Request(event) => {
                debug!(session = %self.key, "{} ignored while probing", event.request.method);
            }
            TransportEvent::Response(event) => self.on_response(env, event),
            TransportEvent::Timeout(event) => self.on_timeout(env, event),
            other => debug!(session = %self.key, "{} ignored", other.describe()),
        }
    }

    fn start(&mut self, env: &BrokerContext, event: RequestEvent) {
        env.counters.ping_started();
        self.request = Some(event);
        let routing = env.routing.snapshot();
        let mut targets = VecDeque::new();
        for alias in &self.aliases {
            match routing.directory.get(alias) {
                Some(service) if !service.endpoints.is_empty() => targets.push_back(Target {
                    alias: alias.clone(),
                    interface: service.interface(),
                    endpoints: service.endpoints.iter().cloned().collect(),
                }),
                _ => {
                    warn!(session = %self.key, alias = %alias, "ping for unknown alias");
                    let reason = format!("Unknown alias {}", alias);
                    self.complete(env, 400, Some(&reason));
                    return;
                }
            }
        }
        if targets.is_empty() {
            self.complete(env, 400, Some("No alias to probe"));
            return;
        }
        self.targets = targets;
        self.probe_next(env);
    }

    /// Sends the next probe, moving past endpoints that cannot be reached
    /// and past aliases that already answered.
    fn probe_next(&mut self, env: &BrokerContext) {
        loop {
            let Some(target) = self.targets.front_mut() else {
                info!(session = %self.key, "all aliases reachable");
                self.complete(env, 200, None);
                return;
            };
            let Some(endpoint) = target.endpoints.pop_front() else {
                let reason = format!("No endpoint available for alias {}", target.alias);
                warn!(session = %self.key, alias = %target.alias, "no reachable endpoint");
                self.complete(env, 404, Some(&reason));
                return;
            };
            let call_id = env.transport.new_call_id();
            let token = CorrelationToken::new(self.key.clone(), None);
            let sent = message::options_probe(&endpoint.uri, &call_id, &env.contact)
                .and_then(|probe| env.transport.send_request(target.interface, probe, token));
            match sent {
                Ok(tx) => {
                    debug!(session = %self.key, alias = %target.alias, endpoint = %endpoint.uri, "probe sent");
                    self.outstanding = Some(tx);
                    return;
                }
                Err(e) => {
                    warn!(session = %self.key, alias = %target.alias, endpoint = %endpoint.uri, "probe not sent: {}", e);
                }
            }
        }
    }

    fn is_outstanding(&self, tx: &TransactionId) -> bool {
        self.outstanding.as_ref() == Some(tx)
    }

    fn on_response(&mut self, env: &BrokerContext, event: ResponseEvent) {
        if !self.is_outstanding(&event.client_tx) {
            debug!(session = %self.key, "response for a stale probe");
            return;
        }
        let status = status_of(&event.response);
        if status < 200 {
            return;
        }
        self.outstanding = None;
        if (200..300).contains(&status) {
            if let Some(done) = self.targets.pop_front() {
                debug!(session = %self.key, alias = %done.alias, "alias reachable");
            }
        } else {
            debug!(session = %self.key, status, "probe rejected, trying next endpoint");
        }
        self.probe_next(env);
    }

    fn on_timeout(&mut self, env: &BrokerContext, event: TimeoutEvent) {
        if event.role != TransactionRole::Client || !self.is_outstanding(&event.transaction) {
            return;
        }
        debug!(session = %self.key, "probe timed out, trying next endpoint");
        self.outstanding = None;
        self.probe_next(env);
    }

    fn complete(&mut self, env: &BrokerContext, status: u16, reason: Option<&str>) {
        self.finished = true;
        self.targets.clear();
        if status == 200 {
            env.counters.ping_succeeded();
        } else {
            env.counters.ping_failed();
        }
        let Some(request) = self.request.take() else {
            return;
        };
        let response = match reason {
            Some(reason) => message::response_with_reason(&request.request, status, reason),
            None => message::response_to(&request.request, status),
        };
        let sent = match &request.server_tx {
            Some(tx) => env.transport.send_response(tx, response),
            None => env
                .transport
                .send_stateless_response(request.interface, response),
        };
        if let Err(e) = sent {
            warn!(session = %self.key, "unable to answer ping: {}", e);
        }
    }
}
