use crate::broker::{Broker, BrokerBuilder, SessionKey};
use crate::config::{Config, RulesetConfig, ServiceConfig};
use crate::error::TransportError;
use crate::metrics::UsageCounters;
use crate::orchestration::{Fsm, LegId, Outbound, SessionContext};
use crate::routing::{ErrorPolicy, RoutingSnapshot};
use crate::sip::message::{self, MessageExt};
use crate::sip::{
    CorrelationToken, DialogEvent, DialogId, Interface, OutgoingDialog, RequestEvent,
    ResponseEvent, SignalingTransport, TimeoutEvent, TransactionId, TransactionRole,
    TransportEvent,
};
use parking_lot::Mutex;
use rsip::prelude::*;
use rsip::{headers, typed, Header, Method, Request, Response, UriWithParams};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const CONTACT: &str = "<sip:10.0.0.10:5060;transport=udp>";

/// One message handed to the transport.
#[derive(Debug, Clone)]
pub enum Sent {
    DialogRequest {
        interface: Interface,
        request: Request,
        token: CorrelationToken,
        dialog: DialogId,
        tx: TransactionId,
    },
    Request {
        interface: Interface,
        request: Request,
        token: CorrelationToken,
        tx: TransactionId,
    },
    InDialog {
        dialog: DialogId,
        request: Request,
        token: CorrelationToken,
        tx: TransactionId,
    },
    Prack {
        dialog: DialogId,
        tx: TransactionId,
    },
    Ack {
        dialog: DialogId,
        cseq: u32,
    },
    Cancel {
        invite: TransactionId,
    },
    Response {
        server_tx: TransactionId,
        response: Response,
    },
    Reliable {
        server_tx: TransactionId,
        response: Response,
    },
    Stateless {
        interface: Interface,
        response: Response,
    },
}

/// Transport double recording every outbound message. New requests whose
/// request-uri or first route contains an `unreachable` marker fail to send.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
    bound: Mutex<HashMap<DialogId, CorrelationToken>>,
    unreachable: Mutex<Vec<String>>,
    fail_all: AtomicBool,
    handles: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn make_unreachable(&self, marker: &str) {
        self.unreachable.lock().push(marker.to_string());
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    fn handle(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.handles.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn check(&self, what: &str, request: Option<&Request>) -> Result<(), TransportError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(TransportError::send(what, "transport down"));
        }
        if let Some(request) = request {
            let first_route = routes(request).into_iter().next().unwrap_or_default();
            let target = format!("{} {}", request.uri, first_route);
            if self.unreachable.lock().iter().any(|m| target.contains(m)) {
                return Err(TransportError::send(what, "unreachable"));
            }
        }
        Ok(())
    }

    fn record(&self, sent: Sent) {
        self.sent.lock().push(sent);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&Sent) -> bool) -> usize {
        self.sent.lock().iter().filter(|s| pred(s)).count()
    }

    pub fn token_of(&self, dialog: &DialogId) -> Option<CorrelationToken> {
        self.bound.lock().get(dialog).cloned()
    }

    /// INVITEs that opened a new dialog, in sending order.
    pub fn invites(&self) -> Vec<(Request, DialogId, TransactionId, CorrelationToken)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::DialogRequest {
                    request,
                    dialog,
                    tx,
                    token,
                    ..
                } => Some((request.clone(), dialog.clone(), tx.clone(), token.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn probes(&self) -> Vec<(Request, TransactionId, CorrelationToken)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Request {
                    request, tx, token, ..
                } => Some((request.clone(), tx.clone(), token.clone())),
                _ => None,
            })
            .collect()
    }

    /// Status codes sent on `server_tx`.
    pub fn statuses_on(&self, server_tx: &str) -> Vec<u16> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Response { server_tx: tx, response }
                | Sent::Reliable { server_tx: tx, response }
                    if tx.0 == server_tx =>
                {
                    Some(message::status_of(response))
                }
                _ => None,
            })
            .collect()
    }

    pub fn stateless_statuses(&self) -> Vec<u16> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Stateless { response, .. } => Some(message::status_of(response)),
                _ => None,
            })
            .collect()
    }

    /// In-dialog requests of `method`, in sending order.
    pub fn in_dialog(
        &self,
        method: Method,
    ) -> Vec<(Request, DialogId, TransactionId, CorrelationToken)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::InDialog {
                    dialog,
                    request,
                    tx,
                    token,
                } if request.method == method => {
                    Some((request.clone(), dialog.clone(), tx.clone(), token.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

impl SignalingTransport for RecordingTransport {
    fn new_call_id(&self) -> String {
        self.handle("call")
    }

    fn send_dialog_request(
        &self,
        interface: Interface,
        request: Request,
        token: CorrelationToken,
    ) -> Result<OutgoingDialog, TransportError> {
        self.check("INVITE", Some(&request))?;
        let dialog = DialogId(self.handle("out"));
        let tx = TransactionId(self.handle("ct"));
        self.bound.lock().insert(dialog.clone(), token.clone());
        self.record(Sent::DialogRequest {
            interface,
            request,
            token,
            dialog: dialog.clone(),
            tx: tx.clone(),
        });
        Ok(OutgoingDialog {
            dialog,
            transaction: tx,
        })
    }

    fn send_request(
        &self,
        interface: Interface,
        request: Request,
        token: CorrelationToken,
    ) -> Result<TransactionId, TransportError> {
        self.check("OPTIONS", Some(&request))?;
        let tx = TransactionId(self.handle("ct"));
        self.record(Sent::Request {
            interface,
            request,
            token,
            tx: tx.clone(),
        });
        Ok(tx)
    }

    fn send_in_dialog(
        &self,
        dialog: &DialogId,
        mut request: Request,
        token: CorrelationToken,
    ) -> Result<TransactionId, TransportError> {
        self.check(&request.method.to_string(), None)?;
        request.headers.unique_push(
            typed::CSeq {
                seq: message::next_sequence(),
                method: request.method.clone(),
            }
            .into(),
        );
        let tx = TransactionId(self.handle("ct"));
        self.record(Sent::InDialog {
            dialog: dialog.clone(),
            request,
            token,
            tx: tx.clone(),
        });
        Ok(tx)
    }

    fn send_prack(
        &self,
        dialog: &DialogId,
        _reliable: &Response,
        _token: CorrelationToken,
    ) -> Result<TransactionId, TransportError> {
        self.check("PRACK", None)?;
        let tx = TransactionId(self.handle("ct"));
        self.record(Sent::Prack {
            dialog: dialog.clone(),
            tx: tx.clone(),
        });
        Ok(tx)
    }

    fn send_ack(&self, dialog: &DialogId, cseq: u32, _ack: Request) -> Result<(), TransportError> {
        self.check("ACK", None)?;
        self.record(Sent::Ack {
            dialog: dialog.clone(),
            cseq,
        });
        Ok(())
    }

    fn send_cancel(
        &self,
        invite: &TransactionId,
        _token: CorrelationToken,
    ) -> Result<TransactionId, TransportError> {
        self.check("CANCEL", None)?;
        self.record(Sent::Cancel {
            invite: invite.clone(),
        });
        Ok(TransactionId(self.handle("ct")))
    }

    fn send_response(
        &self,
        server_tx: &TransactionId,
        response: Response,
    ) -> Result<(), TransportError> {
        self.check("response", None)?;
        self.record(Sent::Response {
            server_tx: server_tx.clone(),
            response,
        });
        Ok(())
    }

    fn send_reliable_provisional(
        &self,
        _dialog: &DialogId,
        server_tx: &TransactionId,
        response: Response,
    ) -> Result<(), TransportError> {
        self.check("reliable provisional", None)?;
        self.record(Sent::Reliable {
            server_tx: server_tx.clone(),
            response,
        });
        Ok(())
    }

    fn send_stateless_response(
        &self,
        interface: Interface,
        response: Response,
    ) -> Result<(), TransportError> {
        self.record(Sent::Stateless {
            interface,
            response,
        });
        Ok(())
    }

    fn bind_dialog(&self, dialog: &DialogId, token: CorrelationToken) {
        self.bound.lock().insert(dialog.clone(), token);
    }
}

/// Route entries of `request` in their wire form, first one first.
pub fn routes(request: &Request) -> Vec<String> {
    request.route_set().iter().map(ToString::to_string).collect()
}

/// Initial INVITE as IM-SCF A sends it, routed through the broker with
/// service key `key`.
pub fn imscf_invite(call_id: &str, branch: &str, key: &str) -> Request {
    let headers: Vec<Header> = vec![
        headers::Via::new(format!("SIP/2.0/UDP 10.0.0.20:5060;branch={}", branch)).into(),
        headers::From::new("<sip:alice@example.com>;tag=fa").into(),
        headers::To::new("<sip:bob@example.com>").into(),
        headers::CallId::new(call_id).into(),
        headers::CSeq::new("1 INVITE").into(),
        headers::Contact::new("<sip:10.0.0.20:5060>").into(),
        headers::Route::new(format!("<sip:10.0.0.10:5060;lr;x-servicekey={};orig>", key)).into(),
        headers::Route::new("<sip:10.0.0.20:5060;lr>").into(),
        headers::ContentType::new("application/sdp").into(),
    ];
    Request {
        method: Method::Invite,
        uri: "sip:bob@example.com".try_into().unwrap(),
        version: rsip::Version::V2,
        headers: headers.into(),
        body: b"v=0".to_vec(),
    }
}

/// The INVITE an application server sends back after receiving `received`:
/// same application headers, its own dialog and branch, first route popped.
pub fn as_invite(received: &Request, call_id: &str, branch: &str) -> Request {
    let mut request = received.clone();
    let kept = message::routes_after_first(&request);
    request.headers.retain(|h| !matches!(h, Header::Route(_)));
    for route in kept {
        request.headers.push(typed::Route(vec![route].into()).into());
    }
    request
        .headers
        .push(headers::Via::new(format!("SIP/2.0/UDP 10.0.9.9:5070;branch={}", branch)).into());
    request.headers.unique_push(headers::CallId::new(call_id).into());
    request
}

pub fn request_event(
    request: Request,
    server_tx: &str,
    dialog: &str,
    token: Option<CorrelationToken>,
    interface: Interface,
) -> TransportEvent {
    TransportEvent::Request(RequestEvent {
        server_tx: (request.method != Method::Ack).then(|| TransactionId(server_tx.to_string())),
        request,
        dialog: Some(DialogId(dialog.to_string())),
        token,
        interface,
    })
}

/// In-dialog request of `method` arriving on `dialog`.
pub fn in_dialog_request(method: Method, branch: &str, cseq: u32) -> Request {
    let headers: Vec<Header> = vec![
        headers::Via::new(format!("SIP/2.0/UDP 10.0.9.9:5070;branch={}", branch)).into(),
        headers::From::new("<sip:alice@example.com>;tag=fa").into(),
        headers::To::new("<sip:bob@example.com>;tag=tb").into(),
        headers::CallId::new("dialog-call").into(),
        typed::CSeq {
            seq: cseq,
            method: method.clone(),
        }
        .into(),
    ];
    Request {
        method,
        uri: "sip:10.0.0.10:5060".try_into().unwrap(),
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    }
}

pub fn response_event(
    request: &Request,
    status: u16,
    client_tx: &TransactionId,
    dialog: &DialogId,
    token: &CorrelationToken,
) -> TransportEvent {
    TransportEvent::Response(ResponseEvent {
        response: message::response_to(request, status),
        client_tx: client_tx.clone(),
        dialog: Some(dialog.clone()),
        token: Some(token.clone()),
    })
}

pub fn client_timeout(
    method: Method,
    transaction: &TransactionId,
    dialog: Option<&DialogId>,
    token: &CorrelationToken,
) -> TransportEvent {
    TransportEvent::Timeout(TimeoutEvent {
        transaction: transaction.clone(),
        role: TransactionRole::Client,
        method,
        dialog: dialog.cloned(),
        token: Some(token.clone()),
    })
}

pub fn dialog_terminated(dialog: &DialogId, token: Option<CorrelationToken>) -> TransportEvent {
    TransportEvent::DialogTerminated(DialogEvent {
        dialog: dialog.clone(),
        token,
    })
}

/// Configuration with one single-endpoint service per alias (endpoint
/// `sip:<alias>.local:5070`) and a ruleset `100` chaining them.
pub fn config(aliases: &[&str], default: ErrorPolicy, skip: &[u16], stop: &[u16]) -> Config {
    let mut config = Config::default();
    config.broker.hostname = "10.0.0.10".to_string();
    config.broker.imscf_host = "10.0.0.20".to_string();
    config.broker.imscf_port = 5060;
    config.broker.initial_threads = 2;
    config.broker.max_threads = 4;
    config.broker.queue_max_size = 64;
    config.services = aliases
        .iter()
        .map(|alias| ServiceConfig {
            alias: alias.to_string(),
            external: false,
            endpoints: vec![format!("sip:{}.local:5070", alias)],
        })
        .collect();
    config.rulesets = vec![RulesetConfig {
        service_key: "100".to_string(),
        default_error_handling: default,
        services: aliases.iter().map(|a| a.to_string()).collect(),
        skip_codes: skip.to_vec(),
        stop_codes: stop.to_vec(),
    }];
    config
}

pub fn broker(config: Config, transport: Arc<RecordingTransport>) -> Broker {
    BrokerBuilder::new()
        .config(config)
        .transport(transport)
        .build()
        .unwrap()
}

pub fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Drives one orchestrated session synchronously, without dispatcher or pool.
pub struct Harness {
    pub transport: Arc<RecordingTransport>,
    pub ctx: SessionContext,
    pub counters: UsageCounters,
    imscf_route: UriWithParams,
}

impl Harness {
    pub fn new(config: &Config) -> Self {
        let routing = Arc::new(RoutingSnapshot::from_config(config).unwrap());
        let ruleset = routing.ruleset("100").unwrap();
        let key = SessionKey::Orchestrated("test-session".to_string());
        Self {
            transport: RecordingTransport::new(),
            ctx: SessionContext::new(key, ruleset, routing).unwrap(),
            counters: UsageCounters::new(),
            imscf_route: config.broker.imscf_route().unwrap(),
        }
    }

    pub fn handle(&mut self, event: TransportEvent) {
        let key = self.ctx.key.clone();
        let out = Outbound {
            transport: self.transport.as_ref(),
            contact: CONTACT,
            imscf_route: &self.imscf_route,
            session: &key,
        };
        Fsm::new(&mut self.ctx, &out, &self.counters).handle_event(event);
    }

    pub fn fail(&mut self, error: crate::error::BrokerError) {
        let key = self.ctx.key.clone();
        let out = Outbound {
            transport: self.transport.as_ref(),
            contact: CONTACT,
            imscf_route: &self.imscf_route,
            session: &key,
        };
        Fsm::new(&mut self.ctx, &out, &self.counters).fail(error);
    }

    /// Aliases along the current path, IM-SCF legs included.
    pub fn path(&self) -> Vec<String> {
        self.ctx
            .chain
            .path()
            .into_iter()
            .map(|id| self.ctx.chain.leg(id).to_string())
            .collect()
    }

    pub fn leg_named(&self, name: &str) -> LegId {
        self.ctx
            .chain
            .path()
            .into_iter()
            .find(|id| self.ctx.chain.leg(*id).to_string() == name)
            .unwrap()
    }

    /// Sends the initial INVITE from IM-SCF A on dialog `in-a`, transaction `st-a`.
    pub fn start(&mut self) -> Request {
        let invite = imscf_invite("call-a", "z9hG4bK-a", "100");
        self.handle(request_event(
            invite.clone(),
            "st-a",
            "in-a",
            None,
            Interface::External,
        ));
        invite
    }

    /// The application server reached by the `n`-th outgoing INVITE sends
    /// its own INVITE back on dialog `in-<n>`, transaction `st-<n>`.
    pub fn invite_back(&mut self, n: usize) {
        let (request, ..) = self.transport.invites()[n].clone();
        let back = as_invite(&request, &format!("call-{}", n), &format!("z9hG4bK-{}", n));
        self.handle(request_event(
            back,
            &format!("st-{}", n),
            &format!("in-{}", n),
            None,
            Interface::Internal,
        ));
    }

    /// Final or provisional answer to the `n`-th outgoing INVITE.
    pub fn answer(&mut self, n: usize, status: u16) {
        let (request, dialog, tx, token) = self.transport.invites()[n].clone();
        self.handle(response_event(&request, status, &tx, &dialog, &token));
    }
}
