use crate::error::{BrokerError, TransportError};
use rand::{distr::Alphanumeric, Rng};
use rsip::{
    headers, param::Tag, prelude::*, typed, Header, Headers, Method, Param, Request, Response,
    StatusCode, UriWithParams,
};
use std::sync::atomic::{AtomicU32, Ordering};

pub const P_ORIGINAL_DIALOG_ID: &str = "P-Original-Dialog-ID";
pub const X_MRF: &str = "x-mrf";
pub const X_ICA: &str = "x-ica";
pub const X_FCI: &str = "x-fci";
pub const X_AS: &str = "x-as";
pub const X_SERVICEKEY: &str = "x-servicekey";
pub const TAG_100REL: &str = "100rel";
pub const MAX_FORWARDS: u32 = 70;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Next CSeq number for a request that opens a new dialog.
pub fn next_sequence() -> u32 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1
}

pub fn random_tag() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

/// Values of an extension header rsip has no variant for.
pub fn extension_values<'a>(headers: &'a Headers, name: &'a str) -> impl Iterator<Item = &'a str> {
    headers.iter().filter_map(move |header| match header {
        Header::Other(key, value) if key.eq_ignore_ascii_case(name) => Some(value.as_str()),
        _ => None,
    })
}

pub fn extension_header<'a>(headers: &'a Headers, name: &'a str) -> Option<&'a str> {
    extension_values(headers, name).next()
}

/// Headers owned by the dialog layer, never copied between legs.
pub fn is_dialog_header(header: &Header) -> bool {
    matches!(
        header,
        Header::From(_)
            | Header::To(_)
            | Header::CallId(_)
            | Header::CSeq(_)
            | Header::Via(_)
            | Header::Route(_)
            | Header::RecordRoute(_)
            | Header::ContentLength(_)
            | Header::Contact(_)
            | Header::MaxForwards(_)
    )
}

/// Route toward `uri` with the loose-routing flag set.
pub fn loose_route(mut uri: rsip::Uri) -> UriWithParams {
    if !uri.params.contains(&Param::Lr) {
        uri.params.push(Param::Lr);
    }
    UriWithParams {
        uri,
        params: vec![],
    }
}

/// Looks a parameter up inside the route's URI, then on the entry itself.
/// A flag parameter yields `Some(None)`.
pub fn route_param<'a>(route: &'a UriWithParams, name: &str) -> Option<Option<&'a str>> {
    route
        .uri
        .params
        .iter()
        .chain(route.params.iter())
        .find_map(|param| match param {
            Param::Other(key, value) if key.value().eq_ignore_ascii_case(name) => {
                Some(value.as_ref().map(|v| v.value()))
            }
            _ => None,
        })
}

/// Read access shared by requests and responses.
pub trait MessageExt: HeadersExt {
    fn extension(&self, name: &str) -> Option<String> {
        extension_values(self.headers(), name)
            .next()
            .map(str::to_string)
    }

    fn has_extension(&self, name: &str) -> bool {
        extension_values(self.headers(), name).next().is_some()
    }

    /// True when the header is present with value `true`.
    fn flag(&self, name: &str) -> bool {
        extension_values(self.headers(), name).any(|v| v.trim().eq_ignore_ascii_case("true"))
    }

    fn call_id(&self) -> Option<String> {
        self.call_id_header().ok().map(|h| h.value().to_string())
    }

    fn cseq(&self) -> Option<typed::CSeq> {
        self.cseq_header().ok()?.typed().ok()
    }

    fn cseq_method(&self) -> Option<Method> {
        self.cseq().map(|c| c.method)
    }

    fn from_tag(&self) -> Option<String> {
        let tag = self.from_header().ok()?.tag().ok()??;
        Some(tag.value().to_string())
    }

    fn to_tag(&self) -> Option<String> {
        let tag = self.to_header().ok()?.tag().ok()??;
        Some(tag.value().to_string())
    }

    fn top_via_branch(&self) -> Option<String> {
        let branch = self.transaction_id().ok()??;
        Some(branch.value().to_string())
    }

    /// Every Route entry in order, whether listed in one header or several.
    fn route_set(&self) -> Vec<UriWithParams> {
        self.headers()
            .iter()
            .filter_map(|header| match header {
                Header::Route(route) => route.typed().ok(),
                _ => None,
            })
            .flat_map(|route| Vec::from(route.0))
            .collect()
    }

    /// `Require: 100rel` present.
    fn requires_100rel(&self) -> bool {
        self.headers().iter().any(|header| match header {
            Header::Require(require) => require
                .value()
                .split(',')
                .any(|tag| tag.trim().eq_ignore_ascii_case(TAG_100REL)),
            _ => false,
        })
    }
}

impl MessageExt for Request {}
impl MessageExt for Response {}

pub fn status_of(response: &Response) -> u16 {
    response.status_code.code()
}

fn copy_application_headers(from: &Headers, to: &mut Headers) {
    for header in from.iter().filter(|h| !is_dialog_header(h)) {
        to.push(header.clone());
    }
}

fn push_body(headers: &mut Headers, body: &[u8]) {
    headers.push(headers::ContentLength::new(body.len().to_string()).into());
}

/// Response to `request` with the given status, carrying only the
/// transaction identity headers.
pub fn response_to(request: &Request, status: u16) -> Response {
    let mut headers: Headers = request
        .headers
        .iter()
        .filter(|h| {
            matches!(
                h,
                Header::Via(_) | Header::From(_) | Header::To(_) | Header::CallId(_) | Header::CSeq(_)
            )
        })
        .cloned()
        .collect::<Vec<_>>()
        .into();
    push_body(&mut headers, &[]);
    Response {
        status_code: StatusCode::from(status),
        version: rsip::Version::V2,
        headers,
        body: vec![],
    }
}

/// Response to `request` with a human readable reason attached as a warning.
pub fn response_with_reason(request: &Request, status: u16, reason: &str) -> Response {
    let mut response = response_to(request, status);
    response
        .headers
        .push(headers::Warning::new(format!("399 sipbroker \"{}\"", reason)).into());
    response
}

/// Copies an upstream response onto the pending `request` of another leg.
pub fn forwarded_response(upstream: &Response, request: &Request, broker_contact: &str) -> Response {
    let status = status_of(upstream);
    let mut response = response_to(request, status);
    response
        .headers
        .retain(|h| !matches!(h, Header::ContentLength(_)));
    copy_application_headers(&upstream.headers, &mut response.headers);
    let upstream_contacts = upstream.contact_headers();
    if !upstream_contacts.is_empty() {
        if (300..400).contains(&status) {
            for contact in upstream_contacts {
                response.headers.push(Header::Contact(contact.clone()));
            }
        } else {
            response
                .headers
                .push(headers::Contact::new(broker_contact).into());
        }
    }
    response.body = upstream.body.clone();
    push_body(&mut response.headers, &upstream.body);
    response
}

/// Request template relayed onto another dialog; the transport completes
/// the dialog identity (request-uri, Call-ID, tags, CSeq, Via, Route).
pub fn relayed_request(template: &Request, broker_contact: &str) -> Request {
    let mut headers: Headers = Default::default();
    copy_application_headers(&template.headers, &mut headers);
    headers.push(headers::Contact::new(broker_contact).into());
    push_body(&mut headers, &template.body);
    Request {
        method: template.method.clone(),
        uri: template.uri.clone(),
        version: rsip::Version::V2,
        headers,
        body: template.body.clone(),
    }
}

/// ACK template; Contact is only carried when the received ACK had one.
pub fn relayed_ack(received: &Request, broker_contact: &str) -> Request {
    let mut ack = relayed_request(received, broker_contact);
    ack.method = Method::Ack;
    if received.contact_headers().is_empty() {
        ack.headers.retain(|h| !matches!(h, Header::Contact(_)));
    }
    ack
}

/// In-dialog BYE toward `uri`; the transport fills in the dialog identity.
pub fn bye(uri: rsip::Uri) -> Request {
    let mut headers: Headers = Default::default();
    push_body(&mut headers, &[]);
    Request {
        method: Method::Bye,
        uri,
        version: rsip::Version::V2,
        headers,
        body: vec![],
    }
}

fn untagged_to(to: typed::To) -> typed::To {
    typed::To {
        params: to
            .params
            .into_iter()
            .filter(|param| !matches!(param, Param::Tag(_)))
            .collect(),
        ..to
    }
}

/// A new dialog-creating INVITE derived from `incoming`, routed via `routes`.
pub fn outgoing_invite(
    incoming: &Request,
    call_id: &str,
    routes: &[UriWithParams],
    broker_contact: &str,
) -> Result<Request, TransportError> {
    let invalid = |e: rsip::Error| TransportError::build("INVITE", e.to_string());
    let from = incoming.from_header().and_then(|h| h.typed()).map_err(invalid)?;
    let to = incoming.to_header().and_then(|h| h.typed()).map_err(invalid)?;

    let mut headers: Headers = Default::default();
    headers.push(headers::CallId::new(call_id).into());
    headers.push(
        typed::CSeq {
            seq: next_sequence(),
            method: Method::Invite,
        }
        .into(),
    );
    headers.push(from.with_tag(Tag::new(random_tag())).into());
    headers.push(untagged_to(to).into());
    headers.push(headers::MaxForwards::new(MAX_FORWARDS.to_string()).into());
    copy_application_headers(&incoming.headers, &mut headers);
    headers.push(headers::Contact::new(broker_contact).into());
    for route in routes {
        headers.push(typed::Route(vec![route.clone()].into()).into());
    }
    push_body(&mut headers, &incoming.body);
    Ok(Request {
        method: Method::Invite,
        uri: incoming.uri.clone(),
        version: rsip::Version::V2,
        headers,
        body: incoming.body.clone(),
    })
}

/// OPTIONS request checking that a single endpoint answers.
pub fn options_probe(
    endpoint: &rsip::Uri,
    call_id: &str,
    broker_contact: &str,
) -> Result<Request, TransportError> {
    let contact = headers::Contact::new(broker_contact)
        .typed()
        .map_err(|e| TransportError::build("OPTIONS", e.to_string()))?;
    let from = typed::From {
        display_name: None,
        uri: contact.uri,
        params: vec![],
    }
    .with_tag(Tag::new(random_tag()));
    let to = typed::To {
        display_name: None,
        uri: endpoint.clone(),
        params: vec![],
    };

    let mut headers: Headers = Default::default();
    headers.push(headers::CallId::new(call_id).into());
    headers.push(
        typed::CSeq {
            seq: next_sequence(),
            method: Method::Options,
        }
        .into(),
    );
    headers.push(from.into());
    headers.push(to.into());
    headers.push(headers::MaxForwards::new(MAX_FORWARDS.to_string()).into());
    push_body(&mut headers, &[]);
    Ok(Request {
        method: Method::Options,
        uri: endpoint.clone(),
        version: rsip::Version::V2,
        headers,
        body: vec![],
    })
}

/// Session key of an orchestrated call. Computed and stamped on the request
/// when the header is absent.
pub fn original_dialog_id(request: &mut Request) -> Result<String, BrokerError> {
    if let Some(value) = request.extension(P_ORIGINAL_DIALOG_ID) {
        return Ok(value);
    }
    let call_id = request
        .call_id()
        .ok_or_else(|| BrokerError::Malformed("missing Call-ID".to_string()))?;
    let from_tag = request
        .from_tag()
        .ok_or_else(|| BrokerError::Malformed("missing From tag".to_string()))?;
    let to_tag = request.to_tag().unwrap_or_else(|| "0".to_string());
    let value = format!("call-id{};TO_TAG={};FROM_TAG={}", call_id, to_tag, from_tag);
    request
        .headers
        .push(Header::Other(P_ORIGINAL_DIALOG_ID.to_string(), value.clone()));
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Originating,
    Terminating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationInfo {
    pub service_key: String,
    pub direction: CallDirection,
}

/// Finds the first route carrying a service key and a call direction.
pub fn orchestration_info(request: &Request) -> Result<OrchestrationInfo, BrokerError> {
    for route in request.route_set() {
        let Some(Some(service_key)) = route_param(&route, X_SERVICEKEY) else {
            continue;
        };
        let direction = if route_param(&route, "orig").is_some() {
            CallDirection::Originating
        } else if route_param(&route, "term").is_some() {
            CallDirection::Terminating
        } else {
            continue;
        };
        return Ok(OrchestrationInfo {
            service_key: service_key.to_string(),
            direction,
        });
    }
    Err(BrokerError::Malformed(
        "no orchestration info in Route headers".to_string(),
    ))
}

/// Route set with the first entry (the broker's own) removed.
pub fn routes_after_first(request: &Request) -> Vec<UriWithParams> {
    request.route_set().into_iter().skip(1).collect()
}
