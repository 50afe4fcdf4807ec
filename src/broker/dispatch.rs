use super::{
    context::BrokerContextRef,
    registry::SessionKey,
    session::Session,
};
use crate::{
    error::BrokerError,
    orchestration::SessionContext,
    sip::{
        message::{self, MessageExt, X_ICA, X_MRF},
        RequestEvent, TransportEvent,
    },
};
use rsip::{Method, Request};
use std::{convert::Infallible, sync::Arc};
use tracing::{debug, warn};

/// Routes one inbound event to the session owning it, creating the session
/// for requests that start one. Nothing is processed inline.
pub fn dispatch(env: &BrokerContextRef, event: TransportEvent) {
    match event {
        TransportEvent::Request(request) if request.token.is_none() => {
            dispatch_new_request(env, request)
        }
        event => dispatch_correlated(env, event),
    }
}

fn dispatch_new_request(env: &BrokerContextRef, event: RequestEvent) {
    match event.request.method {
        Method::Invite if event.request.flag(X_MRF) || event.request.flag(X_ICA) => {
            auxiliary_invite(env, event)
        }
        Method::Invite => orchestrated_invite(env, event),
        Method::Options => ping_request(env, event),
        ref method => debug!("{} outside any session dropped", method),
    }
}

fn dispatch_correlated(env: &BrokerContextRef, event: TransportEvent) {
    let Some(token) = event.token() else {
        debug!("{} without session correlation dropped", event.describe());
        return;
    };
    let Some(session) = env.registry.get(&token.session) else {
        debug!(session = %token.session, "{} for a finished session dropped", event.describe());
        return;
    };
    deliver(env, session, event);
}

fn reject(env: &BrokerContextRef, event: &RequestEvent, status: u16, reason: &str) {
    let response = message::response_with_reason(&event.request, status, reason);
    if let Err(e) = env
        .transport
        .send_stateless_response(event.interface, response)
    {
        warn!("unable to reject {}: {}", event.request.method, e);
    }
}

fn new_orchestrated(
    env: &BrokerContextRef,
    key: &SessionKey,
    request: &Request,
) -> Result<Session, BrokerError> {
    let info = message::orchestration_info(request)?;
    let routing = env.routing.snapshot();
    let ruleset = routing.ruleset(&info.service_key).ok_or_else(|| {
        BrokerError::Malformed(format!("no ruleset for service key {}", info.service_key))
    })?;
    let context = SessionContext::new(key.clone(), ruleset, routing)?;
    Ok(Session::orchestrated(context))
}

fn orchestrated_invite(env: &BrokerContextRef, mut event: RequestEvent) {
    let id = match message::original_dialog_id(&mut event.request) {
        Ok(id) => id,
        Err(e) => {
            warn!("INVITE rejected: {}", e);
            reject(env, &event, 400, &e.to_string());
            return;
        }
    };
    let created = env
        .registry
        .find_or_create(SessionKey::Orchestrated(id), |key| {
            new_orchestrated(env, key, &event.request)
        });
    match created {
        Ok((session, fresh)) => {
            if fresh {
                debug!(session = %session.key(), "orchestrated session created");
            }
            deliver(env, session, TransportEvent::Request(event));
        }
        Err(e) => {
            warn!("INVITE rejected: {}", e);
            reject(env, &event, 400, &e.to_string());
        }
    }
}

fn auxiliary_invite(env: &BrokerContextRef, event: RequestEvent) {
    let Some(call_id) = event.request.call_id() else {
        reject(env, &event, 400, "missing Call-ID");
        return;
    };
    let created = env
        .registry
        .find_or_create(SessionKey::Auxiliary(call_id), |key| {
            Ok::<_, Infallible>(Session::auxiliary(key.clone()))
        });
    let (session, fresh) = match created {
        Ok(found) => found,
        Err(never) => match never {},
    };
    if !fresh {
        debug!(session = %session.key(), "INVITE retransmission dropped");
        return;
    }
    deliver(env, session, TransportEvent::Request(event));
}

/// User part of a ping request-uri, the `_` joined alias list.
fn ping_target(request: &Request) -> Option<String> {
    if !matches!(
        request.uri.scheme,
        Some(rsip::Scheme::Sip) | Some(rsip::Scheme::Sips)
    ) {
        return None;
    }
    let user = request.uri.auth.as_ref()?.user.clone();
    (!user.is_empty()).then_some(user)
}

fn ping_request(env: &BrokerContextRef, event: RequestEvent) {
    let Some(user) = ping_target(&event.request) else {
        warn!("OPTIONS without alias list rejected");
        reject(env, &event, 400, "Invalid ping request-uri");
        return;
    };
    let aliases: Vec<String> = user
        .split('_')
        .filter(|alias| !alias.is_empty())
        .map(str::to_string)
        .collect();
    let created = env
        .registry
        .find_or_create(SessionKey::Ping(user), |key| {
            Ok::<_, Infallible>(Session::ping(key.clone(), aliases))
        });
    let (session, fresh) = match created {
        Ok(found) => found,
        Err(never) => match never {},
    };
    if !fresh {
        debug!(session = %session.key(), "ping already running, OPTIONS ignored");
        return;
    }
    deliver(env, session, TransportEvent::Request(event));
}

/// Hands `event` to the session mailbox. When the worker pool is saturated
/// the rejected requests get a stateless 503 and a session that never ran
/// is unregistered.
pub(super) fn deliver(env: &BrokerContextRef, session: Arc<Session>, event: TransportEvent) {
    let rejected = match session.enqueue(env, event) {
        Ok(_) => return,
        Err(rejected) => rejected,
    };
    warn!(
        session = %session.key(),
        "{}, {} events rejected",
        rejected.error,
        rejected.events.len()
    );
    env.counters.mailbox_rejected(rejected.events.len());
    for event in &rejected.events {
        if let TransportEvent::Request(request) = event {
            if request.request.method != Method::Ack {
                let response =
                    message::response_with_reason(&request.request, 503, "Service overloaded");
                if let Err(e) = env
                    .transport
                    .send_stateless_response(request.interface, response)
                {
                    warn!(session = %session.key(), "unable to send 503: {}", e);
                }
            }
        }
    }
    if session.mailbox().processed() == 0 && env.registry.remove(session.key(), &session) {
        debug!(session = %session.key(), "never started session unregistered");
    }
}
