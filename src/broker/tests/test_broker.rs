use super::common::*;
use crate::broker::SessionKey;
use crate::routing::ErrorPolicy;
use crate::sip::{message, DialogId, Interface, TransportEvent};
use rsip::{Method, Request};
use std::sync::mpsc;
use std::time::Duration;

fn original_key(call_id: &str) -> SessionKey {
    SessionKey::Orchestrated(format!("call-id{};TO_TAG=0;FROM_TAG=fa", call_id))
}

fn initial(call_id: &str) -> TransportEvent {
    request_event(
        imscf_invite(call_id, "z9hG4bK-a", "100"),
        "st-a",
        "in-a",
        None,
        Interface::External,
    )
}

#[test]
fn test_retransmitted_initial_invite_one_session() {
    let transport = RecordingTransport::new();
    let broker = broker(
        config(&["as1", "as2"], ErrorPolicy::Stop, &[], &[]),
        transport.clone(),
    );
    broker.on_event(initial("call-a"));
    broker.on_event(initial("call-a"));

    let session = broker.session(&original_key("call-a")).unwrap();
    wait_until("both INVITEs processed", || session.mailbox().processed() == 2);
    assert_eq!(broker.session_count(), 1);
    assert_eq!(transport.invites().len(), 1);
    assert_eq!(transport.statuses_on("st-a"), vec![100]);
}

#[test]
fn test_outgoing_invite_carries_original_dialog_id() {
    let transport = RecordingTransport::new();
    let broker = broker(
        config(&["as1", "as2"], ErrorPolicy::Stop, &[], &[]),
        transport.clone(),
    );
    broker.on_event(initial("call-a"));
    wait_until("first INVITE", || transport.invites().len() == 1);

    let (sent, ..) = transport.invites()[0].clone();
    let SessionKey::Orchestrated(id) = original_key("call-a") else {
        unreachable!()
    };
    assert_eq!(
        message::extension_values(&sent.headers, message::P_ORIGINAL_DIALOG_ID).collect::<Vec<_>>(),
        vec![id.as_str()]
    );

    // the service's own INVITE resolves back to the same session
    let back = as_invite(&sent, "call-as1", "z9hG4bK-1");
    broker.on_event(request_event(back, "st-1", "in-1", None, Interface::Internal));
    wait_until("second INVITE", || transport.invites().len() == 2);
    assert_eq!(broker.session_count(), 1);
    assert!(routes(&transport.invites()[1].0)[0].contains("as2.local"));
}

#[test]
fn test_invite_without_orchestration_info_rejected() {
    let transport = RecordingTransport::new();
    let broker = broker(
        config(&["as1"], ErrorPolicy::Stop, &[], &[]),
        transport.clone(),
    );
    let mut invite = imscf_invite("call-x", "z9hG4bK-x", "100");
    invite.headers.retain(|h| !matches!(h, rsip::Header::Route(_)));
    broker.on_event(request_event(invite, "st-x", "in-x", None, Interface::External));

    let unknown = imscf_invite("call-y", "z9hG4bK-y", "999");
    broker.on_event(request_event(unknown, "st-y", "in-y", None, Interface::External));

    assert_eq!(transport.stateless_statuses(), vec![400, 400]);
    assert_eq!(broker.session_count(), 0);
    assert!(transport.invites().is_empty());
}

#[test]
fn test_uncorrelated_request_dropped() {
    let transport = RecordingTransport::new();
    let broker = broker(
        config(&["as1"], ErrorPolicy::Stop, &[], &[]),
        transport.clone(),
    );
    let bye = in_dialog_request(Method::Bye, "z9hG4bK-b", 2);
    broker.on_event(request_event(bye, "st-b", "in-b", None, Interface::External));
    assert!(transport.sent().is_empty());
    assert_eq!(broker.session_count(), 0);
}

fn options(user: &str) -> TransportEvent {
    let mut request: Request = in_dialog_request(Method::Options, "z9hG4bK-p", 1);
    request.uri = format!("sip:{}@10.0.0.10:5060", user).as_str().try_into().unwrap();
    request_event(request, "st-ping", "none", None, Interface::Internal)
}

#[test]
fn test_ping_fails_when_alias_unreachable() {
    let transport = RecordingTransport::new();
    let mut config = config(&["a", "b"], ErrorPolicy::Stop, &[], &[]);
    config.services[1].endpoints = vec![
        "sip:b1.local:5070".to_string(),
        "sip:b2.local:5070".to_string(),
    ];
    let broker = broker(config, transport.clone());
    let none = DialogId("none".into());

    broker.on_event(options("a_b"));
    wait_until("probe to a", || transport.probes().len() == 1);
    let (probe, tx, token) = transport.probes()[0].clone();
    assert_eq!(probe.uri.to_string(), "sip:a.local:5070");
    broker.on_event(response_event(&probe, 200, &tx, &none, &token));

    wait_until("probe to b1", || transport.probes().len() == 2);
    let (probe, tx, token) = transport.probes()[1].clone();
    assert_eq!(probe.uri.to_string(), "sip:b1.local:5070");
    broker.on_event(response_event(&probe, 503, &tx, &none, &token));

    wait_until("probe to b2", || transport.probes().len() == 3);
    let (probe, tx, token) = transport.probes()[2].clone();
    assert_eq!(probe.uri.to_string(), "sip:b2.local:5070");
    broker.on_event(client_timeout(Method::Options, &tx, None, &token));

    wait_until("ping answered", || !transport.statuses_on("st-ping").is_empty());
    assert_eq!(transport.statuses_on("st-ping"), vec![404]);
    assert_eq!(transport.probes().len(), 3);
    let usage = broker.usage();
    assert_eq!(usage.ping_started, 1);
    assert_eq!(usage.ping_failed, 1);
    wait_until("ping session removed", || broker.session_count() == 0);
}

#[test]
fn test_ping_succeeds_past_unreachable_endpoint() {
    let transport = RecordingTransport::new();
    let mut config = config(&["a"], ErrorPolicy::Stop, &[], &[]);
    config.services[0].endpoints = vec![
        "sip:a1.local:5070".to_string(),
        "sip:a2.local:5070".to_string(),
    ];
    transport.make_unreachable("a1.local");
    let broker = broker(config, transport.clone());

    broker.on_event(options("a"));
    wait_until("probe to a2", || transport.probes().len() == 1);
    let (probe, tx, token) = transport.probes()[0].clone();
    assert_eq!(probe.uri.to_string(), "sip:a2.local:5070");

    // a duplicate OPTIONS while probing is ignored
    broker.on_event(options("a"));
    broker.on_event(response_event(&probe, 100, &tx, &DialogId("none".into()), &token));
    broker.on_event(response_event(&probe, 200, &tx, &DialogId("none".into()), &token));

    wait_until("ping answered", || !transport.statuses_on("st-ping").is_empty());
    assert_eq!(transport.statuses_on("st-ping"), vec![200]);
    assert_eq!(broker.usage().ping_succeeded, 1);
}

#[test]
fn test_ping_unknown_alias_rejected() {
    let transport = RecordingTransport::new();
    let broker = broker(
        config(&["a"], ErrorPolicy::Stop, &[], &[]),
        transport.clone(),
    );
    broker.on_event(options("a_nope"));
    wait_until("ping answered", || !transport.statuses_on("st-ping").is_empty());
    assert_eq!(transport.statuses_on("st-ping"), vec![400]);
    assert!(transport.probes().is_empty());
}

#[test]
fn test_auxiliary_dialog_relayed_both_ways() {
    let transport = RecordingTransport::new();
    let broker = broker(
        config(&["as1"], ErrorPolicy::Stop, &[], &[]),
        transport.clone(),
    );
    let mut invite = imscf_invite("call-aux", "z9hG4bK-aux", "100");
    invite
        .headers
        .push(rsip::Header::Other(message::X_MRF.into(), "true".into()));
    let event = request_event(invite, "st-aux", "in-aux", None, Interface::Internal);
    broker.on_event(event.clone());
    wait_until("INVITE relayed", || transport.invites().len() == 1);
    broker.on_event(event);

    let (sent, out_dialog, tx, token) = transport.invites()[0].clone();
    assert!(matches!(
        transport.sent().iter().find(|s| matches!(s, Sent::DialogRequest { .. })),
        Some(Sent::DialogRequest { interface: Interface::External, .. })
    ));
    assert_eq!(routes(&sent), vec!["<sip:10.0.0.20:5060;lr>".to_string()]);

    broker.on_event(response_event(&sent, 200, &tx, &out_dialog, &token));
    wait_until("200 relayed", || transport.statuses_on("st-aux").len() == 2);
    assert_eq!(transport.statuses_on("st-aux"), vec![100, 200]);
    assert_eq!(transport.invites().len(), 1);

    let in_token = transport.token_of(&DialogId("in-aux".into()));
    let bye = in_dialog_request(Method::Bye, "z9hG4bK-bye", 2);
    broker.on_event(request_event(bye, "st-bye", "in-aux", in_token.clone(), Interface::Internal));
    wait_until("BYE relayed", || transport.in_dialog(Method::Bye).len() == 1);
    let (bye, bye_dialog, bye_tx, bye_token) = transport.in_dialog(Method::Bye)[0].clone();
    assert_eq!(bye_dialog, out_dialog);
    broker.on_event(response_event(&bye, 200, &bye_tx, &bye_dialog, &bye_token));
    wait_until("BYE answered", || transport.statuses_on("st-bye") == vec![200]);

    broker.on_event(dialog_terminated(&out_dialog, Some(token)));
    broker.on_event(dialog_terminated(&DialogId("in-aux".into()), in_token));
    wait_until("session removed", || broker.session_count() == 0);
    let usage = broker.usage();
    assert_eq!(usage.auxiliary_started, 1);
    assert_eq!(usage.auxiliary_successful, 1);
    assert_eq!(usage.auxiliary_running, 0);
}

#[test]
fn test_saturated_pool_rejects_with_503() {
    let transport = RecordingTransport::new();
    let mut config = config(&["as1"], ErrorPolicy::Stop, &[], &[]);
    config.broker.initial_threads = 1;
    config.broker.max_threads = 1;
    config.broker.queue_max_size = 1;
    let broker = broker(config, transport.clone());

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = std::sync::Arc::new(parking_lot::Mutex::new(release_rx));
    for _ in 0..2 {
        let release_rx = release_rx.clone();
        broker
            .context()
            .pool
            .submit(move || {
                let _ = release_rx.lock().recv_timeout(Duration::from_secs(10));
            })
            .unwrap();
    }

    broker.on_event(initial("call-a"));
    assert_eq!(transport.stateless_statuses(), vec![503]);
    assert_eq!(broker.usage().mailbox_rejected, 1);
    assert_eq!(broker.session_count(), 0);

    release_tx.send(()).unwrap();
    release_tx.send(()).unwrap();
    wait_until("pool drained", || broker.context().pool.outstanding() == 0);

    broker.on_event(initial("call-a"));
    wait_until("INVITE sent", || transport.invites().len() == 1);
    assert_eq!(broker.session_count(), 1);
}

#[test]
fn test_reload_keeps_running_sessions() {
    let transport = RecordingTransport::new();
    let broker = broker(
        config(&["as1", "as2", "as3"], ErrorPolicy::Stop, &[], &[]),
        transport.clone(),
    );
    broker.on_event(initial("call-a"));
    wait_until("first INVITE", || transport.invites().len() == 1);

    let mut reloaded = config(&["as1", "as2", "as3"], ErrorPolicy::Stop, &[], &[]);
    reloaded.rulesets[0].services = vec!["as3".to_string()];
    broker.reload(&reloaded).unwrap();

    let (sent, ..) = transport.invites()[0].clone();
    let back = as_invite(&sent, "call-as1", "z9hG4bK-1");
    broker.on_event(request_event(back, "st-1", "in-1", None, Interface::Internal));
    wait_until("second INVITE", || transport.invites().len() == 2);
    assert!(routes(&transport.invites()[1].0)[0].contains("as2.local"));

    let fresh = request_event(
        imscf_invite("call-b", "z9hG4bK-b", "100"),
        "st-b",
        "in-b",
        None,
        Interface::External,
    );
    broker.on_event(fresh);
    wait_until("INVITE of new session", || transport.invites().len() == 3);
    assert!(routes(&transport.invites()[2].0)[0].contains("as3.local"));
}

#[test]
fn test_reload_rejects_invalid_config() {
    let transport = RecordingTransport::new();
    let broker = broker(
        config(&["as1"], ErrorPolicy::Stop, &[], &[]),
        transport,
    );
    let mut invalid = config(&["as1"], ErrorPolicy::Stop, &[], &[]);
    invalid.rulesets[0].services.push("missing".to_string());
    assert!(broker.reload(&invalid).is_err());
}

#[tokio::test]
async fn test_serve_returns_when_stopped() {
    let broker = broker(
        config(&["as1"], ErrorPolicy::Stop, &[], &[]),
        RecordingTransport::new(),
    );
    let token = broker.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    tokio::time::timeout(Duration::from_secs(5), broker.serve(Duration::from_millis(10)))
        .await
        .expect("serve did not stop")
        .unwrap();
}
