//! End-to-end duplex messaging scenarios.

use crate::{expect_event, start_agent, start_relay, start_relay_with_sink};

use quill_agent::agent::AgentEvent;
use quill_agent::client::{BrokerClient, BrokerError};
use quill_agent::envelope::Integrity;
use quill_agent::store::ConnMode;
use quill_core::command::{Command, ErrorCode, MsgFlags, RelayMessage, Response};
use quill_core::crypto::{DhKeyPair, SignKeyPair};
use std::sync::Arc;

/// Spec scenario: A invites, B joins with a reply queue, both sides reach
/// CON, then messages flow both ways with increasing internal ids.
#[tokio::test]
async fn duplex_handshake_and_two_way_messaging() {
    let dir = tempfile::tempdir().unwrap();
    let (_relay, addr) = start_relay(dir.path(), 64).await;

    let (alice, mut alice_events) = start_agent(&[&addr]);
    let (bob, mut bob_events) = start_agent(&[&addr]);

    let (conn_a, invitation) = alice.new_conn(ConnMode::Invitation).await.unwrap();
    let conn_b = bob.join_conn(&invitation, true, b"bob-profile").await.unwrap();

    // A observes the confirmation and authorizes it.
    let (conf_id, info) = expect_event(&mut alice_events, |e| match e {
        AgentEvent::Conf {
            conn_id,
            confirmation_id,
            info,
        } => {
            assert_eq!(conn_id, conn_a);
            Some((confirmation_id, info))
        }
        _ => None,
    })
    .await;
    assert_eq!(info, b"bob-profile");
    alice.allow_conn(conn_a, conf_id, b"alice-profile").await.unwrap();

    // Both sides reach CON.
    expect_event(&mut bob_events, |e| match e {
        AgentEvent::Con { conn_id } if conn_id == conn_b => Some(()),
        _ => None,
    })
    .await;
    expect_event(&mut alice_events, |e| match e {
        AgentEvent::Con { conn_id } if conn_id == conn_a => Some(()),
        _ => None,
    })
    .await;

    // A → B
    alice.send(conn_a, b"hello".to_vec()).await.unwrap();
    let (first_id, body, integrity) = expect_event(&mut bob_events, |e| match e {
        AgentEvent::Msg {
            conn_id,
            internal_id,
            body,
            integrity,
            ..
        } if conn_id == conn_b => Some((internal_id, body, integrity)),
        _ => None,
    })
    .await;
    assert_eq!(body, b"hello");
    assert_eq!(integrity, Integrity::Ok);
    bob.ack(conn_b, first_id).await.unwrap();

    // B → A
    bob.send(conn_b, b"hi".to_vec()).await.unwrap();
    let (reply_id, body) = expect_event(&mut alice_events, |e| match e {
        AgentEvent::Msg {
            conn_id,
            internal_id,
            body,
            integrity,
            ..
        } if conn_id == conn_a => {
            assert_eq!(integrity, Integrity::Ok);
            Some((internal_id, body))
        }
        _ => None,
    })
    .await;
    assert_eq!(body, b"hi");
    assert!(reply_id > 0);

    // Further traffic keeps internal ids strictly increasing per side.
    alice.send(conn_a, b"second".to_vec()).await.unwrap();
    let second_id = expect_event(&mut bob_events, |e| match e {
        AgentEvent::Msg {
            conn_id,
            internal_id,
            body,
            ..
        } if conn_id == conn_b => {
            assert_eq!(body, b"second");
            Some(internal_id)
        }
        _ => None,
    })
    .await;
    assert!(second_id > first_id);
}

/// Spec scenario: a quota of 3 admits three messages, then the marker,
/// then refusals until the reader drains one message.
#[tokio::test]
async fn quota_marker_and_drain() {
    let dir = tempfile::tempdir().unwrap();
    let (_relay, addr) = start_relay(dir.path(), 3).await;

    let (recipient, mut events) = BrokerClient::connect(&addr).await.unwrap();
    let rcv_key = SignKeyPair::generate();
    let (rid, sid, _) = recipient
        .create_queue(&rcv_key, DhKeyPair::generate().public())
        .await
        .unwrap();

    let (sender, _sender_events) = BrokerClient::connect(&addr).await.unwrap();
    for i in 0..3u8 {
        sender
            .send_msg(None, sid, MsgFlags::default(), vec![i])
            .await
            .unwrap();
    }
    // Fourth and fifth writes are refused.
    for _ in 0..2 {
        let err = sender
            .send_msg(None, sid, MsgFlags::default(), b"over".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Protocol(ErrorCode::Quota)));
    }

    // The subscriber drains three messages and then the quota marker.
    let mut current = recipient.subscribe(&rcv_key, rid).await.unwrap().unwrap();
    let mut contents = 0;
    loop {
        match &current {
            RelayMessage::Content { .. } => contents += 1,
            RelayMessage::QuotaMarker { .. } => break,
        }
        recipient
            .ack_msg(&rcv_key, rid, current.msg_id())
            .await
            .unwrap();
        current = match events.recv().await.unwrap() {
            quill_agent::client::BrokerEvent::Msg { msg, .. } => msg,
            other => panic!("expected delivery, got {other:?}"),
        };
    }
    assert_eq!(contents, 3);

    // Room has been made: the next SEND is accepted.
    sender
        .send_msg(None, sid, MsgFlags::default(), b"after-drain".to_vec())
        .await
        .unwrap();
}

/// NKEY binds a notifier; a flagged SEND produces a sealed token that only
/// the notifier's DH key opens, and it reveals no message content.
#[tokio::test]
async fn push_notification_token_flow() {
    let (ntf_tx, mut ntf_rx) = tokio::sync::mpsc::unbounded_channel();
    let dir = tempfile::tempdir().unwrap();
    let (_relay, addr) =
        start_relay_with_sink(dir.path(), 64, Arc::new(quill_server::ChannelSink(ntf_tx))).await;

    let (recipient, _events) = BrokerClient::connect(&addr).await.unwrap();
    let rcv_key = SignKeyPair::generate();
    let (rid, sid, _) = recipient
        .create_queue(&rcv_key, DhKeyPair::generate().public())
        .await
        .unwrap();

    // Bind the notifier.
    let ntf_key = SignKeyPair::generate();
    let ntf_dh = DhKeyPair::generate();
    let response = recipient
        .request(
            Some(&rcv_key),
            Some(rid),
            &Command::NKey {
                notifier_key: ntf_key.verify_key(),
                dh_key: ntf_dh.public(),
            },
        )
        .await
        .unwrap();
    let (notifier_id, srv_dh) = match response {
        Response::NtfId {
            notifier_id,
            srv_dh,
        } => (notifier_id, srv_dh),
        other => panic!("expected NID, got {other:?}"),
    };

    // A flagged message produces a token; an unflagged one does not.
    let (sender, _s) = BrokerClient::connect(&addr).await.unwrap();
    sender
        .send_msg(None, sid, MsgFlags::default(), b"silent".to_vec())
        .await
        .unwrap();
    sender
        .send_msg(
            None,
            sid,
            MsgFlags { notification: true },
            b"loud".to_vec(),
        )
        .await
        .unwrap();

    let push = ntf_rx.recv().await.unwrap();
    assert_eq!(push.notifier_id, notifier_id);
    assert!(
        ntf_rx.try_recv().is_err(),
        "unflagged send must not notify"
    );

    // The notifier can open the token; it contains meta only.
    let secret = ntf_dh.shared_secret(&srv_dh);
    let token = quill_server::ntf::open_token(secret.as_bytes(), &push.sealed_token).unwrap();
    assert!(token.ts > 0);
    assert_eq!(token.msg_id.len(), 48);
}

/// NO_REPLY join: the connection works one-way and B reaches CON without
/// ever creating a queue of its own.
#[tokio::test]
async fn join_without_reply_queue() {
    let dir = tempfile::tempdir().unwrap();
    let (_relay, addr) = start_relay(dir.path(), 64).await;

    let (alice, mut alice_events) = start_agent(&[&addr]);
    let (bob, mut bob_events) = start_agent(&[&addr]);

    let (conn_a, invitation) = alice.new_conn(ConnMode::Invitation).await.unwrap();
    let conn_b = bob.join_conn(&invitation, false, b"").await.unwrap();

    let conf_id = expect_event(&mut alice_events, |e| match e {
        AgentEvent::Conf {
            confirmation_id, ..
        } => Some(confirmation_id),
        _ => None,
    })
    .await;
    alice.allow_conn(conn_a, conf_id, b"").await.unwrap();

    // B's HELLO suffices for CON on a one-way connection.
    expect_event(&mut bob_events, |e| match e {
        AgentEvent::Con { conn_id } if conn_id == conn_b => Some(()),
        _ => None,
    })
    .await;

    // B can message A; A never gets a sending side.
    bob.send(conn_b, b"one-way".to_vec()).await.unwrap();
    let body = expect_event(&mut alice_events, |e| match e {
        AgentEvent::Msg { body, .. } => Some(body),
        _ => None,
    })
    .await;
    assert_eq!(body, b"one-way");
}
