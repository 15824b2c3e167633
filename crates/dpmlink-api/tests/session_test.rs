#![allow(clippy::unwrap_used)]
// Integration tests for `Session` and the settings handshake against a
// scripted peer on an in-memory stream.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::duplex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use dpmlink_api::message::LIST_INDEX;
use dpmlink_api::{
    AuthState, DeviceRequest, Error, ListMode, ListState, Message, Session, Setting,
    StaticCredentials, Status, Transport, Value, authenticate,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(2)
}

fn ack(index: u16, status: Status) -> Message {
    Message::StatusReply { index, status }
}

fn data(index: u16, value: f64) -> Message {
    Message::DataReply {
        index,
        status: Status::OK,
        timestamp_ms: 1_700_000_000_000,
        value: Value::Scalar(value),
    }
}

/// Peer that answers each expected request with a fixed list of replies.
/// Returns every request it saw.
fn scripted(script: Vec<Vec<Message>>) -> (Session, JoinHandle<Vec<Message>>) {
    let (client, server) = duplex(64 * 1024);
    let session = Session::from_transport(Transport::from_stream(Box::new(client)));
    let peer = tokio::spawn(async move {
        let mut server = Transport::from_stream(Box::new(server));
        let mut seen = Vec::new();
        for replies in script {
            let Ok(request) = server.recv(deadline()).await else {
                break;
            };
            seen.push(request);
            for reply in replies {
                server.send(reply, deadline()).await.unwrap();
            }
        }
        // Hold the stream open until the client hangs up.
        let _ = server.recv(deadline()).await;
        seen
    });
    (session, peer)
}

// ── List lifecycle ──────────────────────────────────────────────────

#[tokio::test]
async fn full_list_lifecycle() {
    let (mut session, peer) = scripted(vec![
        vec![ack(0, Status::OK)],
        vec![ack(1, Status::DPM_NO_SUCH_DEVICE)],
        vec![ack(LIST_INDEX, Status::OK), data(0, 72.5)],
        // Data still in flight when the stop is acknowledged.
        vec![data(0, 73.0), ack(LIST_INDEX, Status::OK)],
        vec![ack(LIST_INDEX, Status::OK)],
    ]);

    let (i0, s0) = session.add(&DeviceRequest::new("M:OUTTMP"), deadline()).await.unwrap();
    let (i1, s1) = session.add(&DeviceRequest::new("Z:NOPE"), deadline()).await.unwrap();
    assert_eq!((i0, s0), (0, Status::OK));
    assert_eq!((i1, s1), (1, Status::DPM_NO_SUCH_DEVICE));
    assert_eq!(session.list_state(), ListState::Building);
    assert_eq!(session.entry(1).unwrap().request.device(), "Z:NOPE");

    session.start(ListMode::Immediate, deadline()).await.unwrap();
    assert_eq!(session.recv(deadline()).await.unwrap(), data(0, 72.5));

    session.reset(deadline()).await.unwrap();
    assert_eq!(session.list_state(), ListState::NoList);
    assert!(session.entries().is_empty());
    assert!(session.is_reusable());

    session.close().await;
    let seen = peer.await.unwrap();
    assert_eq!(
        seen.first(),
        Some(&Message::ListAdd {
            index: 0,
            request: "M:OUTTMP.READING".into()
        })
    );
    assert_eq!(seen.get(4), Some(&Message::ListClear));
}

#[tokio::test]
async fn data_before_start_ack_is_kept() {
    let (mut session, _peer) = scripted(vec![
        vec![ack(0, Status::OK)],
        vec![data(0, 1.0), ack(LIST_INDEX, Status::OK)],
    ]);
    session.add(&DeviceRequest::new("M:OUTTMP"), deadline()).await.unwrap();
    session.start(ListMode::Continuous, deadline()).await.unwrap();
    assert_eq!(session.recv(deadline()).await.unwrap(), data(0, 1.0));
}

#[tokio::test]
async fn add_after_start_is_rejected_locally() {
    let (mut session, _peer) = scripted(vec![
        vec![ack(0, Status::OK)],
        vec![ack(LIST_INDEX, Status::OK)],
    ]);
    session.add(&DeviceRequest::new("M:OUTTMP"), deadline()).await.unwrap();
    session.start(ListMode::Immediate, deadline()).await.unwrap();

    let err = session
        .add(&DeviceRequest::new("M:OUTTMP"), deadline())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)), "{err}");
    assert!(session.is_healthy());
}

#[tokio::test]
async fn unexpected_reply_poisons_session() {
    let (mut session, _peer) = scripted(vec![vec![Message::AuthReply {
        service: "x".into(),
        challenge: Vec::new(),
    }]]);
    let err = session
        .add(&DeviceRequest::new("M:OUTTMP"), deadline())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol { .. }), "{err}");
    assert!(!session.is_healthy());
}

#[tokio::test]
async fn rejected_start_is_reported() {
    let (mut session, _peer) = scripted(vec![
        vec![ack(0, Status::OK)],
        vec![ack(LIST_INDEX, Status::DPM_BAD_EVENT)],
    ]);
    session.add(&DeviceRequest::new("M:OUTTMP"), deadline()).await.unwrap();
    let err = session.start(ListMode::Immediate, deadline()).await.unwrap_err();
    assert!(
        matches!(err, Error::Rejected { status, .. } if status == Status::DPM_BAD_EVENT),
        "{err}"
    );
    assert!(!session.is_healthy());
}

// ── Deadlines ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn timeout_poisons_but_poll_expiry_does_not() {
    let (mut session, _peer) = scripted(vec![vec![ack(0, Status::OK)], vec![]]);
    session.add(&DeviceRequest::new("M:OUTTMP"), deadline()).await.unwrap();

    assert_eq!(session.poll(Duration::from_millis(50)).await.unwrap(), None);
    assert!(session.is_healthy());

    // Start is never acknowledged.
    let err = session
        .start(ListMode::Immediate, Instant::now() + Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert!(!session.is_healthy());
}

// ── Authentication ──────────────────────────────────────────────────

fn auth_reply() -> Message {
    Message::AuthReply {
        service: "daeset@FNAL.GOV".into(),
        challenge: vec![7; 8],
    }
}

#[tokio::test]
async fn handshake_enables_settings() {
    let (mut session, peer) = scripted(vec![
        vec![auth_reply()],
        vec![ack(LIST_INDEX, Status::OK)],
        vec![ack(0, Status::OK)],
        vec![ack(LIST_INDEX, Status::OK)],
        vec![ack(0, Status::OK)],
    ]);
    let creds = Arc::new(StaticCredentials::new("op@FNAL.GOV", b"ticket".to_vec()));

    authenticate(&mut session, creds, deadline()).await.unwrap();
    assert_eq!(session.auth_state(), AuthState::SettingsEnabled);

    let setting = DeviceRequest::new("Z:ACLTST").for_setting();
    session.add(&setting, deadline()).await.unwrap();
    session.start(ListMode::Immediate, deadline()).await.unwrap();
    session
        .apply_settings(
            Some("testing".into()),
            vec![Setting {
                index: 0,
                value: Value::Scalar(1.0),
            }],
            deadline(),
        )
        .await
        .unwrap();
    assert_eq!(session.recv(deadline()).await.unwrap(), ack(0, Status::OK));

    session.close().await;
    let seen = peer.await.unwrap();
    assert_eq!(
        seen.get(1),
        Some(&Message::EnableSettings {
            token: b"ticket".to_vec()
        })
    );
}

#[tokio::test]
async fn refused_enable_is_authentication_error() {
    let (mut session, _peer) = scripted(vec![
        vec![auth_reply()],
        vec![ack(LIST_INDEX, Status::new(17, -1))],
    ]);
    let creds = Arc::new(StaticCredentials::new("op", b"bad".to_vec()));

    let err = authenticate(&mut session, creds, deadline()).await.unwrap_err();
    assert!(matches!(err, Error::Authentication { .. }), "{err}");
    assert!(!session.is_healthy());
}

#[tokio::test]
async fn handshake_runs_once_per_session() {
    let (mut session, _peer) = scripted(vec![
        vec![auth_reply()],
        vec![ack(LIST_INDEX, Status::OK)],
    ]);
    let creds = Arc::new(StaticCredentials::new("op", b"t".to_vec()));
    authenticate(&mut session, creds.clone(), deadline()).await.unwrap();
    let err = authenticate(&mut session, creds, deadline()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)), "{err}");
}

#[tokio::test]
async fn settings_require_enabled_session() {
    let (mut session, _peer) = scripted(vec![
        vec![ack(0, Status::OK)],
        vec![ack(LIST_INDEX, Status::OK)],
    ]);
    session.add(&DeviceRequest::new("Z:ACLTST"), deadline()).await.unwrap();
    session.start(ListMode::Immediate, deadline()).await.unwrap();
    let err = session
        .apply_settings(None, Vec::new(), deadline())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)), "{err}");
}
