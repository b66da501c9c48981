//! Backend-daemon tunnel integration tests
//!
//! Drives `GuacdConnector` against a scripted daemon over real TCP.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::{Behavior, FakeGuacd};
use tg_core::{BackendAddr, ConnectionId, SessionId, TunnelError};
use tg_gateway::connection::ConnectionParams;
use tg_gateway::tunnel::{
    ClientFrame, ClientLink, GuacdConnector, TunnelEvent, TunnelFactory, TunnelRequest,
    CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
};

fn rdp_params() -> ConnectionParams {
    let settings = json!({
        "hostname": "desktop-1",
        "port": "3389",
        "width": 1024,
        "height": 768,
        "dpi": 96,
        "audio": ["audio/L16"],
        "image": ["image/png", "image/jpeg"],
        "timezone": "Europe/Berlin"
    });
    ConnectionParams {
        protocol: Some("rdp".to_string()),
        select: Some("rdp".to_string()),
        settings: settings.as_object().cloned().unwrap(),
    }
}

fn request(backend: BackendAddr, params: ConnectionParams) -> (TunnelRequest, CancellationToken) {
    let closer = CancellationToken::new();
    let request = TunnelRequest {
        connection_id: ConnectionId::new(1),
        backend,
        params,
        closer: closer.clone(),
    };
    (request, closer)
}

fn daemon_addr(daemon: &FakeGuacd) -> BackendAddr {
    BackendAddr::new("127.0.0.1", daemon.addr.port())
}

async fn next_event(events: &mut mpsc::Receiver<TunnelEvent>) -> TunnelEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for tunnel event")
        .expect("tunnel event channel closed")
}

async fn next_frame(frames: &mut mpsc::Receiver<ClientFrame>) -> ClientFrame {
    timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("timed out waiting for client frame")
        .expect("client frame channel closed")
}

#[tokio::test]
async fn test_handshake_relay_and_close() {
    let mut daemon = FakeGuacd::spawn(Behavior::Serve).await;
    let connector = GuacdConnector::new(Duration::from_secs(2), Duration::from_secs(5));
    let (link, mut frames, client) = ClientLink::pair(16);
    let (request, closer) = request(daemon_addr(&daemon), rdp_params());

    let mut events = connector.create(request, link).await;

    // Handshake follows the daemon's argument order
    assert_eq!(daemon.next("select").await.args, vec!["rdp"]);
    assert_eq!(daemon.next("size").await.args, vec!["1024", "768", "96"]);
    assert_eq!(daemon.next("image").await.args, vec!["image/png", "image/jpeg"]);
    assert_eq!(daemon.next("timezone").await.args, vec!["Europe/Berlin"]);
    assert_eq!(
        daemon.next("connect").await.args,
        vec!["VERSION_1_5_0", "desktop-1", "3389", ""]
    );

    match next_event(&mut events).await {
        TunnelEvent::Ready { session_id } => assert_eq!(session_id, SessionId::new("$session-1")),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(
        next_frame(&mut frames).await,
        ClientFrame::Text("5.ready,10.$session-1;".to_string())
    );

    // Daemon traffic reaches the client, client traffic reaches the daemon
    assert_eq!(
        next_frame(&mut frames).await,
        ClientFrame::Text("4.sync,10.1700000000;".to_string())
    );
    client.send("4.sync,10.1700000000;".to_string()).await.unwrap();
    assert_eq!(daemon.next("sync").await.args, vec!["1700000000"]);

    closer.cancel();
    daemon.next("disconnect").await;
    assert!(matches!(next_event(&mut events).await, TunnelEvent::Closed));
    assert!(matches!(
        next_frame(&mut frames).await,
        ClientFrame::Close { code: CLOSE_NORMAL, .. }
    ));
}

#[tokio::test]
async fn test_client_going_away_ends_tunnel() {
    let mut daemon = FakeGuacd::spawn(Behavior::Serve).await;
    let connector = GuacdConnector::new(Duration::from_secs(2), Duration::from_secs(5));
    let (link, _frames, client) = ClientLink::pair(16);
    let (request, _closer) = request(daemon_addr(&daemon), rdp_params());

    let mut events = connector.create(request, link).await;
    assert!(matches!(next_event(&mut events).await, TunnelEvent::Ready { .. }));

    drop(client);
    daemon.next("disconnect").await;
    assert!(matches!(next_event(&mut events).await, TunnelEvent::Closed));
}

#[tokio::test]
async fn test_refused_backend_reports_error_to_client() {
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = unused.local_addr().unwrap().port();
    drop(unused);

    let connector = GuacdConnector::new(Duration::from_secs(2), Duration::from_secs(5));
    let (link, mut frames, _client) = ClientLink::pair(16);
    let (request, _closer) = request(BackendAddr::new("127.0.0.1", port), rdp_params());

    let mut events = connector.create(request, link).await;

    match next_event(&mut events).await {
        TunnelEvent::Error(err) => assert!(matches!(err, TunnelError::ConnectionRefused(_))),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(next_event(&mut events).await, TunnelEvent::Closed));

    match next_frame(&mut frames).await {
        ClientFrame::Text(text) => {
            assert!(text.starts_with("5.error,"));
            assert!(text.ends_with(",3.520;"), "{}", text);
        }
        other => panic!("unexpected frame {:?}", other),
    }
    assert!(matches!(
        next_frame(&mut frames).await,
        ClientFrame::Close { code: CLOSE_INTERNAL_ERROR, .. }
    ));
}

#[tokio::test]
async fn test_daemon_rejection_is_a_handshake_error() {
    let daemon = FakeGuacd::spawn(Behavior::Reject).await;
    let connector = GuacdConnector::new(Duration::from_secs(2), Duration::from_secs(5));
    let (link, _frames, _client) = ClientLink::pair(16);
    let (request, _closer) = request(daemon_addr(&daemon), rdp_params());

    let mut events = connector.create(request, link).await;
    match next_event(&mut events).await {
        TunnelEvent::Error(TunnelError::Handshake(message)) => {
            assert!(message.contains("Unsupported protocol"), "{}", message)
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_silent_daemon_hits_inactivity_timeout() {
    let daemon = FakeGuacd::spawn(Behavior::Silent).await;
    let connector = GuacdConnector::new(Duration::from_secs(2), Duration::from_millis(200));
    let (link, mut frames, _client) = ClientLink::pair(16);
    let (request, _closer) = request(daemon_addr(&daemon), rdp_params());

    let mut events = connector.create(request, link).await;
    assert!(matches!(next_event(&mut events).await, TunnelEvent::Ready { .. }));
    assert!(matches!(
        next_event(&mut events).await,
        TunnelEvent::Error(TunnelError::Inactive(_))
    ));

    // ready, then the timeout error with the client-timeout status
    next_frame(&mut frames).await;
    match next_frame(&mut frames).await {
        ClientFrame::Text(text) => assert!(text.ends_with(",3.776;"), "{}", text),
        other => panic!("unexpected frame {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_connection_type_fails_before_connecting() {
    let connector = GuacdConnector::new(Duration::from_secs(2), Duration::from_secs(5));
    let (link, _frames, _client) = ClientLink::pair(16);
    let (request, _closer) = request(BackendAddr::default(), ConnectionParams::default());

    let mut events = connector.create(request, link).await;
    assert!(matches!(
        next_event(&mut events).await,
        TunnelEvent::Error(TunnelError::Handshake(_))
    ));
}
