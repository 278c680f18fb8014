//! End-to-end over real sockets: relay server plus websocket sessions.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;

use topicsync_core::{Direction, Document, TopicStore};
use topicsync_net::{
    ConnectionState, RelayHub, RelayServer, SessionHandle, SyncConfig, WebSocketConnector,
};
use topicsync_test_support::replica;

async fn start_relay(room: &str) -> (SocketAddr, SyncConfig, RelayHub) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = SyncConfig {
        server_url: format!("ws://{addr}/yjs-websocket"),
        room: room.to_string(),
        ..SyncConfig::default()
    };
    let server = RelayServer::new(&config);
    let hub = server.hub();
    tokio::spawn(server.serve_listener(listener));
    (addr, config, hub)
}

#[tokio::test]
async fn sessions_converge_over_websockets() {
    let (_, config, hub) = start_relay("lab").await;

    let a = SessionHandle::spawn(
        WebSocketConnector::new(config.room_url()),
        Document::new(replica("a")),
        &config,
    );
    let b = SessionHandle::spawn(
        WebSocketConnector::new(config.room_url()),
        Document::new(replica("b")),
        &config,
    );
    timeout(Duration::from_secs(5), a.wait_for(ConnectionState::Live))
        .await
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(5), b.wait_for(ConnectionState::Live))
        .await
        .unwrap()
        .unwrap();

    let mut doc_a = a.document();
    let nav = doc_a.create_application("Nav", "").unwrap();
    doc_a
        .create_topic(&nav, "cmd_vel", "twist.proto", Direction::Subscribe, "")
        .unwrap();

    let doc_b = b.document();
    let synced = timeout(Duration::from_secs(5), async {
        while doc_b.find_topic("Nav", "cmd_vel").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(synced.is_ok(), "topic never reached b");
    assert_eq!(doc_a.snapshot(), doc_b.snapshot());
    assert_eq!(hub.room_names(), vec!["lab".to_string()]);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn unknown_paths_are_rejected() {
    let (addr, _, _) = start_relay("lab").await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/elsewhere")).await;
    assert!(result.is_err());
}
