use super::*;
use axum::extract::RawQuery;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

fn request() -> AnnounceRequest {
    AnnounceRequest {
        info_hash: InfoHash([0xAB; 20]),
        peer_id: PeerId::generate("-TS0001-"),
        port: 6881,
        uploaded: 10,
        downloaded: 20,
        left: 30,
        event: TrackerEvent::Started,
    }
}

#[test]
fn test_tracker_event() {
    assert_eq!(TrackerEvent::Started.as_str(), "started");
    assert_eq!(TrackerEvent::Stopped.as_str(), "stopped");
    assert_eq!(TrackerEvent::Completed.as_str(), "completed");
    assert_eq!(TrackerEvent::None.as_str(), "");

    assert_eq!(TrackerEvent::None.as_udp_id(), 0);
    assert_eq!(TrackerEvent::Completed.as_udp_id(), 1);
    assert_eq!(TrackerEvent::Started.as_udp_id(), 2);
    assert_eq!(TrackerEvent::Stopped.as_udp_id(), 3);
}

#[test]
fn test_parse_compact_peers() {
    let data = [
        192, 168, 1, 1, 0x1A, 0xE1, // 192.168.1.1:6881
        10, 0, 0, 1, 0x1A, 0xE1, // 10.0.0.1:6881
        10, 0, 0, 2, 0, 0, // port 0 is dropped
        1, 2, // trailing garbage
    ];

    let peers = parse_compact_peers(&data);
    assert_eq!(
        peers,
        vec![
            "192.168.1.1:6881".parse().unwrap(),
            "10.0.0.1:6881".parse().unwrap()
        ]
    );
}

#[tokio::test]
async fn test_unsupported_scheme() {
    let client = TrackerClient::new().unwrap();
    let result = client.announce("wss://tracker.example.com", &request()).await;
    assert!(matches!(result, Err(TrackerError::UnsupportedProtocol(_))));
}

#[tokio::test]
async fn test_http_announce() {
    let app = Router::new().route(
        "/announce",
        get(|RawQuery(query): RawQuery| async move {
            let query = query.unwrap_or_default();
            assert!(query.contains("info_hash=%AB%AB"));
            assert!(query.contains("event=started"));
            assert!(query.contains("compact=1"));
            b"d8:completei2e10:incompletei1e8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e"
                .to_vec()
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let client = TrackerClient::new().unwrap();
    let response = client
        .announce(&format!("http://{addr}/announce"), &request())
        .await
        .unwrap();

    assert_eq!(response.interval, 1800);
    assert_eq!(response.complete, Some(2));
    assert_eq!(response.incomplete, Some(1));
    assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
}
