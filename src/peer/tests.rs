use super::*;
use crate::metainfo::InfoHash;
use bytes::Bytes;
use std::time::Duration;
use tokio::net::TcpListener;

fn timeouts() -> PeerTimeouts {
    PeerTimeouts {
        connect: Duration::from_secs(2),
        handshake: Duration::from_secs(2),
        read: Duration::from_secs(2),
    }
}

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate("-TS0001-");
    let id2 = PeerId::generate("-TS0001-");
    assert_ne!(id1, id2);
    assert_eq!(id1.client_id(), Some("TS0001"));
    assert_eq!(PeerId::from_bytes(&[1; 19]), None);
}

#[test]
fn test_bitfield_set_and_iter() {
    let mut bf = Bitfield::new(10);
    assert!(bf.is_empty());
    bf.set(0);
    bf.set(9);
    bf.set(10);
    assert!(bf.has(0) && bf.has(9) && !bf.has(10));
    assert_eq!(bf.iter().collect::<Vec<_>>(), vec![0, 9]);
    assert_eq!(bf.to_bytes(), Bytes::from_static(&[0x80, 0x40]));
    assert!(Bitfield::full(10).is_complete());
}

#[test]
fn test_bitfield_from_bytes_validates() {
    assert!(Bitfield::from_bytes(&[0x80, 0x00], 16).unwrap().has(0));
    assert!(Bitfield::from_bytes(&[0x80], 16).is_err());
    // Piece count 10 leaves six spare bits in the second byte.
    assert!(Bitfield::from_bytes(&[0xFF, 0xC1], 10).is_err());
    assert!(Bitfield::from_bytes(&[0xFF, 0xC0], 10).unwrap().is_complete());
}

#[test]
fn test_handshake_encode_decode() {
    let handshake = Handshake::new(InfoHash([1; 20]), PeerId([2; 20]));
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), 68);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded, handshake);
    assert!(decoded.supports_extension_protocol());
    assert!(decoded.supports_fast_extension());
    assert!(Handshake::decode(&encoded[..40]).is_err());
}

#[test]
fn test_message_framing() {
    let request = BlockRef {
        piece: 1,
        begin: 16384,
        length: 16384,
    };
    let messages = vec![
        Message::KeepAlive,
        Message::Unchoke,
        Message::Have(42),
        Message::Bitfield(Bytes::from_static(&[0xF0])),
        Message::Request(request),
        Message::Cancel(request),
        Message::Reject(request),
        Message::Piece {
            piece: 3,
            begin: 0,
            data: Bytes::from_static(b"block"),
        },
        Message::HaveAll,
        Message::AllowedFast(7),
        Message::Extended {
            id: 1,
            payload: Bytes::from_static(b"d1:ai1ee"),
        },
    ];

    for msg in messages {
        let frame = msg.encode();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(Message::decode(frame.slice(4..)).unwrap(), msg);
    }
}

#[test]
fn test_message_decode_errors() {
    assert!(matches!(
        Message::decode(Bytes::from_static(&[99])),
        Err(PeerError::InvalidMessageId(99))
    ));
    assert!(Message::decode(Bytes::from_static(&[4, 0, 0])).is_err());
    assert!(Message::decode(Bytes::from_static(&[6, 0, 0, 0, 1])).is_err());
}

#[test]
fn test_extension_handshake() {
    let ours = ExtensionHandshake::ours("torrent-stream", 250, Some(31_000));
    let decoded = ExtensionHandshake::decode(&ours.encode()).unwrap();
    assert_eq!(decoded, ours);
    assert_eq!(decoded.id_of(UT_METADATA), Some(UT_METADATA_LOCAL_ID));

    let disabled = ExtensionHandshake::decode(b"d1:md11:ut_metadatai0eee").unwrap();
    assert_eq!(disabled.id_of(UT_METADATA), None);
}

#[tokio::test]
async fn test_connect_and_accept_over_loopback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let info_hash = InfoHash([9; 20]);
    let seeder_id = PeerId::generate("-TS0001-");

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = PeerTransport::new(stream, Duration::from_secs(2));
        let remote = transport.receive_handshake().await.unwrap();
        let mut conn = PeerConnection::accept(transport, remote, seeder_id)
            .await
            .unwrap();
        conn.send(Message::Unchoke).await.unwrap();
        conn.receive().await.unwrap()
    });

    let mut conn = PeerConnection::connect(addr, info_hash, PeerId::generate("-TS0001-"), timeouts())
        .await
        .unwrap();
    assert_eq!(conn.peer_id, seeder_id);
    assert!(conn.supports_extension);
    assert!(conn.peer_choking);

    assert_eq!(conn.receive().await.unwrap(), Message::Unchoke);
    assert!(!conn.peer_choking);

    conn.send(Message::Interested).await.unwrap();
    assert!(conn.am_interested);
    assert_eq!(server.await.unwrap(), Message::Interested);
}

#[tokio::test]
async fn test_connect_rejects_wrong_info_hash() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = PeerTransport::new(stream, Duration::from_secs(2));
        let _ = transport.receive_handshake().await;
        let reply = Handshake::new(InfoHash([2; 20]), PeerId([3; 20]));
        let _ = transport.send_handshake(&reply).await;
    });

    let result =
        PeerConnection::connect(addr, InfoHash([1; 20]), PeerId([4; 20]), timeouts()).await;
    assert!(matches!(result, Err(PeerError::InfoHashMismatch)));
}
