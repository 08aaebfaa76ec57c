use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use weir_peer_protocol::{
    HANDSHAKE_LEN, Handshake, MSGID_BITFIELD, MSGID_HAVE, MSGID_PIECE, MSGID_UNCHOKE, Message,
    Request,
};

use crate::config::Config;
use crate::tests::test_util::*;
use crate::type_aliases::BF;

fn msg_bytes(m: &Message<'_>) -> Vec<u8> {
    let mut buf = vec![0u8; 64 * 1024];
    let len = m.serialize(&mut buf).unwrap();
    buf.truncate(len);
    buf
}

#[tokio::test]
async fn test_incoming_handshake_no_bitfield_when_nothing_owned() {
    setup_test_logging();
    let (policy, events) = RecordingPolicy::new();
    let config = Config::default();
    let our_id = config.peer_id;
    let meta = test_meta(16384, 4 * 16384);
    let (addr, handle, _torrent) = start_engine(
        config,
        TestStore::default(),
        policy,
        meta,
        None,
        test_content(4 * 16384),
    )
    .await;

    let mut sock = TcpStream::connect(addr).await.unwrap();
    sock.write_all(&wire_handshake(TEST_HASH, REMOTE_ID))
        .await
        .unwrap();

    let mut reply = [0u8; HANDSHAKE_LEN];
    sock.read_exact(&mut reply).await.unwrap();
    let (shake, _) = Handshake::deserialize(&reply).unwrap();
    assert_eq!(shake.info_hash, TEST_HASH);
    assert_eq!(shake.peer_id, our_id);
    assert_eq!(shake.reserved, 0);

    // nothing owned locally, so no bitfield follows
    expect_silence(&mut sock).await;
    wait_until("handshake callback", || {
        snapshot(&events)
            .iter()
            .any(|e| matches!(e, Event::NewPeer(_)))
    })
    .await;

    // teardown closes the connection and reports the loss
    handle.shutdown();
    expect_closed(&mut sock).await;
    wait_until("lost peer on shutdown", || {
        snapshot(&events)
            .iter()
            .any(|e| matches!(e, Event::LostPeer(_)))
    })
    .await;
}

#[tokio::test]
async fn test_handshake_byte_at_a_time_with_bitfield_reply() {
    setup_test_logging();
    let (policy, _events) = RecordingPolicy::new();
    let meta = test_meta(16384, 4 * 16384);
    let mut field = BF::repeat(false, 4);
    field.set(0, true);
    field.set(2, true);
    let (addr, _handle, _torrent) = start_engine(
        Config::default(),
        TestStore::default(),
        policy,
        meta,
        Some(field),
        test_content(4 * 16384),
    )
    .await;

    let mut sock = TcpStream::connect(addr).await.unwrap();
    for b in wire_handshake(TEST_HASH, REMOTE_ID) {
        sock.write_all(&[b]).await.unwrap();
        sock.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let mut reply = [0u8; HANDSHAKE_LEN];
    sock.read_exact(&mut reply).await.unwrap();
    let (shake, _) = Handshake::deserialize(&reply).unwrap();
    assert_eq!(shake.info_hash, TEST_HASH);

    let frame = read_frame(&mut sock).await;
    assert_eq!(frame[4], MSGID_BITFIELD);
    assert_eq!(&frame[5..], &[0b1010_0000]);
}

#[tokio::test]
async fn test_request_piece_round_trip_accounts_uploaded() {
    setup_test_logging();
    let (policy, _events) =
        RecordingPolicy::with_new_peer_hook(|sw, h| sw.send_unchoke(h));
    let meta = test_meta(16384, 4 * 16384);
    let content = test_content(4 * 16384);
    let (addr, handle, torrent) = start_engine(
        Config::default(),
        TestStore::default(),
        policy,
        meta,
        Some(BF::repeat(true, 4)),
        content.clone(),
    )
    .await;

    let mut sock = connect_and_shake(addr).await;
    let bitfield = read_frame(&mut sock).await;
    assert_eq!(bitfield[4], MSGID_BITFIELD);
    let unchoke = read_frame(&mut sock).await;
    assert_eq!(unchoke[4], MSGID_UNCHOKE);

    sock.write_all(&msg_bytes(&Message::Interested)).await.unwrap();
    sock.write_all(&msg_bytes(&Message::Request(Request::new(3, 0, 16384))))
        .await
        .unwrap();

    let piece = read_frame(&mut sock).await;
    assert_eq!(piece.len(), 4 + 9 + 16384);
    assert_eq!(piece[4], MSGID_PIECE);
    assert_eq!(&piece[5..9], &3u32.to_be_bytes());
    assert_eq!(&piece[9..13], &0u32.to_be_bytes());
    assert_eq!(&piece[13..], &content[3 * 16384..4 * 16384]);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if handle.stats(torrent).await.unwrap().uploaded == 16384 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "uploaded counter never reached 16384"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_piece_reassembled_across_three_reads() {
    setup_test_logging();
    let (policy, events) = RecordingPolicy::with_new_peer_hook(|sw, h| {
        sw.send_interested(h);
        sw.send_request(h, Request::new(5, 0, 2048));
    });
    let meta = test_meta(16384, 6 * 16384);
    let store = TestStore::default();
    let (addr, handle, torrent) = start_engine(
        Config::default(),
        store.clone(),
        policy,
        meta,
        None,
        test_content(6 * 16384),
    )
    .await;

    let mut sock = connect_and_shake(addr).await;

    let block: Vec<u8> = (0..2048u32).map(|i| (i % 239) as u8).collect();
    let frame = msg_bytes(&Message::Piece(weir_peer_protocol::Piece::from_data(
        5, 0, &block,
    )));
    assert_eq!(frame.len(), 4 + 9 + 2048);
    for chunk in [&frame[..8], &frame[8..1032], &frame[1032..]] {
        sock.write_all(chunk).await.unwrap();
        sock.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    wait_until("block callback", || {
        snapshot(&events)
            .iter()
            .any(|e| matches!(e, Event::Block(_)))
    })
    .await;
    let blocks = snapshot(&events)
        .iter()
        .filter(|e| matches!(e, Event::Block(_)))
        .count();
    assert_eq!(blocks, 1);

    let stats = handle.stats(torrent).await.unwrap();
    assert_eq!(stats.downloaded, 2048);
    assert_eq!(store.writes(), vec![(torrent, 5 * 16384, block)]);
}

#[tokio::test]
async fn test_malformed_have_length_destroys_peer() {
    setup_test_logging();
    let (policy, events) = RecordingPolicy::new();
    let meta = test_meta(16384, 4 * 16384);
    let (addr, _handle, _torrent) = start_engine(
        Config::default(),
        TestStore::default(),
        policy,
        meta,
        None,
        test_content(4 * 16384),
    )
    .await;

    let mut sock = connect_and_shake(addr).await;

    // HAVE with a length prefix of 6 instead of 5
    let mut bad = Vec::new();
    bad.extend_from_slice(&6u32.to_be_bytes());
    bad.push(MSGID_HAVE);
    bad.extend_from_slice(&1u32.to_be_bytes());
    bad.push(0xff);
    sock.write_all(&bad).await.unwrap();

    expect_closed(&mut sock).await;
    wait_until("lost peer callback", || {
        snapshot(&events)
            .iter()
            .any(|e| matches!(e, Event::LostPeer(_)))
    })
    .await;
    assert!(
        !snapshot(&events)
            .iter()
            .any(|e| matches!(e, Event::PieceAnn(..)))
    );
}

#[tokio::test]
async fn test_multiple_messages_in_one_read() {
    setup_test_logging();
    let (policy, events) = RecordingPolicy::new();
    let meta = test_meta(16384, 4 * 16384);
    let (addr, _handle, _torrent) = start_engine(
        Config::default(),
        TestStore::default(),
        policy,
        meta,
        None,
        test_content(4 * 16384),
    )
    .await;

    let mut sock = connect_and_shake(addr).await;

    let mut batch = Vec::new();
    batch.extend_from_slice(&msg_bytes(&Message::Interested));
    batch.extend_from_slice(&msg_bytes(&Message::Have(0)));
    batch.extend_from_slice(&msg_bytes(&Message::Have(2)));
    batch.extend_from_slice(&msg_bytes(&Message::KeepAlive));
    sock.write_all(&batch).await.unwrap();

    wait_until("piece announcements", || {
        let anns: Vec<u32> = snapshot(&events)
            .iter()
            .filter_map(|e| match e {
                Event::PieceAnn(_, i) => Some(*i),
                _ => None,
            })
            .collect();
        anns == vec![0, 2]
    })
    .await;

    // the peer survived the batch
    sock.write_all(&msg_bytes(&Message::Have(1))).await.unwrap();
    wait_until("third announcement", || {
        snapshot(&events)
            .iter()
            .any(|e| matches!(e, Event::PieceAnn(_, 1)))
    })
    .await;
}

#[tokio::test]
async fn test_request_length_cap_boundary() {
    setup_test_logging();
    let (policy, events) =
        RecordingPolicy::with_new_peer_hook(|sw, h| sw.send_unchoke(h));
    let meta = test_meta(65536, 2 * 65536);
    let content = test_content(2 * 65536);
    let (addr, _handle, _torrent) = start_engine(
        Config::default(),
        TestStore::default(),
        policy,
        meta,
        Some(BF::repeat(true, 2)),
        content,
    )
    .await;

    let mut sock = connect_and_shake(addr).await;
    let bitfield = read_frame(&mut sock).await;
    assert_eq!(bitfield[4], MSGID_BITFIELD);
    let unchoke = read_frame(&mut sock).await;
    assert_eq!(unchoke[4], MSGID_UNCHOKE);

    sock.write_all(&msg_bytes(&Message::Interested)).await.unwrap();

    // 2^15 is accepted
    sock.write_all(&msg_bytes(&Message::Request(Request::new(0, 0, 1 << 15))))
        .await
        .unwrap();
    let piece = read_frame(&mut sock).await;
    assert_eq!(piece[4], MSGID_PIECE);
    assert_eq!(piece.len(), 4 + 9 + (1 << 15));

    // 2^15 + 1 destroys the peer
    sock.write_all(&msg_bytes(&Message::Request(Request::new(
        0,
        0,
        (1 << 15) + 1,
    ))))
    .await
    .unwrap();
    expect_closed(&mut sock).await;
    wait_until("lost peer callback", || {
        snapshot(&events)
            .iter()
            .any(|e| matches!(e, Event::LostPeer(_)))
    })
    .await;
}

#[tokio::test]
async fn test_bitfield_split_across_reads_then_second_bitfield_kills() {
    setup_test_logging();
    let (policy, events) = RecordingPolicy::new();
    // 100 pieces -> 13 bitfield bytes, enough to split mid-payload
    let meta = test_meta(1024, 100 * 1024);
    let (addr, _handle, _torrent) = start_engine(
        Config::default(),
        TestStore::default(),
        policy,
        meta,
        None,
        test_content(100 * 1024),
    )
    .await;

    let mut sock = connect_and_shake(addr).await;

    let mut field = vec![0u8; 13];
    field[0] = 0b1100_0000; // pieces 0 and 1
    field[12] = 0b1000_0000; // piece 96
    let frame = msg_bytes(&Message::Bitfield(&field));
    sock.write_all(&frame[..8]).await.unwrap();
    sock.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    sock.write_all(&frame[8..]).await.unwrap();

    wait_until("bitfield announcements", || {
        let anns: Vec<u32> = snapshot(&events)
            .iter()
            .filter_map(|e| match e {
                Event::PieceAnn(_, i) => Some(*i),
                _ => None,
            })
            .collect();
        anns == vec![0, 1, 96]
    })
    .await;

    // a second bitfield after piece announcements is a protocol violation
    sock.write_all(&frame).await.unwrap();
    expect_closed(&mut sock).await;
    wait_until("lost peer callback", || {
        snapshot(&events)
            .iter()
            .any(|e| matches!(e, Event::LostPeer(_)))
    })
    .await;
}

#[tokio::test]
async fn test_download_cap_spreads_piece_over_seconds() {
    setup_test_logging();
    let (policy, events) = RecordingPolicy::with_new_peer_hook(|sw, h| {
        sw.send_interested(h);
        sw.send_request(h, Request::new(0, 0, 2048));
    });
    let meta = test_meta(16384, 4 * 16384);
    let config = Config {
        download_bps: 1024,
        ..Config::default()
    };
    let (addr, handle, torrent) = start_engine(
        config,
        TestStore::default(),
        policy,
        meta,
        None,
        test_content(4 * 16384),
    )
    .await;

    let started = std::time::Instant::now();
    let mut sock = connect_and_shake(addr).await;

    let block = vec![0xabu8; 2048];
    let frame = msg_bytes(&Message::Piece(weir_peer_protocol::Piece::from_data(
        0, 0, &block,
    )));
    sock.write_all(&frame).await.unwrap();

    wait_until("block callback", || {
        snapshot(&events)
            .iter()
            .any(|e| matches!(e, Event::Block(_)))
    })
    .await;
    let stats = handle.stats(torrent).await.unwrap();
    assert_eq!(stats.downloaded, 2048);
    // 68 + 2061 bytes against a 1024 B/s bucket needs at least one refill
    assert!(
        started.elapsed() >= Duration::from_millis(900),
        "cap not applied: took {:?}",
        started.elapsed()
    );
}
