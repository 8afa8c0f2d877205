//! Session conformance: a scripted peer on the far side of a duplex pair
//! answers with hand-built reply bytes while the tests drive the client
//! through the public API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

use blockwire_core::{
    Command, CommandFlags, DisconnectReason, Error, ExportInfo, Session, SessionConfig,
    StreamTransport, TransmissionFlags, REQUEST_MAGIC, SIMPLE_REPLY_MAGIC,
    STRUCTURED_REPLY_MAGIC,
};

const DONE: u16 = 1;
const CHUNK_NONE: u16 = 0;
const CHUNK_OFFSET_DATA: u16 = 1;
const CHUNK_OFFSET_HOLE: u16 = 2;
const CHUNK_ERROR: u16 = 0x8001;
const CHUNK_ERROR_OFFSET: u16 = 0x8002;

const EIO: u32 = 5;

#[derive(Debug)]
struct PeerRequest {
    flags: u16,
    command: u16,
    cookie: u64,
    offset: u64,
    length: u32,
}

async fn read_request(io: &mut DuplexStream) -> PeerRequest {
    let mut hdr = [0u8; 28];
    io.read_exact(&mut hdr).await.expect("peer request read");
    assert_eq!(
        u32::from_be_bytes(hdr[0..4].try_into().unwrap()),
        REQUEST_MAGIC
    );
    PeerRequest {
        flags: u16::from_be_bytes(hdr[4..6].try_into().unwrap()),
        command: u16::from_be_bytes(hdr[6..8].try_into().unwrap()),
        cookie: u64::from_be_bytes(hdr[8..16].try_into().unwrap()),
        offset: u64::from_be_bytes(hdr[16..24].try_into().unwrap()),
        length: u32::from_be_bytes(hdr[24..28].try_into().unwrap()),
    }
}

async fn write_simple(io: &mut DuplexStream, cookie: u64, error: u32, payload: &[u8]) {
    let mut buf = Vec::with_capacity(16 + payload.len());
    buf.extend_from_slice(&SIMPLE_REPLY_MAGIC.to_be_bytes());
    buf.extend_from_slice(&error.to_be_bytes());
    buf.extend_from_slice(&cookie.to_be_bytes());
    buf.extend_from_slice(payload);
    io.write_all(&buf).await.expect("peer reply write");
}

/// Write a chunk header claiming `length` payload bytes, then `payload`
/// (which may deliberately disagree for malformed-peer tests).
async fn write_chunk_raw(
    io: &mut DuplexStream,
    flags: u16,
    kind: u16,
    cookie: u64,
    length: u32,
    payload: &[u8],
) {
    let mut buf = Vec::with_capacity(20 + payload.len());
    buf.extend_from_slice(&STRUCTURED_REPLY_MAGIC.to_be_bytes());
    buf.extend_from_slice(&flags.to_be_bytes());
    buf.extend_from_slice(&kind.to_be_bytes());
    buf.extend_from_slice(&cookie.to_be_bytes());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(payload);
    io.write_all(&buf).await.expect("peer chunk write");
}

async fn write_chunk(io: &mut DuplexStream, flags: u16, kind: u16, cookie: u64, payload: &[u8]) {
    write_chunk_raw(io, flags, kind, cookie, payload.len() as u32, payload).await;
}

fn offset_data(offset: u64, data: &[u8]) -> Vec<u8> {
    let mut payload = offset.to_be_bytes().to_vec();
    payload.extend_from_slice(data);
    payload
}

fn offset_hole(offset: u64, size: u32) -> Vec<u8> {
    let mut payload = offset.to_be_bytes().to_vec();
    payload.extend_from_slice(&size.to_be_bytes());
    payload
}

fn error_payload(code: u32, message: &str) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(&(message.len() as u16).to_be_bytes());
    payload.extend_from_slice(message.as_bytes());
    payload
}

fn export(structured: bool) -> ExportInfo {
    ExportInfo {
        size: 1 << 30,
        flags: TransmissionFlags::HAS_FLAGS
            | TransmissionFlags::SEND_FLUSH
            | TransmissionFlags::SEND_FUA
            | TransmissionFlags::SEND_TRIM
            | TransmissionFlags::SEND_WRITE_ZEROES,
        min_block_size: 1,
        structured_replies: structured,
    }
}

fn connect(structured: bool, max_in_flight: usize) -> (Arc<Session>, DuplexStream) {
    let (client_io, peer_io) = tokio::io::duplex(1 << 20);
    let session = Session::new(
        StreamTransport::new(client_io),
        export(structured),
        SessionConfig { max_in_flight },
    );
    session.attach();
    (session, peer_io)
}

async fn read(session: &Session, buf: &mut [u8], offset: u64) -> Result<(), Error> {
    let length = buf.len() as u32;
    session
        .request(
            Command::Read,
            CommandFlags::empty(),
            offset,
            length,
            None,
            Some(buf),
        )
        .await
}

#[tokio::test]
async fn simple_read_round_trip() {
    let (session, mut peer) = connect(false, 4);

    let client = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            read(&session, &mut buf, 1024).await.map(|()| buf)
        })
    };

    let req = read_request(&mut peer).await;
    assert_eq!(req.command, Command::Read as u16);
    assert_eq!(req.flags, 0);
    assert_eq!(req.offset, 1024);
    assert_eq!(req.length, 8);
    write_simple(&mut peer, req.cookie, 0, b"abcdefgh").await;

    let buf = client.await.unwrap().unwrap();
    assert_eq!(&buf, b"abcdefgh");
    assert_eq!(session.in_flight(), 0);
}

#[tokio::test]
async fn simple_error_reply_carries_no_payload() {
    let (session, mut peer) = connect(false, 4);

    let client = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            read(&session, &mut buf, 0).await
        })
    };

    let req = read_request(&mut peer).await;
    write_simple(&mut peer, req.cookie, EIO, &[]).await;
    match client.await.unwrap() {
        Err(Error::Server(e)) => assert_eq!(e.code, EIO),
        other => panic!("expected server error, got {other:?}"),
    }

    // The session is still healthy.
    let client = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 0).await.map(|()| buf)
        })
    };
    let req = read_request(&mut peer).await;
    write_simple(&mut peer, req.cookie, 0, b"okay").await;
    assert_eq!(&client.await.unwrap().unwrap(), b"okay");
}

#[tokio::test]
async fn structured_read_reassembles_data_and_hole() {
    let (session, mut peer) = connect(true, 4);

    let client = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0xffu8; 8];
            read(&session, &mut buf, 0).await.map(|()| buf)
        })
    };

    let req = read_request(&mut peer).await;
    write_chunk(
        &mut peer,
        0,
        CHUNK_OFFSET_DATA,
        req.cookie,
        &offset_data(0, b"hello"),
    )
    .await;
    write_chunk(&mut peer, 0, CHUNK_OFFSET_HOLE, req.cookie, &offset_hole(5, 3)).await;
    write_chunk(&mut peer, DONE, CHUNK_NONE, req.cookie, &[]).await;

    let buf = client.await.unwrap().unwrap();
    assert_eq!(&buf, b"hello\0\0\0");
}

#[tokio::test]
async fn structured_read_single_chunk_with_done() {
    let (session, mut peer) = connect(true, 4);

    let client = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 0).await.map(|()| buf)
        })
    };

    let req = read_request(&mut peer).await;
    write_chunk(
        &mut peer,
        DONE,
        CHUNK_OFFSET_DATA,
        req.cookie,
        &offset_data(0, b"data"),
    )
    .await;
    assert_eq!(&client.await.unwrap().unwrap(), b"data");
}

#[tokio::test]
async fn error_chunk_is_isolated_to_its_request() {
    let (session, mut peer) = connect(true, 4);

    let a = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 0).await
        })
    };
    let b = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 4096).await.map(|()| buf)
        })
    };

    let first = read_request(&mut peer).await;
    let second = read_request(&mut peer).await;
    let (req_a, req_b) = if first.offset == 0 {
        (first, second)
    } else {
        (second, first)
    };

    write_chunk(
        &mut peer,
        DONE,
        CHUNK_ERROR,
        req_a.cookie,
        &error_payload(EIO, "access denied"),
    )
    .await;
    write_chunk(
        &mut peer,
        DONE,
        CHUNK_OFFSET_DATA,
        req_b.cookie,
        &offset_data(0, b"fine"),
    )
    .await;

    match a.await.unwrap() {
        Err(Error::Server(e)) => {
            assert_eq!(e.code, EIO);
            assert_eq!(e.message.as_deref(), Some("access denied"));
        }
        other => panic!("expected server error for A, got {other:?}"),
    }
    assert_eq!(&b.await.unwrap().unwrap(), b"fine");

    // A third request proves the session survived A's failure.
    let c = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 0).await.map(|()| buf)
        })
    };
    let req = read_request(&mut peer).await;
    write_chunk(
        &mut peer,
        DONE,
        CHUNK_OFFSET_DATA,
        req.cookie,
        &offset_data(0, b"more"),
    )
    .await;
    assert_eq!(&c.await.unwrap().unwrap(), b"more");
}

#[tokio::test]
async fn error_offset_chunk_surfaces_the_offset() {
    let (session, mut peer) = connect(true, 4);

    let client = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 512).await
        })
    };

    let req = read_request(&mut peer).await;
    let mut payload = error_payload(EIO, "bad sector");
    payload.extend_from_slice(&512u64.to_be_bytes());
    write_chunk(&mut peer, 0, CHUNK_ERROR_OFFSET, req.cookie, &payload).await;
    write_chunk(&mut peer, DONE, CHUNK_NONE, req.cookie, &[]).await;

    match client.await.unwrap() {
        Err(Error::Server(e)) => {
            assert_eq!(e.code, EIO);
            assert_eq!(e.offset, Some(512));
            assert_eq!(e.message.as_deref(), Some("bad sector"));
        }
        other => panic!("expected server error, got {other:?}"),
    }
}

#[tokio::test]
async fn capacity_one_queues_the_second_submit() {
    let (session, mut peer) = connect(false, 1);

    let a = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            read(&session, &mut buf, 0).await
        })
    };
    let req_a = read_request(&mut peer).await;
    assert_eq!(req_a.length, 512);

    let b = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            read(&session, &mut buf, 512).await
        })
    };

    // B is suspended in the admission queue: nothing further hits the wire
    // until A's slot frees.
    assert!(
        timeout(Duration::from_millis(100), read_request(&mut peer))
            .await
            .is_err(),
        "second request reached the wire while the slot table was full"
    );
    assert_eq!(session.in_flight(), 1);

    write_simple(&mut peer, req_a.cookie, 0, &[0u8; 512]).await;
    a.await.unwrap().unwrap();

    let req_b = read_request(&mut peer).await;
    assert_eq!(req_b.offset, 512);
    write_simple(&mut peer, req_b.cookie, 0, &[0u8; 512]).await;
    b.await.unwrap().unwrap();
}

#[tokio::test]
async fn replies_resolve_by_cookie_in_wire_order() {
    let (session, mut peer) = connect(false, 4);
    let order = Arc::new(Mutex::new(Vec::new()));

    let a = {
        let session = session.clone();
        let order = order.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 0).await.unwrap();
            order.lock().unwrap().push("a");
            buf
        })
    };
    let b = {
        let session = session.clone();
        let order = order.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 4096).await.unwrap();
            order.lock().unwrap().push("b");
            buf
        })
    };

    let first = read_request(&mut peer).await;
    let second = read_request(&mut peer).await;
    let (req_a, req_b) = if first.offset == 0 {
        (first, second)
    } else {
        (second, first)
    };

    // Answer B before A; completions must follow wire order.
    write_simple(&mut peer, req_b.cookie, 0, b"BBBB").await;
    write_simple(&mut peer, req_a.cookie, 0, b"AAAA").await;

    assert_eq!(&a.await.unwrap(), b"AAAA");
    assert_eq!(&b.await.unwrap(), b"BBBB");
    assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);
}

#[tokio::test]
async fn write_header_and_payload_arrive_contiguously() {
    let (session, mut peer) = connect(false, 4);

    let client = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .request(
                    Command::Write,
                    CommandFlags::FUA,
                    2048,
                    6,
                    Some(b"zzzzzz"),
                    None,
                )
                .await
        })
    };

    let req = read_request(&mut peer).await;
    assert_eq!(req.command, Command::Write as u16);
    assert_eq!(req.flags, CommandFlags::FUA.bits());
    assert_eq!(req.offset, 2048);
    assert_eq!(req.length, 6);
    let mut payload = [0u8; 6];
    peer.read_exact(&mut payload).await.unwrap();
    assert_eq!(&payload, b"zzzzzz");
    write_simple(&mut peer, req.cookie, 0, &[]).await;

    client.await.unwrap().unwrap();
}

#[tokio::test]
async fn peer_hangup_wakes_every_waiter() {
    let (session, mut peer) = connect(false, 4);

    let a = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 0).await
        })
    };
    let b = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 4096).await
        })
    };

    read_request(&mut peer).await;
    read_request(&mut peer).await;
    drop(peer);

    assert!(matches!(
        a.await.unwrap(),
        Err(Error::Disconnected(DisconnectReason::Io(_)))
    ));
    assert!(matches!(
        b.await.unwrap(),
        Err(Error::Disconnected(DisconnectReason::Io(_)))
    ));

    // Later submissions fail fast without touching the dead transport.
    let mut buf = [0u8; 4];
    assert!(matches!(
        read(&session, &mut buf, 0).await,
        Err(Error::Disconnected(DisconnectReason::Io(_)))
    ));
    assert_eq!(session.in_flight(), 0);
}

#[tokio::test]
async fn close_fails_pending_requests_and_is_idempotent() {
    let (session, mut peer) = connect(false, 4);

    let pending = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 0).await
        })
    };
    read_request(&mut peer).await;

    session.close().await;
    session.close().await;

    assert_eq!(
        pending.await.unwrap(),
        Err(Error::Disconnected(DisconnectReason::Shutdown))
    );
    let mut buf = [0u8; 4];
    assert_eq!(
        read(&session, &mut buf, 0).await,
        Err(Error::Disconnected(DisconnectReason::Shutdown))
    );
}

#[tokio::test]
async fn oversized_error_chunk_is_rejected_before_allocation() {
    let (session, mut peer) = connect(true, 4);

    let client = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 0).await
        })
    };

    let req = read_request(&mut peer).await;
    // Header advertises 5000 payload bytes; none are sent. The client must
    // fail on the advertised length alone.
    write_chunk_raw(&mut peer, DONE, CHUNK_ERROR, req.cookie, 5000, &[]).await;

    assert!(matches!(
        client.await.unwrap(),
        Err(Error::Disconnected(DisconnectReason::Protocol(_)))
    ));
}

#[tokio::test]
async fn structured_reply_without_negotiation_is_fatal() {
    let (session, mut peer) = connect(false, 4);

    let client = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 0).await
        })
    };

    let req = read_request(&mut peer).await;
    write_chunk(
        &mut peer,
        DONE,
        CHUNK_OFFSET_DATA,
        req.cookie,
        &offset_data(0, b"data"),
    )
    .await;

    assert!(matches!(
        client.await.unwrap(),
        Err(Error::Disconnected(DisconnectReason::Protocol(_)))
    ));
}

#[tokio::test]
async fn unknown_cookie_is_fatal() {
    let (session, mut peer) = connect(false, 4);

    let client = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 0).await
        })
    };

    read_request(&mut peer).await;
    write_simple(&mut peer, 0, 0, &[]).await;

    assert!(matches!(
        client.await.unwrap(),
        Err(Error::Disconnected(DisconnectReason::Protocol(_)))
    ));
}

#[tokio::test]
async fn terminal_chunk_without_done_is_fatal() {
    let (session, mut peer) = connect(true, 4);

    let client = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 0).await
        })
    };

    let req = read_request(&mut peer).await;
    write_chunk(&mut peer, 0, CHUNK_NONE, req.cookie, &[]).await;

    assert!(matches!(
        client.await.unwrap(),
        Err(Error::Disconnected(DisconnectReason::Protocol(_)))
    ));
}

#[tokio::test]
async fn data_chunk_outside_the_buffer_is_fatal() {
    let (session, mut peer) = connect(true, 4);

    let client = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            read(&session, &mut buf, 0).await
        })
    };

    let req = read_request(&mut peer).await;
    // Covers [6, 10) of an 8-byte buffer.
    write_chunk(
        &mut peer,
        DONE,
        CHUNK_OFFSET_DATA,
        req.cookie,
        &offset_data(6, b"spill"),
    )
    .await;

    assert!(matches!(
        client.await.unwrap(),
        Err(Error::Disconnected(DisconnectReason::Protocol(_)))
    ));
}

#[tokio::test]
async fn detach_and_reattach_preserves_an_in_flight_request() {
    let (session, mut peer) = connect(false, 4);

    let client = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4];
            read(&session, &mut buf, 0).await.map(|()| buf)
        })
    };
    let req = read_request(&mut peer).await;

    // Migrate: park the dispatch loop, then resume it. The pending request
    // must ride through untouched.
    session.detach().await;
    assert_eq!(session.in_flight(), 1);
    session.attach();

    write_simple(&mut peer, req.cookie, 0, b"back").await;
    assert_eq!(&client.await.unwrap().unwrap(), b"back");
}

#[tokio::test]
async fn disconnect_notification_uses_cookie_zero() {
    let (session, mut peer) = connect(false, 4);

    session.send_disconnect().await;
    let req = read_request(&mut peer).await;
    assert_eq!(req.command, Command::Disconnect as u16);
    assert_eq!(req.cookie, 0);
    assert_eq!(req.length, 0);

    session.close().await;
}
