//! Wire-level checks against a live server, speaking raw frames over a
//! plain socket so the exact on-wire bytes can be asserted.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use weft::{FrameFlags, FrameHeader, FrameType, RpcContext, RpcServer, HEADER_LEN};

async fn start_server() -> SocketAddr {
    let mut server = RpcServer::new("127.0.0.1", 0);
    server.register("Example.Echo", |_ctx, body| async move { body });
    server.register("Example.Slow", |_ctx: RpcContext, _body| async move {
        // Deliberately outlives any test; only cancellation ends it.
        tokio::time::sleep(Duration::from_secs(30)).await;
        b"too late".to_vec()
    });

    let bound = server.bind().await.expect("bind");
    let addr = bound.local_addr().expect("local addr");
    tokio::spawn(bound.serve());
    addr
}

async fn write_frame(socket: &mut TcpStream, hdr: &FrameHeader, body: &[u8]) {
    socket.write_all(&hdr.to_bytes()).await.expect("write header");
    if !body.is_empty() {
        socket.write_all(body).await.expect("write body");
    }
}

async fn read_frame(socket: &mut TcpStream) -> (FrameHeader, Vec<u8>) {
    let mut head = [0u8; HEADER_LEN];
    socket.read_exact(&mut head).await.expect("read header");
    let hdr = FrameHeader::decode(&head).expect("parse header");
    let mut body = vec![0u8; hdr.length as usize];
    if !body.is_empty() {
        socket.read_exact(&mut body).await.expect("read body");
    }
    (hdr, body)
}

#[tokio::test]
async fn unknown_method_error_bytes_are_exact() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.expect("connect");

    let request = FrameHeader::request(1, weft::method_id("Example.Missing"), 1);
    write_frame(&mut socket, &request, b"x").await;

    let (hdr, body) = read_frame(&mut socket).await;
    assert_eq!(hdr.frame_type(), Some(FrameType::Response));
    assert_eq!(hdr.stream_id, 1);
    assert!(hdr.flags.contains(FrameFlags::ERROR));
    assert!(hdr.flags.contains(FrameFlags::END_STREAM));

    // 404 big-endian, then length 14, then the message.
    assert_eq!(&body[0..4], &[0x00, 0x00, 0x01, 0x94]);
    assert_eq!(&body[4..8], &[0x00, 0x00, 0x00, 0x0e]);
    assert_eq!(&body[8..], b"Unknown method");

    // The connection stays open: an echo still round-trips.
    let request = FrameHeader::request(2, weft::method_id("Example.Echo"), 5);
    write_frame(&mut socket, &request, b"still").await;
    let (hdr, body) = read_frame(&mut socket).await;
    assert_eq!(hdr.stream_id, 2);
    assert!(!hdr.flags.contains(FrameFlags::ERROR));
    assert_eq!(body, b"still");
}

#[tokio::test]
async fn ping_gets_a_mirrored_pong() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.expect("connect");

    write_frame(&mut socket, &FrameHeader::ping(7), &[]).await;

    let (hdr, body) = read_frame(&mut socket).await;
    assert_eq!(hdr.frame_type(), Some(FrameType::Pong));
    assert_eq!(hdr.stream_id, 7);
    assert_eq!(hdr.method_id, 0);
    assert_eq!(hdr.length, 0);
    assert!(body.is_empty());
}

#[tokio::test]
async fn response_mirrors_request_identity() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.expect("connect");

    let method = weft::method_id("Example.Echo");
    let request = FrameHeader::request(0x0abc_def0, method, 3);
    write_frame(&mut socket, &request, b"abc").await;

    let (hdr, body) = read_frame(&mut socket).await;
    assert_eq!(hdr.stream_id, 0x0abc_def0);
    assert_eq!(hdr.method_id, method);
    assert_eq!(body, b"abc");
}

#[tokio::test]
async fn bad_magic_terminates_the_connection() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.expect("connect");

    let mut bytes = FrameHeader::ping(1).to_bytes();
    bytes[0] = 0x58;
    socket.write_all(&bytes).await.expect("write");

    // The server shuts down; we observe EOF rather than a frame.
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .expect("server closed in bounded time")
        .expect("read");
    assert_eq!(n, 0);
}

#[tokio::test]
async fn bad_version_terminates_the_connection() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.expect("connect");

    let mut bytes = FrameHeader::ping(1).to_bytes();
    bytes[4] = 9;
    socket.write_all(&bytes).await.expect("write");

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .expect("server closed in bounded time")
        .expect("read");
    assert_eq!(n, 0);
}

#[tokio::test]
async fn cancel_suppresses_the_response() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.expect("connect");

    // Start a request that only finishes when cancelled, then cancel it.
    let slow = weft::method_id("Example.Slow");
    write_frame(&mut socket, &FrameHeader::request(9, slow, 0), &[]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    write_frame(&mut socket, &FrameHeader::cancel(9, slow), &[]).await;

    // A ping right after still round-trips, and no Response for stream 9
    // ever shows up ahead of the pong.
    write_frame(&mut socket, &FrameHeader::ping(10), &[]).await;
    let (hdr, _) = read_frame(&mut socket).await;
    assert_eq!(hdr.frame_type(), Some(FrameType::Pong));
    assert_eq!(hdr.stream_id, 10);

    // And nothing else arrives afterwards either.
    let mut buf = [0u8; 1];
    let extra = tokio::time::timeout(Duration::from_millis(200), socket.read(&mut buf)).await;
    assert!(extra.is_err(), "unexpected frame after cancelled request");
}

#[tokio::test]
async fn reserved_word_and_unknown_flags_are_tolerated() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.expect("connect");

    let request = FrameHeader::request(3, weft::method_id("Example.Echo"), 4)
        .with(FrameFlags::from_bits_retain(0xC000));
    let mut bytes = request.to_bytes();
    bytes[8..12].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]); // reserved word
    socket.write_all(&bytes).await.expect("write header");
    socket.write_all(b"data").await.expect("write body");

    let (hdr, body) = read_frame(&mut socket).await;
    assert_eq!(hdr.stream_id, 3);
    assert!(!hdr.flags.contains(FrameFlags::ERROR));
    assert_eq!(body, b"data");
}

#[tokio::test]
async fn reserved_frame_types_are_ignored() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.expect("connect");

    // Stream frames are reserved; an unknown tag is ignored too.
    let stream_frame = FrameHeader::new(FrameType::Stream, 5, 0, 2);
    write_frame(&mut socket, &stream_frame, b"xx").await;
    let mut unknown = FrameHeader::ping(6).to_bytes();
    unknown[5] = 0x2a;
    socket.write_all(&unknown).await.expect("write");

    // Connection is still serving.
    write_frame(&mut socket, &FrameHeader::ping(11), &[]).await;
    let (hdr, _) = read_frame(&mut socket).await;
    assert_eq!(hdr.frame_type(), Some(FrameType::Pong));
    assert_eq!(hdr.stream_id, 11);
}

#[tokio::test]
async fn oversized_length_terminates_the_connection() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.expect("connect");

    // 64 MiB declared body, nothing sent: the length guard trips first.
    let hdr = FrameHeader::request(1, weft::method_id("Example.Echo"), 64 * 1024 * 1024);
    socket.write_all(&hdr.to_bytes()).await.expect("write");

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .expect("server closed in bounded time")
        .expect("read");
    assert_eq!(n, 0);
}

#[tokio::test]
async fn pipelined_requests_may_complete_out_of_order() {
    let mut server = RpcServer::new("127.0.0.1", 0);
    server.register("Example.Sleep", |_ctx, body| async move {
        let ms = u64::from(body[0]);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        body
    });
    let bound = server.bind().await.expect("bind");
    let addr = bound.local_addr().expect("local addr");
    tokio::spawn(bound.serve());

    let mut socket = TcpStream::connect(addr).await.expect("connect");
    let sleep = weft::method_id("Example.Sleep");

    // First request sleeps 100ms, second 1ms: responses swap order.
    write_frame(&mut socket, &FrameHeader::request(1, sleep, 1), &[100]).await;
    write_frame(&mut socket, &FrameHeader::request(2, sleep, 1), &[1]).await;

    let (first, _) = read_frame(&mut socket).await;
    let (second, _) = read_frame(&mut socket).await;
    assert_eq!(first.stream_id, 2);
    assert_eq!(second.stream_id, 1);
}
