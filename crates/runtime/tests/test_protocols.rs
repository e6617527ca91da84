//! End-to-end protocol tests over socketpairs: framed-message wire
//! format and delivery, back-pressure, and the WebSocket engine in both
//! roles on one run loop.

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};
use vellum_core::Atom;
use vellum_runtime::error::Error;
use vellum_runtime::message::{FrameHeader, MessageChannel, MessageOptions, MsgOpcode};
use vellum_runtime::stream::{Stream, StreamKind};
use vellum_runtime::websocket::{ClientHandshake, WsChannel, WsRole};
use vellum_runtime::{register_sink, EventReceiver, RunLoop, SessionEvent};

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    // Safety: fds is a valid out-array; both ends go non-blocking so
    // raw reads in the tests never stall
    let r = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
    };
    assert_eq!(r, 0);
    for fd in fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    (fds[0], fds[1])
}

fn stream_of(fd: RawFd) -> Rc<Stream> {
    Stream::from_accepted(fd, StreamKind::Unix, None, None)
}

fn drain_fd(fd: RawFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        // Safety: reading into a stack buffer
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            break;
        }
        out.extend_from_slice(&buf[..n as usize]);
        if (n as usize) < buf.len() {
            break;
        }
    }
    out
}

fn spin(rl: &RunLoop, rounds: usize) {
    for _ in 0..rounds {
        let _ = rl.run_once(Some(Duration::from_millis(5)));
    }
}

fn wait_event(rl: &RunLoop, rx: &EventReceiver, deadline: Duration) -> Option<SessionEvent> {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if let Ok(ev) = rx.try_recv() {
            return Some(ev);
        }
        let _ = rl.run_once(Some(Duration::from_millis(5)));
    }
    None
}

fn parse_frames(mut wire: &[u8]) -> Vec<(MsgOpcode, u32, Vec<u8>)> {
    let mut frames = Vec::new();
    while wire.len() >= 12 {
        let header: [u8; 12] = wire[..12].try_into().unwrap();
        let h = FrameHeader::from_bytes(&header).expect("valid header");
        let sz = h.sz_payload as usize;
        frames.push((h.op, h.fragmented, wire[12..12 + sz].to_vec()));
        wire = &wire[12 + sz..];
    }
    assert!(wire.is_empty(), "trailing garbage on the wire");
    frames
}

#[test]
fn test_message_single_frame_wire() {
    let (a, b) = socketpair();
    let chan = MessageChannel::attach(&stream_of(a), MessageOptions::default()).unwrap();

    chan.send_message(true, b"HELLOWORLD").unwrap();
    let frames = parse_frames(&drain_fd(b));
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, MsgOpcode::Text);
    assert_eq!(frames[0].1, 0); // not fragmented
    assert_eq!(frames[0].2, b"HELLOWORLD");

    chan.close().unwrap();
    unsafe { libc::close(b) };
}

#[test]
fn test_message_fragmentation_wire() {
    let (a, b) = socketpair();
    // frame payload floor is 1 KiB
    let opts = MessageOptions::clamped(1, 0, 0, 0);
    assert_eq!(opts.max_frame_payload_size, 1024);
    let chan = MessageChannel::attach(&stream_of(a), opts).unwrap();

    let message = vec![0x42u8; 10_000];
    chan.send_message(false, &message).unwrap();

    let frames = parse_frames(&drain_fd(b));
    // one BIN + floor((|m|-1)/max) further frames, the last being END
    assert_eq!(frames.len(), 1 + (message.len() - 1) / 1024);
    assert_eq!(frames[0].0, MsgOpcode::Bin);
    assert_eq!(frames[0].1, 10_000);
    assert_eq!(frames[0].2.len(), 1024);
    for f in &frames[1..frames.len() - 1] {
        assert_eq!(f.0, MsgOpcode::Continuation);
        assert_eq!(f.1, 0);
        assert_eq!(f.2.len(), 1024);
    }
    let last = frames.last().unwrap();
    assert_eq!(last.0, MsgOpcode::End);
    assert_eq!(last.2.len(), 10_000 - 1024 * (frames.len() - 1));

    let total: usize = frames.iter().map(|f| f.2.len()).sum();
    assert_eq!(total, 10_000);

    chan.close().unwrap();
    unsafe { libc::close(b) };
}

#[test]
fn test_message_end_to_end_delivery() {
    let rl = RunLoop::current();
    let (a, b) = socketpair();
    let sender = MessageChannel::attach(&stream_of(a), MessageOptions::default()).unwrap();
    let receiver = MessageChannel::attach(&stream_of(b), MessageOptions::default()).unwrap();

    let target = Atom::intern("test:msg-e2e");
    let rx = register_sink(target);
    receiver.observe("message", target);

    sender.send_message(true, b"first").unwrap();
    sender.send_message(true, b"second").unwrap();

    let mut ev = wait_event(&rl, &rx, Duration::from_secs(2)).expect("first message");
    assert_eq!(ev.event, "message");
    let payload = ev.take_payload().unwrap();
    assert_eq!(payload.as_str().unwrap(), "first");

    let mut ev = wait_event(&rl, &rx, Duration::from_secs(2)).expect("second message");
    let payload = ev.take_payload().unwrap();
    assert_eq!(payload.as_str().unwrap(), "second");

    // fragmented delivery reassembles
    let big = "x".repeat(9000);
    sender.send_message(true, big.as_bytes()).unwrap();
    let mut ev = wait_event(&rl, &rx, Duration::from_secs(2)).expect("big message");
    let payload = ev.take_payload().unwrap();
    assert_eq!(payload.as_str().unwrap(), big);

    // the receiver observes the peer's CLOSE frame
    receiver.observe("close", target);
    sender.close().unwrap();
    let mut ev = wait_event(&rl, &rx, Duration::from_secs(2)).expect("close event");
    assert_eq!(ev.event, "close");
    assert_eq!(ev.take_payload().unwrap().as_str().unwrap(), "Bye");
}

#[test]
fn test_message_ping_answered_with_pong() {
    let (a, b) = socketpair();
    let chan = MessageChannel::attach(&stream_of(a), MessageOptions::default()).unwrap();
    let rl = RunLoop::current();

    // hand-craft a PING frame on the peer side
    let ping = FrameHeader {
        op: MsgOpcode::Ping,
        fragmented: 0,
        sz_payload: 0,
    }
    .to_bytes();
    // Safety: writing the frame into the socketpair
    unsafe { libc::write(b, ping.as_ptr().cast(), ping.len()) };

    spin(&rl, 20);

    let frames = parse_frames(&drain_fd(b));
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, MsgOpcode::Pong);

    chan.close().unwrap();
    unsafe { libc::close(b) };
}

#[test]
fn test_message_back_pressure() {
    let (a, b) = socketpair();
    let chan = MessageChannel::attach(&stream_of(a), MessageOptions::default()).unwrap();

    // the peer never reads; pending output grows until throttling
    let payload = vec![7u8; 60_000];
    let mut accepted = 0usize;
    let hit_again = loop {
        match chan.send_message(false, &payload) {
            Ok(()) => {
                accepted += 1;
                if accepted > 100 {
                    break false;
                }
            }
            Err(Error::Again) => break true,
            Err(e) => panic!("unexpected error: {e}"),
        }
    };
    assert!(hit_again, "send never hit back-pressure");
    assert!(chan.sz_pending() > 0);

    // draining the peer clears the way again
    let rl = RunLoop::current();
    let mut drained = 0usize;
    let until = Instant::now() + Duration::from_secs(5);
    while Instant::now() < until {
        drained += drain_fd(b).len();
        spin(&rl, 2);
        if chan.send_message(false, b"again ok").is_ok() {
            break;
        }
    }
    assert!(drained > 0);
    chan.send_message(false, b"after drain").unwrap();

    chan.close().unwrap();
    unsafe { libc::close(b) };
}

// ---------------------------------------------------------------------------
// websocket

struct WsPair {
    client: Rc<WsChannel>,
    server: Rc<WsChannel>,
    client_rx: EventReceiver,
    server_rx: EventReceiver,
}

fn ws_pair(test_tag: &str) -> WsPair {
    let (a, b) = socketpair();
    let client_target = Atom::intern(&format!("test:ws-client-{test_tag}"));
    let server_target = Atom::intern(&format!("test:ws-server-{test_tag}"));
    let client_rx = register_sink(client_target);
    let server_rx = register_sink(server_target);

    let server = WsChannel::attach(
        &stream_of(b),
        WsRole::ServerWorker,
        MessageOptions::default(),
        None,
        None,
    )
    .unwrap();
    for ev in ["handshake", "message", "error", "close"] {
        server.observe(ev, server_target);
    }

    let client = WsChannel::attach(
        &stream_of(a),
        WsRole::Client,
        MessageOptions::default(),
        None,
        Some(ClientHandshake {
            path: Some("/chat".to_string()),
            host: Some("server.example.org".to_string()),
            ..Default::default()
        }),
    )
    .unwrap();
    for ev in ["handshake", "message", "error", "close"] {
        client.observe(ev, client_target);
    }

    WsPair {
        client,
        server,
        client_rx,
        server_rx,
    }
}

fn complete_handshake(rl: &RunLoop, pair: &WsPair) {
    // server sees the upgrade request
    let mut ev = wait_event(rl, &pair.server_rx, Duration::from_secs(2))
        .expect("server handshake event");
    assert_eq!(ev.event, "handshake");
    let req = ev.take_payload().unwrap();
    assert_eq!(
        req.object_get("Path").unwrap().unwrap().as_str().unwrap(),
        "/chat"
    );
    assert_eq!(
        req.object_get("Sec-WebSocket-Version")
            .unwrap()
            .unwrap()
            .as_str()
            .unwrap(),
        "13"
    );

    // the application approves the upgrade
    pair.server.send_handshake_resp(101, None, None).unwrap();

    // client verifies the 101 and the accept value
    let mut ev = wait_event(rl, &pair.client_rx, Duration::from_secs(2))
        .expect("client handshake event");
    assert_eq!(ev.event, "handshake");
    let resp = ev.take_payload().unwrap();
    assert_eq!(
        vellum_core::numerify(&resp.object_get("Status").unwrap().unwrap()),
        101.0
    );
    assert_eq!(
        resp.object_get("Extra-Message")
            .unwrap()
            .unwrap()
            .as_str()
            .unwrap(),
        "Everything is ok"
    );
}

#[test]
fn test_websocket_handshake_and_messages() {
    let rl = RunLoop::current();
    let pair = ws_pair("hs");
    complete_handshake(&rl, &pair);

    // client -> server (masked on the wire, transparent here)
    pair.client.send_message(true, b"hello from client").unwrap();
    let mut ev = wait_event(&rl, &pair.server_rx, Duration::from_secs(2))
        .expect("server message");
    assert_eq!(ev.event, "message");
    assert_eq!(
        ev.take_payload().unwrap().as_str().unwrap(),
        "hello from client"
    );

    // server -> client, binary
    pair.server.send_message(false, &[1, 2, 3, 250]).unwrap();
    let mut ev = wait_event(&rl, &pair.client_rx, Duration::from_secs(2))
        .expect("client message");
    assert_eq!(
        ev.take_payload().unwrap().as_bytes().unwrap(),
        &[1, 2, 3, 250]
    );
}

#[test]
fn test_websocket_fragmented_message() {
    let rl = RunLoop::current();
    let pair = ws_pair("frag");
    complete_handshake(&rl, &pair);

    // several frames' worth of payload reassembles into one message
    let big = "w".repeat(20_000);
    pair.client.send_message(true, big.as_bytes()).unwrap();
    let mut ev = wait_event(&rl, &pair.server_rx, Duration::from_secs(2))
        .expect("reassembled message");
    assert_eq!(ev.take_payload().unwrap().as_str().unwrap(), big);
}

#[test]
fn test_websocket_close_codes() {
    let rl = RunLoop::current();
    let pair = ws_pair("close");
    complete_handshake(&rl, &pair);

    pair.client.close().unwrap();
    let mut ev = wait_event(&rl, &pair.server_rx, Duration::from_secs(2))
        .expect("server close event");
    assert_eq!(ev.event, "close");
    let info = ev.take_payload().unwrap();
    assert_eq!(
        vellum_core::numerify(&info.object_get("code").unwrap().unwrap()),
        1000.0
    );
}

#[test]
fn test_websocket_invalid_utf8_closes_1007() {
    let rl = RunLoop::current();
    let pair = ws_pair("utf8");
    complete_handshake(&rl, &pair);

    // a TEXT message with invalid UTF-8 from the server side
    pair.server
        .send_message(true, &[0xFF, 0xFE, 0x80, 0x81])
        .unwrap();

    // the client rejects it and tells the server with close code 1007
    let mut ev = wait_event(&rl, &pair.server_rx, Duration::from_secs(2))
        .expect("server close event");
    assert_eq!(ev.event, "close");
    let info = ev.take_payload().unwrap();
    assert_eq!(
        vellum_core::numerify(&info.object_get("code").unwrap().unwrap()),
        1007.0
    );

    // the client reported the protocol failure locally
    let mut saw_error = false;
    while let Some(ev) = wait_event(&rl, &pair.client_rx, Duration::from_millis(200)) {
        if ev.event == "error" {
            saw_error = true;
            break;
        }
    }
    assert!(saw_error);
}

#[test]
fn test_websocket_rejected_upgrade() {
    let rl = RunLoop::current();
    let pair = ws_pair("reject");

    let ev = wait_event(&rl, &pair.server_rx, Duration::from_secs(2))
        .expect("server handshake event");
    assert_eq!(ev.event, "handshake");

    // the application turns the client away
    pair.server.send_handshake_resp(503, None, None).unwrap();

    let mut ev = wait_event(&rl, &pair.client_rx, Duration::from_secs(2))
        .expect("client handshake event");
    assert_eq!(ev.event, "handshake");
    let resp = ev.take_payload().unwrap();
    assert_eq!(
        vellum_core::numerify(&resp.object_get("Status").unwrap().unwrap()),
        503.0
    );
}
