//! WebSocket engine (RFC 6455)
//!
//! One frame codec serves every role; only the handshake differs:
//!
//! - *client*: sends the upgrade request, verifies the 101 response and
//!   `Sec-WebSocket-Accept`;
//! - *server worker*: reads and validates the upgrade request, emits a
//!   `handshake` event, and lets the application answer through
//!   `send_handshake_resp`;
//! - *server worker without handshake*: the listener already upgraded
//!   the connection; frames flow immediately.
//!
//! Clients must mask data frames, servers must not. Control frames ride
//! with FIN set and at most 125 payload bytes. Inbound TEXT is verified
//! as UTF-8 (close 1007 otherwise); a message over the configured limit
//! closes with 1009; protocol violations close with 1002.

use crate::error::{set_last_error, Error};
use crate::event::{self, current_coroutine};
use crate::io::{IoOutcome, PlainTransport, Transport, WriteQueue, SOCK_THROTTLE_THLD};
use crate::message::MessageOptions;
use crate::runloop::{IoEvent, IoEvents, MonitorId, RunLoop, TimerId};
use crate::status::{FatalReason, Status, StreamFlag};
use crate::stream::Stream;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};
use vellum_core::{Atom, NativeMethod, NativeOps, Variant};

pub const WS_MAGIC_STR: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const WS_KEY_LEN: usize = 16;

const WS_BAD_REQUEST_STR: &str = "HTTP/1.1 400 Invalid Request\r\n\r\n";
const WS_INTERNAL_ERROR_STR: &str = "HTTP/1.1 505 Internal Server Error\r\n\r\n";
const CRLF: &str = "\r\n";

/// Handshake buffers grow in these steps up to the cap.
const SZ_HSBUF_INC: usize = 512;
const SZ_HSBUF_MAX: usize = 8192;

pub const WS_CLOSE_NORMAL: u16 = 1000;
pub const WS_CLOSE_GOING_AWAY: u16 = 1001;
pub const WS_CLOSE_PROTO_ERR: u16 = 1002;
pub const WS_CLOSE_INVALID_UTF8: u16 = 1007;
pub const WS_CLOSE_TOO_LARGE: u16 = 1009;
pub const WS_CLOSE_UNEXPECTED: u16 = 1011;

pub const EVENT_HANDSHAKE: &str = "handshake";
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_CLOSE: &str = "close";

const USER_AGENT: &str = "Mozilla/5.0 (Linux) Vellum/0.3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsRole {
    Client,
    Server,
    ServerWorker,
    ServerWorkerNoHandshake,
}

impl WsRole {
    fn is_server_side(self) -> bool {
        !matches!(self, WsRole::Client)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsOpcode {
    Continuation = 0x0,
    Text = 0x1,
    Bin = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl WsOpcode {
    fn from_bits(v: u8) -> Option<WsOpcode> {
        match v {
            0x0 => Some(WsOpcode::Continuation),
            0x1 => Some(WsOpcode::Text),
            0x2 => Some(WsOpcode::Bin),
            0x8 => Some(WsOpcode::Close),
            0x9 => Some(WsOpcode::Ping),
            0xA => Some(WsOpcode::Pong),
            _ => None,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, WsOpcode::Close | WsOpcode::Ping | WsOpcode::Pong)
    }
}

/// `base64(SHA1(key || magic))`.
pub fn key_to_accept(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_MAGIC_STR.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Build one frame into a contiguous buffer: small header, optional
/// extended length, optional mask, payload (masked in place).
pub(crate) fn encode_frame(
    fin: bool,
    op: WsOpcode,
    mask: Option<[u8; 4]>,
    payload: &[u8],
) -> Vec<u8> {
    let sz = payload.len();
    let mut buf = Vec::with_capacity(2 + 8 + 4 + sz);
    let mut b0 = op as u8;
    if fin {
        b0 |= 0x80;
    }
    buf.push(b0);

    let mask_bit = if mask.is_some() { 0x80u8 } else { 0 };
    if sz > 0xffff {
        buf.push(mask_bit | 127);
        buf.extend_from_slice(&(sz as u64).to_be_bytes());
    } else if sz > 125 {
        buf.push(mask_bit | 126);
        buf.extend_from_slice(&(sz as u16).to_be_bytes());
    } else {
        buf.push(mask_bit | sz as u8);
    }

    match mask {
        Some(m) => {
            buf.extend_from_slice(&m);
            buf.extend(payload.iter().enumerate().map(|(i, &b)| b ^ m[i % 4]));
        }
        None => buf.extend_from_slice(payload),
    }
    buf
}

/// Options for the client-side upgrade request.
#[derive(Debug, Clone, Default)]
pub struct ClientHandshake {
    pub path: Option<String>,
    pub host: Option<String>,
    pub origin: Option<String>,
    pub useragent: Option<String>,
    pub referer: Option<String>,
    pub extensions: Option<String>,
    pub subprotocols: Option<String>,
}

impl ClientHandshake {
    /// Pick the handshake fields out of an options object.
    pub fn from_variant(opts: &Variant) -> ClientHandshake {
        let get = |key: &str| -> Option<String> {
            opts.object_get(key)
                .ok()
                .flatten()
                .and_then(|v| v.as_str().map(str::to_string))
        };
        ClientHandshake {
            path: get("path"),
            host: get("host"),
            origin: get("origin"),
            useragent: get("useragent"),
            referer: get("referer"),
            extensions: get("extensions"),
            subprotocols: get("subprotocols"),
        }
    }
}

const K_HANDSHAKE: usize = 0;
const K_MESSAGE: usize = 1;
const K_ERROR: usize = 2;
const K_CLOSE: usize = 3;

/// Per-frame decode progress.
enum RState {
    Header,
    ExtLen(u8),
    Mask,
    Payload,
}

struct WsState {
    transport: Box<dyn Transport>,
    fd_read: RawFd,
    fd_write: RawFd,
    role: WsRole,
    status: Status,
    queue: WriteQueue,
    opts: MessageOptions,
    last_live: Instant,
    ping_timer: Option<TimerId>,
    monitor_r: Option<MonitorId>,
    monitor_w: Option<MonitorId>,

    // handshake phase
    hsbuf: Vec<u8>,
    ws_key: Option<String>,

    // frame decode
    rstate: RState,
    scratch: [u8; 8],
    sz_scratch: usize,
    fin: bool,
    opcode: WsOpcode,
    masked: bool,
    mask: [u8; 4],
    payload_len: usize,
    payload: Vec<u8>,
    sz_read_payload: usize,

    // message assembly
    msg_op: Option<WsOpcode>,
    message: Vec<u8>,

    targets: [Option<Atom>; 4],
    released: bool,
}

pub struct WsChannel {
    state: RefCell<WsState>,
}

impl WsChannel {
    fn build(
        fd_read: RawFd,
        fd_write: RawFd,
        transport: Box<dyn Transport>,
        role: WsRole,
        opts: MessageOptions,
    ) -> Rc<WsChannel> {
        Rc::new(WsChannel {
            state: RefCell::new(WsState {
                transport,
                fd_read,
                fd_write,
                role,
                status: Status::default(),
                queue: WriteQueue::default(),
                opts,
                last_live: Instant::now(),
                ping_timer: None,
                monitor_r: None,
                monitor_w: None,
                hsbuf: Vec::new(),
                ws_key: None,
                rstate: RState::Header,
                scratch: [0u8; 8],
                sz_scratch: 0,
                fin: false,
                opcode: WsOpcode::Continuation,
                masked: false,
                mask: [0u8; 4],
                payload_len: 0,
                payload: Vec::new(),
                sz_read_payload: 0,
                msg_op: None,
                message: Vec::new(),
                targets: [None; 4],
                released: false,
            }),
        })
    }

    /// Take over a connected socket in the given role. `tls` wraps the
    /// I/O; with TLS still handshaking, reads and writes park in the
    /// session until it completes.
    pub fn attach(
        stream: &Rc<Stream>,
        role: WsRole,
        opts: MessageOptions,
        tls: Option<Box<dyn Transport>>,
        client_hs: Option<ClientHandshake>,
    ) -> Result<Rc<WsChannel>, Error> {
        let peer_host = stream.peer_addr();
        let (fd_read, fd_write) = stream.take_fds();
        if fd_read < 0 {
            return Err(set_last_error(Error::EntityGone));
        }
        crate::runloop::set_nonblocking(fd_read)?;

        let transport: Box<dyn Transport> =
            tls.unwrap_or_else(|| Box::new(PlainTransport { fd_read, fd_write }));

        let chan = Self::build(fd_read, fd_write, transport, role, opts);
        chan.install_monitors()?;
        chan.start_ping_timer();

        match role {
            WsRole::Client => {
                let hs = client_hs.unwrap_or_default();
                chan.send_client_handshake(&hs, peer_host.as_deref())?;
            }
            WsRole::Server | WsRole::ServerWorker => {
                chan.state
                    .borrow_mut()
                    .status
                    .set(StreamFlag::Waiting4HsRequ);
            }
            WsRole::ServerWorkerNoHandshake => {}
        }
        Ok(chan)
    }

    fn install_monitors(self: &Rc<Self>) -> Result<(), Error> {
        let rl = RunLoop::current();
        let weak = Rc::downgrade(self);
        let mut st = self.state.borrow_mut();
        let fd = st.fd_read;
        st.monitor_r = Some(rl.install_monitor(
            fd,
            IoEvents::from(IoEvent::In) | IoEvent::Hup | IoEvent::Err,
            Rc::new(move |_, got| match weak.upgrade() {
                Some(chan) => chan.on_io(got),
                None => false,
            }),
        )?);
        Ok(())
    }

    fn ensure_write_monitor(self: &Rc<Self>) {
        let rl = RunLoop::current();
        let mut st = self.state.borrow_mut();
        if st.monitor_w.is_some() || st.queue.is_empty() {
            return;
        }
        let weak = Rc::downgrade(self);
        let fd = st.fd_write;
        st.monitor_w = rl
            .install_monitor(
                fd,
                IoEvent::Out.into(),
                Rc::new(move |_, _| match weak.upgrade() {
                    Some(chan) => chan.on_writable(),
                    None => false,
                }),
            )
            .ok();
    }

    fn start_ping_timer(self: &Rc<Self>) {
        let interval = {
            let st = self.state.borrow();
            Duration::from_secs((st.opts.no_resp_time_to_ping / 3).max(1) as u64)
        };
        let weak = Rc::downgrade(self);
        let id = RunLoop::current().set_timer(
            interval,
            Rc::new(move || match weak.upgrade() {
                Some(chan) => chan.on_ping_timer(),
                None => false,
            }),
        );
        self.state.borrow_mut().ping_timer = Some(id);
    }

    pub fn observe(&self, eventname: &str, target: Atom) -> bool {
        let slot = match eventname {
            EVENT_HANDSHAKE => K_HANDSHAKE,
            EVENT_MESSAGE => K_MESSAGE,
            EVENT_ERROR => K_ERROR,
            EVENT_CLOSE => K_CLOSE,
            _ => return false,
        };
        self.state.borrow_mut().targets[slot] = Some(target);
        true
    }

    pub fn forget(&self, eventname: &str) -> bool {
        let slot = match eventname {
            EVENT_HANDSHAKE => K_HANDSHAKE,
            EVENT_MESSAGE => K_MESSAGE,
            EVENT_ERROR => K_ERROR,
            EVENT_CLOSE => K_CLOSE,
            _ => return false,
        };
        self.state.borrow_mut().targets[slot] = None;
        true
    }

    fn post(&self, slot: usize, name: &str, payload: Option<Variant>) {
        let target = self.state.borrow().targets[slot];
        if let Some(target) = target {
            let _ = event::post_event(target, "websocket", name, None, payload);
        }
    }

    fn post_error(&self, err: Error) {
        let data = Variant::object();
        let _ = data.object_set("code", Variant::string(&format!("{err:?}")));
        let _ = data.object_set("postscript", Variant::string(&err.to_string()));
        self.post(K_ERROR, EVENT_ERROR, Some(data));
    }

    fn write_or_queue(self: &Rc<Self>, buf: &[u8]) -> Result<(), Error> {
        {
            let mut st = self.state.borrow_mut();
            let WsState {
                transport,
                queue,
                status,
                ..
            } = &mut *st;
            queue
                .write_or_queue(transport.as_mut(), buf, status)
                .map_err(|_| set_last_error(Error::IoFailure))?;
        }
        self.ensure_write_monitor();
        Ok(())
    }

    fn send_frame(
        self: &Rc<Self>,
        fin: bool,
        op: WsOpcode,
        payload: &[u8],
    ) -> Result<(), Error> {
        let mask = if self.state.borrow().role == WsRole::Client {
            Some(rand::random::<[u8; 4]>())
        } else {
            None
        };
        let frame = encode_frame(fin, op, mask, payload);
        self.write_or_queue(&frame)
    }

    /// Control frames must fit 125 bytes; longer payloads are dropped.
    fn send_ctrl_frame(self: &Rc<Self>, op: WsOpcode, payload: &[u8]) -> Result<(), Error> {
        let payload = if payload.len() > 125 {
            tracing::warn!("control frame payload truncated");
            &[]
        } else {
            payload
        };
        self.send_frame(true, op, payload)
    }

    /// Send a CLOSE frame carrying `code` and a short reason.
    pub fn notify_to_close(self: &Rc<Self>, code: u16, reason: &str) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(2 + reason.len());
        buf.extend_from_slice(&code.to_be_bytes());
        buf.extend_from_slice(&reason.as_bytes()[..reason.len().min(123)]);
        self.send_ctrl_frame(WsOpcode::Close, &buf)
    }

    fn frames_overhead(sz: usize, max_payload: usize) -> usize {
        let frames = if sz > max_payload {
            sz / max_payload + 1
        } else {
            1
        };
        frames * (2 + 8 + 4)
    }

    /// Send one logical message, fragmenting by the frame payload limit.
    pub fn send_message(self: &Rc<Self>, text: bool, data: &[u8]) -> Result<(), Error> {
        {
            let st = self.state.borrow();
            if st.released {
                return Err(set_last_error(Error::EntityGone));
            }
            if st.status.flags.intersects(
                StreamFlag::Waiting4HsRequ | StreamFlag::Waiting4HsResp,
            ) {
                return Err(set_last_error(Error::NotSupported));
            }
            if data.len() > st.opts.max_message_size {
                return Err(set_last_error(Error::TooLargeEntity));
            }
            if st.status.contains(StreamFlag::Throttling)
                || st.queue.sz_pending()
                    + data.len()
                    + Self::frames_overhead(data.len(), st.opts.max_frame_payload_size)
                    >= SOCK_THROTTLE_THLD
            {
                return Err(set_last_error(Error::Again));
            }
        }

        let max = self.state.borrow().opts.max_frame_payload_size;
        let first_op = if text { WsOpcode::Text } else { WsOpcode::Bin };
        if data.len() > max {
            let mut off = 0usize;
            let mut first = true;
            while off < data.len() {
                let left = data.len() - off;
                let take = left.min(max);
                let fin = left <= max; // only the last fragment carries FIN
                let op = if first { first_op } else { WsOpcode::Continuation };
                self.send_frame(fin, op, &data[off..off + take])?;
                first = false;
                off += take;
            }
        } else {
            self.send_frame(true, first_op, data)?;
        }

        if let Some(reason) = self.state.borrow().status.fatal {
            return Err(set_last_error(reason.to_error()));
        }
        Ok(())
    }

    // -- handshake, client side

    fn send_client_handshake(
        self: &Rc<Self>,
        hs: &ClientHandshake,
        peer_host: Option<&str>,
    ) -> Result<(), Error> {
        let key_bytes: [u8; WS_KEY_LEN] = rand::random();
        let key = BASE64.encode(key_bytes);

        let path = hs.path.as_deref().unwrap_or("/");
        let host = hs
            .host
            .as_deref()
            .or(peer_host)
            .ok_or_else(|| set_last_error(Error::InvalidValue))?;
        let origin = hs.origin.as_deref().unwrap_or(host);
        let useragent = hs.useragent.as_deref().unwrap_or(USER_AGENT);

        let mut req = format!(
            "GET {path} HTTP/1.1{CRLF}\
             Upgrade: websocket{CRLF}\
             Connection: Upgrade{CRLF}\
             Host: {host}{CRLF}\
             Origin: {origin}{CRLF}\
             User-Agent: {useragent}{CRLF}\
             Sec-WebSocket-Key: {key}{CRLF}\
             Sec-WebSocket-Version: 13{CRLF}"
        );
        if let Some(referer) = &hs.referer {
            req.push_str(&format!("Referer: {referer}{CRLF}"));
        }
        if let Some(ext) = &hs.extensions {
            req.push_str(&format!("Sec-WebSocket-Extensions: {ext}{CRLF}"));
        }
        if let Some(protos) = &hs.subprotocols {
            req.push_str(&format!("Sec-WebSocket-Protocol: {protos}{CRLF}"));
        }
        req.push_str(CRLF);

        self.write_or_queue(req.as_bytes())?;
        let mut st = self.state.borrow_mut();
        st.ws_key = Some(key);
        st.status.set(StreamFlag::Waiting4HsResp);
        Ok(())
    }

    // -- handshake, server side

    /// Answer a validated upgrade request. A 101 completes the upgrade;
    /// anything else is sent verbatim and the stream closes.
    pub fn send_handshake_resp(
        self: &Rc<Self>,
        status_code: u16,
        protocol: Option<&str>,
        extensions: Option<&str>,
    ) -> Result<(), Error> {
        if status_code != 101 {
            let line = format!("HTTP/1.1 {status_code} Refused{CRLF}{CRLF}");
            self.write_or_queue(line.as_bytes())?;
            self.state.borrow_mut().status.set(StreamFlag::Closing);
            self.handle_rwerr_close();
            return Ok(());
        }

        let key = self
            .state
            .borrow()
            .ws_key
            .clone()
            .ok_or_else(|| set_last_error(Error::NotSupported))?;
        let accept = key_to_accept(&key);
        let mut resp = format!(
            "HTTP/1.1 101 Switching Protocols{CRLF}\
             Upgrade: websocket{CRLF}\
             Connection: Upgrade{CRLF}\
             Sec-WebSocket-Accept: {accept}{CRLF}"
        );
        if let Some(p) = protocol {
            resp.push_str(&format!("Sec-WebSocket-Protocol: {p}{CRLF}"));
        }
        if let Some(e) = extensions {
            resp.push_str(&format!("Sec-WebSocket-Extensions: {e}{CRLF}"));
        }
        resp.push_str(CRLF);
        self.write_or_queue(resp.as_bytes())?;
        self.state.borrow_mut().ws_key = None;
        Ok(())
    }

    /// Grow the handshake buffer from the wire; `Ok(true)` once the
    /// terminating CRLFCRLF arrived.
    fn read_handshake_data(self: &Rc<Self>) -> Result<bool, FatalReason> {
        loop {
            let mut chunk = [0u8; SZ_HSBUF_INC];
            let outcome = {
                let mut st = self.state.borrow_mut();
                if st.hsbuf.len() + SZ_HSBUF_INC > SZ_HSBUF_MAX {
                    return Err(FatalReason::Tlr);
                }
                st.transport.read(&mut chunk)
            };
            match outcome {
                IoOutcome::Bytes(n) => {
                    let mut st = self.state.borrow_mut();
                    st.hsbuf.extend_from_slice(&chunk[..n]);
                    if st.hsbuf.len() > SZ_HSBUF_MAX {
                        return Err(FatalReason::Tlr);
                    }
                    if st.hsbuf.ends_with(b"\r\n\r\n") {
                        return Ok(true);
                    }
                }
                IoOutcome::WouldBlock => return Ok(false),
                IoOutcome::Closed | IoOutcome::Failed => return Err(FatalReason::Io),
            }
        }
    }

    fn handle_handshake_request(self: &Rc<Self>) -> bool {
        self.state.borrow_mut().last_live = Instant::now();
        match self.read_handshake_data() {
            Ok(false) => true,
            Ok(true) => {
                self.state
                    .borrow_mut()
                    .status
                    .clear(StreamFlag::Waiting4HsRequ);
                let text = {
                    let mut st = self.state.borrow_mut();
                    String::from_utf8_lossy(&std::mem::take(&mut st.hsbuf)).into_owned()
                };
                match self.verify_handshake_request(&text) {
                    Ok(()) => true,
                    Err(()) => {
                        let _ = self.write_or_queue(WS_BAD_REQUEST_STR.as_bytes());
                        self.state.borrow_mut().status.fail(FatalReason::Msg);
                        self.handle_rwerr_close();
                        false
                    }
                }
            }
            Err(reason) => {
                let resp = match reason {
                    FatalReason::Tlr => WS_BAD_REQUEST_STR,
                    _ => WS_INTERNAL_ERROR_STR,
                };
                let _ = self.write_or_queue(resp.as_bytes());
                self.state.borrow_mut().status.fail(reason);
                self.handle_rwerr_close();
                false
            }
        }
    }

    fn verify_handshake_request(self: &Rc<Self>, text: &str) -> Result<(), ()> {
        let mut path = None;
        let mut method = None;
        let mut protocol = None;
        let mut headers: Vec<(String, String)> = Vec::new();

        for (i, line) in text.split(CRLF).enumerate() {
            if line.is_empty() {
                break;
            }
            if i == 0 {
                // GET <path> HTTP/1.1
                let mut parts = line.splitn(3, ' ');
                method = parts.next().map(|m| m.to_ascii_uppercase());
                path = parts.next().map(str::to_string);
                protocol = parts.next().map(str::to_string);
            } else if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            } else {
                return Err(());
            }
        }

        let lookup = |name: &str| -> Option<&str> {
            headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };

        let (Some(method), Some(path), Some(_protocol)) = (&method, &path, &protocol) else {
            return Err(());
        };
        if method != "GET" {
            return Err(());
        }
        let host = lookup("Host").ok_or(())?;
        let upgrade = lookup("Upgrade").ok_or(())?;
        let connection = lookup("Connection").ok_or(())?;
        let ws_key = lookup("Sec-WebSocket-Key").ok_or(())?;
        let ws_ver = lookup("Sec-WebSocket-Version").ok_or(())?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(());
        }
        if !connection.eq_ignore_ascii_case("upgrade") {
            return Err(());
        }
        if ws_ver != "13" {
            return Err(());
        }

        let obj = Variant::object();
        let mut put = |k: &str, v: Option<&str>| {
            if let Some(v) = v {
                let _ = obj.object_set(k, Variant::string(v));
            }
        };
        put("Path", Some(path));
        put("Method", Some(method));
        put("Protocol", protocol.as_deref());
        put("Host", Some(host));
        put("Origin", lookup("Origin"));
        put("Upgrade", Some(upgrade));
        put("Connection", Some(connection));
        put("User-Agent", lookup("User-Agent"));
        put("Referer", lookup("Referer"));
        put("Sec-WebSocket-Key", Some(ws_key));
        put("Sec-WebSocket-Version", Some(ws_ver));
        put("Sec-WebSocket-Protocol", lookup("Sec-WebSocket-Protocol"));
        put(
            "Sec-WebSocket-Extensions",
            lookup("Sec-WebSocket-Extensions"),
        );

        // keep the key for send_handshake_resp
        self.state.borrow_mut().ws_key = Some(ws_key.to_string());
        self.post(K_HANDSHAKE, EVENT_HANDSHAKE, Some(obj));
        Ok(())
    }

    fn handle_handshake_response(self: &Rc<Self>) -> bool {
        self.state.borrow_mut().last_live = Instant::now();
        match self.read_handshake_data() {
            Ok(false) => true,
            Ok(true) => {
                self.state
                    .borrow_mut()
                    .status
                    .clear(StreamFlag::Waiting4HsResp);
                let text = {
                    let mut st = self.state.borrow_mut();
                    String::from_utf8_lossy(&std::mem::take(&mut st.hsbuf)).into_owned()
                };
                match self.verify_handshake_response(&text) {
                    Ok(()) => true,
                    Err(()) => {
                        self.state.borrow_mut().status.fail(FatalReason::Srv);
                        self.handle_rwerr_close();
                        false
                    }
                }
            }
            Err(reason) => {
                self.state.borrow_mut().status.fail(reason);
                self.handle_rwerr_close();
                false
            }
        }
    }

    fn verify_handshake_response(self: &Rc<Self>, text: &str) -> Result<(), ()> {
        let expected = {
            let st = self.state.borrow();
            st.ws_key.as_deref().map(key_to_accept).ok_or(())?
        };

        let mut status_code = 0u16;
        let mut headers: Vec<(String, String)> = Vec::new();
        for (i, line) in text.split(CRLF).enumerate() {
            if line.is_empty() {
                break;
            }
            if i == 0 {
                // HTTP/1.1 <code> <reason>
                status_code = line
                    .split(' ')
                    .nth(1)
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0);
            } else if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        let lookup = |name: &str| -> Option<&str> {
            headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };

        let connection = lookup("Connection");
        let upgrade = lookup("Upgrade");
        let ws_accept = lookup("Sec-WebSocket-Accept");

        let (ok, extra_msg) = if status_code != 101 {
            (false, "Got a bad HTTP status during handshake")
        } else if !connection.is_some_and(|c| c.eq_ignore_ascii_case("upgrade")) {
            (false, "No matching 'Connection' header during handshake")
        } else if !upgrade.is_some_and(|u| u.eq_ignore_ascii_case("websocket")) {
            (false, "No matching 'Upgrade' header during handshake")
        } else if ws_accept != Some(expected.as_str()) {
            (false, "Failed to verify Sec-WebSocket-Accept during handshake")
        } else {
            (true, "Everything is ok")
        };

        let obj = Variant::object();
        let _ = obj.object_set("Status", Variant::number(status_code as f64));
        if status_code == 101 {
            let mut put = |k: &str, v: Option<&str>| {
                if let Some(v) = v {
                    let _ = obj.object_set(k, Variant::string(v));
                }
            };
            put("Upgrade", upgrade);
            put("Connection", connection);
            put("Sec-WebSocket-Protocol", lookup("Sec-WebSocket-Protocol"));
            put(
                "Sec-WebSocket-Extensions",
                lookup("Sec-WebSocket-Extensions"),
            );
        }
        let _ = obj.object_set("Extra-Message", Variant::string(extra_msg));
        self.post(K_HANDSHAKE, EVENT_HANDSHAKE, Some(obj));

        self.state.borrow_mut().ws_key = None;
        if ok {
            Ok(())
        } else {
            Err(())
        }
    }

    // -- timers and monitors

    fn on_ping_timer(self: &Rc<Self>) -> bool {
        let (elapsed, to_ping, to_close, dead) = {
            let st = self.state.borrow();
            (
                st.last_live.elapsed().as_secs(),
                st.opts.no_resp_time_to_ping as u64,
                st.opts.no_resp_time_to_close as u64,
                st.released || st.status.is_closing(),
            )
        };
        if dead {
            return false;
        }
        if elapsed > to_close {
            let _ = self.notify_to_close(WS_CLOSE_GOING_AWAY, "long time no response");
            self.state.borrow_mut().status.fail(FatalReason::Ltnr);
            self.handle_rwerr_close();
            return false;
        }
        if elapsed > to_ping {
            let _ = self.send_ctrl_frame(WsOpcode::Ping, &[]);
        }
        true
    }

    fn on_writable(self: &Rc<Self>) -> bool {
        {
            let mut st = self.state.borrow_mut();
            let WsState {
                transport,
                queue,
                status,
                ..
            } = &mut *st;
            let _ = queue.flush(transport.as_mut(), status);
        }
        let (closing, drained) = {
            let st = self.state.borrow();
            (st.status.is_closing(), st.queue.is_empty())
        };
        if closing {
            self.handle_rwerr_close();
            return false;
        }
        if drained {
            let id = self.state.borrow_mut().monitor_w.take();
            if let Some(id) = id {
                RunLoop::current().remove_monitor(id);
            }
            return false;
        }
        true
    }

    fn on_io(self: &Rc<Self>, got: IoEvents) -> bool {
        if got.intersects(IoEvents::from(IoEvent::Hup) | IoEvent::Err | IoEvent::Nval) {
            self.state.borrow_mut().status.fail(FatalReason::Io);
            self.handle_rwerr_close();
            return false;
        }
        // TLS may be mid-handshake and only need the pump
        {
            let mut st = self.state.borrow_mut();
            let mut probe = [0u8; 0];
            let _ = st.transport.read(&mut probe);
        }
        self.on_readable()
    }

    fn on_readable(self: &Rc<Self>) -> bool {
        loop {
            let flags = self.state.borrow().status.flags;
            if flags.contains(StreamFlag::Closing) {
                self.handle_rwerr_close();
                return false;
            }
            if flags.contains(StreamFlag::Waiting4HsRequ) {
                if !self.handle_handshake_request() {
                    return false;
                }
                if self
                    .state
                    .borrow()
                    .status
                    .contains(StreamFlag::Waiting4HsRequ)
                {
                    return true; // still incomplete
                }
                continue;
            }
            if flags.contains(StreamFlag::Waiting4HsResp) {
                if !self.handle_handshake_response() {
                    return false;
                }
                if self
                    .state
                    .borrow()
                    .status
                    .contains(StreamFlag::Waiting4HsResp)
                {
                    return true;
                }
                continue;
            }

            match self.pump_frame() {
                ReadOutcome::None => return true,
                ReadOutcome::Some => continue,
                ReadOutcome::Whole => {
                    if !self.finish_frame() {
                        self.handle_rwerr_close();
                        return false;
                    }
                }
                ReadOutcome::Error => {
                    self.handle_rwerr_close();
                    return false;
                }
            }
        }
    }

    /// Advance the per-frame decode machine by whatever bytes are
    /// available. `Whole` means a full frame (payload unmasked) is
    /// ready.
    fn pump_frame(self: &Rc<Self>) -> ReadOutcome {
        let mut st = self.state.borrow_mut();
        self.state_machine_step(&mut st)
    }

    fn read_scratch(st: &mut WsState, want: usize) -> Result<bool, ()> {
        let off = st.sz_scratch;
        let outcome = {
            let WsState {
                transport, scratch, ..
            } = st;
            transport.read(&mut scratch[off..want])
        };
        match outcome {
            IoOutcome::Bytes(n) => {
                st.sz_scratch += n;
                Ok(st.sz_scratch == want)
            }
            IoOutcome::WouldBlock => Ok(false),
            IoOutcome::Closed | IoOutcome::Failed => Err(()),
        }
    }

    fn state_machine_step(self: &Rc<Self>, st: &mut WsState) -> ReadOutcome {
        match st.rstate {
            RState::Header => match Self::read_scratch(st, 2) {
                Err(()) => {
                    st.status.fail(FatalReason::Io);
                    ReadOutcome::Error
                }
                Ok(false) => ReadOutcome::None,
                Ok(true) => {
                    st.sz_scratch = 0;
                    let b0 = st.scratch[0];
                    let b1 = st.scratch[1];
                    st.fin = b0 & 0x80 != 0;
                    let rsv = b0 & 0x70;
                    let Some(op) = WsOpcode::from_bits(b0 & 0x0F) else {
                        st.status.fail(FatalReason::Msg);
                        return ReadOutcome::Error;
                    };
                    st.opcode = op;
                    st.masked = b1 & 0x80 != 0;
                    let len7 = (b1 & 0x7F) as usize;

                    if rsv != 0 {
                        st.status.fail(FatalReason::Msg);
                        return ReadOutcome::Error;
                    }
                    // masking direction is fixed per role
                    let expect_masked = st.role.is_server_side();
                    if st.masked != expect_masked {
                        st.status.fail(FatalReason::Msg);
                        return ReadOutcome::Error;
                    }
                    if op.is_control() && (!st.fin || len7 > 125) {
                        st.status.fail(FatalReason::Msg);
                        return ReadOutcome::Error;
                    }

                    match len7 {
                        126 => {
                            st.rstate = RState::ExtLen(2);
                            ReadOutcome::Some
                        }
                        127 => {
                            st.rstate = RState::ExtLen(8);
                            ReadOutcome::Some
                        }
                        n => {
                            st.payload_len = n;
                            st.rstate = if st.masked { RState::Mask } else { RState::Payload };
                            self.prep_payload(st)
                        }
                    }
                }
            },
            RState::ExtLen(sz) => match Self::read_scratch(st, sz as usize) {
                Err(()) => {
                    st.status.fail(FatalReason::Io);
                    ReadOutcome::Error
                }
                Ok(false) => ReadOutcome::None,
                Ok(true) => {
                    st.sz_scratch = 0;
                    let len = if sz == 2 {
                        u16::from_be_bytes(st.scratch[..2].try_into().unwrap()) as u64
                    } else {
                        u64::from_be_bytes(st.scratch)
                    };
                    if len > st.opts.max_message_size as u64 {
                        queue_close(st, WS_CLOSE_TOO_LARGE, "frame is too big");
                        st.status.fail(FatalReason::Msg);
                        return ReadOutcome::Error;
                    }
                    st.payload_len = len as usize;
                    st.rstate = if st.masked { RState::Mask } else { RState::Payload };
                    self.prep_payload(st)
                }
            },
            RState::Mask => match Self::read_scratch(st, 4) {
                Err(()) => {
                    st.status.fail(FatalReason::Io);
                    ReadOutcome::Error
                }
                Ok(false) => ReadOutcome::None,
                Ok(true) => {
                    st.sz_scratch = 0;
                    st.mask.copy_from_slice(&st.scratch[..4]);
                    st.rstate = RState::Payload;
                    self.prep_payload_after_mask(st)
                }
            },
            RState::Payload => {
                let left = st.payload_len - st.sz_read_payload;
                let base = st.sz_read_payload;
                let outcome = {
                    let WsState {
                        transport, payload, ..
                    } = st;
                    transport.read(&mut payload[base..base + left])
                };
                match outcome {
                    IoOutcome::Bytes(n) => {
                        st.sz_read_payload += n;
                        if st.sz_read_payload == st.payload_len {
                            if st.masked {
                                let mask = st.mask;
                                for (i, b) in st.payload.iter_mut().enumerate() {
                                    *b ^= mask[i % 4];
                                }
                            }
                            st.rstate = RState::Header;
                            ReadOutcome::Whole
                        } else {
                            ReadOutcome::Some
                        }
                    }
                    IoOutcome::WouldBlock => ReadOutcome::None,
                    IoOutcome::Closed | IoOutcome::Failed => {
                        st.status.fail(FatalReason::Io);
                        ReadOutcome::Error
                    }
                }
            }
        }
    }

    fn prep_payload(self: &Rc<Self>, st: &mut WsState) -> ReadOutcome {
        if matches!(st.rstate, RState::Payload) {
            st.payload = vec![0u8; st.payload_len];
            st.sz_read_payload = 0;
            if st.payload_len == 0 {
                st.rstate = RState::Header;
                return ReadOutcome::Whole;
            }
        }
        ReadOutcome::Some
    }

    fn prep_payload_after_mask(self: &Rc<Self>, st: &mut WsState) -> ReadOutcome {
        st.payload = vec![0u8; st.payload_len];
        st.sz_read_payload = 0;
        if st.payload_len == 0 {
            st.rstate = RState::Header;
            return ReadOutcome::Whole;
        }
        ReadOutcome::Some
    }

    /// Act on one complete frame.
    fn finish_frame(self: &Rc<Self>) -> bool {
        let (op, fin, payload) = {
            let mut st = self.state.borrow_mut();
            st.last_live = Instant::now();
            (st.opcode, st.fin, std::mem::take(&mut st.payload))
        };

        match op {
            WsOpcode::Ping => {
                let _ = self.send_ctrl_frame(WsOpcode::Pong, &payload);
                true
            }
            WsOpcode::Pong => true,
            WsOpcode::Close => {
                let code = if payload.len() >= 2 {
                    u16::from_be_bytes([payload[0], payload[1]])
                } else {
                    WS_CLOSE_NORMAL
                };
                let reason = String::from_utf8_lossy(payload.get(2..).unwrap_or(&[])).into_owned();
                let obj = Variant::object();
                let _ = obj.object_set("code", Variant::number(code as f64));
                let _ = obj.object_set("reason", Variant::string(&reason));
                self.post(K_CLOSE, EVENT_CLOSE, Some(obj));

                let _ = self.send_ctrl_frame(WsOpcode::Close, &payload[..payload.len().min(125)]);
                self.state.borrow_mut().status.set(StreamFlag::Closing);
                true
            }
            WsOpcode::Text | WsOpcode::Bin => {
                {
                    let mut st = self.state.borrow_mut();
                    if st.msg_op.is_some() {
                        // a new data frame may not interleave a fragmented
                        // message
                        drop(st);
                        let _ = self.notify_to_close(WS_CLOSE_PROTO_ERR, "interleaved message");
                        self.state.borrow_mut().status.fail(FatalReason::Msg);
                        return false;
                    }
                    if payload.len() > st.opts.max_message_size {
                        drop(st);
                        let _ = self.notify_to_close(WS_CLOSE_TOO_LARGE, "message too large");
                        self.state.borrow_mut().status.fail(FatalReason::Msg);
                        return false;
                    }
                    st.msg_op = Some(op);
                    st.message = payload;
                }
                if fin {
                    self.deliver_message()
                } else {
                    true
                }
            }
            WsOpcode::Continuation => {
                {
                    let mut st = self.state.borrow_mut();
                    if st.msg_op.is_none() {
                        drop(st);
                        let _ = self.notify_to_close(WS_CLOSE_PROTO_ERR, "orphan continuation");
                        self.state.borrow_mut().status.fail(FatalReason::Msg);
                        return false;
                    }
                    if st.message.len() + payload.len() > st.opts.max_message_size {
                        drop(st);
                        let _ = self.notify_to_close(WS_CLOSE_TOO_LARGE, "message too large");
                        self.state.borrow_mut().status.fail(FatalReason::Msg);
                        return false;
                    }
                    st.message.extend_from_slice(&payload);
                }
                if fin {
                    self.deliver_message()
                } else {
                    true
                }
            }
        }
    }

    fn deliver_message(self: &Rc<Self>) -> bool {
        let (op, message) = {
            let mut st = self.state.borrow_mut();
            let op = st.msg_op.take().expect("assembly in progress");
            (op, std::mem::take(&mut st.message))
        };
        let variant = match op {
            WsOpcode::Text => match String::from_utf8(message) {
                Ok(s) => Variant::string(&s),
                Err(_) => {
                    let _ = self.notify_to_close(WS_CLOSE_INVALID_UTF8, "invalid UTF-8");
                    self.state.borrow_mut().status.fail(FatalReason::Msg);
                    return false;
                }
            },
            _ => Variant::byte_seq_reuse(message),
        };
        self.post(K_MESSAGE, EVENT_MESSAGE, Some(variant));
        true
    }

    fn handle_rwerr_close(self: &Rc<Self>) {
        let (fatal, closing) = {
            let st = self.state.borrow();
            (st.status.fatal, st.status.is_closing())
        };
        if let Some(reason) = fatal {
            self.post_error(reason.to_error());
        }
        if closing {
            self.cleanup();
        }
    }

    /// Application-driven close: drain, send CLOSE 1000, release.
    pub fn close(self: &Rc<Self>) -> Result<(), Error> {
        {
            let st = self.state.borrow();
            if st.released {
                return Err(set_last_error(Error::EntityGone));
            }
        }
        {
            let mut st = self.state.borrow_mut();
            let WsState {
                transport,
                queue,
                status,
                ..
            } = &mut *st;
            let _ = queue.flush(transport.as_mut(), status);
        }
        if self.state.borrow().queue.is_empty() {
            let _ = self.notify_to_close(WS_CLOSE_NORMAL, "bye");
        }
        self.state.borrow_mut().status.set(StreamFlag::Closing);
        self.cleanup();
        Ok(())
    }

    fn cleanup(self: &Rc<Self>) {
        let mut st = self.state.borrow_mut();
        if st.released {
            return;
        }
        st.released = true;
        let rl = RunLoop::current();
        if let Some(id) = st.ping_timer.take() {
            rl.stop_timer(id);
        }
        if let Some(id) = st.monitor_r.take() {
            rl.remove_monitor(id);
        }
        if let Some(id) = st.monitor_w.take() {
            rl.remove_monitor(id);
        }
        let mut status = st.status;
        st.queue.clear(&mut status);
        st.status = status;
        // Safety: closing descriptors we own
        unsafe {
            if st.fd_read >= 0 {
                libc::close(st.fd_read);
            }
            if st.fd_write >= 0 && st.fd_write != st.fd_read {
                libc::close(st.fd_write);
            }
        }
        st.fd_read = -1;
        st.fd_write = -1;
    }
}

/// Queue a CLOSE frame from inside the decode machine, where the state
/// is already mutably borrowed.
fn queue_close(st: &mut WsState, code: u16, reason: &str) {
    let mut buf = Vec::with_capacity(2 + reason.len());
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&reason.as_bytes()[..reason.len().min(123)]);
    let mask = if st.role == WsRole::Client {
        Some(rand::random::<[u8; 4]>())
    } else {
        None
    };
    let frame = encode_frame(true, WsOpcode::Close, mask, &buf);
    let WsState {
        transport,
        queue,
        status,
        ..
    } = st;
    let _ = queue.write_or_queue(transport.as_mut(), &frame, status);
}

enum ReadOutcome {
    None,
    Some,
    Whole,
    Error,
}

// ---------------------------------------------------------------------------
// native entity facade

pub struct WsEntity {
    chan: Rc<WsChannel>,
}

impl WsEntity {
    pub fn to_variant(chan: Rc<WsChannel>) -> Variant {
        Variant::native("stream:websocket", Rc::new(WsEntity { chan }))
    }
}

impl NativeOps for WsEntity {
    fn property_getter(&self, name: &str) -> Option<NativeMethod> {
        let chan = self.chan.clone();
        let method: NativeMethod = match name {
            "send" => Rc::new(move |args, silently| {
                let first = args
                    .first()
                    .ok_or_else(|| set_last_error(Error::ArgumentMissed))?;
                let r = if let Some(s) = first.as_str() {
                    chan.send_message(true, s.as_bytes())
                } else if let Some(b) = first.as_bytes() {
                    chan.send_message(false, b)
                } else {
                    Err(set_last_error(Error::WrongDataType))
                };
                match r {
                    Ok(()) => Ok(Variant::boolean(true)),
                    Err(_) if silently => Ok(Variant::boolean(false)),
                    Err(e) => Err(e),
                }
            }),
            "send_handshake_resp" => Rc::new(move |args, silently| {
                let code = args
                    .first()
                    .ok_or_else(|| set_last_error(Error::ArgumentMissed))?
                    .cast_to_u64(false)? as u16;
                let protocol = args.get(1).and_then(|v| v.as_str()).map(str::to_string);
                let extensions = args.get(2).and_then(|v| v.as_str()).map(str::to_string);
                match chan.send_handshake_resp(code, protocol.as_deref(), extensions.as_deref())
                {
                    Ok(()) => Ok(Variant::boolean(true)),
                    Err(_) if silently => Ok(Variant::boolean(false)),
                    Err(e) => Err(e),
                }
            }),
            "close" => Rc::new(move |_args, silently| match chan.close() {
                Ok(()) => Ok(Variant::boolean(true)),
                Err(_) if silently => Ok(Variant::boolean(false)),
                Err(e) => Err(e),
            }),
            _ => return None,
        };
        Some(method)
    }

    fn on_observe(&self, event: &str, _sub: &str) -> bool {
        match current_coroutine() {
            Some(target) => self.chan.observe(event, target),
            None => false,
        }
    }

    fn on_forget(&self, event: &str, _sub: &str) -> bool {
        self.chan.forget(event)
    }

    fn on_release(&self) {
        let _ = self.chan.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_to_accept_rfc_sample() {
        assert_eq!(
            key_to_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_encode_small_unmasked() {
        let frame = encode_frame(true, WsOpcode::Text, None, b"hi");
        assert_eq!(frame, vec![0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_encode_fin_and_opcode_bits() {
        let frame = encode_frame(false, WsOpcode::Bin, None, &[]);
        assert_eq!(frame[0], 0x02);
        let frame = encode_frame(true, WsOpcode::Close, None, &[]);
        assert_eq!(frame[0], 0x88);
    }

    #[test]
    fn test_encode_extended_lengths() {
        let frame = encode_frame(true, WsOpcode::Bin, None, &vec![0u8; 126]);
        assert_eq!(frame[1], 126);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 126);
        assert_eq!(frame.len(), 2 + 2 + 126);

        let frame = encode_frame(true, WsOpcode::Bin, None, &vec![0u8; 0x10000]);
        assert_eq!(frame[1], 127);
        assert_eq!(
            u64::from_be_bytes(frame[2..10].try_into().unwrap()),
            0x10000
        );
        assert_eq!(frame.len(), 2 + 8 + 0x10000);
    }

    #[test]
    fn test_encode_masked() {
        let mask = [0x11, 0x22, 0x33, 0x44];
        let frame = encode_frame(true, WsOpcode::Text, Some(mask), b"abcd");
        assert_eq!(frame[1], 0x80 | 4);
        assert_eq!(&frame[2..6], &mask);
        // the payload is XOR'd with the rotating mask
        assert_eq!(frame[6], b'a' ^ 0x11);
        assert_eq!(frame[7], b'b' ^ 0x22);
        assert_eq!(frame[8], b'c' ^ 0x33);
        assert_eq!(frame[9], b'd' ^ 0x44);
    }

    #[test]
    fn test_roles() {
        assert!(!WsRole::Client.is_server_side());
        assert!(WsRole::ServerWorker.is_server_side());
        assert!(WsRole::ServerWorkerNoHandshake.is_server_side());
    }
}
