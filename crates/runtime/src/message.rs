//! Framed message protocol
//!
//! A self-delimited binary framing for stream sockets. Each frame is a
//! fixed 12-byte little-endian header — opcode, `fragmented` (the total
//! message size on the first frame of a fragmented message, 0
//! otherwise), and the current frame's payload size — followed by the
//! payload.
//!
//! Messages larger than the frame payload limit are split into a
//! TEXT/BIN frame carrying `fragmented = total`, CONTINUATION frames,
//! and one END frame. PING/PONG keep the connection alive: a periodic
//! timer pings a quiet peer and closes the stream after a prolonged
//! silence.

use crate::error::{set_last_error, Error};
use crate::event::{self, current_coroutine};
use crate::io::{IoOutcome, PlainTransport, Transport, WriteQueue, SOCK_THROTTLE_THLD};
use crate::runloop::{IoEvent, IoEvents, MonitorId, RunLoop, TimerId};
use crate::status::{FatalReason, Status, StreamFlag};
use crate::stream::Stream;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};
use vellum_core::{Atom, NativeMethod, NativeOps, Variant};

pub const MIN_FRAME_PAYLOAD_SIZE: usize = 1024;
pub const DEF_FRAME_PAYLOAD_SIZE: usize = 1024 * 4;
pub const MIN_INMEM_MESSAGE_SIZE: usize = 1024 * 8;
pub const DEF_INMEM_MESSAGE_SIZE: usize = 1024 * 64;
pub const MIN_NO_RESPONSE_TIME_TO_PING: u32 = 3;
pub const DEF_NO_RESPONSE_TIME_TO_PING: u32 = 30;
pub const MIN_NO_RESPONSE_TIME_TO_CLOSE: u32 = 6;
pub const DEF_NO_RESPONSE_TIME_TO_CLOSE: u32 = 90;

/// The ping timer never fires more often than once a second.
const MIN_PING_TIMER_INTERVAL: Duration = Duration::from_secs(1);

const HEADER_SIZE: usize = 12;

pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_CLOSE: &str = "close";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgOpcode {
    Continuation = 0x00,
    Text = 0x01,
    Bin = 0x02,
    End = 0x03,
    Close = 0x08,
    Ping = 0x09,
    Pong = 0x0A,
}

impl MsgOpcode {
    fn from_u32(v: u32) -> Option<MsgOpcode> {
        match v {
            0x00 => Some(MsgOpcode::Continuation),
            0x01 => Some(MsgOpcode::Text),
            0x02 => Some(MsgOpcode::Bin),
            0x03 => Some(MsgOpcode::End),
            0x08 => Some(MsgOpcode::Close),
            0x09 => Some(MsgOpcode::Ping),
            0x0A => Some(MsgOpcode::Pong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub op: MsgOpcode,
    pub fragmented: u32,
    pub sz_payload: u32,
}

impl FrameHeader {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&(self.op as u32).to_le_bytes());
        out[4..8].copy_from_slice(&self.fragmented.to_le_bytes());
        out[8..12].copy_from_slice(&self.sz_payload.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Option<FrameHeader> {
        let op = MsgOpcode::from_u32(u32::from_le_bytes(buf[0..4].try_into().unwrap()))?;
        Some(FrameHeader {
            op,
            fragmented: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            sz_payload: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

/// Protocol options with the documented clamps: zero picks the default,
/// anything below a minimum is raised to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageOptions {
    pub max_frame_payload_size: usize,
    pub max_message_size: usize,
    pub no_resp_time_to_ping: u32,
    pub no_resp_time_to_close: u32,
}

impl Default for MessageOptions {
    fn default() -> Self {
        MessageOptions {
            max_frame_payload_size: DEF_FRAME_PAYLOAD_SIZE,
            max_message_size: DEF_INMEM_MESSAGE_SIZE,
            no_resp_time_to_ping: DEF_NO_RESPONSE_TIME_TO_PING,
            no_resp_time_to_close: DEF_NO_RESPONSE_TIME_TO_CLOSE,
        }
    }
}

impl MessageOptions {
    pub fn clamped(
        max_frame_payload_size: usize,
        max_message_size: usize,
        no_resp_time_to_ping: u32,
        no_resp_time_to_close: u32,
    ) -> MessageOptions {
        fn pick(v: usize, min: usize, def: usize) -> usize {
            if v == 0 {
                def
            } else {
                v.max(min)
            }
        }
        fn pick32(v: u32, min: u32, def: u32) -> u32 {
            if v == 0 {
                def
            } else {
                v.max(min)
            }
        }
        MessageOptions {
            max_frame_payload_size: pick(
                max_frame_payload_size,
                MIN_FRAME_PAYLOAD_SIZE,
                DEF_FRAME_PAYLOAD_SIZE,
            ),
            max_message_size: pick(max_message_size, MIN_INMEM_MESSAGE_SIZE, DEF_INMEM_MESSAGE_SIZE),
            no_resp_time_to_ping: pick32(
                no_resp_time_to_ping,
                MIN_NO_RESPONSE_TIME_TO_PING,
                DEF_NO_RESPONSE_TIME_TO_PING,
            ),
            no_resp_time_to_close: pick32(
                no_resp_time_to_close,
                MIN_NO_RESPONSE_TIME_TO_CLOSE,
                DEF_NO_RESPONSE_TIME_TO_CLOSE,
            ),
        }
    }

    /// Parse an options object: `maxframepayloadsize`, `maxmessagesize`,
    /// `noresptimetoping`, `noresptimetoclose`.
    pub fn from_variant(opts: &Variant) -> Result<MessageOptions, Error> {
        let get = |key: &str| -> Result<u64, Error> {
            match opts.object_get(key) {
                Ok(Some(v)) => v.cast_to_u64(false),
                _ => Ok(0),
            }
        };
        Ok(MessageOptions::clamped(
            get("maxframepayloadsize")? as usize,
            get("maxmessagesize")? as usize,
            get("noresptimetoping")? as u32,
            get("noresptimetoclose")? as u32,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MsgType {
    Text,
    Binary,
}

const K_MESSAGE: usize = 0;
const K_ERROR: usize = 1;
const K_CLOSE: usize = 2;

struct MsgState {
    transport: Box<dyn Transport>,
    fd_read: RawFd,
    fd_write: RawFd,
    status: Status,
    queue: WriteQueue,
    opts: MessageOptions,
    last_live: Instant,
    ping_timer: Option<TimerId>,
    monitor_r: Option<MonitorId>,
    monitor_w: Option<MonitorId>,
    header_buf: [u8; HEADER_SIZE],
    sz_read_header: usize,
    header: Option<FrameHeader>,
    msg_type: MsgType,
    message: Vec<u8>,
    sz_message: usize,
    sz_read_payload: usize,
    sz_read_message: usize,
    targets: [Option<Atom>; 3],
    released: bool,
}

pub struct MessageChannel {
    state: RefCell<MsgState>,
}

impl MessageChannel {
    /// Take over a connected stream socket and run the framed protocol
    /// on it.
    pub fn attach(stream: &Rc<Stream>, opts: MessageOptions) -> Result<Rc<MessageChannel>, Error> {
        let (fd_read, fd_write) = stream.take_fds();
        if fd_read < 0 {
            return Err(set_last_error(Error::EntityGone));
        }
        crate::runloop::set_nonblocking(fd_read)?;

        let chan = Rc::new(MessageChannel {
            state: RefCell::new(MsgState {
                transport: Box::new(PlainTransport { fd_read, fd_write }),
                fd_read,
                fd_write,
                status: Status::default(),
                queue: WriteQueue::default(),
                opts,
                last_live: Instant::now(),
                ping_timer: None,
                monitor_r: None,
                monitor_w: None,
                header_buf: [0u8; HEADER_SIZE],
                sz_read_header: 0,
                header: None,
                msg_type: MsgType::Text,
                message: Vec::new(),
                sz_message: 0,
                sz_read_payload: 0,
                sz_read_message: 0,
                targets: [None; 3],
                released: false,
            }),
        });
        chan.install_monitors()?;
        chan.start_ping_timer();
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
                .max(MIN_PING_TIMER_INTERVAL)
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

    /// Bind one of the `message` / `error` / `close` events to a
    /// coroutine.
    pub fn observe(&self, event: &str, target: Atom) -> bool {
        let slot = match event {
            EVENT_MESSAGE => K_MESSAGE,
            EVENT_ERROR => K_ERROR,
            EVENT_CLOSE => K_CLOSE,
            _ => return false,
        };
        self.state.borrow_mut().targets[slot] = Some(target);
        true
    }

    pub fn forget(&self, event: &str) -> bool {
        let slot = match event {
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
            let _ = event::post_event(target, "message", name, None, payload);
        }
    }

    fn post_error(&self, err: Error) {
        let data = Variant::object();
        let _ = data.object_set("code", Variant::string(&format!("{err:?}")));
        let _ = data.object_set("postscript", Variant::string(&err.to_string()));
        self.post(K_ERROR, EVENT_ERROR, Some(data));
    }

    /// Whether a message of `sz` payload bytes fits under the throttle
    /// threshold together with its frame headers.
    fn can_send(st: &MsgState, sz: usize) -> bool {
        let frames = if sz > st.opts.max_frame_payload_size {
            sz / st.opts.max_frame_payload_size + 1
        } else {
            1
        };
        st.queue.sz_pending() + sz + frames * HEADER_SIZE < SOCK_THROTTLE_THLD
    }

    fn write_frame(
        st: &mut MsgState,
        op: MsgOpcode,
        fragmented: u32,
        payload: &[u8],
    ) -> Result<(), Error> {
        let header = FrameHeader {
            op,
            fragmented,
            sz_payload: payload.len() as u32,
        };
        let hdr = header.to_bytes();
        let MsgState {
            transport, queue, status, ..
        } = st;
        queue
            .write_or_queue(transport.as_mut(), &hdr, status)
            .map_err(|_| set_last_error(Error::IoFailure))?;
        if !payload.is_empty() {
            queue
                .write_or_queue(transport.as_mut(), payload, status)
                .map_err(|_| set_last_error(Error::IoFailure))?;
        }
        Ok(())
    }

    /// Send one logical message, fragmenting as needed.
    pub fn send_message(self: &Rc<Self>, text: bool, data: &[u8]) -> Result<(), Error> {
        {
            let mut st = self.state.borrow_mut();
            if st.released {
                return Err(set_last_error(Error::EntityGone));
            }
            if data.len() > st.opts.max_message_size {
                return Err(set_last_error(Error::TooLargeEntity));
            }
            if st.status.contains(StreamFlag::Throttling) || !Self::can_send(&st, data.len()) {
                return Err(set_last_error(Error::Again));
            }

            let max = st.opts.max_frame_payload_size;
            if data.len() > max {
                let mut off = 0usize;
                while off < data.len() {
                    let left = data.len() - off;
                    let (op, fragmented, take) = if off == 0 {
                        (
                            if text { MsgOpcode::Text } else { MsgOpcode::Bin },
                            data.len() as u32,
                            max,
                        )
                    } else if left > max {
                        (MsgOpcode::Continuation, 0, max)
                    } else {
                        (MsgOpcode::End, 0, left)
                    };
                    Self::write_frame(&mut st, op, fragmented, &data[off..off + take])?;
                    off += take;
                }
            } else {
                let op = if text { MsgOpcode::Text } else { MsgOpcode::Bin };
                Self::write_frame(&mut st, op, 0, data)?;
            }

            if let Some(reason) = st.status.fatal {
                return Err(set_last_error(reason.to_error()));
            }
        }
        self.ensure_write_monitor();
        Ok(())
    }

    fn send_ctrl(self: &Rc<Self>, op: MsgOpcode) -> Result<(), Error> {
        {
            let mut st = self.state.borrow_mut();
            Self::write_frame(&mut st, op, 0, &[])?;
        }
        self.ensure_write_monitor();
        Ok(())
    }

    fn on_ping_timer(self: &Rc<Self>) -> bool {
        let (elapsed, to_ping, to_close, closing) = {
            let st = self.state.borrow();
            (
                st.last_live.elapsed().as_secs(),
                st.opts.no_resp_time_to_ping as u64,
                st.opts.no_resp_time_to_close as u64,
                st.status.is_closing() || st.released,
            )
        };
        if closing {
            return false;
        }
        if elapsed > to_close {
            let _ = self.send_ctrl(MsgOpcode::Close);
            self.state.borrow_mut().status.fail(FatalReason::Ltnr);
            self.handle_rwerr_close();
            return false;
        }
        if elapsed > to_ping {
            let _ = self.send_ctrl(MsgOpcode::Ping);
        }
        true
    }

    fn on_writable(self: &Rc<Self>) -> bool {
        if self.state.borrow().status.is_closing() {
            self.handle_rwerr_close();
            return false;
        }
        {
            let mut st = self.state.borrow_mut();
            let MsgState {
                transport,
                queue,
                status,
                ..
            } = &mut *st;
            let _ = queue.flush(transport.as_mut(), status);
        }
        if self.state.borrow().status.fatal.is_some() {
            self.handle_rwerr_close();
            return false;
        }
        // drop the monitor when drained
        if self.state.borrow().queue.is_empty() {
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
        self.on_readable()
    }

    /// Reader state machine: header, then payload, then delivery.
    fn on_readable(self: &Rc<Self>) -> bool {
        self.state.borrow_mut().last_live = Instant::now();

        loop {
            let closing = self.state.borrow().status.is_closing();
            if closing {
                self.handle_rwerr_close();
                return false;
            }

            let waiting_payload = self.state.borrow().status.contains(StreamFlag::Waiting4Payload);
            if !waiting_payload {
                match self.try_read_header() {
                    ReadOutcome::None => return true,
                    ReadOutcome::Some => continue,
                    ReadOutcome::Error => {
                        self.handle_rwerr_close();
                        return false;
                    }
                    ReadOutcome::Whole => {
                        if !self.dispatch_header() {
                            self.handle_rwerr_close();
                            return false;
                        }
                    }
                }
            } else {
                match self.try_read_payload() {
                    ReadOutcome::None => return true,
                    ReadOutcome::Some => continue,
                    ReadOutcome::Error => {
                        self.handle_rwerr_close();
                        return false;
                    }
                    ReadOutcome::Whole => {
                        if !self.finish_frame() {
                            self.handle_rwerr_close();
                            return false;
                        }
                    }
                }
            }
        }
    }

    fn try_read_header(self: &Rc<Self>) -> ReadOutcome {
        let mut st = self.state.borrow_mut();
        let off = st.sz_read_header;
        let outcome = {
            let MsgState {
                transport,
                header_buf,
                ..
            } = &mut *st;
            transport.read(&mut header_buf[off..])
        };
        match outcome {
            IoOutcome::Bytes(n) => {
                st.sz_read_header += n;
                if st.sz_read_header == HEADER_SIZE {
                    st.sz_read_header = 0;
                    let buf = st.header_buf;
                    match FrameHeader::from_bytes(&buf) {
                        Some(h) => {
                            st.header = Some(h);
                            ReadOutcome::Whole
                        }
                        None => {
                            st.status.fail(FatalReason::Msg);
                            ReadOutcome::Error
                        }
                    }
                } else {
                    st.status.set(StreamFlag::Reading);
                    ReadOutcome::Some
                }
            }
            IoOutcome::WouldBlock => {
                st.status.set(StreamFlag::Reading);
                ReadOutcome::None
            }
            IoOutcome::Closed | IoOutcome::Failed => {
                st.status.fail(FatalReason::Io);
                ReadOutcome::Error
            }
        }
    }

    /// Act on a complete frame header.
    fn dispatch_header(self: &Rc<Self>) -> bool {
        let header = self.state.borrow().header.expect("header just read");
        match header.op {
            MsgOpcode::Ping => {
                let _ = self.send_ctrl(MsgOpcode::Pong);
                true
            }
            MsgOpcode::Pong => true,
            MsgOpcode::Close => {
                self.post(K_CLOSE, EVENT_CLOSE, Some(Variant::string("Bye")));
                let mut st = self.state.borrow_mut();
                st.status.set(StreamFlag::Closing);
                true
            }
            MsgOpcode::Text | MsgOpcode::Bin => {
                let mut st = self.state.borrow_mut();
                st.msg_type = if header.op == MsgOpcode::Text {
                    MsgType::Text
                } else {
                    MsgType::Binary
                };
                let sz_message = if header.fragmented > 0 && header.fragmented > header.sz_payload
                {
                    header.fragmented as usize
                } else {
                    header.sz_payload as usize
                };
                if sz_message == 0
                    || sz_message > st.opts.max_message_size
                    || header.sz_payload == 0
                    || header.sz_payload as usize > st.opts.max_frame_payload_size
                {
                    st.status.fail(FatalReason::Msg);
                    return false;
                }
                st.sz_message = sz_message;
                st.message = vec![0u8; sz_message];
                st.sz_read_payload = 0;
                st.sz_read_message = 0;
                st.status.set(StreamFlag::Waiting4Payload);
                true
            }
            MsgOpcode::Continuation | MsgOpcode::End => {
                let mut st = self.state.borrow_mut();
                if header.sz_payload == 0 || st.sz_message == 0 {
                    st.status.fail(FatalReason::Msg);
                    return false;
                }
                st.status.set(StreamFlag::Waiting4Payload);
                true
            }
        }
    }

    fn try_read_payload(self: &Rc<Self>) -> ReadOutcome {
        let mut st = self.state.borrow_mut();
        let header = st.header.expect("payload follows a header");
        let want = header.sz_payload as usize;

        if st.sz_read_message + want > st.sz_message {
            st.status.fail(FatalReason::Msg);
            return ReadOutcome::Error;
        }

        let base = st.sz_read_message + st.sz_read_payload;
        let left = want - st.sz_read_payload;
        let outcome = {
            let MsgState {
                transport, message, ..
            } = &mut *st;
            transport.read(&mut message[base..base + left])
        };
        match outcome {
            IoOutcome::Bytes(n) => {
                st.sz_read_payload += n;
                if st.sz_read_payload == want {
                    st.sz_read_payload = 0;
                    st.sz_read_message += want;
                    ReadOutcome::Whole
                } else {
                    st.status.set(StreamFlag::Reading);
                    ReadOutcome::Some
                }
            }
            IoOutcome::WouldBlock => {
                st.status.set(StreamFlag::Reading);
                ReadOutcome::None
            }
            IoOutcome::Closed | IoOutcome::Failed => {
                st.status.fail(FatalReason::Io);
                ReadOutcome::Error
            }
        }
    }

    /// A frame's payload completed; deliver the message when whole.
    fn finish_frame(self: &Rc<Self>) -> bool {
        let (done, msg_type) = {
            let mut st = self.state.borrow_mut();
            st.status.clear(StreamFlag::Waiting4Payload);
            (st.sz_read_message == st.sz_message, st.msg_type)
        };
        if !done {
            return true;
        }

        let payload = {
            let mut st = self.state.borrow_mut();
            st.sz_message = 0;
            st.sz_read_message = 0;
            std::mem::take(&mut st.message)
        };

        let variant = match msg_type {
            MsgType::Text => match String::from_utf8(payload) {
                Ok(s) => Variant::string(&s),
                Err(_) => {
                    self.state.borrow_mut().status.fail(FatalReason::Msg);
                    return false;
                }
            },
            MsgType::Binary => Variant::byte_seq_reuse(payload),
        };
        self.post(K_MESSAGE, EVENT_MESSAGE, Some(variant));
        true
    }

    /// Report a fatal status and release resources when closing.
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

    /// Drain what can be drained, send CLOSE, release.
    pub fn close(self: &Rc<Self>) -> Result<(), Error> {
        {
            let mut st = self.state.borrow_mut();
            if st.released {
                return Err(set_last_error(Error::EntityGone));
            }
            let MsgState {
                transport,
                queue,
                status,
                ..
            } = &mut *st;
            let _ = queue.flush(transport.as_mut(), status);
            if st.queue.is_empty() {
                let _ = Self::write_frame(&mut st, MsgOpcode::Close, 0, &[]);
            }
            st.status.set(StreamFlag::Closing);
        }
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

    /// Bytes queued for a later writable event.
    pub fn sz_pending(&self) -> usize {
        self.state.borrow().queue.sz_pending()
    }
}

enum ReadOutcome {
    None,
    Some,
    Whole,
    Error,
}

// ---------------------------------------------------------------------------
// native entity facade

pub struct MessageEntity {
    chan: Rc<MessageChannel>,
}

impl MessageEntity {
    pub fn to_variant(chan: Rc<MessageChannel>) -> Variant {
        Variant::native("stream:message", Rc::new(MessageEntity { chan }))
    }
}

impl NativeOps for MessageEntity {
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
                    Err(e) if silently => {
                        let _ = e;
                        Ok(Variant::boolean(false))
                    }
                    Err(e) => Err(e),
                }
            }),
            "close" => Rc::new(move |_args, silently| match chan.close() {
                Ok(()) => Ok(Variant::boolean(true)),
                Err(e) if silently => {
                    let _ = e;
                    Ok(Variant::boolean(false))
                }
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
    fn test_header_round_trip() {
        for op in [
            MsgOpcode::Continuation,
            MsgOpcode::Text,
            MsgOpcode::Bin,
            MsgOpcode::End,
            MsgOpcode::Close,
            MsgOpcode::Ping,
            MsgOpcode::Pong,
        ] {
            let h = FrameHeader {
                op,
                fragmented: 0xABCD,
                sz_payload: 0x1234,
            };
            let parsed = FrameHeader::from_bytes(&h.to_bytes()).unwrap();
            assert_eq!(parsed, h);
        }
        // unknown opcode is refused
        let mut bad = FrameHeader {
            op: MsgOpcode::Text,
            fragmented: 0,
            sz_payload: 0,
        }
        .to_bytes();
        bad[0] = 0x7F;
        assert!(FrameHeader::from_bytes(&bad).is_none());
    }

    #[test]
    fn test_option_clamps() {
        let o = MessageOptions::clamped(0, 0, 0, 0);
        assert_eq!(o, MessageOptions::default());

        let o = MessageOptions::clamped(10, 10, 1, 1);
        assert_eq!(o.max_frame_payload_size, MIN_FRAME_PAYLOAD_SIZE);
        assert_eq!(o.max_message_size, MIN_INMEM_MESSAGE_SIZE);
        assert_eq!(o.no_resp_time_to_ping, MIN_NO_RESPONSE_TIME_TO_PING);
        assert_eq!(o.no_resp_time_to_close, MIN_NO_RESPONSE_TIME_TO_CLOSE);

        let o = MessageOptions::clamped(1 << 20, 1 << 22, 60, 120);
        assert_eq!(o.max_frame_payload_size, 1 << 20);
        assert_eq!(o.no_resp_time_to_close, 120);
    }

    #[test]
    fn test_options_from_variant() {
        let obj = Variant::object();
        obj.object_set("maxframepayloadsize", Variant::ulongint(8192))
            .unwrap();
        obj.object_set("noresptimetoping", Variant::ulongint(10))
            .unwrap();
        let o = MessageOptions::from_variant(&obj).unwrap();
        assert_eq!(o.max_frame_payload_size, 8192);
        assert_eq!(o.no_resp_time_to_ping, 10);
        assert_eq!(o.max_message_size, DEF_INMEM_MESSAGE_SIZE);
    }
}
