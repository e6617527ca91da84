//! Vellum event-driven stream core
//!
//! The non-blocking socket/stream runtime under the Vellum interpreter:
//! a per-thread run loop with fd monitors and timers, stream entities
//! for files, pipes, FIFOs, and sockets, a framed message protocol, a
//! WebSocket engine (RFC 6455) with optional TLS, the HBDBus
//! subprotocol, and a socket factory for listeners and datagrams.
//!
//! Key design principles:
//! - Single-threaded cooperative scheduling: every callback runs on the
//!   loop thread, operations that would block return `Again`.
//! - Complete inbound messages surface to the interpreter as variants,
//!   posted FIFO to a coroutine through the move heap.
//! - Back-pressure is byte-counted: past 512 KiB of queued output a
//!   stream refuses new sends until it drains.
//!
//! # Modules
//!
//! - `runloop`: poll-based fd monitors and interval timers
//! - `event`: atom-addressed event delivery between instances
//! - `io`: transport seam and the throttled write queue
//! - `status`: stream status flags and fatal reasons
//! - `stream`: stream entities and their URL-scheme open
//! - `struct_fmt`: readstruct/writestruct binary formats
//! - `message`: the framed message protocol
//! - `websocket`: the RFC 6455 engine
//! - `hbdbus`: the data-bus subprotocol
//! - `socket`: listening and datagram socket factory
//! - `tls`: rustls wrapping and the shared session cache

pub mod error;
pub mod event;
pub mod hbdbus;
pub mod io;
pub mod message;
pub mod runloop;
pub mod socket;
pub mod status;
pub mod stream;
pub mod struct_fmt;
pub mod tls;
pub mod websocket;

pub use event::{
    current_coroutine, post_event, register_sink, set_current_coroutine, unregister_sink,
    EventReceiver, SessionEvent,
};
pub use io::SOCK_THROTTLE_THLD;
pub use message::{MessageChannel, MessageEntity, MessageOptions};
pub use runloop::{IoEvent, IoEvents, RunLoop};
pub use socket::{Socket, SocketEntity, SocketFlags, TlsOptions};
pub use status::{FatalReason, Status, StreamFlag};
pub use stream::{open_stream, PipeStatus, SeekWhence, Stream, StreamEntity, StreamKind};
pub use websocket::{ClientHandshake, WsChannel, WsEntity, WsRole};
