//! Stream entities
//!
//! `Stream::open` turns a URL into a pair of descriptors plus metadata:
//!
//! | Scheme | Target |
//! |--------|--------|
//! | `file` | regular file, open-mode keywords apply |
//! | `pipe` | spawned child process, both pipe ends |
//! | `fifo` | named FIFO, created `0644` when absent |
//! | `unix` / `local` | connected `AF_UNIX` stream socket |
//! | `inet` / `inet4` / `inet6` | connected TCP socket |
//!
//! A raw stream exposes byte/line/struct reads and writes, seek, the
//! pipe-only `writeeof`/`status`, and readiness events. Operations that
//! would block return `Again`; the caller retries on the next
//! `stream:readable` / `stream:writable` event. Protocol layers
//! (`message`, `websocket`) take the raw stream over and drive it from
//! the run loop instead.

use crate::error::{set_last_error, Error};
use crate::event::{self, current_coroutine};
use crate::io::{IoOutcome, PlainTransport, Transport};
use crate::runloop::{IoEvent, IoEvents, MonitorId, RunLoop};
use crate::struct_fmt;
use std::cell::RefCell;
use std::ffi::CString;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::Rc;
use url::Url;
use vellum_core::{Atom, NativeMethod, NativeOps, Variant};

/// Files and FIFOs are created with this mode.
const DEFAULT_CREATE_MODE: libc::mode_t = 0o644;

const EVENT_SOURCE: &str = "stream";
pub const SUB_EVENT_READABLE: &str = "readable";
pub const SUB_EVENT_WRITABLE: &str = "writable";
pub const SUB_EVENT_HANGUP: &str = "hangup";
pub const SUB_EVENT_ERROR: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    File,
    Pipe,
    Fifo,
    Unix,
    Inet,
}

/// How a child process wound down, for the pipe-only `status` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStatus {
    Running,
    Exited(i32),
    Signaled(i32),
}

pub(crate) struct StreamInner {
    pub fd_read: RawFd,
    pub fd_write: RawFd,
    pub kind: StreamKind,
    pub peer_addr: Option<String>,
    pub peer_port: Option<u16>,
    child: Option<libc::pid_t>,
    /// carry-over bytes between readlines/readstruct calls
    rdbuf: Vec<u8>,
    monitor_r: Option<MonitorId>,
    monitor_w: Option<MonitorId>,
    ioevents_r: IoEvents,
    ioevents_w: IoEvents,
    target: Option<Atom>,
    closed: bool,
}

pub struct Stream {
    inner: RefCell<StreamInner>,
}

fn cpath(path: &str) -> Result<CString, Error> {
    CString::new(path).map_err(|_| set_last_error(Error::InvalidValue))
}

/// Parse the open-mode keyword list for the `file` scheme. An empty or
/// `default` list means `read write create cloexec`.
fn parse_file_flags(options: &str) -> Result<libc::c_int, Error> {
    let mut read = false;
    let mut write = false;
    let mut flags = 0;
    let mut explicit = false;

    for kw in options.split_whitespace() {
        explicit = true;
        match kw {
            "default" => {
                read = true;
                write = true;
                flags |= libc::O_CREAT | libc::O_CLOEXEC;
            }
            "read" => read = true,
            "write" => write = true,
            "append" => {
                write = true;
                flags |= libc::O_APPEND;
            }
            "create" => flags |= libc::O_CREAT,
            "truncate" => flags |= libc::O_TRUNC,
            "nonblock" => flags |= libc::O_NONBLOCK,
            "cloexec" => flags |= libc::O_CLOEXEC,
            "keep" => {}
            _ => return Err(set_last_error(Error::InvalidValue)),
        }
    }
    if !explicit {
        read = true;
        write = true;
        flags |= libc::O_CREAT | libc::O_CLOEXEC;
    }

    let access = match (read, write) {
        (true, true) => libc::O_RDWR,
        (false, true) => libc::O_WRONLY,
        _ => libc::O_RDONLY,
    };
    Ok(flags | access)
}

fn open_path(path: &str, flags: libc::c_int) -> Result<RawFd, Error> {
    let cp = cpath(path)?;
    // Safety: cp is a valid NUL-terminated path
    let fd = unsafe { libc::open(cp.as_ptr(), flags, DEFAULT_CREATE_MODE as libc::c_uint) };
    if fd < 0 {
        let e = std::io::Error::last_os_error();
        return Err(set_last_error(match e.raw_os_error() {
            Some(libc::EACCES) => Error::AccessDenied,
            Some(libc::ENOENT) => Error::NotFound,
            _ => Error::IoFailure,
        }));
    }
    Ok(fd)
}

fn connect_unix(path: &str) -> Result<RawFd, Error> {
    let cp = cpath(path)?;
    // Safety: standard socket/connect sequence with a stack sockaddr_un
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(set_last_error(Error::IoFailure));
        }
        let mut addr: libc::sockaddr_un = std::mem::zeroed();
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = cp.as_bytes_with_nul();
        if bytes.len() > addr.sun_path.len() {
            libc::close(fd);
            return Err(set_last_error(Error::TooLong));
        }
        for (i, &b) in bytes.iter().enumerate() {
            addr.sun_path[i] = b as libc::c_char;
        }
        let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len();
        if libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len as libc::socklen_t)
            < 0
        {
            let e = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(set_last_error(match e.raw_os_error() {
                Some(libc::ECONNREFUSED) => Error::ConnRefused,
                Some(libc::ENOENT) => Error::NotFound,
                _ => Error::IoFailure,
            }));
        }
        Ok(fd)
    }
}

fn connect_inet(url: &Url, family: Option<bool>) -> Result<(RawFd, String, u16), Error> {
    use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

    let host = url
        .host_str()
        .ok_or_else(|| set_last_error(Error::InvalidValue))?;
    let port = url
        .port()
        .ok_or_else(|| set_last_error(Error::InvalidValue))?;

    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| set_last_error(Error::NotFound))?;
    let want_v6 = family;
    let addr: SocketAddr = addrs
        .filter(|a| match want_v6 {
            Some(true) => a.is_ipv6(),
            Some(false) => a.is_ipv4(),
            None => true,
        })
        .next()
        .ok_or_else(|| set_last_error(Error::NotFound))?;

    let stream = TcpStream::connect(addr).map_err(|e| {
        set_last_error(match e.kind() {
            std::io::ErrorKind::ConnectionRefused => Error::ConnRefused,
            std::io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::IoFailure,
        })
    })?;
    let peer = stream.peer_addr().map_err(|_| set_last_error(Error::IoFailure))?;
    Ok((stream.into_raw_fd(), peer.ip().to_string(), peer.port()))
}

/// Spawn `prog` with `args`, wiring its stdin/stdout to pipes. Returns
/// (read end of child stdout, write end of child stdin, pid).
fn spawn_pipe(prog: &str, args: &[String]) -> Result<(RawFd, RawFd, libc::pid_t), Error> {
    let cprog = cpath(prog)?;
    let cargs: Vec<CString> = std::iter::once(prog.to_string())
        .chain(args.iter().cloned())
        .map(|a| CString::new(a).map_err(|_| set_last_error(Error::InvalidValue)))
        .collect::<Result<_, _>>()?;
    let mut argv: Vec<*const libc::c_char> = cargs.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    // Safety: classic fork/exec with two pipes; the child only calls
    // async-signal-safe functions before execv
    unsafe {
        let mut to_child = [0i32; 2];
        let mut from_child = [0i32; 2];
        if libc::pipe(to_child.as_mut_ptr()) != 0 || libc::pipe(from_child.as_mut_ptr()) != 0 {
            return Err(set_last_error(Error::IoFailure));
        }

        let pid = libc::fork();
        if pid < 0 {
            return Err(set_last_error(Error::IoFailure));
        }
        if pid == 0 {
            libc::dup2(to_child[0], 0);
            libc::dup2(from_child[1], 1);
            libc::close(to_child[0]);
            libc::close(to_child[1]);
            libc::close(from_child[0]);
            libc::close(from_child[1]);
            libc::execv(cprog.as_ptr(), argv.as_ptr());
            libc::_exit(127);
        }

        libc::close(to_child[0]);
        libc::close(from_child[1]);
        Ok((from_child[0], to_child[1], pid))
    }
}

impl Stream {
    fn from_fds(
        fd_read: RawFd,
        fd_write: RawFd,
        kind: StreamKind,
        peer_addr: Option<String>,
        peer_port: Option<u16>,
        child: Option<libc::pid_t>,
    ) -> Rc<Stream> {
        Rc::new(Stream {
            inner: RefCell::new(StreamInner {
                fd_read,
                fd_write,
                kind,
                peer_addr,
                peer_port,
                child,
                rdbuf: Vec::new(),
                monitor_r: None,
                monitor_w: None,
                ioevents_r: IoEvents::empty(),
                ioevents_w: IoEvents::empty(),
                target: None,
                closed: false,
            }),
        })
    }

    /// Open a stream by URL. `options` is the keyword list for the
    /// `file` scheme and ignored elsewhere.
    pub fn open(url_str: &str, options: &str) -> Result<Rc<Stream>, Error> {
        let url = Url::parse(url_str).map_err(|_| set_last_error(Error::InvalidValue))?;
        match url.scheme() {
            "file" => {
                let flags = parse_file_flags(options)?;
                let fd = open_path(url.path(), flags)?;
                Ok(Stream::from_fds(fd, fd, StreamKind::File, None, None, None))
            }
            "fifo" => {
                let path = url.path();
                let cp = cpath(path)?;
                // Safety: mkfifo on a NUL-terminated path; EEXIST is fine
                let r = unsafe { libc::mkfifo(cp.as_ptr(), DEFAULT_CREATE_MODE) };
                if r != 0 {
                    let e = std::io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EEXIST) {
                        return Err(set_last_error(Error::IoFailure));
                    }
                }
                let fd = open_path(path, libc::O_RDWR | libc::O_NONBLOCK)?;
                Ok(Stream::from_fds(fd, fd, StreamKind::Fifo, None, None, None))
            }
            "pipe" => {
                let args: Vec<String> = url
                    .query_pairs()
                    .map(|(_, v)| v.into_owned())
                    .collect();
                let (r, w, pid) = spawn_pipe(url.path(), &args)?;
                Ok(Stream::from_fds(r, w, StreamKind::Pipe, None, None, Some(pid)))
            }
            "unix" | "local" => {
                let fd = connect_unix(url.path())?;
                Ok(Stream::from_fds(
                    fd,
                    fd,
                    StreamKind::Unix,
                    Some(url.path().to_string()),
                    None,
                    None,
                ))
            }
            "inet" | "inet4" | "inet6" => {
                let family = match url.scheme() {
                    "inet4" => Some(false),
                    "inet6" => Some(true),
                    _ => None,
                };
                let (fd, addr, port) = connect_inet(&url, family)?;
                Ok(Stream::from_fds(
                    fd,
                    fd,
                    StreamKind::Inet,
                    Some(addr),
                    Some(port),
                    None,
                ))
            }
            _ => Err(set_last_error(Error::NotSupported)),
        }
    }

    /// One of the well-known process streams: `stdin`, `stdout`, or
    /// `stderr`. The descriptor is duplicated so closing the stream
    /// leaves the process streams intact.
    pub fn stdio(which: &str) -> Result<Rc<Stream>, Error> {
        let fd = match which {
            "stdin" => 0,
            "stdout" => 1,
            "stderr" => 2,
            _ => return Err(set_last_error(Error::InvalidValue)),
        };
        // Safety: duplicating a well-known descriptor
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(set_last_error(Error::IoFailure));
        }
        Ok(Stream::from_fds(dup, dup, StreamKind::File, None, None, None))
    }

    /// Wrap an already-connected socket descriptor, e.g. one handed out
    /// by `accept` or a socketpair.
    pub fn from_accepted(
        fd: RawFd,
        kind: StreamKind,
        peer_addr: Option<String>,
        peer_port: Option<u16>,
    ) -> Rc<Stream> {
        Stream::from_fds(fd, fd, kind, peer_addr, peer_port, None)
    }

    pub fn kind(&self) -> StreamKind {
        self.inner.borrow().kind
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd_read
    }

    pub fn peer_addr(&self) -> Option<String> {
        self.inner.borrow().peer_addr.clone()
    }

    pub fn peer_port(&self) -> Option<u16> {
        self.inner.borrow().peer_port
    }

    /// Tear the stream out of its Rc wrapper pieces: descriptors plus
    /// peer info, for a protocol layer that takes over the I/O.
    pub(crate) fn take_fds(&self) -> (RawFd, RawFd) {
        let mut inner = self.inner.borrow_mut();
        let fds = (inner.fd_read, inner.fd_write);
        inner.fd_read = -1;
        inner.fd_write = -1;
        inner.closed = true;
        fds
    }

    fn transport(&self) -> Result<PlainTransport, Error> {
        let inner = self.inner.borrow();
        if inner.closed || inner.fd_read < 0 {
            return Err(set_last_error(Error::EntityGone));
        }
        Ok(PlainTransport {
            fd_read: inner.fd_read,
            fd_write: inner.fd_write,
        })
    }

    /// Read up to `n` bytes. Would-block returns `Again`; end of stream
    /// returns an empty vector.
    pub fn read_bytes(&self, n: usize) -> Result<Vec<u8>, Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(set_last_error(Error::EntityGone));
        }
        let mut out = Vec::new();
        // serve buffered carry-over first
        if !inner.rdbuf.is_empty() {
            let take = n.min(inner.rdbuf.len());
            out.extend(inner.rdbuf.drain(..take));
            if out.len() == n {
                return Ok(out);
            }
        }
        let mut t = PlainTransport {
            fd_read: inner.fd_read,
            fd_write: inner.fd_write,
        };
        let mut buf = vec![0u8; n - out.len()];
        match t.read(&mut buf) {
            IoOutcome::Bytes(got) => {
                buf.truncate(got);
                out.extend_from_slice(&buf);
                Ok(out)
            }
            IoOutcome::WouldBlock => {
                if out.is_empty() {
                    Err(set_last_error(Error::Again))
                } else {
                    Ok(out)
                }
            }
            IoOutcome::Closed => Ok(out),
            IoOutcome::Failed => Err(set_last_error(Error::IoFailure)),
        }
    }

    /// Read into a caller buffer; returns the byte count.
    pub fn read_into(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let got = self.read_bytes(buf.len())?;
        buf[..got.len()].copy_from_slice(&got);
        Ok(got.len())
    }

    pub fn write_bytes(&self, data: &[u8]) -> Result<usize, Error> {
        let mut t = self.transport()?;
        let mut written = 0usize;
        while written < data.len() {
            match t.write(&data[written..]) {
                IoOutcome::Bytes(n) => written += n,
                IoOutcome::WouldBlock => {
                    if written == 0 {
                        return Err(set_last_error(Error::Again));
                    }
                    break;
                }
                IoOutcome::Closed => return Err(set_last_error(Error::BrokenPipe)),
                IoOutcome::Failed => return Err(set_last_error(Error::IoFailure)),
            }
        }
        Ok(written)
    }

    /// Pull more bytes into the carry-over buffer. Ok(true) means more
    /// may follow, Ok(false) means EOF.
    fn fill_rdbuf(&self) -> Result<bool, Error> {
        let mut inner = self.inner.borrow_mut();
        let mut t = PlainTransport {
            fd_read: inner.fd_read,
            fd_write: inner.fd_write,
        };
        let mut chunk = [0u8; 4096];
        match t.read(&mut chunk) {
            IoOutcome::Bytes(n) => {
                inner.rdbuf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            IoOutcome::WouldBlock => Err(set_last_error(Error::Again)),
            IoOutcome::Closed => Ok(false),
            IoOutcome::Failed => Err(set_last_error(Error::IoFailure)),
        }
    }

    /// Read `count` lines split by `sep` (a single byte, `\n` by
    /// default). Would-block before `count` lines are available keeps
    /// the partial data buffered and returns `Again`.
    pub fn read_lines(&self, count: usize, sep: u8) -> Result<Vec<String>, Error> {
        if count == 0 {
            return Ok(Vec::new());
        }
        loop {
            {
                let inner = self.inner.borrow();
                let found = inner.rdbuf.iter().filter(|&&b| b == sep).count();
                if found >= count {
                    break;
                }
            }
            if !self.fill_rdbuf()? {
                break; // EOF: whatever is buffered is all there is
            }
        }

        let mut inner = self.inner.borrow_mut();
        let mut lines = Vec::new();
        while lines.len() < count {
            match inner.rdbuf.iter().position(|&b| b == sep) {
                Some(pos) => {
                    let line: Vec<u8> = inner.rdbuf.drain(..=pos).take(pos).collect();
                    lines.push(
                        String::from_utf8(line)
                            .map_err(|_| set_last_error(Error::InvalidValue))?,
                    );
                }
                None => {
                    if inner.rdbuf.is_empty() {
                        break;
                    }
                    let rest: Vec<u8> = inner.rdbuf.drain(..).collect();
                    lines.push(
                        String::from_utf8(rest)
                            .map_err(|_| set_last_error(Error::InvalidValue))?,
                    );
                }
            }
        }
        Ok(lines)
    }

    pub fn write_lines(&self, lines: &[&str], sep: u8) -> Result<usize, Error> {
        let mut buf = Vec::new();
        for line in lines {
            buf.extend_from_slice(line.as_bytes());
            buf.push(sep);
        }
        self.write_bytes(&buf)
    }

    /// Read one struct per the format string; the full wire size must be
    /// available or become available without blocking.
    pub fn read_struct(&self, fmt: &str) -> Result<Vec<Variant>, Error> {
        let need = struct_fmt::format_size(fmt)?;
        loop {
            if self.inner.borrow().rdbuf.len() >= need {
                break;
            }
            if !self.fill_rdbuf()? {
                return Err(set_last_error(Error::InvalidValue)); // truncated
            }
        }
        let mut inner = self.inner.borrow_mut();
        let data: Vec<u8> = inner.rdbuf.drain(..need).collect();
        drop(inner);
        struct_fmt::unpack(fmt, &data)
    }

    pub fn write_struct(&self, fmt: &str, args: &[Variant]) -> Result<usize, Error> {
        let wire = struct_fmt::pack(fmt, args)?;
        self.write_bytes(&wire)
    }

    /// Reposition the descriptor. Pipes and sockets cannot seek.
    pub fn seek(&self, offset: i64, whence: SeekWhence) -> Result<u64, Error> {
        let inner = self.inner.borrow();
        if matches!(inner.kind, StreamKind::Pipe | StreamKind::Unix | StreamKind::Inet) {
            return Err(set_last_error(Error::NotSupported));
        }
        let w = match whence {
            SeekWhence::Set => libc::SEEK_SET,
            SeekWhence::Current => libc::SEEK_CUR,
            SeekWhence::End => libc::SEEK_END,
        };
        // Safety: plain lseek
        let pos = unsafe { libc::lseek(inner.fd_read, offset as libc::off_t, w) };
        if pos < 0 {
            return Err(set_last_error(Error::IoFailure));
        }
        Ok(pos as u64)
    }

    /// Close the write side (pipe only), delivering EOF to the child.
    pub fn write_eof(&self) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.kind != StreamKind::Pipe {
            return Err(set_last_error(Error::NotSupported));
        }
        if inner.fd_write >= 0 {
            // Safety: closing our own descriptor
            unsafe { libc::close(inner.fd_write) };
            inner.fd_write = -1;
        }
        Ok(())
    }

    /// Child process status (pipe only).
    pub fn status(&self) -> Result<PipeStatus, Error> {
        let inner = self.inner.borrow();
        let Some(pid) = inner.child else {
            return Err(set_last_error(Error::NotSupported));
        };
        let mut wstatus = 0i32;
        // Safety: non-blocking waitpid on our child
        let r = unsafe { libc::waitpid(pid, &mut wstatus, libc::WNOHANG) };
        if r == 0 {
            Ok(PipeStatus::Running)
        } else if r == pid {
            if libc::WIFEXITED(wstatus) {
                Ok(PipeStatus::Exited(libc::WEXITSTATUS(wstatus)))
            } else {
                Ok(PipeStatus::Signaled(libc::WTERMSIG(wstatus)))
            }
        } else {
            Err(set_last_error(Error::IoFailure))
        }
    }

    /// Bind readiness events to `target` and (de)install monitors so the
    /// union of subscriptions is watched.
    pub fn observe(self: &Rc<Self>, sub: &str, target: Atom) -> Result<(), Error> {
        let (want_r, want_w) = match sub {
            SUB_EVENT_READABLE => (IoEvents::from(IoEvent::In), IoEvents::empty()),
            SUB_EVENT_WRITABLE => (IoEvents::empty(), IoEvents::from(IoEvent::Out)),
            SUB_EVENT_HANGUP | SUB_EVENT_ERROR => {
                (IoEvents::from(IoEvent::Hup) | IoEvent::Err, IoEvents::empty())
            }
            _ => return Err(set_last_error(Error::InvalidValue)),
        };
        {
            let mut inner = self.inner.borrow_mut();
            inner.target = Some(target);
            inner.ioevents_r |= want_r;
            inner.ioevents_w |= want_w;
        }
        self.sync_monitors()
    }

    /// Withdraw a readiness subscription.
    pub fn forget(self: &Rc<Self>, sub: &str) -> Result<(), Error> {
        {
            let mut inner = self.inner.borrow_mut();
            match sub {
                SUB_EVENT_READABLE => inner.ioevents_r &= !IoEvents::from(IoEvent::In),
                SUB_EVENT_WRITABLE => inner.ioevents_w &= !IoEvents::from(IoEvent::Out),
                SUB_EVENT_HANGUP | SUB_EVENT_ERROR => {
                    inner.ioevents_r &= !(IoEvents::from(IoEvent::Hup) | IoEvent::Err)
                }
                _ => return Err(set_last_error(Error::InvalidValue)),
            }
        }
        self.sync_monitors()
    }

    /// Make the installed monitors reflect the subscribed masks.
    fn sync_monitors(self: &Rc<Self>) -> Result<(), Error> {
        let rl = RunLoop::current();
        let weak = Rc::downgrade(self);
        let mut inner = self.inner.borrow_mut();

        let mut events_r = inner.ioevents_r;
        if inner.fd_read == inner.fd_write {
            events_r |= inner.ioevents_w;
        }

        if let Some(id) = inner.monitor_r.take() {
            rl.remove_monitor(id);
        }
        if !events_r.is_empty() && inner.fd_read >= 0 {
            let cb_weak = weak.clone();
            inner.monitor_r = Some(rl.install_monitor(
                inner.fd_read,
                events_r,
                Rc::new(move |fd, got| match cb_weak.upgrade() {
                    Some(stream) => stream.dispatch_io(fd, got),
                    None => false,
                }),
            )?);
        }

        if inner.fd_read != inner.fd_write && inner.fd_write >= 0 {
            if let Some(id) = inner.monitor_w.take() {
                rl.remove_monitor(id);
            }
            if !inner.ioevents_w.is_empty() {
                inner.monitor_w = Some(rl.install_monitor(
                    inner.fd_write,
                    inner.ioevents_w,
                    Rc::new(move |fd, got| match weak.upgrade() {
                        Some(stream) => stream.dispatch_io(fd, got),
                        None => false,
                    }),
                )?);
            }
        }
        Ok(())
    }

    /// Route one readiness notification to the bound coroutine.
    fn dispatch_io(self: &Rc<Self>, _fd: RawFd, got: IoEvents) -> bool {
        let target = match self.inner.borrow().target {
            Some(t) => t,
            None => {
                tracing::warn!("io event for a stream not bound to a coroutine");
                return false;
            }
        };

        if got.contains(IoEvent::Hup) {
            let _ = event::post_event(target, EVENT_SOURCE, EVENT_SOURCE, Some(SUB_EVENT_HANGUP), None);
        }
        if got.contains(IoEvent::Err) {
            let _ = event::post_event(target, EVENT_SOURCE, EVENT_SOURCE, Some(SUB_EVENT_ERROR), None);
        }
        if got.intersects(IoEvents::from(IoEvent::Hup) | IoEvent::Err | IoEvent::Nval) {
            let mut inner = self.inner.borrow_mut();
            inner.monitor_r = None;
            inner.monitor_w = None;
            return false;
        }
        if got.contains(IoEvent::In) {
            let _ = event::post_event(target, EVENT_SOURCE, EVENT_SOURCE, Some(SUB_EVENT_READABLE), None);
        }
        if got.contains(IoEvent::Out) {
            let _ = event::post_event(target, EVENT_SOURCE, EVENT_SOURCE, Some(SUB_EVENT_WRITABLE), None);
        }
        true
    }

    /// Close descriptors, remove monitors, reap a pipe child.
    pub fn close(&self) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        let rl = RunLoop::current();
        if let Some(id) = inner.monitor_r.take() {
            rl.remove_monitor(id);
        }
        if let Some(id) = inner.monitor_w.take() {
            rl.remove_monitor(id);
        }
        // Safety: closing our own descriptors once
        unsafe {
            if inner.fd_read >= 0 {
                libc::close(inner.fd_read);
            }
            if inner.fd_write >= 0 && inner.fd_write != inner.fd_read {
                libc::close(inner.fd_write);
            }
        }
        inner.fd_read = -1;
        inner.fd_write = -1;
        if let Some(pid) = inner.child.take() {
            let mut st = 0i32;
            // Safety: reaping our child; WNOHANG keeps shutdown prompt
            unsafe { libc::waitpid(pid, &mut st, libc::WNOHANG) };
        }
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.closed {
            // Safety: closing our own descriptors
            unsafe {
                if inner.fd_read >= 0 {
                    libc::close(inner.fd_read);
                }
                if inner.fd_write >= 0 && inner.fd_write != inner.fd_read {
                    libc::close(inner.fd_write);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Current,
    End,
}

impl SeekWhence {
    pub fn from_keyword(kw: &str) -> Result<SeekWhence, Error> {
        match kw {
            "set" => Ok(SeekWhence::Set),
            "current" => Ok(SeekWhence::Current),
            "end" => Ok(SeekWhence::End),
            _ => Err(set_last_error(Error::InvalidValue)),
        }
    }
}

/// The `stream.open` surface: open by URL and optionally stack one of
/// the recognized subprotocols (`message`, `websocket`, `hbdbus`) on a
/// connected socket. Returns the native entity for the topmost layer.
pub fn open_stream(
    url: &str,
    options: &str,
    subprotocol: Option<&str>,
    extra_opts: Option<&Variant>,
) -> Result<Variant, Error> {
    use crate::hbdbus;
    use crate::message::{MessageChannel, MessageEntity, MessageOptions};
    use crate::websocket::{ClientHandshake, WsChannel, WsEntity, WsRole};

    let stream = Stream::open(url, options)?;
    let Some(subprotocol) = subprotocol else {
        return Ok(StreamEntity::to_variant(stream));
    };

    // protocol layers sit on connected sockets only
    if !matches!(stream.kind(), StreamKind::Unix | StreamKind::Inet) {
        return Err(set_last_error(Error::NotSupported));
    }

    match subprotocol {
        "message" => {
            let opts = match extra_opts {
                Some(o) => MessageOptions::from_variant(o)?,
                None => MessageOptions::default(),
            };
            let chan = MessageChannel::attach(&stream, opts)?;
            Ok(MessageEntity::to_variant(chan))
        }
        "hbdbus" => {
            // the bus speaks the message framing on the wire, with its
            // own limits
            let opts = MessageOptions::clamped(
                hbdbus::HBDBUS_MAX_FRAME_PAYLOAD_SIZE,
                hbdbus::HBDBUS_MAX_INMEM_PAYLOAD_SIZE,
                hbdbus::HBDBUS_MAX_PING_TIME,
                hbdbus::HBDBUS_MAX_NO_RESPONDING_TIME,
            );
            let chan = MessageChannel::attach(&stream, opts)?;
            Ok(MessageEntity::to_variant(chan))
        }
        "websocket" => {
            let opts = match extra_opts {
                Some(o) => MessageOptions::from_variant(o)?,
                None => MessageOptions::default(),
            };
            let hs = extra_opts
                .map(ClientHandshake::from_variant)
                .unwrap_or_default();
            let chan = WsChannel::attach(&stream, WsRole::Client, opts, None, Some(hs))?;
            Ok(WsEntity::to_variant(chan))
        }
        _ => Err(set_last_error(Error::NotSupported)),
    }
}

// ---------------------------------------------------------------------------
// native entity facade

/// The ops table a raw stream exposes to the interpreter.
pub struct StreamEntity {
    stream: Rc<Stream>,
}

impl StreamEntity {
    pub fn new(stream: Rc<Stream>) -> StreamEntity {
        StreamEntity { stream }
    }

    /// Wrap as a `native` variant named `stream`.
    pub fn to_variant(stream: Rc<Stream>) -> Variant {
        Variant::native("stream", Rc::new(StreamEntity::new(stream)))
    }
}

fn silently_or<T>(silently: bool, fallback: T, e: Error) -> Result<T, Error> {
    if silently {
        Ok(fallback)
    } else {
        Err(e)
    }
}

fn arg_str(args: &[Variant], idx: usize) -> Result<String, Error> {
    args.get(idx)
        .ok_or_else(|| set_last_error(Error::ArgumentMissed))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| set_last_error(Error::WrongDataType))
}

fn sep_byte(args: &[Variant], idx: usize) -> u8 {
    args.get(idx)
        .and_then(|v| v.as_str())
        .and_then(|s| s.bytes().next())
        .unwrap_or(b'\n')
}

impl NativeOps for StreamEntity {
    fn property_getter(&self, name: &str) -> Option<NativeMethod> {
        let stream = self.stream.clone();
        let method: NativeMethod = match name {
            "readstruct" => Rc::new(move |args, silently| {
                let fmt = arg_str(args, 0)?;
                match stream.read_struct(&fmt) {
                    Ok(vals) => Ok(Variant::tuple_from(vals)),
                    Err(e) => silently_or(silently, Variant::undefined(), e),
                }
            }),
            "writestruct" => Rc::new(move |args, silently| {
                let fmt = arg_str(args, 0)?;
                match stream.write_struct(&fmt, &args[1..]) {
                    Ok(n) => Ok(Variant::ulongint(n as u64)),
                    Err(e) => silently_or(silently, Variant::boolean(false), e),
                }
            }),
            "readlines" => Rc::new(move |args, silently| {
                let n = args
                    .first()
                    .ok_or_else(|| set_last_error(Error::ArgumentMissed))?
                    .cast_to_u64(false)? as usize;
                match stream.read_lines(n, sep_byte(args, 1)) {
                    Ok(lines) => Ok(Variant::array_from(
                        lines.iter().map(|l| Variant::string(l)),
                    )),
                    Err(e) => silently_or(silently, Variant::undefined(), e),
                }
            }),
            "writelines" => Rc::new(move |args, silently| {
                let first = args
                    .first()
                    .ok_or_else(|| set_last_error(Error::ArgumentMissed))?;
                let lines: Vec<String> = if let Some(s) = first.as_str() {
                    vec![s.to_string()]
                } else {
                    first
                        .array_elements()?
                        .iter()
                        .map(|v| {
                            v.as_str()
                                .map(str::to_string)
                                .ok_or_else(|| set_last_error(Error::WrongDataType))
                        })
                        .collect::<Result<_, _>>()?
                };
                let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
                match stream.write_lines(&refs, sep_byte(args, 1)) {
                    Ok(n) => Ok(Variant::ulongint(n as u64)),
                    Err(e) => silently_or(silently, Variant::boolean(false), e),
                }
            }),
            "readbytes" | "readbytes2buffer" => Rc::new(move |args, silently| {
                let n = args
                    .first()
                    .ok_or_else(|| set_last_error(Error::ArgumentMissed))?
                    .cast_to_u64(false)? as usize;
                match stream.read_bytes(n) {
                    Ok(bytes) => Ok(Variant::byte_seq_reuse(bytes)),
                    Err(e) => silently_or(silently, Variant::undefined(), e),
                }
            }),
            "writebytes" => Rc::new(move |args, silently| {
                let first = args
                    .first()
                    .ok_or_else(|| set_last_error(Error::ArgumentMissed))?;
                let data: Vec<u8> = if let Some(b) = first.as_bytes() {
                    b.to_vec()
                } else if let Some(s) = first.as_str() {
                    s.as_bytes().to_vec()
                } else {
                    return Err(set_last_error(Error::WrongDataType));
                };
                match stream.write_bytes(&data) {
                    Ok(n) => Ok(Variant::ulongint(n as u64)),
                    Err(e) => silently_or(silently, Variant::boolean(false), e),
                }
            }),
            "writeeof" => Rc::new(move |_args, silently| match stream.write_eof() {
                Ok(()) => Ok(Variant::boolean(true)),
                Err(e) => silently_or(silently, Variant::boolean(false), e),
            }),
            "status" => Rc::new(move |_args, silently| match stream.status() {
                Ok(PipeStatus::Running) => {
                    Ok(Variant::tuple_from([Variant::string("running"), Variant::null()]))
                }
                Ok(PipeStatus::Exited(code)) => Ok(Variant::tuple_from([
                    Variant::string("exited"),
                    Variant::longint(code as i64),
                ])),
                Ok(PipeStatus::Signaled(sig)) => Ok(Variant::tuple_from([
                    Variant::string("signaled"),
                    Variant::longint(sig as i64),
                ])),
                Err(e) => silently_or(silently, Variant::undefined(), e),
            }),
            "seek" => Rc::new(move |args, silently| {
                let off = args
                    .first()
                    .ok_or_else(|| set_last_error(Error::ArgumentMissed))?
                    .cast_to_i64(false)?;
                let whence = match args.get(1).and_then(|v| v.as_str()) {
                    Some(kw) => SeekWhence::from_keyword(kw)?,
                    None => SeekWhence::Set,
                };
                match stream.seek(off, whence) {
                    Ok(pos) => Ok(Variant::ulongint(pos)),
                    Err(e) => silently_or(silently, Variant::undefined(), e),
                }
            }),
            "close" => Rc::new(move |_args, _silently| {
                stream.close()?;
                Ok(Variant::boolean(true))
            }),
            "fd" => Rc::new(move |_args, _silently| Ok(Variant::longint(stream.fd() as i64))),
            "peerAddr" => Rc::new(move |_args, _silently| {
                Ok(match stream.peer_addr() {
                    Some(a) => Variant::string(&a),
                    None => Variant::null(),
                })
            }),
            "peerPort" => Rc::new(move |_args, _silently| {
                Ok(match stream.peer_port() {
                    Some(p) => Variant::string(&p.to_string()),
                    None => Variant::null(),
                })
            }),
            _ => return None,
        };
        Some(method)
    }

    fn on_observe(&self, event: &str, sub: &str) -> bool {
        if event != EVENT_SOURCE {
            return false;
        }
        let Some(target) = current_coroutine() else {
            return false;
        };
        self.stream.observe(sub, target).is_ok()
    }

    fn on_forget(&self, event: &str, sub: &str) -> bool {
        event == EVENT_SOURCE && self.stream.forget(sub).is_ok()
    }

    fn on_release(&self) {
        let _ = self.stream.close();
    }
}
