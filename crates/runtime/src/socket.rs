//! Socket factory
//!
//! Creates listening stream sockets and datagram sockets from the same
//! URL schemes the stream layer speaks (`unix`/`local`, `inet`,
//! `inet4`, `inet6`). Stream sockets hand out connected `Stream`s via
//! `accept`; datagram sockets expose `sendto`/`recvfrom`.
//!
//! Open-flag tokens: `global`, `nameless`, `nonblock`, `cloexec`,
//! `default` (= `nonblock cloexec`), `none`. Listening sockets may carry
//! TLS material (`sslcert`/`sslkey`) plus an optional shared session
//! cache id for their accepted workers.

use crate::error::{set_last_error, Error};
use crate::event::{self, current_coroutine};
use crate::runloop::{IoEvent, IoEvents, MonitorId, RunLoop};
use crate::stream::{Stream, StreamKind};
use crate::tls::{self, CacheUsers, ShmSessionCache, TLS_SESSION_CACHE_SIZE_MIN};
use std::cell::RefCell;
use std::ffi::CString;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use url::Url;
use vellum_core::{Atom, NativeMethod, NativeOps, Variant};

pub const EVENT_CONN_ATTEMPT: &str = "connAttempt";
pub const EVENT_NEW_DATAGRAM: &str = "newDatagram";

/// Socket open flags parsed from their keyword tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketFlags {
    pub global: bool,
    pub nameless: bool,
    pub nonblock: bool,
    pub cloexec: bool,
}

impl SocketFlags {
    /// `default` means `nonblock cloexec`; `none` clears everything.
    pub fn parse(tokens: &str) -> Result<SocketFlags, Error> {
        let mut out = SocketFlags::default();
        for tok in tokens.split_whitespace() {
            match tok {
                "default" => {
                    out.nonblock = true;
                    out.cloexec = true;
                }
                "none" => out = SocketFlags::default(),
                "global" => out.global = true,
                "nameless" => out.nameless = true,
                "nonblock" => out.nonblock = true,
                "cloexec" => out.cloexec = true,
                _ => return Err(set_last_error(Error::InvalidValue)),
            }
        }
        Ok(out)
    }
}

/// TLS options for a listening stream socket.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub sslcert: String,
    pub sslkey: String,
    pub sslsessioncacheid: Option<String>,
    pub sslsessioncacheusers: CacheUsers,
    pub sslsessioncachesize: u64,
}

impl TlsOptions {
    /// Parse the `{sslcert, sslkey, sslsessioncacheid,
    /// sslsessioncacheusers, sslsessioncachesize}` option object.
    pub fn from_variant(opts: &Variant) -> Result<TlsOptions, Error> {
        let get_str = |key: &str| -> Result<Option<String>, Error> {
            match opts.object_get(key)? {
                Some(v) => v
                    .as_str()
                    .map(|s| Some(s.to_string()))
                    .ok_or_else(|| set_last_error(Error::WrongDataType)),
                None => Ok(None),
            }
        };

        let sslcert = get_str("sslcert")?.ok_or_else(|| set_last_error(Error::ArgumentMissed))?;
        let sslkey = get_str("sslkey")?.ok_or_else(|| set_last_error(Error::ArgumentMissed))?;
        let sslsessioncacheid = get_str("sslsessioncacheid")?;

        let mut users = CacheUsers::default();
        if let Some(tokens) = get_str("sslsessioncacheusers")? {
            for tok in tokens.split_whitespace() {
                match tok {
                    "group" => users.group = true,
                    "other" => users.other = true,
                    _ => return Err(set_last_error(Error::InvalidValue)),
                }
            }
        }

        let size = match opts.object_get("sslsessioncachesize")? {
            Some(v) => v.cast_to_u64(false)?,
            None => TLS_SESSION_CACHE_SIZE_MIN,
        };

        Ok(TlsOptions {
            sslcert,
            sslkey,
            sslsessioncacheid,
            sslsessioncacheusers: users,
            sslsessioncachesize: size.max(TLS_SESSION_CACHE_SIZE_MIN),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    LocalStream,
    InetStream,
    LocalDgram,
    InetDgram,
}

struct SocketInner {
    fd: RawFd,
    kind: SocketKind,
    local_path: Option<String>,
    monitor: Option<MonitorId>,
    target: Option<Atom>,
    tls: Option<Arc<rustls::ServerConfig>>,
    session_cache: Option<Arc<ShmSessionCache>>,
    closed: bool,
}

pub struct Socket {
    inner: RefCell<SocketInner>,
}

fn apply_fd_flags(fd: RawFd, flags: SocketFlags) -> Result<(), Error> {
    // Safety: fcntl on our own descriptor
    unsafe {
        if flags.nonblock {
            let cur = libc::fcntl(fd, libc::F_GETFL, 0);
            if cur < 0 || libc::fcntl(fd, libc::F_SETFL, cur | libc::O_NONBLOCK) < 0 {
                return Err(set_last_error(Error::IoFailure));
            }
        }
        if flags.cloexec {
            let cur = libc::fcntl(fd, libc::F_GETFD, 0);
            if cur < 0 || libc::fcntl(fd, libc::F_SETFD, cur | libc::FD_CLOEXEC) < 0 {
                return Err(set_last_error(Error::IoFailure));
            }
        }
    }
    Ok(())
}

fn bind_unix(fd: RawFd, path: &str) -> Result<(), Error> {
    let cp = CString::new(path).map_err(|_| set_last_error(Error::InvalidValue))?;
    // Safety: bind with a stack sockaddr_un; stale socket files are
    // unlinked first
    unsafe {
        libc::unlink(cp.as_ptr());
        let mut addr: libc::sockaddr_un = std::mem::zeroed();
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = cp.as_bytes_with_nul();
        if bytes.len() > addr.sun_path.len() {
            return Err(set_last_error(Error::TooLong));
        }
        for (i, &b) in bytes.iter().enumerate() {
            addr.sun_path[i] = b as libc::c_char;
        }
        let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len();
        if libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len as libc::socklen_t) < 0 {
            return Err(set_last_error(Error::AccessDenied));
        }
    }
    Ok(())
}

impl Socket {
    fn build(
        fd: RawFd,
        kind: SocketKind,
        local_path: Option<String>,
        tls: Option<Arc<rustls::ServerConfig>>,
        session_cache: Option<Arc<ShmSessionCache>>,
    ) -> Rc<Socket> {
        Rc::new(Socket {
            inner: RefCell::new(SocketInner {
                fd,
                kind,
                local_path,
                monitor: None,
                target: None,
                tls,
                session_cache,
                closed: false,
            }),
        })
    }

    /// Create a listening stream socket.
    pub fn stream(
        url_str: &str,
        flags: SocketFlags,
        backlog: i32,
        tls_opts: Option<&TlsOptions>,
    ) -> Result<Rc<Socket>, Error> {
        let url = Url::parse(url_str).map_err(|_| set_last_error(Error::InvalidValue))?;

        let (tls, cache) = match tls_opts {
            Some(opts) => {
                let cache = match &opts.sslsessioncacheid {
                    Some(id) => Some(ShmSessionCache::open(
                        id,
                        opts.sslsessioncacheusers,
                        opts.sslsessioncachesize,
                    )?),
                    None => None,
                };
                let config = tls::server_config(&opts.sslcert, &opts.sslkey, cache.clone())?;
                (Some(config), cache)
            }
            None => (None, None),
        };

        match url.scheme() {
            "unix" | "local" => {
                // Safety: socket + listen with checked results
                let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
                if fd < 0 {
                    return Err(set_last_error(Error::IoFailure));
                }
                bind_unix(fd, url.path()).inspect_err(|_| unsafe {
                    libc::close(fd);
                })?;
                if unsafe { libc::listen(fd, backlog.max(1)) } < 0 {
                    unsafe { libc::close(fd) };
                    return Err(set_last_error(Error::IoFailure));
                }
                apply_fd_flags(fd, flags)?;
                Ok(Socket::build(
                    fd,
                    SocketKind::LocalStream,
                    Some(url.path().to_string()),
                    tls,
                    cache,
                ))
            }
            "inet" | "inet4" | "inet6" => {
                let host = url.host_str().unwrap_or("0.0.0.0");
                let port = url.port().unwrap_or(0);
                let listener = std::net::TcpListener::bind((host, port))
                    .map_err(|_| set_last_error(Error::AccessDenied))?;
                let fd = listener.into_raw_fd();
                apply_fd_flags(fd, flags)?;
                Ok(Socket::build(fd, SocketKind::InetStream, None, tls, cache))
            }
            _ => Err(set_last_error(Error::NotSupported)),
        }
    }

    /// Create a datagram socket. With `nameless`, local sockets skip
    /// binding and can only send.
    pub fn dgram(url_str: &str, flags: SocketFlags) -> Result<Rc<Socket>, Error> {
        let url = Url::parse(url_str).map_err(|_| set_last_error(Error::InvalidValue))?;
        match url.scheme() {
            "unix" | "local" => {
                // Safety: socket + optional bind
                let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0) };
                if fd < 0 {
                    return Err(set_last_error(Error::IoFailure));
                }
                let path = if flags.nameless {
                    None
                } else {
                    bind_unix(fd, url.path()).inspect_err(|_| unsafe {
                        libc::close(fd);
                    })?;
                    Some(url.path().to_string())
                };
                apply_fd_flags(fd, flags)?;
                Ok(Socket::build(fd, SocketKind::LocalDgram, path, None, None))
            }
            "inet" | "inet4" | "inet6" => {
                let host = url.host_str().unwrap_or("0.0.0.0");
                let port = url.port().unwrap_or(0);
                let sock = std::net::UdpSocket::bind((host, port))
                    .map_err(|_| set_last_error(Error::AccessDenied))?;
                let fd = sock.into_raw_fd();
                apply_fd_flags(fd, flags)?;
                Ok(Socket::build(fd, SocketKind::InetDgram, None, None, None))
            }
            _ => Err(set_last_error(Error::NotSupported)),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    /// The TLS acceptor for workers accepted from this socket.
    pub fn tls_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.inner.borrow().tls.clone()
    }

    pub fn session_cache(&self) -> Option<Arc<ShmSessionCache>> {
        self.inner.borrow().session_cache.clone()
    }

    /// Accept one pending client. `Again` when nothing is pending.
    pub fn accept(&self, flags: SocketFlags) -> Result<Rc<Stream>, Error> {
        let inner = self.inner.borrow();
        if inner.closed {
            return Err(set_last_error(Error::EntityGone));
        }
        let (kind, fd) = match inner.kind {
            SocketKind::LocalStream => (StreamKind::Unix, inner.fd),
            SocketKind::InetStream => (StreamKind::Inet, inner.fd),
            _ => return Err(set_last_error(Error::NotSupported)),
        };
        drop(inner);

        // Safety: accept with a big-enough sockaddr_storage out-param
        unsafe {
            let mut addr: libc::sockaddr_storage = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let cfd = libc::accept(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len);
            if cfd < 0 {
                let e = std::io::Error::last_os_error();
                return Err(set_last_error(match e.raw_os_error() {
                    Some(libc::EAGAIN) => Error::Again,
                    Some(libc::ECONNABORTED) => Error::ConnAborted,
                    _ => Error::IoFailure,
                }));
            }
            apply_fd_flags(cfd, flags)?;

            let (peer_addr, peer_port) = peer_of(&addr);
            Ok(Stream::from_accepted(cfd, kind, peer_addr, peer_port))
        }
    }

    /// Accept one client and stack a protocol layer on it, using this
    /// listener's TLS material for websocket workers when present.
    pub fn accept_with_protocol(
        &self,
        flags: SocketFlags,
        protocol: &str,
        prot_opts: Option<&Variant>,
    ) -> Result<Variant, Error> {
        use crate::message::{MessageChannel, MessageEntity, MessageOptions};
        use crate::websocket::{WsChannel, WsEntity, WsRole};

        let stream = self.accept(flags)?;
        let opts = match prot_opts {
            Some(o) => MessageOptions::from_variant(o)?,
            None => MessageOptions::default(),
        };
        match protocol {
            "message" | "hbdbus" => {
                let chan = MessageChannel::attach(&stream, opts)?;
                Ok(MessageEntity::to_variant(chan))
            }
            "websocket" => {
                let tls = match self.tls_config() {
                    Some(config) => Some(Box::new(crate::tls::TlsTransport::server(
                        stream.fd(),
                        config,
                    )?) as Box<dyn crate::io::Transport>),
                    None => None,
                };
                let chan = WsChannel::attach(&stream, WsRole::ServerWorker, opts, tls, None)?;
                Ok(WsEntity::to_variant(chan))
            }
            _ => Err(set_last_error(Error::NotSupported)),
        }
    }

    /// Send a datagram to `target_url`.
    pub fn sendto(
        &self,
        target_url: &str,
        dontwait: bool,
        confirm: bool,
        bytes: &[u8],
    ) -> Result<usize, Error> {
        let inner = self.inner.borrow();
        if inner.closed {
            return Err(set_last_error(Error::EntityGone));
        }
        let url = Url::parse(target_url).map_err(|_| set_last_error(Error::InvalidValue))?;

        let mut flags = 0;
        if dontwait {
            flags |= libc::MSG_DONTWAIT;
        }
        // MSG_CONFIRM is accepted everywhere but only Linux honours it
        #[cfg(target_os = "linux")]
        if confirm {
            flags |= libc::MSG_CONFIRM;
        }
        #[cfg(not(target_os = "linux"))]
        let _ = confirm;

        let sent = match inner.kind {
            SocketKind::LocalDgram => {
                let cp = CString::new(url.path())
                    .map_err(|_| set_last_error(Error::InvalidValue))?;
                // Safety: sendto with a stack sockaddr_un
                unsafe {
                    let mut addr: libc::sockaddr_un = std::mem::zeroed();
                    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
                    let pb = cp.as_bytes_with_nul();
                    if pb.len() > addr.sun_path.len() {
                        return Err(set_last_error(Error::TooLong));
                    }
                    for (i, &b) in pb.iter().enumerate() {
                        addr.sun_path[i] = b as libc::c_char;
                    }
                    let alen = std::mem::size_of::<libc::sa_family_t>() + pb.len();
                    libc::sendto(
                        inner.fd,
                        bytes.as_ptr().cast(),
                        bytes.len(),
                        flags,
                        &addr as *const _ as *const libc::sockaddr,
                        alen as libc::socklen_t,
                    )
                }
            }
            SocketKind::InetDgram => {
                use std::net::ToSocketAddrs;
                let host = url
                    .host_str()
                    .ok_or_else(|| set_last_error(Error::InvalidValue))?;
                let port = url
                    .port()
                    .ok_or_else(|| set_last_error(Error::InvalidValue))?;
                let addr = (host, port)
                    .to_socket_addrs()
                    .map_err(|_| set_last_error(Error::NotFound))?
                    .next()
                    .ok_or_else(|| set_last_error(Error::NotFound))?;
                match addr {
                    std::net::SocketAddr::V4(a) => {
                        // Safety: sendto with a stack sockaddr_in
                        unsafe {
                            let mut sin: libc::sockaddr_in = std::mem::zeroed();
                            sin.sin_family = libc::AF_INET as libc::sa_family_t;
                            sin.sin_port = a.port().to_be();
                            sin.sin_addr.s_addr =
                                u32::from_ne_bytes(a.ip().octets());
                            libc::sendto(
                                inner.fd,
                                bytes.as_ptr().cast(),
                                bytes.len(),
                                flags,
                                &sin as *const _ as *const libc::sockaddr,
                                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                            )
                        }
                    }
                    std::net::SocketAddr::V6(a) => {
                        // Safety: sendto with a stack sockaddr_in6
                        unsafe {
                            let mut sin6: libc::sockaddr_in6 = std::mem::zeroed();
                            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                            sin6.sin6_port = a.port().to_be();
                            sin6.sin6_addr.s6_addr = a.ip().octets();
                            libc::sendto(
                                inner.fd,
                                bytes.as_ptr().cast(),
                                bytes.len(),
                                flags,
                                &sin6 as *const _ as *const libc::sockaddr,
                                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                            )
                        }
                    }
                }
            }
            _ => return Err(set_last_error(Error::NotSupported)),
        };

        if sent < 0 {
            let e = std::io::Error::last_os_error();
            return Err(set_last_error(match e.raw_os_error() {
                Some(libc::EAGAIN) => Error::Again,
                Some(libc::ECONNREFUSED) => Error::ConnRefused,
                _ => Error::IoFailure,
            }));
        }
        Ok(sent as usize)
    }

    /// Receive one datagram of at most `size` bytes.
    pub fn recvfrom(
        &self,
        dontwait: bool,
        trunc: bool,
        size: usize,
    ) -> Result<(Vec<u8>, Option<String>, Option<u16>), Error> {
        let inner = self.inner.borrow();
        if inner.closed {
            return Err(set_last_error(Error::EntityGone));
        }
        if !matches!(inner.kind, SocketKind::LocalDgram | SocketKind::InetDgram) {
            return Err(set_last_error(Error::NotSupported));
        }

        let mut flags = 0;
        if dontwait {
            flags |= libc::MSG_DONTWAIT;
        }
        if trunc {
            flags |= libc::MSG_TRUNC;
        }

        let mut buf = vec![0u8; size.max(1)];
        // Safety: recvfrom with a sockaddr_storage out-param
        unsafe {
            let mut addr: libc::sockaddr_storage = std::mem::zeroed();
            let mut alen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = libc::recvfrom(
                inner.fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                flags,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut alen,
            );
            if n < 0 {
                let e = std::io::Error::last_os_error();
                return Err(set_last_error(match e.raw_os_error() {
                    Some(libc::EAGAIN) => Error::Again,
                    _ => Error::IoFailure,
                }));
            }
            buf.truncate((n as usize).min(buf.len()));
            let (source_addr, source_port) = peer_of(&addr);
            Ok((buf, source_addr, source_port))
        }
    }

    /// Watch for inbound connections or datagrams, posting
    /// `socket:connAttempt` / `socket:newDatagram` to `target`.
    pub fn observe(self: &Rc<Self>, target: Atom) -> Result<(), Error> {
        let event_name = match self.inner.borrow().kind {
            SocketKind::LocalStream | SocketKind::InetStream => EVENT_CONN_ATTEMPT,
            _ => EVENT_NEW_DATAGRAM,
        };
        self.inner.borrow_mut().target = Some(target);

        let rl = RunLoop::current();
        let weak = Rc::downgrade(self);
        let fd = self.fd();
        let id = rl.install_monitor(
            fd,
            IoEvents::from(IoEvent::In) | IoEvent::Hup | IoEvent::Err,
            Rc::new(move |_, got| {
                let Some(sock) = weak.upgrade() else {
                    return false;
                };
                let Some(target) = sock.inner.borrow().target else {
                    return false;
                };
                if got.intersects(IoEvents::from(IoEvent::Hup) | IoEvent::Err) {
                    return false;
                }
                let _ = event::post_event(target, "socket", "socket", Some(event_name), None);
                true
            }),
        )?;
        self.inner.borrow_mut().monitor = Some(id);
        Ok(())
    }

    pub fn close(&self) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        if let Some(id) = inner.monitor.take() {
            RunLoop::current().remove_monitor(id);
        }
        // Safety: closing our descriptor; stale local socket files are
        // removed
        unsafe {
            if inner.fd >= 0 {
                libc::close(inner.fd);
            }
            if let Some(path) = &inner.local_path {
                if let Ok(cp) = CString::new(path.as_str()) {
                    libc::unlink(cp.as_ptr());
                }
            }
        }
        inner.fd = -1;
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn peer_of(addr: &libc::sockaddr_storage) -> (Option<String>, Option<u16>) {
    match addr.ss_family as i32 {
        libc::AF_INET => {
            // Safety: the family tag says this is a sockaddr_in
            let sin = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            (Some(ip.to_string()), Some(u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            // Safety: the family tag says this is a sockaddr_in6
            let sin6 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            (Some(ip.to_string()), Some(u16::from_be(sin6.sin6_port)))
        }
        libc::AF_UNIX => {
            // Safety: the family tag says this is a sockaddr_un
            let sun = unsafe { &*(addr as *const _ as *const libc::sockaddr_un) };
            let path: Vec<u8> = sun
                .sun_path
                .iter()
                .take_while(|&&c| c != 0)
                .map(|&c| c as u8)
                .collect();
            let s = String::from_utf8_lossy(&path).into_owned();
            (if s.is_empty() { None } else { Some(s) }, None)
        }
        _ => (None, None),
    }
}

// ---------------------------------------------------------------------------
// native entity facade

pub struct SocketEntity {
    socket: Rc<Socket>,
}

impl SocketEntity {
    pub fn to_variant(socket: Rc<Socket>) -> Variant {
        Variant::native("socket", Rc::new(SocketEntity { socket }))
    }
}

impl NativeOps for SocketEntity {
    fn property_getter(&self, name: &str) -> Option<NativeMethod> {
        let socket = self.socket.clone();
        let method: NativeMethod = match name {
            "accept" => Rc::new(move |args, silently| {
                let flags = match args.first().and_then(|v| v.as_str()) {
                    Some(tokens) => SocketFlags::parse(tokens)?,
                    None => SocketFlags::parse("default")?,
                };
                let result = match args.get(1).and_then(|v| v.as_str()) {
                    Some(protocol) => {
                        socket.accept_with_protocol(flags, protocol, args.get(2))
                    }
                    None => socket
                        .accept(flags)
                        .map(crate::stream::StreamEntity::to_variant),
                };
                match result {
                    Ok(entity) => Ok(entity),
                    Err(Error::Again) => Ok(Variant::null()),
                    Err(_) if silently => Ok(Variant::undefined()),
                    Err(e) => Err(e),
                }
            }),
            "sendto" => Rc::new(move |args, silently| {
                let url = args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| set_last_error(Error::ArgumentMissed))?;
                let mut dontwait = false;
                let mut confirm = false;
                if let Some(tokens) = args.get(1).and_then(|v| v.as_str()) {
                    for tok in tokens.split_whitespace() {
                        match tok {
                            "dontwait" => dontwait = true,
                            "confirm" => confirm = true,
                            "none" | "default" => {}
                            _ => return Err(set_last_error(Error::InvalidValue)),
                        }
                    }
                }
                let bytes = args
                    .get(2)
                    .and_then(|v| v.as_bytes().map(<[u8]>::to_vec).or_else(|| {
                        v.as_str().map(|s| s.as_bytes().to_vec())
                    }))
                    .ok_or_else(|| set_last_error(Error::WrongDataType))?;
                let offset = match args.get(3) {
                    Some(v) => v.cast_to_u64(false)? as usize,
                    None => 0,
                };
                let len = match args.get(4) {
                    Some(v) => v.cast_to_u64(false)? as usize,
                    None => bytes.len().saturating_sub(offset),
                };
                let end = (offset + len).min(bytes.len());
                let slice = bytes.get(offset..end).unwrap_or(&[]);

                let result = Variant::object();
                match socket.sendto(url, dontwait, confirm, slice) {
                    Ok(sent) => {
                        let _ = result.object_set("sent", Variant::ulongint(sent as u64));
                        Ok(result)
                    }
                    Err(e) => {
                        if silently {
                            let _ = result.object_set("sent", Variant::ulongint(0));
                            let _ = result
                                .object_set("errorname", Variant::string(&format!("{e:?}")));
                            Ok(result)
                        } else {
                            Err(e)
                        }
                    }
                }
            }),
            "recvfrom" => Rc::new(move |args, silently| {
                let mut dontwait = false;
                let mut trunc = false;
                if let Some(tokens) = args.first().and_then(|v| v.as_str()) {
                    for tok in tokens.split_whitespace() {
                        match tok {
                            "dontwait" => dontwait = true,
                            "trunc" => trunc = true,
                            "none" | "default" => {}
                            _ => return Err(set_last_error(Error::InvalidValue)),
                        }
                    }
                }
                let size = match args.get(1) {
                    Some(v) => v.cast_to_u64(false)? as usize,
                    None => 4096,
                };
                let result = Variant::object();
                match socket.recvfrom(dontwait, trunc, size) {
                    Ok((bytes, addr, port)) => {
                        let _ = result
                            .object_set("recved", Variant::ulongint(bytes.len() as u64));
                        let _ = result.object_set("bytes", Variant::byte_seq_reuse(bytes));
                        if let Some(a) = addr {
                            let _ = result.object_set("sourceaddr", Variant::string(&a));
                        }
                        if let Some(p) = port {
                            let _ =
                                result.object_set("sourceport", Variant::ulongint(p as u64));
                        }
                        Ok(result)
                    }
                    Err(e) => {
                        if silently {
                            let _ = result.object_set("recved", Variant::ulongint(0));
                            let _ = result
                                .object_set("errorname", Variant::string(&format!("{e:?}")));
                            Ok(result)
                        } else {
                            Err(e)
                        }
                    }
                }
            }),
            "close" => Rc::new(move |_args, _silently| {
                socket.close()?;
                Ok(Variant::boolean(true))
            }),
            "fd" => Rc::new(move |_args, _silently| Ok(Variant::longint(socket.fd() as i64))),
            _ => return None,
        };
        Some(method)
    }

    fn on_observe(&self, event: &str, _sub: &str) -> bool {
        if event != "socket" {
            return false;
        }
        match current_coroutine() {
            Some(target) => self.socket.observe(target).is_ok(),
            None => false,
        }
    }

    fn on_release(&self) {
        let _ = self.socket.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_tokens() {
        let f = SocketFlags::parse("default").unwrap();
        assert!(f.nonblock && f.cloexec && !f.global);

        let f = SocketFlags::parse("global nameless").unwrap();
        assert!(f.global && f.nameless && !f.nonblock);

        let f = SocketFlags::parse("none").unwrap();
        assert_eq!(f, SocketFlags::default());

        assert!(SocketFlags::parse("bogus").is_err());
    }

    #[test]
    fn test_unix_stream_accept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv.sock");
        let url = format!("unix://{}", path.display());

        let server = Socket::stream(&url, SocketFlags::parse("default").unwrap(), 8, None).unwrap();
        // nothing pending yet
        assert_eq!(
            server
                .accept(SocketFlags::parse("default").unwrap())
                .err(),
            Some(Error::Again)
        );

        let client = Stream::open(&url, "").unwrap();
        client.write_bytes(b"hi there").unwrap();

        let worker = loop {
            match server.accept(SocketFlags::parse("default").unwrap()) {
                Ok(w) => break w,
                Err(Error::Again) => std::thread::sleep(std::time::Duration::from_millis(2)),
                Err(e) => panic!("{e}"),
            }
        };

        let mut got = Vec::new();
        for _ in 0..100 {
            match worker.read_bytes(64) {
                Ok(b) => {
                    got.extend(b);
                    if got.len() >= 8 {
                        break;
                    }
                }
                Err(Error::Again) => std::thread::sleep(std::time::Duration::from_millis(2)),
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(got, b"hi there");
    }

    #[test]
    fn test_unix_dgram_send_recv() {
        let dir = tempfile::tempdir().unwrap();
        let rx_path = dir.path().join("rx.sock");
        let rx_url = format!("unix://{}", rx_path.display());

        let rx = Socket::dgram(&rx_url, SocketFlags::parse("default").unwrap()).unwrap();
        let tx_url = format!("unix://{}", dir.path().join("tx.sock").display());
        let tx = Socket::dgram(&tx_url, SocketFlags::parse("default").unwrap()).unwrap();

        tx.sendto(&rx_url, true, false, b"datagram payload").unwrap();

        let (bytes, addr, port) = loop {
            match rx.recvfrom(true, false, 256) {
                Ok(out) => break out,
                Err(Error::Again) => std::thread::sleep(std::time::Duration::from_millis(2)),
                Err(e) => panic!("{e}"),
            }
        };
        assert_eq!(bytes, b"datagram payload");
        assert!(addr.unwrap().ends_with("tx.sock"));
        assert_eq!(port, None);
    }

    #[test]
    fn test_inet_dgram_loopback() {
        let rx = Socket::dgram("inet://127.0.0.1:0", SocketFlags::parse("default").unwrap())
            .unwrap();
        // find the bound port
        // Safety: getsockname into a sockaddr_storage
        let port = unsafe {
            let mut addr: libc::sockaddr_storage = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            libc::getsockname(rx.fd(), &mut addr as *mut _ as *mut libc::sockaddr, &mut len);
            peer_of(&addr).1.unwrap()
        };

        let tx = Socket::dgram("inet://127.0.0.1:0", SocketFlags::parse("default").unwrap())
            .unwrap();
        let target = format!("inet://127.0.0.1:{port}");
        tx.sendto(&target, true, false, b"ping").unwrap();

        let (bytes, addr, sport) = loop {
            match rx.recvfrom(true, false, 64) {
                Ok(out) => break out,
                Err(Error::Again) => std::thread::sleep(std::time::Duration::from_millis(2)),
                Err(e) => panic!("{e}"),
            }
        };
        assert_eq!(bytes, b"ping");
        assert_eq!(addr.unwrap(), "127.0.0.1");
        assert!(sport.unwrap() > 0);
    }

    #[test]
    fn test_dgram_cannot_accept() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("unix://{}", dir.path().join("d.sock").display());
        let s = Socket::dgram(&url, SocketFlags::default()).unwrap();
        assert_eq!(
            s.accept(SocketFlags::default()).err(),
            Some(Error::NotSupported)
        );
    }
}
