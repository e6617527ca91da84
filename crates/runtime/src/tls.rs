//! TLS wrapping
//!
//! Routes a protocol layer's I/O through a rustls session. The TLS
//! handshake is an additional pre-application phase: while it is in
//! flight the transport reports `want_read`/`want_write` hints so the
//! owner can arm the right monitors; reads and writes during that phase
//! simply return would-block and pump the handshake instead.
//!
//! Server workers may attach to a shared session cache identified by a
//! short id. The cache is a POSIX shared-memory segment whose mode bits
//! derive from the `{group, other}` access flags ORed with `0600`.

use crate::error::{set_last_error, Error};
use crate::io::{IoOutcome, Transport};
use rustls::{ClientConnection, Connection, ServerConnection};
use std::ffi::CString;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Longest accepted session-cache id.
pub const TLS_SESSION_CACHE_ID_LEN: usize = 32;

/// Smallest accepted session-cache entry count.
pub const TLS_SESSION_CACHE_SIZE_MIN: u64 = 16;

const CACHE_KEY_MAX: usize = 64;
const CACHE_VAL_MAX: usize = 2048;

/// Raw-fd adapter rustls pumps ciphertext through.
struct FdIo {
    fd: RawFd,
}

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // Safety: buf is a valid writable region
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // Safety: buf is a valid readable region
        let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Transport running over a rustls session.
pub struct TlsTransport {
    conn: Connection,
    io: FdIo,
    broken: bool,
}

impl TlsTransport {
    pub fn client(
        fd: RawFd,
        server_name: &str,
        config: Arc<rustls::ClientConfig>,
    ) -> Result<TlsTransport, Error> {
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|_| set_last_error(Error::InvalidValue))?;
        let conn = ClientConnection::new(config, name)
            .map_err(|_| set_last_error(Error::TlsFailure))?;
        Ok(TlsTransport {
            conn: Connection::Client(conn),
            io: FdIo { fd },
            broken: false,
        })
    }

    pub fn server(fd: RawFd, config: Arc<rustls::ServerConfig>) -> Result<TlsTransport, Error> {
        let conn =
            ServerConnection::new(config).map_err(|_| set_last_error(Error::TlsFailure))?;
        Ok(TlsTransport {
            conn: Connection::Server(conn),
            io: FdIo { fd },
            broken: false,
        })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub fn want_read(&self) -> bool {
        self.conn.wants_read()
    }

    pub fn want_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Move ciphertext in both directions as far as the socket allows.
    fn pump(&mut self) -> Result<(), ()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.io) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return Err(()),
            }
        }
        if self.conn.wants_read() {
            match self.conn.read_tls(&mut self.io) {
                Ok(_) => {
                    if self.conn.process_new_packets().is_err() {
                        return Err(());
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return Err(()),
            }
        }
        Ok(())
    }
}

impl Transport for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> IoOutcome {
        if self.broken {
            return IoOutcome::Failed;
        }
        if self.pump().is_err() {
            self.broken = true;
            return IoOutcome::Failed;
        }
        if self.conn.is_handshaking() {
            return IoOutcome::WouldBlock;
        }
        match self.conn.reader().read(buf) {
            Ok(0) => IoOutcome::Closed,
            Ok(n) => IoOutcome::Bytes(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => IoOutcome::WouldBlock,
            Err(_) => {
                self.broken = true;
                IoOutcome::Failed
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> IoOutcome {
        if self.broken {
            return IoOutcome::Failed;
        }
        // plaintext is buffered by rustls even mid-handshake, then
        // flushed by the pump as the session allows
        let n = match self.conn.writer().write(buf) {
            Ok(n) => n,
            Err(_) => {
                self.broken = true;
                return IoOutcome::Failed;
            }
        };
        if self.pump().is_err() {
            self.broken = true;
            return IoOutcome::Failed;
        }
        IoOutcome::Bytes(n)
    }

}

/// Load certificates and a private key into a server config, optionally
/// wiring the shared session cache.
pub fn server_config(
    cert_path: &str,
    key_path: &str,
    session_cache: Option<Arc<ShmSessionCache>>,
) -> Result<Arc<rustls::ServerConfig>, Error> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert_path).map_err(|_| set_last_error(Error::NotFound))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .map_err(|_| set_last_error(Error::TlsFailure))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_path).map_err(|_| set_last_error(Error::NotFound))?,
    ))
    .map_err(|_| set_last_error(Error::TlsFailure))?
    .ok_or_else(|| set_last_error(Error::TlsFailure))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|_| set_last_error(Error::TlsFailure))?;
    if let Some(cache) = session_cache {
        config.session_storage = cache;
    }
    Ok(Arc::new(config))
}

/// Client config trusting the platform roots.
pub fn client_config() -> Arc<rustls::ClientConfig> {
    let roots = rustls::RootCertStore::empty();
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

// ---------------------------------------------------------------------------
// shared session cache

/// Access bits for the shared cache segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUsers {
    pub group: bool,
    pub other: bool,
}

impl CacheUsers {
    /// Owner always keeps read/write; group/other add their read/write
    /// bits.
    pub fn mode(self) -> libc::mode_t {
        let mut mode: libc::mode_t = 0o600;
        if self.group {
            mode |= 0o060;
        }
        if self.other {
            mode |= 0o006;
        }
        mode
    }
}

#[repr(C)]
struct CacheSlot {
    used: u8,
    key_len: u8,
    val_len: u16,
    key: [u8; CACHE_KEY_MAX],
    val: [u8; CACHE_VAL_MAX],
}

#[repr(C)]
struct CacheHeader {
    magic: u32,
    nr_slots: u32,
    lock: std::sync::atomic::AtomicU32,
}

const CACHE_MAGIC: u32 = 0x5653_4331; // "VSC1"

/// A session cache backed by a named POSIX shared-memory segment, so
/// worker processes sharing the id also share resumable sessions.
#[derive(Debug)]
pub struct ShmSessionCache {
    base: *mut u8,
    len: usize,
    name: String,
}

// Safety: every access to the mapped region goes through `with_lock`,
// which serializes via the atomic spinlock stored in the segment header;
// the pointer itself is stable for the lifetime of the mapping.
unsafe impl Send for ShmSessionCache {}
unsafe impl Sync for ShmSessionCache {}

impl ShmSessionCache {
    /// Open or create the segment `/<id>` with `nr_slots` entries.
    pub fn open(id: &str, users: CacheUsers, nr_slots: u64) -> Result<Arc<ShmSessionCache>, Error> {
        if id.is_empty() || id.len() > TLS_SESSION_CACHE_ID_LEN {
            return Err(set_last_error(Error::InvalidValue));
        }
        let nr_slots = nr_slots.max(TLS_SESSION_CACHE_SIZE_MIN) as usize;
        let len = std::mem::size_of::<CacheHeader>()
            + nr_slots * std::mem::size_of::<CacheSlot>();

        let cname = CString::new(format!("/{id}"))
            .map_err(|_| set_last_error(Error::InvalidValue))?;

        // Safety: shm_open/ftruncate/mmap with checked results
        unsafe {
            let fd = libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                users.mode() as libc::c_uint,
            );
            if fd < 0 {
                return Err(set_last_error(Error::AccessDenied));
            }
            if libc::ftruncate(fd, len as libc::off_t) != 0 {
                libc::close(fd);
                return Err(set_last_error(Error::IoFailure));
            }
            let base = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if base == libc::MAP_FAILED {
                return Err(set_last_error(Error::OutOfMemory));
            }

            let cache = ShmSessionCache {
                base: base.cast(),
                len,
                name: id.to_string(),
            };
            let header = &mut *cache.header();
            if header.magic != CACHE_MAGIC {
                header.magic = CACHE_MAGIC;
                header.nr_slots = nr_slots as u32;
                header
                    .lock
                    .store(0, std::sync::atomic::Ordering::Release);
                std::ptr::write_bytes(
                    cache.slots_ptr(),
                    0,
                    nr_slots * std::mem::size_of::<CacheSlot>(),
                );
            }
            Ok(Arc::new(cache))
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn header(&self) -> *mut CacheHeader {
        self.base.cast()
    }

    fn slots_ptr(&self) -> *mut u8 {
        // Safety: within the mapping by construction
        unsafe { self.base.add(std::mem::size_of::<CacheHeader>()) }
    }

    fn with_lock<R>(&self, f: impl FnOnce(&mut [CacheSlot]) -> R) -> R {
        use std::sync::atomic::Ordering;
        // Safety: header/slots lie inside the mapping; the spinlock in
        // shared memory serializes across processes
        unsafe {
            let header = &*self.header();
            while header
                .lock
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                std::hint::spin_loop();
            }
            let slots = std::slice::from_raw_parts_mut(
                self.slots_ptr().cast::<CacheSlot>(),
                header.nr_slots as usize,
            );
            let out = f(slots);
            header.lock.store(0, Ordering::Release);
            out
        }
    }

    fn slot_index(key: &[u8], nr: usize) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for &b in key {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % nr as u64) as usize
    }
}

impl Drop for ShmSessionCache {
    fn drop(&mut self) {
        // Safety: unmapping the region we mapped
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}

impl rustls::server::StoresServerSessions for ShmSessionCache {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        if key.len() > CACHE_KEY_MAX || value.len() > CACHE_VAL_MAX {
            return false;
        }
        self.with_lock(|slots| {
            let idx = Self::slot_index(&key, slots.len());
            let slot = &mut slots[idx];
            slot.used = 1;
            slot.key_len = key.len() as u8;
            slot.val_len = value.len() as u16;
            slot.key[..key.len()].copy_from_slice(&key);
            slot.val[..value.len()].copy_from_slice(&value);
            true
        })
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if key.len() > CACHE_KEY_MAX {
            return None;
        }
        self.with_lock(|slots| {
            let idx = Self::slot_index(key, slots.len());
            let slot = &slots[idx];
            if slot.used == 1 && &slot.key[..slot.key_len as usize] == key {
                Some(slot.val[..slot.val_len as usize].to_vec())
            } else {
                None
            }
        })
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        if key.len() > CACHE_KEY_MAX {
            return None;
        }
        self.with_lock(|slots| {
            let idx = Self::slot_index(key, slots.len());
            let slot = &mut slots[idx];
            if slot.used == 1 && &slot.key[..slot.key_len as usize] == key {
                slot.used = 0;
                Some(slot.val[..slot.val_len as usize].to_vec())
            } else {
                None
            }
        })
    }

    fn can_cache(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::server::StoresServerSessions;
    use serial_test::serial;

    #[test]
    fn test_cache_mode_bits() {
        assert_eq!(CacheUsers::default().mode(), 0o600);
        assert_eq!(
            CacheUsers {
                group: true,
                other: false
            }
            .mode(),
            0o660
        );
        assert_eq!(
            CacheUsers {
                group: true,
                other: true
            }
            .mode(),
            0o666
        );
    }

    #[test]
    #[serial]
    fn test_shm_cache_put_get_take() {
        let id = format!("vellum-test-{}", std::process::id());
        let cache = ShmSessionCache::open(
            &id,
            CacheUsers::default(),
            0, // raised to the floor
        )
        .unwrap();

        let key = b"session-key-1".to_vec();
        let val = b"ticket-bytes".to_vec();
        assert!(cache.put(key.clone(), val.clone()));
        assert_eq!(cache.get(&key), Some(val.clone()));
        assert_eq!(cache.take(&key), Some(val));
        assert_eq!(cache.get(&key), None);

        // a second handle on the same id sees the same storage
        assert!(cache.put(b"shared".to_vec(), b"value".to_vec()));
        let cache2 = ShmSessionCache::open(&id, CacheUsers::default(), 0).unwrap();
        assert_eq!(cache2.get(b"shared"), Some(b"value".to_vec()));

        // Safety: removing the test segment
        unsafe {
            let cname = CString::new(format!("/{id}")).unwrap();
            libc::shm_unlink(cname.as_ptr());
        }
    }

    #[test]
    fn test_cache_id_limits() {
        assert!(ShmSessionCache::open("", CacheUsers::default(), 16).is_err());
        let long = "x".repeat(TLS_SESSION_CACHE_ID_LEN + 1);
        assert!(ShmSessionCache::open(&long, CacheUsers::default(), 16).is_err());
    }

    #[test]
    fn test_oversized_entries_rejected() {
        let id = format!("vellum-big-{}", std::process::id());
        let cache = ShmSessionCache::open(&id, CacheUsers::default(), 16).unwrap();
        assert!(!cache.put(vec![0u8; CACHE_KEY_MAX + 1], vec![]));
        assert!(!cache.put(b"k".to_vec(), vec![0u8; CACHE_VAL_MAX + 1]));
        unsafe {
            let cname = CString::new(format!("/{id}")).unwrap();
            libc::shm_unlink(cname.as_ptr());
        }
    }
}
