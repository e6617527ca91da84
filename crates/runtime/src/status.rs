//! Stream status flags and fatal reasons
//!
//! A stream's condition is a bit-set of transient states plus at most
//! one narrow fatal reason. `Closing` is terminal: once set, the next
//! loop iteration releases the stream's resources.

use enumflags2::{bitflags, BitFlags};
use vellum_core::Error;

#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFlag {
    Reading = 0x0000_1000,
    Sending = 0x0000_2000,
    Closing = 0x0000_4000,
    Throttling = 0x0000_8000,
    Waiting4Payload = 0x0001_0000,
    Waiting4HsRequ = 0x0002_0000,
    Waiting4HsResp = 0x0004_0000,
    TlsAccepting = 0x0010_0000,
    TlsConnecting = 0x0020_0000,
    TlsWantRead = 0x0100_0000,
    TlsWantWrite = 0x0200_0000,
}

pub type StreamFlags = BitFlags<StreamFlag>;

/// The narrow fatal reason accompanying `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// Allocation failure.
    Oom,
    /// I/O failure on the descriptor.
    Io,
    /// Protocol violation in inbound data.
    Msg,
    /// Long time no response.
    Ltnr,
    /// Too long request (handshake overflow).
    Tlr,
    /// TLS failure.
    Tls,
    /// Bad response from the server side.
    Srv,
}

impl FatalReason {
    pub fn to_error(self) -> Error {
        match self {
            FatalReason::Oom => Error::OutOfMemory,
            FatalReason::Io => Error::IoFailure,
            FatalReason::Msg => Error::ProtocolViolation,
            FatalReason::Ltnr => Error::Timeout,
            FatalReason::Tlr => Error::TooLong,
            FatalReason::Tls => Error::TlsFailure,
            FatalReason::Srv => Error::ProtocolViolation,
        }
    }
}

/// Transient flags plus the fatal reason, kept together because every
/// failure path sets both at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct Status {
    pub flags: StreamFlags,
    pub fatal: Option<FatalReason>,
}

impl Status {
    pub fn set(&mut self, flag: StreamFlag) {
        self.flags |= flag;
    }

    pub fn clear(&mut self, flag: StreamFlag) {
        self.flags &= !BitFlags::from(flag);
    }

    pub fn contains(&self, flag: StreamFlag) -> bool {
        self.flags.contains(flag)
    }

    /// Enter a terminal failure state.
    pub fn fail(&mut self, reason: FatalReason) {
        self.fatal = Some(reason);
        self.flags = StreamFlag::Closing.into();
    }

    pub fn is_closing(&self) -> bool {
        self.flags.contains(StreamFlag::Closing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_is_terminal() {
        let mut st = Status::default();
        st.set(StreamFlag::Reading);
        st.set(StreamFlag::Sending);
        st.fail(FatalReason::Io);
        assert!(st.is_closing());
        assert!(!st.contains(StreamFlag::Reading));
        assert_eq!(st.fatal.unwrap().to_error(), Error::IoFailure);
    }

    #[test]
    fn test_set_clear() {
        let mut st = Status::default();
        st.set(StreamFlag::Throttling);
        assert!(st.contains(StreamFlag::Throttling));
        st.clear(StreamFlag::Throttling);
        assert!(!st.contains(StreamFlag::Throttling));
    }
}
