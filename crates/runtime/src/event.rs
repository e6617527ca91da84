//! Inter-instance event delivery
//!
//! Protocol layers post events to a coroutine addressed by an atom. The
//! payload variant is migrated through the move heap so the receiving
//! instance re-owns it; delivery order is FIFO per target.
//!
//! The router is process-global: an instance registers a sink for its
//! coroutine atoms, any instance may post.

use crate::error::{set_last_error, Error};
use may::sync::mpmc;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use vellum_core::{move_in, move_out, Atom, MovedVariant, Variant};

/// One delivered event.
pub struct SessionEvent {
    /// Entity the event originates from, e.g. `"stream"`.
    pub source: String,
    /// Event name, e.g. `"message"` or `"handshake"`.
    pub event: String,
    /// Optional sub-name, e.g. `"readable"`.
    pub sub: Option<String>,
    payload: Option<MovedVariant>,
}

impl SessionEvent {
    /// Re-own the payload into the calling instance's heap.
    pub fn take_payload(&mut self) -> Option<Variant> {
        self.payload.take().map(move_out)
    }
}

thread_local! {
    /// The coroutine the interpreter is currently running on this
    /// instance; entities bind their events to it on observe.
    static CURRENT_COROUTINE: std::cell::Cell<Option<Atom>> =
        const { std::cell::Cell::new(None) };
}

/// Install the ambient coroutine for subsequent observe calls.
pub fn set_current_coroutine(target: Option<Atom>) {
    CURRENT_COROUTINE.with(|c| c.set(target));
}

/// The ambient coroutine, if any.
pub fn current_coroutine() -> Option<Atom> {
    CURRENT_COROUTINE.with(|c| c.get())
}

struct Router {
    sinks: HashMap<Atom, mpmc::Sender<SessionEvent>>,
}

static ROUTER: OnceLock<Mutex<Router>> = OnceLock::new();

fn router() -> &'static Mutex<Router> {
    ROUTER.get_or_init(|| {
        Mutex::new(Router {
            sinks: HashMap::new(),
        })
    })
}

/// The receiving end of a registered sink.
pub type EventReceiver = mpmc::Receiver<SessionEvent>;

/// Register (or replace) the sink for `target`, returning its receiving
/// end.
pub fn register_sink(target: Atom) -> EventReceiver {
    let (tx, rx) = mpmc::channel();
    router().lock().unwrap().sinks.insert(target, tx);
    rx
}

/// Drop the sink for `target`; later posts report `EntityGone`.
pub fn unregister_sink(target: Atom) {
    router().lock().unwrap().sinks.remove(&target);
}

/// Post an event to `target`, migrating `payload` through the move
/// heap.
pub fn post_event(
    target: Atom,
    source: &str,
    event: &str,
    sub: Option<&str>,
    payload: Option<Variant>,
) -> Result<(), Error> {
    let payload = match payload {
        Some(v) => Some(move_in(v).map_err(|_| set_last_error(Error::NotSupported))?),
        None => None,
    };

    let sender = {
        let r = router().lock().unwrap();
        r.sinks.get(&target).cloned()
    };
    let Some(sender) = sender else {
        return Err(set_last_error(Error::EntityGone));
    };

    let ev = SessionEvent {
        source: source.to_string(),
        event: event.to_string(),
        sub: sub.map(str::to_string),
        payload,
    };
    sender
        .send(ev)
        .map_err(|_| set_last_error(Error::EntityGone))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_fifo_per_target() {
        let target = Atom::intern("test:fifo-target");
        let rx = register_sink(target);

        for i in 0..5 {
            post_event(
                target,
                "stream",
                "message",
                None,
                Some(Variant::longint(i)),
            )
            .unwrap();
        }

        for i in 0..5 {
            let mut ev = rx.recv().unwrap();
            assert_eq!(ev.event, "message");
            let payload = ev.take_payload().unwrap();
            assert!(payload.equals(&Variant::longint(i)));
        }
        unregister_sink(target);
    }

    #[test]
    #[serial]
    fn test_cross_thread_delivery() {
        let target = Atom::intern("test:cross-thread");
        let rx = register_sink(target);

        let handle = std::thread::spawn(move || {
            let obj = Variant::object();
            obj.object_set("answer", Variant::longint(42)).unwrap();
            post_event(target, "stream", "message", None, Some(obj)).unwrap();
        });
        handle.join().unwrap();

        let mut ev = rx.recv().unwrap();
        let payload = ev.take_payload().unwrap();
        assert_eq!(
            payload
                .object_get("answer")
                .unwrap()
                .unwrap()
                .cast_to_i64(false)
                .unwrap(),
            42
        );
        unregister_sink(target);
    }

    #[test]
    #[serial]
    fn test_unknown_target() {
        let target = Atom::intern("test:nobody-home");
        unregister_sink(target);
        assert_eq!(
            post_event(target, "stream", "error", None, None),
            Err(Error::EntityGone)
        );
    }
}
