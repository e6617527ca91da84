//! Observer bus for container mutations
//!
//! Every container exposes two notification points per operation: *pre*
//! handlers run before any state changes and may veto the mutation by
//! returning `false`; *post* handlers run after the new state is
//! installed. Operation kinds are `Grow`, `Shrink`, and `Change`.
//!
//! Handlers receive the container and an operation-specific argument
//! slice: position or key first, then the outgoing value, then the
//! incoming one (where each applies). Handlers must not reenter the
//! observed container's mutation API; the runtime is single-threaded per
//! instance, so reentry would see the container mid-mutation.

use crate::error::{set_last_error, Error};
use crate::variant::Variant;
use std::cell::Cell;
use std::rc::Rc;

/// The three observable operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Grow,
    Shrink,
    Change,
}

impl ChangeOp {
    fn mask(self) -> u8 {
        match self {
            ChangeOp::Grow => 0x1,
            ChangeOp::Shrink => 0x2,
            ChangeOp::Change => 0x4,
        }
    }
}

pub type PreHandler = Box<dyn Fn(&Variant, ChangeOp, &[Variant]) -> bool>;
pub type PostHandler = Box<dyn Fn(&Variant, ChangeOp, &[Variant])>;

pub(crate) enum Handler {
    Pre(PreHandler),
    Post(PostHandler),
}

pub(crate) struct Listener {
    id: u64,
    ops: u8,
    handler: Handler,
}

/// Returned from registration; pass back to `revoke_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle {
    id: u64,
}

thread_local! {
    static NEXT_LISTENER_ID: Cell<u64> = const { Cell::new(1) };
}

fn next_id() -> u64 {
    NEXT_LISTENER_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        id
    })
}

fn ops_mask(ops: &[ChangeOp]) -> u8 {
    ops.iter().fold(0, |m, op| m | op.mask())
}

fn with_listeners<R>(
    v: &Variant,
    f: impl FnOnce(&mut Vec<Rc<Listener>>) -> R,
) -> Result<R, Error> {
    match v {
        Variant::Object(d) => Ok(f(d.borrow_mut().listeners_mut())),
        Variant::Array(d) => Ok(f(d.borrow_mut().listeners_mut())),
        Variant::Set(d) => Ok(f(d.borrow_mut().listeners_mut())),
        Variant::Tuple(d) => Ok(f(d.borrow_mut().listeners_mut())),
        Variant::SortedArray(d) => Ok(f(d.borrow_mut().listeners_mut())),
        _ => Err(set_last_error(Error::WrongDataType)),
    }
}

/// Subscribe a vetoing pre-handler to `ops` on container `v`.
pub fn register_pre_listener(
    v: &Variant,
    ops: &[ChangeOp],
    handler: PreHandler,
) -> Result<ListenerHandle, Error> {
    let id = next_id();
    with_listeners(v, |ls| {
        ls.push(Rc::new(Listener {
            id,
            ops: ops_mask(ops),
            handler: Handler::Pre(handler),
        }));
    })?;
    Ok(ListenerHandle { id })
}

/// Subscribe an informational post-handler to `ops` on container `v`.
pub fn register_post_listener(
    v: &Variant,
    ops: &[ChangeOp],
    handler: PostHandler,
) -> Result<ListenerHandle, Error> {
    let id = next_id();
    with_listeners(v, |ls| {
        ls.push(Rc::new(Listener {
            id,
            ops: ops_mask(ops),
            handler: Handler::Post(handler),
        }));
    })?;
    Ok(ListenerHandle { id })
}

/// Drop a previously registered listener. Returns false if it is not
/// subscribed (anymore).
pub fn revoke_listener(v: &Variant, handle: ListenerHandle) -> bool {
    with_listeners(v, |ls| {
        let before = ls.len();
        ls.retain(|l| l.id != handle.id);
        ls.len() != before
    })
    .unwrap_or(false)
}

fn matching(v: &Variant, op: ChangeOp, pre: bool) -> Vec<Rc<Listener>> {
    with_listeners(v, |ls| {
        ls.iter()
            .filter(|l| l.ops & op.mask() != 0)
            .filter(|l| matches!(l.handler, Handler::Pre(_)) == pre)
            .cloned()
            .collect()
    })
    .unwrap_or_default()
}

/// Run pre-handlers; false means some handler vetoed the mutation. The
/// handler list is cloned out first so handlers run without any borrow
/// of the container held.
pub(crate) fn fire_pre(container: &Variant, op: ChangeOp, args: &[Variant]) -> bool {
    for l in matching(container, op, true) {
        if let Handler::Pre(f) = &l.handler {
            if !f(container, op, args) {
                return false;
            }
        }
    }
    true
}

/// Run post-handlers after the new state is installed.
pub(crate) fn fire_post(container: &Variant, op: ChangeOp, args: &[Variant]) {
    for l in matching(container, op, false) {
        if let Handler::Post(f) = &l.handler {
            f(container, op, args);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_on_scalar_fails() {
        let v = Variant::number(1.0);
        assert!(register_post_listener(&v, &[ChangeOp::Grow], Box::new(|_, _, _| {})).is_err());
    }

    #[test]
    fn test_revoke_unknown() {
        let obj = Variant::object();
        let h = register_post_listener(&obj, &[ChangeOp::Grow], Box::new(|_, _, _| {})).unwrap();
        assert!(revoke_listener(&obj, h));
        assert!(!revoke_listener(&obj, h));
    }
}
