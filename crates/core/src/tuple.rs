//! Fixed-size tuple
//!
//! The member count is fixed at creation; only `set` mutates, firing
//! CHANGE. Unset slots are created as null.

use crate::error::{set_last_error, Error};
use crate::heap;
use crate::observer::{fire_post, fire_pre, ChangeOp, Listener};
use crate::revise::{self, ParentRef, RevChain};
use crate::variant::{Kind, Variant};
use std::cell::RefCell;
use std::rc::Rc;

pub struct TupleData {
    members: Box<[Variant]>,
    listeners: Vec<Rc<Listener>>,
    rev: RevChain,
}

impl TupleData {
    pub(crate) fn listeners_mut(&mut self) -> &mut Vec<Rc<Listener>> {
        &mut self.listeners
    }

    pub(crate) fn rev_chain(&self) -> &RevChain {
        &self.rev
    }

    pub(crate) fn rev_chain_mut(&mut self) -> &mut RevChain {
        &mut self.rev
    }

    pub(crate) fn members_cloned(&self) -> Vec<Variant> {
        self.members.to_vec()
    }
}

impl Drop for TupleData {
    fn drop(&mut self) {
        heap::account_free(Kind::Tuple, 0);
    }
}

pub(crate) fn make_plain(members: Vec<Variant>) -> Variant {
    heap::account_alloc(Kind::Tuple, 0);
    Variant::Tuple(Rc::new(RefCell::new(TupleData {
        members: members.into_boxed_slice(),
        listeners: Vec::new(),
        rev: RevChain::default(),
    })))
}

pub(crate) fn clone_tuple(data: &TupleData, recursively: bool) -> Result<Variant, Error> {
    let mut out = Vec::with_capacity(data.members.len());
    for v in data.members.iter() {
        out.push(if recursively {
            v.clone_container(true)?
        } else {
            v.clone()
        });
    }
    let tup = make_plain(out);
    revise::bind_children(&tup);
    Ok(tup)
}

impl Variant {
    /// A tuple of `size` null members.
    pub fn tuple(size: usize) -> Variant {
        make_plain(vec![Variant::Null; size])
    }

    /// A tuple initialized from `members`.
    pub fn tuple_from(members: impl IntoIterator<Item = Variant>) -> Variant {
        let tup = make_plain(members.into_iter().collect());
        revise::bind_children(&tup);
        tup
    }

    fn tuple_cell(&self) -> Result<&Rc<RefCell<TupleData>>, Error> {
        match self {
            Variant::Tuple(c) => Ok(c),
            _ => Err(set_last_error(Error::WrongDataType)),
        }
    }

    pub fn tuple_size(&self) -> Result<usize, Error> {
        Ok(self.tuple_cell()?.borrow().members.len())
    }

    pub fn tuple_get(&self, idx: usize) -> Result<Variant, Error> {
        self.tuple_cell()?
            .borrow()
            .members
            .get(idx)
            .cloned()
            .ok_or_else(|| set_last_error(Error::OutOfRange))
    }

    pub fn tuple_members(&self) -> Result<Vec<Variant>, Error> {
        Ok(self.tuple_cell()?.borrow().members_cloned())
    }

    /// Replace the member at `idx`; fires CHANGE.
    pub fn tuple_set(&self, idx: usize, val: Variant) -> Result<(), Error> {
        let cell = self.tuple_cell()?.clone();
        let old = cell
            .borrow()
            .members
            .get(idx)
            .cloned()
            .ok_or_else(|| set_last_error(Error::OutOfRange))?;

        if revise::needs_check(self) {
            let mut members = cell.borrow().members_cloned();
            members[idx] = val.clone();
            let trial = make_plain(members);
            revise::check_constraint(self, &trial)?;
        }

        let args = vec![Variant::ulongint(idx as u64), old.clone(), val.clone()];
        if !fire_pre(self, ChangeOp::Change, &args) {
            return Err(set_last_error(Error::NotSupported));
        }

        let parent_id = Rc::as_ptr(&cell) as usize;
        revise::unbind(&old, parent_id, None);
        cell.borrow_mut().members[idx] = val.clone();
        revise::bind(&val, ParentRef::Tuple(Rc::downgrade(&cell)), None);

        if revise::needs_check(self) {
            revise::adjust_after(self);
        }
        fire_post(self, ChangeOp::Change, &args);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_size() {
        let t = Variant::tuple(3);
        assert_eq!(t.tuple_size().unwrap(), 3);
        assert!(t.tuple_get(0).unwrap().equals(&Variant::null()));
        assert!(t.tuple_get(3).is_err());
        assert!(t.tuple_set(3, Variant::longint(1)).is_err());
    }

    #[test]
    fn test_set_get() {
        let t = Variant::tuple_from([Variant::longint(1), Variant::string("two")]);
        t.tuple_set(0, Variant::longint(10)).unwrap();
        assert_eq!(t.tuple_get(0).unwrap().cast_to_i64(false).unwrap(), 10);
        assert_eq!(t.tuple_get(1).unwrap().as_str().unwrap(), "two");
    }
}
