//! Ordered sequence
//!
//! Zero-based random access with positional insertion. `insert_before`
//! accepts indices in `[0, len]`, `insert_after` in `[-1, len-1]`;
//! `append`/`prepend` are the boundary cases. `set` on an existing index
//! fires CHANGE, insertions fire GROW, removals SHRINK. Sorting permutes
//! in place and fires no events.

use crate::error::{set_last_error, Error};
use crate::heap;
use crate::observer::{fire_post, fire_pre, ChangeOp, Listener};
use crate::revise::{self, ParentRef, RevChain};
use crate::variant::{Kind, Variant};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

pub struct ArrData {
    elems: Vec<Variant>,
    listeners: Vec<Rc<Listener>>,
    rev: RevChain,
}

impl ArrData {
    fn new() -> ArrData {
        heap::account_alloc(Kind::Array, 0);
        ArrData {
            elems: Vec::new(),
            listeners: Vec::new(),
            rev: RevChain::default(),
        }
    }

    pub(crate) fn listeners_mut(&mut self) -> &mut Vec<Rc<Listener>> {
        &mut self.listeners
    }

    pub(crate) fn rev_chain(&self) -> &RevChain {
        &self.rev
    }

    pub(crate) fn rev_chain_mut(&mut self) -> &mut RevChain {
        &mut self.rev
    }

    pub(crate) fn elements_cloned(&self) -> Vec<Variant> {
        self.elems.clone()
    }
}

impl Drop for ArrData {
    fn drop(&mut self) {
        heap::account_free(Kind::Array, 0);
    }
}

/// Build an array without observers or edge maintenance.
pub(crate) fn make_plain(elems: Vec<Variant>) -> Variant {
    let mut data = ArrData::new();
    data.elems = elems;
    Variant::Array(Rc::new(RefCell::new(data)))
}

pub(crate) fn clone_arr(data: &ArrData, recursively: bool) -> Result<Variant, Error> {
    let mut out = Vec::with_capacity(data.elems.len());
    for v in &data.elems {
        out.push(if recursively {
            v.clone_container(true)?
        } else {
            v.clone()
        });
    }
    let arr = make_plain(out);
    revise::bind_children(&arr);
    Ok(arr)
}

impl Variant {
    /// A fresh empty array.
    pub fn array() -> Variant {
        make_plain(Vec::new())
    }

    /// Build an array from elements, in order.
    pub fn array_from(elems: impl IntoIterator<Item = Variant>) -> Variant {
        let arr = make_plain(elems.into_iter().collect());
        revise::bind_children(&arr);
        arr
    }

    fn arr_cell(&self) -> Result<&Rc<RefCell<ArrData>>, Error> {
        match self {
            Variant::Array(c) => Ok(c),
            _ => Err(set_last_error(Error::WrongDataType)),
        }
    }

    pub fn array_size(&self) -> Result<usize, Error> {
        Ok(self.arr_cell()?.borrow().elems.len())
    }

    pub fn array_get(&self, idx: usize) -> Result<Variant, Error> {
        self.arr_cell()?
            .borrow()
            .elems
            .get(idx)
            .cloned()
            .ok_or_else(|| set_last_error(Error::OutOfRange))
    }

    pub fn array_elements(&self) -> Result<Vec<Variant>, Error> {
        Ok(self.arr_cell()?.borrow().elements_cloned())
    }

    /// Replace the element at an existing index; fires CHANGE.
    pub fn array_set(&self, idx: usize, val: Variant) -> Result<(), Error> {
        let cell = self.arr_cell()?.clone();
        let old = cell
            .borrow()
            .elems
            .get(idx)
            .cloned()
            .ok_or_else(|| set_last_error(Error::OutOfRange))?;

        if revise::needs_check(self) {
            let mut elems = cell.borrow().elements_cloned();
            elems[idx] = val.clone();
            let trial = make_plain(elems);
            revise::check_constraint(self, &trial)?;
        }

        let args = vec![Variant::ulongint(idx as u64), old.clone(), val.clone()];
        if !fire_pre(self, ChangeOp::Change, &args) {
            return Err(set_last_error(Error::NotSupported));
        }

        let parent_id = Rc::as_ptr(&cell) as usize;
        revise::unbind(&old, parent_id, None);
        cell.borrow_mut().elems[idx] = val.clone();
        revise::bind(&val, ParentRef::Array(Rc::downgrade(&cell)), None);

        if revise::needs_check(self) {
            revise::adjust_after(self);
        }
        fire_post(self, ChangeOp::Change, &args);
        Ok(())
    }

    /// Insert before `idx`; valid for `idx` in `[0, len]`.
    pub fn array_insert_before(&self, idx: usize, val: Variant) -> Result<(), Error> {
        let cell = self.arr_cell()?.clone();
        let len = cell.borrow().elems.len();
        if idx > len {
            return Err(set_last_error(Error::OutOfRange));
        }

        if revise::needs_check(self) {
            let mut elems = cell.borrow().elements_cloned();
            elems.insert(idx, val.clone());
            let trial = make_plain(elems);
            revise::check_constraint(self, &trial)?;
        }

        let args = vec![Variant::ulongint(idx as u64), val.clone()];
        if !fire_pre(self, ChangeOp::Grow, &args) {
            return Err(set_last_error(Error::NotSupported));
        }

        cell.borrow_mut().elems.insert(idx, val.clone());
        revise::bind(&val, ParentRef::Array(Rc::downgrade(&cell)), None);

        if revise::needs_check(self) {
            revise::adjust_after(self);
        }
        fire_post(self, ChangeOp::Grow, &args);
        Ok(())
    }

    /// Insert after `idx`; valid for `idx` in `[-1, len-1]`.
    pub fn array_insert_after(&self, idx: isize, val: Variant) -> Result<(), Error> {
        let len = self.arr_cell()?.borrow().elems.len() as isize;
        if idx < -1 || idx >= len {
            return Err(set_last_error(Error::OutOfRange));
        }
        self.array_insert_before((idx + 1) as usize, val)
    }

    pub fn array_append(&self, val: Variant) -> Result<(), Error> {
        let len = self.array_size()?;
        self.array_insert_before(len, val)
    }

    pub fn array_prepend(&self, val: Variant) -> Result<(), Error> {
        self.array_insert_before(0, val)
    }

    /// Remove the element at `idx`; fires SHRINK.
    pub fn array_remove(&self, idx: usize) -> Result<Variant, Error> {
        let cell = self.arr_cell()?.clone();
        let old = cell
            .borrow()
            .elems
            .get(idx)
            .cloned()
            .ok_or_else(|| set_last_error(Error::OutOfRange))?;

        if revise::needs_check(self) {
            let mut elems = cell.borrow().elements_cloned();
            elems.remove(idx);
            let trial = make_plain(elems);
            revise::check_constraint(self, &trial)?;
        }

        let args = vec![Variant::ulongint(idx as u64), old.clone()];
        if !fire_pre(self, ChangeOp::Shrink, &args) {
            return Err(set_last_error(Error::NotSupported));
        }

        let parent_id = Rc::as_ptr(&cell) as usize;
        revise::unbind(&old, parent_id, None);
        cell.borrow_mut().elems.remove(idx);

        if revise::needs_check(self) {
            revise::adjust_after(self);
        }
        fire_post(self, ChangeOp::Shrink, &args);
        Ok(old)
    }

    /// Sort in place with the given comparator. The relative order of
    /// equal elements is unspecified.
    pub fn array_sort(&self, cmp: impl Fn(&Variant, &Variant) -> Ordering) -> Result<(), Error> {
        let cell = self.arr_cell()?.clone();
        let mut elems = std::mem::take(&mut cell.borrow_mut().elems);
        elems.sort_unstable_by(|a, b| cmp(a, b));
        cell.borrow_mut().elems = elems;
        Ok(())
    }

    /// Membership by deep equality.
    pub fn array_contains(&self, val: &Variant) -> Result<bool, Error> {
        Ok(self
            .arr_cell()?
            .borrow()
            .elems
            .iter()
            .any(|e| e.equals(val)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(arr: &Variant) -> Vec<i64> {
        arr.array_elements()
            .unwrap()
            .iter()
            .map(|v| v.cast_to_i64(false).unwrap())
            .collect()
    }

    #[test]
    fn test_insert_positions() {
        let arr = Variant::array();
        arr.array_append(Variant::longint(2)).unwrap();
        arr.array_prepend(Variant::longint(1)).unwrap();
        arr.array_insert_before(2, Variant::longint(4)).unwrap();
        arr.array_insert_after(1, Variant::longint(3)).unwrap();
        assert_eq!(ints(&arr), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_insert_bounds() {
        let arr = Variant::array_from([Variant::longint(1)]);
        assert!(arr.array_insert_before(2, Variant::null()).is_err());
        assert!(arr.array_insert_after(1, Variant::null()).is_err());
        // -1 prepends
        arr.array_insert_after(-1, Variant::longint(0)).unwrap();
        assert_eq!(ints(&arr), vec![0, 1]);
    }

    #[test]
    fn test_set_and_remove() {
        let arr = Variant::array_from([Variant::longint(1), Variant::longint(2)]);
        arr.array_set(1, Variant::longint(20)).unwrap();
        assert_eq!(ints(&arr), vec![1, 20]);
        let old = arr.array_remove(0).unwrap();
        assert_eq!(old.cast_to_i64(false).unwrap(), 1);
        assert_eq!(ints(&arr), vec![20]);
        assert!(arr.array_remove(5).is_err());
    }

    #[test]
    fn test_sort() {
        let arr = Variant::array_from([
            Variant::longint(3),
            Variant::longint(1),
            Variant::longint(2),
        ]);
        arr.array_sort(|a, b| a.compare(b)).unwrap();
        assert_eq!(ints(&arr), vec![1, 2, 3]);
        arr.array_sort(|a, b| b.compare(a)).unwrap();
        assert_eq!(ints(&arr), vec![3, 2, 1]);
    }

    #[test]
    fn test_contains() {
        let arr = Variant::array_from([Variant::string("x")]);
        assert!(arr.array_contains(&Variant::string("x")).unwrap());
        assert!(!arr.array_contains(&Variant::string("y")).unwrap());
    }
}
