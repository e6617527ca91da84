//! Sorted ordered collection
//!
//! Elements are kept ordered under a user-supplied comparator (or the
//! default total variant order), ascending or descending. The uniqueness
//! policy is fixed at creation: unique collections refuse an element
//! that compares equal to a stored one.
//!
//! Sorted arrays hold strong references like any container but do not
//! route reverse updates; their order is derived from the comparator,
//! not from member fingerprints.

use crate::error::{set_last_error, Error};
use crate::heap;
use crate::observer::{fire_post, fire_pre, ChangeOp, Listener};
use crate::variant::{Kind, Variant};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

pub type SortedCmp = Rc<dyn Fn(&Variant, &Variant) -> Ordering>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SortedFlags {
    /// Descending order.
    pub desc: bool,
    /// Permit elements that compare equal.
    pub allow_duplicates: bool,
}

pub struct SortedData {
    elems: Vec<Variant>,
    cmp: Option<SortedCmp>,
    flags: SortedFlags,
    listeners: Vec<Rc<Listener>>,
}

impl SortedData {
    pub(crate) fn listeners_mut(&mut self) -> &mut Vec<Rc<Listener>> {
        &mut self.listeners
    }

    pub(crate) fn elements_cloned(&self) -> Vec<Variant> {
        self.elems.clone()
    }

    fn order(&self, a: &Variant, b: &Variant) -> Ordering {
        let ord = match &self.cmp {
            Some(f) => f(a, b),
            None => a.compare(b),
        };
        if self.flags.desc {
            ord.reverse()
        } else {
            ord
        }
    }

    /// Index of a matching element, or the insertion point.
    fn search(&self, probe: &Variant) -> Result<usize, usize> {
        self.elems.binary_search_by(|e| self.order(e, probe))
    }
}

impl Drop for SortedData {
    fn drop(&mut self) {
        heap::account_free(Kind::SortedArray, 0);
    }
}

/// Build a sorted array directly from already-ordered elements.
pub(crate) fn make_plain(
    flags: SortedFlags,
    cmp: Option<SortedCmp>,
    elems: Vec<Variant>,
) -> Variant {
    heap::account_alloc(Kind::SortedArray, 0);
    Variant::SortedArray(Rc::new(RefCell::new(SortedData {
        elems,
        cmp,
        flags,
        listeners: Vec::new(),
    })))
}

pub(crate) fn sorted_flags(data: &SortedData) -> SortedFlags {
    data.flags
}

pub(crate) fn has_custom_cmp(data: &SortedData) -> bool {
    data.cmp.is_some()
}

pub(crate) fn clone_sorted(data: &SortedData, recursively: bool) -> Result<Variant, Error> {
    let mut elems = Vec::with_capacity(data.elems.len());
    for v in &data.elems {
        elems.push(if recursively {
            v.clone_container(true)?
        } else {
            v.clone()
        });
    }
    heap::account_alloc(Kind::SortedArray, 0);
    Ok(Variant::SortedArray(Rc::new(RefCell::new(SortedData {
        elems,
        cmp: data.cmp.clone(),
        flags: data.flags,
        listeners: Vec::new(),
    }))))
}

impl Variant {
    /// A fresh sorted array.
    pub fn sorted_array(flags: SortedFlags, cmp: Option<SortedCmp>) -> Variant {
        heap::account_alloc(Kind::SortedArray, 0);
        Variant::SortedArray(Rc::new(RefCell::new(SortedData {
            elems: Vec::new(),
            cmp,
            flags,
            listeners: Vec::new(),
        })))
    }

    fn sorted_cell(&self) -> Result<&Rc<RefCell<SortedData>>, Error> {
        match self {
            Variant::SortedArray(c) => Ok(c),
            _ => Err(set_last_error(Error::WrongDataType)),
        }
    }

    pub fn sorted_size(&self) -> Result<usize, Error> {
        Ok(self.sorted_cell()?.borrow().elems.len())
    }

    pub fn sorted_get(&self, idx: usize) -> Result<Variant, Error> {
        self.sorted_cell()?
            .borrow()
            .elems
            .get(idx)
            .cloned()
            .ok_or_else(|| set_last_error(Error::OutOfRange))
    }

    pub fn sorted_elements(&self) -> Result<Vec<Variant>, Error> {
        Ok(self.sorted_cell()?.borrow().elements_cloned())
    }

    /// Position of an element comparing equal to `probe`.
    pub fn sorted_find(&self, probe: &Variant) -> Result<Option<usize>, Error> {
        Ok(self.sorted_cell()?.borrow().search(probe).ok())
    }

    /// Insert `val` at its ordered position; returns the index. Unique
    /// collections refuse equal elements with `Duplicated`.
    pub fn sorted_add(&self, val: Variant) -> Result<usize, Error> {
        let cell = self.sorted_cell()?.clone();
        let idx = {
            let data = cell.borrow();
            match data.search(&val) {
                Ok(found) if !data.flags.allow_duplicates => {
                    let _ = found;
                    return Err(set_last_error(Error::Duplicated));
                }
                Ok(found) => found,
                Err(insert_at) => insert_at,
            }
        };

        let args = vec![Variant::ulongint(idx as u64), val.clone()];
        if !fire_pre(self, ChangeOp::Grow, &args) {
            return Err(set_last_error(Error::NotSupported));
        }
        cell.borrow_mut().elems.insert(idx, val);
        fire_post(self, ChangeOp::Grow, &args);
        Ok(idx)
    }

    /// Remove the element comparing equal to `probe`.
    pub fn sorted_remove(&self, probe: &Variant) -> Result<Variant, Error> {
        let cell = self.sorted_cell()?.clone();
        let idx = cell
            .borrow()
            .search(probe)
            .map_err(|_| set_last_error(Error::NotFound))?;
        self.sorted_delete(idx)
    }

    /// Remove by index; fires SHRINK.
    pub fn sorted_delete(&self, idx: usize) -> Result<Variant, Error> {
        let cell = self.sorted_cell()?.clone();
        let old = cell
            .borrow()
            .elems
            .get(idx)
            .cloned()
            .ok_or_else(|| set_last_error(Error::OutOfRange))?;

        let args = vec![Variant::ulongint(idx as u64), old.clone()];
        if !fire_pre(self, ChangeOp::Shrink, &args) {
            return Err(set_last_error(Error::NotSupported));
        }
        cell.borrow_mut().elems.remove(idx);
        fire_post(self, ChangeOp::Shrink, &args);
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(v: &Variant) -> Vec<i64> {
        v.sorted_elements()
            .unwrap()
            .iter()
            .map(|e| e.cast_to_i64(false).unwrap())
            .collect()
    }

    #[test]
    fn test_ascending_default() {
        let s = Variant::sorted_array(SortedFlags::default(), None);
        for v in [5i64, 1, 3, 2, 4] {
            s.sorted_add(Variant::longint(v)).unwrap();
        }
        assert_eq!(ints(&s), vec![1, 2, 3, 4, 5]);
        assert_eq!(s.sorted_find(&Variant::longint(3)).unwrap(), Some(2));
        assert_eq!(s.sorted_find(&Variant::longint(9)).unwrap(), None);
    }

    #[test]
    fn test_descending() {
        let s = Variant::sorted_array(
            SortedFlags {
                desc: true,
                allow_duplicates: false,
            },
            None,
        );
        for v in [1i64, 3, 2] {
            s.sorted_add(Variant::longint(v)).unwrap();
        }
        assert_eq!(ints(&s), vec![3, 2, 1]);
    }

    #[test]
    fn test_unique_policy() {
        let s = Variant::sorted_array(SortedFlags::default(), None);
        s.sorted_add(Variant::longint(1)).unwrap();
        assert_eq!(s.sorted_add(Variant::longint(1)), Err(Error::Duplicated));

        let dups = Variant::sorted_array(
            SortedFlags {
                desc: false,
                allow_duplicates: true,
            },
            None,
        );
        dups.sorted_add(Variant::longint(1)).unwrap();
        dups.sorted_add(Variant::longint(1)).unwrap();
        assert_eq!(dups.sorted_size().unwrap(), 2);
    }

    #[test]
    fn test_user_comparator() {
        // order by string length
        let s = Variant::sorted_array(
            SortedFlags::default(),
            Some(Rc::new(|a: &Variant, b: &Variant| {
                a.as_str().unwrap().len().cmp(&b.as_str().unwrap().len())
            })),
        );
        s.sorted_add(Variant::string("ccc")).unwrap();
        s.sorted_add(Variant::string("a")).unwrap();
        s.sorted_add(Variant::string("bb")).unwrap();
        let lens: Vec<usize> = s
            .sorted_elements()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().len())
            .collect();
        assert_eq!(lens, vec![1, 2, 3]);
    }

    #[test]
    fn test_delete_and_remove() {
        let s = Variant::sorted_array(SortedFlags::default(), None);
        for v in [1i64, 2, 3] {
            s.sorted_add(Variant::longint(v)).unwrap();
        }
        s.sorted_delete(1).unwrap();
        assert_eq!(ints(&s), vec![1, 3]);
        s.sorted_remove(&Variant::longint(3)).unwrap();
        assert_eq!(ints(&s), vec![1]);
        assert!(s.sorted_delete(7).is_err());
        assert_eq!(s.sorted_remove(&Variant::longint(9)), Err(Error::NotFound));
    }
}
