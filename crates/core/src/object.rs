//! Ordered string-keyed mapping
//!
//! Keys are unique and compared by content; insertion order is preserved
//! and iterable both ways. Replacing a key keeps its original position.
//!
//! Every mutation runs the same pipeline: reverse-update constraint check
//! on a trial value, pre-observer (vetoable), commit with edge
//! maintenance, set readjustment, post-observer.

use crate::error::{set_last_error, Error};
use crate::heap;
use crate::observer::{fire_post, fire_pre, ChangeOp, Listener};
use crate::revise::{self, ParentRef, RevChain};
use crate::variant::{Kind, Variant};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

pub struct ObjData {
    entries: Vec<(Rc<str>, Variant)>,
    index: HashMap<Rc<str>, usize>,
    listeners: Vec<Rc<Listener>>,
    rev: RevChain,
}

impl ObjData {
    fn new() -> ObjData {
        heap::account_alloc(Kind::Object, 0);
        ObjData {
            entries: Vec::new(),
            index: HashMap::new(),
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

    pub(crate) fn size(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, key: &str) -> Option<Variant> {
        self.index.get(key).map(|&i| self.entries[i].1.clone())
    }

    pub(crate) fn entries_cloned(&self) -> Vec<(Rc<str>, Variant)> {
        self.entries.clone()
    }

    fn insert_plain(&mut self, key: Rc<str>, val: Variant) {
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = val,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, val));
            }
        }
    }

    fn remove_plain(&mut self, key: &str) -> Option<(Rc<str>, Variant)> {
        let i = self.index.remove(key)?;
        let out = self.entries.remove(i);
        for idx in self.index.values_mut() {
            if *idx > i {
                *idx -= 1;
            }
        }
        Some(out)
    }
}

impl Drop for ObjData {
    fn drop(&mut self) {
        heap::account_free(Kind::Object, 0);
    }
}

/// Build an object without firing observers or binding edges. Used for
/// trial rebuilds and migrated clones.
pub(crate) fn make_plain(pairs: Vec<(Rc<str>, Variant)>) -> Variant {
    let mut data = ObjData::new();
    for (k, v) in pairs {
        data.insert_plain(k, v);
    }
    Variant::Object(Rc::new(RefCell::new(data)))
}

pub(crate) fn clone_obj(data: &ObjData, recursively: bool) -> Result<Variant, Error> {
    let mut pairs = Vec::with_capacity(data.entries.len());
    for (k, v) in &data.entries {
        let v = if recursively {
            v.clone_container(true)?
        } else {
            v.clone()
        };
        pairs.push((k.clone(), v));
    }
    let out = make_plain(pairs);
    revise::bind_children(&out);
    Ok(out)
}

/// Objects order by their sorted key sequence, then by the values in
/// that key order; insertion order does not participate.
pub(crate) fn compare_objects(a: &ObjData, b: &ObjData) -> Ordering {
    let mut ka: Vec<&Rc<str>> = a.entries.iter().map(|(k, _)| k).collect();
    let mut kb: Vec<&Rc<str>> = b.entries.iter().map(|(k, _)| k).collect();
    ka.sort();
    kb.sort();
    for (x, y) in ka.iter().zip(kb.iter()) {
        match x.cmp(y) {
            Ordering::Equal => {}
            ord => return ord,
        }
        let vx = a.get(x).unwrap();
        let vy = b.get(y).unwrap();
        match vx.compare(&vy) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    ka.len().cmp(&kb.len())
}

pub(crate) fn debug_obj(
    data: &ObjData,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    let mut m = f.debug_map();
    for (k, v) in &data.entries {
        m.entry(&k.as_ref(), v);
    }
    m.finish()
}

impl Variant {
    /// A fresh empty object.
    pub fn object() -> Variant {
        make_plain(Vec::new())
    }

    /// Build an object from key/value pairs, last write wins.
    pub fn object_from(pairs: impl IntoIterator<Item = (&'static str, Variant)>) -> Variant {
        let obj = make_plain(
            pairs
                .into_iter()
                .map(|(k, v)| (Rc::from(k), v))
                .collect(),
        );
        revise::bind_children(&obj);
        obj
    }

    fn obj_cell(&self) -> Result<&Rc<RefCell<ObjData>>, Error> {
        match self {
            Variant::Object(c) => Ok(c),
            _ => Err(set_last_error(Error::WrongDataType)),
        }
    }

    pub fn object_size(&self) -> Result<usize, Error> {
        Ok(self.obj_cell()?.borrow().size())
    }

    pub fn object_get(&self, key: &str) -> Result<Option<Variant>, Error> {
        Ok(self.obj_cell()?.borrow().get(key))
    }

    pub fn object_has_key(&self, key: &str) -> Result<bool, Error> {
        Ok(self.obj_cell()?.borrow().index.contains_key(key))
    }

    /// Forward insertion-order entries.
    pub fn object_entries(&self) -> Result<Vec<(Rc<str>, Variant)>, Error> {
        Ok(self.obj_cell()?.borrow().entries_cloned())
    }

    /// Reverse insertion-order entries.
    pub fn object_entries_rev(&self) -> Result<Vec<(Rc<str>, Variant)>, Error> {
        let mut v = self.obj_cell()?.borrow().entries_cloned();
        v.reverse();
        Ok(v)
    }

    /// Install `val` under `key`. Fires CHANGE when the key exists,
    /// GROW otherwise.
    pub fn object_set(&self, key: &str, val: Variant) -> Result<(), Error> {
        let cell = self.obj_cell()?.clone();
        let old = cell.borrow().get(key);

        if revise::needs_check(self) {
            let mut pairs = cell.borrow().entries_cloned();
            let krc: Rc<str> = Rc::from(key);
            match pairs.iter_mut().find(|(k, _)| k.as_ref() == key) {
                Some(slot) => slot.1 = val.clone(),
                None => pairs.push((krc, val.clone())),
            }
            let trial = make_plain(pairs);
            revise::check_constraint(self, &trial)?;
        }

        let (op, args) = match &old {
            Some(o) => (
                ChangeOp::Change,
                vec![Variant::string(key), o.clone(), val.clone()],
            ),
            None => (ChangeOp::Grow, vec![Variant::string(key), val.clone()]),
        };
        if !fire_pre(self, op, &args) {
            return Err(set_last_error(Error::NotSupported));
        }

        let parent_id = Rc::as_ptr(&cell) as usize;
        if let Some(o) = &old {
            revise::unbind(o, parent_id, None);
        }
        cell.borrow_mut().insert_plain(Rc::from(key), val.clone());
        revise::bind(&val, ParentRef::Object(Rc::downgrade(&cell)), None);

        if revise::needs_check(self) {
            revise::adjust_after(self);
        }
        fire_post(self, op, &args);
        Ok(())
    }

    /// Remove `key`, firing SHRINK. `NotFound` when absent.
    pub fn object_remove(&self, key: &str) -> Result<Variant, Error> {
        let cell = self.obj_cell()?.clone();
        let old = cell
            .borrow()
            .get(key)
            .ok_or_else(|| set_last_error(Error::NotFound))?;

        if revise::needs_check(self) {
            let pairs: Vec<_> = cell
                .borrow()
                .entries_cloned()
                .into_iter()
                .filter(|(k, _)| k.as_ref() != key)
                .collect();
            let trial = make_plain(pairs);
            revise::check_constraint(self, &trial)?;
        }

        let args = vec![Variant::string(key), old.clone()];
        if !fire_pre(self, ChangeOp::Shrink, &args) {
            return Err(set_last_error(Error::NotSupported));
        }

        let parent_id = Rc::as_ptr(&cell) as usize;
        revise::unbind(&old, parent_id, None);
        cell.borrow_mut().remove_plain(key);

        if revise::needs_check(self) {
            revise::adjust_after(self);
        }
        fire_post(self, ChangeOp::Shrink, &args);
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer;

    #[test]
    fn test_insertion_order() {
        let obj = Variant::object();
        obj.object_set("a", Variant::longint(1)).unwrap();
        obj.object_set("b", Variant::longint(2)).unwrap();
        obj.object_set("c", Variant::longint(3)).unwrap();
        obj.object_set("b", Variant::longint(20)).unwrap();
        obj.object_remove("a").unwrap();

        let keys: Vec<String> = obj
            .object_entries()
            .unwrap()
            .iter()
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(keys, vec!["b", "c"]);

        let vals: Vec<i64> = obj
            .object_entries()
            .unwrap()
            .iter()
            .map(|(_, v)| v.cast_to_i64(false).unwrap())
            .collect();
        assert_eq!(vals, vec![20, 3]);
    }

    #[test]
    fn test_replace_keeps_position() {
        let obj = Variant::object();
        obj.object_set("x", Variant::longint(1)).unwrap();
        obj.object_set("y", Variant::longint(2)).unwrap();
        obj.object_set("x", Variant::longint(10)).unwrap();
        let keys: Vec<String> = obj
            .object_entries()
            .unwrap()
            .iter()
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(keys, vec!["x", "y"]);
    }

    #[test]
    fn test_backward_iteration() {
        let obj = Variant::object();
        obj.object_set("p", Variant::longint(1)).unwrap();
        obj.object_set("q", Variant::longint(2)).unwrap();
        let keys: Vec<String> = obj
            .object_entries_rev()
            .unwrap()
            .iter()
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(keys, vec!["q", "p"]);
    }

    #[test]
    fn test_remove_missing() {
        let obj = Variant::object();
        assert_eq!(obj.object_remove("nope"), Err(Error::NotFound));
    }

    #[test]
    fn test_wrong_kind() {
        let v = Variant::longint(1);
        assert_eq!(
            v.object_set("k", Variant::null()),
            Err(Error::WrongDataType)
        );
    }

    #[test]
    fn test_grow_and_change_events() {
        use std::cell::RefCell as StdRefCell;
        use std::rc::Rc as StdRc;

        let obj = Variant::object();
        let log: StdRc<StdRefCell<Vec<(ChangeOp, usize)>>> = StdRc::new(StdRefCell::new(vec![]));
        let log2 = log.clone();
        observer::register_post_listener(
            &obj,
            &[ChangeOp::Grow, ChangeOp::Change, ChangeOp::Shrink],
            Box::new(move |_, op, args| log2.borrow_mut().push((op, args.len()))),
        )
        .unwrap();

        obj.object_set("k", Variant::longint(1)).unwrap();
        obj.object_set("k", Variant::longint(2)).unwrap();
        obj.object_remove("k").unwrap();

        let events = log.borrow().clone();
        assert_eq!(
            events,
            vec![
                (ChangeOp::Grow, 2),
                (ChangeOp::Change, 3),
                (ChangeOp::Shrink, 2)
            ]
        );
    }

    #[test]
    fn test_pre_veto_leaves_state() {
        let obj = Variant::object();
        obj.object_set("k", Variant::longint(1)).unwrap();
        observer::register_pre_listener(
            &obj,
            &[ChangeOp::Change],
            Box::new(|_, _, _| false),
        )
        .unwrap();

        assert!(obj.object_set("k", Variant::longint(9)).is_err());
        assert_eq!(
            obj.object_get("k").unwrap().unwrap().cast_to_i64(false).unwrap(),
            1
        );
        // grow is still allowed
        obj.object_set("other", Variant::longint(2)).unwrap();
    }

    #[test]
    fn test_object_compare_ignores_order() {
        let a = Variant::object();
        a.object_set("x", Variant::longint(1)).unwrap();
        a.object_set("y", Variant::longint(2)).unwrap();
        let b = Variant::object();
        b.object_set("y", Variant::longint(2)).unwrap();
        b.object_set("x", Variant::longint(1)).unwrap();
        assert!(a.equals(&b));
    }
}
