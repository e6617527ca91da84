//! Unique-by-fingerprint collection
//!
//! A set is parameterized at creation by a key specification: either a
//! list of field names projected out of every member (members must then
//! be objects carrying all of those fields), or nothing, in which case
//! the member itself is the key.
//!
//! Two members collide when their key projections are deeply equal. The
//! set maintains two views over the same nodes: an ordered map keyed by
//! fingerprint for lookup and ordered traversal, and the insertion-order
//! list. Fingerprints are *snapshots*: projected values are captured at
//! insert time (deep copies for keyed-by-self members), so the ordered
//! view stays internally consistent while a member mutates; the
//! reverse-update walk then reindexes the member through
//! `readjust_node`.

use crate::error::{set_last_error, Error};
use crate::heap;
use crate::observer::{fire_post, fire_pre, ChangeOp, Listener};
use crate::revise::{self, ParentRef, RevChain};
use crate::variant::{compare_seqs, Kind, Variant};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A snapshot of the key projection of one member.
#[derive(Clone)]
pub(crate) struct Fingerprint(Rc<[Variant]>);

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        compare_seqs(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for Fingerprint {}

impl PartialOrd for Fingerprint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fingerprint {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_seqs(&self.0, &other.0)
    }
}

struct SetNode {
    elem: Variant,
    fp: Fingerprint,
}

pub struct SetData {
    keyspec: Option<Vec<Rc<str>>>,
    nodes: Vec<Option<SetNode>>,
    free: Vec<usize>,
    by_fp: BTreeMap<Fingerprint, usize>,
    order: Vec<usize>,
    listeners: Vec<Rc<Listener>>,
    rev: RevChain,
}

impl SetData {
    fn new(keyspec: Option<Vec<Rc<str>>>) -> SetData {
        heap::account_alloc(Kind::Set, 0);
        SetData {
            keyspec,
            nodes: Vec::new(),
            free: Vec::new(),
            by_fp: BTreeMap::new(),
            order: Vec::new(),
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

    pub(crate) fn keyspec_cloned(&self) -> Option<Vec<Rc<str>>> {
        self.keyspec.clone()
    }

    pub(crate) fn size(&self) -> usize {
        self.order.len()
    }

    /// Members in fingerprint order (the default iteration order).
    pub(crate) fn members_ordered(&self) -> Vec<Variant> {
        self.by_fp
            .values()
            .map(|&id| self.nodes[id].as_ref().unwrap().elem.clone())
            .collect()
    }

    /// Members in insertion order.
    pub(crate) fn members_insertion(&self) -> Vec<Variant> {
        self.order
            .iter()
            .map(|&id| self.nodes[id].as_ref().unwrap().elem.clone())
            .collect()
    }

    fn alloc_node(&mut self, node: SetNode) -> usize {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn free_node(&mut self, id: usize) -> Option<SetNode> {
        let node = self.nodes.get_mut(id)?.take();
        if node.is_some() {
            self.free.push(id);
            self.order.retain(|&o| o != id);
        }
        node
    }

    /// Insert a member without events or edges; fails on collision.
    fn insert_plain(&mut self, elem: Variant) -> Result<usize, Error> {
        let fp = fingerprint_of(&self.keyspec, &elem)?;
        if self.by_fp.contains_key(&fp) {
            return Err(set_last_error(Error::Duplicated));
        }
        let id = self.alloc_node(SetNode { elem, fp: fp.clone() });
        self.by_fp.insert(fp, id);
        self.order.push(id);
        Ok(id)
    }
}

impl Drop for SetData {
    fn drop(&mut self) {
        heap::account_free(Kind::Set, 0);
    }
}

/// Derive the fingerprint snapshot of `elem` under `keyspec`.
///
/// With a field list, the member must be an object carrying every listed
/// field, and a projected field must not itself be a mutable container
/// (such a key could drift underneath the ordered view without any
/// reverse edge to announce it).
fn fingerprint_of(
    keyspec: &Option<Vec<Rc<str>>>,
    elem: &Variant,
) -> Result<Fingerprint, Error> {
    match keyspec {
        Some(keys) => {
            if elem.kind() != Kind::Object {
                return Err(set_last_error(Error::WrongDataType));
            }
            let mut parts = Vec::with_capacity(keys.len());
            for k in keys {
                let v = elem
                    .object_get(k)?
                    .ok_or_else(|| set_last_error(Error::InvalidValue))?;
                if v.is_container() {
                    return Err(set_last_error(Error::InvalidValue));
                }
                parts.push(v);
            }
            Ok(Fingerprint(parts.into()))
        }
        None => Ok(Fingerprint(vec![elem.deep_snapshot()].into())),
    }
}

/// Build a set without events or edges. Fails with `Duplicated` when two
/// members collide, which is exactly how trial rebuilds detect a
/// would-be collision.
pub(crate) fn make_plain(
    keyspec: Option<Vec<Rc<str>>>,
    members: Vec<Variant>,
) -> Result<Variant, Error> {
    let mut data = SetData::new(keyspec);
    for m in members {
        data.insert_plain(m)?;
    }
    Ok(Variant::Set(Rc::new(RefCell::new(data))))
}

pub(crate) fn clone_set(data: &SetData, recursively: bool) -> Result<Variant, Error> {
    let mut members = Vec::with_capacity(data.size());
    for m in data.members_insertion() {
        members.push(if recursively {
            m.clone_container(true)?
        } else {
            m.clone()
        });
    }
    let cloned = make_plain(data.keyspec_cloned(), members)?;
    rebind_member_edges(&cloned);
    Ok(cloned)
}

/// Bind the member edges of a set built through the plain path.
pub(crate) fn rebind_member_edges(set: &Variant) {
    if let Variant::Set(cell) = set {
        let pairs: Vec<(usize, Variant)> = cell
            .borrow()
            .order
            .iter()
            .map(|&id| (id, cell.borrow().nodes[id].as_ref().unwrap().elem.clone()))
            .collect();
        for (id, elem) in pairs {
            revise::bind(&elem, ParentRef::Set(Rc::downgrade(cell)), Some(id));
        }
    }
}

/// Reindex one member node after a descendant mutation may have moved
/// its fingerprint. Collisions cannot arise here: the pre-change reverse
/// check refuses any mutation that would produce one.
pub(crate) fn readjust_node(cell: &Rc<RefCell<SetData>>, node_id: usize) {
    let mut data = cell.borrow_mut();
    let keyspec = data.keyspec_cloned();
    let Some(node) = data.nodes.get(node_id).and_then(|n| n.as_ref()) else {
        return;
    };
    let elem = node.elem.clone();
    let old_fp = node.fp.clone();
    drop(data);

    let Ok(new_fp) = fingerprint_of(&keyspec, &elem) else {
        return;
    };

    let mut data = cell.borrow_mut();
    if new_fp == old_fp {
        return;
    }
    data.by_fp.remove(&old_fp);
    if let Some(&other) = data.by_fp.get(&new_fp) {
        debug_assert!(other == node_id, "unchecked fingerprint collision");
        tracing::warn!("set member collided during readjustment; dropping it");
        data.by_fp.remove(&new_fp);
        data.free_node(node_id);
        return;
    }
    data.by_fp.insert(new_fp.clone(), node_id);
    if let Some(n) = data.nodes[node_id].as_mut() {
        n.fp = new_fp;
    }
}

impl Variant {
    /// A fresh set. `keys` is the ordered field list projected out of
    /// every member, or `None` to key members by themselves.
    pub fn set(keys: Option<&[&str]>) -> Variant {
        let keyspec = keys.map(|ks| ks.iter().map(|&k| Rc::from(k)).collect());
        make_plain(keyspec, Vec::new()).expect("empty set cannot collide")
    }

    fn set_cell(&self) -> Result<&Rc<RefCell<SetData>>, Error> {
        match self {
            Variant::Set(c) => Ok(c),
            _ => Err(set_last_error(Error::WrongDataType)),
        }
    }

    pub fn set_size(&self) -> Result<usize, Error> {
        Ok(self.set_cell()?.borrow().size())
    }

    /// Members in fingerprint order.
    pub fn set_members(&self) -> Result<Vec<Variant>, Error> {
        Ok(self.set_cell()?.borrow().members_ordered())
    }

    /// Members in insertion order.
    pub fn set_members_insertion(&self) -> Result<Vec<Variant>, Error> {
        Ok(self.set_cell()?.borrow().members_insertion())
    }

    /// Membership by fingerprint.
    pub fn set_contains(&self, probe: &Variant) -> Result<bool, Error> {
        let cell = self.set_cell()?;
        let data = cell.borrow();
        let fp = fingerprint_of(&data.keyspec, probe)?;
        Ok(data.by_fp.contains_key(&fp))
    }

    /// The stored member whose fingerprint matches `probe`.
    pub fn set_find(&self, probe: &Variant) -> Result<Option<Variant>, Error> {
        let cell = self.set_cell()?;
        let data = cell.borrow();
        let fp = fingerprint_of(&data.keyspec, probe)?;
        Ok(data
            .by_fp
            .get(&fp)
            .map(|&id| data.nodes[id].as_ref().unwrap().elem.clone()))
    }

    /// Insert `val`. A fingerprint collision fails with `Duplicated`
    /// unless `overwrite` is set, in which case the colliding member is
    /// replaced and CHANGE fires; plain insertions fire GROW.
    pub fn set_add(&self, val: Variant, overwrite: bool) -> Result<(), Error> {
        let cell = self.set_cell()?.clone();
        let (fp, colliding) = {
            let data = cell.borrow();
            let fp = fingerprint_of(&data.keyspec, &val)?;
            let colliding = data.by_fp.get(&fp).copied();
            (fp, colliding)
        };

        match colliding {
            Some(_) if !overwrite => Err(set_last_error(Error::Duplicated)),
            Some(node_id) => {
                let old = cell.borrow().nodes[node_id].as_ref().unwrap().elem.clone();
                if old.ptr_id() != 0 && old.ptr_id() == val.ptr_id() {
                    return Ok(());
                }

                if revise::needs_check(self) {
                    let members: Vec<Variant> = cell
                        .borrow()
                        .members_insertion()
                        .into_iter()
                        .map(|m| if m.ptr_id() == old.ptr_id() && m.equals(&old) {
                            val.clone()
                        } else {
                            m
                        })
                        .collect();
                    let trial = make_plain(cell.borrow().keyspec_cloned(), members)?;
                    revise::check_constraint(self, &trial)?;
                }

                let args = vec![old.clone(), val.clone()];
                if !fire_pre(self, ChangeOp::Change, &args) {
                    return Err(set_last_error(Error::NotSupported));
                }

                let parent_id = Rc::as_ptr(&cell) as usize;
                revise::unbind(&old, parent_id, Some(node_id));
                {
                    let mut data = cell.borrow_mut();
                    if let Some(n) = data.nodes[node_id].as_mut() {
                        n.elem = val.clone();
                        n.fp = fp.clone();
                    }
                }
                revise::bind(&val, ParentRef::Set(Rc::downgrade(&cell)), Some(node_id));

                if revise::needs_check(self) {
                    revise::adjust_after(self);
                }
                fire_post(self, ChangeOp::Change, &args);
                Ok(())
            }
            None => {
                if revise::needs_check(self) {
                    let mut members = cell.borrow().members_insertion();
                    members.push(val.clone());
                    let trial = make_plain(cell.borrow().keyspec_cloned(), members)?;
                    revise::check_constraint(self, &trial)?;
                }

                let args = vec![val.clone()];
                if !fire_pre(self, ChangeOp::Grow, &args) {
                    return Err(set_last_error(Error::NotSupported));
                }

                let node_id = {
                    let mut data = cell.borrow_mut();
                    let id = data.alloc_node(SetNode {
                        elem: val.clone(),
                        fp: fp.clone(),
                    });
                    data.by_fp.insert(fp, id);
                    data.order.push(id);
                    id
                };
                revise::bind(&val, ParentRef::Set(Rc::downgrade(&cell)), Some(node_id));

                if revise::needs_check(self) {
                    revise::adjust_after(self);
                }
                fire_post(self, ChangeOp::Grow, &args);
                Ok(())
            }
        }
    }

    /// Remove the member matching `probe`'s fingerprint; fires SHRINK.
    pub fn set_remove(&self, probe: &Variant) -> Result<Variant, Error> {
        let cell = self.set_cell()?.clone();
        let (node_id, old) = {
            let data = cell.borrow();
            let fp = fingerprint_of(&data.keyspec, probe)?;
            let id = *data
                .by_fp
                .get(&fp)
                .ok_or_else(|| set_last_error(Error::NotFound))?;
            (id, data.nodes[id].as_ref().unwrap().elem.clone())
        };

        if revise::needs_check(self) {
            let members: Vec<Variant> = cell
                .borrow()
                .order
                .iter()
                .filter(|&&id| id != node_id)
                .map(|&id| cell.borrow().nodes[id].as_ref().unwrap().elem.clone())
                .collect();
            let trial = make_plain(cell.borrow().keyspec_cloned(), members)?;
            revise::check_constraint(self, &trial)?;
        }

        let args = vec![old.clone()];
        if !fire_pre(self, ChangeOp::Shrink, &args) {
            return Err(set_last_error(Error::NotSupported));
        }

        let parent_id = Rc::as_ptr(&cell) as usize;
        revise::unbind(&old, parent_id, Some(node_id));
        {
            let mut data = cell.borrow_mut();
            let node = data.free_node(node_id).expect("node just looked up");
            data.by_fp.remove(&node.fp);
        }

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

    fn obj(id: &str, v: i64) -> Variant {
        let o = Variant::object();
        o.object_set("id", Variant::string(id)).unwrap();
        o.object_set("v", Variant::longint(v)).unwrap();
        o
    }

    #[test]
    fn test_add_and_duplicate() {
        let s = Variant::set(Some(&["id"]));
        s.set_add(obj("x", 1), false).unwrap();
        s.set_add(obj("y", 2), false).unwrap();
        assert_eq!(s.set_size().unwrap(), 2);

        // same id collides regardless of other fields
        assert_eq!(s.set_add(obj("x", 99), false), Err(Error::Duplicated));
        assert_eq!(s.set_size().unwrap(), 2);

        // overwrite replaces the colliding member
        s.set_add(obj("x", 99), true).unwrap();
        assert_eq!(s.set_size().unwrap(), 2);
        let found = s.set_find(&obj("x", 0)).unwrap().unwrap();
        assert_eq!(
            found.object_get("v").unwrap().unwrap().cast_to_i64(false).unwrap(),
            99
        );
    }

    #[test]
    fn test_keyed_by_self() {
        let s = Variant::set(None);
        s.set_add(Variant::longint(3), false).unwrap();
        s.set_add(Variant::longint(1), false).unwrap();
        s.set_add(Variant::longint(2), false).unwrap();
        assert_eq!(s.set_add(Variant::longint(1), false), Err(Error::Duplicated));

        // ordered view sorts by fingerprint, insertion view preserves arrival
        let ordered: Vec<i64> = s
            .set_members()
            .unwrap()
            .iter()
            .map(|v| v.cast_to_i64(false).unwrap())
            .collect();
        assert_eq!(ordered, vec![1, 2, 3]);
        let insertion: Vec<i64> = s
            .set_members_insertion()
            .unwrap()
            .iter()
            .map(|v| v.cast_to_i64(false).unwrap())
            .collect();
        assert_eq!(insertion, vec![3, 1, 2]);
    }

    #[test]
    fn test_remove() {
        let s = Variant::set(Some(&["id"]));
        s.set_add(obj("a", 1), false).unwrap();
        s.set_add(obj("b", 2), false).unwrap();
        let removed = s.set_remove(&obj("a", 0)).unwrap();
        assert_eq!(
            removed.object_get("id").unwrap().unwrap().as_str().unwrap(),
            "a"
        );
        assert_eq!(s.set_size().unwrap(), 1);
        assert_eq!(s.set_remove(&obj("a", 0)), Err(Error::NotFound));
    }

    #[test]
    fn test_member_must_carry_keys() {
        let s = Variant::set(Some(&["id"]));
        let missing = Variant::object();
        missing.object_set("other", Variant::longint(1)).unwrap();
        assert_eq!(s.set_add(missing, false), Err(Error::InvalidValue));
        assert_eq!(
            s.set_add(Variant::longint(1), false),
            Err(Error::WrongDataType)
        );
    }

    #[test]
    fn test_container_key_rejected() {
        let s = Variant::set(Some(&["id"]));
        let o = Variant::object();
        o.object_set("id", Variant::array()).unwrap();
        assert_eq!(s.set_add(o, false), Err(Error::InvalidValue));
    }

    #[test]
    fn test_uniqueness_invariant() {
        let s = Variant::set(Some(&["k"]));
        for i in 0..10 {
            let o = Variant::object();
            o.object_set("k", Variant::longint(i)).unwrap();
            s.set_add(o, false).unwrap();
        }
        let members = s.set_members().unwrap();
        for (i, a) in members.iter().enumerate() {
            for b in members.iter().skip(i + 1) {
                let ka = a.object_get("k").unwrap().unwrap();
                let kb = b.object_get("k").unwrap().unwrap();
                assert!(!ka.equals(&kb));
            }
        }
    }
}
