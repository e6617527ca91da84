//! Reverse-update graph
//!
//! A container can be reachable from many places in the value graph. When
//! a deep descendant mutates, every `set` above it that derives a
//! fingerprint from the descendant must revalidate before the mutation
//! becomes visible.
//!
//! Each mutable container owns a *reverse-update chain*: weak back-links
//! to every parent it is installed under. For set parents the edge also
//! records the member node, so post-commit readjustment can reindex the
//! exact element that moved.
//!
//! Two walks operate on the chains, both driven by an input/cache/output
//! frontier keyed by payload address (identity, not value, so shared
//! subtrees terminate the walk):
//!
//! - `check_constraint` runs *before* a mutation commits. It builds a
//!   trial replacement for the mutating container and rebuilds every
//!   transitive parent with the substitution applied. Rebuilding a set
//!   re-derives every fingerprint, so a would-be collision surfaces as
//!   `Duplicated` and the mutation is refused with the original state
//!   intact.
//! - `adjust_after` runs after a successful commit and reindexes the
//!   member nodes of every affected set, walking the remaining parents
//!   upward.

use crate::array::ArrData;
use crate::error::Error;
use crate::object::ObjData;
use crate::set::SetData;
use crate::tuple::TupleData;
use crate::variant::Variant;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// A weak back-reference to one parent container.
pub(crate) enum ParentRef {
    Object(Weak<RefCell<ObjData>>),
    Array(Weak<RefCell<ArrData>>),
    Set(Weak<RefCell<SetData>>),
    Tuple(Weak<RefCell<TupleData>>),
}

impl ParentRef {
    pub(crate) fn id(&self) -> usize {
        match self {
            ParentRef::Object(w) => w.as_ptr() as usize,
            ParentRef::Array(w) => w.as_ptr() as usize,
            ParentRef::Set(w) => w.as_ptr() as usize,
            ParentRef::Tuple(w) => w.as_ptr() as usize,
        }
    }

    fn upgrade(&self) -> Option<Variant> {
        match self {
            ParentRef::Object(w) => w.upgrade().map(Variant::Object),
            ParentRef::Array(w) => w.upgrade().map(Variant::Array),
            ParentRef::Set(w) => w.upgrade().map(Variant::Set),
            ParentRef::Tuple(w) => w.upgrade().map(Variant::Tuple),
        }
    }
}

/// One edge of a child's reverse-update chain.
pub(crate) struct RevEdge {
    pub(crate) parent: ParentRef,
    /// For set parents, the member node this child is (or sits inside).
    pub(crate) set_node: Option<usize>,
}

/// The chain itself: an ordered multiset of parent edges. The same parent
/// appears once per position the child occupies under it.
#[derive(Default)]
pub(crate) struct RevChain {
    edges: Vec<RevEdge>,
}

impl RevChain {
    pub(crate) fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    fn push(&mut self, edge: RevEdge) {
        self.edges.push(edge);
    }

    fn remove(&mut self, parent_id: usize, set_node: Option<usize>) {
        if let Some(pos) = self
            .edges
            .iter()
            .position(|e| e.parent.id() == parent_id && e.set_node == set_node)
        {
            self.edges.remove(pos);
        }
    }
}

fn with_chain<R>(v: &Variant, f: impl FnOnce(&mut RevChain) -> R) -> Option<R> {
    match v {
        Variant::Object(d) => Some(f(d.borrow_mut().rev_chain_mut())),
        Variant::Array(d) => Some(f(d.borrow_mut().rev_chain_mut())),
        Variant::Set(d) => Some(f(d.borrow_mut().rev_chain_mut())),
        Variant::Tuple(d) => Some(f(d.borrow_mut().rev_chain_mut())),
        // sorted arrays hold values but do not route reverse updates
        _ => None,
    }
}

fn chain_edges(v: &Variant) -> Vec<(Option<Variant>, Option<usize>)> {
    match v {
        Variant::Object(d) => d
            .borrow()
            .rev_chain()
            .edges
            .iter()
            .map(|e| (e.parent.upgrade(), e.set_node))
            .collect(),
        Variant::Array(d) => d
            .borrow()
            .rev_chain()
            .edges
            .iter()
            .map(|e| (e.parent.upgrade(), e.set_node))
            .collect(),
        Variant::Set(d) => d
            .borrow()
            .rev_chain()
            .edges
            .iter()
            .map(|e| (e.parent.upgrade(), e.set_node))
            .collect(),
        Variant::Tuple(d) => d
            .borrow()
            .rev_chain()
            .edges
            .iter()
            .map(|e| (e.parent.upgrade(), e.set_node))
            .collect(),
        _ => Vec::new(),
    }
}

/// Install the edge `(child -> parent)` when the child routes reverse
/// updates. Immutable children have no chain and need none.
pub(crate) fn bind(child: &Variant, parent: ParentRef, set_node: Option<usize>) {
    let _ = with_chain(child, |c| c.push(RevEdge { parent, set_node }));
}

/// Break one `(child -> parent)` edge; called before the child is
/// replaced or removed.
pub(crate) fn unbind(child: &Variant, parent_id: usize, set_node: Option<usize>) {
    let _ = with_chain(child, |c| c.remove(parent_id, set_node));
}

/// Bind edges from every direct child of a freshly built object, array,
/// or tuple back to it. Set members are bound by `set` itself because
/// their edges carry node identities.
pub(crate) fn bind_children(parent: &Variant) {
    match parent {
        Variant::Object(cell) => {
            for (_, v) in cell.borrow().entries_cloned() {
                bind(&v, ParentRef::Object(Rc::downgrade(cell)), None);
            }
        }
        Variant::Array(cell) => {
            for v in cell.borrow().elements_cloned() {
                bind(&v, ParentRef::Array(Rc::downgrade(cell)), None);
            }
        }
        Variant::Tuple(cell) => {
            for v in cell.borrow().members_cloned() {
                bind(&v, ParentRef::Tuple(Rc::downgrade(cell)), None);
            }
        }
        _ => {}
    }
}

/// Whether a mutation of `v` needs the pre-change reverse check at all.
pub(crate) fn needs_check(v: &Variant) -> bool {
    match v {
        Variant::Object(d) => !d.borrow().rev_chain().is_empty(),
        Variant::Array(d) => !d.borrow().rev_chain().is_empty(),
        Variant::Set(d) => !d.borrow().rev_chain().is_empty(),
        Variant::Tuple(d) => !d.borrow().rev_chain().is_empty(),
        _ => false,
    }
}

/// Rebuild `val` with every substitution in `cache` applied. Containers
/// are rebuilt bottom-up; anything already rebuilt is reused from the
/// cache, which also terminates on shared subtrees. Rebuilding a set
/// re-checks fingerprint uniqueness.
fn rebuild(val: &Variant, cache: &mut HashMap<usize, Variant>) -> Result<Variant, Error> {
    let id = val.ptr_id();
    if let Some(hit) = cache.get(&id) {
        return Ok(hit.clone());
    }

    let rebuilt = match val {
        Variant::Object(d) => {
            let entries = d.borrow().entries_cloned();
            let mut pairs = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                pairs.push((k, rebuild(&v, cache)?));
            }
            crate::object::make_plain(pairs)
        }
        Variant::Array(d) => {
            let elems = d.borrow().elements_cloned();
            let mut out = Vec::with_capacity(elems.len());
            for v in elems {
                out.push(rebuild(&v, cache)?);
            }
            crate::array::make_plain(out)
        }
        Variant::Set(d) => {
            let (keyspec, members) = {
                let b = d.borrow();
                (b.keyspec_cloned(), b.members_insertion())
            };
            let mut out = Vec::with_capacity(members.len());
            for v in members {
                out.push(rebuild(&v, cache)?);
            }
            // duplicate fingerprints among the rebuilt members surface here
            crate::set::make_plain(keyspec, out)?
        }
        Variant::Tuple(d) => {
            let members = d.borrow().members_cloned();
            let mut out = Vec::with_capacity(members.len());
            for v in members {
                out.push(rebuild(&v, cache)?);
            }
            crate::tuple::make_plain(out)
        }
        _ => val.clone(),
    };

    if val.is_container() {
        cache.insert(id, rebuilt.clone());
    }
    Ok(rebuilt)
}

/// The pre-change reverse check: would replacing `old` by `trial` create
/// a duplicate fingerprint in any transitively reachable set?
pub(crate) fn check_constraint(old: &Variant, trial: &Variant) -> Result<(), Error> {
    let mut cache: HashMap<usize, Variant> = HashMap::new();
    cache.insert(old.ptr_id(), trial.clone());

    let mut input: Vec<Variant> = vec![old.clone()];
    let mut output: Vec<Variant> = Vec::new();

    while !input.is_empty() {
        for o in input.drain(..) {
            for (parent, _node) in chain_edges(&o) {
                let Some(parent) = parent else { continue };
                let seen = cache.contains_key(&parent.ptr_id());
                rebuild(&parent, &mut cache)?;
                if !seen {
                    output.push(parent);
                }
            }
        }
        std::mem::swap(&mut input, &mut output);
    }
    Ok(())
}

/// The post-commit walk: reindex the member nodes of every set that
/// derives a fingerprint from `changed`, then continue upward through
/// the remaining parents.
pub(crate) fn adjust_after(changed: &Variant) {
    let mut visited: HashMap<usize, ()> = HashMap::new();
    visited.insert(changed.ptr_id(), ());

    let mut input: Vec<Variant> = vec![changed.clone()];
    let mut output: Vec<Variant> = Vec::new();

    while !input.is_empty() {
        for v in input.drain(..) {
            for (parent, node) in chain_edges(&v) {
                let Some(parent) = parent else { continue };
                match (&parent, node) {
                    (Variant::Set(set), Some(node)) => {
                        crate::set::readjust_node(set, node);
                    }
                    _ => {
                        if visited.insert(parent.ptr_id(), ()).is_none() {
                            output.push(parent);
                        }
                    }
                }
            }
        }
        std::mem::swap(&mut input, &mut output);
    }
}
