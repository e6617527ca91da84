//! The move heap
//!
//! An instance may hand a variant graph to another instance running on a
//! different thread. The graph is first migrated *into* the process-wide
//! move heap (`move_in`), travels as a `MovedVariant`, and is re-owned by
//! the receiving instance (`move_out`). At every moment exactly one heap
//! accounts for each value; no value is reachable from two instance heaps.
//!
//! Migration enforces exclusive ownership: a payload whose reference
//! count shows holders outside the travelling graph is cloned rather
//! than moved, recursively. Observers and reverse-update edges do not
//! travel; internal edges are rebuilt after migration so the constraint
//! machinery works identically on the receiving side.
//!
//! Graphs containing `dynamic` or `native` values, or sorted arrays with
//! a custom comparator, are refused: their callbacks are bound to the
//! originating instance.

use crate::array;
use crate::error::{set_last_error, Error};
use crate::heap::{self, HeapStats};
use crate::object;
use crate::revise;
use crate::set;
use crate::sorted;
use crate::tuple;
use crate::variant::{Kind, Variant};
use std::rc::Rc;
use std::sync::Mutex;

/// The process-wide move heap: its mutex serializes all migrations and
/// its counters account for everything currently in flight.
static MOVE_HEAP: Mutex<HeapStats> = Mutex::new(HeapStats {
    nr_values: [0; crate::variant::NR_KINDS],
    sz_mem: [0; crate::variant::NR_KINDS],
    nr_total_values: 0,
    sz_total_mem: 0,
});

/// Snapshot the move heap's counters.
pub fn move_heap_stats() -> HeapStats {
    *MOVE_HEAP.lock().unwrap()
}

/// A variant graph staged in the move heap.
///
/// Dropping a `MovedVariant` without `move_out` re-owns the graph into
/// the dropping thread's heap first, keeping both ledgers balanced.
pub struct MovedVariant {
    inner: Option<Variant>,
}

// Safety: a MovedVariant is only constructed by `move_in`, which
// guarantees that
// - every Rc in the graph is exclusively owned by the graph itself
//   (shared payloads were cloned), so no reference count is reachable
//   from any other thread;
// - no listener closures travel (cleared during migration);
// - no Weak references point at foreign allocations (reverse-update
//   chains are rebuilt from the migrated graph only);
// - dynamic/native payloads and custom comparators, whose callbacks are
//   not thread-safe, are refused up front;
// - Atom handles index a global registry behind a Mutex.
// The graph is therefore a self-contained tree that can be transferred
// to another thread wholesale.
unsafe impl Send for MovedVariant {}

fn transfer_local_to_move(stats: &mut HeapStats, kind: Kind, extra: usize) {
    heap::account_free(kind, extra);
    stats.account_alloc(kind, extra);
}

fn transfer_move_to_local(stats: &mut HeapStats, kind: Kind, extra: usize) {
    stats.account_free(kind, extra);
    heap::account_alloc(kind, extra);
}

/// Refuse graphs that cannot travel between instances.
fn ensure_movable(v: &Variant) -> Result<(), Error> {
    match v {
        Variant::Dynamic(_) | Variant::Native(_) => Err(set_last_error(Error::NotSupported)),
        Variant::Object(d) => {
            for (_, child) in d.borrow().entries_cloned() {
                ensure_movable(&child)?;
            }
            Ok(())
        }
        Variant::Array(d) => {
            for child in d.borrow().elements_cloned() {
                ensure_movable(&child)?;
            }
            Ok(())
        }
        Variant::Set(d) => {
            for child in d.borrow().members_insertion() {
                ensure_movable(&child)?;
            }
            Ok(())
        }
        Variant::Tuple(d) => {
            for child in d.borrow().members_cloned() {
                ensure_movable(&child)?;
            }
            Ok(())
        }
        Variant::SortedArray(d) => {
            let data = d.borrow();
            if sorted::has_custom_cmp(&data) {
                return Err(set_last_error(Error::NotSupported));
            }
            for child in data.elements_cloned() {
                ensure_movable(&child)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Migrate one owned handle: move exclusively-owned immutables, clone
/// shared ones, rebuild containers from migrated children. Every node's
/// accounting shifts from the local heap to the move heap.
fn strip_and_own(v: Variant, stats: &mut HeapStats) -> Variant {
    match v {
        Variant::String(d) => {
            if Rc::strong_count(&d) == 1 {
                transfer_local_to_move(stats, Kind::String, d.extra_size());
                Variant::String(d)
            } else {
                let cloned = Variant::string(d.as_str());
                if let Variant::String(nd) = &cloned {
                    transfer_local_to_move(stats, Kind::String, nd.extra_size());
                }
                cloned
            }
        }
        Variant::ByteSeq(d) => {
            if Rc::strong_count(&d) == 1 {
                transfer_local_to_move(stats, Kind::ByteSeq, d.extra_size());
                Variant::ByteSeq(d)
            } else {
                let cloned = Variant::byte_seq(d.as_bytes());
                if let Variant::ByteSeq(nd) = &cloned {
                    transfer_local_to_move(stats, Kind::ByteSeq, nd.extra_size());
                }
                cloned
            }
        }
        Variant::BigInt(d) => {
            if Rc::strong_count(&d) == 1 {
                transfer_local_to_move(stats, Kind::BigInt, d.extra_size());
                Variant::BigInt(d)
            } else {
                let cloned = Variant::bigint(d.value().clone());
                if let Variant::BigInt(nd) = &cloned {
                    transfer_local_to_move(stats, Kind::BigInt, nd.extra_size());
                }
                cloned
            }
        }
        Variant::Object(d) => {
            let entries = d.borrow().entries_cloned();
            drop(d);
            let mut pairs = Vec::with_capacity(entries.len());
            for (k, child) in entries {
                // re-key so no string allocation is shared with the source
                pairs.push((Rc::from(&*k), strip_and_own(child, stats)));
            }
            let out = object::make_plain(pairs);
            transfer_local_to_move(stats, Kind::Object, 0);
            out
        }
        Variant::Array(d) => {
            let elems = d.borrow().elements_cloned();
            drop(d);
            let migrated: Vec<Variant> = elems
                .into_iter()
                .map(|c| strip_and_own(c, stats))
                .collect();
            let out = array::make_plain(migrated);
            transfer_local_to_move(stats, Kind::Array, 0);
            out
        }
        Variant::Set(d) => {
            let (keyspec, members) = {
                let b = d.borrow();
                (b.keyspec_cloned(), b.members_insertion())
            };
            drop(d);
            let keyspec =
                keyspec.map(|ks| ks.iter().map(|k| Rc::from(&**k)).collect::<Vec<Rc<str>>>());
            let migrated: Vec<Variant> = members
                .into_iter()
                .map(|c| strip_and_own(c, stats))
                .collect();
            let out = set::make_plain(keyspec, migrated)
                .expect("members of a valid set cannot collide");
            transfer_local_to_move(stats, Kind::Set, 0);
            out
        }
        Variant::Tuple(d) => {
            let members = d.borrow().members_cloned();
            drop(d);
            let migrated: Vec<Variant> = members
                .into_iter()
                .map(|c| strip_and_own(c, stats))
                .collect();
            let out = tuple::make_plain(migrated);
            transfer_local_to_move(stats, Kind::Tuple, 0);
            out
        }
        Variant::SortedArray(d) => {
            let (flags, elems) = {
                let b = d.borrow();
                (sorted::sorted_flags(&b), b.elements_cloned())
            };
            drop(d);
            let migrated: Vec<Variant> = elems
                .into_iter()
                .map(|c| strip_and_own(c, stats))
                .collect();
            let out = sorted::make_plain(flags, None, migrated);
            transfer_local_to_move(stats, Kind::SortedArray, 0);
            out
        }
        // scalars are inline; nothing to account
        other => other,
    }
}

/// Rebuild the internal reverse-update edges of a migrated graph.
fn rebind_edges(v: &Variant) {
    match v {
        Variant::Object(d) => {
            revise::bind_children(v);
            for (_, child) in d.borrow().entries_cloned() {
                rebind_edges(&child);
            }
        }
        Variant::Array(d) => {
            revise::bind_children(v);
            for child in d.borrow().elements_cloned() {
                rebind_edges(&child);
            }
        }
        Variant::Tuple(d) => {
            revise::bind_children(v);
            for child in d.borrow().members_cloned() {
                rebind_edges(&child);
            }
        }
        Variant::Set(d) => {
            set::rebind_member_edges(v);
            for child in d.borrow().members_insertion() {
                rebind_edges(&child);
            }
        }
        Variant::SortedArray(d) => {
            for child in d.borrow().elements_cloned() {
                rebind_edges(&child);
            }
        }
        _ => {}
    }
}

/// Account every allocated node of a staged graph back into the current
/// thread's heap.
fn reown(v: &Variant, stats: &mut HeapStats) {
    match v {
        Variant::String(d) => transfer_move_to_local(stats, Kind::String, d.extra_size()),
        Variant::ByteSeq(d) => transfer_move_to_local(stats, Kind::ByteSeq, d.extra_size()),
        Variant::BigInt(d) => transfer_move_to_local(stats, Kind::BigInt, d.extra_size()),
        Variant::Object(d) => {
            transfer_move_to_local(stats, Kind::Object, 0);
            for (_, child) in d.borrow().entries_cloned() {
                reown(&child, stats);
            }
        }
        Variant::Array(d) => {
            transfer_move_to_local(stats, Kind::Array, 0);
            for child in d.borrow().elements_cloned() {
                reown(&child, stats);
            }
        }
        Variant::Set(d) => {
            transfer_move_to_local(stats, Kind::Set, 0);
            for child in d.borrow().members_insertion() {
                reown(&child, stats);
            }
        }
        Variant::Tuple(d) => {
            transfer_move_to_local(stats, Kind::Tuple, 0);
            for child in d.borrow().members_cloned() {
                reown(&child, stats);
            }
        }
        Variant::SortedArray(d) => {
            transfer_move_to_local(stats, Kind::SortedArray, 0);
            for child in d.borrow().elements_cloned() {
                reown(&child, stats);
            }
        }
        _ => {}
    }
}

/// Migrate `v` into the move heap, consuming the caller's handle.
pub fn move_in(v: Variant) -> Result<MovedVariant, Error> {
    ensure_movable(&v)?;
    let mut stats = MOVE_HEAP.lock().unwrap();
    let owned = strip_and_own(v, &mut stats);
    drop(stats);
    rebind_edges(&owned);
    Ok(MovedVariant { inner: Some(owned) })
}

/// Re-own a staged graph into the calling thread's heap.
pub fn move_out(mut mv: MovedVariant) -> Variant {
    let v = mv.inner.take().expect("staged graph present until moved out");
    let mut stats = MOVE_HEAP.lock().unwrap();
    reown(&v, &mut stats);
    v
}

impl Drop for MovedVariant {
    fn drop(&mut self) {
        if let Some(v) = self.inner.take() {
            let mut stats = MOVE_HEAP.lock().unwrap();
            reown(&v, &mut stats);
            // v now drops against the local heap, which just absorbed it
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn sample() -> Variant {
        // {a: [1, 2, {b: true}]}
        let inner = Variant::object();
        inner.object_set("b", Variant::boolean(true)).unwrap();
        let arr = Variant::array_from([Variant::longint(1), Variant::longint(2), inner]);
        let obj = Variant::object();
        obj.object_set("a", arr).unwrap();
        obj
    }

    #[test]
    #[serial]
    fn test_move_round_trip_same_thread() {
        let local_before = heap::stats();
        let original = sample();
        let copy = original.clone_container(true).unwrap();

        let staged = move_in(original).unwrap();
        let back = move_out(staged);
        assert!(back.equals(&copy));

        drop(back);
        drop(copy);
        assert_eq!(heap::stats(), local_before);
        assert!(move_heap_stats().is_consistent());
    }

    #[test]
    #[serial]
    fn test_move_across_threads() {
        let original = sample();
        let copy = original.clone_container(true).unwrap();

        let staged = move_in(original).unwrap();
        let handle = std::thread::spawn(move || {
            let v = move_out(staged);
            // the receiving side owns a fully functional graph
            let arr = v.object_get("a").unwrap().unwrap();
            arr.array_append(Variant::longint(3)).unwrap();
            assert_eq!(arr.array_size().unwrap(), 4);
            // send it home
            move_in(v).unwrap()
        });
        let staged_back = handle.join().unwrap();
        let v = move_out(staged_back);

        let arr = v.object_get("a").unwrap().unwrap();
        assert_eq!(arr.array_size().unwrap(), 4);
        // the first three elements are still the original content
        assert!(arr.array_get(0).unwrap().equals(&Variant::longint(1)));
        assert!(!v.equals(&copy)); // it grew on the other side
    }

    #[test]
    #[serial]
    fn test_shared_payload_is_cloned() {
        let shared = Variant::string("shared payload that is long enough to allocate");
        let obj = Variant::object();
        obj.object_set("s", shared.clone()).unwrap();

        let staged = move_in(obj).unwrap();
        // the outside holder still reads its payload
        assert_eq!(
            shared.as_str().unwrap(),
            "shared payload that is long enough to allocate"
        );
        let back = move_out(staged);
        let inner = back.object_get("s").unwrap().unwrap();
        assert!(inner.equals(&shared));
        // but the payload is a distinct allocation now
        assert_ne!(inner.ptr_id(), shared.ptr_id());
    }

    #[test]
    #[serial]
    fn test_native_refused() {
        struct NopOps;
        impl crate::variant::NativeOps for NopOps {
            fn property_getter(&self, _name: &str) -> Option<crate::variant::NativeMethod> {
                None
            }
        }
        let obj = Variant::object();
        obj.object_set("n", Variant::native("nop", Rc::new(NopOps)))
            .unwrap();
        assert!(move_in(obj).is_err());
    }

    #[test]
    #[serial]
    fn test_dropped_ticket_balances_ledgers() {
        let move_before = move_heap_stats().nr_total_values;
        let local_before = heap::stats();
        let staged = move_in(sample()).unwrap();
        assert!(move_heap_stats().nr_total_values > move_before);
        drop(staged);
        assert_eq!(move_heap_stats().nr_total_values, move_before);
        assert_eq!(heap::stats(), local_before);
    }

    #[test]
    #[serial]
    fn test_set_survives_migration() {
        let s = Variant::set(Some(&["id"]));
        for id in ["x", "y"] {
            let o = Variant::object();
            o.object_set("id", Variant::string(id)).unwrap();
            s.set_add(o, false).unwrap();
        }
        let staged = move_in(s).unwrap();
        let handle = std::thread::spawn(move || {
            let s = move_out(staged);
            // uniqueness machinery still works after migration
            let dup = Variant::object();
            dup.object_set("id", Variant::string("x")).unwrap();
            assert_eq!(s.set_add(dup, false), Err(Error::Duplicated));
            assert_eq!(s.set_size().unwrap(), 2);
        });
        handle.join().unwrap();
    }
}
