//! End-to-end tests of the reverse-update machinery: deep mutations under
//! unique-by-key collections, veto on would-be collisions, and ledger
//! invariants across mixed workloads.

use vellum_core::{heap_stats, numerify, ChangeOp, Error, Variant};

fn member(id: &str, v: i64) -> Variant {
    let o = Variant::object();
    o.object_set("id", Variant::string(id)).unwrap();
    o.object_set("v", Variant::longint(v)).unwrap();
    o
}

#[test]
fn test_fingerprint_veto_direct() {
    let s = Variant::set(Some(&["id"]));
    s.set_add(member("x", 1), false).unwrap();
    s.set_add(member("y", 2), false).unwrap();

    let y = s.set_find(&member("y", 0)).unwrap().unwrap();

    // mutating y's id to collide with x must be refused
    assert_eq!(
        y.object_set("id", Variant::string("x")),
        Err(Error::Duplicated)
    );

    // the set still holds two members and y is untouched
    assert_eq!(s.set_size().unwrap(), 2);
    assert_eq!(
        y.object_get("id").unwrap().unwrap().as_str().unwrap(),
        "y"
    );
}

#[test]
fn test_fingerprint_move_commits() {
    let s = Variant::set(Some(&["id"]));
    s.set_add(member("x", 1), false).unwrap();
    s.set_add(member("y", 2), false).unwrap();

    let y = s.set_find(&member("y", 0)).unwrap().unwrap();
    y.object_set("id", Variant::string("z")).unwrap();

    assert_eq!(s.set_size().unwrap(), 2);
    assert!(s.set_find(&member("z", 0)).unwrap().is_some());
    assert!(s.set_find(&member("y", 0)).unwrap().is_none());

    // the moved member is addressable under its new fingerprint
    assert_eq!(s.set_remove(&member("z", 0)).is_ok(), true);
    assert_eq!(s.set_size().unwrap(), 1);
}

#[test]
fn test_by_self_deep_mutation_veto() {
    // members are keyed by themselves; a deep descendant mutation that
    // makes two members equal must be refused
    let s = Variant::set(None);
    let a = Variant::object();
    a.object_set("k", Variant::longint(1)).unwrap();
    let b = Variant::object();
    b.object_set("k", Variant::longint(2)).unwrap();
    s.set_add(a.clone(), false).unwrap();
    s.set_add(b.clone(), false).unwrap();

    assert_eq!(b.object_set("k", Variant::longint(1)), Err(Error::Duplicated));
    assert_eq!(
        b.object_get("k").unwrap().unwrap().cast_to_i64(false).unwrap(),
        2
    );

    // a non-colliding deep mutation commits and reindexes
    b.object_set("k", Variant::longint(7)).unwrap();
    assert!(s.set_contains(&b).unwrap());
    assert_eq!(s.set_size().unwrap(), 2);
}

#[test]
fn test_grandchild_mutation_routes_to_set() {
    // set keyed by itself, member contains a nested array: mutating the
    // nested array changes the member's fingerprint
    let s = Variant::set(None);
    let m1 = Variant::object();
    m1.object_set("xs", Variant::array_from([Variant::longint(1)]))
        .unwrap();
    let m2 = Variant::object();
    m2.object_set("xs", Variant::array_from([Variant::longint(2)]))
        .unwrap();
    s.set_add(m1.clone(), false).unwrap();
    s.set_add(m2.clone(), false).unwrap();

    let xs2 = m2.object_get("xs").unwrap().unwrap();

    // making m2 deep-equal to m1 must be refused
    assert_eq!(xs2.array_set(0, Variant::longint(1)), Err(Error::Duplicated));
    assert!(xs2.array_get(0).unwrap().equals(&Variant::longint(2)));

    // a distinct value commits
    xs2.array_set(0, Variant::longint(3)).unwrap();
    assert!(s.set_contains(&m2).unwrap());
}

#[test]
fn test_shared_child_under_two_sets() {
    // one object reachable from two sets: a mutation must satisfy both
    let s1 = Variant::set(Some(&["id"]));
    let s2 = Variant::set(Some(&["id"]));

    let shared = member("a", 1);
    s1.set_add(shared.clone(), false).unwrap();
    s2.set_add(shared.clone(), false).unwrap();
    s1.set_add(member("b", 2), false).unwrap();

    // "b" collides in s1 but not in s2; the mutation must be refused
    assert_eq!(
        shared.object_set("id", Variant::string("b")),
        Err(Error::Duplicated)
    );
    assert_eq!(
        shared.object_get("id").unwrap().unwrap().as_str().unwrap(),
        "a"
    );

    // "c" collides nowhere
    shared.object_set("id", Variant::string("c")).unwrap();
    assert!(s1.set_find(&member("c", 0)).unwrap().is_some());
    assert!(s2.set_find(&member("c", 0)).unwrap().is_some());
}

#[test]
fn test_uniqueness_survives_random_mutations() {
    let s = Variant::set(Some(&["id"]));
    let mut members = Vec::new();
    for i in 0..8 {
        let m = member(&format!("m{i}"), i);
        s.set_add(m.clone(), false).unwrap();
        members.push(m);
    }

    // drive a batch of renames, some colliding, some not
    let mut seed = 0x9e3779b9u64;
    for step in 0..200 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let who = (seed >> 33) as usize % members.len();
        let target = format!("m{}", step % 12);
        let _ = members[who].object_set("id", Variant::string(&target));

        // after every step, every pair of members differs in fingerprint
        let ids: Vec<String> = s
            .set_members()
            .unwrap()
            .iter()
            .map(|m| {
                m.object_get("id")
                    .unwrap()
                    .unwrap()
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        let mut dedup = ids.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), ids.len(), "duplicate ids after step {step}");
        assert_eq!(ids.len(), 8);
    }
}

#[test]
fn test_listener_sees_committed_state() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let s = Variant::set(Some(&["id"]));
    let observed: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(vec![]));
    let observed2 = observed.clone();
    vellum_core::register_post_listener(
        &s,
        &[ChangeOp::Grow],
        Box::new(move |set, _, _| {
            observed2.borrow_mut().push(set.set_size().unwrap());
        }),
    )
    .unwrap();

    s.set_add(member("a", 1), false).unwrap();
    s.set_add(member("b", 2), false).unwrap();
    assert_eq!(*observed.borrow(), vec![1, 2]);
}

#[test]
fn test_heap_consistency_through_workload() {
    let before = heap_stats();
    {
        let s = Variant::set(Some(&["id"]));
        for i in 0..16 {
            s.set_add(member(&format!("id{i}"), i), false).unwrap();
        }
        for i in (0..16).step_by(2) {
            s.set_remove(&member(&format!("id{i}"), 0)).unwrap();
        }
        assert!(heap_stats().is_consistent());
        assert_eq!(numerify(&s), (1..16).step_by(2).sum::<i64>() as f64);
    }
    assert_eq!(heap_stats(), before);
    assert!(heap_stats().is_consistent());
}
