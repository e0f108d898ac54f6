//! Property tests for finalization
//!
//! Random attach, share and clear sequences over a committed root, checking
//! the ownership tree and the write log after every transaction.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use realmvm_foundation::{ObjectId, ObjectRef, TypedValue};
use realmvm_realm::{Realm, RealmOp};
use realmvm_storage::{MemBackend, Store};

use crate::common::{PATH, attach, commit, committed_root, detach, obj_value, store};

const SLOTS: usize = 4;

#[derive(Clone, Debug)]
enum Action {
    Attach(usize),
    AttachGraph(usize),
    Share(usize, usize),
    Clear(usize),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0..SLOTS).prop_map(Action::Attach),
        (0..SLOTS).prop_map(Action::AttachGraph),
        (0..SLOTS, 0..SLOTS).prop_map(|(from, to)| Action::Share(from, to)),
        (0..SLOTS).prop_map(Action::Clear),
    ]
}

fn transactions() -> impl Strategy<Value = Vec<Vec<Action>>> {
    prop::collection::vec(prop::collection::vec(action(), 1..6), 1..5)
}

/// Interior objects of a graph hung off one top-level struct.
struct Graph {
    top: ObjectRef,
    /// Held by the top and by `c`.
    b: ObjectRef,
    /// Held by the top only.
    c: ObjectRef,
    /// Held by `b` and `c`.
    d: ObjectRef,
}

/// `top -> {b, c}`, `b -> d`, `c -> {d, b}`: a diamond on `d` plus a
/// second path into `b`.
fn graph(tag: i64) -> Graph {
    let d = ObjectRef::heap_item(TypedValue::int(tag));
    let b = ObjectRef::structure(vec![obj_value(&d)]);
    let c = ObjectRef::structure(vec![obj_value(&d), obj_value(&b)]);
    let top = ObjectRef::structure(vec![obj_value(&b), obj_value(&c)]);
    Graph { top, b, c, d }
}

fn references(slots: &[Option<ObjectRef>], o: &ObjectRef) -> usize {
    slots
        .iter()
        .flatten()
        .filter(|held| held.ptr_eq(o))
        .count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn finalization_keeps_the_tree_consistent(txs in transactions()) {
        let backend = Arc::new(MemBackend::new());
        let mut st = store(&backend);
        let mut rlm = Realm::new(PATH).with_op_log();
        let root = committed_root(&mut rlm, &mut st, SLOTS);
        let mut slots: Vec<Option<ObjectRef>> = vec![None; SLOTS];
        let mut seen: Vec<ObjectRef> = Vec::new();
        let mut graphs: Vec<Graph> = Vec::new();
        let mut committed: HashSet<ObjectId> = HashSet::from([root.id()]);

        for tx in txs {
            for a in tx {
                match a {
                    Action::Attach(to) => {
                        let o = ObjectRef::heap_item(TypedValue::int(seen.len() as i64));
                        attach(&mut rlm, &root, to, &o);
                        slots[to] = Some(o.clone());
                        seen.push(o);
                    }
                    Action::AttachGraph(to) => {
                        let g = graph(seen.len() as i64);
                        attach(&mut rlm, &root, to, &g.top);
                        slots[to] = Some(g.top.clone());
                        seen.push(g.top.clone());
                        graphs.push(g);
                    }
                    Action::Share(from, to) => {
                        let Some(o) = slots[from].clone() else { continue };
                        if slots[to].as_ref().is_some_and(|held| held.ptr_eq(&o)) {
                            continue;
                        }
                        attach(&mut rlm, &root, to, &o);
                        slots[to] = Some(o);
                    }
                    Action::Clear(at) => {
                        if slots[at].take().is_some() {
                            detach(&mut rlm, &root, at);
                        }
                    }
                }
            }
            let summary = commit(&mut rlm, &mut st);
            let log = rlm.take_op_log();

            // Each object is written at most once, new objects as New and
            // objects from earlier transactions as Mod.
            let mut written = HashSet::new();
            let mut mods = 0;
            for op in &log {
                match op {
                    RealmOp::New(id) => {
                        prop_assert!(written.insert(*id), "{} written twice", id);
                        prop_assert!(!committed.contains(id));
                    }
                    RealmOp::Mod(id) => {
                        prop_assert!(written.insert(*id), "{} written twice", id);
                        prop_assert!(committed.contains(id));
                        mods += 1;
                    }
                    RealmOp::Del(_) => {}
                }
            }
            prop_assert_eq!(summary.updated, mods);
            for op in &log {
                match op {
                    RealmOp::New(id) => {
                        committed.insert(*id);
                    }
                    RealmOp::Del(id) => {
                        committed.remove(id);
                    }
                    RealmOp::Mod(_) => {}
                }
            }

            prop_assert!(rlm.mark_counts().is_empty());
            prop_assert!(!root.is_dirty());
            for o in &seen {
                let refs = references(&slots, o);
                if refs > 0 {
                    prop_assert!(o.is_real());
                    prop_assert!(!o.is_deleted());
                    prop_assert!(!o.is_new_real() && !o.is_dirty());
                    prop_assert_eq!(o.ref_count(), refs as i64);
                    prop_assert!(st.has_object(o.id()).unwrap());
                    if refs > 1 {
                        prop_assert!(o.is_escaped());
                    }
                    if o.is_escaped() {
                        prop_assert!(o.owner_id().is_zero());
                    } else {
                        prop_assert!(o.owner().is_some_and(|p| p.ptr_eq(&root)));
                    }
                } else if o.is_real() {
                    prop_assert!(o.is_deleted());
                    prop_assert!(!st.has_object(o.id()).unwrap());
                }
            }
            for g in &graphs {
                let interior = [&g.b, &g.c, &g.d];
                if references(&slots, &g.top) > 0 {
                    for o in interior {
                        prop_assert!(o.is_real() && !o.is_deleted());
                        prop_assert!(!o.is_new_real() && !o.is_dirty());
                        prop_assert!(st.has_object(o.id()).unwrap());
                    }
                    prop_assert_eq!(g.b.ref_count(), 2);
                    prop_assert_eq!(g.d.ref_count(), 2);
                    prop_assert!(g.b.is_escaped() && g.d.is_escaped());
                    prop_assert_eq!(g.c.ref_count(), 1);
                    prop_assert!(g.c.owner().is_some_and(|p| p.ptr_eq(&g.top)));
                } else if g.top.is_real() {
                    for o in interior {
                        prop_assert!(o.is_deleted());
                        prop_assert!(!st.has_object(o.id()).unwrap());
                    }
                } else {
                    prop_assert!(interior.iter().all(|o| !o.is_real()));
                }
            }
        }
    }
}
