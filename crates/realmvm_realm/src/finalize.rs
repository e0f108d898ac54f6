//! Transaction finalization.
//!
//! Turns the marks collected by [`Realm::did_update`] into store writes:
//!
//! 1. newly reachable objects get ids and their descendants are counted
//! 2. objects whose count stayed zero are deleted with their descendants
//! 3. multiply referenced objects are detached from their owner
//! 4. owners of modified objects are marked dirty up to the nearest
//!    already dirty, escaped or package ancestor
//! 5. created and dirty objects are saved, children before parents
//! 6. deleted objects are removed
//! 7. marks are cleared
//!
//! Every traversal uses an explicit work stack so deep object graphs cannot
//! exhaust the native stack.

#![allow(clippy::module_name_repetitions)]

use std::collections::HashSet;

use tracing::{debug, trace};

use realmvm_foundation::{Error, ErrorKind, ObjectRef, Result, Value};
use realmvm_storage::Store;

use crate::realm::{Realm, RealmOp};

/// Counts of what one finalization persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FinalizeSummary {
    /// Objects given an id.
    pub created: usize,
    /// Existing objects rewritten.
    pub updated: usize,
    /// Objects removed.
    pub deleted: usize,
    /// Objects that became escaped.
    pub escaped: usize,
}

impl FinalizeSummary {
    /// True if nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Objects directly referenced by `oo`, loading unloaded references.
fn child_objects(store: &mut dyn Store, oo: &ObjectRef) -> Result<Vec<ObjectRef>> {
    let mut children = Vec::new();
    for v in oo.child_values() {
        match v {
            Value::Object(o) => children.push(o),
            Value::Pointer(p) => children.push(p.base),
            Value::Slice(s) => children.push(s.base_object()),
            Value::Ref(r) => children.push(store.get_object(r.object_id)?),
            _ => {}
        }
    }
    Ok(children)
}

/// Loaded children that still need saving.
fn unsaved_child_objects(oo: &ObjectRef) -> Vec<ObjectRef> {
    oo.child_values()
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(o) => Some(o),
            Value::Pointer(p) => Some(p.base),
            Value::Slice(s) => Some(s.base_object()),
            _ => None,
        })
        .filter(|o| o.is_new_real() || o.is_dirty())
        .collect()
}

/// Live owner, loading it by id when only the id is known.
fn get_owner(store: &mut dyn Store, oo: &ObjectRef) -> Result<Option<ObjectRef>> {
    if let Some(po) = oo.owner() {
        return Ok(Some(po));
    }
    let owner_id = oo.owner_id();
    if owner_id.is_zero() {
        return Ok(None);
    }
    let po = store.get_object(owner_id)?;
    oo.set_owner(Some(&po));
    Ok(Some(po))
}

struct CreateFrame {
    obj: ObjectRef,
    children: Vec<ObjectRef>,
    next: usize,
}

impl Realm {
    /// Persists every change of the transaction and clears all marks.
    ///
    /// With `read_only` set, any pending mark fails the transaction instead;
    /// the caller is expected to discard the store.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnlyViolation` for mutations under `read_only`, and
    /// persistence or store errors on inconsistent bookkeeping.
    pub fn finalize(&mut self, store: &mut dyn Store, read_only: bool) -> Result<FinalizeSummary> {
        if read_only {
            let counts = self.mark_counts();
            if !counts.is_empty() {
                self.clear_marks();
                return Err(Error::new(ErrorKind::ReadOnlyViolation(format!(
                    "realm {} modified {} object(s) and created {}",
                    self.path(),
                    counts.updated,
                    counts.new_created
                ))));
            }
            return Ok(FinalizeSummary::default());
        }

        self.process_new_created_marks(store)?;
        self.process_new_deleted_marks(store)?;
        self.process_new_escaped_marks(store)?;
        self.mark_dirty_ancestors(store)?;
        let updated = self.save_unsaved_objects(store)?;
        self.remove_deleted_objects(store)?;

        let summary = FinalizeSummary {
            created: self.created.len(),
            updated,
            deleted: self.deleted.len(),
            escaped: self.escaped.len(),
        };
        self.clear_marks();
        if !summary.is_empty() {
            debug!(realm = %self.path(), time = self.time(), ?summary, "finalized realm");
        }
        Ok(summary)
    }

    // =========================================================================
    // Stage 1: created
    // =========================================================================

    fn process_new_created_marks(&mut self, store: &mut dyn Store) -> Result<()> {
        let marked = std::mem::take(&mut self.new_created);
        for oo in &marked {
            if oo.ref_count() == 0 {
                // Attached and detached again within the transaction.
                continue;
            }
            self.inc_ref_created_descendants(store, oo, false)?;
        }
        self.new_created = marked;
        if !self.created.is_empty() {
            store.set_realm_record(&self.record())?;
        }
        Ok(())
    }

    /// Assigns ids to `root` and its newly reachable descendants, counting
    /// the references they hold.
    fn inc_ref_created_descendants(
        &mut self,
        store: &mut dyn Store,
        root: &ObjectRef,
        mark_new_real: bool,
    ) -> Result<()> {
        let mut stack = Vec::new();
        if let Some(frame) = self.enter_created(store, root, mark_new_real)? {
            stack.push(frame);
        }
        while let Some(frame) = stack.last_mut() {
            let Some(child) = frame.children.get(frame.next).cloned() else {
                stack.pop();
                continue;
            };
            frame.next += 1;
            let parent = frame.obj.clone();

            if let ObjectRef::Package(_) = child {
                continue;
            }
            let rc = child.inc_ref_count();
            if rc == 1 {
                child.set_owner(Some(&parent));
                if child.is_real() {
                    // Deleted earlier in the transaction, attached again.
                    self.mark_dirty(&child)?;
                } else if let Some(frame) = self.enter_created(store, &child, true)? {
                    stack.push(frame);
                }
            } else if rc > 1 {
                if child.is_real() || child.is_new_real() {
                    self.mark_dirty(&child)?;
                }
                if !child.is_escaped() {
                    self.mark_new_escaped(&child)?;
                }
            }
        }
        Ok(())
    }

    fn enter_created(
        &mut self,
        store: &mut dyn Store,
        oo: &ObjectRef,
        mark_new_real: bool,
    ) -> Result<Option<CreateFrame>> {
        if oo.is_real() {
            if mark_new_real {
                oo.set_is_new_real(true);
            }
            return Ok(None);
        }
        let id = self.assign_new_object_id(oo)?;
        trace!(%id, kind = oo.kind_name(), "created object");
        // Flagged before its descendants are walked, so a back edge to it
        // does not mark it dirty.
        if mark_new_real {
            oo.set_is_new_real(true);
        }
        self.created.push(oo.clone());
        Ok(Some(CreateFrame {
            obj: oo.clone(),
            children: child_objects(store, oo)?,
            next: 0,
        }))
    }

    // =========================================================================
    // Stage 2: deleted
    // =========================================================================

    fn process_new_deleted_marks(&mut self, store: &mut dyn Store) -> Result<()> {
        let marked = std::mem::take(&mut self.new_deleted);
        for oo in &marked {
            if oo.ref_count() > 0 {
                oo.set_is_new_deleted(false);
            } else {
                self.dec_ref_deleted_descendants(store, oo)?;
            }
        }
        self.new_deleted = marked;
        Ok(())
    }

    fn dec_ref_deleted_descendants(&mut self, store: &mut dyn Store, root: &ObjectRef) -> Result<()> {
        let mut work = vec![root.clone()];
        while let Some(oo) = work.pop() {
            if oo.is_deleted() {
                continue;
            }
            oo.set_is_new_deleted(false);
            oo.set_is_new_real(false);
            oo.set_is_new_escaped(false);
            oo.set_is_deleted(true, self.time());
            trace!(id = %oo.id(), kind = oo.kind_name(), "deleted object");
            self.deleted.push(oo.clone());

            for child in child_objects(store, &oo)? {
                if let ObjectRef::Package(_) = child {
                    continue;
                }
                if child.dec_ref_count()? == 0 {
                    work.push(child);
                } else {
                    self.mark_dirty(&child)?;
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Stage 3: escaped
    // =========================================================================

    fn process_new_escaped_marks(&mut self, store: &mut dyn Store) -> Result<()> {
        let mut i = 0;
        // Creating an escaped object may mark further objects escaped.
        while let Some(eo) = self.new_escaped.get(i).cloned() {
            i += 1;
            if eo.is_deleted() {
                continue;
            }
            if eo.ref_count() <= 1 {
                eo.set_is_new_escaped(false);
                continue;
            }
            if !eo.is_real() {
                self.inc_ref_created_descendants(store, &eo, true)?;
            }
            self.escaped.push(eo.clone());
            if let Some(po) = get_owner(store, &eo)? {
                if po.ref_count() > 0 && !po.is_new_real() && !po.is_deleted() {
                    self.mark_dirty(&po)?;
                }
            }
            eo.set_owner(None);
        }
        Ok(())
    }

    // =========================================================================
    // Stage 4: ancestors
    // =========================================================================

    fn mark_dirty_ancestors(&mut self, store: &mut dyn Store) -> Result<()> {
        let starts: Vec<ObjectRef> = self
            .updated
            .iter()
            .chain(self.created.iter())
            .filter(|o| !o.is_deleted())
            .cloned()
            .collect();
        for start in starts {
            let mut oo = start;
            loop {
                if let ObjectRef::Package(_) = oo {
                    break;
                }
                if oo.ref_count() > 1 || oo.is_escaped() {
                    break;
                }
                let Some(po) = get_owner(store, &oo)? else {
                    break;
                };
                if po.is_new_real() || po.is_dirty() || po.is_deleted() {
                    break;
                }
                self.mark_dirty(&po)?;
                oo = po;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Stage 5: save
    // =========================================================================

    /// Saves created and dirty objects; returns how many existing objects
    /// were rewritten.
    fn save_unsaved_objects(&mut self, store: &mut dyn Store) -> Result<usize> {
        let mut updated = 0;
        for oo in self.created.clone() {
            if oo.is_new_real() && !oo.is_deleted() {
                updated += self.save_unsaved_object_recursively(store, &oo)?;
            }
        }
        for oo in self.updated.clone() {
            if oo.is_dirty() && !oo.is_deleted() {
                updated += self.save_unsaved_object_recursively(store, &oo)?;
            }
        }
        Ok(updated)
    }

    /// Saves `root` after its unsaved owned children, so each parent image
    /// carries the final hashes of its children.
    fn save_unsaved_object_recursively(
        &mut self,
        store: &mut dyn Store,
        root: &ObjectRef,
    ) -> Result<usize> {
        let mut updated = 0;
        let mut visiting = HashSet::new();
        let mut stack: Vec<(ObjectRef, Vec<ObjectRef>, usize)> = Vec::new();
        visiting.insert(root.addr());
        stack.push((root.clone(), unsaved_child_objects(root), 0));

        while let Some((obj, children, next)) = stack.last_mut() {
            if let Some(child) = children.get(*next).cloned() {
                *next += 1;
                if child.is_escaped() || child.is_new_escaped() {
                    // Saved on its own from the created or updated list.
                    continue;
                }
                if !(child.is_new_real() || child.is_dirty()) || !visiting.insert(child.addr()) {
                    continue;
                }
                let grandchildren = unsaved_child_objects(&child);
                stack.push((child, grandchildren, 0));
                continue;
            }
            let obj = obj.clone();
            stack.pop();
            if !(obj.is_new_real() || obj.is_dirty()) {
                continue;
            }
            if obj.is_new_real() && obj.is_dirty() {
                return Err(Error::persistence(format!(
                    "{} {} is both new real and dirty",
                    obj.kind_name(),
                    obj.id()
                )));
            }
            if obj.is_new_real() {
                self.save_object(store, &obj, true)?;
                obj.set_is_new_real(false);
            } else {
                self.save_object(store, &obj, false)?;
                obj.set_is_dirty(false, 0);
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn save_object(&mut self, store: &mut dyn Store, oo: &ObjectRef, created: bool) -> Result<()> {
        if oo.is_new_escaped() {
            oo.set_is_new_escaped(false);
            oo.set_is_escaped(true);
            oo.set_owner(None);
        }
        store.set_object(oo)?;
        if let ObjectRef::Package(_) = oo {
            store.set_package(oo)?;
        }
        let id = oo.id();
        self.log(if created {
            RealmOp::New(id)
        } else {
            RealmOp::Mod(id)
        });
        Ok(())
    }

    // =========================================================================
    // Stage 6: remove
    // =========================================================================

    fn remove_deleted_objects(&mut self, store: &mut dyn Store) -> Result<()> {
        for oo in self.deleted.clone() {
            store.del_object(&oo)?;
            self.log(RealmOp::Del(oo.id()));
        }
        Ok(())
    }
}
