//! Realm state and the ownership hooks called on every durable mutation.
//!
//! A realm owns the objects created under its package path. Between
//! transactions it only remembers its creation counter; during a transaction
//! it collects marks (new-real, dirty, new-deleted, new-escaped) that
//! [`Realm::finalize`](crate::finalize) turns into store writes.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use realmvm_foundation::{Error, ObjectId, ObjectRef, PkgId, Result};
use realmvm_storage::RealmRecord;

/// One persisted change, recorded when the operation log is enabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RealmOp {
    /// Object created.
    New(ObjectId),
    /// Object updated.
    Mod(ObjectId),
    /// Object deleted.
    Del(ObjectId),
}

/// Sizes of the mark buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MarkCounts {
    /// Objects that became reachable from a real owner.
    pub new_created: usize,
    /// Real objects whose count reached zero.
    pub new_deleted: usize,
    /// Objects that became multiply referenced.
    pub new_escaped: usize,
    /// Objects assigned an id during finalization.
    pub created: usize,
    /// Real objects modified.
    pub updated: usize,
    /// Real objects finalized as deleted.
    pub deleted: usize,
    /// Objects finalized as escaped.
    pub escaped: usize,
}

impl MarkCounts {
    /// True if every buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Ownership and persistence context of one realm package.
pub struct Realm {
    id: PkgId,
    path: Arc<str>,
    time: u64,

    pub(crate) new_created: Vec<ObjectRef>,
    pub(crate) new_deleted: Vec<ObjectRef>,
    pub(crate) new_escaped: Vec<ObjectRef>,

    pub(crate) created: Vec<ObjectRef>,
    pub(crate) updated: Vec<ObjectRef>,
    pub(crate) deleted: Vec<ObjectRef>,
    pub(crate) escaped: Vec<ObjectRef>,

    op_log: Option<Vec<RealmOp>>,
}

impl Realm {
    /// Creates a realm with counter zero.
    #[must_use]
    pub fn new(path: &str) -> Self {
        Self {
            id: PkgId::from_path(path),
            path: Arc::from(path),
            time: 0,
            new_created: Vec::new(),
            new_deleted: Vec::new(),
            new_escaped: Vec::new(),
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            escaped: Vec::new(),
            op_log: None,
        }
    }

    /// Restores a realm from its persisted record.
    #[must_use]
    pub fn from_record(record: &RealmRecord) -> Self {
        let mut rlm = Self::new(&record.path);
        rlm.time = record.time;
        rlm
    }

    /// Persistable state.
    #[must_use]
    pub fn record(&self) -> RealmRecord {
        RealmRecord {
            path: self.path.clone(),
            time: self.time,
        }
    }

    /// Starts recording persisted changes.
    #[must_use]
    pub fn with_op_log(mut self) -> Self {
        self.op_log = Some(Vec::new());
        self
    }

    /// Recorded changes so far (empty when logging is off).
    #[must_use]
    pub fn op_log(&self) -> &[RealmOp] {
        self.op_log.as_deref().unwrap_or(&[])
    }

    /// Drains the recorded changes.
    pub fn take_op_log(&mut self) -> Vec<RealmOp> {
        self.op_log.as_mut().map(std::mem::take).unwrap_or_default()
    }

    pub(crate) fn log(&mut self, op: RealmOp) {
        if let Some(log) = &mut self.op_log {
            log.push(op);
        }
    }

    /// Package id shared by every object of this realm.
    #[must_use]
    pub fn id(&self) -> PkgId {
        self.id
    }

    /// Package path.
    #[must_use]
    pub fn path(&self) -> &Arc<str> {
        &self.path
    }

    /// Creation counter (the `new_time` of the most recent object).
    #[must_use]
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Current buffer sizes.
    #[must_use]
    pub fn mark_counts(&self) -> MarkCounts {
        MarkCounts {
            new_created: self.new_created.len(),
            new_deleted: self.new_deleted.len(),
            new_escaped: self.new_escaped.len(),
            created: self.created.len(),
            updated: self.updated.len(),
            deleted: self.deleted.len(),
            escaped: self.escaped.len(),
        }
    }

    /// Assigns the next realm-local id.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the object already has an id.
    pub fn assign_new_object_id(&mut self, oo: &ObjectRef) -> Result<ObjectId> {
        if oo.is_real() {
            return Err(Error::persistence(format!(
                "object {} already has an id",
                oo.id()
            )));
        }
        self.time += 1;
        let id = ObjectId::new(self.id, self.time);
        oo.set_id(id);
        Ok(id)
    }

    // =========================================================================
    // Ownership hook
    // =========================================================================

    /// Records that slot of `po` changed from pointing at `xo` to `co`.
    ///
    /// Ephemeral owners (not yet real) are ignored.
    ///
    /// # Errors
    ///
    /// Returns a guest runtime error when `po` belongs to another realm, and
    /// a persistence error on inconsistent bookkeeping.
    pub fn did_update(
        &mut self,
        po: Option<&ObjectRef>,
        xo: Option<&ObjectRef>,
        co: Option<&ObjectRef>,
    ) -> Result<()> {
        let Some(po) = po else {
            return Ok(());
        };
        if !po.is_real() {
            return Ok(());
        }
        if po.id().pkg_id != self.id {
            return Err(Error::runtime(
                "cannot modify external-realm or non-realm object",
            ));
        }
        if po.is_deleted() {
            return Err(Error::persistence("cannot attach to a deleted object"));
        }
        self.mark_dirty(po)?;

        if let Some(co) = co {
            if co.is_deleted() {
                return Err(Error::persistence("cannot attach a deleted object"));
            }
            let rc = co.inc_ref_count();
            if rc > 1 && !co.is_escaped() {
                self.mark_new_escaped(co)?;
            }
            if co.is_real() {
                self.mark_dirty(co)?;
            } else {
                co.set_owner(Some(po));
                self.mark_new_real(co)?;
            }
        }

        if let Some(xo) = xo {
            let rc = xo.dec_ref_count()?;
            if rc == 0 {
                if xo.is_real() {
                    self.mark_new_deleted(xo)?;
                }
            } else if xo.is_real() {
                self.mark_dirty(xo)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Marks
    // =========================================================================

    /// Marks an object as becoming real this transaction.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if a non-package object has no real owner.
    pub fn mark_new_real(&mut self, oo: &ObjectRef) -> Result<()> {
        if let ObjectRef::Package(_) = oo {
            if oo.ref_count() != 1 {
                return Err(Error::persistence(
                    "package must be singly referenced to become real",
                ));
            }
        } else if !oo.owner().is_some_and(|o| o.is_real()) && oo.owner_id().is_zero() {
            return Err(Error::persistence(format!(
                "cannot mark unowned {} as new real",
                oo.kind_name()
            )));
        }
        if oo.is_new_real() {
            return Ok(());
        }
        oo.set_is_new_real(true);
        trace!(realm = %self.path, kind = oo.kind_name(), "marked new real");
        self.new_created.push(oo.clone());
        Ok(())
    }

    /// Marks a real object as modified.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the object is neither real nor new-real.
    pub fn mark_dirty(&mut self, oo: &ObjectRef) -> Result<()> {
        if !oo.is_real() && !oo.is_new_real() {
            return Err(Error::persistence(format!(
                "cannot mark unreal {} as dirty",
                oo.kind_name()
            )));
        }
        if oo.is_dirty() || oo.is_new_real() {
            return Ok(());
        }
        oo.set_is_dirty(true, self.time);
        trace!(realm = %self.path, id = %oo.id(), "marked dirty");
        self.updated.push(oo.clone());
        Ok(())
    }

    /// Marks a real object whose count reached zero.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the object is unreal or already deleted.
    pub fn mark_new_deleted(&mut self, oo: &ObjectRef) -> Result<()> {
        if !oo.is_real() && !oo.is_new_real() {
            return Err(Error::persistence(format!(
                "cannot mark unreal {} as new deleted",
                oo.kind_name()
            )));
        }
        if oo.is_deleted() {
            return Err(Error::persistence(format!(
                "object {} is already deleted",
                oo.id()
            )));
        }
        if oo.is_new_deleted() {
            return Ok(());
        }
        oo.set_is_new_deleted(true);
        trace!(realm = %self.path, id = %oo.id(), "marked new deleted");
        self.new_deleted.push(oo.clone());
        Ok(())
    }

    /// Marks an object that became multiply referenced.
    ///
    /// # Errors
    ///
    /// Returns a persistence error for unreal, deleted or already escaped
    /// objects.
    pub fn mark_new_escaped(&mut self, oo: &ObjectRef) -> Result<()> {
        if oo.is_deleted() || oo.is_escaped() {
            return Err(Error::persistence(format!(
                "cannot mark {} {} as new escaped",
                if oo.is_deleted() { "deleted" } else { "escaped" },
                oo.id()
            )));
        }
        if oo.is_new_escaped() {
            return Ok(());
        }
        oo.set_is_new_escaped(true);
        trace!(realm = %self.path, kind = oo.kind_name(), "marked new escaped");
        self.new_escaped.push(oo.clone());
        Ok(())
    }

    pub(crate) fn clear_marks(&mut self) {
        self.new_created.clear();
        self.new_deleted.clear();
        self.new_escaped.clear();
        self.created.clear();
        self.updated.clear();
        self.deleted.clear();
        self.escaped.clear();
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("path", &self.path)
            .field("time", &self.time)
            .field("marks", &self.mark_counts())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Realm{{{}@{}}}#{}", self.path, self.time, self.id)
    }
}
