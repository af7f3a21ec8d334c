//! The process-wide class hierarchy index.
//!
//! This module provides [`PersistentClassHierarchy`], the owner of every [`ClassInfo`] record,
//! and [`ClassTable`], the index contents that are only reachable while the hierarchy lock
//! is held.
//!
//! # Table Architecture
//!
//! The table is a fixed array of [`CLASS_TABLE_SIZE`] bucket heads over an arena of records.
//! Each bucket is a singly-linked chain threaded through `links`, an arena-parallel vector
//! of next indices. Records are only ever appended, so indices stay valid for the lifetime
//! of the table and no chain is ever unlinked. There is no resizing.
//!
//! # Thread Safety
//!
//! Class load and unload notifications arrive on arbitrary VM threads while compiler threads
//! query the table. Every public method of [`PersistentClassHierarchy`] holds the lock for
//! exactly its own duration. Callers that need a consistent view across several operations
//! take the lock once through [`PersistentClassHierarchy::lock`] and work on the returned
//! [`ClassTableGuard`]; holding the guard is the proof that the lock is held, so no method
//! reachable through it locks again. The lock is not reentrant: calling a
//! [`PersistentClassHierarchy`] method while holding a guard from the same index deadlocks.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    compilation::CompilationContext,
    config::HierarchyConfig,
    hierarchy::{AddressHash, ClassId, ClassInfo, ClassInfoRc},
    vm::ClassHierarchyVm,
    Error, Result,
};

/// Number of buckets in the class table
pub const CLASS_TABLE_SIZE: usize = 4001;

/// Proof that the hierarchy lock is held, giving access to the [`ClassTable`]
pub type ClassTableGuard<'a> = MutexGuard<'a, ClassTable>;

/// Contents of the class hierarchy index
///
/// Only reachable through the hierarchy lock, either implicitly through
/// [`PersistentClassHierarchy`] methods or explicitly through a [`ClassTableGuard`].
pub struct ClassTable {
    /// Index into `records` of the first record of each bucket
    heads: Box<[Option<usize>]>,
    /// Every record ever inserted, in insertion order
    records: Vec<ClassInfoRc>,
    /// `links[i]` is the index of the record following `records[i]` in its bucket
    links: Vec<Option<usize>>,
}

impl ClassTable {
    fn new() -> Self {
        ClassTable {
            heads: vec![None; CLASS_TABLE_SIZE].into_boxed_slice(),
            records: Vec::new(),
            links: Vec::new(),
        }
    }

    fn bucket_of(class_id: ClassId) -> usize {
        AddressHash::bucket(class_id.value(), CLASS_TABLE_SIZE)
    }

    /// Iterates the chain of one bucket
    fn chain(&self, bucket: usize) -> impl Iterator<Item = &ClassInfoRc> {
        let mut next = self.heads[bucket];
        std::iter::from_fn(move || {
            let index = next?;
            next = self.links[index];
            Some(&self.records[index])
        })
    }

    /// Look up the record of a class.
    ///
    /// Scans the bucket chain comparing identities; O(1) on average. Unloaded records are
    /// returned as well, it is up to the caller to check [`ClassInfo::is_unloaded`].
    ///
    /// # Arguments
    /// * `class_id` - The class to look up
    #[must_use]
    pub fn find(&self, class_id: ClassId) -> Option<&ClassInfoRc> {
        self.chain(Self::bucket_of(class_id))
            .find(|info| info.class_id() == class_id)
    }

    /// Look up the record of a class unless the compilation must not use the hierarchy.
    ///
    /// Returns `None` when hierarchy-based optimizations are disabled for `comp`, and for
    /// ahead-of-time compilations unless `allow_aot` is set, because the live hierarchy
    /// depends on load order that an ahead-of-time compiled body cannot rely on.
    ///
    /// # Arguments
    /// * `class_id` - The class to look up
    /// * `comp` - The compilation asking
    /// * `allow_aot` - Return the record even for ahead-of-time compilations
    #[must_use]
    pub fn find_guarded(
        &self,
        class_id: ClassId,
        comp: &CompilationContext,
        allow_aot: bool,
    ) -> Option<&ClassInfoRc> {
        if !may_use_hierarchy(comp, allow_aot) {
            return None;
        }
        self.find(class_id)
    }

    /// Returns `true` if a record exists for `class_id`
    #[must_use]
    pub fn contains(&self, class_id: ClassId) -> bool {
        self.find(class_id).is_some()
    }

    /// Number of records, unloaded ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no class has been loaded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates every record in bucket order
    pub fn iter(&self) -> impl Iterator<Item = &ClassInfoRc> {
        (0..CLASS_TABLE_SIZE).flat_map(move |bucket| self.chain(bucket))
    }

    /// Insert a record for a newly loaded class.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateClass`] if `class_id` already has a record.
    pub fn insert(&mut self, class_id: ClassId) -> Result<ClassInfoRc> {
        if self.contains(class_id) {
            tracing::error!(class = %class_id, "duplicate class load notification");
            return Err(Error::DuplicateClass(class_id));
        }

        let bucket = Self::bucket_of(class_id);
        let index = self.records.len();
        let info = Arc::new(ClassInfo::new(class_id));

        self.records.push(info.clone());
        self.links.push(self.heads[bucket]);
        self.heads[bucket] = Some(index);

        Ok(info)
    }

    /// Mark the record of `class_id` as unloaded.
    ///
    /// Returns `false` without creating anything when the class has no record, which
    /// happens for classes that never finished loading.
    ///
    /// # Arguments
    /// * `class_id` - The unloaded class
    pub fn mark_unloaded(&mut self, class_id: ClassId) -> bool {
        match self.find(class_id) {
            Some(info) => {
                info.set_unloaded();
                true
            }
            None => false,
        }
    }

    /// Record that `subclass` directly extends or implements `superclass`.
    ///
    /// Linking the same pair twice is a no-op. Constant time regardless of how many
    /// subclasses `superclass` already has.
    ///
    /// # Errors
    /// Returns [`Error::MissingClassInfo`] if either class has no record, and
    /// [`Error::Fatal`] if a class is linked below itself.
    pub fn add_subclass(&mut self, superclass: ClassId, subclass: ClassId) -> Result<()> {
        if superclass == subclass {
            return Err(fatal_error!("class {} cannot extend itself", superclass));
        }

        let Some(super_info) = self.find(superclass) else {
            tracing::error!(class = %superclass, "subclass linked to unknown class");
            return Err(Error::MissingClassInfo(superclass));
        };
        let Some(sub_info) = self.find(subclass) else {
            tracing::error!(class = %subclass, "unknown class linked as subclass");
            return Err(Error::MissingClassInfo(subclass));
        };

        super_info.add_subclass(sub_info.clone());
        Ok(())
    }

    /// Clear the transient visited marker of every record.
    ///
    /// Touches every record, so it is expensive; it is only needed to start a fresh
    /// traversal epoch after a walk was abandoned without cleaning up its markers.
    pub fn reset_visited(&self) {
        for info in &self.records {
            info.reset_visited();
        }
    }

    /// Collect `(signature, invocation count)` for every method of every loaded class.
    ///
    /// Each entry is also logged at `info` level.
    ///
    /// # Arguments
    /// * `vm` - The VM providing the methods of each class
    pub fn method_counts(&self, vm: &dyn ClassHierarchyVm) -> Vec<(String, i32)> {
        let mut counts = Vec::new();
        for info in self.iter() {
            for method in vm.resolved_methods(info.class_id()) {
                let signature = method.signature();
                let count = method.invocation_count();
                tracing::info!(%signature, count, "method invocation count");
                counts.push((signature, count));
            }
        }
        counts
    }
}

/// Returns `false` when `comp` must not consult the hierarchy at all
pub(crate) fn may_use_hierarchy(comp: &CompilationContext, allow_aot: bool) -> bool {
    !comp.hierarchy_opts_disabled() && (allow_aot || !comp.is_aot())
}

/// The process-wide class hierarchy index.
///
/// Owns every [`ClassInfo`] record and the lock protecting bucket chains and per-record
/// mutable state. Records are created by [`PersistentClassHierarchy::class_loaded`], never
/// deleted, and tombstoned by [`PersistentClassHierarchy::class_unloaded`].
///
/// # Examples
///
/// ```rust
/// use hierscope::hierarchy::{ClassId, PersistentClassHierarchy};
///
/// let hierarchy = PersistentClassHierarchy::new();
/// let class = ClassId::new(0x4000);
///
/// // Unloading an unknown class is not an error and creates nothing
/// hierarchy.class_unloaded(class)?;
/// assert!(hierarchy.find(class)?.is_none());
///
/// let info = hierarchy.class_loaded(class)?;
/// assert_eq!(info.class_id(), class);
/// assert!(!info.is_unloaded());
///
/// hierarchy.class_unloaded(class)?;
/// assert!(hierarchy.find(class)?.unwrap().is_unloaded());
/// # Ok::<(), hierscope::Error>(())
/// ```
pub struct PersistentClassHierarchy {
    table: Mutex<ClassTable>,
    config: HierarchyConfig,
}

impl PersistentClassHierarchy {
    /// Create an empty index with default options
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HierarchyConfig::default())
    }

    /// Create an empty index
    ///
    /// ## Arguments
    /// * `config` - Process-wide options; only the diagnostic switches are read here,
    ///   queries use the options of the asking compilation
    #[must_use]
    pub fn with_config(config: HierarchyConfig) -> Self {
        PersistentClassHierarchy {
            table: Mutex::new(ClassTable::new()),
            config,
        }
    }

    /// Process-wide options of this index
    #[must_use]
    pub fn config(&self) -> &HierarchyConfig {
        &self.config
    }

    /// Take the hierarchy lock.
    ///
    /// The guard gives access to every lookup, walk and query without further locking, so
    /// a sequence of them observes one consistent hierarchy. Class loads and unloads block
    /// until the guard is dropped.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn lock(&self) -> Result<ClassTableGuard<'_>> {
        lock!(self.table)
    }

    /// Class-load notification: create the record of a newly loaded class.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateClass`] if the class already has a record, and
    /// [`Error::LockError`] if the lock is poisoned.
    pub fn class_loaded(&self, class_id: ClassId) -> Result<ClassInfoRc> {
        let info = lock!(self.table)?.insert(class_id)?;
        tracing::debug!(class = %class_id, "class loaded");
        Ok(info)
    }

    /// Class-unload notification: mark the record of `class_id` as unloaded.
    ///
    /// A class without record (it never finished loading) is ignored.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn class_unloaded(&self, class_id: ClassId) -> Result<()> {
        let marked = lock!(self.table)?.mark_unloaded(class_id);
        if self.config.verbose_class_unloading {
            tracing::info!(class = %class_id, marked, "setting class as unloaded");
        } else {
            tracing::debug!(class = %class_id, marked, "class unloaded");
        }
        Ok(())
    }

    /// Record that `subclass` directly extends or implements `superclass`.
    ///
    /// # Errors
    /// Returns [`Error::MissingClassInfo`] if either class has no record,
    /// [`Error::Fatal`] for a self link and [`Error::LockError`] if the lock is poisoned.
    pub fn add_subclass(&self, superclass: ClassId, subclass: ClassId) -> Result<()> {
        lock!(self.table)?.add_subclass(superclass, subclass)?;
        tracing::debug!(superclass = %superclass, subclass = %subclass, "subclass linked");
        Ok(())
    }

    /// Look up the record of a class.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn find(&self, class_id: ClassId) -> Result<Option<ClassInfoRc>> {
        with_lock!(self.table, |table: &ClassTable| table.find(class_id).cloned())
    }

    /// Look up the record of a class unless the compilation must not use the hierarchy.
    ///
    /// The options are checked before the lock is taken. See [`ClassTable::find_guarded`].
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn find_guarded(
        &self,
        class_id: ClassId,
        comp: &CompilationContext,
        allow_aot: bool,
    ) -> Result<Option<ClassInfoRc>> {
        if !may_use_hierarchy(comp, allow_aot) {
            return Ok(None);
        }
        self.find(class_id)
    }

    /// Clear the visited marker of every record. See [`ClassTable::reset_visited`].
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn reset_visited(&self) -> Result<()> {
        with_lock!(self.table, |table: &ClassTable| table.reset_visited())
    }

    /// Number of records, unloaded ones included
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        with_lock!(self.table, |table: &ClassTable| table.len())
    }

    /// Returns `true` if no class has been loaded yet
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        with_lock!(self.table, |table: &ClassTable| table.is_empty())
    }

    /// Collect and log the invocation counts of every method. See [`ClassTable::method_counts`].
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the lock is poisoned.
    pub fn method_counts(&self, vm: &dyn ClassHierarchyVm) -> Result<Vec<(String, i32)>> {
        with_lock!(self.table, |table: &ClassTable| table.method_counts(vm))
    }
}

impl Default for PersistentClassHierarchy {
    fn default() -> Self {
        Self::new()
    }
}
