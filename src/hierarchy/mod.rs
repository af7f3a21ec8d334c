//! Persistent class-hierarchy index for speculative JIT optimizations.
//!
//! This module provides the index of every class the VM has loaded, the bounded walk over
//! its subclass links, and the implementer queries built on top of that walk.
//!
//! # Key Components
//!
//! - [`ClassId`]: Opaque identity of a loaded class
//! - [`ClassInfo`]: Per-class record, created once at class load and never removed
//! - [`PersistentClassHierarchy`]: The process-wide index and its lock
//! - [`ClassTable`]: The index contents, reached through the lock
//! - [`SubclassVisitor`]: Bounded traversal over subclass links
//! - [`Implementers`]: Result of a capped implementer collection
//!
//! # Record lifecycle
//!
//! Records are append-only. Unloading a class only sets [`ClassInfo::is_unloaded`]; the
//! record stays reachable because compiled code and concurrent readers may still hold it.
//! Walks skip unloaded records.
//!
//! # Examples
//!
//! ```rust
//! use hierscope::hierarchy::{ClassId, PersistentClassHierarchy};
//!
//! let hierarchy = PersistentClassHierarchy::new();
//! let object = ClassId::new(0x1000);
//! let string = ClassId::new(0x1040);
//!
//! hierarchy.class_loaded(object)?;
//! hierarchy.class_loaded(string)?;
//! hierarchy.add_subclass(object, string)?;
//!
//! let table = hierarchy.lock()?;
//! let root = table.find(object).unwrap();
//! assert_eq!(table.collect_all_subclasses(root).len(), 1);
//! # Ok::<(), hierscope::Error>(())
//! ```

mod hash;
mod queries;
mod table;
mod visitor;

use std::{
    fmt,
    sync::{
        atomic::{AtomicI32, AtomicU32, Ordering},
        Arc,
    },
};

use bitflags::bitflags;
use dashmap::DashSet;

pub use hash::AddressHash;
pub use queries::{Collection, Implementers, MethodLookup, SlotResolver};
pub use table::{ClassTable, ClassTableGuard, PersistentClassHierarchy, CLASS_TABLE_SIZE};
pub use visitor::{SubclassVisitor, Visit, WalkOutcome};

/// Opaque identity of a loaded class.
///
/// The value is an address into VM-managed memory. It is only ever hashed and compared,
/// never dereferenced, and is stable while the class stays loaded.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub usize);

impl ClassId {
    /// Creates a new class identity from a raw address
    #[must_use]
    pub fn new(value: usize) -> Self {
        ClassId(value)
    }

    /// Returns the raw address
    #[must_use]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl From<usize> for ClassId {
    fn from(value: usize) -> Self {
        ClassId(value)
    }
}

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassId(0x{:016x})", self.0)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

bitflags! {
    /// State bits of a [`ClassInfo`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassInfoFlags: u32 {
        /// The class has been unloaded; never cleared
        const UNLOADED = 0x0001;
        /// Transient marker of the walk currently in progress
        const VISITED = 0x0002;
    }
}

/// Reference to a `ClassInfo`
pub type ClassInfoRc = Arc<ClassInfo>;

const NAME_LENGTH_UNKNOWN: i32 = -1;

/// Persistent record of one loaded class
///
/// Mutable state lives in atomics so that a record handed out by a lookup stays readable
/// without the lock. Writers (`unloaded`, `visited`, cached name length, subclass links)
/// only run under the hierarchy lock.
pub struct ClassInfo {
    class_id: ClassId,
    flags: AtomicU32,
    name_length: AtomicI32,
    subclasses: boxcar::Vec<ClassInfoRc>,
    /// Identities in `subclasses`, so that linking stays O(1) below very wide classes
    subclass_ids: DashSet<ClassId>,
}

impl ClassInfo {
    pub(crate) fn new(class_id: ClassId) -> Self {
        ClassInfo {
            class_id,
            flags: AtomicU32::new(0),
            name_length: AtomicI32::new(NAME_LENGTH_UNKNOWN),
            subclasses: boxcar::Vec::new(),
            subclass_ids: DashSet::new(),
        }
    }

    /// Identity of the class this record describes
    #[must_use]
    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    /// Current state bits
    #[must_use]
    pub fn flags(&self) -> ClassInfoFlags {
        ClassInfoFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Returns `true` once the class has been unloaded
    #[must_use]
    pub fn is_unloaded(&self) -> bool {
        self.flags().contains(ClassInfoFlags::UNLOADED)
    }

    /// Returns `true` while the record is marked by a walk
    #[must_use]
    pub fn is_visited(&self) -> bool {
        self.flags().contains(ClassInfoFlags::VISITED)
    }

    /// Cached length of the class signature, `None` until first computed
    #[must_use]
    pub fn name_length(&self) -> Option<usize> {
        let length = self.name_length.load(Ordering::Acquire);
        usize::try_from(length).ok()
    }

    /// Direct subclasses (and implementers, for interfaces) in link order
    pub fn subclasses(&self) -> impl Iterator<Item = &ClassInfoRc> {
        self.subclasses.iter().map(|(_, sub)| sub)
    }

    /// Returns `true` if no loaded class is linked directly below this one
    ///
    /// Subclasses that have since been unloaded do not count, matching
    /// [`crate::hierarchy::ClassTable::collect_leafs`].
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.subclasses().all(|sub| sub.is_unloaded())
    }

    pub(crate) fn set_unloaded(&self) {
        self.flags
            .fetch_or(ClassInfoFlags::UNLOADED.bits(), Ordering::AcqRel);
    }

    /// Marks the record, returning `false` if it was already marked
    pub(crate) fn set_visited(&self) -> bool {
        let previous = self
            .flags
            .fetch_or(ClassInfoFlags::VISITED.bits(), Ordering::AcqRel);
        previous & ClassInfoFlags::VISITED.bits() == 0
    }

    pub(crate) fn reset_visited(&self) {
        self.flags
            .fetch_and(!ClassInfoFlags::VISITED.bits(), Ordering::AcqRel);
    }

    pub(crate) fn set_name_length(&self, length: usize) {
        let length = i32::try_from(length).unwrap_or(i32::MAX);
        self.name_length.store(length, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn has_subclass(&self, class_id: ClassId) -> bool {
        self.subclass_ids.contains(&class_id)
    }

    /// Links `subclass` below this record, returning `false` if it already was
    pub(crate) fn add_subclass(&self, subclass: ClassInfoRc) -> bool {
        if !self.subclass_ids.insert(subclass.class_id) {
            return false;
        }
        self.subclasses.push(subclass);
        true
    }
}

impl fmt::Debug for ClassInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassInfo")
            .field("class_id", &self.class_id)
            .field("flags", &self.flags())
            .field("name_length", &self.name_length())
            .field("subclasses", &self.subclasses.count())
            .finish()
    }
}

/// Converts an internal class name into its signature form
///
/// `java/lang/String` becomes `Ljava/lang/String;`. Array class names already are
/// signatures and come back unchanged.
///
/// ## Arguments
/// * `name` - The internal class name as reported by the VM
#[must_use]
pub fn class_name_to_signature(name: &str) -> String {
    if name.starts_with('[') {
        name.to_string()
    } else {
        format!("L{name};")
    }
}
