//! # hierscope Prelude
//!
//! The types needed to feed class events into the index, run implementer queries and
//! commit side-effect guards. Import this module to get all of them at once.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all hierscope operations
pub use crate::Error;

/// The result type used throughout hierscope
pub use crate::Result;

// ================================================================================================
// Configuration
// ================================================================================================

/// Options for hierarchy-based optimizations
pub use crate::config::HierarchyConfig;

/// Per-compilation view of the options
pub use crate::compilation::CompilationContext;

// ================================================================================================
// Hierarchy Index
// ================================================================================================

/// The index, its contents and the records it holds
pub use crate::hierarchy::{
    ClassId, ClassInfo, ClassInfoRc, ClassTable, ClassTableGuard, PersistentClassHierarchy,
};

/// Bounded walks and implementer collections
pub use crate::hierarchy::{
    Collection, Implementers, MethodLookup, SlotResolver, SubclassVisitor, Visit, WalkOutcome,
};

// ================================================================================================
// Guards
// ================================================================================================

/// Assumption records, guard sites and the commit result
pub use crate::guards::{
    ArtifactId, ClassExtendCheck, ClassLoadCheck, CodeAddress, CommitOutcome, GuardSite,
    RuntimeAssumptionTable, SideEffectAssumptions,
};

// ================================================================================================
// VM Interface
// ================================================================================================

/// Traits the surrounding virtual machine implements
pub use crate::vm::{
    ClassHierarchyVm, GuardPatcher, MethodId, OptLevel, ResolvedMethod, ResolvedMethodRc,
};
