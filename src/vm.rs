//! Traits the surrounding virtual machine implements.
//!
//! The hierarchy core never inspects classes or methods itself. Names, class kinds, dispatch
//! table contents and the compiled state of methods all come from the VM through
//! [`ClassHierarchyVm`] and [`ResolvedMethod`]; rewriting compiled code goes through
//! [`GuardPatcher`].
//!
//! # Method identity
//!
//! Two [`ResolvedMethodRc`] handles may wrap the same underlying method. Queries therefore
//! compare methods with [`ResolvedMethod::is_same_method`], which compares
//! [`ResolvedMethod::identity`], never the handles themselves.

use std::{fmt, sync::Arc};

use crate::{guards::CodeAddress, hierarchy::ClassId};

/// Persistent identity of a method, stable while its class is loaded
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub usize);

impl MethodId {
    /// Creates a new method identity from a raw value
    #[must_use]
    pub fn new(value: usize) -> Self {
        MethodId(value)
    }

    /// Returns the raw identity value
    #[must_use]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl fmt::Debug for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodId(0x{:x})", self.0)
    }
}

/// Optimization level a method body was compiled at, ordered from cheapest to most optimized
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptLevel {
    /// Compiled without optimization
    NoOpt,
    /// Cold compilation
    Cold,
    /// Warm compilation
    Warm,
    /// Hot compilation
    Hot,
    /// Very hot compilation
    VeryHot,
    /// Highest optimization level
    Scorching,
}

/// A method as resolved by the VM for one compilation
pub trait ResolvedMethod: Send + Sync {
    /// Identity of the underlying method
    fn identity(&self) -> MethodId;

    /// The class that declares this method
    fn declaring_class(&self) -> ClassId;

    /// Returns `true` while the method has no compiled body
    fn is_interpreted(&self) -> bool;

    /// Level of the compiled body, `None` while interpreted
    fn compiled_level(&self) -> Option<OptLevel>;

    /// The VM's own record of whether some loaded class overrides this method
    fn is_overridden(&self) -> bool;

    /// Human readable signature, used for diagnostics only
    fn signature(&self) -> String;

    /// Number of times the method has been invoked so far
    fn invocation_count(&self) -> i32;

    /// Returns `true` if both handles denote the same underlying method
    fn is_same_method(&self, other: &dyn ResolvedMethod) -> bool {
        self.identity() == other.identity()
    }
}

/// Shared handle to a resolved method
pub type ResolvedMethodRc = Arc<dyn ResolvedMethod>;

/// Class introspection and method resolution provided by the VM
///
/// Implementations must be callable from any compiler thread while the hierarchy lock is
/// held, so they must not call back into the hierarchy.
pub trait ClassHierarchyVm: Send + Sync {
    /// Internal name of a class, e.g. `java/lang/String`
    fn class_name(&self, class: ClassId) -> String;

    /// Returns `true` for interfaces
    fn is_interface(&self, class: ClassId) -> bool;

    /// Returns `true` for abstract classes
    fn is_abstract(&self, class: ClassId) -> bool;

    /// Returns `true` once any subclass (or implementer) of `class` has been loaded
    fn has_been_extended(&self, class: ClassId) -> bool;

    /// Identity of the method that `slot` of the dispatch table of `class` currently holds
    fn resolved_virtual_method_id(&self, class: ClassId, slot: u32) -> Option<MethodId>;

    /// Resolves dispatch-table `slot` of `class` in the context of `caller`
    fn resolve_virtual_method(
        &self,
        caller: &dyn ResolvedMethod,
        class: ClassId,
        slot: u32,
    ) -> Option<ResolvedMethodRc>;

    /// Resolves the interface method named by `cp_index` of `caller` against `class`
    fn resolve_interface_method(
        &self,
        caller: &dyn ResolvedMethod,
        class: ClassId,
        cp_index: u32,
    ) -> Option<ResolvedMethodRc>;

    /// Every method `class` declares, for diagnostics
    fn resolved_methods(&self, class: ClassId) -> Vec<ResolvedMethodRc>;

    /// Returns `true` for classes that can be instantiated
    fn is_concrete(&self, class: ClassId) -> bool {
        !self.is_abstract(class) && !self.is_interface(class)
    }
}

/// Code patching primitive
pub trait GuardPatcher: Send + Sync {
    /// Rewrites the guard at `location` so that it always takes `destination`
    ///
    /// Patching an already patched guard must be harmless.
    fn compensate(&self, location: CodeAddress, destination: CodeAddress);
}
