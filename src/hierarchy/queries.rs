//! Implementer and override queries over the class hierarchy.
//!
//! Every query exists twice: on [`ClassTable`], for callers that already hold the hierarchy
//! lock through a [`crate::hierarchy::ClassTableGuard`], and on [`PersistentClassHierarchy`],
//! which takes the lock for the duration of the query.
//!
//! All queries check [`CompilationContext::hierarchy_opts_disabled`] first and return their
//! conservative answer when it is set. Queries that cannot decide (no record, visitation cap
//! exceeded, a slot that does not resolve, more than one candidate) return the same answer
//! as "nothing found": the caller only ever learns whether it may speculate.

use std::fmt;

use crate::{
    compilation::CompilationContext,
    hierarchy::{
        ClassId, ClassInfoRc, ClassTable, PersistentClassHierarchy, SubclassVisitor, Visit,
        WalkOutcome,
    },
    vm::{ClassHierarchyVm, OptLevel, ResolvedMethod, ResolvedMethodRc},
    Result,
};

/// Which dispatch table a slot index refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MethodLookup {
    /// Index into the virtual function table
    Virtual,
    /// Constant-pool index of an interface method
    Interface,
    /// Interface lookup if the root of the query is an interface, virtual otherwise
    #[default]
    Auto,
}

/// How an implementer collection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    /// Every class below the root was examined
    Exhausted,
    /// The requested number of implementers was found before the walk finished
    Saturated,
    /// The walk gave up: visitation cap exceeded or a slot did not resolve
    Abandoned,
}

/// Result of a capped implementer collection
///
/// Methods are distinct by [`ResolvedMethod::is_same_method`].
#[derive(Clone)]
pub struct Implementers {
    methods: Vec<ResolvedMethodRc>,
    status: Collection,
}

impl Implementers {
    fn unknown() -> Self {
        Implementers {
            methods: Vec::new(),
            status: Collection::Abandoned,
        }
    }

    /// Number of distinct implementers found
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns `true` if no implementer was found
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// The implementers found, in walk order
    #[must_use]
    pub fn methods(&self) -> &[ResolvedMethodRc] {
        &self.methods
    }

    /// How the collection ended
    #[must_use]
    pub fn status(&self) -> Collection {
        self.status
    }

    /// The only implementer, if the walk proved there is exactly one
    #[must_use]
    pub fn single(&self) -> Option<ResolvedMethodRc> {
        match (self.status, self.methods.as_slice()) {
            (Collection::Abandoned, _) => None,
            (_, [method]) => Some(method.clone()),
            _ => None,
        }
    }

    /// Consumes the collection, returning the implementers found
    #[must_use]
    pub fn into_methods(self) -> Vec<ResolvedMethodRc> {
        self.methods
    }
}

impl fmt::Debug for Implementers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Implementers")
            .field(
                "methods",
                &self.methods.iter().map(|m| m.identity()).collect::<Vec<_>>(),
            )
            .field("status", &self.status)
            .finish()
    }
}

/// Resolves one dispatch slot against the classes of a walk
///
/// Bundles the VM, the calling method and the slot so the collections below do not have to
/// thread them one by one.
pub struct SlotResolver<'a> {
    vm: &'a dyn ClassHierarchyVm,
    caller: &'a dyn ResolvedMethod,
    slot: u32,
    interface: bool,
}

impl<'a> SlotResolver<'a> {
    /// Create a resolver for `slot` below `root`
    ///
    /// ## Arguments
    /// * `vm` - Performs the actual resolution
    /// * `caller` - The method containing the call site
    /// * `slot` - Virtual table slot or interface constant-pool index
    /// * `lookup` - Which table `slot` indexes
    /// * `root` - The class the query starts from, consulted for [`MethodLookup::Auto`]
    #[must_use]
    pub fn new(
        vm: &'a dyn ClassHierarchyVm,
        caller: &'a dyn ResolvedMethod,
        slot: u32,
        lookup: MethodLookup,
        root: ClassId,
    ) -> Self {
        let interface = match lookup {
            MethodLookup::Virtual => false,
            MethodLookup::Interface => true,
            MethodLookup::Auto => vm.is_interface(root),
        };
        SlotResolver {
            vm,
            caller,
            slot,
            interface,
        }
    }

    /// Returns `true` if the slot is resolved through interface tables
    #[must_use]
    pub fn is_interface_lookup(&self) -> bool {
        self.interface
    }

    /// Resolve the slot on `class`
    #[must_use]
    pub fn resolve(&self, class: ClassId) -> Option<ResolvedMethodRc> {
        if self.interface {
            self.vm
                .resolve_interface_method(self.caller, class, self.slot)
        } else {
            self.vm.resolve_virtual_method(self.caller, class, self.slot)
        }
    }
}

impl ClassTable {
    /// Collect up to `max` distinct implementers of a slot in the hierarchy rooted at `root`.
    ///
    /// `root` itself and every loaded subclass are examined; abstract classes and interfaces
    /// are skipped. The walk is capped by [`CompilationContext::max_visited_subclasses`].
    ///
    /// # Arguments
    /// * `root` - Where the walk starts
    /// * `resolver` - Resolves the slot on each concrete class
    /// * `max` - Number of implementers after which the walk stops
    /// * `comp` - Supplies the visitation cap
    #[must_use]
    pub fn collect_implementers_capped(
        &self,
        root: &ClassInfoRc,
        resolver: &SlotResolver<'_>,
        max: usize,
        comp: &CompilationContext,
    ) -> Implementers {
        self.collect_matching(root, resolver, max, comp, |_| true)
    }

    /// Like [`ClassTable::collect_implementers_capped`], counting only compiled methods.
    ///
    /// # Arguments
    /// * `root` - Where the walk starts
    /// * `resolver` - Resolves the slot on each concrete class
    /// * `max` - Number of compiled implementers after which the walk stops
    /// * `comp` - Supplies the visitation cap
    /// * `min_level` - Ignore methods compiled below this level
    #[must_use]
    pub fn collect_compiled_implementers_capped(
        &self,
        root: &ClassInfoRc,
        resolver: &SlotResolver<'_>,
        max: usize,
        comp: &CompilationContext,
        min_level: Option<OptLevel>,
    ) -> Implementers {
        self.collect_matching(root, resolver, max, comp, |method| {
            !method.is_interpreted()
                && min_level.map_or(true, |min| {
                    method.compiled_level().is_some_and(|level| level >= min)
                })
        })
    }

    fn collect_matching<F>(
        &self,
        root: &ClassInfoRc,
        resolver: &SlotResolver<'_>,
        max: usize,
        comp: &CompilationContext,
        accept: F,
    ) -> Implementers
    where
        F: Fn(&dyn ResolvedMethod) -> bool,
    {
        let mut methods: Vec<ResolvedMethodRc> = Vec::new();
        if max == 0 {
            return Implementers {
                methods,
                status: Collection::Saturated,
            };
        }

        let mut unresolved = false;
        let outcome = SubclassVisitor::new(self)
            .with_cap(comp.max_visited_subclasses())
            .visit(root, true, |info| {
                let class = info.class_id();
                if !resolver.vm.is_concrete(class) {
                    return Visit::Continue;
                }
                let Some(method) = resolver.resolve(class) else {
                    unresolved = true;
                    return Visit::Stop;
                };
                if !accept(method.as_ref())
                    || methods.iter().any(|m| m.is_same_method(method.as_ref()))
                {
                    return Visit::Continue;
                }

                methods.push(method);
                if methods.len() >= max {
                    Visit::Stop
                } else {
                    Visit::Continue
                }
            });

        let status = match outcome {
            _ if unresolved => Collection::Abandoned,
            WalkOutcome::CapExceeded => Collection::Abandoned,
            WalkOutcome::Stopped => Collection::Saturated,
            WalkOutcome::Completed => Collection::Exhausted,
        };
        Implementers { methods, status }
    }

    /// The only already-compiled implementer of `slot` in the hierarchy rooted at `class`.
    ///
    /// Returns `None` for ahead-of-time compilations, when there is no record, when the
    /// number of concrete classes exceeds the visitation cap, when a concrete class does not
    /// resolve the slot, and when zero or several distinct compiled implementers exist.
    /// Interpreted implementers do not count.
    ///
    /// # Arguments
    /// * `vm` - Class introspection and method resolution
    /// * `class` - Root of the hierarchy
    /// * `slot` - Virtual table slot, or interface constant-pool index if `class` is an interface
    /// * `caller` - The method containing the call site
    /// * `comp` - The compilation asking
    #[must_use]
    pub fn find_single_jitted_implementer(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        slot: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
    ) -> Option<ResolvedMethodRc> {
        if comp.is_aot() || comp.hierarchy_opts_disabled() {
            return None;
        }
        let root = self.find(class)?;

        let resolver = SlotResolver::new(vm, caller, slot, MethodLookup::Auto, class);
        let max = comp.max_visited_subclasses();
        let mut concrete = 0usize;
        let mut implementer: Option<ResolvedMethodRc> = None;
        let mut failed = false;

        // The cap counts concrete classes only, so the walk itself is uncapped
        SubclassVisitor::new(self).visit(root, true, |info| {
            let class = info.class_id();
            if !vm.is_concrete(class) {
                return Visit::Continue;
            }

            concrete += 1;
            let method = match resolver.resolve(class) {
                Some(method) if concrete <= max => method,
                _ => {
                    failed = true;
                    return Visit::Stop;
                }
            };
            if method.is_interpreted() {
                return Visit::Continue;
            }

            if let Some(existing) = &implementer {
                if !existing.is_same_method(method.as_ref()) {
                    failed = true;
                    return Visit::Stop;
                }
            } else {
                implementer = Some(method);
            }
            Visit::Continue
        });

        if failed {
            None
        } else {
            implementer
        }
    }

    /// Returns `true` unless `method` is provably the only target of `slot` below `class`.
    ///
    /// This is the devirtualization predicate. When `class` declares `method` the answer is
    /// the method's own override flag. Otherwise the slot must resolve to `method` on
    /// `class` and, if `class` has been extended, on every leaf below it. Unknown answers
    /// (no record, cap exceeded) are `true`.
    ///
    /// # Arguments
    /// * `vm` - Class introspection and method resolution
    /// * `method` - The candidate target
    /// * `class` - Static receiver class of the call
    /// * `slot` - Virtual table slot of `method`
    /// * `comp` - The compilation asking
    #[must_use]
    pub fn is_overridden_in_this_hierarchy(
        &self,
        vm: &dyn ClassHierarchyVm,
        method: &dyn ResolvedMethod,
        class: ClassId,
        slot: u32,
        comp: &CompilationContext,
    ) -> bool {
        if comp.hierarchy_opts_disabled() {
            return true;
        }
        if class == method.declaring_class() {
            return method.is_overridden();
        }
        let Some(root) = self.find_guarded(class, comp, false) else {
            return true;
        };

        let trace = comp.config().trace_overridden_in_hierarchy;
        if trace {
            tracing::trace!(
                method = %method.signature(),
                slot,
                class = %vm.class_name(class),
                "checking override in hierarchy"
            );
        }

        let identity = method.identity();
        if vm.resolved_virtual_method_id(class, slot) != Some(identity) {
            return true;
        }
        if !vm.has_been_extended(class) {
            return false;
        }

        let Some(leafs) = self.collect_leafs_capped(root, comp.max_visited_subclasses()) else {
            return true;
        };
        leafs.iter().any(|leaf| {
            let leaf = leaf.class_id();
            if trace {
                tracing::trace!(leaf = %vm.class_name(leaf), "leaf");
            }
            vm.resolved_virtual_method_id(leaf, slot) != Some(identity)
        })
    }

    /// The only implementer of a slot in the hierarchy rooted at `class`.
    ///
    /// Usable by ahead-of-time compilations.
    ///
    /// # Arguments
    /// * `vm` - Class introspection and method resolution
    /// * `class` - Root of the hierarchy
    /// * `slot` - Virtual table slot or interface constant-pool index
    /// * `caller` - The method containing the call site
    /// * `comp` - The compilation asking
    /// * `lookup` - Which table `slot` indexes
    #[must_use]
    pub fn find_single_implementer(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        slot: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
        lookup: MethodLookup,
    ) -> Option<ResolvedMethodRc> {
        if comp.hierarchy_opts_disabled() {
            return None;
        }
        let root = self.find_guarded(class, comp, true)?;
        let resolver = SlotResolver::new(vm, caller, slot, lookup, class);
        self.collect_implementers_capped(root, &resolver, 2, comp)
            .single()
    }

    /// The only implementer of an interface method; `None` if `class` is not an interface.
    ///
    /// # Arguments
    /// * `vm` - Class introspection and method resolution
    /// * `class` - The interface
    /// * `cp_index` - Constant-pool index of the interface method in `caller`
    /// * `caller` - The method containing the call site
    /// * `comp` - The compilation asking
    #[must_use]
    pub fn find_single_interface_implementer(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        cp_index: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
    ) -> Option<ResolvedMethodRc> {
        if comp.hierarchy_opts_disabled() || !vm.is_interface(class) {
            return None;
        }
        let root = self.find_guarded(class, comp, true)?;
        let resolver = SlotResolver::new(vm, caller, cp_index, MethodLookup::Auto, class);
        self.collect_implementers_capped(root, &resolver, 2, comp)
            .single()
    }

    /// Returns `true` if an interface has at least two distinct compiled implementers.
    ///
    /// # Arguments
    /// * `vm` - Class introspection and method resolution
    /// * `class` - The interface
    /// * `cp_index` - Constant-pool index of the interface method in `caller`
    /// * `caller` - The method containing the call site
    /// * `comp` - The compilation asking
    /// * `min_level` - Ignore implementers compiled below this level
    #[must_use]
    pub fn has_two_or_more_compiled_implementors(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        cp_index: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
        min_level: Option<OptLevel>,
    ) -> bool {
        if comp.hierarchy_opts_disabled() || !vm.is_interface(class) {
            return false;
        }
        let Some(root) = self.find_guarded(class, comp, true) else {
            return false;
        };
        let resolver = SlotResolver::new(vm, caller, cp_index, MethodLookup::Auto, class);
        self.collect_compiled_implementers_capped(root, &resolver, 2, comp, min_level)
            .len()
            == 2
    }

    /// Collect up to `n` distinct implementers of an interface method.
    ///
    /// A disabled compilation, a class that is not an interface and a missing record all
    /// yield an empty, [`Collection::Abandoned`] result.
    ///
    /// # Arguments
    /// * `vm` - Class introspection and method resolution
    /// * `class` - The interface
    /// * `n` - Maximum number of implementers to collect
    /// * `cp_index` - Constant-pool index of the interface method in `caller`
    /// * `caller` - The method containing the call site
    /// * `comp` - The compilation asking
    #[must_use]
    pub fn find_n_interface_implementers(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        n: usize,
        cp_index: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
    ) -> Implementers {
        if comp.hierarchy_opts_disabled() || !vm.is_interface(class) {
            return Implementers::unknown();
        }
        let Some(root) = self.find_guarded(class, comp, true) else {
            return Implementers::unknown();
        };
        let resolver = SlotResolver::new(vm, caller, cp_index, MethodLookup::Auto, class);
        self.collect_implementers_capped(root, &resolver, n, comp)
    }

    /// Returns `true` if an interface method is known to have three or more implementers.
    ///
    /// A disabled compilation answers `true`, a missing record answers `false`. A walk that
    /// had to give up answers `true`.
    ///
    /// # Arguments
    /// * `vm` - Class introspection and method resolution
    /// * `class` - The interface
    /// * `cp_index` - Constant-pool index of the interface method in `caller`
    /// * `caller` - The method containing the call site
    /// * `comp` - The compilation asking
    #[must_use]
    pub fn is_known_to_have_more_than_two_interface_implementers(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        cp_index: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
    ) -> bool {
        if comp.hierarchy_opts_disabled() {
            return true;
        }
        let Some(root) = self.find_guarded(class, comp, false) else {
            return false;
        };
        let resolver = SlotResolver::new(vm, caller, cp_index, MethodLookup::Auto, class);
        match self
            .collect_implementers_capped(root, &resolver, 3, comp)
            .status()
        {
            Collection::Saturated | Collection::Abandoned => true,
            Collection::Exhausted => false,
        }
    }

    /// The only implementer of a virtual slot below an abstract class or concrete class.
    ///
    /// Returns `None` for interfaces.
    ///
    /// # Arguments
    /// * `vm` - Class introspection and method resolution
    /// * `class` - Root of the hierarchy
    /// * `slot` - Virtual table slot
    /// * `caller` - The method containing the call site
    /// * `comp` - The compilation asking
    #[must_use]
    pub fn find_single_abstract_implementer(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        slot: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
    ) -> Option<ResolvedMethodRc> {
        if comp.hierarchy_opts_disabled() {
            return None;
        }
        let root = self.find_guarded(class, comp, false)?;
        if vm.is_interface(class) {
            return None;
        }
        let resolver = SlotResolver::new(vm, caller, slot, MethodLookup::Virtual, class);
        self.collect_implementers_capped(root, &resolver, 2, comp)
            .single()
    }

    /// The only concrete transitive subclass of `class`.
    ///
    /// Walks every subclass without a cap. `class` itself is not a candidate.
    ///
    /// # Arguments
    /// * `vm` - Class introspection
    /// * `class` - Root of the hierarchy
    /// * `comp` - The compilation asking
    #[must_use]
    pub fn find_single_concrete_subclass(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        comp: &CompilationContext,
    ) -> Option<ClassId> {
        if comp.hierarchy_opts_disabled() {
            return None;
        }
        let root = self.find_guarded(class, comp, false)?;

        let mut concrete = None;
        for sub in self.collect_all_subclasses(root) {
            let sub = sub.class_id();
            if vm.is_concrete(sub) {
                if concrete.is_some() {
                    return None;
                }
                concrete = Some(sub);
            }
        }
        concrete
    }
}

impl PersistentClassHierarchy {
    /// Locking form of [`ClassTable::find_single_jitted_implementer`]
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn find_single_jitted_implementer(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        slot: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
    ) -> Result<Option<ResolvedMethodRc>> {
        if comp.is_aot() || comp.hierarchy_opts_disabled() {
            return Ok(None);
        }
        Ok(self
            .lock()?
            .find_single_jitted_implementer(vm, class, slot, caller, comp))
    }

    /// Locking form of [`ClassTable::is_overridden_in_this_hierarchy`]
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn is_overridden_in_this_hierarchy(
        &self,
        vm: &dyn ClassHierarchyVm,
        method: &dyn ResolvedMethod,
        class: ClassId,
        slot: u32,
        comp: &CompilationContext,
    ) -> Result<bool> {
        Ok(self
            .lock()?
            .is_overridden_in_this_hierarchy(vm, method, class, slot, comp))
    }

    /// Locking form of [`ClassTable::find_single_implementer`]
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn find_single_implementer(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        slot: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
        lookup: MethodLookup,
    ) -> Result<Option<ResolvedMethodRc>> {
        Ok(self
            .lock()?
            .find_single_implementer(vm, class, slot, caller, comp, lookup))
    }

    /// Locking form of [`ClassTable::find_single_interface_implementer`]
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn find_single_interface_implementer(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        cp_index: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
    ) -> Result<Option<ResolvedMethodRc>> {
        Ok(self
            .lock()?
            .find_single_interface_implementer(vm, class, cp_index, caller, comp))
    }

    /// Locking form of [`ClassTable::has_two_or_more_compiled_implementors`]
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn has_two_or_more_compiled_implementors(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        cp_index: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
        min_level: Option<OptLevel>,
    ) -> Result<bool> {
        Ok(self.lock()?.has_two_or_more_compiled_implementors(
            vm, class, cp_index, caller, comp, min_level,
        ))
    }

    /// Locking form of [`ClassTable::find_n_interface_implementers`]
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn find_n_interface_implementers(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        n: usize,
        cp_index: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
    ) -> Result<Implementers> {
        Ok(self
            .lock()?
            .find_n_interface_implementers(vm, class, n, cp_index, caller, comp))
    }

    /// Locking form of [`ClassTable::is_known_to_have_more_than_two_interface_implementers`]
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn is_known_to_have_more_than_two_interface_implementers(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        cp_index: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
    ) -> Result<bool> {
        Ok(self
            .lock()?
            .is_known_to_have_more_than_two_interface_implementers(
                vm, class, cp_index, caller, comp,
            ))
    }

    /// Locking form of [`ClassTable::find_single_abstract_implementer`]
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn find_single_abstract_implementer(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        slot: u32,
        caller: &dyn ResolvedMethod,
        comp: &CompilationContext,
    ) -> Result<Option<ResolvedMethodRc>> {
        Ok(self
            .lock()?
            .find_single_abstract_implementer(vm, class, slot, caller, comp))
    }

    /// Locking form of [`ClassTable::find_single_concrete_subclass`]
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the lock is poisoned.
    pub fn find_single_concrete_subclass(
        &self,
        vm: &dyn ClassHierarchyVm,
        class: ClassId,
        comp: &CompilationContext,
    ) -> Result<Option<ClassId>> {
        Ok(self.lock()?.find_single_concrete_subclass(vm, class, comp))
    }
}
