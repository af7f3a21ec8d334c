//! End-of-compilation commit of side-effect guards.
//!
//! The commit is a two-phase transaction run under the hierarchy lock:
//!
//! 1. Validate: every [`ClassLoadCheck`] is matched against the signature of every loaded
//!    record, then every [`ClassExtendCheck`] whose class the VM reports as extended is
//!    checked for subclasses that the assumption set does not name itself.
//! 2. Act: if nothing was violated, one runtime hook per (assumption, guard site) is
//!    registered; otherwise every guard site is patched immediately.

use std::fmt;

use crate::{
    guards::{
        ClassExtendCheck, ClassLoadCheck, CodeAddress, CommitOutcome, PatchGuardSite,
        RuntimeAssumptionTable, SideEffectAssumptions,
    },
    hierarchy::{class_name_to_signature, ClassId, ClassTable, PersistentClassHierarchy},
    vm::{ClassHierarchyVm, GuardPatcher},
    Error, Result,
};

/// Why an assumption set no longer holds
enum Violation {
    /// A class named by a load check is loaded
    Loaded { class: ClassId },
    /// An extended class has a subclass no extend check names
    NewSubclass { class: ClassId, subclass: ClassId },
    /// An extended class has no record to enumerate its subclasses from
    Untracked { class: ClassId },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Loaded { class } => write!(f, "class {class} is loaded"),
            Violation::NewSubclass { class, subclass } => {
                write!(f, "class {class} was extended by {subclass}")
            }
            Violation::Untracked { class } => {
                write!(f, "class {class} was extended but has no class info")
            }
        }
    }
}

impl ClassTable {
    /// Re-validate and commit the side-effect assumptions of a compilation.
    ///
    /// See [`PersistentClassHierarchy::commit_side_effect_guards`].
    ///
    /// # Errors
    /// Returns [`Error::GuardSiteWithoutLocation`] if a guard site was never placed and
    /// [`Error::MissingClassInfo`] if hooks must be registered for a class without record.
    /// Nothing is patched or registered in either case.
    pub fn commit_side_effect_guards(
        &self,
        vm: &dyn ClassHierarchyVm,
        assumptions: &SideEffectAssumptions,
        runtime: &RuntimeAssumptionTable,
        patcher: &dyn GuardPatcher,
    ) -> Result<CommitOutcome> {
        let artifact = assumptions.artifact();
        let sites = placed_sites(assumptions)?;

        if let Some(violation) = self.find_violation(vm, assumptions) {
            for (location, destination) in &sites {
                patcher.compensate(*location, *destination);
            }
            tracing::debug!(%artifact, %violation, sites = sites.len(), "side-effect guards compensated");
            return Ok(CommitOutcome::Compensated { sites: sites.len() });
        }

        if !sites.is_empty() {
            if let Some(check) = assumptions
                .classes_not_extended()
                .iter()
                .find(|check| !self.contains(check.class()))
            {
                tracing::error!(class = %check.class(), "no class info for class that should not be newly extended");
                return Err(Error::MissingClassInfo(check.class()));
            }
        }

        let mut pre_initialize_hooks = false;
        let mut extend_hooks = false;
        for (location, destination) in &sites {
            let site = PatchGuardSite::new(artifact, *location, *destination);
            for check in assumptions.classes_not_loaded() {
                runtime.register_class_pre_initialize(check.name(), site);
                pre_initialize_hooks = true;
            }
            for check in assumptions.classes_not_extended() {
                runtime.register_class_extend(check.class(), site);
                extend_hooks = true;
            }
        }

        tracing::debug!(
            %artifact,
            sites = sites.len(),
            pre_initialize_hooks,
            extend_hooks,
            "side-effect guards committed"
        );
        Ok(CommitOutcome::Committed {
            pre_initialize_hooks,
            extend_hooks,
        })
    }

    fn find_violation(
        &self,
        vm: &dyn ClassHierarchyVm,
        assumptions: &SideEffectAssumptions,
    ) -> Option<Violation> {
        for check in assumptions.classes_not_loaded() {
            if let Some(class) = self.loaded_class_named(vm, check) {
                return Some(Violation::Loaded { class });
            }
        }
        for check in assumptions.classes_not_extended() {
            if let Some(violation) = self.new_subclass_of(vm, check, assumptions) {
                return Some(violation);
            }
        }
        None
    }

    /// First loaded record whose signature equals the check's name
    ///
    /// Records whose cached name length differs are skipped without asking the VM.
    fn loaded_class_named(
        &self,
        vm: &dyn ClassHierarchyVm,
        check: &ClassLoadCheck,
    ) -> Option<ClassId> {
        self.iter()
            .filter(|info| !info.is_unloaded())
            .find(|info| {
                let cached = info.name_length();
                if cached.is_some_and(|length| length != check.len()) {
                    return false;
                }
                let signature = class_name_to_signature(&vm.class_name(info.class_id()));
                if cached.is_none() {
                    info.set_name_length(signature.len());
                }
                signature == check.name()
            })
            .map(|info| info.class_id())
    }

    fn new_subclass_of(
        &self,
        vm: &dyn ClassHierarchyVm,
        check: &ClassExtendCheck,
        assumptions: &SideEffectAssumptions,
    ) -> Option<Violation> {
        let class = check.class();
        if !vm.has_been_extended(class) {
            return None;
        }
        let Some(root) = self.find(class) else {
            return Some(Violation::Untracked { class });
        };

        self.collect_all_subclasses(root)
            .iter()
            .map(|sub| sub.class_id())
            .find(|sub| !assumptions.is_extend_checked(*sub))
            .map(|subclass| Violation::NewSubclass { class, subclass })
    }
}

/// Location and destination of every guard site, or a fault if one was never placed
fn placed_sites(assumptions: &SideEffectAssumptions) -> Result<Vec<(CodeAddress, CodeAddress)>> {
    assumptions
        .guard_sites()
        .iter()
        .map(|site| match site.location() {
            Some(location) => Ok((location, site.destination())),
            None => {
                tracing::error!(
                    artifact = %assumptions.artifact(),
                    destination = %site.destination(),
                    "guard site without location"
                );
                Err(Error::GuardSiteWithoutLocation)
            }
        })
        .collect()
}

impl PersistentClassHierarchy {
    /// Re-validate and commit the side-effect assumptions of a compilation.
    ///
    /// Holds the hierarchy lock for the whole transaction, so no class load can slip in
    /// between validation and hook registration. If every assumption still holds, hooks
    /// are registered in `runtime` and the optimized code stays active; otherwise every
    /// guard site is patched through `patcher` before returning.
    ///
    /// # Arguments
    /// * `vm` - Class names and the "has been extended" predicate
    /// * `assumptions` - What the compilation assumed, and its guard sites
    /// * `runtime` - Receives the invalidation hooks
    /// * `patcher` - Patches guards when the assumptions are already false
    ///
    /// # Errors
    /// Returns [`Error::GuardSiteWithoutLocation`] if a guard site was never placed,
    /// [`Error::MissingClassInfo`] if hooks must be registered for a class without record
    /// and [`Error::LockError`] if the lock is poisoned.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let outcome = hierarchy.commit_side_effect_guards(&vm, &assumptions, &runtime, &patcher)?;
    /// if !outcome.is_committed() {
    ///     // the guards already point at the fallback paths
    /// }
    /// ```
    pub fn commit_side_effect_guards(
        &self,
        vm: &dyn ClassHierarchyVm,
        assumptions: &SideEffectAssumptions,
        runtime: &RuntimeAssumptionTable,
        patcher: &dyn GuardPatcher,
    ) -> Result<CommitOutcome> {
        self.lock()?
            .commit_side_effect_guards(vm, assumptions, runtime, patcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        guards::{ArtifactId, GuardSite},
        test::{MockVm, RecordingPatcher},
    };

    const ARTIFACT: ArtifactId = ArtifactId(42);
    const BASE: ClassId = ClassId(0x1000);
    const KNOWN: ClassId = ClassId(0x2000);
    const FRESH: ClassId = ClassId(0x3000);
    const FOO: ClassId = ClassId(0x4000);

    fn two_sites(assumptions: &mut SideEffectAssumptions) {
        assumptions.add_guard_site(GuardSite::new(CodeAddress(0x100), CodeAddress(0x180)));
        assumptions.add_guard_site(GuardSite::new(CodeAddress(0x200), CodeAddress(0x280)));
    }

    fn foo_should_not_load() -> SideEffectAssumptions {
        let mut assumptions = SideEffectAssumptions::new(ARTIFACT);
        assumptions.add_class_load_check(ClassLoadCheck::for_class_name("Foo"));
        two_sites(&mut assumptions);
        assumptions
    }

    #[test]
    fn test_loaded_class_compensates() -> Result<()> {
        let vm = MockVm::new();
        let hierarchy = PersistentClassHierarchy::new();
        let runtime = RuntimeAssumptionTable::new();
        let patcher = RecordingPatcher::new();
        vm.define_class(FOO, "Foo");
        hierarchy.class_loaded(FOO)?;

        let outcome =
            hierarchy.commit_side_effect_guards(&vm, &foo_should_not_load(), &runtime, &patcher)?;
        assert_eq!(outcome, CommitOutcome::Compensated { sites: 2 });
        assert_eq!(patcher.count_for(CodeAddress(0x100)), 1);
        assert_eq!(patcher.count_for(CodeAddress(0x200)), 1);
        assert_eq!(patcher.destination_of(CodeAddress(0x200)), Some(CodeAddress(0x280)));
        assert!(runtime.is_empty());
        Ok(())
    }

    #[test]
    fn test_hooks_fire_on_later_load() -> Result<()> {
        let vm = MockVm::new();
        let hierarchy = PersistentClassHierarchy::new();
        let runtime = RuntimeAssumptionTable::new();
        let patcher = RecordingPatcher::new();
        vm.define_class(BASE, "app/Base");
        hierarchy.class_loaded(BASE)?;

        let outcome =
            hierarchy.commit_side_effect_guards(&vm, &foo_should_not_load(), &runtime, &patcher)?;
        assert_eq!(
            outcome,
            CommitOutcome::Committed {
                pre_initialize_hooks: true,
                extend_hooks: false
            }
        );
        assert_eq!(patcher.total(), 0);
        assert_eq!(runtime.pre_initialize_count(), 2);

        vm.define_class(FOO, "Foo");
        hierarchy.class_loaded(FOO)?;
        let signature = class_name_to_signature(&vm.class_name(FOO));
        assert_eq!(runtime.notify_class_load(&signature, &patcher), 2);
        assert_eq!(runtime.notify_class_load(&signature, &patcher), 0);

        assert_eq!(patcher.count_for(CodeAddress(0x100)), 1);
        assert_eq!(patcher.count_for(CodeAddress(0x200)), 1);
        Ok(())
    }

    #[test]
    fn test_name_length_cached_and_unloaded_ignored() -> Result<()> {
        let vm = MockVm::new();
        let hierarchy = PersistentClassHierarchy::new();
        let runtime = RuntimeAssumptionTable::new();
        let patcher = RecordingPatcher::new();
        vm.define_class(BASE, "app/Base");
        vm.define_class(FOO, "Foo");
        hierarchy.class_loaded(BASE)?;
        hierarchy.class_loaded(FOO)?;
        hierarchy.class_unloaded(FOO)?;

        let outcome =
            hierarchy.commit_side_effect_guards(&vm, &foo_should_not_load(), &runtime, &patcher)?;
        assert!(outcome.is_committed());

        let base = hierarchy.find(BASE)?.unwrap();
        assert_eq!(base.name_length(), Some("Lapp/Base;".len()));
        // Unloaded records are never asked for their name
        assert_eq!(hierarchy.find(FOO)?.unwrap().name_length(), None);
        Ok(())
    }

    #[test]
    fn test_site_without_location_faults() -> Result<()> {
        let vm = MockVm::new();
        let hierarchy = PersistentClassHierarchy::new();
        let runtime = RuntimeAssumptionTable::new();
        let patcher = RecordingPatcher::new();
        vm.define_class(FOO, "Foo");
        hierarchy.class_loaded(FOO)?;

        let mut assumptions = foo_should_not_load();
        assumptions.add_guard_site(GuardSite::unplaced(CodeAddress(0x380)));

        assert!(matches!(
            hierarchy.commit_side_effect_guards(&vm, &assumptions, &runtime, &patcher),
            Err(Error::GuardSiteWithoutLocation)
        ));
        assert_eq!(patcher.total(), 0);
        assert!(runtime.is_empty());
        Ok(())
    }

    /// BASE extended by KNOWN at compile time
    fn extended_base(vm: &MockVm, hierarchy: &PersistentClassHierarchy) -> Result<()> {
        vm.define_class(BASE, "app/Base");
        vm.define_class(KNOWN, "app/Known");
        hierarchy.class_loaded(BASE)?;
        hierarchy.class_loaded(KNOWN)?;
        hierarchy.add_subclass(BASE, KNOWN)?;
        vm.mark_extended(BASE);
        Ok(())
    }

    #[test]
    fn test_extension_named_by_another_check() -> Result<()> {
        let vm = MockVm::new();
        let hierarchy = PersistentClassHierarchy::new();
        let runtime = RuntimeAssumptionTable::new();
        let patcher = RecordingPatcher::new();
        extended_base(&vm, &hierarchy)?;

        let mut assumptions = SideEffectAssumptions::new(ARTIFACT);
        assumptions.add_class_extend_check(ClassExtendCheck::new(BASE));
        assumptions.add_class_extend_check(ClassExtendCheck::new(KNOWN));
        two_sites(&mut assumptions);

        let outcome = hierarchy.commit_side_effect_guards(&vm, &assumptions, &runtime, &patcher)?;
        assert_eq!(
            outcome,
            CommitOutcome::Committed {
                pre_initialize_hooks: false,
                extend_hooks: true
            }
        );
        assert_eq!(runtime.extend_count(), 4);

        assert_eq!(runtime.notify_class_extend(BASE, &patcher), 2);
        assert_eq!(runtime.notify_class_extend(KNOWN, &patcher), 0);
        assert_eq!(patcher.total(), 2);
        Ok(())
    }

    #[test]
    fn test_new_subclass_compensates() -> Result<()> {
        let vm = MockVm::new();
        let hierarchy = PersistentClassHierarchy::new();
        let runtime = RuntimeAssumptionTable::new();
        let patcher = RecordingPatcher::new();
        extended_base(&vm, &hierarchy)?;
        vm.define_class(FRESH, "app/Fresh");
        hierarchy.class_loaded(FRESH)?;
        hierarchy.add_subclass(KNOWN, FRESH)?;

        let mut assumptions = SideEffectAssumptions::new(ARTIFACT);
        assumptions.add_class_extend_check(ClassExtendCheck::new(BASE));
        assumptions.add_class_extend_check(ClassExtendCheck::new(KNOWN));
        two_sites(&mut assumptions);

        let outcome = hierarchy.commit_side_effect_guards(&vm, &assumptions, &runtime, &patcher)?;
        assert_eq!(outcome, CommitOutcome::Compensated { sites: 2 });
        assert!(runtime.is_empty());
        Ok(())
    }

    #[test]
    fn test_extended_class_without_record() -> Result<()> {
        let vm = MockVm::new();
        let hierarchy = PersistentClassHierarchy::new();
        let runtime = RuntimeAssumptionTable::new();
        let patcher = RecordingPatcher::new();

        let mut assumptions = SideEffectAssumptions::new(ARTIFACT);
        assumptions.add_class_extend_check(ClassExtendCheck::new(BASE));
        two_sites(&mut assumptions);

        // Not extended and no record: nothing to hook the class to
        assert!(matches!(
            hierarchy.commit_side_effect_guards(&vm, &assumptions, &runtime, &patcher),
            Err(Error::MissingClassInfo(class)) if class == BASE
        ));
        assert!(runtime.is_empty());

        // Extended and no record: the subclasses cannot be enumerated
        vm.mark_extended(BASE);
        let outcome = hierarchy.commit_side_effect_guards(&vm, &assumptions, &runtime, &patcher)?;
        assert_eq!(outcome, CommitOutcome::Compensated { sites: 2 });
        Ok(())
    }

    #[test]
    fn test_empty_assumptions_commit() -> Result<()> {
        let vm = MockVm::new();
        let hierarchy = PersistentClassHierarchy::new();
        let runtime = RuntimeAssumptionTable::new();
        let patcher = RecordingPatcher::new();

        let mut assumptions = SideEffectAssumptions::new(ARTIFACT);
        two_sites(&mut assumptions);

        let table = hierarchy.lock()?;
        let outcome = table.commit_side_effect_guards(&vm, &assumptions, &runtime, &patcher)?;
        assert_eq!(
            outcome,
            CommitOutcome::Committed {
                pre_initialize_hooks: false,
                extend_hooks: false
            }
        );
        assert!(runtime.is_empty());
        Ok(())
    }
}
