//! Runtime invalidation hooks for committed side-effect guards.
//!
//! A committed compilation leaves one hook per (assumption, guard site) pair in the
//! [`RuntimeAssumptionTable`]. The VM reports class loads with
//! [`RuntimeAssumptionTable::notify_class_load`] and new subclasses with
//! [`RuntimeAssumptionTable::notify_class_extend`]; every matching hook fires once, patches
//! its guard to the fallback destination and is removed.
//!
//! A class load must be reported to the hierarchy
//! ([`crate::hierarchy::PersistentClassHierarchy::class_loaded`]) before it is reported
//! here. A commit running between the two then sees the loaded class and compensates, and a
//! commit that completed before the load has its hooks fired.
//!
//! # Thread Safety
//!
//! The table is shared by compiler threads (registration) and VM threads (notification)
//! and uses concurrent maps, so it needs no external lock. A guard site that several hooks
//! point at is patched exactly once, no matter how many of them fire or in which order.
//!
//! # Bookkeeping
//!
//! Each artifact with pending hooks has a counter and the set of its guards patched so far.
//! Both go away with the artifact's last pending hook, whether it fired or was reclaimed, so
//! the table holds state only for artifacts that still have something to fire.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::{
    guards::{ArtifactId, CodeAddress},
    hierarchy::ClassId,
    vm::GuardPatcher,
};

/// One registered hook: the guard to patch when its trigger fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGuardSite {
    artifact: ArtifactId,
    location: CodeAddress,
    destination: CodeAddress,
}

impl PatchGuardSite {
    /// Creates a hook patching `location` to `destination` on behalf of `artifact`
    #[must_use]
    pub fn new(artifact: ArtifactId, location: CodeAddress, destination: CodeAddress) -> Self {
        PatchGuardSite {
            artifact,
            location,
            destination,
        }
    }

    /// The compiled artifact owning the guard
    #[must_use]
    pub fn artifact(&self) -> ArtifactId {
        self.artifact
    }

    /// Address of the guard instruction
    #[must_use]
    pub fn location(&self) -> CodeAddress {
        self.location
    }

    /// Fallback destination of the guard
    #[must_use]
    pub fn destination(&self) -> CodeAddress {
        self.destination
    }
}

/// Per-artifact state while the artifact has hooks waiting to fire
#[derive(Default)]
struct ArtifactHooks {
    pending: usize,
    patched: HashSet<CodeAddress>,
}

/// Hooks registered by committed compilations, keyed by what triggers them
#[derive(Default)]
pub struct RuntimeAssumptionTable {
    /// Class pre-initialize hooks, keyed by class signature
    pre_initialize: DashMap<String, Vec<PatchGuardSite>>,
    /// Class extend hooks, keyed by the class that must not be extended
    extend: DashMap<ClassId, Vec<PatchGuardSite>>,
    /// Artifacts with pending hooks
    artifacts: DashMap<ArtifactId, ArtifactHooks>,
}

impl RuntimeAssumptionTable {
    /// Creates an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook that fires when a class with signature `signature` loads
    ///
    /// ## Arguments
    /// * `signature` - Class signature, e.g. `Lapp/Foo;`
    /// * `site` - The guard to patch
    pub fn register_class_pre_initialize(&self, signature: &str, site: PatchGuardSite) {
        self.track(site.artifact);
        self.pre_initialize
            .entry(signature.to_string())
            .or_default()
            .push(site);
    }

    /// Register a hook that fires when `class` gets a new subclass
    ///
    /// ## Arguments
    /// * `class` - The class that must not be extended
    /// * `site` - The guard to patch
    pub fn register_class_extend(&self, class: ClassId, site: PatchGuardSite) {
        self.track(site.artifact);
        self.extend.entry(class).or_default().push(site);
    }

    /// Counts a hook of `artifact` as pending before it becomes visible to notifications
    fn track(&self, artifact: ArtifactId) {
        self.artifacts.entry(artifact).or_default().pending += 1;
    }

    /// Fire and remove every hook registered for `signature`.
    ///
    /// Returns the number of guards patched by this call. Notifying a name without hooks,
    /// or notifying the same name again, patches nothing.
    ///
    /// # Arguments
    /// * `signature` - Signature of the class being loaded
    /// * `patcher` - Rewrites the guards
    pub fn notify_class_load(&self, signature: &str, patcher: &dyn GuardPatcher) -> usize {
        let Some((_, sites)) = self.pre_initialize.remove(signature) else {
            return 0;
        };
        let patched = self.fire(&sites, patcher);
        tracing::debug!(
            class = signature,
            hooks = sites.len(),
            patched,
            "class pre-initialize hooks fired"
        );
        patched
    }

    /// Fire and remove every hook registered for `class`.
    ///
    /// Returns the number of guards patched by this call.
    ///
    /// # Arguments
    /// * `class` - The class that got a new subclass
    /// * `patcher` - Rewrites the guards
    pub fn notify_class_extend(&self, class: ClassId, patcher: &dyn GuardPatcher) -> usize {
        let Some((_, sites)) = self.extend.remove(&class) else {
            return 0;
        };
        let patched = self.fire(&sites, patcher);
        tracing::debug!(class = %class, hooks = sites.len(), patched, "class extend hooks fired");
        patched
    }

    fn fire(&self, sites: &[PatchGuardSite], patcher: &dyn GuardPatcher) -> usize {
        let mut patched = 0;
        for site in sites {
            if self.settle(site) {
                patcher.compensate(site.location, site.destination);
                patched += 1;
            }
        }
        patched
    }

    /// Retires one fired hook, returning `true` if its guard is not patched yet
    fn settle(&self, site: &PatchGuardSite) -> bool {
        let (first, done) = {
            let Some(mut hooks) = self.artifacts.get_mut(&site.artifact) else {
                return false;
            };
            hooks.pending = hooks.pending.saturating_sub(1);
            (hooks.patched.insert(site.location), hooks.pending == 0)
        };
        if done {
            self.artifacts
                .remove_if(&site.artifact, |_, hooks| hooks.pending == 0);
        }
        first
    }

    /// Returns `true` if the guard at `location` of `artifact` has been patched while the
    /// artifact still has other hooks pending
    ///
    /// Once the last hook of an artifact has fired its record is dropped and this returns
    /// `false` again.
    #[must_use]
    pub fn is_patched(&self, artifact: ArtifactId, location: CodeAddress) -> bool {
        self.artifacts
            .get(&artifact)
            .is_some_and(|hooks| hooks.patched.contains(&location))
    }

    /// Number of artifacts that still have hooks waiting to fire
    #[must_use]
    pub fn tracked_artifacts(&self) -> usize {
        self.artifacts.len()
    }

    /// Drop every pending hook and patch record of `artifact`, whose code has been discarded.
    ///
    /// Returns the number of hooks removed.
    pub fn reclaim_artifact(&self, artifact: ArtifactId) -> usize {
        let mut removed = 0;
        self.pre_initialize.retain(|_, sites| {
            removed += drop_artifact(sites, artifact);
            !sites.is_empty()
        });
        self.extend.retain(|_, sites| {
            removed += drop_artifact(sites, artifact);
            !sites.is_empty()
        });
        self.artifacts.remove(&artifact);

        tracing::debug!(%artifact, removed, "artifact hooks reclaimed");
        removed
    }

    /// Number of class pre-initialize hooks waiting to fire
    #[must_use]
    pub fn pre_initialize_count(&self) -> usize {
        self.pre_initialize.iter().map(|entry| entry.value().len()).sum()
    }

    /// Number of class extend hooks waiting to fire
    #[must_use]
    pub fn extend_count(&self) -> usize {
        self.extend.iter().map(|entry| entry.value().len()).sum()
    }

    /// Returns `true` if no hook is waiting to fire
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pre_initialize.is_empty() && self.extend.is_empty()
    }
}

fn drop_artifact(sites: &mut Vec<PatchGuardSite>, artifact: ArtifactId) -> usize {
    let before = sites.len();
    sites.retain(|site| site.artifact != artifact);
    before - sites.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::RecordingPatcher;

    const FIRST: ArtifactId = ArtifactId(1);
    const SECOND: ArtifactId = ArtifactId(2);

    fn site(artifact: ArtifactId, location: usize) -> PatchGuardSite {
        PatchGuardSite::new(artifact, CodeAddress(location), CodeAddress(location + 0x80))
    }

    #[test]
    fn test_class_load_fires_once() {
        let table = RuntimeAssumptionTable::new();
        let patcher = RecordingPatcher::new();
        table.register_class_pre_initialize("Lapp/Foo;", site(FIRST, 0x1000));
        table.register_class_pre_initialize("Lapp/Foo;", site(FIRST, 0x2000));
        table.register_class_pre_initialize("Lapp/Bar;", site(FIRST, 0x3000));
        assert_eq!(table.pre_initialize_count(), 3);

        assert_eq!(table.notify_class_load("Lapp/Unrelated;", &patcher), 0);
        assert_eq!(table.notify_class_load("Lapp/Foo;", &patcher), 2);
        assert_eq!(table.notify_class_load("Lapp/Foo;", &patcher), 0);

        assert_eq!(patcher.count_for(CodeAddress(0x1000)), 1);
        assert_eq!(patcher.count_for(CodeAddress(0x2000)), 1);
        assert_eq!(patcher.destination_of(CodeAddress(0x1000)), Some(CodeAddress(0x1080)));
        assert_eq!(table.pre_initialize_count(), 1);
        assert!(table.is_patched(FIRST, CodeAddress(0x1000)));
        assert!(!table.is_patched(FIRST, CodeAddress(0x3000)));
    }

    #[test]
    fn test_shared_site_patched_once() {
        let table = RuntimeAssumptionTable::new();
        let patcher = RecordingPatcher::new();
        let class = ClassId::new(0x500);

        // One guard protecting two assumptions
        table.register_class_pre_initialize("Lapp/Foo;", site(FIRST, 0x1000));
        table.register_class_extend(class, site(FIRST, 0x1000));

        assert_eq!(table.notify_class_extend(class, &patcher), 1);
        assert_eq!(table.notify_class_load("Lapp/Foo;", &patcher), 0);
        assert_eq!(patcher.count_for(CodeAddress(0x1000)), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_same_location_in_two_artifacts() {
        let table = RuntimeAssumptionTable::new();
        let patcher = RecordingPatcher::new();
        table.register_class_pre_initialize("Lapp/Foo;", site(FIRST, 0x1000));
        table.register_class_pre_initialize("Lapp/Foo;", site(SECOND, 0x1000));

        assert_eq!(table.notify_class_load("Lapp/Foo;", &patcher), 2);
        assert_eq!(table.tracked_artifacts(), 0);
    }

    #[test]
    fn test_fired_artifacts_are_forgotten() {
        let table = RuntimeAssumptionTable::new();
        let patcher = RecordingPatcher::new();

        // Many short-lived artifacts whose hooks all fire, none of them ever reclaimed
        for n in 0..1000u64 {
            let artifact = ArtifactId::new(n);
            let location = 0x10_0000 + n as usize * 0x100;
            table.register_class_pre_initialize("Lapp/Foo;", site(artifact, location));
            table.register_class_extend(ClassId::new(0x500), site(artifact, location));
        }
        assert_eq!(table.tracked_artifacts(), 1000);

        assert_eq!(table.notify_class_load("Lapp/Foo;", &patcher), 1000);
        // Each artifact still waits on its extend hook and remembers the patched guard
        assert_eq!(table.tracked_artifacts(), 1000);
        assert!(table.is_patched(ArtifactId::new(7), CodeAddress(0x10_0700)));

        assert_eq!(table.notify_class_extend(ClassId::new(0x500), &patcher), 0);
        assert_eq!(table.tracked_artifacts(), 0);
        assert!(table.is_empty());
        assert_eq!(patcher.total(), 1000);
    }

    #[test]
    fn test_reclaim_artifact() {
        let table = RuntimeAssumptionTable::new();
        let patcher = RecordingPatcher::new();
        let class = ClassId::new(0x500);
        table.register_class_pre_initialize("Lapp/Foo;", site(FIRST, 0x1000));
        table.register_class_pre_initialize("Lapp/Foo;", site(SECOND, 0x2000));
        table.register_class_extend(class, site(FIRST, 0x1000));

        assert_eq!(table.reclaim_artifact(FIRST), 2);
        assert_eq!(table.pre_initialize_count(), 1);
        assert_eq!(table.extend_count(), 0);

        assert_eq!(table.notify_class_extend(class, &patcher), 0);
        assert_eq!(table.notify_class_load("Lapp/Foo;", &patcher), 1);
        assert_eq!(patcher.count_for(CodeAddress(0x1000)), 0);
        assert_eq!(patcher.count_for(CodeAddress(0x2000)), 1);
        assert_eq!(table.reclaim_artifact(FIRST), 0);
        assert_eq!(table.tracked_artifacts(), 0);
    }
}
