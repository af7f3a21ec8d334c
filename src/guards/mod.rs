//! Side-effect guards and their commitment.
//!
//! A compilation that speculates on the class hierarchy emits guard sites, patchable
//! instructions that fall through to the optimized path while the speculation holds, and
//! records the hierarchy facts the speculation relies on:
//!
//! - [`ClassLoadCheck`]: no class with this name is loaded
//! - [`ClassExtendCheck`]: this class gets no new subclass
//!
//! At the end of the compilation, [`SideEffectAssumptions`] are committed with
//! [`crate::hierarchy::PersistentClassHierarchy::commit_side_effect_guards`]. The commit
//! re-validates every assumption against the live hierarchy. If all of them still hold,
//! runtime hooks are registered in a [`RuntimeAssumptionTable`] so that a later class load or
//! extension patches the guards. Otherwise every guard site is patched to its fallback
//! destination right away.
//!
//! # Examples
//!
//! ```rust
//! use hierscope::guards::{
//!     ArtifactId, ClassLoadCheck, CodeAddress, GuardSite, SideEffectAssumptions,
//! };
//!
//! let mut assumptions = SideEffectAssumptions::new(ArtifactId::new(1));
//! assumptions.add_class_load_check(ClassLoadCheck::for_class_name("app/Plugin"));
//! assumptions.add_guard_site(GuardSite::new(CodeAddress(0x4000), CodeAddress(0x4100)));
//!
//! assert_eq!(assumptions.classes_not_loaded()[0].name(), "Lapp/Plugin;");
//! assert_eq!(assumptions.guard_sites().len(), 1);
//! ```

mod commit;
mod runtime;

use std::fmt;

use crate::hierarchy::{class_name_to_signature, ClassId};

pub use runtime::{PatchGuardSite, RuntimeAssumptionTable};

/// Address of an instruction in compiled code
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeAddress(pub usize);

impl fmt::Debug for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeAddress(0x{:x})", self.0)
    }
}

impl fmt::Display for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Identity of the compiled artifact (method body) that owns guard sites and hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactId(pub u64);

impl ArtifactId {
    /// Creates a new artifact identity
    #[must_use]
    pub fn new(value: u64) -> Self {
        ArtifactId(value)
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "artifact#{}", self.0)
    }
}

/// A patchable guard emitted into compiled code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardSite {
    location: Option<CodeAddress>,
    destination: CodeAddress,
}

impl GuardSite {
    /// Creates a guard site at `location` falling back to `destination`
    #[must_use]
    pub fn new(location: CodeAddress, destination: CodeAddress) -> Self {
        GuardSite {
            location: Some(location),
            destination,
        }
    }

    /// Creates a guard site whose instruction has not been placed yet
    ///
    /// Committing a site without location is a fault.
    #[must_use]
    pub fn unplaced(destination: CodeAddress) -> Self {
        GuardSite {
            location: None,
            destination,
        }
    }

    /// Address of the guard instruction, once placed
    #[must_use]
    pub fn location(&self) -> Option<CodeAddress> {
        self.location
    }

    /// Where the guard jumps once patched
    #[must_use]
    pub fn destination(&self) -> CodeAddress {
        self.destination
    }

    /// Records the address of the guard instruction
    pub fn set_location(&mut self, location: CodeAddress) {
        self.location = Some(location);
    }
}

/// Assumption that no class with a given name is loaded
///
/// The name is kept in signature form (`Ljava/lang/Foo;`), which is also the key the
/// runtime hook is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassLoadCheck {
    name: String,
}

impl ClassLoadCheck {
    /// Creates a check from a class signature
    ///
    /// ## Arguments
    /// * `signature` - The class name in signature form, e.g. `Lapp/Foo;`
    #[must_use]
    pub fn new(signature: impl Into<String>) -> Self {
        ClassLoadCheck {
            name: signature.into(),
        }
    }

    /// Creates a check from an internal class name such as `app/Foo`
    #[must_use]
    pub fn for_class_name(name: &str) -> Self {
        Self::new(class_name_to_signature(name))
    }

    /// The class signature
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length of the class signature in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.name.len()
    }

    /// Returns `true` for an empty signature, which matches no class
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

/// Assumption that a class gets no new subclass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassExtendCheck {
    class: ClassId,
}

impl ClassExtendCheck {
    /// Creates a check for `class`
    #[must_use]
    pub fn new(class: ClassId) -> Self {
        ClassExtendCheck { class }
    }

    /// The class that must not be newly extended
    #[must_use]
    pub fn class(&self) -> ClassId {
        self.class
    }
}

/// Everything a compilation assumed about the hierarchy, plus the guards protecting it
///
/// Built up while compiling and consumed once at commit.
#[derive(Debug, Clone)]
pub struct SideEffectAssumptions {
    artifact: ArtifactId,
    classes_not_loaded: Vec<ClassLoadCheck>,
    classes_not_extended: Vec<ClassExtendCheck>,
    guard_sites: Vec<GuardSite>,
}

impl SideEffectAssumptions {
    /// Creates an empty assumption set for `artifact`
    #[must_use]
    pub fn new(artifact: ArtifactId) -> Self {
        SideEffectAssumptions {
            artifact,
            classes_not_loaded: Vec::new(),
            classes_not_extended: Vec::new(),
            guard_sites: Vec::new(),
        }
    }

    /// The artifact these assumptions belong to
    #[must_use]
    pub fn artifact(&self) -> ArtifactId {
        self.artifact
    }

    /// Assume that no class named by `check` gets loaded
    pub fn add_class_load_check(&mut self, check: ClassLoadCheck) {
        self.classes_not_loaded.push(check);
    }

    /// Assume that the class of `check` gets no new subclass
    pub fn add_class_extend_check(&mut self, check: ClassExtendCheck) {
        self.classes_not_extended.push(check);
    }

    /// Add a guard site protecting the assumptions
    pub fn add_guard_site(&mut self, site: GuardSite) {
        self.guard_sites.push(site);
    }

    /// Class names that must stay unloaded
    #[must_use]
    pub fn classes_not_loaded(&self) -> &[ClassLoadCheck] {
        &self.classes_not_loaded
    }

    /// Classes that must not be newly extended
    #[must_use]
    pub fn classes_not_extended(&self) -> &[ClassExtendCheck] {
        &self.classes_not_extended
    }

    /// Guard sites of the compilation
    #[must_use]
    pub fn guard_sites(&self) -> &[GuardSite] {
        &self.guard_sites
    }

    /// Returns `true` if `class` is named by one of the extend checks
    #[must_use]
    pub fn is_extend_checked(&self, class: ClassId) -> bool {
        self.classes_not_extended
            .iter()
            .any(|check| check.class() == class)
    }
}

/// Result of committing side-effect guards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The assumptions hold and runtime hooks were registered
    Committed {
        /// At least one class pre-initialize hook was registered
        pre_initialize_hooks: bool,
        /// At least one class extend hook was registered
        extend_hooks: bool,
    },
    /// An assumption no longer holds and every guard site was patched
    Compensated {
        /// Number of guard sites patched
        sites: usize,
    },
}

impl CommitOutcome {
    /// Returns `true` if the optimized code paths stay active
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed { .. })
    }
}
