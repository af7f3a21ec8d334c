//! Configuration for hierarchy-based optimizations
//!
//! This module holds the options the hierarchy core reads but never writes: the global
//! kill switch for speculation on the class hierarchy, the visitation cap for subclass
//! walks, and two diagnostic switches.

/// Default upper bound on the number of records a capped subclass walk may visit.
pub const DEFAULT_MAX_VISITED_SUBCLASSES: usize = 500;

/// Options controlling hierarchy-based optimizations
///
/// Every query consults [`HierarchyConfig::disable_hierarchy_opts`] first and returns its
/// conservative answer when it is set, which gives operators one switch that turns off all
/// speculation without touching the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HierarchyConfig {
    /// Disable every optimization that relies on the class hierarchy
    pub disable_hierarchy_opts: bool,

    /// Maximum number of subclasses a capped walk visits before it gives up
    /// Giving up always yields the "unknown" answer of the query
    pub max_visited_subclasses: usize,

    /// Trace every step of the override walk (method, slot, class and each leaf)
    pub trace_overridden_in_hierarchy: bool,

    /// Log every class that gets marked as unloaded
    pub verbose_class_unloading: bool,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            disable_hierarchy_opts: false,
            max_visited_subclasses: DEFAULT_MAX_VISITED_SUBCLASSES,
            trace_overridden_in_hierarchy: false,
            verbose_class_unloading: false,
        }
    }
}

impl HierarchyConfig {
    /// Creates a configuration with all hierarchy-based optimizations switched off
    ///
    /// Queries still run but short-circuit to their conservative answers.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            disable_hierarchy_opts: true,
            ..Self::default()
        }
    }

    /// Creates a configuration with the diagnostic switches enabled
    #[must_use]
    pub fn diagnostic() -> Self {
        Self {
            trace_overridden_in_hierarchy: true,
            verbose_class_unloading: true,
            ..Self::default()
        }
    }

    /// Returns a copy of this configuration with a different visitation cap
    ///
    /// ## Arguments
    /// * `max` - The new upper bound for capped subclass walks
    #[must_use]
    pub fn with_max_visited_subclasses(mut self, max: usize) -> Self {
        self.max_visited_subclasses = max;
        self
    }
}
