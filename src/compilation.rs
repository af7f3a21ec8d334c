//! Per-compilation view of the hierarchy options.
//!
//! A [`CompilationContext`] is what every query receives. It never changes during a
//! compilation and carries the one property of the compilation the hierarchy core cares
//! about besides the options: whether the code is compiled ahead of time, in which case the
//! live, load-order-dependent hierarchy must not be trusted.

use crate::config::HierarchyConfig;

/// Read-only options of a single compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompilationContext {
    config: HierarchyConfig,
    aot: bool,
}

impl CompilationContext {
    /// Creates the context of a just-in-time compilation
    ///
    /// ## Arguments
    /// * `config` - The options in effect for this compilation
    #[must_use]
    pub fn new(config: HierarchyConfig) -> Self {
        CompilationContext { config, aot: false }
    }

    /// Creates the context of an ahead-of-time compilation
    ///
    /// ## Arguments
    /// * `config` - The options in effect for this compilation
    #[must_use]
    pub fn ahead_of_time(config: HierarchyConfig) -> Self {
        CompilationContext { config, aot: true }
    }

    /// The options in effect for this compilation
    #[must_use]
    pub fn config(&self) -> &HierarchyConfig {
        &self.config
    }

    /// Returns `true` for ahead-of-time compilations
    #[must_use]
    pub fn is_aot(&self) -> bool {
        self.aot
    }

    /// Returns `true` when hierarchy-based optimizations are switched off
    #[must_use]
    pub fn hierarchy_opts_disabled(&self) -> bool {
        self.config.disable_hierarchy_opts
    }

    /// The visitation cap for capped subclass walks
    #[must_use]
    pub fn max_visited_subclasses(&self) -> usize {
        self.config.max_visited_subclasses
    }
}
