// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]

//! # hierscope
//!
//! The class-hierarchy tracking core of a just-in-time compiler: a persistent, queryable
//! index of the live class hierarchy used to validate and enable speculative optimizations
//! (devirtualization, guarded inlining) whose premises may later become false.
//!
//! ## Features
//!
//! - **Persistent index** - One record per loaded class, tombstoned (never removed) on unload
//! - **Bounded walks** - Every implementer query runs under a visitation cap, and an exceeded
//!   cap is reported as "unknown", never as "no implementer"
//! - **Thread safety** - Class load/unload notifications race freely with compiler threads
//! - **Guard commitment** - Re-validates a compilation's assumptions at the end of the
//!   compile, then either registers invalidation hooks or compensates the guards at once
//!
//! ## Architecture
//!
//! - [`hierarchy`] - The index ([`hierarchy::PersistentClassHierarchy`]), its records, the
//!   bounded subclass visitor and the implementer queries
//! - [`guards`] - Assumption records, the commit protocol and the runtime hook table
//! - [`vm`] - Traits the surrounding virtual machine implements
//! - [`config`] / [`compilation`] - Options and the per-compilation view of them
//! - [`Error`] and [`Result`] - Contract violations
//!
//! ## Quick Start
//!
//! ```rust
//! use hierscope::prelude::*;
//!
//! let hierarchy = PersistentClassHierarchy::new();
//! let base = ClassId::new(0x1000);
//! let derived = ClassId::new(0x2000);
//!
//! hierarchy.class_loaded(base)?;
//! hierarchy.class_loaded(derived)?;
//! hierarchy.add_subclass(base, derived)?;
//!
//! hierarchy.class_unloaded(derived)?;
//! assert!(hierarchy.find(derived)?.unwrap().is_unloaded());
//! # Ok::<(), hierscope::Error>(())
//! ```
//!
//! ## Locking
//!
//! Every method on [`hierarchy::PersistentClassHierarchy`] takes the hierarchy lock for its
//! own duration. A caller that needs several queries to observe one consistent state takes
//! the lock once with [`hierarchy::PersistentClassHierarchy::lock`] and issues the same
//! queries on the returned [`hierarchy::ClassTableGuard`], which performs no further locking.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// ```rust
/// use hierscope::prelude::*;
///
/// let comp = CompilationContext::new(HierarchyConfig::default());
/// assert!(!comp.is_aot());
/// ```
pub mod prelude;

pub mod compilation;
pub mod config;
pub mod guards;
pub mod hierarchy;
pub mod vm;

/// `hierscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `hierscope` Error type
///
/// Only contract violations are errors; see [`Error`] for the taxonomy.
pub use error::Error;
