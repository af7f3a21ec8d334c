//! Bounded traversal over subclass links.
//!
//! Every implementer and subclass query walks the hierarchy below some root through a
//! [`SubclassVisitor`]. The visitor is one engine parameterized by a callback instead of a
//! family of visitor types: the callback sees each record once and decides whether to
//! descend, prune or stop.
//!
//! # Visitation cap
//!
//! A visitor built with [`SubclassVisitor::with_cap`] stops as soon as visiting one more
//! record would exceed the cap and reports [`WalkOutcome::CapExceeded`]. Callers must read
//! that as "unknown": the walk gave up collecting evidence, it did not prove absence.
//!
//! # Markers
//!
//! Records are marked with the transient visited flag while a walk is in progress so that
//! classes reachable along several paths (interfaces make the hierarchy a DAG) are seen once.
//! The visitor clears its own marks when the walk ends, also when the callback panics.
//! Walks therefore must not nest: a walk started from inside another walk's callback would
//! skip everything the outer walk has marked.
//!
//! # Order
//!
//! Depth-first pre-order following link order. Queries only depend on uniqueness or
//! existence properties, never on the order.

use std::sync::Arc;

use crate::hierarchy::{ClassInfoRc, ClassTable};

/// Decision of a visitor callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Continue with the subclasses of this record
    Continue,
    /// Do not descend below this record, continue elsewhere
    Prune,
    /// End the walk
    Stop,
}

/// How a walk ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    /// Every reachable, loaded record was offered to the callback
    Completed,
    /// The callback returned [`Visit::Stop`]
    Stopped,
    /// The visitation cap was reached before the walk could finish
    CapExceeded,
}

/// Bounded depth-first walk over the subclasses of a record
///
/// Borrowing the [`ClassTable`] ties the walk to the hierarchy lock: subclass links and
/// markers cannot change while it runs.
///
/// # Examples
///
/// ```rust
/// use hierscope::hierarchy::{ClassId, PersistentClassHierarchy, SubclassVisitor, Visit, WalkOutcome};
///
/// let hierarchy = PersistentClassHierarchy::new();
/// for id in [0x100, 0x200, 0x300] {
///     hierarchy.class_loaded(ClassId::new(id))?;
/// }
/// hierarchy.add_subclass(ClassId::new(0x100), ClassId::new(0x200))?;
/// hierarchy.add_subclass(ClassId::new(0x100), ClassId::new(0x300))?;
///
/// let table = hierarchy.lock()?;
/// let root = table.find(ClassId::new(0x100)).unwrap();
///
/// let mut seen = Vec::new();
/// let outcome = SubclassVisitor::new(&table).visit(root, false, |info| {
///     seen.push(info.class_id());
///     Visit::Continue
/// });
/// assert_eq!(outcome, WalkOutcome::Completed);
/// assert_eq!(seen.len(), 2);
///
/// let capped = SubclassVisitor::new(&table)
///     .with_cap(1)
///     .visit(root, false, |_| Visit::Continue);
/// assert_eq!(capped, WalkOutcome::CapExceeded);
/// # Ok::<(), hierscope::Error>(())
/// ```
pub struct SubclassVisitor<'t> {
    table: &'t ClassTable,
    max_visits: Option<usize>,
    visits: usize,
    marked: Vec<ClassInfoRc>,
}

impl<'t> SubclassVisitor<'t> {
    /// Create an uncapped visitor
    ///
    /// ## Arguments
    /// * `table` - The locked table whose records are walked
    #[must_use]
    pub fn new(table: &'t ClassTable) -> Self {
        SubclassVisitor {
            table,
            max_visits: None,
            visits: 0,
            marked: Vec::new(),
        }
    }

    /// Limit the number of records offered to the callback
    ///
    /// ## Arguments
    /// * `max_visits` - Upper bound on callback invocations per walk
    #[must_use]
    pub fn with_cap(mut self, max_visits: usize) -> Self {
        self.max_visits = Some(max_visits);
        self
    }

    /// Number of records offered to the callback during the last walk
    #[must_use]
    pub fn visits(&self) -> usize {
        self.visits
    }

    /// Walk the transitive subclasses of `root`.
    ///
    /// Unloaded records and everything below them are skipped. Each remaining record is
    /// offered to `callback` at most once. `root` must be a record of the borrowed table,
    /// since only that table's lock is held.
    ///
    /// # Arguments
    /// * `root` - Where the walk starts
    /// * `include_root` - Offer `root` itself to the callback first
    /// * `callback` - Decides, per record, how the walk continues
    pub fn visit<F>(&mut self, root: &ClassInfoRc, include_root: bool, mut callback: F) -> WalkOutcome
    where
        F: FnMut(&ClassInfoRc) -> Visit,
    {
        debug_assert!(
            self.table
                .find(root.class_id())
                .is_some_and(|own| Arc::ptr_eq(own, root)),
            "walk rooted at a record of another table"
        );
        self.visits = 0;
        let outcome = self.walk(root, include_root, &mut callback);
        self.clear_marks();
        outcome
    }

    fn walk<F>(&mut self, root: &ClassInfoRc, include_root: bool, callback: &mut F) -> WalkOutcome
    where
        F: FnMut(&ClassInfoRc) -> Visit,
    {
        if root.is_unloaded() {
            return WalkOutcome::Completed;
        }
        self.mark(root);

        if include_root {
            if self.cap_reached() {
                return WalkOutcome::CapExceeded;
            }
            self.visits += 1;
            match callback(root) {
                Visit::Stop => return WalkOutcome::Stopped,
                Visit::Prune => return WalkOutcome::Completed,
                Visit::Continue => {}
            }
        }

        let mut stack = Vec::new();
        self.push_subclasses(root, &mut stack);

        while let Some(info) = stack.pop() {
            if info.is_unloaded() {
                continue;
            }
            if self.cap_reached() {
                return WalkOutcome::CapExceeded;
            }
            self.visits += 1;
            match callback(&info) {
                Visit::Stop => return WalkOutcome::Stopped,
                Visit::Prune => {}
                Visit::Continue => self.push_subclasses(&info, &mut stack),
            }
        }

        WalkOutcome::Completed
    }

    fn cap_reached(&self) -> bool {
        self.max_visits.is_some_and(|max| self.visits >= max)
    }

    /// Push unmarked subclasses in reverse so that they pop in link order
    fn push_subclasses(&mut self, info: &ClassInfoRc, stack: &mut Vec<ClassInfoRc>) {
        let subclasses: Vec<&ClassInfoRc> = info.subclasses().collect();
        for sub in subclasses.into_iter().rev() {
            if self.mark(sub) {
                stack.push(sub.clone());
            }
        }
    }

    fn mark(&mut self, info: &ClassInfoRc) -> bool {
        if info.set_visited() {
            self.marked.push(info.clone());
            true
        } else {
            false
        }
    }

    fn clear_marks(&mut self) {
        for info in self.marked.drain(..) {
            info.reset_visited();
        }
    }
}

impl Drop for SubclassVisitor<'_> {
    fn drop(&mut self) {
        self.clear_marks();
    }
}

impl ClassTable {
    /// Collect every loaded transitive subclass of `root`, `root` excluded.
    ///
    /// Uncapped: the cost is proportional to the size of the subtree.
    ///
    /// # Arguments
    /// * `root` - Where the walk starts
    #[must_use]
    pub fn collect_all_subclasses(&self, root: &ClassInfoRc) -> Vec<ClassInfoRc> {
        let mut subclasses = Vec::new();
        SubclassVisitor::new(self).visit(root, false, |info| {
            subclasses.push(info.clone());
            Visit::Continue
        });
        subclasses
    }

    /// Collect the leaves below `root`: loaded subclasses without loaded subclasses.
    ///
    /// Uncapped. A root without loaded subclasses has no leaves.
    ///
    /// # Arguments
    /// * `root` - Where the walk starts
    #[must_use]
    pub fn collect_leafs(&self, root: &ClassInfoRc) -> Vec<ClassInfoRc> {
        let mut leafs = Vec::new();
        SubclassVisitor::new(self).visit(root, false, |info| {
            collect_if_leaf(info, &mut leafs);
            Visit::Continue
        });
        leafs
    }

    /// Collect the leaves below `root` under a visitation cap.
    ///
    /// Returns `None` if the cap was exceeded; a partial leaf set is never returned.
    ///
    /// # Arguments
    /// * `root` - Where the walk starts
    /// * `max_visits` - Upper bound on the number of records visited
    #[must_use]
    pub fn collect_leafs_capped(
        &self,
        root: &ClassInfoRc,
        max_visits: usize,
    ) -> Option<Vec<ClassInfoRc>> {
        let mut leafs = Vec::new();
        let outcome = SubclassVisitor::new(self)
            .with_cap(max_visits)
            .visit(root, false, |info| {
                collect_if_leaf(info, &mut leafs);
                Visit::Continue
            });
        (outcome == WalkOutcome::Completed).then_some(leafs)
    }
}

fn collect_if_leaf(info: &ClassInfoRc, leafs: &mut Vec<ClassInfoRc>) {
    if info.is_leaf() {
        leafs.push(info.clone());
    }
}
