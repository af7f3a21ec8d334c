//! Shared fixtures for unit tests: an in-memory VM, resolved methods and a patcher that
//! records what it was asked to patch.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use crate::{
    guards::CodeAddress,
    hierarchy::ClassId,
    vm::{ClassHierarchyVm, GuardPatcher, MethodId, OptLevel, ResolvedMethod, ResolvedMethodRc},
};

/// A resolved method with fixed identity and compiled state
pub struct MockMethod {
    id: MethodId,
    class: ClassId,
    level: Option<OptLevel>,
    overridden: bool,
}

impl MockMethod {
    // Helper function to create a method that has no compiled body yet
    pub fn interpreted(id: usize, class: ClassId) -> Arc<MockMethod> {
        Arc::new(MockMethod {
            id: MethodId::new(id),
            class,
            level: None,
            overridden: false,
        })
    }

    // Helper function to create a method compiled at `level`
    pub fn compiled(id: usize, class: ClassId, level: OptLevel) -> Arc<MockMethod> {
        Arc::new(MockMethod {
            id: MethodId::new(id),
            class,
            level: Some(level),
            overridden: false,
        })
    }

    // Helper function to create an interpreted method the VM knows to be overridden
    pub fn overridden(id: usize, class: ClassId) -> Arc<MockMethod> {
        Arc::new(MockMethod {
            id: MethodId::new(id),
            class,
            level: None,
            overridden: true,
        })
    }
}

impl ResolvedMethod for MockMethod {
    fn identity(&self) -> MethodId {
        self.id
    }

    fn declaring_class(&self) -> ClassId {
        self.class
    }

    fn is_interpreted(&self) -> bool {
        self.level.is_none()
    }

    fn compiled_level(&self) -> Option<OptLevel> {
        self.level
    }

    fn is_overridden(&self) -> bool {
        self.overridden
    }

    fn signature(&self) -> String {
        format!("{}.m{}()V", self.class, self.id.value())
    }

    fn invocation_count(&self) -> i32 {
        if self.level.is_some() {
            1000
        } else {
            0
        }
    }
}

#[derive(Default)]
struct MockClass {
    name: String,
    interface: bool,
    abstract_class: bool,
    extended: bool,
    vtable: HashMap<u32, Arc<MockMethod>>,
    itable: HashMap<u32, Arc<MockMethod>>,
}

/// In-memory stand-in for the VM's class introspection
///
/// Classes that were never defined are concrete, unnamed and resolve nothing.
#[derive(Default)]
pub struct MockVm {
    classes: RwLock<HashMap<ClassId, MockClass>>,
}

impl MockVm {
    pub fn new() -> Self {
        Self::default()
    }

    fn define(&self, class: ClassId, name: &str, interface: bool, abstract_class: bool) {
        let mut classes = self.classes.write().unwrap();
        let entry = classes.entry(class).or_default();
        entry.name = name.to_string();
        entry.interface = interface;
        entry.abstract_class = abstract_class;
    }

    pub fn define_class(&self, class: ClassId, name: &str) {
        self.define(class, name, false, false);
    }

    pub fn define_interface(&self, class: ClassId, name: &str) {
        self.define(class, name, true, false);
    }

    pub fn define_abstract(&self, class: ClassId, name: &str) {
        self.define(class, name, false, true);
    }

    pub fn mark_extended(&self, class: ClassId) {
        self.classes
            .write()
            .unwrap()
            .entry(class)
            .or_default()
            .extended = true;
    }

    pub fn set_virtual(&self, class: ClassId, slot: u32, method: Arc<MockMethod>) {
        self.classes
            .write()
            .unwrap()
            .entry(class)
            .or_default()
            .vtable
            .insert(slot, method);
    }

    pub fn set_interface_method(&self, class: ClassId, cp_index: u32, method: Arc<MockMethod>) {
        self.classes
            .write()
            .unwrap()
            .entry(class)
            .or_default()
            .itable
            .insert(cp_index, method);
    }

    fn with_class<T>(&self, class: ClassId, f: impl FnOnce(&MockClass) -> T) -> Option<T> {
        self.classes.read().unwrap().get(&class).map(f)
    }
}

impl ClassHierarchyVm for MockVm {
    fn class_name(&self, class: ClassId) -> String {
        self.with_class(class, |c| c.name.clone())
            .unwrap_or_else(|| class.to_string())
    }

    fn is_interface(&self, class: ClassId) -> bool {
        self.with_class(class, |c| c.interface).unwrap_or(false)
    }

    fn is_abstract(&self, class: ClassId) -> bool {
        self.with_class(class, |c| c.abstract_class).unwrap_or(false)
    }

    fn has_been_extended(&self, class: ClassId) -> bool {
        self.with_class(class, |c| c.extended).unwrap_or(false)
    }

    fn resolved_virtual_method_id(&self, class: ClassId, slot: u32) -> Option<MethodId> {
        self.with_class(class, |c| c.vtable.get(&slot).map(|m| m.id))
            .flatten()
    }

    fn resolve_virtual_method(
        &self,
        _caller: &dyn ResolvedMethod,
        class: ClassId,
        slot: u32,
    ) -> Option<ResolvedMethodRc> {
        self.with_class(class, |c| c.vtable.get(&slot).cloned())
            .flatten()
            .map(|m| m as ResolvedMethodRc)
    }

    fn resolve_interface_method(
        &self,
        _caller: &dyn ResolvedMethod,
        class: ClassId,
        cp_index: u32,
    ) -> Option<ResolvedMethodRc> {
        self.with_class(class, |c| c.itable.get(&cp_index).cloned())
            .flatten()
            .map(|m| m as ResolvedMethodRc)
    }

    fn resolved_methods(&self, class: ClassId) -> Vec<ResolvedMethodRc> {
        self.with_class(class, |c| {
            let mut slots: Vec<_> = c
                .vtable
                .iter()
                .filter(|(_, m)| m.class == class)
                .collect();
            slots.sort_by_key(|(slot, _)| **slot);
            slots
                .into_iter()
                .map(|(_, m)| m.clone() as ResolvedMethodRc)
                .collect()
        })
        .unwrap_or_default()
    }
}

/// Patcher that records every compensation instead of rewriting code
#[derive(Default)]
pub struct RecordingPatcher {
    patches: Mutex<Vec<(CodeAddress, CodeAddress)>>,
}

impl RecordingPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `location` was patched
    pub fn count_for(&self, location: CodeAddress) -> usize {
        self.patches
            .lock()
            .unwrap()
            .iter()
            .filter(|(patched, _)| *patched == location)
            .count()
    }

    /// Destination `location` was last patched to
    pub fn destination_of(&self, location: CodeAddress) -> Option<CodeAddress> {
        self.patches
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(patched, _)| *patched == location)
            .map(|(_, destination)| *destination)
    }

    pub fn total(&self) -> usize {
        self.patches.lock().unwrap().len()
    }
}

impl GuardPatcher for RecordingPatcher {
    fn compensate(&self, location: CodeAddress, destination: CodeAddress) {
        self.patches.lock().unwrap().push((location, destination));
    }
}
