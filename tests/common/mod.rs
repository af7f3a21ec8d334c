//! Minimal VM used by the integration tests.
//!
//! Each class has a name, a kind, an "extended" bit and a virtual table; interface methods
//! are looked up in the same table.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{atomic::AtomicUsize, atomic::Ordering, Arc, Mutex, RwLock},
};

use hierscope::prelude::*;

pub struct Method {
    pub id: MethodId,
    pub class: ClassId,
    pub level: Option<OptLevel>,
}

impl Method {
    pub fn new(id: usize, class: ClassId, level: Option<OptLevel>) -> Arc<Method> {
        Arc::new(Method {
            id: MethodId::new(id),
            class,
            level,
        })
    }
}

impl ResolvedMethod for Method {
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
        false
    }

    fn signature(&self) -> String {
        format!("m{}", self.id.value())
    }

    fn invocation_count(&self) -> i32 {
        0
    }
}

#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    #[default]
    Concrete,
    Abstract,
    Interface,
}

#[derive(Default)]
struct Class {
    name: String,
    kind: Kind,
    extended: bool,
    methods: HashMap<u32, Arc<Method>>,
}

#[derive(Default)]
pub struct TestVm {
    classes: RwLock<HashMap<ClassId, Class>>,
}

impl TestVm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&self, class: ClassId, name: &str, kind: Kind) {
        let mut classes = self.classes.write().unwrap();
        let entry = classes.entry(class).or_default();
        entry.name = name.to_string();
        entry.kind = kind;
    }

    pub fn set_method(&self, class: ClassId, slot: u32, method: Arc<Method>) {
        self.classes
            .write()
            .unwrap()
            .entry(class)
            .or_default()
            .methods
            .insert(slot, method);
    }

    pub fn mark_extended(&self, class: ClassId) {
        self.classes
            .write()
            .unwrap()
            .entry(class)
            .or_default()
            .extended = true;
    }

    fn kind(&self, class: ClassId) -> Kind {
        self.classes
            .read()
            .unwrap()
            .get(&class)
            .map(|c| c.kind)
            .unwrap_or_default()
    }

    fn method(&self, class: ClassId, slot: u32) -> Option<Arc<Method>> {
        self.classes
            .read()
            .unwrap()
            .get(&class)
            .and_then(|c| c.methods.get(&slot).cloned())
    }
}

impl ClassHierarchyVm for TestVm {
    fn class_name(&self, class: ClassId) -> String {
        self.classes
            .read()
            .unwrap()
            .get(&class)
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }

    fn is_interface(&self, class: ClassId) -> bool {
        self.kind(class) == Kind::Interface
    }

    fn is_abstract(&self, class: ClassId) -> bool {
        self.kind(class) == Kind::Abstract
    }

    fn has_been_extended(&self, class: ClassId) -> bool {
        self.classes
            .read()
            .unwrap()
            .get(&class)
            .is_some_and(|c| c.extended)
    }

    fn resolved_virtual_method_id(&self, class: ClassId, slot: u32) -> Option<MethodId> {
        self.method(class, slot).map(|m| m.id)
    }

    fn resolve_virtual_method(
        &self,
        _caller: &dyn ResolvedMethod,
        class: ClassId,
        slot: u32,
    ) -> Option<ResolvedMethodRc> {
        self.method(class, slot).map(|m| m as ResolvedMethodRc)
    }

    fn resolve_interface_method(
        &self,
        _caller: &dyn ResolvedMethod,
        class: ClassId,
        cp_index: u32,
    ) -> Option<ResolvedMethodRc> {
        self.method(class, cp_index).map(|m| m as ResolvedMethodRc)
    }

    fn resolved_methods(&self, class: ClassId) -> Vec<ResolvedMethodRc> {
        self.classes
            .read()
            .unwrap()
            .get(&class)
            .map(|c| {
                c.methods
                    .values()
                    .map(|m| m.clone() as ResolvedMethodRc)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Patcher counting compensations per guard location
#[derive(Default)]
pub struct CountingPatcher {
    counts: Mutex<HashMap<CodeAddress, usize>>,
    total: AtomicUsize,
}

impl CountingPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_for(&self, location: CodeAddress) -> usize {
        self.counts
            .lock()
            .unwrap()
            .get(&location)
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl GuardPatcher for CountingPatcher {
    fn compensate(&self, location: CodeAddress, _destination: CodeAddress) {
        *self.counts.lock().unwrap().entry(location).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::SeqCst);
    }
}
