//! Process-wide state shared between interpreter instances.

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::resolve::Assemblies;
use crate::types::generics::{ConcreteType, GenericLookup};
use crate::types::MethodDescription;
use crate::value::ObjectRef;
use crate::vm::statics::StaticStorageManager;

/// Shared between every [`crate::Interpreter`] created from it: the resolver
/// with its caches, static storage, and the handle tables behind `ldftn` and
/// `ldtoken`. Each interpreter runs single-threaded; this state is guarded
/// for parallel instances.
pub struct SharedState {
    pub assemblies: Assemblies,
    pub statics: StaticStorageManager,
    /// Runtime method handles: `ldftn` pushes an index into this table and
    /// `calli`/delegate construction reads it back.
    method_table: RwLock<Vec<(MethodDescription, GenericLookup)>>,
    /// Runtime type handles for `ldtoken`/`GetType`.
    type_table: RwLock<Vec<ConcreteType>>,
    /// Interned `System.RuntimeType` objects, one per type handle.
    pub(crate) type_objects: DashMap<usize, ObjectRef>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            assemblies: Assemblies::new(),
            statics: StaticStorageManager::new(),
            method_table: RwLock::new(vec![]),
            type_table: RwLock::new(vec![]),
            type_objects: DashMap::new(),
        }
    }

    pub fn method_handle(&self, method: MethodDescription, generics: GenericLookup) -> usize {
        let mut table = self.method_table.write();
        if let Some(i) = table
            .iter()
            .position(|(m, g)| *m == method && *g == generics)
        {
            return i;
        }
        table.push((method, generics));
        table.len() - 1
    }

    pub fn method_from_handle(&self, index: usize) -> Option<(MethodDescription, GenericLookup)> {
        self.method_table.read().get(index).cloned()
    }

    pub fn type_handle(&self, ty: ConcreteType) -> usize {
        let mut table = self.type_table.write();
        if let Some(i) = table.iter().position(|t| *t == ty) {
            return i;
        }
        table.push(ty);
        table.len() - 1
    }

    pub fn type_from_handle(&self, index: usize) -> Option<ConcreteType> {
        self.type_table.read().get(index).cloned()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable numeric id for the current OS thread, used by the static
/// constructor state machine to detect same-thread recursion.
pub fn current_thread_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}
