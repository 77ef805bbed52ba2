//! Static field storage and the `.cctor` discipline.
//!
//! Static state is process-wide, keyed by `(type, generic arguments)`. A
//! type's static constructor runs exactly once; the state machine hands the
//! run to exactly one thread, treats same-thread re-entry as complete (per
//! ECMA-335 §I.8.9.5), and parks other threads until initialization ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::error::ResolutionError;
use crate::metadata::Constant;
use crate::resolve::Assemblies;
use crate::types::generics::GenericLookup;
use crate::types::{MethodDescription, TypeDescription};
use crate::value::{Object, StackValue};

pub const INIT_STATE_UNINITIALIZED: u8 = 0;
pub const INIT_STATE_INITIALIZING: u8 = 1;
pub const INIT_STATE_INITIALIZED: u8 = 2;

pub struct StaticStorage {
    /// 0 = uninitialized, 1 = initializing, 2 = initialized.
    init_state: AtomicU8,
    /// Valid only while `init_state` is INITIALIZING.
    initializing_thread: AtomicU64,
    pub storage: Arc<RwLock<Object>>,
    init_cond: Condvar,
    init_mutex: Mutex<()>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StaticInitResult {
    /// The calling thread must execute this static constructor.
    Execute(MethodDescription),
    Initialized,
    /// Re-entry on the initializing thread; proceed as if initialized.
    Recursive,
    /// Another thread is initializing; wait.
    Waiting,
}

pub struct StaticStorageManager {
    types: RwLock<HashMap<(TypeDescription, GenericLookup), Arc<StaticStorage>>>,
}

impl StaticStorageManager {
    pub fn new() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
        }
    }

    fn storage_key(ty: TypeDescription, generics: &GenericLookup) -> (TypeDescription, GenericLookup) {
        // method generics never affect static identity
        (ty, GenericLookup::new(generics.type_generics.to_vec()))
    }

    pub fn get(&self, ty: TypeDescription, generics: &GenericLookup) -> Option<Arc<StaticStorage>> {
        self.types
            .read()
            .get(&Self::storage_key(ty, generics))
            .cloned()
    }

    fn ensure(
        &self,
        ty: TypeDescription,
        generics: &GenericLookup,
        world: &Assemblies,
    ) -> Result<Arc<StaticStorage>, ResolutionError> {
        let key = Self::storage_key(ty, generics);
        if let Some(existing) = self.types.read().get(&key) {
            return Ok(Arc::clone(existing));
        }

        let layout = Arc::new(world.static_layout(ty, &key.1)?);
        let fields = layout
            .fields
            .iter()
            .map(|f| match &f.field.field.default {
                Some(c) => Ok(constant_value(c)),
                None => world.zero_value(&f.field_type),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let storage = Arc::new(StaticStorage {
            init_state: AtomicU8::new(INIT_STATE_UNINITIALIZED),
            initializing_thread: AtomicU64::new(0),
            storage: Arc::new(RwLock::new(Object::with_layout(ty, layout, fields))),
            init_cond: Condvar::new(),
            init_mutex: Mutex::new(()),
        });

        let mut types = self.types.write();
        Ok(Arc::clone(types.entry(key).or_insert(storage)))
    }

    /// Ensure storage exists and decide what the calling thread must do
    /// about the type's static constructor.
    #[must_use]
    pub fn init(
        &self,
        ty: TypeDescription,
        generics: &GenericLookup,
        world: &Assemblies,
        thread_id: u64,
    ) -> Result<StaticInitResult, ResolutionError> {
        let storage = self.ensure(ty, generics, world)?;
        let state = storage.init_state.load(Ordering::Acquire);

        if state == INIT_STATE_INITIALIZED {
            return Ok(StaticInitResult::Initialized);
        }
        if state == INIT_STATE_INITIALIZING
            && storage.initializing_thread.load(Ordering::Acquire) == thread_id
        {
            return Ok(StaticInitResult::Recursive);
        }

        let Some(cctor) = ty.static_initializer() else {
            storage
                .init_state
                .compare_exchange(
                    INIT_STATE_UNINITIALIZED,
                    INIT_STATE_INITIALIZED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .ok();
            return Ok(StaticInitResult::Initialized);
        };

        match storage.init_state.compare_exchange(
            INIT_STATE_UNINITIALIZED,
            INIT_STATE_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                storage
                    .initializing_thread
                    .store(thread_id, Ordering::Release);
                Ok(StaticInitResult::Execute(cctor))
            }
            Err(INIT_STATE_INITIALIZED) => Ok(StaticInitResult::Initialized),
            Err(_) => Ok(StaticInitResult::Waiting),
        }
    }

    /// Called after the `.cctor` handed out by [`init`](Self::init) has
    /// finished (or failed; either way the type never initializes again).
    pub fn mark_initialized(&self, ty: TypeDescription, generics: &GenericLookup) {
        if let Some(storage) = self.get(ty, generics) {
            storage
                .init_state
                .store(INIT_STATE_INITIALIZED, Ordering::Release);
            let _lock = storage.init_mutex.lock();
            storage.init_cond.notify_all();
        }
    }

    pub fn wait_for_init(&self, ty: TypeDescription, generics: &GenericLookup) {
        let Some(storage) = self.get(ty, generics) else {
            return;
        };
        loop {
            if storage.init_state.load(Ordering::Acquire) != INIT_STATE_INITIALIZING {
                return;
            }
            let mut lock = storage.init_mutex.lock();
            if storage.init_state.load(Ordering::Acquire) != INIT_STATE_INITIALIZING {
                return;
            }
            storage.init_cond.wait(&mut lock);
        }
    }
}

impl Default for StaticStorageManager {
    fn default() -> Self {
        Self::new()
    }
}

fn constant_value(c: &Constant) -> StackValue {
    match c {
        Constant::Boolean(b) => StackValue::Int32(*b as i32),
        Constant::Char(c) => StackValue::Int32(*c as i32),
        Constant::Int32(i) => StackValue::Int32(*i),
        Constant::Int64(i) => StackValue::Int64(*i),
        Constant::Float32(f) => StackValue::NativeFloat(*f as f64),
        Constant::Float64(f) => StackValue::NativeFloat(*f),
        Constant::String(s) => StackValue::string(s.as_str()),
        Constant::Null => StackValue::null(),
    }
}

impl crate::vm::stack::CallStack {
    /// Run the type's `.cctor` if this use is the first. Returns `true` when
    /// a constructor frame was pushed; the triggering instruction re-executes
    /// after it returns.
    pub fn initialize_static_storage(
        &mut self,
        ty: TypeDescription,
        generics: &GenericLookup,
    ) -> Result<bool, crate::error::VmError> {
        loop {
            let thread_id = crate::vm::state::current_thread_id();
            let decision =
                self.shared
                    .statics
                    .init(ty, generics, &self.shared.assemblies, thread_id)?;

            match decision {
                StaticInitResult::Execute(cctor) => {
                    debug!(ty = %ty.type_name(), "running static constructor");
                    let info = crate::vm::MethodInfo::new(cctor, generics, &self.shared)?;
                    self.call_frame(info, generics.clone())
                        .map_err(|e| match e {
                            crate::value::OpError::Fatal(e) => e,
                            crate::value::OpError::Throw(name) => crate::error::VmError::Execution(
                                crate::error::ExecutionError::NotImplemented(format!(
                                    "{} while entering a static constructor",
                                    name
                                )),
                            ),
                        })?;
                    return Ok(true);
                }
                StaticInitResult::Initialized | StaticInitResult::Recursive => return Ok(false),
                StaticInitResult::Waiting => {
                    self.shared.statics.wait_for_init(ty, generics);
                }
            }
        }
    }
}
