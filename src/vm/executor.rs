//! The interpreter loop and the public invocation surface.

use std::sync::Arc;

use tracing::debug;

use crate::error::CallError;
use crate::resolve::Assemblies;
use crate::types::generics::{ConcreteType, GenericLookup};
use crate::types::MethodDescription;
use crate::value::{HeapStorage, StackValue};
use crate::vm::stack::CallStack;
use crate::vm::state::SharedState;
use crate::vm::{MethodInfo, StepResult};

/// A single-threaded execution engine over a shared [`SharedState`]. Several
/// interpreters may share one state; the shared caches and static storage
/// are guarded for that.
pub struct Interpreter {
    stack: CallStack,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_shared(Arc::new(SharedState::new()))
    }

    pub fn with_shared(shared: Arc<SharedState>) -> Self {
        Self {
            stack: CallStack::new(shared),
        }
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.stack.shared
    }

    pub fn assemblies(&self) -> &Assemblies {
        &self.stack.shared.assemblies
    }

    /// Bound the number of instructions a single invocation may execute.
    pub fn set_instruction_budget(&mut self, budget: Option<u64>) {
        self.stack.instruction_budget = budget;
    }

    /// Bound the interpreted call depth (`System.StackOverflowException`
    /// beyond it).
    pub fn set_max_call_depth(&mut self, depth: usize) {
        self.stack.max_depth = depth;
    }

    /// Invoke a static, non-generic method.
    pub fn call(
        &mut self,
        method: MethodDescription,
        args: Vec<StackValue>,
    ) -> Result<StackValue, CallError> {
        self.call_generic(vec![], method, vec![], None, args)
    }

    /// Invoke an instance method with no generic arguments.
    pub fn call_instance(
        &mut self,
        method: MethodDescription,
        receiver: StackValue,
        args: Vec<StackValue>,
    ) -> Result<StackValue, CallError> {
        self.call_generic(vec![], method, vec![], Some(receiver), args)
    }

    /// The fully generic invocation form. Type arguments are interpreter
    /// type descriptors or anything convertible into one
    /// (`TypeDescription` converts via `Into`).
    pub fn call_generic(
        &mut self,
        type_args: Vec<ConcreteType>,
        method: MethodDescription,
        method_args: Vec<ConcreteType>,
        receiver: Option<StackValue>,
        args: Vec<StackValue>,
    ) -> Result<StackValue, CallError> {
        if method.method.body.is_none() {
            return Err(CallError::Invalid(format!(
                "{:?} has no body to interpret",
                method
            )));
        }
        if method.method.internal_call {
            return Err(CallError::Invalid(format!(
                "{:?} is an internal call",
                method
            )));
        }
        if method.method.signature.instance != receiver.is_some() {
            return Err(CallError::Invalid(format!(
                "receiver mismatch for {:?}",
                method
            )));
        }
        if method.method.signature.parameters.len() != args.len() {
            return Err(CallError::Invalid(format!(
                "{:?} takes {} arguments, received {}",
                method,
                method.method.signature.parameters.len(),
                args.len()
            )));
        }
        if method.parent.definition.generic_parameters.len() != type_args.len() {
            return Err(CallError::Invalid(format!(
                "{:?} declares {} type parameters, received {}",
                method.parent,
                method.parent.definition.generic_parameters.len(),
                type_args.len()
            )));
        }
        if method.method.generic_parameters.len() != method_args.len() {
            return Err(CallError::Invalid(format!(
                "{:?} declares {} method type parameters, received {}",
                method,
                method.method.generic_parameters.len(),
                method_args.len()
            )));
        }

        let world = &self.stack.shared.assemblies;
        let lookup = GenericLookup {
            type_generics: type_args
                .into_iter()
                .map(|t| world.intern(t))
                .collect::<Vec<_>>()
                .into(),
            method_generics: method_args
                .into_iter()
                .map(|t| world.intern(t))
                .collect::<Vec<_>>()
                .into(),
        };

        let info = MethodInfo::new(method, &lookup, &self.stack.shared)?;
        let mut all_args = vec![];
        if let Some(r) = receiver {
            all_args.push(r);
        }
        all_args.extend(args);

        self.stack.unhandled_exception = None;
        self.stack.entrypoint_frame(info, lookup.clone(), all_args)?;

        // a type's statics initialize before its first method runs
        if !method.method.runtime_special_name {
            self.stack
                .initialize_static_storage(method.parent, &lookup)?;
        }

        debug!(method = ?method, "interpreting");
        match self.stack.run_until_depth(0) {
            StepResult::InstructionStepped => {
                let result = self.stack.take_result().unwrap_or_else(StackValue::null);
                Ok(result)
            }
            StepResult::MethodThrew => {
                let exception = self
                    .stack
                    .unhandled_exception
                    .take()
                    .expect("thrown invocation must record its exception");
                let (type_name, message) = describe_exception(&self.stack, &exception);
                Err(CallError::Unhandled {
                    type_name,
                    message,
                    exception,
                })
            }
            StepResult::Error(e) => {
                self.stack.clear();
                Err(e.into())
            }
            StepResult::MethodReturned => unreachable!("run loop consumes returns"),
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_exception(
    stack: &CallStack,
    exception: &crate::value::ObjectRef,
) -> (String, String) {
    let type_name = stack
        .shared
        .assemblies
        .heap_description(exception)
        .map(|t| t.type_name())
        .unwrap_or_else(|_| "<unknown>".to_string());
    let mut message = String::new();
    exception.as_object(|obj| {
        if let Some(field) = obj.field_named("_message") {
            if let Some(StackValue::ObjectRef(o)) = obj.get_field(field) {
                if let Some(handle) = o.0 {
                    if let HeapStorage::Str(s) = &*handle.read() {
                        message = s.as_string();
                    }
                }
            }
        }
    });
    (type_name, message)
}

impl CallStack {
    /// Run until the frame stack drains back to `target_depth`. Returns
    /// `InstructionStepped` on a clean drain; exceptions and engine errors
    /// surface as their own results.
    pub(crate) fn run_until_depth(&mut self, target_depth: usize) -> StepResult {
        loop {
            if self.frames.len() <= target_depth {
                return StepResult::InstructionStepped;
            }
            match self.step() {
                StepResult::InstructionStepped => {}
                StepResult::MethodReturned => {
                    let was_cctor = self.current_frame().state.info_handle.is_cctor;
                    match self.return_frame() {
                        Ok(Some(final_value)) => {
                            // the outermost frame returned; stash for the API
                            self.pending_result = Some(final_value);
                        }
                        Ok(None) => {}
                        Err(e) => return StepResult::Error(e),
                    }
                    // step the caller past the call site, unless the callee
                    // was a static constructor (the triggering instruction
                    // re-executes) or we drained to the target depth
                    if self.frames.len() > target_depth && !was_cctor {
                        self.increment_ip();
                    }
                }
                StepResult::MethodThrew => return StepResult::MethodThrew,
                StepResult::Error(e) => return StepResult::Error(e),
            }
        }
    }

    pub(crate) fn take_result(&mut self) -> Option<StackValue> {
        self.pending_result.take()
    }
}
