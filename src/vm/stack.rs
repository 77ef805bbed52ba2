//! The call stack: one contiguous slot vector holding every frame's
//! arguments, locals, and evaluation stack, with per-frame base pointers.
//!
//! Call-site arguments are already on the caller's evaluation stack in
//! order, so a call just rebases them as the callee's argument window:
//!
//! ```text
//! ─────────────┬──────────────┬──────────────┬──────────────┬───────────────┬──────
//!    caller's  │   caller's   │   caller's   │   callee's   │   callee's    │ callee's
//!    arguments │   locals     │   stack      │   arguments  │   locals      │ stack
//! ─────────────┴──────────────┴──────────────┴──────────────┴───────────────┴──────
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::error::{ExecutionError, ResolutionError, VmError};
use crate::metadata::{MethodSource, MethodType, UserMethod};
use crate::types::generics::{ConcreteType, GenericLookup};
use crate::types::{ImageS, MethodDescription, TypeDescription};
use crate::value::ops::{OpError, STACK_OVERFLOW};
use crate::value::ptr::SlotAccess;
use crate::value::{HeapStorage, ObjectRef, StackValue};
use crate::vm::exceptions::ExceptionState;
use crate::vm::state::SharedState;
use crate::vm::{MethodInfo, MethodState, StepResult};

pub struct BasePointer {
    pub arguments: usize,
    pub locals: usize,
    pub stack: usize,
}

pub struct StackFrame {
    pub stack_height: usize,
    pub base: BasePointer,
    pub state: MethodState,
    pub generics: GenericLookup,
    /// Exceptions whose catch/filter handlers are active in this frame, for
    /// `rethrow`.
    pub exception_stack: Vec<ObjectRef>,
    /// Return value stashed while finally blocks run on the way out.
    pub pending_return: Option<StackValue>,
}

impl StackFrame {
    pub fn new(base: BasePointer, method: MethodInfo, generics: GenericLookup) -> Self {
        Self {
            stack_height: 0,
            base,
            state: MethodState::new(method),
            generics,
            exception_stack: vec![],
            pending_return: None,
        }
    }
}

pub struct CallStack {
    pub shared: Arc<SharedState>,
    pub(crate) slots: Vec<StackValue>,
    pub frames: Vec<StackFrame>,

    pub exception_mode: ExceptionState,
    pub(crate) suspended_slots: Vec<StackValue>,
    pub(crate) suspended_frames: Vec<StackFrame>,
    pub(crate) original_ip: usize,
    pub(crate) original_stack_height: usize,
    pub unhandled_exception: Option<ObjectRef>,
    /// The outermost frame's return value, captured by the run loop.
    pub(crate) pending_result: Option<StackValue>,

    /// Frame-depth limit; exceeding it raises `System.StackOverflowException`.
    pub max_depth: usize,
    pub instruction_budget: Option<u64>,
    pub(crate) executed: u64,
}

impl CallStack {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self {
            shared,
            slots: vec![],
            frames: vec![],
            exception_mode: ExceptionState::None,
            suspended_slots: vec![],
            suspended_frames: vec![],
            original_ip: 0,
            original_stack_height: 0,
            unhandled_exception: None,
            pending_result: None,
            max_depth: 1024,
            instruction_budget: None,
            executed: 0,
        }
    }

    pub fn current_frame(&self) -> &StackFrame {
        self.frames.last().unwrap()
    }

    pub fn current_frame_mut(&mut self) -> &mut StackFrame {
        self.frames.last_mut().unwrap()
    }

    pub fn increment_ip(&mut self) {
        self.current_frame_mut().state.ip += 1;
    }

    pub fn generics(&self) -> &GenericLookup {
        &self.current_frame().generics
    }

    pub fn frame_image(&self) -> ImageS {
        self.current_frame().state.info_handle.source.image()
    }

    pub fn make_concrete(&self, t: &MethodType) -> Result<ConcreteType, ResolutionError> {
        self.shared
            .assemblies
            .make_concrete(self.frame_image(), self.generics(), t)
    }

    pub fn top_of_stack(&self) -> usize {
        let f = self.current_frame();
        f.base.stack + f.stack_height
    }

    fn place_slot(&mut self, index: usize, value: StackValue) {
        if index == self.slots.len() {
            self.slots.push(value);
        } else {
            self.slots[index] = value;
        }
    }

    pub fn push_stack(&mut self, value: StackValue) {
        let top = self.top_of_stack();
        self.place_slot(top, value);
        self.current_frame_mut().stack_height += 1;
    }

    pub fn pop_stack(&mut self) -> Result<StackValue, VmError> {
        let frame = self.frames.last().unwrap();
        if frame.stack_height == 0 {
            return Err(VmError::Execution(ExecutionError::StackUnderflow {
                method: format!("{:?}", frame.state.info_handle.source),
                ip: frame.state.ip,
            }));
        }
        let top = self.top_of_stack() - 1;
        let value = std::mem::take(&mut self.slots[top]);
        self.current_frame_mut().stack_height -= 1;
        Ok(value)
    }

    pub(crate) fn truncate_to_top(&mut self) {
        let top = self.top_of_stack();
        self.slots.truncate(top);
    }

    pub fn local_slot_index(&self, index: usize) -> usize {
        self.current_frame().base.locals + index
    }

    pub fn argument_slot_index(&self, index: usize) -> usize {
        self.current_frame().base.arguments + index
    }

    pub fn get_local(&self, index: usize) -> StackValue {
        self.slots[self.local_slot_index(index)].clone()
    }

    pub fn set_local(&mut self, index: usize, value: StackValue) {
        let slot = self.local_slot_index(index);
        self.slots[slot] = value;
    }

    pub fn get_argument(&self, index: usize) -> StackValue {
        self.slots[self.argument_slot_index(index)].clone()
    }

    pub fn set_argument(&mut self, index: usize, value: StackValue) {
        let slot = self.argument_slot_index(index);
        self.slots[slot] = value;
    }

    fn init_locals(&mut self, info: &MethodInfo) -> Result<(), VmError> {
        // locals are zeroed regardless of the body's init flag, for
        // determinism
        let mut base = self.slots.len();
        for ty in &info.local_types {
            let zero = self.shared.assemblies.zero_value(ty)?;
            self.place_slot(base, zero);
            base += 1;
        }
        Ok(())
    }

    /// Set up the first frame of an invocation; arguments come from the API
    /// caller rather than an evaluation stack.
    pub fn entrypoint_frame(
        &mut self,
        info: MethodInfo,
        generics: GenericLookup,
        args: Vec<StackValue>,
    ) -> Result<(), VmError> {
        let argument_base = self.slots.len();
        for a in args {
            self.slots.push(a);
        }
        let locals_base = self.slots.len();
        self.init_locals(&info)?;
        let stack_base = locals_base + info.local_types.len();

        debug!(method = ?info.source, "entering frame");
        self.frames.push(StackFrame::new(
            BasePointer {
                arguments: argument_base,
                locals: locals_base,
                stack: stack_base,
            },
            info,
            generics,
        ));
        Ok(())
    }

    /// Push a callee frame over arguments already sitting on the caller's
    /// evaluation stack.
    pub fn call_frame(&mut self, info: MethodInfo, generics: GenericLookup) -> Result<(), OpError> {
        if self.frames.len() >= self.max_depth {
            return Err(OpError::Throw(STACK_OVERFLOW));
        }

        let num_args = info.source.arg_count();
        let top = self.top_of_stack();
        let Some(argument_base) = top.checked_sub(num_args) else {
            return Err(OpError::Fatal(VmError::Execution(
                ExecutionError::StackUnderflow {
                    method: format!("{:?}", info.source),
                    ip: 0,
                },
            )));
        };
        if self.current_frame().stack_height < num_args {
            return Err(OpError::Fatal(VmError::Execution(
                ExecutionError::StackUnderflow {
                    method: format!("{:?}", info.source),
                    ip: self.current_frame().state.ip,
                },
            )));
        }

        // store conversion for declared parameters (`this` rides along raw)
        let this_offset = usize::from(info.signature.instance);
        for (i, ty) in info.param_types.iter().enumerate() {
            let slot = argument_base + this_offset + i;
            let value = std::mem::take(&mut self.slots[slot]);
            self.slots[slot] = self.shared.assemblies.coerce(value, ty)?;
        }

        let locals_base = top;
        self.slots.truncate(locals_base);
        self.init_locals(&info).map_err(OpError::Fatal)?;
        let stack_base = locals_base + info.local_types.len();

        self.current_frame_mut().stack_height -= num_args;
        debug!(method = ?info.source, depth = self.frames.len(), "entering frame");
        self.frames.push(StackFrame::new(
            BasePointer {
                arguments: argument_base,
                locals: locals_base,
                stack: stack_base,
            },
            info,
            generics,
        ));
        Ok(())
    }

    /// `newobj`: allocate, run the constructor, and leave the new instance
    /// as the call's result. A value-type constructor receives `this` as a
    /// managed pointer into the result slot, so its writes land in the value
    /// the caller observes.
    pub fn constructor_frame(
        &mut self,
        instance: StackValue,
        this_type: ConcreteType,
        info: MethodInfo,
        generics: GenericLookup,
    ) -> Result<(), OpError> {
        let num_params = info.signature.parameters.len();
        let mut args = vec![];
        for _ in 0..num_params {
            args.push(self.pop_stack().map_err(OpError::Fatal)?);
        }

        // the caller sees the instance as the newobj result
        let is_value = matches!(instance, StackValue::ValueType(_));
        self.push_stack(instance);
        let result_slot = self.top_of_stack() - 1;

        let this = if is_value {
            StackValue::ManagedPtr(crate::value::ManagedPtr::to_slot(result_slot, this_type))
        } else {
            self.slots[result_slot].clone()
        };

        self.push_stack(this);
        for a in args.into_iter().rev() {
            self.push_stack(a);
        }

        self.call_frame(info, generics)
    }

    /// Pop the returning frame. Pushes the converted return value to the
    /// caller; if this was the outermost frame, hands the value back.
    pub fn return_frame(&mut self) -> Result<Option<StackValue>, VmError> {
        let mut frame = self.frames.pop().unwrap();
        let info = &frame.state.info_handle;
        debug!(method = ?info.source, "leaving frame");

        let value = match (frame.pending_return.take(), &info.return_type) {
            (Some(v), _) => Some(v),
            (None, Some(ty)) => {
                if frame.stack_height == 0 {
                    return Err(VmError::Execution(ExecutionError::MissingReturnValue {
                        method: format!("{:?}", info.source),
                    }));
                }
                if frame.stack_height > 1 {
                    return Err(VmError::Execution(ExecutionError::UnbalancedStack {
                        method: format!("{:?}", info.source),
                        depth: frame.stack_height - 1,
                    }));
                }
                let raw = std::mem::take(&mut self.slots[frame.base.stack]);
                Some(self.shared.assemblies.coerce(raw, ty).map_err(|e| match e {
                    OpError::Fatal(e) => e,
                    OpError::Throw(name) => VmError::Execution(ExecutionError::TypeMismatch {
                        expected: "convertible return value",
                        found: name.to_string(),
                    }),
                })?)
            }
            (None, None) => {
                if frame.stack_height != 0 {
                    return Err(VmError::Execution(ExecutionError::UnbalancedStack {
                        method: format!("{:?}", info.source),
                        depth: frame.stack_height,
                    }));
                }
                None
            }
        };

        if frame.state.info_handle.is_cctor {
            self.shared
                .statics
                .mark_initialized(frame.state.info_handle.source.parent, &frame.generics);
        }

        self.slots.truncate(frame.base.arguments);
        if self.frames.is_empty() {
            Ok(Some(value.unwrap_or_else(StackValue::null)))
        } else {
            if let Some(v) = value {
                self.push_stack(v);
            }
            Ok(None)
        }
    }

    /// Drop the top frame during exception unwinding.
    pub(crate) fn pop_frame_for_unwind(&mut self) {
        if let Some(frame) = self.frames.pop() {
            if frame.state.info_handle.is_cctor {
                // a failed initializer still never runs again
                self.shared
                    .statics
                    .mark_initialized(frame.state.info_handle.source.parent, &frame.generics);
            }
            self.slots.truncate(frame.base.arguments);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.frames.clear();
        self.slots.clear();
        self.suspended_frames.clear();
        self.suspended_slots.clear();
    }

    /// Move every frame above `frame_index` (and every slot from
    /// `stack_base` up) aside while a filter block runs.
    pub(crate) fn suspend_above(&mut self, frame_index: usize, stack_base: usize) {
        self.suspended_frames = self.frames.split_off(frame_index + 1);
        self.suspended_slots = self.slots.split_off(stack_base);
    }

    /// Undo [`suspend_above`](Self::suspend_above) once the filter decided.
    pub(crate) fn restore_suspended(&mut self, handler_frame_index: usize) {
        let stack_base = self.frames[handler_frame_index].base.stack;
        self.slots.truncate(stack_base);
        self.slots.append(&mut self.suspended_slots);
        self.frames.append(&mut self.suspended_frames);
    }

    pub fn new_exception_object(&self, full_name: &str) -> Result<ObjectRef, VmError> {
        let world = &self.shared.assemblies;
        let td = world.corlib_type(full_name)?;
        let object = world.new_object(td, &GenericLookup::default())?;
        Ok(ObjectRef::new(HeapStorage::Obj(object)))
    }

    /// Raise a managed exception of the named core-library type.
    pub fn throw_by_name(&mut self, full_name: &'static str) -> StepResult {
        match self.new_exception_object(full_name) {
            Ok(exception) => self.throw(exception),
            Err(e) => StepResult::Error(e),
        }
    }

    pub fn throw(&mut self, exception: ObjectRef) -> StepResult {
        self.exception_mode = ExceptionState::Throwing(exception);
        self.handle_exception()
    }

    /// Resolve a call-site method operand: the target descriptor and the
    /// generic scope its body executes under.
    pub fn find_generic_method(
        &self,
        source: &MethodSource,
    ) -> Result<(MethodDescription, GenericLookup), ResolutionError> {
        let image = self.frame_image();
        let outer = self.generics();
        let world = &self.shared.assemblies;

        let mut new_lookup = outer.clone();
        let user = match source {
            MethodSource::User(u) => u.clone(),
            MethodSource::Generic { base, parameters } => {
                let method_generics = parameters
                    .iter()
                    .map(|t| world.make_concrete(image, outer, t))
                    .collect::<Result<Vec<_>, _>>()?;
                new_lookup = new_lookup.with_method_generics(method_generics);
                base.clone()
            }
        };

        if let UserMethod::Reference(r) = &user {
            let parent = world.make_concrete(image, outer, &r.parent)?;
            let type_generics = world.type_arguments(&parent);
            new_lookup = new_lookup.with_type_generics(type_generics);
        }

        let method = world.locate_method(image, &user, outer)?;
        Ok((method, new_lookup))
    }

    /// The runtime type of a `this` value for virtual dispatch.
    pub fn runtime_type_of_receiver(
        &self,
        receiver: &StackValue,
    ) -> Result<TypeDescription, OpError> {
        match receiver {
            StackValue::ObjectRef(o) if o.is_null() => {
                Err(OpError::Throw(crate::value::ops::NULL_REFERENCE))
            }
            StackValue::ObjectRef(o) => Ok(self.shared.assemblies.heap_description(o)?),
            // value types receive calls through a managed pointer (I.8.9.7)
            StackValue::ManagedPtr(p) => Ok(self.shared.assemblies.find_concrete_type(&p.target)?),
            v => Err(OpError::invalid("virtual call receiver", v)),
        }
    }
}

impl SlotAccess for CallStack {
    fn slot(&self, index: usize) -> Result<&StackValue, VmError> {
        self.slots
            .get(index)
            .ok_or(VmError::Execution(ExecutionError::InvalidSlot(index)))
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut StackValue, VmError> {
        self.slots
            .get_mut(index)
            .ok_or(VmError::Execution(ExecutionError::InvalidSlot(index)))
    }
}

/// Narrow `extends`-style references: does this type derive from
/// `System.Delegate` (excluding the two delegate roots themselves)?
pub fn is_delegate_type(
    world: &crate::resolve::Assemblies,
    ty: TypeDescription,
) -> Result<bool, ResolutionError> {
    if matches!(
        ty.type_name().as_str(),
        "System.Delegate" | "System.MulticastDelegate"
    ) {
        return Ok(false);
    }
    Ok(world
        .ancestor_chain(ty)?
        .iter()
        .any(|t| t.type_name() == "System.MulticastDelegate" || t.type_name() == "System.Delegate"))
}
