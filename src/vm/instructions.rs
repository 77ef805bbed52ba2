//! Instruction dispatch: one `match` arm per opcode family member, acting on
//! the current frame's evaluation stack, locals, and control-flow cursor.

use std::cmp::Ordering as CmpOrdering;

use tracing::trace;

use crate::error::{ExecutionError, VmError};
use crate::metadata::{
    BaseType, FieldSource, Instruction, MethodSource, StoreType,
    TokenSource,
};
use crate::resolve::Assemblies;
use crate::types::generics::{ConcreteType, GenericLookup};
use crate::types::{FieldDescription, MethodDescription};
use crate::value::ops::{
    OpError, INDEX_OUT_OF_RANGE, INVALID_CAST, NULL_REFERENCE, OVERFLOW,
};
use crate::value::ptr::Projection;
use crate::value::{
    BoxedValue, DelegateTarget, DelegateValue, HeapStorage, ManagedPtr, ObjectRef, StackValue,
    Vector,
};
use crate::vm::exceptions::{ExceptionState, HandlerAddress, UnwindTarget, RETURN_SENTINEL};
use crate::vm::intrinsics;
use crate::vm::stack::{is_delegate_type, CallStack};
use crate::vm::{MethodInfo, StepResult};
use crate::{op_try, res_try, vm_expect_stack, vm_pop, vm_push};

impl CallStack {
    /// Final call dispatch: intrinsics first, then managed bodies. Assumes
    /// virtual resolution has already happened.
    pub(crate) fn dispatch_method(
        &mut self,
        method: MethodDescription,
        lookup: GenericLookup,
    ) -> StepResult {
        if res_try!(intrinsics::is_intrinsic(&self.shared.assemblies, method)) {
            return intrinsics::intrinsic_call(self, method, &lookup);
        }
        if method.method.internal_call || method.method.body.is_none() {
            return StepResult::Error(VmError::Execution(ExecutionError::NotImplemented(
                format!("no implementation for {:?}", method),
            )));
        }

        // a type's statics are initialized before its first static call
        if !method.method.signature.instance && !method.method.runtime_special_name {
            match self.initialize_static_storage(method.parent, &lookup) {
                Ok(true) => return StepResult::InstructionStepped,
                Ok(false) => {}
                Err(e) => return StepResult::Error(e),
            }
        }

        let info = res_try!(MethodInfo::new(method, &lookup, &self.shared));
        op_try!(self, self.call_frame(info, lookup));
        StepResult::InstructionStepped
    }

    fn locate_field_source(
        &self,
        source: &FieldSource,
    ) -> Result<(FieldDescription, GenericLookup), crate::error::ResolutionError> {
        self.shared
            .assemblies
            .locate_field(self.frame_image(), source, self.generics())
    }

    fn field_concrete(
        &self,
        field: FieldDescription,
        lookup: &GenericLookup,
    ) -> Result<ConcreteType, crate::error::ResolutionError> {
        self.shared
            .assemblies
            .make_concrete(field.parent.image, lookup, &field.field.field_type)
    }

    fn local_type(&self, index: usize) -> Result<ConcreteType, VmError> {
        self.current_frame()
            .state
            .info_handle
            .local_types
            .get(index)
            .cloned()
            .ok_or(VmError::Execution(ExecutionError::InvalidSlot(index)))
    }

    /// Declared type of an argument slot; `None` for a raw `this`.
    fn argument_type(&self, index: usize) -> Option<ConcreteType> {
        let info = &self.current_frame().state.info_handle;
        if info.signature.instance {
            if index == 0 {
                None
            } else {
                info.param_types.get(index - 1).cloned()
            }
        } else {
            info.param_types.get(index).cloned()
        }
    }

    fn read_field(
        &mut self,
        parent: StackValue,
        field: FieldDescription,
        field_ty: &ConcreteType,
    ) -> Result<StackValue, OpError> {
        let missing = || {
            OpError::Fatal(VmError::Execution(ExecutionError::TypeMismatch {
                expected: "object with field",
                found: format!("{:?}", field),
            }))
        };
        match parent {
            StackValue::ObjectRef(o) => {
                let Some(handle) = o.0 else {
                    return Err(OpError::Throw(NULL_REFERENCE));
                };
                let guard = handle.read();
                match &*guard {
                    HeapStorage::Obj(obj) => obj.get_field(field).ok_or_else(missing),
                    HeapStorage::Boxed(b) => match &b.value {
                        StackValue::ValueType(obj) => obj.get_field(field).ok_or_else(missing),
                        v => Err(OpError::invalid("boxed aggregate", v)),
                    },
                    other => Err(OpError::Fatal(VmError::Execution(
                        ExecutionError::TypeMismatch {
                            expected: "object with fields",
                            found: format!("{:?}", other),
                        },
                    ))),
                }
            }
            StackValue::ValueType(obj) => obj.get_field(field).ok_or_else(missing),
            StackValue::ManagedPtr(p) => p
                .project(Projection::Field(field), field_ty.clone())
                .read(self),
            v => Err(OpError::invalid("field access target", &v)),
        }
    }

    fn write_field(
        &mut self,
        parent: StackValue,
        field: FieldDescription,
        value: StackValue,
    ) -> Result<(), OpError> {
        match parent {
            StackValue::ObjectRef(o) => {
                let Some(handle) = o.0 else {
                    return Err(OpError::Throw(NULL_REFERENCE));
                };
                let mut guard = handle.write();
                let stored = match &mut *guard {
                    HeapStorage::Obj(obj) => obj.set_field(field, value),
                    HeapStorage::Boxed(b) => match &mut b.value {
                        StackValue::ValueType(obj) => obj.set_field(field, value),
                        _ => false,
                    },
                    _ => false,
                };
                if stored {
                    Ok(())
                } else {
                    Err(OpError::Fatal(VmError::Execution(
                        ExecutionError::TypeMismatch {
                            expected: "object with field",
                            found: format!("{:?}", field),
                        },
                    )))
                }
            }
            StackValue::ManagedPtr(p) => {
                let target = p.project(Projection::Field(field), p.target.clone());
                target.write(self, value)
            }
            v => Err(OpError::invalid("field store target", &v)),
        }
    }

    pub fn step(&mut self) -> StepResult {
        if let Some(budget) = self.instruction_budget {
            if self.executed >= budget {
                return StepResult::Error(VmError::Execution(ExecutionError::BudgetExceeded));
            }
        }
        self.executed += 1;

        if self.exception_mode.in_flight() {
            return self.handle_exception();
        }

        let initial_frame_count = self.frames.len();
        let mut moved_ip = false;

        macro_rules! pop {
            () => {
                vm_pop!(self)
            };
        }
        macro_rules! push {
            ($($args:tt)*) => {
                vm_push!(self, $($args)*)
            };
        }
        macro_rules! branch {
            ($target:expr) => {{
                let target = $target;
                self.current_frame_mut().state.ip = target;
                moved_ip = true;
            }};
        }
        macro_rules! conditional_branch {
            ($condition:expr, $target:expr) => {{
                let cond = $condition;
                if cond {
                    branch!($target);
                }
            }};
        }
        macro_rules! equal {
            () => {{
                let value2 = pop!();
                let value1 = pop!();
                value1 == value2
            }};
        }
        macro_rules! compare {
            ($sgn:expr, ( $order:pat )) => {{
                let value2 = pop!();
                let value1 = pop!();
                matches!(value1.compare(&value2, $sgn), Some($order))
            }};
        }
        macro_rules! binary {
            ($op:ident) => {{
                let v2 = pop!();
                let v1 = pop!();
                push!(op_try!(self, v1.$op(v2)));
            }};
            ($op:ident, $sgn:expr) => {{
                let v2 = pop!();
                let v1 = pop!();
                push!(op_try!(self, v1.$op(v2, $sgn)));
            }};
        }
        macro_rules! dispatch {
            ($method:expr, $lookup:expr) => {{
                match self.dispatch_method($method, $lookup) {
                    StepResult::InstructionStepped => {
                        if self.frames.len() != initial_frame_count {
                            moved_ip = true;
                        }
                    }
                    other => return other,
                }
            }};
        }

        let ip = self.current_frame().state.ip;
        let instructions = self.current_frame().state.info_handle.instructions;
        if ip >= instructions.len() {
            return StepResult::Error(VmError::Execution(ExecutionError::FellOffBody {
                method: format!("{:?}", self.current_frame().state.info_handle.source),
            }));
        }
        let i: &'static Instruction = &instructions[ip];
        trace!(target: "cilvm::exec", "{:?}@{}: {:?}", self.current_frame().state.info_handle.source, ip, i);

        use Instruction::*;
        match i {
            // constants and raw stack manipulation
            LoadConstantInt32(v) => push!(Int32(*v)),
            LoadConstantInt64(v) => push!(Int64(*v)),
            LoadConstantFloat32(v) => push!(NativeFloat(*v as f64)),
            LoadConstantFloat64(v) => push!(NativeFloat(*v)),
            LoadString(s) => push!(StackValue::string(s.as_str())),
            LoadNull => push!(StackValue::null()),
            Duplicate => {
                let val = pop!();
                push!(val.clone());
                push!(val);
            }
            Pop => {
                pop!();
            }
            NoOperation => {}

            // locals and arguments
            LoadLocal(index) => {
                let local = self.get_local(*index as usize);
                push!(local);
            }
            LoadLocalAddress(index) => {
                let ty = res_try!(self.local_type(*index as usize));
                let slot = self.local_slot_index(*index as usize);
                push!(StackValue::ManagedPtr(ManagedPtr::to_slot(slot, ty)));
            }
            StoreLocal(index) => {
                let ty = res_try!(self.local_type(*index as usize));
                let value = pop!();
                let value = op_try!(self, self.shared.assemblies.coerce(value, &ty));
                self.set_local(*index as usize, value);
            }
            LoadArgument(index) => {
                let arg = self.get_argument(*index as usize);
                push!(arg);
            }
            LoadArgumentAddress(index) => {
                let ty = match self.argument_type(*index as usize) {
                    Some(ty) => ty,
                    None => {
                        let parent = self.current_frame().state.info_handle.source.parent;
                        self.shared.assemblies.intern(ConcreteType::from(parent))
                    }
                };
                let slot = self.argument_slot_index(*index as usize);
                push!(StackValue::ManagedPtr(ManagedPtr::to_slot(slot, ty)));
            }
            StoreArgument(index) => {
                let value = pop!();
                let value = match self.argument_type(*index as usize) {
                    Some(ty) => op_try!(self, self.shared.assemblies.coerce(value, &ty)),
                    None => value,
                };
                self.set_argument(*index as usize, value);
            }

            // arithmetic
            Add => binary!(add_any),
            AddOverflow(sgn) => binary!(checked_add, *sgn),
            Subtract => binary!(sub_any),
            SubtractOverflow(sgn) => binary!(checked_sub, *sgn),
            Multiply => binary!(mul_any),
            MultiplyOverflow(sgn) => binary!(checked_mul, *sgn),
            Divide(sgn) => binary!(div, *sgn),
            Remainder(sgn) => binary!(rem, *sgn),
            Negate => {
                let v = pop!();
                push!(op_try!(self, v.neg()));
            }
            And => binary!(and),
            Or => binary!(or),
            Xor => binary!(xor),
            Not => {
                let v = pop!();
                push!(op_try!(self, v.not()));
            }
            ShiftLeft => binary!(shl),
            ShiftRight(sgn) => binary!(shr, *sgn),
            CheckFinite => {
                vm_expect_stack!(let NativeFloat(f) = pop!());
                if f.is_infinite() || f.is_nan() {
                    return self.throw_by_name(crate::value::ops::ARITHMETIC);
                }
                push!(NativeFloat(f));
            }

            // comparisons
            CompareEqual => {
                let val = equal!() as i32;
                push!(Int32(val));
            }
            CompareGreater(sgn) => {
                let val = compare!(*sgn, (CmpOrdering::Greater)) as i32;
                push!(Int32(val));
            }
            CompareLess(sgn) => {
                let val = compare!(*sgn, (CmpOrdering::Less)) as i32;
                push!(Int32(val));
            }

            // branches
            Branch(target) => branch!(*target),
            BranchTruthy(target) => {
                let v = pop!();
                conditional_branch!(!op_try!(self, v.is_nullish()), *target);
            }
            BranchFalsy(target) => {
                let v = pop!();
                conditional_branch!(op_try!(self, v.is_nullish()), *target);
            }
            BranchEqual(target) => {
                conditional_branch!(equal!(), *target);
            }
            BranchNotEqual(target) => {
                conditional_branch!(!equal!(), *target);
            }
            BranchGreater(sgn, target) => {
                conditional_branch!(compare!(*sgn, (CmpOrdering::Greater)), *target);
            }
            BranchGreaterOrEqual(sgn, target) => {
                conditional_branch!(
                    compare!(*sgn, (CmpOrdering::Greater | CmpOrdering::Equal)),
                    *target
                );
            }
            BranchLess(sgn, target) => {
                conditional_branch!(compare!(*sgn, (CmpOrdering::Less)), *target);
            }
            BranchLessOrEqual(sgn, target) => {
                conditional_branch!(
                    compare!(*sgn, (CmpOrdering::Less | CmpOrdering::Equal)),
                    *target
                );
            }
            Switch(targets) => {
                let index = match pop!() {
                    StackValue::Int32(v) => v as i64,
                    StackValue::NativeInt(v) => v as i64,
                    v => {
                        return StepResult::Error(VmError::Execution(
                            ExecutionError::TypeMismatch {
                                expected: "switch selector",
                                found: format!("{:?}", v),
                            },
                        ))
                    }
                };
                if index >= 0 && (index as usize) < targets.len() {
                    branch!(targets[index as usize]);
                }
            }

            // conversions
            Convert(t) => {
                let v = pop!();
                push!(op_try!(self, v.convert(*t)));
            }
            ConvertOverflow(t, sgn) => {
                let v = pop!();
                push!(op_try!(self, v.convert_overflow(*t, *sgn)));
            }
            ConvertFloat32 => {
                let v = pop!();
                push!(op_try!(self, v.to_float32()));
            }
            ConvertFloat64 => {
                let v = pop!();
                push!(op_try!(self, v.to_float64()));
            }
            ConvertUnsignedToFloat => {
                let v = pop!();
                push!(op_try!(self, v.unsigned_to_float()));
            }

            // calls
            Call { method: source, .. } => {
                let (method, lookup) = res_try!(self.find_generic_method(source));
                dispatch!(method, lookup);
            }
            CallVirtual { method: source } => {
                let (base_method, lookup) = res_try!(self.find_generic_method(source));

                let num_args = base_method.arg_count();
                let mut args = Vec::with_capacity(num_args);
                for _ in 0..num_args {
                    args.push(pop!());
                }
                args.reverse();

                let this_type = op_try!(self, self.runtime_type_of_receiver(&args[0]));
                let method = res_try!(self
                    .shared
                    .assemblies
                    .resolve_virtual_method(base_method, this_type));

                for a in args {
                    push!(a);
                }
                dispatch!(method, lookup);
            }
            CallConstrained(constraint, source) => {
                let constraint_type = res_try!(self.make_concrete(constraint));
                let (base_method, lookup) = res_try!(self.find_generic_method(source));
                let world = &self.shared.assemblies;
                let constraint_td = res_try!(world.find_concrete_type(&constraint_type));
                let is_value = res_try!(world.concrete_is_value_type(&constraint_type));
                let resolved = res_try!(world.resolve_virtual_method(base_method, constraint_td));

                let num_args = base_method.arg_count();
                let mut args = Vec::with_capacity(num_args);
                for _ in 0..num_args {
                    args.push(pop!());
                }
                args.reverse();

                if is_value {
                    if resolved.parent != constraint_td {
                        // no override on the value type itself: box the
                        // receiver and dispatch on the boxed form
                        let StackValue::ManagedPtr(p) = args[0].clone() else {
                            return StepResult::Error(VmError::Execution(
                                ExecutionError::TypeMismatch {
                                    expected: "managed pointer receiver",
                                    found: format!("{:?}", args[0]),
                                },
                            ));
                        };
                        let value = op_try!(self, p.read(self));
                        args[0] = StackValue::ObjectRef(ObjectRef::new(HeapStorage::Boxed(
                            BoxedValue {
                                ty: constraint_type.clone(),
                                description: constraint_td,
                                value,
                            },
                        )));
                    }
                    for a in args {
                        push!(a);
                    }
                    dispatch!(resolved, lookup);
                } else {
                    // reference-type constraint: dereference and make an
                    // ordinary virtual call
                    if let StackValue::ManagedPtr(p) = args[0].clone() {
                        args[0] = op_try!(self, p.read(self));
                    }
                    let this_type = op_try!(self, self.runtime_type_of_receiver(&args[0]));
                    let method = res_try!(self
                        .shared
                        .assemblies
                        .resolve_virtual_method(base_method, this_type));
                    for a in args {
                        push!(a);
                    }
                    dispatch!(method, lookup);
                }
            }
            CallIndirect { .. } => {
                vm_expect_stack!(let NativeInt(index) = pop!());
                let Some((method, lookup)) = self.shared.method_from_handle(index as usize) else {
                    return StepResult::Error(VmError::Execution(ExecutionError::NotImplemented(
                        format!("unknown method handle {}", index),
                    )));
                };
                dispatch!(method, lookup);
            }
            Return => {
                let frame_index = self.frames.len() - 1;

                // returning from inside a finally handler resumes the walk
                if let ExceptionState::ExecutingHandler {
                    exception, cursor, ..
                } = self.exception_mode.clone()
                {
                    if cursor.frame_index == frame_index {
                        self.exception_mode = ExceptionState::Unwinding {
                            exception,
                            target: UnwindTarget::Instruction(RETURN_SENTINEL),
                            cursor,
                        };
                        return self.handle_exception();
                    }
                }

                let has_sections = !self
                    .current_frame()
                    .state
                    .info_handle
                    .exceptions
                    .is_empty();
                if has_sections {
                    // stash the converted return value; the unwind walk
                    // resets evaluation stacks while finally blocks run
                    let info = self.current_frame().state.info_handle.clone();
                    if let Some(ty) = &info.return_type {
                        if self.current_frame().stack_height == 0 {
                            return StepResult::Error(VmError::Execution(
                                ExecutionError::MissingReturnValue {
                                    method: format!("{:?}", info.source),
                                },
                            ));
                        }
                        let raw = pop!();
                        let converted = op_try!(self, self.shared.assemblies.coerce(raw, ty));
                        self.current_frame_mut().pending_return = Some(converted);
                    }
                    if self.current_frame().stack_height != 0 {
                        return StepResult::Error(VmError::Execution(
                            ExecutionError::UnbalancedStack {
                                method: format!("{:?}", info.source),
                                depth: self.current_frame().stack_height,
                            },
                        ));
                    }
                    self.exception_mode = ExceptionState::Unwinding {
                        exception: None,
                        target: UnwindTarget::Instruction(RETURN_SENTINEL),
                        cursor: HandlerAddress {
                            frame_index,
                            section_index: 0,
                            handler_index: 0,
                        },
                    };
                    return self.handle_exception();
                }

                return StepResult::MethodReturned;
            }

            // object model
            NewObject(ctor) => {
                let (ctor_method, lookup) =
                    res_try!(self.find_generic_method(&MethodSource::User(ctor.clone())));
                let parent = ctor_method.parent;

                if res_try!(is_delegate_type(&self.shared.assemblies, parent)) {
                    vm_expect_stack!(let NativeInt(ftn) = pop!());
                    let target = pop!();
                    let StackValue::ObjectRef(receiver) = target else {
                        return StepResult::Error(VmError::Execution(
                            ExecutionError::TypeMismatch {
                                expected: "delegate target",
                                found: format!("{:?}", target),
                            },
                        ));
                    };
                    let Some((method, generics)) = self.shared.method_from_handle(ftn as usize)
                    else {
                        return StepResult::Error(VmError::Execution(
                            ExecutionError::NotImplemented(format!(
                                "unknown method handle {}",
                                ftn
                            )),
                        ));
                    };
                    push!(StackValue::ObjectRef(ObjectRef::new(
                        HeapStorage::Delegate(DelegateValue {
                            description: parent,
                            targets: vec![DelegateTarget {
                                receiver,
                                method,
                                generics,
                            }],
                        })
                    )));
                } else {
                    let binding = GenericLookup::new(lookup.type_generics.to_vec());
                    match self.initialize_static_storage(parent, &binding) {
                        Ok(true) => {
                            moved_ip = true;
                        }
                        Ok(false) => {
                            let world = &self.shared.assemblies;
                            let is_value = res_try!(world.is_value_type(parent));
                            let object = res_try!(world.new_object(parent, &binding));
                            let instance = if is_value {
                                StackValue::ValueType(Box::new(object))
                            } else {
                                StackValue::ObjectRef(ObjectRef::new(HeapStorage::Obj(object)))
                            };
                            let this_type =
                                world.intern(ConcreteType::from(parent));
                            let info =
                                res_try!(MethodInfo::new(ctor_method, &lookup, &self.shared));
                            op_try!(
                                self,
                                self.constructor_frame(instance, this_type, info, lookup)
                            );
                            moved_ip = true;
                        }
                        Err(e) => return StepResult::Error(e),
                    }
                }
            }
            NewArray(element) => {
                let element = res_try!(self.make_concrete(element));
                let length = match pop!() {
                    StackValue::Int32(v) => v as i64,
                    StackValue::NativeInt(v) => v as i64,
                    v => {
                        return StepResult::Error(VmError::Execution(
                            ExecutionError::TypeMismatch {
                                expected: "array length",
                                found: format!("{:?}", v),
                            },
                        ))
                    }
                };
                if length < 0 {
                    return self.throw_by_name(OVERFLOW);
                }
                let zero = res_try!(self.shared.assemblies.zero_value(&element));
                let elements = vec![zero; length as usize];
                push!(StackValue::ObjectRef(ObjectRef::new(HeapStorage::Vec(
                    Vector::new(element, elements)
                ))));
            }
            LoadLength => {
                let array = pop!();
                let len = op_try!(self, with_vector(&array, |v| v.elements.len()));
                push!(NativeInt(len as isize));
            }
            LoadElement(_) | LoadElementPrimitive(_) => {
                let index = op_try!(self, element_index(pop!()));
                let array = pop!();
                let value = op_try!(
                    self,
                    with_vector(&array, |v| v.elements.get(index).cloned())
                );
                match value {
                    Some(v) => push!(v),
                    None => return self.throw_by_name(INDEX_OUT_OF_RANGE),
                }
            }
            StoreElement(_) | StoreElementPrimitive(_) => {
                let value = pop!();
                let index = op_try!(self, element_index(pop!()));
                let array = pop!();
                let (len, element_ty) = op_try!(
                    self,
                    with_vector(&array, |v| (v.elements.len(), v.element.clone()))
                );
                if index >= len {
                    return self.throw_by_name(INDEX_OUT_OF_RANGE);
                }
                // coerce outside the lock, then write
                let value = op_try!(self, self.shared.assemblies.coerce(value, &element_ty));
                op_try!(
                    self,
                    with_vector_mut(&array, |v| {
                        v.elements[index] = value;
                        Ok(())
                    })
                );
            }
            LoadElementAddress(_) => {
                let index = op_try!(self, element_index(pop!()));
                let array = pop!();
                let StackValue::ObjectRef(o) = array else {
                    return StepResult::Error(VmError::Execution(ExecutionError::TypeMismatch {
                        expected: "array",
                        found: format!("{:?}", array),
                    }));
                };
                let Some(handle) = o.0 else {
                    return self.throw_by_name(NULL_REFERENCE);
                };
                let (in_bounds, element_ty) = {
                    let guard = handle.read();
                    match &*guard {
                        HeapStorage::Vec(v) => (index < v.elements.len(), v.element.clone()),
                        other => {
                            return StepResult::Error(VmError::Execution(
                                ExecutionError::TypeMismatch {
                                    expected: "array",
                                    found: format!("{:?}", other),
                                },
                            ))
                        }
                    }
                };
                if !in_bounds {
                    return self.throw_by_name(INDEX_OUT_OF_RANGE);
                }
                let base = ManagedPtr::to_heap(handle, element_ty.clone());
                push!(StackValue::ManagedPtr(
                    base.project(Projection::Element(index), element_ty)
                ));
            }
            LoadField(source) => {
                let (field, field_lookup) = res_try!(self.locate_field_source(source));
                let field_ty = res_try!(self.field_concrete(field, &field_lookup));
                let parent = pop!();
                let value = op_try!(self, self.read_field(parent, field, &field_ty));
                push!(value);
            }
            StoreField(source) => {
                let (field, field_lookup) = res_try!(self.locate_field_source(source));
                let field_ty = res_try!(self.field_concrete(field, &field_lookup));
                let value = pop!();
                let parent = pop!();
                let value = op_try!(self, self.shared.assemblies.coerce(value, &field_ty));
                op_try!(self, self.write_field(parent, field, value));
            }
            LoadFieldAddress(source) => {
                let (field, field_lookup) = res_try!(self.locate_field_source(source));
                let field_ty = res_try!(self.field_concrete(field, &field_lookup));
                let parent = pop!();
                let ptr = match parent {
                    StackValue::ObjectRef(o) => {
                        let Some(handle) = o.0 else {
                            return self.throw_by_name(NULL_REFERENCE);
                        };
                        ManagedPtr::to_heap(handle, field_ty.clone())
                            .project(Projection::Field(field), field_ty)
                    }
                    StackValue::ManagedPtr(p) => {
                        p.project(Projection::Field(field), field_ty)
                    }
                    v => {
                        return StepResult::Error(VmError::Execution(
                            ExecutionError::TypeMismatch {
                                expected: "addressable field parent",
                                found: format!("{:?}", v),
                            },
                        ))
                    }
                };
                push!(StackValue::ManagedPtr(ptr));
            }
            LoadStaticField(source) => {
                let (field, field_lookup) = res_try!(self.locate_field_source(source));
                match self.initialize_static_storage(field.parent, &field_lookup) {
                    Ok(true) => moved_ip = true,
                    Ok(false) => {
                        let value = res_try!(self.static_field_value(field, &field_lookup));
                        push!(value);
                    }
                    Err(e) => return StepResult::Error(e),
                }
            }
            StoreStaticField(source) => {
                let (field, field_lookup) = res_try!(self.locate_field_source(source));
                match self.initialize_static_storage(field.parent, &field_lookup) {
                    Ok(true) => moved_ip = true,
                    Ok(false) => {
                        let field_ty = res_try!(self.field_concrete(field, &field_lookup));
                        let value = pop!();
                        let value = op_try!(self, self.shared.assemblies.coerce(value, &field_ty));
                        res_try!(self.set_static_field_value(field, &field_lookup, value));
                    }
                    Err(e) => return StepResult::Error(e),
                }
            }
            LoadStaticFieldAddress(source) => {
                let (field, field_lookup) = res_try!(self.locate_field_source(source));
                match self.initialize_static_storage(field.parent, &field_lookup) {
                    Ok(true) => moved_ip = true,
                    Ok(false) => {
                        let field_ty = res_try!(self.field_concrete(field, &field_lookup));
                        let Some(storage) =
                            self.shared.statics.get(field.parent, &field_lookup)
                        else {
                            return StepResult::Error(VmError::Execution(
                                ExecutionError::NotImplemented(
                                    "static storage missing after initialization".to_string(),
                                ),
                            ));
                        };
                        let ptr = ManagedPtr::to_static(storage.storage.clone(), field_ty.clone())
                            .project(Projection::Field(field), field_ty);
                        push!(StackValue::ManagedPtr(ptr));
                    }
                    Err(e) => return StepResult::Error(e),
                }
            }
            BoxValue(t) => {
                let ty = res_try!(self.make_concrete(t));
                let value = pop!();
                if let StackValue::ObjectRef(_) = value {
                    // boxing is a noop for all reference types
                    push!(value);
                } else {
                    let description = res_try!(self.shared.assemblies.find_concrete_type(&ty));
                    let value = op_try!(self, self.shared.assemblies.coerce(value, &ty));
                    push!(StackValue::ObjectRef(ObjectRef::new(HeapStorage::Boxed(
                        BoxedValue {
                            ty,
                            description,
                            value,
                        }
                    ))));
                }
            }
            UnboxIntoAddress(t) => {
                let ty = res_try!(self.make_concrete(t));
                let value = pop!();
                vm_expect_stack!(let ObjectRef(o) = value);
                let Some(handle) = o.0 else {
                    return self.throw_by_name(NULL_REFERENCE);
                };
                let target = res_try!(self.shared.assemblies.find_concrete_type(&ty));
                let matches = match &*handle.read() {
                    HeapStorage::Boxed(b) => b.description == target,
                    _ => false,
                };
                if !matches {
                    return self.throw_by_name(INVALID_CAST);
                }
                push!(StackValue::ManagedPtr(ManagedPtr::to_heap(handle, ty)));
            }
            UnboxIntoValue(t) => {
                let ty = res_try!(self.make_concrete(t));
                let is_value = res_try!(self.shared.assemblies.concrete_is_value_type(&ty));
                if !is_value {
                    // for reference types, unbox.any is exactly castclass
                    let value = pop!();
                    vm_expect_stack!(let ObjectRef(o) = value);
                    if o.is_null() || res_try!(self.shared.assemblies.is_instance_of(&o, &ty)) {
                        push!(StackValue::ObjectRef(o));
                    } else {
                        return self.throw_by_name(INVALID_CAST);
                    }
                } else {
                    let value = pop!();
                    vm_expect_stack!(let ObjectRef(o) = value);
                    let Some(handle) = o.0 else {
                        return self.throw_by_name(NULL_REFERENCE);
                    };
                    let target = res_try!(self.shared.assemblies.find_concrete_type(&ty));
                    let payload = match &*handle.read() {
                        HeapStorage::Boxed(b) if b.description == target => {
                            Some(b.value.clone())
                        }
                        _ => None,
                    };
                    match payload {
                        Some(v) => push!(v),
                        None => return self.throw_by_name(INVALID_CAST),
                    }
                }
            }
            CastClass(t) => {
                let ty = res_try!(self.make_concrete(t));
                let value = pop!();
                vm_expect_stack!(let ObjectRef(o) = value);
                if o.is_null() || res_try!(self.shared.assemblies.is_instance_of(&o, &ty)) {
                    push!(StackValue::ObjectRef(o));
                } else {
                    return self.throw_by_name(INVALID_CAST);
                }
            }
            IsInstance(t) => {
                let ty = res_try!(self.make_concrete(t));
                let value = pop!();
                vm_expect_stack!(let ObjectRef(o) = value);
                if !o.is_null() && res_try!(self.shared.assemblies.is_instance_of(&o, &ty)) {
                    push!(StackValue::ObjectRef(o));
                } else {
                    push!(StackValue::null());
                }
            }
            InitializeForObject(t) => {
                let ty = res_try!(self.make_concrete(t));
                let dest = pop!();
                vm_expect_stack!(let ManagedPtr(p) = dest);
                let zero = res_try!(self.shared.assemblies.zero_value(&ty));
                op_try!(self, p.write(self, zero));
            }
            LoadObject(_) | LoadIndirect(_) => {
                let src = pop!();
                vm_expect_stack!(let ManagedPtr(p) = src);
                let value = op_try!(self, p.read(self));
                push!(value);
            }
            StoreObject(t) => {
                let value = pop!();
                let dest = pop!();
                vm_expect_stack!(let ManagedPtr(p) = dest);
                let ty = res_try!(self.make_concrete(t));
                let value = op_try!(self, self.shared.assemblies.coerce(value, &ty));
                op_try!(self, p.write(self, value));
            }
            StoreIndirect(st) => {
                let value = pop!();
                let dest = pop!();
                vm_expect_stack!(let ManagedPtr(p) = dest);
                let ty = store_type_concrete(&self.shared.assemblies, *st);
                let value = op_try!(self, self.shared.assemblies.coerce(value, &ty));
                op_try!(self, p.write(self, value));
            }
            LoadToken(token) => match token {
                TokenSource::Type(t) => {
                    let ty = res_try!(self.make_concrete(t));
                    let handle = res_try!(intrinsics::type_handle_value(self, ty));
                    push!(handle);
                }
                other => {
                    return StepResult::Error(VmError::Execution(ExecutionError::NotImplemented(
                        format!("ldtoken {:?}", other),
                    )))
                }
            },
            LoadMethodPointer(source) => {
                let (method, lookup) = res_try!(self.find_generic_method(source));
                let index = self.shared.method_handle(method, lookup);
                push!(NativeInt(index as isize));
            }
            LoadVirtualMethodPointer(source) => {
                let (base_method, lookup) = res_try!(self.find_generic_method(source));
                let receiver = pop!();
                let this_type = op_try!(self, self.runtime_type_of_receiver(&receiver));
                let method = res_try!(self
                    .shared
                    .assemblies
                    .resolve_virtual_method(base_method, this_type));
                let index = self.shared.method_handle(method, lookup);
                push!(NativeInt(index as isize));
            }
            Sizeof(t) => {
                let ty = res_try!(self.make_concrete(t));
                let size = res_try!(self.shared.assemblies.abstract_size(&ty));
                push!(Int32(size as i32));
            }

            // exception handling
            Throw => {
                let value = pop!();
                vm_expect_stack!(let ObjectRef(o) = value);
                if o.is_null() {
                    return self.throw_by_name(NULL_REFERENCE);
                }
                return self.throw(o);
            }
            Rethrow => {
                let Some(active) = self.current_frame().exception_stack.last().cloned() else {
                    return StepResult::Error(VmError::Execution(ExecutionError::NotImplemented(
                        "rethrow outside of an active catch handler".to_string(),
                    )));
                };
                return self.throw(active);
            }
            Leave(jump_target) => {
                self.exception_mode = match self.exception_mode.clone() {
                    // leaving a running finally resumes the outer walk
                    ExceptionState::ExecutingHandler {
                        exception,
                        target,
                        cursor,
                    } => ExceptionState::Unwinding {
                        exception,
                        target,
                        cursor,
                    },
                    _ => ExceptionState::Unwinding {
                        exception: None,
                        target: UnwindTarget::Instruction(*jump_target),
                        cursor: HandlerAddress {
                            frame_index: self.frames.len() - 1,
                            section_index: 0,
                            handler_index: 0,
                        },
                    },
                };
                return self.handle_exception();
            }
            EndFinally => match self.exception_mode.clone() {
                ExceptionState::ExecutingHandler {
                    exception,
                    target,
                    cursor,
                } => {
                    self.exception_mode = ExceptionState::Unwinding {
                        exception,
                        target,
                        cursor,
                    };
                    return self.handle_exception();
                }
                mode => {
                    return StepResult::Error(VmError::Execution(ExecutionError::NotImplemented(
                        format!("endfinally outside of a handler (state {:?})", mode),
                    )))
                }
            },
            EndFilter => {
                vm_expect_stack!(let Int32(result) = pop!());
                let (exception, handler) = match self.exception_mode.clone() {
                    ExceptionState::Filtering { exception, handler } => (exception, handler),
                    mode => {
                        return StepResult::Error(VmError::Execution(
                            ExecutionError::NotImplemented(format!(
                                "endfilter outside of a filter (state {:?})",
                                mode
                            )),
                        ))
                    }
                };

                self.restore_suspended(handler.frame_index);
                let original_ip = self.original_ip;
                let original_height = self.original_stack_height;
                let frame = &mut self.frames[handler.frame_index];
                frame.exception_stack.pop();
                frame.state.ip = original_ip;
                frame.stack_height = original_height;

                self.exception_mode = if result != 0 {
                    ExceptionState::Unwinding {
                        exception: Some(exception),
                        target: UnwindTarget::Handler(handler),
                        cursor: HandlerAddress {
                            frame_index: self.frames.len() - 1,
                            section_index: 0,
                            handler_index: 0,
                        },
                    }
                } else {
                    let mut next = handler;
                    next.handler_index += 1;
                    ExceptionState::Searching {
                        exception,
                        cursor: next,
                    }
                };
                return self.handle_exception();
            }
        }

        if !moved_ip && self.frames.len() == initial_frame_count {
            self.increment_ip();
        }
        StepResult::InstructionStepped
    }

    fn static_field_value(
        &self,
        field: FieldDescription,
        lookup: &GenericLookup,
    ) -> Result<StackValue, VmError> {
        let storage = self
            .shared
            .statics
            .get(field.parent, lookup)
            .ok_or_else(|| {
                VmError::Execution(ExecutionError::NotImplemented(
                    "static storage missing after initialization".to_string(),
                ))
            })?;
        let guard = storage.storage.read();
        guard.get_field(field).ok_or_else(|| {
            VmError::Execution(ExecutionError::TypeMismatch {
                expected: "declared static field",
                found: format!("{:?}", field),
            })
        })
    }

    fn set_static_field_value(
        &self,
        field: FieldDescription,
        lookup: &GenericLookup,
        value: StackValue,
    ) -> Result<(), VmError> {
        let storage = self
            .shared
            .statics
            .get(field.parent, lookup)
            .ok_or_else(|| {
                VmError::Execution(ExecutionError::NotImplemented(
                    "static storage missing after initialization".to_string(),
                ))
            })?;
        let mut guard = storage.storage.write();
        if guard.set_field(field, value) {
            Ok(())
        } else {
            Err(VmError::Execution(ExecutionError::TypeMismatch {
                expected: "declared static field",
                found: format!("{:?}", field),
            }))
        }
    }
}

fn element_index(value: StackValue) -> Result<usize, OpError> {
    match value {
        StackValue::Int32(i) if i >= 0 => Ok(i as usize),
        StackValue::NativeInt(i) if i >= 0 => Ok(i as usize),
        StackValue::Int32(_) | StackValue::NativeInt(_) => {
            Err(OpError::Throw(INDEX_OUT_OF_RANGE))
        }
        v => Err(OpError::invalid("array index", &v)),
    }
}

fn with_vector<R>(array: &StackValue, f: impl FnOnce(&Vector) -> R) -> Result<R, OpError> {
    match array {
        StackValue::ObjectRef(o) => match &o.0 {
            None => Err(OpError::Throw(NULL_REFERENCE)),
            Some(handle) => match &*handle.read() {
                HeapStorage::Vec(v) => Ok(f(v)),
                other => Err(OpError::Fatal(VmError::Execution(
                    ExecutionError::TypeMismatch {
                        expected: "array",
                        found: format!("{:?}", other),
                    },
                ))),
            },
        },
        v => Err(OpError::invalid("array", v)),
    }
}

fn with_vector_mut<R>(
    array: &StackValue,
    f: impl FnOnce(&mut Vector) -> Result<R, OpError>,
) -> Result<R, OpError> {
    match array {
        StackValue::ObjectRef(o) => match &o.0 {
            None => Err(OpError::Throw(NULL_REFERENCE)),
            Some(handle) => match &mut *handle.write() {
                HeapStorage::Vec(v) => f(v),
                other => Err(OpError::Fatal(VmError::Execution(
                    ExecutionError::TypeMismatch {
                        expected: "array",
                        found: format!("{:?}", other),
                    },
                ))),
            },
        },
        v => Err(OpError::invalid("array", v)),
    }
}

fn store_type_concrete(world: &Assemblies, st: StoreType) -> ConcreteType {
    let base = match st {
        StoreType::Int8 => BaseType::Int8,
        StoreType::Int16 => BaseType::Int16,
        StoreType::Int32 => BaseType::Int32,
        StoreType::Int64 => BaseType::Int64,
        StoreType::Float32 => BaseType::Float32,
        StoreType::Float64 => BaseType::Float64,
        StoreType::IntPtr => BaseType::IntPtr,
        StoreType::Object => BaseType::Object,
    };
    world.intern(ConcreteType::new(world.corlib(), base))
}
