//! The host bridge: methods the runtime provides rather than CIL bodies.
//!
//! Internal-call methods dispatch through this table, keyed by declaring
//! type and method name. Delegate construction and invocation also land
//! here, since the compiler declares those members `runtime`-implemented.

use tracing::trace;

use crate::error::{ExecutionError, VmError};
use crate::res_try;
use crate::resolve::Assemblies;
use crate::types::generics::{ConcreteType, GenericLookup};
use crate::types::MethodDescription;
use crate::value::ops::{OpError, NULL_REFERENCE};
use crate::value::{ClrString, DelegateValue, HeapStorage, ObjectRef, StackValue};
use crate::vm::stack::{is_delegate_type, CallStack};
use crate::vm::StepResult;
use crate::{op_try, vm_pop};

/// Is this method implemented by the engine instead of a body?
pub fn is_intrinsic(
    world: &Assemblies,
    method: MethodDescription,
) -> Result<bool, crate::error::ResolutionError> {
    if method.method.internal_call {
        return Ok(true);
    }
    if method.method.body.is_none()
        && is_delegate_type(world, method.parent)?
        && matches!(method.method.name.as_str(), ".ctor" | "Invoke")
    {
        return Ok(true);
    }
    Ok(false)
}

pub fn intrinsic_call(
    stack: &mut CallStack,
    method: MethodDescription,
    generics: &GenericLookup,
) -> StepResult {
    let parent = method.parent.type_name();
    let name = method.method.name.as_str();
    trace!(target: "cilvm::intrinsics", "{}::{}", parent, name);

    if is_delegate_type(&stack.shared.assemblies, method.parent).unwrap_or(false) {
        return match name {
            "Invoke" => delegate_invoke(stack, method),
            other => StepResult::Error(VmError::Execution(ExecutionError::NotImplemented(
                format!("delegate intrinsic {}::{}", parent, other),
            ))),
        };
    }

    match (parent.as_str(), name) {
        ("System.Object", "GetType") => {
            let this = vm_pop!(stack);
            let ty = op_try!(stack, receiver_runtime_type(stack, &this));
            let obj = res_try!(type_object(stack, ty));
            stack.push_stack(obj);
        }
        (_, "Equals") => {
            let other = vm_pop!(stack);
            let this = vm_pop!(stack);
            let eq = op_try!(stack, universal_equals(stack, &this, &other));
            stack.push_stack(StackValue::Int32(eq as i32));
        }
        (_, "GetHashCode") => {
            let this = vm_pop!(stack);
            let this = op_try!(stack, deref_receiver(stack, this));
            stack.push_stack(StackValue::Int32(value_hash(&this)));
        }
        ("System.Object", "ToString") => {
            let this = vm_pop!(stack);
            let text = op_try!(stack, value_to_string(stack, &this));
            stack.push_stack(StackValue::string(text.as_str()));
        }
        ("System.Object", "ReferenceEquals") => {
            let b = vm_pop!(stack);
            let a = vm_pop!(stack);
            let eq = matches!((&a, &b), (StackValue::ObjectRef(x), StackValue::ObjectRef(y)) if x == y);
            stack.push_stack(StackValue::Int32(eq as i32));
        }
        ("System.String", "get_Length") => {
            let this = vm_pop!(stack);
            let s = op_try!(stack, expect_string(&this));
            stack.push_stack(StackValue::Int32(s.len() as i32));
        }
        ("System.String", "Concat") => {
            let b = vm_pop!(stack);
            let a = vm_pop!(stack);
            let mut joined = op_try!(stack, string_or_empty(&a)).as_string();
            joined.push_str(&op_try!(stack, string_or_empty(&b)).as_string());
            stack.push_stack(StackValue::string(joined));
        }
        ("System.String", "op_Equality") => {
            let b = vm_pop!(stack);
            let a = vm_pop!(stack);
            let eq = op_try!(stack, string_or_empty(&a)) == op_try!(stack, string_or_empty(&b))
                || matches!((&a, &b), (StackValue::ObjectRef(x), StackValue::ObjectRef(y)) if x.is_null() && y.is_null());
            stack.push_stack(StackValue::Int32(eq as i32));
        }
        ("System.Array", "get_Length") => {
            let this = vm_pop!(stack);
            let StackValue::ObjectRef(o) = this else {
                return StepResult::Error(VmError::Execution(ExecutionError::TypeMismatch {
                    expected: "array",
                    found: format!("{:?}", this),
                }));
            };
            let Some(handle) = o.0 else {
                return stack.throw_by_name(NULL_REFERENCE);
            };
            let len = match &*handle.read() {
                HeapStorage::Vec(v) => v.elements.len(),
                other => {
                    return StepResult::Error(VmError::Execution(ExecutionError::TypeMismatch {
                        expected: "array",
                        found: format!("{:?}", other),
                    }))
                }
            };
            stack.push_stack(StackValue::Int32(len as i32));
        }
        ("System.Delegate", "Combine") => {
            let b = vm_pop!(stack);
            let a = vm_pop!(stack);
            let combined = op_try!(stack, delegate_combine(a, b));
            stack.push_stack(combined);
        }
        ("System.Delegate", "Remove") => {
            let b = vm_pop!(stack);
            let a = vm_pop!(stack);
            let removed = op_try!(stack, delegate_remove(a, b));
            stack.push_stack(removed);
        }
        ("System.Type", "GetTypeFromHandle") => {
            let handle = vm_pop!(stack);
            let id = op_try!(stack, handle_field_value(&handle, "m_type"));
            let Some(ty) = stack.shared.type_from_handle(id as usize) else {
                return StepResult::Error(VmError::Execution(ExecutionError::NotImplemented(
                    format!("unknown runtime type handle {}", id),
                )));
            };
            let obj = res_try!(type_object(stack, ty));
            stack.push_stack(obj);
        }
        ("System.Type", "op_Equality") => {
            let b = vm_pop!(stack);
            let a = vm_pop!(stack);
            // type objects are interned per handle, so identity suffices
            let eq = matches!((&a, &b), (StackValue::ObjectRef(x), StackValue::ObjectRef(y)) if x == y);
            stack.push_stack(StackValue::Int32(eq as i32));
        }
        ("System.Type", "get_FullName") => {
            let this = vm_pop!(stack);
            let id = op_try!(stack, type_object_handle(&this));
            let Some(ty) = stack.shared.type_from_handle(id) else {
                return StepResult::Error(VmError::Execution(ExecutionError::NotImplemented(
                    format!("unknown runtime type handle {}", id),
                )));
            };
            stack.push_stack(StackValue::string(format!("{:?}", ty)));
        }
        _ => {
            let _ = generics;
            return StepResult::Error(VmError::Execution(ExecutionError::NotImplemented(
                format!("intrinsic {}::{}", parent, name),
            )));
        }
    }

    StepResult::InstructionStepped
}

/// The interned `System.RuntimeType` object for a runtime type.
pub fn type_object(stack: &CallStack, ty: ConcreteType) -> Result<StackValue, VmError> {
    let shared = &stack.shared;
    let id = shared.type_handle(ty);
    if let Some(existing) = shared.type_objects.get(&id) {
        return Ok(StackValue::ObjectRef(existing.clone()));
    }

    let world = &shared.assemblies;
    let td = world.corlib_type("System.RuntimeType")?;
    let mut object = world.new_object(td, &GenericLookup::default())?;
    if let Some(field) = object.field_named("m_handle") {
        object.set_field(field, StackValue::NativeInt(id as isize));
    }
    let obj = ObjectRef::new(HeapStorage::Obj(object));
    shared.type_objects.insert(id, obj.clone());
    Ok(StackValue::ObjectRef(obj))
}

/// The `RuntimeTypeHandle` value for `ldtoken` on a type.
pub fn type_handle_value(stack: &CallStack, ty: ConcreteType) -> Result<StackValue, VmError> {
    let shared = &stack.shared;
    let id = shared.type_handle(ty);
    let world = &shared.assemblies;
    let td = world.corlib_type("System.RuntimeTypeHandle")?;
    let mut object = world.new_object(td, &GenericLookup::default())?;
    if let Some(field) = object.field_named("m_type") {
        object.set_field(field, StackValue::NativeInt(id as isize));
    }
    Ok(StackValue::ValueType(Box::new(object)))
}

fn receiver_runtime_type(
    stack: &CallStack,
    receiver: &StackValue,
) -> Result<ConcreteType, OpError> {
    match receiver {
        StackValue::ObjectRef(o) if o.is_null() => Err(OpError::Throw(NULL_REFERENCE)),
        StackValue::ObjectRef(o) => Ok(stack.shared.assemblies.runtime_concrete_type(o)?),
        StackValue::ManagedPtr(p) => Ok(p.target.clone()),
        StackValue::ValueType(o) => Ok(stack
            .shared
            .assemblies
            .intern(ConcreteType::from(o.description))),
        v => Err(OpError::invalid("GetType receiver", v)),
    }
}

/// Follow a managed-pointer receiver (constrained dispatch) to the value it
/// addresses.
fn deref_receiver(stack: &CallStack, receiver: StackValue) -> Result<StackValue, OpError> {
    match receiver {
        StackValue::ManagedPtr(p) => p.read(stack),
        v => Ok(v),
    }
}

enum Normalized {
    Str(ClrString),
    Boxed(Option<crate::types::TypeDescription>, StackValue),
    Ref(ObjectRef),
    Plain(StackValue),
}

fn normalize(stack: &CallStack, value: &StackValue) -> Result<Normalized, OpError> {
    Ok(match value {
        StackValue::ManagedPtr(p) => normalize(stack, &p.read(stack)?)?,
        StackValue::ValueType(o) => {
            Normalized::Boxed(Some(o.description), StackValue::ValueType(o.clone()))
        }
        StackValue::ObjectRef(o) => match &o.0 {
            None => Normalized::Ref(ObjectRef::null()),
            Some(handle) => match &*handle.read() {
                HeapStorage::Str(s) => Normalized::Str(s.clone()),
                HeapStorage::Boxed(b) => Normalized::Boxed(Some(b.description), b.value.clone()),
                _ => Normalized::Ref(o.clone()),
            },
        },
        v => Normalized::Plain(v.clone()),
    })
}

/// `Object.Equals` semantics: identity for plain references, field-wise
/// value equality for boxed values and strings.
fn universal_equals(stack: &CallStack, a: &StackValue, b: &StackValue) -> Result<bool, OpError> {
    use Normalized::*;
    Ok(
        match (normalize(stack, a)?, normalize(stack, b)?) {
            (Str(x), Str(y)) => x == y,
            (Boxed(dx, x), Boxed(dy, y)) => {
                (match (dx, dy) {
                    (Some(dx), Some(dy)) => dx == dy,
                    _ => true,
                }) && x == y
            }
            (Boxed(_, x), Plain(y)) | (Plain(x), Boxed(_, y)) | (Plain(x), Plain(y)) => x == y,
            (Ref(x), Ref(y)) => x == y,
            _ => false,
        },
    )
}

fn value_hash(value: &StackValue) -> i32 {
    match value {
        StackValue::Int32(i) => *i,
        StackValue::Int64(i) => (*i ^ (*i >> 32)) as i32,
        StackValue::NativeInt(i) => (*i as i64 ^ ((*i as i64) >> 32)) as i32,
        StackValue::NativeFloat(f) => {
            let bits = f.to_bits();
            (bits ^ (bits >> 32)) as i32
        }
        StackValue::ObjectRef(o) => match &o.0 {
            None => 0,
            Some(handle) => match &*handle.read() {
                HeapStorage::Str(s) => string_hash(s),
                HeapStorage::Boxed(b) => value_hash(&b.value),
                _ => std::sync::Arc::as_ptr(handle) as i32,
            },
        },
        StackValue::ManagedPtr(_) => 0,
        StackValue::ValueType(o) => o
            .fields
            .iter()
            .fold(17i32, |acc, f| acc.wrapping_mul(31).wrapping_add(value_hash(f))),
    }
}

fn string_hash(s: &ClrString) -> i32 {
    let mut hash: u32 = 2166136261;
    for unit in s.units() {
        hash ^= *unit as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash as i32
}

fn value_to_string(stack: &CallStack, value: &StackValue) -> Result<String, OpError> {
    Ok(match normalize(stack, value)? {
        Normalized::Str(s) => s.as_string(),
        Normalized::Boxed(_, v) => match v {
            StackValue::Int32(i) => i.to_string(),
            StackValue::Int64(i) => i.to_string(),
            StackValue::NativeInt(i) => i.to_string(),
            StackValue::NativeFloat(f) => f.to_string(),
            StackValue::ValueType(o) => o.description.type_name(),
            v => format!("{:?}", v),
        },
        Normalized::Ref(o) if o.is_null() => return Err(OpError::Throw(NULL_REFERENCE)),
        Normalized::Ref(o) => stack.shared.assemblies.heap_description(&o)?.type_name(),
        Normalized::Plain(v) => format!("{:?}", v),
    })
}

fn expect_string(value: &StackValue) -> Result<ClrString, OpError> {
    match value {
        StackValue::ObjectRef(o) => match &o.0 {
            None => Err(OpError::Throw(NULL_REFERENCE)),
            Some(handle) => match &*handle.read() {
                HeapStorage::Str(s) => Ok(s.clone()),
                other => Err(OpError::Fatal(VmError::Execution(
                    ExecutionError::TypeMismatch {
                        expected: "string",
                        found: format!("{:?}", other),
                    },
                ))),
            },
        },
        v => Err(OpError::invalid("string", v)),
    }
}

fn string_or_empty(value: &StackValue) -> Result<ClrString, OpError> {
    match value {
        StackValue::ObjectRef(o) if o.is_null() => Ok(ClrString::default()),
        v => expect_string(v),
    }
}

fn handle_field_value(value: &StackValue, field_name: &str) -> Result<isize, OpError> {
    let StackValue::ValueType(o) = value else {
        return Err(OpError::invalid("runtime handle", value));
    };
    let field = o
        .field_named(field_name)
        .ok_or_else(|| OpError::invalid("runtime handle", value))?;
    match o.get_field(field) {
        Some(StackValue::NativeInt(i)) => Ok(i),
        _ => Err(OpError::invalid("runtime handle", value)),
    }
}

fn type_object_handle(value: &StackValue) -> Result<usize, OpError> {
    let StackValue::ObjectRef(o) = value else {
        return Err(OpError::invalid("type object", value));
    };
    if o.is_null() {
        return Err(OpError::Throw(NULL_REFERENCE));
    }
    let mut result = None;
    o.as_object(|obj| {
        if let Some(field) = obj.field_named("m_handle") {
            if let Some(StackValue::NativeInt(i)) = obj.get_field(field) {
                result = Some(i as usize);
            }
        }
    });
    result.ok_or_else(|| OpError::invalid("type object", value))
}

fn expect_delegate(value: &StackValue) -> Result<Option<DelegateValue>, OpError> {
    match value {
        StackValue::ObjectRef(o) => match &o.0 {
            None => Ok(None),
            Some(handle) => match &*handle.read() {
                HeapStorage::Delegate(d) => Ok(Some(d.clone())),
                other => Err(OpError::Fatal(VmError::Execution(
                    ExecutionError::TypeMismatch {
                        expected: "delegate",
                        found: format!("{:?}", other),
                    },
                ))),
            },
        },
        v => Err(OpError::invalid("delegate", v)),
    }
}

fn delegate_combine(a: StackValue, b: StackValue) -> Result<StackValue, OpError> {
    match (expect_delegate(&a)?, expect_delegate(&b)?) {
        (None, _) => Ok(b),
        (_, None) => Ok(a),
        (Some(x), Some(y)) => {
            let mut targets = x.targets;
            targets.extend(y.targets);
            Ok(StackValue::ObjectRef(ObjectRef::new(
                HeapStorage::Delegate(DelegateValue {
                    description: x.description,
                    targets,
                }),
            )))
        }
    }
}

fn delegate_remove(source: StackValue, value: StackValue) -> Result<StackValue, OpError> {
    match (expect_delegate(&source)?, expect_delegate(&value)?) {
        (None, _) => Ok(StackValue::null()),
        (Some(_), None) => Ok(source),
        (Some(s), Some(v)) => {
            if v.targets.is_empty() {
                return Ok(source);
            }
            // strip the last contiguous occurrence of the removed list
            let n = v.targets.len();
            let mut targets = s.targets;
            let position = (0..targets.len().saturating_sub(n - 1))
                .rev()
                .find(|&i| {
                    targets[i..i + n]
                        .iter()
                        .zip(&v.targets)
                        .all(|(x, y)| x.receiver == y.receiver && x.method == y.method)
                });
            match position {
                None => Ok(source),
                Some(i) => {
                    targets.drain(i..i + n);
                    if targets.is_empty() {
                        Ok(StackValue::null())
                    } else {
                        Ok(StackValue::ObjectRef(ObjectRef::new(
                            HeapStorage::Delegate(DelegateValue {
                                description: s.description,
                                targets,
                            }),
                        )))
                    }
                }
            }
        }
    }
}

/// `Invoke` on a delegate: run every target in insertion order; the last
/// target's frame is left on the stack so its result flows back to the call
/// site like any other call.
fn delegate_invoke(stack: &mut CallStack, invoke: MethodDescription) -> StepResult {
    let param_count = invoke.method.signature.parameters.len();
    let mut args = vec![];
    for _ in 0..param_count {
        args.push(vm_pop!(stack));
    }
    args.reverse();
    let this = vm_pop!(stack);

    let delegate = match op_try!(stack, expect_delegate(&this)) {
        Some(d) => d,
        None => return stack.throw_by_name(NULL_REFERENCE),
    };
    if delegate.targets.is_empty() {
        return stack.throw_by_name(NULL_REFERENCE);
    }

    let depth = stack.frames.len();
    let entry_ip = stack.current_frame().state.ip;
    let last = delegate.targets.len() - 1;
    for (i, target) in delegate.targets.iter().enumerate() {
        if target.method.method.signature.instance {
            stack.push_stack(StackValue::ObjectRef(target.receiver.clone()));
        }
        for a in &args {
            stack.push_stack(a.clone());
        }

        let result = stack.dispatch_method(target.method, target.generics.clone());
        match result {
            StepResult::InstructionStepped => {}
            other => return other,
        }

        if i < last {
            // intermediate targets run to completion; their results are
            // discarded
            match stack.run_until_depth(depth) {
                StepResult::InstructionStepped => {}
                other => return other,
            }
            if stack.frames.len() != depth || stack.current_frame().state.ip != entry_ip {
                // an exception transferred control away from this call site
                return StepResult::InstructionStepped;
            }
            if target.method.method.signature.return_type.is_some() {
                let _ = vm_pop!(stack);
            }
        }
    }

    StepResult::InstructionStepped
}
