//! Runtime values: evaluation-stack cells, heap entities, and references.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::generics::{ConcreteType, GenericLookup};
use crate::types::{MethodDescription, TypeDescription};

pub mod ops;
pub mod ptr;
pub mod storage;
pub mod string;

pub use ops::OpError;
pub use ptr::{ManagedPtr, Projection, RefRoot};
pub use storage::{InstanceLayout, LayoutField, Object};
pub use string::ClrString;

pub type ObjectHandle = Arc<RwLock<HeapStorage>>;

/// A nullable reference to a heap entity. Equality is identity.
#[derive(Clone)]
pub struct ObjectRef(pub Option<ObjectHandle>);

impl ObjectRef {
    pub fn new(storage: HeapStorage) -> Self {
        Self(Some(Arc::new(RwLock::new(storage))))
    }

    pub fn null() -> Self {
        Self(None)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    pub fn string(s: impl Into<ClrString>) -> Self {
        Self::new(HeapStorage::Str(s.into()))
    }

    /// Run `f` against the object payload, if this is a non-null plain object.
    pub fn as_object<R>(&self, f: impl FnOnce(&mut Object) -> R) -> Option<R> {
        let handle = self.0.as_ref()?;
        let mut guard = handle.write();
        match &mut *guard {
            HeapStorage::Obj(o) => Some(f(o)),
            _ => None,
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Some(l), Some(r)) => Arc::ptr_eq(l, r),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Debug for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => f.write_str("NULL"),
            Some(handle) => match &*handle.read() {
                HeapStorage::Obj(o) => write!(f, "{} @ {:p}", o.description.type_name(), Arc::as_ptr(handle)),
                HeapStorage::Vec(v) => write!(f, "{:?}[{}] @ {:p}", v.element, v.elements.len(), Arc::as_ptr(handle)),
                HeapStorage::Str(s) => write!(f, "{:?}", s),
                HeapStorage::Boxed(b) => write!(f, "boxed {:?}", b.value),
                HeapStorage::Delegate(d) => write!(f, "delegate -> {:?}", d.targets.last().map(|t| t.method)),
            },
        }
    }
}

/// A single-dimensional, zero-based array with dense element storage.
#[derive(Clone, Debug, PartialEq)]
pub struct Vector {
    pub element: ConcreteType,
    pub elements: Vec<StackValue>,
}

impl Vector {
    pub fn new(element: ConcreteType, elements: Vec<StackValue>) -> Self {
        Self { element, elements }
    }
}

/// A boxed value-type instance: the declared type plus a copy of the value.
#[derive(Clone, Debug, PartialEq)]
pub struct BoxedValue {
    pub ty: ConcreteType,
    pub description: TypeDescription,
    pub value: StackValue,
}

/// One entry of a delegate's invocation list.
#[derive(Clone, Debug)]
pub struct DelegateTarget {
    pub receiver: ObjectRef,
    pub method: MethodDescription,
    pub generics: GenericLookup,
}

/// A delegate: its declared type and the invocation list (length one for a
/// plain delegate, longer after `Delegate.Combine`). Targets are invoked in
/// insertion order and the last target's result is returned.
#[derive(Clone, Debug)]
pub struct DelegateValue {
    pub description: TypeDescription,
    pub targets: Vec<DelegateTarget>,
}

#[derive(Clone, Debug)]
pub enum HeapStorage {
    Obj(Object),
    Vec(Vector),
    Str(ClrString),
    Boxed(BoxedValue),
    Delegate(DelegateValue),
}

/// A tagged evaluation-stack cell. Sub-word integers are always promoted to
/// `Int32` here; precise widths are reinstated when a value is stored into a
/// location with a narrower declared type.
#[derive(Clone, PartialEq)]
pub enum StackValue {
    Int32(i32),
    Int64(i64),
    NativeInt(isize),
    NativeFloat(f64),
    ObjectRef(ObjectRef),
    ManagedPtr(ManagedPtr),
    ValueType(Box<Object>),
}

impl StackValue {
    pub fn null() -> Self {
        Self::ObjectRef(ObjectRef::null())
    }

    pub fn string(s: impl Into<ClrString>) -> Self {
        Self::ObjectRef(ObjectRef::string(s))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            StackValue::Int32(_) => "int32",
            StackValue::Int64(_) => "int64",
            StackValue::NativeInt(_) => "native int",
            StackValue::NativeFloat(_) => "F",
            StackValue::ObjectRef(_) => "O",
            StackValue::ManagedPtr(_) => "&",
            StackValue::ValueType(_) => "value type",
        }
    }
}

impl Default for StackValue {
    fn default() -> Self {
        Self::null()
    }
}

impl Debug for StackValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StackValue::Int32(i) => write!(f, "int32({})", i),
            StackValue::Int64(i) => write!(f, "int64({})", i),
            StackValue::NativeInt(i) => write!(f, "native int({})", i),
            StackValue::NativeFloat(v) => write!(f, "F({})", v),
            StackValue::ObjectRef(o) => write!(f, "{:?}", o),
            StackValue::ManagedPtr(p) => write!(f, "{:?}", p),
            StackValue::ValueType(o) => write!(f, "{:?}", o),
        }
    }
}
