//! Managed references (`&`): safe by-ref pointers into locals, arguments,
//! object fields, array elements, boxed payloads, and static storage.
//!
//! A reference is a root plus a projection path; dereferencing navigates the
//! live structures, so distinct locations always have distinct references
//! and a write through a reference mutates the underlying aggregate.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ExecutionError, VmError};
use crate::types::generics::ConcreteType;
use crate::types::FieldDescription;
use crate::value::ops::{OpError, INDEX_OUT_OF_RANGE};
use crate::value::{HeapStorage, Object, ObjectHandle, StackValue, Vector};

/// Access to the interpreter's argument/local/stack slots, implemented by
/// the call stack. Heap- and static-rooted references ignore it.
pub trait SlotAccess {
    fn slot(&self, index: usize) -> Result<&StackValue, VmError>;
    fn slot_mut(&mut self, index: usize) -> Result<&mut StackValue, VmError>;
}

#[derive(Clone)]
pub enum RefRoot {
    /// An argument or local slot, by absolute slot index.
    Slot(usize),
    /// A heap entity: object fields, array elements, or a boxed payload.
    Heap(ObjectHandle),
    /// The static field area of a type.
    Static(Arc<RwLock<Object>>),
}

impl PartialEq for RefRoot {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RefRoot::Slot(l), RefRoot::Slot(r)) => l == r,
            (RefRoot::Heap(l), RefRoot::Heap(r)) => Arc::ptr_eq(l, r),
            (RefRoot::Static(l), RefRoot::Static(r)) => Arc::ptr_eq(l, r),
            _ => false,
        }
    }
}

#[derive(Clone, PartialEq)]
pub enum Projection {
    Field(FieldDescription),
    Element(usize),
}

impl Debug for Projection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Projection::Field(fd) => write!(f, ".{}", fd.field.name),
            Projection::Element(i) => write!(f, "[{}]", i),
        }
    }
}

#[derive(Clone)]
pub struct ManagedPtr {
    pub root: RefRoot,
    pub path: Vec<Projection>,
    /// The pointee type, used for type checks at indirect accesses and for
    /// constrained dispatch.
    pub target: ConcreteType,
}

/// Reference equality: same location, regardless of pointee type annotation.
impl PartialEq for ManagedPtr {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root && self.path == other.path
    }
}

impl Debug for ManagedPtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.root {
            RefRoot::Slot(i) => write!(f, "&slot#{}", i)?,
            RefRoot::Heap(h) => write!(f, "&heap@{:p}", Arc::as_ptr(h))?,
            RefRoot::Static(s) => write!(f, "&static@{:p}", Arc::as_ptr(s))?,
        }
        for p in &self.path {
            write!(f, "{:?}", p)?;
        }
        write!(f, ": {:?}", self.target)
    }
}

enum PlaceRef<'a> {
    Value(&'a StackValue),
    Object(&'a Object),
    Vector(&'a Vector),
}

enum PlaceMut<'a> {
    Value(&'a mut StackValue),
    Object(&'a mut Object),
    Vector(&'a mut Vector),
}

fn not_projectable(projection: &Projection) -> OpError {
    OpError::Fatal(VmError::Execution(ExecutionError::TypeMismatch {
        expected: "projectable place",
        found: format!("{:?}", projection),
    }))
}

fn missing_field(field: FieldDescription) -> OpError {
    OpError::Fatal(VmError::Execution(ExecutionError::TypeMismatch {
        expected: "aggregate with field",
        found: format!("{:?}", field),
    }))
}

fn step<'a>(place: PlaceRef<'a>, projection: &Projection) -> Result<PlaceRef<'a>, OpError> {
    match (place, projection) {
        (PlaceRef::Object(o), Projection::Field(f)) => match o.field_index(*f) {
            Some(i) => Ok(PlaceRef::Value(&o.fields[i])),
            None => Err(missing_field(*f)),
        },
        (PlaceRef::Value(StackValue::ValueType(o)), Projection::Field(f)) => {
            match o.field_index(*f) {
                Some(i) => Ok(PlaceRef::Value(&o.fields[i])),
                None => Err(missing_field(*f)),
            }
        }
        (PlaceRef::Vector(v), Projection::Element(i)) => Ok(PlaceRef::Value(
            v.elements
                .get(*i)
                .ok_or(OpError::Throw(INDEX_OUT_OF_RANGE))?,
        )),
        (_, projection) => Err(not_projectable(projection)),
    }
}

fn step_mut<'a>(place: PlaceMut<'a>, projection: &Projection) -> Result<PlaceMut<'a>, OpError> {
    match (place, projection) {
        (PlaceMut::Object(o), Projection::Field(f)) => match o.field_index(*f) {
            Some(i) => Ok(PlaceMut::Value(&mut o.fields[i])),
            None => Err(missing_field(*f)),
        },
        (PlaceMut::Value(StackValue::ValueType(o)), Projection::Field(f)) => {
            match o.field_index(*f) {
                Some(i) => Ok(PlaceMut::Value(&mut o.fields[i])),
                None => Err(missing_field(*f)),
            }
        }
        (PlaceMut::Vector(v), Projection::Element(i)) => Ok(PlaceMut::Value(
            v.elements
                .get_mut(*i)
                .ok_or(OpError::Throw(INDEX_OUT_OF_RANGE))?,
        )),
        (_, projection) => Err(not_projectable(projection)),
    }
}

fn read_place(place: PlaceRef<'_>) -> Result<StackValue, OpError> {
    match place {
        PlaceRef::Value(v) => Ok(v.clone()),
        PlaceRef::Object(o) => Ok(StackValue::ValueType(Box::new(o.clone()))),
        PlaceRef::Vector(_) => Err(OpError::Fatal(VmError::Execution(
            ExecutionError::TypeMismatch {
                expected: "loadable place",
                found: "whole array".to_string(),
            },
        ))),
    }
}

fn assign(place: PlaceMut<'_>, value: StackValue) -> Result<(), OpError> {
    match place {
        PlaceMut::Value(slot) => {
            *slot = value;
            Ok(())
        }
        PlaceMut::Object(o) => match value {
            StackValue::ValueType(new) => {
                *o = *new;
                Ok(())
            }
            v => Err(OpError::invalid("value type store", &v)),
        },
        PlaceMut::Vector(_) => Err(OpError::Fatal(VmError::Execution(
            ExecutionError::TypeMismatch {
                expected: "storable place",
                found: "whole array".to_string(),
            },
        ))),
    }
}

fn heap_place(storage: &HeapStorage) -> Result<PlaceRef<'_>, OpError> {
    Ok(match storage {
        HeapStorage::Obj(o) => PlaceRef::Object(o),
        HeapStorage::Boxed(b) => PlaceRef::Value(&b.value),
        HeapStorage::Vec(v) => PlaceRef::Vector(v),
        other => {
            return Err(OpError::Fatal(VmError::Execution(
                ExecutionError::TypeMismatch {
                    expected: "addressable heap entity",
                    found: format!("{:?}", other),
                },
            )))
        }
    })
}

fn heap_place_mut(storage: &mut HeapStorage) -> Result<PlaceMut<'_>, OpError> {
    Ok(match storage {
        HeapStorage::Obj(o) => PlaceMut::Object(o),
        HeapStorage::Boxed(b) => PlaceMut::Value(&mut b.value),
        HeapStorage::Vec(v) => PlaceMut::Vector(v),
        other => {
            return Err(OpError::Fatal(VmError::Execution(
                ExecutionError::TypeMismatch {
                    expected: "addressable heap entity",
                    found: format!("{:?}", other),
                },
            )))
        }
    })
}

impl ManagedPtr {
    pub fn to_slot(index: usize, target: ConcreteType) -> Self {
        Self {
            root: RefRoot::Slot(index),
            path: vec![],
            target,
        }
    }

    pub fn to_heap(handle: ObjectHandle, target: ConcreteType) -> Self {
        Self {
            root: RefRoot::Heap(handle),
            path: vec![],
            target,
        }
    }

    pub fn to_static(storage: Arc<RwLock<Object>>, target: ConcreteType) -> Self {
        Self {
            root: RefRoot::Static(storage),
            path: vec![],
            target,
        }
    }

    pub fn project(&self, projection: Projection, target: ConcreteType) -> Self {
        let mut path = self.path.clone();
        path.push(projection);
        Self {
            root: self.root.clone(),
            path,
            target,
        }
    }

    /// Load the referenced value (a copy; value types copy field-wise).
    pub fn read(&self, slots: &dyn SlotAccess) -> Result<StackValue, OpError> {
        match &self.root {
            RefRoot::Slot(index) => {
                // a copy of the slot is enough for reading: projections only
                // descend into value types, which are aggregates by value
                let mut value = slots.slot(*index)?.clone();
                for projection in &self.path {
                    value = read_place(step(PlaceRef::Value(&value), projection)?)?;
                }
                Ok(value)
            }
            RefRoot::Heap(handle) => {
                let guard = handle.read();
                let mut place = heap_place(&guard)?;
                for projection in &self.path {
                    place = step(place, projection)?;
                }
                read_place(place)
            }
            RefRoot::Static(storage) => {
                let guard = storage.read();
                let mut place = PlaceRef::Object(&guard);
                for projection in &self.path {
                    place = step(place, projection)?;
                }
                read_place(place)
            }
        }
    }

    /// Store through the reference, mutating the underlying aggregate.
    pub fn write(&self, slots: &mut dyn SlotAccess, value: StackValue) -> Result<(), OpError> {
        match &self.root {
            RefRoot::Slot(index) => {
                let mut place = PlaceMut::Value(slots.slot_mut(*index)?);
                for projection in &self.path {
                    place = step_mut(place, projection)?;
                }
                assign(place, value)
            }
            RefRoot::Heap(handle) => {
                let mut guard = handle.write();
                let mut place = heap_place_mut(&mut guard)?;
                for projection in &self.path {
                    place = step_mut(place, projection)?;
                }
                assign(place, value)
            }
            RefRoot::Static(storage) => {
                let mut guard = storage.write();
                let mut place = PlaceMut::Object(&mut guard);
                for projection in &self.path {
                    place = step_mut(place, projection)?;
                }
                assign(place, value)
            }
        }
    }
}
