//! Field storage for interpreted objects and value-type instances.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::types::generics::ConcreteType;
use crate::types::{FieldDescription, TypeDescription};
use crate::value::StackValue;

/// The resolved field list of a type under a specific generic binding,
/// inherited fields first. Declaration order is the observable layout.
#[derive(Debug)]
pub struct InstanceLayout {
    pub fields: Vec<LayoutField>,
}

#[derive(Debug, Clone)]
pub struct LayoutField {
    pub field: FieldDescription,
    pub field_type: ConcreteType,
}

impl InstanceLayout {
    pub fn index_of(&self, field: FieldDescription) -> Option<usize> {
        self.fields.iter().position(|f| f.field == field)
    }
}

/// An interpreted object: a type plus its field values, laid out per the
/// type's [`InstanceLayout`]. Also used by value for value-type instances,
/// where `Clone` provides the copy-on-assignment semantics.
#[derive(Clone)]
pub struct Object {
    pub description: TypeDescription,
    pub layout: Arc<InstanceLayout>,
    pub fields: Vec<StackValue>,
}

impl Object {
    pub fn with_layout(description: TypeDescription, layout: Arc<InstanceLayout>, fields: Vec<StackValue>) -> Self {
        debug_assert_eq!(layout.fields.len(), fields.len());
        Self {
            description,
            layout,
            fields,
        }
    }

    pub fn field_index(&self, field: FieldDescription) -> Option<usize> {
        self.layout.index_of(field)
    }

    pub fn field_type(&self, field: FieldDescription) -> Option<&ConcreteType> {
        self.layout
            .index_of(field)
            .map(|i| &self.layout.fields[i].field_type)
    }

    pub fn get_field(&self, field: FieldDescription) -> Option<StackValue> {
        self.field_index(field).map(|i| self.fields[i].clone())
    }

    pub fn get_field_mut(&mut self, field: FieldDescription) -> Option<&mut StackValue> {
        let i = self.field_index(field)?;
        Some(&mut self.fields[i])
    }

    pub fn set_field(&mut self, field: FieldDescription, value: StackValue) -> bool {
        match self.field_index(field) {
            Some(i) => {
                self.fields[i] = value;
                true
            }
            None => false,
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.layout.fields.iter().any(|f| f.field.field.name == name)
    }

    pub fn field_named(&self, name: &str) -> Option<FieldDescription> {
        self.layout
            .fields
            .iter()
            .find(|f| f.field.field.name == name)
            .map(|f| f.field)
    }
}

/// Field-wise equality; identity plays no part, so two boxed copies of the
/// same value compare equal.
impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.description == other.description && self.fields == other.fields
    }
}

impl Debug for Object {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(&self.description.type_name());
        for (layout, value) in self.layout.fields.iter().zip(&self.fields) {
            s.field(&layout.field.field.name, value);
        }
        s.finish()
    }
}
