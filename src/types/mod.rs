//! Interpreter-owned descriptors for types, methods, and fields.
//!
//! Descriptors are `Copy` handles into leaked [`Image`]s; two descriptors are
//! equal iff they point at the same definition in the same image, which makes
//! them cheap cache keys throughout the resolver and the VM.

use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::ptr;

use crate::metadata::{Field, Image, MethodDef, TypeDef, TypeIndex};

pub mod generics;

/// A `Copy` handle to a registered (leaked) image, with pointer identity.
#[derive(Copy, Clone)]
pub struct ImageS(&'static Image);

impl ImageS {
    pub fn new(image: &'static Image) -> Self {
        Self(image)
    }

    pub fn definition(&self) -> &'static Image {
        self.0
    }
}

impl Deref for ImageS {
    type Target = Image;

    fn deref(&self) -> &Image {
        self.0
    }
}

impl Debug for ImageS {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.name)
    }
}

impl PartialEq for ImageS {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}
impl Eq for ImageS {}

impl Hash for ImageS {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0 as *const Image).hash(state);
    }
}

#[derive(Copy, Clone)]
pub struct TypeDescription {
    pub image: ImageS,
    pub index: TypeIndex,
    pub definition: &'static TypeDef,
}

impl TypeDescription {
    pub fn new(image: ImageS, index: TypeIndex) -> Self {
        Self {
            image,
            index,
            definition: &image.definition().types[index.0],
        }
    }

    pub fn type_name(&self) -> String {
        self.definition.type_name()
    }

    pub fn is_interface(&self) -> bool {
        self.definition.flags.interface
    }

    /// The type's `.cctor`, if it declares one.
    pub fn static_initializer(&self) -> Option<MethodDescription> {
        self.definition.methods.iter().find_map(|m| {
            if m.runtime_special_name
                && m.name == ".cctor"
                && !m.signature.instance
                && m.signature.parameters.is_empty()
            {
                Some(MethodDescription {
                    parent: *self,
                    method: m,
                })
            } else {
                None
            }
        })
    }

    /// If this type derives directly from `System.Enum`, its underlying
    /// `value__` field type.
    pub fn is_enum(&self) -> Option<&'static crate::metadata::MethodType> {
        use crate::metadata::TypeSource;
        match &self.definition.extends {
            Some(TypeSource::User(crate::metadata::UserType::Reference { type_name, .. }))
                if type_name == "System.Enum" =>
            {
                self.enum_underlying()
            }
            Some(TypeSource::User(crate::metadata::UserType::Definition(idx)))
                if self.image.definition().types[idx.0].type_name() == "System.Enum" =>
            {
                self.enum_underlying()
            }
            _ => None,
        }
    }

    fn enum_underlying(&self) -> Option<&'static crate::metadata::MethodType> {
        let inner = self.definition.fields.iter().find(|f| !f.static_member)?;
        if inner.runtime_special_name && inner.name == "value__" {
            Some(&inner.field_type)
        } else {
            None
        }
    }

    pub fn methods(&self) -> impl Iterator<Item = MethodDescription> + '_ {
        let parent = *self;
        self.definition
            .methods
            .iter()
            .map(move |m| MethodDescription { parent, method: m })
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldDescription> + '_ {
        let parent = *self;
        self.definition
            .fields
            .iter()
            .map(move |f| FieldDescription { parent, field: f })
    }

    pub fn field_named(&self, name: &str) -> Option<FieldDescription> {
        self.fields().find(|f| f.field.name == name)
    }
}

impl Debug for TypeDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

impl PartialEq for TypeDescription {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.definition, other.definition)
    }
}
impl Eq for TypeDescription {}

impl Hash for TypeDescription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.definition as *const TypeDef).hash(state);
    }
}

#[derive(Copy, Clone)]
pub struct MethodDescription {
    pub parent: TypeDescription,
    pub method: &'static MethodDef,
}

impl MethodDescription {
    pub fn image(&self) -> ImageS {
        self.parent.image
    }

    /// A method is interpretable iff it has a managed body and is not
    /// implemented by the host.
    pub fn is_interpretable(&self) -> bool {
        self.method.body.is_some() && !self.method.internal_call
    }

    pub fn arg_count(&self) -> usize {
        usize::from(self.method.signature.instance) + self.method.signature.parameters.len()
    }
}

impl Debug for MethodDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.parent.type_name(), self.method.name)
    }
}

impl PartialEq for MethodDescription {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.method, other.method)
    }
}
impl Eq for MethodDescription {}

impl Hash for MethodDescription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.method as *const MethodDef).hash(state);
    }
}

#[derive(Copy, Clone)]
pub struct FieldDescription {
    pub parent: TypeDescription,
    pub field: &'static Field,
}

impl Debug for FieldDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.field.static_member {
            write!(f, "static ")?;
        }
        write!(f, "{}::{}", self.parent.type_name(), self.field.name)
    }
}

impl PartialEq for FieldDescription {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.field, other.field)
    }
}
impl Eq for FieldDescription {}

impl Hash for FieldDescription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.field as *const Field).hash(state);
    }
}
