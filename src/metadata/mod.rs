//! The in-memory assembly image consumed by the interpreter.
//!
//! An [`Image`] is the output contract of an external metadata reader: a
//! fully parsed bundle of type definitions, members, and method bodies with
//! branch targets already normalized to instruction indices. The interpreter
//! never reads files; it walks these structures by reference.

use std::fmt::{self, Debug, Formatter};

pub mod body;

pub use body::*;

/// Index of a type definition within its declaring [`Image`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeIndex(pub usize);

/// Index of a method definition: declaring type + position in its method list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodIndex {
    pub parent: TypeIndex,
    pub member: usize,
}

impl MethodIndex {
    pub fn parent_type(&self) -> TypeIndex {
        self.parent
    }
}

/// Index of a field definition: declaring type + position in its field list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldIndex {
    pub parent: TypeIndex,
    pub member: usize,
}

impl FieldIndex {
    pub fn parent_type(&self) -> TypeIndex {
        self.parent
    }
}

/// A reference to a type definition, either inside the current image or in
/// another registered image (located by assembly and full type name).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum UserType {
    Definition(TypeIndex),
    Reference {
        assembly: String,
        type_name: String,
    },
}

impl From<TypeIndex> for UserType {
    fn from(t: TypeIndex) -> Self {
        UserType::Definition(t)
    }
}

impl UserType {
    pub fn reference(assembly: impl Into<String>, type_name: impl Into<String>) -> Self {
        UserType::Reference {
            assembly: assembly.into(),
            type_name: type_name.into(),
        }
    }
}

/// A possibly-generic use of a user-defined type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeSource<T> {
    User(UserType),
    Generic { base: UserType, parameters: Vec<T> },
}

impl<T> TypeSource<T> {
    pub fn base(&self) -> &UserType {
        match self {
            TypeSource::User(u) | TypeSource::Generic { base: u, .. } => u,
        }
    }

}

impl<T> From<UserType> for TypeSource<T> {
    fn from(u: UserType) -> Self {
        TypeSource::User(u)
    }
}

impl<T> From<TypeIndex> for TypeSource<T> {
    fn from(t: TypeIndex) -> Self {
        TypeSource::User(UserType::Definition(t))
    }
}

/// The shape of a type, parameterized over the representation of nested
/// types so the same enum serves both open signatures ([`MethodType`]) and
/// closed runtime types.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BaseType<T> {
    Boolean,
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    IntPtr,
    UIntPtr,
    Object,
    String,
    Type { source: TypeSource<T> },
    Vector(T),
    Pointer(Option<T>),
    ByRef(T),
}

impl<T> BaseType<T> {
    pub fn class(source: impl Into<TypeSource<T>>) -> Self {
        BaseType::Type {
            source: source.into(),
        }
    }
}

/// A type as written in a signature or instruction operand; may contain open
/// generic variables (`!n` for type parameters, `!!n` for method parameters).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MethodType {
    Base(Box<BaseType<MethodType>>),
    TypeGeneric(usize),
    MethodGeneric(usize),
}

impl From<BaseType<MethodType>> for MethodType {
    fn from(b: BaseType<MethodType>) -> Self {
        MethodType::Base(Box::new(b))
    }
}

impl MethodType {
    pub fn class(source: impl Into<TypeSource<MethodType>>) -> Self {
        BaseType::class(source).into()
    }
}

/// One parameter of a method signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ParameterType {
    Value(MethodType),
    Ref(MethodType),
}

impl ParameterType {
    pub fn inner(&self) -> &MethodType {
        match self {
            ParameterType::Value(t) | ParameterType::Ref(t) => t,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    pub instance: bool,
    pub parameters: Vec<ParameterType>,
    /// `None` is void.
    pub return_type: Option<ParameterType>,
    pub varargs: bool,
}

impl MethodSignature {
    pub fn static_method(
        parameters: Vec<ParameterType>,
        return_type: Option<ParameterType>,
    ) -> Self {
        Self {
            instance: false,
            parameters,
            return_type,
            varargs: false,
        }
    }

    pub fn instance_method(
        parameters: Vec<ParameterType>,
        return_type: Option<ParameterType>,
    ) -> Self {
        Self {
            instance: true,
            parameters,
            return_type,
            varargs: false,
        }
    }
}

/// Compile-time constant, used for literal fields and static field defaults.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Boolean(bool),
    Char(u16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Null,
}

#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    pub field_type: MethodType,
    pub static_member: bool,
    pub literal: bool,
    pub default: Option<Constant>,
    pub runtime_special_name: bool,
    /// Explicit layout offset; `None` means implicit declaration order.
    pub offset: Option<usize>,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: MethodType) -> Self {
        Self {
            name: name.into(),
            field_type,
            static_member: false,
            literal: false,
            default: None,
            runtime_special_name: false,
            offset: None,
        }
    }

    pub fn static_field(name: impl Into<String>, field_type: MethodType) -> Self {
        Self {
            static_member: true,
            ..Self::new(name, field_type)
        }
    }
}

#[derive(Clone, Debug)]
pub struct GenericParameter {
    pub name: String,
}

impl GenericParameter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Clone, Debug)]
pub struct MethodDef {
    pub name: String,
    pub signature: MethodSignature,
    pub body: Option<body::MethodBody>,
    pub generic_parameters: Vec<GenericParameter>,
    /// Implemented by the host runtime rather than by a CIL body.
    pub internal_call: bool,
    pub virtual_member: bool,
    pub abstract_member: bool,
    pub special_name: bool,
    pub runtime_special_name: bool,
}

impl MethodDef {
    pub fn new(
        name: impl Into<String>,
        signature: MethodSignature,
        body: Option<body::MethodBody>,
    ) -> Self {
        Self {
            name: name.into(),
            signature,
            body,
            generic_parameters: vec![],
            internal_call: false,
            virtual_member: false,
            abstract_member: false,
            special_name: false,
            runtime_special_name: false,
        }
    }

    pub fn internal(name: impl Into<String>, signature: MethodSignature) -> Self {
        Self {
            internal_call: true,
            ..Self::new(name, signature, None)
        }
    }

    pub fn virtual_method(
        name: impl Into<String>,
        signature: MethodSignature,
        body: Option<body::MethodBody>,
    ) -> Self {
        Self {
            virtual_member: true,
            ..Self::new(name, signature, body)
        }
    }

    pub fn constructor(signature: MethodSignature, body: body::MethodBody) -> Self {
        Self {
            special_name: true,
            runtime_special_name: true,
            ..Self::new(".ctor", signature, Some(body))
        }
    }
}

/// An explicit override entry (`.override`): routes calls declared against
/// `declaration` to the local method `implementation`.
#[derive(Clone, Debug)]
pub struct MethodOverride {
    pub declaration: UserMethod,
    pub implementation: MethodIndex,
}

#[derive(Clone, Debug, Default)]
pub struct TypeFlags {
    pub interface: bool,
    pub abstract_type: bool,
    pub sealed: bool,
}

#[derive(Clone, Debug)]
pub struct TypeDef {
    pub namespace: Option<String>,
    pub name: String,
    pub extends: Option<TypeSource<MethodType>>,
    pub implements: Vec<TypeSource<MethodType>>,
    pub fields: Vec<Field>,
    pub methods: Vec<MethodDef>,
    pub generic_parameters: Vec<GenericParameter>,
    pub overrides: Vec<MethodOverride>,
    pub flags: TypeFlags,
}

impl TypeDef {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.into(),
            extends: None,
            implements: vec![],
            fields: vec![],
            methods: vec![],
            generic_parameters: vec![],
            overrides: vec![],
            flags: TypeFlags::default(),
        }
    }

    /// Namespace-qualified name, e.g. `System.Int32`.
    pub fn type_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

/// A reference to a method in another type, matched by name and signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub parent: MethodType,
    pub name: String,
    pub signature: MethodSignature,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum UserMethod {
    Definition(MethodIndex),
    Reference(Box<MethodRef>),
}

impl From<MethodIndex> for UserMethod {
    fn from(m: MethodIndex) -> Self {
        UserMethod::Definition(m)
    }
}

/// A method operand of an instruction, optionally instantiating generic
/// method parameters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MethodSource {
    User(UserMethod),
    Generic {
        base: UserMethod,
        parameters: Vec<MethodType>,
    },
}

impl From<MethodIndex> for MethodSource {
    fn from(m: MethodIndex) -> Self {
        MethodSource::User(UserMethod::Definition(m))
    }
}

impl From<UserMethod> for MethodSource {
    fn from(m: UserMethod) -> Self {
        MethodSource::User(m)
    }
}

/// A reference to a field in another type, matched by name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub parent: MethodType,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldSource {
    Definition(FieldIndex),
    Reference(Box<FieldRef>),
}

impl From<FieldIndex> for FieldSource {
    fn from(f: FieldIndex) -> Self {
        FieldSource::Definition(f)
    }
}

/// An immutable bundle of type definitions. Registered images are leaked to
/// `'static` so member descriptors can hold plain references.
pub struct Image {
    pub name: String,
    pub types: Vec<TypeDef>,
}

impl Image {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: vec![],
        }
    }

    pub fn push_type_definition(&mut self, definition: TypeDef) -> TypeIndex {
        self.types.push(definition);
        TypeIndex(self.types.len() - 1)
    }

    pub fn push_field(&mut self, parent: TypeIndex, field: Field) -> FieldIndex {
        let fields = &mut self.types[parent.0].fields;
        fields.push(field);
        FieldIndex {
            parent,
            member: fields.len() - 1,
        }
    }

    pub fn push_method(&mut self, parent: TypeIndex, method: MethodDef) -> MethodIndex {
        let methods = &mut self.types[parent.0].methods;
        methods.push(method);
        MethodIndex {
            parent,
            member: methods.len() - 1,
        }
    }

    pub fn type_definition_index(&self, full_name: &str) -> Option<TypeIndex> {
        self.types
            .iter()
            .position(|t| t.type_name() == full_name)
            .map(TypeIndex)
    }
}

impl Debug for Image {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.name)
            .field("types", &self.types.len())
            .finish()
    }
}

impl std::ops::Index<TypeIndex> for Image {
    type Output = TypeDef;

    fn index(&self, index: TypeIndex) -> &TypeDef {
        &self.types[index.0]
    }
}

impl std::ops::Index<MethodIndex> for Image {
    type Output = MethodDef;

    fn index(&self, index: MethodIndex) -> &MethodDef {
        &self.types[index.parent.0].methods[index.member]
    }
}

impl std::ops::Index<FieldIndex> for Image {
    type Output = Field;

    fn index(&self, index: FieldIndex) -> &Field {
        &self.types[index.parent.0].fields[index.member]
    }
}
