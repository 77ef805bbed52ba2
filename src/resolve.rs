//! The resolver: maps metadata references (possibly open over generic
//! variables) to concrete descriptors in a given generic scope, and caches
//! everything that is expensive or identity-sensitive.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::ResolutionError;
use crate::metadata::{
    BaseType, FieldSource, Image, MethodSignature, MethodType, TypeSource, UserMethod, UserType,
};
use crate::types::generics::{ConcreteType, GenericLookup};
use crate::types::{FieldDescription, ImageS, MethodDescription, TypeDescription};
use crate::value::ops::OpError;
use crate::value::{HeapStorage, InstanceLayout, LayoutField, Object, ObjectRef, StackValue};

/// Assembly names that resolve to the synthesized core library.
const CORLIB_ALIASES: &[&str] = &[
    "mscorlib",
    "System.Runtime",
    "System.Private.CoreLib",
    "CoreLib",
];

/// The set of registered images plus every resolution cache. Shared between
/// interpreter instances; all caches are safe for concurrent use.
pub struct Assemblies {
    images: RwLock<HashMap<String, ImageS>>,
    corlib: ImageS,
    corlib_cache: DashMap<String, TypeDescription>,
    type_cache: DashMap<(ImageS, UserType), TypeDescription>,
    interner: DashMap<ConcreteType, ConcreteType>,
    dispatch_cache: DashMap<(MethodDescription, TypeDescription), MethodDescription>,
    layout_cache: DashMap<(TypeDescription, GenericLookup), Arc<InstanceLayout>>,
}

impl Assemblies {
    pub fn new() -> Self {
        let corlib = ImageS::new(Box::leak(Box::new(crate::corlib::build())));
        let mut images = HashMap::new();
        images.insert(corlib.name.clone(), corlib);
        Self {
            images: RwLock::new(images),
            corlib,
            corlib_cache: DashMap::new(),
            type_cache: DashMap::new(),
            interner: DashMap::new(),
            dispatch_cache: DashMap::new(),
            layout_cache: DashMap::new(),
        }
    }

    /// Register a parsed image, leaking it to `'static` so descriptors can
    /// borrow from it for the life of the process.
    pub fn register(&self, image: Image) -> ImageS {
        let leaked = ImageS::new(Box::leak(Box::new(image)));
        self.images.write().insert(leaked.name.clone(), leaked);
        leaked
    }

    pub fn corlib(&self) -> ImageS {
        self.corlib
    }

    pub fn get_image(&self, name: &str) -> Result<ImageS, ResolutionError> {
        if CORLIB_ALIASES.contains(&name) {
            return Ok(self.corlib);
        }
        self.images
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| ResolutionError::AssemblyNotFound(name.to_string()))
    }

    pub fn corlib_type(&self, full_name: &str) -> Result<TypeDescription, ResolutionError> {
        if let Some(t) = self.corlib_cache.get(full_name) {
            return Ok(*t);
        }
        let found = self.find_in_image(self.corlib, full_name)?;
        self.corlib_cache.insert(full_name.to_string(), found);
        Ok(found)
    }

    pub fn find_in_image(
        &self,
        image: ImageS,
        full_name: &str,
    ) -> Result<TypeDescription, ResolutionError> {
        image
            .definition()
            .type_definition_index(full_name)
            .map(|idx| TypeDescription::new(image, idx))
            .ok_or_else(|| {
                ResolutionError::TypeNotFound(format!("{} in assembly {}", full_name, image.name))
            })
    }

    pub fn locate_type(
        &self,
        image: ImageS,
        handle: &UserType,
    ) -> Result<TypeDescription, ResolutionError> {
        let key = (image, handle.clone());
        if let Some(cached) = self.type_cache.get(&key) {
            return Ok(*cached);
        }
        let result = match handle {
            UserType::Definition(idx) => TypeDescription::new(image, *idx),
            UserType::Reference {
                assembly,
                type_name,
            } => {
                let target = self.get_image(assembly)?;
                self.find_in_image(target, type_name)?
            }
        };
        self.type_cache.insert(key, result);
        Ok(result)
    }

    /// Intern a constructed type: the same construction always yields the
    /// same identity, observable through [`ConcreteType::same_identity`].
    pub fn intern(&self, ty: ConcreteType) -> ConcreteType {
        if let Some(existing) = self.interner.get(&ty) {
            return existing.clone();
        }
        self.interner.entry(ty.clone()).or_insert(ty).clone()
    }

    pub fn make_concrete(
        &self,
        image: ImageS,
        lookup: &GenericLookup,
        t: &MethodType,
    ) -> Result<ConcreteType, ResolutionError> {
        Ok(self.intern(lookup.make_concrete(image, t)?))
    }

    /// The type arguments of a constructed generic type (empty otherwise).
    pub fn type_arguments(&self, ty: &ConcreteType) -> Vec<ConcreteType> {
        match ty.get() {
            BaseType::Type {
                source: TypeSource::Generic { parameters, .. },
            } => parameters.clone(),
            _ => vec![],
        }
    }

    /// The generic binding a member of `ty` executes under.
    pub fn binding_for(&self, ty: &ConcreteType) -> GenericLookup {
        GenericLookup::new(self.type_arguments(ty))
    }

    /// The defining [`TypeDescription`] behind any concrete type; primitives
    /// and built-in shapes resolve to their core-library types.
    pub fn find_concrete_type(
        &self,
        ty: &ConcreteType,
    ) -> Result<TypeDescription, ResolutionError> {
        use BaseType::*;
        match ty.get() {
            Type { source } => self.locate_type(ty.resolution(), source.base()),
            Boolean => self.corlib_type("System.Boolean"),
            Char => self.corlib_type("System.Char"),
            Int8 => self.corlib_type("System.SByte"),
            UInt8 => self.corlib_type("System.Byte"),
            Int16 => self.corlib_type("System.Int16"),
            UInt16 => self.corlib_type("System.UInt16"),
            Int32 => self.corlib_type("System.Int32"),
            UInt32 => self.corlib_type("System.UInt32"),
            Int64 => self.corlib_type("System.Int64"),
            UInt64 => self.corlib_type("System.UInt64"),
            Float32 => self.corlib_type("System.Single"),
            Float64 => self.corlib_type("System.Double"),
            IntPtr | Pointer(_) | ByRef(_) => self.corlib_type("System.IntPtr"),
            UIntPtr => self.corlib_type("System.UIntPtr"),
            Object => self.corlib_type("System.Object"),
            String => self.corlib_type("System.String"),
            Vector(_) => self.corlib_type("System.Array"),
        }
    }

    /// The inheritance chain starting at `child`, most derived first.
    pub fn ancestor_chain(
        &self,
        child: TypeDescription,
    ) -> Result<Vec<TypeDescription>, ResolutionError> {
        let mut out = vec![child];
        let mut current = child;
        while let Some(src) = &current.definition.extends {
            current = self.locate_type(current.image, src.base())?;
            out.push(current);
        }
        Ok(out)
    }

    /// The inheritance chain with each link's generic binding, derived from
    /// the `extends` type arguments composed through `lookup`.
    pub fn ancestors_with_generics(
        &self,
        child: TypeDescription,
        lookup: &GenericLookup,
    ) -> Result<Vec<(TypeDescription, GenericLookup)>, ResolutionError> {
        let mut out = vec![];
        let mut current = child;
        let mut current_lookup = lookup.clone();
        loop {
            out.push((current, current_lookup.clone()));
            let Some(src) = &current.definition.extends else {
                break;
            };
            let parent = self.locate_type(current.image, src.base())?;
            let parent_args = match src {
                TypeSource::Generic { parameters, .. } => parameters
                    .iter()
                    .map(|p| self.make_concrete(current.image, &current_lookup, p))
                    .collect::<Result<Vec<_>, _>>()?,
                TypeSource::User(_) => vec![],
            };
            current_lookup = GenericLookup::new(parent_args);
            current = parent;
        }
        Ok(out)
    }

    /// All interfaces a type implements, transitively, including through its
    /// base classes.
    pub fn interfaces_of(
        &self,
        ty: TypeDescription,
    ) -> Result<Vec<TypeDescription>, ResolutionError> {
        let mut out = vec![];
        for td in self.ancestor_chain(ty)? {
            self.collect_interfaces(td, &mut out)?;
        }
        Ok(out)
    }

    fn collect_interfaces(
        &self,
        ty: TypeDescription,
        out: &mut Vec<TypeDescription>,
    ) -> Result<(), ResolutionError> {
        for src in &ty.definition.implements {
            let iface = self.locate_type(ty.image, src.base())?;
            if !out.contains(&iface) {
                out.push(iface);
                self.collect_interfaces(iface, out)?;
            }
        }
        Ok(())
    }

    /// Class/interface assignability by definition identity (generic
    /// variance is not modeled; constructed instances compare erased).
    pub fn is_a(
        &self,
        child: TypeDescription,
        ancestor: TypeDescription,
    ) -> Result<bool, ResolutionError> {
        if self.ancestor_chain(child)?.contains(&ancestor) {
            return Ok(true);
        }
        Ok(ancestor.is_interface() && self.interfaces_of(child)?.contains(&ancestor))
    }

    pub fn is_value_type(&self, ty: TypeDescription) -> Result<bool, ResolutionError> {
        for td in self.ancestor_chain(ty)? {
            if matches!(
                td.type_name().as_str(),
                "System.ValueType" | "System.Enum"
            ) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn concrete_is_value_type(&self, ty: &ConcreteType) -> Result<bool, ResolutionError> {
        use BaseType::*;
        Ok(match ty.get() {
            Boolean | Char | Int8 | UInt8 | Int16 | UInt16 | Int32 | UInt32 | Int64 | UInt64
            | Float32 | Float64 | IntPtr | UIntPtr | Pointer(_) => true,
            Object | String | Vector(_) | ByRef(_) => false,
            Type { .. } => self.is_value_type(self.find_concrete_type(ty)?)?,
        })
    }

    /// The resolved instance-field list under a generic binding, inherited
    /// fields first (the observable layout order).
    pub fn instance_layout(
        &self,
        ty: TypeDescription,
        lookup: &GenericLookup,
    ) -> Result<Arc<InstanceLayout>, ResolutionError> {
        let key = (ty, GenericLookup::new(lookup.type_generics.to_vec()));
        if let Some(cached) = self.layout_cache.get(&key) {
            return Ok(Arc::clone(&cached));
        }

        let mut chain = self.ancestors_with_generics(ty, &key.1)?;
        chain.reverse();
        let mut fields = vec![];
        for (td, link_lookup) in chain {
            for fd in td.fields() {
                if fd.field.static_member || fd.field.literal {
                    continue;
                }
                fields.push(LayoutField {
                    field: fd,
                    field_type: self.make_concrete(td.image, &link_lookup, &fd.field.field_type)?,
                });
            }
        }

        let layout = Arc::new(InstanceLayout { fields });
        self.layout_cache.insert(key, Arc::clone(&layout));
        Ok(layout)
    }

    /// The static-field list of a type (statics are not inherited).
    pub fn static_layout(
        &self,
        ty: TypeDescription,
        lookup: &GenericLookup,
    ) -> Result<InstanceLayout, ResolutionError> {
        let mut fields = vec![];
        for fd in ty.fields() {
            if !fd.field.static_member || fd.field.literal {
                continue;
            }
            fields.push(LayoutField {
                field: fd,
                field_type: self.make_concrete(ty.image, lookup, &fd.field.field_type)?,
            });
        }
        Ok(InstanceLayout { fields })
    }

    /// Allocate a zero-initialized instance. Constructors are the caller's
    /// duty.
    pub fn new_object(
        &self,
        ty: TypeDescription,
        lookup: &GenericLookup,
    ) -> Result<Object, ResolutionError> {
        let layout = self.instance_layout(ty, lookup)?;
        let fields = layout
            .fields
            .iter()
            .map(|f| self.zero_value(&f.field_type))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Object::with_layout(ty, layout, fields))
    }

    /// The default value of a type: null for references, recursive zero for
    /// value types.
    pub fn zero_value(&self, ty: &ConcreteType) -> Result<StackValue, ResolutionError> {
        use BaseType::*;
        Ok(match ty.get() {
            Boolean | Char | Int8 | UInt8 | Int16 | UInt16 | Int32 | UInt32 => {
                StackValue::Int32(0)
            }
            Int64 | UInt64 => StackValue::Int64(0),
            IntPtr | UIntPtr | Pointer(_) | ByRef(_) => StackValue::NativeInt(0),
            Float32 | Float64 => StackValue::NativeFloat(0.0),
            Object | String | Vector(_) => StackValue::null(),
            Type { .. } => {
                let td = self.find_concrete_type(ty)?;
                if let Some(underlying) = td.is_enum() {
                    let under = self.make_concrete(td.image, &self.binding_for(ty), underlying)?;
                    return self.zero_value(&under);
                }
                if let Some(zero) = primitive_zero(&td.type_name()) {
                    zero
                } else if self.is_value_type(td)? {
                    StackValue::ValueType(Box::new(self.new_object(td, &self.binding_for(ty))?))
                } else {
                    StackValue::null()
                }
            }
        })
    }

    /// The runtime type description of a heap entity.
    pub fn heap_description(&self, obj: &ObjectRef) -> Result<TypeDescription, ResolutionError> {
        let handle = obj
            .0
            .as_ref()
            .ok_or_else(|| ResolutionError::TypeNotFound("<null reference>".to_string()))?;
        let guard = handle.read();
        Ok(match &*guard {
            HeapStorage::Obj(o) => o.description,
            HeapStorage::Str(_) => self.corlib_type("System.String")?,
            HeapStorage::Vec(_) => self.corlib_type("System.Array")?,
            HeapStorage::Boxed(b) => b.description,
            HeapStorage::Delegate(d) => d.description,
        })
    }

    /// The fully constructed runtime type of a heap entity, for `GetType`
    /// and reflection identity.
    pub fn runtime_concrete_type(
        &self,
        obj: &ObjectRef,
    ) -> Result<ConcreteType, ResolutionError> {
        let handle = obj
            .0
            .as_ref()
            .ok_or_else(|| ResolutionError::TypeNotFound("<null reference>".to_string()))?;
        let guard = handle.read();
        Ok(match &*guard {
            HeapStorage::Obj(o) => self.intern(ConcreteType::from(o.description)),
            HeapStorage::Str(_) => self.intern(ConcreteType::new(self.corlib, BaseType::String)),
            HeapStorage::Vec(v) => self.intern(ConcreteType::new(
                self.corlib,
                BaseType::Vector(v.element.clone()),
            )),
            HeapStorage::Boxed(b) => b.ty.clone(),
            HeapStorage::Delegate(d) => self.intern(ConcreteType::from(d.description)),
        })
    }

    /// `isinst`/`castclass` test against a closed target type. Null is never
    /// an instance of anything.
    pub fn is_instance_of(
        &self,
        value: &ObjectRef,
        target: &ConcreteType,
    ) -> Result<bool, ResolutionError> {
        use BaseType::*;
        let Some(handle) = value.0.as_ref() else {
            return Ok(false);
        };
        match target.get() {
            Object => Ok(true),
            String => Ok(matches!(&*handle.read(), HeapStorage::Str(_))),
            Vector(element) => Ok(match &*handle.read() {
                HeapStorage::Vec(v) => v.element == *element,
                _ => false,
            }),
            Type { .. } => {
                let runtime = self.heap_description(value)?;
                let target_td = self.find_concrete_type(target)?;
                if self.is_value_type(target_td)? {
                    // value types match through their boxed form
                    Ok(runtime == target_td)
                } else {
                    self.is_a(runtime, target_td)
                }
            }
            // boxed primitives
            _ => {
                let runtime = self.heap_description(value)?;
                Ok(runtime == self.find_concrete_type(target)?)
            }
        }
    }

    pub fn locate_method(
        &self,
        image: ImageS,
        handle: &UserMethod,
        lookup: &GenericLookup,
    ) -> Result<MethodDescription, ResolutionError> {
        match handle {
            UserMethod::Definition(d) => Ok(MethodDescription {
                parent: TypeDescription::new(image, d.parent_type()),
                method: &image.definition()[*d],
            }),
            UserMethod::Reference(r) => {
                let parent = self.make_concrete(image, lookup, &r.parent)?;
                let parent_td = self.find_concrete_type(&parent)?;
                self.find_method_in_type(parent_td, &r.name, &r.signature, image)
                    .ok_or_else(|| {
                        ResolutionError::MethodNotFound(format!(
                            "{}::{}",
                            parent_td.type_name(),
                            r.name
                        ))
                    })
            }
        }
    }

    pub fn locate_field(
        &self,
        image: ImageS,
        source: &FieldSource,
        lookup: &GenericLookup,
    ) -> Result<(FieldDescription, GenericLookup), ResolutionError> {
        match source {
            FieldSource::Definition(d) => Ok((
                FieldDescription {
                    parent: TypeDescription::new(image, d.parent_type()),
                    field: &image.definition()[*d],
                },
                lookup.clone(),
            )),
            FieldSource::Reference(r) => {
                let parent = self.make_concrete(image, lookup, &r.parent)?;
                let parent_td = self.find_concrete_type(&parent)?;
                for td in self.ancestor_chain(parent_td)? {
                    if let Some(fd) = td.field_named(&r.name) {
                        return Ok((fd, self.binding_for(&parent)));
                    }
                }
                Err(ResolutionError::FieldNotFound(format!(
                    "{}::{}",
                    parent_td.type_name(),
                    r.name
                )))
            }
        }
    }

    /// Search a type and its ancestors for a method by name and signature.
    pub fn find_method_in_type(
        &self,
        ty: TypeDescription,
        name: &str,
        signature: &MethodSignature,
        sig_image: ImageS,
    ) -> Option<MethodDescription> {
        for td in self.ancestor_chain(ty).ok()? {
            for m in td.methods() {
                if m.method.name == name
                    && self.signatures_match(signature, sig_image, &m.method.signature, td.image)
                {
                    return Some(m);
                }
            }
        }
        None
    }

    pub fn signatures_match(
        &self,
        a: &MethodSignature,
        a_image: ImageS,
        b: &MethodSignature,
        b_image: ImageS,
    ) -> bool {
        a.instance == b.instance
            && a.parameters.len() == b.parameters.len()
            && a.return_type.is_some() == b.return_type.is_some()
            && a.parameters
                .iter()
                .zip(&b.parameters)
                .all(|(x, y)| self.types_match(x.inner(), a_image, y.inner(), b_image))
    }

    /// Structural type equivalence across images. Generic variables match
    /// positionally; user types match by resolved definition identity.
    pub fn types_match(&self, a: &MethodType, ia: ImageS, b: &MethodType, ib: ImageS) -> bool {
        use MethodType::*;
        match (a, b) {
            (TypeGeneric(i), TypeGeneric(j)) => i == j,
            (MethodGeneric(i), MethodGeneric(j)) => i == j,
            (Base(x), Base(y)) => self.bases_match(x, ia, y, ib),
            _ => false,
        }
    }

    fn bases_match(
        &self,
        a: &BaseType<MethodType>,
        ia: ImageS,
        b: &BaseType<MethodType>,
        ib: ImageS,
    ) -> bool {
        use BaseType::*;
        match (a, b) {
            (Type { source: sa }, Type { source: sb }) => {
                let (Ok(ta), Ok(tb)) = (
                    self.locate_type(ia, sa.base()),
                    self.locate_type(ib, sb.base()),
                ) else {
                    return false;
                };
                if ta != tb {
                    return false;
                }
                match (sa, sb) {
                    (TypeSource::User(_), TypeSource::User(_)) => true,
                    (
                        TypeSource::Generic { parameters: pa, .. },
                        TypeSource::Generic { parameters: pb, .. },
                    ) => {
                        pa.len() == pb.len()
                            && pa
                                .iter()
                                .zip(pb)
                                .all(|(x, y)| self.types_match(x, ia, y, ib))
                    }
                    _ => false,
                }
            }
            (Vector(x), Vector(y)) => self.types_match(x, ia, y, ib),
            (ByRef(x), ByRef(y)) => self.types_match(x, ia, y, ib),
            (Pointer(None), Pointer(None)) => true,
            (Pointer(Some(x)), Pointer(Some(y))) => self.types_match(x, ia, y, ib),
            _ => std::mem::discriminant(a) == std::mem::discriminant(b) && !matches!(a, Type { .. } | Vector(_) | ByRef(_) | Pointer(_)),
        }
    }

    /// Virtual dispatch: the most-derived override of `base` in the runtime
    /// type's ancestry. Explicit `.override` entries win over name/signature
    /// matching. Results are memoized, which is the flat stand-in for a
    /// precomputed v-table.
    pub fn resolve_virtual_method(
        &self,
        base: MethodDescription,
        runtime_type: TypeDescription,
    ) -> Result<MethodDescription, ResolutionError> {
        if !base.method.virtual_member {
            return Ok(base);
        }
        let key = (base, runtime_type);
        if let Some(cached) = self.dispatch_cache.get(&key) {
            return Ok(*cached);
        }

        let mut result = base;
        'search: for td in self.ancestor_chain(runtime_type)? {
            for o in &td.definition.overrides {
                let declaration =
                    self.locate_method(td.image, &o.declaration, &GenericLookup::default())?;
                if declaration == base {
                    result = MethodDescription {
                        parent: TypeDescription::new(td.image, o.implementation.parent_type()),
                        method: &td.image.definition()[o.implementation],
                    };
                    break 'search;
                }
            }
            for m in td.methods() {
                if m.method.virtual_member
                    && m.method.name == base.method.name
                    && self.signatures_match(
                        &m.method.signature,
                        td.image,
                        &base.method.signature,
                        base.image(),
                    )
                {
                    result = m;
                    break 'search;
                }
            }
            if td == base.parent {
                // nothing below the declaring class overrides the slot
                break;
            }
        }

        self.dispatch_cache.insert(key, result);
        Ok(result)
    }

    /// Abstract size of a type in bytes for `sizeof`: primitive widths, a
    /// pointer-sized word for references, field sums for value types. No
    /// padding or packing is modeled.
    pub fn abstract_size(&self, ty: &ConcreteType) -> Result<usize, ResolutionError> {
        use BaseType::*;
        Ok(match ty.get() {
            Boolean | Int8 | UInt8 => 1,
            Char | Int16 | UInt16 => 2,
            Int32 | UInt32 | Float32 => 4,
            Int64 | UInt64 | Float64 => 8,
            IntPtr | UIntPtr | Pointer(_) | ByRef(_) | Object | String | Vector(_) => {
                std::mem::size_of::<usize>()
            }
            Type { .. } => {
                let td = self.find_concrete_type(ty)?;
                if let Some(underlying) = td.is_enum() {
                    let under = self.make_concrete(td.image, &self.binding_for(ty), underlying)?;
                    return self.abstract_size(&under);
                }
                if let Some(kind) = primitive_coercion(&td.type_name()) {
                    return self.abstract_size(&ConcreteType::new(self.corlib, kind));
                }
                if self.is_value_type(td)? {
                    let layout = self.instance_layout(td, &self.binding_for(ty))?;
                    let mut total = 0;
                    for f in &layout.fields {
                        total += self.abstract_size(&f.field_type)?;
                    }
                    total.max(1)
                } else {
                    std::mem::size_of::<usize>()
                }
            }
        })
    }

    /// Store conversion: the value as it would sit in a location of declared
    /// type `ty` (sub-word truncation, float precision, enum underlying),
    /// re-promoted to its stack representation.
    pub fn coerce(&self, value: StackValue, ty: &ConcreteType) -> Result<StackValue, OpError> {
        use BaseType::*;

        macro_rules! narrow_int {
            ($t:ty) => {
                match value {
                    StackValue::Int32(i) => Ok(StackValue::Int32(i as $t as i32)),
                    StackValue::Int64(i) => Ok(StackValue::Int32(i as $t as i32)),
                    StackValue::NativeInt(i) => Ok(StackValue::Int32(i as $t as i32)),
                    StackValue::NativeFloat(f) => Ok(StackValue::Int32(f as $t as i32)),
                    v => Err(OpError::invalid(stringify!($t), &v)),
                }
            };
        }

        match ty.get() {
            Boolean => match value {
                StackValue::Int32(i) => Ok(StackValue::Int32((i != 0) as i32)),
                StackValue::NativeInt(i) => Ok(StackValue::Int32((i != 0) as i32)),
                v => Err(OpError::invalid("bool", &v)),
            },
            Int8 => narrow_int!(i8),
            UInt8 => narrow_int!(u8),
            Int16 => narrow_int!(i16),
            Char | UInt16 => narrow_int!(u16),
            Int32 | UInt32 => match value {
                StackValue::Int32(i) => Ok(StackValue::Int32(i)),
                StackValue::Int64(i) => Ok(StackValue::Int32(i as i32)),
                StackValue::NativeInt(i) => Ok(StackValue::Int32(i as i32)),
                StackValue::NativeFloat(f) => Ok(StackValue::Int32(f as i32)),
                v => Err(OpError::invalid("int32", &v)),
            },
            Int64 | UInt64 => match value {
                StackValue::Int64(i) => Ok(StackValue::Int64(i)),
                StackValue::Int32(i) => Ok(StackValue::Int64(i as i64)),
                StackValue::NativeInt(i) => Ok(StackValue::Int64(i as i64)),
                StackValue::NativeFloat(f) => Ok(StackValue::Int64(f as i64)),
                v => Err(OpError::invalid("int64", &v)),
            },
            IntPtr | UIntPtr | Pointer(_) => match value {
                StackValue::NativeInt(i) => Ok(StackValue::NativeInt(i)),
                StackValue::Int32(i) => Ok(StackValue::NativeInt(i as isize)),
                StackValue::Int64(i) => Ok(StackValue::NativeInt(i as isize)),
                // function pointers and pinned references ride along untouched
                StackValue::ManagedPtr(p) => Ok(StackValue::ManagedPtr(p)),
                v => Err(OpError::invalid("native int", &v)),
            },
            Float32 => match value {
                StackValue::NativeFloat(f) => Ok(StackValue::NativeFloat(f as f32 as f64)),
                StackValue::Int32(i) => Ok(StackValue::NativeFloat(i as f32 as f64)),
                StackValue::Int64(i) => Ok(StackValue::NativeFloat(i as f32 as f64)),
                v => Err(OpError::invalid("float32", &v)),
            },
            Float64 => match value {
                StackValue::NativeFloat(f) => Ok(StackValue::NativeFloat(f)),
                StackValue::Int32(i) => Ok(StackValue::NativeFloat(i as f64)),
                StackValue::Int64(i) => Ok(StackValue::NativeFloat(i as f64)),
                v => Err(OpError::invalid("float64", &v)),
            },
            ByRef(_) => match value {
                StackValue::ManagedPtr(p) => Ok(StackValue::ManagedPtr(p)),
                StackValue::NativeInt(i) => Ok(StackValue::NativeInt(i)),
                v => Err(OpError::invalid("byref", &v)),
            },
            Object | String | Vector(_) => match value {
                StackValue::ObjectRef(o) => Ok(StackValue::ObjectRef(o)),
                v => Err(OpError::invalid("object reference", &v)),
            },
            Type { .. } => {
                let td = self.find_concrete_type(ty)?;
                if let Some(underlying) = td.is_enum() {
                    let under = self.make_concrete(td.image, &self.binding_for(ty), underlying)?;
                    return self.coerce(value, &under);
                }
                if let Some(kind) = primitive_coercion(&td.type_name()) {
                    return self.coerce(value, &ConcreteType::new(self.corlib, kind));
                }
                if self.is_value_type(td)? {
                    match value {
                        StackValue::ValueType(o) => Ok(StackValue::ValueType(o)),
                        v => Err(OpError::invalid("value type", &v)),
                    }
                } else {
                    match value {
                        StackValue::ObjectRef(o) => Ok(StackValue::ObjectRef(o)),
                        v => Err(OpError::invalid("object reference", &v)),
                    }
                }
            }
        }
    }
}

impl Default for Assemblies {
    fn default() -> Self {
        Self::new()
    }
}

/// Zero value of a core-library primitive named by full type name.
fn primitive_zero(name: &str) -> Option<StackValue> {
    Some(match name {
        "System.Boolean" | "System.Char" | "System.SByte" | "System.Byte" | "System.Int16"
        | "System.UInt16" | "System.Int32" | "System.UInt32" => StackValue::Int32(0),
        "System.Int64" | "System.UInt64" => StackValue::Int64(0),
        "System.IntPtr" | "System.UIntPtr" => StackValue::NativeInt(0),
        "System.Single" | "System.Double" => StackValue::NativeFloat(0.0),
        _ => return None,
    })
}

/// The base shape behind a core-library primitive type name, for store
/// coercion when a signature names the type instead of the element shape.
fn primitive_coercion(name: &str) -> Option<BaseType<ConcreteType>> {
    use BaseType::*;
    Some(match name {
        "System.Boolean" => Boolean,
        "System.Char" => Char,
        "System.SByte" => Int8,
        "System.Byte" => UInt8,
        "System.Int16" => Int16,
        "System.UInt16" => UInt16,
        "System.Int32" => Int32,
        "System.UInt32" => UInt32,
        "System.Int64" => Int64,
        "System.UInt64" => UInt64,
        "System.Single" => Float32,
        "System.Double" => Float64,
        "System.IntPtr" => IntPtr,
        "System.UIntPtr" => UIntPtr,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Field, MethodType, TypeDef};

    fn world() -> Assemblies {
        Assemblies::new()
    }

    #[test]
    fn interned_constructions_share_identity() {
        let world = world();
        let int32 = world.intern(ConcreteType::new(world.corlib(), BaseType::Int32));
        let a = world.intern(ConcreteType::new(world.corlib(), BaseType::Vector(int32.clone())));
        let b = world.intern(ConcreteType::new(world.corlib(), BaseType::Vector(int32)));
        assert!(a.same_identity(&b));
    }

    #[test]
    fn primitives_resolve_against_the_core_library() {
        let world = world();
        let int32 = ConcreteType::new(world.corlib(), BaseType::Int32);
        let td = world.find_concrete_type(&int32).unwrap();
        assert_eq!(td.type_name(), "System.Int32");
        assert!(world.concrete_is_value_type(&int32).unwrap());
    }

    #[test]
    fn exception_hierarchy_is_assignable() {
        let world = world();
        let dbz = world.corlib_type("System.DivideByZeroException").unwrap();
        let arith = world.corlib_type("System.ArithmeticException").unwrap();
        let exc = world.corlib_type("System.Exception").unwrap();
        let string = world.corlib_type("System.String").unwrap();
        assert!(world.is_a(dbz, arith).unwrap());
        assert!(world.is_a(dbz, exc).unwrap());
        assert!(!world.is_a(string, exc).unwrap());
    }

    #[test]
    fn inherited_fields_lay_out_before_derived_ones() {
        let world = world();
        let mut image = Image::new("LayoutTest");
        let base = {
            let mut t = TypeDef::new(None, "Base");
            t.extends = Some(UserType::reference(crate::corlib::CORLIB_NAME, "System.Object").into());
            image.push_type_definition(t)
        };
        image.push_field(base, Field::new("First", BaseType::Int32.into()));
        let derived = {
            let mut t = TypeDef::new(None, "Derived");
            t.extends = Some(base.into());
            image.push_type_definition(t)
        };
        image.push_field(derived, Field::new("Second", BaseType::Int32.into()));

        let image = world.register(image);
        let derived_td = TypeDescription::new(image, derived);
        let layout = world
            .instance_layout(derived_td, &GenericLookup::default())
            .unwrap();
        let names: Vec<_> = layout
            .fields
            .iter()
            .map(|f| f.field.field.name.as_str())
            .collect();
        assert_eq!(names, vec!["First", "Second"]);
    }

    #[test]
    fn zero_values_match_declared_shapes() {
        let world = world();
        let int64 = ConcreteType::new(world.corlib(), BaseType::Int64);
        assert_eq!(world.zero_value(&int64).unwrap(), StackValue::Int64(0));
        let obj = ConcreteType::new(world.corlib(), BaseType::Object);
        assert_eq!(world.zero_value(&obj).unwrap(), StackValue::null());
    }

    #[test]
    fn coercion_truncates_into_narrow_locations() {
        let world = world();
        let byte = ConcreteType::new(world.corlib(), BaseType::UInt8);
        let coerced = world.coerce(StackValue::Int32(0x1FF), &byte).unwrap();
        assert_eq!(coerced, StackValue::Int32(0xFF));
    }
}
