//! Closed runtime types and generic scopes.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::error::ResolutionError;
use crate::metadata::{BaseType, MethodType, TypeSource, UserType};
use crate::types::{ImageS, TypeDescription};

/// A fully closed type: no generic variables remain. Structure is shared via
/// `Arc`, and the resolver interns constructions so that equal types also
/// share identity (`Arc::ptr_eq`).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConcreteType {
    source: ImageS,
    base: Arc<BaseType<ConcreteType>>,
}

impl ConcreteType {
    pub fn new(source: ImageS, base: BaseType<ConcreteType>) -> Self {
        ConcreteType {
            source,
            base: Arc::new(base),
        }
    }

    pub fn get(&self) -> &BaseType<ConcreteType> {
        &self.base
    }

    pub fn resolution(&self) -> ImageS {
        self.source
    }

    /// Identity comparison: true only for two handles to the same interned
    /// construction.
    pub fn same_identity(&self, other: &ConcreteType) -> bool {
        Arc::ptr_eq(&self.base, &other.base)
    }
}

impl From<TypeDescription> for ConcreteType {
    fn from(td: TypeDescription) -> Self {
        Self::new(
            td.image,
            BaseType::Type {
                source: TypeSource::User(UserType::Definition(td.index)),
            },
        )
    }
}

impl Debug for ConcreteType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use BaseType::*;
        match self.get() {
            Boolean => write!(f, "bool"),
            Char => write!(f, "char"),
            Int8 => write!(f, "int8"),
            UInt8 => write!(f, "uint8"),
            Int16 => write!(f, "int16"),
            UInt16 => write!(f, "uint16"),
            Int32 => write!(f, "int32"),
            UInt32 => write!(f, "uint32"),
            Int64 => write!(f, "int64"),
            UInt64 => write!(f, "uint64"),
            Float32 => write!(f, "float32"),
            Float64 => write!(f, "float64"),
            IntPtr => write!(f, "native int"),
            UIntPtr => write!(f, "native uint"),
            Object => write!(f, "object"),
            String => write!(f, "string"),
            Vector(e) => write!(f, "{:?}[]", e),
            Pointer(Some(e)) => write!(f, "{:?}*", e),
            Pointer(None) => write!(f, "void*"),
            ByRef(e) => write!(f, "{:?}&", e),
            Type { source } => {
                let name = match source.base() {
                    UserType::Definition(idx) => self.source.definition().types[idx.0].type_name(),
                    UserType::Reference { type_name, .. } => type_name.clone(),
                };
                write!(f, "{}", name)?;
                if let TypeSource::Generic { parameters, .. } = source {
                    write!(f, "<")?;
                    for (i, p) in parameters.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{:?}", p)?;
                    }
                    write!(f, ">")?;
                }
                Ok(())
            }
        }
    }
}

/// The generic scope of an executing method: concrete arguments for the
/// declaring type's parameters (`!n`) and the method's own (`!!n`).
///
/// Scopes are immutable; extension clones the `Arc`-backed argument slices,
/// so sharing between frames and cache keys is cheap.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct GenericLookup {
    pub type_generics: Arc<[ConcreteType]>,
    pub method_generics: Arc<[ConcreteType]>,
}

impl GenericLookup {
    pub fn new(type_generics: Vec<ConcreteType>) -> Self {
        Self {
            type_generics: type_generics.into(),
            method_generics: Arc::new([]),
        }
    }

    pub fn with_method_generics(&self, method_generics: Vec<ConcreteType>) -> Self {
        Self {
            type_generics: self.type_generics.clone(),
            method_generics: method_generics.into(),
        }
    }

    pub fn with_type_generics(&self, type_generics: Vec<ConcreteType>) -> Self {
        Self {
            type_generics: type_generics.into(),
            method_generics: self.method_generics.clone(),
        }
    }

    /// Substitute every generic variable in `t` with its binding, producing a
    /// closed type rooted in image `res`.
    pub fn make_concrete(
        &self,
        res: ImageS,
        t: &MethodType,
    ) -> Result<ConcreteType, ResolutionError> {
        match t {
            MethodType::Base(b) => {
                let mapped = map_base(res, (**b).clone(), self)?;
                Ok(ConcreteType::new(res, mapped))
            }
            MethodType::TypeGeneric(i) => {
                self.type_generics
                    .get(*i)
                    .cloned()
                    .ok_or(ResolutionError::GenericIndexOutOfBounds {
                        index: *i,
                        length: self.type_generics.len(),
                    })
            }
            MethodType::MethodGeneric(i) => {
                self.method_generics
                    .get(*i)
                    .cloned()
                    .ok_or(ResolutionError::GenericIndexOutOfBounds {
                        index: *i,
                        length: self.method_generics.len(),
                    })
            }
        }
    }
}

fn map_base(
    res: ImageS,
    base: BaseType<MethodType>,
    lookup: &GenericLookup,
) -> Result<BaseType<ConcreteType>, ResolutionError> {
    // BaseType::map cannot thread a Result through, so unfold it by hand.
    use BaseType::*;
    Ok(match base {
        Boolean => Boolean,
        Char => Char,
        Int8 => Int8,
        UInt8 => UInt8,
        Int16 => Int16,
        UInt16 => UInt16,
        Int32 => Int32,
        UInt32 => UInt32,
        Int64 => Int64,
        UInt64 => UInt64,
        Float32 => Float32,
        Float64 => Float64,
        IntPtr => IntPtr,
        UIntPtr => UIntPtr,
        Object => Object,
        String => String,
        Type { source } => Type {
            source: match source {
                TypeSource::User(u) => TypeSource::User(u),
                TypeSource::Generic { base, parameters } => TypeSource::Generic {
                    base,
                    parameters: parameters
                        .iter()
                        .map(|p| lookup.make_concrete(res, p))
                        .collect::<Result<_, _>>()?,
                },
            },
        },
        Vector(t) => Vector(lookup.make_concrete(res, &t)?),
        Pointer(t) => Pointer(match t {
            Some(t) => Some(lookup.make_concrete(res, &t)?),
            None => None,
        }),
        ByRef(t) => ByRef(lookup.make_concrete(res, &t)?),
    })
}

impl Debug for GenericLookup {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        struct GenericIndexFormatter(char, usize);
        impl Debug for GenericIndexFormatter {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", self.0, self.1)
            }
        }

        f.debug_map()
            .entries(
                self.type_generics
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (GenericIndexFormatter('T', i), t)),
            )
            .entries(
                self.method_generics
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (GenericIndexFormatter('M', i), t)),
            )
            .finish()
    }
}
