//! Method bodies: locals, protected regions, and the instruction set.
//!
//! Branch targets and protected-region offsets are instruction indices, not
//! byte offsets; the metadata reader performs that normalization, along with
//! collapsing short-form opcodes (`ldloc.s`, `br.s`, `ldc.i4.n`, ...) into
//! the canonical variants below.

use super::{FieldSource, MethodSignature, MethodSource, MethodType, UserMethod};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocalVariable {
    pub var_type: MethodType,
    pub pinned: bool,
}

impl LocalVariable {
    pub fn new(var_type: MethodType) -> Self {
        Self {
            var_type,
            pinned: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Header {
    pub maximum_stack_size: usize,
    pub local_variables: Vec<LocalVariable>,
    pub initialize_locals: bool,
}

#[derive(Clone, Debug)]
pub struct MethodBody {
    pub header: Header,
    pub instructions: Vec<Instruction>,
    pub exceptions: Vec<ExceptionClause>,
}

impl MethodBody {
    /// A body with no locals and no protected regions.
    pub fn with_instructions(instructions: Vec<Instruction>) -> Self {
        Self {
            header: Header {
                maximum_stack_size: 8,
                local_variables: vec![],
                initialize_locals: true,
            },
            instructions,
            exceptions: vec![],
        }
    }
}

/// One protected region declared by a method body.
#[derive(Clone, Debug)]
pub struct ExceptionClause {
    pub try_offset: usize,
    pub try_length: usize,
    pub handler_offset: usize,
    pub handler_length: usize,
    pub kind: ExceptionKind,
}

#[derive(Clone, Debug)]
pub enum ExceptionKind {
    TypedException(MethodType),
    Filter { offset: usize },
    Finally,
    Fault,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NumberSign {
    Signed,
    Unsigned,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConversionType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    IntPtr,
    UIntPtr,
}

/// Element width selector for `ldind.*` and `ldelem.*`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LoadType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    Float32,
    Float64,
    IntPtr,
    Object,
}

/// Element width selector for `stind.*` and `stelem.*`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StoreType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    IntPtr,
    Object,
}

/// Operand of `ldtoken`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TokenSource {
    Type(MethodType),
    Method(MethodSource),
    Field(FieldSource),
}

#[derive(Clone, Debug)]
pub enum Instruction {
    // Stack and constant loads
    LoadConstantInt32(i32),
    LoadConstantInt64(i64),
    LoadConstantFloat32(f32),
    LoadConstantFloat64(f64),
    LoadString(String),
    LoadNull,
    Duplicate,
    Pop,
    NoOperation,

    // Locals and arguments
    LoadLocal(u16),
    LoadLocalAddress(u16),
    StoreLocal(u16),
    LoadArgument(u16),
    LoadArgumentAddress(u16),
    StoreArgument(u16),

    // Arithmetic and bitwise
    Add,
    AddOverflow(NumberSign),
    Subtract,
    SubtractOverflow(NumberSign),
    Multiply,
    MultiplyOverflow(NumberSign),
    Divide(NumberSign),
    Remainder(NumberSign),
    Negate,
    And,
    Or,
    Xor,
    Not,
    ShiftLeft,
    ShiftRight(NumberSign),
    CheckFinite,

    // Comparisons
    CompareEqual,
    CompareGreater(NumberSign),
    CompareLess(NumberSign),

    // Branches (targets are instruction indices)
    Branch(usize),
    BranchTruthy(usize),
    BranchFalsy(usize),
    BranchEqual(usize),
    BranchNotEqual(usize),
    BranchGreater(NumberSign, usize),
    BranchGreaterOrEqual(NumberSign, usize),
    BranchLess(NumberSign, usize),
    BranchLessOrEqual(NumberSign, usize),
    Switch(Vec<usize>),

    // Conversions
    Convert(ConversionType),
    ConvertOverflow(ConversionType, NumberSign),
    ConvertFloat32,
    ConvertFloat64,
    ConvertUnsignedToFloat,

    // Object model
    NewObject(UserMethod),
    NewArray(MethodType),
    InitializeForObject(MethodType),
    LoadObject(MethodType),
    StoreObject(MethodType),
    LoadField(FieldSource),
    StoreField(FieldSource),
    LoadFieldAddress(FieldSource),
    LoadStaticField(FieldSource),
    StoreStaticField(FieldSource),
    LoadStaticFieldAddress(FieldSource),
    LoadElement(MethodType),
    LoadElementPrimitive(LoadType),
    StoreElement(MethodType),
    StoreElementPrimitive(StoreType),
    LoadElementAddress(MethodType),
    LoadLength,
    BoxValue(MethodType),
    UnboxIntoAddress(MethodType),
    UnboxIntoValue(MethodType),
    CastClass(MethodType),
    IsInstance(MethodType),
    LoadToken(TokenSource),
    LoadMethodPointer(MethodSource),
    LoadVirtualMethodPointer(MethodSource),
    Sizeof(MethodType),

    // Indirect loads and stores (through managed references)
    LoadIndirect(LoadType),
    StoreIndirect(StoreType),

    // Calls
    Call {
        tail_call: bool,
        method: MethodSource,
    },
    CallVirtual {
        method: MethodSource,
    },
    CallConstrained(MethodType, MethodSource),
    CallIndirect {
        signature: MethodSignature,
    },
    Return,

    // Exception handling
    Throw,
    Rethrow,
    Leave(usize),
    EndFinally,
    EndFilter,
}

impl Instruction {
    /// `call` without the `tail.` prefix.
    pub fn call(method: impl Into<MethodSource>) -> Self {
        Instruction::Call {
            tail_call: false,
            method: method.into(),
        }
    }

    pub fn call_virtual(method: impl Into<MethodSource>) -> Self {
        Instruction::CallVirtual {
            method: method.into(),
        }
    }
}
