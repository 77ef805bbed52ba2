//! Evaluation-stack arithmetic: ECMA-335 §III.1.5 numeric promotion, the
//! overflow-checked variants, and the `conv.*` family.
//!
//! Operations that can raise a managed exception report the exception type
//! name; operand shapes the standard does not define for the operation are
//! fatal interpreter errors.

use std::cmp::Ordering;

use crate::error::{ExecutionError, ResolutionError, VmError};
use crate::metadata::{ConversionType, NumberSign};
use crate::value::StackValue;

pub const OVERFLOW: &str = "System.OverflowException";
pub const DIVIDE_BY_ZERO: &str = "System.DivideByZeroException";
pub const NULL_REFERENCE: &str = "System.NullReferenceException";
pub const INVALID_CAST: &str = "System.InvalidCastException";
pub const INDEX_OUT_OF_RANGE: &str = "System.IndexOutOfRangeException";
pub const ARITHMETIC: &str = "System.ArithmeticException";
pub const STACK_OVERFLOW: &str = "System.StackOverflowException";

/// Outcome channel for value operations: either a managed exception to be
/// thrown into the interpreted program, or a fatal engine error.
#[derive(Debug)]
pub enum OpError {
    /// Full name of the managed exception type to raise.
    Throw(&'static str),
    Fatal(VmError),
}

impl OpError {
    pub fn invalid(op: &'static str, found: &StackValue) -> Self {
        OpError::Fatal(VmError::Execution(ExecutionError::TypeMismatch {
            expected: op,
            found: format!("{:?}", found),
        }))
    }

    fn invalid_pair(op: &'static str, a: &StackValue, b: &StackValue) -> Self {
        OpError::Fatal(VmError::Execution(ExecutionError::TypeMismatch {
            expected: op,
            found: format!("{:?}, {:?}", a, b),
        }))
    }
}

impl From<VmError> for OpError {
    fn from(e: VmError) -> Self {
        OpError::Fatal(e)
    }
}

impl From<ResolutionError> for OpError {
    fn from(e: ResolutionError) -> Self {
        OpError::Fatal(VmError::Resolution(e))
    }
}

impl From<ExecutionError> for OpError {
    fn from(e: ExecutionError) -> Self {
        OpError::Fatal(VmError::Execution(e))
    }
}

pub type OpResult = Result<StackValue, OpError>;

macro_rules! binary_wrapping {
    ($name:ident, $op:ident, $label:literal) => {
        pub fn $name(self, rhs: StackValue) -> OpResult {
            use StackValue::*;
            Ok(match (self, rhs) {
                (Int32(l), Int32(r)) => Int32(l.$op(r)),
                (Int32(l), NativeInt(r)) => NativeInt((l as isize).$op(r)),
                (NativeInt(l), Int32(r)) => NativeInt(l.$op(r as isize)),
                (NativeInt(l), NativeInt(r)) => NativeInt(l.$op(r)),
                (Int64(l), Int64(r)) => Int64(l.$op(r)),
                (l, r) => return Err(OpError::invalid_pair($label, &l, &r)),
            })
        }
    };
}

macro_rules! binary_bitwise {
    ($name:ident, $op:tt, $label:literal) => {
        pub fn $name(self, rhs: StackValue) -> OpResult {
            use StackValue::*;
            Ok(match (self, rhs) {
                (Int32(l), Int32(r)) => Int32(l $op r),
                (Int32(l), NativeInt(r)) => NativeInt((l as isize) $op r),
                (NativeInt(l), Int32(r)) => NativeInt(l $op (r as isize)),
                (NativeInt(l), NativeInt(r)) => NativeInt(l $op r),
                (Int64(l), Int64(r)) => Int64(l $op r),
                (l, r) => return Err(OpError::invalid_pair($label, &l, &r)),
            })
        }
    };
}

macro_rules! binary_checked {
    ($name:ident, $checked:ident, $label:literal) => {
        pub fn $name(self, rhs: StackValue, sign: NumberSign) -> OpResult {
            use StackValue::*;
            const OVERFLOWED: OpError = OpError::Throw(OVERFLOW);
            Ok(match sign {
                NumberSign::Signed => match (self, rhs) {
                    (Int32(l), Int32(r)) => Int32(l.$checked(r).ok_or(OVERFLOWED)?),
                    (Int32(l), NativeInt(r)) => {
                        NativeInt((l as isize).$checked(r).ok_or(OVERFLOWED)?)
                    }
                    (NativeInt(l), Int32(r)) => {
                        NativeInt(l.$checked(r as isize).ok_or(OVERFLOWED)?)
                    }
                    (NativeInt(l), NativeInt(r)) => NativeInt(l.$checked(r).ok_or(OVERFLOWED)?),
                    (Int64(l), Int64(r)) => Int64(l.$checked(r).ok_or(OVERFLOWED)?),
                    (l, r) => return Err(OpError::invalid_pair($label, &l, &r)),
                },
                NumberSign::Unsigned => match (self, rhs) {
                    (Int32(l), Int32(r)) => {
                        Int32((l as u32).$checked(r as u32).ok_or(OVERFLOWED)? as i32)
                    }
                    (Int32(l), NativeInt(r)) => NativeInt(
                        (l as u32 as usize).$checked(r as usize).ok_or(OVERFLOWED)? as isize,
                    ),
                    (NativeInt(l), Int32(r)) => NativeInt(
                        (l as usize).$checked(r as u32 as usize).ok_or(OVERFLOWED)? as isize,
                    ),
                    (NativeInt(l), NativeInt(r)) => NativeInt(
                        (l as usize).$checked(r as usize).ok_or(OVERFLOWED)? as isize,
                    ),
                    (Int64(l), Int64(r)) => {
                        Int64((l as u64).$checked(r as u64).ok_or(OVERFLOWED)? as i64)
                    }
                    (l, r) => return Err(OpError::invalid_pair($label, &l, &r)),
                },
            })
        }
    };
}

impl StackValue {
    binary_wrapping!(add, wrapping_add, "add");
    binary_wrapping!(sub, wrapping_sub, "sub");
    binary_wrapping!(mul, wrapping_mul, "mul");

    binary_bitwise!(and, &, "and");
    binary_bitwise!(or, |, "or");
    binary_bitwise!(xor, ^, "xor");

    binary_checked!(checked_add, checked_add, "add.ovf");
    binary_checked!(checked_sub, checked_sub, "sub.ovf");
    binary_checked!(checked_mul, checked_mul, "mul.ovf");

    /// Addition including the float column of the binary numeric table.
    pub fn add_any(self, rhs: StackValue) -> OpResult {
        use StackValue::*;
        match (self, rhs) {
            (NativeFloat(l), NativeFloat(r)) => Ok(NativeFloat(l + r)),
            (l, r) => l.add(r),
        }
    }

    pub fn sub_any(self, rhs: StackValue) -> OpResult {
        use StackValue::*;
        match (self, rhs) {
            (NativeFloat(l), NativeFloat(r)) => Ok(NativeFloat(l - r)),
            (l, r) => l.sub(r),
        }
    }

    pub fn mul_any(self, rhs: StackValue) -> OpResult {
        use StackValue::*;
        match (self, rhs) {
            (NativeFloat(l), NativeFloat(r)) => Ok(NativeFloat(l * r)),
            (l, r) => l.mul(r),
        }
    }

    pub fn div(self, rhs: StackValue, sign: NumberSign) -> OpResult {
        use StackValue::*;
        macro_rules! signed_div {
            ($l:expr, $r:expr, $variant:ident, $t:ty) => {{
                if $r == 0 {
                    return Err(OpError::Throw(DIVIDE_BY_ZERO));
                }
                match ($l as $t).checked_div($r as $t) {
                    Some(v) => $variant(v),
                    // MinValue / -1
                    None => return Err(OpError::Throw(OVERFLOW)),
                }
            }};
        }
        macro_rules! unsigned_div {
            ($l:expr, $r:expr, $variant:ident, $u:ty, $t:ty) => {{
                if $r == 0 {
                    return Err(OpError::Throw(DIVIDE_BY_ZERO));
                }
                $variant((($l as $u) / ($r as $u)) as $t)
            }};
        }
        Ok(match sign {
            NumberSign::Signed => match (self, rhs) {
                (Int32(l), Int32(r)) => signed_div!(l, r, Int32, i32),
                (Int64(l), Int64(r)) => signed_div!(l, r, Int64, i64),
                (Int32(l), NativeInt(r)) => signed_div!(l as isize, r, NativeInt, isize),
                (NativeInt(l), Int32(r)) => signed_div!(l, r as isize, NativeInt, isize),
                (NativeInt(l), NativeInt(r)) => signed_div!(l, r, NativeInt, isize),
                (NativeFloat(l), NativeFloat(r)) => NativeFloat(l / r),
                (l, r) => return Err(OpError::invalid_pair("div", &l, &r)),
            },
            NumberSign::Unsigned => match (self, rhs) {
                (Int32(l), Int32(r)) => unsigned_div!(l, r, Int32, u32, i32),
                (Int64(l), Int64(r)) => unsigned_div!(l, r, Int64, u64, i64),
                (Int32(l), NativeInt(r)) => unsigned_div!(l as u32 as usize, r, NativeInt, usize, isize),
                (NativeInt(l), Int32(r)) => unsigned_div!(l, r as u32 as usize, NativeInt, usize, isize),
                (NativeInt(l), NativeInt(r)) => unsigned_div!(l, r, NativeInt, usize, isize),
                (l, r) => return Err(OpError::invalid_pair("div.un", &l, &r)),
            },
        })
    }

    pub fn rem(self, rhs: StackValue, sign: NumberSign) -> OpResult {
        use StackValue::*;
        macro_rules! signed_rem {
            ($l:expr, $r:expr, $variant:ident, $t:ty) => {{
                if $r == 0 {
                    return Err(OpError::Throw(DIVIDE_BY_ZERO));
                }
                match ($l as $t).checked_rem($r as $t) {
                    Some(v) => $variant(v),
                    None => return Err(OpError::Throw(OVERFLOW)),
                }
            }};
        }
        macro_rules! unsigned_rem {
            ($l:expr, $r:expr, $variant:ident, $u:ty, $t:ty) => {{
                if $r == 0 {
                    return Err(OpError::Throw(DIVIDE_BY_ZERO));
                }
                $variant((($l as $u) % ($r as $u)) as $t)
            }};
        }
        Ok(match sign {
            NumberSign::Signed => match (self, rhs) {
                (Int32(l), Int32(r)) => signed_rem!(l, r, Int32, i32),
                (Int64(l), Int64(r)) => signed_rem!(l, r, Int64, i64),
                (Int32(l), NativeInt(r)) => signed_rem!(l as isize, r, NativeInt, isize),
                (NativeInt(l), Int32(r)) => signed_rem!(l, r as isize, NativeInt, isize),
                (NativeInt(l), NativeInt(r)) => signed_rem!(l, r, NativeInt, isize),
                (NativeFloat(l), NativeFloat(r)) => NativeFloat(l % r),
                (l, r) => return Err(OpError::invalid_pair("rem", &l, &r)),
            },
            NumberSign::Unsigned => match (self, rhs) {
                (Int32(l), Int32(r)) => unsigned_rem!(l, r, Int32, u32, i32),
                (Int64(l), Int64(r)) => unsigned_rem!(l, r, Int64, u64, i64),
                (Int32(l), NativeInt(r)) => unsigned_rem!(l as u32 as usize, r, NativeInt, usize, isize),
                (NativeInt(l), Int32(r)) => unsigned_rem!(l, r as u32 as usize, NativeInt, usize, isize),
                (NativeInt(l), NativeInt(r)) => unsigned_rem!(l, r, NativeInt, usize, isize),
                (l, r) => return Err(OpError::invalid_pair("rem.un", &l, &r)),
            },
        })
    }

    pub fn neg(self) -> OpResult {
        use StackValue::*;
        Ok(match self {
            Int32(i) => Int32(i.wrapping_neg()),
            Int64(i) => Int64(i.wrapping_neg()),
            NativeInt(i) => NativeInt(i.wrapping_neg()),
            NativeFloat(f) => NativeFloat(-f),
            v => return Err(OpError::invalid("neg", &v)),
        })
    }

    pub fn not(self) -> OpResult {
        use StackValue::*;
        Ok(match self {
            Int32(i) => Int32(!i),
            Int64(i) => Int64(!i),
            NativeInt(i) => NativeInt(!i),
            v => return Err(OpError::invalid("not", &v)),
        })
    }

    pub fn shl(self, amount: StackValue) -> OpResult {
        use StackValue::*;
        let shift = amount.shift_amount()?;
        Ok(match self {
            Int32(i) => Int32(i.wrapping_shl(shift)),
            Int64(i) => Int64(i.wrapping_shl(shift)),
            NativeInt(i) => NativeInt(i.wrapping_shl(shift)),
            v => return Err(OpError::invalid("shl", &v)),
        })
    }

    pub fn shr(self, amount: StackValue, sign: NumberSign) -> OpResult {
        use StackValue::*;
        let shift = amount.shift_amount()?;
        Ok(match sign {
            NumberSign::Signed => match self {
                Int32(i) => Int32(i.wrapping_shr(shift)),
                Int64(i) => Int64(i.wrapping_shr(shift)),
                NativeInt(i) => NativeInt(i.wrapping_shr(shift)),
                v => return Err(OpError::invalid("shr", &v)),
            },
            NumberSign::Unsigned => match self {
                Int32(i) => Int32(((i as u32).wrapping_shr(shift)) as i32),
                Int64(i) => Int64(((i as u64).wrapping_shr(shift)) as i64),
                NativeInt(i) => NativeInt(((i as usize).wrapping_shr(shift)) as isize),
                v => return Err(OpError::invalid("shr.un", &v)),
            },
        })
    }

    fn shift_amount(&self) -> Result<u32, OpError> {
        match self {
            StackValue::Int32(i) => Ok(*i as u32),
            StackValue::NativeInt(i) => Ok(*i as u32),
            v => Err(OpError::invalid("shift amount", v)),
        }
    }

    /// Three-way comparison per the binary comparison table. `None` for
    /// unordered operands (NaN, or shapes the table does not relate).
    pub fn compare(&self, other: &StackValue, sign: NumberSign) -> Option<Ordering> {
        use StackValue::*;
        match sign {
            NumberSign::Signed => match (self, other) {
                (Int32(l), Int32(r)) => Some(l.cmp(r)),
                (Int32(l), NativeInt(r)) => Some((*l as isize).cmp(r)),
                (NativeInt(l), Int32(r)) => Some(l.cmp(&(*r as isize))),
                (NativeInt(l), NativeInt(r)) => Some(l.cmp(r)),
                (Int64(l), Int64(r)) => Some(l.cmp(r)),
                (NativeFloat(l), NativeFloat(r)) => l.partial_cmp(r),
                _ => None,
            },
            NumberSign::Unsigned => match (self, other) {
                (Int32(l), Int32(r)) => Some((*l as u32).cmp(&(*r as u32))),
                (Int32(l), NativeInt(r)) => Some((*l as u32 as usize).cmp(&(*r as usize))),
                (NativeInt(l), Int32(r)) => Some((*l as usize).cmp(&(*r as u32 as usize))),
                (NativeInt(l), NativeInt(r)) => Some((*l as usize).cmp(&(*r as usize))),
                (Int64(l), Int64(r)) => Some((*l as u64).cmp(&(*r as u64))),
                // cgt.un is the standard "is not null / not equal" idiom for
                // object references
                (NativeFloat(l), NativeFloat(r)) => l.partial_cmp(r),
                (ObjectRef(l), ObjectRef(r)) => {
                    if l == r {
                        Some(Ordering::Equal)
                    } else {
                        Some(Ordering::Greater)
                    }
                }
                _ => None,
            },
        }
    }

    /// Truthiness for `brtrue`/`brfalse`.
    pub fn is_nullish(&self) -> Result<bool, OpError> {
        use StackValue::*;
        Ok(match self {
            Int32(i) => *i == 0,
            Int64(i) => *i == 0,
            NativeInt(i) => *i == 0,
            NativeFloat(f) => *f == 0.0,
            ObjectRef(o) => o.is_null(),
            ManagedPtr(_) => false,
            v => return Err(OpError::invalid("truthiness check", v)),
        })
    }

    fn as_signed_i128(&self, op: &'static str) -> Result<i128, OpError> {
        use StackValue::*;
        Ok(match self {
            Int32(i) => *i as i128,
            Int64(i) => *i as i128,
            NativeInt(i) => *i as i128,
            v => return Err(OpError::invalid(op, v)),
        })
    }

    fn as_unsigned_i128(&self, op: &'static str) -> Result<i128, OpError> {
        use StackValue::*;
        Ok(match self {
            Int32(i) => *i as u32 as i128,
            Int64(i) => *i as u64 as i128,
            NativeInt(i) => *i as usize as i128,
            v => return Err(OpError::invalid(op, v)),
        })
    }

    /// `conv.*` without overflow detection: truncate integers, truncate
    /// floats toward zero (saturating deterministically when out of range).
    pub fn convert(self, target: ConversionType) -> OpResult {
        use StackValue::*;
        macro_rules! narrow {
            ($t:ty, into $variant:ident as $vt:ty) => {
                match self {
                    Int32(i) => $variant(i as $t as $vt),
                    Int64(i) => $variant(i as $t as $vt),
                    NativeInt(i) => $variant(i as $t as $vt),
                    // Rust float-to-int casts truncate toward zero and
                    // saturate at the bounds, which satisfies the
                    // deterministic out-of-range requirement
                    NativeFloat(f) => $variant(f as $t as $vt),
                    v => return Err(OpError::invalid("conv", &v)),
                }
            };
        }
        Ok(match target {
            ConversionType::Int8 => narrow!(i8, into Int32 as i32),
            ConversionType::UInt8 => narrow!(u8, into Int32 as i32),
            ConversionType::Int16 => narrow!(i16, into Int32 as i32),
            ConversionType::UInt16 => narrow!(u16, into Int32 as i32),
            ConversionType::Int32 => narrow!(i32, into Int32 as i32),
            ConversionType::UInt32 => narrow!(u32, into Int32 as i32),
            ConversionType::Int64 => match self {
                Int32(i) => Int64(i as i64),
                Int64(i) => Int64(i),
                NativeInt(i) => Int64(i as i64),
                NativeFloat(f) => Int64(f as i64),
                v => return Err(OpError::invalid("conv.i8", &v)),
            },
            ConversionType::UInt64 => match self {
                // zero-extend rather than sign-extend
                Int32(i) => Int64(i as u32 as i64),
                Int64(i) => Int64(i),
                NativeInt(i) => Int64(i as usize as i64),
                NativeFloat(f) => Int64(f as u64 as i64),
                v => return Err(OpError::invalid("conv.u8", &v)),
            },
            ConversionType::IntPtr => match self {
                Int32(i) => NativeInt(i as isize),
                Int64(i) => NativeInt(i as isize),
                NativeInt(i) => NativeInt(i),
                NativeFloat(f) => NativeInt(f as isize),
                v => return Err(OpError::invalid("conv.i", &v)),
            },
            ConversionType::UIntPtr => match self {
                Int32(i) => NativeInt(i as u32 as usize as isize),
                Int64(i) => NativeInt(i as u64 as usize as isize),
                NativeInt(i) => NativeInt(i),
                NativeFloat(f) => NativeInt(f as usize as isize),
                v => return Err(OpError::invalid("conv.u", &v)),
            },
        })
    }

    /// `conv.ovf.*`: range-checked conversion. `sign` selects how the source
    /// bits are interpreted (`.un` variants read them as unsigned).
    pub fn convert_overflow(self, target: ConversionType, sign: NumberSign) -> OpResult {
        use StackValue::*;

        if let NativeFloat(f) = self {
            return convert_float_overflow(f, target);
        }

        let wide = match sign {
            NumberSign::Signed => self.as_signed_i128("conv.ovf")?,
            NumberSign::Unsigned => self.as_unsigned_i128("conv.ovf.un")?,
        };

        macro_rules! ranged {
            ($t:ty, $variant:ident, $vt:ty) => {{
                if wide < <$t>::MIN as i128 || wide > <$t>::MAX as i128 {
                    return Err(OpError::Throw(OVERFLOW));
                }
                $variant(wide as $t as $vt)
            }};
        }

        Ok(match target {
            ConversionType::Int8 => ranged!(i8, Int32, i32),
            ConversionType::UInt8 => ranged!(u8, Int32, i32),
            ConversionType::Int16 => ranged!(i16, Int32, i32),
            ConversionType::UInt16 => ranged!(u16, Int32, i32),
            ConversionType::Int32 => ranged!(i32, Int32, i32),
            ConversionType::UInt32 => ranged!(u32, Int32, i32),
            ConversionType::Int64 => ranged!(i64, Int64, i64),
            ConversionType::UInt64 => ranged!(u64, Int64, i64),
            ConversionType::IntPtr => ranged!(isize, NativeInt, isize),
            ConversionType::UIntPtr => ranged!(usize, NativeInt, isize),
        })
    }

    /// `conv.r4`: convert through float32 precision.
    pub fn to_float32(self) -> OpResult {
        use StackValue::*;
        let v = match self {
            Int32(i) => i as f32,
            Int64(i) => i as f32,
            NativeInt(i) => i as f32,
            NativeFloat(f) => f as f32,
            v => return Err(OpError::invalid("conv.r4", &v)),
        };
        Ok(NativeFloat(v as f64))
    }

    /// `conv.r8`.
    pub fn to_float64(self) -> OpResult {
        use StackValue::*;
        let v = match self {
            Int32(i) => i as f64,
            Int64(i) => i as f64,
            NativeInt(i) => i as f64,
            NativeFloat(f) => f,
            v => return Err(OpError::invalid("conv.r8", &v)),
        };
        Ok(NativeFloat(v))
    }

    /// `conv.r.un`: integer bits reinterpreted as unsigned, then to float.
    pub fn unsigned_to_float(self) -> OpResult {
        use StackValue::*;
        let v = match self {
            Int32(i) => i as u32 as f64,
            Int64(i) => i as u64 as f64,
            NativeInt(i) => i as usize as f64,
            v => return Err(OpError::invalid("conv.r.un", &v)),
        };
        Ok(NativeFloat(v))
    }
}

fn convert_float_overflow(f: f64, target: ConversionType) -> OpResult {
    use StackValue::*;
    if !f.is_finite() {
        return Err(OpError::Throw(OVERFLOW));
    }
    let truncated = f.trunc();
    macro_rules! ranged {
        ($t:ty, $variant:ident, $vt:ty) => {{
            if truncated < <$t>::MIN as f64 || truncated > <$t>::MAX as f64 {
                return Err(OpError::Throw(OVERFLOW));
            }
            $variant(truncated as $t as $vt)
        }};
    }
    Ok(match target {
        ConversionType::Int8 => ranged!(i8, Int32, i32),
        ConversionType::UInt8 => ranged!(u8, Int32, i32),
        ConversionType::Int16 => ranged!(i16, Int32, i32),
        ConversionType::UInt16 => ranged!(u16, Int32, i32),
        ConversionType::Int32 => ranged!(i32, Int32, i32),
        ConversionType::UInt32 => ranged!(u32, Int32, i32),
        ConversionType::Int64 => ranged!(i64, Int64, i64),
        ConversionType::UInt64 => ranged!(u64, Int64, i64),
        ConversionType::IntPtr => ranged!(isize, NativeInt, isize),
        ConversionType::UIntPtr => ranged!(usize, NativeInt, isize),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StackValue::*;

    #[test]
    fn int32_addition_wraps() {
        let v = Int32(i32::MAX).add(Int32(1)).unwrap();
        assert_eq!(v, Int32(i32::MIN));
    }

    #[test]
    fn int32_plus_native_promotes() {
        let v = Int32(3).add(NativeInt(4)).unwrap();
        assert_eq!(v, NativeInt(7));
    }

    #[test]
    fn mixed_widths_are_rejected() {
        assert!(Int32(1).add(Int64(2)).is_err());
    }

    #[test]
    fn checked_add_overflow_is_managed() {
        match Int32(i32::MAX).checked_add(Int32(1), NumberSign::Signed) {
            Err(OpError::Throw(name)) => assert_eq!(name, OVERFLOW),
            other => panic!("expected overflow, got {:?}", other.map(|v| format!("{:?}", v))),
        }
    }

    #[test]
    fn unsigned_checked_add_uses_unsigned_range() {
        // 0x8000_0000 + 1 overflows signed but not unsigned
        let v = Int32(i32::MIN)
            .checked_add(Int32(1), NumberSign::Unsigned)
            .unwrap();
        assert_eq!(v, Int32(i32::MIN + 1));
    }

    #[test]
    fn division_by_zero_is_managed() {
        match Int32(42).div(Int32(0), NumberSign::Signed) {
            Err(OpError::Throw(name)) => assert_eq!(name, DIVIDE_BY_ZERO),
            _ => panic!("expected divide-by-zero"),
        }
    }

    #[test]
    fn min_over_minus_one_overflows() {
        match Int32(i32::MIN).div(Int32(-1), NumberSign::Signed) {
            Err(OpError::Throw(name)) => assert_eq!(name, OVERFLOW),
            _ => panic!("expected overflow"),
        }
    }

    #[test]
    fn unsigned_division_reinterprets() {
        let v = Int32(-2).div(Int32(2), NumberSign::Unsigned).unwrap();
        assert_eq!(v, Int32(0x7FFF_FFFF));
    }

    #[test]
    fn unsigned_comparison_reinterprets() {
        use std::cmp::Ordering;
        assert_eq!(
            Int32(-1).compare(&Int32(1), NumberSign::Unsigned),
            Some(Ordering::Greater)
        );
        assert_eq!(
            Int32(-1).compare(&Int32(1), NumberSign::Signed),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn conv_narrows_and_repromotes() {
        assert_eq!(Int32(0x1FF).convert(ConversionType::UInt8).unwrap(), Int32(0xFF));
        assert_eq!(Int32(300).convert(ConversionType::Int8).unwrap(), Int32(44));
        // sign extension survives the round trip
        assert_eq!(Int32(-1).convert(ConversionType::Int8).unwrap(), Int32(-1));
    }

    #[test]
    fn conv_u8_zero_extends_into_int64() {
        assert_eq!(
            Int32(-1).convert(ConversionType::UInt64).unwrap(),
            Int64(0xFFFF_FFFF)
        );
    }

    #[test]
    fn conv_ovf_detects_range() {
        assert!(matches!(
            Int32(300).convert_overflow(ConversionType::UInt8, NumberSign::Signed),
            Err(OpError::Throw(OVERFLOW))
        ));
        assert_eq!(
            Int32(255)
                .convert_overflow(ConversionType::UInt8, NumberSign::Signed)
                .unwrap(),
            Int32(255)
        );
        // -1 read as unsigned is in range for u32
        assert_eq!(
            Int32(-1)
                .convert_overflow(ConversionType::UInt32, NumberSign::Unsigned)
                .unwrap(),
            Int32(-1)
        );
    }

    #[test]
    fn float_to_int_truncates_toward_zero() {
        assert_eq!(NativeFloat(2.9).convert(ConversionType::Int32).unwrap(), Int32(2));
        assert_eq!(NativeFloat(-2.9).convert(ConversionType::Int32).unwrap(), Int32(-2));
    }

    #[test]
    fn float_conv_ovf_rejects_nan_and_range() {
        assert!(matches!(
            NativeFloat(f64::NAN).convert_overflow(ConversionType::Int32, NumberSign::Signed),
            Err(OpError::Throw(OVERFLOW))
        ));
        assert!(matches!(
            NativeFloat(1e10).convert_overflow(ConversionType::Int32, NumberSign::Signed),
            Err(OpError::Throw(OVERFLOW))
        ));
    }

    #[test]
    fn conv_r_un_reads_unsigned_bits() {
        assert_eq!(
            Int32(-1).unsigned_to_float().unwrap(),
            NativeFloat(u32::MAX as f64)
        );
    }
}
