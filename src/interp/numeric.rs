//! Wasm numeric semantics: wrapping arithmetic, trapping division, masked shifts.

use super::{Trap, Value};
use crate::ir::{FloatBinaryOp, FloatUnaryOp, IntBinaryOp, IntUnaryOp, NumType};

macro_rules! int_ops {
    ($unary:ident, $binary:ident, $int:ty, $uint:ty, $variant:ident) => {
        pub fn $unary(op: IntUnaryOp, value: $int) -> Value {
            match op {
                IntUnaryOp::Eqz => Value::from_bool(value == 0),
                IntUnaryOp::Clz => Value::$variant(value.leading_zeros() as $int),
                IntUnaryOp::Ctz => Value::$variant(value.trailing_zeros() as $int),
                IntUnaryOp::Popcnt => Value::$variant(value.count_ones() as $int),
            }
        }

        pub fn $binary(op: IntBinaryOp, first: $int, second: $int) -> Result<Value, Trap> {
            let (ufirst, usecond) = (first as $uint, second as $uint);
            let shift = (second as u32) % <$int>::BITS;
            let value = match op {
                IntBinaryOp::Add => first.wrapping_add(second),
                IntBinaryOp::Sub => first.wrapping_sub(second),
                IntBinaryOp::Mul => first.wrapping_mul(second),
                IntBinaryOp::DivSigned => {
                    if second == 0 {
                        return Err(Trap::DivisionByZero);
                    }
                    first.checked_div(second).ok_or(Trap::IntegerOverflow)?
                }
                IntBinaryOp::DivUnsigned => {
                    ufirst.checked_div(usecond).ok_or(Trap::DivisionByZero)? as $int
                }
                IntBinaryOp::RemSigned => {
                    if second == 0 {
                        return Err(Trap::DivisionByZero);
                    }
                    first.wrapping_rem(second)
                }
                IntBinaryOp::RemUnsigned => {
                    ufirst.checked_rem(usecond).ok_or(Trap::DivisionByZero)? as $int
                }
                IntBinaryOp::And => first & second,
                IntBinaryOp::Or => first | second,
                IntBinaryOp::Xor => first ^ second,
                IntBinaryOp::Shl => first.wrapping_shl(shift),
                IntBinaryOp::ShrSigned => first.wrapping_shr(shift),
                IntBinaryOp::ShrUnsigned => ufirst.wrapping_shr(shift) as $int,
                IntBinaryOp::Eq => return Ok(Value::from_bool(first == second)),
                IntBinaryOp::Ne => return Ok(Value::from_bool(first != second)),
                IntBinaryOp::LtSigned => return Ok(Value::from_bool(first < second)),
                IntBinaryOp::LtUnsigned => return Ok(Value::from_bool(ufirst < usecond)),
                IntBinaryOp::GtSigned => return Ok(Value::from_bool(first > second)),
                IntBinaryOp::GtUnsigned => return Ok(Value::from_bool(ufirst > usecond)),
                IntBinaryOp::LeSigned => return Ok(Value::from_bool(first <= second)),
                IntBinaryOp::LeUnsigned => return Ok(Value::from_bool(ufirst <= usecond)),
                IntBinaryOp::GeSigned => return Ok(Value::from_bool(first >= second)),
                IntBinaryOp::GeUnsigned => return Ok(Value::from_bool(ufirst >= usecond)),
            };
            Ok(Value::$variant(value))
        }
    };
}

int_ops!(i32_unary, i32_binary, i32, u32, I32);
int_ops!(i64_unary, i64_binary, i64, u64, I64);

macro_rules! float_ops {
    ($unary:ident, $binary:ident, $float:ty, $variant:ident) => {
        pub fn $unary(op: FloatUnaryOp, value: $float) -> Value {
            Value::$variant(match op {
                FloatUnaryOp::Neg => -value,
                FloatUnaryOp::Abs => value.abs(),
                FloatUnaryOp::Sqrt => value.sqrt(),
                FloatUnaryOp::Ceil => value.ceil(),
                FloatUnaryOp::Floor => value.floor(),
                FloatUnaryOp::Trunc => value.trunc(),
            })
        }

        pub fn $binary(op: FloatBinaryOp, first: $float, second: $float) -> Value {
            match op {
                FloatBinaryOp::Add => Value::$variant(first + second),
                FloatBinaryOp::Sub => Value::$variant(first - second),
                FloatBinaryOp::Mul => Value::$variant(first * second),
                FloatBinaryOp::Div => Value::$variant(first / second),
                FloatBinaryOp::Min => Value::$variant(first.min(second)),
                FloatBinaryOp::Max => Value::$variant(first.max(second)),
                FloatBinaryOp::Eq => Value::from_bool(first == second),
                FloatBinaryOp::Ne => Value::from_bool(first != second),
                FloatBinaryOp::Lt => Value::from_bool(first < second),
                FloatBinaryOp::Gt => Value::from_bool(first > second),
                FloatBinaryOp::Le => Value::from_bool(first <= second),
                FloatBinaryOp::Ge => Value::from_bool(first >= second),
            }
        }
    };
}

float_ops!(f32_unary, f32_binary, f32, F32);
float_ops!(f64_unary, f64_binary, f64, F64);

/// Converts between numeric types. Float to integer truncation traps when out of range.
pub fn convert(value: Value, to: NumType, signed: bool) -> Result<Value, Trap> {
    let converted = match (value, to) {
        (Value::I32(v), NumType::I32) => Value::I32(v),
        (Value::I32(v), NumType::I64) if signed => Value::I64(i64::from(v)),
        (Value::I32(v), NumType::I64) => Value::I64(i64::from(v as u32)),
        (Value::I32(v), NumType::F32) if signed => Value::F32(v as f32),
        (Value::I32(v), NumType::F32) => Value::F32(v as u32 as f32),
        (Value::I32(v), NumType::F64) if signed => Value::F64(f64::from(v)),
        (Value::I32(v), NumType::F64) => Value::F64(f64::from(v as u32)),
        (Value::I64(v), NumType::I32) => Value::I32(v as i32),
        (Value::I64(v), NumType::I64) => Value::I64(v),
        (Value::I64(v), NumType::F32) if signed => Value::F32(v as f32),
        (Value::I64(v), NumType::F32) => Value::F32(v as u64 as f32),
        (Value::I64(v), NumType::F64) if signed => Value::F64(v as f64),
        (Value::I64(v), NumType::F64) => Value::F64(v as u64 as f64),
        (Value::F32(v), NumType::F32) => Value::F32(v),
        (Value::F32(v), NumType::F64) => Value::F64(f64::from(v)),
        (Value::F32(v), int) => truncate(f64::from(v), int, signed)?,
        (Value::F64(v), NumType::F32) => Value::F32(v as f32),
        (Value::F64(v), NumType::F64) => Value::F64(v),
        (Value::F64(v), int) => truncate(v, int, signed)?,
        (Value::Ref(_), _) => return Err(Trap::TypeMismatch),
    };
    Ok(converted)
}

fn truncate(value: f64, to: NumType, signed: bool) -> Result<Value, Trap> {
    if value.is_nan() {
        return Err(Trap::IntegerOverflow);
    }
    let value = value.trunc();
    let (min, max) = match (to, signed) {
        (NumType::I32, true) => (f64::from(i32::MIN), f64::from(i32::MAX)),
        (NumType::I32, false) => (0.0, f64::from(u32::MAX)),
        (NumType::I64, true) => (i64::MIN as f64, i64::MAX as f64),
        (NumType::I64, false) => (0.0, u64::MAX as f64),
        _ => return Err(Trap::TypeMismatch),
    };
    if value < min || value > max {
        return Err(Trap::IntegerOverflow);
    }
    Ok(match (to, signed) {
        (NumType::I32, true) => Value::I32(value as i32),
        (NumType::I32, false) => Value::I32(value as u32 as i32),
        (NumType::I64, true) => Value::I64(value as i64),
        _ => Value::I64(value as u64 as i64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_division_traps() {
        assert_eq!(
            i32_binary(IntBinaryOp::DivSigned, 1, 0),
            Err(Trap::DivisionByZero)
        );
        assert_eq!(
            i32_binary(IntBinaryOp::DivSigned, i32::MIN, -1),
            Err(Trap::IntegerOverflow)
        );
        assert_eq!(
            i32_binary(IntBinaryOp::RemSigned, i32::MIN, -1),
            Ok(Value::I32(0))
        );
    }

    #[test]
    fn comparisons_are_i32() {
        assert_eq!(
            i64_binary(IntBinaryOp::LtUnsigned, -1, 1),
            Ok(Value::I32(0))
        );
        assert_eq!(f64_binary(FloatBinaryOp::Le, 1.0, 1.0), Value::I32(1));
    }

    #[test]
    fn shifts_are_masked() {
        assert_eq!(i32_binary(IntBinaryOp::Shl, 1, 33), Ok(Value::I32(2)));
    }

    #[test]
    fn truncation_checks_range() {
        assert_eq!(
            convert(Value::F64(1e20), NumType::I32, true),
            Err(Trap::IntegerOverflow)
        );
        assert_eq!(
            convert(Value::F32(-3.7), NumType::I64, true),
            Ok(Value::I64(-3))
        );
        assert_eq!(
            convert(Value::I32(-1), NumType::I64, false),
            Ok(Value::I64(u32::MAX as i64))
        );
    }
}
