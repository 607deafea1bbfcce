use crate::ir::{CompositeIndex, FuncIndex, ValType};

use super::Trap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ref(Reference),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    Null,
    Function(FuncIndex),
    /// An index into the interpreter heap.
    Object(usize),
    /// An opaque object owned by the host.
    Host(u32),
}

/// A heap allocated aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Struct {
        ty: CompositeIndex,
        fields: Vec<Value>,
    },
    Array {
        ty: CompositeIndex,
        elements: Vec<Value>,
    },
}

impl Value {
    /// Zero, or null for references.
    pub fn default_for(ty: &ValType) -> Self {
        match ty {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::F32 => Value::F32(0.0),
            ValType::F64 => Value::F64(0.0),
            ValType::Ref(_) => Value::Ref(Reference::Null),
        }
    }

    pub fn as_i32(self) -> Result<i32, Trap> {
        match self {
            Value::I32(value) => Ok(value),
            _ => Err(Trap::TypeMismatch),
        }
    }

    pub fn as_i64(self) -> Result<i64, Trap> {
        match self {
            Value::I64(value) => Ok(value),
            _ => Err(Trap::TypeMismatch),
        }
    }

    pub fn as_f32(self) -> Result<f32, Trap> {
        match self {
            Value::F32(value) => Ok(value),
            _ => Err(Trap::TypeMismatch),
        }
    }

    pub fn as_f64(self) -> Result<f64, Trap> {
        match self {
            Value::F64(value) => Ok(value),
            _ => Err(Trap::TypeMismatch),
        }
    }

    pub fn as_reference(self) -> Result<Reference, Trap> {
        match self {
            Value::Ref(reference) => Ok(reference),
            _ => Err(Trap::TypeMismatch),
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Value::I32(i32::from(value))
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::F32(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::F64(value)
    }
}
