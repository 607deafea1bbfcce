use std::fmt;

use itertools::Itertools;

use super::{CompositeIndex, SigIndex};

/// A value type, as it can live in a local, on the operand stack or in a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    Ref(RefType),
}

impl ValType {
    pub const fn is_number(&self) -> bool {
        !matches!(self, ValType::Ref(_))
    }

    pub fn as_ref_type(&self) -> Option<&RefType> {
        match self {
            ValType::Ref(ty) => Some(ty),
            _ => None,
        }
    }

    /// Nullable `anyref`.
    pub const fn any_ref() -> Self {
        ValType::Ref(RefType::nullable(HeapType::Any))
    }

    /// Nullable `funcref`.
    pub const fn func_ref() -> Self {
        ValType::Ref(RefType::nullable(HeapType::Func))
    }

    /// Nullable `externref`.
    pub const fn extern_ref() -> Self {
        ValType::Ref(RefType::nullable(HeapType::Extern))
    }

    /// Whether a value of type `self` can be used where `expected` is required.
    pub fn is_subtype_of(&self, expected: &ValType) -> bool {
        match (self, expected) {
            (ValType::Ref(actual), ValType::Ref(expected)) => actual.is_subtype_of(expected),
            (actual, expected) => actual == expected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefType {
    pub nullable: bool,
    pub heap: HeapType,
}

impl RefType {
    pub const fn nullable(heap: HeapType) -> Self {
        Self {
            nullable: true,
            heap,
        }
    }

    pub const fn non_null(heap: HeapType) -> Self {
        Self {
            nullable: false,
            heap,
        }
    }

    pub fn is_subtype_of(&self, expected: &RefType) -> bool {
        if self.nullable && !expected.nullable {
            return false;
        }
        self.heap.is_subtype_of(&expected.heap)
    }
}

/// The referenced heap type. Three disjoint hierarchies: `any`, `func` and `extern`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    Any,
    Eq,
    Struct(CompositeIndex),
    Array(CompositeIndex),
    Func,
    Signature(SigIndex),
    Extern,
}

impl HeapType {
    pub fn is_subtype_of(&self, expected: &HeapType) -> bool {
        if self == expected {
            return true;
        }
        match expected {
            HeapType::Any => matches!(
                self,
                HeapType::Eq | HeapType::Struct(_) | HeapType::Array(_)
            ),
            HeapType::Eq => matches!(self, HeapType::Struct(_) | HeapType::Array(_)),
            HeapType::Func => matches!(self, HeapType::Signature(_)),
            _ => false,
        }
    }

    /// The root of the hierarchy this type belongs to.
    pub const fn top(&self) -> HeapType {
        match self {
            HeapType::Any | HeapType::Eq | HeapType::Struct(_) | HeapType::Array(_) => HeapType::Any,
            HeapType::Func | HeapType::Signature(_) => HeapType::Func,
            HeapType::Extern => HeapType::Extern,
        }
    }

    /// Whether values of this heap type are callable references.
    pub const fn is_function(&self) -> bool {
        matches!(self, HeapType::Func | HeapType::Signature(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FunctionType {
    pub fn new(params: Vec<ValType>, results: Vec<ValType>) -> Self {
        Self { params, results }
    }
}

/// The signature of a structured construct.
///
/// Source blocks only declare results; parameters appear on suspend checks and on blocks
/// that carry values across branches after type propagation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BlockType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl BlockType {
    pub const fn empty() -> Self {
        Self {
            params: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn results(results: Vec<ValType>) -> Self {
        Self {
            params: Vec::new(),
            results,
        }
    }

    pub fn single(result: ValType) -> Self {
        Self::results(vec![result])
    }

    /// Same types in and out.
    pub fn passthrough(types: Vec<ValType>) -> Self {
        Self {
            params: types.clone(),
            results: types,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: Option<String>,
    pub ty: ValType,
    pub mutable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CompositeType {
    Struct { name: String, fields: Vec<Field> },
    Array { name: String, element: Field },
}

impl CompositeType {
    pub fn name(&self) -> &str {
        match self {
            CompositeType::Struct { name, .. } | CompositeType::Array { name, .. } => name,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::I64 => write!(f, "i64"),
            ValType::F32 => write!(f, "f32"),
            ValType::F64 => write!(f, "f64"),
            ValType::Ref(ty) => write!(f, "{ty}"),
        }
    }
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let null = if self.nullable { "null " } else { "" };
        write!(f, "(ref {null}{})", self.heap)
    }
}

impl fmt::Display for HeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapType::Any => write!(f, "any"),
            HeapType::Eq => write!(f, "eq"),
            HeapType::Struct(idx) => write!(f, "$struct{}", idx.to_idx()),
            HeapType::Array(idx) => write!(f, "$array{}", idx.to_idx()),
            HeapType::Func => write!(f, "func"),
            HeapType::Signature(idx) => write!(f, "$sig{}", idx.to_idx()),
            HeapType::Extern => write!(f, "extern"),
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.params.is_empty() {
            write!(f, "(param {})", self.params.iter().join(" "))?;
            if !self.results.is_empty() {
                write!(f, " ")?;
            }
        }
        if !self.results.is_empty() {
            write!(f, "(result {})", self.results.iter().join(" "))?;
        }
        Ok(())
    }
}
