use std::collections::HashMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::TransformError;
use crate::ir::{
    CompositeType, Expr, ExprKind, ExternConversionKind, FuncIndex, FunctionType, HeapType,
    IdGenerator, LocalIndex, Module, RefType, ValType,
};

/// Names of the runtime support functions and of the fiber type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeNames {
    pub fiber_type: String,
    pub current: String,
    pub is_resuming: String,
    pub is_suspending: String,
    pub push_int: String,
    pub push_long: String,
    pub push_float: String,
    pub push_double: String,
    pub push_object: String,
    pub push_function: String,
    pub pop_int: String,
    pub pop_long: String,
    pub pop_float: String,
    pub pop_double: String,
    pub pop_object: String,
    pub pop_function: String,
}

impl Default for RuntimeNames {
    fn default() -> Self {
        Self {
            fiber_type: "Fiber".to_string(),
            current: "fiber.current".to_string(),
            is_resuming: "fiber.isResuming".to_string(),
            is_suspending: "fiber.isSuspending".to_string(),
            push_int: "fiber.pushInt".to_string(),
            push_long: "fiber.pushLong".to_string(),
            push_float: "fiber.pushFloat".to_string(),
            push_double: "fiber.pushDouble".to_string(),
            push_object: "fiber.pushObject".to_string(),
            push_function: "fiber.pushFunction".to_string(),
            pop_int: "fiber.popInt".to_string(),
            pop_long: "fiber.popLong".to_string(),
            pop_float: "fiber.popFloat".to_string(),
            pop_double: "fiber.popDouble".to_string(),
            pop_object: "fiber.popObject".to_string(),
            pop_function: "fiber.popFunction".to_string(),
        }
    }
}

impl RuntimeNames {
    pub fn name(&self, routine: Routine) -> &str {
        match routine {
            Routine::Current => &self.current,
            Routine::IsResuming => &self.is_resuming,
            Routine::IsSuspending => &self.is_suspending,
            Routine::Push(category) => match category {
                ValueCategory::Int => &self.push_int,
                ValueCategory::Long => &self.push_long,
                ValueCategory::Float => &self.push_float,
                ValueCategory::Double => &self.push_double,
                ValueCategory::Object => &self.push_object,
                ValueCategory::Function => &self.push_function,
            },
            Routine::Pop(category) => match category {
                ValueCategory::Int => &self.pop_int,
                ValueCategory::Long => &self.pop_long,
                ValueCategory::Float => &self.pop_float,
                ValueCategory::Double => &self.pop_double,
                ValueCategory::Object => &self.pop_object,
                ValueCategory::Function => &self.pop_function,
            },
        }
    }

    /// The routine a function name stands for.
    pub fn routine(&self, name: &str) -> Option<Routine> {
        Routine::all()
            .into_iter()
            .find(|routine| self.name(*routine) == name)
    }
}

/// How a value is stored on the fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueCategory {
    Int,
    Long,
    Float,
    Double,
    Object,
    Function,
}

impl ValueCategory {
    pub const ALL: [ValueCategory; 6] = [
        ValueCategory::Int,
        ValueCategory::Long,
        ValueCategory::Float,
        ValueCategory::Double,
        ValueCategory::Object,
        ValueCategory::Function,
    ];

    pub fn of(ty: &ValType) -> Self {
        match ty {
            ValType::I32 => ValueCategory::Int,
            ValType::I64 => ValueCategory::Long,
            ValType::F32 => ValueCategory::Float,
            ValType::F64 => ValueCategory::Double,
            ValType::Ref(ty) if ty.heap.is_function() => ValueCategory::Function,
            ValType::Ref(_) => ValueCategory::Object,
        }
    }

    /// The type the push and pop routines of this category use.
    pub const fn carrier(self) -> ValType {
        match self {
            ValueCategory::Int => ValType::I32,
            ValueCategory::Long => ValType::I64,
            ValueCategory::Float => ValType::F32,
            ValueCategory::Double => ValType::F64,
            ValueCategory::Object => ValType::any_ref(),
            ValueCategory::Function => ValType::func_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Routine {
    Current,
    IsResuming,
    IsSuspending,
    Push(ValueCategory),
    Pop(ValueCategory),
}

impl Routine {
    pub fn all() -> Vec<Routine> {
        let mut routines = vec![Routine::Current, Routine::IsResuming, Routine::IsSuspending];
        routines.extend(ValueCategory::ALL.into_iter().map(Routine::Push));
        routines.extend(ValueCategory::ALL.into_iter().map(Routine::Pop));
        routines
    }
}

/// Resolves runtime support functions on first use and builds the calls that save and restore
/// values through the fiber.
#[derive(Debug, Clone)]
pub struct CoroutineFunctions {
    names: RuntimeNames,
    fiber_type: Option<ValType>,
    handles: HashMap<Routine, FuncIndex>,
}

impl CoroutineFunctions {
    pub fn new(names: RuntimeNames) -> Self {
        Self {
            names,
            fiber_type: None,
            handles: HashMap::new(),
        }
    }

    pub fn names(&self) -> &RuntimeNames {
        &self.names
    }

    /// The nullable reference type of the fiber object, declared as an empty struct when the
    /// module does not define it.
    pub fn fiber_type(&mut self, module: &mut Module) -> ValType {
        if let Some(ty) = &self.fiber_type {
            return ty.clone();
        }
        let heap = match module.find_composite(&self.names.fiber_type) {
            Some(idx) => match &module.composites[idx] {
                CompositeType::Struct { .. } => HeapType::Struct(idx),
                CompositeType::Array { .. } => HeapType::Array(idx),
            },
            None => {
                debug!("declaring fiber type {:?}", self.names.fiber_type);
                HeapType::Struct(module.add_composite(CompositeType::Struct {
                    name: self.names.fiber_type.clone(),
                    fields: Vec::new(),
                }))
            }
        };
        let ty = ValType::Ref(RefType::nullable(heap));
        self.fiber_type = Some(ty.clone());
        ty
    }

    fn expected_signature(&mut self, module: &mut Module, routine: Routine) -> FunctionType {
        let fiber = self.fiber_type(module);
        match routine {
            Routine::Current => FunctionType::new(vec![], vec![fiber]),
            Routine::IsResuming | Routine::IsSuspending => {
                FunctionType::new(vec![fiber], vec![ValType::I32])
            }
            Routine::Push(category) => FunctionType::new(vec![category.carrier(), fiber], vec![]),
            Routine::Pop(category) => FunctionType::new(vec![fiber], vec![category.carrier()]),
        }
    }

    /// Finds the routine by name, importing it when absent.
    pub fn resolve(
        &mut self,
        module: &mut Module,
        routine: Routine,
    ) -> Result<FuncIndex, TransformError> {
        if let Some(handle) = self.handles.get(&routine) {
            return Ok(*handle);
        }
        let expected = self.expected_signature(module, routine);
        let name = self.names.name(routine).to_string();
        let handle = match module.find_function(&name) {
            Some(existing) => {
                let found = module.function_type(existing);
                if found != &expected {
                    return Err(TransformError::RuntimeSignatureMismatch {
                        name,
                        expected: format_signature(&expected),
                        found: format_signature(found),
                    });
                }
                existing
            }
            None => {
                debug!("importing runtime function {name:?}");
                let signature = module.intern_signature(expected.params, expected.results);
                module.import_function(&name, signature)
            }
        };
        self.handles.insert(routine, handle);
        Ok(handle)
    }

    pub fn current(
        &mut self,
        module: &mut Module,
        ids: &mut IdGenerator,
    ) -> Result<Expr, TransformError> {
        let function = self.resolve(module, Routine::Current)?;
        Ok(ids.call(function, vec![]))
    }

    pub fn is_resuming(
        &mut self,
        module: &mut Module,
        ids: &mut IdGenerator,
        fiber: LocalIndex,
    ) -> Result<Expr, TransformError> {
        let function = self.resolve(module, Routine::IsResuming)?;
        let fiber = ids.get_local(fiber);
        Ok(ids.call(function, vec![fiber]))
    }

    pub fn is_suspending(
        &mut self,
        module: &mut Module,
        ids: &mut IdGenerator,
        fiber: LocalIndex,
    ) -> Result<Expr, TransformError> {
        let function = self.resolve(module, Routine::IsSuspending)?;
        let fiber = ids.get_local(fiber);
        Ok(ids.call(function, vec![fiber]))
    }

    /// A call that pushes `value`, of type `ty`, onto the fiber.
    pub fn save_value(
        &mut self,
        module: &mut Module,
        ids: &mut IdGenerator,
        ty: &ValType,
        fiber: LocalIndex,
        value: Expr,
    ) -> Result<Expr, TransformError> {
        let category = ValueCategory::of(ty);
        let function = self.resolve(module, Routine::Push(category))?;
        let value = match ty {
            ValType::Ref(RefType {
                heap: HeapType::Extern,
                ..
            }) => ids.expr(ExprKind::ExternConversion {
                kind: ExternConversionKind::ExternToAny,
                value: Box::new(value),
            }),
            _ => value,
        };
        let fiber = ids.get_local(fiber);
        Ok(ids.call(function, vec![value, fiber]))
    }

    /// An expression that pops a value of type `ty` from the fiber.
    pub fn restore_value(
        &mut self,
        module: &mut Module,
        ids: &mut IdGenerator,
        ty: &ValType,
        fiber: LocalIndex,
    ) -> Result<Expr, TransformError> {
        let category = ValueCategory::of(ty);
        let function = self.resolve(module, Routine::Pop(category))?;
        let fiber = ids.get_local(fiber);
        let mut value = ids.call(function, vec![fiber]);
        let mut current = category.carrier();
        if let ValType::Ref(RefType {
            heap: HeapType::Extern,
            ..
        }) = ty
        {
            value = ids.expr(ExprKind::ExternConversion {
                kind: ExternConversionKind::AnyToExtern,
                value: Box::new(value),
            });
            current = ValType::extern_ref();
        }
        match ty {
            ValType::Ref(target) if &current != ty => Ok(ids.expr(ExprKind::Cast {
                value: Box::new(value),
                target: *target,
            })),
            _ => Ok(value),
        }
    }
}

fn format_signature(ty: &FunctionType) -> String {
    format!(
        "[{}] -> [{}]",
        ty.params.iter().join(" "),
        ty.results.iter().join(" ")
    )
}
