//! A reference interpreter for IR modules.
//!
//! Executes bodies exactly as the structured operand-stack semantics describe them: one operand
//! stack per activation, `Pop` names a value already on it, branches carry as many values as
//! their target expects. Imported functions are dispatched to a [`Host`].

use std::collections::HashMap;

use thiserror::Error;
use tracing::trace;

use crate::ir::{
    Block, BlockId, Conditional, Expr, ExprKind, FloatType, FuncIndex, GlobalIndex, HeapType,
    IntType, Module, RefType, TagIndex, Try,
};

mod fiber;
mod numeric;
mod value;

pub use fiber::{Fiber, FiberHost, HostFunction, suspending};
pub use value::{Object, Reference, Value};

const MAX_CALL_DEPTH: usize = 512;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Trap {
    #[error("unreachable executed")]
    Unreachable,
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("value has the wrong type")]
    TypeMismatch,
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("null reference")]
    NullReference,
    #[error("cast failed")]
    CastFailure,
    #[error("index out of bounds")]
    OutOfBounds,
    #[error("table index out of bounds")]
    TableOutOfBounds,
    #[error("indirect call signature mismatch")]
    SignatureMismatch,
    #[error("uncaught exception with tag {0:?}")]
    UncaughtException(TagIndex),
    #[error("unknown import {0:?}")]
    UnknownImport(String),
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    #[error("branch to label {0:?} outside of the function")]
    UnknownLabel(BlockId),
    #[error("call stack exhausted")]
    CallStackExhausted,
    #[error("host error: {0}")]
    Host(String),
}

/// Functions the interpreter calls for imports.
pub trait Host {
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, Trap>;
}

/// How evaluation of a node ended.
#[derive(Debug, Clone, PartialEq)]
enum Flow {
    Continue,
    Break(BlockId),
    Return,
    Throw { tag: TagIndex, payload: Vec<Value> },
}

/// Result of a call: values or an exception that escaped the callee.
enum Outcome {
    Returned(Vec<Value>),
    Threw { tag: TagIndex, payload: Vec<Value> },
}

#[derive(Debug, Default)]
struct Activation {
    locals: Vec<Value>,
    stack: Vec<Value>,
}

impl Activation {
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, Trap> {
        self.stack.pop().ok_or(Trap::StackUnderflow)
    }

    fn pop_n(&mut self, count: usize) -> Result<Vec<Value>, Trap> {
        let start = self
            .stack
            .len()
            .checked_sub(count)
            .ok_or(Trap::StackUnderflow)?;
        Ok(self.stack.split_off(start))
    }

    /// Height of a frame entered with `params` values on the stack.
    fn height(&self, params: usize) -> Result<usize, Trap> {
        self.stack.len().checked_sub(params).ok_or(Trap::StackUnderflow)
    }

    /// Drops everything above `height` except the top `arity` values.
    fn unwind(&mut self, height: usize, arity: usize) -> Result<(), Trap> {
        let carried = self.pop_n(arity)?;
        if self.stack.len() < height {
            return Err(Trap::StackUnderflow);
        }
        self.stack.truncate(height);
        self.stack.extend(carried);
        Ok(())
    }
}

pub struct Interpreter<'m, H: Host> {
    module: &'m Module,
    host: H,
    heap: Vec<Object>,
    globals: HashMap<GlobalIndex, Value>,
}

impl<'m, H: Host> Interpreter<'m, H> {
    pub fn new(module: &'m Module, host: H) -> Self {
        let globals = module
            .globals
            .iter()
            .map(|(idx, global)| (idx, Value::default_for(&global.ty)))
            .collect();
        Self {
            module,
            host,
            heap: Vec::new(),
            globals,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn into_host(self) -> H {
        self.host
    }

    pub fn object(&self, reference: Reference) -> Option<&Object> {
        match reference {
            Reference::Object(index) => self.heap.get(index),
            _ => None,
        }
    }

    pub fn invoke_by_name(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, Trap> {
        let function = self
            .module
            .find_function(name)
            .ok_or_else(|| Trap::UnknownFunction(name.to_string()))?;
        self.invoke(function, args)
    }

    pub fn invoke(&mut self, function: FuncIndex, args: &[Value]) -> Result<Vec<Value>, Trap> {
        match self.call(function, args.to_vec(), 0)? {
            Outcome::Returned(values) => Ok(values),
            Outcome::Threw { tag, .. } => Err(Trap::UncaughtException(tag)),
        }
    }

    fn call(
        &mut self,
        function: FuncIndex,
        args: Vec<Value>,
        depth: usize,
    ) -> Result<Outcome, Trap> {
        if depth >= MAX_CALL_DEPTH {
            return Err(Trap::CallStackExhausted);
        }
        let module = self.module;
        let callee = module
            .functions
            .get(function)
            .ok_or_else(|| Trap::UnknownFunction(format!("{function:?}")))?;
        let Some(body) = &callee.body else {
            trace!(name = %callee.name, "host call");
            return self.host.call(&callee.name, &args).map(Outcome::Returned);
        };
        let results = module.signature(callee.signature).results.len();

        let mut locals = args;
        locals.extend(
            body.locals
                .iter()
                .skip(locals.len())
                .map(|local| Value::default_for(&local.ty)),
        );
        let mut activation = Activation {
            locals,
            stack: Vec::new(),
        };
        match self.eval_list(&mut activation, &body.exprs, depth)? {
            Flow::Continue | Flow::Return => {
                Ok(Outcome::Returned(activation.pop_n(results)?))
            }
            Flow::Break(label) => Err(Trap::UnknownLabel(label)),
            Flow::Throw { tag, payload } => Ok(Outcome::Threw { tag, payload }),
        }
    }

    fn eval_list(
        &mut self,
        act: &mut Activation,
        body: &[Expr],
        depth: usize,
    ) -> Result<Flow, Trap> {
        for expr in body {
            let flow = self.eval(act, expr, depth)?;
            if flow != Flow::Continue {
                return Ok(flow);
            }
        }
        Ok(Flow::Continue)
    }

    fn eval(&mut self, act: &mut Activation, expr: &Expr, depth: usize) -> Result<Flow, Trap> {
        match &expr.kind {
            ExprKind::Block(block) => return self.eval_block(act, block, depth),
            ExprKind::Try(try_expr) => return self.eval_try(act, try_expr, depth),
            _ => {}
        }
        for operand in expr.kind.operands() {
            let flow = self.eval(act, operand, depth)?;
            if flow != Flow::Continue {
                return Ok(flow);
            }
        }

        match &expr.kind {
            ExprKind::Block(_) | ExprKind::Try(_) | ExprKind::Pop(_) => {}
            ExprKind::Conditional(conditional) => {
                return self.eval_conditional(act, conditional, depth);
            }
            ExprKind::Branch { target, .. } => {
                if act.pop()?.as_i32()? != 0 {
                    return Ok(Flow::Break(*target));
                }
            }
            ExprKind::Break { target, .. } => return Ok(Flow::Break(*target)),
            ExprKind::Switch {
                targets, default, ..
            } => {
                let selector = act.pop()?.as_i32()?;
                let target = usize::try_from(selector)
                    .ok()
                    .and_then(|index| targets.get(index))
                    .unwrap_or(default);
                return Ok(Flow::Break(*target));
            }
            ExprKind::Return { .. } => return Ok(Flow::Return),
            ExprKind::Unreachable => return Err(Trap::Unreachable),
            ExprKind::Throw { tag, .. } => {
                let count = self
                    .module
                    .tags
                    .get(*tag)
                    .map(|tag| tag.params.len())
                    .unwrap_or_default();
                let payload = act.pop_n(count)?;
                return Ok(Flow::Throw { tag: *tag, payload });
            }
            ExprKind::I32Const(value) => act.push(Value::I32(*value)),
            ExprKind::I64Const(value) => act.push(Value::I64(*value)),
            ExprKind::F32Const(value) => act.push(Value::F32(*value)),
            ExprKind::F64Const(value) => act.push(Value::F64(*value)),
            ExprKind::Null(_) => act.push(Value::Ref(Reference::Null)),
            ExprKind::GetLocal(local) => {
                let value = *act.locals.get(*local).ok_or(Trap::OutOfBounds)?;
                act.push(value);
            }
            ExprKind::SetLocal { local, .. } => {
                let value = act.pop()?;
                *act.locals.get_mut(*local).ok_or(Trap::OutOfBounds)? = value;
            }
            ExprKind::GetGlobal(global) => {
                let value = *self.globals.get(global).ok_or(Trap::OutOfBounds)?;
                act.push(value);
            }
            ExprKind::SetGlobal { global, .. } => {
                let value = act.pop()?;
                self.globals.insert(*global, value);
            }
            ExprKind::IntUnary { ty, op, .. } => {
                let value = act.pop()?;
                act.push(match ty {
                    IntType::I32 => numeric::i32_unary(*op, value.as_i32()?),
                    IntType::I64 => numeric::i64_unary(*op, value.as_i64()?),
                });
            }
            ExprKind::IntBinary { ty, op, .. } => {
                let second = act.pop()?;
                let first = act.pop()?;
                act.push(match ty {
                    IntType::I32 => numeric::i32_binary(*op, first.as_i32()?, second.as_i32()?)?,
                    IntType::I64 => numeric::i64_binary(*op, first.as_i64()?, second.as_i64()?)?,
                });
            }
            ExprKind::FloatUnary { ty, op, .. } => {
                let value = act.pop()?;
                act.push(match ty {
                    FloatType::F32 => numeric::f32_unary(*op, value.as_f32()?),
                    FloatType::F64 => numeric::f64_unary(*op, value.as_f64()?),
                });
            }
            ExprKind::FloatBinary { ty, op, .. } => {
                let second = act.pop()?;
                let first = act.pop()?;
                act.push(match ty {
                    FloatType::F32 => numeric::f32_binary(*op, first.as_f32()?, second.as_f32()?),
                    FloatType::F64 => numeric::f64_binary(*op, first.as_f64()?, second.as_f64()?),
                });
            }
            ExprKind::Conversion { to, signed, .. } => {
                let value = act.pop()?;
                act.push(numeric::convert(value, *to, *signed)?);
            }
            ExprKind::Drop(_) => {
                act.pop()?;
            }
            ExprKind::Call { function, .. } => {
                let params = self.module.function_type(*function).params.len();
                let args = act.pop_n(params)?;
                return self.call_and_push(act, *function, args, depth);
            }
            ExprKind::IndirectCall { signature, .. } => {
                let selector = act.pop()?.as_i32()?;
                let function = usize::try_from(selector)
                    .ok()
                    .and_then(|index| self.module.table.get(index))
                    .copied()
                    .ok_or(Trap::TableOutOfBounds)?;
                if self.module.function(function).signature != *signature {
                    return Err(Trap::SignatureMismatch);
                }
                let args = act.pop_n(self.module.signature(*signature).params.len())?;
                return self.call_and_push(act, function, args, depth);
            }
            ExprKind::CallReference { signature, .. } => {
                let function = match act.pop()?.as_reference()? {
                    Reference::Function(function) => function,
                    Reference::Null => return Err(Trap::NullReference),
                    _ => return Err(Trap::TypeMismatch),
                };
                if self.module.function(function).signature != *signature {
                    return Err(Trap::SignatureMismatch);
                }
                let args = act.pop_n(self.module.signature(*signature).params.len())?;
                return self.call_and_push(act, function, args, depth);
            }
            ExprKind::FunctionReference(function) => {
                act.push(Value::Ref(Reference::Function(*function)));
            }
            ExprKind::IsNull(_) => {
                let reference = act.pop()?.as_reference()?;
                act.push(Value::from_bool(reference == Reference::Null));
            }
            ExprKind::ReferencesEqual { .. } => {
                let second = act.pop()?.as_reference()?;
                let first = act.pop()?.as_reference()?;
                act.push(Value::from_bool(first == second));
            }
            ExprKind::Cast { target, .. } => {
                let reference = act.pop()?.as_reference()?;
                if !self.matches(reference, target) {
                    return Err(Trap::CastFailure);
                }
                act.push(Value::Ref(reference));
            }
            ExprKind::Test { target, .. } => {
                let reference = act.pop()?.as_reference()?;
                act.push(Value::from_bool(self.matches(reference, target)));
            }
            ExprKind::ExternConversion { .. } => {
                let value = act.pop()?;
                act.push(value);
            }
            ExprKind::StructNew { ty, fields } => {
                let fields = act.pop_n(fields.len())?;
                let reference = self.allocate(Object::Struct { ty: *ty, fields });
                act.push(reference);
            }
            ExprKind::StructGet { field, .. } => {
                let reference = act.pop()?.as_reference()?;
                let value = match self.object_mut(reference)? {
                    Object::Struct { fields, .. } => {
                        *fields.get(*field).ok_or(Trap::OutOfBounds)?
                    }
                    Object::Array { .. } => return Err(Trap::TypeMismatch),
                };
                act.push(value);
            }
            ExprKind::StructSet { field, .. } => {
                let value = act.pop()?;
                let reference = act.pop()?.as_reference()?;
                match self.object_mut(reference)? {
                    Object::Struct { fields, .. } => {
                        *fields.get_mut(*field).ok_or(Trap::OutOfBounds)? = value;
                    }
                    Object::Array { .. } => return Err(Trap::TypeMismatch),
                }
            }
            ExprKind::ArrayNewFixed { ty, elements } => {
                let elements = act.pop_n(elements.len())?;
                let reference = self.allocate(Object::Array { ty: *ty, elements });
                act.push(reference);
            }
            ExprKind::ArrayGet { .. } => {
                let index = act.pop()?.as_i32()?;
                let reference = act.pop()?.as_reference()?;
                let elements = self.elements(reference)?;
                let value = usize::try_from(index)
                    .ok()
                    .and_then(|index| elements.get(index))
                    .copied()
                    .ok_or(Trap::OutOfBounds)?;
                act.push(value);
            }
            ExprKind::ArraySet { .. } => {
                let value = act.pop()?;
                let index = act.pop()?.as_i32()?;
                let reference = act.pop()?.as_reference()?;
                let elements = self.elements(reference)?;
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|index| elements.get_mut(index))
                    .ok_or(Trap::OutOfBounds)?;
                *slot = value;
            }
            ExprKind::ArrayLength(_) => {
                let reference = act.pop()?.as_reference()?;
                let length = self.elements(reference)?.len();
                let length = i32::try_from(length).map_err(|_| Trap::IntegerOverflow)?;
                act.push(Value::I32(length));
            }
        }
        Ok(Flow::Continue)
    }

    fn call_and_push(
        &mut self,
        act: &mut Activation,
        function: FuncIndex,
        args: Vec<Value>,
        depth: usize,
    ) -> Result<Flow, Trap> {
        match self.call(function, args, depth + 1)? {
            Outcome::Returned(values) => {
                act.stack.extend(values);
                Ok(Flow::Continue)
            }
            Outcome::Threw { tag, payload } => Ok(Flow::Throw { tag, payload }),
        }
    }

    fn eval_block(
        &mut self,
        act: &mut Activation,
        block: &Block,
        depth: usize,
    ) -> Result<Flow, Trap> {
        let height = act.height(block.ty.params.len())?;
        loop {
            match self.eval_list(act, &block.body, depth)? {
                Flow::Break(label) if label == block.label => {
                    if block.is_loop {
                        act.unwind(height, block.ty.params.len())?;
                        continue;
                    }
                    act.unwind(height, block.ty.results.len())?;
                    return Ok(Flow::Continue);
                }
                flow => return Ok(flow),
            }
        }
    }

    fn eval_conditional(
        &mut self,
        act: &mut Activation,
        conditional: &Conditional,
        depth: usize,
    ) -> Result<Flow, Trap> {
        let condition = act.pop()?.as_i32()?;
        let height = act.height(conditional.ty.params.len())?;
        let arm = if condition != 0 {
            &conditional.then_body
        } else {
            &conditional.else_body
        };
        let arity = conditional.ty.results.len();
        self.finish_structured(act, arm, conditional.label, height, arity, depth)
    }

    fn eval_try(
        &mut self,
        act: &mut Activation,
        try_expr: &Try,
        depth: usize,
    ) -> Result<Flow, Trap> {
        let height = act.height(try_expr.ty.params.len())?;
        let results = try_expr.ty.results.len();
        let label = try_expr.label;
        match self.finish_structured(act, &try_expr.body, label, height, results, depth)? {
            Flow::Throw { tag, payload } => {
                let Some(catch) = try_expr.catches.iter().find(|catch| catch.tag == tag) else {
                    return Ok(Flow::Throw { tag, payload });
                };
                if act.stack.len() < height {
                    return Err(Trap::StackUnderflow);
                }
                act.stack.truncate(height);
                act.stack.extend(payload);
                self.finish_structured(act, &catch.body, try_expr.label, height, results, depth)
            }
            flow => Ok(flow),
        }
    }

    /// Runs a non-loop body whose label ends it with `arity` carried values.
    fn finish_structured(
        &mut self,
        act: &mut Activation,
        body: &[Expr],
        label: BlockId,
        height: usize,
        arity: usize,
        depth: usize,
    ) -> Result<Flow, Trap> {
        match self.eval_list(act, body, depth)? {
            Flow::Break(target) if target == label => {
                act.unwind(height, arity)?;
                Ok(Flow::Continue)
            }
            flow => Ok(flow),
        }
    }

    fn allocate(&mut self, object: Object) -> Value {
        self.heap.push(object);
        Value::Ref(Reference::Object(self.heap.len() - 1))
    }

    fn object_mut(&mut self, reference: Reference) -> Result<&mut Object, Trap> {
        match reference {
            Reference::Object(index) => self.heap.get_mut(index).ok_or(Trap::OutOfBounds),
            Reference::Null => Err(Trap::NullReference),
            _ => Err(Trap::TypeMismatch),
        }
    }

    fn elements(&mut self, reference: Reference) -> Result<&mut Vec<Value>, Trap> {
        match self.object_mut(reference)? {
            Object::Array { elements, .. } => Ok(elements),
            Object::Struct { .. } => Err(Trap::TypeMismatch),
        }
    }

    /// Whether `reference` is a value of `target`.
    fn matches(&self, reference: Reference, target: &RefType) -> bool {
        match reference {
            Reference::Null => target.nullable,
            Reference::Function(function) => match target.heap {
                HeapType::Func => true,
                HeapType::Signature(signature) => self
                    .module
                    .functions
                    .get(function)
                    .is_some_and(|function| function.signature == signature),
                _ => false,
            },
            Reference::Object(index) => {
                let Some(object) = self.heap.get(index) else {
                    return false;
                };
                let heap = match object {
                    Object::Struct { ty, .. } => HeapType::Struct(*ty),
                    Object::Array { ty, .. } => HeapType::Array(*ty),
                };
                heap.is_subtype_of(&target.heap)
            }
            // Host objects are opaque; only their hierarchy is known.
            Reference::Host(_) => !target.heap.is_function(),
        }
    }
}

impl Interpreter<'_, FiberHost> {
    /// Runs `function`, resuming it every time it suspends, until it returns.
    ///
    /// Returns the results and how many times the function suspended.
    pub fn run_to_completion(
        &mut self,
        function: FuncIndex,
        args: &[Value],
    ) -> Result<(Vec<Value>, usize), Trap> {
        let mut suspensions = 0;
        loop {
            let results = self.invoke(function, args)?;
            if !self.host.fiber.suspending {
                return Ok((results, suspensions));
            }
            suspensions += 1;
            trace!(suspensions, saved = self.host.fiber.values.len(), "resuming");
            self.host.fiber.suspending = false;
            self.host.fiber.resuming = true;
        }
    }
}
