use std::ops::{Deref, DerefMut};

use super::{
    Block, BlockId, BlockType, Catch, Conditional, Expr, ExprKind, FuncIndex, Function,
    FunctionBody, HeapType, IdGenerator, IntBinaryOp, IntType, IntUnaryOp, Local, LocalIndex,
    LocalKind, Module, SigIndex, TagIndex, Try, ValType,
};

/// Node constructors. Every node gets a fresh id.
impl IdGenerator {
    pub fn i32_const(&mut self, value: i32) -> Expr {
        self.expr(ExprKind::I32Const(value))
    }

    pub fn i64_const(&mut self, value: i64) -> Expr {
        self.expr(ExprKind::I64Const(value))
    }

    pub fn f32_const(&mut self, value: f32) -> Expr {
        self.expr(ExprKind::F32Const(value))
    }

    pub fn f64_const(&mut self, value: f64) -> Expr {
        self.expr(ExprKind::F64Const(value))
    }

    pub fn null(&mut self, heap: HeapType) -> Expr {
        self.expr(ExprKind::Null(heap))
    }

    pub fn get_local(&mut self, local: LocalIndex) -> Expr {
        self.expr(ExprKind::GetLocal(local))
    }

    pub fn set_local(&mut self, local: LocalIndex, value: Expr) -> Expr {
        self.expr(ExprKind::SetLocal {
            local,
            value: Box::new(value),
        })
    }

    pub fn pop(&mut self, ty: ValType) -> Expr {
        self.expr(ExprKind::Pop(ty))
    }

    pub fn drop_value(&mut self, value: Expr) -> Expr {
        self.expr(ExprKind::Drop(Box::new(value)))
    }

    pub fn int_unary(&mut self, ty: IntType, op: IntUnaryOp, operand: Expr) -> Expr {
        self.expr(ExprKind::IntUnary {
            ty,
            op,
            operand: Box::new(operand),
        })
    }

    pub fn int_binary(&mut self, ty: IntType, op: IntBinaryOp, first: Expr, second: Expr) -> Expr {
        self.expr(ExprKind::IntBinary {
            ty,
            op,
            first: Box::new(first),
            second: Box::new(second),
        })
    }

    pub fn i32_add(&mut self, first: Expr, second: Expr) -> Expr {
        self.int_binary(IntType::I32, IntBinaryOp::Add, first, second)
    }

    pub fn i32_sub(&mut self, first: Expr, second: Expr) -> Expr {
        self.int_binary(IntType::I32, IntBinaryOp::Sub, first, second)
    }

    pub fn call(&mut self, function: FuncIndex, args: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Call {
            function,
            args,
            suspension_point: false,
        })
    }

    /// A call flagged as a suspension point.
    pub fn suspending_call(&mut self, function: FuncIndex, args: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Call {
            function,
            args,
            suspension_point: true,
        })
    }

    pub fn call_indirect(
        &mut self,
        signature: SigIndex,
        args: Vec<Expr>,
        selector: Expr,
        suspension_point: bool,
    ) -> Expr {
        self.expr(ExprKind::IndirectCall {
            signature,
            args,
            selector: Box::new(selector),
            suspension_point,
        })
    }

    pub fn call_reference(
        &mut self,
        signature: SigIndex,
        args: Vec<Expr>,
        callee: Expr,
        suspension_point: bool,
    ) -> Expr {
        self.expr(ExprKind::CallReference {
            signature,
            args,
            callee: Box::new(callee),
            suspension_point,
        })
    }

    pub fn block_with(&mut self, label: BlockId, ty: BlockType, body: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Block(Block {
            label,
            is_loop: false,
            ty,
            body,
        }))
    }

    pub fn loop_with(&mut self, label: BlockId, ty: BlockType, body: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Block(Block {
            label,
            is_loop: true,
            ty,
            body,
        }))
    }

    pub fn break_to(&mut self, target: BlockId, value: Option<Expr>) -> Expr {
        self.expr(ExprKind::Break {
            target,
            value: value.map(Box::new),
        })
    }

    pub fn branch_if(&mut self, target: BlockId, condition: Expr, value: Option<Expr>) -> Expr {
        self.expr(ExprKind::Branch {
            target,
            condition: Box::new(condition),
            value: value.map(Box::new),
        })
    }

    pub fn switch(&mut self, selector: Expr, targets: Vec<BlockId>, default: BlockId) -> Expr {
        self.expr(ExprKind::Switch {
            selector: Box::new(selector),
            targets,
            default,
        })
    }

    pub fn ret(&mut self, value: Option<Expr>) -> Expr {
        self.expr(ExprKind::Return {
            value: value.map(Box::new),
        })
    }

    pub fn unreachable(&mut self) -> Expr {
        self.expr(ExprKind::Unreachable)
    }

    pub fn throw(&mut self, tag: TagIndex, args: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Throw { tag, args })
    }
}

/// Builds one function body: its locals, labels and nodes.
///
/// Structured helpers allocate the label before the body closure runs, so the body can branch
/// to it.
#[derive(Debug, Clone)]
pub struct FunctionBuilder {
    name: String,
    params: Vec<ValType>,
    results: Vec<ValType>,
    locals: Vec<Local>,
    ids: IdGenerator,
}

impl Deref for FunctionBuilder {
    type Target = IdGenerator;

    fn deref(&self) -> &Self::Target {
        &self.ids
    }
}

impl DerefMut for FunctionBuilder {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ids
    }
}

impl FunctionBuilder {
    /// Starts a function whose first locals are its parameters.
    pub fn new(name: &str, params: &[ValType], results: &[ValType]) -> Self {
        let locals = params
            .iter()
            .enumerate()
            .map(|(i, ty)| Local::new(Some(format!("arg{i}")), ty.clone(), LocalKind::Arg))
            .collect();
        Self {
            name: name.to_string(),
            params: params.to_vec(),
            results: results.to_vec(),
            locals,
            ids: IdGenerator::new(),
        }
    }

    pub fn add_local(&mut self, name: &str, ty: ValType) -> LocalIndex {
        let id = self.locals.len();
        self.locals
            .push(Local::new(Some(name.to_string()), ty, LocalKind::Var));
        id
    }

    pub fn add_temp_local(&mut self, ty: ValType) -> LocalIndex {
        let id = self.locals.len();
        self.locals.push(Local::temp(ty));
        id
    }

    pub fn locals(&self) -> &[Local] {
        &self.locals
    }

    pub fn results(&self) -> &[ValType] {
        &self.results
    }

    pub fn block(
        &mut self,
        ty: BlockType,
        body: impl FnOnce(&mut Self, BlockId) -> Vec<Expr>,
    ) -> Expr {
        let label = self.ids.label();
        let body = body(self, label);
        self.ids.block_with(label, ty, body)
    }

    pub fn loop_block(
        &mut self,
        ty: BlockType,
        body: impl FnOnce(&mut Self, BlockId) -> Vec<Expr>,
    ) -> Expr {
        let label = self.ids.label();
        let body = body(self, label);
        self.ids.loop_with(label, ty, body)
    }

    /// An if/else. Both arm closures receive the conditional's label.
    pub fn conditional(
        &mut self,
        condition: Expr,
        ty: BlockType,
        then_body: impl FnOnce(&mut Self, BlockId) -> Vec<Expr>,
        else_body: impl FnOnce(&mut Self, BlockId) -> Vec<Expr>,
    ) -> Expr {
        let label = self.ids.label();
        let then_body = then_body(self, label);
        let else_body = else_body(self, label);
        self.ids.expr(ExprKind::Conditional(Conditional {
            label,
            condition: Box::new(condition),
            then_body,
            else_body,
            ty,
        }))
    }

    /// A try block. The closure returns the protected body and the handlers.
    pub fn try_block(
        &mut self,
        ty: BlockType,
        build: impl FnOnce(&mut Self, BlockId) -> (Vec<Expr>, Vec<Catch>),
    ) -> Expr {
        let label = self.ids.label();
        let (body, catches) = build(self, label);
        self.ids.expr(ExprKind::Try(Try {
            label,
            body,
            catches,
            ty,
        }))
    }

    /// Adds the function to `module`, interning its signature.
    pub fn finish(self, module: &mut Module, body: Vec<Expr>) -> FuncIndex {
        let signature = module.intern_signature(self.params, self.results);
        module.add_function(Function {
            name: self.name,
            signature,
            body: Some(FunctionBody {
                locals: self.locals,
                exprs: body,
                ids: self.ids,
            }),
        })
    }
}
