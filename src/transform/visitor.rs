use std::collections::HashMap;
use std::mem;

use tracing::{debug, trace};

use super::codec::CoroutineFunctions;
use super::frame::{self, FrameLocals};
use super::oracle::SuspensionOracle;
use super::switch::{ContainerIndex, DispatchTable, SwitchContainers, install_targets};
use super::{TransformError, default_value};
use crate::ir::infer::TypeInference;
use crate::ir::{
    Block, BlockId, BlockType, Conditional, Expr, ExprKind, IdGenerator, Local, LocalIndex,
    Module, NodeId, Try, ValType, ends_with_terminating,
};

/// The rewritten body with the locals and ids it now uses.
#[derive(Debug)]
pub struct RewrittenBody {
    pub exprs: Vec<Expr>,
    pub locals: Vec<Local>,
    pub ids: IdGenerator,
    pub resume_states: u32,
    pub dispatch_tables: Vec<DispatchTable>,
}

/// Turns one function body into a resumable state machine.
///
/// The body is flattened into `result_list`, a list of nodes whose results are described, in
/// order, by `stack_types`. Every suspension point wraps everything accumulated so far in a
/// block that the scope's dispatch table can jump to, so a resumed run skips straight to the
/// call that suspended.
pub struct FunctionTransformer<'a, O: SuspensionOracle> {
    module: &'a mut Module,
    runtime: &'a mut CoroutineFunctions,
    oracle: &'a O,
    results: Vec<ValType>,
    ids: IdGenerator,
    locals: Vec<Local>,
    original_locals: usize,
    frame: FrameLocals,
    temps: HashMap<ValType, LocalIndex>,
    containers: SwitchContainers,
    current_container: Option<ContainerIndex>,
    current_state_offset: i32,
    result_list: Vec<Expr>,
    stack_types: Vec<ValType>,
    main_block: BlockId,
}

impl<'a, O: SuspensionOracle> FunctionTransformer<'a, O> {
    pub fn new(
        module: &'a mut Module,
        runtime: &'a mut CoroutineFunctions,
        oracle: &'a O,
        mut locals: Vec<Local>,
        mut ids: IdGenerator,
        results: Vec<ValType>,
    ) -> Self {
        let original_locals = locals.len();
        let fiber_type = runtime.fiber_type(module);
        let state = locals.len();
        locals.push(Local::temp(ValType::I32));
        let fiber = locals.len();
        locals.push(Local::temp(fiber_type));
        let main_block = ids.label();
        debug!(state, fiber, "added coroutine locals");
        Self {
            module,
            runtime,
            oracle,
            results,
            ids,
            locals,
            original_locals,
            frame: FrameLocals { state, fiber },
            temps: HashMap::new(),
            containers: SwitchContainers::new(),
            current_container: None,
            current_state_offset: 0,
            result_list: Vec::new(),
            stack_types: Vec::new(),
            main_block,
        }
    }

    /// Rewrites `body` and wraps it in the prologue, the main block and the epilogue.
    pub fn run(mut self, body: Vec<Expr>) -> Result<RewrittenBody, TransformError> {
        let main = self.create_switch_container();
        self.current_container = Some(main);
        self.visit_many(body)?;
        if !ends_with_terminating(&self.result_list) {
            let ret = self.ids.ret(None);
            self.result_list.push(ret);
        }
        let list = mem::take(&mut self.result_list);
        let main_block = self.ids.block_with(self.main_block, BlockType::empty(), list);

        let original = &self.locals[..self.original_locals];
        let mut exprs = frame::generate_prologue(
            self.module,
            self.runtime,
            &mut self.ids,
            original,
            self.frame,
        )?;
        exprs.push(main_block);
        exprs.extend(frame::generate_epilogue(
            self.module,
            self.runtime,
            &mut self.ids,
            original,
            self.frame,
            &self.results,
        )?);

        let dispatch_tables = self.containers.into_tables();
        install_targets(&mut exprs, &dispatch_tables);
        debug!(
            states = self.current_state_offset,
            tables = dispatch_tables.len(),
            "rewrote function body"
        );
        Ok(RewrittenBody {
            exprs,
            locals: self.locals,
            ids: self.ids,
            resume_states: self.current_state_offset.unsigned_abs(),
            dispatch_tables,
        })
    }

    fn infer(&self) -> TypeInference<'_> {
        TypeInference::new(&*self.module, &self.locals, &self.results)
    }

    /// Runs `f` with an empty result list and stack trace, then puts the outer ones back.
    ///
    /// Returns what `f` accumulated.
    fn in_scope(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<(), TransformError>,
    ) -> Result<(Vec<Expr>, Vec<ValType>), TransformError> {
        let result_list = mem::take(&mut self.result_list);
        let stack_types = mem::take(&mut self.stack_types);
        let container = self.current_container;
        let outcome = f(self);
        let inner_list = mem::replace(&mut self.result_list, result_list);
        let inner_types = mem::replace(&mut self.stack_types, stack_types);
        self.current_container = container;
        outcome.map(|()| (inner_list, inner_types))
    }

    fn container(&self) -> Result<ContainerIndex, TransformError> {
        // The main container exists before any node is visited.
        self.current_container
            .ok_or(TransformError::NoOpenContainer)
    }

    fn create_switch_container(&mut self) -> ContainerIndex {
        let base = self.current_state_offset;
        let (index, dispatcher) =
            self.containers
                .create(self.current_container, base, self.frame.state, &mut self.ids);
        self.current_state_offset += 1;
        self.result_list.push(dispatcher);
        trace!(base, "created dispatch table");
        index
    }

    fn visit_many(&mut self, exprs: Vec<Expr>) -> Result<(), TransformError> {
        for expr in exprs {
            if self.oracle.is_suspending(expr.id) {
                self.visit(expr)?;
            } else {
                self.add_expr(expr);
            }
        }
        Ok(())
    }

    fn add_expr(&mut self, expr: Expr) {
        let types = self.infer().result_types(&expr);
        self.stack_types.extend(types);
        self.result_list.push(expr);
    }

    fn pop_types(&mut self, count: usize) -> Result<(), TransformError> {
        let len = self.stack_types.len();
        if count > len {
            return Err(TransformError::StackUnderflow { label: None });
        }
        self.stack_types.truncate(len - count);
        Ok(())
    }

    fn peek_type(&self, depth: usize) -> Result<ValType, TransformError> {
        self.stack_types
            .len()
            .checked_sub(depth + 1)
            .map(|index| self.stack_types[index].clone())
            .ok_or(TransformError::StackUnderflow { label: None })
    }

    /// Emits an operand of a suspending node; it must leave exactly one value.
    fn visit_operand(&mut self, operand: Expr) -> Result<(), TransformError> {
        let node = operand.id;
        let before = self.stack_types.len();
        if self.oracle.is_suspending(node) {
            self.visit(operand)?;
        } else {
            self.add_expr(operand);
        }
        let count = self.stack_types.len().saturating_sub(before);
        if count != 1 {
            return Err(TransformError::MultiValueOperand { node, count });
        }
        Ok(())
    }

    fn visit(&mut self, expr: Expr) -> Result<(), TransformError> {
        let Expr { id, kind } = expr;
        match kind {
            ExprKind::Block(block) if block.is_loop => self.split_loop(id, block),
            ExprKind::Block(block) => self.split_block(block),
            ExprKind::Conditional(conditional) => self.visit_conditional(id, conditional),
            ExprKind::Try(try_expr) => self.visit_try(id, try_expr),
            ExprKind::Pop(_) => Err(TransformError::UnexpectedPop { node: id }),
            kind @ (ExprKind::Call { .. }
            | ExprKind::IndirectCall { .. }
            | ExprKind::CallReference { .. }) => self.visit_call(Expr { id, kind }),
            kind => self.visit_nary(Expr { id, kind }),
        }
    }

    /// Flattens the operands up to the last suspending one and replaces them by `Pop`s.
    fn visit_nary(&mut self, mut expr: Expr) -> Result<(), TransformError> {
        let last = expr
            .kind
            .operands()
            .iter()
            .rposition(|operand| self.oracle.is_suspending(operand.id));
        let Some(last) = last else {
            self.add_expr(expr);
            return Ok(());
        };

        let mut slots = expr.kind.operands_mut();
        slots.truncate(last + 1);
        for slot in slots.iter_mut() {
            if matches!(slot.kind, ExprKind::Pop(_)) {
                return Err(TransformError::UnexpectedPop { node: slot.id });
            }
            let placeholder = Expr {
                id: slot.id,
                kind: ExprKind::Unreachable,
            };
            let operand = mem::replace(&mut **slot, placeholder);
            self.visit_operand(operand)?;
        }
        let depth = slots.len();
        for (i, slot) in slots.iter_mut().enumerate() {
            let ty = self.peek_type(depth - 1 - i)?;
            **slot = self.ids.pop(ty);
        }
        drop(slots);
        self.pop_types(depth)?;
        self.add_expr(expr);
        Ok(())
    }

    fn split_block(&mut self, block: Block) -> Result<(), TransformError> {
        let Block {
            label, ty, body, ..
        } = block;
        let types_on_stack = self.stack_types.len();
        self.visit_many(body)?;
        self.stack_types.truncate(types_on_stack);
        self.stack_types.extend(ty.results.iter().cloned());
        let body = mem::take(&mut self.result_list);
        trace!(?label, depth = self.stack_types.len(), "split block");
        let block = self
            .ids
            .block_with(label, BlockType::results(self.stack_types.clone()), body);
        self.result_list.push(block);
        Ok(())
    }

    /// Moves everything accumulated so far into a `jump_inside` block and visits `body` in a
    /// scope with its own dispatch table.
    ///
    /// Returns the flattened body, the types it leaves and the new table's base state.
    fn split_scope(
        &mut self,
        node: NodeId,
        body: Vec<Expr>,
    ) -> Result<(Vec<Expr>, Vec<ValType>, i32), TransformError> {
        if !self.stack_types.is_empty() {
            return Err(TransformError::OperandsAcrossScope {
                node,
                pending: self.stack_types.len(),
            });
        }
        let base = self.current_state_offset;
        let reset = self.set_state(base);
        self.result_list.push(reset);
        let jump_inside = self.ids.label();
        let prefix = mem::take(&mut self.result_list);
        let prefix = self.ids.block_with(jump_inside, BlockType::empty(), prefix);
        self.result_list.push(prefix);

        let parent = self.container()?;
        let (body, types) = self.in_scope(|this| {
            let container = this.create_switch_container();
            this.containers.set_jump_inside(parent, Some(jump_inside));
            this.current_container = Some(container);
            this.containers.add_jumps_to_outer_switches(container)?;
            this.visit_many(body)
        })?;
        self.containers.set_jump_inside(parent, None);
        Ok((body, types, base))
    }

    fn split_loop(&mut self, node: NodeId, block: Block) -> Result<(), TransformError> {
        let Block {
            label, ty, body, ..
        } = block;
        let (mut body, _, base) = self.split_scope(node, body)?;
        let falls_through = !ends_with_terminating(&body);
        let exit = (falls_through || !ty.results.is_empty()).then(|| self.ids.label());
        if let (true, Some(exit)) = (falls_through, exit) {
            let leave = self.ids.break_to(exit, None);
            body.push(leave);
        }

        // Branches to the loop's own label now leave `former` and restart the loop fresh.
        let former = self.ids.block_with(label, BlockType::empty(), body);
        let containing = self.ids.label();
        let reset = self.set_state(base);
        let again = self.ids.break_to(containing, None);
        let looped = self
            .ids
            .loop_with(containing, BlockType::empty(), vec![former, reset, again]);
        let emitted = match exit {
            Some(exit) => {
                let unreachable = self.ids.unreachable();
                self.ids
                    .block_with(exit, BlockType::results(ty.results.clone()), vec![
                        looped,
                        unreachable,
                    ])
            }
            None => looped,
        };
        trace!(?label, base, "split loop");
        self.result_list.push(emitted);
        self.stack_types.extend(ty.results);
        Ok(())
    }

    fn visit_conditional(
        &mut self,
        id: NodeId,
        mut conditional: Conditional,
    ) -> Result<(), TransformError> {
        if self.oracle.is_suspending(conditional.condition.id) {
            let placeholder = Expr {
                id: conditional.condition.id,
                kind: ExprKind::Unreachable,
            };
            let condition = mem::replace(&mut *conditional.condition, placeholder);
            self.visit_operand(condition)?;
            let ty = self.peek_type(0)?;
            self.pop_types(1)?;
            *conditional.condition = self.ids.pop(ty);
        }
        if !self.oracle.any_suspending(&conditional.then_body)
            && !self.oracle.any_suspending(&conditional.else_body)
        {
            self.add_expr(Expr {
                id,
                kind: ExprKind::Conditional(conditional),
            });
            return Ok(());
        }

        let Conditional {
            label,
            condition,
            then_body,
            else_body,
            ty,
        } = conditional;
        let passthrough = self.stack_types.clone();
        let mut outputs = passthrough.clone();
        outputs.extend(ty.results);

        let else_label = self.ids.label();
        let enter_then = self.ids.expr(ExprKind::Branch {
            target: else_label,
            condition,
            value: None,
        });
        self.result_list.push(enter_then);
        self.stack_types = passthrough.clone();
        self.visit_many(else_body)?;
        let mut else_list = mem::take(&mut self.result_list);
        if !ends_with_terminating(&else_list) {
            let join = self.ids.break_to(label, None);
            else_list.push(join);
        }
        let else_block =
            self.ids
                .block_with(else_label, BlockType::results(passthrough.clone()), else_list);
        self.result_list.push(else_block);

        self.stack_types = passthrough;
        self.visit_many(then_body)?;
        let then_list = mem::take(&mut self.result_list);
        let joined = self
            .ids
            .block_with(label, BlockType::results(outputs.clone()), then_list);
        self.result_list.push(joined);
        self.stack_types = outputs;
        trace!(?label, "split conditional");
        Ok(())
    }

    fn visit_try(&mut self, id: NodeId, mut try_expr: Try) -> Result<(), TransformError> {
        let body_suspends = self.oracle.any_suspending(&try_expr.body);
        let split_catches: Vec<bool> = try_expr
            .catches
            .iter()
            .map(|catch| self.oracle.any_suspending(&catch.body))
            .collect();
        let catches_suspend = split_catches.iter().any(|split| *split);
        if !body_suspends && !catches_suspend {
            self.add_expr(Expr {
                id,
                kind: ExprKind::Try(try_expr),
            });
            return Ok(());
        }
        if !self.stack_types.is_empty() {
            return Err(TransformError::OperandsAcrossScope {
                node: id,
                pending: self.stack_types.len(),
            });
        }

        if body_suspends {
            let body = mem::take(&mut try_expr.body);
            let (body, _, base) = self.split_scope(id, body)?;
            try_expr.body = body;
            trace!(label = ?try_expr.label, base, "split try body");
        }
        if !catches_suspend {
            let results = try_expr.ty.results.clone();
            self.result_list.push(Expr {
                id,
                kind: ExprKind::Try(try_expr),
            });
            self.stack_types.extend(results);
            return Ok(());
        }

        // Suspending handlers move out of the try: each one gets a landing block typed with
        // its tag payload and the handler inside the try only branches there.
        let exit = try_expr.label;
        try_expr.label = self.ids.label();
        let results = try_expr.ty.results.clone();
        let mut handlers = Vec::new();
        for (catch, split) in try_expr.catches.iter_mut().zip(&split_catches) {
            if !split {
                continue;
            }
            let landing = self.ids.label();
            let body = mem::take(&mut catch.body);
            catch.body = vec![self.ids.break_to(landing, None)];
            let payload = self
                .module
                .tags
                .get(catch.tag)
                .map(|tag| tag.params.clone())
                .unwrap_or_default();
            handlers.push((landing, payload, body));
        }

        let mut current = mem::take(&mut self.result_list);
        current.push(Expr {
            id,
            kind: ExprKind::Try(try_expr),
        });
        current.push(self.ids.break_to(exit, None));
        let count = handlers.len();
        for (i, (landing, payload, body)) in handlers.into_iter().enumerate() {
            let landing_block =
                self.ids
                    .block_with(landing, BlockType::results(payload.clone()), current);
            self.result_list.push(landing_block);
            self.stack_types = payload;
            self.visit_many(body)?;
            if i + 1 < count && !ends_with_terminating(&self.result_list) {
                let leave = self.ids.break_to(exit, None);
                self.result_list.push(leave);
            }
            current = mem::take(&mut self.result_list);
        }
        let exit_block = self
            .ids
            .block_with(exit, BlockType::results(results.clone()), current);
        self.result_list.push(exit_block);
        self.stack_types = results;
        trace!(?exit, handlers = count, "split try handlers");
        Ok(())
    }

    fn visit_call(&mut self, mut expr: Expr) -> Result<(), TransformError> {
        if !expr.kind.is_suspension_point() {
            return self.visit_nary(expr);
        }
        let (mut params, results, dispatch) = match &expr.kind {
            ExprKind::Call { function, .. } => {
                let ty = self.module.function_type(*function);
                (ty.params.clone(), ty.results.clone(), None)
            }
            ExprKind::IndirectCall { signature, .. } => {
                let ty = self.module.signature(*signature);
                (ty.params.clone(), ty.results.clone(), Some(ValType::I32))
            }
            ExprKind::CallReference { signature, .. } => {
                let ty = self.module.signature(*signature);
                let reference = ValType::Ref(crate::ir::RefType::nullable(
                    crate::ir::HeapType::Signature(*signature),
                ));
                (ty.params.clone(), ty.results.clone(), Some(reference))
            }
            _ => return self.visit_nary(expr),
        };
        params.extend(dispatch.iter().cloned());

        let mut slots = expr.kind.operands_mut();
        for (slot, ty) in slots.iter_mut().zip(&params) {
            if matches!(slot.kind, ExprKind::Pop(_)) {
                return Err(TransformError::UnexpectedPop { node: slot.id });
            }
            let placeholder = Expr {
                id: slot.id,
                kind: ExprKind::Unreachable,
            };
            let operand = mem::replace(&mut **slot, placeholder);
            self.visit_operand(operand)?;
            **slot = self.ids.pop(ty.clone());
        }
        let arity = slots.len();
        drop(slots);
        if arity != params.len() {
            return Err(TransformError::ArityMismatch {
                node: expr.id,
                expected: params.len(),
                found: arity,
            });
        }

        let len = self.stack_types.len();
        if arity > len {
            return Err(TransformError::StackUnderflow { label: None });
        }
        self.stack_types.truncate(len - arity);
        let live = self.stack_types.clone();
        self.stack_types.extend(params.iter().cloned());

        // outer { inner { ...; br outer }; restore live values; argument placeholders }
        let outer = self.ids.label();
        let inner = self.ids.label();
        let mut inner_list = mem::take(&mut self.result_list);
        inner_list.push(self.ids.break_to(outer, None));
        let mut outer_list = vec![self.ids.block_with(inner, BlockType::empty(), inner_list)];
        for ty in &live {
            outer_list.push(self.restore(ty)?);
        }
        let defaulted = arity - usize::from(dispatch.is_some());
        for ty in &params[..defaulted] {
            outer_list.push(default_value(&mut self.ids, ty)?);
        }
        if let Some(ty) = &dispatch {
            outer_list.push(self.restore(ty)?);
        }
        let outer_block =
            self.ids
                .block_with(outer, BlockType::results(self.stack_types.clone()), outer_list);
        self.result_list.push(outer_block);

        let kept = match &dispatch {
            Some(ty) => {
                let tmp = self.temp_local(ty);
                let value = self.ids.pop(ty.clone());
                let keep = self.ids.set_local(tmp, value);
                let reload = self.ids.get_local(tmp);
                self.result_list.push(keep);
                self.result_list.push(reload);
                Some((tmp, ty.clone()))
            }
            None => None,
        };

        let state = self.current_state_offset;
        self.current_state_offset += 1;
        let set_state = self.set_state(state);
        self.result_list.push(set_state);
        self.result_list.push(expr);
        self.pop_types(arity)?;
        self.stack_types.extend(results.iter().cloned());

        let mut suspended = Vec::new();
        for ty in results.iter().rev() {
            let value = self.ids.pop(ty.clone());
            suspended.push(self.ids.drop_value(value));
        }
        if let Some((tmp, ty)) = &kept {
            let value = self.ids.get_local(*tmp);
            suspended.push(self.runtime.save_value(
                self.module,
                &mut self.ids,
                ty,
                self.frame.fiber,
                value,
            )?);
        }
        for ty in live.iter().rev() {
            let value = self.ids.pop(ty.clone());
            suspended.push(self.runtime.save_value(
                self.module,
                &mut self.ids,
                ty,
                self.frame.fiber,
                value,
            )?);
        }
        suspended.push(self.ids.break_to(self.main_block, None));
        let condition = self
            .runtime
            .is_suspending(self.module, &mut self.ids, self.frame.fiber)?;
        let check_label = self.ids.label();
        let check = self.ids.expr(ExprKind::Conditional(Conditional {
            label: check_label,
            condition: Box::new(condition),
            then_body: suspended,
            else_body: Vec::new(),
            ty: BlockType::passthrough(self.stack_types.clone()),
        }));
        self.result_list.push(check);

        let container = self.container()?;
        self.containers.add_target(container, inner);
        self.containers.add_jumps_to_outer_switches(container)?;
        trace!(state, live = live.len(), "split call");
        Ok(())
    }

    fn set_state(&mut self, state: i32) -> Expr {
        let value = self.ids.i32_const(state);
        self.ids.set_local(self.frame.state, value)
    }

    fn restore(&mut self, ty: &ValType) -> Result<Expr, TransformError> {
        self.runtime
            .restore_value(self.module, &mut self.ids, ty, self.frame.fiber)
    }

    /// A scratch local of exactly `ty`, shared by every call site that needs one.
    fn temp_local(&mut self, ty: &ValType) -> LocalIndex {
        if let Some(local) = self.temps.get(ty) {
            return *local;
        }
        let local = self.locals.len();
        self.locals.push(Local::temp(ty.clone()));
        self.temps.insert(ty.clone(), local);
        local
    }
}
