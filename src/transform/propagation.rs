//! Threads values through nested blocks.
//!
//! After rewriting, a branch may need values that were pushed in a frame outside the block it
//! is taken from. Every frame between the branch and its target then takes those values as
//! extra params and hands them back as extra results, so they are visible where the branch is.

use tracing::trace;

use super::TransformError;
use super::stack::BlockStack;
use crate::ir::infer::TypeInference;
use crate::ir::{BlockId, BlockType, Expr, ExprKind, Local, Module, ValType};

/// Rewrites the block types of `body` so every branch finds its carried values.
pub fn propagate_types(
    module: &Module,
    locals: &[Local],
    results: &[ValType],
    body: &mut [Expr],
) -> Result<(), TransformError> {
    let mut pass = TypePropagation {
        infer: TypeInference::new(module, locals, results),
        stack: BlockStack::new(),
    };
    pass.stack.enter(None, Vec::new(), results.to_vec(), false);
    pass.visit_list(body)?;
    pass.stack.finish()
}

struct TypePropagation<'a> {
    infer: TypeInference<'a>,
    stack: BlockStack,
}

impl TypePropagation<'_> {
    fn visit_list(&mut self, body: &mut [Expr]) -> Result<(), TransformError> {
        for expr in body {
            self.visit(expr)?;
        }
        Ok(())
    }

    fn visit_operands(&mut self, expr: &mut Expr) -> Result<(), TransformError> {
        for operand in expr.kind.operands_mut() {
            if !matches!(operand.kind, ExprKind::Pop(_)) {
                self.visit(operand)?;
            }
        }
        Ok(())
    }

    fn visit(&mut self, expr: &mut Expr) -> Result<(), TransformError> {
        self.visit_operands(expr)?;
        match &mut expr.kind {
            ExprKind::Block(block) => {
                let (label, is_loop) = (block.label, block.is_loop);
                self.stack.pop_many(block.ty.params.len())?;
                self.stack.enter(
                    Some(label),
                    block.ty.params.clone(),
                    block.ty.results.clone(),
                    is_loop,
                );
                self.visit_list(&mut block.body)?;
                let results = block.ty.results.clone();
                self.close(label, &mut block.ty)?;
                self.stack.push_all(&results);
            }
            ExprKind::Conditional(conditional) => {
                let label = conditional.label;
                self.stack.pop()?;
                self.stack.pop_many(conditional.ty.params.len())?;
                let (params, results) =
                    (conditional.ty.params.clone(), conditional.ty.results.clone());

                self.stack
                    .enter(Some(label), params.clone(), results.clone(), false);
                self.visit_list(&mut conditional.then_body)?;
                self.stack.exit(Some(label))?;

                self.stack.enter(Some(label), params, results.clone(), false);
                self.visit_list(&mut conditional.else_body)?;
                self.close(label, &mut conditional.ty)?;
                self.stack.push_all(&results);
            }
            ExprKind::Try(try_expr) => {
                let label = try_expr.label;
                self.stack.pop_many(try_expr.ty.params.len())?;
                let (params, results) = (try_expr.ty.params.clone(), try_expr.ty.results.clone());
                self.stack
                    .enter(Some(label), params, results.clone(), false);
                self.visit_list(&mut try_expr.body)?;
                for catch in try_expr.catches.iter_mut() {
                    self.stack.exit(Some(label))?;
                    let payload = self
                        .infer
                        .module()
                        .tags
                        .get(catch.tag)
                        .map(|tag| tag.params.clone())
                        .unwrap_or_default();
                    self.stack.enter(Some(label), payload, results.clone(), false);
                    self.visit_list(&mut catch.body)?;
                }
                self.close(label, &mut try_expr.ty)?;
                self.stack.push_all(&results);
            }
            ExprKind::Branch { target, .. } => {
                let target = *target;
                self.stack.pop()?;
                let arity = self.stack.branch_arity(Some(target))?;
                self.stack.update_propagation(Some(target), arity)?;
            }
            ExprKind::Break { target, .. } => {
                let target = *target;
                let arity = self.stack.branch_arity(Some(target))?;
                self.stack.update_propagation(Some(target), arity)?;
                self.stack.mark_unreachable();
            }
            ExprKind::Switch {
                targets, default, ..
            } => {
                self.stack.pop()?;
                for target in targets.iter().chain([&*default]) {
                    let arity = self.stack.branch_arity(Some(*target))?;
                    self.stack.update_propagation(Some(*target), arity)?;
                }
                self.stack.mark_unreachable();
            }
            ExprKind::Return { .. } => {
                let arity = self.infer.function_results().len();
                self.stack.update_propagation(None, arity)?;
                self.stack.mark_unreachable();
            }
            ExprKind::Throw { .. } | ExprKind::Unreachable => self.stack.mark_unreachable(),
            _ => {
                let consumed = self.infer.operand_types(expr).len();
                self.stack.pop_many(consumed)?;
                let produced = self.infer.result_types(expr);
                self.stack.push_all(&produced);
            }
        }
        Ok(())
    }

    /// Exits the innermost frame and widens `ty` with the values it must thread through.
    fn close(&mut self, label: BlockId, ty: &mut BlockType) -> Result<(), TransformError> {
        if let Some(propagated) = self.stack.take_propagation(label) {
            trace!(?label, count = propagated.len(), "propagating types");
            let mut params = propagated.clone();
            params.append(&mut ty.params);
            ty.params = params;
            let mut results = propagated;
            results.append(&mut ty.results);
            ty.results = results;
        }
        self.stack.exit(Some(label))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IdGenerator;

    #[test]
    fn inner_block_threads_outer_value() {
        let module = Module::new();
        let mut ids = IdGenerator::new();
        let outer = ids.label();
        let inner = ids.label();
        let leave = ids.break_to(outer, None);
        let inner_block = ids.block_with(inner, BlockType::empty(), vec![leave]);
        let one = ids.i32_const(1);
        let outer_block =
            ids.block_with(outer, BlockType::single(ValType::I32), vec![one, inner_block]);
        let value = ids.pop(ValType::I32);
        let dropped = ids.drop_value(value);
        let mut body = vec![outer_block, dropped];

        propagate_types(&module, &[], &[], &mut body).unwrap();

        let ExprKind::Block(outer_block) = &body[0].kind else {
            panic!("expected the outer block");
        };
        assert_eq!(outer_block.ty, BlockType::single(ValType::I32));
        let ExprKind::Block(inner_block) = &outer_block.body[1].kind else {
            panic!("expected the inner block");
        };
        assert_eq!(inner_block.ty, BlockType::passthrough(vec![ValType::I32]));
    }

    #[test]
    fn local_values_leave_types_alone() {
        let module = Module::new();
        let mut ids = IdGenerator::new();
        let outer = ids.label();
        let inner = ids.label();
        let one = ids.i32_const(1);
        let leave = ids.break_to(outer, None);
        let inner_block = ids.block_with(inner, BlockType::empty(), vec![one, leave]);
        let unreachable = ids.unreachable();
        let outer_block = ids.block_with(outer, BlockType::single(ValType::I32), vec![
            inner_block,
            unreachable,
        ]);
        let value = ids.pop(ValType::I32);
        let dropped = ids.drop_value(value);
        let mut body = vec![outer_block, dropped];
        let expected = body.clone();

        propagate_types(&module, &[], &[], &mut body).unwrap();
        assert_eq!(body, expected);
    }

    #[test]
    fn unknown_target_is_reported() {
        let module = Module::new();
        let mut ids = IdGenerator::new();
        let missing = BlockId(42);
        let mut body = vec![ids.break_to(missing, None)];
        assert_eq!(
            propagate_types(&module, &[], &[], &mut body),
            Err(TransformError::BranchTargetNotOpen {
                target: Some(missing)
            })
        );
    }
}
