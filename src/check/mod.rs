//! Structural checker for function bodies.
//!
//! Simulates the operand stack frame by frame: every node must find its operands with the right
//! types, every branch must find the values its target expects inside the frame it is taken
//! from, and every `Pop` must name a value that is really on the stack.

use thiserror::Error;
use tracing::{Span, debug, instrument};

use crate::ir::infer::TypeInference;
use crate::ir::{BlockId, Expr, ExprKind, FuncIndex, Local, Module, NodeId, ValType};
use crate::transform::TransformError;
use crate::transform::stack::BlockStack;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VerifyError {
    #[error(transparent)]
    Stack(#[from] TransformError),
    #[error("node {node:?} expected {expected} but found {found}")]
    TypeMismatch {
        node: NodeId,
        expected: ValType,
        found: ValType,
    },
    #[error("frame {label:?} ends with {found:?}, expected {expected:?}")]
    BlockResultMismatch {
        label: Option<BlockId>,
        expected: Vec<ValType>,
        found: Vec<ValType>,
    },
    #[error("branch {node:?} carries {found:?}, its target expects {expected:?}")]
    BranchMismatch {
        node: NodeId,
        expected: Vec<ValType>,
        found: Vec<ValType>,
    },
    #[error("pop {node:?} does not name a value already on the stack")]
    MisplacedPop { node: NodeId },
    #[error("node {node:?} uses undeclared local {local}")]
    UnknownLocal { node: NodeId, local: usize },
    #[error("function {0:?} has no body")]
    MissingBody(String),
}

/// Checks the body of a module function against its signature.
#[instrument(level = "debug", skip_all, fields(function = tracing::field::Empty))]
pub fn verify_function(module: &Module, function: FuncIndex) -> Result<(), VerifyError> {
    let function = module.function(function);
    Span::current().record("function", function.name.as_str());
    let body = function
        .body
        .as_ref()
        .ok_or_else(|| VerifyError::MissingBody(function.name.clone()))?;
    let results = &module.signature(function.signature).results;
    verify_body(module, &body.locals, results, &body.exprs)?;
    debug!("body verified");
    Ok(())
}

pub fn verify_body(
    module: &Module,
    locals: &[Local],
    results: &[ValType],
    body: &[Expr],
) -> Result<(), VerifyError> {
    let mut checker = Checker {
        infer: TypeInference::new(module, locals, results),
        stack: BlockStack::new(),
        pending_pops: 0,
    };
    checker.stack.enter(None, Vec::new(), results.to_vec(), false);
    checker.check_list(body)?;
    checker.close(None)
}

struct Checker<'a> {
    infer: TypeInference<'a>,
    stack: BlockStack,
    /// Leading pops of the current statement that were not reached yet.
    pending_pops: usize,
}

impl Checker<'_> {
    fn check_list(&mut self, body: &[Expr]) -> Result<(), VerifyError> {
        for expr in body {
            if let ExprKind::Pop(_) = expr.kind {
                return Err(VerifyError::MisplacedPop { node: expr.id });
            }
            let outer = self.pending_pops;
            let leading = leading_pops(expr);
            self.check_leading(&leading)?;
            self.pending_pops = leading.len();
            self.check(expr)?;
            self.pending_pops = outer;
        }
        Ok(())
    }

    /// The leading pops of a statement name the values on top of the current frame.
    fn check_leading(&self, pops: &[&Expr]) -> Result<(), VerifyError> {
        let Some(frame) = self.stack.current() else {
            return Ok(());
        };
        if frame.types.len() < pops.len() && !frame.unreachable {
            return Err(TransformError::StackUnderflow { label: frame.label }.into());
        }
        let skipped = pops.len().saturating_sub(frame.types.len());
        let start = frame.types.len() + skipped - pops.len();
        for (pop, found) in pops[skipped..].iter().zip(&frame.types[start..]) {
            if let ExprKind::Pop(expected) = &pop.kind {
                if !found.is_subtype_of(expected) {
                    return Err(VerifyError::TypeMismatch {
                        node: pop.id,
                        expected: expected.clone(),
                        found: found.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check(&mut self, expr: &Expr) -> Result<(), VerifyError> {
        match &expr.kind {
            ExprKind::Pop(_) => {
                if self.pending_pops == 0 {
                    return Err(VerifyError::MisplacedPop { node: expr.id });
                }
                self.pending_pops -= 1;
                return Ok(());
            }
            ExprKind::Block(block) => {
                self.pop_expected(expr.id, &block.ty.params)?;
                self.stack.enter(
                    Some(block.label),
                    block.ty.params.clone(),
                    block.ty.results.clone(),
                    block.is_loop,
                );
                self.check_nested(&block.body)?;
                self.close(Some(block.label))?;
                self.stack.push_all(&block.ty.results);
                return Ok(());
            }
            ExprKind::Conditional(conditional) => {
                self.check(&conditional.condition)?;
                self.pop_expected(expr.id, &[ValType::I32])?;
                self.pop_expected(expr.id, &conditional.ty.params)?;
                for arm in [&conditional.then_body, &conditional.else_body] {
                    self.stack.enter(
                        Some(conditional.label),
                        conditional.ty.params.clone(),
                        conditional.ty.results.clone(),
                        false,
                    );
                    self.check_nested(arm)?;
                    self.close(Some(conditional.label))?;
                }
                self.stack.push_all(&conditional.ty.results);
                return Ok(());
            }
            ExprKind::Try(try_expr) => {
                self.pop_expected(expr.id, &try_expr.ty.params)?;
                self.stack.enter(
                    Some(try_expr.label),
                    try_expr.ty.params.clone(),
                    try_expr.ty.results.clone(),
                    false,
                );
                self.check_nested(&try_expr.body)?;
                self.close(Some(try_expr.label))?;
                for catch in &try_expr.catches {
                    let payload = self
                        .infer
                        .module()
                        .tags
                        .get(catch.tag)
                        .map(|tag| tag.params.clone())
                        .unwrap_or_default();
                    self.stack.enter(
                        Some(try_expr.label),
                        payload,
                        try_expr.ty.results.clone(),
                        false,
                    );
                    self.check_nested(&catch.body)?;
                    self.close(Some(try_expr.label))?;
                }
                self.stack.push_all(&try_expr.ty.results);
                return Ok(());
            }
            _ => {}
        }

        for operand in expr.kind.operands() {
            self.check(operand)?;
        }
        match &expr.kind {
            ExprKind::Branch { target, .. } => {
                self.pop_expected(expr.id, &[ValType::I32])?;
                self.check_carried(expr.id, *target)?;
            }
            ExprKind::Break { target, .. } => {
                self.check_carried(expr.id, *target)?;
                self.stack.mark_unreachable();
            }
            ExprKind::Switch {
                targets, default, ..
            } => {
                self.pop_expected(expr.id, &[ValType::I32])?;
                for target in targets.iter().chain([default]) {
                    self.check_carried(expr.id, *target)?;
                }
                self.stack.mark_unreachable();
            }
            ExprKind::Return { .. } => {
                let results = self.infer.function_results();
                self.check_types(expr.id, results)?;
                self.stack.mark_unreachable();
            }
            ExprKind::Throw { .. } => {
                let args = self.infer.operand_types(expr);
                self.pop_expected(expr.id, &args)?;
                self.stack.mark_unreachable();
            }
            ExprKind::Unreachable => self.stack.mark_unreachable(),
            ExprKind::GetLocal(local) | ExprKind::SetLocal { local, .. }
                if self.infer.local_type(*local).is_none() =>
            {
                return Err(VerifyError::UnknownLocal {
                    node: expr.id,
                    local: *local,
                });
            }
            _ => {
                let operands = self.infer.operand_types(expr);
                self.pop_expected(expr.id, &operands)?;
                let results = self.infer.result_types(expr);
                self.stack.push_all(&results);
            }
        }
        Ok(())
    }

    /// Statements of a nested body start with no pending pops of their own.
    fn check_nested(&mut self, body: &[Expr]) -> Result<(), VerifyError> {
        let outer = std::mem::take(&mut self.pending_pops);
        let checked = self.check_list(body);
        self.pending_pops = outer;
        checked
    }

    /// Pops `expected` off the current frame, last type first.
    fn pop_expected(&mut self, node: NodeId, expected: &[ValType]) -> Result<(), VerifyError> {
        for expected in expected.iter().rev() {
            if let Some(found) = self.stack.pop()? {
                if !found.is_subtype_of(expected) {
                    return Err(VerifyError::TypeMismatch {
                        node,
                        expected: expected.clone(),
                        found,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_carried(&self, node: NodeId, target: BlockId) -> Result<(), VerifyError> {
        let position = self.stack.find(Some(target))?;
        let expected = self
            .stack
            .frame(position)
            .map(|frame| frame.label_types().to_vec())
            .unwrap_or_default();
        self.check_types(node, &expected)
    }

    /// The top of the current frame must hold `expected`.
    fn check_types(&self, node: NodeId, expected: &[ValType]) -> Result<(), VerifyError> {
        let Some(frame) = self.stack.current() else {
            return Ok(());
        };
        let available = frame.types.len().min(expected.len());
        let found = &frame.types[frame.types.len() - available..];
        let matches = (available == expected.len() || frame.unreachable)
            && found
                .iter()
                .zip(&expected[expected.len() - available..])
                .all(|(found, expected)| found.is_subtype_of(expected));
        if matches {
            Ok(())
        } else {
            Err(VerifyError::BranchMismatch {
                node,
                expected: expected.to_vec(),
                found: found.to_vec(),
            })
        }
    }

    /// Closes the innermost frame; what it leaves must be its results.
    fn close(&mut self, label: Option<BlockId>) -> Result<(), VerifyError> {
        let frame = self.stack.exit(label)?;
        let expected = &frame.results;
        let found = &frame.types;
        let length_ok = if frame.unreachable {
            found.len() <= expected.len()
        } else {
            found.len() == expected.len()
        };
        let types_ok = length_ok
            && found
                .iter()
                .zip(&expected[expected.len().saturating_sub(found.len())..])
                .all(|(found, expected)| found.is_subtype_of(expected));
        if types_ok {
            Ok(())
        } else {
            Err(VerifyError::BlockResultMismatch {
                label,
                expected: frame.results,
                found: frame.types,
            })
        }
    }
}

/// The pops a statement evaluates before anything else, in evaluation order.
fn leading_pops(expr: &Expr) -> Vec<&Expr> {
    let mut pops = Vec::new();
    collect_leading(expr, &mut pops);
    pops
}

fn collect_leading<'e>(expr: &'e Expr, pops: &mut Vec<&'e Expr>) {
    for operand in expr.kind.operands() {
        if let ExprKind::Pop(_) = operand.kind {
            pops.push(operand);
            continue;
        }
        collect_leading(operand, pops);
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::{BlockType, IdGenerator};

    #[test]
    fn well_typed_body_passes() {
        let mut module = Module::new();
        let mut b = FunctionBuilder::new("f", &[ValType::I32], &[ValType::I32]);
        let body = vec![b.block(BlockType::single(ValType::I32), |b, label| {
            let arg = b.get_local(0);
            let one = b.i32_const(1);
            let sum = b.i32_add(arg, one);
            vec![b.break_to(label, Some(sum))]
        })];
        let function = b.finish(&mut module, body);
        assert_eq!(verify_function(&module, function), Ok(()));
    }

    #[test]
    fn setting_a_local_checks_the_type() {
        let module = Module::new();
        let mut ids = IdGenerator::new();
        let locals = vec![Local::temp(ValType::I32)];
        let value = ids.f64_const(1.0);
        let body = vec![ids.set_local(0, value)];
        assert!(matches!(
            verify_body(&module, &locals, &[], &body),
            Err(VerifyError::TypeMismatch {
                expected: ValType::I32,
                found: ValType::F64,
                ..
            })
        ));
    }

    #[test]
    fn pop_after_another_operand_is_misplaced() {
        let module = Module::new();
        let mut ids = IdGenerator::new();
        let first = ids.i32_const(1);
        let second = ids.i32_const(2);
        let pop = ids.pop(ValType::I32);
        let pop_id = pop.id;
        let sum = ids.i32_add(second, pop);
        let body = vec![first, ids.drop_value(sum)];
        assert_eq!(
            verify_body(&module, &[], &[], &body),
            Err(VerifyError::MisplacedPop { node: pop_id })
        );
    }

    #[test]
    fn leading_pops_name_the_stack_top() {
        let module = Module::new();
        let mut ids = IdGenerator::new();
        let first = ids.i32_const(1);
        let second = ids.i32_const(2);
        let left = ids.pop(ValType::I32);
        let right = ids.pop(ValType::I32);
        let sum = ids.i32_add(left, right);
        let body = vec![first, second, ids.drop_value(sum)];
        assert_eq!(verify_body(&module, &[], &[], &body), Ok(()));
    }

    #[test]
    fn blocks_must_leave_their_results() {
        let module = Module::new();
        let mut ids = IdGenerator::new();
        let label = ids.label();
        let block = ids.block_with(label, BlockType::single(ValType::I64), Vec::new());
        let body = vec![block, ids.unreachable()];
        assert_eq!(
            verify_body(&module, &[], &[], &body),
            Err(VerifyError::BlockResultMismatch {
                label: Some(label),
                expected: vec![ValType::I64],
                found: vec![],
            })
        );
    }

    #[test]
    fn branches_may_not_reach_outer_frames_for_values() {
        let module = Module::new();
        let mut ids = IdGenerator::new();
        let outer = ids.label();
        let inner = ids.label();
        let leave = ids.break_to(outer, None);
        let leave_id = leave.id;
        let inner_block = ids.block_with(inner, BlockType::empty(), vec![leave]);
        let one = ids.i32_const(1);
        let outer_block =
            ids.block_with(outer, BlockType::single(ValType::I32), vec![one, inner_block]);
        let body = vec![outer_block, ids.unreachable()];
        assert_eq!(
            verify_body(&module, &[], &[], &body),
            Err(VerifyError::BranchMismatch {
                node: leave_id,
                expected: vec![ValType::I32],
                found: vec![],
            })
        );
    }
}
