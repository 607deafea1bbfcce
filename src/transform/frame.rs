//! Entry and exit code of a transformed function.
//!
//! The prologue finds the current fiber and, when resuming, restores the resume state and every
//! original local. The epilogue runs only after a suspend check left the main block: it saves
//! the same values in the opposite order and returns placeholder results.

use super::codec::CoroutineFunctions;
use super::{TransformError, default_value};
use crate::ir::{BlockType, Conditional, Expr, ExprKind, IdGenerator, Local, LocalIndex, Module, ValType};

/// Locals added by the transformation.
#[derive(Debug, Clone, Copy)]
pub struct FrameLocals {
    pub state: LocalIndex,
    pub fiber: LocalIndex,
}

pub fn generate_prologue(
    module: &mut Module,
    functions: &mut CoroutineFunctions,
    ids: &mut IdGenerator,
    original_locals: &[Local],
    frame: FrameLocals,
) -> Result<Vec<Expr>, TransformError> {
    let current = functions.current(module, ids)?;
    let set_fiber = ids.set_local(frame.fiber, current);

    let mut restore = Vec::with_capacity(original_locals.len() + 1);
    let state = functions.restore_value(module, ids, &ValType::I32, frame.fiber)?;
    restore.push(ids.set_local(frame.state, state));
    for (index, local) in original_locals.iter().enumerate().rev() {
        let value = functions.restore_value(module, ids, &local.ty, frame.fiber)?;
        restore.push(ids.set_local(index, value));
    }

    let zero = ids.i32_const(0);
    let fresh = vec![ids.set_local(frame.state, zero)];

    let condition = functions.is_resuming(module, ids, frame.fiber)?;
    let label = ids.label();
    let dispatch = ids.expr(ExprKind::Conditional(Conditional {
        label,
        condition: Box::new(condition),
        then_body: restore,
        else_body: fresh,
        ty: BlockType::empty(),
    }));
    Ok(vec![set_fiber, dispatch])
}

pub fn generate_epilogue(
    module: &mut Module,
    functions: &mut CoroutineFunctions,
    ids: &mut IdGenerator,
    original_locals: &[Local],
    frame: FrameLocals,
    results: &[ValType],
) -> Result<Vec<Expr>, TransformError> {
    let mut epilogue = Vec::with_capacity(original_locals.len() + results.len() + 1);
    for (index, local) in original_locals.iter().enumerate() {
        let value = ids.get_local(index);
        epilogue.push(functions.save_value(module, ids, &local.ty, frame.fiber, value)?);
    }
    let state = ids.get_local(frame.state);
    epilogue.push(functions.save_value(module, ids, &ValType::I32, frame.fiber, state)?);
    for ty in results {
        epilogue.push(default_value(ids, ty)?);
    }
    Ok(epilogue)
}
