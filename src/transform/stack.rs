use std::collections::HashMap;

use tracing::trace;

use super::TransformError;
use crate::ir::{BlockId, ValType};

/// One open structured construct and the types pushed inside it so far.
#[derive(Debug, Clone)]
pub struct Frame {
    /// `None` for the function frame.
    pub label: Option<BlockId>,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    pub is_loop: bool,
    /// The frame's own operand stack, starting with its params.
    pub types: Vec<ValType>,
    /// Set after a terminating node; pops are then polymorphic.
    pub unreachable: bool,
}

impl Frame {
    /// The values a branch to this frame carries.
    pub fn label_types(&self) -> &[ValType] {
        if self.is_loop {
            &self.params
        } else {
            &self.results
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PropagationState {
    depth: usize,
}

/// Tracks open frames and the values that must be threaded through them so every branch finds
/// its carried values in the frame it is taken from.
#[derive(Debug, Default)]
pub struct BlockStack {
    frames: Vec<Frame>,
    propagation: HashMap<BlockId, PropagationState>,
}

impl BlockStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn current(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Opens a frame. The caller already took `params` off the enclosing frame.
    pub fn enter(
        &mut self,
        label: Option<BlockId>,
        params: Vec<ValType>,
        results: Vec<ValType>,
        is_loop: bool,
    ) {
        self.frames.push(Frame {
            label,
            types: params.clone(),
            params,
            results,
            is_loop,
            unreachable: false,
        });
    }

    /// Closes the innermost frame, which must be `label`.
    pub fn exit(&mut self, label: Option<BlockId>) -> Result<Frame, TransformError> {
        match self.frames.last() {
            Some(frame) if frame.label == label => {}
            found => {
                return Err(TransformError::ControlStackMismatch {
                    expected: label,
                    found: found.and_then(|frame| frame.label),
                });
            }
        }
        self.frames
            .pop()
            .ok_or(TransformError::ControlStackMismatch {
                expected: label,
                found: None,
            })
    }

    pub fn push(&mut self, ty: ValType) {
        if let Some(frame) = self.frames.last_mut() {
            frame.types.push(ty);
        }
    }

    pub fn push_all(&mut self, types: &[ValType]) {
        for ty in types {
            self.push(ty.clone());
        }
    }

    /// Pops from the innermost frame. `None` means the frame is unreachable and the value is
    /// polymorphic.
    pub fn pop(&mut self) -> Result<Option<ValType>, TransformError> {
        let frame = self
            .frames
            .last_mut()
            .ok_or(TransformError::StackUnderflow { label: None })?;
        match frame.types.pop() {
            Some(ty) => Ok(Some(ty)),
            None if frame.unreachable => Ok(None),
            None => Err(TransformError::StackUnderflow { label: frame.label }),
        }
    }

    pub fn pop_many(&mut self, count: usize) -> Result<(), TransformError> {
        for _ in 0..count {
            self.pop()?;
        }
        Ok(())
    }

    pub fn mark_unreachable(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.types.clear();
            frame.unreachable = true;
        }
    }

    /// Position of the frame a branch to `target` leaves, searching from the innermost.
    pub fn find(&self, target: Option<BlockId>) -> Result<usize, TransformError> {
        self.frames
            .iter()
            .rposition(|frame| frame.label == target)
            .ok_or(TransformError::BranchTargetNotOpen { target })
    }

    pub fn frame(&self, position: usize) -> Option<&Frame> {
        self.frames.get(position)
    }

    /// Number of values a branch to `target` carries.
    pub fn branch_arity(&self, target: Option<BlockId>) -> Result<usize, TransformError> {
        let position = self.find(target)?;
        Ok(self.frames[position].label_types().len())
    }

    /// Records that a branch to `target` needs values pushed in outer frames.
    ///
    /// Nothing is recorded when the branch leaves only the innermost frame or when the innermost
    /// frame holds enough values by itself.
    pub fn update_propagation(
        &mut self,
        target: Option<BlockId>,
        arity: usize,
    ) -> Result<(), TransformError> {
        let position = self.find(target)?;
        let top = self.frames.len() - 1;
        if position == top || self.frames[top].types.len() >= arity {
            return Ok(());
        }
        for frame in &self.frames[position + 1..] {
            // Only the function frame is unlabeled and it is never strictly inside a target.
            let Some(label) = frame.label else {
                continue;
            };
            let state = self
                .propagation
                .entry(label)
                .or_insert(PropagationState { depth: position });
            state.depth = state.depth.min(position);
        }
        trace!(?target, arity, position, "recorded type propagation");
        Ok(())
    }

    /// Removes the record of the innermost frame and returns the types it must thread through,
    /// outermost first.
    pub fn take_propagation(&mut self, label: BlockId) -> Option<Vec<ValType>> {
        let state = self.propagation.remove(&label)?;
        let top = self.frames.len().checked_sub(1)?;
        let types: Vec<ValType> = self.frames[state.depth..top]
            .iter()
            .flat_map(|frame| frame.types.iter().cloned())
            .collect();
        Some(types)
    }

    /// Fails if a recorded propagation was never applied.
    pub fn finish(&self) -> Result<(), TransformError> {
        if self.propagation.is_empty() {
            return Ok(());
        }
        let mut labels: Vec<BlockId> = self.propagation.keys().copied().collect();
        labels.sort();
        Err(TransformError::DanglingPropagation { labels })
    }
}
