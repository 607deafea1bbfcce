use thiserror::Error;

use crate::check::VerifyError;
use crate::ir::{BlockId, NodeId, ValType};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    #[error("branch to label {target:?} which is not open")]
    BranchTargetNotOpen { target: Option<BlockId> },
    #[error("tried to close {expected:?} but the innermost frame is {found:?}")]
    ControlStackMismatch {
        expected: Option<BlockId>,
        found: Option<BlockId>,
    },
    #[error("operand stack underflow in frame {label:?}")]
    StackUnderflow { label: Option<BlockId> },
    #[error("no dispatch table is open")]
    NoOpenContainer,
    #[error("call {node:?} passes {found} operands but its callee takes {expected}")]
    ArityMismatch {
        node: NodeId,
        expected: usize,
        found: usize,
    },
    #[error("propagated types were never applied to labels {labels:?}")]
    DanglingPropagation { labels: Vec<BlockId> },
    #[error("dispatch table {switch:?} has no jump-inside block for a nested table")]
    MissingJumpInside { switch: NodeId },
    #[error("pop node {node:?} found in source code")]
    UnexpectedPop { node: NodeId },
    #[error("node {node:?} must be split with an empty operand stack, found {pending} pending values")]
    OperandsAcrossScope { node: NodeId, pending: usize },
    #[error("operand {node:?} of a suspending node produces {count} values, expected one")]
    MultiValueOperand { node: NodeId, count: usize },
    #[error("type {ty} has no default value")]
    NoDefaultValue { ty: ValType },
    #[error("function {function:?} has no body")]
    MissingBody { function: String },
    #[error("runtime function {name:?} has signature {found}, expected {expected}")]
    RuntimeSignatureMismatch {
        name: String,
        expected: String,
        found: String,
    },
    #[error("rewritten body does not verify: {0}")]
    Verification(Box<VerifyError>),
    #[error("in function {function:?}: {source}")]
    InFunction {
        function: String,
        #[source]
        source: Box<TransformError>,
    },
}
