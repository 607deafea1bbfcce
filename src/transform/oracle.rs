use std::collections::HashSet;

use crate::ir::{Expr, NodeId};

/// Tells whether evaluating a node may suspend the running fiber.
///
/// Answers must be transitive: a node suspends if any of its operands or nested bodies does.
pub trait SuspensionOracle {
    fn is_suspending(&self, node: NodeId) -> bool;

    fn any_suspending(&self, exprs: &[Expr]) -> bool {
        exprs.iter().any(|expr| self.is_suspending(expr.id))
    }
}

/// Marks every node that contains a call flagged as a suspension point.
#[derive(Debug, Clone, Default)]
pub struct SuspensionPointCollector {
    suspending: HashSet<NodeId>,
}

impl SuspensionPointCollector {
    pub fn collect(body: &[Expr]) -> Self {
        let mut collector = Self::default();
        for expr in body {
            collector.visit(expr);
        }
        collector
    }

    /// Number of suspending nodes.
    pub fn len(&self) -> usize {
        self.suspending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suspending.is_empty()
    }

    fn visit(&mut self, expr: &Expr) -> bool {
        let mut suspending = expr.kind.is_suspension_point();
        for operand in expr.kind.operands() {
            suspending |= self.visit(operand);
        }
        for body in expr.kind.bodies() {
            for nested in body {
                suspending |= self.visit(nested);
            }
        }
        if suspending {
            self.suspending.insert(expr.id);
        }
        suspending
    }
}

impl SuspensionOracle for SuspensionPointCollector {
    fn is_suspending(&self, node: NodeId) -> bool {
        self.suspending.contains(&node)
    }
}
