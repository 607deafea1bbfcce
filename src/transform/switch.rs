use std::collections::HashMap;

use typed_generational_arena::{SmallSlab, SmallSlabIndex};

use super::TransformError;
use crate::ir::{BlockId, BlockType, Expr, ExprKind, IdGenerator, LocalIndex, NodeId};

pub type ContainerIndex = SmallSlabIndex<SwitchContainer>;

/// A dispatch table guarding one scope of the rewritten body.
///
/// Target `i` is where execution continues for resume state `base + i`.
#[derive(Debug, Clone)]
pub struct SwitchContainer {
    pub parent: Option<ContainerIndex>,
    /// The `Switch` node that dispatches on the resume state.
    pub switch: NodeId,
    pub base: i32,
    pub targets: Vec<BlockId>,
    /// Set while a nested scope of this container is being built.
    pub jump_inside: Option<BlockId>,
}

/// A finished dispatch table, reported in the transformation summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTable {
    pub switch: NodeId,
    pub base: i32,
    pub targets: Vec<BlockId>,
}

#[derive(Debug)]
pub struct SwitchContainers {
    containers: SmallSlab<SwitchContainer>,
}

impl SwitchContainers {
    pub fn new() -> Self {
        Self {
            containers: SmallSlab::new(),
        }
    }

    /// Creates a container and its dispatcher:
    /// `outer { inner { switch(selector) default=inner } unreachable }`.
    ///
    /// Target 0 leaves `outer`, so a fresh start falls into the code that follows.
    pub fn create(
        &mut self,
        parent: Option<ContainerIndex>,
        base: i32,
        state_local: LocalIndex,
        ids: &mut IdGenerator,
    ) -> (ContainerIndex, Expr) {
        let state = ids.get_local(state_local);
        let selector = if base > 0 {
            let offset = ids.i32_const(base);
            ids.i32_sub(state, offset)
        } else {
            state
        };
        let outer = ids.label();
        let inner = ids.label();
        let switch = ids.switch(selector, Vec::new(), inner);
        let switch_id = switch.id;
        let inner_block = ids.block_with(inner, BlockType::empty(), vec![switch]);
        let unreachable = ids.unreachable();
        let dispatcher = ids.block_with(outer, BlockType::empty(), vec![inner_block, unreachable]);
        let index = self.containers.insert(SwitchContainer {
            parent,
            switch: switch_id,
            base,
            targets: vec![outer],
            jump_inside: None,
        });
        (index, dispatcher)
    }

    pub fn get(&self, index: ContainerIndex) -> &SwitchContainer {
        &self.containers[index]
    }

    pub fn add_target(&mut self, index: ContainerIndex, target: BlockId) {
        self.containers[index].targets.push(target);
    }

    pub fn set_jump_inside(&mut self, index: ContainerIndex, label: Option<BlockId>) {
        self.containers[index].jump_inside = label;
    }

    /// Makes every enclosing table jump into the scope that leads to the newest state.
    pub fn add_jumps_to_outer_switches(
        &mut self,
        index: ContainerIndex,
    ) -> Result<(), TransformError> {
        let mut current = self.containers[index].parent;
        while let Some(ancestor) = current {
            let container = &mut self.containers[ancestor];
            let jump_inside = container
                .jump_inside
                .ok_or(TransformError::MissingJumpInside {
                    switch: container.switch,
                })?;
            container.targets.push(jump_inside);
            current = container.parent;
        }
        Ok(())
    }

    /// Finished tables ordered by base state.
    pub fn into_tables(self) -> Vec<DispatchTable> {
        let mut tables: Vec<DispatchTable> = self
            .containers
            .iter()
            .map(|(_, container)| DispatchTable {
                switch: container.switch,
                base: container.base,
                targets: container.targets.clone(),
            })
            .collect();
        tables.sort_by_key(|table| table.base);
        tables
    }
}

/// Writes the collected targets into their `Switch` nodes.
pub fn install_targets(body: &mut [Expr], tables: &[DispatchTable]) {
    let targets: HashMap<NodeId, &[BlockId]> = tables
        .iter()
        .map(|table| (table.switch, table.targets.as_slice()))
        .collect();
    for expr in body {
        install(expr, &targets);
    }
}

fn install(expr: &mut Expr, tables: &HashMap<NodeId, &[BlockId]>) {
    if let ExprKind::Switch { targets, .. } = &mut expr.kind {
        if let Some(collected) = tables.get(&expr.id) {
            *targets = collected.to_vec();
        }
    }
    for operand in expr.kind.operands_mut() {
        install(operand, tables);
    }
    for body in expr.kind.bodies_mut() {
        for nested in body.iter_mut() {
            install(nested, tables);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_subtracts_the_base() {
        let mut ids = IdGenerator::new();
        let mut containers = SwitchContainers::new();
        let (_, dispatcher) = containers.create(None, 3, 0, &mut ids);
        let ExprKind::Block(outer) = &dispatcher.kind else {
            panic!("expected the outer block");
        };
        let ExprKind::Block(inner) = &outer.body[0].kind else {
            panic!("expected the inner block");
        };
        let ExprKind::Switch {
            selector, default, ..
        } = &inner.body[0].kind
        else {
            panic!("expected the switch");
        };
        assert_eq!(*default, inner.label);
        assert!(matches!(selector.kind, ExprKind::IntBinary { .. }));
        assert!(matches!(outer.body[1].kind, ExprKind::Unreachable));
    }

    #[test]
    fn ancestors_receive_jump_inside_targets() {
        let mut ids = IdGenerator::new();
        let mut containers = SwitchContainers::new();
        let (root, _) = containers.create(None, 0, 0, &mut ids);
        let jump = ids.label();
        containers.set_jump_inside(root, Some(jump));
        let (nested, _) = containers.create(Some(root), 1, 0, &mut ids);
        containers.add_jumps_to_outer_switches(nested).unwrap();
        assert_eq!(containers.get(root).targets.len(), 2);
        assert_eq!(containers.get(root).targets[1], jump);

        containers.set_jump_inside(root, None);
        assert!(matches!(
            containers.add_jumps_to_outer_switches(nested),
            Err(TransformError::MissingJumpInside { .. })
        ));
    }

    #[test]
    fn targets_are_installed_by_node_id() {
        let mut ids = IdGenerator::new();
        let mut containers = SwitchContainers::new();
        let (root, dispatcher) = containers.create(None, 0, 0, &mut ids);
        let extra = ids.label();
        containers.add_target(root, extra);
        let tables = containers.into_tables();
        let mut body = vec![dispatcher];
        install_targets(&mut body, &tables);

        let ExprKind::Block(outer) = &body[0].kind else {
            panic!("expected the outer block");
        };
        let ExprKind::Block(inner) = &outer.body[0].kind else {
            panic!("expected the inner block");
        };
        let ExprKind::Switch { targets, .. } = &inner.body[0].kind else {
            panic!("expected the switch");
        };
        assert_eq!(targets, &vec![outer.label, extra]);
    }
}
