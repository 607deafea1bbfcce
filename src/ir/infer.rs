use super::{
    CompositeIndex, CompositeType, Expr, ExprKind, ExternConversionKind, Field, FieldIndex,
    HeapType, IntUnaryOp, Local, Module, RefType, ValType,
};

/// Answers which types an expression leaves on the operand stack and which types it consumes.
///
/// Inference is purely structural: it never looks at the values an operand produces, only at
/// the node itself, so it can be asked about nodes whose operands were replaced by `Pop`s.
#[derive(Debug, Clone, Copy)]
pub struct TypeInference<'a> {
    module: &'a Module,
    locals: &'a [Local],
    results: &'a [ValType],
}

impl<'a> TypeInference<'a> {
    pub fn new(module: &'a Module, locals: &'a [Local], results: &'a [ValType]) -> Self {
        Self {
            module,
            locals,
            results,
        }
    }

    pub fn module(&self) -> &'a Module {
        self.module
    }

    pub fn local_type(&self, local: usize) -> Option<&'a ValType> {
        self.locals.get(local).map(|local| &local.ty)
    }

    /// The declared results of the enclosing function.
    pub fn function_results(&self) -> &'a [ValType] {
        self.results
    }

    pub fn field(&self, ty: CompositeIndex, field: FieldIndex) -> Option<&'a Field> {
        match self.module.composites.get(ty)? {
            CompositeType::Struct { fields, .. } => fields.get(field),
            CompositeType::Array { .. } => None,
        }
    }

    pub fn element(&self, ty: CompositeIndex) -> Option<&'a Field> {
        match self.module.composites.get(ty)? {
            CompositeType::Array { element, .. } => Some(element),
            CompositeType::Struct { .. } => None,
        }
    }

    /// The types left on the stack once `expr` completed normally.
    pub fn result_types(&self, expr: &Expr) -> Vec<ValType> {
        match &expr.kind {
            ExprKind::Block(block) => block.ty.results.clone(),
            ExprKind::Conditional(conditional) => conditional.ty.results.clone(),
            ExprKind::Try(try_expr) => try_expr.ty.results.clone(),
            ExprKind::Branch { value, .. } => value
                .as_ref()
                .map(|value| self.result_types(value))
                .unwrap_or_default(),
            ExprKind::Break { .. }
            | ExprKind::Switch { .. }
            | ExprKind::Return { .. }
            | ExprKind::Unreachable
            | ExprKind::Throw { .. }
            | ExprKind::SetLocal { .. }
            | ExprKind::SetGlobal { .. }
            | ExprKind::Drop(_)
            | ExprKind::StructSet { .. }
            | ExprKind::ArraySet { .. } => Vec::new(),
            ExprKind::I32Const(_) => vec![ValType::I32],
            ExprKind::I64Const(_) => vec![ValType::I64],
            ExprKind::F32Const(_) => vec![ValType::F32],
            ExprKind::F64Const(_) => vec![ValType::F64],
            ExprKind::Null(heap) => vec![ValType::Ref(RefType::nullable(*heap))],
            ExprKind::GetLocal(local) => self.local_type(*local).cloned().into_iter().collect(),
            ExprKind::GetGlobal(global) => self
                .module
                .globals
                .get(*global)
                .map(|global| global.ty.clone())
                .into_iter()
                .collect(),
            ExprKind::IntUnary { ty, op, .. } => match op {
                IntUnaryOp::Eqz => vec![ValType::I32],
                _ => vec![ty.val_type()],
            },
            ExprKind::IntBinary { ty, op, .. } => {
                if op.is_comparison() {
                    vec![ValType::I32]
                } else {
                    vec![ty.val_type()]
                }
            }
            ExprKind::FloatUnary { ty, .. } => vec![ty.val_type()],
            ExprKind::FloatBinary { ty, op, .. } => {
                if op.is_comparison() {
                    vec![ValType::I32]
                } else {
                    vec![ty.val_type()]
                }
            }
            ExprKind::Conversion { to, .. } => vec![to.val_type()],
            ExprKind::Call { function, .. } => self
                .module
                .functions
                .get(*function)
                .and_then(|function| self.module.signatures.get(function.signature))
                .map(|ty| ty.results.clone())
                .unwrap_or_default(),
            ExprKind::IndirectCall { signature, .. }
            | ExprKind::CallReference { signature, .. } => self
                .module
                .signatures
                .get(*signature)
                .map(|ty| ty.results.clone())
                .unwrap_or_default(),
            ExprKind::FunctionReference(function) => self
                .module
                .functions
                .get(*function)
                .map(|function| {
                    ValType::Ref(RefType::non_null(HeapType::Signature(function.signature)))
                })
                .into_iter()
                .collect(),
            ExprKind::IsNull(_) | ExprKind::ReferencesEqual { .. } | ExprKind::Test { .. } => {
                vec![ValType::I32]
            }
            ExprKind::ArrayLength(_) => vec![ValType::I32],
            ExprKind::Cast { target, .. } => vec![ValType::Ref(*target)],
            ExprKind::ExternConversion { kind, .. } => match kind {
                ExternConversionKind::ExternToAny => vec![ValType::any_ref()],
                ExternConversionKind::AnyToExtern => vec![ValType::extern_ref()],
            },
            ExprKind::StructNew { ty, .. } => {
                vec![ValType::Ref(RefType::non_null(HeapType::Struct(*ty)))]
            }
            ExprKind::StructGet { ty, field, .. } => self
                .field(*ty, *field)
                .map(|field| field.ty.clone())
                .into_iter()
                .collect(),
            ExprKind::ArrayNewFixed { ty, .. } => {
                vec![ValType::Ref(RefType::non_null(HeapType::Array(*ty)))]
            }
            ExprKind::ArrayGet { ty, .. } => self
                .element(*ty)
                .map(|element| element.ty.clone())
                .into_iter()
                .collect(),
            ExprKind::Pop(ty) => vec![ty.clone()],
        }
    }

    /// The only result of `expr`, if it has exactly one.
    pub fn single_result(&self, expr: &Expr) -> Option<ValType> {
        let mut results = self.result_types(expr);
        if results.len() == 1 { results.pop() } else { None }
    }

    /// The types `expr` consumes from its operands, in evaluation order.
    ///
    /// Values carried by branches are not operands: a `Break` or `Return` carries whatever its
    /// target expects, which depends on the enclosing frames rather than on the node.
    pub fn operand_types(&self, expr: &Expr) -> Vec<ValType> {
        match &expr.kind {
            ExprKind::Block(_)
            | ExprKind::Try(_)
            | ExprKind::Break { .. }
            | ExprKind::Return { .. }
            | ExprKind::Unreachable
            | ExprKind::I32Const(_)
            | ExprKind::I64Const(_)
            | ExprKind::F32Const(_)
            | ExprKind::F64Const(_)
            | ExprKind::Null(_)
            | ExprKind::GetLocal(_)
            | ExprKind::GetGlobal(_)
            | ExprKind::FunctionReference(_)
            | ExprKind::Pop(_) => Vec::new(),
            ExprKind::Conditional(_) | ExprKind::Branch { .. } | ExprKind::Switch { .. } => {
                vec![ValType::I32]
            }
            ExprKind::Throw { tag, .. } => self
                .module
                .tags
                .get(*tag)
                .map(|tag| tag.params.clone())
                .unwrap_or_default(),
            ExprKind::SetLocal { local, .. } => {
                self.local_type(*local).cloned().into_iter().collect()
            }
            ExprKind::SetGlobal { global, .. } => self
                .module
                .globals
                .get(*global)
                .map(|global| global.ty.clone())
                .into_iter()
                .collect(),
            ExprKind::IntUnary { ty, .. } => vec![ty.val_type()],
            ExprKind::IntBinary { ty, .. } => vec![ty.val_type(), ty.val_type()],
            ExprKind::FloatUnary { ty, .. } => vec![ty.val_type()],
            ExprKind::FloatBinary { ty, .. } => vec![ty.val_type(), ty.val_type()],
            ExprKind::Conversion { from, .. } => vec![from.val_type()],
            ExprKind::Drop(value) => self.result_types(value),
            ExprKind::Call { function, .. } => self
                .module
                .functions
                .get(*function)
                .and_then(|function| self.module.signatures.get(function.signature))
                .map(|ty| ty.params.clone())
                .unwrap_or_default(),
            ExprKind::IndirectCall { signature, .. } => {
                let mut params = self
                    .module
                    .signatures
                    .get(*signature)
                    .map(|ty| ty.params.clone())
                    .unwrap_or_default();
                params.push(ValType::I32);
                params
            }
            ExprKind::CallReference { signature, .. } => {
                let mut params = self
                    .module
                    .signatures
                    .get(*signature)
                    .map(|ty| ty.params.clone())
                    .unwrap_or_default();
                params.push(ValType::Ref(RefType::nullable(HeapType::Signature(
                    *signature,
                ))));
                params
            }
            ExprKind::IsNull(value) => match self.single_result(value) {
                Some(ValType::Ref(ty)) => vec![ValType::Ref(RefType::nullable(ty.heap.top()))],
                Some(other) => vec![other],
                None => Vec::new(),
            },
            ExprKind::ReferencesEqual { .. } => {
                let eq_ref = ValType::Ref(RefType::nullable(HeapType::Eq));
                vec![eq_ref.clone(), eq_ref]
            }
            ExprKind::Cast { target, .. } | ExprKind::Test { target, .. } => {
                vec![ValType::Ref(RefType::nullable(target.heap.top()))]
            }
            ExprKind::ExternConversion { kind, .. } => match kind {
                ExternConversionKind::ExternToAny => vec![ValType::extern_ref()],
                ExternConversionKind::AnyToExtern => vec![ValType::any_ref()],
            },
            ExprKind::StructNew { ty, fields } => match self.module.composites.get(*ty) {
                Some(CompositeType::Struct { fields, .. }) => {
                    fields.iter().map(|field| field.ty.clone()).collect()
                }
                _ => vec![ValType::any_ref(); fields.len()],
            },
            ExprKind::StructGet { ty, .. } => {
                vec![ValType::Ref(RefType::nullable(HeapType::Struct(*ty)))]
            }
            ExprKind::StructSet { ty, field, .. } => {
                let mut types = vec![ValType::Ref(RefType::nullable(HeapType::Struct(*ty)))];
                types.extend(self.field(*ty, *field).map(|field| field.ty.clone()));
                types
            }
            ExprKind::ArrayNewFixed { ty, elements } => match self.element(*ty) {
                Some(element) => vec![element.ty.clone(); elements.len()],
                None => Vec::new(),
            },
            ExprKind::ArrayGet { ty, .. } => vec![
                ValType::Ref(RefType::nullable(HeapType::Array(*ty))),
                ValType::I32,
            ],
            ExprKind::ArraySet { ty, .. } => {
                let mut types = vec![
                    ValType::Ref(RefType::nullable(HeapType::Array(*ty))),
                    ValType::I32,
                ];
                types.extend(self.element(*ty).map(|element| element.ty.clone()));
                types
            }
            ExprKind::ArrayLength(value) => self.result_types(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::{BlockType, IntBinaryOp, IntType};

    #[test]
    fn comparisons_produce_i32() {
        let module = Module::new();
        let mut builder = FunctionBuilder::new("f", &[ValType::I64], &[]);
        let first = builder.get_local(0);
        let second = builder.i64_const(3);
        let compare =
            builder.int_binary(IntType::I64, IntBinaryOp::LtSigned, first, second);
        let locals = builder.locals().to_vec();
        let infer = TypeInference::new(&module, &locals, &[]);
        assert_eq!(infer.result_types(&compare), vec![ValType::I32]);
        assert_eq!(infer.operand_types(&compare), vec![ValType::I64, ValType::I64]);
    }

    #[test]
    fn branch_keeps_its_value() {
        let module = Module::new();
        let mut builder = FunctionBuilder::new("f", &[], &[]);
        let block = builder.block(BlockType::single(ValType::F64), |b, label| {
            let value = b.f64_const(1.5);
            let condition = b.i32_const(1);
            vec![b.branch_if(label, condition, Some(value))]
        });
        let locals = builder.locals().to_vec();
        let infer = TypeInference::new(&module, &locals, &[]);
        let ExprKind::Block(inner) = &block.kind else {
            panic!("expected a block");
        };
        assert_eq!(infer.result_types(&inner.body[0]), vec![ValType::F64]);
        assert_eq!(infer.operand_types(&inner.body[0]), vec![ValType::I32]);
        assert_eq!(infer.result_types(&block), vec![ValType::F64]);
    }

    #[test]
    fn function_references_are_exact() {
        let mut module = Module::new();
        let sig = module.intern_signature(vec![ValType::I32], vec![ValType::I32]);
        let callee = module.import_function("callee", sig);
        let mut builder = FunctionBuilder::new("f", &[], &[]);
        let reference = builder.expr(ExprKind::FunctionReference(callee));
        let infer = TypeInference::new(&module, &[], &[]);
        assert_eq!(
            infer.single_result(&reference),
            Some(ValType::Ref(RefType::non_null(HeapType::Signature(sig))))
        );
    }
}
