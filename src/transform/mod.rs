//! The coroutine transformation.
//!
//! A function that contains suspension points is rewritten into a state machine. Every call that
//! may suspend gets a resume state; on suspension the live operand values, the locals and the
//! state are pushed onto the fiber, and on resume the prologue pops them back and dispatch tables
//! jump straight to the suspended call.

use serde::{Deserialize, Serialize};
use tracing::{Span, debug, instrument, trace};

use crate::check;
use crate::ir::{
    Expr, ExprKind, FuncIndex, FunctionBody, IdGenerator, Module, ValType, display,
};

pub mod codec;
mod errors;
pub mod frame;
pub mod oracle;
pub mod propagation;
pub mod stack;
pub mod switch;
mod visitor;

pub use codec::{CoroutineFunctions, RuntimeNames};
pub use errors::TransformError;
pub use oracle::{SuspensionOracle, SuspensionPointCollector};
pub use switch::DispatchTable;
pub use visitor::FunctionTransformer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformOptions {
    /// Run the structural checker on every rewritten body.
    pub verify: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self { verify: true }
    }
}

/// What the transformation did to one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformSummary {
    pub function: String,
    /// Number of resume states, including the fresh start of every dispatch table.
    pub resume_states: u32,
    pub dispatch_tables: Vec<DispatchTable>,
}

/// Transforms the functions of one module. The runtime support functions are resolved once and
/// shared by every function.
pub struct CoroutineTransformation<'m> {
    module: &'m mut Module,
    functions: CoroutineFunctions,
    options: TransformOptions,
}

impl<'m> CoroutineTransformation<'m> {
    pub fn new(module: &'m mut Module, names: RuntimeNames, options: TransformOptions) -> Self {
        Self {
            module,
            functions: CoroutineFunctions::new(names),
            options,
        }
    }

    pub fn module(&self) -> &Module {
        self.module
    }

    /// Rewrites `function` in place.
    ///
    /// Returns `None` when the body has no suspension point; the function is then left as is.
    /// On error the module is left as it was, including the runtime imports and the fiber type
    /// a partial rewrite would have declared.
    #[instrument(level = "debug", skip_all, fields(function = tracing::field::Empty))]
    pub fn transform_function(
        &mut self,
        function: FuncIndex,
    ) -> Result<Option<TransformSummary>, TransformError> {
        let name = self.module.function(function).name.clone();
        Span::current().record("function", name.as_str());
        self.transform_body(function, &name)
            .map_err(|source| TransformError::InFunction {
                function: name,
                source: Box::new(source),
            })
    }

    fn transform_body(
        &mut self,
        function: FuncIndex,
        name: &str,
    ) -> Result<Option<TransformSummary>, TransformError> {
        let results = self.module.function_type(function).results.clone();
        let body = self
            .module
            .function(function)
            .body
            .clone()
            .ok_or_else(|| TransformError::MissingBody {
                function: name.to_string(),
            })?;
        reject_pops(&body.exprs)?;

        let oracle = SuspensionPointCollector::collect(&body.exprs);
        if oracle.is_empty() {
            debug!("no suspension points");
            return Ok(None);
        }
        debug!(suspending = oracle.len(), "transforming");

        // Runtime imports and the fiber type are declared while rewriting.
        let checkpoint = (self.module.clone(), self.functions.clone());
        let outcome = self.rewrite(function, name, body, &results, &oracle);
        if outcome.is_err() {
            (*self.module, self.functions) = checkpoint;
        }
        outcome.map(Some)
    }

    fn rewrite(
        &mut self,
        function: FuncIndex,
        name: &str,
        body: FunctionBody,
        results: &[ValType],
        oracle: &SuspensionPointCollector,
    ) -> Result<TransformSummary, TransformError> {
        let transformer = FunctionTransformer::new(
            self.module,
            &mut self.functions,
            oracle,
            body.locals,
            body.ids,
            results.to_vec(),
        );
        let mut rewritten = transformer.run(body.exprs)?;
        propagation::propagate_types(
            &*self.module,
            &rewritten.locals,
            results,
            &mut rewritten.exprs,
        )?;

        if self.options.verify {
            check::verify_body(&*self.module, &rewritten.locals, results, &rewritten.exprs)
                .map_err(|error| TransformError::Verification(Box::new(error)))?;
        }
        trace!("rewritten body:\n{}", display::render(&rewritten.exprs));

        let summary = TransformSummary {
            function: name.to_string(),
            resume_states: rewritten.resume_states,
            dispatch_tables: rewritten.dispatch_tables,
        };
        if let Some(target) = self.module.functions.get_mut(function) {
            if let Some(body) = target.body.as_mut() {
                body.locals = rewritten.locals;
                body.exprs = rewritten.exprs;
                body.ids = rewritten.ids;
            }
        }
        Ok(summary)
    }
}

/// The placeholder used where a value is needed but never observed: zero or a typed null.
pub(crate) fn default_value(ids: &mut IdGenerator, ty: &ValType) -> Result<Expr, TransformError> {
    Ok(match ty {
        ValType::I32 => ids.i32_const(0),
        ValType::I64 => ids.i64_const(0),
        ValType::F32 => ids.f32_const(0.0),
        ValType::F64 => ids.f64_const(0.0),
        ValType::Ref(ty) if ty.nullable => ids.null(ty.heap),
        ValType::Ref(_) => return Err(TransformError::NoDefaultValue { ty: ty.clone() }),
    })
}

fn reject_pops(body: &[Expr]) -> Result<(), TransformError> {
    for expr in body {
        if let ExprKind::Pop(_) = expr.kind {
            return Err(TransformError::UnexpectedPop { node: expr.id });
        }
        for operand in expr.kind.operands() {
            reject_pops(std::slice::from_ref(operand))?;
        }
        for nested in expr.kind.bodies() {
            reject_pops(nested)?;
        }
    }
    Ok(())
}
