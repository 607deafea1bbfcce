//! S-expression rendering of function bodies, used in trace logs and assertion messages.

use std::fmt::{self, Write};

use itertools::Itertools;

use super::{Expr, ExprKind, ExternConversionKind, FloatType, IntType};

/// Renders a statement list, one node per line.
pub fn render(body: &[Expr]) -> String {
    let mut out = String::new();
    let mut printer = Printer {
        out: &mut out,
        indent: 0,
    };
    // Writing into a String never fails.
    let _ = printer.list(body);
    out
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        Printer {
            out: &mut out,
            indent: 0,
        }
        .expr(self)?;
        f.write_str(out.trim_end())
    }
}

struct Printer<'a> {
    out: &'a mut String,
    indent: usize,
}

impl Printer<'_> {
    fn line(&mut self, text: &str) -> fmt::Result {
        writeln!(self.out, "{:width$}{text}", "", width = self.indent * 2)
    }

    fn list(&mut self, body: &[Expr]) -> fmt::Result {
        for expr in body {
            self.expr(expr)?;
        }
        Ok(())
    }

    fn nested(&mut self, header: String, bodies: &[(&str, &[Expr])]) -> fmt::Result {
        self.line(&format!("({}", header.trim_end()))?;
        self.indent += 1;
        for (name, body) in bodies {
            if name.is_empty() {
                self.list(body)?;
            } else {
                self.line(&format!("({name}"))?;
                self.indent += 1;
                self.list(body)?;
                self.indent -= 1;
                self.line(")")?;
            }
        }
        self.indent -= 1;
        self.line(")")
    }

    fn expr(&mut self, expr: &Expr) -> fmt::Result {
        match &expr.kind {
            ExprKind::Block(block) => {
                let keyword = if block.is_loop { "loop" } else { "block" };
                self.nested(
                    format!("{keyword} $L{} {}", block.label.0, block.ty),
                    &[("", block.body.as_slice())],
                )
            }
            ExprKind::Conditional(conditional) => self.nested(
                format!(
                    "if $L{} {} {}",
                    conditional.label.0,
                    conditional.ty,
                    inline(&conditional.condition)
                ),
                &[
                    ("then", conditional.then_body.as_slice()),
                    ("else", conditional.else_body.as_slice()),
                ],
            ),
            ExprKind::Try(try_expr) => {
                let headers = try_expr
                    .catches
                    .iter()
                    .map(|c| format!("catch {}", c.tag.to_idx()))
                    .collect_vec();
                let mut bodies: Vec<(&str, &[Expr])> = vec![("do", try_expr.body.as_slice())];
                for (header, catch) in headers.iter().zip(&try_expr.catches) {
                    bodies.push((header.as_str(), catch.body.as_slice()));
                }
                self.nested(
                    format!("try $L{} {}", try_expr.label.0, try_expr.ty),
                    &bodies,
                )
            }
            _ => self.line(&inline(expr)),
        }
    }
}

/// One-line form of a non-structured node.
fn inline(expr: &Expr) -> String {
    let operands = expr.kind.operands().into_iter().map(inline).join(" ");
    let head = match &expr.kind {
        ExprKind::Block(block) => return format!("(block $L{} ...)", block.label.0),
        ExprKind::Conditional(conditional) => {
            return format!("(if $L{} ...)", conditional.label.0);
        }
        ExprKind::Try(try_expr) => return format!("(try $L{} ...)", try_expr.label.0),
        ExprKind::Branch { target, .. } => format!("br_if $L{}", target.0),
        ExprKind::Break { target, .. } => format!("br $L{}", target.0),
        ExprKind::Switch {
            targets, default, ..
        } => format!(
            "br_table [{}] $L{}",
            targets.iter().map(|t| format!("$L{}", t.0)).join(" "),
            default.0
        ),
        ExprKind::Return { .. } => "return".to_string(),
        ExprKind::Unreachable => "unreachable".to_string(),
        ExprKind::Throw { tag, .. } => format!("throw {}", tag.to_idx()),
        ExprKind::I32Const(value) => format!("i32.const {value}"),
        ExprKind::I64Const(value) => format!("i64.const {value}"),
        ExprKind::F32Const(value) => format!("f32.const {value}"),
        ExprKind::F64Const(value) => format!("f64.const {value}"),
        ExprKind::Null(heap) => format!("ref.null {heap}"),
        ExprKind::GetLocal(local) => format!("local.get {local}"),
        ExprKind::SetLocal { local, .. } => format!("local.set {local}"),
        ExprKind::GetGlobal(global) => format!("global.get {}", global.to_idx()),
        ExprKind::SetGlobal { global, .. } => format!("global.set {}", global.to_idx()),
        ExprKind::IntUnary { ty, op, .. } => format!("{}.{op:?}", int_prefix(*ty)),
        ExprKind::IntBinary { ty, op, .. } => format!("{}.{op:?}", int_prefix(*ty)),
        ExprKind::FloatUnary { ty, op, .. } => format!("{}.{op:?}", float_prefix(*ty)),
        ExprKind::FloatBinary { ty, op, .. } => format!("{}.{op:?}", float_prefix(*ty)),
        ExprKind::Conversion {
            from, to, signed, ..
        } => format!(
            "{}.convert_{}{}",
            to.val_type(),
            from.val_type(),
            if *signed { "_s" } else { "_u" }
        ),
        ExprKind::Drop(_) => "drop".to_string(),
        ExprKind::Call {
            function,
            suspension_point,
            ..
        } => format!(
            "call {}{}",
            function.to_idx(),
            if *suspension_point { " suspend" } else { "" }
        ),
        ExprKind::IndirectCall {
            signature,
            suspension_point,
            ..
        } => format!(
            "call_indirect $sig{}{}",
            signature.to_idx(),
            if *suspension_point { " suspend" } else { "" }
        ),
        ExprKind::CallReference {
            signature,
            suspension_point,
            ..
        } => format!(
            "call_ref $sig{}{}",
            signature.to_idx(),
            if *suspension_point { " suspend" } else { "" }
        ),
        ExprKind::FunctionReference(function) => format!("ref.func {}", function.to_idx()),
        ExprKind::IsNull(_) => "ref.is_null".to_string(),
        ExprKind::ReferencesEqual { .. } => "ref.eq".to_string(),
        ExprKind::Cast { target, .. } => format!("ref.cast {target}"),
        ExprKind::Test { target, .. } => format!("ref.test {target}"),
        ExprKind::ExternConversion { kind, .. } => match kind {
            ExternConversionKind::ExternToAny => "any.convert_extern".to_string(),
            ExternConversionKind::AnyToExtern => "extern.convert_any".to_string(),
        },
        ExprKind::StructNew { ty, .. } => format!("struct.new {}", ty.to_idx()),
        ExprKind::StructGet { ty, field, .. } => format!("struct.get {} {field}", ty.to_idx()),
        ExprKind::StructSet { ty, field, .. } => format!("struct.set {} {field}", ty.to_idx()),
        ExprKind::ArrayNewFixed { ty, elements } => {
            format!("array.new_fixed {} {}", ty.to_idx(), elements.len())
        }
        ExprKind::ArrayGet { ty, .. } => format!("array.get {}", ty.to_idx()),
        ExprKind::ArraySet { ty, .. } => format!("array.set {}", ty.to_idx()),
        ExprKind::ArrayLength(_) => "array.len".to_string(),
        ExprKind::Pop(ty) => format!("pop {ty}"),
    };
    if operands.is_empty() {
        format!("({head})")
    } else {
        format!("({head} {operands})")
    }
}

const fn int_prefix(ty: IntType) -> &'static str {
    match ty {
        IntType::I32 => "i32",
        IntType::I64 => "i64",
    }
}

const fn float_prefix(ty: FloatType) -> &'static str {
    match ty {
        FloatType::F32 => "f32",
        FloatType::F64 => "f64",
    }
}
