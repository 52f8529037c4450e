//! Expression lowering and conditional branches.

use pylower_common::ir::{Constant, Label, UnitKind};
use pylower_common::ir_opcodes::{BinaryOperator, ComparisonOperator, FormatFlags, Intrinsic1};
use pylower_common::Opcode;
use tracing::warn;

use super::call::STACK_USE_GUIDELINE;
use super::comprehension::CompKind;
use super::compiler::{Compiler, NameCtx};
use crate::ast::{self, BoolOperator, CmpOperator, Conversion, Expr, ExprKind, Operator, UnaryOperator};
use crate::error::{CompileError, CompileErrorKind, CompileResult};

impl<'a> Compiler<'a> {
    /// Push the value of `expr`.
    pub(crate) fn visit_expr(&mut self, expr: &'a Expr) -> CompileResult<()> {
        let saved = self.loc;
        self.loc = Some(expr.span);
        let result = self.nested(|c| c.lower_expr(expr));
        self.loc = saved;
        result
    }

    fn lower_expr(&mut self, expr: &'a Expr) -> CompileResult<()> {
        let loc = Some(expr.span);
        match &expr.kind {
            ExprKind::BoolOp { op, values } => self.compile_boolop(*op, values),
            ExprKind::NamedExpr { target, value } => {
                self.visit_expr(value)?;
                self.emit_arg(Opcode::Copy, 1)?;
                self.compile_store(target)
            }
            ExprKind::BinOp { left, op, right } => {
                self.visit_expr(left)?;
                self.visit_expr(right)?;
                self.loc = loc;
                self.emit_arg(Opcode::BinaryOp, binary_operator(*op).oparg(false))
            }
            ExprKind::UnaryOp { op, operand } => {
                self.visit_expr(operand)?;
                self.loc = loc;
                match op {
                    UnaryOperator::Invert => self.emit(Opcode::UnaryInvert),
                    UnaryOperator::Not => self.emit(Opcode::UnaryNot),
                    UnaryOperator::UAdd => self.emit_intrinsic1(Intrinsic1::UnaryPositive),
                    UnaryOperator::USub => self.emit(Opcode::UnaryNegative),
                }
            }
            ExprKind::Lambda { args, body } => self.compile_lambda(expr, args, body),
            ExprKind::IfExp { test, body, orelse } => {
                let end = self.new_label()?;
                let next = self.new_label()?;
                self.jump_if(test, next, false)?;
                self.visit_expr(body)?;
                self.loc = None;
                self.emit_jump(Opcode::Jump, end)?;
                self.place(next)?;
                self.visit_expr(orelse)?;
                self.place(end)
            }
            ExprKind::Dict { keys, values } => self.compile_dict(keys, values),
            ExprKind::Set { elts } => self.compile_set(elts),
            ExprKind::List { elts } => self.compile_list(elts),
            ExprKind::Tuple { elts } => self.compile_tuple(elts),
            ExprKind::ListComp { elt, generators } => {
                self.compile_comprehension(expr, CompKind::List, generators, elt, None)
            }
            ExprKind::SetComp { elt, generators } => {
                self.compile_comprehension(expr, CompKind::Set, generators, elt, None)
            }
            ExprKind::DictComp { key, value, generators } => {
                self.compile_comprehension(expr, CompKind::Dict, generators, key, Some(&**value))
            }
            ExprKind::GeneratorExp { elt, generators } => {
                self.compile_comprehension(expr, CompKind::Generator, generators, elt, None)
            }
            ExprKind::Await { value } => {
                if !self.unit.kind.is_function_like() {
                    return Err(CompileError::at(CompileErrorKind::AwaitOutsideFunction, expr.span));
                }
                if !matches!(self.unit.kind, UnitKind::AsyncFunction | UnitKind::Comprehension) {
                    return Err(CompileError::at(CompileErrorKind::AwaitOutsideAsyncFunction, expr.span));
                }
                self.visit_expr(value)?;
                self.loc = loc;
                self.emit_arg(Opcode::GetAwaitable, 0)?;
                self.emit_yield_from()
            }
            ExprKind::Yield { value } => {
                if !self.unit.kind.is_function_like() {
                    return Err(CompileError::at(CompileErrorKind::YieldOutsideFunction, expr.span));
                }
                match value {
                    Some(value) => self.visit_expr(value)?,
                    None => self.emit_none()?,
                }
                self.loc = loc;
                self.emit_yield_value()
            }
            ExprKind::YieldFrom { value } => {
                if !self.unit.kind.is_function_like() {
                    return Err(CompileError::at(CompileErrorKind::YieldOutsideFunction, expr.span));
                }
                if self.unit.kind == UnitKind::AsyncFunction {
                    return Err(CompileError::at(CompileErrorKind::YieldFromInAsyncFunction, expr.span));
                }
                self.visit_expr(value)?;
                self.loc = loc;
                self.emit(Opcode::GetIter)?;
                self.emit_yield_from()
            }
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => self.compile_compare(expr, left, ops, comparators),
            ExprKind::Call {
                func,
                args,
                keywords,
            } => self.compile_call(func, args, keywords),
            ExprKind::FormattedValue {
                value,
                conversion,
                format_spec,
            } => {
                self.visit_expr(value)?;
                let mut flags = match conversion {
                    Conversion::None => FormatFlags::NONE,
                    Conversion::Str => FormatFlags::STR,
                    Conversion::Repr => FormatFlags::REPR,
                    Conversion::Ascii => FormatFlags::ASCII,
                };
                if let Some(spec) = format_spec {
                    self.visit_expr(spec)?;
                    flags |= FormatFlags::HAVE_SPEC;
                }
                self.loc = loc;
                self.emit_arg(Opcode::FormatValue, flags)
            }
            ExprKind::JoinedStr { values } => self.compile_joined_str(values),
            ExprKind::Constant { value } => self.emit_const(value.to_ir()),
            ExprKind::Attribute { value, attr } => {
                self.visit_expr(value)?;
                self.loc = loc;
                self.emit_named(Opcode::LoadAttr, attr)
            }
            ExprKind::Subscript { value, slice } => {
                self.visit_expr(value)?;
                match two_element_slice(slice) {
                    Some((lower, upper)) => {
                        self.compile_slice_bounds(lower, upper)?;
                        self.loc = loc;
                        self.emit(Opcode::BinarySlice)
                    }
                    None => {
                        self.visit_expr(slice)?;
                        self.loc = loc;
                        self.emit(Opcode::BinarySubscr)
                    }
                }
            }
            ExprKind::Starred { .. } => Err(CompileError::at(CompileErrorKind::StarredNotAllowed, expr.span)),
            ExprKind::Name { id } if id == "__debug__" => {
                self.emit_const(Constant::Bool(self.options.optimize == 0))
            }
            ExprKind::Name { id } => self.compile_name(id, NameCtx::Load),
            ExprKind::Slice { lower, upper, step } => {
                self.compile_slice_bounds(lower.as_deref(), upper.as_deref())?;
                let mut n = 2;
                if let Some(step) = step {
                    self.visit_expr(step)?;
                    n += 1;
                }
                self.loc = loc;
                self.emit_arg(Opcode::BuildSlice, n)
            }
        }
    }

    /// Yield the value on top of the stack, wrapped for async generators.
    pub(crate) fn emit_yield_value(&mut self) -> CompileResult<()> {
        if self.unit.flags.async_generator {
            self.emit_intrinsic1(Intrinsic1::AsyncGenWrap)?;
        }
        self.emit(Opcode::YieldValue)
    }

    /// Push `lower` and `upper`, with `None` standing in for a missing bound.
    pub(crate) fn compile_slice_bounds(&mut self, lower: Option<&'a Expr>, upper: Option<&'a Expr>) -> CompileResult<()> {
        for bound in [lower, upper] {
            match bound {
                Some(bound) => self.visit_expr(bound)?,
                None => self.emit_none()?,
            }
        }
        Ok(())
    }

    fn compile_boolop(&mut self, op: BoolOperator, values: &'a [Expr]) -> CompileResult<()> {
        let jump = match op {
            BoolOperator::And => Opcode::PopJumpIfFalse,
            BoolOperator::Or => Opcode::PopJumpIfTrue,
        };
        let Some((last, rest)) = values.split_last() else {
            return self.emit_none();
        };
        let end = self.new_label()?;
        for value in rest {
            self.visit_expr(value)?;
            self.emit_arg(Opcode::Copy, 1)?;
            self.emit_jump(jump, end)?;
            self.emit(Opcode::PopTop)?;
        }
        self.visit_expr(last)?;
        self.place(end)
    }

    /// `a < b < c` evaluates `b` once; a failing link leaves `False` and
    /// skips the rest of the chain.
    fn compile_compare(
        &mut self,
        expr: &'a Expr,
        left: &'a Expr,
        ops: &[CmpOperator],
        comparators: &'a [Expr],
    ) -> CompileResult<()> {
        check_compare(left, ops, comparators);
        let loc = Some(expr.span);
        self.visit_expr(left)?;
        let (Some((last_op, rest_ops)), Some((last, rest))) = (ops.split_last(), comparators.split_last()) else {
            return Ok(());
        };
        if rest.is_empty() {
            self.visit_expr(last)?;
            self.loc = loc;
            return self.emit_compare(*last_op);
        }
        let cleanup = self.new_label()?;
        for (op, comparator) in rest_ops.iter().zip(rest) {
            self.visit_expr(comparator)?;
            self.loc = loc;
            self.emit_arg(Opcode::Swap, 2)?;
            self.emit_arg(Opcode::Copy, 2)?;
            self.emit_compare(*op)?;
            self.emit_arg(Opcode::Copy, 1)?;
            self.emit_jump(Opcode::PopJumpIfFalse, cleanup)?;
            self.emit(Opcode::PopTop)?;
        }
        self.visit_expr(last)?;
        self.loc = loc;
        self.emit_compare(*last_op)?;
        let end = self.new_label()?;
        self.loc = None;
        self.emit_jump(Opcode::Jump, end)?;
        self.place(cleanup)?;
        self.loc = loc;
        self.emit_arg(Opcode::Swap, 2)?;
        self.emit(Opcode::PopTop)?;
        self.place(end)
    }

    pub(crate) fn emit_compare(&mut self, op: CmpOperator) -> CompileResult<()> {
        let cmp = |c: ComparisonOperator| c as u32;
        match op {
            CmpOperator::Eq => self.emit_arg(Opcode::CompareOp, cmp(ComparisonOperator::Equal)),
            CmpOperator::NotEq => self.emit_arg(Opcode::CompareOp, cmp(ComparisonOperator::NotEqual)),
            CmpOperator::Lt => self.emit_arg(Opcode::CompareOp, cmp(ComparisonOperator::Less)),
            CmpOperator::LtE => self.emit_arg(Opcode::CompareOp, cmp(ComparisonOperator::LessOrEqual)),
            CmpOperator::Gt => self.emit_arg(Opcode::CompareOp, cmp(ComparisonOperator::Greater)),
            CmpOperator::GtE => self.emit_arg(Opcode::CompareOp, cmp(ComparisonOperator::GreaterOrEqual)),
            CmpOperator::Is => self.emit_arg(Opcode::IsOp, 0),
            CmpOperator::IsNot => self.emit_arg(Opcode::IsOp, 1),
            CmpOperator::In => self.emit_arg(Opcode::ContainsOp, 0),
            CmpOperator::NotIn => self.emit_arg(Opcode::ContainsOp, 1),
        }
    }

    fn compile_joined_str(&mut self, values: &'a [Expr]) -> CompileResult<()> {
        let loc = self.loc;
        if values.len() > STACK_USE_GUIDELINE {
            // ''.join([...]) keeps the stack shallow
            self.emit_const(Constant::Str(String::new()))?;
            self.emit_named(Opcode::LoadMethod, "join")?;
            self.emit_arg(Opcode::BuildList, 0)?;
            for value in values {
                self.visit_expr(value)?;
                self.loc = loc;
                self.emit_arg(Opcode::ListAppend, 1)?;
            }
            return self.emit_arg(Opcode::Call, 1);
        }
        for value in values {
            self.visit_expr(value)?;
        }
        if values.len() != 1 {
            self.loc = loc;
            self.emit_arg(Opcode::BuildString, values.len() as u32)?;
        }
        Ok(())
    }

    // ========================================================================
    // Conditional jumps
    // ========================================================================

    /// Truth value of a test known at compile time.
    pub(crate) fn constant_truth(&self, expr: &Expr) -> Option<bool> {
        match &expr.kind {
            ExprKind::Constant { value } => Some(value.is_truthy()),
            ExprKind::Name { id } if id == "__debug__" => Some(self.options.optimize == 0),
            _ => None,
        }
    }

    /// Jump to `target` when `expr` is `cond`, falling through otherwise.
    /// Nothing is left on the stack on either edge.
    pub(crate) fn jump_if(&mut self, expr: &'a Expr, target: Label, cond: bool) -> CompileResult<()> {
        let saved = self.loc;
        self.loc = Some(expr.span);
        let result = self.nested(|c| c.lower_jump_if(expr, target, cond));
        self.loc = saved;
        result
    }

    fn lower_jump_if(&mut self, expr: &'a Expr, target: Label, cond: bool) -> CompileResult<()> {
        if let Some(truth) = self.constant_truth(expr) {
            if truth == cond {
                self.emit_jump(Opcode::Jump, target)?;
            }
            return Ok(());
        }
        match &expr.kind {
            ExprKind::UnaryOp {
                op: UnaryOperator::Not,
                operand,
            } => self.jump_if(operand, target, !cond),
            ExprKind::BoolOp { op, values } => {
                let Some((last, rest)) = values.split_last() else {
                    return Ok(());
                };
                let is_or = *op == BoolOperator::Or;
                // where a short-circuiting operand sends control
                let short = if is_or != cond { self.new_label()? } else { target };
                for value in rest {
                    self.jump_if(value, short, is_or)?;
                }
                self.jump_if(last, target, cond)?;
                if short != target {
                    self.place(short)?;
                }
                Ok(())
            }
            ExprKind::IfExp { test, body, orelse } => {
                let end = self.new_label()?;
                let other = self.new_label()?;
                self.jump_if(test, other, false)?;
                self.jump_if(body, target, cond)?;
                self.loc = None;
                self.emit_jump(Opcode::Jump, end)?;
                self.place(other)?;
                self.jump_if(orelse, target, cond)?;
                self.place(end)
            }
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } if ops.len() > 1 => {
                check_compare(left, ops, comparators);
                let loc = Some(expr.span);
                let cleanup = self.new_label()?;
                let end = self.new_label()?;
                self.visit_expr(left)?;
                let (last_op, rest_ops) = (ops[ops.len() - 1], &ops[..ops.len() - 1]);
                let (last, rest) = (&comparators[comparators.len() - 1], &comparators[..comparators.len() - 1]);
                for (op, comparator) in rest_ops.iter().zip(rest) {
                    self.visit_expr(comparator)?;
                    self.loc = loc;
                    self.emit_arg(Opcode::Swap, 2)?;
                    self.emit_arg(Opcode::Copy, 2)?;
                    self.emit_compare(*op)?;
                    self.emit_jump(Opcode::PopJumpIfFalse, cleanup)?;
                }
                self.visit_expr(last)?;
                self.loc = loc;
                self.emit_compare(last_op)?;
                let jump = if cond { Opcode::PopJumpIfTrue } else { Opcode::PopJumpIfFalse };
                self.emit_jump(jump, target)?;
                self.loc = None;
                self.emit_jump(Opcode::Jump, end)?;
                self.place(cleanup)?;
                self.loc = loc;
                self.emit(Opcode::PopTop)?;
                if !cond {
                    self.loc = None;
                    self.emit_jump(Opcode::Jump, target)?;
                }
                self.place(end)
            }
            _ => {
                self.visit_expr(expr)?;
                self.loc = Some(expr.span);
                let jump = if cond { Opcode::PopJumpIfTrue } else { Opcode::PopJumpIfFalse };
                self.emit_jump(jump, target)
            }
        }
    }
}

/// Identity comparison against a fresh literal is almost always a mistake.
fn check_compare(left: &Expr, ops: &[CmpOperator], comparators: &[Expr]) {
    let mut lhs = left;
    for (op, rhs) in ops.iter().zip(comparators) {
        if matches!(op, CmpOperator::Is | CmpOperator::IsNot) && (is_literal(lhs) || is_literal(rhs)) {
            let (spelled, suggested) = match op {
                CmpOperator::Is => ("is", "=="),
                _ => ("is not", "!="),
            };
            warn!(line = rhs.span.start.line, "\"{spelled}\" with a literal. Did you mean \"{suggested}\"?");
        }
        lhs = rhs;
    }
}

fn is_literal(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Constant { value } => !matches!(
            value,
            ast::Constant::None | ast::Constant::Bool(_) | ast::Constant::Ellipsis
        ),
        ExprKind::List { .. }
        | ExprKind::Tuple { .. }
        | ExprKind::Dict { .. }
        | ExprKind::Set { .. }
        | ExprKind::ListComp { .. }
        | ExprKind::SetComp { .. }
        | ExprKind::DictComp { .. }
        | ExprKind::JoinedStr { .. } => true,
        _ => false,
    }
}

/// `lower:upper` without a step is lowered with the dedicated slice opcodes.
pub(crate) fn two_element_slice(slice: &Expr) -> Option<(Option<&Expr>, Option<&Expr>)> {
    match &slice.kind {
        ExprKind::Slice {
            lower,
            upper,
            step: None,
        } => Some((lower.as_deref(), upper.as_deref())),
        _ => None,
    }
}

pub(crate) fn binary_operator(op: Operator) -> BinaryOperator {
    match op {
        Operator::Add => BinaryOperator::Add,
        Operator::Sub => BinaryOperator::Subtract,
        Operator::Mult => BinaryOperator::Multiply,
        Operator::MatMult => BinaryOperator::MatrixMultiply,
        Operator::Div => BinaryOperator::TrueDivide,
        Operator::Mod => BinaryOperator::Remainder,
        Operator::Pow => BinaryOperator::Power,
        Operator::LShift => BinaryOperator::LShift,
        Operator::RShift => BinaryOperator::RShift,
        Operator::BitOr => BinaryOperator::Or,
        Operator::BitXor => BinaryOperator::Xor,
        Operator::BitAnd => BinaryOperator::And,
        Operator::FloorDiv => BinaryOperator::FloorDivide,
    }
}

/// How an expression is named in "cannot assign to ..." and "cannot delete ..." errors.
pub(crate) fn describe(expr: &Expr) -> &'static str {
    match &expr.kind {
        ExprKind::Call { .. } => "function call",
        ExprKind::Constant { value } => match value {
            ast::Constant::None => "None",
            ast::Constant::Bool(true) => "True",
            ast::Constant::Bool(false) => "False",
            ast::Constant::Ellipsis => "ellipsis",
            _ => "literal",
        },
        ExprKind::Compare { .. } => "comparison",
        ExprKind::BoolOp { .. } | ExprKind::BinOp { .. } | ExprKind::UnaryOp { .. } => "expression",
        ExprKind::Lambda { .. } => "lambda",
        ExprKind::IfExp { .. } => "conditional expression",
        ExprKind::NamedExpr { .. } => "named expression",
        ExprKind::Dict { .. } => "dict literal",
        ExprKind::Set { .. } => "set display",
        ExprKind::ListComp { .. } => "list comprehension",
        ExprKind::SetComp { .. } => "set comprehension",
        ExprKind::DictComp { .. } => "dict comprehension",
        ExprKind::GeneratorExp { .. } => "generator expression",
        ExprKind::Await { .. } => "await expression",
        ExprKind::Yield { .. } | ExprKind::YieldFrom { .. } => "yield expression",
        ExprKind::FormattedValue { .. } | ExprKind::JoinedStr { .. } => "f-string expression",
        ExprKind::Starred { .. } => "starred",
        ExprKind::Slice { .. } => "slice",
        ExprKind::Name { .. } => "name",
        ExprKind::Attribute { .. } => "attribute",
        ExprKind::Subscript { .. } => "subscript",
        ExprKind::List { .. } => "list",
        ExprKind::Tuple { .. } => "tuple",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::ast::{Module, Stmt};
    use crate::semantic;
    use pylower_common::ir::{CodeUnit, Operand};
    use pylower_common::LoweringOptions;

    fn lower(body: Vec<Stmt>) -> CompileResult<CodeUnit> {
        let module: Module = module(body);
        let options = LoweringOptions::default();
        let table = semantic::analyze(&module, &options)?;
        Compiler::new(&table, &options, "test.py")?.compile_module(&module)
    }

    fn count(unit: &CodeUnit, op: Opcode) -> usize {
        unit.instructions.iter().filter(|i| i.op == op).count()
    }

    #[test]
    fn chained_comparison_has_cleanup() {
        let unit = lower(vec![assign(
            name("r"),
            compare(
                name("a"),
                vec![CmpOperator::Lt, CmpOperator::Lt],
                vec![name("b"), name("c")],
            ),
        )])
        .unwrap();
        assert_eq!(count(&unit, Opcode::CompareOp), 2);
        assert_eq!(count(&unit, Opcode::Swap), 2);
        // `b` is loaded once
        let b = unit.names.iter().position(|n| n == "b").unwrap() as u32;
        let loads = unit
            .instructions
            .iter()
            .filter(|i| i.op == Opcode::LoadName && i.arg == Operand::Name(b))
            .count();
        assert_eq!(loads, 1);
    }

    #[test]
    fn membership_and_identity_use_their_own_opcodes() {
        let unit = lower(vec![
            expr_stmt(compare(name("a"), vec![CmpOperator::NotIn], vec![name("b")])),
            expr_stmt(compare(name("a"), vec![CmpOperator::IsNot], vec![none()])),
        ])
        .unwrap();
        let contains = unit.instructions.iter().find(|i| i.op == Opcode::ContainsOp).unwrap();
        assert_eq!(contains.arg, Operand::Int(1));
        let is = unit.instructions.iter().find(|i| i.op == Opcode::IsOp).unwrap();
        assert_eq!(is.arg, Operand::Int(1));
    }

    #[test]
    fn boolean_value_short_circuits() {
        let unit = lower(vec![assign(
            name("r"),
            boolop(BoolOperator::Or, vec![name("a"), name("b"), name("c")]),
        )])
        .unwrap();
        assert_eq!(count(&unit, Opcode::PopJumpIfTrue), 2);
        assert_eq!(count(&unit, Opcode::Copy), 2);
    }

    #[test]
    fn and_condition_branches_without_values() {
        let unit = lower(vec![if_(
            boolop(BoolOperator::And, vec![name("a"), name("b")]),
            vec![pass()],
            vec![],
        )])
        .unwrap();
        assert_eq!(count(&unit, Opcode::PopJumpIfFalse), 2);
        assert_eq!(count(&unit, Opcode::Copy), 0);
    }

    #[test]
    fn fstring_builds_string() {
        let fstring = expr(ExprKind::JoinedStr {
            values: vec![
                str_("x="),
                expr(ExprKind::FormattedValue {
                    value: Box::new(name("x")),
                    conversion: Conversion::Repr,
                    format_spec: Some(Box::new(expr(ExprKind::JoinedStr {
                        values: vec![str_(">10")],
                    }))),
                }),
            ],
        });
        let unit = lower(vec![assign(name("s"), fstring)]).unwrap();
        let format = unit.instructions.iter().find(|i| i.op == Opcode::FormatValue).unwrap();
        assert_eq!(format.arg, Operand::Int(FormatFlags::REPR | FormatFlags::HAVE_SPEC));
        let build = unit.instructions.iter().find(|i| i.op == Opcode::BuildString).unwrap();
        assert_eq!(build.arg, Operand::Int(2));
    }

    #[test]
    fn slices_take_the_fast_path() {
        let unit = lower(vec![
            assign(
                name("a"),
                subscript(
                    name("xs"),
                    expr(ExprKind::Slice {
                        lower: Some(Box::new(int(1))),
                        upper: None,
                        step: None,
                    }),
                ),
            ),
            assign(
                name("b"),
                subscript(
                    name("xs"),
                    expr(ExprKind::Slice {
                        lower: None,
                        upper: None,
                        step: Some(Box::new(int(2))),
                    }),
                ),
            ),
        ])
        .unwrap();
        assert_eq!(count(&unit, Opcode::BinarySlice), 1);
        let build = unit.instructions.iter().find(|i| i.op == Opcode::BuildSlice).unwrap();
        assert_eq!(build.arg, Operand::Int(3));
        assert_eq!(count(&unit, Opcode::BinarySubscr), 1);
    }

    #[test]
    fn walrus_keeps_value() {
        let unit = lower(vec![expr_stmt(named("y", call(name("f"), vec![])))]).unwrap();
        assert_eq!(count(&unit, Opcode::Copy), 1);
        assert!(unit.names.contains(&"y".to_string()));
    }

    #[test]
    fn await_context_is_checked() {
        let err = lower(vec![expr_stmt(await_(name("x")))]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::AwaitOutsideFunction);
        let err = lower(vec![def("f", &[], vec![expr_stmt(await_(name("x")))])]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::AwaitOutsideAsyncFunction);
    }

    #[test]
    fn yield_outside_function() {
        let err = lower(vec![expr_stmt(yield_(Some(int(1))))]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::YieldOutsideFunction);
    }

    #[test]
    fn debug_is_a_constant() {
        let unit = lower(vec![assign(name("d"), name("__debug__"))]).unwrap();
        assert!(unit.consts.contains(&Constant::Bool(true)));
        assert!(!unit.names.contains(&"__debug__".to_string()));
    }

    #[test]
    fn starred_outside_display_is_rejected() {
        let err = lower(vec![assign(name("x"), starred(name("y")))]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::StarredNotAllowed);
    }

    #[test]
    fn describes_targets_like_the_runtime() {
        assert_eq!(describe(&none()), "None");
        assert_eq!(describe(&int(1)), "literal");
        assert_eq!(describe(&lambda(&[], int(1))), "lambda");
    }
}
