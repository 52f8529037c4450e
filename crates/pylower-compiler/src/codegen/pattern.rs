//! Structural pattern matching.
//!
//! A pattern consumes the subject on top of the stack and either falls
//! through on success or jumps into the fail-pop chain, which discards the
//! transient values and pending captures still on the stack. Captured
//! values stay on the stack, newest deepest, until the whole pattern has
//! matched; only then are they bound.

use std::mem;

use pylower_common::ir::{Constant, Label, Operand};
use pylower_common::ir_opcodes::BinaryOperator;
use pylower_common::Opcode;

use super::compiler::{Compiler, NameCtx};
use crate::ast::{self, CmpOperator, Expr, ExprKind, MatchCase, Operator, Pattern, PatternKind, UnaryOperator};
use crate::error::{CompileError, CompileErrorKind, CompileResult};

#[derive(Debug, Default)]
struct PatternContext<'a> {
    /// Names captured so far, in capture order.
    stores: Vec<&'a str>,
    allow_irrefutable: bool,
    /// `fail_pop[n]` pops `n` values and continues to the next case.
    fail_pop: Vec<Label>,
    /// Transient values above the captures.
    on_top: usize,
}

impl<'a> Compiler<'a> {
    pub(crate) fn compile_match(&mut self, subject: &'a Expr, cases: &'a [MatchCase]) -> CompileResult<()> {
        self.visit_expr(subject)?;
        let end = self.new_label()?;
        let Some(last) = cases.last() else {
            self.emit(Opcode::PopTop)?;
            return Ok(());
        };
        let has_default = last.pattern.is_wildcard() && cases.len() > 1;
        let matched = cases.len() - usize::from(has_default);

        for (i, case) in cases[..matched].iter().enumerate() {
            let loc = Some(case.pattern.span);
            let keep_subject = i != matched - 1;
            self.loc = loc;
            if keep_subject {
                self.emit_arg(Opcode::Copy, 1)?;
            }
            let mut pc = PatternContext {
                allow_irrefutable: case.guard.is_some() || i == cases.len() - 1,
                ..PatternContext::default()
            };
            self.compile_pattern(&case.pattern, &mut pc)?;
            debug_assert_eq!(pc.on_top, 0);

            self.loc = loc;
            for name in &pc.stores {
                self.compile_name(name, NameCtx::Store)?;
            }
            if let Some(guard) = &case.guard {
                self.ensure_fail_pop(&mut pc, 0)?;
                self.jump_if(guard, pc.fail_pop[0], false)?;
            }
            self.loc = loc;
            if keep_subject {
                self.emit(Opcode::PopTop)?;
            }
            self.visit_body(&case.body)?;
            self.loc = None;
            self.emit_jump(Opcode::Jump, end)?;
            self.loc = loc;
            self.emit_and_reset_fail_pop(&mut pc)?;
        }

        if has_default {
            self.loc = Some(last.pattern.span);
            // the last refutable case already consumed the subject
            self.emit(Opcode::Nop)?;
            if let Some(guard) = &last.guard {
                self.jump_if(guard, end, false)?;
            }
            self.visit_body(&last.body)?;
        }
        self.place(end)
    }

    // ========================================================================
    // Fail-pop chain
    // ========================================================================

    fn ensure_fail_pop(&mut self, pc: &mut PatternContext<'a>, n: usize) -> CompileResult<()> {
        while pc.fail_pop.len() <= n {
            let label = self.new_label()?;
            pc.fail_pop.push(label);
        }
        Ok(())
    }

    /// Jump with `op` to the block popping everything the pattern has
    /// pushed so far.
    fn jump_to_fail_pop(&mut self, pc: &mut PatternContext<'a>, op: Opcode) -> CompileResult<()> {
        let pops = pc.on_top + pc.stores.len();
        self.ensure_fail_pop(pc, pops)?;
        self.emit_jump(op, pc.fail_pop[pops])
    }

    /// Place the chain as `fail_pop[n]: POP_TOP` blocks falling into
    /// `fail_pop[n - 1]`, down to `fail_pop[0]`.
    fn emit_and_reset_fail_pop(&mut self, pc: &mut PatternContext<'a>) -> CompileResult<()> {
        let Some((&first, rest)) = pc.fail_pop.split_first() else {
            return Ok(());
        };
        for &label in rest.iter().rev() {
            self.place(label)?;
            self.emit(Opcode::PopTop)?;
        }
        self.place(first)?;
        pc.fail_pop.clear();
        Ok(())
    }

    // ========================================================================
    // Stack helpers
    // ========================================================================

    /// Move the top of stack `count - 1` entries down.
    fn rotate(&mut self, count: usize) -> CompileResult<()> {
        for n in (2..=count).rev() {
            self.emit_arg(Opcode::Swap, n as u32)?;
        }
        Ok(())
    }

    fn store_pattern_name(&mut self, name: Option<&'a str>, pc: &mut PatternContext<'a>) -> CompileResult<()> {
        let Some(name) = name else {
            return self.emit(Opcode::PopTop);
        };
        if name == "__debug__" {
            return Err(CompileError::new(CompileErrorKind::AssignToDebug, self.loc));
        }
        if pc.stores.contains(&name) {
            return Err(CompileError::new(
                CompileErrorKind::MultipleAssignmentsInPattern(name.to_string()),
                self.loc,
            ));
        }
        // below the transient values and every earlier capture
        self.rotate(pc.on_top + pc.stores.len() + 1)?;
        pc.stores.push(name);
        Ok(())
    }

    // ========================================================================
    // Patterns
    // ========================================================================

    fn compile_pattern(&mut self, pattern: &'a Pattern, pc: &mut PatternContext<'a>) -> CompileResult<()> {
        self.nested(|c| {
            c.loc = Some(pattern.span);
            match &pattern.kind {
                PatternKind::MatchValue { value } => c.compile_pattern_value(value, pc),
                PatternKind::MatchSingleton { value } => {
                    c.emit_const(value.to_ir())?;
                    c.emit_compare(CmpOperator::Is)?;
                    c.jump_to_fail_pop(pc, Opcode::PopJumpIfFalse)
                }
                PatternKind::MatchSequence { patterns } => c.compile_pattern_sequence(patterns, pc),
                PatternKind::MatchMapping { keys, patterns, rest } => {
                    c.compile_pattern_mapping(keys, patterns, rest.as_deref(), pc)
                }
                PatternKind::MatchClass {
                    cls,
                    patterns,
                    kwd_attrs,
                    kwd_patterns,
                } => c.compile_pattern_class(pattern, cls, patterns, kwd_attrs, kwd_patterns, pc),
                PatternKind::MatchStar { name } => c.store_pattern_name(name.as_deref(), pc),
                PatternKind::MatchAs { pattern: sub, name } => c.compile_pattern_as(sub.as_deref(), name.as_deref(), pc),
                PatternKind::MatchOr { patterns } => c.compile_pattern_or(pattern, patterns, pc),
            }
        })
    }

    /// A nested pattern may be irrefutable even if its parent is not.
    fn compile_subpattern(&mut self, pattern: &'a Pattern, pc: &mut PatternContext<'a>) -> CompileResult<()> {
        let allow = mem::replace(&mut pc.allow_irrefutable, true);
        let result = self.compile_pattern(pattern, pc);
        pc.allow_irrefutable = allow;
        result
    }

    fn compile_pattern_value(&mut self, value: &'a Expr, pc: &mut PatternContext<'a>) -> CompileResult<()> {
        if !is_value_pattern(value) {
            return Err(CompileError::at(CompileErrorKind::PatternValueNotLiteral, value.span));
        }
        let loc = self.loc;
        self.visit_expr(value)?;
        self.loc = loc;
        self.emit_compare(CmpOperator::Eq)?;
        self.jump_to_fail_pop(pc, Opcode::PopJumpIfFalse)
    }

    fn compile_pattern_as(
        &mut self,
        pattern: Option<&'a Pattern>,
        name: Option<&'a str>,
        pc: &mut PatternContext<'a>,
    ) -> CompileResult<()> {
        let Some(pattern) = pattern else {
            if !pc.allow_irrefutable {
                let kind = match name {
                    Some(name) => CompileErrorKind::NameCaptureUnreachable(name.to_string()),
                    None => CompileErrorKind::WildcardUnreachable,
                };
                return Err(CompileError::new(kind, self.loc));
            }
            return self.store_pattern_name(name, pc);
        };
        let loc = self.loc;
        // keep a copy to bind once the subpattern matched
        pc.on_top += 1;
        self.emit_arg(Opcode::Copy, 1)?;
        self.compile_pattern(pattern, pc)?;
        pc.on_top -= 1;
        self.loc = loc;
        self.store_pattern_name(name, pc)
    }

    fn compile_pattern_sequence(&mut self, patterns: &'a [Pattern], pc: &mut PatternContext<'a>) -> CompileResult<()> {
        let size = patterns.len();
        let mut star = None;
        let mut only_wildcard = true;
        let mut star_wildcard = false;
        for (i, p) in patterns.iter().enumerate() {
            if matches!(p.kind, PatternKind::MatchStar { .. }) {
                if star.is_some() {
                    return Err(CompileError::at(CompileErrorKind::MultipleStarredInPattern, p.span));
                }
                star = Some(i);
                star_wildcard = p.is_star_wildcard();
            }
            only_wildcard &= p.is_wildcard() || p.is_star_wildcard();
        }

        // the subject stays on top through the checks
        pc.on_top += 1;
        self.emit(Opcode::MatchSequence)?;
        self.jump_to_fail_pop(pc, Opcode::PopJumpIfFalse)?;
        match star {
            None => self.check_length(size, CmpOperator::Eq, pc)?,
            Some(_) if size > 1 => self.check_length(size - 1, CmpOperator::GtE, pc)?,
            Some(_) => {}
        }
        pc.on_top -= 1;

        if only_wildcard {
            self.emit(Opcode::PopTop)
        } else if let (Some(star), true) = (star, star_wildcard) {
            self.sequence_subscr(patterns, star, pc)
        } else {
            self.sequence_unpack(patterns, star, pc)
        }
    }

    fn check_length(&mut self, size: usize, op: CmpOperator, pc: &mut PatternContext<'a>) -> CompileResult<()> {
        self.emit(Opcode::GetLen)?;
        self.emit_const(Constant::Int(size as i64))?;
        self.emit_compare(op)?;
        self.jump_to_fail_pop(pc, Opcode::PopJumpIfFalse)
    }

    /// Unpack every element and match them in order.
    fn sequence_unpack(
        &mut self,
        patterns: &'a [Pattern],
        star: Option<usize>,
        pc: &mut PatternContext<'a>,
    ) -> CompileResult<()> {
        let size = patterns.len();
        match star {
            Some(star) => {
                let after = size - star - 1;
                self.emit_arg(Opcode::UnpackEx, (star | (after << 8)) as u32)?;
            }
            None => self.emit_arg(Opcode::UnpackSequence, size as u32)?,
        }
        pc.on_top += size;
        for p in patterns {
            pc.on_top -= 1;
            self.compile_subpattern(p, pc)?;
        }
        Ok(())
    }

    /// Index only the elements that need matching; `*_` is never built.
    fn sequence_subscr(&mut self, patterns: &'a [Pattern], star: usize, pc: &mut PatternContext<'a>) -> CompileResult<()> {
        let size = patterns.len();
        let loc = self.loc;
        pc.on_top += 1;
        for (i, p) in patterns.iter().enumerate() {
            if p.is_wildcard() || i == star {
                continue;
            }
            self.loc = loc;
            self.emit_arg(Opcode::Copy, 1)?;
            if i < star {
                self.emit_const(Constant::Int(i as i64))?;
            } else {
                // index from the end without relying on negative indices
                self.emit(Opcode::GetLen)?;
                self.emit_const(Constant::Int((size - i) as i64))?;
                self.emit_arg(Opcode::BinaryOp, BinaryOperator::Subtract as u32)?;
            }
            self.emit(Opcode::BinarySubscr)?;
            self.compile_subpattern(p, pc)?;
        }
        pc.on_top -= 1;
        self.loc = loc;
        self.emit(Opcode::PopTop)
    }

    fn compile_pattern_mapping(
        &mut self,
        keys: &'a [Expr],
        patterns: &'a [Pattern],
        rest: Option<&'a str>,
        pc: &mut PatternContext<'a>,
    ) -> CompileResult<()> {
        let size = keys.len();
        if size != patterns.len() {
            return Err(CompileError::new(
                CompileErrorKind::MappingPatternLengthMismatch(size, patterns.len()),
                self.loc,
            ));
        }
        let loc = self.loc;
        pc.on_top += 1;
        self.emit(Opcode::MatchMapping)?;
        self.jump_to_fail_pop(pc, Opcode::PopJumpIfFalse)?;
        if size == 0 && rest.is_none() {
            // `{}` matches any mapping
            pc.on_top -= 1;
            return self.emit(Opcode::PopTop);
        }
        if size > 0 {
            self.check_length(size, CmpOperator::GtE, pc)?;
        }

        let mut seen: Vec<KeyIdentity> = Vec::new();
        for key in keys {
            if !is_value_pattern(key) {
                return Err(CompileError::at(CompileErrorKind::MappingKeyNotLiteral, key.span));
            }
            if let Some(value) = literal_key(key) {
                let identity = KeyIdentity::of(&value);
                if seen.contains(&identity) {
                    return Err(CompileError::at(
                        CompileErrorKind::DuplicateMappingKey(value.to_ir().to_string()),
                        key.span,
                    ));
                }
                seen.push(identity);
            }
            self.visit_expr(key)?;
        }
        self.loc = loc;
        self.emit_arg(Opcode::BuildTuple, size as u32)?;
        self.emit(Opcode::MatchKeys)?;
        // keys tuple and values tuple (or None) above the subject
        pc.on_top += 2;
        self.emit_arg(Opcode::Copy, 1)?;
        self.emit_none()?;
        self.emit_arg(Opcode::IsOp, 1)?;
        self.jump_to_fail_pop(pc, Opcode::PopJumpIfFalse)?;

        self.emit_arg(Opcode::UnpackSequence, size as u32)?;
        pc.on_top += size;
        pc.on_top -= 1;
        for p in patterns {
            pc.on_top -= 1;
            self.compile_subpattern(p, pc)?;
        }
        self.loc = loc;
        // what follows consumes the keys tuple and the subject
        pc.on_top -= 2;
        match rest {
            Some(rest) => {
                // rest = dict(subject), minus every matched key
                self.emit_arg(Opcode::BuildMap, 0)?;
                self.emit_arg(Opcode::Swap, 3)?;
                self.emit_arg(Opcode::DictUpdate, 2)?;
                self.emit_arg(Opcode::UnpackSequence, size as u32)?;
                for remaining in (1..=size).rev() {
                    self.emit_arg(Opcode::Copy, remaining as u32 + 1)?;
                    self.emit_arg(Opcode::Swap, 2)?;
                    self.emit(Opcode::DeleteSubscr)?;
                }
                self.store_pattern_name(Some(rest), pc)
            }
            None => {
                self.emit(Opcode::PopTop)?;
                self.emit(Opcode::PopTop)
            }
        }
    }

    fn compile_pattern_class(
        &mut self,
        pattern: &'a Pattern,
        cls: &'a Expr,
        patterns: &'a [Pattern],
        kwd_attrs: &'a [String],
        kwd_patterns: &'a [Pattern],
        pc: &mut PatternContext<'a>,
    ) -> CompileResult<()> {
        let loc = Some(pattern.span);
        let nargs = patterns.len();
        let nattrs = kwd_attrs.len();
        if nattrs != kwd_patterns.len() {
            return Err(CompileError::at(
                CompileErrorKind::ClassPatternLengthMismatch(nattrs, kwd_patterns.len()),
                pattern.span,
            ));
        }
        for (i, attr) in kwd_attrs.iter().enumerate() {
            if attr == "__debug__" {
                return Err(CompileError::at(CompileErrorKind::AssignToDebug, kwd_patterns[i].span));
            }
            if let Some(offset) = kwd_attrs[i + 1..].iter().position(|a| a == attr) {
                return Err(CompileError::at(
                    CompileErrorKind::RepeatedClassPatternAttribute(attr.clone()),
                    kwd_patterns[i + 1 + offset].span,
                ));
            }
        }

        self.visit_expr(cls)?;
        self.loc = loc;
        let names = kwd_attrs.iter().map(|a| Constant::Str(a.clone())).collect();
        self.emit_const(Constant::Tuple(names))?;
        self.emit_arg(Opcode::MatchClass, nargs as u32)?;
        self.emit_arg(Opcode::Copy, 1)?;
        self.emit_none()?;
        self.emit_arg(Opcode::IsOp, 1)?;
        // a tuple of positional then keyword attributes, or None
        pc.on_top += 1;
        self.jump_to_fail_pop(pc, Opcode::PopJumpIfFalse)?;

        let total = nargs + nattrs;
        self.emit_arg(Opcode::UnpackSequence, total as u32)?;
        pc.on_top += total;
        pc.on_top -= 1;
        for p in patterns.iter().chain(kwd_patterns) {
            pc.on_top -= 1;
            if p.is_wildcard() {
                self.loc = loc;
                self.emit(Opcode::PopTop)?;
                continue;
            }
            self.compile_subpattern(p, pc)?;
        }
        Ok(())
    }

    fn compile_pattern_or(
        &mut self,
        pattern: &'a Pattern,
        alternatives: &'a [Pattern],
        pc: &mut PatternContext<'a>,
    ) -> CompileResult<()> {
        let loc = Some(pattern.span);
        let end = self.new_label()?;
        let outer = mem::take(pc);
        let mut control: Option<Vec<&'a str>> = None;

        for (i, alt) in alternatives.iter().enumerate() {
            *pc = PatternContext {
                allow_irrefutable: i == alternatives.len() - 1 && outer.allow_irrefutable,
                ..PatternContext::default()
            };
            self.loc = Some(alt.span);
            self.emit_arg(Opcode::Copy, 1)?;
            self.compile_pattern(alt, pc)?;

            match &control {
                None => control = Some(pc.stores.clone()),
                Some(control) => {
                    if control.len() != pc.stores.len() {
                        return Err(CompileError::at(CompileErrorKind::AlternativesBindDifferentNames, alt.span));
                    }
                    self.align_stores(control, pc, alt)?;
                }
            }
            self.loc = Some(alt.span);
            self.emit_jump(Opcode::Jump, end)?;
            self.emit_and_reset_fail_pop(pc)?;
        }

        *pc = outer;
        // no alternative matched: drop the subject and fail
        self.loc = loc;
        self.emit(Opcode::PopTop)?;
        self.jump_to_fail_pop(pc, Opcode::Jump)?;

        self.place(end)?;
        let control = control.unwrap_or_default();
        // move each new capture below everything already on the stack
        let rotations = control.len() + 1 + pc.on_top + pc.stores.len();
        for name in control {
            self.rotate(rotations)?;
            if pc.stores.contains(&name) {
                return Err(CompileError::at(
                    CompileErrorKind::MultipleAssignmentsInPattern(name.to_string()),
                    pattern.span,
                ));
            }
            pc.stores.push(name);
        }
        self.emit(Opcode::PopTop)
    }

    /// Reorder this alternative's captures on the stack to the order the
    /// first alternative left them in.
    fn align_stores(&mut self, control: &[&'a str], pc: &mut PatternContext<'a>, alt: &'a Pattern) -> CompileResult<()> {
        for icontrol in (0..control.len()).rev() {
            let name = control[icontrol];
            let Some(istores) = pc.stores.iter().position(|&s| s == name) else {
                return Err(CompileError::at(CompileErrorKind::AlternativesBindDifferentNames, alt.span));
            };
            if istores == icontrol {
                continue;
            }
            let rotations = istores + 1;
            let rotated: Vec<&'a str> = pc.stores.drain(..rotations).collect();
            let at = icontrol - istores;
            for (k, moved) in rotated.into_iter().enumerate() {
                pc.stores.insert(at + k, moved);
            }
            for _ in 0..rotations {
                self.rotate(icontrol + 1)?;
            }
        }
        Ok(())
    }
}

/// The constant a literal mapping key denotes, with signs and complex
/// sums folded. Attribute keys have none.
fn literal_key(key: &Expr) -> Option<ast::Constant> {
    use ast::Constant as C;
    match &key.kind {
        ExprKind::Constant { value } => Some(value.clone()),
        ExprKind::UnaryOp {
            op: UnaryOperator::USub,
            operand,
        } => match literal_key(operand)? {
            C::Int(i) => Some(i.checked_neg().map_or(C::Float(-(i as f64)), C::Int)),
            C::Float(f) => Some(C::Float(-f)),
            C::Complex { real, imag } => Some(C::Complex {
                real: -real,
                imag: -imag,
            }),
            _ => None,
        },
        ExprKind::BinOp { left, op, right } => {
            let left = match literal_key(left)? {
                C::Int(i) => i as f64,
                C::Float(f) => f,
                _ => return None,
            };
            let C::Complex { real, imag } = literal_key(right)? else {
                return None;
            };
            match op {
                Operator::Add => Some(C::Complex {
                    real: left + real,
                    imag,
                }),
                Operator::Sub => Some(C::Complex {
                    real: left - real,
                    imag: -imag,
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Keys that hash and compare equal at run time share an identity:
/// `1`, `1.0`, `True` and `(1+0j)` are one key, as are `0.0` and `-0.0`.
#[derive(Debug, PartialEq)]
enum KeyIdentity {
    None,
    Ellipsis,
    Number { real: NumberKey, imag: NumberKey },
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<KeyIdentity>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NumberKey {
    Int(i64),
    /// Bit pattern of a non-integral or out-of-range float.
    Float(u64),
}

impl NumberKey {
    const ZERO: NumberKey = NumberKey::Int(0);

    fn of_float(f: f64) -> Self {
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
            NumberKey::Int(f as i64)
        } else {
            NumberKey::Float(f.to_bits())
        }
    }
}

impl KeyIdentity {
    fn of(value: &ast::Constant) -> Self {
        use ast::Constant as C;
        let number = |real| KeyIdentity::Number {
            real,
            imag: NumberKey::ZERO,
        };
        match value {
            C::None => KeyIdentity::None,
            C::Ellipsis => KeyIdentity::Ellipsis,
            C::Bool(b) => number(NumberKey::Int(i64::from(*b))),
            C::Int(i) => number(NumberKey::Int(*i)),
            C::Float(f) => number(NumberKey::of_float(*f)),
            C::Complex { real, imag } => KeyIdentity::Number {
                real: NumberKey::of_float(*real),
                imag: NumberKey::of_float(*imag),
            },
            C::Str(s) => KeyIdentity::Str(s.clone()),
            C::Bytes(b) => KeyIdentity::Bytes(b.clone()),
            C::Tuple(items) => KeyIdentity::Tuple(items.iter().map(KeyIdentity::of).collect()),
        }
    }
}

/// Literals, signed numbers, complex literals and dotted names.
fn is_value_pattern(value: &Expr) -> bool {
    match &value.kind {
        ExprKind::Constant { .. } | ExprKind::Attribute { .. } => true,
        ExprKind::UnaryOp {
            op: UnaryOperator::USub,
            operand,
        } => is_number(operand),
        ExprKind::BinOp {
            left,
            op: Operator::Add | Operator::Sub,
            right,
        } => is_real(left) && matches!(right.as_constant(), Some(ast::Constant::Complex { .. })),
        _ => false,
    }
}

fn is_number(expr: &Expr) -> bool {
    matches!(
        expr.as_constant(),
        Some(ast::Constant::Int(_) | ast::Constant::Float(_) | ast::Constant::Complex { .. })
    )
}

fn is_real(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::UnaryOp {
            op: UnaryOperator::USub,
            operand,
        } => is_real(operand),
        _ => matches!(expr.as_constant(), Some(ast::Constant::Int(_) | ast::Constant::Float(_))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::ast::{Module, Stmt};
    use crate::semantic;
    use pylower_common::ir::CodeUnit;
    use pylower_common::LoweringOptions;

    fn lower(body: Vec<Stmt>) -> CompileResult<CodeUnit> {
        let module: Module = module(body);
        let options = LoweringOptions::default();
        let table = semantic::analyze(&module, &options)?;
        Compiler::new(&table, &options, "test.py")?.compile_module(&module)
    }

    fn match_cases(cases: Vec<ast::MatchCase>) -> CompileResult<CodeUnit> {
        lower(vec![match_(name("subject"), cases)])
    }

    fn count(unit: &CodeUnit, op: Opcode) -> usize {
        unit.instructions.iter().filter(|i| i.op == op).count()
    }

    fn args(unit: &CodeUnit, op: Opcode) -> Vec<Operand> {
        unit.instructions.iter().filter(|i| i.op == op).map(|i| i.arg).collect()
    }

    fn stores(unit: &CodeUnit) -> Vec<String> {
        unit.instructions
            .iter()
            .filter_map(|i| match (i.op, i.arg) {
                (Opcode::StoreName, Operand::Name(n)) => Some(unit.names[n as usize].clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn trailing_wildcard_skips_subject_copy() {
        let unit = match_cases(vec![
            case(p_value(int(1)), None, vec![pass()]),
            case(p_wild(), None, vec![pass()]),
        ])
        .unwrap();
        assert_eq!(count(&unit, Opcode::Copy), 0);
        assert_eq!(count(&unit, Opcode::CompareOp), 1);
        assert!(unit.opcodes().contains(&Opcode::Nop));
    }

    #[test]
    fn earlier_cases_copy_the_subject() {
        let unit = match_cases(vec![
            case(p_value(int(1)), None, vec![pass()]),
            case(p_value(int(2)), None, vec![pass()]),
        ])
        .unwrap();
        assert_eq!(args(&unit, Opcode::Copy), vec![Operand::Int(1)]);
        // only a successful first case still has the subject to drop
        assert_eq!(count(&unit, Opcode::PopTop), 1);
    }

    #[test]
    fn sequence_with_star_wildcard_indexes() {
        let unit = match_cases(vec![case(
            p_seq(vec![p_name("a"), p_star(None), p_name("b")]),
            None,
            vec![pass()],
        )])
        .unwrap();
        assert_eq!(count(&unit, Opcode::UnpackEx), 0);
        assert_eq!(count(&unit, Opcode::UnpackSequence), 0);
        assert_eq!(count(&unit, Opcode::BinarySubscr), 2);
        assert_eq!(count(&unit, Opcode::MatchSequence), 1);
        assert_eq!(stores(&unit), ["a", "b"]);
    }

    #[test]
    fn sequence_with_named_star_unpacks() {
        let unit = match_cases(vec![case(
            p_seq(vec![p_name("a"), p_star(Some("rest")), p_name("b")]),
            None,
            vec![pass()],
        )])
        .unwrap();
        assert_eq!(args(&unit, Opcode::UnpackEx), vec![Operand::Int(1 | (1 << 8))]);
        assert_eq!(count(&unit, Opcode::BinarySubscr), 0);
        // len(subject) >= 2
        let ops = unit.opcodes();
        let get_len = ops.iter().position(|&op| op == Opcode::GetLen).unwrap();
        assert_eq!(ops[get_len + 2], Opcode::CompareOp);
        assert_eq!(stores(&unit), ["a", "rest", "b"]);
    }

    #[test]
    fn duplicate_capture_is_rejected() {
        let err = match_cases(vec![case(p_seq(vec![p_name("x"), p_name("x")]), None, vec![pass()])]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::MultipleAssignmentsInPattern("x".into()));
    }

    #[test]
    fn alternatives_must_bind_the_same_names() {
        let err = match_cases(vec![case(
            p_or(vec![p_seq(vec![p_name("x")]), p_seq(vec![p_name("y")])]),
            None,
            vec![pass()],
        )])
        .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::AlternativesBindDifferentNames);
    }

    #[test]
    fn alternatives_in_different_order_are_aligned() {
        let unit = match_cases(vec![case(
            p_or(vec![
                p_seq(vec![p_name("x"), p_name("y")]),
                p_seq(vec![p_name("y"), p_name("x")]),
            ]),
            None,
            vec![pass()],
        )])
        .unwrap();
        assert_eq!(stores(&unit), ["x", "y"]);
        assert_eq!(count(&unit, Opcode::MatchSequence), 2);
    }

    #[test]
    fn irrefutable_case_must_be_last() {
        let err = match_cases(vec![
            case(p_name("x"), None, vec![pass()]),
            case(p_value(int(1)), None, vec![pass()]),
        ])
        .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::NameCaptureUnreachable("x".into()));

        let err = match_cases(vec![
            case(p_or(vec![p_wild(), p_value(int(1))]), None, vec![pass()]),
            case(p_value(int(2)), None, vec![pass()]),
        ])
        .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::WildcardUnreachable);

        // a guard makes the capture refutable
        match_cases(vec![
            case(p_name("x"), Some(name("x")), vec![pass()]),
            case(p_value(int(1)), None, vec![pass()]),
        ])
        .unwrap();
    }

    #[test]
    fn mapping_pattern_shape() {
        let unit = match_cases(vec![case(
            p_mapping(vec![str_("a")], vec![p_name("x")], Some("rest")),
            None,
            vec![pass()],
        )])
        .unwrap();
        assert_eq!(count(&unit, Opcode::MatchMapping), 1);
        assert_eq!(count(&unit, Opcode::MatchKeys), 1);
        assert_eq!(count(&unit, Opcode::DeleteSubscr), 1);
        assert_eq!(stores(&unit), ["x", "rest"]);
    }

    #[test]
    fn mapping_keys_are_checked() {
        let err = match_cases(vec![case(
            p_mapping(vec![str_("a"), str_("a")], vec![p_wild(), p_wild()], None),
            None,
            vec![pass()],
        )])
        .unwrap_err();
        assert!(matches!(err.kind, CompileErrorKind::DuplicateMappingKey(_)));

        let err = match_cases(vec![case(p_mapping(vec![name("k")], vec![p_wild()], None), None, vec![pass()])])
            .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::MappingKeyNotLiteral);
    }

    fn mapping_keys(keys: Vec<Expr>) -> CompileResult<CodeUnit> {
        let patterns = keys.iter().map(|_| p_wild()).collect();
        match_cases(vec![case(p_mapping(keys, patterns, None), None, vec![pass()])])
    }

    #[test]
    fn signed_and_complex_mapping_keys() {
        let complex = constant(ast::Constant::Complex { real: 0.0, imag: 2.0 });
        let unit = mapping_keys(vec![
            unary(UnaryOperator::USub, int(1)),
            binop(int(1), Operator::Add, complex.clone()),
            binop(unary(UnaryOperator::USub, int(1)), Operator::Sub, complex),
        ])
        .unwrap();
        assert_eq!(count(&unit, Opcode::MatchKeys), 1);
        assert_eq!(args(&unit, Opcode::UnpackSequence), vec![Operand::Int(3)]);
    }

    #[test]
    fn equal_numbers_are_duplicate_keys() {
        let float = |f| constant(ast::Constant::Float(f));
        let duplicates = [
            vec![int(1), bool_(true)],
            vec![int(1), float(1.0)],
            vec![float(0.0), float(-0.0)],
            vec![int(0), constant(ast::Constant::Complex { real: 0.0, imag: 0.0 })],
            vec![unary(UnaryOperator::USub, int(1)), float(-1.0)],
        ];
        for keys in duplicates {
            let err = mapping_keys(keys).unwrap_err();
            assert!(matches!(err.kind, CompileErrorKind::DuplicateMappingKey(_)), "{err:?}");
        }

        let err = mapping_keys(vec![int(1), bool_(true)]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::DuplicateMappingKey("True".into()));

        mapping_keys(vec![str_("1"), constant(ast::Constant::Bytes(b"1".to_vec())), int(1), float(1.5)]).unwrap();
    }

    #[test]
    fn class_pattern_shape() {
        let unit = match_cases(vec![case(
            p_class(name("Point"), vec![p_name("x")], vec![("y", p_wild())]),
            None,
            vec![pass()],
        )])
        .unwrap();
        assert_eq!(args(&unit, Opcode::MatchClass), vec![Operand::Int(1)]);
        assert_eq!(args(&unit, Opcode::UnpackSequence), vec![Operand::Int(2)]);
        assert!(unit
            .consts
            .contains(&Constant::Tuple(vec![Constant::Str("y".into())])));
        assert_eq!(stores(&unit), ["x"]);
    }

    #[test]
    fn repeated_class_attribute_is_rejected() {
        let err = match_cases(vec![case(
            p_class(name("C"), vec![], vec![("a", p_wild()), ("a", p_wild())]),
            None,
            vec![pass()],
        )])
        .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::RepeatedClassPatternAttribute("a".into()));
    }

    #[test]
    fn value_patterns_must_be_literals() {
        let err = match_cases(vec![case(p_value(name("x")), None, vec![pass()])]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::PatternValueNotLiteral);
        match_cases(vec![case(p_value(attr(name("Color"), "RED")), None, vec![pass()])]).unwrap();
    }

    #[test]
    fn singleton_compares_by_identity() {
        let unit = match_cases(vec![case(p_singleton(ast::Constant::None), None, vec![pass()])]).unwrap();
        assert_eq!(args(&unit, Opcode::IsOp), vec![Operand::Int(0)]);
        assert_eq!(count(&unit, Opcode::CompareOp), 0);
    }

    #[test]
    fn as_pattern_binds_after_subpattern() {
        let unit = match_cases(vec![case(
            p_as(p_seq(vec![p_name("a")]), "whole"),
            None,
            vec![pass()],
        )])
        .unwrap();
        assert_eq!(stores(&unit), ["a", "whole"]);
    }
}
