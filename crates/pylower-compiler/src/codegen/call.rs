//! Calls and collection displays.
//!
//! Small calls and displays push every element and build in one
//! instruction. Once `*`/`**` unpacking appears, or the element count
//! would push the operand stack past [`STACK_USE_GUIDELINE`], the
//! collection is built up front and extended incrementally instead.

use pylower_common::ir::Constant;
use pylower_common::ir_opcodes::Intrinsic1;
use pylower_common::ir::Operand;
use pylower_common::Opcode;
use tracing::warn;

use super::compiler::{Compiler, NameCtx};
use crate::ast::{Expr, ExprKind, Keyword};
use crate::error::{CompileError, CompileErrorKind, CompileResult};

/// Operand-stack budget for a single display or argument list.
pub(crate) const STACK_USE_GUIDELINE: usize = 30;

/// Instructions used to build one kind of sequence incrementally.
#[derive(Clone, Copy)]
struct SequenceOps {
    build: Opcode,
    add: Opcode,
    extend: Opcode,
    /// Build a list and convert it at the end.
    tuple: bool,
}

const LIST_OPS: SequenceOps = SequenceOps {
    build: Opcode::BuildList,
    add: Opcode::ListAppend,
    extend: Opcode::ListExtend,
    tuple: false,
};

const TUPLE_OPS: SequenceOps = SequenceOps {
    tuple: true,
    ..LIST_OPS
};

const SET_OPS: SequenceOps = SequenceOps {
    build: Opcode::BuildSet,
    add: Opcode::SetAdd,
    extend: Opcode::SetUpdate,
    tuple: false,
};

impl<'a> Compiler<'a> {
    pub(crate) fn compile_list(&mut self, elts: &'a [Expr]) -> CompileResult<()> {
        self.starunpack(elts, 0, None, LIST_OPS)
    }

    pub(crate) fn compile_set(&mut self, elts: &'a [Expr]) -> CompileResult<()> {
        self.starunpack(elts, 0, None, SET_OPS)
    }

    pub(crate) fn compile_tuple(&mut self, elts: &'a [Expr]) -> CompileResult<()> {
        if !elts.is_empty() {
            if let Some(folded) = constant_items(elts) {
                return self.emit_const(Constant::Tuple(folded));
            }
        }
        self.starunpack(elts, 0, None, TUPLE_OPS)
    }

    /// Build a sequence from `pushed` values already on the stack, then
    /// `elts`, then the variable `tail` when given.
    fn starunpack(
        &mut self,
        elts: &'a [Expr],
        pushed: usize,
        tail: Option<&str>,
        ops: SequenceOps,
    ) -> CompileResult<()> {
        let loc = self.loc;
        let n = elts.len() + usize::from(tail.is_some());
        if n > 2 && tail.is_none() {
            if let Some(folded) = constant_items(elts) {
                if ops.tuple && pushed == 0 {
                    return self.emit_const(Constant::Tuple(folded));
                }
                self.emit_arg(ops.build, pushed as u32)?;
                self.emit_const(Constant::Tuple(folded))?;
                self.emit_arg(ops.extend, 1)?;
                if ops.tuple {
                    self.emit_intrinsic1(Intrinsic1::ListToTuple)?;
                }
                return Ok(());
            }
        }

        let big = n + pushed > STACK_USE_GUIDELINE;
        let seen_star = elts.iter().any(Expr::is_starred);
        if !seen_star && !big {
            for elt in elts {
                self.visit_expr(elt)?;
            }
            self.loc = loc;
            if let Some(tail) = tail {
                self.compile_name(tail, NameCtx::Load)?;
            }
            let build = if ops.tuple { Opcode::BuildTuple } else { ops.build };
            return self.emit_arg(build, (n + pushed) as u32);
        }

        let mut built = false;
        if big {
            self.emit_arg(ops.build, pushed as u32)?;
            built = true;
        }
        for (i, elt) in elts.iter().enumerate() {
            if let ExprKind::Starred { value } = &elt.kind {
                if !built {
                    self.loc = loc;
                    self.emit_arg(ops.build, (i + pushed) as u32)?;
                    built = true;
                }
                self.visit_expr(value)?;
                self.loc = loc;
                self.emit_arg(ops.extend, 1)?;
            } else {
                self.visit_expr(elt)?;
                if built {
                    self.loc = loc;
                    self.emit_arg(ops.add, 1)?;
                }
            }
        }
        if let Some(tail) = tail {
            self.loc = loc;
            self.compile_name(tail, NameCtx::Load)?;
            self.emit_arg(ops.add, 1)?;
        }
        if ops.tuple {
            self.loc = loc;
            self.emit_intrinsic1(Intrinsic1::ListToTuple)?;
        }
        Ok(())
    }

    // ========================================================================
    // Dict displays
    // ========================================================================

    /// `{k: v, **m}`: runs of plain entries become sub-dicts merged with
    /// `DICT_UPDATE`, as do `**` entries.
    pub(crate) fn compile_dict(&mut self, keys: &'a [Option<Expr>], values: &'a [Expr]) -> CompileResult<()> {
        let loc = self.loc;
        let entries: Vec<(Option<&'a Expr>, &'a Expr)> = keys.iter().map(Option::as_ref).zip(values).collect();
        let mut have_dict = false;
        let mut run = 0usize;
        for (i, &(key, value)) in entries.iter().enumerate() {
            match key {
                None => {
                    if run > 0 {
                        self.compile_subdict(&entries[i - run..i])?;
                        self.merge_dict(&mut have_dict, Opcode::DictUpdate)?;
                        run = 0;
                    }
                    if !have_dict {
                        self.loc = loc;
                        self.emit_arg(Opcode::BuildMap, 0)?;
                        have_dict = true;
                    }
                    self.visit_expr(value)?;
                    self.loc = loc;
                    self.emit_arg(Opcode::DictUpdate, 1)?;
                }
                Some(_) if run * 2 > STACK_USE_GUIDELINE => {
                    self.compile_subdict(&entries[i - run..=i])?;
                    self.merge_dict(&mut have_dict, Opcode::DictUpdate)?;
                    run = 0;
                }
                Some(_) => run += 1,
            }
        }
        if run > 0 {
            self.compile_subdict(&entries[entries.len() - run..])?;
            self.merge_dict(&mut have_dict, Opcode::DictUpdate)?;
        }
        if !have_dict {
            self.loc = loc;
            self.emit_arg(Opcode::BuildMap, 0)?;
        }
        Ok(())
    }

    /// Merge a freshly built dict into the one below it, if there is one.
    fn merge_dict(&mut self, have_dict: &mut bool, op: Opcode) -> CompileResult<()> {
        if *have_dict {
            self.emit_arg(op, 1)?;
        }
        *have_dict = true;
        Ok(())
    }

    fn compile_subdict(&mut self, entries: &[(Option<&'a Expr>, &'a Expr)]) -> CompileResult<()> {
        let loc = self.loc;
        let n = entries.len();
        let big = n * 2 > STACK_USE_GUIDELINE;
        let const_keys: Option<Vec<Constant>> = entries
            .iter()
            .map(|(k, _)| k.and_then(Expr::as_constant).map(|c| c.to_ir()))
            .collect();
        if let (true, Some(keys)) = (n > 1 && !big, const_keys) {
            for &(_, value) in entries {
                self.visit_expr(value)?;
            }
            self.loc = loc;
            self.emit_const(Constant::Tuple(keys))?;
            return self.emit_arg(Opcode::BuildConstKeyMap, n as u32);
        }
        if big {
            self.emit_arg(Opcode::BuildMap, 0)?;
        }
        for &(key, value) in entries {
            if let Some(key) = key {
                self.visit_expr(key)?;
            }
            self.visit_expr(value)?;
            if big {
                self.loc = loc;
                self.emit_arg(Opcode::MapAdd, 1)?;
            }
        }
        if !big {
            self.loc = loc;
            self.emit_arg(Opcode::BuildMap, n as u32)?;
        }
        Ok(())
    }

    // ========================================================================
    // Calls
    // ========================================================================

    pub(crate) fn compile_call(&mut self, func: &'a Expr, args: &'a [Expr], keywords: &'a [Keyword]) -> CompileResult<()> {
        let loc = self.loc;
        validate_keywords(keywords)?;
        if self.try_method_call(func, args, keywords)? {
            return Ok(());
        }
        check_caller(func);
        self.loc = Some(func.span);
        self.emit(Opcode::PushNull)?;
        self.visit_expr(func)?;
        self.loc = loc;
        self.call_helper(0, args, None, keywords)
    }

    /// `obj.meth(args)` without unpacking: `LOAD_METHOD` pushes the
    /// function and receiver so no bound method is created.
    fn try_method_call(&mut self, func: &'a Expr, args: &'a [Expr], keywords: &'a [Keyword]) -> CompileResult<bool> {
        let ExprKind::Attribute { value, attr } = &func.kind else {
            return Ok(false);
        };
        let (argc, kwc) = (args.len(), keywords.len());
        if argc + kwc + usize::from(kwc != 0) >= STACK_USE_GUIDELINE
            || args.iter().any(Expr::is_starred)
            || keywords.iter().any(|k| k.arg.is_none())
        {
            return Ok(false);
        }
        let loc = self.loc;
        self.visit_expr(value)?;
        self.loc = Some(func.span);
        self.emit_named(Opcode::LoadMethod, attr)?;
        for arg in args {
            self.visit_expr(arg)?;
        }
        if kwc > 0 {
            for kw in keywords {
                self.visit_expr(&kw.value)?;
            }
            self.emit_kw_names(keywords)?;
        }
        self.loc = loc;
        self.emit_arg(Opcode::Call, (argc + kwc) as u32)?;
        Ok(true)
    }

    fn emit_kw_names(&mut self, keywords: &[Keyword]) -> CompileResult<()> {
        let names = keywords
            .iter()
            .filter_map(|k| k.arg.clone())
            .map(Constant::Str)
            .collect();
        let idx = self.unit.consts.add(Constant::Tuple(names))?;
        self.emit_operand(Opcode::KwNames, Operand::Const(idx))
    }

    /// Call the callable sitting `pushed` positional values below the top.
    /// Used directly by class creation, which pre-pushes the body function
    /// and the class name, and for generic classes appends the variable
    /// `tail` as a last positional argument.
    pub(crate) fn call_helper(
        &mut self,
        pushed: usize,
        args: &'a [Expr],
        tail: Option<&str>,
        keywords: &'a [Keyword],
    ) -> CompileResult<()> {
        validate_keywords(keywords)?;
        let loc = self.loc;
        let (argc, kwc) = (args.len() + usize::from(tail.is_some()), keywords.len());
        let simple = argc + kwc * 2 <= STACK_USE_GUIDELINE
            && !args.iter().any(Expr::is_starred)
            && keywords.iter().all(|k| k.arg.is_some());
        if simple {
            for arg in args {
                self.visit_expr(arg)?;
            }
            if let Some(tail) = tail {
                self.loc = loc;
                self.compile_name(tail, NameCtx::Load)?;
            }
            if kwc > 0 {
                for kw in keywords {
                    self.visit_expr(&kw.value)?;
                }
                self.loc = loc;
                self.emit_kw_names(keywords)?;
            }
            self.loc = loc;
            return self.emit_arg(Opcode::Call, (pushed + argc + kwc) as u32);
        }

        // positional arguments as one tuple
        match args {
            [Expr {
                kind: ExprKind::Starred { value },
                ..
            }] if pushed == 0 && tail.is_none() => self.visit_expr(value)?,
            _ => self.starunpack(args, pushed, tail, TUPLE_OPS)?,
        }

        // keyword arguments as one dict
        if kwc > 0 {
            let mut have_dict = false;
            let mut run = 0usize;
            for (i, kw) in keywords.iter().enumerate() {
                if kw.arg.is_some() {
                    run += 1;
                    continue;
                }
                if run > 0 {
                    self.compile_subkwargs(&keywords[i - run..i])?;
                    self.merge_dict(&mut have_dict, Opcode::DictMerge)?;
                    run = 0;
                }
                if !have_dict {
                    self.loc = loc;
                    self.emit_arg(Opcode::BuildMap, 0)?;
                    have_dict = true;
                }
                self.visit_expr(&kw.value)?;
                self.loc = loc;
                self.emit_arg(Opcode::DictMerge, 1)?;
            }
            if run > 0 {
                self.compile_subkwargs(&keywords[kwc - run..])?;
                self.merge_dict(&mut have_dict, Opcode::DictMerge)?;
            }
        }
        self.loc = loc;
        self.emit_arg(Opcode::CallFunctionEx, u32::from(kwc > 0))
    }

    /// A run of named keyword arguments as a dict.
    fn compile_subkwargs(&mut self, keywords: &'a [Keyword]) -> CompileResult<()> {
        let loc = self.loc;
        let n = keywords.len();
        let big = n * 2 > STACK_USE_GUIDELINE;
        if n > 1 && !big {
            for kw in keywords {
                self.visit_expr(&kw.value)?;
            }
            self.loc = loc;
            let names = keywords
                .iter()
                .filter_map(|k| k.arg.clone())
                .map(Constant::Str)
                .collect();
            self.emit_const(Constant::Tuple(names))?;
            return self.emit_arg(Opcode::BuildConstKeyMap, n as u32);
        }
        if big {
            self.loc = None;
            self.emit_arg(Opcode::BuildMap, 0)?;
        }
        for kw in keywords {
            self.loc = loc;
            self.emit_const(Constant::Str(kw.arg.clone().unwrap_or_default()))?;
            self.visit_expr(&kw.value)?;
            if big {
                self.loc = None;
                self.emit_arg(Opcode::MapAdd, 1)?;
            }
        }
        if !big {
            self.loc = loc;
            self.emit_arg(Opcode::BuildMap, n as u32)?;
        }
        Ok(())
    }
}

/// Values of `elts` when every one is a literal.
fn constant_items(elts: &[Expr]) -> Option<Vec<Constant>> {
    elts.iter().map(|e| e.as_constant().map(|c| c.to_ir())).collect()
}

fn validate_keywords(keywords: &[Keyword]) -> CompileResult<()> {
    for (i, kw) in keywords.iter().enumerate() {
        let Some(name) = &kw.arg else { continue };
        if name == "__debug__" {
            return Err(CompileError::at(CompileErrorKind::AssignToDebug, kw.span));
        }
        if let Some(other) = keywords[i + 1..].iter().find(|o| o.arg.as_ref() == Some(name)) {
            return Err(CompileError::at(
                CompileErrorKind::RepeatedKeywordArgument(name.clone()),
                other.span,
            ));
        }
    }
    Ok(())
}

/// Calling a literal always fails at run time; usually a missing comma.
fn check_caller(func: &Expr) {
    let kind = match &func.kind {
        ExprKind::Constant { .. } | ExprKind::JoinedStr { .. } => "literal",
        ExprKind::Tuple { .. } => "tuple",
        ExprKind::List { .. } | ExprKind::ListComp { .. } => "list",
        ExprKind::Dict { .. } | ExprKind::DictComp { .. } => "dict",
        ExprKind::Set { .. } | ExprKind::SetComp { .. } => "set",
        ExprKind::GeneratorExp { .. } => "generator",
        _ => return,
    };
    warn!(line = func.span.start.line, "{kind} object is not callable; perhaps you missed a comma?");
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

    fn find(unit: &CodeUnit, op: Opcode) -> Option<Operand> {
        unit.instructions.iter().find(|i| i.op == op).map(|i| i.arg)
    }

    fn count(unit: &CodeUnit, op: Opcode) -> usize {
        unit.instructions.iter().filter(|i| i.op == op).count()
    }

    #[test]
    fn plain_call_pushes_null() {
        let unit = lower(vec![expr_stmt(call(name("f"), vec![int(1), name("x")]))]).unwrap();
        assert_eq!(
            unit.opcodes()[..5],
            [
                Opcode::PushNull,
                Opcode::LoadName,
                Opcode::LoadConst,
                Opcode::LoadName,
                Opcode::Call
            ]
        );
        assert_eq!(find(&unit, Opcode::Call), Some(Operand::Int(2)));
    }

    #[test]
    fn method_call_uses_load_method() {
        let unit = lower(vec![expr_stmt(call_kw(
            attr(name("obj"), "m"),
            vec![int(1)],
            vec![(Some("k"), int(2))],
        ))])
        .unwrap();
        assert_eq!(count(&unit, Opcode::PushNull), 0);
        assert_eq!(count(&unit, Opcode::LoadMethod), 1);
        assert_eq!(count(&unit, Opcode::KwNames), 1);
        assert_eq!(find(&unit, Opcode::Call), Some(Operand::Int(2)));
    }

    #[test]
    fn starred_call_goes_through_call_function_ex() {
        let unit = lower(vec![expr_stmt(call_kw(
            name("f"),
            vec![name("a"), starred(name("rest"))],
            vec![(Some("k"), int(1)), (None, name("extra"))],
        ))])
        .unwrap();
        assert_eq!(count(&unit, Opcode::ListExtend), 1);
        assert_eq!(count(&unit, Opcode::CallIntrinsic1), 1);
        // the leading keyword run becomes the dict `**extra` merges into
        assert_eq!(count(&unit, Opcode::DictMerge), 1);
        assert_eq!(find(&unit, Opcode::CallFunctionEx), Some(Operand::Int(1)));
    }

    #[test]
    fn single_star_argument_is_passed_through() {
        let unit = lower(vec![expr_stmt(call(name("f"), vec![starred(name("xs"))]))]).unwrap();
        assert_eq!(count(&unit, Opcode::BuildList), 0);
        assert_eq!(find(&unit, Opcode::CallFunctionEx), Some(Operand::Int(0)));
    }

    #[test]
    fn repeated_keyword_is_rejected() {
        let err = lower(vec![expr_stmt(call_kw(
            name("f"),
            vec![],
            vec![(Some("a"), int(1)), (Some("a"), int(2))],
        ))])
        .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::RepeatedKeywordArgument("a".into()));
    }

    #[test]
    fn constant_tuple_is_folded() {
        let unit = lower(vec![assign(name("t"), tuple(vec![int(1), int(2)]))]).unwrap();
        assert_eq!(count(&unit, Opcode::BuildTuple), 0);
        assert!(unit
            .consts
            .contains(&Constant::Tuple(vec![Constant::Int(1), Constant::Int(2)])));
    }

    #[test]
    fn constant_list_extends_from_tuple() {
        let unit = lower(vec![assign(name("l"), list(vec![int(1), int(2), int(3)]))]).unwrap();
        assert_eq!(find(&unit, Opcode::BuildList), Some(Operand::Int(0)));
        assert_eq!(count(&unit, Opcode::ListExtend), 1);
    }

    #[test]
    fn large_display_is_built_incrementally() {
        let elts: Vec<Expr> = (0..40).map(|i| name(&format!("v{i}"))).collect();
        let unit = lower(vec![assign(name("l"), list(elts))]).unwrap();
        assert_eq!(count(&unit, Opcode::ListAppend), 40);
        assert!(unit.max_stack_depth <= 3);
    }

    #[test]
    fn dict_with_unpacking_merges() {
        let unit = lower(vec![assign(
            name("d"),
            dict(vec![
                (Some(str_("a")), int(1)),
                (Some(str_("b")), int(2)),
                (None, name("other")),
                (Some(name("k")), int(3)),
            ]),
        )])
        .unwrap();
        assert_eq!(find(&unit, Opcode::BuildConstKeyMap), Some(Operand::Int(2)));
        assert_eq!(count(&unit, Opcode::DictUpdate), 2);
        assert_eq!(find(&unit, Opcode::BuildMap), Some(Operand::Int(1)));
    }

    #[test]
    fn empty_dict() {
        let unit = lower(vec![assign(name("d"), dict(vec![]))]).unwrap();
        assert_eq!(find(&unit, Opcode::BuildMap), Some(Operand::Int(0)));
    }
}
