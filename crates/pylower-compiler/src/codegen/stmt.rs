//! Statement lowering: dispatch, assignment targets, loops, imports and
//! the early exits (`break`, `continue`, `return`) that unwind frame blocks.

use std::mem;

use pylower_common::ir::Constant;
use pylower_common::ir_opcodes::Intrinsic1;
use pylower_common::Opcode;

use super::compiler::{Compiler, NameCtx};
use super::expr::{binary_operator, describe, two_element_slice};
use super::fblock::{FBlock, FBlockKind};
use crate::ast::{Alias, Expr, ExprKind, Operator, Stmt, StmtKind};
use crate::error::{CompileError, CompileErrorKind, CompileResult};
use pylower_common::ir::UnitKind;

impl<'a> Compiler<'a> {
    pub(crate) fn visit_body(&mut self, body: &'a [Stmt]) -> CompileResult<()> {
        for stmt in body {
            self.visit_stmt(stmt)?;
        }
        Ok(())
    }

    pub(crate) fn visit_stmt(&mut self, stmt: &'a Stmt) -> CompileResult<()> {
        self.loc = Some(stmt.span);
        self.nested(|c| c.lower_stmt(stmt))
    }

    fn lower_stmt(&mut self, stmt: &'a Stmt) -> CompileResult<()> {
        match &stmt.kind {
            StmtKind::FunctionDef(def) => self.compile_function_def(stmt, def),
            StmtKind::ClassDef(def) => self.compile_class_def(stmt, def),
            StmtKind::Return { value } => self.compile_return(value.as_ref()),
            StmtKind::Delete { targets } => {
                for target in targets {
                    self.compile_delete(target)?;
                }
                Ok(())
            }
            StmtKind::Assign { targets, value } => {
                self.visit_expr(value)?;
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        self.emit_arg(Opcode::Copy, 1)?;
                    }
                    self.compile_store(target)?;
                }
                Ok(())
            }
            StmtKind::AugAssign { target, op, value } => self.compile_augassign(target, *op, value),
            StmtKind::AnnAssign {
                target,
                annotation,
                value,
                simple,
            } => self.compile_annassign(target, annotation, value.as_ref(), *simple),
            StmtKind::TypeAlias {
                name,
                type_params,
                value,
            } => self.compile_type_alias(stmt, name, type_params, value),
            StmtKind::For {
                is_async: false,
                target,
                iter,
                body,
                orelse,
            } => self.compile_for(target, iter, body, orelse),
            StmtKind::For {
                is_async: true,
                target,
                iter,
                body,
                orelse,
            } => self.compile_async_for(target, iter, body, orelse),
            StmtKind::While { test, body, orelse } => self.compile_while(test, body, orelse),
            StmtKind::If { test, body, orelse } => self.compile_if(test, body, orelse),
            StmtKind::With {
                is_async,
                items,
                body,
            } => {
                if *is_async {
                    self.compile_async_with(stmt, items, body, 0)
                } else {
                    self.compile_with(stmt, items, body, 0)
                }
            }
            StmtKind::Match { subject, cases } => self.compile_match(subject, cases),
            StmtKind::Raise { exc, cause } => {
                let mut count = 0;
                if let Some(exc) = exc {
                    self.visit_expr(exc)?;
                    count += 1;
                    if let Some(cause) = cause {
                        self.visit_expr(cause)?;
                        count += 1;
                    }
                }
                self.loc = Some(stmt.span);
                self.emit_arg(Opcode::RaiseVarargs, count)
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
                is_star,
            } => {
                if !finalbody.is_empty() {
                    self.compile_try_finally(stmt, body, handlers, orelse, finalbody, *is_star)
                } else if handlers.is_empty() {
                    self.visit_body(body)?;
                    self.visit_body(orelse)
                } else if *is_star {
                    self.compile_try_star_except(stmt, body, handlers, orelse)
                } else {
                    self.compile_try_except(stmt, body, handlers, orelse)
                }
            }
            StmtKind::Assert { test, msg } => self.compile_assert(stmt, test, msg.as_ref()),
            StmtKind::Import { names } => self.compile_import(names),
            StmtKind::ImportFrom {
                module,
                names,
                level,
            } => self.compile_import_from(stmt, module.as_deref(), names, *level),
            StmtKind::Global { .. } | StmtKind::Nonlocal { .. } => Ok(()),
            StmtKind::Expr { value } => self.compile_expr_stmt(value),
            StmtKind::Pass => self.emit(Opcode::Nop),
            StmtKind::Break => self.compile_break(),
            StmtKind::Continue => self.compile_continue(),
        }
    }

    fn compile_expr_stmt(&mut self, value: &'a Expr) -> CompileResult<()> {
        if self.interactive && self.unit.kind == UnitKind::Module {
            self.visit_expr(value)?;
            self.emit_intrinsic1(Intrinsic1::Print)?;
            self.loc = None;
            return self.emit(Opcode::PopTop);
        }
        if value.as_constant().is_some() {
            return self.emit(Opcode::Nop);
        }
        self.visit_expr(value)?;
        self.loc = None;
        self.emit(Opcode::PopTop)
    }

    // ========================================================================
    // Branches and loops
    // ========================================================================

    fn compile_if(&mut self, test: &'a Expr, body: &'a [Stmt], orelse: &'a [Stmt]) -> CompileResult<()> {
        match self.constant_truth(test) {
            Some(true) => {
                self.visit_body(body)?;
                return self.check_dead_body(orelse);
            }
            Some(false) => {
                self.check_dead_body(body)?;
                return self.visit_body(orelse);
            }
            None => {}
        }
        let end = self.new_label()?;
        let next = if orelse.is_empty() { end } else { self.new_label()? };
        self.jump_if(test, next, false)?;
        self.visit_body(body)?;
        if !orelse.is_empty() {
            self.loc = None;
            self.emit_jump(Opcode::Jump, end)?;
            self.place(next)?;
            self.visit_body(orelse)?;
        }
        self.place(end)
    }

    /// Lower a branch that never runs for its errors alone, then drop
    /// everything it emitted.
    fn check_dead_body(&mut self, body: &'a [Stmt]) -> CompileResult<()> {
        if body.is_empty() {
            return Ok(());
        }
        let seq = mem::take(&mut self.unit.seq);
        let consts = mem::take(&mut self.unit.consts);
        let names = mem::take(&mut self.unit.names);
        let varnames = self.unit.varnames.clone();
        let flags = self.unit.flags;
        let loc = self.loc;
        let result = self.visit_body(body);
        self.unit.seq = seq;
        self.unit.consts = consts;
        self.unit.names = names;
        self.unit.varnames = varnames;
        self.unit.flags = flags;
        self.loc = loc;
        result
    }

    fn compile_while(&mut self, test: &'a Expr, body: &'a [Stmt], orelse: &'a [Stmt]) -> CompileResult<()> {
        let loc = self.loc;
        let head = self.new_label()?;
        let body_start = self.new_label()?;
        let anchor = self.new_label()?;
        let end = self.new_label()?;

        self.place(head)?;
        let mut guard = self.push_fblock(FBlock::new(FBlockKind::WhileLoop, Some(head), Some(end)))?;
        guard.jump_if(test, anchor, false)?;
        guard.place(body_start)?;
        guard.visit_body(body)?;
        guard.loc = loc;
        guard.jump_if(test, body_start, true)?;
        guard.finish()?;

        self.place(anchor)?;
        self.visit_body(orelse)?;
        self.place(end)
    }

    fn compile_for(
        &mut self,
        target: &'a Expr,
        iter: &'a Expr,
        body: &'a [Stmt],
        orelse: &'a [Stmt],
    ) -> CompileResult<()> {
        let loc = self.loc;
        let start = self.new_label()?;
        let cleanup = self.new_label()?;
        let end = self.new_label()?;

        let mut guard = self.push_fblock(FBlock::new(FBlockKind::ForLoop, Some(start), Some(end)))?;
        guard.visit_expr(iter)?;
        guard.loc = loc;
        guard.emit(Opcode::GetIter)?;
        guard.place(start)?;
        guard.emit_jump(Opcode::ForIter, cleanup)?;
        guard.compile_store(target)?;
        guard.visit_body(body)?;
        guard.loc = None;
        guard.emit_jump(Opcode::Jump, start)?;
        guard.place(cleanup)?;
        guard.emit(Opcode::EndFor)?;
        guard.finish()?;

        self.visit_body(orelse)?;
        self.place(end)
    }

    fn compile_async_for(
        &mut self,
        target: &'a Expr,
        iter: &'a Expr,
        body: &'a [Stmt],
        orelse: &'a [Stmt],
    ) -> CompileResult<()> {
        if self.unit.kind != UnitKind::AsyncFunction {
            return Err(CompileError::new(
                CompileErrorKind::AsyncOutsideAsyncFunction("'async for'"),
                self.loc,
            ));
        }
        let loc = self.loc;
        let start = self.new_label()?;
        let except = self.new_label()?;
        let end = self.new_label()?;

        self.visit_expr(iter)?;
        self.loc = loc;
        self.emit(Opcode::GetAiter)?;
        self.place(start)?;
        {
            let mut guard = self.push_fblock(FBlock::new(FBlockKind::AsyncForLoop, Some(start), Some(end)))?;
            guard.emit_jump(Opcode::SetupFinally, except)?;
            guard.emit(Opcode::GetAnext)?;
            guard.emit_yield_from()?;
            guard.emit(Opcode::PopBlock)?;
            guard.compile_store(target)?;
            guard.visit_body(body)?;
            guard.loc = None;
            guard.emit_jump(Opcode::Jump, start)?;
            guard.finish()?;
        }
        self.place(except)?;
        self.loc = Some(iter.span);
        self.emit(Opcode::EndAsyncFor)?;
        self.visit_body(orelse)?;
        self.place(end)
    }

    fn compile_break(&mut self) -> CompileResult<()> {
        let origin = self.loc;
        self.emit(Opcode::Nop)?;
        let Some(lp) = self.unwind_fblock_stack(false, true)? else {
            return Err(CompileError::new(CompileErrorKind::BreakOutsideLoop, origin));
        };
        self.unwind_fblock(&lp, false)?;
        match lp.exit {
            Some(exit) => self.emit_jump(Opcode::Jump, exit),
            None => Err(CompileError::new(CompileErrorKind::BreakOutsideLoop, origin)),
        }
    }

    fn compile_continue(&mut self) -> CompileResult<()> {
        let origin = self.loc;
        self.emit(Opcode::Nop)?;
        let Some(lp) = self.unwind_fblock_stack(false, true)? else {
            return Err(CompileError::new(CompileErrorKind::ContinueOutsideLoop, origin));
        };
        match lp.block {
            Some(head) => self.emit_jump(Opcode::Jump, head),
            None => Err(CompileError::new(CompileErrorKind::ContinueOutsideLoop, origin)),
        }
    }

    fn compile_return(&mut self, value: Option<&'a Expr>) -> CompileResult<()> {
        let loc = self.loc;
        if !self.unit.kind.is_function_like() {
            return Err(CompileError::new(CompileErrorKind::ReturnOutsideFunction, loc));
        }
        if value.is_some() && self.unit.flags.async_generator {
            return Err(CompileError::new(CompileErrorKind::ReturnValueInAsyncGenerator, loc));
        }
        let constant = value.and_then(Expr::as_constant);
        let preserve_tos = value.is_some() && constant.is_none();
        match value {
            Some(value) if preserve_tos => self.visit_expr(value)?,
            _ => self.emit(Opcode::Nop)?,
        }
        self.loc = loc;
        self.unwind_fblock_stack(preserve_tos, false)?;
        if !preserve_tos {
            match constant {
                Some(c) => self.emit_const(c.to_ir())?,
                None => self.emit_none()?,
            }
        }
        self.emit(Opcode::ReturnValue)
    }

    fn compile_assert(&mut self, stmt: &'a Stmt, test: &'a Expr, msg: Option<&'a Expr>) -> CompileResult<()> {
        if self.options.optimize > 0 {
            return Ok(());
        }
        let end = self.new_label()?;
        self.jump_if(test, end, true)?;
        self.loc = Some(stmt.span);
        self.emit(Opcode::LoadAssertionError)?;
        if let Some(msg) = msg {
            self.visit_expr(msg)?;
            self.loc = Some(stmt.span);
            self.emit_arg(Opcode::Call, 0)?;
        }
        self.emit_arg(Opcode::RaiseVarargs, 1)?;
        self.place(end)
    }

    // ========================================================================
    // Imports
    // ========================================================================

    fn compile_import(&mut self, names: &'a [Alias]) -> CompileResult<()> {
        for alias in names {
            self.emit_const(Constant::Int(0))?;
            self.emit_none()?;
            self.emit_named(Opcode::ImportName, &alias.name)?;
            match &alias.asname {
                Some(asname) => self.import_as(&alias.name, asname)?,
                None => {
                    let top = alias.name.split('.').next().unwrap_or(&alias.name);
                    self.compile_name(top, NameCtx::Store)?;
                }
            }
        }
        Ok(())
    }

    /// Bind `import a.b.c as d`: walk the attribute chain down from the
    /// top-level package left by `IMPORT_NAME`.
    fn import_as(&mut self, dotted: &str, asname: &str) -> CompileResult<()> {
        let mut parts = dotted.split('.').skip(1).peekable();
        if parts.peek().is_none() {
            return self.compile_name(asname, NameCtx::Store);
        }
        while let Some(attr) = parts.next() {
            self.emit_named(Opcode::ImportFrom, attr)?;
            if parts.peek().is_some() {
                self.emit_arg(Opcode::Swap, 2)?;
                self.emit(Opcode::PopTop)?;
            }
        }
        self.compile_name(asname, NameCtx::Store)?;
        self.emit(Opcode::PopTop)
    }

    fn compile_import_from(
        &mut self,
        stmt: &'a Stmt,
        module: Option<&str>,
        names: &'a [Alias],
        level: u32,
    ) -> CompileResult<()> {
        self.emit_const(Constant::Int(i64::from(level)))?;
        let fromlist = names.iter().map(|a| Constant::Str(a.name.clone())).collect();
        self.emit_const(Constant::Tuple(fromlist))?;
        self.emit_named(Opcode::ImportName, module.unwrap_or(""))?;
        for (i, alias) in names.iter().enumerate() {
            if i == 0 && alias.name == "*" {
                if self.unit.kind != UnitKind::Module {
                    return Err(CompileError::at(
                        CompileErrorKind::ImportStarNotAtModuleLevel,
                        stmt.span,
                    ));
                }
                self.emit_intrinsic1(Intrinsic1::ImportStar)?;
                self.loc = None;
                return self.emit(Opcode::PopTop);
            }
            self.emit_named(Opcode::ImportFrom, &alias.name)?;
            let store = alias.asname.as_deref().unwrap_or(&alias.name);
            self.compile_name(store, NameCtx::Store)?;
        }
        self.emit(Opcode::PopTop)
    }

    // ========================================================================
    // Assignment targets
    // ========================================================================

    /// Store the value on top of the stack into `target`.
    pub(crate) fn compile_store(&mut self, target: &'a Expr) -> CompileResult<()> {
        let saved = self.loc;
        self.loc = Some(target.span);
        let result = self.nested(|c| c.store_target(target));
        self.loc = saved;
        result
    }

    fn store_target(&mut self, target: &'a Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name { id } => self.compile_name(id, NameCtx::Store),
            ExprKind::Attribute { value, attr } => {
                self.visit_expr(value)?;
                self.loc = Some(target.span);
                self.emit_named(Opcode::StoreAttr, attr)
            }
            ExprKind::Subscript { value, slice } => {
                self.visit_expr(value)?;
                if let Some((lower, upper)) = two_element_slice(slice) {
                    self.compile_slice_bounds(lower, upper)?;
                    self.loc = Some(target.span);
                    self.emit(Opcode::StoreSlice)
                } else {
                    self.visit_expr(slice)?;
                    self.loc = Some(target.span);
                    self.emit(Opcode::StoreSubscr)
                }
            }
            ExprKind::List { elts } | ExprKind::Tuple { elts } => self.unpack_into(elts),
            ExprKind::Starred { .. } => Err(CompileError::at(
                CompileErrorKind::StarredTargetNotInSequence,
                target.span,
            )),
            _ => Err(CompileError::at(
                CompileErrorKind::InvalidAssignTarget(describe(target)),
                target.span,
            )),
        }
    }

    /// Unpack the sequence on top of the stack into `elts`, with at most one starred target.
    fn unpack_into(&mut self, elts: &'a [Expr]) -> CompileResult<()> {
        let mut star = None;
        for (i, elt) in elts.iter().enumerate() {
            if elt.is_starred() {
                if star.is_some() {
                    return Err(CompileError::at(CompileErrorKind::MultipleStarredTargets, elt.span));
                }
                star = Some(i);
            }
        }
        match star {
            Some(before) => {
                let after = elts.len() - before - 1;
                if before >= 1 << 8 || after >= 1 << 24 {
                    return Err(CompileError::new(CompileErrorKind::TooManyStarUnpackTargets, self.loc));
                }
                self.emit_arg(Opcode::UnpackEx, (before | (after << 8)) as u32)?;
            }
            None => self.emit_arg(Opcode::UnpackSequence, elts.len() as u32)?,
        }
        for elt in elts {
            match &elt.kind {
                ExprKind::Starred { value } => self.compile_store(value)?,
                _ => self.compile_store(elt)?,
            }
        }
        Ok(())
    }

    fn compile_delete(&mut self, target: &'a Expr) -> CompileResult<()> {
        self.loc = Some(target.span);
        match &target.kind {
            ExprKind::Name { id } => self.compile_name(id, NameCtx::Del),
            ExprKind::Attribute { value, attr } => {
                self.visit_expr(value)?;
                self.loc = Some(target.span);
                self.emit_named(Opcode::DeleteAttr, attr)
            }
            ExprKind::Subscript { value, slice } => {
                self.visit_expr(value)?;
                self.visit_expr(slice)?;
                self.loc = Some(target.span);
                self.emit(Opcode::DeleteSubscr)
            }
            ExprKind::List { elts } | ExprKind::Tuple { elts } => {
                for elt in elts {
                    self.nested(|c| c.compile_delete(elt))?;
                }
                Ok(())
            }
            _ => Err(CompileError::at(
                CompileErrorKind::InvalidDeleteTarget(describe(target)),
                target.span,
            )),
        }
    }

    /// `target op= value`, evaluating the container and key of the target once.
    fn compile_augassign(&mut self, target: &'a Expr, op: Operator, value: &'a Expr) -> CompileResult<()> {
        let loc = self.loc;
        let inplace = binary_operator(op).oparg(true);
        match &target.kind {
            ExprKind::Attribute { value: obj, attr } => {
                self.visit_expr(obj)?;
                self.loc = Some(target.span);
                self.emit_arg(Opcode::Copy, 1)?;
                self.emit_named(Opcode::LoadAttr, attr)?;
                self.visit_expr(value)?;
                self.loc = loc;
                self.emit_arg(Opcode::BinaryOp, inplace)?;
                self.loc = Some(target.span);
                self.emit_arg(Opcode::Swap, 2)?;
                self.emit_named(Opcode::StoreAttr, attr)
            }
            ExprKind::Subscript { value: obj, slice } => {
                self.visit_expr(obj)?;
                let bounds = two_element_slice(slice);
                match bounds {
                    Some((lower, upper)) => {
                        self.compile_slice_bounds(lower, upper)?;
                        self.loc = Some(target.span);
                        for _ in 0..3 {
                            self.emit_arg(Opcode::Copy, 3)?;
                        }
                        self.emit(Opcode::BinarySlice)?;
                    }
                    None => {
                        self.visit_expr(slice)?;
                        self.loc = Some(target.span);
                        self.emit_arg(Opcode::Copy, 2)?;
                        self.emit_arg(Opcode::Copy, 2)?;
                        self.emit(Opcode::BinarySubscr)?;
                    }
                }
                self.visit_expr(value)?;
                self.loc = loc;
                self.emit_arg(Opcode::BinaryOp, inplace)?;
                self.loc = Some(target.span);
                if bounds.is_some() {
                    self.emit_arg(Opcode::Swap, 4)?;
                    self.emit_arg(Opcode::Swap, 3)?;
                    self.emit_arg(Opcode::Swap, 2)?;
                    self.emit(Opcode::StoreSlice)
                } else {
                    self.emit_arg(Opcode::Swap, 3)?;
                    self.emit_arg(Opcode::Swap, 2)?;
                    self.emit(Opcode::StoreSubscr)
                }
            }
            ExprKind::Name { id } => {
                self.loc = Some(target.span);
                self.compile_name(id, NameCtx::Load)?;
                self.visit_expr(value)?;
                self.loc = loc;
                self.emit_arg(Opcode::BinaryOp, inplace)?;
                self.loc = Some(target.span);
                self.compile_name(id, NameCtx::Store)
            }
            _ => Err(CompileError::at(
                CompileErrorKind::InvalidAssignTarget(describe(target)),
                target.span,
            )),
        }
    }

    /// Annotated assignment. Annotations are evaluated only in module and
    /// class bodies; simple names record theirs in `__annotations__`.
    fn compile_annassign(
        &mut self,
        target: &'a Expr,
        annotation: &'a Expr,
        value: Option<&'a Expr>,
        simple: bool,
    ) -> CompileResult<()> {
        let loc = self.loc;
        if let Some(value) = value {
            self.visit_expr(value)?;
            self.compile_store(target)?;
        }
        let evaluates = matches!(self.unit.kind, UnitKind::Module | UnitKind::Class);
        match &target.kind {
            ExprKind::Name { id } => {
                if id == "__debug__" {
                    return Err(CompileError::at(CompileErrorKind::AssignToDebug, target.span));
                }
                if simple && evaluates {
                    self.visit_expr(annotation)?;
                    self.loc = loc;
                    self.emit_named(Opcode::LoadName, "__annotations__")?;
                    self.emit_const(Constant::Str(id.clone()))?;
                    self.emit(Opcode::StoreSubscr)?;
                }
            }
            ExprKind::Attribute { value: obj, .. } => {
                if value.is_none() {
                    self.check_ann_expr(obj)?;
                }
            }
            ExprKind::Subscript { value: obj, slice } => {
                if value.is_none() {
                    self.check_ann_expr(obj)?;
                    self.check_ann_subscript(slice)?;
                }
            }
            _ => {
                return Err(CompileError::at(
                    CompileErrorKind::InvalidAssignTarget(describe(target)),
                    target.span,
                ))
            }
        }
        if !simple && evaluates {
            self.check_ann_expr(annotation)?;
        }
        Ok(())
    }

    /// Evaluate an expression for its side effects only.
    fn check_ann_expr(&mut self, expr: &'a Expr) -> CompileResult<()> {
        self.visit_expr(expr)?;
        self.emit(Opcode::PopTop)
    }

    fn check_ann_subscript(&mut self, slice: &'a Expr) -> CompileResult<()> {
        match &slice.kind {
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.check_ann_expr(part)?;
                }
                Ok(())
            }
            ExprKind::Tuple { elts } => {
                for elt in elts {
                    self.check_ann_subscript(elt)?;
                }
                Ok(())
            }
            _ => self.check_ann_expr(slice),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::ast::{Module, UnaryOperator};
    use crate::semantic;
    use pylower_common::ir::{CodeUnit, Operand};
    use pylower_common::LoweringOptions;

    fn lower_with(module: &Module, options: &LoweringOptions) -> CompileResult<CodeUnit> {
        let table = semantic::analyze(module, options)?;
        Compiler::new(&table, options, "test.py")?.compile_module(module)
    }

    fn lower(body: Vec<Stmt>) -> CompileResult<CodeUnit> {
        lower_with(&module(body), &LoweringOptions::default())
    }

    fn count(unit: &CodeUnit, op: Opcode) -> usize {
        unit.instructions.iter().filter(|i| i.op == op).count()
    }

    #[test]
    fn for_loop_break_skips_iterator_cleanup() {
        let unit = lower(vec![for_(
            name("i"),
            call(name("range"), vec![int(3)]),
            vec![break_()],
        )])
        .unwrap();
        let ops = unit.opcodes();
        let for_iter = ops.iter().position(|op| *op == Opcode::ForIter).unwrap();
        let cleanup = unit.instructions[for_iter].arg.label().unwrap();
        let break_jump = unit
            .instructions
            .iter()
            .enumerate()
            .skip(for_iter)
            .find(|(i, instr)| instr.op == Opcode::Jump && ops[i - 1] == Opcode::PopTop)
            .map(|(_, instr)| instr.arg.label().unwrap())
            .unwrap();
        assert_ne!(break_jump, cleanup);
        let exit_at = unit.label_target(break_jump).unwrap();
        let cleanup_at = unit.label_target(cleanup).unwrap();
        assert!(exit_at > cleanup_at);
        assert_eq!(ops[cleanup_at], Opcode::EndFor);
    }

    #[test]
    fn break_and_continue_outside_loop() {
        let err = lower(vec![break_()]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::BreakOutsideLoop);
        let err = lower(vec![if_(name("x"), vec![continue_()], vec![])]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::ContinueOutsideLoop);
    }

    #[test]
    fn break_inside_finally_runs_the_finally_body() {
        let unit = lower(vec![while_(
            name("x"),
            vec![try_(
                vec![break_()],
                vec![],
                vec![],
                vec![expr_stmt(call(name("cleanup"), vec![]))],
            )],
        )])
        .unwrap();
        // normal exit, exceptional exit and the break path each run it
        let cleanup = unit.names.iter().position(|n| n == "cleanup").unwrap() as u32;
        let loads = unit
            .instructions
            .iter()
            .filter(|i| i.op == Opcode::LoadName && i.arg == Operand::Name(cleanup))
            .count();
        assert_eq!(loads, 3);
    }

    #[test]
    fn return_outside_function() {
        let err = lower(vec![ret(Some(int(1)))]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::ReturnOutsideFunction);
    }

    #[test]
    fn return_from_with_calls_exit_once_more() {
        let unit = lower(vec![def(
            "f",
            &[],
            vec![with_(
                call(name("open"), vec![]),
                Some(name("fh")),
                vec![ret(Some(call(attr(name("fh"), "read"), vec![])))],
            )],
        )])
        .unwrap();
        let f = unit.children().next().unwrap();
        // return path, normal exit path
        assert_eq!(
            f.instructions
                .windows(4)
                .filter(|w| w.iter().all(|i| matches!(i.op, Opcode::LoadConst | Opcode::Call))
                    && w[3].op == Opcode::Call)
                .count(),
            2
        );
    }

    #[test]
    fn chained_assignment_copies_value() {
        let unit = lower(vec![stmt(StmtKind::Assign {
            targets: vec![name("a"), name("b")],
            value: int(1),
        })])
        .unwrap();
        assert_eq!(count(&unit, Opcode::Copy), 1);
        assert_eq!(count(&unit, Opcode::StoreName), 2);
    }

    #[test]
    fn star_unpacking_packs_counts() {
        let unit = lower(vec![assign(
            tuple(vec![name("a"), starred(name("rest")), name("b"), name("c")]),
            name("xs"),
        )])
        .unwrap();
        let unpack = unit
            .instructions
            .iter()
            .find(|i| i.op == Opcode::UnpackEx)
            .unwrap();
        assert_eq!(unpack.arg, Operand::Int(1 | (2 << 8)));
    }

    #[test]
    fn two_starred_targets_are_rejected() {
        let err = lower(vec![assign(
            tuple(vec![starred(name("a")), starred(name("b"))]),
            name("xs"),
        )])
        .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::MultipleStarredTargets);
    }

    #[test]
    fn assignment_to_call_is_rejected() {
        let err = lower(vec![assign(call(name("f"), vec![]), int(1))]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::InvalidAssignTarget("function call"));
    }

    #[test]
    fn augmented_subscript_evaluates_once() {
        let unit = lower(vec![aug_assign(
            subscript(name("a"), name("i")),
            Operator::Add,
            int(1),
        )])
        .unwrap();
        assert_eq!(count(&unit, Opcode::LoadName), 2);
        assert_eq!(count(&unit, Opcode::BinarySubscr), 1);
        assert_eq!(count(&unit, Opcode::StoreSubscr), 1);
    }

    #[test]
    fn constant_if_is_pruned() {
        let unit = lower(vec![if_(
            bool_(false),
            vec![expr_stmt(call(name("never"), vec![]))],
            vec![expr_stmt(call(name("always"), vec![]))],
        )])
        .unwrap();
        assert!(!unit.names.contains(&"never".to_string()));
        assert!(unit.names.contains(&"always".to_string()));
        assert_eq!(count(&unit, Opcode::PopJumpIfFalse), 0);
    }

    #[test]
    fn break_in_dead_branch_is_still_an_error() {
        let err = lower(vec![if_(bool_(false), vec![break_()], vec![])]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::BreakOutsideLoop);

        let err = lower(vec![if_(int(1), vec![pass()], vec![ret(None)])]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::ReturnOutsideFunction);
    }

    #[test]
    fn dead_branch_leaves_no_code_behind() {
        let unit = lower(vec![while_(
            name("x"),
            vec![if_(
                bool_(false),
                vec![assign(name("gone"), str_("unused")), continue_()],
                vec![break_()],
            )],
        )])
        .unwrap();
        assert!(!unit.names.contains(&"gone".to_string()));
        assert!(!unit.consts.contains(&Constant::Str("unused".into())));
        assert_eq!(unit.max_stack_depth, crate::codegen::verify_unit(&unit).unwrap());
    }

    #[test]
    fn not_condition_flips_the_jump() {
        let unit = lower(vec![if_(
            unary(UnaryOperator::Not, name("x")),
            vec![pass()],
            vec![],
        )])
        .unwrap();
        assert_eq!(count(&unit, Opcode::PopJumpIfTrue), 1);
        assert_eq!(count(&unit, Opcode::UnaryNot), 0);
    }

    #[test]
    fn asserts_are_dropped_when_optimizing() {
        let module = module(vec![stmt(StmtKind::Assert {
            test: name("x"),
            msg: Some(str_("boom")),
        })]);
        let kept = lower_with(&module, &LoweringOptions::default()).unwrap();
        assert_eq!(count(&kept, Opcode::LoadAssertionError), 1);
        let options = LoweringOptions {
            optimize: 1,
            ..LoweringOptions::default()
        };
        let dropped = lower_with(&module, &options).unwrap();
        assert_eq!(count(&dropped, Opcode::LoadAssertionError), 0);
    }

    #[test]
    fn dotted_import_as_walks_attributes() {
        let unit = lower(vec![import("a.b.c", Some("d"))]).unwrap();
        assert_eq!(count(&unit, Opcode::ImportName), 1);
        assert_eq!(count(&unit, Opcode::ImportFrom), 2);
        assert!(unit.names.contains(&"d".to_string()));
    }

    #[test]
    fn star_import_inside_function_is_rejected() {
        let err = lower(vec![def("f", &[], vec![import_from("m", &["*"])])]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::ImportStarNotAtModuleLevel);
    }

    #[test]
    fn interactive_statements_print() {
        let options = LoweringOptions {
            interactive: true,
            ..LoweringOptions::default()
        };
        let unit = lower_with(&module(vec![expr_stmt(name("x"))]), &options).unwrap();
        assert_eq!(count(&unit, Opcode::CallIntrinsic1), 1);
    }

    #[test]
    fn async_for_outside_async_function() {
        let err = lower(vec![def(
            "f",
            &[],
            vec![async_for(name("x"), name("xs"), vec![pass()])],
        )])
        .unwrap_err();
        assert_eq!(
            err.kind,
            CompileErrorKind::AsyncOutsideAsyncFunction("'async for'")
        );
    }
}
