//! Exception-handling constructs: `try`/`except`, `try`/`finally`,
//! `try`/`except*` and (async) `with`.
//!
//! Handlers are entered by the runtime with the exception pushed on top of
//! the stack at the depth recorded by the `SETUP_*` pseudo-instruction that
//! registered them; every path below keeps that depth consistent.

use pylower_common::ir_opcodes::Intrinsic2;
use pylower_common::ir::{Label, UnitKind};
use pylower_common::Opcode;

use super::compiler::{Compiler, NameCtx};
use super::fblock::{FBlock, FBlockDatum, FBlockKind};
use crate::ast::{ExceptHandler, Stmt, WithItem};
use crate::error::{CompileError, CompileErrorKind, CompileResult};

impl<'a> Compiler<'a> {
    pub(crate) fn compile_try_except(
        &mut self,
        stmt: &'a Stmt,
        body: &'a [Stmt],
        handlers: &'a [ExceptHandler],
        orelse: &'a [Stmt],
    ) -> CompileResult<()> {
        let loc = Some(stmt.span);
        let body_label = self.new_label()?;
        let except = self.new_label()?;
        let end = self.new_label()?;
        let cleanup = self.new_label()?;

        self.emit_jump(Opcode::SetupFinally, except)?;
        self.place(body_label)?;
        {
            let mut guard = self.push_fblock(FBlock::new(FBlockKind::TryExcept, Some(body_label), None))?;
            guard.visit_body(body)?;
            guard.finish()?;
        }
        self.loc = None;
        self.emit(Opcode::PopBlock)?;
        self.visit_body(orelse)?;
        self.loc = None;
        self.emit_jump(Opcode::Jump, end)?;

        self.place(except)?;
        self.emit_jump(Opcode::SetupCleanup, cleanup)?;
        self.emit(Opcode::PushExcInfo)?;
        self.loc = loc;
        let mut guard = self.push_fblock(FBlock::new(FBlockKind::ExceptionHandler, None, None))?;
        for (i, handler) in handlers.iter().enumerate() {
            guard.loc = Some(handler.span);
            if handler.type_.is_none() && i + 1 < handlers.len() {
                return Err(CompileError::at(CompileErrorKind::DefaultExceptNotLast, handler.span));
            }
            let next = guard.new_label()?;
            if let Some(type_) = &handler.type_ {
                guard.visit_expr(type_)?;
                guard.loc = Some(handler.span);
                guard.emit(Opcode::CheckExcMatch)?;
                guard.emit_jump(Opcode::PopJumpIfFalse, next)?;
            }
            match handler.name.as_deref() {
                Some(name) => guard.named_handler_body(handler, name, end)?,
                None => {
                    let cleanup_body = guard.new_label()?;
                    guard.emit(Opcode::PopTop)?;
                    guard.place(cleanup_body)?;
                    {
                        let mut inner = guard.push_fblock(
                            FBlock::new(FBlockKind::HandlerCleanup, Some(cleanup_body), None)
                                .with_datum(FBlockDatum::HandlerName(None)),
                        )?;
                        inner.visit_body(&handler.body)?;
                        inner.finish()?;
                    }
                    guard.loc = None;
                    guard.emit(Opcode::PopBlock)?;
                    guard.emit(Opcode::PopExcept)?;
                    guard.emit_jump(Opcode::Jump, end)?;
                }
            }
            guard.place(next)?;
        }
        guard.finish()?;
        self.loc = None;
        self.emit_arg(Opcode::Reraise, 0)?;
        self.place(cleanup)?;
        self.pop_except_and_reraise()?;
        self.place(end)
    }

    /// `except E as name:` body wrapped so `name` is cleared on every exit.
    fn named_handler_body(&mut self, handler: &'a ExceptHandler, name: &'a str, end: Label) -> CompileResult<()> {
        let cleanup_end = self.new_label()?;
        let cleanup_body = self.new_label()?;
        self.compile_name(name, NameCtx::Store)?;
        self.emit_jump(Opcode::SetupCleanup, cleanup_end)?;
        self.place(cleanup_body)?;
        {
            let mut guard = self.push_fblock(
                FBlock::new(FBlockKind::HandlerCleanup, Some(cleanup_body), None)
                    .with_datum(FBlockDatum::HandlerName(Some(name))),
            )?;
            guard.visit_body(&handler.body)?;
            guard.finish()?;
        }
        self.loc = None;
        self.emit(Opcode::PopBlock)?;
        self.emit(Opcode::PopBlock)?;
        self.emit(Opcode::PopExcept)?;
        self.clear_handler_name(name)?;
        self.emit_jump(Opcode::Jump, end)?;

        self.place(cleanup_end)?;
        self.clear_handler_name(name)?;
        self.emit_arg(Opcode::Reraise, 1)
    }

    fn clear_handler_name(&mut self, name: &str) -> CompileResult<()> {
        self.emit_none()?;
        self.compile_name(name, NameCtx::Store)?;
        self.compile_name(name, NameCtx::Del)
    }

    /// `COPY 3; POP_EXCEPT; RERAISE 1`: restore the previous exception and
    /// re-raise from a handler's own cleanup.
    fn pop_except_and_reraise(&mut self) -> CompileResult<()> {
        self.emit_arg(Opcode::Copy, 3)?;
        self.emit(Opcode::PopExcept)?;
        self.emit_arg(Opcode::Reraise, 1)
    }

    /// `try`/`finally`, with any handlers lowered inside the protected region.
    /// The finally body is emitted twice: once for normal completion and
    /// once in the exceptional path.
    pub(crate) fn compile_try_finally(
        &mut self,
        stmt: &'a Stmt,
        body: &'a [Stmt],
        handlers: &'a [ExceptHandler],
        orelse: &'a [Stmt],
        finalbody: &'a [Stmt],
        is_star: bool,
    ) -> CompileResult<()> {
        let body_label = self.new_label()?;
        let end = self.new_label()?;
        let exit = self.new_label()?;
        let cleanup = self.new_label()?;

        self.emit_jump(Opcode::SetupFinally, end)?;
        self.place(body_label)?;
        {
            let mut guard = self.push_fblock(
                FBlock::new(FBlockKind::FinallyTry, Some(body_label), Some(end))
                    .with_datum(FBlockDatum::FinallyBody(finalbody)),
            )?;
            if handlers.is_empty() {
                guard.visit_body(body)?;
                guard.visit_body(orelse)?;
            } else if is_star {
                guard.compile_try_star_except(stmt, body, handlers, orelse)?;
            } else {
                guard.compile_try_except(stmt, body, handlers, orelse)?;
            }
            guard.loc = None;
            guard.emit(Opcode::PopBlock)?;
            guard.finish()?;
        }
        self.visit_body(finalbody)?;
        self.loc = None;
        self.emit_jump(Opcode::Jump, exit)?;

        self.place(end)?;
        self.loc = None;
        self.emit_jump(Opcode::SetupCleanup, cleanup)?;
        self.emit(Opcode::PushExcInfo)?;
        {
            let mut guard = self.push_fblock(FBlock::new(FBlockKind::FinallyEnd, Some(end), None))?;
            guard.visit_body(finalbody)?;
            guard.finish()?;
        }
        self.loc = None;
        self.emit_arg(Opcode::Reraise, 0)?;
        self.place(cleanup)?;
        self.pop_except_and_reraise()?;
        self.place(exit)
    }

    // ========================================================================
    // except*
    // ========================================================================

    /// `try`/`except*`. Each handler splits the group on top of the stack
    /// into a matched part and a remainder; exceptions raised by handlers
    /// are collected in a list and merged with the unhandled remainder when
    /// all handlers have run.
    pub(crate) fn compile_try_star_except(
        &mut self,
        stmt: &'a Stmt,
        body: &'a [Stmt],
        handlers: &'a [ExceptHandler],
        orelse: &'a [Stmt],
    ) -> CompileResult<()> {
        let loc = Some(stmt.span);
        let body_label = self.new_label()?;
        let except = self.new_label()?;
        let orelse_label = self.new_label()?;
        let end = self.new_label()?;
        let cleanup = self.new_label()?;
        let reraise_star = self.new_label()?;

        self.emit_jump(Opcode::SetupFinally, except)?;
        self.place(body_label)?;
        {
            let mut guard = self.push_fblock(FBlock::new(FBlockKind::TryExcept, Some(body_label), None))?;
            guard.visit_body(body)?;
            guard.finish()?;
        }
        self.loc = None;
        self.emit(Opcode::PopBlock)?;
        self.emit_jump(Opcode::Jump, orelse_label)?;

        self.place(except)?;
        self.emit_jump(Opcode::SetupCleanup, cleanup)?;
        self.emit(Opcode::PushExcInfo)?;
        self.loc = loc;
        let mut guard = self.push_fblock(FBlock::new(FBlockKind::ExceptionGroupHandler, None, None))?;
        let count = handlers.len();
        for (i, handler) in handlers.iter().enumerate() {
            let hloc = Some(handler.span);
            guard.loc = hloc;
            let next = guard.new_label()?;
            let except_with_error = guard.new_label()?;
            let no_match = guard.new_label()?;
            let cleanup_end = guard.new_label()?;
            let cleanup_body = guard.new_label()?;

            if i == 0 {
                // [orig] -> [orig, [], orig]
                guard.emit_arg(Opcode::BuildList, 0)?;
                guard.emit_arg(Opcode::Copy, 2)?;
            }
            let Some(type_) = &handler.type_ else {
                return Err(CompileError::at(CompileErrorKind::ExceptStarWithoutType, handler.span));
            };
            guard.visit_expr(type_)?;
            guard.loc = hloc;
            guard.emit(Opcode::CheckEgMatch)?;
            guard.emit_arg(Opcode::Copy, 1)?;
            guard.emit_jump(Opcode::PopJumpIfNone, no_match)?;

            let name = handler.name.as_deref();
            match name {
                Some(name) => guard.compile_name(name, NameCtx::Store)?,
                None => guard.emit(Opcode::PopTop)?,
            }
            guard.emit_jump(Opcode::SetupCleanup, cleanup_end)?;
            guard.place(cleanup_body)?;
            {
                let mut inner = guard.push_fblock(
                    FBlock::new(FBlockKind::HandlerCleanup, Some(cleanup_body), None)
                        .with_datum(FBlockDatum::HandlerName(name)),
                )?;
                inner.visit_body(&handler.body)?;
                inner.finish()?;
            }
            guard.loc = None;
            guard.emit(Opcode::PopBlock)?;
            if let Some(name) = name {
                guard.clear_handler_name(name)?;
            }
            guard.emit_jump(Opcode::Jump, next)?;

            guard.place(cleanup_end)?;
            if let Some(name) = name {
                guard.clear_handler_name(name)?;
            }
            // collect what the handler raised, drop lasti
            guard.emit_arg(Opcode::ListAppend, 3)?;
            guard.emit(Opcode::PopTop)?;
            guard.emit_jump(Opcode::Jump, except_with_error)?;

            guard.place(next)?;
            guard.emit(Opcode::Nop)?;
            guard.emit_jump(Opcode::Jump, except_with_error)?;

            guard.place(no_match)?;
            guard.loc = hloc;
            guard.emit(Opcode::PopTop)?;

            guard.place(except_with_error)?;
            if i + 1 == count {
                guard.loc = None;
                // the unhandled remainder joins the raised list
                guard.emit_arg(Opcode::ListAppend, 1)?;
                guard.emit_jump(Opcode::Jump, reraise_star)?;
            }
        }
        guard.finish()?;

        let reraise = self.new_label()?;
        self.loc = None;
        self.place(reraise_star)?;
        self.emit_arg(Opcode::CallIntrinsic2, Intrinsic2::PrepReraiseStar as u32)?;
        self.emit_arg(Opcode::Copy, 1)?;
        self.emit_jump(Opcode::PopJumpIfNotNone, reraise)?;
        self.emit(Opcode::PopTop)?;
        self.emit(Opcode::PopBlock)?;
        self.emit(Opcode::PopExcept)?;
        self.emit_jump(Opcode::Jump, end)?;

        self.place(reraise)?;
        self.emit(Opcode::PopBlock)?;
        self.emit_arg(Opcode::Swap, 2)?;
        self.emit(Opcode::PopExcept)?;
        self.emit_arg(Opcode::Reraise, 0)?;

        self.place(cleanup)?;
        self.pop_except_and_reraise()?;

        self.place(orelse_label)?;
        self.visit_body(orelse)?;
        self.place(end)
    }

    // ========================================================================
    // with / async with
    // ========================================================================

    /// One `with` item; the remaining items nest inside its block.
    pub(crate) fn compile_with(
        &mut self,
        stmt: &'a Stmt,
        items: &'a [WithItem],
        body: &'a [Stmt],
        pos: usize,
    ) -> CompileResult<()> {
        self.with_item(stmt, items, body, pos, false)
    }

    pub(crate) fn compile_async_with(
        &mut self,
        stmt: &'a Stmt,
        items: &'a [WithItem],
        body: &'a [Stmt],
        pos: usize,
    ) -> CompileResult<()> {
        if self.unit.kind != UnitKind::AsyncFunction {
            return Err(CompileError::at(
                CompileErrorKind::AsyncOutsideAsyncFunction("'async with'"),
                stmt.span,
            ));
        }
        self.with_item(stmt, items, body, pos, true)
    }

    fn with_item(
        &mut self,
        stmt: &'a Stmt,
        items: &'a [WithItem],
        body: &'a [Stmt],
        pos: usize,
        is_async: bool,
    ) -> CompileResult<()> {
        let Some(item) = items.get(pos) else {
            return self.visit_body(body);
        };
        let loc = Some(stmt.span);
        let block = self.new_label()?;
        let final_ = self.new_label()?;
        let exit = self.new_label()?;
        let cleanup = self.new_label()?;
        let kind = if is_async { FBlockKind::AsyncWith } else { FBlockKind::With };

        self.visit_expr(&item.context_expr)?;
        self.loc = loc;
        if is_async {
            self.emit(Opcode::BeforeAsyncWith)?;
            self.emit_arg(Opcode::GetAwaitable, 1)?;
            self.emit_yield_from()?;
        } else {
            self.emit(Opcode::BeforeWith)?;
        }
        self.emit_jump(Opcode::SetupWith, final_)?;
        self.place(block)?;
        {
            let mut guard = self.push_fblock(FBlock::new(kind, Some(block), Some(final_)))?;
            match &item.optional_vars {
                Some(target) => guard.compile_store(target)?,
                None => guard.emit(Opcode::PopTop)?,
            }
            if pos + 1 == items.len() {
                guard.visit_body(body)?;
            } else {
                guard.nested(|c| c.with_item(stmt, items, body, pos + 1, is_async))?;
            }
            guard.loc = None;
            guard.emit(Opcode::PopBlock)?;
            guard.finish()?;
        }

        self.loc = loc;
        self.call_exit_with_nones()?;
        if is_async {
            self.emit_arg(Opcode::GetAwaitable, 2)?;
            self.emit_yield_from()?;
        }
        self.emit(Opcode::PopTop)?;
        self.emit_jump(Opcode::Jump, exit)?;

        self.place(final_)?;
        self.emit_jump(Opcode::SetupCleanup, cleanup)?;
        self.emit(Opcode::PushExcInfo)?;
        self.emit(Opcode::WithExceptStart)?;
        if is_async {
            self.emit_arg(Opcode::GetAwaitable, 2)?;
            self.emit_yield_from()?;
        }
        self.with_except_finish(cleanup)?;
        self.place(exit)
    }

    /// Re-raise unless `__exit__` returned a true value, in which case the
    /// exception is swallowed and the exit state popped.
    fn with_except_finish(&mut self, cleanup: Label) -> CompileResult<()> {
        self.loc = None;
        let suppress = self.new_label()?;
        let exit = self.new_label()?;
        self.emit_jump(Opcode::PopJumpIfTrue, suppress)?;
        self.emit_arg(Opcode::Reraise, 2)?;
        self.place(suppress)?;
        self.emit(Opcode::PopTop)?;
        self.emit(Opcode::PopBlock)?;
        self.emit(Opcode::PopExcept)?;
        self.emit(Opcode::PopTop)?;
        self.emit(Opcode::PopTop)?;
        self.emit_jump(Opcode::Jump, exit)?;
        self.place(cleanup)?;
        self.pop_except_and_reraise()?;
        self.place(exit)
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::build::*;
    use crate::ast::{Module, Stmt};
    use crate::codegen::compiler::Compiler;
    use crate::error::{CompileErrorKind, CompileResult};
    use crate::semantic;
    use pylower_common::ir::CodeUnit;
    use pylower_common::{LoweringOptions, Opcode};

    fn lower(body: Vec<Stmt>) -> CompileResult<CodeUnit> {
        let module: Module = module(body);
        let options = LoweringOptions::default();
        let table = semantic::analyze(&module, &options)?;
        Compiler::new(&table, &options, "test.py")?.compile_module(&module)
    }

    fn count(unit: &CodeUnit, op: Opcode) -> usize {
        unit.instructions.iter().filter(|i| i.op == op).count()
    }

    fn call_stmt(f: &str) -> Stmt {
        expr_stmt(call(name(f), vec![]))
    }

    #[test]
    fn try_except_shape() {
        let unit = lower(vec![try_(
            vec![call_stmt("risky")],
            vec![
                handler(Some(name("ValueError")), Some("e"), vec![call_stmt("log")]),
                handler(None, None, vec![pass()]),
            ],
            vec![],
            vec![],
        )])
        .unwrap();
        assert_eq!(count(&unit, Opcode::SetupFinally), 1);
        assert_eq!(count(&unit, Opcode::PushExcInfo), 1);
        assert_eq!(count(&unit, Opcode::CheckExcMatch), 1);
        // the bound name is cleared on both the normal and the raising exit
        assert_eq!(count(&unit, Opcode::DeleteName), 2);
        assert!(unit.max_stack_depth >= 3);
    }

    #[test]
    fn bare_except_must_be_last() {
        let err = lower(vec![try_(
            vec![pass()],
            vec![
                handler(None, None, vec![pass()]),
                handler(Some(name("E")), None, vec![pass()]),
            ],
            vec![],
            vec![],
        )])
        .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::DefaultExceptNotLast);
    }

    #[test]
    fn finally_body_is_duplicated() {
        let unit = lower(vec![try_(
            vec![call_stmt("work")],
            vec![],
            vec![],
            vec![call_stmt("done")],
        )])
        .unwrap();
        let done = unit.names.iter().position(|n| n == "done").unwrap() as u32;
        let loads = unit
            .instructions
            .iter()
            .filter(|i| i.op == Opcode::LoadName && i.arg.raw() == done)
            .count();
        assert_eq!(loads, 2);
        assert_eq!(count(&unit, Opcode::Reraise), 2);
    }

    #[test]
    fn return_inside_finally_protected_function() {
        let unit = lower(vec![def(
            "f",
            &[],
            vec![try_(
                vec![ret(Some(call(name("compute"), vec![])))],
                vec![],
                vec![],
                vec![call_stmt("release")],
            )],
        )])
        .unwrap();
        let f = unit.children().next().unwrap();
        // return path, normal completion and the exceptional path
        let release = f
            .instructions
            .iter()
            .filter(|i| i.op == Opcode::LoadGlobal && f.names[i.arg.raw() as usize] == "release")
            .count();
        assert_eq!(release, 3);
    }

    #[test]
    fn with_statement_shape() {
        let unit = lower(vec![with_(
            call(name("lock"), vec![]),
            None,
            vec![call_stmt("work")],
        )])
        .unwrap();
        assert_eq!(count(&unit, Opcode::BeforeWith), 1);
        assert_eq!(count(&unit, Opcode::SetupWith), 1);
        assert_eq!(count(&unit, Opcode::WithExceptStart), 1);
        assert_eq!(count(&unit, Opcode::Reraise), 2);
    }

    #[test]
    fn async_with_needs_async_function() {
        let err = lower(vec![def(
            "f",
            &[],
            vec![async_with(name("cm"), None, vec![pass()])],
        )])
        .unwrap_err();
        assert_eq!(
            err.kind,
            CompileErrorKind::AsyncOutsideAsyncFunction("'async with'")
        );

        let unit = lower(vec![async_def(
            "f",
            &[],
            vec![async_with(name("cm"), None, vec![pass()])],
        )])
        .unwrap();
        let f = unit.children().next().unwrap();
        assert_eq!(count(f, Opcode::BeforeAsyncWith), 1);
        // enter, normal exit, exceptional exit
        assert_eq!(count(f, Opcode::GetAwaitable), 3);
    }

    #[test]
    fn except_star_collects_raised_exceptions() {
        let unit = lower(vec![try_star(
            vec![call_stmt("work")],
            vec![
                handler(Some(name("ValueError")), Some("e"), vec![pass()]),
                handler(Some(name("TypeError")), None, vec![pass()]),
            ],
        )])
        .unwrap();
        assert_eq!(count(&unit, Opcode::CheckEgMatch), 2);
        assert_eq!(count(&unit, Opcode::CallIntrinsic2), 1);
        assert_eq!(count(&unit, Opcode::BuildList), 1);
    }

    #[test]
    fn except_star_rejects_control_flow() {
        let err = lower(vec![while_(
            name("x"),
            vec![try_star(
                vec![pass()],
                vec![handler(Some(name("E")), None, vec![break_()])],
            )],
        )])
        .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::ControlFlowInExceptStar);
    }

    #[test]
    fn except_star_needs_a_type() {
        let err = lower(vec![try_star(vec![pass()], vec![handler(None, None, vec![pass()])])]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::ExceptStarWithoutType);
    }
}
