//! Frame blocks: the stack of structured-control constructs enclosing the
//! statement being lowered, and the unwind code each one contributes when
//! `break`, `continue` or `return` leaves it early.

use std::fmt;
use std::ops::{Deref, DerefMut};

use pylower_common::ir::Label;
use pylower_common::{Opcode, Span};
use tracing::trace;

use super::compiler::{Compiler, NameCtx};
use crate::ast::Stmt;
use crate::error::{CompileError, CompileErrorKind, CompileResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FBlockKind {
    WhileLoop,
    ForLoop,
    AsyncForLoop,
    TryExcept,
    FinallyTry,
    FinallyEnd,
    With,
    AsyncWith,
    HandlerCleanup,
    PopValue,
    ExceptionHandler,
    ExceptionGroupHandler,
    AsyncComprehensionGenerator,
    StopIterationGuard,
}

impl FBlockKind {
    pub fn is_loop(self) -> bool {
        matches!(
            self,
            FBlockKind::WhileLoop | FBlockKind::ForLoop | FBlockKind::AsyncForLoop
        )
    }
}

impl fmt::Display for FBlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FBlockKind::WhileLoop => "while-loop",
            FBlockKind::ForLoop => "for-loop",
            FBlockKind::AsyncForLoop => "async-for-loop",
            FBlockKind::TryExcept => "try-except",
            FBlockKind::FinallyTry => "finally-try",
            FBlockKind::FinallyEnd => "finally-end",
            FBlockKind::With => "with",
            FBlockKind::AsyncWith => "async-with",
            FBlockKind::HandlerCleanup => "handler-cleanup",
            FBlockKind::PopValue => "pop-value",
            FBlockKind::ExceptionHandler => "exception-handler",
            FBlockKind::ExceptionGroupHandler => "exception-group-handler",
            FBlockKind::AsyncComprehensionGenerator => "async-comprehension-generator",
            FBlockKind::StopIterationGuard => "stop-iteration-guard",
        };
        f.write_str(name)
    }
}

/// Extra data a frame block carries for its unwind code.
#[derive(Debug, Clone, Copy)]
pub enum FBlockDatum<'a> {
    None,
    /// Body of the `finally` clause, inlined on every early exit.
    FinallyBody(&'a [Stmt]),
    /// Name bound by `except E as name`, cleared on every exit.
    HandlerName(Option<&'a str>),
}

#[derive(Debug, Clone, Copy)]
pub struct FBlock<'a> {
    pub kind: FBlockKind,
    /// Loop head for loops; otherwise the label the construct started at.
    pub block: Option<Label>,
    /// Loop exit, the target of `break`.
    pub exit: Option<Label>,
    pub datum: FBlockDatum<'a>,
    pub span: Option<Span>,
}

impl<'a> FBlock<'a> {
    pub fn new(kind: FBlockKind, block: Option<Label>, exit: Option<Label>) -> Self {
        Self {
            kind,
            block,
            exit,
            datum: FBlockDatum::None,
            span: None,
        }
    }

    pub fn with_datum(mut self, datum: FBlockDatum<'a>) -> Self {
        self.datum = datum;
        self
    }
}

/// An active frame block. Dereferences to the compiler so lowering carries
/// on through the guard; dropping it without [`FrameGuard::finish`] (an
/// early `?` return) pops the block anyway.
pub struct FrameGuard<'c, 'a> {
    compiler: &'c mut Compiler<'a>,
    kind: FBlockKind,
    block: Option<Label>,
    depth: usize,
    finished: bool,
}

impl<'c, 'a> FrameGuard<'c, 'a> {
    /// Pop the block, checking it is still the innermost one.
    pub fn finish(mut self) -> CompileResult<()> {
        self.finished = true;
        let (kind, block) = (self.kind, self.block);
        self.compiler.pop_fblock(kind, block)
    }
}

impl<'a> Deref for FrameGuard<'_, 'a> {
    type Target = Compiler<'a>;

    fn deref(&self) -> &Self::Target {
        self.compiler
    }
}

impl<'a> DerefMut for FrameGuard<'_, 'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.compiler
    }
}

impl Drop for FrameGuard<'_, '_> {
    fn drop(&mut self) {
        if !self.finished {
            self.compiler.unit.fblocks.truncate(self.depth);
        }
    }
}

impl<'a> Compiler<'a> {
    pub(crate) fn push_fblock<'c>(&'c mut self, mut fb: FBlock<'a>) -> CompileResult<FrameGuard<'c, 'a>> {
        if self.unit.fblocks.len() >= self.options.max_block_depth {
            return Err(CompileError::new(CompileErrorKind::TooManyNestedBlocks, self.loc));
        }
        if fb.span.is_none() {
            fb.span = self.loc;
        }
        trace!(kind = %fb.kind, depth = self.unit.fblocks.len(), "push frame block");
        let depth = self.unit.fblocks.len();
        let (kind, block) = (fb.kind, fb.block);
        self.unit.fblocks.push(fb);
        Ok(FrameGuard {
            compiler: self,
            kind,
            block,
            depth,
            finished: false,
        })
    }

    fn pop_fblock(&mut self, kind: FBlockKind, block: Option<Label>) -> CompileResult<()> {
        match self.unit.fblocks.pop() {
            Some(top) if top.kind == kind && top.block == block => {
                trace!(kind = %kind, "pop frame block");
                Ok(())
            }
            Some(top) => Err(CompileError::internal(CompileErrorKind::FrameBlockMismatch {
                expected: kind.to_string(),
                found: top.kind.to_string(),
            })),
            None => Err(CompileError::internal(CompileErrorKind::FrameBlockMismatch {
                expected: kind.to_string(),
                found: "empty stack".to_string(),
            })),
        }
    }

    /// Emit the exit code of one frame block. With `preserve_tos` the value
    /// on top of the stack (a pending return value) is kept above whatever
    /// the block pops.
    pub(crate) fn unwind_fblock(&mut self, fb: &FBlock<'a>, preserve_tos: bool) -> CompileResult<()> {
        match fb.kind {
            FBlockKind::WhileLoop
            | FBlockKind::ExceptionHandler
            | FBlockKind::ExceptionGroupHandler
            | FBlockKind::AsyncComprehensionGenerator
            | FBlockKind::StopIterationGuard => Ok(()),

            FBlockKind::ForLoop | FBlockKind::AsyncForLoop | FBlockKind::PopValue => {
                if preserve_tos {
                    self.emit_arg(Opcode::Swap, 2)?;
                }
                self.emit(Opcode::PopTop)
            }

            FBlockKind::TryExcept => self.emit(Opcode::PopBlock),

            FBlockKind::FinallyTry => {
                self.emit(Opcode::PopBlock)?;
                if let FBlockDatum::FinallyBody(body) = fb.datum {
                    if preserve_tos {
                        let mut g = self.push_fblock(FBlock::new(FBlockKind::PopValue, None, None))?;
                        g.visit_body(body)?;
                        g.finish()?;
                    } else {
                        self.visit_body(body)?;
                    }
                }
                // the finally body runs after the statement that left the block
                self.loc = None;
                Ok(())
            }

            FBlockKind::FinallyEnd => {
                if preserve_tos {
                    self.emit_arg(Opcode::Swap, 2)?;
                }
                self.emit(Opcode::PopTop)?;
                if preserve_tos {
                    self.emit_arg(Opcode::Swap, 2)?;
                }
                self.emit(Opcode::PopBlock)?;
                self.emit(Opcode::PopExcept)
            }

            FBlockKind::With | FBlockKind::AsyncWith => {
                self.loc = fb.span;
                self.emit(Opcode::PopBlock)?;
                if preserve_tos {
                    self.emit_arg(Opcode::Swap, 2)?;
                }
                self.call_exit_with_nones()?;
                if fb.kind == FBlockKind::AsyncWith {
                    self.emit_arg(Opcode::GetAwaitable, 2)?;
                    self.emit_yield_from()?;
                }
                self.emit(Opcode::PopTop)?;
                self.loc = None;
                Ok(())
            }

            FBlockKind::HandlerCleanup => {
                let name = match fb.datum {
                    FBlockDatum::HandlerName(name) => name,
                    _ => None,
                };
                if name.is_some() {
                    self.emit(Opcode::PopBlock)?;
                }
                if preserve_tos {
                    self.emit_arg(Opcode::Swap, 2)?;
                }
                self.emit(Opcode::PopBlock)?;
                self.emit(Opcode::PopExcept)?;
                if let Some(name) = name {
                    self.emit_none()?;
                    self.compile_name(name, NameCtx::Store)?;
                    self.compile_name(name, NameCtx::Del)?;
                }
                Ok(())
            }
        }
    }

    /// Unwind every frame block up to (not including) the innermost loop,
    /// or all of them when `stop_at_loop` is false. Returns the loop found.
    ///
    /// Each block is popped while its exit code is emitted, so a `finally`
    /// body that itself exits sees only the blocks outside it; the stack is
    /// restored afterwards.
    pub(crate) fn unwind_fblock_stack(
        &mut self,
        preserve_tos: bool,
        stop_at_loop: bool,
    ) -> CompileResult<Option<FBlock<'a>>> {
        let Some(top) = self.unit.fblocks.last().copied() else {
            return Ok(None);
        };
        if top.kind == FBlockKind::ExceptionGroupHandler {
            return Err(CompileError::new(CompileErrorKind::ControlFlowInExceptStar, self.loc));
        }
        if stop_at_loop && top.kind.is_loop() {
            return Ok(Some(top));
        }
        self.unit.fblocks.pop();
        let result = self
            .unwind_fblock(&top, preserve_tos)
            .and_then(|()| self.unwind_fblock_stack(preserve_tos, stop_at_loop));
        self.unit.fblocks.push(top);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_kinds() {
        assert!(FBlockKind::WhileLoop.is_loop());
        assert!(FBlockKind::AsyncForLoop.is_loop());
        assert!(!FBlockKind::With.is_loop());
        assert!(!FBlockKind::FinallyTry.is_loop());
    }

    #[test]
    fn kinds_display_for_mismatch_reports() {
        assert_eq!(FBlockKind::ExceptionGroupHandler.to_string(), "exception-group-handler");
        assert_eq!(FBlockKind::PopValue.to_string(), "pop-value");
    }
}
