use std::mem;

use pylower_common::ir::{CodeFlags, CodeUnit, Constant, Instruction, Label, Operand, UnitKind};
use pylower_common::ir_opcodes::{Intrinsic1, MakeFunctionFlags};
use pylower_common::{LoweringOptions, Opcode, Span};
use tracing::{debug, trace};

use super::constant_pool::{ConstantPool, NameTable};
use super::fblock::{FBlock, FBlockKind};
use super::instr_seq::InstrSeq;
use super::stack_check;
use crate::ast::{ExprKind, Module, ModuleKind, Stmt, StmtKind};
use crate::error::{CompileError, CompileErrorKind, CompileResult};
use crate::semantic::{NodeKey, SymbolScope, SymbolTable};

/// What a name operation does with the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameCtx {
    Load,
    Store,
    Del,
}

/// Instruction family chosen for a name from its resolved scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameFamily {
    Fast,
    Deref,
    Global,
    Name,
}

// ============================================================================
// Unit state
// ============================================================================

/// Everything owned by the unit currently being lowered. Created on scope
/// entry, consumed when the unit is assembled.
pub(crate) struct Unit<'a> {
    pub name: String,
    pub qualname: String,
    pub kind: UnitKind,
    pub table: &'a SymbolTable,
    pub seq: InstrSeq,
    pub consts: ConstantPool,
    pub names: NameTable,
    pub varnames: NameTable,
    pub cellvars: NameTable,
    pub freevars: NameTable,
    pub fblocks: Vec<FBlock<'a>>,
    /// Symbol tables of the comprehensions currently lowered in place, innermost last.
    pub inlined: Vec<&'a SymbolTable>,
    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,
    pub flags: CodeFlags,
    pub first_line: u32,
}

impl<'a> Unit<'a> {
    fn new(name: &str, qualname: String, table: &'a SymbolTable, first_line: u32) -> CompileResult<Self> {
        let varnames = if table.kind.is_function_like() {
            NameTable::from_names(table.local_slots())?
        } else {
            NameTable::new()
        };
        let generator = table.is_generator;
        let coroutine = table.is_coroutine;
        Ok(Self {
            name: name.to_string(),
            qualname,
            kind: table.kind,
            table,
            seq: InstrSeq::new(),
            consts: ConstantPool::new(),
            names: NameTable::new(),
            varnames,
            cellvars: NameTable::from_names(table.names_with_scope(SymbolScope::Cell))?,
            freevars: NameTable::from_names(table.free_names())?,
            fblocks: Vec::new(),
            inlined: Vec::new(),
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            flags: CodeFlags {
                generator: generator && !coroutine,
                coroutine: coroutine && !generator,
                async_generator: generator && coroutine,
                ..CodeFlags::default()
            },
            first_line,
        })
    }

    /// Whether the unit runs as a generator or coroutine frame.
    fn is_resumable(&self) -> bool {
        self.flags.generator || self.flags.coroutine || self.flags.async_generator
    }

    fn assemble(self, filename: &str) -> CompileResult<CodeUnit> {
        if !self.fblocks.is_empty() {
            return Err(CompileError::internal(CompileErrorKind::FrameBlockLeak(
                self.fblocks.len(),
            )));
        }
        let (instructions, labels) = self.seq.finish()?;
        let mut code = CodeUnit {
            name: self.name,
            qualname: self.qualname,
            kind: self.kind,
            filename: filename.to_string(),
            first_line: self.first_line,
            argcount: self.argcount,
            posonlyargcount: self.posonlyargcount,
            kwonlyargcount: self.kwonlyargcount,
            flags: self.flags,
            max_stack_depth: 0,
            consts: self.consts.into_constants(),
            names: self.names.into_names(),
            varnames: self.varnames.into_names(),
            cellvars: self.cellvars.into_names(),
            freevars: self.freevars.into_names(),
            instructions,
            labels,
        };
        code.max_stack_depth = stack_check::verify_unit(&code)
            .map_err(|e| CompileError::internal(CompileErrorKind::StackCheck(e.to_string())))?;
        debug!(
            unit = %code.qualname,
            instructions = code.instructions.len(),
            consts = code.consts.len(),
            max_stack = code.max_stack_depth,
            "finished unit"
        );
        Ok(code)
    }
}

// ============================================================================
// Compiler
// ============================================================================

/// Lowers one module and every unit nested in it.
///
/// The unit being lowered is `unit`; enclosing units wait on `stack` until
/// the nested one is finished and stored as a constant of its parent.
pub struct Compiler<'a> {
    pub(crate) unit: Unit<'a>,
    stack: Vec<Unit<'a>>,
    pub(crate) options: LoweringOptions,
    filename: String,
    /// Source location stamped on emitted instructions.
    pub(crate) loc: Option<Span>,
    depth: usize,
    pub(crate) interactive: bool,
}

impl<'a> Compiler<'a> {
    pub fn new(table: &'a SymbolTable, options: &LoweringOptions, filename: impl Into<String>) -> CompileResult<Self> {
        let unit = Unit::new("<module>", "<module>".to_string(), table, 1)?;
        Ok(Self {
            unit,
            stack: Vec::new(),
            options: options.clone(),
            filename: filename.into(),
            loc: None,
            depth: 0,
            interactive: options.interactive,
        })
    }

    /// Lower `module` into its top-level code unit.
    pub fn compile_module(mut self, module: &'a Module) -> CompileResult<CodeUnit> {
        debug!(file = %self.filename, kind = ?module.kind, "lowering module");
        if module.kind == ModuleKind::Interactive {
            self.interactive = true;
        }
        match module.kind {
            ModuleKind::Eval => match module.body.as_slice() {
                [stmt @ Stmt {
                    kind: StmtKind::Expr { value },
                    ..
                }] => {
                    self.loc = Some(stmt.span);
                    self.visit_expr(value)?;
                    self.emit(Opcode::ReturnValue)?;
                }
                _ => {
                    let span = module.body.first().map(|s| s.span);
                    return Err(CompileError::new(CompileErrorKind::EvalNotExpression, span));
                }
            },
            ModuleKind::Exec | ModuleKind::Interactive => {
                if find_annotations(&module.body) {
                    self.loc = module.body.first().map(|s| s.span);
                    self.emit(Opcode::SetupAnnotations)?;
                }
                let body = if self.interactive {
                    &module.body[..]
                } else {
                    self.store_docstring(&module.body)?
                };
                self.visit_body(body)?;
                self.emit_implicit_return()?;
            }
        }
        let Compiler { unit, filename, .. } = self;
        unit.assemble(&filename)
    }

    // ========================================================================
    // Emission
    // ========================================================================

    pub(crate) fn emit(&mut self, op: Opcode) -> CompileResult<()> {
        self.emit_operand(op, Operand::None)
    }

    pub(crate) fn emit_arg(&mut self, op: Opcode, arg: u32) -> CompileResult<()> {
        self.emit_operand(op, Operand::Int(arg))
    }

    pub(crate) fn emit_operand(&mut self, op: Opcode, arg: Operand) -> CompileResult<()> {
        self.unit.seq.push(Instruction {
            op,
            arg,
            span: self.loc,
        })
    }

    pub(crate) fn emit_jump(&mut self, op: Opcode, target: Label) -> CompileResult<()> {
        self.emit_operand(op, Operand::Label(target))
    }

    pub(crate) fn emit_const(&mut self, constant: Constant) -> CompileResult<()> {
        let idx = self.unit.consts.add(constant)?;
        self.emit_operand(Opcode::LoadConst, Operand::Const(idx))
    }

    pub(crate) fn emit_none(&mut self) -> CompileResult<()> {
        self.emit_const(Constant::None)
    }

    /// Emit an instruction whose operand is an entry of the `names` table.
    pub(crate) fn emit_named(&mut self, op: Opcode, name: &str) -> CompileResult<()> {
        let idx = self.unit.names.get_or_insert(name)?;
        self.emit_operand(op, Operand::Name(idx))
    }

    pub(crate) fn emit_intrinsic1(&mut self, intrinsic: Intrinsic1) -> CompileResult<()> {
        self.emit_arg(Opcode::CallIntrinsic1, intrinsic as u32)
    }

    /// Resume the awaitable or sub-iterator on top of the stack until it finishes.
    pub(crate) fn emit_yield_from(&mut self) -> CompileResult<()> {
        self.emit_none()?;
        self.emit(Opcode::YieldFrom)
    }

    /// Call the `__exit__` capability below the top with three `None`s.
    pub(crate) fn call_exit_with_nones(&mut self) -> CompileResult<()> {
        self.emit_none()?;
        self.emit_none()?;
        self.emit_none()?;
        self.emit_arg(Opcode::Call, 2)
    }

    pub(crate) fn new_label(&mut self) -> CompileResult<Label> {
        self.unit.seq.new_label()
    }

    pub(crate) fn place(&mut self, label: Label) -> CompileResult<()> {
        trace!(%label, at = self.unit.seq.len(), "place label");
        self.unit.seq.place(label)
    }

    /// `LOAD_CONST None; RETURN_VALUE` unless control cannot reach the end.
    pub(crate) fn emit_implicit_return(&mut self) -> CompileResult<()> {
        let ends_in_terminator = self.unit.seq.last().is_some_and(|i| i.op.is_terminator());
        if !ends_in_terminator || self.unit.seq.has_label_at_end() {
            self.loc = None;
            self.emit_none()?;
            self.emit(Opcode::ReturnValue)?;
        }
        Ok(())
    }

    // ========================================================================
    // Recursion guard
    // ========================================================================

    /// Run `f` one nesting level deeper, failing once the configured depth is exhausted.
    pub(crate) fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> CompileResult<T>) -> CompileResult<T> {
        if self.depth >= self.options.max_recursion_depth {
            return Err(CompileError::new(
                CompileErrorKind::TooDeeplyNested(self.options.max_recursion_depth),
                self.loc,
            ));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    // ========================================================================
    // Scopes
    // ========================================================================

    /// Symbol table of the scope `key` opens inside the current unit.
    pub(crate) fn child_table(&self, key: NodeKey, name: &str) -> CompileResult<&'a SymbolTable> {
        let table: &'a SymbolTable = self.unit.table;
        table
            .child(key)
            .ok_or_else(|| CompileError::internal(CompileErrorKind::MissingSymbolTable(name.to_string())))
    }

    /// Lower a nested unit with `body` and return it finished.
    ///
    /// The enclosing unit is restored on every path, including errors.
    pub(crate) fn compile_unit(
        &mut self,
        name: &str,
        key: NodeKey,
        first_line: u32,
        body: impl FnOnce(&mut Self) -> CompileResult<()>,
    ) -> CompileResult<CodeUnit> {
        let table = self.child_table(key, name)?;
        let saved_loc = self.loc;
        self.enter_scope(name, table, first_line)?;
        let result = self.unit_body(body);
        let unit = self.exit_scope();
        self.loc = saved_loc;
        result?;
        unit?.assemble(&self.filename)
    }

    fn enter_scope(&mut self, name: &str, table: &'a SymbolTable, first_line: u32) -> CompileResult<()> {
        let qualname = self.qualname_for(name, table.kind);
        let mut unit = Unit::new(name, qualname, table, first_line)?;
        unit.flags.nested = self.unit.kind.is_function_like();
        let parent = mem::replace(&mut self.unit, unit);
        self.stack.push(parent);
        debug!(unit = %self.unit.qualname, kind = ?table.kind, "enter unit");
        Ok(())
    }

    fn exit_scope(&mut self) -> CompileResult<Unit<'a>> {
        let parent = self
            .stack
            .pop()
            .ok_or_else(|| CompileError::internal(CompileErrorKind::ScopeUnderflow))?;
        let unit = mem::replace(&mut self.unit, parent);
        trace!(unit = %unit.qualname, "exit unit");
        Ok(unit)
    }

    /// Cell prefix, the generator guard, the body, and the implicit return.
    fn unit_body(&mut self, body: impl FnOnce(&mut Self) -> CompileResult<()>) -> CompileResult<()> {
        self.loc = None;
        for idx in 0..self.unit.cellvars.len() {
            self.emit_operand(Opcode::MakeCell, Operand::Deref(idx as u32))?;
        }
        if !self.unit.is_resumable() {
            body(self)?;
            return self.emit_implicit_return();
        }
        let handler = self.new_label()?;
        self.emit_jump(Opcode::SetupCleanup, handler)?;
        {
            let mut guard = self.push_fblock(FBlock::new(FBlockKind::StopIterationGuard, Some(handler), None))?;
            body(&mut *guard)?;
            guard.emit_implicit_return()?;
            guard.finish()?;
        }
        self.loc = None;
        self.place(handler)?;
        self.emit_intrinsic1(Intrinsic1::StopIterationError)?;
        self.emit_arg(Opcode::Reraise, 1)
    }

    /// Qualified name of a unit named `name` opened inside the current unit.
    fn qualname_for(&self, name: &str, kind: UnitKind) -> String {
        let mut parent = &self.unit;
        if parent.kind == UnitKind::Module {
            return name.to_string();
        }
        if parent.kind == UnitKind::Annotation {
            match self.stack.last() {
                Some(outer) if outer.kind != UnitKind::Module => parent = outer,
                _ => return name.to_string(),
            }
        }
        let declared_global = matches!(
            kind,
            UnitKind::Function | UnitKind::AsyncFunction | UnitKind::Class
        ) && parent.table.scope_of(name) == Some(SymbolScope::GlobalExplicit);
        if declared_global {
            return name.to_string();
        }
        match parent.kind {
            UnitKind::Function | UnitKind::AsyncFunction | UnitKind::Lambda => {
                format!("{}.<locals>.{}", parent.qualname, name)
            }
            _ => format!("{}.{}", parent.qualname, name),
        }
    }

    // ========================================================================
    // Names
    // ========================================================================

    fn resolve_scope(&self, name: &str) -> (Option<SymbolScope>, bool) {
        for table in self.unit.inlined.iter().rev() {
            if let Some(scope) = table.scope_of(name) {
                return (Some(scope), true);
            }
        }
        (self.unit.table.scope_of(name), false)
    }

    /// Index of `name` in `cellvars ++ freevars` of the current unit.
    pub(crate) fn deref_index(&self, name: &str) -> CompileResult<u32> {
        if let Some(idx) = self.unit.cellvars.get(name) {
            return Ok(idx);
        }
        match self.unit.freevars.get(name) {
            Some(idx) => Ok(self.unit.cellvars.len() as u32 + idx),
            None => Err(CompileError::internal(CompileErrorKind::UnresolvedDeref(name.to_string()))),
        }
    }

    /// Load, store or delete `name` with the instruction family its scope calls for.
    pub(crate) fn compile_name(&mut self, name: &str, ctx: NameCtx) -> CompileResult<()> {
        if name == "__debug__" && ctx != NameCtx::Load {
            return Err(CompileError::new(CompileErrorKind::AssignToDebug, self.loc));
        }
        let (scope, in_inlined) = self.resolve_scope(name);
        let function_like = self.unit.kind.is_function_like();
        let family = match scope {
            Some(SymbolScope::Cell) | Some(SymbolScope::Free) => NameFamily::Deref,
            Some(SymbolScope::Local) if function_like || in_inlined => NameFamily::Fast,
            Some(SymbolScope::GlobalExplicit) => NameFamily::Global,
            Some(SymbolScope::GlobalImplicit) | None if function_like => NameFamily::Global,
            _ => NameFamily::Name,
        };
        match family {
            NameFamily::Fast => {
                let idx = self.unit.varnames.get_or_insert(name)?;
                let op = match ctx {
                    NameCtx::Load => Opcode::LoadFast,
                    NameCtx::Store => Opcode::StoreFast,
                    NameCtx::Del => Opcode::DeleteFast,
                };
                self.emit_operand(op, Operand::Local(idx))
            }
            NameFamily::Deref => {
                let idx = self.deref_index(name)?;
                let op = match ctx {
                    NameCtx::Load if self.unit.kind == UnitKind::Class && !in_inlined => {
                        self.emit(Opcode::LoadLocals)?;
                        Opcode::LoadFromDictOrDeref
                    }
                    NameCtx::Load => Opcode::LoadDeref,
                    NameCtx::Store => Opcode::StoreDeref,
                    NameCtx::Del => Opcode::DeleteDeref,
                };
                self.emit_operand(op, Operand::Deref(idx))
            }
            NameFamily::Global => {
                let op = match ctx {
                    NameCtx::Load => Opcode::LoadGlobal,
                    NameCtx::Store => Opcode::StoreGlobal,
                    NameCtx::Del => Opcode::DeleteGlobal,
                };
                self.emit_named(op, name)
            }
            NameFamily::Name => {
                let op = match ctx {
                    NameCtx::Load => Opcode::LoadName,
                    NameCtx::Store => Opcode::StoreName,
                    NameCtx::Del => Opcode::DeleteName,
                };
                self.emit_named(op, name)
            }
        }
    }

    /// Push a function object for the finished unit `code`. Values for the
    /// other `flags` bits must already be on the stack.
    pub(crate) fn make_closure(&mut self, code: CodeUnit, mut flags: u32) -> CompileResult<()> {
        if !code.freevars.is_empty() {
            for name in &code.freevars {
                let idx = self.deref_index(name)?;
                self.emit_operand(Opcode::LoadClosure, Operand::Deref(idx))?;
            }
            self.emit_arg(Opcode::BuildTuple, code.freevars.len() as u32)?;
            flags |= MakeFunctionFlags::CLOSURE;
        }
        self.emit_const(Constant::Code(Box::new(code)))?;
        self.emit_arg(Opcode::MakeFunction, flags)
    }

    // ========================================================================
    // Docstrings
    // ========================================================================

    /// For module and class bodies: store the docstring as `__doc__` and
    /// return the statements after it.
    pub(crate) fn store_docstring<'b>(&mut self, body: &'b [Stmt]) -> CompileResult<&'b [Stmt]> {
        if self.options.optimize >= 2 {
            return Ok(body);
        }
        match (docstring(body), body.split_first()) {
            (Some(doc), Some((first, rest))) => {
                self.loc = Some(first.span);
                self.emit_const(Constant::Str(doc.to_string()))?;
                self.compile_name("__doc__", NameCtx::Store)?;
                Ok(rest)
            }
            _ => Ok(body),
        }
    }

    /// For function bodies: make the docstring (or `None`) the first
    /// constant and return the statements after it.
    pub(crate) fn function_docstring<'b>(&mut self, body: &'b [Stmt]) -> CompileResult<&'b [Stmt]> {
        let doc = if self.options.optimize >= 2 { None } else { docstring(body) };
        match doc {
            Some(doc) => {
                self.unit.consts.add(Constant::Str(doc.to_string()))?;
                Ok(&body[1..])
            }
            None => {
                self.unit.consts.add(Constant::None)?;
                Ok(body)
            }
        }
    }
}

/// The leading string literal of a body, if any.
pub(crate) fn docstring(body: &[Stmt]) -> Option<&str> {
    match &body.first()?.kind {
        StmtKind::Expr { value } => match &value.kind {
            ExprKind::Constant {
                value: crate::ast::Constant::Str(s),
            } => Some(s),
            _ => None,
        },
        _ => None,
    }
}

/// Whether a body holds an annotated assignment outside nested scopes,
/// which makes the unit set up an `__annotations__` mapping.
pub(crate) fn find_annotations(body: &[Stmt]) -> bool {
    body.iter().any(|stmt| match &stmt.kind {
        StmtKind::AnnAssign { .. } => true,
        StmtKind::For { body, orelse, .. }
        | StmtKind::While { body, orelse, .. }
        | StmtKind::If { body, orelse, .. } => find_annotations(body) || find_annotations(orelse),
        StmtKind::With { body, .. } => find_annotations(body),
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        } => {
            find_annotations(body)
                || handlers.iter().any(|h| find_annotations(&h.body))
                || find_annotations(orelse)
                || find_annotations(finalbody)
        }
        StmtKind::Match { cases, .. } => cases.iter().any(|c| find_annotations(&c.body)),
        _ => false,
    })
}
