//! List, set and dict comprehensions and generator expressions.
//!
//! A comprehension in a function body is inlined: its iteration variables
//! borrow the enclosing frame's slots, saved before the loop and restored
//! after it (also when the loop raises). Everywhere else a comprehension is
//! a nested unit called with the outermost iterator as its only argument.

use pylower_common::ir::{Operand, UnitKind};
use pylower_common::Opcode;
use tracing::debug;

use super::compiler::Compiler;
use super::fblock::{FBlock, FBlockKind};
use crate::ast::{Comprehension, Expr, ExprKind};
use crate::error::{CompileError, CompileErrorKind, CompileResult};
use crate::semantic::{NodeKey, ScopeRole, SymbolTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompKind {
    List,
    Set,
    Dict,
    Generator,
}

impl CompKind {
    fn unit_name(self) -> &'static str {
        match self {
            CompKind::List => "<listcomp>",
            CompKind::Set => "<setcomp>",
            CompKind::Dict => "<dictcomp>",
            CompKind::Generator => "<genexpr>",
        }
    }

    /// Opcode creating the empty result collection.
    fn build_op(self) -> Option<Opcode> {
        match self {
            CompKind::List => Some(Opcode::BuildList),
            CompKind::Set => Some(Opcode::BuildSet),
            CompKind::Dict => Some(Opcode::BuildMap),
            CompKind::Generator => None,
        }
    }
}

/// The element part of a comprehension: `elt`, plus the value for dicts.
#[derive(Clone, Copy)]
struct Element<'a> {
    kind: CompKind,
    elt: &'a Expr,
    value: Option<&'a Expr>,
}

impl<'a> Compiler<'a> {
    pub(crate) fn compile_comprehension(
        &mut self,
        expr: &'a Expr,
        kind: CompKind,
        generators: &'a [Comprehension],
        elt: &'a Expr,
        value: Option<&'a Expr>,
    ) -> CompileResult<()> {
        let name = kind.unit_name();
        let outermost = generators
            .first()
            .ok_or_else(|| CompileError::internal(CompileErrorKind::MissingSymbolTable(name.to_string())))?;
        let key = NodeKey::of(expr, ScopeRole::Body);
        let table = self.child_table(key, name)?;
        let element = Element { kind, elt, value };
        let loc = Some(expr.span);

        debug!(comprehension = name, line = expr.span.start.line, inlined = table.inlined, "lowering comprehension");
        if table.inlined {
            return self.inline_comprehension(table, generators, element);
        }

        let is_async = table.is_coroutine;
        if is_async
            && kind != CompKind::Generator
            && !matches!(self.unit.kind, UnitKind::AsyncFunction | UnitKind::Comprehension)
        {
            return Err(CompileError::at(
                CompileErrorKind::AsyncComprehensionOutsideAsyncFunction,
                expr.span,
            ));
        }

        let code = self.compile_unit(name, key, expr.span.start.line, |c| {
            c.unit.argcount = 1;
            c.loc = loc;
            if let Some(op) = kind.build_op() {
                c.emit_arg(op, 0)?;
            }
            c.comprehension_generator(generators, 0, 0, element, false)?;
            if kind != CompKind::Generator {
                c.loc = loc;
                c.emit(Opcode::ReturnValue)?;
            }
            Ok(())
        })?;

        self.loc = loc;
        self.make_closure(code, 0)?;
        self.comprehension_iter(outermost)?;
        self.loc = loc;
        self.emit_arg(Opcode::Call, 0)?;
        if is_async && kind != CompKind::Generator {
            self.emit_arg(Opcode::GetAwaitable, 0)?;
            self.emit_yield_from()?;
        }
        Ok(())
    }

    /// Evaluate the outermost iterable in the enclosing scope.
    fn comprehension_iter(&mut self, generator: &'a Comprehension) -> CompileResult<()> {
        self.visit_expr(&generator.iter)?;
        self.loc = Some(generator.iter.span);
        if generator.is_async {
            self.emit(Opcode::GetAiter)
        } else {
            self.emit(Opcode::GetIter)
        }
    }

    fn inline_comprehension(
        &mut self,
        table: &'a SymbolTable,
        generators: &'a [Comprehension],
        element: Element<'a>,
    ) -> CompileResult<()> {
        let outermost = &generators[0];
        self.comprehension_iter(outermost)?;
        let pushed = table.comprehension_locals();
        self.unit.inlined.push(table);
        let result = self.inlined_body(&pushed, generators, element);
        self.unit.inlined.pop();
        result
    }

    fn inlined_body(
        &mut self,
        pushed: &[String],
        generators: &'a [Comprehension],
        element: Element<'a>,
    ) -> CompileResult<()> {
        let loc = Some(element.elt.span);
        // stack: iterator
        for name in pushed {
            let idx = self.unit.varnames.get_or_insert(name)?;
            self.emit_operand(Opcode::LoadFastAndClear, Operand::Local(idx))?;
        }
        let cleanup = if pushed.is_empty() {
            None
        } else {
            // saved values go under the iterator
            self.emit_arg(Opcode::Swap, pushed.len() as u32 + 1)?;
            let cleanup = self.new_label()?;
            let end = self.new_label()?;
            self.emit_jump(Opcode::SetupFinally, cleanup)?;
            Some((cleanup, end))
        };

        if let Some(op) = element.kind.build_op() {
            self.emit_arg(op, 0)?;
            self.emit_arg(Opcode::Swap, 2)?;
        }
        self.comprehension_generator(generators, 0, 0, element, true)?;

        if let Some((cleanup, end)) = cleanup {
            self.loc = None;
            self.emit(Opcode::PopBlock)?;
            self.emit_jump(Opcode::Jump, end)?;

            // drop the partial result, restore, re-raise
            self.place(cleanup)?;
            self.emit_arg(Opcode::Swap, 2)?;
            self.emit(Opcode::PopTop)?;
            self.restore_inlined_locals(pushed)?;
            self.emit_arg(Opcode::Reraise, 0)?;

            self.place(end)?;
            self.restore_inlined_locals(pushed)?;
            self.loc = loc;
        }
        Ok(())
    }

    /// With the saved values under the top of stack, put them back into
    /// their slots and leave the top of stack in place.
    fn restore_inlined_locals(&mut self, pushed: &[String]) -> CompileResult<()> {
        self.emit_arg(Opcode::Swap, pushed.len() as u32 + 1)?;
        for name in pushed.iter().rev() {
            let idx = self.unit.varnames.get_or_insert(name)?;
            self.emit_operand(Opcode::StoreFastMaybeNull, Operand::Local(idx))?;
        }
        Ok(())
    }

    fn comprehension_generator(
        &mut self,
        generators: &'a [Comprehension],
        index: usize,
        depth: u32,
        element: Element<'a>,
        iter_on_stack: bool,
    ) -> CompileResult<()> {
        self.nested(|c| {
            if generators[index].is_async {
                c.async_comprehension_generator(generators, index, depth, element, iter_on_stack)
            } else {
                c.sync_comprehension_generator(generators, index, depth, element, iter_on_stack)
            }
        })
    }

    fn sync_comprehension_generator(
        &mut self,
        generators: &'a [Comprehension],
        index: usize,
        mut depth: u32,
        element: Element<'a>,
        iter_on_stack: bool,
    ) -> CompileResult<()> {
        let generator = &generators[index];
        let if_cleanup = self.new_label()?;
        let anchor = self.new_label()?;
        let mut looping = true;

        if !iter_on_stack {
            if index == 0 {
                // the outermost iterator is the unit's only argument
                self.emit_operand(Opcode::LoadFast, Operand::Local(0))?;
            } else if let Some(only) = single_item(&generator.iter) {
                // `for y in [expr]` binds once without iterating
                self.visit_expr(only)?;
                looping = false;
            } else {
                self.visit_expr(&generator.iter)?;
                self.loc = Some(generator.iter.span);
                self.emit(Opcode::GetIter)?;
            }
        }

        let start = if looping {
            depth += 1;
            let start = self.new_label()?;
            self.place(start)?;
            self.loc = Some(generator.iter.span);
            self.emit_jump(Opcode::ForIter, anchor)?;
            Some(start)
        } else {
            None
        };

        self.compile_store(&generator.target)?;
        for cond in &generator.ifs {
            self.jump_if(cond, if_cleanup, false)?;
        }

        if index + 1 < generators.len() {
            self.comprehension_generator(generators, index + 1, depth, element, false)?;
        } else {
            self.comprehension_element(element, depth)?;
        }

        self.place(if_cleanup)?;
        if let Some(start) = start {
            self.loc = Some(element.elt.span);
            self.emit_jump(Opcode::Jump, start)?;
            self.place(anchor)?;
            self.loc = None;
            self.emit(Opcode::EndFor)?;
        }
        Ok(())
    }

    fn async_comprehension_generator(
        &mut self,
        generators: &'a [Comprehension],
        index: usize,
        depth: u32,
        element: Element<'a>,
        iter_on_stack: bool,
    ) -> CompileResult<()> {
        let generator = &generators[index];
        let start = self.new_label()?;
        let except = self.new_label()?;
        let if_cleanup = self.new_label()?;

        if !iter_on_stack {
            if index == 0 {
                self.emit_operand(Opcode::LoadFast, Operand::Local(0))?;
            } else {
                self.visit_expr(&generator.iter)?;
                self.loc = Some(generator.iter.span);
                self.emit(Opcode::GetAiter)?;
            }
        }

        self.place(start)?;
        let mut guard = self.push_fblock(FBlock::new(
            FBlockKind::AsyncComprehensionGenerator,
            Some(start),
            None,
        ))?;
        guard.emit_jump(Opcode::SetupFinally, except)?;
        guard.emit(Opcode::GetAnext)?;
        guard.emit_yield_from()?;
        guard.emit(Opcode::PopBlock)?;
        guard.compile_store(&generator.target)?;
        for cond in &generator.ifs {
            guard.jump_if(cond, if_cleanup, false)?;
        }

        if index + 1 < generators.len() {
            guard.comprehension_generator(generators, index + 1, depth + 1, element, false)?;
        } else {
            guard.comprehension_element(element, depth + 1)?;
        }

        guard.place(if_cleanup)?;
        guard.emit_jump(Opcode::Jump, start)?;
        guard.finish()?;

        self.place(except)?;
        self.loc = None;
        self.emit(Opcode::EndAsyncFor)
    }

    /// Add one element to the result at `depth` entries below the top, or
    /// yield it from a generator expression.
    fn comprehension_element(&mut self, element: Element<'a>, depth: u32) -> CompileResult<()> {
        self.visit_expr(element.elt)?;
        self.loc = Some(element.elt.span);
        match element.kind {
            CompKind::Generator => {
                self.emit_yield_value()?;
                self.emit(Opcode::PopTop)
            }
            CompKind::List => self.emit_arg(Opcode::ListAppend, depth + 1),
            CompKind::Set => self.emit_arg(Opcode::SetAdd, depth + 1),
            CompKind::Dict => {
                if let Some(value) = element.value {
                    self.visit_expr(value)?;
                }
                self.emit_arg(Opcode::MapAdd, depth + 1)
            }
        }
    }
}

fn single_item(iter: &Expr) -> Option<&Expr> {
    match &iter.kind {
        ExprKind::List { elts } | ExprKind::Tuple { elts } => match elts.as_slice() {
            [only] if !only.is_starred() => Some(only),
            _ => None,
        },
        _ => None,
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

    fn count(unit: &CodeUnit, op: Opcode) -> usize {
        unit.instructions.iter().filter(|i| i.op == op).count()
    }

    fn squares() -> Expr {
        list_comp(
            binop(name("x"), crate::ast::Operator::Mult, name("x")),
            vec![comp_for(name("x"), name("xs"), vec![])],
        )
    }

    #[test]
    fn module_listcomp_is_a_nested_unit() {
        let unit = lower(vec![assign(name("ys"), squares())]).unwrap();
        let comp = unit.children().next().expect("comprehension unit");
        assert_eq!(comp.name, "<listcomp>");
        assert_eq!(comp.kind, UnitKind::Comprehension);
        assert_eq!(comp.argcount, 1);
        assert_eq!(comp.varnames[0], ".0");
        assert_eq!(
            comp.instructions.iter().find(|i| i.op == Opcode::ListAppend).map(|i| i.arg),
            Some(Operand::Int(2))
        );
        let ops = unit.opcodes();
        let call = ops.iter().position(|&op| op == Opcode::Call).unwrap();
        assert_eq!(ops[call - 2..=call], [Opcode::LoadName, Opcode::GetIter, Opcode::Call]);
    }

    #[test]
    fn function_listcomp_is_inlined() {
        let unit = lower(vec![def("f", &["xs"], vec![ret(Some(squares()))])]).unwrap();
        let f = unit.children().next().unwrap();
        assert_eq!(f.children().count(), 0);
        assert_eq!(count(f, Opcode::LoadFastAndClear), 1);
        assert_eq!(count(f, Opcode::StoreFastMaybeNull), 2);
        assert_eq!(count(f, Opcode::Reraise), 1);
        assert!(f.varnames.iter().any(|v| v == "x"));
        // list sits under the iterator, one below the loop value
        assert_eq!(
            f.instructions.iter().find(|i| i.op == Opcode::ListAppend).map(|i| i.arg),
            Some(Operand::Int(2))
        );
    }

    #[test]
    fn inlining_can_be_disabled() {
        let module = module(vec![def("f", &["xs"], vec![ret(Some(squares()))])]);
        let options = LoweringOptions {
            inline_comprehensions: false,
            ..LoweringOptions::default()
        };
        let table = semantic::analyze(&module, &options).unwrap();
        let unit = Compiler::new(&table, &options, "test.py")
            .unwrap()
            .compile_module(&module)
            .unwrap();
        let f = unit.children().next().unwrap();
        assert_eq!(f.children().next().map(|c| c.name.as_str()), Some("<listcomp>"));
        assert_eq!(count(f, Opcode::LoadFastAndClear), 0);
    }

    #[test]
    fn genexp_yields_each_element() {
        let g = genexp(name("x"), vec![comp_for(name("x"), name("xs"), vec![name("x")])]);
        let unit = lower(vec![expr_stmt(call(name("sum"), vec![g]))]).unwrap();
        let genexpr = unit.children().next().unwrap();
        assert_eq!(genexpr.name, "<genexpr>");
        assert!(genexpr.flags.generator);
        assert_eq!(count(genexpr, Opcode::YieldValue), 1);
        assert_eq!(count(genexpr, Opcode::ListAppend), 0);
        // the generator body is wrapped in the StopIteration guard
        assert_eq!(count(genexpr, Opcode::CallIntrinsic1), 1);
    }

    #[test]
    fn dict_comprehension_adds_pairs() {
        let d = dict_comp(
            name("k"),
            name("v"),
            vec![comp_for(tuple(vec![name("k"), name("v")]), name("items"), vec![])],
        );
        let unit = lower(vec![assign(name("d"), d)]).unwrap();
        let comp = unit.children().next().unwrap();
        assert_eq!(comp.opcodes()[..2], [Opcode::BuildMap, Opcode::LoadFast]);
        assert_eq!(count(comp, Opcode::MapAdd), 1);
        assert_eq!(count(comp, Opcode::UnpackSequence), 1);
    }

    #[test]
    fn nested_generators_append_deeper() {
        let c = set_comp(
            name("y"),
            vec![
                comp_for(name("x"), name("xs"), vec![]),
                comp_for(name("y"), name("x"), vec![]),
            ],
        );
        let unit = lower(vec![assign(name("s"), c)]).unwrap();
        let comp = unit.children().next().unwrap();
        assert_eq!(count(comp, Opcode::ForIter), 2);
        assert_eq!(count(comp, Opcode::EndFor), 2);
        assert_eq!(
            comp.instructions.iter().find(|i| i.op == Opcode::SetAdd).map(|i| i.arg),
            Some(Operand::Int(3))
        );
    }

    #[test]
    fn single_item_inner_iterable_does_not_loop() {
        let c = list_comp(
            name("y"),
            vec![
                comp_for(name("x"), name("xs"), vec![]),
                comp_for(name("y"), list(vec![call(name("f"), vec![name("x")])]), vec![]),
            ],
        );
        let unit = lower(vec![assign(name("ys"), c)]).unwrap();
        let comp = unit.children().next().unwrap();
        assert_eq!(count(comp, Opcode::ForIter), 1);
        assert_eq!(count(comp, Opcode::BuildList), 1);
    }

    #[test]
    fn async_comprehension_needs_async_function() {
        let async_gen = Comprehension {
            is_async: true,
            ..comp_for(name("x"), name("xs"), vec![])
        };
        let err = lower(vec![assign(name("ys"), list_comp(name("x"), vec![async_gen.clone()]))])
            .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::AsyncComprehensionOutsideAsyncFunction);

        let unit = lower(vec![async_def(
            "f",
            &["xs"],
            vec![ret(Some(list_comp(name("x"), vec![async_gen])))],
        )])
        .unwrap();
        let f = unit.children().next().unwrap();
        let comp = f.children().next().unwrap();
        assert_eq!(count(comp, Opcode::GetAnext), 1);
        assert_eq!(count(comp, Opcode::EndAsyncFor), 1);
        assert_eq!(count(f, Opcode::GetAiter), 1);
        assert_eq!(count(f, Opcode::GetAwaitable), 1);
    }
}
