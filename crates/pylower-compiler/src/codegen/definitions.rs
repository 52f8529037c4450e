//! Functions, lambdas, classes and type aliases.
//!
//! A generic definition is wrapped in an annotation unit that creates the
//! type parameters, builds the definition inside, and is called at once.

use pylower_common::ir::{Constant, Operand};
use pylower_common::ir_opcodes::{Intrinsic1, Intrinsic2, MakeFunctionFlags};
use pylower_common::{Opcode, Span};

use super::compiler::{find_annotations, Compiler, NameCtx};
use crate::ast::{ClassDef, Expr, ExprKind, FunctionDef, Parameters, Stmt, TypeParam, TypeParamKind};
use crate::error::{CompileError, CompileErrorKind, CompileResult};
use crate::semantic::{NodeKey, ScopeRole};

impl<'a> Compiler<'a> {
    // ========================================================================
    // Functions
    // ========================================================================

    pub(crate) fn compile_function_def(&mut self, stmt: &'a Stmt, def: &'a FunctionDef) -> CompileResult<()> {
        let loc = Some(stmt.span);
        let first_line = first_line(stmt, &def.decorator_list);
        check_parameters(&def.args)?;
        self.visit_decorators(&def.decorator_list)?;
        self.loc = loc;
        let flags = self.compile_defaults(&def.args)?;
        if def.type_params.is_empty() {
            let annotations = self.function_annotations(&def.args, def.returns.as_ref())?;
            self.compile_function_body(def, first_line, flags | annotations)?;
        } else {
            self.compile_generic_function(def, loc, first_line, flags)?;
        }
        self.apply_decorators(&def.decorator_list)?;
        self.loc = loc;
        self.compile_name(&def.name, NameCtx::Store)
    }

    /// Lower the body into its own unit and push the function object.
    fn compile_function_body(&mut self, def: &'a FunctionDef, first_line: u32, flags: u32) -> CompileResult<()> {
        let loc = self.loc;
        let args = &def.args;
        let code = self.compile_unit(&def.name, NodeKey::of(def, ScopeRole::Body), first_line, |c| {
            c.set_signature(args);
            let body = c.function_docstring(&def.body)?;
            c.visit_body(body)
        })?;
        self.loc = loc;
        self.make_closure(code, flags)
    }

    /// `def f[T](...)`: defaults are evaluated outside and passed to the
    /// type-parameter unit as `.defaults` and `.kwdefaults`.
    fn compile_generic_function(
        &mut self,
        def: &'a FunctionDef,
        loc: Option<Span>,
        first_line: u32,
        flags: u32,
    ) -> CompileResult<()> {
        let passed = [MakeFunctionFlags::DEFAULTS, MakeFunctionFlags::KW_DEFAULTS]
            .into_iter()
            .filter(|&bit| flags & bit != 0)
            .count() as u32;
        match passed {
            0 => self.emit(Opcode::PushNull)?,
            2 => self.emit_arg(Opcode::Swap, 2)?,
            _ => {}
        }

        let name = format!("<generic parameters of {}>", def.name);
        let key = NodeKey::of(def, ScopeRole::TypeParams);
        let code = self.compile_unit(&name, key, first_line, |c| {
            c.unit.argcount = passed;
            c.loc = loc;
            c.compile_type_params(&def.type_params)?;
            for slot in 0..passed {
                c.emit_operand(Opcode::LoadFast, Operand::Local(slot))?;
            }
            let annotations = c.function_annotations(&def.args, def.returns.as_ref())?;
            c.compile_function_body(def, first_line, flags | annotations)?;
            c.loc = loc;
            c.emit_arg(Opcode::Swap, 2)?;
            c.emit_arg(Opcode::CallIntrinsic2, Intrinsic2::SetFunctionTypeParams as u32)?;
            c.emit(Opcode::ReturnValue)
        })?;

        self.loc = loc;
        self.make_closure(code, 0)?;
        if passed > 0 {
            // the first passed value takes the self slot of the call
            self.emit_arg(Opcode::Swap, passed + 1)?;
            self.emit_arg(Opcode::Call, passed - 1)
        } else {
            self.emit_arg(Opcode::Call, 0)
        }
    }

    fn set_signature(&mut self, args: &Parameters) {
        self.unit.posonlyargcount = args.posonlyargs.len() as u32;
        self.unit.argcount = (args.posonlyargs.len() + args.args.len()) as u32;
        self.unit.kwonlyargcount = args.kwonlyargs.len() as u32;
        self.unit.flags.varargs = args.vararg.is_some();
        self.unit.flags.varkeywords = args.kwarg.is_some();
    }

    /// Push the defaults tuple and the keyword-defaults map, returning the
    /// matching `MAKE_FUNCTION` bits.
    fn compile_defaults(&mut self, args: &'a Parameters) -> CompileResult<u32> {
        let loc = self.loc;
        let mut flags = 0;
        if !args.defaults.is_empty() {
            for default in &args.defaults {
                self.visit_expr(default)?;
            }
            self.loc = loc;
            self.emit_arg(Opcode::BuildTuple, args.defaults.len() as u32)?;
            flags |= MakeFunctionFlags::DEFAULTS;
        }

        let kw_defaults: Vec<(&'a str, &'a Expr)> = args
            .kwonlyargs
            .iter()
            .zip(&args.kw_defaults)
            .filter_map(|(arg, default)| default.as_ref().map(|d| (arg.arg.as_str(), d)))
            .collect();
        if !kw_defaults.is_empty() {
            for &(_, default) in &kw_defaults {
                self.visit_expr(default)?;
            }
            self.loc = loc;
            let names = kw_defaults.iter().map(|&(name, _)| Constant::Str(name.to_string())).collect();
            self.emit_const(Constant::Tuple(names))?;
            self.emit_arg(Opcode::BuildConstKeyMap, kw_defaults.len() as u32)?;
            flags |= MakeFunctionFlags::KW_DEFAULTS;
        }
        Ok(flags)
    }

    /// Push a flat `(name, value, ...)` tuple of parameter and return
    /// annotations, if there are any.
    fn function_annotations(&mut self, args: &'a Parameters, returns: Option<&'a Expr>) -> CompileResult<u32> {
        let loc = self.loc;
        let mut count = 0u32;
        let params = args
            .args
            .iter()
            .chain(&args.posonlyargs)
            .chain(&args.vararg)
            .chain(&args.kwonlyargs)
            .chain(&args.kwarg);
        for param in params {
            if let Some(annotation) = &param.annotation {
                self.annotation_item(&param.arg, annotation)?;
                count += 2;
            }
        }
        if let Some(returns) = returns {
            self.annotation_item("return", returns)?;
            count += 2;
        }
        if count == 0 {
            return Ok(0);
        }
        self.loc = loc;
        self.emit_arg(Opcode::BuildTuple, count)?;
        Ok(MakeFunctionFlags::ANNOTATIONS)
    }

    fn annotation_item(&mut self, name: &str, annotation: &'a Expr) -> CompileResult<()> {
        self.emit_const(Constant::Str(name.to_string()))?;
        self.visit_unpackable(annotation)
    }

    /// `*Ts` in an annotation or a type-parameter default evaluates to the
    /// single item it unpacks.
    fn visit_unpackable(&mut self, expr: &'a Expr) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::Starred { value } => {
                self.visit_expr(value)?;
                self.loc = Some(expr.span);
                self.emit_arg(Opcode::UnpackSequence, 1)
            }
            _ => self.visit_expr(expr),
        }
    }

    fn visit_decorators(&mut self, decorators: &'a [Expr]) -> CompileResult<()> {
        for decorator in decorators {
            self.visit_expr(decorator)?;
        }
        Ok(())
    }

    /// Innermost decorator first; each sits below the object it wraps.
    fn apply_decorators(&mut self, decorators: &'a [Expr]) -> CompileResult<()> {
        for decorator in decorators.iter().rev() {
            self.loc = Some(decorator.span);
            self.emit_arg(Opcode::Call, 0)?;
        }
        Ok(())
    }

    // ========================================================================
    // Lambdas
    // ========================================================================

    pub(crate) fn compile_lambda(&mut self, expr: &'a Expr, args: &'a Parameters, body: &'a Expr) -> CompileResult<()> {
        let loc = Some(expr.span);
        check_parameters(args)?;
        let flags = self.compile_defaults(args)?;
        let key = NodeKey::of(expr, ScopeRole::Body);
        let code = self.compile_unit("<lambda>", key, expr.span.start.line, |c| {
            c.set_signature(args);
            // no docstring slot
            c.unit.consts.add(Constant::None)?;
            c.visit_expr(body)?;
            c.loc = loc;
            if c.unit.table.is_generator {
                c.emit(Opcode::PopTop)
            } else {
                c.emit(Opcode::ReturnValue)
            }
        })?;
        self.loc = loc;
        self.make_closure(code, flags)
    }

    // ========================================================================
    // Classes
    // ========================================================================

    pub(crate) fn compile_class_def(&mut self, stmt: &'a Stmt, def: &'a ClassDef) -> CompileResult<()> {
        let loc = Some(stmt.span);
        let first_line = first_line(stmt, &def.decorator_list);
        self.visit_decorators(&def.decorator_list)?;
        self.loc = loc;

        if def.type_params.is_empty() {
            self.emit(Opcode::PushNull)?;
            self.emit(Opcode::LoadBuildClass)?;
            self.compile_class_body(def, first_line)?;
            self.emit_const(Constant::Str(def.name.clone()))?;
            self.call_helper(2, &def.bases, None, &def.keywords)?;
        } else {
            self.emit(Opcode::PushNull)?;
            let name = format!("<generic parameters of {}>", def.name);
            let key = NodeKey::of(def, ScopeRole::TypeParams);
            let code = self.compile_unit(&name, key, first_line, |c| {
                c.loc = loc;
                c.compile_type_params(&def.type_params)?;
                c.compile_name(".type_params", NameCtx::Store)?;
                c.emit(Opcode::PushNull)?;
                c.emit(Opcode::LoadBuildClass)?;
                c.compile_class_body(def, first_line)?;
                c.emit_const(Constant::Str(def.name.clone()))?;
                c.compile_name(".type_params", NameCtx::Load)?;
                c.emit_intrinsic1(Intrinsic1::SubscriptGeneric)?;
                c.compile_name(".generic_base", NameCtx::Store)?;
                c.call_helper(2, &def.bases, Some(".generic_base"), &def.keywords)?;
                c.loc = loc;
                c.emit(Opcode::ReturnValue)
            })?;
            self.loc = loc;
            self.make_closure(code, 0)?;
            self.emit_arg(Opcode::Call, 0)?;
        }

        self.apply_decorators(&def.decorator_list)?;
        self.loc = loc;
        self.compile_name(&def.name, NameCtx::Store)
    }

    /// Push the function that runs the class body. The body returns the
    /// `__class__` cell when methods use it, `None` otherwise.
    fn compile_class_body(&mut self, def: &'a ClassDef, first_line: u32) -> CompileResult<()> {
        let loc = self.loc;
        let generic = !def.type_params.is_empty();
        let code = self.compile_unit(&def.name, NodeKey::of(def, ScopeRole::Body), first_line, |c| {
            c.loc = loc;
            c.compile_name("__name__", NameCtx::Load)?;
            c.compile_name("__module__", NameCtx::Store)?;
            let qualname = c.unit.qualname.clone();
            c.emit_const(Constant::Str(qualname))?;
            c.compile_name("__qualname__", NameCtx::Store)?;
            if generic {
                c.compile_name(".type_params", NameCtx::Load)?;
                c.compile_name("__type_params__", NameCtx::Store)?;
            }
            if find_annotations(&def.body) {
                c.emit(Opcode::SetupAnnotations)?;
            }
            let body = c.store_docstring(&def.body)?;
            c.visit_body(body)?;

            c.loc = None;
            if c.unit.table.needs_class_closure {
                let idx = c.deref_index("__class__")?;
                c.emit_operand(Opcode::LoadClosure, Operand::Deref(idx))?;
                c.emit_arg(Opcode::Copy, 1)?;
                c.compile_name("__classcell__", NameCtx::Store)?;
            } else {
                c.emit_none()?;
            }
            c.emit(Opcode::ReturnValue)
        })?;
        self.loc = loc;
        self.make_closure(code, 0)
    }

    // ========================================================================
    // Type parameters and aliases
    // ========================================================================

    /// Create each type parameter, bind it, and leave them all as a tuple.
    fn compile_type_params(&mut self, params: &'a [TypeParam]) -> CompileResult<()> {
        let mut seen_default = false;
        for param in params {
            self.loc = Some(param.span);
            let name = param.name();
            self.emit_const(Constant::Str(name.to_string()))?;
            match &param.kind {
                TypeParamKind::TypeVar { bound: Some(bound), .. } => {
                    let intrinsic = match bound.kind {
                        ExprKind::Tuple { .. } => Intrinsic2::TypeVarWithConstraints,
                        _ => Intrinsic2::TypeVarWithBound,
                    };
                    self.visit_expr(bound)?;
                    self.loc = Some(param.span);
                    self.emit_arg(Opcode::CallIntrinsic2, intrinsic as u32)?;
                }
                TypeParamKind::TypeVar { bound: None, .. } => self.emit_intrinsic1(Intrinsic1::TypeVar)?,
                TypeParamKind::ParamSpec { .. } => self.emit_intrinsic1(Intrinsic1::ParamSpec)?,
                TypeParamKind::TypeVarTuple { .. } => self.emit_intrinsic1(Intrinsic1::TypeVarTuple)?,
            }
            match param.default_value() {
                Some(default) => {
                    seen_default = true;
                    self.visit_unpackable(default)?;
                    self.loc = Some(param.span);
                    self.emit_arg(Opcode::CallIntrinsic2, Intrinsic2::SetTypeparamDefault as u32)?;
                }
                None if seen_default => {
                    return Err(CompileError::at(
                        CompileErrorKind::NonDefaultTypeParamAfterDefault(name.to_string()),
                        param.span,
                    ));
                }
                None => {}
            }
            self.emit_arg(Opcode::Copy, 1)?;
            self.compile_name(name, NameCtx::Store)?;
        }
        self.emit_arg(Opcode::BuildTuple, params.len() as u32)
    }

    pub(crate) fn compile_type_alias(
        &mut self,
        stmt: &'a Stmt,
        name: &'a str,
        type_params: &'a [TypeParam],
        value: &'a Expr,
    ) -> CompileResult<()> {
        let loc = Some(stmt.span);
        self.loc = loc;
        if type_params.is_empty() {
            self.emit_const(Constant::Str(name.to_string()))?;
            self.emit_none()?;
            self.type_alias_value(stmt, name, value)?;
        } else {
            self.emit(Opcode::PushNull)?;
            let unit_name = format!("<generic parameters of {}>", name);
            let key = NodeKey::of(stmt, ScopeRole::TypeParams);
            let code = self.compile_unit(&unit_name, key, stmt.span.start.line, |c| {
                c.loc = loc;
                c.emit_const(Constant::Str(name.to_string()))?;
                c.compile_type_params(type_params)?;
                c.loc = loc;
                c.type_alias_value(stmt, name, value)?;
                c.emit(Opcode::ReturnValue)
            })?;
            self.loc = loc;
            self.make_closure(code, 0)?;
            self.emit_arg(Opcode::Call, 0)?;
        }
        self.loc = loc;
        self.compile_name(name, NameCtx::Store)
    }

    /// With name and type parameters pushed, add the lazily evaluated
    /// value function and build the alias.
    fn type_alias_value(&mut self, stmt: &'a Stmt, name: &str, value: &'a Expr) -> CompileResult<()> {
        let loc = self.loc;
        let key = NodeKey::of(stmt, ScopeRole::AliasValue);
        let code = self.compile_unit(name, key, stmt.span.start.line, |c| {
            c.unit.consts.add(Constant::None)?;
            c.visit_expr(value)?;
            c.loc = loc;
            c.emit(Opcode::ReturnValue)
        })?;
        self.loc = loc;
        self.make_closure(code, 0)?;
        self.emit_arg(Opcode::BuildTuple, 3)?;
        self.emit_intrinsic1(Intrinsic1::TypeAlias)
    }
}

/// Line of the first decorator, or of the definition itself.
fn first_line(stmt: &Stmt, decorators: &[Expr]) -> u32 {
    decorators
        .first()
        .map_or(stmt.span.start.line, |d| d.span.start.line)
}

fn check_parameters(args: &Parameters) -> CompileResult<()> {
    match args.all().find(|a| a.arg == "__debug__") {
        Some(arg) => Err(CompileError::at(CompileErrorKind::AssignToDebug, arg.span)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::ast::{Keyword, Module, StmtKind};
    use crate::semantic;
    use pylower_common::ir::{CodeUnit, UnitKind};
    use pylower_common::LoweringOptions;

    fn lower(body: Vec<Stmt>) -> CompileResult<CodeUnit> {
        let module: Module = module(body);
        let options = LoweringOptions::default();
        let table = semantic::analyze(&module, &options)?;
        Compiler::new(&table, &options, "test.py")?.compile_module(&module)
    }

    fn args(unit: &CodeUnit, op: Opcode) -> Vec<Operand> {
        unit.instructions.iter().filter(|i| i.op == op).map(|i| i.arg).collect()
    }

    fn child<'u>(unit: &'u CodeUnit, name: &str) -> &'u CodeUnit {
        unit.children()
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("no unit named {name}"))
    }

    fn function(name: &str, params: &[&str], body: Vec<Stmt>, edit: impl FnOnce(&mut FunctionDef)) -> Stmt {
        let mut s = def(name, params, body);
        if let StmtKind::FunctionDef(f) = &mut s.kind {
            edit(f);
        }
        s
    }

    #[test]
    fn signature_counts_and_flags() {
        let f = function("f", &["a", "b"], vec![expr_stmt(str_("doc")), pass()], |f| {
            f.args.vararg = Some(arg("rest"));
            f.args.kwonlyargs = vec![arg("c")];
            f.args.kw_defaults = vec![None];
            f.args.kwarg = Some(arg("kw"));
        });
        let unit = lower(vec![f]).unwrap();
        let f = child(&unit, "f");
        assert_eq!(f.argcount, 2);
        assert_eq!(f.kwonlyargcount, 1);
        assert!(f.flags.varargs && f.flags.varkeywords);
        assert_eq!(f.varnames, ["a", "b", "c", "rest", "kw"]);
        assert_eq!(f.consts[0], Constant::Str("doc".into()));
        assert_eq!(args(&unit, Opcode::MakeFunction), vec![Operand::Int(0)]);
    }

    #[test]
    fn defaults_and_keyword_defaults() {
        let f = function("f", &["a"], vec![pass()], |f| {
            f.args.defaults = vec![int(1)];
            f.args.kwonlyargs = vec![arg("k"), arg("j")];
            f.args.kw_defaults = vec![Some(int(2)), None];
        });
        let unit = lower(vec![f]).unwrap();
        assert_eq!(args(&unit, Opcode::BuildConstKeyMap), vec![Operand::Int(1)]);
        assert_eq!(
            args(&unit, Opcode::MakeFunction),
            vec![Operand::Int(MakeFunctionFlags::DEFAULTS | MakeFunctionFlags::KW_DEFAULTS)]
        );
        assert!(unit.consts.contains(&Constant::Tuple(vec![Constant::Str("k".into())])));
    }

    #[test]
    fn annotations_are_a_flat_tuple() {
        let f = function("f", &["a", "b"], vec![pass()], |f| {
            f.args.args[0].annotation = Some(Box::new(name("int")));
            f.returns = Some(name("str"));
        });
        let unit = lower(vec![f]).unwrap();
        assert_eq!(args(&unit, Opcode::BuildTuple), vec![Operand::Int(4)]);
        assert_eq!(
            args(&unit, Opcode::MakeFunction),
            vec![Operand::Int(MakeFunctionFlags::ANNOTATIONS)]
        );
    }

    #[test]
    fn decorators_apply_innermost_first() {
        let f = function("f", &[], vec![pass()], |f| {
            f.decorator_list = vec![name("outer"), name("inner")];
        });
        let unit = lower(vec![f]).unwrap();
        assert_eq!(
            unit.opcodes()[..7],
            [
                Opcode::LoadName,
                Opcode::LoadName,
                Opcode::LoadConst,
                Opcode::MakeFunction,
                Opcode::Call,
                Opcode::Call,
                Opcode::StoreName,
            ]
        );
    }

    #[test]
    fn closures_capture_cells() {
        let inner = def("inner", &[], vec![ret(Some(name("x")))]);
        let outer = def("outer", &[], vec![assign(name("x"), int(1)), inner, ret(Some(name("inner")))]);
        let unit = lower(vec![outer]).unwrap();
        let outer = child(&unit, "outer");
        let inner = child(outer, "inner");
        assert_eq!(inner.freevars, ["x"]);
        assert_eq!(inner.qualname, "outer.<locals>.inner");
        assert_eq!(outer.cellvars, ["x"]);
        assert_eq!(outer.opcodes()[0], Opcode::MakeCell);
        assert_eq!(args(outer, Opcode::MakeFunction), vec![Operand::Int(MakeFunctionFlags::CLOSURE)]);
        assert_eq!(args(outer, Opcode::LoadClosure), vec![Operand::Deref(0)]);
    }

    #[test]
    fn lambda_returns_its_body() {
        let unit = lower(vec![assign(name("f"), lambda(&["x"], name("x")))]).unwrap();
        let l = child(&unit, "<lambda>");
        assert_eq!(l.kind, UnitKind::Lambda);
        assert_eq!(l.argcount, 1);
        assert_eq!(l.consts[0], Constant::None);
        assert_eq!(l.opcodes(), [Opcode::LoadFast, Opcode::ReturnValue]);
    }

    #[test]
    fn class_body_and_build_class_call() {
        let method = def("m", &["self"], vec![ret(Some(call(name("super"), vec![])))]);
        let mut c = class("C", vec![name("Base")], vec![expr_stmt(str_("doc")), method]);
        if let StmtKind::ClassDef(def) = &mut c.kind {
            def.keywords.push(Keyword {
                arg: Some("metaclass".into()),
                value: name("Meta"),
                span: Span::default(),
            });
        }
        let unit = lower(vec![c]).unwrap();
        assert_eq!(unit.opcodes()[..2], [Opcode::PushNull, Opcode::LoadBuildClass]);
        // body function, name, base, keyword
        assert_eq!(args(&unit, Opcode::Call), vec![Operand::Int(4)]);
        assert_eq!(args(&unit, Opcode::KwNames).len(), 1);

        let body = child(&unit, "C");
        assert_eq!(body.kind, UnitKind::Class);
        let stored: Vec<&str> = body
            .instructions
            .iter()
            .filter_map(|i| match (i.op, i.arg) {
                (Opcode::StoreName, Operand::Name(n)) => Some(body.names[n as usize].as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stored, ["__module__", "__qualname__", "__doc__", "m", "__classcell__"]);
        assert_eq!(body.cellvars, ["__class__"]);
        assert_eq!(child(body, "m").qualname, "C.m");
    }

    #[test]
    fn plain_class_returns_none() {
        let unit = lower(vec![class("C", vec![], vec![pass()])]).unwrap();
        let body = child(&unit, "C");
        let ops = body.opcodes();
        assert_eq!(ops[ops.len() - 2..], [Opcode::LoadConst, Opcode::ReturnValue]);
        assert_eq!(args(&unit, Opcode::Call), vec![Operand::Int(2)]);
    }

    #[test]
    fn generic_function_sets_type_params() {
        let f = function("f", &["x"], vec![ret(Some(name("x")))], |f| {
            f.type_params = vec![type_var("T", None)];
            f.args.args[0].annotation = Some(Box::new(name("T")));
        });
        let unit = lower(vec![f]).unwrap();
        assert_eq!(unit.opcodes()[0], Opcode::PushNull);
        assert_eq!(args(&unit, Opcode::Call), vec![Operand::Int(0)]);

        let generic = child(&unit, "<generic parameters of f>");
        assert_eq!(generic.kind, UnitKind::Annotation);
        assert_eq!(
            args(generic, Opcode::CallIntrinsic1),
            vec![Operand::Int(Intrinsic1::TypeVar as u32)]
        );
        assert_eq!(
            args(generic, Opcode::CallIntrinsic2),
            vec![Operand::Int(Intrinsic2::SetFunctionTypeParams as u32)]
        );
        assert_eq!(child(generic, "f").qualname, "f");
    }

    #[test]
    fn generic_function_passes_defaults() {
        let f = function("f", &["x"], vec![pass()], |f| {
            f.type_params = vec![type_var("T", None)];
            f.args.defaults = vec![int(0)];
        });
        let unit = lower(vec![f]).unwrap();
        assert!(!unit.opcodes().contains(&Opcode::PushNull));
        let ops = unit.opcodes();
        let call = ops.iter().position(|&op| op == Opcode::Call).unwrap();
        assert_eq!(ops[call - 1], Opcode::Swap);
        let generic = child(&unit, "<generic parameters of f>");
        assert_eq!(generic.argcount, 1);
        assert_eq!(generic.varnames[0], ".defaults");
    }

    #[test]
    fn generic_class_gets_generic_base() {
        let mut c = class("Box", vec![], vec![pass()]);
        if let StmtKind::ClassDef(def) = &mut c.kind {
            def.type_params = vec![type_var("T", None)];
        }
        let unit = lower(vec![c]).unwrap();
        let generic = child(&unit, "<generic parameters of Box>");
        assert!(args(generic, Opcode::CallIntrinsic1).contains(&Operand::Int(Intrinsic1::SubscriptGeneric as u32)));
        // body function, name, .generic_base
        assert_eq!(args(generic, Opcode::Call), vec![Operand::Int(3)]);
        let body = child(generic, "Box");
        assert_eq!(body.qualname, "Box");
        assert_eq!(body.freevars, [".type_params"]);
    }

    #[test]
    fn type_alias_builds_lazily() {
        let alias = stmt(StmtKind::TypeAlias {
            name: "Ints".into(),
            type_params: vec![],
            value: subscript(name("list"), name("int")),
        });
        let unit = lower(vec![alias]).unwrap();
        assert_eq!(args(&unit, Opcode::BuildTuple), vec![Operand::Int(3)]);
        assert_eq!(
            args(&unit, Opcode::CallIntrinsic1),
            vec![Operand::Int(Intrinsic1::TypeAlias as u32)]
        );
        let value = child(&unit, "Ints");
        assert_eq!(value.kind, UnitKind::Annotation);
        assert_eq!(value.consts[0], Constant::None);
    }

    #[test]
    fn type_param_defaults_must_not_be_followed_by_plain_params() {
        let f = function("f", &[], vec![pass()], |f| {
            f.type_params = vec![type_var("T", Some(name("int"))), type_var("U", None)];
        });
        let err = lower(vec![f]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::NonDefaultTypeParamAfterDefault("U".into()));
    }

    #[test]
    fn debug_parameter_is_rejected() {
        let err = lower(vec![def("f", &["__debug__"], vec![pass()])]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::AssignToDebug);
    }
}
