use std::collections::{BTreeSet, HashMap, HashSet};

use pylower_common::ir::UnitKind;
use pylower_common::Span;
use tracing::{debug, trace};

use crate::ast::visitor::{walk_expr, walk_pattern, walk_stmt, Visitor};
use crate::ast::*;
use crate::error::{CompileError, CompileErrorKind, CompileResult};

use super::table::{NodeKey, ScopeRole, Symbol, SymbolFlags, SymbolScope, SymbolTable};

/// One scope while the tree is being collected. Scopes live in a flat
/// `Vec` linked by parent indices and are turned into a [`SymbolTable`]
/// tree once analysis is done.
#[derive(Debug)]
struct ScopeData {
    name: String,
    kind: UnitKind,
    line: u32,
    parent: Option<usize>,
    symbols: Vec<Symbol>,
    index: HashMap<String, usize>,
    params: Vec<String>,
    children: Vec<(NodeKey, usize)>,
    is_generator: bool,
    is_coroutine: bool,
    inlined: bool,
    needs_class_closure: bool,
    /// Human name of the comprehension kind, for comprehension scopes.
    comprehension: Option<&'static str>,
}

impl ScopeData {
    fn new(name: String, kind: UnitKind, line: u32, parent: Option<usize>) -> Self {
        Self {
            name,
            kind,
            line,
            parent,
            symbols: Vec::new(),
            index: HashMap::new(),
            params: Vec::new(),
            children: Vec::new(),
            is_generator: false,
            is_coroutine: false,
            inlined: false,
            needs_class_closure: false,
            comprehension: None,
        }
    }

    fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.index.get(name).map(|&i| &self.symbols[i])
    }
}

/// Two-pass scope resolver.
///
/// Pass 1 walks the module and records, per scope, every name that is
/// bound, read, or declared `global`/`nonlocal`. Pass 2 classifies each
/// name and pushes free variables up until a function-like scope that
/// binds them turns them into cells.
pub struct Resolver {
    scopes: Vec<ScopeData>,
    current: usize,
    inline_comprehensions: bool,
    max_depth: usize,
    depth: usize,
    too_deep: bool,
    errors: Vec<CompileError>,
}

impl Resolver {
    pub fn new(inline_comprehensions: bool, max_depth: usize) -> Self {
        Self {
            scopes: vec![ScopeData::new("<module>".into(), UnitKind::Module, 1, None)],
            current: 0,
            inline_comprehensions,
            max_depth,
            depth: 0,
            too_deep: false,
            errors: Vec::new(),
        }
    }

    /// Run both passes, returning the module's table or the first error.
    pub fn resolve(mut self, module: &Module) -> CompileResult<SymbolTable> {
        self.visit_module(module);
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        self.mark_inlined();
        self.analyze_scope(0, &HashSet::new())?;
        debug!(scopes = self.scopes.len(), "resolved symbol tables");
        Ok(self.build(0))
    }

    // ====================================================================
    // Scope bookkeeping
    // ====================================================================

    fn push_scope(&mut self, name: impl Into<String>, kind: UnitKind, key: NodeKey, line: u32) -> usize {
        let id = self.scopes.len();
        let mut scope = ScopeData::new(name.into(), kind, line, Some(self.current));
        scope.is_coroutine = kind == UnitKind::AsyncFunction;
        self.scopes.push(scope);
        self.scopes[self.current].children.push((key, id));
        trace!(id, parent = self.current, "enter scope");
        self.current = id;
        id
    }

    fn pop_scope(&mut self) {
        if let Some(parent) = self.scopes[self.current].parent {
            self.current = parent;
        }
    }

    fn error(&mut self, kind: CompileErrorKind, span: Span) {
        self.errors.push(CompileError::at(kind, span));
    }

    /// Record a use of `name` in scope `id`, creating the symbol on first sight.
    fn add(&mut self, id: usize, name: &str, span: Span, update: impl FnOnce(&mut SymbolFlags)) {
        let scope = &mut self.scopes[id];
        let idx = match scope.index.get(name) {
            Some(&idx) => idx,
            None => {
                scope.symbols.push(Symbol {
                    name: name.to_string(),
                    scope: SymbolScope::GlobalImplicit,
                    flags: SymbolFlags::default(),
                    span,
                });
                scope.index.insert(name.to_string(), scope.symbols.len() - 1);
                scope.symbols.len() - 1
            }
        };
        update(&mut scope.symbols[idx].flags);
    }

    fn bind(&mut self, name: &str, span: Span) {
        self.add(self.current, name, span, |f| f.assigned = true);
    }

    fn reference(&mut self, name: &str, span: Span) {
        self.add(self.current, name, span, |f| f.referenced = true);
    }

    fn add_param(&mut self, name: &str, span: Span) {
        let id = self.current;
        if self.scopes[id]
            .lookup(name)
            .is_some_and(|s| s.flags.parameter)
        {
            self.error(CompileErrorKind::DuplicateArgument(name.to_string()), span);
            return;
        }
        self.scopes[id].params.push(name.to_string());
        self.add(id, name, span, |f| f.parameter = true);
    }

    fn inside_class(&self) -> bool {
        let mut id = self.scopes[self.current].parent;
        while let Some(i) = id {
            if self.scopes[i].kind == UnitKind::Class {
                return true;
            }
            id = self.scopes[i].parent;
        }
        false
    }

    fn descend(&mut self, span: Span) -> bool {
        if self.depth >= self.max_depth {
            if !self.too_deep {
                self.too_deep = true;
                self.error(CompileErrorKind::TooDeeplyNested(self.max_depth), span);
            }
            return false;
        }
        self.depth += 1;
        true
    }

    // ====================================================================
    // Pass 1: collection
    // ====================================================================

    /// Bind the names an assignment target introduces; everything else in
    /// the target (attribute owners, subscripts) is a read.
    fn bind_target(&mut self, target: &Expr, iteration: bool) {
        match &target.kind {
            ExprKind::Name { id } => self.add(self.current, id, target.span, |f| {
                f.assigned = true;
                f.iteration |= iteration;
            }),
            ExprKind::Tuple { elts } | ExprKind::List { elts } => {
                for elt in elts {
                    self.bind_target(elt, iteration);
                }
            }
            ExprKind::Starred { value } => self.bind_target(value, iteration),
            _ => self.visit_expr(target),
        }
    }

    fn declare_global(&mut self, names: &[Identifier], span: Span) {
        for name in names {
            if let Some(sym) = self.scopes[self.current].lookup(name) {
                let flags = sym.flags;
                if flags.parameter {
                    self.error(CompileErrorKind::ParameterAndGlobal(name.clone()), span);
                } else if flags.nonlocal {
                    self.error(CompileErrorKind::NonlocalAndGlobal(name.clone()), span);
                } else if flags.assigned || flags.referenced || flags.annotated {
                    self.error(CompileErrorKind::UsedPriorToGlobal(name.clone()), span);
                }
            }
            self.add(self.current, name, span, |f| f.global = true);
        }
    }

    fn declare_nonlocal(&mut self, names: &[Identifier], span: Span) {
        if self.scopes[self.current].kind == UnitKind::Module {
            self.error(CompileErrorKind::NonlocalAtModuleLevel, span);
            return;
        }
        for name in names {
            if let Some(sym) = self.scopes[self.current].lookup(name) {
                let flags = sym.flags;
                if flags.parameter {
                    self.error(CompileErrorKind::ParameterAndNonlocal(name.clone()), span);
                } else if flags.global {
                    self.error(CompileErrorKind::NonlocalAndGlobal(name.clone()), span);
                } else if flags.assigned || flags.referenced || flags.annotated {
                    self.error(CompileErrorKind::UsedPriorToNonlocal(name.clone()), span);
                }
            }
            let id = self.current;
            self.add(id, name, span, |f| f.nonlocal = true);
            if let Some(&idx) = self.scopes[id].index.get(name.as_str()) {
                self.scopes[id].symbols[idx].span = span;
            }
        }
    }

    /// `name := value` binds in the nearest enclosing scope that is not a
    /// comprehension; the comprehensions in between only read it.
    fn bind_named_expr(&mut self, name: &str, span: Span) {
        let mut id = self.current;
        let mut through = Vec::new();
        while self.scopes[id].comprehension.is_some() {
            if self.scopes[id]
                .lookup(name)
                .is_some_and(|s| s.flags.iteration)
            {
                self.error(
                    CompileErrorKind::NamedExprRebindsIterationVariable(name.to_string()),
                    span,
                );
                return;
            }
            through.push(id);
            match self.scopes[id].parent {
                Some(parent) => id = parent,
                None => break,
            }
        }
        if !through.is_empty() && self.scopes[id].kind == UnitKind::Class {
            self.error(CompileErrorKind::NamedExprInClassComprehension, span);
            return;
        }
        for comp in through {
            self.add(comp, name, span, |f| f.referenced = true);
        }
        self.add(id, name, span, |f| f.assigned = true);
    }

    fn visit_type_params(&mut self, params: &[TypeParam]) {
        for param in params {
            self.bind(param.name(), param.span);
            self.visit_type_param(param);
        }
    }

    fn visit_annotations(&mut self, args: &Parameters, returns: Option<&Expr>) {
        for arg in args.all() {
            if let Some(annotation) = &arg.annotation {
                self.visit_expr(annotation);
            }
        }
        if let Some(returns) = returns {
            self.visit_expr(returns);
        }
    }

    fn visit_defaults(&mut self, args: &Parameters) {
        for default in &args.defaults {
            self.visit_expr(default);
        }
        for default in args.kw_defaults.iter().flatten() {
            self.visit_expr(default);
        }
    }

    fn visit_function_def(&mut self, stmt: &Stmt, def: &FunctionDef) {
        for decorator in &def.decorator_list {
            self.visit_expr(decorator);
        }
        self.visit_defaults(&def.args);
        let line = stmt.span.start.line;
        let generic = !def.type_params.is_empty();
        if generic {
            self.push_scope(
                format!("<generic parameters of {}>", def.name),
                UnitKind::Annotation,
                NodeKey::of(def, ScopeRole::TypeParams),
                line,
            );
            if !def.args.defaults.is_empty() {
                self.add_param(".defaults", stmt.span);
            }
            if def.args.kw_defaults.iter().any(Option::is_some) {
                self.add_param(".kwdefaults", stmt.span);
            }
            self.visit_type_params(&def.type_params);
        }
        self.visit_annotations(&def.args, def.returns.as_ref());

        let kind = if def.is_async {
            UnitKind::AsyncFunction
        } else {
            UnitKind::Function
        };
        self.push_scope(def.name.clone(), kind, NodeKey::of(def, ScopeRole::Body), line);
        for arg in def.args.all() {
            self.add_param(&arg.arg, arg.span);
        }
        self.visit_body(&def.body);
        self.pop_scope();

        if generic {
            self.pop_scope();
        }
        self.bind(&def.name, stmt.span);
    }

    fn visit_class_def(&mut self, stmt: &Stmt, def: &ClassDef) {
        for decorator in &def.decorator_list {
            self.visit_expr(decorator);
        }
        let line = stmt.span.start.line;
        let generic = !def.type_params.is_empty();
        if generic {
            self.push_scope(
                format!("<generic parameters of {}>", def.name),
                UnitKind::Annotation,
                NodeKey::of(def, ScopeRole::TypeParams),
                line,
            );
            self.visit_type_params(&def.type_params);
            self.bind(".type_params", stmt.span);
            self.bind(".generic_base", stmt.span);
        }

        self.push_scope(def.name.clone(), UnitKind::Class, NodeKey::of(def, ScopeRole::Body), line);
        if generic {
            self.reference(".type_params", stmt.span);
            self.bind("__type_params__", stmt.span);
        }
        self.visit_body(&def.body);
        self.pop_scope();

        for base in &def.bases {
            self.visit_expr(base);
        }
        for keyword in &def.keywords {
            self.visit_expr(&keyword.value);
        }
        if generic {
            self.pop_scope();
        }
        self.bind(&def.name, stmt.span);
    }

    fn visit_type_alias(&mut self, stmt: &Stmt, name: &str, type_params: &[TypeParam], value: &Expr) {
        let line = stmt.span.start.line;
        let generic = !type_params.is_empty();
        if generic {
            self.push_scope(
                format!("<generic parameters of {}>", name),
                UnitKind::Annotation,
                NodeKey::of(stmt, ScopeRole::TypeParams),
                line,
            );
            self.visit_type_params(type_params);
        }
        self.push_scope(name, UnitKind::Annotation, NodeKey::of(stmt, ScopeRole::AliasValue), line);
        self.visit_expr(value);
        self.pop_scope();
        if generic {
            self.pop_scope();
        }
        self.bind(name, stmt.span);
    }

    fn visit_comprehension_scope(
        &mut self,
        expr: &Expr,
        name: &str,
        desc: &'static str,
        generators: &[Comprehension],
        elts: &[&Expr],
    ) {
        let Some(first) = generators.first() else {
            return;
        };
        // the outermost iterable is evaluated in the enclosing scope
        self.visit_expr(&first.iter);
        let id = self.push_scope(
            name,
            UnitKind::Comprehension,
            NodeKey::of(expr, ScopeRole::Body),
            expr.span.start.line,
        );
        self.scopes[id].comprehension = Some(desc);
        self.scopes[id].is_generator = matches!(expr.kind, ExprKind::GeneratorExp { .. });
        self.add_param(".0", expr.span);
        for (i, generator) in generators.iter().enumerate() {
            if generator.is_async {
                self.scopes[id].is_coroutine = true;
            }
            if i > 0 {
                self.visit_expr(&generator.iter);
            }
            self.bind_target(&generator.target, true);
            for cond in &generator.ifs {
                self.visit_expr(cond);
            }
        }
        for elt in elts {
            self.visit_expr(elt);
        }
        self.pop_scope();
    }

    fn resolve_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::FunctionDef(def) => self.visit_function_def(stmt, def),
            StmtKind::ClassDef(def) => self.visit_class_def(stmt, def),
            StmtKind::TypeAlias {
                name,
                type_params,
                value,
            } => self.visit_type_alias(stmt, name, type_params, value),
            StmtKind::Assign { targets, value } => {
                self.visit_expr(value);
                for target in targets {
                    self.bind_target(target, false);
                }
            }
            StmtKind::AugAssign { target, value, .. } => {
                if let ExprKind::Name { id } = &target.kind {
                    self.add(self.current, id, target.span, |f| {
                        f.referenced = true;
                        f.assigned = true;
                    });
                } else {
                    self.visit_expr(target);
                }
                self.visit_expr(value);
            }
            StmtKind::AnnAssign {
                target,
                annotation,
                value,
                simple,
            } => {
                if let Some(value) = value {
                    self.visit_expr(value);
                }
                match &target.kind {
                    ExprKind::Name { id } if *simple || value.is_some() => {
                        self.add(self.current, id, target.span, |f| {
                            f.assigned = true;
                            f.annotated = true;
                        });
                    }
                    ExprKind::Name { .. } => {}
                    _ => self.visit_expr(target),
                }
                // annotations are only evaluated at module and class level
                if !self.scopes[self.current].kind.is_function_like() {
                    self.visit_expr(annotation);
                }
            }
            StmtKind::Delete { targets } => {
                for target in targets {
                    self.bind_target(target, false);
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
                ..
            } => {
                self.visit_expr(iter);
                self.bind_target(target, false);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            StmtKind::With { items, body, .. } => {
                for item in items {
                    self.visit_expr(&item.context_expr);
                    if let Some(vars) = &item.optional_vars {
                        self.bind_target(vars, false);
                    }
                }
                self.visit_body(body);
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            } => {
                self.visit_body(body);
                for handler in handlers {
                    if let Some(ty) = &handler.type_ {
                        self.visit_expr(ty);
                    }
                    if let Some(name) = &handler.name {
                        self.bind(name, handler.span);
                    }
                    self.visit_body(&handler.body);
                }
                self.visit_body(orelse);
                self.visit_body(finalbody);
            }
            StmtKind::Import { names } => {
                for alias in names {
                    let bound = match &alias.asname {
                        Some(asname) => asname.as_str(),
                        None => alias.name.split('.').next().unwrap_or(&alias.name),
                    };
                    self.add(self.current, bound, alias.span, |f| f.imported = true);
                }
            }
            StmtKind::ImportFrom { names, .. } => {
                for alias in names {
                    if alias.name == "*" {
                        continue;
                    }
                    let bound = alias.asname.as_deref().unwrap_or(&alias.name);
                    self.add(self.current, bound, alias.span, |f| f.imported = true);
                }
            }
            StmtKind::Global { names } => self.declare_global(names, stmt.span),
            StmtKind::Nonlocal { names } => self.declare_nonlocal(names, stmt.span),
            _ => walk_stmt(self, stmt),
        }
    }

    fn resolve_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name { id } => {
                self.reference(id, expr.span);
                if id == "super"
                    && self.scopes[self.current].kind.is_function_like()
                    && self.inside_class()
                {
                    self.reference("__class__", expr.span);
                }
            }
            ExprKind::NamedExpr { target, value } => {
                self.visit_expr(value);
                match &target.kind {
                    ExprKind::Name { id } => self.bind_named_expr(id, target.span),
                    _ => self.visit_expr(target),
                }
            }
            ExprKind::Lambda { args, body } => {
                self.visit_defaults(args);
                self.push_scope(
                    "<lambda>",
                    UnitKind::Lambda,
                    NodeKey::of(expr, ScopeRole::Body),
                    expr.span.start.line,
                );
                for arg in args.all() {
                    self.add_param(&arg.arg, arg.span);
                }
                self.visit_expr(body);
                self.pop_scope();
            }
            ExprKind::ListComp { elt, generators } => {
                self.visit_comprehension_scope(expr, "<listcomp>", "list comprehension", generators, &[elt.as_ref()])
            }
            ExprKind::SetComp { elt, generators } => {
                self.visit_comprehension_scope(expr, "<setcomp>", "set comprehension", generators, &[elt.as_ref()])
            }
            ExprKind::GeneratorExp { elt, generators } => self.visit_comprehension_scope(
                expr,
                "<genexpr>",
                "generator expression",
                generators,
                &[elt.as_ref()],
            ),
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => self.visit_comprehension_scope(
                expr,
                "<dictcomp>",
                "dict comprehension",
                generators,
                &[key.as_ref(), value.as_ref()],
            ),
            ExprKind::Yield { .. } | ExprKind::YieldFrom { .. } => {
                let scope = &mut self.scopes[self.current];
                if let Some(desc) = scope.comprehension {
                    self.error(CompileErrorKind::YieldInComprehension(desc), expr.span);
                } else if scope.kind.is_function_like() {
                    scope.is_generator = true;
                }
                walk_expr(self, expr);
            }
            ExprKind::Await { .. } => {
                let scope = &mut self.scopes[self.current];
                if scope.comprehension.is_some() {
                    scope.is_coroutine = true;
                }
                walk_expr(self, expr);
            }
            _ => walk_expr(self, expr),
        }
    }

    // ====================================================================
    // Pass 2: classification
    // ====================================================================

    fn mark_inlined(&mut self) {
        if !self.inline_comprehensions {
            return;
        }
        for id in 0..self.scopes.len() {
            let scope = &self.scopes[id];
            if scope.comprehension.is_none()
                || scope.is_generator
                || scope.is_coroutine
                || !scope.children.is_empty()
            {
                continue;
            }
            let Some(parent) = scope.parent.map(|p| &self.scopes[p]) else {
                continue;
            };
            if !matches!(
                parent.kind,
                UnitKind::Function | UnitKind::AsyncFunction | UnitKind::Lambda
            ) {
                continue;
            }
            let conflicts = scope.symbols.iter().filter(|s| s.flags.is_bound()).any(|s| {
                parent
                    .lookup(&s.name)
                    .is_some_and(|p| p.flags.global || p.flags.nonlocal)
            });
            if !conflicts {
                self.scopes[id].inlined = true;
            }
        }
    }

    /// Classify every symbol of scope `id` given the names bound by
    /// enclosing function-like scopes. Returns the names this scope needs
    /// from its parent.
    fn analyze_scope(&mut self, id: usize, bound_above: &HashSet<String>) -> CompileResult<BTreeSet<String>> {
        let children: Vec<usize> = self.scopes[id].children.iter().map(|&(_, c)| c).collect();

        // reads inside an inlined comprehension are reads of this scope
        for &child in &children {
            if !self.scopes[child].inlined {
                continue;
            }
            let reads: Vec<(String, Span)> = self.scopes[child]
                .symbols
                .iter()
                .filter(|s| !s.flags.is_bound())
                .map(|s| (s.name.clone(), s.span))
                .collect();
            for (name, span) in reads {
                self.add(id, &name, span, |f| f.referenced = true);
            }
        }

        let kind = self.scopes[id].kind;
        for sym in self.scopes[id].symbols.iter_mut() {
            sym.scope = if sym.flags.global {
                SymbolScope::GlobalExplicit
            } else if sym.flags.nonlocal {
                if !bound_above.contains(&sym.name) {
                    return Err(CompileError::at(
                        CompileErrorKind::NonlocalWithoutBinding(sym.name.clone()),
                        sym.span,
                    ));
                }
                SymbolScope::Free
            } else if sym.flags.is_bound() {
                SymbolScope::Local
            } else if bound_above.contains(&sym.name) {
                SymbolScope::Free
            } else {
                SymbolScope::GlobalImplicit
            };
        }

        let mut child_bound = bound_above.clone();
        match kind {
            UnitKind::Module => child_bound.clear(),
            UnitKind::Class => {
                child_bound.insert("__class__".to_string());
                for sym in &self.scopes[id].symbols {
                    if sym.scope == SymbolScope::GlobalExplicit {
                        child_bound.remove(&sym.name);
                    }
                }
            }
            _ => {
                for sym in &self.scopes[id].symbols {
                    match sym.scope {
                        SymbolScope::Local | SymbolScope::Cell | SymbolScope::Free => {
                            child_bound.insert(sym.name.clone());
                        }
                        SymbolScope::GlobalExplicit | SymbolScope::GlobalImplicit => {
                            child_bound.remove(&sym.name);
                        }
                    }
                }
            }
        }

        let mut child_free = BTreeSet::new();
        for &child in &children {
            if !self.scopes[child].inlined {
                child_free.extend(self.analyze_scope(child, &child_bound)?);
            }
        }

        for name in child_free {
            let scope = &mut self.scopes[id];
            match scope.index.get(&name).copied() {
                Some(idx) => {
                    let sym = &mut scope.symbols[idx];
                    if sym.scope == SymbolScope::Local {
                        if kind.is_function_like() {
                            sym.scope = SymbolScope::Cell;
                        } else {
                            sym.flags.free_class = true;
                        }
                    }
                }
                None => {
                    let (sym_scope, needs_closure) = if kind == UnitKind::Class && name == "__class__" {
                        (SymbolScope::Cell, true)
                    } else {
                        (SymbolScope::Free, false)
                    };
                    scope.needs_class_closure |= needs_closure;
                    scope.symbols.push(Symbol {
                        name: name.clone(),
                        scope: sym_scope,
                        flags: SymbolFlags::default(),
                        span: Span::dummy(),
                    });
                    scope.index.insert(name, scope.symbols.len() - 1);
                }
            }
        }

        // inlined comprehensions see exactly what this scope sees
        for &child in &children {
            if !self.scopes[child].inlined {
                continue;
            }
            let resolved: Vec<SymbolScope> = self.scopes[child]
                .symbols
                .iter()
                .map(|s| {
                    if s.flags.is_bound() {
                        SymbolScope::Local
                    } else {
                        self.scopes[id]
                            .lookup(&s.name)
                            .map_or(SymbolScope::GlobalImplicit, |p| p.scope)
                    }
                })
                .collect();
            for (sym, scope) in self.scopes[child].symbols.iter_mut().zip(resolved) {
                sym.scope = scope;
            }
        }

        Ok(self.scopes[id]
            .symbols
            .iter()
            .filter(|s| s.scope == SymbolScope::Free || s.flags.free_class)
            .map(|s| s.name.clone())
            .collect())
    }

    fn build(&mut self, id: usize) -> SymbolTable {
        let child_ids = std::mem::take(&mut self.scopes[id].children);
        let mut children = Vec::with_capacity(child_ids.len());
        let mut child_index = HashMap::with_capacity(child_ids.len());
        for (key, child) in child_ids {
            child_index.insert(key, children.len());
            children.push(self.build(child));
        }
        let scope = &mut self.scopes[id];
        SymbolTable {
            name: std::mem::take(&mut scope.name),
            kind: scope.kind,
            line: scope.line,
            symbols: std::mem::take(&mut scope.symbols),
            params: std::mem::take(&mut scope.params),
            children,
            is_generator: scope.is_generator,
            is_coroutine: scope.is_coroutine,
            inlined: scope.inlined,
            needs_class_closure: scope.needs_class_closure,
            index: std::mem::take(&mut scope.index),
            child_index,
        }
    }
}

impl Visitor for Resolver {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        if !self.descend(stmt.span) {
            return;
        }
        self.resolve_stmt(stmt);
        self.depth -= 1;
    }

    fn visit_expr(&mut self, expr: &Expr) {
        if !self.descend(expr.span) {
            return;
        }
        self.resolve_expr(expr);
        self.depth -= 1;
    }

    fn visit_pattern(&mut self, pattern: &Pattern) {
        match &pattern.kind {
            PatternKind::MatchAs { name: Some(name), .. }
            | PatternKind::MatchStar { name: Some(name) }
            | PatternKind::MatchMapping {
                rest: Some(name), ..
            } => self.bind(name, pattern.span),
            _ => {}
        }
        walk_pattern(self, pattern);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;

    fn resolve(body: Vec<Stmt>) -> SymbolTable {
        Resolver::new(true, 200)
            .resolve(&module(body))
            .expect("resolution failed")
    }

    fn resolve_err(body: Vec<Stmt>) -> CompileErrorKind {
        Resolver::new(true, 200)
            .resolve(&module(body))
            .expect_err("expected an error")
            .kind
    }

    #[test]
    fn module_names() {
        let table = resolve(vec![
            assign(name("x"), int(1)),
            expr_stmt(call(name("print"), vec![name("x")])),
        ]);
        assert_eq!(table.scope_of("x"), Some(SymbolScope::Local));
        assert_eq!(table.scope_of("print"), Some(SymbolScope::GlobalImplicit));
    }

    #[test]
    fn closure_makes_cell_and_free() {
        let table = resolve(vec![def(
            "f",
            &[],
            vec![
                assign(name("x"), int(1)),
                def("g", &[], vec![ret(Some(name("x")))]),
            ],
        )]);
        let f = table.find("f").unwrap();
        let g = table.find("g").unwrap();
        assert_eq!(f.scope_of("x"), Some(SymbolScope::Cell));
        assert_eq!(g.scope_of("x"), Some(SymbolScope::Free));
        assert_eq!(f.scope_of("g"), Some(SymbolScope::Local));
    }

    #[test]
    fn free_variable_passes_through_intermediate_function() {
        let table = resolve(vec![def(
            "outer",
            &["a"],
            vec![def(
                "middle",
                &[],
                vec![def("inner", &[], vec![ret(Some(name("a")))])],
            )],
        )]);
        assert_eq!(table.find("outer").unwrap().scope_of("a"), Some(SymbolScope::Cell));
        assert_eq!(table.find("middle").unwrap().scope_of("a"), Some(SymbolScope::Free));
        assert_eq!(table.find("inner").unwrap().scope_of("a"), Some(SymbolScope::Free));
    }

    #[test]
    fn global_declaration() {
        let table = resolve(vec![def(
            "f",
            &[],
            vec![global(&["x"]), assign(name("x"), int(1))],
        )]);
        assert_eq!(
            table.find("f").unwrap().scope_of("x"),
            Some(SymbolScope::GlobalExplicit)
        );
    }

    #[test]
    fn nonlocal_binds_enclosing_local() {
        let table = resolve(vec![def(
            "f",
            &[],
            vec![
                assign(name("n"), int(0)),
                def(
                    "g",
                    &[],
                    vec![nonlocal(&["n"]), aug_assign(name("n"), Operator::Add, int(1))],
                ),
            ],
        )]);
        assert_eq!(table.find("f").unwrap().scope_of("n"), Some(SymbolScope::Cell));
        assert_eq!(table.find("g").unwrap().scope_of("n"), Some(SymbolScope::Free));
    }

    #[test]
    fn nonlocal_without_binding_is_an_error() {
        let kind = resolve_err(vec![def(
            "f",
            &[],
            vec![nonlocal(&["missing"]), pass()],
        )]);
        assert_eq!(kind, CompileErrorKind::NonlocalWithoutBinding("missing".into()));
    }

    #[test]
    fn nonlocal_at_module_level_is_an_error() {
        assert_eq!(
            resolve_err(vec![nonlocal(&["x"])]),
            CompileErrorKind::NonlocalAtModuleLevel
        );
    }

    #[test]
    fn global_after_use_is_an_error() {
        let kind = resolve_err(vec![def(
            "f",
            &[],
            vec![assign(name("x"), int(1)), global(&["x"])],
        )]);
        assert_eq!(kind, CompileErrorKind::UsedPriorToGlobal("x".into()));
    }

    #[test]
    fn duplicate_parameter_is_an_error() {
        let kind = resolve_err(vec![def("f", &["a", "a"], vec![pass()])]);
        assert_eq!(kind, CompileErrorKind::DuplicateArgument("a".into()));
    }

    #[test]
    fn super_creates_class_cell() {
        let table = resolve(vec![class(
            "C",
            vec![],
            vec![def(
                "m",
                &["self"],
                vec![expr_stmt(call(attr(call(name("super"), vec![]), "m"), vec![]))],
            )],
        )]);
        let class_table = table.find("C").unwrap();
        assert!(class_table.needs_class_closure);
        assert_eq!(class_table.scope_of("__class__"), Some(SymbolScope::Cell));
        assert_eq!(
            table.find("m").unwrap().scope_of("__class__"),
            Some(SymbolScope::Free)
        );
    }

    #[test]
    fn class_local_also_passed_through() {
        let table = resolve(vec![def(
            "f",
            &[],
            vec![
                assign(name("x"), int(1)),
                class(
                    "C",
                    vec![],
                    vec![
                        assign(name("x"), int(2)),
                        def("m", &["self"], vec![ret(Some(name("x")))]),
                    ],
                ),
            ],
        )]);
        let class_table = table.find("C").unwrap();
        let x = class_table.lookup("x").unwrap();
        assert_eq!(x.scope, SymbolScope::Local);
        assert!(x.flags.free_class);
        assert_eq!(class_table.free_names(), vec!["x".to_string()]);
        assert_eq!(table.find("f").unwrap().scope_of("x"), Some(SymbolScope::Cell));
    }

    #[test]
    fn class_body_names_are_invisible_to_methods() {
        let table = resolve(vec![class(
            "C",
            vec![],
            vec![
                assign(name("y"), int(2)),
                def("m", &["self"], vec![ret(Some(name("y")))]),
            ],
        )]);
        assert_eq!(
            table.find("m").unwrap().scope_of("y"),
            Some(SymbolScope::GlobalImplicit)
        );
    }

    #[test]
    fn comprehension_in_function_is_inlined() {
        let table = resolve(vec![def(
            "f",
            &["xs"],
            vec![
                assign(name("k"), int(1)),
                ret(Some(list_comp(
                    binop(name("y"), Operator::Add, name("k")),
                    vec![comp_for(name("y"), name("xs"), vec![])],
                ))),
            ],
        )]);
        let f = table.find("f").unwrap();
        let comp = table.find("<listcomp>").unwrap();
        assert!(comp.inlined);
        assert_eq!(comp.scope_of("y"), Some(SymbolScope::Local));
        assert_eq!(comp.scope_of("k"), Some(SymbolScope::Local));
        assert_eq!(f.scope_of("k"), Some(SymbolScope::Local));
        assert_eq!(comp.comprehension_locals(), vec!["y".to_string()]);
    }

    #[test]
    fn module_comprehension_and_genexp_are_not_inlined() {
        let table = resolve(vec![
            expr_stmt(list_comp(name("y"), vec![comp_for(name("y"), name("xs"), vec![])])),
            def(
                "f",
                &["xs"],
                vec![ret(Some(genexp(name("y"), vec![comp_for(name("y"), name("xs"), vec![])])))],
            ),
        ]);
        assert!(!table.find("<listcomp>").unwrap().inlined);
        let gen = table.find("<genexpr>").unwrap();
        assert!(!gen.inlined);
        assert!(gen.is_generator);
    }

    #[test]
    fn named_expr_in_comprehension_binds_enclosing_function() {
        let body = vec![def(
            "f",
            &["xs"],
            vec![
                expr_stmt(list_comp(
                    named("last", name("x")),
                    vec![comp_for(name("x"), name("xs"), vec![])],
                )),
                ret(Some(name("last"))),
            ],
        )];
        let m = module(body);
        let table = Resolver::new(false, 200).resolve(&m).unwrap();
        assert_eq!(table.find("f").unwrap().scope_of("last"), Some(SymbolScope::Cell));
        assert_eq!(
            table.find("<listcomp>").unwrap().scope_of("last"),
            Some(SymbolScope::Free)
        );
    }

    #[test]
    fn named_expr_in_class_comprehension_is_an_error() {
        let kind = resolve_err(vec![class(
            "C",
            vec![],
            vec![expr_stmt(list_comp(
                named("y", name("x")),
                vec![comp_for(name("x"), name("xs"), vec![])],
            ))],
        )]);
        assert_eq!(kind, CompileErrorKind::NamedExprInClassComprehension);
    }

    #[test]
    fn named_expr_cannot_rebind_iteration_variable() {
        let kind = resolve_err(vec![expr_stmt(list_comp(
            named("x", int(0)),
            vec![comp_for(name("x"), name("xs"), vec![])],
        ))]);
        assert_eq!(
            kind,
            CompileErrorKind::NamedExprRebindsIterationVariable("x".into())
        );
    }

    #[test]
    fn yield_marks_generator() {
        let table = resolve(vec![def("g", &[], vec![expr_stmt(yield_(Some(int(1))))])]);
        assert!(table.find("g").unwrap().is_generator);
    }

    #[test]
    fn yield_in_comprehension_is_an_error() {
        let kind = resolve_err(vec![expr_stmt(list_comp(
            yield_(None),
            vec![comp_for(name("x"), name("xs"), vec![])],
        ))]);
        assert_eq!(kind, CompileErrorKind::YieldInComprehension("list comprehension"));
    }

    #[test]
    fn lambda_params_are_local() {
        let table = resolve(vec![assign(
            name("f"),
            lambda(&["a"], binop(name("a"), Operator::Add, name("b"))),
        )]);
        let lam = table.find("<lambda>").unwrap();
        assert_eq!(lam.scope_of("a"), Some(SymbolScope::Local));
        assert_eq!(lam.scope_of("b"), Some(SymbolScope::GlobalImplicit));
        assert_eq!(lam.params, vec!["a".to_string()]);
    }

    #[test]
    fn deep_nesting_reports_resource_error() {
        let mut e = name("x");
        for _ in 0..50 {
            e = unary(UnaryOperator::Not, e);
        }
        let err = Resolver::new(true, 20)
            .resolve(&module(vec![expr_stmt(e)]))
            .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::TooDeeplyNested(20));
        assert!(err.is_resource());
    }
}
