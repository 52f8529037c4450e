use super::nodes::*;

/// Visitor trait for walking the AST.
///
/// Default implementations walk children through the `walk_*` functions;
/// override a method and call the matching `walk_*` to keep descending.
pub trait Visitor {
    fn visit_module(&mut self, module: &Module) {
        for stmt in &module.body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        walk_expr(self, expr);
    }

    fn visit_pattern(&mut self, pattern: &Pattern) {
        walk_pattern(self, pattern);
    }

    fn visit_parameters(&mut self, params: &Parameters) {
        walk_parameters(self, params);
    }

    fn visit_comprehension(&mut self, comp: &Comprehension) {
        self.visit_expr(&comp.iter);
        self.visit_expr(&comp.target);
        for cond in &comp.ifs {
            self.visit_expr(cond);
        }
    }

    fn visit_type_param(&mut self, param: &TypeParam) {
        match &param.kind {
            TypeParamKind::TypeVar {
                bound,
                default_value,
                ..
            } => {
                if let Some(bound) = bound {
                    self.visit_expr(bound);
                }
                if let Some(default) = default_value {
                    self.visit_expr(default);
                }
            }
            TypeParamKind::ParamSpec { default_value, .. }
            | TypeParamKind::TypeVarTuple { default_value, .. } => {
                if let Some(default) = default_value {
                    self.visit_expr(default);
                }
            }
        }
    }

    fn visit_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.visit_stmt(stmt);
        }
    }
}

pub fn walk_stmt<V: Visitor + ?Sized>(v: &mut V, stmt: &Stmt) {
    match &stmt.kind {
        StmtKind::FunctionDef(def) => {
            for dec in &def.decorator_list {
                v.visit_expr(dec);
            }
            for tp in &def.type_params {
                v.visit_type_param(tp);
            }
            v.visit_parameters(&def.args);
            if let Some(returns) = &def.returns {
                v.visit_expr(returns);
            }
            v.visit_body(&def.body);
        }
        StmtKind::ClassDef(def) => {
            for dec in &def.decorator_list {
                v.visit_expr(dec);
            }
            for tp in &def.type_params {
                v.visit_type_param(tp);
            }
            for base in &def.bases {
                v.visit_expr(base);
            }
            for kw in &def.keywords {
                v.visit_expr(&kw.value);
            }
            v.visit_body(&def.body);
        }
        StmtKind::Return { value } => {
            if let Some(value) = value {
                v.visit_expr(value);
            }
        }
        StmtKind::Delete { targets } => {
            for t in targets {
                v.visit_expr(t);
            }
        }
        StmtKind::Assign { targets, value } => {
            v.visit_expr(value);
            for t in targets {
                v.visit_expr(t);
            }
        }
        StmtKind::AugAssign { target, value, .. } => {
            v.visit_expr(value);
            v.visit_expr(target);
        }
        StmtKind::AnnAssign {
            target,
            annotation,
            value,
            ..
        } => {
            if let Some(value) = value {
                v.visit_expr(value);
            }
            v.visit_expr(annotation);
            v.visit_expr(target);
        }
        StmtKind::TypeAlias {
            type_params, value, ..
        } => {
            for tp in type_params {
                v.visit_type_param(tp);
            }
            v.visit_expr(value);
        }
        StmtKind::For {
            target,
            iter,
            body,
            orelse,
            ..
        } => {
            v.visit_expr(iter);
            v.visit_expr(target);
            v.visit_body(body);
            v.visit_body(orelse);
        }
        StmtKind::While { test, body, orelse } | StmtKind::If { test, body, orelse } => {
            v.visit_expr(test);
            v.visit_body(body);
            v.visit_body(orelse);
        }
        StmtKind::With { items, body, .. } => {
            for item in items {
                v.visit_expr(&item.context_expr);
                if let Some(vars) = &item.optional_vars {
                    v.visit_expr(vars);
                }
            }
            v.visit_body(body);
        }
        StmtKind::Match { subject, cases } => {
            v.visit_expr(subject);
            for case in cases {
                v.visit_pattern(&case.pattern);
                if let Some(guard) = &case.guard {
                    v.visit_expr(guard);
                }
                v.visit_body(&case.body);
            }
        }
        StmtKind::Raise { exc, cause } => {
            if let Some(exc) = exc {
                v.visit_expr(exc);
            }
            if let Some(cause) = cause {
                v.visit_expr(cause);
            }
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        } => {
            v.visit_body(body);
            for handler in handlers {
                if let Some(ty) = &handler.type_ {
                    v.visit_expr(ty);
                }
                v.visit_body(&handler.body);
            }
            v.visit_body(orelse);
            v.visit_body(finalbody);
        }
        StmtKind::Assert { test, msg } => {
            v.visit_expr(test);
            if let Some(msg) = msg {
                v.visit_expr(msg);
            }
        }
        StmtKind::Expr { value } => v.visit_expr(value),
        StmtKind::Import { .. }
        | StmtKind::ImportFrom { .. }
        | StmtKind::Global { .. }
        | StmtKind::Nonlocal { .. }
        | StmtKind::Pass
        | StmtKind::Break
        | StmtKind::Continue => {}
    }
}

pub fn walk_expr<V: Visitor + ?Sized>(v: &mut V, expr: &Expr) {
    match &expr.kind {
        ExprKind::BoolOp { values, .. } => {
            for value in values {
                v.visit_expr(value);
            }
        }
        ExprKind::NamedExpr { target, value } => {
            v.visit_expr(value);
            v.visit_expr(target);
        }
        ExprKind::BinOp { left, right, .. } => {
            v.visit_expr(left);
            v.visit_expr(right);
        }
        ExprKind::UnaryOp { operand, .. } => v.visit_expr(operand),
        ExprKind::Lambda { args, body } => {
            v.visit_parameters(args);
            v.visit_expr(body);
        }
        ExprKind::IfExp { test, body, orelse } => {
            v.visit_expr(test);
            v.visit_expr(body);
            v.visit_expr(orelse);
        }
        ExprKind::Dict { keys, values } => {
            for (key, value) in keys.iter().zip(values) {
                if let Some(key) = key {
                    v.visit_expr(key);
                }
                v.visit_expr(value);
            }
        }
        ExprKind::Set { elts } | ExprKind::List { elts } | ExprKind::Tuple { elts } => {
            for elt in elts {
                v.visit_expr(elt);
            }
        }
        ExprKind::ListComp { elt, generators }
        | ExprKind::SetComp { elt, generators }
        | ExprKind::GeneratorExp { elt, generators } => {
            for comp in generators {
                v.visit_comprehension(comp);
            }
            v.visit_expr(elt);
        }
        ExprKind::DictComp {
            key,
            value,
            generators,
        } => {
            for comp in generators {
                v.visit_comprehension(comp);
            }
            v.visit_expr(key);
            v.visit_expr(value);
        }
        ExprKind::Await { value } | ExprKind::YieldFrom { value } => v.visit_expr(value),
        ExprKind::Yield { value } => {
            if let Some(value) = value {
                v.visit_expr(value);
            }
        }
        ExprKind::Compare {
            left, comparators, ..
        } => {
            v.visit_expr(left);
            for c in comparators {
                v.visit_expr(c);
            }
        }
        ExprKind::Call {
            func,
            args,
            keywords,
        } => {
            v.visit_expr(func);
            for arg in args {
                v.visit_expr(arg);
            }
            for kw in keywords {
                v.visit_expr(&kw.value);
            }
        }
        ExprKind::FormattedValue {
            value, format_spec, ..
        } => {
            v.visit_expr(value);
            if let Some(spec) = format_spec {
                v.visit_expr(spec);
            }
        }
        ExprKind::JoinedStr { values } => {
            for value in values {
                v.visit_expr(value);
            }
        }
        ExprKind::Attribute { value, .. } | ExprKind::Starred { value } => v.visit_expr(value),
        ExprKind::Subscript { value, slice } => {
            v.visit_expr(value);
            v.visit_expr(slice);
        }
        ExprKind::Slice { lower, upper, step } => {
            for part in [lower, upper, step].into_iter().flatten() {
                v.visit_expr(part);
            }
        }
        ExprKind::Constant { .. } | ExprKind::Name { .. } => {}
    }
}

pub fn walk_pattern<V: Visitor + ?Sized>(v: &mut V, pattern: &Pattern) {
    match &pattern.kind {
        PatternKind::MatchValue { value } => v.visit_expr(value),
        PatternKind::MatchSingleton { .. } | PatternKind::MatchStar { .. } => {}
        PatternKind::MatchSequence { patterns } | PatternKind::MatchOr { patterns } => {
            for p in patterns {
                v.visit_pattern(p);
            }
        }
        PatternKind::MatchMapping { keys, patterns, .. } => {
            for key in keys {
                v.visit_expr(key);
            }
            for p in patterns {
                v.visit_pattern(p);
            }
        }
        PatternKind::MatchClass {
            cls,
            patterns,
            kwd_patterns,
            ..
        } => {
            v.visit_expr(cls);
            for p in patterns.iter().chain(kwd_patterns) {
                v.visit_pattern(p);
            }
        }
        PatternKind::MatchAs { pattern, .. } => {
            if let Some(p) = pattern {
                v.visit_pattern(p);
            }
        }
    }
}

pub fn walk_parameters<V: Visitor + ?Sized>(v: &mut V, params: &Parameters) {
    for default in &params.defaults {
        v.visit_expr(default);
    }
    for default in params.kw_defaults.iter().flatten() {
        v.visit_expr(default);
    }
    for arg in params.all() {
        if let Some(annotation) = &arg.annotation {
            v.visit_expr(annotation);
        }
    }
}
