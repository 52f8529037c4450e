//! Terse constructors for hand-written ASTs.
//!
//! Every node gets line 1 unless repositioned with [`At::at`].

use pylower_common::Span;

use super::nodes::*;

fn sp() -> Span {
    Span::lines(1, 0, 1, 1)
}

/// Reposition a node onto a given line.
pub trait At {
    fn at(self, line: u32) -> Self;
}

impl At for Stmt {
    fn at(mut self, line: u32) -> Self {
        self.span = Span::lines(line, 0, line, 1);
        self
    }
}

impl At for Expr {
    fn at(mut self, line: u32) -> Self {
        self.span = Span::lines(line, 0, line, 1);
        self
    }
}

impl At for Pattern {
    fn at(mut self, line: u32) -> Self {
        self.span = Span::lines(line, 0, line, 1);
        self
    }
}

pub fn module(body: Vec<Stmt>) -> Module {
    Module {
        body,
        kind: ModuleKind::Exec,
    }
}

// === Statements ===

pub fn stmt(kind: StmtKind) -> Stmt {
    Stmt::new(kind, sp())
}

pub fn expr_stmt(value: Expr) -> Stmt {
    stmt(StmtKind::Expr { value })
}

pub fn assign(target: Expr, value: Expr) -> Stmt {
    stmt(StmtKind::Assign {
        targets: vec![target],
        value,
    })
}

pub fn aug_assign(target: Expr, op: Operator, value: Expr) -> Stmt {
    stmt(StmtKind::AugAssign { target, op, value })
}

pub fn ret(value: Option<Expr>) -> Stmt {
    stmt(StmtKind::Return { value })
}

pub fn pass() -> Stmt {
    stmt(StmtKind::Pass)
}

pub fn break_() -> Stmt {
    stmt(StmtKind::Break)
}

pub fn continue_() -> Stmt {
    stmt(StmtKind::Continue)
}

pub fn if_(test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::If { test, body, orelse })
}

pub fn while_(test: Expr, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::While {
        test,
        body,
        orelse: Vec::new(),
    })
}

pub fn for_(target: Expr, iter: Expr, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::For {
        is_async: false,
        target,
        iter,
        body,
        orelse: Vec::new(),
    })
}

pub fn async_for(target: Expr, iter: Expr, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::For {
        is_async: true,
        target,
        iter,
        body,
        orelse: Vec::new(),
    })
}

pub fn with_(ctx: Expr, target: Option<Expr>, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::With {
        is_async: false,
        items: vec![WithItem {
            context_expr: ctx,
            optional_vars: target,
        }],
        body,
    })
}

pub fn async_with(ctx: Expr, target: Option<Expr>, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::With {
        is_async: true,
        items: vec![WithItem {
            context_expr: ctx,
            optional_vars: target,
        }],
        body,
    })
}

pub fn try_(
    body: Vec<Stmt>,
    handlers: Vec<ExceptHandler>,
    orelse: Vec<Stmt>,
    finalbody: Vec<Stmt>,
) -> Stmt {
    stmt(StmtKind::Try {
        body,
        handlers,
        orelse,
        finalbody,
        is_star: false,
    })
}

pub fn try_star(body: Vec<Stmt>, handlers: Vec<ExceptHandler>) -> Stmt {
    stmt(StmtKind::Try {
        body,
        handlers,
        orelse: Vec::new(),
        finalbody: Vec::new(),
        is_star: true,
    })
}

pub fn handler(type_: Option<Expr>, name: Option<&str>, body: Vec<Stmt>) -> ExceptHandler {
    ExceptHandler {
        type_,
        name: name.map(str::to_string),
        body,
        span: sp(),
    }
}

pub fn raise(exc: Option<Expr>) -> Stmt {
    stmt(StmtKind::Raise { exc, cause: None })
}

pub fn match_(subject: Expr, cases: Vec<MatchCase>) -> Stmt {
    stmt(StmtKind::Match { subject, cases })
}

pub fn case(pattern: Pattern, guard: Option<Expr>, body: Vec<Stmt>) -> MatchCase {
    MatchCase {
        pattern,
        guard,
        body,
    }
}

pub fn def(name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::FunctionDef(Box::new(FunctionDef {
        name: name.to_string(),
        args: params_of(params),
        body,
        decorator_list: Vec::new(),
        returns: None,
        type_params: Vec::new(),
        is_async: false,
    })))
}

pub fn async_def(name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
    let mut s = def(name, params, body);
    if let StmtKind::FunctionDef(f) = &mut s.kind {
        f.is_async = true;
    }
    s
}

pub fn class(name: &str, bases: Vec<Expr>, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::ClassDef(Box::new(ClassDef {
        name: name.to_string(),
        bases,
        keywords: Vec::new(),
        body,
        decorator_list: Vec::new(),
        type_params: Vec::new(),
    })))
}

pub fn global(names: &[&str]) -> Stmt {
    stmt(StmtKind::Global {
        names: names.iter().map(|n| n.to_string()).collect(),
    })
}

pub fn nonlocal(names: &[&str]) -> Stmt {
    stmt(StmtKind::Nonlocal {
        names: names.iter().map(|n| n.to_string()).collect(),
    })
}

pub fn import(name: &str, asname: Option<&str>) -> Stmt {
    stmt(StmtKind::Import {
        names: vec![alias(name, asname)],
    })
}

pub fn import_from(module: &str, names: &[&str]) -> Stmt {
    stmt(StmtKind::ImportFrom {
        module: Some(module.to_string()),
        names: names.iter().map(|n| alias(n, None)).collect(),
        level: 0,
    })
}

pub fn alias(name: &str, asname: Option<&str>) -> Alias {
    Alias {
        name: name.to_string(),
        asname: asname.map(str::to_string),
        span: sp(),
    }
}

pub fn arg(name: &str) -> Arg {
    Arg {
        arg: name.to_string(),
        annotation: None,
        span: sp(),
    }
}

pub fn params_of(names: &[&str]) -> Parameters {
    Parameters {
        args: names.iter().map(|n| arg(n)).collect(),
        ..Parameters::default()
    }
}

pub fn type_var(name: &str, default_value: Option<Expr>) -> TypeParam {
    TypeParam {
        kind: TypeParamKind::TypeVar {
            name: name.to_string(),
            bound: None,
            default_value: default_value.map(Box::new),
        },
        span: sp(),
    }
}

// === Expressions ===

pub fn expr(kind: ExprKind) -> Expr {
    Expr::new(kind, sp())
}

pub fn name(id: &str) -> Expr {
    expr(ExprKind::Name { id: id.to_string() })
}

pub fn constant(value: Constant) -> Expr {
    expr(ExprKind::Constant { value })
}

pub fn int(v: i64) -> Expr {
    constant(Constant::Int(v))
}

pub fn str_(s: &str) -> Expr {
    constant(Constant::Str(s.to_string()))
}

pub fn none() -> Expr {
    constant(Constant::None)
}

pub fn bool_(b: bool) -> Expr {
    constant(Constant::Bool(b))
}

pub fn call(func: Expr, args: Vec<Expr>) -> Expr {
    expr(ExprKind::Call {
        func: Box::new(func),
        args,
        keywords: Vec::new(),
    })
}

pub fn call_kw(func: Expr, args: Vec<Expr>, keywords: Vec<(Option<&str>, Expr)>) -> Expr {
    expr(ExprKind::Call {
        func: Box::new(func),
        args,
        keywords: keywords
            .into_iter()
            .map(|(arg, value)| Keyword {
                arg: arg.map(str::to_string),
                value,
                span: sp(),
            })
            .collect(),
    })
}

pub fn attr(value: Expr, attr: &str) -> Expr {
    expr(ExprKind::Attribute {
        value: Box::new(value),
        attr: attr.to_string(),
    })
}

pub fn subscript(value: Expr, slice: Expr) -> Expr {
    expr(ExprKind::Subscript {
        value: Box::new(value),
        slice: Box::new(slice),
    })
}

pub fn binop(left: Expr, op: Operator, right: Expr) -> Expr {
    expr(ExprKind::BinOp {
        left: Box::new(left),
        op,
        right: Box::new(right),
    })
}

pub fn unary(op: UnaryOperator, operand: Expr) -> Expr {
    expr(ExprKind::UnaryOp {
        op,
        operand: Box::new(operand),
    })
}

pub fn boolop(op: BoolOperator, values: Vec<Expr>) -> Expr {
    expr(ExprKind::BoolOp { op, values })
}

pub fn compare(left: Expr, ops: Vec<CmpOperator>, comparators: Vec<Expr>) -> Expr {
    expr(ExprKind::Compare {
        left: Box::new(left),
        ops,
        comparators,
    })
}

pub fn tuple(elts: Vec<Expr>) -> Expr {
    expr(ExprKind::Tuple { elts })
}

pub fn list(elts: Vec<Expr>) -> Expr {
    expr(ExprKind::List { elts })
}

pub fn set(elts: Vec<Expr>) -> Expr {
    expr(ExprKind::Set { elts })
}

pub fn dict(items: Vec<(Option<Expr>, Expr)>) -> Expr {
    let (keys, values) = items.into_iter().unzip();
    expr(ExprKind::Dict { keys, values })
}

pub fn starred(value: Expr) -> Expr {
    expr(ExprKind::Starred {
        value: Box::new(value),
    })
}

pub fn lambda(params: &[&str], body: Expr) -> Expr {
    expr(ExprKind::Lambda {
        args: Box::new(params_of(params)),
        body: Box::new(body),
    })
}

pub fn await_(value: Expr) -> Expr {
    expr(ExprKind::Await {
        value: Box::new(value),
    })
}

pub fn yield_(value: Option<Expr>) -> Expr {
    expr(ExprKind::Yield {
        value: value.map(Box::new),
    })
}

pub fn named(target: &str, value: Expr) -> Expr {
    expr(ExprKind::NamedExpr {
        target: Box::new(name(target)),
        value: Box::new(value),
    })
}

pub fn comp_for(target: Expr, iter: Expr, ifs: Vec<Expr>) -> Comprehension {
    Comprehension {
        target,
        iter,
        ifs,
        is_async: false,
    }
}

pub fn list_comp(elt: Expr, generators: Vec<Comprehension>) -> Expr {
    expr(ExprKind::ListComp {
        elt: Box::new(elt),
        generators,
    })
}

pub fn set_comp(elt: Expr, generators: Vec<Comprehension>) -> Expr {
    expr(ExprKind::SetComp {
        elt: Box::new(elt),
        generators,
    })
}

pub fn dict_comp(key: Expr, value: Expr, generators: Vec<Comprehension>) -> Expr {
    expr(ExprKind::DictComp {
        key: Box::new(key),
        value: Box::new(value),
        generators,
    })
}

pub fn genexp(elt: Expr, generators: Vec<Comprehension>) -> Expr {
    expr(ExprKind::GeneratorExp {
        elt: Box::new(elt),
        generators,
    })
}

// === Patterns ===

pub fn pattern(kind: PatternKind) -> Pattern {
    Pattern::new(kind, sp())
}

/// `_`
pub fn p_wild() -> Pattern {
    pattern(PatternKind::MatchAs {
        pattern: None,
        name: None,
    })
}

/// A bare capture: `case x:`
pub fn p_name(n: &str) -> Pattern {
    pattern(PatternKind::MatchAs {
        pattern: None,
        name: Some(n.to_string()),
    })
}

/// `case <p> as n:`
pub fn p_as(p: Pattern, n: &str) -> Pattern {
    pattern(PatternKind::MatchAs {
        pattern: Some(Box::new(p)),
        name: Some(n.to_string()),
    })
}

pub fn p_value(value: Expr) -> Pattern {
    pattern(PatternKind::MatchValue {
        value: Box::new(value),
    })
}

pub fn p_singleton(value: Constant) -> Pattern {
    pattern(PatternKind::MatchSingleton { value })
}

pub fn p_seq(patterns: Vec<Pattern>) -> Pattern {
    pattern(PatternKind::MatchSequence { patterns })
}

pub fn p_star(n: Option<&str>) -> Pattern {
    pattern(PatternKind::MatchStar {
        name: n.map(str::to_string),
    })
}

pub fn p_or(patterns: Vec<Pattern>) -> Pattern {
    pattern(PatternKind::MatchOr { patterns })
}

pub fn p_mapping(keys: Vec<Expr>, patterns: Vec<Pattern>, rest: Option<&str>) -> Pattern {
    pattern(PatternKind::MatchMapping {
        keys,
        patterns,
        rest: rest.map(str::to_string),
    })
}

pub fn p_class(cls: Expr, patterns: Vec<Pattern>, kwds: Vec<(&str, Pattern)>) -> Pattern {
    let (kwd_attrs, kwd_patterns) = kwds
        .into_iter()
        .map(|(k, p)| (k.to_string(), p))
        .unzip();
    pattern(PatternKind::MatchClass {
        cls: Box::new(cls),
        patterns,
        kwd_attrs,
        kwd_patterns,
    })
}
