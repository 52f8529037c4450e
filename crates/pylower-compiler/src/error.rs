use pylower_common::ir::Label;
use pylower_common::{Diagnostic, Span};

pub type CompileResult<T> = Result<T, CompileError>;

/// Broad classification of lowering failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The input program violates a structural or semantic rule.
    Compile,
    /// A limit was exhausted (nesting depth, buffer growth).
    Resource,
    /// The engine broke one of its own invariants.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileErrorKind {
    // === Control flow ===
    #[error("'break' outside loop")]
    BreakOutsideLoop,
    #[error("'continue' outside loop")]
    ContinueOutsideLoop,
    #[error("'return' outside function")]
    ReturnOutsideFunction,
    #[error("'return' with value in async generator")]
    ReturnValueInAsyncGenerator,
    #[error("'yield' outside function")]
    YieldOutsideFunction,
    #[error("'yield' inside {0}")]
    YieldInComprehension(&'static str),
    #[error("'yield from' inside async function")]
    YieldFromInAsyncFunction,
    #[error("'await' outside function")]
    AwaitOutsideFunction,
    #[error("'await' outside async function")]
    AwaitOutsideAsyncFunction,
    #[error("{0} outside async function")]
    AsyncOutsideAsyncFunction(&'static str),
    #[error("asynchronous comprehension outside of an asynchronous function")]
    AsyncComprehensionOutsideAsyncFunction,
    #[error("'break', 'continue' and 'return' cannot appear in an except* block")]
    ControlFlowInExceptStar,
    #[error("default 'except:' must be last")]
    DefaultExceptNotLast,
    #[error("except* handler requires an exception type")]
    ExceptStarWithoutType,

    // === Pattern matching ===
    #[error("multiple assignments to name '{0}' in pattern")]
    MultipleAssignmentsInPattern(String),
    #[error("alternative patterns bind different names")]
    AlternativesBindDifferentNames,
    #[error("name capture '{0}' makes remaining patterns unreachable")]
    NameCaptureUnreachable(String),
    #[error("wildcard makes remaining patterns unreachable")]
    WildcardUnreachable,
    #[error("multiple starred names in sequence pattern")]
    MultipleStarredInPattern,
    #[error("attribute name repeated in class pattern: {0}")]
    RepeatedClassPatternAttribute(String),
    #[error("kwd_attrs ({0}) / kwd_patterns ({1}) length mismatch in class pattern")]
    ClassPatternLengthMismatch(usize, usize),
    #[error("keys ({0}) / patterns ({1}) length mismatch in mapping pattern")]
    MappingPatternLengthMismatch(usize, usize),
    #[error("mapping pattern keys may only match literals and attribute lookups")]
    MappingKeyNotLiteral,
    #[error("mapping pattern checks duplicate key ({0})")]
    DuplicateMappingKey(String),
    #[error("patterns may only match literals and attribute lookups")]
    PatternValueNotLiteral,

    // === Calls, definitions, targets ===
    #[error("keyword argument repeated: {0}")]
    RepeatedKeywordArgument(String),
    #[error("duplicate argument '{0}' in function definition")]
    DuplicateArgument(String),
    #[error("non-default type parameter '{0}' follows default type parameter")]
    NonDefaultTypeParamAfterDefault(String),
    #[error("multiple starred expressions in assignment")]
    MultipleStarredTargets,
    #[error("too many expressions in star-unpacking assignment")]
    TooManyStarUnpackTargets,
    #[error("starred assignment target must be in a list or tuple")]
    StarredTargetNotInSequence,
    #[error("can't use starred expression here")]
    StarredNotAllowed,
    #[error("cannot assign to {0}")]
    InvalidAssignTarget(&'static str),
    #[error("cannot delete {0}")]
    InvalidDeleteTarget(&'static str),
    #[error("cannot assign to __debug__")]
    AssignToDebug,
    #[error("'import *' only allowed at module level")]
    ImportStarNotAtModuleLevel,
    #[error("eval input must be a single expression")]
    EvalNotExpression,

    // === Scope resolution ===
    #[error("name '{0}' is used prior to global declaration")]
    UsedPriorToGlobal(String),
    #[error("name '{0}' is used prior to nonlocal declaration")]
    UsedPriorToNonlocal(String),
    #[error("name '{0}' is parameter and global")]
    ParameterAndGlobal(String),
    #[error("name '{0}' is parameter and nonlocal")]
    ParameterAndNonlocal(String),
    #[error("name '{0}' is nonlocal and global")]
    NonlocalAndGlobal(String),
    #[error("no binding for nonlocal '{0}' found")]
    NonlocalWithoutBinding(String),
    #[error("nonlocal declaration not allowed at module level")]
    NonlocalAtModuleLevel,
    #[error("assignment expression within a comprehension cannot be used in a class body")]
    NamedExprInClassComprehension,
    #[error("assignment expression cannot rebind comprehension iteration variable '{0}'")]
    NamedExprRebindsIterationVariable(String),

    // === Resources ===
    #[error("too deeply nested: maximum lowering depth of {0} exceeded")]
    TooDeeplyNested(usize),
    #[error("too many statically nested blocks")]
    TooManyNestedBlocks,
    #[error("out of memory while growing the {0}")]
    AllocationFailed(&'static str),

    // === Internal consistency ===
    #[error("internal error: label {0} placed twice")]
    LabelPlacedTwice(Label),
    #[error("internal error: label {0} is jumped to but never placed")]
    UnplacedLabel(Label),
    #[error("internal error: unknown label {0}")]
    UnknownLabel(Label),
    #[error("internal error: frame block mismatch, expected {expected} but found {found}")]
    FrameBlockMismatch { expected: String, found: String },
    #[error("internal error: {0} frame block(s) still active at end of unit")]
    FrameBlockLeak(usize),
    #[error("internal error: no symbol table for {0}")]
    MissingSymbolTable(String),
    #[error("internal error: scope stack underflow")]
    ScopeUnderflow,
    #[error("internal error: '{0}' is neither a cell nor a free variable")]
    UnresolvedDeref(String),
    #[error("internal error: {0}")]
    StackCheck(String),
}

impl CompileErrorKind {
    pub fn category(&self) -> ErrorCategory {
        use CompileErrorKind::*;
        match self {
            TooDeeplyNested(_) | TooManyNestedBlocks | AllocationFailed(_) => {
                ErrorCategory::Resource
            }
            LabelPlacedTwice(_)
            | UnplacedLabel(_)
            | UnknownLabel(_)
            | FrameBlockMismatch { .. }
            | FrameBlockLeak(_)
            | MissingSymbolTable(_)
            | ScopeUnderflow
            | UnresolvedDeref(_)
            | StackCheck(_) => ErrorCategory::Internal,
            _ => ErrorCategory::Compile,
        }
    }
}

/// A fatal lowering error with the location of the offending node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub span: Option<Span>,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, span: Option<Span>) -> Self {
        Self { kind, span }
    }

    pub fn at(kind: CompileErrorKind, span: Span) -> Self {
        Self {
            kind,
            span: Some(span),
        }
    }

    pub fn internal(kind: CompileErrorKind) -> Self {
        Self { kind, span: None }
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn is_resource(&self) -> bool {
        self.category() == ErrorCategory::Resource
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let mut diag = Diagnostic::error(self.kind.to_string());
        if let Some(span) = self.span {
            diag = diag.with_span(span);
        }
        match &self.kind {
            CompileErrorKind::TooDeeplyNested(_) => {
                diag.with_suggestion("raise `max_recursion_depth` in pylower.toml or pass --max-depth")
            }
            CompileErrorKind::AlternativesBindDifferentNames => {
                diag.with_suggestion("every alternative of an or-pattern must capture the same names")
            }
            _ => diag,
        }
    }
}
