use std::collections::HashMap;

use pylower_common::ir::UnitKind;
use pylower_common::Span;

/// Resolved storage class of a name within one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolScope {
    /// Bound here and only used here.
    Local,
    /// Bound here and captured by a nested scope.
    Cell,
    /// Bound in an enclosing function-like scope.
    Free,
    /// Declared `global` in this scope.
    GlobalExplicit,
    /// Never bound in any enclosing function-like scope.
    GlobalImplicit,
}

/// What the first pass saw happen to a name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymbolFlags {
    pub assigned: bool,
    pub referenced: bool,
    pub parameter: bool,
    pub imported: bool,
    pub annotated: bool,
    pub global: bool,
    pub nonlocal: bool,
    /// Target of a comprehension `for` clause.
    pub iteration: bool,
    /// Bound in this class body and also passed through to nested scopes as a free variable.
    pub free_class: bool,
}

impl SymbolFlags {
    pub fn is_bound(&self) -> bool {
        self.assigned || self.parameter || self.imported
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub flags: SymbolFlags,
    /// First place the name was seen, or its declaration for `global`/`nonlocal`.
    pub span: Span,
}

/// Which scope a node opens. One definition can open two scopes (the
/// annotation scope for its type parameters and its own body).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeRole {
    Body,
    TypeParams,
    AliasValue,
}

/// Identity of the AST node that opened a scope. Lowering re-lowers some
/// statement lists more than once (inlined `finally` bodies), so nested
/// tables are found by node identity rather than by visit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey {
    addr: usize,
    role: ScopeRole,
}

impl NodeKey {
    pub fn of<T>(node: &T, role: ScopeRole) -> Self {
        Self {
            addr: node as *const T as usize,
            role,
        }
    }
}

/// Resolution result for one scope, with nested scopes as children.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    pub name: String,
    pub kind: UnitKind,
    pub line: u32,
    /// Symbols in first-seen order.
    pub symbols: Vec<Symbol>,
    /// Parameter names in slot order.
    pub params: Vec<String>,
    pub children: Vec<SymbolTable>,
    pub is_generator: bool,
    pub is_coroutine: bool,
    /// Comprehension lowered directly into its parent's instruction stream.
    pub inlined: bool,
    /// Class body whose methods reference `__class__` (directly or through `super`).
    pub needs_class_closure: bool,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) child_index: HashMap<NodeKey, usize>,
}

impl SymbolTable {
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.index.get(name).map(|&i| &self.symbols[i])
    }

    pub fn scope_of(&self, name: &str) -> Option<SymbolScope> {
        self.lookup(name).map(|s| s.scope)
    }

    pub fn child(&self, key: NodeKey) -> Option<&SymbolTable> {
        self.child_index.get(&key).map(|&i| &self.children[i])
    }

    /// Names in the given scope, sorted so side tables are deterministic.
    pub fn names_with_scope(&self, scope: SymbolScope) -> Vec<String> {
        let mut names: Vec<String> = self
            .symbols
            .iter()
            .filter(|s| s.scope == scope)
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Names passed in from the enclosing scope: free variables plus class
    /// locals that are also forwarded to methods.
    pub fn free_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .symbols
            .iter()
            .filter(|s| s.scope == SymbolScope::Free || s.flags.free_class)
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Fast-slot names: parameters first, then other locals in first-seen order.
    pub fn local_slots(&self) -> Vec<String> {
        let mut slots = self.params.clone();
        for sym in &self.symbols {
            if sym.scope == SymbolScope::Local && !slots.contains(&sym.name) {
                slots.push(sym.name.clone());
            }
        }
        slots
    }

    /// Locals a comprehension binds for itself (not the hidden iterator argument).
    pub fn comprehension_locals(&self) -> Vec<String> {
        self.symbols
            .iter()
            .filter(|s| s.scope == SymbolScope::Local && s.flags.is_bound() && s.name != ".0")
            .map(|s| s.name.clone())
            .collect()
    }

    /// Depth-first search for the first table with the given name.
    pub fn find(&self, name: &str) -> Option<&SymbolTable> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }
}
