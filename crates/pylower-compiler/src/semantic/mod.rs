//! Scope resolution: classifies every name of every scope before lowering.

pub mod resolver;
pub mod table;

pub use resolver::Resolver;
pub use table::{NodeKey, ScopeRole, Symbol, SymbolFlags, SymbolScope, SymbolTable};

use pylower_common::LoweringOptions;

use crate::ast::Module;
use crate::error::CompileResult;

/// Resolve all scopes of `module`.
pub fn analyze(module: &Module, options: &LoweringOptions) -> CompileResult<SymbolTable> {
    Resolver::new(options.inline_comprehensions, options.max_recursion_depth).resolve(module)
}
