//! Lowering of a Python-like AST into code units for a stack machine.
//!
//! The pipeline is two passes over a [`ast::Module`]: [`semantic::analyze`]
//! classifies every name of every scope, then [`codegen::Compiler`] walks the
//! tree again and emits one [`CodeUnit`] per module, function, class body,
//! lambda, comprehension and annotation scope.

pub mod ast;
pub mod codegen;
pub mod error;
pub mod semantic;

pub use codegen::{verify_unit, Compiler, StackError};
pub use error::{CompileError, CompileErrorKind, CompileResult, ErrorCategory};
pub use pylower_common::{CodeUnit, LoweringOptions};

use semantic::SymbolTable;

/// File name recorded in units lowered without one.
pub const DEFAULT_FILENAME: &str = "<string>";

/// Resolve scopes and lower `module`.
pub fn compile(module: &ast::Module, options: &LoweringOptions) -> CompileResult<CodeUnit> {
    let table = semantic::analyze(module, options)?;
    compile_with_symbols(module, &table, options)
}

/// Lower `module` against an already computed symbol table.
pub fn compile_with_symbols(
    module: &ast::Module,
    table: &SymbolTable,
    options: &LoweringOptions,
) -> CompileResult<CodeUnit> {
    Compiler::new(table, options, DEFAULT_FILENAME)?.compile_module(module)
}

/// Read a module from its JSON form.
pub fn parse_module(json: &str) -> Result<ast::Module, serde_json::Error> {
    serde_json::from_str(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use pylower_common::Opcode;

    #[test]
    fn compile_runs_both_passes() {
        let module = module(vec![assign(name("x"), int(1))]);
        let unit = compile(&module, &LoweringOptions::default()).unwrap();
        assert_eq!(unit.filename, DEFAULT_FILENAME);
        assert_eq!(unit.names, ["x"]);
        assert_eq!(
            unit.opcodes(),
            [Opcode::LoadConst, Opcode::StoreName, Opcode::LoadConst, Opcode::ReturnValue]
        );
    }

    #[test]
    fn module_round_trips_through_json() {
        let module = module(vec![expr_stmt(call(name("print"), vec![str_("hi")]))]);
        let json = serde_json::to_string(&module).unwrap();
        assert_eq!(parse_module(&json).unwrap(), module);
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(parse_module("{\"body\": 3}").is_err());
    }
}
