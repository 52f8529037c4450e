pub mod config;
pub mod errors;
pub mod ir;
pub mod ir_opcodes;
pub mod span;

pub use config::LoweringOptions;
pub use errors::{Diagnostic, DiagnosticBag, Severity};
pub use ir::{CodeUnit, Constant, Instruction, Label, Operand};
pub use ir_opcodes::Opcode;
pub use span::{Position, Span};
