mod call;
mod comprehension;
pub mod compiler;
mod constant_pool;
mod definitions;
mod exceptions;
mod expr;
mod fblock;
mod instr_seq;
mod pattern;
pub mod stack_check;
mod stmt;

pub use compiler::{Compiler, NameCtx};
pub use stack_check::{verify_unit, StackError};
