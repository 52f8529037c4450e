pub mod build;
pub mod nodes;
pub mod visitor;

pub use nodes::*;
pub use visitor::Visitor;
