pub mod operators;
pub mod plan;

pub use plan::{Assignment, Expr, ReadLock, Select};
