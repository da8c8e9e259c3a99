pub mod compiler;
pub mod expr;
pub mod kernel;
pub mod runner;
