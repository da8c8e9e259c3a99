pub mod builder;
pub mod compiled;
pub mod compiler;
pub mod cpu;
pub mod eager;
pub mod error;
pub mod fusion;
pub mod graph;
pub mod harness;
pub mod ops;
pub mod tensor;
pub mod wgpu;

pub use error::{Error, Result};
