//! The operation surface numeric functions are written against.
//!
//! A [`Program`] is defined once, generically over [`Ops`], and can then be
//! evaluated eagerly ([`crate::eager::Eager`]) or captured into a graph
//! ([`crate::builder::Tracer`]) for compilation.

use crate::{
    error::{Error, Result},
    graph::{BinaryOp, UnaryOp},
    tensor::Tensor,
};

pub trait Ops {
    type Value: Clone;

    fn unary(&mut self, op: UnaryOp, x: &Self::Value) -> Result<Self::Value>;

    fn binary(
        &mut self,
        op: BinaryOp,
        left: &Self::Value,
        right: &Self::Value,
    ) -> Result<Self::Value>;

    fn full_like(&mut self, x: &Self::Value, value: f32) -> Result<Self::Value>;

    /// Brings a value back to the host.
    fn read(&mut self, x: &Self::Value) -> Result<Tensor>;

    fn neg(&mut self, x: &Self::Value) -> Result<Self::Value> {
        self.unary(UnaryOp::Neg, x)
    }

    fn exp(&mut self, x: &Self::Value) -> Result<Self::Value> {
        self.unary(UnaryOp::Exp, x)
    }

    fn sin(&mut self, x: &Self::Value) -> Result<Self::Value> {
        self.unary(UnaryOp::Sin, x)
    }

    fn sigmoid(&mut self, x: &Self::Value) -> Result<Self::Value> {
        self.unary(UnaryOp::Sigmoid, x)
    }

    fn add(&mut self, left: &Self::Value, right: &Self::Value) -> Result<Self::Value> {
        self.binary(BinaryOp::Add, left, right)
    }

    fn sub(&mut self, left: &Self::Value, right: &Self::Value) -> Result<Self::Value> {
        self.binary(BinaryOp::Sub, left, right)
    }

    fn mul(&mut self, left: &Self::Value, right: &Self::Value) -> Result<Self::Value> {
        self.binary(BinaryOp::Mul, left, right)
    }

    fn zeros_like(&mut self, x: &Self::Value) -> Result<Self::Value> {
        self.full_like(x, 0.0)
    }
}

/// A pure function from tensors of one layout to one tensor.
pub trait Program {
    fn name(&self) -> &str;

    /// Number of tensors `call` expects.
    fn inputs(&self) -> usize {
        1
    }

    fn call<O: Ops>(&self, ops: &mut O, inputs: &[O::Value]) -> Result<O::Value>;
}

/// Checks that `program` got exactly `N` inputs.
pub fn operands<'a, T, const N: usize>(
    program: &impl Program,
    inputs: &'a [T],
) -> Result<&'a [T; N]> {
    inputs.try_into().map_err(|_| {
        Error::Shape(format!(
            "{} takes {N} inputs, got {}",
            program.name(),
            inputs.len()
        ))
    })
}

/// `x + sigmoid(x)`, optionally materialising a `zeros_like(x)` that is
/// never used.
#[derive(Debug, Clone, Copy)]
pub struct SigmoidResidual {
    pub materialize_zeros: bool,
}

impl Default for SigmoidResidual {
    fn default() -> Self {
        Self {
            materialize_zeros: true,
        }
    }
}

impl Program for SigmoidResidual {
    fn name(&self) -> &str {
        "sigmoid_residual"
    }

    fn call<O: Ops>(&self, ops: &mut O, inputs: &[O::Value]) -> Result<O::Value> {
        let [x] = operands(self, inputs)?;
        let inter = ops.sigmoid(x)?;

        if self.materialize_zeros {
            let _zeros = ops.zeros_like(x)?;
        }

        ops.add(x, &inter)
    }
}

/// `(a + b) + (c + d)`. The two inner sums are internal tensors of the graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairwiseSum;

impl Program for PairwiseSum {
    fn name(&self) -> &str {
        "pairwise_sum"
    }

    fn inputs(&self) -> usize {
        4
    }

    fn call<O: Ops>(&self, ops: &mut O, inputs: &[O::Value]) -> Result<O::Value> {
        let [a, b, c, d] = operands(self, inputs)?;

        let left = ops.add(a, b)?;
        let right = ops.add(c, d)?;

        ops.add(&left, &right)
    }
}
