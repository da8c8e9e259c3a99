use crate::{
    compiler::Runner,
    error::{Error, Result},
    fusion::Fusion,
    graph::{BinaryOp, Graph, Op, UnaryOp},
    ops::{Ops, Program},
    tensor::Tensor,
};

/// Executes every operation as soon as it is requested, one dispatch per op.
/// Each result is materialised in its dtype before the next op sees it.
pub struct Eager<'r, R: Runner> {
    runner: &'r mut R,
}

impl<'r, R: Runner> Eager<'r, R> {
    pub fn new(runner: &'r mut R) -> Self {
        Self { runner }
    }

    fn dispatch(&mut self, op: Op, operands: &[&Tensor]) -> Result<Tensor> {
        let mut graph = Graph::new();

        let children = operands
            .iter()
            .map(|operand| graph.add_input(operand.layout().clone()))
            .collect::<Vec<_>>();
        let output = graph.add_op(op, &children)?;
        graph.add_output(output)?;

        log::trace!("eager {op:?} on {}", self.runner.name());

        let inputs = operands
            .iter()
            .map(|&operand| operand.clone())
            .collect::<Vec<_>>();

        self.runner
            .execute(&graph, Fusion::None, &inputs)?
            .pop()
            .ok_or_else(|| Error::RuntimeCompute(format!("{op:?} produced no output")))
    }
}

impl<R: Runner> Ops for Eager<'_, R> {
    type Value = Tensor;

    fn unary(&mut self, op: UnaryOp, x: &Tensor) -> Result<Tensor> {
        self.dispatch(Op::Unary(op), &[x])
    }

    fn binary(&mut self, op: BinaryOp, left: &Tensor, right: &Tensor) -> Result<Tensor> {
        self.dispatch(Op::Binary(op), &[left, right])
    }

    fn full_like(&mut self, x: &Tensor, value: f32) -> Result<Tensor> {
        self.dispatch(Op::Fill(value), &[x])
    }

    fn read(&mut self, x: &Tensor) -> Result<Tensor> {
        Ok(x.clone())
    }
}

pub fn evaluate<R: Runner, P: Program>(
    runner: &mut R,
    program: &P,
    inputs: &[Tensor],
) -> Result<Tensor> {
    log::debug!("evaluating {} eagerly on {}", program.name(), runner.name());

    program.call(&mut Eager::new(runner), inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu::runner::CpuRunner,
        ops::{PairwiseSum, SigmoidResidual},
        tensor::{DType, Layout},
    };

    #[test]
    fn rounds_after_every_op() {
        let mut runner = CpuRunner::new();
        let layout = Layout::new([3], DType::BF16);
        let input = Tensor::from_vec(layout, vec![0.3, -1.7, 2.9]).unwrap();

        let program = SigmoidResidual::default();
        let output = evaluate(&mut runner, &program, &[input.clone()]).unwrap();

        let expected = input
            .data()
            .iter()
            .map(|&x| {
                let sigmoid = DType::BF16.round(1.0 / (1.0 + (-x).exp()));
                DType::BF16.round(x + sigmoid)
            })
            .collect::<Vec<_>>();

        assert_eq!(output.data(), expected.as_slice());
    }

    #[test]
    fn rounds_inner_sums() {
        let mut runner = CpuRunner::new();
        let layout = Layout::new([1], DType::F16);

        // 2048 + 1 is not representable in float16 and rounds to even.
        let inputs = [2048.0, 1.0, 0.0, 1.0]
            .map(|value| Tensor::full(layout.clone(), value))
            .to_vec();

        let output = evaluate(&mut runner, &PairwiseSum, &inputs).unwrap();

        assert_eq!(output.data(), &[2048.0]);
    }

    #[test]
    fn mismatched_operands_fail() {
        let mut runner = CpuRunner::new();
        let mut eager = Eager::new(&mut runner);

        let a = Tensor::zeros(Layout::new([2], DType::F32));
        let b = Tensor::zeros(Layout::new([3], DType::F32));

        assert!(matches!(eager.add(&a, &b), Err(Error::Shape(_))));
    }
}
