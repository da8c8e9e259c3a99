use crate::{
    error::{Error, Result},
    graph::{BinaryOp, ExprId, Graph, Op, UnaryOp},
    ops::{Ops, Program},
    tensor::{Layout, Tensor},
};

/// Records every operation into a [`Graph`] instead of running it.
#[derive(Default)]
pub struct Tracer {
    graph: Graph,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(&mut self, layout: Layout) -> ExprId {
        self.graph.add_input(layout)
    }

    pub fn finish(mut self, outputs: &[ExprId]) -> Result<Graph> {
        for &output in outputs {
            self.graph.add_output(output)?;
        }

        Ok(self.graph)
    }
}

impl Ops for Tracer {
    type Value = ExprId;

    fn unary(&mut self, op: UnaryOp, x: &ExprId) -> Result<ExprId> {
        self.graph.add_op(Op::Unary(op), &[*x])
    }

    fn binary(&mut self, op: BinaryOp, left: &ExprId, right: &ExprId) -> Result<ExprId> {
        self.graph.add_op(Op::Binary(op), &[*left, *right])
    }

    fn full_like(&mut self, x: &ExprId, value: f32) -> Result<ExprId> {
        self.graph.add_op(Op::Fill(value), &[*x])
    }

    fn read(&mut self, x: &ExprId) -> Result<Tensor> {
        Err(Error::GraphCapture(format!(
            "reading {x:?} back to the host breaks the graph"
        )))
    }
}

/// Captures `program` specialised to the given input layouts.
pub fn trace<P: Program>(program: &P, layouts: &[Layout]) -> Result<Graph> {
    let mut tracer = Tracer::new();

    let inputs = layouts
        .iter()
        .map(|layout| tracer.input(layout.clone()))
        .collect::<Vec<_>>();
    let output = program.call(&mut tracer, &inputs)?;

    tracer.finish(&[output])
}
