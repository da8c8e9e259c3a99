//! Lowering of a [`Graph`] into a list of elementwise kernel launches.
//!
//! Every backend consumes the same schedule: a kernel computes one graph
//! expression for every element of its output, reading whole input buffers
//! and rounding to the output dtype once, right before the store. How much of
//! the graph a single kernel covers is decided by [`Fusion`].

use std::collections::BTreeSet;

use crate::{
    error::{Error, Result},
    graph::{BinaryOp, ExprBody, ExprId, Graph, Op, UnaryOp},
    tensor::{Layout, Tensor},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Fusion {
    /// Inline the whole function into one kernel per output.
    #[default]
    Whole,
    /// One kernel per operation, every intermediate materialised.
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum KernelExpr {
    Input(ExprId),
    Fill(f32),
    Unary(UnaryOp, Box<KernelExpr>),
    Binary(BinaryOp, Box<KernelExpr>, Box<KernelExpr>),
}

impl KernelExpr {
    pub(crate) fn eval(&self, load: &impl Fn(ExprId) -> f32) -> f32 {
        match self {
            KernelExpr::Input(id) => load(*id),
            KernelExpr::Fill(value) => *value,
            KernelExpr::Unary(op, child) => op.apply(child.eval(load)),
            KernelExpr::Binary(op, left, right) => op.apply(left.eval(load), right.eval(load)),
        }
    }

    fn collect_inputs(&self, inputs: &mut BTreeSet<ExprId>) {
        match self {
            KernelExpr::Input(id) => {
                inputs.insert(*id);
            }
            KernelExpr::Fill(_) => {}
            KernelExpr::Unary(_, child) => child.collect_inputs(inputs),
            KernelExpr::Binary(_, left, right) => {
                left.collect_inputs(inputs);
                right.collect_inputs(inputs);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Kernel {
    pub(crate) output: ExprId,
    pub(crate) layout: Layout,
    /// Buffers read by `expr`, in ascending order.
    pub(crate) inputs: Vec<ExprId>,
    pub(crate) expr: KernelExpr,
}

impl Kernel {
    fn new(output: ExprId, layout: Layout, expr: KernelExpr) -> Self {
        let mut inputs = BTreeSet::new();
        expr.collect_inputs(&mut inputs);

        Self {
            output,
            layout,
            inputs: inputs.into_iter().collect(),
            expr,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Launch(Kernel),
    Release(ExprId),
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub(crate) inputs: Vec<ExprId>,
    pub(crate) input_layouts: Vec<Layout>,
    pub(crate) steps: Vec<Step>,
    pub(crate) outputs: Vec<ExprId>,
    pub(crate) output_layouts: Vec<Layout>,
}

impl Schedule {
    pub fn launches(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step, Step::Launch(_)))
            .count()
    }

    pub(crate) fn check_inputs(&self, inputs: &[Tensor]) -> Result<()> {
        if inputs.len() != self.inputs.len() {
            return Err(Error::Shape(format!(
                "expected {} inputs, got {}",
                self.inputs.len(),
                inputs.len()
            )));
        }

        for (expected, input) in self.input_layouts.iter().zip(inputs) {
            if input.layout() != expected {
                return Err(Error::Shape(format!(
                    "expected a {expected} input, got {}",
                    input.layout()
                )));
            }
        }

        Ok(())
    }
}

fn inline(graph: &Graph, id: ExprId) -> KernelExpr {
    match &graph[id].body {
        ExprBody::Input(_) => KernelExpr::Input(id),
        ExprBody::Op { op, children } => operation(*op, |index| inline(graph, children[index])),
    }
}

fn operation(op: Op, mut child: impl FnMut(usize) -> KernelExpr) -> KernelExpr {
    match op {
        Op::Unary(op) => KernelExpr::Unary(op, Box::new(child(0))),
        Op::Binary(op) => KernelExpr::Binary(op, Box::new(child(0)), Box::new(child(1))),
        Op::Fill(value) => KernelExpr::Fill(value),
    }
}

pub(crate) fn schedule(graph: &Graph, fusion: Fusion) -> Schedule {
    let mut steps = Vec::with_capacity(graph.len());

    match fusion {
        Fusion::Whole => {
            let mut launched = BTreeSet::new();

            for &output in &graph.outputs {
                if matches!(graph[output].body, ExprBody::Op { .. }) && launched.insert(output) {
                    steps.push(Step::Launch(Kernel::new(
                        output,
                        graph[output].layout.clone(),
                        inline(graph, output),
                    )));
                }
            }
        }
        Fusion::None => {
            let last_usages = graph.last_usages();

            for id in graph.ids() {
                let ExprBody::Op { op, children } = &graph[id].body else {
                    continue;
                };

                steps.push(Step::Launch(Kernel::new(
                    id,
                    graph[id].layout.clone(),
                    operation(*op, |index| KernelExpr::Input(children[index])),
                )));

                let released = children
                    .iter()
                    .copied()
                    .filter(|child| last_usages[child.0] == id && !graph.outputs.contains(child))
                    .collect::<BTreeSet<_>>();

                steps.extend(released.into_iter().map(Step::Release));
            }
        }
    }

    Schedule {
        inputs: graph.inputs.clone(),
        input_layouts: graph
            .inputs
            .iter()
            .map(|&id| graph[id].layout.clone())
            .collect(),
        steps,
        outputs: graph.outputs.clone(),
        output_layouts: graph
            .outputs
            .iter()
            .map(|&id| graph[id].layout.clone())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    fn residual() -> Graph {
        let mut graph = Graph::new();

        let x = graph.add_input(Layout::new([3], DType::BF16));
        let sigmoid = graph.add_op(Op::Unary(UnaryOp::Sigmoid), &[x]).unwrap();
        let sum = graph.add_op(Op::Binary(BinaryOp::Add), &[x, sigmoid]).unwrap();
        graph.add_output(sum).unwrap();

        graph
    }

    #[test]
    fn whole_fusion_inlines_everything() {
        let schedule = schedule(&residual(), Fusion::Whole);

        assert_eq!(schedule.launches(), 1);

        let Step::Launch(kernel) = &schedule.steps[0] else {
            panic!("expected a launch");
        };

        assert_eq!(kernel.output, ExprId(2));
        assert_eq!(kernel.inputs, vec![ExprId(0)]);
        assert_eq!(
            kernel.expr,
            KernelExpr::Binary(
                BinaryOp::Add,
                Box::new(KernelExpr::Input(ExprId(0))),
                Box::new(KernelExpr::Unary(
                    UnaryOp::Sigmoid,
                    Box::new(KernelExpr::Input(ExprId(0)))
                )),
            )
        );
    }

    #[test]
    fn no_fusion_launches_per_op_and_releases() {
        let schedule = schedule(&residual(), Fusion::None);

        assert_eq!(schedule.launches(), 2);
        assert!(matches!(
            schedule.steps.as_slice(),
            [
                Step::Launch(_),
                Step::Launch(_),
                Step::Release(ExprId(0)),
                Step::Release(ExprId(1)),
            ]
        ));
    }

    #[test]
    fn outputs_are_never_released() {
        let mut graph = Graph::new();

        let x = graph.add_input(Layout::new([3], DType::F32));
        let exp = graph.add_op(Op::Unary(UnaryOp::Exp), &[x]).unwrap();
        let neg = graph.add_op(Op::Unary(UnaryOp::Neg), &[exp]).unwrap();
        graph.add_output(exp).unwrap();
        graph.add_output(neg).unwrap();
        graph.add_output(x).unwrap();

        let schedule = schedule(&graph, Fusion::None);

        assert!(schedule
            .steps
            .iter()
            .all(|step| !matches!(step, Step::Release(_))));
    }

    #[test]
    fn identity_needs_no_kernel() {
        let mut graph = Graph::new();

        let x = graph.add_input(Layout::new([3], DType::F32));
        graph.add_output(x).unwrap();

        assert_eq!(schedule(&graph, Fusion::Whole).launches(), 0);
        assert_eq!(schedule(&graph, Fusion::None).launches(), 0);
    }

    #[test]
    fn eval_follows_the_tree() {
        let expr = KernelExpr::Binary(
            BinaryOp::Sub,
            Box::new(KernelExpr::Input(ExprId(1))),
            Box::new(KernelExpr::Fill(0.5)),
        );

        assert_eq!(expr.eval(&|id| id.0 as f32 * 4.0), 3.5);
    }

    #[test]
    fn input_layouts_are_checked() {
        let schedule = schedule(&residual(), Fusion::Whole);

        assert!(schedule
            .check_inputs(&[Tensor::zeros(Layout::new([3], DType::BF16))])
            .is_ok());
        assert!(schedule
            .check_inputs(&[Tensor::zeros(Layout::new([3], DType::F32))])
            .is_err());
        assert!(schedule.check_inputs(&[]).is_err());
    }
}
