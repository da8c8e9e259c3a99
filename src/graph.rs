use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tensor::Layout;

#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExprId(pub(crate) usize);

impl Debug for ExprId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UnaryOp {
    Neg,
    Exp,
    Sin,
    Sigmoid,
}

impl UnaryOp {
    pub(crate) fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Exp => x.exp(),
            UnaryOp::Sin => x.sin(),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

impl Display for UnaryOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Exp => "exp",
            UnaryOp::Sin => "sin",
            UnaryOp::Sigmoid => "sigmoid",
        })
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

impl BinaryOp {
    pub(crate) fn apply(self, left: f32, right: f32) -> f32 {
        match self {
            BinaryOp::Add => left + right,
            BinaryOp::Sub => left - right,
            BinaryOp::Mul => left * right,
        }
    }
}

impl Display for BinaryOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
pub enum Op {
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// A tensor shaped like its only child, every element set to the value.
    Fill(f32),
}

impl Op {
    pub(crate) fn arity(&self) -> usize {
        match self {
            Op::Unary(_) | Op::Fill(_) => 1,
            Op::Binary(_) => 2,
        }
    }

    pub(crate) fn infer_layout(&self, children: &[&Layout]) -> Result<Layout> {
        if children.len() != self.arity() {
            return Err(Error::Shape(format!(
                "{self:?} takes {} operands, got {}",
                self.arity(),
                children.len()
            )));
        }

        match self {
            Op::Unary(_) | Op::Fill(_) => Ok(children[0].clone()),
            Op::Binary(_) => {
                if children[0] != children[1] {
                    return Err(Error::Shape(format!(
                        "{self:?} operands differ: {} vs {}",
                        children[0], children[1]
                    )));
                }

                Ok(children[0].clone())
            }
        }
    }
}

impl Debug for Op {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Op::Unary(op) => write!(f, "{op}"),
            Op::Binary(op) => write!(f, "{op}"),
            Op::Fill(value) => write!(f, "fill(value={value:?})"),
        }
    }
}

#[derive(Clone)]
pub(crate) enum ExprBody {
    Op { op: Op, children: Vec<ExprId> },
    Input(Layout),
}

impl Debug for ExprBody {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ExprBody::Op { op, children } => {
                let mut result = f.debug_tuple(&format!("{op:?}"));

                for child in children {
                    result.field(child);
                }

                result.finish()
            }
            ExprBody::Input(_) => f.write_str("?"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExprInfo {
    pub(crate) body: ExprBody,
    pub(crate) layout: Layout,
    pub(crate) last_usage: ExprId,
}

impl ExprInfo {
    pub fn layout(&self) -> &Layout {
        &self.layout
    }
}

#[derive(Default, Clone)]
pub struct Graph {
    pub(crate) inputs: Vec<ExprId>,
    pub(crate) exprs: Vec<ExprInfo>,
    pub(crate) outputs: Vec<ExprId>,
}

impl Index<ExprId> for Graph {
    type Output = ExprInfo;

    fn index(&self, index: ExprId) -> &Self::Output {
        &self.exprs[index.0]
    }
}

impl IndexMut<ExprId> for Graph {
    fn index_mut(&mut self, index: ExprId) -> &mut Self::Output {
        &mut self.exprs[index.0]
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inputs(&self) -> &[ExprId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ExprId] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    pub(crate) fn ids(&self) -> impl DoubleEndedIterator<Item = ExprId> {
        (0..self.exprs.len()).map(ExprId)
    }

    pub(crate) fn last_usages(&self) -> Vec<ExprId> {
        self.exprs.iter().map(|expr| expr.last_usage).collect()
    }

    fn check(&self, id: ExprId) -> Result<()> {
        if id.0 < self.exprs.len() {
            Ok(())
        } else {
            Err(Error::Shape(format!("{id:?} is not part of this graph")))
        }
    }

    fn add_expr(&mut self, expr: ExprBody) -> Result<ExprId> {
        let id = ExprId(self.exprs.len());

        let layout = match &expr {
            ExprBody::Op { op, children } => {
                for &child in children {
                    self.check(child)?;
                }

                let layout = op.infer_layout(
                    &children
                        .iter()
                        .copied()
                        .map(|expr| &self[expr].layout)
                        .collect::<Vec<_>>(),
                )?;

                for expr in children.iter().copied() {
                    self[expr].last_usage = id;
                }

                layout
            }
            ExprBody::Input(layout) => layout.clone(),
        };

        self.exprs.push(ExprInfo {
            body: expr,
            layout,
            last_usage: id,
        });

        Ok(id)
    }

    pub fn add_input(&mut self, layout: Layout) -> ExprId {
        let id = ExprId(self.exprs.len());

        self.exprs.push(ExprInfo {
            body: ExprBody::Input(layout.clone()),
            layout,
            last_usage: id,
        });
        self.inputs.push(id);

        id
    }

    pub fn add_op(&mut self, op: Op, children: &[ExprId]) -> Result<ExprId> {
        self.add_expr(ExprBody::Op {
            op,
            children: children.to_owned(),
        })
    }

    pub fn add_output(&mut self, expr: ExprId) -> Result<()> {
        self.check(expr)?;
        self.outputs.push(expr);

        Ok(())
    }

    /// Returns a copy holding only what the outputs depend on. Inputs are
    /// always kept, in their original order.
    pub fn prune(&self) -> Graph {
        let mut live = vec![false; self.exprs.len()];

        for output in &self.outputs {
            live[output.0] = true;
        }

        for id in self.ids().rev() {
            if let (true, ExprBody::Op { children, .. }) = (live[id.0], &self[id].body) {
                for child in children {
                    live[child.0] = true;
                }
            }
        }

        let mut pruned = Graph::new();
        let mut remap = vec![None; self.exprs.len()];

        for id in self.ids() {
            remap[id.0] = match &self[id].body {
                ExprBody::Input(layout) => Some(pruned.add_input(layout.clone())),
                ExprBody::Op { op, children } if live[id.0] => {
                    let children = children
                        .iter()
                        .filter_map(|child| remap[child.0])
                        .collect::<Vec<_>>();

                    pruned.add_op(*op, &children).ok()
                }
                ExprBody::Op { .. } => None,
            };
        }

        pruned.outputs = self
            .outputs
            .iter()
            .filter_map(|output| remap[output.0])
            .collect();

        pruned
    }
}

impl Debug for Graph {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}) -> ({}) {{",
            self.inputs
                .iter()
                .map(|input| format!("{input:?}: {}", self[*input].layout))
                .collect::<Vec<_>>()
                .join(", "),
            self.outputs
                .iter()
                .map(|output| format!("{output:?}"))
                .collect::<Vec<_>>()
                .join(", ")
        )?;

        if f.alternate() {
            writeln!(f)?;
        } else {
            write!(f, " ")?;
        }

        f.write_str(
            &self
                .exprs
                .iter()
                .zip(self.ids())
                .filter(|(info, _)| !matches!(info.body, ExprBody::Input(..)))
                .map(|(node, id)| {
                    format!(
                        "{}{id:?}: {} = {:?};",
                        if f.alternate() { "    " } else { "" },
                        node.layout,
                        node.body
                    )
                })
                .collect::<Vec<_>>()
                .join(if f.alternate() { "\n" } else { " " }),
        )?;

        if f.alternate() {
            writeln!(f)?;
        } else {
            write!(f, " ")?;
        }

        write!(f, "}}")
    }
}
