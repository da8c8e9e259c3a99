use std::fmt::{self, Display, Formatter};

use crate::{
    fusion::KernelExpr,
    graph::{BinaryOp, UnaryOp},
};

pub enum WgpuOp {
    Add,
    Sub,
    Mul,
    Neg,
    Exp,
    Sin,
    Sigmoid,
    Const(f32),
    Var(String),
}

impl Display for WgpuOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WgpuOp::Add => f.write_str("+"),
            WgpuOp::Sub => f.write_str("-"),
            WgpuOp::Mul => f.write_str("*"),
            WgpuOp::Neg => f.write_str("-"),
            WgpuOp::Exp => f.write_str("exp"),
            WgpuOp::Sin => f.write_str("sin"),
            WgpuOp::Sigmoid => f.write_str("sigmoid"),
            WgpuOp::Const(value) if value.is_finite() => write!(f, "{value:?}"),
            WgpuOp::Const(value) => write!(f, "bitcast<f32>({}u)", value.to_bits()),
            WgpuOp::Var(variable) => f.write_str(variable),
        }
    }
}

/// A WGSL expression tree, printed as source.
pub struct WgpuExpr {
    op: WgpuOp,
    children: Vec<WgpuExpr>,
}

impl WgpuExpr {
    pub fn new(op: WgpuOp, children: Vec<WgpuExpr>) -> Self {
        Self { op, children }
    }

    pub fn new_var(name: String) -> Self {
        Self {
            op: WgpuOp::Var(name),
            children: vec![],
        }
    }

    pub(crate) fn lower(expr: &KernelExpr) -> Self {
        match expr {
            KernelExpr::Input(id) => Self::new_var(format!("{}[index]", input_name(id.0))),
            KernelExpr::Fill(value) => Self::new(WgpuOp::Const(*value), vec![]),
            KernelExpr::Unary(op, child) => Self::new(
                match op {
                    UnaryOp::Neg => WgpuOp::Neg,
                    UnaryOp::Exp => WgpuOp::Exp,
                    UnaryOp::Sin => WgpuOp::Sin,
                    UnaryOp::Sigmoid => WgpuOp::Sigmoid,
                },
                vec![Self::lower(child)],
            ),
            KernelExpr::Binary(op, left, right) => Self::new(
                match op {
                    BinaryOp::Add => WgpuOp::Add,
                    BinaryOp::Sub => WgpuOp::Sub,
                    BinaryOp::Mul => WgpuOp::Mul,
                },
                vec![Self::lower(left), Self::lower(right)],
            ),
        }
    }
}

pub(crate) fn input_name(id: usize) -> String {
    format!("input_{id}")
}

impl Display for WgpuExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.op {
            WgpuOp::Add | WgpuOp::Sub | WgpuOp::Mul => {
                write!(
                    f,
                    "({}) {} ({})",
                    &self.children[0], self.op, &self.children[1]
                )
            }
            WgpuOp::Neg => write!(f, "-({})", &self.children[0]),
            WgpuOp::Exp | WgpuOp::Sin | WgpuOp::Sigmoid => write!(
                f,
                "{}({})",
                self.op,
                self.children
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            WgpuOp::Const(value) if value.is_sign_negative() => write!(f, "({})", self.op),
            WgpuOp::Const(_) | WgpuOp::Var(_) => write!(f, "{}", self.op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ExprId;

    #[test]
    fn renders_residual() {
        let expr = KernelExpr::Binary(
            BinaryOp::Add,
            Box::new(KernelExpr::Input(ExprId(0))),
            Box::new(KernelExpr::Unary(
                UnaryOp::Sigmoid,
                Box::new(KernelExpr::Input(ExprId(0))),
            )),
        );

        assert_eq!(
            WgpuExpr::lower(&expr).to_string(),
            "(input_0[index]) + (sigmoid(input_0[index]))"
        );
    }

    #[test]
    fn renders_constants() {
        let render = |value: f32| WgpuExpr::lower(&KernelExpr::Fill(value)).to_string();

        assert_eq!(render(0.0), "0.0");
        assert_eq!(render(-1.5), "(-1.5)");
        assert_eq!(render(f32::INFINITY), "bitcast<f32>(2139095040u)");
    }

    #[test]
    fn renders_negation() {
        let expr = KernelExpr::Unary(UnaryOp::Neg, Box::new(KernelExpr::Input(ExprId(3))));

        assert_eq!(WgpuExpr::lower(&expr).to_string(), "-(input_3[index])");
    }
}
