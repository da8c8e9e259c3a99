use std::sync::OnceLock;

use serde::Serialize;
use tera::{Context, Tera};

use crate::{error::Result, fusion::Kernel, tensor::DType};

use super::expr::{input_name, WgpuExpr};

const COMMON: &str = "common";
const ELEMWISE: &str = "elemwise";

/// Upper bound on workgroups along one dispatch dimension.
pub(crate) const MAX_WORKGROUPS: u32 = 65535;

fn tera() -> Result<&'static Tera> {
    static TERA: OnceLock<Tera> = OnceLock::new();

    if let Some(tera) = TERA.get() {
        return Ok(tera);
    }

    let mut tera = Tera::default();

    tera.add_raw_templates([
        (COMMON, include_str!("templates/common.wgsl.tera")),
        (ELEMWISE, include_str!("templates/elemwise.wgsl.tera")),
    ])?;

    Ok(TERA.get_or_init(|| tera))
}

#[derive(Serialize)]
struct KernelInfo {
    workgroup_size_x: u32,
    row_stride: u64,
    elements: usize,
    dtype: DType,
    inputs: Vec<String>,
    expr: String,
}

/// Workgroup counts for `elements` invocations, spilling into `y` once `x`
/// is exhausted.
pub(crate) fn workgroups(workgroup_size_x: u32, elements: usize) -> [u32; 3] {
    let groups = (elements as u64).div_ceil(workgroup_size_x as u64);

    if groups <= MAX_WORKGROUPS as u64 {
        [groups as u32, 1, 1]
    } else {
        [
            MAX_WORKGROUPS,
            groups.div_ceil(MAX_WORKGROUPS as u64) as u32,
            1,
        ]
    }
}

pub(crate) fn elemwise(workgroup_size_x: u32, kernel: &Kernel) -> Result<String> {
    let [groups_x, ..] = workgroups(workgroup_size_x, kernel.layout.elements());

    let info = KernelInfo {
        workgroup_size_x,
        row_stride: groups_x as u64 * workgroup_size_x as u64,
        elements: kernel.layout.elements(),
        dtype: kernel.layout.dtype(),
        inputs: kernel.inputs.iter().map(|id| input_name(id.0)).collect(),
        expr: WgpuExpr::lower(&kernel.expr).to_string(),
    };

    Ok(tera()?.render(ELEMWISE, &Context::from_serialize(info)?)?)
}

#[cfg(test)]
mod tests {
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    use super::*;
    use crate::{
        fusion::{self, Fusion, Step},
        graph::{BinaryOp, Graph, Op, UnaryOp},
        tensor::Layout,
    };

    fn residual_kernel(dims: [usize; 2]) -> Kernel {
        let mut graph = Graph::new();

        let x = graph.add_input(Layout::new(dims, DType::BF16));
        let sigmoid = graph.add_op(Op::Unary(UnaryOp::Sigmoid), &[x]).unwrap();
        let sum = graph.add_op(Op::Binary(BinaryOp::Add), &[x, sigmoid]).unwrap();
        graph.add_output(sum).unwrap();

        match fusion::schedule(&graph, Fusion::Whole).steps.remove(0) {
            Step::Launch(kernel) => kernel,
            Step::Release(_) => panic!("expected a launch"),
        }
    }

    /// Every op, a constant and two inputs, with two outputs.
    fn everything(dtype: DType) -> Graph {
        let mut graph = Graph::new();
        let layout = Layout::new([300, 300], dtype);

        let a = graph.add_input(layout.clone());
        let b = graph.add_input(layout);
        let neg = graph.add_op(Op::Unary(UnaryOp::Neg), &[a]).unwrap();
        let exp = graph.add_op(Op::Unary(UnaryOp::Exp), &[neg]).unwrap();
        let sin = graph.add_op(Op::Unary(UnaryOp::Sin), &[b]).unwrap();
        let sigmoid = graph.add_op(Op::Unary(UnaryOp::Sigmoid), &[exp]).unwrap();
        let half = graph.add_op(Op::Fill(-0.5), &[a]).unwrap();
        let sub = graph.add_op(Op::Binary(BinaryOp::Sub), &[sigmoid, half]).unwrap();
        let mul = graph.add_op(Op::Binary(BinaryOp::Mul), &[sub, sin]).unwrap();
        let sum = graph.add_op(Op::Binary(BinaryOp::Add), &[mul, a]).unwrap();
        graph.add_output(sum).unwrap();
        graph.add_output(sin).unwrap();

        graph
    }

    fn validate(source: &str) {
        let module = naga::front::wgsl::parse_str(source)
            .unwrap_or_else(|error| panic!("{}", error.emit_to_string(source)));

        Validator::new(ValidationFlags::all(), Capabilities::empty())
            .validate(&module)
            .unwrap_or_else(|error| panic!("{error:?}\n{source}"));
    }

    #[test]
    fn workgroups_cover_all_elements() {
        assert_eq!(workgroups(256, 100), [1, 1, 1]);
        assert_eq!(workgroups(256, 257), [2, 1, 1]);
        assert_eq!(workgroups(1, 65536), [65535, 2, 1]);
    }

    #[test]
    fn renders_fused_kernel() {
        let source = elemwise(256, &residual_kernel([10, 10])).unwrap();

        assert!(source.contains("fn round_bf16"));
        assert!(!source.contains("fn round_f16"));
        assert!(source.contains("var<storage, read> input_0: array<f32>;"));
        assert!(source.contains("@group(0) @binding(1)\nvar<storage, read_write> output"));
        assert!(source.contains("@compute @workgroup_size(256)"));
        assert!(source.contains("let index = global_id.x + global_id.y * 256u;"));
        assert!(source.contains("if (index >= 100u)"));
        assert!(source.contains(
            "output[index] = round_bf16((input_0[index]) + (sigmoid(input_0[index])));"
        ));
    }

    #[test]
    fn rendered_kernels_are_valid_wgsl() {
        for dtype in [DType::F32, DType::F16, DType::BF16] {
            for fusion in [Fusion::Whole, Fusion::None] {
                let schedule = fusion::schedule(&everything(dtype), fusion);

                for step in &schedule.steps {
                    if let Step::Launch(kernel) = step {
                        let source = elemwise(64, kernel).unwrap();

                        assert!(source.contains(&format!("fn round_{}", serde_name(dtype))));
                        validate(&source);
                    }
                }
            }
        }
    }

    #[test]
    fn residual_kernel_is_valid_wgsl() {
        validate(&elemwise(256, &residual_kernel([10, 10])).unwrap());
        validate(&elemwise(1, &residual_kernel([300, 300])).unwrap());
    }

    fn serde_name(dtype: DType) -> &'static str {
        match dtype {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
        }
    }
}
