use crate::{
    compiler::Compiler,
    error::Result,
    fusion::{self, Fusion, Step},
    graph::{ExprId, Graph},
    tensor::Layout,
};

use super::kernel;

#[derive(Debug)]
pub(crate) enum WgpuStep {
    Deallocate(ExprId),
    Execute {
        output: ExprId,
        source: String,
        workgroups: [u32; 3],
        /// Bound buffers in binding order, the output last.
        inputs: Box<[ExprId]>,
        /// `(size in bytes, read only)` per bound buffer.
        inputs_layout: Box<[(usize, bool)]>,
    },
}

#[derive(Debug)]
pub struct WgpuPlan {
    pub(crate) inputs: Vec<ExprId>,
    pub(crate) input_layouts: Vec<Layout>,
    pub(crate) steps: Vec<WgpuStep>,
    pub(crate) outputs: Vec<ExprId>,
    pub(crate) output_layouts: Vec<Layout>,
}

impl WgpuPlan {
    pub fn dispatches(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step, WgpuStep::Execute { .. }))
            .count()
    }
}

pub struct WgpuCompiler {
    pub workgroup_size_x: u32,
    pub fusion: Fusion,
}

impl Default for WgpuCompiler {
    fn default() -> Self {
        Self {
            workgroup_size_x: 256,
            fusion: Fusion::default(),
        }
    }
}

impl Compiler for WgpuCompiler {
    type Plan = WgpuPlan;

    fn compile(&self, graph: &Graph) -> Result<Self::Plan> {
        let schedule = fusion::schedule(graph, self.fusion);
        let layouts = graph
            .ids()
            .map(|id| graph[id].layout().clone())
            .collect::<Vec<_>>();

        let mut steps = Vec::with_capacity(schedule.steps.len());

        for step in &schedule.steps {
            match step {
                Step::Launch(kernel) if kernel.layout.elements() == 0 => {}
                Step::Launch(kernel) => {
                    let source = kernel::elemwise(self.workgroup_size_x, kernel)?;

                    log::debug!("kernel for {:?}:\n{source}", kernel.output);

                    steps.push(WgpuStep::Execute {
                        output: kernel.output,
                        source,
                        workgroups: kernel::workgroups(
                            self.workgroup_size_x,
                            kernel.layout.elements(),
                        ),
                        inputs: kernel
                            .inputs
                            .iter()
                            .copied()
                            .chain([kernel.output])
                            .collect(),
                        inputs_layout: kernel
                            .inputs
                            .iter()
                            .map(|id| (layouts[id.0].size(), true))
                            .chain([(kernel.layout.size(), false)])
                            .collect(),
                    });
                }
                Step::Release(id) => steps.push(WgpuStep::Deallocate(*id)),
            }
        }

        Ok(WgpuPlan {
            inputs: schedule.inputs,
            input_layouts: schedule.input_layouts,
            steps,
            outputs: schedule.outputs,
            output_layouts: schedule.output_layouts,
        })
    }
}
