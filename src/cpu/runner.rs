use std::collections::HashMap;

use crate::{
    compiler::Runner,
    error::{Error, Result},
    fusion::{Fusion, Kernel, Schedule, Step},
    graph::ExprId,
    tensor::Tensor,
};

use super::compiler::CpuCompiler;

/// Host interpreter for schedules. Always available.
#[derive(Default)]
pub struct CpuRunner {
    values: HashMap<ExprId, Tensor>,
}

impl CpuRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn launch(&self, kernel: &Kernel) -> Result<Tensor> {
        let sources = kernel
            .inputs
            .iter()
            .map(|id| {
                self.values
                    .get(id)
                    .map(|tensor| (*id, tensor.data()))
                    .ok_or_else(|| Error::RuntimeCompute(format!("{id:?} is not resident")))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let data = (0..kernel.layout.elements())
            .map(|index| kernel.expr.eval(&|id| sources[&id][index]))
            .collect::<Box<[f32]>>();

        Ok(Tensor::from_parts(data, kernel.layout.clone()))
    }

    fn run_steps(&mut self, plan: &Schedule, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        plan.check_inputs(inputs)?;

        for (id, input) in plan.inputs.iter().zip(inputs) {
            self.values.insert(*id, input.clone());
        }

        for step in &plan.steps {
            match step {
                Step::Launch(kernel) => {
                    let output = self.launch(kernel)?;
                    self.values.insert(kernel.output, output);
                }
                Step::Release(id) => {
                    self.values.remove(id);
                }
            }
        }

        plan.outputs
            .iter()
            .map(|id| {
                self.values
                    .get(id)
                    .cloned()
                    .ok_or_else(|| {
                        Error::RuntimeCompute(format!("output {id:?} was never computed"))
                    })
            })
            .collect()
    }
}

impl Runner for CpuRunner {
    type Compiler = CpuCompiler;

    type Runnable = Schedule;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn compiler(&self, fusion: Fusion) -> CpuCompiler {
        CpuCompiler { fusion }
    }

    fn preprocess(&mut self, plan: Schedule) -> Result<Schedule> {
        Ok(plan)
    }

    fn run(&mut self, plan: &Schedule, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let outputs = self.run_steps(plan, inputs);

        self.values.clear();

        outputs
    }
}
