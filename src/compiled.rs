use std::collections::HashMap;

use crate::{
    builder,
    compiler::{Compiler, Runner},
    eager,
    error::{Error, Result},
    fusion::Fusion,
    ops::Program,
    tensor::{Layout, Tensor},
};

/// Everything that shapes a compilation. Passed explicitly to [`compile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Name of the backend the function is compiled for.
    pub backend: String,
    /// Lower the whole function into one kernel instead of one per op.
    pub graph_mode: bool,
    /// Fail instead of falling back to eager when capture breaks.
    pub fullgraph: bool,
    pub dynamic: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            backend: String::from("wgpu"),
            graph_mode: true,
            fullgraph: true,
            dynamic: false,
        }
    }
}

impl CompileOptions {
    pub fn fusion(&self) -> Fusion {
        if self.graph_mode {
            Fusion::Whole
        } else {
            Fusion::None
        }
    }
}

enum Specialization<T> {
    Compiled(T),
    Eager,
}

/// A program compiled ahead of time, specialised per list of input layouts.
pub struct CompiledFunction<P: Program, R: Runner> {
    program: P,
    options: CompileOptions,
    specializations: HashMap<Vec<Layout>, Specialization<R::Runnable>>,
}

pub fn compile<P: Program, R: Runner>(
    program: P,
    options: CompileOptions,
) -> Result<CompiledFunction<P, R>> {
    if options.dynamic {
        return Err(Error::Unsupported(String::from(
            "dynamic shapes, compile with `dynamic: false`",
        )));
    }

    Ok(CompiledFunction {
        program,
        options,
        specializations: HashMap::new(),
    })
}

fn specialize<P: Program, R: Runner>(
    program: &P,
    options: &CompileOptions,
    runner: &mut R,
    layouts: &[Layout],
) -> Result<Specialization<R::Runnable>> {
    log::debug!(
        "compiling {} for {} on {}",
        program.name(),
        layouts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        runner.name()
    );

    let graph = match builder::trace(program, layouts) {
        Ok(graph) => graph.prune(),
        Err(Error::GraphCapture(reason)) if !options.fullgraph => {
            log::warn!("{} falls back to eager: {reason}", program.name());

            return Ok(Specialization::Eager);
        }
        Err(error) => return Err(error),
    };

    log::debug!("captured graph {graph:#?}");

    let plan = runner.compiler(options.fusion()).compile(&graph)?;

    Ok(Specialization::Compiled(runner.preprocess(plan)?))
}

impl<P: Program, R: Runner> CompiledFunction<P, R> {
    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Number of input layout lists compiled so far.
    pub fn specializations(&self) -> usize {
        self.specializations.len()
    }

    pub fn call(&mut self, runner: &mut R, inputs: &[Tensor]) -> Result<Tensor> {
        if runner.name() != self.options.backend {
            return Err(Error::Unsupported(format!(
                "{} was compiled for `{}`, not `{}`",
                self.program.name(),
                self.options.backend,
                runner.name()
            )));
        }

        let layouts = inputs
            .iter()
            .map(|input| input.layout().clone())
            .collect::<Vec<_>>();

        if !self.specializations.contains_key(&layouts) {
            let specialization = specialize(&self.program, &self.options, runner, &layouts)?;

            self.specializations.insert(layouts.clone(), specialization);
        }

        match &self.specializations[&layouts] {
            Specialization::Compiled(runnable) => runner
                .run(runnable, inputs)?
                .pop()
                .ok_or_else(|| {
                    Error::RuntimeCompute(format!("{} returned nothing", self.program.name()))
                }),
            Specialization::Eager => eager::evaluate(runner, &self.program, inputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu::runner::CpuRunner,
        ops::{PairwiseSum, SigmoidResidual},
        tensor::DType,
    };

    fn cpu_options() -> CompileOptions {
        CompileOptions {
            backend: String::from("cpu"),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_graph_mode_capture() {
        let options = CompileOptions::default();

        assert_eq!(options.backend, "wgpu");
        assert!(options.graph_mode && options.fullgraph && !options.dynamic);
        assert_eq!(options.fusion(), Fusion::Whole);
    }

    #[test]
    fn dynamic_shapes_are_rejected() {
        let options = CompileOptions {
            dynamic: true,
            ..cpu_options()
        };

        let result = compile::<_, CpuRunner>(SigmoidResidual::default(), options);

        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn specializes_per_layout() {
        let mut runner = CpuRunner::new();
        let mut function = compile(SigmoidResidual::default(), cpu_options()).unwrap();

        let small = Tensor::zeros(Layout::new([2, 2], DType::BF16));
        let large = Tensor::zeros(Layout::new([3, 5], DType::BF16));

        function.call(&mut runner, &[small.clone()]).unwrap();
        function.call(&mut runner, &[small]).unwrap();
        assert_eq!(function.specializations(), 1);

        let output = function.call(&mut runner, &[large]).unwrap();
        assert_eq!(output.dims(), &[3, 5]);
        assert_eq!(function.specializations(), 2);
    }

    #[test]
    fn fuses_pairwise_sum() {
        let mut runner = CpuRunner::new();
        let mut function = compile(PairwiseSum, cpu_options()).unwrap();

        let layout = Layout::new([1], DType::F16);
        let inputs = [2048.0, 1.0, 0.0, 1.0]
            .map(|value| Tensor::full(layout.clone(), value))
            .to_vec();

        // One rounding at the end of the fused kernel keeps the exact sum.
        assert_eq!(function.call(&mut runner, &inputs).unwrap().data(), &[2050.0]);
        assert!(function.call(&mut runner, &inputs[..3]).is_err());
    }

    #[test]
    fn runner_must_match_backend() {
        let mut runner = CpuRunner::new();
        let mut function = compile(SigmoidResidual::default(), CompileOptions::default()).unwrap();

        let input = Tensor::zeros(Layout::new([2], DType::F32));
        let result = function.call(&mut runner, &[input]);

        assert!(matches!(result, Err(Error::Unsupported(_))));
    }
}
