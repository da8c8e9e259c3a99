//! Runs one program eagerly and compiled on the same inputs and reports both.

use std::io::Write;

use rand::{rngs::StdRng, SeedableRng};

use crate::{
    compiled::{self, CompileOptions},
    compiler::Runner,
    cpu::runner::CpuRunner,
    eager,
    error::{Error, Result},
    ops::{Program, SigmoidResidual},
    tensor::{DType, Layout, Tensor},
    wgpu::runner::WgpuRunner,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Shape of every generated input.
    pub dims: Vec<usize>,
    pub dtype: DType,
    /// Fixed seed for the inputs. Fresh entropy when unset.
    pub seed: Option<u64>,
    pub options: CompileOptions,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            dims: vec![10, 10],
            dtype: DType::BF16,
            seed: None,
            options: CompileOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Comparison {
    pub inputs: Vec<Tensor>,
    pub eager: Tensor,
    pub compiled: Tensor,
}

impl Comparison {
    pub fn max_abs_diff(&self) -> Result<f32> {
        self.eager.max_abs_diff(&self.compiled)
    }

    /// Whether both results agree within the default tolerance of their dtype.
    pub fn is_close(&self) -> bool {
        let (rtol, atol) = self.eager.dtype().tolerance();

        self.compiled.all_close(&self.eager, rtol, atol)
    }
}

pub struct Harness<P = SigmoidResidual> {
    config: HarnessConfig,
    program: P,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self::with_program(config, SigmoidResidual::default())
    }
}

impl<P: Program + Clone> Harness<P> {
    pub fn with_program(config: HarnessConfig, program: P) -> Self {
        Self { config, program }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Opens the configured backend and compares on it.
    pub fn run(&self, out: &mut impl Write) -> Result<Comparison> {
        match self.config.options.backend.as_str() {
            "cpu" => self.run_on(&mut CpuRunner::new(), out),
            "wgpu" => self.run_on(&mut WgpuRunner::new()?, out),
            other => Err(Error::UnknownBackend(other.to_owned())),
        }
    }

    /// Samples one tensor per program input from a single generator.
    pub fn generate_inputs<R: Runner>(&self, runner: &R) -> Result<Vec<Tensor>> {
        if !runner.supports(self.config.dtype) {
            return Err(Error::Initialization(format!(
                "{} does not support {}",
                runner.name(),
                self.config.dtype
            )));
        }

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let layout = Layout::new(self.config.dims.clone(), self.config.dtype);

        Ok((0..self.program.inputs())
            .map(|_| Tensor::randn(layout.clone(), &mut rng))
            .collect())
    }

    /// Writes the eager result before compiling, so it stays visible if
    /// compilation fails.
    pub fn run_on<R: Runner>(&self, runner: &mut R, out: &mut impl Write) -> Result<Comparison> {
        let inputs = self.generate_inputs(runner)?;

        log::info!(
            "running {} on {} input(s) of {} ({})",
            self.program.name(),
            inputs.len(),
            Layout::new(self.config.dims.clone(), self.config.dtype),
            runner.name()
        );

        let eager = eager::evaluate(runner, &self.program, &inputs)?;

        writeln!(out, "{eager}")?;
        out.flush()?;

        let options = self.config.options.clone();
        let mut function = compiled::compile::<_, R>(self.program.clone(), options)?;
        let compiled = function.call(runner, &inputs)?;

        writeln!(out, "{compiled}")?;
        out.flush()?;

        let comparison = Comparison {
            inputs,
            eager,
            compiled,
        };

        log::info!("max abs diff {}", comparison.max_abs_diff()?);

        Ok(comparison)
    }
}
