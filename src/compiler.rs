use crate::{
    error::Result,
    fusion::Fusion,
    graph::Graph,
    tensor::{DType, Tensor},
};

pub trait Compiler {
    type Plan;

    fn compile(&self, graph: &Graph) -> Result<Self::Plan>;
}

/// A device able to execute compiled plans.
pub trait Runner {
    type Compiler: Compiler;

    type Runnable;

    /// Backend identifier, as used in `CompileOptions::backend`.
    fn name(&self) -> &'static str;

    fn compiler(&self, fusion: Fusion) -> Self::Compiler;

    fn supports(&self, _dtype: DType) -> bool {
        true
    }

    fn preprocess(
        &mut self,
        plan: <Self::Compiler as Compiler>::Plan,
    ) -> Result<Self::Runnable>;

    fn run(&mut self, runnable: &Self::Runnable, inputs: &[Tensor]) -> Result<Vec<Tensor>>;

    /// Compiles and runs `graph` in one go, keeping nothing around.
    fn execute(&mut self, graph: &Graph, fusion: Fusion, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let plan = self.compiler(fusion).compile(graph)?;
        let runnable = self.preprocess(plan)?;

        self.run(&runnable, inputs)
    }
}
