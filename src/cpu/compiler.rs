use crate::{
    compiler::Compiler,
    error::Result,
    fusion::{self, Fusion, Schedule},
    graph::Graph,
};

/// Reference compiler: the schedule itself is the plan.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuCompiler {
    pub fusion: Fusion,
}

impl Compiler for CpuCompiler {
    type Plan = Schedule;

    fn compile(&self, graph: &Graph) -> Result<Self::Plan> {
        let schedule = fusion::schedule(graph, self.fusion);

        log::debug!(
            "cpu plan with {} launches ({:?} fusion)",
            schedule.launches(),
            self.fusion
        );

        Ok(schedule)
    }
}
