//! Step/pipeline specs and the dependency analyzer.
//!
//! Derives a DAG from declarative step definitions, detects cycles, and
//! stratifies it into concurrent waves (Kahn's algorithm).

mod graph;
mod spec;

pub use graph::{analyze, topo_sort, waves, Graph};
pub use spec::{
    AgentFlowSpec, AggregationStrategy, BatchAggregatorSpec, CodeLanguage, CodeNodeSpec,
    PipelineSpec, SpecError, StepKind, StepOverride, StepSpec,
};
