pub mod dependency;
pub mod models;
pub mod parser;

pub use dependency::{validate_dependencies, DependencyGraph, GraphError};
pub use models::{InputSource, PipelineDefinition, StepDefinition};
pub use parser::{ParseError, PipelineParser};
