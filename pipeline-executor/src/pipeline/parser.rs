use crate::pipeline::dependency::GraphError;
use crate::pipeline::models::{InputSource, PipelineDefinition};

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading a pipeline definition
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Failed to read pipeline file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid pipeline YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid pipeline: {0}")]
    Graph(#[from] GraphError),

    #[error("Step '{step}' input '{input}' references '{reference}', which step '{source_step}' does not declare as an output")]
    UnknownArtifact {
        step: String,
        input: String,
        reference: String,
        source_step: String,
    },
}

pub struct PipelineParser;

impl PipelineParser {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<PipelineDefinition, ParseError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content)
    }

    /// Parse and validate a pipeline definition
    pub fn from_str(content: &str) -> Result<PipelineDefinition, ParseError> {
        let pipeline: PipelineDefinition = serde_yaml::from_str(content)?;
        Self::validate(&pipeline)?;
        Ok(pipeline)
    }

    /// Check the dependency graph and artifact references, returning the
    /// execution order
    pub fn validate(pipeline: &PipelineDefinition) -> Result<Vec<String>, ParseError> {
        let order = pipeline.execution_order()?;

        for step in &pipeline.steps {
            let mut inputs: Vec<(&String, &String)> = step.inputs.iter().collect();
            inputs.sort();

            for (input, value) in inputs {
                let InputSource::Artifact {
                    step: source_step,
                    artifact,
                } = pipeline.resolve_input(value)
                else {
                    continue;
                };

                let declared = pipeline
                    .step(source_step)
                    .is_some_and(|s| s.outputs.iter().any(|o| o.name == artifact));
                if !declared {
                    return Err(ParseError::UnknownArtifact {
                        step: step.name.clone(),
                        input: input.clone(),
                        reference: value.clone(),
                        source_step: source_step.to_string(),
                    });
                }
            }
        }

        Ok(order)
    }
}
