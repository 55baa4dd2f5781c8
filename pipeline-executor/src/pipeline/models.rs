use crate::config::{ContainerOptions, ExecutorConfig};
use crate::execution::models::ArtifactSpec;
use crate::pipeline::dependency::{DependencyGraph, GraphError};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_backend() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Applied to every step, step-level values win
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing)]
    pub secrets: HashMap<String, String>,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub command: String,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing)]
    pub secrets: HashMap<String, String>,
    /// Input name -> "step/artifact" or a filesystem path
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<ArtifactSpec>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub container: Option<ContainerOptions>,
}

/// Where an input artifact comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource<'a> {
    /// Output of an upstream step
    Artifact { step: &'a str, artifact: &'a str },
    /// Existing file or directory
    Path(&'a str),
}

impl PipelineDefinition {
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Interpret an input value. `step/artifact` is an artifact reference
    /// when `step` names a step of this pipeline.
    pub fn resolve_input<'a>(&self, value: &'a str) -> InputSource<'a> {
        match value.split_once('/') {
            Some((step, artifact)) if !artifact.is_empty() && self.step(step).is_some() => {
                InputSource::Artifact { step, artifact }
            }
            _ => InputSource::Path(value),
        }
    }

    /// `(step, depends_on)` edges: declared dependencies plus the ones
    /// implied by artifact inputs
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                edges.push((step.name.clone(), dep.clone()));
            }

            let mut inputs: Vec<&String> = step.inputs.values().collect();
            inputs.sort();
            for value in inputs {
                if let InputSource::Artifact { step: upstream, .. } = self.resolve_input(value) {
                    edges.push((step.name.clone(), upstream.to_string()));
                }
            }
        }
        edges
    }

    pub fn dependency_graph(&self) -> Result<DependencyGraph<String>, GraphError> {
        let names = self.steps.iter().map(|s| s.name.clone()).collect();
        DependencyGraph::from_edges(names, &self.edges())
    }

    /// Validated linear execution order
    pub fn execution_order(&self) -> Result<Vec<String>, GraphError> {
        self.dependency_graph()?.topological_sort()
    }

    /// Executor settings for one step, layered over `base`
    pub fn executor_config(&self, step: &StepDefinition, base: &ExecutorConfig) -> ExecutorConfig {
        let mut config = base.clone();
        config.env.extend(self.env.clone());
        config.env.extend(step.env.clone());
        config.secrets.extend(self.secrets.clone());
        config.secrets.extend(step.secrets.clone());

        if let Some(secs) = step.timeout_secs {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        if let Some(container) = &step.container {
            config.container = container.clone();
        }
        config
    }
}
