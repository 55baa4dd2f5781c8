use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_executor::PipelineParser;

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    output::status("Validating", &format!("{}", pipeline_path.display()));

    let pipeline = match PipelineParser::from_file(pipeline_path) {
        Ok(p) => p,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };

    output::check(&format!(
        "Pipeline '{}': {} steps",
        pipeline.name,
        pipeline.steps.len()
    ));

    let order = pipeline.execution_order()?;
    output::check(&format!("Execution order: {}", order.join(" -> ")));

    for name in &order {
        let Some(step) = pipeline.step(name) else {
            continue;
        };
        let deps = if step.depends_on.is_empty() {
            String::new()
        } else {
            format!(" after {}", step.depends_on.join(", "))
        };
        output::dim(&format!("    {} [{}]{}", step.name, step.backend, deps));
    }

    println!();
    output::success("Pipeline is valid");

    Ok(())
}
