use crate::commands::parse_pairs;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use uuid::Uuid;

use pipeline_executor::{
    ArtifactSpec, ExecutorConfig, ExecutorResult, ExecutorService, StepRunOutcome, StepRunRequest,
    StepRunStatus, WorkerConfig, LOCAL_BACKEND,
};

/// Run a single command as a step run
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Command line passed to the shell
    pub command: String,

    /// Backend to run on (local or docker)
    #[arg(long, short = 'b', default_value = LOCAL_BACKEND)]
    pub backend: String,

    /// Environment variable (can be repeated)
    #[arg(long = "env", short = 'e', value_name = "NAME=VALUE")]
    pub env: Vec<String>,

    /// Secret injected like --env and masked in output (can be repeated)
    #[arg(long = "secret", value_name = "NAME=VALUE")]
    pub secrets: Vec<String>,

    /// Stage a file or directory as an input (can be repeated)
    #[arg(long = "input", short = 'i', value_name = "NAME=PATH")]
    pub inputs: Vec<String>,

    /// Expected output artifact name (can be repeated)
    #[arg(long = "output", short = 'o', value_name = "NAME")]
    pub outputs: Vec<String>,

    /// Timeout in seconds, 0 disables it
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Base image for the docker backend
    #[arg(long, value_name = "IMAGE")]
    pub image: Option<String>,

    /// Step run id to record (default: random)
    #[arg(long, value_name = "UUID")]
    pub step_run_id: Option<Uuid>,

    /// Print the outcome metadata as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: ExecArgs, worker_config: WorkerConfig) -> Result<()> {
    let mut config = ExecutorConfig::default();
    config.env = parse_pairs(&args.env, "--env")?;
    config.secrets = parse_pairs(&args.secrets, "--secret")?;
    if let Some(secs) = args.timeout {
        config.timeout_secs = secs;
    }
    if let Some(image) = args.image {
        config.container.base_image = image;
    }
    config = config.with_working_directory(std::env::current_dir()?);

    let mut request = StepRunRequest::new(args.command)
        .with_backend(args.backend)
        .with_config(config);
    if let Some(id) = args.step_run_id {
        request.step_run_id = id;
    }
    request.input_artifacts = parse_pairs(&args.inputs, "--input")?;
    for name in args.outputs {
        request = request.with_output(ArtifactSpec::new(name));
    }

    let service = ExecutorService::local(worker_config, None).await;
    let result = run(&service, &request).await;
    service.shutdown().await;
    let outcome = match result {
        Ok(outcome) => outcome,
        // Bad backend name or no free slot: nothing ran
        Err(e) if e.is_usage_error() => {
            output::error(&e.to_string());
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };

    output::step_logs(&outcome.logs);
    for (name, path) in &outcome.artifacts {
        output::info(&format!("artifact {} -> {}", name, path));
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome.metadata)?);
    }

    if outcome.status == StepRunStatus::Completed {
        output::success(&format!("Step run {} completed", outcome.step_run_id));
        Ok(())
    } else {
        let reason = outcome
            .metadata
            .get("error_message")
            .and_then(|m| m.as_str())
            .unwrap_or("step failed");
        output::failure(&format!("Step run {} failed: {}", outcome.step_run_id, reason));
        std::process::exit(1);
    }
}

async fn run(service: &ExecutorService, request: &StepRunRequest) -> ExecutorResult<StepRunOutcome> {
    let execution_id = service.execute_step(request).await?;
    output::status(
        "Submitted",
        &format!("{} on {} ({})", request.step_run_id, request.backend_type, execution_id),
    );

    tokio::select! {
        status = service.wait_for_completion(execution_id, None) => {
            let status = status?;
            tracing::debug!(execution_id = %execution_id, status = %status, "Execution finished");
            service.complete_step_execution(execution_id).await
        }
        _ = tokio::signal::ctrl_c() => {
            output::warning("Interrupted, cancelling");
            service.cancel_execution(execution_id).await
        }
    }
}
