use crate::commands::parse_pairs;
use crate::output;

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use color_eyre::Result;

use pipeline_executor::execution::event_channel;
use pipeline_executor::{
    ExecutionEvent, ExecutorConfig, ExecutorService, PipelineParser, StepRunStatus, WorkerConfig,
    DEFAULT_WORKER,
};

/// Run every step of a pipeline on a local worker
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Set an environment variable for every step (can be repeated)
    #[arg(long = "env", short = 'e', value_name = "NAME=VALUE")]
    pub env: Vec<String>,

    /// Per-step timeout in seconds, 0 disables it
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Working directory for local steps
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Directory for execution areas and artifacts
    #[arg(long, value_name = "DIR")]
    pub artifact_dir: Option<PathBuf>,
}

pub async fn execute(args: RunArgs, mut worker_config: WorkerConfig) -> Result<()> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    output::status("Parsing", &format!("{}", pipeline_path.display()));
    let pipeline = PipelineParser::from_file(pipeline_path)
        .map_err(|e| color_eyre::eyre::eyre!("Parse error: {}", e))?;

    let mut base = ExecutorConfig::default();
    base.env.extend(parse_pairs(&args.env, "--env")?);
    if let Some(secs) = args.timeout {
        base.timeout_secs = secs;
    }
    let working_dir = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    base = base.with_working_directory(working_dir);

    if let Some(dir) = args.artifact_dir {
        worker_config.artifact_dir = Some(dir);
    }
    output::info(&format!(
        "Artifacts under {}",
        worker_config.resolved_artifact_dir().display()
    ));

    let (tx, mut rx) = event_channel();
    let service = ExecutorService::local(worker_config, Some(tx)).await;
    if let Ok(worker) = service.worker(DEFAULT_WORKER) {
        tracing::debug!(worker_id = %worker.worker_id().await, "Worker started");
    }

    let mut run_handle = tokio::spawn(async move {
        let report = service.run_pipeline(&pipeline, DEFAULT_WORKER, &base).await;
        service.shutdown().await;
        report
    });

    // Render progress until the run finishes, then drain what is left
    let report = loop {
        tokio::select! {
            Some(event) = rx.recv() => render(&event),
            joined = &mut run_handle => break joined??,
        }
    };
    while let Ok(event) = rx.try_recv() {
        render(&event);
    }

    if !report.success() {
        std::process::exit(1);
    }

    Ok(())
}

fn render(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::PipelineStarted {
            pipeline_name,
            total_steps,
        } => {
            println!();
            output::header(&format!("Pipeline '{}' ({} steps)", pipeline_name, total_steps));
        }

        ExecutionEvent::StepStarted {
            step_name,
            backend_type,
            execution_id,
        } => {
            output::status("Running", &format!("{} [{}]", step_name, backend_type));
            tracing::debug!(step = %step_name, execution_id = %execution_id, "Step submitted");
        }

        ExecutionEvent::StepCompleted {
            step_name,
            status,
            duration,
            exit_code,
            logs,
        } => {
            output::step_logs(logs);
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            let line = format!(
                "    {} {} ({:.2}s){}",
                step_name,
                status,
                duration.as_secs_f64(),
                exit_info
            );
            output::step_summary(&line, *status == StepRunStatus::Completed);
        }

        ExecutionEvent::StepSkipped { step_name, reason } => {
            output::warning(&format!("    {} skipped: {}", step_name, reason));
        }

        ExecutionEvent::PipelineCompleted {
            success, duration, ..
        } => {
            println!();
            report_completion(*success, *duration);
        }

        ExecutionEvent::ExecutionStatusChanged {
            execution_id,
            previous,
            status,
            ..
        } => {
            tracing::debug!(execution_id = %execution_id, from = %previous, to = %status, "Status changed");
        }

        _ => {}
    }
}

fn report_completion(success: bool, duration: Duration) {
    if success {
        output::success(&format!(
            "Pipeline completed successfully in {:.2}s",
            duration.as_secs_f64()
        ));
    } else {
        output::failure(&format!(
            "Pipeline failed after {:.2}s",
            duration.as_secs_f64()
        ));
    }
}
