mod cli;
mod ui;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command, OutputFormat};
use ui::BatchProgress;
use whisperq::config::WhisperqConfig;
use whisperq::dispatcher::Upload;
use whisperq::engine::{CommandEngine, Engine, SyntheticEngine};
use whisperq::export;
use whisperq::job::{Job, JobId, JobOptions};
use whisperq::{ServiceError, TranscriptionService};

const CLI_CLIENT: &str = "cli";
const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn init_tracing(verbose: bool) {
    let default = if verbose { "whisperq=debug" } else { "whisperq=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

// Called once per worker; every call returns a fresh instance.
fn build_engine(config: &WhisperqConfig, synthetic_delay: Duration) -> Arc<dyn Engine> {
    match &config.engine.command {
        Some(command) => Arc::new(CommandEngine::new(command, config.engine.args.clone())),
        None => Arc::new(SyntheticEngine::new(synthetic_delay)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = WhisperqConfig::load(cli.config.as_deref())?;
    if let Some(workers) = cli.workers {
        config.pool.workers = workers;
        config.validate()?;
    }

    match cli.command {
        Command::Run {
            input_dir,
            output,
            language,
            initial_prompt,
            no_vad,
            format,
        } => {
            let options = JobOptions {
                language,
                initial_prompt,
                vad_filter: !no_vad,
            };
            let output = output.unwrap_or_else(|| input_dir.clone());
            run_batch(config, &input_dir, &output, options, format).await
        }
        Command::Demo { jobs, delay_ms } => run_demo(config, jobs, Duration::from_millis(delay_ms)).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn collect_inputs(dir: &Path, config: &WhisperqConfig) -> Result<Vec<PathBuf>> {
    let policy = config.upload_policy();
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let supported = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| policy.allows_extension(ext));
        if path.is_file() && supported {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn write_outputs(out_dir: &Path, stem: &str, job: &Job, format: OutputFormat) -> Result<()> {
    let Some(transcript) = job.result() else {
        return Ok(());
    };
    for ext in format.extensions() {
        let body = match *ext {
            "srt" => export::to_srt(transcript),
            "txt" => export::to_text(transcript),
            _ => serde_json::to_string_pretty(transcript)?,
        };
        let path = out_dir.join(format!("{stem}.{ext}"));
        std::fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), "transcript written");
    }
    Ok(())
}

async fn run_batch(
    mut config: WhisperqConfig,
    input_dir: &Path,
    out_dir: &Path,
    options: JobOptions,
    format: OutputFormat,
) -> Result<()> {
    let files = collect_inputs(input_dir, &config)?;
    if files.is_empty() {
        bail!("no supported audio files in {}", input_dir.display());
    }
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    if config.engine.command.is_none() {
        warn!("no [engine] command configured, using the synthetic engine");
    }
    // A local batch is one trusted caller; give it room for the whole batch.
    let needed = u32::try_from(files.len()).unwrap_or(u32::MAX);
    config.limits.submit_capacity = config.limits.submit_capacity.max(needed);

    let engines = || build_engine(&config, Duration::from_millis(500));
    let service = TranscriptionService::start(&config, engines).await?;
    let progress = BatchProgress::start(files.len());

    let mut pending: Vec<(String, JobId)> = Vec::new();
    for path in &files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        match service
            .submit(Upload::new(name.clone(), bytes), options.clone(), CLI_CLIENT)
            .await
        {
            Ok(id) => pending.push((name, id)),
            Err(e @ (ServiceError::Validation(_) | ServiceError::RateLimited { .. })) => {
                progress.rejected(&name, &e.to_string());
            }
            Err(e) => {
                service.shutdown().await;
                return Err(e.into());
            }
        }
    }
    info!(jobs = pending.len(), "batch submitted");

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    let mut cancelling = false;

    while !pending.is_empty() {
        tokio::select! {
            _ = &mut interrupted, if !cancelling => {
                cancelling = true;
                progress.note("interrupted, cancelling remaining jobs");
                for (_, id) in &pending {
                    if let Err(e) = service.cancel(*id, CLI_CLIENT).await {
                        warn!(job_id = %id, error = %e, "cancel failed");
                    }
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let mut still_pending = Vec::with_capacity(pending.len());
        for (name, id) in pending {
            let job = service.inspect(id).await?;
            if !job.status.is_terminal() {
                still_pending.push((name, id));
                continue;
            }
            let stem = Path::new(&name)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| id.to_string());
            write_outputs(out_dir, &stem, &job, format)?;
            progress.finished(&name, &job);
        }
        pending = still_pending;
        progress.update(&service.stats().await?);
    }

    progress.complete(&service.stats().await?);
    service.shutdown().await;
    Ok(())
}

async fn run_demo(mut config: WhisperqConfig, jobs: usize, delay: Duration) -> Result<()> {
    let scratch = std::env::temp_dir().join(format!("whisperq-demo-{}", JobId::new()));
    config.artifacts.dir = scratch.clone();
    config.engine.command = None;

    let engines = move || -> Arc<dyn Engine> { Arc::new(SyntheticEngine::new(delay)) };
    let service = TranscriptionService::start(&config, engines).await?;
    ui::print_json("Health", &service.health());

    let mut ids = Vec::new();
    for n in 0..jobs.max(1) {
        let upload = Upload::new(format!("clip-{n}.wav"), format!("RIFF demo clip {n}").into_bytes());
        let id = service.submit(upload, JobOptions::default(), CLI_CLIENT).await?;
        let view = service.status(id, CLI_CLIENT).await?;
        println!("submitted {id} -> {}", view.status);
        ids.push(id);
    }

    if let Some(last) = ids.last() {
        let outcome = service.cancel(*last, CLI_CLIENT).await?;
        println!("cancel {last} -> {}", serde_json::to_string(&outcome)?);
    }

    let progress = BatchProgress::start(ids.len());
    for id in &ids {
        let job = service
            .wait_for_terminal(*id, Duration::from_millis(50), delay * 10 + Duration::from_secs(5))
            .await?;
        progress.update(&service.stats().await?);
        progress.finished(&id.to_string(), &job);
    }
    progress.complete(&service.stats().await?);

    if let Some(first) = ids.first() {
        match service.result(*first, CLI_CLIENT).await {
            Ok(transcript) => print!("{}", export::to_srt(&transcript)),
            Err(e) => println!("no result for {first}: {e}"),
        }
    }

    ui::print_json("Stats", &service.stats().await?);
    service.shutdown().await;
    if let Err(e) = std::fs::remove_dir_all(&scratch) {
        debug!(dir = %scratch.display(), error = %e, "demo directory left behind");
    }
    Ok(())
}
