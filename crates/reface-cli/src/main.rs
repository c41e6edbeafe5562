use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reface_core::RgbBuffer;
use reface_pipeline::{
    report, BatchConfig, BatchOrchestrator, CancelHandle, PairOutcome, PipelineConfig, SwapEngine,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "reface", about = "Face-swap pipeline CLI")]
struct Cli {
    /// Optional TOML pipeline configuration file. Without it, settings come
    /// from REFACE_* environment variables.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Swap one source face into one target image
    Swap {
        /// Source face image
        #[arg(short, long)]
        source: PathBuf,
        /// Target image
        #[arg(short, long)]
        target: PathBuf,
        /// Output image path
        #[arg(short, long)]
        output: PathBuf,
        /// Print the report as JSON instead of key: value text
        #[arg(long)]
        json: bool,
    },
    /// Process a manifest of source/target pairs
    Batch {
        /// Manifest file: one "source_path target_path" pair per line
        #[arg(short, long)]
        manifest: PathBuf,
        /// Directory for composited outputs (pair_<index>.png)
        #[arg(short, long)]
        output_dir: PathBuf,
        /// Execution mode: sequential, parallel or adaptive
        #[arg(long)]
        execution: Option<String>,
        /// Worker bound for parallel execution
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Probe and list the available detection backends
    Backends,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let pipeline_config = load_pipeline_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Swap {
            source,
            target,
            output,
            json,
        } => run_swap(pipeline_config, &source, &target, &output, json),
        Commands::Batch {
            manifest,
            output_dir,
            execution,
            workers,
        } => run_batch(pipeline_config, &manifest, &output_dir, execution, workers).await,
        Commands::Backends => {
            let detector = reface_core::EnsembleDetector::probe(
                pipeline_config.scrfd_model.as_deref(),
                pipeline_config.seeta_model.as_deref(),
            );
            let available = detector.available();
            for kind in &available {
                println!("{kind}: available");
            }
            if available.is_empty() {
                println!(
                    "no detection backend available; set REFACE_SCRFD_MODEL or REFACE_SEETA_MODEL"
                );
            }
            Ok(())
        }
    }
}

/// TOML file when given, environment variables otherwise.
fn load_pipeline_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: PipelineConfig = toml::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?;
            Ok(config)
        }
        None => Ok(PipelineConfig::from_env()),
    }
}

fn run_swap(
    config: PipelineConfig,
    source: &Path,
    target: &Path,
    output: &Path,
    json: bool,
) -> Result<()> {
    let source_img = load_image(source)?;
    let target_img = load_image(target)?;

    let engine = SwapEngine::from_config(config);
    match engine.swap(&source_img, &target_img) {
        Ok(result) => {
            save_image(&result.image, output)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report::render_pair_json(&result))?
                );
            } else {
                println!("{}", report::render_pair_text(&result));
            }
            tracing::info!(output = %output.display(), "composite written");
            Ok(())
        }
        Err(failure) => {
            eprintln!("{}", report::render_failure_text(&failure));
            anyhow::bail!("swap failed at stage {}", failure.stage)
        }
    }
}

async fn run_batch(
    config: PipelineConfig,
    manifest: &Path,
    output_dir: &Path,
    execution: Option<String>,
    workers: Option<usize>,
) -> Result<()> {
    let pairs = load_manifest(manifest)?;
    anyhow::ensure!(!pairs.is_empty(), "manifest {} is empty", manifest.display());
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let mut batch_config = BatchConfig::from_env();
    if let Some(execution) = execution {
        batch_config.execution = execution.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    }
    if let Some(workers) = workers {
        batch_config.workers = workers.max(1);
    }

    let engine = Arc::new(SwapEngine::from_config(config));
    let orchestrator = BatchOrchestrator::new(engine, batch_config);
    let outcome = orchestrator.run(pairs, CancelHandle::new()).await;

    for item in &outcome.items {
        if let PairOutcome::Completed(result) = &item.outcome {
            let path = output_dir.join(format!("pair_{}.png", item.index));
            save_image(&result.image, &path)?;
        }
    }

    println!("{}", report::render_batch_text(&outcome));
    if outcome.completed() == 0 {
        anyhow::bail!("no pair completed");
    }
    Ok(())
}

/// Parse a manifest of whitespace-separated source/target paths, loading
/// every referenced image up front. `#` lines are comments.
fn load_manifest(path: &Path) -> Result<Vec<(RgbBuffer, RgbBuffer)>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;

    let mut pairs = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(source), Some(target)) = (parts.next(), parts.next()) else {
            anyhow::bail!("manifest line {}: expected 'source target'", lineno + 1);
        };
        pairs.push((load_image(Path::new(source))?, load_image(Path::new(target))?));
    }
    Ok(pairs)
}

fn load_image(path: &Path) -> Result<RgbBuffer> {
    let img = image::open(path)
        .with_context(|| format!("loading image {}", path.display()))?
        .to_rgb8();
    Ok(RgbBuffer::from_rgb_image(&img))
}

fn save_image(buffer: &RgbBuffer, path: &Path) -> Result<()> {
    buffer
        .to_rgb_image()
        .save(path)
        .with_context(|| format!("writing image {}", path.display()))
}
