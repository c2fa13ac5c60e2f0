//! Upscaling CLI
//!
//! Enhances image files or directories through the tiered engine and prints
//! tier availability and configuration diagnostics.

use super::config::CliConfigBuilder;
use crate::backends::{BackendTier, ModelStore};
use crate::config::ConfigStore;
use crate::orchestrator::EnhancementEngine;
use crate::services::{ImageIoService, OutputFormat};
use crate::tracing_config::{init_cli_tracing, spans, TracingFormat};
use crate::types::{ContentHint, UpscaleRequest};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use instant::Instant;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

/// Adaptive image enhancement and super-resolution
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "imgly-upscale")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Input image files or directories
    #[arg(value_name = "INPUT", required_unless_present_any = &["show_backends", "print_config", "validate_config", "reset_config"])]
    pub input: Vec<String>,

    /// Output file (single input) or directory (several inputs)
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: Option<PathBuf>,

    /// Integer upscale factor
    #[arg(short, long, default_value_t = 2)]
    pub scale: u32,

    /// Output format [default: from the output extension, else png]
    #[arg(short, long, value_enum)]
    pub format: Option<CliOutputFormat>,

    /// Content class; inferred from the image when omitted
    #[arg(long, value_enum)]
    pub hint: Option<CliContentHint>,

    /// Maximum tier demotions before the naive fallback
    #[arg(long)]
    pub budget: Option<usize>,

    /// Execution provider for the accelerated tiers (auto, cpu, cuda, coreml)
    #[arg(short, long)]
    pub execution_provider: Option<String>,

    /// Free device memory to assume, in MB
    #[arg(long)]
    pub device_memory_mb: Option<u64>,

    /// How long to wait for a busy device before demoting, in ms
    #[arg(long)]
    pub device_timeout_ms: Option<u64>,

    /// Inference threads (0 = all cores)
    #[arg(short, long, default_value_t = 0)]
    pub threads: usize,

    /// Minimum composite quality score for model output
    #[arg(long)]
    pub min_score: Option<f64>,

    /// Directory holding the ONNX models
    #[arg(long, value_name = "DIR")]
    pub model_dir: Option<PathBuf>,

    /// Configuration file [default: $IMGLY_UPSCALE_CONFIG or the user config dir]
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Images processed concurrently
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Process directories recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// File name pattern for directory inputs (e.g. "*.png")
    #[arg(long)]
    pub pattern: Option<String>,

    /// Print each report as JSON on stdout
    #[arg(long)]
    pub report: bool,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log line format (console, compact, json)
    #[arg(long, default_value = "console")]
    pub log_format: String,

    /// Show which tiers can run on this machine and exit
    #[arg(long)]
    pub show_backends: bool,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    pub print_config: bool,

    /// Validate the configuration file and exit
    #[arg(long)]
    pub validate_config: bool,

    /// Overwrite the configuration file with defaults and exit
    #[arg(long)]
    pub reset_config: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CliOutputFormat {
    Png,
    Jpeg,
    #[cfg(feature = "webp-support")]
    Webp,
    Tiff,
}

impl From<CliOutputFormat> for OutputFormat {
    fn from(format: CliOutputFormat) -> Self {
        match format {
            CliOutputFormat::Png => OutputFormat::Png,
            CliOutputFormat::Jpeg => OutputFormat::Jpeg,
            #[cfg(feature = "webp-support")]
            CliOutputFormat::Webp => OutputFormat::WebP,
            CliOutputFormat::Tiff => OutputFormat::Tiff,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CliContentHint {
    Photo,
    Anime,
    Document,
}

impl From<CliContentHint> for ContentHint {
    fn from(hint: CliContentHint) -> Self {
        match hint {
            CliContentHint::Photo => ContentHint::Photo,
            CliContentHint::Anime => ContentHint::Anime,
            CliContentHint::Document => ContentHint::Document,
        }
    }
}

/// Main entry point for the CLI application
pub async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_format: TracingFormat = cli.log_format.parse().map_err(anyhow::Error::msg)?;
    let _tracing = init_cli_tracing(cli.verbose, log_format).context("Failed to initialize tracing")?;

    let store = match &cli.config {
        Some(path) => ConfigStore::open(path),
        None => ConfigStore::open_default(),
    }
    .context("Failed to open configuration")?;

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&*store.snapshot())?);
        return Ok(());
    }
    if cli.validate_config {
        return validate_config(&store);
    }
    if cli.reset_config {
        store.reset_to_default().context("Failed to reset configuration")?;
        match store.path() {
            Some(path) => println!("♻️  Configuration reset: {}", path.display()),
            None => println!("♻️  Configuration reset"),
        }
        return Ok(());
    }

    CliConfigBuilder::validate_cli(&cli).context("Invalid CLI arguments")?;
    if let Some(patch) = CliConfigBuilder::overrides(&cli)? {
        store
            .apply_override(&patch)
            .context("CLI flags produce an invalid configuration")?;
    }

    let engine = EnhancementEngine::builder()
        .config_store(Arc::new(store))
        .model_store(cli.model_dir.clone().map(ModelStore::new).unwrap_or_default())
        .with_default_backends()
        .build()
        .context("Failed to create enhancement engine")?;

    if cli.show_backends {
        show_backends(&engine).await;
        return Ok(());
    }

    let start = Instant::now();
    let (processed, failed) = process_inputs(&cli, &engine).await?;
    info!(
        processed,
        failed,
        "Processed {processed} image(s) in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    if failed > 0 {
        anyhow::bail!("{failed} image(s) failed");
    }
    Ok(())
}

fn validate_config(store: &ConfigStore) -> Result<()> {
    let loaded = store.load().context("Failed to read configuration")?;
    if loaded.is_clean() {
        println!("✅ Configuration is valid");
        return Ok(());
    }
    println!("❌ Configuration has {} issue(s):", loaded.issues.len());
    for issue in &loaded.issues {
        println!("  • {issue}");
    }
    anyhow::bail!("configuration is invalid")
}

async fn show_backends(engine: &EnhancementEngine) {
    println!("🔍 Tier availability");
    let snapshot = engine.selector().snapshot().await;
    println!(
        "💻 {} CPU threads, device {}",
        snapshot.cpu_threads,
        match (snapshot.device_available, snapshot.free_device_memory_mb) {
            (false, _) => "not available".to_string(),
            (true, Some(mb)) => format!("available ({mb} MB free)"),
            (true, None) => "available (free memory unknown)".to_string(),
        }
    );

    for (tier, status) in engine.tier_availability().await {
        let backend = engine
            .selector()
            .backend(tier)
            .map_or_else(|| "-".to_string(), |b| b.name().to_string());
        match status {
            Ok(()) => println!("  ✅ {tier} ({backend})"),
            Err(reason) => println!("  ❌ {tier} ({backend}): {reason}"),
        }
    }

    println!("\n🚀 Execution providers:");
    #[cfg(feature = "onnx")]
    for (name, available, description) in crate::backends::OnnxSuperResolution::list_providers() {
        let status = if available { "✅" } else { "❌" };
        println!("  • onnx:{name} {status} - {description}");
    }
    #[cfg(feature = "tract")]
    for (name, _, description) in crate::backends::TractSuperResolution::list_providers() {
        println!("  • tract:{name} ✅ - {description}");
    }
    if engine
        .selector()
        .backend(BackendTier::GeneralCompute)
        .is_none()
    {
        println!("\n⚠️  No model backends compiled in; every request uses the naive fallback");
    }
}

/// Expand files and directories into a sorted list of images
fn collect_inputs(cli: &Cli) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in &cli.input {
        let path = PathBuf::from(input);
        if path.is_file() {
            if ImageIoService::is_supported_input(&path) {
                files.push(path);
            } else {
                warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            files.extend(find_image_files(&path, cli.recursive, cli.pattern.as_deref())?);
        } else {
            anyhow::bail!("Input path does not exist: {}", path.display());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn find_image_files(dir: &Path, recursive: bool, pattern: Option<&str>) -> Result<Vec<PathBuf>> {
    let pattern = pattern
        .map(glob::Pattern::new)
        .transpose()
        .context("Invalid --pattern")?;
    let max_depth = if recursive { usize::MAX } else { 1 };

    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).max_depth(max_depth) {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() || !ImageIoService::is_supported_input(path) {
            continue;
        }
        let matches = match (&pattern, path.file_name().and_then(|n| n.to_str())) {
            (Some(pattern), Some(name)) => pattern.matches(name),
            (Some(_), None) => false,
            (None, _) => true,
        };
        if matches {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

/// Output path and encoding for one input
fn destination(cli: &Cli, input: &Path, batch: bool) -> (PathBuf, OutputFormat) {
    let explicit = cli.format.map(OutputFormat::from);
    match (&cli.output, batch) {
        (Some(output), false) => {
            let format = explicit
                .or_else(|| OutputFormat::from_path(output))
                .unwrap_or_default();
            (output.clone(), format)
        },
        (output_dir, _) => {
            let format = explicit.unwrap_or_default();
            (
                ImageIoService::output_path(input, output_dir.as_deref(), cli.scale, format),
                format,
            )
        },
    }
}

async fn process_inputs(cli: &Cli, engine: &EnhancementEngine) -> Result<(usize, usize)> {
    let files = collect_inputs(cli)?;
    if files.is_empty() {
        warn!("No supported image files found in the provided inputs");
        return Ok((0, 0));
    }
    let batch = files.len() > 1;
    if batch {
        if let Some(dir) = &cli.output {
            if dir.is_file() {
                anyhow::bail!("Output path is a file, not a directory: {}", dir.display());
            }
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
        }
    }

    let concurrency = cli
        .concurrency
        .unwrap_or_else(|| engine.config_store().snapshot().engine.batch_concurrency);
    info!("Found {} image file(s) to process", files.len());

    let progress = batch.then(|| {
        let bar = ProgressBar::new(files.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar
    });

    let request_for = |path: &Path| -> Result<UpscaleRequest> {
        let image = ImageIoService::load_image(path)?;
        let mut request = UpscaleRequest::new(image, cli.scale);
        if let Some(hint) = cli.hint {
            request = request.with_content_hint(hint.into());
        }
        if let Some(budget) = cli.budget {
            request = request.with_degradation_budget(budget);
        }
        Ok(request)
    };

    let (mut processed, mut failed) = (0, 0);
    let batch_span = spans::batch(files.len(), concurrency);
    let mut results = stream::iter(&files)
        .map(|path| async move {
            let result = match request_for(path.as_path()) {
                Ok(request) => engine
                    .enhance(request)
                    .instrument(spans::file(path, cli.scale))
                    .await
                    .map_err(anyhow::Error::from),
                Err(e) => Err(e),
            };
            (path, result)
        })
        .buffered(concurrency.max(1));

    while let Some((path, result)) = results.next().instrument(batch_span.clone()).await {
        if let Some(bar) = &progress {
            bar.set_message(path.display().to_string());
            bar.inc(1);
        }
        let outcome = result.and_then(|result| {
            let (output, format) = destination(cli, path, batch);
            ImageIoService::save_image(&result.image, &output, format)?;
            Ok((result, output))
        });
        match outcome {
            Ok((result, output)) => {
                let report = &result.report;
                info!(
                    tier = %report.tier_used,
                    retries = report.retries,
                    score = report.quality_score.composite,
                    "✅ {} -> {}",
                    path.display(),
                    output.display()
                );
                if report.fully_degraded {
                    warn!("⚠️  {} fell back to naive resampling", path.display());
                }
                if cli.report {
                    println!("{}", serde_json::to_string(report)?);
                }
                processed += 1;
            },
            Err(e) => {
                error!("❌ {}: {e:#}", path.display());
                failed += 1;
            },
        }
    }

    if let Some(bar) = progress {
        bar.finish_with_message(format!("{processed} done, {failed} failed"));
    }
    Ok((processed, failed))
}
