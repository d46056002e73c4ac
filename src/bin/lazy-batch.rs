// src/bin/lazy-batch.rs
//
// Command-line front end: one job per root, progress on stderr, summary on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use lazy_batch::{
    BatchConfig, BatchManager, BatchTotals, EventBuffer, ImageConverter, Job, JobSpec,
    OutputFormat, TaskResult,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "Convert large photo libraries in bounded memory", long_about = None)]
struct Cli {
    /// Directories to convert, one job each, in order
    #[arg(required = true)]
    roots: Vec<PathBuf>,

    /// Output format (jpeg, png, webp)
    #[arg(short, long)]
    format: Option<String>,

    /// Encoder quality 0-100
    #[arg(short, long)]
    quality: Option<u8>,

    /// Write outputs below this directory instead of next to each source
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Do not mirror the source tree below --output-dir
    #[arg(long)]
    flatten: bool,

    /// Drop EXIF/ICC metadata
    #[arg(long)]
    no_metadata: bool,

    /// Move each successfully converted source into the trash directory
    #[arg(long)]
    retire: bool,

    /// Where retired sources go
    #[arg(long)]
    trash_dir: Option<PathBuf>,

    /// Source extensions to pick up (repeatable)
    #[arg(short, long = "ext")]
    extensions: Vec<String>,

    /// Worker threads (1-32)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum number of queued, unclaimed tasks
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// JSON settings file; missing file means defaults
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Write the effective settings back to --settings
    #[arg(long, requires = "settings")]
    save_settings: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn config(&self) -> Result<BatchConfig> {
        let mut config = match &self.settings {
            Some(path) => BatchConfig::load(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?,
            None => BatchConfig::default(),
        }
        .with_env_overrides();

        if let Some(format) = &self.format {
            config.conversion.format = OutputFormat::parse(format)?;
        }
        if let Some(quality) = self.quality {
            config.conversion.quality = quality;
        }
        if self.output_dir.is_some() {
            config.output_dir = self.output_dir.clone();
        }
        if self.flatten {
            config.preserve_structure = false;
        }
        if self.no_metadata {
            config.conversion.preserve_metadata = false;
        }
        if self.retire {
            config.conversion.retire_source = true;
        }
        if self.trash_dir.is_some() {
            config.trash_dir = self.trash_dir.clone();
        }
        if !self.extensions.is_empty() {
            config.extensions = self.extensions.clone();
        }
        if let Some(workers) = self.workers {
            config.pool.workers = workers;
        }
        if let Some(capacity) = self.queue_capacity {
            config.pool.queue_capacity = capacity;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Serialize)]
struct Summary<'a> {
    jobs: &'a [Job],
    totals: &'a BatchTotals,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

/// Returns false when any task or job failed.
fn run(cli: Cli) -> Result<bool> {
    let config = cli.config()?;
    if cli.save_settings {
        if let Some(path) = &cli.settings {
            config
                .save(path)
                .with_context(|| format!("failed to save settings to {}", path.display()))?;
        }
    }

    for ext in config
        .extensions
        .iter()
        .filter(|ext| !ImageConverter::decodes_extension(ext))
    {
        warn!(
            extension = %ext,
            "no decoder for this extension in this build; matching files will fail"
        );
    }

    let events = Arc::new(EventBuffer::new(config.event_capacity));
    let batch = BatchManager::from_config(&config, Arc::new(ImageConverter), events.clone())?;
    for root in &cli.roots {
        batch.add_job(JobSpec::from_config(root, &config))?;
    }

    info!(
        jobs = cli.roots.len(),
        workers = config.pool.workers,
        format = config.conversion.format.as_str(),
        "starting batch"
    );
    batch.start()?;

    let mut last_report = Instant::now();
    let mut latest: Option<TaskResult> = None;
    while !batch.wait_timeout(Duration::from_millis(100)) {
        while let Some(result) = events.try_recv() {
            latest = Some(result);
        }
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            report_progress(&batch, latest.as_ref());
            last_report = Instant::now();
        }
    }
    batch.wait();
    if events.dropped() > 0 {
        warn!(dropped = events.dropped(), "progress events were dropped");
    }

    let jobs = batch.jobs();
    let totals = batch.totals();
    if cli.json {
        let summary = Summary {
            jobs: &jobs,
            totals: &totals,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&jobs, &totals);
    }
    Ok(!totals.has_failures())
}

fn report_progress(batch: &BatchManager, latest: Option<&TaskResult>) {
    let Some(job) = batch.current_job().and_then(|id| batch.job(id)) else {
        return;
    };
    let stats = &job.stats;
    let eta = stats
        .eta()
        .map(|eta| format!("{}s", eta.as_secs()))
        .unwrap_or_else(|| "?".to_string());
    let last = latest
        .and_then(|result| result.source.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    eprintln!(
        "[{}] {}/{} done, {} failed, {:.1}/s, eta {}  {}",
        job.spec.root.display(),
        stats.completed(),
        stats.submitted,
        stats.failed,
        stats.throughput(),
        eta,
        last
    );
}

fn print_summary(jobs: &[Job], totals: &BatchTotals) {
    for job in jobs {
        let line = format!(
            "{:<10} {}  found {} ({} bytes)  ok {}  failed {}  skipped {}",
            job.status.as_str(),
            job.spec.root.display(),
            job.scan.files,
            job.scan.bytes,
            job.stats.succeeded,
            job.stats.failed,
            job.stats.skipped,
        );
        match &job.error {
            Some(error) => println!("{line}  ({error})"),
            None => println!("{line}"),
        }
        for error in &job.scan.errors {
            println!("  scan: {error}");
        }
    }
    let stats = &totals.stats;
    println!(
        "total: {} converted, {} failed ({} cancelled), {:.1}% success, {} bytes saved",
        stats.succeeded,
        stats.failed,
        stats.cancelled,
        totals.success_rate() * 100.0,
        stats.bytes_saved()
    );
}
