use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, ensure, Context, Result};
use chrono::{Datelike, Local, Utc};
use clap::{Args, Parser, Subcommand};
use ndarray::Axis;
use precip_pipeline::{
    compute_predictor_table, compute_target_table, count_examples,
    metadata::{find_metadata, metadata_path_for},
    read_metadata,
    training::{DenseRegressor, TrainingOrchestrator, TrainingPlan},
    write_metadata, BatchGenerator, ImageReader, ImageRecord, ModelMetadata, NpzImageReader,
    PipelineConfig, PipelineTelemetry, TargetPoints,
};
use serde_json::json;
use shared_logging::LogLevel;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "trn", version, about = "Precipitation CNN data pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Root of the dated JSON-lines run logs.
    #[arg(long, global = true, default_value = "PRECIP/logs")]
    log_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Computes normalization tables over a corpus and writes them as model metadata.
    Stats {
        #[command(flatten)]
        corpus: CorpusArgs,
        /// Metadata output path.
        #[arg(long)]
        output: PathBuf,
        /// Training batches per epoch recorded in the metadata.
        #[arg(long, default_value_t = 32)]
        batches_per_epoch: usize,
    },
    /// Counts examples over a corpus.
    Count {
        #[command(flatten)]
        corpus: CorpusArgs,
    },
    /// Pulls batches from a generator and prints their shapes and channel means.
    Preview {
        #[command(flatten)]
        corpus: CorpusArgs,
        /// Metadata file holding the normalization tables.
        #[arg(long)]
        metadata: PathBuf,
        /// Batches to draw.
        #[arg(long, default_value_t = 3)]
        batches: usize,
    },
    /// Prints a metadata file, or the metadata beside a model.
    Show {
        /// Metadata file or model artifact.
        path: PathBuf,
    },
    /// Trains the dense baseline regressor with tables from a metadata file.
    Train {
        #[command(flatten)]
        corpus: CorpusArgs,
        /// Metadata file holding the normalization tables.
        #[arg(long)]
        metadata: PathBuf,
        /// Validation files.
        #[arg(long, num_args = 1..)]
        validation: Vec<PathBuf>,
        /// Model artifact path.
        #[arg(long)]
        model: PathBuf,
        #[arg(long, default_value_t = 10)]
        epochs: usize,
        #[arg(long, default_value_t = 32)]
        batches_per_epoch: usize,
        #[arg(long, default_value_t = 16)]
        validation_batches: usize,
        #[arg(long, default_value_t = 0.001)]
        learning_rate: f32,
    },
}

#[derive(Args, Debug)]
struct CorpusArgs {
    /// Source files.
    #[arg(long, num_args = 1..)]
    files: Vec<PathBuf>,
    /// Directory whose `.npz`/`.nc` files are added to the corpus.
    #[arg(long)]
    dir: Option<PathBuf>,
    /// JSON pipeline configuration; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Examples per batch, overriding the configuration.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Generator seed, overriding the configuration.
    #[arg(long)]
    seed: Option<u64>,
}

impl CorpusArgs {
    fn config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path).with_context(|| format!("loading config {path:?}"))?,
            None => PipelineConfig::default(),
        };
        if let Some(batch_size) = self.batch_size {
            config = config.with_batch_size(batch_size);
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        config.validate()?;
        Ok(config)
    }

    fn paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = self.files.clone();
        if let Some(dir) = &self.dir {
            let mut listed = Vec::new();
            for entry in fs::read_dir(dir).with_context(|| format!("listing {dir:?}"))? {
                let path = entry?.path();
                if matches!(path.extension().and_then(OsStr::to_str), Some("npz" | "nc")) {
                    listed.push(path);
                }
            }
            listed.sort();
            paths.extend(listed);
        }
        ensure!(!paths.is_empty(), "no source files given (use --files or --dir)");
        Ok(paths)
    }
}

/// Dispatches on file extension: `.nc` to NetCDF, everything else to npz.
struct SourceReader {
    npz: NpzImageReader,
    #[cfg(feature = "netcdf")]
    netcdf: precip_pipeline::netcdf_reader::NetcdfImageReader,
}

impl SourceReader {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            npz: NpzImageReader::new(config),
            #[cfg(feature = "netcdf")]
            netcdf: precip_pipeline::netcdf_reader::NetcdfImageReader::new(config),
        }
    }
}

impl ImageReader for SourceReader {
    fn read(&self, path: &Path, points: Option<&TargetPoints>) -> precip_pipeline::Result<ImageRecord> {
        match path.extension().and_then(OsStr::to_str) {
            #[cfg(feature = "netcdf")]
            Some("nc") => self.netcdf.read(path, points),
            #[cfg(not(feature = "netcdf"))]
            Some("nc") => Err(precip_pipeline::PipelineError::FileFormat {
                path: path.to_path_buf(),
                reason: "NetCDF support requires the `netcdf` feature".into(),
            }),
            _ => self.npz.read(path, points),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let run_id = Uuid::new_v4();
    let log_path = compute_log_path(&cli.log_dir, run_id)?;
    let telemetry = PipelineTelemetry::builder("trn").log_path(&log_path).build()?;
    telemetry.log(
        LogLevel::Info,
        "run_started",
        json!({ "run_id": run_id, "command": format!("{:?}", cli.command) }),
    )?;

    let outcome = dispatch(cli.command, &telemetry);
    match &outcome {
        Ok(()) => telemetry.log(LogLevel::Info, "run_finished", json!({ "run_id": run_id }))?,
        Err(err) => telemetry.log(
            LogLevel::Error,
            "run_failed",
            json!({ "run_id": run_id, "error": format!("{err:#}") }),
        )?,
    }
    outcome
}

fn dispatch(command: Commands, telemetry: &PipelineTelemetry) -> Result<()> {
    match command {
        Commands::Stats {
            corpus,
            output,
            batches_per_epoch,
        } => handle_stats(&corpus, &output, batches_per_epoch, telemetry),
        Commands::Count { corpus } => {
            let config = corpus.config()?;
            let paths = corpus.paths()?;
            let reader = SourceReader::new(&config);
            let total = count_examples(&reader, &paths, config.target_points.as_ref())?;
            println!("{total} examples in {} files", paths.len());
            Ok(())
        }
        Commands::Preview {
            corpus,
            metadata,
            batches,
        } => handle_preview(&corpus, &metadata, batches, telemetry),
        Commands::Show { path } => {
            let metadata_path = if path.extension().and_then(OsStr::to_str) == Some("json")
                && path.to_string_lossy().ends_with("_metadata.json")
            {
                path
            } else {
                find_metadata(&path, true)?
            };
            let metadata = read_metadata(&metadata_path)?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            Ok(())
        }
        Commands::Train {
            corpus,
            metadata,
            validation,
            model,
            epochs,
            batches_per_epoch,
            validation_batches,
            learning_rate,
        } => {
            let plan = TrainingPlan {
                num_epochs: epochs,
                num_training_batches_per_epoch: batches_per_epoch,
                num_validation_batches_per_epoch: validation_batches,
                model_path: model,
                ..TrainingPlan::default()
            };
            handle_train(&corpus, &metadata, validation, plan, learning_rate, telemetry)
        }
    }
}

fn handle_stats(
    corpus: &CorpusArgs,
    output: &Path,
    batches_per_epoch: usize,
    telemetry: &PipelineTelemetry,
) -> Result<()> {
    let config = corpus.config()?;
    let paths = corpus.paths()?;
    let reader = SourceReader::new(&config);
    let predictor_table = compute_predictor_table(&reader, &paths, &config, Some(telemetry))?;
    let target_table = compute_target_table(&reader, &paths, &config, Some(telemetry))?;
    let metadata = ModelMetadata::new(
        paths,
        &predictor_table,
        &target_table,
        config.num_examples_per_batch,
        batches_per_epoch,
    );
    write_metadata(&metadata, output)?;
    for (name, entry) in predictor_table.iter().chain(target_table.iter()) {
        let [a, b] = entry.to_pair();
        println!("{name:>10}  {a:>14.6}  {b:>14.6}");
    }
    println!("wrote {}", output.display());
    Ok(())
}

fn generator(
    config: &PipelineConfig,
    paths: Vec<PathBuf>,
    metadata: &ModelMetadata,
    label: &str,
    telemetry: &PipelineTelemetry,
) -> Result<BatchGenerator<SourceReader>> {
    let generator = BatchGenerator::new(
        SourceReader::new(config),
        paths,
        Some(Arc::new(metadata.predictor_table())),
        Some(Arc::new(metadata.target_table())),
        config.clone(),
    )?;
    Ok(generator.with_label(label).with_telemetry(telemetry.clone()))
}

fn handle_preview(
    corpus: &CorpusArgs,
    metadata_path: &Path,
    batches: usize,
    telemetry: &PipelineTelemetry,
) -> Result<()> {
    let config = corpus.config()?;
    let metadata = read_metadata(metadata_path)?;
    let mut generator = generator(&config, corpus.paths()?, &metadata, "preview", telemetry)?;
    for index in 0..batches {
        let batch = generator.next_batch()?;
        let means: Vec<String> = config
            .predictor_names
            .iter()
            .enumerate()
            .map(|(channel, name)| {
                let mean = batch.predictors.index_axis(Axis(3), channel).mean().unwrap_or(f32::NAN);
                format!("{name}={mean:.4}")
            })
            .collect();
        println!(
            "batch {index}: predictors {:?} targets {:?} target mean {:.4} | {}",
            batch.predictors.shape(),
            batch.targets.shape(),
            batch.targets.mean().unwrap_or(f32::NAN),
            means.join(" ")
        );
    }
    Ok(())
}

fn handle_train(
    corpus: &CorpusArgs,
    metadata_path: &Path,
    validation: Vec<PathBuf>,
    plan: TrainingPlan,
    learning_rate: f32,
    telemetry: &PipelineTelemetry,
) -> Result<()> {
    let config = corpus.config()?;
    let metadata = read_metadata(metadata_path)?;
    if metadata_path == metadata_path_for(&plan.model_path) {
        bail!("table metadata {metadata_path:?} would be overwritten by the training run");
    }
    let training = generator(&config, corpus.paths()?, &metadata, "training", telemetry)?;
    let first = training
        .file_order()
        .first()
        .context("training corpus is empty")?
        .clone();
    let probe = SourceReader::new(&config).read(&first, config.target_points.as_ref())?;
    let (_, rows, cols, channels) = probe.predictors.dim();
    let mut model = DenseRegressor::new(rows * cols * channels, probe.targets.ncols(), learning_rate, config.seed);

    let mut orchestrator = TrainingOrchestrator::new(plan, training)?.with_telemetry(telemetry.clone());
    if !validation.is_empty() {
        orchestrator = orchestrator.with_validation(generator(&config, validation, &metadata, "validation", telemetry)?)?;
    }
    let history = orchestrator.run(&mut model)?;
    for record in &history.epochs {
        println!(
            "epoch {:>3}  loss {:.5}  val_loss {}  {}",
            record.epoch,
            record.training_loss,
            record.validation_loss.map_or_else(|| "-".into(), |loss| format!("{loss:.5}")),
            if record.checkpoint_saved { "saved" } else { "" }
        );
    }
    if history.stopped_early {
        println!("stopped early");
    }
    Ok(())
}

fn compute_log_path(base: &Path, run_id: Uuid) -> Result<PathBuf> {
    let now = Local::now();
    let dir = base
        .join(format!("{:04}", now.year()))
        .join(format!("{:02}", now.month()))
        .join(format!("{:02}", now.day()));
    fs::create_dir_all(&dir).with_context(|| format!("creating log dir {dir:?}"))?;
    Ok(dir.join(format!(
        "trn-{}-{}.log.jsonl",
        Utc::now().format("%Y%m%d-%H%M%S"),
        &run_id.simple().to_string()[..8]
    )))
}
