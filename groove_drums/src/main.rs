// Groove Drums CLI entry point.
//
// Usage:
//   drums train     [--data DIR] [--models DIR] [--epochs N] [--batch-size N]
//                   [--learning-rate F] [--seed N] [--config FILE]
//   drums generate  [--models DIR] [--threshold F] [--out FILE]
//   drums report    [--data DIR] [--seed N] [--out FILE]
//   drums normalize [--data DIR]
//   drums validate  [--data DIR] [--keep-invalid]
//   drums check     [--data DIR]
//   drums preview   [--data DIR] [--seed N] [--count N]
//
// `--config` loads a TrainingConfig JSON first; explicit flags override it.
// Log verbosity follows RUST_LOG (default `info`). Any error is logged and
// the process exits with status 1.

use groove_drums::codec::{
    ValidateOptions, default_invalid_dir, normalize_dataset, validate_dataset,
};
use groove_drums::dataset::DrumDataset;
use groove_drums::generator::{DEFAULT_THRESHOLD, generate_with};
use groove_drums::readiness::check_readiness;
use groove_drums::registry::ModelRegistry;
use groove_drums::report::{collect_statistics, write_report};
use groove_drums::trainer::{CancelToken, TrainingConfig, train};
use groove_drums::{DrumError, Result};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: drums <train|generate|report|normalize|validate|check|preview> [flags]";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = run(&args) {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let Some(command) = args.get(1) else {
        return Err(DrumError::InvalidConfig(USAGE.to_string()));
    };
    match command.as_str() {
        "train" => cmd_train(args),
        "generate" => cmd_generate(args),
        "report" => cmd_report(args),
        "normalize" => cmd_normalize(args),
        "validate" => cmd_validate(args),
        "check" => cmd_check(args),
        "preview" => cmd_preview(args),
        other => Err(DrumError::InvalidConfig(format!("unknown command '{other}'; {USAGE}"))),
    }
}

fn training_config(args: &[String]) -> Result<TrainingConfig> {
    let mut config = match parse_flag::<PathBuf>(args, "--config") {
        Some(path) => TrainingConfig::load(&path)?,
        None => TrainingConfig::default(),
    };
    if let Some(v) = parse_flag(args, "--data") {
        config.data_root = v;
    }
    if let Some(v) = parse_flag(args, "--models") {
        config.model_root = v;
    }
    if let Some(v) = parse_flag(args, "--epochs") {
        config.epochs = v;
    }
    if let Some(v) = parse_flag(args, "--batch-size") {
        config.batch_size = v;
    }
    if let Some(v) = parse_flag(args, "--learning-rate") {
        config.learning_rate = v;
    }
    if let Some(v) = parse_flag(args, "--seed") {
        config.seed = v;
    }
    config.validate()?;
    Ok(config)
}

fn data_root(args: &[String]) -> PathBuf {
    parse_flag(args, "--data").unwrap_or_else(|| TrainingConfig::default().data_root)
}

fn cmd_train(args: &[String]) -> Result<()> {
    let config = training_config(args)?;
    let outcome = train(config, &CancelToken::new())?;
    if let Some(loss) = outcome.epoch_losses.last() {
        info!(final_loss = loss, "training complete");
    }
    println!("{}", outcome.checkpoint.display());
    Ok(())
}

fn cmd_generate(args: &[String]) -> Result<()> {
    let models: PathBuf =
        parse_flag(args, "--models").unwrap_or_else(|| TrainingConfig::default().model_root);
    let threshold = parse_flag(args, "--threshold").unwrap_or(DEFAULT_THRESHOLD);
    let mut registry = ModelRegistry::new(models)?;
    let pattern = generate_with(&mut registry, threshold)?;
    if registry.active_checkpoint().is_none() {
        warn!("no checkpoint found; pattern comes from an untrained model");
    }
    emit_json(&serde_json::to_string_pretty(&pattern)?, args)
}

fn cmd_report(args: &[String]) -> Result<()> {
    let seed = parse_flag(args, "--seed").unwrap_or(TrainingConfig::default().seed);
    let dataset = DrumDataset::new(data_root(args), seed);
    let report = collect_statistics(&dataset);
    match parse_flag::<PathBuf>(args, "--out") {
        Some(path) => write_report(&report, &path),
        None => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn cmd_normalize(args: &[String]) -> Result<()> {
    let summary = normalize_dataset(&data_root(args));
    info!(
        scanned = summary.scanned,
        changed = summary.changed,
        failed = summary.failed,
        "normalization finished"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_validate(args: &[String]) -> Result<()> {
    let root = data_root(args);
    let options = ValidateOptions {
        relocate: !has_flag(args, "--keep-invalid"),
        invalid_dir: Some(default_invalid_dir(&root)),
    };
    let summary = validate_dataset(&root, &options)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_check(args: &[String]) -> Result<()> {
    let root = data_root(args);
    let report = check_readiness(&root);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.ready {
        Ok(())
    } else {
        Err(DrumError::InvalidConfig(format!("dataset at {} is not ready", root.display())))
    }
}

fn cmd_preview(args: &[String]) -> Result<()> {
    let seed = parse_flag(args, "--seed").unwrap_or(TrainingConfig::default().seed);
    let count: usize = parse_flag(args, "--count").unwrap_or(1);
    let dataset = DrumDataset::new(data_root(args), seed);
    for index in 0..count.min(dataset.len()) {
        match dataset.files().get(index) {
            Some(path) => println!("== {} ==", path.display()),
            None => println!("== synthetic sample {index} =="),
        }
        print!("{}", dataset.get(index));
    }
    Ok(())
}

fn emit_json(json: &str, args: &[String]) -> Result<()> {
    match parse_flag::<PathBuf>(args, "--out") {
        Some(path) => write_text(&path, json),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, text)?;
    info!(path = %path.display(), "wrote output");
    Ok(())
}

fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
