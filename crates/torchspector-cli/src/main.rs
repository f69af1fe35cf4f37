//! TorchSpector CLI - inspect, merge and edit model checkpoints.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use torchspector_core::{
    load_checkpoint, remove_nested_key, save_checkpoint, Device, DisplayTree, Mapping,
};
use torchspector_merge::{
    run_ratio_merge, FileLoader, MatchWords, MergeOutput, RatioMergeConfig, RatioMergeJob,
};
use tracing::{info, warn};

/// Root merged when neither `--roots` nor a config names one.
const DEFAULT_ROOT: &str = "state_dict";

#[derive(Debug, Parser)]
#[command(name = "torchspector")]
#[command(author, version, about = "Inspect, merge and edit model checkpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the structure of a checkpoint
    Inspect {
        /// Checkpoint file (.safetensors, .pt, .pth, .ckpt, .bin)
        file: PathBuf,

        /// Print display nodes as JSON
        #[arg(long)]
        json: bool,

        /// Hide entries nested deeper than this (top level is 0)
        #[arg(long)]
        max_depth: Option<usize>,
    },

    /// Ratio-merge checkpoints into one
    Merge {
        /// Checkpoints to merge, in order
        #[arg(required_unless_present = "config")]
        checkpoints: Vec<PathBuf>,

        /// Weight per checkpoint (repeat once per checkpoint; default 1/N)
        #[arg(short, long = "alpha")]
        alphas: Vec<f32>,

        /// Comma-separated key filters; a key is merged when it contains any of them
        #[arg(short, long)]
        matchwords: Option<String>,

        /// Comma-separated root sections to merge, or ALL for the whole checkpoint [default: state_dict]
        #[arg(short, long)]
        roots: Option<String>,

        /// Device hint passed to the loader (cpu, cuda, cuda:N, mps) [default: cpu]
        #[arg(short, long)]
        device: Option<Device>,

        /// YAML merge configuration (replaces the options above)
        #[arg(
            short,
            long,
            conflicts_with_all = ["checkpoints", "alphas", "matchwords", "roots", "device"]
        )]
        config: Option<PathBuf>,

        /// Where to save the merged checkpoint (.safetensors)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the merged tree
        #[arg(long)]
        preview: bool,

        /// Print the preview as JSON
        #[arg(long, requires = "preview")]
        json: bool,
    },

    /// Remove an entry by display path and save the result
    Remove {
        /// Checkpoint file to edit
        file: PathBuf,

        /// Path to the entry, e.g. state_dict/layer.weight
        path: String,

        /// Where to save the edited checkpoint (.safetensors)
        #[arg(short, long)]
        output: PathBuf,

        /// Path segment separator
        #[arg(long, default_value = "/")]
        separator: String,
    },

    /// Load a checkpoint and save it in the format chosen by the output extension
    Convert {
        /// Input checkpoint
        input: PathBuf,

        /// Output checkpoint (.safetensors)
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so tree and JSON output stay clean on stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect {
            file,
            json,
            max_depth,
        } => {
            let checkpoint = load_checkpoint(&file, &Device::Cpu)
                .with_context(|| format!("Failed to load {}", file.display()))?;
            print_tree(&checkpoint, json, max_depth)?;
        }

        Commands::Merge {
            checkpoints,
            alphas,
            matchwords,
            roots,
            device,
            config,
            output,
            preview,
            json,
        } => {
            let (job, output) = match config {
                Some(path) => {
                    let config = RatioMergeConfig::from_yaml_file(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    let job = config.to_job()?;
                    (job, output.or(config.output_path))
                }
                None => {
                    let alphas = (!alphas.is_empty()).then_some(alphas);
                    let matchwords = matchwords
                        .as_deref()
                        .map(MatchWords::parse_list)
                        .unwrap_or_default();
                    let roots = split_list(roots.as_deref().unwrap_or(DEFAULT_ROOT));
                    let job = RatioMergeJob::new(
                        checkpoints,
                        alphas,
                        matchwords,
                        device.unwrap_or_default(),
                        &roots,
                    )?;
                    (job, output)
                }
            };

            let merged = run_merge(&job)?;

            if let Some(path) = &output {
                save_checkpoint(&merged.merged, path)
                    .with_context(|| format!("Failed to save {}", path.display()))?;
                info!("Merged checkpoint saved to {}", path.display());
            }
            if preview || output.is_none() {
                print_tree(&merged.merged, json, None)?;
            }
        }

        Commands::Remove {
            file,
            path,
            output,
            separator,
        } => {
            let mut checkpoint = load_checkpoint(&file, &Device::Cpu)
                .with_context(|| format!("Failed to load {}", file.display()))?;
            let segments = split_path(&path, &separator);
            if !remove_nested_key(&mut checkpoint, &segments) {
                bail!("Nothing to remove at '{}' in {}", path, file.display());
            }
            save_checkpoint(&checkpoint, &output)
                .with_context(|| format!("Failed to save {}", output.display()))?;
            info!("Removed '{}', saved to {}", path, output.display());
        }

        Commands::Convert { input, output } => {
            convert(&input, &output)?;
        }
    }

    Ok(())
}

fn run_merge(job: &RatioMergeJob) -> anyhow::Result<MergeOutput> {
    println!("========================================");
    println!("  TorchSpector Ratio Merge");
    println!("========================================");
    for (i, (path, alpha)) in job.checkpoints().iter().zip(job.alphas()).enumerate() {
        println!("Checkpoint {}: {} (alpha {})", i + 1, path.display(), alpha);
    }
    let roots: Vec<String> = job.roots().iter().map(ToString::to_string).collect();
    println!("Roots:      {}", roots.join(", "));
    if !job.matchwords().is_empty() {
        println!("Matchwords: {}", job.matchwords().words().join(", "));
    }
    println!("Device:     {}", job.device());
    println!("========================================\n");

    let output = run_ratio_merge(&FileLoader::new(), job)?;
    if !output.warnings.is_empty() {
        warn!(
            "{} keys were missing from earlier checkpoints and carry partial sums",
            output.warnings.len()
        );
    }
    Ok(output)
}

fn convert(input: &Path, output: &Path) -> anyhow::Result<()> {
    let checkpoint = load_checkpoint(input, &Device::Cpu)
        .with_context(|| format!("Failed to load {}", input.display()))?;
    save_checkpoint(&checkpoint, output)
        .with_context(|| format!("Failed to save {}", output.display()))?;
    info!("Converted {} to {}", input.display(), output.display());
    Ok(())
}

fn print_tree(checkpoint: &Mapping, json: bool, max_depth: Option<usize>) -> anyhow::Result<()> {
    let tree = DisplayTree::build(checkpoint);
    if json {
        println!("{}", tree.to_json()?);
    } else {
        print!("{}", tree.render_text(max_depth));
    }
    Ok(())
}

/// Split a comma-separated list, dropping empty items.
fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split a display path into segments, dropping empty ones.
fn split_path<'a>(path: &'a str, separator: &str) -> Vec<&'a str> {
    path.split(separator).filter(|s| !s.is_empty()).collect()
}
