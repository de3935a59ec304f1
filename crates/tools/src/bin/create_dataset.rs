use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use coco_dataset::{build, TRAIN_ANNOTATIONS, VAL_ANNOTATIONS};
use coco_seg_tools::ToolConfig;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "create_dataset",
    about = "Rasterize COCO instance masks into trainset/ and testset/ record shards"
)]
struct Args {
    /// Directory holding the train2017 images.
    train_image_dir: PathBuf,
    /// Directory holding the val2017 images.
    test_image_dir: PathBuf,
    /// Directory holding instances_train2017.json and instances_val2017.json.
    annotation_dir: PathBuf,
    /// Worker threads, one shard file each (overrides the config file).
    #[arg(long)]
    workers: Option<usize>,
    /// TOML config (defaults to $SEG_TOOLS_CONFIG or ./seg-tools.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn usage() -> String {
    let prog = std::env::args()
        .next()
        .unwrap_or_else(|| "create_dataset".to_string());
    format!("Usage: {prog} <train image dir> <test image dir> <anno dir>")
}

fn run(args: Args) -> anyhow::Result<()> {
    let cfg = match &args.config {
        Some(path) => ToolConfig::from_path(path)
            .with_context(|| format!("loading tools config {}", path.display()))?,
        None => ToolConfig::load(),
    };
    let mut opts = cfg.build_options();
    if let Some(workers) = args.workers {
        opts.workers = workers;
    }

    let jobs: [(&Path, &str, &Path); 2] = [
        (&args.test_image_dir, VAL_ANNOTATIONS, &cfg.test_output),
        (&args.train_image_dir, TRAIN_ANNOTATIONS, &cfg.train_output),
    ];
    for (image_dir, annotations, output) in jobs {
        let annotation_file = args.annotation_dir.join(annotations);
        let summary = build(image_dir, &annotation_file, output, &opts)
            .with_context(|| format!("building {}", output.display()))?;
        println!(
            "[create_dataset] {}: {} records in {} shards ({} skipped)",
            output.display(),
            summary.records,
            summary.shards.len(),
            summary.skipped
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            eprintln!("{e}");
            println!("{}", usage());
            return ExitCode::from(1);
        }
    };
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("create_dataset: {e:#}");
            ExitCode::from(1)
        }
    }
}
