use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::backend::Autodiff;
use clap::Parser;
use coco_dataset::{AugmentPipelineBuilder, DatasetManifest, SampleStream, StreamConfig, MANIFEST_FILE};

use crate::config::{StopCheck, TrainConfig};
use crate::trainer::{default_optimizer, TrainReport, Trainer};
use crate::TrainBackend;

#[derive(Parser, Debug, Default)]
#[command(
    name = "train",
    about = "Train the COCO segmenter on the shards in trainset/ and testset/"
)]
pub struct TrainArgs {
    /// TOML config (defaults to $SEG_TRAIN_CONFIG or ./seg-train.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub train_dir: Option<PathBuf>,
    #[arg(long)]
    pub test_dir: Option<PathBuf>,
    /// Directory holding checkpoint.json, snapshots and summaries.jsonl.
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Output path of the exported model bundle.
    #[arg(long)]
    pub export_path: Option<PathBuf>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Stop after this many applied steps even if the loss is still high.
    #[arg(long)]
    pub max_steps: Option<u64>,
    /// Steps between checkpoint + evaluation.
    #[arg(long)]
    pub checkpoint_every: Option<u64>,
    #[arg(long, value_enum)]
    pub stop_check: Option<StopCheck>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Side length of the augmented training crops.
    #[arg(long)]
    pub output_size: Option<u32>,
}

impl TrainArgs {
    pub fn resolve(&self) -> anyhow::Result<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::from_path(path)?,
            None => TrainConfig::load()?,
        };
        if let Some(v) = &self.train_dir {
            cfg.train_dir = v.clone();
        }
        if let Some(v) = &self.test_dir {
            cfg.test_dir = v.clone();
        }
        if let Some(v) = &self.checkpoint_dir {
            cfg.checkpoint_dir = v.clone();
        }
        if let Some(v) = &self.export_path {
            cfg.export_path = v.clone();
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.max_steps {
            cfg.max_steps = Some(v);
        }
        if let Some(v) = self.checkpoint_every {
            cfg.checkpoint_every = v;
        }
        if let Some(v) = self.stop_check {
            cfg.stop_check = v;
        }
        if let Some(v) = self.seed {
            cfg.seed = Some(v);
        }
        if let Some(v) = self.output_size {
            cfg.output_size = v;
        }
        Ok(cfg)
    }
}

/// Opens the train or test stream for `dir` with the training augmentation.
pub fn open_stream(dir: &Path, cfg: &TrainConfig, seed_offset: u64) -> anyhow::Result<SampleStream> {
    let pipeline = AugmentPipelineBuilder::new()
        .output_size(cfg.output_size)
        .build();
    let stream_cfg = StreamConfig {
        prefetch: cfg.prefetch.max(1),
        decode_workers: cfg.decode_workers.max(1),
        shuffle_buffer: cfg.shuffle_buffer.unwrap_or(cfg.batch_size).max(1),
        seed: cfg.seed.map(|s| s.wrapping_add(seed_offset)),
    };
    let stream = SampleStream::open(dir, pipeline, &stream_cfg)
        .map_err(|e| anyhow::anyhow!("failed to open shards in {}: {e}", dir.display()))?;
    Ok(stream)
}

/// Checks shard checksums against `manifest.json` and rejects corpora whose labels cannot be
/// represented by the model's class count. Directories without a manifest pass unchecked.
pub fn check_corpus(dir: &Path, num_classes: usize) -> anyhow::Result<()> {
    let path = dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(());
    }
    let manifest = DatasetManifest::load(&path)?;
    manifest
        .verify(dir)
        .with_context(|| format!("verifying shards in {}", dir.display()))?;
    if manifest.max_label as usize >= num_classes {
        anyhow::bail!(
            "{} declares labels up to {} but the model has {} classes",
            path.display(),
            manifest.max_label,
            num_classes
        );
    }
    Ok(())
}

type ADBackend = Autodiff<TrainBackend>;

pub fn train_with_config(cfg: TrainConfig) -> anyhow::Result<TrainReport> {
    check_corpus(&cfg.train_dir, cfg.num_classes)?;
    check_corpus(&cfg.test_dir, cfg.num_classes)?;
    let train = open_stream(&cfg.train_dir, &cfg, 0)?;
    let test = open_stream(&cfg.test_dir, &cfg, 1)?;
    println!(
        "[train] {} train shards, {} test shards, batch {}, output {}px",
        train.shard_count(),
        test.shard_count(),
        cfg.batch_size.max(1),
        train.output_size()
    );
    let device = <ADBackend as burn::tensor::backend::Backend>::Device::default();
    let mut trainer = Trainer::<ADBackend, _>::new(cfg, default_optimizer::<ADBackend>(), device)?;
    trainer.run(&train, &test)
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let cfg = args.resolve()?;
    let report = train_with_config(cfg)?;
    println!(
        "[train] finished after {} steps ({} skipped): {:?}",
        report.steps, report.skipped, report.reason
    );
    Ok(())
}
