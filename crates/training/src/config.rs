use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::schedule::ExponentialDecay;

const DEFAULT_CONFIG_NAME: &str = "seg-train.toml";
const CONFIG_ENV: &str = "SEG_TRAIN_CONFIG";

/// Which training-loss value the termination check reads at an evaluation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StopCheck {
    /// Average training loss of the interval that just finished.
    #[default]
    BeforeReset,
    /// Value after the metrics were reset (always 0); stops at the first evaluation.
    AfterReset,
}

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub train_dir: PathBuf,
    pub test_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub export_path: PathBuf,
    pub in_channels: usize,
    pub num_classes: usize,
    pub hidden: usize,
    pub dilations: Vec<usize>,
    pub batch_size: usize,
    pub schedule: ExponentialDecay,
    pub checkpoint_every: u64,
    pub eval_batches: usize,
    pub loss_threshold: f32,
    pub stop_check: StopCheck,
    pub max_steps: Option<u64>,
    pub output_size: u32,
    pub prefetch: usize,
    pub decode_workers: usize,
    /// Records buffered for shuffling; defaults to the batch size.
    pub shuffle_buffer: Option<usize>,
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from("trainset"),
            test_dir: PathBuf::from("testset"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            export_path: PathBuf::from(models::BUNDLE_FILE),
            in_channels: 3,
            num_classes: 81,
            hidden: 32,
            dilations: vec![1, 2, 4],
            batch_size: 1,
            schedule: ExponentialDecay::default(),
            checkpoint_every: 1000,
            eval_batches: 10,
            loss_threshold: 0.01,
            stop_check: StopCheck::BeforeReset,
            max_steps: None,
            output_size: 512,
            prefetch: 8,
            decode_workers: 2,
            shuffle_buffer: None,
            seed: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrainConfigFile {
    data: Option<DataSection>,
    model: Option<ModelSection>,
    optimizer: Option<OptimizerSection>,
    train: Option<LoopSection>,
    stream: Option<StreamSection>,
}

#[derive(Debug, Deserialize, Default)]
struct DataSection {
    train_dir: Option<String>,
    test_dir: Option<String>,
    checkpoint_dir: Option<String>,
    export_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelSection {
    in_channels: Option<usize>,
    num_classes: Option<usize>,
    hidden: Option<usize>,
    dilations: Option<Vec<usize>>,
}

#[derive(Debug, Deserialize, Default)]
struct OptimizerSection {
    lr: Option<f64>,
    decay_steps: Option<u64>,
    decay_rate: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct LoopSection {
    batch_size: Option<usize>,
    checkpoint_every: Option<u64>,
    eval_batches: Option<usize>,
    loss_threshold: Option<f32>,
    stop_check: Option<StopCheck>,
    max_steps: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamSection {
    output_size: Option<u32>,
    prefetch: Option<usize>,
    decode_workers: Option<usize>,
    shuffle_buffer: Option<usize>,
    seed: Option<u64>,
}

impl TrainConfig {
    /// `$SEG_TRAIN_CONFIG`, else `seg-train.toml` in the working directory, else defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = match std::env::var(CONFIG_ENV) {
            Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
            _ => PathBuf::from(DEFAULT_CONFIG_NAME),
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading train config {}", path.display()))?;
        let file: TrainConfigFile = toml::from_str(&raw)
            .with_context(|| format!("parsing train config {}", path.display()))?;
        let cfg = Self::from_file(file);
        cfg.warn_if_invalid();
        Ok(cfg)
    }

    fn from_file(file: TrainConfigFile) -> Self {
        let d = Self::default();
        let data = file.data.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let opt = file.optimizer.unwrap_or_default();
        let lp = file.train.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        Self {
            train_dir: data.train_dir.map(PathBuf::from).unwrap_or(d.train_dir),
            test_dir: data.test_dir.map(PathBuf::from).unwrap_or(d.test_dir),
            checkpoint_dir: data
                .checkpoint_dir
                .map(PathBuf::from)
                .unwrap_or(d.checkpoint_dir),
            export_path: data.export_path.map(PathBuf::from).unwrap_or(d.export_path),
            in_channels: model.in_channels.unwrap_or(d.in_channels),
            num_classes: model.num_classes.unwrap_or(d.num_classes),
            hidden: model.hidden.unwrap_or(d.hidden),
            dilations: model.dilations.unwrap_or(d.dilations),
            batch_size: lp.batch_size.unwrap_or(d.batch_size),
            schedule: ExponentialDecay {
                initial: opt.lr.unwrap_or(d.schedule.initial),
                decay_steps: opt.decay_steps.unwrap_or(d.schedule.decay_steps),
                decay_rate: opt.decay_rate.unwrap_or(d.schedule.decay_rate),
            },
            checkpoint_every: lp.checkpoint_every.unwrap_or(d.checkpoint_every),
            eval_batches: lp.eval_batches.unwrap_or(d.eval_batches),
            loss_threshold: lp.loss_threshold.unwrap_or(d.loss_threshold),
            stop_check: lp.stop_check.unwrap_or(d.stop_check),
            max_steps: lp.max_steps.or(d.max_steps),
            output_size: stream.output_size.unwrap_or(d.output_size),
            prefetch: stream.prefetch.unwrap_or(d.prefetch),
            decode_workers: stream.decode_workers.unwrap_or(d.decode_workers),
            shuffle_buffer: stream.shuffle_buffer.or(d.shuffle_buffer),
            seed: stream.seed.or(d.seed),
        }
    }

    pub fn model_config(&self) -> models::SegmenterConfig {
        models::SegmenterConfig {
            in_channels: self.in_channels,
            num_classes: self.num_classes,
            hidden: self.hidden,
            dilations: self.dilations.clone(),
        }
    }

    pub fn warn_if_invalid(&self) {
        if self.stop_check == StopCheck::AfterReset {
            tracing::warn!(
                "train config: stop_check = after_reset reads the loss after it was reset; training ends at the first evaluation"
            );
        }
        if self.checkpoint_every == 0 {
            tracing::warn!("train config: checkpoint_every is 0; treating it as 1");
        }
        if self.batch_size == 0 {
            tracing::warn!("train config: batch_size is 0; treating it as 1");
        }
        if self.in_channels != 3 {
            tracing::warn!(
                "train config: in_channels = {} but records are RGB",
                self.in_channels
            );
        }
    }
}
