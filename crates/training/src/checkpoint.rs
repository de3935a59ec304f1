//! Checkpoint directory: `checkpoint.json` names the latest `ckpt-<step>` snapshot, whose
//! model and optimizer records sit next to it as `ckpt-<step>.model.bin` / `.optim.bin`.

use anyhow::Context;
use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::AutodiffBackend;
use models::{Segmenter, SegmenterConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_INDEX: &str = "checkpoint.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    /// Stem of the newest snapshot, e.g. `ckpt-2000`.
    pub latest: String,
    pub step: u64,
    pub model: SegmenterConfig,
    /// Every snapshot written so far, oldest first.
    pub history: Vec<String>,
}

pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating checkpoint dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn model_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}.model.bin"))
    }

    fn optim_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}.optim.bin"))
    }

    /// `None` when no checkpoint was ever written; a corrupt index is an error.
    pub fn latest(&self) -> anyhow::Result<Option<CheckpointIndex>> {
        let path = self.dir.join(CHECKPOINT_INDEX);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let index = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing checkpoint index {}", path.display()))?;
        Ok(Some(index))
    }

    pub fn save<B, O>(
        &self,
        step: u64,
        cfg: &SegmenterConfig,
        model: &Segmenter<B>,
        optim: &O,
    ) -> anyhow::Result<CheckpointIndex>
    where
        B: AutodiffBackend,
        O: Optimizer<Segmenter<B>, B>,
    {
        let stem = format!("ckpt-{step}");
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        model
            .clone()
            .save_file(self.model_path(&stem), &recorder)
            .map_err(|e| anyhow::anyhow!("failed to save model checkpoint: {e}"))?;
        Recorder::<B>::record(&recorder, optim.to_record(), self.optim_path(&stem))
            .map_err(|e| anyhow::anyhow!("failed to save optimizer checkpoint: {e}"))?;

        let mut history = self.latest()?.map(|i| i.history).unwrap_or_default();
        if history.last() != Some(&stem) {
            history.push(stem.clone());
        }
        let index = CheckpointIndex {
            latest: stem,
            step,
            model: cfg.clone(),
            history,
        };
        let path = self.dir.join(CHECKPOINT_INDEX);
        let tmp = self.dir.join(format!("{CHECKPOINT_INDEX}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(&index)?)
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        tracing::info!("[checkpoint] saved {} (step {})", index.latest, step);
        Ok(index)
    }

    /// Loads the latest snapshot into `model` and `optim`, returning its step.
    pub fn restore<B, O>(
        &self,
        cfg: &SegmenterConfig,
        model: Segmenter<B>,
        optim: O,
        device: &B::Device,
    ) -> anyhow::Result<(Segmenter<B>, O, Option<u64>)>
    where
        B: AutodiffBackend,
        O: Optimizer<Segmenter<B>, B>,
    {
        let Some(index) = self.latest()? else {
            return Ok((model, optim, None));
        };
        if &index.model != cfg {
            anyhow::bail!(
                "checkpoint {} was written for {:?}, current model is {:?}",
                index.latest,
                index.model,
                cfg
            );
        }
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let model = model
            .load_file(self.model_path(&index.latest), &recorder, device)
            .map_err(|e| anyhow::anyhow!("failed to load model checkpoint {}: {e}", index.latest))?;
        let record = Recorder::<B>::load(&recorder, self.optim_path(&index.latest), device)
            .map_err(|e| {
                anyhow::anyhow!("failed to load optimizer checkpoint {}: {e}", index.latest)
            })?;
        let optim = optim.load_record(record);
        tracing::info!(
            "[checkpoint] restored {} from {} (step {})",
            index.latest,
            self.dir.display(),
            index.step
        );
        Ok((model, optim, Some(index.step)))
    }
}
