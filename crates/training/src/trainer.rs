//! Online training loop: one thread owns the model, the optimizer and the metrics.

use anyhow::Context;
use burn::module::{AutodiffModule, Module, ModuleVisitor, ParamId};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Int, Tensor};
use coco_dataset::{SampleStream, SegBatch};
use models::{Segmenter, SegmenterConfig};

use crate::checkpoint::CheckpointManager;
use crate::config::{StopCheck, TrainConfig};
use crate::metrics::{Mean, PixelAccuracy};
use crate::summary::SummaryWriter;

/// Mean per-pixel categorical cross-entropy of `[N, C, H, W]` logits against `[N, H, W]` ids.
pub fn pixel_loss<B: Backend>(logits: Tensor<B, 4>, labels: Tensor<B, 3, Int>) -> Tensor<B, 1> {
    let [n, c, h, w] = logits.dims();
    let device = logits.device();
    let flat = logits.permute([0, 2, 3, 1]).reshape([n * h * w, c]);
    let targets = labels.reshape([n * h * w]);
    CrossEntropyLossConfig::new()
        .init(&device)
        .forward(flat, targets)
}

/// `(correct, total)` pixels where the arg-max class equals the label.
pub fn pixel_hits<B: Backend>(logits: Tensor<B, 4>, labels: Tensor<B, 3, Int>) -> (u64, u64) {
    let [n, _, h, w] = logits.dims();
    let pred = logits.argmax(1).squeeze::<3>(1);
    let correct: i64 = pred.equal(labels).int().sum().into_scalar().elem();
    (correct.max(0) as u64, (n * h * w) as u64)
}

struct FiniteGrads<'a> {
    grads: &'a GradientsParams,
    finite: bool,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for FiniteGrads<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if !self.finite {
            return;
        }
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.finite = grad.into_data().iter::<f32>().all(f32::is_finite);
        }
    }
}

/// True when every gradient of `model` is free of NaN and infinity.
pub fn grads_are_finite<B: AutodiffBackend>(model: &Segmenter<B>, grads: &GradientsParams) -> bool {
    let mut visitor = FiniteGrads {
        grads,
        finite: true,
    };
    model.visit(&mut visitor);
    visitor.finite
}

pub fn default_optimizer<B: AutodiffBackend>() -> impl Optimizer<Segmenter<B>, B> {
    AdamConfig::new().init::<B, Segmenter<B>>()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Applied { loss: f32 },
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    LossBelowThreshold,
    MaxSteps,
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub steps: u64,
    pub skipped: u64,
    pub reason: StopReason,
}

/// Values reported at one evaluation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalMetrics {
    pub train_loss: f32,
    pub train_accuracy: f32,
    pub test_loss: f32,
    pub test_accuracy: f32,
}

pub struct Trainer<B: AutodiffBackend, O> {
    cfg: TrainConfig,
    model_cfg: SegmenterConfig,
    device: B::Device,
    model: Segmenter<B>,
    optim: O,
    step: u64,
    skipped: u64,
    train_loss: Mean,
    train_accuracy: PixelAccuracy,
    test_loss: Mean,
    test_accuracy: PixelAccuracy,
    checkpoints: CheckpointManager,
    summaries: SummaryWriter,
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Segmenter<B>, B>,
{
    /// Builds a fresh model and resumes from the latest checkpoint in `cfg.checkpoint_dir`.
    pub fn new(cfg: TrainConfig, optim: O, device: B::Device) -> anyhow::Result<Self> {
        let model_cfg = cfg.model_config();
        let model = Segmenter::<B>::new(&model_cfg, &device);
        let checkpoints = CheckpointManager::new(&cfg.checkpoint_dir)?;
        let (model, optim, restored) = checkpoints.restore(&model_cfg, model, optim, &device)?;
        let summaries = SummaryWriter::open(checkpoints.dir())?;
        let step = restored.unwrap_or(0);
        if restored.is_none() {
            println!(
                "[train] no checkpoint in {}; starting from scratch",
                cfg.checkpoint_dir.display()
            );
        } else {
            println!("[train] resuming at step {step}");
        }
        Ok(Self {
            cfg,
            model_cfg,
            device,
            model,
            optim,
            step,
            skipped: 0,
            train_loss: Mean::default(),
            train_accuracy: PixelAccuracy::default(),
            test_loss: Mean::default(),
            test_accuracy: PixelAccuracy::default(),
            checkpoints,
            summaries,
        })
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn model(&self) -> &Segmenter<B> {
        &self.model
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// One optimizer step; non-finite gradients discard the batch without touching any state
    /// other than the skip counter.
    pub fn train_step(&mut self, batch: SegBatch<B>) -> StepOutcome {
        let logits = self.model.forward(batch.images);
        let (correct, total) = pixel_hits(logits.clone().detach(), batch.labels.clone());
        let loss = pixel_loss(logits, batch.labels);
        let loss_value: f32 = loss.clone().detach().into_scalar().elem();
        let grads = GradientsParams::from_grads(loss.backward(), &self.model);

        if !grads_are_finite(&self.model, &grads) {
            self.skipped += 1;
            tracing::warn!(
                "[train] non-finite gradients at step {}; skipping batch ({} skipped so far)",
                self.step,
                self.skipped
            );
            return StepOutcome::Skipped;
        }

        let lr = self.cfg.schedule.lr_at(self.step);
        self.model = self.optim.step(lr, self.model.clone(), grads);
        self.step += 1;
        self.train_loss.update(loss_value);
        self.train_accuracy.update(correct, total);
        StepOutcome::Applied { loss: loss_value }
    }

    /// Runs `eval_batches` test batches on the inference copy of the model.
    pub fn evaluate(&mut self, test: &SampleStream) -> anyhow::Result<()> {
        let model = self.model.valid();
        for _ in 0..self.cfg.eval_batches {
            let batch = test
                .next_batch::<B::InnerBackend>(self.cfg.batch_size.max(1), &self.device)
                .context("reading test batch")?;
            let logits = model.forward(batch.images);
            let (correct, total) = pixel_hits(logits.clone(), batch.labels.clone());
            let loss: f32 = pixel_loss(logits, batch.labels).into_scalar().elem();
            self.test_loss.update(loss);
            self.test_accuracy.update(correct, total);
        }
        Ok(())
    }

    fn reset_metrics(&mut self) {
        self.train_loss.reset();
        self.train_accuracy.reset();
        self.test_loss.reset();
        self.test_accuracy.reset();
    }

    /// Checkpoint, evaluation, summaries and the status line. Returns the reported values and
    /// the training loss the stop check reads.
    fn interval_end(&mut self, test: &SampleStream) -> anyhow::Result<(IntervalMetrics, f32)> {
        self.checkpoints
            .save(self.step, &self.model_cfg, &self.model, &self.optim)?;
        self.evaluate(test)?;
        let m = IntervalMetrics {
            train_loss: self.train_loss.result(),
            train_accuracy: self.train_accuracy.result(),
            test_loss: self.test_loss.result(),
            test_accuracy: self.test_accuracy.result(),
        };
        self.summaries.scalar("train loss", m.train_loss, self.step)?;
        self.summaries
            .scalar("train accuracy", m.train_accuracy, self.step)?;
        self.summaries.scalar("test loss", m.test_loss, self.step)?;
        self.summaries
            .scalar("test accuracy", m.test_accuracy, self.step)?;
        println!(
            "Step #{} Train Loss: {:.6} Train Accuracy: {:.6} Test Loss: {:.6} Test Accuracy: {:.6}",
            self.step, m.train_loss, m.train_accuracy, m.test_loss, m.test_accuracy
        );
        let checked = match self.cfg.stop_check {
            StopCheck::BeforeReset => {
                let loss = self.train_loss.result();
                self.reset_metrics();
                loss
            }
            StopCheck::AfterReset => {
                self.reset_metrics();
                self.train_loss.result()
            }
        };
        Ok((m, checked))
    }

    /// Writes the inference bundle to `cfg.export_path`.
    pub fn export(&self) -> anyhow::Result<()> {
        models::save_bundle(&self.model.valid(), &self.model_cfg, &self.cfg.export_path)
            .with_context(|| format!("exporting {}", self.cfg.export_path.display()))?;
        println!("[train] exported {}", self.cfg.export_path.display());
        Ok(())
    }

    fn reached_max_steps(&self) -> bool {
        self.cfg.max_steps.is_some_and(|max| self.step >= max)
    }

    /// Trains until the stop check fires or `max_steps` is reached, then exports the bundle.
    pub fn run(&mut self, train: &SampleStream, test: &SampleStream) -> anyhow::Result<TrainReport> {
        let every = self.cfg.checkpoint_every.max(1);
        let batch_size = self.cfg.batch_size.max(1);
        let reason = loop {
            if self.reached_max_steps() {
                break StopReason::MaxSteps;
            }
            let batch = train
                .next_batch::<B>(batch_size, &self.device)
                .context("reading train batch")?;
            if self.train_step(batch) == StepOutcome::Skipped {
                continue;
            }
            if self.step % every == 0 {
                let (_, checked) = self.interval_end(test)?;
                if checked < self.cfg.loss_threshold {
                    break StopReason::LossBelowThreshold;
                }
            }
        };
        self.export()?;
        Ok(TrainReport {
            steps: self.step,
            skipped: self.skipped,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;
    type AD = Autodiff<B>;

    #[test]
    fn loss_is_small_for_confident_correct_logits() {
        let device = Default::default();
        // Two classes, 1x2 image: pixel 0 is class 0, pixel 1 is class 1.
        let logits = Tensor::<B, 4>::from_data(
            TensorData::new(vec![10.0f32, -10.0, -10.0, 10.0], [1, 2, 1, 2]),
            &device,
        );
        let labels = Tensor::<B, 3, Int>::from_data(TensorData::new(vec![0i64, 1], [1, 1, 2]), &device);
        let loss: f32 = pixel_loss(logits.clone(), labels.clone()).into_scalar().elem();
        assert!(loss < 1e-3, "loss {loss}");
        assert_eq!(pixel_hits(logits, labels), (2, 2));
    }

    #[test]
    fn hits_count_mismatches() {
        let device = Default::default();
        let logits = Tensor::<B, 4>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 0.0, 0.0], [1, 2, 1, 2]),
            &device,
        );
        let labels = Tensor::<B, 3, Int>::from_data(TensorData::new(vec![0i64, 1], [1, 1, 2]), &device);
        assert_eq!(pixel_hits(logits, labels), (1, 2));
    }

    #[test]
    fn finite_gradients_pass_the_gate() {
        let device = Default::default();
        let cfg = SegmenterConfig {
            num_classes: 3,
            hidden: 4,
            dilations: vec![1],
            ..Default::default()
        };
        let model = Segmenter::<AD>::new(&cfg, &device);
        let images = Tensor::<AD, 4>::ones([1, 3, 4, 4], &device);
        let labels = Tensor::<AD, 3, Int>::zeros([1, 4, 4], &device);
        let loss = pixel_loss(model.forward(images), labels);
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        assert!(grads_are_finite(&model, &grads));
    }
}
