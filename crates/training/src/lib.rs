#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod metrics;
pub mod schedule;
pub mod summary;
pub mod trainer;
pub mod util;

pub use checkpoint::{CheckpointIndex, CheckpointManager, CHECKPOINT_INDEX};
pub use config::{StopCheck, TrainConfig};
pub use metrics::{Mean, PixelAccuracy};
pub use schedule::ExponentialDecay;
pub use summary::{read_summaries, ScalarSummary, SummaryWriter, SUMMARY_FILE};
pub use trainer::{
    default_optimizer, grads_are_finite, pixel_hits, pixel_loss, StepOutcome, StopReason,
    TrainReport, Trainer,
};
pub use util::{run_train, train_with_config, TrainArgs};
/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
