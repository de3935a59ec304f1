//! Burn segmentation model for the COCO trainer.
//!
//! This crate defines:
//! - `Segmenter`: a dilated fully-convolutional network producing per-pixel class logits.
//! - `bundle`: the single-file export holding the architecture config and the weights.
//!
//! The network takes `[B, in_channels, H, W]` images with values in 0..255 and returns
//! `[B, num_classes, H, W]` logits at the input resolution.

pub mod bundle;

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::relu;
use burn::tensor::{Int, Tensor};
use serde::{Deserialize, Serialize};

pub use bundle::{load_bundle, save_bundle, ModelError, BUNDLE_FILE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmenterConfig {
    pub in_channels: usize,
    /// Classes including background (index 0).
    pub num_classes: usize,
    pub hidden: usize,
    /// One 3x3 block per entry, each with this dilation.
    pub dilations: Vec<usize>,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            num_classes: 81,
            hidden: 32,
            dilations: vec![1, 2, 4],
        }
    }
}

#[derive(Debug, Module)]
pub struct Segmenter<B: burn::tensor::backend::Backend> {
    stem: Conv2d<B>,
    blocks: Vec<Conv2d<B>>,
    head: Conv2d<B>,
    num_classes: usize,
}

impl<B: burn::tensor::backend::Backend> Segmenter<B> {
    pub fn new(cfg: &SegmenterConfig, device: &B::Device) -> Self {
        let hidden = cfg.hidden.max(1);
        let stem = Conv2dConfig::new([cfg.in_channels, hidden], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let blocks = cfg
            .dilations
            .iter()
            .map(|&d| {
                let d = d.max(1);
                Conv2dConfig::new([hidden, hidden], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(d, d))
                    .with_dilation([d, d])
                    .init(device)
            })
            .collect();
        let head = Conv2dConfig::new([hidden, cfg.num_classes], [1, 1]).init(device);
        Self {
            stem,
            blocks,
            head,
            num_classes: cfg.num_classes,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Per-pixel logits `[B, num_classes, H, W]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = images.div_scalar(255.0);
        let mut x = relu(self.stem.forward(x));
        for block in &self.blocks {
            x = relu(block.forward(x));
        }
        self.head.forward(x)
    }

    /// Arg-max class per pixel, `[B, H, W]`.
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 3, Int> {
        self.forward(images).argmax(1).squeeze::<3>(1)
    }
}

pub mod prelude {
    pub use super::{Segmenter, SegmenterConfig};
}
