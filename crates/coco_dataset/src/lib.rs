//! COCO segmentation corpus tooling.
//!
//! This crate provides utilities for:
//! - Parsing COCO instance annotations and rasterizing them into label maps
//! - Building sharded record files in parallel
//! - Decoding records and running the training-time augmentation pipeline
//! - Streaming shuffled, prefetched batches into Burn tensors

pub mod aug;
pub mod builder;
pub mod coco;
pub mod manifest;
pub mod rasterize;
pub mod record;
pub mod stream;
pub mod types;

#[cfg(feature = "burn-runtime")]
pub mod batch;

pub use aug::{AugmentConfig, AugmentPipeline, AugmentPipelineBuilder};
pub use builder::{build, build_with, partition, BuildOptions};
pub use coco::{CocoIndex, TRAIN_ANNOTATIONS, VAL_ANNOTATIONS};
pub use manifest::{discover_shards, DatasetManifest, MANIFEST_FILE};
pub use rasterize::{combine_instance, CocoRasterizer, MaskRasterizer};
pub use record::{decode, ShardReader, ShardWriter};
pub use stream::{SampleStream, StreamConfig};
pub use types::*;

#[cfg(feature = "burn-runtime")]
pub use batch::{collate, SegBatch};
