//! Core types, error definitions, and data structures for coco_dataset.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, SegDatasetError>;

#[derive(Debug, Error)]
pub enum SegDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

/// Image size plus channel count as stored next to every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl RecordShape {
    pub fn rgb(height: u32, width: u32) -> Self {
        Self {
            height,
            width,
            channels: 3,
        }
    }

    pub fn pixels(&self) -> usize {
        self.height as usize * self.width as usize
    }
}

/// Dense per-pixel category ids, row-major, `0` is background.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap {
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
}

impl LabelMap {
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            values: vec![0.0; width as usize * height as usize],
        }
    }

    pub fn from_values(width: u32, height: u32, values: Vec<f32>) -> DatasetResult<Self> {
        if values.len() != width as usize * height as usize {
            return Err(SegDatasetError::Corrupt(format!(
                "label has {} values, expected {}x{}",
                values.len(),
                height,
                width
            )));
        }
        Ok(Self {
            width,
            height,
            values,
        })
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[y as usize * self.width as usize + x as usize]
    }
}

/// One training example before serialization: compressed image, shape and label.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub image: Vec<u8>,
    pub shape: RecordShape,
    pub label: LabelMap,
}

/// A record after decode: pixels are still u8 so the color and geometry stages can run on them.
#[derive(Debug, Clone)]
pub struct DecodedSample {
    pub image: image::RgbImage,
    pub label: LabelMap,
}

impl DecodedSample {
    /// Image as float `[h, w, 3]` in 0..255.
    pub fn image_hwc(&self) -> Vec<f32> {
        self.image.as_raw().iter().map(|v| *v as f32).collect()
    }
}

/// Fixed-size training pair produced by the augmentation pipeline.
#[derive(Debug, Clone)]
pub struct AugmentedSample {
    pub size: u32,
    /// `[size, size, 3]`, values in 0..255.
    pub image_hwc: Vec<f32>,
    /// `[size, size]` category ids.
    pub label: Vec<f32>,
}

impl AugmentedSample {
    pub fn image_shape(&self) -> [usize; 3] {
        [self.size as usize, self.size as usize, 3]
    }

    pub fn label_shape(&self) -> [usize; 2] {
        [self.size as usize, self.size as usize]
    }
}

/// How COCO category ids are written into label maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelMapping {
    /// Sorted category ids become `1..=N`; ordering (and thus overlap priority) is preserved.
    #[default]
    Contiguous,
    /// Category ids are written unchanged.
    Raw,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardReport {
    pub id: String,
    pub relative_path: String,
    pub images: usize,
    pub records: usize,
    pub skipped: usize,
    /// Hex SHA-256 of the finished shard file.
    #[serde(default)]
    pub sha256: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSummary {
    pub shards: Vec<ShardReport>,
    pub records: usize,
    pub skipped: usize,
}
