//! COCO instances annotation index (`instances_*2017.json`).

use crate::types::{DatasetResult, LabelMapping, SegDatasetError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

pub const TRAIN_ANNOTATIONS: &str = "instances_train2017.json";
pub const VAL_ANNOTATIONS: &str = "instances_val2017.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoImage {
    pub id: u64,
    pub file_name: String,
    pub height: u32,
    pub width: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoCategory {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub supercategory: Option<String>,
}

/// RLE counts: a plain run list, or the LEB128-like string form used for crowds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RleCounts {
    Runs(Vec<u32>),
    Compressed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segmentation {
    /// One or more polygons, each `[x0, y0, x1, y1, ...]` in pixels.
    Polygons(Vec<Vec<f64>>),
    /// Column-major run-length encoding; `size` is `[height, width]`.
    Rle { counts: RleCounts, size: [u32; 2] },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoAnnotation {
    pub id: u64,
    pub image_id: u64,
    pub category_id: u64,
    pub segmentation: Segmentation,
    #[serde(default)]
    pub iscrowd: u8,
}

#[derive(Debug, Deserialize)]
struct CocoFile {
    images: Vec<CocoImage>,
    #[serde(default)]
    annotations: Vec<CocoAnnotation>,
    #[serde(default)]
    categories: Vec<CocoCategory>,
}

/// Read-only index over one annotation file. Shared by every builder worker.
#[derive(Debug, Clone)]
pub struct CocoIndex {
    images: BTreeMap<u64, CocoImage>,
    categories: Vec<CocoCategory>,
    by_image: HashMap<u64, Vec<CocoAnnotation>>,
    contiguous: HashMap<u64, u32>,
}

impl CocoIndex {
    pub fn load(path: &Path) -> DatasetResult<Self> {
        let raw = fs::read(path).map_err(|e| SegDatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let file: CocoFile = serde_json::from_slice(&raw).map_err(|e| SegDatasetError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self::from_parts(file.images, file.annotations, file.categories))
    }

    pub fn from_parts(
        images: Vec<CocoImage>,
        annotations: Vec<CocoAnnotation>,
        mut categories: Vec<CocoCategory>,
    ) -> Self {
        categories.sort_by_key(|c| c.id);
        let contiguous = categories
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id, i as u32 + 1))
            .collect();
        let mut by_image: HashMap<u64, Vec<CocoAnnotation>> = HashMap::new();
        for ann in annotations {
            by_image.entry(ann.image_id).or_default().push(ann);
        }
        // Category order first, file order within a category.
        for anns in by_image.values_mut() {
            anns.sort_by_key(|a| a.category_id);
        }
        Self {
            images: images.into_iter().map(|img| (img.id, img)).collect(),
            categories,
            by_image,
            contiguous,
        }
    }

    /// All image ids, ascending.
    pub fn image_ids(&self) -> Vec<u64> {
        self.images.keys().copied().collect()
    }

    pub fn image(&self, id: u64) -> Option<&CocoImage> {
        self.images.get(&id)
    }

    pub fn annotations(&self, image_id: u64) -> &[CocoAnnotation] {
        self.by_image
            .get(&image_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn categories(&self) -> &[CocoCategory] {
        &self.categories
    }

    /// Label value written for `category_id`, or `None` for a category missing from the file.
    pub fn label_for(&self, category_id: u64, mapping: LabelMapping) -> Option<u32> {
        match mapping {
            LabelMapping::Contiguous => self.contiguous.get(&category_id).copied(),
            LabelMapping::Raw => {
                if self.contiguous.contains_key(&category_id) {
                    u32::try_from(category_id).ok()
                } else {
                    None
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}
