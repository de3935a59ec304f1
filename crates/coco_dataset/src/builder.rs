//! Parallel corpus builder: COCO images + annotations → `{prefix}_part_<i>` shard files.

use crate::coco::CocoIndex;
use crate::manifest::{sha256_file, DatasetManifest, MANIFEST_FILE};
use crate::rasterize::{build_label_map, CocoRasterizer, MaskRasterizer};
use crate::record::{encode_jpeg, ShardWriter, DEFAULT_JPEG_QUALITY};
use crate::types::{
    BuildSummary, DatasetResult, ImageRecord, LabelMapping, RecordShape, SegDatasetError,
    ShardReport,
};
use rayon::prelude::*;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub workers: usize,
    /// Shard file prefix; defaults to the output directory name.
    pub prefix: Option<String>,
    pub label_mapping: LabelMapping,
    pub jpeg_quality: u8,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            workers: 80,
            prefix: None,
            label_mapping: LabelMapping::Contiguous,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Splits `ids` into `workers` contiguous runs of `n / workers`; the last run takes the rest.
pub fn partition(ids: &[u64], workers: usize) -> DatasetResult<Vec<&[u64]>> {
    if workers == 0 {
        return Err(SegDatasetError::Config("worker count must be at least 1".into()));
    }
    let per = ids.len() / workers;
    let mut out = Vec::with_capacity(workers);
    for i in 0..workers {
        let start = i * per;
        let end = if i + 1 == workers { ids.len() } else { start + per };
        out.push(&ids[start..end]);
    }
    Ok(out)
}

/// Loads the annotation file and builds `output_dir` with the default rasterizer.
pub fn build(
    image_dir: &Path,
    annotation_file: &Path,
    output_dir: &Path,
    opts: &BuildOptions,
) -> DatasetResult<BuildSummary> {
    let t0 = Instant::now();
    let index = CocoIndex::load(annotation_file)?;
    tracing::info!(
        "[dataset] loaded {} ({} images, {} categories) in {} ms",
        annotation_file.display(),
        index.len(),
        index.categories().len(),
        t0.elapsed().as_millis()
    );
    let max_label = max_label(&index, opts.label_mapping)?;
    let summary = build_with(&index, image_dir, output_dir, opts, &CocoRasterizer)?;
    let manifest = DatasetManifest::new(
        annotation_file,
        image_dir,
        opts.label_mapping,
        max_label,
        summary.shards.clone(),
    );
    manifest.save(&output_dir.join(MANIFEST_FILE))?;
    Ok(summary)
}

/// Largest label value `mapping` writes for this index.
fn max_label(index: &CocoIndex, mapping: LabelMapping) -> DatasetResult<u32> {
    let Some(last) = index.categories().last() else {
        return Ok(0);
    };
    let id = match mapping {
        LabelMapping::Contiguous => index.categories().len() as u64,
        LabelMapping::Raw => last.id,
    };
    u32::try_from(id).map_err(|_| {
        SegDatasetError::Config(format!("label {id} does not fit a u32 label map"))
    })
}

/// Resets `output_dir` and writes one shard per worker.
pub fn build_with(
    index: &CocoIndex,
    image_dir: &Path,
    output_dir: &Path,
    opts: &BuildOptions,
    rasterizer: &dyn MaskRasterizer,
) -> DatasetResult<BuildSummary> {
    let ids = index.image_ids();
    let shards = partition(&ids, opts.workers)?;
    reset_dir(output_dir)?;
    let prefix = opts.prefix.clone().unwrap_or_else(|| {
        output_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string())
    });

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.workers)
        .build()
        .map_err(|e| SegDatasetError::Other(format!("building worker pool: {e}")))?;
    tracing::info!(
        "[dataset] building {} images into {} with {} workers",
        ids.len(),
        output_dir.display(),
        opts.workers
    );

    let t0 = Instant::now();
    let reports = pool.install(|| {
        shards
            .par_iter()
            .enumerate()
            .map(|(i, shard_ids)| {
                let name = format!("{prefix}_part_{i}");
                let run = AssertUnwindSafe(|| {
                    build_shard(
                        index,
                        image_dir,
                        output_dir,
                        &name,
                        shard_ids,
                        opts,
                        rasterizer,
                    )
                });
                catch_unwind(run).unwrap_or_else(|_| {
                    Err(SegDatasetError::Other(format!("worker for {name} panicked")))
                })
            })
            .collect::<DatasetResult<Vec<_>>>()
    })?;

    let summary = BuildSummary {
        records: reports.iter().map(|r| r.records).sum(),
        skipped: reports.iter().map(|r| r.skipped).sum(),
        shards: reports,
    };
    println!(
        "[dataset] wrote {} records ({} skipped) to {} in {:.1}s",
        summary.records,
        summary.skipped,
        output_dir.display(),
        t0.elapsed().as_secs_f64()
    );
    Ok(summary)
}

fn reset_dir(dir: &Path) -> DatasetResult<()> {
    let io_err = |e| SegDatasetError::Io {
        path: dir.to_path_buf(),
        source: e,
    };
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(io_err)?;
    }
    fs::create_dir_all(dir).map_err(io_err)
}

fn build_shard(
    index: &CocoIndex,
    image_dir: &Path,
    output_dir: &Path,
    name: &str,
    ids: &[u64],
    opts: &BuildOptions,
    rasterizer: &dyn MaskRasterizer,
) -> DatasetResult<ShardReport> {
    let path = output_dir.join(name);
    let mut writer = ShardWriter::create(&path)?;
    let mut skipped = 0usize;
    for &id in ids {
        let Some(info) = index.image(id) else {
            continue;
        };
        let img_path = image_dir.join(&info.file_name);
        let img = match image::open(&img_path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!("[dataset] skipping unreadable {}: {e}", img_path.display());
                skipped += 1;
                continue;
            }
        };
        if img.dimensions() != (info.width, info.height) {
            tracing::warn!(
                "[dataset] skipping {}: decoded {}x{}, annotation says {}x{}",
                img_path.display(),
                img.width(),
                img.height(),
                info.width,
                info.height
            );
            skipped += 1;
            continue;
        }
        let label = build_label_map(
            index,
            id,
            info.height,
            info.width,
            rasterizer,
            opts.label_mapping,
        )?;
        let record = ImageRecord {
            image: encode_jpeg(&img, opts.jpeg_quality)?,
            shape: RecordShape::rgb(info.height, info.width),
            label,
        };
        writer.append(&record)?;
    }
    let records = writer.finish()?;
    tracing::debug!("[dataset] {name}: {records} records, {skipped} skipped");
    Ok(ShardReport {
        id: name.to_string(),
        relative_path: name.to_string(),
        images: ids.len(),
        records,
        skipped,
        sha256: sha256_file(&path)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coco::{CocoAnnotation, CocoCategory, CocoImage, Segmentation};

    #[test]
    fn partition_gives_remainder_to_last_shard() {
        let ids: Vec<u64> = (0..10).collect();
        let parts = partition(&ids, 3).unwrap();
        let lens: Vec<usize> = parts.iter().map(|p| p.len()).collect();
        assert_eq!(lens, vec![3, 3, 4]);
        assert_eq!(parts[2], &[6, 7, 8, 9]);
    }

    #[test]
    fn partition_with_more_workers_than_ids() {
        let ids = [1u64, 2];
        let parts = partition(&ids, 4).unwrap();
        assert_eq!(parts.len(), 4);
        assert!(parts[..3].iter().all(|p| p.is_empty()));
        assert_eq!(parts[3], &[1, 2]);
    }

    struct FailingRasterizer;

    impl MaskRasterizer for FailingRasterizer {
        fn rasterize(&self, ann: &CocoAnnotation, _: u32, _: u32) -> DatasetResult<Vec<u8>> {
            Err(SegDatasetError::Corrupt(format!("annotation {} is broken", ann.id)))
        }
    }

    struct PanickingRasterizer;

    impl MaskRasterizer for PanickingRasterizer {
        fn rasterize(&self, _: &CocoAnnotation, _: u32, _: u32) -> DatasetResult<Vec<u8>> {
            panic!("rasterizer blew up")
        }
    }

    fn one_image_index(images: &Path) -> CocoIndex {
        image::RgbImage::new(4, 4).save(images.join("a.png")).unwrap();
        CocoIndex::from_parts(
            vec![CocoImage {
                id: 1,
                file_name: "a.png".into(),
                height: 4,
                width: 4,
            }],
            vec![CocoAnnotation {
                id: 9,
                image_id: 1,
                category_id: 3,
                segmentation: Segmentation::Polygons(vec![vec![0.0, 0.0, 3.0, 0.0, 3.0, 3.0]]),
                iscrowd: 0,
            }],
            vec![CocoCategory {
                id: 3,
                name: "cat".into(),
                supercategory: None,
            }],
        )
    }

    #[test]
    fn rasterizer_errors_and_panics_fail_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let index = one_image_index(dir.path());
        let out = dir.path().join("trainset");
        let opts = BuildOptions {
            workers: 2,
            ..Default::default()
        };

        let err = build_with(&index, dir.path(), &out, &opts, &FailingRasterizer).unwrap_err();
        assert!(err.to_string().contains("annotation 9 is broken"), "{err}");

        let err = build_with(&index, dir.path(), &out, &opts, &PanickingRasterizer).unwrap_err();
        assert!(err.to_string().contains("panicked"), "{err}");

        let ok = build_with(&index, dir.path(), &out, &opts, &CocoRasterizer).unwrap();
        assert_eq!(ok.records, 1);
    }

    #[test]
    fn raw_labels_beyond_u32_are_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let ann = dir.path().join("instances.json");
        std::fs::write(
            &ann,
            r#"{"images": [], "categories": [{"id": 5000000000, "name": "huge"}]}"#,
        )
        .unwrap();
        let out = dir.path().join("trainset");
        let opts = BuildOptions {
            workers: 1,
            label_mapping: LabelMapping::Raw,
            ..Default::default()
        };
        let err = build(dir.path(), &ann, &out, &opts).unwrap_err();
        assert!(matches!(err, SegDatasetError::Config(_)), "{err}");
        assert!(!out.exists());

        let contiguous = BuildOptions {
            label_mapping: LabelMapping::Contiguous,
            ..opts
        };
        build(dir.path(), &ann, &out, &contiguous).unwrap();
        let manifest = DatasetManifest::load(&out.join(MANIFEST_FILE)).unwrap();
        assert_eq!(manifest.max_label, 1);
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(
            partition(&[1, 2, 3], 0),
            Err(SegDatasetError::Config(_))
        ));
    }
}
