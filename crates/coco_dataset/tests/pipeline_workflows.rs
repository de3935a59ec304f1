//! Integration tests for end-to-end coco_dataset workflows.
//!
//! These tests verify that the major workflows work correctly together:
//! 1. Images + annotations → shard files + manifest
//! 2. Shard files → record decode → augmentation
//! 3. Shard files → prefetching sample stream

use coco_dataset::{
    build, decode, discover_shards, AugmentPipeline, AugmentPipelineBuilder, BuildOptions,
    DatasetManifest, SampleStream, ShardReader, StreamConfig, MANIFEST_FILE,
};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::Path;

fn write_annotations(path: &Path, json: serde_json::Value) -> anyhow::Result<()> {
    fs::write(path, serde_json::to_vec(&json)?)?;
    Ok(())
}

fn opts(workers: usize) -> BuildOptions {
    BuildOptions {
        workers,
        ..Default::default()
    }
}

#[test]
fn black_image_survives_build_decode_and_augment() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let images = tmp.path().join("images");
    fs::create_dir_all(&images)?;
    RgbImage::new(10, 10).save(images.join("black.png"))?;
    let ann = tmp.path().join("instances.json");
    write_annotations(
        &ann,
        serde_json::json!({
            "images": [{"id": 1, "file_name": "black.png", "height": 10, "width": 10}],
            "annotations": [],
            "categories": [{"id": 1, "name": "person"}]
        }),
    )?;
    let out = tmp.path().join("testset");
    let summary = build(&images, &ann, &out, &opts(1))?;
    assert_eq!(summary.records, 1);
    assert!(out.join("testset_part_0").is_file());

    let payloads: Vec<Vec<u8>> =
        ShardReader::open(&out.join("testset_part_0"))?.collect::<Result<Vec<_>, _>>()?;
    assert_eq!(payloads.len(), 1);
    let sample = decode(&payloads[0])?;
    assert_eq!(sample.image.dimensions(), (10, 10));
    assert!(sample.label.values.iter().all(|v| *v == 0.0));

    let pipeline = AugmentPipeline::default();
    let mut rng = StdRng::seed_from_u64(2024);
    for _ in 0..1000 {
        let out = pipeline.apply(sample.clone(), &mut rng)?;
        assert_eq!(out.image_shape(), [512, 512, 3]);
        assert_eq!(out.label_shape(), [512, 512]);
        assert_eq!(out.image_hwc.len(), 512 * 512 * 3);
        assert_eq!(out.label.len(), 512 * 512);
    }
    Ok(())
}

#[test]
fn build_skips_bad_images_and_writes_manifest() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let images = tmp.path().join("images");
    fs::create_dir_all(&images)?;
    let mut img = RgbImage::new(8, 8);
    for p in img.pixels_mut() {
        *p = Rgb([200, 100, 50]);
    }
    img.save(images.join("good.png"))?;
    RgbImage::new(4, 4).save(images.join("small.png"))?;
    fs::write(images.join("broken.jpg"), b"not an image")?;

    let ann = tmp.path().join("instances.json");
    write_annotations(
        &ann,
        serde_json::json!({
            "images": [
                {"id": 1, "file_name": "good.png", "height": 8, "width": 8},
                {"id": 2, "file_name": "small.png", "height": 8, "width": 8},
                {"id": 3, "file_name": "broken.jpg", "height": 8, "width": 8},
                {"id": 4, "file_name": "missing.png", "height": 8, "width": 8}
            ],
            "annotations": [
                {"id": 10, "image_id": 1, "category_id": 18,
                 "segmentation": [[1, 1, 6, 1, 6, 6, 1, 6]]},
                {"id": 11, "image_id": 1, "category_id": 3,
                 "segmentation": [[0, 0, 3, 0, 3, 3, 0, 3]]}
            ],
            "categories": [
                {"id": 3, "name": "car"},
                {"id": 18, "name": "dog"}
            ]
        }),
    )?;
    let out = tmp.path().join("trainset");
    fs::create_dir_all(&out)?;
    fs::write(out.join("stale_file"), b"old")?;

    let summary = build(&images, &ann, &out, &opts(2))?;
    assert_eq!(summary.records, 1);
    assert_eq!(summary.skipped, 3);
    assert!(!out.join("stale_file").exists());

    let shards = discover_shards(&out)?;
    assert_eq!(shards.len(), 2);
    let manifest = DatasetManifest::load(&out.join(MANIFEST_FILE))?;
    assert_eq!(manifest.total_records, 1);
    assert_eq!(manifest.max_label, 2);
    manifest.verify(&out)?;

    let payloads: Vec<Vec<u8>> = shards
        .iter()
        .map(|p| ShardReader::open(p)?.collect::<Result<Vec<_>, _>>())
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(payloads.len(), 1);
    let sample = decode(&payloads[0])?;
    // The dog (contiguous id 2) wins where it overlaps the car (id 1).
    assert_eq!(sample.label.get(2, 2), 2.0);
    assert_eq!(sample.label.get(0, 0), 1.0);
    assert_eq!(sample.label.get(7, 7), 0.0);
    let mut values = sample.label.values.clone();
    values.sort_by(f32::total_cmp);
    values.dedup();
    assert_eq!(values, vec![0.0, 1.0, 2.0]);
    Ok(())
}

#[test]
fn stream_repeats_and_keeps_shapes() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let images = tmp.path().join("images");
    fs::create_dir_all(&images)?;
    let mut entries = Vec::new();
    for i in 0..3u64 {
        let name = format!("img_{i}.png");
        RgbImage::from_pixel(12 + i as u32, 9, Rgb([30 * i as u8, 60, 90])).save(images.join(&name))?;
        entries.push(serde_json::json!({
            "id": i + 1, "file_name": name, "height": 9, "width": 12 + i
        }));
    }
    let ann = tmp.path().join("instances.json");
    write_annotations(
        &ann,
        serde_json::json!({"images": entries, "annotations": [], "categories": []}),
    )?;
    let out = tmp.path().join("trainset");
    build(&images, &ann, &out, &opts(2))?;

    let pipeline = AugmentPipelineBuilder::new().output_size(16).build();
    let cfg = StreamConfig {
        prefetch: 2,
        decode_workers: 2,
        shuffle_buffer: 2,
        seed: Some(5),
    };
    let stream = SampleStream::open(&out, pipeline, &cfg)?;
    assert_eq!(stream.shard_count(), 2);
    for _ in 0..10 {
        let s = stream.next_sample()?;
        assert_eq!(s.image_shape(), [16, 16, 3]);
        assert_eq!(s.label.len(), 256);
    }
    Ok(())
}

#[test]
fn stream_over_empty_shards_reports_error() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let images = tmp.path().join("images");
    fs::create_dir_all(&images)?;
    let ann = tmp.path().join("instances.json");
    write_annotations(
        &ann,
        serde_json::json!({"images": [], "annotations": [], "categories": []}),
    )?;
    let out = tmp.path().join("testset");
    build(&images, &ann, &out, &opts(1))?;
    let stream = SampleStream::open(&out, AugmentPipeline::default(), &StreamConfig::default())?;
    assert!(stream.next_sample().is_err());
    Ok(())
}

#[test]
fn zero_workers_fails_before_touching_output() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let ann = tmp.path().join("instances.json");
    write_annotations(
        &ann,
        serde_json::json!({"images": [], "annotations": [], "categories": []}),
    )?;
    let out = tmp.path().join("trainset");
    fs::create_dir_all(&out)?;
    fs::write(out.join("keep"), b"x")?;
    assert!(build(tmp.path(), &ann, &out, &opts(0)).is_err());
    assert!(out.join("keep").exists());
    Ok(())
}
