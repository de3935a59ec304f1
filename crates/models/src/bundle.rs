//! Single-file model export: architecture config plus full-precision weights.
//!
//! Layout: `b"SEGM"`, `u32` LE config length, config JSON, then the `BinBytesRecorder` record.

use crate::{Segmenter, SegmenterConfig};
use burn::module::Module;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const BUNDLE_MAGIC: &[u8; 4] = b"SEGM";
pub const BUNDLE_FILE: &str = "segmenter.bundle";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bundle config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("record error: {0}")]
    Record(String),
    #[error("bad bundle {path}: {reason}")]
    Format { path: PathBuf, reason: String },
}

pub fn save_bundle<B: Backend>(
    model: &Segmenter<B>,
    cfg: &SegmenterConfig,
    path: &Path,
) -> Result<(), ModelError> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::new();
    let weights = Recorder::<B>::record(&recorder, model.clone().into_record(), ())
        .map_err(|e| ModelError::Record(e.to_string()))?;
    let config = serde_json::to_vec(cfg)?;
    let mut out = Vec::with_capacity(8 + config.len() + weights.len());
    out.extend_from_slice(BUNDLE_MAGIC);
    out.extend_from_slice(&(config.len() as u32).to_le_bytes());
    out.extend_from_slice(&config);
    out.extend_from_slice(&weights);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| ModelError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    fs::write(path, out).map_err(|e| ModelError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

pub fn load_bundle<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(Segmenter<B>, SegmenterConfig), ModelError> {
    let data = fs::read(path).map_err(|e| ModelError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let bad = |reason: &str| ModelError::Format {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if data.len() < 8 || &data[0..4] != BUNDLE_MAGIC {
        return Err(bad("missing SEGM header"));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&data[4..8]);
    let cfg_end = 8 + u32::from_le_bytes(len) as usize;
    if cfg_end > data.len() {
        return Err(bad("config length past end of file"));
    }
    let cfg: SegmenterConfig = serde_json::from_slice(&data[8..cfg_end])?;
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::new();
    let record = Recorder::<B>::load(&recorder, data[cfg_end..].to_vec(), device)
        .map_err(|e| ModelError::Record(e.to_string()))?;
    let model = Segmenter::<B>::new(&cfg, device).load_record(record);
    Ok((model, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Tensor, TensorData};
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn bundle_restores_config_and_outputs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("export").join(BUNDLE_FILE);
        let device = Default::default();
        let cfg = SegmenterConfig {
            num_classes: 5,
            hidden: 3,
            dilations: vec![2],
            ..Default::default()
        };
        let model = Segmenter::<B>::new(&cfg, &device);
        save_bundle(&model, &cfg, &path)?;

        let (loaded, loaded_cfg) = load_bundle::<B>(&path, &device)?;
        assert_eq!(loaded_cfg, cfg);
        let input = Tensor::<B, 4>::from_data(
            TensorData::new((0..3 * 16).map(|v| v as f32).collect::<Vec<_>>(), [1, 3, 4, 4]),
            &device,
        );
        let a: Vec<f32> = model.forward(input.clone()).into_data().to_vec().unwrap();
        let b: Vec<f32> = loaded.forward(input).into_data().to_vec().unwrap();
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn truncated_bundle_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(BUNDLE_FILE);
        fs::write(&path, b"SEGM\xff\x00\x00\x00{}")?;
        let err = load_bundle::<B>(&path, &Default::default()).unwrap_err();
        assert!(matches!(err, ModelError::Format { .. }));
        Ok(())
    }
}
