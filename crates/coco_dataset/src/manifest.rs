//! Per-directory dataset manifest and shard discovery.

use crate::types::{DatasetResult, LabelMapping, SegDatasetError, ShardReport};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetManifest {
    /// Annotation file the shards were built from.
    pub source_annotations: String,
    pub image_dir: String,
    pub label_mapping: LabelMapping,
    /// Largest label value the mapping can produce (0 is background).
    pub max_label: u32,
    pub created_at_ms: u64,
    pub shards: Vec<ShardReport>,
    pub total_records: usize,
    pub total_skipped: usize,
}

impl DatasetManifest {
    pub fn new(
        source_annotations: &Path,
        image_dir: &Path,
        label_mapping: LabelMapping,
        max_label: u32,
        shards: Vec<ShardReport>,
    ) -> Self {
        let created_at_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let total_records = shards.iter().map(|s| s.records).sum();
        let total_skipped = shards.iter().map(|s| s.skipped).sum();
        Self {
            source_annotations: source_annotations.display().to_string(),
            image_dir: image_dir.display().to_string(),
            label_mapping,
            max_label,
            created_at_ms,
            shards,
            total_records,
            total_skipped,
        }
    }

    pub fn save(&self, path: &Path) -> DatasetResult<()> {
        let data =
            serde_json::to_vec_pretty(self).map_err(|e| SegDatasetError::Other(e.to_string()))?;
        fs::write(path, data).map_err(|e| SegDatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn load(path: &Path) -> DatasetResult<Self> {
        let raw = fs::read(path).map_err(|e| SegDatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_slice(&raw).map_err(|e| SegDatasetError::Json {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Recomputes every shard checksum under `root` and reports the first mismatch.
    pub fn verify(&self, root: &Path) -> DatasetResult<()> {
        for shard in &self.shards {
            let path = root.join(&shard.relative_path);
            let actual = sha256_file(&path)?;
            if actual != shard.sha256 {
                return Err(SegDatasetError::Corrupt(format!(
                    "checksum mismatch for {}: manifest {} actual {}",
                    path.display(),
                    shard.sha256,
                    actual
                )));
            }
        }
        Ok(())
    }
}

pub fn sha256_file(path: &Path) -> DatasetResult<String> {
    let io_err = |e| SegDatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    let mut reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut hasher = sha2::Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Every regular file in `dir` except the manifest, sorted by name.
pub fn discover_shards(dir: &Path) -> DatasetResult<Vec<PathBuf>> {
    let io_err = |e| SegDatasetError::Io {
        path: dir.to_path_buf(),
        source: e,
    };
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.file_name().and_then(|n| n.to_str()) == Some(MANIFEST_FILE) {
            continue;
        }
        out.push(path);
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_skips_manifest_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("set_part_1"), b"b").unwrap();
        fs::write(dir.path().join("set_part_0"), b"a").unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"{}").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        let found = discover_shards(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["set_part_0", "set_part_1"]);
    }

    #[test]
    fn verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let shard = dir.path().join("set_part_0");
        fs::write(&shard, b"payload").unwrap();
        let report = ShardReport {
            id: "set_part_0".into(),
            relative_path: "set_part_0".into(),
            images: 1,
            records: 1,
            skipped: 0,
            sha256: sha256_file(&shard).unwrap(),
        };
        let manifest = DatasetManifest::new(
            Path::new("ann.json"),
            Path::new("images"),
            LabelMapping::Contiguous,
            80,
            vec![report],
        );
        let path = dir.path().join(MANIFEST_FILE);
        manifest.save(&path).unwrap();
        let loaded = DatasetManifest::load(&path).unwrap();
        assert_eq!(loaded.total_records, 1);
        loaded.verify(dir.path()).unwrap();

        fs::write(&shard, b"tampered").unwrap();
        assert!(loaded.verify(dir.path()).is_err());
    }
}
