use std::path::{Path, PathBuf};

use coco_dataset::{BuildOptions, LabelMapping};
use serde::Deserialize;

const DEFAULT_CONFIG_NAME: &str = "seg-tools.toml";
const CONFIG_ENV: &str = "SEG_TOOLS_CONFIG";

#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Shard files per output directory.
    pub workers: usize,
    pub train_output: PathBuf,
    pub test_output: PathBuf,
    pub label_mapping: LabelMapping,
    pub jpeg_quality: u8,
}

impl Default for ToolConfig {
    fn default() -> Self {
        let build = BuildOptions::default();
        Self {
            workers: build.workers,
            train_output: PathBuf::from("trainset"),
            test_output: PathBuf::from("testset"),
            label_mapping: build.label_mapping,
            jpeg_quality: build.jpeg_quality,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ToolConfigFile {
    workers: Option<usize>,
    label_mapping: Option<LabelMapping>,
    jpeg_quality: Option<u8>,
    output: Option<OutputSection>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputSection {
    train: Option<String>,
    test: Option<String>,
}

impl ToolConfig {
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let cfg = Self::from_path(Path::new(&path)).unwrap_or_default();
            cfg.warn_if_invalid();
            return cfg;
        }
        let cfg = Self::from_path(Path::new(DEFAULT_CONFIG_NAME)).unwrap_or_default();
        cfg.warn_if_invalid();
        cfg
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let raw = std::fs::read_to_string(path).ok()?;
        let file: ToolConfigFile = match toml::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("tools config: ignoring {}: {e}", path.display());
                return None;
            }
        };
        Some(Self::from_file(file))
    }

    fn from_file(file: ToolConfigFile) -> Self {
        let d = Self::default();
        let output = file.output.unwrap_or_default();
        ToolConfig {
            workers: file.workers.unwrap_or(d.workers),
            train_output: output
                .train
                .map(|v| expand_path(&v))
                .unwrap_or(d.train_output),
            test_output: output
                .test
                .map(|v| expand_path(&v))
                .unwrap_or(d.test_output),
            label_mapping: file.label_mapping.unwrap_or(d.label_mapping),
            jpeg_quality: file.jpeg_quality.unwrap_or(d.jpeg_quality),
        }
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            workers: self.workers,
            prefix: None,
            label_mapping: self.label_mapping,
            jpeg_quality: self.jpeg_quality.clamp(1, 100),
        }
    }

    fn warn_if_invalid(&self) {
        if self.workers == 0 {
            tracing::warn!("tools config: workers is 0; create_dataset will refuse to run");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            tracing::warn!(
                "tools config: jpeg_quality {} outside 1..=100; clamping",
                self.jpeg_quality
            );
        }
        if self.train_output == self.test_output {
            tracing::warn!(
                "tools config: train and test outputs are both {}; the test set will be overwritten",
                self.train_output.display()
            );
        }
    }
}

fn expand_path(raw: &str) -> PathBuf {
    let mut out = raw.to_string();
    if let Some(stripped) = out.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME") {
            out = format!("{home}{stripped}");
        }
    }
    PathBuf::from(expand_env(&out))
}

fn expand_env(input: &str) -> String {
    let mut out = String::new();
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match std::env::var(key) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(&format!("${{{key}}}")),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variables_are_kept_verbatim() {
        assert_eq!(
            expand_env("a/${SEG_TOOLS_SURELY_UNSET_VAR}/b"),
            "a/${SEG_TOOLS_SURELY_UNSET_VAR}/b"
        );
        assert_eq!(expand_env("plain/${unterminated"), "plain/${unterminated");
    }

    #[test]
    fn set_variables_expand() {
        if let Ok(path) = std::env::var("PATH") {
            assert_eq!(expand_env("${PATH}/x"), format!("{path}/x"));
        }
    }
}
