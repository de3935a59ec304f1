//! Append-only JSONL scalar log (`summaries.jsonl` in the checkpoint directory).

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const SUMMARY_FILE: &str = "summaries.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarSummary {
    pub step: u64,
    pub tag: String,
    pub value: f32,
    pub wall_time_ms: u64,
}

pub struct SummaryWriter {
    path: PathBuf,
    file: File,
}

impl SummaryWriter {
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(SUMMARY_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening summary log {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn scalar(&mut self, tag: &str, value: f32, step: u64) -> anyhow::Result<()> {
        let wall_time_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let rec = ScalarSummary {
            step,
            tag: tag.to_string(),
            value,
            wall_time_ms,
        };
        writeln!(self.file, "{}", serde_json::to_string(&rec)?)
            .with_context(|| format!("writing {}", self.path.display()))?;
        self.file.flush()?;
        Ok(())
    }
}

pub fn read_summaries(path: &Path) -> anyhow::Result<Vec<ScalarSummary>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}
