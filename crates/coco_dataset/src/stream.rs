//! Infinite shuffled sample stream with background decode + augmentation.
//!
//! One reader thread walks the shard files (order reshuffled every pass) through a shuffle
//! buffer and hands raw payloads to `decode_workers` threads. Finished samples queue in a
//! bounded channel of depth `prefetch`; every thread exits once the consumer is dropped.

use crate::aug::AugmentPipeline;
use crate::manifest::discover_shards;
use crate::record::{decode, ShardReader};
use crate::types::{AugmentedSample, DatasetResult, SegDatasetError};
use crossbeam_channel::{bounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::thread;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Depth of the finished-sample queue.
    pub prefetch: usize,
    pub decode_workers: usize,
    /// Records held back for shuffling; 1 keeps file order.
    pub shuffle_buffer: usize,
    pub seed: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            prefetch: 8,
            decode_workers: 2,
            shuffle_buffer: 1,
            seed: None,
        }
    }
}

pub struct SampleStream {
    rx: Receiver<DatasetResult<AugmentedSample>>,
    output_size: u32,
    shards: usize,
}

impl SampleStream {
    /// Streams every shard file in `dir`.
    pub fn open(dir: &Path, pipeline: AugmentPipeline, cfg: &StreamConfig) -> DatasetResult<Self> {
        let shards = discover_shards(dir)?;
        if shards.is_empty() {
            return Err(SegDatasetError::Config(format!(
                "no shard files found in {}",
                dir.display()
            )));
        }
        Self::from_shards(shards, pipeline, cfg)
    }

    pub fn from_shards(
        shards: Vec<PathBuf>,
        pipeline: AugmentPipeline,
        cfg: &StreamConfig,
    ) -> DatasetResult<Self> {
        if shards.is_empty() {
            return Err(SegDatasetError::Config("stream needs at least one shard".into()));
        }
        let prefetch = cfg.prefetch.max(1);
        let (raw_tx, raw_rx) = bounded::<Vec<u8>>(prefetch);
        let (tx, rx) = bounded::<DatasetResult<AugmentedSample>>(prefetch);
        let mut base_rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let reader_seed = base_rng.random::<u64>();
        let shard_count = shards.len();
        let shuffle_buffer = cfg.shuffle_buffer.max(1);
        let err_tx = tx.clone();
        thread::Builder::new()
            .name("seg-stream-reader".into())
            .spawn(move || read_loop(shards, shuffle_buffer, reader_seed, raw_tx, err_tx))
            .map_err(|e| SegDatasetError::Other(format!("spawning reader: {e}")))?;

        for i in 0..cfg.decode_workers.max(1) {
            let raw_rx = raw_rx.clone();
            let tx = tx.clone();
            let pipeline = pipeline.clone();
            let mut rng = StdRng::seed_from_u64(base_rng.random::<u64>());
            thread::Builder::new()
                .name(format!("seg-stream-decode-{i}"))
                .spawn(move || {
                    while let Ok(payload) = raw_rx.recv() {
                        let out = decode(&payload).and_then(|s| pipeline.apply(s, &mut rng));
                        if tx.send(out).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| SegDatasetError::Other(format!("spawning decoder: {e}")))?;
        }
        tracing::debug!(
            "[stream] {} shards, prefetch={}, decode_workers={}, shuffle_buffer={}",
            shard_count,
            prefetch,
            cfg.decode_workers.max(1),
            shuffle_buffer
        );
        Ok(Self {
            rx,
            output_size: pipeline.output_size(),
            shards: shard_count,
        })
    }

    /// Blocks until the next augmented sample is ready.
    pub fn next_sample(&self) -> DatasetResult<AugmentedSample> {
        self.rx
            .recv()
            .map_err(|_| SegDatasetError::Other("sample stream closed".into()))?
    }

    pub fn output_size(&self) -> u32 {
        self.output_size
    }

    pub fn shard_count(&self) -> usize {
        self.shards
    }
}

fn read_loop(
    mut shards: Vec<PathBuf>,
    shuffle_buffer: usize,
    seed: u64,
    raw_tx: Sender<Vec<u8>>,
    err_tx: Sender<DatasetResult<AugmentedSample>>,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buffer: Vec<Vec<u8>> = Vec::with_capacity(shuffle_buffer);
    loop {
        shards.shuffle(&mut rng);
        let mut seen = 0usize;
        for path in &shards {
            let reader = match ShardReader::open(path) {
                Ok(r) => r,
                Err(e) => {
                    let _ = err_tx.send(Err(e));
                    return;
                }
            };
            for frame in reader {
                let payload = match frame {
                    Ok(p) => p,
                    Err(e) => {
                        let _ = err_tx.send(Err(e));
                        return;
                    }
                };
                seen += 1;
                buffer.push(payload);
                if buffer.len() >= shuffle_buffer {
                    let pick = rng.random_range(0..buffer.len());
                    if raw_tx.send(buffer.swap_remove(pick)).is_err() {
                        return;
                    }
                }
            }
        }
        if seen == 0 {
            let _ = err_tx.send(Err(SegDatasetError::Corrupt(
                "shards contain no records".into(),
            )));
            return;
        }
        while !buffer.is_empty() {
            let pick = rng.random_range(0..buffer.len());
            if raw_tx.send(buffer.swap_remove(pick)).is_err() {
                return;
            }
        }
    }
}
