//! Collation of augmented samples into Burn tensors.

use crate::stream::SampleStream;
use crate::types::{AugmentedSample, DatasetResult, SegDatasetError};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

pub struct SegBatch<B: Backend> {
    /// `[N, 3, S, S]`, values in 0..255.
    pub images: Tensor<B, 4>,
    /// `[N, S, S]` category ids.
    pub labels: Tensor<B, 3, Int>,
}

/// Stacks samples channels-first. All samples must share one output size.
pub fn collate<B: Backend>(
    samples: &[AugmentedSample],
    device: &B::Device,
) -> DatasetResult<SegBatch<B>> {
    let first = samples
        .first()
        .ok_or_else(|| SegDatasetError::Other("cannot collate an empty batch".into()))?;
    let size = first.size as usize;
    let plane = size * size;
    let n = samples.len();
    let mut images = vec![0.0f32; n * 3 * plane];
    let mut labels = Vec::with_capacity(n * plane);
    for (i, sample) in samples.iter().enumerate() {
        if sample.size as usize != size
            || sample.image_hwc.len() != plane * 3
            || sample.label.len() != plane
        {
            return Err(SegDatasetError::Other(format!(
                "sample {i} does not match batch size {size}x{size}"
            )));
        }
        let base = i * 3 * plane;
        for (p, px) in sample.image_hwc.chunks_exact(3).enumerate() {
            images[base + p] = px[0];
            images[base + plane + p] = px[1];
            images[base + 2 * plane + p] = px[2];
        }
        labels.extend(sample.label.iter().map(|v| *v as i64));
    }
    let images = Tensor::<B, 4>::from_data(TensorData::new(images, [n, 3, size, size]), device);
    let labels = Tensor::<B, 3, Int>::from_data(TensorData::new(labels, [n, size, size]), device);
    Ok(SegBatch { images, labels })
}

impl SampleStream {
    /// Pulls `batch_size` samples (blocking) and collates them.
    pub fn next_batch<B: Backend>(
        &self,
        batch_size: usize,
        device: &B::Device,
    ) -> DatasetResult<SegBatch<B>> {
        let mut samples = Vec::with_capacity(batch_size.max(1));
        for _ in 0..batch_size.max(1) {
            samples.push(self.next_sample()?);
        }
        collate(&samples, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn collate_moves_channels_first() {
        let mut image_hwc = vec![0.0; 2 * 2 * 3];
        // pixel (x=1, y=0) = (10, 20, 30)
        image_hwc[3..6].copy_from_slice(&[10.0, 20.0, 30.0]);
        let sample = AugmentedSample {
            size: 2,
            image_hwc,
            label: vec![0.0, 4.0, 0.0, 2.0],
        };
        let device = Default::default();
        let batch = collate::<B>(&[sample.clone(), sample], &device).unwrap();
        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        assert_eq!(batch.labels.dims(), [2, 2, 2]);
        let imgs: Vec<f32> = batch.images.into_data().to_vec().unwrap();
        assert_eq!(imgs[1], 10.0);
        assert_eq!(imgs[4 + 1], 20.0);
        assert_eq!(imgs[8 + 1], 30.0);
        let labels: Vec<i64> = batch.labels.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(&labels[..4], &[0, 4, 0, 2]);
    }

    #[test]
    fn mismatched_sizes_are_rejected() {
        let a = AugmentedSample {
            size: 1,
            image_hwc: vec![0.0; 3],
            label: vec![0.0],
        };
        let b = AugmentedSample {
            size: 2,
            image_hwc: vec![0.0; 12],
            label: vec![0.0; 4],
        };
        let device = Default::default();
        assert!(collate::<B>(&[a, b], &device).is_err());
    }
}
