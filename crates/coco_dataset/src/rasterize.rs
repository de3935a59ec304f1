//! Annotation → mask rasterization and the per-pixel label reducer.

use crate::coco::{CocoAnnotation, CocoIndex, RleCounts, Segmentation};
use crate::types::{DatasetResult, LabelMap, LabelMapping, SegDatasetError};
use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;

/// Produces a binary mask for one annotation.
pub trait MaskRasterizer: Send + Sync {
    /// Row-major mask of `height * width` bytes, each 0 or 1.
    fn rasterize(&self, ann: &CocoAnnotation, height: u32, width: u32) -> DatasetResult<Vec<u8>>;
}

/// Polygon + RLE rasterizer following the COCO geometry conventions.
///
/// RLE masks decode exactly. Polygon vertices are rounded to whole pixels before filling, so
/// polygon masks approximate COCO's sub-pixel `annToMask` and can differ by a pixel along edges
/// (most visible on thin instances).
#[derive(Debug, Default, Clone, Copy)]
pub struct CocoRasterizer;

impl MaskRasterizer for CocoRasterizer {
    fn rasterize(&self, ann: &CocoAnnotation, height: u32, width: u32) -> DatasetResult<Vec<u8>> {
        match &ann.segmentation {
            Segmentation::Polygons(polys) => Ok(rasterize_polygons(polys, height, width)),
            Segmentation::Rle { counts, size } => {
                if *size != [height, width] {
                    return Err(SegDatasetError::Corrupt(format!(
                        "annotation {} rle size {:?} does not match image {}x{}",
                        ann.id, size, height, width
                    )));
                }
                let runs = match counts {
                    RleCounts::Runs(runs) => runs.clone(),
                    RleCounts::Compressed(s) => decode_rle_string(s)?,
                };
                rle_to_mask(&runs, height, width)
            }
        }
    }
}

pub fn rasterize_polygons(polys: &[Vec<f64>], height: u32, width: u32) -> Vec<u8> {
    let mut canvas = GrayImage::new(width, height);
    for poly in polys {
        let mut points: Vec<Point<i32>> = Vec::with_capacity(poly.len() / 2);
        for xy in poly.chunks_exact(2) {
            let p = Point::new(xy[0].round() as i32, xy[1].round() as i32);
            if points.last() != Some(&p) {
                points.push(p);
            }
        }
        // draw_polygon_mut rejects an explicitly closed ring.
        while points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        if points.len() < 3 {
            continue;
        }
        draw_polygon_mut(&mut canvas, &points, Luma([1u8]));
    }
    canvas.into_raw()
}

/// Decodes the compressed COCO counts string (5 bits per char, continuation bit 0x20,
/// sign bit 0x10, counts from the third on stored as deltas).
pub fn decode_rle_string(s: &str) -> DatasetResult<Vec<u32>> {
    let bytes = s.as_bytes();
    let mut counts: Vec<i64> = Vec::new();
    let mut p = 0usize;
    while p < bytes.len() {
        let mut x: i64 = 0;
        let mut k = 0u32;
        loop {
            let Some(&b) = bytes.get(p) else {
                return Err(SegDatasetError::Corrupt(format!(
                    "truncated rle string {s:?}"
                )));
            };
            let c = i64::from(b) - 48;
            if !(0..64).contains(&c) || k > 12 {
                return Err(SegDatasetError::Corrupt(format!("bad rle string {s:?}")));
            }
            x |= (c & 0x1f) << (5 * k);
            p += 1;
            k += 1;
            if c & 0x20 == 0 {
                if c & 0x10 != 0 {
                    x |= -1i64 << (5 * k);
                }
                break;
            }
        }
        let m = counts.len();
        if m > 2 {
            x += counts[m - 2];
        }
        counts.push(x);
    }
    counts
        .into_iter()
        .map(|c| {
            u32::try_from(c)
                .map_err(|_| SegDatasetError::Corrupt(format!("negative rle run in {s:?}")))
        })
        .collect()
}

/// Expands column-major runs (starting with background) into a row-major mask.
pub fn rle_to_mask(runs: &[u32], height: u32, width: u32) -> DatasetResult<Vec<u8>> {
    let h = height as usize;
    let w = width as usize;
    let total: u64 = runs.iter().map(|r| u64::from(*r)).sum();
    if total != (h * w) as u64 {
        return Err(SegDatasetError::Corrupt(format!(
            "rle covers {total} pixels, expected {}",
            h * w
        )));
    }
    let mut mask = vec![0u8; h * w];
    let mut pos = 0usize;
    for (i, run) in runs.iter().enumerate() {
        let run = *run as usize;
        if i % 2 == 1 {
            for idx in pos..pos + run {
                let (col, row) = (idx / h, idx % h);
                mask[row * w + col] = 1;
            }
        }
        pos += run;
    }
    Ok(mask)
}

/// Folds one instance mask into the label map: `label = max(label, mask * category)`.
///
/// The reducer is a numeric max, so overlaps resolve to the highest label value no matter
/// which order annotations are visited in.
pub fn combine_instance(label: &mut LabelMap, mask: &[u8], category: u32) -> DatasetResult<()> {
    if mask.len() != label.values.len() {
        return Err(SegDatasetError::Other(format!(
            "mask has {} pixels, label map has {}",
            mask.len(),
            label.values.len()
        )));
    }
    let cat = category as f32;
    for (dst, m) in label.values.iter_mut().zip(mask) {
        let v = f32::from(*m) * cat;
        if v > *dst {
            *dst = v;
        }
    }
    Ok(())
}

/// Label map for one image: every annotation rasterized and reduced with [`combine_instance`].
pub fn build_label_map(
    index: &CocoIndex,
    image_id: u64,
    height: u32,
    width: u32,
    rasterizer: &dyn MaskRasterizer,
    mapping: LabelMapping,
) -> DatasetResult<LabelMap> {
    let mut label = LabelMap::zeros(width, height);
    for ann in index.annotations(image_id) {
        let Some(category) = index.label_for(ann.category_id, mapping) else {
            tracing::debug!(
                "[dataset] annotation {} has unknown category {}; ignored",
                ann.id,
                ann.category_id
            );
            continue;
        };
        let mask = rasterizer.rasterize(ann, height, width)?;
        combine_instance(&mut label, &mask, category)?;
    }
    Ok(label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coco::{CocoCategory, CocoImage};

    fn ann(id: u64, category_id: u64, segmentation: Segmentation) -> CocoAnnotation {
        CocoAnnotation {
            id,
            image_id: 1,
            category_id,
            segmentation,
            iscrowd: 0,
        }
    }

    fn category(id: u64) -> CocoCategory {
        CocoCategory {
            id,
            name: format!("c{id}"),
            supercategory: None,
        }
    }

    /// Rasterizer that returns a fixed mask per annotation id.
    struct FixedMasks(Vec<(u64, Vec<u8>)>);

    impl MaskRasterizer for FixedMasks {
        fn rasterize(&self, ann: &CocoAnnotation, _h: u32, _w: u32) -> DatasetResult<Vec<u8>> {
            Ok(self
                .0
                .iter()
                .find(|(id, _)| *id == ann.id)
                .map(|(_, m)| m.clone())
                .unwrap_or_default())
        }
    }

    #[test]
    fn overlap_resolves_to_max_category() {
        let dummy = Segmentation::Polygons(vec![]);
        // Visit the high category first to show order does not matter.
        let anns = vec![
            ann(1, 7, dummy.clone()),
            ann(2, 3, dummy.clone()),
            ann(3, 5, dummy),
        ];
        let index = CocoIndex::from_parts(
            vec![CocoImage {
                id: 1,
                file_name: "x.png".into(),
                height: 1,
                width: 4,
            }],
            anns,
            vec![category(3), category(5), category(7)],
        );
        let masks = FixedMasks(vec![
            (1, vec![1, 1, 0, 0]),
            (2, vec![0, 1, 1, 0]),
            (3, vec![0, 0, 1, 0]),
        ]);
        let label = build_label_map(&index, 1, 1, 4, &masks, LabelMapping::Raw).unwrap();
        assert_eq!(label.values, vec![7.0, 7.0, 5.0, 0.0]);
    }

    #[test]
    fn combine_never_lowers_a_pixel() {
        let mut label = LabelMap::from_values(3, 1, vec![4.0, 0.0, 9.0]).unwrap();
        combine_instance(&mut label, &[1, 1, 1], 5).unwrap();
        assert_eq!(label.values, vec![5.0, 5.0, 9.0]);
    }

    #[test]
    fn compressed_rle_decodes_deltas() {
        assert_eq!(decode_rle_string("24b0").unwrap(), vec![2, 4, 18]);
    }

    #[test]
    fn rle_is_column_major() {
        let mask = rle_to_mask(&[2, 4, 18], 4, 6).unwrap();
        let on: Vec<(usize, usize)> = (0..24)
            .filter(|i| mask[*i] == 1)
            .map(|i| (i % 6, i / 6))
            .collect();
        // (x, y) pairs in row-major scan order.
        assert_eq!(on, vec![(1, 0), (1, 1), (0, 2), (0, 3)]);
    }

    #[test]
    fn rle_length_mismatch_is_an_error() {
        assert!(rle_to_mask(&[2, 4], 4, 6).is_err());
    }

    #[test]
    fn polygon_fills_interior() {
        let mask = rasterize_polygons(&[vec![1.0, 1.0, 6.0, 1.0, 6.0, 6.0, 1.0, 6.0, 1.0, 1.0]], 8, 8);
        assert_eq!(mask[3 * 8 + 3], 1);
        assert_eq!(mask[0], 0);
        assert_eq!(mask[7 * 8 + 7], 0);
    }

    #[test]
    fn degenerate_polygon_is_skipped() {
        let mask = rasterize_polygons(&[vec![2.0, 2.0, 3.0, 3.0]], 4, 4);
        assert!(mask.iter().all(|v| *v == 0));
    }
}
