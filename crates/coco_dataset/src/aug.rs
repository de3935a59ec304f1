//! Training-time augmentation: HSV jitter, flip, scale, crop and the final fixed-size resize.

use crate::types::{AugmentedSample, DatasetResult, DecodedSample, LabelMap, SegDatasetError};
use image::imageops::FilterType;
use image::RgbImage;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct AugmentConfig {
    /// Side length of the square output.
    pub output_size: u32,
    /// Inclusive bound for the integer H, S and V offsets.
    pub hsv_delta: i32,
    pub flip_horizontal_prob: f32,
    /// Scale factor is drawn from `[scale_min, scale_max)`.
    pub scale_min: f32,
    pub scale_max: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            output_size: 512,
            hsv_delta: 10,
            flip_horizontal_prob: 0.5,
            scale_min: 0.5,
            scale_max: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AugmentPipeline {
    cfg: AugmentConfig,
}

impl Default for AugmentPipeline {
    fn default() -> Self {
        Self::from_config(AugmentConfig::default())
    }
}

impl AugmentPipeline {
    pub fn from_config(cfg: AugmentConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &AugmentConfig {
        &self.cfg
    }

    pub fn output_size(&self) -> u32 {
        self.cfg.output_size
    }

    pub fn describe(&self) -> String {
        format!(
            "output={}x{} hsv_delta={} flip_p={:.2} scale=[{:.2},{:.2})",
            self.cfg.output_size,
            self.cfg.output_size,
            self.cfg.hsv_delta,
            self.cfg.flip_horizontal_prob,
            self.cfg.scale_min,
            self.cfg.scale_max
        )
    }

    /// Runs every stage on one decoded record. Only `rng` is mutated.
    pub fn apply(
        &self,
        sample: DecodedSample,
        rng: &mut dyn rand::RngCore,
    ) -> DatasetResult<AugmentedSample> {
        let DecodedSample {
            mut image,
            mut label,
        } = sample;
        if image.dimensions() != (label.width, label.height) {
            return Err(SegDatasetError::Other(format!(
                "image is {}x{} but label is {}x{}",
                image.width(),
                image.height(),
                label.width,
                label.height
            )));
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(SegDatasetError::Other("cannot augment an empty image".into()));
        }

        hsv_jitter(&mut image, self.cfg.hsv_delta, rng);
        maybe_hflip(&mut image, &mut label, self.cfg.flip_horizontal_prob, rng);
        random_scale(
            &mut image,
            &mut label,
            self.cfg.scale_min,
            self.cfg.scale_max,
            rng,
        );
        random_crop(&mut image, &mut label, self.cfg.output_size, rng);

        let size = self.cfg.output_size;
        if image.dimensions() != (size, size) {
            image = image::imageops::resize(&image, size, size, FilterType::CatmullRom);
            label = resize_nearest(&label, size, size);
        }

        Ok(AugmentedSample {
            size,
            image_hwc: image.as_raw().iter().map(|v| *v as f32).collect(),
            label: label.values,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AugmentPipelineBuilder {
    inner: AugmentConfig,
}

impl AugmentPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn output_size(mut self, size: u32) -> Self {
        self.inner.output_size = size.max(1);
        self
    }
    pub fn hsv_delta(mut self, delta: i32) -> Self {
        self.inner.hsv_delta = delta.max(0);
        self
    }
    pub fn flip_horizontal_prob(mut self, p: f32) -> Self {
        self.inner.flip_horizontal_prob = p;
        self
    }
    pub fn scale_range(mut self, min: f32, max: f32) -> Self {
        self.inner.scale_min = min;
        self.inner.scale_max = max;
        self
    }
    pub fn build(self) -> AugmentPipeline {
        AugmentPipeline::from_config(self.inner)
    }
}

/// 8-bit RGB to OpenCV-style HSV: H in `[0, 180)`, S and V in `[0, 255]`.
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [i32; 3] {
    let [r, g, b] = rgb.map(f32::from);
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = v - min;
    let s = if v > 0.0 { 255.0 * diff / v } else { 0.0 };
    let mut h = if diff == 0.0 {
        0.0
    } else if v == r {
        60.0 * (g - b) / diff
    } else if v == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }
    let h = ((h / 2.0).round() as i32) % 180;
    [h, s.round() as i32, v as i32]
}

pub fn hsv_to_rgb(hsv: [i32; 3]) -> [u8; 3] {
    let h = (hsv[0].rem_euclid(180) as f32) * 2.0 / 60.0;
    let s = hsv[1].clamp(0, 255) as f32 / 255.0;
    let v = hsv[2].clamp(0, 255) as f32 / 255.0;
    let sector = h.floor();
    let f = h - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    let (r, g, b) = match sector as i32 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    [r, g, b].map(|c| (c * 255.0).round().clamp(0.0, 255.0) as u8)
}

/// Hue wraps modulo 180; saturation and value clamp to `[0, 255]`.
pub fn shift_hsv(hsv: [i32; 3], delta: [i32; 3]) -> [i32; 3] {
    [
        (hsv[0] + delta[0]).rem_euclid(180),
        (hsv[1] + delta[1]).clamp(0, 255),
        (hsv[2] + delta[2]).clamp(0, 255),
    ]
}

pub(crate) fn hsv_jitter(img: &mut RgbImage, max_delta: i32, rng: &mut dyn rand::RngCore) {
    let delta = [
        rng.random_range(-max_delta..=max_delta),
        rng.random_range(-max_delta..=max_delta),
        rng.random_range(-max_delta..=max_delta),
    ];
    if delta == [0, 0, 0] {
        return;
    }
    for pixel in img.pixels_mut() {
        let hsv = shift_hsv(rgb_to_hsv(pixel.0), delta);
        pixel.0 = hsv_to_rgb(hsv);
    }
}

pub(crate) fn maybe_hflip(
    img: &mut RgbImage,
    label: &mut LabelMap,
    prob: f32,
    rng: &mut dyn rand::RngCore,
) {
    if prob <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) < prob {
        image::imageops::flip_horizontal_in_place(img);
        let w = label.width as usize;
        for row in label.values.chunks_exact_mut(w) {
            row.reverse();
        }
    }
}

pub(crate) fn random_scale(
    img: &mut RgbImage,
    label: &mut LabelMap,
    min_scale: f32,
    max_scale: f32,
    rng: &mut dyn rand::RngCore,
) {
    let scale = if max_scale > min_scale {
        rng.random_range(min_scale..max_scale)
    } else {
        min_scale
    };
    if scale <= 0.0 {
        return;
    }
    let (w, h) = img.dimensions();
    let new_w = ((w as f32 * scale).floor() as u32).max(1);
    let new_h = ((h as f32 * scale).floor() as u32).max(1);
    if (new_w, new_h) == (w, h) {
        return;
    }
    *img = image::imageops::resize(img, new_w, new_h, FilterType::CatmullRom);
    *label = resize_nearest(label, new_w, new_h);
}

/// Crops `min(size, dim)` per axis at a uniformly random offset.
pub(crate) fn random_crop(
    img: &mut RgbImage,
    label: &mut LabelMap,
    size: u32,
    rng: &mut dyn rand::RngCore,
) {
    let (w, h) = img.dimensions();
    let cw = size.min(w);
    let ch = size.min(h);
    let x0 = rng.random_range(0..=w - cw);
    let y0 = rng.random_range(0..=h - ch);
    if (cw, ch) == (w, h) {
        return;
    }
    *img = image::imageops::crop_imm(img, x0, y0, cw, ch).to_image();
    let mut values = Vec::with_capacity(cw as usize * ch as usize);
    for y in y0..y0 + ch {
        let start = (y * w + x0) as usize;
        values.extend_from_slice(&label.values[start..start + cw as usize]);
    }
    *label = LabelMap {
        width: cw,
        height: ch,
        values,
    };
}

/// Nearest-neighbour resize; output values are always copies of input values.
pub fn resize_nearest(label: &LabelMap, width: u32, height: u32) -> LabelMap {
    let sx = label.width as f32 / width as f32;
    let sy = label.height as f32 / height as f32;
    let mut values = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        let src_y = (((y as f32 + 0.5) * sy) as u32).min(label.height - 1);
        for x in 0..width {
            let src_x = (((x as f32 + 0.5) * sx) as u32).min(label.width - 1);
            values.push(label.get(src_x, src_y));
        }
    }
    LabelMap {
        width,
        height,
        values,
    }
}
