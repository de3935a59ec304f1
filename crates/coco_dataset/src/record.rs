//! Record codec and shard file framing.
//!
//! A shard is `b"SEGR"` + `u32` version followed by `u64`-length-prefixed payloads.
//! Each payload is one [`ImageRecord`]:
//!
//! ```text
//! u32 image_len ; image_len bytes (JPEG)
//! u32 height ; u32 width ; u32 channels
//! u32 nnz ; nnz x (u32 flat_index, f32 value)
//! ```
//!
//! All integers are little-endian and the sparse label is row-major.

use crate::types::{
    DatasetResult, DecodedSample, ImageRecord, LabelMap, RecordShape, SegDatasetError,
};
use image::codecs::jpeg::{JpegDecoder, JpegEncoder};
use image::{ImageDecoder, ImageFormat, RgbImage};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const SHARD_MAGIC: &[u8; 4] = b"SEGR";
pub const SHARD_VERSION: u32 = 1;
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> DatasetResult<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(img)
        .map_err(|e| SegDatasetError::Other(format!("jpeg encode failed: {e}")))?;
    Ok(buf)
}

/// Serializes one record payload (without the frame length).
pub fn encode_record(record: &ImageRecord) -> Vec<u8> {
    let nnz = record.label.values.iter().filter(|v| **v != 0.0).count();
    let mut out = Vec::with_capacity(4 + record.image.len() + 12 + 4 + nnz * 8);
    out.extend_from_slice(&(record.image.len() as u32).to_le_bytes());
    out.extend_from_slice(&record.image);
    out.extend_from_slice(&record.shape.height.to_le_bytes());
    out.extend_from_slice(&record.shape.width.to_le_bytes());
    out.extend_from_slice(&record.shape.channels.to_le_bytes());
    out.extend_from_slice(&(nnz as u32).to_le_bytes());
    for (i, v) in record.label.values.iter().enumerate() {
        if *v != 0.0 {
            out.extend_from_slice(&(i as u32).to_le_bytes());
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, what: &str) -> DatasetResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| SegDatasetError::Corrupt(format!("record truncated reading {what}")))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self, what: &str) -> DatasetResult<u32> {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_le_bytes(arr))
    }

    fn f32(&mut self, what: &str) -> DatasetResult<f32> {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(self.take(4, what)?);
        Ok(f32::from_le_bytes(arr))
    }
}

/// Parses the payload schema; the image stays compressed.
pub fn parse_record(payload: &[u8]) -> DatasetResult<ImageRecord> {
    let mut cur = Cursor {
        data: payload,
        pos: 0,
    };
    let image_len = cur.u32("image length")? as usize;
    let image = cur.take(image_len, "image bytes")?.to_vec();
    let shape = RecordShape {
        height: cur.u32("height")?,
        width: cur.u32("width")?,
        channels: cur.u32("channels")?,
    };
    if shape.channels != 3 {
        return Err(SegDatasetError::Corrupt(format!(
            "expected 3 channels, record has {}",
            shape.channels
        )));
    }
    let (width, height) = JpegDecoder::new(std::io::Cursor::new(image.as_slice()))
        .map_err(|e| SegDatasetError::Corrupt(format!("jpeg header unreadable: {e}")))?
        .dimensions();
    if (width, height) != (shape.width, shape.height) {
        return Err(SegDatasetError::Corrupt(format!(
            "image is {height}x{width}, record shape says {}x{}",
            shape.height, shape.width
        )));
    }
    let pixels = shape.pixels();
    let nnz = cur.u32("label count")? as usize;
    let remaining = payload.len() - cur.pos;
    if nnz > pixels || nnz.checked_mul(8) != Some(remaining) {
        return Err(SegDatasetError::Corrupt(format!(
            "label count {nnz} does not fit {remaining} remaining bytes for {pixels} pixels"
        )));
    }
    let mut values = vec![0.0f32; pixels];
    for _ in 0..nnz {
        let idx = cur.u32("label index")? as usize;
        let v = cur.f32("label value")?;
        if idx >= pixels {
            return Err(SegDatasetError::Corrupt(format!(
                "label index {idx} out of range for {}x{}",
                shape.height, shape.width
            )));
        }
        values[idx] = v;
    }
    let label = LabelMap::from_values(shape.width, shape.height, values)?;
    Ok(ImageRecord {
        image,
        shape,
        label,
    })
}

/// Full decode: schema, JPEG, shape check, dense label.
pub fn decode(payload: &[u8]) -> DatasetResult<DecodedSample> {
    let record = parse_record(payload)?;
    let image = image::load_from_memory_with_format(&record.image, ImageFormat::Jpeg)
        .map_err(|e| SegDatasetError::Corrupt(format!("jpeg decode failed: {e}")))?
        .to_rgb8();
    if image.dimensions() != (record.shape.width, record.shape.height) {
        return Err(SegDatasetError::Corrupt(format!(
            "image is {}x{}, record shape says {}x{}",
            image.height(),
            image.width(),
            record.shape.height,
            record.shape.width
        )));
    }
    Ok(DecodedSample {
        image,
        label: record.label,
    })
}

/// Appends framed records to one shard file.
pub struct ShardWriter {
    path: PathBuf,
    out: BufWriter<File>,
    records: usize,
}

impl ShardWriter {
    pub fn create(path: &Path) -> DatasetResult<Self> {
        let io_err = |e| SegDatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        let mut out = BufWriter::new(File::create(path).map_err(io_err)?);
        out.write_all(SHARD_MAGIC).map_err(io_err)?;
        out.write_all(&SHARD_VERSION.to_le_bytes()).map_err(io_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            out,
            records: 0,
        })
    }

    pub fn append(&mut self, record: &ImageRecord) -> DatasetResult<()> {
        let payload = encode_record(record);
        let io_err = |e| SegDatasetError::Io {
            path: self.path.clone(),
            source: e,
        };
        self.out
            .write_all(&(payload.len() as u64).to_le_bytes())
            .map_err(io_err)?;
        self.out.write_all(&payload).map_err(io_err)?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn finish(mut self) -> DatasetResult<usize> {
        self.out.flush().map_err(|e| SegDatasetError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(self.records)
    }
}

/// Iterates the raw payloads of one shard file.
pub struct ShardReader {
    path: PathBuf,
    input: BufReader<File>,
    done: bool,
}

impl ShardReader {
    pub fn open(path: &Path) -> DatasetResult<Self> {
        let io_err = |e| SegDatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        let mut input = BufReader::new(File::open(path).map_err(io_err)?);
        let mut header = [0u8; 8];
        input.read_exact(&mut header).map_err(|_| {
            SegDatasetError::Corrupt(format!("shard {} too small", path.display()))
        })?;
        if &header[0..4] != SHARD_MAGIC {
            return Err(SegDatasetError::Corrupt(format!(
                "bad magic in shard {}",
                path.display()
            )));
        }
        let mut ver = [0u8; 4];
        ver.copy_from_slice(&header[4..8]);
        let version = u32::from_le_bytes(ver);
        if version != SHARD_VERSION {
            return Err(SegDatasetError::Corrupt(format!(
                "shard {} has version {version}, expected {SHARD_VERSION}",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            input,
            done: false,
        })
    }

    fn next_frame(&mut self) -> DatasetResult<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 8];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = self
                .input
                .read(&mut len_buf[filled..])
                .map_err(|e| SegDatasetError::Io {
                    path: self.path.clone(),
                    source: e,
                })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < len_buf.len() {
            return Err(SegDatasetError::Corrupt(format!(
                "truncated frame header in {}",
                self.path.display()
            )));
        }
        let len = u64::from_le_bytes(len_buf);
        let mut payload = Vec::new();
        (&mut self.input)
            .take(len)
            .read_to_end(&mut payload)
            .map_err(|e| SegDatasetError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        if payload.len() as u64 != len {
            return Err(SegDatasetError::Corrupt(format!(
                "truncated frame in {}: {} of {len} bytes",
                self.path.display(),
                payload.len()
            )));
        }
        Ok(Some(payload))
    }
}

impl Iterator for ShardReader {
    type Item = DatasetResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_frame() {
            Ok(Some(p)) => Some(Ok(p)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

pub fn read_shard(path: &Path) -> DatasetResult<Vec<Vec<u8>>> {
    ShardReader::open(path)?.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn sample_record() -> ImageRecord {
        let img = RgbImage::from_pixel(6, 4, Rgb([120, 60, 30]));
        let mut label = LabelMap::zeros(6, 4);
        label.values[0] = 3.0;
        label.values[23] = 17.0;
        ImageRecord {
            image: encode_jpeg(&img, DEFAULT_JPEG_QUALITY).unwrap(),
            shape: RecordShape::rgb(4, 6),
            label,
        }
    }

    #[test]
    fn decode_restores_label_and_shape() {
        let rec = sample_record();
        let decoded = decode(&encode_record(&rec)).unwrap();
        assert_eq!(decoded.image.dimensions(), (6, 4));
        assert_eq!(decoded.label, rec.label);
        assert_eq!(decoded.label.get(5, 3), 17.0);
        let px = decoded.image.get_pixel(2, 2);
        assert!((px[0] as i32 - 120).abs() <= 4);
    }

    #[test]
    fn sparse_label_stores_only_nonzero() {
        let rec = sample_record();
        let payload = encode_record(&rec);
        assert_eq!(payload.len(), 4 + rec.image.len() + 12 + 4 + 2 * 8);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut rec = sample_record();
        let mut values = vec![0.0f32; 30];
        values[25] = 1.0;
        rec.label = LabelMap {
            width: 6,
            height: 5,
            values,
        };
        let err = parse_record(&encode_record(&rec)).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn corrupt_shape_fails_before_allocating() {
        let rec = sample_record();
        let mut payload = encode_record(&rec);
        let at = 4 + rec.image.len();
        payload[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        payload[at + 4..at + 8].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = parse_record(&payload).unwrap_err();
        assert!(matches!(err, SegDatasetError::Corrupt(_)), "{err}");
    }

    #[test]
    fn label_count_must_match_payload() {
        let rec = sample_record();
        let mut payload = encode_record(&rec);
        let at = 4 + rec.image.len() + 12;
        payload[at..at + 4].copy_from_slice(&1_000_000u32.to_le_bytes());
        let err = parse_record(&payload).unwrap_err();
        assert!(err.to_string().contains("label count"), "{err}");

        let mut padded = encode_record(&rec);
        padded.extend_from_slice(&[0, 0, 0]);
        assert!(parse_record(&padded).is_err());
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut rec = sample_record();
        rec.shape = RecordShape::rgb(6, 4);
        rec.label = LabelMap::zeros(4, 6);
        assert!(decode(&encode_record(&rec)).is_err());
    }

    #[test]
    fn shard_round_trip_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set_part_0");
        let mut w = ShardWriter::create(&path).unwrap();
        w.append(&sample_record()).unwrap();
        w.append(&sample_record()).unwrap();
        assert_eq!(w.finish().unwrap(), 2);
        assert_eq!(read_shard(&path).unwrap().len(), 2);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        let frames: Vec<_> = ShardReader::open(&path).unwrap().collect();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        assert!(frames[1].is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus");
        std::fs::write(&path, b"NOPE\x01\x00\x00\x00").unwrap();
        assert!(ShardReader::open(&path).is_err());
    }
}
