use std::collections::BTreeMap;
use std::path::Path;

use image::DynamicImage;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use super::model::{HappyData, MetadataLayer};
use crate::error::{HappyError, Result};
use crate::select::SelectedPixel;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Splits `"sample:region"` into its parts. A bare sample id has no region.
pub fn split_full_id(id: &str) -> (&str, Option<&str>) {
    match id.split_once(':') {
        Some((sample, region)) => (sample, Some(region)),
        None => (id, None),
    }
}

// ---------------------------------------------------------------------------
// Reader / writer seams
// ---------------------------------------------------------------------------

/// Source of samples. Format codecs live behind this trait.
pub trait HappyReader {
    /// Every sample id available to this reader.
    fn get_sample_ids(&self) -> Result<Vec<String>>;

    /// Loads all regions of a sample, or the one region named by a
    /// `"sample:region"` id.
    fn load_data(&self, id: &str) -> Result<Vec<HappyData>>;

    /// Region ids of one sample.
    fn get_region_ids(&self, sample_id: &str) -> Result<Vec<String>> {
        Ok(self
            .load_data(sample_id)?
            .iter()
            .map(|hd| hd.region_id().to_string())
            .collect())
    }
}

/// Storage type of a written metadata layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float64,
    Float32,
    Int32,
    Uint8,
    Bool,
}

impl DataType {
    /// Converts one cell to this type's value range. `NaN` stays unknown.
    pub fn cast(self, value: f64) -> f64 {
        if value.is_nan() {
            return value;
        }
        match self {
            DataType::Float64 => value,
            DataType::Float32 => value as f32 as f64,
            DataType::Int32 => value.round().clamp(i32::MIN as f64, i32::MAX as f64),
            DataType::Uint8 => value.round().clamp(0.0, u8::MAX as f64),
            DataType::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Per-layer storage type overrides, keyed by layer name.
pub type DatatypeMapping = BTreeMap<String, DataType>;

/// Sink for processed samples.
pub trait HappyWriter {
    fn write_data(&mut self, data: &[HappyData], datatypes: Option<&DatatypeMapping>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// Reader over samples held in memory, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    order: Vec<String>,
    samples: BTreeMap<String, Vec<HappyData>>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one region under its sample id.
    pub fn insert(&mut self, data: HappyData) {
        let sample = data.sample_id().to_string();
        if !self.samples.contains_key(&sample) {
            self.order.push(sample.clone());
        }
        self.samples.entry(sample).or_default().push(data);
    }
}

impl FromIterator<HappyData> for MemoryReader {
    fn from_iter<I: IntoIterator<Item = HappyData>>(iter: I) -> Self {
        let mut reader = Self::new();
        for data in iter {
            reader.insert(data);
        }
        reader
    }
}

impl HappyReader for MemoryReader {
    fn get_sample_ids(&self) -> Result<Vec<String>> {
        Ok(self.order.clone())
    }

    fn load_data(&self, id: &str) -> Result<Vec<HappyData>> {
        let (sample, region) = split_full_id(id);
        let regions = self
            .samples
            .get(sample)
            .ok_or_else(|| HappyError::missing(format!("unknown sample '{sample}'")))?;
        match region {
            None => Ok(regions.clone()),
            Some(region) => {
                let found: Vec<HappyData> = regions
                    .iter()
                    .filter(|hd| hd.region_id() == region)
                    .cloned()
                    .collect();
                if found.is_empty() {
                    return Err(HappyError::missing(format!("unknown region '{id}'")));
                }
                Ok(found)
            }
        }
    }
}

/// Writer collecting everything in memory; layer types are applied on write.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    pub written: Vec<HappyData>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HappyWriter for MemoryWriter {
    fn write_data(&mut self, data: &[HappyData], datatypes: Option<&DatatypeMapping>) -> Result<()> {
        for hd in data {
            let mut out = HappyData::new(
                hd.sample_id(),
                hd.region_id(),
                hd.data().clone(),
                hd.global_dict().clone(),
                Default::default(),
                hd.wavelengths().map(<[f64]>::to_vec),
            )?;
            for (name, layer) in hd.metadata_dict() {
                let layer = match datatypes.and_then(|m| m.get(name)) {
                    Some(dtype) => MetadataLayer {
                        data: layer.data.mapv(|v| dtype.cast(v)),
                        mapping: layer.mapping.clone(),
                    },
                    None => layer.clone(),
                };
                out.add_metadata_layer(name.clone(), layer)?;
            }
            log::debug!("wrote {}", out.full_id());
            self.written.push(out);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mask images
// ---------------------------------------------------------------------------

/// Reads an integer mask image into a `(height, width)` layer.
///
/// 8- and 16-bit grayscale values are kept as-is; colour images are
/// converted to 8-bit luma first.
pub fn load_mask_png(path: &Path) -> Result<Array2<f64>> {
    let img = image::open(path)?;
    let (w, h) = (img.width() as usize, img.height() as usize);
    let values: Vec<f64> = match img {
        DynamicImage::ImageLuma8(buf) => buf.into_raw().into_iter().map(f64::from).collect(),
        DynamicImage::ImageLuma16(buf) => buf.into_raw().into_iter().map(f64::from).collect(),
        other => other.to_luma8().into_raw().into_iter().map(f64::from).collect(),
    };
    Array2::from_shape_vec((h, w), values)
        .map_err(|e| HappyError::config(format!("mask {}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// Selected pixel tables
// ---------------------------------------------------------------------------

/// Writes selected pixels as CSV: `x`, `y`, then one column per band.
/// Band columns are named after `wavelengths` when given.
pub fn write_pixels_csv(path: &Path, pixels: &[SelectedPixel], wavelengths: Option<&[f64]>) -> Result<()> {
    let bands = pixels.first().map_or(0, |p| p.spectrum.len());
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;

    let mut header = vec!["x".to_string(), "y".to_string()];
    header.extend((0..bands).map(|b| match wavelengths {
        Some(wl) if wl.len() == bands => wl[b].to_string(),
        _ => format!("band_{b}"),
    }));
    writer.write_record(&header).map_err(csv_error)?;

    for (row, p) in pixels.iter().enumerate() {
        if p.spectrum.len() != bands {
            return Err(HappyError::shape_mismatch(
                format!("pixel row {row}"),
                &[bands],
                &[p.spectrum.len()],
            ));
        }
        let mut record = vec![p.x.to_string(), p.y.to_string()];
        record.extend(p.spectrum.iter().map(f64::to_string));
        writer.write_record(&record).map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads a table written by [`write_pixels_csv`].
pub fn read_pixels_csv(path: &Path) -> Result<Vec<SelectedPixel>> {
    let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
    let bands = reader.headers().map_err(csv_error)?.len().saturating_sub(2);

    let mut pixels = Vec::new();
    for (row_no, result) in reader.records().enumerate() {
        let record = result.map_err(csv_error)?;
        let cell = |i: usize| -> Result<&str> {
            record
                .get(i)
                .ok_or_else(|| HappyError::missing(format!("CSV row {row_no}: column {i}")))
        };
        let parse_index = |i: usize| -> Result<usize> {
            let tok = cell(i)?;
            tok.trim()
                .parse()
                .map_err(|_| HappyError::config(format!("CSV row {row_no}: '{tok}' is not an index")))
        };
        let x = parse_index(0)?;
        let y = parse_index(1)?;
        let spectrum = (0..bands)
            .map(|b| {
                let tok = cell(b + 2)?;
                tok.trim().parse::<f64>().map_err(|_| {
                    HappyError::config(format!("CSV row {row_no}, band {b}: '{tok}' is not a number"))
                })
            })
            .collect::<Result<Array1<f64>>>()?;
        pixels.push(SelectedPixel { x, y, spectrum });
    }
    Ok(pixels)
}

fn csv_error(e: csv::Error) -> HappyError {
    if e.is_io_error() {
        match e.into_kind() {
            csv::ErrorKind::Io(io) => HappyError::Io(io),
            other => HappyError::config(format!("CSV: {other:?}")),
        }
    } else {
        HappyError::config(format!("CSV: {e}"))
    }
}
