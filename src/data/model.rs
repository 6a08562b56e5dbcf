use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ndarray::{s, Array2, Array3, ArrayView1};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{HappyError, Result};
use crate::preprocess::Preprocessor;

/// Key of the fallback sub-mapping inside [`HappyData::global_dict`].
pub const META_DATA_KEY: &str = "meta_data";

// ---------------------------------------------------------------------------
// MetadataValue – a single metadata lookup result
// ---------------------------------------------------------------------------

/// A dynamically-typed metadata value.
/// Using `BTreeMap` / `BTreeSet` downstream so `MetadataValue` must be `Ord`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "JsonValue", into = "JsonValue")]
pub enum MetadataValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    List(Vec<MetadataValue>),
    Null,
}

impl Default for MetadataValue {
    fn default() -> Self {
        MetadataValue::Null
    }
}

// -- Manual Eq/Ord so we can put MetadataValue in BTreeSet --

impl Eq for MetadataValue {}

impl PartialOrd for MetadataValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetadataValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use MetadataValue::*;
        fn discriminant(v: &MetadataValue) -> u8 {
            match v {
                Null => 0,
                Bool(_) => 1,
                Integer(_) => 2,
                Float(_) => 3,
                String(_) => 4,
                List(_) => 5,
            }
        }
        let da = discriminant(self);
        let db = discriminant(other);
        if da != db {
            return da.cmp(&db);
        }
        match (self, other) {
            (Null, Null) => std::cmp::Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (List(a), List(b)) => a.cmp(b),
            _ => std::cmp::Ordering::Equal,
        }
    }
}

impl std::hash::Hash for MetadataValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            MetadataValue::String(s) => s.hash(state),
            MetadataValue::Integer(i) => i.hash(state),
            MetadataValue::Float(f) => f.to_bits().hash(state),
            MetadataValue::Bool(b) => b.hash(state),
            MetadataValue::List(items) => items.hash(state),
            MetadataValue::Null => {}
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::String(s) => write!(f, "{s}"),
            MetadataValue::Integer(i) => write!(f, "{i}"),
            MetadataValue::Float(v) => write!(f, "{v}"),
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            MetadataValue::Null => write!(f, "<null>"),
        }
    }
}

impl From<JsonValue> for MetadataValue {
    fn from(val: JsonValue) -> Self {
        MetadataValue::from(&val)
    }
}

impl From<&JsonValue> for MetadataValue {
    fn from(val: &JsonValue) -> Self {
        match val {
            JsonValue::String(s) => MetadataValue::String(s.clone()),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    MetadataValue::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    MetadataValue::Float(f)
                } else {
                    MetadataValue::String(n.to_string())
                }
            }
            JsonValue::Bool(b) => MetadataValue::Bool(*b),
            JsonValue::Null => MetadataValue::Null,
            JsonValue::Array(items) => MetadataValue::List(items.iter().map(Self::from).collect()),
            other => MetadataValue::String(other.to_string()),
        }
    }
}

impl From<MetadataValue> for JsonValue {
    fn from(val: MetadataValue) -> Self {
        match val {
            MetadataValue::String(s) => JsonValue::String(s),
            MetadataValue::Integer(i) => JsonValue::from(i),
            MetadataValue::Float(f) => {
                serde_json::Number::from_f64(f).map_or(JsonValue::Null, JsonValue::Number)
            }
            MetadataValue::Bool(b) => JsonValue::Bool(b),
            MetadataValue::List(items) => {
                JsonValue::Array(items.into_iter().map(JsonValue::from).collect())
            }
            MetadataValue::Null => JsonValue::Null,
        }
    }
}

impl MetadataValue {
    /// Try to interpret the value as an `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(v) => Some(*v),
            MetadataValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, MetadataValue::Null)
    }

    /// Equality that treats `2` and `2.0` as the same number.
    pub fn loose_eq(&self, other: &MetadataValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    /// Strict ordering test; values of incomparable kinds are never greater.
    pub fn greater_than(&self, other: &MetadataValue) -> bool {
        match (self, other) {
            (MetadataValue::String(a), MetadataValue::String(b)) => a > b,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
        }
    }

    /// Membership in a list value. A scalar `other` acts as a one-element list.
    pub fn is_in(&self, other: &MetadataValue) -> bool {
        match other {
            MetadataValue::List(items) => items.iter().any(|item| self.loose_eq(item)),
            single => self.loose_eq(single),
        }
    }

    /// Builds a value from a raw layer cell. `NaN` means unknown.
    fn from_cell(v: f64) -> Self {
        if v.is_nan() {
            MetadataValue::Null
        } else if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
            MetadataValue::Integer(v as i64)
        } else {
            MetadataValue::Float(v)
        }
    }
}

// ---------------------------------------------------------------------------
// MetadataLayer – one per-pixel auxiliary layer
// ---------------------------------------------------------------------------

/// A per-pixel layer (object mask, class labels, per-pixel targets) aligned
/// with the cube's `(height, width)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataLayer {
    /// `(height, width)` values; `NaN` marks pixels without a value.
    pub data: Array2<f64>,
    /// Optional integer code → label mapping.
    pub mapping: Option<BTreeMap<i64, String>>,
}

impl MetadataLayer {
    pub fn new(data: Array2<f64>) -> Self {
        Self {
            data,
            mapping: None,
        }
    }

    pub fn with_mapping(data: Array2<f64>, mapping: BTreeMap<i64, String>) -> Self {
        Self {
            data,
            mapping: Some(mapping),
        }
    }

    /// `(height, width)` of the layer.
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Value at `(x, y)`, translated through the mapping when one is set.
    /// Out-of-bounds coordinates yield `Null`.
    pub fn value_at(&self, x: usize, y: usize) -> MetadataValue {
        let Some(&cell) = self.data.get((y, x)) else {
            return MetadataValue::Null;
        };
        let value = MetadataValue::from_cell(cell);
        match (&self.mapping, &value) {
            (Some(mapping), MetadataValue::Integer(code)) => mapping
                .get(code)
                .map_or(value.clone(), |label| MetadataValue::String(label.clone())),
            _ => value,
        }
    }

    /// Crops the layer to `bbox`, which must already be within bounds.
    pub(crate) fn crop(&self, bbox: &BoundingBox) -> Self {
        Self {
            data: self
                .data
                .slice(s![bbox.top..bbox.bottom, bbox.left..bbox.right])
                .to_owned(),
            mapping: self.mapping.clone(),
        }
    }
}

/// Sample/region level metadata.
pub type GlobalDict = BTreeMap<String, JsonValue>;

/// Per-pixel metadata layers keyed by target name.
pub type MetadataDict = BTreeMap<String, MetadataLayer>;

// ---------------------------------------------------------------------------
// BoundingBox – region geometry
// ---------------------------------------------------------------------------

/// Pixel rectangle; `right`/`bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: usize,
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
}

impl BoundingBox {
    pub fn new(left: usize, top: usize, right: usize, bottom: usize) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> usize {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> usize {
        self.bottom.saturating_sub(self.top)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

// ---------------------------------------------------------------------------
// HappyData – one sample or region
// ---------------------------------------------------------------------------

/// A spectral cube with its wavelength axis and metadata.
///
/// Invariants, checked by [`HappyData::new`]:
/// * `data` is `(height, width, bands)`
/// * every metadata layer is `(height, width)`
/// * `wavelengths`, when present, has one entry per band
/// * `global_dict` always holds a `"meta_data"` object
#[derive(Debug, Clone, PartialEq)]
pub struct HappyData {
    sample_id: String,
    region_id: String,
    data: Array3<f64>,
    global_dict: GlobalDict,
    metadata_dict: MetadataDict,
    wavelengths: Option<Vec<f64>>,
}

impl HappyData {
    /// Builds a new instance, validating shapes.
    pub fn new(
        sample_id: impl Into<String>,
        region_id: impl Into<String>,
        data: Array3<f64>,
        mut global_dict: GlobalDict,
        metadata_dict: MetadataDict,
        wavelengths: Option<Vec<f64>>,
    ) -> Result<Self> {
        let (height, width, bands) = data.dim();
        for (name, layer) in &metadata_dict {
            if layer.shape() != (height, width) {
                let (lh, lw) = layer.shape();
                return Err(HappyError::shape_mismatch(
                    format!("metadata layer '{name}'"),
                    &[height, width],
                    &[lh, lw],
                ));
            }
        }
        if let Some(w) = &wavelengths {
            if w.len() != bands {
                return Err(HappyError::shape_mismatch(
                    "wavelengths",
                    &[bands],
                    &[w.len()],
                ));
            }
        }
        global_dict
            .entry(META_DATA_KEY.to_string())
            .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));

        Ok(Self {
            sample_id: sample_id.into(),
            region_id: region_id.into(),
            data,
            global_dict,
            metadata_dict,
            wavelengths,
        })
    }

    /// Cube without any metadata.
    pub fn from_cube(
        sample_id: impl Into<String>,
        region_id: impl Into<String>,
        data: Array3<f64>,
        wavelengths: Option<Vec<f64>>,
    ) -> Result<Self> {
        Self::new(
            sample_id,
            region_id,
            data,
            GlobalDict::new(),
            MetadataDict::new(),
            wavelengths,
        )
    }

    pub fn sample_id(&self) -> &str {
        &self.sample_id
    }

    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    /// `"sample_id:region_id"`.
    pub fn full_id(&self) -> String {
        format!("{}:{}", self.sample_id, self.region_id)
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn wavelengths(&self) -> Option<&[f64]> {
        self.wavelengths.as_deref()
    }

    pub fn global_dict(&self) -> &GlobalDict {
        &self.global_dict
    }

    pub fn metadata_dict(&self) -> &MetadataDict {
        &self.metadata_dict
    }

    pub fn height(&self) -> usize {
        self.data.dim().0
    }

    pub fn width(&self) -> usize {
        self.data.dim().1
    }

    pub fn num_bands(&self) -> usize {
        self.data.dim().2
    }

    /// `[height, width, bands]`.
    pub fn shape(&self) -> [usize; 3] {
        let (h, w, b) = self.data.dim();
        [h, w, b]
    }

    /// Spectrum at `(x, y)`, or `None` outside the image.
    pub fn get_spectrum(&self, x: usize, y: usize) -> Option<ArrayView1<'_, f64>> {
        if x >= self.width() || y >= self.height() {
            return None;
        }
        Some(self.data.slice(s![y, x, ..]))
    }

    /// Looks `key` up for pixel `(x, y)`.
    ///
    /// Order: per-pixel layer, `global_dict[key]`, `global_dict["meta_data"][key]`.
    /// A present per-pixel layer is authoritative even where its cell is unknown.
    pub fn get_meta_data(&self, x: usize, y: usize, key: &str) -> MetadataValue {
        if let Some(layer) = self.metadata_dict.get(key) {
            return layer.value_at(x, y);
        }
        self.get_global(key)
    }

    /// Sample-level lookup: `global_dict[key]`, then `global_dict["meta_data"][key]`.
    pub fn get_global(&self, key: &str) -> MetadataValue {
        if let Some(val) = self.global_dict.get(key) {
            return MetadataValue::from(val);
        }
        self.global_dict
            .get(META_DATA_KEY)
            .and_then(|meta| meta.get(key))
            .map_or(MetadataValue::Null, MetadataValue::from)
    }

    /// Whether `key` can be resolved at pixel or sample level.
    pub fn has_key(&self, key: &str) -> bool {
        self.metadata_dict.contains_key(key) || !self.get_global(key).is_null()
    }

    /// Whether `key` is a per-pixel layer.
    pub fn has_pixel_key(&self, key: &str) -> bool {
        self.metadata_dict.contains_key(key)
    }

    /// Distinct known values of a per-pixel layer.
    pub fn unique_values(&self, key: &str) -> BTreeSet<MetadataValue> {
        let Some(layer) = self.metadata_dict.get(key) else {
            return BTreeSet::new();
        };
        let (height, width) = layer.shape();
        let mut values = BTreeSet::new();
        for y in 0..height {
            for x in 0..width {
                let v = layer.value_at(x, y);
                if !v.is_null() {
                    values.insert(v);
                }
            }
        }
        values
    }

    /// Sets a sample-level value.
    pub fn set_global(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.global_dict.insert(key.into(), value.into());
    }

    /// Adds (or replaces) a per-pixel layer.
    pub fn add_metadata_layer(&mut self, name: impl Into<String>, layer: MetadataLayer) -> Result<()> {
        let name = name.into();
        if layer.shape() != (self.height(), self.width()) {
            let (lh, lw) = layer.shape();
            return Err(HappyError::shape_mismatch(
                format!("metadata layer '{name}'"),
                &[self.height(), self.width()],
                &[lh, lw],
            ));
        }
        self.metadata_dict.insert(name, layer);
        Ok(())
    }

    /// Copy of this instance with a different region id.
    pub fn with_region_id(&self, region_id: impl Into<String>) -> Self {
        Self {
            region_id: region_id.into(),
            ..self.clone()
        }
    }

    /// Crops cube and layers to `bbox`. Fails if the box leaves the image.
    pub fn crop(&self, bbox: &BoundingBox) -> Result<Self> {
        if bbox.right > self.width() || bbox.bottom > self.height() || bbox.is_empty() {
            return Err(HappyError::config(format!(
                "crop window {bbox:?} exceeds image bounds {}x{}",
                self.width(),
                self.height()
            )));
        }
        let data = self
            .data
            .slice(s![bbox.top..bbox.bottom, bbox.left..bbox.right, ..])
            .to_owned();
        let metadata_dict = self
            .metadata_dict
            .iter()
            .map(|(name, layer)| (name.clone(), layer.crop(bbox)))
            .collect();
        Ok(Self {
            sample_id: self.sample_id.clone(),
            region_id: self.region_id.clone(),
            data,
            global_dict: self.global_dict.clone(),
            metadata_dict,
            wavelengths: self.wavelengths.clone(),
        })
    }

    /// Runs one preprocessor over this instance, fitting it first if needed.
    ///
    /// Spectral preprocessors hand back an empty metadata mapping, which keeps
    /// the current layers; spatial ones return the transformed layers.
    pub fn apply_preprocessor(&self, preprocessor: &mut dyn Preprocessor) -> Result<Self> {
        if !preprocessor.is_fitted() {
            preprocessor.fit(&self.data, &self.metadata_dict)?;
        }
        let (data, layers) = preprocessor.apply(&self.data, &self.metadata_dict)?;
        let metadata_dict = if layers.is_empty() {
            self.metadata_dict.clone()
        } else {
            layers
        };
        let wavelengths = self
            .wavelengths
            .as_deref()
            .map(|w| preprocessor.transform_wavelengths(w));
        log::debug!(
            "{}: {} {:?} -> {:?}",
            self.full_id(),
            preprocessor.name(),
            self.shape(),
            data.dim()
        );
        Self::new(
            self.sample_id.clone(),
            self.region_id.clone(),
            data,
            self.global_dict.clone(),
            metadata_dict,
            wavelengths,
        )
    }
}
