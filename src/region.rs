/// Region extraction: one sample in, labelled sub-images out.
///
/// Every emitted region is a cropped [`HappyData`] whose `region_id` is the
/// input's region id plus `_<suffix>`, with its bounding box stored in
/// `global_dict` under `left`, `top`, `right` and `bottom`. Extracted regions
/// may overlap.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::data::loader::load_mask_png;
use crate::data::model::{BoundingBox, HappyData};
use crate::error::{HappyError, Result};

/// Crops `bbox` out of `data` and tags it.
fn make_region(data: &HappyData, bbox: BoundingBox, suffix: &str) -> Result<HappyData> {
    let mut region = data
        .crop(&bbox)?
        .with_region_id(format!("{}_{suffix}", data.region_id()));
    region.set_global("left", bbox.left);
    region.set_global("top", bbox.top);
    region.set_global("right", bbox.right);
    region.set_global("bottom", bbox.bottom);
    Ok(region)
}

fn layer_of<'a>(data: &'a HappyData, key: &str) -> Result<&'a ndarray::Array2<f64>> {
    data.metadata_dict()
        .get(key)
        .map(|layer| &layer.data)
        .ok_or_else(|| HappyError::missing(format!("{}: no '{key}' layer", data.full_id())))
}

fn check_size(size: [usize; 2]) -> Result<()> {
    if size[0] == 0 || size[1] == 0 {
        return Err(HappyError::config(format!("region size {size:?} must be positive")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Full / Grid
// ---------------------------------------------------------------------------

/// The whole image as a single region.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FullRegionExtractor {}

/// Row-major tiling into `region_size = [width, height]` cells.
///
/// Edge cells that would leave the image are clipped when
/// `truncate_regions` is set and dropped otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRegionExtractor {
    pub region_size: [usize; 2],
    #[serde(default)]
    pub truncate_regions: bool,
}

impl GridRegionExtractor {
    fn extract(&self, data: &HappyData) -> Result<Vec<HappyData>> {
        check_size(self.region_size)?;
        let [rw, rh] = self.region_size;
        let (width, height) = (data.width(), data.height());
        let mut regions = Vec::new();
        for top in (0..height).step_by(rh) {
            for left in (0..width).step_by(rw) {
                let (right, bottom) = (left + rw, top + rh);
                if (right > width || bottom > height) && !self.truncate_regions {
                    continue;
                }
                let bbox = BoundingBox::new(left, top, right.min(width), bottom.min(height));
                let suffix = regions.len().to_string();
                regions.push(make_region(data, bbox, &suffix)?);
            }
        }
        Ok(regions)
    }
}

// ---------------------------------------------------------------------------
// Object
// ---------------------------------------------------------------------------

/// One fixed-size window per object of an object-id layer.
///
/// For every distinct non-zero id in `object_key` the window is centred on
/// the object's centroid and clamped to the image. The `target_name` value
/// at the object's first pixel (row-major) is attached to the region; an
/// object is only emitted when that value is a positive number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRegionExtractor {
    pub object_key: String,
    pub target_name: String,
    pub region_size: [usize; 2],
}

/// Start of a `size`-long window centred on `centre`, clamped to `[0, extent)`.
fn centred_start(centre: usize, size: usize, extent: usize) -> usize {
    centre.saturating_sub(size / 2).min(extent.saturating_sub(size))
}

impl ObjectRegionExtractor {
    fn extract(&self, data: &HappyData) -> Result<Vec<HappyData>> {
        check_size(self.region_size)?;
        let layer = layer_of(data, &self.object_key)?;

        // object id -> (first pixel, sum x, sum y, count)
        let mut objects: BTreeMap<i64, ((usize, usize), usize, usize, usize)> = BTreeMap::new();
        for ((y, x), &v) in layer.indexed_iter() {
            if v.is_nan() || v == 0.0 {
                continue;
            }
            let entry = objects.entry(v.round() as i64).or_insert(((x, y), 0, 0, 0));
            entry.1 += x;
            entry.2 += y;
            entry.3 += 1;
        }

        let [rw, rh] = self.region_size;
        let mut regions = Vec::new();
        for (id, ((fx, fy), sx, sy, n)) in objects {
            let target = data.get_meta_data(fx, fy, &self.target_name);
            if !target.as_f64().is_some_and(|t| t > 0.0) {
                log::debug!("{}: object {id} skipped, {} = {target}", data.full_id(), self.target_name);
                continue;
            }
            let cx = (sx as f64 / n as f64).round() as usize;
            let cy = (sy as f64 / n as f64).round() as usize;
            let left = centred_start(cx, rw, data.width());
            let top = centred_start(cy, rh, data.height());
            let bbox = BoundingBox::new(
                left,
                top,
                (left + rw).min(data.width()),
                (top + rh).min(data.height()),
            );
            let mut region = make_region(data, bbox, &id.to_string())?;
            region.set_global("object_id", id);
            region.set_global(self.target_name.clone(), JsonValue::from(target));
            regions.push(region);
        }
        Ok(regions)
    }
}

// ---------------------------------------------------------------------------
// Mask
// ---------------------------------------------------------------------------

/// Bounding box of every configured mask value.
///
/// The mask comes from the `mask_key` layer, or from `mask_file` when set
/// (an integer PNG aligned with the cube).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskRegionExtractor {
    pub mask_key: String,
    pub mask_types: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_file: Option<PathBuf>,
}

impl MaskRegionExtractor {
    fn extract(&self, data: &HappyData) -> Result<Vec<HappyData>> {
        let loaded;
        let mask = match &self.mask_file {
            Some(path) => {
                loaded = load_mask_png(path)?;
                if loaded.dim() != (data.height(), data.width()) {
                    let (mh, mw) = loaded.dim();
                    return Err(HappyError::shape_mismatch(
                        format!("mask {}", path.display()),
                        &[data.height(), data.width()],
                        &[mh, mw],
                    ));
                }
                &loaded
            }
            None => layer_of(data, &self.mask_key)?,
        };

        let mut regions = Vec::new();
        for &mask_type in &self.mask_types {
            let target = mask_type as f64;
            let mut bbox: Option<BoundingBox> = None;
            for ((y, x), &v) in mask.indexed_iter() {
                if v != target {
                    continue;
                }
                bbox = Some(match bbox {
                    None => BoundingBox::new(x, y, x + 1, y + 1),
                    Some(b) => BoundingBox::new(
                        b.left.min(x),
                        b.top.min(y),
                        b.right.max(x + 1),
                        b.bottom.max(y + 1),
                    ),
                });
            }
            let Some(bbox) = bbox else {
                log::debug!("{}: mask type {mask_type} not present", data.full_id());
                continue;
            };
            let mut region = make_region(data, bbox, &mask_type.to_string())?;
            region.set_global("mask_type", mask_type);
            regions.push(region);
        }
        Ok(regions)
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// A named rectangle, `(x, y)` being its top-left corner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRegion {
    pub name: String,
    pub x: usize,
    pub y: usize,
    pub w: usize,
    pub h: usize,
}

/// The `[{name, x, y, w, h}, ...]` region list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonRegions(pub Vec<JsonRegion>);

impl JsonRegions {
    pub fn load_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Crops externally defined rectangles. Rectangles reaching past the image
/// are clipped to it; those entirely outside are skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRegionExtractor {
    pub regions: JsonRegions,
}

impl JsonRegionExtractor {
    fn extract(&self, data: &HappyData) -> Result<Vec<HappyData>> {
        let mut regions = Vec::new();
        for r in &self.regions.0 {
            let bbox = BoundingBox::new(
                r.x,
                r.y,
                r.x.saturating_add(r.w).min(data.width()),
                r.y.saturating_add(r.h).min(data.height()),
            );
            if r.x >= data.width() || r.y >= data.height() || bbox.is_empty() {
                log::warn!("{}: region '{}' lies outside the image", data.full_id(), r.name);
                continue;
            }
            regions.push(make_region(data, bbox, &r.name)?);
        }
        Ok(regions)
    }
}

// ---------------------------------------------------------------------------
// RegionExtractor – the closed set of extractors
// ---------------------------------------------------------------------------

/// Every available extractor, tagged by `"class"` when serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum RegionExtractor {
    Full(FullRegionExtractor),
    Grid(GridRegionExtractor),
    Object(ObjectRegionExtractor),
    Mask(MaskRegionExtractor),
    Json(JsonRegionExtractor),
}

impl RegionExtractor {
    /// Checks parameters that can be judged without data.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Grid(e) => check_size(e.region_size),
            Self::Object(e) => check_size(e.region_size),
            Self::Mask(e) if e.mask_types.is_empty() => {
                Err(HappyError::config("mask extractor has no mask types"))
            }
            _ => Ok(()),
        }
    }

    pub fn extract_regions(&self, data: &HappyData) -> Result<Vec<HappyData>> {
        let regions = match self {
            Self::Full(_) => {
                let bbox = BoundingBox::new(0, 0, data.width(), data.height());
                vec![make_region(data, bbox, "0")?]
            }
            Self::Grid(e) => e.extract(data)?,
            Self::Object(e) => e.extract(data)?,
            Self::Mask(e) => e.extract(data)?,
            Self::Json(e) => e.extract(data)?,
        };
        log::debug!("{}: extracted {} regions", data.full_id(), regions.len());
        Ok(regions)
    }
}
