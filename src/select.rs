/// Pixel selection: bounded random samples of `(x, y, spectrum)` from one cube.
///
/// Each call draws a fresh uniformly random permutation of the candidate
/// pixels, so two calls on the same data generally return different pixels.
/// This is intended; pass a seeded generator to
/// [`PixelSelector::select_pixels_with_rng`] for reproducible selections.
use ndarray::Array1;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::data::criteria::CriteriaGroup;
use crate::data::model::{HappyData, MetadataValue};
use crate::error::{HappyError, Result};

// ---------------------------------------------------------------------------
// Shared settings
// ---------------------------------------------------------------------------

/// Which pixels are considered at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// Every pixel of the cube.
    #[default]
    All,
    /// Only pixels where each per-pixel layer used by the criteria is known.
    KnownMetadata,
}

fn default_true() -> bool {
    true
}

fn default_background_key() -> String {
    "class".to_string()
}

fn default_background_value() -> MetadataValue {
    MetadataValue::Integer(0)
}

/// Settings common to every selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorSettings {
    /// Upper bound on returned pixels.
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<CriteriaGroup>,
    #[serde(default = "default_true")]
    pub include_background: bool,
    /// Metadata key marking background pixels.
    #[serde(default = "default_background_key")]
    pub background_key: String,
    /// Value of `background_key` that means "background".
    #[serde(default = "default_background_value")]
    pub background_value: MetadataValue,
    #[serde(default)]
    pub candidates: CandidateSource,
}

impl SelectorSettings {
    pub fn new(count: usize, criteria: Option<CriteriaGroup>) -> Self {
        Self {
            count,
            criteria,
            include_background: true,
            background_key: default_background_key(),
            background_value: default_background_value(),
            candidates: CandidateSource::All,
        }
    }

    /// Drops pixels whose `background_key` equals `background_value`.
    pub fn excluding_background(mut self) -> Self {
        self.include_background = false;
        self
    }

    pub fn with_candidates(mut self, candidates: CandidateSource) -> Self {
        self.candidates = candidates;
        self
    }

    fn passes(&self, data: &HappyData, x: usize, y: usize) -> bool {
        self.criteria
            .as_ref()
            .map_or(true, |group| group.check(data, x, y))
    }

    /// Pre-filtered, unshuffled candidate pixels. Empty when a criteria key
    /// cannot be resolved anywhere in `data`.
    fn candidate_pixels(&self, data: &HappyData) -> Vec<(usize, usize)> {
        let keys = self
            .criteria
            .as_ref()
            .map(CriteriaGroup::get_keys)
            .unwrap_or_default();
        if let Some(missing) = keys.iter().find(|k| !data.has_key(k)) {
            log::debug!("{}: no metadata for '{missing}', nothing to select", data.full_id());
            return Vec::new();
        }
        let pixel_keys: Vec<&String> = keys.iter().filter(|k| data.has_pixel_key(k)).collect();

        let mut out = Vec::with_capacity(data.height() * data.width());
        for y in 0..data.height() {
            for x in 0..data.width() {
                if self.candidates == CandidateSource::KnownMetadata
                    && pixel_keys
                        .iter()
                        .any(|k| data.get_meta_data(x, y, k).is_null())
                {
                    continue;
                }
                if !self.include_background
                    && data
                        .get_meta_data(x, y, &self.background_key)
                        .loose_eq(&self.background_value)
                {
                    continue;
                }
                out.push((x, y));
            }
        }
        out
    }
}

/// One selected pixel. `spectrum` is the pixel's own or an averaged spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedPixel {
    pub x: usize,
    pub y: usize,
    pub spectrum: Array1<f64>,
}

// ---------------------------------------------------------------------------
// Selector variants
// ---------------------------------------------------------------------------

/// Accepts the first `count` shuffled candidates that pass the criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleSelector {
    #[serde(flatten)]
    pub settings: SelectorSettings,
}

impl SimpleSelector {
    fn select<R: Rng + ?Sized>(&self, data: &HappyData, rng: &mut R) -> Vec<SelectedPixel> {
        let s = &self.settings;
        let mut candidates = s.candidate_pixels(data);
        candidates.shuffle(rng);
        let mut out = Vec::with_capacity(s.count.min(candidates.len()));
        for (x, y) in candidates {
            if out.len() >= s.count {
                break;
            }
            if !s.passes(data, x, y) {
                continue;
            }
            if let Some(spectrum) = data.get_spectrum(x, y) {
                out.push(SelectedPixel {
                    x,
                    y,
                    spectrum: spectrum.to_owned(),
                });
            }
        }
        out
    }
}

/// Like [`SimpleSelector`], but the whole `(2 * grid_size + 1)²` neighbourhood
/// must lie inside the image and pass the criteria; the returned spectrum is
/// the neighbourhood mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AveragedGridSelector {
    #[serde(flatten)]
    pub settings: SelectorSettings,
    pub grid_size: usize,
}

impl AveragedGridSelector {
    fn neighbourhood_mean(&self, data: &HappyData, x: usize, y: usize) -> Option<Array1<f64>> {
        let r = self.grid_size;
        if x < r || y < r || x + r >= data.width() || y + r >= data.height() {
            return None;
        }
        let mut sum: Array1<f64> = Array1::zeros(data.num_bands());
        for ny in (y - r)..=(y + r) {
            for nx in (x - r)..=(x + r) {
                if !self.settings.passes(data, nx, ny) {
                    return None;
                }
                sum += &data.get_spectrum(nx, ny)?;
            }
        }
        let n = ((2 * r + 1) * (2 * r + 1)) as f64;
        Some(sum / n)
    }

    fn select<R: Rng + ?Sized>(&self, data: &HappyData, rng: &mut R) -> Vec<SelectedPixel> {
        let s = &self.settings;
        let mut candidates = s.candidate_pixels(data);
        candidates.shuffle(rng);
        let mut out = Vec::new();
        for (x, y) in candidates {
            if out.len() >= s.count {
                break;
            }
            if let Some(spectrum) = self.neighbourhood_mean(data, x, y) {
                out.push(SelectedPixel { x, y, spectrum });
            }
        }
        out
    }
}

/// Samples whole columns. For each accepted column the result is the mean
/// spectrum of the column's candidate pixels passing the criteria, reported
/// at the first such row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnWiseSelector {
    #[serde(flatten)]
    pub settings: SelectorSettings,
}

impl ColumnWiseSelector {
    fn select<R: Rng + ?Sized>(&self, data: &HappyData, rng: &mut R) -> Vec<SelectedPixel> {
        let s = &self.settings;
        let mut columns: Vec<Vec<usize>> = vec![Vec::new(); data.width()];
        for (x, y) in s.candidate_pixels(data) {
            if s.passes(data, x, y) {
                columns[x].push(y);
            }
        }
        let mut order: Vec<usize> = (0..data.width()).collect();
        order.shuffle(rng);

        let mut out = Vec::new();
        for x in order {
            if out.len() >= s.count {
                break;
            }
            let rows = &columns[x];
            let Some(&first) = rows.first() else {
                continue;
            };
            let mut sum: Array1<f64> = Array1::zeros(data.num_bands());
            for &y in rows {
                if let Some(spectrum) = data.get_spectrum(x, y) {
                    sum += &spectrum;
                }
            }
            out.push(SelectedPixel {
                x,
                y: first,
                spectrum: sum / rows.len() as f64,
            });
        }
        out
    }
}

/// Concatenates the selections of its members, e.g. one per class quota.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiSelector {
    pub selectors: Vec<PixelSelector>,
}

// ---------------------------------------------------------------------------
// PixelSelector – the closed set of selectors
// ---------------------------------------------------------------------------

/// Every available selector, tagged by `"class"` when serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum PixelSelector {
    Simple(SimpleSelector),
    AveragedGrid(AveragedGridSelector),
    ColumnWise(ColumnWiseSelector),
    Multi(MultiSelector),
}

impl PixelSelector {
    pub fn simple(settings: SelectorSettings) -> Self {
        Self::Simple(SimpleSelector { settings })
    }

    pub fn averaged_grid(settings: SelectorSettings, grid_size: usize) -> Self {
        Self::AveragedGrid(AveragedGridSelector {
            settings,
            grid_size,
        })
    }

    pub fn column_wise(settings: SelectorSettings) -> Self {
        Self::ColumnWise(ColumnWiseSelector { settings })
    }

    pub fn multi(selectors: Vec<PixelSelector>) -> Self {
        Self::Multi(MultiSelector { selectors })
    }

    /// Rejects selectors that can never return a pixel.
    pub fn validate(&self) -> Result<()> {
        let settings = match self {
            Self::Simple(s) => &s.settings,
            Self::AveragedGrid(s) => &s.settings,
            Self::ColumnWise(s) => &s.settings,
            Self::Multi(m) if m.selectors.is_empty() => {
                return Err(HappyError::config("multi selector has no members"));
            }
            Self::Multi(m) => return m.selectors.iter().try_for_each(Self::validate),
        };
        if settings.count == 0 {
            return Err(HappyError::config("selector count must be at least 1"));
        }
        Ok(())
    }

    /// Selects with a fresh, entropy-seeded permutation (not reproducible).
    pub fn select_pixels(&self, data: &HappyData) -> Vec<SelectedPixel> {
        self.select_pixels_with_rng(data, &mut rand::thread_rng())
    }

    /// Selects using the caller's generator.
    pub fn select_pixels_with_rng<R: Rng + ?Sized>(
        &self,
        data: &HappyData,
        rng: &mut R,
    ) -> Vec<SelectedPixel> {
        let out = match self {
            Self::Simple(s) => s.select(data, rng),
            Self::AveragedGrid(s) => s.select(data, rng),
            Self::ColumnWise(s) => s.select(data, rng),
            Self::Multi(m) => m
                .selectors
                .iter()
                .flat_map(|s| s.select_pixels_with_rng(data, rng))
                .collect(),
        };
        log::debug!("{}: selected {} pixels", data.full_id(), out.len());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::criteria::{Criteria, CriteriaOp};
    use crate::data::model::MetadataLayer;
    use ndarray::{Array2, Array3};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::BTreeSet;

    /// 6x4 image; class = x % 3 (0 is background), spectrum = [x, y, 1].
    fn sample() -> HappyData {
        let cube = Array3::from_shape_fn((4, 6, 3), |(y, x, b)| match b {
            0 => x as f64,
            1 => y as f64,
            _ => 1.0,
        });
        let mut hd = HappyData::from_cube("s", "r", cube, None).unwrap();
        let classes = Array2::from_shape_fn((4, 6), |(_, x)| (x % 3) as f64);
        hd.add_metadata_layer("class", MetadataLayer::new(classes)).unwrap();
        hd
    }

    fn class_is(v: i64) -> CriteriaGroup {
        CriteriaGroup::new(vec![Criteria::keyed(
            CriteriaOp::Equals,
            "class",
            MetadataValue::Integer(v),
        )
        .unwrap()])
    }

    #[test]
    fn selection_is_bounded_unique_and_valid() {
        let data = sample();
        let criteria = class_is(2);
        let selector = PixelSelector::simple(SelectorSettings::new(5, Some(criteria.clone())));
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let picked = selector.select_pixels_with_rng(&data, &mut rng);
        assert_eq!(picked.len(), 5);
        let coords: BTreeSet<(usize, usize)> = picked.iter().map(|p| (p.x, p.y)).collect();
        assert_eq!(coords.len(), picked.len());
        for p in &picked {
            assert!(criteria.check(&data, p.x, p.y));
            assert_eq!(p.spectrum, data.get_spectrum(p.x, p.y).unwrap().to_owned());
        }
    }

    #[test]
    fn fewer_matches_than_count() {
        let data = sample();
        let selector = PixelSelector::simple(SelectorSettings::new(100, Some(class_is(1))));
        assert_eq!(selector.select_pixels(&data).len(), 8);
    }

    #[test]
    fn background_excluded_before_sampling() {
        let data = sample();
        let selector = PixelSelector::simple(SelectorSettings::new(100, None).excluding_background());
        let picked = selector.select_pixels(&data);
        assert_eq!(picked.len(), 16);
        assert!(picked.iter().all(|p| p.x % 3 != 0));
    }

    #[test]
    fn missing_key_yields_nothing() {
        let data = sample();
        let criteria = CriteriaGroup::new(vec![Criteria::keyed(
            CriteriaOp::NotMissing,
            "ripeness",
            MetadataValue::Null,
        )
        .unwrap()]);
        let selector = PixelSelector::simple(SelectorSettings::new(3, Some(criteria)));
        assert!(selector.select_pixels(&data).is_empty());
    }

    #[test]
    fn known_metadata_candidates() {
        let mut data = sample();
        let mut grade = Array2::from_elem((4, 6), f64::NAN);
        grade[[1, 1]] = 1.0;
        grade[[2, 4]] = 2.0;
        data.add_metadata_layer("grade", MetadataLayer::new(grade)).unwrap();
        let criteria = CriteriaGroup::new(vec![Criteria::keyed(
            CriteriaOp::NotIn,
            "grade",
            MetadataValue::List(vec![MetadataValue::Integer(7)]),
        )
        .unwrap()]);
        let all = PixelSelector::simple(SelectorSettings::new(50, Some(criteria.clone())));
        assert_eq!(all.select_pixels(&data).len(), 24);
        let known = PixelSelector::simple(
            SelectorSettings::new(50, Some(criteria)).with_candidates(CandidateSource::KnownMetadata),
        );
        assert_eq!(known.select_pixels(&data).len(), 2);
    }

    #[test]
    fn seeded_selection_is_reproducible() {
        let data = sample();
        let selector = PixelSelector::simple(SelectorSettings::new(4, None));
        let a = selector.select_pixels_with_rng(&data, &mut ChaCha8Rng::seed_from_u64(9));
        let b = selector.select_pixels_with_rng(&data, &mut ChaCha8Rng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn averaged_grid_needs_clean_neighbourhood() {
        let mut data = sample();
        let flags = Array2::from_shape_fn((4, 6), |(y, x)| if x >= 3 && y <= 2 { 1.0 } else { 0.0 });
        data.add_metadata_layer("inside", MetadataLayer::new(flags)).unwrap();
        let criteria = CriteriaGroup::new(vec![Criteria::keyed(
            CriteriaOp::Equals,
            "inside",
            MetadataValue::Integer(1),
        )
        .unwrap()]);
        let selector = PixelSelector::averaged_grid(SelectorSettings::new(10, Some(criteria)), 1);
        let picked = selector.select_pixels(&data);
        // only x = 4, y = 1 has a full 3x3 block inside the flagged area
        assert_eq!(picked.len(), 1);
        assert_eq!((picked[0].x, picked[0].y), (4, 1));
        assert_eq!(picked[0].spectrum.to_vec(), vec![4.0, 1.0, 1.0]);
    }

    #[test]
    fn column_wise_averages_columns() {
        let data = sample();
        let selector = PixelSelector::column_wise(SelectorSettings::new(10, Some(class_is(1))));
        let mut picked = selector.select_pixels(&data);
        picked.sort_by_key(|p| p.x);
        assert_eq!(picked.iter().map(|p| p.x).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(picked[0].y, 0);
        assert_eq!(picked[1].spectrum.to_vec(), vec![4.0, 1.5, 1.0]);
    }

    #[test]
    fn multi_selector_concatenates_quotas() {
        let data = sample();
        let selector = PixelSelector::multi(vec![
            PixelSelector::simple(SelectorSettings::new(2, Some(class_is(1)))),
            PixelSelector::simple(SelectorSettings::new(3, Some(class_is(2)))),
        ]);
        let picked = selector.select_pixels(&data);
        assert_eq!(picked.len(), 5);
        assert!(picked[..2].iter().all(|p| p.x % 3 == 1));
        assert!(picked[2..].iter().all(|p| p.x % 3 == 2));
    }

    #[test]
    fn config_round_trip() {
        let selector = PixelSelector::multi(vec![
            PixelSelector::simple(SelectorSettings::new(2, Some(class_is(1))).excluding_background()),
            PixelSelector::averaged_grid(SelectorSettings::new(3, None), 2),
        ]);
        let json = serde_json::to_value(&selector).unwrap();
        assert_eq!(json["class"], "multi");
        assert_eq!(json["selectors"][1]["class"], "averaged_grid");
        assert_eq!(json["selectors"][1]["grid_size"], 2);
        let back: PixelSelector = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back, selector);
        assert_eq!(serde_json::to_value(&back).unwrap(), json);
    }
}
