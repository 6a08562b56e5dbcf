use std::fmt;
use std::str::FromStr;

use ndarray::ArrayView1;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::model::{HappyData, MetadataValue};
use crate::error::{HappyError, Result};

// ---------------------------------------------------------------------------
// CriteriaOp – the closed set of supported predicates
// ---------------------------------------------------------------------------

/// Predicate applied by a [`Criteria`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CriteriaOp {
    NotMissing,
    Equals,
    GreaterThan,
    NotIn,
    In,
    Matches,
    SpectrumNotZero,
    NotOutlier,
}

impl CriteriaOp {
    pub const ALL: [CriteriaOp; 8] = [
        CriteriaOp::NotMissing,
        CriteriaOp::Equals,
        CriteriaOp::GreaterThan,
        CriteriaOp::NotIn,
        CriteriaOp::In,
        CriteriaOp::Matches,
        CriteriaOp::SpectrumNotZero,
        CriteriaOp::NotOutlier,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CriteriaOp::NotMissing => "not_missing",
            CriteriaOp::Equals => "equals",
            CriteriaOp::GreaterThan => "greater_than",
            CriteriaOp::NotIn => "not_in",
            CriteriaOp::In => "in",
            CriteriaOp::Matches => "matches",
            CriteriaOp::SpectrumNotZero => "spectrum_not_zero",
            CriteriaOp::NotOutlier => "not_outlier",
        }
    }

    /// Whether the operation reads a metadata key (the spectrum tests do not).
    pub fn uses_key(&self) -> bool {
        !matches!(self, CriteriaOp::SpectrumNotZero | CriteriaOp::NotOutlier)
    }
}

impl fmt::Display for CriteriaOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CriteriaOp {
    type Err = HappyError;

    fn from_str(s: &str) -> Result<Self> {
        CriteriaOp::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| HappyError::config(format!("unsupported criteria operation: {s}")))
    }
}

impl TryFrom<String> for CriteriaOp {
    type Error = HappyError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CriteriaOp> for String {
    fn from(op: CriteriaOp) -> Self {
        op.as_str().to_string()
    }
}

// ---------------------------------------------------------------------------
// Criteria – one predicate over a pixel
// ---------------------------------------------------------------------------

/// Serialized form: `{"operation": "in", "key": "class", "value": [1, 2]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CriteriaDef {
    operation: CriteriaOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default, skip_serializing_if = "MetadataValue::is_null")]
    value: MetadataValue,
}

/// A stateless predicate over one pixel's spectrum and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "CriteriaDef", into = "CriteriaDef")]
pub struct Criteria {
    operation: CriteriaOp,
    key: Option<String>,
    value: MetadataValue,
    pattern: Option<Regex>,
}

impl PartialEq for Criteria {
    fn eq(&self, other: &Self) -> bool {
        self.operation == other.operation && self.key == other.key && self.value == other.value
    }
}

impl TryFrom<CriteriaDef> for Criteria {
    type Error = HappyError;

    fn try_from(def: CriteriaDef) -> Result<Self> {
        Criteria::new(def.operation, def.key, def.value)
    }
}

impl From<Criteria> for CriteriaDef {
    fn from(c: Criteria) -> Self {
        CriteriaDef {
            operation: c.operation,
            key: c.key,
            value: c.value,
        }
    }
}

impl Criteria {
    /// Validates and builds a criteria.
    ///
    /// Key-based operations need a key; `matches` needs a valid pattern.
    pub fn new(operation: CriteriaOp, key: Option<String>, value: MetadataValue) -> Result<Self> {
        if operation.uses_key() && key.as_deref().map_or(true, str::is_empty) {
            return Err(HappyError::config(format!(
                "criteria '{operation}' requires a key"
            )));
        }
        let pattern = if operation == CriteriaOp::Matches {
            let MetadataValue::String(p) = &value else {
                return Err(HappyError::config(format!(
                    "criteria 'matches' requires a string pattern, got {value}"
                )));
            };
            Some(Regex::new(p).map_err(|e| HappyError::config(format!("invalid pattern: {e}")))?)
        } else {
            None
        };
        Ok(Self {
            operation,
            key,
            value,
            pattern,
        })
    }

    /// Key-based criteria shorthand.
    pub fn keyed(operation: CriteriaOp, key: &str, value: MetadataValue) -> Result<Self> {
        Self::new(operation, Some(key.to_string()), value)
    }

    /// Spectrum-only criteria shorthand.
    pub fn spectral(operation: CriteriaOp) -> Result<Self> {
        Self::new(operation, None, MetadataValue::Null)
    }

    pub fn operation(&self) -> CriteriaOp {
        self.operation
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &MetadataValue {
        &self.value
    }

    /// Evaluates the predicate at pixel `(x, y)`.
    ///
    /// A pixel outside the cube has no spectrum and never passes.
    pub fn check(&self, data: &HappyData, x: usize, y: usize) -> bool {
        let Some(spectrum) = data.get_spectrum(x, y) else {
            return false;
        };
        let lookup = || data.get_meta_data(x, y, self.key.as_deref().unwrap_or_default());
        match self.operation {
            CriteriaOp::SpectrumNotZero => spectrum.iter().all(|&v| v != 0.0),
            CriteriaOp::NotOutlier => is_not_outlier(spectrum),
            CriteriaOp::NotMissing => !lookup().is_null(),
            CriteriaOp::Equals => lookup().loose_eq(&self.value),
            CriteriaOp::GreaterThan => lookup().greater_than(&self.value),
            CriteriaOp::NotIn => !lookup().is_in(&self.value),
            CriteriaOp::In => lookup().is_in(&self.value),
            CriteriaOp::Matches => self.matches(&lookup()),
        }
    }

    fn matches(&self, value: &MetadataValue) -> bool {
        let Some(pattern) = &self.pattern else {
            return false;
        };
        match value {
            MetadataValue::Null => false,
            MetadataValue::String(s) => pattern.is_match(s),
            other => pattern.is_match(&other.to_string()),
        }
    }
}

/// Every band lies within two standard deviations of the spectrum's own mean.
fn is_not_outlier(spectrum: ArrayView1<'_, f64>) -> bool {
    let n = spectrum.len();
    if n == 0 {
        return true;
    }
    let mean = spectrum.sum() / n as f64;
    let var = spectrum.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    let limit = 2.0 * var.sqrt();
    spectrum.iter().all(|v| (v - mean).abs() <= limit)
}

// ---------------------------------------------------------------------------
// CriteriaGroup – conjunction of criteria
// ---------------------------------------------------------------------------

/// Ordered conjunction; evaluation stops at the first failing member.
/// Serialized as a plain JSON list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CriteriaGroup {
    criteria: Vec<Criteria>,
}

impl CriteriaGroup {
    pub fn new(criteria: Vec<Criteria>) -> Self {
        Self { criteria }
    }

    pub fn push(&mut self, criteria: Criteria) {
        self.criteria.push(criteria);
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Criteria> {
        self.criteria.iter()
    }

    /// `true` when every member passes; an empty group always passes.
    pub fn check(&self, data: &HappyData, x: usize, y: usize) -> bool {
        self.criteria.iter().all(|c| c.check(data, x, y))
    }

    /// Metadata keys consulted by the members, in first-use order.
    pub fn get_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for key in self.criteria.iter().filter_map(Criteria::key) {
            if !keys.iter().any(|k| k == key) {
                keys.push(key.to_string());
            }
        }
        keys
    }
}

impl FromIterator<Criteria> for CriteriaGroup {
    fn from_iter<I: IntoIterator<Item = Criteria>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::{GlobalDict, MetadataDict, MetadataLayer};
    use ndarray::{Array2, Array3};

    fn sample_with_classes(classes: &[f64]) -> HappyData {
        let w = classes.len();
        let mut cube = Array3::from_elem((1, w, 4), 1.0);
        cube[[0, 0, 2]] = 0.0;
        let layer = Array2::from_shape_vec((1, w), classes.to_vec()).unwrap();
        let mut layers = MetadataDict::new();
        layers.insert("class".into(), MetadataLayer::new(layer));
        let mut global = GlobalDict::new();
        global.insert("batch".into(), serde_json::json!("B-17"));
        HappyData::new("s", "r", cube, global, layers, None).unwrap()
    }

    fn int_list(values: &[i64]) -> MetadataValue {
        MetadataValue::List(values.iter().copied().map(MetadataValue::Integer).collect())
    }

    #[test]
    fn in_operation_scenario() {
        let data = sample_with_classes(&[2.0, 3.0]);
        let c = Criteria::keyed(CriteriaOp::In, "class", int_list(&[1, 2])).unwrap();
        assert!(c.check(&data, 0, 0));
        assert!(!c.check(&data, 1, 0));

        // absent both per-pixel and globally: null is never "in"
        let missing = Criteria::keyed(CriteriaOp::In, "grade", int_list(&[1, 2])).unwrap();
        assert!(!missing.check(&data, 0, 0));
        let not_in = Criteria::keyed(CriteriaOp::NotIn, "grade", int_list(&[1, 2])).unwrap();
        assert!(not_in.check(&data, 0, 0));
    }

    #[test]
    fn scalar_operations() {
        let data = sample_with_classes(&[2.0, f64::NAN]);
        let eq = Criteria::keyed(CriteriaOp::Equals, "class", MetadataValue::Float(2.0)).unwrap();
        let gt = Criteria::keyed(CriteriaOp::GreaterThan, "class", MetadataValue::Integer(1))
            .unwrap();
        let present =
            Criteria::keyed(CriteriaOp::NotMissing, "class", MetadataValue::Null).unwrap();
        assert!(eq.check(&data, 0, 0));
        assert!(gt.check(&data, 0, 0));
        assert!(present.check(&data, 0, 0));
        assert!(!present.check(&data, 1, 0));
        assert!(!gt.check(&data, 1, 0));
    }

    #[test]
    fn matches_falls_back_to_global() {
        let data = sample_with_classes(&[1.0]);
        let c = Criteria::keyed(CriteriaOp::Matches, "batch", MetadataValue::String("^B-\\d+".into()))
            .unwrap();
        assert!(c.check(&data, 0, 0));
        let numeric =
            Criteria::keyed(CriteriaOp::Matches, "class", MetadataValue::String("1".into())).unwrap();
        assert!(numeric.check(&data, 0, 0));
    }

    #[test]
    fn spectrum_operations() {
        let data = sample_with_classes(&[1.0, 1.0]);
        let nz = Criteria::spectral(CriteriaOp::SpectrumNotZero).unwrap();
        assert!(!nz.check(&data, 0, 0));
        assert!(nz.check(&data, 1, 0));
        // outside the image: no spectrum, no pass
        assert!(!nz.check(&data, 5, 0));
    }

    #[test]
    fn outlier_test_is_per_spectrum() {
        let flat = Array3::from_elem((1, 1, 5), 3.0);
        let flat = HappyData::from_cube("s", "r", flat, None).unwrap();
        let c = Criteria::spectral(CriteriaOp::NotOutlier).unwrap();
        assert!(c.check(&flat, 0, 0));

        let mut spiky = Array3::from_elem((1, 1, 10), 1.0);
        spiky[[0, 0, 4]] = 100.0;
        let spiky = HappyData::from_cube("s", "r", spiky, None).unwrap();
        assert!(!c.check(&spiky, 0, 0));
    }

    #[test]
    fn group_is_conjunction() {
        let data = sample_with_classes(&[2.0, 3.0, 1.0]);
        let a = Criteria::keyed(CriteriaOp::GreaterThan, "class", MetadataValue::Integer(1)).unwrap();
        let b = Criteria::spectral(CriteriaOp::SpectrumNotZero).unwrap();
        let group = CriteriaGroup::new(vec![a.clone(), b.clone()]);
        for x in 0..3 {
            assert_eq!(
                group.check(&data, x, 0),
                a.check(&data, x, 0) && b.check(&data, x, 0)
            );
        }
        assert!(CriteriaGroup::default().check(&data, 0, 0));
    }

    #[test]
    fn get_keys_ordered_and_unique() {
        let group: CriteriaGroup = [
            Criteria::keyed(CriteriaOp::NotMissing, "class", MetadataValue::Null).unwrap(),
            Criteria::spectral(CriteriaOp::NotOutlier).unwrap(),
            Criteria::keyed(CriteriaOp::Equals, "batch", MetadataValue::Integer(1)).unwrap(),
            Criteria::keyed(CriteriaOp::In, "class", int_list(&[1])).unwrap(),
        ]
        .into_iter()
        .collect();
        assert_eq!(group.get_keys(), vec!["class".to_string(), "batch".to_string()]);
    }

    #[test]
    fn group_grows_by_push() {
        let data = sample_with_classes(&[2.0, 3.0]);
        let mut group = CriteriaGroup::default();
        group.push(Criteria::keyed(CriteriaOp::In, "class", int_list(&[2, 3])).unwrap());
        assert!(group.check(&data, 0, 0));
        group.push(Criteria::spectral(CriteriaOp::SpectrumNotZero).unwrap());

        assert_eq!(group.len(), 2);
        let ops: Vec<_> = group.iter().map(|c| c.operation).collect();
        assert_eq!(ops, vec![CriteriaOp::In, CriteriaOp::SpectrumNotZero]);
        // pixel (0, 0) has a zero band
        assert!(!group.check(&data, 0, 0));
        assert!(group.check(&data, 1, 0));
    }

    #[test]
    fn serialization_is_idempotent() {
        let group = CriteriaGroup::new(vec![
            Criteria::keyed(CriteriaOp::In, "class", int_list(&[1, 2])).unwrap(),
            Criteria::spectral(CriteriaOp::SpectrumNotZero).unwrap(),
        ]);
        let json = serde_json::to_string(&group).unwrap();
        assert_eq!(
            json,
            r#"[{"operation":"in","key":"class","value":[1,2]},{"operation":"spectrum_not_zero"}]"#
        );
        let back: CriteriaGroup = serde_json::from_str(&json).unwrap();
        assert_eq!(back, group);
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }

    #[test]
    fn unsupported_operation_is_config_error() {
        assert!(matches!(
            "between".parse::<CriteriaOp>(),
            Err(HappyError::Config(_))
        ));
        let parsed = serde_json::from_str::<Criteria>(r#"{"operation":"between","key":"a"}"#);
        assert!(parsed.is_err());
        assert!(Criteria::new(CriteriaOp::Equals, None, MetadataValue::Integer(1)).is_err());
        assert!(
            Criteria::keyed(CriteriaOp::Matches, "a", MetadataValue::String("(".into())).is_err()
        );
    }
}
