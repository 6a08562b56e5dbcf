use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::normalize::WhiteReference;
use crate::error::{HappyError, Result};
use crate::preprocess::{MultiPreprocessor, Preprocessor, PreprocessorConfig};
use crate::region::RegionExtractor;
use crate::select::PixelSelector;
use crate::split::SplitSettings;

// ---------------------------------------------------------------------------
// Pipeline definition
// ---------------------------------------------------------------------------

/// A complete pipeline definition as stored on disk.
///
/// ```json
/// {
///   "normalization": "full",
///   "preprocessors": [{"class": "snv"}, {"class": "pca", "components": 5}],
///   "selector": {"class": "simple", "count": 100},
///   "extractor": {"class": "grid", "region_size": [16, 16]},
///   "splits": {"train_percent": 70, "validation_percent": 10}
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How white/black references are matched to scans; no normalization when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization: Option<WhiteReference>,
    #[serde(default)]
    pub preprocessors: Vec<PreprocessorConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<PixelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor: Option<RegionExtractor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splits: Option<SplitSettings>,
}

impl PipelineConfig {
    /// Reads and validates a definition. Malformed content is a config error.
    pub fn load_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| HappyError::config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        log::info!(
            "loaded pipeline from {} ({} preprocessors)",
            path.display(),
            config.preprocessors.len()
        );
        Ok(config)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for p in &self.preprocessors {
            p.validate()?;
        }
        if let Some(selector) = &self.selector {
            selector.validate()?;
        }
        if let Some(extractor) = &self.extractor {
            extractor.validate()?;
        }
        if let Some(splits) = &self.splits {
            splits.validate()?;
        }
        Ok(())
    }

    /// Fresh, unfitted chain of the configured preprocessors.
    pub fn build_chain(&self) -> MultiPreprocessor {
        let mut chain = MultiPreprocessor::new(self.preprocessors.clone());
        chain.reset();
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::criteria::{Criteria, CriteriaGroup, CriteriaOp};
    use crate::data::model::MetadataValue;
    use crate::preprocess::{Derivative, DerivativeMode, Pca, Snv, WavelengthSubset};
    use crate::region::GridRegionExtractor;
    use crate::select::SelectorSettings;

    fn full_config() -> PipelineConfig {
        let criteria = CriteriaGroup::new(vec![
            Criteria::keyed(CriteriaOp::GreaterThan, "weight", MetadataValue::Float(0.5)).unwrap(),
            Criteria::spectral(CriteriaOp::NotOutlier).unwrap(),
        ]);
        PipelineConfig {
            normalization: Some(WhiteReference::ColumnMean),
            preprocessors: vec![
                PreprocessorConfig::WavelengthSubset(WavelengthSubset::range(2, 9)),
                PreprocessorConfig::Snv(Snv {}),
                PreprocessorConfig::Derivative(Derivative::new(7, 2, 1, DerivativeMode::Valid)),
                PreprocessorConfig::Pca(Pca::new(3, 25.0, Some(1))),
            ],
            selector: Some(PixelSelector::simple(SelectorSettings::new(50, Some(criteria)))),
            extractor: Some(RegionExtractor::Grid(GridRegionExtractor {
                region_size: [4, 4],
                truncate_regions: false,
            })),
            splits: Some(SplitSettings::new(70.0, 10.0)),
        }
    }

    #[test]
    fn file_round_trip() {
        let config = full_config();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        config.save_json(&path).unwrap();
        let loaded = PipelineConfig::load_json(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(
            serde_json::to_value(&loaded).unwrap(),
            serde_json::to_value(&config).unwrap()
        );
    }

    #[test]
    fn minimal_document() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"preprocessors": [{"class": "pass_through"}]}"#).unwrap();
        assert!(config.selector.is_none());
        assert!(config.validate().is_ok());
        assert_eq!(config.build_chain().len(), 1);
    }

    #[test]
    fn unknown_class_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"preprocessors": [{"class": "wavelet"}]}"#).unwrap();
        assert!(matches!(PipelineConfig::load_json(&path), Err(HappyError::Config(_))));
    }

    #[test]
    fn validation_rejects_bad_parameters() {
        let mut config = full_config();
        config.preprocessors.push(PreprocessorConfig::Derivative(Derivative::new(
            4,
            2,
            1,
            DerivativeMode::Nearest,
        )));
        assert!(matches!(config.validate(), Err(HappyError::Config(_))));

        let mut config = full_config();
        config.selector = Some(PixelSelector::multi(vec![]));
        assert!(config.validate().is_err());

        let mut config = full_config();
        config.extractor = Some(RegionExtractor::Grid(GridRegionExtractor {
            region_size: [0, 4],
            truncate_regions: true,
        }));
        assert!(config.validate().is_err());

        let mut config = full_config();
        config.splits = Some(SplitSettings::new(40.0, 60.0));
        assert!(config.validate().is_err());
    }
}
