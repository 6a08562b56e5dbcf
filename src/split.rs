/// Train/validation/test splits over sample or region ids.
///
/// Folds of a multi-fold repeat are independent random draws: each fold
/// shuffles the id universe on its own and takes its test set from the
/// front, so test sets of different folds may overlap. This is not a
/// disjoint k-fold partition.

use std::path::Path;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::data::loader::HappyReader;
use crate::error::{HappyError, Result};

// ---------------------------------------------------------------------------
// Persisted split document
// ---------------------------------------------------------------------------

/// One fold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitIds {
    pub train: Vec<String>,
    pub validation: Vec<String>,
    pub test: Vec<String>,
}

impl SplitIds {
    pub fn len(&self) -> usize {
        self.train.len() + self.validation.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All folds of one repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatSplits {
    pub repeats: Vec<SplitIds>,
}

/// On-disk form: `{happy_base_folder, splits: [{repeats: [...]}], holdout_ids}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitDocument {
    pub happy_base_folder: String,
    pub splits: Vec<RepeatSplits>,
    pub holdout_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

fn default_one() -> usize {
    1
}

/// Parameters of [`HappySplitter::generate_splits`]. Percentages are 0..=100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSettings {
    #[serde(default = "default_one")]
    pub num_repeats: usize,
    #[serde(default = "default_one")]
    pub num_folds: usize,
    pub train_percent: f64,
    #[serde(default)]
    pub validation_percent: f64,
    /// Split `sample:region` ids instead of sample ids.
    #[serde(default)]
    pub use_regions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holdout_percent: Option<f64>,
    /// Fixed seed; entropy when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl SplitSettings {
    pub fn new(train_percent: f64, validation_percent: f64) -> Self {
        Self {
            num_repeats: 1,
            num_folds: 1,
            train_percent,
            validation_percent,
            use_regions: false,
            holdout_percent: None,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_repeats == 0 || self.num_folds == 0 {
            return Err(HappyError::config("num_repeats and num_folds must be at least 1"));
        }
        if !(self.train_percent > 0.0 && self.train_percent <= 100.0) {
            return Err(HappyError::config(format!(
                "train_percent must be in (0, 100], got {}",
                self.train_percent
            )));
        }
        if !(0.0..=self.train_percent).contains(&self.validation_percent) {
            return Err(HappyError::config(format!(
                "validation_percent must be in [0, train_percent], got {}",
                self.validation_percent
            )));
        }
        if let Some(h) = self.holdout_percent {
            if !(0.0..100.0).contains(&h) {
                return Err(HappyError::config(format!("holdout_percent must be in [0, 100), got {h}")));
            }
        }
        Ok(())
    }
}

fn share(n: usize, percent: f64) -> usize {
    ((n as f64 * percent / 100.0).round() as usize).min(n)
}

// ---------------------------------------------------------------------------
// HappySplitter
// ---------------------------------------------------------------------------

/// Holds the id universe and the generated (or loaded) splits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HappySplitter {
    base_folder: String,
    /// Sample id with its region ids, in reader order.
    samples: Vec<(String, Vec<String>)>,
    splits: Vec<RepeatSplits>,
    holdout_ids: Vec<String>,
}

impl HappySplitter {
    pub fn new(base_folder: impl Into<String>, samples: Vec<(String, Vec<String>)>) -> Self {
        Self {
            base_folder: base_folder.into(),
            samples,
            ..Self::default()
        }
    }

    /// Collects every sample and its regions from `reader`.
    pub fn from_reader(base_folder: impl Into<String>, reader: &dyn HappyReader) -> Result<Self> {
        let samples = reader
            .get_sample_ids()?
            .into_iter()
            .map(|id| {
                let regions = reader.get_region_ids(&id)?;
                Ok((id, regions))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(base_folder, samples))
    }

    pub fn base_folder(&self) -> &str {
        &self.base_folder
    }

    /// Sample ids, or `sample:region` ids when `use_regions` is set.
    pub fn ids(&self, use_regions: bool) -> Vec<String> {
        if !use_regions {
            return self.samples.iter().map(|(s, _)| s.clone()).collect();
        }
        self.samples
            .iter()
            .flat_map(|(s, regions)| regions.iter().map(move |r| format!("{s}:{r}")))
            .collect()
    }

    /// Generates splits with `settings.seed`, or entropy when unset.
    pub fn generate_splits(&mut self, settings: &SplitSettings) -> Result<()> {
        let mut rng = settings
            .seed
            .map_or_else(ChaCha8Rng::from_entropy, ChaCha8Rng::seed_from_u64);
        self.generate_splits_with_rng(settings, &mut rng)
    }

    pub fn generate_splits_with_rng<R: Rng + ?Sized>(
        &mut self,
        settings: &SplitSettings,
        rng: &mut R,
    ) -> Result<()> {
        settings.validate()?;
        let mut universe = self.ids(settings.use_regions);
        if universe.is_empty() {
            return Err(HappyError::missing("no ids to split"));
        }

        let mut holdout = Vec::new();
        if let Some(percent) = settings.holdout_percent {
            universe.shuffle(rng);
            holdout = universe.drain(..share(universe.len(), percent)).collect();
        }

        let mut splits = Vec::with_capacity(settings.num_repeats);
        for _ in 0..settings.num_repeats {
            let folds = if settings.num_folds == 1 {
                let mut ids = universe.clone();
                ids.shuffle(rng);
                let test_count = share(ids.len(), 100.0 - settings.train_percent);
                vec![self.fold(ids, test_count, settings)]
            } else {
                let test_count = share(universe.len(), 100.0 / settings.num_folds as f64);
                (0..settings.num_folds)
                    .map(|_| {
                        let mut ids = universe.clone();
                        ids.shuffle(rng);
                        self.fold(ids, test_count, settings)
                    })
                    .collect()
            };
            splits.push(RepeatSplits { repeats: folds });
        }

        log::info!(
            "generated {} repeats x {} folds over {} ids ({} held out)",
            settings.num_repeats,
            settings.num_folds,
            universe.len(),
            holdout.len()
        );
        self.splits = splits;
        self.holdout_ids = holdout;
        Ok(())
    }

    /// Test ids from the front of the shuffled `ids`, then validation
    /// carved out of the remainder in proportion to the train share.
    fn fold(&self, mut ids: Vec<String>, test_count: usize, settings: &SplitSettings) -> SplitIds {
        let test: Vec<String> = ids.drain(..test_count).collect();
        let validation_count = ((ids.len() as f64 * settings.validation_percent / settings.train_percent)
            .round() as usize)
            .min(ids.len());
        let validation: Vec<String> = ids.drain(..validation_count).collect();
        SplitIds {
            train: ids,
            validation,
            test,
        }
    }

    pub fn get_train_validation_test_splits(&self, repeat: usize, fold: usize) -> Result<&SplitIds> {
        let folds = self.splits.get(repeat).ok_or(HappyError::OutOfRange {
            what: "repeat",
            index: repeat,
            len: self.splits.len(),
        })?;
        folds.repeats.get(fold).ok_or(HappyError::OutOfRange {
            what: "fold",
            index: fold,
            len: folds.repeats.len(),
        })
    }

    pub fn holdout_ids(&self) -> &[String] {
        &self.holdout_ids
    }

    pub fn num_repeats(&self) -> usize {
        self.splits.len()
    }

    pub fn num_folds(&self, repeat: usize) -> Result<usize> {
        self.splits
            .get(repeat)
            .map(|r| r.repeats.len())
            .ok_or(HappyError::OutOfRange {
                what: "repeat",
                index: repeat,
                len: self.splits.len(),
            })
    }

    pub fn to_document(&self) -> SplitDocument {
        SplitDocument {
            happy_base_folder: self.base_folder.clone(),
            splits: self.splits.clone(),
            holdout_ids: self.holdout_ids.clone(),
        }
    }

    pub fn save_splits_to_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(&self.to_document())?)?;
        log::info!("splits written to {}", path.display());
        Ok(())
    }

    /// Restores splits; the sample list is not part of the document.
    pub fn load_splits_from_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let doc: SplitDocument = serde_json::from_str(&text)?;
        Ok(Self {
            base_folder: doc.happy_base_folder,
            samples: Vec::new(),
            splits: doc.splits,
            holdout_ids: doc.holdout_ids,
        })
    }
}
