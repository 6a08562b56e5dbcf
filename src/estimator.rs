/// Model boundary: anything that can be fitted on ids and predict for ids.

use crate::data::loader::HappyReader;
use crate::data::model::MetadataValue;
use crate::error::{HappyError, Result};
use crate::split::HappySplitter;

/// Predictions for a list of ids, with the known targets when requested.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub predictions: Vec<MetadataValue>,
    pub actuals: Option<Vec<MetadataValue>>,
}

/// A trainable model over sample or region ids.
pub trait HappyModel {
    fn fit(&mut self, ids: &[String], target: &str) -> Result<()>;

    /// Fails with `NotFitted` before [`HappyModel::fit`].
    fn predict(&self, ids: &[String], return_actuals: bool) -> Result<Prediction>;
}

/// Outcome of one fold.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldResult {
    pub repeat: usize,
    pub fold: usize,
    pub test_ids: Vec<String>,
    pub prediction: Prediction,
}

/// Fits `model` on the fold's train ids and predicts its test ids.
pub fn run_fold(
    model: &mut dyn HappyModel,
    splitter: &HappySplitter,
    repeat: usize,
    fold: usize,
    target: &str,
) -> Result<FoldResult> {
    let split = splitter.get_train_validation_test_splits(repeat, fold)?;
    model.fit(&split.train, target)?;
    let prediction = model.predict(&split.test, true)?;
    log::info!(
        "repeat {repeat} fold {fold}: trained on {}, predicted {}",
        split.train.len(),
        split.test.len()
    );
    Ok(FoldResult {
        repeat,
        fold,
        test_ids: split.test.clone(),
        prediction,
    })
}

// ---------------------------------------------------------------------------
// MeanBaseline
// ---------------------------------------------------------------------------

/// Predicts the training mean of a numeric sample-level target.
#[derive(Debug)]
pub struct MeanBaseline<'a, R: HappyReader> {
    reader: &'a R,
    target: String,
    mean: Option<f64>,
}

impl<'a, R: HappyReader> MeanBaseline<'a, R> {
    pub fn new(reader: &'a R) -> Self {
        Self {
            reader,
            target: String::new(),
            mean: None,
        }
    }

    /// Target value of every region behind `id`.
    fn targets(&self, id: &str, target: &str) -> Result<Vec<MetadataValue>> {
        Ok(self
            .reader
            .load_data(id)?
            .iter()
            .map(|hd| hd.get_global(target))
            .collect())
    }
}

impl<R: HappyReader> HappyModel for MeanBaseline<'_, R> {
    fn fit(&mut self, ids: &[String], target: &str) -> Result<()> {
        let mut values = Vec::new();
        for id in ids {
            values.extend(self.targets(id, target)?.iter().filter_map(MetadataValue::as_f64));
        }
        if values.is_empty() {
            return Err(HappyError::missing(format!("no numeric '{target}' values to fit on")));
        }
        self.mean = Some(values.iter().sum::<f64>() / values.len() as f64);
        self.target = target.to_string();
        Ok(())
    }

    fn predict(&self, ids: &[String], return_actuals: bool) -> Result<Prediction> {
        let mean = self.mean.ok_or_else(|| HappyError::not_fitted("mean baseline"))?;
        let predictions = vec![MetadataValue::Float(mean); ids.len()];
        let actuals = if return_actuals {
            let mut actuals = Vec::with_capacity(ids.len());
            for id in ids {
                actuals.push(
                    self.targets(id, &self.target)?
                        .into_iter()
                        .next()
                        .unwrap_or(MetadataValue::Null),
                );
            }
            Some(actuals)
        } else {
            None
        };
        Ok(Prediction {
            predictions,
            actuals,
        })
    }
}
