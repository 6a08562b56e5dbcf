/// Principal component projection of the band axis.

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, Array3, Axis};
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::{Preprocessor, Transformed};
use crate::data::model::MetadataDict;
use crate::error::{HappyError, Result};

/// Fitted projection: band means and `(components, bands)` loadings.
#[derive(Debug, Clone, PartialEq)]
struct PcaModel {
    mean: Array1<f64>,
    loadings: Array2<f64>,
}

/// Projects every spectrum onto the top `components` principal axes.
///
/// Loadings are fitted on a random `percent_pixels` share of the pixels;
/// `seed` makes that draw reproducible. After projection the band axis is
/// the component axis and wavelengths become component indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pca {
    pub components: usize,
    #[serde(default = "default_percent")]
    pub percent_pixels: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip)]
    model: Option<PcaModel>,
}

fn default_percent() -> f64 {
    100.0
}

impl Pca {
    pub fn new(components: usize, percent_pixels: f64, seed: Option<u64>) -> Self {
        Self {
            components,
            percent_pixels,
            seed,
            model: None,
        }
    }

    /// Fitted loadings, `(components, bands)`.
    pub fn loadings(&self) -> Option<&Array2<f64>> {
        self.model.as_ref().map(|m| &m.loadings)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.components == 0 {
            return Err(HappyError::config("pca needs at least one component"));
        }
        if !(self.percent_pixels > 0.0 && self.percent_pixels <= 100.0) {
            return Err(HappyError::config(format!(
                "pca percent_pixels must be in (0, 100], got {}",
                self.percent_pixels
            )));
        }
        Ok(())
    }

    fn fit_with_rng<R: Rng + ?Sized>(&mut self, cube: &Array3<f64>, rng: &mut R) -> Result<()> {
        self.validate()?;
        let (h, w, bands) = cube.dim();
        if self.components > bands {
            return Err(HappyError::config(format!(
                "pca components must be in 1..={bands}, got {}",
                self.components
            )));
        }
        let total = h * w;
        if total == 0 {
            return Err(HappyError::missing("pca needs at least one pixel"));
        }
        let count = ((total as f64 * self.percent_pixels / 100.0).ceil() as usize).clamp(1, total);
        let picked = index::sample(rng, total, count);

        let samples = Array2::from_shape_fn((count, bands), |(i, b)| {
            let p = picked.index(i);
            cube[[p / w, p % w, b]]
        });
        let mean = samples
            .mean_axis(Axis(0))
            .ok_or_else(|| HappyError::missing("pca sample is empty"))?;
        let centered = &samples - &mean;
        let denom = (count.max(2) - 1) as f64;
        let cov = centered.t().dot(&centered) / denom;

        let loadings = top_eigenvectors(&cov, self.components);
        log::debug!("pca fitted on {count}/{total} pixels, {bands} -> {} bands", self.components);
        self.model = Some(PcaModel { mean, loadings });
        Ok(())
    }
}

/// Eigenvectors of a symmetric matrix as rows, by descending eigenvalue.
/// Each vector's largest entry is positive.
fn top_eigenvectors(cov: &Array2<f64>, components: usize) -> Array2<f64> {
    let n = cov.nrows();
    let eigen = SymmetricEigen::new(DMatrix::from_fn(n, n, |i, j| cov[[i, j]]));

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let mut loadings = Array2::zeros((components, n));
    for (row, &idx) in order.iter().take(components).enumerate() {
        let vector = eigen.eigenvectors.column(idx);
        let flip = vector
            .iter()
            .copied()
            .max_by(|a, b| a.abs().total_cmp(&b.abs()))
            .map_or(false, |m| m < 0.0);
        let sign = if flip { -1.0 } else { 1.0 };
        for (b, v) in vector.iter().enumerate() {
            loadings[[row, b]] = sign * v;
        }
    }
    loadings
}

impl Preprocessor for Pca {
    fn name(&self) -> &'static str {
        "pca"
    }

    fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    fn fit(&mut self, cube: &Array3<f64>, _metadata: &MetadataDict) -> Result<()> {
        let mut rng = self
            .seed
            .map_or_else(ChaCha8Rng::from_entropy, ChaCha8Rng::seed_from_u64);
        self.fit_with_rng(cube, &mut rng)
    }

    fn reset(&mut self) {
        self.model = None;
    }

    fn apply(&self, cube: &Array3<f64>, _metadata: &MetadataDict) -> Result<Transformed> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| HappyError::not_fitted(self.name()))?;
        let (h, w, bands) = cube.dim();
        if bands != model.mean.len() {
            return Err(HappyError::shape_mismatch(
                "pca bands",
                &[model.mean.len()],
                &[bands],
            ));
        }
        let mut out = Array3::zeros((h, w, self.components));
        for y in 0..h {
            for x in 0..w {
                let centered = &cube.slice(ndarray::s![y, x, ..]) - &model.mean;
                out.slice_mut(ndarray::s![y, x, ..])
                    .assign(&model.loadings.dot(&centered));
            }
        }
        Ok((out, MetadataDict::new()))
    }

    fn transform_wavelengths(&self, _wavelengths: &[f64]) -> Vec<f64> {
        (0..self.components).map(|c| c as f64).collect()
    }
}
