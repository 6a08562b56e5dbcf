/// Preprocessing: fit-then-apply transforms over a cube and its layers.
///
/// ```text
///   cube + layers
///        │
///        ▼
///   ┌──────────────────┐   fit lazily on first sight,
///   │ MultiPreprocessor │   then apply each member in order
///   └──────────────────┘
///        │  spectral members: bands change, layers untouched
///        │  spatial members:  height/width change, layers follow
///        ▼
///   cube' + layers'
/// ```
///
/// Every transform returns `(cube, layers)`; an empty layer mapping means
/// "layers unchanged".
use std::fmt;

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::data::model::{HappyData, MetadataDict};
use crate::error::{HappyError, Result};

pub mod pca;
pub mod spatial;
pub mod spectral;

pub use pca::Pca;
pub use spatial::{Crop, Downsample, Pad};
pub use spectral::{
    Derivative, DerivativeMode, SpectralNoiseInterpolator, Snv, StandardScaler, WavelengthSubset,
};

/// Output of a single transform.
pub type Transformed = (Array3<f64>, MetadataDict);

// ---------------------------------------------------------------------------
// Preprocessor – the transform contract
// ---------------------------------------------------------------------------

/// A transform over a `(height, width, bands)` cube and its per-pixel layers.
///
/// Fitted state is read-only during `apply`, so a fitted instance can be
/// shared across threads behind a shared reference.
pub trait Preprocessor: fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether `apply` can run. Stateless transforms are always fitted.
    fn is_fitted(&self) -> bool {
        true
    }

    /// Learns state from a cube.
    fn fit(&mut self, _cube: &Array3<f64>, _metadata: &MetadataDict) -> Result<()> {
        Ok(())
    }

    /// Forgets fitted state so the next sight of data fits again.
    fn reset(&mut self) {}

    /// Transforms a cube. Returns an empty mapping when layers are unchanged.
    fn apply(&self, cube: &Array3<f64>, metadata: &MetadataDict) -> Result<Transformed>;

    /// Maps the wavelength axis the same way `apply` maps the band axis.
    fn transform_wavelengths(&self, wavelengths: &[f64]) -> Vec<f64> {
        wavelengths.to_vec()
    }
}

// ---------------------------------------------------------------------------
// PreprocessorConfig – the closed set of transforms
// ---------------------------------------------------------------------------

/// Every available transform, tagged by `"class"` when serialized.
///
/// This enum is the registry: a pipeline definition deserializes straight
/// into it and unknown class names are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum PreprocessorConfig {
    PassThrough(PassThrough),
    WavelengthSubset(WavelengthSubset),
    #[serde(rename = "sni")]
    SpectralNoiseInterpolator(SpectralNoiseInterpolator),
    Snv(Snv),
    Derivative(Derivative),
    StandardScaler(StandardScaler),
    Pca(Pca),
    Pad(Pad),
    Crop(Crop),
    Downsample(Downsample),
    Multi(MultiPreprocessor),
}

impl PreprocessorConfig {
    /// Parses one definition, mapping unknown classes to a config error.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| HappyError::config(format!("invalid preprocessor definition: {e}")))
    }

    /// The serialized dictionary form.
    pub fn to_json_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Checks parameters that can be judged without data.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::WavelengthSubset(p) if p.subset.is_empty() => {
                Err(HappyError::config("wavelength subset is empty"))
            }
            Self::SpectralNoiseInterpolator(p) if !(p.threshold > 0.0) => Err(HappyError::config(
                format!("sni threshold must be positive, got {}", p.threshold),
            )),
            Self::Derivative(p) => p.validate(),
            Self::Pca(p) => p.validate(),
            Self::Downsample(p) if p.xth == 0 || p.yth == 0 => {
                Err(HappyError::config("downsample steps must be at least 1"))
            }
            Self::Crop(p) if p.width == 0 || p.height == 0 => {
                Err(HappyError::config("crop window must not be empty"))
            }
            Self::Multi(m) => m.preprocessors.iter().try_for_each(Self::validate),
            _ => Ok(()),
        }
    }

    fn inner(&self) -> &dyn Preprocessor {
        match self {
            Self::PassThrough(p) => p,
            Self::WavelengthSubset(p) => p,
            Self::SpectralNoiseInterpolator(p) => p,
            Self::Snv(p) => p,
            Self::Derivative(p) => p,
            Self::StandardScaler(p) => p,
            Self::Pca(p) => p,
            Self::Pad(p) => p,
            Self::Crop(p) => p,
            Self::Downsample(p) => p,
            Self::Multi(p) => p,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Preprocessor {
        match self {
            Self::PassThrough(p) => p,
            Self::WavelengthSubset(p) => p,
            Self::SpectralNoiseInterpolator(p) => p,
            Self::Snv(p) => p,
            Self::Derivative(p) => p,
            Self::StandardScaler(p) => p,
            Self::Pca(p) => p,
            Self::Pad(p) => p,
            Self::Crop(p) => p,
            Self::Downsample(p) => p,
            Self::Multi(p) => p,
        }
    }
}

impl Preprocessor for PreprocessorConfig {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn is_fitted(&self) -> bool {
        self.inner().is_fitted()
    }

    fn fit(&mut self, cube: &Array3<f64>, metadata: &MetadataDict) -> Result<()> {
        self.inner_mut().fit(cube, metadata)
    }

    fn reset(&mut self) {
        self.inner_mut().reset();
    }

    fn apply(&self, cube: &Array3<f64>, metadata: &MetadataDict) -> Result<Transformed> {
        self.inner().apply(cube, metadata)
    }

    fn transform_wavelengths(&self, wavelengths: &[f64]) -> Vec<f64> {
        self.inner().transform_wavelengths(wavelengths)
    }
}

// ---------------------------------------------------------------------------
// PassThrough
// ---------------------------------------------------------------------------

/// Identity transform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassThrough {}

impl Preprocessor for PassThrough {
    fn name(&self) -> &'static str {
        "pass_through"
    }

    fn apply(&self, cube: &Array3<f64>, _metadata: &MetadataDict) -> Result<Transformed> {
        Ok((cube.clone(), MetadataDict::new()))
    }
}

// ---------------------------------------------------------------------------
// MultiPreprocessor – ordered chain
// ---------------------------------------------------------------------------

/// Runs its members in order, threading cube and layers through.
///
/// Members are fitted the first time they see data, on the output of the
/// members before them, and keep that state until [`Preprocessor::reset`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiPreprocessor {
    pub preprocessors: Vec<PreprocessorConfig>,
}

impl MultiPreprocessor {
    pub fn new(preprocessors: Vec<PreprocessorConfig>) -> Self {
        Self { preprocessors }
    }

    pub fn len(&self) -> usize {
        self.preprocessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preprocessors.is_empty()
    }

    /// Fits whatever is unfitted, then transforms `data`.
    pub fn process(&mut self, data: &HappyData) -> Result<HappyData> {
        data.apply_preprocessor(self)
    }
}

impl Preprocessor for MultiPreprocessor {
    fn name(&self) -> &'static str {
        "multi"
    }

    fn is_fitted(&self) -> bool {
        self.preprocessors.iter().all(Preprocessor::is_fitted)
    }

    fn fit(&mut self, cube: &Array3<f64>, metadata: &MetadataDict) -> Result<()> {
        let mut current = cube.clone();
        let mut layers = metadata.clone();
        let last = self.preprocessors.len().saturating_sub(1);
        for (i, member) in self.preprocessors.iter_mut().enumerate() {
            if !member.is_fitted() {
                log::debug!("fitting {} on {:?}", member.name(), current.dim());
                member.fit(&current, &layers)?;
            }
            if i < last {
                let (next, next_layers) = member.apply(&current, &layers)?;
                current = next;
                if !next_layers.is_empty() {
                    layers = next_layers;
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.preprocessors.iter_mut().for_each(Preprocessor::reset);
    }

    fn apply(&self, cube: &Array3<f64>, metadata: &MetadataDict) -> Result<Transformed> {
        let mut current = cube.clone();
        let mut layers = MetadataDict::new();
        for member in &self.preprocessors {
            let input_layers = if layers.is_empty() { metadata } else { &layers };
            let (next, next_layers) = member.apply(&current, input_layers)?;
            current = next;
            if !next_layers.is_empty() {
                layers = next_layers;
            }
        }
        Ok((current, layers))
    }

    fn transform_wavelengths(&self, wavelengths: &[f64]) -> Vec<f64> {
        self.preprocessors
            .iter()
            .fold(wavelengths.to_vec(), |w, member| member.transform_wavelengths(&w))
    }
}
