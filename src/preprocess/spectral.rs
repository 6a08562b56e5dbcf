/// Transforms along the band axis. Layers are never touched.

use nalgebra::DMatrix;
use ndarray::{Array1, Array3, ArrayView1, Axis, Zip};
use serde::{Deserialize, Serialize};

use super::{Preprocessor, Transformed};
use crate::data::model::MetadataDict;
use crate::error::{HappyError, Result};

/// Standard deviations below this are treated as zero.
const MIN_STD: f64 = 1e-12;

/// Applies `f` to every pixel spectrum, producing `out_bands` values each.
fn map_spectra<F>(cube: &Array3<f64>, out_bands: usize, f: F) -> Array3<f64>
where
    F: Fn(ArrayView1<'_, f64>) -> Array1<f64>,
{
    let (h, w, _) = cube.dim();
    let mut out = Array3::zeros((h, w, out_bands));
    Zip::from(out.lanes_mut(Axis(2)))
        .and(cube.lanes(Axis(2)))
        .for_each(|mut dst, src| dst.assign(&f(src)));
    out
}

fn mean_std(spectrum: ArrayView1<'_, f64>) -> (f64, f64) {
    let n = spectrum.len().max(1) as f64;
    let mean = spectrum.sum() / n;
    let var = spectrum.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

// ---------------------------------------------------------------------------
// WavelengthSubset
// ---------------------------------------------------------------------------

/// Keeps the listed bands, in the listed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WavelengthSubset {
    pub subset: Vec<usize>,
}

impl WavelengthSubset {
    pub fn new(subset: Vec<usize>) -> Self {
        Self { subset }
    }

    /// Contiguous bands `from..=to`.
    pub fn range(from: usize, to: usize) -> Self {
        Self::new((from..=to).collect())
    }
}

impl Preprocessor for WavelengthSubset {
    fn name(&self) -> &'static str {
        "wavelength_subset"
    }

    fn apply(&self, cube: &Array3<f64>, _metadata: &MetadataDict) -> Result<Transformed> {
        let bands = cube.dim().2;
        if let Some(&bad) = self.subset.iter().find(|&&i| i >= bands) {
            return Err(HappyError::OutOfRange {
                what: "band",
                index: bad,
                len: bands,
            });
        }
        Ok((cube.select(Axis(2), &self.subset), MetadataDict::new()))
    }

    fn transform_wavelengths(&self, wavelengths: &[f64]) -> Vec<f64> {
        self.subset
            .iter()
            .filter_map(|&i| wavelengths.get(i).copied())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// SpectralNoiseInterpolator
// ---------------------------------------------------------------------------

/// Replaces single-band spikes by linear interpolation.
///
/// An interior band is a spike when it deviates from the mean of its two
/// neighbours by more than `threshold`. Each run of spike bands is redrawn on
/// the straight line between the nearest clean bands on either side. The
/// first and last band are never flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralNoiseInterpolator {
    pub threshold: f64,
}

impl Default for SpectralNoiseInterpolator {
    fn default() -> Self {
        Self { threshold: 0.25 }
    }
}

impl SpectralNoiseInterpolator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    fn clean(&self, z: ArrayView1<'_, f64>) -> Array1<f64> {
        let n = z.len();
        let mut out = z.to_owned();
        if n < 3 {
            return out;
        }
        let noisy: Vec<bool> = (0..n)
            .map(|i| {
                i > 0 && i + 1 < n && (z[i] - 0.5 * (z[i - 1] + z[i + 1])).abs() > self.threshold
            })
            .collect();

        let mut i = 1;
        while i + 1 < n {
            if !noisy[i] {
                i += 1;
                continue;
            }
            let start = i - 1;
            let mut end = i;
            while noisy[end] {
                end += 1;
            }
            let (z0, z1) = (z[start], z[end]);
            let span = (end - start) as f64;
            for k in (start + 1)..end {
                let t = (k - start) as f64 / span;
                out[k] = z0 + t * (z1 - z0);
            }
            i = end;
        }
        out
    }
}

impl Preprocessor for SpectralNoiseInterpolator {
    fn name(&self) -> &'static str {
        "sni"
    }

    fn apply(&self, cube: &Array3<f64>, _metadata: &MetadataDict) -> Result<Transformed> {
        Ok((map_spectra(cube, cube.dim().2, |z| self.clean(z)), MetadataDict::new()))
    }
}

// ---------------------------------------------------------------------------
// Snv
// ---------------------------------------------------------------------------

/// Standard normal variate: per-pixel centering and scaling across bands.
/// Flat spectra (zero variance) are passed through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snv {}

impl Preprocessor for Snv {
    fn name(&self) -> &'static str {
        "snv"
    }

    fn apply(&self, cube: &Array3<f64>, _metadata: &MetadataDict) -> Result<Transformed> {
        let out = map_spectra(cube, cube.dim().2, |z| {
            let (mean, std) = mean_std(z);
            if std < MIN_STD {
                z.to_owned()
            } else {
                z.mapv(|v| (v - mean) / std)
            }
        });
        Ok((out, MetadataDict::new()))
    }
}

// ---------------------------------------------------------------------------
// Derivative (Savitzky-Golay)
// ---------------------------------------------------------------------------

/// How the derivative window treats the spectrum edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivativeMode {
    /// Edge bands are replicated; band count unchanged.
    #[default]
    Nearest,
    /// Only full windows are kept; `window_length - 1` bands are dropped,
    /// half on each side, and the wavelength axis is trimmed to match.
    Valid,
}

/// Savitzky-Golay smoothing derivative in band-index units.
///
/// Fitting computes the convolution kernel and validates the parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Derivative {
    pub window_length: usize,
    pub polyorder: usize,
    pub deriv: usize,
    #[serde(default)]
    pub mode: DerivativeMode,
    #[serde(skip)]
    kernel: Option<Vec<f64>>,
}

impl Default for Derivative {
    fn default() -> Self {
        Self::new(5, 2, 1, DerivativeMode::Nearest)
    }
}

impl Derivative {
    pub fn new(window_length: usize, polyorder: usize, deriv: usize, mode: DerivativeMode) -> Self {
        Self {
            window_length,
            polyorder,
            deriv,
            mode,
            kernel: None,
        }
    }

    fn half(&self) -> usize {
        self.window_length / 2
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.window_length % 2 == 0 {
            return Err(HappyError::config(format!(
                "derivative window_length must be odd, got {}",
                self.window_length
            )));
        }
        if self.polyorder >= self.window_length {
            return Err(HappyError::config(format!(
                "derivative polyorder {} must be less than window_length {}",
                self.polyorder, self.window_length
            )));
        }
        if self.deriv > self.polyorder {
            return Err(HappyError::config(format!(
                "derivative order {} exceeds polyorder {}",
                self.deriv, self.polyorder
            )));
        }
        Ok(())
    }
}

/// Savitzky-Golay kernel: `deriv! * row deriv of (AᵀA)⁻¹Aᵀ` with `A[k][j] = kʲ`.
fn savgol_kernel(window_length: usize, polyorder: usize, deriv: usize) -> Result<Vec<f64>> {
    let half = (window_length / 2) as f64;
    let vandermonde = DMatrix::from_fn(window_length, polyorder + 1, |k, j| {
        (k as f64 - half).powi(j as i32)
    });
    let transposed = vandermonde.transpose();
    let coefficients = (&transposed * &vandermonde)
        .cholesky()
        .ok_or_else(|| HappyError::config("singular Savitzky-Golay system"))?
        .solve(&transposed);

    let factorial: f64 = (1..=deriv).map(|i| i as f64).product();
    Ok(coefficients.row(deriv).iter().map(|c| c * factorial).collect())
}

impl Preprocessor for Derivative {
    fn name(&self) -> &'static str {
        "derivative"
    }

    fn is_fitted(&self) -> bool {
        self.kernel.is_some()
    }

    fn fit(&mut self, _cube: &Array3<f64>, _metadata: &MetadataDict) -> Result<()> {
        self.validate()?;
        self.kernel = Some(savgol_kernel(self.window_length, self.polyorder, self.deriv)?);
        Ok(())
    }

    fn reset(&mut self) {
        self.kernel = None;
    }

    fn apply(&self, cube: &Array3<f64>, _metadata: &MetadataDict) -> Result<Transformed> {
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| HappyError::not_fitted(self.name()))?;
        let bands = cube.dim().2;
        let half = self.half();
        let out_bands = match self.mode {
            DerivativeMode::Nearest => bands,
            DerivativeMode::Valid => {
                if bands < self.window_length {
                    return Err(HappyError::shape_mismatch(
                        "derivative window",
                        &[self.window_length],
                        &[bands],
                    ));
                }
                bands - 2 * half
            }
        };
        let out = map_spectra(cube, out_bands, |z| {
            Array1::from_shape_fn(out_bands, |o| {
                let center = match self.mode {
                    DerivativeMode::Nearest => o as i64,
                    DerivativeMode::Valid => (o + half) as i64,
                };
                kernel
                    .iter()
                    .enumerate()
                    .map(|(k, c)| {
                        let idx = (center + k as i64 - half as i64).clamp(0, bands as i64 - 1);
                        c * z[idx as usize]
                    })
                    .sum()
            })
        });
        Ok((out, MetadataDict::new()))
    }

    fn transform_wavelengths(&self, wavelengths: &[f64]) -> Vec<f64> {
        match self.mode {
            DerivativeMode::Nearest => wavelengths.to_vec(),
            DerivativeMode::Valid => {
                let half = self.half();
                if wavelengths.len() < 2 * half {
                    Vec::new()
                } else {
                    wavelengths[half..wavelengths.len() - half].to_vec()
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StandardScaler
// ---------------------------------------------------------------------------

/// Per-band z-scoring with statistics fitted over every pixel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    #[serde(skip)]
    stats: Option<(Array1<f64>, Array1<f64>)>,
}

impl Preprocessor for StandardScaler {
    fn name(&self) -> &'static str {
        "standard_scaler"
    }

    fn is_fitted(&self) -> bool {
        self.stats.is_some()
    }

    fn fit(&mut self, cube: &Array3<f64>, _metadata: &MetadataDict) -> Result<()> {
        let (h, w, bands) = cube.dim();
        if h * w == 0 {
            return Err(HappyError::missing("standard scaler needs at least one pixel"));
        }
        let mut mean = Array1::zeros(bands);
        let mut std = Array1::zeros(bands);
        for b in 0..bands {
            let band = cube.index_axis(Axis(2), b);
            let n = band.len() as f64;
            let m = band.sum() / n;
            mean[b] = m;
            std[b] = (band.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n).sqrt();
        }
        self.stats = Some((mean, std));
        Ok(())
    }

    fn reset(&mut self) {
        self.stats = None;
    }

    fn apply(&self, cube: &Array3<f64>, _metadata: &MetadataDict) -> Result<Transformed> {
        let (mean, std) = self
            .stats
            .as_ref()
            .ok_or_else(|| HappyError::not_fitted(self.name()))?;
        if mean.len() != cube.dim().2 {
            return Err(HappyError::shape_mismatch(
                "standard scaler bands",
                &[mean.len()],
                &[cube.dim().2],
            ));
        }
        let out = map_spectra(cube, mean.len(), |z| {
            Array1::from_shape_fn(z.len(), |b| {
                let centered = z[b] - mean[b];
                if std[b] < MIN_STD {
                    centered
                } else {
                    centered / std[b]
                }
            })
        });
        Ok((out, MetadataDict::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::HappyData;
    use ndarray::Array;

    fn ramp_cube(h: usize, w: usize, b: usize) -> Array3<f64> {
        Array::from_shape_fn((h, w, b), |(y, x, z)| (y + x) as f64 + 0.5 * (z * z) as f64)
    }

    #[test]
    fn wavelength_subset_scenario() {
        let cube = Array::from_shape_fn((4, 4, 10), |(_, _, z)| z as f64);
        let hd = HappyData::from_cube("s", "r", cube, Some((0..10).map(f64::from).collect()))
            .unwrap();
        let out = hd
            .apply_preprocessor(&mut WavelengthSubset::new(vec![2, 3, 4, 5]))
            .unwrap();
        assert_eq!(out.shape(), [4, 4, 4]);
        assert_eq!(out.wavelengths().unwrap(), &[2.0, 3.0, 4.0, 5.0]);
        assert_eq!(out.get_spectrum(1, 1).unwrap().to_vec(), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn wavelength_subset_rejects_bad_index() {
        let cube = ramp_cube(2, 2, 10);
        let err = WavelengthSubset::new(vec![3, 10])
            .apply(&cube, &MetadataDict::new())
            .unwrap_err();
        assert!(matches!(err, HappyError::OutOfRange { index: 10, len: 10, .. }));
    }

    #[test]
    fn snv_centers_and_scales() {
        let mut cube = ramp_cube(2, 3, 6);
        cube.slice_mut(ndarray::s![0, 0, ..]).fill(4.0);
        let (out, layers) = Snv::default().apply(&cube, &MetadataDict::new()).unwrap();
        assert!(layers.is_empty());
        for y in 0..2 {
            for x in 0..3 {
                let (mean, std) = mean_std(out.slice(ndarray::s![y, x, ..]));
                if (y, x) == (0, 0) {
                    assert_eq!(out.slice(ndarray::s![0, 0, ..]).to_vec(), vec![4.0; 6]);
                } else {
                    assert!(mean.abs() < 1e-9);
                    assert!((std - 1.0).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn sni_removes_spike() {
        let mut cube = Array3::from_shape_fn((1, 1, 7), |(_, _, z)| z as f64 * 0.1);
        cube[[0, 0, 3]] = 5.0;
        let (out, _) = SpectralNoiseInterpolator::new(0.5)
            .apply(&cube, &MetadataDict::new())
            .unwrap();
        assert_eq!(out.dim(), (1, 1, 7));
        assert!((out[[0, 0, 3]] - 0.3).abs() < 1e-9);
        assert!((out[[0, 0, 0]] - 0.0).abs() < 1e-12);
        assert!((out[[0, 0, 6]] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn savgol_kernel_matches_known_values() {
        // classic 5-point quadratic smoothing: (-3, 12, 17, 12, -3) / 35
        let smooth = savgol_kernel(5, 2, 0).unwrap();
        let expected = [-3.0, 12.0, 17.0, 12.0, -3.0].map(|v| v / 35.0);
        for (a, b) in smooth.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-10);
        }
        // 5-point first derivative: (-2, -1, 0, 1, 2) / 10
        let first = savgol_kernel(5, 2, 1).unwrap();
        let expected = [-2.0, -1.0, 0.0, 1.0, 2.0].map(|v| v / 10.0);
        for (a, b) in first.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-10);
        }
    }

    #[test]
    fn savgol_kernel_second_derivative() {
        // 5-point quadratic second derivative: (2, -1, -2, -1, 2) / 7
        let second = savgol_kernel(5, 2, 2).unwrap();
        let expected = [2.0, -1.0, -2.0, -1.0, 2.0].map(|v| v / 7.0);
        for (a, b) in second.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-10);
        }
        assert_eq!(savgol_kernel(7, 3, 1).unwrap().len(), 7);
    }

    #[test]
    fn derivative_of_line_is_slope() {
        let cube = Array3::from_shape_fn((1, 2, 9), |(_, _, z)| 3.0 * z as f64 + 1.0);
        let hd = HappyData::from_cube("s", "r", cube, Some((0..9).map(f64::from).collect()))
            .unwrap();

        let valid = hd
            .apply_preprocessor(&mut Derivative::new(5, 2, 1, DerivativeMode::Valid))
            .unwrap();
        assert_eq!(valid.shape(), [1, 2, 5]);
        assert_eq!(valid.wavelengths().unwrap(), &[2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(valid.data().iter().all(|v| (v - 3.0).abs() < 1e-9));

        let nearest = hd.apply_preprocessor(&mut Derivative::default()).unwrap();
        assert_eq!(nearest.shape(), [1, 2, 9]);
        assert!((nearest.data()[[0, 0, 4]] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn derivative_validates_on_fit() {
        let cube = ramp_cube(1, 1, 9);
        let mut bad = Derivative::new(4, 2, 1, DerivativeMode::Nearest);
        assert!(bad.fit(&cube, &MetadataDict::new()).is_err());
        let unfitted = Derivative::default();
        assert!(matches!(
            unfitted.apply(&cube, &MetadataDict::new()),
            Err(HappyError::NotFitted(_))
        ));
    }

    #[test]
    fn standard_scaler_per_band() {
        let cube = ramp_cube(3, 3, 4);
        let mut scaler = StandardScaler::default();
        scaler.fit(&cube, &MetadataDict::new()).unwrap();
        let (out, _) = scaler.apply(&cube, &MetadataDict::new()).unwrap();
        for b in 0..4 {
            let band = out.index_axis(Axis(2), b);
            assert!(band.mean().unwrap().abs() < 1e-9);
        }
        let wrong = ramp_cube(3, 3, 5);
        assert!(scaler.apply(&wrong, &MetadataDict::new()).is_err());
    }
}
