/// Raw scan to reflectance using white/dark reference cubes.

use ndarray::{Array3, Axis, Zip};
use serde::{Deserialize, Serialize};

use super::model::HappyData;
use crate::error::{HappyError, Result};

/// How a reference cube is matched to the scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhiteReference {
    /// Reference has exactly the scan's shape.
    #[default]
    Full,
    /// Reference rows are averaged per column and broadcast over the scan's
    /// rows; only width and band count must match.
    ColumnMean,
}

fn prepare(reference: &HappyData, scan: &HappyData, mode: WhiteReference, what: &str) -> Result<Array3<f64>> {
    let (h, w, b) = scan.data().dim();
    match mode {
        WhiteReference::Full => {
            if reference.shape() != scan.shape() {
                return Err(HappyError::shape_mismatch(
                    format!("{what} reference for {}", scan.full_id()),
                    &scan.shape(),
                    &reference.shape(),
                ));
            }
            Ok(reference.data().clone())
        }
        WhiteReference::ColumnMean => {
            let [_, rw, rb] = reference.shape();
            if rw != w || rb != b || reference.height() == 0 {
                return Err(HappyError::shape_mismatch(
                    format!("{what} reference columns for {}", scan.full_id()),
                    &[w, b],
                    &[rw, rb],
                ));
            }
            let mean = reference
                .data()
                .mean_axis(Axis(0))
                .ok_or_else(|| HappyError::missing(format!("{what} reference is empty")))?;
            mean.broadcast((h, w, b))
                .map(|v| v.to_owned())
                .ok_or_else(|| HappyError::shape_mismatch(what.to_string(), &[w, b], &[h, w, b]))
        }
    }
}

/// `(raw - black) / (white - black)` per element.
///
/// Without a white reference the scan is only dark-subtracted; without a
/// black reference the dark level is zero. Cells with a zero denominator
/// become 0. Identity, metadata and wavelengths are carried over from `scan`.
pub fn normalize_reflectance(
    scan: &HappyData,
    white: Option<&HappyData>,
    black: Option<&HappyData>,
    mode: WhiteReference,
) -> Result<HappyData> {
    let dark = black
        .map(|b| prepare(b, scan, mode, "black"))
        .transpose()?
        .unwrap_or_else(|| Array3::zeros(scan.data().dim()));
    let mut out = scan.data() - &dark;

    if let Some(white) = white {
        let white = prepare(white, scan, mode, "white")?;
        Zip::from(&mut out)
            .and(&white)
            .and(&dark)
            .for_each(|v, &wh, &bl| {
                let denom = wh - bl;
                *v = if denom == 0.0 { 0.0 } else { *v / denom };
            });
    }
    log::debug!(
        "{}: normalized (white: {}, black: {})",
        scan.full_id(),
        white.is_some(),
        black.is_some()
    );

    HappyData::new(
        scan.sample_id(),
        scan.region_id(),
        out,
        scan.global_dict().clone(),
        scan.metadata_dict().clone(),
        scan.wavelengths().map(<[f64]>::to_vec),
    )
}
