/// Transforms over height/width. Layers are transformed identically.
///
/// Padded layer cells are `NaN` (unknown), never the cube's fill value.

use ndarray::{s, Array2, Array3};
use serde::{Deserialize, Serialize};

use super::{Preprocessor, Transformed};
use crate::data::model::{MetadataDict, MetadataLayer};
use crate::error::{HappyError, Result};

fn map_layers<F>(metadata: &MetadataDict, f: F) -> MetadataDict
where
    F: Fn(&Array2<f64>) -> Array2<f64>,
{
    metadata
        .iter()
        .map(|(name, layer)| {
            (
                name.clone(),
                MetadataLayer {
                    data: f(&layer.data),
                    mapping: layer.mapping.clone(),
                },
            )
        })
        .collect()
}

/// Grows the cube to `(height, width)` anchored at the top-left corner.
fn pad_to(
    cube: &Array3<f64>,
    metadata: &MetadataDict,
    width: usize,
    height: usize,
    pad_value: f64,
) -> Transformed {
    let (h, w, b) = cube.dim();
    let mut out = Array3::from_elem((height, width, b), pad_value);
    out.slice_mut(s![..h, ..w, ..]).assign(cube);
    let layers = map_layers(metadata, |layer| {
        let mut padded = Array2::from_elem((height, width), f64::NAN);
        padded.slice_mut(s![..h, ..w]).assign(layer);
        padded
    });
    (out, layers)
}

// ---------------------------------------------------------------------------
// Pad
// ---------------------------------------------------------------------------

/// Pads to a fixed `width` x `height` with `pad_value`, anchored at (0, 0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pad {
    pub width: usize,
    pub height: usize,
    #[serde(default)]
    pub pad_value: f64,
}

impl Pad {
    pub fn new(width: usize, height: usize, pad_value: f64) -> Self {
        Self {
            width,
            height,
            pad_value,
        }
    }
}

impl Preprocessor for Pad {
    fn name(&self) -> &'static str {
        "pad"
    }

    fn apply(&self, cube: &Array3<f64>, metadata: &MetadataDict) -> Result<Transformed> {
        let (h, w, _) = cube.dim();
        if self.width < w || self.height < h {
            return Err(HappyError::config(format!(
                "pad target {}x{} is smaller than image {w}x{h}",
                self.width, self.height
            )));
        }
        Ok(pad_to(cube, metadata, self.width, self.height, self.pad_value))
    }
}

// ---------------------------------------------------------------------------
// Crop
// ---------------------------------------------------------------------------

/// Extracts a `width` x `height` window at `(x, y)`.
///
/// A window leaving the image is an error unless `pad` is set, in which case
/// the image is first padded (anchored at (0, 0)) with `pad_value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crop {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
    #[serde(default)]
    pub pad: bool,
    #[serde(default)]
    pub pad_value: f64,
}

impl Crop {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
            pad: false,
            pad_value: 0.0,
        }
    }

    /// Enables pad-then-crop for windows leaving the image.
    pub fn with_padding(mut self, pad_value: f64) -> Self {
        self.pad = true;
        self.pad_value = pad_value;
        self
    }
}

impl Preprocessor for Crop {
    fn name(&self) -> &'static str {
        "crop"
    }

    fn apply(&self, cube: &Array3<f64>, metadata: &MetadataDict) -> Result<Transformed> {
        if self.width == 0 || self.height == 0 {
            return Err(HappyError::config("crop window must not be empty"));
        }
        let (h, w, _) = cube.dim();
        let (Some(right), Some(bottom)) = (
            self.x.checked_add(self.width),
            self.y.checked_add(self.height),
        ) else {
            return Err(HappyError::config(format!(
                "crop window {}x{}+{}+{} overflows",
                self.width, self.height, self.x, self.y
            )));
        };

        let padded;
        let (source, layers) = if right > w || bottom > h {
            if !self.pad {
                return Err(HappyError::config(format!(
                    "crop window {}x{}+{}+{} exceeds image {w}x{h}",
                    self.width, self.height, self.x, self.y
                )));
            }
            padded = pad_to(cube, metadata, right.max(w), bottom.max(h), self.pad_value);
            (&padded.0, &padded.1)
        } else {
            (cube, metadata)
        };

        let out = source
            .slice(s![self.y..bottom, self.x..right, ..])
            .to_owned();
        let layers = map_layers(layers, |layer| {
            layer.slice(s![self.y..bottom, self.x..right]).to_owned()
        });
        Ok((out, layers))
    }
}

// ---------------------------------------------------------------------------
// Downsample
// ---------------------------------------------------------------------------

/// Keeps every `xth` column and every `yth` row, starting at (0, 0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Downsample {
    pub xth: usize,
    pub yth: usize,
}

impl Downsample {
    pub fn new(xth: usize, yth: usize) -> Self {
        Self { xth, yth }
    }
}

impl Preprocessor for Downsample {
    fn name(&self) -> &'static str {
        "downsample"
    }

    fn apply(&self, cube: &Array3<f64>, metadata: &MetadataDict) -> Result<Transformed> {
        if self.xth == 0 || self.yth == 0 {
            return Err(HappyError::config("downsample steps must be at least 1"));
        }
        let (sx, sy) = (self.xth as isize, self.yth as isize);
        let out = cube.slice(s![..;sy, ..;sx, ..]).to_owned();
        let layers = map_layers(metadata, |layer| layer.slice(s![..;sy, ..;sx]).to_owned());
        Ok((out, layers))
    }
}
