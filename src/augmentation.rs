// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Volume preprocessing and random augmentation

use crate::error::{LimeError, Result};
use crate::volume::Volume;
use ndarray::{Array3, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Random transformations available to `train_preprocessing`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transformation {
    Rotate,
    FlipHorizontally,
    FlipVertically,
    Brightness,
}

impl Transformation {
    pub fn all() -> Vec<Self> {
        vec![
            Self::Rotate,
            Self::FlipHorizontally,
            Self::FlipVertically,
            Self::Brightness,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rotate => "rotate",
            Self::FlipHorizontally => "flip_horizontally",
            Self::FlipVertically => "flip_vertically",
            Self::Brightness => "brightness",
        }
    }
}

impl fmt::Display for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transformation {
    type Err = LimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "rotate" => Ok(Self::Rotate),
            "flip_horizontally" => Ok(Self::FlipHorizontally),
            "flip_vertically" => Ok(Self::FlipVertically),
            "brightness" => Ok(Self::Brightness),
            other => Err(LimeError::InvalidParameter(format!("unknown transformation '{}'", other))),
        }
    }
}

/// Brightness factors are drawn from this range
const BRIGHTNESS_RANGE: (f32, f32) = (0.8, 1.2);

/// Applies preprocessing to volumes before they reach the classifier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Augmentation3D {
    pub transformations: Vec<Transformation>,
}

impl Augmentation3D {
    pub fn new(transformations: Vec<Transformation>) -> Self {
        Self { transformations }
    }

    /// Parse transformation names, rejecting unknown ones
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let transformations = names
            .iter()
            .map(|n| n.as_ref().parse())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(transformations))
    }

    /// Rescale the whole volume to `[0, 1]`; constant volumes become zeros
    pub fn validation_preprocessing(&self, volume: &Volume) -> Volume {
        let data = volume.as_array();
        let (min, max) = data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = max - min;

        let scaled = if range > 0.0 && range.is_finite() {
            data.mapv(|v| (v - min) / range)
        } else {
            Array3::zeros(data.raw_dim())
        };
        Volume::from_array_unchecked(scaled)
    }

    /// Apply each configured transformation with probability 0.5
    pub fn train_preprocessing<R: Rng + ?Sized>(&self, volume: &Volume, rng: &mut R) -> Volume {
        let mut data = volume.as_array().to_owned();

        for transformation in &self.transformations {
            if !rng.gen_bool(0.5) {
                continue;
            }
            match transformation {
                Transformation::Rotate => {
                    let (h, w, _) = data.dim();
                    if h == w {
                        let quarter_turns = rng.gen_range(1..4);
                        for _ in 0..quarter_turns {
                            data = rotate_quarter(&data);
                        }
                    } else {
                        tracing::debug!("Skipping rotation of non-square {}x{} layers", h, w);
                    }
                }
                Transformation::FlipHorizontally => data.invert_axis(Axis(1)),
                Transformation::FlipVertically => data.invert_axis(Axis(0)),
                Transformation::Brightness => {
                    let factor = rng.gen_range(BRIGHTNESS_RANGE.0..BRIGHTNESS_RANGE.1);
                    data.mapv_inplace(|v| (v * factor).clamp(0.0, 1.0));
                }
            }
        }

        // invert_axis leaves negative strides; make the layout standard again
        Volume::from_array_unchecked(data.as_standard_layout().to_owned())
    }
}

/// Rotate every layer of a square volume by 90 degrees counter-clockwise
fn rotate_quarter(data: &Array3<f32>) -> Array3<f32> {
    let (n, _, layers) = data.dim();
    Array3::from_shape_fn((n, n, layers), |(y, x, l)| data[[x, n - 1 - y, l]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn ramp(h: usize, w: usize) -> Volume {
        Volume::new(Array3::from_shape_fn((h, w, 3), |(y, x, l)| (y * w + x + l) as f32)).unwrap()
    }

    #[test]
    fn test_parse_transformations() {
        let aug = Augmentation3D::from_names(&["rotate", "flip_horizontally", "Brightness"]).unwrap();
        assert_eq!(
            aug.transformations,
            vec![
                Transformation::Rotate,
                Transformation::FlipHorizontally,
                Transformation::Brightness
            ]
        );
        assert!(Augmentation3D::from_names(&["shear"]).is_err());

        for t in Transformation::all() {
            assert_eq!(t.as_str().parse::<Transformation>().unwrap(), t);
        }
    }

    #[test]
    fn test_validation_preprocessing_rescales() {
        let aug = Augmentation3D::default();
        let out = aug.validation_preprocessing(&ramp(4, 4));
        let data = out.as_array();

        let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        assert_abs_diff_eq!(min, 0.0);
        assert_abs_diff_eq!(max, 1.0);
        assert_abs_diff_eq!(data[[0, 1, 0]], 1.0 / 17.0, epsilon = 1e-6);
    }

    #[test]
    fn test_validation_preprocessing_constant_volume() {
        let aug = Augmentation3D::default();
        let constant = Volume::new(Array3::from_elem((3, 3, 3), 7.0)).unwrap();
        let out = aug.validation_preprocessing(&constant);
        assert!(out.as_array().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_train_preprocessing_without_transformations_is_identity() {
        let aug = Augmentation3D::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let volume = ramp(5, 6);
        assert_eq!(aug.train_preprocessing(&volume, &mut rng), volume);
    }

    #[test]
    fn test_rotate_quarter() {
        let data = ramp(3, 3).into_array();
        let rotated = rotate_quarter(&data);
        // Top-right corner moves to top-left
        assert_eq!(rotated[[0, 0, 0]], data[[0, 2, 0]]);
        assert_eq!(rotate_quarter(&rotate_quarter(&rotate_quarter(&rotated))), data);
    }

    #[test]
    fn test_flips_preserve_values() {
        let aug = Augmentation3D::new(vec![Transformation::FlipHorizontally, Transformation::FlipVertically]);
        let volume = ramp(4, 5);
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        for _ in 0..10 {
            let out = aug.train_preprocessing(&volume, &mut rng);
            assert_eq!(out.dims(), volume.dims());
            let mut a: Vec<f32> = out.as_array().iter().cloned().collect();
            let mut b: Vec<f32> = volume.as_array().iter().cloned().collect();
            a.sort_by(|x, y| x.total_cmp(y));
            b.sort_by(|x, y| x.total_cmp(y));
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_brightness_is_clipped() {
        let aug = Augmentation3D::new(vec![Transformation::Brightness]);
        let volume = Volume::new(Array3::from_elem((4, 4, 3), 0.95)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);

        for _ in 0..20 {
            let out = aug.train_preprocessing(&volume, &mut rng);
            assert!(out.as_array().iter().all(|&v| (0.0..=1.0).contains(&v)));
        }
    }
}
