// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Dataset loading for volume explanation runs

use crate::volume::{Label, Volume, LAYERS};
use anyhow::{bail, Context, Result};
use ndarray::{Array3, ArrayD, Axis, IxDyn, OwnedRepr};
use ndarray_npy::NpzReader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

/// A single labelled volume
#[derive(Debug, Clone)]
pub struct VolumeSample {
    /// Position in the source dataset
    pub index: usize,
    pub volume: Volume,
    /// Ground truth label
    pub label: Label,
}

/// Description of a loaded dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub id: String,
    pub name: String,
    pub description: String,
    pub source: String,
    pub format: String,
}

/// A loaded dataset ready for explanation
#[derive(Debug, Clone)]
pub struct VolumeDataset {
    pub config: DatasetConfig,
    pub samples: Vec<VolumeSample>,
}

impl VolumeDataset {
    /// Load a dataset stored as an `.npz` archive with arrays `X` and `Y`.
    ///
    /// `X` is `N x H x W x 3` (optionally with a trailing channel axis of 1),
    /// `Y` is `N` or `N x 1`; any non-zero label is positive.
    pub fn load_npz(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open dataset: {}", path.display()))?;
        let mut npz = NpzReader::new(file).with_context(|| format!("Not an NPZ archive: {}", path.display()))?;

        let x = read_float_array(&mut npz, "X").with_context(|| format!("Failed to read X from {}", path.display()))?;
        let y = read_label_array(&mut npz, "Y").with_context(|| format!("Failed to read Y from {}", path.display()))?;

        let x = match x.ndim() {
            4 => x,
            5 if x.shape()[4] == 1 => x.index_axis_move(Axis(4), 0),
            _ => bail!(
                "X must have shape N x H x W x {} (got {:?})",
                LAYERS,
                x.shape()
            ),
        };
        if x.shape()[3] != LAYERS {
            bail!("X must have {} layers on its last axis (got {:?})", LAYERS, x.shape());
        }
        if x.shape()[0] != y.len() {
            bail!("X has {} samples but Y has {} labels", x.shape()[0], y.len());
        }

        let mut samples = Vec::with_capacity(y.len());
        for (index, (volume, &label)) in x.axis_iter(Axis(0)).zip(y.iter()).enumerate() {
            let volume: Array3<f32> = volume
                .to_owned()
                .into_dimensionality()
                .with_context(|| format!("Sample {} is not three-dimensional", index))?;
            samples.push(VolumeSample {
                index,
                volume: Volume::new(volume)?,
                label: if label != 0.0 { Label::Positive } else { Label::Negative },
            });
        }

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "dataset".to_string());

        Ok(Self {
            config: DatasetConfig {
                id: name.clone(),
                name,
                description: "Labelled volumes loaded from an NPZ archive".to_string(),
                source: path.display().to_string(),
                format: "npz".to_string(),
            },
            samples,
        })
    }

    /// Generate a synthetic dataset for development/testing.
    ///
    /// Volumes are low-intensity noise; positive volumes also carry a bright
    /// square blob of side `height / 4` near the centre.
    pub fn load_synthetic(size: usize, height: usize, width: usize, seed: u64) -> Self {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let height = height.max(4);
        let width = width.max(4);

        let samples = (0..size)
            .map(|index| {
                let is_positive = rng.gen_bool(0.5);
                let mut data = Array3::from_shape_fn((height, width, LAYERS), |_| rng.gen_range(0.0f32..0.3));

                if is_positive {
                    let side_y = height / 4;
                    let side_x = width / 4;
                    let jitter_y = (height / 16).max(1) as isize;
                    let jitter_x = (width / 16).max(1) as isize;
                    let y0 = ((height - side_y) / 2) as isize + rng.gen_range(-jitter_y..=jitter_y);
                    let x0 = ((width - side_x) / 2) as isize + rng.gen_range(-jitter_x..=jitter_x);
                    let y0 = y0.clamp(0, (height - side_y) as isize) as usize;
                    let x0 = x0.clamp(0, (width - side_x) as isize) as usize;

                    for y in y0..y0 + side_y {
                        for x in x0..x0 + side_x {
                            for l in 0..LAYERS {
                                data[[y, x, l]] = rng.gen_range(0.85f32..1.0);
                            }
                        }
                    }
                }

                VolumeSample {
                    index,
                    volume: Volume::from_array_unchecked(data),
                    label: if is_positive { Label::Positive } else { Label::Negative },
                }
            })
            .collect();

        Self {
            config: DatasetConfig {
                id: "synthetic".to_string(),
                name: "Synthetic Volume Dataset".to_string(),
                description: "Generated noise volumes, positives carry a central blob".to_string(),
                source: "generated".to_string(),
                format: "memory".to_string(),
            },
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Get label distribution for a set of samples
    pub fn label_distribution(samples: &[VolumeSample]) -> HashMap<Label, usize> {
        let mut dist = HashMap::new();
        for sample in samples {
            *dist.entry(sample.label).or_insert(0) += 1;
        }
        dist
    }
}

/// Read a float array stored as either f32 or f64
fn read_float_array(npz: &mut NpzReader<File>, name: &str) -> Result<ArrayD<f32>> {
    let entry = format!("{}.npy", name);
    if let Ok(array) = npz.by_name::<OwnedRepr<f32>, IxDyn>(&entry) {
        return Ok(array);
    }
    let array = npz
        .by_name::<OwnedRepr<f64>, IxDyn>(&entry)
        .with_context(|| format!("array '{}' missing or not a float array", name))?;
    Ok(array.mapv(|v| v as f32))
}

/// Read a label array of any common numeric type, flattened to `f64`
fn read_label_array(npz: &mut NpzReader<File>, name: &str) -> Result<Vec<f64>> {
    let entry = format!("{}.npy", name);
    macro_rules! try_type {
        ($t:ty) => {
            if let Ok(array) = npz.by_name::<OwnedRepr<$t>, IxDyn>(&entry) {
                return flatten_labels(array.mapv(|v| v as f64));
            }
        };
    }
    try_type!(f32);
    try_type!(f64);
    try_type!(i64);
    try_type!(i32);
    try_type!(u8);
    try_type!(i8);
    try_type!(u32);
    try_type!(u64);
    if let Ok(array) = npz.by_name::<OwnedRepr<bool>, IxDyn>(&entry) {
        return flatten_labels(array.mapv(|v| if v { 1.0 } else { 0.0 }));
    }
    bail!("array '{}' missing or has an unsupported dtype", name)
}

fn flatten_labels(array: ArrayD<f64>) -> Result<Vec<f64>> {
    match array.shape() {
        [_] => Ok(array.iter().copied().collect()),
        [_, 1] => Ok(array.iter().copied().collect()),
        shape => bail!("labels must have shape N or N x 1 (got {:?})", shape),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array4};
    use ndarray_npy::NpzWriter;

    #[test]
    fn test_synthetic_dataset() {
        let dataset = VolumeDataset::load_synthetic(20, 32, 32, 42);

        assert_eq!(dataset.config.id, "synthetic");
        assert_eq!(dataset.len(), 20);
        for (i, sample) in dataset.samples.iter().enumerate() {
            assert_eq!(sample.index, i);
            assert_eq!(sample.volume.dims(), (32, 32, 3));
        }
    }

    #[test]
    fn test_synthetic_dataset_is_reproducible() {
        let a = VolumeDataset::load_synthetic(5, 16, 16, 7);
        let b = VolumeDataset::load_synthetic(5, 16, 16, 7);
        for (sa, sb) in a.samples.iter().zip(b.samples.iter()) {
            assert_eq!(sa.label, sb.label);
            assert_eq!(sa.volume, sb.volume);
        }
    }

    #[test]
    fn test_positive_samples_are_brighter() {
        let dataset = VolumeDataset::load_synthetic(200, 16, 16, 42);
        let max_of = |s: &VolumeSample| s.volume.as_array().fold(0.0f32, |m, &v| m.max(v));

        for sample in &dataset.samples {
            match sample.label {
                Label::Positive => assert!(max_of(sample) >= 0.85),
                Label::Negative => assert!(max_of(sample) < 0.3),
            }
        }

        let dist = VolumeDataset::label_distribution(&dataset.samples);
        let positives = *dist.get(&Label::Positive).unwrap_or(&0);
        assert!(positives > 60 && positives < 140);
    }

    #[test]
    fn test_load_npz() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volumes.npz");

        let x = Array4::<f32>::from_shape_fn((3, 4, 5, 3), |(n, y, x, l)| (n + y + x + l) as f32);
        let y = Array2::<i64>::from_shape_vec((3, 1), vec![1, 0, 1]).unwrap();
        {
            let mut writer = NpzWriter::new(File::create(&path).unwrap());
            writer.add_array("X", &x).unwrap();
            writer.add_array("Y", &y).unwrap();
            writer.finish().unwrap();
        }

        let dataset = VolumeDataset::load_npz(&path).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.config.format, "npz");
        assert_eq!(dataset.samples[0].label, Label::Positive);
        assert_eq!(dataset.samples[1].label, Label::Negative);
        assert_eq!(dataset.samples[2].volume.as_array()[[1, 2, 0]], 5.0);
    }

    #[test]
    fn test_load_npz_rejects_mismatched_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.npz");

        let x = Array4::<f64>::zeros((2, 4, 4, 3));
        let y = ndarray::Array1::<u8>::zeros(3);
        {
            let mut writer = NpzWriter::new(File::create(&path).unwrap());
            writer.add_array("X", &x).unwrap();
            writer.add_array("Y", &y).unwrap();
            writer.finish().unwrap();
        }

        assert!(VolumeDataset::load_npz(&path).is_err());
    }
}
