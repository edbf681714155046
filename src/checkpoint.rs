// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Incremental NPZ checkpoints of explanation results
//!
//! Three archives are rewritten on every flush:
//! - `correct_predictions_<tag>.npz`: `idx`, `X`, `Y`
//! - `perturbations_<tag>.npz`: `idx`, `X` (masked volumes), `mask`, `Y`
//! - `masks_<tag>.npz`: `idx`, `mask`, `Y`

use crate::error::{LimeError, Result};
use crate::volume::{Label, Volume, LAYERS};
use ndarray::{Array1, Array2, Array3, Array4, ArrayD, ArrayView3, Axis, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const DEFAULT_TAG: &str = "apex_1";

/// One explained sample kept for the perturbation and mask archives
#[derive(Debug, Clone)]
pub struct ExplanationRecord {
    pub index: usize,
    /// Volume masked down to its top superpixels
    pub volume: Volume,
    pub mask: Array3<f32>,
    pub label: Label,
}

#[derive(Debug, Clone)]
struct CorrectPrediction {
    index: usize,
    volume: Volume,
    label: Label,
}

/// Paths written by one flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub correct_predictions: PathBuf,
    pub perturbations: PathBuf,
    pub masks: PathBuf,
}

impl CheckpointPaths {
    pub fn new(dir: &Path, tag: &str) -> Self {
        Self {
            correct_predictions: dir.join(format!("correct_predictions_{}.npz", tag)),
            perturbations: dir.join(format!("perturbations_{}.npz", tag)),
            masks: dir.join(format!("masks_{}.npz", tag)),
        }
    }
}

/// Accumulates results in memory until they are flushed to disk
#[derive(Debug, Clone, Default)]
pub struct CheckpointStore {
    correct: Vec<CorrectPrediction>,
    records: Vec<ExplanationRecord>,
    last_dims: Option<(usize, usize, usize)>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_correct(&mut self, index: usize, volume: Volume, label: Label) {
        self.last_dims = Some(volume.dims());
        self.correct.push(CorrectPrediction { index, volume, label });
    }

    pub fn push_record(&mut self, record: ExplanationRecord) {
        self.last_dims = Some(record.volume.dims());
        self.records.push(record);
    }

    pub fn correct_count(&self) -> usize {
        self.correct.len()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Write all three archives into `dir`, replacing earlier checkpoints
    pub fn flush(&self, dir: &Path, tag: &str) -> Result<CheckpointPaths> {
        std::fs::create_dir_all(dir)?;
        let paths = CheckpointPaths::new(dir, tag);
        let dims = self.last_dims.unwrap_or((0, 0, LAYERS));

        let correct_idx = indices(self.correct.iter().map(|c| c.index));
        let correct_x = stack_volumes(self.correct.iter().map(|c| c.volume.as_array()), dims)?;
        let correct_y = labels(self.correct.iter().map(|c| c.label))?;

        let record_idx = indices(self.records.iter().map(|r| r.index));
        let record_x = stack_volumes(self.records.iter().map(|r| r.volume.as_array()), dims)?;
        let record_mask = stack_volumes(self.records.iter().map(|r| r.mask.view()), dims)?;
        let record_y = labels(self.records.iter().map(|r| r.label))?;

        let mut npz = NpzWriter::new_compressed(File::create(&paths.correct_predictions)?);
        npz.add_array("idx", &correct_idx)?;
        npz.add_array("X", &correct_x)?;
        npz.add_array("Y", &correct_y)?;
        npz.finish()?;

        let mut npz = NpzWriter::new_compressed(File::create(&paths.perturbations)?);
        npz.add_array("idx", &record_idx)?;
        npz.add_array("X", &record_x)?;
        npz.add_array("mask", &record_mask)?;
        npz.add_array("Y", &record_y)?;
        npz.finish()?;

        let mut npz = NpzWriter::new_compressed(File::create(&paths.masks)?);
        npz.add_array("idx", &record_idx)?;
        npz.add_array("mask", &record_mask)?;
        npz.add_array("Y", &record_y)?;
        npz.finish()?;

        tracing::info!(
            "Checkpoint '{}': {} correct predictions, {} explanations",
            tag,
            self.correct.len(),
            self.records.len()
        );
        Ok(paths)
    }
}

fn indices(iter: impl Iterator<Item = usize>) -> Array1<i64> {
    iter.map(|i| i as i64).collect()
}

/// Labels as an `n x 1` column in standard layout
fn labels(iter: impl Iterator<Item = Label>) -> Result<Array2<u8>> {
    let values: Vec<u8> = iter.map(|l| l.to_binary()).collect();
    Ok(Array2::from_shape_vec((values.len(), 1), values)?)
}

fn stack_volumes<'a>(
    views: impl Iterator<Item = ArrayView3<'a, f32>>,
    dims: (usize, usize, usize),
) -> Result<Array4<f32>> {
    let views: Vec<ArrayView3<'a, f32>> = views.collect();
    if views.is_empty() {
        return Ok(Array4::zeros((0, dims.0, dims.1, dims.2)));
    }
    Ok(ndarray::stack(Axis(0), &views)?)
}

/// Arrays read back from a checkpoint archive
#[derive(Debug, Clone, Default)]
pub struct CheckpointArchive {
    pub idx: Array1<i64>,
    /// Labels as stored, `n x 1`
    pub labels: Array2<u8>,
    pub volumes: Option<Array4<f32>>,
    pub masks: Option<Array4<f32>>,
}

impl CheckpointArchive {
    pub fn len(&self) -> usize {
        self.idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx.is_empty()
    }
}

/// Read any of the three checkpoint archives
pub fn load_archive(path: &Path) -> Result<CheckpointArchive> {
    let mut npz = NpzReader::new(File::open(path)?)?;
    let names: BTreeSet<String> = npz
        .names()?
        .into_iter()
        .map(|n| n.trim_end_matches(".npy").to_string())
        .collect();

    let idx: Array1<i64> = npz.by_name("idx.npy")?;
    let labels: Array2<u8> = npz.by_name("Y.npy")?;
    let volumes = if names.contains("X") {
        Some(read_4d(&mut npz, "X.npy")?)
    } else {
        None
    };
    let masks = if names.contains("mask") {
        Some(read_4d(&mut npz, "mask.npy")?)
    } else {
        None
    };

    if labels.nrows() != idx.len() {
        return Err(LimeError::shape_mismatch(&[idx.len(), 1], labels.shape()));
    }

    Ok(CheckpointArchive {
        idx,
        labels,
        volumes,
        masks,
    })
}

fn read_4d(npz: &mut NpzReader<File>, name: &str) -> Result<Array4<f32>> {
    let array: ArrayD<f32> = npz.by_name::<OwnedRepr<f32>, IxDyn>(name)?;
    Ok(array.into_dimensionality()?)
}
