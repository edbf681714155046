// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Volumetric samples and their binary labels

use crate::error::{LimeError, Result};
use ndarray::{Array3, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

/// Number of stacked 2D layers in every volume
pub const LAYERS: usize = 3;

/// Decision threshold on classifier scores
pub const DECISION_THRESHOLD: f32 = 0.5;

/// Binary label of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    /// Class 1, the class being explained
    Positive,
    /// Class 0
    Negative,
}

impl Label {
    /// Convert to numeric value for storage and metrics
    pub fn to_binary(&self) -> u8 {
        match self {
            Label::Positive => 1,
            Label::Negative => 0,
        }
    }

    /// Create from a stored label (non-zero = positive)
    pub fn from_binary(value: u8) -> Self {
        if value != 0 {
            Label::Positive
        } else {
            Label::Negative
        }
    }

    /// Threshold a classifier score
    pub fn from_score(score: f32) -> Self {
        if score >= DECISION_THRESHOLD {
            Label::Positive
        } else {
            Label::Negative
        }
    }
}

/// One `H x W x 3` sample made of three stacked image layers
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array3<f32>,
}

impl Volume {
    pub fn new(data: Array3<f32>) -> Result<Self> {
        let (h, w, l) = data.dim();
        if l != LAYERS {
            return Err(LimeError::shape_mismatch(&[h, w, LAYERS], &[h, w, l]));
        }
        if h == 0 || w == 0 {
            return Err(LimeError::InvalidInput(format!(
                "volume has empty spatial axes ({}x{})",
                h, w
            )));
        }
        Ok(Self { data })
    }

    /// Wrap data already known to be a valid volume
    pub(crate) fn from_array_unchecked(data: Array3<f32>) -> Self {
        debug_assert_eq!(data.dim().2, LAYERS);
        Self { data }
    }

    /// Stack three equally sized layers into a volume
    pub fn from_layers(layers: &[ArrayView2<f32>]) -> Result<Self> {
        if layers.len() != LAYERS {
            return Err(LimeError::InvalidInput(format!(
                "expected {} layers, got {}",
                LAYERS,
                layers.len()
            )));
        }
        let data = ndarray::stack(Axis(2), layers)?;
        Self::new(data)
    }

    /// Height, width and layer count
    pub fn dims(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn layer(&self, index: usize) -> ArrayView2<'_, f32> {
        self.data.index_axis(Axis(2), index)
    }

    pub fn as_array(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn into_array(self) -> Array3<f32> {
        self.data
    }
}
