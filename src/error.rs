// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Error types for the explanation core.

use ndarray::ShapeError;
use thiserror::Error;

/// Result type alias for explanation operations.
pub type Result<T> = std::result::Result<T, LimeError>;

/// Errors raised by segmentation, perturbation, surrogate fitting and I/O.
#[derive(Error, Debug)]
pub enum LimeError {
    /// Invalid parameter value.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Invalid input data.
    #[error("Invalid input data: {0}")]
    InvalidInput(String),
    /// Shape mismatch in arrays.
    #[error("Shape mismatch: expected {expected_shape}, got {actual_shape}")]
    ShapeMismatch {
        expected_shape: String,
        actual_shape: String,
    },
    /// The classifier failed to produce a score.
    #[error("Classifier error: {0}")]
    Classifier(String),
    /// Reading or writing an NPZ archive failed.
    #[error("Archive error: {0}")]
    Archive(String),
    /// An IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LimeError {
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        LimeError::ShapeMismatch {
            expected_shape: format!("{:?}", expected),
            actual_shape: format!("{:?}", actual),
        }
    }
}

impl From<ShapeError> for LimeError {
    fn from(err: ShapeError) -> Self {
        LimeError::ShapeMismatch {
            expected_shape: "unknown".to_string(),
            actual_shape: err.to_string(),
        }
    }
}

impl From<ndarray_npy::ReadNpzError> for LimeError {
    fn from(err: ndarray_npy::ReadNpzError) -> Self {
        LimeError::Archive(err.to_string())
    }
}

impl From<ndarray_npy::WriteNpzError> for LimeError {
    fn from(err: ndarray_npy::WriteNpzError) -> Self {
        LimeError::Archive(err.to_string())
    }
}
