// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! LIME explanations for binary classifiers on 3-layer volumes
//!
//! This crate provides:
//! - SLIC superpixel segmentation of a volume's reference layer
//! - Random superpixel perturbations and masking
//! - Kernel-weighted linear surrogates ranking superpixels per layer
//! - Classifier adapters (JSON logistic probe, ONNX behind the `onnx` feature)
//! - NPZ dataset loading, preprocessing and augmentation
//! - Incremental NPZ checkpoints of explanations
//! - A reproducible explanation pipeline with seeded randomness

pub mod augmentation;
pub mod checkpoint;
pub mod classifier;
pub mod datasets;
pub mod error;
pub mod lime;
pub mod metrics;
pub mod pipeline;
pub mod segmentation;
pub mod surrogate;
pub mod volume;

pub use augmentation::{Augmentation3D, Transformation};
pub use checkpoint::{load_archive, CheckpointArchive, CheckpointStore, ExplanationRecord};
pub use classifier::{load_classifier, LogisticProbe, VolumeClassifier};
pub use datasets::{DatasetConfig, VolumeDataset, VolumeSample};
pub use error::{LimeError, Result};
pub use lime::{Lime, LimeSettings, Perturbation, SampleExplanation};
pub use metrics::{ClassificationReport, ConfusionMatrix, ScreeningMetrics};
pub use pipeline::{ExplainConfig, ExplanationPipeline, RunResults};
pub use segmentation::{slic, SlicParams, SuperpixelMap};
pub use surrogate::WeightedLinearRegression;
pub use volume::{Label, Volume};
