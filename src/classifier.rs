// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Binary volume classifiers queried by the explainer
//!
//! Implements:
//! - `LogisticProbe`: pooled-intensity logistic regression stored as JSON
//! - `OnnxClassifier`: any ONNX graph taking `1 x H x W x 3 x 1` input
//!   (requires the `onnx` feature)

use crate::error::{LimeError, Result};
use crate::volume::{Volume, LAYERS};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Trait for all classifiers the explainer can query
pub trait VolumeClassifier: Send + Sync {
    /// Score in `[0, 1]`; `>= 0.5` means the positive class
    fn predict(&self, volume: &Volume) -> Result<f32>;

    /// Score several volumes
    fn predict_batch(&self, volumes: &[Volume]) -> Result<Vec<f32>> {
        volumes.iter().map(|v| self.predict(v)).collect()
    }

    /// Get model name
    fn name(&self) -> &str;

    /// Get model description
    fn description(&self) -> &str;
}

/// Weights that can be loaded separately from a probe's architecture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeWeights {
    pub weights: Vec<f32>,
    pub bias: f32,
}

/// Logistic regression over average-pooled layer intensities.
///
/// Each layer is pooled into a `grid x grid` map; the `LAYERS * grid * grid`
/// pooled values (layer-major, then row, then column) feed a logistic unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticProbe {
    #[serde(default = "default_probe_name")]
    pub name: String,
    pub grid: usize,
    #[serde(default)]
    pub weights: Vec<f32>,
    #[serde(default)]
    pub bias: f32,
}

fn default_probe_name() -> String {
    "LogisticProbe".to_string()
}

impl LogisticProbe {
    pub fn new(grid: usize, weights: Vec<f32>, bias: f32) -> Result<Self> {
        let probe = Self {
            name: default_probe_name(),
            grid,
            weights,
            bias,
        };
        probe.validate()?;
        Ok(probe)
    }

    /// Probe that fires when the central half of the volume is brighter than
    /// its border.
    pub fn centre_detector(grid: usize) -> Self {
        let grid = grid.max(2);
        let inside = |g: usize| ((g as f32 + 0.5) / grid as f32 - 0.5).abs() <= 0.25;
        let cells: Vec<bool> = (0..grid * grid).map(|c| inside(c / grid) && inside(c % grid)).collect();
        let n_in = cells.iter().filter(|&&c| c).count().max(1) as f32;
        let n_out = cells.iter().filter(|&&c| !c).count().max(1) as f32;
        let gain = 8.0;

        let weights = (0..LAYERS)
            .flat_map(|_| cells.iter())
            .map(|&c| {
                if c {
                    gain / (LAYERS as f32 * n_in)
                } else {
                    -gain / (LAYERS as f32 * n_out)
                }
            })
            .collect();

        Self {
            name: "CentreDetector".to_string(),
            grid,
            weights,
            bias: -0.5,
        }
    }

    /// Load a probe from JSON, optionally replacing its weights with a
    /// separate weights file
    pub fn load(model_path: &Path, weights_path: Option<&Path>) -> Result<Self> {
        let file = File::open(model_path)?;
        let mut probe: LogisticProbe = serde_json::from_reader(BufReader::new(file))?;

        if let Some(path) = weights_path {
            let file = File::open(path)?;
            let weights: ProbeWeights = serde_json::from_reader(BufReader::new(file))?;
            probe.weights = weights.weights;
            probe.bias = weights.bias;
        }

        probe.validate()?;
        Ok(probe)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.grid == 0 {
            return Err(LimeError::InvalidParameter("probe grid must be positive".to_string()));
        }
        let expected = LAYERS * self.grid * self.grid;
        if self.weights.len() != expected {
            return Err(LimeError::shape_mismatch(&[expected], &[self.weights.len()]));
        }
        Ok(())
    }

    /// Average-pooled intensities of every layer
    fn pooled_features(&self, volume: &Volume) -> Vec<f32> {
        let (h, w, _) = volume.dims();
        let mut features = Vec::with_capacity(self.weights.len());

        for l in 0..LAYERS {
            let layer = volume.layer(l);
            for gy in 0..self.grid {
                let (y0, y1) = cell_bounds(gy, self.grid, h);
                for gx in 0..self.grid {
                    let (x0, x1) = cell_bounds(gx, self.grid, w);
                    let cell = layer.slice(ndarray::s![y0..y1, x0..x1]);
                    features.push(cell.mean().unwrap_or(0.0));
                }
            }
        }

        features
    }
}

/// Pixel range of grid cell `index`; never empty
fn cell_bounds(index: usize, grid: usize, len: usize) -> (usize, usize) {
    let start = (index * len / grid).min(len - 1);
    let end = ((index + 1) * len / grid).max(start + 1).min(len);
    (start, end)
}

fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

impl VolumeClassifier for LogisticProbe {
    fn predict(&self, volume: &Volume) -> Result<f32> {
        let features = self.pooled_features(volume);
        let logit: f32 = features
            .iter()
            .zip(self.weights.iter())
            .map(|(f, w)| f * w)
            .sum::<f32>()
            + self.bias;
        Ok(sigmoid(logit))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Logistic regression over average-pooled layer intensities"
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxClassifier;

#[cfg(feature = "onnx")]
mod onnx {
    use super::VolumeClassifier;
    use crate::error::{LimeError, Result};
    use crate::volume::Volume;
    use ndarray::Axis;
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use std::path::Path;

    fn model_error(err: ort::Error) -> LimeError {
        LimeError::Classifier(err.to_string())
    }

    /// ONNX graph with a single `1 x H x W x 3 x 1` input and a `1 x 1` output
    pub struct OnnxClassifier {
        session: Session,
        name: String,
    }

    impl OnnxClassifier {
        pub fn load(model_path: &Path) -> Result<Self> {
            tracing::info!("Loading ONNX model from {}", model_path.display());
            let session = Session::builder()
                .map_err(model_error)?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(model_error)?
                .commit_from_file(model_path)
                .map_err(model_error)?;
            let name = model_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "onnx".to_string());
            Ok(Self { session, name })
        }
    }

    impl VolumeClassifier for OnnxClassifier {
        fn predict(&self, volume: &Volume) -> Result<f32> {
            let input = volume
                .as_array()
                .to_owned()
                .insert_axis(Axis(3))
                .insert_axis(Axis(0));
            let tensor = ort::value::Tensor::from_array(input).map_err(model_error)?;
            let outputs = self
                .session
                .run(ort::inputs![tensor].map_err(model_error)?)
                .map_err(model_error)?;
            let scores = outputs[0].try_extract_tensor::<f32>().map_err(model_error)?;
            scores
                .iter()
                .next()
                .copied()
                .ok_or_else(|| LimeError::Classifier("model produced an empty output".to_string()))
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "ONNX graph evaluated with onnxruntime"
        }
    }
}

/// Load a classifier, choosing the implementation from the file extension
pub fn load_classifier(model_path: &Path, weights_path: Option<&Path>) -> Result<Box<dyn VolumeClassifier>> {
    let extension = model_path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "json" => {
            tracing::info!("Model loaded from: {}", model_path.display());
            if let Some(path) = weights_path {
                tracing::info!("Weights loaded from: {}", path.display());
            }
            Ok(Box::new(LogisticProbe::load(model_path, weights_path)?))
        }
        #[cfg(feature = "onnx")]
        "onnx" => {
            if weights_path.is_some() {
                tracing::warn!("ONNX models embed their weights; ignoring separate weights file");
            }
            Ok(Box::new(OnnxClassifier::load(model_path)?))
        }
        #[cfg(not(feature = "onnx"))]
        "onnx" => Err(LimeError::Classifier(
            "ONNX support requires building with the `onnx` feature".to_string(),
        )),
        other => Err(LimeError::Classifier(format!(
            "unsupported model format '{}' ({})",
            other,
            model_path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn centre_bright_volume(size: usize) -> Volume {
        let lo = size / 4;
        let hi = 3 * size / 4;
        Volume::new(Array3::from_shape_fn((size, size, 3), |(y, x, _)| {
            if (lo..hi).contains(&y) && (lo..hi).contains(&x) {
                0.9
            } else {
                0.1
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_centre_detector_separates_classes() {
        let probe = LogisticProbe::centre_detector(4);
        let positive = probe.predict(&centre_bright_volume(32)).unwrap();
        let flat = probe
            .predict(&Volume::new(Array3::from_elem((32, 32, 3), 0.1)).unwrap())
            .unwrap();

        assert!(positive > 0.5);
        assert!(flat < 0.5);
    }

    #[test]
    fn test_predict_batch_matches_single_predictions() {
        let probe = LogisticProbe::centre_detector(4);
        let volumes = vec![
            centre_bright_volume(32),
            Volume::new(Array3::from_elem((32, 32, 3), 0.1)).unwrap(),
            centre_bright_volume(16),
        ];

        let batch = probe.predict_batch(&volumes).unwrap();
        assert_eq!(batch.len(), 3);
        for (volume, score) in volumes.iter().zip(&batch) {
            assert_eq!(probe.predict(volume).unwrap(), *score);
        }
        assert!(batch[0] > 0.5 && batch[1] < 0.5);
        assert!(probe.predict_batch(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_probe_handles_volumes_smaller_than_grid() {
        let probe = LogisticProbe::centre_detector(8);
        let score = probe
            .predict(&Volume::new(Array3::from_elem((3, 3, 3), 0.5)).unwrap())
            .unwrap();
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_probe_rejects_wrong_weight_count() {
        assert!(LogisticProbe::new(2, vec![0.0; 5], 0.0).is_err());
        assert!(LogisticProbe::new(2, vec![0.0; 12], 0.0).is_ok());
    }

    #[test]
    fn test_probe_roundtrip_with_separate_weights() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("probe.json");
        let weights_path = dir.path().join("weights.json");

        LogisticProbe::centre_detector(2).save(&model_path).unwrap();
        let weights = ProbeWeights {
            weights: vec![0.0; 12],
            bias: 3.0,
        };
        std::fs::write(&weights_path, serde_json::to_string(&weights).unwrap()).unwrap();

        let probe = LogisticProbe::load(&model_path, Some(&weights_path)).unwrap();
        assert_eq!(probe.bias, 3.0);
        let score = probe
            .predict(&Volume::new(Array3::from_elem((4, 4, 3), 0.2)).unwrap())
            .unwrap();
        assert!((score - sigmoid(3.0)).abs() < 1e-6);
    }

    #[test]
    fn test_load_classifier_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("probe.json");
        LogisticProbe::centre_detector(4).save(&model_path).unwrap();

        let classifier = load_classifier(&model_path, None).unwrap();
        assert_eq!(classifier.name(), "CentreDetector");

        assert!(load_classifier(&dir.path().join("model.h5"), None).is_err());
    }
}
