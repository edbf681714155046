// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Reproducible explanation pipeline
//!
//! Orchestrates:
//! - Dataset and classifier loading
//! - Preprocessing and optional augmentation
//! - Screening of positives by the classifier
//! - LIME explanation of correctly classified positives
//! - Periodic NPZ checkpoints
//! - Results serialization and reporting

use crate::augmentation::Augmentation3D;
use crate::checkpoint::{CheckpointPaths, CheckpointStore, ExplanationRecord, DEFAULT_TAG};
use crate::classifier::{load_classifier, LogisticProbe, VolumeClassifier};
use crate::datasets::VolumeDataset;
use crate::lime::{Lime, LimeSettings};
use crate::segmentation::SlicParams;
use crate::surrogate::DEFAULT_KERNEL_WIDTH;
use crate::volume::{Label, DECISION_THRESHOLD};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Configuration for an explanation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainConfig {
    /// Directory holding dataset archives
    pub data_root: Option<String>,
    /// "synthetic" or the name of an `.npz` archive under `data_root`
    pub dataset: String,
    /// Classifier model (`.json` probe or `.onnx` graph)
    pub model_path: Option<String>,
    /// Separate weights overriding those stored with the model
    pub weights_path: Option<String>,
    /// SLIC k-means iterations
    pub iterations: usize,
    /// Augmentations applied when `augment` is set
    pub transformations: Vec<String>,
    pub augment: bool,
    /// Random perturbations per explained sample
    pub n_pert: usize,
    /// Checkpoint after every `steps` samples
    pub steps: usize,
    pub n_segments: usize,
    pub compactness: f32,
    /// Superpixels kept per layer in the final mask
    pub top_features: usize,
    pub kernel_width: f64,
    pub seed: u64,
    /// Suffix of the checkpoint archive names
    pub checkpoint_tag: String,
    pub output_dir: String,
    /// Size of the generated dataset when `dataset` is "synthetic"
    pub synthetic_size: usize,
    /// Height and width of generated volumes
    pub synthetic_dim: usize,
    pub show_progress: bool,
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self {
            data_root: None,
            dataset: "synthetic".to_string(),
            model_path: None,
            weights_path: None,
            iterations: 100,
            transformations: vec![],
            augment: false,
            n_pert: 10,
            steps: 10,
            n_segments: 25,
            compactness: 0.5,
            top_features: 1,
            kernel_width: DEFAULT_KERNEL_WIDTH,
            seed: 42,
            checkpoint_tag: DEFAULT_TAG.to_string(),
            output_dir: "results".to_string(),
            synthetic_size: 20,
            synthetic_dim: 32,
            show_progress: false,
        }
    }
}

impl ExplainConfig {
    pub fn lime_settings(&self) -> LimeSettings {
        LimeSettings {
            slic: SlicParams {
                n_segments: self.n_segments,
                compactness: self.compactness,
                max_iter: self.iterations,
                ..SlicParams::default()
            },
            n_pert: self.n_pert,
            num_top_features: self.top_features,
            kernel_width: self.kernel_width,
            show_progress: self.show_progress,
        }
    }
}

/// What happened to one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleStatus {
    /// Negative samples are never explained
    Skipped,
    /// Positive sample scored below the decision threshold
    Misclassified,
    /// Explained, but no perturbation beat the threshold
    NoImprovement,
    /// Explained and stored
    Explained,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSummary {
    pub index: usize,
    pub label: Label,
    pub status: SampleStatus,
    /// Classifier score of the preprocessed volume (not computed for negatives)
    pub score: Option<f32>,
    pub segment_counts: Vec<usize>,
    pub best_perturbation_index: Option<usize>,
    pub best_perturbation_score: Option<f32>,
    /// Top segments per layer
    pub top_segments: Vec<Vec<usize>>,
    /// Weighted R^2 of each layer surrogate
    pub surrogate_scores: Vec<f64>,
    /// Classifier score of the volume masked to its top segments
    pub final_score: Option<f32>,
}

impl SampleSummary {
    fn new(index: usize, label: Label, status: SampleStatus, score: Option<f32>) -> Self {
        Self {
            index,
            label,
            status,
            score,
            segment_counts: vec![],
            best_perturbation_index: None,
            best_perturbation_score: None,
            top_segments: vec![],
            surrogate_scores: vec![],
            final_score: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub id: String,
    pub name: String,
    pub source: String,
    pub total_samples: usize,
    /// Height, width and layers of the first sample
    pub volume_shape: Option<(usize, usize, usize)>,
    pub label_distribution: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_samples: usize,
    pub positives: usize,
    pub skipped_negatives: usize,
    pub misclassified: usize,
    /// Positives that went through the explanation loop
    pub explained: usize,
    /// Explanations stored in the perturbation archives
    pub records_stored: usize,
    pub mean_best_score: Option<f64>,
    pub mean_final_score: Option<f64>,
    pub checkpoints_written: usize,
    pub checkpoint_files: Vec<String>,
}

/// Complete run results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub config: ExplainConfig,
    pub dataset_info: DatasetInfo,
    pub classifier: String,
    pub samples: Vec<SampleSummary>,
    pub summary: RunSummary,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

/// Main explanation pipeline
pub struct ExplanationPipeline {
    config: ExplainConfig,
    dataset: Option<VolumeDataset>,
    classifier: Option<Box<dyn VolumeClassifier>>,
}

impl ExplanationPipeline {
    pub fn new(config: ExplainConfig) -> Self {
        Self {
            config,
            dataset: None,
            classifier: None,
        }
    }

    pub fn config(&self) -> &ExplainConfig {
        &self.config
    }

    /// Use an already loaded dataset instead of the configured one
    pub fn with_dataset(mut self, dataset: VolumeDataset) -> Self {
        self.dataset = Some(dataset);
        self
    }

    /// Use an already constructed classifier instead of the configured one
    pub fn with_classifier(mut self, classifier: Box<dyn VolumeClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Load dataset based on configuration
    pub fn load_dataset(&mut self) -> Result<()> {
        let dataset = if self.config.dataset == "synthetic" {
            tracing::info!("Loading synthetic dataset with seed {}", self.config.seed);
            VolumeDataset::load_synthetic(
                self.config.synthetic_size,
                self.config.synthetic_dim,
                self.config.synthetic_dim,
                self.config.seed,
            )
        } else {
            let path = self.dataset_path();
            tracing::info!("Loading dataset from {}", path.display());
            VolumeDataset::load_npz(&path)?
        };

        let dist = VolumeDataset::label_distribution(&dataset.samples);
        tracing::info!(
            "Dataset loaded: {} samples (positive={}, negative={})",
            dataset.len(),
            dist.get(&Label::Positive).unwrap_or(&0),
            dist.get(&Label::Negative).unwrap_or(&0)
        );

        self.dataset = Some(dataset);
        Ok(())
    }

    fn dataset_path(&self) -> PathBuf {
        let mut path = match self.config.data_root {
            Some(ref root) => Path::new(root).join(&self.config.dataset),
            None => PathBuf::from(&self.config.dataset),
        };
        if path.extension().is_none() {
            path.set_extension("npz");
        }
        path
    }

    /// Load the classifier based on configuration
    pub fn load_classifier(&mut self) -> Result<()> {
        let classifier: Box<dyn VolumeClassifier> = match self.config.model_path {
            Some(ref model_path) => {
                let weights = self.config.weights_path.as_ref().map(Path::new);
                load_classifier(Path::new(model_path), weights)
                    .with_context(|| format!("Failed to load classifier from {}", model_path))?
            }
            None => {
                tracing::warn!("No model path provided, using built-in centre detector");
                Box::new(LogisticProbe::centre_detector(4))
            }
        };
        tracing::info!("Classifier: {} ({})", classifier.name(), classifier.description());

        self.classifier = Some(classifier);
        Ok(())
    }

    fn checkpoint_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.output_dir)
    }

    /// Run the full explanation pipeline
    pub fn run(&mut self) -> Result<RunResults> {
        if self.dataset.is_none() {
            self.load_dataset()?;
        }
        if self.classifier.is_none() {
            self.load_classifier()?;
        }
        let (Some(dataset), Some(classifier)) = (self.dataset.as_ref(), self.classifier.as_deref()) else {
            bail!("Dataset or classifier not loaded");
        };

        let augmentation = Augmentation3D::from_names(&self.config.transformations)?;
        if self.config.augment && augmentation.transformations.is_empty() {
            tracing::warn!("Augmentation enabled but no transformations configured");
        }
        let settings = self.config.lime_settings();
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let checkpoint_dir = self.checkpoint_dir();
        let tag = &self.config.checkpoint_tag;

        let mut store = CheckpointStore::new();
        let mut samples = Vec::with_capacity(dataset.len());
        let mut checkpoints_written = 0;

        for sample in &dataset.samples {
            let idx = sample.index;
            let mut volume = augmentation.validation_preprocessing(&sample.volume);
            if self.config.augment {
                volume = augmentation.train_preprocessing(&volume, &mut rng);
            }

            let summary = match sample.label {
                Label::Negative => {
                    tracing::debug!("Sample {} is negative, skipping", idx);
                    SampleSummary::new(idx, sample.label, SampleStatus::Skipped, None)
                }
                Label::Positive => {
                    let score = classifier
                        .predict(&volume)
                        .with_context(|| format!("Classifier failed on sample {}", idx))?;

                    if score < DECISION_THRESHOLD {
                        tracing::warn!("Sample {} misclassified (score {:.4}), ignoring", idx, score);
                        SampleSummary::new(idx, sample.label, SampleStatus::Misclassified, Some(score))
                    } else {
                        tracing::info!("Explaining sample {} (score {:.4})", idx, score);
                        store.push_correct(idx, volume.clone(), sample.label);

                        let explanation = Lime::new(volume)
                            .explain(classifier, sample.label, &settings, &mut rng)
                            .with_context(|| format!("Explanation failed for sample {}", idx))?;

                        let status = match explanation.best_perturbation {
                            Some(ref best) => {
                                tracing::info!(
                                    "Sample {}: best perturbation {} scored {:.4}, masked score {:.4}",
                                    idx,
                                    best.index,
                                    best.score,
                                    explanation.final_score
                                );
                                store.push_record(ExplanationRecord {
                                    index: idx,
                                    volume: explanation.final_volume.clone(),
                                    mask: explanation.mask_volume.clone(),
                                    label: sample.label,
                                });
                                SampleStatus::Explained
                            }
                            None => {
                                tracing::warn!("Sample {}: no perturbation beat the threshold", idx);
                                SampleStatus::NoImprovement
                            }
                        };

                        SampleSummary {
                            segment_counts: explanation.segment_counts.clone(),
                            best_perturbation_index: explanation.best_perturbation.as_ref().map(|b| b.index),
                            best_perturbation_score: explanation.best_perturbation.as_ref().map(|b| b.score),
                            top_segments: explanation.surrogates.iter().map(|s| s.top_segments.clone()).collect(),
                            surrogate_scores: explanation.surrogates.iter().map(|s| s.score).collect(),
                            final_score: Some(explanation.final_score),
                            ..SampleSummary::new(idx, sample.label, status, Some(score))
                        }
                    }
                }
            };
            samples.push(summary);

            if self.config.steps > 0 && (idx + 1) % self.config.steps == 0 {
                store
                    .flush(&checkpoint_dir, tag)
                    .with_context(|| format!("Failed to write checkpoint after sample {}", idx))?;
                checkpoints_written += 1;
            }
        }

        let paths = store
            .flush(&checkpoint_dir, tag)
            .with_context(|| format!("Failed to write final checkpoint to {}", checkpoint_dir.display()))?;
        checkpoints_written += 1;

        let summary = summarize(&samples, &store, checkpoints_written, &paths);
        tracing::info!(
            "Run complete: {} positives, {} explained, {} stored, {} misclassified",
            summary.positives,
            summary.explained,
            summary.records_stored,
            summary.misclassified
        );

        Ok(RunResults {
            config: self.config.clone(),
            dataset_info: dataset_info(dataset),
            classifier: classifier.name().to_string(),
            samples,
            summary,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Save results to JSON file
    pub fn save_results(results: &RunResults, output_path: &Path) -> Result<()> {
        std::fs::create_dir_all(output_path.parent().unwrap_or(Path::new(".")))?;
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(output_path, json)?;
        tracing::info!("Results saved to {}", output_path.display());
        Ok(())
    }

    /// Generate a markdown report
    pub fn generate_report(results: &RunResults) -> String {
        let mut report = String::new();
        let summary = &results.summary;

        report.push_str("# Volume LIME Explanation Report\n\n");
        report.push_str(&format!("**Generated:** {}\n\n", results.timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
        report.push_str(&format!("**Version:** {}\n\n", results.version));
        report.push_str(&format!("**Classifier:** {}\n\n", results.classifier));

        report.push_str("## Dataset\n\n");
        report.push_str(&format!("- **ID:** {}\n", results.dataset_info.id));
        report.push_str(&format!("- **Name:** {}\n", results.dataset_info.name));
        report.push_str(&format!("- **Source:** {}\n", results.dataset_info.source));
        report.push_str(&format!("- **Total Samples:** {}\n", results.dataset_info.total_samples));
        if let Some((h, w, l)) = results.dataset_info.volume_shape {
            report.push_str(&format!("- **Volume Shape:** {} x {} x {}\n", h, w, l));
        }
        report.push('\n');

        report.push_str("## Summary\n\n");
        report.push_str("| Positives | Skipped negatives | Misclassified | Explained | Stored |\n");
        report.push_str("|-----------|-------------------|---------------|-----------|--------|\n");
        report.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n\n",
            summary.positives, summary.skipped_negatives, summary.misclassified, summary.explained, summary.records_stored
        ));
        if let Some(best) = summary.mean_best_score {
            report.push_str(&format!("- Mean best perturbation score: {:.4}\n", best));
        }
        if let Some(fin) = summary.mean_final_score {
            report.push_str(&format!("- Mean masked score: {:.4}\n", fin));
        }
        report.push_str(&format!("- Checkpoints written: {}\n\n", summary.checkpoints_written));

        let explained: Vec<_> = results
            .samples
            .iter()
            .filter(|s| matches!(s.status, SampleStatus::Explained | SampleStatus::NoImprovement))
            .collect();
        if !explained.is_empty() {
            report.push_str("## Explained Samples\n\n");
            report.push_str("| Sample | Score | Segments | Best perturbation | Masked score | Top segments |\n");
            report.push_str("|--------|-------|----------|-------------------|--------------|--------------|\n");
            for s in explained {
                let best = match (s.best_perturbation_index, s.best_perturbation_score) {
                    (Some(i), Some(score)) => format!("#{} ({:.4})", i, score),
                    _ => "-".to_string(),
                };
                report.push_str(&format!(
                    "| {} | {} | {:?} | {} | {} | {:?} |\n",
                    s.index,
                    s.score.map_or("-".to_string(), |v| format!("{:.4}", v)),
                    s.segment_counts,
                    best,
                    s.final_score.map_or("-".to_string(), |v| format!("{:.4}", v)),
                    s.top_segments
                ));
            }
            report.push('\n');
        }

        if !summary.checkpoint_files.is_empty() {
            report.push_str("## Checkpoints\n\n");
            for file in &summary.checkpoint_files {
                report.push_str(&format!("- `{}`\n", file));
            }
            report.push('\n');
        }

        report.push_str("## Configuration\n\n");
        report.push_str(&format!(
            "```json\n{}\n```\n",
            serde_json::to_string_pretty(&results.config).unwrap_or_default()
        ));

        report
    }
}

fn dataset_info(dataset: &VolumeDataset) -> DatasetInfo {
    DatasetInfo {
        id: dataset.config.id.clone(),
        name: dataset.config.name.clone(),
        source: dataset.config.source.clone(),
        total_samples: dataset.len(),
        volume_shape: dataset.samples.first().map(|s| s.volume.dims()),
        label_distribution: VolumeDataset::label_distribution(&dataset.samples)
            .iter()
            .map(|(k, v)| (format!("{:?}", k), *v))
            .collect(),
    }
}

fn summarize(
    samples: &[SampleSummary],
    store: &CheckpointStore,
    checkpoints_written: usize,
    paths: &CheckpointPaths,
) -> RunSummary {
    let count = |status: SampleStatus| samples.iter().filter(|s| s.status == status).count();
    let mean = |values: Vec<f32>| {
        if values.is_empty() {
            None
        } else {
            Some(values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64)
        }
    };

    RunSummary {
        total_samples: samples.len(),
        positives: samples.iter().filter(|s| s.label == Label::Positive).count(),
        skipped_negatives: count(SampleStatus::Skipped),
        misclassified: count(SampleStatus::Misclassified),
        explained: count(SampleStatus::Explained) + count(SampleStatus::NoImprovement),
        records_stored: store.record_count(),
        mean_best_score: mean(samples.iter().filter_map(|s| s.best_perturbation_score).collect()),
        mean_final_score: mean(samples.iter().filter_map(|s| s.final_score).collect()),
        checkpoints_written,
        checkpoint_files: [&paths.correct_predictions, &paths.perturbations, &paths.masks]
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::load_archive;
    use crate::datasets::{DatasetConfig, VolumeSample};
    use crate::volume::Volume;
    use ndarray::Array3;

    fn test_config(output_dir: &Path) -> ExplainConfig {
        ExplainConfig {
            output_dir: output_dir.display().to_string(),
            synthetic_size: 6,
            synthetic_dim: 16,
            n_pert: 6,
            n_segments: 9,
            iterations: 10,
            steps: 2,
            ..ExplainConfig::default()
        }
    }

    /// Always returns the same score
    struct ConstantClassifier(f32);

    impl VolumeClassifier for ConstantClassifier {
        fn predict(&self, _volume: &Volume) -> crate::error::Result<f32> {
            Ok(self.0)
        }

        fn name(&self) -> &str {
            "Constant"
        }

        fn description(&self) -> &str {
            "Returns a fixed score"
        }
    }

    fn two_sample_dataset() -> VolumeDataset {
        let sample = |index, label| VolumeSample {
            index,
            volume: Volume::new(Array3::from_shape_fn((8, 8, 3), |(y, x, _)| (y * 8 + x) as f32)).unwrap(),
            label,
        };
        VolumeDataset {
            config: DatasetConfig {
                id: "pair".to_string(),
                name: "Pair".to_string(),
                description: String::new(),
                source: "memory".to_string(),
                format: "memory".to_string(),
            },
            samples: vec![sample(0, Label::Negative), sample(1, Label::Positive)],
        }
    }

    #[test]
    fn test_default_config() {
        let config = ExplainConfig::default();
        assert_eq!(config.n_pert, 10);
        assert_eq!(config.steps, 10);
        assert_eq!(config.iterations, 100);
        assert_eq!(config.checkpoint_tag, "apex_1");

        let settings = config.lime_settings();
        assert_eq!(settings.slic.max_iter, 100);
        assert_eq!(settings.num_top_features, 1);
    }

    #[test]
    fn test_dataset_path_adds_extension() {
        let pipeline = ExplanationPipeline::new(ExplainConfig {
            data_root: Some("/data".to_string()),
            dataset: "scans".to_string(),
            ..ExplainConfig::default()
        });
        assert_eq!(pipeline.dataset_path(), PathBuf::from("/data/scans.npz"));
    }

    #[test]
    fn test_run_on_synthetic_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = ExplanationPipeline::new(test_config(dir.path()));
        let results = pipeline.run().unwrap();

        assert_eq!(results.samples.len(), 6);
        assert_eq!(results.summary.total_samples, 6);
        assert_eq!(results.classifier, "CentreDetector");
        for s in &results.samples {
            match s.label {
                Label::Negative => assert_eq!(s.status, SampleStatus::Skipped),
                Label::Positive => assert_ne!(s.status, SampleStatus::Skipped),
            }
        }
        assert_eq!(
            results.summary.positives,
            results.summary.misclassified + results.summary.explained
        );
        // Three periodic checkpoints plus the final one
        assert_eq!(results.summary.checkpoints_written, 4);

        let correct = load_archive(&dir.path().join("correct_predictions_apex_1.npz")).unwrap();
        assert_eq!(correct.len(), results.summary.explained);
        let masks = load_archive(&dir.path().join("masks_apex_1.npz")).unwrap();
        assert_eq!(masks.len(), results.summary.records_stored);
    }

    #[test]
    fn test_negatives_are_never_scored() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = ExplanationPipeline::new(test_config(dir.path()))
            .with_dataset(two_sample_dataset())
            .with_classifier(Box::new(ConstantClassifier(0.9)));
        let results = pipeline.run().unwrap();

        assert_eq!(results.samples[0].status, SampleStatus::Skipped);
        assert!(results.samples[0].score.is_none());
        assert_eq!(results.samples[1].score, Some(0.9));
        assert_eq!(results.samples[1].status, SampleStatus::Explained);
        assert_eq!(results.summary.records_stored, 1);

        let perturbations = load_archive(&dir.path().join("perturbations_apex_1.npz")).unwrap();
        assert_eq!(perturbations.idx.to_vec(), vec![1]);
    }

    #[test]
    fn test_misclassified_positives_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = ExplanationPipeline::new(test_config(dir.path()))
            .with_dataset(two_sample_dataset())
            .with_classifier(Box::new(ConstantClassifier(0.2)));
        let results = pipeline.run().unwrap();

        assert_eq!(results.samples[1].status, SampleStatus::Misclassified);
        assert_eq!(results.summary.explained, 0);
        let correct = load_archive(&dir.path().join("correct_predictions_apex_1.npz")).unwrap();
        assert!(correct.is_empty());
    }

    #[test]
    fn test_positive_at_threshold_without_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = ExplanationPipeline::new(test_config(dir.path()))
            .with_dataset(two_sample_dataset())
            .with_classifier(Box::new(ConstantClassifier(0.5)));
        let results = pipeline.run().unwrap();

        // Explained, but 0.5 never strictly beats the 0.5 baseline
        assert_eq!(results.samples[1].status, SampleStatus::NoImprovement);
        assert_eq!(results.summary.records_stored, 0);
        assert_eq!(results.summary.explained, 1);
    }

    #[test]
    fn test_unknown_transformation_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.transformations = vec!["warp".to_string()];
        let mut pipeline = ExplanationPipeline::new(config).with_dataset(two_sample_dataset());
        assert!(pipeline.run().is_err());
    }

    #[test]
    fn test_report_and_results_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = ExplanationPipeline::new(test_config(dir.path()))
            .with_dataset(two_sample_dataset())
            .with_classifier(Box::new(ConstantClassifier(0.9)));
        let results = pipeline.run().unwrap();

        let report = ExplanationPipeline::generate_report(&results);
        assert!(report.contains("# Volume LIME Explanation Report"));
        assert!(report.contains("## Explained Samples"));
        assert!(report.contains("\"n_pert\": 6"));

        let path = dir.path().join("out").join("results.json");
        ExplanationPipeline::save_results(&results, &path).unwrap();
        let loaded: RunResults = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.samples.len(), 2);
        assert_eq!(loaded.summary.records_stored, 1);
    }
}
