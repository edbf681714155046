// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Standalone classifier screening
//!
//! Scores every sample once and reports how many positives an explanation
//! run would go on to explain

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use volume_lime::augmentation::Augmentation3D;
use volume_lime::classifier::{load_classifier, LogisticProbe, VolumeClassifier};
use volume_lime::datasets::VolumeDataset;
use volume_lime::metrics::ScreeningMetrics;
use volume_lime::volume::Label;

#[derive(Parser, Debug)]
#[command(name = "screen-samples")]
#[command(about = "Score a dataset with a volume classifier")]
#[command(version)]
struct Args {
    /// Dataset to use ("synthetic" or an .npz archive path)
    #[arg(short, long, default_value = "synthetic")]
    dataset: String,

    /// Classifier model file (.json probe or .onnx graph)
    #[arg(short, long)]
    model_path: Option<PathBuf>,

    /// Separate weights file for the model
    #[arg(short, long)]
    weights_path: Option<PathBuf>,

    /// Random seed for the synthetic dataset
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Number of samples for the synthetic dataset
    #[arg(short, long, default_value_t = 100)]
    num_samples: usize,

    /// Write the metrics as JSON to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let dataset = if args.dataset == "synthetic" {
        tracing::info!("Loading synthetic dataset ({} samples, seed={})", args.num_samples, args.seed);
        VolumeDataset::load_synthetic(args.num_samples, 32, 32, args.seed)
    } else {
        VolumeDataset::load_npz(&PathBuf::from(&args.dataset))?
    };

    let classifier: Box<dyn VolumeClassifier> = match args.model_path {
        Some(ref path) => load_classifier(path, args.weights_path.as_deref())
            .with_context(|| format!("Failed to load classifier from {}", path.display()))?,
        None => {
            tracing::warn!("No model path provided, using built-in centre detector");
            Box::new(LogisticProbe::centre_detector(4))
        }
    };

    println!("\nDataset: {}", dataset.config.name);
    println!("  Samples: {}", dataset.len());
    for (label, count) in &VolumeDataset::label_distribution(&dataset.samples) {
        println!(
            "  {:?}: {} ({:.1}%)",
            label,
            count,
            *count as f64 / dataset.len().max(1) as f64 * 100.0
        );
    }

    let preprocessing = Augmentation3D::default();
    let volumes: Vec<_> = dataset
        .samples
        .iter()
        .map(|sample| preprocessing.validation_preprocessing(&sample.volume))
        .collect();
    let scores = classifier
        .predict_batch(&volumes)
        .with_context(|| format!("Classifier failed on dataset {}", dataset.config.name))?;
    for (sample, score) in dataset.samples.iter().zip(&scores) {
        tracing::debug!("Sample {} scored {:.4}", sample.index, score);
    }

    let labels: Vec<Label> = dataset.samples.iter().map(|s| s.label).collect();
    let metrics = ScreeningMetrics::from_scores(&scores, &labels)?;

    println!("\n{}", "=".repeat(70));
    println!("SCREENING: {}", classifier.name());
    println!("{}", classifier.description());
    println!("{}", "=".repeat(70));
    println!("{}", metrics.format());

    if let Some(path) = args.output {
        std::fs::write(&path, serde_json::to_string_pretty(&metrics)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Metrics saved to: {}", path.display());
    }

    Ok(())
}
