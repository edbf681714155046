// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! LIME explanation CLI for binary volume classifiers
//!
//! Usage:
//!   lime-explain --dataset synthetic --seed 42
//!   lime-explain --data-root ./data --dataset scans --model-path probe.json --n-pert 50

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use volume_lime::checkpoint::DEFAULT_TAG;
use volume_lime::pipeline::{ExplainConfig, ExplanationPipeline, SampleStatus};

#[derive(Parser, Debug)]
#[command(name = "lime-explain")]
#[command(about = "Explain a binary volume classifier with superpixel LIME")]
#[command(version)]
struct Args {
    /// Directory holding dataset archives
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Dataset name ("synthetic" or an .npz archive under --data-root)
    #[arg(short, long, default_value = "synthetic")]
    dataset: String,

    /// Classifier model file (.json probe or .onnx graph)
    #[arg(short, long)]
    model_path: Option<PathBuf>,

    /// Separate weights file for the model
    #[arg(short, long)]
    weights_path: Option<PathBuf>,

    /// SLIC iterations
    #[arg(short, long, default_value_t = 100)]
    iterations: usize,

    /// Augmentations (comma-separated: rotate, flip_horizontally, flip_vertically, brightness)
    #[arg(short, long)]
    transformations: Option<String>,

    /// Apply the augmentations to each sample before explaining it
    #[arg(long)]
    augment: bool,

    /// Random perturbations per explained sample
    #[arg(long, default_value_t = 10)]
    n_pert: usize,

    /// Checkpoint every N samples
    #[arg(long, default_value_t = 10)]
    steps: usize,

    /// Approximate number of superpixels
    #[arg(long, default_value_t = 25)]
    n_segments: usize,

    /// SLIC compactness
    #[arg(long, default_value_t = 0.5)]
    compactness: f32,

    /// Superpixels kept per layer in the final mask
    #[arg(long, default_value_t = 1)]
    top_features: usize,

    /// Width of the exponential kernel weighting perturbations
    #[arg(long, default_value_t = 0.25)]
    kernel_width: f64,

    /// Random seed for reproducibility
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Suffix of the checkpoint archive names
    #[arg(long, default_value = DEFAULT_TAG)]
    tag: String,

    /// Output directory for checkpoints and results
    #[arg(short, long, default_value = "results")]
    output: PathBuf,

    /// Number of samples for the synthetic dataset
    #[arg(long, default_value_t = 20)]
    num_samples: usize,

    /// Output format (json, markdown, both)
    #[arg(short, long, default_value = "both")]
    format: String,

    /// Show a progress bar over each sample's perturbations
    #[arg(long)]
    progress: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    tracing::info!("Volume LIME Explanation Pipeline");
    tracing::info!("================================");
    tracing::info!("Dataset: {}", args.dataset);
    tracing::info!("Seed: {}", args.seed);
    tracing::info!("Perturbations per sample: {}", args.n_pert);

    let transformations: Vec<String> = args
        .transformations
        .map(|t| t.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let config = ExplainConfig {
        data_root: args.data_root.map(|p| p.to_string_lossy().to_string()),
        dataset: args.dataset.clone(),
        model_path: args.model_path.map(|p| p.to_string_lossy().to_string()),
        weights_path: args.weights_path.map(|p| p.to_string_lossy().to_string()),
        iterations: args.iterations,
        transformations,
        augment: args.augment,
        n_pert: args.n_pert,
        steps: args.steps,
        n_segments: args.n_segments,
        compactness: args.compactness,
        top_features: args.top_features,
        kernel_width: args.kernel_width,
        seed: args.seed,
        checkpoint_tag: args.tag,
        output_dir: args.output.to_string_lossy().to_string(),
        synthetic_size: args.num_samples,
        show_progress: args.progress,
        ..ExplainConfig::default()
    };

    let mut pipeline = ExplanationPipeline::new(config);
    let results = pipeline.run()?;
    let summary = &results.summary;

    println!("\n{}", "=".repeat(70));
    println!("EXPLANATION SUMMARY");
    println!("{}", "=".repeat(70));
    println!("\nClassifier: {}", results.classifier);
    println!(
        "Samples: {} ({} positive, {} negative skipped)",
        summary.total_samples, summary.positives, summary.skipped_negatives
    );
    println!("Misclassified positives: {}", summary.misclassified);
    println!("Explained: {} ({} stored)", summary.explained, summary.records_stored);

    let explained: Vec<_> = results
        .samples
        .iter()
        .filter(|s| s.status == SampleStatus::Explained)
        .collect();
    if !explained.is_empty() {
        println!("\n{:<8} {:>10} {:>12} {:>12}  {}", "Sample", "Score", "Best pert", "Masked", "Top segments");
        println!("{:-<70}", "");
        for s in explained {
            println!(
                "{:<8} {:>10.4} {:>12.4} {:>12.4}  {:?}",
                s.index,
                s.score.unwrap_or_default(),
                s.best_perturbation_score.unwrap_or_default(),
                s.final_score.unwrap_or_default(),
                s.top_segments
            );
        }
        println!("{:-<70}", "");
    }

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("Failed to create output directory {}", args.output.display()))?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");

    if args.format == "json" || args.format == "both" {
        let json_path = args.output.join(format!("lime_{}_{}.json", args.dataset, timestamp));
        ExplanationPipeline::save_results(&results, &json_path)?;
        println!("\nJSON results saved to: {}", json_path.display());
    }

    if args.format == "markdown" || args.format == "both" {
        let report = ExplanationPipeline::generate_report(&results);
        let md_path = args.output.join(format!("lime_{}_{}.md", args.dataset, timestamp));
        std::fs::write(&md_path, report)?;
        println!("Markdown report saved to: {}", md_path.display());
    }

    println!("Checkpoints:");
    for file in &summary.checkpoint_files {
        println!("  {}", file);
    }

    println!("\nExplanation complete!");

    Ok(())
}
