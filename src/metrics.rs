// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Screening metrics for a classifier over a labelled dataset
//!
//! Used to check how many positives a run would actually explain:
//! - Confusion matrix at the 0.5 decision threshold
//! - Accuracy, precision, recall, specificity, F1, MCC
//! - AUC-ROC and Brier score from the raw scores

use crate::error::{LimeError, Result};
use crate::volume::Label;
use serde::{Deserialize, Serialize};

/// Confusion matrix with `Positive` as the positive class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub tp: usize,
    pub tn: usize,
    pub fp: usize,
    pub fn_: usize,
}

impl ConfusionMatrix {
    pub fn from_predictions(predictions: &[Label], ground_truth: &[Label]) -> Result<Self> {
        if predictions.len() != ground_truth.len() {
            return Err(LimeError::shape_mismatch(&[ground_truth.len()], &[predictions.len()]));
        }

        let mut matrix = Self::default();
        for (pred, truth) in predictions.iter().zip(ground_truth) {
            match (pred, truth) {
                (Label::Positive, Label::Positive) => matrix.tp += 1,
                (Label::Negative, Label::Negative) => matrix.tn += 1,
                (Label::Positive, Label::Negative) => matrix.fp += 1,
                (Label::Negative, Label::Positive) => matrix.fn_ += 1,
            }
        }
        Ok(matrix)
    }

    pub fn total(&self) -> usize {
        self.tp + self.tn + self.fp + self.fn_
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    /// Share of positives classified correctly; these are the samples a run explains
    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn specificity(&self) -> f64 {
        ratio(self.tn, self.tn + self.fp)
    }

    pub fn f1_score(&self) -> f64 {
        let precision = self.precision();
        let recall = self.recall();
        if precision + recall == 0.0 {
            return 0.0;
        }
        2.0 * precision * recall / (precision + recall)
    }

    /// Matthews correlation coefficient, in `[-1, 1]`
    pub fn mcc(&self) -> f64 {
        let (tp, tn, fp, fn_) = (self.tp as f64, self.tn as f64, self.fp as f64, self.fn_ as f64);
        let denominator = ((tp + fp) * (tp + fn_) * (tn + fp) * (tn + fn_)).sqrt();
        if denominator == 0.0 {
            return 0.0;
        }
        (tp * tn - fp * fn_) / denominator
    }

    pub fn balanced_accuracy(&self) -> f64 {
        (self.recall() + self.specificity()) / 2.0
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    numerator as f64 / denominator as f64
}

/// Classification metrics derived from a confusion matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub confusion_matrix: ConfusionMatrix,
    pub accuracy: f64,
    pub balanced_accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub specificity: f64,
    pub f1_score: f64,
    pub mcc: f64,
    pub support: usize,
}

impl ClassificationReport {
    pub fn from_confusion_matrix(cm: ConfusionMatrix) -> Self {
        Self {
            accuracy: cm.accuracy(),
            balanced_accuracy: cm.balanced_accuracy(),
            precision: cm.precision(),
            recall: cm.recall(),
            specificity: cm.specificity(),
            f1_score: cm.f1_score(),
            mcc: cm.mcc(),
            support: cm.total(),
            confusion_matrix: cm,
        }
    }

    pub fn from_predictions(predictions: &[Label], ground_truth: &[Label]) -> Result<Self> {
        Ok(Self::from_confusion_matrix(ConfusionMatrix::from_predictions(
            predictions,
            ground_truth,
        )?))
    }

    pub fn format(&self) -> String {
        let cm = &self.confusion_matrix;
        format!(
            r#"Classification Report
=====================
Accuracy:          {:.4} ({:.2}%)
Balanced Accuracy: {:.4}
Precision:         {:.4}
Recall:            {:.4}
Specificity:       {:.4}
F1 Score:          {:.4}
MCC:               {:.4}
Support:           {}

Confusion Matrix:
                  Predicted
                  Positive  Negative
Actual Positive  {:>6}    {:>6}
       Negative  {:>6}    {:>6}
"#,
            self.accuracy,
            self.accuracy * 100.0,
            self.balanced_accuracy,
            self.precision,
            self.recall,
            self.specificity,
            self.f1_score,
            self.mcc,
            self.support,
            cm.tp,
            cm.fn_,
            cm.fp,
            cm.tn,
        )
    }
}

/// Screening results for one classifier over one dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningMetrics {
    pub classification: ClassificationReport,
    pub auc_roc: f64,
    /// Mean squared error of the scores, lower is better
    pub brier_score: f64,
    /// Correctly classified positives, i.e. samples an explanation run will explain
    pub explainable: usize,
}

impl ScreeningMetrics {
    /// Threshold `scores` at 0.5 and compare with `ground_truth`
    pub fn from_scores(scores: &[f32], ground_truth: &[Label]) -> Result<Self> {
        if scores.len() != ground_truth.len() {
            return Err(LimeError::shape_mismatch(&[ground_truth.len()], &[scores.len()]));
        }
        let predictions: Vec<Label> = scores.iter().map(|&s| Label::from_score(s)).collect();
        let classification = ClassificationReport::from_predictions(&predictions, ground_truth)?;

        Ok(Self {
            explainable: classification.confusion_matrix.tp,
            auc_roc: auc_roc(scores, ground_truth),
            brier_score: brier_score(scores, ground_truth),
            classification,
        })
    }

    pub fn format(&self) -> String {
        let mut output = self.classification.format();
        output.push_str(&format!("\nAUC-ROC:           {:.4}\n", self.auc_roc));
        output.push_str(&format!("Brier Score:       {:.4}\n", self.brier_score));
        output.push_str(&format!("Explainable:       {}\n", self.explainable));
        output
    }
}

/// Area under the ROC curve by the trapezoidal rule; 0.5 when a class is missing
fn auc_roc(scores: &[f32], ground_truth: &[Label]) -> f64 {
    let mut pairs: Vec<(Label, f32)> = ground_truth.iter().copied().zip(scores.iter().copied()).collect();
    pairs.sort_by(|a, b| b.1.total_cmp(&a.1));

    let n_pos = pairs.iter().filter(|(l, _)| *l == Label::Positive).count() as f64;
    let n_neg = pairs.len() as f64 - n_pos;
    if n_pos == 0.0 || n_neg == 0.0 {
        return 0.5;
    }

    let (mut tp, mut fp) = (0.0, 0.0);
    let (mut tpr_prev, mut fpr_prev) = (0.0, 0.0);
    let mut auc = 0.0;

    // Tied scores form one step of the curve
    let mut i = 0;
    while i < pairs.len() {
        let score = pairs[i].1;
        while i < pairs.len() && pairs[i].1 == score {
            match pairs[i].0 {
                Label::Positive => tp += 1.0,
                Label::Negative => fp += 1.0,
            }
            i += 1;
        }
        let tpr = tp / n_pos;
        let fpr = fp / n_neg;
        auc += (fpr - fpr_prev) * (tpr + tpr_prev) / 2.0;
        tpr_prev = tpr;
        fpr_prev = fpr;
    }

    auc
}

fn brier_score(scores: &[f32], ground_truth: &[Label]) -> f64 {
    if scores.is_empty() {
        return 1.0;
    }
    let sum: f64 = scores
        .iter()
        .zip(ground_truth)
        .map(|(&s, l)| (s as f64 - l.to_binary() as f64).powi(2))
        .sum();
    sum / scores.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    use crate::volume::Label::{Negative as N, Positive as P};

    #[test]
    fn test_confusion_matrix_perfect() {
        let cm = ConfusionMatrix::from_predictions(&[P, P, N, N], &[P, P, N, N]).unwrap();

        assert_eq!(cm, ConfusionMatrix { tp: 2, tn: 2, fp: 0, fn_: 0 });
        assert_abs_diff_eq!(cm.accuracy(), 1.0);
        assert_abs_diff_eq!(cm.f1_score(), 1.0);
        assert_abs_diff_eq!(cm.mcc(), 1.0);
    }

    #[test]
    fn test_confusion_matrix_inverted() {
        let cm = ConfusionMatrix::from_predictions(&[N, N, P, P], &[P, P, N, N]).unwrap();

        assert_eq!(cm.fp, 2);
        assert_eq!(cm.fn_, 2);
        assert_abs_diff_eq!(cm.accuracy(), 0.0);
        assert_abs_diff_eq!(cm.mcc(), -1.0);
    }

    #[test]
    fn test_length_mismatch_is_an_error() {
        assert!(ConfusionMatrix::from_predictions(&[P], &[P, N]).is_err());
        assert!(ScreeningMetrics::from_scores(&[0.2, 0.7], &[P]).is_err());
    }

    #[test]
    fn test_auc_roc() {
        assert_abs_diff_eq!(auc_roc(&[0.9, 0.8, 0.2, 0.1], &[P, P, N, N]), 1.0);
        assert_abs_diff_eq!(auc_roc(&[0.1, 0.2, 0.8, 0.9], &[P, P, N, N]), 0.0);
        // All scores tied
        assert_abs_diff_eq!(auc_roc(&[0.5; 4], &[P, N, P, N]), 0.5);
        // Single class
        assert_abs_diff_eq!(auc_roc(&[0.3, 0.9], &[P, P]), 0.5);
    }

    #[test]
    fn test_brier_score() {
        assert_abs_diff_eq!(brier_score(&[1.0, 0.0], &[P, N]), 0.0);
        assert_abs_diff_eq!(brier_score(&[0.5, 0.5], &[P, N]), 0.25);
    }

    #[test]
    fn test_screening_counts_explainable_positives() {
        let scores = [0.9, 0.4, 0.7, 0.1, 0.6];
        let truth = [P, P, P, N, N];
        let metrics = ScreeningMetrics::from_scores(&scores, &truth).unwrap();

        assert_eq!(metrics.explainable, 2);
        assert_eq!(metrics.classification.confusion_matrix.fp, 1);
        assert!(metrics.format().contains("Explainable:       2"));
    }
}
