// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! LIME explanations for a single volume
//!
//! One `Lime` instance owns one volume and provides:
//! - Superpixel segmentation of the reference layer
//! - Random on/off perturbations of superpixels
//! - Masking of the volume by a perturbation
//! - Per-layer surrogate fits ranking superpixels
//! - The explanation loop driving a classifier over all of the above

use crate::classifier::VolumeClassifier;
use crate::error::{LimeError, Result};
use crate::segmentation::{slic, SlicParams, SuperpixelMap};
use crate::surrogate::{
    distances_to_baseline, kernel_weights, top_features, WeightedLinearRegression, DEFAULT_KERNEL_WIDTH,
};
use crate::volume::{Label, Volume, DECISION_THRESHOLD, LAYERS};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, Array2, Array3, Axis, Zip};
use rand::Rng;
use rand_distr::{Binomial, Distribution};
use serde::{Deserialize, Serialize};

/// Layer whose segmentation is shared by the whole volume
pub const REFERENCE_LAYER: usize = 1;

/// One binary on/off vector per layer, one entry per segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPerturbation")]
pub struct Perturbation {
    layers: Vec<Array1<u8>>,
}

/// Unchecked wire form; deserialized perturbations go through `Perturbation::new`
#[derive(Deserialize)]
struct RawPerturbation {
    layers: Vec<Array1<u8>>,
}

impl TryFrom<RawPerturbation> for Perturbation {
    type Error = LimeError;

    fn try_from(raw: RawPerturbation) -> Result<Self> {
        Self::new(raw.layers)
    }
}

impl Perturbation {
    pub fn new(layers: Vec<Array1<u8>>) -> Result<Self> {
        if layers.len() != LAYERS {
            return Err(LimeError::InvalidInput(format!(
                "perturbation needs {} layers, got {}",
                LAYERS,
                layers.len()
            )));
        }
        if layers.iter().flat_map(|l| l.iter()).any(|&v| v > 1) {
            return Err(LimeError::InvalidInput("perturbation entries must be 0 or 1".to_string()));
        }
        Ok(Self { layers })
    }

    pub fn layer(&self, index: usize) -> &Array1<u8> {
        &self.layers[index]
    }

    /// Number of active segments per layer
    pub fn active_counts(&self) -> Vec<usize> {
        self.layers
            .iter()
            .map(|l| l.iter().filter(|&&v| v == 1).count())
            .collect()
    }
}

/// Surrogate fit for one layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSurrogate {
    /// Indices of the most influential segments, ascending by coefficient
    pub top_segments: Vec<usize>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    /// Weighted R^2 of the surrogate on the perturbations it was fit on
    pub score: f64,
}

/// The perturbation that moved the classifier furthest towards the target
#[derive(Debug, Clone)]
pub struct BestPerturbation {
    pub index: usize,
    pub score: f32,
    pub volume: Volume,
}

/// Knobs of the explanation loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimeSettings {
    pub slic: SlicParams,
    /// Number of random perturbations scored per sample
    pub n_pert: usize,
    /// Superpixels kept per layer in the final mask
    pub num_top_features: usize,
    pub kernel_width: f64,
    pub show_progress: bool,
}

impl Default for LimeSettings {
    fn default() -> Self {
        Self {
            slic: SlicParams {
                compactness: 0.5,
                max_iter: 100,
                ..SlicParams::default()
            },
            n_pert: 10,
            num_top_features: 1,
            kernel_width: DEFAULT_KERNEL_WIDTH,
            show_progress: false,
        }
    }
}

/// Everything produced while explaining one sample
#[derive(Debug, Clone)]
pub struct SampleExplanation {
    pub superpixels: SuperpixelMap,
    pub segment_counts: Vec<usize>,
    /// Classifier score of every random perturbation, in sampling order
    pub predictions: Vec<f32>,
    /// `None` when no perturbation beat the decision threshold
    pub best_perturbation: Option<BestPerturbation>,
    pub surrogates: Vec<LayerSurrogate>,
    /// Original volume masked down to the top superpixels
    pub final_volume: Volume,
    pub mask_volume: Array3<f32>,
    /// Classifier score of `final_volume`
    pub final_score: f32,
}

/// LIME explainer bound to one volume
#[derive(Debug, Clone)]
pub struct Lime {
    volume: Volume,
}

impl Lime {
    pub fn new(volume: Volume) -> Self {
        Self { volume }
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Segment the reference layer and share the labelling across all layers
    pub fn generate_segmentation(&self, params: &SlicParams) -> Result<SuperpixelMap> {
        let labels = slic(self.volume.layer(REFERENCE_LAYER), params)?;
        Ok(SuperpixelMap::replicate(&labels))
    }

    /// Draw one random perturbation.
    ///
    /// Layer 0 gets a Binomial(1, 0.5) vector; other layers reuse it,
    /// truncated or zero-padded to their own segment count.
    pub fn generate_perturbations<R: Rng + ?Sized>(
        &self,
        superpixels: &SuperpixelMap,
        rng: &mut R,
    ) -> Result<Perturbation> {
        self.check_superpixels(superpixels)?;

        let counts = superpixels.segment_counts();
        let first_count = counts[0];
        let coin = Binomial::new(1, 0.5).map_err(|e| LimeError::InvalidParameter(e.to_string()))?;
        let first: Array1<u8> = (0..first_count).map(|_| coin.sample(rng) as u8).collect();

        let layers = counts
            .iter()
            .map(|&n| {
                if n <= first_count {
                    first.slice(ndarray::s![..n]).to_owned()
                } else {
                    let mut padded = Array1::zeros(n);
                    padded.slice_mut(ndarray::s![..first_count]).assign(&first);
                    padded
                }
            })
            .collect();

        Perturbation::new(layers)
    }

    /// Zero every pixel whose segment is inactive.
    ///
    /// Entry `j` of a layer vector controls the `j`-th smallest segment label
    /// of that layer. Returns the perturbed volume and its `{0, 1}` mask.
    pub fn apply_perturbations(
        &self,
        perturbation: &Perturbation,
        superpixels: &SuperpixelMap,
    ) -> Result<(Volume, Array3<f32>)> {
        self.check_superpixels(superpixels)?;

        let mut mask = Array3::<f32>::zeros(self.volume.dims());
        for i in 0..LAYERS {
            let labels = superpixels.unique_labels(i);
            let switches = perturbation.layer(i);
            if switches.len() != labels.len() {
                return Err(LimeError::shape_mismatch(&[labels.len()], &[switches.len()]));
            }

            let mut layer_mask = mask.index_axis_mut(Axis(2), i);
            Zip::from(&mut layer_mask)
                .and(&superpixels.layer(i))
                .for_each(|m, label| {
                    if let Ok(pos) = labels.binary_search(label) {
                        if switches[pos] == 1 {
                            *m = 1.0;
                        }
                    }
                });
        }

        let perturbed = &self.volume.as_array() * &mask;
        Ok((Volume::new(perturbed)?, mask))
    }

    /// Fit one weighted surrogate per layer and rank its segments
    pub fn extract_best_superpixels(
        &self,
        perts: &[Perturbation],
        predictions: &[f32],
        num_top_features: usize,
        kernel_width: f64,
    ) -> Result<Vec<LayerSurrogate>> {
        if perts.is_empty() {
            return Err(LimeError::InvalidInput("no perturbations to fit".to_string()));
        }
        if perts.len() != predictions.len() {
            return Err(LimeError::shape_mismatch(&[perts.len()], &[predictions.len()]));
        }
        if !(kernel_width > 0.0) {
            return Err(LimeError::InvalidParameter(format!(
                "kernel width must be positive, got {}",
                kernel_width
            )));
        }

        let y: Array1<f64> = predictions.iter().map(|&p| p as f64).collect();
        let mut surrogates = Vec::with_capacity(LAYERS);

        for i in 0..LAYERS {
            let n_segments = perts[0].layer(i).len();
            let mut x = Array2::<f64>::zeros((perts.len(), n_segments));
            for (row, pert) in x.axis_iter_mut(Axis(0)).zip(perts) {
                let layer = pert.layer(i);
                if layer.len() != n_segments {
                    return Err(LimeError::shape_mismatch(&[n_segments], &[layer.len()]));
                }
                Zip::from(row).and(layer).for_each(|xv, &p| *xv = p as f64);
            }

            let distances = distances_to_baseline(x.view());
            let weights = kernel_weights(distances.view(), kernel_width);

            let mut model = WeightedLinearRegression::new();
            model.fit(x.view(), y.view(), weights.view())?;
            let score = model.score(x.view(), y.view(), weights.view())?;

            surrogates.push(LayerSurrogate {
                top_segments: top_features(model.coefficients(), num_top_features),
                coefficients: model.coefficients().to_vec(),
                intercept: model.intercept(),
                score,
            });
        }

        Ok(surrogates)
    }

    /// Perturbation that activates only the given segments of each layer
    pub fn mask_from_superpixels(surrogates: &[LayerSurrogate], segment_counts: &[usize]) -> Result<Perturbation> {
        if surrogates.len() != segment_counts.len() {
            return Err(LimeError::shape_mismatch(&[segment_counts.len()], &[surrogates.len()]));
        }
        let layers = surrogates
            .iter()
            .zip(segment_counts)
            .map(|(surrogate, &n)| {
                let mut layer = Array1::<u8>::zeros(n);
                for &segment in &surrogate.top_segments {
                    if segment < n {
                        layer[segment] = 1;
                    }
                }
                layer
            })
            .collect();
        Perturbation::new(layers)
    }

    /// Run the full explanation for this volume against `classifier`.
    ///
    /// `label` decides which direction counts as "best": higher scores for
    /// positives, lower scores for negatives, starting from the threshold.
    pub fn explain<C, R>(
        &self,
        classifier: &C,
        label: Label,
        settings: &LimeSettings,
        rng: &mut R,
    ) -> Result<SampleExplanation>
    where
        C: VolumeClassifier + ?Sized,
        R: Rng + ?Sized,
    {
        if settings.n_pert == 0 {
            return Err(LimeError::InvalidParameter("n_pert must be at least 1".to_string()));
        }

        let superpixels = self.generate_segmentation(&settings.slic)?;
        let segment_counts = superpixels.segment_counts();
        tracing::debug!("Segmented volume into {:?} superpixels per layer", segment_counts);

        let progress = if settings.show_progress {
            let pb = ProgressBar::new(settings.n_pert as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} Perturbing: [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut perts = Vec::with_capacity(settings.n_pert);
        let mut predictions = Vec::with_capacity(settings.n_pert);
        let mut best_score = DECISION_THRESHOLD;
        let mut best_perturbation = None;

        for i in 0..settings.n_pert {
            let perturbation = self.generate_perturbations(&superpixels, rng)?;
            let (perturbed_volume, _) = self.apply_perturbations(&perturbation, &superpixels)?;
            let score = classifier.predict(&perturbed_volume)?;
            tracing::debug!("Perturbation {} scored {:.4}", i, score);

            let improved = match label {
                Label::Positive => score > best_score,
                Label::Negative => score < best_score,
            };
            if improved {
                best_score = score;
                best_perturbation = Some(BestPerturbation {
                    index: i,
                    score,
                    volume: perturbed_volume,
                });
            }

            perts.push(perturbation);
            predictions.push(score);
            progress.inc(1);
        }
        progress.finish_and_clear();

        let surrogates =
            self.extract_best_superpixels(&perts, &predictions, settings.num_top_features, settings.kernel_width)?;
        let final_mask = Self::mask_from_superpixels(&surrogates, &segment_counts)?;
        let (final_volume, mask_volume) = self.apply_perturbations(&final_mask, &superpixels)?;
        let final_score = classifier.predict(&final_volume)?;

        Ok(SampleExplanation {
            superpixels,
            segment_counts,
            predictions,
            best_perturbation,
            surrogates,
            final_volume,
            mask_volume,
            final_score,
        })
    }

    fn check_superpixels(&self, superpixels: &SuperpixelMap) -> Result<()> {
        let expected = self.volume.dims();
        let actual = superpixels.dims();
        if expected != actual {
            return Err(LimeError::shape_mismatch(
                &[expected.0, expected.1, expected.2],
                &[actual.0, actual.1, actual.2],
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::LogisticProbe;
    use ndarray::{array, Array3};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quadrant_map(h: usize, w: usize) -> SuperpixelMap {
        let layer = Array2::from_shape_fn((h, w), |(y, x)| 1 + (y >= h / 2) as u32 * 2 + (x >= w / 2) as u32);
        SuperpixelMap::replicate(&layer)
    }

    fn ramp_volume(h: usize, w: usize) -> Volume {
        Volume::new(Array3::from_shape_fn((h, w, 3), |(y, x, l)| {
            (y * w + x) as f32 / (h * w) as f32 + l as f32 * 0.01
        }))
        .unwrap()
    }

    #[test]
    fn test_generate_perturbations_replicates_first_layer() {
        let lime = Lime::new(ramp_volume(8, 8));
        let map = quadrant_map(8, 8);
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let pert = lime.generate_perturbations(&map, &mut rng).unwrap();
        assert_eq!(pert.layer(0).len(), 4);
        assert_eq!(pert.layer(0), pert.layer(1));
        assert_eq!(pert.layer(0), pert.layer(2));
    }

    #[test]
    fn test_generate_perturbations_truncates_and_pads() {
        let lime = Lime::new(ramp_volume(4, 4));
        let mut labels = Array3::<u32>::ones((4, 4, 3));
        // layer 0: 4 segments, layer 1: 2 segments, layer 2: 8 segments
        for ((y, x, l), v) in labels.indexed_iter_mut() {
            *v = match l {
                0 => 1 + (y / 2 * 2 + x / 2) as u32,
                1 => 1 + (y / 2) as u32,
                _ => 1 + (y * 2 + x / 2) as u32,
            };
        }
        let map = SuperpixelMap::from_labels(labels).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        let pert = lime.generate_perturbations(&map, &mut rng).unwrap();
        assert_eq!(pert.layer(1).len(), 2);
        assert_eq!(pert.layer(2).len(), 8);
        assert_eq!(pert.layer(1).as_slice().unwrap(), &pert.layer(0).as_slice().unwrap()[..2]);
        assert!(pert.layer(2).iter().skip(4).all(|&v| v == 0));
    }

    #[test]
    fn test_generate_perturbations_rejects_shape_mismatch() {
        let lime = Lime::new(ramp_volume(8, 8));
        let map = quadrant_map(6, 6);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(lime.generate_perturbations(&map, &mut rng).is_err());
    }

    #[test]
    fn test_apply_perturbations_masks_inactive_segments() {
        let volume = ramp_volume(8, 8);
        let lime = Lime::new(volume.clone());
        let map = quadrant_map(8, 8);
        let switches = array![1u8, 0, 0, 1];
        let pert = Perturbation::new(vec![switches.clone(), switches.clone(), switches]).unwrap();

        let (perturbed, mask) = lime.apply_perturbations(&pert, &map).unwrap();

        // Top-left (label 1) and bottom-right (label 4) survive
        assert_eq!(mask[[0, 0, 0]], 1.0);
        assert_eq!(mask[[0, 7, 1]], 0.0);
        assert_eq!(mask[[7, 0, 2]], 0.0);
        assert_eq!(mask[[7, 7, 0]], 1.0);
        assert_eq!(perturbed.as_array()[[7, 7, 2]], volume.as_array()[[7, 7, 2]]);
        assert_eq!(perturbed.as_array()[[0, 7, 0]], 0.0);
    }

    #[test]
    fn test_apply_perturbations_rejects_wrong_length() {
        let lime = Lime::new(ramp_volume(8, 8));
        let map = quadrant_map(8, 8);
        let short = array![1u8, 0];
        let pert = Perturbation::new(vec![short.clone(), short.clone(), short]).unwrap();
        assert!(lime.apply_perturbations(&pert, &map).is_err());
    }

    #[test]
    fn test_extract_best_superpixels_finds_driving_segment() {
        let lime = Lime::new(ramp_volume(8, 8));
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let map = quadrant_map(8, 8);

        // Prediction depends only on segment 2
        let mut perts = Vec::new();
        let mut predictions = Vec::new();
        for _ in 0..40 {
            let pert = lime.generate_perturbations(&map, &mut rng).unwrap();
            predictions.push(0.2 + 0.6 * pert.layer(0)[2] as f32);
            perts.push(pert);
        }

        let surrogates = lime
            .extract_best_superpixels(&perts, &predictions, 1, DEFAULT_KERNEL_WIDTH)
            .unwrap();
        assert_eq!(surrogates.len(), 3);
        for surrogate in &surrogates {
            assert_eq!(surrogate.top_segments, vec![2]);
            assert!(surrogate.score > 0.99);
        }
    }

    #[test]
    fn test_extract_best_superpixels_validates_input() {
        let lime = Lime::new(ramp_volume(4, 4));
        assert!(lime.extract_best_superpixels(&[], &[], 1, 0.25).is_err());

        let ones = Array1::<u8>::ones(2);
        let pert = Perturbation::new(vec![ones.clone(), ones.clone(), ones]).unwrap();
        assert!(lime.extract_best_superpixels(&[pert.clone()], &[0.1, 0.2], 1, 0.25).is_err());
        assert!(lime.extract_best_superpixels(&[pert], &[0.1], 1, 0.0).is_err());
    }

    #[test]
    fn test_mask_from_superpixels() {
        let surrogate = |top: Vec<usize>| LayerSurrogate {
            top_segments: top,
            coefficients: vec![],
            intercept: 0.0,
            score: 0.0,
        };
        let mask =
            Lime::mask_from_superpixels(&[surrogate(vec![1]), surrogate(vec![0, 2]), surrogate(vec![9])], &[3, 3, 3])
                .unwrap();
        assert_eq!(mask.layer(0), &array![0u8, 1, 0]);
        assert_eq!(mask.layer(1), &array![1u8, 0, 1]);
        assert_eq!(mask.layer(2), &array![0u8, 0, 0]);
        assert_eq!(mask.active_counts(), vec![1, 2, 0]);
    }

    #[test]
    fn test_explain_end_to_end() {
        let probe = LogisticProbe::centre_detector(4);
        let mut data = Array3::<f32>::from_elem((32, 32, 3), 0.1);
        for y in 12..20 {
            for x in 12..20 {
                for l in 0..3 {
                    data[[y, x, l]] = 0.95;
                }
            }
        }
        let volume = Volume::new(data).unwrap();
        let lime = Lime::new(volume.clone());
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let settings = LimeSettings {
            n_pert: 12,
            ..LimeSettings::default()
        };

        let explanation = lime.explain(&probe, Label::Positive, &settings, &mut rng).unwrap();

        assert_eq!(explanation.predictions.len(), 12);
        assert_eq!(explanation.surrogates.len(), 3);
        assert_eq!(explanation.final_volume.dims(), volume.dims());
        assert!(explanation.mask_volume.iter().all(|&m| m == 0.0 || m == 1.0));
        if let Some(best) = &explanation.best_perturbation {
            assert!(best.score > DECISION_THRESHOLD);
            assert_eq!(explanation.predictions[best.index], best.score);
        }
    }

    /// Replays a fixed list of scores, one per call
    struct ScriptedClassifier {
        scores: Vec<f32>,
        calls: AtomicUsize,
    }

    impl ScriptedClassifier {
        fn new(scores: Vec<f32>) -> Self {
            Self {
                scores,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl VolumeClassifier for ScriptedClassifier {
        fn predict(&self, _volume: &Volume) -> Result<f32> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.scores[call % self.scores.len()])
        }

        fn name(&self) -> &str {
            "scripted"
        }

        fn description(&self) -> &str {
            "Fixed score sequence"
        }
    }

    fn explain_with_scores(scores: Vec<f32>, n_pert: usize, label: Label) -> SampleExplanation {
        let classifier = ScriptedClassifier::new(scores);
        let lime = Lime::new(ramp_volume(16, 16));
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let settings = LimeSettings {
            n_pert,
            ..LimeSettings::default()
        };
        lime.explain(&classifier, label, &settings, &mut rng).unwrap()
    }

    #[test]
    fn test_best_perturbation_positive_takes_highest_score() {
        let explanation = explain_with_scores(vec![0.6, 0.9, 0.4, 0.8, 0.2], 4, Label::Positive);

        assert_eq!(explanation.predictions, vec![0.6, 0.9, 0.4, 0.8]);
        let best = explanation.best_perturbation.unwrap();
        assert_eq!(best.index, 1);
        assert_eq!(best.score, 0.9);
        // The final masked volume is scored after the perturbations
        assert_eq!(explanation.final_score, 0.2);
    }

    #[test]
    fn test_best_perturbation_negative_takes_lowest_score() {
        let explanation = explain_with_scores(vec![0.45, 0.3, 0.1, 0.2, 0.7], 4, Label::Negative);

        let best = explanation.best_perturbation.unwrap();
        assert_eq!(best.index, 2);
        assert_eq!(best.score, 0.1);
    }

    #[test]
    fn test_best_perturbation_keeps_first_of_equal_scores() {
        let explanation = explain_with_scores(vec![0.7, 0.7, 0.6], 3, Label::Positive);

        let best = explanation.best_perturbation.unwrap();
        assert_eq!(best.index, 0);
    }

    #[test]
    fn test_best_perturbation_requires_beating_threshold() {
        let positive = explain_with_scores(vec![0.5, 0.2, 0.4], 3, Label::Positive);
        assert!(positive.best_perturbation.is_none());

        let negative = explain_with_scores(vec![0.5, 0.9, 0.6], 3, Label::Negative);
        assert!(negative.best_perturbation.is_none());
    }

    #[test]
    fn test_perturbation_deserialization_is_validated() {
        let ones = Array1::<u8>::ones(2);
        let pert = Perturbation::new(vec![ones.clone(), ones.clone(), ones]).unwrap();
        let json = serde_json::to_value(&pert).unwrap();
        let back: Perturbation = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back, pert);

        let mut two_layers = json.clone();
        two_layers["layers"].as_array_mut().unwrap().pop();
        assert!(serde_json::from_value::<Perturbation>(two_layers).is_err());

        let mut out_of_range = json;
        out_of_range["layers"][0]["data"][0] = serde_json::json!(2);
        assert!(serde_json::from_value::<Perturbation>(out_of_range).is_err());
    }

    #[test]
    fn test_explain_rejects_zero_perturbations() {
        let probe = LogisticProbe::centre_detector(4);
        let lime = Lime::new(ramp_volume(16, 16));
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let settings = LimeSettings {
            n_pert: 0,
            ..LimeSettings::default()
        };
        assert!(lime.explain(&probe, Label::Positive, &settings, &mut rng).is_err());
    }
}
