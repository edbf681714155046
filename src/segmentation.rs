// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Superpixel segmentation
//!
//! Implements SLIC (Simple Linear Iterative Clustering) for single image
//! layers:
//! - Grey intensities are mapped to CIE-Lab lightness
//! - Cluster centres start on a regular grid and are moved off edges
//! - Local k-means in (lightness, y, x) space
//! - Small fragments are regrouped around the nearest centre, then segments
//!   are made connected with a size cap
//!
//! Reference: Achanta et al. (2012) "SLIC Superpixels Compared to
//! State-of-the-Art Superpixel Methods".

use crate::error::{LimeError, Result};
use crate::volume::LAYERS;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// Parameters for SLIC segmentation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlicParams {
    /// Approximate number of superpixels
    pub n_segments: usize,
    /// Balances lightness proximity against spatial proximity; higher values
    /// give more square segments
    pub compactness: f32,
    /// Maximum number of k-means iterations
    pub max_iter: usize,
    /// Label of the first segment
    pub start_label: u32,
    /// Merge fragments smaller than half the expected segment size
    pub enforce_connectivity: bool,
}

impl Default for SlicParams {
    fn default() -> Self {
        Self {
            n_segments: 25,
            compactness: 0.3,
            max_iter: 1000,
            start_label: 1,
            enforce_connectivity: true,
        }
    }
}

impl SlicParams {
    fn validate(&self) -> Result<()> {
        if self.n_segments == 0 {
            return Err(LimeError::InvalidParameter("n_segments must be positive".to_string()));
        }
        if !(self.compactness > 0.0) {
            return Err(LimeError::InvalidParameter(format!(
                "compactness must be positive, got {}",
                self.compactness
            )));
        }
        Ok(())
    }
}

/// Per-layer superpixel labels for a whole volume
#[derive(Debug, Clone, PartialEq)]
pub struct SuperpixelMap {
    labels: Array3<u32>,
}

impl SuperpixelMap {
    /// Replicate a single layer labelling across all volume layers
    pub fn replicate(layer: &Array2<u32>) -> Self {
        let views = vec![layer.view(); LAYERS];
        // Stacking equally shaped views cannot fail
        let labels = ndarray::stack(Axis(2), &views).unwrap_or_else(|_| Array3::zeros((0, 0, LAYERS)));
        Self { labels }
    }

    pub fn from_labels(labels: Array3<u32>) -> Result<Self> {
        let (h, w, l) = labels.dim();
        if l != LAYERS {
            return Err(LimeError::shape_mismatch(&[h, w, LAYERS], &[h, w, l]));
        }
        Ok(Self { labels })
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.labels.dim()
    }

    pub fn layer(&self, index: usize) -> ArrayView2<'_, u32> {
        self.labels.index_axis(Axis(2), index)
    }

    /// Sorted distinct labels of one layer
    pub fn unique_labels(&self, index: usize) -> Vec<u32> {
        let set: BTreeSet<u32> = self.layer(index).iter().copied().collect();
        set.into_iter().collect()
    }

    /// Number of distinct segments in each layer
    pub fn segment_counts(&self) -> Vec<usize> {
        (0..self.labels.len_of(Axis(2)))
            .map(|i| self.unique_labels(i).len())
            .collect()
    }
}

/// Segment one image layer with SLIC
pub fn slic(layer: ArrayView2<f32>, params: &SlicParams) -> Result<Array2<u32>> {
    params.validate()?;
    let (h, w) = layer.dim();
    if h == 0 || w == 0 {
        return Err(LimeError::InvalidInput("cannot segment an empty layer".to_string()));
    }

    let n_pixels = h * w;
    let n_segments = params.n_segments.min(n_pixels);
    let lightness = layer.mapv(|v| grey_to_lightness(v.clamp(0.0, 1.0)));
    let step = (n_pixels as f32 / n_segments as f32).sqrt().max(1.0);

    let mut centers = initial_centers(&lightness, step);
    let window = step.ceil() as isize;
    let spatial_norm = 1.0 / (step * step);
    let colour_norm = 1.0 / (params.compactness * params.compactness);

    let mut assignment = Array2::<usize>::from_elem((h, w), usize::MAX);
    let mut distance = Array2::<f32>::from_elem((h, w), f32::INFINITY);

    for iteration in 0..params.max_iter.max(1) {
        distance.fill(f32::INFINITY);
        let previous = assignment.clone();

        for (k, center) in centers.iter().enumerate() {
            let cy = center.y.round() as isize;
            let cx = center.x.round() as isize;
            let y0 = (cy - window).max(0) as usize;
            let y1 = ((cy + window) as usize).min(h - 1);
            let x0 = (cx - window).max(0) as usize;
            let x1 = ((cx + window) as usize).min(w - 1);

            for y in y0..=y1 {
                for x in x0..=x1 {
                    let dl = lightness[[y, x]] - center.l;
                    let dy = y as f32 - center.y;
                    let dx = x as f32 - center.x;
                    let d = dl * dl * colour_norm + (dy * dy + dx * dx) * spatial_norm;
                    if d < distance[[y, x]] {
                        distance[[y, x]] = d;
                        assignment[[y, x]] = k;
                    }
                }
            }
        }

        update_centers(&mut centers, &assignment, &lightness);

        let changed = assignment.iter().zip(previous.iter()).filter(|(a, b)| a != b).count();
        if changed == 0 {
            tracing::debug!("SLIC converged after {} iterations", iteration + 1);
            break;
        }
    }

    assign_orphans(&mut assignment, &centers);

    let labels = if params.enforce_connectivity {
        let segment_size = n_pixels as f32 / n_segments as f32;
        let min_size = ((0.5 * segment_size) as usize).max(1);
        let max_size = ((3.0 * segment_size) as usize).max(min_size + 1);
        absorb_fragments(&mut assignment, &centers, min_size);
        enforce_connectivity(&assignment, min_size, max_size)
    } else {
        relabel_sequential(&assignment)
    };

    Ok(labels.mapv(|l| l + params.start_label))
}

#[derive(Debug, Clone, Copy)]
struct Center {
    l: f32,
    y: f32,
    x: f32,
}

/// Lightness of a grey sRGB value in `[0, 1]` (a and b are zero for grey)
fn grey_to_lightness(value: f32) -> f32 {
    let linear = if value <= 0.04045 {
        value / 12.92
    } else {
        ((value + 0.055) / 1.055).powf(2.4)
    };
    let f = if linear > 0.008856 {
        linear.cbrt()
    } else {
        7.787 * linear + 16.0 / 116.0
    };
    116.0 * f - 16.0
}

fn initial_centers(lightness: &Array2<f32>, step: f32) -> Vec<Center> {
    let (h, w) = lightness.dim();
    let ny = ((h as f32 / step).round() as usize).max(1);
    let nx = ((w as f32 / step).round() as usize).max(1);
    let mut centers = Vec::with_capacity(ny * nx);

    for i in 0..ny {
        for j in 0..nx {
            let y = (((i as f32 + 0.5) * h as f32 / ny as f32) as usize).min(h - 1);
            let x = (((j as f32 + 0.5) * w as f32 / nx as f32) as usize).min(w - 1);
            let (y, x) = lowest_gradient(lightness, y, x);
            centers.push(Center {
                l: lightness[[y, x]],
                y: y as f32,
                x: x as f32,
            });
        }
    }

    centers
}

/// Move a seed to the lowest-gradient pixel of its 3x3 neighbourhood
fn lowest_gradient(lightness: &Array2<f32>, y: usize, x: usize) -> (usize, usize) {
    let (h, w) = lightness.dim();
    let gradient = |yy: usize, xx: usize| -> f32 {
        let up = lightness[[yy.saturating_sub(1), xx]];
        let down = lightness[[(yy + 1).min(h - 1), xx]];
        let left = lightness[[yy, xx.saturating_sub(1)]];
        let right = lightness[[yy, (xx + 1).min(w - 1)]];
        (down - up).powi(2) + (right - left).powi(2)
    };

    let mut best = (y, x);
    let mut best_gradient = gradient(y, x);
    for yy in y.saturating_sub(1)..=(y + 1).min(h - 1) {
        for xx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
            let g = gradient(yy, xx);
            if g < best_gradient {
                best_gradient = g;
                best = (yy, xx);
            }
        }
    }
    best
}

fn update_centers(centers: &mut [Center], assignment: &Array2<usize>, lightness: &Array2<f32>) {
    let mut sums = vec![(0.0f64, 0.0f64, 0.0f64, 0usize); centers.len()];
    for ((y, x), &k) in assignment.indexed_iter() {
        if k == usize::MAX {
            continue;
        }
        let entry = &mut sums[k];
        entry.0 += lightness[[y, x]] as f64;
        entry.1 += y as f64;
        entry.2 += x as f64;
        entry.3 += 1;
    }

    for (center, (l, y, x, n)) in centers.iter_mut().zip(sums) {
        // Empty clusters keep their previous position
        if n > 0 {
            let n = n as f64;
            center.l = (l / n) as f32;
            center.y = (y / n) as f32;
            center.x = (x / n) as f32;
        }
    }
}

/// Pixels outside every search window go to the spatially nearest centre
fn assign_orphans(assignment: &mut Array2<usize>, centers: &[Center]) {
    for ((y, x), k) in assignment.indexed_iter_mut() {
        if *k != usize::MAX {
            continue;
        }
        *k = nearest_center(y, x, centers);
    }
}

fn nearest_center(y: usize, x: usize, centers: &[Center]) -> usize {
    let mut best = 0;
    let mut best_d = f32::INFINITY;
    for (i, c) in centers.iter().enumerate() {
        let d = (y as f32 - c.y).powi(2) + (x as f32 - c.x).powi(2);
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

const NEIGHBOURS: [(isize, isize); 4] = [(-1, 0), (0, -1), (1, 0), (0, 1)];

fn neighbours(y: usize, x: usize, h: usize, w: usize) -> impl Iterator<Item = (usize, usize)> {
    NEIGHBOURS.iter().filter_map(move |&(dy, dx)| {
        let ny = y as isize + dy;
        let nx = x as isize + dx;
        if ny >= 0 && nx >= 0 && (ny as usize) < h && (nx as usize) < w {
            Some((ny as usize, nx as usize))
        } else {
            None
        }
    })
}

/// Hand the pixels of clusters' fragments smaller than `min_size` to the
/// spatially nearest centre.
///
/// Noise splits a lightness-driven clustering into salt-and-pepper fragments.
/// Regrouping them around the centres keeps segments compact before the
/// connectivity pass, instead of chaining fragments across the layer.
fn absorb_fragments(assignment: &mut Array2<usize>, centers: &[Center], min_size: usize) {
    let (h, w) = assignment.dim();
    let mut visited = Array2::from_elem((h, w), false);
    let mut queue = VecDeque::new();
    let mut component = Vec::new();
    let mut fragments = Vec::new();

    for y in 0..h {
        for x in 0..w {
            if visited[[y, x]] {
                continue;
            }

            let cluster = assignment[[y, x]];
            component.clear();
            visited[[y, x]] = true;
            queue.push_back((y, x));

            while let Some((cy, cx)) = queue.pop_front() {
                component.push((cy, cx));
                for (ny, nx) in neighbours(cy, cx, h, w) {
                    if !visited[[ny, nx]] && assignment[[ny, nx]] == cluster {
                        visited[[ny, nx]] = true;
                        queue.push_back((ny, nx));
                    }
                }
            }

            if component.len() < min_size {
                fragments.extend_from_slice(&component);
            }
        }
    }

    tracing::trace!("Reassigning {} fragment pixels", fragments.len());
    for (y, x) in fragments {
        assignment[[y, x]] = nearest_center(y, x, centers);
    }
}

/// Relabel 4-connected components in raster order.
///
/// A component grows to at most `max_size` pixels; the rest of its cluster is
/// picked up as further components. Components smaller than `min_size` join an
/// already labelled neighbour.
fn enforce_connectivity(assignment: &Array2<usize>, min_size: usize, max_size: usize) -> Array2<u32> {
    let (h, w) = assignment.dim();
    let mut labels = Array2::<u32>::from_elem((h, w), u32::MAX);
    let mut next_label = 0u32;
    let mut queue = VecDeque::new();
    let mut component = Vec::new();

    for y in 0..h {
        for x in 0..w {
            if labels[[y, x]] != u32::MAX {
                continue;
            }

            let cluster = assignment[[y, x]];
            component.clear();
            queue.clear();
            queue.push_back((y, x));
            labels[[y, x]] = next_label;

            while let Some((cy, cx)) = queue.pop_front() {
                component.push((cy, cx));
                for (ny, nx) in neighbours(cy, cx, h, w) {
                    if component.len() + queue.len() >= max_size {
                        break;
                    }
                    if labels[[ny, nx]] == u32::MAX && assignment[[ny, nx]] == cluster {
                        labels[[ny, nx]] = next_label;
                        queue.push_back((ny, nx));
                    }
                }
            }

            let adjacent = if component.len() < min_size {
                component.iter().find_map(|&(cy, cx)| {
                    neighbours(cy, cx, h, w)
                        .map(|(ny, nx)| labels[[ny, nx]])
                        .find(|&l| l != u32::MAX && l != next_label)
                })
            } else {
                None
            };

            match adjacent {
                Some(target) => {
                    for &(cy, cx) in &component {
                        labels[[cy, cx]] = target;
                    }
                }
                None => next_label += 1,
            }
        }
    }

    labels
}

/// Renumber clusters to `0..n` in order of first appearance
fn relabel_sequential(assignment: &Array2<usize>) -> Array2<u32> {
    let mut mapping = std::collections::HashMap::new();
    assignment.mapv(|k| {
        let next = mapping.len() as u32;
        *mapping.entry(k).or_insert(next)
    })
}
