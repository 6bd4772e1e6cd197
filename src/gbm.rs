//! Gradient-boosted regression trees with logistic loss.
//!
//! Second-order boosting: each tree is grown on the gradient `p - y` and
//! hessian `p(1 - p)` of the current margins, leaf weights are
//! `-G / (H + lambda)`. No row or column subsampling, so a fit is a pure
//! function of its inputs.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Unavailable;
use crate::features::{FeatureVector, N_FEATURES};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GbmParams {
    pub max_depth: usize,
    pub learning_rate: f64,
    pub n_estimators: usize,
    /// Minimum hessian sum on each side of a split.
    pub min_child_weight: f64,
    /// L2 penalty on leaf weights.
    pub lambda: f64,
    /// Minimum loss reduction to keep a split.
    pub gamma: f64,
}

impl Default for GbmParams {
    fn default() -> Self {
        Self {
            max_depth: 4,
            learning_rate: 0.05,
            n_estimators: 100,
            min_child_weight: 1.0,
            lambda: 1.0,
            gamma: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf(f64),
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict(&self, x: &FeatureVector) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf(w) => return *w,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if x[*feature] < *threshold { *left } else { *right };
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    gain: f64,
    feature: usize,
    threshold: f64,
}

/// Binary classifier; `predict_proba` returns P(label = true).
#[derive(Debug, Clone, PartialEq)]
pub struct GbmClassifier {
    base_margin: f64,
    learning_rate: f64,
    trees: Vec<Tree>,
}

impl GbmClassifier {
    pub fn fit(x: &[FeatureVector], y: &[bool], params: &GbmParams) -> Result<Self, Unavailable> {
        if x.is_empty() || x.len() != y.len() {
            return Err(Unavailable::InsufficientData {
                needed: 1,
                found: x.len().min(y.len()),
            });
        }
        if x.iter().flatten().any(|v| !v.is_finite()) {
            return Err(Unavailable::NumericalFailure("non-finite feature value".to_string()));
        }

        let n = x.len();
        let positives = y.iter().filter(|v| **v).count() as f64;
        let base_rate = ((positives + 0.5) / (n as f64 + 1.0)).clamp(1e-6, 1.0 - 1e-6);
        let base_margin = (base_rate / (1.0 - base_rate)).ln();

        let targets: Vec<f64> = y.iter().map(|v| if *v { 1.0 } else { 0.0 }).collect();
        let mut margins = vec![base_margin; n];
        let mut grad = vec![0.0; n];
        let mut hess = vec![0.0; n];
        let mut trees = Vec::with_capacity(params.n_estimators);

        for _ in 0..params.n_estimators {
            for i in 0..n {
                let p = sigmoid(margins[i]);
                grad[i] = p - targets[i];
                hess[i] = (p * (1.0 - p)).max(1e-12);
            }
            let mut builder = TreeBuilder {
                x,
                grad: &grad,
                hess: &hess,
                params,
                nodes: Vec::new(),
            };
            let rows: Vec<usize> = (0..n).collect();
            builder.grow(rows, 0);
            let tree = Tree {
                nodes: builder.nodes,
            };
            for (i, m) in margins.iter_mut().enumerate() {
                *m += params.learning_rate * tree.predict(&x[i]);
            }
            trees.push(tree);
        }

        if margins.iter().any(|m| !m.is_finite()) {
            return Err(Unavailable::NumericalFailure("boosting diverged".to_string()));
        }
        Ok(Self {
            base_margin,
            learning_rate: params.learning_rate,
            trees,
        })
    }

    pub fn predict_margin(&self, x: &FeatureVector) -> f64 {
        self.base_margin
            + self.learning_rate * self.trees.iter().map(|t| t.predict(x)).sum::<f64>()
    }

    pub fn predict_proba(&self, x: &FeatureVector) -> f64 {
        sigmoid(self.predict_margin(x))
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

struct TreeBuilder<'a> {
    x: &'a [FeatureVector],
    grad: &'a [f64],
    hess: &'a [f64],
    params: &'a GbmParams,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    /// Appends the subtree for `rows` and returns its root index.
    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let g: f64 = rows.iter().map(|i| self.grad[*i]).sum();
        let h: f64 = rows.iter().map(|i| self.hess[*i]).sum();
        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf(-g / (h + self.params.lambda)));

        if depth >= self.params.max_depth || rows.len() < 2 {
            return idx;
        }
        let Some(split) = self.best_split(&rows, g, h) else {
            return idx;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|i| self.x[*i][split.feature] < split.threshold);
        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[idx] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        idx
    }

    fn best_split(&self, rows: &[usize], g_total: f64, h_total: f64) -> Option<SplitCandidate> {
        let lambda = self.params.lambda;
        let parent_score = g_total * g_total / (h_total + lambda);

        (0..N_FEATURES)
            .into_par_iter()
            .filter_map(|feature| {
                let mut order: Vec<usize> = rows.to_vec();
                order.sort_by(|a, b| self.x[*a][feature].total_cmp(&self.x[*b][feature]));

                let mut best: Option<SplitCandidate> = None;
                let mut gl = 0.0;
                let mut hl = 0.0;
                for w in order.windows(2) {
                    let (i, next) = (w[0], w[1]);
                    gl += self.grad[i];
                    hl += self.hess[i];
                    let v = self.x[i][feature];
                    let v_next = self.x[next][feature];
                    if v_next <= v {
                        continue;
                    }
                    let hr = h_total - hl;
                    if hl < self.params.min_child_weight || hr < self.params.min_child_weight {
                        continue;
                    }
                    let gr = g_total - gl;
                    let gain = 0.5
                        * (gl * gl / (hl + lambda) + gr * gr / (hr + lambda) - parent_score)
                        - self.params.gamma;
                    if gain > 1e-12 && best.is_none_or(|b| gain > b.gain) {
                        best = Some(SplitCandidate {
                            gain,
                            feature,
                            threshold: 0.5 * (v + v_next),
                        });
                    }
                }
                best
            })
            // Ties go to the lower feature index so results do not depend on scheduling.
            .reduce_with(|a, b| {
                if b.gain > a.gain || (b.gain == a.gain && b.feature < a.feature) {
                    b
                } else {
                    a
                }
            })
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn threshold_data(n: usize, seed: u64) -> (Vec<FeatureVector>, Vec<bool>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        for _ in 0..n {
            let mut row = [0.0; N_FEATURES];
            for v in row.iter_mut().take(6) {
                *v = rng.gen_range(0.0..1.0);
            }
            y.push(row[2] > 0.5);
            x.push(row);
        }
        (x, y)
    }

    #[test]
    fn learns_a_single_threshold() {
        let (x, y) = threshold_data(400, 7);
        let model = GbmClassifier::fit(&x, &y, &GbmParams::default()).unwrap();
        assert_eq!(model.n_trees(), 100);

        let mut hi = [0.3; N_FEATURES];
        hi[2] = 0.9;
        let mut lo = [0.3; N_FEATURES];
        lo[2] = 0.1;
        assert!(model.predict_proba(&hi) > 0.75);
        assert!(model.predict_proba(&lo) < 0.25);
    }

    #[test]
    fn fit_is_deterministic() {
        let (x, y) = threshold_data(200, 3);
        let a = GbmClassifier::fit(&x, &y, &GbmParams::default()).unwrap();
        let b = GbmClassifier::fit(&x, &y, &GbmParams::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_empty_or_mismatched_input() {
        assert!(GbmClassifier::fit(&[], &[], &GbmParams::default()).is_err());
        let (x, _) = threshold_data(10, 1);
        assert!(GbmClassifier::fit(&x, &[true; 3], &GbmParams::default()).is_err());
    }

    #[test]
    fn constant_labels_stay_near_base_rate() {
        let (x, _) = threshold_data(50, 9);
        let y = vec![true; 50];
        let model = GbmClassifier::fit(&x, &y, &GbmParams::default()).unwrap();
        assert!(model.predict_proba(&x[0]) > 0.9);
    }
}
