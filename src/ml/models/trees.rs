use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use super::ModelError;

/// Gradient boosting hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GbmParams {
    /// Number of boosting rounds (trees)
    pub n_estimators: usize,
    /// Maximum depth of each tree
    pub max_depth: usize,
    /// Shrinkage applied to every tree's output
    pub learning_rate: f64,
    /// Minimum samples in a leaf node
    pub min_samples_leaf: usize,
    /// L2 penalty on leaf values
    pub l2_lambda: f64,
}

impl Default for GbmParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 3,
            learning_rate: 0.1,
            min_samples_leaf: 5,
            l2_lambda: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
enum TreeNode {
    Leaf(f64),
    Split {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    fn predict(&self, row: ArrayView1<f64>) -> f64 {
        match self {
            TreeNode::Leaf(value) => *value,
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if row[*feature] <= *threshold {
                    left.predict(row)
                } else {
                    right.predict(row)
                }
            }
        }
    }
}

/// Gradient-boosted regression trees on the logistic loss (Newton steps per leaf)
#[derive(Debug, Clone)]
pub struct GbmClassifier {
    params: GbmParams,
    base_score: f64,
    trees: Vec<TreeNode>,
    n_features: Option<usize>,
}

impl GbmClassifier {
    pub fn with_params(params: GbmParams) -> Self {
        Self {
            params,
            base_score: 0.0,
            trees: Vec::new(),
            n_features: None,
        }
    }

    pub fn params(&self) -> &GbmParams {
        &self.params
    }

    pub fn is_trained(&self) -> bool {
        self.n_features.is_some()
    }

    pub fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<(), ModelError> {
        let n = x.nrows();
        if n == 0 || n != y.len() {
            return Err(ModelError::InvalidData(format!(
                "{} rows vs {} labels",
                n,
                y.len()
            )));
        }

        let base_rate = (y.sum() / n as f64).clamp(1e-3, 1.0 - 1e-3);
        self.base_score = (base_rate / (1.0 - base_rate)).ln();
        self.trees.clear();

        let mut scores = Array1::from_elem(n, self.base_score);
        let all: Vec<usize> = (0..n).collect();

        for _ in 0..self.params.n_estimators {
            let probs = scores.mapv(sigmoid);
            let grad = &probs - y;
            let hess = probs.mapv(|p| (p * (1.0 - p)).max(1e-12));

            let tree = self.build_node(x, &grad, &hess, &all, 0);
            for i in 0..n {
                scores[i] += self.params.learning_rate * tree.predict(x.row(i));
            }
            self.trees.push(tree);
        }

        self.n_features = Some(x.ncols());
        Ok(())
    }

    fn leaf_value(&self, g: f64, h: f64) -> f64 {
        -g / (h + self.params.l2_lambda)
    }

    fn build_node(
        &self,
        x: &Array2<f64>,
        grad: &Array1<f64>,
        hess: &Array1<f64>,
        indices: &[usize],
        depth: usize,
    ) -> TreeNode {
        let g: f64 = indices.iter().map(|&i| grad[i]).sum();
        let h: f64 = indices.iter().map(|&i| hess[i]).sum();
        let min_leaf = self.params.min_samples_leaf.max(1);

        if depth >= self.params.max_depth || indices.len() < 2 * min_leaf {
            return TreeNode::Leaf(self.leaf_value(g, h));
        }

        let lambda = self.params.l2_lambda;
        let parent_score = g * g / (h + lambda);
        let mut best: Option<(f64, usize, f64)> = None;

        for feature in 0..x.ncols() {
            let mut order = indices.to_vec();
            order.sort_by(|&a, &b| x[[a, feature]].total_cmp(&x[[b, feature]]));

            let (mut g_left, mut h_left) = (0.0, 0.0);
            for k in 0..order.len() - 1 {
                g_left += grad[order[k]];
                h_left += hess[order[k]];

                let left_count = k + 1;
                if left_count < min_leaf || order.len() - left_count < min_leaf {
                    continue;
                }
                let here = x[[order[k], feature]];
                let next = x[[order[k + 1], feature]];
                if next <= here {
                    continue;
                }

                let g_right = g - g_left;
                let h_right = h - h_left;
                let gain = g_left * g_left / (h_left + lambda) + g_right * g_right / (h_right + lambda)
                    - parent_score;
                if gain > 1e-12 && best.map_or(true, |(b, _, _)| gain > b) {
                    best = Some((gain, feature, 0.5 * (here + next)));
                }
            }
        }

        match best {
            Some((_, feature, threshold)) => {
                let (left, right): (Vec<usize>, Vec<usize>) =
                    indices.iter().partition(|&&i| x[[i, feature]] <= threshold);
                TreeNode::Split {
                    feature,
                    threshold,
                    left: Box::new(self.build_node(x, grad, hess, &left, depth + 1)),
                    right: Box::new(self.build_node(x, grad, hess, &right, depth + 1)),
                }
            }
            None => TreeNode::Leaf(self.leaf_value(g, h)),
        }
    }

    /// P(up) for one feature row
    pub fn predict_proba(&self, row: ArrayView1<f64>) -> Result<f64, ModelError> {
        let n_features = self.n_features.ok_or(ModelError::NotTrained)?;
        if row.len() != n_features {
            return Err(ModelError::InvalidData(format!(
                "row has {} features, model expects {}",
                row.len(),
                n_features
            )));
        }
        let score = self.base_score
            + self.params.learning_rate * self.trees.iter().map(|t| t.predict(row)).sum::<f64>();
        Ok(sigmoid(score))
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learns_threshold_rule() {
        let n = 200;
        let x = Array2::from_shape_fn((n, 2), |(i, j)| {
            if j == 0 {
                i as f64 / n as f64
            } else {
                ((i * 13) % 7) as f64
            }
        });
        let y = Array1::from_shape_fn(n, |i| if i >= n / 2 { 1.0 } else { 0.0 });

        let mut model = GbmClassifier::with_params(GbmParams::default());
        model.fit(&x, &y).unwrap();
        assert_eq!(model.trees.len(), 100);

        assert!(model.predict_proba(x.row(10)).unwrap() < 0.2);
        assert!(model.predict_proba(x.row(190)).unwrap() > 0.8);
    }

    #[test]
    fn test_constant_features_predict_base_rate() {
        let x = Array2::from_elem((40, 3), 1.5);
        let y = Array1::from_shape_fn(40, |i| if i % 4 == 0 { 1.0 } else { 0.0 });

        let mut model = GbmClassifier::with_params(GbmParams::default());
        model.fit(&x, &y).unwrap();
        let p = model.predict_proba(x.row(0)).unwrap();
        assert!((p - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_untrained_model_errors() {
        let model = GbmClassifier::with_params(GbmParams::default());
        let row = Array1::zeros(2);
        assert!(matches!(model.predict_proba(row.view()), Err(ModelError::NotTrained)));
    }
}
