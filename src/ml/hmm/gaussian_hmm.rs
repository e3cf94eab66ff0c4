use ndarray::{Array1, Array2, Axis};
use std::f64::consts::PI;
use std::time::Instant;
use thiserror::Error;

/// Number of hidden volatility states
pub const N_STATES: usize = 3;

/// Probability floor for start and transition entries so no state becomes unreachable
const MIN_PROB: f64 = 1e-10;
/// States with less total occupancy than this keep their parameters in the M-step
const MIN_OCCUPANCY: f64 = 1e-8;
const KMEANS_PASSES: usize = 10;
/// Smallest per-column scale used for seeding and variance floors
const MIN_SCALE: f64 = 1e-4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HmmError {
    #[error("observation matrix has {got} columns, model expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("need at least {required} observations, got {got}")]
    TooFewObservations { required: usize, got: usize },

    #[error("log-likelihood became non-finite at iteration {iteration}")]
    NonFiniteLikelihood { iteration: usize },

    #[error("fit deadline passed after {iterations} iterations")]
    DeadlineExceeded { iterations: usize },

    #[error("no convergence after {iterations} iterations (last |dlogL| = {last_delta:.3e})")]
    NotConverged { iterations: usize, last_delta: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub max_iter: usize,
    pub tol: f64,
    pub deadline: Option<Instant>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iter: 200,
            tol: 1e-4,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitReport {
    pub log_likelihood: f64,
    pub iterations: usize,
}

/// 3-state hidden Markov model with diagonal Gaussian emissions.
///
/// After [`GaussianHmm::fit`] states are ordered by ascending mean of the first
/// observation column, so state 0 is the calmest regime.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianHmm {
    pub n_features: usize,
    /// Row-stochastic transition matrix (3 x 3)
    pub transition: Array2<f64>,
    pub start_prob: Array1<f64>,
    /// Per-state means (3 x n_features)
    pub means: Array2<f64>,
    /// Per-state diagonal variances (3 x n_features)
    pub variances: Array2<f64>,
    var_floor: Array1<f64>,
}

impl GaussianHmm {
    /// Fit with Baum-Welch EM. Returns a fresh model; nothing is retained between calls.
    pub fn fit(observations: &Array2<f64>, options: &FitOptions) -> Result<(Self, FitReport), HmmError> {
        let n_obs = observations.nrows();
        if n_obs < 2 * N_STATES {
            return Err(HmmError::TooFewObservations {
                required: 2 * N_STATES,
                got: n_obs,
            });
        }

        let mut model = Self::init_with_kmeans(observations);
        let mut prev_log_prob = f64::NEG_INFINITY;
        let mut last_delta = f64::INFINITY;

        for iteration in 0..options.max_iter {
            if let Some(deadline) = options.deadline {
                if Instant::now() >= deadline {
                    return Err(HmmError::DeadlineExceeded { iterations: iteration });
                }
            }

            let log_b = model.log_emissions(observations);
            let (log_alpha, log_prob) = model.forward_with(&log_b);
            if !log_prob.is_finite() {
                return Err(HmmError::NonFiniteLikelihood { iteration });
            }

            last_delta = (log_prob - prev_log_prob).abs();
            if last_delta < options.tol {
                model.canonicalize();
                return Ok((
                    model,
                    FitReport {
                        log_likelihood: log_prob,
                        iterations: iteration + 1,
                    },
                ));
            }
            prev_log_prob = log_prob;

            let log_beta = model.backward_with(&log_b);
            model.m_step(observations, &log_b, &log_alpha, &log_beta, log_prob);
        }

        Err(HmmError::NotConverged {
            iterations: options.max_iter,
            last_delta,
        })
    }

    /// Seed means from column quantiles, then refine with k-means
    fn init_with_kmeans(observations: &Array2<f64>) -> Self {
        let n_obs = observations.nrows();
        let n_features = observations.ncols();

        let mut means = Array2::zeros((N_STATES, n_features));
        let mut col_var = Array1::zeros(n_features);
        let mut col_scale = Array1::zeros(n_features);
        let mut var_floor = Array1::zeros(n_features);

        for j in 0..n_features {
            let column = observations.column(j);
            let mean = column.mean().unwrap_or(0.0);
            let var = column.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n_obs as f64;
            let std = var.sqrt();

            let mut sorted = column.to_vec();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let quantile = |p: f64| sorted[((n_obs - 1) as f64 * p).round() as usize];

            let scale = std.max(mean.abs()).max(MIN_SCALE);

            // Seeds are pushed apart upward so a degenerate column still yields three distinct states,
            // with the data sitting in the lowest one.
            let sep = 0.5 * scale;
            let low = quantile(1.0 / 6.0);
            let mid = quantile(0.5).max(low + sep);
            let high = quantile(5.0 / 6.0).max(mid + sep);
            means[[0, j]] = low;
            means[[1, j]] = mid;
            means[[2, j]] = high;

            col_var[j] = var;
            col_scale[j] = scale;
            var_floor[j] = (0.01 * scale).powi(2).max(1e-12);
        }

        let mut labels = vec![0usize; n_obs];
        for _ in 0..KMEANS_PASSES {
            for (t, label) in labels.iter_mut().enumerate() {
                let obs = observations.row(t);
                let mut best = (f64::INFINITY, 0);
                for state in 0..N_STATES {
                    let dist: f64 = (0..n_features)
                        .map(|j| ((obs[j] - means[[state, j]]) / col_scale[j]).powi(2))
                        .sum();
                    if dist < best.0 {
                        best = (dist, state);
                    }
                }
                *label = best.1;
            }

            // Empty clusters keep their previous mean
            for state in 0..N_STATES {
                let members: Vec<usize> = (0..n_obs).filter(|&t| labels[t] == state).collect();
                if members.is_empty() {
                    continue;
                }
                for j in 0..n_features {
                    means[[state, j]] =
                        members.iter().map(|&t| observations[[t, j]]).sum::<f64>() / members.len() as f64;
                }
            }
        }

        let mut variances = Array2::zeros((N_STATES, n_features));
        for state in 0..N_STATES {
            let members: Vec<usize> = (0..n_obs).filter(|&t| labels[t] == state).collect();
            for j in 0..n_features {
                let var = if members.is_empty() {
                    col_var[j]
                } else {
                    members
                        .iter()
                        .map(|&t| (observations[[t, j]] - means[[state, j]]).powi(2))
                        .sum::<f64>()
                        / members.len() as f64
                };
                variances[[state, j]] = var.max(var_floor[j]);
            }
        }

        // Slight self-persistence bias
        let mut transition = Array2::from_elem((N_STATES, N_STATES), 0.25);
        for i in 0..N_STATES {
            transition[[i, i]] = 0.5;
        }

        Self {
            n_features,
            transition,
            start_prob: Array1::from_elem(N_STATES, 1.0 / N_STATES as f64),
            means,
            variances,
            var_floor,
        }
    }

    fn log_emission(&self, obs: ndarray::ArrayView1<f64>, state: usize) -> f64 {
        (0..self.n_features)
            .map(|j| {
                let var = self.variances[[state, j]];
                let diff = obs[j] - self.means[[state, j]];
                -0.5 * ((2.0 * PI * var).ln() + diff * diff / var)
            })
            .sum()
    }

    /// Log emission densities for every (time, state)
    fn log_emissions(&self, observations: &Array2<f64>) -> Array2<f64> {
        let mut log_b = Array2::zeros((observations.nrows(), N_STATES));
        for (t, obs) in observations.axis_iter(Axis(0)).enumerate() {
            for state in 0..N_STATES {
                log_b[[t, state]] = self.log_emission(obs, state);
            }
        }
        log_b
    }

    fn forward_with(&self, log_b: &Array2<f64>) -> (Array2<f64>, f64) {
        let n_obs = log_b.nrows();
        let log_trans = self.transition.mapv(f64::ln);
        let mut log_alpha = Array2::from_elem((n_obs, N_STATES), f64::NEG_INFINITY);

        for state in 0..N_STATES {
            log_alpha[[0, state]] = self.start_prob[state].ln() + log_b[[0, state]];
        }

        for t in 1..n_obs {
            for j in 0..N_STATES {
                let terms: Vec<f64> = (0..N_STATES)
                    .map(|i| log_alpha[[t - 1, i]] + log_trans[[i, j]])
                    .collect();
                log_alpha[[t, j]] = log_sum_exp(&terms) + log_b[[t, j]];
            }
        }

        let log_prob = log_sum_exp(&log_alpha.row(n_obs - 1).to_vec());
        (log_alpha, log_prob)
    }

    fn backward_with(&self, log_b: &Array2<f64>) -> Array2<f64> {
        let n_obs = log_b.nrows();
        let log_trans = self.transition.mapv(f64::ln);
        let mut log_beta = Array2::zeros((n_obs, N_STATES));

        for t in (0..n_obs - 1).rev() {
            for i in 0..N_STATES {
                let terms: Vec<f64> = (0..N_STATES)
                    .map(|j| log_trans[[i, j]] + log_b[[t + 1, j]] + log_beta[[t + 1, j]])
                    .collect();
                log_beta[[t, i]] = log_sum_exp(&terms);
            }
        }

        log_beta
    }

    fn m_step(
        &mut self,
        observations: &Array2<f64>,
        log_b: &Array2<f64>,
        log_alpha: &Array2<f64>,
        log_beta: &Array2<f64>,
        log_prob: f64,
    ) {
        let n_obs = observations.nrows();
        let log_trans = self.transition.mapv(f64::ln);

        let mut gamma = Array2::zeros((n_obs, N_STATES));
        for t in 0..n_obs {
            let terms: Vec<f64> = (0..N_STATES).map(|s| log_alpha[[t, s]] + log_beta[[t, s]]).collect();
            let log_denom = log_sum_exp(&terms);
            for state in 0..N_STATES {
                gamma[[t, state]] = (terms[state] - log_denom).exp();
            }
        }

        let mut xi_sum = Array2::<f64>::zeros((N_STATES, N_STATES));
        for t in 0..n_obs - 1 {
            for i in 0..N_STATES {
                for j in 0..N_STATES {
                    let log_xi = log_alpha[[t, i]] + log_trans[[i, j]] + log_b[[t + 1, j]]
                        + log_beta[[t + 1, j]]
                        - log_prob;
                    xi_sum[[i, j]] += log_xi.exp();
                }
            }
        }

        self.start_prob = normalized_with_floor(gamma.row(0).to_owned());

        for i in 0..N_STATES {
            if xi_sum.row(i).sum() > MIN_OCCUPANCY {
                let row = normalized_with_floor(xi_sum.row(i).to_owned());
                self.transition.row_mut(i).assign(&row);
            }
        }

        for state in 0..N_STATES {
            let weights = gamma.column(state);
            let gamma_sum = weights.sum();
            if gamma_sum < MIN_OCCUPANCY {
                continue;
            }
            for j in 0..self.n_features {
                let column = observations.column(j);
                let mean = weights.dot(&column) / gamma_sum;
                let var = weights
                    .iter()
                    .zip(column.iter())
                    .map(|(w, x)| w * (x - mean).powi(2))
                    .sum::<f64>()
                    / gamma_sum;
                self.means[[state, j]] = mean;
                self.variances[[state, j]] = var.max(self.var_floor[j]);
            }
        }
    }

    /// Reorder states by ascending mean of the first observation column
    fn canonicalize(&mut self) {
        let mut order: Vec<usize> = (0..N_STATES).collect();
        order.sort_by(|&a, &b| self.means[[a, 0]].total_cmp(&self.means[[b, 0]]));

        self.start_prob = self.start_prob.select(Axis(0), &order);
        self.transition = self.transition.select(Axis(0), &order).select(Axis(1), &order);
        self.means = self.means.select(Axis(0), &order);
        self.variances = self.variances.select(Axis(0), &order);
    }

    /// Filtered state posterior at the final observation (forward pass only)
    pub fn filter(&self, observations: &Array2<f64>) -> Result<[f64; N_STATES], HmmError> {
        if observations.ncols() != self.n_features {
            return Err(HmmError::DimensionMismatch {
                expected: self.n_features,
                got: observations.ncols(),
            });
        }
        if observations.nrows() == 0 {
            return Err(HmmError::TooFewObservations { required: 1, got: 0 });
        }

        let log_b = self.log_emissions(observations);
        let (log_alpha, log_prob) = self.forward_with(&log_b);
        if !log_prob.is_finite() {
            return Err(HmmError::NonFiniteLikelihood { iteration: 0 });
        }

        let last = log_alpha.row(observations.nrows() - 1);
        let mut posterior = [0.0; N_STATES];
        for (state, p) in posterior.iter_mut().enumerate() {
            *p = (last[state] - log_prob).exp();
        }
        let total: f64 = posterior.iter().sum();
        for p in posterior.iter_mut() {
            *p /= total;
        }
        Ok(posterior)
    }
}

fn normalized_with_floor(mut probs: Array1<f64>) -> Array1<f64> {
    probs.mapv_inplace(|p| p.max(MIN_PROB));
    let total = probs.sum();
    probs / total
}

/// Log-sum-exp trick for numerical stability
fn log_sum_exp(log_values: &[f64]) -> f64 {
    let max_val = log_values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }

    let sum_exp: f64 = log_values.iter().map(|&v| (v - max_val).exp()).sum();
    max_val + sum_exp.ln()
}
