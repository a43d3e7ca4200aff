//! The bilinear latent-factor model and its variational state.
//!
//! Generative model, per observed entry:
//!
//! ```text
//! y[f, s] = sum_k w[f, k] * z[s, k] + eps[f],   eps[f] ~ N(0, 1 / tau[f])
//! ```
//!
//! Loadings carry zero-mean Gaussian priors with per-factor ARD precision
//! `alpha[k]`; scores carry the temporal GP prior of [`crate::temporal`].
//! The variational posterior is fully factorized Gaussian over loadings and
//! scores. Missing entries are excluded from the likelihood, never imputed.

use log::debug;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::SVD;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::adapter::PreparedData;
use crate::errors::FactorModelError;
use crate::inference::ConvergenceReport;
use crate::temporal::TemporalPrior;

pub(crate) const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Floor applied to every variance estimate before it is inverted. Keeps
/// degenerate residuals from turning into division-by-zero precisions.
pub(crate) const VARIANCE_FLOOR: f64 = 1e-10;

/// Ceiling on the ARD precision of a pruned-out factor.
pub(crate) const RELEVANCE_CEILING: f64 = 1e10;

/// How the variational means are seeded before the first sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeedStrategy {
    /// Top-K components of a thin SVD of the (zero-filled) observation
    /// matrix. Deterministic; the default.
    Svd,
    /// Seeded standard-normal draws.
    Random,
}

/// Mutable variational state, exclusively owned by the inference engine
/// while it iterates.
#[derive(Debug, Clone)]
pub(crate) struct ModelState {
    /// Observed values, zero-filled at masked cells, `(F, S)`.
    pub y: Array2<f64>,
    /// Observation mask, `(F, S)`.
    pub mask: Array2<bool>,
    /// Posterior means of the loadings, `(F, K)`.
    pub w_mean: Array2<f64>,
    /// Posterior variances of the loadings, `(F, K)`.
    pub w_var: Array2<f64>,
    /// Posterior means of the scores, `(S, K)`.
    pub z_mean: Array2<f64>,
    /// Posterior variances of the scores, `(S, K)`.
    pub z_var: Array2<f64>,
    /// ARD precision per factor, `(K,)`.
    pub alpha: Array1<f64>,
    /// Noise precision per feature, `(F,)`.
    pub tau: Array1<f64>,
    /// Observed-entry count per feature, `(F,)`.
    pub obs_per_feature: Array1<f64>,
}

impl ModelState {
    /// Builds the starting point for inference: seeded means, unit posterior
    /// variances, unit ARD precisions, and per-feature noise precisions from
    /// the observed variance of each row.
    pub fn initialize(
        data: &PreparedData,
        num_factors: usize,
        strategy: SeedStrategy,
        seed: u64,
    ) -> Result<Self, FactorModelError> {
        let num_features = data.num_features();
        let num_samples = data.num_samples();

        let (w_mean, z_mean) = match strategy {
            SeedStrategy::Svd => svd_seed(&data.matrix, num_factors, seed)?,
            SeedStrategy::Random => random_seed(num_features, num_samples, num_factors, seed),
        };
        debug!(
            "Seeded {} factors over {} features x {} samples via {:?}.",
            num_factors, num_features, num_samples, strategy
        );

        let obs_per_feature = data
            .mask
            .axis_iter(Axis(0))
            .map(|row| row.iter().filter(|observed| **observed).count() as f64)
            .collect::<Array1<f64>>();

        // Noise precision starts at the inverse observed variance per row.
        let mut tau = Array1::zeros(num_features);
        for f in 0..num_features {
            let count = obs_per_feature[f];
            let variance = if count > 1.0 {
                let row = data.matrix.row(f);
                let mask_row = data.mask.row(f);
                let sum: f64 = row
                    .iter()
                    .zip(mask_row.iter())
                    .filter(|(_, observed)| **observed)
                    .map(|(value, _)| value)
                    .sum();
                let mean = sum / count;
                let ss: f64 = row
                    .iter()
                    .zip(mask_row.iter())
                    .filter(|(_, observed)| **observed)
                    .map(|(value, _)| (value - mean).powi(2))
                    .sum();
                ss / (count - 1.0)
            } else {
                1.0
            };
            tau[f] = 1.0 / variance.max(VARIANCE_FLOOR);
        }

        Ok(ModelState {
            y: data.matrix.clone(),
            mask: data.mask.clone(),
            w_mean,
            w_var: Array2::from_elem((num_features, num_factors), 1.0),
            z_mean,
            z_var: Array2::from_elem((num_samples, num_factors), 1.0),
            alpha: Array1::from_elem(num_factors, 1.0),
            tau,
            obs_per_feature,
        })
    }

    pub fn num_features(&self) -> usize {
        self.y.nrows()
    }

    pub fn num_samples(&self) -> usize {
        self.y.ncols()
    }

    pub fn num_factors(&self) -> usize {
        self.w_mean.ncols()
    }

    /// Posterior-mean reconstruction `W Z^T`, `(F, S)`.
    pub fn reconstruction(&self) -> Array2<f64> {
        self.w_mean.dot(&self.z_mean.t())
    }

    /// `E[(y - sum_k w z)^2]` at one observed cell, given the current
    /// posterior. The variance correction accounts for the posterior
    /// uncertainty of both loadings and scores.
    pub(crate) fn expected_squared_residual(&self, f: usize, s: usize, mean_prediction: f64) -> f64 {
        let mut correction = 0.0;
        for k in 0..self.num_factors() {
            let wm = self.w_mean[[f, k]];
            let wv = self.w_var[[f, k]];
            let zm = self.z_mean[[s, k]];
            let zv = self.z_var[[s, k]];
            correction += wv * (zm * zm + zv) + wm * wm * zv;
        }
        let residual = self.y[[f, s]] - mean_prediction;
        residual * residual + correction
    }

    /// Evidence lower bound: expected log-likelihood over observed entries,
    /// minus the Gaussian KL of every loading against its ARD prior, minus
    /// the GP KL of every factor's scores against the temporal prior.
    pub fn log_evidence_lower_bound(&self, prior: &TemporalPrior) -> f64 {
        let reconstruction = self.reconstruction();

        let mut log_likelihood = 0.0;
        for f in 0..self.num_features() {
            let tau = self.tau[f];
            let log_tau = tau.ln();
            for s in 0..self.num_samples() {
                if !self.mask[[f, s]] {
                    continue;
                }
                let e2 = self.expected_squared_residual(f, s, reconstruction[[f, s]]);
                log_likelihood += 0.5 * (log_tau - LN_2PI - tau * e2);
            }
        }

        // KL(N(m, v) || N(0, 1/alpha)) per loading.
        let mut kl_loadings = 0.0;
        for k in 0..self.num_factors() {
            let alpha = self.alpha[k];
            for f in 0..self.num_features() {
                let m = self.w_mean[[f, k]];
                let v = self.w_var[[f, k]];
                kl_loadings += 0.5 * (alpha * (m * m + v) - 1.0 - (alpha * v).ln());
            }
        }

        let mut kl_scores = 0.0;
        for k in 0..self.num_factors() {
            kl_scores +=
                prior.kl_divergence(k, self.z_mean.column(k), self.z_var.column(k));
        }

        log_likelihood - kl_loadings - kl_scores
    }

    /// Fraction of total observed variance explained by each factor alone,
    /// clamped to `[0, 1]`.
    pub fn explained_variance_per_factor(&self) -> Array1<f64> {
        let mut ss_total = 0.0;
        for f in 0..self.num_features() {
            for s in 0..self.num_samples() {
                if self.mask[[f, s]] {
                    ss_total += self.y[[f, s]] * self.y[[f, s]];
                }
            }
        }
        let ss_total = ss_total.max(VARIANCE_FLOOR);

        let mut r2 = Array1::zeros(self.num_factors());
        for k in 0..self.num_factors() {
            let mut ss_residual = 0.0;
            for f in 0..self.num_features() {
                let w = self.w_mean[[f, k]];
                for s in 0..self.num_samples() {
                    if !self.mask[[f, s]] {
                        continue;
                    }
                    let predicted = w * self.z_mean[[s, k]];
                    let residual = self.y[[f, s]] - predicted;
                    ss_residual += residual * residual;
                }
            }
            r2[k] = (1.0 - ss_residual / ss_total).clamp(0.0, 1.0);
        }
        r2
    }
}

/// Seeds loadings and scores from the top-K components of a thin SVD:
/// `Y ~= U S V^T` gives `W = U_K S_K^{1/2}` and `Z = V_K S_K^{1/2}`, so the
/// seeded reconstruction already approximates `Y`. Factors beyond the
/// numerical rank fall back to small random draws.
fn svd_seed(
    matrix: &Array2<f64>,
    num_factors: usize,
    seed: u64,
) -> Result<(Array2<f64>, Array2<f64>), FactorModelError> {
    let num_features = matrix.nrows();
    let num_samples = matrix.ncols();
    let (u_opt, singular_values, vt_opt) = matrix.svd(true, true)?;
    let (u, vt) = match (u_opt, vt_opt) {
        (Some(u), Some(vt)) => (u, vt),
        // The backend was asked for both singular-vector sets; if it still
        // declined, seed randomly rather than fail.
        _ => return Ok(random_seed(num_features, num_samples, num_factors, seed)),
    };

    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let rank = singular_values
        .iter()
        .filter(|sv| **sv > 1e-12)
        .count()
        .min(num_factors);

    let mut w = Array2::zeros((num_features, num_factors));
    let mut z = Array2::zeros((num_samples, num_factors));
    for k in 0..num_factors {
        if k < rank {
            let scale = singular_values[k].sqrt();
            for f in 0..num_features {
                w[[f, k]] = u[[f, k]] * scale;
            }
            for s in 0..num_samples {
                z[[s, k]] = vt[[k, s]] * scale;
            }
        } else {
            // Beyond the numerical rank there is no signal left to seed
            // from; small draws let those factors find residual structure.
            for f in 0..num_features {
                w[[f, k]] = 0.1 * rng.sample::<f64, _>(StandardNormal);
            }
            for s in 0..num_samples {
                z[[s, k]] = 0.1 * rng.sample::<f64, _>(StandardNormal);
            }
        }
    }
    Ok((w, z))
}

fn random_seed(
    num_features: usize,
    num_samples: usize,
    num_factors: usize,
    seed: u64,
) -> (Array2<f64>, Array2<f64>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let w = Array2::from_shape_fn((num_features, num_factors), |_| {
        rng.sample::<f64, _>(StandardNormal)
    });
    let z = Array2::from_shape_fn((num_samples, num_factors), |_| {
        rng.sample::<f64, _>(StandardNormal)
    });
    (w, z)
}

/// One retained latent factor of a trained model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Factor {
    /// Per-feature weights, `(num_features,)`.
    pub loadings: Array1<f64>,
    /// Per-sample values, `(num_samples,)`.
    pub scores: Array1<f64>,
    /// Learned temporal smoothness scale, in `[0, 1]`.
    pub smoothness: f64,
    /// ARD precision; large values mark a factor the prior pushed towards
    /// zero.
    pub relevance: f64,
    /// Fraction of total observed variance this factor explains, in `[0, 1]`.
    pub explained_variance: f64,
}

/// The frozen result of training: retained factors, per-feature noise, and
/// convergence metadata. Read accessors only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    factors: Vec<Factor>,
    noise_precision: Array1<f64>,
    feature_names: Vec<String>,
    sample_names: Vec<String>,
    covariate: Array1<f64>,
    report: ConvergenceReport,
}

impl TrainedModel {
    pub(crate) fn from_parts(
        factors: Vec<Factor>,
        noise_precision: Array1<f64>,
        feature_names: Vec<String>,
        sample_names: Vec<String>,
        covariate: Array1<f64>,
        report: ConvergenceReport,
    ) -> Self {
        TrainedModel {
            factors,
            noise_precision,
            feature_names,
            sample_names,
            covariate,
            report,
        }
    }

    /// Number of factors retained after pruning.
    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    /// The retained factor at `index`, or `InvalidFactorIndex` if the index
    /// is beyond the retained set.
    pub fn factor(&self, index: usize) -> Result<&Factor, FactorModelError> {
        self.factors
            .get(index)
            .ok_or(FactorModelError::InvalidFactorIndex {
                requested: index,
                available: self.factors.len(),
            })
    }

    pub fn loadings(&self, index: usize) -> Result<ArrayView1<'_, f64>, FactorModelError> {
        Ok(self.factor(index)?.loadings.view())
    }

    pub fn scores(&self, index: usize) -> Result<ArrayView1<'_, f64>, FactorModelError> {
        Ok(self.factor(index)?.scores.view())
    }

    pub fn smoothness(&self, index: usize) -> Result<f64, FactorModelError> {
        Ok(self.factor(index)?.smoothness)
    }

    pub fn relevance(&self, index: usize) -> Result<f64, FactorModelError> {
        Ok(self.factor(index)?.relevance)
    }

    pub fn explained_variance(&self, index: usize) -> Result<f64, FactorModelError> {
        Ok(self.factor(index)?.explained_variance)
    }

    /// Noise precision per feature, `(num_features,)`.
    pub fn noise_precision(&self) -> ArrayView1<'_, f64> {
        self.noise_precision.view()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn sample_names(&self) -> &[String] {
        &self.sample_names
    }

    /// The temporal covariate the model was trained against, aligned to
    /// `sample_names`.
    pub fn covariate(&self) -> ArrayView1<'_, f64> {
        self.covariate.view()
    }

    /// Convergence metadata: terminal status, iteration count, and the
    /// objective trajectory.
    pub fn convergence(&self) -> &ConvergenceReport {
        &self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::prepare_observations;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use std::collections::HashMap;

    fn prepared(num_features: usize, num_samples: usize, seed: u64) -> PreparedData {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let matrix =
            Array2::from_shape_fn((num_features, num_samples), |_| rng.gen_range(-1.0..1.0));
        let feature_names = (0..num_features).map(|i| format!("f{i}")).collect();
        let sample_names: Vec<String> = (0..num_samples).map(|i| format!("s{i}")).collect();
        let covariates: HashMap<String, f64> = sample_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), (i / 4) as f64))
            .collect();
        prepare_observations(matrix, feature_names, sample_names, &covariates, 3, true)
            .unwrap()
    }

    #[test]
    fn svd_seed_reconstructs_a_rank_limited_matrix() {
        let data = prepared(6, 8, 7);
        let state = ModelState::initialize(&data, 3, SeedStrategy::Svd, 42).unwrap();
        // With K close to full rank the seeded reconstruction should track
        // the observed matrix closely.
        let full = ModelState::initialize(&data, 6, SeedStrategy::Svd, 42).unwrap();
        let recon = full.reconstruction();
        for f in 0..6 {
            for s in 0..8 {
                assert_abs_diff_eq!(recon[[f, s]], data.matrix[[f, s]], epsilon = 1e-8);
            }
        }
        assert_eq!(state.num_factors(), 3);
    }

    #[test]
    fn random_seed_is_reproducible() {
        let data = prepared(5, 6, 11);
        let a = ModelState::initialize(&data, 2, SeedStrategy::Random, 99).unwrap();
        let b = ModelState::initialize(&data, 2, SeedStrategy::Random, 99).unwrap();
        assert_eq!(a.w_mean, b.w_mean);
        assert_eq!(a.z_mean, b.z_mean);
    }

    #[test]
    fn elbo_is_finite_at_initialization() {
        let data = prepared(5, 8, 3);
        let state = ModelState::initialize(&data, 2, SeedStrategy::Svd, 1).unwrap();
        let prior = TemporalPrior::new(
            &data.covariate,
            2,
            &crate::temporal::TemporalPriorConfig::default(),
        )
        .unwrap();
        let elbo = state.log_evidence_lower_bound(&prior);
        assert!(elbo.is_finite());
    }

    #[test]
    fn explained_variance_stays_within_unit_interval() {
        let data = prepared(6, 8, 21);
        let state = ModelState::initialize(&data, 3, SeedStrategy::Svd, 5).unwrap();
        for r2 in state.explained_variance_per_factor() {
            assert!((0.0..=1.0).contains(&r2));
        }
    }

    #[test]
    fn invalid_factor_index_is_reported_with_bounds() {
        let model = TrainedModel::from_parts(
            Vec::new(),
            Array1::zeros(0),
            Vec::new(),
            Vec::new(),
            Array1::zeros(0),
            ConvergenceReport::empty(),
        );
        match model.factor(2) {
            Err(FactorModelError::InvalidFactorIndex {
                requested,
                available,
            }) => {
                assert_eq!(requested, 2);
                assert_eq!(available, 0);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
