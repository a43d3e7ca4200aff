//! Gaussian-process smoothness prior over factor scores.
//!
//! Each factor `k` carries a GP prior over its per-sample scores as a
//! function of the temporal covariate. The squared-exponential length-scale
//! is reparameterized into a single smoothness scalar `s_k` in `[0, 1]`
//! through the kernel mixture
//!
//! ```text
//! C_k = s_k * K_SE(t, t'; lengthscale) + (1 - s_k) * I
//! ```
//!
//! so `s_k = 0` recovers the uninformative iid prior (a time-independent
//! factor) and `s_k = 1` is maximally smooth in time. The scalar is
//! re-optimized every inference sweep by maximizing the GP log marginal
//! likelihood of the current score means over a deterministic grid, jointly
//! with a small grid of candidate length-scales derived from the covariate
//! range.

use log::{debug, trace};
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::{Cholesky, Diag, InverseH, SolveTriangular, UPLO};
use serde::{Deserialize, Serialize};

use crate::errors::FactorModelError;

const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Grid-search configuration for the per-factor smoothness optimization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemporalPriorConfig {
    /// Number of evenly spaced smoothness candidates on `[0, 1]`, endpoints
    /// included. Must be at least 2.
    pub smoothness_grid_points: usize,
    /// Candidate squared-exponential length-scales, as fractions of the
    /// covariate range.
    pub lengthscale_fractions: Vec<f64>,
    /// Diagonal jitter keeping every candidate kernel positive definite.
    pub jitter: f64,
}

impl Default for TemporalPriorConfig {
    fn default() -> Self {
        TemporalPriorConfig {
            smoothness_grid_points: 21,
            lengthscale_fractions: vec![0.125, 0.25, 0.5],
            jitter: 1e-6,
        }
    }
}

/// Per-factor state: the selected kernel mixture and its cached inverse.
#[derive(Debug, Clone)]
struct GpFactorState {
    smoothness: f64,
    lengthscale: f64,
    /// `C_k^{-1}`, shape `(num_samples, num_samples)`.
    precision: Array2<f64>,
    /// `ln |C_k|`.
    log_det: f64,
}

/// The temporal prior over all factors' scores.
#[derive(Debug, Clone)]
pub struct TemporalPrior {
    covariate: Array1<f64>,
    smoothness_grid: Vec<f64>,
    lengthscales: Vec<f64>,
    jitter: f64,
    states: Vec<GpFactorState>,
}

impl TemporalPrior {
    /// Builds the prior for `num_factors` factors over the given covariate.
    /// Every factor starts at smoothness 0 (iid prior), so the first score
    /// update is unconstrained in time.
    pub fn new(
        covariate: &Array1<f64>,
        num_factors: usize,
        config: &TemporalPriorConfig,
    ) -> Result<Self, FactorModelError> {
        let grid_points = config.smoothness_grid_points.max(2);
        let smoothness_grid: Vec<f64> = (0..grid_points)
            .map(|i| i as f64 / (grid_points - 1) as f64)
            .collect();

        let range = covariate_range(covariate);
        // A constant covariate carries no temporal signal; any positive
        // length-scale then yields K_SE == ones, and the grid search will
        // settle wherever the marginal likelihood is flat.
        let base = if range > 0.0 { range } else { 1.0 };
        let mut lengthscales: Vec<f64> = config
            .lengthscale_fractions
            .iter()
            .map(|fraction| (fraction * base).max(1e-6))
            .collect();
        if lengthscales.is_empty() {
            lengthscales.push(0.25 * base);
        }
        debug!(
            "Temporal prior: covariate range {:.4}, candidate lengthscales {:?}.",
            range, lengthscales
        );

        let num_samples = covariate.len();
        let identity_state = GpFactorState {
            smoothness: 0.0,
            lengthscale: lengthscales.first().copied().unwrap_or(1.0),
            precision: Array2::eye(num_samples),
            log_det: 0.0,
        };
        Ok(TemporalPrior {
            covariate: covariate.clone(),
            smoothness_grid,
            lengthscales,
            jitter: config.jitter,
            states: vec![identity_state; num_factors],
        })
    }

    pub fn num_factors(&self) -> usize {
        self.states.len()
    }

    /// Learned smoothness scale of factor `k`, in `[0, 1]`.
    pub fn smoothness(&self, factor: usize) -> f64 {
        self.states[factor].smoothness
    }

    /// Selected length-scale of factor `k` (diagnostic).
    pub fn lengthscale(&self, factor: usize) -> f64 {
        self.states[factor].lengthscale
    }

    /// Cached prior precision `C_k^{-1}` for the score update of factor `k`.
    pub(crate) fn precision(&self, factor: usize) -> &Array2<f64> {
        &self.states[factor].precision
    }

    /// Re-selects the smoothness (and length-scale) of factor `k` by
    /// maximizing the GP log marginal likelihood of the current score means,
    /// then refreshes the cached precision for the next sweep.
    pub(crate) fn update(
        &mut self,
        factor: usize,
        score_means: ArrayView1<'_, f64>,
    ) -> Result<(), FactorModelError> {
        let mut best_score = f64::NEG_INFINITY;
        let mut best_smoothness = 0.0;
        let mut best_lengthscale = self.lengthscales[0];

        for &lengthscale in &self.lengthscales {
            for &smoothness in &self.smoothness_grid {
                let kernel = self.build_kernel(smoothness, lengthscale);
                let marginal = gp_log_marginal(&kernel, score_means)?;
                trace!(
                    "factor {}: s={:.3} l={:.3} log-marginal {:.6}",
                    factor,
                    smoothness,
                    lengthscale,
                    marginal
                );
                if marginal > best_score {
                    best_score = marginal;
                    best_smoothness = smoothness;
                    best_lengthscale = lengthscale;
                }
            }
        }

        let kernel = self.build_kernel(best_smoothness, best_lengthscale);
        let cholesky = kernel.cholesky(UPLO::Lower)?;
        let log_det = 2.0 * cholesky.diag().mapv(f64::ln).sum();
        let precision = kernel.invh()?;
        self.states[factor] = GpFactorState {
            smoothness: best_smoothness,
            lengthscale: best_lengthscale,
            precision,
            log_det,
        };
        Ok(())
    }

    /// KL divergence between the factorized Gaussian posterior
    /// `q(z_k) = prod_s N(mean_s, var_s)` and the GP prior `N(0, C_k)`.
    pub(crate) fn kl_divergence(
        &self,
        factor: usize,
        score_means: ArrayView1<'_, f64>,
        score_vars: ArrayView1<'_, f64>,
    ) -> f64 {
        let state = &self.states[factor];
        let n = score_means.len() as f64;
        let quadratic = score_means.dot(&state.precision.dot(&score_means));
        let mut trace_term = 0.0;
        let mut entropy_term = 0.0;
        for (idx, var) in score_vars.iter().enumerate() {
            trace_term += state.precision[[idx, idx]] * var;
            entropy_term += var.ln();
        }
        0.5 * (trace_term + quadratic - n + state.log_det - entropy_term)
    }

    /// `C(s, l) = s * K_SE + (1 - s) * I`, plus diagonal jitter.
    fn build_kernel(&self, smoothness: f64, lengthscale: f64) -> Array2<f64> {
        let n = self.covariate.len();
        let mut kernel = Array2::zeros((n, n));
        let inv_two_ell_sq = 1.0 / (2.0 * lengthscale * lengthscale);
        for i in 0..n {
            for j in 0..=i {
                let diff = self.covariate[i] - self.covariate[j];
                let se = (-diff * diff * inv_two_ell_sq).exp();
                let mut value = smoothness * se;
                if i == j {
                    value += (1.0 - smoothness) + self.jitter;
                }
                kernel[[i, j]] = value;
                kernel[[j, i]] = value;
            }
        }
        kernel
    }
}

fn covariate_range(covariate: &Array1<f64>) -> f64 {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &value in covariate {
        min = min.min(value);
        max = max.max(value);
    }
    if min.is_finite() && max.is_finite() {
        max - min
    } else {
        0.0
    }
}

/// `log N(values | 0, kernel)` via a Cholesky factorization.
fn gp_log_marginal(
    kernel: &Array2<f64>,
    values: ArrayView1<'_, f64>,
) -> Result<f64, FactorModelError> {
    let lower = kernel.cholesky(UPLO::Lower)?;
    let log_det = 2.0 * lower.diag().mapv(f64::ln).sum();
    let whitened = lower.solve_triangular(UPLO::Lower, Diag::NonUnit, &values.to_owned())?;
    let quadratic: f64 = whitened.iter().map(|x| x * x).sum();
    let n = values.len() as f64;
    Ok(-0.5 * (quadratic + log_det + n * LN_2PI))
}
