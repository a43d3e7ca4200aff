//! Variational inference engine for the temporal factor model.
//!
//! The engine walks the state machine
//! `INITIALIZED -> ITERATING -> {CONVERGED, MAX_ITERS_REACHED}`. Every sweep
//! performs coordinate updates in a fixed order -- loadings, then scores,
//! then noise precision, then ARD relevance, then GP smoothness -- because
//! later updates read the results of earlier ones. After each sweep the
//! evidence lower bound decides whether to stop.
//!
//! Reaching the iteration budget is reported, not fatal: the
//! partially-converged model is still returned, with the terminal status in
//! its [`ConvergenceReport`].

use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use ndarray_linalg::InverseH;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::adapter::PreparedData;
use crate::errors::FactorModelError;
use crate::model::{Factor, ModelState, SeedStrategy, TrainedModel, RELEVANCE_CEILING, VARIANCE_FLOOR};
use crate::temporal::{TemporalPrior, TemporalPriorConfig};

/// Convergence strictness presets, each a (relative-tolerance,
/// iteration-budget) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergencePreset {
    Fast,
    Medium,
    Slow,
}

impl ConvergencePreset {
    /// Relative ELBO improvement below which training stops.
    pub fn tolerance(self) -> f64 {
        match self {
            ConvergencePreset::Fast => 1e-3,
            ConvergencePreset::Medium => 1e-4,
            ConvergencePreset::Slow => 1e-6,
        }
    }

    /// Maximum number of full coordinate sweeps.
    pub fn iteration_budget(self) -> usize {
        match self {
            ConvergencePreset::Fast => 100,
            ConvergencePreset::Medium => 300,
            ConvergencePreset::Slow => 1000,
        }
    }
}

/// Full training configuration, passed explicitly into the engine; the core
/// keeps no process-wide state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of latent factors K requested at initialization.
    pub num_factors: usize,
    /// How the variational means are seeded.
    pub seed_strategy: SeedStrategy,
    /// Seed for every random draw the engine makes.
    pub random_seed: u64,
    /// When false, ARD precisions stay pinned at 1.0 and no factor is
    /// shrunk away by the loading prior.
    pub ard_factors: bool,
    /// Convergence strictness.
    pub convergence: ConvergencePreset,
    /// Overrides the preset's iteration budget when set.
    pub max_iterations_override: Option<usize>,
    /// Factors whose explained variance falls below this threshold are
    /// dropped from the returned model. A negative threshold disables
    /// pruning entirely, preserving all K requested factors.
    pub pruning_threshold: f64,
    /// Smoothness grid-search configuration of the temporal prior.
    pub temporal: TemporalPriorConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            num_factors: 10,
            seed_strategy: SeedStrategy::Svd,
            random_seed: 42,
            ard_factors: true,
            convergence: ConvergencePreset::Medium,
            max_iterations_override: None,
            pruning_threshold: -1.0,
            temporal: TemporalPriorConfig::default(),
        }
    }
}

/// Engine lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Initialized,
    Iterating,
    Converged,
    MaxItersReached,
}

/// Terminal outcome of a training run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingStatus {
    /// Relative ELBO improvement fell below the configured tolerance.
    Converged,
    /// The iteration budget ran out first. The model is still usable; this
    /// status is the caller's cue to retry with different settings if a
    /// fully converged fit is required.
    MaxItersReached,
}

/// Convergence metadata frozen into the returned model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub status: TrainingStatus,
    /// Number of full coordinate sweeps performed.
    pub iterations: usize,
    /// Objective value at the final sweep.
    pub final_elbo: f64,
    /// Objective value after every sweep, in order.
    pub elbo_history: Vec<f64>,
}

impl ConvergenceReport {
    #[cfg(test)]
    pub(crate) fn empty() -> Self {
        ConvergenceReport {
            status: TrainingStatus::Converged,
            iterations: 0,
            final_elbo: 0.0,
            elbo_history: Vec::new(),
        }
    }
}

/// Owns the model state for the duration of one training run.
#[derive(Debug)]
pub struct InferenceEngine {
    config: TrainingConfig,
    state: EngineState,
}

impl InferenceEngine {
    pub fn new(config: TrainingConfig) -> Self {
        InferenceEngine {
            config,
            state: EngineState::Initialized,
        }
    }

    /// Current lifecycle state (diagnostic).
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Runs the full optimization and freezes the result. The engine's
    /// terminal lifecycle state stays observable through [`Self::state`]
    /// after the run; each invocation builds a fresh model state.
    pub fn train(&mut self, data: &PreparedData) -> Result<TrainedModel, FactorModelError> {
        let num_factors = self.config.num_factors;
        let mut state = ModelState::initialize(
            data,
            num_factors,
            self.config.seed_strategy,
            self.config.random_seed,
        )?;
        let mut prior = TemporalPrior::new(&data.covariate, num_factors, &self.config.temporal)?;

        let tolerance = self.config.convergence.tolerance();
        let budget = self
            .config
            .max_iterations_override
            .unwrap_or_else(|| self.config.convergence.iteration_budget());
        info!(
            "Training {} factors on {} features x {} samples (tolerance {:.1e}, budget {}).",
            num_factors,
            state.num_features(),
            state.num_samples(),
            tolerance,
            budget
        );

        self.state = EngineState::Iterating;
        let mut elbo_history = Vec::with_capacity(budget.min(1024));
        let mut previous_elbo = f64::NEG_INFINITY;
        let mut iterations = 0usize;

        for iteration in 1..=budget {
            Self::update_loadings(&mut state)?;
            Self::update_scores(&mut state, &prior)?;
            Self::update_noise(&mut state);
            if self.config.ard_factors {
                Self::update_relevance(&mut state);
            }
            for factor in 0..num_factors {
                prior.update(factor, state.z_mean.column(factor))?;
            }

            let elbo = state.log_evidence_lower_bound(&prior);
            elbo_history.push(elbo);
            iterations = iteration;
            debug!("sweep {}: ELBO {:.6}", iteration, elbo);

            if iteration > 1 {
                let relative = (elbo - previous_elbo).abs() / previous_elbo.abs().max(1.0);
                if relative < tolerance {
                    info!(
                        "Converged after {} sweeps (relative improvement {:.3e}).",
                        iteration, relative
                    );
                    self.state = EngineState::Converged;
                    break;
                }
            }
            previous_elbo = elbo;
        }

        let status = if self.state == EngineState::Converged {
            TrainingStatus::Converged
        } else {
            self.state = EngineState::MaxItersReached;
            warn!(
                "Iteration budget of {} sweeps exhausted before convergence; \
                 returning the partially-converged model.",
                budget
            );
            TrainingStatus::MaxItersReached
        };

        let explained = state.explained_variance_per_factor();
        let mut retained: Vec<usize> = (0..num_factors).collect();
        if self.config.pruning_threshold >= 0.0 {
            retained.retain(|&k| explained[k] >= self.config.pruning_threshold);
            if retained.len() < num_factors {
                info!(
                    "Pruned {} of {} factors below explained-variance threshold {:.4}.",
                    num_factors - retained.len(),
                    num_factors,
                    self.config.pruning_threshold
                );
            }
        }

        let factors: Vec<Factor> = retained
            .iter()
            .map(|&k| Factor {
                loadings: state.w_mean.column(k).to_owned(),
                scores: state.z_mean.column(k).to_owned(),
                smoothness: prior.smoothness(k),
                relevance: state.alpha[k],
                explained_variance: explained[k],
            })
            .collect();

        let report = ConvergenceReport {
            status,
            iterations,
            final_elbo: elbo_history.last().copied().unwrap_or(f64::NEG_INFINITY),
            elbo_history,
        };

        Ok(TrainedModel::from_parts(
            factors,
            state.tau.clone(),
            data.feature_names.clone(),
            data.sample_names.clone(),
            data.covariate.clone(),
            report,
        ))
    }

    /// Updates the loading posterior of every feature, holding scores and
    /// noise fixed. Features are independent given the scores, so the rows
    /// are solved in parallel.
    fn update_loadings(state: &mut ModelState) -> Result<(), FactorModelError> {
        let num_factors = state.num_factors();
        let num_samples = state.num_samples();

        // E[Z^T Z] over all samples; fully observed rows reuse it directly.
        let mut full_gram = Array2::<f64>::zeros((num_factors, num_factors));
        for s in 0..num_samples {
            for a in 0..num_factors {
                let za = state.z_mean[[s, a]];
                for b in 0..num_factors {
                    full_gram[[a, b]] += za * state.z_mean[[s, b]];
                }
                full_gram[[a, a]] += state.z_var[[s, a]];
            }
        }

        let state_ref = &*state;
        let rows: Vec<(Array1<f64>, Array1<f64>)> = (0..state_ref.num_features())
            .into_par_iter()
            .map(|f| -> Result<(Array1<f64>, Array1<f64>), FactorModelError> {
                let tau = state_ref.tau[f];
                let y_row = state_ref.y.row(f);
                let mask_row = state_ref.mask.row(f);
                let fully_observed = mask_row.iter().all(|observed| *observed);

                let mut gram = if fully_observed {
                    full_gram.clone()
                } else {
                    let mut partial = Array2::<f64>::zeros((num_factors, num_factors));
                    for s in 0..num_samples {
                        if !mask_row[s] {
                            continue;
                        }
                        for a in 0..num_factors {
                            let za = state_ref.z_mean[[s, a]];
                            for b in 0..num_factors {
                                partial[[a, b]] += za * state_ref.z_mean[[s, b]];
                            }
                            partial[[a, a]] += state_ref.z_var[[s, a]];
                        }
                    }
                    partial
                };

                // Masked cells of y are zero-filled, so the projection needs
                // no mask of its own.
                let projection = state_ref.z_mean.t().dot(&y_row);

                gram *= tau;
                for k in 0..num_factors {
                    gram[[k, k]] += state_ref.alpha[k];
                }
                let covariance = gram.invh()?;
                let mean = covariance.dot(&projection) * tau;
                let variance = covariance
                    .diag()
                    .mapv(|v| v.max(VARIANCE_FLOOR));
                Ok((mean, variance))
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (f, (mean, variance)) in rows.into_iter().enumerate() {
            state.w_mean.row_mut(f).assign(&mean);
            state.w_var.row_mut(f).assign(&variance);
        }
        Ok(())
    }

    /// Updates the score posterior factor by factor, holding loadings and
    /// noise fixed. Each factor's scores are coupled across samples by the
    /// GP prior, so the update solves one dense S x S system per factor.
    fn update_scores(
        state: &mut ModelState,
        prior: &TemporalPrior,
    ) -> Result<(), FactorModelError> {
        let num_factors = state.num_factors();
        let num_features = state.num_features();
        let num_samples = state.num_samples();
        let mut reconstruction = state.reconstruction();

        for k in 0..num_factors {
            let mut diagonal = Array1::<f64>::zeros(num_samples);
            let mut moment = Array1::<f64>::zeros(num_samples);
            for s in 0..num_samples {
                let mut d = 0.0;
                let mut b = 0.0;
                for f in 0..num_features {
                    if !state.mask[[f, s]] {
                        continue;
                    }
                    let tau = state.tau[f];
                    let wm = state.w_mean[[f, k]];
                    d += tau * (wm * wm + state.w_var[[f, k]]);
                    // Residual with factor k's own contribution removed.
                    let other = reconstruction[[f, s]] - wm * state.z_mean[[s, k]];
                    b += tau * wm * (state.y[[f, s]] - other);
                }
                diagonal[s] = d;
                moment[s] = b;
            }

            let mut precision = prior.precision(k).clone();
            for s in 0..num_samples {
                precision[[s, s]] += diagonal[s];
            }
            let covariance = precision.invh()?;
            let new_mean = covariance.dot(&moment);

            // Later factors in this sweep must see the refreshed residual.
            for f in 0..num_features {
                let wm = state.w_mean[[f, k]];
                for s in 0..num_samples {
                    reconstruction[[f, s]] += wm * (new_mean[s] - state.z_mean[[s, k]]);
                }
            }
            for s in 0..num_samples {
                state.z_mean[[s, k]] = new_mean[s];
                state.z_var[[s, k]] = covariance[[s, s]].max(VARIANCE_FLOOR);
            }
        }
        Ok(())
    }

    /// Re-estimates the per-feature noise precision from the expected
    /// squared residuals, floored so a perfectly fit feature cannot produce
    /// an infinite precision.
    fn update_noise(state: &mut ModelState) {
        let reconstruction = state.reconstruction();
        let state_ref = &*state;
        let taus: Vec<f64> = (0..state_ref.num_features())
            .into_par_iter()
            .map(|f| {
                let observed = state_ref.obs_per_feature[f];
                if observed == 0.0 {
                    return 1.0;
                }
                let mut sum = 0.0;
                for s in 0..state_ref.num_samples() {
                    if !state_ref.mask[[f, s]] {
                        continue;
                    }
                    sum += state_ref.expected_squared_residual(f, s, reconstruction[[f, s]]);
                }
                observed / sum.max(observed * VARIANCE_FLOOR)
            })
            .collect();
        state.tau = Array1::from(taus);
    }

    /// Type-II update of the ARD precisions from the expected squared
    /// loading magnitude per factor, capped so a dead factor saturates
    /// instead of overflowing.
    fn update_relevance(state: &mut ModelState) {
        let num_features = state.num_features() as f64;
        for k in 0..state.num_factors() {
            let mut sum = 0.0;
            for f in 0..state.num_features() {
                let m = state.w_mean[[f, k]];
                sum += m * m + state.w_var[[f, k]];
            }
            state.alpha[k] = (num_features / sum.max(VARIANCE_FLOOR)).min(RELEVANCE_CEILING);
        }
    }
}
