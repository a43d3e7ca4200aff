//! Post-hoc feature ranking over a trained model's loadings.
//!
//! A pure, deterministic view: nothing here mutates the model, and repeated
//! queries with the same arguments return identical lists.

use serde::{Deserialize, Serialize};

use crate::errors::FactorModelError;
use crate::model::TrainedModel;

/// Which side of a factor's loading distribution to rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankingDirection {
    /// All features, by absolute loading, largest first.
    Any,
    /// Strictly positive loadings only, largest first.
    Positive,
    /// Strictly negative loadings only, most negative first.
    Negative,
}

/// One entry of a ranked feature list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankedFeature {
    pub feature: String,
    pub loading: f64,
}

/// Returns up to `top_n` features of the given retained factor, ordered per
/// `direction`. Ties are broken by feature identifier ascending, so the
/// ordering is stable across queries. The result is bounded by the number of
/// qualifying features; it is never padded.
///
/// # Errors
///
/// [`FactorModelError::InvalidFactorIndex`] if `factor` is not a retained
/// factor index of `model`.
pub fn rank_features(
    model: &TrainedModel,
    factor: usize,
    direction: RankingDirection,
    top_n: usize,
) -> Result<Vec<RankedFeature>, FactorModelError> {
    let loadings = model.loadings(factor)?;
    let names = model.feature_names();

    let mut entries: Vec<RankedFeature> = names
        .iter()
        .zip(loadings.iter())
        .filter(|(_, &loading)| match direction {
            RankingDirection::Any => true,
            RankingDirection::Positive => loading > 0.0,
            RankingDirection::Negative => loading < 0.0,
        })
        .map(|(name, &loading)| RankedFeature {
            feature: name.clone(),
            loading,
        })
        .collect();

    entries.sort_by(|a, b| {
        let primary = match direction {
            RankingDirection::Any => b.loading.abs().total_cmp(&a.loading.abs()),
            RankingDirection::Positive => b.loading.total_cmp(&a.loading),
            RankingDirection::Negative => a.loading.total_cmp(&b.loading),
        };
        primary.then_with(|| a.feature.cmp(&b.feature))
    });

    entries.truncate(top_n);
    Ok(entries)
}
