//! Normalizes a raw feature-by-sample matrix and its per-sample covariate
//! into the shapes the factor model consumes.
//!
//! The adapter is the single validation point of the pipeline: every input
//! error the engine can refuse is raised here, before any optimization
//! iteration runs.

use std::collections::{HashMap, HashSet};

use log::{debug, info};
use ndarray::{Array1, Array2, Axis};

use crate::errors::FactorModelError;

/// Immutable, validated training input.
///
/// Missing observations are encoded as `false` entries in `mask`; the
/// corresponding cells of `matrix` hold `0.0` so that dense matrix products
/// remain well-defined, but `mask` is the sole authority on which entries
/// participate in the likelihood.
#[derive(Debug, Clone)]
pub struct PreparedData {
    /// Observed values, shape `(num_features, num_samples)`. Masked cells
    /// are zero-filled.
    pub matrix: Array2<f64>,
    /// Observation mask, shape `(num_features, num_samples)`; `true` means
    /// the entry was observed.
    pub mask: Array2<bool>,
    /// Temporal covariate, one value per sample column.
    pub covariate: Array1<f64>,
    /// Feature identifiers, one per matrix row.
    pub feature_names: Vec<String>,
    /// Sample identifiers, one per matrix column.
    pub sample_names: Vec<String>,
}

impl PreparedData {
    pub fn num_features(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn num_samples(&self) -> usize {
        self.matrix.ncols()
    }
}

/// Validates and packages raw training input.
///
/// * `matrix` - Observed values, shape `(num_features, num_samples)`, with
///   `NaN` encoding a missing (unobserved) entry.
/// * `feature_names` - One unique identifier per matrix row.
/// * `sample_names` - One unique identifier per matrix column.
/// * `covariate_by_sample` - Maps each sample identifier to its scalar
///   temporal covariate (e.g. differentiation time).
/// * `num_factors` - The `K` the model will be trained with; the matrix must
///   carry at least `K + 1` samples.
/// * `center_features` - When set, subtracts each feature's mean over its
///   *observed* entries. The factor model assumes zero-mean data, so this
///   should be enabled unless the input is already centered.
///
/// # Errors
///
/// * [`FactorModelError::IdentifierCountMismatch`] if a name list does not
///   match the matrix dimension it labels.
/// * [`FactorModelError::DuplicateIdentifier`] if a feature or sample name
///   occurs twice.
/// * [`FactorModelError::MissingCovariate`] if any sample column has no
///   covariate entry.
/// * [`FactorModelError::NonFiniteCovariate`] if a covariate value is `NaN`
///   or infinite.
/// * [`FactorModelError::NonFiniteValue`] if a matrix entry is infinite
///   (`NaN` is the missing-data encoding and is accepted).
/// * [`FactorModelError::InsufficientSamples`] if fewer than
///   `num_factors + 1` samples are present.
pub fn prepare_observations(
    matrix: Array2<f64>,
    feature_names: Vec<String>,
    sample_names: Vec<String>,
    covariate_by_sample: &HashMap<String, f64>,
    num_factors: usize,
    center_features: bool,
) -> Result<PreparedData, FactorModelError> {
    let num_features = matrix.nrows();
    let num_samples = matrix.ncols();
    if feature_names.len() != num_features {
        return Err(FactorModelError::IdentifierCountMismatch {
            axis: "feature",
            names: feature_names.len(),
            dimension: num_features,
        });
    }
    if sample_names.len() != num_samples {
        return Err(FactorModelError::IdentifierCountMismatch {
            axis: "sample",
            names: sample_names.len(),
            dimension: num_samples,
        });
    }

    reject_duplicates(&feature_names)?;
    reject_duplicates(&sample_names)?;

    let required = num_factors + 1;
    if num_samples < required {
        return Err(FactorModelError::InsufficientSamples {
            available: num_samples,
            required,
            num_factors,
        });
    }

    // Covariate lookup happens before any numeric work so a bad map fails
    // fast, ahead of the first optimization iteration.
    let mut covariate = Array1::zeros(num_samples);
    for (idx, name) in sample_names.iter().enumerate() {
        match covariate_by_sample.get(name) {
            Some(value) if value.is_finite() => covariate[idx] = *value,
            Some(_) => {
                return Err(FactorModelError::NonFiniteCovariate {
                    sample: name.clone(),
                })
            }
            None => {
                return Err(FactorModelError::MissingCovariate {
                    sample: name.clone(),
                })
            }
        }
    }

    // NaN is the missing-data sentinel; an infinity is malformed input and
    // must be refused rather than reclassified as missing.
    for ((row, col), value) in matrix.indexed_iter() {
        if value.is_infinite() {
            return Err(FactorModelError::NonFiniteValue {
                feature: feature_names[row].clone(),
                sample: sample_names[col].clone(),
            });
        }
    }

    let mask = matrix.mapv(|value| !value.is_nan());
    let mut matrix = matrix.mapv(|value| if value.is_nan() { 0.0 } else { value });

    if center_features {
        center_observed_rows(&mut matrix, &mask);
        debug!("Centered {} features over their observed entries.", num_features);
    }

    let num_missing = mask.iter().filter(|observed| !**observed).count();
    info!(
        "Prepared observation matrix: {} features x {} samples ({} missing entries).",
        num_features, num_samples, num_missing
    );

    Ok(PreparedData {
        matrix,
        mask,
        covariate,
        feature_names,
        sample_names,
    })
}

fn reject_duplicates(names: &[String]) -> Result<(), FactorModelError> {
    let mut seen = HashSet::with_capacity(names.len());
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(FactorModelError::DuplicateIdentifier { id: name.clone() });
        }
    }
    Ok(())
}

/// Subtracts each row's mean over observed entries, in place. Rows with no
/// observed entry are left untouched (they are all zero-filled anyway).
fn center_observed_rows(matrix: &mut Array2<f64>, mask: &Array2<bool>) {
    for (mut row, mask_row) in matrix
        .axis_iter_mut(Axis(0))
        .zip(mask.axis_iter(Axis(0)))
    {
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for (value, observed) in row.iter().zip(mask_row.iter()) {
            if *observed {
                sum += *value;
                count += 1;
            }
        }
        if count == 0 {
            continue;
        }
        let mean = sum / count as f64;
        for (value, observed) in row.iter_mut().zip(mask_row.iter()) {
            if *observed {
                *value -= mean;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    fn covariates(sample_names: &[String]) -> HashMap<String, f64> {
        sample_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as f64))
            .collect()
    }

    #[test]
    fn missing_covariate_is_rejected_before_training() {
        let matrix = Array2::<f64>::zeros((3, 4));
        let samples = names("s", 4);
        let mut map = covariates(&samples);
        map.remove("s2");
        let err = prepare_observations(matrix, names("f", 3), samples, &map, 2, true)
            .expect_err("must fail");
        match err {
            FactorModelError::MissingCovariate { sample } => assert_eq!(sample, "s2"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn too_few_samples_for_requested_factors() {
        let matrix = Array2::<f64>::zeros((3, 3));
        let samples = names("s", 3);
        let map = covariates(&samples);
        let err = prepare_observations(matrix, names("f", 3), samples, &map, 3, true)
            .expect_err("must fail");
        match err {
            FactorModelError::InsufficientSamples {
                available,
                required,
                num_factors,
            } => {
                assert_eq!(available, 3);
                assert_eq!(required, 4);
                assert_eq!(num_factors, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn nan_covariate_is_rejected_before_training() {
        let matrix = Array2::<f64>::zeros((3, 4));
        let samples = names("s", 4);
        let mut map = covariates(&samples);
        map.insert("s1".to_string(), f64::NAN);
        let err = prepare_observations(matrix, names("f", 3), samples, &map, 2, true)
            .expect_err("must fail");
        match err {
            FactorModelError::NonFiniteCovariate { sample } => assert_eq!(sample, "s1"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn infinite_matrix_entry_is_rejected_not_masked() {
        let mut matrix = Array2::<f64>::zeros((2, 4));
        matrix[[1, 2]] = f64::INFINITY;
        let samples = names("s", 4);
        let map = covariates(&samples);
        let err = prepare_observations(matrix, names("f", 2), samples, &map, 2, true)
            .expect_err("must fail");
        match err {
            FactorModelError::NonFiniteValue { feature, sample } => {
                assert_eq!(feature, "f1");
                assert_eq!(sample, "s2");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn mismatched_identifier_counts_are_rejected() {
        let matrix = Array2::<f64>::zeros((3, 4));
        let samples = names("s", 4);
        let map = covariates(&samples);
        let err = prepare_observations(matrix, names("f", 2), samples, &map, 2, true)
            .expect_err("must fail");
        match err {
            FactorModelError::IdentifierCountMismatch {
                axis,
                names,
                dimension,
            } => {
                assert_eq!(axis, "feature");
                assert_eq!(names, 2);
                assert_eq!(dimension, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn duplicate_sample_names_are_rejected() {
        let matrix = Array2::<f64>::zeros((2, 4));
        let samples = vec!["a".into(), "b".into(), "a".into(), "c".into()];
        let map = covariates(&samples);
        let err = prepare_observations(matrix, names("f", 2), samples, &map, 2, true)
            .expect_err("must fail");
        assert!(matches!(
            err,
            FactorModelError::DuplicateIdentifier { ref id } if id == "a"
        ));
    }

    #[test]
    fn centering_zeroes_observed_feature_means() {
        let matrix = array![
            [1.0, 2.0, 3.0, 6.0],
            [f64::NAN, 4.0, 8.0, f64::NAN],
        ];
        let samples = names("s", 4);
        let map = covariates(&samples);
        let prepared =
            prepare_observations(matrix, names("f", 2), samples, &map, 2, true).unwrap();

        // Row 0: mean 3.0 over all four entries.
        assert_eq!(prepared.matrix[[0, 0]], -2.0);
        assert_eq!(prepared.matrix[[0, 3]], 3.0);
        // Row 1: mean 6.0 over the two observed entries; masked cells stay zero.
        assert_eq!(prepared.matrix[[1, 1]], -2.0);
        assert_eq!(prepared.matrix[[1, 2]], 2.0);
        assert_eq!(prepared.matrix[[1, 0]], 0.0);
        assert!(!prepared.mask[[1, 0]]);
        assert!(!prepared.mask[[1, 3]]);
    }

    #[test]
    fn covariate_vector_follows_sample_order() {
        let matrix = Array2::<f64>::zeros((2, 4));
        let samples: Vec<String> = vec!["d2".into(), "d0".into(), "d1".into(), "d2b".into()];
        let mut map = HashMap::new();
        map.insert("d2".to_string(), 2.0);
        map.insert("d0".to_string(), 0.0);
        map.insert("d1".to_string(), 1.0);
        map.insert("d2b".to_string(), 2.0);
        let prepared =
            prepare_observations(matrix, names("f", 2), samples, &map, 2, false).unwrap();
        assert_eq!(prepared.covariate.to_vec(), vec![2.0, 0.0, 1.0, 2.0]);
    }
}
