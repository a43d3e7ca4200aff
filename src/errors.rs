use thiserror::Error;

/// Errors surfaced by the adapter, the inference engine, and post-hoc queries.
///
/// Input validation errors (`MissingCovariate`, `InsufficientSamples`,
/// `DuplicateIdentifier`) are raised before any optimization iteration runs.
/// Reaching the iteration budget without convergence is *not* an error; it is
/// reported through [`crate::ConvergenceReport`] on the returned model.
#[derive(Debug, Error)]
pub enum FactorModelError {
    /// A sample column has no entry in the covariate map.
    #[error("sample '{sample}' has no covariate value")]
    MissingCovariate { sample: String },

    /// A covariate entry is NaN or infinite. The GP kernel is a function of
    /// covariate differences, so a single non-finite value would poison
    /// every candidate kernel.
    #[error("covariate for sample '{sample}' is not finite")]
    NonFiniteCovariate { sample: String },

    /// A matrix entry is infinite. Only `NaN` encodes a missing entry;
    /// infinities are malformed input, not missing data.
    #[error(
        "non-finite value at feature '{feature}', sample '{sample}'; \
         only NaN encodes a missing entry"
    )]
    NonFiniteValue { feature: String, sample: String },

    /// An identifier list does not match the matrix dimension it labels.
    #[error(
        "{axis} identifier count ({names}) does not match the matrix's \
         {axis} count ({dimension})"
    )]
    IdentifierCountMismatch {
        axis: &'static str,
        names: usize,
        dimension: usize,
    },

    /// The observation matrix carries too few samples for the requested
    /// number of factors (at least K + 1 samples are required).
    #[error(
        "matrix has {available} samples but at least {required} are required \
         for {num_factors} factors"
    )]
    InsufficientSamples {
        available: usize,
        required: usize,
        num_factors: usize,
    },

    /// A feature or sample identifier occurs more than once.
    #[error("identifier '{id}' occurs more than once")]
    DuplicateIdentifier { id: String },

    /// A post-hoc query referenced a factor index beyond the retained set.
    #[error("factor index {requested} out of range: model retains {available} factors")]
    InvalidFactorIndex { requested: usize, available: usize },

    /// A dense linear-algebra routine failed. With the jitter and variance
    /// floors applied throughout this should not occur on finite input.
    #[error("linear algebra failure: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}
