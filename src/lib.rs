// Temporal latent-factor decomposition for omics time courses.

#![doc = include_str!("../README.md")]

pub mod adapter;
pub mod errors;
pub mod inference;
pub mod model;
pub mod ranking;
pub mod temporal;


pub use adapter::{prepare_observations, PreparedData};
pub use errors::FactorModelError;
pub use inference::{
    ConvergencePreset, ConvergenceReport, EngineState, InferenceEngine, TrainingConfig,
    TrainingStatus,
};
pub use model::{Factor, SeedStrategy, TrainedModel};
pub use ranking::{rank_features, RankedFeature, RankingDirection};
pub use temporal::TemporalPriorConfig;
