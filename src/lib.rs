//! t-SNE embedding with analytic per-feature saliency.
//!
//! Three pieces: [`affinity`] calibrates per-point Gaussian bandwidths to a
//! target perplexity, [`embedding`] runs the momentum gradient descent that
//! produces the 2D map, and [`saliency`] differentiates the converged
//! embedding with respect to the input features by applying the implicit
//! function theorem to the optimizer's stationarity condition.

pub mod affinity;
pub mod embedding;
pub mod saliency;
mod utils;

pub use affinity::{calibrate_affinities, CalibratedAffinities};
pub use embedding::{optimize_embedding, EmbeddingResult, Tsne, TsneBuilder};
pub use saliency::{
    compute_sensitivities, feature_importance, point_feature_magnitudes, scaled_gradient_field,
};
