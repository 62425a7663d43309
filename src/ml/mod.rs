pub mod burn_model;
pub mod inference;
pub mod ml_model;
pub mod pipeline;

pub use burn_model::{load_classifier, prepare_base_model, BurnClassifier, DEFAULT_LEARNING_RATE};
pub use inference::{Prediction, PredictionPipeline};
pub use ml_model::{CnnClassifier, ModelConfig};
