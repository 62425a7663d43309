pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{
    AppConfig, DeviceType, PredictionSettings, TrackingSettings, TrainingConfig, TrainingSettings,
};
pub use model_metadata::ModelMetadata;
pub use model_storage::{load_model_with_metadata, log_metadata_info, save_model_with_metadata};
