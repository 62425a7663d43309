pub mod augmentation;
pub mod data_generator;
pub mod image_dataset;

pub use augmentation::{AugmentationSpec, RandomTransform};
pub use data_generator::{
    load_image, Batch, DataGenerator, DataGeneratorSpec, DataPipeline, EpochBatches, RESCALE,
    VALIDATION_SPLIT,
};
pub use image_dataset::{ImageDirectory, Sample, Subset};
