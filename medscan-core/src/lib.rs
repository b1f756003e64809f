#[cfg(any(feature = "ndarray", feature = "tch", feature = "candle"))]
mod cli;
mod data;
mod model;
mod predict;
mod split;
mod train;
mod utils;

#[cfg(any(feature = "ndarray", feature = "tch", feature = "candle"))]
pub use cli::run;
pub use data::{ClassIndices, ImageFolder, Subset};
pub use model::{Model, ModelConfig};
pub use predict::{
    predict, report, report_stdout, ClassProbability, Output, PredictConfig, Prediction,
};
pub use split::{partition, ClassSplit, Method, SplitSummary, Splitter, TRAIN_DIR, VALID_DIR};
pub use train::{train, DataSource, TrainingConfig};
