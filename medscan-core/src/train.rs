use crate::{
    data::{ImageBatcher, ImageDataSet, ImageFolder, Subset},
    model::{Model, ModelConfig},
    split::{TRAIN_DIR, VALID_DIR},
    utils::json_into,
};
use anyhow::{anyhow, ensure, Context, Result};
use burn::{
    data::dataloader::{DataLoaderBuilder, Dataset},
    optim::AdamConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{
        metric::{AccuracyMetric, LossMetric},
        LearnerBuilder,
    },
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

pub(crate) const CONFIG_FILE: &str = "config.json";
pub(crate) const CLASSES_FILE: &str = "classes.json";
/// The recorder appends its own extension (`model.mpk`).
pub(crate) const MODEL_FILE: &str = "model";

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimizer: AdamConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
}

/// Where the training and validation images come from.
#[derive(Debug, Clone)]
pub enum DataSource {
    /// `<root>/train/<class>` and `<root>/val/<class>`, as written by the splitter
    Split { root: PathBuf },
    /// A single class-folder root, the head of every class held out for validation
    ValidationSplit { root: PathBuf, fraction: f64 },
}

impl DataSource {
    /// Returns `(train, valid)`, checked to agree on their classes.
    pub fn load(&self) -> Result<(ImageFolder, ImageFolder)> {
        let (train, valid) = match self {
            DataSource::Split { root } => (
                ImageFolder::open(root.join(TRAIN_DIR))?,
                ImageFolder::open(root.join(VALID_DIR))?,
            ),
            DataSource::ValidationSplit { root, fraction } => {
                let folder = ImageFolder::open(root)?;
                (
                    folder.subset(Subset::Training, *fraction)?,
                    folder.subset(Subset::Validation, *fraction)?,
                )
            }
        };
        ensure!(
            train.classes() == valid.classes(),
            "training classes {:?} do not match validation classes {:?}",
            train.classes(),
            valid.classes()
        );
        ensure!(!train.is_empty(), "no training images found");
        if valid.is_empty() {
            warn!("no validation images found");
        }
        Ok((train, valid))
    }
}

fn create_artifact_dir(artifact_dir: &Path) -> Result<()> {
    // Remove existing artifacts before to get an accurate learner summary
    fs::remove_dir_all(artifact_dir).ok();
    fs::create_dir_all(artifact_dir)
        .with_context(|| format!("failed to create {}", artifact_dir.display()))
}

pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    source: DataSource,
    mut config: TrainingConfig,
    device: B::Device,
) -> Result<Model<B>> {
    let (train_folder, valid_folder) = source.load()?;
    println!("{}", train_folder.class_indices());

    config.model.num_classes = train_folder.classes().len();
    // built before the artifact dir is wiped, a bad config leaves old artifacts alone
    let model = config.model.init::<B>(&device)?;

    create_artifact_dir(artifact_dir)?;
    B::seed(config.seed);
    config
        .save(artifact_dir.join(CONFIG_FILE))
        .context("failed to save the training config")?;
    json_into(&artifact_dir.join(CLASSES_FILE), train_folder.classes())?;

    let image_size = config.model.image_size;
    let dataset_train = ImageDataSet::new(&train_folder, image_size);
    let dataset_valid = ImageDataSet::new(&valid_folder, image_size);
    ensure!(!dataset_train.is_empty(), "no readable training images found");
    info!(
        train = dataset_train.len(),
        valid = dataset_valid.len(),
        classes = config.model.num_classes,
        "datasets loaded"
    );

    let batcher_train = ImageBatcher::<B>::new(device.clone(), image_size);
    let batcher_valid = ImageBatcher::<B::InnerBackend>::new(device.clone(), image_size);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset_train);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(dataset_valid);

    let learner = LearnerBuilder::new(artifact_dir)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary()
        .build(model, config.optimizer.init(), config.learning_rate);

    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    let model_path = artifact_dir.join(MODEL_FILE);
    model_trained
        .clone()
        .save_file(&model_path, &CompactRecorder::new())
        .map_err(|err| anyhow!("failed to save the trained model: {err:?}"))?;
    info!(path = %model_path.with_extension("mpk").display(), "model saved");
    Ok(model_trained)
}
