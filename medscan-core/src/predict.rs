use crate::{
    data::{ImageBatcher, ImageDataSet},
    train::{TrainingConfig, CLASSES_FILE, CONFIG_FILE, MODEL_FILE},
    utils::json_from,
};
use anyhow::{anyhow, ensure, Context, Result};
use burn::{data::dataloader::DataLoaderBuilder, prelude::*, record::CompactRecorder};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    io::{self, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, Default, ValueEnum, Serialize, Deserialize)]
pub enum Output {
    #[default]
    Tty,
    Json,
}

#[derive(Config, Debug)]
pub struct PredictConfig {
    /// Directory written by a training run
    artifact_dir: PathBuf,
    /// An image, or a directory searched recursively for images
    input: PathBuf,
    #[config(default = 32)]
    batch_size: usize,
    #[config(default = 4)]
    num_workers: usize,
    /// Number of most likely classes reported per image
    #[config(default = 1)]
    top_k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassProbability {
    pub class: String,
    pub probability: f32,
}

impl fmt::Display for ClassProbability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.4})", self.class, self.probability)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub path: PathBuf,
    /// most likely first
    pub classes: Vec<ClassProbability>,
}

/// Classifies every image of `config.input` with the model of `config.artifact_dir`.
pub fn predict<B: Backend>(config: &PredictConfig, device: B::Device) -> Result<Vec<Prediction>> {
    let artifact_dir = config.artifact_dir.as_path();
    let training = TrainingConfig::load(artifact_dir.join(CONFIG_FILE))
        .map_err(|err| anyhow!("failed to load the training config: {err:?}"))?;
    let classes: Vec<String> = json_from(&artifact_dir.join(CLASSES_FILE))?;
    ensure!(
        classes.len() == training.model.num_classes,
        "{} lists {} classes but the model was trained on {}",
        CLASSES_FILE,
        classes.len(),
        training.model.num_classes
    );

    let model = training
        .model
        .init::<B>(&device)?
        .load_file(artifact_dir.join(MODEL_FILE), &CompactRecorder::new(), &device)
        .map_err(|err| anyhow!("failed to load the model checkpoint: {err:?}"))?;

    let image_size = training.model.image_size;
    let dataset = ImageDataSet::predict(&config.input, image_size)?;
    ensure!(
        !dataset.is_empty(),
        "no readable images found in {}",
        config.input.display()
    );
    let dataloader = DataLoaderBuilder::new(ImageBatcher::<B>::new(device, image_size))
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(dataset);

    let mut predictions = Vec::new();
    for batch in dataloader.iter() {
        let probabilities = model
            .predict(batch.images)
            .into_data()
            .to_vec::<f32>()
            .map_err(|err| anyhow!("failed to read the model output: {err:?}"))?;
        for (path, row) in batch.paths.into_iter().zip(probabilities.chunks(classes.len())) {
            predictions.push(Prediction {
                path,
                classes: rank(row, &classes, config.top_k),
            });
        }
    }
    predictions.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(predictions)
}

/// The `top_k` (at least one) most likely classes, in descending probability.
fn rank(probabilities: &[f32], classes: &[String], top_k: usize) -> Vec<ClassProbability> {
    let mut ranked = probabilities
        .iter()
        .zip(classes)
        .map(|(p, class)| ClassProbability {
            class: class.clone(),
            probability: *p,
        })
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    ranked.truncate(top_k.max(1));
    ranked
}

pub fn report(predictions: &[Prediction], output: Output, mut writer: impl Write) -> Result<()> {
    match output {
        Output::Tty => {
            for prediction in predictions {
                let classes = prediction
                    .classes
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                writeln!(writer, "{}: {}", prediction.path.display(), classes)?;
            }
        }
        Output::Json => {
            let output = predictions
                .iter()
                .map(|p| (p.path.as_path(), &p.classes))
                .collect::<BTreeMap<&Path, _>>();
            serde_json::to_writer_pretty(&mut writer, &output)
                .context("failed to serialize predictions")?;
            writeln!(writer)?;
        }
    }
    Ok(())
}

pub fn report_stdout(predictions: &[Prediction], output: Output) -> Result<()> {
    report(predictions, output, io::stdout().lock())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::ModelConfig, utils::json_into};
    use burn::{backend::NdArray, optim::AdamConfig};
    use image::{Rgb, RgbImage};
    use std::fs;

    type TestBackend = NdArray<f32>;

    fn classes() -> Vec<String> {
        ["Malaria", "Normal", "Pneumonia"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[test]
    fn rank_orders_and_truncates() {
        let ranked = rank(&[0.2, 0.7, 0.1], &classes(), 2);
        assert_eq!(
            ranked,
            vec![
                ClassProbability { class: "Normal".into(), probability: 0.7 },
                ClassProbability { class: "Malaria".into(), probability: 0.2 },
            ]
        );
        assert_eq!(rank(&[0.2, 0.7, 0.1], &classes(), 0).len(), 1);
        assert_eq!(rank(&[0.2, 0.7, 0.1], &classes(), 10).len(), 3);
    }

    #[test]
    fn report_formats() {
        let predictions = vec![Prediction {
            path: "scan.png".into(),
            classes: vec![ClassProbability {
                class: "Normal".into(),
                probability: 0.5,
            }],
        }];

        let mut tty = Vec::new();
        report(&predictions, Output::Tty, &mut tty).unwrap();
        assert_eq!(String::from_utf8(tty).unwrap(), "scan.png: Normal (0.5000)\n");

        let mut json = Vec::new();
        report(&predictions, Output::Json, &mut json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["scan.png"][0]["class"], "Normal");
    }

    #[test]
    fn predict_with_saved_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact_dir = dir.path().join("artifact");
        let images = dir.path().join("images");
        fs::create_dir_all(&artifact_dir).unwrap();
        fs::create_dir_all(images.join("nested")).unwrap();
        for (i, name) in ["a.png", "b.jpg", "nested/c.png"].iter().enumerate() {
            RgbImage::from_pixel(20, 14, Rgb([40 * i as u8, 10, 200]))
                .save(images.join(name))
                .unwrap();
        }
        fs::write(images.join("notes.txt"), b"").unwrap();

        let device = Default::default();
        let model_config = ModelConfig::new().with_num_classes(3).with_image_size(16);
        TrainingConfig::new(model_config.clone(), AdamConfig::new())
            .save(artifact_dir.join(CONFIG_FILE))
            .unwrap();
        json_into(&artifact_dir.join(CLASSES_FILE), &classes()).unwrap();
        model_config
            .init::<TestBackend>(&device)
            .unwrap()
            .save_file(artifact_dir.join(MODEL_FILE), &CompactRecorder::new())
            .unwrap();

        let config = PredictConfig::new(artifact_dir, images.clone())
            .with_batch_size(2)
            .with_num_workers(1)
            .with_top_k(3);
        let predictions = predict::<TestBackend>(&config, device).unwrap();

        let paths = predictions.iter().map(|p| p.path.clone()).collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![images.join("a.png"), images.join("b.jpg"), images.join("nested/c.png")]
        );
        for prediction in predictions {
            assert_eq!(prediction.classes.len(), 3);
            let total = prediction.classes.iter().map(|c| c.probability).sum::<f32>();
            assert!((total - 1.0).abs() < 1e-4);
            assert!(prediction.classes[0].probability >= prediction.classes[2].probability);
        }
    }

    #[test]
    fn predict_requires_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = PredictConfig::new(dir.path().join("missing"), dir.path().to_path_buf());
        assert!(predict::<TestBackend>(&config, Default::default()).is_err());
    }
}
