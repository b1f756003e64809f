use crate::{
    predict, report_stdout, train, DataSource, Method, ModelConfig, Output, PredictConfig,
    SplitSummary, Splitter, TrainingConfig,
};
use anyhow::Result;
use burn::{backend::Autodiff, optim::AdamConfig};
use clap::{CommandFactory as _, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    subcmd: SubCmd,
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Split a class-folder dataset into train/ and val/ trees (only once)
    Split {
        /// Root of the dataset, one subdirectory per class
        #[arg(short, long, default_value = "dataset")]
        dataset: PathBuf,
        /// Directory receiving train/ and val/
        #[arg(short, long, default_value = "data")]
        output: PathBuf,
        /// Fraction of every class held out for validation
        #[arg(short, long, default_value = "0.2")]
        valid_ratio: f64,
        /// How images land in the split trees
        #[arg(short, long, default_value = "copy")]
        method: Method,
        /// Random seed for the shuffle
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// Train the CNN and save it to the artifact directory
    Train {
        /// A split root holding train/ and val/, or a class-folder root with --validation-split
        #[arg(short, long, default_value = "data")]
        data: PathBuf,
        /// Split this class-folder dataset into --data first (skipped if already split)
        #[arg(long, conflicts_with = "validation_split")]
        dataset: Option<PathBuf>,
        /// Hold out this fraction of every class of --data for validation instead of
        /// reading train/ and val/
        #[arg(long)]
        validation_split: Option<f64>,
        /// Directory to save artifacts (The directory will be recreated if it exists)
        #[arg(short, long, default_value = "artifact")]
        artifact_dir: PathBuf,
        /// Side length images are resized to
        #[arg(short, long, default_value = "224")]
        image_size: usize,
        #[arg(short, long, default_value = "10")]
        num_epochs: usize,
        #[arg(short, long, default_value = "32")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "4")]
        num_workers: usize,
        /// Learning rate for the Adam optimizer
        #[arg(short, long, default_value = "1.0e-3")]
        learning_rate: f64,
        /// Random seed for reproducibility
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// Classify images with a trained model
    Predict {
        /// Directory produced by the train subcommand
        #[arg(short, long, default_value = "artifact")]
        artifact_dir: PathBuf,
        /// Method to output the predictions
        #[arg(short, long, default_value = "tty")]
        output: Output,
        #[arg(short, long, default_value = "32")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "4")]
        num_workers: usize,
        /// Number of most likely classes to report per image
        #[arg(short = 'k', long, default_value = "1")]
        top_k: usize,
        /// An image or a directory of images
        input: PathBuf,
    },
    /// generate auto completion script
    GenCompletion {
        /// shell name
        shell: Shell,
    },
}

#[cfg(feature = "tch")]
type MyBackend = burn::backend::LibTorch<f32, i8>;
#[cfg(all(feature = "candle", not(feature = "tch")))]
type MyBackend = burn::backend::Candle<f32, u8>;
#[cfg(not(any(feature = "tch", feature = "candle")))]
type MyBackend = burn::backend::NdArray<f32>;

type MyAutodiffBackend = Autodiff<MyBackend>;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,medscan_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

pub fn run() -> Result<()> {
    #[cfg(all(feature = "tch", target_os = "macos"))]
    let device = burn::backend::libtorch::LibTorchDevice::Mps;
    #[cfg(all(feature = "tch", not(target_os = "macos")))]
    let device = burn::backend::libtorch::LibTorchDevice::Cuda(0);

    #[cfg(all(feature = "candle", not(feature = "tch"), target_os = "macos"))]
    let device = burn::backend::candle::CandleDevice::Metal(0);
    #[cfg(all(feature = "candle", not(feature = "tch"), not(target_os = "macos")))]
    let device = burn::backend::candle::CandleDevice::Cuda(0);

    #[cfg(not(any(feature = "tch", feature = "candle")))]
    let device = burn::backend::ndarray::NdArrayDevice::Cpu;

    let args = Cli::parse();
    init_logging();
    match args.subcmd {
        SubCmd::Split {
            dataset,
            output,
            valid_ratio,
            method,
            seed,
        } => {
            let splitter = Splitter::new(dataset, output, valid_ratio, seed, method)?;
            if let SplitSummary::Split(classes) = splitter.split()? {
                for class in classes {
                    println!("{}\t{}\t{}", class.class, class.train, class.valid);
                }
            }
        }
        SubCmd::Train {
            data,
            dataset,
            validation_split,
            artifact_dir,
            image_size,
            num_epochs,
            batch_size,
            num_workers,
            learning_rate,
            seed,
        } => {
            if let Some(dataset) = dataset {
                Splitter::new(dataset, data.clone(), 0.2, seed, Method::Copy)?.split()?;
            }
            let source = match validation_split {
                Some(fraction) => DataSource::ValidationSplit {
                    root: data,
                    fraction,
                },
                None => DataSource::Split { root: data },
            };
            train::<MyAutodiffBackend>(
                &artifact_dir,
                source,
                TrainingConfig::new(
                    ModelConfig::new().with_image_size(image_size),
                    AdamConfig::new(),
                )
                .with_num_epochs(num_epochs)
                .with_batch_size(batch_size)
                .with_num_workers(num_workers)
                .with_learning_rate(learning_rate)
                .with_seed(seed),
                device,
            )?;
        }
        SubCmd::Predict {
            artifact_dir,
            output,
            batch_size,
            num_workers,
            top_k,
            input,
        } => {
            let predictions = predict::<MyBackend>(
                &PredictConfig::new(artifact_dir, input)
                    .with_batch_size(batch_size)
                    .with_num_workers(num_workers)
                    .with_top_k(top_k),
                device,
            )?;
            report_stdout(&predictions, output)?;
        }
        SubCmd::GenCompletion { shell } => {
            generate(shell, &mut Cli::command(), "medscan", &mut std::io::stdout());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn train_defaults_match_the_scripts() {
        let cli = Cli::try_parse_from(["medscan", "train"]).unwrap();
        let SubCmd::Train {
            data,
            image_size,
            num_epochs,
            batch_size,
            validation_split,
            ..
        } = cli.subcmd
        else {
            panic!("expected the train subcommand");
        };
        assert_eq!(data, PathBuf::from("data"));
        assert_eq!((image_size, num_epochs, batch_size), (224, 10, 32));
        assert_eq!(validation_split, None);
    }

    #[test]
    fn dataset_conflicts_with_validation_split() {
        let res = Cli::try_parse_from([
            "medscan",
            "train",
            "--dataset",
            "dataset",
            "--validation-split",
            "0.2",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn split_method_parses() {
        let cli = Cli::try_parse_from(["medscan", "split", "-m", "soft-link"]).unwrap();
        assert!(matches!(
            cli.subcmd,
            SubCmd::Split {
                method: Method::SoftLink,
                ..
            }
        ));
    }
}
