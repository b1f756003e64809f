use crate::utils::{class_dirs, images_walk};
use anyhow::{bail, ensure, Context, Result};
use clap::ValueEnum;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// Name of the training tree under a split root.
pub const TRAIN_DIR: &str = "train";
/// Name of the validation tree under a split root.
pub const VALID_DIR: &str = "val";

/// How an image lands in the split tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Method {
    #[default]
    Copy,
    SoftLink,
    /// note: hard links are not allowed between different file systems
    HardLink,
}

impl Method {
    fn apply(self, from: &Path, to: &Path) -> io::Result<()> {
        match self {
            Method::Copy => fs::copy(from, to).map(|_| {}),
            Method::SoftLink => {
                let from = from.canonicalize()?;
                #[cfg(target_family = "unix")]
                let res = std::os::unix::fs::symlink(from, to);
                #[cfg(target_family = "windows")]
                let res = std::os::windows::fs::symlink_file(from, to);
                res
            }
            Method::HardLink => fs::hard_link(from, to),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSplit {
    pub class: String,
    pub train: usize,
    pub valid: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitSummary {
    /// `<output>/train` was already there, nothing was touched.
    AlreadySplit,
    Split(Vec<ClassSplit>),
}

/// Splits a class-folder dataset into `<output>/train` and `<output>/val` once.
#[derive(Debug)]
pub struct Splitter {
    source: PathBuf,
    output: PathBuf,
    valid_ratio: f64,
    seed: u64,
    method: Method,
}

impl Splitter {
    pub fn new(
        source: PathBuf,
        output: PathBuf,
        valid_ratio: f64,
        seed: u64,
        method: Method,
    ) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&valid_ratio),
            "expected the validation ratio to be within [0, 1], got {valid_ratio}"
        );
        Ok(Self {
            source,
            output,
            valid_ratio,
            seed,
            method,
        })
    }

    pub fn train_dir(&self) -> PathBuf {
        self.output.join(TRAIN_DIR)
    }

    pub fn valid_dir(&self) -> PathBuf {
        self.output.join(VALID_DIR)
    }

    pub fn split(&self) -> Result<SplitSummary> {
        let train_root = self.train_dir();
        if train_root.exists() {
            info!(path = %train_root.display(), "dataset already split, skipping");
            return Ok(SplitSummary::AlreadySplit);
        }
        ensure!(
            self.source.is_dir(),
            "dataset directory {} does not exist",
            self.source.display()
        );
        let classes = class_dirs(&self.source)?;
        if classes.is_empty() {
            bail!("no class directories found in {}", self.source.display());
        }

        let valid_root = self.valid_dir();
        let valid_existed = valid_root.exists();
        match self.split_classes(classes) {
            Ok(summary) => Ok(SplitSummary::Split(summary)),
            Err(err) => {
                // a half-written train tree would make the next run skip the split
                fs::remove_dir_all(&train_root).ok();
                if !valid_existed {
                    fs::remove_dir_all(&valid_root).ok();
                }
                Err(err)
            }
        }
    }

    fn split_classes(&self, classes: Vec<(String, PathBuf)>) -> Result<Vec<ClassSplit>> {
        let (train_root, valid_root) = (self.train_dir(), self.valid_dir());
        let mut summary = Vec::with_capacity(classes.len());
        for (class, dir) in classes {
            let (train, valid) = partition(images_walk(&dir, false), self.valid_ratio, self.seed);
            if train.is_empty() {
                warn!(class = %class, "no training images left for class");
            }
            self.materialize(&train, &train_root.join(&class))?;
            self.materialize(&valid, &valid_root.join(&class))?;
            info!(class = %class, train = train.len(), valid = valid.len(), "class split");
            summary.push(ClassSplit {
                class,
                train: train.len(),
                valid: valid.len(),
            });
        }
        Ok(summary)
    }

    fn materialize(&self, files: &[PathBuf], to_dir: &Path) -> Result<()> {
        fs::create_dir_all(to_dir)
            .with_context(|| format!("failed to create {}", to_dir.display()))?;
        for from in files {
            let Some(name) = from.file_name() else {
                continue;
            };
            let to = to_dir.join(name);
            self.method.apply(from, &to).with_context(|| {
                format!(
                    "failed to {:?} {} to {}",
                    self.method,
                    from.display(),
                    to.display()
                )
            })?;
        }
        Ok(())
    }
}

/// Shuffles `items` with a generator seeded by `seed` and returns `(train, valid)`.
///
/// The validation part takes the first `ceil(len * valid_ratio)` shuffled items.
/// Every call restarts the generator, so equal inputs always split the same way.
pub fn partition<T>(mut items: Vec<T>, valid_ratio: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);
    let num_valid = ((items.len() as f64 * valid_ratio).ceil() as usize).min(items.len());
    let train = items.split_off(num_valid);
    (train, items)
}
