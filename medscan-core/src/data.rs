use crate::utils::{class_dirs, images_walk, is_image};
use anyhow::{bail, ensure, Context, Result};
use burn::{
    data::dataloader::{batcher::Batcher, Dataset},
    prelude::*,
    tensor::ElementConversion,
};
use image::imageops::FilterType;
use std::{
    fmt,
    path::{Path, PathBuf},
};
use tracing::warn;

const CHANNELS: usize = 3;

/// Which side of an in-place validation split to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subset {
    Training,
    Validation,
}

/// A class-folder dataset: every subdirectory of the root is a class.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    classes: Vec<String>,
    /// grouped by label, sorted by path within a label
    samples: Vec<(PathBuf, usize)>,
}

impl ImageFolder {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        ensure!(
            root.is_dir(),
            "dataset directory {} does not exist",
            root.display()
        );
        let dirs = class_dirs(root)?;
        if dirs.is_empty() {
            bail!("no class directories found in {}", root.display());
        }
        let mut classes = Vec::with_capacity(dirs.len());
        let mut samples = Vec::new();
        for (label, (name, dir)) in dirs.into_iter().enumerate() {
            samples.extend(images_walk(&dir, true).into_iter().map(|p| (p, label)));
            classes.push(name);
        }
        Ok(Self { classes, samples })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[(PathBuf, usize)] {
        &self.samples
    }

    pub fn class_indices(&self) -> ClassIndices<'_> {
        ClassIndices(&self.classes)
    }

    /// Cuts every class at `floor(len * fraction)`: the head is the validation
    /// subset, the tail the training subset. Classes are kept even when a side
    /// ends up empty, so both subsets share the same label mapping.
    pub fn subset(&self, subset: Subset, fraction: f64) -> Result<Self> {
        ensure!(
            (0.0..1.0).contains(&fraction),
            "expected the validation split to be within [0, 1), got {fraction}"
        );
        let mut samples = Vec::new();
        for label in 0..self.classes.len() {
            let class = self
                .samples
                .iter()
                .filter(|(_, l)| *l == label)
                .cloned()
                .collect::<Vec<_>>();
            let cut = (class.len() as f64 * fraction) as usize;
            match subset {
                Subset::Validation => samples.extend(class.into_iter().take(cut)),
                Subset::Training => samples.extend(class.into_iter().skip(cut)),
            }
        }
        Ok(Self {
            classes: self.classes.clone(),
            samples,
        })
    }
}

/// Renders as `Class indices: {"Malaria": 0, "Normal": 1}`.
pub struct ClassIndices<'a>(&'a [String]);

impl fmt::Display for ClassIndices<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Class indices: {{")?;
        for (i, class) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{class:?}: {i}")?;
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Clone)]
pub struct ImageItem {
    /// `[height, width, channel]` interleaved, rescaled to `[0, 1]`
    pixels: Vec<f32>,
    label: Option<usize>,
    path: PathBuf,
}

pub struct ImageDataSet {
    inner: Vec<(PathBuf, Option<usize>)>,
    size: usize,
}

impl ImageDataSet {
    pub fn new(folder: &ImageFolder, size: usize) -> Self {
        Self::checked(
            folder
                .samples()
                .iter()
                .map(|(path, label)| (path.clone(), Some(*label)))
                .collect(),
            size,
        )
    }

    /// A single image file, or every image below a directory.
    pub fn predict(path: &Path, size: usize) -> Result<Self> {
        let paths = if path.is_dir() {
            images_walk(path, true)
        } else if path.is_file() {
            ensure!(is_image(path), "{} is not an image file", path.display());
            vec![path.to_path_buf()]
        } else {
            bail!("{} does not exist", path.display());
        };
        Ok(Self::checked(
            paths.into_iter().map(|p| (p, None)).collect(),
            size,
        ))
    }

    /// Drops files that fail to fully decode, so `get` only meets decodable images.
    fn checked(inner: Vec<(PathBuf, Option<usize>)>, size: usize) -> Self {
        let inner = inner
            .into_iter()
            .filter(|(path, _)| match image::open(path) {
                Ok(_) => true,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable image");
                    false
                }
            })
            .collect();
        Self { inner, size }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Dataset<ImageItem> for ImageDataSet {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.inner.get(index).map(|(path, label)| ImageItem {
            pixels: open_image(path, self.size)
                .unwrap_or_else(|err| panic!("Failed to load image {}: {err:#}", path.display())),
            label: *label,
            path: path.clone(),
        })
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    size: usize,
}

#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    /// `[batch_size, 3, size, size]`
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    pub paths: Vec<PathBuf>,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, size: usize) -> Self {
        Self { device, size }
    }
}

impl<B: Backend> Batcher<ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ImageBatch<B> {
        let images = items
            .iter()
            .map(|item| {
                TensorData::new(item.pixels.clone(), [self.size, self.size, CHANNELS])
            })
            .map(|data| {
                Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), &self.device)
                    .swap_dims(2, 1) // [H, C, W]
                    .swap_dims(1, 0) // [C, H, W]
            })
            .collect();
        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    TensorData::from([(item.label.unwrap_or_default() as i64).elem::<B::IntElem>()]),
                    &self.device,
                )
            })
            .collect();

        let images = Tensor::stack(images, 0);
        let targets = Tensor::cat(targets, 0);
        let paths = items.into_iter().map(|item| item.path).collect();

        ImageBatch {
            images,
            targets,
            paths,
        }
    }
}

/// Decodes `path` as RGB, resizes it to `size`x`size` with nearest neighbour
/// sampling and rescales every channel by 1/255.
pub(crate) fn open_image(path: &Path, size: usize) -> Result<Vec<f32>> {
    let size = size as u32;
    let img = image::open(path).with_context(|| format!("failed to decode {}", path.display()))?;
    Ok(img
        .resize_exact(size, size, FilterType::Nearest)
        .to_rgb8()
        .into_raw()
        .into_iter()
        .map(|p| p as f32 / 255.0)
        .collect())
}
