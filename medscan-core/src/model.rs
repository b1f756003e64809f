use crate::data::ImageBatch;
use anyhow::{anyhow, Result};
use burn::prelude::*;
use burn::tensor::{activation::softmax, backend::AutodiffBackend};
use burn::train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep};
use nn::{
    conv::{Conv2d, Conv2dConfig},
    loss::CrossEntropyLossConfig,
    pool::{MaxPool2d, MaxPool2dConfig},
    Dropout, DropoutConfig, Linear, LinearConfig, Relu,
};

const KERNEL_SIZE: usize = 3;
const POOL_SIZE: usize = 2;

/// Two conv/pool blocks followed by a dense head.
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    dense: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> Model<B> {
    /// # Shapes
    ///   - Images [batch_size, 3, image_size, image_size]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(images);
        let x = self.pool.forward(self.activation.forward(x));
        let x = self.conv2.forward(x);
        let x = self.pool.forward(self.activation.forward(x));

        let [batch_size, channels, height, width] = x.dims();
        let x = x.reshape([batch_size, channels * height * width]);

        let x = self.activation.forward(self.dense.forward(x));
        let x = self.dropout.forward(x);
        self.output.forward(x) // logits
    }

    /// Class probabilities, `[batch_size, num_classes]`.
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn forward_classification(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        let output = self.forward(batch.images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), batch.targets.clone());
        ClassificationOutput::new(loss, output, batch.targets)
    }
}

impl<B: AutodiffBackend> TrainStep<ImageBatch<B>, ClassificationOutput<B>> for Model<B> {
    fn step(&self, batch: ImageBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let classify = self.forward_classification(batch);
        TrainOutput::new(self, classify.loss.backward(), classify)
    }
}

impl<B: Backend> ValidStep<ImageBatch<B>, ClassificationOutput<B>> for Model<B> {
    fn step(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch)
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Replaced by the number of classes found in the training data.
    #[config(default = 4)]
    pub num_classes: usize,
    /// Images are resized to `image_size`x`image_size`.
    #[config(default = 224)]
    pub image_size: usize,
    #[config(default = 32)]
    pub conv1_channels: usize,
    #[config(default = 64)]
    pub conv2_channels: usize,
    #[config(default = 128)]
    pub hidden_size: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl ModelConfig {
    /// Width of the flattened feature map entering the dense head, `None` when
    /// `image_size` is too small to survive both blocks.
    pub fn flattened_size(&self) -> Option<usize> {
        let block = |size: usize| size.checked_sub(KERNEL_SIZE - 1).map(|s| s / POOL_SIZE);
        let side = block(block(self.image_size)?)?;
        (side > 0).then_some(self.conv2_channels * side * side)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Model<B>> {
        let flattened = self
            .flattened_size()
            .ok_or_else(|| anyhow!("image size {} is too small for the model", self.image_size))?;
        if self.num_classes == 0 {
            return Err(anyhow!("the model needs at least one class"));
        }
        let kernel = [KERNEL_SIZE, KERNEL_SIZE];
        Ok(Model {
            conv1: Conv2dConfig::new([3, self.conv1_channels], kernel).init(device),
            conv2: Conv2dConfig::new([self.conv1_channels, self.conv2_channels], kernel)
                .init(device),
            pool: MaxPool2dConfig::new([POOL_SIZE, POOL_SIZE])
                .with_strides([POOL_SIZE, POOL_SIZE])
                .init(),
            dense: LinearConfig::new(flattened, self.hidden_size).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn flattened_size() {
        let config = ModelConfig::new();
        // 224 -> 222 -> 111 -> 109 -> 54
        assert_eq!(config.flattened_size(), Some(64 * 54 * 54));
        // 10 -> 8 -> 4 -> 2 -> 1
        assert_eq!(config.clone().with_image_size(10).flattened_size(), Some(64));
        assert_eq!(config.with_image_size(9).flattened_size(), None);
    }

    #[test]
    fn init_rejects_tiny_images_and_no_classes() {
        let device = Default::default();
        assert!(ModelConfig::new()
            .with_image_size(4)
            .init::<TestBackend>(&device)
            .is_err());
        assert!(ModelConfig::new()
            .with_num_classes(0)
            .init::<TestBackend>(&device)
            .is_err());
    }

    #[test]
    fn forward_shapes_and_probabilities() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_num_classes(3)
            .with_image_size(32)
            .init::<TestBackend>(&device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::ones([2, 3, 32, 32], &device);

        assert_eq!(model.forward(images.clone()).dims(), [2, 3]);

        let probabilities = model.predict(images);
        let sums = probabilities.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn forward_classification_reports_loss() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_num_classes(2)
            .with_image_size(16)
            .init::<TestBackend>(&device)
            .unwrap();
        let batch = ImageBatch {
            images: Tensor::zeros([3, 3, 16, 16], &device),
            targets: Tensor::from_data([0i64, 1, 1], &device),
            paths: vec!["a".into(), "b".into(), "c".into()],
        };
        let output = model.forward_classification(batch);
        assert_eq!(output.output.dims(), [3, 2]);
        let loss = output.loss.into_scalar();
        assert!(loss.is_finite() && loss > 0.0);
    }
}
