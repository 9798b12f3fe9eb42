//! Composite building blocks of the U-Net.
//!
//! Every block maps one feature map to another. Concatenation with the skip
//! connection joins two maps and therefore lives in `concatenation`.
use ndarray::{ArrayViewD, ArrayViewMutD};
use rand::Rng;

use crate::{
    activation_functions::{ReluLayer, SigmoidLayer},
    convolutions::{ConvolutionLayer, Padding},
    initializers::KernelInitializer,
    models::InternalDataRepresentation,
    normalization::{BatchNormConfig, BatchNormLayer, Mode, StatisticsTape},
    parameters::{scoped, Parameterized},
    sampling::{MaxPoolLayer, UpsampleLayer},
    WeightPrecision,
};

/// A transformation of a feature map. Blocks containing batch normalization
/// push their batch statistics onto `tape` in training mode.
pub trait Block {
    fn forward_pass(
        &self,
        x: &InternalDataRepresentation,
        mode: Mode,
        tape: &mut StatisticsTape,
    ) -> InternalDataRepresentation;
}

/// How freshly built blocks get their parameters.
#[derive(Debug, Clone, Copy)]
pub struct BlockInit {
    pub kernel_initializer: KernelInitializer,
    pub batch_norm: BatchNormConfig,
}

/// 3x3conv,1,width -> batch norm -> relu, twice.
/// Spatial size is preserved by same padding.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    conv_0: ConvolutionLayer,
    norm_0: BatchNormLayer,
    conv_1: ConvolutionLayer,
    norm_1: BatchNormLayer,
    relu: ReluLayer,
}

impl ConvBlock {
    pub fn new<R: Rng + ?Sized>(
        input_channels: usize,
        width: usize,
        init: BlockInit,
        rng: &mut R,
    ) -> Self {
        let conv_0 = ConvolutionLayer::initialized(
            3,
            input_channels,
            width,
            Padding::Same,
            init.kernel_initializer,
            rng,
        );
        let conv_1 =
            ConvolutionLayer::initialized(3, width, width, Padding::Same, init.kernel_initializer, rng);
        Self {
            conv_0,
            norm_0: BatchNormLayer::initialized(width, init.batch_norm),
            conv_1,
            norm_1: BatchNormLayer::initialized(width, init.batch_norm),
            relu: ReluLayer::new(),
        }
    }

    pub fn input_channels(&self) -> usize {
        self.conv_0.input_channels()
    }

    pub fn output_channels(&self) -> usize {
        self.conv_1.output_channels()
    }

    /// Normalization layers in the order they are applied.
    pub fn batch_norms_mut(&mut self) -> Vec<&mut BatchNormLayer> {
        vec![&mut self.norm_0, &mut self.norm_1]
    }
}

impl Block for ConvBlock {
    fn forward_pass(
        &self,
        x: &InternalDataRepresentation,
        mode: Mode,
        tape: &mut StatisticsTape,
    ) -> InternalDataRepresentation {
        let x = self.conv_0.convolve(x);
        let x = self.relu.activate(&self.norm_0.normalize(&x, mode, tape));
        let x = self.conv_1.convolve(&x);
        self.relu.activate(&self.norm_1.normalize(&x, mode, tape))
    }
}

impl Parameterized for ConvBlock {
    fn parameters(&self, prefix: &str) -> Vec<(String, ArrayViewD<'_, WeightPrecision>)> {
        let mut params = self.conv_0.parameters(&scoped(prefix, "conv_0"));
        params.extend(self.norm_0.parameters(&scoped(prefix, "norm_0")));
        params.extend(self.conv_1.parameters(&scoped(prefix, "conv_1")));
        params.extend(self.norm_1.parameters(&scoped(prefix, "norm_1")));
        params
    }

    fn parameters_mut(&mut self, prefix: &str) -> Vec<(String, ArrayViewMutD<'_, WeightPrecision>)> {
        let mut params = self.conv_0.parameters_mut(&scoped(prefix, "conv_0"));
        params.extend(self.norm_0.parameters_mut(&scoped(prefix, "norm_0")));
        params.extend(self.conv_1.parameters_mut(&scoped(prefix, "conv_1")));
        params.extend(self.norm_1.parameters_mut(&scoped(prefix, "norm_1")));
        params
    }
}

/// Nearest neighbour upsampling followed by a linear 2x2conv,1,width
/// that brings the channel count down to the one of the matching skip connection.
#[derive(Debug, Clone)]
pub struct UpBlock {
    upsample: UpsampleLayer,
    projection: ConvolutionLayer,
}

impl UpBlock {
    pub fn new<R: Rng + ?Sized>(
        input_channels: usize,
        width: usize,
        init: BlockInit,
        rng: &mut R,
    ) -> Self {
        Self {
            upsample: UpsampleLayer::default(),
            projection: ConvolutionLayer::initialized(
                2,
                input_channels,
                width,
                Padding::Same,
                init.kernel_initializer,
                rng,
            ),
        }
    }

    pub fn input_channels(&self) -> usize {
        self.projection.input_channels()
    }

    pub fn output_channels(&self) -> usize {
        self.projection.output_channels()
    }
}

impl Block for UpBlock {
    fn forward_pass(
        &self,
        x: &InternalDataRepresentation,
        _mode: Mode,
        _tape: &mut StatisticsTape,
    ) -> InternalDataRepresentation {
        self.projection.convolve(&self.upsample.upsample(x))
    }
}

impl Parameterized for UpBlock {
    fn parameters(&self, prefix: &str) -> Vec<(String, ArrayViewD<'_, WeightPrecision>)> {
        self.projection.parameters(&scoped(prefix, "projection"))
    }

    fn parameters_mut(&mut self, prefix: &str) -> Vec<(String, ArrayViewMutD<'_, WeightPrecision>)> {
        self.projection.parameters_mut(&scoped(prefix, "projection"))
    }
}

/// 1x1conv,1,1 followed by a sigmoid: per-pixel probability of class membership.
#[derive(Debug, Clone)]
pub struct OutputProjection {
    projection: ConvolutionLayer,
    sigmoid: SigmoidLayer,
}

impl OutputProjection {
    pub fn new<R: Rng + ?Sized>(input_channels: usize, init: BlockInit, rng: &mut R) -> Self {
        Self {
            projection: ConvolutionLayer::initialized(
                1,
                input_channels,
                1,
                Padding::Valid,
                init.kernel_initializer,
                rng,
            ),
            sigmoid: SigmoidLayer::new(),
        }
    }

    pub fn input_channels(&self) -> usize {
        self.projection.input_channels()
    }
}

impl Block for OutputProjection {
    fn forward_pass(
        &self,
        x: &InternalDataRepresentation,
        _mode: Mode,
        _tape: &mut StatisticsTape,
    ) -> InternalDataRepresentation {
        self.sigmoid.activate(&self.projection.convolve(x))
    }
}

impl Parameterized for OutputProjection {
    fn parameters(&self, prefix: &str) -> Vec<(String, ArrayViewD<'_, WeightPrecision>)> {
        self.projection.parameters(prefix)
    }

    fn parameters_mut(&mut self, prefix: &str) -> Vec<(String, ArrayViewMutD<'_, WeightPrecision>)> {
        self.projection.parameters_mut(prefix)
    }
}

impl Block for MaxPoolLayer {
    fn forward_pass(
        &self,
        x: &InternalDataRepresentation,
        _mode: Mode,
        _tape: &mut StatisticsTape,
    ) -> InternalDataRepresentation {
        self.pool(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use rand::{rngs::StdRng, SeedableRng};

    fn init() -> BlockInit {
        BlockInit {
            kernel_initializer: KernelInitializer::HeNormal,
            batch_norm: BatchNormConfig::default(),
        }
    }

    fn ramp(shape: (usize, usize, usize, usize)) -> InternalDataRepresentation {
        Array4::from_shape_fn(shape, |(n, i, j, c)| {
            ((n * 31 + i * 7 + j * 3 + c) % 11) as f32 / 11.0 - 0.4
        })
    }

    #[test]
    fn test_conv_block_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let block = ConvBlock::new(3, 8, init(), &mut rng);
        let out = block.forward_pass(&ramp((2, 6, 4, 3)), Mode::Inference, &mut Vec::new());

        assert_eq!((block.input_channels(), block.output_channels()), (3, 8));
        assert_eq!(out.dim(), (2, 6, 4, 8));
        assert!(out.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_conv_block_records_statistics_in_training() {
        let mut rng = StdRng::seed_from_u64(0);
        let block = ConvBlock::new(2, 4, init(), &mut rng);
        let mut tape = StatisticsTape::new();

        block.forward_pass(&ramp((2, 4, 4, 2)), Mode::Training, &mut tape);

        assert_eq!(tape.len(), 2);
        assert!(tape.iter().all(|stats| stats.mean.len() == 4));
    }

    #[test]
    fn test_up_block_doubles_and_projects() {
        let mut rng = StdRng::seed_from_u64(3);
        let block = UpBlock::new(16, 8, init(), &mut rng);
        let out = block.forward_pass(&ramp((1, 3, 5, 16)), Mode::Inference, &mut Vec::new());
        assert_eq!(out.dim(), (1, 6, 10, 8));
        assert_eq!(block.parameter_count(), 2 * 2 * 16 * 8 + 8);
    }

    #[test]
    fn test_output_projection_is_probability() {
        let mut rng = StdRng::seed_from_u64(5);
        let block = OutputProjection::new(4, init(), &mut rng);
        let x = ramp((2, 3, 3, 4)).mapv(|v| v * 1e3);
        let out = block.forward_pass(&x, Mode::Inference, &mut Vec::new());
        assert_eq!(out.dim(), (2, 3, 3, 1));
        assert!(out.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_conv_block_parameter_names() {
        let mut rng = StdRng::seed_from_u64(0);
        let block = ConvBlock::new(1, 2, init(), &mut rng);
        let names: Vec<String> = block
            .parameters("encoder_0")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names.len(), 12);
        assert_eq!(names[0], "encoder_0.conv_0.kernel");
        assert_eq!(names[5], "encoder_0.norm_0.moving_variance");
        assert_eq!(names[11], "encoder_0.norm_1.moving_variance");
    }
}
