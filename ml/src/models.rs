//! The U-shaped segmentation network, Ronneberger et al. 2015, https://arxiv.org/abs/1505.04597
//!
//! The topology is held as a depth-indexed arena of stages: encoder stages `0..D`,
//! the bottleneck at depth `D` and decoder stages `0..D` that are run deepest first.
//! Skip connections are recorded per depth during the forward pass.
use std::collections::HashSet;
use std::fmt;

use log::{debug, info, trace};
use ndarray::*;
use rand::{rngs::StdRng, SeedableRng};
use serde_derive::{Deserialize, Serialize};

use crate::{
    blocks::{Block, BlockInit, ConvBlock, OutputProjection, UpBlock},
    concatenation::concatenate_channels,
    initializers::KernelInitializer,
    model_errors::{ModelError, ModelResult},
    normalization::{BatchNormConfig, BatchNormLayer, Mode, StatisticsTape},
    parameters::{scoped, Parameterized},
    sampling::MaxPoolLayer,
    weight_loader::{NpzWeightLoader, NpzWeightWriter, WeightError, WeightLoader},
    ImagePrecision, WeightPrecision,
};

/// Batch of images or feature maps, (batch, height, width, channels).
pub type InternalDataRepresentation = Array4<ImagePrecision>;

/// General model trait for segmentation: a batch of images in,
/// a batch of single channel probability maps of the same size out.
pub trait SegmentationModel {
    fn forward_pass(
        &self,
        input: &InternalDataRepresentation,
    ) -> ModelResult<InternalDataRepresentation>;
}

/// Everything needed to build a `UNet`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UNetConfig {
    pub input_height: usize,
    pub input_width: usize,
    pub input_channels: usize,
    /// Number of downsampling steps
    pub depth: usize,
    /// Channel width of the shallowest stage, doubled at every step down
    pub base_width: usize,
    pub seed: u64,
    pub kernel_initializer: KernelInitializer,
    pub batch_norm: BatchNormConfig,
}

impl Default for UNetConfig {
    fn default() -> Self {
        UNetConfig {
            input_height: 256,
            input_width: 256,
            input_channels: 3,
            depth: 4,
            base_width: 64,
            seed: 0,
            kernel_initializer: KernelInitializer::default(),
            batch_norm: BatchNormConfig::default(),
        }
    }
}

impl UNetConfig {
    /// Checks every precondition of construction.
    pub fn validate(&self) -> ModelResult<()> {
        if self.depth < 1 {
            return Err(invalid("depth must be at least 1".to_string()));
        }
        if self.base_width < 1 {
            return Err(invalid("base width must be at least 1".to_string()));
        }
        if self.input_channels < 1 {
            return Err(invalid("input needs at least one channel".to_string()));
        }
        if self.input_height < 1 || self.input_width < 1 {
            return Err(invalid(format!(
                "input size {}x{} is empty",
                self.input_height, self.input_width
            )));
        }
        let factor = self.scale_factor().ok_or_else(|| {
            invalid(format!("depth {} is too large", self.depth))
        })?;
        if self.base_width.checked_mul(factor).is_none() {
            return Err(invalid(format!(
                "base width {} overflows at depth {}",
                self.base_width, self.depth
            )));
        }
        for (name, size) in &[("height", self.input_height), ("width", self.input_width)] {
            if size % factor != 0 {
                return Err(invalid(format!(
                    "input {} {} is not divisible by 2^{} = {}",
                    name, size, self.depth, factor
                )));
            }
        }
        let bn = self.batch_norm;
        if !(bn.epsilon > 0.0) || !(0.0..=1.0).contains(&bn.momentum) {
            return Err(invalid(format!(
                "batch norm needs epsilon > 0 and momentum in [0, 1], got {:?}",
                bn
            )));
        }
        Ok(())
    }

    /// Channel width of the stage at `depth`, C0 * 2^depth.
    /// Only meaningful for validated configs.
    pub fn width_at(&self, depth: usize) -> usize {
        self.base_width << depth
    }

    /// 2^depth, or `None` on overflow
    fn scale_factor(&self) -> Option<usize> {
        if self.depth >= usize::BITS as usize {
            None
        } else {
            Some(1usize << self.depth)
        }
    }

    fn block_init(&self) -> BlockInit {
        BlockInit {
            kernel_initializer: self.kernel_initializer,
            batch_norm: self.batch_norm,
        }
    }
}

fn invalid(reason: String) -> ModelError {
    ModelError::InvalidConfigError(reason)
}

/// Builds a U-Net with default initialization for the given input shape.
pub fn build(
    input_height: usize,
    input_width: usize,
    input_channels: usize,
    depth: usize,
    base_width: usize,
) -> ModelResult<UNet> {
    UNet::new(UNetConfig {
        input_height,
        input_width,
        input_channels,
        depth,
        base_width,
        ..UNetConfig::default()
    })
}

/// One level of the decoder: upsample + project, join with the skip connection, ConvBlock.
#[derive(Debug, Clone)]
struct DecoderStage {
    depth: usize,
    up: UpBlock,
    block: ConvBlock,
}

#[derive(Debug, Clone)]
pub struct UNet {
    config: UNetConfig,
    /// Indexed by depth
    encoder: Vec<ConvBlock>,
    pool: MaxPoolLayer,
    bottleneck: ConvBlock,
    /// Indexed by depth, run in reverse
    decoder: Vec<DecoderStage>,
    output: OutputProjection,
}

impl UNet {
    /// Assembles the network. Parameters are drawn in forward traversal order
    /// from an rng seeded with `config.seed`.
    pub fn new(config: UNetConfig) -> ModelResult<UNet> {
        config.validate()?;
        let depth = config.depth;
        let init = config.block_init();
        let mut rng = StdRng::seed_from_u64(config.seed);

        let mut channels = config.input_channels;
        let mut encoder = Vec::with_capacity(depth);
        for d in 0..depth {
            let width = config.width_at(d);
            encoder.push(ConvBlock::new(channels, width, init, &mut rng));
            channels = width;
        }

        let bottleneck = ConvBlock::new(channels, config.width_at(depth), init, &mut rng);
        channels = config.width_at(depth);

        let mut decoder = Vec::with_capacity(depth);
        for d in (0..depth).rev() {
            let width = config.width_at(d);
            let up = UpBlock::new(channels, width, init, &mut rng);
            // skip connection and upsampled map contribute `width` channels each
            let block = ConvBlock::new(2 * width, width, init, &mut rng);
            decoder.push(DecoderStage {
                depth: d,
                up,
                block,
            });
            channels = width;
        }
        decoder.reverse();

        let output = OutputProjection::new(channels, init, &mut rng);

        let model = UNet {
            config,
            encoder,
            pool: MaxPoolLayer::default(),
            bottleneck,
            decoder,
            output,
        };
        debug!(
            "Built U-Net of depth {} for {}x{}x{} inputs with {} parameters",
            depth,
            model.config.input_height,
            model.config.input_width,
            model.config.input_channels,
            model.parameter_count()
        );
        Ok(model)
    }

    pub fn config(&self) -> &UNetConfig {
        &self.config
    }

    pub fn depth(&self) -> usize {
        self.config.depth
    }

    pub fn base_width(&self) -> usize {
        self.config.base_width
    }

    pub fn encoder_block(&self, depth: usize) -> Option<&ConvBlock> {
        self.encoder.get(depth)
    }

    pub fn bottleneck(&self) -> &ConvBlock {
        &self.bottleneck
    }

    pub fn decoder_block(&self, depth: usize) -> Option<&ConvBlock> {
        self.decoder.get(depth).map(|stage| &stage.block)
    }

    pub fn upsampling_block(&self, depth: usize) -> Option<&UpBlock> {
        self.decoder.get(depth).map(|stage| &stage.up)
    }

    /// Inference pass: normalization uses the running statistics.
    /// Returns per-pixel probabilities of shape (batch, height, width, 1).
    pub fn forward(
        &self,
        input: &InternalDataRepresentation,
    ) -> ModelResult<InternalDataRepresentation> {
        let mut tape = StatisticsTape::new();
        self.propagate(input, Mode::Inference, &mut tape)
    }

    /// Training pass: normalization uses batch statistics, and once the pass
    /// has succeeded the running statistics of every normalization layer are updated.
    pub fn forward_train(
        &mut self,
        input: &InternalDataRepresentation,
    ) -> ModelResult<InternalDataRepresentation> {
        let mut tape = StatisticsTape::new();
        let output = self.propagate(input, Mode::Training, &mut tape)?;

        let norms = self.batch_norms_mut();
        debug_assert_eq!(norms.len(), tape.len());
        for (norm, stats) in norms.into_iter().zip(tape.iter()) {
            norm.update_moving_statistics(stats);
        }
        Ok(output)
    }

    fn propagate(
        &self,
        input: &InternalDataRepresentation,
        mode: Mode,
        tape: &mut StatisticsTape,
    ) -> ModelResult<InternalDataRepresentation> {
        self.check_input(input)?;

        let mut skips: Vec<InternalDataRepresentation> = Vec::with_capacity(self.depth());
        let mut x = input.to_owned();
        for (depth, block) in self.encoder.iter().enumerate() {
            let features = block.forward_pass(&x, mode, tape);
            trace!("encoder_{}: {:?}", depth, features.shape());
            let (_, height, width, _) = features.dim();
            if height < self.pool.pool_size() || width < self.pool.pool_size() {
                return Err(ModelError::shape_mismatch(
                    format!("encoder_{} downsampling", depth),
                    &[height, width],
                    &[self.pool.pool_size(), self.pool.pool_size()],
                ));
            }
            x = self.pool.forward_pass(&features, mode, tape);
            skips.push(features);
        }

        x = self.bottleneck.forward_pass(&x, mode, tape);
        trace!("bottleneck: {:?}", x.shape());

        for stage in self.decoder.iter().rev() {
            let stage_name = format!("decoder_{}", stage.depth);
            let upsampled = stage.up.forward_pass(&x, mode, tape);
            let joined = concatenate_channels(&stage_name, &skips[stage.depth], &upsampled)?;
            x = stage.block.forward_pass(&joined, mode, tape);
            trace!("{}: {:?}", stage_name, x.shape());
        }

        Ok(self.output.forward_pass(&x, mode, tape))
    }

    fn check_input(&self, input: &InternalDataRepresentation) -> ModelResult<()> {
        let (batch, height, width, channels) = input.dim();
        if batch == 0 || height == 0 || width == 0 {
            return Err(ModelError::shape_mismatch(
                "input (empty batch)",
                input.shape(),
                &[batch.max(1), height.max(1), width.max(1), channels],
            ));
        }
        if channels != self.config.input_channels {
            return Err(ModelError::shape_mismatch(
                "input channels",
                input.shape(),
                &[batch, height, width, self.config.input_channels],
            ));
        }
        Ok(())
    }

    /// Normalization layers in the order a forward pass applies them.
    fn batch_norms_mut(&mut self) -> Vec<&mut BatchNormLayer> {
        let mut norms = Vec::new();
        for block in self.encoder.iter_mut() {
            norms.extend(block.batch_norms_mut());
        }
        norms.extend(self.bottleneck.batch_norms_mut());
        for stage in self.decoder.iter_mut().rev() {
            norms.extend(stage.block.batch_norms_mut());
        }
        norms
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters("").into_iter().map(|(name, _)| name).collect()
    }

    /// Serializes all parameters into an in-memory npz archive keyed by parameter name.
    pub fn export_parameters(&self) -> ModelResult<Vec<u8>> {
        let mut writer = NpzWeightWriter::in_memory();
        for (name, weight) in self.parameters("") {
            writer.add_weight(&name, &weight)?;
        }
        let blob = writer.finish()?.into_inner();
        info!(
            "Exported {} parameters ({} bytes)",
            self.parameter_count(),
            blob.len()
        );
        Ok(blob)
    }

    /// Restores parameters from a blob produced by `export_parameters`.
    pub fn import_parameters(&mut self, blob: &[u8]) -> ModelResult<()> {
        let mut loader = NpzWeightLoader::from_buffer(blob)?;
        self.load_parameters(&mut loader)
    }

    /// Replaces every parameter with the one of the same name from `loader`.
    ///
    /// The source has to hold exactly the parameters of this architecture with
    /// matching shapes, otherwise `ParameterShapeMismatchError` is returned.
    /// On any error the model is left unchanged.
    pub fn load_parameters<L: WeightLoader>(&mut self, loader: &mut L) -> ModelResult<()> {
        let mut staged = self.clone();
        let mut known = HashSet::new();

        for (name, mut target) in staged.parameters_mut("") {
            let expected = target.shape().to_vec();
            let weight = loader
                .get_weight(&name, IxDyn(&expected))
                .map_err(|err| match err {
                    WeightError::WeightKeyError(name) => ModelError::ParameterShapeMismatchError {
                        name,
                        expected: Some(expected.clone()),
                        found: None,
                    },
                    WeightError::WeightShapeMismatchError { name, found, .. } => {
                        ModelError::ParameterShapeMismatchError {
                            name,
                            expected: Some(expected.clone()),
                            found: Some(found),
                        }
                    }
                    other => other.into(),
                })?;
            target.assign(&weight);
            known.insert(name);
        }

        for name in loader.weight_names()? {
            if !known.contains(&name) {
                let found = loader.weight_shape(&name)?;
                return Err(ModelError::ParameterShapeMismatchError {
                    name,
                    expected: None,
                    found: Some(found),
                });
            }
        }

        *self = staged;
        info!("Loaded {} parameters", self.parameter_count());
        Ok(())
    }

    /// One row per stage, shallowest encoder stage first.
    pub fn summary(&self) -> ArchitectureSummary {
        let resolution = |depth: usize| {
            (
                self.config.input_height >> depth,
                self.config.input_width >> depth,
            )
        };
        let mut stages = Vec::with_capacity(2 * self.depth() + 2);
        for (depth, block) in self.encoder.iter().enumerate() {
            stages.push(StageSummary::new(StageRole::Encoder, depth, resolution(depth), block));
        }
        stages.push(StageSummary::new(
            StageRole::Bottleneck,
            self.depth(),
            resolution(self.depth()),
            &self.bottleneck,
        ));
        for stage in self.decoder.iter().rev() {
            stages.push(StageSummary::new(
                StageRole::Decoder,
                stage.depth,
                resolution(stage.depth),
                &stage.block,
            ));
        }
        stages.push(StageSummary {
            role: StageRole::Output,
            depth: 0,
            height: self.config.input_height,
            width: self.config.input_width,
            input_channels: self.output.input_channels(),
            output_channels: 1,
        });
        ArchitectureSummary {
            stages,
            parameter_count: self.parameter_count(),
        }
    }
}

impl SegmentationModel for UNet {
    fn forward_pass(
        &self,
        input: &InternalDataRepresentation,
    ) -> ModelResult<InternalDataRepresentation> {
        self.forward(input)
    }
}

impl Parameterized for UNet {
    fn parameters(&self, prefix: &str) -> Vec<(String, ArrayViewD<'_, WeightPrecision>)> {
        let mut params = Vec::new();
        for (depth, block) in self.encoder.iter().enumerate() {
            params.extend(block.parameters(&scoped(prefix, &format!("encoder_{}", depth))));
        }
        params.extend(self.bottleneck.parameters(&scoped(prefix, "bottleneck")));
        for stage in self.decoder.iter().rev() {
            let stage_prefix = scoped(prefix, &format!("decoder_{}", stage.depth));
            params.extend(stage.up.parameters(&scoped(&stage_prefix, "up")));
            params.extend(stage.block.parameters(&scoped(&stage_prefix, "block")));
        }
        params.extend(self.output.parameters(&scoped(prefix, "output_projection")));
        params
    }

    fn parameters_mut(&mut self, prefix: &str) -> Vec<(String, ArrayViewMutD<'_, WeightPrecision>)> {
        let mut params = Vec::new();
        for (depth, block) in self.encoder.iter_mut().enumerate() {
            params.extend(block.parameters_mut(&scoped(prefix, &format!("encoder_{}", depth))));
        }
        params.extend(self.bottleneck.parameters_mut(&scoped(prefix, "bottleneck")));
        for stage in self.decoder.iter_mut().rev() {
            let stage_prefix = scoped(prefix, &format!("decoder_{}", stage.depth));
            params.extend(stage.up.parameters_mut(&scoped(&stage_prefix, "up")));
            params.extend(stage.block.parameters_mut(&scoped(&stage_prefix, "block")));
        }
        params.extend(self.output.parameters_mut(&scoped(prefix, "output_projection")));
        params
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Encoder,
    Bottleneck,
    Decoder,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSummary {
    pub role: StageRole,
    pub depth: usize,
    pub height: usize,
    pub width: usize,
    pub input_channels: usize,
    pub output_channels: usize,
}

impl StageSummary {
    fn new(role: StageRole, depth: usize, (height, width): (usize, usize), block: &ConvBlock) -> Self {
        StageSummary {
            role,
            depth,
            height,
            width,
            input_channels: block.input_channels(),
            output_channels: block.output_channels(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchitectureSummary {
    pub stages: Vec<StageSummary>,
    pub parameter_count: usize,
}

impl fmt::Display for ArchitectureSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<12}{:>6}{:>14}{:>10}{:>10}",
            "stage", "depth", "resolution", "in", "out"
        )?;
        for stage in &self.stages {
            writeln!(
                f,
                "{:<12}{:>6}{:>14}{:>10}{:>10}",
                format!("{:?}", stage.role),
                stage.depth,
                format!("{}x{}", stage.height, stage.width),
                stage.input_channels,
                stage.output_channels
            )?;
        }
        write!(f, "parameters: {}", self.parameter_count)
    }
}
