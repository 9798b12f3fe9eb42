//! Deterministic kernel initialization schemes.
use ndarray::Array;
use rand::Rng;
use rand_distr::StandardNormal;
use serde_derive::{Deserialize, Serialize};

use crate::{ConvKernel, WeightPrecision};

/// Samples of the truncated normal that fall further than this many standard
/// deviations from zero are drawn again.
const TRUNCATION: WeightPrecision = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelInitializer {
    /// Truncated normal with stddev sqrt(2 / fan_in), He et al. 2015, https://arxiv.org/abs/1502.01852
    HeNormal,
    /// Uniform on [-limit, limit] with limit sqrt(6 / (fan_in + fan_out)), Glorot & Bengio 2010
    GlorotUniform,
}

impl Default for KernelInitializer {
    fn default() -> Self {
        KernelInitializer::HeNormal
    }
}

impl KernelInitializer {
    /// Draws a kernel of shape (kernel height, kernel width, input channels, output channels).
    pub fn kernel<R: Rng + ?Sized>(
        &self,
        shape: (usize, usize, usize, usize),
        rng: &mut R,
    ) -> ConvKernel {
        let (kernel_height, kernel_width, input_channels, output_channels) = shape;
        let receptive_field = (kernel_height * kernel_width).max(1);
        let fan_in = (receptive_field * input_channels).max(1) as WeightPrecision;
        let fan_out = (receptive_field * output_channels).max(1) as WeightPrecision;

        match self {
            KernelInitializer::HeNormal => {
                let stddev = (2.0 / fan_in).sqrt();
                Array::from_shape_fn(shape, |_| stddev * truncated_standard_normal(rng))
            }
            KernelInitializer::GlorotUniform => {
                let limit = (6.0 / (fan_in + fan_out)).sqrt();
                Array::from_shape_fn(shape, |_| rng.gen_range(-limit..limit))
            }
        }
    }
}

fn truncated_standard_normal<R: Rng + ?Sized>(rng: &mut R) -> WeightPrecision {
    loop {
        let z: WeightPrecision = rng.sample(StandardNormal);
        if z.abs() <= TRUNCATION {
            return z;
        }
    }
}
