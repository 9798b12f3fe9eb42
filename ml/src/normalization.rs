//! Batch normalization, Ioffe & Szegedy 2015, https://arxiv.org/abs/1502.03167
//!
//! Statistics are computed per channel over the batch and both spatial axes.
use ndarray::*;
use serde_derive::{Deserialize, Serialize};

use crate::{
    models::InternalDataRepresentation,
    parameters::{scoped, Parameterized},
    WeightPrecision,
};

/// Whether normalization layers use running statistics or the statistics of the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Inference,
    Training,
}

/// Hyperparameters shared by all normalization layers of a network.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchNormConfig {
    /// Weight of the old running statistics in every update
    pub momentum: WeightPrecision,
    /// Added to the variance before taking the square root
    pub epsilon: WeightPrecision,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        BatchNormConfig {
            momentum: 0.99,
            epsilon: 1e-3,
        }
    }
}

/// Per channel mean and (biased) variance of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatistics {
    pub mean: Array1<WeightPrecision>,
    pub variance: Array1<WeightPrecision>,
}

impl ChannelStatistics {
    pub fn of(x: &InternalDataRepresentation) -> Self {
        let channels = x.len_of(Axis(3));
        let mean = Array1::from_shape_fn(channels, |c| {
            x.index_axis(Axis(3), c).mean().unwrap_or(0.0)
        });
        let variance = Array1::from_shape_fn(channels, |c| x.index_axis(Axis(3), c).var(0.0));
        ChannelStatistics { mean, variance }
    }
}

/// Batch statistics observed during a training pass, in layer traversal order.
pub type StatisticsTape = Vec<ChannelStatistics>;

#[derive(Debug, Clone)]
pub struct BatchNormLayer {
    gamma: Array1<WeightPrecision>,
    beta: Array1<WeightPrecision>,
    moving_mean: Array1<WeightPrecision>,
    moving_variance: Array1<WeightPrecision>,
    config: BatchNormConfig,
}

impl BatchNormLayer {
    pub fn new(
        gamma: Array1<WeightPrecision>,
        beta: Array1<WeightPrecision>,
        moving_mean: Array1<WeightPrecision>,
        moving_variance: Array1<WeightPrecision>,
        config: BatchNormConfig,
    ) -> Self {
        debug_assert_eq!(gamma.len(), beta.len());
        debug_assert_eq!(gamma.len(), moving_mean.len());
        debug_assert_eq!(gamma.len(), moving_variance.len());
        Self {
            gamma,
            beta,
            moving_mean,
            moving_variance,
            config,
        }
    }

    /// Identity scale and shift, zero running mean and unit running variance.
    pub fn initialized(channels: usize, config: BatchNormConfig) -> Self {
        Self::new(
            Array1::ones(channels),
            Array1::zeros(channels),
            Array1::zeros(channels),
            Array1::ones(channels),
            config,
        )
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    pub fn moving_mean(&self) -> &Array1<WeightPrecision> {
        &self.moving_mean
    }

    pub fn moving_variance(&self) -> &Array1<WeightPrecision> {
        &self.moving_variance
    }

    /// Normalizes `x` channel-wise.
    ///
    /// In training mode the statistics of `x` itself are used and pushed onto `tape`,
    /// the running statistics are left alone until `update_moving_statistics` is called.
    pub fn normalize(
        &self,
        x: &InternalDataRepresentation,
        mode: Mode,
        tape: &mut StatisticsTape,
    ) -> InternalDataRepresentation {
        debug_assert_eq!(x.len_of(Axis(3)), self.channels());
        match mode {
            Mode::Inference => self.apply(x, &self.moving_mean, &self.moving_variance),
            Mode::Training => {
                let stats = ChannelStatistics::of(x);
                let out = self.apply(x, &stats.mean, &stats.variance);
                tape.push(stats);
                out
            }
        }
    }

    /// running = momentum * running + (1 - momentum) * batch
    pub fn update_moving_statistics(&mut self, batch: &ChannelStatistics) {
        let momentum = self.config.momentum;
        self.moving_mean
            .zip_mut_with(&batch.mean, |m, &b| *m = momentum * *m + (1.0 - momentum) * b);
        self.moving_variance
            .zip_mut_with(&batch.variance, |v, &b| *v = momentum * *v + (1.0 - momentum) * b);
    }

    fn apply(
        &self,
        x: &InternalDataRepresentation,
        mean: &Array1<WeightPrecision>,
        variance: &Array1<WeightPrecision>,
    ) -> InternalDataRepresentation {
        let epsilon = self.config.epsilon;
        let scale = &self.gamma / &variance.mapv(|v| (v + epsilon).sqrt());
        let shift = &self.beta - &(mean * &scale);
        x * &scale + &shift
    }
}

impl Parameterized for BatchNormLayer {
    fn parameters(&self, prefix: &str) -> Vec<(String, ArrayViewD<'_, WeightPrecision>)> {
        vec![
            (scoped(prefix, "gamma"), self.gamma.view().into_dyn()),
            (scoped(prefix, "beta"), self.beta.view().into_dyn()),
            (scoped(prefix, "moving_mean"), self.moving_mean.view().into_dyn()),
            (
                scoped(prefix, "moving_variance"),
                self.moving_variance.view().into_dyn(),
            ),
        ]
    }

    fn parameters_mut(&mut self, prefix: &str) -> Vec<(String, ArrayViewMutD<'_, WeightPrecision>)> {
        vec![
            (scoped(prefix, "gamma"), self.gamma.view_mut().into_dyn()),
            (scoped(prefix, "beta"), self.beta.view_mut().into_dyn()),
            (
                scoped(prefix, "moving_mean"),
                self.moving_mean.view_mut().into_dyn(),
            ),
            (
                scoped(prefix, "moving_variance"),
                self.moving_variance.view_mut().into_dyn(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_channel_batch() -> InternalDataRepresentation {
        // channel 0 holds 1 and 3, channel 1 holds -2 and -2
        Array::from_shape_vec((2, 1, 1, 2), vec![1., -2., 3., -2.]).unwrap()
    }

    #[test]
    fn test_inference_uses_running_statistics() {
        let config = BatchNormConfig {
            momentum: 0.9,
            epsilon: 0.0,
        };
        let layer = BatchNormLayer::new(
            array![2., 1.],
            array![0.5, 0.],
            array![1., -2.],
            array![4., 1.],
            config,
        );
        let mut tape = StatisticsTape::new();
        let out = layer.normalize(&two_channel_batch(), Mode::Inference, &mut tape);

        // channel 0: 2 * (x - 1) / 2 + 0.5, channel 1: (x + 2)
        assert_eq!(
            out,
            Array::from_shape_vec((2, 1, 1, 2), vec![0.5, 0., 2.5, 0.]).unwrap()
        );
        assert!(tape.is_empty());
    }

    #[test]
    fn test_training_uses_batch_statistics() {
        let config = BatchNormConfig {
            momentum: 0.5,
            epsilon: 0.0,
        };
        let mut layer = BatchNormLayer::initialized(2, config);
        let mut tape = StatisticsTape::new();
        let out = layer.normalize(&two_channel_batch(), Mode::Training, &mut tape);

        assert_eq!(out.slice(s![.., 0, 0, 0]), array![-1., 1.]);
        assert_eq!(tape.len(), 1);
        assert_eq!(tape[0].mean, array![2., -2.]);
        assert_eq!(tape[0].variance, array![1., 0.]);
        // running statistics only move once the update is applied
        assert_eq!(layer.moving_mean(), &array![0., 0.]);

        layer.update_moving_statistics(&tape[0]);
        assert_eq!(layer.moving_mean(), &array![1., -1.]);
        assert_eq!(layer.moving_variance(), &array![1., 0.5]);
    }

    #[test]
    fn test_default_config() {
        let config = BatchNormConfig::default();
        assert_eq!(config.momentum, 0.99);
        assert_eq!(config.epsilon, 1e-3);
    }
}
