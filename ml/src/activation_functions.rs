//! This module provides the activation functions for our networks,
//! namely Relu for the hidden layers and the logistic sigmoid for the output.
//!
//! All activation functions are exposed as a layer as well as a free function
use ndarray::*;

use crate::{models::InternalDataRepresentation, ImagePrecision};

/// Relu implementation
pub fn relu<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| x.max(0.0))
}

/// Logistic sigmoid, 1 / (1 + e^-x).
///
/// Evaluated in a form that never overflows, so the result stays in [0, 1]
/// even for very large positive or negative inputs.
pub fn sigmoid<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(sigmoid_scalar)
}

fn sigmoid_scalar(x: ImagePrecision) -> ImagePrecision {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Relu implementation.
#[derive(Debug, Clone, Default)]
pub struct ReluLayer {}

impl ReluLayer {
    pub fn new() -> Self {
        Self {}
    }

    pub fn activate(&self, x: &InternalDataRepresentation) -> InternalDataRepresentation {
        relu(x)
    }
}

/// Sigmoid as a layer, used to turn logits into per-pixel probabilities.
#[derive(Debug, Clone, Default)]
pub struct SigmoidLayer {}

impl SigmoidLayer {
    pub fn new() -> Self {
        Self {}
    }

    pub fn activate(&self, x: &InternalDataRepresentation) -> InternalDataRepresentation {
        sigmoid(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu() {
        let x = Array::from_shape_vec((1, 2, 2, 1), vec![1., -2., 3., -4.]).unwrap();
        let out = Array::from_shape_vec((1, 2, 2, 1), vec![1., 0., 3., 0.]).unwrap();
        let relu_layer = ReluLayer::new();
        assert_eq!(relu_layer.activate(&x), out);
    }

    #[test]
    fn test_sigmoid() {
        let x = array![0., 2., -2.];
        let res = sigmoid(&x);
        assert_eq!(res[0], 0.5);
        assert!((res[1] - 0.880797).abs() < 1e-6);
        assert!((res[1] + res[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_sigmoid_saturates_without_overflow() {
        let x = Array::from_shape_vec((1, 1, 4, 1), vec![1e4, -1e4, f32::MAX, f32::MIN]).unwrap();
        let res = SigmoidLayer::new().activate(&x);
        assert_eq!(res.iter().cloned().collect::<Vec<_>>(), vec![1., 0., 1., 0.]);
    }
}
