//! Building blocks and the U-shaped segmentation network.
//!
//! Tensors are plain `ndarray` arrays in `(batch, height, width, channels)` layout.
//! Every layer takes its input by reference and returns a freshly allocated output.
pub mod activation_functions;
pub mod blocks;
pub mod concatenation;
pub mod convolutions;
pub mod initializers;
pub mod model_errors;
pub mod models;
pub mod normalization;
pub mod parameters;
pub mod sampling;
pub mod weight_loader;

use ndarray::Array4;

pub type WeightPrecision = f32;
pub type ImagePrecision = f32;

/// Convolution kernel in (kernel height, kernel width, input channels, output channels) order.
pub type ConvKernel = Array4<WeightPrecision>;

pub use model_errors::{ModelError, ModelResult};
pub use models::{build, InternalDataRepresentation, UNet, UNetConfig};
