//! Spatial resampling layers: max pooling to go down the U, nearest neighbour
//! upsampling to come back up. Neither layer has learned parameters.
use ndarray::*;

use crate::{models::InternalDataRepresentation, ImagePrecision};

/// Non-overlapping max pooling with a square window (stride = window size).
///
/// Trailing rows and columns that don't fill a whole window are dropped,
/// so an odd input size is floored, as with "valid" pooling.
#[derive(Debug, Clone)]
pub struct MaxPoolLayer {
    pool_size: usize,
}

impl MaxPoolLayer {
    pub fn new(pool_size: usize) -> Self {
        debug_assert!(pool_size > 0, "Pool size of 0 passed");
        Self { pool_size }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn pool(&self, x: &InternalDataRepresentation) -> InternalDataRepresentation {
        let p = self.pool_size;
        let (batch, height, width, channels) = x.dim();
        Array4::from_shape_fn(
            (batch, height / p, width / p, channels),
            |(n, i, j, c)| {
                x.slice(s![n, i * p..(i + 1) * p, j * p..(j + 1) * p, c])
                    .fold(ImagePrecision::NEG_INFINITY, |acc, &v| acc.max(v))
            },
        )
    }
}

impl Default for MaxPoolLayer {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Nearest neighbour upsampling: every pixel is replicated into a `size x size` square.
#[derive(Debug, Clone)]
pub struct UpsampleLayer {
    size: usize,
}

impl UpsampleLayer {
    pub fn new(size: usize) -> Self {
        debug_assert!(size > 0, "Upsampling factor of 0 passed");
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn upsample(&self, x: &InternalDataRepresentation) -> InternalDataRepresentation {
        let s = self.size;
        let (batch, height, width, channels) = x.dim();
        Array4::from_shape_fn(
            (batch, height * s, width * s, channels),
            |(n, i, j, c)| x[[n, i / s, j / s, c]],
        )
    }
}

impl Default for UpsampleLayer {
    fn default() -> Self {
        Self::new(2)
    }
}
