//! Named access to the learned parameters of layers and blocks.
//!
//! Parameters are addressed by dotted paths that mirror the block structure,
//! e.g. `encoder_1.conv_0.kernel`. These names are the keys used for persistence.
use ndarray::{ArrayViewD, ArrayViewMutD};

use crate::WeightPrecision;

pub trait Parameterized {
    /// All parameters of this block, with names scoped under `prefix`.
    fn parameters(&self, prefix: &str) -> Vec<(String, ArrayViewD<'_, WeightPrecision>)>;

    /// Mutable counterpart of `parameters`, in the same order.
    fn parameters_mut(&mut self, prefix: &str) -> Vec<(String, ArrayViewMutD<'_, WeightPrecision>)>;

    /// Total number of scalars held by this block.
    fn parameter_count(&self) -> usize {
        self.parameters("").iter().map(|(_, p)| p.len()).sum()
    }
}

/// Joins a parameter name onto a prefix. An empty prefix leaves the name as is.
pub fn scoped(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}
