use thiserror::Error;

use crate::weight_loader::WeightError;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Invalid network configuration: {0}")]
    InvalidConfigError(String),
    #[error("Shape mismatch at {stage}: {left:?} vs {right:?}")]
    ShapeMismatchError {
        stage: String,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    #[error(
        "Parameter {name} does not fit the architecture: model expects {}, blob holds {}",
        describe_shape(.expected),
        describe_shape(.found)
    )]
    ParameterShapeMismatchError {
        name: String,
        /// Shape inside the model, `None` if the model has no such parameter
        expected: Option<Vec<usize>>,
        /// Shape inside the blob, `None` if the blob lacks the parameter
        found: Option<Vec<usize>>,
    },
    #[error("Could not read or write parameters:\n {0}")]
    WeightIoError(#[from] WeightError),
}

impl ModelError {
    pub(crate) fn shape_mismatch(stage: impl Into<String>, left: &[usize], right: &[usize]) -> Self {
        ModelError::ShapeMismatchError {
            stage: stage.into(),
            left: left.to_vec(),
            right: right.to_vec(),
        }
    }
}

fn describe_shape(shape: &Option<Vec<usize>>) -> String {
    match shape {
        Some(s) => format!("{:?}", s),
        None => "nothing".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_mismatch_message() {
        let err = ModelError::ParameterShapeMismatchError {
            name: "bottleneck.conv_0.kernel".to_string(),
            expected: Some(vec![3, 3, 8, 16]),
            found: None,
        };
        assert_eq!(
            err.to_string(),
            "Parameter bottleneck.conv_0.kernel does not fit the architecture: \
             model expects [3, 3, 8, 16], blob holds nothing"
        );
    }
}
