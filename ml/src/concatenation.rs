use ndarray::{concatenate, Axis};

use crate::{
    model_errors::{ModelError, ModelResult},
    models::InternalDataRepresentation,
};

/// Joins two feature maps along the channel axis, `left` channels first.
///
/// Batch size, height and width of both maps have to agree exactly,
/// else a `ShapeMismatchError` naming `stage` is returned.
pub fn concatenate_channels(
    stage: &str,
    left: &InternalDataRepresentation,
    right: &InternalDataRepresentation,
) -> ModelResult<InternalDataRepresentation> {
    if left.shape()[..3] != right.shape()[..3] {
        return Err(ModelError::shape_mismatch(
            stage,
            left.shape(),
            right.shape(),
        ));
    }
    concatenate(Axis(3), &[left.view(), right.view()])
        .map_err(|_| ModelError::shape_mismatch(stage, left.shape(), right.shape()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array4};

    #[test]
    fn test_concatenate_channels() {
        let left = Array4::from_elem((2, 3, 3, 4), 1.0);
        let right = Array4::from_elem((2, 3, 3, 2), -1.0);

        let joined = concatenate_channels("decoder_0", &left, &right).unwrap();

        assert_eq!(joined.dim(), (2, 3, 3, 6));
        assert!(joined.slice(s![.., .., .., ..4]).iter().all(|v| *v == 1.0));
        assert!(joined.slice(s![.., .., .., 4..]).iter().all(|v| *v == -1.0));
    }

    #[test]
    fn test_concatenate_rejects_spatial_mismatch() {
        let left = Array4::<f32>::zeros((1, 241, 240, 8));
        let right = Array4::<f32>::zeros((1, 240, 240, 8));

        match concatenate_channels("decoder_0", &left, &right) {
            Err(ModelError::ShapeMismatchError { stage, left, right }) => {
                assert_eq!(stage, "decoder_0");
                assert_eq!(left, vec![1, 241, 240, 8]);
                assert_eq!(right, vec![1, 240, 240, 8]);
            }
            other => panic!("expected a shape mismatch, got {:?}", other.map(|a| a.dim())),
        }
    }

    #[test]
    fn test_concatenate_rejects_batch_mismatch() {
        let left = Array4::<f32>::zeros((2, 4, 4, 1));
        let right = Array4::<f32>::zeros((3, 4, 4, 1));
        assert!(concatenate_channels("decoder_1", &left, &right).is_err());
    }
}
