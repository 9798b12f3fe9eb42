use crate::WeightPrecision;
use ndarray::{Array, ArrayBase, ArrayD, Data, Dimension, IxDyn, OwnedRepr, ShapeError, StrideShape};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, WriteNpzError};
use serde_json::{self, Map, Value};
use std::io::{Cursor, Read, Seek, Write};
use std::{fs, path::Path};
use thiserror::Error;

pub type WeightResult<T> = Result<T, WeightError>;

#[derive(Error, Debug)]
pub enum WeightError {
    #[error("No weights with name {0} found")]
    WeightKeyError(String),
    #[error("Weight file didn't have the correct format (required: JSON dict of pairs (key, flattened array of weights))")]
    WeightFormatError,
    #[error("Weight file not found. Filesystem reported error\n {0}.")]
    WeightFileNotFoundError(#[from] std::io::Error),
    #[error("Weight file not readable. Filesystem reported error\n {0}.")]
    WeightFileNpzError(#[from] ReadNpzError),
    #[error("Weight file not writable. Filesystem reported error\n {0}.")]
    WeightFileNpzWriteError(#[from] WriteNpzError),
    #[error("Wrong shape for weight:\n {0}.")]
    WeightShapeError(#[from] ShapeError),
    #[error("Weight {name} has shape {found:?}, expected {expected:?}")]
    WeightShapeMismatchError {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

pub trait WeightLoader {
    fn get_weight<D, Sh>(
        &mut self,
        param_name: &str,
        shape: Sh,
    ) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension,
        Sh: Into<StrideShape<D>>;

    /// Names of all weights this loader can provide.
    fn weight_names(&mut self) -> WeightResult<Vec<String>>;

    /// Shape of the stored weight, as far as the storage format knows it.
    fn weight_shape(&mut self, param_name: &str) -> WeightResult<Vec<usize>>;
}

pub struct JsonWeightLoader {
    content: Map<String, Value>,
}

impl JsonWeightLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> WeightResult<JsonWeightLoader> {
        let raw_file = fs::read_to_string(path)?;
        JsonWeightLoader::parse(&raw_file)
    }

    pub fn parse(raw: &str) -> WeightResult<JsonWeightLoader> {
        let parsed: Value = serde_json::from_str(raw).map_err(|_| WeightError::WeightFormatError)?;
        match parsed {
            Value::Object(content) => Ok(JsonWeightLoader { content }),
            _ => Err(WeightError::WeightFormatError),
        }
    }

    fn raw_weights(&self, param_name: &str) -> WeightResult<&Vec<Value>> {
        let raw_arr = self
            .content
            .get(param_name)
            .ok_or_else(|| WeightError::WeightKeyError(param_name.to_string()))?;

        match raw_arr {
            Value::Array(v) => Ok(v),
            _ => Err(WeightError::WeightFormatError),
        }
    }
}

impl WeightLoader for JsonWeightLoader {
    /// Returns weights with the given name from the weight loader. Weights are stored in a FLATTENED form
    /// (to facilitate working with JSON, as then all arrays have the same length.)
    fn get_weight<D, Sh>(
        &mut self,
        param_name: &str,
        shape: Sh,
    ) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension,
        Sh: Into<StrideShape<D>>,
    {
        let raw_value_vector = self.raw_weights(param_name)?;

        let weight_vector: Result<Vec<_>, _> = raw_value_vector
            .iter()
            .map(|j| {
                j.as_f64()
                    .map(|v| v as WeightPrecision)
                    .ok_or(WeightError::WeightFormatError)
            })
            .collect();
        let weight_vector = weight_vector?;

        let shape: StrideShape<D> = shape.into();
        let expected = shape.raw_dim().slice().to_vec();
        if weight_vector.len() != expected.iter().product::<usize>() {
            return Err(WeightError::WeightShapeMismatchError {
                name: param_name.to_string(),
                expected,
                found: vec![weight_vector.len()],
            });
        }

        let weights = Array::from_shape_vec(shape, weight_vector)?;

        Ok(weights)
    }

    fn weight_names(&mut self) -> WeightResult<Vec<String>> {
        Ok(self.content.keys().cloned().collect())
    }

    fn weight_shape(&mut self, param_name: &str) -> WeightResult<Vec<usize>> {
        Ok(vec![self.raw_weights(param_name)?.len()])
    }
}

pub struct NpzWeightLoader<R>
where
    R: Seek + Read,
{
    handle: R,
}

impl NpzWeightLoader<std::fs::File> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> WeightResult<NpzWeightLoader<std::fs::File>> {
        let handle = std::fs::File::open(path)?;
        Ok(NpzWeightLoader { handle })
    }
}

impl NpzWeightLoader<Cursor<&[u8]>> {
    pub fn from_buffer(bytes_array: &[u8]) -> WeightResult<NpzWeightLoader<Cursor<&[u8]>>> {
        Ok(NpzWeightLoader {
            handle: Cursor::new(bytes_array),
        })
    }
}

impl<R> NpzWeightLoader<R>
where
    R: Seek + Read,
{
    fn read_dyn(&mut self, param_name: &str) -> WeightResult<ArrayD<WeightPrecision>> {
        // The reader in the npy package has to be mut, so we recreate.
        // Else get_weight would have to be mutable (or we have to put it
        // into a RefCell). I dislike both solutions
        let mut reader = NpzReader::new(&mut self.handle)?;
        if !reader.names()?.iter().any(|name| name == param_name) {
            return Err(WeightError::WeightKeyError(param_name.to_string()));
        }
        let arr: ArrayBase<OwnedRepr<WeightPrecision>, IxDyn> = reader.by_name(param_name)?;
        Ok(arr)
    }
}

impl<R> WeightLoader for NpzWeightLoader<R>
where
    R: Seek + Read,
{
    fn get_weight<D, Sh>(
        &mut self,
        param_name: &str,
        shape: Sh,
    ) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension,
        Sh: Into<StrideShape<D>>,
    {
        let arr = self.read_dyn(param_name)?;

        let shape: StrideShape<D> = shape.into();
        let expected = shape.raw_dim().slice();
        if arr.shape() != expected {
            return Err(WeightError::WeightShapeMismatchError {
                name: param_name.to_string(),
                expected: expected.to_vec(),
                found: arr.shape().to_vec(),
            });
        }
        Ok(arr.into_dimensionality::<D>()?)
    }

    fn weight_names(&mut self) -> WeightResult<Vec<String>> {
        let mut reader = NpzReader::new(&mut self.handle)?;
        Ok(reader.names()?)
    }

    fn weight_shape(&mut self, param_name: &str) -> WeightResult<Vec<usize>> {
        Ok(self.read_dyn(param_name)?.shape().to_vec())
    }
}

/// Writes named weights into an npz archive, the format `NpzWeightLoader` reads.
pub struct NpzWeightWriter<W>
where
    W: Write + Seek,
{
    npz: NpzWriter<W>,
}

impl NpzWeightWriter<Cursor<Vec<u8>>> {
    pub fn in_memory() -> Self {
        NpzWeightWriter {
            npz: NpzWriter::new(Cursor::new(Vec::new())),
        }
    }
}

impl NpzWeightWriter<std::fs::File> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> WeightResult<Self> {
        let handle = std::fs::File::create(path)?;
        Ok(NpzWeightWriter {
            npz: NpzWriter::new(handle),
        })
    }
}

impl<W> NpzWeightWriter<W>
where
    W: Write + Seek,
{
    pub fn add_weight<S, D>(&mut self, param_name: &str, weight: &ArrayBase<S, D>) -> WeightResult<()>
    where
        S: Data<Elem = WeightPrecision>,
        D: Dimension,
    {
        self.npz.add_array(param_name, weight)?;
        Ok(())
    }

    /// Finishes the archive and hands back the underlying writer.
    pub fn finish(self) -> WeightResult<W> {
        Ok(self.npz.finish()?)
    }
}
