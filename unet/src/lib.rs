//! Glue between image files and the network: turning pictures into batches,
//! probability maps back into pictures, and reading the network configuration.
use image::{DynamicImage, GrayImage, Luma};
use log::info;
use ml::{
    models::{InternalDataRepresentation, UNet, UNetConfig},
    weight_loader::{JsonWeightLoader, NpzWeightLoader},
    ModelError,
};
use ndarray::{Array3, ArrayView2, Axis};
use ndarray_npy::{read_npy, ReadNpyError, WriteNpyError};
use nshare::{ToNdarray2, ToNdarray3};
use std::{ffi::OsStr, fs, path::Path};
use structopt::StructOpt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Unrecognized file type of {0}.")]
    UnsupportedFormat(String),
    #[error("Images can only be turned into 1 or 3 channel batches, the network expects {0}.")]
    UnsupportedChannels(usize),
    #[error("Array has {found} channels, the network expects {expected}.")]
    ChannelMismatch { expected: usize, found: usize },
    #[error("Could not decode image:\n {0}")]
    Image(#[from] image::ImageError),
    #[error("Could not read array:\n {0}")]
    Npy(#[from] ReadNpyError),
    #[error("Could not write array:\n {0}")]
    NpyWrite(#[from] WriteNpyError),
    #[error("Could not access file:\n {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration is not valid JSON:\n {0}")]
    Config(#[from] serde_json::Error),
    #[error(transparent)]
    Model(#[from] ModelError),
}

pub type InputResult<T> = Result<T, InputError>;

/// Network shape flags, each overriding the corresponding field of the configuration.
#[derive(Debug, Default, StructOpt)]
pub struct ConfigOverrides {
    /// JSON file holding a full network configuration
    #[structopt(long = "config", parse(from_os_str))]
    pub config: Option<std::path::PathBuf>,
    /// Input height, must be divisible by 2^depth
    #[structopt(long = "height")]
    pub height: Option<usize>,
    /// Input width, must be divisible by 2^depth
    #[structopt(long = "width")]
    pub width: Option<usize>,
    /// Number of input channels
    #[structopt(long = "channels")]
    pub channels: Option<usize>,
    /// Number of downsampling steps
    #[structopt(long = "depth")]
    pub depth: Option<usize>,
    /// Channel width of the first stage
    #[structopt(long = "base-width")]
    pub base_width: Option<usize>,
    /// Seed of the parameter initialization
    #[structopt(long = "seed")]
    pub seed: Option<u64>,
}

impl ConfigOverrides {
    /// Reads the configuration file (or takes the defaults) and applies the flags on top.
    pub fn resolve(&self) -> InputResult<UNetConfig> {
        let base = match &self.config {
            Some(path) => load_config(path)?,
            None => UNetConfig::default(),
        };
        Ok(self.apply(base))
    }

    pub fn apply(&self, mut config: UNetConfig) -> UNetConfig {
        if let Some(height) = self.height {
            config.input_height = height;
        }
        if let Some(width) = self.width {
            config.input_width = width;
        }
        if let Some(channels) = self.channels {
            config.input_channels = channels;
        }
        if let Some(depth) = self.depth {
            config.depth = depth;
        }
        if let Some(base_width) = self.base_width {
            config.base_width = base_width;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> InputResult<UNetConfig> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn save_config<P: AsRef<Path>>(path: P, config: &UNetConfig) -> InputResult<()> {
    fs::write(path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}

/// Returns the image as a pre-scaled batch of one, ready to be put into the network
pub fn image_to_batch(img: &DynamicImage, channels: usize) -> InputResult<InternalDataRepresentation> {
    let hwc: Array3<u8> = match channels {
        1 => img.to_luma8().into_ndarray2().insert_axis(Axis(2)),
        // we get the image in PT layout, which is (C,H,W), but need (H,W,C)
        3 => img
            .to_rgb8()
            .into_ndarray3()
            .permuted_axes([1, 2, 0])
            .as_standard_layout()
            .into_owned(),
        other => return Err(InputError::UnsupportedChannels(other)),
    };
    Ok(hwc.mapv(|x| x as f32 / 255.0).insert_axis(Axis(0)))
}

/// Wraps a (H, W, C) array into a batch of one.
pub fn array_to_batch(
    arr: Array3<f32>,
    channels: usize,
) -> InputResult<InternalDataRepresentation> {
    let found = arr.len_of(Axis(2));
    if found != channels {
        return Err(InputError::ChannelMismatch {
            expected: channels,
            found,
        });
    }
    Ok(arr.insert_axis(Axis(0)))
}

/// Reads an image file or an `.npy` array as a batch of one.
pub fn read_input(path: &Path, channels: usize) -> InputResult<InternalDataRepresentation> {
    match path.extension().and_then(OsStr::to_str) {
        Some("npy") => array_to_batch(read_npy(path)?, channels),
        Some("png") | Some("jpg") | Some("jpeg") => image_to_batch(&image::open(path)?, channels),
        _ => Err(InputError::UnsupportedFormat(path.display().to_string())),
    }
}

/// Loads weights into `model`, picking the storage format from the file extension.
pub fn load_weights(model: &mut UNet, path: &Path) -> InputResult<()> {
    match path.extension().and_then(OsStr::to_str) {
        Some("npz") => {
            let mut loader = NpzWeightLoader::from_path(path).map_err(ModelError::from)?;
            model.load_parameters(&mut loader)?
        }
        Some("json") => {
            let mut loader = JsonWeightLoader::new(path).map_err(ModelError::from)?;
            model.load_parameters(&mut loader)?
        }
        _ => return Err(InputError::UnsupportedFormat(path.display().to_string())),
    }
    info!("Weights loaded from {}", path.display());
    Ok(())
}

/// Turns a probability into a pixel value. With a threshold, the mask is binary.
pub fn to_pixel(p: &f32, threshold: Option<f32>) -> u8 {
    match threshold {
        Some(t) if *p >= t => 255,
        Some(_) => 0,
        None => (p.clamp(0.0, 1.0) * 255.0).round() as u8,
    }
}

/// Turns a (H, W) probability map into a grayscale image.
pub fn probabilities_to_image(map: ArrayView2<f32>, threshold: Option<f32>) -> GrayImage {
    let (height, width) = map.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([to_pixel(&map[[y as usize, x as usize]], threshold)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn test_to_pixel() {
        assert_eq!(to_pixel(&0.0, None), 0);
        assert_eq!(to_pixel(&1.0, None), 255);
        assert_eq!(to_pixel(&0.5, None), 128);
        assert_eq!(to_pixel(&0.49, Some(0.5)), 0);
        assert_eq!(to_pixel(&0.5, Some(0.5)), 255);
    }

    #[test]
    fn test_rgb_image_to_batch() {
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(2, 1, Rgb([255, 0, 51]));
        let batch = image_to_batch(&DynamicImage::ImageRgb8(img), 3).unwrap();

        assert_eq!(batch.dim(), (1, 2, 3, 3));
        assert_eq!(batch[[0, 1, 2, 0]], 1.0);
        assert_eq!(batch[[0, 1, 2, 2]], 0.2);
        assert_eq!(batch[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_gray_batch_and_unsupported_channels() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 2, Luma([255])));
        let batch = image_to_batch(&img, 1).unwrap();
        assert_eq!(batch.dim(), (1, 2, 4, 1));
        assert!(batch.iter().all(|v| *v == 1.0));

        assert!(matches!(
            image_to_batch(&img, 2),
            Err(InputError::UnsupportedChannels(2))
        ));
    }

    #[test]
    fn test_array_to_batch_checks_channels() {
        let arr = Array3::<f32>::zeros((4, 4, 2));
        assert_eq!(array_to_batch(arr.clone(), 2).unwrap().dim(), (1, 4, 4, 2));
        assert!(matches!(
            array_to_batch(arr, 3),
            Err(InputError::ChannelMismatch {
                expected: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn test_probabilities_to_image() {
        let map = array![[0.0, 1.0, 0.2], [0.8, 0.5, 0.0]];
        let img = probabilities_to_image(map.view(), Some(0.5));
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(1, 0), &Luma([255]));
        assert_eq!(img.get_pixel(2, 0), &Luma([0]));
        assert_eq!(img.get_pixel(0, 1), &Luma([255]));
        assert_eq!(img.get_pixel(1, 1), &Luma([255]));
    }

    #[test]
    fn test_config_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unet.json");
        let stored = UNetConfig {
            depth: 2,
            base_width: 8,
            ..UNetConfig::default()
        };
        save_config(&path, &stored).unwrap();

        let overrides = ConfigOverrides {
            config: Some(path),
            height: Some(64),
            seed: Some(3),
            ..ConfigOverrides::default()
        };
        let config = overrides.resolve().unwrap();

        assert_eq!(config.depth, 2);
        assert_eq!(config.base_width, 8);
        assert_eq!(config.input_height, 64);
        assert_eq!(config.input_width, 256);
        assert_eq!(config.seed, 3);

        dir.close().unwrap();
    }

    #[test]
    fn test_load_weights_from_exported_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weights.npz");
        let source = ml::build(4, 4, 1, 1, 2).unwrap();
        fs::write(&path, source.export_parameters().unwrap()).unwrap();

        let mut target = UNet::new(UNetConfig {
            seed: 9,
            ..source.config().clone()
        })
        .unwrap();
        load_weights(&mut target, &path).unwrap();

        let x = Array3::<f32>::ones((4, 4, 1)).insert_axis(Axis(0));
        assert_eq!(source.forward(&x).unwrap(), target.forward(&x).unwrap());

        assert!(matches!(
            load_weights(&mut target, &dir.path().join("weights.bin")),
            Err(InputError::UnsupportedFormat(_))
        ));
        dir.close().unwrap();
    }

    #[test]
    fn test_read_input_rejects_unknown_extension() {
        assert!(matches!(
            read_input(Path::new("mask.tiff"), 3),
            Err(InputError::UnsupportedFormat(_))
        ));
    }
}
