//! Command line interface to build U-Nets, store their parameters and segment images.

use env_logger::Builder;
use log::{info, warn};
use ml::models::UNet;
use ndarray::Axis;
use ndarray_npy::write_npy;
use quicli::prelude::*;
use std::{fs, path::PathBuf};
use structopt::StructOpt;
use unet::{load_weights, probabilities_to_image, read_input, save_config, ConfigOverrides};

/// Prints the stages of a network together with their shapes
#[derive(Debug, StructOpt)]
struct SummaryOpts {
    #[structopt(flatten)]
    network: ConfigOverrides,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Builds a freshly initialized network and stores its parameters
#[derive(Debug, StructOpt)]
struct InitOpts {
    /// Output path of the parameter archive (.npz)
    #[structopt(parse(from_os_str))]
    output: PathBuf,
    /// Also writes the resolved configuration as JSON to this path
    #[structopt(long = "save-config", parse(from_os_str))]
    save_config: Option<PathBuf>,
    #[structopt(flatten)]
    network: ConfigOverrides,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Segments an image
#[derive(Debug, StructOpt)]
struct PredictOpts {
    /// Path to the input (.png, .jpg or .npy in height, width, channels layout)
    #[structopt(parse(from_os_str))]
    image: PathBuf,
    /// Parameters of the network (.npz or .json). Without them, the network is freshly initialized.
    #[structopt(short = "w", long = "weights", parse(from_os_str))]
    weights: Option<PathBuf>,
    /// Output path of the mask, writes to /path/to/image-mask.png if not available
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: Option<PathBuf>,
    /// Binarizes the mask at this probability
    #[structopt(short = "t", long = "threshold")]
    threshold: Option<f32>,
    /// Also stores the raw probabilities as .npy
    #[structopt(long = "probabilities", parse(from_os_str))]
    probabilities: Option<PathBuf>,
    #[structopt(flatten)]
    network: ConfigOverrides,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Build and run U-Net segmentation networks.
#[derive(Debug, StructOpt)]
#[structopt(name = "unet")]
enum Unet {
    #[structopt(name = "summary", about = "Prints the architecture of a network.")]
    Summary(SummaryOpts),
    #[structopt(
        name = "init",
        about = "Initializes a network and exports its parameters."
    )]
    Init(InitOpts),
    #[structopt(
        name = "predict",
        about = "Computes the segmentation mask of an image."
    )]
    Predict(PredictOpts),
}

/// Trait for the subcommands that unet uses
trait UnetOpts {
    /// Performs the subcommand
    fn run(&self) -> CliResult;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .init();

        Ok(())
    }
}

impl UnetOpts for SummaryOpts {
    fn run(&self) -> CliResult {
        let model = UNet::new(self.network.resolve()?)?;
        println!("{}", model.summary());
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl UnetOpts for InitOpts {
    fn run(&self) -> CliResult {
        let config = self.network.resolve()?;
        let model = UNet::new(config.clone())?;
        fs::write(&self.output, model.export_parameters()?)?;
        info!("Parameters written to {}", self.output.display());

        if let Some(path) = &self.save_config {
            save_config(path, &config)?;
            info!("Configuration written to {}", path.display());
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl UnetOpts for PredictOpts {
    fn run(&self) -> CliResult {
        let mut config = self.network.resolve()?;
        let batch = read_input(&self.image, config.input_channels)?;
        // the network is built for the size of the image at hand
        let (_, height, width, _) = batch.dim();
        config.input_height = height;
        config.input_width = width;

        let mut model = UNet::new(config)?;
        match &self.weights {
            Some(path) => load_weights(&mut model, path)?,
            None => warn!("No weights given, predicting with a freshly initialized network"),
        }

        let probabilities = model.forward(&batch)?;
        let map = probabilities.index_axis(Axis(0), 0).index_axis_move(Axis(2), 0);

        let mut alternate_output_name = self.image.clone();
        let stem = self
            .image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        alternate_output_name.set_file_name(stem + "-mask.png");
        let filepath = match &self.output {
            Some(p) => p,
            None => &alternate_output_name,
        };
        probabilities_to_image(map.view(), self.threshold).save(filepath)?;
        info!("Mask written to {}", filepath.display());

        if let Some(path) = &self.probabilities {
            write_npy(path, &map)?;
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl UnetOpts for Unet {
    fn run(&self) -> CliResult {
        match self {
            Unet::Summary(c) => c.run(),
            Unet::Init(c) => c.run(),
            Unet::Predict(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            Unet::Summary(c) => c.get_verbosity(),
            Unet::Init(c) => c.get_verbosity(),
            Unet::Predict(c) => c.get_verbosity(),
        }
    }
}

fn main() -> CliResult {
    let args = Unet::from_args();
    args.setup_env_logger()?;
    args.run()
}
