//! FCIS instance segmentation with Candle
//!
//! This binary trains and evaluates FCIS models on label-PNG datasets.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod cmd_eval;
mod cmd_train;

use candle_core::{Device, Result};
use candle_nn::VarBuilder;
use clap::{Args, Parser, Subcommand};
use fcis::dataset::Dataset;
use fcis::proposal::{GroundTruthSampler, SlidingWindowProposer};
use fcis::{Fcis, FcisConfig};
use serde::Serialize;

use crate::{cmd_eval::EvalArgs, cmd_train::TrainArgs};

/// Select the compute device
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!(
                "Running on CPU, to run on GPU(metal), build this example with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Model and proposal options shared by the subcommands.
///
/// The class count and ignore label come from the dataset.
#[derive(Args, Debug, Clone, Serialize)]
pub struct ModelArgs {
    /// Kernel size of the translation-aware score map.
    #[arg(long, default_value_t = 7)]
    pub kernel_size: usize,

    /// Sizes of the sliding-window proposals, in pixels.
    #[arg(long, value_delimiter = ',', default_values_t = [64, 128, 256])]
    pub window_sizes: Vec<usize>,

    /// Stride of the sliding-window proposals, in pixels.
    #[arg(long, default_value_t = 32)]
    pub window_stride: usize,

    /// Maximum number of ROIs scored per image.
    #[arg(long, default_value_t = 128)]
    pub max_rois: usize,
}

impl ModelArgs {
    fn config(&self, dataset: &dyn Dataset) -> fcis::Result<FcisConfig> {
        Ok(FcisConfig::from_dataset(dataset)?.with_kernel_size(self.kernel_size))
    }

    fn load(&self, vb: VarBuilder, config: &FcisConfig) -> fcis::Result<Fcis> {
        let proposer = SlidingWindowProposer::new(self.window_sizes.clone(), self.window_stride);
        let sampler = GroundTruthSampler {
            max_rois: self.max_rois,
        };
        Fcis::load(vb, config, Box::new(proposer), Box::new(sampler))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model.
    Train(TrainArgs),
    /// Evaluate a trained model on a dataset split.
    Eval(EvalArgs),
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run on CPU rather than on GPU.
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

pub fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    // Get device
    let device = device(cli.cpu)?;
    println!("Using device: {:?}", device);

    match &cli.command {
        Command::Train(args) => cmd_train::run(args, &device),
        Command::Eval(args) => cmd_eval::run(args, &device),
    }
}
