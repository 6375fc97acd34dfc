//! FCIS instance segmentation on candle
//!
//! Fully convolutional instance-aware semantic segmentation: a VGG16 trunk, a
//! translation-aware score map, per-ROI assembly with classification and
//! segmentation losses, and reconstruction of dense label maps from the ROI
//! predictions.

pub mod config;
pub mod dataset;
pub mod debug;
pub mod error;
pub mod labels;
pub mod model;
pub mod preprocess;
pub mod proposal;
pub mod reconstruct;
pub mod roi;
pub mod voc_classes;

pub use config::FcisConfig;
pub use error::{FcisError, Result};
pub use model::{Fcis, FcisOutput, ForwardReport};
