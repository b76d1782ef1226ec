//! `relume-perception` – Vision and State Estimation
//!
//! Everything the host tier needs to turn camera frames into a target and
//! the controller tier needs to know where the robot is.
//!
//! # Modules
//!
//! - [`image`] – [`GrayImage`][image::GrayImage], the 8-bit raster shared by
//!   every vision stage.
//! - [`preprocess`] – [`Preprocessor`][preprocess::Preprocessor]: denoise,
//!   CLAHE, Canny and morphological closing, blended into one enhanced
//!   greyscale frame.
//! - [`detection`] – [`TargetDetector`][detection::TargetDetector]: largest
//!   bright blob to bearing and range.
//! - [`fusion`] – [`SensorFusion`][fusion::SensorFusion]: complementary
//!   filter over wheel odometry and IMU yaw rate.

pub mod detection;
pub mod fusion;
pub mod image;
pub mod preprocess;

pub use detection::{DetectionConfig, TargetDetector};
pub use fusion::{OdometryData, SensorFusion};
pub use image::GrayImage;
pub use preprocess::{PreprocessConfig, PreprocessStages, Preprocessor};
