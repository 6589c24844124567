//! sl1-to-photon - Convert Prusa SL1 print archives to Anycubic Photon jobs
//!
//! The pipeline reads the SL1 zip ([`archive`]), maps its slicer settings to
//! Photon print parameters ([`profile`]), converts the layer images on a
//! worker pool ([`layers`]) and writes the job file ([`photon`]).
//! [`converter::Converter`] drives the whole run.

pub mod archive;
pub mod config;
pub mod converter;
pub mod error;
pub mod layers;
pub mod photon;
pub mod profile;
pub mod progress;

pub use converter::{ConversionStats, Converter};
pub use error::{ConvertError, Result};
