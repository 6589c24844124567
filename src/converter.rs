//! Conversion pipeline
//!
//! Runs the stages in order: output check, archive reading, profile mapping,
//! layer extraction, parallel layer conversion and job assembly. Only the
//! layer conversion stage runs in parallel.

use crate::{
    archive::Sl1Archive,
    config::Config,
    error::{find_convert_error, Result, ResultExt},
    layers::{EncodedLayer, LayerConverter},
    photon::{PhotonFile, PhotonLayerEncoder},
    profile::{map_profile, Previews, TargetProfile},
    progress::ProgressTracker,
};
use anyhow::Context;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Size label of the preview shown on the printer's main screen
pub const HIGH_RES_PREVIEW: &str = "800x480";

/// Size label of the preview shown in the file list
pub const LOW_RES_PREVIEW: &str = "400x400";

/// The main conversion engine
pub struct Converter {
    config: Config,
    progress_tracker: ProgressTracker,
    stats: ConversionStats,
}

impl Converter {
    pub fn new(config: Config) -> Self {
        let progress_tracker = ProgressTracker::new(config.show_progress());
        let stats = ConversionStats {
            output_path: config.output.clone(),
            workers: config.threads,
            ..ConversionStats::default()
        };

        Self {
            config,
            progress_tracker,
            stats,
        }
    }

    /// Run the complete conversion.
    ///
    /// The scratch directory holding extracted layers is removed when this
    /// returns, whether or not the conversion succeeded.
    pub fn run(&mut self) -> Result<()> {
        let start = Instant::now();
        info!("Starting conversion of {}", self.config.input.display());

        self.config
            .validate()
            .context("Configuration validation failed")?;

        let mut archive = Sl1Archive::open(&self.config.input)
            .with_path_context("open archive", &self.config.input)?;

        let slicer_config = archive
            .read_config()
            .with_stage_context("Configuration")?;

        let previews = self.load_previews(&mut archive)?;

        let profile = map_profile(&slicer_config, &self.config.motion_overrides(), previews)
            .with_stage_context("Profile mapping")?;

        self.stats.layer_count = archive.count_layers();
        self.log_parameters(&profile);

        let scratch = TempDir::new().context("Failed to create scratch directory for layers")?;
        let layer_paths = self.extract_layers(archive, scratch.path())?;

        let layers = self
            .convert_layers(&layer_paths, &profile)
            .with_stage_context("Layer conversion")?;

        let job = PhotonFile::new(profile, layers);
        info!("Assembling job with {} layers", job.layer_count());
        job.write(&self.config.output, self.config.force)
            .with_stage_context("Job assembly")?;

        self.stats.elapsed = start.elapsed();
        info!(
            "Conversion completed in {} ms",
            self.stats.elapsed.as_millis()
        );
        Ok(())
    }

    /// Look up both previews. A missing preview is reported and skipped.
    fn load_previews(&mut self, archive: &mut Sl1Archive) -> Result<Previews> {
        let high_res = self.load_preview(archive, HIGH_RES_PREVIEW)?;
        let low_res = self.load_preview(archive, LOW_RES_PREVIEW)?;
        Ok(Previews { high_res, low_res })
    }

    fn load_preview(&mut self, archive: &mut Sl1Archive, label: &str) -> Result<Option<RgbImage>> {
        let err = match archive.read_thumbnail(label) {
            Ok(image) => {
                debug!(
                    "Loaded {} preview ({}x{})",
                    label,
                    image.width(),
                    image.height()
                );
                return Ok(Some(image));
            }
            Err(err) => err,
        };

        let recoverable = find_convert_error(&err)
            .map(|e| e.is_recoverable())
            .unwrap_or(false);
        if !recoverable {
            return Err(err);
        }

        let available = archive.thumbnail_labels().unwrap_or_default();
        warn!(
            "{:#}; continuing without it (available previews: {:?})",
            err, available
        );
        self.stats.missing_previews.push(label.to_string());
        Ok(None)
    }

    /// Extract layers to the scratch directory, releasing the archive afterwards
    fn extract_layers(&self, mut archive: Sl1Archive, scratch: &Path) -> Result<Vec<PathBuf>> {
        let spinner = self.progress_tracker.create_spinner("Extracting layers...");
        info!("Extracting layers...");

        let paths = archive
            .extract_layers(scratch)
            .with_path_context("extract layers from", archive.path())?;

        ProgressTracker::finish(spinner, "Layers extracted");
        info!("Extracted {} layers", paths.len());
        Ok(paths)
    }

    fn convert_layers(
        &self,
        layer_paths: &[PathBuf],
        profile: &TargetProfile,
    ) -> Result<Vec<EncodedLayer>> {
        let encoder = PhotonLayerEncoder::for_profile(profile);
        let progress = self.progress_tracker.layer_progress(layer_paths.len());

        LayerConverter::new(self.config.threads).convert(layer_paths, &encoder, &progress)
    }

    fn log_parameters(&self, profile: &TargetProfile) {
        info!("=== PARAMETERS ===");
        info!("Exposure Time: {}", profile.timing.exposure_time);
        info!("Bottom Exposure Time: {}", profile.timing.bottom_exposure_time);
        info!("Layer Height: {}", profile.geometry.layer_height);
        info!("Bottom Layers: {}", profile.geometry.bottom_layers);
        info!("Layers: {}", self.stats.layer_count);
        info!("Lifting speed: {}", profile.motion.lift_speed);
        info!("Retract speed: {}", profile.motion.retract_speed);
        info!("Print time: {} s", profile.timing.print_time);
        info!("=== CONVERSION ===");
    }

    /// Get statistics about the conversion process
    pub fn get_conversion_stats(&self) -> &ConversionStats {
        &self.stats
    }
}

/// Statistics about the conversion process
#[derive(Debug, Clone, Default)]
pub struct ConversionStats {
    pub layer_count: usize,
    pub missing_previews: Vec<String>,
    pub output_path: PathBuf,
    pub workers: usize,
    pub elapsed: Duration,
}
