//! Parallel layer conversion
//!
//! Every extracted layer is loaded, rotated by 180 degrees and handed to a
//! [`LayerEncoder`]. Work is spread over a fixed-size rayon pool. Each path
//! gets its index before dispatch and the results are put back in index
//! order, so completion order never leaks into the job file.

use crate::error::{ConvertError, Result};
use crate::progress::LayerProgress;
use image::{imageops, GrayImage};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One print layer ready for serialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedLayer {
    data: Vec<u8>,
    lit_pixels: u32,
}

impl EncodedLayer {
    pub fn new(data: Vec<u8>, lit_pixels: u32) -> Self {
        Self { data, lit_pixels }
    }

    /// Encoded bytes as written to the job file
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of exposed pixels in the layer
    pub fn lit_pixels(&self) -> u32 {
        self.lit_pixels
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Encodes an already rotated layer image into the target format
pub trait LayerEncoder: Sync {
    fn encode(&self, image: &GrayImage) -> Result<EncodedLayer>;
}

/// Number of workers used when none is configured
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Converts layer images on a fixed-size worker pool
#[derive(Debug, Clone)]
pub struct LayerConverter {
    workers: usize,
}

impl Default for LayerConverter {
    fn default() -> Self {
        Self::new(default_workers())
    }
}

impl LayerConverter {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Convert `paths` (already in print order) into encoded layers.
    ///
    /// The first failing layer aborts the whole batch and no layers are
    /// returned.
    pub fn convert<E: LayerEncoder>(
        &self,
        paths: &[PathBuf],
        encoder: &E,
        progress: &LayerProgress,
    ) -> Result<Vec<EncodedLayer>> {
        info!(
            "Converting {} layers on {} workers",
            paths.len(),
            self.workers
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("layer-worker-{}", i))
            .build()?;

        let tasks: Vec<(usize, &Path)> = paths
            .iter()
            .enumerate()
            .map(|(index, path)| (index, path.as_path()))
            .collect();

        let outcome: Result<Vec<(usize, EncodedLayer)>> = pool.install(|| {
            tasks
                .par_iter()
                .map(|&(index, path)| -> Result<(usize, EncodedLayer)> {
                    let layer = convert_layer(index, path, encoder)?;
                    progress.complete_one();
                    Ok((index, layer))
                })
                .collect()
        });

        let mut converted = match outcome {
            Ok(converted) => converted,
            Err(e) => {
                progress.finish(false);
                return Err(e);
            }
        };
        progress.finish(true);

        converted.sort_unstable_by_key(|(index, _)| *index);
        Ok(converted.into_iter().map(|(_, layer)| layer).collect())
    }
}

/// Load, rotate and encode a single layer
fn convert_layer<E: LayerEncoder>(index: usize, path: &Path, encoder: &E) -> Result<EncodedLayer> {
    let fail = |reason: String| ConvertError::LayerConversion {
        index,
        path: path.to_path_buf(),
        reason,
    };

    let image = image::open(path)
        .map_err(|e| fail(format!("cannot decode image: {}", e)))?
        .to_luma8();

    let rotated = rotate_layer(&image);

    let layer = encoder
        .encode(&rotated)
        .map_err(|e| fail(format!("{:#}", e)))?;

    debug!(
        "Layer {} encoded to {} bytes ({} lit pixels)",
        index,
        layer.len(),
        layer.lit_pixels()
    );
    Ok(layer)
}

/// Rotate a layer by 180 degrees for the target printer's optics
pub fn rotate_layer(image: &GrayImage) -> GrayImage {
    imageops::rotate180(image)
}
