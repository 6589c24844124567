//! SL1 archive reading
//!
//! An SL1 job is a zip file with a `config.ini` at the root, one PNG per
//! layer at the root and optional previews under `thumbnail/`. Layer order is
//! the byte-wise order of the layer file names, which the slicer zero-pads.

use crate::error::{ConvertError, Result, ResultExt};
use image::{ImageFormat, RgbImage};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::result::ZipError;
use zip::ZipArchive;

/// Name of the slicer configuration entry
pub const CONFIG_ENTRY: &str = "config.ini";

/// Directory holding the preview images
pub const THUMBNAIL_DIR: &str = "thumbnail";

const LAYER_EXTENSION: &str = "png";

/// Parsed `key = value` pairs from the slicer configuration
pub type SlicerConfig = HashMap<String, String>;

/// Read-only handle on an SL1 archive
pub struct Sl1Archive {
    path: PathBuf,
    zip: ZipArchive<fs::File>,
}

impl Sl1Archive {
    /// Open an SL1 archive, failing if the file is not a zip container
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path).map_err(|e| ConvertError::Archive {
            reason: format!("cannot open {}: {}", path.display(), e),
        })?;

        let zip = ZipArchive::new(file).map_err(|e| ConvertError::Archive {
            reason: format!("{} is not a zip file: {}", path.display(), e),
        })?;

        debug!("Opened {} with {} entries", path.display(), zip.len());

        Ok(Self {
            path: path.to_path_buf(),
            zip,
        })
    }

    /// Path the archive was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse `config.ini`
    pub fn read_config(&mut self) -> Result<SlicerConfig> {
        let mut entry = match self.zip.by_name(CONFIG_ENTRY) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => {
                return Err(ConvertError::MissingConfig {
                    entry: CONFIG_ENTRY.to_string(),
                }
                .into())
            }
            Err(e) => {
                return Err(ConvertError::Archive {
                    reason: format!("cannot read {}: {}", CONFIG_ENTRY, e),
                }
                .into())
            }
        };

        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| ConvertError::Archive {
                reason: format!("cannot read {}: {}", CONFIG_ENTRY, e),
            })
            .with_path_context("read configuration", &self.path)?;

        let text = config_text(bytes)?;
        let config = parse_config(&text)?;
        info!("Read {} configuration values", config.len());
        Ok(config)
    }

    /// Names of the layer entries, in print order
    pub fn layer_entry_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .zip
            .file_names()
            .filter(|name| is_layer_entry(name))
            .map(str::to_string)
            .collect();
        names.sort();
        names
    }

    /// Number of layer images in the archive
    pub fn count_layers(&self) -> usize {
        self.zip.file_names().filter(|name| is_layer_entry(name)).count()
    }

    /// Write every layer image into `dest` and return their paths in print order.
    ///
    /// `dest` is created when missing. Running twice against the same
    /// directory rewrites the same files.
    pub fn extract_layers<P: AsRef<Path>>(&mut self, dest: P) -> Result<Vec<PathBuf>> {
        let dest = dest.as_ref();
        fs::create_dir_all(dest).with_path_context("create extraction directory", dest)?;

        let names = self.layer_entry_names();
        let mut paths = Vec::with_capacity(names.len());

        for name in &names {
            let mut entry = self.zip.by_name(name).map_err(|e| ConvertError::Archive {
                reason: format!("cannot read layer entry {}: {}", name, e),
            })?;

            let outpath = dest.join(name);
            let mut outfile =
                fs::File::create(&outpath).with_path_context("create layer", &outpath)?;
            io::copy(&mut entry, &mut outfile).with_path_context("write layer", &outpath)?;

            paths.push(outpath);
        }

        debug!("Extracted {} layers to {}", paths.len(), dest.display());
        Ok(paths)
    }

    /// Load the preview with the exact size label, e.g. `"800x480"`
    pub fn read_thumbnail(&mut self, size_label: &str) -> Result<RgbImage> {
        let name = thumbnail_entry_name(size_label);
        let mut entry = match self.zip.by_name(&name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => {
                return Err(ConvertError::ThumbnailNotFound {
                    label: size_label.to_string(),
                }
                .into())
            }
            Err(e) => {
                return Err(ConvertError::ThumbnailDecode {
                    label: size_label.to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
        };

        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| ConvertError::ThumbnailDecode {
                label: size_label.to_string(),
                reason: e.to_string(),
            })?;

        let image = image::load_from_memory_with_format(&data, ImageFormat::Png).map_err(|e| {
            ConvertError::ThumbnailDecode {
                label: size_label.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(image.to_rgb8())
    }

    /// Size labels of all previews present in the archive
    pub fn thumbnail_labels(&self) -> Result<Vec<String>> {
        let re = Regex::new(r"^thumbnail/thumbnail(\d+x\d+)\.png$")?;
        let mut labels: Vec<String> = self
            .zip
            .file_names()
            .filter_map(|name| re.captures(name).map(|caps| caps[1].to_string()))
            .collect();
        labels.sort();
        Ok(labels)
    }
}

/// Archive entry name of the preview with the given size label
pub fn thumbnail_entry_name(size_label: &str) -> String {
    format!("{}/thumbnail{}.png", THUMBNAIL_DIR, size_label)
}

/// Whether an entry is a print layer: a PNG at the archive root
fn is_layer_entry(name: &str) -> bool {
    if name.contains('/') || name.contains('\\') {
        return false;
    }

    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(LAYER_EXTENSION))
        .unwrap_or(false)
}

/// Decode the configuration text. Invalid UTF-8 is reported on the line it occurs.
fn config_text(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| {
        let bytes = e.as_bytes();
        let valid = e.utf8_error().valid_up_to();
        let line_start = bytes[..valid]
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        let line_end = bytes[valid..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(bytes.len(), |pos| valid + pos);

        ConvertError::ConfigParse {
            line: bytes[..valid].iter().filter(|&&b| b == b'\n').count() + 1,
            content: String::from_utf8_lossy(&bytes[line_start..line_end]).into_owned(),
        }
        .into()
    })
}

/// Parse slicer configuration text.
///
/// Every non-blank line must hold exactly one `=`; keys and values are trimmed.
pub fn parse_config(text: &str) -> Result<SlicerConfig> {
    let mut config = SlicerConfig::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let malformed = || ConvertError::ConfigParse {
            line: idx + 1,
            content: raw.to_string(),
        };

        if line.matches('=').count() != 1 {
            return Err(malformed().into());
        }

        let (key, value) = line.split_once('=').ok_or_else(malformed)?;
        let key = key.trim();
        if key.is_empty() {
            return Err(malformed().into());
        }

        config.insert(key.to_string(), value.trim().to_string());
    }

    Ok(config)
}
