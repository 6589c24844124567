//! Photon (`.photon`, version 2) job files
//!
//! All values are little endian. The file is laid out as:
//!
//! | section          | size                    |
//! |------------------|-------------------------|
//! | header           | 108 bytes               |
//! | high-res preview | 32 byte header + data   |
//! | low-res preview  | 32 byte header + data   |
//! | print properties | 60 bytes                |
//! | layer table      | 36 bytes per layer      |
//! | layer data       | RLE bytes per layer     |
//!
//! A missing preview is written as an empty record so every offset in the
//! header stays valid.

use crate::error::{ConvertError, Result, ResultExt};
use crate::layers::{EncodedLayer, LayerEncoder};
use crate::profile::TargetProfile;
use anyhow::{bail, Context};
use image::{GrayImage, RgbImage};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

pub const MAGIC: u32 = 0x12FD_0019;
pub const EXTENSION: &str = "photon";

pub const HEADER_SIZE: usize = 108;
pub const PREVIEW_HEADER_SIZE: usize = 32;
pub const PRINT_PROPERTIES_SIZE: usize = 60;
pub const LAYER_DEF_SIZE: usize = 36;

/// Longest run a single layer RLE byte can hold
const MAX_LAYER_RUN: usize = 125;
const LIT_FLAG: u8 = 0x80;
/// Pixels brighter than this are exposed
const LIT_THRESHOLD: u8 = 127;

/// Longest run a preview repeat word can hold
const MAX_PREVIEW_RUN: usize = 0x1000;
const PREVIEW_RUN_FLAG: u16 = 0x0020;
const PREVIEW_REPEAT_MARK: u16 = 0x3000;

/// Run-length encoder for Photon layer images
#[derive(Debug, Clone, Copy)]
pub struct PhotonLayerEncoder {
    width: u32,
    height: u32,
}

impl PhotonLayerEncoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Encoder matching the profile's screen resolution
    pub fn for_profile(profile: &TargetProfile) -> Self {
        Self::new(profile.geometry.resolution_x, profile.geometry.resolution_y)
    }
}

impl LayerEncoder for PhotonLayerEncoder {
    fn encode(&self, image: &GrayImage) -> Result<EncodedLayer> {
        if image.dimensions() != (self.width, self.height) {
            return Err(ConvertError::Encode {
                reason: format!(
                    "layer is {}x{}, printer expects {}x{}",
                    image.width(),
                    image.height(),
                    self.width,
                    self.height
                ),
            }
            .into());
        }

        let mut data = Vec::new();
        let mut lit_pixels = 0u32;
        let mut run: Option<(bool, usize)> = None;

        for &value in image.as_raw() {
            let lit = value > LIT_THRESHOLD;
            if lit {
                lit_pixels += 1;
            }

            run = match run {
                Some((color, len)) if color == lit && len < MAX_LAYER_RUN => Some((color, len + 1)),
                Some((color, len)) => {
                    data.push(layer_run_byte(color, len));
                    Some((lit, 1))
                }
                None => Some((lit, 1)),
            };
        }

        if let Some((color, len)) = run {
            data.push(layer_run_byte(color, len));
        }

        Ok(EncodedLayer::new(data, lit_pixels))
    }
}

fn layer_run_byte(lit: bool, len: usize) -> u8 {
    let len = len as u8;
    if lit {
        LIT_FLAG | len
    } else {
        len
    }
}

/// Expand layer RLE data back into an image
pub fn decode_layer(data: &[u8], width: u32, height: u32) -> Result<GrayImage> {
    let expected = width as usize * height as usize;
    let mut pixels = Vec::with_capacity(expected);

    for &byte in data {
        let value = if byte & LIT_FLAG != 0 { 255 } else { 0 };
        let len = (byte & !LIT_FLAG) as usize;
        pixels.extend(std::iter::repeat(value).take(len));
    }

    if pixels.len() != expected {
        bail!(
            "layer data holds {} pixels, expected {}",
            pixels.len(),
            expected
        );
    }

    GrayImage::from_raw(width, height, pixels).context("layer buffer size mismatch")
}

/// Encode a preview as run-length RGB555 words
pub fn encode_preview(image: &RgbImage) -> Vec<u8> {
    let mut words: Vec<u16> = Vec::new();
    let mut pixels = image.pixels().map(|p| rgb555(p.0)).peekable();

    while let Some(color) = pixels.next() {
        let mut run = 1;
        while run < MAX_PREVIEW_RUN && pixels.peek() == Some(&color) {
            pixels.next();
            run += 1;
        }

        if run > 1 {
            words.push(color | PREVIEW_RUN_FLAG);
            words.push(PREVIEW_REPEAT_MARK | (run - 1) as u16);
        } else {
            words.push(color);
        }
    }

    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn rgb555([r, g, b]: [u8; 3]) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 3) << 6) | (b as u16 >> 3)
}

/// A complete job ready to be written
pub struct PhotonFile {
    profile: TargetProfile,
    layers: Vec<EncodedLayer>,
}

impl PhotonFile {
    pub fn new(profile: TargetProfile, layers: Vec<EncodedLayer>) -> Self {
        Self { profile, layers }
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Write the job to `path`.
    ///
    /// The file is assembled next to the destination and moved into place
    /// once complete. Without `overwrite` an existing destination is left
    /// untouched and reported as a collision.
    pub fn write<P: AsRef<Path>>(&self, path: P, overwrite: bool) -> Result<()> {
        let path = path.as_ref();
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        // Match the mode a plain `File::create` gets under the current umask
        let mut builder = tempfile::Builder::new();
        builder.prefix(".photon-");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(std::fs::Permissions::from_mode(0o666));
        }

        let mut staging = builder
            .tempfile_in(parent)
            .with_path_context("create staging", parent)?;
        {
            let mut writer = BufWriter::new(staging.as_file_mut());
            self.write_to(&mut writer)?;
            writer.flush().with_path_context("flush staging", parent)?;
        }

        let persisted = if overwrite {
            staging.persist(path)
        } else {
            staging.persist_noclobber(path)
        };

        if let Err(e) = persisted {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                return Err(ConvertError::OutputCollision {
                    path: path.to_path_buf(),
                }
                .into());
            }
            return Err(e.error).with_path_context("write job", path);
        }

        info!(
            "Wrote {} layers to {}",
            self.layers.len(),
            path.display()
        );
        Ok(())
    }

    /// Serialize the job into `w`
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let p = &self.profile;
        let high_res = p.previews.high_res.as_ref().map(encode_preview);
        let low_res = p.previews.low_res.as_ref().map(encode_preview);
        let high_len = high_res.as_ref().map_or(0, Vec::len);
        let low_len = low_res.as_ref().map_or(0, Vec::len);

        let high_offset = HEADER_SIZE;
        let low_offset = high_offset + PREVIEW_HEADER_SIZE + high_len;
        let properties_offset = low_offset + PREVIEW_HEADER_SIZE + low_len;
        let table_offset = properties_offset + PRINT_PROPERTIES_SIZE;
        let data_offset = table_offset + LAYER_DEF_SIZE * self.layers.len();

        // header
        put_u32(w, MAGIC)?;
        put_u32(w, p.format.version)?;
        put_f32(w, p.geometry.bed_x_mm)?;
        put_f32(w, p.geometry.bed_y_mm)?;
        put_f32(w, p.geometry.bed_z_mm)?;
        put_zeros(w, 3)?;
        put_f32(w, p.geometry.layer_height)?;
        put_f32(w, p.timing.exposure_time)?;
        put_f32(w, p.timing.bottom_exposure_time)?;
        put_f32(w, p.timing.light_off_delay)?;
        put_u32(w, p.geometry.bottom_layers)?;
        put_u32(w, p.geometry.resolution_x)?;
        put_u32(w, p.geometry.resolution_y)?;
        put_u32(w, offset(high_offset)?)?;
        put_u32(w, offset(table_offset)?)?;
        put_u32(w, offset(self.layers.len())?)?;
        put_u32(w, offset(low_offset)?)?;
        put_u32(w, p.timing.print_time)?;
        put_u32(w, p.format.projection_type)?;
        put_u32(w, offset(properties_offset)?)?;
        put_u32(w, p.format.print_properties_length)?;
        put_u32(w, p.illumination.anti_aliasing_level)?;
        w.write_all(&p.illumination.light_pwm.to_le_bytes())?;
        w.write_all(&p.illumination.bottom_light_pwm.to_le_bytes())?;
        put_zeros(w, 2)?;

        write_preview(w, p.previews.high_res.as_ref(), high_res.as_deref(), high_offset)?;
        write_preview(w, p.previews.low_res.as_ref(), low_res.as_deref(), low_offset)?;

        // print properties
        put_f32(w, p.motion.bottom_lift_distance)?;
        put_f32(w, p.motion.bottom_lift_speed)?;
        put_f32(w, p.motion.lift_distance)?;
        put_f32(w, p.motion.lift_speed)?;
        put_f32(w, p.motion.retract_speed)?;
        put_f32(w, p.material.volume_ml)?;
        put_f32(w, p.material.weight_g)?;
        put_f32(w, p.material.cost)?;
        put_f32(w, p.timing.bottom_light_off_delay)?;
        put_f32(w, p.timing.light_off_delay)?;
        put_u32(w, p.geometry.bottom_layers)?;
        for reserved in p.format.reserved {
            put_f32(w, reserved)?;
        }

        let mut next_data = data_offset;
        for (index, layer) in self.layers.iter().enumerate() {
            put_f32(w, (index + 1) as f32 * p.geometry.layer_height)?;
            put_f32(w, p.exposure_for_layer(index))?;
            put_f32(w, p.light_off_for_layer(index))?;
            put_u32(w, offset(next_data)?)?;
            put_u32(w, offset(layer.len())?)?;
            put_zeros(w, 4)?;
            next_data += layer.len();
        }
        offset(next_data)?;

        for layer in &self.layers {
            w.write_all(layer.data())?;
        }

        debug!("Serialized job of {} bytes", next_data);
        Ok(())
    }
}

fn write_preview<W: Write>(
    w: &mut W,
    image: Option<&RgbImage>,
    data: Option<&[u8]>,
    header_offset: usize,
) -> Result<()> {
    let (width, height) = image.map_or((0, 0), |img| img.dimensions());
    let data = data.unwrap_or_default();

    put_u32(w, width)?;
    put_u32(w, height)?;
    put_u32(w, offset(header_offset + PREVIEW_HEADER_SIZE)?)?;
    put_u32(w, offset(data.len())?)?;
    put_zeros(w, 4)?;
    w.write_all(data)?;
    Ok(())
}

fn offset(value: usize) -> Result<u32> {
    u32::try_from(value).context("job file exceeds the 4 GiB Photon limit")
}

fn put_u32<W: Write>(w: &mut W, value: u32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

fn put_f32<W: Write>(w: &mut W, value: f32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

fn put_zeros<W: Write>(w: &mut W, words: usize) -> io::Result<()> {
    for _ in 0..words {
        put_u32(w, 0)?;
    }
    Ok(())
}

/// Key fields read back from a serialized job
#[derive(Debug, Clone, PartialEq)]
pub struct PhotonSummary {
    pub version: u32,
    pub layer_height: f32,
    pub exposure_time: f32,
    pub bottom_exposure_time: f32,
    pub bottom_layers: u32,
    pub resolution_x: u32,
    pub resolution_y: u32,
    pub layer_count: u32,
    pub print_time: u32,
    pub anti_aliasing_level: u32,
    pub light_pwm: u16,
    pub bottom_light_pwm: u16,
    pub high_res_preview: (u32, u32),
    pub low_res_preview: (u32, u32),
    pub lift_speed: f32,
    pub retract_speed: f32,
    pub volume_ml: f32,
    pub layers: Vec<LayerEntry>,
}

/// One row of the layer table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerEntry {
    pub z: f32,
    pub exposure_time: f32,
    pub light_off_delay: f32,
    pub data_offset: u32,
    pub data_length: u32,
}

impl PhotonSummary {
    /// Parse the header, preview records, print properties and layer table
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let u32_at = |pos: usize| -> Result<u32> {
            let raw = bytes
                .get(pos..pos + 4)
                .with_context(|| format!("truncated job file at offset {}", pos))?;
            Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        };
        let f32_at = |pos: usize| -> Result<f32> { u32_at(pos).map(f32::from_bits) };

        if u32_at(0)? != MAGIC {
            bail!("not a Photon file");
        }

        let high_offset = u32_at(60)? as usize;
        let table_offset = u32_at(64)? as usize;
        let layer_count = u32_at(68)?;
        let low_offset = u32_at(72)? as usize;
        let properties_offset = u32_at(84)? as usize;
        let pwm = u32_at(96)?;

        let layers = (0..layer_count as usize)
            .map(|i| -> Result<LayerEntry> {
                let row = table_offset + i * LAYER_DEF_SIZE;
                Ok(LayerEntry {
                    z: f32_at(row)?,
                    exposure_time: f32_at(row + 4)?,
                    light_off_delay: f32_at(row + 8)?,
                    data_offset: u32_at(row + 12)?,
                    data_length: u32_at(row + 16)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            version: u32_at(4)?,
            layer_height: f32_at(32)?,
            exposure_time: f32_at(36)?,
            bottom_exposure_time: f32_at(40)?,
            bottom_layers: u32_at(48)?,
            resolution_x: u32_at(52)?,
            resolution_y: u32_at(56)?,
            layer_count,
            print_time: u32_at(76)?,
            anti_aliasing_level: u32_at(92)?,
            light_pwm: (pwm & 0xFFFF) as u16,
            bottom_light_pwm: (pwm >> 16) as u16,
            high_res_preview: (u32_at(high_offset)?, u32_at(high_offset + 4)?),
            low_res_preview: (u32_at(low_offset)?, u32_at(low_offset + 4)?),
            lift_speed: f32_at(properties_offset + 12)?,
            retract_speed: f32_at(properties_offset + 16)?,
            volume_ml: f32_at(properties_offset + 20)?,
            layers,
        })
    }

    /// Raw RLE bytes of layer `index` within `bytes`
    pub fn layer_data<'a>(&self, bytes: &'a [u8], index: usize) -> Result<&'a [u8]> {
        let entry = self
            .layers
            .get(index)
            .with_context(|| format!("no layer {}", index))?;
        let start = entry.data_offset as usize;
        let end = start + entry.data_length as usize;
        bytes
            .get(start..end)
            .with_context(|| format!("layer {} data lies outside the file", index))
    }
}
