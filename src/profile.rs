//! Mapping from SL1 slicer settings to Photon print parameters

use crate::archive::SlicerConfig;
use crate::error::{ConvertError, Result};
use image::RgbImage;
use std::str::FromStr;

/// Configuration keys read from `config.ini`
pub mod keys {
    pub const EXPOSURE_TIME: &str = "expTime";
    pub const BOTTOM_EXPOSURE_TIME: &str = "expTimeFirst";
    pub const LAYER_HEIGHT: &str = "layerHeight";
    pub const BOTTOM_LAYERS: &str = "numFade";
    pub const USED_MATERIAL: &str = "usedMaterial";
    pub const PRINT_TIME: &str = "printTime";
}

/// Values the Photon format requires that have no SL1 counterpart.
///
/// These are format literals. They are written as-is and never derived from
/// the source job.
pub mod constants {
    pub const VERSION: u32 = 2;
    pub const PRINT_PROPERTIES_LENGTH: u32 = 60;
    pub const BED_X_MM: f32 = 68.04;
    pub const BED_Y_MM: f32 = 120.96;
    pub const BED_Z_MM: f32 = 150.0;
    pub const RESOLUTION_X: u32 = 1440;
    pub const RESOLUTION_Y: u32 = 2560;
    pub const PROJECTION_TYPE: u32 = 0;
    pub const ANTI_ALIASING_LEVEL: u32 = 1;
    pub const LIGHT_PWM: u16 = 255;
    pub const BOTTOM_LIGHT_PWM: u16 = 255;
    pub const LIGHT_OFF_DELAY: f32 = 0.0;
    pub const BOTTOM_LIGHT_OFF_DELAY: f32 = 0.0;
    pub const LIFT_DISTANCE: f32 = 5.0;
    pub const BOTTOM_LIFT_DISTANCE: f32 = 9060.0;
    pub const COST: f32 = 1.0;
    pub const RESERVED: [f32; 4] = [0.0; 4];
}

pub const DEFAULT_LIFT_SPEED: u32 = 65;
pub const DEFAULT_RETRACT_SPEED: u32 = 150;

/// Motion settings supplied on the command line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionOverrides {
    pub lift_speed: u32,
    pub retract_speed: u32,
}

impl Default for MotionOverrides {
    fn default() -> Self {
        Self {
            lift_speed: DEFAULT_LIFT_SPEED,
            retract_speed: DEFAULT_RETRACT_SPEED,
        }
    }
}

/// Preview images embedded in the job
#[derive(Debug, Clone, Default)]
pub struct Previews {
    pub high_res: Option<RgbImage>,
    pub low_res: Option<RgbImage>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub exposure_time: f32,
    pub bottom_exposure_time: f32,
    pub light_off_delay: f32,
    pub bottom_light_off_delay: f32,
    /// Integer seconds
    pub print_time: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub layer_height: f32,
    pub bottom_layers: u32,
    pub bed_x_mm: f32,
    pub bed_y_mm: f32,
    pub bed_z_mm: f32,
    pub resolution_x: u32,
    pub resolution_y: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Motion {
    pub lift_distance: f32,
    pub bottom_lift_distance: f32,
    pub lift_speed: f32,
    pub bottom_lift_speed: f32,
    pub retract_speed: f32,
    pub bottom_retract_speed: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Illumination {
    pub light_pwm: u16,
    pub bottom_light_pwm: u16,
    pub anti_aliasing_level: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub volume_ml: f32,
    pub weight_g: f32,
    pub cost: f32,
}

/// Format fields with no meaning on the SL1 side
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormatFields {
    pub version: u32,
    pub print_properties_length: u32,
    pub projection_type: u32,
    pub reserved: [f32; 4],
}

/// Fully resolved Photon print parameters
#[derive(Debug, Clone)]
pub struct TargetProfile {
    pub timing: Timing,
    pub geometry: Geometry,
    pub motion: Motion,
    pub illumination: Illumination,
    pub material: Material,
    pub format: FormatFields,
    pub previews: Previews,
}

impl TargetProfile {
    /// Exposure time for the layer at `index`
    pub fn exposure_for_layer(&self, index: usize) -> f32 {
        if index < self.geometry.bottom_layers as usize {
            self.timing.bottom_exposure_time
        } else {
            self.timing.exposure_time
        }
    }

    /// Light-off delay for the layer at `index`
    pub fn light_off_for_layer(&self, index: usize) -> f32 {
        if index < self.geometry.bottom_layers as usize {
            self.timing.bottom_light_off_delay
        } else {
            self.timing.light_off_delay
        }
    }
}

/// Build the Photon parameter set from slicer settings and CLI overrides
pub fn map_profile(
    config: &SlicerConfig,
    overrides: &MotionOverrides,
    previews: Previews,
) -> Result<TargetProfile> {
    let exposure_time = require_float(config, keys::EXPOSURE_TIME)?;
    let bottom_exposure_time = require_float(config, keys::BOTTOM_EXPOSURE_TIME)?;
    let layer_height = require_float(config, keys::LAYER_HEIGHT)?;
    let bottom_layers = require::<u32>(config, keys::BOTTOM_LAYERS)?;
    let used_material = require_float(config, keys::USED_MATERIAL)?;
    let print_time = require_seconds(config, keys::PRINT_TIME)?;

    let lift_speed = overrides.lift_speed as f32;
    let retract_speed = overrides.retract_speed as f32;

    Ok(TargetProfile {
        timing: Timing {
            exposure_time,
            bottom_exposure_time,
            light_off_delay: constants::LIGHT_OFF_DELAY,
            bottom_light_off_delay: constants::BOTTOM_LIGHT_OFF_DELAY,
            print_time,
        },
        geometry: Geometry {
            layer_height,
            bottom_layers,
            bed_x_mm: constants::BED_X_MM,
            bed_y_mm: constants::BED_Y_MM,
            bed_z_mm: constants::BED_Z_MM,
            resolution_x: constants::RESOLUTION_X,
            resolution_y: constants::RESOLUTION_Y,
        },
        motion: Motion {
            lift_distance: constants::LIFT_DISTANCE,
            bottom_lift_distance: constants::BOTTOM_LIFT_DISTANCE,
            lift_speed,
            bottom_lift_speed: lift_speed,
            retract_speed,
            bottom_retract_speed: retract_speed,
        },
        illumination: Illumination {
            light_pwm: constants::LIGHT_PWM,
            bottom_light_pwm: constants::BOTTOM_LIGHT_PWM,
            anti_aliasing_level: constants::ANTI_ALIASING_LEVEL,
        },
        material: Material {
            volume_ml: used_material,
            weight_g: used_material,
            cost: constants::COST,
        },
        format: FormatFields {
            version: constants::VERSION,
            print_properties_length: constants::PRINT_PROPERTIES_LENGTH,
            projection_type: constants::PROJECTION_TYPE,
            reserved: constants::RESERVED,
        },
        previews,
    })
}

fn mapping_error(key: &str, reason: impl Into<String>) -> anyhow::Error {
    ConvertError::ProfileMapping {
        key: key.to_string(),
        reason: reason.into(),
    }
    .into()
}

fn require<T>(config: &SlicerConfig, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = config
        .get(key)
        .ok_or_else(|| mapping_error(key, "missing from configuration"))?;

    raw.parse::<T>()
        .map_err(|e| mapping_error(key, format!("{:?} is not a valid number ({})", raw, e)))
}

fn require_float(config: &SlicerConfig, key: &str) -> Result<f32> {
    let value = require::<f32>(config, key)?;
    if !value.is_finite() {
        return Err(mapping_error(key, format!("{} is not a finite number", value)));
    }
    Ok(value)
}

fn require_seconds(config: &SlicerConfig, key: &str) -> Result<u32> {
    let value = require::<f64>(config, key)?;
    if !value.is_finite() || value < 0.0 || value > u32::MAX as f64 {
        return Err(mapping_error(key, format!("{} is not a valid duration", value)));
    }
    Ok(value.trunc() as u32)
}
