//! Persisted configuration: operator settings and per-axis calibration.
//!
//! Both documents are plain TOML key/value files loaded through a layered
//! `figment` provider stack (file defaults, then the file on disk, then
//! environment overrides prefixed `MICROSCOPE_`), saved back with an atomic
//! temp-file-then-rename so a crash mid-write never corrupts the document.

use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, MicroscopeError};

/// Discrete magnifications the optics support.
pub const MAGNIFICATIONS: [u32; 5] = [10, 20, 40, 60, 100];

/// Operator-tunable settings, persisted as a single TOML document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Exposure time in milliseconds.
    pub exposure_value: f64,
    /// Analogue sensor gain.
    pub gain_value: f64,
    /// Red channel white-balance multiplier.
    pub r_value: f64,
    /// Blue channel white-balance multiplier.
    pub b_value: f64,
    /// LED channel 0 duty cycle, 0..100.
    pub led_value_0: u8,
    /// LED channel 1 duty cycle, 0..100.
    pub led_value_1: u8,
    /// Shared X/Y steps-per-millimetre constant.
    pub xy_steps_per_mm: f64,
    /// Z steps-per-millimetre constant.
    pub z_steps_per_mm: f64,
    /// Active magnification; must be one of [`MAGNIFICATIONS`].
    pub magnification: u32,
    /// Current Z stack depth (number of slices).
    pub z_level: u32,
    /// Default Z step size in steps.
    pub z_step_size: i64,
    /// Default X step size in steps.
    pub x_step_size: i64,
    /// Default Y step size in steps.
    pub y_step_size: i64,
    /// Sensor pixel pitch in micrometres per pixel at 1x.
    pub pixel_size: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            exposure_value: 20.0,
            gain_value: 1.0,
            r_value: 1.0,
            b_value: 1.0,
            led_value_0: 0,
            led_value_1: 0,
            xy_steps_per_mm: 966.67,
            z_steps_per_mm: 1450.0,
            magnification: 40,
            z_level: 1,
            z_step_size: 100,
            x_step_size: 100,
            y_step_size: 100,
            pixel_size: 2.4,
        }
    }
}

/// Four-parameter arctangent calibration for one axis's Hall sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArctanCalibration {
    /// Amplitude.
    pub a: f64,
    /// Slope.
    pub b: f64,
    /// Voltage offset.
    pub c: f64,
    /// Vertical offset (millimetres).
    pub d: f64,
}

impl Default for ArctanCalibration {
    /// Defaults drawn from the reference rig's fitted parameters, sufficient
    /// to exercise the monotone-mapping invariant on synthetic data.
    fn default() -> Self {
        Self { a: 11.868, b: 2.776, c: -4.678, d: 0.282 }
    }
}

impl ArctanCalibration {
    /// Maps a Hall sensor reading in volts to millimetres.
    pub fn mm(&self, volts: f64) -> f64 {
        self.a * (self.b * (volts - self.c)).atan() + self.d
    }
}

/// Calibration document: per-axis arctangent fit plus direction signs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisCalibrationDocument {
    /// X axis calibration.
    pub x: ArctanCalibration,
    /// Y axis calibration.
    pub y: ArctanCalibration,
    /// Z axis calibration.
    pub z: ArctanCalibration,
    /// Logical-to-physical direction sign for X.
    pub x_sign: i8,
    /// Logical-to-physical direction sign for Y.
    pub y_sign: i8,
    /// Logical-to-physical direction sign for Z.
    pub z_sign: i8,
    /// Backlash overshoot margin in steps, shared unless overridden per axis.
    pub backlash_margin_steps: i64,
}

impl Default for AxisCalibrationDocument {
    fn default() -> Self {
        Self {
            x: ArctanCalibration::default(),
            y: ArctanCalibration::default(),
            z: ArctanCalibration::default(),
            x_sign: 1,
            y_sign: 1,
            z_sign: 1,
            backlash_margin_steps: 35,
        }
    }
}

/// Loads a document of type `T` from `path`, layering defaults under the
/// file's contents (if present) and environment overrides on top.
pub fn load_document<T>(path: &Path, env_prefix: &str) -> AppResult<T>
where
    T: Default + Serialize + serde::de::DeserializeOwned,
{
    let figment = Figment::new()
        .merge(Serialized::defaults(T::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(env_prefix));
    figment.extract().map_err(MicroscopeError::Config)
}

/// Saves `document` to `path` with an atomic temp-file-then-rename.
pub fn save_document<T: Serialize>(document: &T, path: &Path) -> AppResult<()> {
    let rendered = toml::to_string_pretty(document)
        .map_err(|e| MicroscopeError::Configuration(e.to_string()))?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, rendered)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
