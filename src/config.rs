//! Observatory configuration
//!
//! A single structured document, loaded once at startup and passed by
//! reference to every component that needs it. No global lookup.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level configuration for one observatory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservatoryConfig {
    pub site: SiteConfig,
    /// Root directory for per-target image output.
    pub data_directory: PathBuf,
    pub cooler: CoolerConfig,
    pub weather: WeatherConfig,
    pub slew: SlewLimits,
    pub focus: FocusConfig,
    pub guiding: GuidingConfig,
    pub calibration: CalibrationConfig,
    /// Detector saturation level in ADU.
    pub saturation: u16,
    /// Plate scale in arcseconds per pixel.
    pub plate_scale: f64,
    /// Shortest exposure a ticket may request, in seconds.
    pub min_exposure_secs: f64,
    /// Slack added to the exposure time when waiting for frame completion.
    pub exposure_wait_margin_secs: f64,
    /// How long startup waits for each device to come online.
    pub startup_timeout_secs: u64,
    /// Gaps between tickets longer than this trigger a full shutdown
    /// instead of idling with the dome open.
    pub long_wait_shutdown_minutes: i64,
}

impl Default for ObservatoryConfig {
    fn default() -> Self {
        Self {
            site: SiteConfig::default(),
            data_directory: PathBuf::from("images"),
            cooler: CoolerConfig::default(),
            weather: WeatherConfig::default(),
            slew: SlewLimits::default(),
            focus: FocusConfig::default(),
            guiding: GuidingConfig::default(),
            calibration: CalibrationConfig::default(),
            saturation: 65000,
            plate_scale: 0.35,
            min_exposure_secs: 0.001,
            exposure_wait_margin_secs: 60.0,
            startup_timeout_secs: 60,
            long_wait_shutdown_minutes: 30,
        }
    }
}

impl ObservatoryConfig {
    /// Load and validate a configuration document.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&text).map_err(|source| ConfigError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-90.0..=90.0).contains(&self.site.latitude) {
            return Err(ConfigError::Invalid(format!(
                "site latitude {} outside [-90, 90]",
                self.site.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&self.site.longitude) {
            return Err(ConfigError::Invalid(format!(
                "site longitude {} outside [-180, 180]",
                self.site.longitude
            )));
        }
        if self.saturation == 0 {
            return Err(ConfigError::Invalid("saturation must be positive".into()));
        }
        if self.plate_scale <= 0.0 {
            return Err(ConfigError::Invalid("plate scale must be positive".into()));
        }
        if self.min_exposure_secs <= 0.0 {
            return Err(ConfigError::Invalid(
                "minimum exposure must be positive".into(),
            ));
        }
        if self.focus.iterations < 3 {
            return Err(ConfigError::Invalid(
                "focus sweep needs at least 3 samples to fit a parabola".into(),
            ));
        }
        if self.guiding.ra_damping <= 0.0 || self.guiding.dec_damping <= 0.0 {
            return Err(ConfigError::Invalid(
                "guiding damping factors must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Observer location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation_m: f64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            latitude: 45.0,
            longitude: -75.0,
            elevation_m: 300.0,
        }
    }
}

/// Camera cooler setpoints and settle behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoolerConfig {
    /// Target temperature while observing.
    pub setpoint_c: f64,
    /// Relaxed target used while shut down at night (quick reopen).
    pub idle_setpoint_c: f64,
    /// How long to wait for the sensor to settle at the setpoint.
    pub settle_minutes: u64,
    /// Sensor is considered settled within this band of the setpoint.
    pub settle_tolerance_c: f64,
}

impl Default for CoolerConfig {
    fn default() -> Self {
        Self {
            setpoint_c: -20.0,
            idle_setpoint_c: 0.0,
            settle_minutes: 10,
            settle_tolerance_c: 1.0,
        }
    }
}

/// Safety limits and polling cadence for the condition monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub humidity_limit_pct: f64,
    pub wind_limit_kph: f64,
    pub cloud_cover_limit_pct: f64,
    pub poll_minutes: u64,
    /// Minimum time the sky must stay clear before reopening.
    pub reopen_cooldown_minutes: u64,
    /// Readings older than this are treated as unavailable.
    pub staleness_minutes: i64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            humidity_limit_pct: 85.0,
            wind_limit_kph: 35.0,
            cloud_cover_limit_pct: 40.0,
            poll_minutes: 10,
            reopen_cooldown_minutes: 30,
            staleness_minutes: 30,
        }
    }
}

/// Pointing limits applied before every slew, and re-checked by the
/// task monitor as an independent safety net.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlewLimits {
    pub min_altitude_deg: f64,
    pub max_hour_angle_hours: f64,
    pub min_dec_deg: f64,
    pub max_dec_deg: f64,
    /// Consecutive slew failures before parking and waiting.
    pub max_attempts: u32,
    /// How long to wait parked between slew retry rounds.
    pub retry_minutes: u64,
}

impl Default for SlewLimits {
    fn default() -> Self {
        Self {
            min_altitude_deg: 15.0,
            max_hour_angle_hours: 5.5,
            min_dec_deg: -35.0,
            max_dec_deg: 89.0,
            max_attempts: 3,
            retry_minutes: 5,
        }
    }
}

/// Startup focus sweep and continuous drift compensation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    /// Run the coarse focus sweep before each ticket's exposures.
    pub coarse_at_start: bool,
    /// Focus test exposure = multiplier × the ticket's exposure time,
    /// clamped to a sane range.
    pub exposure_multiplier: f64,
    /// Focuser step delta between sweep samples.
    pub step: i32,
    /// Number of samples in the sweep.
    pub iterations: u32,
    /// Reject fits that land farther than this from the start position.
    pub max_travel: i32,
    /// Retries per sample when an exposure yields no usable metric.
    pub metric_retries: u32,
    /// Minutes between drift compensation adjustments.
    pub adjust_frequency_minutes: u64,
    /// Focuser steps per degree Celsius of temperature change.
    pub temperature_coefficient: f64,
    /// Temperature jumps larger than this are treated as sensor glitches.
    pub glitch_temp_jump_c: f64,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            coarse_at_start: true,
            exposure_multiplier: 0.33,
            step: 100,
            iterations: 9,
            max_travel: 1000,
            metric_retries: 3,
            adjust_frequency_minutes: 15,
            temperature_coefficient: -20.0,
            glitch_temp_jump_c: 5.0,
        }
    }
}

/// Guide loop tuning.
///
/// The camera/sky clocking angle and the axis flips are calibration values:
/// the sign convention must be verified empirically on the mounted camera,
/// not assumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidingConfig {
    /// Displacements below this many pixels are left uncorrected.
    pub threshold_px: f64,
    pub ra_damping: f64,
    pub dec_damping: f64,
    /// Cap on a single corrective move, in arcseconds. Larger implied
    /// moves mean the star was lost, not that the mount should chase it.
    pub max_move_arcsec: f64,
    /// Rotation from detector axes to sky axes, degrees.
    pub clocking_angle_deg: f64,
    pub flip_ra: bool,
    pub flip_dec: bool,
    /// Half-width of the windowed star search, pixels.
    pub search_radius_px: u32,
}

impl Default for GuidingConfig {
    fn default() -> Self {
        Self {
            threshold_px: 0.7,
            ra_damping: 0.75,
            dec_damping: 0.75,
            max_move_arcsec: 30.0,
            clocking_angle_deg: 180.0,
            flip_ra: false,
            flip_dec: false,
            search_radius_px: 20,
        }
    }
}

/// When calibration frames are taken, and how many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationTime {
    Start,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub time: CalibrationTime,
    /// Flat/dark frames per exposure time and filter.
    pub frame_count: u32,
    /// First-guess flat exposure before adaptation, seconds.
    pub initial_flat_exposure_secs: f64,
    /// Upper bound on adapted flat exposures, seconds.
    pub max_flat_exposure_secs: f64,
    /// Filters dim enough to warrant coarser exposure adjustment steps.
    pub faint_filters: Vec<String>,
    /// Bounded wait for the flat lamp to come up or shut down.
    pub lamp_timeout_secs: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            time: CalibrationTime::End,
            frame_count: 10,
            initial_flat_exposure_secs: 3.0,
            max_flat_exposure_secs: 120.0,
            faint_filters: vec!["ha".into(), "b".into()],
            lamp_timeout_secs: 60,
        }
    }
}

impl CalibrationConfig {
    pub fn is_faint(&self, filter: &str) -> bool {
        self.faint_filters
            .iter()
            .any(|f| f.eq_ignore_ascii_case(filter))
    }
}

/// Maps human filter names to device filter-wheel slots.
///
/// The observed wheel has 8 slots; any slot count deserializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterWheelMap {
    position_map: HashMap<String, u8>,
}

impl FilterWheelMap {
    pub fn new(position_map: HashMap<String, u8>) -> Self {
        Self { position_map }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let map: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        map.validate()?;
        Ok(map)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.position_map.is_empty() {
            return Err(ConfigError::Invalid("filter wheel map is empty".into()));
        }
        let mut slots: Vec<u8> = self.position_map.values().copied().collect();
        slots.sort_unstable();
        slots.dedup();
        if slots.len() != self.position_map.len() {
            return Err(ConfigError::Invalid(
                "filter wheel map assigns the same slot to two filters".into(),
            ));
        }
        Ok(())
    }

    /// Slot for a filter name, case-insensitive.
    pub fn slot_for(&self, filter: &str) -> Option<u8> {
        self.position_map
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(filter))
            .map(|(_, slot)| *slot)
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.slot_for(filter).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ObservatoryConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_latitude_rejected() {
        let mut config = ObservatoryConfig::default();
        config.site.latitude = 91.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config: ObservatoryConfig =
            serde_json::from_str(r#"{"saturation": 60000, "plate_scale": 0.5}"#).unwrap();
        assert_eq!(config.saturation, 60000);
        assert_eq!(config.plate_scale, 0.5);
        assert_eq!(config.weather.poll_minutes, 10);
    }

    #[test]
    fn filter_map_lookup_is_case_insensitive() {
        let mut slots = HashMap::new();
        slots.insert("r".to_string(), 2u8);
        slots.insert("Ha".to_string(), 5u8);
        let map = FilterWheelMap::new(slots);
        assert_eq!(map.slot_for("R"), Some(2));
        assert_eq!(map.slot_for("ha"), Some(5));
        assert_eq!(map.slot_for("g"), None);
    }

    #[test]
    fn duplicate_slots_rejected() {
        let mut slots = HashMap::new();
        slots.insert("r".to_string(), 2u8);
        slots.insert("g".to_string(), 2u8);
        let map = FilterWheelMap::new(slots);
        assert!(map.validate().is_err());
    }

    #[test]
    fn faint_filter_match_ignores_case() {
        let config = CalibrationConfig::default();
        assert!(config.is_faint("Ha"));
        assert!(!config.is_faint("r"));
    }
}
