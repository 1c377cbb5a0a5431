//! Configuration management.
//!
//! `Settings` is the measurement configuration value object: it is read by
//! the command choreography when building device commands and copied into
//! each queued request, never back-referenced by the session. The same
//! struct round-trips through the project `settings.txt` file as plain
//! `key = value` toml text.
//!
//! All protocol timeouts live in [`TimeoutSettings`]. They are calibration
//! constants tuned against the real device, not protocol guarantees, so they
//! are deliberately config-overridable.

use crate::error::{AppResult, VnaError};
use crate::measurement::SParam;
use config::Config;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Highest point count the HP-8753 accepts per sweep.
pub const MAX_POINTS: u32 = 1601;

/// Highest valid GPIB address.
pub const MAX_ADDRESS: u8 = 30;

/// Data format requested from the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    /// Magnitude / angle pairs.
    #[serde(rename = "MA")]
    MagnitudeAngle,
    /// dB / angle pairs.
    #[serde(rename = "DB")]
    DbAngle,
    /// Real / imaginary pairs.
    #[serde(rename = "RI")]
    RealImaginary,
}

impl DataFormat {
    /// Argument for the hpctrl `FMT` command.
    pub fn command_arg(self) -> &'static str {
        match self {
            DataFormat::MagnitudeAngle => "MA",
            DataFormat::DbAngle => "DB",
            DataFormat::RealImaginary => "RI",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_arg())
    }
}

/// Unit used for the sweep frequency span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrequencyUnit {
    #[serde(rename = "MHz")]
    MegaHertz,
    #[serde(rename = "GHz")]
    GigaHertz,
}

impl FrequencyUnit {
    /// Argument for the hpctrl `FREQ` command and the raw STAR/STOP suffix.
    pub fn command_arg(self) -> &'static str {
        match self {
            FrequencyUnit::MegaHertz => "MHZ",
            FrequencyUnit::GigaHertz => "GHZ",
        }
    }

    /// Scale factor to hertz.
    pub fn hertz(self) -> f64 {
        match self {
            FrequencyUnit::MegaHertz => 1e6,
            FrequencyUnit::GigaHertz => 1e9,
        }
    }
}

impl fmt::Display for FrequencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_arg())
    }
}

/// How the hpctrl child process is spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HpctrlSettings {
    /// Path to the hpctrl executable.
    pub program: PathBuf,
    /// Arguments passed on spawn; `-i` selects interactive mode.
    pub args: Vec<String>,
    /// Upper bound on annotation lines read before the `#` data marker.
    pub max_header_lines: usize,
}

impl Default for HpctrlSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("hpctrl"),
            args: vec!["-i".to_string()],
            max_header_lines: 32,
        }
    }
}

/// Protocol timing constants. Tuned empirically against the instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Settle delay after every line written to hpctrl.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    /// Deadline for the ping sentinel reply.
    #[serde(with = "humantime_serde")]
    pub ping: Duration,
    /// Deadline for short replies (terminal pass-through, `q POIN?`).
    #[serde(with = "humantime_serde")]
    pub reply: Duration,
    /// Deadline for multi-line state/calibration dumps.
    #[serde(with = "humantime_serde")]
    pub dump: Duration,
    /// Deadline for each per-parameter status line of a sweep.
    #[serde(with = "humantime_serde")]
    pub status_line: Duration,
    /// Deadline for each header line before the `#` marker.
    #[serde(with = "humantime_serde")]
    pub header_line: Duration,
    /// Deadline for the block of sample lines of one sweep.
    #[serde(with = "humantime_serde")]
    pub points_read: Duration,
    /// Deadline for the final drain read after a continuous run stops.
    #[serde(with = "humantime_serde")]
    pub drain: Duration,
    /// Grace delay after `M-` before the drain read.
    #[serde(with = "humantime_serde")]
    pub grace: Duration,
    /// Delay before respawning hpctrl, so OS resources settle.
    #[serde(with = "humantime_serde")]
    pub respawn: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(100),
            ping: Duration::from_secs(2),
            reply: Duration::from_secs(2),
            dump: Duration::from_secs(5),
            status_line: Duration::from_secs(5),
            header_line: Duration::from_secs(2),
            points_read: Duration::from_secs(30),
            drain: Duration::from_secs(2),
            grace: Duration::from_secs(1),
            respawn: Duration::from_secs(2),
        }
    }
}

/// The full measurement configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// GPIB address of the analyzer.
    pub address: u8,
    /// Port 1 extension length in meters.
    pub port1_length: f64,
    /// Port 2 extension length in meters.
    pub port2_length: f64,
    /// Cable velocity factor.
    pub velocity_factor: f64,
    pub frequency_unit: FrequencyUnit,
    pub freq_start: f64,
    pub freq_stop: f64,
    /// Requested point count; the device may snap it to a supported value,
    /// in which case `prepare_measurement` writes the snapped value back.
    pub points: u32,
    pub format: DataFormat,
    /// Requested S-parameters, up to four.
    pub parameters: Vec<SParam>,
    pub continuous: bool,
    pub hpctrl: HpctrlSettings,
    pub timeouts: TimeoutSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            address: 16,
            port1_length: 0.0,
            port2_length: 0.0,
            velocity_factor: 1.0,
            frequency_unit: FrequencyUnit::GigaHertz,
            freq_start: 1.0,
            freq_stop: 2.0,
            points: 201,
            format: DataFormat::RealImaginary,
            parameters: vec![SParam::S21],
            continuous: false,
            hpctrl: HpctrlSettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings from `config/<name>.toml` (default `config/default`).
    pub fn new(config_name: Option<&str>) -> AppResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads the `key = value` settings text of a saved project.
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&text)
            .map_err(|e| VnaError::Configuration(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Writes the settings as `key = value` text.
    pub fn to_file(&self, path: &Path) -> AppResult<()> {
        let text = toml::to_string(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Semantic validation of the configuration, applied before every run.
    pub fn validate(&self) -> AppResult<()> {
        if self.address > MAX_ADDRESS {
            return Err(VnaError::Configuration(format!(
                "GPIB address {} out of range 0..={}",
                self.address, MAX_ADDRESS
            )));
        }
        if !(self.freq_start < self.freq_stop) {
            return Err(VnaError::Configuration(format!(
                "start frequency {} must be below stop frequency {}",
                self.freq_start, self.freq_stop
            )));
        }
        if self.points == 0 || self.points > MAX_POINTS {
            return Err(VnaError::Configuration(format!(
                "point count {} out of range 1..={}",
                self.points, MAX_POINTS
            )));
        }
        if self.parameters.is_empty() {
            return Err(VnaError::Configuration(
                "at least one S-parameter must be requested".to_string(),
            ));
        }
        if self.velocity_factor <= 0.0 {
            return Err(VnaError::Configuration(format!(
                "velocity factor {} must be positive",
                self.velocity_factor
            )));
        }
        if self.port1_length < 0.0 || self.port2_length < 0.0 {
            return Err(VnaError::Configuration(
                "port extension lengths must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_inverted_span() {
        let settings = Settings {
            freq_start: 2.0,
            freq_stop: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(VnaError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_point_overflow() {
        let settings = Settings {
            points: MAX_POINTS + 1,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_parameter_set() {
        let settings = Settings {
            parameters: vec![],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_text_round_trip() {
        let settings = Settings {
            address: 20,
            freq_start: 0.3,
            freq_stop: 3.0,
            points: 401,
            format: DataFormat::MagnitudeAngle,
            parameters: vec![SParam::S11, SParam::S21],
            continuous: true,
            ..Default::default()
        };

        let text = toml::to_string(&settings).unwrap();
        assert!(text.contains("address = 20"));
        assert!(text.contains("continuous = true"));

        let restored: Settings = toml::from_str(&text).unwrap();
        assert_eq!(restored.address, 20);
        assert_eq!(restored.points, 401);
        assert_eq!(restored.format, DataFormat::MagnitudeAngle);
        assert_eq!(restored.parameters, vec![SParam::S11, SParam::S21]);
        assert!(restored.continuous);
    }

    #[test]
    fn test_command_args() {
        assert_eq!(DataFormat::RealImaginary.command_arg(), "RI");
        assert_eq!(DataFormat::DbAngle.command_arg(), "DB");
        assert_eq!(FrequencyUnit::MegaHertz.command_arg(), "MHZ");
        assert_eq!(FrequencyUnit::GigaHertz.command_arg(), "GHZ");
    }
}
