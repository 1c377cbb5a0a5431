//! Project persistence.
//!
//! A project is a plain directory so operators can inspect and diff it:
//!
//! ```text
//! my_project/
//!   description.txt        free-form operator notes
//!   settings.txt           sweep configuration (TOML)
//!   state.txt              instrument state dump, if fetched
//!   calibration.txt        calibration blob, if fetched
//!   measurements/
//!     measurement1.s2p     collected sweeps, on-wire text
//!     measurement2.s2p
//! ```
//!
//! Every file is optional on load; a directory holding only a description is
//! still a valid project.

use crate::config::Settings;
use crate::error::{AppResult, VnaError};
use crate::measurement::Dataset;
use log::{debug, warn};
use std::fs;
use std::path::Path;

const DESCRIPTION_FILE: &str = "description.txt";
const SETTINGS_FILE: &str = "settings.txt";
const STATE_FILE: &str = "state.txt";
const CALIBRATION_FILE: &str = "calibration.txt";
const MEASUREMENTS_DIR: &str = "measurements";
const MEASUREMENT_PREFIX: &str = "measurement";
const MEASUREMENT_EXT: &str = "s2p";

/// In-memory project: operator notes, captured instrument state and
/// calibration, and the collected sweep dataset.
#[derive(Debug, Default)]
pub struct Project {
    pub description: String,
    pub state: Option<String>,
    pub calibration: Option<String>,
    pub dataset: Option<Dataset>,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an instrument state dump; blank dumps are dropped.
    pub fn set_state(&mut self, text: String) {
        if text.trim().is_empty() {
            self.state = None;
        } else {
            self.state = Some(text);
        }
    }

    /// Stores a calibration blob; blank blobs are dropped.
    pub fn set_calibration(&mut self, text: String) {
        if text.trim().is_empty() {
            self.calibration = None;
        } else {
            self.calibration = Some(text);
        }
    }

    /// First line of the calibration blob, which names the calibration kind
    /// on the wire.
    pub fn calibration_type(&self) -> Option<&str> {
        self.calibration
            .as_deref()
            .and_then(|c| c.lines().next())
            .map(str::trim)
    }

    /// Number of collected sweep frames.
    pub fn frames(&self) -> usize {
        self.dataset.as_ref().map_or(0, Dataset::len)
    }

    /// Writes the project to `dir`, creating it if needed. Existing
    /// measurement files are replaced so the directory mirrors memory.
    pub fn save(&self, dir: &Path, settings: &Settings) -> AppResult<()> {
        fs::create_dir_all(dir)?;

        fs::write(dir.join(DESCRIPTION_FILE), &self.description)?;
        settings.to_file(&dir.join(SETTINGS_FILE))?;

        if let Some(state) = &self.state {
            fs::write(dir.join(STATE_FILE), state)?;
        }
        if let Some(calibration) = &self.calibration {
            fs::write(dir.join(CALIBRATION_FILE), calibration)?;
        }

        let meas_dir = dir.join(MEASUREMENTS_DIR);
        if meas_dir.is_dir() {
            fs::remove_dir_all(&meas_dir)?;
        }
        if let Some(dataset) = &self.dataset {
            if !dataset.is_empty() {
                fs::create_dir_all(&meas_dir)?;
                for frame in 0..dataset.len() {
                    let text = dataset.print_measurement(frame)?;
                    let name =
                        format!("{}{}.{}", MEASUREMENT_PREFIX, frame + 1, MEASUREMENT_EXT);
                    fs::write(meas_dir.join(name), text)?;
                }
            }
        }

        debug!("project saved to {}", dir.display());
        Ok(())
    }

    /// Loads a project from `dir`. Missing files are tolerated; present but
    /// unreadable ones are errors. Returns the project together with the
    /// stored sweep settings, if the directory has any.
    pub fn load(dir: &Path) -> AppResult<(Self, Option<Settings>)> {
        if !dir.is_dir() {
            return Err(VnaError::Configuration(format!(
                "not a project directory: {}",
                dir.display()
            )));
        }

        let mut project = Self::new();

        let desc_path = dir.join(DESCRIPTION_FILE);
        if desc_path.is_file() {
            project.description = fs::read_to_string(desc_path)?;
        }

        let state_path = dir.join(STATE_FILE);
        if state_path.is_file() {
            project.set_state(fs::read_to_string(state_path)?);
        }

        let calib_path = dir.join(CALIBRATION_FILE);
        if calib_path.is_file() {
            project.set_calibration(fs::read_to_string(calib_path)?);
        }

        let settings_path = dir.join(SETTINGS_FILE);
        let settings = if settings_path.is_file() {
            Some(Settings::from_file(&settings_path)?)
        } else {
            None
        };

        project.dataset = load_measurements(&dir.join(MEASUREMENTS_DIR))?;

        debug!(
            "project loaded from {} ({} frames)",
            dir.display(),
            project.frames()
        );
        Ok((project, settings))
    }
}

/// Rebuilds the dataset from `measurements/`, replaying each file in frame
/// order. The parameter set is recovered from the first file's params
/// annotation line.
fn load_measurements(dir: &Path) -> AppResult<Option<Dataset>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut indexed: Vec<(usize, std::path::PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let stem = match path.file_stem().and_then(|s| s.to_str()) {
            Some(s) => s,
            None => continue,
        };
        if path.extension().and_then(|e| e.to_str()) != Some(MEASUREMENT_EXT) {
            continue;
        }
        let index: usize = match stem
            .strip_prefix(MEASUREMENT_PREFIX)
            .and_then(|n| n.parse().ok())
        {
            Some(n) => n,
            None => {
                warn!("ignoring stray file in measurements: {}", path.display());
                continue;
            }
        };
        indexed.push((index, path));
    }
    if indexed.is_empty() {
        return Ok(None);
    }
    indexed.sort_by_key(|(index, _)| *index);

    let first = fs::read_to_string(&indexed[0].1)?;
    let params = Dataset::params_from_header(&first);
    if params.is_empty() {
        return Err(VnaError::Parse(format!(
            "no parameter annotation in {}",
            indexed[0].1.display()
        )));
    }
    let mut dataset = Dataset::new(&params)?;
    dataset.add_measurement(&first)?;
    for (_, path) in indexed.iter().skip(1) {
        let text = fs::read_to_string(path)?;
        dataset.add_measurement(&text)?;
    }
    Ok(Some(dataset))
}
