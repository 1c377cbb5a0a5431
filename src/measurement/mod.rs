//! Measurement data model.
//!
//! Raw sweep text from hpctrl is structured into a frequency-indexed record
//! per requested S-parameter. Numeric fields are kept as the raw text the
//! device emitted so that [`Dataset::print_measurement`] is a byte-exact
//! round trip with [`Dataset::add_measurement`]; values are parsed to `f64`
//! only in the read accessors the plotting collaborator uses.
//!
//! The device transmits parameter pairs in the lexicographically sorted
//! order of the requested set, except that S12 and S21 always arrive in
//! swapped relative order. That quirk is reproduced exactly in
//! [`Dataset::wire_order`].

use crate::error::{AppResult, VnaError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Header prefix hpctrl uses for the parameter list annotation line.
pub const PARAMS_HEADER_PREFIX: &str = "!    Params:";

/// One of the four scattering parameters a sweep may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SParam {
    S11,
    S12,
    S21,
    S22,
}

impl SParam {
    pub fn as_str(self) -> &'static str {
        match self {
            SParam::S11 => "S11",
            SParam::S12 => "S12",
            SParam::S21 => "S21",
            SParam::S22 => "S22",
        }
    }

    /// All four parameters in lexicographic order.
    pub fn all() -> [SParam; 4] {
        [SParam::S11, SParam::S12, SParam::S21, SParam::S22]
    }
}

impl fmt::Display for SParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SParam {
    type Err = VnaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "S11" => Ok(SParam::S11),
            "S12" => Ok(SParam::S12),
            "S21" => Ok(SParam::S21),
            "S22" => Ok(SParam::S22),
            other => Err(VnaError::UnknownParameter(other.to_string())),
        }
    }
}

/// One sample of one sweep: a frequency and one raw value pair per
/// parameter, in wire order. Raw text is preserved for the round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Sample {
    frequency: String,
    values: Vec<(String, String)>,
}

/// One completed measurement pass.
///
/// Immutable once appended to the [`Dataset`]; the UI addresses it by its
/// frame index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepRecord {
    header: Vec<String>,
    samples: Vec<Sample>,
}

impl SweepRecord {
    /// The raw annotation/metadata lines (`!` and `#` prefixed).
    pub fn header_lines(&self) -> &[String] {
        &self.header
    }

    /// Number of frequency points in this sweep.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// The sweep history of one measurement run.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    parameters: Vec<SParam>,
    wire_order: Vec<SParam>,
    sweeps: Vec<SweepRecord>,
}

impl Dataset {
    /// Creates an empty dataset for a fixed set of requested parameters.
    ///
    /// The set is deduplicated and sorted; it cannot change for the lifetime
    /// of the dataset.
    pub fn new(requested: &[SParam]) -> AppResult<Self> {
        let mut parameters = requested.to_vec();
        parameters.sort();
        parameters.dedup();
        if parameters.is_empty() {
            return Err(VnaError::Configuration(
                "dataset needs at least one requested parameter".to_string(),
            ));
        }

        let wire_order = Self::wire_order(&parameters);
        Ok(Self {
            parameters,
            wire_order,
            sweeps: Vec::new(),
        })
    }

    /// The order parameter pairs appear in on each sample line.
    ///
    /// Sorted order of the requested set, with S12 and S21 swapped when both
    /// are present. The device always transmits them that way.
    pub fn wire_order(sorted: &[SParam]) -> Vec<SParam> {
        let mut order = sorted.to_vec();
        if let (Some(i12), Some(i21)) = (
            order.iter().position(|p| *p == SParam::S12),
            order.iter().position(|p| *p == SParam::S21),
        ) {
            order.swap(i12, i21);
        }
        order
    }

    /// The requested parameter set, sorted.
    pub fn parameters(&self) -> &[SParam] {
        &self.parameters
    }

    /// Number of recorded sweeps ("frames").
    pub fn len(&self) -> usize {
        self.sweeps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sweeps.is_empty()
    }

    /// Parses one raw sweep text and appends it as a new frame.
    ///
    /// Lines starting with `!` or `#` become header metadata; every other
    /// non-empty line is `frequency v1 v2 [v1 v2 …]` with one pair per
    /// parameter in wire order. Returns the new frame index.
    pub fn add_measurement(&mut self, raw: &str) -> AppResult<usize> {
        if raw.trim().is_empty() {
            return Err(VnaError::Parse("empty sweep text".to_string()));
        }

        let mut header = Vec::new();
        let mut samples: Vec<Sample> = Vec::new();

        for line in raw.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('!') || line.starts_with('#') {
                header.push(line.to_string());
                continue;
            }

            let mut fields = line.split_whitespace();
            let frequency = fields
                .next()
                .ok_or_else(|| VnaError::Parse(format!("blank sample line: {:?}", line)))?
                .to_string();

            let mut values = Vec::with_capacity(self.wire_order.len());
            for param in &self.wire_order {
                let v1 = fields.next();
                let v2 = fields.next();
                match (v1, v2) {
                    (Some(a), Some(b)) => values.push((a.to_string(), b.to_string())),
                    _ => {
                        return Err(VnaError::Parse(format!(
                            "sample line is missing the {} pair: {:?}",
                            param, line
                        )))
                    }
                }
            }

            // Duplicate frequency keys: the later sample wins.
            if let Some(existing) = samples.iter_mut().find(|s| s.frequency == frequency) {
                existing.values = values;
            } else {
                samples.push(Sample { frequency, values });
            }
        }

        self.sweeps.push(SweepRecord { header, samples });
        Ok(self.sweeps.len() - 1)
    }

    /// The `{frequency → (v1, v2)}` view of one parameter of one frame, in
    /// sweep order, or `None` when the tag was not requested or the frame
    /// index is out of range. Values that fail to parse are skipped.
    pub fn get_measurement(&self, param: SParam, frame: usize) -> Option<Vec<(f64, (f64, f64))>> {
        let column = self.wire_order.iter().position(|p| *p == param)?;
        let sweep = self.sweeps.get(frame)?;

        let mut view = Vec::with_capacity(sweep.samples.len());
        for sample in &sweep.samples {
            let freq: f64 = match sample.frequency.parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            let (raw1, raw2) = &sample.values[column];
            if let (Ok(v1), Ok(v2)) = (raw1.parse::<f64>(), raw2.parse::<f64>()) {
                view.push((freq, (v1, v2)));
            }
        }
        Some(view)
    }

    /// Direct access to one frame.
    pub fn sweep(&self, frame: usize) -> Option<&SweepRecord> {
        self.sweeps.get(frame)
    }

    /// Serializes one frame back to the line-oriented sweep text.
    ///
    /// Exact round trip with [`Dataset::add_measurement`]; this is also the
    /// on-disk export format.
    pub fn print_measurement(&self, frame: usize) -> AppResult<String> {
        let sweep = self
            .sweeps
            .get(frame)
            .ok_or(VnaError::FrameOutOfRange(frame))?;

        let mut out = String::new();
        for line in &sweep.header {
            out.push_str(line);
            out.push('\n');
        }
        for sample in &sweep.samples {
            out.push_str(&sample.frequency);
            for (v1, v2) in &sample.values {
                out.push(' ');
                out.push_str(v1);
                out.push(' ');
                out.push_str(v2);
            }
            out.push('\n');
        }
        Ok(out)
    }

    /// Rediscovers the requested parameter set from the `!    Params:`
    /// annotation line of a saved sweep, for project reload.
    pub fn params_from_header(raw: &str) -> Vec<SParam> {
        for line in raw.lines() {
            if let Some(rest) = line.strip_prefix(PARAMS_HEADER_PREFIX) {
                let mut params: Vec<SParam> = rest
                    .split_whitespace()
                    .filter_map(|tag| tag.parse().ok())
                    .collect();
                params.sort();
                params.dedup();
                return params;
            }
        }
        Vec::new()
    }
}
