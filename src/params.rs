//! Measurement parameters.
//!
//! [`ParameterForm`] is what a front end collects: every field is free text.
//! [`ParameterForm::parse`] turns it into a typed [`ParameterSet`] and
//! reports every bad field at once. A `ParameterSet` built directly in code is
//! checked again with [`ParameterSet::validate`] before a run starts.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::protocol::{ChannelTag, Resolution, MAX_ADDRESS};

pub const MAX_SAMPLE_COUNT: u16 = 1000;
pub const MAX_REPEATS: u32 = 1000;

/// Which channels a run measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelSelection {
    #[default]
    Left,
    Right,
    InternalCap,
    Both,
}

impl ChannelSelection {
    /// Channel tags addressed on the wire, in per-address loop order.
    pub fn tags(self) -> Vec<ChannelTag> {
        match self {
            ChannelSelection::Left => vec![ChannelTag::Left],
            ChannelSelection::Right => vec![ChannelTag::Right],
            ChannelSelection::InternalCap => vec![ChannelTag::InternalCap],
            ChannelSelection::Both => vec![ChannelTag::Left, ChannelTag::Right],
        }
    }
}

impl FromStr for ChannelSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(ChannelSelection::Left),
            "right" => Ok(ChannelSelection::Right),
            "internal" | "internalcap" | "internal_cap" => Ok(ChannelSelection::InternalCap),
            "both" => Ok(ChannelSelection::Both),
            other => Err(format!(
                "unknown channel {other:?} (expected left, right, internal or both)"
            )),
        }
    }
}

impl fmt::Display for ChannelSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelSelection::Left => "left",
            ChannelSelection::Right => "right",
            ChannelSelection::InternalCap => "internal",
            ChannelSelection::Both => "both",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Scan all 128 addresses every repeat.
    #[default]
    Sweep,
    /// Read one fixed address every repeat.
    FixedReference,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sweep" => Ok(Mode::Sweep),
            "fixed" | "fixed_reference" | "fixedreference" => Ok(Mode::FixedReference),
            other => Err(format!("unknown mode {other:?} (expected sweep or fixed)")),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Sweep => "sweep",
            Mode::FixedReference => "fixed",
        })
    }
}

/// Plot shape requested by the front end. Not used by acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlotDimensionality {
    #[default]
    TwoD,
    ThreeD,
}

impl FromStr for PlotDimensionality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "2d" => Ok(PlotDimensionality::TwoD),
            "3d" => Ok(PlotDimensionality::ThreeD),
            other => Err(format!("unknown plot type {other:?} (expected 2d or 3d)")),
        }
    }
}

impl fmt::Display for PlotDimensionality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlotDimensionality::TwoD => "2d",
            PlotDimensionality::ThreeD => "3d",
        })
    }
}

/// Immutable configuration of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub channel: ChannelSelection,
    pub mode: Mode,
    /// Address read in fixed-reference mode; required there, ignored otherwise.
    pub reference_value: Option<u8>,
    pub resolution: Resolution,
    pub sample_count: u16,
    pub repeats: u32,
    pub repeat_interval: Duration,
    /// With a non-zero `repeat_interval`, replaces `repeats` by
    /// `stop_time / repeat_interval`.
    pub stop_time: Option<Duration>,
    pub plot: PlotDimensionality,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            channel: ChannelSelection::Left,
            mode: Mode::Sweep,
            reference_value: None,
            resolution: Resolution::R000,
            sample_count: 10,
            repeats: 1,
            repeat_interval: Duration::ZERO,
            stop_time: None,
            plot: PlotDimensionality::TwoD,
        }
    }
}

impl ParameterSet {
    /// Check every field, collecting all failures.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if !(1..=MAX_SAMPLE_COUNT).contains(&self.sample_count) {
            errors.push(ValidationError::new(
                "sample_count",
                format!("must be between 1 and {MAX_SAMPLE_COUNT}"),
            ));
        }

        if self.mode == Mode::FixedReference {
            match self.reference_value {
                None => errors.push(ValidationError::new(
                    "reference_value",
                    "required in fixed-reference mode",
                )),
                Some(v) if v > MAX_ADDRESS => errors.push(ValidationError::new(
                    "reference_value",
                    format!("must be between 0 and {MAX_ADDRESS}"),
                )),
                Some(_) => {}
            }
        }

        match self.stop_time_repeats() {
            Some(0) => errors.push(ValidationError::new(
                "stop_time",
                "shorter than one repeat interval",
            )),
            Some(_) => {}
            None => {
                if !(1..=MAX_REPEATS).contains(&self.repeats) {
                    errors.push(ValidationError::new(
                        "repeats",
                        format!("must be between 1 and {MAX_REPEATS}"),
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Total number of repeats the run will perform.
    pub fn resolved_repeats(&self) -> u32 {
        self.stop_time_repeats().unwrap_or(self.repeats)
    }

    pub fn channel_tags(&self) -> Vec<ChannelTag> {
        self.channel.tags()
    }

    /// A right-channel sweep derives a reference-pulse threshold first.
    pub fn needs_calibration(&self) -> bool {
        self.channel == ChannelSelection::Right && self.mode == Mode::Sweep
    }

    fn stop_time_repeats(&self) -> Option<u32> {
        let stop = self.stop_time?;
        let interval = self.repeat_interval.as_nanos();
        if interval == 0 {
            return None;
        }
        Some(u32::try_from(stop.as_nanos() / interval).unwrap_or(u32::MAX))
    }
}

/// Raw text fields as typed by an operator. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParameterForm {
    pub channel: String,
    pub mode: String,
    pub reference_value: String,
    pub resolution: String,
    pub sample_count: String,
    pub repeats: String,
    pub repeat_interval: String,
    pub stop_time: String,
    pub plot: String,
}

impl ParameterForm {
    /// Parse and validate, reporting every bad field.
    pub fn parse(&self) -> Result<ParameterSet, Vec<ValidationError>> {
        let mut errors = Vec::new();
        let defaults = ParameterSet::default();

        let channel = field(&mut errors, "channel", &self.channel, defaults.channel);
        let mode = field(&mut errors, "mode", &self.mode, defaults.mode);
        let resolution = field(&mut errors, "resolution", &self.resolution, defaults.resolution);
        let sample_count = number(&mut errors, "sample_count", &self.sample_count);
        let repeats = number(&mut errors, "repeats", &self.repeats);
        let plot = field(&mut errors, "plot", &self.plot, defaults.plot);

        let reference_value = if self.reference_value.trim().is_empty() {
            None
        } else {
            number(&mut errors, "reference_value", &self.reference_value)
        };
        let repeat_interval = if self.repeat_interval.trim().is_empty() {
            Some(Duration::ZERO)
        } else {
            seconds(&mut errors, "repeat_interval", &self.repeat_interval)
        };
        let stop_time = if self.stop_time.trim().is_empty() {
            None
        } else {
            seconds(&mut errors, "stop_time", &self.stop_time)
        };

        let (Some(sample_count), Some(repeats), Some(repeat_interval)) =
            (sample_count, repeats, repeat_interval)
        else {
            return Err(errors);
        };
        if !errors.is_empty() {
            return Err(errors);
        }

        let params = ParameterSet {
            channel,
            mode,
            reference_value,
            resolution,
            sample_count,
            repeats,
            repeat_interval,
            stop_time,
            plot,
        };
        params.validate()?;
        Ok(params)
    }
}

impl From<&ParameterSet> for ParameterForm {
    fn from(p: &ParameterSet) -> Self {
        Self {
            channel: p.channel.to_string(),
            mode: p.mode.to_string(),
            reference_value: p.reference_value.map(|v| v.to_string()).unwrap_or_default(),
            resolution: p.resolution.to_string(),
            sample_count: p.sample_count.to_string(),
            repeats: p.repeats.to_string(),
            repeat_interval: p.repeat_interval.as_secs_f64().to_string(),
            stop_time: p
                .stop_time
                .map(|d| d.as_secs_f64().to_string())
                .unwrap_or_default(),
            plot: p.plot.to_string(),
        }
    }
}

fn field<T>(errors: &mut Vec<ValidationError>, name: &'static str, text: &str, default: T) -> T
where
    T: FromStr<Err = String>,
{
    if text.trim().is_empty() {
        return default;
    }
    text.parse().unwrap_or_else(|reason| {
        errors.push(ValidationError::new(name, reason));
        default
    })
}

fn number<T: FromStr>(
    errors: &mut Vec<ValidationError>,
    name: &'static str,
    text: &str,
) -> Option<T> {
    match text.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            errors.push(ValidationError::new(
                name,
                format!("{:?} is not a whole number in range", text.trim()),
            ));
            None
        }
    }
}

fn seconds(errors: &mut Vec<ValidationError>, name: &'static str, text: &str) -> Option<Duration> {
    let parsed = text
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|s| Duration::try_from_secs_f64(s).ok());
    if parsed.is_none() {
        errors.push(ValidationError::new(
            name,
            format!("{:?} is not a non-negative number of seconds", text.trim()),
        ));
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> ParameterForm {
        ParameterForm {
            channel: "both".into(),
            mode: "sweep".into(),
            reference_value: String::new(),
            resolution: "011".into(),
            sample_count: "20".into(),
            repeats: "3".into(),
            repeat_interval: "0.5".into(),
            stop_time: String::new(),
            plot: "2d".into(),
        }
    }

    #[test]
    fn parses_a_complete_form() {
        let p = form().parse().unwrap();
        assert_eq!(p.channel, ChannelSelection::Both);
        assert_eq!(p.resolution, Resolution::R011);
        assert_eq!(p.sample_count, 20);
        assert_eq!(p.repeat_interval, Duration::from_millis(500));
        assert_eq!(p.resolved_repeats(), 3);
        assert_eq!(p.channel_tags(), vec![ChannelTag::Left, ChannelTag::Right]);
    }

    #[test]
    fn non_numeric_sample_count_is_rejected() {
        let mut f = form();
        f.sample_count = "abc".into();
        let errors = f.parse().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "sample_count");
    }

    #[test]
    fn every_bad_field_is_reported() {
        let mut f = form();
        f.sample_count = "abc".into();
        f.repeats = "-1".into();
        f.channel = "middle".into();
        f.repeat_interval = "soon".into();
        let fields: Vec<_> = f.parse().unwrap_err().into_iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["channel", "sample_count", "repeats", "repeat_interval"]
        );
    }

    #[test]
    fn range_errors_are_collected_together() {
        let params = ParameterSet {
            sample_count: 0,
            repeats: 1001,
            mode: Mode::FixedReference,
            reference_value: Some(200),
            ..ParameterSet::default()
        };
        let fields: Vec<_> = params
            .validate()
            .unwrap_err()
            .into_iter()
            .map(|e| e.field)
            .collect();
        assert_eq!(fields, vec!["sample_count", "reference_value", "repeats"]);
    }

    #[test]
    fn fixed_reference_requires_a_reference() {
        let mut f = form();
        f.mode = "fixed".into();
        let errors = f.parse().unwrap_err();
        assert_eq!(errors[0].field, "reference_value");

        f.reference_value = "42".into();
        assert_eq!(f.parse().unwrap().reference_value, Some(42));
    }

    #[test]
    fn stop_time_overrides_repeats() {
        let params = ParameterSet {
            repeats: 3,
            repeat_interval: Duration::from_secs(20),
            stop_time: Some(Duration::from_secs(100)),
            ..ParameterSet::default()
        };
        assert!(params.validate().is_ok());
        assert_eq!(params.resolved_repeats(), 5);
    }

    #[test]
    fn stop_time_without_interval_is_ignored() {
        let params = ParameterSet {
            repeats: 4,
            stop_time: Some(Duration::from_secs(100)),
            ..ParameterSet::default()
        };
        assert_eq!(params.resolved_repeats(), 4);
    }

    #[test]
    fn stop_time_shorter_than_interval_is_rejected() {
        let params = ParameterSet {
            repeat_interval: Duration::from_secs(20),
            stop_time: Some(Duration::from_secs(10)),
            ..ParameterSet::default()
        };
        let errors = params.validate().unwrap_err();
        assert_eq!(errors[0].field, "stop_time");
    }

    #[test]
    fn calibration_only_for_right_channel_sweeps() {
        let mut p = ParameterSet {
            channel: ChannelSelection::Right,
            ..ParameterSet::default()
        };
        assert!(p.needs_calibration());
        p.mode = Mode::FixedReference;
        assert!(!p.needs_calibration());
        p.mode = Mode::Sweep;
        p.channel = ChannelSelection::Both;
        assert!(!p.needs_calibration());
    }

    #[test]
    fn form_round_trips_through_parameter_set() {
        let p = form().parse().unwrap();
        let back = ParameterForm::from(&p).parse().unwrap();
        assert_eq!(back, p);
    }
}
