//! Exposure identity and lifecycle types.

use crate::errors::ParseError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use super::usability::UsabilityVector;

/// Detector family an exposure was taken with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorFamily {
    /// The PN camera (one per observation).
    Pn,
    /// The two MOS cameras, distinguished by the prefix lead digit.
    Mos,
}

impl DetectorFamily {
    /// Lower-case tag used in artifact names (`pn`, `mos`).
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Pn => "pn",
            Self::Mos => "mos",
        }
    }

    /// Name of the discovery listing produced for this family.
    #[must_use]
    pub fn listing_file(self) -> &'static str {
        match self {
            Self::Pn => "pn_exposures.txt",
            Self::Mos => "mos_exposures.txt",
        }
    }

    fn grammar(self) -> &'static Regex {
        static PN: OnceLock<Regex> = OnceLock::new();
        static MOS: OnceLock<Regex> = OnceLock::new();
        match self {
            Self::Pn => PN.get_or_init(|| compile(r"^[SU][0-9]{3}$")),
            Self::Mos => MOS.get_or_init(|| compile(r"^[12][SU][0-9]{3}$")),
        }
    }
}

#[allow(clippy::expect_used)]
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static prefix grammar compiles")
}

impl fmt::Display for DetectorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pn => write!(f, "PN"),
            Self::Mos => write!(f, "MOS"),
        }
    }
}

/// Whether the exposure was part of the observation schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleFlag {
    /// `S` prefix character.
    Scheduled,
    /// `U` prefix character.
    Unscheduled,
}

impl ScheduleFlag {
    /// The single-character code used in prefixes and tool arguments.
    #[must_use]
    pub fn code(self) -> char {
        match self {
            Self::Scheduled => 'S',
            Self::Unscheduled => 'U',
        }
    }

    fn from_code(c: char) -> Option<Self> {
        match c {
            'S' => Some(Self::Scheduled),
            'U' => Some(Self::Unscheduled),
            _ => None,
        }
    }
}

/// A validated exposure prefix such as `S003` (PN) or `1S001` (MOS1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExposurePrefix {
    family: DetectorFamily,
    /// MOS camera index (1 or 2); `None` for PN.
    camera: Option<u8>,
    schedule: ScheduleFlag,
    sequence: u16,
}

impl ExposurePrefix {
    /// Parses a prefix against the family-specific grammar.
    pub fn parse(family: DetectorFamily, text: &str) -> Result<Self, ParseError> {
        if !family.grammar().is_match(text) {
            return Err(ParseError::new(
                text,
                format!("not a valid {family} exposure prefix"),
            ));
        }

        let mut chars = text.chars();
        let camera = match family {
            DetectorFamily::Mos => chars
                .next()
                .and_then(|c| c.to_digit(10))
                .and_then(|d| u8::try_from(d).ok()),
            DetectorFamily::Pn => None,
        };
        let schedule = chars
            .next()
            .and_then(ScheduleFlag::from_code)
            .ok_or_else(|| ParseError::new(text, "missing schedule flag"))?;
        let sequence = chars
            .as_str()
            .parse::<u16>()
            .map_err(|e| ParseError::new(text, e.to_string()))?;

        Ok(Self {
            family,
            camera,
            schedule,
            sequence,
        })
    }

    /// Returns the detector family.
    #[must_use]
    pub fn family(&self) -> DetectorFamily {
        self.family
    }

    /// Returns the MOS camera index, if any.
    #[must_use]
    pub fn camera(&self) -> Option<u8> {
        self.camera
    }

    /// Returns the schedule flag.
    #[must_use]
    pub fn schedule(&self) -> ScheduleFlag {
        self.schedule
    }

    /// Returns the exposure sequence number.
    #[must_use]
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// The family-qualified prefix used in artifact names, e.g. `mos1S001`.
    #[must_use]
    pub fn detpref(&self) -> String {
        format!("{}{}", self.family.tag(), self)
    }
}

impl fmt::Display for ExposurePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(camera) = self.camera {
            write!(f, "{camera}")?;
        }
        write!(f, "{}{:03}", self.schedule.code(), self.sequence)
    }
}

impl FromStr for ExposurePrefix {
    type Err = ParseError;

    /// Parses a prefix, inferring the family from its length.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.len() {
            4 => Self::parse(DetectorFamily::Pn, s),
            5 => Self::parse(DetectorFamily::Mos, s),
            _ => Err(ParseError::new(s, "prefix must be 4 (PN) or 5 (MOS) characters")),
        }
    }
}

/// Where an exposure is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ExposureStatus {
    /// Listed by the discovery step.
    Discovered,
    /// Event lists were generated.
    EventsGenerated,
    /// Passed the filtering gate.
    Filtered,
    /// Removed from the active set.
    Dropped(String),
    /// Spectral extraction produced a spectrum.
    SpectraReady,
    /// Background estimation ran.
    BackgroundReady,
    /// The converted product exists.
    Converted,
}

impl ExposureStatus {
    /// Returns true if the exposure was dropped.
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped(_))
    }
}

impl fmt::Display for ExposureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovered => write!(f, "discovered"),
            Self::EventsGenerated => write!(f, "events generated"),
            Self::Filtered => write!(f, "filtered"),
            Self::Dropped(reason) => write!(f, "dropped ({reason})"),
            Self::SpectraReady => write!(f, "spectra ready"),
            Self::BackgroundReady => write!(f, "background ready"),
            Self::Converted => write!(f, "converted"),
        }
    }
}

/// Outcome of point-source masking for an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskState {
    /// Masking has not run yet.
    #[default]
    Pending,
    /// The mask artifact exists.
    Available,
    /// All attempts finished without a mask artifact.
    Unavailable,
}

/// State of background-model estimation for an exposure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum BackgroundState {
    /// Estimation has not run yet.
    #[default]
    Pending,
    /// The estimation tool produced its particle background model.
    Estimated,
    /// Estimation was skipped.
    Skipped(String),
}

/// One exposure and everything the controller learned about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exposure {
    /// The validated prefix.
    pub prefix: ExposurePrefix,
    /// Lifecycle status.
    pub status: ExposureStatus,
    /// Per-CCD (MOS) or per-quadrant (PN) enable flags.
    pub usability: UsabilityVector,
    /// Point-source mask state.
    pub mask: MaskState,
    /// Background estimation state.
    pub background: BackgroundState,
    /// Non-fatal conditions recorded along the way.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Exposure {
    /// Creates a freshly discovered exposure.
    #[must_use]
    pub fn discovered(prefix: ExposurePrefix) -> Self {
        let usability = UsabilityVector::all_usable(prefix.family());
        Self {
            prefix,
            status: ExposureStatus::Discovered,
            usability,
            mask: MaskState::Pending,
            background: BackgroundState::Pending,
            notes: Vec::new(),
        }
    }

    /// Returns true while the exposure is in the active set.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.status.is_dropped()
    }

    /// Returns true once spectral extraction produced a spectrum.
    #[must_use]
    pub fn extraction_succeeded(&self) -> bool {
        matches!(
            self.status,
            ExposureStatus::SpectraReady | ExposureStatus::BackgroundReady | ExposureStatus::Converted
        )
    }
}
