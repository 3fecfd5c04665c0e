//! Log inspection utilities.
//!
//! The external tools expose no state other than the files they leave
//! behind and the text they print. Every control decision that depends on
//! printed text goes through the pure functions in this module so the
//! marker strings can be fixtured without running a tool.

pub mod markers;

use crate::core::MOS_CCD_COUNT;
use crate::errors::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Extracts the revolution number from the ODF message file.
///
/// The first line containing [`markers::REVOLUTION`] is used; the numeric
/// field is the last token of the text that follows the marker.
pub fn extract_revolution(message_log: &str) -> Result<u32, ParseError> {
    let line = message_log
        .lines()
        .find(|line| line.contains(markers::REVOLUTION))
        .ok_or_else(|| ParseError::new("<message log>", "no Revolution line"))?;

    let start = line.find(markers::REVOLUTION).unwrap_or(0) + markers::REVOLUTION.len();
    let field = line[start..]
        .split_whitespace()
        .last()
        .ok_or_else(|| ParseError::new(line, "Revolution line has no value"))?;

    field
        .parse::<u32>()
        .map_err(|_| ParseError::new(line, format!("'{field}' is not a revolution number")))
}

/// Substring containment test.
#[must_use]
pub fn has_marker(log: &str, marker: &str) -> bool {
    log.contains(marker)
}

/// Line numbers (1-based) of every line ending with [`markers::ANOMALY_SUFFIX`].
#[must_use]
pub fn anomaly_line_offsets(filter_log: &str) -> Vec<usize> {
    filter_log
        .lines()
        .enumerate()
        .filter(|(_, line)| line.ends_with(markers::ANOMALY_SUFFIX))
        .map(|(i, _)| i + 1)
        .collect()
}

/// Line number (1-based) of the first line exactly equal to `prefix`.
#[must_use]
pub fn prefix_header_line(filter_log: &str, prefix: &str) -> Option<usize> {
    filter_log
        .lines()
        .position(|line| line == prefix)
        .map(|i| i + 1)
}

/// Maps an anomaly line to a CCD index relative to a prefix header.
///
/// Returns `None` when the offset falls outside `1..=7`, which is how
/// anomaly markers are partitioned between exposures sharing one log.
#[must_use]
pub fn ccd_index(anomaly_line: usize, header_line: usize) -> Option<usize> {
    let index = (anomaly_line + 1).checked_sub(header_line)?;
    (1..=MOS_CCD_COUNT).contains(&index).then_some(index)
}

/// Whether point sources are excised from the extraction region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskingMode {
    /// Use the point-source mask.
    Masked,
    /// Extract without a mask.
    Unmasked,
}

impl MaskingMode {
    /// Value of the extraction tool's `mask=` argument.
    #[must_use]
    pub fn flag(self) -> u8 {
        match self {
            Self::Masked => 1,
            Self::Unmasked => 0,
        }
    }
}

impl fmt::Display for MaskingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Masked => write!(f, "masked"),
            Self::Unmasked => write!(f, "unmasked"),
        }
    }
}

/// Chooses the masking mode from the point-source detection log.
#[must_use]
pub fn masking_mode(point_source_log: &str) -> MaskingMode {
    if has_marker(point_source_log, markers::NON_POSITIVE_SRC_BKG)
        || has_marker(point_source_log, markers::ZERO_EXCLUDED_SOURCES)
    {
        MaskingMode::Unmasked
    } else {
        MaskingMode::Masked
    }
}

/// Returns true when the downloaded payload starts with the access-denial text.
#[must_use]
pub fn is_access_denied(first_line: &str, denial_marker: &str) -> bool {
    !denial_marker.is_empty() && first_line.contains(denial_marker)
}

/// Reads the first line of a possibly binary file.
///
/// At most 4 KiB are read; invalid UTF-8 is replaced.
pub fn read_first_line(path: &Path) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(4096);
    std::fs::File::open(path)?
        .take(4096)
        .read_to_end(&mut buf)?;
    let end = buf.iter().position(|&b| b == b'\n').unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).trim_end().to_string())
}

/// Reads a captured log as text, replacing invalid UTF-8.
///
/// A missing log reads as empty: the tool never produced output.
pub fn read_log(path: &Path) -> std::io::Result<String> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extract_revolution() {
        let log = "Observation 0100000101\nRevolution 0123\nInstrument EPIC\n";
        assert_eq!(extract_revolution(log).unwrap(), 123);

        let spaced = "Start\nRevolution number:     41\n";
        assert_eq!(extract_revolution(spaced).unwrap(), 41);
    }

    #[test]
    fn test_extract_revolution_errors() {
        assert!(extract_revolution("nothing here\n").is_err());
        assert!(extract_revolution("Revolution\n").is_err());
        assert!(extract_revolution("Revolution unknown\n").is_err());
    }

    #[test]
    fn test_has_marker() {
        let log = "epchain: error (TooFewTimeCorrelationDataPoints)\n";
        assert!(has_marker(log, markers::TOO_FEW_TCX_POINTS));
        assert!(!has_marker(log, markers::ILLEGAL_DIVISION_BY_ZERO));
    }

    #[test]
    fn test_anomaly_offsets() {
        let log = "1S001\nccd 1 ok\nccd 2 anomalous ****\nccd 3 ok\nnote ****trailing\n";
        assert_eq!(anomaly_line_offsets(log), vec![3]);
        assert!(anomaly_line_offsets("").is_empty());
    }

    #[test]
    fn test_prefix_header_line_exact_match() {
        let log = "mos1S001 filtering\n1S001\n 1S001\n";
        assert_eq!(prefix_header_line(log, "1S001"), Some(2));
        assert_eq!(prefix_header_line(log, "2S001"), None);
    }

    #[test]
    fn test_ccd_index_bounds() {
        assert_eq!(ccd_index(10, 10), Some(1));
        assert_eq!(ccd_index(13, 10), Some(4));
        assert_eq!(ccd_index(16, 10), Some(7));
        assert_eq!(ccd_index(17, 10), None);
        assert_eq!(ccd_index(9, 10), None);
        assert_eq!(ccd_index(3, 30), None);
    }

    #[test]
    fn test_multi_exposure_partition() {
        let mut lines: Vec<String> = (1..=40).map(|i| format!("line {i}")).collect();
        lines[9] = "1S001".to_string();
        lines[29] = "2S001".to_string();
        lines[12] = "ccd 4 state ****".to_string();
        lines[33] = "ccd 5 state ****".to_string();
        let log = lines.join("\n");

        let offsets = anomaly_line_offsets(&log);
        assert_eq!(offsets, vec![13, 34]);

        let a = prefix_header_line(&log, "1S001").unwrap();
        let b = prefix_header_line(&log, "2S001").unwrap();
        let for_a: Vec<usize> = offsets.iter().filter_map(|&l| ccd_index(l, a)).collect();
        let for_b: Vec<usize> = offsets.iter().filter_map(|&l| ccd_index(l, b)).collect();
        assert_eq!(for_a, vec![4]);
        assert_eq!(for_b, vec![5]);
    }

    #[test]
    fn test_masking_mode() {
        let zero = "cheese done\nNumber of excluded sources:            0\n";
        assert_eq!(masking_mode(zero), MaskingMode::Unmasked);

        let wrong_spacing = "Number of excluded sources: 0\n";
        assert_eq!(masking_mode(wrong_spacing), MaskingMode::Masked);

        let nonpositive = "warning nonPositiveSrcBkg\n";
        assert_eq!(masking_mode(nonpositive), MaskingMode::Unmasked);

        let normal = "Number of excluded sources:           12\n";
        assert_eq!(masking_mode(normal), MaskingMode::Masked);
        assert_eq!(MaskingMode::Masked.flag(), 1);
    }

    #[test]
    fn test_access_denied() {
        assert!(is_access_denied("ERROR: proprietary data", "proprietary"));
        assert!(!is_access_denied("\u{1f}\u{8b}binary", "proprietary"));
        assert!(!is_access_denied("anything", ""));
    }

    #[test]
    fn test_read_first_line_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.tar");
        std::fs::write(&path, b"Access denied\r\nmore\n").unwrap();
        assert_eq!(read_first_line(&path).unwrap(), "Access denied");

        assert_eq!(read_log(&dir.path().join("missing.log")).unwrap(), "");
        assert!(read_log(&path).unwrap().contains("more"));
    }
}
