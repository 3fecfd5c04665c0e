//! Literal strings the external tools print.
//!
//! The tools write fixed-width text, so these must match byte for byte,
//! including runs of spaces.

/// Line marker preceding the revolution number in the ODF message file.
pub const REVOLUTION: &str = "Revolution";

/// Event generation found too few time-correlation points.
pub const TOO_FEW_TCX_POINTS: &str = "TooFewTimeCorrelationDataPoints";

/// Spectral extraction hit a singular corner-region fit.
pub const ILLEGAL_DIVISION_BY_ZERO: &str = "Illegal division by zero";

/// Point-source detection found a non-positive source/background ratio.
pub const NON_POSITIVE_SRC_BKG: &str = "nonPositiveSrcBkg";

/// Point-source detection excluded nothing.
pub const ZERO_EXCLUDED_SOURCES: &str = "Number of excluded sources:            0";

/// Suffix of a CCD anomaly line in the MOS filtering log.
pub const ANOMALY_SUFFIX: &str = " ****";
