//! Per-subregion usability flags passed to the extraction tools.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::exposure::DetectorFamily;

/// Number of CCDs on a MOS camera; index 1 is the central CCD.
pub const MOS_CCD_COUNT: usize = 7;

/// Number of quadrants on the PN camera.
pub const PN_QUADRANT_COUNT: usize = 4;

/// Fixed-size usability flags, 1-indexed in every public method.
///
/// MOS vectors have one slot per CCD, PN vectors one slot per quadrant. A
/// vector is built once per exposure and replaced wholesale, never patched
/// after it has been stored on an exposure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsabilityVector {
    family: DetectorFamily,
    slots: Vec<bool>,
}

impl UsabilityVector {
    /// Creates a vector with every slot enabled.
    #[must_use]
    pub fn all_usable(family: DetectorFamily) -> Self {
        let len = match family {
            DetectorFamily::Mos => MOS_CCD_COUNT,
            DetectorFamily::Pn => PN_QUADRANT_COUNT,
        };
        Self {
            family,
            slots: vec![true; len],
        }
    }

    /// Builds a MOS vector from explicit flags, e.g. `[true, false, ...]`.
    #[must_use]
    pub fn mos(flags: [bool; MOS_CCD_COUNT]) -> Self {
        Self {
            family: DetectorFamily::Mos,
            slots: flags.to_vec(),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; vectors have a fixed non-zero size.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Disables a slot. Returns false if `index` is outside `1..=len`.
    pub fn disable(&mut self, index: usize) -> bool {
        match index.checked_sub(1).and_then(|i| self.slots.get_mut(i)) {
            Some(slot) => {
                *slot = false;
                true
            }
            None => false,
        }
    }

    /// Returns whether a slot is enabled; out-of-range indices are disabled.
    #[must_use]
    pub fn is_enabled(&self, index: usize) -> bool {
        index
            .checked_sub(1)
            .and_then(|i| self.slots.get(i))
            .copied()
            .unwrap_or(false)
    }

    /// True when only the central MOS CCD remains usable.
    ///
    /// Such an exposure has no outer-CCD statistics to estimate a background
    /// from and is excluded from extraction.
    #[must_use]
    pub fn is_central_only(&self) -> bool {
        self.family == DetectorFamily::Mos
            && self.slots.first() == Some(&true)
            && self.slots.iter().skip(1).all(|enabled| !enabled)
    }

    /// Flags as `0`/`1` integers in slot order.
    #[must_use]
    pub fn flags(&self) -> Vec<u8> {
        self.slots.iter().map(|&enabled| u8::from(enabled)).collect()
    }

    /// Tool arguments enabling each slot: `ccd1=1 ... ccd7=0` or `quad1=1 ...`.
    #[must_use]
    pub fn tool_args(&self) -> Vec<String> {
        let key = match self.family {
            DetectorFamily::Mos => "ccd",
            DetectorFamily::Pn => "quad",
        };
        self.flags()
            .iter()
            .enumerate()
            .map(|(i, flag)| format!("{key}{}={flag}", i + 1))
            .collect()
    }
}

impl fmt::Display for UsabilityVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.flags().iter().map(ToString::to_string).collect();
        write!(f, "[{}]", rendered.join(","))
    }
}
