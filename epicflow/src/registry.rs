//! The set of exposures discovered for one observation.

use crate::core::{DetectorFamily, Exposure, ExposurePrefix, ExposureStatus};
use crate::errors::ParseError;
use std::path::Path;
use tracing::{debug, info};

/// Owns every exposure of an observation and tracks which remain active.
///
/// Insertion order from the discovery listings is preserved, and dropped
/// exposures stay in the registry so their drop reason can be reported.
#[derive(Debug, Clone, Default)]
pub struct ExposureRegistry {
    exposures: Vec<Exposure>,
}

impl ExposureRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one newline-separated discovery listing.
    ///
    /// Blank lines are ignored and entries are upper-cased; anything that
    /// then fails the family grammar is an error, not a silent drop.
    pub fn parse_listing(
        family: DetectorFamily,
        text: &str,
    ) -> Result<Vec<ExposurePrefix>, ParseError> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| ExposurePrefix::parse(family, &line.to_uppercase()))
            .collect()
    }

    /// Builds a registry from the two discovery listings in `dir`.
    ///
    /// Returns `Ok(None)` when neither listing exists.
    pub fn from_listings(dir: &Path) -> crate::errors::Result<Option<Self>> {
        let mut registry = Self::new();
        let mut found_any = false;

        for family in [DetectorFamily::Mos, DetectorFamily::Pn] {
            let path = dir.join(family.listing_file());
            if !path.is_file() {
                debug!(family = %family, path = %path.display(), "No discovery listing");
                continue;
            }
            found_any = true;
            let text = std::fs::read_to_string(&path)?;
            for prefix in Self::parse_listing(family, &text)? {
                registry.insert(prefix);
            }
        }

        Ok(found_any.then_some(registry))
    }

    /// Adds an exposure; duplicates are ignored.
    pub fn insert(&mut self, prefix: ExposurePrefix) {
        if self.get(&prefix).is_none() {
            self.exposures.push(Exposure::discovered(prefix));
        }
    }

    /// Returns an exposure by prefix.
    #[must_use]
    pub fn get(&self, prefix: &ExposurePrefix) -> Option<&Exposure> {
        self.exposures.iter().find(|e| &e.prefix == prefix)
    }

    /// Returns a mutable exposure by prefix.
    pub fn get_mut(&mut self, prefix: &ExposurePrefix) -> Option<&mut Exposure> {
        self.exposures.iter_mut().find(|e| &e.prefix == prefix)
    }

    /// All exposures, including dropped ones, in discovery order.
    #[must_use]
    pub fn exposures(&self) -> &[Exposure] {
        &self.exposures
    }

    /// Live prefixes of one family in discovery order.
    #[must_use]
    pub fn active_prefixes(&self, family: DetectorFamily) -> Vec<ExposurePrefix> {
        self.exposures
            .iter()
            .filter(|e| e.is_active() && e.prefix.family() == family)
            .map(|e| e.prefix.clone())
            .collect()
    }

    /// Live prefixes of both families, MOS first.
    #[must_use]
    pub fn all_active(&self) -> Vec<ExposurePrefix> {
        let mut prefixes = self.active_prefixes(DetectorFamily::Mos);
        prefixes.extend(self.active_prefixes(DetectorFamily::Pn));
        prefixes
    }

    /// Number of live exposures.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.exposures.iter().filter(|e| e.is_active()).count()
    }

    /// Returns true if no exposures were discovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exposures.is_empty()
    }

    /// Sets the status of a live exposure. Dropped exposures are never revived.
    pub fn set_status(&mut self, prefix: &ExposurePrefix, status: ExposureStatus) {
        if let Some(exposure) = self.get_mut(prefix) {
            if exposure.is_active() {
                exposure.status = status;
            }
        }
    }

    /// Removes an exposure from the active set with a reason.
    pub fn drop_exposure(&mut self, prefix: &ExposurePrefix, reason: impl Into<String>) {
        if let Some(exposure) = self.get_mut(prefix) {
            if exposure.is_active() {
                let reason = reason.into();
                info!(prefix = %prefix, reason = %reason, "Dropping exposure");
                exposure.status = ExposureStatus::Dropped(reason);
            }
        }
    }

    /// Drops the exposure if `expected` does not exist. Returns true if dropped.
    pub fn drop_if_missing(
        &mut self,
        prefix: &ExposurePrefix,
        expected: &Path,
        reason: impl Into<String>,
    ) -> bool {
        if expected.exists() {
            return false;
        }
        let reason = format!("{} ({} missing)", reason.into(), file_name(expected));
        self.drop_exposure(prefix, reason);
        true
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}
