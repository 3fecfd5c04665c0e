//! CCD anomaly resolution for MOS exposures.

use crate::core::{DetectorFamily, ExposurePrefix, UsabilityVector};
use crate::inspect;
use crate::registry::ExposureRegistry;
use tracing::{debug, info};

/// Drop reason recorded for exposures left with only the central CCD.
pub const ALL_CCDS_ANOMALOUS: &str = "all-CCDs-anomalous";

/// Decision taken for one MOS exposure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnomalyDecision {
    /// The exposure proceeds to extraction with this vector.
    Usable {
        /// The exposure.
        prefix: ExposurePrefix,
        /// Per-CCD enable flags.
        vector: UsabilityVector,
        /// Whether the prefix header was found in the log.
        header_found: bool,
    },
    /// Only the central CCD survived; the exposure is excluded.
    Excluded {
        /// The exposure.
        prefix: ExposurePrefix,
    },
}

/// Builds CCD usability vectors from the MOS filtering log.
#[derive(Debug, Clone)]
pub struct AnomalyResolver<'a> {
    filter_log: &'a str,
    offsets: Vec<usize>,
}

impl<'a> AnomalyResolver<'a> {
    /// Indexes the anomaly markers of a filtering log.
    #[must_use]
    pub fn new(filter_log: &'a str) -> Self {
        Self {
            filter_log,
            offsets: inspect::anomaly_line_offsets(filter_log),
        }
    }

    /// Computes the vector for one exposure.
    ///
    /// Returns `None` when the prefix has no header line in the log; the
    /// caller then keeps every CCD enabled.
    #[must_use]
    pub fn vector_for(&self, prefix: &ExposurePrefix) -> Option<UsabilityVector> {
        let header = inspect::prefix_header_line(self.filter_log, &prefix.to_string())?;
        let mut vector = UsabilityVector::all_usable(DetectorFamily::Mos);
        for index in self
            .offsets
            .iter()
            .filter_map(|&line| inspect::ccd_index(line, header))
        {
            vector.disable(index);
        }
        Some(vector)
    }

    /// Resolves every active MOS exposure and applies the result.
    ///
    /// Vectors are stored on the exposures; central-only exposures are
    /// dropped with [`ALL_CCDS_ANOMALOUS`].
    pub fn apply(&self, registry: &mut ExposureRegistry) -> Vec<AnomalyDecision> {
        let mut decisions = Vec::new();

        for prefix in registry.active_prefixes(DetectorFamily::Mos) {
            let (vector, header_found) = match self.vector_for(&prefix) {
                Some(vector) => (vector, true),
                None => (UsabilityVector::all_usable(DetectorFamily::Mos), false),
            };

            if vector.is_central_only() {
                registry.drop_exposure(&prefix, ALL_CCDS_ANOMALOUS);
                decisions.push(AnomalyDecision::Excluded { prefix });
                continue;
            }

            debug!(prefix = %prefix, vector = %vector, header_found, "Resolved CCD usability");
            if let Some(exposure) = registry.get_mut(&prefix) {
                exposure.usability = vector.clone();
                if !header_found {
                    exposure
                        .notes
                        .push("no filtering-log header; all CCDs assumed usable".to_string());
                }
            }
            decisions.push(AnomalyDecision::Usable {
                prefix,
                vector,
                header_found,
            });
        }

        info!(
            resolved = decisions.len(),
            anomaly_lines = self.offsets.len(),
            "Anomaly resolution complete"
        );
        decisions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExposureStatus;
    use pretty_assertions::assert_eq;

    fn log_with(headers: &[(usize, &str)], anomalies: &[usize], len: usize) -> String {
        let mut lines: Vec<String> = (1..=len).map(|i| format!("filter line {i}")).collect();
        for (line, prefix) in headers {
            lines[line - 1] = (*prefix).to_string();
        }
        for line in anomalies {
            lines[line - 1] = format!("CCD state anomalous at line {line} ****");
        }
        lines.join("\n")
    }

    fn registry(prefixes: &[&str]) -> ExposureRegistry {
        let mut registry = ExposureRegistry::new();
        for p in prefixes {
            registry.insert(p.parse().unwrap());
        }
        registry
    }

    #[test]
    fn test_vectors_do_not_cross_contaminate() {
        let log = log_with(&[(10, "1S001"), (30, "2S001")], &[13, 34], 40);
        let resolver = AnomalyResolver::new(&log);

        let a = resolver.vector_for(&"1S001".parse().unwrap()).unwrap();
        let b = resolver.vector_for(&"2S001".parse().unwrap()).unwrap();
        assert_eq!(a.flags(), vec![1, 1, 1, 0, 1, 1, 1]);
        assert_eq!(b.flags(), vec![1, 1, 1, 1, 0, 1, 1]);
    }

    #[test]
    fn test_central_only_exposure_is_dropped() {
        let log = log_with(&[(1, "1S001"), (20, "2S001")], &[2, 3, 4, 5, 6, 7, 22], 30);
        let mut reg = registry(&["1S001", "2S001", "S003"]);

        let decisions = AnomalyResolver::new(&log).apply(&mut reg);

        assert_eq!(decisions.len(), 2);
        assert!(matches!(&decisions[0], AnomalyDecision::Excluded { prefix } if prefix.to_string() == "1S001"));
        let dropped = reg.get(&"1S001".parse().unwrap()).unwrap();
        assert_eq!(dropped.status, ExposureStatus::Dropped(ALL_CCDS_ANOMALOUS.to_string()));

        let kept = reg.get(&"2S001".parse().unwrap()).unwrap();
        assert_eq!(kept.usability.flags(), vec![1, 1, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_missing_header_keeps_all_ccds() {
        let log = log_with(&[], &[5], 10);
        let mut reg = registry(&["1U002"]);

        let decisions = AnomalyResolver::new(&log).apply(&mut reg);

        assert!(matches!(
            &decisions[0],
            AnomalyDecision::Usable { header_found: false, .. }
        ));
        let exposure = reg.get(&"1U002".parse().unwrap()).unwrap();
        assert!(exposure.is_active());
        assert_eq!(exposure.usability.flags(), vec![1; 7]);
        assert_eq!(exposure.notes.len(), 1);
    }

    #[test]
    fn test_markers_past_seventh_ccd_are_ignored() {
        let log = log_with(&[(1, "1S001")], &[8, 9], 12);
        let mut reg = registry(&["1S001"]);
        AnomalyResolver::new(&log).apply(&mut reg);
        let exposure = reg.get(&"1S001".parse().unwrap()).unwrap();
        assert!(exposure.is_active());
        assert_eq!(exposure.usability.flags(), vec![1; 7]);
    }
}
