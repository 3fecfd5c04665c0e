//! Batch report over every observation under a data root.

use crate::core::ObservationId;
use crate::errors::Result;
use crate::pipeline::ObservationLayout;
use crate::registry::ExposureRegistry;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// File listing `<obs_id><detpref>` entries without a converted product.
pub const BAD_LIST: &str = "bad_obsdetprefs.txt";

/// File listing `<obs_id><detpref>` entries with a converted product.
pub const COMPLETED_LIST: &str = "completed_obsdetprefs.txt";

/// Completed and bad exposures across a data root, e.g. `0100000101mos1S001`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionReport {
    /// Exposures whose converted product exists.
    pub completed: Vec<String>,
    /// Listed exposures without a converted product.
    pub bad: Vec<String>,
}

impl ReductionReport {
    /// Scans every 10-digit observation directory directly under `data_root`.
    ///
    /// Directories without discovery listings are skipped. A listing that
    /// fails to parse skips its observation with a warning.
    pub fn scan(data_root: &Path) -> Result<Self> {
        let mut report = Self::default();

        for entry in WalkDir::new(data_root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory loop"))
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let Ok(obs_id) = entry.file_name().to_string_lossy().parse::<ObservationId>() else {
                continue;
            };

            let registry = match ExposureRegistry::from_listings(entry.path()) {
                Ok(Some(registry)) => registry,
                Ok(None) => {
                    debug!(obs_id = %obs_id, "No discovery listings");
                    continue;
                }
                Err(e) => {
                    warn!(obs_id = %obs_id, error = %e, "Skipping observation with unreadable listings");
                    continue;
                }
            };

            let layout = ObservationLayout::new(data_root, obs_id.clone());
            for exposure in registry.exposures() {
                let name = format!("{obs_id}{}", exposure.prefix.detpref());
                if layout.converted_output(&exposure.prefix).is_file() {
                    report.completed.push(name);
                } else {
                    report.bad.push(name);
                }
            }
        }

        info!(
            completed = report.completed.len(),
            bad = report.bad.len(),
            "Scanned reductions"
        );
        Ok(report)
    }

    /// Number of exposures classified.
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed.len() + self.bad.len()
    }

    /// Rewrites both list files in `report_dir`, creating the directory.
    pub fn write_to(&self, report_dir: &Path) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(report_dir)?;
        let bad = report_dir.join(BAD_LIST);
        let completed = report_dir.join(COMPLETED_LIST);
        write_lines(&bad, &self.bad)?;
        write_lines(&completed, &self.completed)?;
        Ok((bad, completed))
    }
}

fn write_lines(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for line in lines {
        writeln!(out, "{line}")?;
    }
    out.flush()
}
