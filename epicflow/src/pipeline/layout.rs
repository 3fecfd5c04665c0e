//! Where everything for one observation lives on disk.

use crate::core::{ExposurePrefix, ObservationId};
use crate::tools::log_path;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Working subdirectory holding the unpacked ODF and every tool product.
pub const ODF_DIR: &str = "odf";
/// Calibration index written by the index builder.
pub const CCF_INDEX: &str = "ccf.cif";
/// Suffix of the ingested ODF summary.
pub const ODF_SUMMARY_SUFFIX: &str = "SUM.SAS";

/// Paths of one observation root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationLayout {
    root: PathBuf,
    obs_id: ObservationId,
}

impl ObservationLayout {
    /// Layout of `<data_root>/<obs_id>`.
    #[must_use]
    pub fn new(data_root: &Path, obs_id: ObservationId) -> Self {
        Self {
            root: data_root.join(obs_id.as_str()),
            obs_id,
        }
    }

    /// The observation root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The observation id.
    #[must_use]
    pub fn obs_id(&self) -> &ObservationId {
        &self.obs_id
    }

    /// `<obs_id>_summary.log`.
    #[must_use]
    pub fn summary_path(&self) -> PathBuf {
        self.root.join(format!("{}_summary.log", self.obs_id))
    }

    /// `<obs_id>.tar`.
    #[must_use]
    pub fn archive_path(&self) -> PathBuf {
        self.root.join(format!("{}.tar", self.obs_id))
    }

    /// Captured log for a tool invocation.
    #[must_use]
    pub fn log(&self, tool: &str, detpref: Option<&str>, variant: Option<&str>) -> PathBuf {
        log_path(&self.root, tool, detpref, variant)
    }

    /// The working directory of the tools.
    #[must_use]
    pub fn odf_dir(&self) -> PathBuf {
        self.root.join(ODF_DIR)
    }

    /// Calibration index.
    #[must_use]
    pub fn ccf_index(&self) -> PathBuf {
        self.odf_dir().join(CCF_INDEX)
    }

    fn product(&self, prefix: &ExposurePrefix, suffix: &str) -> PathBuf {
        self.odf_dir().join(format!("{}{suffix}", prefix.detpref()))
    }

    /// Filtered event list.
    #[must_use]
    pub fn clean_events(&self, prefix: &ExposurePrefix) -> PathBuf {
        self.product(prefix, "-clean.fits")
    }

    /// Point-source mask.
    #[must_use]
    pub fn mask(&self, prefix: &ExposurePrefix) -> PathBuf {
        self.product(prefix, "-bkg_region-sky.fits")
    }

    /// Source spectrum; its presence marks a successful extraction.
    #[must_use]
    pub fn spectrum(&self, prefix: &ExposurePrefix) -> PathBuf {
        self.product(prefix, "-obj.pi")
    }

    /// Quiescent particle background model written by background estimation.
    #[must_use]
    pub fn qpb_model(&self, prefix: &ExposurePrefix) -> PathBuf {
        self.product(prefix, "-qpb.fits")
    }

    /// The four inputs of the converter, in a fixed order: spectrum,
    /// redistribution matrix, ancillary response, background spectrum.
    #[must_use]
    pub fn conversion_inputs(&self, prefix: &ExposurePrefix) -> [PathBuf; 4] {
        [
            self.spectrum(prefix),
            self.product(prefix, ".rmf"),
            self.product(prefix, ".arf"),
            self.product(prefix, "-back.pi"),
        ]
    }

    /// `<detpref>_processed.h5` in the root.
    #[must_use]
    pub fn converted_output(&self, prefix: &ExposurePrefix) -> PathBuf {
        self.root.join(format!("{}_processed.h5", prefix.detpref()))
    }

    /// First regular file in `odf/` whose name ends with `suffix`, by name order.
    pub fn find_in_odf(&self, suffix: &str) -> std::io::Result<Option<PathBuf>> {
        Ok(sorted_files(&self.odf_dir())?
            .into_iter()
            .find(|p| file_name(p).ends_with(suffix)))
    }

    /// PN event lists of one exposure, primary and out-of-time, by name order.
    pub fn pn_event_lists(&self, prefix: &ExposurePrefix) -> std::io::Result<Vec<PathBuf>> {
        let primary = format!("PN{prefix}PIEVLI");
        let out_of_time = format!("PN{prefix}OOEVLI");
        Ok(sorted_files(&self.odf_dir())?
            .into_iter()
            .filter(|p| {
                let name = file_name(p);
                name.ends_with(".FIT") && (name.contains(&primary) || name.contains(&out_of_time))
            })
            .collect())
    }

    /// Moves the ODF into `odf/` when the archive unpacked into another shape.
    ///
    /// Candidates, in order: a nested directory named `odf`, a directory
    /// holding a file ending with `message_suffix`, or message files lying
    /// directly in the root (every other data file in the root then moves
    /// too). Returns the directory the ODF was taken from, or `None` when no
    /// candidate exists.
    pub fn reconstruct_odf(&self, message_suffix: &str) -> std::io::Result<Option<PathBuf>> {
        let target = self.odf_dir();
        if target.is_dir() {
            return Ok(Some(target));
        }

        let nested = WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_dir())
            .find(|e| {
                e.file_name().to_string_lossy().eq_ignore_ascii_case(ODF_DIR)
                    || holds_file_ending_with(e.path(), message_suffix)
            });
        if let Some(entry) = nested {
            info!(from = %entry.path().display(), "Reconstructing odf directory");
            std::fs::rename(entry.path(), &target)?;
            return Ok(Some(entry.into_path()));
        }

        if holds_file_ending_with(&self.root, message_suffix) {
            info!(root = %self.root.display(), "Gathering flat ODF files into odf directory");
            std::fs::create_dir(&target)?;
            for file in sorted_files(&self.root)? {
                if self.belongs_in_root(&file) {
                    continue;
                }
                std::fs::rename(&file, target.join(file_name(&file)))?;
            }
            return Ok(Some(self.root.clone()));
        }

        Ok(None)
    }

    fn belongs_in_root(&self, path: &Path) -> bool {
        let name = file_name(path);
        path == self.archive_path()
            || name.ends_with(".log")
            || name.ends_with("_exposures.txt")
            || name.ends_with("_processed.h5")
    }

    /// Removes every subdirectory of the root. Files in the root are kept.
    pub fn remove_intermediates(&self) -> std::io::Result<()> {
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                debug!(path = %entry.path().display(), "Removing intermediate directory");
                std::fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }

    /// Removes the intermediates and the downloaded archive.
    pub fn discard_working_data(&self) -> std::io::Result<()> {
        self.remove_intermediates()?;
        match std::fs::remove_file(self.archive_path()) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn sorted_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn holds_file_ending_with(dir: &Path, suffix: &str) -> bool {
    sorted_files(dir)
        .map(|files| files.iter().any(|f| file_name(f).ends_with(suffix)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn layout(dir: &Path) -> ObservationLayout {
        let layout = ObservationLayout::new(dir, "0100000101".parse().unwrap());
        std::fs::create_dir_all(layout.root()).unwrap();
        layout
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_naming() {
        let layout = ObservationLayout::new(Path::new("/data"), "0100000101".parse().unwrap());
        let mos: ExposurePrefix = "1S001".parse().unwrap();
        assert_eq!(layout.summary_path(), Path::new("/data/0100000101/0100000101_summary.log"));
        assert_eq!(layout.archive_path(), Path::new("/data/0100000101/0100000101.tar"));
        assert_eq!(layout.clean_events(&mos), Path::new("/data/0100000101/odf/mos1S001-clean.fits"));
        assert_eq!(layout.mask(&mos), Path::new("/data/0100000101/odf/mos1S001-bkg_region-sky.fits"));
        assert_eq!(
            layout.converted_output(&mos),
            Path::new("/data/0100000101/mos1S001_processed.h5")
        );
        assert_eq!(
            layout.log("cheese", Some("mos1S001"), Some("retry2")),
            Path::new("/data/0100000101/cheese-mos1S001-retry2.log")
        );
        assert_eq!(layout.qpb_model(&mos), Path::new("/data/0100000101/odf/mos1S001-qpb.fits"));
        let inputs = layout.conversion_inputs(&mos);
        assert!(inputs[3].ends_with("mos1S001-back.pi"));
    }

    #[test]
    fn test_pn_event_lists() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let odf = layout.odf_dir();
        touch(&odf.join("P0100000101PNS003PIEVLI0000.FIT"));
        touch(&odf.join("P0100000101PNS003OOEVLI0000.FIT"));
        touch(&odf.join("P0100000101PNS004PIEVLI0000.FIT"));
        touch(&odf.join("P0100000101PNS003PIEVLI0000.FIT.gz"));

        let lists = layout.pn_event_lists(&"S003".parse().unwrap()).unwrap();
        let names: Vec<String> = lists.iter().map(|p| file_name(p)).collect();
        assert_eq!(
            names,
            vec!["P0100000101PNS003OOEVLI0000.FIT", "P0100000101PNS003PIEVLI0000.FIT"]
        );
    }

    #[test]
    fn test_reconstruct_nested_odf() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        touch(&layout.root().join("0100000101").join("ODF").join("0001_0100000101_SCX00000SUM.ASC"));

        let source = layout.reconstruct_odf("SUM.ASC").unwrap();
        assert!(source.is_some());
        assert!(layout.find_in_odf("SUM.ASC").unwrap().is_some());
    }

    #[test]
    fn test_reconstruct_flat_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        touch(&layout.root().join("0001_0100000101_SCX00000SUM.ASC"));
        touch(&layout.root().join("0001_0100000101_M1S00100IME.FIT"));
        touch(&layout.log("unpack", None, None));

        assert!(layout.reconstruct_odf("SUM.ASC").unwrap().is_some());
        assert!(layout.odf_dir().join("0001_0100000101_M1S00100IME.FIT").is_file());
        assert!(layout.log("unpack", None, None).is_file());
    }

    #[test]
    fn test_reconstruct_without_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        touch(&layout.root().join("garbage").join("readme.txt"));
        assert_eq!(layout.reconstruct_odf("SUM.ASC").unwrap(), None);
    }

    #[test]
    fn test_discard_working_data_keeps_logs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        touch(&layout.ccf_index());
        touch(&layout.archive_path());
        touch(&layout.summary_path());

        layout.discard_working_data().unwrap();
        assert!(!layout.odf_dir().exists());
        assert!(!layout.archive_path().exists());
        assert!(layout.summary_path().is_file());
        layout.discard_working_data().unwrap();
    }
}
