//! Configuration types for the pipeline controller.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration shared by every controller instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory holding one subdirectory per observation.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Calibration-file search path bound for every tool.
    #[serde(default = "default_calibration_path")]
    pub calibration_path: PathBuf,
    /// Text the archive service returns instead of data for protected observations.
    #[serde(default = "default_proprietary_marker")]
    pub proprietary_marker: String,
    /// File-name suffix of the ODF message file carrying the revolution.
    #[serde(default = "default_message_file_suffix")]
    pub message_file_suffix: String,
    /// Arguments appended to event generation when switching the time-correlation source.
    #[serde(default = "default_alternate_tcx_args")]
    pub alternate_tcx_args: Vec<String>,
    /// Optional wall-clock limit per external invocation, in seconds.
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,
    /// Tool installation handling.
    #[serde(default)]
    pub installation: InstallationConfig,
    /// Programs and default arguments for every external tool.
    #[serde(default)]
    pub tools: ToolCatalog,
}

fn default_data_root() -> PathBuf {
    PathBuf::from("xmm-data")
}

fn default_calibration_path() -> PathBuf {
    PathBuf::from("ccf")
}

fn default_proprietary_marker() -> String {
    "is proprietary".to_string()
}

fn default_message_file_suffix() -> String {
    "SUM.ASC".to_string()
}

fn default_alternate_tcx_args() -> Vec<String> {
    vec!["usetcx=no".to_string()]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            calibration_path: default_calibration_path(),
            proprietary_marker: default_proprietary_marker(),
            message_file_suffix: default_message_file_suffix(),
            alternate_tcx_args: default_alternate_tcx_args(),
            stage_timeout_secs: None,
            installation: InstallationConfig::default(),
            tools: ToolCatalog::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Sets the data root.
    #[must_use]
    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = root.into();
        self
    }

    /// Sets the per-invocation timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, seconds: u64) -> Self {
        self.stage_timeout_secs = Some(seconds);
        self
    }

    /// Gets the per-invocation timeout as a Duration.
    #[must_use]
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stage_timeout_secs == Some(0) {
            return Err(ConfigError::invalid(
                "stage_timeout_secs",
                "must be positive when provided",
            ));
        }
        if self.data_root.as_os_str().is_empty() {
            return Err(ConfigError::invalid("data_root", "must not be empty"));
        }
        for (name, spec) in self.tools.entries() {
            if spec.program.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("tools.{name}.program"),
                    "must not be empty",
                ));
            }
        }
        if self.installation.isolate && self.installation.shared_dir.is_none() {
            return Err(ConfigError::invalid(
                "installation.isolate",
                "requires installation.shared_dir",
            ));
        }
        Ok(())
    }
}

/// Where the external tool installation lives and whether to copy it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationConfig {
    /// Shared installation directory (its `bin/` shadows `PATH`).
    #[serde(default)]
    pub shared_dir: Option<PathBuf>,
    /// Give each controller instance a private copy of the installation.
    #[serde(default)]
    pub isolate: bool,
    /// Parent directory for private copies.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,
}

fn default_scratch_root() -> PathBuf {
    std::env::temp_dir().join("epicflow")
}

impl Default for InstallationConfig {
    fn default() -> Self {
        Self {
            shared_dir: None,
            isolate: false,
            scratch_root: default_scratch_root(),
        }
    }
}

/// A program and its default arguments.
///
/// Arguments may carry `{name}` placeholders that are filled from
/// [`Placeholders`] when the invocation is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Executable name or path.
    pub program: String,
    /// Default arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolSpec {
    /// Creates a spec.
    #[must_use]
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }

    /// Renders the default arguments.
    #[must_use]
    pub fn render_args(&self, vars: &Placeholders) -> Vec<String> {
        self.args.iter().map(|arg| vars.render(arg)).collect()
    }
}

/// Placeholder values available to [`ToolSpec`] arguments.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    values: BTreeMap<&'static str, String>,
}

impl Placeholders {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a value.
    #[must_use]
    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(key, value.into());
        self
    }

    /// Substitutes every known `{key}` in `template`; unknown keys are left as-is.
    #[must_use]
    pub fn render(&self, template: &str) -> String {
        self.values
            .iter()
            .fold(template.to_string(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
    }
}

/// Every external tool the controller drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCatalog {
    /// Archive download.
    #[serde(default = "default_download")]
    pub download: ToolSpec,
    /// Archive unpacking.
    #[serde(default = "default_unpack")]
    pub unpack: ToolSpec,
    /// Science-exposure discovery (writes the two listing files).
    #[serde(default = "default_discovery")]
    pub discovery: ToolSpec,
    /// Per-exposure converter to the analysis format.
    #[serde(default = "default_converter")]
    pub converter: ToolSpec,
    /// Calibration index builder.
    #[serde(default = "default_cifbuild")]
    pub cifbuild: ToolSpec,
    /// ODF summary ingestion.
    #[serde(default = "default_odfingest")]
    pub odfingest: ToolSpec,
    /// PN event-list generation.
    #[serde(default = "default_epchain")]
    pub epchain: ToolSpec,
    /// PN spatial CTI correction.
    #[serde(default = "default_epspatialcti")]
    pub epspatialcti: ToolSpec,
    /// PN filtering.
    #[serde(default = "default_pn_filter")]
    pub pn_filter: ToolSpec,
    /// MOS event-chain generation.
    #[serde(default = "default_emchain")]
    pub emchain: ToolSpec,
    /// MOS filtering.
    #[serde(default = "default_mos_filter")]
    pub mos_filter: ToolSpec,
    /// Point-source detection and masking.
    #[serde(default = "default_cheese")]
    pub cheese: ToolSpec,
    /// MOS spectral extraction.
    #[serde(default = "default_mos_spectra")]
    pub mos_spectra: ToolSpec,
    /// PN spectral extraction.
    #[serde(default = "default_pn_spectra")]
    pub pn_spectra: ToolSpec,
    /// MOS background-model estimation.
    #[serde(default = "default_mos_back")]
    pub mos_back: ToolSpec,
    /// PN background-model estimation.
    #[serde(default = "default_pn_back")]
    pub pn_back: ToolSpec,
}

fn default_download() -> ToolSpec {
    ToolSpec::new(
        "curl",
        &[
            "-sS",
            "-o",
            "{archive}",
            "https://nxsa.esac.esa.int/nxsa-sl/servlet/data-action-aio?obsno={obs_id}",
        ],
    )
}

fn default_unpack() -> ToolSpec {
    ToolSpec::new("tar", &["-xf", "{archive}"])
}

fn default_discovery() -> ToolSpec {
    ToolSpec::new(
        "python3",
        &["get_science_exposures.py", "--xmmdata", "{data_root}", "--obsID", "{obs_id}"],
    )
}

fn default_converter() -> ToolSpec {
    ToolSpec::new(
        "python3",
        &[
            "spc2dat.py",
            "--xmmdata",
            "{data_root}",
            "--obsID",
            "{obs_id}",
            "--prefix",
            "{detpref}",
        ],
    )
}

fn default_cifbuild() -> ToolSpec {
    ToolSpec::new("cifbuild", &[])
}

fn default_odfingest() -> ToolSpec {
    ToolSpec::new("odfingest", &[])
}

fn default_epchain() -> ToolSpec {
    ToolSpec::new("epchain", &[])
}

fn default_epspatialcti() -> ToolSpec {
    ToolSpec::new("epspatialcti", &[])
}

fn default_pn_filter() -> ToolSpec {
    ToolSpec::new("pn-filter", &[])
}

fn default_emchain() -> ToolSpec {
    ToolSpec::new("emchain", &[])
}

fn default_mos_filter() -> ToolSpec {
    ToolSpec::new("mos-filter", &[])
}

fn default_cheese() -> ToolSpec {
    ToolSpec::new(
        "cheese",
        &["scale=0.5", "rate=1.0", "dist=40.0", "clobber=1", "elow=400", "ehigh=7200"],
    )
}

fn default_mos_spectra() -> ToolSpec {
    ToolSpec::new("mos-spectra", &["caldb={ccf_path}", "elow=0", "ehigh=0"])
}

fn default_pn_spectra() -> ToolSpec {
    ToolSpec::new("pn-spectra", &["caldb={ccf_path}", "elow=0", "ehigh=0"])
}

fn default_mos_back() -> ToolSpec {
    ToolSpec::new("mos_back", &["caldb={ccf_path}", "diag=0", "elow=0", "ehigh=0"])
}

fn default_pn_back() -> ToolSpec {
    ToolSpec::new("pn_back", &["caldb={ccf_path}", "diag=0", "elow=0", "ehigh=0"])
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self {
            download: default_download(),
            unpack: default_unpack(),
            discovery: default_discovery(),
            converter: default_converter(),
            cifbuild: default_cifbuild(),
            odfingest: default_odfingest(),
            epchain: default_epchain(),
            epspatialcti: default_epspatialcti(),
            pn_filter: default_pn_filter(),
            emchain: default_emchain(),
            mos_filter: default_mos_filter(),
            cheese: default_cheese(),
            mos_spectra: default_mos_spectra(),
            pn_spectra: default_pn_spectra(),
            mos_back: default_mos_back(),
            pn_back: default_pn_back(),
        }
    }
}

impl ToolCatalog {
    /// Every entry with its config key.
    #[must_use]
    pub fn entries(&self) -> Vec<(&'static str, &ToolSpec)> {
        vec![
            ("download", &self.download),
            ("unpack", &self.unpack),
            ("discovery", &self.discovery),
            ("converter", &self.converter),
            ("cifbuild", &self.cifbuild),
            ("odfingest", &self.odfingest),
            ("epchain", &self.epchain),
            ("epspatialcti", &self.epspatialcti),
            ("pn_filter", &self.pn_filter),
            ("emchain", &self.emchain),
            ("mos_filter", &self.mos_filter),
            ("cheese", &self.cheese),
            ("mos_spectra", &self.mos_spectra),
            ("pn_spectra", &self.pn_spectra),
            ("mos_back", &self.mos_back),
            ("pn_back", &self.pn_back),
        ]
    }
}
