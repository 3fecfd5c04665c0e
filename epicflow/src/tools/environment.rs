//! Tool environment bindings and private installations.
//!
//! The external tools discover their inputs through environment variables
//! and write to installation-global auxiliary files. The controller never
//! touches its own process environment: bindings live in a
//! [`ToolEnvironment`] value that each controller instance owns and hands to
//! the runner, and concurrent instances each get an
//! [`IsolatedInstallation`].

use crate::errors::ToolError;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Calibration index consumed by every tool.
pub const SAS_CCF: &str = "SAS_CCF";
/// Observation data (directory, later the ingested summary file).
pub const SAS_ODF: &str = "SAS_ODF";
/// Calibration-file search path.
pub const SAS_CCFPATH: &str = "SAS_CCFPATH";
/// Root of the tool installation.
pub const SAS_DIR: &str = "SAS_DIR";

/// Environment handed to every external invocation of one controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolEnvironment {
    install_dir: Option<PathBuf>,
    bindings: BTreeMap<String, String>,
}

impl ToolEnvironment {
    /// Creates an empty environment; programs resolve through `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the installation rooted at `dir`.
    #[must_use]
    pub fn with_installation(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.bindings
            .insert(SAS_DIR.to_string(), dir.display().to_string());
        self.install_dir = Some(dir);
        self
    }

    /// Binds a variable, replacing any previous value.
    pub fn bind(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        debug!(key = %key, value = %value, "Binding tool environment variable");
        self.bindings.insert(key, value);
    }

    /// Returns a bound value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.bindings.get(key).map(String::as_str)
    }

    /// All bindings in key order.
    pub fn bindings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The installation directory, if any.
    #[must_use]
    pub fn install_dir(&self) -> Option<&Path> {
        self.install_dir.as_deref()
    }

    /// Resolves a program against the installation's `bin/` first.
    #[must_use]
    pub fn resolve_program(&self, program: &str) -> PathBuf {
        if let Some(dir) = &self.install_dir {
            let candidate = dir.join("bin").join(program);
            if candidate.is_file() {
                return candidate;
            }
        }
        PathBuf::from(program)
    }

    /// `PATH` for child processes with the installation's `bin/` in front.
    #[must_use]
    pub fn path_value(&self) -> Option<OsString> {
        let bin = self.install_dir.as_ref()?.join("bin");
        let mut paths = vec![bin];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        std::env::join_paths(paths).ok()
    }
}

/// A private copy of a shared tool installation, removed on drop.
#[derive(Debug)]
pub struct IsolatedInstallation {
    dir: PathBuf,
}

impl IsolatedInstallation {
    /// Copies `shared` into `<scratch_root>/<label>`.
    pub fn provision(shared: &Path, scratch_root: &Path, label: &str) -> Result<Self, ToolError> {
        let dir = scratch_root.join(label);
        if dir.exists() {
            return Err(ToolError::installation(&dir, "target already exists"));
        }

        info!(from = %shared.display(), to = %dir.display(), "Provisioning private tool installation");
        let installation = Self { dir };
        copy_tree(shared, &installation.dir)
            .map_err(|e| ToolError::installation(&installation.dir, e.to_string()))?;
        Ok(installation)
    }

    /// Root of the private copy.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// An environment rooted at this copy.
    #[must_use]
    pub fn environment(&self) -> ToolEnvironment {
        ToolEnvironment::new().with_installation(&self.dir)
    }
}

impl Drop for IsolatedInstallation {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.dir.display(), error = %e, "Failed to remove private installation");
            }
        }
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let target = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(std::fs::read_link(link)?, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::copy(link, target).map(|_| ())
}
