//! A scripted observation: every tool faked consistently.

use super::scripted::{ScriptedCall, ScriptedOutput, ScriptedToolRunner};
use crate::inspect::markers;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// How a unit of event generation reports insufficient time-correlation data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcxFault {
    /// Only the first attempt prints the marker.
    FirstAttempt,
    /// Every attempt prints the marker.
    Persistent,
}

/// Builds a [`ScriptedToolRunner`] that plays one observation end to end.
///
/// The defaults describe a nominal observation; each `with_*` method injects
/// one condition the controller has to react to. Tool names match the
/// controller's logical names.
#[derive(Debug, Clone)]
pub struct ObservationScript {
    obs_id: String,
    revolution: u32,
    mos: Vec<String>,
    pn: Vec<String>,
    proprietary: bool,
    nested_archive: bool,
    listings: bool,
    alternate_tcx_arg: String,
    unfiltered: HashSet<String>,
    tcx_faults: HashMap<String, TcxFault>,
    anomalies: HashMap<String, Vec<usize>>,
    singular_fits: HashSet<String>,
    zero_sources: HashSet<String>,
    mask_failures: HashMap<String, usize>,
    failed_extractions: HashSet<String>,
}

/// Key for faults that apply to the global MOS event chain.
pub const MOS_CHAIN: &str = "emchain";

impl ObservationScript {
    /// A nominal observation at revolution 123 with no exposures.
    #[must_use]
    pub fn new(obs_id: impl Into<String>) -> Self {
        Self {
            obs_id: obs_id.into(),
            revolution: 123,
            mos: Vec::new(),
            pn: Vec::new(),
            proprietary: false,
            nested_archive: false,
            listings: true,
            alternate_tcx_arg: "usetcx=no".to_string(),
            unfiltered: HashSet::new(),
            tcx_faults: HashMap::new(),
            anomalies: HashMap::new(),
            singular_fits: HashSet::new(),
            zero_sources: HashSet::new(),
            mask_failures: HashMap::new(),
            failed_extractions: HashSet::new(),
        }
    }

    /// Sets the revolution printed in the message file.
    #[must_use]
    pub fn with_revolution(mut self, revolution: u32) -> Self {
        self.revolution = revolution;
        self
    }

    /// Lists MOS prefixes in discovery.
    #[must_use]
    pub fn with_mos(mut self, prefixes: &[&str]) -> Self {
        self.mos = prefixes.iter().map(|p| (*p).to_string()).collect();
        self
    }

    /// Lists PN prefixes in discovery.
    #[must_use]
    pub fn with_pn(mut self, prefixes: &[&str]) -> Self {
        self.pn = prefixes.iter().map(|p| (*p).to_string()).collect();
        self
    }

    /// The archive service answers with the proprietary-data notice.
    #[must_use]
    pub fn with_proprietary_data(mut self) -> Self {
        self.proprietary = true;
        self
    }

    /// The archive unpacks into `<obs_id>/ODF/` instead of `odf/`.
    #[must_use]
    pub fn with_nested_archive(mut self) -> Self {
        self.nested_archive = true;
        self
    }

    /// Discovery writes no listing at all.
    #[must_use]
    pub fn without_listings(mut self) -> Self {
        self.listings = false;
        self
    }

    /// Filtering produces no clean events for `prefix`.
    #[must_use]
    pub fn with_unfiltered(mut self, prefix: &str) -> Self {
        self.unfiltered.insert(prefix.to_string());
        self
    }

    /// Event generation for `unit` (a PN prefix or [`MOS_CHAIN`]) prints the TCX marker.
    #[must_use]
    pub fn with_tcx_fault(mut self, unit: &str, fault: TcxFault) -> Self {
        self.tcx_faults.insert(unit.to_string(), fault);
        self
    }

    /// The MOS filtering log flags these CCD indices of `prefix`.
    #[must_use]
    pub fn with_anomalous_ccds(mut self, prefix: &str, ccds: &[usize]) -> Self {
        self.anomalies.insert(prefix.to_string(), ccds.to_vec());
        self
    }

    /// Extraction of `prefix` reports a singular background fit.
    #[must_use]
    pub fn with_singular_fit(mut self, prefix: &str) -> Self {
        self.singular_fits.insert(prefix.to_string());
        self
    }

    /// Point-source detection of `prefix` excludes no sources.
    #[must_use]
    pub fn with_zero_sources(mut self, prefix: &str) -> Self {
        self.zero_sources.insert(prefix.to_string());
        self
    }

    /// The first `attempts` point-source runs for `prefix` leave no mask.
    #[must_use]
    pub fn with_mask_failures(mut self, prefix: &str, attempts: usize) -> Self {
        self.mask_failures.insert(prefix.to_string(), attempts);
        self
    }

    /// Extraction of `prefix` produces no spectrum.
    #[must_use]
    pub fn with_failed_extraction(mut self, prefix: &str) -> Self {
        self.failed_extractions.insert(prefix.to_string());
        self
    }

    fn tcx_log(&self, unit: &str, call: &ScriptedCall<'_>) -> String {
        let alternate = call.has_arg(&self.alternate_tcx_arg);
        match self.tcx_faults.get(unit) {
            Some(TcxFault::Persistent) => format!("** {}: warning ({})\n", call.invocation.tool, markers::TOO_FEW_TCX_POINTS),
            Some(TcxFault::FirstAttempt) if !alternate => {
                format!("** {}: warning ({})\n", call.invocation.tool, markers::TOO_FEW_TCX_POINTS)
            }
            _ => format!("{} finished\n", call.invocation.tool),
        }
    }

    fn filter_log(&self) -> String {
        let mut lines = vec!["mos-filter: processing exposures".to_string()];
        for prefix in &self.mos {
            lines.push(prefix.clone());
            let flagged = self.anomalies.get(prefix).cloned().unwrap_or_default();
            for ccd in 2..=7 {
                if flagged.contains(&ccd) {
                    lines.push(format!("    CCD {ccd} in anomalous state ****"));
                } else {
                    lines.push(format!("    CCD {ccd} nominal"));
                }
            }
        }
        lines.push("mos-filter: done".to_string());
        lines.join("\n")
    }

    /// Builds the runner.
    #[must_use]
    pub fn build(self) -> ScriptedToolRunner {
        let script = Arc::new(self);
        let cheese_attempts: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
        let obs = script.obs_id.clone();

        let s = Arc::clone(&script);
        let runner = ScriptedToolRunner::new()
            .on("download", move |_| {
                let body = if s.proprietary {
                    format!("Observation {} is proprietary until 2027-01-01\n", s.obs_id)
                } else {
                    "ustar00 archive payload\n".to_string()
                };
                ScriptedOutput::empty().with_file(format!("{}.tar", s.obs_id), body)
            });

        let s = Arc::clone(&script);
        let runner = runner.on("unpack", move |_| {
            let dir = if s.nested_archive {
                format!("{}/ODF", s.obs_id)
            } else {
                "odf".to_string()
            };
            ScriptedOutput::empty()
                .with_file(
                    format!("{dir}/0123_{}_SCX00000SUM.ASC", s.obs_id),
                    format!("Observation {}\n  Revolution  {:04}\n", s.obs_id, s.revolution),
                )
                .with_file(format!("{dir}/0123_{}_M1S00100IME.FIT", s.obs_id), "raw events")
        });

        let runner = runner
            .on("cifbuild", |_| ScriptedOutput::log("cifbuild: CIF written\n").with_file("ccf.cif", "cif"))
            .on("odfingest", move |_| {
                ScriptedOutput::log("odfingest: summary written\n")
                    .with_file(format!("0123_{obs}_SCX00000SUM.SAS"), "summary")
            });

        let s = Arc::clone(&script);
        let runner = runner.on("discovery", move |_| {
            let mut output = ScriptedOutput::empty();
            if s.listings {
                if !s.mos.is_empty() {
                    output = output.with_file("mos_exposures.txt", s.mos.join("\n") + "\n");
                }
                if !s.pn.is_empty() {
                    output = output.with_file("pn_exposures.txt", s.pn.join("\n") + "\n");
                }
            }
            output
        });

        let s = Arc::clone(&script);
        let runner = runner.on("epchain", move |call| {
            let prefix = format!(
                "{}{:03}",
                call.arg_value("schedule").unwrap_or("S"),
                call.arg_value("exposure").and_then(|e| e.parse::<u16>().ok()).unwrap_or(0)
            );
            let kind = if call.has_arg("withoutoftime=true") { "OOEVLI" } else { "PIEVLI" };
            ScriptedOutput::log(s.tcx_log(&prefix, call))
                .with_file(format!("P{}PN{prefix}{kind}0000.FIT", s.obs_id), "events")
        });

        let s = Arc::clone(&script);
        let runner = runner.on("pn-filter", move |_| {
            s.pn.iter()
                .filter(|p| !s.unfiltered.contains(*p))
                .fold(ScriptedOutput::log("pn-filter: done\n"), |out, p| {
                    out.with_file(format!("pn{p}-clean.fits"), "clean")
                })
        });

        let s = Arc::clone(&script);
        let runner = runner.on("emchain", move |call| ScriptedOutput::log(s.tcx_log(MOS_CHAIN, call)));

        let s = Arc::clone(&script);
        let runner = runner.on("mos-filter", move |_| {
            s.mos
                .iter()
                .filter(|p| !s.unfiltered.contains(*p))
                .fold(ScriptedOutput::log(s.filter_log()), |out, p| {
                    out.with_file(format!("mos{p}-clean.fits"), "clean")
                })
        });

        let s = Arc::clone(&script);
        let runner = runner.on("cheese", move |call| {
            let (family, prefix) = match (call.arg_value("prefixm"), call.arg_value("prefixp")) {
                (Some(p), _) => ("mos", p),
                (None, Some(p)) => ("pn", p),
                (None, None) => return ScriptedOutput::log("cheese: no prefix\n"),
            };
            let attempt = {
                let mut attempts = cheese_attempts.lock();
                let count = attempts.entry(prefix.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            let excluded = if s.zero_sources.contains(prefix) { 0 } else { 4 };
            let mut output = ScriptedOutput::log(format!("Number of excluded sources:            {excluded}\n"));
            if attempt > s.mask_failures.get(prefix).copied().unwrap_or(0) {
                output = output.with_file(format!("{family}{prefix}-bkg_region-sky.fits"), "mask");
            }
            output
        });

        runner
            .on("mos-spectra", spectra("mos", Arc::clone(&script)))
            .on("pn-spectra", spectra("pn", Arc::clone(&script)))
            .on("mos_back", background("mos"))
            .on("pn_back", background("pn"))
            .on("converter", |call| match call.flag_value("--prefix") {
                Some(detpref) => ScriptedOutput::log("converted\n")
                    .with_file(format!("{detpref}_processed.h5"), "hdf5"),
                None => ScriptedOutput::log("converter: no prefix\n"),
            })
    }
}

fn background(family: &'static str) -> impl Fn(&ScriptedCall<'_>) -> ScriptedOutput + Send + Sync + 'static {
    move |call: &ScriptedCall<'_>| match call.arg_value("prefix") {
        Some(prefix) => ScriptedOutput::log(format!("{family}_back: model written\n"))
            .with_file(format!("{family}{prefix}-qpb.fits"), "qpb"),
        None => ScriptedOutput::log(format!("{family}_back: no prefix\n")),
    }
}

fn spectra(
    family: &'static str,
    script: Arc<ObservationScript>,
) -> impl Fn(&ScriptedCall<'_>) -> ScriptedOutput + Send + Sync + 'static {
    move |call: &ScriptedCall<'_>| {
        let Some(prefix) = call.arg_value("prefix") else {
            return ScriptedOutput::log("spectra: no prefix\n");
        };
        if script.failed_extractions.contains(prefix) {
            return ScriptedOutput::log("spectra: no events in region\n");
        }
        let detpref = format!("{family}{prefix}");
        let mut output = ScriptedOutput::log(format!("{family}-spectra: extracting {prefix}\n"));
        if script.singular_fits.contains(prefix) {
            output = output.with_line(format!(
                "** {family}-spectra: error ({})",
                markers::ILLEGAL_DIVISION_BY_ZERO
            ));
        }
        output
            .with_file(format!("{detpref}-obj.pi"), "spectrum")
            .with_file(format!("{detpref}.rmf"), "rmf")
            .with_file(format!("{detpref}.arf"), "arf")
            .with_file(format!("{detpref}-back.pi"), "background spectrum")
    }
}
