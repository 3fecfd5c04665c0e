//! The reduction state machine.

use super::layout::ObservationLayout;
use super::report::RunReport;
use super::result::{InvocationRecord, StageOutcome, StageResult};
use super::retry::{should_retry, RetryDecision, RetryState};
use super::state::PipelineState;
use crate::anomaly::{AnomalyDecision, AnomalyResolver};
use crate::config::{PipelineConfig, Placeholders, ToolSpec};
use crate::core::{
    BackgroundState, DetectorFamily, ExposurePrefix, ExposureStatus, MaskState, Observation,
    ObservationId, ObservationStatus, MIN_REVOLUTION,
};
use crate::errors::{CleanupPolicy, EpicflowError, FailureKind, Result};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::inspect::{self, markers, MaskingMode};
use crate::registry::ExposureRegistry;
use crate::summary::SummaryLog;
use crate::tools::{ToolEnvironment, ToolInvocation, ToolRun, ToolRunner, SAS_CCF, SAS_CCFPATH, SAS_ODF};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Drives one observation through every [`PipelineState`].
///
/// A controller owns all of its state, including the tool environment, and
/// is consumed by [`PipelineController::run`]. Concurrent observations use
/// separate controllers.
pub struct PipelineController {
    run_id: Uuid,
    config: Arc<PipelineConfig>,
    runner: Arc<dyn ToolRunner>,
    env: ToolEnvironment,
    sink: Arc<dyn EventSink>,
    observation: Observation,
    layout: ObservationLayout,
    registry: ExposureRegistry,
    summary: Option<SummaryLog>,
    stages: Vec<StageResult>,
    current: StageResult,
    root_created: bool,
    mask_logs: HashMap<ExposurePrefix, String>,
}

impl fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineController")
            .field("run_id", &self.run_id)
            .field("obs_id", &self.observation.id)
            .field("status", &self.observation.status)
            .field("root", &self.layout.root())
            .field("stages", &self.stages.len())
            .finish_non_exhaustive()
    }
}

impl PipelineController {
    /// Creates a controller for `obs_id`.
    #[must_use]
    pub fn new(
        config: Arc<PipelineConfig>,
        obs_id: ObservationId,
        runner: Arc<dyn ToolRunner>,
    ) -> Self {
        let layout = ObservationLayout::new(&config.data_root, obs_id.clone());
        Self {
            run_id: Uuid::new_v4(),
            config,
            runner,
            env: ToolEnvironment::new(),
            sink: Arc::new(NoOpEventSink),
            observation: Observation::new(obs_id),
            layout,
            registry: ExposureRegistry::new(),
            summary: None,
            stages: Vec::new(),
            current: StageResult::started(PipelineState::Init),
            root_created: false,
            mask_logs: HashMap::new(),
        }
    }

    /// Uses `env` as the base tool environment (installation, extra bindings).
    #[must_use]
    pub fn with_environment(mut self, env: ToolEnvironment) -> Self {
        self.env = env;
        self
    }

    /// Reports events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Runs every state in order and returns the report.
    ///
    /// Failures never surface as `Err`: they end the run, apply the cleanup
    /// policy of their [`FailureKind`] and are recorded in the report.
    pub async fn run(mut self) -> RunReport {
        let span = info_span!("observation", obs_id = %self.observation.id, run_id = %self.run_id);
        async move {
            let mut state = PipelineState::Init;
            loop {
                match self.run_state(state).await {
                    Ok(()) => match state.next() {
                        Some(next) => state = next,
                        None => {
                            self.succeed();
                            break;
                        }
                    },
                    Err(err) => {
                        self.fail(&err);
                        break;
                    }
                }
            }
            self.into_report()
        }
        .instrument(span)
        .await
    }

    async fn run_state(&mut self, state: PipelineState) -> Result<()> {
        let span = info_span!("stage", stage = state.name());
        self.current = StageResult::started(state);
        self.observation.status = ObservationStatus::InProgress {
            stage: state.name().to_string(),
        };
        self.emit(PipelineEvent::StageStarted {
            obs_id: self.observation.id.to_string(),
            stage: state,
        });

        let result = async {
            if state.requires_active_exposures() && self.registry.active_count() == 0 {
                return Err(EpicflowError::gate(
                    FailureKind::RecoverableArtifactFailure,
                    "all exposures dropped",
                ));
            }
            match state {
                PipelineState::Init => self.init(),
                PipelineState::Acquire => self.acquire().await,
                PipelineState::ValidateRevolution => self.validate_revolution(),
                PipelineState::Calibrate => self.calibrate().await,
                PipelineState::Discover => self.discover().await,
                PipelineState::PnEvents => self.pn_events().await,
                PipelineState::MosEvents => self.mos_events().await,
                PipelineState::ResolveAnomalies => self.resolve_anomalies(),
                PipelineState::MaskPointSources => self.mask_point_sources().await,
                PipelineState::ExtractSpectra => self.extract_spectra().await,
                PipelineState::Convert => self.convert().await,
                PipelineState::Verify => self.verify(),
            }
        }
        .instrument(span)
        .await;

        match result {
            Ok(outcome) => {
                self.close_stage(outcome)?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn close_stage(&mut self, outcome: StageOutcome) -> Result<()> {
        let state = self.current.stage;
        if let Some(summary) = self.summary.as_mut() {
            summary.stage_outcome(state, &outcome)?;
        }
        self.emit(PipelineEvent::StageCompleted {
            obs_id: self.observation.id.to_string(),
            stage: state,
            outcome: outcome.clone(),
        });
        self.current.finish(outcome);
        self.stages.push(self.current.clone());
        Ok(())
    }

    fn succeed(&mut self) {
        info!("Observation complete");
        self.observation.status = ObservationStatus::Succeeded;
        if let Some(summary) = self.summary.as_mut() {
            if let Err(e) = summary.finish(true) {
                warn!(error = %e, "Failed to write summary terminal line");
            }
        }
        self.emit(PipelineEvent::ObservationFinished {
            obs_id: self.observation.id.to_string(),
            status: self.observation.status.clone(),
        });
    }

    fn fail(&mut self, err: &EpicflowError) {
        let kind = err.failure_kind();
        let reason = match err {
            EpicflowError::Gate { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        let state = self.current.stage;
        warn!(stage = state.name(), kind = %kind, reason = %reason, "Observation failed");

        let outcome = StageOutcome::Failed {
            kind,
            reason: reason.clone(),
        };
        if let Err(e) = self.close_stage(outcome) {
            warn!(error = %e, "Failed to record failed stage");
        }
        self.cleanup(kind.cleanup_policy());

        self.observation.status = ObservationStatus::Failed { kind, reason };
        if let Some(summary) = self.summary.as_mut() {
            if let Err(e) = summary.finish(false) {
                warn!(error = %e, "Failed to write summary terminal line");
            }
        }
        self.emit(PipelineEvent::ObservationFinished {
            obs_id: self.observation.id.to_string(),
            status: self.observation.status.clone(),
        });
    }

    fn cleanup(&mut self, policy: CleanupPolicy) {
        // Nothing this controller did not create is ever removed.
        if !self.root_created {
            return;
        }
        let (result, message) = match policy {
            CleanupPolicy::None => return,
            CleanupPolicy::DiscardWorkingData => (
                self.layout.discard_working_data(),
                "Discarded downloaded and working data",
            ),
            CleanupPolicy::RemoveIntermediates => (
                self.layout.remove_intermediates(),
                "Removed intermediate directories",
            ),
        };
        match result {
            Ok(()) => self.note(message),
            Err(e) => warn!(error = %e, root = %self.layout.root().display(), "Cleanup failed"),
        }
    }

    fn into_report(self) -> RunReport {
        RunReport {
            run_id: self.run_id,
            obs_id: self.observation.id,
            status: self.observation.status,
            revolution: self.observation.revolution,
            root: self.layout.root().to_path_buf(),
            summary_path: self.summary.as_ref().map(|s| s.path().to_path_buf()),
            stages: self.stages,
            exposures: self.registry.exposures().to_vec(),
        }
    }

    // Plumbing shared by the stages.

    fn emit(&self, event: PipelineEvent) {
        self.sink.emit(&event);
    }

    /// Writes a status line, or only logs it before the summary exists.
    fn note(&mut self, message: &str) {
        let stage = self.current.stage;
        match self.summary.as_mut() {
            Some(summary) => {
                if let Err(e) = summary.status(stage, message) {
                    warn!(error = %e, "Failed to write summary line");
                }
            }
            None => info!(stage = stage.name(), "{}", message),
        }
    }

    fn placeholders(&self, prefix: Option<&ExposurePrefix>) -> Placeholders {
        let root = self.layout.root();
        let data_root = root.parent().unwrap_or(root);
        let mut vars = Placeholders::new()
            .with("obs_id", self.observation.id.as_str())
            .with("data_root", data_root.display().to_string())
            .with("root", root.display().to_string())
            .with("archive", self.layout.archive_path().display().to_string())
            .with("ccf_path", self.config.calibration_path.display().to_string());
        if let Some(prefix) = prefix {
            vars = vars
                .with("prefix", prefix.to_string())
                .with("detpref", prefix.detpref());
        }
        vars
    }

    fn invocation(
        &self,
        tool: &str,
        spec: &ToolSpec,
        cwd: PathBuf,
        prefix: Option<&ExposurePrefix>,
        variant: Option<&str>,
    ) -> ToolInvocation {
        let detpref = prefix.map(ExposurePrefix::detpref);
        let log = self.layout.log(tool, detpref.as_deref(), variant);
        ToolInvocation::new(tool, &spec.program, cwd, log)
            .args(spec.render_args(&self.placeholders(prefix)))
    }

    async fn execute(&mut self, invocation: ToolInvocation) -> Result<ToolRun> {
        let command_line = invocation.command_line();
        if let Some(summary) = self.summary.as_mut() {
            summary.command(self.current.stage, &command_line)?;
        }
        self.emit(PipelineEvent::ToolInvoked {
            obs_id: self.observation.id.to_string(),
            tool: invocation.tool.clone(),
            command_line,
            log_path: invocation.log_path.clone(),
        });

        let run = self.runner.run(&invocation, &self.env).await?;
        debug!(
            tool = %invocation.tool,
            exit_code = ?run.exit_code,
            duration_ms = u64::try_from(run.duration.as_millis()).unwrap_or(u64::MAX),
            "Tool finished"
        );
        if run.timed_out {
            self.note(&format!(
                "{} timed out; its expected output is treated as absent",
                invocation.tool
            ));
        }
        self.current
            .invocations
            .push(InvocationRecord::new(&invocation, &run));
        Ok(run)
    }

    fn drop_exposure(&mut self, prefix: &ExposurePrefix, reason: String) {
        self.registry.drop_exposure(prefix, reason);
        self.record_drop(prefix);
    }

    /// Drops `prefix` unless `run` produced `expected`. Returns true if dropped.
    fn drop_unless_produced(
        &mut self,
        prefix: &ExposurePrefix,
        run: &ToolRun,
        expected: &Path,
        reason: &str,
    ) -> bool {
        if run.timed_out {
            self.drop_exposure(prefix, format!("{reason} (timed out)"));
            return true;
        }
        let dropped = self.registry.drop_if_missing(prefix, expected, reason);
        if dropped {
            self.record_drop(prefix);
        }
        dropped
    }

    fn record_drop(&mut self, prefix: &ExposurePrefix) {
        let reason = match self.registry.get(prefix).map(|e| &e.status) {
            Some(ExposureStatus::Dropped(reason)) => reason.clone(),
            _ => return,
        };
        self.note(&format!("Dropping {prefix}: {reason}"));
        self.emit(PipelineEvent::ExposureDropped {
            obs_id: self.observation.id.to_string(),
            prefix: prefix.to_string(),
            reason,
        });
    }

    fn add_exposure_note(&mut self, prefix: &ExposurePrefix, note: String) {
        self.note(&format!("{prefix}: {note}"));
        if let Some(exposure) = self.registry.get_mut(prefix) {
            exposure.notes.push(note);
        }
    }

    /// Runs `build(self, alternate_tcx)` and reruns it once with the
    /// alternate time-correlation source if any log carries the marker.
    async fn run_with_tcx_retry<F>(&mut self, unit: &str, build: F) -> Result<()>
    where
        F: Fn(&Self, bool) -> Vec<ToolInvocation> + Send,
    {
        let policy = self.current.stage.retry_budget();
        let mut retry = RetryState::new();
        loop {
            let alternate = retry.begin_attempt() > 1;
            let mut triggered = false;
            for invocation in build(self, alternate) {
                let run = self.execute(invocation).await?;
                triggered |= policy.is_triggered(&run.log_text, true);
            }
            match should_retry(&retry, &policy, triggered) {
                RetryDecision::Retry => {
                    self.current.retries += 1;
                    self.note(&format!(
                        "{}: {unit}, switching time-correlation source and rerunning",
                        markers::TOO_FEW_TCX_POINTS
                    ));
                }
                RetryDecision::GiveUp => {
                    self.note(&format!(
                        "{}: {unit} persists with the alternate source; not retrying again",
                        markers::TOO_FEW_TCX_POINTS
                    ));
                    return Ok(());
                }
                RetryDecision::NotRetryable => return Ok(()),
            }
        }
    }

    // Stages.

    fn init(&mut self) -> Result<StageOutcome> {
        let data_root = absolute(&self.config.data_root)?;
        self.layout = ObservationLayout::new(&data_root, self.observation.id.clone());
        let root = self.layout.root().to_path_buf();

        if root.exists() {
            return Err(EpicflowError::gate(
                FailureKind::FatalValidation,
                format!("observation already processed ({} exists)", root.display()),
            ));
        }

        std::fs::create_dir_all(&data_root)?;
        std::fs::create_dir(&root)?;
        self.root_created = true;
        self.summary = Some(SummaryLog::create(self.layout.summary_path())?);
        self.note(&format!("Processing observation {}", self.observation.id));

        let ccf_path = absolute(&self.config.calibration_path)?;
        self.env.bind(SAS_CCF, self.layout.ccf_index().display().to_string());
        self.env.bind(SAS_ODF, self.layout.odf_dir().display().to_string());
        self.env.bind(SAS_CCFPATH, ccf_path.display().to_string());
        Ok(StageOutcome::Passed)
    }

    async fn acquire(&mut self) -> Result<StageOutcome> {
        let root = self.layout.root().to_path_buf();
        let download = self.invocation("download", &self.config.tools.download, root.clone(), None, None);
        let run = self.execute(download).await?;

        let archive = self.layout.archive_path();
        if !run.produced(&archive) {
            return Err(EpicflowError::gate(
                FailureKind::FatalAcquisition,
                "archive was not downloaded",
            ));
        }
        let first_line = inspect::read_first_line(&archive)?;
        if inspect::is_access_denied(&first_line, &self.config.proprietary_marker) {
            return Err(EpicflowError::gate(
                FailureKind::FatalAcquisition,
                format!("observation data is proprietary: {first_line}"),
            ));
        }

        let unpack = self.invocation("unpack", &self.config.tools.unpack, root, None, None);
        if self.execute(unpack).await?.timed_out {
            return Err(EpicflowError::gate(
                FailureKind::FatalAcquisition,
                "archive unpacking timed out",
            ));
        }

        if !self.layout.odf_dir().is_dir() {
            match self.layout.reconstruct_odf(&self.config.message_file_suffix)? {
                Some(source) => self.note(&format!(
                    "Unpacked layout unexpected; rebuilt odf/ from {}",
                    source.display()
                )),
                None => {
                    return Err(EpicflowError::gate(
                        FailureKind::FatalAcquisition,
                        "archive did not unpack into a recognizable ODF layout",
                    ))
                }
            }
        }
        std::fs::remove_file(&archive)?;
        Ok(StageOutcome::Passed)
    }

    fn validate_revolution(&mut self) -> Result<StageOutcome> {
        let suffix = self.config.message_file_suffix.clone();
        let message_file = self.layout.find_in_odf(&suffix)?.ok_or_else(|| {
            EpicflowError::gate(
                FailureKind::FatalValidation,
                format!("no *{suffix} message file in the ODF"),
            )
        })?;

        let revolution = inspect::extract_revolution(&inspect::read_log(&message_file)?)?;
        self.observation.revolution = Some(revolution);
        self.note(&format!("Revolution {revolution}"));

        if revolution < MIN_REVOLUTION {
            return Err(EpicflowError::gate(
                FailureKind::FatalValidation,
                format!("revolution {revolution} is before {MIN_REVOLUTION}"),
            ));
        }
        Ok(StageOutcome::Passed)
    }

    async fn calibrate(&mut self) -> Result<StageOutcome> {
        let odf = self.layout.odf_dir();
        let cifbuild = self.invocation("cifbuild", &self.config.tools.cifbuild, odf.clone(), None, None);
        let run = self.execute(cifbuild).await?;
        if !run.produced(&self.layout.ccf_index()) {
            return Err(EpicflowError::gate(
                FailureKind::FatalValidation,
                "calibration index was not produced",
            ));
        }

        let odfingest = self.invocation("odfingest", &self.config.tools.odfingest, odf, None, None);
        let run = self.execute(odfingest).await?;
        let ingested = match self.layout.find_in_odf(super::layout::ODF_SUMMARY_SUFFIX)? {
            Some(path) if run.produced(&path) => path,
            _ => {
                return Err(EpicflowError::gate(
                    FailureKind::FatalValidation,
                    "ODF summary was not produced",
                ))
            }
        };

        let resolved = std::fs::canonicalize(&ingested)?;
        self.env.bind(SAS_ODF, resolved.display().to_string());
        self.note(&format!("{SAS_ODF} rebound to {}", resolved.display()));
        Ok(StageOutcome::Passed)
    }

    async fn discover(&mut self) -> Result<StageOutcome> {
        let root = self.layout.root().to_path_buf();
        let discovery = self.invocation("discovery", &self.config.tools.discovery, root.clone(), None, None);
        let run = self.execute(discovery).await?;

        let listings = if run.timed_out {
            None
        } else {
            ExposureRegistry::from_listings(&root)?
        };
        let registry = listings
            .filter(|r| !r.is_empty())
            .ok_or_else(|| EpicflowError::gate(FailureKind::FatalValidation, "no science exposures"))?;
        self.registry = registry;

        for family in [DetectorFamily::Mos, DetectorFamily::Pn] {
            let prefixes = self.registry.active_prefixes(family);
            let listed: Vec<String> = prefixes.iter().map(ToString::to_string).collect();
            self.note(&format!("{family} exposures: {}", listed.join(" ")));
        }
        Ok(StageOutcome::Passed)
    }

    fn epchain(&self, prefix: &ExposurePrefix, out_of_time: bool, alternate_tcx: bool) -> ToolInvocation {
        let variant = match (out_of_time, alternate_tcx) {
            (true, false) => Some("oot"),
            (true, true) => Some("oot-tcx"),
            (false, true) => Some("tcx"),
            (false, false) => None,
        };
        let mut invocation = self
            .invocation("epchain", &self.config.tools.epchain, self.layout.odf_dir(), Some(prefix), variant)
            .arg(format!("schedule={}", prefix.schedule().code()))
            .arg(format!("exposure={}", prefix.sequence()));
        if out_of_time {
            invocation = invocation.arg("withoutoftime=true");
        }
        if alternate_tcx {
            invocation = invocation.args(self.config.alternate_tcx_args.iter().cloned());
        }
        invocation
    }

    async fn pn_events(&mut self) -> Result<StageOutcome> {
        let prefixes = self.registry.active_prefixes(DetectorFamily::Pn);
        if prefixes.is_empty() {
            return Ok(StageOutcome::skipped("no PN exposures"));
        }

        for prefix in &prefixes {
            let unit = prefix.clone();
            self.run_with_tcx_retry(&format!("PN exposure {prefix}"), move |this, alternate| {
                vec![this.epchain(&unit, true, alternate), this.epchain(&unit, false, alternate)]
            })
            .await?;

            let event_lists = self.layout.pn_event_lists(prefix)?;
            for list in &event_lists {
                let name = list
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let stem = name.trim_end_matches(".FIT").to_string();
                let invocation = self
                    .invocation(
                        "epspatialcti",
                        &self.config.tools.epspatialcti,
                        self.layout.odf_dir(),
                        Some(prefix),
                        Some(&stem),
                    )
                    .arg(format!("eventset={name}"));
                self.execute(invocation).await?;
            }
            if event_lists.is_empty() {
                self.add_exposure_note(prefix, "no event lists produced".to_string());
            } else {
                self.registry.set_status(prefix, ExposureStatus::EventsGenerated);
            }
        }

        let filter = self.invocation("pn-filter", &self.config.tools.pn_filter, self.layout.odf_dir(), None, None);
        let run = self.execute(filter).await?;
        self.gate_filtered(&prefixes, &run);
        Ok(StageOutcome::Passed)
    }

    async fn mos_events(&mut self) -> Result<StageOutcome> {
        let prefixes = self.registry.active_prefixes(DetectorFamily::Mos);
        if prefixes.is_empty() {
            return Ok(StageOutcome::skipped("no MOS exposures"));
        }

        self.run_with_tcx_retry("MOS event chain", |this, alternate| {
            let mut invocation = this.invocation(
                "emchain",
                &this.config.tools.emchain,
                this.layout.odf_dir(),
                None,
                alternate.then_some("tcx"),
            );
            if alternate {
                invocation = invocation.args(this.config.alternate_tcx_args.iter().cloned());
            }
            vec![invocation]
        })
        .await?;
        for prefix in &prefixes {
            self.registry.set_status(prefix, ExposureStatus::EventsGenerated);
        }

        let filter = self.invocation("mos-filter", &self.config.tools.mos_filter, self.layout.odf_dir(), None, None);
        let run = self.execute(filter).await?;
        self.gate_filtered(&prefixes, &run);
        Ok(StageOutcome::Passed)
    }

    fn gate_filtered(&mut self, prefixes: &[ExposurePrefix], run: &ToolRun) {
        for prefix in prefixes {
            let clean = self.layout.clean_events(prefix);
            if !self.drop_unless_produced(prefix, run, &clean, "no filtered events") {
                self.registry.set_status(prefix, ExposureStatus::Filtered);
            }
        }
    }

    fn resolve_anomalies(&mut self) -> Result<StageOutcome> {
        if self.registry.active_prefixes(DetectorFamily::Mos).is_empty() {
            return Ok(StageOutcome::skipped("no MOS exposures"));
        }

        let filter_log = inspect::read_log(&self.layout.log("mos-filter", None, None))?;
        let decisions = AnomalyResolver::new(&filter_log).apply(&mut self.registry);
        for decision in decisions {
            match decision {
                AnomalyDecision::Excluded { prefix } => self.record_drop(&prefix),
                AnomalyDecision::Usable {
                    prefix,
                    vector,
                    header_found,
                } => {
                    let source = if header_found { "" } else { " (no log header, all assumed usable)" };
                    self.note(&format!("CCD usability for {prefix}: {vector}{source}"));
                }
            }
        }
        Ok(StageOutcome::Passed)
    }

    async fn mask_point_sources(&mut self) -> Result<StageOutcome> {
        let policy = self.current.stage.retry_budget();
        for prefix in self.registry.all_active() {
            let mask = self.layout.mask(&prefix);
            let binding = match prefix.family() {
                DetectorFamily::Mos => format!("prefixm={prefix}"),
                DetectorFamily::Pn => format!("prefixp={prefix}"),
            };

            let mut retry = RetryState::new();
            let (log_text, present) = loop {
                let attempt = retry.begin_attempt();
                let variant = (attempt > 1).then(|| format!("retry{attempt}"));
                let invocation = self
                    .invocation(
                        "cheese",
                        &self.config.tools.cheese,
                        self.layout.odf_dir(),
                        Some(&prefix),
                        variant.as_deref(),
                    )
                    .arg(binding.clone());
                let run = self.execute(invocation).await?;
                let present = run.produced(&mask);
                match should_retry(&retry, &policy, policy.is_triggered(&run.log_text, present)) {
                    RetryDecision::Retry => {
                        self.current.retries += 1;
                        self.note(&format!("No mask for {prefix} after attempt {attempt}; retrying"));
                    }
                    RetryDecision::GiveUp | RetryDecision::NotRetryable => break (run.log_text, present),
                }
            };

            let state = if present {
                MaskState::Available
            } else {
                self.add_exposure_note(
                    &prefix,
                    format!("no point-source mask after {} attempts", retry.attempts()),
                );
                MaskState::Unavailable
            };
            if let Some(exposure) = self.registry.get_mut(&prefix) {
                exposure.mask = state;
            }
            self.mask_logs.insert(prefix, log_text);
        }
        Ok(StageOutcome::Passed)
    }

    fn masking_mode(&self, prefix: &ExposurePrefix) -> MaskingMode {
        let mask_available = self
            .registry
            .get(prefix)
            .is_some_and(|e| e.mask == MaskState::Available);
        match self.mask_logs.get(prefix) {
            Some(log) if mask_available => inspect::masking_mode(log),
            _ => MaskingMode::Unmasked,
        }
    }

    async fn extract_spectra(&mut self) -> Result<StageOutcome> {
        for prefix in self.registry.all_active() {
            let mode = self.masking_mode(&prefix);
            let usability = self
                .registry
                .get(&prefix)
                .map(|e| e.usability.tool_args())
                .unwrap_or_default();
            let (tool, spec, back_tool, back_spec) = match prefix.family() {
                DetectorFamily::Mos => (
                    "mos-spectra",
                    &self.config.tools.mos_spectra,
                    "mos_back",
                    &self.config.tools.mos_back,
                ),
                DetectorFamily::Pn => (
                    "pn-spectra",
                    &self.config.tools.pn_spectra,
                    "pn_back",
                    &self.config.tools.pn_back,
                ),
            };
            let extraction = self
                .invocation(tool, spec, self.layout.odf_dir(), Some(&prefix), None)
                .arg(format!("prefix={prefix}"))
                .arg(format!("mask={}", mode.flag()))
                .args(usability.iter().cloned());
            let background = self
                .invocation(back_tool, back_spec, self.layout.odf_dir(), Some(&prefix), None)
                .arg(format!("prefix={prefix}"))
                .args(usability);

            self.note(&format!("Extracting {prefix} {mode}"));
            let run = self.execute(extraction).await?;
            let spectrum = self.layout.spectrum(&prefix);
            if self.drop_unless_produced(&prefix, &run, &spectrum, "spectral extraction failed") {
                continue;
            }
            self.registry.set_status(&prefix, ExposureStatus::SpectraReady);

            if run.has_marker(markers::ILLEGAL_DIVISION_BY_ZERO) {
                let reason = "singular background fit: insufficient corner-region statistics";
                self.add_exposure_note(
                    &prefix,
                    format!("{}: background estimation skipped", FailureKind::DegradedEstimation),
                );
                if let Some(exposure) = self.registry.get_mut(&prefix) {
                    exposure.background = BackgroundState::Skipped(reason.to_string());
                }
                continue;
            }

            let run = self.execute(background).await?;
            let state = if run.produced(&self.layout.qpb_model(&prefix)) {
                self.registry.set_status(&prefix, ExposureStatus::BackgroundReady);
                BackgroundState::Estimated
            } else {
                let reason = if run.timed_out {
                    "background estimation timed out"
                } else {
                    "no particle background model produced"
                };
                self.add_exposure_note(
                    &prefix,
                    format!("{}: {reason}", FailureKind::DegradedEstimation),
                );
                BackgroundState::Skipped(reason.to_string())
            };
            if let Some(exposure) = self.registry.get_mut(&prefix) {
                exposure.background = state;
            }
        }
        Ok(StageOutcome::Passed)
    }

    async fn convert(&mut self) -> Result<StageOutcome> {
        let root = self.layout.root().to_path_buf();
        for prefix in self.registry.all_active() {
            let missing: Vec<String> = self
                .layout
                .conversion_inputs(&prefix)
                .iter()
                .filter(|p| !p.is_file())
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect();
            if !missing.is_empty() {
                self.add_exposure_note(
                    &prefix,
                    format!("conversion skipped: missing {}", missing.join(", ")),
                );
                continue;
            }

            let converter = self.invocation(
                "converter",
                &self.config.tools.converter,
                root.clone(),
                Some(&prefix),
                None,
            );
            let run = self.execute(converter).await?;
            let output = self.layout.converted_output(&prefix);
            if run.produced(&output) {
                self.registry.set_status(&prefix, ExposureStatus::Converted);
            } else if run.timed_out && output.exists() {
                std::fs::remove_file(&output)?;
                self.add_exposure_note(&prefix, "converter timed out; partial output removed".to_string());
            } else {
                self.add_exposure_note(&prefix, "converter produced no output".to_string());
            }
        }

        self.layout.remove_intermediates()?;
        self.note("Removed intermediate directories");
        Ok(StageOutcome::Passed)
    }

    fn verify(&mut self) -> Result<StageOutcome> {
        let mut converted = 0;
        let mut missing = Vec::new();
        for exposure in self.registry.exposures() {
            if self.layout.converted_output(&exposure.prefix).is_file() {
                converted += 1;
            } else if exposure.is_active() && exposure.extraction_succeeded() {
                missing.push(exposure.prefix.clone());
            }
        }
        for prefix in &missing {
            self.note(&format!(
                "Converted output missing for {prefix} although extraction succeeded"
            ));
        }

        if converted == 0 {
            return Err(EpicflowError::gate(
                FailureKind::TerminalVerification,
                "no converted outputs",
            ));
        }
        self.note(&format!("{converted} converted output(s)"));
        Ok(StageOutcome::Passed)
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::MockToolRunner;

    fn config(dir: &Path) -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig::default().with_data_root(dir))
    }

    #[tokio::test]
    async fn test_existing_root_fails_before_any_tool_runs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("0100000101");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("mos1S001_processed.h5"), b"earlier").unwrap();

        let mut mock = MockToolRunner::new();
        mock.expect_run().never();

        let report = PipelineController::new(config(dir.path()), "0100000101".parse().unwrap(), Arc::new(mock))
            .run()
            .await;

        assert_eq!(report.failure_kind(), Some(FailureKind::FatalValidation));
        assert_eq!(report.summary_path, None);
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_archive_is_fatal_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockToolRunner::new();
        mock.expect_run().times(1).returning(|invocation, _| {
            Ok(ToolRun {
                log_path: invocation.log_path.clone(),
                log_text: "curl: (6) Could not resolve host".to_string(),
                exit_code: Some(6),
                timed_out: false,
                duration: std::time::Duration::ZERO,
            })
        });

        let report = PipelineController::new(config(dir.path()), "0100000101".parse().unwrap(), Arc::new(mock))
            .run()
            .await;

        assert_eq!(report.failure_kind(), Some(FailureKind::FatalAcquisition));
        let summary = std::fs::read_to_string(report.summary_path.unwrap()).unwrap();
        assert!(summary.starts_with("Processing observation 0100000101\n"));
        assert!(summary.ends_with("Processing failed!\n"));
    }

    #[test]
    fn test_debug_is_compact() {
        let controller = PipelineController::new(
            Arc::new(PipelineConfig::default()),
            "0100000101".parse().unwrap(),
            Arc::new(MockToolRunner::new()),
        );
        let text = format!("{controller:?}");
        assert!(text.contains("0100000101"));
    }
}
