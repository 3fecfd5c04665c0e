#[cfg(test)]
mod tests {
    use crate::anomaly::ALL_CCDS_ANOMALOUS;
    use crate::config::PipelineConfig;
    use crate::core::{BackgroundState, ExposureStatus, MaskState};
    use crate::errors::FailureKind;
    use crate::events::{CollectingEventSink, EventSink};
    use crate::pipeline::{PipelineController, PipelineState, RunReport};
    use crate::testing::{ObservationScript, ScriptedOutput, ScriptedToolRunner, TcxFault, MOS_CHAIN};
    use crate::tools::{SAS_CCF, SAS_ODF};
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::Arc;

    const OBS: &str = "0100000101";

    async fn run_with(
        dir: &Path,
        runner: ScriptedToolRunner,
        sink: Option<Arc<dyn EventSink>>,
    ) -> (RunReport, Arc<ScriptedToolRunner>) {
        let config = Arc::new(PipelineConfig::default().with_data_root(dir));
        let runner = Arc::new(runner);
        let mut controller = PipelineController::new(config, OBS.parse().unwrap(), runner.clone());
        if let Some(sink) = sink {
            controller = controller.with_event_sink(sink);
        }
        (controller.run().await, runner)
    }

    async fn run(dir: &Path, script: ObservationScript) -> (RunReport, Arc<ScriptedToolRunner>) {
        run_with(dir, script.build(), None).await
    }

    fn summary(report: &RunReport) -> String {
        std::fs::read_to_string(report.summary_path.as_ref().unwrap()).unwrap()
    }

    fn args_of(runner: &ScriptedToolRunner, tool: &str) -> Vec<Vec<String>> {
        runner.invocations_of(tool).into_iter().map(|i| i.args).collect()
    }

    #[tokio::test]
    async fn test_nominal_observation_completes() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS).with_mos(&["1S001"]).with_pn(&["S003"]);

        let (report, runner) = run(dir.path(), script).await;

        assert!(report.succeeded(), "{report}");
        assert_eq!(report.revolution, Some(123));
        assert_eq!(report.converted_prefixes(), vec!["1S001", "S003"]);
        assert_eq!(
            runner.tool_sequence(),
            vec![
                "download", "unpack", "cifbuild", "odfingest", "discovery",
                "epchain", "epchain", "epspatialcti", "epspatialcti", "pn-filter",
                "emchain", "mos-filter",
                "cheese", "cheese",
                "mos-spectra", "mos_back", "pn-spectra", "pn_back",
                "converter", "converter",
            ]
        );
        assert_eq!(report.stages.len(), PipelineState::ALL.len());

        let root = dir.path().join(OBS);
        assert!(root.join("mos1S001_processed.h5").is_file());
        assert!(root.join("pnS003_processed.h5").is_file());
        assert!(!root.join("odf").exists());
        assert!(!root.join(format!("{OBS}.tar")).exists());

        let text = summary(&report);
        assert!(text.starts_with(&format!("Processing observation {OBS}\n")));
        assert!(text.contains("MOS exposures: 1S001"));
        assert!(text.contains("Stage verify: passed"));
        assert!(text.ends_with("Complete!\n"));
    }

    #[tokio::test]
    async fn test_early_revolution_discards_working_data() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS)
            .with_revolution(41)
            .with_mos(&["1S001"]);

        let (report, runner) = run(dir.path(), script).await;

        assert_eq!(report.failure_kind(), Some(FailureKind::FatalValidation));
        assert_eq!(report.last_stage(), Some(PipelineState::ValidateRevolution));
        assert_eq!(report.revolution, Some(41));
        assert_eq!(runner.tool_sequence(), vec!["download", "unpack"]);
        assert_eq!(runner.call_count("discovery"), 0);

        let root = dir.path().join(OBS);
        assert!(!root.join("odf").exists());
        let text = summary(&report);
        assert!(text.contains("revolution 41 is before 42"));
        assert!(text.ends_with("Processing failed!\n"));
    }

    #[tokio::test]
    async fn test_rerun_on_processed_observation_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = run(dir.path(), ObservationScript::new(OBS).with_pn(&["S003"])).await;
        assert!(first.succeeded());

        let root = dir.path().join(OBS);
        let listing = |root: &Path| {
            let mut names: Vec<String> = std::fs::read_dir(root)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        };
        let before = listing(&root);
        let summary_before = summary(&first);

        let (second, runner) = run(dir.path(), ObservationScript::new(OBS).with_pn(&["S003"])).await;

        assert_eq!(second.failure_kind(), Some(FailureKind::FatalValidation));
        assert_eq!(second.last_stage(), Some(PipelineState::Init));
        assert_eq!(second.summary_path, None);
        assert!(runner.invocations().is_empty());
        assert_eq!(listing(&root), before);
        assert_eq!(summary(&first), summary_before);
    }

    #[tokio::test]
    async fn test_central_only_exposure_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS)
            .with_mos(&["1S001", "2S001"])
            .with_anomalous_ccds("1S001", &[4])
            .with_anomalous_ccds("2S001", &[2, 3, 4, 5, 6, 7]);

        let (report, runner) = run(dir.path(), script).await;

        assert!(report.succeeded(), "{report}");
        let excluded = report.exposure("2S001").unwrap();
        assert_eq!(excluded.status, ExposureStatus::Dropped(ALL_CCDS_ANOMALOUS.to_string()));

        let kept = report.exposure("1S001").unwrap();
        assert_eq!(kept.usability.to_string(), "[1,1,1,0,1,1,1]");
        let extraction = args_of(&runner, "mos-spectra");
        assert_eq!(extraction.len(), 1);
        assert!(extraction[0].contains(&"ccd4=0".to_string()));
        assert!(extraction[0].contains(&"ccd5=1".to_string()));

        assert!(args_of(&runner, "cheese")
            .iter()
            .all(|args| !args.contains(&"prefixm=2S001".to_string())));
        let text = summary(&report);
        assert!(text.contains("Dropping 2S001: all-CCDs-anomalous"));
        assert!(!text.contains("Converted output missing for 2S001"));
    }

    #[tokio::test]
    async fn test_anomalies_map_to_their_own_exposure() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS)
            .with_mos(&["1S001", "2S001"])
            .with_anomalous_ccds("1S001", &[3])
            .with_anomalous_ccds("2S001", &[6, 7]);

        let (report, _) = run(dir.path(), script).await;

        assert_eq!(report.exposure("1S001").unwrap().usability.to_string(), "[1,1,0,1,1,1,1]");
        assert_eq!(report.exposure("2S001").unwrap().usability.to_string(), "[1,1,1,1,1,0,0]");
    }

    #[tokio::test]
    async fn test_tcx_retry_runs_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS)
            .with_mos(&["1S001"])
            .with_pn(&["S003"])
            .with_tcx_fault("S003", TcxFault::Persistent)
            .with_tcx_fault(MOS_CHAIN, TcxFault::Persistent);

        let (report, runner) = run(dir.path(), script).await;

        assert!(report.succeeded(), "{report}");
        assert_eq!(runner.call_count("epchain"), 4);
        assert_eq!(runner.call_count("emchain"), 2);
        assert_eq!(report.stage(PipelineState::PnEvents).unwrap().retries, 1);
        assert_eq!(report.stage(PipelineState::MosEvents).unwrap().retries, 1);

        let emchain = args_of(&runner, "emchain");
        assert!(!emchain[0].contains(&"usetcx=no".to_string()));
        assert!(emchain[1].contains(&"usetcx=no".to_string()));
        assert!(args_of(&runner, "epchain")[2..]
            .iter()
            .all(|args| args.contains(&"usetcx=no".to_string())));
        assert!(summary(&report).contains("persists with the alternate source"));
    }

    #[tokio::test]
    async fn test_tcx_retry_recovers_with_alternate_source() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS)
            .with_mos(&["1S001"])
            .with_tcx_fault(MOS_CHAIN, TcxFault::FirstAttempt);

        let (report, runner) = run(dir.path(), script).await;

        assert!(report.succeeded());
        assert_eq!(runner.call_count("emchain"), 2);
        assert!(dir.path().join(OBS).join("emchain-tcx.log").is_file());
        let text = summary(&report);
        assert!(text.contains("switching time-correlation source"));
        assert!(!text.contains("persists"));
    }

    #[tokio::test]
    async fn test_pn_without_marker_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let (report, runner) = run(dir.path(), ObservationScript::new(OBS).with_pn(&["S003"])).await;

        assert!(report.succeeded());
        assert_eq!(runner.call_count("epchain"), 2);
        assert_eq!(runner.call_count("emchain"), 0);
        assert!(matches!(
            report.stage(PipelineState::MosEvents).unwrap().outcome,
            crate::pipeline::StageOutcome::Skipped { .. }
        ));
        let eventsets: Vec<String> = args_of(&runner, "epspatialcti").concat();
        assert_eq!(
            eventsets,
            vec![
                format!("eventset=P{OBS}PNS003OOEVLI0000.FIT"),
                format!("eventset=P{OBS}PNS003PIEVLI0000.FIT"),
            ]
        );
    }

    #[tokio::test]
    async fn test_masking_mode_follows_detection_log() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS)
            .with_mos(&["1S001"])
            .with_pn(&["S003"])
            .with_zero_sources("1S001");

        let (report, runner) = run(dir.path(), script).await;

        assert!(report.succeeded());
        assert!(args_of(&runner, "mos-spectra")[0].contains(&"mask=0".to_string()));
        assert!(args_of(&runner, "pn-spectra")[0].contains(&"mask=1".to_string()));
        assert!(args_of(&runner, "pn-spectra")[0].contains(&"quad1=1".to_string()));
    }

    #[tokio::test]
    async fn test_mask_retries_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS)
            .with_mos(&["1S001"])
            .with_pn(&["S003"])
            .with_mask_failures("1S001", 5)
            .with_mask_failures("S003", 1);

        let (report, runner) = run(dir.path(), script).await;

        assert!(report.succeeded(), "{report}");
        let cheese = args_of(&runner, "cheese");
        let mos_attempts = cheese.iter().filter(|a| a.contains(&"prefixm=1S001".to_string())).count();
        let pn_attempts = cheese.iter().filter(|a| a.contains(&"prefixp=S003".to_string())).count();
        assert_eq!(mos_attempts, 3);
        assert_eq!(pn_attempts, 2);
        assert_eq!(report.stage(PipelineState::MaskPointSources).unwrap().retries, 3);

        assert_eq!(report.exposure("1S001").unwrap().mask, MaskState::Unavailable);
        assert_eq!(report.exposure("S003").unwrap().mask, MaskState::Available);
        assert!(args_of(&runner, "mos-spectra")[0].contains(&"mask=0".to_string()));
        assert!(args_of(&runner, "pn-spectra")[0].contains(&"mask=1".to_string()));
        assert!(dir.path().join(OBS).join("cheese-mos1S001-retry3.log").is_file());
    }

    #[tokio::test]
    async fn test_end_to_end_with_dropped_and_degraded_exposures() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS)
            .with_mos(&["1S001", "2S001"])
            .with_pn(&["S002"])
            .with_unfiltered("2S001")
            .with_singular_fit("1S001");

        let (report, runner) = run(dir.path(), script).await;

        assert!(report.succeeded(), "{report}");
        assert_eq!(report.active_prefixes(), vec!["1S001", "S002"]);
        assert_eq!(report.converted_prefixes(), vec!["1S001", "S002"]);

        let degraded = report.exposure("1S001").unwrap();
        assert!(matches!(degraded.background, BackgroundState::Skipped(_)));
        assert!(degraded.notes.iter().any(|n| n.contains("degraded estimation")));
        let nominal = report.exposure("S002").unwrap();
        assert_eq!(nominal.background, BackgroundState::Estimated);
        assert_eq!(
            report.exposure("2S001").unwrap().status,
            ExposureStatus::Dropped("no filtered events (mos2S001-clean.fits missing)".to_string())
        );

        assert_eq!(runner.call_count("mos_back"), 0);
        assert_eq!(runner.call_count("pn_back"), 1);
        assert_eq!(runner.call_count("converter"), 2);

        let text = summary(&report);
        let (before, after) = text
            .split_once("Dropping 2S001: no filtered events (mos2S001-clean.fits missing)\n")
            .expect("drop line present");
        assert!(before.contains("2S001"));
        assert!(!after.contains("2S001"), "{after}");
        assert!(text.ends_with("Complete!\n"));
    }

    #[tokio::test]
    async fn test_timed_out_filter_output_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ObservationScript::new(OBS)
            .with_mos(&["1S001"])
            .with_pn(&["S003"])
            .build()
            .on("pn-filter", |_| {
                ScriptedOutput::log("pn-filter: filtering S003\n")
                    .with_file("pnS003-clean.fits", "trunc")
                    .timed_out()
            });

        let (report, runner) = run_with(dir.path(), runner, None).await;

        assert!(report.succeeded(), "{report}");
        assert_eq!(
            report.exposure("S003").unwrap().status,
            ExposureStatus::Dropped("no filtered events (timed out)".to_string())
        );
        assert_eq!(report.converted_prefixes(), vec!["1S001"]);
        assert_eq!(runner.call_count("pn-spectra"), 0);
        assert!(!dir.path().join(OBS).join("pnS003_processed.h5").exists());
        assert!(summary(&report).contains("pn-filter timed out"));
    }

    #[tokio::test]
    async fn test_timed_out_calibration_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ObservationScript::new(OBS)
            .with_mos(&["1S001"])
            .build()
            .on("cifbuild", |_| ScriptedOutput::empty().with_file("ccf.cif", "partial").timed_out());

        let (report, runner) = run_with(dir.path(), runner, None).await;

        assert_eq!(report.failure_kind(), Some(FailureKind::FatalValidation));
        assert_eq!(report.last_stage(), Some(PipelineState::Calibrate));
        assert_eq!(runner.call_count("odfingest"), 0);
        assert!(summary(&report).contains("calibration index was not produced"));
    }

    #[tokio::test]
    async fn test_missing_background_model_degrades_exposure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ObservationScript::new(OBS)
            .with_mos(&["1S001"])
            .with_pn(&["S003"])
            .build()
            .on("pn_back", |_| ScriptedOutput::log("** pn_back: error (NoQPBModel)\n"));

        let (report, _) = run_with(dir.path(), runner, None).await;

        assert!(report.succeeded(), "{report}");
        let pn = report.exposure("S003").unwrap();
        assert_eq!(
            pn.background,
            BackgroundState::Skipped("no particle background model produced".to_string())
        );
        assert!(pn.notes.iter().any(|n| n.contains("degraded estimation")));
        assert_eq!(pn.status, ExposureStatus::Converted);
        assert_eq!(report.exposure("1S001").unwrap().background, BackgroundState::Estimated);
    }

    #[tokio::test]
    async fn test_timed_out_conversion_is_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ObservationScript::new(OBS)
            .with_mos(&["1S001"])
            .build()
            .on("converter", |_| {
                ScriptedOutput::empty()
                    .with_file("mos1S001_processed.h5", "partial")
                    .timed_out()
            });

        let (report, _) = run_with(dir.path(), runner, None).await;

        assert_eq!(report.failure_kind(), Some(FailureKind::TerminalVerification));
        assert!(!dir.path().join(OBS).join("mos1S001_processed.h5").exists());
        assert!(report
            .exposure("1S001")
            .unwrap()
            .notes
            .iter()
            .any(|n| n.contains("partial output removed")));
    }

    #[tokio::test]
    async fn test_proprietary_archive_is_fatal_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS).with_mos(&["1S001"]).with_proprietary_data();

        let (report, runner) = run(dir.path(), script).await;

        assert_eq!(report.failure_kind(), Some(FailureKind::FatalAcquisition));
        assert_eq!(runner.tool_sequence(), vec!["download"]);
        assert!(dir.path().join(OBS).join(format!("{OBS}.tar")).is_file());
        assert!(summary(&report).contains("is proprietary"));
    }

    #[tokio::test]
    async fn test_nested_archive_is_reconstructed() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS).with_pn(&["S003"]).with_nested_archive();

        let (report, _) = run(dir.path(), script).await;

        assert!(report.succeeded(), "{report}");
        assert!(summary(&report).contains("rebuilt odf/"));
    }

    #[tokio::test]
    async fn test_no_listings_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS).with_mos(&["1S001"]).without_listings();

        let (report, runner) = run(dir.path(), script).await;

        assert_eq!(report.failure_kind(), Some(FailureKind::FatalValidation));
        assert_eq!(report.last_stage(), Some(PipelineState::Discover));
        assert_eq!(runner.tool_sequence().last().map(String::as_str), Some("discovery"));
        assert!(summary(&report).contains("no science exposures"));
    }

    #[tokio::test]
    async fn test_all_exposures_dropped_is_recoverable_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS).with_mos(&["1S001"]).with_unfiltered("1S001");

        let (report, runner) = run(dir.path(), script).await;

        assert_eq!(report.failure_kind(), Some(FailureKind::RecoverableArtifactFailure));
        assert_eq!(report.last_stage(), Some(PipelineState::MaskPointSources));
        assert_eq!(runner.call_count("cheese"), 0);
        assert!(!dir.path().join(OBS).join("odf").exists());
        assert!(summary(&report).contains("all exposures dropped"));
    }

    #[tokio::test]
    async fn test_missing_conversion_output_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ObservationScript::new(OBS)
            .with_pn(&["S003"])
            .build()
            .on("converter", |_| ScriptedOutput::log("Traceback: conversion crashed\n"));

        let (report, _) = run_with(dir.path(), runner, None).await;

        assert_eq!(report.failure_kind(), Some(FailureKind::TerminalVerification));
        assert_eq!(report.last_stage(), Some(PipelineState::Verify));
        let text = summary(&report);
        assert!(text.contains("Converted output missing for S003 although extraction succeeded"));
        assert!(text.ends_with("Processing failed!\n"));
    }

    #[tokio::test]
    async fn test_failed_extraction_drops_exposure() {
        let dir = tempfile::tempdir().unwrap();
        let script = ObservationScript::new(OBS)
            .with_mos(&["1S001"])
            .with_pn(&["S003"])
            .with_failed_extraction("S003");

        let (report, runner) = run(dir.path(), script).await;

        assert!(report.succeeded());
        assert_eq!(report.active_prefixes(), vec!["1S001"]);
        assert_eq!(runner.call_count("pn_back"), 0);
        assert_eq!(runner.call_count("converter"), 1);
    }

    #[tokio::test]
    async fn test_odf_binding_follows_ingest() {
        let dir = tempfile::tempdir().unwrap();
        let (report, runner) = run(dir.path(), ObservationScript::new(OBS).with_mos(&["1S001"])).await;
        assert!(report.succeeded());

        let before = runner.last_environment("cifbuild").unwrap();
        assert!(before.get(SAS_ODF).unwrap().ends_with("odf"));
        assert!(before.get(SAS_CCF).unwrap().ends_with("ccf.cif"));

        let after = runner.last_environment("emchain").unwrap();
        assert!(after.get(SAS_ODF).unwrap().ends_with("SUM.SAS"));
    }

    #[tokio::test]
    async fn test_events_describe_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingEventSink::new());
        let script = ObservationScript::new(OBS)
            .with_mos(&["1S001", "2S001"])
            .with_unfiltered("2S001");

        let (report, runner) = run_with(dir.path(), script.build(), Some(sink.clone())).await;

        assert!(report.succeeded());
        let events = sink.events();
        assert_eq!(events.first().unwrap().event_type(), "stage.started");
        assert_eq!(events.last().unwrap().event_type(), "observation.finished");
        assert_eq!(sink.events_of_type("exposure.dropped").len(), 1);
        assert_eq!(sink.events_of_type("tool.invoked").len(), runner.invocations().len());
        assert_eq!(
            sink.events_of_type("stage.completed").len(),
            PipelineState::ALL.len()
        );
    }
}
