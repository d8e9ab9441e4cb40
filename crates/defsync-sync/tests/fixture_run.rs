use std::path::{Path, PathBuf};

use defsync_sync::{
    load_manifest, run_detect, DetectConfig, DriftReport, DriftStatus, FixtureOverride,
    Reconciliation,
};

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn offline_config(reports_dir: &Path) -> DetectConfig {
    let mut config = DetectConfig::from_env();
    config.manifest_path = fixtures().join("upstream-manifest.json");
    config.sources_file = Some(fixtures().join("sources.yaml"));
    config.reports_dir = reports_dir.to_path_buf();
    config.pipeline_version = 1;
    config
}

#[tokio::test]
async fn checked_in_manifest_passes_validation() {
    let manifest = load_manifest(&fixtures().join("upstream-manifest.json"))
        .await
        .unwrap();
    assert_eq!(manifest.definitions.len(), 5);
    assert!(manifest.definitions["skills/gamma"].has_wildcard_override());
}

#[tokio::test]
async fn offline_run_against_fixture_tree() {
    let reports = tempfile::tempdir().unwrap();
    let config = offline_config(reports.path());
    let fixture = FixtureOverride {
        dir: fixtures().join("upstream"),
        source_id: None,
    };

    let (report, dir) = run_detect(&config, Some(&fixture)).await.unwrap();
    let s = &report.summary;
    assert_eq!(s.hash_changes, vec!["agents/review/beta"]);
    assert_eq!(s.new_upstream, vec!["commands/triage"]);
    assert_eq!(s.new_upstream_files["commands/triage"], vec!["triage.md"]);
    assert_eq!(s.deletions, vec!["commands/retired"]);
    assert_eq!(s.skipped, vec!["skills/gamma"]);
    assert!(s.errors.is_empty());
    assert_eq!(report.status, DriftStatus::ChangesDetected);

    match &report.reconciliation["agents/review/beta"] {
        Reconciliation::Conflict { conflicts, .. } => {
            assert_eq!(conflicts[0].field, "description");
            assert_eq!(conflicts[0].override_reason, "tuned for our review checklist");
        }
        other => panic!("unexpected {other:?}"),
    }

    let written: DriftReport = serde_json::from_slice(
        &std::fs::read(dir.join("drift_report.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(written, report);
    assert!(dir.join("drift_brief.md").exists());
}
