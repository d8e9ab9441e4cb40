use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use defsync_core::ChangeSummary;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::reconcile::Reconciliation;

/// Tri-state run outcome, derived from the summary alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    NoChanges,
    ChangesDetected,
    Error,
}

impl DriftStatus {
    pub fn from_summary(summary: &ChangeSummary) -> Self {
        if !summary.errors.is_empty() {
            Self::Error
        } else if summary.has_drift() {
            Self::ChangesDetected
        } else {
            Self::NoChanges
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Self::NoChanges => 0,
            Self::ChangesDetected => 1,
            Self::Error => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub status: DriftStatus,
    pub exit_code: i32,
    pub pipeline_version: u32,
    /// Upstream commit observed per source.
    pub revisions: BTreeMap<String, String>,
    pub summary: ChangeSummary,
    pub reconciliation: BTreeMap<String, Reconciliation>,
}

impl DriftReport {
    pub fn new(
        run_id: Uuid,
        generated_at: DateTime<Utc>,
        pipeline_version: u32,
        revisions: BTreeMap<String, String>,
        summary: ChangeSummary,
        reconciliation: BTreeMap<String, Reconciliation>,
    ) -> Self {
        let status = DriftStatus::from_summary(&summary);
        Self {
            run_id,
            generated_at,
            status,
            exit_code: status.exit_code(),
            pipeline_version,
            revisions,
            summary,
            reconciliation,
        }
    }

    pub fn conflicts(&self) -> impl Iterator<Item = (&String, &Reconciliation)> {
        self.reconciliation.iter().filter(|(_, r)| r.is_conflict())
    }
}

fn bullet_list(out: &mut String, title: &str, items: &[String]) {
    let _ = writeln!(out, "\n## {title} ({})", items.len());
    if items.is_empty() {
        out.push_str("- none\n");
    }
    for item in items {
        let _ = writeln!(out, "- `{item}`");
    }
}

pub fn render_brief(report: &DriftReport) -> String {
    let summary = &report.summary;
    let mut out = String::new();
    let _ = writeln!(out, "# Upstream Drift Brief\n");
    let _ = writeln!(out, "- Run ID: `{}`", report.run_id);
    let _ = writeln!(out, "- Generated: {}", report.generated_at);
    let _ = writeln!(out, "- Status: {:?} (exit {})", report.status, report.exit_code);
    let _ = writeln!(
        out,
        "- Pipeline version: {} (changed: {})",
        report.pipeline_version, summary.pipeline_version_changed
    );
    for (source, revision) in &report.revisions {
        let _ = writeln!(out, "- Source `{source}` at `{revision}`");
    }

    bullet_list(&mut out, "Hash changes", &summary.hash_changes);
    bullet_list(&mut out, "New upstream", &summary.new_upstream);
    bullet_list(&mut out, "Deletions", &summary.deletions);
    bullet_list(&mut out, "Skipped", &summary.skipped);

    let _ = writeln!(out, "\n## Errors ({})", summary.errors.len());
    for err in &summary.errors {
        let _ = writeln!(
            out,
            "- `{}` {:?}{}: {}",
            err.key,
            err.kind,
            err.path.as_deref().map(|p| format!(" at `{p}`")).unwrap_or_default(),
            err.message
        );
    }

    let mut conflicts = report.conflicts().peekable();
    if conflicts.peek().is_some() {
        out.push_str("\n## Conflicts needing review\n");
        for (key, rec) in conflicts {
            if let Reconciliation::Conflict { conflicts, .. } = rec {
                for c in conflicts {
                    let _ = writeln!(
                        out,
                        "- `{key}` field `{}`: override ({}) vs upstream {}",
                        c.field,
                        c.override_reason,
                        c.upstream_value
                            .as_ref()
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "<removed>".to_string())
                    );
                }
            }
        }
    }
    out
}

/// Writes `drift_report.json` and `drift_brief.md` under `<dir>/<run_id>/`.
pub async fn write_reports(dir: &Path, report: &DriftReport) -> Result<PathBuf> {
    let run_dir = dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing drift report")?;
    fs::write(run_dir.join("drift_report.json"), json)
        .await
        .context("writing drift_report.json")?;
    fs::write(run_dir.join("drift_brief.md"), render_brief(report))
        .await
        .context("writing drift_brief.md")?;

    Ok(run_dir)
}
