// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The machine-readable record of a run

use crate::stage::{Mode, Stage};
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slog_error_chain::InlineErrorChain;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            RunStatus::Success
        } else {
            RunStatus::Failed
        }
    }
}

/// How long one stage took.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub seconds: f64,
    pub status: RunStatus,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RunReport {
    /// The requested name, replaced by the profile's own once loaded.
    pub profile: String,
    pub environment: String,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub total_seconds: f64,
    /// Only stages that actually started, in the order they ran.
    pub stages: Vec<StageTiming>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn new(profile: &str, environment: &str, mode: Mode) -> Self {
        Self {
            profile: profile.to_string(),
            environment: environment.to_string(),
            mode,
            started_at: Utc::now(),
            status: RunStatus::Success,
            total_seconds: 0.0,
            stages: Vec::new(),
            error: None,
        }
    }

    pub fn record(&mut self, stage: Stage, seconds: f64, status: RunStatus) {
        self.stages.push(StageTiming { stage, seconds, status });
    }

    /// Marks the run failed, keeping the full chain of causes.
    pub fn fail(&mut self, err: &(dyn std::error::Error + 'static)) {
        self.status = RunStatus::Failed;
        self.error = Some(InlineErrorChain::new(err).to_string());
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("report is serializable")
    }

    /// Writes the report, creating its directory if needed.
    pub async fn write(&self, path: &Utf8Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs_err::tokio::create_dir_all(parent).await?;
        }
        fs_err::tokio::write(path, self.to_json()).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn failure_keeps_cause_chain() {
        let mut report = RunReport::new("Acme", "dev", Mode::Provision);
        report.fail(&Outer(std::io::Error::other("inner")));
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("outer: inner"));
    }

    #[tokio::test]
    async fn written_report_reads_back() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("run-metrics.json");

        let mut report = RunReport::new("Acme", "dev", Mode::Teardown);
        report.record(Stage::Configuration, 0.01, RunStatus::Success);
        report.record(Stage::Preflight, 1.5, RunStatus::Success);
        report.total_seconds = 1.51;
        report.write(&path).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["mode"], "teardown");
        assert_eq!(value["status"], "Success");
        assert_eq!(value["stages"][1]["stage"], "preflight");
        assert_eq!(value["error"], serde_json::Value::Null);

        let parsed: RunReport = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.started_at, report.started_at);
        assert_eq!(parsed.stages.len(), 2);
    }
}
