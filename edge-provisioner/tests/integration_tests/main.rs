// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod gate;
mod runs;

use camino_tempfile::Utf8TempDir;
use edge_provisioner::config::Settings;
use edge_provisioner::context::Tools;
use edge_provisioner::fakes::{store_acme_profile, test_settings, SimulatedSite};
use edge_provisioner::orchestrator::{
    AutoApprove, ConfirmationGate, LinePrompt, Orchestrator, RunRequest,
};
use edge_provisioner::report::RunReport;
use edge_provisioner::stage::{Mode, StageFilter};
use std::io::Cursor;
use std::sync::Arc;

/// Settings for a site with the Acme profile on disk.
pub fn acme_settings() -> (Settings, Utf8TempDir) {
    let (settings, dir) = test_settings();
    store_acme_profile(&settings);
    (settings, dir)
}

pub fn orchestrator(
    site: &Arc<SimulatedSite>,
    gate: Box<dyn ConfirmationGate>,
) -> Orchestrator {
    let log = slog::Logger::root(slog::Discard, slog::o!());
    let tools: Tools = site.tools();
    Orchestrator::new(log, tools, gate)
}

pub fn approving(site: &Arc<SimulatedSite>) -> Orchestrator {
    orchestrator(site, Box::new(AutoApprove))
}

/// An orchestrator whose operator types `answer`.
pub fn answering(site: &Arc<SimulatedSite>, answer: &str) -> Orchestrator {
    let gate = LinePrompt::new(Cursor::new(answer.to_string()), Vec::new());
    orchestrator(site, Box::new(gate))
}

pub fn request(
    settings: &Settings,
    mode: Mode,
    filter: StageFilter,
) -> RunRequest {
    RunRequest {
        profile: "Acme".to_string(),
        mode,
        filter,
        settings: settings.clone(),
    }
}

/// The report as written to disk.
pub fn stored_report(settings: &Settings) -> RunReport {
    let text = std::fs::read_to_string(settings.metrics_path())
        .expect("run report was written");
    serde_json::from_str(&text).expect("run report parses")
}
