// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests for the confirmation required before a run changes anything

use super::{acme_settings, answering, request, stored_report};
use edge_provisioner::fakes::SimulatedSite;
use edge_provisioner::report::RunStatus;
use edge_provisioner::stage::{Mode, Stage, StageFilter};
use edge_provisioner::ProvisionError;

#[tokio::test]
async fn wrong_answer_aborts_before_any_change() {
    for answer in ["yes\n", "Y\n", "YES!\n", " YES\n", "DESTROY\n", ""] {
        let site = SimulatedSite::new();
        let (settings, _dir) = acme_settings();

        let outcome = answering(&site, answer)
            .run(request(&settings, Mode::Provision, StageFilter::all()))
            .await;
        assert!(
            matches!(outcome.result, Err(ProvisionError::Aborted)),
            "{answer:?} did not abort"
        );
        assert_eq!(site.mutation_count(), 0, "{answer:?}");

        let report = stored_report(&settings);
        assert_eq!(report.status, RunStatus::Failed);
        let stages: Vec<Stage> =
            report.stages.iter().map(|t| t.stage).collect();
        assert_eq!(stages, [Stage::Configuration]);
    }
}

#[tokio::test]
async fn exact_answer_proceeds() {
    let site = SimulatedSite::new();
    let (settings, _dir) = acme_settings();

    let outcome = answering(&site, "YES\n")
        .run(request(
            &settings,
            Mode::Provision,
            StageFilter::only([Stage::Infrastructure]),
        ))
        .await;
    outcome.result.unwrap();
    assert!(site.mutation_count() > 0);
    assert!(site.has_group("ipc-acme-poc-dev-rg"));
}

#[tokio::test]
async fn teardown_wants_destroy() {
    let site = SimulatedSite::new();
    let (settings, _dir) = acme_settings();

    let outcome = answering(&site, "YES\n")
        .run(request(&settings, Mode::Teardown, StageFilter::all()))
        .await;
    assert!(matches!(outcome.result, Err(ProvisionError::Aborted)));

    let outcome = answering(&site, "DESTROY\r\n")
        .run(request(&settings, Mode::Teardown, StageFilter::all()))
        .await;
    outcome.result.unwrap();
    assert_eq!(site.mutation_count(), 0);
}
