// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Whole runs against a simulated site

use super::{acme_settings, approving, request, stored_report};
use edge_provisioner::fakes::{
    acme_profile, operator_identity, seed_image, SimulatedSite,
};
use edge_provisioner::logging;
use edge_provisioner::naming;
use edge_provisioner::orchestrator::{AutoApprove, Orchestrator};
use edge_provisioner::poll::PollLimit;
use edge_provisioner::report::RunStatus;
use edge_provisioner::stage::{Mode, Stage, StageFilter};
use edge_provisioner::tools::VmState;
use edge_provisioner::ProvisionError;

fn stages(report: &edge_provisioner::report::RunReport) -> Vec<Stage> {
    report.stages.iter().map(|t| t.stage).collect()
}

#[tokio::test]
async fn acme_first_run_then_rerun() {
    let site = SimulatedSite::new();
    let (settings, _dir) = acme_settings();

    let outcome = approving(&site)
        .run(request(&settings, Mode::Provision, StageFilter::all()))
        .await;
    outcome.result.unwrap();
    assert_eq!(outcome.report.status, RunStatus::Success);
    assert_eq!(stages(&outcome.report), Stage::ALL);
    assert_eq!(outcome.report.profile, "Acme");

    let vms = site.vms();
    assert_eq!(vms.len(), 1);
    assert_eq!(vms["acme-ipc-01"], VmState::Running);
    assert!(site.has_group("ipc-acme-poc-tfstate-rg"));
    assert!(site.has_group("ipc-acme-poc-dev-rg"));
    assert_eq!(site.credential_resets(), 1);
    assert_eq!(site.kubelet_restarts(), 1);

    let stored = stored_report(&settings);
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.stages.len(), 7);

    let before = site.mutation_count();
    let outcome = approving(&site)
        .run(request(&settings, Mode::Provision, StageFilter::all()))
        .await;
    outcome.result.unwrap();
    assert_eq!(outcome.report.status, RunStatus::Success);
    assert_eq!(outcome.report.stages.len(), 7);
    assert_eq!(
        site.mutation_count(),
        before,
        "second run changed something: {:?}",
        &site.mutations()[before..]
    );
}

#[tokio::test]
async fn edge_only_run_touches_only_the_edge() {
    let site = SimulatedSite::new();
    let (settings, _dir) = acme_settings();
    let profile = acme_profile();
    seed_image(&settings, &profile);
    site.seed_group(&naming::workload_resource_group(
        &profile.prefix,
        &settings.environment,
    ));

    let outcome = approving(&site)
        .with_fallback_identity(Some(operator_identity()))
        .run(request(
            &settings,
            Mode::Provision,
            StageFilter::only([Stage::Edge]),
        ))
        .await;
    outcome.result.unwrap();
    assert_eq!(
        stages(&outcome.report),
        [Stage::Configuration, Stage::Preflight, Stage::Edge]
    );

    let foreign = [
        "create group",
        "create storage",
        "create container",
        "terraform",
        "create project",
        "create service",
        "reset credential",
        "create environment",
        "build image",
    ];
    for mutation in site.mutations() {
        assert!(
            !foreign.iter().any(|prefix| mutation.starts_with(prefix)),
            "edge run made a non-edge change: {mutation}"
        );
    }
    assert!(site.vms().contains_key("acme-ipc-01"));
}

#[tokio::test(start_paused = true)]
async fn silent_guest_fails_after_bounded_wait() {
    let site = SimulatedSite::new();
    site.set_guest_ready_after(None);
    let (settings, _dir) = acme_settings();

    let outcome = approving(&site)
        .run(request(&settings, Mode::Provision, StageFilter::all()))
        .await;
    let err = outcome.result.unwrap_err();
    assert!(
        matches!(
            err,
            ProvisionError::Timeout {
                attempts: 30,
                limit: PollLimit::Attempts(30),
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(site.pings(), 30);

    // Validation never ran, and the report still says what happened.
    let stored = stored_report(&settings);
    assert_eq!(stored.status, RunStatus::Failed);
    let last = stored.stages.last().unwrap();
    assert_eq!(last.stage, Stage::Edge);
    assert_eq!(last.status, RunStatus::Failed);
    assert!(stored.error.unwrap().contains("timed out"));
    assert_eq!(site.pod_queries(), 0);
}

#[tokio::test]
async fn image_alone_needs_credentials() {
    let site = SimulatedSite::new();
    let (settings, _dir) = acme_settings();

    let outcome = approving(&site)
        .run(request(
            &settings,
            Mode::Provision,
            StageFilter::only([Stage::Image]),
        ))
        .await;
    assert!(matches!(outcome.result, Err(ProvisionError::MissingCredentials)));
    assert_eq!(site.mutation_count(), 0);

    let outcome = approving(&site)
        .with_fallback_identity(Some(operator_identity()))
        .run(request(
            &settings,
            Mode::Provision,
            StageFilter::only([Stage::Image]),
        ))
        .await;
    outcome.result.unwrap();
    assert_eq!(site.mutations(), ["build image acme-ipc-01"]);
}

#[tokio::test]
async fn unresolvable_identity_is_reported() {
    let site = SimulatedSite::new();
    site.set_unresolvable_principals();
    let (settings, _dir) = acme_settings();

    let outcome = approving(&site)
        .run(request(&settings, Mode::Provision, StageFilter::all()))
        .await;
    assert!(matches!(
        outcome.result,
        Err(ProvisionError::IdentityResolution { .. })
    ));
    assert_eq!(site.kubelet_restarts(), 0);
    assert_eq!(stored_report(&settings).status, RunStatus::Failed);
}

#[tokio::test]
async fn unknown_profile_fails_in_configuration() {
    let site = SimulatedSite::new();
    let (settings, _dir) = acme_settings();
    let mut request = request(&settings, Mode::Provision, StageFilter::all());
    request.profile = "fabrikam".to_string();

    let outcome = approving(&site).run(request).await;
    assert!(matches!(outcome.result, Err(ProvisionError::Config(_))));
    let stored = stored_report(&settings);
    assert_eq!(stored.profile, "fabrikam");
    assert_eq!(stored.stages.len(), 1);
    assert_eq!(stored.stages[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn teardown_undoes_provisioning() {
    let site = SimulatedSite::new();
    let (settings, _dir) = acme_settings();
    approving(&site)
        .run(request(&settings, Mode::Provision, StageFilter::all()))
        .await
        .result
        .unwrap();

    let outcome = approving(&site)
        .run(request(&settings, Mode::Teardown, StageFilter::all()))
        .await;
    outcome.result.unwrap();
    assert_eq!(
        stages(&outcome.report),
        [
            Stage::Configuration,
            Stage::Preflight,
            Stage::Edge,
            Stage::Image,
            Stage::DevOps,
            Stage::Infrastructure,
        ]
    );
    assert!(site.vms().is_empty());
    assert!(!site.has_group("ipc-acme-poc-dev-rg"));
    assert!(site.has_group("ipc-acme-poc-tfstate-rg"));
    let artifact = naming::image_artifact(&settings.packer_dir, "acme-ipc-01");
    assert!(!artifact.exists());

    let before = site.mutation_count();
    approving(&site)
        .run(request(&settings, Mode::Teardown, StageFilter::all()))
        .await
        .result
        .unwrap();
    assert_eq!(site.mutation_count(), before);
}

#[tokio::test]
async fn full_run_after_partial_runs_rotates_the_secret() {
    let partial_runs = [
        vec![Stage::DevOps],
        vec![Stage::Infrastructure, Stage::DevOps],
    ];
    for partial in partial_runs {
        let site = SimulatedSite::new();
        let (settings, _dir) = acme_settings();

        approving(&site)
            .run(request(
                &settings,
                Mode::Provision,
                StageFilter::only(partial.clone()),
            ))
            .await
            .result
            .unwrap();
        assert_eq!(site.credential_resets(), 1);

        let outcome = approving(&site)
            .run(request(&settings, Mode::Provision, StageFilter::all()))
            .await;
        if let Err(err) = outcome.result {
            panic!("full run after {partial:?} failed: {err}");
        }
        assert_eq!(site.credential_resets(), 2, "after {partial:?}");
        assert_eq!(site.vms()["acme-ipc-01"], VmState::Running);

        // Once everything exists the secret is no longer needed.
        let before = site.mutation_count();
        approving(&site)
            .run(request(&settings, Mode::Provision, StageFilter::all()))
            .await
            .result
            .unwrap();
        assert_eq!(site.mutation_count(), before, "after {partial:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn rerun_after_edge_failure_connects_the_cluster() {
    let site = SimulatedSite::new();
    site.set_guest_ready_after(None);
    let (settings, _dir) = acme_settings();

    let outcome = approving(&site)
        .run(request(&settings, Mode::Provision, StageFilter::all()))
        .await;
    assert!(matches!(outcome.result, Err(ProvisionError::Timeout { .. })));
    let artifact = naming::image_artifact(&settings.packer_dir, "acme-ipc-01");
    assert!(artifact.exists());

    // The image is built but the cluster was never connected, so the
    // second run needs a fresh secret.
    site.set_guest_ready_after(Some(0));
    let outcome = approving(&site)
        .run(request(&settings, Mode::Provision, StageFilter::all()))
        .await;
    outcome.result.unwrap();
    assert_eq!(site.credential_resets(), 2);
    let builds = site
        .mutations()
        .iter()
        .filter(|m| m.starts_with("build image"))
        .count();
    assert_eq!(builds, 1);
}

#[tokio::test]
async fn missing_guest_password_is_reported_before_any_change() {
    let site = SimulatedSite::new();
    site.clear_guest_credential();
    let (settings, _dir) = acme_settings();

    let outcome = approving(&site)
        .run(request(&settings, Mode::Provision, StageFilter::all()))
        .await;
    assert!(matches!(
        outcome.result,
        Err(ProvisionError::MissingGuestCredential)
    ));
    assert_eq!(site.mutation_count(), 0);

    let stored = stored_report(&settings);
    assert_eq!(stored.status, RunStatus::Failed);
    assert!(stored.error.unwrap().contains("EDGE_GUEST_PASSWORD"));
    assert_eq!(stored.stages.last().unwrap().stage, Stage::Preflight);
}

#[tokio::test]
async fn log_file_records_the_failing_error() {
    let site = SimulatedSite::new();
    site.set_unreachable("management.azure.com");
    let (settings, _dir) = acme_settings();
    let (log, guard, path) =
        logging::init(&settings.log_dir(), false).unwrap();

    let mut orchestrator =
        Orchestrator::new(log.clone(), site.tools(), Box::new(AutoApprove));
    let outcome = orchestrator
        .run(request(&settings, Mode::Provision, StageFilter::all()))
        .await;
    assert!(matches!(
        outcome.result,
        Err(ProvisionError::Unreachable { .. })
    ));
    drop(orchestrator);
    drop(log);
    drop(guard);

    let contents = std::fs::read_to_string(&path).unwrap();
    let failures: Vec<&str> =
        contents.lines().filter(|l| l.contains("ERRO")).collect();
    assert_eq!(failures.len(), 2, "{contents}");
    for line in failures {
        assert!(line.contains("management.azure.com:443"), "{line}");
        assert!(line.contains("simulated outage"), "{line}");
    }
}
