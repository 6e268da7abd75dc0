// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::Layer;
use crate::context::RunContext;
use crate::error::ProvisionError;
use crate::poll::{wait_for_condition, CondCheckError, PollLimit};
use crate::stage::Stage;
use crate::tools::Guest;
use async_trait::async_trait;
use slog::{debug, info};

/// Waits for the GitOps-delivered workloads to come up.
pub struct ValidationLayer;

#[async_trait]
impl Layer for ValidationLayer {
    fn stage(&self) -> Stage {
        Stage::Validation
    }

    async fn provision(
        &self,
        ctx: &mut RunContext,
    ) -> Result<(), ProvisionError> {
        let guest: &dyn Guest = ctx.tools.guest.as_ref();
        let vm = ctx.profile.vm_name.as_str();
        let namespace = ctx.settings.workload_namespace.as_str();
        let expected = ctx.settings.expected_pods;
        let polling = &ctx.settings.polling;
        let log = &ctx.log;

        // Failures to count are retried like a low count.
        let running = wait_for_condition(
            || async move {
                match guest.running_pods(vm, namespace).await {
                    Ok(count) if count >= expected => Ok(count),
                    Ok(count) => {
                        info!(
                            log,
                            "waiting for workloads";
                            "running" => count,
                            "expected" => expected,
                        );
                        Err(CondCheckError::<ProvisionError>::NotYet)
                    }
                    Err(err) => {
                        debug!(log, "could not count pods"; "error" => %err);
                        Err(CondCheckError::NotYet)
                    }
                }
            },
            polling.pods_interval,
            PollLimit::Elapsed(polling.pods_budget),
        )
        .await
        .map_err(|err| {
            ProvisionError::timeout(
                format!("{expected} running pods in {namespace}"),
                err,
            )
        })?;
        info!(
            ctx.log,
            "workloads running";
            "namespace" => namespace,
            "running" => running,
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::{test_context, SimulatedSite};
    use crate::tools::VmState;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn short_of_pods_times_out_on_budget() {
        let site = SimulatedSite::new();
        site.set_running_pods(3);
        let (mut ctx, _dir) = test_context(&site);
        site.add_vm(&ctx.profile.vm_name, VmState::Running);
        site.set_deployed(&ctx.profile.vm_name);

        let err = ValidationLayer.provision(&mut ctx).await.unwrap_err();
        match err {
            ProvisionError::Timeout { limit, elapsed, .. } => {
                assert_eq!(limit, PollLimit::Elapsed(Duration::from_secs(600)));
                assert!(elapsed >= Duration::from_secs(600));
            }
            other => panic!("unexpected error: {other}"),
        }
        // A check every 15 seconds from 0 through 600.
        assert_eq!(site.pod_queries(), 41);
    }

    #[tokio::test]
    async fn enough_pods_pass() {
        let site = SimulatedSite::new();
        let (mut ctx, _dir) = test_context(&site);
        site.add_vm(&ctx.profile.vm_name, VmState::Running);
        site.set_deployed(&ctx.profile.vm_name);

        ValidationLayer.provision(&mut ctx).await.unwrap();
        assert_eq!(site.pod_queries(), 1);
        assert_eq!(site.mutation_count(), 0);
    }
}
