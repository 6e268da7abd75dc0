// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::Layer;
use crate::context::RunContext;
use crate::error::{ProvisionError, ToolContext};
use crate::stage::Stage;
use async_trait::async_trait;
use slog::{debug, info, warn};
use std::time::Duration;

/// Endpoints every run depends on: sign-in, resource management and the
/// DevOps service.
pub const REQUIRED_ENDPOINTS: [&str; 3] =
    ["login.microsoftonline.com", "management.azure.com", "dev.azure.com"];

const PROBE_PORT: u16 = 443;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Checks that must pass before anything is changed: the guest can be
/// signed into if the run needs it, endpoints are reachable and the CLI
/// session targets the profile's subscription.
pub struct PreflightLayer;

impl PreflightLayer {
    async fn check(&self, ctx: &mut RunContext) -> Result<(), ProvisionError> {
        let uses_guest =
            ctx.provisions(Stage::Edge) || ctx.provisions(Stage::Validation);
        if uses_guest && !ctx.tools.guest.has_credential() {
            return Err(ProvisionError::MissingGuestCredential);
        }

        for host in REQUIRED_ENDPOINTS {
            ctx.tools
                .prober
                .probe(host, PROBE_PORT, PROBE_TIMEOUT)
                .await
                .map_err(|err| ProvisionError::Unreachable {
                    host: host.to_string(),
                    port: PROBE_PORT,
                    err,
                })?;
            debug!(ctx.log, "endpoint reachable"; "host" => host);
        }

        let expected = ctx.profile.subscription_id.clone();
        let account = ctx.account().await?;
        if account.subscription_id.eq_ignore_ascii_case(&expected) {
            info!(
                ctx.log,
                "subscription context OK";
                "subscription" => &expected,
            );
            return Ok(());
        }

        warn!(
            ctx.log,
            "switching subscription";
            "from" => &account.subscription_id,
            "to" => &expected,
        );
        ctx.tools
            .cloud
            .set_subscription(&expected)
            .await
            .with_tool_context(|| {
                format!("switching to subscription {expected}")
            })?;
        ctx.forget_account();
        let account = ctx.account().await?;
        if !account.subscription_id.eq_ignore_ascii_case(&expected) {
            return Err(ProvisionError::SubscriptionMismatch {
                expected,
                actual: account.subscription_id,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Layer for PreflightLayer {
    fn stage(&self) -> Stage {
        Stage::Preflight
    }

    async fn provision(
        &self,
        ctx: &mut RunContext,
    ) -> Result<(), ProvisionError> {
        self.check(ctx).await
    }

    async fn teardown(
        &self,
        ctx: &mut RunContext,
    ) -> Result<(), ProvisionError> {
        self.check(ctx).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::{test_context, SimulatedSite};
    use crate::stage::Mode;

    #[tokio::test]
    async fn unreachable_endpoint_is_named() {
        let site = SimulatedSite::new();
        site.set_unreachable("management.azure.com");
        let (mut ctx, _dir) = test_context(&site);

        let err = PreflightLayer.provision(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Unreachable { ref host, port: 443, .. }
                if host == "management.azure.com"
        ));
        assert_eq!(site.mutation_count(), 0);
    }

    #[tokio::test]
    async fn wrong_subscription_is_switched() {
        let site = SimulatedSite::new();
        site.set_active_subscription("some-other-subscription");
        let (mut ctx, _dir) = test_context(&site);

        PreflightLayer.provision(&mut ctx).await.unwrap();
        assert_eq!(
            ctx.account().await.unwrap().subscription_id,
            ctx.profile.subscription_id
        );
    }

    #[tokio::test]
    async fn subscription_that_will_not_switch_is_reported() {
        let site = SimulatedSite::new();
        site.set_active_subscription("some-other-subscription");
        site.set_subscription_sticky();
        let (mut ctx, _dir) = test_context(&site);

        let err = PreflightLayer.provision(&mut ctx).await.unwrap_err();
        assert!(
            matches!(
                err,
                ProvisionError::SubscriptionMismatch { ref actual, .. }
                    if actual == "some-other-subscription"
            ),
            "{err}"
        );
    }

    #[tokio::test]
    async fn guest_password_is_required_only_for_guest_stages() {
        let site = SimulatedSite::new();
        site.clear_guest_credential();

        let (ctx, _dir) = test_context(&site);
        let mut ctx = ctx.with_plan(
            Mode::Provision,
            vec![Stage::Preflight, Stage::Infrastructure],
        );
        PreflightLayer.provision(&mut ctx).await.unwrap();

        let (ctx, _dir) = test_context(&site);
        let mut ctx =
            ctx.with_plan(Mode::Provision, vec![Stage::Preflight, Stage::Edge]);
        let err = PreflightLayer.provision(&mut ctx).await.unwrap_err();
        assert!(matches!(err, ProvisionError::MissingGuestCredential));
        assert!(err.to_string().contains("EDGE_GUEST_PASSWORD"));

        // Tearing the edge down never signs into the guest.
        let (ctx, _dir) = test_context(&site);
        let mut ctx =
            ctx.with_plan(Mode::Teardown, vec![Stage::Preflight, Stage::Edge]);
        PreflightLayer.teardown(&mut ctx).await.unwrap();
    }
}
