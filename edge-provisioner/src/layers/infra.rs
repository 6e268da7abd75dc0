// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::Layer;
use crate::context::RunContext;
use crate::error::{ProvisionError, ToolContext};
use crate::naming;
use crate::stage::Stage;
use crate::tools::{PlanKind, PlanOutcome, StateBackend, TerraformInputs};
use async_trait::async_trait;
use slog::{info, warn};

/// The remote state backend and the terraform-managed workload resources.
pub struct InfraLayer;

fn state_backend(ctx: &RunContext) -> StateBackend {
    StateBackend {
        resource_group: naming::state_resource_group(&ctx.profile.prefix),
        storage_account: naming::state_storage_account(&ctx.profile.prefix),
        container: naming::STATE_CONTAINER.to_string(),
        key: naming::state_key(&ctx.settings.environment),
    }
}

fn inputs(ctx: &RunContext) -> TerraformInputs {
    TerraformInputs {
        subscription_id: ctx.profile.subscription_id.clone(),
        backend: state_backend(ctx),
        prefix: ctx.profile.prefix.clone(),
        location: ctx.profile.location.clone(),
        environment: ctx.settings.environment.clone(),
    }
}

impl InfraLayer {
    async fn ensure_backend(
        &self,
        ctx: &RunContext,
        backend: &StateBackend,
    ) -> Result<(), ProvisionError> {
        let cloud = &ctx.tools.cloud;
        let location = &ctx.profile.location;

        let group = &backend.resource_group;
        let exists = cloud
            .group_exists(group)
            .await
            .tool_context("checking state group")?;
        if exists {
            info!(ctx.log, "state resource group exists"; "name" => group);
        } else {
            cloud
                .create_group(group, location)
                .await
                .with_tool_context(|| {
                    format!("creating resource group {group}")
                })?;
            info!(ctx.log, "created state resource group"; "name" => group);
        }

        let account = &backend.storage_account;
        if cloud
            .storage_account_exists(group, account)
            .await
            .tool_context("checking state storage account")?
        {
            info!(ctx.log, "state storage account exists"; "name" => account);
        } else {
            cloud
                .create_storage_account(group, account, location)
                .await
                .with_tool_context(|| {
                    format!("creating storage account {account}")
                })?;
            info!(ctx.log, "created state storage account"; "name" => account);
        }

        let container = &backend.container;
        if cloud
            .container_exists(account, container)
            .await
            .tool_context("checking state container")?
        {
            info!(ctx.log, "state container exists"; "name" => container);
        } else {
            cloud
                .create_container(account, container)
                .await
                .with_tool_context(|| {
                    format!("creating container {container}")
                })?;
            info!(ctx.log, "created state container"; "name" => container);
        }
        Ok(())
    }

    /// Whether every piece of the backend is present, without changing
    /// anything.
    async fn backend_present(
        &self,
        ctx: &RunContext,
        backend: &StateBackend,
    ) -> Result<bool, ProvisionError> {
        let cloud = &ctx.tools.cloud;
        let present = cloud
            .group_exists(&backend.resource_group)
            .await
            .tool_context("checking state group")?
            && cloud
                .storage_account_exists(
                    &backend.resource_group,
                    &backend.storage_account,
                )
                .await
                .tool_context("checking state storage account")?
            && cloud
                .container_exists(&backend.storage_account, &backend.container)
                .await
                .tool_context("checking state container")?;
        Ok(present)
    }

    async fn converge(
        &self,
        ctx: &RunContext,
        inputs: &TerraformInputs,
        kind: PlanKind,
    ) -> Result<(), ProvisionError> {
        let terraform = &ctx.tools.terraform;
        terraform.init(inputs).await.tool_context("terraform init")?;
        let plan =
            terraform.plan(inputs, kind).await.tool_context("terraform plan")?;
        match plan {
            PlanOutcome::NoChanges => {
                info!(ctx.log, "terraform reports no changes"; "plan" => ?kind);
            }
            PlanOutcome::Changes => {
                info!(ctx.log, "applying terraform plan"; "plan" => ?kind);
                terraform.apply(inputs).await.tool_context("terraform apply")?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Layer for InfraLayer {
    fn stage(&self) -> Stage {
        Stage::Infrastructure
    }

    async fn provision(
        &self,
        ctx: &mut RunContext,
    ) -> Result<(), ProvisionError> {
        let inputs = inputs(ctx);
        self.ensure_backend(ctx, &inputs.backend).await?;
        self.converge(ctx, &inputs, PlanKind::Apply).await
    }

    /// Destroys the terraform-managed resources. The state backend is kept,
    /// since it holds the record of what was destroyed.
    async fn teardown(
        &self,
        ctx: &mut RunContext,
    ) -> Result<(), ProvisionError> {
        let inputs = inputs(ctx);
        if !self.backend_present(ctx, &inputs.backend).await? {
            warn!(
                ctx.log,
                "no terraform state backend; nothing to destroy";
                "storage_account" => &inputs.backend.storage_account,
            );
            return Ok(());
        }
        self.converge(ctx, &inputs, PlanKind::Destroy).await
    }
}
