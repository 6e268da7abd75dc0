// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::image::exists;
use super::Layer;
use crate::context::RunContext;
use crate::error::{ProvisionError, ToolContext};
use crate::identity::CREDENTIAL_LIFETIME_DAYS;
use crate::naming;
use crate::stage::Stage;
use crate::tools::ServiceConnectionSpec;
use async_trait::async_trait;
use chrono::Utc;
use slog::{debug, info};

/// The DevOps project, the automation identity, the service connection
/// that deploys as that identity, and the deployment environments.
pub struct DevOpsLayer;

fn credential_end_date() -> String {
    (Utc::now() + chrono::Duration::days(CREDENTIAL_LIFETIME_DAYS))
        .format("%Y-%m-%d")
        .to_string()
}

impl DevOpsLayer {
    /// Whether a later stage of this run will use the automation secret.
    ///
    /// The secret is only known right after a reset, so an identity that
    /// already exists has to be rotated when the image still has to be
    /// built or the cluster still has to be connected. Otherwise the
    /// existing binding is left alone.
    async fn secret_needed(
        &self,
        ctx: &RunContext,
    ) -> Result<bool, ProvisionError> {
        if ctx.has_identity() {
            return Ok(false);
        }
        if ctx.provisions(Stage::Image) {
            let artifact = naming::image_artifact(
                &ctx.settings.packer_dir,
                &ctx.profile.vm_name,
            );
            if !exists(&artifact).await? {
                debug!(ctx.log, "image build will need the secret");
                return Ok(true);
            }
        }
        if ctx.provisions(Stage::Edge) {
            let cloud = &ctx.tools.cloud;
            let group = ctx.workload_resource_group();
            let cluster = ctx.connected_cluster();
            let connected = cloud
                .group_exists(&group)
                .await
                .tool_context("checking workload resource group")?
                && cloud
                    .connected_cluster(&group, &cluster)
                    .await
                    .with_tool_context(|| {
                        format!("looking up cluster {cluster}")
                    })?
                    .is_some();
            if !connected {
                debug!(ctx.log, "cluster connection will need the secret");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn ensure_project(
        &self,
        ctx: &RunContext,
        project: &str,
    ) -> Result<(), ProvisionError> {
        let projects = ctx
            .tools
            .devops
            .projects()
            .await
            .tool_context("listing DevOps projects")?;
        if projects.iter().any(|p| p.eq_ignore_ascii_case(project)) {
            info!(ctx.log, "DevOps project exists"; "project" => project);
            return Ok(());
        }
        ctx.tools
            .devops
            .create_project(project)
            .await
            .with_tool_context(|| {
                format!("creating DevOps project {project}")
            })?;
        info!(ctx.log, "created DevOps project"; "project" => project);
        Ok(())
    }

    /// Makes sure the service connection authenticates as the automation
    /// identity, rotating the identity's secret when the connection has to
    /// be (re)created.
    async fn ensure_connection(
        &self,
        ctx: &mut RunContext,
        project: &str,
    ) -> Result<(), ProvisionError> {
        let prefix = &ctx.profile.prefix;
        let sp_name = naming::automation_identity(prefix);
        let conn_name = naming::service_connection(prefix);
        let cloud = ctx.tools.cloud.clone();
        let devops = ctx.tools.devops.clone();

        let app_id = cloud
            .service_principal(&sp_name)
            .await
            .with_tool_context(|| format!("looking up {sp_name}"))?;
        let connection = devops
            .service_connection(project, &conn_name)
            .await
            .with_tool_context(|| format!("looking up {conn_name}"))?;

        if let (Some(app_id), Some(connection)) = (&app_id, &connection) {
            let bound = connection.app_id.as_deref() == Some(app_id.as_str());
            if bound && !self.secret_needed(ctx).await? {
                info!(
                    ctx.log,
                    "service connection already bound to automation identity";
                    "connection" => &conn_name,
                    "app_id" => app_id,
                );
                return Ok(());
            }
        }

        let app_id = match app_id {
            Some(app_id) => app_id,
            None => {
                let scope =
                    format!("/subscriptions/{}", ctx.profile.subscription_id);
                let app_id = cloud
                    .create_service_principal(&sp_name, &scope)
                    .await
                    .with_tool_context(|| format!("creating {sp_name}"))?;
                info!(
                    ctx.log,
                    "created automation identity";
                    "name" => &sp_name,
                    "app_id" => &app_id,
                );
                app_id
            }
        };

        // The secret can only be read when it is reset, and resetting it
        // invalidates the one the connection holds.
        let identity = cloud
            .reset_credential(&app_id, &credential_end_date())
            .await
            .with_tool_context(|| {
                format!("rotating credential of {sp_name}")
            })?;
        info!(ctx.log, "rotated automation credential"; "app_id" => &app_id);

        // Updating a connection in place does not reliably replace its
        // credential.
        if let Some(existing) = connection {
            devops
                .delete_service_connection(project, &existing.id)
                .await
                .with_tool_context(|| format!("deleting {conn_name}"))?;
            info!(
                ctx.log,
                "deleted service connection holding old secret";
                "id" => existing.id,
            );
        }

        let spec = ServiceConnectionSpec {
            name: conn_name.clone(),
            subscription_id: ctx.profile.subscription_id.clone(),
            subscription_name: ctx.profile.name.clone(),
        };
        devops
            .create_service_connection(project, &spec, &identity)
            .await
            .with_tool_context(|| format!("creating {conn_name}"))?;
        info!(
            ctx.log,
            "created service connection";
            "connection" => &conn_name,
        );

        ctx.set_identity(identity);
        Ok(())
    }

    async fn ensure_environments(
        &self,
        ctx: &RunContext,
        project: &str,
    ) -> Result<(), ProvisionError> {
        let existing = ctx
            .tools
            .devops
            .environments(project)
            .await
            .tool_context("listing deployment environments")?;
        for name in naming::DEPLOYMENT_ENVIRONMENTS {
            if existing.iter().any(|e| e.eq_ignore_ascii_case(name)) {
                continue;
            }
            ctx.tools
                .devops
                .create_environment(project, name)
                .await
                .with_tool_context(|| {
                    format!("creating environment {name}")
                })?;
            info!(ctx.log, "created deployment environment"; "name" => name);
        }
        Ok(())
    }
}

#[async_trait]
impl Layer for DevOpsLayer {
    fn stage(&self) -> Stage {
        Stage::DevOps
    }

    async fn provision(
        &self,
        ctx: &mut RunContext,
    ) -> Result<(), ProvisionError> {
        let project = ctx.profile.name.clone();
        self.ensure_project(ctx, &project).await?;
        self.ensure_connection(ctx, &project).await?;
        self.ensure_environments(ctx, &project).await
    }

    /// Removes the service connection and the automation identity. The
    /// project and its environments hold history and are left alone.
    async fn teardown(
        &self,
        ctx: &mut RunContext,
    ) -> Result<(), ProvisionError> {
        let project = ctx.profile.name.clone();
        let prefix = &ctx.profile.prefix;
        let sp_name = naming::automation_identity(prefix);
        let conn_name = naming::service_connection(prefix);

        let projects = ctx
            .tools
            .devops
            .projects()
            .await
            .tool_context("listing DevOps projects")?;
        if projects.iter().any(|p| p.eq_ignore_ascii_case(&project)) {
            let connection = ctx
                .tools
                .devops
                .service_connection(&project, &conn_name)
                .await
                .with_tool_context(|| format!("looking up {conn_name}"))?;
            if let Some(connection) = connection {
                ctx.tools
                    .devops
                    .delete_service_connection(&project, &connection.id)
                    .await
                    .with_tool_context(|| format!("deleting {conn_name}"))?;
                info!(
                    ctx.log,
                    "deleted service connection";
                    "connection" => &conn_name,
                );
            }
        }

        let app_id = ctx
            .tools
            .cloud
            .service_principal(&sp_name)
            .await
            .with_tool_context(|| format!("looking up {sp_name}"))?;
        if let Some(app_id) = app_id {
            ctx.tools
                .cloud
                .delete_service_principal(&app_id)
                .await
                .with_tool_context(|| format!("deleting {sp_name}"))?;
            info!(ctx.log, "deleted automation identity"; "name" => &sp_name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::{operator_identity, test_context, SimulatedSite};
    use crate::stage::Mode;
    use crate::tools::Cloud;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_run_creates_everything_and_sets_identity() {
        let site = SimulatedSite::new();
        let (mut ctx, _dir) = test_context(&site);
        assert!(ctx.identity().is_none());

        DevOpsLayer.provision(&mut ctx).await.unwrap();
        assert_eq!(site.credential_resets(), 1);
        assert_eq!(
            site.project_environments("Acme").into_iter().collect::<Vec<_>>(),
            ["Alpha", "Beta", "Dev", "Prod"]
        );
        let identity = ctx.identity().unwrap();
        assert!(!identity.expose_secret().is_empty());
    }

    #[tokio::test]
    async fn bound_connection_is_not_rotated() {
        let site = SimulatedSite::new();
        let (mut ctx, _dir) = test_context(&site);
        DevOpsLayer.provision(&mut ctx).await.unwrap();
        let before = site.mutation_count();

        let (mut ctx, _dir) = test_context(&site);
        DevOpsLayer.provision(&mut ctx).await.unwrap();
        assert_eq!(site.mutation_count(), before);
        assert_eq!(site.credential_resets(), 1);
        assert!(ctx.identity().is_none());
    }

    #[tokio::test]
    async fn bound_connection_is_rotated_when_the_image_needs_the_secret() {
        let site = SimulatedSite::new();
        let (mut ctx, _dir) = test_context(&site);
        DevOpsLayer.provision(&mut ctx).await.unwrap();
        let before = site.mutation_count();

        let (ctx, _dir) = test_context(&site);
        let mut ctx = ctx.with_plan(
            Mode::Provision,
            vec![Stage::DevOps, Stage::Image, Stage::Edge],
        );
        DevOpsLayer.provision(&mut ctx).await.unwrap();
        assert_eq!(site.credential_resets(), 2);
        assert!(ctx.identity().is_some());

        let mutations = &site.mutations()[before..];
        assert_eq!(mutations.len(), 3, "{mutations:?}");
        assert!(mutations[0].starts_with("reset credential"));
        assert!(mutations[1].starts_with("delete service connection"));
        assert_eq!(
            mutations[2],
            "create service connection ipc-acme-poc-azure"
        );
    }

    #[tokio::test]
    async fn operator_identity_spares_the_rotation() {
        let site = SimulatedSite::new();
        let (mut ctx, _dir) = test_context(&site);
        DevOpsLayer.provision(&mut ctx).await.unwrap();
        let before = site.mutation_count();

        let (ctx, _dir) = test_context(&site);
        let mut ctx = ctx
            .with_plan(Mode::Provision, vec![Stage::DevOps, Stage::Image])
            .with_fallback_identity(Some(Arc::new(operator_identity())));
        DevOpsLayer.provision(&mut ctx).await.unwrap();
        assert_eq!(site.mutation_count(), before);
    }

    #[tokio::test]
    async fn connection_to_a_deleted_identity_is_replaced() {
        let site = SimulatedSite::new();
        let (mut ctx, _dir) = test_context(&site);
        DevOpsLayer.provision(&mut ctx).await.unwrap();

        let sp_name = naming::automation_identity(&ctx.profile.prefix);
        let old_app_id =
            site.service_principal(&sp_name).await.unwrap().unwrap();
        site.delete_service_principal(&old_app_id).await.unwrap();
        let before = site.mutation_count();

        let (mut ctx, _dir) = test_context(&site);
        DevOpsLayer.provision(&mut ctx).await.unwrap();
        let identity = ctx.identity().unwrap();
        assert_ne!(identity.app_id, old_app_id);
        assert_eq!(site.credential_resets(), 2);

        let mutations = &site.mutations()[before..];
        assert_eq!(mutations.len(), 4, "{mutations:?}");
        assert!(mutations[0].starts_with("create service principal"));
        assert!(mutations[1].starts_with("reset credential"));
        assert!(mutations[2].starts_with("delete service connection"));
        assert_eq!(
            mutations[3],
            "create service connection ipc-acme-poc-azure"
        );
    }

    #[tokio::test]
    async fn teardown_keeps_project_and_environments() {
        let site = SimulatedSite::new();
        let (mut ctx, _dir) = test_context(&site);
        DevOpsLayer.provision(&mut ctx).await.unwrap();
        DevOpsLayer.teardown(&mut ctx).await.unwrap();

        let sp_name = naming::automation_identity(&ctx.profile.prefix);
        assert_eq!(site.service_principal(&sp_name).await.unwrap(), None);
        assert_eq!(site.project_environments("Acme").len(), 4);

        let before = site.mutation_count();
        DevOpsLayer.teardown(&mut ctx).await.unwrap();
        assert_eq!(site.mutation_count(), before);
    }
}
