// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The edge VM and the cluster running inside it.
//!
//! Provisioning walks the VM up through these steps, each of which checks
//! before it acts:
//!
//! 1. the VM exists and is running, created from the golden image if absent
//! 2. the guest accepts remote commands
//! 3. the cluster is deployed in the guest
//! 4. the cluster is registered with the control plane
//! 5. the node's credential provider points at the cluster's identity
//! 6. GitOps is installed and configured

use super::image::exists;
use super::Layer;
use crate::context::RunContext;
use crate::error::{ProvisionError, ToolContext};
use crate::identity::CredentialProviderConfig;
use crate::naming;
use crate::poll::{wait_for_condition, CondCheckError, PollLimit};
use crate::stage::Stage;
use crate::tools::{
    ArcConnection, Cloud, ConnectedCluster, FluxConfiguration, Guest, VmSpec,
    VmState,
};
use async_trait::async_trait;
use slog::{debug, info, warn};

/// Branch the GitOps configuration tracks.
pub const GITOPS_BRANCH: &str = "main";

pub struct EdgeLayer;

impl EdgeLayer {
    /// Fails before anything is changed when the inputs this layer builds
    /// on are absent: the golden image (needed only while the VM does not
    /// exist) and the workload resource group.
    async fn check_prerequisites(
        &self,
        ctx: &RunContext,
    ) -> Result<(), ProvisionError> {
        let vm = &ctx.profile.vm_name;
        let state = ctx
            .tools
            .hypervisor
            .vm_state(vm)
            .await
            .with_tool_context(|| format!("reading state of VM {vm}"))?;
        let artifact = naming::image_artifact(&ctx.settings.packer_dir, vm);
        if state.is_none() && !exists(&artifact).await? {
            return Err(ProvisionError::MissingPrerequisite {
                what: format!("golden image {artifact}"),
                layer: "image",
            });
        }

        let group = ctx.workload_resource_group();
        if !ctx
            .tools
            .cloud
            .group_exists(&group)
            .await
            .tool_context("checking workload resource group")?
        {
            return Err(ProvisionError::MissingPrerequisite {
                what: format!("resource group {group}"),
                layer: "infrastructure",
            });
        }
        Ok(())
    }

    async fn ensure_vm(&self, ctx: &RunContext) -> Result<(), ProvisionError> {
        let hypervisor = &ctx.tools.hypervisor;
        let vm = &ctx.profile.vm_name;
        let state = hypervisor
            .vm_state(vm)
            .await
            .with_tool_context(|| format!("reading state of VM {vm}"))?;
        match state {
            Some(VmState::Running) => {
                info!(ctx.log, "VM already running"; "vm" => vm);
                return Ok(());
            }
            Some(VmState::Off) => {
                hypervisor
                    .start_vm(vm)
                    .await
                    .with_tool_context(|| format!("starting VM {vm}"))?;
                info!(ctx.log, "started stopped VM"; "vm" => vm);
                return Ok(());
            }
            Some(VmState::Other(state)) => {
                warn!(
                    ctx.log,
                    "VM is neither running nor off; waiting for it";
                    "vm" => vm,
                    "state" => state,
                );
                return Ok(());
            }
            None => (),
        }

        let artifact = naming::image_artifact(&ctx.settings.packer_dir, vm);
        let disk = naming::vm_disk(&ctx.settings.vm_disk_dir, vm);
        fs_err::tokio::create_dir_all(&ctx.settings.vm_disk_dir)
            .await
            .map_err(|err| {
                ProvisionError::io("creating VM disk directory", err)
            })?;
        info!(
            ctx.log,
            "copying golden image";
            "from" => %artifact,
            "to" => %disk,
        );
        fs_err::tokio::copy(&artifact, &disk)
            .await
            .map_err(|err| ProvisionError::io("copying golden image", err))?;

        let spec = VmSpec {
            name: vm.clone(),
            disk,
            switch_name: ctx.profile.switch_name.clone(),
            memory_gb: ctx.profile.vm.memory_gb,
            cpu_count: ctx.profile.vm.cpu_count,
        };
        hypervisor
            .create_vm(&spec)
            .await
            .with_tool_context(|| format!("creating VM {vm}"))?;
        hypervisor
            .start_vm(vm)
            .await
            .with_tool_context(|| format!("starting VM {vm}"))?;
        info!(
            ctx.log,
            "created VM";
            "vm" => vm,
            "memory_gb" => spec.memory_gb,
            "cpus" => spec.cpu_count,
        );
        Ok(())
    }

    async fn wait_for_guest(
        &self,
        ctx: &RunContext,
    ) -> Result<(), ProvisionError> {
        let guest: &dyn Guest = ctx.tools.guest.as_ref();
        let vm = ctx.profile.vm_name.as_str();
        let retry = ctx.settings.polling.guest_ready;
        let log = &ctx.log;

        wait_for_condition(
            || async move {
                guest.ping(vm).await.map_err(|err| {
                    debug!(log, "guest not ready"; "error" => %err);
                    CondCheckError::<ProvisionError>::NotYet
                })
            },
            retry.interval,
            PollLimit::Attempts(retry.attempts),
        )
        .await
        .map_err(|err| {
            ProvisionError::timeout(
                format!("guest {vm} to accept commands"),
                err,
            )
        })?;
        info!(ctx.log, "guest is accepting commands"; "vm" => vm);
        Ok(())
    }

    async fn ensure_cluster(
        &self,
        ctx: &RunContext,
    ) -> Result<(), ProvisionError> {
        let guest = &ctx.tools.guest;
        let vm = &ctx.profile.vm_name;
        if guest
            .deployment_exists(vm)
            .await
            .tool_context("checking cluster deployment")?
        {
            info!(ctx.log, "cluster already deployed"; "vm" => vm);
            return Ok(());
        }

        guest
            .deploy_cluster(vm, naming::GUEST_DEPLOYMENT_CONFIG)
            .await
            .tool_context("deploying cluster")?;
        if !guest
            .deployment_exists(vm)
            .await
            .tool_context("checking cluster deployment")?
        {
            return Err(ProvisionError::DeploymentNotRegistered {
                vm: vm.clone(),
            });
        }
        info!(ctx.log, "deployed cluster"; "vm" => vm);
        Ok(())
    }

    async fn ensure_connected(
        &self,
        ctx: &RunContext,
    ) -> Result<(), ProvisionError> {
        let cloud = &ctx.tools.cloud;
        let group = ctx.workload_resource_group();
        let cluster = ctx.connected_cluster();

        let existing = cloud
            .connected_cluster(&group, &cluster)
            .await
            .with_tool_context(|| format!("looking up cluster {cluster}"))?;
        if existing.is_some() {
            info!(ctx.log, "cluster already connected"; "cluster" => &cluster);
            return Ok(());
        }

        let identity = ctx.require_identity()?;
        let connection = ArcConnection {
            cluster_name: cluster.clone(),
            resource_group: group,
            location: ctx.profile.location.clone(),
            subscription_id: ctx.profile.subscription_id.clone(),
        };
        ctx.tools
            .guest
            .connect_cluster(&ctx.profile.vm_name, &connection, &identity)
            .await
            .with_tool_context(|| format!("connecting cluster {cluster}"))?;
        info!(ctx.log, "connected cluster"; "cluster" => &cluster);
        Ok(())
    }

    /// Waits until the control plane lists the cluster with its system
    /// identity, returning the cluster and the identity's principal id.
    async fn wait_for_identity(
        &self,
        ctx: &RunContext,
    ) -> Result<(ConnectedCluster, String), ProvisionError> {
        let cloud: &dyn Cloud = ctx.tools.cloud.as_ref();
        let group = ctx.workload_resource_group();
        let name = ctx.connected_cluster();
        let (group, name) = (group.as_str(), name.as_str());
        let retry = ctx.settings.polling.cluster_visible;

        wait_for_condition(
            || async move {
                let lookup = cloud
                    .connected_cluster(group, name)
                    .await
                    .with_tool_context(|| {
                        format!("looking up cluster {name}")
                    });
                match lookup {
                    Ok(Some(cluster)) => match cluster.principal_id.clone() {
                        Some(principal_id) => Ok((cluster, principal_id)),
                        None => Err(CondCheckError::<ProvisionError>::NotYet),
                    },
                    Ok(None) => Err(CondCheckError::NotYet),
                    Err(err) => Err(CondCheckError::Failed(err)),
                }
            },
            retry.interval,
            PollLimit::Attempts(retry.attempts),
        )
        .await
        .map_err(|err| {
            ProvisionError::timeout(format!("identity of cluster {name}"), err)
        })
    }

    /// Points the node's credential provider at the cluster's own identity,
    /// leaving the node alone when it already does.
    async fn repair_identity(
        &self,
        ctx: &mut RunContext,
        cluster: ConnectedCluster,
        principal_id: String,
    ) -> Result<(), ProvisionError> {
        let tenant_id = match cluster.tenant_id {
            Some(tenant_id) => tenant_id,
            None => ctx.account().await?.tenant_id,
        };
        let client_id = ctx
            .tools
            .cloud
            .client_id(&principal_id)
            .await
            .tool_context("resolving cluster identity")?
            .ok_or_else(|| ProvisionError::IdentityResolution {
                principal_id: principal_id.clone(),
            })?;

        let desired = CredentialProviderConfig::new(
            &tenant_id,
            &client_id,
            &ctx.profile.subscription_id,
            &ctx.workload_resource_group(),
            &ctx.profile.location,
        );
        let vm = &ctx.profile.vm_name;
        let current = ctx
            .tools
            .guest
            .read_node_file(vm, naming::NODE_CREDENTIAL_PATH)
            .await
            .tool_context("reading node credential configuration")?;
        if CredentialProviderConfig::parse(&current).as_ref() == Some(&desired)
        {
            info!(ctx.log, "node credential configuration up to date");
            return Ok(());
        }

        let staging = camino_tempfile::tempdir()
            .map_err(|err| ProvisionError::io("creating staging dir", err))?;
        let local = staging.path().join("azure.json");
        fs_err::tokio::write(&local, desired.to_json())
            .await
            .map_err(|err| {
                ProvisionError::io("staging node configuration", err)
            })?;
        ctx.tools
            .hypervisor
            .copy_to_guest(vm, &local, naming::GUEST_STAGING_DIR)
            .await
            .tool_context("copying node configuration into guest")?;
        let guest_source = format!(r"{}\azure.json", naming::GUEST_STAGING_DIR);
        ctx.tools
            .guest
            .push_node_file(vm, &guest_source, naming::NODE_CREDENTIAL_PATH)
            .await
            .tool_context("pushing node configuration")?;
        ctx.tools
            .guest
            .restart_kubelet(vm)
            .await
            .tool_context("restarting kubelet")?;
        info!(
            ctx.log,
            "repaired node credential configuration";
            "client_id" => &client_id,
        );
        Ok(())
    }

    async fn ensure_gitops(
        &self,
        ctx: &RunContext,
    ) -> Result<(), ProvisionError> {
        let cloud = &ctx.tools.cloud;
        let group = ctx.workload_resource_group();
        let cluster = ctx.connected_cluster();

        let extensions = cloud
            .extensions(&group, &cluster)
            .await
            .tool_context("listing cluster extensions")?;
        if extensions.iter().any(|e| e == naming::GITOPS_EXTENSION) {
            info!(ctx.log, "GitOps extension installed");
        } else {
            cloud
                .create_flux_extension(
                    &group,
                    &cluster,
                    naming::GITOPS_EXTENSION,
                )
                .await
                .tool_context("installing GitOps extension")?;
            info!(ctx.log, "installed GitOps extension");
        }

        let name = naming::flux_configuration(&ctx.profile.prefix);
        let configurations = cloud
            .flux_configurations(&group, &cluster)
            .await
            .tool_context("listing flux configurations")?;
        if configurations.contains(&name) {
            info!(ctx.log, "flux configuration exists"; "name" => &name);
            return Ok(());
        }
        let config = FluxConfiguration {
            name,
            url: ctx.profile.repo_url.clone(),
            branch: GITOPS_BRANCH.to_string(),
            path: format!("./clusters/{}", ctx.settings.environment),
        };
        cloud
            .create_flux_configuration(&group, &cluster, &config)
            .await
            .with_tool_context(|| {
                format!("creating flux configuration {}", config.name)
            })?;
        info!(
            ctx.log,
            "created flux configuration";
            "name" => &config.name,
            "path" => &config.path,
        );
        Ok(())
    }
}

#[async_trait]
impl Layer for EdgeLayer {
    fn stage(&self) -> Stage {
        Stage::Edge
    }

    async fn provision(
        &self,
        ctx: &mut RunContext,
    ) -> Result<(), ProvisionError> {
        self.check_prerequisites(ctx).await?;
        self.ensure_vm(ctx).await?;
        self.wait_for_guest(ctx).await?;
        self.ensure_cluster(ctx).await?;
        self.ensure_connected(ctx).await?;
        let (cluster, principal_id) = self.wait_for_identity(ctx).await?;
        self.repair_identity(ctx, cluster, principal_id).await?;
        self.ensure_gitops(ctx).await
    }

    /// Disconnects the cluster, then removes the VM and its disk.
    async fn teardown(
        &self,
        ctx: &mut RunContext,
    ) -> Result<(), ProvisionError> {
        let cloud = &ctx.tools.cloud;
        let group = ctx.workload_resource_group();
        let cluster = ctx.connected_cluster();
        let group_exists = cloud
            .group_exists(&group)
            .await
            .tool_context("checking workload resource group")?;
        if group_exists
            && cloud
                .connected_cluster(&group, &cluster)
                .await
                .with_tool_context(|| format!("looking up cluster {cluster}"))?
                .is_some()
        {
            cloud
                .delete_connected_cluster(&group, &cluster)
                .await
                .with_tool_context(|| format!("deleting cluster {cluster}"))?;
            info!(ctx.log, "disconnected cluster"; "cluster" => &cluster);
        }

        let vm = &ctx.profile.vm_name;
        let state = ctx
            .tools
            .hypervisor
            .vm_state(vm)
            .await
            .with_tool_context(|| format!("reading state of VM {vm}"))?;
        if state.is_some() {
            ctx.tools
                .hypervisor
                .remove_vm(vm)
                .await
                .with_tool_context(|| format!("removing VM {vm}"))?;
            info!(ctx.log, "removed VM"; "vm" => vm);
        }

        let disk = naming::vm_disk(&ctx.settings.vm_disk_dir, vm);
        if exists(&disk).await? {
            fs_err::tokio::remove_file(&disk)
                .await
                .map_err(|err| ProvisionError::io("removing VM disk", err))?;
            info!(ctx.log, "removed VM disk"; "path" => %disk);
        }
        Ok(())
    }
}
