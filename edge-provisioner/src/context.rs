// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! State shared by the layers of one run

use crate::config::{CustomerProfile, Settings};
use crate::error::{ProvisionError, ToolContext};
use crate::identity::ServiceIdentity;
use crate::naming;
use crate::stage::{Mode, Stage};
use crate::tools::{
    Account, AzCli, AzDevOpsCli, Cloud, DevOps, Guest, GuestCredential,
    HyperV, Hypervisor, ImageBuilder, PackerCli, Prober, TcpProber, Terraform,
    TerraformCli,
};
use edge_exec::HostExecutor;
use slog::Logger;
use std::sync::Arc;

/// The external systems a run talks to.
#[derive(Clone)]
pub struct Tools {
    pub cloud: Arc<dyn Cloud>,
    pub devops: Arc<dyn DevOps>,
    pub terraform: Arc<dyn Terraform>,
    pub images: Arc<dyn ImageBuilder>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub guest: Arc<dyn Guest>,
    pub prober: Arc<dyn Prober>,
}

impl Tools {
    /// The real tools, run as child processes on this host.
    pub fn host(
        log: &Logger,
        settings: &Settings,
        guest_credential: GuestCredential,
    ) -> Self {
        let executor =
            HostExecutor::new(log.new(slog::o!("component" => "executor")))
                .as_executor();
        let hyperv =
            Arc::new(HyperV::new(executor.clone(), Arc::new(guest_credential)));
        Self {
            cloud: Arc::new(AzCli::new(executor.clone())),
            devops: Arc::new(AzDevOpsCli::new(
                executor.clone(),
                settings.devops_organization.clone(),
            )),
            terraform: Arc::new(TerraformCli::new(
                executor.clone(),
                settings.terraform_dir.clone(),
            )),
            images: Arc::new(PackerCli::new(
                executor,
                settings.packer_dir.clone(),
            )),
            hypervisor: hyperv.clone(),
            guest: hyperv,
            prober: Arc::new(TcpProber),
        }
    }
}

/// Everything a layer needs, built once per run and passed down.
pub struct RunContext {
    pub log: Logger,
    pub profile: CustomerProfile,
    pub settings: Settings,
    pub tools: Tools,
    pub mode: Mode,
    /// Every stage this run executes, in order.
    pub plan: Vec<Stage>,
    /// Identity created or rotated by the devops layer in this run.
    identity: Option<Arc<ServiceIdentity>>,
    /// Identity supplied by the operator for runs without the devops layer.
    fallback_identity: Option<Arc<ServiceIdentity>>,
    account: Option<Account>,
}

impl RunContext {
    pub fn new(
        log: Logger,
        profile: CustomerProfile,
        settings: Settings,
        tools: Tools,
    ) -> Self {
        Self {
            log,
            profile,
            settings,
            tools,
            mode: Mode::Provision,
            plan: Vec::new(),
            identity: None,
            fallback_identity: None,
            account: None,
        }
    }

    pub fn with_fallback_identity(
        mut self,
        identity: Option<Arc<ServiceIdentity>>,
    ) -> Self {
        self.fallback_identity = identity;
        self
    }

    pub fn with_plan(mut self, mode: Mode, plan: Vec<Stage>) -> Self {
        self.mode = mode;
        self.plan = plan;
        self
    }

    /// Whether `stage` is provisioned later in this run.
    pub fn provisions(&self, stage: Stage) -> bool {
        self.mode == Mode::Provision && self.plan.contains(&stage)
    }

    /// Whether an identity is at hand without rotating one.
    pub fn has_identity(&self) -> bool {
        self.identity.is_some() || self.fallback_identity.is_some()
    }

    pub fn set_identity(&mut self, identity: ServiceIdentity) {
        self.identity = Some(Arc::new(identity));
    }

    /// The identity from this run, or else the one supplied by the
    /// operator.
    pub fn identity(&self) -> Option<Arc<ServiceIdentity>> {
        self.identity.clone().or_else(|| self.fallback_identity.clone())
    }

    pub fn require_identity(
        &self,
    ) -> Result<Arc<ServiceIdentity>, ProvisionError> {
        self.identity().ok_or(ProvisionError::MissingCredentials)
    }

    /// The active cloud account, read once per run.
    pub async fn account(&mut self) -> Result<Account, ProvisionError> {
        if let Some(account) = &self.account {
            return Ok(account.clone());
        }
        let account =
            self.tools.cloud.account().await.tool_context("reading account")?;
        self.account = Some(account.clone());
        Ok(account)
    }

    /// Drops the cached account after switching subscriptions.
    pub fn forget_account(&mut self) {
        self.account = None;
    }

    pub fn workload_resource_group(&self) -> String {
        naming::workload_resource_group(
            &self.profile.prefix,
            &self.settings.environment,
        )
    }

    pub fn connected_cluster(&self) -> String {
        naming::connected_cluster(&self.profile)
    }
}
