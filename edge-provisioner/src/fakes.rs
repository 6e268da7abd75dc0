// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory stand-in for every external system, for tests.
//!
//! [SimulatedSite] implements all of the collaborator traits over one shared
//! model, so a change made through one (say, terraform creating the workload
//! resource group) is visible through the others. Every call that would
//! change a real system is recorded; reads are not.

use crate::config::{CustomerProfile, Settings, VmShape};
use crate::context::{RunContext, Tools};
use crate::identity::ServiceIdentity;
use crate::naming;
use crate::tools::{
    Account, ArcConnection, Cloud, ConnectedCluster, DevOps,
    FluxConfiguration, Guest, Hypervisor, ImageBuild, ImageBuilder, PlanKind,
    PlanOutcome, Prober, ServiceConnection, ServiceConnectionSpec, Terraform,
    TerraformInputs, VmSpec, VmState,
};
use async_trait::async_trait;
use camino::Utf8Path;
use camino_tempfile::Utf8TempDir;
use edge_exec::{ExecutionError, Output, OutputExt};
use secrecy::SecretString;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const ACME_SUBSCRIPTION: &str = "11111111-2222-3333-4444-555555555555";
pub const ACME_TENANT: &str = "99999999-8888-7777-6666-555555555555";

/// The "Acme" customer used throughout the tests.
pub fn acme_profile() -> CustomerProfile {
    CustomerProfile {
        name: "Acme".to_string(),
        subscription_id: ACME_SUBSCRIPTION.to_string(),
        location: "eastus".to_string(),
        prefix: "ipc-acme-poc".to_string(),
        repo_url: "https://dev.azure.com/edge-platform/acme/_git/gitops"
            .to_string(),
        install_media: "/iso/windows-server-2022.iso".into(),
        vm_name: "acme-ipc-01".to_string(),
        switch_name: "Default Switch".to_string(),
        vm: VmShape::default(),
    }
}

/// Settings rooted in a fresh temporary directory.
pub fn test_settings() -> (Settings, Utf8TempDir) {
    let dir = camino_tempfile::tempdir().expect("created temp dir");
    (Settings::with_base_dir(dir.path()), dir)
}

/// A context for the Acme profile against `site`. Keep the returned
/// directory alive for as long as the context is used.
pub fn test_context(site: &Arc<SimulatedSite>) -> (RunContext, Utf8TempDir) {
    let (settings, dir) = test_settings();
    let log = slog::Logger::root(slog::Discard, slog::o!());
    let ctx = RunContext::new(log, acme_profile(), settings, site.tools());
    (ctx, dir)
}

/// An identity as an operator would supply it through the environment.
pub fn operator_identity() -> ServiceIdentity {
    ServiceIdentity {
        app_id: "operator-app".to_string(),
        tenant_id: ACME_TENANT.to_string(),
        secret: SecretString::from("operator-secret".to_string()),
    }
}

/// Stores the Acme profile where a run will look for it.
pub fn store_acme_profile(settings: &Settings) {
    let contents =
        toml::to_string(&acme_profile()).expect("profile serializes");
    std::fs::create_dir_all(&settings.profile_dir)
        .expect("created profile dir");
    std::fs::write(settings.profile_dir.join("acme.toml"), contents)
        .expect("wrote profile");
}

/// Leaves a golden image where a successful build would have put it.
pub fn seed_image(settings: &Settings, profile: &CustomerProfile) {
    let artifact =
        naming::image_artifact(&settings.packer_dir, &profile.vm_name);
    let dir = artifact.parent().expect("artifact has a parent");
    std::fs::create_dir_all(dir).expect("created image output dir");
    std::fs::write(&artifact, "vhdx").expect("wrote image");
}

fn failure(command: &str, stderr: &str) -> ExecutionError {
    ExecutionError::from_output(
        &std::process::Command::new(command),
        &Output::failure().set_stderr(stderr),
    )
}

#[derive(Default)]
struct Terraformed {
    initialized: bool,
    applied: bool,
    pending: Option<PlanKind>,
    workload_group: Option<String>,
}

struct SiteState {
    unreachable: BTreeSet<String>,
    account: Account,
    subscription_sticky: bool,
    groups: BTreeSet<String>,
    storage_accounts: BTreeSet<(String, String)>,
    containers: BTreeSet<(String, String)>,
    terraform: Terraformed,

    /// Display name to app id.
    principals: BTreeMap<String, String>,
    /// Principal (object) id to app id.
    directory: BTreeMap<String, String>,
    credential_resets: usize,
    unresolvable_principals: bool,

    projects: BTreeSet<String>,
    connections: BTreeMap<(String, String), ServiceConnection>,
    environments: BTreeMap<String, BTreeSet<String>>,

    vms: BTreeMap<String, VmState>,
    guest_credential: bool,
    guest_ready_after: Option<u32>,
    pings: u32,
    deployments: BTreeSet<String>,
    deployments_register: bool,
    guest_files: BTreeMap<(String, String), String>,
    node_files: BTreeMap<(String, String), String>,
    kubelet_restarts: usize,
    running_pods: usize,
    pod_queries: u32,

    clusters: BTreeMap<(String, String), ConnectedCluster>,
    extensions: BTreeMap<(String, String), BTreeSet<String>>,
    flux: BTreeMap<(String, String), Vec<FluxConfiguration>>,

    mutations: Vec<String>,
    next_id: u32,
}

/// See the module documentation.
pub struct SimulatedSite {
    state: Mutex<SiteState>,
}

impl SimulatedSite {
    /// An empty site whose CLI session already targets the Acme
    /// subscription, with a guest that answers immediately and five
    /// workloads that run once deployed.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SiteState {
                unreachable: BTreeSet::new(),
                account: Account {
                    subscription_id: ACME_SUBSCRIPTION.to_string(),
                    tenant_id: ACME_TENANT.to_string(),
                },
                subscription_sticky: false,
                groups: BTreeSet::new(),
                storage_accounts: BTreeSet::new(),
                containers: BTreeSet::new(),
                terraform: Terraformed::default(),
                principals: BTreeMap::new(),
                directory: BTreeMap::new(),
                credential_resets: 0,
                unresolvable_principals: false,
                projects: BTreeSet::new(),
                connections: BTreeMap::new(),
                environments: BTreeMap::new(),
                vms: BTreeMap::new(),
                guest_credential: true,
                guest_ready_after: Some(0),
                pings: 0,
                deployments: BTreeSet::new(),
                deployments_register: true,
                guest_files: BTreeMap::new(),
                node_files: BTreeMap::new(),
                kubelet_restarts: 0,
                running_pods: crate::config::DEFAULT_EXPECTED_PODS,
                pod_queries: 0,
                clusters: BTreeMap::new(),
                extensions: BTreeMap::new(),
                flux: BTreeMap::new(),
                mutations: Vec::new(),
                next_id: 0,
            }),
        })
    }

    pub fn tools(self: &Arc<Self>) -> Tools {
        Tools {
            cloud: self.clone(),
            devops: self.clone(),
            terraform: self.clone(),
            images: self.clone(),
            hypervisor: self.clone(),
            guest: self.clone(),
            prober: self.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SiteState> {
        self.state.lock().unwrap()
    }

    // Knobs

    pub fn set_unreachable(&self, host: &str) {
        self.state().unreachable.insert(host.to_string());
    }

    pub fn set_active_subscription(&self, subscription_id: &str) {
        self.state().account.subscription_id = subscription_id.to_string();
    }

    /// Switching subscriptions reports success but changes nothing.
    pub fn set_subscription_sticky(&self) {
        self.state().subscription_sticky = true;
    }

    /// No guest password was supplied to the host tools.
    pub fn clear_guest_credential(&self) {
        self.state().guest_credential = false;
    }

    /// The guest answers remote commands only after `pings` failed
    /// attempts; `None` means never.
    pub fn set_guest_ready_after(&self, pings: Option<u32>) {
        self.state().guest_ready_after = pings;
    }

    pub fn set_unresolvable_principals(&self) {
        self.state().unresolvable_principals = true;
    }

    pub fn set_deployments_register(&self, register: bool) {
        self.state().deployments_register = register;
    }

    pub fn set_running_pods(&self, count: usize) {
        self.state().running_pods = count;
    }

    /// Creates a resource group without recording a mutation, as if some
    /// earlier run had made it.
    pub fn seed_group(&self, name: &str) {
        self.state().groups.insert(name.to_string());
    }

    /// Marks a cluster as deployed in `vm`.
    pub fn set_deployed(&self, vm: &str) {
        self.state().deployments.insert(vm.to_string());
    }

    pub fn add_vm(&self, name: &str, state: VmState) {
        self.state().vms.insert(name.to_string(), state);
    }

    // Observations

    /// Names of the mutating calls made so far, in order.
    pub fn mutations(&self) -> Vec<String> {
        self.state().mutations.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.state().mutations.len()
    }

    pub fn vms(&self) -> BTreeMap<String, VmState> {
        self.state().vms.clone()
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.state().groups.contains(name)
    }

    pub fn pings(&self) -> u32 {
        self.state().pings
    }

    pub fn pod_queries(&self) -> u32 {
        self.state().pod_queries
    }

    pub fn credential_resets(&self) -> usize {
        self.state().credential_resets
    }

    pub fn node_file(&self, vm: &str, path: &str) -> Option<String> {
        self.state()
            .node_files
            .get(&(vm.to_string(), path.to_string()))
            .cloned()
    }

    pub fn kubelet_restarts(&self) -> usize {
        self.state().kubelet_restarts
    }

    pub fn project_environments(&self, project: &str) -> BTreeSet<String> {
        self.state().environments.get(project).cloned().unwrap_or_default()
    }

    pub fn cluster_flux_configurations(
        &self,
        group: &str,
        cluster: &str,
    ) -> Vec<FluxConfiguration> {
        self.state()
            .flux
            .get(&(group.to_string(), cluster.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

impl SiteState {
    fn mutate(&mut self, what: impl Into<String>) {
        self.mutations.push(what.into());
    }

    fn next_id(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("{kind}-{}", self.next_id)
    }
}

fn key(a: &str, b: &str) -> (String, String) {
    (a.to_string(), b.to_string())
}

#[async_trait]
impl Prober for SimulatedSite {
    async fn probe(
        &self,
        host: &str,
        _port: u16,
        _timeout: Duration,
    ) -> std::io::Result<()> {
        if self.state().unreachable.contains(host) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "simulated outage",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Cloud for SimulatedSite {
    async fn account(&self) -> Result<Account, ExecutionError> {
        Ok(self.state().account.clone())
    }

    async fn set_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<(), ExecutionError> {
        if !self.state().subscription_sticky {
            self.set_active_subscription(subscription_id);
        }
        Ok(())
    }

    async fn group_exists(&self, name: &str) -> Result<bool, ExecutionError> {
        Ok(self.state().groups.contains(name))
    }

    async fn create_group(
        &self,
        name: &str,
        _location: &str,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.mutate(format!("create group {name}"));
        state.groups.insert(name.to_string());
        Ok(())
    }

    async fn storage_account_exists(
        &self,
        group: &str,
        name: &str,
    ) -> Result<bool, ExecutionError> {
        Ok(self.state().storage_accounts.contains(&key(group, name)))
    }

    async fn create_storage_account(
        &self,
        group: &str,
        name: &str,
        _location: &str,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        if !state.groups.contains(group) {
            return Err(failure("az", "ResourceGroupNotFound"));
        }
        state.mutate(format!("create storage account {name}"));
        state.storage_accounts.insert(key(group, name));
        Ok(())
    }

    async fn container_exists(
        &self,
        account: &str,
        name: &str,
    ) -> Result<bool, ExecutionError> {
        Ok(self.state().containers.contains(&key(account, name)))
    }

    async fn create_container(
        &self,
        account: &str,
        name: &str,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.mutate(format!("create container {name}"));
        state.containers.insert(key(account, name));
        Ok(())
    }

    async fn service_principal(
        &self,
        display_name: &str,
    ) -> Result<Option<String>, ExecutionError> {
        Ok(self.state().principals.get(display_name).cloned())
    }

    async fn create_service_principal(
        &self,
        display_name: &str,
        _scope: &str,
    ) -> Result<String, ExecutionError> {
        let mut state = self.state();
        state.mutate(format!("create service principal {display_name}"));
        let app_id = state.next_id("app");
        state.principals.insert(display_name.to_string(), app_id.clone());
        Ok(app_id)
    }

    async fn reset_credential(
        &self,
        app_id: &str,
        _end_date: &str,
    ) -> Result<ServiceIdentity, ExecutionError> {
        let mut state = self.state();
        if !state.principals.values().any(|id| id == app_id) {
            return Err(failure("az", "service principal not found"));
        }
        state.mutate(format!("reset credential {app_id}"));
        state.credential_resets += 1;
        let secret = state.next_id("secret");
        Ok(ServiceIdentity {
            app_id: app_id.to_string(),
            tenant_id: state.account.tenant_id.clone(),
            secret: SecretString::from(secret),
        })
    }

    async fn delete_service_principal(
        &self,
        app_id: &str,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.mutate(format!("delete service principal {app_id}"));
        state.principals.retain(|_, id| id != app_id);
        Ok(())
    }

    async fn client_id(
        &self,
        principal_id: &str,
    ) -> Result<Option<String>, ExecutionError> {
        Ok(self.state().directory.get(principal_id).cloned())
    }

    async fn connected_cluster(
        &self,
        group: &str,
        name: &str,
    ) -> Result<Option<ConnectedCluster>, ExecutionError> {
        let state = self.state();
        if !state.groups.contains(group) {
            return Err(failure("az", "ResourceGroupNotFound"));
        }
        Ok(state.clusters.get(&key(group, name)).cloned())
    }

    async fn delete_connected_cluster(
        &self,
        group: &str,
        name: &str,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.mutate(format!("delete connected cluster {name}"));
        state.clusters.remove(&key(group, name));
        state.extensions.remove(&key(group, name));
        state.flux.remove(&key(group, name));
        Ok(())
    }

    async fn extensions(
        &self,
        group: &str,
        cluster: &str,
    ) -> Result<Vec<String>, ExecutionError> {
        let state = self.state();
        Ok(state
            .extensions
            .get(&key(group, cluster))
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_flux_extension(
        &self,
        group: &str,
        cluster: &str,
        name: &str,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        if !state.clusters.contains_key(&key(group, cluster)) {
            return Err(failure("az", "connected cluster not found"));
        }
        state.mutate(format!("create extension {name}"));
        state
            .extensions
            .entry(key(group, cluster))
            .or_default()
            .insert(name.to_string());
        Ok(())
    }

    async fn flux_configurations(
        &self,
        group: &str,
        cluster: &str,
    ) -> Result<Vec<String>, ExecutionError> {
        Ok(self
            .cluster_flux_configurations(group, cluster)
            .into_iter()
            .map(|config| config.name)
            .collect())
    }

    async fn create_flux_configuration(
        &self,
        group: &str,
        cluster: &str,
        config: &FluxConfiguration,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        let installed = state
            .extensions
            .get(&key(group, cluster))
            .is_some_and(|names| names.contains(naming::GITOPS_EXTENSION));
        if !installed {
            return Err(failure("az", "flux extension is not installed"));
        }
        state.mutate(format!("create flux configuration {}", config.name));
        state.flux.entry(key(group, cluster)).or_default().push(config.clone());
        Ok(())
    }
}

#[async_trait]
impl DevOps for SimulatedSite {
    async fn projects(&self) -> Result<Vec<String>, ExecutionError> {
        Ok(self.state().projects.iter().cloned().collect())
    }

    async fn create_project(&self, name: &str) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.mutate(format!("create project {name}"));
        state.projects.insert(name.to_string());
        Ok(())
    }

    async fn service_connection(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<ServiceConnection>, ExecutionError> {
        Ok(self.state().connections.get(&key(project, name)).cloned())
    }

    async fn create_service_connection(
        &self,
        project: &str,
        spec: &ServiceConnectionSpec,
        identity: &ServiceIdentity,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        if state.connections.contains_key(&key(project, &spec.name)) {
            return Err(failure("az", "service connection already exists"));
        }
        if identity.expose_secret().is_empty() {
            return Err(failure("az", "empty service principal key"));
        }
        state.mutate(format!("create service connection {}", spec.name));
        let id = state.next_id("endpoint");
        state.connections.insert(
            key(project, &spec.name),
            ServiceConnection { id, app_id: Some(identity.app_id.clone()) },
        );
        Ok(())
    }

    async fn delete_service_connection(
        &self,
        project: &str,
        id: &str,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.mutate(format!("delete service connection {id}"));
        state.connections.retain(|(p, _), c| !(p == project && c.id == id));
        Ok(())
    }

    async fn environments(
        &self,
        project: &str,
    ) -> Result<Vec<String>, ExecutionError> {
        Ok(self.project_environments(project).into_iter().collect())
    }

    async fn create_environment(
        &self,
        project: &str,
        name: &str,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.mutate(format!("create environment {name}"));
        state
            .environments
            .entry(project.to_string())
            .or_default()
            .insert(name.to_string());
        Ok(())
    }
}

#[async_trait]
impl Terraform for SimulatedSite {
    async fn init(
        &self,
        inputs: &TerraformInputs,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        let backend = &inputs.backend;
        let present = state.containers.contains(&key(
            &backend.storage_account,
            &backend.container,
        ));
        if !present {
            return Err(failure("terraform", "backend container not found"));
        }
        state.terraform.initialized = true;
        Ok(())
    }

    async fn plan(
        &self,
        inputs: &TerraformInputs,
        kind: PlanKind,
    ) -> Result<PlanOutcome, ExecutionError> {
        let mut state = self.state();
        if !state.terraform.initialized {
            return Err(failure("terraform", "backend not initialized"));
        }
        let group = naming::workload_resource_group(
            &inputs.prefix,
            &inputs.environment,
        );
        let changes = match kind {
            PlanKind::Apply => !state.groups.contains(&group),
            PlanKind::Destroy => state.terraform.applied,
        };
        state.terraform.workload_group = Some(group);
        state.terraform.pending = changes.then_some(kind);
        Ok(if changes { PlanOutcome::Changes } else { PlanOutcome::NoChanges })
    }

    async fn apply(
        &self,
        _inputs: &TerraformInputs,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        let Some(kind) = state.terraform.pending.take() else {
            return Err(failure("terraform", "no saved plan"));
        };
        let group = state.terraform.workload_group.clone().unwrap_or_default();
        match kind {
            PlanKind::Apply => {
                state.mutate("terraform apply");
                state.groups.insert(group);
                state.terraform.applied = true;
            }
            PlanKind::Destroy => {
                state.mutate("terraform destroy");
                state.groups.remove(&group);
                state.terraform.applied = false;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for SimulatedSite {
    async fn build(
        &self,
        build: &ImageBuild<'_>,
    ) -> Result<(), ExecutionError> {
        if build.identity.expose_secret().is_empty() {
            return Err(failure("packer", "missing client secret"));
        }
        self.state().mutate(format!("build image {}", build.vm_name));
        let dir = build.output_dir.join("Virtual Hard Disks");
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join(format!("{}.vhdx", build.vm_name)), "vhdx")
        };
        write().map_err(|err| ExecutionError::ExecutionStart {
            command: "packer build".to_string(),
            err,
        })
    }
}

#[async_trait]
impl Hypervisor for SimulatedSite {
    async fn vm_state(
        &self,
        name: &str,
    ) -> Result<Option<VmState>, ExecutionError> {
        Ok(self.state().vms.get(name).cloned())
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<(), ExecutionError> {
        if !spec.disk.exists() {
            return Err(failure("powershell", "virtual hard disk not found"));
        }
        let mut state = self.state();
        state.mutate(format!("create vm {}", spec.name));
        state.vms.insert(spec.name.clone(), VmState::Off);
        Ok(())
    }

    async fn start_vm(&self, name: &str) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.mutate(format!("start vm {name}"));
        match state.vms.get_mut(name) {
            Some(vm) => {
                *vm = VmState::Running;
                Ok(())
            }
            None => Err(failure("powershell", "vm not found")),
        }
    }

    async fn remove_vm(&self, name: &str) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.mutate(format!("remove vm {name}"));
        state.vms.remove(name);
        state.deployments.remove(name);
        Ok(())
    }

    async fn copy_to_guest(
        &self,
        name: &str,
        source: &Utf8Path,
        guest_dir: &str,
    ) -> Result<(), ExecutionError> {
        let contents = std::fs::read_to_string(source).map_err(|err| {
            ExecutionError::ExecutionStart {
                command: "Copy-VMFile".to_string(),
                err,
            }
        })?;
        let file_name = source.file_name().unwrap_or_default();
        let mut state = self.state();
        state.mutate(format!("copy {file_name} into {name}"));
        state
            .guest_files
            .insert(key(name, &format!("{guest_dir}\\{file_name}")), contents);
        Ok(())
    }
}

impl SiteState {
    fn running(&self, vm: &str) -> Result<(), ExecutionError> {
        match self.vms.get(vm) {
            Some(VmState::Running) => Ok(()),
            _ => Err(failure("powershell", "virtual machine is not running")),
        }
    }

    fn deployed(&self, vm: &str) -> Result<(), ExecutionError> {
        self.running(vm)?;
        if !self.deployments.contains(vm) {
            return Err(failure("powershell", "no cluster deployment"));
        }
        Ok(())
    }
}

#[async_trait]
impl Guest for SimulatedSite {
    fn has_credential(&self) -> bool {
        self.state().guest_credential
    }

    async fn ping(&self, vm: &str) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.pings += 1;
        state.running(vm)?;
        match state.guest_ready_after {
            Some(after) if state.pings > after => Ok(()),
            _ => Err(failure("powershell", "the virtual machine is booting")),
        }
    }

    async fn deployment_exists(
        &self,
        vm: &str,
    ) -> Result<bool, ExecutionError> {
        let state = self.state();
        state.running(vm)?;
        Ok(state.deployments.contains(vm))
    }

    async fn deploy_cluster(
        &self,
        vm: &str,
        _config_path: &str,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.running(vm)?;
        state.mutate(format!("deploy cluster on {vm}"));
        if state.deployments_register {
            state.deployments.insert(vm.to_string());
        }
        Ok(())
    }

    async fn connect_cluster(
        &self,
        vm: &str,
        connection: &ArcConnection,
        identity: &ServiceIdentity,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.deployed(vm)?;
        if !state.groups.contains(&connection.resource_group) {
            return Err(failure("az", "ResourceGroupNotFound"));
        }
        if identity.expose_secret().is_empty() {
            return Err(failure("az", "authentication failed"));
        }
        state.mutate(format!("connect cluster {}", connection.cluster_name));
        let principal_id = state.next_id("principal");
        if !state.unresolvable_principals {
            let client_id = state.next_id("client");
            state.directory.insert(principal_id.clone(), client_id);
        }
        let tenant_id = state.account.tenant_id.clone();
        state.clusters.insert(
            key(&connection.resource_group, &connection.cluster_name),
            ConnectedCluster {
                name: connection.cluster_name.clone(),
                principal_id: Some(principal_id),
                tenant_id: Some(tenant_id),
            },
        );
        Ok(())
    }

    async fn read_node_file(
        &self,
        vm: &str,
        path: &str,
    ) -> Result<String, ExecutionError> {
        let state = self.state();
        state.deployed(vm)?;
        Ok(state.node_files.get(&key(vm, path)).cloned().unwrap_or_default())
    }

    async fn push_node_file(
        &self,
        vm: &str,
        guest_source: &str,
        node_path: &str,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.deployed(vm)?;
        let staged = state.guest_files.get(&key(vm, guest_source)).cloned();
        let Some(contents) = staged else {
            return Err(failure("powershell", "source file not found"));
        };
        state.mutate(format!("push {node_path} to {vm}"));
        state.node_files.insert(key(vm, node_path), contents);
        Ok(())
    }

    async fn restart_kubelet(&self, vm: &str) -> Result<(), ExecutionError> {
        let mut state = self.state();
        state.deployed(vm)?;
        state.mutate(format!("restart kubelet on {vm}"));
        state.kubelet_restarts += 1;
        Ok(())
    }

    async fn running_pods(
        &self,
        vm: &str,
        _namespace: &str,
    ) -> Result<usize, ExecutionError> {
        let mut state = self.state();
        state.pod_queries += 1;
        state.deployed(vm)?;
        Ok(state.running_pods)
    }
}
