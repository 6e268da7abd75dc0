// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the external systems the provisioner drives.
//!
//! Each trait is the smallest surface one or more layers need from a
//! collaborator. The production implementations shell out to the vendor
//! CLIs through an [edge_exec::Executor]; tests substitute
//! [crate::fakes::SimulatedSite].

use crate::identity::ServiceIdentity;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use edge_exec::{ExecutionError, Output};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

mod az;
mod devops;
mod hyperv;
mod net;
mod packer;
mod terraform;

pub use az::AzCli;
pub use devops::AzDevOpsCli;
pub use hyperv::{
    GuestCredential, HyperV, GUEST_PASSWORD_ENV, GUEST_USER_ENV,
};
pub use net::TcpProber;
pub use packer::PackerCli;
pub use terraform::TerraformCli;

#[cfg(windows)]
pub const AZ: &str = "az.cmd";
#[cfg(not(windows))]
pub const AZ: &str = "az";

#[cfg(windows)]
pub const POWERSHELL: &str = "powershell.exe";
#[cfg(not(windows))]
pub const POWERSHELL: &str = "pwsh";

pub const TERRAFORM: &str = "terraform";
pub const PACKER: &str = "packer";

/// The subscription the cloud CLI session currently targets.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(rename = "id")]
    pub subscription_id: String,
    pub tenant_id: String,
}

/// A cluster registered with the control plane.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedCluster {
    pub name: String,
    /// System identity of the cluster agent, absent until provisioned.
    #[serde(default)]
    pub principal_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// A flux configuration reconciling a path of a git repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FluxConfiguration {
    pub name: String,
    pub url: String,
    pub branch: String,
    pub path: String,
}

#[async_trait]
pub trait Cloud: Send + Sync {
    async fn account(&self) -> Result<Account, ExecutionError>;
    async fn set_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<(), ExecutionError>;

    async fn group_exists(&self, name: &str) -> Result<bool, ExecutionError>;
    async fn create_group(
        &self,
        name: &str,
        location: &str,
    ) -> Result<(), ExecutionError>;

    async fn storage_account_exists(
        &self,
        group: &str,
        name: &str,
    ) -> Result<bool, ExecutionError>;
    async fn create_storage_account(
        &self,
        group: &str,
        name: &str,
        location: &str,
    ) -> Result<(), ExecutionError>;
    async fn container_exists(
        &self,
        account: &str,
        name: &str,
    ) -> Result<bool, ExecutionError>;
    async fn create_container(
        &self,
        account: &str,
        name: &str,
    ) -> Result<(), ExecutionError>;

    /// Returns the app id of the service principal with this display name.
    async fn service_principal(
        &self,
        display_name: &str,
    ) -> Result<Option<String>, ExecutionError>;
    /// Creates a service principal with no credential, returning its app id.
    async fn create_service_principal(
        &self,
        display_name: &str,
        scope: &str,
    ) -> Result<String, ExecutionError>;
    /// Replaces every credential of `app_id` with a new secret.
    async fn reset_credential(
        &self,
        app_id: &str,
        end_date: &str,
    ) -> Result<ServiceIdentity, ExecutionError>;
    async fn delete_service_principal(
        &self,
        app_id: &str,
    ) -> Result<(), ExecutionError>;
    /// Resolves a directory object id to the app (client) id.
    async fn client_id(
        &self,
        principal_id: &str,
    ) -> Result<Option<String>, ExecutionError>;

    async fn connected_cluster(
        &self,
        group: &str,
        name: &str,
    ) -> Result<Option<ConnectedCluster>, ExecutionError>;
    async fn delete_connected_cluster(
        &self,
        group: &str,
        name: &str,
    ) -> Result<(), ExecutionError>;

    async fn extensions(
        &self,
        group: &str,
        cluster: &str,
    ) -> Result<Vec<String>, ExecutionError>;
    async fn create_flux_extension(
        &self,
        group: &str,
        cluster: &str,
        name: &str,
    ) -> Result<(), ExecutionError>;
    async fn flux_configurations(
        &self,
        group: &str,
        cluster: &str,
    ) -> Result<Vec<String>, ExecutionError>;
    async fn create_flux_configuration(
        &self,
        group: &str,
        cluster: &str,
        config: &FluxConfiguration,
    ) -> Result<(), ExecutionError>;
}

/// A service connection as listed by the DevOps platform.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConnection {
    pub id: String,
    /// The service principal the connection authenticates as.
    #[serde(default)]
    pub app_id: Option<String>,
}

/// What a new service connection binds together.
#[derive(Clone, Debug)]
pub struct ServiceConnectionSpec {
    pub name: String,
    pub subscription_id: String,
    pub subscription_name: String,
}

#[async_trait]
pub trait DevOps: Send + Sync {
    async fn projects(&self) -> Result<Vec<String>, ExecutionError>;
    async fn create_project(&self, name: &str) -> Result<(), ExecutionError>;

    async fn service_connection(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<ServiceConnection>, ExecutionError>;
    async fn create_service_connection(
        &self,
        project: &str,
        spec: &ServiceConnectionSpec,
        identity: &ServiceIdentity,
    ) -> Result<(), ExecutionError>;
    async fn delete_service_connection(
        &self,
        project: &str,
        id: &str,
    ) -> Result<(), ExecutionError>;

    async fn environments(
        &self,
        project: &str,
    ) -> Result<Vec<String>, ExecutionError>;
    async fn create_environment(
        &self,
        project: &str,
        name: &str,
    ) -> Result<(), ExecutionError>;
}

/// Remote state location for terraform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateBackend {
    pub resource_group: String,
    pub storage_account: String,
    pub container: String,
    pub key: String,
}

#[derive(Clone, Debug)]
pub struct TerraformInputs {
    pub subscription_id: String,
    pub backend: StateBackend,
    pub prefix: String,
    pub location: String,
    pub environment: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanKind {
    Apply,
    Destroy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanOutcome {
    NoChanges,
    /// A plan file was written and should be applied.
    Changes,
}

#[async_trait]
pub trait Terraform: Send + Sync {
    async fn init(&self, inputs: &TerraformInputs)
        -> Result<(), ExecutionError>;
    async fn plan(
        &self,
        inputs: &TerraformInputs,
        kind: PlanKind,
    ) -> Result<PlanOutcome, ExecutionError>;
    async fn apply(
        &self,
        inputs: &TerraformInputs,
    ) -> Result<(), ExecutionError>;
}

pub struct ImageBuild<'a> {
    pub vm_name: &'a str,
    pub install_media: &'a Utf8Path,
    pub switch_name: &'a str,
    pub output_dir: Utf8PathBuf,
    pub identity: &'a ServiceIdentity,
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Builds the golden image, returning once the build has finished.
    async fn build(&self, build: &ImageBuild<'_>) -> Result<(), ExecutionError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmState {
    Running,
    Off,
    Other(String),
}

impl VmState {
    pub fn parse(s: &str) -> VmState {
        match s.trim() {
            "Running" => VmState::Running,
            "Off" => VmState::Off,
            other => VmState::Other(other.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VmSpec {
    pub name: String,
    pub disk: Utf8PathBuf,
    pub switch_name: String,
    pub memory_gb: u32,
    pub cpu_count: u32,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn vm_state(
        &self,
        name: &str,
    ) -> Result<Option<VmState>, ExecutionError>;
    /// Creates a generation 2 VM with nested virtualization and static
    /// memory. The VM is left stopped.
    async fn create_vm(&self, spec: &VmSpec) -> Result<(), ExecutionError>;
    async fn start_vm(&self, name: &str) -> Result<(), ExecutionError>;
    async fn remove_vm(&self, name: &str) -> Result<(), ExecutionError>;
    /// Copies a host file into a directory inside the guest.
    async fn copy_to_guest(
        &self,
        name: &str,
        source: &Utf8Path,
        guest_dir: &str,
    ) -> Result<(), ExecutionError>;
}

/// Registration of the in-guest cluster with the control plane.
#[derive(Clone, Debug)]
pub struct ArcConnection {
    pub cluster_name: String,
    pub resource_group: String,
    pub location: String,
    pub subscription_id: String,
}

/// Commands run inside the guest and on its Linux node.
#[async_trait]
pub trait Guest: Send + Sync {
    /// Whether a password for the guest's administrator was supplied.
    fn has_credential(&self) -> bool;
    /// Succeeds once the guest accepts remote commands.
    async fn ping(&self, vm: &str) -> Result<(), ExecutionError>;
    async fn deployment_exists(&self, vm: &str)
        -> Result<bool, ExecutionError>;
    async fn deploy_cluster(
        &self,
        vm: &str,
        config_path: &str,
    ) -> Result<(), ExecutionError>;
    async fn connect_cluster(
        &self,
        vm: &str,
        connection: &ArcConnection,
        identity: &ServiceIdentity,
    ) -> Result<(), ExecutionError>;
    /// Reads a file on the Linux node; a missing file reads as empty.
    async fn read_node_file(
        &self,
        vm: &str,
        path: &str,
    ) -> Result<String, ExecutionError>;
    async fn push_node_file(
        &self,
        vm: &str,
        guest_source: &str,
        node_path: &str,
    ) -> Result<(), ExecutionError>;
    async fn restart_kubelet(&self, vm: &str) -> Result<(), ExecutionError>;
    async fn running_pods(
        &self,
        vm: &str,
        namespace: &str,
    ) -> Result<usize, ExecutionError>;
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> std::io::Result<()>;
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Parses JSON printed by a tool. Empty output and `null` both read as
/// `None`, which is what `az` prints for a query with no match.
fn parse_json<T: DeserializeOwned>(
    what: &str,
    output: &Output,
) -> Result<Option<T>, ExecutionError> {
    let text = stdout(output);
    if text.is_empty() || text == "null" {
        return Ok(None);
    }
    serde_json::from_str(&text).map_err(|err| ExecutionError::parse(what, err))
}

fn parse_bool(what: &str, output: &Output) -> Result<bool, ExecutionError> {
    match stdout(output).to_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ExecutionError::parse(
            what,
            format!("expected true or false, got {other:?}"),
        )),
    }
}

/// Quotes a value for a single-quoted PowerShell string.
pub(crate) fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
