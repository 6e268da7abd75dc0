// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hyper-V on the local host, and PowerShell Direct into its guests.
//!
//! Every call runs one PowerShell process. Commands for a guest are wrapped
//! in `Invoke-Command -VMName`, authenticating with a credential assembled
//! from variables in the child's environment. Values that must not appear
//! in a script (passwords, the automation secret) only ever arrive that
//! way.

use super::{
    parse_bool, ps_quote, stdout, ArcConnection, Guest, Hypervisor, VmSpec,
    VmState, POWERSHELL,
};
use crate::identity::{ServiceIdentity, ENV_SECRET};
use async_trait::async_trait;
use camino::Utf8Path;
use edge_exec::{BoxedExecutor, ExecutionError, Output};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use tokio::process::Command;

pub const GUEST_USER_ENV: &str = "EDGE_GUEST_USER";
pub const GUEST_PASSWORD_ENV: &str = "EDGE_GUEST_PASSWORD";

/// Local administrator of the guest, used for PowerShell Direct.
#[derive(Debug)]
pub struct GuestCredential {
    pub user: String,
    pub password: SecretString,
}

pub struct HyperV {
    executor: BoxedExecutor,
    credential: Arc<GuestCredential>,
}

impl HyperV {
    pub fn new(
        executor: BoxedExecutor,
        credential: Arc<GuestCredential>,
    ) -> Self {
        Self { executor, credential }
    }

    fn powershell(script: String) -> Command {
        let script = format!("$ErrorActionPreference = 'Stop'; {script}");
        let mut command = Command::new(POWERSHELL);
        command.args([
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            script.as_str(),
        ]);
        command
    }

    async fn host(&self, script: String) -> Result<Output, ExecutionError> {
        self.executor.execute_async(&mut Self::powershell(script)).await
    }

    /// Runs `body` inside `vm`.
    ///
    /// Each `(name, env)` pair in `params` becomes a script block parameter
    /// `$name`, bound to the value of `env` in the host-side process.
    fn guest_command(
        &self,
        vm: &str,
        params: &[(&str, &str)],
        body: &str,
    ) -> Command {
        let (param_block, argument_list) = if params.is_empty() {
            (String::new(), String::new())
        } else {
            let names: Vec<String> =
                params.iter().map(|(name, _)| format!("${name}")).collect();
            let values: Vec<String> =
                params.iter().map(|(_, env)| format!("$env:{env}")).collect();
            (
                format!("param({}) ", names.join(", ")),
                format!(" -ArgumentList {}", values.join(", ")),
            )
        };
        let script = format!(
            "$password = ConvertTo-SecureString $env:{GUEST_PASSWORD_ENV} \
             -AsPlainText -Force; \
             $credential = New-Object \
             System.Management.Automation.PSCredential \
             ($env:{GUEST_USER_ENV}, $password); \
             Invoke-Command -VMName {} -Credential $credential \
             -ScriptBlock {{ {param_block}$ErrorActionPreference = 'Stop'; \
             {body} }}{argument_list}",
            ps_quote(vm),
        );
        let mut command = Self::powershell(script);
        command
            .env(GUEST_USER_ENV, &self.credential.user)
            .env(GUEST_PASSWORD_ENV, self.credential.password.expose_secret());
        command
    }

    async fn guest(
        &self,
        vm: &str,
        body: &str,
    ) -> Result<Output, ExecutionError> {
        let mut command = self.guest_command(vm, &[], body);
        self.executor.execute_async(&mut command).await
    }
}

#[async_trait]
impl Hypervisor for HyperV {
    async fn vm_state(
        &self,
        name: &str,
    ) -> Result<Option<VmState>, ExecutionError> {
        let output = self
            .host(format!(
                "Get-VM -Name {} -ErrorAction SilentlyContinue | \
                 ForEach-Object {{ $_.State.ToString() }}",
                ps_quote(name)
            ))
            .await?;
        let state = stdout(&output);
        Ok(Some(state).filter(|s| !s.is_empty()).map(|s| VmState::parse(&s)))
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<(), ExecutionError> {
        let name = ps_quote(&spec.name);
        self.host(format!(
            "New-VM -Name {name} -Generation 2 -MemoryStartupBytes {}GB \
             -VHDPath {} -SwitchName {} | Out-Null; \
             Set-VMProcessor -VMName {name} -Count {} \
             -ExposeVirtualizationExtensions $true; \
             Set-VMMemory -VMName {name} -DynamicMemoryEnabled $false; \
             Enable-VMIntegrationService -VMName {name} \
             -Name 'Guest Service Interface'",
            spec.memory_gb,
            ps_quote(spec.disk.as_str()),
            ps_quote(&spec.switch_name),
            spec.cpu_count,
        ))
        .await?;
        Ok(())
    }

    async fn start_vm(&self, name: &str) -> Result<(), ExecutionError> {
        self.host(format!("Start-VM -Name {}", ps_quote(name))).await?;
        Ok(())
    }

    async fn remove_vm(&self, name: &str) -> Result<(), ExecutionError> {
        let name = ps_quote(name);
        self.host(format!(
            "Stop-VM -Name {name} -TurnOff -Force; \
             Remove-VM -Name {name} -Force"
        ))
        .await?;
        Ok(())
    }

    async fn copy_to_guest(
        &self,
        name: &str,
        source: &Utf8Path,
        guest_dir: &str,
    ) -> Result<(), ExecutionError> {
        let file_name = source.file_name().ok_or_else(|| {
            let reason = format!("{source} is not a file");
            ExecutionError::parse("Copy-VMFile", reason)
        })?;
        self.host(format!(
            "Copy-VMFile -Name {} -SourcePath {} -DestinationPath {} \
             -CreateFullPath -FileSource Host -Force",
            ps_quote(name),
            ps_quote(source.as_str()),
            ps_quote(&format!("{guest_dir}\\{file_name}")),
        ))
        .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct PodList {
    items: Vec<serde_json::Value>,
}

#[async_trait]
impl Guest for HyperV {
    fn has_credential(&self) -> bool {
        !self.credential.password.expose_secret().is_empty()
    }

    async fn ping(&self, vm: &str) -> Result<(), ExecutionError> {
        self.guest(vm, "$true").await?;
        Ok(())
    }

    async fn deployment_exists(
        &self,
        vm: &str,
    ) -> Result<bool, ExecutionError> {
        let output = self.guest(vm, "Test-AksEdgeDeployment").await?;
        parse_bool("Test-AksEdgeDeployment", &output)
    }

    async fn deploy_cluster(
        &self,
        vm: &str,
        config_path: &str,
    ) -> Result<(), ExecutionError> {
        self.guest(
            vm,
            &format!(
                "$config = Get-Content -Raw -Path {}; \
                 New-AksEdgeDeployment -JsonConfigString $config -Force \
                 | Out-Null",
                ps_quote(config_path)
            ),
        )
        .await?;
        Ok(())
    }

    async fn connect_cluster(
        &self,
        vm: &str,
        connection: &ArcConnection,
        identity: &ServiceIdentity,
    ) -> Result<(), ExecutionError> {
        // `az` is a native executable, so failures have to be checked by
        // exit code rather than through $ErrorActionPreference.
        let body = format!(
            "az login --service-principal -u {} -p $secret --tenant {} \
             --output none; \
             if ($LASTEXITCODE -ne 0) {{ throw 'az login failed' }}; \
             az account set --subscription {}; \
             if ($LASTEXITCODE -ne 0) {{ throw 'az account set failed' }}; \
             az connectedk8s connect -n {} -g {} -l {} --output none; \
             if ($LASTEXITCODE -ne 0) {{ \
             throw 'az connectedk8s connect failed' }}",
            ps_quote(&identity.app_id),
            ps_quote(&identity.tenant_id),
            ps_quote(&connection.subscription_id),
            ps_quote(&connection.cluster_name),
            ps_quote(&connection.resource_group),
            ps_quote(&connection.location),
        );
        let mut command =
            self.guest_command(vm, &[("secret", ENV_SECRET)], &body);
        command.env(ENV_SECRET, identity.expose_secret());
        self.executor.execute_async(&mut command).await?;
        Ok(())
    }

    async fn read_node_file(
        &self,
        vm: &str,
        path: &str,
    ) -> Result<String, ExecutionError> {
        let node_command = format!("sudo cat {path} 2>/dev/null || true");
        let output = self
            .guest(
                vm,
                &format!(
                    "Invoke-AksEdgeNodeCommand -NodeType Linux -Command {}",
                    ps_quote(&node_command)
                ),
            )
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn push_node_file(
        &self,
        vm: &str,
        guest_source: &str,
        node_path: &str,
    ) -> Result<(), ExecutionError> {
        self.guest(
            vm,
            &format!(
                "Copy-AksEdgeNodeFile -NodeType Linux -FromFile {} \
                 -ToFile {} -PushFile",
                ps_quote(guest_source),
                ps_quote(node_path)
            ),
        )
        .await?;
        Ok(())
    }

    async fn restart_kubelet(&self, vm: &str) -> Result<(), ExecutionError> {
        self.guest(
            vm,
            "Invoke-AksEdgeNodeCommand -NodeType Linux \
             -Command 'sudo systemctl restart kubelet'",
        )
        .await?;
        Ok(())
    }

    async fn running_pods(
        &self,
        vm: &str,
        namespace: &str,
    ) -> Result<usize, ExecutionError> {
        let output = self
            .guest(
                vm,
                &format!(
                    "kubectl get pods -n {} \
                     --field-selector=status.phase=Running -o json",
                    ps_quote(namespace)
                ),
            )
            .await?;
        let pods: PodList = serde_json::from_slice(&output.stdout)
            .map_err(|err| ExecutionError::parse("kubectl get pods", err))?;
        Ok(pods.items.len())
    }
}
