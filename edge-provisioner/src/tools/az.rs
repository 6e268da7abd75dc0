// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [Cloud] over the `az` CLI

use super::{
    parse_bool, parse_json, stdout, Account, Cloud, ConnectedCluster,
    FluxConfiguration, AZ,
};
use crate::identity::ServiceIdentity;
use async_trait::async_trait;
use edge_exec::{BoxedExecutor, ExecutionError, Output};
use secrecy::SecretString;
use serde::Deserialize;
use tokio::process::Command;

const CLUSTER_TYPE: &str = "connectedClusters";

pub struct AzCli {
    executor: BoxedExecutor,
}

impl AzCli {
    pub fn new(executor: BoxedExecutor) -> Self {
        Self { executor }
    }

    async fn run<I, S>(&self, args: I) -> Result<Output, ExecutionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(AZ);
        command.args(args);
        self.executor.execute_async(&mut command).await
    }

    /// Runs a query printing a single tsv value, where empty means absent.
    async fn query_value<I, S>(
        &self,
        args: I,
    ) -> Result<Option<String>, ExecutionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let value = stdout(&self.run(args).await?);
        Ok(Some(value).filter(|v| !v.is_empty()))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetCredential {
    app_id: String,
    password: String,
    tenant: String,
}

#[async_trait]
impl Cloud for AzCli {
    async fn account(&self) -> Result<Account, ExecutionError> {
        let output = self
            .run([
                "account",
                "show",
                "--query",
                "{id:id, tenantId:tenantId}",
                "-o",
                "json",
            ])
            .await?;
        parse_json("az account show", &output)?.ok_or_else(|| {
            ExecutionError::parse("az account show", "no active account")
        })
    }

    async fn set_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<(), ExecutionError> {
        self.run(["account", "set", "--subscription", subscription_id])
            .await?;
        Ok(())
    }

    async fn group_exists(&self, name: &str) -> Result<bool, ExecutionError> {
        let output = self.run(["group", "exists", "-n", name]).await?;
        parse_bool("az group exists", &output)
    }

    async fn create_group(
        &self,
        name: &str,
        location: &str,
    ) -> Result<(), ExecutionError> {
        self.run(["group", "create", "-n", name, "-l", location, "-o", "none"])
            .await?;
        Ok(())
    }

    async fn storage_account_exists(
        &self,
        group: &str,
        name: &str,
    ) -> Result<bool, ExecutionError> {
        let query = format!("[?name=='{name}'].name");
        let found = self
            .query_value([
                "storage",
                "account",
                "list",
                "-g",
                group,
                "--query",
                query.as_str(),
                "-o",
                "tsv",
            ])
            .await?;
        Ok(found.is_some())
    }

    async fn create_storage_account(
        &self,
        group: &str,
        name: &str,
        location: &str,
    ) -> Result<(), ExecutionError> {
        self.run([
            "storage",
            "account",
            "create",
            "-n",
            name,
            "-g",
            group,
            "-l",
            location,
            "--sku",
            "Standard_LRS",
            "--kind",
            "StorageV2",
            "--min-tls-version",
            "TLS1_2",
            "--allow-blob-public-access",
            "false",
            "-o",
            "none",
        ])
        .await?;
        Ok(())
    }

    async fn container_exists(
        &self,
        account: &str,
        name: &str,
    ) -> Result<bool, ExecutionError> {
        let output = self
            .run([
                "storage",
                "container",
                "exists",
                "--account-name",
                account,
                "-n",
                name,
                "--auth-mode",
                "login",
                "--query",
                "exists",
                "-o",
                "tsv",
            ])
            .await?;
        parse_bool("az storage container exists", &output)
    }

    async fn create_container(
        &self,
        account: &str,
        name: &str,
    ) -> Result<(), ExecutionError> {
        self.run([
            "storage",
            "container",
            "create",
            "--account-name",
            account,
            "-n",
            name,
            "--auth-mode",
            "login",
            "-o",
            "none",
        ])
        .await?;
        Ok(())
    }

    async fn service_principal(
        &self,
        display_name: &str,
    ) -> Result<Option<String>, ExecutionError> {
        self.query_value([
            "ad",
            "sp",
            "list",
            "--display-name",
            display_name,
            "--query",
            "[0].appId",
            "-o",
            "tsv",
        ])
        .await
    }

    async fn create_service_principal(
        &self,
        display_name: &str,
        scope: &str,
    ) -> Result<String, ExecutionError> {
        self.query_value([
            "ad",
            "sp",
            "create-for-rbac",
            "--display-name",
            display_name,
            "--role",
            "Contributor",
            "--scopes",
            scope,
            "--create-password",
            "false",
            "--query",
            "appId",
            "-o",
            "tsv",
        ])
        .await?
        .ok_or_else(|| {
            ExecutionError::parse("az ad sp create-for-rbac", "no appId")
        })
    }

    async fn reset_credential(
        &self,
        app_id: &str,
        end_date: &str,
    ) -> Result<ServiceIdentity, ExecutionError> {
        let mut command = Command::new(AZ);
        command.args([
            "ad",
            "sp",
            "credential",
            "reset",
            "--id",
            app_id,
            "--end-date",
            end_date,
            "-o",
            "json",
        ]);
        // stdout carries the new secret.
        let output = self.executor.execute_redacted_async(&mut command).await?;
        let reset: ResetCredential =
            serde_json::from_slice(&output.stdout).map_err(|_| {
                ExecutionError::parse(
                    "az ad sp credential reset",
                    "unexpected output",
                )
            })?;
        Ok(ServiceIdentity {
            app_id: reset.app_id,
            tenant_id: reset.tenant,
            secret: SecretString::from(reset.password),
        })
    }

    async fn delete_service_principal(
        &self,
        app_id: &str,
    ) -> Result<(), ExecutionError> {
        // Deleting the application removes its service principal as well.
        self.run(["ad", "app", "delete", "--id", app_id]).await?;
        Ok(())
    }

    async fn client_id(
        &self,
        principal_id: &str,
    ) -> Result<Option<String>, ExecutionError> {
        let filter = format!("id eq '{principal_id}'");
        self.query_value([
            "ad",
            "sp",
            "list",
            "--filter",
            filter.as_str(),
            "--query",
            "[0].appId",
            "-o",
            "tsv",
        ])
        .await
    }

    async fn connected_cluster(
        &self,
        group: &str,
        name: &str,
    ) -> Result<Option<ConnectedCluster>, ExecutionError> {
        let query = format!(
            "[?name=='{name}'] | [0].{{name:name, \
             principalId:identity.principalId, tenantId:identity.tenantId}}"
        );
        let output = self
            .run([
                "connectedk8s",
                "list",
                "-g",
                group,
                "--query",
                query.as_str(),
                "-o",
                "json",
            ])
            .await?;
        parse_json("az connectedk8s list", &output)
    }

    async fn delete_connected_cluster(
        &self,
        group: &str,
        name: &str,
    ) -> Result<(), ExecutionError> {
        self.run(["connectedk8s", "delete", "-g", group, "-n", name, "--yes"])
            .await?;
        Ok(())
    }

    async fn extensions(
        &self,
        group: &str,
        cluster: &str,
    ) -> Result<Vec<String>, ExecutionError> {
        let output = self
            .run([
                "k8s-extension",
                "list",
                "-g",
                group,
                "-c",
                cluster,
                "-t",
                CLUSTER_TYPE,
                "--query",
                "[].name",
                "-o",
                "json",
            ])
            .await?;
        Ok(parse_json("az k8s-extension list", &output)?.unwrap_or_default())
    }

    async fn create_flux_extension(
        &self,
        group: &str,
        cluster: &str,
        name: &str,
    ) -> Result<(), ExecutionError> {
        self.run([
            "k8s-extension",
            "create",
            "-g",
            group,
            "-c",
            cluster,
            "-t",
            CLUSTER_TYPE,
            "-n",
            name,
            "--extension-type",
            "microsoft.flux",
            "-o",
            "none",
        ])
        .await?;
        Ok(())
    }

    async fn flux_configurations(
        &self,
        group: &str,
        cluster: &str,
    ) -> Result<Vec<String>, ExecutionError> {
        let output = self
            .run([
                "k8s-configuration",
                "flux",
                "list",
                "-g",
                group,
                "-c",
                cluster,
                "-t",
                CLUSTER_TYPE,
                "--query",
                "[].name",
                "-o",
                "json",
            ])
            .await?;
        Ok(parse_json("az k8s-configuration flux list", &output)?
            .unwrap_or_default())
    }

    async fn create_flux_configuration(
        &self,
        group: &str,
        cluster: &str,
        config: &FluxConfiguration,
    ) -> Result<(), ExecutionError> {
        let kustomization =
            format!("name=apps path={} prune=true", config.path);
        let mut args = vec![
            "k8s-configuration",
            "flux",
            "create",
            "-g",
            group,
            "-c",
            cluster,
            "-t",
            CLUSTER_TYPE,
            "-n",
            config.name.as_str(),
            "--namespace",
            "flux-system",
            "--scope",
            "cluster",
            "-u",
            config.url.as_str(),
            "--branch",
            config.branch.as_str(),
            "--kustomization",
        ];
        args.extend(kustomization.split(' '));
        args.extend(["-o", "none"]);
        self.run(args).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use edge_exec::{CommandSequence, FakeExecutorBuilder, Input, OutputExt};
    use slog::Logger;

    fn az(args: &[&str]) -> Input {
        Input::new(AZ, args.to_vec())
    }

    fn cli(sequence: CommandSequence) -> AzCli {
        let log = Logger::root(slog::Discard, slog::o!());
        AzCli::new(
            FakeExecutorBuilder::new(log)
                .with_sequence(sequence)
                .build()
                .as_executor(),
        )
    }

    #[tokio::test]
    async fn account_and_groups() {
        let mut sequence = CommandSequence::new();
        sequence.expect(
            az(&[
                "account",
                "show",
                "--query",
                "{id:id, tenantId:tenantId}",
                "-o",
                "json",
            ]),
            Output::success()
                .set_stdout(r#"{"id": "sub-1", "tenantId": "tenant-1"}"#),
        );
        sequence.expect(
            az(&["group", "exists", "-n", "ipc-acme-poc-tfstate-rg"]),
            Output::success().set_stdout("false\n"),
        );
        sequence.expect(
            az(&["group", "exists", "-n", "ipc-acme-poc-dev-rg"]),
            Output::success().set_stdout("maybe\n"),
        );
        let cli = cli(sequence);

        let account = cli.account().await.unwrap();
        assert_eq!(account.subscription_id, "sub-1");
        assert_eq!(account.tenant_id, "tenant-1");
        assert!(!cli.group_exists("ipc-acme-poc-tfstate-rg").await.unwrap());
        let err = cli.group_exists("ipc-acme-poc-dev-rg").await.unwrap_err();
        assert!(matches!(err, ExecutionError::ParseFailure(_)));
    }

    #[tokio::test]
    async fn credential_reset_is_redacted() {
        let mut sequence = CommandSequence::new();
        sequence.expect(
            az(&[
                "ad",
                "sp",
                "credential",
                "reset",
                "--id",
                "app-1",
                "--end-date",
                "2027-01-17",
                "-o",
                "json",
            ]),
            Output::success().set_stdout(
                r#"{"appId": "app-1", "password": "hunter2", "tenant": "t"}"#,
            ),
        );
        let identity = cli(sequence)
            .reset_credential("app-1", "2027-01-17")
            .await
            .unwrap();
        assert_eq!(identity.app_id, "app-1");
        assert_eq!(identity.tenant_id, "t");
        assert_eq!(identity.expose_secret(), "hunter2");
    }

    #[tokio::test]
    async fn principal_lookup_treats_empty_as_absent() {
        let mut sequence = CommandSequence::new();
        sequence.expect(
            az(&[
                "ad",
                "sp",
                "list",
                "--filter",
                "id eq 'principal-1'",
                "--query",
                "[0].appId",
                "-o",
                "tsv",
            ]),
            Output::success().set_stdout("\n"),
        );
        assert_eq!(cli(sequence).client_id("principal-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn connected_cluster_identity() {
        let query = "[?name=='ipc-acme-poc-acme-ipc-01'] | [0].{name:name, \
                     principalId:identity.principalId, \
                     tenantId:identity.tenantId}";
        let list = |stdout: &str| {
            (
                az(&[
                    "connectedk8s",
                    "list",
                    "-g",
                    "ipc-acme-poc-dev-rg",
                    "--query",
                    query,
                    "-o",
                    "json",
                ]),
                Output::success().set_stdout(stdout),
            )
        };
        let mut sequence = CommandSequence::new();
        let (input, output) = list("");
        sequence.expect(input, output);
        let (input, output) = list(
            r#"{"name": "ipc-acme-poc-acme-ipc-01", "principalId": "p-1",
                "tenantId": "t-1"}"#,
        );
        sequence.expect(input, output);
        let cli = cli(sequence);

        let name = "ipc-acme-poc-acme-ipc-01";
        assert_eq!(
            cli.connected_cluster("ipc-acme-poc-dev-rg", name).await.unwrap(),
            None
        );
        let cluster = cli
            .connected_cluster("ipc-acme-poc-dev-rg", name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cluster.principal_id.as_deref(), Some("p-1"));
        assert_eq!(cluster.tenant_id.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn flux_configuration_arguments() {
        let mut sequence = CommandSequence::new();
        sequence.expect_ok(format!(
            "{AZ} k8s-configuration flux create -g rg -c cluster \
             -t connectedClusters -n ipc-acme-poc-gitops \
             --namespace flux-system --scope cluster \
             -u https://example.com/repo --branch main \
             --kustomization name=apps path=./clusters/dev prune=true \
             -o none"
        ));
        let config = FluxConfiguration {
            name: "ipc-acme-poc-gitops".to_string(),
            url: "https://example.com/repo".to_string(),
            branch: "main".to_string(),
            path: "./clusters/dev".to_string(),
        };
        cli(sequence)
            .create_flux_configuration("rg", "cluster", &config)
            .await
            .unwrap();
    }
}
