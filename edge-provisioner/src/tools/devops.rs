// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [DevOps] over the `az devops` extension

use super::{
    parse_json, DevOps, ServiceConnection, ServiceConnectionSpec, AZ,
};
use crate::identity::ServiceIdentity;
use async_trait::async_trait;
use edge_exec::{BoxedExecutor, ExecutionError, Output};
use std::io::Write;
use tokio::process::Command;

/// Variable the `azurerm` endpoint command reads the principal secret from.
pub const SERVICE_PRINCIPAL_KEY_ENV: &str =
    "AZURE_DEVOPS_EXT_AZURE_RM_SERVICE_PRINCIPAL_KEY";

const API_VERSION: &str = "7.1";

pub struct AzDevOpsCli {
    executor: BoxedExecutor,
    organization: String,
}

impl AzDevOpsCli {
    pub fn new(executor: BoxedExecutor, organization: String) -> Self {
        Self { executor, organization }
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(AZ);
        command
            .args(args)
            .args(["--organization", self.organization.as_str()]);
        command
    }

    async fn run<I, S>(&self, args: I) -> Result<Output, ExecutionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.executor.execute_async(&mut self.command(args)).await
    }
}

#[async_trait]
impl DevOps for AzDevOpsCli {
    async fn projects(&self) -> Result<Vec<String>, ExecutionError> {
        let output = self
            .run([
                "devops",
                "project",
                "list",
                "--query",
                "value[].name",
                "-o",
                "json",
            ])
            .await?;
        Ok(parse_json("az devops project list", &output)?.unwrap_or_default())
    }

    async fn create_project(&self, name: &str) -> Result<(), ExecutionError> {
        self.run(["devops", "project", "create", "--name", name, "-o", "none"])
            .await?;
        Ok(())
    }

    async fn service_connection(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<ServiceConnection>, ExecutionError> {
        let query = format!(
            "[?name=='{name}'] | [0].{{id:id, \
             appId:authorization.parameters.serviceprincipalid}}"
        );
        let output = self
            .run([
                "devops",
                "service-endpoint",
                "list",
                "--project",
                project,
                "--query",
                query.as_str(),
                "-o",
                "json",
            ])
            .await?;
        parse_json("az devops service-endpoint list", &output)
    }

    async fn create_service_connection(
        &self,
        project: &str,
        spec: &ServiceConnectionSpec,
        identity: &ServiceIdentity,
    ) -> Result<(), ExecutionError> {
        let mut command = self.command([
            "devops",
            "service-endpoint",
            "azurerm",
            "create",
            "--project",
            project,
            "--name",
            spec.name.as_str(),
            "--azure-rm-service-principal-id",
            identity.app_id.as_str(),
            "--azure-rm-subscription-id",
            spec.subscription_id.as_str(),
            "--azure-rm-subscription-name",
            spec.subscription_name.as_str(),
            "--azure-rm-tenant-id",
            identity.tenant_id.as_str(),
            "-o",
            "none",
        ]);
        // Only this child sees the secret; it is never in our own
        // environment or on a command line.
        command.env(SERVICE_PRINCIPAL_KEY_ENV, identity.expose_secret());
        self.executor.execute_async(&mut command).await?;
        Ok(())
    }

    async fn delete_service_connection(
        &self,
        project: &str,
        id: &str,
    ) -> Result<(), ExecutionError> {
        self.run([
            "devops",
            "service-endpoint",
            "delete",
            "--project",
            project,
            "--id",
            id,
            "--yes",
        ])
        .await?;
        Ok(())
    }

    async fn environments(
        &self,
        project: &str,
    ) -> Result<Vec<String>, ExecutionError> {
        let route = format!("project={project}");
        let output = self
            .run([
                "devops",
                "invoke",
                "--area",
                "distributedtask",
                "--resource",
                "environments",
                "--route-parameters",
                route.as_str(),
                "--api-version",
                API_VERSION,
                "--query",
                "value[].name",
                "-o",
                "json",
            ])
            .await?;
        Ok(parse_json("az devops invoke environments", &output)?
            .unwrap_or_default())
    }

    async fn create_environment(
        &self,
        project: &str,
        name: &str,
    ) -> Result<(), ExecutionError> {
        let body = serde_json::json!({ "name": name, "description": "" });
        let start_error = |err| ExecutionError::ExecutionStart {
            command: format!("{AZ} devops invoke (environment {name})"),
            err,
        };
        let mut file =
            camino_tempfile::NamedUtf8TempFile::new().map_err(start_error)?;
        file.write_all(body.to_string().as_bytes()).map_err(start_error)?;

        let route = format!("project={project}");
        self.run([
            "devops",
            "invoke",
            "--area",
            "distributedtask",
            "--resource",
            "environments",
            "--route-parameters",
            route.as_str(),
            "--api-version",
            API_VERSION,
            "--http-method",
            "POST",
            "--in-file",
            file.path().as_str(),
            "-o",
            "none",
        ])
        .await?;
        Ok(())
    }
}
