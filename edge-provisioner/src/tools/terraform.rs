// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{PlanKind, PlanOutcome, Terraform, TerraformInputs, TERRAFORM};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use edge_exec::{BoxedExecutor, ExecutionError};
use tokio::process::Command;

const PLAN_FILE: &str = "tfplan";

/// `terraform plan -detailed-exitcode` exits with this when the plan
/// contains changes.
const PLAN_HAS_CHANGES: i32 = 2;

pub struct TerraformCli {
    executor: BoxedExecutor,
    dir: Utf8PathBuf,
}

impl TerraformCli {
    pub fn new(executor: BoxedExecutor, dir: Utf8PathBuf) -> Self {
        Self { executor, dir }
    }

    fn command(&self, inputs: &TerraformInputs, subcommand: &str) -> Command {
        let mut command = Command::new(TERRAFORM);
        command
            .arg(format!("-chdir={}", self.dir))
            .args([subcommand, "-input=false"])
            .env("ARM_SUBSCRIPTION_ID", &inputs.subscription_id);
        command
    }
}

#[async_trait]
impl Terraform for TerraformCli {
    async fn init(
        &self,
        inputs: &TerraformInputs,
    ) -> Result<(), ExecutionError> {
        let backend = &inputs.backend;
        let mut command = self.command(inputs, "init");
        command.arg("-reconfigure");
        for (key, value) in [
            ("resource_group_name", &backend.resource_group),
            ("storage_account_name", &backend.storage_account),
            ("container_name", &backend.container),
            ("key", &backend.key),
        ] {
            command.arg(format!("-backend-config={key}={value}"));
        }
        self.executor.execute_async(&mut command).await?;
        Ok(())
    }

    async fn plan(
        &self,
        inputs: &TerraformInputs,
        kind: PlanKind,
    ) -> Result<PlanOutcome, ExecutionError> {
        let mut command = self.command(inputs, "plan");
        command.arg("-detailed-exitcode").arg(format!("-out={PLAN_FILE}"));
        if kind == PlanKind::Destroy {
            command.arg("-destroy");
        }
        for (name, value) in [
            ("prefix", &inputs.prefix),
            ("location", &inputs.location),
            ("environment", &inputs.environment),
        ] {
            command.arg("-var").arg(format!("{name}={value}"));
        }

        match self.executor.execute_async(&mut command).await {
            Ok(_) => Ok(PlanOutcome::NoChanges),
            Err(err) if err.exit_code() == Some(PLAN_HAS_CHANGES) => {
                Ok(PlanOutcome::Changes)
            }
            Err(err) => Err(err),
        }
    }

    async fn apply(
        &self,
        inputs: &TerraformInputs,
    ) -> Result<(), ExecutionError> {
        let mut command = self.command(inputs, "apply");
        command.arg(PLAN_FILE);
        self.executor.execute_async(&mut command).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tools::StateBackend;
    use edge_exec::{
        CommandSequence, FakeExecutorBuilder, Input, Output, OutputExt,
    };
    use slog::Logger;

    fn inputs() -> TerraformInputs {
        TerraformInputs {
            subscription_id: "sub-1".to_string(),
            backend: StateBackend {
                resource_group: "ipc-acme-poc-tfstate-rg".to_string(),
                storage_account: "ipcacmepoctfstate".to_string(),
                container: "tfstate".to_string(),
                key: "dev.tfstate".to_string(),
            },
            prefix: "ipc-acme-poc".to_string(),
            location: "eastus".to_string(),
            environment: "dev".to_string(),
        }
    }

    fn cli(sequence: CommandSequence) -> TerraformCli {
        let log = Logger::root(slog::Discard, slog::o!());
        TerraformCli::new(
            FakeExecutorBuilder::new(log)
                .with_sequence(sequence)
                .build()
                .as_executor(),
            "/work/terraform".into(),
        )
    }

    const PLAN: &str = "terraform -chdir=/work/terraform plan -input=false \
                        -detailed-exitcode -out=tfplan \
                        -var prefix=ipc-acme-poc \
                        -var location=eastus -var environment=dev";

    #[tokio::test]
    async fn init_points_at_remote_state() {
        let mut sequence = CommandSequence::new();
        sequence.expect(
            Input::shell(
                "terraform -chdir=/work/terraform init -input=false \
                 -reconfigure \
                 -backend-config=resource_group_name=ipc-acme-poc-tfstate-rg \
                 -backend-config=storage_account_name=ipcacmepoctfstate \
                 -backend-config=container_name=tfstate \
                 -backend-config=key=dev.tfstate",
            )
            .with_env("ARM_SUBSCRIPTION_ID", "sub-1"),
            Output::success(),
        );
        cli(sequence).init(&inputs()).await.unwrap();
    }

    #[tokio::test]
    async fn plan_exit_codes() {
        let mut sequence = CommandSequence::new();
        sequence.expect(Input::shell(PLAN), Output::success());
        sequence.expect(Input::shell(PLAN), Output::exit_code(2));
        sequence.expect(Input::shell(PLAN), Output::failure());
        sequence.expect(
            Input::shell(
                PLAN.replace("-out=tfplan -var", "-out=tfplan -destroy -var"),
            )
            .with_env("ARM_SUBSCRIPTION_ID", "sub-1"),
            Output::exit_code(2),
        );
        let cli = cli(sequence);
        let inputs = inputs();

        assert_eq!(
            cli.plan(&inputs, PlanKind::Apply).await.unwrap(),
            PlanOutcome::NoChanges
        );
        assert_eq!(
            cli.plan(&inputs, PlanKind::Apply).await.unwrap(),
            PlanOutcome::Changes
        );
        let err = cli.plan(&inputs, PlanKind::Apply).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
        assert_eq!(
            cli.plan(&inputs, PlanKind::Destroy).await.unwrap(),
            PlanOutcome::Changes
        );
    }
}
