// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{ImageBuild, ImageBuilder, PACKER};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use edge_exec::{BoxedExecutor, ExecutionError};
use tokio::process::Command;

pub struct PackerCli {
    executor: BoxedExecutor,
    dir: Utf8PathBuf,
}

impl PackerCli {
    pub fn new(executor: BoxedExecutor, dir: Utf8PathBuf) -> Self {
        Self { executor, dir }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(PACKER);
        command.args(args).current_dir(&self.dir);
        command
    }
}

#[async_trait]
impl ImageBuilder for PackerCli {
    async fn build(
        &self,
        build: &ImageBuild<'_>,
    ) -> Result<(), ExecutionError> {
        let mut init = self.command(&["init", "."]);
        self.executor.execute_async(&mut init).await?;

        // Build variables, including the secret, are read by packer from
        // PKR_VAR_* in its own environment.
        let mut command = self.command(&["build", "-force", "."]);
        command
            .env("PKR_VAR_vm_name", build.vm_name)
            .env("PKR_VAR_install_media", build.install_media)
            .env("PKR_VAR_switch_name", build.switch_name)
            .env("PKR_VAR_output_directory", &build.output_dir)
            .env("PKR_VAR_client_id", &build.identity.app_id)
            .env("PKR_VAR_tenant_id", &build.identity.tenant_id)
            .env("PKR_VAR_client_secret", build.identity.expose_secret());
        self.executor.execute_async(&mut command).await?;
        Ok(())
    }
}
