// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::Layer;
use crate::context::RunContext;
use crate::error::{ProvisionError, ToolContext};
use crate::naming;
use crate::stage::Stage;
use crate::tools::ImageBuild;
use async_trait::async_trait;
use camino::Utf8Path;
use slog::info;

/// The golden VM image.
///
/// The build artifact on disk is the only record that the image exists;
/// deleting it forces a rebuild on the next run.
pub struct ImageLayer;

pub(crate) async fn exists(path: &Utf8Path) -> Result<bool, ProvisionError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|err| ProvisionError::io(format!("checking {path}"), err))
}

#[async_trait]
impl Layer for ImageLayer {
    fn stage(&self) -> Stage {
        Stage::Image
    }

    async fn provision(
        &self,
        ctx: &mut RunContext,
    ) -> Result<(), ProvisionError> {
        let vm_name = &ctx.profile.vm_name;
        let artifact =
            naming::image_artifact(&ctx.settings.packer_dir, vm_name);
        if exists(&artifact).await? {
            info!(ctx.log, "golden image already built"; "path" => %artifact);
            return Ok(());
        }

        let identity = ctx.require_identity()?;
        let build = ImageBuild {
            vm_name,
            install_media: &ctx.profile.install_media,
            switch_name: &ctx.profile.switch_name,
            output_dir: naming::image_output_dir(
                &ctx.settings.packer_dir,
                vm_name,
            ),
            identity: &identity,
        };
        info!(ctx.log, "building golden image"; "output" => %build.output_dir);
        ctx.tools.images.build(&build).await.tool_context("image build")?;

        if !exists(&artifact).await? {
            return Err(ProvisionError::ArtifactMissing { path: artifact });
        }
        info!(ctx.log, "golden image built"; "path" => %artifact);
        Ok(())
    }

    /// Deletes the build output. VMs already created from the image keep
    /// their own copy of the disk.
    async fn teardown(
        &self,
        ctx: &mut RunContext,
    ) -> Result<(), ProvisionError> {
        let output = naming::image_output_dir(
            &ctx.settings.packer_dir,
            &ctx.profile.vm_name,
        );
        if !exists(&output).await? {
            info!(ctx.log, "no image build output"; "path" => %output);
            return Ok(());
        }
        fs_err::tokio::remove_dir_all(&output)
            .await
            .map_err(|err| ProvisionError::io("removing image output", err))?;
        info!(ctx.log, "removed image build output"; "path" => %output);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::{operator_identity, test_context, SimulatedSite};
    use std::sync::Arc;

    #[tokio::test]
    async fn standalone_build_needs_credentials() {
        let site = SimulatedSite::new();
        let (mut ctx, _dir) = test_context(&site);

        let err = ImageLayer.provision(&mut ctx).await.unwrap_err();
        assert!(matches!(err, ProvisionError::MissingCredentials));
        assert_eq!(site.mutation_count(), 0);
    }

    #[tokio::test]
    async fn existing_artifact_skips_build() {
        let site = SimulatedSite::new();
        let (ctx, _dir) = test_context(&site);
        let mut ctx =
            ctx.with_fallback_identity(Some(Arc::new(operator_identity())));

        ImageLayer.provision(&mut ctx).await.unwrap();
        assert_eq!(site.mutations(), ["build image acme-ipc-01"]);
        ImageLayer.provision(&mut ctx).await.unwrap();
        assert_eq!(site.mutation_count(), 1);

        ImageLayer.teardown(&mut ctx).await.unwrap();
        let artifact = naming::image_artifact(
            &ctx.settings.packer_dir,
            &ctx.profile.vm_name,
        );
        assert!(!artifact.exists());
        ImageLayer.teardown(&mut ctx).await.unwrap();
    }
}
