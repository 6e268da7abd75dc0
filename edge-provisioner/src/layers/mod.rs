// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The provisioning layers.
//!
//! Each layer works out what is already in place by asking the target
//! systems, and only changes what is missing. Nothing is remembered between
//! runs, and no layer assumes an earlier one ran in the same process.

use crate::context::RunContext;
use crate::error::ProvisionError;
use crate::stage::{Mode, Stage};
use async_trait::async_trait;

mod devops;
mod edge;
mod image;
mod infra;
mod preflight;
mod validate;

pub use devops::DevOpsLayer;
pub use edge::EdgeLayer;
pub use image::ImageLayer;
pub use infra::InfraLayer;
pub use preflight::{PreflightLayer, REQUIRED_ENDPOINTS};
pub use validate::ValidationLayer;

#[async_trait]
pub trait Layer: Send + Sync {
    fn stage(&self) -> Stage;

    /// Brings this layer's resources to the desired state.
    async fn provision(&self, ctx: &mut RunContext)
        -> Result<(), ProvisionError>;

    /// Removes this layer's resources, skipping any that are already gone.
    async fn teardown(
        &self,
        _ctx: &mut RunContext,
    ) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn run(
        &self,
        ctx: &mut RunContext,
        mode: Mode,
    ) -> Result<(), ProvisionError> {
        match mode {
            Mode::Provision => self.provision(ctx).await,
            Mode::Teardown => self.teardown(ctx).await,
        }
    }
}

/// The layer implementing `stage`, if any. Configuration is handled by the
/// orchestrator itself.
pub fn for_stage(stage: Stage) -> Option<Box<dyn Layer>> {
    match stage {
        Stage::Configuration => None,
        Stage::Preflight => Some(Box::new(PreflightLayer)),
        Stage::Infrastructure => Some(Box::new(InfraLayer)),
        Stage::DevOps => Some(Box::new(DevOpsLayer)),
        Stage::Image => Some(Box::new(ImageLayer)),
        Stage::Edge => Some(Box::new(EdgeLayer)),
        Stage::Validation => Some(Box::new(ValidationLayer)),
    }
}
