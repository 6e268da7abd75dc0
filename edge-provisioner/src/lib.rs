// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisions a customer's edge site end to end: remote state, DevOps
//! wiring, a golden VM image, the edge VM with its cluster, and a final
//! check that the GitOps-delivered workloads are running.
//!
//! Every run re-derives what already exists from the target systems, so
//! running it twice is safe and the second run changes nothing.

pub mod config;
pub mod context;
mod error;
pub mod fakes;
pub mod identity;
pub mod layers;
pub mod logging;
pub mod naming;
pub mod orchestrator;
pub mod poll;
pub mod report;
pub mod stage;
pub mod tools;

pub use error::{ProvisionError, ToolContext};
