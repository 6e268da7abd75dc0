// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running the external tools the provisioner drives (`az`, `terraform`,
//! `packer`, PowerShell) behind a swappable [Executor].

mod error;
mod executor;
mod input;
mod output;

pub use error::*;
pub use executor::*;
pub use input::Input;
pub use output::{Output, OutputExt};
