// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deterministic names for everything the provisioner creates.
//!
//! Every name here is a pure function of the profile and the environment
//! label. Re-runs find what earlier runs created by recomputing these names,
//! so changing any of them orphans existing resources.

use crate::config::CustomerProfile;
use camino::{Utf8Path, Utf8PathBuf};

/// Azure's hard limit on storage account names.
pub const STORAGE_ACCOUNT_MAX_LEN: usize = 24;

pub const STATE_CONTAINER: &str = "tfstate";

/// Deployment environments created in the DevOps project.
pub const DEPLOYMENT_ENVIRONMENTS: [&str; 4] = ["Dev", "Alpha", "Beta", "Prod"];

pub const GITOPS_EXTENSION: &str = "flux";

/// Where the node's cloud credential provider reads its configuration.
pub const NODE_CREDENTIAL_PATH: &str = "/etc/kubernetes/azure.json";

/// Staging location for files copied from the host into the guest.
pub const GUEST_STAGING_DIR: &str = r"C:\aksedge\staging";

/// Deployment configuration baked into the golden image.
pub const GUEST_DEPLOYMENT_CONFIG: &str = r"C:\aksedge\aksedge-config.json";

/// Storage account holding remote terraform state.
///
/// Lowercased, stripped down to ASCII alphanumerics, and truncated to
/// [STORAGE_ACCOUNT_MAX_LEN].
pub fn state_storage_account(prefix: &str) -> String {
    format!("{prefix}tfstate")
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(STORAGE_ACCOUNT_MAX_LEN)
        .collect()
}

pub fn state_resource_group(prefix: &str) -> String {
    format!("{prefix}-tfstate-rg")
}

pub fn state_key(environment: &str) -> String {
    format!("{environment}.tfstate")
}

/// Resource group the terraform definition creates for the workload.
pub fn workload_resource_group(prefix: &str, environment: &str) -> String {
    format!("{prefix}-{environment}-rg")
}

pub fn automation_identity(prefix: &str) -> String {
    format!("sp-{prefix}-automation")
}

pub fn service_connection(prefix: &str) -> String {
    format!("{prefix}-azure")
}

pub fn connected_cluster(profile: &CustomerProfile) -> String {
    format!("{}-{}", profile.prefix, profile.vm_name).to_lowercase()
}

pub fn flux_configuration(prefix: &str) -> String {
    format!("{prefix}-gitops")
}

/// Directory packer writes the image build into.
pub fn image_output_dir(packer_dir: &Utf8Path, vm_name: &str) -> Utf8PathBuf {
    packer_dir.join(format!("output-{vm_name}"))
}

/// The golden image produced by a successful build.
pub fn image_artifact(packer_dir: &Utf8Path, vm_name: &str) -> Utf8PathBuf {
    image_output_dir(packer_dir, vm_name)
        .join("Virtual Hard Disks")
        .join(format!("{vm_name}.vhdx"))
}

/// The VM's own copy of the golden image.
pub fn vm_disk(vm_disk_dir: &Utf8Path, vm_name: &str) -> Utf8PathBuf {
    vm_disk_dir.join(format!("{vm_name}.vhdx"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn storage_account_names_are_bounded_and_clean() {
        for prefix in [
            "",
            "ipc-acme-poc",
            "IPC_Acme.PoC",
            "a-very-long-customer-prefix-that-keeps-going",
            "ünïcödé-prefix",
            "--__--",
        ] {
            let name = state_storage_account(prefix);
            assert!(name.len() <= STORAGE_ACCOUNT_MAX_LEN, "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase()
                    || c.is_ascii_digit()),
                "{name}"
            );
            assert_eq!(name, state_storage_account(prefix));
        }
    }

    #[test]
    fn storage_account_examples() {
        assert_eq!(state_storage_account("ipc-acme-poc"), "ipcacmepoctfstate");
        assert_eq!(state_storage_account("IPC-Acme"), "ipcacmetfstate");
        assert_eq!(
            state_storage_account("contoso-manufacturing-line-7"),
            "contosomanufacturingline"
        );
    }

    #[test]
    fn artifact_lives_under_packer_output() {
        let packer = Utf8Path::new("/work/packer");
        let artifact = image_artifact(packer, "acme-ipc-01");
        assert!(artifact.starts_with(image_output_dir(packer, "acme-ipc-01")));
        assert_eq!(artifact.file_name(), Some("acme-ipc-01.vhdx"));
        assert!(!vm_disk(Utf8Path::new("/work/vms"), "acme-ipc-01")
            .starts_with(packer));
    }
}
