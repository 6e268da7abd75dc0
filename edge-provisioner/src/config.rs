// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Customer profiles and run-wide settings

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The profile compiled into the binary, so that the tool is usable without
/// any profile files on disk.
const EMBEDDED_PROFILE: &str = include_str!("../profiles/contoso.toml");

pub const DEFAULT_ENVIRONMENT: &str = "dev";
pub const DEFAULT_DEVOPS_ORGANIZATION: &str =
    "https://dev.azure.com/edge-platform";
pub const DEFAULT_WORKLOAD_NAMESPACE: &str = "edge-apps";
pub const DEFAULT_EXPECTED_PODS: usize = 5;

/// Shape of the edge VM.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct VmShape {
    #[serde(default = "VmShape::default_memory_gb")]
    pub memory_gb: u32,
    #[serde(default = "VmShape::default_cpu_count")]
    pub cpu_count: u32,
    #[serde(default = "VmShape::default_disk_gb")]
    pub disk_gb: u32,
}

impl VmShape {
    fn default_memory_gb() -> u32 {
        16
    }

    fn default_cpu_count() -> u32 {
        4
    }

    fn default_disk_gb() -> u32 {
        128
    }
}

impl Default for VmShape {
    fn default() -> Self {
        Self {
            memory_gb: Self::default_memory_gb(),
            cpu_count: Self::default_cpu_count(),
            disk_gb: Self::default_disk_gb(),
        }
    }
}

/// One customer's deployment target
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CustomerProfile {
    pub name: String,
    pub subscription_id: String,
    pub location: String,
    /// Prefix for every cloud resource name derived from this profile.
    pub prefix: String,
    /// Git repository the GitOps configuration reconciles from.
    pub repo_url: String,
    /// Installation ISO handed to the image build.
    pub install_media: Utf8PathBuf,
    pub vm_name: String,
    pub switch_name: String,
    #[serde(default)]
    pub vm: VmShape,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("profile {name:?} not found in {dir}")]
    ProfileNotFound { name: String, dir: Utf8PathBuf },
    #[error("Failed to read profile from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse profile from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("profile {profile:?} is missing a value for {field}")]
    MissingField { profile: String, field: &'static str },
}

impl CustomerProfile {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let profile: CustomerProfile = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        profile.validate()?;
        Ok(profile)
    }

    /// The profile compiled into the binary.
    pub fn embedded() -> Self {
        toml::from_str(EMBEDDED_PROFILE)
            .expect("embedded profile is valid TOML")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("name", &self.name),
            ("subscription_id", &self.subscription_id),
            ("location", &self.location),
            ("prefix", &self.prefix),
            ("vm_name", &self.vm_name),
            ("switch_name", &self.switch_name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    profile: self.name.clone(),
                    field,
                });
            }
        }
        Ok(())
    }
}

/// Resolves `name` to a profile.
///
/// `<dir>/<name>.toml` wins when it exists. Otherwise only the embedded
/// profile's own name resolves; any other name is an error.
pub fn load_profile(
    dir: &Utf8Path,
    name: &str,
) -> Result<CustomerProfile, ConfigError> {
    let path = dir.join(format!("{}.toml", name.to_lowercase()));
    if path.exists() {
        return CustomerProfile::from_file(&path);
    }

    let embedded = CustomerProfile::embedded();
    if embedded.name.eq_ignore_ascii_case(name) {
        return Ok(embedded);
    }
    Err(ConfigError::ProfileNotFound {
        name: name.to_string(),
        dir: dir.into(),
    })
}

/// A bounded wait: at most `attempts` tries, `interval` apart.
#[derive(Clone, Copy, Debug)]
pub struct Retry {
    pub attempts: u32,
    pub interval: Duration,
}

#[derive(Clone, Debug)]
pub struct PollSettings {
    /// Waiting for a freshly started guest to accept remote commands.
    pub guest_ready: Retry,
    /// Waiting for the connected cluster to show up in the control plane.
    pub cluster_visible: Retry,
    /// Total time allowed for workloads to reach Running.
    pub pods_budget: Duration,
    pub pods_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            guest_ready: Retry {
                attempts: 30,
                interval: Duration::from_secs(10),
            },
            cluster_visible: Retry {
                attempts: 20,
                interval: Duration::from_secs(15),
            },
            pods_budget: Duration::from_secs(600),
            pods_interval: Duration::from_secs(15),
        }
    }
}

/// Everything about a run that does not come from the customer profile.
#[derive(Clone, Debug)]
pub struct Settings {
    pub environment: String,
    pub profile_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    pub terraform_dir: Utf8PathBuf,
    pub packer_dir: Utf8PathBuf,
    /// Where VM disks are copied to, outside of packer's output directory.
    pub vm_disk_dir: Utf8PathBuf,
    pub devops_organization: String,
    pub workload_namespace: String,
    pub expected_pods: usize,
    pub polling: PollSettings,
}

impl Settings {
    /// Settings rooted at `base`, with every other value at its default.
    pub fn with_base_dir(base: &Utf8Path) -> Self {
        Self {
            environment: DEFAULT_ENVIRONMENT.to_string(),
            profile_dir: base.join("profiles"),
            output_dir: base.join("out"),
            terraform_dir: base.join("terraform"),
            packer_dir: base.join("packer"),
            vm_disk_dir: base.join("vms"),
            devops_organization: DEFAULT_DEVOPS_ORGANIZATION.to_string(),
            workload_namespace: DEFAULT_WORKLOAD_NAMESPACE.to_string(),
            expected_pods: DEFAULT_EXPECTED_PODS,
            polling: PollSettings::default(),
        }
    }

    pub fn metrics_path(&self) -> Utf8PathBuf {
        self.output_dir.join("run-metrics.json")
    }

    pub fn log_dir(&self) -> Utf8PathBuf {
        self.output_dir.join("logs")
    }
}
