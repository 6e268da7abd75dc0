// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use edge_provisioner::config::{
    PollSettings, Settings, DEFAULT_DEVOPS_ORGANIZATION, DEFAULT_ENVIRONMENT,
    DEFAULT_EXPECTED_PODS, DEFAULT_WORKLOAD_NAMESPACE,
};
use edge_provisioner::context::Tools;
use edge_provisioner::identity::ServiceIdentity;
use edge_provisioner::logging;
use edge_provisioner::orchestrator::{
    AutoApprove, ConfirmationGate, LinePrompt, Orchestrator, RunRequest,
};
use edge_provisioner::stage::{Mode, Stage, StageFilter};
use edge_provisioner::tools::{
    GuestCredential, GUEST_PASSWORD_ENV, GUEST_USER_ENV,
};
use secrecy::SecretString;
use slog::{info, warn};
use std::io::BufReader;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LayerArg {
    All,
    Infra,
    Devops,
    Image,
    Edge,
    Validate,
}

impl LayerArg {
    fn stages(self) -> Vec<Stage> {
        match self {
            LayerArg::All => Stage::ALL.to_vec(),
            LayerArg::Infra => vec![Stage::Infrastructure],
            LayerArg::Devops => vec![Stage::DevOps],
            LayerArg::Image => vec![Stage::Image],
            LayerArg::Edge => vec![Stage::Edge],
            LayerArg::Validate => vec![Stage::Validation],
        }
    }
}

/// Provision (or tear down) a customer's edge site.
///
/// Configuration and preflight checks always run. Unless `--yes` is given,
/// nothing is changed until the operator types YES (or DESTROY with
/// `--destroy`).
#[derive(Parser)]
#[command(name = "edge-provision", version)]
struct Args {
    /// Customer profile to provision
    #[clap(long)]
    profile: String,

    /// Environment label used in resource names and the GitOps path
    #[clap(long, default_value = DEFAULT_ENVIRONMENT)]
    environment: String,

    /// Tear down instead of provisioning
    #[clap(long)]
    destroy: bool,

    /// Layers to run (repeatable)
    #[clap(long = "layer", value_enum, default_value = "all")]
    layers: Vec<LayerArg>,

    /// Skip the interactive confirmation
    #[clap(long)]
    yes: bool,

    /// Directory holding customer profiles
    #[clap(long, default_value = "profiles")]
    profile_dir: Utf8PathBuf,

    /// Directory for the run report and log files
    #[clap(long, default_value = "out")]
    output_dir: Utf8PathBuf,

    /// Directory holding the terraform definition
    #[clap(long, default_value = "terraform")]
    terraform_dir: Utf8PathBuf,

    /// Directory holding the packer template
    #[clap(long, default_value = "packer")]
    packer_dir: Utf8PathBuf,

    /// Directory the VM's disk is copied into
    #[clap(long, default_value = "vms")]
    vm_disk_dir: Utf8PathBuf,

    /// Local administrator of the edge VM; the password is read from
    /// EDGE_GUEST_PASSWORD
    #[clap(long, env = GUEST_USER_ENV, default_value = "Administrator")]
    guest_user: String,

    /// DevOps organization URL
    #[clap(
        long,
        env = "EDGE_DEVOPS_ORG",
        default_value = DEFAULT_DEVOPS_ORGANIZATION
    )]
    devops_organization: String,

    /// Namespace the GitOps workloads run in
    #[clap(long, default_value = DEFAULT_WORKLOAD_NAMESPACE)]
    workload_namespace: String,

    /// Running pods required for validation to pass
    #[clap(long, default_value_t = DEFAULT_EXPECTED_PODS)]
    expected_pods: usize,

    /// Log debug output to the terminal too
    #[clap(short, long)]
    verbose: bool,
}

impl Args {
    fn mode(&self) -> Mode {
        if self.destroy {
            Mode::Teardown
        } else {
            Mode::Provision
        }
    }

    fn filter(&self) -> StageFilter {
        StageFilter::only(self.layers.iter().flat_map(|l| l.stages()))
    }

    fn settings(&self) -> Settings {
        Settings {
            environment: self.environment.clone(),
            profile_dir: self.profile_dir.clone(),
            output_dir: self.output_dir.clone(),
            terraform_dir: self.terraform_dir.clone(),
            packer_dir: self.packer_dir.clone(),
            vm_disk_dir: self.vm_disk_dir.clone(),
            devops_organization: self.devops_organization.clone(),
            workload_namespace: self.workload_namespace.clone(),
            expected_pods: self.expected_pods,
            polling: PollSettings::default(),
        }
    }

    /// The guest credential. The password may be empty; preflight rejects
    /// that when a selected stage signs into the guest.
    fn guest_credential(&self) -> GuestCredential {
        let password = std::env::var(GUEST_PASSWORD_ENV).unwrap_or_default();
        GuestCredential {
            user: self.guest_user.clone(),
            password: SecretString::from(password),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = args.settings();

    let log_dir = settings.log_dir();
    let (log, _guard, log_path) = logging::init(&log_dir, args.verbose)
        .with_context(|| format!("failed to create log in {log_dir}"))?;
    info!(log, "logging to {}", log_path);

    let guest_credential = args.guest_credential();
    let fallback_identity = ServiceIdentity::from_env();
    if fallback_identity.is_some() {
        info!(log, "automation identity supplied through the environment");
    }

    let tools = Tools::host(&log, &settings, guest_credential);
    let gate: Box<dyn ConfirmationGate> = if args.yes {
        warn!(log, "confirmation bypassed with --yes");
        Box::new(AutoApprove)
    } else {
        Box::new(LinePrompt::new(
            BufReader::new(std::io::stdin()),
            std::io::stdout(),
        ))
    };

    let mut orchestrator = Orchestrator::new(log.clone(), tools, gate)
        .with_fallback_identity(fallback_identity);
    let outcome = orchestrator
        .run(RunRequest {
            profile: args.profile.clone(),
            mode: args.mode(),
            filter: args.filter(),
            settings,
        })
        .await;

    outcome
        .result
        .with_context(|| format!("{} failed; see {log_path}", args.mode()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layer_flags_select_stages() {
        let args = Args::parse_from([
            "edge-provision",
            "--profile",
            "acme",
            "--layer",
            "edge",
            "--layer",
            "devops",
        ]);
        assert_eq!(
            args.filter().plan(Mode::Provision),
            [
                Stage::Configuration,
                Stage::Preflight,
                Stage::DevOps,
                Stage::Edge
            ]
        );

        let args = Args::parse_from(["edge-provision", "--profile", "acme"]);
        assert_eq!(args.filter(), StageFilter::all());
        assert_eq!(args.mode(), Mode::Provision);
        assert_eq!(args.settings().environment, "dev");
    }
}
