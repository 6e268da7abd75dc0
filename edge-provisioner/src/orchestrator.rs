// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs the selected stages in order and records how it went.

use crate::config::{load_profile, Settings};
use crate::context::{RunContext, Tools};
use crate::error::ProvisionError;
use crate::identity::ServiceIdentity;
use crate::layers;
use crate::report::{RunReport, RunStatus};
use crate::stage::{Mode, Stage, StageFilter};
use slog::{error, info, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::time::Instant;

/// Logs the outcome of a step; a failure carries the error and its
/// causes.
macro_rules! info_or_error {
    ($logger:expr, $result:expr, $($tt:tt)*) => {
        match &$result {
            Ok(_) => ::slog::info!($logger, $($tt)*),
            Err(err) => ::slog::error!(
                $logger,
                $($tt)*;
                "error" => InlineErrorChain::new(err),
            ),
        }
    };
}

/// Asks the operator to approve a run before anything is changed.
pub trait ConfirmationGate: Send {
    /// Shows `prompt` and returns whether the operator answered with
    /// exactly `phrase`.
    fn confirm(&mut self, prompt: &str, phrase: &str) -> std::io::Result<bool>;
}

/// Approves every run without asking.
pub struct AutoApprove;

impl ConfirmationGate for AutoApprove {
    fn confirm(
        &mut self,
        _prompt: &str,
        _phrase: &str,
    ) -> std::io::Result<bool> {
        Ok(true)
    }
}

/// Reads one line of confirmation.
///
/// Only the line terminator is stripped before comparing, so `yes`,
/// ` YES` and `YES ` are all refusals.
pub struct LinePrompt<R, W> {
    input: R,
    output: W,
}

impl<R, W> LinePrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead + Send, W: Write + Send> ConfirmationGate for LinePrompt<R, W> {
    fn confirm(&mut self, prompt: &str, phrase: &str) -> std::io::Result<bool> {
        write!(self.output, "{prompt}\nType {phrase} to continue: ")?;
        self.output.flush()?;

        let mut line = String::new();
        self.input.read_line(&mut line)?;
        let answer = line.strip_suffix('\n').unwrap_or(&line);
        let answer = answer.strip_suffix('\r').unwrap_or(answer);
        Ok(answer == phrase)
    }
}

/// What to run.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub profile: String,
    pub mode: Mode,
    pub filter: StageFilter,
    pub settings: Settings,
}

/// The report is produced for every run, even one that failed before
/// touching anything.
pub struct RunOutcome {
    pub report: RunReport,
    pub result: Result<(), ProvisionError>,
}

pub struct Orchestrator {
    log: Logger,
    tools: Tools,
    gate: Box<dyn ConfirmationGate>,
    fallback_identity: Option<Arc<ServiceIdentity>>,
}

impl Orchestrator {
    pub fn new(
        log: Logger,
        tools: Tools,
        gate: Box<dyn ConfirmationGate>,
    ) -> Self {
        Self { log, tools, gate, fallback_identity: None }
    }

    /// An identity to use when the DevOps layer does not run.
    pub fn with_fallback_identity(
        mut self,
        identity: Option<ServiceIdentity>,
    ) -> Self {
        self.fallback_identity = identity.map(Arc::new);
        self
    }

    pub async fn run(&mut self, request: RunRequest) -> RunOutcome {
        let start = Instant::now();
        let mut report = RunReport::new(
            &request.profile,
            &request.settings.environment,
            request.mode,
        );
        let result = self.execute(&request, &mut report).await;
        report.total_seconds = start.elapsed().as_secs_f64();
        if let Err(err) = &result {
            report.fail(err);
        }

        let path = request.settings.metrics_path();
        let result = match (result, report.write(&path).await) {
            (result, Ok(())) => {
                info!(self.log, "wrote run report"; "path" => %path);
                result
            }
            (Ok(()), Err(err)) => Err(ProvisionError::Report { path, err }),
            (Err(run_err), Err(err)) => {
                error!(
                    self.log,
                    "failed to write run report";
                    "path" => %path,
                    "error" => InlineErrorChain::new(&err),
                );
                Err(run_err)
            }
        };
        info_or_error!(
            self.log,
            result,
            "{} {} ({:.1}s)",
            request.mode,
            if result.is_ok() { "succeeded" } else { "failed" },
            report.total_seconds
        );
        RunOutcome { report, result }
    }

    async fn execute(
        &mut self,
        request: &RunRequest,
        report: &mut RunReport,
    ) -> Result<(), ProvisionError> {
        let settings = &request.settings;
        let mode = request.mode;

        let start = Instant::now();
        let loaded = load_profile(&settings.profile_dir, &request.profile);
        report.record(
            Stage::Configuration,
            start.elapsed().as_secs_f64(),
            RunStatus::of(&loaded),
        );
        let profile = loaded?;
        report.profile = profile.name.clone();

        let stages = request.filter.plan(mode);
        let names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
        info!(
            self.log,
            "loaded profile";
            "profile" => &profile.name,
            "subscription" => &profile.subscription_id,
            "prefix" => &profile.prefix,
            "environment" => &settings.environment,
            "mode" => %mode,
            "stages" => names.join(", "),
        );

        let prompt = format!(
            "About to {mode} {} ({}) in environment {}, stages: {}",
            profile.name,
            profile.prefix,
            settings.environment,
            names.join(", "),
        );
        let phrase = mode.confirmation_phrase();
        let confirmed = self
            .gate
            .confirm(&prompt, phrase)
            .map_err(|err| ProvisionError::io("reading confirmation", err))?;
        if !confirmed {
            warn!(self.log, "confirmation not given"; "expected" => phrase);
            return Err(ProvisionError::Aborted);
        }

        let mut ctx = RunContext::new(
            self.log.clone(),
            profile,
            settings.clone(),
            self.tools.clone(),
        )
        .with_fallback_identity(self.fallback_identity.clone())
        .with_plan(mode, stages.clone());

        for stage in stages {
            let Some(layer) = layers::for_stage(stage) else {
                continue;
            };
            let stage = layer.stage();
            let log = self.log.new(slog::o!("stage" => stage.name()));
            ctx.log = log.clone();

            info!(log, "[{}] starting {}", stage, mode);
            let start = Instant::now();
            let result = layer.run(&mut ctx, mode).await;
            let duration = start.elapsed();
            info_or_error!(
                log,
                result,
                "[{}] {} ({:?})",
                stage,
                if result.is_ok() { "succeeded" } else { "failed" },
                duration
            );
            let status = RunStatus::of(&result);
            report.record(stage, duration.as_secs_f64(), status);
            result?;
        }
        Ok(())
    }
}
