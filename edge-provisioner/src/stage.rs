// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ordered stages of a run and which of them to execute

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Configuration,
    Preflight,
    Infrastructure,
    #[serde(rename = "devops")]
    DevOps,
    Image,
    Edge,
    Validation,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ALL: [Stage; 7] = [
        Stage::Configuration,
        Stage::Preflight,
        Stage::Infrastructure,
        Stage::DevOps,
        Stage::Image,
        Stage::Edge,
        Stage::Validation,
    ];

    /// Stages that change external systems and can be selected by the
    /// operator. The others always run.
    pub fn is_selectable(self) -> bool {
        !matches!(self, Stage::Configuration | Stage::Preflight)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Configuration => "configuration",
            Stage::Preflight => "preflight",
            Stage::Infrastructure => "infrastructure",
            Stage::DevOps => "devops",
            Stage::Image => "image",
            Stage::Edge => "edge",
            Stage::Validation => "validation",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Provision,
    Teardown,
}

impl Mode {
    /// What the operator must type, exactly, to let the run proceed.
    pub fn confirmation_phrase(self) -> &'static str {
        match self {
            Mode::Provision => "YES",
            Mode::Teardown => "DESTROY",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Provision => f.write_str("provision"),
            Mode::Teardown => f.write_str("teardown"),
        }
    }
}

/// The set of selectable stages a run covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageFilter {
    selected: BTreeSet<Stage>,
}

impl StageFilter {
    pub fn all() -> Self {
        Self::only(Stage::ALL)
    }

    /// Selects the given stages. Stages that always run are ignored.
    pub fn only<I: IntoIterator<Item = Stage>>(stages: I) -> Self {
        Self {
            selected: stages
                .into_iter()
                .filter(|s| s.is_selectable())
                .collect(),
        }
    }

    pub fn includes(&self, stage: Stage) -> bool {
        !stage.is_selectable() || self.selected.contains(&stage)
    }

    /// The stages to execute, in order.
    ///
    /// Teardown undoes the selected stages in reverse, after the same
    /// configuration and preflight checks. Validation has nothing to undo.
    pub fn plan(&self, mode: Mode) -> Vec<Stage> {
        let always = Stage::ALL.into_iter().filter(|s| !s.is_selectable());
        let selected = self.selected.iter().copied();
        match mode {
            Mode::Provision => always.chain(selected).collect(),
            Mode::Teardown => always
                .chain(selected.rev().filter(|s| *s != Stage::Validation))
                .collect(),
        }
    }
}

impl Default for StageFilter {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_provision_plan_has_seven_stages() {
        assert_eq!(StageFilter::all().plan(Mode::Provision), Stage::ALL);
    }

    #[test]
    fn single_stage_keeps_checks() {
        let filter = StageFilter::only([Stage::Edge]);
        assert_eq!(
            filter.plan(Mode::Provision),
            [Stage::Configuration, Stage::Preflight, Stage::Edge]
        );
        assert!(filter.includes(Stage::Preflight));
        assert!(!filter.includes(Stage::Image));
    }

    #[test]
    fn teardown_runs_in_reverse() {
        assert_eq!(
            StageFilter::all().plan(Mode::Teardown),
            [
                Stage::Configuration,
                Stage::Preflight,
                Stage::Edge,
                Stage::Image,
                Stage::DevOps,
                Stage::Infrastructure,
            ]
        );
    }

    #[test]
    fn confirmation_phrases() {
        assert_eq!(Mode::Provision.confirmation_phrase(), "YES");
        assert_eq!(Mode::Teardown.confirmation_phrase(), "DESTROY");
    }
}
