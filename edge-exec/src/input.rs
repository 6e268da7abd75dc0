// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::process::Command;

/// Wrapper around the input of a [std::process::Command] as strings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Input {
    pub program: String,
    pub args: VecDeque<String>,
    pub envs: Vec<(String, String)>,
}

impl Input {
    pub fn new<S: Into<String>>(program: S, args: Vec<S>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(|s| s.into()).collect(),
            envs: vec![],
        }
    }

    /// Short-hand for a whitespace-separated string, which can be provided
    /// "like a shell command".
    pub fn shell<S: AsRef<str>>(input: S) -> Self {
        let mut args = shlex::split(input.as_ref()).expect("Invalid input");

        if args.is_empty() {
            panic!("Empty input is invalid");
        }

        Self::new(args.remove(0), args)
    }

    /// Adds an environment variable the observed command must carry.
    pub fn with_env<K: Into<String>, V: Into<String>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Looks up an environment variable set on the command.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.envs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Returns true if `observed` runs the same program with the same
    /// arguments and carries (at least) every variable in `self.envs`.
    pub fn matches(&self, observed: &Input) -> bool {
        self.program == observed.program
            && self.args == observed.args
            && self
                .envs
                .iter()
                .all(|(k, v)| observed.env(k) == Some(v.as_str()))
    }
}

impl std::fmt::Display for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", shlex::try_quote(&self.program).unwrap_or_default())?;
        for arg in &self.args {
            write!(f, " {}", shlex::try_quote(arg).unwrap_or_default())?;
        }
        Ok(())
    }
}

fn os_str_to_string(s: &std::ffi::OsStr) -> String {
    s.to_string_lossy().to_string()
}

impl From<&Command> for Input {
    fn from(command: &Command) -> Self {
        Self {
            program: os_str_to_string(command.get_program()),
            args: command.get_args().map(os_str_to_string).collect(),
            envs: command
                .get_envs()
                .map(|(k, v)| {
                    (
                        os_str_to_string(k),
                        os_str_to_string(v.unwrap_or_default()),
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn matches_ignores_unexpected_envs() {
        let mut command = Command::new("terraform");
        command.args(["apply", "tfplan"]).env("ARM_SUBSCRIPTION_ID", "sub");
        let observed = Input::from(&command);

        assert!(Input::shell("terraform apply tfplan").matches(&observed));
        assert!(Input::shell("terraform apply tfplan")
            .with_env("ARM_SUBSCRIPTION_ID", "sub")
            .matches(&observed));
        assert!(!Input::shell("terraform apply tfplan")
            .with_env("ARM_SUBSCRIPTION_ID", "other")
            .matches(&observed));
        assert!(!Input::shell("terraform apply").matches(&observed));
    }

    #[test]
    fn display_quotes_arguments() {
        let input = Input::new("az", vec!["group", "create", "-n", "my rg"]);
        assert_eq!(input.to_string(), "az group create -n 'my rg'");
    }
}
