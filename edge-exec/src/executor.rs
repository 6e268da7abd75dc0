// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::{ExecutionError, REDACTED};
use crate::input::Input;
use crate::output::{Output, OutputExt};

use async_trait::async_trait;
use itertools::Itertools;
use slog::{debug, error, info, Logger};
use std::process::{Command, Stdio};
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Logs the command line and the *names* of any environment variables.
///
/// Values are never logged: the provisioner hands secrets to child processes
/// exclusively through their environment.
pub fn log_input(log: &Logger, id: u64, command: &Command) {
    info!(
        log,
        "running command via executor";
        "id" => id,
        "command" => %Input::from(command),
    );
    let envs = command
        .get_envs()
        .map(|(k, _)| k.to_string_lossy().into_owned())
        .join(" ");
    if !envs.is_empty() {
        debug!(log, "command environment"; "id" => id, "envs" => envs);
    }
}

pub fn log_output(log: &Logger, id: u64, output: &Output, redacted: bool) {
    info!(
        log,
        "finished running command via executor";
        "id" => id,
        "result" => if output.status.success() { "OK" } else { "ERROR" },
        "status" => output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if !output.stdout.is_empty() {
        debug!(
            log,
            "finished command stdout";
            "id" => id,
            "stdout" => if redacted {
                REDACTED
            } else {
                from_utf8(&output.stdout).unwrap_or("<Not valid UTF-8>")
            },
        );
    }
    if !output.stderr.is_empty() {
        debug!(
            log,
            "finished command stderr";
            "id" => id,
            "stderr" => {
                from_utf8(&output.stderr).unwrap_or("<Not valid UTF-8>")
            },
        );
    }
}

fn check_output(
    command: &Command,
    output: Output,
    redacted: bool,
) -> Result<Output, ExecutionError> {
    if output.status.success() {
        return Ok(output);
    }
    if redacted {
        Err(ExecutionError::from_redacted_output(command, &output))
    } else {
        Err(ExecutionError::from_output(command, &output))
    }
}

/// Describes the commonly-used "safe-to-reference" type describing the
/// Executor as a trait object.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Describes an "executor", which can run commands and return a response.
///
/// - In production, this is usually simply a [HostExecutor].
/// - Under test, this can be customized, and a [FakeExecutor] may be used.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes a task, waiting for it to complete, and returning output.
    ///
    /// A non-zero exit status is returned as
    /// [ExecutionError::CommandFailure].
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError>;

    /// Like [Executor::execute_async], for commands whose stdout carries a
    /// secret: stdout is neither logged nor kept in a returned error.
    async fn execute_redacted_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError>;
}

pub struct HostExecutor {
    log: slog::Logger,
    counter: std::sync::atomic::AtomicU64,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { log, counter: AtomicU64::new(0) })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    fn prepare(&self, command: &Command) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, command);
        id
    }

    async fn run(
        &self,
        command: &mut tokio::process::Command,
        redacted: bool,
    ) -> Result<Output, ExecutionError> {
        let id = self.prepare(command.as_std());
        let start = Instant::now();
        let mut child = command
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                error!(self.log, "Could not start program!"; "id" => id);
                ExecutionError::ExecutionStart {
                    command: Input::from(command.as_std()).to_string(),
                    err,
                }
            })?;

        // Long-running tools (packer, terraform) print progress as they go,
        // so stream each line into the log instead of waiting for exit.
        let stdout = child.stdout.take().map(|reader| {
            let log = self.log.new(slog::o!("id" => id, "stream" => "stdout"));
            spawn_reader(log, reader, !redacted)
        });
        let stderr = child.stderr.take().map(|reader| {
            let log = self.log.new(slog::o!("id" => id, "stream" => "stderr"));
            spawn_reader(log, reader, true)
        });

        let wait_error = |err| ExecutionError::ExecutionWait {
            command: Input::from(command.as_std()).to_string(),
            err,
        };
        let status = child.wait().await.map_err(wait_error)?;
        let stdout = collect(stdout).await.map_err(wait_error)?;
        let stderr = collect(stderr).await.map_err(wait_error)?;
        let output = Output { status, stdout, stderr };

        debug!(
            self.log,
            "process exited";
            "id" => id,
            "elapsed" => ?Instant::now().saturating_duration_since(start),
        );
        // Lines were already logged by the readers; only record the result.
        log_output(
            &self.log,
            id,
            &Output { status, stdout: vec![], stderr: vec![] },
            redacted,
        );
        check_output(command.as_std(), output, redacted)
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        self.run(command, false).await
    }

    async fn execute_redacted_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        self.run(command, true).await
    }
}

fn spawn_reader(
    log: Logger,
    reader: impl AsyncRead + Send + Unpin + 'static,
    log_lines: bool,
) -> JoinHandle<std::io::Result<Vec<u8>>> {
    let mut reader = BufReader::new(reader);
    tokio::spawn(async move {
        let mut captured = Vec::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            // We have no particular control over the output from the child
            // processes we run, so we read until a newline character without
            // relying on valid UTF-8 output.
            let size = reader.read_until(b'\n', &mut line).await?;
            if size == 0 {
                return Ok(captured);
            }
            if log_lines {
                debug!(log, "{}", String::from_utf8_lossy(&line).trim_end());
            }
            captured.extend_from_slice(&line);
        }
    })
}

async fn collect(
    handle: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
) -> std::io::Result<Vec<u8>> {
    match handle {
        Some(handle) => handle.await.map_err(std::io::Error::other)?,
        None => Ok(Vec::new()),
    }
}

/// Handler called when a fake command is executed.
pub type HandlerFn = dyn FnMut(&Input) -> Output + Send + Sync;
pub type BoxedHandlerFn = Box<HandlerFn>;

pub struct FakeExecutorBuilder {
    log: Logger,
    handler: Option<BoxedHandlerFn>,
}

impl FakeExecutorBuilder {
    pub fn new(log: Logger) -> Self {
        Self { log, handler: None }
    }

    pub fn handler(mut self, f: BoxedHandlerFn) -> Self {
        self.handler = Some(f);
        self
    }

    /// Convenience function to register the sequence with a [FakeExecutor].
    pub fn with_sequence(mut self, mut sequence: CommandSequence) -> Self {
        self.handler = Some(Box::new(move |input: &Input| -> Output {
            sequence.execute(input)
        }));
        self
    }

    pub fn build(self) -> Arc<FakeExecutor> {
        Arc::new(FakeExecutor {
            log: self.log,
            counter: AtomicU64::new(0),
            handler: Mutex::new(
                self.handler.unwrap_or_else(|| Box::new(|_| Output::success())),
            ),
        })
    }
}

/// An executor which can expect certain inputs, and respond with specific
/// outputs.
pub struct FakeExecutor {
    log: Logger,
    counter: AtomicU64,
    handler: Mutex<BoxedHandlerFn>,
}

impl FakeExecutor {
    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    fn execute_internal(
        &self,
        command: &Command,
        redacted: bool,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, command);

        let output = self.handler.lock().unwrap()(&Input::from(command));
        log_output(&self.log, id, &output, redacted);
        check_output(command, output, redacted)
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    // NOTE: We aren't actually performing any async operations -- it's up to
    // the caller to control the (synchronous) handler.
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        self.execute_internal(command.as_std(), false)
    }

    async fn execute_redacted_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        self.execute_internal(command.as_std(), true)
    }
}

type DynamicHandler = Box<dyn FnMut(&Input) -> Output + Send + Sync>;

enum HandledCommand {
    Static { input: Input, output: Output },
    Dynamic { handler: DynamicHandler },
}

/// A handler that may be used for setting inputs/outputs to the executor
/// when these commands are known ahead-of-time.
///
/// See: [FakeExecutorBuilder::with_sequence] for integration with a
/// [FakeExecutor].
pub struct CommandSequence {
    expected: Vec<HandledCommand>,
    index: usize,
}

impl CommandSequence {
    pub fn new() -> Self {
        Self { expected: Vec::new(), index: 0 }
    }

    /// Expects a static "input" to exactly produce some "output".
    ///
    /// Environment variables listed on `input` must be present on the
    /// observed command; any others are ignored.
    pub fn expect(&mut self, input: Input, output: Output) {
        self.expected.push(HandledCommand::Static { input, output });
    }

    /// A helper for [Self::expect] which quietly succeeds.
    pub fn expect_ok<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::success())
    }

    /// A helper for [Self::expect] which quietly fails.
    pub fn expect_fail<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::failure())
    }

    /// A helper for [Self::expect] which succeeds, printing `stdout`.
    pub fn expect_stdout<S: AsRef<str>, O: AsRef<str>>(
        &mut self,
        input: S,
        stdout: O,
    ) {
        self.expect(Input::shell(input), Output::success().set_stdout(stdout))
    }

    /// Expects a dynamic handler to be invoked to dynamically
    /// determine the output of this call.
    pub fn expect_dynamic(&mut self, handler: DynamicHandler) {
        self.expected.push(HandledCommand::Dynamic { handler });
    }

    fn execute(&mut self, observed_input: &Input) -> Output {
        let expected = &mut self
            .expected
            .get_mut(self.index)
            .unwrap_or_else(|| panic!("Unexpected command: {observed_input}"));
        self.index += 1;

        match expected {
            HandledCommand::Static { input, output } => {
                assert!(
                    input.matches(observed_input),
                    "Unexpected input command\n  expected: {input}\n  \
                    observed: {observed_input}"
                );
                output.clone()
            }
            HandledCommand::Dynamic { ref mut handler } => {
                handler(observed_input)
            }
        }
    }
}

impl Default for CommandSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CommandSequence {
    fn drop(&mut self) {
        let expected = self.expected.len();
        let actual = self.index;
        if actual < expected {
            let next = &self.expected[actual];
            let tip = match next {
                HandledCommand::Static { input, .. } => input.to_string(),
                HandledCommand::Dynamic { .. } => {
                    "<dynamic handler>".to_string()
                }
            };
            let errmsg = format!(
                "Only saw {actual} calls, expected {expected}\n\
                 Next would have been: {tip}"
            );
            if !std::thread::panicking() {
                assert!(false, "{errmsg}");
            } else {
                eprintln!("{errmsg}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn sequence_returns_outputs_in_order() {
        let mut sequence = CommandSequence::new();
        sequence.expect_stdout("az group exists -n rg", "true\n");
        sequence.expect_fail("az group create -n rg -l westeurope");
        let executor = FakeExecutorBuilder::new(log())
            .with_sequence(sequence)
            .build()
            .as_executor();

        let output = executor
            .execute_async(
                tokio::process::Command::new("az")
                    .args(["group", "exists", "-n", "rg"]),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, b"true\n");

        let err = executor
            .execute_async(tokio::process::Command::new("az").args([
                "group",
                "create",
                "-n",
                "rg",
                "-l",
                "westeurope",
            ]))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn redacted_failures_drop_stdout() {
        let executor = FakeExecutorBuilder::new(log())
            .handler(Box::new(|_| Output::failure().set_stdout("hunter2")))
            .build();

        let err = executor
            .execute_redacted_async(&mut tokio::process::Command::new("az"))
            .await
            .unwrap_err();
        let ExecutionError::CommandFailure(info) = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(info.stdout, REDACTED);
        assert!(!info.to_string().contains("hunter2"));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn host_executor_captures_output() {
        let executor = HostExecutor::new(log());
        let output = executor
            .execute_async(
                tokio::process::Command::new("sh")
                    .args(["-c", "echo one; echo two >&2"]),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, b"one\n");
        assert_eq!(output.stderr, b"two\n");

        let err = executor
            .execute_async(
                tokio::process::Command::new("sh").args(["-c", "exit 2"]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(2));
    }
}
