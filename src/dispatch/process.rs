//! Local stand-in executor backed by a system shell.
//!
//! `ProcessExecutor` runs the command found in the task's `command`
//! parameter, streams each output line back as progress, then runs every
//! verification probe and returns the probe output keyed by step name.
//! In [`CommandMode::Check`] the command is skipped and only the probes run.
//! Child processes are spawned with `kill_on_drop`, so an abandoned command
//! (timeout or cancellation) takes its process with it.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::core::ExecutorKind;
use crate::dispatch::executor::{Executor, ProgressSink};
use crate::dispatch::protocol::{CommandMode, DispatchCommand, DispatchResult};
use crate::util::keep_tail;
use crate::{Error, Result};

/// Parameter holding the shell command to run.
pub const COMMAND_PARAM: &str = "command";

/// Captured output kept per command.
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// Runs task commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    kind: ExecutorKind,
    shell: PathBuf,
}

impl ProcessExecutor {
    /// Create an executor for `kind`, resolving `sh` on `PATH`.
    pub fn new(kind: ExecutorKind) -> Result<Self> {
        let shell = which::which("sh")
            .map_err(|e| Error::Validation(format!("no shell available: {}", e)))?;
        Ok(Self { kind, shell })
    }

    /// Create an executor using an explicit shell binary.
    pub fn with_shell(kind: ExecutorKind, shell: PathBuf) -> Self {
        Self { kind, shell }
    }

    pub fn shell(&self) -> &PathBuf {
        &self.shell
    }

    /// Run a probe and return its combined stdout and stderr.
    async fn probe(&self, script: &str) -> Result<String> {
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    /// Run every verification probe, recording its output on `result`.
    async fn run_probes(
        &self,
        command: &DispatchCommand,
        mut result: DispatchResult,
        progress: &mut ProgressSink,
    ) -> Result<DispatchResult> {
        let total = command.verification.len();
        for (i, step) in command.verification.iter().enumerate() {
            let percent = (90 + (i * 10) / total.max(1)) as u8;
            progress.report(percent, &format!("probing {}", step.name));
            let observed = self.probe(&step.probe).await?;
            result = result.with_probe(&step.name, observed);
        }
        progress.report(100, &format!("{} finished", command.action));
        Ok(result)
    }
}

/// Read one line, replacing invalid UTF-8 instead of failing on it.
async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    async fn execute(
        &self,
        command: DispatchCommand,
        mut progress: ProgressSink,
    ) -> Result<DispatchResult> {
        if command.mode == CommandMode::Check {
            let result = DispatchResult::success(command.execution_id, "");
            return self.run_probes(&command, result, &mut progress).await;
        }

        let Some(script) = command.params.get(COMMAND_PARAM).and_then(|v| v.as_str()) else {
            return Ok(DispatchResult::failure(
                command.execution_id,
                format!("missing '{}' parameter for action {}", COMMAND_PARAM, command.action),
            ));
        };

        debug!(execution = %command.execution_id.short(), script, "spawning process");
        progress.report(0, &format!("starting {}", command.action));

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ExecutorFailure("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::ExecutorFailure("stderr not captured".into()))?;

        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            let mut text = String::new();
            while let Ok(Some(line)) = next_line(&mut reader, &mut buf).await {
                text.push_str(&line);
                text.push('\n');
                keep_tail(&mut text, MAX_CAPTURE_BYTES);
            }
            text
        });

        let mut output = String::new();
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        let mut count: u32 = 0;
        while let Some(line) = next_line(&mut reader, &mut buf).await? {
            count += 1;
            // Output size is unknown up front; creep toward 90%.
            let percent = (10 + count.min(80)) as u8;
            progress.output(percent, &command.action, &line);
            output.push_str(&line);
            output.push('\n');
            keep_tail(&mut output, MAX_CAPTURE_BYTES);
        }

        let status = child.wait().await?;
        let stderr_text = stderr_task
            .await
            .map_err(|e| Error::ExecutorFailure(e.to_string()))?;
        output.push_str(&stderr_text);

        if !status.success() {
            progress.report(100, &format!("{} exited with {}", command.action, status));
            return Ok(DispatchResult::failure(command.execution_id, output));
        }

        let result = DispatchResult::success(command.execution_id, output);
        self.run_probes(&command, result, &mut progress).await
    }
}
