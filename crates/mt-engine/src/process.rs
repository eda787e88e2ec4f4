//! Timeout-bounded external process execution.
//!
//! Build and driver steps are plain child processes. Each one runs in its
//! own process group so a timeout can terminate the whole tree (a `make`
//! invocation and the compilers it forked), not just the direct child.

use mt_types::{FailureStage, InfrastructureError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long to wait for pipe readers after the child is gone.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A command template from the session configuration.
///
/// `program` and every argument may contain the placeholders `{scratch}`,
/// `{artifact}`, `{traces}` and `{header}`. An argument that is exactly
/// `{defines}` expands to one `-DNAME=VALUE` argument per parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// `sh -c <script>`, mostly useful for tests and ad-hoc drivers.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("/bin/sh").arg("-c").arg(script)
    }

    /// Substitute placeholders, returning `(program, args)`.
    pub fn expand(&self, vars: &Placeholders<'_>) -> (String, Vec<String>) {
        let program = vars.substitute(&self.program);
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            if arg == "{defines}" {
                args.extend(vars.defines.iter().cloned());
            } else {
                args.push(vars.substitute(arg));
            }
        }
        (program, args)
    }
}

/// Values substituted into [`CommandSpec`] templates.
#[derive(Debug, Clone, Copy)]
pub struct Placeholders<'a> {
    pub defines: &'a [String],
    pub scratch: &'a Path,
    pub artifact: &'a Path,
    pub header: &'a Path,
    pub traces: Option<&'a Path>,
}

impl Placeholders<'_> {
    fn substitute(&self, template: &str) -> String {
        let traces = self
            .traces
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        template
            .replace("{scratch}", &self.scratch.display().to_string())
            .replace("{artifact}", &self.artifact.display().to_string())
            .replace("{header}", &self.header.display().to_string())
            .replace("{traces}", &traces)
    }
}

/// How a bounded process run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(i32),
    /// Terminated by a signal (number when known).
    Signaled(Option<i32>),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub outcome: ProcessOutcome,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.outcome == ProcessOutcome::Exited(0)
    }

    /// Last `lines` lines of stderr, for failure details.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// One bounded invocation of an external program.
#[derive(Debug, Clone)]
pub struct BoundedCommand<'a> {
    pub stage: FailureStage,
    pub program: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    pub timeout: Duration,
}

impl BoundedCommand<'_> {
    /// Run to completion or until the timeout, then kill the process group.
    ///
    /// Abnormal exits and timeouts are reported through [`ProcessOutcome`];
    /// only the inability to start the program at all is an error.
    pub async fn run(&self) -> Result<ProcessOutput, InfrastructureError> {
        let mut cmd = Command::new(self.program);
        cmd.args(self.args)
            .current_dir(self.cwd)
            .envs(self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => InfrastructureError::ToolchainMissing {
                program: self.program.to_string(),
            },
            _ => InfrastructureError::Spawn {
                stage: self.stage,
                program: self.program.to_string(),
                message: e.to_string(),
            },
        })?;
        debug!(program = self.program, pid = ?child.id(), "spawned {}", self.stage);
        let mut group = GroupGuard { pgid: child.id() };

        let stdout = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr = tokio::spawn(read_pipe(child.stderr.take()));

        let outcome = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                // Background descendants would otherwise hold the pipes open.
                group.kill();
                classify(status)
            }
            Ok(Err(e)) => {
                terminate(&mut child, &mut group).await;
                return Err(InfrastructureError::Spawn {
                    stage: self.stage,
                    program: self.program.to_string(),
                    message: format!("wait failed: {e}"),
                });
            }
            Err(_) => {
                warn!(
                    program = self.program,
                    "{} exceeded {:?}, terminating",
                    self.stage,
                    self.timeout
                );
                terminate(&mut child, &mut group).await;
                ProcessOutcome::TimedOut
            }
        };

        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;
        Ok(ProcessOutput {
            outcome,
            stdout,
            stderr,
            elapsed: started.elapsed(),
        })
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn drain(handle: tokio::task::JoinHandle<String>) -> String {
    match tokio::time::timeout(PIPE_DRAIN_GRACE, handle).await {
        Ok(Ok(text)) => text,
        _ => String::new(),
    }
}

fn classify(status: ExitStatus) -> ProcessOutcome {
    if let Some(code) = status.code() {
        return ProcessOutcome::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        ProcessOutcome::Signaled(status.signal())
    }
    #[cfg(not(unix))]
    {
        ProcessOutcome::Signaled(None)
    }
}

/// Kills the child's process group at most once: explicitly after the
/// child exits or times out, otherwise on drop (error return or a cancelled
/// evaluation task).
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        // SAFETY: kill(2) with a negative pid signals the process group the
        // child leads; it touches no memory owned by this process.
        unsafe {
            libc::kill(-(pgid as libc::pid_t), libc::SIGKILL);
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Forcibly stop the child and everything in its process group.
async fn terminate(child: &mut Child, group: &mut GroupGuard) {
    group.kill();
    let _ = child.kill().await;
}
