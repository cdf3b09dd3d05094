//! Subprocess seam.
//!
//! Engines and converters never touch `std::process` directly: they describe
//! a [`CommandSpec`] and hand it to a [`CommandRunner`]. The binary wires in
//! [`SystemRunner`]; tests use a recording fake so no real process starts.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, trace};

use crate::build::CancelToken;

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        let arg = path.display().to_string();
        self.arg(arg)
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Program file name, for matching in logs and tests.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Runs external programs on behalf of engines and converters.
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion. A non-zero exit is not an error here; see
    /// [`run_checked`].
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Run `spec` and fail unless it exits successfully.
pub fn run_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput> {
    debug!("running: {}", spec);
    let output = runner.run(spec)?;
    if !output.success {
        bail!(
            "{} failed (exit code {}): {}",
            spec.program_name(),
            output.code.map_or_else(|| "none".to_string(), |c| c.to_string()),
            output.stderr.trim()
        );
    }
    trace!("{} stdout: {}", spec.program_name(), output.stdout.trim());
    Ok(output)
}

/// Spawns real processes. The child is killed if the cancel token fires.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    cancel: CancelToken,
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

impl SystemRunner {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut source) = source {
            let _ = source.read_to_string(&mut buf);
        }
        buf
    })
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute {}", spec.program.display()))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("waiting for {}", spec.program_name()))?
            {
                break status;
            }
            if self.cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                bail!("{} killed: build cancelled", spec.program_name());
            }
            thread::sleep(POLL_INTERVAL);
        };

        Ok(CommandOutput {
            code: status.code(),
            success: status.success(),
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }
}
