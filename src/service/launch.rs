//! How a service executable is turned into an OS command.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Supported launch kinds. Each variant carries only what its kind needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchKind {
    /// Any native executable
    Binary { path: PathBuf },
    /// A compiled Go service; executed directly like any other binary
    Go { binary: PathBuf },
    /// `interpreter script args...`
    Python { interpreter: PathBuf, script: PathBuf },
    /// `runtime script args...`
    Node { runtime: PathBuf, script: PathBuf },
}

impl LaunchKind {
    pub fn label(&self) -> &'static str {
        match self {
            LaunchKind::Binary { .. } => "binary",
            LaunchKind::Go { .. } => "go",
            LaunchKind::Python { .. } => "python",
            LaunchKind::Node { .. } => "node",
        }
    }

    /// Program to exec plus any leading arguments (the script path).
    fn program(&self) -> (&Path, Option<&Path>) {
        match self {
            LaunchKind::Binary { path } => (path, None),
            LaunchKind::Go { binary } => (binary, None),
            LaunchKind::Python {
                interpreter,
                script,
            } => (interpreter, Some(script)),
            LaunchKind::Node { runtime, script } => (runtime, Some(script)),
        }
    }

    /// File that must exist before launching. Interpreters are looked up on
    /// `PATH` by the OS, so only the script is checked for them.
    fn required_file(&self) -> &Path {
        match self {
            LaunchKind::Binary { path } => path,
            LaunchKind::Go { binary } => binary,
            LaunchKind::Python { script, .. } | LaunchKind::Node { script, .. } => script,
        }
    }
}

/// Everything needed to (re)launch one service.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub kind: LaunchKind,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub work_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn binary(path: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            kind: LaunchKind::Binary { path: path.into() },
            args,
            env: HashMap::new(),
            work_dir: None,
            log_file: None,
        }
    }

    /// Build the command. The child gets its own process group so that a
    /// group signal reaches anything it forks.
    pub(crate) fn command(&self, service_name: &str) -> Result<Command> {
        let launch_err = |reason: String| Error::Launch {
            service: service_name.to_string(),
            reason,
        };

        let required = self.kind.required_file();
        if required.components().count() > 1 && !required.exists() {
            return Err(launch_err(format!("{} does not exist", required.display())));
        }

        let (program, script) = self.kind.program();
        let mut cmd = Command::new(program);
        if let Some(script) = script {
            cmd.arg(script);
        }
        cmd.args(&self.args).envs(&self.env).stdin(Stdio::null());

        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }

        match &self.log_file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| launch_err(format!("log file {}: {}", path.display(), e)))?;
                let err_file = file
                    .try_clone()
                    .map_err(|e| launch_err(format!("log file {}: {}", path.display(), e)))?;
                cmd.stdout(Stdio::from(file)).stderr(Stdio::from(err_file));
            }
            None => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }

        // Supervision outlives the Child handle; never kill on drop
        cmd.kill_on_drop(false).process_group(0);
        Ok(cmd)
    }
}
