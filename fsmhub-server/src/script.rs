//! External scripts.
//!
//! A script line is `name arg...`. Only the basename of `name` is used, and
//! it is resolved inside the configured scripts directory, so a rule can
//! never run arbitrary paths.

use crate::error::ServerError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ScriptRunner {
    dir: PathBuf,
}

impl ScriptRunner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Splits a script line into the resolved program path and its arguments.
    pub fn resolve(&self, line: &str) -> Result<(PathBuf, Vec<String>), ServerError> {
        let mut words = line.split_whitespace();
        let name = words
            .next()
            .ok_or_else(|| ServerError::Script("empty script line".to_string()))?;
        let base = Path::new(name)
            .file_name()
            .ok_or_else(|| ServerError::Script(format!("invalid script name '{}'", name)))?;

        Ok((self.dir.join(base), words.map(str::to_string).collect()))
    }

    /// Runs a script to completion and returns its combined output.
    ///
    /// A non-zero exit status is an error carrying the output.
    pub async fn run(&self, line: &str) -> Result<String, ServerError> {
        let (program, args) = self.resolve(line)?;
        let output = Command::new(&program)
            .args(&args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ServerError::Script(format!("{}: {}", program.display(), e)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(ServerError::Script(format!(
                "{} exited with {}: {}",
                program.display(),
                output.status,
                combined.trim()
            )))
        }
    }

    /// Runs a script on its own task. The outcome is only logged.
    pub fn spawn(&self, line: &str) -> JoinHandle<()> {
        let runner = self.clone();
        let line = line.to_string();
        tokio::spawn(async move {
            match runner.run(&line).await {
                Ok(output) => info!(script = %line, "script finished: {}", output.trim()),
                Err(e) => warn!(script = %line, error = %e, "script failed"),
            }
        })
    }
}
