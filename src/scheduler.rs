use crate::TileError;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub script: PathBuf,
}

/// Submits a batch script. Submission is fire-and-forget; job progress is
/// observed later through run status files.
pub trait Scheduler {
    fn submit(&self, script: &Path) -> Result<JobHandle, TileError>;
}

/// Parses `Submitted batch job 12345`.
pub fn parse_job_id(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Submitted batch job")
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
    })
}

#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    command: String,
}

impl SlurmScheduler {
    pub fn new() -> Self {
        Self {
            command: "sbatch".to_string(),
        }
    }

    pub fn with_command(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for SlurmScheduler {
    fn submit(&self, script: &Path) -> Result<JobHandle, TileError> {
        let dir = script
            .parent()
            .ok_or_else(|| TileError::Scheduler(format!("{} has no parent directory", script.display())))?;
        let name = script
            .file_name()
            .ok_or_else(|| TileError::Scheduler(format!("{} has no file name", script.display())))?;

        let output = Command::new(&self.command)
            .arg(name)
            .current_dir(dir)
            .output()
            .map_err(|e| TileError::Scheduler(format!("cannot run {}: {}", self.command, e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(TileError::Scheduler(format!(
                "{} {} failed: {}",
                self.command,
                script.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let id = parse_job_id(&stdout)
            .ok_or_else(|| TileError::Scheduler(format!("unexpected {} output: {}", self.command, stdout.trim())))?;
        info!(job = %id, script = %script.display(), "submitted");
        Ok(JobHandle {
            id,
            script: script.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_parsed_from_sbatch_output() {
        assert_eq!(parse_job_id("Submitted batch job 48213\n"), Some("48213".to_string()));
        assert_eq!(parse_job_id("warning: x\nSubmitted batch job 7"), Some("7".to_string()));
        assert_eq!(parse_job_id("sbatch: error: invalid partition"), None);
    }
}
