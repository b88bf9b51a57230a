use std::process::{ExitStatus, Stdio};

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::TransformConfig;

const STDOUT_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformReport {
    pub command: String,
    pub stdout_lines: usize,
}

impl TransformConfig {
    pub fn command_line(&self) -> Vec<String> {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.push("--project-dir".to_string());
        parts.push(self.project_dir.display().to_string());
        parts
    }
}

/// Runs the transformation tool to completion. A nonzero exit is a failure
/// carrying the tool's stderr (or the tail of stdout when stderr is empty).
pub async fn run_transform(config: &TransformConfig) -> Result<TransformReport, TransformError> {
    let command = config.command_line().join(" ");
    info!(command = %command, "Running transform");

    let output = Command::new(&config.program)
        .args(&config.args)
        .arg("--project-dir")
        .arg(&config.project_dir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| TransformError::Spawn {
            command: command.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        info!(target: "tgflux::transform", "{line}");
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stderr = if stderr.is_empty() {
            tail(&stdout, STDOUT_TAIL_LINES)
        } else {
            stderr
        };
        warn!(command = %command, status = %output.status, "Transform failed");
        return Err(TransformError::Failed {
            command,
            status: output.status,
            stderr,
        });
    }

    Ok(TransformReport {
        command,
        stdout_lines: stdout.lines().count(),
    })
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
