//! DC-013: Local shell execution.

use super::ExecOutput;
use crate::core::error::{Error, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Execute a shell script locally via `bash`, fed on stdin.
///
/// Returns `None` without spawning when `cancel` has already fired. A command
/// that has started always runs to completion.
pub async fn exec_local(script: &str, cancel: &CancellationToken) -> Result<Option<ExecOutput>> {
    if cancel.is_cancelled() {
        return Ok(None);
    }

    let mut child = Command::new("bash")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Command(format!("failed to spawn bash: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|e| Error::Command(format!("stdin write error: {}", e)))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::Command(format!("wait error: {}", e)))?;

    Ok(Some(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }))
}
