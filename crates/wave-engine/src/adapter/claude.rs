//! Subprocess adapter for the Claude Code CLI.

use tokio_util::sync::CancellationToken;

use wave_core::error::AdapterError;

use super::process::{spawn_in_process_group, stream_stdout_until_done};
use super::settings::write_settings_file;
use super::{RunConfig, RunOutput, TokenAccumulator};

pub struct ClaudeAdapter;

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, config: &RunConfig, cancel: CancellationToken) -> Result<RunOutput, AdapterError> {
        write_settings_file(&config.workspace_path, &config.allowed_tools, &config.deny_tools)?;

        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--system-prompt".to_string(),
            config.system_prompt.clone(),
        ];
        if let Some(temperature) = config.temperature {
            args.push("--temperature".to_string());
            args.push(temperature.to_string());
        }
        args.push(config.prompt.clone());

        let child = spawn_in_process_group(&config.command, &args, &config.workspace_path, &config.env)?;

        let mut accumulator = TokenAccumulator::new();
        let mut raw_stream = Vec::new();
        let run_fut = stream_stdout_until_done(child, cancel.clone(), |line| {
            accumulator.feed_line(line);
            raw_stream.push(line.to_string());
        });

        let (status, stderr) = tokio::time::timeout(config.timeout, run_fut)
            .await
            .map_err(|_| AdapterError::Timeout(config.timeout.as_secs()))??;

        if cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }

        let exit_code = status.code().unwrap_or(-1);
        if stderr.contains("permission denied") || stderr.contains("security_violation") {
            return Err(AdapterError::SecurityViolation(stderr));
        }
        if exit_code != 0 && !stderr.is_empty() {
            return Err(AdapterError::NonZeroExit { code: exit_code, stderr });
        }

        Ok(RunOutput {
            exit_code,
            stderr,
            tokens: accumulator.finalize(),
            raw_stream,
        })
    }
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}
