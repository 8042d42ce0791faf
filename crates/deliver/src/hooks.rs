use std::time::Instant;

use delivery_spec::{DeliveryError, DeliveryResult};
use system_utils::process::run_streaming;
use tokio::process::Command;
use tracing::info;

/// Runs each command in order as a local child process, without a shell.
/// Stops at the first command that cannot start or exits non-zero.
pub(crate) async fn run_hooks(phase: &'static str, commands: &[String]) -> DeliveryResult<()> {
    for command in commands {
        let argv = split_command(command)?;
        let Some((program, args)) = argv.split_first() else {
            return Err(DeliveryError::config("hook command cannot be empty"));
        };
        info!(event = "hook.run", phase, command = %command, "running hook");
        let start = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(args);
        let status = run_streaming(&mut cmd, program)
            .await
            .map_err(|err| DeliveryError::command(format!("`{command}`: {err:#}")))?;
        if !status.success() {
            let code = status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(DeliveryError::command(format!(
                "`{command}` exited with {code}"
            )));
        }
        info!(
            event = "hook.done",
            phase,
            command = %command,
            elapsed_ms = start.elapsed().as_millis(),
            "hook finished"
        );
    }
    Ok(())
}

fn split_command(command: &str) -> DeliveryResult<Vec<String>> {
    shell_words::split(command)
        .map_err(|err| DeliveryError::config(format!("invalid hook command `{command}`: {err}")))
}
