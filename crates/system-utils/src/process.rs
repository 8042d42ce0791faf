use std::process::{ExitStatus, Output, Stdio};

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// Runs `cmd` with captured output. The child is killed if it outlives `command_timeout`.
pub async fn run_command_with_timeout(
    cmd: &mut Command,
    command_timeout: Duration,
    label: &str,
) -> anyhow::Result<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd
        .spawn()
        .with_context(|| format!("{label} failed to start"))?;
    match timeout(command_timeout, child.wait_with_output()).await {
        Ok(result) => result.with_context(|| format!("{label} failed")),
        Err(_) => anyhow::bail!(
            "{label} timed out after {}",
            format_timeout(command_timeout)
        ),
    }
}

fn format_timeout(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Runs `cmd` to completion while relaying its stdout and stderr to ours as they arrive.
pub async fn run_streaming(cmd: &mut Command, label: &str) -> anyhow::Result<ExitStatus> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("{label} failed to start"))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (status, _, _) = tokio::join!(
        child.wait(),
        relay_output(stdout, tokio::io::stdout()),
        relay_output(stderr, tokio::io::stderr()),
    );
    status.with_context(|| format!("{label} failed"))
}

pub async fn relay_output<R, W>(reader: Option<R>, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(0);
    };
    let mut total = 0u64;
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read]).await?;
        writer.flush().await?;
        total += read as u64;
    }
    Ok(total)
}
