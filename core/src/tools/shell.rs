//! Shell tool. Foreground commands run to completion with truncated output
//! capture; background commands are registered with the sandbox supervisor
//! as session-owned children.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Command;

use super::ToolCall;
use super::ToolContext;
use super::ToolOutput;
use super::parse_input;

// Maximum we keep for each stream, which is either:
// - 10KiB OR
// - 256 lines
const MAX_STREAM_OUTPUT: usize = 10 * 1024;
const MAX_STREAM_OUTPUT_LINES: usize = 256;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Exit code reported for a command we had to kill on timeout.
const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Deserialize)]
pub(super) struct BashParams {
    command: String,
    #[serde(default)]
    background: bool,
    timeout_ms: Option<u64>,
}

pub(super) async fn run(call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
    let params: BashParams = match parse_input(&call.input) {
        Ok(p) => p,
        Err(out) => return out,
    };

    let argv = vec![
        "bash".to_string(),
        "-lc".to_string(),
        params.command.clone(),
    ];

    if params.background {
        return match ctx
            .supervisor
            .spawn_background(argv, &call.id, &[], None)
            .await
        {
            Ok(pid) => ToolOutput::text(format!("started background process (pid {pid})")),
            Err(e) => ToolOutput::error(format!("failed to start background process: {e}")),
        };
    }

    let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
    exec_foreground(argv, ctx, timeout).await
}

async fn exec_foreground(argv: Vec<String>, ctx: &ToolContext, timeout: Duration) -> ToolOutput {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(ctx.supervisor.workspace_root())
        // No stdin pipe: some commands try to read from an open stdin and
        // hang forever.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return ToolOutput::error(format!("failed to spawn command: {e}")),
    };

    let Some(stdout_pipe) = child.stdout.take() else {
        return ToolOutput::error("stdout pipe was unexpectedly not available");
    };
    let Some(stderr_pipe) = child.stderr.take() else {
        return ToolOutput::error("stderr pipe was unexpectedly not available");
    };
    let stdout_handle = tokio::spawn(read_capped(
        BufReader::new(stdout_pipe),
        MAX_STREAM_OUTPUT,
        MAX_STREAM_OUTPUT_LINES,
    ));
    let stderr_handle = tokio::spawn(read_capped(
        BufReader::new(stderr_pipe),
        MAX_STREAM_OUTPUT,
        MAX_STREAM_OUTPUT_LINES,
    ));

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
        Ok(Err(e)) => return ToolOutput::error(format!("failed waiting for command: {e}")),
        Err(_) => {
            // Already-gone children are fine; the timeout is reported either
            // way.
            let _ = child.start_kill();
            let _ = child.wait().await;
            (TIMEOUT_EXIT_CODE, true)
        }
    };

    let stdout_bytes = stdout_handle.await.ok().and_then(|r| r.ok()).unwrap_or_default();
    let stderr_bytes = stderr_handle.await.ok().and_then(|r| r.ok()).unwrap_or_default();
    let stdout = String::from_utf8_lossy(&stdout_bytes).to_string();
    let stderr = String::from_utf8_lossy(&stderr_bytes).to_string();

    let is_success = exit_code == 0 && !timed_out;
    let mut output = if is_success || stderr.is_empty() {
        stdout.clone()
    } else {
        stderr.clone()
    };
    if timed_out {
        output = format!("command timed out after {}ms\n{output}", timeout.as_millis());
    }

    ToolOutput {
        output,
        exit_code: Some(exit_code),
        url: None,
        is_error: !is_success,
    }
}

/// Read a stream to EOF, keeping only the first `max_output` bytes /
/// `max_lines` lines. Reading continues past the caps to avoid
/// back-pressure on the child.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    max_output: usize,
    max_lines: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(max_output.min(8 * 1024));
    let mut tmp = [0u8; 8192];

    let mut remaining_bytes = max_output;
    let mut remaining_lines = max_lines;

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }

        if remaining_bytes > 0 && remaining_lines > 0 {
            let mut copy_len = 0;
            for &b in &tmp[..n] {
                if remaining_bytes == 0 || remaining_lines == 0 {
                    break;
                }
                copy_len += 1;
                remaining_bytes -= 1;
                if b == b'\n' {
                    remaining_lines -= 1;
                }
            }
            buf.extend_from_slice(&tmp[..copy_len]);
        }
    }

    Ok(buf)
}
