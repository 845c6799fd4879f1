use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::super::errors::BufferError;
use super::coordinator::CoordinatorHandle;

/// Line commands accepted on the control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    Export,
    Status,
    Quit,
}

impl FromStr for ControlCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "export" | "save" => Ok(Self::Export),
            "status" => Ok(Self::Status),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command: {}", other)),
        }
    }
}

/// Runs one command and renders the reply line.
pub async fn execute(handle: &CoordinatorHandle, command: ControlCommand) -> Result<String, BufferError> {
    match command {
        ControlCommand::Start => {
            tracing::info!(target: "buffer", "[CONTROL] Starting buffer");
            handle.start().await?;
            Ok("ok recording".to_string())
        }
        ControlCommand::Stop => {
            tracing::info!(target: "buffer", "[CONTROL] Stopping buffer");
            handle.stop().await?;
            Ok("ok stopped".to_string())
        }
        ControlCommand::Export => {
            tracing::info!(target: "buffer", "[CONTROL] Exporting current window");
            let artifact = handle.export_current_window().await?;
            let mut reply = format!("ok {}", artifact.path.display());
            if !artifact.skipped_indices.is_empty() {
                reply.push_str(&format!(" (skipped {:?})", artifact.skipped_indices));
            }
            Ok(reply)
        }
        ControlCommand::Status => {
            let status = handle.status().await?;
            serde_json::to_string(&status).map_err(|e| BufferError::InvalidConfig(e.to_string()))
        }
        ControlCommand::Quit => Ok("bye".to_string()),
    }
}

/// Reads commands line by line until `quit` or end of input.
pub async fn run_control_loop<R, W>(
    handle: &CoordinatorHandle,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let (reply, quit) = match line.parse::<ControlCommand>() {
            Ok(command) => {
                let reply = match execute(handle, command).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::warn!(target: "buffer", "[CONTROL] {:?} failed: {}", command, e);
                        format!("error: {}", e)
                    }
                };
                (reply, command == ControlCommand::Quit)
            }
            Err(e) => (format!("error: {}", e), false),
        };

        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        if quit {
            break;
        }
    }

    Ok(())
}
