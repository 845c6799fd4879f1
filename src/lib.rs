pub mod buffer;
pub mod core;
pub mod shared;

use std::time::Duration;

use crate::buffer::recorder::commands::run_control_loop;
use crate::buffer::BufferError;
use crate::core::logging::init_logging;
use crate::core::settings::load_settings;

/// Entry point for the binary: records from startup and serves line commands
/// on stdin until `quit`, end of input or Ctrl-C.
pub fn run() -> Result<(), BufferError> {
    let _log_guards = match init_logging() {
        Ok(guards) => Some(guards),
        Err(e) => {
            eprintln!("Failed to initialize file logging: {}", e);
            None
        }
    };

    let settings = load_settings();
    settings.validate()?;

    tracing::info!(target: "system",
        "Starting replaybuf: device={} window={}s segment={}s scratch={:?} output={:?}",
        settings.source_device_identifier,
        settings.window_duration_seconds,
        settings.segment_duration_seconds,
        settings.scratch_directory,
        settings.output_directory);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async {
        let (handle, task) = buffer::spawn(&settings)?;

        if let Err(e) = handle.start().await {
            tracing::error!(target: "system", "Initial start failed: {}", e);
        }

        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        tokio::select! {
            result = run_control_loop(&handle, stdin, tokio::io::stdout()) => {
                if let Err(e) = result {
                    tracing::error!(target: "system", "Control loop failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(target: "system", "Interrupted, shutting down");
            }
        }

        drop(handle);
        if let Err(e) = task.await {
            tracing::error!(target: "system", "Coordinator task failed: {}", e);
        }

        Ok::<(), BufferError>(())
    });

    // a pending stdin read would otherwise hold the runtime open
    runtime.shutdown_timeout(Duration::from_millis(500));
    result
}
