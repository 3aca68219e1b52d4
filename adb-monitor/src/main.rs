// ADB Monitor - watch devices and debuggable processes
//
// Prints every bridge event as a JSON line on stdout until interrupted.
// Usage: adb-monitor [config.json]

use adb_bridge::DeviceMonitor;
use anyhow::Result;
use std::path::PathBuf;
use tracing::{debug, error, info};

mod report;

use report::{load_config, EventReporter};

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing to stderr only - stdout carries the event stream
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("adb_monitor=info".parse()?)
                .add_directive("adb_bridge=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = load_config(config_path.as_deref())?;

    info!("Starting ADB monitor against {}", config.server_addr());

    let monitor = DeviceMonitor::new(config);
    let mut events = monitor.subscribe();
    monitor.start().await?;

    let mut reporter = EventReporter::new(tokio::io::stdout());
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    info!("Event stream closed");
                    break;
                };

                debug!(serial = %event.serial(), "{}", event.kind());
                if let Err(e) = reporter.report(&event).await {
                    error!("Failed to write event: {}", e);
                    break;
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    monitor.stop().await;
    info!("ADB monitor stopped after {} events", reporter.written());
    Ok(())
}
