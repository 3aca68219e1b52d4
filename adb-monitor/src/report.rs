// Event output for the monitor binary
//
// Writes one JSON object per line. Logs go to stderr, so stdout can be piped
// straight into other tools.

use adb_bridge::{BridgeConfig, BridgeEvent};
use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub struct EventReporter<W> {
    out: W,
    written: u64,
}

impl<W: AsyncWrite + Unpin> EventReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    pub async fn report(&mut self, event: &BridgeEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        self.out.write_all(line.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

/// Defaults, then the optional JSON file, then environment overrides
pub fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    let config = match path {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    Ok(config.with_env_overrides())
}
