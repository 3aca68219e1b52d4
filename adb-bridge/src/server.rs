// ADB server process control
//
// The bridge never manages the server process itself; it asks a
// `ServerControl` to kill or start it when the tracking connection cannot be
// established.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Start/stop hooks for the local ADB server.
///
/// Both calls are synchronous and may take seconds, so the bridge always runs
/// them on the blocking thread pool.
pub trait ServerControl: Send + Sync + 'static {
    /// Make sure a server is listening. Returns false if it could not be started.
    fn ensure_server_started(&self) -> bool;

    /// Kill the running server, if any
    fn kill_server(&self);
}

/// `ServerControl` backed by the `adb` executable
#[derive(Debug, Clone)]
pub struct AdbExecutable {
    program: PathBuf,
    port: u16,
}

impl AdbExecutable {
    pub fn new(program: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            program: program.into(),
            port,
        }
    }

    fn run(&self, subcommand: &str) -> bool {
        debug!("Running {} -P {} {}", self.program.display(), self.port, subcommand);

        let status = Command::new(&self.program)
            .arg("-P")
            .arg(self.port.to_string())
            .arg(subcommand)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!("adb {} exited with {}", subcommand, status);
                false
            }
            Err(e) => {
                warn!("Failed to run {}: {}", self.program.display(), e);
                false
            }
        }
    }
}

impl Default for AdbExecutable {
    fn default() -> Self {
        Self::new("adb", crate::config::DEFAULT_SERVER_PORT)
    }
}

impl ServerControl for AdbExecutable {
    fn ensure_server_started(&self) -> bool {
        self.run("start-server")
    }

    fn kill_server(&self) {
        self.run("kill-server");
    }
}
