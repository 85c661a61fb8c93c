//! Daemon lifecycle helpers such as PID file and shutdown signal handling.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
#[cfg(not(test))]
use tokio::signal;
use tracing::{info, warn};

/// PID file management
pub struct PidFile {
    /// Filesystem path for the PID file.
    path: PathBuf,
}

impl PidFile {
    /// Creates a PID file manager for a concrete path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the default PID file path under `~/.iot-cloud/`.
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".iot-cloud").join("iot-cloud.pid")
    }

    /// PID of another running instance recorded in the file, if any. A file
    /// left by a dead process, or one that does not hold a PID, is removed.
    pub async fn running_instance(&self) -> std::io::Result<Option<u32>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match text.trim().parse::<u32>() {
            Ok(pid) if pid != std::process::id() && process_alive(pid) => Ok(Some(pid)),
            _ => {
                warn!("Removing stale PID file: {}", self.path.display());
                tokio::fs::remove_file(&self.path).await?;
                Ok(None)
            }
        }
    }

    /// Writes the current process ID to the PID file.
    pub async fn write(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pid = std::process::id().to_string();
        tokio::fs::write(&self.path, pid).await?;
        info!("PID file written: {}", self.path.display());
        Ok(())
    }

    /// Removes the PID file if it exists.
    pub async fn remove(&self) {
        if self.path.exists() {
            let _ = tokio::fs::remove_file(&self.path).await;
            info!("PID file removed: {}", self.path.display());
        }
    }
}

/// Liveness comes from procfs; without it every recorded PID counts as dead.
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Wait for SIGTERM or SIGINT shutdown signal
#[cfg(not(test))]
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("Received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down");
                    }
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM ({e}), waiting for Ctrl-C only"),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => warn!("Cannot listen for Ctrl-C ({e}), shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_points_to_iot_cloud_pid() {
        let path = PidFile::default_path();
        let text = path.to_string_lossy();
        assert!(text.contains(".iot-cloud"));
        assert!(text.ends_with("iot-cloud.pid"));
    }

    #[tokio::test]
    async fn write_and_remove_pid_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pid_path = tmp.path().join("nested/iot-cloud.pid");
        let pid_file = PidFile::new(&pid_path);

        pid_file.write().await.expect("pid write");
        assert!(pid_path.exists());

        let written = tokio::fs::read_to_string(&pid_path)
            .await
            .expect("read pid");
        let parsed_pid = written.parse::<u32>().expect("pid should be numeric");
        assert_eq!(parsed_pid, std::process::id());

        pid_file.remove().await;
        assert!(!pid_path.exists());
        pid_file.remove().await;
    }

    #[tokio::test]
    async fn missing_or_own_pid_file_is_not_another_instance() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pid_file = PidFile::new(tmp.path().join("iot-cloud.pid"));
        assert_eq!(pid_file.running_instance().await.expect("check"), None);

        pid_file.write().await.expect("pid write");
        assert_eq!(pid_file.running_instance().await.expect("check"), None);
    }

    #[tokio::test]
    async fn stale_pid_file_is_removed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pid_path = tmp.path().join("iot-cloud.pid");
        let pid_file = PidFile::new(&pid_path);

        for stale in ["4294967295", "not-a-pid"] {
            tokio::fs::write(&pid_path, stale).await.expect("write");
            assert_eq!(pid_file.running_instance().await.expect("check"), None);
            assert!(!pid_path.exists());
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn live_pid_blocks_start() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pid_path = tmp.path().join("iot-cloud.pid");
        tokio::fs::write(&pid_path, "1\n").await.expect("write");

        let pid_file = PidFile::new(&pid_path);
        assert_eq!(pid_file.running_instance().await.expect("check"), Some(1));
        assert!(pid_path.exists());
    }
}
