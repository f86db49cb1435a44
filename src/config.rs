//! Transport configuration for IPC servers and clients.
//!
//! Configuration is an explicit value handed to [`crate::Server::new`] and
//! [`crate::Client::new`]; there is no process-wide mutable default. Build one
//! with [`IpcConfig::default`] and override per instance:
//!
//! ```ignore
//! use ipc_call::IpcConfig;
//! use std::time::Duration;
//!
//! let config = IpcConfig::default()
//!     .with_retry(Duration::from_millis(100))
//!     .with_max_retries(2);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default interval between connection attempts.
const DEFAULT_RETRY: Duration = Duration::from_millis(1000);

/// Default number of additional connection attempts after the first.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Transport configuration shared by [`crate::Server`] and [`crate::Client`].
///
/// The derived operation timeout is `retry * (max_retries + 1)`: with the
/// defaults (1s interval, 3 retries) every listen, connect, and call deadline
/// is 4 seconds.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Interval between connection attempts.
    pub retry: Duration,
    /// Additional connection attempts after the first.
    pub max_retries: u32,
    /// Directory holding the socket files.
    pub socket_root: PathBuf,
    /// Suppress connection-lifecycle logging below debug level.
    pub silent: bool,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            retry: DEFAULT_RETRY,
            max_retries: DEFAULT_MAX_RETRIES,
            socket_root: default_socket_root(),
            silent: true,
        }
    }
}

impl IpcConfig {
    /// Set the interval between connection attempts.
    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    /// Set the number of additional connection attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the directory holding the socket files.
    pub fn with_socket_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.socket_root = root.into();
        self
    }

    /// Enable or disable connection-lifecycle logging at info level.
    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Operation timeout: `retry * (max_retries + 1)`.
    ///
    /// Governs listen, connect, and per-call deadlines.
    pub fn timeout(&self) -> Duration {
        self.retry * (self.max_retries + 1)
    }

    /// Socket file path for the endpoint `name` under the socket root.
    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.socket_root.join(format!("{name}.sock"))
    }
}

/// Resolve the default socket root directory.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR` (Linux standard, per-user)
/// 2. the system temp directory, under a `.sockets` subdirectory
pub fn default_socket_root() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        return runtime_dir;
    }
    std::env::temp_dir().join(".sockets")
}

/// True when `path` looks usable as a Unix socket path.
///
/// `sun_path` is 104-108 bytes depending on platform; longer paths fail at
/// bind time with a confusing error, so both endpoints check before touching
/// the socket and callers can check earlier still.
pub fn socket_path_fits(path: &Path) -> bool {
    path.as_os_str().len() < 104
}
