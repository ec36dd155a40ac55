//! Connection, timing and grant-plan configuration.
//!
//! All timing values are heuristics tuned against real daemons, not values
//! mandated by the protocol. They serialize as milliseconds.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};

/// Default TCP port of the debug daemon.
pub const DEFAULT_PORT: u16 = 5555;

/// Marker a remote script prints to flag a failed step.
pub const DEFAULT_ERROR_MARKER: &str = "[ERROR]";

/// Runtime permissions granted by default.
const DEFAULT_PERMISSIONS: &[&str] = &[
    "android.permission.CAMERA",
    "android.permission.RECORD_AUDIO",
    "android.permission.ACCESS_FINE_LOCATION",
    "android.permission.ACCESS_COARSE_LOCATION",
    "android.permission.READ_EXTERNAL_STORAGE",
    "android.permission.WRITE_EXTERNAL_STORAGE",
    "android.permission.POST_NOTIFICATIONS",
    "android.permission.READ_LOGS",
    "android.permission.WRITE_SECURE_SETTINGS",
];

/// App-ops switched to `allow` by default.
const DEFAULT_APP_OPS: &[&str] = &["SYSTEM_ALERT_WINDOW", "MANAGE_EXTERNAL_STORAGE"];

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Config {
    /// Debug daemon TCP port.
    pub port: u16,
    /// Hosts to try instead of interface discovery (empty = discover).
    pub hosts: Vec<IpAddr>,
    /// Per-candidate connect timeout.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Steady-state read timeout.
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    /// Read timeout while waiting for the user to approve the key on-device.
    #[serde(with = "millis")]
    pub auth_timeout: Duration,
    /// Read timeout for a package install.
    #[serde(with = "millis")]
    pub install_timeout: Duration,
    /// Read timeout for a streamed script run.
    #[serde(with = "millis")]
    pub script_timeout: Duration,
    /// Pause after the reset connection so the daemon can drop a stale session.
    #[serde(with = "millis")]
    pub reset_pause: Duration,
    /// Directory holding the persisted key pair.
    pub key_dir: PathBuf,
    /// Identity appended to the public key (`user@host`).
    pub identity: String,
    /// Package that receives the grants.
    pub package: String,
    /// Runtime permissions to grant via `pm grant`.
    pub permissions: Vec<String>,
    /// App-ops to set to `allow` via `appops set`.
    pub app_ops: Vec<String>,
    /// Accessibility service component (`pkg/.Service`) to enable, if any.
    pub accessibility_service: Option<String>,
    /// Notification listener component (`pkg/.Listener`) to enable, if any.
    pub notification_listener: Option<String>,
    /// Marker whose presence in a script output line marks the run failed.
    pub error_marker: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            hosts: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(30),
            install_timeout: Duration::from_secs(120),
            script_timeout: Duration::from_secs(60),
            reset_pause: Duration::from_millis(800),
            key_dir: default_key_dir(),
            identity: "adbloop@localhost".to_owned(),
            package: String::new(),
            permissions: DEFAULT_PERMISSIONS.iter().map(|&s| s.to_owned()).collect(),
            app_ops: DEFAULT_APP_OPS.iter().map(|&s| s.to_owned()).collect(),
            accessibility_service: None,
            notification_listener: None,
            error_marker: DEFAULT_ERROR_MARKER.to_owned(),
        }
    }
}

impl Config {
    /// Loads a configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Sets the debug port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Replaces host discovery with a fixed list.
    #[must_use]
    pub fn with_hosts(mut self, hosts: Vec<IpAddr>) -> Self {
        self.hosts = hosts;
        self
    }

    /// Sets the key directory.
    #[must_use]
    pub fn with_key_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.key_dir = dir.into();
        self
    }

    /// Sets the target package.
    #[must_use]
    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = package.into();
        self
    }

    /// Sets the accessibility service to enable.
    #[must_use]
    pub fn with_accessibility_service(mut self, component: impl Into<String>) -> Self {
        self.accessibility_service = Some(component.into());
        self
    }

    /// Sets the notification listener to enable.
    #[must_use]
    pub fn with_notification_listener(mut self, component: impl Into<String>) -> Self {
        self.notification_listener = Some(component.into());
        self
    }

    /// Sets the reset-connection pause.
    #[must_use]
    pub const fn with_reset_pause(mut self, pause: Duration) -> Self {
        self.reset_pause = pause;
        self
    }
}

/// `{data_dir}/adbloop`, or `./.adbloop` when the platform has none.
fn default_key_dir() -> PathBuf {
    dirs::data_dir().map_or_else(|| PathBuf::from(".adbloop"), |d| d.join("adbloop"))
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
