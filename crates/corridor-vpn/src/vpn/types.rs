//! Shared types, enums, error types, and event payloads for the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Top-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Engine freshly constructed, nothing observed yet.
    Unknown,
    /// No backend session.
    Disconnected,
    /// Environment checks (adapters, driver) in progress.
    Preparing,
    /// Backend spawned, waiting for the tunnel to come up.
    Connecting,
    /// Tunnel is up and traffic is flowing.
    Connected,
    /// Graceful teardown in progress.
    Disconnecting,
    /// Backend is re-establishing after a drop.
    Reconnecting,
    /// Session ended with a failure; see the retained last error.
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Preparing => write!(f, "Preparing"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Error => write!(f, "Error"),
        }
    }
}

impl ConnectionState {
    /// Whether a backend session is (or is becoming) live.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::Connecting | Self::Connected | Self::Reconnecting
        )
    }

    /// Whether the machine has come to rest.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Error taxonomy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Closed failure taxonomy for the engine and its collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Backend binary could not be located.
    BackendExecutableMissing,
    /// Generated backend config is absent or could not be written.
    BackendConfigMissing,
    /// Local management channel could not be opened or used.
    ManagementChannelFailed,
    /// Virtual adapters are in use, disabled, or cannot be found.
    AdapterUnavailable,
    /// Tunnel driver check or installation failed.
    DriverInstallFailed,
    /// Privileged service is not connected or did not answer in time.
    ServiceUnreachable,
    /// Backend reported a fatal condition we cannot classify further.
    UnknownBackendFault,
    /// Connect window expired before the tunnel came up.
    Timeout,
    /// Requested protocol has no engine.
    NotImplemented,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Crate-level error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnError {
    pub code: ErrorCode,
    pub message: String,
    pub detail: Option<String>,
}

impl fmt::Display for VpnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.message)?;
        if let Some(d) = &self.detail {
            write!(f, " ({})", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for VpnError {}

impl VpnError {
    pub fn new(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<VpnError> for String {
    fn from(e: VpnError) -> String {
        e.to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Protocol selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Supported backend protocols. A closed set: adding a backend means
/// adding a variant and an engine constructor, not a string key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    OpenVpn,
    /// Declared but not yet backed by an engine.
    WireGuard,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::OpenVpn
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenVpn => write!(f, "openvpn"),
            Self::WireGuard => write!(f, "wireguard"),
        }
    }
}

impl Protocol {
    /// Parse from a loose config string.
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "wireguard" | "wg" => Self::WireGuard,
            _ => Self::OpenVpn,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the caller hands to `start`: the backend config text plus the
/// server address the tunnel will reach out to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Server endpoint address, used for post-connect gateway probing.
    pub server_addr: Option<IpAddr>,
    /// Full backend configuration file content.
    pub config_text: String,
}

/// Cumulative traffic counters for the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteCounters {
    pub received: u64,
    pub sent: u64,
}

impl ByteCounters {
    /// Replace with the latest cumulative totals from the backend.
    pub fn update(&mut self, received: u64, sent: u64) {
        self.received = received;
        self.sent = sent;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Addressing facts learned from the management channel and the route
/// table. Populated incrementally; cleared when a new session starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    /// Physical default gateway reported by the backend.
    pub route_gateway: Option<String>,
    /// Local tunnel address pushed by the server.
    pub tunnel_local: Option<String>,
    /// Tunnel-side gateway pushed by the server.
    pub tunnel_gateway: Option<String>,
    /// Physical adapter carrying the tunnel, when re-derived.
    pub adapter_name: Option<String>,
    pub adapter_index: Option<u32>,
}

/// How the physical adapter for split tunneling is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterSelection {
    /// Derive the adapter from the route toward the server.
    Automatic,
    /// Caller-supplied interface index. Zero means "not known",
    /// which falls back to automatic resolution.
    Explicit(u32),
}

impl Default for AdapterSelection {
    fn default() -> Self {
        Self::Automatic
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Engine events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordered notifications from a running engine. Delivered over an
/// unbounded channel in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEvent {
    StateChanged(ConnectionState),
    BytesChanged { received: u64, sent: u64 },
    GatewayUpdated(GatewayInfo),
    ProtocolError(VpnError),
    TimeoutExpired,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Engine settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const DEFAULT_SERVICE_PORT: u16 = 8172;

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Backend binary. `None` means search the well-known locations.
    pub backend_path: Option<PathBuf>,
    /// Directory for generated config/log files. `None` means the
    /// platform config dir.
    pub work_dir: Option<PathBuf>,
    /// Privileged service endpoint.
    pub service_addr: SocketAddr,
    /// Per-request deadline for service calls.
    pub service_timeout: Duration,
    /// How long the engine may sit in Preparing/Connecting.
    pub connect_timeout: Duration,
    /// Grace period between SIGTERM and force kill on stop.
    pub stop_grace: Duration,
    /// Byte-count report interval requested in the handshake (seconds).
    pub bytecount_interval: u32,
    /// Delay before re-deriving gateway/adapter info after connect.
    /// The backend settles routes asynchronously; `None` disables the
    /// probe entirely.
    pub gateway_probe_delay: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            backend_path: None,
            work_dir: None,
            service_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_SERVICE_PORT)),
            service_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            bytecount_interval: 1,
            gateway_probe_delay: Some(Duration::from_secs(4)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Binary location helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Well-known backend binary paths by platform.
pub fn default_backend_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from(r"C:\Program Files\OpenVPN\bin\openvpn.exe"));
        paths.push(PathBuf::from(
            r"C:\Program Files (x86)\OpenVPN\bin\openvpn.exe",
        ));
        paths.push(PathBuf::from(
            r"C:\Program Files\OpenVPN Connect\core\openvpn.exe",
        ));
    }
    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/sbin/openvpn"));
        paths.push(PathBuf::from("/usr/bin/openvpn"));
        paths.push(PathBuf::from("/usr/local/sbin/openvpn"));
    }
    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/local/sbin/openvpn"));
        paths.push(PathBuf::from("/opt/homebrew/sbin/openvpn"));
        paths.push(PathBuf::from("/usr/local/opt/openvpn/sbin/openvpn"));
    }
    paths
}

/// First existing well-known backend binary, if any.
pub fn find_backend_binary() -> Option<PathBuf> {
    default_backend_paths().into_iter().find(|p| p.exists())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Formatting helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
