//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Timing of the reconciliation loop and the per-path connect retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Interval between topology polls.
    /// Default: 1000
    #[serde(default = "ReconcileConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Delay before the first connect attempt of a freshly acquired path.
    /// Default: 500
    #[serde(default = "ReconcileConfig::default_first_wait_ms")]
    pub first_wait_ms: u64,

    /// Fixed delay between connect attempts.
    /// Default: 1000
    #[serde(default = "ReconcileConfig::default_base_interval_ms")]
    pub base_interval_ms: u64,

    /// Connect attempts before a path gives up until the next topology change.
    /// Default: 5
    #[serde(default = "ReconcileConfig::default_max_attempts")]
    pub max_attempts: u32,

    /// Size of the worker pool running connect attempts.
    /// Default: 4
    #[serde(default = "ReconcileConfig::default_workers")]
    pub workers: usize,
}

impl ReconcileConfig {
    fn default_poll_interval_ms() -> u64 {
        1000
    }

    fn default_first_wait_ms() -> u64 {
        500
    }

    fn default_base_interval_ms() -> u64 {
        1000
    }

    fn default_max_attempts() -> u32 {
        5
    }

    fn default_workers() -> usize {
        4
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval_ms(),
            first_wait_ms: Self::default_first_wait_ms(),
            base_interval_ms: Self::default_base_interval_ms(),
            max_attempts: Self::default_max_attempts(),
            workers: Self::default_workers(),
        }
    }
}

/// Which graph backend implementation the daemon drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// JACK command-line tools.
    Jack,
    /// In-memory graph, for dry runs.
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jack => "jack",
            Self::Memory => "memory",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jack" => Ok(Self::Jack),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown backend kind: {}", other)),
        }
    }
}

/// Graph backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Default: jack
    #[serde(default = "BackendConfig::default_kind")]
    pub kind: BackendKind,

    /// Tool listing ports and connections.
    /// Default: jack_lsp
    #[serde(default = "BackendConfig::default_lsp")]
    pub lsp: String,

    /// Tool connecting two ports.
    /// Default: jack_connect
    #[serde(default = "BackendConfig::default_connect")]
    pub connect: String,

    /// Tool disconnecting two ports.
    /// Default: jack_disconnect
    #[serde(default = "BackendConfig::default_disconnect")]
    pub disconnect: String,

    /// Upper bound for a single tool invocation.
    /// Default: 1000
    #[serde(default = "BackendConfig::default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl BackendConfig {
    fn default_kind() -> BackendKind {
        BackendKind::Jack
    }

    fn default_lsp() -> String {
        "jack_lsp".to_string()
    }

    fn default_connect() -> String {
        "jack_connect".to_string()
    }

    fn default_disconnect() -> String {
        "jack_disconnect".to_string()
    }

    fn default_command_timeout_ms() -> u64 {
        1000
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: Self::default_kind(),
            lsp: Self::default_lsp(),
            connect: Self::default_connect(),
            disconnect: Self::default_disconnect(),
            command_timeout_ms: Self::default_command_timeout_ms(),
        }
    }
}

/// Infrastructure configuration - cannot change at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub backend: BackendConfig,
}
