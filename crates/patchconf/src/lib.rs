//! Minimal configuration loading for the patchbay daemon.
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): things fixed for the life of the
//!   process - log level, reconcile timing, graph backend tools.
//!
//! - **Bootstrap** (`BootstrapConfig`): routes declared at startup. After
//!   startup the reconciliation manager owns the routing intent.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/patchbay/config.toml` (system)
//! 2. `~/.config/patchbay/config.toml` (user)
//! 3. `./patchbay.toml` (local override, replaced by `--config`)
//! 4. Environment variables (`PATCHBAY_*`)
//!
//! # Example Config
//!
//! ```toml
//! [telemetry]
//! log_level = "debug"
//!
//! [reconcile]
//! poll_interval_ms = 500
//! max_attempts = 8
//!
//! [backend]
//! kind = "jack"
//!
//! [[routes]]
//! source = ["system:capture_1", "system:capture_2"]
//! sink = ["recorder:in_1", "recorder:in_2"]
//! policy = "dual"
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{BootstrapConfig, RouteConfig};
pub use infra::{BackendConfig, BackendKind, InfraConfig, ReconcileConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete patchbay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PatchConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds the routing intent.
    #[serde(flatten)]
    pub bootstrap: BootstrapConfig,
}

impl PatchConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with `config_path` replacing the local override.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = PatchConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# patchbay configuration\n\n");

        output.push_str("[telemetry]\n");
        output.push_str(&format!(
            "log_level = {}\n",
            toml_string(&self.infra.telemetry.log_level)
        ));

        let reconcile = &self.infra.reconcile;
        output.push_str("\n[reconcile]\n");
        output.push_str(&format!("poll_interval_ms = {}\n", reconcile.poll_interval_ms));
        output.push_str(&format!("first_wait_ms = {}\n", reconcile.first_wait_ms));
        output.push_str(&format!("base_interval_ms = {}\n", reconcile.base_interval_ms));
        output.push_str(&format!("max_attempts = {}\n", reconcile.max_attempts));
        output.push_str(&format!("workers = {}\n", reconcile.workers));

        let backend = &self.infra.backend;
        output.push_str("\n[backend]\n");
        output.push_str(&format!("kind = {}\n", toml_string(backend.kind.as_str())));
        output.push_str(&format!("lsp = {}\n", toml_string(&backend.lsp)));
        output.push_str(&format!("connect = {}\n", toml_string(&backend.connect)));
        output.push_str(&format!("disconnect = {}\n", toml_string(&backend.disconnect)));
        output.push_str(&format!(
            "command_timeout_ms = {}\n",
            backend.command_timeout_ms
        ));

        for route in &self.bootstrap.routes {
            output.push_str("\n[[routes]]\n");
            output.push_str(&format!("source = {}\n", toml_string_list(&route.source)));
            output.push_str(&format!("sink = {}\n", toml_string_list(&route.sink)));
            output.push_str(&format!("policy = {}\n", toml_string(&route.policy)));
        }

        output
    }
}

/// A quoted TOML string, escaped as needed.
fn toml_string(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

fn toml_string_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| toml_string(s)).collect();
    format!("[{}]", quoted.join(", "))
}
