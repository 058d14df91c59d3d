//! Config file discovery, loading, and environment variable overlay.

use crate::{BootstrapConfig, ConfigError, InfraConfig, PatchConfig, RouteConfig};
use crate::infra::{BackendConfig, ReconcileConfig, TelemetryConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli), existing files only.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/patchbay/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("patchbay/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("patchbay.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<PatchConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Parse config from TOML string.
fn parse_toml(contents: &str, path: &Path) -> Result<PatchConfig, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let table: toml::Table = contents
        .parse()
        .map_err(|e: toml::de::Error| parse_err(e.to_string()))?;

    let mut infra = InfraConfig::default();

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            infra.telemetry.log_level = v.to_string();
        }
    }

    if let Some(reconcile) = table.get("reconcile").and_then(|v| v.as_table()) {
        let int = |key: &str| reconcile.get(key).and_then(|v| v.as_integer());
        if let Some(v) = int("poll_interval_ms") {
            infra.reconcile.poll_interval_ms =
                positive(v, "reconcile.poll_interval_ms").map_err(parse_err)?;
        }
        if let Some(v) = int("first_wait_ms") {
            infra.reconcile.first_wait_ms =
                non_negative(v, "reconcile.first_wait_ms").map_err(parse_err)?;
        }
        if let Some(v) = int("base_interval_ms") {
            infra.reconcile.base_interval_ms =
                non_negative(v, "reconcile.base_interval_ms").map_err(parse_err)?;
        }
        if let Some(v) = int("max_attempts") {
            infra.reconcile.max_attempts =
                narrow(non_negative(v, "reconcile.max_attempts"), "reconcile.max_attempts")
                    .map_err(parse_err)?;
        }
        if let Some(v) = int("workers") {
            let workers: usize = narrow(non_negative(v, "reconcile.workers"), "reconcile.workers")
                .map_err(parse_err)?;
            infra.reconcile.workers = workers.max(1);
        }
    }

    if let Some(backend) = table.get("backend").and_then(|v| v.as_table()) {
        if let Some(v) = backend.get("kind").and_then(|v| v.as_str()) {
            infra.backend.kind = v.parse().map_err(parse_err)?;
        }
        if let Some(v) = backend.get("lsp").and_then(|v| v.as_str()) {
            infra.backend.lsp = v.to_string();
        }
        if let Some(v) = backend.get("connect").and_then(|v| v.as_str()) {
            infra.backend.connect = v.to_string();
        }
        if let Some(v) = backend.get("disconnect").and_then(|v| v.as_str()) {
            infra.backend.disconnect = v.to_string();
        }
        if let Some(v) = backend.get("command_timeout_ms").and_then(|v| v.as_integer()) {
            infra.backend.command_timeout_ms =
                non_negative(v, "backend.command_timeout_ms").map_err(parse_err)?;
        }
    }

    let mut bootstrap = BootstrapConfig::default();
    if let Some(routes) = table.get("routes").and_then(|v| v.as_array()) {
        for (index, route) in routes.iter().enumerate() {
            let route: RouteConfig = route
                .clone()
                .try_into()
                .map_err(|e: toml::de::Error| parse_err(format!("routes[{}]: {}", index, e)))?;
            bootstrap.routes.push(route);
        }
    }

    Ok(PatchConfig { infra, bootstrap })
}

fn non_negative(value: i64, key: &str) -> Result<u64, String> {
    u64::try_from(value).map_err(|_| format!("{} must not be negative (got {})", key, value))
}

fn positive(value: i64, key: &str) -> Result<u64, String> {
    match non_negative(value, key)? {
        0 => Err(format!("{} must be greater than zero", key)),
        n => Ok(n),
    }
}

fn narrow<T: TryFrom<u64>>(value: Result<u64, String>, key: &str) -> Result<T, String> {
    let value = value?;
    T::try_from(value).map_err(|_| format!("{} is out of range (got {})", key, value))
}

/// Pick the overlay value unless it still holds the compiled default.
fn pick<T: PartialEq>(base: T, overlay: T, default: T) -> T {
    if overlay != default {
        overlay
    } else {
        base
    }
}

/// Merge two configs, with `overlay` taking precedence.
pub fn merge_configs(base: PatchConfig, overlay: PatchConfig) -> PatchConfig {
    let telemetry_default = TelemetryConfig::default();
    let reconcile_default = ReconcileConfig::default();
    let backend_default = BackendConfig::default();

    let (b, o) = (base.infra, overlay.infra);

    PatchConfig {
        infra: InfraConfig {
            telemetry: TelemetryConfig {
                log_level: pick(
                    b.telemetry.log_level,
                    o.telemetry.log_level,
                    telemetry_default.log_level,
                ),
            },
            reconcile: ReconcileConfig {
                poll_interval_ms: pick(
                    b.reconcile.poll_interval_ms,
                    o.reconcile.poll_interval_ms,
                    reconcile_default.poll_interval_ms,
                ),
                first_wait_ms: pick(
                    b.reconcile.first_wait_ms,
                    o.reconcile.first_wait_ms,
                    reconcile_default.first_wait_ms,
                ),
                base_interval_ms: pick(
                    b.reconcile.base_interval_ms,
                    o.reconcile.base_interval_ms,
                    reconcile_default.base_interval_ms,
                ),
                max_attempts: pick(
                    b.reconcile.max_attempts,
                    o.reconcile.max_attempts,
                    reconcile_default.max_attempts,
                ),
                workers: pick(
                    b.reconcile.workers,
                    o.reconcile.workers,
                    reconcile_default.workers,
                ),
            },
            backend: BackendConfig {
                kind: pick(b.backend.kind, o.backend.kind, backend_default.kind),
                lsp: pick(b.backend.lsp, o.backend.lsp, backend_default.lsp),
                connect: pick(b.backend.connect, o.backend.connect, backend_default.connect),
                disconnect: pick(
                    b.backend.disconnect,
                    o.backend.disconnect,
                    backend_default.disconnect,
                ),
                command_timeout_ms: pick(
                    b.backend.command_timeout_ms,
                    o.backend.command_timeout_ms,
                    backend_default.command_timeout_ms,
                ),
            },
        },
        // A file that declares routes replaces the whole routing intent
        bootstrap: if overlay.bootstrap.routes.is_empty() {
            base.bootstrap
        } else {
            overlay.bootstrap
        },
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut PatchConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("PATCHBAY_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("PATCHBAY_LOG_LEVEL".to_string());
    }
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    if let Ok(v) = env::var("PATCHBAY_POLL_INTERVAL_MS") {
        if let Some(ms) = v.parse::<u64>().ok().filter(|ms| *ms > 0) {
            config.infra.reconcile.poll_interval_ms = ms;
            sources.env_overrides.push("PATCHBAY_POLL_INTERVAL_MS".to_string());
        }
    }
    if let Ok(v) = env::var("PATCHBAY_MAX_ATTEMPTS") {
        if let Ok(n) = v.parse() {
            config.infra.reconcile.max_attempts = n;
            sources.env_overrides.push("PATCHBAY_MAX_ATTEMPTS".to_string());
        }
    }
    if let Ok(v) = env::var("PATCHBAY_WORKERS") {
        if let Ok(n) = v.parse::<usize>() {
            config.infra.reconcile.workers = n.max(1);
            sources.env_overrides.push("PATCHBAY_WORKERS".to_string());
        }
    }

    if let Ok(v) = env::var("PATCHBAY_BACKEND") {
        if let Ok(kind) = v.parse() {
            config.infra.backend.kind = kind;
            sources.env_overrides.push("PATCHBAY_BACKEND".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackendKind;

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[reconcile]
poll_interval_ms = 250
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.infra.reconcile.poll_interval_ms, 250);
        assert_eq!(config.infra.reconcile.max_attempts, 5);
        assert_eq!(config.infra.backend.kind, BackendKind::Jack);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[telemetry]
log_level = "debug"

[reconcile]
poll_interval_ms = 500
first_wait_ms = 100
base_interval_ms = 200
max_attempts = 8
workers = 2

[backend]
kind = "memory"
lsp = "/usr/local/bin/jack_lsp"
command_timeout_ms = 1500

[[routes]]
source = ["system:capture_1", "system:capture_2"]
sink = ["rec:in_1", "rec:in_2"]
policy = "dual"

[[routes]]
source = ["synth:out"]
sink = ["system:playback_1"]
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();

        assert_eq!(config.infra.telemetry.log_level, "debug");
        assert_eq!(config.infra.reconcile.first_wait_ms, 100);
        assert_eq!(config.infra.reconcile.base_interval_ms, 200);
        assert_eq!(config.infra.reconcile.workers, 2);
        assert_eq!(config.infra.backend.kind, BackendKind::Memory);
        assert_eq!(config.infra.backend.lsp, "/usr/local/bin/jack_lsp");
        assert_eq!(config.infra.backend.connect, "jack_connect");
        assert_eq!(config.infra.backend.command_timeout_ms, 1500);

        assert_eq!(config.bootstrap.routes.len(), 2);
        assert_eq!(config.bootstrap.routes[0].policy, "dual");
        assert_eq!(config.bootstrap.routes[0].source.len(), 2);
        assert_eq!(config.bootstrap.routes[1].policy, "default");
    }

    #[test]
    fn test_parse_rejects_negative_interval() {
        let toml = r#"
[reconcile]
poll_interval_ms = -5
"#;
        let err = parse_toml(toml, Path::new("bad.toml")).unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_parse_rejects_zero_interval() {
        let toml = r#"
[reconcile]
poll_interval_ms = 0
"#;
        let err = parse_toml(toml, Path::new("bad.toml")).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn test_parse_rejects_oversized_attempt_cap() {
        let toml = format!("[reconcile]\nmax_attempts = {}\n", u64::from(u32::MAX) + 1);
        let err = parse_toml(&toml, Path::new("bad.toml")).unwrap_err();
        assert!(err.to_string().contains("max_attempts is out of range"));

        let toml = format!("[reconcile]\nmax_attempts = {}\n", u32::MAX);
        let config = parse_toml(&toml, Path::new("ok.toml")).unwrap();
        assert_eq!(config.infra.reconcile.max_attempts, u32::MAX);
    }

    #[test]
    fn test_parse_rejects_unknown_backend() {
        let toml = r#"
[backend]
kind = "coreaudio"
"#;
        assert!(parse_toml(toml, Path::new("bad.toml")).is_err());
    }

    #[test]
    fn test_merge_overlay_wins_on_non_default() {
        let mut base = PatchConfig::default();
        base.infra.reconcile.max_attempts = 7;
        base.infra.telemetry.log_level = "warn".to_string();

        let mut overlay = PatchConfig::default();
        overlay.infra.reconcile.poll_interval_ms = 50;

        let merged = merge_configs(base, overlay);
        assert_eq!(merged.infra.reconcile.max_attempts, 7);
        assert_eq!(merged.infra.reconcile.poll_interval_ms, 50);
        assert_eq!(merged.infra.telemetry.log_level, "warn");
    }

    #[test]
    fn test_merge_routes_replace_only_when_declared() {
        let mut base = PatchConfig::default();
        base.bootstrap.routes.push(RouteConfig {
            source: vec!["a:out".to_string()],
            sink: vec!["b:in".to_string()],
            policy: "mono".to_string(),
        });

        let merged = merge_configs(base.clone(), PatchConfig::default());
        assert_eq!(merged.bootstrap.routes.len(), 1);

        let mut overlay = PatchConfig::default();
        overlay.bootstrap.routes.push(RouteConfig {
            source: vec!["c:out".to_string()],
            sink: vec!["d:in".to_string()],
            policy: "mono".to_string(),
        });
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.bootstrap.routes.len(), 1);
        assert_eq!(merged.bootstrap.routes[0].source, vec!["c:out".to_string()]);
    }

    #[test]
    fn test_load_from_file_via_cli_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[reconcile]\nworkers = 3\n\n[[routes]]\nsource = [\"x:out\"]\nsink = [\"y:in\"]\npolicy = \"mono\"\n",
        )
        .unwrap();

        let config = load_from_file(&path).unwrap();
        assert_eq!(config.infra.reconcile.workers, 3);
        assert_eq!(config.bootstrap.routes.len(), 1);

        let files = discover_config_files_with_override(Some(&path));
        assert_eq!(files.last(), Some(&path));
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = load_from_file(Path::new("/nonexistent/patchbay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }
}
