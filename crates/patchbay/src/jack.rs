//! Graph backend driving the JACK command-line tools.

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use patchconf::BackendConfig;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backend::GraphBackend;
use crate::error::BackendError;
use crate::snapshot::Topology;

/// Spawns `jack_lsp`, `jack_connect` and `jack_disconnect`.
#[derive(Debug, Clone)]
pub struct JackCliBackend {
    lsp: String,
    connect: String,
    disconnect: String,
    timeout: Duration,
}

impl JackCliBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            lsp: config.lsp.clone(),
            connect: config.connect.clone(),
            disconnect: config.disconnect.clone(),
            timeout: Duration::from_millis(config.command_timeout_ms),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<Output, BackendError> {
        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(BackendError::Spawn {
                command: program.to_string(),
                source,
            }),
            Err(_) => Err(BackendError::Timeout {
                command: program.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

impl Default for JackCliBackend {
    fn default() -> Self {
        Self::new(&BackendConfig::default())
    }
}

#[async_trait]
impl GraphBackend for JackCliBackend {
    async fn poll_topology(&self) -> Result<Topology, BackendError> {
        let output = self.run(&self.lsp, &["-c", "-p"]).await?;
        if !output.status.success() {
            return Err(failed(&self.lsp, &output));
        }
        Ok(parse_lsp(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn connect(&self, source: &str, sink: &str) -> Result<(), BackendError> {
        let output = self.run(&self.connect, &[source, sink]).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already connected") {
            debug!(source, sink, "ports already connected");
            return Ok(());
        }
        Err(failed(&self.connect, &output))
    }

    async fn disconnect(&self, source: &str, sink: &str) -> bool {
        match self.run(&self.disconnect, &[source, sink]).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!(source, sink, "disconnect failed: {}", e);
                false
            }
        }
    }

    async fn exists(&self, port: &str) -> bool {
        match self.run(&self.lsp, &[port]).await {
            Ok(output) => String::from_utf8_lossy(&output.stdout)
                .lines()
                .any(|line| line.trim_end() == port),
            Err(e) => {
                debug!(port, "existence check failed: {}", e);
                false
            }
        }
    }
}

fn failed(command: &str, output: &Output) -> BackendError {
    BackendError::CommandFailed {
        command: command.to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

/// Parse `jack_lsp -c -p` output.
///
/// An unindented line names a port. Lines indented with spaces list its
/// connections; a tab-indented `properties:` line marks it as a sink when it
/// contains `input`.
pub fn parse_lsp(text: &str) -> Topology {
    let mut ports: Vec<(String, bool, Vec<String>)> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(props) = line.trim_start().strip_prefix("properties:") {
            if line.starts_with(char::is_whitespace) {
                if let Some(current) = ports.last_mut() {
                    current.1 = props.split(',').any(|p| p.trim() == "input");
                }
                continue;
            }
        }
        if line.starts_with(' ') {
            if let Some(current) = ports.last_mut() {
                current.2.push(line.trim().to_string());
            }
            continue;
        }
        if line.starts_with('\t') {
            // Other tab-indented attributes (types, latency) are ignored
            continue;
        }
        ports.push((line.trim_end().to_string(), false, Vec::new()));
    }

    ports
        .into_iter()
        .map(|(name, is_sink, neighbors)| ((name, is_sink), neighbors))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::GraphSnapshot;

    const LSP_OUTPUT: &str = "system:capture_1
   recorder:in_1
\tproperties: output,physical,terminal,
system:capture_2
\tproperties: output,physical,terminal,
system:playback_1
   synth:out_l
\tproperties: input,physical,terminal,
recorder:in_1
   system:capture_1
\tproperties: input,
synth:out_l
   system:playback_1
\tproperties: output,
";

    #[test]
    fn test_parse_lsp_roles_and_connections() {
        let topology = parse_lsp(LSP_OUTPUT);
        assert_eq!(topology.len(), 5);
        assert_eq!(
            topology.get(&("system:capture_1".to_string(), false)),
            Some(&vec!["recorder:in_1".to_string()])
        );
        assert_eq!(
            topology.get(&("system:playback_1".to_string(), true)),
            Some(&vec!["synth:out_l".to_string()])
        );
        assert_eq!(
            topology.get(&("system:capture_2".to_string(), false)),
            Some(&vec![])
        );

        let snap = GraphSnapshot::from_topology(topology);
        assert!(snap.is_sink("recorder:in_1"));
        assert!(snap.is_connected_to("synth:out_l", "system:playback_1"));
    }

    #[test]
    fn test_parse_lsp_without_properties() {
        let topology = parse_lsp("a:out\n   b:in\nb:in\n   a:out\n");
        assert_eq!(topology.len(), 2);
        assert!(topology.contains_key(&("b:in".to_string(), false)));
    }

    #[test]
    fn test_parse_lsp_port_names_with_spaces() {
        let text = "a2j:Midi Through [14] (capture): Midi Through Port-0\n\tproperties: output,physical,\n";
        let topology = parse_lsp(text);
        assert!(topology.contains_key(&(
            "a2j:Midi Through [14] (capture): Midi Through Port-0".to_string(),
            false
        )));
    }

    #[test]
    fn test_parse_lsp_empty() {
        assert!(parse_lsp("").is_empty());
    }

    #[tokio::test]
    async fn test_missing_tool_is_spawn_error() {
        let backend = JackCliBackend::new(&BackendConfig {
            lsp: "/nonexistent/jack_lsp".to_string(),
            ..BackendConfig::default()
        });
        assert!(matches!(
            backend.poll_topology().await,
            Err(BackendError::Spawn { .. })
        ));
        assert!(!backend.exists("system:capture_1").await);
    }
}
