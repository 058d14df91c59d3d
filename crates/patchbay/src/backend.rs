//! Graph backend contract and an in-memory implementation.
//!
//! Real backends sit behind a process-spawn boundary and a call may take up
//! to about a second; nothing in the core calls them while holding a lock.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::BackendError;
use crate::snapshot::Topology;

#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Read the live connectivity: `(entity, is_sink) -> neighbors`.
    async fn poll_topology(&self) -> Result<Topology, BackendError>;

    async fn connect(&self, source: &str, sink: &str) -> Result<(), BackendError>;

    async fn disconnect(&self, source: &str, sink: &str) -> bool;

    async fn exists(&self, port: &str) -> bool;
}

/// A call recorded by [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Connect(String, String),
    Disconnect(String, String),
}

#[derive(Debug, Default)]
struct MemoryGraph {
    /// port name -> is_sink
    ports: BTreeMap<String, bool>,
    /// (source, sink)
    links: BTreeSet<(String, String)>,
    fail_connects: u32,
    fail_polls: u32,
    calls: Vec<BackendCall>,
}

/// In-memory patch graph.
///
/// Used by tests and by the daemon's dry-run mode. External processes are
/// simulated with [`MemoryBackend::link`] / [`MemoryBackend::unlink`], which
/// are not recorded as calls.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    graph: Mutex<MemoryGraph>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a backend with source and sink ports.
    pub fn with_ports<'a>(
        sources: impl IntoIterator<Item = &'a str>,
        sinks: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let backend = Self::new();
        for name in sources {
            backend.add_port(name, false);
        }
        for name in sinks {
            backend.add_port(name, true);
        }
        backend
    }

    pub fn add_port(&self, name: &str, is_sink: bool) {
        self.graph.lock().ports.insert(name.to_string(), is_sink);
    }

    /// Remove a port and every link touching it, like a device unplug.
    pub fn remove_port(&self, name: &str) {
        let mut graph = self.graph.lock();
        graph.ports.remove(name);
        graph.links.retain(|(src, snk)| src != name && snk != name);
    }

    /// Connect two ports as another process would.
    pub fn link(&self, source: &str, sink: &str) {
        self.graph
            .lock()
            .links
            .insert((source.to_string(), sink.to_string()));
    }

    /// Disconnect two ports as another process would.
    pub fn unlink(&self, source: &str, sink: &str) {
        self.graph
            .lock()
            .links
            .remove(&(source.to_string(), sink.to_string()));
    }

    pub fn is_linked(&self, source: &str, sink: &str) -> bool {
        self.graph
            .lock()
            .links
            .contains(&(source.to_string(), sink.to_string()))
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.graph.lock().fail_connects = n;
    }

    /// Make the next `n` polls fail.
    pub fn fail_next_polls(&self, n: u32) {
        self.graph.lock().fail_polls = n;
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.graph.lock().calls.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.graph
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, BackendCall::Connect(..)))
            .count()
    }
}

#[async_trait]
impl GraphBackend for MemoryBackend {
    async fn poll_topology(&self) -> Result<Topology, BackendError> {
        let mut graph = self.graph.lock();
        if graph.fail_polls > 0 {
            graph.fail_polls -= 1;
            return Err(BackendError::Refused("poll failure injected".to_string()));
        }

        let mut topology = Topology::new();
        for (name, is_sink) in &graph.ports {
            let neighbors = graph
                .links
                .iter()
                .filter_map(|(src, snk)| {
                    if *is_sink && snk == name {
                        Some(src.clone())
                    } else if !*is_sink && src == name {
                        Some(snk.clone())
                    } else {
                        None
                    }
                })
                .collect();
            topology.insert((name.clone(), *is_sink), neighbors);
        }
        Ok(topology)
    }

    async fn connect(&self, source: &str, sink: &str) -> Result<(), BackendError> {
        let mut graph = self.graph.lock();
        graph
            .calls
            .push(BackendCall::Connect(source.to_string(), sink.to_string()));

        if graph.fail_connects > 0 {
            graph.fail_connects -= 1;
            return Err(BackendError::Refused(format!("{} -> {}", source, sink)));
        }
        for port in [source, sink] {
            if !graph.ports.contains_key(port) {
                return Err(BackendError::UnknownPort(port.to_string()));
            }
        }
        graph.links.insert((source.to_string(), sink.to_string()));
        Ok(())
    }

    async fn disconnect(&self, source: &str, sink: &str) -> bool {
        let mut graph = self.graph.lock();
        graph
            .calls
            .push(BackendCall::Disconnect(source.to_string(), sink.to_string()));
        graph
            .links
            .remove(&(source.to_string(), sink.to_string()))
    }

    async fn exists(&self, port: &str) -> bool {
        self.graph.lock().ports.contains_key(port)
    }
}
