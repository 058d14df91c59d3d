use parking_lot::Mutex;
use patchbay::{
    Acquirable, ConnectionPolicy, Endpoint, EventBus, EventKind, MemoryBackend, MessageBus, PatchEvent,
    ReconciliationManager, Role, SignalPath,
};
use patchconf::ReconcileConfig;
use std::sync::Arc;

/// A small appliance: two capture inputs, a stereo mixer, a two-channel
/// recorder and the playback outputs.
pub struct TestFixture {
    pub backend: Arc<MemoryBackend>,
    pub bus: Arc<EventBus>,
    pub manager: Arc<ReconciliationManager>,
    pub events: Arc<Mutex<Vec<PatchEvent>>>,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_config(Self::config())
    }

    pub fn config() -> ReconcileConfig {
        ReconcileConfig {
            poll_interval_ms: 200,
            first_wait_ms: 500,
            base_interval_ms: 1000,
            max_attempts: 5,
            workers: 4,
        }
    }

    pub fn with_config(config: ReconcileConfig) -> Self {
        let backend = Arc::new(MemoryBackend::with_ports(
            ["system:capture_1", "system:capture_2", "mixer:out_l", "mixer:out_r"],
            [
                "recorder:in_1",
                "recorder:in_2",
                "system:playback_1",
                "system:playback_2",
            ],
        ));
        let bus = Arc::new(EventBus::new());

        let events = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&events);
        bus.register_all(Arc::new(move |event: &PatchEvent| -> anyhow::Result<()> {
            recorder.lock().push(event.clone());
            Ok(())
        }));

        let manager = Arc::new(ReconciliationManager::from_config(
            &config,
            backend.clone(),
            bus.clone(),
        ));

        Self {
            backend,
            bus,
            manager,
            events,
        }
    }

    pub fn endpoint(&self, names: &[&str], role: Role) -> Endpoint {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        self.manager
            .endpoint(&names, role)
            .expect("endpoint needs at least one name")
    }

    /// Acquire both endpoints, resolve the route and acquire its paths.
    pub fn route(
        &self,
        source: &[&str],
        sink: &[&str],
        policy: ConnectionPolicy,
    ) -> Vec<Arc<SignalPath>> {
        let source = self.endpoint(source, Role::Source);
        let sink = self.endpoint(sink, Role::Sink);
        self.manager.acquire(&source);
        self.manager.acquire(&sink);

        let paths = self.manager.get_signal_paths(&source, &sink, policy);
        for path in &paths {
            path.acquire();
        }
        paths
    }

    pub fn subjects(&self, kind: EventKind) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.subject.clone())
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}
