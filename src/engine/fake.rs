//! Scripted in-process engine for tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

use super::{Capabilities, Engine, EngineError, EngineEvent, TunnelSpec};

pub struct FakeEngine {
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_probe: AtomicBool,
    delays: Mutex<FakeDelays>,
    probe_latency_ms: u64,
    queued: Mutex<Vec<EngineEvent>>,
    events: broadcast::Sender<EngineEvent>,
    capabilities: Capabilities,
    push: bool,
}

#[derive(Default, Clone, Copy)]
struct FakeDelays {
    start: Duration,
    stop: Duration,
    probe: Duration,
}

impl FakeEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fail_probe: AtomicBool::new(false),
            delays: Mutex::new(FakeDelays::default()),
            probe_latency_ms: 7,
            queued: Mutex::new(Vec::new()),
            events,
            capabilities: Capabilities {
                tunnels: true,
                node_telemetry: true,
            },
            push: true,
        }
    }

    pub fn without_telemetry(mut self) -> Self {
        self.capabilities.node_telemetry = false;
        self
    }

    /// Report events only through `poll`.
    pub fn without_push(mut self) -> Self {
        self.push = false;
        self
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.delays.lock().unwrap().start = delay;
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        self.delays.lock().unwrap().stop = delay;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        self.delays.lock().unwrap().probe = delay;
    }

    pub fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Push an event to subscribers.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Queue an event for the next `poll`.
    pub fn queue(&self, event: EngineEvent) {
        self.queued.lock().unwrap().push(event);
    }

    fn delays(&self) -> FakeDelays {
        *self.delays.lock().unwrap()
    }
}

#[async_trait]
impl Engine for FakeEngine {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn start_tunnel(&self, _spec: &TunnelSpec) -> Result<(), EngineError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delays().start).await;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("hop unreachable".to_string()));
        }
        Ok(())
    }

    async fn stop_tunnel(&self, _spec: &TunnelSpec) -> Result<(), EngineError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delays().stop).await;
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(EngineError::Unreachable("connection refused".to_string()));
        }
        Ok(())
    }

    async fn probe(&self, _spec: &TunnelSpec) -> Result<u64, EngineError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delays().probe).await;
        if self.fail_probe.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("no route to target".to_string()));
        }
        Ok(self.probe_latency_ms)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<EngineEvent>> {
        self.push.then(|| self.events.subscribe())
    }

    async fn poll(&self) -> Result<Vec<EngineEvent>, EngineError> {
        Ok(std::mem::take(&mut *self.queued.lock().unwrap()))
    }
}
