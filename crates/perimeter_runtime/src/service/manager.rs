//! Service Manager
//!
//! Owns the event bus, spawns services onto it, and shuts them down.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{
    Event, EventPublisher, Service, ServiceCommand, ServiceContext, ServiceError, ServiceHandle,
    ServiceResult, ServiceSpec, ServiceState,
};

const EVENT_BUS_CAPACITY: usize = 1024;
const COMMAND_QUEUE: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Running Service
// ─────────────────────────────────────────────────────────────────────────────

struct RunningService {
    handle: ServiceHandle,
    join_handle: JoinHandle<ServiceResult<()>>,
    spec: ServiceSpec,
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Central manager for all services and owner of the event bus
pub struct ServiceManager {
    services: DashMap<String, RunningService>,
    shutdown_tx: broadcast::Sender<()>,
    event_tx: broadcast::Sender<Event>,
    default_shutdown_timeout: Duration,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        Self {
            services: DashMap::new(),
            shutdown_tx,
            event_tx,
            default_shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Publisher for components that live outside the service model
    /// (device sessions, the coordinator)
    pub fn event_publisher(&self) -> EventPublisher {
        EventPublisher::new(self.event_tx.clone())
    }

    /// Receive every event on the bus
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Start a service on the bus. Fails if a singleton with the same id runs.
    pub async fn spawn<S: Service>(&self, service: S) -> ServiceResult<ServiceHandle> {
        let spec = service.spec();
        let service_id = spec.id.clone();

        if spec.singleton && self.services.contains_key(&service_id) {
            return Err(ServiceError::AlreadyRunning(service_id));
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let state = Arc::new(AtomicU8::new(ServiceState::Starting as u8));
        let handle = ServiceHandle::new(service_id.clone(), command_tx, Arc::clone(&state));

        let runner = ServiceLoop {
            ctx: ServiceContext::new(service_id.clone(), self.event_publisher()),
            command_rx,
            shutdown_rx: self.shutdown_tx.subscribe(),
            event_rx: self.event_tx.subscribe(),
            state,
            tick_interval: spec.tick_interval,
            subscriptions: spec.subscriptions.clone(),
            shutdown_timeout: spec.shutdown_timeout,
        };

        let join_handle = tokio::spawn(runner.run(service));

        self.services.insert(
            service_id,
            RunningService {
                handle: handle.clone(),
                join_handle,
                spec,
            },
        );

        Ok(handle)
    }

    /// Publish an event to every subscriber. Dropped silently when nobody listens.
    pub fn publish_event(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    pub fn emit(
        &self,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) {
        self.publish_event(Event::new(event_type, source, data));
    }

    /// Stop one service and wait for its task
    pub async fn stop(&self, service_id: &str) -> ServiceResult<()> {
        let running = self
            .services
            .remove(service_id)
            .map(|(_, v)| v)
            .ok_or_else(|| ServiceError::NotRunning(service_id.to_string()))?;

        let _ = running.handle.shutdown().await;

        match tokio::time::timeout(running.spec.shutdown_timeout, running.join_handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!(service_id, error = ?e, "Service task panicked");
                Err(ServiceError::Internal(format!("Task panicked: {:?}", e)))
            }
            Err(_) => {
                tracing::warn!(service_id, "Service shutdown timed out");
                Err(ServiceError::ShutdownTimeout)
            }
        }
    }

    /// Stop every service
    pub async fn shutdown_all(&self) -> ServiceResult<()> {
        tracing::info!(services = self.services.len(), "Shutting down all services");

        let _ = self.shutdown_tx.send(());

        let result = tokio::time::timeout(self.default_shutdown_timeout, async {
            while !self.services.is_empty() {
                self.services.retain(|_, v| !v.handle.is_terminal());
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if result.is_err() {
            tracing::warn!("Some services did not stop within timeout");
            return Err(ServiceError::ShutdownTimeout);
        }

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Task Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Everything one service task needs besides the service itself
struct ServiceLoop {
    ctx: ServiceContext,
    command_rx: mpsc::Receiver<ServiceCommand>,
    shutdown_rx: broadcast::Receiver<()>,
    event_rx: broadcast::Receiver<Event>,
    state: Arc<AtomicU8>,
    tick_interval: Option<Duration>,
    subscriptions: Vec<String>,
    shutdown_timeout: Duration,
}

impl ServiceLoop {
    fn set_state(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    async fn run<S: Service>(mut self, mut service: S) -> ServiceResult<()> {
        let service_id = self.ctx.service_id.clone();

        if let Err(e) = service.on_start(&self.ctx).await {
            tracing::error!(service_id = %service_id, error = %e, "Service failed to start");
            self.set_state(ServiceState::Failed);
            return Err(e);
        }

        self.set_state(ServiceState::Running);
        tracing::info!(service_id = %service_id, "Service started");

        let mut tick_timer = self.tick_interval.map(tokio::time::interval);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    tracing::debug!(service_id = %service_id, "Received global shutdown signal");
                    break;
                }

                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        ServiceCommand::Shutdown => break,
                        ServiceCommand::GetState(tx) => {
                            let _ = tx.send(ServiceState::from_u8(self.state.load(Ordering::SeqCst)));
                        }
                        ServiceCommand::ForceTick => {
                            if let Err(e) = service.on_tick(&self.ctx).await {
                                tracing::warn!(service_id = %service_id, error = %e, "Error during forced tick");
                            }
                        }
                    }
                }

                received = self.event_rx.recv() => {
                    match received {
                        Ok(event) => {
                            if self.subscriptions.iter().any(|p| event.matches(p)) {
                                if let Err(e) = service.on_event(&self.ctx, event).await {
                                    tracing::warn!(service_id = %service_id, error = %e, "Error handling bus event");
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(service_id = %service_id, skipped, "Service lagged behind the event bus");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = async {
                    match tick_timer.as_mut() {
                        Some(timer) => timer.tick().await,
                        None => std::future::pending::<tokio::time::Instant>().await,
                    }
                } => {
                    if let Err(e) = service.on_tick(&self.ctx).await {
                        tracing::warn!(service_id = %service_id, error = %e, "Error during tick");
                    }
                }
            }
        }

        self.set_state(ServiceState::Stopping);
        tracing::debug!(service_id = %service_id, "Service stopping");

        match tokio::time::timeout(self.shutdown_timeout, service.on_stop(&self.ctx)).await {
            Ok(Ok(())) => {
                self.set_state(ServiceState::Stopped);
                tracing::info!(service_id = %service_id, "Service stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_state(ServiceState::Failed);
                tracing::error!(service_id = %service_id, error = %e, "Service stop failed");
                Err(e)
            }
            Err(_) => {
                self.set_state(ServiceState::Failed);
                tracing::error!(service_id = %service_id, "Service stop timed out");
                Err(ServiceError::ShutdownTimeout)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default, Clone)]
    struct Counters {
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
        events: Arc<AtomicUsize>,
        ticks: Arc<AtomicUsize>,
    }

    struct CountingService {
        id: String,
        counters: Counters,
    }

    impl CountingService {
        fn new(id: &str) -> (Self, Counters) {
            let counters = Counters::default();
            (
                Self {
                    id: id.to_string(),
                    counters: counters.clone(),
                },
                counters,
            )
        }
    }

    #[async_trait::async_trait]
    impl Service for CountingService {
        fn spec(&self) -> ServiceSpec {
            ServiceSpec::new(&self.id, "Counting Service").subscribe("device/*")
        }

        async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.counters.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.counters.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_event(&mut self, _ctx: &ServiceContext, _event: Event) -> ServiceResult<()> {
            self.counters.events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.counters.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_spawn_and_stop_service() {
        let manager = ServiceManager::new();
        let (service, counters) = CountingService::new("counting");

        let handle = manager.spawn(service).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(counters.started.load(Ordering::SeqCst), 1);
        assert!(handle.is_running());

        manager.stop("counting").await.unwrap();
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_event_routing_respects_subscriptions() {
        let manager = ServiceManager::new();
        let (service, counters) = CountingService::new("routing");

        manager.spawn(service).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager.emit("device/connection", "cam-01", serde_json::json!({}));
        manager.emit("analytics/motion", "cam-01", serde_json::json!({}));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(counters.events.load(Ordering::SeqCst), 1);

        manager.shutdown_all().await.unwrap();
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forced_tick_and_state_request() {
        let manager = ServiceManager::new();
        let (service, counters) = CountingService::new("ticking");

        let handle = manager.spawn(service).await.unwrap();
        handle.tick().await.unwrap();

        assert_eq!(handle.request_state().await.unwrap(), ServiceState::Running);
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 1);

        manager.shutdown_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_singleton_constraint() {
        let manager = ServiceManager::new();
        let (first, _) = CountingService::new("singleton");
        let (second, _) = CountingService::new("singleton");

        manager.spawn(first).await.unwrap();
        let result = manager.spawn(second).await;
        assert!(matches!(result, Err(ServiceError::AlreadyRunning(_))));

        manager.shutdown_all().await.unwrap();
    }
}
