//! Client facade: owns the running streams and the health monitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::{ClientConfig, StreamConfig};
use crate::error::{ClientError, ClientResult};
use crate::health::ConnectionHealthMonitor;
use crate::provider::CallbacksProvider;
use crate::state_machine::{ServiceCallStateMachine, StreamController, StreamOptions};

/// Entry point for hosts. Must be created inside a tokio runtime.
pub struct IngestClient {
    provider: Arc<CallbacksProvider>,
    config: ClientConfig,
    streams: DashMap<String, StreamController>,
    monitor: Option<Arc<ConnectionHealthMonitor>>,
    shut_down: AtomicBool,
}

impl IngestClient {
    /// Validate `config`, start the health monitor if enabled and raise `client_ready`.
    pub fn new(provider: Arc<CallbacksProvider>, config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        if provider.api_callback_count() == 0 {
            warn!("no api callbacks registered, every stream will fail");
        }

        let monitor = config.health.enabled.then(|| {
            let monitor =
                ConnectionHealthMonitor::new(Arc::clone(&provider), config.health.to_health_config());
            monitor.start();
            monitor
        });

        provider.producer_events().client_ready();
        info!(
            api_callbacks = provider.api_callback_count(),
            continuous_retry = config.continuous_retry,
            health = config.health.enabled,
            "client ready"
        );

        Ok(Self {
            provider,
            config,
            streams: DashMap::new(),
            monitor,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Callbacks this client dispatches through.
    pub fn provider(&self) -> &Arc<CallbacksProvider> {
        &self.provider
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn stream_options(&self, stream: &StreamConfig) -> StreamOptions {
        StreamOptions {
            service_call_timeout: self.config.service_call_timeout(),
            retry: self.config.retry_policy(),
            connection_staleness: stream.connection_staleness(&self.config.health),
            max_latency: stream.max_latency(&self.config.health),
        }
    }

    /// Start a stream. A name may be reused once its previous stream has
    /// reached a terminal state.
    pub fn create_stream(&self, stream: StreamConfig) -> ClientResult<StreamController> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ClientError::Stopped);
        }
        stream.validate()?;

        if let Some(existing) = self.streams.get(&stream.name) {
            if !existing.state().is_terminal() {
                return Err(ClientError::StreamExists {
                    name: stream.name.clone(),
                });
            }
        }

        let options = self.stream_options(&stream);
        let name = stream.name.clone();
        let controller = ServiceCallStateMachine::start(Arc::clone(&self.provider), stream, options);
        if let Some(monitor) = &self.monitor {
            monitor.register(controller.clone());
        }
        self.streams.insert(name, controller.clone());
        info!(stream = %controller.name(), "stream created");
        Ok(controller)
    }

    /// Start every stream listed in the configuration.
    pub fn create_configured_streams(&self) -> ClientResult<Vec<StreamController>> {
        self.config
            .streams
            .iter()
            .cloned()
            .map(|stream| self.create_stream(stream))
            .collect()
    }

    /// Controller of a live stream by name.
    pub fn stream(&self, name: &str) -> Option<StreamController> {
        self.streams.get(name).map(|entry| entry.value().clone())
    }

    /// Number of streams not yet freed.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Stop one stream, wait for it to close and forget it.
    pub async fn free_stream(&self, name: &str) -> ClientResult<()> {
        let Some((_, controller)) = self.streams.remove(name) else {
            return Err(ClientError::invalid_arg(format!("unknown stream {name:?}")));
        };
        if let Some(monitor) = &self.monitor {
            monitor.unregister(name);
        }
        controller.stop();
        controller.join().await;
        self.provider.producer_events().stream_shutdown(name);
        Ok(())
    }

    /// Forward a storage shortage to the producer callbacks.
    pub fn report_storage_pressure(&self, remaining_bytes: u64) {
        warn!(remaining_bytes, "storage overflow pressure");
        self.provider
            .producer_events()
            .storage_overflow_pressure(remaining_bytes);
    }

    /// Stop every stream and the health monitor. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(monitor) = &self.monitor {
            monitor.stop().await;
        }

        let controllers: Vec<StreamController> = self
            .streams
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.streams.clear();

        for controller in &controllers {
            controller.stop();
        }
        for controller in &controllers {
            controller.join().await;
            self.provider
                .producer_events()
                .stream_shutdown(controller.name());
        }

        self.provider.producer_events().client_shutdown();
        info!(streams = controllers.len(), "client shut down");
    }
}
