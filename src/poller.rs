//! # Polling Engine
//!
//! A [`ModbusPoller`] repeatedly reads one reference window from one device and
//! forwards the decoded body to a [`PollSink`]. It remembers the last value it
//! read; with `changesOnly` enabled only values that differ from it (by the
//! data type's change rule) are forwarded. The first successful poll always
//! counts as a change.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use modbus_poll::{EndpointConfig, ModbusPoller, ModbusValue};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EndpointConfig::from_json(
//!         r#"{"host": "127.0.0.1", "dataType": "coils", "count": 16, "changesOnly": true}"#,
//!     )?;
//!
//!     let (tx, mut rx) = mpsc::channel::<ModbusValue>(16);
//!     let handle = ModbusPoller::new(config)?.spawn(tx);
//!
//!     while let Some(value) = rx.recv().await {
//!         println!("coils changed: {}", value);
//!     }
//!
//!     handle.stop().await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::codec::DataTypeCodec;
use crate::config::EndpointConfig;
use crate::connection::ModbusConnection;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::ReferenceWindow;
use crate::utils::{OperationTimer, PerformanceMetrics};
use crate::value::ModbusValue;

/// Lifecycle of a poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Between ticks
    Idle,
    /// Establishing the connection for a tick
    Connecting,
    /// Transaction in flight or value being forwarded
    Polling,
    /// Stopped by an error that repeats on every tick
    Failed,
}

/// Downstream consumer of polled values
///
/// A sink error fails the tick; the scheduler reports it and polls again on
/// the next tick.
#[async_trait]
pub trait PollSink: Send {
    async fn deliver(&mut self, value: &ModbusValue) -> ModbusResult<()>;
}

#[async_trait]
impl PollSink for mpsc::Sender<ModbusValue> {
    async fn deliver(&mut self, value: &ModbusValue) -> ModbusResult<()> {
        self.send(value.clone())
            .await
            .map_err(|_| ModbusError::sink("Receiver dropped"))
    }
}

#[async_trait]
impl PollSink for Vec<ModbusValue> {
    async fn deliver(&mut self, value: &ModbusValue) -> ModbusResult<()> {
        self.push(value.clone());
        Ok(())
    }
}

/// Adapts a closure into a [`PollSink`]
pub struct FnSink<F>(pub F);

#[async_trait]
impl<F> PollSink for FnSink<F>
where
    F: FnMut(&ModbusValue) -> ModbusResult<()> + Send,
{
    async fn deliver(&mut self, value: &ModbusValue) -> ModbusResult<()> {
        (self.0)(value)
    }
}

/// Change-detecting poller for one endpoint
pub struct ModbusPoller {
    config: EndpointConfig,
    window: ReferenceWindow,
    codec: &'static DataTypeCodec,
    connection: Arc<ModbusConnection>,
    last_polled: Option<ModbusValue>,
    state: PollerState,
    metrics: PerformanceMetrics,
}

impl ModbusPoller {
    /// Create a poller with its own connection
    ///
    /// Invalid configuration fails here rather than on the first tick.
    pub fn new(config: EndpointConfig) -> ModbusResult<Self> {
        let connection = Arc::new(ModbusConnection::new(config.descriptor()));
        Self::with_connection(config, connection)
    }

    /// Create a poller on an existing connection handle
    pub fn with_connection(
        config: EndpointConfig,
        connection: Arc<ModbusConnection>,
    ) -> ModbusResult<Self> {
        config.validate()?;
        Ok(Self {
            window: config.window(),
            codec: config.data_type.codec(),
            config,
            connection,
            last_polled: None,
            state: PollerState::Idle,
            metrics: PerformanceMetrics::new(),
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ModbusConnection> {
        &self.connection
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Most recent successfully decoded value
    pub fn last_polled(&self) -> Option<&ModbusValue> {
        self.last_polled.as_ref()
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    /// Run one tick
    ///
    /// Returns whether the value was forwarded to `sink`. Errors are returned
    /// to the caller untouched; nothing is retried within a tick.
    pub async fn poll<S: PollSink + ?Sized>(&mut self, sink: &mut S) -> ModbusResult<bool> {
        self.state = if self.connection.is_connected() {
            PollerState::Polling
        } else {
            PollerState::Connecting
        };

        let timer = OperationTimer::start("poll");
        let result = self.tick(sink).await;
        let duration = timer.stop();

        match &result {
            Ok(_) => {
                self.metrics.record_success(duration);
                self.state = PollerState::Idle;
            }
            Err(e) => {
                self.metrics.record_failure(duration, e);
                self.state = if e.is_fatal() {
                    PollerState::Failed
                } else {
                    PollerState::Idle
                };
            }
        }
        result
    }

    async fn tick<S: PollSink + ?Sized>(&mut self, sink: &mut S) -> ModbusResult<bool> {
        let request = self.codec.read_request(self.connection.unit_id(), self.window);
        let response = self.connection.execute(&request).await?;
        self.state = PollerState::Polling;

        let value = self.codec.decode(&response, self.window.count)?;
        let changed = self.codec.changed(self.last_polled.as_ref(), Some(&value));
        let forward = !self.config.changes_only || changed;
        self.last_polled = Some(value);

        if forward {
            if let Some(value) = &self.last_polled {
                sink.deliver(value).await?;
            }
        }
        Ok(forward)
    }

    /// Run the poller on a Tokio task until stopped
    ///
    /// Waits `initialDelayMs`, then polls with `pollDelayMs` between the end of
    /// one tick and the start of the next. Dropping the returned handle stops
    /// the task as well.
    pub fn spawn<S: PollSink + 'static>(self, sink: S) -> PollerHandle {
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_rx = shutdown_tx.subscribe();
        let connection = self.connection.clone();
        let task = tokio::spawn(self.run(sink, shutdown_rx));

        PollerHandle {
            shutdown_tx,
            connection,
            task,
        }
    }

    async fn run<S: PollSink>(
        mut self,
        mut sink: S,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> ModbusResult<ModbusPoller> {
        info!(
            "Polling {} {} at {} every {}ms",
            self.config.data_type,
            self.window,
            self.connection.descriptor(),
            self.config.poll_delay_ms
        );

        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(self),
            _ = sleep(self.config.initial_delay()) => {}
        }

        loop {
            let outcome = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => None,
                result = self.poll(&mut sink) => Some(result),
            };

            match outcome {
                None => break,
                Some(Ok(true)) => debug!("Forwarded value from {}", self.connection.descriptor()),
                Some(Ok(false)) => debug!("No change at {}", self.connection.descriptor()),
                Some(Err(e)) if e.is_fatal() => {
                    error!("Polling {} stopped: {}", self.connection.descriptor(), e);
                    return Err(e);
                }
                Some(Err(e)) => warn!("Poll of {} failed: {}", self.connection.descriptor(), e),
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = sleep(self.config.poll_delay()) => {}
            }
        }

        info!("Stopped polling {}", self.connection.descriptor());
        Ok(self)
    }
}

/// Handle to a spawned poller
pub struct PollerHandle {
    shutdown_tx: broadcast::Sender<()>,
    connection: Arc<ModbusConnection>,
    task: JoinHandle<ModbusResult<ModbusPoller>>,
}

impl PollerHandle {
    /// Whether the task has ended on its own (fatal error)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn connection(&self) -> &Arc<ModbusConnection> {
        &self.connection
    }

    /// Stop polling, close the connection and wait for the task
    ///
    /// Returns the poller, or the fatal error that ended it early.
    pub async fn stop(self) -> ModbusResult<ModbusPoller> {
        let _ = self.shutdown_tx.send(());
        let closed = self.connection.close().await;

        let poller = self
            .task
            .await
            .map_err(|e| ModbusError::connection(format!("Poller task aborted: {}", e)))??;
        closed?;
        Ok(poller)
    }
}
