//! Start/stop/restart of the loopback listener.
//!
//! State machine: `Stopped -> Starting -> Running -> Stopping -> Stopped`,
//! with `Errored` entered from `Starting` (bind failure) or `Running` (the
//! serving task ended on its own). Every transition is published on the
//! watch channel returned by [`BrokerService::subscribe_status`] and as a
//! [`BrokerEvent::StatusChanged`] notification.

use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use serde::Serialize;
use tokenvault_store::VaultStore;
use tokio::{
    net::TcpListener,
    sync::{oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    http_server::{self, HttpState},
    settings::BrokerSettings,
    BrokerError, BrokerEvent, NotificationHub, DEFAULT_EVENT_BUFFER,
};

pub const DEFAULT_PORT: u16 = 9999;
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between stop and start on restart so the OS releases the port.
pub const MIN_RESTART_DELAY: Duration = Duration::from_millis(500);
/// How long a forced stop waits for cut-off connections to close.
const FORCE_CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Errored,
}

impl ServiceState {
    pub fn is_running(self) -> bool {
        matches!(self, ServiceState::Running)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Errored => "errored",
        };
        f.write_str(label)
    }
}

/// Snapshot published on every transition. `port` is the bound port while a
/// listener exists, the configured port otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was listening.
    AlreadyStopped,
    /// In-flight requests drained before the deadline.
    Graceful,
    /// The deadline passed and the listener was closed forcefully.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Loopback port; `0` lets the OS pick one.
    pub port: u16,
    pub stop_timeout: Duration,
    pub restart_delay: Duration,
    pub event_buffer: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            restart_delay: MIN_RESTART_DELAY,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl From<&BrokerSettings> for BrokerOptions {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            port: settings.server_port,
            stop_timeout: settings.stop_timeout,
            restart_delay: settings.restart_delay,
            event_buffer: settings.event_buffer,
        }
    }
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    /// Ends event streams and in-flight handlers once the drain deadline passes.
    force_close: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

/// Owns the listener and its lifecycle.
///
/// Lifecycle calls are serialised: a `stop` issued while `start` is binding
/// waits for the bind to finish.
pub struct BrokerService {
    store: Arc<dyn VaultStore>,
    notifier: NotificationHub,
    options: BrokerOptions,
    status: Arc<watch::Sender<ServiceStatus>>,
    server: Mutex<Option<RunningServer>>,
}

impl BrokerService {
    pub fn new(store: Arc<dyn VaultStore>, options: BrokerOptions) -> Self {
        let notifier = NotificationHub::new(options.event_buffer);
        let (status, _) = watch::channel(ServiceStatus {
            state: ServiceState::Stopped,
            port: options.port,
        });

        Self {
            store,
            notifier,
            options,
            status: Arc::new(status),
            server: Mutex::new(None),
        }
    }

    pub fn notifier(&self) -> NotificationHub {
        self.notifier.clone()
    }

    pub fn store(&self) -> Arc<dyn VaultStore> {
        Arc::clone(&self.store)
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ServiceStatus> {
        self.status.subscribe()
    }

    /// Address of the live listener, if any.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|server| server.addr)
    }

    /// Binds `127.0.0.1:<port>` and starts serving. Returns the bound address;
    /// calling it while already running returns the current address.
    pub async fn start(&self) -> Result<SocketAddr, BrokerError> {
        let mut slot = self.server.lock().await;

        if let Some(running) = slot.as_ref() {
            if !running.task.is_finished() {
                return Ok(running.addr);
            }
        }
        if let Some(dead) = slot.take() {
            // The serving task already reported its failure; just reap it.
            if let Err(err) = dead.task.await {
                tracing::debug!("reaped failed broker task: {err}");
            }
        }

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.options.port));
        self.transition(
            ServiceState::Starting,
            self.options.port,
            format!("Starting broker on {addr}"),
        );

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => return Err(self.bind_failed(addr, source)),
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(source) => return Err(self.bind_failed(addr, source)),
        };

        let force_close = CancellationToken::new();
        let state = HttpState::new(
            Arc::clone(&self.store),
            self.notifier.clone(),
            self.status.subscribe(),
            force_close.clone(),
        );
        let router = http_server::router(state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        self.transition(
            ServiceState::Running,
            local_addr.port(),
            format!("Broker listening on http://{local_addr}"),
        );

        let status = Arc::clone(&self.status);
        let notifier = self.notifier.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async move {
                    // A dropped sender also means "shut down".
                    let _ = shutdown_rx.await;
                })
                .await;

            // While stopping, `stop` owns the next transition.
            let failed = status.send_if_modified(|current| {
                if current.state == ServiceState::Running {
                    current.state = ServiceState::Errored;
                    true
                } else {
                    false
                }
            });
            if failed {
                let message = match &result {
                    Ok(()) => "Broker server exited unexpectedly".to_string(),
                    Err(err) => format!("Broker server error: {err}"),
                };
                tracing::error!("{message}");
                notifier.publish(BrokerEvent::StatusChanged {
                    is_running: false,
                    message,
                });
            }

            result
        });

        *slot = Some(RunningServer {
            addr: local_addr,
            shutdown: shutdown_tx,
            force_close,
            task,
        });

        Ok(local_addr)
    }

    /// Stops accepting connections and waits up to `timeout` for in-flight
    /// requests to finish. Calling it with nothing running is a no-op.
    pub async fn stop(&self, timeout: Duration) -> Result<StopOutcome, BrokerError> {
        let mut slot = self.server.lock().await;
        let Some(mut running) = slot.take() else {
            return Ok(StopOutcome::AlreadyStopped);
        };

        if running.task.is_finished() {
            // Errored already published by the serving task.
            if let Err(err) = running.task.await {
                tracing::debug!("reaped failed broker task: {err}");
            }
            return Ok(StopOutcome::AlreadyStopped);
        }

        let port = running.addr.port();
        self.transition(ServiceState::Stopping, port, "Stopping broker");
        let _ = running.shutdown.send(());

        match tokio::time::timeout(timeout, &mut running.task).await {
            Ok(Ok(Ok(()))) => {
                self.transition(ServiceState::Stopped, self.options.port, "Broker stopped");
                Ok(StopOutcome::Graceful)
            }
            Ok(Ok(Err(err))) => {
                let message = format!("Broker server failed while stopping: {err}");
                self.transition(ServiceState::Errored, self.options.port, message.clone());
                Err(BrokerError::Server(message))
            }
            Ok(Err(join_err)) => {
                let message = format!("Broker server task aborted: {join_err}");
                self.transition(ServiceState::Errored, self.options.port, message.clone());
                Err(BrokerError::Server(message))
            }
            Err(_) => {
                tracing::warn!(
                    "broker did not drain within {:?}, closing open connections",
                    timeout
                );
                running.force_close.cancel();

                let closed = tokio::time::timeout(FORCE_CLOSE_GRACE, &mut running.task)
                    .await
                    .is_ok();
                let message = if closed {
                    format!(
                        "Broker stopped after {} ms timeout; open connections were closed",
                        timeout.as_millis()
                    )
                } else {
                    running.task.abort();
                    format!(
                        "Broker stopped after {} ms timeout; listener closed, \
                         some connections did not close in time",
                        timeout.as_millis()
                    )
                };
                self.transition(ServiceState::Stopped, self.options.port, message);
                Ok(StopOutcome::TimedOut)
            }
        }
    }

    /// [`stop`](Self::stop) with the configured timeout.
    pub async fn shutdown(&self) -> Result<StopOutcome, BrokerError> {
        self.stop(self.options.stop_timeout).await
    }

    /// Stops, waits for the restart delay, then starts again.
    pub async fn restart(&self) -> Result<SocketAddr, BrokerError> {
        if let Err(err) = self.shutdown().await {
            tracing::warn!("restarting after failed stop: {err}");
        }
        tokio::time::sleep(self.options.restart_delay).await;
        self.start().await
    }

    fn bind_failed(&self, addr: SocketAddr, source: std::io::Error) -> BrokerError {
        self.transition(
            ServiceState::Errored,
            self.options.port,
            format!("Failed to bind {addr}: {source}"),
        );
        BrokerError::Bind { addr, source }
    }

    fn transition(&self, state: ServiceState, port: u16, message: impl Into<String>) {
        let message = message.into();
        self.status.send_replace(ServiceStatus { state, port });

        if state == ServiceState::Errored {
            tracing::error!("{message}");
        } else {
            tracing::info!("{message}");
        }

        self.notifier.publish(BrokerEvent::StatusChanged {
            is_running: state.is_running(),
            message,
        });
    }
}

impl Drop for BrokerService {
    fn drop(&mut self) {
        if let Some(running) = self.server.get_mut().take() {
            // Stopped first, so the serving task does not report its exit as
            // a failure. Nobody is left to wait for a drain.
            self.transition(
                ServiceState::Stopped,
                self.options.port,
                "Broker stopped; service handle dropped",
            );
            running.force_close.cancel();
            let _ = running.shutdown.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenvault_store::SqliteStore;
    use tokio::sync::broadcast;

    fn service(port: u16) -> BrokerService {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        BrokerService::new(
            store,
            BrokerOptions {
                port,
                ..BrokerOptions::default()
            },
        )
    }

    fn drain(events: &mut broadcast::Receiver<BrokerEvent>) -> Vec<(bool, String)> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let BrokerEvent::StatusChanged {
                is_running,
                message,
            } = event
            {
                seen.push((is_running, message));
            }
        }
        seen
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let service = service(0);
        let mut events = service.notifier().subscribe();

        let outcome = service.stop(DEFAULT_STOP_TIMEOUT).await.expect("stop");
        assert_eq!(outcome, StopOutcome::AlreadyStopped);
        assert_eq!(service.status().state, ServiceState::Stopped);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn start_then_stop_walks_the_state_machine() {
        let service = service(0);
        let mut events = service.notifier().subscribe();

        let addr = service.start().await.expect("start");
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert_eq!(
            service.status(),
            ServiceStatus {
                state: ServiceState::Running,
                port: addr.port()
            }
        );
        assert_eq!(service.local_addr().await, Some(addr));

        let outcome = service.stop(DEFAULT_STOP_TIMEOUT).await.expect("stop");
        assert_eq!(outcome, StopOutcome::Graceful);
        assert_eq!(service.status().state, ServiceState::Stopped);
        assert_eq!(service.local_addr().await, None);

        let running_flags: Vec<bool> = drain(&mut events).into_iter().map(|(r, _)| r).collect();
        // starting, running, stopping, stopped
        assert_eq!(running_flags, vec![false, true, false, false]);

        let again = service.stop(DEFAULT_STOP_TIMEOUT).await.expect("second stop");
        assert_eq!(again, StopOutcome::AlreadyStopped);
        assert_eq!(service.status().state, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn second_start_returns_existing_listener() {
        let service = service(0);
        let first = service.start().await.expect("start");
        let second = service.start().await.expect("start again");
        assert_eq!(first, second);
        service.shutdown().await.expect("stop");
    }

    #[tokio::test]
    async fn occupied_port_moves_to_errored() {
        let blocker = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("blocker");
        let port = blocker.local_addr().expect("addr").port();

        let service = service(port);
        let mut events = service.notifier().subscribe();

        let err = service.start().await.expect_err("port is taken");
        assert!(matches!(err, BrokerError::Bind { .. }));
        assert_eq!(service.status().state, ServiceState::Errored);

        let seen = drain(&mut events);
        let (running, message) = seen.last().expect("status event");
        assert!(!running);
        assert!(message.starts_with("Failed to bind"));

        // Stopping an errored service with no listener changes nothing.
        let outcome = service.stop(DEFAULT_STOP_TIMEOUT).await.expect("stop");
        assert_eq!(outcome, StopOutcome::AlreadyStopped);
        assert_eq!(service.status().state, ServiceState::Errored);

        drop(blocker);
        service.start().await.expect("start once port is free");
        assert_eq!(service.status().state, ServiceState::Running);
        service.shutdown().await.expect("stop");
    }

    #[tokio::test]
    async fn restart_comes_back_running() {
        let service = service(0);
        service.start().await.expect("start");

        let addr = service.restart().await.expect("restart");
        assert_eq!(service.status().state, ServiceState::Running);
        assert_eq!(service.status().port, addr.port());

        service.shutdown().await.expect("stop");
    }

    #[tokio::test]
    async fn restart_from_stopped_starts() {
        let service = service(0);
        service.restart().await.expect("restart");
        assert!(service.status().state.is_running());
        service.shutdown().await.expect("stop");
    }

    #[tokio::test]
    async fn dropping_a_running_service_announces_stop() {
        let service = service(0);
        let notifier = service.notifier();
        let mut status = service.subscribe_status();
        service.start().await.expect("start");
        let mut events = notifier.subscribe();

        drop(service);

        let seen = drain(&mut events);
        assert_eq!(
            seen,
            vec![(false, "Broker stopped; service handle dropped".to_string())]
        );
        assert_eq!(status.borrow_and_update().state, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn dropping_a_stopped_service_is_silent() {
        let service = service(0);
        let notifier = service.notifier();
        let mut events = notifier.subscribe();

        drop(service);

        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn options_follow_settings() {
        let settings = BrokerSettings {
            server_port: 1234,
            stop_timeout: Duration::from_secs(2),
            restart_delay: Duration::from_secs(1),
            event_buffer: 8,
            ..BrokerSettings::default()
        };
        let options = BrokerOptions::from(&settings);
        assert_eq!(options.port, 1234);
        assert_eq!(options.stop_timeout, Duration::from_secs(2));
        assert_eq!(options.restart_delay, Duration::from_secs(1));
        assert_eq!(options.event_buffer, 8);
    }
}
