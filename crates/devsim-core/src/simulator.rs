//! Main loop of the device simulator.
//!
//! ```text
//! Starting ──connect / start service──▶ Running ──shutdown──▶ Stopping ──▶ Stopped
//! ```
//!
//! The only way out of `Running` is the shutdown future passed to
//! [`Simulator::run`], normally [`shutdown_signal`].

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::connection::DeviceSession;
use crate::error::Result;
use crate::telemetry::TelemetryPublisher;

/// Lifecycle of the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatorState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Summary returned once the simulator has stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Readings handed to the transport
    pub published: u64,
    /// Publish attempts that failed
    pub failed: u64,
}

/// Wires a session and a telemetry publisher together.
pub struct Simulator<S: DeviceSession> {
    session: S,
    publisher: TelemetryPublisher,
    interval: Duration,
    state: SimulatorState,
}

impl<S: DeviceSession> Simulator<S> {
    pub fn new(session: S, publisher: TelemetryPublisher, interval: Duration) -> Self {
        Self {
            session,
            publisher,
            interval,
            state: SimulatorState::Starting,
        }
    }

    pub fn state(&self) -> SimulatorState {
        self.state
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Consume the simulator and return its session.
    pub fn into_session(self) -> S {
        self.session
    }

    fn transition(&mut self, next: SimulatorState) {
        info!(category = "simulator", from = ?self.state, to = ?next, "State change");
        self.state = next;
    }

    /// Run until `shutdown` resolves.
    ///
    /// A failed connect or service start is logged and the publish loop
    /// starts anyway; the transport keeps trying to reconnect underneath.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<RunReport>
    where
        F: Future<Output = ()>,
    {
        if self.state != SimulatorState::Starting {
            warn!(category = "simulator", state = ?self.state, "Simulator already ran");
            return Ok(RunReport::default());
        }

        info!(category = "simulator", "Starting IoT device simulator");
        if let Err(e) = self.session.connect().await {
            error!(category = "simulator", "Connect failed: {}", e);
        }
        if let Err(e) = self.session.start_background_service().await {
            error!(category = "simulator", "Background service failed to start: {}", e);
        }
        self.transition(SimulatorState::Running);

        let mut report = RunReport::default();
        tokio::pin!(shutdown);

        loop {
            let tick = async {
                match self.publisher.publish_once(&mut self.session).await {
                    Ok(_) => report.published += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(category = "telemetry", "{}", e);
                    }
                }
                tokio::time::sleep(self.interval).await;
            };

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tick => {}
            }
        }

        self.transition(SimulatorState::Stopping);
        info!(category = "simulator", "Simulator stopped by user");
        if let Err(e) = self.session.stop_background_service().await {
            warn!(category = "simulator", "Failed to stop background service: {}", e);
        }
        if let Err(e) = self.session.disconnect().await {
            warn!(category = "simulator", "Disconnect failed: {}", e);
        }
        self.transition(SimulatorState::Stopped);

        info!(
            category = "simulator",
            published = report.published,
            failed = report.failed,
            "Shutdown complete"
        );
        Ok(report)
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(category = "simulator", "Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(category = "simulator", "Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!(category = "simulator", "Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!(category = "simulator", "Received SIGTERM, starting graceful shutdown");
        }
    }
}
