//! Registration state machine.
//!
//! ```text
//! Disconnected --Connect--> Registering --RegisterSucceeded--> Registered
//!      ^                     |   ^                               |   |
//!      |                     +---+ RegisterFailed                |   |
//!      |                       ShutdownRequested (deferred)      |   |
//!      +----------------------- SessionEnded --------------------+   |
//!                                   Stopped <-- ShutdownRequested ---+
//! ```
//!
//! Shutdown is only honoured in `Registered`; while registering the scanner
//! keeps trying to join.

use crate::constants::{DB_RETRY_INTERVAL_SECS, REGISTER_RETRY_INTERVAL_SECS};
use crate::controller::{ControllerClient, RegistrationRecord, SessionNotice};
use crate::cvedb::DatabaseLoader;
use crate::error::{is_retryable, RetryPolicy};
use crate::logging::ScanEvent;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Disconnected,
    Registering,
    Registered,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connect,
    RegisterFailed,
    RegisterSucceeded,
    SessionEnded,
    ShutdownRequested,
}

/// The coordinator's transition table.
pub fn transition(state: CoordinatorState, event: Event) -> CoordinatorState {
    use CoordinatorState::*;
    use Event::*;

    match (state, event) {
        (Disconnected, Connect) => Registering,
        (Disconnected, ShutdownRequested) => Stopped,
        (Registering, RegisterFailed) => Registering,
        (Registering, RegisterSucceeded) => Registered,
        (Registering, ShutdownRequested) => Registering,
        (Registered, SessionEnded) => Disconnected,
        (Registered, ShutdownRequested) => Stopped,
        (state, _) => state,
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub scanner_id: String,
    pub advertise_address: String,
    pub advertise_port: u16,
    pub db_dir: PathBuf,
    pub register_retry: Duration,
}

impl CoordinatorConfig {
    pub fn new(scanner_id: &str, advertise_address: &str, advertise_port: u16, db_dir: PathBuf) -> Self {
        Self {
            scanner_id: scanner_id.to_string(),
            advertise_address: advertise_address.to_string(),
            advertise_port,
            db_dir,
            register_retry: Duration::from_secs(REGISTER_RETRY_INTERVAL_SECS),
        }
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    loader: Arc<DatabaseLoader>,
    controller: Arc<dyn ControllerClient>,
    notices: mpsc::Receiver<SessionNotice>,
    state_tx: watch::Sender<CoordinatorState>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        loader: Arc<DatabaseLoader>,
        controller: Arc<dyn ControllerClient>,
        notices: mpsc::Receiver<SessionNotice>,
    ) -> Self {
        let (state_tx, _) = watch::channel(CoordinatorState::Disconnected);
        Self {
            config,
            loader,
            controller,
            notices,
            state_tx,
        }
    }

    /// Follows state changes, e.g. to wait until the scanner is registered.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: CoordinatorState) {
        tracing::debug!(?state, "Coordinator state");
        self.state_tx.send_replace(state);
    }

    /// Runs until an external shutdown is observed while registered.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut state = CoordinatorState::Disconnected;

        loop {
            self.set_state(state);
            state = match state {
                CoordinatorState::Disconnected => transition(state, Event::Connect),
                CoordinatorState::Registering => {
                    let event = self.register().await;
                    // notices that arrived for the previous session are stale
                    while self.notices.try_recv().is_ok() {}
                    transition(state, event)
                }
                CoordinatorState::Registered => {
                    let event = self.wait_registered(&mut shutdown).await;
                    if event == Event::ShutdownRequested {
                        self.deregister().await;
                    } else {
                        tracing::info!(
                            "{}",
                            ScanEvent::SessionEnded {
                                scanner_id: self.config.scanner_id.clone()
                            }
                        );
                    }
                    transition(state, event)
                }
                CoordinatorState::Stopped => return,
            };
        }
    }

    /// Keeps trying until the controller accepts the registration.
    async fn register(&self) -> Event {
        let snapshot = loop {
            if let Some(snapshot) = self.loader.load(&self.config.db_dir, 0, None).await {
                break snapshot;
            }
            tokio::time::sleep(Duration::from_secs(DB_RETRY_INTERVAL_SECS)).await;
        };

        let policy = RetryPolicy::unlimited(self.config.register_retry);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            // shares the snapshot, entries are not copied
            let mut record = RegistrationRecord::new(
                &self.config.scanner_id,
                &self.config.advertise_address,
                self.config.advertise_port,
                &snapshot,
            );
            crate::log_register_attempt!(attempt, record.database_version);

            match self.controller.register(&record).await {
                Ok(()) => {
                    record.release_database();
                    tracing::info!(
                        "{}",
                        ScanEvent::Registered {
                            scanner_id: record.scanner_id
                        }
                    );
                    return Event::RegisterSucceeded;
                }
                Err(e) if is_retryable(&e) => {
                    tracing::warn!(attempt, error = %e, retry_in = ?policy.interval, "Register failed");
                }
                Err(e) => {
                    // the controller may still come round, keep trying
                    tracing::error!(attempt, error = %e, retry_in = ?policy.interval, "Register rejected");
                }
            }

            if !policy.should_retry(attempt) {
                return Event::RegisterFailed;
            }
            tokio::time::sleep(policy.interval).await;
        }
    }

    async fn wait_registered(&mut self, shutdown: &mut watch::Receiver<bool>) -> Event {
        let notices = &mut self.notices;
        let mut notices_open = true;

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return Event::ShutdownRequested,
                notice = notices.recv(), if notices_open => match notice {
                    Some(notice) => {
                        tracing::debug!(reason = %notice.reason, "Session notice");
                        return Event::SessionEnded;
                    }
                    None => notices_open = false,
                },
            }
        }
    }

    async fn deregister(&self) {
        match self.controller.deregister(&self.config.scanner_id).await {
            Ok(()) => tracing::info!(
                "{}",
                ScanEvent::Deregistered {
                    scanner_id: self.config.scanner_id.clone()
                }
            ),
            Err(e) => tracing::error!(error = %e, "Deregister failed"),
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // sender gone: nobody can ask for shutdown any more
            std::future::pending::<()>().await;
        }
    }
}
