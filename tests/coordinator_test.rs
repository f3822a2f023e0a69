/// Registration coordinator against a stub controller
use async_trait::async_trait;
use parking_lot::Mutex;
use regscan::constants::CVE_DB_FILE_NAME;
use regscan::controller::{
    ControllerClient, Coordinator, CoordinatorConfig, CoordinatorState, RegistrationRecord,
    SessionNotice,
};
use regscan::cvedb::{DatabaseLoader, Snapshot};
use regscan::error::{Result, ScanError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

const BACKOFF: Duration = Duration::from_millis(40);

struct StubController {
    failures_left: AtomicU32,
    attempts: Mutex<Vec<Instant>>,
    records: Mutex<Vec<RegistrationRecord>>,
    deregistered: Mutex<Vec<String>>,
}

impl StubController {
    fn failing(times: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(times),
            attempts: Mutex::new(Vec::new()),
            records: Mutex::new(Vec::new()),
            deregistered: Mutex::new(Vec::new()),
        })
    }

    fn successful_registrations(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl ControllerClient for StubController {
    async fn register(&self, record: &RegistrationRecord) -> Result<()> {
        self.attempts.lock().push(Instant::now());
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ScanError::transport("https://controller.test", "connection refused"));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn deregister(&self, scanner_id: &str) -> Result<()> {
        self.deregistered.lock().push(scanner_id.to_string());
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    controller: Arc<StubController>,
    notices: mpsc::Sender<SessionNotice>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<CoordinatorState>,
    task: tokio::task::JoinHandle<()>,
}

fn write_db(dir: &TempDir) {
    let snapshot = Snapshot {
        version: "2.870".to_string(),
        create_time: "2024-06-01T00:00:00Z".to_string(),
        vulnerabilities: HashMap::from([("CVE-2024-0001".to_string(), serde_json::json!({}))]),
    };
    std::fs::write(
        dir.path().join(CVE_DB_FILE_NAME),
        serde_json::to_vec(&snapshot).unwrap(),
    )
    .unwrap();
}

fn start(controller: Arc<StubController>) -> Harness {
    let dir = TempDir::new().unwrap();
    write_db(&dir);

    let loader =
        Arc::new(DatabaseLoader::default().with_retry_interval(Duration::from_millis(10)));
    let mut config = CoordinatorConfig::new("scanner-1", "10.0.0.9", 18402, dir.path().into());
    config.register_retry = BACKOFF;

    let (notice_tx, notice_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator = Coordinator::new(config, loader, controller.clone(), notice_rx);
    let state = coordinator.subscribe();
    let task = tokio::spawn(coordinator.run(shutdown_rx));

    Harness {
        _dir: dir,
        controller,
        notices: notice_tx,
        shutdown: shutdown_tx,
        state,
        task,
    }
}

async fn wait_for_state(state: &mut watch::Receiver<CoordinatorState>, want: CoordinatorState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while *state.borrow_and_update() != want {
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("coordinator did not reach the expected state");
}

#[tokio::test]
async fn test_registers_after_two_failures_with_backoff() {
    let mut h = start(StubController::failing(2));

    wait_for_state(&mut h.state, CoordinatorState::Registered).await;

    let attempts = h.controller.attempts.lock().clone();
    assert_eq!(attempts.len(), 3);
    for pair in attempts.windows(2) {
        assert!(pair[1] - pair[0] >= BACKOFF);
    }

    let records = h.controller.records.lock().clone();
    assert_eq!(records[0].scanner_id, "scanner-1");
    assert_eq!(records[0].database_version, "2.870");
    assert_eq!(records[0].database_len(), 1);
    assert_eq!(records[0].advertise_port, 18402);

    h.shutdown.send_replace(true);
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_while_registered_deregisters_and_stops() {
    let mut h = start(StubController::failing(0));
    wait_for_state(&mut h.state, CoordinatorState::Registered).await;

    h.shutdown.send_replace(true);
    tokio::time::timeout(Duration::from_secs(5), h.task)
        .await
        .expect("coordinator did not stop")
        .unwrap();

    assert_eq!(*h.controller.deregistered.lock(), vec!["scanner-1".to_string()]);
    assert_eq!(*h.state.borrow(), CoordinatorState::Stopped);
}

#[tokio::test]
async fn test_shutdown_is_deferred_until_registered() {
    let mut h = start(StubController::failing(3));

    // arrives while the first attempts are still failing
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.shutdown.send_replace(true);
    assert!(h.controller.deregistered.lock().is_empty());

    tokio::time::timeout(Duration::from_secs(5), &mut h.task)
        .await
        .expect("coordinator did not stop")
        .unwrap();

    assert_eq!(h.controller.attempts.lock().len(), 4);
    assert_eq!(h.controller.successful_registrations(), 1);
    assert_eq!(h.controller.deregistered.lock().len(), 1);
    wait_for_state(&mut h.state, CoordinatorState::Stopped).await;
}

#[tokio::test]
async fn test_session_notice_triggers_rejoin() {
    let mut h = start(StubController::failing(0));
    wait_for_state(&mut h.state, CoordinatorState::Registered).await;

    h.notices
        .send(SessionNotice {
            scanner_id: "scanner-1".to_string(),
            reason: "controller restarted".to_string(),
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.controller.successful_registrations() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("coordinator did not rejoin");
    wait_for_state(&mut h.state, CoordinatorState::Registered).await;

    h.shutdown.send_replace(true);
    h.task.await.unwrap();
    assert!(h.controller.deregistered.lock().len() == 1);
}

#[tokio::test]
async fn test_stale_notice_from_registering_phase_is_dropped() {
    let mut h = start(StubController::failing(2));

    // queued before the scanner ever registered
    h.notices.try_send(SessionNotice::default()).unwrap();

    wait_for_state(&mut h.state, CoordinatorState::Registered).await;
    tokio::time::sleep(BACKOFF * 2).await;
    assert_eq!(h.controller.successful_registrations(), 1);

    h.shutdown.send_replace(true);
    h.task.await.unwrap();
}
