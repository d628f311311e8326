// tests/pipeline.rs

//! End-to-end exercises of the dispatch pipeline against an in-process fake
//! scanner fleet. The fake verifies envelope signatures exactly like a real
//! peer, so these tests cover signing, fan-out, queue draining, and the
//! read API without touching the open internet.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;
use uuid::Uuid;

use outpost_scanner::bus::{result_bus, NotificationHub, ProcessedBus};
use outpost_scanner::config::Config;
use outpost_scanner::coordinator::IpLeasePool;
use outpost_scanner::core::guidance::ruleset::RULESET_V1;
use outpost_scanner::core::models::{
    RawScanResult, ScanRequest, ScanResultEvent, ScanStatus, ScanType, ProtocolFamily,
    DomainStatusMap,
};
use outpost_scanner::dispatcher::{DispatchOutcome, Dispatcher};
use outpost_scanner::envelope::{ScanPayload, SignedEnvelope};
use outpost_scanner::gateway::{router, run_queue_worker, AppState};
use outpost_scanner::kv::MemoryKvStore;
use outpost_scanner::processor::ResultProcessor;
use outpost_scanner::store::{MemoryRepository, ResultRepository};

const TEST_KEY: &str = "pipeline-test-key";

struct FakeScanner {
    key: Vec<u8>,
    orders: mpsc::Sender<ScanPayload>,
    fail_https: bool,
    delay: Duration,
}

async fn fake_order(
    State(state): State<Arc<FakeScanner>>,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<String, StatusCode> {
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }
    let payload = envelope
        .open(&state.key)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let domain = payload.task.domain.clone();
    let _ = state.orders.send(payload).await;
    Ok(format!("scanned {domain}"))
}

async fn fake_https_order(
    State(state): State<Arc<FakeScanner>>,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<String, StatusCode> {
    if state.fail_https {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    fake_order(State(state), Json(envelope)).await
}

/// Binds a fake scanner on an ephemeral port and returns its address plus
/// the stream of verified orders it received.
async fn spawn_fake_scanner(fail_https: bool) -> (SocketAddr, mpsc::Receiver<ScanPayload>) {
    spawn_scanner(fail_https, Duration::ZERO).await
}

/// A fake scanner that sits on every order for `delay` before answering.
async fn spawn_delayed_scanner(delay: Duration) -> (SocketAddr, mpsc::Receiver<ScanPayload>) {
    spawn_scanner(false, delay).await
}

async fn spawn_scanner(
    fail_https: bool,
    delay: Duration,
) -> (SocketAddr, mpsc::Receiver<ScanPayload>) {
    let (tx, rx) = mpsc::channel(16);
    let state = Arc::new(FakeScanner {
        key: TEST_KEY.as_bytes().to_vec(),
        orders: tx,
        fail_https,
        delay,
    });
    let app = Router::new()
        .route("/scan/mail", post(fake_order))
        .route("/scan/tls", post(fake_order))
        .route("/scan/https", post(fake_https_order))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, rx)
}

fn config_for(addr: SocketAddr) -> Config {
    let mut config = Config::from_env().unwrap();
    config.signing_key = TEST_KEY.into();
    config.scanner_base_urls = vec![format!("http://{addr}")];
    config.queue_capacity = 8;
    config.scan_attempts = 1;
    config
}

fn web_request(test_flag: bool) -> ScanRequest {
    ScanRequest {
        scan_id: Uuid::new_v4(),
        domain: "example.org".into(),
        domain_key: "dom-1".into(),
        user_key: None,
        shared_id: Some("shared-1".into()),
        scan_type: ScanType::Web,
        selectors: vec![],
        ip_address: None,
        test_flag,
    }
}

#[tokio::test]
async fn one_failing_target_does_not_sink_the_fan_out() {
    let (addr, mut orders) = spawn_fake_scanner(true).await;
    let dispatcher = Dispatcher::new(&config_for(addr)).unwrap();

    let outcome = dispatcher.dispatch(web_request(false)).await.unwrap();
    let DispatchOutcome::Dispatched { targets } = outcome else {
        panic!("expected asynchronous dispatch");
    };
    assert_eq!(targets, 2);

    // The surviving TLS order arrived intact and signature-verified even
    // though the HTTPS endpoint answers every order with a 500.
    let payload = tokio::time::timeout(Duration::from_secs(5), orders.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload.domain_key, "dom-1");
    assert_eq!(payload.shared_id.as_deref(), Some("shared-1"));
}

#[tokio::test]
async fn slow_scanner_does_not_block_dispatch() {
    let (addr, mut orders) = spawn_delayed_scanner(Duration::from_secs(5)).await;
    let dispatcher = Dispatcher::new(&config_for(addr)).unwrap();

    let started = std::time::Instant::now();
    let outcome = dispatcher.dispatch(web_request(false)).await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "dispatch waited on the probe: {:?}",
        started.elapsed()
    );
    let DispatchOutcome::Dispatched { targets } = outcome else {
        panic!("expected asynchronous dispatch");
    };
    assert_eq!(targets, 2);

    // The detached deliveries still land once the scanner wakes up.
    let payload = tokio::time::timeout(Duration::from_secs(15), orders.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload.task.domain, "example.org");
}

#[tokio::test]
async fn delivery_deadline_outlives_the_probe_deadline() {
    let (addr, _orders) = spawn_delayed_scanner(Duration::from_millis(400)).await;
    let mut config = config_for(addr);
    // The scanner's own probe budget, far below the fake's response time.
    config.scan_timeout = Duration::from_millis(100);
    let dispatcher = Dispatcher::new(&config).unwrap();

    // A probe that overruns its own deadline but answers within the delivery
    // margin still reports back instead of counting as a failed delivery.
    let outcome = dispatcher.dispatch(web_request(true)).await.unwrap();
    let DispatchOutcome::Synchronous(body) = outcome else {
        panic!("expected synchronous dispatch");
    };
    assert_eq!(body.matches("scanned example.org").count(), 2);
}

#[tokio::test]
async fn test_flag_collects_scanner_responses_synchronously() {
    let (addr, _orders) = spawn_fake_scanner(false).await;
    let dispatcher = Dispatcher::new(&config_for(addr)).unwrap();

    let outcome = dispatcher.dispatch(web_request(true)).await.unwrap();
    let DispatchOutcome::Synchronous(body) = outcome else {
        panic!("expected synchronous dispatch");
    };
    // Both transport scanners answered; order is not guaranteed.
    assert_eq!(body.matches("scanned example.org").count(), 2);
}

#[tokio::test]
async fn queued_requests_drain_to_a_scanner() {
    let (addr, mut orders) = spawn_fake_scanner(false).await;
    let config = config_for(addr);

    let (bus, _events) = result_bus(8);
    let leases = Arc::new(IpLeasePool::new(Arc::new(MemoryKvStore::new()), 2));
    let (state, queues) = AppState::new(
        config,
        Arc::new(MemoryRepository::new()),
        bus,
        leases,
        Arc::new(NotificationHub::new()),
    )
    .unwrap();

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(run_queue_worker(
        "web",
        queues.web,
        state.dispatcher(),
        shutdown.clone(),
    ));

    let response = router(state)
        .oneshot(
            axum::http::Request::post("/scans")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    serde_json::to_string(&web_request(false)).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Both orders for the web request surface at the fake scanner.
    for _ in 0..2 {
        let payload = tokio::time::timeout(Duration::from_secs(5), orders.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.task.domain, "example.org");
    }

    shutdown.cancel();
    let _ = worker.await;
}

#[tokio::test]
async fn processed_results_surface_through_the_read_api() {
    let repository: Arc<MemoryRepository> = Arc::new(MemoryRepository::new());
    let processor = ResultProcessor::new(
        repository.clone(),
        Arc::new(NotificationHub::new()),
        ProcessedBus::new(),
        &RULESET_V1,
    );

    // A mail probe that found no records at all.
    processor
        .process(ScanResultEvent {
            scan_id: Uuid::new_v4(),
            domain: "example.org".into(),
            domain_key: "dom-1".into(),
            user_key: None,
            shared_id: None,
            protocol: ProtocolFamily::MailDns,
            results: RawScanResult::Missing,
        })
        .await
        .unwrap();

    let (addr, _orders) = spawn_fake_scanner(false).await;
    let (bus, _events) = result_bus(8);
    let (state, _queues) = AppState::new(
        config_for(addr),
        repository.clone() as Arc<dyn ResultRepository>,
        bus,
        Arc::new(IpLeasePool::new(Arc::new(MemoryKvStore::new()), 2)),
        Arc::new(NotificationHub::new()),
    )
    .unwrap();

    let response = router(state)
        .oneshot(
            axum::http::Request::get("/domains/dom-1/status")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    let map: DomainStatusMap = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(map.dmarc, ScanStatus::Fail);
    assert_eq!(map.spf, ScanStatus::Fail);
    assert_eq!(map.https, ScanStatus::Unknown);
}
