// src/gateway.rs

//! HTTP surface and queue plumbing.
//!
//! Two kinds of routes share one router. The ingress side accepts scan
//! requests, parks them on a bounded per-type queue, and answers immediately;
//! queue workers drain them through the dispatcher, which launches detached
//! deliveries with their own bounded retry, so one slow scan never backs up
//! the queue. The
//! scanner side receives signed scan orders from a dispatcher (this instance
//! or a peer), verifies the envelope, claims a per-IP lease, runs the probe,
//! and publishes the raw result onto the bus.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{NotificationHub, ResultBus};
use crate::config::Config;
use crate::coordinator::IpLeasePool;
use crate::core::models::{
    ProtocolFamily, RawScanResult, ScanRequest, ScanResultEvent, ScanType,
};
use crate::core::scanner::dns_scanner::MailDnsScanner;
use crate::core::scanner::https_scanner::HttpsScanner;
use crate::core::scanner::tls_scanner::TlsScanner;
use crate::core::scanner::{run_scan, ProtocolScanner};
use crate::dispatcher::{DispatchError, DispatchOutcome, Dispatcher};
use crate::envelope::SignedEnvelope;
use crate::store::ResultRepository;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("http client construction failed: {0}")]
    Client(#[from] reqwest::Error),
}

/// Everything the handlers need, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    mail_queue: mpsc::Sender<ScanRequest>,
    web_queue: mpsc::Sender<ScanRequest>,
    bus: ResultBus,
    leases: Arc<IpLeasePool>,
    repository: Arc<dyn ResultRepository>,
    notifications: Arc<NotificationHub>,
    mail_scanner: MailDnsScanner,
    tls_scanner: TlsScanner,
    https_scanner: HttpsScanner,
}

/// Receiver halves of the ingress queues, handed to the queue workers.
pub struct QueueReceivers {
    pub mail: mpsc::Receiver<ScanRequest>,
    pub web: mpsc::Receiver<ScanRequest>,
}

impl AppState {
    pub fn new(
        config: Config,
        repository: Arc<dyn ResultRepository>,
        bus: ResultBus,
        leases: Arc<IpLeasePool>,
        notifications: Arc<NotificationHub>,
    ) -> Result<(Self, QueueReceivers), GatewayError> {
        let (mail_tx, mail_rx) = mpsc::channel(config.queue_capacity);
        let (web_tx, web_rx) = mpsc::channel(config.queue_capacity);
        let dispatcher = Arc::new(Dispatcher::new(&config)?);

        let state = Self {
            inner: Arc::new(Inner {
                mail_scanner: MailDnsScanner::new(),
                tls_scanner: TlsScanner::new(config.connect_timeout, config.probe_timeout),
                https_scanner: HttpsScanner::new(config.probe_timeout)?,
                dispatcher,
                mail_queue: mail_tx,
                web_queue: web_tx,
                bus,
                leases,
                repository,
                notifications,
                config,
            }),
        };
        Ok((
            state,
            QueueReceivers {
                mail: mail_rx,
                web: web_rx,
            },
        ))
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.inner.dispatcher.clone()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/scans", post(submit_scan))
        .route("/scan/mail", post(scan_mail))
        .route("/scan/tls", post(scan_tls))
        .route("/scan/https", post(scan_https))
        .route("/domains/{domain_key}/status", get(domain_status))
        .route("/domains/{domain_key}/results", get(domain_results))
        .route("/notifications/{user_key}", get(notifications_stream))
        .with_state(state)
}

enum ApiError {
    Unauthorized,
    QueueFull,
    Saturated,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid scan order".to_string()),
            ApiError::QueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                "scan queue is full".to_string(),
            ),
            ApiError::Saturated => (
                StatusCode::TOO_MANY_REQUESTS,
                "target is at its probe limit".to_string(),
            ),
            ApiError::Internal(message) => {
                error!(detail = %message, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn healthz() -> &'static str {
    "ok"
}

/// Ingress. Test-flagged requests skip the queue and come back with the
/// scanners' concatenated responses; everything else is parked and answered
/// with 202.
async fn submit_scan(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Result<Response, ApiError> {
    if request.test_flag || state.inner.config.test_mode {
        let outcome = state
            .inner
            .dispatcher
            .dispatch(request)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let body = match outcome {
            DispatchOutcome::Synchronous(body) => body,
            DispatchOutcome::Dispatched { .. } => String::new(),
        };
        return Ok((StatusCode::OK, body).into_response());
    }

    let queue = match request.scan_type {
        ScanType::Mail => &state.inner.mail_queue,
        ScanType::Web => &state.inner.web_queue,
    };
    let scan_id = request.scan_id;
    match queue.try_send(request) {
        Ok(()) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "scanId": scan_id })),
        )
            .into_response()),
        Err(mpsc::error::TrySendError::Full(_)) => Err(ApiError::QueueFull),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(ApiError::Internal("scan queue closed".into()))
        }
    }
}

async fn scan_mail(
    State(state): State<AppState>,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<Json<RawScanResult>, ApiError> {
    handle_scan_order(&state, ProtocolFamily::MailDns, envelope).await
}

async fn scan_tls(
    State(state): State<AppState>,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<Json<RawScanResult>, ApiError> {
    handle_scan_order(&state, ProtocolFamily::Tls, envelope).await
}

async fn scan_https(
    State(state): State<AppState>,
    Json(envelope): Json<SignedEnvelope>,
) -> Result<Json<RawScanResult>, ApiError> {
    handle_scan_order(&state, ProtocolFamily::Https, envelope).await
}

async fn handle_scan_order(
    state: &AppState,
    protocol: ProtocolFamily,
    envelope: SignedEnvelope,
) -> Result<Json<RawScanResult>, ApiError> {
    let inner = &state.inner;
    let payload = envelope.open(inner.config.signing_key.as_bytes()).map_err(|e| {
        warn!(%protocol, error = %e, "rejected scan order");
        ApiError::Unauthorized
    })?;

    let scanner: &dyn ProtocolScanner = match protocol {
        ProtocolFamily::MailDns => &inner.mail_scanner,
        ProtocolFamily::Tls => &inner.tls_scanner,
        ProtocolFamily::Https => &inner.https_scanner,
    };

    // Lease per target IP when one is pinned, otherwise per domain.
    let lease_key = payload
        .task
        .ip_address
        .clone()
        .unwrap_or_else(|| payload.task.domain.clone());
    let claimed = inner
        .leases
        .claim(&lease_key)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if !claimed {
        return Err(ApiError::Saturated);
    }

    let raw = run_scan(scanner, &payload.task, inner.config.scan_timeout).await;

    if let Err(e) = inner.leases.release(&lease_key).await {
        warn!(lease_key, error = %e, "lease release failed; sweep will recover it");
    }

    let event = ScanResultEvent {
        scan_id: payload.task.scan_id,
        domain: payload.task.domain,
        domain_key: payload.domain_key,
        user_key: payload.user_key,
        shared_id: payload.shared_id,
        protocol,
        results: raw.clone(),
    };
    inner
        .bus
        .publish(event)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(raw))
}

async fn domain_status(
    State(state): State<AppState>,
    Path(domain_key): Path<String>,
) -> Result<Response, ApiError> {
    let map = state
        .inner
        .repository
        .status_map(&domain_key)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(map).into_response())
}

async fn domain_results(
    State(state): State<AppState>,
    Path(domain_key): Path<String>,
) -> Result<Response, ApiError> {
    let results = state
        .inner
        .repository
        .results_for_domain(&domain_key)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(results).into_response())
}

/// Live stream of the caller's processed manual scans, as server-sent
/// events. Lagged subscribers lose the oldest events silently.
async fn notifications_stream(
    State(state): State<AppState>,
    Path(user_key): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let receiver = state.inner.notifications.subscribe(&user_key).await;
    let stream = BroadcastStream::new(receiver).filter_map(|event| {
        let event = event.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(SseEvent::default().data(data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Drains one ingress queue through the dispatcher. Dispatch only launches
/// the fan-out; delivery retries run in the dispatcher's detached tasks, so
/// the worker is never parked behind a slow scan. Signing failures and an
/// empty target set are terminal for that request.
pub async fn run_queue_worker(
    label: &'static str,
    mut queue: mpsc::Receiver<ScanRequest>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) {
    info!(queue = label, "queue worker started");
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(queue = label, "queue worker stopping");
                break;
            }
            request = queue.recv() => match request {
                Some(request) => request,
                None => {
                    info!(queue = label, "queue closed, worker stopping");
                    break;
                }
            },
        };

        let scan_id = request.scan_id;
        match dispatcher.dispatch(request).await {
            Ok(DispatchOutcome::Dispatched { targets: 0 }) => {
                error!(queue = label, %scan_id, "no scanner targets configured, scan dropped");
            }
            Ok(DispatchOutcome::Dispatched { targets }) => {
                debug!(queue = label, %scan_id, targets, "scan order launched");
            }
            Ok(DispatchOutcome::Synchronous(_)) => {}
            Err(e) => {
                error!(queue = label, %scan_id, error = %e, "dispatch failed permanently");
            }
        }
    }
}
