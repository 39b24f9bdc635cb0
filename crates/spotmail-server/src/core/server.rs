use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{Extensions, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use lettre::message::Mailbox;
use sha2::{Digest, Sha256};
use spotmail_proto::{
    CronResponse, EnqueueRequest, HealthResponse, JobView, QueueStats, Recipients,
    SendEmailRequest, SendEmailResponse, TemplateName,
};
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::clock::{Clock, rfc3339};
use super::error::ApiError;
use super::mailer::{Attachment, OutboundMessage};
use super::processor::run_scheduled_batch;
use super::templates::render;
use crate::app::AppState;

const DEFAULT_ATTACHMENT_TYPE: &str = "application/octet-stream";
const NO_RECIPIENTS: &str = "`to` must name at least one recipient";

pub fn router(
    state: AppState,
    request_timeout: Duration,
) -> Router {
    Router::new()
        .route("/send-email", post(send_email).get(health))
        .route("/cron/process-emails", get(process_emails))
        .route("/cron/queue-stats", get(queue_stats))
        .route("/email-jobs", post(enqueue_job))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}

/// Serves the HTTP API until the shared shutdown token is cancelled, then
/// lets in-flight requests finish.
pub async fn run_http_server(
    listen: &str,
    state: AppState,
    request_timeout: Duration,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind http listener on {listen}"))?;
    info!("http server listening: addr={listen}");

    let shutdown = state.shutdown.clone();
    let app = router(state, request_timeout)
        .into_make_service_with_connect_info::<SocketAddr>();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("http server stopping");
        })
        .await
        .context("http server failed")?;

    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        configured: state.mailer.is_configured(),
        templates: TemplateName::ALL.iter().map(|name| name.as_str().to_string()).collect(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        dropped_alerts: state.alerter.dropped_alerts(),
    })
}

async fn send_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Result<Json<SendEmailRequest>, JsonRejection>,
) -> Result<Json<SendEmailResponse>, ApiError> {
    let peer = extensions.get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
    let key = client_key(&headers, peer, state.trust_proxy_headers);
    if !state.limiter.allow(&key).await {
        warn!("send rejected by rate limit: client={key}, limit={}", state.limiter.limit());
        return Err(ApiError::RateLimited);
    }

    let Json(request) =
        body.map_err(|rejection| ApiError::InvalidRequest(rejection.body_text()))?;
    let outbound = outbound_from_request(request)?;

    let delivery = state.mailer.send(&outbound).await.inspect_err(|err| {
        warn!(
            "send failed: client={}, code={:?}, error={}",
            key,
            err.code(),
            err
        );
    })?;

    info!(
        "send accepted: client={}, message_id={}, recipients={}",
        key,
        delivery.message_id,
        delivery.accepted.len()
    );

    Ok(Json(SendEmailResponse {
        success: true,
        message_id: delivery.message_id,
        accepted: delivery.accepted,
        rejected: delivery.rejected,
        envelope: delivery.envelope,
    }))
}

async fn process_emails(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CronResponse>, ApiError> {
    authorize(&headers, state.cron_secret.as_deref())?;

    // a dropped connection must not cancel a batch halfway
    let batch = state.clone();
    let run = tokio::spawn(async move {
        run_scheduled_batch(&batch.processor, &batch.alerter, batch.batch_size, "cron").await
    });

    let outcome = match run.await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            error!("cron batch failed: error={err}");
            return Err(ApiError::Internal);
        }
        Err(err) => {
            error!("cron batch task aborted: error={err}");
            return Err(ApiError::Internal);
        }
    };

    let stats = state.processor.queue_stats().await.map_err(|err| {
        error!("queue stats failed after batch: error={err}");
        ApiError::Internal
    })?;

    Ok(Json(CronResponse {
        success: true,
        processed: outcome,
        stats,
        timestamp: rfc3339(state.clock.now()),
    }))
}

async fn queue_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<QueueStats>, ApiError> {
    authorize(&headers, state.cron_secret.as_deref())?;

    let stats = state.processor.queue_stats().await.map_err(|err| {
        error!("queue stats failed: error={err}");
        ApiError::Internal
    })?;
    Ok(Json(stats))
}

async fn enqueue_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobView>), ApiError> {
    authorize(&headers, state.cron_secret.as_deref())?;

    let Json(request) =
        body.map_err(|rejection| ApiError::InvalidRequest(rejection.body_text()))?;
    let recipient = checked_recipients(&request.to)?;
    render(request.template, &request.data)
        .map_err(|err| ApiError::InvalidRequest(err.to_string()))?;

    let job = state
        .processor
        .enqueue(recipient, request.template, request.data)
        .await
        .map_err(|err| {
            error!("enqueue failed: error={err}");
            ApiError::Internal
        })?;

    Ok((StatusCode::CREATED, Json(job.view())))
}

/// Checks `Authorization: Bearer <secret>`; the scheme is case-insensitive.
/// Both sides are hashed first so the comparison runs over equal-length
/// digests.
fn authorize(
    headers: &HeaderMap,
    secret: Option<&str>,
) -> Result<(), ApiError> {
    let Some(secret) = secret else {
        warn!("bearer request rejected: reason=secret_not_configured");
        return Err(ApiError::Unauthorized);
    };

    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("Bearer"))
        .map(|(_, token)| token.trim())
        .ok_or(ApiError::Unauthorized)?;

    let expected = Sha256::digest(secret.as_bytes());
    let actual = Sha256::digest(presented.as_bytes());
    let diff = expected
        .iter()
        .zip(actual.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));

    if diff == 0 {
        Ok(())
    } else {
        warn!("bearer request rejected: reason=token_mismatch");
        Err(ApiError::Unauthorized)
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
/// The headers are skipped unless a trusted proxy sets them.
fn client_key(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> String {
    let header = |name: &str| {
        if !trust_proxy_headers {
            return None;
        }
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(',').next().unwrap_or_default().trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn checked_recipients(recipients: &Recipients) -> Result<Vec<String>, ApiError> {
    if recipients.is_empty() {
        return Err(ApiError::InvalidRequest(NO_RECIPIENTS.into()));
    }
    let addresses = non_blank(recipients.to_vec());
    for address in &addresses {
        address.parse::<Mailbox>().map_err(|err| {
            ApiError::InvalidRequest(format!("invalid recipient {address}: {err}"))
        })?;
    }
    Ok(addresses)
}

fn non_blank(addresses: Vec<String>) -> Vec<String> {
    addresses
        .into_iter()
        .map(|address| address.trim().to_string())
        .filter(|address| !address.is_empty())
        .collect()
}

fn outbound_from_request(request: SendEmailRequest) -> Result<OutboundMessage, ApiError> {
    if request.to.is_empty() {
        return Err(ApiError::InvalidRequest(NO_RECIPIENTS.into()));
    }
    let to = non_blank(request.to.to_vec());

    let (subject, html, text) = match request.template {
        Some(template) => {
            let data = request.data.unwrap_or_default();
            let rendered = render(template, &data)
                .map_err(|err| ApiError::InvalidRequest(err.to_string()))?;
            (
                request.subject.unwrap_or(rendered.subject),
                Some(request.html.unwrap_or(rendered.html)),
                Some(request.text.unwrap_or(rendered.text)),
            )
        }
        None => {
            let subject = request
                .subject
                .filter(|subject| !subject.trim().is_empty())
                .ok_or_else(|| {
                    ApiError::InvalidRequest("`subject` or `template` is required".into())
                })?;
            if request.html.is_none() && request.text.is_none() {
                return Err(ApiError::InvalidRequest(
                    "`html`, `text` or `template` is required".into(),
                ));
            }
            (subject, request.html, request.text)
        }
    };

    let attachments = request
        .attachments
        .into_iter()
        .map(|attachment| {
            let content = STANDARD.decode(attachment.content.trim()).map_err(|err| {
                ApiError::InvalidRequest(format!(
                    "attachment {} is not valid base64: {err}",
                    attachment.filename
                ))
            })?;
            Ok(Attachment {
                filename: attachment.filename,
                content_type: attachment
                    .content_type
                    .unwrap_or_else(|| DEFAULT_ATTACHMENT_TYPE.to_string()),
                content,
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    Ok(OutboundMessage {
        to,
        cc: request.cc.map(|cc| non_blank(cc.to_vec())).unwrap_or_default(),
        bcc: request.bcc.map(|bcc| non_blank(bcc.to_vec())).unwrap_or_default(),
        reply_to: request.reply_to.filter(|address| !address.trim().is_empty()),
        subject,
        html,
        text,
        attachments,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use axum::body::Body;
    use axum::http::header::CONTENT_TYPE;
    use axum::http::{HeaderValue, Request};
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;
    use crate::core::alerting::AdminAlerter;
    use crate::core::clock::ManualClock;
    use crate::core::mailer::testing::{RecordingTransport, sender};
    use crate::core::mailer::{DispatchError, Mailer};
    use crate::core::processor::{QueueProcessor, RetryPolicy};
    use crate::core::rate_limit::{MemoryRateLimitStore, RateLimiter};
    use crate::core::store::{JobStore, MemoryJobStore, NewEmailJob};

    const SECRET: &str = "cron-secret";

    struct TestApp {
        router: Router,
        store: Arc<MemoryJobStore>,
        transport: Arc<RecordingTransport>,
        clock: Arc<ManualClock>,
    }

    fn app_with(
        configured: bool,
        cron_secret: Option<&str>,
    ) -> TestApp {
        build_app(configured, cron_secret, true)
    }

    fn build_app(
        configured: bool,
        cron_secret: Option<&str>,
        trust_proxy_headers: bool,
    ) -> TestApp {
        let store = Arc::new(MemoryJobStore::default());
        let transport = Arc::new(RecordingTransport::default());
        let clock = Arc::new(ManualClock::default());
        let mailer = Arc::new(Mailer::new(
            if configured { sender() } else { None },
            transport.clone(),
            None,
            None,
        ));
        let retry = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(3600),
        };
        let state = AppState {
            processor: Arc::new(QueueProcessor::new(
                store.clone(),
                mailer.clone(),
                clock.clone(),
                retry,
            )),
            mailer: mailer.clone(),
            limiter: Arc::new(RateLimiter::new(
                Arc::new(MemoryRateLimitStore::default()),
                clock.clone(),
                10,
                Duration::from_secs(60),
            )),
            alerter: Arc::new(AdminAlerter::new(
                mailer,
                Some("ops@spotitfor.me".into()),
                clock.clone(),
            )),
            clock: clock.clone(),
            cron_secret: cron_secret.map(Arc::from),
            trust_proxy_headers,
            batch_size: 50,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        };

        TestApp {
            router: router(state, Duration::from_secs(30)),
            store,
            transport,
            clock,
        }
    }

    fn app() -> TestApp {
        app_with(true, Some(SECRET))
    }

    fn send_request(
        ip: &str,
        body: Value,
    ) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/send-email")
            .header(CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", ip)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn cron_request(token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri("/cron/process-emails");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn plain_mail() -> Value {
        json!({
            "to": "finder@example.com",
            "subject": "Hello",
            "text": "plain body"
        })
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn queue_welcome(app: &TestApp) {
        app.store
            .enqueue(
                NewEmailJob {
                    recipient: vec!["new@example.com".into()],
                    template: TemplateName::Welcome,
                    payload: json!({"name": "Ada"}).as_object().cloned().unwrap(),
                },
                app.clock.now(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn health_reports_configuration_and_templates() {
        let app = app();
        let response = app
            .router
            .oneshot(Request::get("/send-email").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["configured"], true);
        assert_eq!(body["templates"].as_array().unwrap().len(), 7);
        assert_eq!(body["droppedAlerts"], 0);
    }

    #[tokio::test]
    async fn send_email_returns_delivery_details() {
        let app = app();
        let response = app
            .router
            .oneshot(send_request("203.0.113.9", plain_mail()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert!(body["messageId"].as_str().unwrap().starts_with('<'));
        assert_eq!(body["accepted"], json!(["finder@example.com"]));
        assert_eq!(body["envelope"]["from"], "spots@spotitfor.me");
        assert_eq!(app.transport.calls(), 1);
    }

    #[tokio::test]
    async fn send_email_renders_templates() {
        let app = app();
        let response = app
            .router
            .oneshot(send_request(
                "203.0.113.9",
                json!({
                    "to": ["a@example.com", "b@example.com"],
                    "template": "spot-found",
                    "data": {"name": "Ada", "spotTitle": "Blue bike"}
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let raw = app.transport.sent().remove(0);
        assert!(raw.contains("Blue bike"));
    }

    #[tokio::test]
    async fn eleventh_send_from_same_ip_is_rate_limited() {
        let app = app();
        for _ in 0..10 {
            let response = app
                .router
                .clone()
                .oneshot(send_request("203.0.113.9, 10.0.0.1", plain_mail()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .router
            .clone()
            .oneshot(send_request("203.0.113.9", plain_mail()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json(response).await["code"], "RATE_LIMITED");
        assert_eq!(app.transport.calls(), 10);

        let other = app
            .router
            .oneshot(send_request("198.51.100.7", plain_mail()))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_bodies_are_invalid_requests() {
        let app = app();
        let mut request = send_request("203.0.113.9", json!({}));
        *request.body_mut() = Body::from("{not json");

        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "INVALID_REQUEST");

        let response = app
            .router
            .clone()
            .oneshot(send_request("203.0.113.9", json!({"to": "a@example.com"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .router
            .oneshot(send_request(
                "203.0.113.9",
                json!({
                    "to": "a@example.com",
                    "subject": "s",
                    "text": "t",
                    "attachments": [{"filename": "a.txt", "content": "%%%"}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.transport.calls(), 0);
    }

    #[tokio::test]
    async fn dispatch_errors_map_to_their_status() {
        let unconfigured = app_with(false, Some(SECRET));
        let response = unconfigured
            .router
            .oneshot(send_request("203.0.113.9", plain_mail()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "CONFIGURATION_ERROR");

        let app = app();
        app.transport
            .fail_next([DispatchError::Authentication("535 bad credentials".into())]);
        let response = app
            .router
            .oneshot(send_request("203.0.113.9", plain_mail()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "AUTHENTICATION_ERROR");
    }

    #[tokio::test]
    async fn cron_rejects_bad_tokens_without_touching_jobs() {
        let app = app();
        queue_welcome(&app).await;

        for token in [None, Some("wrong"), Some("")] {
            let response = app.router.clone().oneshot(cron_request(token)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let unconfigured = app_with(true, None);
        let response = unconfigured
            .router
            .oneshot(cron_request(Some(SECRET)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(app.transport.calls(), 0);
        let stats = app.store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn cron_processes_queue_and_reports_stats() {
        let app = app();
        queue_welcome(&app).await;

        let response = app.router.oneshot(cron_request(Some(SECRET))).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["processed"]["processed"], 1);
        assert_eq!(body["processed"]["succeeded"], 1);
        assert_eq!(body["stats"]["sent"], 1);
        assert_eq!(body["timestamp"], "2025-06-01T12:00:00Z");
    }

    #[tokio::test]
    async fn failed_cron_batch_returns_generic_error() {
        let app = app();
        queue_welcome(&app).await;
        app.transport
            .fail_next([DispatchError::Authentication("535 5.7.8 secret detail".into())]);

        let response = app.router.oneshot(cron_request(Some(SECRET))).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "internal server error");
        assert!(body["timestamp"].is_string());
        assert!(!body.to_string().contains("secret detail"));
    }

    #[tokio::test]
    async fn enqueue_endpoint_creates_pending_job() {
        let app = app();
        let request = Request::builder()
            .method("POST")
            .uri("/email-jobs")
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {SECRET}"))
            .body(Body::from(
                json!({
                    "to": "owner@example.com",
                    "template": "sighting-reported",
                    "data": {"spotTitle": "Red umbrella", "location": "Platform 4"}
                })
                .to_string(),
            ))
            .unwrap();

        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "pending");
        assert_eq!(body["template"], "sighting-reported");

        let stats_request = Request::builder()
            .uri("/cron/queue-stats")
            .header(AUTHORIZATION, format!("Bearer {SECRET}"))
            .body(Body::empty())
            .unwrap();
        let stats = body_json(app.router.oneshot(stats_request).await.unwrap()).await;
        assert_eq!(stats["pending"], 1);
        assert_eq!(stats["total"], 1);
    }

    #[tokio::test]
    async fn enqueue_rejects_payloads_that_cannot_render() {
        let app = app();
        let request = Request::builder()
            .method("POST")
            .uri("/email-jobs")
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {SECRET}"))
            .body(Body::from(
                json!({"to": "owner@example.com", "template": "spot-created"}).to_string(),
            ))
            .unwrap();

        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.store.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn bearer_scheme_is_case_insensitive() {
        let app = app();
        let stats_request = |value: String| {
            Request::builder()
                .uri("/cron/queue-stats")
                .header(AUTHORIZATION, value)
                .body(Body::empty())
                .unwrap()
        };

        for value in [format!("bearer {SECRET}"), format!("BEARER  {SECRET} ")] {
            let response = app.router.clone().oneshot(stats_request(value)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        for value in [format!("Basic {SECRET}"), "Bearer".to_string(), SECRET.to_string()] {
            let response = app.router.clone().oneshot(stats_request(value)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn blank_recipients_are_rejected_up_front() {
        let app = app();
        let response = app
            .router
            .clone()
            .oneshot(send_request(
                "203.0.113.9",
                json!({"to": [" ", ""], "subject": "Hello", "text": "body"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "INVALID_REQUEST");

        let request = Request::builder()
            .method("POST")
            .uri("/email-jobs")
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {SECRET}"))
            .body(Body::from(
                json!({"to": "  ", "template": "welcome", "data": {"name": "Ada"}})
                    .to_string(),
            ))
            .unwrap();
        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(app.transport.calls(), 0);
        assert_eq!(app.store.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn rotating_forwarded_for_does_not_reset_untrusted_limit() {
        let app = build_app(true, Some(SECRET), false);
        for n in 0..10 {
            let response = app
                .router
                .clone()
                .oneshot(send_request(&format!("203.0.113.{n}"), plain_mail()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .router
            .oneshot(send_request("198.51.100.77", plain_mail()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(app.transport.calls(), 10);
    }

    #[test]
    fn client_key_prefers_forwarded_headers() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        assert_eq!(client_key(&headers, Some(peer), true), "192.0.2.1");
        assert_eq!(client_key(&headers, None, true), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_key(&headers, Some(peer), true), "198.51.100.2");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.5 , 10.0.0.1"),
        );
        assert_eq!(client_key(&headers, Some(peer), true), "203.0.113.5");

        assert_eq!(client_key(&headers, Some(peer), false), "192.0.2.1");
        assert_eq!(client_key(&headers, None, false), "unknown");
    }
}
