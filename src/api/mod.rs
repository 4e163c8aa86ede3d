//! API endpoints for the request shield.
//!
//! This module exposes the security pipeline over HTTP: rate limit checks,
//! event recording and queries, metrics, reports and rule management.

pub mod guard;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use actix_web::http::header;
use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder, ResponseError};
use chrono::Duration;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{
    NewSecurityEvent, RateLimitDecision, RateLimiter, SecurityEvent, SecurityEventType,
    SecurityMonitor, Severity,
};
use crate::models::{Config, MAX_WINDOW_MS};
use crate::utils::{duration_from_ms, from_timestamp_ms};

pub use guard::{BlockList, RequestGuard};

const DEFAULT_EVENT_LIMIT: usize = 100;

/// Shared application state
pub struct ApiState {
    pub rate_limiter: Arc<RateLimiter>,
    pub monitor: Arc<Mutex<SecurityMonitor>>,
    pub block_list: Arc<BlockList>,
    pub config: Arc<Config>,
    pub prometheus: Option<PrometheusHandle>,
}

impl ApiState {
    pub fn monitor(&self) -> MutexGuard<'_, SecurityMonitor> {
        lock_monitor(&self.monitor)
    }
}

pub(crate) fn lock_monitor(monitor: &Mutex<SecurityMonitor>) -> MutexGuard<'_, SecurityMonitor> {
    monitor.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Record a denied rate limit check as a security event
pub(crate) fn record_rate_limit_exceeded(
    monitor: &Mutex<SecurityMonitor>,
    key: &str,
    decision: &RateLimitDecision,
) -> SecurityEvent {
    let mut event = NewSecurityEvent::new(SecurityEventType::RateLimitExceeded, Severity::Medium, key);
    if let Some(retry_after) = decision.retry_after_seconds {
        event = event.with_detail("retry_after_seconds", retry_after.min(i64::MAX as u64) as i64);
    }
    lock_monitor(monitor).record_event(event)
}

/// Errors returned by the API
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/rate-limit").route(web::post().to(check_rate_limit)))
            .service(web::resource("/rate-limit/stats").route(web::get().to(rate_limit_stats)))
            .service(web::resource("/rate-limit/{key}").route(web::delete().to(reset_rate_limit)))
            .service(
                web::resource("/events")
                    .route(web::get().to(list_events))
                    .route(web::post().to(record_event)),
            )
            .service(web::resource("/events/range").route(web::get().to(events_in_range)))
            .service(web::resource("/metrics/security").route(web::get().to(security_metrics)))
            .service(
                web::resource("/sources/{source}/suspicious").route(web::get().to(suspicious_source)),
            )
            .service(web::resource("/report").route(web::get().to(security_report)))
            .service(web::resource("/rules").route(web::get().to(list_rules)))
            .service(web::resource("/rules/{id}").route(web::delete().to(delete_rule)))
            .service(web::resource("/admin/clear").route(web::post().to(clear_monitor))),
    )
    .service(web::resource("/metrics").route(web::get().to(prometheus_metrics)));
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Rate limit check request
#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitRequest {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    pub limit: Option<usize>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub severity: Option<String>,
}

/// Epoch milliseconds
#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SuspiciousQuery {
    pub window_ms: Option<u64>,
}

#[derive(Serialize)]
struct SuspiciousResponse {
    source: String,
    suspicious: bool,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Rate limit check endpoint
pub async fn check_rate_limit(
    state: web::Data<ApiState>,
    req: web::Json<RateLimitRequest>,
) -> Result<HttpResponse, ApiError> {
    if req.key.is_empty() {
        return Err(ApiError::BadRequest("key must not be empty".to_string()));
    }

    let decision = state.rate_limiter.is_allowed(&req.key);
    if decision.allowed {
        return Ok(HttpResponse::Ok().json(decision));
    }

    record_rate_limit_exceeded(&state.monitor, &req.key, &decision);
    let retry_after = decision.retry_after_seconds.unwrap_or(0).to_string();
    Ok(HttpResponse::TooManyRequests()
        .insert_header((header::RETRY_AFTER, retry_after))
        .json(decision))
}

async fn reset_rate_limit(state: web::Data<ApiState>, key: web::Path<String>) -> impl Responder {
    state.rate_limiter.reset(&key);
    HttpResponse::NoContent().finish()
}

async fn rate_limit_stats(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.rate_limiter.stats())
}

async fn record_event(
    state: web::Data<ApiState>,
    event: web::Json<NewSecurityEvent>,
) -> Result<HttpResponse, ApiError> {
    let event = event.into_inner();
    if event.source.is_empty() {
        return Err(ApiError::BadRequest("source must not be empty".to_string()));
    }
    let recorded = state.monitor().record_event(event);
    Ok(HttpResponse::Created().json(recorded))
}

async fn list_events(
    state: web::Data<ApiState>,
    query: web::Query<EventQuery>,
) -> Result<HttpResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    let event_type = query
        .event_type
        .as_deref()
        .map(|value| {
            SecurityEventType::parse(value)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown event type: {}", value)))
        })
        .transpose()?;
    let severity = query
        .severity
        .as_deref()
        .map(|value| {
            Severity::parse(value)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown severity: {}", value)))
        })
        .transpose()?;

    let monitor = state.monitor();
    let events = match (event_type, severity) {
        (Some(event_type), None) => monitor.events_by_type(event_type, limit),
        (None, Some(severity)) => monitor.events_by_severity(severity, limit),
        (Some(event_type), Some(severity)) => {
            let matching: Vec<_> = monitor
                .events_by_type(event_type, usize::MAX)
                .into_iter()
                .filter(|event| event.severity == severity)
                .collect();
            let skip = matching.len().saturating_sub(limit);
            matching.into_iter().skip(skip).collect()
        }
        (None, None) => monitor.recent_events(limit),
    };

    Ok(HttpResponse::Ok().json(events))
}

async fn events_in_range(
    state: web::Data<ApiState>,
    query: web::Query<RangeQuery>,
) -> Result<HttpResponse, ApiError> {
    let monitor = state.monitor();
    let (start, end) = resolve_range(&query, monitor.now())?;
    Ok(HttpResponse::Ok().json(monitor.events_in_range(start, end)))
}

async fn security_metrics(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.monitor().metrics())
}

async fn suspicious_source(
    state: web::Data<ApiState>,
    source: web::Path<String>,
    query: web::Query<SuspiciousQuery>,
) -> Result<HttpResponse, ApiError> {
    let window_ms = query
        .window_ms
        .unwrap_or(state.config.monitoring.suspicious_window_ms);
    if window_ms > MAX_WINDOW_MS {
        return Err(ApiError::BadRequest(format!(
            "window_ms must be at most {}",
            MAX_WINDOW_MS
        )));
    }
    let source = source.into_inner();
    let suspicious = state
        .monitor()
        .is_suspicious_source(&source, duration_from_ms(window_ms));
    Ok(HttpResponse::Ok().json(SuspiciousResponse { source, suspicious }))
}

async fn security_report(
    state: web::Data<ApiState>,
    query: web::Query<RangeQuery>,
) -> Result<HttpResponse, ApiError> {
    let monitor = state.monitor();
    let (start, end) = resolve_range(&query, monitor.now())?;
    Ok(HttpResponse::Ok().json(monitor.generate_report(start, end)))
}

async fn list_rules(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.monitor().rules())
}

async fn delete_rule(
    state: web::Data<ApiState>,
    id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    if state.monitor().remove_rule(&id) {
        Ok(HttpResponse::NoContent().finish())
    } else {
        Err(ApiError::NotFound(format!("rule {}", id.as_str())))
    }
}

async fn clear_monitor(state: web::Data<ApiState>) -> impl Responder {
    state.monitor().clear();
    HttpResponse::NoContent().finish()
}

async fn prometheus_metrics(state: web::Data<ApiState>) -> impl Responder {
    match &state.prometheus {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}

/// Defaults to the hour ending now
fn resolve_range(
    query: &RangeQuery,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>), ApiError> {
    let end = match query.end {
        Some(ms) => from_timestamp_ms(ms)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid end timestamp: {}", ms)))?,
        None => now,
    };
    let start = match query.start {
        Some(ms) => from_timestamp_ms(ms)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid start timestamp: {}", ms)))?,
        None => end
            .checked_sub_signed(Duration::hours(1))
            .ok_or_else(|| ApiError::BadRequest(format!("invalid end timestamp: {}", end)))?,
    };
    if start > end {
        return Err(ApiError::BadRequest("start must not be after end".to_string()));
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, SecurityReport};
    use crate::models::{MonitoringConfig, RateLimitConfig};
    use actix_web::{test as actix_test, web, App};

    fn state(max_requests: u32) -> web::Data<ApiState> {
        let clock = Arc::new(ManualClock::default());
        let config = Config {
            rate_limit: RateLimitConfig {
                max_requests,
                ..RateLimitConfig::default()
            },
            ..Config::default()
        };
        let block_list = Arc::new(BlockList::new(Duration::minutes(15), clock.clone()));
        let mut monitor = SecurityMonitor::with_clock(&MonitoringConfig::default(), clock.clone());
        monitor.add_observer(block_list.clone());

        web::Data::new(ApiState {
            rate_limiter: Arc::new(RateLimiter::with_clock(config.rate_limit.clone(), clock)),
            monitor: Arc::new(Mutex::new(monitor)),
            block_list,
            config: Arc::new(config),
            prometheus: None,
        })
    }

    #[actix_web::test]
    async fn test_health_check() {
        let app = actix_test::init_service(App::new().configure(config)).await;

        let req = actix_test::TestRequest::get().uri("/api/v1/health").to_request();
        let resp = actix_test::call_service(&app, req).await;

        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_rate_limit() {
        let state = state(1);
        let app = actix_test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let check = || {
            actix_test::TestRequest::post()
                .uri("/api/v1/rate-limit")
                .set_json(RateLimitRequest {
                    key: "test_key".to_string(),
                })
                .to_request()
        };

        let resp = actix_test::call_service(&app, check()).await;
        assert!(resp.status().is_success());

        let resp = actix_test::call_service(&app, check()).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "60");

        let metrics = state.monitor().metrics();
        assert_eq!(metrics.events_by_type[&SecurityEventType::RateLimitExceeded], 1);

        let req = actix_test::TestRequest::delete().uri("/api/v1/rate-limit/test_key").to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let resp = actix_test::call_service(&app, check()).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_record_and_list_events() {
        let state = state(10);
        let app = actix_test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = actix_test::TestRequest::post()
            .uri("/api/v1/events")
            .set_json(NewSecurityEvent::new(SecurityEventType::XssAttempt, Severity::Critical, "1.1.1.1"))
            .to_request();
        let recorded: SecurityEvent = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(recorded.source, "1.1.1.1");

        let req = actix_test::TestRequest::get()
            .uri("/api/v1/events?type=XSS_ATTEMPT&limit=5")
            .to_request();
        let events: Vec<SecurityEvent> = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, recorded.id);

        let req = actix_test::TestRequest::get().uri("/api/v1/events?severity=bogus").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_report_endpoint() {
        let state = state(10);
        {
            let mut monitor = state.monitor();
            monitor.record_event(NewSecurityEvent::new(
                SecurityEventType::XssAttempt,
                Severity::Critical,
                "a",
            ));
        }
        let app = actix_test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = actix_test::TestRequest::get().uri("/api/v1/report").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body = actix_test::read_body(resp).await;
        let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["summary"]["critical_events"], 1);

        let req = actix_test::TestRequest::get()
            .uri("/api/v1/report?start=2000&end=1000")
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_suspicious_source_rejects_oversized_window() {
        let state = state(10);
        let app = actix_test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = actix_test::TestRequest::get()
            .uri("/api/v1/sources/1.2.3.4/suspicious?window_ms=18446744073709551615")
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = actix_test::TestRequest::get()
            .uri("/api/v1/sources/1.2.3.4/suspicious?window_ms=60000")
            .to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["suspicious"], false);
    }

    #[actix_web::test]
    async fn test_rules_endpoints() {
        let state = state(10);
        let app = actix_test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = actix_test::TestRequest::delete()
            .uri("/api/v1/rules/brute_force_detection")
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let req = actix_test::TestRequest::delete()
            .uri("/api/v1/rules/brute_force_detection")
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        assert_eq!(state.monitor().rules().len(), 2);
    }

    #[test]
    fn test_resolve_range_defaults_to_last_hour() {
        let now = chrono::Utc::now();
        let (start, end) = resolve_range(&RangeQuery { start: None, end: None }, now).unwrap();
        assert_eq!(end, now);
        assert_eq!(end - start, Duration::hours(1));

        // report type stays serializable for the endpoint
        let report: SecurityReport = crate::core::report::generate_report(std::iter::empty(), start, end, now);
        assert!(serde_json::to_string(&report).is_ok());
    }
}
