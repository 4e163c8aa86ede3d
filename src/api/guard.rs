//! Request guard middleware.
//!
//! Rejects requests from sources a threat rule asked to block (403) and
//! requests over the rate limit (429) before they reach any route handler.

use std::collections::HashMap;
use std::future::{ready, Ready};
use std::sync::{Arc, Mutex, PoisonError};

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header;
use actix_web::{Error, HttpResponse};
use chrono::{DateTime, Duration, Utc};
use futures::future::LocalBoxFuture;
use log::{info, warn};
use serde::Serialize;

use crate::api::record_rate_limit_exceeded;
use crate::core::{Clock, RateLimiter, SecurityMonitor, SecurityNotification, SecurityObserver};
use crate::utils::saturating_add;

/// Sources blocked by threat rules, each until an expiry instant
pub struct BlockList {
    blocked: Mutex<HashMap<String, DateTime<Utc>>>,
    duration: Duration,
    clock: Arc<dyn Clock>,
}

impl BlockList {
    pub fn new(duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            blocked: Mutex::new(HashMap::new()),
            duration,
            clock,
        }
    }

    /// Block `source`; expired blocks of other sources are pruned on the way
    pub fn block(&self, source: &str) {
        let now = self.clock.now();
        let until = saturating_add(now, self.duration);
        let mut blocked = self.blocked.lock().unwrap_or_else(PoisonError::into_inner);
        blocked.retain(|_, expires| now < *expires);
        blocked.insert(source.to_string(), until);
        info!("Blocked {} until {}", source, until);
    }

    /// Number of tracked blocks, including ones expired since the last prune
    pub fn len(&self) -> usize {
        self.blocked.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unblock(&self, source: &str) -> bool {
        self.blocked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source)
            .is_some()
    }

    /// Expired blocks are dropped as they are looked up
    pub fn is_blocked(&self, source: &str) -> bool {
        let now = self.clock.now();
        let mut blocked = self.blocked.lock().unwrap_or_else(PoisonError::into_inner);
        match blocked.get(source) {
            Some(until) if now < *until => true,
            Some(_) => {
                blocked.remove(source);
                false
            }
            None => false,
        }
    }
}

impl SecurityObserver for BlockList {
    fn notify(&self, notification: &SecurityNotification) {
        if let SecurityNotification::BlockRequested(request) = notification {
            self.block(&request.source);
        }
    }
}

#[derive(Serialize)]
struct GuardResponse<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

/// Middleware factory
#[derive(Clone)]
pub struct RequestGuard {
    rate_limiter: Arc<RateLimiter>,
    monitor: Arc<Mutex<SecurityMonitor>>,
    block_list: Arc<BlockList>,
}

impl RequestGuard {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        monitor: Arc<Mutex<SecurityMonitor>>,
        block_list: Arc<BlockList>,
    ) -> Self {
        Self {
            rate_limiter,
            monitor,
            block_list,
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequestGuard
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RequestGuardMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestGuardMiddleware {
            service,
            guard: self.clone(),
        }))
    }
}

pub struct RequestGuardMiddleware<S> {
    service: S,
    guard: RequestGuard,
}

impl<S, B> Service<ServiceRequest> for RequestGuardMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let source = client_source(&req);

        if self.guard.block_list.is_blocked(&source) {
            warn!("Rejected request from blocked source {}", source);
            let response = HttpResponse::Forbidden().json(GuardResponse {
                error: "Source blocked",
                retry_after_seconds: None,
            });
            return Box::pin(ready(Ok(req.into_response(response).map_into_right_body())));
        }

        if self.guard.rate_limiter.config().enabled {
            let decision = self.guard.rate_limiter.is_allowed(&source);
            if !decision.allowed {
                record_rate_limit_exceeded(&self.guard.monitor, &source, &decision);
                let retry_after = decision.retry_after_seconds.unwrap_or(0);
                let response = HttpResponse::TooManyRequests()
                    .insert_header((header::RETRY_AFTER, retry_after.to_string()))
                    .json(GuardResponse {
                        error: "Rate limit exceeded",
                        retry_after_seconds: Some(retry_after),
                    });
                return Box::pin(ready(Ok(req.into_response(response).map_into_right_body())));
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) })
    }
}

fn client_source(req: &ServiceRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
