//! Token bucket per API key (§5, §9 design notes). Only `(tokens, last_refill_ts)` is
//! kept, in-memory, never persisted — buckets refill to full on process boot.

use axum::{
    extract::Extension,
    http::{Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use sqlx::PgPool;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::AppError;
use crate::extractor::resolve_api_key;

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> Result<(), u64> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let wait = (deficit / self.refill_per_sec).ceil() as u64;
            Err(wait.max(1))
        }
    }
}

static BUCKETS: Lazy<DashMap<(Uuid, Kind), Bucket>> = Lazy::new(DashMap::new);

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Write,
    Read,
}

pub struct LimitOutcome {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

/// Checks and (on success) consumes one token from `api_key_id`'s bucket for `kind`.
pub fn check(api_key_id: Uuid, kind: Kind) -> LimitOutcome {
    let limit = match kind {
        Kind::Write => *crate::config::RATE_LIMIT_WRITE_RPS,
        Kind::Read => *crate::config::RATE_LIMIT_READ_RPS,
    };
    let mut entry = BUCKETS
        .entry((api_key_id, kind))
        .or_insert_with(|| Bucket::new(limit as f64, limit as f64));
    match entry.try_take() {
        Ok(()) => LimitOutcome {
            allowed: true,
            limit,
            remaining: entry.tokens.floor() as u32,
            retry_after_secs: 0,
        },
        Err(wait) => LimitOutcome {
            allowed: false,
            limit,
            remaining: 0,
            retry_after_secs: wait,
        },
    }
}

fn kind_for_method(method: &Method) -> Kind {
    match *method {
        Method::GET | Method::HEAD | Method::OPTIONS => Kind::Read,
        _ => Kind::Write,
    }
}

/// Tower middleware applied ahead of the authenticated routes: resolves the caller's
/// API key the same way the `AuthUser` extractor does, consumes one token from its
/// bucket, and either forwards the request (stamping `X-RateLimit-*` on the response)
/// or short-circuits with 429 (§5).
pub async fn middleware<B: Send + 'static>(
    Extension(pool): Extension<PgPool>,
    req: Request<B>,
    next: Next<B>,
) -> Response {
    let kind = kind_for_method(req.method());
    let headers = req.headers().clone();
    let raw_key = headers
        .get("X-Api-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
                .map(|s| s.to_string())
        });

    let Some(raw_key) = raw_key else {
        return next.run(req).await;
    };

    let api_key_id = match resolve_api_key(&pool, &raw_key).await {
        Ok(auth) => auth.api_key_id,
        Err(_) => return next.run(req).await,
    };

    let outcome = check(api_key_id, kind);
    if !outcome.allowed {
        return rate_limited_response(&outcome);
    }

    let mut response = next.run(req).await;
    stamp_headers(response.headers_mut(), &outcome);
    response
}

fn stamp_headers(headers: &mut axum::http::HeaderMap, outcome: &LimitOutcome) {
    if let Ok(v) = outcome.limit.to_string().parse() {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = outcome.remaining.to_string().parse() {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = outcome.retry_after_secs.to_string().parse() {
        headers.insert("X-RateLimit-Reset", v);
    }
}

fn rate_limited_response(outcome: &LimitOutcome) -> Response {
    let err = AppError::RateLimited {
        retry_after_secs: outcome.retry_after_secs,
    };
    let mut response = err.into_response();
    stamp_headers(response.headers_mut(), outcome);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_then_recovers_with_time() {
        let key = Uuid::new_v4();
        // drain a tiny bucket directly rather than the shared statics, to keep the
        // test independent of RATE_LIMIT_* env state.
        let mut bucket = Bucket::new(2.0, 2.0);
        assert!(bucket.try_take().is_ok());
        assert!(bucket.try_take().is_ok());
        assert!(bucket.try_take().is_err());
        let _ = key;
    }

    #[test]
    fn refill_is_monotone_bounded_by_capacity() {
        let mut bucket = Bucket::new(5.0, 100.0);
        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now() - Duration::from_secs(10);
        bucket.refill();
        assert!(bucket.tokens <= bucket.capacity);
    }
}
