//! Request admission control: a process-wide token bucket in front of a
//! bounded concurrency semaphore. Parameters come from the active config
//! snapshot and the whole gate is rebuilt on reload.

use arc_swap::ArcSwap;
use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::middleware::Next;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::config::RateLimitSection;
use crate::error::ApiError;
use crate::http::is_public_path;
use crate::metrics::Metrics;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct LimiterInner {
    bucket: DirectLimiter,
    semaphore: Arc<Semaphore>,
}

/// Holds one admitted request's concurrency slot; dropped on completion or
/// cancellation, so a disconnecting client always releases its slot.
pub struct Permit {
    _slot: OwnedSemaphorePermit,
}

pub struct Limiter {
    inner: ArcSwap<LimiterInner>,
}

impl Limiter {
    pub fn new(params: &RateLimitSection) -> Self {
        Self {
            inner: ArcSwap::from_pointee(build_inner(params)),
        }
    }

    /// Swaps in a fresh bucket and semaphore. Requests already admitted keep
    /// their permits on the old semaphore until they finish.
    pub fn reconfigure(&self, params: &RateLimitSection) {
        self.inner.store(Arc::new(build_inner(params)));
    }

    /// One token plus one concurrency slot, or a reject reason.
    pub fn admit(&self) -> Result<Permit, ApiError> {
        let inner = self.inner.load();
        if inner.bucket.check().is_err() {
            return Err(ApiError::RateLimited(1));
        }
        match inner.semaphore.clone().try_acquire_owned() {
            Ok(slot) => Ok(Permit { _slot: slot }),
            Err(TryAcquireError::NoPermits) => Err(ApiError::TooManyConcurrent),
            Err(TryAcquireError::Closed) => Err(ApiError::TooManyConcurrent),
        }
    }
}

fn build_inner(params: &RateLimitSection) -> LimiterInner {
    let rps = NonZeroU32::new(params.rps).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(params.burst).unwrap_or(NonZeroU32::MIN);
    LimiterInner {
        bucket: RateLimiter::direct(Quota::per_second(rps).allow_burst(burst)),
        semaphore: Arc::new(Semaphore::new(params.max_concurrent as usize)),
    }
}

/// Middleware applying admission control to everything but the public paths.
pub async fn admission_middleware(
    Extension(limiter): Extension<Arc<Limiter>>,
    Extension(metrics): Extension<Arc<Metrics>>,
    request: Request<AxumBody>,
    next: Next,
) -> Response {
    if is_public_path(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    match limiter.admit() {
        Ok(_permit) => next.run(request).await,
        Err(err) => {
            metrics.incr_rate_limited();
            err.into_response()
        }
    }
}
