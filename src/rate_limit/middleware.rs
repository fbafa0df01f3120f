use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use http::header::{CONTENT_TYPE, RETRY_AFTER, WWW_AUTHENTICATE};
use http::{HeaderValue, Request, Response, StatusCode};
use pin_project::pin_project;
use tower_layer::Layer;
use tower_service::Service;

use crate::identity::ClientIdentity;
use crate::rate_limit::{Decision, RateLimiter};

/// Body of a 429 response.
pub const RATE_LIMIT_EXCEEDED_BODY: &str = "{error: 'rate limit exceeded'}";
/// Body of a 401 response.
pub const UNAUTHORIZED_BODY: &str = "{error: 'unauthorized'}";

/// A layer that enforces per-client rate limits using a [`RateLimiter`].
#[derive(Debug)]
pub struct RateLimitLayer<L> {
    limiter: Arc<L>,
}

impl<L> RateLimitLayer<L> {
    /// Create a new rate limit layer.
    pub fn new(limiter: L) -> Self {
        Self { limiter: Arc::new(limiter) }
    }

    /// Share an existing limiter, e.g. one also driven by an idle sweeper.
    pub fn from_shared(limiter: Arc<L>) -> Self {
        Self { limiter }
    }
}

impl<L> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone() }
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L>
where
    L: RateLimiter + 'static,
{
    type Service = RateLimitService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, limiter: self.limiter.clone() }
    }
}

/// Middleware service that admits or rejects each request before it reaches
/// the inner service.
///
/// Requests without a bearer identity get 401 and exhausted clients get 429;
/// in both cases the inner service is never called.
#[derive(Debug)]
pub struct RateLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
}

impl<S: Clone, L> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), limiter: self.limiter.clone() }
    }
}

impl<S, L, ReqBody> Service<Request<ReqBody>> for RateLimitService<S, L>
where
    S: Service<Request<ReqBody>, Response = Response<Body>>,
    L: RateLimiter + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let identity = match ClientIdentity::from_headers(req.headers()) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(
                    target: "turnstile::middleware",
                    error = %err,
                    path = %req.uri().path(),
                    "rejecting unauthenticated request"
                );
                return ResponseFuture::reject(unauthorized());
            }
        };

        match self.limiter.check(&identity) {
            Decision::Allowed { remaining } => {
                tracing::trace!(
                    target: "turnstile::middleware",
                    client = %identity,
                    remaining,
                    "request admitted"
                );
                ResponseFuture::forward(self.inner.call(req))
            }
            Decision::Denied { wait } => {
                tracing::debug!(
                    target: "turnstile::middleware",
                    client = %identity,
                    wait_ms = wait.as_millis() as u64,
                    "rate limit exceeded"
                );
                ResponseFuture::reject(too_many_requests(wait))
            }
        }
    }
}

/// Response future for [`RateLimitService`]: either the inner service's
/// future or a ready rejection.
#[pin_project(project = ResponseFutureProj)]
pub enum ResponseFuture<F> {
    /// Admitted; waiting on the inner service.
    Forward {
        #[pin]
        inner: F,
    },
    /// Rejected without calling the inner service.
    Reject {
        response: Option<Response<Body>>,
    },
}

impl<F> ResponseFuture<F> {
    fn forward(inner: F) -> Self {
        Self::Forward { inner }
    }

    fn reject(response: Response<Body>) -> Self {
        Self::Reject { response: Some(response) }
    }
}

impl<F, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<Body>, E>>,
{
    type Output = Result<Response<Body>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            ResponseFutureProj::Forward { inner } => inner.poll(cx),
            ResponseFutureProj::Reject { response } => {
                Poll::Ready(Ok(response.take().expect("ResponseFuture polled after completion")))
            }
        }
    }
}

fn plain_text(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn too_many_requests(wait: Duration) -> Response<Body> {
    let mut response = plain_text(StatusCode::TOO_MANY_REQUESTS, RATE_LIMIT_EXCEEDED_BODY);
    response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(wait)));
    response
}

fn unauthorized() -> Response<Body> {
    let mut response = plain_text(StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY);
    response.headers_mut().insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    response
}

/// `Retry-After` carries whole seconds; round up and never advertise zero.
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs().saturating_add(u64::from(wait.subsec_nanos() > 0));
    secs.max(1)
}
