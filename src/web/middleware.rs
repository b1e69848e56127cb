//! Tower middleware that enforces rate limits on HTTP requests.

use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, Request, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, debug_span, Instrument};

use crate::ratelimit::{ClientId, Decision, RateLimiter};

/// Ceiling of the policy that applied.
pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left in the current window.
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Window end, epoch milliseconds.
pub const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const REJECTION_ERROR: &str = "Rate limit exceeded";

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRejection {
    pub error: String,
    pub message: String,
    #[serde(rename = "retryAfter")]
    pub retry_after: u64,
}

impl RateLimitRejection {
    fn new(retry_after: u64) -> Self {
        Self {
            error: REJECTION_ERROR.to_string(),
            message: format!(
                "Too many requests. Please try again in {} seconds.",
                retry_after
            ),
            retry_after,
        }
    }
}

fn quota_headers(decision: &Decision) -> [(HeaderName, HeaderValue); 3] {
    [
        (LIMIT_HEADER, HeaderValue::from(decision.limit)),
        (REMAINING_HEADER, HeaderValue::from(decision.remaining)),
        (RESET_HEADER, HeaderValue::from(decision.reset_at_ms)),
    ]
}

/// Add quota headers the handler did not set itself.
fn merge_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    for (name, value) in quota_headers(decision) {
        headers.entry(name).or_insert(value);
    }
}

/// Build the 429 response for a denied decision.
pub fn rejection_response(decision: &Decision) -> Response {
    let retry_after = decision.retry_after_secs.unwrap_or(1);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RateLimitRejection::new(retry_after)),
    )
        .into_response();

    let headers = response.headers_mut();
    for (name, value) in quota_headers(decision) {
        headers.insert(name, value);
    }
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

/// Applies rate limits to requests, keyed by request path and client.
#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Debug, Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S, B> Service<Request<B>> for RateLimitService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        // Take the service that was driven to readiness, leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = Arc::clone(&self.limiter);

        let endpoint = request.uri().path().to_string();
        let client = ClientId::from_headers(request.headers());
        let span = debug_span!("rate_limit", endpoint = %endpoint, client = %client);

        Box::pin(
            async move {
                let decision = limiter.decide(&client, &endpoint).await;

                if !decision.allowed {
                    debug!(
                        retry_after = decision.retry_after_secs,
                        "Rejecting request over rate limit"
                    );
                    return Ok(rejection_response(&decision));
                }

                let mut response = inner.call(request).await?;
                merge_quota_headers(response.headers_mut(), &decision);
                Ok(response)
            }
            .instrument(span),
        )
    }
}
