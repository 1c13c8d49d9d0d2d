//! Rate limiting middleware for HTTP requests.

use std::{
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::body::Body;
use config::ClientIdentity;
use http::{Request, Response, StatusCode, header};
use rate_limit::{RateLimitError, RateLimitManager, RateLimitRequest};
use serde_json::json;
use tower::Layer;

use crate::model;

/// Admission control in front of the upstream handlers.
///
/// Requests need a [`ClientIdentity`] extension. The outcome of every admitted
/// request is reported back once its response status is known: statuses below
/// 400 count as successes.
#[derive(Clone)]
pub struct RateLimitLayer(Arc<RateLimitManager>);

impl RateLimitLayer {
    /// Create a layer enforcing the limits of `manager`.
    pub fn new(manager: Arc<RateLimitManager>) -> Self {
        Self(manager)
    }
}

impl<Service> Layer<Service> for RateLimitLayer
where
    Service: Send + Clone,
{
    type Service = RateLimitService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        RateLimitService {
            next,
            manager: self.0.clone(),
        }
    }
}

/// Service created by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<Service> {
    next: Service,
    manager: Arc<RateLimitManager>,
}

impl<Service> tower::Service<Request<Body>> for RateLimitService<Service>
where
    Service: tower::Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    Service::Future: Send,
    Service::Error: Display + Send + 'static,
{
    type Response = Response<Body>;
    type Error = Service::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut next = self.next.clone();
        let manager = self.manager.clone();

        Box::pin(async move {
            if !manager.is_enabled() {
                return next.call(req).await;
            }

            let Some(identity) = req.extensions().get::<ClientIdentity>().cloned() else {
                log::debug!("Access denied: rate limited request without client identification");

                return Ok(json_response(
                    StatusCode::UNAUTHORIZED,
                    json!({"error": "unauthorized", "error_description": "Client identification required"}),
                ));
            };

            let (req, model) = if manager.needs_model() {
                match model::extract(req).await {
                    Ok(extracted) => extracted,
                    Err(e) => {
                        log::debug!("Failed to read request body for model extraction: {}", e.0);
                        let response =
                            error_response(StatusCode::BAD_REQUEST, "invalid request body", "invalid_request_error");

                        return Ok(response);
                    }
                }
            } else {
                (req, None)
            };

            let mut builder = RateLimitRequest::builder(identity.client_id);

            if let Some(group) = identity.group {
                builder = builder.group(group);
            }

            if let Some(model) = model {
                builder = builder.model(model);
            }

            let admission = match manager.check_request(&builder.build()).await {
                Ok(admission) => admission,
                Err(err) => return Ok(rejection(&err)),
            };

            match next.call(req).await {
                Ok(response) => {
                    let success = response.status().as_u16() < 400;
                    manager.record_outcome(admission, success).await;

                    Ok(response)
                }
                Err(e) => {
                    log::debug!("Upstream handler failed: {e}");
                    manager.record_outcome(admission, false).await;

                    Err(e)
                }
            }
        })
    }
}

fn rejection(err: &RateLimitError) -> Response<Body> {
    let status = err.status_code();

    let kind = if err.is_denial() {
        log::debug!("Request rejected due to rate limit: {err}");
        "rate_limit_error"
    } else {
        log::error!("Request rejected because the rate limit check failed: {err}");
        "server_error"
    };

    error_response(status, &err.client_message(), kind)
}

fn error_response(status: StatusCode, message: &str, kind: &str) -> Response<Body> {
    json_response(status, json!({"error": {"message": message, "type": kind}}))
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));

    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));

    response
}
