//! Finding out which model a request targets.

use axum::body::Body;
use http::{Request, header};
use serde::Deserialize;

/// Largest request body buffered to read the model name from.
const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

/// The model a request targets, set by a layer that already knows it.
///
/// When absent, the model is read from the `model` field of a JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedModel(pub String);

#[derive(Deserialize)]
struct ModelField {
    model: Option<String>,
}

/// The body could not be read.
#[derive(Debug)]
pub(crate) struct BodyReadError(pub String);

/// Resolve the requested model, buffering a JSON body if needed. The returned
/// request carries the same body as the original.
pub(crate) async fn extract(req: Request<Body>) -> Result<(Request<Body>, Option<String>), BodyReadError> {
    if let Some(RequestedModel(model)) = req.extensions().get::<RequestedModel>() {
        let model = Some(model.clone()).filter(|model| !model.is_empty());
        return Ok((req, model));
    }

    if !is_json(&req) {
        return Ok((req, None));
    }

    let (parts, body) = req.into_parts();

    let bytes = axum::body::to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|e| BodyReadError(e.to_string()))?;

    let model = serde_json::from_slice::<ModelField>(&bytes)
        .ok()
        .and_then(|field| field.model)
        .filter(|model| !model.is_empty());

    Ok((Request::from_parts(parts, Body::from(bytes)), model))
}

fn is_json(req: &Request<Body>) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"))
}
