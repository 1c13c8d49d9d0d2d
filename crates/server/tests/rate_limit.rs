use axum::{
    Router,
    body::Body,
    routing::{get, post},
};
use config::{ClientIdentity, Config};
use http::{Request, StatusCode, header};
use indoc::indoc;
use rate_limit::{RateLimitManager, RuleScope};
use server::RequestedModel;
use std::sync::Arc;
use tower::ServiceExt;

fn upstream() -> Router {
    Router::new()
        .route("/ok", get(|| async { "hello" }))
        .route("/fail", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream failed") }))
        .route("/v1/chat/completions", post(|body: String| async move { body }))
}

async fn app(config: &str) -> Router {
    app_with_manager(config).await.0
}

async fn app_with_manager(config: &str) -> (Router, Arc<RateLimitManager>) {
    let config: Config = toml::from_str(config).unwrap();
    let manager = server::rate_limit_manager(&config).await.unwrap();

    (server::router(&config, manager.clone(), upstream()), manager)
}

fn get_as(path: &str, principal: &str) -> Request<Body> {
    let mut request = Request::get(path).body(Body::empty()).unwrap();

    request
        .extensions_mut()
        .insert(ClientIdentity::new(principal, Some("default".to_string())));

    request
}

fn chat_as(principal: &str, body: &'static str) -> Request<Body> {
    let mut request = Request::post("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();

    request.extensions_mut().insert(ClientIdentity::new(principal, None));

    request
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn disabled_rate_limiting_passes_everything_through() {
    let app = app(indoc! {r#"
        [server.rate_limits]
        enabled = false
        success_limit = 1
    "#})
    .await;

    for _ in 0..5 {
        let request = Request::get("/ok").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hello");
    }
}

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let app = app(indoc! {r#"
        [server.rate_limits]
        enabled = true
    "#})
    .await;

    let request = Request::get("/ok").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    insta::assert_snapshot!(body, @r#"{"error":"unauthorized","error_description":"Client identification required"}"#);
}

#[tokio::test]
async fn success_limit_rejects_with_openai_error() {
    let app = app(indoc! {r#"
        [server.rate_limits]
        enabled = true
        success_limit = 2
    "#})
    .await;

    assert_eq!(send(&app, get_as("/ok", "u1")).await.0, StatusCode::OK);
    assert_eq!(send(&app, get_as("/ok", "u1")).await.0, StatusCode::OK);

    let (status, body) = send(&app, get_as("/ok", "u1")).await;
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    insta::assert_json_snapshot!(body, @r#"
    {
      "error": {
        "message": "当前分组上游负载已饱和，请稍后再试",
        "type": "rate_limit_error"
      }
    }
    "#);

    // Other principals have their own window.
    assert_eq!(send(&app, get_as("/ok", "u2")).await.0, StatusCode::OK);
}

#[tokio::test]
async fn failed_responses_do_not_count_as_successes() {
    let app = app(indoc! {r#"
        [server.rate_limits]
        enabled = true
        success_limit = 1
    "#})
    .await;

    for _ in 0..3 {
        let (status, _) = send(&app, get_as("/fail", "u1")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    assert_eq!(send(&app, get_as("/ok", "u1")).await.0, StatusCode::OK);
    assert_eq!(send(&app, get_as("/ok", "u1")).await.0, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn model_is_read_from_the_body() {
    let app = app(indoc! {r#"
        [server.rate_limits]
        enabled = true

        [server.rate_limits.models]
        "gpt-x" = [1, 1]
    "#})
    .await;

    let body = r#"{"model":"gpt-x","messages":[{"role":"user","content":"hi"}]}"#;

    // The upstream handler sees the untouched body.
    let (status, echoed) = send(&app, chat_as("u1", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(echoed, body);

    let (status, response) = send(&app, chat_as("u1", body)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    insta::assert_snapshot!(response, @r#"{"error":{"message":"当前模型 gpt-x 负载已饱和，请稍后再试","type":"rate_limit_error"}}"#);

    let (status, _) = send(&app, chat_as("u1", r#"{"model":"gpt-y"}"#)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn requested_model_extension_is_used() {
    let app = app(indoc! {r#"
        [server.rate_limits]
        enabled = true
        global_models = { "gpt-x" = 1 }
    "#})
    .await;

    let tagged = |principal| {
        let mut request = get_as("/ok", principal);
        request.extensions_mut().insert(RequestedModel("gpt-x".to_string()));
        request
    };

    assert_eq!(send(&app, tagged("u1")).await.0, StatusCode::OK);

    let (status, body) = send(&app, tagged("u2")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body.contains("当前模型 gpt-x 负载已饱和"));

    // Requests without a model are not counted against the model.
    assert_eq!(send(&app, get_as("/ok", "u3")).await.0, StatusCode::OK);
}

#[tokio::test]
async fn health_endpoint_is_not_rate_limited() {
    let app = app(indoc! {r#"
        [server.rate_limits]
        enabled = true
        global_limit = 1
    "#})
    .await;

    for _ in 0..3 {
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"healthy"}"#);
    }
}

#[tokio::test]
async fn rate_limiting_can_be_enabled_at_runtime() {
    let (app, manager) = app_with_manager(indoc! {r#"
        [server.rate_limits]
        enabled = false
        success_limit = 1
    "#})
    .await;

    assert_eq!(send(&app, get_as("/ok", "u1")).await.0, StatusCode::OK);
    assert_eq!(send(&app, get_as("/ok", "u1")).await.0, StatusCode::OK);

    let mut settings = (*manager.rules().settings()).clone();
    settings.enabled = true;
    manager.rules().replace_settings(settings).unwrap();

    // Nothing was counted while disabled.
    assert_eq!(send(&app, get_as("/ok", "u1")).await.0, StatusCode::OK);
    assert_eq!(send(&app, get_as("/ok", "u1")).await.0, StatusCode::TOO_MANY_REQUESTS);

    let request = Request::get("/ok").body(Body::empty()).unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rules_can_be_replaced_while_serving() {
    let (app, manager) = app_with_manager(indoc! {r#"
        [server.rate_limits]
        enabled = true
    "#})
    .await;

    manager
        .rules()
        .replace_all(RuleScope::User, r#"{"u1": [0, 1]}"#)
        .unwrap();

    insta::assert_snapshot!(manager.rules().export_json(RuleScope::User), @r#"{"u1":[0,1]}"#);

    assert_eq!(send(&app, get_as("/ok", "u1")).await.0, StatusCode::OK);
    assert_eq!(send(&app, get_as("/ok", "u1")).await.0, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(send(&app, get_as("/ok", "u2")).await.0, StatusCode::OK);
}
