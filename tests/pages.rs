#[path = "common/mod.rs"]
mod common;

use axum::http::StatusCode;
use common::{body_json, body_text, config_for, get_request};
use ouija::{app, build_state, AppConfig};
use tower::ServiceExt; // for oneshot

#[tokio::test]
async fn index_serves_template() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>Ask the spirits</h1>").unwrap();
    let config = AppConfig {
        template_dir: dir.path().to_path_buf(),
        ..config_for("http://127.0.0.1:9/api/generate")
    };
    let state = build_state(&config).await.unwrap();
    let resp = app(state).oneshot(get_request("/", "c")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    assert_eq!(body_text(resp).await, "<h1>Ask the spirits</h1>");
}

#[tokio::test]
async fn missing_template_is_a_generic_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        template_dir: dir.path().join("nowhere"),
        ..config_for("http://127.0.0.1:9/api/generate")
    };
    let state = build_state(&config).await.unwrap();
    let resp = app(state).oneshot(get_request("/", "c")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let text = body_text(resp).await;
    assert_eq!(text, "Internal server error");
}

#[tokio::test]
async fn static_files_are_served() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("board.css"), "body{}").unwrap();
    let config = AppConfig {
        static_dir: dir.path().to_path_buf(),
        ..config_for("http://127.0.0.1:9/api/generate")
    };
    let state = build_state(&config).await.unwrap();
    let resp = app(state.clone())
        .oneshot(get_request("/static/board.css", "c"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "body{}");

    let resp = app(state)
        .oneshot(get_request("/static/missing.css", "c"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn healthz_reports_model() {
    let config = AppConfig {
        ollama_model: "llama3".into(),
        ..config_for("http://127.0.0.1:9/api/generate")
    };
    let state = build_state(&config).await.unwrap();
    let resp = app(state).oneshot(get_request("/healthz", "c")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["model"], "llama3");
    assert_eq!(json["historyLen"], 0);
}
