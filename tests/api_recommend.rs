// tests/api_recommend.rs
//
// Recommendation routes end to end through the router (oneshot, no sockets),
// backed by the sample catalogue shipped in config/testimonials.json.

use std::path::Path;
use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value as Json};
use tower::ServiceExt as _;

use testimonial_engagement::api::{router, AppState};
use testimonial_engagement::catalog::StaticCatalog;

const BODY_LIMIT: usize = 1024 * 1024;

fn test_router() -> Router {
    let catalog = StaticCatalog::load_from_file(Path::new("config/testimonials.json"))
        .expect("sample catalogue");
    router(AppState::in_memory(Arc::new(catalog)))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Json>) -> (StatusCode, Json) {
    let mut req = Request::builder().method(method).uri(uri);
    if body.is_some() {
        req = req.header("content-type", "application/json");
    }
    let req = req
        .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
        .expect("build request");
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.expect("body");
    (status, serde_json::from_slice(&bytes).unwrap_or(Json::Null))
}

fn maths_behaviour() -> Json {
    json!({
        "pageViews": ["/subjects/mathematics", "/gcse"],
        "searchQueries": ["gcse maths tutor"],
        "sessionData": { "deviceType": "mobile", "sessionDuration": 240, "scrollDepth": 60 }
    })
}

#[tokio::test]
async fn behaviour_update_builds_profile_and_matches() {
    let app = test_router();
    let (status, v) = send(&app, "POST", "/recommendations/visitor-1/behaviour", Some(maths_behaviour())).await;
    assert_eq!(status, StatusCode::OK, "body: {v}");
    assert_eq!(v["success"], true);

    let session = &v["session"];
    assert_eq!(session["state"], "ready");
    assert_eq!(session["profile"]["estimatedLevel"], "gcse");
    assert_eq!(session["profile"]["likelySubjects"], json!(["mathematics"]));

    let matches = session["matches"].as_array().unwrap();
    assert!(!matches.is_empty() && matches.len() <= 6);
    assert_eq!(matches[0]["testimonial"]["id"], "t-001");
    let scores: Vec<f64> = matches
        .iter()
        .map(|m| m["confidenceScore"].as_f64().unwrap())
        .collect();
    assert!(scores.iter().all(|s| (0.3..=1.0).contains(s)));
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn matches_endpoint_filters_and_counts() {
    let app = test_router();
    send(&app, "POST", "/recommendations/v2/behaviour", Some(maths_behaviour())).await;

    let (status, v) = send(&app, "GET", "/recommendations/v2/matches", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(v["matches"].as_array().unwrap().len() <= 3);

    let (_, v) = send(&app, "GET", "/recommendations/v2/matches?count=1", None).await;
    assert_eq!(v["matches"].as_array().unwrap().len(), 1);

    let (_, v) = send(&app, "GET", "/recommendations/v2/matches?category=mathematics", None).await;
    let ms = v["matches"].as_array().unwrap();
    assert!(!ms.is_empty());
    assert!(ms.iter().all(|m| m["category"]["subject"] == "mathematics"));
}

#[tokio::test]
async fn unknown_session_is_404() {
    let app = test_router();
    for (method, uri) in [
        ("GET", "/recommendations/nobody"),
        ("GET", "/recommendations/nobody/matches"),
        ("POST", "/recommendations/nobody/refresh"),
    ] {
        let (status, v) = send(&app, method, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert_eq!(v["error"], "Unknown session");
    }
}

#[tokio::test]
async fn feedback_is_recorded_for_cached_matches_only() {
    let app = test_router();
    send(&app, "POST", "/recommendations/v3/behaviour", Some(maths_behaviour())).await;

    let (status, v) = send(
        &app,
        "POST",
        "/recommendations/v3/feedback",
        Some(json!({ "testimonialId": "t-001", "helpful": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["recorded"], true);

    let (_, v) = send(
        &app,
        "POST",
        "/recommendations/v3/feedback",
        Some(json!({ "testimonialId": "not-a-match", "helpful": false })),
    )
    .await;
    assert_eq!(v["recorded"], false);

    let (_, v) = send(&app, "GET", "/recommendations/v3", None).await;
    assert_eq!(v["session"]["feedbackCount"], 1);
    assert!(v["insights"]["matchingFactorWeights"]["subjectRelevance"].is_number());
}

#[tokio::test]
async fn refresh_then_clear_personalization() {
    let app = test_router();
    send(&app, "POST", "/recommendations/v4/behaviour", Some(maths_behaviour())).await;

    let (status, v) = send(&app, "POST", "/recommendations/v4/refresh", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["session"]["recommendationCount"], 2);

    let (status, v) = send(&app, "DELETE", "/recommendations/v4", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["existed"], true);

    let (status, _) = send(&app, "GET", "/recommendations/v4", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bad_behaviour_payload_is_400() {
    let app = test_router();
    let (status, v) = send(
        &app,
        "POST",
        "/recommendations/v5/behaviour",
        Some(json!({ "pageViews": "not-a-list" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(v["success"], false);
}
