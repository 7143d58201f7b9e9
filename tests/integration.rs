use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use courier_dispatch::api::rest::router;
use courier_dispatch::config::DispatchSettings;
use courier_dispatch::engine::queue::TimeoutCheck;
use courier_dispatch::state::AppState;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

fn setup() -> (axum::Router, mpsc::Receiver<TimeoutCheck>) {
    let (state, rx) = AppState::new(DispatchSettings::default(), 1024, 1024);
    (router(Arc::new(state)), rx)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn patch_request(uri: &str, body: Value) -> Request<Body> {
    json_request("PATCH", uri, body)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn register_courier(app: &axum::Router, name: &str, lat: f64) -> String {
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/couriers",
            json!({
                "name": name,
                "location": { "lat": lat, "lng": 100.50 },
                "rating": 4.5
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    body_json(res).await["id"].as_str().unwrap().to_string()
}

async fn create_order(app: &axum::Router) -> Value {
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({
                "shop_id": "00000000-0000-0000-0000-0000000000aa",
                "customer_id": "00000000-0000-0000-0000-0000000000bb",
                "pickup_address": "Noodle House, Silom",
                "delivery_address": "Condo 12B, Sathorn",
                "pickup": { "lat": 13.75, "lng": 100.50 },
                "dropoff": { "lat": 13.78, "lng": 100.50 },
                "food_cost": 120.0
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    body_json(res).await
}

/// Creates an order plus its delivery request and runs the first round.
async fn dispatch_order(app: &axum::Router) -> (String, Value) {
    let order = create_order(app).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/delivery-requests"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    (order_id, body_json(res).await)
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _rx) = setup();
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["couriers"], 0);
    assert_eq!(body["orders"], 0);
    assert_eq!(body["delivery_requests"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _rx) = setup();
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("timeout_checks_pending"));
}

#[tokio::test]
async fn delivery_fee_follows_distance_tiers() {
    let (app, _rx) = setup();

    let res = app
        .clone()
        .oneshot(get_request("/delivery-fee?distance_km=1.5"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["delivery_fee"], 20.0);

    let res = app
        .clone()
        .oneshot(get_request("/delivery-fee?distance_km=4"))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["delivery_fee"], 30.0);

    let res = app
        .oneshot(get_request("/delivery-fee?distance_km=-1"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn register_courier_returns_active_courier() {
    let (app, _rx) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/couriers",
            json!({
                "name": "Alice",
                "location": { "lat": 13.75, "lng": 100.5 },
                "rating": 9.9
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["name"], "Alice");
    assert_eq!(body["status"], "active");
    assert_eq!(body["available"], true);
    assert_eq!(body["active_jobs"], 0);
    assert_eq!(body["rating"], 5.0);
    assert!(!body["last_location_update"].is_null());
}

#[tokio::test]
async fn register_courier_empty_name_returns_400() {
    let (app, _rx) = setup();
    let response = app
        .oneshot(json_request("POST", "/couriers", json!({ "name": "  " })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "bad_request");
}

#[tokio::test]
async fn courier_availability_and_location_updates() {
    let (app, _rx) = setup();
    let id = register_courier(&app, "Eve", 13.75).await;

    let res = app
        .clone()
        .oneshot(patch_request(
            &format!("/couriers/{id}/availability"),
            json!({ "available": false }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["available"], false);

    let res = app
        .clone()
        .oneshot(patch_request(
            &format!("/couriers/{id}/location"),
            json!({ "location": { "lat": 13.8, "lng": 100.6 } }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["location"]["lat"], 13.8);
    assert_eq!(body["location"]["lng"], 100.6);
}

#[tokio::test]
async fn update_unknown_courier_returns_404() {
    let (app, _rx) = setup();
    let res = app
        .oneshot(patch_request(
            "/couriers/00000000-0000-0000-0000-000000000000/status",
            json!({ "status": "suspended" }),
        ))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(res).await["code"], "not_found");
}

#[tokio::test]
async fn delivery_request_without_couriers_stays_pending() {
    let (app, _rx) = setup();
    let (_order_id, body) = dispatch_order(&app).await;

    assert_eq!(body["dispatch"]["outcome"], "no_available_riders");
    assert_eq!(body["request"]["status"], "pending");
    assert!(body["request"]["rider_id"].is_null());
    assert!(!body["request"]["expires_at"].is_null());
    assert_eq!(body["request"]["assignment_attempts"], 0);
}

#[tokio::test]
async fn second_delivery_request_for_order_conflicts() {
    let (app, _rx) = setup();
    let (order_id, _) = dispatch_order(&app).await;

    let res = app
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/delivery-requests"),
            json!({ "auto_assign": false }),
        ))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn full_delivery_flow() {
    let (app, _rx) = setup();
    let alice = register_courier(&app, "Alice", 13.751).await;
    let bob = register_courier(&app, "Bob", 13.752).await;

    let (order_id, body) = dispatch_order(&app).await;
    assert_eq!(body["dispatch"]["outcome"], "notified");
    assert_eq!(body["dispatch"]["attempt"], 1);
    assert_eq!(body["dispatch"]["riders"][0], alice.as_str());
    let request_id = body["request"]["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(get_request(&format!("/delivery-requests/{request_id}/candidates")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await.as_array().unwrap().len(), 2);

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/delivery-requests/{request_id}/accept"),
            json!({ "courier_id": alice }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let fulfillment = body_json(res).await;
    assert_eq!(fulfillment["status"], "assigned");
    assert_eq!(fulfillment["rider_id"], alice.as_str());
    let fulfillment_id = fulfillment["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/delivery-requests/{request_id}/accept"),
            json!({ "courier_id": bob }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(res).await["code"], "already_assigned");

    for step in ["pickup", "deliver"] {
        let res = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/fulfillments/{fulfillment_id}/{step}"),
                json!({ "courier_id": alice }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/fulfillments/{fulfillment_id}/rate"),
            json!({ "rating": 5 }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let rated = body_json(res).await;
    assert_eq!(rated["status"], "delivered");
    assert_eq!(rated["rating"], 5);

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}")))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["status"], "completed");

    let res = app
        .oneshot(get_request(&format!("/couriers/{alice}")))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["active_jobs"], 0);
}

#[tokio::test]
async fn rejecting_last_candidate_cancels_order() {
    let (app, _rx) = setup();
    let alice = register_courier(&app, "Alice", 13.751).await;
    let (order_id, body) = dispatch_order(&app).await;
    let request_id = body["request"]["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/delivery-requests/{request_id}/reject"),
            json!({ "courier_id": alice }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome = body_json(res).await;
    assert_eq!(outcome["outcome"], "cancelled");
    assert_eq!(outcome["reason"], "all_riders_rejected");

    let res = app
        .oneshot(get_request(&format!("/orders/{order_id}")))
        .await
        .unwrap();
    let order = body_json(res).await;
    assert_eq!(order["status"], "cancelled");
    assert_eq!(order["cancellation"]["cancelled_by"], "system");
}

#[tokio::test]
async fn courier_cancel_puts_request_back_in_dispatch() {
    let (app, _rx) = setup();
    let alice = register_courier(&app, "Alice", 13.751).await;
    let bob = register_courier(&app, "Bob", 13.752).await;
    let (_order_id, body) = dispatch_order(&app).await;
    let request_id = body["request"]["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/delivery-requests/{request_id}/accept"),
            json!({ "courier_id": alice }),
        ))
        .await
        .unwrap();
    let fulfillment_id = body_json(res).await["id"].as_str().unwrap().to_string();

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/fulfillments/{fulfillment_id}/cancel"),
            json!({ "courier_id": alice, "reason": "flat tyre" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome = body_json(res).await;
    assert_eq!(outcome["outcome"], "reassigning");
    // Alice counts as a rejection now, so Bob is the only candidate.
    assert_eq!(outcome["dispatch"]["outcome"], "notified");
    assert_eq!(outcome["dispatch"]["riders"], json!([bob]));

    let res = app
        .oneshot(get_request(&format!("/delivery-requests/{request_id}")))
        .await
        .unwrap();
    let request = body_json(res).await;
    assert_eq!(request["status"], "pending");
    assert!(request["rider_id"].is_null());
    assert!(request["rejected_by"]
        .as_array()
        .unwrap()
        .contains(&json!(alice)));
}

#[tokio::test]
async fn customer_cancel_cascades() {
    let (app, _rx) = setup();
    let alice = register_courier(&app, "Alice", 13.751).await;
    let (order_id, body) = dispatch_order(&app).await;
    let request_id = body["request"]["id"].as_str().unwrap().to_string();

    app.clone()
        .oneshot(json_request(
            "POST",
            &format!("/delivery-requests/{request_id}/accept"),
            json!({ "courier_id": alice }),
        ))
        .await
        .unwrap();

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/cancel"),
            json!({ "cancelled_by": "customer", "note": "too slow" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report = body_json(res).await;
    assert_eq!(report["request_cancelled"], true);
    assert_eq!(report["fulfillment_cancelled"], true);
    assert_eq!(report["order_cancelled"], true);

    let res = app
        .oneshot(get_request(&format!("/couriers/{alice}")))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["active_jobs"], 0);
}

#[tokio::test]
async fn system_cancellation_over_http_is_refused() {
    let (app, _rx) = setup();
    let order = create_order(&app).await;
    let order_id = order["id"].as_str().unwrap();

    let res = app
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/cancel"),
            json!({ "cancelled_by": "system" }),
        ))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn courier_cannot_cancel_whole_order() {
    let (app, _rx) = setup();
    let alice = register_courier(&app, "Alice", 13.751).await;
    let (order_id, body) = dispatch_order(&app).await;
    let request_id = body["request"]["id"].as_str().unwrap().to_string();

    app.clone()
        .oneshot(json_request(
            "POST",
            &format!("/delivery-requests/{request_id}/accept"),
            json!({ "courier_id": alice }),
        ))
        .await
        .unwrap();

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/cancel"),
            json!({ "cancelled_by": "courier", "actor_id": alice }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app
        .oneshot(get_request(&format!("/delivery-requests/{request_id}")))
        .await
        .unwrap();
    assert_eq!(body_json(res).await["status"], "accepted");
}

#[tokio::test]
async fn unknown_delivery_request_returns_404() {
    let (app, _rx) = setup();
    let res = app
        .oneshot(get_request(
            "/delivery-requests/00000000-0000-0000-0000-000000000000",
        ))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
