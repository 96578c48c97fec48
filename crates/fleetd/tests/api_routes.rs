mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{
    ScriptedApi, app_state, expect_message, healthy_host, host, running_hub, subscriber,
};
use fleetd::api::{CurrentUser, create_router};
use fleetd::events::{EventHub, HubSettings};
use fleetd::hosts::{HealthCheck, HostAuthentication, HostStore, MemoryHostStore, ServiceHealth};
use serde_json::{Value, json};
use tower::ServiceExt;

struct Harness {
    app: Router,
    api: Arc<ScriptedApi>,
    hub: Arc<EventHub>,
}

fn harness(hub: Arc<EventHub>, dev_mode: bool) -> Harness {
    let mut secret = healthy_host("h1", &["vm-1"]);
    secret.authentication = Some(HostAuthentication {
        username: Some("root".to_string()),
        password: Some("hunter2".to_string()),
        api_key: None,
    });
    secret.health_check = Some(HealthCheck {
        healthy: true,
        services: vec![
            ServiceHealth {
                name: "api".to_string(),
                healthy: true,
                ..Default::default()
            },
            ServiceHealth {
                name: "catalog".to_string(),
                healthy: false,
                ..Default::default()
            },
        ],
        ..Default::default()
    });
    let mut restricted = healthy_host("h2", &[]);
    restricted.required_roles = vec!["ops".to_string()];

    let store: Arc<dyn HostStore> = Arc::new(MemoryHostStore::with_hosts([
        secret,
        restricted,
        host("sick"),
    ]));
    let api = Arc::new(ScriptedApi::default());
    let app = create_router(app_state(hub.clone(), store, api.clone(), dev_mode));
    Harness { app, api, hub }
}

fn viewer() -> CurrentUser {
    CurrentUser {
        id: "u1".to_string(),
        username: "viewer".to_string(),
        roles: Vec::new(),
        claims: Vec::new(),
    }
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let h = harness(running_hub(), false);
    let (status, body) = call(&h.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let h = harness(running_hub(), false);
    let (status, body) = call(&h.app, get("/api/v1/orchestrator/hosts")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn hosts_are_redacted_and_filtered_by_role() {
    let h = harness(running_hub(), false);
    let mut request = get("/api/v1/orchestrator/hosts");
    request.extensions_mut().insert(viewer());

    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    let hosts = body.as_array().unwrap();
    let ids: Vec<&str> = hosts.iter().map(|h| h["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["h1", "sick"]);
    assert!(hosts[0].get("authentication").is_none_or(Value::is_null));
    assert_eq!(hosts[0]["websocket_connected"], false);
    assert_eq!(hosts[0]["services_status"], "Service Degraded");
    assert!(hosts[1].get("services_status").is_none());
}

#[tokio::test]
async fn single_host_reports_live_health_state() {
    let h = harness(running_hub(), false);

    let mut request = get("/api/v1/orchestrator/hosts/sick");
    request.extensions_mut().insert(viewer());
    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "sick");
    assert_eq!(body["state"], "healthy");
    assert_eq!(h.api.calls_for("sick").await, vec!["health_probe"]);

    let mut request = get("/api/v1/orchestrator/hosts/h2");
    request.extensions_mut().insert(viewer());
    let (status, _) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.api.calls_for("h2").await.is_empty());
}

#[tokio::test]
async fn vm_actions_need_admin() {
    let h = harness(running_hub(), false);
    let mut request = Request::post("/api/v1/orchestrator/hosts/h1/machines/vm-1/start")
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(viewer());

    let (status, _) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(h.api.calls_for("h1").await.is_empty());
}

#[tokio::test]
async fn vm_action_maps_host_checks_to_status() {
    let h = harness(running_hub(), true);
    let post = |uri: &str| Request::post(uri).body(Body::empty()).unwrap();

    // Host checks first: a successful action triggers a background refresh.
    let (status, body) = call(&h.app, post("/api/v1/orchestrator/hosts/sick/machines/vm-1/start")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], 503);

    let (status, _) = call(&h.app, post("/api/v1/orchestrator/hosts/nope/machines/vm-1/start")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&h.app, post("/api/v1/orchestrator/hosts/h1/machines/vm-9/start")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&h.app, post("/api/v1/orchestrator/hosts/h1/machines/vm-1/explode")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&h.app, post("/api/v1/orchestrator/hosts/h1/machines/vm-1/stop?force=true")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["operation"], "stop");
    assert!(h.api.calls_for("h1").await.contains(&"stop vm-1".to_string()));
}

#[tokio::test]
async fn vm_delete_and_catalog_cache() {
    let h = harness(running_hub(), true);

    let request = Request::delete("/api/v1/orchestrator/hosts/h1/machines/vm-1")
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = call(&h.app, get("/api/v1/orchestrator/hosts/h1/catalog/cache")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_size"], 0);

    let request = Request::delete("/api/v1/orchestrator/hosts/h1/catalog/cache?catalog_id=ubuntu")
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let request = Request::delete("/api/v1/orchestrator/hosts/h1/catalog/cache?version=1")
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let calls = h.api.calls_for("h1").await;
    assert!(calls.contains(&"delete vm-1".to_string()));
    assert!(calls.contains(&"delete_catalog_cache ubuntu *".to_string()));
}

#[tokio::test]
async fn refresh_is_accepted() {
    let h = harness(running_hub(), true);
    let request = Request::post("/api/v1/orchestrator/refresh")
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn unsubscribe_from_global_is_rejected() {
    let h = harness(running_hub(), true);
    let (client_id, mut rx) = subscriber(&h.hub, &["vm"]).await;

    let (status, body) = call(
        &h.app,
        post_json(
            "/api/v1/events/unsubscribe",
            json!({"client_id": client_id, "event_types": ["global"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);

    assert_eq!(h.hub.send_to_all("maintenance", json!({})).await.unwrap(), 1);
    let event = expect_message(&mut rx, "maintenance").await;
    assert_eq!(event.event_type, fleetd_protocol::EventType::Global);

    let (status, body) = call(
        &h.app,
        post_json(
            "/api/v1/events/unsubscribe",
            json!({"client_id": client_id, "event_types": ["VM"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], json!(["vm"]));

    let (status, body) = call(
        &h.app,
        post_json(
            "/api/v1/events/unsubscribe",
            json!({"client_id": client_id, "event_types": ["bogus"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("bogus"));
}

#[tokio::test]
async fn stats_show_clients_to_admins_only() {
    let h = harness(running_hub(), false);
    let _client = subscriber(&h.hub, &["host"]).await;

    let mut request = get("/api/v1/events/stats");
    request.extensions_mut().insert(viewer());
    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_clients"], 1);
    assert_eq!(body["type_stats"]["host"], 1);
    assert!(body.get("clients").is_none());

    let mut request = get("/api/v1/events/stats");
    request.extensions_mut().insert(CurrentUser::dev_admin());
    let (_, body) = call(&h.app, request).await;
    assert_eq!(body["clients"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn subscribe_needs_a_running_hub() {
    let h = harness(Arc::new(EventHub::new(HubSettings::default())), true);
    let (status, body) = call(&h.app, get("/api/v1/events/subscribe?event_types=vm")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], 503);
}
