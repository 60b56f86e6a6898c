#[path = "support/common.rs"]
mod common;

use axum::body::Body;
use axum::http::{Request as HttpRequest, StatusCode};
use common::{create_user, gateway_request, register_node, send, setup_app};
use fleet_hub::persistence::UserRole;
use serde_json::json;

#[tokio::test]
async fn healthz_is_public() {
    let (app, _state) = setup_app().await;
    let (status, body) = send(
        &app,
        HttpRequest::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["online_nodes"], 0);
    assert_eq!(body["pending_migrations"], 0);
}

#[tokio::test]
async fn gateway_credentials_are_required() {
    let (app, state) = setup_app().await;
    let user = create_user(&state, "u@example.com", UserRole::User).await;

    let (status, body) = send(
        &app,
        HttpRequest::builder()
            .uri("/api/nodes")
            .header("x-fleet-user-id", user.id.to_string())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _) = send(
        &app,
        HttpRequest::builder()
            .uri("/api/nodes")
            .header("authorization", "Bearer wrong")
            .header("x-fleet-user-id", user.id.to_string())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, gateway_request("GET", "/api/nodes", 9999, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, gateway_request("GET", "/api/nodes", user.id, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn admin_routes_reject_regular_users() {
    let (app, state) = setup_app().await;
    let user = create_user(&state, "u@example.com", UserRole::User).await;
    let admin = create_user(&state, "a@example.com", UserRole::Admin).await;

    let (status, body) = send(&app, gateway_request("GET", "/api/admin/stats", user.id, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let (status, body) = send(&app, gateway_request("GET", "/api/admin/stats", admin.id, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["users"], 2);
    assert_eq!(body["online_nodes"], 0);
}

#[tokio::test]
async fn call_to_offline_node_records_failed_task() {
    let (app, state) = setup_app().await;
    let user = create_user(&state, "u@example.com", UserRole::User).await;
    register_node(&state, "node-a", Some(user.id)).await;

    let (status, body) = send(
        &app,
        gateway_request(
            "POST",
            "/api/calls",
            user.id,
            Some(json!({"node_id": "node-a", "action": "echo", "data": {"x": 1}})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["code"], "node_offline");
    let task_id = body["task_id"].as_i64().expect("task id");

    let (status, task) = send(
        &app,
        gateway_request("GET", &format!("/api/tasks/{task_id}"), user.id, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "failed");
    assert_eq!(task["node_id"], "node-a");
    assert_eq!(task["payload"], json!({"x": 1}));
}

#[tokio::test]
async fn call_validation_and_node_ownership() {
    let (app, state) = setup_app().await;
    let owner = create_user(&state, "owner@example.com", UserRole::User).await;
    let other = create_user(&state, "other@example.com", UserRole::User).await;
    register_node(&state, "node-a", Some(owner.id)).await;

    let (status, _) = send(
        &app,
        gateway_request(
            "POST",
            "/api/calls",
            owner.id,
            Some(json!({"node_id": "node-a", "action": "  "})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        gateway_request(
            "POST",
            "/api/calls",
            other.id,
            Some(json!({"node_id": "node-a", "action": "echo"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, _) = send(
        &app,
        gateway_request(
            "POST",
            "/api/jobs",
            owner.id,
            Some(json!({"node_id": "missing-node", "kind": "backup"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tasks_are_scoped_to_their_owner() {
    let (app, state) = setup_app().await;
    let owner = create_user(&state, "owner@example.com", UserRole::User).await;
    let other = create_user(&state, "other@example.com", UserRole::User).await;
    let admin = create_user(&state, "admin@example.com", UserRole::Admin).await;
    register_node(&state, "node-a", Some(owner.id)).await;

    let (_, body) = send(
        &app,
        gateway_request(
            "POST",
            "/api/jobs",
            owner.id,
            Some(json!({"node_id": "node-a", "kind": "backup"})),
        ),
    )
    .await;
    let task_id = body["task_id"].as_i64().expect("task id");
    let uri = format!("/api/tasks/{task_id}");

    let (status, _) = send(&app, gateway_request("GET", &uri, other.id, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, gateway_request("GET", &uri, admin.id, None)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, page) = send(&app, gateway_request("GET", "/api/tasks", other.id, None)).await;
    assert_eq!(page["total"], 0);
    let (_, page) = send(&app, gateway_request("GET", "/api/tasks", owner.id, None)).await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["task_type"], "backup");

    let (status, _) = send(
        &app,
        gateway_request("DELETE", &format!("/api/admin/tasks/{task_id}"), admin.id, None),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, gateway_request("GET", &uri, owner.id, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn credits_flow_through_admin_adjustments() {
    let (app, state) = setup_app().await;
    let user = create_user(&state, "u@example.com", UserRole::User).await;
    let admin = create_user(&state, "a@example.com", UserRole::Admin).await;
    let uri = format!("/api/admin/users/{}/credits", user.id);

    let (status, _) = send(
        &app,
        gateway_request("POST", &uri, admin.id, Some(json!({"adjustment": 0}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        gateway_request("POST", &uri, admin.id, Some(json!({"adjustment": 40}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["credits"], 40);

    let (status, _) = send(
        &app,
        gateway_request(
            "POST",
            "/api/admin/users/9999/credits",
            admin.id,
            Some(json!({"adjustment": 5})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, balance) = send(&app, gateway_request("GET", "/api/credits", user.id, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(balance["credits"], 40);
    assert_eq!(balance["transactions"][0]["amount"], 40);
    assert_eq!(balance["transactions"][0]["reason"], "admin_adjustment");
}

#[tokio::test]
async fn bind_tokens_and_unbinding() {
    let (app, state) = setup_app().await;
    let owner = create_user(&state, "owner@example.com", UserRole::User).await;
    let other = create_user(&state, "other@example.com", UserRole::User).await;
    register_node(&state, "node-a", Some(owner.id)).await;

    let (status, body) = send(
        &app,
        gateway_request("POST", "/api/nodes/bind-token", owner.id, None),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(!body["token"].as_str().unwrap_or_default().is_empty());
    assert!(body["expires_at"].is_string());

    let (_, nodes) = send(&app, gateway_request("GET", "/api/nodes", owner.id, None)).await;
    assert_eq!(nodes[0]["node_id"], "node-a");
    assert_eq!(nodes[0]["bound"], true);
    assert_eq!(nodes[0]["online"], false);

    let (status, _) = send(
        &app,
        gateway_request("POST", "/api/nodes/node-a/unbind", other.id, None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        gateway_request("POST", "/api/nodes/node-a/unbind", owner.id, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));

    let (_, nodes) = send(&app, gateway_request("GET", "/api/nodes", owner.id, None)).await;
    assert_eq!(nodes, json!([]));
}

#[tokio::test]
async fn admin_user_management() {
    let (app, state) = setup_app().await;
    let admin = create_user(&state, "a@example.com", UserRole::Admin).await;

    for email in ["one@example.com", "two@example.com"] {
        let (status, body) = send(
            &app,
            gateway_request("POST", "/api/admin/users", admin.id, Some(json!({"email": email}))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["role"], "user");
    }

    let (status, body) = send(
        &app,
        gateway_request(
            "POST",
            "/api/admin/users",
            admin.id,
            Some(json!({"email": "ONE@example.com"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "user_exists");

    let (status, page) = send(&app, gateway_request("GET", "/api/admin/users", admin.id, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 3);
    assert_eq!(page["limit"], 2);
    assert_eq!(page["items"].as_array().map(Vec::len), Some(2));

    let (_, page) = send(
        &app,
        gateway_request("GET", "/api/admin/users?limit=2&offset=2", admin.id, None),
    )
    .await;
    assert_eq!(page["items"].as_array().map(Vec::len), Some(1));

    let (status, _) = send(
        &app,
        gateway_request("GET", "/api/admin/users?limit=0", admin.id, None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let target = page["items"][0]["id"].as_i64().expect("id");
    let (status, body) = send(
        &app,
        gateway_request(
            "POST",
            &format!("/api/admin/users/{target}/role"),
            admin.id,
            Some(json!({"role": "admin"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "admin");

    let (status, _) = send(
        &app,
        gateway_request("DELETE", &format!("/api/admin/users/{}", admin.id), admin.id, None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        gateway_request("DELETE", &format!("/api/admin/users/{target}"), admin.id, None),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn admin_node_listing_and_removal() {
    let (app, state) = setup_app().await;
    let admin = create_user(&state, "a@example.com", UserRole::Admin).await;
    let user = create_user(&state, "u@example.com", UserRole::User).await;
    register_node(&state, "node-a", Some(user.id)).await;
    register_node(&state, "node-b", None).await;

    let (status, body) = send(&app, gateway_request("GET", "/api/admin/nodes", admin.id, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["sessions"]["online"], 0);

    let (status, _) = send(
        &app,
        gateway_request("POST", "/api/admin/nodes/node-a/unbind", admin.id, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        gateway_request("DELETE", "/api/admin/nodes/node-b", admin.id, None),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(
        &app,
        gateway_request("DELETE", "/api/admin/nodes/node-b", admin.id, None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, stats) = send(&app, gateway_request("GET", "/api/admin/stats", admin.id, None)).await;
    assert_eq!(stats["nodes"], 1);
    assert_eq!(stats["bound_nodes"], 0);
}
