mod common;

use std::time::Duration;

use common::{fast_settings, Harness};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use vmfleet_id::TaskId;
use vmfleet_orchestrator::{api, state::AppState, tasks::TaskRegistryConfig};

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    harness: Harness,
}

async fn spawn(harness: Harness) -> TestServer {
    let app = api::create_router(AppState::new(harness.orchestrator.clone()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        harness,
    }
}

impl TestServer {
    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn wait_finished(&self, task_id: &str) -> Value {
        for _ in 0..500 {
            let body: Value = self.get(&format!("/v1/tasks/{task_id}")).await.json().await.unwrap();
            if body["status"] == "success" || body["status"] == "error" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} did not finish");
    }
}

fn server_body(name: &str) -> Value {
    json!({
        "name": name,
        "cpu": 2,
        "memory": 2048,
        "disks": [{ "size": 20 }],
        "network_devices": [{ "ip_address": "ip=10.0.0.20/24,gw=10.0.0.1" }],
        "os_type": "debian"
    })
}

#[tokio::test]
async fn health_endpoints_respond() {
    let server = spawn(Harness::new()).await;

    assert_eq!(server.get("/healthz").await.status(), 200);
    assert_eq!(server.get("/livez").await.status(), 200);

    let ready = server.get("/readyz").await;
    assert_eq!(ready.status(), 200);
    let body: Value = ready.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["components"]["metadata_store"]["status"], "ok");
}

#[tokio::test]
async fn create_returns_202_and_task_completes() {
    let server = spawn(Harness::new()).await;

    let resp = server.post("/v1/servers", server_body("api-1")).await;
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "pending");
    let task_id = body["task_id"].as_str().unwrap().to_string();
    assert!(task_id.starts_with("task_"));

    let task = server.wait_finished(&task_id).await;
    assert_eq!(task["status"], "success", "{task}");
    assert_eq!(task["type"], "create_server");

    let detail: Value = server.get("/v1/servers/api-1").await.json().await.unwrap();
    assert_eq!(detail["record"]["status"], "running");
    assert_eq!(detail["spec"]["cpu"], 2);

    let list: Value = server.get("/v1/servers").await.json().await.unwrap();
    assert_eq!(list["total"], 1);
}

#[tokio::test]
async fn unknown_task_is_404() {
    let server = spawn(Harness::new()).await;

    let resp = server.get(&format!("/v1/tasks/{}", TaskId::new())).await;
    assert_eq!(resp.status(), 404);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/problem+json"
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "task_not_found");
    assert!(body["request_id"].as_str().is_some());
}

#[tokio::test]
async fn malformed_task_id_is_400() {
    let server = spawn(Harness::new()).await;

    let resp = server.get("/v1/tasks/not-a-task").await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "invalid_task_id");
}

#[tokio::test]
async fn expired_task_is_410() {
    let tasks = TaskRegistryConfig {
        ttl: Duration::from_millis(50),
        ..TaskRegistryConfig::default()
    };
    let server = spawn(Harness::with(fast_settings(), tasks)).await;

    let resp = server
        .client
        .delete(format!("{}/v1/servers/ghost", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    let task_id = body["task_id"].as_str().unwrap().to_string();

    server.wait_finished(&task_id).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let resp = server.get(&format!("/v1/tasks/{task_id}")).await;
    assert_eq!(resp.status(), 410);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "task_expired");
}

#[tokio::test]
async fn cancel_of_finished_task_reports_false() {
    let server = spawn(Harness::new()).await;

    let body: Value = server
        .post("/v1/servers/bulk-delete", json!({ "names": ["ghost"] }))
        .await
        .json()
        .await
        .unwrap();
    let task_id = body["task_id"].as_str().unwrap().to_string();
    server.wait_finished(&task_id).await;

    let resp = server
        .post(&format!("/v1/tasks/{task_id}/cancel"), json!({}))
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn bulk_endpoints_validate_names() {
    let server = spawn(Harness::new()).await;

    let resp = server
        .post("/v1/servers/actions", json!({ "action": "stop", "names": [] }))
        .await;
    assert_eq!(resp.status(), 400);

    let resp = server
        .post("/v1/servers/actions", json!({ "action": "hibernate", "names": ["a"] }))
        .await;
    assert!(resp.status().is_client_error());
}

#[tokio::test]
async fn unknown_server_is_404() {
    let server = spawn(Harness::new()).await;

    let resp = server.get("/v1/servers/nope").await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "server_not_found");
}

#[tokio::test]
async fn request_id_header_is_echoed_in_problems() {
    let server = spawn(Harness::new()).await;

    let resp = server
        .client
        .get(format!("{}/v1/tasks/bogus", server.base_url))
        .header("x-request-id", "req_from_client")
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["request_id"], "req_from_client");
}

#[tokio::test]
async fn notifications_follow_tasks() {
    let server = spawn(Harness::new()).await;
    server.harness.seed_server("a").await;

    let body: Value = server
        .post("/v1/servers/actions", json!({ "action": "reboot", "names": ["a"] }))
        .await
        .json()
        .await
        .unwrap();
    let task_id = body["task_id"].as_str().unwrap().to_string();
    server.wait_finished(&task_id).await;

    let body: Value = server.get("/v1/notifications?limit=5").await.json().await.unwrap();
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["severity"], "success");
    assert_eq!(items[0]["task_id"], task_id.as_str());
}
