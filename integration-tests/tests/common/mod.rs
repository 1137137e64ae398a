use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use migration_console::config::FeedConfig;
use migration_console::types::{
    CodeMetadata, CodePackage, Migration, MigrationRequest, MigrationStatus, Node, NodeMetrics,
    NodeRole, NodeStatus, Timestamp, Topology, UploadCodeRequest,
};
use migration_console::ConsoleConfig;

type ApiError = (StatusCode, Json<Value>);

/// Backend state behind the mock Command API.
#[derive(Default)]
pub struct Backend {
    pub nodes: Mutex<Vec<Node>>,
    pub migrations: Mutex<Vec<Migration>>,
    pub code: Mutex<Vec<CodePackage>>,
    /// Code ids whose migration request is answered with a 500.
    pub failing_codes: Mutex<HashSet<String>>,
    /// Start time and code id of every create-migration call.
    pub migration_calls: Mutex<Vec<(Instant, String)>>,
    pub request_ids: Mutex<Vec<String>>,
}

/// In-process Command API on an ephemeral port.
pub struct MockBackend {
    pub addr: SocketAddr,
    pub state: Arc<Backend>,
    server: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(Backend::default());
        *state.nodes.lock().unwrap() = vec![node("node-1"), node("node-2")];

        let app = router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock backend");
        let addr = listener.local_addr().expect("No local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Mock backend failed");
        });

        Self {
            addr,
            state,
            server,
        }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    pub fn fail_code(&self, code_id: &str) {
        self.state
            .failing_codes
            .lock()
            .unwrap()
            .insert(code_id.to_string());
    }

    pub fn migration_calls(&self) -> Vec<(Instant, String)> {
        self.state.migration_calls.lock().unwrap().clone()
    }

    /// Console config pointing at this backend. The feed side is expected
    /// to run over the in-memory transport.
    pub fn console_config(&self) -> ConsoleConfig {
        ConsoleConfig {
            api_base_url: self.api_url(),
            request_timeout_ms: 5_000,
            feed: FeedConfig {
                reconnect_delay_ms: 10,
                heartbeat_incoming_ms: 0,
                connect_timeout_ms: 60_000,
                ..FeedConfig::default()
            },
            ..ConsoleConfig::default()
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub fn node(id: &str) -> Node {
    Node {
        id: id.to_string(),
        host: "127.0.0.1".to_string(),
        port: 8081,
        role: NodeRole::Worker,
        status: NodeStatus::Online,
        metrics: Some(NodeMetrics {
            cpu_usage: Some(20.0),
            memory_usage: Some(40.0),
            ..NodeMetrics::default()
        }),
        connected_at: Some(Timestamp::now()),
    }
}

pub const WAIT: Duration = Duration::from_secs(5);

fn router(state: Arc<Backend>) -> Router {
    Router::new()
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/topology", get(topology))
        .route("/api/nodes/:id/metrics", get(node_metrics))
        .route("/api/migrations", post(create_migration).get(list_migrations))
        .route("/api/migrations/:id", get(get_migration))
        .route("/api/migrations/:id/cancel", post(cancel_migration))
        .route("/api/code", post(upload_code).get(list_code))
        .route("/api/code/:id", get(get_code))
        .with_state(state)
}

fn not_found(message: String) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "status": 404, "error": "Not Found", "message": message })),
    )
}

fn record_request_id(state: &Backend, headers: &HeaderMap) {
    if let Some(id) = headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
        state.request_ids.lock().unwrap().push(id.to_string());
    }
}

async fn list_nodes(State(state): State<Arc<Backend>>, headers: HeaderMap) -> Json<Vec<Node>> {
    record_request_id(&state, &headers);
    Json(state.nodes.lock().unwrap().clone())
}

async fn topology(State(state): State<Arc<Backend>>) -> Json<Topology> {
    Json(Topology {
        nodes: state.nodes.lock().unwrap().clone(),
        timestamp: Some(Timestamp::now()),
    })
}

async fn node_metrics(
    State(state): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> Result<Json<NodeMetrics>, ApiError> {
    state
        .nodes
        .lock()
        .unwrap()
        .iter()
        .find(|n| n.id == id)
        .and_then(|n| n.metrics.clone())
        .map(Json)
        .ok_or_else(|| not_found(format!("Node {} not found", id)))
}

async fn create_migration(
    State(state): State<Arc<Backend>>,
    Json(req): Json<MigrationRequest>,
) -> Result<Json<Migration>, ApiError> {
    state
        .migration_calls
        .lock()
        .unwrap()
        .push((Instant::now(), req.code_id.clone()));

    if state.failing_codes.lock().unwrap().contains(&req.code_id) {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "message": format!("Code package {} is locked", req.code_id) })),
        ));
    }

    let mut migrations = state.migrations.lock().unwrap();
    let migration = Migration {
        id: format!("mig-{}", migrations.len() + 1),
        migration_type: req.migration_type,
        source_node_id: req.source_node_id,
        target_node_id: req.target_node_id,
        code_id: req.code_id,
        status: MigrationStatus::Pending,
        progress: 0,
        start_time: Some(Timestamp::now()),
        end_time: None,
        error_message: None,
    };
    migrations.push(migration.clone());
    Ok(Json(migration))
}

async fn list_migrations(State(state): State<Arc<Backend>>) -> Json<Vec<Migration>> {
    Json(state.migrations.lock().unwrap().clone())
}

async fn get_migration(
    State(state): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> Result<Json<Migration>, ApiError> {
    state
        .migrations
        .lock()
        .unwrap()
        .iter()
        .find(|m| m.id == id)
        .cloned()
        .map(Json)
        .ok_or_else(|| not_found(format!("Migration {} not found", id)))
}

async fn cancel_migration(
    State(state): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> Result<Json<Migration>, ApiError> {
    let mut migrations = state.migrations.lock().unwrap();
    let migration = migrations
        .iter_mut()
        .find(|m| m.id == id)
        .ok_or_else(|| not_found(format!("Migration {} not found", id)))?;
    if !migration.is_terminal() {
        migration.status = MigrationStatus::Cancelled;
        migration.end_time = Some(Timestamp::now());
    }
    Ok(Json(migration.clone()))
}

async fn upload_code(
    State(state): State<Arc<Backend>>,
    Json(req): Json<UploadCodeRequest>,
) -> Json<CodePackage> {
    let mut code = state.code.lock().unwrap();
    let package = CodePackage {
        id: format!("code-{}", code.len() + 1),
        name: req.name,
        code: req.code,
        entry_point: req.entry_point,
        current_node_id: req.initial_node_id,
        metadata: CodeMetadata {
            created_at: Some(Timestamp::now()),
            version: Some("1.0".to_string()),
        },
        state: None,
    };
    code.push(package.clone());
    Json(package)
}

async fn list_code(State(state): State<Arc<Backend>>) -> Json<Vec<CodePackage>> {
    Json(state.code.lock().unwrap().clone())
}

async fn get_code(
    State(state): State<Arc<Backend>>,
    Path(id): Path<String>,
) -> Result<Json<CodePackage>, ApiError> {
    state
        .code
        .lock()
        .unwrap()
        .iter()
        .find(|c| c.id == id)
        .cloned()
        .map(Json)
        .ok_or_else(|| not_found(format!("Code package {} not found", id)))
}
