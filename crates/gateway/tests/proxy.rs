//! Proxy handler behavior with a scripted exec backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::Extension;
use playground_controllers::audit_sink::AuditLog;
use playground_driver::{
    ClusterDriver, DriverError, ExecOutput, ExecStreams, SandboxWorkload, ServiceInfo,
    WorkloadSpec,
};
use playground_gateway::auth::{Principal, SessionSigner};
use playground_gateway::config::{AuthMethod, Config};
use playground_gateway::{proxy, AppState};
use playground_queue::{MemoryStore, Reservation, Status, WorkloadKind};
use tokio_util::sync::CancellationToken;

/// Driver whose exec returns a canned curl transcript and records the
/// scripts it was asked to run.
struct ScriptedDriver {
    curl_output: String,
    scripts: Mutex<Vec<String>>,
}

#[async_trait]
impl ClusterDriver for ScriptedDriver {
    async fn create_workload(&self, _spec: &WorkloadSpec) -> Result<String, DriverError> {
        unreachable!("proxy never creates workloads")
    }

    async fn resolve_pod(&self, workload: &str, _ns: &str) -> Result<String, DriverError> {
        Ok(format!("{workload}-pod"))
    }

    async fn is_pod_ready(&self, _pod: &str, _ns: &str) -> Result<bool, DriverError> {
        Ok(true)
    }

    async fn delete_workload(
        &self,
        _name: &str,
        _ns: &str,
        _kind: WorkloadKind,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    async fn ensure_owner_directory(&self, _ns: &str, owner: &str) -> Result<String, DriverError> {
        Ok(owner.to_string())
    }

    async fn service_cluster_ip(&self, _name: &str, _ns: &str) -> Result<String, DriverError> {
        Ok("10.0.0.9".to_string())
    }

    async fn exec_collect(
        &self,
        _pod: &str,
        _ns: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, DriverError> {
        self.scripts
            .lock()
            .unwrap()
            .push(command.last().cloned().unwrap_or_default());
        Ok(ExecOutput {
            stdout: self.curl_output.clone(),
            stderr: String::new(),
            failure: None,
        })
    }

    async fn exec_shell(
        &self,
        _pod: &str,
        _ns: &str,
        _command: Vec<String>,
        _io: ExecStreams,
        _cancel: CancellationToken,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    async fn discover_services(
        &self,
        _pod: &str,
        _ns: &str,
    ) -> Result<Vec<ServiceInfo>, DriverError> {
        Ok(vec![ServiceInfo {
            name: "demo".to_string(),
            port: 8080,
            protocol: "http".to_string(),
            description: "demo service in default namespace".to_string(),
            verified: true,
        }])
    }

    async fn list_sandbox_workloads(&self, _ns: &str) -> Result<Vec<SandboxWorkload>, DriverError> {
        Ok(Vec::new())
    }
}

fn state_with_driver(
    store: Arc<MemoryStore>,
    driver: Arc<ScriptedDriver>,
    log_dir: &std::path::Path,
) -> AppState {
    let config = Config {
        redis_url: String::new(),
        port: 8080,
        namespace: "default".to_string(),
        base_url: "http://localhost:8080".to_string(),
        auth_method: AuthMethod::Password,
        oauth_client_id: String::new(),
        oauth_client_secret: String::new(),
        oauth_allowed_domains: Vec::new(),
        admin_password: "admin123".to_string(),
        admin_principals: Vec::new(),
        session_key: b"test-key".to_vec(),
        version_image_map: HashMap::new(),
        default_workload_type: WorkloadKind::Stateful,
        log_dir: log_dir.display().to_string(),
        audit_api_url: String::new(),
        audit_admin_token: String::new(),
        production: false,
    };
    AppState {
        store,
        driver,
        config: Arc::new(config),
        signer: Arc::new(SessionSigner::new(b"test-key".to_vec())),
        oauth: None,
        audit_log: Arc::new(AuditLog::open(log_dir).unwrap()),
        http: reqwest::Client::new(),
    }
}

async fn available_reservation(store: &MemoryStore) -> Reservation {
    let mut record = Reservation::new("alice@example.com", "1.33", "", WorkloadKind::Stateful);
    record.status = Status::Available;
    record.pod_id = "k8s-playground-abcd1234".to_string();
    store.insert_raw(record.clone()).await;
    record
}

fn proxy_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn proxy_preserves_status_headers_and_body() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(ScriptedDriver {
        curl_output: "HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"ok\":true}".to_string(),
        scripts: Mutex::new(Vec::new()),
    });
    let dir = tempfile::tempdir().unwrap();
    let state = state_with_driver(store.clone(), driver.clone(), dir.path());
    let record = available_reservation(&store).await;

    let response = proxy::proxy(
        State(state),
        Extension(Principal::new("alice@example.com", "Alice")),
        Path((record.id.clone(), "health".to_string())),
        proxy_request(&format!(
            "/reservations/{}/proxy/health?port=8080",
            record.id
        )),
    )
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response
            .headers()
            .get("Access-Control-Allow-Origin")
            .unwrap(),
        "*"
    );
    assert_eq!(
        response.headers().get("Content-Type").unwrap(),
        "application/json"
    );
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"{\"ok\":true}");

    let scripts = driver.scripts.lock().unwrap();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains("kubectl port-forward service/demo 8080:8080"));
    assert!(scripts[0].contains("curl -s -i -X GET"));
    assert!(scripts[0].contains("http://localhost:8080/health"));
    // The port parameter itself is not forwarded.
    assert!(!scripts[0].contains("health?port="));
}

#[tokio::test]
async fn proxy_unknown_port_is_service_not_found() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(ScriptedDriver {
        curl_output: String::new(),
        scripts: Mutex::new(Vec::new()),
    });
    let dir = tempfile::tempdir().unwrap();
    let state = state_with_driver(store.clone(), driver.clone(), dir.path());
    let record = available_reservation(&store).await;

    let result = proxy::proxy(
        State(state),
        Extension(Principal::new("alice@example.com", "Alice")),
        Path((record.id.clone(), "health".to_string())),
        proxy_request(&format!(
            "/reservations/{}/proxy/health?port=65534",
            record.id
        )),
    )
    .await;

    let response = result.err().unwrap().into_response();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    // No exec ran because no service matched the port.
    assert!(driver.scripts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn proxy_requires_available_reservation() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(ScriptedDriver {
        curl_output: String::new(),
        scripts: Mutex::new(Vec::new()),
    });
    let dir = tempfile::tempdir().unwrap();
    let state = state_with_driver(store.clone(), driver, dir.path());

    let record = Reservation::new("alice@example.com", "1.33", "", WorkloadKind::Stateful);
    let id = record.id.clone();
    store.insert_raw(record).await;

    let result = proxy::proxy(
        State(state),
        Extension(Principal::new("alice@example.com", "Alice")),
        Path((id.clone(), "health".to_string())),
        proxy_request(&format!("/reservations/{id}/proxy/health?port=8080")),
    )
    .await;

    assert_eq!(
        result.err().unwrap().into_response().status(),
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn proxy_plain_output_falls_back_to_text() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(ScriptedDriver {
        curl_output: "raw output with no header separator".to_string(),
        scripts: Mutex::new(Vec::new()),
    });
    let dir = tempfile::tempdir().unwrap();
    let state = state_with_driver(store.clone(), driver, dir.path());
    let record = available_reservation(&store).await;

    let response = proxy::proxy(
        State(state),
        Extension(Principal::new("alice@example.com", "Alice")),
        Path((record.id.clone(), "health".to_string())),
        proxy_request(&format!(
            "/reservations/{}/proxy/health?port=8080",
            record.id
        )),
    )
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("Content-Type").unwrap(), "text/plain");
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"raw output with no header separator");
}
