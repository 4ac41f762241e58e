//! In-pod HTTP proxy: one request per exec. A shell script inside the
//! sandbox starts a `kubectl port-forward` against the nested service, runs
//! a single curl, and tears the forward down again.

use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header::HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
    Extension,
};
use playground_queue::Status;
use tracing::{debug, warn};

use crate::api::{load_owned, resolve_pod_name};
use crate::auth::Principal;
use crate::error::ApiError;
use crate::AppState;

/// Overall deadline for discovery + exec + parse.
const PROXY_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Headers never copied from the inbound request into the curl command.
fn skip_request_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("content-length")
        || name.to_ascii_lowercase().starts_with("x-forwarded-")
}

/// Headers never copied from the curl output into the response.
fn skip_response_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("content-length")
}

/// Single-quote a string for the shell, escaping embedded quotes.
pub fn shell_single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// Drop the `port` pair the proxy itself consumes; everything else is
/// forwarded untouched.
pub fn strip_port_param(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| !pair.starts_with("port=") && !pair.is_empty())
        .collect::<Vec<_>>()
        .join("&")
}

fn port_param(query: &str) -> Option<&str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("port="))
}

/// The curl invocation that runs inside the sandbox.
pub fn build_curl_command(
    method: &Method,
    headers: &[(String, String)],
    body: Option<&[u8]>,
    port: u16,
    path_and_query: &str,
) -> String {
    // curl -X HEAD would hang waiting for a body; treat it as GET.
    let method = match *method {
        Method::HEAD => "GET".to_string(),
        ref m => m.to_string(),
    };

    let mut command = format!("curl -s -i -X {method}");
    for (name, value) in headers {
        if skip_request_header(name) {
            continue;
        }
        command.push_str(" -H ");
        command.push_str(&shell_single_quote(&format!("{name}: {value}")));
    }
    if let Some(body) = body.filter(|b| !b.is_empty()) {
        command.push_str(" --data-binary ");
        command.push_str(&shell_single_quote(&String::from_utf8_lossy(body)));
    }
    command.push_str(&format!(" http://localhost:{port}{path_and_query}"));
    command
}

/// Wrap the curl in a port-forward that is always torn down, even when the
/// exec context is cancelled mid-request.
pub fn build_proxy_script(service: &str, request_port: u16, service_port: u16, curl: &str) -> String {
    format!(
        r#"kubectl port-forward service/{service} {request_port}:{service_port} > /dev/null 2>&1 &
PF_PID=$!
trap 'kill $PF_PID 2>/dev/null || true' EXIT
sleep 2
{curl}
kill $PF_PID 2>/dev/null || true
wait $PF_PID 2>/dev/null || true
"#
    )
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Split raw `curl -i` output into status, headers, and body. `None` when
/// no header/body separator exists (callers return the output as plain
/// text).
pub fn parse_curl_response(output: &str) -> Option<ParsedResponse> {
    let (header_section, body) = output
        .split_once("\r\n\r\n")
        .or_else(|| output.split_once("\n\n"))?;

    let mut lines = header_section.lines();
    let status_line = lines.next().unwrap_or_default().trim();
    let status = status_line
        .strip_prefix("HTTP/")
        .and_then(|rest| rest.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(200);

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim();
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if skip_response_header(name) {
            continue;
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Some(ParsedResponse {
        status,
        headers,
        body: body.to_string(),
    })
}

fn with_cors(mut builder: axum::http::response::Builder) -> axum::http::response::Builder {
    builder = builder
        .header("Access-Control-Allow-Origin", "*")
        .header(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, DELETE, OPTIONS",
        )
        .header(
            "Access-Control-Allow-Headers",
            "Content-Type, Authorization, X-Requested-With",
        );
    builder
}

/// ANY /reservations/{id}/proxy/{path...}?port=P
pub async fn proxy(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let record = load_owned(&state, &id, &principal).await?;
    if record.status != Status::Available {
        return Err(ApiError::Validation("Environment is not available".to_string()));
    }
    if record.pod_id.is_empty() {
        return Err(ApiError::Validation("Pod ID not available".to_string()));
    }
    let pod_name = resolve_pod_name(&state, &record).await?;

    let method = request.method().clone();
    let query = request.uri().query().unwrap_or("").to_string();
    let headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            Some((name.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();

    let port: u16 = port_param(&query)
        .unwrap_or("80")
        .parse()
        .map_err(|_| ApiError::Validation("port must be a number".to_string()))?;

    let body = if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
        let bytes = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|e| ApiError::Validation(format!("failed to read request body: {e}")))?;
        Some(bytes.to_vec())
    } else {
        None
    };

    let mut path_and_query = format!("/{path}");
    let forwarded_query = strip_port_param(&query);
    if !forwarded_query.is_empty() {
        path_and_query.push('?');
        path_and_query.push_str(&forwarded_query);
    }

    let result = tokio::time::timeout(
        PROXY_TIMEOUT,
        proxy_through_pod(
            &state,
            &pod_name,
            port,
            &method,
            &headers,
            body.as_deref(),
            &path_and_query,
        ),
    )
    .await;

    match result {
        Ok(response) => response,
        Err(_) => Err(ApiError::Timeout("Request timeout".to_string())),
    }
}

async fn proxy_through_pod(
    state: &AppState,
    pod_name: &str,
    port: u16,
    method: &Method,
    headers: &[(String, String)],
    body: Option<&[u8]>,
    path_and_query: &str,
) -> Result<Response, ApiError> {
    let services = state
        .driver
        .discover_services(pod_name, &state.config.namespace)
        .await
        .map_err(|e| {
            warn!(pod = %pod_name, error = %e, "service discovery failed");
            ApiError::Unavailable(format!("Failed to discover services in pod {pod_name}"))
        })?;

    let target = services
        .iter()
        .find(|s| s.port == port)
        .ok_or_else(|| ApiError::NotFound(format!("Service not found on port {port}")))?;

    let curl = build_curl_command(method, headers, body, port, path_and_query);
    let script = build_proxy_script(&target.name, port, target.port, &curl);
    debug!(pod = %pod_name, service = %target.name, port = port, "proxying through sandbox");

    let output = state
        .driver
        .exec_collect(
            pod_name,
            &state.config.namespace,
            vec!["bash".to_string(), "-c".to_string(), script],
        )
        .await
        .map_err(|e| {
            ApiError::Unavailable(format!("Failed to connect to service on port {port}: {e}"))
        })?;

    if let Some(failure) = &output.failure {
        return Err(ApiError::Unavailable(format!(
            "Failed to connect to service on port {port}: {failure}; stderr: {}",
            output.stderr.trim()
        )));
    }
    if output.stdout.is_empty() {
        return Err(ApiError::Unavailable(format!(
            "Empty response from service on port {port}"
        )));
    }

    let response = match parse_curl_response(&output.stdout) {
        Some(parsed) => parsed,
        None => {
            // No header separator; hand the raw output back as text.
            let builder = with_cors(Response::builder().status(StatusCode::OK))
                .header("Content-Type", "text/plain");
            return builder
                .body(Body::from(output.stdout))
                .map_err(|e| ApiError::Internal(e.to_string()));
        }
    };

    let mut builder = with_cors(Response::builder().status(
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK),
    ));
    for (name, value) in &response.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) else {
            continue;
        };
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(response.body))
        .map_err(|e| ApiError::Internal(e.to_string()))
}
