//! Nested-service discovery: shell probes run inside the sandbox container
//! and the parsers for their output.
//!
//! Three sources, merged by (name, port): the nested cluster's service and
//! endpoint tables via kubectl, listening sockets of the sandbox container
//! itself via netstat/ss, and a fixed-list `/dev/tcp` port scan used when
//! kubectl is unavailable or reports nothing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Ports probed by the fallback scan.
pub const COMMON_PORTS: &[u16] = &[
    80, 443, 3000, 8000, 8080, 8443, 3001, 4000, 5000, 8001, 8888, 9000, 30000, 30001, 30002,
    30003, 30080, 31000,
];

/// One service reachable inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub port: u16,
    pub protocol: String,
    pub description: String,
    /// True when at least one endpoint backs the service.
    pub verified: bool,
}

/// Probe script for the nested cluster: cluster-info gate, then service and
/// endpoint tables with system namespaces filtered out.
pub fn kubectl_probe_script() -> String {
    r#"
if command -v kubectl >/dev/null 2>&1; then
  if timeout 3 kubectl cluster-info --request-timeout=3s >/dev/null 2>&1; then
    echo "=== SERVICES ==="
    timeout 5 kubectl get services --all-namespaces --no-headers -o custom-columns="NAME:.metadata.name,NAMESPACE:.metadata.namespace,TYPE:.spec.type,CLUSTER-IP:.spec.clusterIP,PORTS:.spec.ports[*].port" --request-timeout=3s 2>/dev/null | grep -v '^kube-' | grep -v '^kubernetes ' || echo "no_user_services"
    echo "=== ENDPOINTS ==="
    timeout 5 kubectl get endpoints --all-namespaces --no-headers -o custom-columns="NAME:.metadata.name,NAMESPACE:.metadata.namespace,PORTS:.subsets[*].ports[*].port" --request-timeout=3s 2>/dev/null | grep -v '^kube-' | grep -v '^kubernetes ' || echo "no_endpoints"
  else
    echo "cluster_not_ready"
  fi
else
  echo "kubectl_not_found"
fi
"#
    .to_string()
}

/// Probe script checking every common port for a listener.
pub fn port_scan_script() -> String {
    let mut script = String::new();
    for port in COMMON_PORTS {
        script.push_str(&format!(
            "timeout 1 bash -c \"</dev/tcp/localhost/{port}\" >/dev/null 2>&1 && echo \"port_{port}_open\" || echo \"port_{port}_closed\"\n"
        ));
    }
    script
}

/// Probe script listing listening sockets of the sandbox container itself.
pub fn netstat_script() -> String {
    "timeout 5 netstat -tlnp 2>/dev/null | grep LISTEN || timeout 5 ss -tlnp 2>/dev/null | grep LISTEN || echo 'no_listening_services'".to_string()
}

/// Whether the kubectl probe output means the nested cluster cannot answer.
pub fn cluster_not_ready(output: &str) -> bool {
    output.contains("cluster_not_ready") || output.contains("kubectl_not_found")
}

/// Parse the `=== SERVICES ===` / `=== ENDPOINTS ===` sections. Services
/// with at least one endpoint on the same (name, port) are marked verified;
/// endpoints with no service row become entries of their own.
pub fn parse_kubectl_output(output: &str) -> Vec<ServiceInfo> {
    let mut services: BTreeMap<(String, u16), ServiceInfo> = BTreeMap::new();

    let mut section = "";
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix("=== ").and_then(|l| l.strip_suffix(" ===")) {
            section = match header {
                "SERVICES" => "services",
                "ENDPOINTS" => "endpoints",
                _ => "",
            };
            continue;
        }
        if line == "no_user_services" || line == "no_endpoints" {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        match section {
            "services" if fields.len() >= 5 => {
                let (name, namespace, svc_type, ports) =
                    (fields[0], fields[1], fields[2], fields[4]);
                for port in parse_port_list(ports) {
                    services.insert(
                        (name.to_string(), port),
                        ServiceInfo {
                            name: name.to_string(),
                            port,
                            protocol: "http".to_string(),
                            description: format!(
                                "{name} service in {namespace} namespace (Type: {svc_type})"
                            ),
                            verified: false,
                        },
                    );
                }
            }
            "endpoints" if fields.len() >= 3 => {
                let (name, namespace, ports) = (fields[0], fields[1], fields[2]);
                for port in parse_port_list(ports) {
                    services
                        .entry((name.to_string(), port))
                        .and_modify(|s| s.verified = true)
                        .or_insert_with(|| ServiceInfo {
                            name: format!("{name}-endpoint"),
                            port,
                            protocol: "http".to_string(),
                            description: format!("Endpoint: {name} in {namespace} namespace"),
                            verified: true,
                        });
                }
            }
            _ => {}
        }
    }

    services.into_values().collect()
}

fn parse_port_list(raw: &str) -> Vec<u16> {
    if raw == "<none>" {
        return Vec::new();
    }
    raw.split(',')
        .filter_map(|p| p.trim().parse().ok())
        .collect()
}

/// Parse `port_P_open` lines from the port-scan script.
pub fn parse_port_scan(output: &str) -> Vec<ServiceInfo> {
    let mut found = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("port_") else {
            continue;
        };
        let Some(port_str) = rest.strip_suffix("_open") else {
            continue;
        };
        if let Ok(port) = port_str.parse::<u16>() {
            found.push(ServiceInfo {
                name: format!("service-{port}"),
                port,
                protocol: "tcp".to_string(),
                description: service_description(port),
                verified: false,
            });
        }
    }
    found
}

/// Parse netstat or ss listening-socket lines into services. System ports
/// below 1024 are skipped unless they are well-known web ports.
pub fn parse_netstat(output: &str) -> Vec<ServiceInfo> {
    let mut services: Vec<ServiceInfo> = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || !line.contains("LISTEN") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let (protocol, address) = if fields[0].starts_with("tcp") || fields[0].starts_with("udp") {
            // netstat: tcp 0 0 0.0.0.0:80 0.0.0.0:* LISTEN
            (fields[0], fields[3])
        } else if fields.len() >= 4 && fields[3].contains(':') {
            // ss: LISTEN 0 128 *:80 *:*
            ("tcp", fields[3])
        } else {
            continue;
        };

        let Some(port_str) = address.rsplit(':').next() else {
            continue;
        };
        let Ok(port) = port_str.parse::<u16>() else {
            continue;
        };
        if port < 1024 && !matches!(port, 80 | 443) {
            continue;
        }
        if services.iter().any(|s| s.port == port) {
            continue;
        }
        services.push(ServiceInfo {
            name: format!("service-{port}"),
            port,
            protocol: protocol.to_string(),
            description: service_description(port),
            verified: false,
        });
    }

    services
}

fn service_description(port: u16) -> String {
    let known = match port {
        80 => "HTTP Web Server",
        443 => "HTTPS Web Server",
        3000 | 3001 | 4000 | 5000 => "Development Server",
        8000 | 8001 => "HTTP Alternative",
        8080 => "HTTP Proxy/Alternative",
        8443 => "HTTPS Alternative",
        8888 => "Jupyter/Application Server",
        9000 => "Application Server",
        3306 => "MySQL Database",
        5432 => "PostgreSQL Database",
        6379 => "Redis Cache",
        _ => return format!("Service on port {port}"),
    };
    known.to_string()
}

/// Merge discovery sources, keeping the first entry per port.
pub fn merge_by_port(primary: Vec<ServiceInfo>, secondary: Vec<ServiceInfo>) -> Vec<ServiceInfo> {
    let mut merged = primary;
    for candidate in secondary {
        if !merged.iter().any(|s| s.port == candidate.port) {
            merged.push(candidate);
        }
    }
    merged
}
