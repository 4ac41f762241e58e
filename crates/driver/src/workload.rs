//! Kubernetes object construction for sandbox workloads.
//!
//! A sandbox is a privileged docker-in-docker container plus a service. The
//! stateful flavor is a one-replica StatefulSet with a PVC template for the
//! docker graph; the ephemeral flavor is a one-replica Deployment with
//! emptyDir storage. Both mount a per-owner NFS subpath at `/root/share`.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, ExecAction, NFSVolumeSource,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecurityContext, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use playground_queue::WorkloadKind;

/// Label carried by every sandbox object; reconciliation lists by it.
pub const SANDBOX_LABEL: &str = "app=k8s-playground";

const STS_SELECTOR_APP: &str = "k8s-playground-sts";
const DEP_SELECTOR_APP: &str = "k8s-playground-dep";

/// Everything needed to build one sandbox's objects.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub kind: WorkloadKind,
    /// Stored as a label so orphaned workloads can be matched back to (the
    /// absence of) a reservation record.
    pub reservation_id: String,
    pub nfs_server: String,
    pub nfs_sub_path: String,
    /// Only used by the stateful flavor.
    pub pvc_size: String,
}

/// Name of the PVC a one-replica StatefulSet generates from its template.
pub fn pvc_name(workload: &str) -> String {
    format!("docker-graph-storage-{workload}-0")
}

fn object_labels(spec: &WorkloadSpec) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "k8s-playground".to_string()),
        ("component".to_string(), "dind-environment".to_string()),
        ("owner-id".to_string(), spec.name.clone()),
        ("reservation-id".to_string(), spec.reservation_id.clone()),
    ])
}

fn selector_labels(spec: &WorkloadSpec) -> BTreeMap<String, String> {
    let app = match spec.kind {
        WorkloadKind::Stateful => STS_SELECTOR_APP,
        WorkloadKind::Ephemeral => DEP_SELECTOR_APP,
    };
    BTreeMap::from([
        ("app".to_string(), app.to_string()),
        ("owner-id".to_string(), spec.name.clone()),
    ])
}

fn pod_labels(spec: &WorkloadSpec) -> BTreeMap<String, String> {
    let mut labels = selector_labels(spec);
    labels.insert("component".to_string(), "dind-environment".to_string());
    labels.insert("reservation-id".to_string(), spec.reservation_id.clone());
    labels
}

fn exec_probe(delay: i32, period: i32) -> Probe {
    // The nested docker engine must answer before the sandbox counts as up.
    Probe {
        exec: Some(ExecAction {
            command: Some(vec!["docker".to_string(), "ps".to_string()]),
        }),
        initial_delay_seconds: Some(delay),
        timeout_seconds: Some(5),
        period_seconds: Some(period),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn quantities(memory: &str, cpu: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("memory".to_string(), Quantity(memory.to_string())),
        ("cpu".to_string(), Quantity(cpu.to_string())),
    ])
}

fn dind_container(spec: &WorkloadSpec) -> Container {
    Container {
        name: "dind".to_string(),
        image: Some(spec.image.clone()),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        env: Some(vec![EnvVar {
            name: "DOCKER_TLS_CERTDIR".to_string(),
            value: Some(String::new()),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            container_port: 2375,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "docker-graph-storage".to_string(),
                mount_path: "/var/lib/docker".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "tmp".to_string(),
                mount_path: "/tmp".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "nfs-user-share".to_string(),
                mount_path: "/root/share".to_string(),
                sub_path: Some(spec.nfs_sub_path.clone()),
                ..Default::default()
            },
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(quantities("512Mi", "100m")),
            limits: Some(quantities("2Gi", "1000m")),
            ..Default::default()
        }),
        readiness_probe: Some(exec_probe(15, 10)),
        liveness_probe: Some(exec_probe(30, 20)),
        ..Default::default()
    }
}

fn shared_volumes(spec: &WorkloadSpec) -> Vec<Volume> {
    vec![
        Volume {
            name: "tmp".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "nfs-user-share".to_string(),
            nfs: Some(NFSVolumeSource {
                server: spec.nfs_server.clone(),
                path: "/".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

fn pod_template(spec: &WorkloadSpec, extra_volumes: Vec<Volume>) -> PodTemplateSpec {
    let mut volumes = shared_volumes(spec);
    volumes.extend(extra_volumes);
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels(spec)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![dind_container(spec)],
            volumes: Some(volumes),
            restart_policy: Some("Always".to_string()),
            dns_policy: Some("ClusterFirst".to_string()),
            ..Default::default()
        }),
    }
}

/// Headless service + StatefulSet with a PVC template for the docker graph.
pub fn stateful_objects(spec: &WorkloadSpec) -> (Service, StatefulSet) {
    let service = Service {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(object_labels(spec)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector_labels(spec)),
            ..Default::default()
        }),
        ..Default::default()
    };

    let sts = StatefulSet {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(object_labels(spec)),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            service_name: spec.name.clone(),
            selector: LabelSelector {
                match_labels: Some(selector_labels(spec)),
                ..Default::default()
            },
            template: pod_template(spec, Vec::new()),
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("docker-graph-storage".to_string()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(spec.pvc_size.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    (service, sts)
}

/// ClusterIP service + Deployment with emptyDir docker storage.
pub fn ephemeral_objects(spec: &WorkloadSpec) -> (Service, Deployment) {
    let service = Service {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(object_labels(spec)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(spec)),
            ports: Some(vec![ServicePort {
                name: Some("docker".to_string()),
                port: 2375,
                target_port: Some(IntOrString::Int(2375)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let graph_volume = Volume {
        name: "docker-graph-storage".to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(object_labels(spec)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels(spec)),
                ..Default::default()
            },
            template: pod_template(spec, vec![graph_volume]),
            ..Default::default()
        }),
        ..Default::default()
    };

    (service, deployment)
}

/// Label selector matching the pods of an ephemeral workload.
pub fn ephemeral_pod_selector(workload: &str) -> String {
    format!("app={DEP_SELECTOR_APP},owner-id={workload}")
}

/// Directory-safe form of a principal id: lowercase, runs of anything
/// outside `[a-z0-9-]` become a single `-`, leading/trailing `-` trimmed.
pub fn sanitize_owner(owner: &str) -> String {
    let lowered = owner.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            out.push(c);
            last_dash = c == '-';
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "invalid-name".to_string()
    } else {
        trimmed.to_string()
    }
}
