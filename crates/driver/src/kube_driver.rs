//! kube-rs implementation of [`ClusterDriver`].

use async_trait::async_trait;
use futures::SinkExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::{
    api::{Api, AttachParams, AttachedProcess, DeleteParams, ListParams, PostParams, TerminalSize},
    Client,
};
use playground_queue::WorkloadKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::{
    cluster_not_ready, kubectl_probe_script, merge_by_port, netstat_script, parse_kubectl_output,
    parse_netstat, parse_port_scan, port_scan_script,
};
use crate::workload::{
    ephemeral_objects, ephemeral_pod_selector, pvc_name, sanitize_owner, stateful_objects,
    SANDBOX_LABEL,
};
use crate::{
    ClusterDriver, DriverError, ExecOutput, ExecStreams, SandboxWorkload, ServiceInfo,
    WorkloadSpec,
};

/// Pod name of the NFS server exporting the per-owner share root.
pub const NFS_SERVER_POD: &str = "k8s-playground-nfs-server-0";
/// Service name resolved to reach the NFS server by ClusterIP.
pub const NFS_SERVICE: &str = "k8s-playground-nfs-server";

const SANDBOX_CONTAINER: &str = "dind";

#[derive(Clone)]
pub struct KubeDriver {
    client: Client,
}

impl KubeDriver {
    /// Build from in-cluster config or the local kubeconfig.
    pub async fn new() -> Result<Self, DriverError> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn exec_in(
        &self,
        pod: &str,
        namespace: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecOutput, DriverError> {
        let mut ap = AttachParams::default();
        if let Some(container) = container {
            ap = ap.container(container);
        }
        let mut attached = self.pods(namespace).exec(pod, command, &ap).await?;
        collect_attached(&mut attached).await
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Drain stdout/stderr of an attached process and wait for it to finish.
/// Both streams are read concurrently so neither can back up the other.
async fn collect_attached(attached: &mut AttachedProcess) -> Result<ExecOutput, DriverError> {
    let stdout = attached.stdout().map(read_stream);
    let stderr = attached.stderr().map(read_stream);
    let status = attached.take_status();

    let (stdout, stderr) = tokio::join!(
        async {
            match stdout {
                Some(fut) => fut.await,
                None => String::new(),
            }
        },
        async {
            match stderr {
                Some(fut) => fut.await,
                None => String::new(),
            }
        }
    );

    let mut out = ExecOutput {
        stdout,
        stderr,
        failure: None,
    };
    if let Some(status) = status {
        if let Some(status) = status.await {
            if status.status.as_deref() == Some("Failure") {
                out.failure = Some(status.message.unwrap_or_else(|| "command failed".into()));
            }
        }
    }
    Ok(out)
}

async fn read_stream(mut stream: impl tokio::io::AsyncRead + Unpin) -> String {
    let mut buf = Vec::new();
    let _ = tokio::io::copy(&mut stream, &mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[async_trait]
impl ClusterDriver for KubeDriver {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<String, DriverError> {
        let services = self.services(&spec.namespace);
        let pp = PostParams::default();

        match spec.kind {
            WorkloadKind::Stateful => {
                let (service, sts) = stateful_objects(spec);
                if let Err(e) = services.create(&pp, &service).await {
                    if !is_already_exists(&e) {
                        return Err(e.into());
                    }
                }
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &spec.namespace);
                if let Err(e) = api.create(&pp, &sts).await {
                    // The half-created service would otherwise be orphaned.
                    let _ = services.delete(&spec.name, &DeleteParams::default()).await;
                    return Err(e.into());
                }
                info!(workload = %spec.name, "created stateful sandbox");
                Ok(format!("{}-0", spec.name))
            }
            WorkloadKind::Ephemeral => {
                let (service, deployment) = ephemeral_objects(spec);
                if let Err(e) = services.create(&pp, &service).await {
                    if !is_already_exists(&e) {
                        return Err(e.into());
                    }
                }
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &spec.namespace);
                if let Err(e) = api.create(&pp, &deployment).await {
                    let _ = services.delete(&spec.name, &DeleteParams::default()).await;
                    return Err(e.into());
                }
                info!(workload = %spec.name, "created ephemeral sandbox");
                Ok(String::new())
            }
        }
    }

    async fn resolve_pod(&self, workload: &str, namespace: &str) -> Result<String, DriverError> {
        let lp = ListParams::default().labels(&ephemeral_pod_selector(workload));
        let pod_list = self.pods(namespace).list(&lp).await?;
        if pod_list.items.is_empty() {
            return Err(DriverError::NoPod(workload.to_string()));
        }
        for pod in &pod_list.items {
            let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
            if matches!(phase, Some("Running" | "Pending")) {
                if let Some(name) = &pod.metadata.name {
                    return Ok(name.clone());
                }
            }
        }
        pod_list.items[0]
            .metadata
            .name
            .clone()
            .ok_or_else(|| DriverError::NoPod(workload.to_string()))
    }

    async fn is_pod_ready(&self, pod: &str, namespace: &str) -> Result<bool, DriverError> {
        let pod_obj = self.pods(namespace).get(pod).await?;
        let Some(status) = pod_obj.status else {
            return Ok(false);
        };

        match status.phase.as_deref() {
            Some("Running") => {}
            Some(other) => {
                debug!(pod = %pod, phase = %other, "pod not yet running");
                return Ok(false);
            }
            None => return Ok(false),
        }

        let container_statuses = status.container_statuses.unwrap_or_default();
        if container_statuses.is_empty() {
            return Ok(false);
        }

        for cs in &container_statuses {
            if cs.ready {
                continue;
            }
            if let Some(state) = &cs.state {
                if let Some(waiting) = &state.waiting {
                    if matches!(
                        waiting.reason.as_deref(),
                        Some("CrashLoopBackOff" | "ImagePullBackOff" | "ErrImagePull")
                    ) {
                        return Err(DriverError::Fatal(format!(
                            "container {} in {} state",
                            cs.name,
                            waiting.reason.as_deref().unwrap_or("waiting")
                        )));
                    }
                }
                if let Some(terminated) = &state.terminated {
                    return Err(DriverError::Fatal(format!(
                        "container {} terminated with exit code {}",
                        cs.name, terminated.exit_code
                    )));
                }
            }
            return Ok(false);
        }

        Ok(true)
    }

    async fn delete_workload(
        &self,
        name: &str,
        namespace: &str,
        kind: WorkloadKind,
    ) -> Result<(), DriverError> {
        let cascade = DeleteParams::foreground();

        match kind {
            WorkloadKind::Stateful => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                if let Err(e) = api.delete(name, &cascade).await {
                    if !is_not_found(&e) {
                        return Err(e.into());
                    }
                }
            }
            WorkloadKind::Ephemeral => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                if let Err(e) = api.delete(name, &cascade).await {
                    if !is_not_found(&e) {
                        return Err(e.into());
                    }
                }
            }
        }

        if let Err(e) = self
            .services(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            if !is_not_found(&e) {
                return Err(e.into());
            }
        }

        if kind == WorkloadKind::Stateful {
            let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
            if let Err(e) = pvcs.delete(&pvc_name(name), &DeleteParams::default()).await {
                if !is_not_found(&e) {
                    return Err(e.into());
                }
            }
        }

        info!(workload = %name, kind = %kind, "deleted sandbox workload");
        Ok(())
    }

    async fn ensure_owner_directory(
        &self,
        namespace: &str,
        owner: &str,
    ) -> Result<String, DriverError> {
        let slug = sanitize_owner(owner);
        let dir = format!("/exports/{slug}");
        let out = self
            .exec_in(
                NFS_SERVER_POD,
                namespace,
                None,
                vec!["mkdir".to_string(), "-p".to_string(), dir.clone()],
            )
            .await?;
        if let Some(failure) = out.failure {
            warn!(dir = %dir, stderr = %out.stderr, "mkdir on nfs server failed");
            return Err(DriverError::Stream(format!(
                "mkdir {dir} on nfs server failed: {failure}"
            )));
        }
        Ok(slug)
    }

    async fn service_cluster_ip(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<String, DriverError> {
        let service = self.services(namespace).get(name).await?;
        match service.spec.and_then(|s| s.cluster_ip) {
            Some(ip) if !ip.is_empty() && ip != "None" => Ok(ip),
            _ => Err(DriverError::NoClusterIp(name.to_string())),
        }
    }

    async fn exec_collect(
        &self,
        pod: &str,
        namespace: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, DriverError> {
        self.exec_in(pod, namespace, Some(SANDBOX_CONTAINER), command)
            .await
    }

    async fn exec_shell(
        &self,
        pod: &str,
        namespace: &str,
        command: Vec<String>,
        io: ExecStreams,
        cancel: CancellationToken,
    ) -> Result<(), DriverError> {
        let ap = AttachParams::default()
            .container(SANDBOX_CONTAINER)
            .stdin(true)
            .stdout(true)
            .stderr(false)
            .tty(true);

        let mut attached = self.pods(namespace).exec(pod, command, &ap).await?;

        let mut stdin_writer = attached
            .stdin()
            .ok_or_else(|| DriverError::Stream("exec stdin unavailable".into()))?;
        let mut stdout_reader = attached
            .stdout()
            .ok_or_else(|| DriverError::Stream("exec stdout unavailable".into()))?;
        let mut size_tx = attached
            .terminal_size()
            .ok_or_else(|| DriverError::Stream("exec resize channel unavailable".into()))?;

        let ExecStreams {
            mut stdin,
            stdout,
            mut resize,
        } = io;

        tokio::spawn(async move {
            while let Some(size) = resize.recv().await {
                let msg = TerminalSize {
                    width: size.cols,
                    height: size.rows,
                };
                if size_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(bytes) = stdin.recv().await {
                if stdin_writer.write_all(&bytes).await.is_err() {
                    break;
                }
                let _ = stdin_writer.flush().await;
            }
        });

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    () = reader_cancel.cancelled() => break,
                    read = stdout_reader.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stdout.send(buf[..n].to_vec()).await.is_err() {
                                break;
                            }
                        }
                    },
                }
            }
        });

        tokio::select! {
            result = attached.join() => {
                result.map_err(|e| DriverError::Stream(e.to_string()))
            }
            () = cancel.cancelled() => {
                debug!(pod = %pod, "exec session cancelled");
                Ok(())
            }
        }
    }

    async fn discover_services(
        &self,
        pod: &str,
        namespace: &str,
    ) -> Result<Vec<ServiceInfo>, DriverError> {
        let sh = |script: String| vec!["sh".to_string(), "-c".to_string(), script];

        let mut nested = match self
            .exec_collect(pod, namespace, sh(kubectl_probe_script()))
            .await
        {
            Ok(out) if !cluster_not_ready(&out.stdout) => parse_kubectl_output(&out.stdout),
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(pod = %pod, error = %e, "kubectl probe failed");
                Vec::new()
            }
        };

        if nested.is_empty() {
            match self
                .exec_collect(pod, namespace, sh(port_scan_script()))
                .await
            {
                Ok(out) => nested = parse_port_scan(&out.stdout),
                Err(e) => warn!(pod = %pod, error = %e, "port scan failed"),
            }
        }

        // Services running directly in the sandbox container, outside the
        // nested cluster.
        let direct = match self.exec_collect(pod, namespace, sh(netstat_script())).await {
            Ok(out) => parse_netstat(&out.stdout),
            Err(e) => {
                warn!(pod = %pod, error = %e, "netstat probe failed");
                Vec::new()
            }
        };

        Ok(merge_by_port(nested, direct))
    }

    async fn list_sandbox_workloads(
        &self,
        namespace: &str,
    ) -> Result<Vec<SandboxWorkload>, DriverError> {
        let lp = ListParams::default().labels(SANDBOX_LABEL);
        let mut out = Vec::new();

        let sts: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        for item in sts.list(&lp).await? {
            if let Some(name) = item.metadata.name {
                out.push(SandboxWorkload {
                    name,
                    kind: WorkloadKind::Stateful,
                    reservation_id: item
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get("reservation-id").cloned()),
                });
            }
        }

        let deps: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        for item in deps.list(&lp).await? {
            if let Some(name) = item.metadata.name {
                out.push(SandboxWorkload {
                    name,
                    kind: WorkloadKind::Ephemeral,
                    reservation_id: item
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get("reservation-id").cloned()),
                });
            }
        }

        Ok(out)
    }
}
