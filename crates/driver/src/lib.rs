//! Stateless adapter over the outer Kubernetes API.
//!
//! Everything the lifecycle loops and the gateway need from the cluster goes
//! through [`ClusterDriver`]: creating and deleting the privileged
//! docker-in-docker workloads, probing readiness, opening exec streams, and
//! discovering services nested inside a sandbox. The driver owns no state.

mod discovery;
mod kube_driver;
mod workload;

pub use discovery::{ServiceInfo, COMMON_PORTS};
pub use kube_driver::{KubeDriver, NFS_SERVER_POD, NFS_SERVICE};
pub use workload::{pvc_name, WorkloadSpec, SANDBOX_LABEL};

use async_trait::async_trait;
use playground_queue::WorkloadKind;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Terminal dimensions forwarded from the browser into the exec stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

/// Channel ends for an interactive TTY exec session.
///
/// The caller keeps the other halves: it feeds browser bytes into `stdin`,
/// drains pod output from `stdout`, and pushes coalesced resize events into
/// `resize`.
pub struct ExecStreams {
    pub stdin: mpsc::Receiver<Vec<u8>>,
    pub stdout: mpsc::Sender<Vec<u8>>,
    pub resize: mpsc::Receiver<TermSize>,
}

/// Captured output of a non-interactive exec.
#[derive(Debug, Default, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Set when the remote process ended abnormally; callers that need the
    /// collected output for diagnostics still get it.
    pub failure: Option<String>,
}

/// A sandbox-labeled workload object observed in the namespace, used by the
/// reconciliation sweep to find orphans.
#[derive(Debug, Clone)]
pub struct SandboxWorkload {
    pub name: String,
    pub kind: WorkloadKind,
    pub reservation_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),
    #[error("no pods found for workload {0}")]
    NoPod(String),
    #[error("service {0} does not have a ClusterIP")]
    NoClusterIp(String),
    /// The pod will not come up on its own (crash loop, image pull failure,
    /// terminated container); callers should stop waiting.
    #[error("{0}")]
    Fatal(String),
    #[error("exec stream error: {0}")]
    Stream(String),
}

/// Adapter over the outer cluster.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Create the service + workload pair for a sandbox. Returns the pod
    /// name when it is deterministic (stateful: `{name}-0`), otherwise an
    /// empty string; ephemeral pod names are discovered via [`Self::resolve_pod`].
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<String, DriverError>;

    /// Resolve the pod backing an ephemeral workload by its owner label,
    /// preferring a running or pending replica.
    async fn resolve_pod(&self, workload: &str, namespace: &str) -> Result<String, DriverError>;

    /// True iff the pod phase is `Running` and every container is `Ready`.
    /// Returns [`DriverError::Fatal`] when waiting longer cannot help.
    async fn is_pod_ready(&self, pod: &str, namespace: &str) -> Result<bool, DriverError>;

    /// Cascading, idempotent delete of the workload, its service, and (for
    /// stateful workloads) the generated PVC. `NotFound` is not an error.
    async fn delete_workload(
        &self,
        name: &str,
        namespace: &str,
        kind: WorkloadKind,
    ) -> Result<(), DriverError>;

    /// Create `/exports/{slug(owner)}` on the NFS server pod and return the
    /// slug, which callers use as the workload's NFS subpath.
    async fn ensure_owner_directory(
        &self,
        namespace: &str,
        owner: &str,
    ) -> Result<String, DriverError>;

    /// ClusterIP of a service in the namespace.
    async fn service_cluster_ip(&self, name: &str, namespace: &str)
        -> Result<String, DriverError>;

    /// Run a command in the sandbox container and collect its output.
    async fn exec_collect(
        &self,
        pod: &str,
        namespace: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, DriverError>;

    /// Open an interactive TTY shell in the sandbox container, bridging the
    /// given channels until either side closes or `cancel` fires.
    async fn exec_shell(
        &self,
        pod: &str,
        namespace: &str,
        command: Vec<String>,
        io: ExecStreams,
        cancel: CancellationToken,
    ) -> Result<(), DriverError>;

    /// Discover services reachable inside the sandbox's nested cluster.
    async fn discover_services(
        &self,
        pod: &str,
        namespace: &str,
    ) -> Result<Vec<ServiceInfo>, DriverError>;

    /// All sandbox-labeled workloads in the namespace, for reconciliation.
    async fn list_sandbox_workloads(
        &self,
        namespace: &str,
    ) -> Result<Vec<SandboxWorkload>, DriverError>;
}
