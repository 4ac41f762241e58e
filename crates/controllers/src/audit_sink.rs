//! Command-audit sink: drains the work queue's audit side buffer into
//! daily append-only NDJSON files, compresses old files, enforces the
//! 30-day retention window, and serves a token-gated read API.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, NaiveDate};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use playground_queue::{AuditEntry, ReservationStore};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Compressed files older than this many days are deleted.
pub const RETENTION_DAYS: i64 = 30;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The on-disk audit log tree: `{dir}/commands-YYYY-MM-DD.log[.gz]`, one
/// JSON object per line. Single-writer by construction; only the sink
/// appends.
pub struct AuditLog {
    dir: PathBuf,
    current: Mutex<Option<CurrentFile>>,
}

struct CurrentFile {
    date: NaiveDate,
    writer: BufWriter<File>,
}

fn file_name(date: NaiveDate) -> String {
    format!("commands-{}.log", date.format("%Y-%m-%d"))
}

/// Date encoded in a log file name, compressed or not.
fn file_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix("commands-")?;
    let date = rest
        .strip_suffix(".log")
        .or_else(|| rest.strip_suffix(".log.gz"))?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

impl AuditLog {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    /// Append one entry to the current day's file, rotating at the local
    /// day boundary.
    pub fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        self.append_at(entry, Local::now().date_naive())
    }

    fn append_at(&self, entry: &AuditEntry, today: NaiveDate) -> std::io::Result<()> {
        let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        let mut guard = self.current.lock().expect("audit writer lock poisoned");

        if guard.as_ref().map(|c| c.date) != Some(today) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(file_name(today)))?;
            *guard = Some(CurrentFile {
                date: today,
                writer: BufWriter::new(file),
            });
        }

        let current = guard.as_mut().expect("writer installed above");
        writeln!(current.writer, "{line}")?;
        current.writer.flush()
    }

    /// Gzip every plaintext file from a previous day and remove the source,
    /// then delete compressed files past the retention window.
    pub fn maintain(&self) {
        let today = Local::now().date_naive();
        // Drop the writer for any non-current file so compression sees the
        // flushed bytes.
        {
            let mut guard = self.current.lock().expect("audit writer lock poisoned");
            if guard.as_ref().map(|c| c.date) != Some(today) {
                *guard = None;
            }
        }
        self.compress_older_than(today);
        self.delete_expired(today);
    }

    fn compress_older_than(&self, today: NaiveDate) {
        for path in self.files_with_suffix(".log") {
            match file_date(&path) {
                Some(date) if date < today => {
                    if let Err(e) = compress_file(&path) {
                        warn!(file = %path.display(), error = %e, "failed to compress audit file");
                    } else {
                        info!(file = %path.display(), "compressed audit file");
                    }
                }
                _ => {}
            }
        }
    }

    fn delete_expired(&self, today: NaiveDate) {
        let cutoff = today - chrono::Duration::days(RETENTION_DAYS);
        for path in self.files_with_suffix(".log.gz") {
            match file_date(&path) {
                Some(date) if date < cutoff => {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(file = %path.display(), error = %e, "failed to delete expired audit file");
                    } else {
                        info!(file = %path.display(), "deleted expired audit file");
                    }
                }
                _ => {}
            }
        }
    }

    fn files_with_suffix(&self, suffix: &str) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("commands-") && n.ends_with(suffix))
            })
            .collect()
    }

    /// Read matching entries newest-first, including compressed files.
    pub fn list(
        &self,
        user_id: Option<&str>,
        reservation_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> std::io::Result<Vec<AuditEntry>> {
        let mut files: Vec<PathBuf> = self
            .files_with_suffix(".log")
            .into_iter()
            .chain(self.files_with_suffix(".log.gz"))
            .collect();
        // Newest file first; date-stamped names sort lexicographically.
        files.sort();
        files.reverse();

        let mut entries: Vec<AuditEntry> = Vec::new();
        for path in files {
            match read_entries(&path) {
                Ok(file_entries) => entries.extend(file_entries),
                Err(e) => warn!(file = %path.display(), error = %e, "failed to read audit file"),
            }
        }

        entries.retain(|e| {
            user_id.is_none_or(|u| e.user_id == u)
                && reservation_id.is_none_or(|r| e.reservation_id == r)
        });
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }
}

fn compress_file(path: &Path) -> std::io::Result<()> {
    let compressed_path = PathBuf::from(format!("{}.gz", path.display()));
    let input = File::open(path)?;
    let output = File::create(&compressed_path)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut BufReader::new(input), &mut encoder)?;
    encoder.finish()?;
    fs::remove_file(path)
}

fn read_entries(path: &Path) -> std::io::Result<Vec<AuditEntry>> {
    let file = File::open(path)?;
    let reader: Box<dyn BufRead> = if path.extension().is_some_and(|e| e == "gz") {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable audit line"),
        }
    }
    Ok(entries)
}

/// Drain daemon plus maintenance ticker and admin read API.
pub struct AuditSink {
    store: Arc<dyn ReservationStore>,
    log: Arc<AuditLog>,
    admin_token: String,
}

impl AuditSink {
    /// `admin_token` comes from the environment when set; otherwise one is
    /// generated for the lifetime of the process.
    pub fn new(
        store: Arc<dyn ReservationStore>,
        log: Arc<AuditLog>,
        admin_token: Option<String>,
    ) -> Self {
        let admin_token = match admin_token.filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => {
                let token = generate_admin_token();
                info!(token = %token, "generated admin token for audit log access");
                token
            }
        };
        Self {
            store,
            log,
            admin_token,
        }
    }

    pub fn verify_token(&self, token: &str) -> bool {
        token == self.admin_token
    }

    pub fn log(&self) -> &AuditLog {
        &self.log
    }

    /// Drain the side buffer until cancelled, with hourly maintenance in a
    /// separate task so it never interrupts an in-flight pop.
    pub async fn run(&self, cancel: CancellationToken) {
        let maintenance_log = self.log.clone();
        let maintenance_cancel = cancel.clone();
        let maintenance = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    () = maintenance_cancel.cancelled() => return,
                    _ = ticker.tick() => maintenance_log.maintain(),
                }
            }
        });

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("audit sink shutting down");
                    break;
                }
                result = self.store.audit_pop(DRAIN_TIMEOUT) => match result {
                    Ok(Some(entry)) => self.persist(entry).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "audit buffer read failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
        let _ = maintenance.await;
    }

    async fn persist(&self, entry: AuditEntry) {
        if let Err(e) = self.log.append(&entry) {
            warn!(id = %entry.id, error = %e, "audit write failed, requeueing entry");
            if let Err(requeue_err) = self.store.audit_requeue(&entry).await {
                // Lost only if both the file tree and the buffer are down.
                warn!(id = %entry.id, error = %requeue_err, "failed to requeue audit entry");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

fn generate_admin_token() -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("admin-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()));
    let digest = hasher.finalize();
    hex_string(&digest)[..16].to_string()
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// Admin API, mounted by the audit-sink binary.

#[derive(Deserialize)]
pub struct LogsQuery {
    pub user: Option<String>,
    pub reservation: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Deserialize)]
struct AuthRequest {
    token: String,
}

pub fn admin_router(sink: Arc<AuditSink>) -> Router {
    Router::new()
        .route("/admin/logs", get(get_logs))
        .route("/admin/auth", post(check_auth))
        .route("/health", get(|| async { "OK" }))
        .with_state(sink)
}

async fn get_logs(
    State(sink): State<Arc<AuditSink>>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let token = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !sink.verify_token(token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Unauthorized" })),
        );
    }

    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0);
    match sink.log.list(
        query.user.as_deref(),
        query.reservation.as_deref(),
        limit,
        offset,
    ) {
        Ok(logs) => {
            let count = logs.len();
            (
                StatusCode::OK,
                Json(serde_json::json!({ "logs": logs, "count": count })),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("Failed to retrieve logs: {e}") })),
        ),
    }
}

async fn check_auth(
    State(sink): State<Arc<AuditSink>>,
    Json(req): Json<AuthRequest>,
) -> impl IntoResponse {
    if sink.verify_token(&req.token) {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "authenticated": true })),
        )
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Invalid admin token" })),
        )
    }
}
