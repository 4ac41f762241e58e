//! Terminal gateway: bridges one browser WebSocket to one in-pod exec
//! stream with TTY resize signaling, keepalives, chunked writes, and
//! command auditing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    Extension,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use playground_driver::{ExecStreams, TermSize};
use playground_queue::{AuditEntry, Reservation, Status};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{load_owned, resolve_pod_name};
use crate::auth::Principal;
use crate::error::ApiError;
use crate::AppState;

/// Server ping cadence; the read deadline is slightly longer.
const PING_PERIOD: Duration = Duration::from_secs(54);
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Outbound frames are split to bound burst size on slow clients.
const MAX_CHUNK: usize = 4096;
const CHUNK_GAP: Duration = Duration::from_millis(1);

/// Bounded resize queue of depth 2. A push against a full queue discards
/// the oldest pending size, so the newest size is never dropped.
#[derive(Clone, Default)]
pub struct ResizeQueue {
    inner: Arc<ResizeInner>,
}

#[derive(Default)]
struct ResizeInner {
    queue: StdMutex<VecDeque<TermSize>>,
    ready: Notify,
}

impl ResizeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, size: TermSize) {
        {
            let mut queue = self.inner.queue.lock().expect("resize queue poisoned");
            if queue.len() >= 2 {
                queue.pop_front();
            }
            queue.push_back(size);
        }
        self.inner.ready.notify_one();
    }

    pub async fn recv(&self) -> TermSize {
        loop {
            let notified = self.inner.ready.notified();
            if let Some(size) = self
                .inner
                .queue
                .lock()
                .expect("resize queue poisoned")
                .pop_front()
            {
                return size;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    fn pending(&self) -> Vec<TermSize> {
        self.inner
            .queue
            .lock()
            .expect("resize queue poisoned")
            .iter()
            .copied()
            .collect()
    }
}

/// Per-session keystroke parser. Printable ASCII and Tab accumulate,
/// backspace/DEL retracts one byte, CR/LF flushes the line as a command.
/// Frames starting with ESC (arrow keys, etc.) are ignored wholesale.
#[derive(Default)]
pub struct CommandTracker {
    buffer: String,
}

impl CommandTracker {
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(data);
        if text.starts_with('\x1b') {
            return Vec::new();
        }

        let mut flushed = Vec::new();
        for c in text.chars() {
            match c {
                '\r' | '\n' => {
                    let command = self.buffer.trim().to_string();
                    self.buffer.clear();
                    if !command.is_empty() {
                        flushed.push(command);
                    }
                }
                '\u{8}' | '\u{7f}' => {
                    self.buffer.pop();
                }
                c if c.is_ascii_graphic() || c == ' ' || c == '\t' => self.buffer.push(c),
                _ => {}
            }
        }
        flushed
    }
}

/// Parse a `{resize: true, cols, rows}` control frame.
fn parse_resize(data: &[u8]) -> Option<TermSize> {
    let value: serde_json::Value = serde_json::from_slice(data).ok()?;
    if value.get("resize")?.as_bool() != Some(true) {
        return None;
    }
    let cols = value.get("cols")?.as_u64()?;
    let rows = value.get("rows")?.as_u64()?;
    Some(TermSize {
        cols: u16::try_from(cols).ok()?,
        rows: u16::try_from(rows).ok()?,
    })
}

/// Parse the initial `{cols, rows}` handshake; anything unparseable falls
/// back to 80x24.
fn parse_initial_size(data: &[u8]) -> TermSize {
    let fallback = TermSize { cols: 80, rows: 24 };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return fallback;
    };
    let cols = value.get("cols").and_then(|v| v.as_u64()).unwrap_or(0);
    let rows = value.get("rows").and_then(|v| v.as_u64()).unwrap_or(0);
    if cols > 0 && rows > 0 {
        TermSize {
            cols: cols.min(u64::from(u16::MAX)) as u16,
            rows: rows.min(u64::from(u16::MAX)) as u16,
        }
    } else {
        fallback
    }
}

/// Write half of the socket. The mutex makes chunked writes atomic with
/// respect to ping frames.
struct SessionWriter {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

impl SessionWriter {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
        }
    }

    async fn send_binary_chunked(&self, data: &[u8]) -> Result<(), axum::Error> {
        let mut sink = self.sink.lock().await;
        let mut chunks = data.chunks(MAX_CHUNK).peekable();
        while let Some(chunk) = chunks.next() {
            sink.send(Message::Binary(chunk.to_vec())).await?;
            if chunks.peek().is_some() {
                tokio::time::sleep(CHUNK_GAP).await;
            }
        }
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<(), axum::Error> {
        self.sink.lock().await.send(Message::Text(text)).await
    }

    async fn ping(&self) -> Result<(), axum::Error> {
        self.sink.lock().await.send(Message::Ping(Vec::new())).await
    }

    /// ANSI-red error line wrapped in the control-frame envelope the
    /// front-end terminal understands.
    async fn send_error(&self, message: &str) -> Result<(), axum::Error> {
        let frame = serde_json::json!({
            "operation": "error",
            "data": format!("\x1b[31m{message}\x1b[0m\r\n"),
        });
        self.send_text(frame.to_string()).await
    }
}

/// GET /reservations/{id}/attach: upgrade to a terminal session.
pub async fn attach(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let record = load_owned(&state, &id, &principal).await?;
    if record.status != Status::Available {
        return Err(ApiError::Validation("Environment not available".to_string()));
    }
    if record.pod_id.is_empty() {
        return Err(ApiError::Validation("Pod ID not available".to_string()));
    }
    let pod_name = resolve_pod_name(&state, &record).await?;

    // Reject before the upgrade if the pod has gone away since it was last
    // observed ready.
    match state
        .driver
        .is_pod_ready(&pod_name, &state.config.namespace)
        .await
    {
        Ok(true) => {}
        Ok(false) | Err(_) => {
            return Err(ApiError::Validation("Environment not available".to_string()));
        }
    }

    Ok(ws.on_upgrade(move |socket| run_session(state, record, principal, pod_name, socket)))
}

async fn run_session(
    state: AppState,
    record: Reservation,
    principal: Principal,
    pod_name: String,
    socket: WebSocket,
) {
    let session_id = format!(
        "{}-{}-{}",
        record.owner,
        pod_name,
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
    info!(session_id = %session_id, pod = %pod_name, "terminal session opened");

    let (sink, mut stream) = socket.split();
    let writer = Arc::new(SessionWriter::new(sink));

    // The first frame sizes the TTY before the shell is spawned.
    let initial_size = match stream.next().await {
        Some(Ok(Message::Text(text))) => parse_initial_size(text.as_bytes()),
        Some(Ok(Message::Binary(data))) => parse_initial_size(&data),
        _ => return,
    };

    let resize_queue = ResizeQueue::new();
    resize_queue.push(initial_size);

    let display_name = if record.display_name.is_empty() {
        record.short_id().to_string()
    } else {
        record.display_name.clone()
    };
    let _ = writer
        .send_text(format!(
            "\x1b[32mWelcome! Connecting to your Kubernetes environment '{display_name}' (Pod: {pod_name})...\x1b[0m\r\n"
        ))
        .await;

    let cancel = CancellationToken::new();
    let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    let (stdout_tx, mut stdout_rx) = mpsc::channel::<Vec<u8>>(64);
    let (resize_tx, resize_rx) = mpsc::channel::<TermSize>(2);

    // Coalesced sizes flow from the queue into the exec stream.
    {
        let queue = resize_queue.clone();
        let forward_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = forward_cancel.cancelled() => break,
                    size = queue.recv() => {
                        if resize_tx.send(size).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // The exec stream itself.
    {
        let driver = state.driver.clone();
        let namespace = state.config.namespace.clone();
        let pod = pod_name.clone();
        let exec_writer = writer.clone();
        let exec_cancel = cancel.clone();
        let session = session_id.clone();
        tokio::spawn(async move {
            let io = ExecStreams {
                stdin: stdin_rx,
                stdout: stdout_tx,
                resize: resize_rx,
            };
            if let Err(e) = driver
                .exec_shell(
                    &pod,
                    &namespace,
                    vec!["/bin/bash".to_string()],
                    io,
                    exec_cancel.clone(),
                )
                .await
            {
                warn!(session_id = %session, error = %e, "exec stream failed");
                let _ = exec_writer
                    .send_error(&format!("Terminal session error: {e}"))
                    .await;
            }
            exec_cancel.cancel();
        });
    }

    // Pod output -> browser, chunked.
    {
        let pump_writer = writer.clone();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            while let Some(chunk) = stdout_rx.recv().await {
                if pump_writer.send_binary_chunked(&chunk).await.is_err() {
                    break;
                }
            }
            pump_cancel.cancel();
        });
    }

    // Keepalive: ping every PING_PERIOD, close when the client has been
    // silent past PONG_WAIT.
    let last_activity = Arc::new(StdMutex::new(Instant::now()));
    {
        let ping_writer = writer.clone();
        let ping_cancel = cancel.clone();
        let activity = last_activity.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_PERIOD);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = ping_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let idle = activity.lock().expect("activity lock poisoned").elapsed();
                        if idle > PONG_WAIT {
                            ping_cancel.cancel();
                            break;
                        }
                        if ping_writer.ping().await.is_err() {
                            ping_cancel.cancel();
                            break;
                        }
                    }
                }
            }
        });
    }

    // Browser input loop.
    let mut tracker = CommandTracker::default();
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => message,
        };
        let data = match message {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Pong(_) | Message::Ping(_))) => {
                *last_activity.lock().expect("activity lock poisoned") = Instant::now();
                continue;
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
        };
        *last_activity.lock().expect("activity lock poisoned") = Instant::now();

        if let Some(size) = parse_resize(&data) {
            resize_queue.push(size);
            continue;
        }

        for command in tracker.feed(&data) {
            let entry = AuditEntry::new(
                record.id.clone(),
                principal.id.clone(),
                principal.name.clone(),
                pod_name.clone(),
                session_id.clone(),
                command,
            );
            let store = state.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.audit_push(&entry).await {
                    warn!(id = %entry.id, error = %e, "failed to buffer command audit entry");
                }
            });
        }

        if stdin_tx.send(data).await.is_err() {
            break;
        }
    }

    cancel.cancel();
    info!(session_id = %session_id, "terminal session closed");
}
