//! Redis-backed implementation of the work queue.
//!
//! Layout: one hash `playground_reservations` mapping id to a JSON blob,
//! and one list `command_log_buffer` carrying audit events oldest-at-tail.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::warn;

use crate::{AuditEntry, Reservation, ReservationStore, Status, StoreError};

pub const RESERVATIONS_KEY: &str = "playground_reservations";
pub const AUDIT_BUFFER_KEY: &str = "command_log_buffer";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect and ping within a 5 s deadline. A store that is unreachable
    /// at startup is a fatal misconfiguration for every process.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Unavailable(format!("connect timeout to {url}")))?
            .map_err(unavailable)?;
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(Self { conn })
    }
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl ReservationStore for RedisStore {
    async fn put(&self, r: &mut Reservation) -> Result<(), StoreError> {
        r.status_updated_at = Utc::now();
        let payload = serde_json::to_string(r).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(RESERVATIONS_KEY, &r.id, payload)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Reservation, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(RESERVATIONS_KEY, id)
            .await
            .map_err(unavailable)?;
        match raw {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hdel(RESERVATIONS_KEY, id)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Reservation>, StoreError> {
        let mut conn = self.conn.clone();
        let rows: std::collections::HashMap<String, String> = conn
            .hgetall(RESERVATIONS_KEY)
            .await
            .map_err(unavailable)?;
        let mut out = Vec::with_capacity(rows.len());
        for (id, raw) in rows {
            match serde_json::from_str::<Reservation>(&raw) {
                Ok(r) => out.push(r),
                // Skip rows we cannot decode instead of failing the scan.
                Err(e) => warn!(id = %id, error = %e, "skipping undecodable reservation"),
            }
        }
        Ok(out)
    }

    async fn list_by_status(&self, status: Status) -> Result<Vec<Reservation>, StoreError> {
        let mut all = self.list_all().await?;
        all.retain(|r| r.status == status);
        Ok(all)
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Reservation>, StoreError> {
        let mut all = self.list_all().await?;
        all.retain(|r| r.owner == owner);
        Ok(all)
    }

    async fn audit_push(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(entry).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(AUDIT_BUFFER_KEY, payload)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn audit_pop(&self, timeout: Duration) -> Result<Option<AuditEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .brpop(AUDIT_BUFFER_KEY, timeout.as_secs_f64())
            .await
            .map_err(unavailable)?;
        match popped {
            Some((_, raw)) => match serde_json::from_str(&raw) {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    warn!(error = %e, "dropping undecodable audit event");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn audit_requeue(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(entry).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut conn = self.conn.clone();
        // RPUSH so the next BRPOP sees this entry first.
        let _: () = conn
            .rpush(AUDIT_BUFFER_KEY, payload)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
